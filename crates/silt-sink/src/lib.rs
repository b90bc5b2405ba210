//! # silt-sink
//!
//! The event pipeline of the silt changefeed sink. Incoming row-level
//! changes are either applied immediately inside an ingress-scoped target
//! transaction, or staged durably and applied when the upstream reports a
//! resolved timestamp:
//!
//! ```text
//! ingress ──► script dispatch ──► per-target map/filter ──┬─► apply (immediate)
//!                                                         └─► stage (deferred)
//!                                                                  │
//!                resolved markers ──► resolver loop ──► drain ──► apply ──► memo
//! ```
//!
//! Module map:
//!
//! - [`config`] - runtime options
//! - [`target`] - target database connection/transaction seam
//! - [`schema`] - target schema snapshots with non-blocking readers
//! - [`applycfg`] - per-table apply tuning (CAS, deadlines, exprs, ...)
//! - [`stage`] - durable staged-mutation store
//! - [`memo`] - durable consistent-point store
//! - [`apply`] - mutation to SQL translation
//! - [`merge`] - three-way conflict resolution
//! - [`dlq`] - dead-letter queues
//! - [`script`] - user-script capability surface
//! - [`pipeline`] - immediate/deferred event pipelines and script routing
//! - [`resolver`] - resolved-timestamp advancement loop
//! - [`ndjson`] - changefeed NDJSON decoding
//! - [`health`] - per-loop status reporting and access checks

pub mod apply;
pub mod applycfg;
pub mod config;
pub mod dlq;
pub mod health;
pub mod memo;
pub mod merge;
pub mod ndjson;
pub mod pipeline;
pub mod resolver;
pub mod retry;
pub mod schema;
pub mod script;
pub mod stage;
pub mod target;
pub mod testing;

pub use silt_core::{ErrorCategory, Hlc, Ident, IdentMap, Mutation, Result, Schema, SiltError, Table, TableMap};
