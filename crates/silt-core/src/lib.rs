//! # silt-core
//!
//! Leaf types shared across the silt changefeed sink:
//!
//! - [`Ident`], [`Schema`], [`Table`] - case-preserving SQL identifiers
//! - [`IdentMap`], [`TableMap`] - insertion-ordered, case-insensitive maps
//! - [`Hlc`] - hybrid logical clock timestamps
//! - [`Mutation`] - a single row-level change
//! - [`SiltError`] - error taxonomy with retry classification

mod error;
mod hlc;
mod ident;
mod mutation;

pub use error::{ErrorCategory, Result, SiltError};
pub use hlc::Hlc;
pub use ident::{Ident, IdentMap, Schema, Table, TableMap};
pub use mutation::Mutation;
