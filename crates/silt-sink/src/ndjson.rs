//! Changefeed NDJSON decoding.
//!
//! The ingestion surface delivers one JSON record per line: row updates
//! carrying `after`/`before`/`key`/`updated`, and resolved-timestamp
//! markers carrying `resolved`. Numbers decode with arbitrary precision,
//! so large integers survive the trip into staging byte for byte.

use crate::config::SinkConfig;
use crate::pipeline::Batch;
use serde::Deserialize;
use serde_json::Value;
use silt_core::{Hlc, Ident, Mutation, Result, SiltError, Table};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

/// One decoded NDJSON line.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A row-level change bound for the staging or apply pipeline.
    Row(Mutation),
    /// An upstream assertion that nothing at or below this timestamp
    /// remains undelivered.
    Resolved(Hlc),
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(default)]
    after: Option<Value>,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    key: Option<Value>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    resolved: Option<String>,
}

/// Decode a single NDJSON line.
pub fn parse_line(line: &str) -> Result<Envelope> {
    let raw: RawLine = serde_json::from_str(line)
        .map_err(|err| SiltError::bad_request(format!("malformed changefeed record: {err}")))?;

    if let Some(resolved) = raw.resolved {
        return Ok(Envelope::Resolved(Hlc::parse(&resolved)?));
    }

    let updated = raw.updated.ok_or_else(|| {
        SiltError::bad_request("changefeed records must carry the 'updated' timestamp")
    })?;
    let time = Hlc::parse(&updated)?;
    let key = raw
        .key
        .ok_or_else(|| SiltError::bad_request("changefeed record is missing its key"))?;

    let mut mutation = match raw.after {
        Some(after) if !after.is_null() => Mutation::insert(key, after, time),
        _ => Mutation::delete(key, time),
    };
    if let Some(before) = raw.before {
        if !before.is_null() {
            mutation = mutation.with_before(before);
        }
    }
    Ok(Envelope::Row(mutation))
}

/// Totals for one ingested request body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadSummary {
    pub rows: u64,
    pub resolved: u64,
}

/// Read an NDJSON body into the pipeline.
///
/// Mutations accumulate up to the configured batch size and are handed to
/// `batch` as a unit; the read blocks while each flush is in flight, which
/// is the ingestion backpressure. Resolved markers are forwarded to
/// `on_resolved` as they appear.
pub async fn read_ndjson<R>(
    mut reader: R,
    source: &Ident,
    target: &Table,
    batch: &mut dyn Batch,
    mut on_resolved: impl FnMut(Hlc) -> Result<()>,
    config: &SinkConfig,
) -> Result<ReadSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = ReadSummary::default();
    let mut pending: Vec<Mutation> = Vec::with_capacity(config.flush_batch_size);
    let mut line = Vec::with_capacity(1024);

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(SiltError::Io)?;
        if read == 0 {
            break;
        }
        if line.len() > config.ndjson_buffer {
            return Err(SiltError::bad_request(format!(
                "changefeed line exceeds {} bytes",
                config.ndjson_buffer
            )));
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| SiltError::bad_request("changefeed line is not UTF-8"))?
            .trim();
        if text.is_empty() {
            continue;
        }

        match parse_line(text)? {
            Envelope::Row(mutation) => {
                pending.push(mutation);
                summary.rows += 1;
                if pending.len() >= config.flush_batch_size {
                    batch
                        .on_data(source, Some(target), std::mem::take(&mut pending))
                        .await?;
                }
            }
            Envelope::Resolved(resolved) => {
                summary.resolved += 1;
                on_resolved(resolved)?;
            }
        }
    }

    if !pending.is_empty() {
        batch.on_data(source, Some(target), pending).await?;
    }
    trace!(rows = summary.rows, resolved = summary.resolved, "ndjson body consumed");
    Ok(summary)
}
