//! Per-table apply tuning.
//!
//! An [`ApplyConfig`] controls how mutations for one target table turn into
//! SQL: compare-and-set columns, deadline columns, replacement expressions,
//! an overflow column for unmapped properties, ignored columns, and
//! source-to-target column renames.

use silt_core::{Ident, IdentMap, Result, SiltError};
use std::time::Duration;

/// Apply tuning for one target table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyConfig {
    /// Compare-and-set columns, in predicate order. A proposed row is
    /// applied only when its CAS tuple is strictly greater than the
    /// stored tuple.
    pub cas: Vec<Ident>,
    /// Column to maximum age; older rows are dropped silently.
    pub deadlines: IdentMap<Duration>,
    /// Column to SQL expression template; `$0` is replaced with the bound
    /// incoming value.
    pub exprs: IdentMap<String>,
    /// JSONB column capturing unmapped properties.
    pub extras: Option<Ident>,
    /// Columns suppressed from apply. False values are dropped at
    /// construction, so presence implies suppression.
    pub ignore: IdentMap<bool>,
    /// Target column to source property renames.
    pub source_names: IdentMap<Ident>,
}

impl ApplyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no tuning is configured at all.
    pub fn is_zero(&self) -> bool {
        self.cas.is_empty()
            && self.deadlines.is_empty()
            && self.exprs.is_empty()
            && self.extras.is_none()
            && self.ignore.is_empty()
            && self.source_names.is_empty()
    }

    /// Record an ignored column. False values are discarded.
    pub fn set_ignore(&mut self, column: Ident, ignored: bool) {
        if ignored {
            self.ignore.insert(column, true);
        }
    }

    /// Overlay `other` onto `self`; values in `other` win.
    pub fn merge_from(&mut self, other: &ApplyConfig) {
        if !other.cas.is_empty() {
            self.cas = other.cas.clone();
        }
        for (col, dur) in other.deadlines.iter() {
            self.deadlines.insert(col.clone(), *dur);
        }
        for (col, expr) in other.exprs.iter() {
            self.exprs.insert(col.clone(), expr.clone());
        }
        if other.extras.is_some() {
            self.extras = other.extras.clone();
        }
        for (col, _) in other.ignore.iter() {
            self.ignore.insert(col.clone(), true);
        }
        for (col, src) in other.source_names.iter() {
            self.source_names.insert(col.clone(), src.clone());
        }
    }
}

/// Parse a Go-style duration string, the format user scripts carry:
/// `"300ms"`, `"1.5h"`, `"2h45m"`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SiltError::config("empty duration"));
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    let mut matched = false;

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| SiltError::config(format!("missing unit in duration {s:?}")))?;
        if num_end == 0 {
            return Err(SiltError::config(format!("invalid duration {s:?}")));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| SiltError::config(format!("invalid duration {s:?}")))?;
        rest = &rest[num_end..];

        let (unit, len) = if rest.starts_with("ns") {
            (1e-9, 2)
        } else if rest.starts_with("us") || rest.starts_with("µs") {
            (1e-6, if rest.starts_with("µs") { 3 } else { 2 })
        } else if rest.starts_with("ms") {
            (1e-3, 2)
        } else if rest.starts_with('s') {
            (1.0, 1)
        } else if rest.starts_with('m') {
            (60.0, 1)
        } else if rest.starts_with('h') {
            (3600.0, 1)
        } else {
            return Err(SiltError::config(format!("unknown unit in duration {s:?}")));
        };
        rest = &rest[len..];

        total += Duration::from_secs_f64(value * unit);
        matched = true;
    }

    if !matched {
        return Err(SiltError::config(format!("invalid duration {s:?}")));
    }
    Ok(total)
}
