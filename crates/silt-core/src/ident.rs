//! Case-preserving SQL identifiers and ordered identifier maps.
//!
//! Identifiers compare case-insensitively (the SQL default for unquoted
//! names) but retain their original casing for SQL emission. Maps keyed by
//! identifiers preserve insertion order so that iteration, and therefore
//! generated SQL, is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A case-preserving SQL identifier.
///
/// Two idents are equal when their case-folded forms are equal:
///
/// ```
/// use silt_core::Ident;
///
/// assert_eq!(Ident::new("PayLoad"), Ident::new("payload"));
/// assert_eq!(Ident::new("PayLoad").raw(), "PayLoad");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Ident {
    raw: String,
    folded: String,
}

impl Ident {
    /// Create an identifier, preserving the original casing.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let folded = raw.to_lowercase();
        Self { raw, folded }
    }

    /// The identifier as originally written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The case-folded form used for comparisons.
    pub fn folded(&self) -> &str {
        &self.folded
    }

    /// The identifier double-quoted for SQL emission. Embedded quotes are
    /// doubled per the SQL standard.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.raw.replace('"', "\"\""))
    }

    /// True for the zero-length identifier, used as an "unset" value.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl PartialEq for Ident {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for Ident {}

impl Hash for Ident {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl PartialOrd for Ident {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ident {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.folded
            .cmp(&other.folded)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<String> for Ident {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for Ident {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<Ident> for String {
    fn from(id: Ident) -> Self {
        id.raw
    }
}

/// The name of a target database schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Schema(Ident);

impl Schema {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Ident::new(raw))
    }

    pub fn ident(&self) -> &Ident {
        &self.0
    }

    pub fn raw(&self) -> &str {
        self.0.raw()
    }

    /// The schema double-quoted for SQL emission.
    pub fn quoted(&self) -> String {
        self.0.quoted()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A fully-qualified table name: schema plus table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Table {
    schema: Schema,
    name: Ident,
}

impl Table {
    pub fn new(schema: Schema, name: impl Into<Ident>) -> Self {
        Self {
            schema,
            name: name.into(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn name(&self) -> &Ident {
        &self.name
    }

    /// `"schema"."table"` for SQL emission.
    pub fn quoted(&self) -> String {
        format!("{}.{}", self.schema.quoted(), self.name.quoted())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Keys usable in an [`OrderedMap`]: anything with a canonical case-folded
/// form.
pub trait FoldKey {
    fn fold_key(&self) -> String;
}

impl FoldKey for Ident {
    fn fold_key(&self) -> String {
        self.folded.clone()
    }
}

impl FoldKey for Schema {
    fn fold_key(&self) -> String {
        self.0.folded.clone()
    }
}

impl FoldKey for Table {
    fn fold_key(&self) -> String {
        format!("{}\u{0}{}", self.schema.0.folded, self.name.folded)
    }
}

/// An insertion-ordered map with case-insensitive identifier keys.
///
/// Lookups go through a folded-key index; iteration walks the entries in
/// insertion order with their original casing, keeping generated SQL and
/// dispatch fan-out deterministic.
#[derive(Debug, Clone)]
pub struct OrderedMap<K, V> {
    entries: Vec<(K, V)>,
    index: HashMap<String, usize>,
}

/// Ordered map keyed by column/source [`Ident`]s.
pub type IdentMap<V> = OrderedMap<Ident, V>;

/// Ordered map keyed by fully-qualified [`Table`]s.
pub type TableMap<V> = OrderedMap<Table, V>;

impl<K: FoldKey, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert a value. An existing entry keeps its position and original
    /// key casing; the replaced value is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.index.get(&key.fold_key()) {
            Some(&pos) => Some(std::mem::replace(&mut self.entries[pos].1, value)),
            None => {
                self.index.insert(key.fold_key(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.index
            .get(&key.fold_key())
            .map(|&pos| &self.entries[pos].1)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.index.get(&key.fold_key()) {
            Some(&pos) => Some(&mut self.entries[pos].1),
            None => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(&key.fold_key())
    }

    /// Remove an entry, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let pos = self.index.remove(&key.fold_key())?;
        let (_, value) = self.entries.remove(pos);
        for idx in self.index.values_mut() {
            if *idx > pos {
                *idx -= 1;
            }
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.iter_mut().map(|(_, v)| v)
    }
}

impl<K: FoldKey, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: FoldKey, V> FromIterator<(K, V)> for OrderedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K: FoldKey, V> IntoIterator for OrderedMap<K, V> {
    type Item = (K, V);
    type IntoIter = std::vec::IntoIter<(K, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Content equality: same keys mapped to equal values, insertion order
/// ignored.
impl<K: FoldKey, V: PartialEq> PartialEq for OrderedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(k, v)| {
            other
                .index
                .get(&k.fold_key())
                .is_some_and(|&pos| other.entries[pos].1 == *v)
        })
    }
}

impl<K: FoldKey, V: Eq> Eq for OrderedMap<K, V> {}
