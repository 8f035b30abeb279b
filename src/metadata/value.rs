//! Loosely-typed metadata values and search filters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A metadata value: string, number, bool or a list of those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<MetadataValue>),
}

impl MetadataValue {
    /// Canonical index terms for this value.
    ///
    /// Scalars yield one term; lists yield one term per element.
    pub fn canonical_terms(&self) -> Vec<String> {
        match self {
            MetadataValue::List(items) => items.iter().flat_map(|v| v.canonical_terms()).collect(),
            scalar => vec![scalar.canonical_scalar()],
        }
    }

    fn canonical_scalar(&self) -> String {
        match self {
            MetadataValue::Bool(b) => b.to_string(),
            MetadataValue::Integer(i) => i.to_string(),
            MetadataValue::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            MetadataValue::String(s) => s.trim().to_lowercase(),
            MetadataValue::List(_) => self.canonical_terms().join(","),
        }
    }

    /// Single canonical term, or `None` for a list.
    pub fn canonical(&self) -> Option<String> {
        match self {
            MetadataValue::List(_) => None,
            scalar => Some(scalar.canonical_scalar()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Integer(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::String(s) => write!(f, "{}", s),
            MetadataValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        MetadataValue::Integer(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl<T: Into<MetadataValue>> From<Vec<T>> for MetadataValue {
    fn from(values: Vec<T>) -> Self {
        MetadataValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Metadata describing a Datasource. Keys are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<MetadataValue>) -> Option<MetadataValue> {
        self.0.insert(normalize_key(key), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(&normalize_key(key))
    }

    /// Canonical scalar value for `key`.
    pub fn canonical(&self, key: &str) -> Option<String> {
        self.get(key).and_then(MetadataValue::canonical)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        self.0.remove(&normalize_key(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into this map, overwriting existing keys.
    pub fn extend(&mut self, other: &Metadata) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl<K: AsRef<str>, V: Into<MetadataValue>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key.as_ref(), value);
        }
        metadata
    }
}

pub(crate) fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Filter criterion for one metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(MetadataValue),
    AnyOf(Vec<MetadataValue>),
}

impl FilterValue {
    /// Canonical terms accepted by this criterion.
    pub fn terms(&self) -> Vec<String> {
        match self {
            FilterValue::One(value) => value.canonical_terms(),
            FilterValue::AnyOf(values) => values.iter().flat_map(|v| v.canonical_terms()).collect(),
        }
    }
}

/// Search filters: AND across keys, OR across the values listed for a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, FilterValue>);

impl Filters {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Require `key` to equal `value`.
    pub fn with(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.0
            .insert(normalize_key(key), FilterValue::One(value.into()));
        self
    }

    /// Require `key` to equal any of `values`.
    pub fn with_any<V: Into<MetadataValue>>(mut self, key: &str, values: Vec<V>) -> Self {
        self.0.insert(
            normalize_key(key),
            FilterValue::AnyOf(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Parse `key=value` or `key=a,b` terms (command-line form).
    pub fn parse_terms<S: AsRef<str>>(terms: &[S]) -> crate::Result<Self> {
        let mut filters = Filters::new();
        for term in terms {
            let term = term.as_ref();
            let Some((key, value)) = term.split_once('=') else {
                return Err(crate::Error::InvalidMetadata(format!(
                    "filter '{}' is invalid, expected key=value",
                    term
                )));
            };
            if key.trim().is_empty() {
                return Err(crate::Error::InvalidMetadata(format!(
                    "filter '{}' has an empty key",
                    term
                )));
            }
            let values: Vec<&str> = value.split(',').map(str::trim).collect();
            filters = if values.len() == 1 {
                filters.with(key, values[0])
            } else {
                filters.with_any(key, values)
            };
        }
        Ok(filters)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether `metadata` satisfies every criterion.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0.iter().all(|(key, criterion)| {
            let Some(value) = metadata.get(key) else {
                return false;
            };
            let stored = value.canonical_terms();
            criterion.terms().iter().any(|term| stored.contains(term))
        })
    }

    /// Single-valued filters as canonical `(key, value)` pairs.
    ///
    /// Returns `None` when any key carries a list of alternatives.
    pub fn exact_pairs(&self) -> Option<BTreeMap<String, String>> {
        self.0
            .iter()
            .map(|(key, criterion)| match criterion {
                FilterValue::One(value) => value.canonical().map(|v| (key.clone(), v)),
                FilterValue::AnyOf(_) => None,
            })
            .collect()
    }
}
