//! Cache key definitions.
//!
//! Query results are stored under an opaque key derived from the query kind,
//! an identifier and a canonical parameter bag. The bag is a sorted map, so
//! two bags holding the same pairs always serialize to the same bytes no matter
//! in which order the pairs were added.
//!
//! Derived keys look like `qcache:<32 hex chars>`; persistent search rows use
//! the bare digest of the parameter bag as their `search_hash`.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::error::CacheError;

/// Namespace prefix of every derived key.
pub const KEY_NAMESPACE: &str = "qcache:";
/// Key scheme version folded into every digest.
pub const KEY_VERSION: &str = "v1";
/// Number of digest bytes kept (hex-encoded, so keys carry twice as many chars).
const DIGEST_BYTES: usize = 16;

// ============================================================================
// Parameters
// ============================================================================

/// A canonical scalar (or list of scalars) in a parameter bag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
    /// Free-form JSON (metadata filters). Objects serialize with sorted keys.
    Json(Value),
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Ordered `(name, value)` pairs describing one logical query.
///
/// Names are unique; inserting a name twice keeps the last value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryParams(BTreeMap<String, ParamValue>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Adds the pair only when a value is present.
    pub fn with_opt<V: Into<ParamValue>>(mut self, name: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.insert(name, value);
        }
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// JSON form persisted alongside search rows.
    pub fn to_json(&self) -> Result<Value, CacheError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl<K: AsRef<str>, V: Into<ParamValue>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name.as_ref(), value);
        }
        params
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Opaque key of a volatile cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct CanonicalKey<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    identifier: &'a str,
    params: &'a QueryParams,
    version: &'static str,
}

/// Derive the cache key for `(kind, identifier, params)`.
///
/// Falls back to `kind:identifier` if the canonical record cannot be encoded.
/// The fallback ignores `params`, so differently-parameterized queries of the
/// same kind and identifier would share an entry.
pub fn derive_key(kind: &str, identifier: &str, params: &QueryParams) -> CacheKey {
    let canonical = CanonicalKey {
        kind,
        identifier,
        params,
        version: KEY_VERSION,
    };

    match serde_json::to_vec(&canonical) {
        Ok(bytes) => CacheKey(format!("{KEY_NAMESPACE}{}", digest_hex(&bytes))),
        Err(err) => {
            warn!(
                kind,
                identifier,
                error = %err,
                "Failed to encode cache key, using parameterless fallback"
            );
            CacheKey(format!("{kind}:{identifier}"))
        }
    }
}

/// Digest of a parameter bag, used as the persistent `search_hash`.
pub fn search_hash(params: &QueryParams) -> Result<String, CacheError> {
    let bytes = serde_json::to_vec(params)?;
    Ok(digest_hex(&bytes))
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize().to_vec();
    hex::encode(&digest[..DIGEST_BYTES])
}

// ============================================================================
// Patterns
// ============================================================================

/// Invalidation pattern with three forms: `*` matches everything, a trailing
/// `*` matches the literal prefix before it, anything else matches exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    All,
    Prefix(String),
    Exact(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            KeyPattern::All
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            KeyPattern::Prefix(prefix.to_string())
        } else {
            KeyPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::All => true,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Exact(exact) => key == exact,
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::All => f.write_str("*"),
            KeyPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            KeyPattern::Exact(exact) => f.write_str(exact),
        }
    }
}

// ============================================================================
// Dependencies
// ============================================================================

/// Something a cached read depends on. When it changes, every entry
/// registered against it is dropped from the volatile tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependency {
    /// A chunk that appears in the arguments or the result.
    Chunk(String),
    /// A tag used as a lookup argument.
    Tag(String),
    /// The child list of a chunk.
    Parent(String),
    /// Any hierarchy traversal.
    Hierarchy,
    /// Any search.
    Search,
}
