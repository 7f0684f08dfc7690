//! Deterministic cache key derivation
//!
//! A key identifies `(version, chunk id, relationship set, optional content)`. The
//! relationship set is canonicalized before hashing so that list order never
//! matters while any change of content does:
//!
//! 1. weights are rounded to 4 decimal places (ties to even) and descriptions are
//!    reduced to an 8 hex character SHA-256 digest; relationship types are kept
//!    verbatim, so `"causes"` and `"Causes"` are different relationships;
//! 2. relationships are sorted by source, target, weight, description digest and
//!    finally type, which is a total order even for duplicate endpoints;
//! 3. the canonical form is compact JSON with lexicographically ordered fields;
//! 4. the first 16 hex characters of its SHA-256 form the base hash.
//!
//! ```rust
//! use postproc_cache::cache::{generate_key, RelationshipInput};
//!
//! let rels = vec![RelationshipInput::new("A", "B", "causes", 0.5, "x")];
//! let key = generate_key("c1", &rels, "1.0", None).unwrap();
//! assert!(key.starts_with("pp_v1.0_c1_"));
//! ```

use crate::cache::types::{CacheKey, RelationshipInput};
use crate::error::{CacheError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Hex characters kept from the canonical-form digest
pub const BASE_HASH_LEN: usize = 16;

/// Hex characters kept from description and content digests
pub const SHORT_HASH_LEN: usize = 8;

/// Derives cache keys for a fixed version
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    version: String,
    include_content_hash: bool,
}

impl KeyGenerator {
    /// Create a generator for the given version tag
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            include_content_hash: false,
        }
    }

    /// Append a digest of the chunk content to keys when content is supplied
    pub fn with_content_hash(mut self, enabled: bool) -> Self {
        self.include_content_hash = enabled;
        self
    }

    /// The version tag baked into every key
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Derive the key for a chunk and its relationships
    pub fn generate(
        &self,
        chunk_id: &str,
        relationships: &[RelationshipInput],
        content: Option<&str>,
    ) -> Result<CacheKey> {
        let content = if self.include_content_hash { content } else { None };
        generate_key(chunk_id, relationships, &self.version, content)
    }
}

/// Canonical relationship; fields are declared in lexicographic order so the
/// JSON encoding is unique.
#[derive(Debug, Clone, Serialize)]
struct CanonicalRelationship<'a> {
    description_hash: String,
    relationship_type: &'a str,
    source_id: &'a str,
    target_id: &'a str,
    weight: f64,
}

impl CanonicalRelationship<'_> {
    fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.source_id
            .cmp(other.source_id)
            .then_with(|| self.target_id.cmp(other.target_id))
            .then_with(|| self.weight.total_cmp(&other.weight))
            .then_with(|| self.description_hash.cmp(&other.description_hash))
            .then_with(|| self.relationship_type.cmp(other.relationship_type))
    }
}

#[derive(Debug, Serialize)]
struct CanonicalForm<'a> {
    chunk_id: &'a str,
    relationship_count: usize,
    relationships: Vec<CanonicalRelationship<'a>>,
    version: &'a str,
}

/// Derive a deterministic key for `(version, chunk_id, relationships, content)`
///
/// Fails with [`CacheError::InvalidInput`] only when a relationship cannot be
/// canonicalized (non-finite weight). An empty relationship list is valid.
pub fn generate_key(
    chunk_id: &str,
    relationships: &[RelationshipInput],
    version: &str,
    content: Option<&str>,
) -> Result<CacheKey> {
    let mut normalized = relationships
        .iter()
        .enumerate()
        .map(|(idx, rel)| normalize(idx, rel))
        .collect::<Result<Vec<_>>>()?;
    normalized.sort_by(|a, b| a.canonical_cmp(b));

    let form = CanonicalForm {
        chunk_id,
        relationship_count: normalized.len(),
        relationships: normalized,
        version,
    };
    let canonical = serde_json::to_string(&form)
        .map_err(|e| CacheError::InvalidInput(format!("unserializable relationship set: {}", e)))?;

    let base_hash = short_digest(canonical.as_bytes(), BASE_HASH_LEN);
    let mut key = format!("pp_v{}_{}_{}", version, chunk_id, base_hash);

    if let Some(content) = content {
        key.push('_');
        key.push_str(&short_digest(content.as_bytes(), SHORT_HASH_LEN));
    }

    Ok(key)
}

fn normalize(idx: usize, rel: &RelationshipInput) -> Result<CanonicalRelationship<'_>> {
    if !rel.weight.is_finite() {
        return Err(CacheError::InvalidInput(format!(
            "relationship {} ({} -> {}) has non-finite weight {}",
            idx, rel.source_id, rel.target_id, rel.weight
        )));
    }

    Ok(CanonicalRelationship {
        description_hash: short_digest(rel.description.as_bytes(), SHORT_HASH_LEN),
        relationship_type: &rel.relationship_type,
        source_id: &rel.source_id,
        target_id: &rel.target_id,
        weight: round_weight(rel.weight),
    })
}

/// Round to 4 decimal places, ties to even, on the exact decimal value
///
/// Float formatting rounds the exact binary value half-to-even, so going through
/// the formatter avoids the double rounding of `(w * 1e4).round() / 1e4`.
pub fn round_weight(weight: f64) -> f64 {
    let rounded = format!("{:.4}", weight).parse::<f64>().unwrap_or(weight);
    if rounded == 0.0 {
        // -0.0 and 0.0 must encode identically
        0.0
    } else {
        rounded
    }
}

/// First `len` hex characters of the SHA-256 of `bytes`
pub fn short_digest(bytes: &[u8], len: usize) -> String {
    let mut hex = hex::encode(Sha256::digest(bytes));
    hex.truncate(len);
    hex
}
