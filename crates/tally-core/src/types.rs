//! Domain types for the TallyGrid accounting engine.
//!
//! An accounting *type* owns a set of dictionary-encoded key (dimension)
//! fields, a set of numeric value (metric) fields, and a bucket ladder
//! describing how coarse aggregate buckets become as data ages. Types are
//! registered once and treated as immutable; the serialized definition is
//! persisted in the catalog table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when validating a `TypeDefinition`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("type name '{0}' is not a valid identifier")]
    InvalidTypeName(String),

    #[error("field name '{0}' is not a valid identifier")]
    InvalidFieldName(String),

    #[error("field '{0}' appears in both key and value sets")]
    FieldCollision(String),

    #[error("duplicate field name '{0}'")]
    DuplicateField(String),

    #[error("bucket ladder must not be empty")]
    EmptyLadder,

    #[error("bucket ladder rung {0} has zero bucket length")]
    ZeroLengthRung(usize),

    #[error("bucket ladder max ages must be strictly ascending")]
    LadderNotAscending,
}

/// SQL-facing type of a registered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Float,
    Text,
}

/// A named field within an accounting type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub sql_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, sql_type: FieldType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// One rung of a bucket ladder: records younger than `max_age_secs` are
/// aggregated into buckets of `bucket_len_secs`.
///
/// The final rung is the overflow rung; its `max_age_secs` is ignored during
/// selection (by convention it is written as `0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRung {
    pub max_age_secs: u64,
    pub bucket_len_secs: u64,
}

impl BucketRung {
    pub fn new(max_age_secs: u64, bucket_len_secs: u64) -> Self {
        Self {
            max_age_secs,
            bucket_len_secs,
        }
    }
}

/// Definition of an accounting type: its dimension fields, metric fields,
/// bucket ladder, and optional retention horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    /// Dimension fields, dictionary-encoded to integer ids.
    pub key_fields: Vec<FieldSpec>,
    /// Metric fields, summed into bucket accumulators.
    pub value_fields: Vec<FieldSpec>,
    /// Ordered (max age, bucket length) rungs, ascending by max age.
    pub bucket_ladder: Vec<BucketRung>,
    /// Retention horizon in seconds; rows older than this are dropped
    /// before compaction. `None` keeps data forever.
    #[serde(default)]
    pub data_timespan_secs: Option<u64>,
}

impl TypeDefinition {
    /// Validate structural rules: identifier-safe names, disjoint key/value
    /// field sets, and a well-formed bucket ladder.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !is_safe_identifier(&self.name) {
            return Err(DefinitionError::InvalidTypeName(self.name.clone()));
        }

        let mut seen = std::collections::HashSet::new();
        for field in &self.key_fields {
            if !is_safe_identifier(&field.name) {
                return Err(DefinitionError::InvalidFieldName(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(DefinitionError::DuplicateField(field.name.clone()));
            }
        }
        for field in &self.value_fields {
            if !is_safe_identifier(&field.name) {
                return Err(DefinitionError::InvalidFieldName(field.name.clone()));
            }
            if self.key_fields.iter().any(|k| k.name == field.name) {
                return Err(DefinitionError::FieldCollision(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(DefinitionError::DuplicateField(field.name.clone()));
            }
        }

        if self.bucket_ladder.is_empty() {
            return Err(DefinitionError::EmptyLadder);
        }
        for (i, rung) in self.bucket_ladder.iter().enumerate() {
            if rung.bucket_len_secs == 0 {
                return Err(DefinitionError::ZeroLengthRung(i));
            }
        }
        // All rungs except the overflow rung must be strictly ascending.
        let capped = &self.bucket_ladder[..self.bucket_ladder.len() - 1];
        for pair in capped.windows(2) {
            if pair[1].max_age_secs <= pair[0].max_age_secs {
                return Err(DefinitionError::LadderNotAscending);
            }
        }
        if let Some(first) = capped.first() {
            if first.max_age_secs == 0 {
                return Err(DefinitionError::LadderNotAscending);
            }
        }

        Ok(())
    }

    /// Names of all key fields, in registration order.
    pub fn key_names(&self) -> Vec<&str> {
        self.key_fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Names of all value fields, in registration order.
    pub fn value_names(&self) -> Vec<&str> {
        self.value_fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// True if `name` is a registered key field.
    pub fn is_key_field(&self, name: &str) -> bool {
        self.key_fields.iter().any(|f| f.name == name)
    }

    /// True if `name` is a registered value field.
    pub fn is_value_field(&self, name: &str) -> bool {
        self.value_fields.iter().any(|f| f.name == name)
    }

    /// Select the ladder rung for a record of the given age: the first rung
    /// whose max age exceeds `age_secs`, else the overflow rung. Negative
    /// ages (data stamped in the future) select the finest rung.
    pub fn rung_for_age(&self, age_secs: i64) -> BucketRung {
        let capped = &self.bucket_ladder[..self.bucket_ladder.len() - 1];
        for rung in capped {
            if age_secs < rung.max_age_secs as i64 {
                return *rung;
            }
        }
        self.bucket_ladder[self.bucket_ladder.len() - 1]
    }

    /// True if `len_secs` is one of the ladder's configured bucket lengths.
    pub fn is_ladder_length(&self, len_secs: u64) -> bool {
        self.bucket_ladder
            .iter()
            .any(|r| r.bucket_len_secs == len_secs)
    }
}

/// True if `s` is safe to embed as a SQL identifier fragment:
/// ASCII alphabetic start, then alphanumerics or underscores.
pub fn is_safe_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
