//! Key dictionary — string dimension values to surrogate ids.
//!
//! One table per (type, key field), unique on the value. Entries are
//! created lazily on first sight and never deleted while referenced. The
//! in-memory cache is never evicted; a creation lock serializes first-sight
//! inserts so concurrent workers agree on the id, and cross-process races
//! resolve through insert-or-ignore followed by a re-read.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use tracing::debug;

use tallygrid_store::{names, quote_ident, SqlExecutor, SqlStore, SqlValue};

use crate::error::{EngineError, EngineResult};

/// Dimension values are truncated to this many bytes before lookup and
/// insert. Longer values that share a prefix intentionally collide.
pub const MAX_KEY_VALUE_LEN: usize = 64;

type CacheKey = (String, String);

/// Process-wide dictionary cache over the per-(type, key) tables.
pub struct KeyDictionary {
    store: SqlStore,
    /// (type, key) → value → id.
    cache: RwLock<HashMap<CacheKey, HashMap<String, i64>>>,
    /// Serializes first-sight creation of dictionary entries.
    create_lock: Mutex<()>,
}

impl KeyDictionary {
    pub fn new(store: SqlStore) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// Resolve a dimension value to its surrogate id, creating the entry
    /// on first sight.
    pub fn id_for(&self, type_name: &str, key_name: &str, value: &str) -> EngineResult<i64> {
        let value = truncate_value(value);

        if let Some(id) = self.cached(type_name, key_name, value) {
            return Ok(id);
        }

        let _guard = self
            .create_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another worker may have created the entry while we waited.
        if let Some(id) = self.cached(type_name, key_name, value) {
            return Ok(id);
        }

        let table = quote_ident(&names::key_table(type_name, key_name));
        if let Some(id) = self.select_id(&table, value)? {
            self.remember(type_name, key_name, value, id);
            return Ok(id);
        }

        // Insert-or-ignore tolerates a unique-constraint race from another
        // process; the re-read below is authoritative either way.
        self.store.execute(
            &format!("INSERT OR IGNORE INTO {table} (\"value\") VALUES (?)"),
            &[SqlValue::from(value)],
        )?;
        let id = self.select_id(&table, value)?.ok_or_else(|| {
            EngineError::Consistency(format!(
                "dictionary entry for {type_name}.{key_name}='{value}' missing after insert"
            ))
        })?;

        debug!(type_name, key_name, value, id, "dictionary entry created");
        self.remember(type_name, key_name, value, id);
        Ok(id)
    }

    /// Read-only resolution used by query filters: no lazy creation.
    pub fn lookup(
        &self,
        type_name: &str,
        key_name: &str,
        value: &str,
    ) -> EngineResult<Option<i64>> {
        let value = truncate_value(value);

        if let Some(id) = self.cached(type_name, key_name, value) {
            return Ok(Some(id));
        }

        let table = quote_ident(&names::key_table(type_name, key_name));
        let found = self.select_id(&table, value)?;
        if let Some(id) = found {
            self.remember(type_name, key_name, value, id);
        }
        Ok(found)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn cached(&self, type_name: &str, key_name: &str, value: &str) -> Option<i64> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(type_name.to_string(), key_name.to_string()))
            .and_then(|values| values.get(value).copied())
    }

    fn remember(&self, type_name: &str, key_name: &str, value: &str, id: i64) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((type_name.to_string(), key_name.to_string()))
            .or_default()
            .insert(value.to_string(), id);
    }

    fn select_id(&self, quoted_table: &str, value: &str) -> EngineResult<Option<i64>> {
        let rows = self.store.query_rows(
            &format!("SELECT \"id\" FROM {quoted_table} WHERE \"value\" = ?"),
            &[SqlValue::from(value)],
        )?;
        Ok(rows.first().and_then(|row| row[0].as_i64()))
    }
}

/// Truncate to `MAX_KEY_VALUE_LEN` bytes without splitting a character.
fn truncate_value(value: &str) -> &str {
    if value.len() <= MAX_KEY_VALUE_LEN {
        return value;
    }
    let mut end = MAX_KEY_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TypeCatalog;
    use tally_core::{BucketRung, FieldSpec, FieldType, TypeDefinition};

    fn setup() -> (SqlStore, KeyDictionary) {
        let store = SqlStore::open_in_memory().unwrap();
        let catalog = TypeCatalog::load(store.clone()).unwrap();
        catalog
            .register_type(TypeDefinition {
                name: "Job".to_string(),
                key_fields: vec![FieldSpec::new("Site", FieldType::Text)],
                value_fields: vec![FieldSpec::new("CPUTime", FieldType::Float)],
                bucket_ladder: vec![BucketRung::new(0, 3600)],
                data_timespan_secs: None,
            })
            .unwrap();
        (store.clone(), KeyDictionary::new(store))
    }

    #[test]
    fn ids_are_stable_and_distinct() {
        let (_store, dict) = setup();

        let cern = dict.id_for("Job", "Site", "CERN").unwrap();
        let desy = dict.id_for("Job", "Site", "DESY").unwrap();
        assert_ne!(cern, desy);

        // Re-asking always returns the same id.
        assert_eq!(dict.id_for("Job", "Site", "CERN").unwrap(), cern);
        assert_eq!(dict.id_for("Job", "Site", "DESY").unwrap(), desy);
    }

    #[test]
    fn cache_survives_reconstruction_via_store() {
        let (store, dict) = setup();
        let id = dict.id_for("Job", "Site", "CERN").unwrap();

        // A fresh dictionary over the same store resolves to the same id.
        let fresh = KeyDictionary::new(store);
        assert_eq!(fresh.id_for("Job", "Site", "CERN").unwrap(), id);
    }

    #[test]
    fn lookup_does_not_create() {
        let (_store, dict) = setup();
        assert_eq!(dict.lookup("Job", "Site", "CERN").unwrap(), None);

        let id = dict.id_for("Job", "Site", "CERN").unwrap();
        assert_eq!(dict.lookup("Job", "Site", "CERN").unwrap(), Some(id));
    }

    #[test]
    fn long_values_collide_by_truncation() {
        let (_store, dict) = setup();

        let base = "x".repeat(MAX_KEY_VALUE_LEN);
        let longer = format!("{base}suffix");
        let id_base = dict.id_for("Job", "Site", &base).unwrap();
        let id_longer = dict.id_for("Job", "Site", &longer).unwrap();
        assert_eq!(id_base, id_longer);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; the leading 'a' makes byte 64 fall inside one.
        let value = format!("a{}", "é".repeat(32));
        let truncated = truncate_value(&value);
        assert_eq!(truncated.len(), MAX_KEY_VALUE_LEN - 1);
        assert_eq!(truncated, format!("a{}", "é".repeat(31)));
    }
}
