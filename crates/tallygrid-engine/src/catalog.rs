//! Type catalog — persisted registry of accounting types.
//!
//! Each registered type owns four table roles: one dictionary table per key
//! field, a raw record table, an aggregate bucket table, and a pending
//! staging table. The catalog row stores the JSON-serialized definition;
//! an in-memory mirror is loaded at startup and kept current under a
//! process-wide registration lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use tally_core::{FieldType, TypeDefinition};
use tallygrid_store::{
    names, ColumnDef, ColumnType, IndexDef, SqlExecutor, SqlStore, SqlValue, TableDef,
};

use crate::error::{EngineError, EngineResult};

/// Persisted type registry with an in-memory mirror.
pub struct TypeCatalog {
    store: SqlStore,
    /// name → definition, mirrored from the catalog table.
    mirror: RwLock<HashMap<String, Arc<TypeDefinition>>>,
    /// Serializes all catalog-mutating operations (registration, deletion,
    /// timespan changes): they touch shared mirror state plus DDL.
    register_lock: Mutex<()>,
}

impl TypeCatalog {
    /// Create a catalog over the given store and load the mirror.
    ///
    /// Loading is mandatory before any other engine operation; callers get
    /// that by construction.
    pub fn load(store: SqlStore) -> EngineResult<Self> {
        store.create_table(&catalog_table())?;

        let mut mirror = HashMap::new();
        let rows = store.query_rows(
            &format!("SELECT \"name\", \"definition\" FROM \"{}\"", names::CATALOG),
            &[],
        )?;
        for row in &rows {
            let name = row[0].as_str().ok_or_else(|| {
                EngineError::Consistency("catalog row with non-text name".to_string())
            })?;
            let json = row[1].as_str().ok_or_else(|| {
                EngineError::Consistency(format!("catalog row '{name}' has no definition"))
            })?;
            let def: TypeDefinition = serde_json::from_str(json).map_err(|e| {
                EngineError::Consistency(format!("catalog row '{name}' failed to parse: {e}"))
            })?;
            mirror.insert(name.to_string(), Arc::new(def));
        }

        info!(types = mirror.len(), "type catalog loaded");
        Ok(Self {
            store,
            mirror: RwLock::new(mirror),
            register_lock: Mutex::new(()),
        })
    }

    /// Register an accounting type, creating its physical tables if absent.
    ///
    /// Returns `true` if the type already existed. Re-registering with a
    /// changed ladder or field list keeps the stored definition
    /// authoritative and only logs a warning — data is never silently
    /// migrated.
    pub fn register_type(&self, def: TypeDefinition) -> EngineResult<bool> {
        def.validate()?;
        let _guard = self.mutation_guard();

        if let Some(existing) = self.read_mirror().get(&def.name) {
            if **existing != def {
                warn!(
                    type_name = %def.name,
                    "re-registration with a different definition; keeping stored definition"
                );
            }
            return Ok(true);
        }

        for key in &def.key_fields {
            self.store
                .create_table(&key_table_def(&def.name, &key.name))?;
        }
        self.store.create_table(&raw_table_def(&def))?;
        self.store.create_index(&IndexDef::new(
            format!("ix_{}_time", names::raw_table(&def.name)),
            names::raw_table(&def.name),
            &["end_time"],
        ))?;
        self.store.create_table(&bucket_table_def(&def))?;
        self.store.create_index(&IndexDef::new(
            format!("ix_{}_window", names::bucket_table(&def.name)),
            names::bucket_table(&def.name),
            &["bucket_length", "start_time"],
        ))?;
        self.store.create_table(&pending_table_def(&def))?;
        self.store.create_index(&IndexDef::new(
            format!("ix_{}_lease", names::pending_table(&def.name)),
            names::pending_table(&def.name),
            &["taken", "taken_since"],
        ))?;

        self.persist(&def)?;
        self.write_mirror()
            .insert(def.name.clone(), Arc::new(def.clone()));

        info!(type_name = %def.name, keys = def.key_fields.len(), values = def.value_fields.len(), "accounting type registered");
        Ok(false)
    }

    /// Drop all of a type's physical tables and its catalog row.
    pub fn delete_type(&self, name: &str) -> EngineResult<()> {
        let _guard = self.mutation_guard();

        let def = self
            .read_mirror()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownType(name.to_string()))?;

        for key in &def.key_fields {
            self.store.drop_table(&names::key_table(name, &key.name))?;
        }
        self.store.drop_table(&names::raw_table(name))?;
        self.store.drop_table(&names::bucket_table(name))?;
        self.store.drop_table(&names::pending_table(name))?;

        self.store.execute(
            &format!("DELETE FROM \"{}\" WHERE \"name\" = ?", names::CATALOG),
            &[SqlValue::from(name)],
        )?;
        self.write_mirror().remove(name);

        info!(type_name = %name, "accounting type deleted");
        Ok(())
    }

    /// Update a type's retention horizon in the stored definition and mirror.
    pub fn set_data_timespan(&self, name: &str, secs: Option<u64>) -> EngineResult<()> {
        let _guard = self.mutation_guard();

        let def = self
            .read_mirror()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownType(name.to_string()))?;

        let mut updated = (*def).clone();
        updated.data_timespan_secs = secs;
        self.persist(&updated)?;
        self.write_mirror()
            .insert(name.to_string(), Arc::new(updated));

        debug!(type_name = %name, ?secs, "data timespan updated");
        Ok(())
    }

    /// Look up a registered type.
    pub fn get(&self, name: &str) -> EngineResult<Arc<TypeDefinition>> {
        self.read_mirror()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownType(name.to_string()))
    }

    /// All registered definitions.
    pub fn definitions(&self) -> Vec<TypeDefinition> {
        self.read_mirror().values().map(|d| (**d).clone()).collect()
    }

    /// Names of all registered types.
    pub fn names(&self) -> Vec<String> {
        self.read_mirror().keys().cloned().collect()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn persist(&self, def: &TypeDefinition) -> EngineResult<()> {
        let json = serde_json::to_string(def)
            .map_err(|e| EngineError::Consistency(format!("definition serialization: {e}")))?;
        self.store.execute(
            &format!(
                "INSERT INTO \"{}\" (\"name\", \"definition\") VALUES (?, ?) \
                 ON CONFLICT(\"name\") DO UPDATE SET \"definition\" = excluded.\"definition\"",
                names::CATALOG
            ),
            &[SqlValue::from(def.name.as_str()), SqlValue::from(json)],
        )?;
        Ok(())
    }

    fn mutation_guard(&self) -> MutexGuard<'_, ()> {
        self.register_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_mirror(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<TypeDefinition>>> {
        self.mirror.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_mirror(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<TypeDefinition>>> {
        self.mirror.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Per-type table schemas ──────────────────────────────────────────

fn catalog_table() -> TableDef {
    TableDef::new(names::CATALOG)
        .column(ColumnDef::new("name", ColumnType::Text).primary_key())
        .column(ColumnDef::new("definition", ColumnType::Text).not_null())
}

fn key_table_def(type_name: &str, key_name: &str) -> TableDef {
    TableDef::new(names::key_table(type_name, key_name))
        .column(
            ColumnDef::new("id", ColumnType::Integer)
                .primary_key()
                .autoincrement(),
        )
        .column(ColumnDef::new("value", ColumnType::Text).not_null())
        .unique(&["value"])
}

fn raw_table_def(def: &TypeDefinition) -> TableDef {
    let mut table = TableDef::new(names::raw_table(&def.name));
    for key in &def.key_fields {
        // Key columns hold dictionary ids.
        table = table.column(ColumnDef::new(&key.name, ColumnType::Integer).not_null());
    }
    for value in &def.value_fields {
        table = table.column(ColumnDef::new(&value.name, value.sql_type.into()).not_null());
    }
    table
        .column(ColumnDef::new("start_time", ColumnType::Integer).not_null())
        .column(ColumnDef::new("end_time", ColumnType::Integer).not_null())
}

fn bucket_table_def(def: &TypeDefinition) -> TableDef {
    let mut table = TableDef::new(names::bucket_table(&def.name));
    for key in &def.key_fields {
        table = table.column(ColumnDef::new(&key.name, ColumnType::Integer).not_null());
    }
    table = table
        .column(ColumnDef::new("start_time", ColumnType::Integer).not_null())
        .column(ColumnDef::new("bucket_length", ColumnType::Integer).not_null())
        .column(ColumnDef::new("entries_in_bucket", ColumnType::Real).not_null());
    for value in &def.value_fields {
        // Accumulators are always REAL: they carry proportional shares.
        table = table.column(ColumnDef::new(&value.name, ColumnType::Real).not_null());
    }
    let mut unique: Vec<&str> = def.key_fields.iter().map(|k| k.name.as_str()).collect();
    unique.push("start_time");
    unique.push("bucket_length");
    table.unique(&unique)
}

fn pending_table_def(def: &TypeDefinition) -> TableDef {
    let mut table = TableDef::new(names::pending_table(&def.name)).column(
        ColumnDef::new("id", ColumnType::Integer)
            .primary_key()
            .autoincrement(),
    );
    for key in &def.key_fields {
        // Pending rows keep the raw string values; dictionary resolution
        // happens when a worker picks the row up.
        table = table.column(ColumnDef::new(&key.name, ColumnType::Text).not_null());
    }
    for value in &def.value_fields {
        table = table.column(ColumnDef::new(&value.name, ColumnType::Real).not_null());
    }
    table
        .column(ColumnDef::new("start_time", ColumnType::Integer).not_null())
        .column(ColumnDef::new("end_time", ColumnType::Integer).not_null())
        .column(
            ColumnDef::new("taken", ColumnType::Integer)
                .not_null()
                .default("0"),
        )
        .column(
            ColumnDef::new("taken_since", ColumnType::Integer)
                .not_null()
                .default("0"),
        )
}

/// True if `sql_type` compares with an epsilon in raw-row deletion.
pub(crate) fn is_float_field(sql_type: FieldType) -> bool {
    matches!(sql_type, FieldType::Float)
}
