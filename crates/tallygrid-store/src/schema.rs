//! Schema AST and table naming for the TallyGrid store.
//!
//! Per-type tables are created dynamically at registration time, so DDL is
//! rendered from a small typed AST rather than format-strings over raw user
//! input. Identifiers are always double-quoted.

use tally_core::FieldType;

/// SQLite column affinity for a schema column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

impl From<FieldType> for ColumnType {
    fn from(ty: FieldType) -> Self {
        match ty {
            FieldType::Integer => ColumnType::Integer,
            FieldType::Float => ColumnType::Real,
            FieldType::Text => ColumnType::Text,
        }
    }
}

/// A single column definition.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub not_null: bool,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub default_value: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            not_null: false,
            primary_key: false,
            autoincrement: false,
            default_value: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    pub fn default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    fn sql(&self) -> String {
        let mut parts = vec![quote_ident(&self.name), self.ty.sql().to_string()];
        if self.primary_key {
            parts.push("PRIMARY KEY".to_string());
        }
        if self.autoincrement {
            parts.push("AUTOINCREMENT".to_string());
        }
        if self.not_null {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = &self.default_value {
            parts.push(format!("DEFAULT {default}"));
        }
        parts.join(" ")
    }
}

/// A table definition with optional table-level unique constraints.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Column-name groups, each rendered as a UNIQUE constraint.
    pub uniques: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            uniques: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.uniques
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Render as `CREATE TABLE IF NOT EXISTS` DDL.
    pub fn to_sql(&self) -> String {
        let mut items: Vec<String> = self.columns.iter().map(ColumnDef::sql).collect();
        for group in &self.uniques {
            let cols: Vec<String> = group.iter().map(|c| quote_ident(c)).collect();
            items.push(format!("UNIQUE ({})", cols.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            items.join(", ")
        )
    }
}

/// A secondary index definition.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Render as `CREATE INDEX IF NOT EXISTS` DDL.
    pub fn to_sql(&self) -> String {
        let cols: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&self.name),
            quote_ident(&self.table),
            cols.join(", ")
        )
    }
}

/// Double-quote a SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Table naming: a pure, collision-free function of (role, type[, key]).
///
/// Type and key names are validated as safe identifiers at registration,
/// and each role has a distinct prefix, so no two (role, type, key)
/// combinations can render the same table name.
pub mod names {
    /// Catalog table holding one row per registered type.
    pub const CATALOG: &str = "ac_catalog";

    /// Raw record table for a type.
    pub fn raw_table(type_name: &str) -> String {
        format!("ac_type_{type_name}")
    }

    /// Aggregate bucket table for a type.
    pub fn bucket_table(type_name: &str) -> String {
        format!("ac_bucket_{type_name}")
    }

    /// Durable pending (staging) queue table for a type.
    pub fn pending_table(type_name: &str) -> String {
        format!("ac_pending_{type_name}")
    }

    /// Dictionary table for one key field of a type.
    pub fn key_table(type_name: &str, key_name: &str) -> String {
        format!("ac_key_{type_name}_{key_name}")
    }
}
