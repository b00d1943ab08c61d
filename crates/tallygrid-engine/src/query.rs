//! Query builder — bucket and raw retrieval over the dynamic schema.
//!
//! Dimension fields are rewritten to join through the key dictionary
//! (`b."k" = d_k."id"`, projecting `d_k."value"`), metric fields project
//! straight from the table with any requested aggregate. Filter values are
//! translated to dictionary ids before the store is touched; an unknown
//! value yields an impossible predicate rather than an error. Join
//! conditions are deduplicated per key field.

use std::collections::BTreeMap;

use tally_core::time::align_down;
use tally_core::TypeDefinition;
use tallygrid_store::{names, quote_ident, SqlValue};

use crate::dictionary::KeyDictionary;
use crate::error::{EngineError, EngineResult};

/// Aggregate function applied to a projected metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregate {
    fn sql(self) -> &'static str {
        match self {
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::Count => "COUNT",
        }
    }
}

/// One projected field, optionally aggregated.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub field: String,
    pub aggregate: Option<Aggregate>,
}

impl SelectItem {
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            field: name.into(),
            aggregate: None,
        }
    }

    pub fn aggregated(name: impl Into<String>, aggregate: Aggregate) -> Self {
        Self {
            field: name.into(),
            aggregate: Some(aggregate),
        }
    }
}

/// One order-by entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SortItem {
    pub field: String,
    pub descending: bool,
}

impl SortItem {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            field: name.into(),
            descending: false,
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            field: name.into(),
            descending: true,
        }
    }
}

/// Result set: column names plus dynamically-typed rows.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// Assembles one SELECT over a per-type table with dictionary joins.
struct QueryParts {
    projections: Vec<String>,
    /// alias → join clause; BTreeMap both deduplicates and keeps the
    /// rendered join order deterministic.
    joins: BTreeMap<String, String>,
    predicates: Vec<String>,
    params: Vec<SqlValue>,
    group: Vec<String>,
    order: Vec<String>,
}

impl QueryParts {
    fn new() -> Self {
        Self {
            projections: Vec::new(),
            joins: BTreeMap::new(),
            predicates: Vec::new(),
            params: Vec::new(),
            group: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Register the dictionary join for a key field, returning the alias.
    fn dimension_join(&mut self, def: &TypeDefinition, key: &str) -> String {
        let alias = format!("d_{key}");
        let quoted_alias = quote_ident(&alias);
        self.joins.entry(alias).or_insert_with(|| {
            format!(
                "JOIN {} AS {} ON b.{} = {}.\"id\"",
                quote_ident(&names::key_table(&def.name, key)),
                quoted_alias,
                quote_ident(key),
                quoted_alias
            )
        });
        quoted_alias
    }

    fn render(&self, table: &str) -> String {
        let mut sql = format!(
            "SELECT {} FROM {} AS b",
            self.projections.join(", "),
            quote_ident(table)
        );
        for join in self.joins.values() {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.predicates.join(" AND "));
        }
        if !self.group.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group.join(", "));
        }
        if !self.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order.join(", "));
        }
        sql
    }
}

fn check_field(def: &TypeDefinition, field: &str) -> EngineResult<()> {
    if def.is_key_field(field) || def.is_value_field(field) {
        Ok(())
    } else {
        Err(EngineError::UnknownField {
            type_name: def.name.clone(),
            field: field.to_string(),
        })
    }
}

/// Translate one filter key's OR-of-values into an id predicate.
fn filter_predicate(
    parts: &mut QueryParts,
    def: &TypeDefinition,
    dict: &KeyDictionary,
    key: &str,
    values: &[String],
) -> EngineResult<()> {
    if !def.is_key_field(key) {
        return Err(EngineError::Validation(format!(
            "filter field '{key}' is not a key field of type '{}'",
            def.name
        )));
    }

    let mut ids = Vec::new();
    for value in values {
        if let Some(id) = dict.lookup(&def.name, key, value)? {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        // None of the requested values exist; match nothing.
        parts
            .predicates
            .push(format!("b.{} = -1", quote_ident(key)));
    } else {
        let placeholders = vec!["?"; ids.len()].join(", ");
        parts
            .predicates
            .push(format!("b.{} IN ({placeholders})", quote_ident(key)));
        parts.params.extend(ids.into_iter().map(SqlValue::Int));
    }
    Ok(())
}

/// Build the bucket-table query. Returns (sql, params, column names).
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_bucket_query(
    def: &TypeDefinition,
    dict: &KeyDictionary,
    start: i64,
    end: i64,
    now: i64,
    select: &[SelectItem],
    filters: &[(String, Vec<String>)],
    group: &[String],
    order: &[SortItem],
) -> EngineResult<(String, Vec<SqlValue>, Vec<String>)> {
    if select.is_empty() {
        return Err(EngineError::Validation(
            "select list must not be empty".to_string(),
        ));
    }

    let mut parts = QueryParts::new();
    let mut columns = Vec::new();

    for item in select {
        check_field(def, &item.field)?;
        let expr = if def.is_key_field(&item.field) {
            let alias = parts.dimension_join(def, &item.field);
            format!("{alias}.\"value\"")
        } else {
            let column = format!("b.{}", quote_ident(&item.field));
            match item.aggregate {
                Some(agg) => format!("{}({column})", agg.sql()),
                None => column,
            }
        };
        parts.projections.push(expr);
        columns.push(item.field.clone());
    }

    // Snap the requested start down to the boundary of the rung its age
    // selects, so partially-covered edge buckets are included whole.
    let rung_len = def.rung_for_age(now - start).bucket_len_secs as i64;
    let snapped = align_down(start, rung_len);
    parts.predicates.push("b.\"start_time\" >= ?".to_string());
    parts.params.push(SqlValue::Int(snapped));
    parts.predicates.push("b.\"start_time\" <= ?".to_string());
    parts.params.push(SqlValue::Int(end));

    for (key, values) in filters {
        filter_predicate(&mut parts, def, dict, key, values)?;
    }

    for field in group {
        check_field(def, field)?;
        parts.group.push(format!("b.{}", quote_ident(field)));
    }

    for item in order {
        check_field(def, &item.field)?;
        let expr = if def.is_key_field(&item.field) {
            let alias = parts.dimension_join(def, &item.field);
            format!("{alias}.\"value\"")
        } else {
            // Reuse the select aggregate for this metric when there is one,
            // so ordering matches what is projected under a group-by.
            let aggregate = select
                .iter()
                .find(|s| s.field == item.field)
                .and_then(|s| s.aggregate);
            let column = format!("b.{}", quote_ident(&item.field));
            match aggregate {
                Some(agg) => format!("{}({column})", agg.sql()),
                None => column,
            }
        };
        parts
            .order
            .push(if item.descending { format!("{expr} DESC") } else { expr });
    }

    Ok((
        parts.render(&names::bucket_table(&def.name)),
        parts.params,
        columns,
    ))
}

/// Build the raw-table query: full projection, end-time range semantics,
/// no bucket-length snapping.
pub(crate) fn build_raw_query(
    def: &TypeDefinition,
    dict: &KeyDictionary,
    start: i64,
    end: i64,
    filters: &[(String, Vec<String>)],
    order: &[SortItem],
) -> EngineResult<(String, Vec<SqlValue>, Vec<String>)> {
    let mut parts = QueryParts::new();
    let mut columns = Vec::new();

    for key in &def.key_fields {
        let alias = parts.dimension_join(def, &key.name);
        parts.projections.push(format!("{alias}.\"value\""));
        columns.push(key.name.clone());
    }
    for value in &def.value_fields {
        parts
            .projections
            .push(format!("b.{}", quote_ident(&value.name)));
        columns.push(value.name.clone());
    }
    parts.projections.push("b.\"start_time\"".to_string());
    columns.push("start_time".to_string());
    parts.projections.push("b.\"end_time\"".to_string());
    columns.push("end_time".to_string());

    parts.predicates.push("b.\"end_time\" >= ?".to_string());
    parts.params.push(SqlValue::Int(start));
    parts.predicates.push("b.\"end_time\" <= ?".to_string());
    parts.params.push(SqlValue::Int(end));

    for (key, values) in filters {
        filter_predicate(&mut parts, def, dict, key, values)?;
    }

    for item in order {
        check_field(def, &item.field)?;
        let expr = if def.is_key_field(&item.field) {
            let alias = parts.dimension_join(def, &item.field);
            format!("{alias}.\"value\"")
        } else {
            format!("b.{}", quote_ident(&item.field))
        };
        parts
            .order
            .push(if item.descending { format!("{expr} DESC") } else { expr });
    }

    Ok((
        parts.render(&names::raw_table(&def.name)),
        parts.params,
        columns,
    ))
}
