use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Backend, BackendError, Filter, Query, Row, row_id, row_str};
use crate::model::{RelationKind, RelationValue};
use crate::options::ensure_option;

/// Table whose presence marks the normalized schema.
pub const SCHEMA_MARKER_TABLE: &str = "topic_terms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaGeneration {
    /// Child rows carry `tool_id` and the value directly.
    Legacy,
    /// Options tables referenced from junction tables.
    Normalized,
}

impl SchemaGeneration {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Normalized => "normalized",
        }
    }
}

/// How the schema generation is chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    #[default]
    Auto,
    Legacy,
    Normalized,
}

impl SchemaMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Legacy => "legacy",
            Self::Normalized => "normalized",
        }
    }
}

impl fmt::Display for SchemaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "legacy" | "old" => Ok(Self::Legacy),
            "normalized" | "new" => Ok(Self::Normalized),
            other => bail!("unknown schema mode `{other}` (expected auto, legacy or normalized)"),
        }
    }
}

/// Issue a trivial one-row select against `table`.
pub fn check_table(backend: &mut dyn Backend, table: &str) -> Result<(), BackendError> {
    backend
        .select(table, &Query::columns("*").limit(1))
        .map(|_| ())
}

/// Normalized iff a select against the topic terms table succeeds.
pub fn detect_schema(backend: &mut dyn Backend) -> SchemaGeneration {
    match backend.select(SCHEMA_MARKER_TABLE, &Query::columns("id").limit(1)) {
        Ok(_) => SchemaGeneration::Normalized,
        Err(error) => {
            tracing::debug!(%error, "schema check failed; using legacy schema");
            SchemaGeneration::Legacy
        }
    }
}

/// Resolve the generation once; `Auto` queries the backend.
pub fn resolve_generation(backend: &mut dyn Backend, mode: SchemaMode) -> SchemaGeneration {
    match mode {
        SchemaMode::Auto => detect_schema(backend),
        SchemaMode::Legacy => SchemaGeneration::Legacy,
        SchemaMode::Normalized => SchemaGeneration::Normalized,
    }
}

pub fn store_for(generation: SchemaGeneration) -> Box<dyn RelationStore> {
    match generation {
        SchemaGeneration::Legacy => Box::new(LegacyRelations),
        SchemaGeneration::Normalized => Box::new(NormalizedRelations),
    }
}

/// Schema-specific reads and writes of tool relations.
pub trait RelationStore {
    fn generation(&self) -> SchemaGeneration;

    /// Table holding the `tool_id`-keyed rows for `kind`.
    fn relation_table(&self, kind: RelationKind) -> &'static str;

    fn load(
        &self,
        backend: &mut dyn Backend,
        kind: RelationKind,
        tool_id: &str,
    ) -> Result<Vec<RelationValue>>;

    /// Create relation rows; returns how many were written.
    fn attach(
        &self,
        backend: &mut dyn Backend,
        kind: RelationKind,
        tool_id: &str,
        values: &[RelationValue],
    ) -> Result<usize>;

    fn clear(&self, backend: &mut dyn Backend, kind: RelationKind, tool_id: &str) -> Result<usize> {
        let table = self.relation_table(kind);
        backend
            .delete(table, &[Filter::eq("tool_id", tool_id)])
            .with_context(|| format!("failed to delete {kind} rows from {table}"))
    }

    fn list_values(&self, backend: &mut dyn Backend, kind: RelationKind) -> Result<Vec<String>>;

    fn add_value(&self, backend: &mut dyn Backend, kind: RelationKind, value: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedRelations;

impl RelationStore for NormalizedRelations {
    fn generation(&self) -> SchemaGeneration {
        SchemaGeneration::Normalized
    }

    fn relation_table(&self, kind: RelationKind) -> &'static str {
        kind.tables().junction_table
    }

    fn load(
        &self,
        backend: &mut dyn Backend,
        kind: RelationKind,
        tool_id: &str,
    ) -> Result<Vec<RelationValue>> {
        let tables = kind.tables();
        let columns = if kind == RelationKind::Function {
            format!("{}, note", tables.junction_fk)
        } else {
            tables.junction_fk.to_string()
        };
        let links = backend
            .select(
                tables.junction_table,
                &Query::columns(&columns).eq("tool_id", tool_id),
            )
            .with_context(|| format!("failed to read {}", tables.junction_table))?;
        if links.is_empty() {
            return Ok(Vec::new());
        }

        let ids: BTreeSet<String> = links
            .iter()
            .filter_map(|row| row_id(row, tables.junction_fk))
            .collect();
        let options = backend
            .select(
                tables.options_table,
                &Query::columns(&format!("id, {}", tables.value_column)).filter(Filter::one_of(
                    "id",
                    ids.into_iter().map(Value::String).collect(),
                )),
            )
            .with_context(|| format!("failed to read {}", tables.options_table))?;
        let by_id: BTreeMap<String, String> = options
            .iter()
            .filter_map(|row| {
                Some((
                    row_id(row, "id")?,
                    row_str(row, tables.value_column)?.to_string(),
                ))
            })
            .collect();

        // Dangling references are dropped.
        let mut values: Vec<RelationValue> = links
            .iter()
            .filter_map(|row| {
                let value = by_id.get(&row_id(row, tables.junction_fk)?)?;
                Some(RelationValue {
                    value: value.clone(),
                    note: row_str(row, "note").map(str::to_string),
                })
            })
            .collect();
        values.sort();
        Ok(values)
    }

    fn attach(
        &self,
        backend: &mut dyn Backend,
        kind: RelationKind,
        tool_id: &str,
        values: &[RelationValue],
    ) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }
        let tables = kind.tables();
        let mut rows = Vec::with_capacity(values.len());
        for item in values {
            let option_id = ensure_option(backend, kind, &item.value)?;
            let mut row = Row::new();
            row.insert("tool_id".to_string(), Value::String(tool_id.to_string()));
            row.insert(tables.junction_fk.to_string(), Value::String(option_id));
            if kind == RelationKind::Function {
                row.insert("note".to_string(), optional_text(item.note.as_deref()));
            }
            rows.push(row);
        }
        let inserted = backend
            .insert(tables.junction_table, &rows)
            .with_context(|| format!("failed to insert into {}", tables.junction_table))?;
        Ok(inserted.len().max(rows.len()))
    }

    fn list_values(&self, backend: &mut dyn Backend, kind: RelationKind) -> Result<Vec<String>> {
        let tables = kind.tables();
        let rows = backend.select(
            tables.options_table,
            &Query::columns(tables.value_column).order_by(tables.value_column),
        )?;
        Ok(distinct_values(&rows, tables.value_column))
    }

    fn add_value(&self, backend: &mut dyn Backend, kind: RelationKind, value: &str) -> Result<()> {
        ensure_option(backend, kind, value).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyRelations;

impl RelationStore for LegacyRelations {
    fn generation(&self) -> SchemaGeneration {
        SchemaGeneration::Legacy
    }

    fn relation_table(&self, kind: RelationKind) -> &'static str {
        let tables = kind.tables();
        tables.legacy_table.unwrap_or(tables.junction_table)
    }

    fn load(
        &self,
        backend: &mut dyn Backend,
        kind: RelationKind,
        tool_id: &str,
    ) -> Result<Vec<RelationValue>> {
        let tables = kind.tables();
        let Some(table) = tables.legacy_table else {
            return NormalizedRelations.load(backend, kind, tool_id);
        };
        let columns = if kind == RelationKind::Function {
            "operation, note".to_string()
        } else {
            tables.value_column.to_string()
        };
        let rows = backend
            .select(table, &Query::columns(&columns).eq("tool_id", tool_id))
            .with_context(|| format!("failed to read {table}"))?;

        let mut values = Vec::new();
        for row in &rows {
            let note = row_str(row, "note").map(str::to_string);
            for value in cell_values(row.get(tables.value_column)) {
                values.push(RelationValue {
                    value,
                    note: note.clone(),
                });
            }
        }
        values.sort();
        Ok(values)
    }

    fn attach(
        &self,
        backend: &mut dyn Backend,
        kind: RelationKind,
        tool_id: &str,
        values: &[RelationValue],
    ) -> Result<usize> {
        let tables = kind.tables();
        let Some(table) = tables.legacy_table else {
            return NormalizedRelations.attach(backend, kind, tool_id, values);
        };
        if values.is_empty() {
            return Ok(0);
        }
        let rows: Vec<Row> = values
            .iter()
            .map(|item| {
                let mut row = legacy_value_row(kind, &item.value);
                row.insert("tool_id".to_string(), Value::String(tool_id.to_string()));
                if kind == RelationKind::Function {
                    row.insert("note".to_string(), optional_text(item.note.as_deref()));
                }
                row
            })
            .collect();
        let inserted = backend
            .insert(table, &rows)
            .with_context(|| format!("failed to insert into {table}"))?;
        Ok(inserted.len().max(rows.len()))
    }

    fn list_values(&self, backend: &mut dyn Backend, kind: RelationKind) -> Result<Vec<String>> {
        let tables = kind.tables();
        let Some(table) = tables.legacy_table else {
            return NormalizedRelations.list_values(backend, kind);
        };
        let rows = backend.select(
            table,
            &Query::columns(tables.value_column).order_by(tables.value_column),
        )?;
        Ok(distinct_values(&rows, tables.value_column))
    }

    fn add_value(&self, backend: &mut dyn Backend, kind: RelationKind, value: &str) -> Result<()> {
        let tables = kind.tables();
        let Some(table) = tables.legacy_table else {
            return NormalizedRelations.add_value(backend, kind, value);
        };
        backend
            .insert(table, &[legacy_value_row(kind, value)])
            .with_context(|| format!("failed to insert into {table}"))?;
        Ok(())
    }
}

fn legacy_value_row(kind: RelationKind, value: &str) -> Row {
    let tables = kind.tables();
    let cell = if kind == RelationKind::Function {
        Value::Array(vec![Value::String(value.to_string())])
    } else {
        Value::String(value.to_string())
    };
    let mut row = Row::new();
    row.insert(tables.value_column.to_string(), cell);
    row
}

/// Text values of a cell that may hold a string or an array of strings.
pub fn cell_values(cell: Option<&Value>) -> Vec<String> {
    match cell {
        Some(Value::String(text)) if !text.is_empty() => vec![text.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn distinct_values(rows: &[Row], column: &str) -> Vec<String> {
    rows.iter()
        .flat_map(|row| cell_values(row.get(column)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn optional_text(value: Option<&str>) -> Value {
    value
        .map(|text| Value::String(text.to_string()))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        LegacyRelations, NormalizedRelations, RelationStore, SchemaGeneration, SchemaMode,
        detect_schema, resolve_generation, store_for,
    };
    use crate::backend::{Backend, row_of};
    use crate::memory::{MemoryBackend, Operation};
    use crate::model::{RelationKind, RelationValue};

    fn value(text: &str) -> RelationValue {
        RelationValue {
            value: text.to_string(),
            note: None,
        }
    }

    #[test]
    fn detects_normalized_schema_when_topic_terms_answers() {
        let mut backend = MemoryBackend::normalized_schema();
        assert_eq!(detect_schema(&mut backend), SchemaGeneration::Normalized);
    }

    #[test]
    fn detects_legacy_schema_when_check_table_is_missing() {
        let mut backend = MemoryBackend::legacy_schema();
        assert_eq!(detect_schema(&mut backend), SchemaGeneration::Legacy);
    }

    #[test]
    fn any_schema_check_error_means_legacy() {
        let mut backend = MemoryBackend::normalized_schema();
        backend.fail_on("topic_terms", Operation::Select);
        assert_eq!(detect_schema(&mut backend), SchemaGeneration::Legacy);
    }

    #[test]
    fn forced_modes_skip_detection() {
        let mut backend = MemoryBackend::new();
        assert_eq!(
            resolve_generation(&mut backend, SchemaMode::Normalized),
            SchemaGeneration::Normalized
        );
        assert_eq!(backend.request_count(), 0);
        assert_eq!(
            resolve_generation(&mut backend, SchemaMode::Auto),
            SchemaGeneration::Legacy
        );
        assert_eq!(backend.request_count(), 1);
    }

    #[test]
    fn schema_mode_parses_aliases() {
        assert_eq!("new".parse::<SchemaMode>().unwrap(), SchemaMode::Normalized);
        assert_eq!("Legacy".parse::<SchemaMode>().unwrap(), SchemaMode::Legacy);
        assert!("v3".parse::<SchemaMode>().is_err());
    }

    #[test]
    fn normalized_attach_creates_options_then_junction_rows() {
        let mut backend = MemoryBackend::normalized_schema();
        let store = store_for(SchemaGeneration::Normalized);
        let written = store
            .attach(
                &mut backend,
                RelationKind::Language,
                "7",
                &[value("Python"), value("C++")],
            )
            .expect("attach");
        assert_eq!(written, 2);
        assert_eq!(backend.rows("language_options").len(), 2);
        assert_eq!(backend.count_where("tool_language_relations", "tool_id", "7"), 2);

        let loaded = store
            .load(&mut backend, RelationKind::Language, "7")
            .expect("load");
        assert_eq!(loaded, vec![value("C++"), value("Python")]);
    }

    #[test]
    fn normalized_add_value_looks_up_once() {
        let mut backend = MemoryBackend::normalized_schema();
        NormalizedRelations
            .add_value(&mut backend, RelationKind::OperatingSystem, "Linux")
            .expect("add");
        assert_eq!(backend.request_count(), 2);
        NormalizedRelations
            .add_value(&mut backend, RelationKind::OperatingSystem, "Linux")
            .expect("add again");
        assert_eq!(backend.request_count(), 3);
        assert_eq!(backend.rows("os_options").len(), 1);
    }

    #[test]
    fn normalized_load_drops_dangling_references() {
        let mut backend = MemoryBackend::normalized_schema();
        backend
            .insert(
                "tool_topic_terms",
                &[row_of([("tool_id", json!("1")), ("term_id", json!("404"))])],
            )
            .expect("seed junction");
        let loaded = NormalizedRelations
            .load(&mut backend, RelationKind::Topic, "1")
            .expect("load");
        assert!(loaded.is_empty());
    }

    #[test]
    fn legacy_functions_flatten_operation_arrays() {
        let mut backend = MemoryBackend::legacy_schema();
        backend
            .insert(
                "functions",
                &[row_of([
                    ("operation", json!(["Analysis", "Calculation"])),
                    ("note", json!("Mineral chemistry")),
                    ("tool_id", json!("3")),
                ])],
            )
            .expect("seed functions");
        let loaded = LegacyRelations
            .load(&mut backend, RelationKind::Function, "3")
            .expect("load");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|item| item.note.as_deref() == Some("Mineral chemistry")));
    }

    #[test]
    fn legacy_petrology_terms_use_the_junction_table() {
        let mut backend = MemoryBackend::legacy_schema();
        let store = LegacyRelations;
        assert_eq!(
            store.relation_table(RelationKind::PetrologyTerm),
            "tool_petrology_terms"
        );
        store
            .attach(&mut backend, RelationKind::PetrologyTerm, "5", &[value("Basalt")])
            .expect("attach");
        assert_eq!(backend.rows("petrology_terms").len(), 1);
        assert_eq!(store.clear(&mut backend, RelationKind::PetrologyTerm, "5").unwrap(), 1);
    }
}
