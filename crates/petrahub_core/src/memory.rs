use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::backend::{
    Backend, BackendError, Filter, Query, Row, UNDEFINED_TABLE_CODE, scalar_text,
};
use crate::model::{RelationKind, TOOLS_TABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: Vec<Row>,
    generate_ids: bool,
    unique: Vec<Vec<String>>,
}

/// In-process `Backend` holding tables as vectors of JSON rows.
///
/// Tables must be created before use; touching an unknown table fails
/// the way PostgreSQL reports an undefined relation.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: BTreeMap<String, MemoryTable>,
    failures: BTreeSet<(String, Operation)>,
    next_id: u64,
    request_count: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables of the flat schema: child rows carry `tool_id` directly.
    /// Petrology terms are normalized in both generations.
    pub fn legacy_schema() -> Self {
        let mut backend = Self::new();
        backend.create_table(TOOLS_TABLE);
        for kind in RelationKind::ALL {
            let tables = kind.tables();
            match tables.legacy_table {
                Some(table) => {
                    backend.create_table(table);
                }
                None => {
                    backend
                        .create_table(tables.options_table)
                        .add_unique(tables.options_table, &[tables.value_column])
                        .create_keyed_junction(tables.junction_table, tables.junction_fk);
                }
            }
        }
        backend
    }

    /// Tables of the normalized schema: options tables plus junctions.
    pub fn normalized_schema() -> Self {
        let mut backend = Self::new();
        backend.create_table(TOOLS_TABLE);
        for kind in RelationKind::ALL {
            let tables = kind.tables();
            backend
                .create_table(tables.options_table)
                .add_unique(tables.options_table, &[tables.value_column])
                .create_keyed_junction(tables.junction_table, tables.junction_fk);
        }
        backend
    }

    /// Create a table whose rows get a generated `id` when none is given.
    pub fn create_table(&mut self, name: &str) -> &mut Self {
        self.tables.insert(
            name.to_string(),
            MemoryTable {
                generate_ids: true,
                ..MemoryTable::default()
            },
        );
        self
    }

    /// Create a junction table (no generated ids).
    pub fn create_junction(&mut self, name: &str) -> &mut Self {
        self.tables
            .insert(name.to_string(), MemoryTable::default());
        self
    }

    /// Junction keyed on `(tool_id, fk)`, matching the bundled DDL.
    pub fn create_keyed_junction(&mut self, name: &str, fk: &str) -> &mut Self {
        self.create_junction(name).add_unique(name, &["tool_id", fk])
    }

    pub fn drop_table(&mut self, name: &str) -> &mut Self {
        self.tables.remove(name);
        self
    }

    /// Enforce uniqueness over `columns` on later inserts.
    pub fn add_unique(&mut self, table: &str, columns: &[&str]) -> &mut Self {
        if let Some(entry) = self.tables.get_mut(table) {
            entry
                .unique
                .push(columns.iter().map(|column| column.to_string()).collect());
        }
        self
    }

    pub fn fail_on(&mut self, table: &str, operation: Operation) -> &mut Self {
        self.failures.insert((table.to_string(), operation));
        self
    }

    pub fn clear_failures(&mut self) -> &mut Self {
        self.failures.clear();
        self
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables
            .get(table)
            .map(|entry| entry.rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn count_where(&self, table: &str, column: &str, value: &str) -> usize {
        let filter = Filter::eq(column, value);
        self.rows(table).iter().filter(|row| filter.matches(row)).count()
    }

    fn check(&mut self, table: &str, operation: Operation) -> Result<(), BackendError> {
        self.request_count += 1;
        if self.failures.contains(&(table.to_string(), operation)) {
            return Err(BackendError::Injected {
                operation: operation.as_str(),
                table: table.to_string(),
            });
        }
        if !self.tables.contains_key(table) {
            return Err(BackendError::Api {
                status: 404,
                code: UNDEFINED_TABLE_CODE.to_string(),
                message: format!("relation \"public.{table}\" does not exist"),
            });
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut MemoryTable, BackendError> {
        self.tables.get_mut(table).ok_or_else(|| BackendError::Api {
            status: 404,
            code: UNDEFINED_TABLE_CODE.to_string(),
            message: format!("relation \"public.{table}\" does not exist"),
        })
    }
}

impl Backend for MemoryBackend {
    fn select(&mut self, table: &str, query: &Query) -> Result<Vec<Row>, BackendError> {
        self.check(table, Operation::Select)?;
        let entry = self.table_mut(table)?;
        let mut selected: Vec<Row> = entry
            .rows
            .iter()
            .filter(|row| query.filters.iter().all(|filter| filter.matches(row)))
            .cloned()
            .collect();
        if let Some(column) = &query.order {
            selected.sort_by_key(|row| row.get(column).map(scalar_text).unwrap_or_default());
        }
        if let Some(limit) = query.limit {
            selected.truncate(limit);
        }
        Ok(selected
            .into_iter()
            .map(|row| project(row, &query.columns))
            .collect())
    }

    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<Vec<Row>, BackendError> {
        self.check(table, Operation::Insert)?;
        let mut next_id = self.next_id;
        let entry = self.table_mut(table)?;

        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.clone();
            if entry.generate_ids && !row.contains_key("id") {
                next_id += 1;
                row.insert("id".to_string(), Value::String(next_id.to_string()));
            }
            for columns in &entry.unique {
                let key = unique_key(&row, columns);
                let clash = entry
                    .rows
                    .iter()
                    .chain(prepared.iter())
                    .any(|existing| unique_key(existing, columns) == key);
                if clash {
                    return Err(BackendError::Api {
                        status: 409,
                        code: "23505".to_string(),
                        message: format!(
                            "duplicate key value violates unique constraint on {table}({})",
                            columns.join(", ")
                        ),
                    });
                }
            }
            prepared.push(row);
        }

        entry.rows.extend(prepared.iter().cloned());
        self.next_id = next_id;
        Ok(prepared)
    }

    fn update(
        &mut self,
        table: &str,
        filters: &[Filter],
        changes: &Row,
    ) -> Result<Vec<Row>, BackendError> {
        if filters.is_empty() {
            return Err(BackendError::UnfilteredWrite {
                operation: "update",
                table: table.to_string(),
            });
        }
        self.check(table, Operation::Update)?;
        let entry = self.table_mut(table)?;
        let mut updated = Vec::new();
        for row in entry
            .rows
            .iter_mut()
            .filter(|row| filters.iter().all(|filter| filter.matches(row)))
        {
            for (key, value) in changes {
                row.insert(key.clone(), value.clone());
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    fn delete(&mut self, table: &str, filters: &[Filter]) -> Result<usize, BackendError> {
        if filters.is_empty() {
            return Err(BackendError::UnfilteredWrite {
                operation: "delete",
                table: table.to_string(),
            });
        }
        self.check(table, Operation::Delete)?;
        let entry = self.table_mut(table)?;
        let before = entry.rows.len();
        entry
            .rows
            .retain(|row| !filters.iter().all(|filter| filter.matches(row)));
        Ok(before - entry.rows.len())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn project(row: Row, columns: &str) -> Row {
    let wanted: Vec<&str> = columns
        .split(',')
        .map(str::trim)
        .filter(|column| !column.is_empty())
        .collect();
    if wanted.is_empty() || wanted.contains(&"*") {
        return row;
    }
    row.into_iter()
        .filter(|(key, _)| wanted.contains(&key.as_str()))
        .collect()
}

fn unique_key(row: &Row, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|column| row.get(column).map(scalar_text).unwrap_or_default())
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{MemoryBackend, Operation};
    use crate::backend::{Backend, BackendError, Filter, Query, row_of};

    #[test]
    fn unknown_table_reports_undefined_relation() {
        let mut backend = MemoryBackend::new();
        let error = backend
            .select("topic_terms", &Query::columns("id").limit(1))
            .expect_err("table is missing");
        assert!(error.is_missing_table());
        assert_eq!(backend.request_count(), 1);
    }

    #[test]
    fn insert_generates_ids_and_select_projects_columns() {
        let mut backend = MemoryBackend::new();
        backend.create_table("tools");
        let inserted = backend
            .insert(
                "tools",
                &[row_of([("name", json!("Beta")), ("petrahubid", json!("beta"))]),
                  row_of([("name", json!("Alpha")), ("petrahubid", json!("alpha"))])],
            )
            .expect("insert");
        assert_eq!(inserted[0].get("id"), Some(&json!("1")));

        let rows = backend
            .select("tools", &Query::columns("id, name").order_by("name"))
            .expect("select");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&json!("Alpha")));
        assert!(rows[0].get("petrahubid").is_none());
    }

    #[test]
    fn unique_constraint_rejects_duplicates() {
        let mut backend = MemoryBackend::new();
        backend.create_table("os_options").add_unique("os_options", &["name"]);
        backend
            .insert("os_options", &[row_of([("name", json!("Linux"))])])
            .expect("first insert");
        let error = backend
            .insert("os_options", &[row_of([("name", json!("Linux"))])])
            .expect_err("duplicate");
        assert!(matches!(error, BackendError::Api { ref code, .. } if code == "23505"));
        assert_eq!(backend.rows("os_options").len(), 1);
    }

    #[test]
    fn preset_junctions_enforce_their_primary_key() {
        let mut backend = MemoryBackend::normalized_schema();
        let link = row_of([("tool_id", json!("1")), ("function_id", json!("9"))]);
        backend
            .insert("tool_functions", &[link.clone()])
            .expect("first link");
        let error = backend
            .insert("tool_functions", &[link])
            .expect_err("same pair twice");
        assert!(matches!(error, BackendError::Api { ref code, .. } if code == "23505"));

        let mut backend = MemoryBackend::legacy_schema();
        let link = row_of([("tool_id", json!("1")), ("term_id", json!("4"))]);
        assert!(backend
            .insert("tool_petrology_terms", &[link.clone(), link])
            .is_err());
        assert!(backend.rows("tool_petrology_terms").is_empty());
    }

    #[test]
    fn unfiltered_delete_is_rejected() {
        let mut backend = MemoryBackend::new();
        backend.create_junction("tool_os");
        let error = backend.delete("tool_os", &[]).expect_err("no filter");
        assert!(matches!(error, BackendError::UnfilteredWrite { .. }));
    }

    #[test]
    fn injected_failures_apply_per_operation() {
        let mut backend = MemoryBackend::new();
        backend
            .create_junction("tool_os")
            .fail_on("tool_os", Operation::Insert);
        assert!(backend
            .insert("tool_os", &[row_of([("tool_id", json!("1"))])])
            .is_err());
        assert!(backend
            .delete("tool_os", &[Filter::eq("tool_id", "1")])
            .is_ok());
    }
}
