use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;

use crate::backend::{Backend, Query, Row, row_id};
use crate::model::RelationKind;
use crate::schema::RelationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Added,
    AlreadyExists,
}

/// Look up the id of `value` in the options table of `kind`.
pub fn find_option_id(
    backend: &mut dyn Backend,
    kind: RelationKind,
    value: &str,
) -> Result<Option<String>> {
    let tables = kind.tables();
    let rows = backend
        .select(
            tables.options_table,
            &Query::columns("id")
                .eq(tables.value_column, value)
                .limit(1),
        )
        .with_context(|| format!("failed to look up {kind} `{value}`"))?;
    Ok(rows.first().and_then(|row| row_id(row, "id")))
}

/// Return the id of `value`, inserting it into the options table first
/// when it is missing. Existing values are never inserted twice.
pub fn ensure_option(backend: &mut dyn Backend, kind: RelationKind, value: &str) -> Result<String> {
    if let Some(id) = find_option_id(backend, kind, value)? {
        return Ok(id);
    }
    insert_option(backend, kind, value)
}

/// Insert `value` into the options table of `kind` and return its id.
pub fn insert_option(backend: &mut dyn Backend, kind: RelationKind, value: &str) -> Result<String> {
    let tables = kind.tables();
    let mut row = Row::new();
    row.insert(
        tables.value_column.to_string(),
        Value::String(value.to_string()),
    );
    let inserted = backend
        .insert(tables.options_table, &[row])
        .with_context(|| format!("failed to add {kind} `{value}` to {}", tables.options_table))?;
    tracing::debug!(%kind, value, table = tables.options_table, "created option value");

    match inserted.first().and_then(|row| row_id(row, "id")) {
        Some(id) => Ok(id),
        None => find_option_id(backend, kind, value)?.ok_or_else(|| {
            anyhow::anyhow!("{kind} `{value}` was inserted but could not be read back")
        }),
    }
}

/// Known values for `kind`, sorted and without duplicates.
pub fn list_options(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    kind: RelationKind,
) -> Result<Vec<String>> {
    store
        .list_values(backend, kind)
        .with_context(|| format!("failed to list {kind} values"))
}

pub fn add_option(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    kind: RelationKind,
    value: &str,
) -> Result<AddOutcome> {
    let value = value.trim();
    if value.is_empty() {
        bail!("{kind} value cannot be empty");
    }
    let existing = list_options(backend, store, kind)?;
    if existing.iter().any(|item| item == value) {
        tracing::info!(%kind, value, "value already exists");
        return Ok(AddOutcome::AlreadyExists);
    }
    store
        .add_value(backend, kind, value)
        .with_context(|| format!("failed to add {kind} `{value}`"))?;
    Ok(AddOutcome::Added)
}
