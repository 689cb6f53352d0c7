use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;

use crate::backend::{Backend, Filter, Query, Row, row_id, row_str};
use crate::model::{
    EDITABLE_FIELDS, RelationKind, StoredTool, TOOLS_TABLE, ToolDetails, ToolInput, ToolSummary,
};
use crate::schema::{RelationStore, SchemaGeneration};

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    /// Leave an existing tool untouched instead of overwriting it.
    pub skip_updates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
    Skipped,
}

impl UpsertAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryOutcome {
    pub kind: RelationKind,
    pub table: String,
    /// Rows removed before re-inserting (updates only).
    pub cleared: Option<usize>,
    pub clear_error: Option<String>,
    pub requested: usize,
    pub inserted: usize,
    pub error: Option<String>,
}

impl CategoryOutcome {
    pub fn is_ok(&self) -> bool {
        self.clear_error.is_none() && self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertReport {
    pub petrahubid: String,
    pub tool_id: String,
    pub action: UpsertAction,
    pub schema: SchemaGeneration,
    pub categories: Vec<CategoryOutcome>,
    pub request_count: usize,
}

impl UpsertReport {
    pub fn success(&self) -> bool {
        self.categories.iter().all(CategoryOutcome::is_ok)
    }

    /// An update whose clear step failed may have left duplicate relations.
    pub fn stale_relations_possible(&self) -> bool {
        self.action == UpsertAction::Updated
            && self
                .categories
                .iter()
                .any(|outcome| outcome.clear_error.is_some() && outcome.inserted > 0)
    }

    pub fn errors(&self) -> Vec<String> {
        self.categories
            .iter()
            .flat_map(|outcome| {
                outcome
                    .clear_error
                    .iter()
                    .chain(outcome.error.iter())
                    .map(move |error| format!("{}: {error}", outcome.kind))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableCleanup {
    pub table: String,
    pub deleted: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    AlreadyMissing,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub petrahubid: String,
    pub tool_id: Option<String>,
    pub status: DeleteStatus,
    pub relations: Vec<TableCleanup>,
    pub request_count: usize,
}

impl DeleteReport {
    pub fn relation_errors(&self) -> usize {
        self.relations
            .iter()
            .filter(|cleanup| cleanup.error.is_some())
            .count()
    }
}

/// Connection check: a one-row select against `tools`.
pub fn test_connection(backend: &mut dyn Backend) -> Result<()> {
    backend
        .select(TOOLS_TABLE, &Query::columns("*").limit(1))
        .context("failed to reach the tools table")?;
    Ok(())
}

/// Column names of one sample `tools` row, or `None` when the table is empty.
pub fn sample_tool_columns(backend: &mut dyn Backend) -> Result<Option<Vec<String>>> {
    let rows = backend
        .select(TOOLS_TABLE, &Query::columns("*").limit(1))
        .context("failed to fetch a sample tools row")?;
    Ok(rows.first().map(|row| row.keys().cloned().collect()))
}

pub fn list_tools(backend: &mut dyn Backend) -> Result<Vec<ToolSummary>> {
    let rows = backend
        .select(
            TOOLS_TABLE,
            &Query::columns("id, name, petrahubid").order_by("name"),
        )
        .context("failed to fetch tools")?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            Some(ToolSummary {
                id: row_id(row, "id")?,
                name: row_str(row, "name").unwrap_or_default().to_string(),
                petrahubid: row_str(row, "petrahubid").unwrap_or_default().to_string(),
            })
        })
        .collect())
}

pub fn find_tool(backend: &mut dyn Backend, petrahubid: &str) -> Result<Option<StoredTool>> {
    find_tool_by(backend, "petrahubid", petrahubid)
}

pub fn find_tool_by_id(backend: &mut dyn Backend, tool_id: &str) -> Result<Option<StoredTool>> {
    find_tool_by(backend, "id", tool_id)
}

fn find_tool_by(
    backend: &mut dyn Backend,
    column: &str,
    value: &str,
) -> Result<Option<StoredTool>> {
    let rows = backend
        .select(TOOLS_TABLE, &Query::default().eq(column, value).limit(1))
        .with_context(|| format!("failed to look up tool with {column} {value}"))?;
    Ok(rows.first().and_then(StoredTool::from_row))
}

/// Scalar record plus every relation category. Unreadable categories are
/// logged and left empty.
pub fn get_tool_details(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    tool_id: &str,
) -> Result<Option<ToolDetails>> {
    let Some(tool) = find_tool_by_id(backend, tool_id)? else {
        return Ok(None);
    };
    let mut details = ToolDetails {
        tool,
        topics: Vec::new(),
        operating_systems: Vec::new(),
        languages: Vec::new(),
        tool_types: Vec::new(),
        functions: Vec::new(),
        petrology_terms: Vec::new(),
    };
    for kind in RelationKind::ALL {
        match store.load(backend, kind, tool_id) {
            Ok(values) => *details.relation_mut(kind) = values,
            Err(error) => {
                tracing::warn!(
                    %kind,
                    tool_id,
                    error = %format!("{error:#}"),
                    "could not load relations"
                );
            }
        }
    }
    Ok(Some(details))
}

/// Partial update of editable scalar fields. Empty values are rejected.
pub fn update_tool_fields(
    backend: &mut dyn Backend,
    tool_id: &str,
    changes: &[(String, String)],
) -> Result<usize> {
    if changes.is_empty() {
        bail!("no fields to update");
    }
    let mut row = Row::new();
    for (field, value) in changes {
        if !EDITABLE_FIELDS.contains(&field.as_str()) {
            bail!(
                "`{field}` is not an editable field (expected one of: {})",
                EDITABLE_FIELDS.join(", ")
            );
        }
        let value = value.trim();
        if value.is_empty() {
            bail!("new value for `{field}` cannot be empty");
        }
        row.insert(field.clone(), Value::String(value.to_string()));
    }
    let updated = backend
        .update(TOOLS_TABLE, &[Filter::eq("id", tool_id)], &row)
        .with_context(|| format!("failed to update tool {tool_id}"))?;
    Ok(updated.len())
}

/// Create or overwrite a tool by `petrahubid`, then rebuild its relations.
///
/// Not atomic. Each relation category is cleared and written on its own;
/// a failing category is recorded in the report and the next one runs.
pub fn upsert_tool(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    input: &ToolInput,
    options: &UpsertOptions,
) -> Result<UpsertReport> {
    let petrahubid = input.record.petrahubid.trim();
    if petrahubid.is_empty() {
        bail!("tool `{}` has no petrahubid", input.record.name);
    }
    if input.record.name.trim().is_empty() {
        bail!("tool {petrahubid} has no name");
    }
    let start_requests = backend.request_count();

    let existing = find_tool(backend, petrahubid)?;
    let (tool_id, action) = match existing {
        Some(tool) if options.skip_updates => {
            tracing::info!(petrahubid, "tool exists; skipping update");
            return Ok(UpsertReport {
                petrahubid: petrahubid.to_string(),
                tool_id: tool.id,
                action: UpsertAction::Skipped,
                schema: store.generation(),
                categories: Vec::new(),
                request_count: backend.request_count() - start_requests,
            });
        }
        Some(tool) => {
            backend
                .update(
                    TOOLS_TABLE,
                    &[Filter::eq("id", tool.id.as_str())],
                    &input.record.to_row(),
                )
                .with_context(|| format!("failed to update tool {petrahubid}"))?;
            (tool.id, UpsertAction::Updated)
        }
        None => {
            let inserted = backend
                .insert(TOOLS_TABLE, &[input.record.to_row()])
                .with_context(|| format!("failed to insert tool {petrahubid}"))?;
            let tool_id = match inserted.first().and_then(|row| row_id(row, "id")) {
                Some(id) => id,
                None => find_tool(backend, petrahubid)?
                    .map(|tool| tool.id)
                    .ok_or_else(|| {
                        anyhow::anyhow!("tool {petrahubid} was inserted but could not be read back")
                    })?,
            };
            (tool_id, UpsertAction::Created)
        }
    };

    let mut categories = Vec::with_capacity(RelationKind::ALL.len());
    for kind in RelationKind::ALL {
        let values = input.relation_values(kind);
        let mut outcome = CategoryOutcome {
            kind,
            table: store.relation_table(kind).to_string(),
            cleared: None,
            clear_error: None,
            requested: values.len(),
            inserted: 0,
            error: None,
        };

        if action == UpsertAction::Updated {
            match store.clear(backend, kind, &tool_id) {
                Ok(count) => outcome.cleared = Some(count),
                Err(error) => {
                    let message = format!("{error:#}");
                    tracing::warn!(
                        %kind,
                        petrahubid,
                        error = %message,
                        "failed to clear relations"
                    );
                    outcome.clear_error = Some(message);
                }
            }
        }

        match store.attach(backend, kind, &tool_id, &values) {
            Ok(count) => outcome.inserted = count,
            Err(error) => {
                let message = format!("{error:#}");
                tracing::warn!(%kind, petrahubid, error = %message, "failed to attach relations");
                outcome.error = Some(message);
            }
        }
        categories.push(outcome);
    }

    Ok(UpsertReport {
        petrahubid: petrahubid.to_string(),
        tool_id,
        action,
        schema: store.generation(),
        categories,
        request_count: backend.request_count() - start_requests,
    })
}

/// Delete a tool by `petrahubid`, removing its relation rows first.
pub fn delete_tool(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    petrahubid: &str,
) -> Result<DeleteReport> {
    let start_requests = backend.request_count();
    let Some(tool) = find_tool(backend, petrahubid)? else {
        tracing::info!(petrahubid, "tool not found; nothing to delete");
        return Ok(DeleteReport {
            petrahubid: petrahubid.to_string(),
            tool_id: None,
            status: DeleteStatus::AlreadyMissing,
            relations: Vec::new(),
            request_count: backend.request_count() - start_requests,
        });
    };
    delete_tool_by_id(backend, store, petrahubid, &tool.id, start_requests)
}

fn delete_tool_by_id(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    petrahubid: &str,
    tool_id: &str,
    start_requests: usize,
) -> Result<DeleteReport> {
    let mut relations = Vec::with_capacity(RelationKind::ALL.len());
    for kind in RelationKind::ALL {
        let table = store.relation_table(kind).to_string();
        match store.clear(backend, kind, tool_id) {
            Ok(deleted) => relations.push(TableCleanup {
                table,
                deleted,
                error: None,
            }),
            Err(error) => {
                let message = format!("{error:#}");
                tracing::warn!(%kind, petrahubid, error = %message, "failed to delete relations");
                relations.push(TableCleanup {
                    table,
                    deleted: 0,
                    error: Some(message),
                });
            }
        }
    }

    if store.generation() == SchemaGeneration::Normalized {
        relations.extend(clear_leftover_legacy_rows(backend, petrahubid, tool_id));
    }

    backend
        .delete(TOOLS_TABLE, &[Filter::eq("id", tool_id)])
        .with_context(|| format!("failed to delete tool {petrahubid}"))?;

    Ok(DeleteReport {
        petrahubid: petrahubid.to_string(),
        tool_id: Some(tool_id.to_string()),
        status: DeleteStatus::Deleted,
        relations,
        request_count: backend.request_count() - start_requests,
    })
}

/// Flat child tables kept after a migration still reference the tool.
/// Tables that no longer exist are skipped.
fn clear_leftover_legacy_rows(
    backend: &mut dyn Backend,
    petrahubid: &str,
    tool_id: &str,
) -> Vec<TableCleanup> {
    let mut cleanups = Vec::new();
    for kind in RelationKind::ALL {
        let Some(table) = kind.tables().legacy_table else {
            continue;
        };
        match backend.delete(table, &[Filter::eq("tool_id", tool_id)]) {
            Ok(deleted) => cleanups.push(TableCleanup {
                table: table.to_string(),
                deleted,
                error: None,
            }),
            Err(error) if error.is_missing_table() => {}
            Err(error) => {
                tracing::warn!(table, petrahubid, %error, "failed to delete legacy relations");
                cleanups.push(TableCleanup {
                    table: table.to_string(),
                    deleted: 0,
                    error: Some(error.to_string()),
                });
            }
        }
    }
    cleanups
}
