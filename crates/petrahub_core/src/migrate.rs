use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;

use crate::backend::{Backend, Query, Row, row_id, row_str};
use crate::model::RelationKind;
use crate::options::{find_option_id, insert_option};
use crate::schema::{cell_values, check_table};

/// DDL for the normalized relation tables, executed manually in the
/// Supabase SQL editor. PostgREST cannot run DDL.
pub const NORMALIZED_SCHEMA_SQL: &str = include_str!("../sql/normalized_schema.sql");

/// Tables that must exist before data can be moved.
pub const REQUIRED_TABLES: [&str; 2] = ["topic_terms", "tool_topic_terms"];

struct MigrationStep {
    name: &'static str,
    kind: RelationKind,
}

const STEPS: &[MigrationStep] = &[
    MigrationStep {
        name: "topics",
        kind: RelationKind::Topic,
    },
    MigrationStep {
        name: "tool types",
        kind: RelationKind::ToolType,
    },
    MigrationStep {
        name: "functions",
        kind: RelationKind::Function,
    },
    MigrationStep {
        name: "operating systems",
        kind: RelationKind::OperatingSystem,
    },
    MigrationStep {
        name: "languages",
        kind: RelationKind::Language,
    },
    MigrationStep {
        name: "petrology terms",
        kind: RelationKind::PetrologyTerm,
    },
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepReport {
    pub name: String,
    pub source_rows: usize,
    pub unique_values: usize,
    pub values_inserted: usize,
    pub relations_created: usize,
    pub relations_existing: usize,
    pub errors: Vec<String>,
}

impl StepReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub steps: Vec<StepReport>,
    pub failed_step: Option<String>,
    pub failure: Option<String>,
    pub request_count: usize,
}

impl MigrationReport {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn row_errors(&self) -> usize {
        self.steps.iter().map(|step| step.errors.len()).sum()
    }
}

/// Required tables that do not answer a select.
pub fn missing_required_tables(backend: &mut dyn Backend) -> Vec<&'static str> {
    REQUIRED_TABLES
        .into_iter()
        .filter(|table| match check_table(backend, table) {
            Ok(()) => false,
            Err(error) => {
                tracing::debug!(table, %error, "required table check failed");
                true
            }
        })
        .collect()
}

/// Run every step in order, stopping at the first step whose source
/// cannot be read. Old tables are left untouched.
pub fn run_migration(backend: &mut dyn Backend) -> MigrationReport {
    let mut steps = Vec::new();
    let mut failed_step = None;
    let mut failure = None;

    for step in STEPS {
        let result = match step.kind {
            RelationKind::Topic => migrate_topics(backend),
            RelationKind::PetrologyTerm => check_petrology_terms(backend),
            kind => migrate_option_values(backend, kind),
        };
        match result {
            Ok(report) => {
                tracing::info!(
                    step = step.name,
                    values_inserted = report.values_inserted,
                    relations_created = report.relations_created,
                    errors = report.errors.len(),
                    "migration step completed"
                );
                steps.push(report);
            }
            Err(error) => {
                tracing::warn!(
                    step = step.name,
                    error = %format!("{error:#}"),
                    "migration step failed"
                );
                failed_step = Some(step.name.to_string());
                failure = Some(format!("{error:#}"));
                break;
            }
        }
    }

    MigrationReport {
        steps,
        failed_step,
        failure,
        request_count: backend.request_count(),
    }
}

/// Move flat `topics` rows into `topic_terms` plus `tool_topic_terms`.
pub fn migrate_topics(backend: &mut dyn Backend) -> Result<StepReport> {
    migrate_option_values(backend, RelationKind::Topic)
}

/// Copy a flat child table into its options table, then link every
/// `(value, tool_id)` row through the junction table unless the link
/// already exists. Array cells (legacy functions) are flattened and each
/// element keeps the row's note.
pub fn migrate_option_values(backend: &mut dyn Backend, kind: RelationKind) -> Result<StepReport> {
    let source = legacy_source(kind)?;
    let tables = kind.tables();
    let with_note = kind == RelationKind::Function;
    let mut report = StepReport::new(source);

    let columns = if with_note {
        format!("{}, note, tool_id", tables.value_column)
    } else {
        format!("{}, tool_id", tables.value_column)
    };
    let rows = backend
        .select(source, &Query::columns(&columns).order_by(tables.value_column))
        .with_context(|| format!("failed to read {source}"))?;
    report.source_rows = rows.len();

    let values: BTreeSet<String> = rows
        .iter()
        .flat_map(|row| row_values(row, tables.value_column))
        .collect();
    report.unique_values = values.len();

    let mut option_ids = BTreeMap::new();
    for value in &values {
        match resolve_or_insert(backend, kind, value, &mut report) {
            Ok(id) => {
                option_ids.insert(value.clone(), id);
            }
            Err(error) => report.errors.push(format!("{error:#}")),
        }
    }

    let mut seen = BTreeSet::new();
    for row in &rows {
        let Some(tool_id) = row_id(row, "tool_id") else {
            continue;
        };
        let note = row_str(row, "note")
            .map(str::trim)
            .filter(|note| with_note && !note.is_empty());
        for value in row_values(row, tables.value_column) {
            let Some(option_id) = option_ids.get(&value) else {
                report.errors.push(format!(
                    "no {kind} id for `{value}`; relation to tool {tool_id} skipped"
                ));
                continue;
            };
            if !seen.insert((tool_id.clone(), option_id.clone())) {
                continue;
            }

            let existing = backend.select(
                tables.junction_table,
                &Query::columns("tool_id")
                    .eq("tool_id", tool_id.as_str())
                    .eq(tables.junction_fk, option_id.as_str())
                    .limit(1),
            );
            match existing {
                Ok(found) if !found.is_empty() => {
                    report.relations_existing += 1;
                    continue;
                }
                Ok(_) => {}
                Err(error) => {
                    report.errors.push(format!(
                        "failed to check relation for tool {tool_id} and {kind} `{value}`: {error}"
                    ));
                    continue;
                }
            }

            let mut link = Row::new();
            link.insert("tool_id".to_string(), Value::String(tool_id.clone()));
            link.insert(tables.junction_fk.to_string(), Value::String(option_id.clone()));
            if with_note {
                let note = note.map(|text| Value::String(text.to_string()));
                link.insert("note".to_string(), note.unwrap_or(Value::Null));
            }
            match backend.insert(tables.junction_table, &[link]) {
                Ok(_) => report.relations_created += 1,
                Err(error) => report.errors.push(format!(
                    "failed to create relation for tool {tool_id} and {kind} `{value}`: {error}"
                )),
            }
        }
    }

    Ok(report)
}

fn row_values(row: &Row, column: &str) -> Vec<String> {
    cell_values(row.get(column))
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

/// Petrology terms have no flat predecessor; only confirm the tables.
pub fn check_petrology_terms(backend: &mut dyn Backend) -> Result<StepReport> {
    let tables = RelationKind::PetrologyTerm.tables();
    let mut report = StepReport::new(tables.options_table);

    backend
        .select(tables.options_table, &Query::columns("id").limit(1))
        .with_context(|| format!("{} table is not available", tables.options_table))?;
    let relations = backend
        .select(
            tables.junction_table,
            &Query::columns(tables.junction_fk).order_by(tables.junction_fk),
        )
        .with_context(|| format!("failed to read {}", tables.junction_table))?;
    report.source_rows = relations.len();
    report.relations_existing = relations.len();
    report.unique_values = relations
        .iter()
        .filter_map(|row| row_id(row, tables.junction_fk))
        .collect::<BTreeSet<_>>()
        .len();
    Ok(report)
}

fn legacy_source(kind: RelationKind) -> Result<&'static str> {
    match kind.tables().legacy_table {
        Some(table) => Ok(table),
        None => bail!("{kind} has no legacy table to migrate"),
    }
}

fn resolve_or_insert(
    backend: &mut dyn Backend,
    kind: RelationKind,
    value: &str,
    report: &mut StepReport,
) -> Result<String> {
    if let Some(id) = find_option_id(backend, kind, value)? {
        return Ok(id);
    }
    let id = insert_option(backend, kind, value)?;
    report.values_inserted += 1;
    Ok(id)
}
