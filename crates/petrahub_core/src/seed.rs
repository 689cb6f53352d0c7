use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::catalog::{DeleteReport, UpsertOptions, UpsertReport, delete_tool, upsert_tool};
use crate::model::ToolInput;
use crate::schema::RelationStore;

const SAMPLE_TOOLS_JSON: &str = include_str!("../data/sample_tools.json");

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedDocument {
    Many(Vec<ToolInput>),
    One(Box<ToolInput>),
}

/// The bundled sample catalog.
pub fn sample_tools() -> Result<Vec<ToolInput>> {
    parse_seed(SAMPLE_TOOLS_JSON, "bundled sample tools")
}

/// Read a seed file holding one tool object or an array of them.
pub fn load_seed_file(path: &Path) -> Result<Vec<ToolInput>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_seed(&content, &path.display().to_string())
}

pub fn parse_seed(content: &str, origin: &str) -> Result<Vec<ToolInput>> {
    let document: SeedDocument =
        serde_json::from_str(content).with_context(|| format!("failed to parse {origin}"))?;
    let tools = match document {
        SeedDocument::Many(tools) => tools,
        SeedDocument::One(tool) => vec![*tool],
    };

    let mut seen = BTreeSet::new();
    for tool in &tools {
        let id = tool.record.petrahubid.trim();
        if id.is_empty() {
            bail!("{origin}: tool `{}` has no petrahubid", tool.record.name);
        }
        if !seen.insert(id.to_string()) {
            bail!("{origin}: petrahubid `{id}` appears more than once");
        }
    }
    Ok(tools)
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedFailure {
    pub petrahubid: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub upserts: Vec<UpsertReport>,
    pub failures: Vec<SeedFailure>,
}

impl SeedReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.upserts.iter().all(UpsertReport::success)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnseedReport {
    pub deletes: Vec<DeleteReport>,
    pub failures: Vec<SeedFailure>,
}

impl UnseedReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.deletes.iter().all(|report| report.relation_errors() == 0)
    }
}

/// Upsert every tool; a failing tool is recorded and the rest still run.
pub fn seed_tools(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    tools: &[ToolInput],
    options: &UpsertOptions,
) -> SeedReport {
    let mut report = SeedReport::default();
    for tool in tools {
        match upsert_tool(backend, store, tool, options) {
            Ok(upsert) => report.upserts.push(upsert),
            Err(error) => {
                let message = format!("{error:#}");
                tracing::warn!(
                    petrahubid = %tool.record.petrahubid,
                    error = %message,
                    "seed upsert failed"
                );
                report.failures.push(SeedFailure {
                    petrahubid: tool.record.petrahubid.clone(),
                    error: message,
                });
            }
        }
    }
    report
}

/// Delete every tool of the seed set by `petrahubid`.
pub fn unseed_tools(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    tools: &[ToolInput],
) -> UnseedReport {
    let mut report = UnseedReport::default();
    for tool in tools {
        let petrahubid = tool.record.petrahubid.trim();
        match delete_tool(backend, store, petrahubid) {
            Ok(deleted) => report.deletes.push(deleted),
            Err(error) => report.failures.push(SeedFailure {
                petrahubid: petrahubid.to_string(),
                error: format!("{error:#}"),
            }),
        }
    }
    report
}
