use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Row, row_id, row_str};

pub const TOOLS_TABLE: &str = "tools";

/// Scalar columns of `tools` that can be overwritten, in display order.
pub const EDITABLE_FIELDS: &[&str] = &[
    "name",
    "description",
    "homepage",
    "version",
    "accessibility",
    "cost",
    "maturity",
    "license",
    "documentation",
    "citation",
    "support",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub name: String,
    pub petrahubid: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub accessibility: Option<String>,
    #[serde(default)]
    pub cost: Option<String>,
    #[serde(default)]
    pub maturity: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub citation: Option<String>,
    #[serde(default)]
    pub support: Option<String>,
}

impl ToolRecord {
    pub fn from_row(row: &Row) -> Self {
        let text = |column: &str| row_str(row, column).map(str::to_string);
        Self {
            name: text("name").unwrap_or_default(),
            petrahubid: text("petrahubid").unwrap_or_default(),
            description: text("description"),
            homepage: text("homepage"),
            version: text("version"),
            accessibility: text("accessibility"),
            cost: text("cost"),
            maturity: text("maturity"),
            license: text("license"),
            documentation: text("documentation"),
            citation: text("citation"),
            support: text("support"),
        }
    }

    /// Every scalar column, absent values written as null (full overwrite).
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("name".to_string(), Value::String(self.name.clone()));
        row.insert(
            "petrahubid".to_string(),
            Value::String(self.petrahubid.clone()),
        );
        for field in &EDITABLE_FIELDS[1..] {
            let value = self
                .field(field)
                .map(|text| Value::String(text.to_string()))
                .unwrap_or(Value::Null);
            row.insert((*field).to_string(), value);
        }
        row
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "name" => Some(self.name.as_str()),
            "petrahubid" => Some(self.petrahubid.as_str()),
            "description" => self.description.as_deref(),
            "homepage" => self.homepage.as_deref(),
            "version" => self.version.as_deref(),
            "accessibility" => self.accessibility.as_deref(),
            "cost" => self.cost.as_deref(),
            "maturity" => self.maturity.as_deref(),
            "license" => self.license.as_deref(),
            "documentation" => self.documentation.as_deref(),
            "citation" => self.citation.as_deref(),
            "support" => self.support.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredTool {
    pub id: String,
    #[serde(flatten)]
    pub record: ToolRecord,
}

impl StoredTool {
    pub fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row_id(row, "id")?,
            record: ToolRecord::from_row(row),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub operation: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl FunctionEntry {
    pub fn new(operation: &str, note: Option<&str>) -> Self {
        Self {
            operation: operation.to_string(),
            note: note.map(str::to_string),
        }
    }
}

/// A tool plus the option values it should be related to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInput {
    #[serde(flatten)]
    pub record: ToolRecord,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub operating_systems: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub tool_types: Vec<String>,
    #[serde(default)]
    pub functions: Vec<FunctionEntry>,
    #[serde(default)]
    pub petrology_terms: Vec<String>,
}

impl ToolInput {
    /// Relation values for `kind`, trimmed, non-empty and one per value.
    ///
    /// Junctions are keyed on `(tool_id, option id)`, so a function listed
    /// twice becomes one entry whose distinct notes are joined with `; `.
    pub fn relation_values(&self, kind: RelationKind) -> Vec<RelationValue> {
        let raw: Vec<RelationValue> = match kind {
            RelationKind::Topic => plain(&self.topics),
            RelationKind::OperatingSystem => plain(&self.operating_systems),
            RelationKind::Language => plain(&self.languages),
            RelationKind::ToolType => plain(&self.tool_types),
            RelationKind::PetrologyTerm => plain(&self.petrology_terms),
            RelationKind::Function => merged_functions(&self.functions),
        };

        let mut seen = std::collections::BTreeSet::new();
        raw.into_iter()
            .filter(|item| !item.value.is_empty())
            .filter(|item| seen.insert(item.value.clone()))
            .collect()
    }
}

fn merged_functions(entries: &[FunctionEntry]) -> Vec<RelationValue> {
    let mut merged: Vec<RelationValue> = Vec::new();
    for entry in entries {
        let value = entry.operation.trim();
        let note = entry
            .note
            .as_deref()
            .map(str::trim)
            .filter(|note| !note.is_empty());
        let Some(index) = merged.iter().position(|item| item.value == value) else {
            merged.push(RelationValue {
                value: value.to_string(),
                note: note.map(str::to_string),
            });
            continue;
        };
        let Some(note) = note else {
            continue;
        };
        match &mut merged[index].note {
            Some(existing) if existing.split("; ").any(|part| part == note) => {}
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(note);
            }
            slot => *slot = Some(note.to_string()),
        }
    }
    merged
}

fn plain(values: &[String]) -> Vec<RelationValue> {
    values
        .iter()
        .map(|value| RelationValue {
            value: value.trim().to_string(),
            note: None,
        })
        .collect()
}

/// One option value attached to a tool (functions carry a note).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct RelationValue {
    pub value: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Topic,
    OperatingSystem,
    Language,
    ToolType,
    Function,
    PetrologyTerm,
}

pub struct KindTables {
    pub value_column: &'static str,
    /// Flat child table holding `{value, tool_id}` rows in the legacy schema.
    pub legacy_table: Option<&'static str>,
    pub options_table: &'static str,
    pub junction_table: &'static str,
    pub junction_fk: &'static str,
}

impl RelationKind {
    pub const ALL: [RelationKind; 6] = [
        Self::Topic,
        Self::OperatingSystem,
        Self::Language,
        Self::ToolType,
        Self::Function,
        Self::PetrologyTerm,
    ];

    pub fn tables(self) -> KindTables {
        match self {
            Self::Topic => KindTables {
                value_column: "term",
                legacy_table: Some("topics"),
                options_table: "topic_terms",
                junction_table: "tool_topic_terms",
                junction_fk: "term_id",
            },
            Self::OperatingSystem => KindTables {
                value_column: "name",
                legacy_table: Some("operating_systems"),
                options_table: "os_options",
                junction_table: "tool_os",
                junction_fk: "os_id",
            },
            Self::Language => KindTables {
                value_column: "name",
                legacy_table: Some("languages"),
                options_table: "language_options",
                junction_table: "tool_language_relations",
                junction_fk: "language_id",
            },
            Self::ToolType => KindTables {
                value_column: "type",
                legacy_table: Some("tool_types"),
                options_table: "tool_type_options",
                junction_table: "tool_type_relations",
                junction_fk: "type_id",
            },
            Self::Function => KindTables {
                value_column: "operation",
                legacy_table: Some("functions"),
                options_table: "function_options",
                junction_table: "tool_functions",
                junction_fk: "function_id",
            },
            Self::PetrologyTerm => KindTables {
                value_column: "term",
                legacy_table: None,
                options_table: "petrology_terms",
                junction_table: "tool_petrology_terms",
                junction_fk: "term_id",
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::OperatingSystem => "operating-system",
            Self::Language => "language",
            Self::ToolType => "tool-type",
            Self::Function => "function",
            Self::PetrologyTerm => "petrology-term",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Topic => "Topics",
            Self::OperatingSystem => "Operating Systems",
            Self::Language => "Languages",
            Self::ToolType => "Tool Types",
            Self::Function => "Functions",
            Self::PetrologyTerm => "Petrology Terms",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        let kind = match normalized.as_str() {
            "topic" | "topics" | "term" | "terms" => Self::Topic,
            "os" | "operating-system" | "operating-systems" => Self::OperatingSystem,
            "language" | "languages" | "lang" => Self::Language,
            "tool-type" | "tool-types" | "type" => Self::ToolType,
            "function" | "functions" | "operation" => Self::Function,
            "petrology" | "petrology-term" | "petrology-terms" => Self::PetrologyTerm,
            _ => bail!(
                "unknown entity type `{value}` (expected topic, os, language, tool-type, function or petrology)"
            ),
        };
        Ok(kind)
    }
}

/// Full view of a tool with every relation category resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDetails {
    pub tool: StoredTool,
    pub topics: Vec<RelationValue>,
    pub operating_systems: Vec<RelationValue>,
    pub languages: Vec<RelationValue>,
    pub tool_types: Vec<RelationValue>,
    pub functions: Vec<RelationValue>,
    pub petrology_terms: Vec<RelationValue>,
}

impl ToolDetails {
    pub fn relation(&self, kind: RelationKind) -> &[RelationValue] {
        match kind {
            RelationKind::Topic => &self.topics,
            RelationKind::OperatingSystem => &self.operating_systems,
            RelationKind::Language => &self.languages,
            RelationKind::ToolType => &self.tool_types,
            RelationKind::Function => &self.functions,
            RelationKind::PetrologyTerm => &self.petrology_terms,
        }
    }

    pub fn relation_mut(&mut self, kind: RelationKind) -> &mut Vec<RelationValue> {
        match kind {
            RelationKind::Topic => &mut self.topics,
            RelationKind::OperatingSystem => &mut self.operating_systems,
            RelationKind::Language => &mut self.languages,
            RelationKind::ToolType => &mut self.tool_types,
            RelationKind::Function => &mut self.functions,
            RelationKind::PetrologyTerm => &mut self.petrology_terms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSummary {
    pub id: String,
    pub name: String,
    pub petrahubid: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FunctionEntry, RelationKind, ToolInput, ToolRecord};

    #[test]
    fn tool_input_parses_flattened_json() {
        let input: ToolInput = serde_json::from_value(json!({
            "name": "PetroSim",
            "petrahubid": "petrosim",
            "license": "MIT",
            "topics": ["Geochemistry", " Geochemistry ", ""],
            "functions": [{"operation": "Modelling", "note": "Phase equilibria"}]
        }))
        .expect("parse input");

        assert_eq!(input.record.license.as_deref(), Some("MIT"));
        let topics = input.relation_values(RelationKind::Topic);
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].value, "Geochemistry");
        let functions = input.relation_values(RelationKind::Function);
        assert_eq!(functions[0].note.as_deref(), Some("Phase equilibria"));
    }

    #[test]
    fn repeated_operation_merges_its_notes() {
        let input = ToolInput {
            functions: vec![
                FunctionEntry::new("Analysis", None),
                FunctionEntry::new("Analysis", Some("major elements")),
                FunctionEntry::new("Modelling", Some("phase equilibria")),
                FunctionEntry::new("Analysis", Some("trace elements")),
                FunctionEntry::new("Analysis", Some("major elements")),
            ],
            ..ToolInput::default()
        };
        let functions = input.relation_values(RelationKind::Function);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].value, "Analysis");
        assert_eq!(
            functions[0].note.as_deref(),
            Some("major elements; trace elements")
        );
        assert_eq!(functions[1].note.as_deref(), Some("phase equilibria"));
    }

    #[test]
    fn to_row_overwrites_absent_fields_with_null() {
        let record = ToolRecord {
            name: "GeoThermo".to_string(),
            petrahubid: "geothermo".to_string(),
            cost: Some("Free".to_string()),
            ..ToolRecord::default()
        };
        let row = record.to_row();
        assert_eq!(row.get("cost"), Some(&json!("Free")));
        assert_eq!(row.get("license"), Some(&json!(null)));
        assert_eq!(row.len(), 12);
    }

    #[test]
    fn relation_kind_parses_cli_aliases() {
        assert_eq!("os".parse::<RelationKind>().unwrap(), RelationKind::OperatingSystem);
        assert_eq!("Tool_Type".parse::<RelationKind>().unwrap(), RelationKind::ToolType);
        assert_eq!("operation".parse::<RelationKind>().unwrap(), RelationKind::Function);
        assert!("colour".parse::<RelationKind>().is_err());
    }
}
