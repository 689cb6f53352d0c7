use serde_json::{Map, Value};
use thiserror::Error;

/// A single backend row as returned by the REST layer.
pub type Row = Map<String, Value>;

/// PostgreSQL "undefined table" error code.
pub const UNDEFINED_TABLE_CODE: &str = "42P01";
/// PostgREST "table not found in schema cache" error code.
pub const SCHEMA_CACHE_MISS_CODE: &str = "PGRST205";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend error [{code}] (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("failed to decode backend response for {table}: {source}")]
    Decode {
        table: String,
        source: serde_json::Error,
    },

    #[error("refusing to {operation} every row of {table} without a filter")]
    UnfilteredWrite {
        operation: &'static str,
        table: String,
    },

    #[error("invalid backend URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("injected failure for {operation} on {table}")]
    Injected {
        operation: &'static str,
        table: String,
    },
}

impl BackendError {
    /// True when the backend reported that the table does not exist.
    pub fn is_missing_table(&self) -> bool {
        matches!(
            self,
            Self::Api { code, .. } if code == UNDEFINED_TABLE_CODE || code == SCHEMA_CACHE_MISS_CODE
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::Eq(column.to_string(), value.into())
    }

    pub fn one_of(column: &str, values: Vec<Value>) -> Self {
        Self::In(column.to_string(), values)
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq(column, _) | Self::In(column, _) => column,
        }
    }

    /// Render as a PostgREST operator expression (`eq.x`, `in.(a,b)`).
    pub fn to_operator(&self) -> String {
        match self {
            Self::Eq(_, value) => format!("eq.{}", scalar_text(value)),
            Self::In(_, values) => {
                let items = values
                    .iter()
                    .map(|value| quote_list_item(&scalar_text(value)))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("in.({items})")
            }
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(column, expected) => row
                .get(column)
                .is_some_and(|actual| scalar_text(actual) == scalar_text(expected)),
            Self::In(column, expected) => row.get(column).is_some_and(|actual| {
                let actual = scalar_text(actual);
                expected.iter().any(|value| scalar_text(value) == actual)
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<String>,
    pub limit: Option<usize>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }
}

impl Query {
    pub fn columns(columns: &str) -> Self {
        Self {
            columns: columns.to_string(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order = Some(column.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Table-level access to the hosted store.
///
/// Every call is one request/response round trip. Implementations must
/// reject `update`/`delete` without filters.
pub trait Backend {
    fn select(&mut self, table: &str, query: &Query) -> Result<Vec<Row>, BackendError>;
    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<Vec<Row>, BackendError>;
    fn update(
        &mut self,
        table: &str,
        filters: &[Filter],
        changes: &Row,
    ) -> Result<Vec<Row>, BackendError>;
    fn delete(&mut self, table: &str, filters: &[Filter]) -> Result<usize, BackendError>;
    fn request_count(&self) -> usize;
}

/// Text form of a scalar JSON value, used for filter comparison and ids.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Read an id-like column (string or number) as a string.
pub fn row_id(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn row_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

pub fn row_of<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn quote_list_item(text: &str) -> String {
    if text
        .chars()
        .any(|ch| matches!(ch, ',' | '(' | ')' | '"' | '\\') || ch.is_whitespace())
    {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text.to_string()
    }
}
