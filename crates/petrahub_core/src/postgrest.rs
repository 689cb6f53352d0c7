use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::backend::{Backend, BackendError, Filter, Query, Row};
use crate::config::BackendSettings;

const REST_PATH: &str = "rest/v1/";

/// Blocking client for a PostgREST data API (Supabase `rest/v1`).
pub struct RestClient {
    client: Client,
    base_url: Url,
    settings: BackendSettings,
    request_count: usize,
}

impl RestClient {
    pub fn new(settings: BackendSettings) -> Result<Self, BackendError> {
        let base_url = rest_base_url(&settings.url)?;
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            base_url,
            settings,
            request_count: 0,
        })
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    fn table_url(&self, table: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(table)
            .map_err(|error| BackendError::InvalidUrl {
                url: format!("{}{table}", self.base_url),
                reason: error.to_string(),
            })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", self.settings.anon_key.as_str())
            .bearer_auth(self.settings.anon_key.as_str())
            .header("Accept", "application/json")
    }

    /// Reads are retried on transient failures; writes are sent once.
    fn send(
        &mut self,
        table: &str,
        build: impl Fn(&Client) -> RequestBuilder,
        retryable: bool,
    ) -> Result<Response, BackendError> {
        let max_retries = if retryable {
            self.settings.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            self.request_count += 1;
            let request = self.authorize(build(&self.client));
            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempt < max_retries && is_retryable_status(status) {
                        tracing::debug!(table, %status, attempt, "retrying backend request");
                        self.wait_before_retry(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(api_error(status, response));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        tracing::debug!(table, %error, attempt, "retrying backend request");
                        self.wait_before_retry(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(BackendError::Http(error));
                }
            }
        }
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .settings
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl Backend for RestClient {
    fn select(&mut self, table: &str, query: &Query) -> Result<Vec<Row>, BackendError> {
        let url = self.table_url(table)?;
        let params = select_params(query);
        let response = self.send(table, |client| client.get(url.clone()).query(&params), true)?;
        decode_rows(table, response)
    }

    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<Vec<Row>, BackendError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(table)?;
        let response = self.send(
            table,
            |client| {
                client
                    .post(url.clone())
                    .header("Prefer", "return=representation")
                    .json(rows)
            },
            false,
        )?;
        decode_rows(table, response)
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
        let url = self.table_url(table)?;
        let params = filter_params(filters);
        let response = self.send(
            table,
            |client| {
                client
                    .patch(url.clone())
                    .query(&params)
                    .header("Prefer", "return=representation")
                    .json(changes)
            },
            false,
        )?;
        decode_rows(table, response)
    }

    fn delete(&mut self, table: &str, filters: &[Filter]) -> Result<usize, BackendError> {
        if filters.is_empty() {
            return Err(BackendError::UnfilteredWrite {
                operation: "delete",
                table: table.to_string(),
            });
        }
        let url = self.table_url(table)?;
        let params = filter_params(filters);
        let response = self.send(
            table,
            |client| {
                client
                    .delete(url.clone())
                    .query(&params)
                    .header("Prefer", "return=representation")
            },
            false,
        )?;
        Ok(decode_rows(table, response)?.len())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// `https://x.supabase.co` → `https://x.supabase.co/rest/v1/`.
pub fn rest_base_url(raw: &str) -> Result<Url, BackendError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let invalid = |reason: String| BackendError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let base = if trimmed.ends_with("/rest/v1") {
        format!("{trimmed}/")
    } else {
        format!("{trimmed}/{REST_PATH}")
    };
    let url = Url::parse(&base).map_err(|error| invalid(error.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    Ok(url)
}

pub fn select_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), compact_columns(&query.columns))];
    params.extend(filter_params(&query.filters));
    if let Some(order) = &query.order {
        params.push(("order".to_string(), format!("{order}.asc")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| (filter.column().to_string(), filter.to_operator()))
        .collect()
}

fn compact_columns(columns: &str) -> String {
    let compact: String = columns.chars().filter(|ch| !ch.is_whitespace()).collect();
    if compact.is_empty() {
        "*".to_string()
    } else {
        compact
    }
}

fn decode_rows(table: &str, response: Response) -> Result<Vec<Row>, BackendError> {
    let body = response.text()?;
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let payload: Value = serde_json::from_str(&body).map_err(|source| BackendError::Decode {
        table: table.to_string(),
        source,
    })?;
    Ok(match payload {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect(),
        Value::Object(row) => vec![row],
        _ => Vec::new(),
    })
}

#[derive(Debug, Deserialize, Default)]
struct ErrorPayload {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

fn api_error(status: StatusCode, response: Response) -> BackendError {
    let body = response.text().unwrap_or_default();
    parse_api_error(status, &body)
}

pub fn parse_api_error(status: StatusCode, body: &str) -> BackendError {
    let payload: ErrorPayload = serde_json::from_str(body).unwrap_or_default();
    let mut message = payload
        .message
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    if let Some(details) = payload.details.filter(|value| !value.is_empty()) {
        message.push_str(&format!(" ({details})"));
    }
    if let Some(hint) = payload.hint.filter(|value| !value.is_empty()) {
        message.push_str(&format!(" hint: {hint}"));
    }
    BackendError::Api {
        status: status.as_u16(),
        code: payload.code.unwrap_or_else(|| "unknown".to_string()),
        message,
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{parse_api_error, rest_base_url, select_params};
    use crate::backend::{BackendError, Query};

    #[test]
    fn base_url_gains_rest_path_once() {
        assert_eq!(
            rest_base_url("https://demo.supabase.co").unwrap().as_str(),
            "https://demo.supabase.co/rest/v1/"
        );
        assert_eq!(
            rest_base_url("https://demo.supabase.co/rest/v1/").unwrap().as_str(),
            "https://demo.supabase.co/rest/v1/"
        );
        assert_eq!(
            rest_base_url("https://demo.supabase.co/rest/v1")
                .unwrap()
                .join("tools")
                .unwrap()
                .as_str(),
            "https://demo.supabase.co/rest/v1/tools"
        );
    }

    #[test]
    fn base_url_rejects_non_http_schemes() {
        assert!(rest_base_url("ftp://demo.example").is_err());
        assert!(rest_base_url("not a url").is_err());
    }

    #[test]
    fn select_params_follow_postgrest_conventions() {
        let query = Query::columns("id, name, petrahubid")
            .eq("petrahubid", "petrosim")
            .order_by("name")
            .limit(1);
        let params = select_params(&query);
        assert_eq!(
            params,
            vec![
                ("select".to_string(), "id,name,petrahubid".to_string()),
                ("petrahubid".to_string(), "eq.petrosim".to_string()),
                ("order".to_string(), "name.asc".to_string()),
                ("limit".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn api_error_body_is_decoded() {
        let error = parse_api_error(
            StatusCode::NOT_FOUND,
            r#"{"code":"42P01","message":"relation \"public.topic_terms\" does not exist","details":null,"hint":null}"#,
        );
        assert!(error.is_missing_table());
        match error {
            BackendError::Api { status, message, .. } => {
                assert_eq!(status, 404);
                assert!(message.contains("topic_terms"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unparseable_error_body_falls_back_to_status_text() {
        let error = parse_api_error(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert_eq!(
            error.to_string(),
            "backend error [unknown] (HTTP 502): Bad Gateway"
        );
    }
}
