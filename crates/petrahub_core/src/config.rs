use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::schema::SchemaMode;

pub const DEFAULT_USER_AGENT: &str = "petrahub/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

pub const URL_ENV_VARS: [&str; 3] = [
    "PUBLIC_SUPABASE_URL",
    "VITE_PUBLIC_SUPABASE_URL",
    "SUPABASE_URL",
];
pub const ANON_KEY_ENV_VARS: [&str; 3] = [
    "PUBLIC_SUPABASE_ANON_KEY",
    "VITE_PUBLIC_SUPABASE_ANON_KEY",
    "SUPABASE_ANON_KEY",
];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PetrahubConfig {
    #[serde(default)]
    pub backend: BackendSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BackendSection {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub schema: Option<SchemaMode>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub user_agent: Option<String>,
}

/// Fully resolved connection settings handed to the REST client.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub url: String,
    pub anon_key: String,
    pub schema: SchemaMode,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub user_agent: String,
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("url", &self.url)
            .field("anon_key", &mask_secret(&self.anon_key))
            .field("schema", &self.schema)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl BackendSettings {
    pub fn diagnostics(&self) -> String {
        format!(
            "backend_url={}\nanon_key={}\nschema={}\ntimeout_ms={}\nmax_retries={}\nretry_delay_ms={}\nuser_agent={}",
            self.url,
            mask_secret(&self.anon_key),
            self.schema.as_str(),
            self.timeout_ms,
            self.max_retries,
            self.retry_delay_ms,
            self.user_agent
        )
    }
}

/// Load and parse the config file. Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<PetrahubConfig> {
    if !config_path.exists() {
        return Ok(PetrahubConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: PetrahubConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn resolve_backend_settings(config: &PetrahubConfig) -> Result<BackendSettings> {
    resolve_backend_settings_with_lookup(config, |key| env::var(key).ok())
}

/// env > config > default, per field.
pub fn resolve_backend_settings_with_lookup<F>(
    config: &PetrahubConfig,
    lookup_env: F,
) -> Result<BackendSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let section = &config.backend;
    let lookup = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let first_of = |keys: &[&str]| keys.iter().find_map(|key| lookup(key));

    let Some(url) = first_of(&URL_ENV_VARS).or_else(|| non_empty(section.url.as_deref())) else {
        bail!(
            "backend URL is not configured; set one of {} or [backend].url",
            URL_ENV_VARS.join(", ")
        );
    };
    let Some(anon_key) =
        first_of(&ANON_KEY_ENV_VARS).or_else(|| non_empty(section.anon_key.as_deref()))
    else {
        bail!(
            "backend anon key is not configured; set one of {} or [backend].anon_key",
            ANON_KEY_ENV_VARS.join(", ")
        );
    };

    let schema = match lookup("PETRAHUB_SCHEMA") {
        Some(value) => value
            .parse::<SchemaMode>()
            .map_err(|error| anyhow::anyhow!("invalid PETRAHUB_SCHEMA: {error}"))?,
        None => section.schema.unwrap_or_default(),
    };
    let timeout_ms = parse_number(&lookup, "PETRAHUB_HTTP_TIMEOUT_MS")?
        .or(section.timeout_ms)
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    let max_retries = parse_number(&lookup, "PETRAHUB_HTTP_RETRIES")?
        .or(section.max_retries)
        .unwrap_or(DEFAULT_MAX_RETRIES);
    let retry_delay_ms = parse_number(&lookup, "PETRAHUB_HTTP_RETRY_DELAY_MS")?
        .or(section.retry_delay_ms)
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);
    let user_agent = lookup("PETRAHUB_USER_AGENT")
        .or_else(|| non_empty(section.user_agent.as_deref()))
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    if timeout_ms == 0 {
        bail!("HTTP timeout must be greater than zero");
    }

    Ok(BackendSettings {
        url,
        anon_key,
        schema,
        timeout_ms,
        max_retries,
        retry_delay_ms,
        user_agent,
    })
}

fn parse_number<T, L>(lookup: &L, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|error| anyhow::anyhow!("invalid {key} `{value}`: {error}")),
        None => Ok(None),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(6).collect();
    if secret.chars().count() <= 6 {
        "***".to_string()
    } else {
        format!("{visible}***")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    fn config_with_backend() -> PetrahubConfig {
        PetrahubConfig {
            backend: BackendSection {
                url: Some("https://config.supabase.co".to_string()),
                anon_key: Some("config-anon-key".to_string()),
                ..BackendSection::default()
            },
        }
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, PetrahubConfig::default());
    }

    #[test]
    fn load_config_parses_backend_section() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[backend]
url = "https://demo.supabase.co"
anon_key = "demo-key"
schema = "normalized"
timeout_ms = 5000
max_retries = 4
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.backend.url.as_deref(),
            Some("https://demo.supabase.co")
        );
        assert_eq!(config.backend.schema, Some(SchemaMode::Normalized));
        assert_eq!(config.backend.timeout_ms, Some(5000));
        assert_eq!(config.backend.max_retries, Some(4));
        assert!(config.backend.user_agent.is_none());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[backend\nurl = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_overrides_config_in_fallback_order() {
        let env = HashMap::from([
            ("VITE_PUBLIC_SUPABASE_URL", "https://vite.supabase.co"),
            ("SUPABASE_URL", "https://plain.supabase.co"),
            ("PUBLIC_SUPABASE_URL", "   "),
            ("SUPABASE_ANON_KEY", "env-key"),
            ("PETRAHUB_SCHEMA", "legacy"),
            ("PETRAHUB_HTTP_RETRIES", "0"),
        ]);
        let settings = resolve_backend_settings_with_lookup(&config_with_backend(), |key| {
            env.get(key).map(|value| value.to_string())
        })
        .expect("resolve");
        assert_eq!(settings.url, "https://vite.supabase.co");
        assert_eq!(settings.anon_key, "env-key");
        assert_eq!(settings.schema, SchemaMode::Legacy);
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn config_values_apply_without_env() {
        let settings = resolve_backend_settings_with_lookup(&config_with_backend(), |_| None)
            .expect("resolve");
        assert_eq!(settings.url, "https://config.supabase.co");
        assert_eq!(settings.anon_key, "config-anon-key");
        assert_eq!(settings.schema, SchemaMode::Auto);
    }

    #[test]
    fn missing_credentials_name_the_variables_tried() {
        let error = resolve_backend_settings_with_lookup(&PetrahubConfig::default(), |_| None)
            .expect_err("no url");
        let message = error.to_string();
        assert!(message.contains("PUBLIC_SUPABASE_URL"));
        assert!(message.contains("SUPABASE_URL"));

        let config = PetrahubConfig {
            backend: BackendSection {
                url: Some("https://demo.supabase.co".to_string()),
                ..BackendSection::default()
            },
        };
        let error = resolve_backend_settings_with_lookup(&config, |_| None).expect_err("no key");
        assert!(error.to_string().contains("SUPABASE_ANON_KEY"));
    }

    #[test]
    fn invalid_numeric_override_is_reported() {
        let error = resolve_backend_settings_with_lookup(&config_with_backend(), |key| {
            (key == "PETRAHUB_HTTP_TIMEOUT_MS").then(|| "soon".to_string())
        })
        .expect_err("bad number");
        assert!(error.to_string().contains("PETRAHUB_HTTP_TIMEOUT_MS"));
    }

    #[test]
    fn diagnostics_mask_the_anon_key() {
        let settings = resolve_backend_settings_with_lookup(&config_with_backend(), |_| None)
            .expect("resolve");
        let diagnostics = settings.diagnostics();
        assert!(diagnostics.contains("anon_key=config***"));
        assert!(!diagnostics.contains("config-anon-key"));
        assert!(!format!("{settings:?}").contains("config-anon-key"));
    }
}
