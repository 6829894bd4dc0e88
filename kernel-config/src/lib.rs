use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai";
pub const DEFAULT_ENV_KEY: &str = "TETHER_API_KEY";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_SUMMARY_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 1.0;
pub const DEFAULT_MAX_TOOL_RETRIES: u32 = 25;
pub const SETTINGS_PATH_ENV: &str = "TETHER_SETTINGS";
pub const BASE_URL_ENV: &str = "TETHER_BASE_URL";
pub const MODEL_ENV: &str = "TETHER_MODEL";

const PLACEHOLDER_API_KEYS: &[&str] = &[
    "<replace me>",
    "<your-api-key>",
    "your-api-key",
    "your_api_key_here",
    "sk-...",
];

const DEFAULT_VISION_MODELS: &[&str] = &["vision", "llama-4-scout", "llama-4-maverick"];

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub api_key: String,
    pub env_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: Option<u32>,
    pub custom_system_prompt: Option<String>,
    pub use_responses_api: bool,
    pub mcp_connectors: Vec<McpConnector>,
    pub tool_retry_enabled: bool,
    pub max_tool_retries: u32,
    pub reasoning_summary_enabled: bool,
    pub summary_model: String,
    pub vision_models: Vec<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            env_key: DEFAULT_ENV_KEY.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: None,
            custom_system_prompt: None,
            use_responses_api: false,
            mcp_connectors: Vec::new(),
            tool_retry_enabled: true,
            max_tool_retries: DEFAULT_MAX_TOOL_RETRIES,
            reasoning_summary_enabled: true,
            summary_model: DEFAULT_SUMMARY_MODEL.to_string(),
            vision_models: DEFAULT_VISION_MODELS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// A remote MCP server the provider connects to on the client's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConnector {
    pub server_label: String,
    pub server_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub require_approval: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ChatSettings {
    pub fn validate_api_key(&self) -> Result<(), ConfigError> {
        let trimmed = self.api_key.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::MissingApiKey(self.env_key.clone()));
        }
        let lowered = trimmed.to_ascii_lowercase();
        if PLACEHOLDER_API_KEYS.iter().any(|item| *item == lowered) {
            return Err(ConfigError::PlaceholderApiKey);
        }
        Ok(())
    }

    pub fn supports_vision(&self, model: &str) -> bool {
        let model = model.to_ascii_lowercase();
        self.vision_models
            .iter()
            .map(|pattern| pattern.trim().to_ascii_lowercase())
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| model.contains(&pattern))
    }

    /// Labels of enabled remote connectors, used to recognise provider-side MCP calls.
    pub fn remote_server_labels(&self) -> Vec<String> {
        self.active_connectors()
            .map(|connector| connector.server_label.clone())
            .collect()
    }

    pub fn active_connectors(&self) -> impl Iterator<Item = &McpConnector> {
        self.mcp_connectors
            .iter()
            .filter(|connector| connector.enabled && !connector.server_label.trim().is_empty())
    }

    pub fn effective_max_retries(&self) -> u32 {
        if self.tool_retry_enabled {
            self.max_tool_retries.min(DEFAULT_MAX_TOOL_RETRIES)
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SettingsOverrides {
    pub settings_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub env_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key is not configured; set '{0}' or add apiKey to the settings file")]
    MissingApiKey(String),
    #[error("API key is still the placeholder value; replace it with a real key")]
    PlaceholderApiKey,
    #[error("failed to read settings file {path}: {error}")]
    ReadSettings { path: String, error: std::io::Error },
    #[error("invalid settings file {path}: {error}")]
    ParseSettings {
        path: String,
        error: serde_json::Error,
    },
}

pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> ChatSettings;
}

#[derive(Debug, Clone)]
pub struct StaticSettings(pub ChatSettings);

impl SettingsProvider for StaticSettings {
    fn settings(&self) -> ChatSettings {
        self.0.clone()
    }
}

pub fn load_settings() -> Result<ChatSettings, ConfigError> {
    load_settings_with(SettingsOverrides::default())
}

/// File first, then environment, then explicit overrides.
pub fn load_settings_with(overrides: SettingsOverrides) -> Result<ChatSettings, ConfigError> {
    let settings_path = overrides
        .settings_path
        .clone()
        .or_else(|| env::var(SETTINGS_PATH_ENV).ok().map(PathBuf::from));
    let mut settings = match settings_path {
        Some(path) => read_settings_file(&path)?,
        None => ChatSettings::default(),
    };

    if let Some(env_key) = overrides.env_key {
        settings.env_key = env_key;
    }
    if let Ok(api_key) = env::var(&settings.env_key) {
        if !api_key.trim().is_empty() {
            settings.api_key = api_key;
        }
    }
    if let Some(base_url) = non_empty_env(BASE_URL_ENV) {
        settings.base_url = base_url;
    }
    if let Some(model) = non_empty_env(MODEL_ENV) {
        settings.model = model;
    }
    if let Some(base_url) = overrides.base_url {
        settings.base_url = base_url;
    }
    if let Some(model) = overrides.model {
        settings.model = model;
    }

    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<ChatSettings, ConfigError> {
    let shown = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|error| ConfigError::ReadSettings {
        path: shown.clone(),
        error,
    })?;
    debug!(path = %shown, "loaded settings file");
    serde_json::from_str::<ChatSettings>(&raw).map_err(|error| ConfigError::ParseSettings {
        path: shown,
        error,
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_settings_file_with_env_key_and_overrides() {
        let key = "TETHER_CONFIG_TEST_KEY";
        // SAFETY: test process owns this env var namespace.
        unsafe {
            env::set_var(key, "gsk-test-key");
        }

        let mut file = tempfile::NamedTempFile::new().expect("temp settings");
        write!(
            file,
            r#"{{"temperature":0.2,"useResponsesApi":true,"mcpConnectors":[{{"serverLabel":"gmail","serverUrl":"https://mcp.example.com"}}]}}"#
        )
        .expect("write settings");

        let settings = load_settings_with(SettingsOverrides {
            settings_path: Some(file.path().to_path_buf()),
            base_url: Some("https://example.com/openai".to_string()),
            model: Some("llama-test".to_string()),
            env_key: Some(key.to_string()),
        })
        .expect("load settings");

        assert_eq!(settings.api_key, "gsk-test-key");
        assert_eq!(settings.base_url, "https://example.com/openai");
        assert_eq!(settings.model, "llama-test");
        assert!(settings.use_responses_api);
        assert_eq!(settings.temperature, 0.2);
        assert_eq!(settings.remote_server_labels(), vec!["gmail".to_string()]);
        assert!(settings.tool_retry_enabled);

        // SAFETY: test process owns this env var namespace.
        unsafe {
            env::remove_var(key);
        }
    }

    #[test]
    fn rejects_missing_and_placeholder_keys() {
        let mut settings = ChatSettings::default();
        assert!(matches!(
            settings.validate_api_key(),
            Err(ConfigError::MissingApiKey(_))
        ));

        settings.api_key = "<replace me>".to_string();
        assert!(matches!(
            settings.validate_api_key(),
            Err(ConfigError::PlaceholderApiKey)
        ));

        settings.api_key = "gsk-live".to_string();
        assert!(settings.validate_api_key().is_ok());
    }

    #[test]
    fn malformed_settings_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().expect("temp settings");
        write!(file, "{{not json").expect("write settings");
        let error = load_settings_with(SettingsOverrides {
            settings_path: Some(file.path().to_path_buf()),
            env_key: Some("TETHER_CONFIG_UNSET_KEY".to_string()),
            ..SettingsOverrides::default()
        })
        .expect_err("parse should fail");
        assert!(matches!(error, ConfigError::ParseSettings { .. }));
    }

    #[test]
    fn missing_settings_file_names_its_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent.json");
        let error = read_settings_file(&path).expect_err("read should fail");
        match error {
            ConfigError::ReadSettings { path: shown, .. } => {
                assert_eq!(shown, path.display().to_string());
            }
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[test]
    fn vision_support_matches_configured_patterns() {
        let settings = ChatSettings::default();
        assert!(settings.supports_vision("meta-llama/llama-4-scout-17b-16e-instruct"));
        assert!(!settings.supports_vision("llama-3.3-70b-versatile"));
    }

    #[test]
    fn disabled_retry_and_connectors_are_respected() {
        let settings = ChatSettings {
            tool_retry_enabled: false,
            mcp_connectors: vec![McpConnector {
                server_label: "drive".to_string(),
                server_url: "https://mcp.example.com".to_string(),
                enabled: false,
                ..McpConnector::default()
            }],
            ..ChatSettings::default()
        };
        assert_eq!(settings.effective_max_retries(), 0);
        assert!(settings.remote_server_labels().is_empty());
    }
}
