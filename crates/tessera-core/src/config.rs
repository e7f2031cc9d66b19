use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Model used by nodes that do not name one.
    #[serde(default)]
    pub model: ModelConfig,
    /// Named models that nodes can select with their `model` field.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Scheduler and node execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model steps a single node may take before it fails.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Upper bound for any one activity (model step or tool call).
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            activity_timeout_secs: default_activity_timeout(),
        }
    }
}

fn default_max_steps() -> usize { 10 }
fn default_activity_timeout() -> u64 { 600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_model_id() -> String { "claude-sonnet-4-20250514".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

/// Event projection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Overall limit on how long an event stream follows one run.
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            timeout_secs: default_client_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 { 250 }
fn default_client_timeout() -> u64 { 3600 }

/// Built-in tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Root directory of the local file store.
    #[serde(default = "default_files_dir")]
    pub files_dir: String,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_fetch_chars")]
    pub max_fetch_chars: usize,
    #[serde(default = "default_max_read_chars")]
    pub max_read_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            files_dir: default_files_dir(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_fetch_chars: default_max_fetch_chars(),
            max_read_chars: default_max_read_chars(),
        }
    }
}

fn default_files_dir() -> String { "~/.tessera/files".to_string() }
fn default_fetch_timeout() -> u64 { 30 }
fn default_max_fetch_chars() -> usize { 30_000 }
fn default_max_read_chars() -> usize { 100_000 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TesseraError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| TesseraError::Config(e.to_string()))
    }

    /// Resolve the model a node asks for. `None` selects the default model.
    pub fn resolve_model(&self, name: Option<&str>) -> Result<&ModelConfig> {
        match name {
            None => Ok(&self.model),
            Some(name) => self
                .models
                .get(name)
                .ok_or_else(|| TesseraError::ModelNotFound(name.to_string())),
        }
    }

    /// Resolve the file store directory (expand ~).
    pub fn files_dir(&self) -> PathBuf {
        expand_home(&self.tools.files_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TESSERA_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_TESSERA_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_TESSERA_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TESSERA_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TESSERA_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_steps, 10);
        assert_eq!(config.engine.activity_timeout_secs, 600);
        assert_eq!(config.client.poll_interval_ms, 250);
        assert_eq!(config.client.timeout_secs, 3600);
        assert_eq!(config.tools.max_fetch_chars, 30_000);
        assert!(config.models.is_empty());
    }

    #[test]
    fn test_named_models() {
        let toml_str = r#"
[model]
model_id = "claude-sonnet-4-20250514"

[models.fast]
provider = "openai"
model_id = "gpt-4o-mini"
max_tokens = 1024
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.resolve_model(None).unwrap().provider, "anthropic");
        let fast = config.resolve_model(Some("fast")).unwrap();
        assert_eq!(fast.model_id, "gpt-4o-mini");
        assert_eq!(fast.max_tokens, 1024);
        assert!(matches!(
            config.resolve_model(Some("missing")),
            Err(TesseraError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_files_dir_expands_home() {
        let config = AppConfig {
            tools: ToolsConfig {
                files_dir: "/tmp/tessera-files".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.files_dir(), PathBuf::from("/tmp/tessera-files"));
    }
}
