use std::io::Write;

use tessera_core::config::AppConfig;
use tessera_core::TesseraError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps = 4
activity_timeout_secs = 30

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[models.fast]
provider = "openai"
model_id = "gpt-4o-mini"

[client]
poll_interval_ms = 100
timeout_secs = 60

[tools]
files_dir = "/tmp/tessera-test-files"
fetch_timeout_secs = 5
max_fetch_chars = 1000
max_read_chars = 2000
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 4);
    assert_eq!(config.engine.activity_timeout_secs, 30);
    assert_eq!(config.model.model_id, "claude-sonnet-4-20250514");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);
    assert_eq!(config.client.poll_interval_ms, 100);
    assert_eq!(config.tools.max_read_chars, 2000);
    assert_eq!(
        config.files_dir(),
        std::path::PathBuf::from("/tmp/tessera-test-files")
    );

    let fast = config.resolve_model(Some("fast")).expect("named model");
    assert_eq!(fast.model_id, "gpt-4o-mini");
    assert_eq!(fast.max_tokens, 8192);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("TESSERA_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${TESSERA_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("TESSERA_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 10);
    assert_eq!(config.engine.activity_timeout_secs, 600);
    assert_eq!(config.client.poll_interval_ms, 250);
    assert_eq!(config.client.timeout_secs, 3600);
    assert_eq!(config.tools.fetch_timeout_secs, 30);
    assert!(config.models.is_empty());
    assert_eq!(config.resolve_model(None).unwrap().model_id, "llama3.2");
}

#[test]
fn test_unknown_model_name_is_an_error() {
    let config = AppConfig::default();
    assert!(matches!(
        config.resolve_model(Some("missing")),
        Err(TesseraError::ModelNotFound(_))
    ));
}

#[test]
fn test_missing_config_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/tessera.toml")).unwrap_err();
    assert!(matches!(err, TesseraError::ConfigNotFound(_)));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::default();
    let rendered = toml::to_string_pretty(&config).expect("render config");
    let parsed: AppConfig = toml::from_str(&rendered).expect("parse rendered config");
    assert_eq!(parsed.engine.max_steps, config.engine.max_steps);
    assert_eq!(parsed.tools.files_dir, config.tools.files_dir);
}
