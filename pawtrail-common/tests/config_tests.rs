//! Configuration loading and validation tests
//!
//! Tests touching PAWTRAIL_CONFIG are #[serial] to avoid env-var races.

use pawtrail_common::config::{
    resolve_config_path, CancelPolicy, TomlConfig, CONFIG_ENV_VAR, MAX_RETENTION_SECS,
};
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

const MINIMAL: &str = r#"
[api]
base_url = "https://api.example.test"

[tracking]
pickup_radius_m = 75.0
sample_timeout_secs = 120
"#;

#[test]
fn test_minimal_config_applies_defaults() {
    let config = TomlConfig::from_toml_str(MINIMAL).expect("minimal config should parse");

    assert_eq!(config.port, 5780);
    assert_eq!(config.api.timeout_secs, 30);
    assert!(config.api.auth_token.is_none());
    assert_eq!(config.tracking.pickup_radius_m, 75.0);
    assert_eq!(config.tracking.sample_timeout_secs, 120);
    assert_eq!(config.tracking.foreground_interval_ms, 5_000);
    assert_eq!(config.tracking.background_interval_ms, 30_000);
    assert!(!config.tracking.auto_start_on_pickup);
    assert_eq!(config.uplink.batch_size, 50);
    assert_eq!(config.uplink.max_attempts, 5);
    assert_eq!(config.buffer.cancel_policy, CancelPolicy::Retain);
    assert_eq!(config.registry.retention_secs, 300);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_missing_pickup_radius_is_rejected() {
    let content = r#"
[api]
base_url = "https://api.example.test"

[tracking]
sample_timeout_secs = 120
"#;
    assert!(TomlConfig::from_toml_str(content).is_err());
}

#[test]
fn test_missing_sample_timeout_is_rejected() {
    let content = r#"
[api]
base_url = "https://api.example.test"

[tracking]
pickup_radius_m = 50.0
"#;
    assert!(TomlConfig::from_toml_str(content).is_err());
}

#[test]
fn test_non_positive_thresholds_are_rejected() {
    let zero_radius = MINIMAL.replace("pickup_radius_m = 75.0", "pickup_radius_m = 0.0");
    assert!(TomlConfig::from_toml_str(&zero_radius).is_err());

    let zero_timeout = MINIMAL.replace("sample_timeout_secs = 120", "sample_timeout_secs = 0");
    assert!(TomlConfig::from_toml_str(&zero_timeout).is_err());
}

#[test]
fn test_invalid_jitter_ratio_is_rejected() {
    let content = format!("{}\n[uplink]\njitter_ratio = 1.5\n", MINIMAL);
    assert!(TomlConfig::from_toml_str(&content).is_err());
}

#[test]
fn test_retention_beyond_one_year_is_rejected() {
    let too_long = format!("{}\n[registry]\nretention_secs = 9000000000000\n", MINIMAL);
    assert!(TomlConfig::from_toml_str(&too_long).is_err());

    let at_limit = format!("{}\n[registry]\nretention_secs = {}\n", MINIMAL, MAX_RETENTION_SECS);
    assert!(TomlConfig::from_toml_str(&at_limit).is_ok());
}

#[test]
fn test_purge_policy_parses() {
    let content = format!("{}\n[buffer]\ncancel_policy = \"purge\"\nmax_samples = 10\n", MINIMAL);
    let config = TomlConfig::from_toml_str(&content).unwrap();
    assert_eq!(config.buffer.cancel_policy, CancelPolicy::Purge);
    assert_eq!(config.buffer.max_samples, 10);
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "database_path = \"/tmp/walks.db\"").unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();

    let config = TomlConfig::load(&path).unwrap();
    assert_eq!(config.database_path(), PathBuf::from("/tmp/walks.db"));
}

#[test]
fn test_load_missing_file_is_config_error() {
    let result = TomlConfig::load(Path::new("/nonexistent/pawtrail/config.toml"));
    assert!(matches!(result, Err(pawtrail_common::Error::Config(_))));
}

#[test]
#[serial]
fn test_cli_argument_wins_over_env() {
    env::set_var(CONFIG_ENV_VAR, "/from/env.toml");
    let resolved = resolve_config_path(Some(Path::new("/from/cli.toml"))).unwrap();
    assert_eq!(resolved, PathBuf::from("/from/cli.toml"));
    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_env_var_used_without_cli_argument() {
    env::set_var(CONFIG_ENV_VAR, "/from/env.toml");
    let resolved = resolve_config_path(None).unwrap();
    assert_eq!(resolved, PathBuf::from("/from/env.toml"));
    env::remove_var(CONFIG_ENV_VAR);
}
