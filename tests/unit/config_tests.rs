use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use assistant_relay::{config::GlobalConfig, AppError};

const FULL_TOML: &str = r#"
host_cli = "claude"
host_cli_args = ["--model", "sonnet"]
bind_host = "0.0.0.0"
http_port = 4010
db_path = "/var/lib/relay/chats.db"
idle_timeout_seconds = 120
allowed_origins = ["http://localhost:5173"]
"#;

#[test]
fn parses_all_fields() {
    let config = GlobalConfig::from_toml_str(FULL_TOML).expect("config parses");

    assert_eq!(config.host_cli, "claude");
    assert_eq!(config.host_cli_args, vec!["--model", "sonnet"]);
    assert_eq!(config.bind_host, IpAddr::from([0, 0, 0, 0]));
    assert_eq!(config.http_port, 4010);
    assert_eq!(config.db_path.to_str(), Some("/var/lib/relay/chats.db"));
    assert_eq!(config.idle_timeout(), Some(Duration::from_secs(120)));
    assert_eq!(config.allowed_origins, vec!["http://localhost:5173"]);
}

#[test]
fn empty_document_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config, GlobalConfig::default());
    assert_eq!(config.host_cli, "claude");
    assert_eq!(config.bind_addr(), SocketAddr::from(([127, 0, 0, 1], 3002)));
    assert_eq!(config.idle_timeout(), Some(Duration::from_secs(600)));
    assert_eq!(config.allowed_origins.len(), 3);
    assert!(!config.uses_memory_db());
}

#[test]
fn zero_idle_timeout_disables_it() {
    let config = GlobalConfig::from_toml_str("idle_timeout_seconds = 0").expect("parses");

    assert_eq!(config.idle_timeout(), None);
}

#[test]
fn memory_db_path_is_recognised() {
    let config = GlobalConfig::from_toml_str("db_path = \":memory:\"").expect("parses");

    assert!(config.uses_memory_db());
}

#[test]
fn empty_host_cli_is_rejected() {
    let result = GlobalConfig::from_toml_str("host_cli = \"  \"");

    assert!(matches!(result, Err(AppError::Config(ref msg)) if msg.contains("host_cli")));
}

#[test]
fn invalid_toml_is_a_config_error() {
    let result = GlobalConfig::from_toml_str("http_port = \"not a number\"");

    assert!(matches!(result, Err(AppError::Config(ref msg)) if msg.starts_with("invalid config")));
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, FULL_TOML).expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load");

    assert_eq!(config.http_port, 4010);
}

#[test]
fn load_from_missing_path_is_a_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");

    let result = GlobalConfig::load_from_path(dir.path().join("missing.toml"));

    assert!(matches!(result, Err(AppError::Config(ref msg)) if msg.contains("failed to read config")));
}
