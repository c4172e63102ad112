//! Config module tests

use super::*;

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.max_packet_size, 1024 * 1024);
    assert_eq!(config.log.level, "info");
}

#[test]
fn test_parse_full_config() {
    let config = Config::from_toml(
        r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:2883"

[limits]
max_packet_size = 4096
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:2883");
    assert_eq!(config.limits.max_packet_size, 4096);
}

#[test]
fn test_missing_sections_use_defaults() {
    let config = Config::from_toml("[log]\nlevel = \"trace\"\n").unwrap();
    assert_eq!(config.log.level, "trace");
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.max_packet_size, 1024 * 1024);
}

#[test]
fn test_zero_max_packet_size_rejected() {
    let err = Config::from_toml("[limits]\nmax_packet_size = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_oversized_max_packet_size_rejected() {
    let err = Config::from_toml("[limits]\nmax_packet_size = 3000000\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_load_config_file() {
    let temp_dir = std::env::temp_dir();
    let config_path = temp_dir.join("wispmq_test_config.toml");

    std::fs::write(&config_path, "[server]\nbind = \"127.0.0.1:1885\"\n").unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");

    std::fs::remove_file(&config_path).ok();
}

#[test]
fn test_load_missing_file_is_io_error() {
    let err = Config::load("/nonexistent/wispmq.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
