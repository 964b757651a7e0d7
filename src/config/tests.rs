//! Tests for the configuration module.

use super::*;

#[test]
fn defaults_are_sane() {
    let config = Config::default();
    assert_eq!(config.general.port, 5432);
    assert_eq!(config.general.server_version, "8.4.7");
    assert!(config.general.log_client_connections);
    assert_eq!(config.database.backend, "reference");
}

#[test]
fn parses_a_minimal_toml_document() {
    let toml_text = r#"
        [general]
        host = "127.0.0.1"
        port = 6543
    "#;
    let config: Config = toml::from_str(toml_text).unwrap();
    assert_eq!(config.general.host, "127.0.0.1");
    assert_eq!(config.general.port, 6543);
    // Fields not present fall back to their defaults.
    assert_eq!(config.general.worker_threads, General::default_worker_threads());
    assert_eq!(config.database.backend, "reference");
}

#[test]
fn parses_an_empty_document_using_all_defaults() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config, {
        let mut c = Config::default();
        c.path = String::new();
        c
    });
}
