//! Config module tests

use std::io::Write;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("IOTB_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${IOTB_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("IOTB_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("IOTB_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${IOTB_TEST_VAR_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("IOTB_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${IOTB_TEST_VAR_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("IOTB_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("IOTB_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${IOTB_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.max_connections, 1000);
    assert_eq!(config.limits.max_packet_size, 1024 * 1024);
    assert_eq!(config.mqtt.max_protocol_level, 4);
    assert!(config.mqtt.close_on_unsupported_protocol);
    assert_eq!(config.mqtt.max_topic_levels, 128);
    assert_eq!(
        config.broker_config().max_packet_size,
        crate::broker::BrokerConfig::default().max_packet_size
    );
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse("[server]\nbind = \"127.0.0.1:1883\"\n").unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1883");
    assert_eq!(config.limits.max_connections, 1000);
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "debug"

[server]
bind = "0.0.0.0:2883"

[limits]
max_connections = 64
max_packet_size = 65536

[mqtt]
max_protocol_level = 3
close_on_unsupported_protocol = false
max_topic_levels = 16
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.bind.port(), 2883);
    assert_eq!(config.limits.max_connections, 64);
    assert_eq!(config.limits.max_packet_size, 65536);
    assert_eq!(config.mqtt.max_protocol_level, 3);
    assert!(!config.mqtt.close_on_unsupported_protocol);

    let broker = config.broker_config();
    assert_eq!(broker.max_connections, 64);
    assert_eq!(broker.engine.max_protocol_level, 3);
    assert!(!broker.engine.close_on_unsupported_protocol);
    assert_eq!(broker.engine.max_topic_levels, 16);
}

#[test]
fn test_invalid_protocol_level() {
    for level in [2, 5] {
        let toml = format!("[mqtt]\nmax_protocol_level = {}\n", level);
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::Validation(_))
        ));
    }
}

#[test]
fn test_invalid_limits() {
    assert!(matches!(
        Config::parse("[limits]\nmax_connections = 0\n"),
        Err(ConfigError::Validation(_))
    ));
    assert!(matches!(
        Config::parse("[limits]\nmax_packet_size = 0\n"),
        Err(ConfigError::Validation(_))
    ));
    assert!(matches!(
        Config::parse("[limits]\nmax_packet_size = 268435456\n"),
        Err(ConfigError::Validation(_))
    ));
    assert!(matches!(
        Config::parse("[mqtt]\nmax_topic_levels = 0\n"),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_parse_error() {
    assert!(matches!(
        Config::parse("[server\nbind = 1"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.max_packet_size, 1024 * 1024);
    assert_eq!(config.mqtt.max_topic_levels, 128);
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("IOTB_TEST_BIND_HOST", "127.0.0.1");
    std::env::remove_var("IOTB_TEST_MAX_CONN");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
bind = "${{IOTB_TEST_BIND_HOST}}:1885"

[limits]
max_connections = ${{IOTB_TEST_MAX_CONN:-25}}
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");
    assert_eq!(config.limits.max_connections, 25);

    std::env::remove_var("IOTB_TEST_BIND_HOST");
}
