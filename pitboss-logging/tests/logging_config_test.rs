use pitboss_config::{LogFormat, LogLevel, LoggingConfig};
use pitboss_logging::{build_env_filter, init_logging_from_config, init_simple_tracing};

#[test]
fn test_logging_config_integration() {
    let yaml_config = r#"
level: debug
format: json
filter: "pitboss_pool::scheduler=trace"
include_location: true
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();

    // Verify config was parsed correctly
    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);
    assert!(config.include_location);
    assert!(build_env_filter(&config).is_ok());

    init_logging_from_config(&config).unwrap();

    // A second initialisation keeps the first subscriber
    init_logging_from_config(&LoggingConfig::default()).unwrap();
    init_simple_tracing("warn").unwrap();

    tracing::info!(worker_id = "worker_1", "subscriber installed");
}

#[test]
fn test_invalid_filter_is_rejected() {
    let config = LoggingConfig {
        filter: Some("pitboss_pool=verbose".to_string()),
        ..LoggingConfig::default()
    };

    // RUST_LOG takes precedence when the test runner sets it
    if std::env::var("RUST_LOG").is_err() {
        assert!(build_env_filter(&config).is_err());
    }
}
