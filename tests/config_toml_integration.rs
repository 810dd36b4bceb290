use tempfile::NamedTempFile;
use wa_session_gateway::cli::ConfigDiscovery;
use wa_session_gateway::{GatewayConfig, StorageTier};

#[test]
fn test_config_serialization_roundtrip() {
    let original_config = GatewayConfig::default();

    let toml_str = original_config
        .to_toml_string()
        .expect("Should be able to serialize config to TOML");

    assert!(!toml_str.is_empty(), "TOML string should not be empty");
    assert!(toml_str.contains("[storage]"), "Should contain storage section");
    assert!(toml_str.contains("max_connections"), "Should contain max_connections field");
    assert!(
        !toml_str.contains("encryption_key"),
        "Unset encryption key should not be written"
    );

    let deserialized_config = GatewayConfig::from_toml_str(&toml_str)
        .expect("Should be able to deserialize TOML string");

    assert_eq!(original_config.storage.tier, deserialized_config.storage.tier);
    assert_eq!(
        original_config.storage.sessions_root,
        deserialized_config.storage.sessions_root
    );
    assert_eq!(
        original_config.pool.max_connections,
        deserialized_config.pool.max_connections
    );
    assert_eq!(
        original_config.pool.qr_timeout_ms,
        deserialized_config.pool.qr_timeout_ms
    );
}

#[test]
fn test_config_file_operations() {
    let mut original_config = GatewayConfig::default();
    original_config.storage.tier = StorageTier::Cloud;
    original_config.pool.instance_url = Some("http://10.0.0.7:3000".to_string());

    let temp_file = NamedTempFile::new().expect("Should be able to create temporary file");
    let temp_path = temp_file.path();

    original_config
        .to_toml_file(temp_path)
        .expect("Should be able to save config to file");

    let loaded_config =
        GatewayConfig::from_toml_file(temp_path).expect("Should be able to load config from file");

    assert_eq!(loaded_config.storage.tier, StorageTier::Cloud);
    assert_eq!(
        loaded_config.pool.instance_url.as_deref(),
        Some("http://10.0.0.7:3000")
    );
    assert!(loaded_config.validate().is_ok());
}

#[test]
fn test_discovery_loads_explicit_file() {
    let temp_file = NamedTempFile::new().unwrap();
    std::fs::write(
        temp_file.path(),
        r#"
        [storage]
        tier = "hybrid"
        bucket = "tenant-sessions"
        backup_interval_ms = 120000

        [pool]
        max_connections = 25
        memory_threshold = 0.9
        "#,
    )
    .unwrap();

    let config = ConfigDiscovery::load(Some(temp_file.path())).unwrap();
    assert_eq!(config.storage.bucket, "tenant-sessions");
    assert_eq!(config.pool.memory_threshold, 0.9);
    assert_eq!(config.storage.cloud.upload_max_retries, 3);
}

#[test]
fn test_invalid_toml_is_rejected() {
    let result = GatewayConfig::from_toml_str("[storage]\ntier = \"glacier\"\n");
    assert!(result.is_err(), "Unknown storage tier should fail to parse");

    let result = GatewayConfig::from_toml_str("[pool\nmax_connections = 1");
    assert!(result.is_err(), "Malformed TOML should fail to parse");
}

#[test]
fn test_invalid_encryption_key_fails_validation() {
    let mut config = GatewayConfig::default();
    config.storage.encryption_key = Some("too-short".to_string());
    assert!(config.validate().is_err());
}
