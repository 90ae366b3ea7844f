// Integration tests for configuration loading and validation

mod common;

use common::{create_test_config, BTC, ETH};
use grid_trading_engine::{Config, ConfigError};
use std::fs;
use tempfile::TempDir;

const EXAMPLE: &str = include_str!("../config.toml.example");

#[test]
fn test_default_config_creation() {
    let config = create_test_config().prepare().expect("valid");

    assert_eq!(config.grid_settings.len(), 1);
    let btc = config.pair(BTC).expect("btc configured");
    assert_eq!(btc.symbol, BTC);
    assert_eq!(btc.grid_count, 15);
    assert_eq!(btc.investment_amount, 60.0);
    assert!(config.engine.check_interval > 0);
}

#[test]
fn test_example_file_parses() {
    let config = Config::from_toml_str(EXAMPLE).expect("example config is valid");

    assert_eq!(config.grid_settings.len(), 2);
    assert_eq!(config.pair(ETH).map(|p| p.symbol.as_str()), Some(ETH));
    assert_eq!(config.engine.max_reprice_attempts, 1);

    let btc = config.pair(BTC).cloned().expect("btc");
    let limits = config.risk_limits_for(&btc);
    assert_eq!(limits.stop_loss_percentage, 5.0);
    assert_eq!(limits.take_profit_percentage, 10.0);
    assert_eq!(limits.max_open_positions, 10);
}

#[test]
fn test_config_serialization_deserialization() {
    let config = create_test_config().prepare().expect("valid");

    let toml_string = toml::to_string_pretty(&config).expect("Failed to serialize config");
    assert!(toml_string.contains("[grid_settings.\"BTC/USDT\"]"));

    let deserialized = Config::from_toml_str(&toml_string).expect("Failed to deserialize config");
    assert_eq!(deserialized.pair(BTC), config.pair(BTC));
    assert_eq!(deserialized.engine.history_window, config.engine.history_window);
}

#[test]
fn test_config_file_loading() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("test_config.toml");

    create_test_config().to_file(&config_path).expect("Failed to write config file");
    let loaded = Config::from_file(&config_path).expect("Failed to load config");

    assert_eq!(loaded.grid_settings.len(), 1);
    assert_eq!(loaded.pair(BTC).map(|p| p.grid_count), Some(15));
    assert_eq!(loaded.logging.log_level, "warn");
}

#[test]
fn test_json_config_loading() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.json");

    let config = Config::from_toml_str(EXAMPLE).expect("valid");
    fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = Config::from_file(&config_path).expect("Failed to load JSON config");
    assert_eq!(loaded.pair(ETH), config.pair(ETH));
}

#[test]
fn test_load_or_create_writes_default() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("fresh.toml");
    assert!(!config_path.exists());

    let created = Config::load_or_create(&config_path).expect("default created");
    assert!(config_path.exists());
    assert_eq!(created.grid_settings.len(), 2);

    let reloaded = Config::load_or_create(&config_path).expect("existing file loaded");
    assert_eq!(reloaded.pair(BTC), created.pair(BTC));
}

#[test]
fn test_missing_file_is_read_error() {
    let result = Config::from_file("/nonexistent/path/config.toml");
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_document_is_parse_error() {
    let result = Config::from_toml_str("[grid_settings.\"BTC/USDT\"]\ngrid_count = \"many\"\n");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_invalid_values_rejected() {
    let cases = [
        "grid_count = 1\nprice_range_percentage = 10.0\ninvestment_amount = 50.0",
        "grid_count = 10\nprice_range_percentage = 0.0\ninvestment_amount = 50.0",
        "grid_count = 10\nprice_range_percentage = 10.0\ninvestment_amount = -5.0",
        "grid_count = 10\nprice_range_percentage = 10.0\ninvestment_amount = 50.0\nprice_deviation = 5.0",
        "grid_count = 10\nprice_range_percentage = 10.0\ninvestment_amount = 50.0\nmax_loss_percentage = 0.0",
    ];

    for body in cases {
        let document = format!("[grid_settings.\"XRP/USDT\"]\n{}\n", body);
        let result = Config::from_toml_str(&document);
        assert!(
            matches!(result, Err(ConfigError::Validation(_))),
            "expected validation error for:\n{}",
            body
        );
    }
}

#[test]
fn test_minimal_document_uses_defaults() {
    let document = "[grid_settings.\"XRP/USDT\"]\ngrid_count = 8\nprice_range_percentage = 10.0\ninvestment_amount = 50.0\n";
    let config = Config::from_toml_str(document).expect("minimal config is valid");

    let xrp = config.pair("XRP/USDT").cloned().expect("xrp");
    assert_eq!(xrp.grid_levels, 5);
    assert_eq!(xrp.price_deviation, 0.05);
    assert_eq!(config.risk_limits_for(&xrp).stop_loss_percentage, 5.0);
}

#[test]
fn test_risk_precedence_through_document() {
    let document = r#"
[grid_settings."XRP/USDT"]
grid_count = 8
price_range_percentage = 10.0
investment_amount = 50.0
max_loss_percentage = 2.0

[risk_management]
stop_loss_percentage = 5.0
max_open_positions = 10

[advanced_settings.risk_control]
stop_loss_percentage = 4.0
max_open_positions = 6

[advanced_trading]
stop_loss_percentage = 3.0
"#;
    let config = Config::from_toml_str(document).expect("valid");
    let xrp = config.pair("XRP/USDT").cloned().expect("xrp");
    let (limits, notes) = config.resolve_risk(&xrp);

    assert_eq!(limits.stop_loss_percentage, 2.0);
    assert_eq!(limits.max_open_positions, 6);

    let stop_loss_layers: Vec<_> = notes
        .iter()
        .filter(|n| n.field == "stop_loss_percentage")
        .map(|n| n.layer)
        .collect();
    assert_eq!(stop_loss_layers, vec!["advanced_settings.risk_control", "advanced_trading", "grid_settings"]);
}

#[test]
fn test_weights_normalized_on_load() {
    let document = r#"
[grid_settings."XRP/USDT"]
grid_count = 8
price_range_percentage = 10.0
investment_amount = 50.0

[ai_settings]
technical_weight = 2.0
fundamental_weight = 1.0
sentiment_weight = 1.0
"#;
    let config = Config::from_toml_str(document).expect("valid");
    let ai = &config.ai_settings;

    assert!((ai.technical_weight - 0.5).abs() < 1e-9);
    assert!((ai.fundamental_weight - 0.25).abs() < 1e-9);
    assert!(ai.normalized_from.is_some());
}
