// Config command implementations: init, validate, plan
use chrono::Utc;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

use grid_trading_engine::clients::kraken::KRAKEN_API_URL;
use grid_trading_engine::core::grid_planner::LevelSide;
use grid_trading_engine::{Config, GridPlanner, PreFlightValidator, TradingError, TradingResult, ValidationResult};

const EXAMPLE_CONFIG: &str = include_str!("../../config.toml.example");

pub fn init_config(path: &str, force: bool) -> TradingResult<()> {
    info!("🔧 Initializing configuration...");

    if Path::new(path).exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", path);
        return Ok(());
    }

    if path.ends_with(".json") {
        let config = Config::from_toml_str(EXAMPLE_CONFIG)?;
        fs::write(path, serde_json::to_string_pretty(&config)?)?;
    } else {
        fs::write(path, EXAMPLE_CONFIG)?;
    }
    info!("📝 Created {}", path);

    info!("✅ Configuration initialized");
    info!("💡 Next steps:");
    info!("   1. Edit {} for your pairs and limits", path);
    info!("   2. Run: grid-bot validate");
    info!("   3. Run: grid-bot run --cycles 5");
    Ok(())
}

pub async fn validate_config(path: &str, online: bool) -> TradingResult<()> {
    let validation = match Config::from_file(path) {
        Ok(config) => {
            let validator = PreFlightValidator::new(config);
            if online {
                validator.validate_for_trading(KRAKEN_API_URL).await
            } else {
                validator.validate_all()
            }
        }
        Err(e) => ValidationResult::from_config_error(&e),
    };

    validation.display();
    if !validation.passed {
        return Err(TradingError::ConfigValidation(format!(
            "{} critical check(s) failed",
            validation.critical_failures().len()
        )));
    }
    Ok(())
}

pub fn plan_grid(config: &Config, pair: &str, price: f64) -> TradingResult<()> {
    let pair_config = config
        .pair(pair)
        .ok_or_else(|| TradingError::UnknownPair(pair.to_string()))?;
    if !price.is_finite() || price <= 0.0 {
        error!("❌ Price must be positive");
        return Err(TradingError::InvalidGridConfig(format!("invalid reference price {}", price)));
    }

    let planner = GridPlanner::new(
        config.advanced_trading.dynamic_grid_adjustment,
        config.advanced_trading.dynamic_position_sizing,
    );
    let grid = planner.plan(pair_config, price, 1, None, Utc::now())?;
    let limits = config.risk_limits_for(pair_config);

    info!("🔲 {} grid at {:.4}", pair, price);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for level in grid.levels.iter().rev() {
        let side = match level.side {
            LevelSide::Buy => "BUY ",
            LevelSide::Sell => "SELL",
            LevelSide::Reference => "REF ",
        };
        info!("  {:>3}  {}  {:>14.4}  {:>10.4}", level.id.index, side, level.price, level.allocation);
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("📏 Bounds [{:.4}, {:.4}], step {:.4}", grid.lower, grid.upper, grid.step);
    info!(
        "💰 {:.4} allocated over {} buy levels (investment {:.4})",
        grid.buy_allocation_total(),
        grid.buy_levels().count(),
        pair_config.investment_amount
    );
    info!(
        "🛡️ Stop-loss {:.2}% | take-profit {:.2}% | trailing {}",
        limits.stop_loss_percentage,
        limits.take_profit_percentage,
        if limits.trailing_stop { format!("{:.2}%", limits.trailing_stop_percentage) } else { "off".to_string() }
    );
    Ok(())
}
