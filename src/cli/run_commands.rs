// Run command: the engine against live market data with paper execution
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use grid_trading_engine::clients::kraken::KRAKEN_API_URL;
use grid_trading_engine::clients::{LogNotifier, TelegramNotifier};
use grid_trading_engine::core::{ConfidenceProvider, NoConfidence, StaticConfidence, SystemClock};
use grid_trading_engine::{
    Collaborators, Config, GridEngine, KrakenMarketData, NotificationSink, PaperGateway, PaperSettings,
    PreFlightValidator, TradingError, TradingResult,
};

pub struct RunOptions {
    pub cycles: Option<u64>,
    pub ai_confidence: Option<f64>,
    pub telegram: bool,
    pub seed: Option<u64>,
}

pub async fn run_engine(config: Config, options: RunOptions) -> TradingResult<()> {
    info!("🧪 Paper trading against live market data");

    // Run pre-flight validation
    info!("");
    let validation = PreFlightValidator::new(config.clone())
        .validate_for_trading(KRAKEN_API_URL)
        .await;
    validation.display();

    if !validation.passed {
        error!("");
        error!("❌ Pre-flight validation failed. Cannot proceed.");
        return Err(TradingError::ConfigValidation(
            "Critical validation checks did not pass".to_string(),
        ));
    }

    let notifier: Arc<dyn NotificationSink> = if options.telegram {
        Arc::new(TelegramNotifier::from_config(&config.notification)?)
    } else {
        Arc::new(LogNotifier)
    };

    let confidence: Arc<dyn ConfidenceProvider> = match options.ai_confidence {
        Some(value) => {
            if !(0.0..=1.0).contains(&value) {
                return Err(TradingError::ConfigValidation(format!("--ai-confidence {} must be in [0, 1]", value)));
            }
            Arc::new(StaticConfidence::new(value))
        }
        None => {
            if config.ai_settings.enabled {
                warn!("⚠️  AI gate enabled without --ai-confidence: every signal will stay neutral");
            }
            Arc::new(NoConfidence)
        }
    };

    let collaborators = Collaborators {
        market_data: Arc::new(KrakenMarketData::new(config.engine.candle_interval_minutes)),
        gateway: Arc::new(PaperGateway::new(PaperSettings { seed: options.seed, ..PaperSettings::default() })),
        notifier,
        confidence,
        clock: Arc::new(SystemClock),
    };
    let engine = GridEngine::new(config, collaborators)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, finishing the current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    let cycles = engine.run(shutdown_rx, options.cycles).await;

    let snapshot = engine.snapshot();
    info!("📊 Session summary after {} cycles", cycles);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for pair in &snapshot.pairs {
        info!(
            "  {} | grid g{} | {} open | exposure {:.4} | realized {:+.4} | unrealized {:+.4} | risk {}",
            pair.pair,
            pair.grid.as_ref().map_or(0, |g| g.generation),
            pair.positions.open_positions,
            pair.positions.exposure,
            pair.positions.realized_pnl,
            pair.positions.unrealized_pnl,
            pair.risk.level
        );
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "💰 Daily realized {:+.4} over {} trades, {} positions open",
        snapshot.global.daily_realized_pnl, snapshot.global.daily_trades, snapshot.global.open_positions
    );
    Ok(())
}
