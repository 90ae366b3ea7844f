//! Pre-flight validation for the grid engine
//!
//! Grades a loaded configuration before the engine runs: hard failures,
//! settings that will behave differently than they read, and informational
//! notes such as risk fields replaced by a more specific layer.

use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::core::grid_planner::GridPlanner;

/// Allocation per buy level below which fees dominate
const MIN_LEVEL_ALLOCATION: f64 = 5.0;
const MAX_RECOMMENDED_LEVELS: usize = 50;

/// Validation result with detailed findings
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub level: ValidationLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationLevel {
    Critical,  // Must pass for the engine to start
    Warning,   // Engine starts, but behaviour differs from what the file suggests
    Info,      // Informational only
}

impl ValidationCheck {
    fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), passed: true, message: message.into(), level: ValidationLevel::Info }
    }

    fn fail(name: impl Into<String>, message: impl Into<String>, level: ValidationLevel) -> Self {
        Self { name: name.into(), passed: false, message: message.into(), level }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        ValidationResult {
            passed: true,
            checks: Vec::new(),
        }
    }

    /// Result for a document that could not be loaded at all
    pub fn from_config_error(err: &ConfigError) -> Self {
        let mut result = Self::new();
        result.add_check(ValidationCheck::fail("Configuration", err.to_string(), ValidationLevel::Critical));
        result
    }

    pub fn add_check(&mut self, check: ValidationCheck) {
        if !check.passed && check.level == ValidationLevel::Critical {
            self.passed = false;
        }
        self.checks.push(check);
    }

    pub fn critical_failures(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Critical)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Warning)
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&ValidationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn display(&self) {
        info!("🔍 Pre-flight Validation");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        for check in &self.checks {
            let icon = if check.passed {
                "✅"
            } else {
                match check.level {
                    ValidationLevel::Critical => "❌",
                    ValidationLevel::Warning => "⚠️",
                    ValidationLevel::Info => "ℹ️",
                }
            };

            info!("{} {} - {}", icon, check.name, check.message);
        }

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if !self.passed {
            let failures = self.critical_failures();
            error!("❌ Validation failed: {} critical issue(s)", failures.len());
            for failure in failures {
                error!("   • {}: {}", failure.name, failure.message);
            }
        } else {
            let warnings = self.warnings();
            if !warnings.is_empty() {
                warn!("⚠️  {} warning(s) detected", warnings.len());
                for warning in warnings {
                    warn!("   • {}: {}", warning.name, warning.message);
                }
            }
            info!("✅ All critical checks passed");
        }
    }
}

/// Pre-flight validator over a loaded configuration
pub struct PreFlightValidator {
    config: Config,
}

impl PreFlightValidator {
    pub fn new(config: Config) -> Self {
        PreFlightValidator { config }
    }

    /// Run the configuration checks
    pub fn validate_all(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        result.add_check(self.check_config());
        if !result.passed {
            return result;
        }

        for check in self.check_grids() {
            result.add_check(check);
        }
        for check in self.check_risk_overrides() {
            result.add_check(check);
        }
        for check in self.check_weights() {
            result.add_check(check);
        }
        result.add_check(self.check_history());
        result.add_check(self.check_ai());
        result.add_check(self.check_notifications());

        result
    }

    /// Configuration checks plus market data reachability
    pub async fn validate_for_trading(&self, market_data_url: &str) -> ValidationResult {
        let mut result = self.validate_all();
        if let Some(check) = self.check_network_connectivity(market_data_url).await {
            result.add_check(check);
        }
        result
    }

    // Individual check methods

    fn check_config(&self) -> ValidationCheck {
        match self.config.validate() {
            Ok(()) => ValidationCheck {
                name: "Configuration".to_string(),
                passed: true,
                message: format!("{} pair(s) loaded", self.config.grid_settings.len()),
                level: ValidationLevel::Critical,
            },
            Err(e) => ValidationCheck::fail("Configuration", e.to_string(), ValidationLevel::Critical),
        }
    }

    fn check_grids(&self) -> Vec<ValidationCheck> {
        let planner = GridPlanner::new(false, false);
        let mut checks = Vec::new();

        for pair in self.config.pairs() {
            let name = format!("Grid {}", pair.symbol);
            // Geometry is relative to price, so any positive reference works
            let grid = match planner.plan(pair, 100.0, 1, None, Utc::now()) {
                Ok(grid) => grid,
                Err(e) => {
                    checks.push(ValidationCheck::fail(name, e.to_string(), ValidationLevel::Critical));
                    continue;
                }
            };
            let buys = grid.buy_levels().count();
            let per_level = if buys > 0 { pair.investment_amount / buys as f64 } else { 0.0 };
            let limits = self.config.risk_limits_for(pair);

            if buys == 0 {
                checks.push(ValidationCheck::fail(
                    name,
                    format!("{} levels leave no buy level below the centre", pair.grid_count),
                    ValidationLevel::Critical,
                ));
            } else if pair.grid_count > MAX_RECOMMENDED_LEVELS {
                checks.push(ValidationCheck::fail(
                    name,
                    format!("{} levels exceeds recommended maximum ({})", pair.grid_count, MAX_RECOMMENDED_LEVELS),
                    ValidationLevel::Warning,
                ));
            } else if per_level < MIN_LEVEL_ALLOCATION {
                checks.push(ValidationCheck::fail(
                    name,
                    format!("{:.2} per buy level may be too small for efficient trading", per_level),
                    ValidationLevel::Warning,
                ));
            } else if per_level > limits.position_size_limit {
                checks.push(ValidationCheck::fail(
                    name,
                    format!(
                        "{:.2} per buy level exceeds position_size_limit {:.2}; entries will be scaled down or rejected",
                        per_level, limits.position_size_limit
                    ),
                    ValidationLevel::Warning,
                ));
            } else {
                checks.push(ValidationCheck::pass(
                    name,
                    format!(
                        "{} levels ({} buy), {:.2}% range, {:.3}% step, {:.2} per buy level",
                        pair.grid_count,
                        buys,
                        pair.price_range_percentage,
                        grid.step / grid.centre * 100.0,
                        per_level
                    ),
                ));
            }
        }
        checks
    }

    /// One informational check per risk field a more specific layer replaced
    fn check_risk_overrides(&self) -> Vec<ValidationCheck> {
        self.config
            .pairs()
            .flat_map(|pair| {
                let (_, notes) = self.config.resolve_risk(pair);
                notes.into_iter().map(move |note| {
                    ValidationCheck::pass(
                        format!("Override {} {}", pair.symbol, note.field),
                        format!("{} sets {} (was {})", note.layer, note.value, note.replaced),
                    )
                })
            })
            .collect()
    }

    fn check_weights(&self) -> Vec<ValidationCheck> {
        let mut checks = Vec::new();
        match self.config.market_analysis.normalized_from {
            Some(sum) => checks.push(ValidationCheck::fail(
                "Market Analysis Weights",
                format!("weights summed to {:.3}, normalized to 1", sum),
                ValidationLevel::Warning,
            )),
            None => checks.push(ValidationCheck::pass("Market Analysis Weights", "sum to 1")),
        }
        if let Some(sum) = self.config.ai_settings.normalized_from {
            checks.push(ValidationCheck::fail(
                "AI Weights",
                format!("weights summed to {:.3}, normalized to 1", sum),
                ValidationLevel::Warning,
            ));
        }
        checks
    }

    fn check_history(&self) -> ValidationCheck {
        let required = self.config.technical_indicators.required_history();
        ValidationCheck::pass(
            "Indicator History",
            format!(
                "{} candles requested, {} required",
                self.config.engine.history_window, required
            ),
        )
    }

    fn check_ai(&self) -> ValidationCheck {
        let ai = &self.config.ai_settings;
        if ai.enabled {
            ValidationCheck::pass(
                "AI Gate",
                format!(
                    "enabled, threshold {:.2}; signals without an assessment stay neutral",
                    ai.confidence_threshold
                ),
            )
        } else {
            ValidationCheck::pass("AI Gate", "disabled")
        }
    }

    fn check_notifications(&self) -> ValidationCheck {
        let notify = &self.config.notification;
        let configured = notify.telegram_bot_token.as_deref().is_some_and(|t| !t.is_empty())
            && notify.telegram_chat_id.as_deref().is_some_and(|c| !c.is_empty());

        if configured {
            ValidationCheck::pass("Telegram", "configured")
        } else {
            ValidationCheck::fail(
                "Telegram",
                "not configured, alerts go to the log only",
                ValidationLevel::Warning,
            )
        }
    }

    async fn check_network_connectivity(&self, base_url: &str) -> Option<ValidationCheck> {
        // Quick connectivity check against the public time endpoint
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .ok()?;

        let url = format!("{}/0/public/Time", base_url.trim_end_matches('/'));
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Some(ValidationCheck {
                name: "Network".to_string(),
                passed: true,
                message: "Market data API reachable".to_string(),
                level: ValidationLevel::Warning,
            }),
            Ok(response) => Some(ValidationCheck {
                name: "Network".to_string(),
                passed: false,
                message: format!("Market data API returned HTTP {}", response.status().as_u16()),
                level: ValidationLevel::Warning,
            }),
            Err(_) => Some(ValidationCheck {
                name: "Network".to_string(),
                passed: false,
                message: "Cannot reach market data API".to_string(),
                level: ValidationLevel::Warning,
            }),
        }
    }
}
