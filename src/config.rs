// 7.0 config.rs: all settings in one place. leverage bounds, funding, liquidation,
// feed, degraded-tick policy, retry backoff, pipelines, logging.
// 7.1 every section has serde defaults so a toml file only names what it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, EnvFilter};

use crate::funding::FundingParams;
use crate::ledger::LedgerParams;
use crate::liquidation::LiquidationParams;
use crate::price_feed::FeedConfig;
use crate::types::Bps;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/** 7.2: what to do with ticks flagged degraded (last-known-good substitutes). */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradedPolicy {
    // Don't liquidate on a price we know may be wrong
    pub skip_liquidation: bool,
    // Don't fire conditional orders either
    pub skip_triggers: bool,
}

impl Default for DegradedPolicy {
    fn default() -> Self {
        Self {
            skip_liquidation: true,
            skip_triggers: false,
        }
    }
}

// Backoff for persistence and settlement hand-off
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        (delay as u64).min(self.max_delay_ms)
    }

    /// Base delay plus up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let jitter_range = base / 5;
        let jitter = if jitter_range == 0 {
            0
        } else {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0);
            (nanos as u64) % (jitter_range + 1)
        };
        Duration::from_millis(base + jitter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Bounded tick queue per pair. ingest waits when full.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { channel_capacity: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub max_retained: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { max_retained: 10_000 }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    /// Initialize the tracing subscriber. RUST_LOG wins over `level` when set.
    /// A second call (tests, embedding) leaves the first subscriber in place.
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let result = match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).try_init(),
            _ => fmt().with_env_filter(filter).try_init(),
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// The complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger: LedgerParams,
    pub funding: FundingParams,
    pub liquidation: LiquidationParams,
    pub feed: FeedConfig,
    pub degraded: DegradedPolicy,
    pub retry: RetryPolicy,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    pub events: EventsConfig,
}

impl EngineConfig {
    // Loose settings for local runs: verbose logs, short funding interval
    pub fn development() -> Self {
        let mut config = Self::default();
        config.logging.level = "debug".into();
        config.funding.interval_ms = 60_000; // 1 minute intervals for quick feedback
        config.retry.initial_delay_ms = 10;
        config
    }

    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.ledger.max_leverage = dec!(100);
        config.feed.mark_window_ms = 30_000;
        config
    }

    // Conservative: smoothed mark price, no triggers on degraded ticks
    pub fn mainnet_conservative() -> Self {
        let mut config = Self::default();
        config.feed.mark_window_ms = 60_000;
        config.feed.max_staleness_ms = 10_000;
        config.degraded.skip_triggers = true;
        config.logging.format = "json".into();
        config.retry.max_attempts = 10;
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        // leverage bounds
        if self.ledger.min_leverage < Decimal::ONE || self.ledger.max_leverage < self.ledger.min_leverage {
            return Err(ConfigError::InvalidLedger {
                reason: "Leverage bounds must satisfy 1 <= min <= max".to_string(),
            });
        }
        if self.ledger.margin_tolerance < Decimal::ZERO || self.ledger.margin_tolerance >= Decimal::ONE {
            return Err(ConfigError::InvalidLedger {
                reason: "Margin tolerance must be in [0, 1)".to_string(),
            });
        }
        if self.ledger.max_size <= Decimal::ZERO || self.ledger.max_notional <= Decimal::ZERO {
            return Err(ConfigError::InvalidLedger {
                reason: "Position size and notional caps must be positive".to_string(),
            });
        }

        if self.funding.interval_ms <= 0 {
            return Err(ConfigError::InvalidFunding {
                reason: "Funding interval must be positive".to_string(),
            });
        }
        // 100% of notional per interval is clearly a typo
        if self.funding.rate_bps.value().abs() >= Bps::new(10_000).value() {
            return Err(ConfigError::InvalidFunding {
                reason: "Funding rate must be under 10000 bps".to_string(),
            });
        }

        if self.liquidation.threshold <= Decimal::ZERO || self.liquidation.threshold > Decimal::ONE {
            return Err(ConfigError::InvalidLiquidation {
                reason: "Threshold must be in (0, 1]".to_string(),
            });
        }

        if self.feed.mark_window_ms < 0 || self.feed.max_staleness_ms <= 0 {
            return Err(ConfigError::InvalidFeed {
                reason: "Mark window must be >= 0 and staleness > 0".to_string(),
            });
        }

        if self.retry.max_attempts == 0 || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry {
                reason: "Need at least one attempt and a multiplier >= 1".to_string(),
            });
        }

        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::InvalidPipeline {
                reason: "Channel capacity must be positive".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid ledger config: {reason}")]
    InvalidLedger { reason: String },
    #[error("Invalid funding config: {reason}")]
    InvalidFunding { reason: String },
    #[error("Invalid liquidation config: {reason}")]
    InvalidLiquidation { reason: String },
    #[error("Invalid feed config: {reason}")]
    InvalidFeed { reason: String },
    #[error("Invalid retry config: {reason}")]
    InvalidRetry { reason: String },
    #[error("Invalid pipeline config: {reason}")]
    InvalidPipeline { reason: String },
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Failed to read config: {0}")]
    Io(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> EngineConfig {
        match self {
            Environment::Development => EngineConfig::development(),
            Environment::Testnet => EngineConfig::testnet(),
            Environment::Mainnet => EngineConfig::mainnet_conservative(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger.max_leverage, dec!(500));
        assert_eq!(config.liquidation.threshold, dec!(0.90));
        assert!(config.degraded.skip_liquidation);
        assert!(!config.degraded.skip_triggers);
    }

    #[test]
    fn test_environment_presets() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Testnet.config().validate().is_ok());
        assert!(Environment::Mainnet.config().validate().is_ok());
        assert!(Environment::Mainnet.config().degraded.skip_triggers);
    }

    #[test]
    fn test_invalid_leverage_bounds() {
        let mut config = EngineConfig::default();
        config.ledger.max_leverage = dec!(0.5);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLedger { .. })));
    }

    #[test]
    fn test_position_caps_must_be_positive() {
        let mut config = EngineConfig::default();
        config.ledger.max_notional = Decimal::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLedger { .. })));
    }

    #[test]
    fn test_invalid_threshold() {
        let mut config = EngineConfig::default();
        config.liquidation.threshold = dec!(1.5);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLiquidation { .. })));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [liquidation]
            threshold = "0.8"

            [degraded]
            skip_triggers = true

            [feed]
            mark_window_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.liquidation.threshold, dec!(0.8));
        assert!(config.degraded.skip_triggers);
        assert!(config.degraded.skip_liquidation);
        assert_eq!(config.feed.mark_window_ms, 5000);
        assert_eq!(config.funding.interval_ms, crate::funding::DEFAULT_FUNDING_INTERVAL_MS);
    }

    #[test]
    fn test_toml_parse_error() {
        let err = EngineConfig::from_toml_str("[ledger\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_retry_backoff_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.base_delay_ms(1), 100);
        assert_eq!(retry.base_delay_ms(2), 200);
        assert_eq!(retry.base_delay_ms(4), 800);
        assert_eq!(retry.base_delay_ms(5), 1_000);
        let d = retry.delay_for(3).as_millis() as u64;
        assert!((400..=480).contains(&d));
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.liquidation.threshold, config.liquidation.threshold);
    }
}
