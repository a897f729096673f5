//! Configuration management for the options risk bot.
//!
//! `AppConfig` is layered from an optional TOML file and `RISK_`-prefixed
//! environment variables (`__` separates nested keys, e.g.
//! `RISK_RISK__SL_PCT=3`). It is validated once at startup.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for all settings.
pub const ENV_PREFIX: &str = "RISK";

/// One step of the tiered trailing table: once peak profit reaches
/// `min_profit_pct`, the stop moves to `stop_offset_pct` from entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingTier {
    pub min_profit_pct: Decimal,
    pub stop_offset_pct: Decimal,
}

impl TrailingTier {
    pub fn new(min_profit_pct: Decimal, stop_offset_pct: Decimal) -> Self {
        Self {
            min_profit_pct,
            stop_offset_pct,
        }
    }
}

/// Default trailing table: 5% -> stop at -15%, 10% -> -5%, 15% -> breakeven,
/// 25% -> +10% locked.
pub fn default_trailing_tiers() -> Vec<TrailingTier> {
    vec![
        TrailingTier::new(Decimal::new(5, 0), Decimal::new(-15, 0)),
        TrailingTier::new(Decimal::new(10, 0), Decimal::new(-5, 0)),
        TrailingTier::new(Decimal::new(15, 0), Decimal::ZERO),
        TrailingTier::new(Decimal::new(25, 0), Decimal::new(10, 0)),
    ]
}

/// Risk-engine settings. Percentages are in percent units (2 means 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Stop-loss threshold.
    pub sl_pct: Decimal,
    /// Take-profit threshold.
    pub tp_pct: Decimal,
    /// Drop from peak pnl_pct that triggers the peak-drawdown exit.
    pub peak_drawdown_pct: Decimal,
    /// Peak profit required before peak-drawdown can fire.
    pub peak_drawdown_activation_profit_pct: Decimal,
    /// Alternative gate: trailed stop offset from entry.
    pub peak_drawdown_activation_stop_offset_pct: Option<Decimal>,
    /// Absolute profit that arms the secure-profit rule.
    pub secure_profit_threshold: Option<Decimal>,
    /// Drawdown from the absolute peak, in percent of the peak.
    pub secure_profit_drawdown_pct: Decimal,
    /// Market-local `HH:MM` after which profitable positions are closed.
    pub time_exit_at: Option<String>,
    pub min_profit_for_time_exit: Decimal,
    /// Market-local `HH:MM` session close.
    pub session_close_at: Option<String>,
    pub session_exit_buffer_mins: u32,
    /// Offset of the market's local time from UTC.
    pub market_utc_offset_mins: i32,
    pub trailing_tier_table: Vec<TrailingTier>,
    /// Legacy absolute trailing stop.
    pub trailing_stop_amount: Option<Decimal>,
    pub underlying_min_adx: Option<Decimal>,
    pub underlying_min_atr_pct: Option<Decimal>,
    /// Rule names excluded from evaluation.
    pub disabled_rules: Vec<String>,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
    pub cycle_interval_active_ms: u64,
    pub cycle_interval_idle_ms: u64,
    pub pnl_staleness_threshold_secs: u64,
    pub pnl_sync_interval_secs: u64,
    pub pnl_cache_ttl_secs: u64,
    pub pnl_flush_interval_ms: u64,
    pub reconcile_interval_secs: u64,
    pub supervisor_restart_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sl_pct: Decimal::new(20, 0),
            tp_pct: Decimal::new(50, 0),
            peak_drawdown_pct: Decimal::new(5, 0),
            peak_drawdown_activation_profit_pct: Decimal::new(10, 0),
            peak_drawdown_activation_stop_offset_pct: None,
            secure_profit_threshold: None,
            secure_profit_drawdown_pct: Decimal::new(30, 0),
            time_exit_at: None,
            min_profit_for_time_exit: Decimal::ZERO,
            session_close_at: Some("15:30".to_string()),
            session_exit_buffer_mins: 15,
            market_utc_offset_mins: 330,
            trailing_tier_table: default_trailing_tiers(),
            trailing_stop_amount: None,
            underlying_min_adx: None,
            underlying_min_atr_pct: None,
            disabled_rules: Vec::new(),
            circuit_breaker_failure_threshold: 10,
            circuit_breaker_cooldown_secs: 60,
            cycle_interval_active_ms: 1000,
            cycle_interval_idle_ms: 5000,
            pnl_staleness_threshold_secs: 30,
            pnl_sync_interval_secs: 30,
            pnl_cache_ttl_secs: 300,
            pnl_flush_interval_ms: 250,
            reconcile_interval_secs: 60,
            supervisor_restart_delay_ms: 1000,
            shutdown_timeout_secs: 10,
        }
    }
}

fn parse_clock(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| Error::config(format!("{field}: invalid time '{value}': {e}")))
}

impl RiskConfig {
    /// Check ranges and internal consistency. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sl_pct", self.sl_pct),
            ("tp_pct", self.tp_pct),
            ("peak_drawdown_pct", self.peak_drawdown_pct),
            ("secure_profit_drawdown_pct", self.secure_profit_drawdown_pct),
        ];
        for (name, value) in positive {
            if value <= Decimal::ZERO {
                return Err(Error::config(format!("{name} must be positive, got {value}")));
            }
        }
        if self.peak_drawdown_activation_profit_pct < Decimal::ZERO {
            return Err(Error::config(
                "peak_drawdown_activation_profit_pct must not be negative",
            ));
        }
        if matches!(self.trailing_stop_amount, Some(v) if v <= Decimal::ZERO) {
            return Err(Error::config("trailing_stop_amount must be positive"));
        }
        if matches!(self.secure_profit_threshold, Some(v) if v <= Decimal::ZERO) {
            return Err(Error::config("secure_profit_threshold must be positive"));
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return Err(Error::config("circuit_breaker_failure_threshold must be >= 1"));
        }

        let intervals = [
            ("circuit_breaker_cooldown_secs", self.circuit_breaker_cooldown_secs),
            ("cycle_interval_active_ms", self.cycle_interval_active_ms),
            ("cycle_interval_idle_ms", self.cycle_interval_idle_ms),
            ("pnl_staleness_threshold_secs", self.pnl_staleness_threshold_secs),
            ("pnl_sync_interval_secs", self.pnl_sync_interval_secs),
            ("pnl_cache_ttl_secs", self.pnl_cache_ttl_secs),
            ("pnl_flush_interval_ms", self.pnl_flush_interval_ms),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::config(format!("{name} must be non-zero")));
            }
        }

        for pair in self.trailing_tier_table.windows(2) {
            if pair[1].min_profit_pct <= pair[0].min_profit_pct {
                return Err(Error::config(
                    "trailing_tier_table must be strictly ascending by min_profit_pct",
                ));
            }
        }

        if FixedOffset::east_opt(self.market_utc_offset_mins * 60).is_none() {
            return Err(Error::config(format!(
                "market_utc_offset_mins out of range: {}",
                self.market_utc_offset_mins
            )));
        }
        self.session_close_time()?;
        self.time_exit_time()?;
        Ok(())
    }

    pub fn market_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.market_utc_offset_mins * 60).unwrap_or(Utc.fix())
    }

    /// Convert a UTC instant to the market's local time.
    pub fn market_local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.market_offset())
    }

    pub fn session_close_time(&self) -> Result<Option<NaiveTime>> {
        self.session_close_at
            .as_deref()
            .map(|s| parse_clock("session_close_at", s))
            .transpose()
    }

    pub fn time_exit_time(&self) -> Result<Option<NaiveTime>> {
        self.time_exit_at
            .as_deref()
            .map(|s| parse_clock("time_exit_at", s))
            .transpose()
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }

    pub fn cycle_interval(&self, has_positions: bool) -> Duration {
        if has_positions {
            Duration::from_millis(self.cycle_interval_active_ms)
        } else {
            Duration::from_millis(self.cycle_interval_idle_ms)
        }
    }

    pub fn pnl_staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.pnl_staleness_threshold_secs)
    }

    pub fn pnl_sync_interval(&self) -> Duration {
        Duration::from_secs(self.pnl_sync_interval_secs)
    }

    pub fn pnl_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pnl_cache_ttl_secs)
    }

    pub fn pnl_flush_interval(&self) -> Duration {
        Duration::from_millis(self.pnl_flush_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn supervisor_restart_delay(&self) -> Duration {
        Duration::from_millis(self.supervisor_restart_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Daemon configuration: external endpoints plus the risk settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Streaming market-data WebSocket endpoint.
    pub feed_url: String,
    /// Fallback last-traded-price REST endpoint.
    pub quote_api_url: String,
    /// PostgreSQL URL. Unset runs on the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Redis URL for the shared PnL cache. Unset keeps snapshots in-process.
    pub redis_url: Option<String>,
    /// Submit real orders. Paper fills otherwise.
    pub live_trading: bool,
    pub broker_url: Option<String>,
    pub broker_api_key: Option<String>,
    pub order_timeout_ms: u64,
    pub quote_timeout_ms: u64,
    pub feed_ping_interval_secs: u64,
    pub feed_read_timeout_secs: u64,
    /// Bind address of the health endpoint.
    pub health_addr: String,
    pub risk: RiskConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed_url: String::new(),
            quote_api_url: String::new(),
            database_url: None,
            database_max_connections: 5,
            redis_url: None,
            live_trading: false,
            broker_url: None,
            broker_api_key: None,
            order_timeout_ms: 5000,
            quote_timeout_ms: 2000,
            feed_ping_interval_secs: 15,
            feed_read_timeout_secs: 45,
            health_addr: "0.0.0.0:8081".to_string(),
            risk: RiskConfig::default(),
        }
    }
}

fn require_url(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::config(format!("{field} is required")));
    }
    url::Url::parse(value).map_err(|e| Error::config(format!("{field}: {e}")))?;
    Ok(())
}

impl AppConfig {
    /// Load from `.env`, an optional TOML file and the environment.
    #[allow(clippy::result_large_err)]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("risk.disabled_rules"),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        require_url("feed_url", &self.feed_url)?;
        require_url("quote_api_url", &self.quote_api_url)?;
        if self.live_trading {
            let broker_url = self.broker_url.as_deref().unwrap_or_default();
            require_url("broker_url", broker_url)?;
            if self.broker_api_key.as_deref().unwrap_or_default().is_empty() {
                return Err(Error::config("broker_api_key is required when live_trading is set"));
            }
        }
        self.risk.validate()
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }

    pub fn feed_ping_interval(&self) -> Duration {
        Duration::from_secs(self.feed_ping_interval_secs)
    }

    pub fn feed_read_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_read_timeout_secs)
    }

    /// Load configuration for testing (with defaults).
    pub fn test_config() -> Self {
        Self {
            feed_url: "ws://127.0.0.1:9001/ticks".to_string(),
            quote_api_url: "http://127.0.0.1:9002".to_string(),
            ..Self::default()
        }
    }
}
