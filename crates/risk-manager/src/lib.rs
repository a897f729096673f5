//! Risk Manager
//!
//! Real-time risk engine for open option positions: hot caches fed by the
//! market feed, prioritized exit rules, tiered trailing stops, circuit
//! breakers around external calls and exactly-once exit execution.

pub mod circuit_breaker;
pub mod exit_engine;
pub mod metrics;
pub mod monitor;
pub mod pnl_cache;
pub mod position_cache;
pub mod rule_engine;
pub mod rules;
pub mod supervisor;
pub mod tick_listener;
pub mod trailing;
pub mod underlying;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use exit_engine::{ExitEngine, ExitOutcome};
pub use metrics::{CycleStats, HealthReport, RiskMetrics};
pub use monitor::{RiskComponents, RiskManager};
pub use pnl_cache::{MemoryBackend, PnlCache, PnlCacheConfig, RedisBackend, SnapshotBackend};
pub use position_cache::PositionCache;
pub use rule_engine::{Evaluation, ExitSignal, Rule, RuleContext, RuleEngine, RuleResult};
pub use rules::{
    standard_rules, BracketLimitRule, SecureProfitRule, SessionEndRule, StopLossRule,
    TakeProfitRule, TimeExitRule, UnderlyingExitRule,
};
pub use supervisor::Supervisor;
pub use tick_listener::TickListener;
pub use trailing::{PeakDrawdownRule, TrailingEngine, TrailingStopRule, TrailingUpdate};
pub use underlying::{UnderlyingBoard, UnderlyingSource};
