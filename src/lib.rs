//! Options Bot: real-time risk management for open option positions
//!
//! This is the root crate that provides benchmark access to the internal modules.
//! For actual functionality, use the individual crates directly:
//!
//! - `options-core`: Domain types, configuration, feed and quote clients, position store
//! - `trading-engine`: Exit order routing, paper and live
//! - `risk-manager`: Caches, exit rules, trailing stops, circuit breakers, the monitoring loop
//! - `risk-daemon`: Process entrypoint and health endpoints

// Re-export for benchmarks
pub use options_core as core;
pub use risk_manager as risk;
pub use trading_engine as trading;
