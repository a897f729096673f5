//! Trading Engine
//!
//! Exit order routing for the risk engine: paper fills and live broker
//! submission behind one [`OrderRouter`] contract.

pub mod executor;
pub mod router;

pub use executor::{ExecutionMetrics, ExecutorConfig, OrderExecutor};
pub use router::OrderRouter;
