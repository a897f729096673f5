//! Options Core Library
//!
//! Shared domain types, configuration, market-feed clients and the durable
//! position store used by the risk-management core.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod types;

pub use error::{Error, Result};
