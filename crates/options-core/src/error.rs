//! Error types for the options risk bot.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::types::PositionStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// Required configuration missing or invalid. Only raised at startup.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Network or API failure that is expected to clear on retry.
    #[error("Transient I/O error on {endpoint}: {message}")]
    Transient { endpoint: String, message: String },

    /// Cached data older than the allowed staleness window.
    #[error("Stale data for position {position_id}: {age:?} old")]
    Stale { position_id: Uuid, age: Duration },

    /// Malformed or missing input for an evaluation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lost a state-transition race to another caller.
    #[error("Concurrent update conflict on position {position_id}")]
    Conflict { position_id: Uuid },

    /// Call rejected by an open circuit without attempting I/O.
    #[error("Circuit open for {key}")]
    CircuitOpen { key: String },

    #[error("Invalid status transition for position {position_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        position_id: Uuid,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("Order error: {message}")]
    Order { message: String },

    #[error("Position not found: {0}")]
    NotFound(Uuid),
}

impl Error {
    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether retrying later can succeed. Transient errors feed the circuit
    /// breaker instead of aborting anything.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_)
                | Error::Http(_)
                | Error::Database(_)
                | Error::Redis(_)
                | Error::Transient { .. }
                | Error::Order { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("quotes:NFO", "timeout").is_transient());
        assert!(Error::Order {
            message: "rejected".to_string()
        }
        .is_transient());
        assert!(!Error::config("missing feed_url").is_transient());
        assert!(!Error::CircuitOpen {
            key: "quotes:NFO".to_string()
        }
        .is_transient());
        assert!(!Error::Conflict {
            position_id: Uuid::new_v4()
        }
        .is_transient());
    }
}
