//! Health and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use risk_manager::{HealthReport, RiskManager};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(manager: Arc<RiskManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Full health report. Always 200 while the process serves requests.
pub async fn health(State(manager): State<Arc<RiskManager>>) -> Json<HealthReport> {
    Json(manager.health())
}

/// 503 until the monitoring loop is running, or while any breaker is open.
pub async fn readiness(
    State(manager): State<Arc<RiskManager>>,
) -> (StatusCode, Json<HealthReport>) {
    let report = manager.health();
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use options_core::api::{HttpQuoteProvider, WsTickSource};
    use options_core::config::RiskConfig;
    use options_core::db::MemoryPositionStore;
    use risk_manager::{MemoryBackend, RiskComponents, UnderlyingBoard};
    use std::time::Duration;
    use trading_engine::OrderExecutor;

    fn manager() -> Arc<RiskManager> {
        let components = RiskComponents {
            store: Arc::new(MemoryPositionStore::new()),
            router: Arc::new(OrderExecutor::paper().unwrap()),
            quotes: Arc::new(
                HttpQuoteProvider::new("http://127.0.0.1:9002", Duration::from_secs(1)).unwrap(),
            ),
            feed: Arc::new(WsTickSource::new("ws://127.0.0.1:9001/ticks")),
            snapshots: Arc::new(MemoryBackend::new()),
            underlying: Arc::new(UnderlyingBoard::new()),
        };
        let config = RiskConfig {
            session_close_at: None,
            ..RiskConfig::default()
        };
        Arc::new(RiskManager::new(config, components).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_idle_manager() {
        let Json(report) = health(State(manager())).await;
        assert!(!report.running);
        assert_eq!(report.active_position_count, 0);
        assert_eq!(report.circuit_breaker_state, "closed");
    }

    #[tokio::test]
    async fn test_not_ready_until_running() {
        let manager = manager();
        let (status, _) = readiness(State(manager.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        manager.metrics().set_running(true);
        let (status, Json(report)) = readiness(State(manager)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report.running);
    }
}
