//! Order executor for exit orders and stop modifications.

use async_trait::async_trait;
use dashmap::DashMap;
use options_core::types::{
    ExitOrder, OrderConfirmation, OrderSide, OrderStatus, StopModification,
};
use options_core::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::router::OrderRouter;

/// Counters for order execution.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    pub orders_submitted: AtomicU64,
    pub orders_filled: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub stop_modifications: AtomicU64,
    total_latency_us: AtomicU64,
}

impl ExecutionMetrics {
    pub fn avg_latency_us(&self) -> u64 {
        let submitted = self.orders_submitted.load(Ordering::Relaxed);
        if submitted == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / submitted
    }
}

/// Configuration for the order executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Whether to actually execute orders (false = paper trading).
    pub live_trading: bool,
    /// Broker REST base URL, required when live.
    pub broker_url: Option<String>,
    /// Broker API key, sent as a bearer token.
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Orders above this quantity are rejected without submission.
    pub max_order_quantity: Decimal,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            live_trading: false,
            broker_url: None,
            api_key: None,
            timeout: Duration::from_secs(5),
            max_order_quantity: Decimal::new(100_000, 0),
        }
    }
}

#[derive(Serialize)]
struct BrokerOrderRequest<'a> {
    client_order_id: Uuid,
    segment: &'a str,
    instrument_id: &'a str,
    side: OrderSide,
    quantity: Decimal,
    order_type: &'static str,
}

#[derive(Deserialize)]
struct BrokerOrderResponse {
    order_ref: String,
    #[serde(default)]
    status: Option<OrderStatus>,
    #[serde(default)]
    filled_quantity: Option<Decimal>,
    #[serde(default)]
    average_price: Option<Decimal>,
}

#[derive(Serialize)]
struct BrokerStopRequest<'a> {
    instrument_id: &'a str,
    stop_price: Decimal,
}

/// Routes exit orders to the broker, or fills them on paper.
pub struct OrderExecutor {
    config: ExecutorConfig,
    http_client: reqwest::Client,
    /// Orders submitted and not yet acknowledged.
    in_flight: DashMap<Uuid, ExitOrder>,
    metrics: ExecutionMetrics,
}

impl OrderExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        if config.live_trading && config.broker_url.is_none() {
            return Err(Error::config("live trading requires a broker_url"));
        }
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        info!(live_trading = config.live_trading, "Created order executor");
        Ok(Self {
            config,
            http_client,
            in_flight: DashMap::new(),
            metrics: ExecutionMetrics::default(),
        })
    }

    /// Paper-trading executor.
    pub fn paper() -> Result<Self> {
        Self::new(ExecutorConfig::default())
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn broker_url(&self) -> Result<&str> {
        self.config
            .broker_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .ok_or_else(|| Error::config("broker_url not configured"))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn submit_live(&self, order: &ExitOrder) -> Result<OrderConfirmation> {
        let url = format!("{}/orders", self.broker_url()?);
        let body = BrokerOrderRequest {
            client_order_id: order.id,
            segment: &order.segment,
            instrument_id: &order.instrument_id,
            side: order.side,
            quantity: order.quantity,
            order_type: "market",
        };

        let response = self
            .authorized(self.http_client.post(url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            warn!(order_id = %order.id, status = %status, "Broker rejected exit order");
            return Ok(OrderConfirmation::rejected(
                order.id,
                format!("{status}: {text}"),
            ));
        }
        if !status.is_success() {
            return Err(Error::Order {
                message: format!("broker returned {status}"),
            });
        }

        let ack: BrokerOrderResponse = response.json().await?;
        info!(
            order_id = %order.id,
            broker_ref = %ack.order_ref,
            "Live exit order submitted"
        );

        Ok(OrderConfirmation {
            order_id: order.id,
            broker_order_ref: Some(ack.order_ref),
            status: ack.status.unwrap_or(OrderStatus::Pending),
            filled_quantity: ack.filled_quantity.unwrap_or(Decimal::ZERO),
            average_price: ack.average_price,
            executed_at: chrono::Utc::now(),
            error: None,
        })
    }

    fn simulate(&self, order: &ExitOrder) -> OrderConfirmation {
        info!(
            order_id = %order.id,
            position_id = %order.position_id,
            side = ?order.side,
            price = %order.reference_price,
            quantity = %order.quantity,
            "[PAPER] Simulated exit fill"
        );
        OrderConfirmation::filled(
            order.id,
            None,
            order.quantity,
            order.reference_price,
        )
    }

    fn record(&self, confirmation: &OrderConfirmation, latency_us: u64) {
        self.metrics.orders_submitted.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        if confirmation.is_success() {
            self.metrics.orders_filled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.orders_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl OrderRouter for OrderExecutor {
    async fn submit_exit(&self, order: &ExitOrder) -> Result<OrderConfirmation> {
        let start = std::time::Instant::now();

        if order.quantity <= Decimal::ZERO || order.quantity > self.config.max_order_quantity {
            let confirmation = OrderConfirmation::rejected(
                order.id,
                format!(
                    "Order quantity {} outside (0, {}]",
                    order.quantity, self.config.max_order_quantity
                ),
            );
            self.record(&confirmation, 0);
            return Ok(confirmation);
        }

        self.in_flight.insert(order.id, order.clone());
        let result = if self.config.live_trading && !order.simulated {
            self.submit_live(order).await
        } else {
            Ok(self.simulate(order))
        };
        self.in_flight.remove(&order.id);

        let confirmation = result?;
        let latency_us = start.elapsed().as_micros() as u64;
        self.record(&confirmation, latency_us);

        debug!(
            order_id = %order.id,
            status = ?confirmation.status,
            latency_us = latency_us,
            "Exit order complete"
        );
        Ok(confirmation)
    }

    async fn modify_stop(&self, modification: &StopModification) -> Result<()> {
        self.metrics
            .stop_modifications
            .fetch_add(1, Ordering::Relaxed);

        if !self.config.live_trading {
            info!(
                broker_ref = %modification.broker_order_ref,
                stop_price = %modification.stop_price,
                "[PAPER] Simulated stop modification"
            );
            return Ok(());
        }

        let url = format!(
            "{}/orders/{}/stop",
            self.broker_url()?,
            modification.broker_order_ref
        );
        let body = BrokerStopRequest {
            instrument_id: &modification.instrument_id,
            stop_price: modification.stop_price,
        };
        let response = self
            .authorized(self.http_client.put(url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Order {
                message: format!("stop modification failed: {}", response.status()),
            });
        }

        info!(
            broker_ref = %modification.broker_order_ref,
            stop_price = %modification.stop_price,
            "Broker stop moved"
        );
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.config.live_trading
    }
}
