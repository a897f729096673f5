//! Market-feed listener.
//!
//! Keeps one feed connection open for the current subscription set, pushes
//! every tick into the hot cache and fans it out on a broadcast channel.
//! PnL snapshots are written by a separate flush worker so a burst of ticks
//! never waits on the snapshot backend.

use dashmap::{DashMap, DashSet};
use futures_util::StreamExt;
use options_core::api::TickSource;
use options_core::types::Tick;
use options_core::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::RiskMetrics;
use crate::pnl_cache::PnlCache;
use crate::position_cache::PositionCache;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BROADCAST_CAPACITY: usize = 1024;

enum Disconnect {
    Shutdown,
    Resubscribe,
    Lost,
}

pub struct TickListener {
    source: Arc<dyn TickSource>,
    cache: Arc<PositionCache>,
    pnl_cache: Arc<PnlCache>,
    metrics: Arc<RiskMetrics>,
    subscriptions: DashMap<String, ()>,
    /// Bumped whenever a new instrument joins the subscription set.
    version: watch::Sender<u64>,
    dirty: DashSet<Uuid>,
    tx: broadcast::Sender<Tick>,
    flush_interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl TickListener {
    pub fn new(
        source: Arc<dyn TickSource>,
        cache: Arc<PositionCache>,
        pnl_cache: Arc<PnlCache>,
        metrics: Arc<RiskMetrics>,
        flush_interval: Duration,
    ) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (version, _) = watch::channel(0);
        Self {
            source,
            cache,
            pnl_cache,
            metrics,
            subscriptions: DashMap::new(),
            version,
            dirty: DashSet::new(),
            tx,
            flush_interval,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Override reconnect backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Add an instrument. A new instrument triggers a re-subscribe of the
    /// live connection.
    pub fn subscribe(&self, instrument_id: &str) -> bool {
        let added = self
            .subscriptions
            .insert(instrument_id.to_string(), ())
            .is_none();
        if added {
            debug!(instrument_id, "Subscribed instrument");
            self.version.send_modify(|v| *v += 1);
        }
        added
    }

    /// Drop an instrument. Takes effect on the next (re)connect.
    pub fn unsubscribe(&self, instrument_id: &str) -> bool {
        let removed = self.subscriptions.remove(instrument_id).is_some();
        if removed {
            debug!(instrument_id, "Unsubscribed instrument");
        }
        removed
    }

    pub fn is_subscribed(&self, instrument_id: &str) -> bool {
        self.subscriptions.contains_key(instrument_id)
    }

    /// Current subscription set, sorted.
    pub fn subscribed(&self) -> Vec<String> {
        let mut instruments: Vec<String> =
            self.subscriptions.iter().map(|e| e.key().clone()).collect();
        instruments.sort();
        instruments
    }

    /// Receiver for every tick seen from now on.
    pub fn subscribers(&self) -> broadcast::Receiver<Tick> {
        self.tx.subscribe()
    }

    /// Apply one tick: reprice matching positions, mark them dirty and
    /// broadcast. Returns how many positions changed.
    pub fn handle_tick(&self, tick: &Tick) -> usize {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let changed = self
            .cache
            .update_price(&tick.instrument_id, tick.price, tick.timestamp);
        for id in &changed {
            self.dirty.insert(*id);
        }
        // No receivers is fine.
        let _ = self.tx.send(tick.clone());
        changed.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Write snapshots for every dirty position and run the throttled
    /// durable sync. Returns how many snapshots were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let ids: Vec<Uuid> = self.dirty.iter().map(|id| *id).collect();
        let mut flushed = 0;
        let mut first_error = None;

        for id in ids {
            self.dirty.remove(&id);
            let Some(position) = self.cache.get(id) else {
                continue;
            };
            if let Err(e) = self.pnl_cache.store(&position.snapshot()).await {
                warn!(position_id = %id, error = %e, "Failed to cache PnL snapshot");
                self.dirty.insert(id);
                first_error.get_or_insert(e);
                continue;
            }
            flushed += 1;
            if let Err(e) = self.pnl_cache.sync_throttled(id).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) if flushed == 0 => Err(e),
            _ => Ok(flushed),
        }
    }

    /// Feed connection loop. Reconnects with exponential backoff until
    /// shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = self.initial_backoff;
        let mut version_rx = self.version.subscribe();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let _ = version_rx.borrow_and_update();
            let instruments = self.subscribed();
            if instruments.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    _ = version_rx.changed() => continue,
                }
            }

            match self.source.open(&instruments).await {
                Ok(stream) => {
                    info!(instruments = instruments.len(), "Market feed connected");
                    match self
                        .pump(stream, &mut shutdown, &mut version_rx, &mut backoff)
                        .await
                    {
                        Disconnect::Shutdown => return Ok(()),
                        Disconnect::Resubscribe => {
                            info!("Subscription set changed, resubscribing");
                            continue;
                        }
                        Disconnect::Lost => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Market feed connect failed");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn pump(
        &self,
        mut stream: options_core::api::TickStream,
        shutdown: &mut watch::Receiver<bool>,
        version_rx: &mut watch::Receiver<u64>,
        backoff: &mut Duration,
    ) -> Disconnect {
        let mut received = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Disconnect::Shutdown,
                Ok(()) = version_rx.changed() => return Disconnect::Resubscribe,
                item = stream.next() => match item {
                    Some(Ok(tick)) => {
                        if !received {
                            received = true;
                            *backoff = self.initial_backoff;
                        }
                        self.handle_tick(&tick);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Market feed disconnected");
                        return Disconnect::Lost;
                    }
                    None => {
                        warn!("Market feed stream ended");
                        return Disconnect::Lost;
                    }
                },
            }
        }
    }

    /// Flush worker. Drains the dirty set every flush interval and once more
    /// on shutdown.
    pub async fn run_flush(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Err(e) = self.flush_dirty().await {
                        warn!(error = %e, "Final PnL flush failed");
                    }
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.flush_dirty().await {
                        warn!(error = %e, "PnL flush failed");
                        self.metrics.record_error(chrono::Utc::now());
                    }
                }
            }
        }
    }
}
