//! Connection keepalive.
//!
//! A dedicated thread runs a small Tokio runtime that, once per second,
//! drains server notifications into the engine, pings the server every
//! `keepalive_interval_secs` and refreshes fee data every
//! `fee_refresh_interval_secs`. Decoy rebroadcasts planned by new blocks
//! are run after their random delay on the blocking pool.
//!
//! The per-second work lives in [`ConnectionKeepalive::tick`], which tests
//! drive directly with a synthetic clock.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::sync::engine::decoy::RebroadcastPlan;
use crate::sync::engine::SyncEngine;
use crate::sync::error::Result;
use crate::sync::runtime::cancel::CancelToken;
use crate::sync::types::{FeeRatesUpdate, Notification};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Work done by one [`ConnectionKeepalive::tick`].
#[derive(Debug, Default)]
pub struct KeepaliveTick {
    pub notifications: Vec<Notification>,
    pub rebroadcasts: Vec<RebroadcastPlan>,
    pub pinged: bool,
    pub fee_rates: Option<FeeRatesUpdate>,
}

pub struct ConnectionKeepalive {
    engine: Arc<SyncEngine>,
    minimum_relay_fee: f64,
    last_ping: Instant,
    last_fee_refresh: Instant,
}

impl ConnectionKeepalive {
    /// `minimum_relay_fee` floors the refreshed target rates, as on connect.
    pub fn new(engine: Arc<SyncEngine>, minimum_relay_fee: f64, now: Instant) -> Self {
        Self {
            engine,
            minimum_relay_fee,
            last_ping: now,
            last_fee_refresh: now,
        }
    }

    /// Drains notifications, then pings and refreshes fees when due.
    ///
    /// Only a failed ping is an error: the connection is gone. A failed fee
    /// refresh is logged and retried on the next interval.
    pub fn tick(&mut self, now: Instant) -> Result<KeepaliveTick> {
        let mut tick = KeepaliveTick::default();
        let transport = self.engine.transport();

        for notification in transport.drain_notifications() {
            if let Some(plan) = self.engine.handle_notification(&notification) {
                tick.rebroadcasts.push(plan);
            }
            tick.notifications.push(notification);
        }

        let config = self.engine.config();
        if now.duration_since(self.last_ping) >= config.keepalive_interval() {
            transport.ping()?;
            self.last_ping = now;
            tick.pinged = true;
        }

        if now.duration_since(self.last_fee_refresh) >= config.fee_refresh_interval() {
            self.last_fee_refresh = now;
            match self.engine.fees().fee_rates_update(self.minimum_relay_fee) {
                Ok(update) => tick.fee_rates = Some(update),
                Err(e) => log::warn!("[KEEPALIVE] Fee refresh failed: {}", e),
            }
        }

        Ok(tick)
    }

    /// Runs the keepalive on its own thread until `cancel` fires or the
    /// server stops answering pings.
    pub fn spawn(self, initial: FeeRatesUpdate, cancel: CancelToken) -> std::io::Result<KeepaliveHandle> {
        let (fee_tx, fee_rx) = watch::channel(initial);
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let thread_cancel = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("electrum-keepalive".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("[KEEPALIVE] Could not start runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(self.run(thread_cancel, fee_tx, note_tx));
            })?;

        Ok(KeepaliveHandle {
            cancel,
            fee_rates: fee_rx,
            notifications: note_rx,
            thread: Some(thread),
        })
    }

    async fn run(
        mut self,
        cancel: CancelToken,
        fee_tx: watch::Sender<FeeRatesUpdate>,
        note_tx: mpsc::UnboundedSender<Notification>,
    ) {
        log::info!("[KEEPALIVE] Started");
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Blocking RPCs; rebroadcast tasks run on the worker thread meanwhile.
            let tick = match self.tick(Instant::now()) {
                Ok(tick) => tick,
                Err(e) => {
                    log::error!("[KEEPALIVE] Connection lost: {}", e);
                    break;
                }
            };

            if let Some(update) = tick.fee_rates {
                fee_tx.send_replace(update);
            }
            for notification in tick.notifications {
                // Nobody listening is fine.
                let _ = note_tx.send(notification);
            }
            for plan in tick.rebroadcasts {
                self.schedule_rebroadcast(plan);
            }
        }
        log::info!("[KEEPALIVE] Stopped");
    }

    fn schedule_rebroadcast(&self, plan: RebroadcastPlan) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(plan.delay).await;
            let result = tokio::task::spawn_blocking(move || engine.decoys().execute_rebroadcast(&plan)).await;
            if let Err(e) = result {
                log::debug!("[KEEPALIVE] Rebroadcast task failed: {}", e);
            }
        });
    }
}

/// Owner side of a running keepalive.
pub struct KeepaliveHandle {
    cancel: CancelToken,
    fee_rates: watch::Receiver<FeeRatesUpdate>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    thread: Option<JoinHandle<()>>,
}

impl KeepaliveHandle {
    /// Latest published fee data.
    pub fn fee_rates(&self) -> FeeRatesUpdate {
        self.fee_rates.borrow().clone()
    }

    /// Next notification already handled by the engine, if any.
    pub fn try_next_notification(&mut self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    /// Blocks until the next notification; `None` once the keepalive stopped.
    pub fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.blocking_recv()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the loop and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[KEEPALIVE] Thread panicked");
            }
        }
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
