//! Sync triggers
//!
//! [`SyncScheduler`] fires [`SyncEngine::run_cycle`] on a fixed interval and
//! whenever connectivity comes back. Cycles run as spawned tasks, so a tick
//! that lands while a cycle is still sending is coalesced by the engine
//! rather than queued behind it, and shutdown or connectivity changes are
//! handled while a cycle is in flight.
//!
//! [`Connectivity::follow_reachability`] feeds the connectivity signal from
//! periodic TCP connects to the remote host.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use super::engine::{CycleOutcome, SyncEngine};

/// Handle for reporting connectivity changes to a running scheduler.
///
/// Only changes are forwarded; setting the current value again is a no-op.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Check `base_url` every `every` and report the result. Runs until the
    /// task is dropped.
    pub async fn follow_reachability(self, base_url: String, every: Duration, timeout: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let online = remote_reachable(&base_url, timeout).await;
            if online != self.is_online() {
                tracing::info!(online, url = %base_url, "Remote reachability changed");
            }
            self.set_online(online);
        }
    }
}

/// Whether a TCP connection to the host behind `base_url` opens within
/// `timeout`. Unparseable URLs count as unreachable.
pub async fn remote_reachable(base_url: &str, timeout: Duration) -> bool {
    let url = match reqwest::Url::parse(base_url) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(url = base_url, error = %e, "Invalid remote URL");
            return false;
        }
    };
    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        return false;
    };

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(host, port, error = %e, "Remote unreachable");
            false
        }
        Err(_) => {
            tracing::debug!(host, port, "Remote connect timed out");
            false
        }
    }
}

/// Handle for stopping a running scheduler.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the scheduler to stop. A cycle in progress is allowed to finish.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Why a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    ConnectivityRestored,
}

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    online_tx: Arc<watch::Sender<bool>>,
    online_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        let (online_tx, online_rx) = watch::channel(engine.is_online());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            interval,
            online_tx: Arc::new(online_tx),
            online_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        Connectivity {
            tx: self.online_tx.clone(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until shut down. The first interval tick fires immediately.
    ///
    /// Every trigger spawns [`SyncEngine::run_cycle`]; while a cycle is in
    /// flight the extra tasks return [`CycleOutcome::Coalesced`] at once, so
    /// the loop itself never waits on the network.
    ///
    /// Returns the number of cycles that completed.
    pub async fn run(mut self) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cycles: JoinSet<CycleOutcome> = JoinSet::new();
        let mut completed = 0;

        tracing::info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");

        loop {
            let trigger = tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                    completed += count_completed(finished);
                    continue;
                }
                changed = self.online_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let online = *self.online_rx.borrow_and_update();
                    self.engine.set_online(online);
                    if !online {
                        continue;
                    }
                    Trigger::ConnectivityRestored
                }
                _ = ticker.tick() => {
                    if !self.engine.is_online() {
                        tracing::debug!("Offline, skipping scheduled sync");
                        continue;
                    }
                    Trigger::Interval
                }
            };

            tracing::debug!(?trigger, "Sync triggered");
            let engine = self.engine.clone();
            cycles.spawn(async move { engine.run_cycle().await });
        }

        // Let the in-flight cycle finish its reconciliation
        while let Some(finished) = cycles.join_next().await {
            completed += count_completed(finished);
        }

        tracing::info!(completed, "Sync scheduler stopped");
        completed
    }
}

fn count_completed(result: std::result::Result<CycleOutcome, JoinError>) -> usize {
    match result {
        Ok(CycleOutcome::Completed(_)) => 1,
        Ok(_) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "Sync task failed");
            0
        }
    }
}
