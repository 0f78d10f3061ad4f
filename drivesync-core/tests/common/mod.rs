//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drivesync_core::sync::{BatchAck, RemoteApi};
use drivesync_core::{
    Error, LocalStore, PositionSample, Result, StoredEvent, StoredPosition,
};
use tokio::sync::{Notify, Semaphore};

/// In-process stand-in for the remote batch API.
///
/// Records every batch it is offered (including failed ones) as the list of
/// `client_id`s it carried.
#[derive(Default)]
pub struct FakeRemote {
    pub position_batches: Mutex<Vec<Vec<String>>>,
    pub event_batches: Mutex<Vec<Vec<String>>>,
    /// Errors returned, in order, before the fake starts accepting
    pub failures: Mutex<VecDeque<Error>>,
    /// Reject position batches larger than this with `BatchTooLarge`
    pub position_limit: Option<usize>,
    /// When set, each send waits for a permit
    pub gate: Option<Arc<Semaphore>>,
    /// Signalled when a send starts
    pub entered: Arc<Notify>,
    pub calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(errors: Vec<Error>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            ..Default::default()
        }
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn position_batch_sizes(&self) -> Vec<usize> {
        self.position_batches
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect()
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn send_positions(&self, batch: &[StoredPosition]) -> Result<BatchAck> {
        self.position_batches
            .lock()
            .unwrap()
            .push(batch.iter().map(|p| p.client_id.clone()).collect());
        self.enter().await?;
        if let Some(limit) = self.position_limit {
            if batch.len() > limit {
                return Err(Error::BatchTooLarge { size: batch.len() });
            }
        }
        Ok(BatchAck {
            accepted: batch.len(),
            message: None,
        })
    }

    async fn send_events(&self, batch: &[StoredEvent]) -> Result<BatchAck> {
        self.event_batches
            .lock()
            .unwrap()
            .push(batch.iter().map(|e| e.client_id.clone()).collect());
        self.enter().await?;
        Ok(BatchAck {
            accepted: batch.len(),
            message: None,
        })
    }
}

pub fn memory_store() -> Arc<LocalStore> {
    let store = LocalStore::open_in_memory().unwrap();
    store.migrate().unwrap();
    Arc::new(store)
}

pub fn fill_positions(store: &LocalStore, n: usize, at: DateTime<Utc>) {
    for i in 0..n {
        let sample = PositionSample::new(at, 40.0, -3.0, (i % 120) as f64);
        store.append_position(&sample).unwrap();
    }
}

/// Poll `cond` until it holds, failing the test after ~5 s.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
