//! In-flight refresh leases.
//!
//! The first caller for a key becomes the leader and runs the refresh;
//! everyone arriving while it runs gets a waiter on the leader's result.
//! Leases live only in memory and disappear when the refresh finishes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use tokio::sync::watch;

use super::RefreshOutcome;
use crate::errors::{Error, Result};
use crate::model::CacheKey;

type Slot = Option<Result<RefreshOutcome>>;

/// Process-wide table of refreshes in flight, keyed by `(ticker, kind)`.
#[derive(Clone, Default)]
pub struct LeaseTable {
    inflight: Arc<DashMap<CacheKey, watch::Receiver<Slot>>>,
}

/// Result of [`LeaseTable::acquire`].
pub enum Lease {
    /// This caller runs the refresh and must complete the guard.
    Leader(LeaseGuard),
    /// Another caller is refreshing the key; wait for its result.
    Follower(LeaseWaiter),
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &CacheKey) -> Lease {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!("Refresh of {} in flight; coalescing", key);
                Lease::Follower(LeaseWaiter {
                    key: key.clone(),
                    rx: existing.get().clone(),
                })
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Lease::Leader(LeaseGuard {
                    key: key.clone(),
                    table: self.inflight.clone(),
                    tx: Some(tx),
                })
            }
        }
    }

    /// Number of keys being refreshed right now.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

/// Held by the leader. Dropping it without completing releases the lease
/// and fails the waiters.
pub struct LeaseGuard {
    key: CacheKey,
    table: Arc<DashMap<CacheKey, watch::Receiver<Slot>>>,
    tx: Option<watch::Sender<Slot>>,
}

impl LeaseGuard {
    /// Publish the leader's result and release the lease.
    pub fn complete(mut self, result: Result<RefreshOutcome>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<RefreshOutcome>) {
        if let Some(tx) = self.tx.take() {
            self.table.remove(&self.key);
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let key = self.key.to_string();
        self.finish(Err(Error::UpstreamUnavailable(format!(
            "refresh of {} was abandoned",
            key
        ))));
    }
}

/// Held by a follower.
pub struct LeaseWaiter {
    key: CacheKey,
    rx: watch::Receiver<Slot>,
}

impl LeaseWaiter {
    /// Wait up to `timeout` for the leader. A success is reported as
    /// [`RefreshOutcome::Coalesced`]; a failure is the leader's error.
    pub async fn wait(mut self, timeout: Duration) -> Result<RefreshOutcome> {
        let waited = tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some)).await;
        match waited {
            Err(_) => Err(Error::Timeout(format!(
                "waiting {:?} for the refresh of {}",
                timeout, self.key
            ))),
            Ok(Err(_)) => Err(Error::UpstreamUnavailable(format!(
                "refresh of {} ended without a result",
                self.key
            ))),
            Ok(Ok(slot)) => match slot.as_ref() {
                Some(Ok(_)) => Ok(RefreshOutcome::Coalesced),
                Some(Err(err)) => Err(err.clone()),
                None => Err(Error::UpstreamUnavailable(format!(
                    "refresh of {} ended without a result",
                    self.key
                ))),
            },
        }
    }
}
