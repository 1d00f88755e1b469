// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Observable stream of membership deltas.
//!
//! The dispatch lane publishes every delta it produces; subscribers receive
//! them in production order, at most once each. A subscriber attached after
//! a delta was produced does not see it, and once the hub is closed new
//! subscribers observe only a completed stream.

use parking_lot::Mutex;
use tokio::sync::broadcast;

use shoal_core::Member;

/// Capacity of the delta stream per subscriber. A subscriber that falls
/// further behind than this observes a lag error and continues from the
/// oldest retained delta.
const CHANNEL_CAPACITY: usize = 1024;

/// Multi-producer, multi-subscriber membership delta stream with explicit
/// completion.
pub struct ObserverHub {
    inner: Mutex<Option<broadcast::Sender<Member>>>,
}

impl ObserverHub {
    /// Creates an open hub.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { inner: Mutex::new(Some(tx)) }
    }

    /// Subscribes to deltas produced from this point on.
    ///
    /// On a closed hub the returned receiver yields only
    /// [`broadcast::error::RecvError::Closed`].
    pub fn subscribe(&self) -> broadcast::Receiver<Member> {
        match &*self.inner.lock() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Publishes a delta to all current subscribers. Publishing to a closed
    /// hub is a no-op.
    pub fn publish(&self, member: &Member) {
        if let Some(tx) = &*self.inner.lock() {
            // An error here only means there are no subscribers right now.
            let _ = tx.send(member.clone());
        }
    }

    /// Completes the stream. Idempotent.
    pub fn close(&self) {
        self.inner.lock().take();
    }

    /// Returns true once the stream has been completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}
