// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Decay timer scheduling.
//!
//! One logical scheduler backs both kinds of decay the membership service
//! needs: keyed timers for suspected members (re-scheduling a key replaces
//! the previous task, cancelling disarms it) and unkeyed one-shot timers
//! for shut-down members. Firing accuracy is at least the requested delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct KeyedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Schedules and cancels delayed callbacks.
///
/// `schedule` and `cancel` are safe to call from any task. Callbacks run on
/// the runtime and must not block; the membership service uses them only to
/// enqueue commands onto its dispatch lane.
pub struct TimerWheel {
    keyed: Arc<DashMap<String, KeyedTimer>>,
    unkeyed: Mutex<Vec<JoinHandle<()>>>,
    generation: AtomicU64,
}

impl TimerWheel {
    /// Creates an empty timer wheel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keyed: Arc::new(DashMap::new()),
            unkeyed: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedules `task` to run after `delay`, keyed by `key`.
    ///
    /// If a timer with the same key is already armed it is replaced and the
    /// previous task never fires.
    pub fn schedule_keyed<F>(&self, key: &str, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let keyed = Arc::clone(&self.keyed);
        let owned_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Drop our own entry first so cancelling after fire is a no-op.
            // The generation guard keeps a fired task from evicting a
            // replacement armed while it was running.
            keyed.remove_if(&owned_key, |_, timer| timer.generation == generation);
            task();
        });

        if let Some(previous) = self.keyed.insert(key.to_string(), KeyedTimer { generation, handle })
        {
            previous.handle.abort();
        }
    }

    /// Schedules an unkeyed one-shot task to run after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });

        let mut unkeyed = self.unkeyed.lock();
        unkeyed.retain(|h| !h.is_finished());
        unkeyed.push(handle);
    }

    /// Cancels the keyed timer, if one is armed. Cancelling a fired or
    /// unknown key is a no-op.
    pub fn cancel(&self, key: &str) {
        if let Some((_, timer)) = self.keyed.remove(key) {
            timer.handle.abort();
        }
    }

    /// Returns true when a keyed timer is currently armed for `key`.
    #[must_use]
    pub fn is_armed(&self, key: &str) -> bool {
        self.keyed.get(key).map(|t| !t.handle.is_finished()).unwrap_or(false)
    }

    /// Aborts every pending timer.
    pub fn stop(&self) {
        self.keyed.retain(|_, timer| {
            timer.handle.abort();
            false
        });
        for handle in self.unkeyed.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
