// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Failure detector contract.
//!
//! The membership service does not probe peers itself; it consumes
//! alive/suspect verdicts from a failure detector and feeds membership
//! changes back so the detector probes the right peer set. A phi-accrual
//! implementation is provided in [`crate::phi`].

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::broadcast;

use shoal_core::Endpoint;

/// A liveness verdict kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdStatus {
    /// The peer responded recently and is believed alive.
    Alive,
    /// The peer has stopped responding.
    Suspect,
}

/// A liveness verdict about a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdEvent {
    /// The endpoint the verdict is about.
    pub endpoint: Endpoint,
    /// The verdict.
    pub status: FdStatus,
}

impl FdEvent {
    /// Creates an alive verdict.
    #[must_use]
    pub fn alive(endpoint: Endpoint) -> Self {
        Self { endpoint, status: FdStatus::Alive }
    }

    /// Creates a suspect verdict.
    #[must_use]
    pub fn suspect(endpoint: Endpoint) -> Self {
        Self { endpoint, status: FdStatus::Suspect }
    }
}

/// Failure detector consumed by the membership service.
#[async_trait]
pub trait FailureDetector: Send + Sync + 'static {
    /// Replaces the set of endpoints the detector should probe.
    async fn set_cluster_endpoints(&self, endpoints: HashSet<Endpoint>);

    /// Hints that membership now considers the endpoint suspected.
    fn suspect(&self, endpoint: &Endpoint);

    /// Hints that membership now considers the endpoint trusted.
    fn trust(&self, endpoint: &Endpoint);

    /// Subscribes to the stream of liveness verdicts.
    fn listen_status(&self) -> broadcast::Receiver<FdEvent>;
}

/// A failure detector that never emits a verdict.
///
/// Useful for single-node deployments and tests where liveness is driven
/// some other way.
pub struct NoOpFailureDetector {
    status_tx: broadcast::Sender<FdEvent>,
}

impl NoOpFailureDetector {
    /// Creates a new no-op detector.
    #[must_use]
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self { status_tx }
    }
}

impl Default for NoOpFailureDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailureDetector for NoOpFailureDetector {
    async fn set_cluster_endpoints(&self, _endpoints: HashSet<Endpoint>) {}

    fn suspect(&self, _endpoint: &Endpoint) {}

    fn trust(&self, _endpoint: &Endpoint) {}

    fn listen_status(&self) -> broadcast::Receiver<FdEvent> {
        self.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_detector_never_emits() {
        let detector = NoOpFailureDetector::new();
        let mut rx = detector.listen_status();

        detector.set_cluster_endpoints(HashSet::new()).await;
        detector.suspect(&Endpoint::new("node-1", "localhost", 1));
        detector.trust(&Endpoint::new("node-1", "localhost", 1));

        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }
}
