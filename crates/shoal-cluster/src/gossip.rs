// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Gossip protocol contract.
//!
//! The membership service republishes its deltas through a gossip
//! disseminator and merges membership payloads that arrive by gossip.
//! How the disseminator fans messages out across the cluster is its own
//! business; the core only requires that a spread message eventually
//! reaches every peer in the configured endpoint set.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::broadcast;

use shoal_core::Endpoint;

use crate::transport::Message;

/// Gossip disseminator consumed by the membership service.
#[async_trait]
pub trait GossipProtocol: Send + Sync + 'static {
    /// Replaces the set of endpoints gossip should disseminate to.
    async fn set_cluster_endpoints(&self, endpoints: HashSet<Endpoint>);

    /// Enqueues a message for dissemination.
    async fn spread(&self, message: Message);

    /// Subscribes to the stream of gossip messages received from peers.
    ///
    /// The stream carries every gossiped message; subscribers filter for
    /// the payloads they understand.
    fn listen(&self) -> broadcast::Receiver<Message>;
}

/// A gossip stand-in that drops everything it is asked to spread.
pub struct NoOpGossip {
    incoming_tx: broadcast::Sender<Message>,
}

impl NoOpGossip {
    /// Creates a new no-op disseminator.
    #[must_use]
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(16);
        Self { incoming_tx }
    }
}

impl Default for NoOpGossip {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GossipProtocol for NoOpGossip {
    async fn set_cluster_endpoints(&self, _endpoints: HashSet<Endpoint>) {}

    async fn spread(&self, _message: Message) {}

    fn listen(&self) -> broadcast::Receiver<Message> {
        self.incoming_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::MembershipPayload;

    #[tokio::test]
    async fn test_noop_gossip_drops_spread() {
        let gossip = NoOpGossip::new();
        let mut rx = gossip.listen();

        gossip.spread(Message::membership(MembershipPayload::new(vec![], "default"))).await;

        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }
}
