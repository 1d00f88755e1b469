// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Anti-entropy sync engine.
//!
//! Gossip alone only carries increments; periodic pairwise exchange of full
//! snapshots corrects whatever divergence message loss left behind. On
//! startup the engine syncs against every seed at once and waits briefly
//! for the first acknowledgement; afterwards it syncs with one seed chosen
//! uniformly at random each period.
//!
//! Every round uses a fresh correlation id, so acknowledgements from slow
//! rounds still in flight cannot be mistaken for the current one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use shoal_core::{Endpoint, MembershipPayload};

use crate::membership::LaneCommand;
use crate::table::MembershipTable;
use crate::transport::{
    IncomingMessage, Message, Transport, HEADER_CORRELATION_ID, HEADER_QUALIFIER,
    QUALIFIER_SYNC, QUALIFIER_SYNC_ACK,
};

/// Drives initial and periodic sync rounds against the seed members.
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    table: Arc<RwLock<MembershipTable>>,
    lane_tx: mpsc::UnboundedSender<LaneCommand>,
    seeds: Vec<Endpoint>,
    sync_group: String,
    sync_period: Duration,
    sync_timeout: Duration,
    correlation: AtomicU64,
}

impl SyncEngine {
    /// Creates a sync engine over the given seed list.
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        table: Arc<RwLock<MembershipTable>>,
        lane_tx: mpsc::UnboundedSender<LaneCommand>,
        seeds: Vec<Endpoint>,
        sync_group: String,
        sync_period: Duration,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            table,
            lane_tx,
            seeds,
            sync_group,
            sync_period,
            sync_timeout,
            correlation: AtomicU64::new(0),
        }
    }

    /// Returns the seed endpoints this engine syncs against.
    #[must_use]
    pub fn seeds(&self) -> &[Endpoint] {
        &self.seeds
    }

    fn next_correlation_id(&self) -> String {
        (self.correlation.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn snapshot_payload(&self) -> MembershipPayload {
        MembershipPayload::new(self.table.read().as_list(), self.sync_group.clone())
    }

    /// Sends a sync request carrying the current snapshot to each target.
    /// Sends are dispatched on detached tasks; failures are logged once and
    /// never retried.
    fn send_sync(&self, targets: &[Endpoint], correlation_id: &str) {
        let message = Message::membership(self.snapshot_payload())
            .with_header(HEADER_QUALIFIER, QUALIFIER_SYNC)
            .with_header(HEADER_CORRELATION_ID, correlation_id);

        for target in targets {
            let transport = Arc::clone(&self.transport);
            let target = target.clone();
            let message = message.clone();
            tokio::spawn(async move {
                counter!("shoal_cluster_syncs_sent").increment(1);
                if let Err(e) = transport.send(&target, message).await {
                    error!(target = %target, error = %e, "Failed to send sync");
                }
            });
        }
    }

    /// Runs the blocking initial sync: request every seed in parallel and
    /// feed the first matching acknowledgement to the dispatch lane. A
    /// timeout is logged and ignored; periodic rounds will retry.
    pub async fn initial_sync(&self) {
        if self.seeds.is_empty() {
            return;
        }

        let correlation_id = self.next_correlation_id();
        debug!(seeds = self.seeds.len(), %correlation_id, "Initial sync with seed members");

        // Subscribe before sending so the acknowledgement cannot slip past.
        let rx = self.transport.listen();
        self.send_sync(&self.seeds, &correlation_id);

        match Self::await_sync_ack(rx, correlation_id, self.sync_group.clone(), self.sync_timeout)
            .await
        {
            Some(payload) => {
                let _ = self.lane_tx.send(LaneCommand::SyncAck { payload });
            }
            None => {
                counter!("shoal_cluster_sync_timeouts").increment(1);
                info!(timeout = ?self.sync_timeout, "No sync acknowledgement from any seed");
            }
        }
    }

    /// Spawns the periodic sync task. Each tick picks one seed uniformly at
    /// random and waits for its acknowledgement on a detached task, so a
    /// slow round never delays the next tick.
    pub(crate) fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.sync_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of an interval completes immediately; the
            // initial sync already covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.sync_round();
            }
        })
    }

    fn sync_round(&self) {
        let Some(seed) = self.seeds.choose(&mut rand::thread_rng()).cloned() else {
            return;
        };

        let correlation_id = self.next_correlation_id();
        debug!(seed = %seed, %correlation_id, "Periodic sync round");

        let rx = self.transport.listen();
        self.send_sync(std::slice::from_ref(&seed), &correlation_id);

        let lane_tx = self.lane_tx.clone();
        let sync_group = self.sync_group.clone();
        let timeout = self.sync_timeout;
        tokio::spawn(async move {
            match Self::await_sync_ack(rx, correlation_id, sync_group, timeout).await {
                Some(payload) => {
                    let _ = lane_tx.send(LaneCommand::SyncAck { payload });
                }
                None => {
                    counter!("shoal_cluster_sync_timeouts").increment(1);
                    info!(seed = %seed, "No sync acknowledgement within timeout");
                }
            }
        });
    }

    /// Waits for the first sync acknowledgement carrying `correlation_id`
    /// and the expected sync group. Returns `None` on timeout or when the
    /// transport stream closes.
    async fn await_sync_ack(
        mut rx: broadcast::Receiver<IncomingMessage>,
        correlation_id: String,
        sync_group: String,
        timeout: Duration,
    ) -> Option<MembershipPayload> {
        let wait = async move {
            loop {
                match rx.recv().await {
                    Ok(incoming) => {
                        let message = incoming.message;
                        if message.qualifier() != Some(QUALIFIER_SYNC_ACK)
                            || message.correlation_id() != Some(correlation_id.as_str())
                        {
                            continue;
                        }
                        match message.membership_payload() {
                            Some(payload) if payload.sync_group == sync_group => {
                                return Some(payload.clone());
                            }
                            Some(_) => continue,
                            None => {
                                warn!(
                                    sender = %incoming.sender,
                                    "Sync acknowledgement carried an unexpected payload kind"
                                );
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync listener lagged behind the transport stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}
