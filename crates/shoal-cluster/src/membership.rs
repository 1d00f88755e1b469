// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! The membership service: dispatch lane, lifecycle and public API.
//!
//! Three input streams feed the service: sync requests and acknowledgements
//! from the transport, liveness verdicts from the failure detector, and
//! membership payloads received by gossip. Adapter tasks marshal all of
//! them, plus decay-timer firings, onto one dispatch lane that owns every
//! table mutation. Serializing the merges is what makes the merge rule
//! atomic; two concurrent merges could otherwise each claim the same
//! transition and double the downstream traffic.

use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shoal_core::{
    Endpoint, Error, Member, MemberStatus, MembershipConfig, MembershipPayload, Result,
};

use crate::fdetector::{FailureDetector, FdEvent};
use crate::gossip::GossipProtocol;
use crate::observer::ObserverHub;
use crate::sync::SyncEngine;
use crate::table::MembershipTable;
use crate::timer::TimerWheel;
use crate::transport::{
    Message, Payload, Transport, HEADER_CORRELATION_ID, HEADER_QUALIFIER, QUALIFIER_SYNC,
    QUALIFIER_SYNC_ACK,
};

/// A unit of work for the dispatch lane.
#[derive(Debug)]
pub(crate) enum LaneCommand {
    /// An incoming sync request to merge and acknowledge.
    Sync {
        /// Peer the request arrived from.
        sender: Endpoint,
        /// Correlation id to echo on the acknowledgement.
        correlation_id: Option<String>,
        /// The sender's snapshot.
        payload: MembershipPayload,
    },
    /// A sync acknowledgement matched by the sync engine.
    SyncAck {
        /// The responder's merged snapshot.
        payload: MembershipPayload,
    },
    /// A liveness verdict from the failure detector.
    Verdict(FdEvent),
    /// A membership payload received by gossip.
    Gossip(MembershipPayload),
    /// The suspect window for a member elapsed.
    SuspectExpired(Endpoint),
    /// The retention window for a gracefully departed member elapsed.
    ShutdownExpired(Endpoint),
    /// Drain and terminate the lane.
    Shutdown,
}

/// Everything the lane needs to process a command. Cheap to clone; all
/// substantial state sits behind `Arc`s.
#[derive(Clone)]
struct LaneCtx {
    local: Endpoint,
    sync_group: String,
    max_suspect_time: std::time::Duration,
    max_shutdown_time: std::time::Duration,
    table: Arc<RwLock<MembershipTable>>,
    transport: Arc<dyn Transport>,
    failure_detector: Arc<dyn FailureDetector>,
    gossip: Arc<dyn GossipProtocol>,
    timers: Arc<TimerWheel>,
    observers: Arc<ObserverHub>,
    lane_tx: mpsc::UnboundedSender<LaneCommand>,
}

/// SWIM-style cluster membership service.
///
/// Construct with [`ClusterMembership::new`], then call
/// [`start`](Self::start) once. All reads (`members`, `member`,
/// `local_member`) return snapshots and never block; only the initial sync
/// inside `start` blocks the caller, bounded by the configured sync
/// timeout.
pub struct ClusterMembership {
    local: Endpoint,
    config: MembershipConfig,
    table: Arc<RwLock<MembershipTable>>,
    transport: Arc<dyn Transport>,
    failure_detector: Arc<dyn FailureDetector>,
    gossip: Arc<dyn GossipProtocol>,
    timers: Arc<TimerWheel>,
    observers: Arc<ObserverHub>,
    sync: Arc<SyncEngine>,
    lane_tx: mpsc::UnboundedSender<LaneCommand>,
    lane_rx: Mutex<Option<mpsc::UnboundedReceiver<LaneCommand>>>,
    lane_handle: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterMembership {
    /// Creates the service. Nothing runs until [`start`](Self::start).
    ///
    /// Seed entries matching the local endpoint's id or address are
    /// dropped from the sync target list.
    #[must_use]
    pub fn new(
        local: Endpoint,
        config: MembershipConfig,
        transport: Arc<dyn Transport>,
        failure_detector: Arc<dyn FailureDetector>,
        gossip: Arc<dyn GossipProtocol>,
    ) -> Self {
        let table = Arc::new(RwLock::new(MembershipTable::new(local.clone())));
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();

        let seeds: Vec<Endpoint> = config
            .seed_members
            .iter()
            .filter(|seed| seed.id() != local.id() && !seed.same_addr(&local))
            .cloned()
            .collect();

        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&transport),
            Arc::clone(&table),
            lane_tx.clone(),
            seeds,
            config.sync_group.clone(),
            config.sync_period,
            config.sync_timeout,
        ));

        Self {
            local,
            config,
            table,
            transport,
            failure_detector,
            gossip,
            timers: Arc::new(TimerWheel::new()),
            observers: Arc::new(ObserverHub::new()),
            sync,
            lane_tx,
            lane_rx: Mutex::new(Some(lane_rx)),
            lane_handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts the service: registers the local member, wires the input
    /// adapters, performs the blocking initial sync and schedules periodic
    /// sync rounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] when called a second time.
    pub async fn start(&self) -> Result<()> {
        let lane_rx = self.lane_rx.lock().take().ok_or(Error::AlreadyStarted)?;

        info!(local = %self.local, sync_group = %self.config.sync_group, "Starting membership service");

        let ctx = LaneCtx {
            local: self.local.clone(),
            sync_group: self.config.sync_group.clone(),
            max_suspect_time: self.config.max_suspect_time,
            max_shutdown_time: self.config.max_shutdown_time,
            table: Arc::clone(&self.table),
            transport: Arc::clone(&self.transport),
            failure_detector: Arc::clone(&self.failure_detector),
            gossip: Arc::clone(&self.gossip),
            timers: Arc::clone(&self.timers),
            observers: Arc::clone(&self.observers),
            lane_tx: self.lane_tx.clone(),
        };

        // Register the local member before anything can sync with us.
        let local_record = Member::new(
            self.local.clone(),
            MemberStatus::Trusted,
            self.config.local_metadata.clone(),
        );
        let updates = { ctx.table.write().merge_member(local_record) };
        process_updates(&ctx, updates, false).await;

        let adapters = [
            spawn_transport_adapter(ctx.clone()),
            spawn_fd_adapter(ctx.clone()),
            spawn_gossip_adapter(ctx.clone()),
        ];
        self.tasks.lock().extend(adapters);

        *self.lane_handle.lock() = Some(spawn_lane(ctx, lane_rx));

        // The only blocking phase: wait up to the sync timeout for the
        // first seed acknowledgement.
        self.sync.initial_sync().await;

        if !self.sync.seeds().is_empty() {
            self.tasks.lock().push(self.sync.spawn_periodic());
        }

        Ok(())
    }

    /// Stops the service. In-flight merges drain first; after return no
    /// further merges occur and the observer stream is completed.
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(lane_handle) = self.lane_handle.lock().take() else {
            return;
        };
        info!(local = %self.local, "Stopping membership service");

        // Detach the producers, then let the lane drain what is queued.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.lane_tx.send(LaneCommand::Shutdown);
        let _ = lane_handle.await;

        self.observers.close();
        self.timers.stop();
    }

    /// Announces a graceful departure by gossiping a shutdown record for
    /// the local member, then returns. Peers expire the record after their
    /// shutdown retention window; this node does not wait for that.
    pub async fn leave(&self) {
        let record = Member::new(
            self.local.clone(),
            MemberStatus::Shutdown,
            self.config.local_metadata.clone(),
        );
        info!(member = %record, "Announcing graceful leave");
        let payload = MembershipPayload::new(vec![record], self.config.sync_group.clone());
        self.gossip.spread(Message::membership(payload)).await;
    }

    /// Returns a snapshot of all current members.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.table.read().as_list()
    }

    /// Looks up a member by id.
    #[must_use]
    pub fn member(&self, id: &str) -> Option<Member> {
        self.table.read().get(id).cloned()
    }

    /// Returns the local member record, present once the service started.
    #[must_use]
    pub fn local_member(&self) -> Option<Member> {
        self.table.read().get(self.local.id()).cloned()
    }

    /// Returns the local endpoint.
    #[must_use]
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Returns true when the record refers to this node.
    #[must_use]
    pub fn is_local_member(&self, member: &Member) -> bool {
        member.endpoint == self.local
    }

    /// Subscribes to membership deltas produced from this point on.
    pub fn listen_updates(&self) -> broadcast::Receiver<Member> {
        self.observers.subscribe()
    }
}

fn spawn_lane(ctx: LaneCtx, mut lane_rx: mpsc::UnboundedReceiver<LaneCommand>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = lane_rx.recv().await {
            if matches!(command, LaneCommand::Shutdown) {
                break;
            }
            handle_command(&ctx, command).await;
        }
        debug!("Dispatch lane drained");
    })
}

fn spawn_transport_adapter(ctx: LaneCtx) -> JoinHandle<()> {
    let mut rx = ctx.transport.listen();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(incoming) => {
                    if incoming.message.qualifier() != Some(QUALIFIER_SYNC) {
                        continue;
                    }
                    match incoming.message.membership_payload() {
                        Some(payload) if payload.sync_group == ctx.sync_group => {
                            counter!("shoal_cluster_syncs_received").increment(1);
                            let command = LaneCommand::Sync {
                                sender: incoming.sender,
                                correlation_id: incoming
                                    .message
                                    .correlation_id()
                                    .map(str::to_string),
                                payload: payload.clone(),
                            };
                            if ctx.lane_tx.send(command).is_err() {
                                break;
                            }
                        }
                        Some(foreign) => {
                            debug!(
                                group = %foreign.sync_group,
                                sender = %incoming.sender,
                                "Dropping sync from a foreign sync group"
                            );
                        }
                        None => {
                            warn!(
                                sender = %incoming.sender,
                                "Sync message carried an unexpected payload kind"
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sync adapter lagged behind the transport stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_fd_adapter(ctx: LaneCtx) -> JoinHandle<()> {
    let mut rx = ctx.failure_detector.listen_status();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if ctx.lane_tx.send(LaneCommand::Verdict(event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Verdict adapter lagged behind the failure detector");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_gossip_adapter(ctx: LaneCtx) -> JoinHandle<()> {
    let mut rx = ctx.gossip.listen();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    // Other protocols share the gossip bus; only membership
                    // payloads of our sync group are ours.
                    let Payload::Membership(payload) = message.payload else {
                        continue;
                    };
                    if payload.sync_group != ctx.sync_group {
                        debug!(group = %payload.sync_group, "Dropping gossip from a foreign sync group");
                        continue;
                    }
                    if ctx.lane_tx.send(LaneCommand::Gossip(payload)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Gossip adapter lagged behind the gossip stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_command(ctx: &LaneCtx, command: LaneCommand) {
    match command {
        LaneCommand::Sync { sender, correlation_id, payload } => {
            let updates = { ctx.table.write().merge_payload(&payload) };
            debug!(sender = %sender, updates = updates.len(), "Received sync");
            process_updates(ctx, updates, true).await;
            // Acknowledge with the merged snapshot even when nothing
            // changed; the requester needs our view either way.
            reply_sync_ack(ctx, sender, correlation_id);
        }
        LaneCommand::SyncAck { payload } => {
            let updates = { ctx.table.write().merge_payload(&payload) };
            debug!(updates = updates.len(), "Received sync acknowledgement");
            process_updates(ctx, updates, true).await;
        }
        LaneCommand::Verdict(event) => {
            let updates = { ctx.table.write().merge_fd_event(&event) };
            process_updates(ctx, updates, true).await;
        }
        LaneCommand::Gossip(payload) => {
            let updates = { ctx.table.write().merge_payload(&payload) };
            process_updates(ctx, updates, false).await;
        }
        LaneCommand::SuspectExpired(endpoint) => {
            let updates = {
                let mut table = ctx.table.write();
                // A refutation may already be queued behind this expiry;
                // only reap members that are still suspected.
                if table.get(endpoint.id()).map(|m| m.status) == Some(MemberStatus::Suspected) {
                    debug!(endpoint = %endpoint, "Suspect window elapsed, removing member");
                    table.remove(&endpoint)
                } else {
                    Vec::new()
                }
            };
            process_updates(ctx, updates, false).await;
        }
        LaneCommand::ShutdownExpired(endpoint) => {
            let mut table = ctx.table.write();
            if table.get(endpoint.id()).map(|m| m.status) == Some(MemberStatus::Shutdown) {
                debug!(endpoint = %endpoint, "Retention window elapsed, removing departed member");
                table.remove(&endpoint);
            }
        }
        LaneCommand::Shutdown => {}
    }
}

fn reply_sync_ack(ctx: &LaneCtx, to: Endpoint, correlation_id: Option<String>) {
    let snapshot = MembershipPayload::new(ctx.table.read().as_list(), ctx.sync_group.clone());
    let mut message =
        Message::membership(snapshot).with_header(HEADER_QUALIFIER, QUALIFIER_SYNC_ACK);
    if let Some(correlation_id) = correlation_id {
        message = message.with_header(HEADER_CORRELATION_ID, correlation_id);
    }

    let transport = Arc::clone(&ctx.transport);
    tokio::spawn(async move {
        if let Err(e) = transport.send(&to, message).await {
            error!(target = %to, error = %e, "Failed to send sync acknowledgement");
        }
    });
}

/// Applies the downstream effects of a delta set: refresh the failure
/// detector and gossip peer sets, republish by gossip, notify observers,
/// and arm or cancel decay timers.
async fn process_updates(ctx: &LaneCtx, updates: Vec<Member>, spread_gossip: bool) {
    if updates.is_empty() {
        return;
    }

    let endpoints = { ctx.table.read().trusted_or_suspected_endpoints() };
    gauge!("shoal_cluster_members").set(endpoints.len() as f64);
    ctx.failure_detector.set_cluster_endpoints(endpoints.clone()).await;
    ctx.gossip.set_cluster_endpoints(endpoints).await;

    // Gossip-sourced deltas are not re-broadcast, so each delta leaves a
    // node at most once. A refutation of a claim about ourselves is
    // locally originated and leaves by gossip no matter how the claim
    // arrived.
    let gossiped: Vec<Member> = if spread_gossip {
        updates.clone()
    } else {
        updates.iter().filter(|m| m.endpoint == ctx.local).cloned().collect()
    };
    if !gossiped.is_empty() {
        counter!("shoal_cluster_deltas_gossiped").increment(gossiped.len() as u64);
        let payload = MembershipPayload::new(gossiped, ctx.sync_group.clone());
        ctx.gossip.spread(Message::membership(payload)).await;
    }

    for update in &updates {
        if update.status != MemberStatus::Removed {
            ctx.observers.publish(update);
        }
    }

    for update in &updates {
        debug!(member = %update, "Membership update");
        match update.status {
            MemberStatus::Suspected => {
                ctx.failure_detector.suspect(&update.endpoint);
                let lane_tx = ctx.lane_tx.clone();
                let endpoint = update.endpoint.clone();
                ctx.timers.schedule_keyed(update.id(), ctx.max_suspect_time, move || {
                    let _ = lane_tx.send(LaneCommand::SuspectExpired(endpoint));
                });
            }
            MemberStatus::Trusted => {
                ctx.failure_detector.trust(&update.endpoint);
                ctx.timers.cancel(update.id());
            }
            MemberStatus::Shutdown => {
                // The member may have decayed straight from suspected;
                // only the removal timer should stay armed.
                ctx.timers.cancel(update.id());
                let lane_tx = ctx.lane_tx.clone();
                let endpoint = update.endpoint.clone();
                ctx.timers.schedule(ctx.max_shutdown_time, move || {
                    let _ = lane_tx.send(LaneCommand::ShutdownExpired(endpoint));
                });
            }
            MemberStatus::Removed => {}
        }
    }
}
