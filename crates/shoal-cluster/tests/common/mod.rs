// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! In-memory cluster harness for membership integration tests.
//!
//! A [`Network`] connects any number of nodes through loss-free in-process
//! channels: a transport keyed by address for sync traffic and a flooding
//! gossip bus. The failure detector is scripted so tests control liveness
//! verdicts directly.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use shoal_cluster::{
    ClusterMembership, FailureDetector, FdEvent, GossipProtocol, IncomingMessage, Message,
    Transport,
};
use shoal_core::{Endpoint, Member, MembershipConfig};

/// An in-memory cluster interconnect.
pub struct Network {
    transports: Mutex<HashMap<String, broadcast::Sender<IncomingMessage>>>,
    gossips: Mutex<HashMap<String, broadcast::Sender<Message>>>,
    spread_tap: broadcast::Sender<(String, Message)>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        let (spread_tap, _) = broadcast::channel(256);
        Arc::new(Self {
            transports: Mutex::new(HashMap::new()),
            gossips: Mutex::new(HashMap::new()),
            spread_tap,
        })
    }

    /// Registers a transport endpoint reachable at its `host:port` address.
    pub fn transport(self: &Arc<Self>, local: Endpoint) -> Arc<NodeTransport> {
        let (incoming_tx, _) = broadcast::channel(256);
        self.transports.lock().insert(local.addr(), incoming_tx.clone());
        Arc::new(NodeTransport { net: Arc::clone(self), local, incoming_tx })
    }

    /// Registers a gossip participant.
    pub fn gossip(self: &Arc<Self>, local: Endpoint) -> Arc<NodeGossip> {
        let (incoming_tx, _) = broadcast::channel(256);
        self.gossips.lock().insert(local.id().to_string(), incoming_tx.clone());
        Arc::new(NodeGossip { net: Arc::clone(self), local, incoming_tx })
    }

    /// Observes every payload any node spreads, tagged with the sender id.
    pub fn spread_tap(&self) -> broadcast::Receiver<(String, Message)> {
        self.spread_tap.subscribe()
    }
}

/// Loss-free in-process transport.
pub struct NodeTransport {
    net: Arc<Network>,
    local: Endpoint,
    incoming_tx: broadcast::Sender<IncomingMessage>,
}

#[async_trait]
impl Transport for NodeTransport {
    fn listen(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }

    async fn send(&self, to: &Endpoint, message: Message) -> shoal_core::Result<()> {
        let target = self.net.transports.lock().get(&to.addr()).cloned();
        match target {
            Some(tx) => {
                let _ = tx.send(IncomingMessage { sender: self.local.clone(), message });
                Ok(())
            }
            None => Err(shoal_core::Error::Transport(format!("{} is unreachable", to.addr()))),
        }
    }
}

/// One-hop flooding gossip: every spread reaches every other participant.
pub struct NodeGossip {
    net: Arc<Network>,
    local: Endpoint,
    incoming_tx: broadcast::Sender<Message>,
}

#[async_trait]
impl GossipProtocol for NodeGossip {
    async fn set_cluster_endpoints(&self, _endpoints: HashSet<Endpoint>) {}

    async fn spread(&self, message: Message) {
        let _ = self.net.spread_tap.send((self.local.id().to_string(), message.clone()));
        let peers: Vec<broadcast::Sender<Message>> = self
            .net
            .gossips
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() != self.local.id())
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in peers {
            let _ = tx.send(message.clone());
        }
    }

    fn listen(&self) -> broadcast::Receiver<Message> {
        self.incoming_tx.subscribe()
    }
}

/// A failure detector whose verdicts the test script emits by hand.
pub struct ScriptedFd {
    status_tx: broadcast::Sender<FdEvent>,
    pub endpoints: Mutex<HashSet<Endpoint>>,
    pub suspected: Mutex<Vec<Endpoint>>,
    pub trusted: Mutex<Vec<Endpoint>>,
}

impl ScriptedFd {
    pub fn new() -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            status_tx,
            endpoints: Mutex::new(HashSet::new()),
            suspected: Mutex::new(Vec::new()),
            trusted: Mutex::new(Vec::new()),
        })
    }

    pub fn emit(&self, event: FdEvent) {
        let _ = self.status_tx.send(event);
    }
}

#[async_trait]
impl FailureDetector for ScriptedFd {
    async fn set_cluster_endpoints(&self, endpoints: HashSet<Endpoint>) {
        *self.endpoints.lock() = endpoints;
    }

    fn suspect(&self, endpoint: &Endpoint) {
        self.suspected.lock().push(endpoint.clone());
    }

    fn trust(&self, endpoint: &Endpoint) {
        self.trusted.lock().push(endpoint.clone());
    }

    fn listen_status(&self) -> broadcast::Receiver<FdEvent> {
        self.status_tx.subscribe()
    }
}

/// A node wired into the in-memory network.
pub struct TestNode {
    pub endpoint: Endpoint,
    pub membership: ClusterMembership,
    pub fd: Arc<ScriptedFd>,
}

impl TestNode {
    pub fn member_status(&self, id: &str) -> Option<shoal_core::MemberStatus> {
        self.membership.member(id).map(|m| m.status)
    }
}

/// Builds a node without starting it, so tests can subscribe to updates
/// that happen during startup.
pub fn build_node(
    net: &Arc<Network>,
    name: &str,
    port: u16,
    seeds: &[Endpoint],
    config: MembershipConfig,
) -> TestNode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let endpoint = Endpoint::new(name, "127.0.0.1", port);
    let transport = net.transport(endpoint.clone());
    let gossip = net.gossip(endpoint.clone());
    let fd = ScriptedFd::new();
    let config = MembershipConfig { seed_members: seeds.to_vec(), ..config };
    let membership = ClusterMembership::new(
        endpoint.clone(),
        config,
        transport as Arc<dyn Transport>,
        Arc::clone(&fd) as Arc<dyn FailureDetector>,
        gossip as Arc<dyn GossipProtocol>,
    );
    TestNode { endpoint, membership, fd }
}

/// Builds and starts a node.
pub async fn start_node(
    net: &Arc<Network>,
    name: &str,
    port: u16,
    seeds: &[Endpoint],
    config: MembershipConfig,
) -> TestNode {
    let node = build_node(net, name, port, seeds, config);
    node.membership.start().await.expect("node should start");
    node
}

/// Timings tight enough for tests while leaving room for scheduling noise.
pub fn fast_config() -> MembershipConfig {
    MembershipConfig {
        sync_period: Duration::from_millis(60),
        sync_timeout: Duration::from_millis(150),
        max_suspect_time: Duration::from_millis(250),
        max_shutdown_time: Duration::from_millis(250),
        ..Default::default()
    }
}

/// Seed entry pointing at a node's transport address, the way operators
/// configure seeds: address only, identity unknown.
pub fn seed_addr(port: u16) -> Endpoint {
    Endpoint::from_addr(&format!("127.0.0.1:{port}")).expect("valid seed address")
}

/// Polls `check` until it holds or `deadline` elapses.
pub async fn wait_for(what: &str, deadline: Duration, check: impl Fn() -> bool) {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Collects whatever updates are immediately available.
pub fn drain_updates(rx: &mut broadcast::Receiver<Member>) -> Vec<Member> {
    let mut out = Vec::new();
    while let Ok(member) = rx.try_recv() {
        out.push(member);
    }
    out
}
