// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Phi-accrual implementation of the failure-detector contract.
//!
//! Rather than a binary timeout, the detector fits a normal distribution to
//! the recent inter-arrival times of each peer's heartbeats and reports a
//! continuous suspicion level:
//!
//! phi = -log10(P(interval > time since last heartbeat))
//!
//! Crossing the configured threshold emits a suspect verdict on the status
//! stream; dropping back under it emits an alive verdict. The membership
//! service supplies the peer set and consumes the verdicts; whatever
//! carries heartbeats (usually the transport layer) calls
//! [`PhiFailureDetector::record_heartbeat`].
//!
//! Reference: Hayashibara, Defago, Yared, Katayama (2004),
//! "The Phi Accrual Failure Detector".

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use shoal_core::Endpoint;

use crate::fdetector::{FailureDetector, FdEvent};

/// Configuration for the phi-accrual failure detector.
#[derive(Debug, Clone)]
pub struct PhiDetectorConfig {
    /// Phi threshold above which a peer is reported suspect. Higher values
    /// tolerate later heartbeats; typical values are 8-12 on a LAN.
    pub threshold: f64,

    /// Expected heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Maximum number of inter-arrival samples kept per peer.
    pub max_sample_size: usize,

    /// Samples required before the statistical model is used. Below this
    /// a simple grace-period rule applies.
    pub min_samples: usize,

    /// Standard-deviation estimate used until enough samples exist.
    pub initial_std_dev_ms: f64,

    /// Lower bound on the standard deviation.
    pub min_std_dev_ms: f64,

    /// Slack factor on the expected interval before the grace-period rule
    /// starts counting a peer as late.
    pub acceptable_delay_factor: f64,

    /// How often peer suspicion levels are evaluated.
    pub check_interval: Duration,
}

impl Default for PhiDetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 8.0,
            heartbeat_interval_ms: 1000,
            max_sample_size: 1000,
            min_samples: 10,
            initial_std_dev_ms: 500.0,
            min_std_dev_ms: 10.0,
            acceptable_delay_factor: 1.5,
            check_interval: Duration::from_millis(500),
        }
    }
}

/// Bounded window of heartbeat inter-arrival times.
///
/// The running sum and sum of squares are kept alongside the window, so
/// mean and variance come out in constant time and evicted samples stop
/// contributing the moment they leave.
struct ArrivalWindow {
    samples: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
    last_arrival: Instant,
}

impl ArrivalWindow {
    fn new() -> Self {
        Self { samples: VecDeque::new(), sum: 0.0, sum_sq: 0.0, last_arrival: Instant::now() }
    }

    /// Folds the time since the previous arrival into the window.
    fn observe(&mut self, config: &PhiDetectorConfig) {
        let now = Instant::now();
        let interval_ms = now.duration_since(self.last_arrival).as_secs_f64() * 1000.0;
        self.last_arrival = now;
        self.push(interval_ms, config.max_sample_size);
    }

    fn push(&mut self, sample: f64, capacity: usize) {
        self.samples.push_back(sample);
        self.sum += sample;
        self.sum_sq += sample * sample;
        while self.samples.len() > capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn mean(&self) -> f64 {
        self.sum / self.samples.len() as f64
    }

    fn std_dev(&self, config: &PhiDetectorConfig) -> f64 {
        let n = self.samples.len() as f64;
        if n < 2.0 {
            return config.initial_std_dev_ms;
        }
        // Sample variance over the window; the subtraction can go slightly
        // negative on identical samples, hence the clamp before sqrt.
        let variance = ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0);
        variance.sqrt().max(config.min_std_dev_ms)
    }

    fn phi(&self, config: &PhiDetectorConfig) -> f64 {
        let elapsed_ms =
            Instant::now().duration_since(self.last_arrival).as_secs_f64() * 1000.0;

        // Too few samples to fit a distribution: a peer is on time until
        // the expected interval plus slack has passed, and suspicion grows
        // with every further expected interval of silence.
        if self.samples.len() < config.min_samples.max(1) {
            let expected =
                config.heartbeat_interval_ms as f64 * config.acceptable_delay_factor;
            return (elapsed_ms / expected - 1.0).max(0.0);
        }

        let z = (elapsed_ms - self.mean()) / self.std_dev(config);
        if z <= 0.0 {
            return 0.0;
        }

        match upper_tail(z) {
            p if p <= f64::MIN_POSITIVE => f64::MAX,
            p => -p.log10(),
        }
    }
}

/// P(X > z) for a standard normal X, via the complementary error function.
fn upper_tail(z: f64) -> f64 {
    0.5 * libm::erfc(z / std::f64::consts::SQRT_2)
}

struct PeerEntry {
    endpoint: Endpoint,
    window: Arc<RwLock<ArrivalWindow>>,
    suspected: bool,
}

/// Phi-accrual failure detector over the membership peer set.
///
/// Thread-safe; heartbeats may be recorded from any task.
pub struct PhiFailureDetector {
    local: Endpoint,
    config: PhiDetectorConfig,
    peers: Arc<DashMap<String, PeerEntry>>,
    status_tx: broadcast::Sender<FdEvent>,
    check_task: Mutex<Option<JoinHandle<()>>>,
}

impl PhiFailureDetector {
    /// Creates a detector for the given local endpoint.
    #[must_use]
    pub fn new(local: Endpoint, config: PhiDetectorConfig) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            local,
            config,
            peers: Arc::new(DashMap::new()),
            status_tx,
            check_task: Mutex::new(None),
        }
    }

    /// Creates a detector with default configuration.
    #[must_use]
    pub fn with_defaults(local: Endpoint) -> Self {
        Self::new(local, PhiDetectorConfig::default())
    }

    /// Records a heartbeat arrival from a peer. Heartbeats from unknown
    /// peers and from the local endpoint are ignored; the membership
    /// service decides who is tracked.
    pub fn record_heartbeat(&self, endpoint: &Endpoint) {
        if endpoint.id() == self.local.id() {
            return;
        }
        let Some(entry) = self.peers.get(endpoint.id()) else {
            debug!(endpoint = %endpoint, "Heartbeat from untracked peer ignored");
            return;
        };
        let mut window = entry.window.write();
        window.observe(&self.config);
        trace!(
            endpoint = %endpoint,
            samples = window.len(),
            mean_ms = window.mean(),
            "Recorded heartbeat"
        );
    }

    /// Returns the current phi value for a peer, or `None` if it is not
    /// tracked.
    #[must_use]
    pub fn phi(&self, endpoint: &Endpoint) -> Option<f64> {
        self.peers.get(endpoint.id()).map(|entry| entry.window.read().phi(&self.config))
    }

    /// Returns the number of tracked peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Starts the periodic suspicion check. Verdicts are emitted on the
    /// status stream whenever a peer crosses the threshold in either
    /// direction.
    pub fn start(&self) {
        let mut task = self.check_task.lock();
        if task.is_some() {
            return;
        }

        let peers = Arc::clone(&self.peers);
        let config = self.config.clone();
        let status_tx = self.status_tx.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                Self::check_peers(&peers, &config, &status_tx);
            }
        }));
    }

    /// Stops the periodic check. Recorded statistics are retained.
    pub fn stop(&self) {
        if let Some(task) = self.check_task.lock().take() {
            task.abort();
        }
    }

    fn check_peers(
        peers: &DashMap<String, PeerEntry>,
        config: &PhiDetectorConfig,
        status_tx: &broadcast::Sender<FdEvent>,
    ) {
        // Collect transitions first, then apply, so no shard lock is held
        // while verdicts go out.
        let transitions: Vec<(String, Endpoint, bool, f64)> = peers
            .iter()
            .filter_map(|entry| {
                let phi = entry.window.read().phi(config);
                let suspect_now = phi > config.threshold;
                if suspect_now != entry.suspected {
                    Some((entry.key().clone(), entry.endpoint.clone(), suspect_now, phi))
                } else {
                    None
                }
            })
            .collect();

        for (id, endpoint, suspect_now, phi) in transitions {
            if let Some(mut entry) = peers.get_mut(&id) {
                entry.suspected = suspect_now;
            }
            let event = if suspect_now {
                debug!(endpoint = %endpoint, phi, "Peer crossed suspicion threshold");
                FdEvent::suspect(endpoint)
            } else {
                debug!(endpoint = %endpoint, phi, "Peer dropped below suspicion threshold");
                FdEvent::alive(endpoint)
            };
            let _ = status_tx.send(event);
        }
    }
}

#[async_trait]
impl FailureDetector for PhiFailureDetector {
    async fn set_cluster_endpoints(&self, endpoints: HashSet<Endpoint>) {
        for endpoint in &endpoints {
            if endpoint.id() == self.local.id() {
                continue;
            }
            self.peers.entry(endpoint.id().to_string()).or_insert_with(|| {
                debug!(endpoint = %endpoint, "Tracking peer");
                // Registration counts as an arrival; a peer that never
                // heartbeats decays from here.
                PeerEntry {
                    endpoint: endpoint.clone(),
                    window: Arc::new(RwLock::new(ArrivalWindow::new())),
                    suspected: false,
                }
            });
        }
        self.peers.retain(|_, entry| {
            let keep = endpoints.contains(&entry.endpoint);
            if !keep {
                debug!(endpoint = %entry.endpoint, "Dropping departed peer");
            }
            keep
        });
    }

    fn suspect(&self, endpoint: &Endpoint) {
        // Membership already considers the peer suspected; align the local
        // verdict so the check loop does not immediately re-announce it.
        if let Some(mut entry) = self.peers.get_mut(endpoint.id()) {
            entry.suspected = true;
        }
    }

    fn trust(&self, endpoint: &Endpoint) {
        // Membership rehabilitated the peer; reset its clock so it gets a
        // full interval of runway before suspicion can build up again.
        if let Some(mut entry) = self.peers.get_mut(endpoint.id()) {
            entry.suspected = false;
            entry.window.write().last_arrival = Instant::now();
        }
    }

    fn listen_status(&self) -> broadcast::Receiver<FdEvent> {
        self.status_tx.subscribe()
    }
}
