// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership for Shoal distributed services.
//!
//! This crate keeps an eventually-consistent view of which peers are alive,
//! suspect or gone:
//! - A membership table with infection-style merge semantics
//! - Periodic pairwise anti-entropy (sync / sync-ack) against seed members
//! - Push gossip of incremental membership deltas
//! - Failure-detector verdicts driving suspected/trusted transitions
//! - Decay timers expiring suspected and shut-down members
//! - A subscribable stream of membership change events
//!
//! # Architecture
//!
//! All mutation of the membership table flows through a single dispatch
//! lane. Transport messages, failure-detector verdicts, gossip receipts and
//! timer firings are marshaled onto the lane by lightweight adapter tasks;
//! the lane merges them one at a time, so the merge rule is trivially
//! atomic. For every merge that changed something, the lane recomputes the
//! peer sets of the failure detector and the gossip broadcaster, republishes
//! the deltas as gossip (unless they arrived by gossip), notifies observers
//! and arms or cancels the per-member decay timers.
//!
//! The transport, the failure detector and the gossip disseminator are
//! collaborators behind traits. No-op stand-ins are provided, together with
//! a phi-accrual implementation of the failure-detector contract.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shoal_core::{Endpoint, MembershipConfig};
//! use shoal_cluster::{ClusterMembership, NoOpFailureDetector, NoOpGossip};
//!
//! let local = Endpoint::with_random_id("10.0.0.3", 4800);
//! let config = MembershipConfig {
//!     seed_members: shoal_core::parse_seed_members("10.0.0.1:4800")?,
//!     ..Default::default()
//! };
//! let membership = ClusterMembership::new(
//!     local,
//!     config,
//!     transport,
//!     Arc::new(NoOpFailureDetector::new()),
//!     Arc::new(NoOpGossip::new()),
//! );
//! let mut updates = membership.listen_updates();
//! membership.start().await?;
//! while let Ok(member) = updates.recv().await {
//!     println!("{member}");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fdetector;
pub mod gossip;
pub mod membership;
pub mod observer;
pub mod phi;
pub mod sync;
pub mod table;
pub mod timer;
pub mod transport;

pub use fdetector::{FailureDetector, FdEvent, FdStatus, NoOpFailureDetector};
pub use gossip::{GossipProtocol, NoOpGossip};
pub use membership::ClusterMembership;
pub use observer::ObserverHub;
pub use phi::{PhiDetectorConfig, PhiFailureDetector};
pub use table::MembershipTable;
pub use timer::TimerWheel;
pub use transport::{
    IncomingMessage, Message, Payload, Transport, HEADER_CORRELATION_ID, HEADER_QUALIFIER,
    QUALIFIER_SYNC, QUALIFIER_SYNC_ACK,
};
