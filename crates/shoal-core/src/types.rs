// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Common types used throughout Shoal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity-plus-address of a cluster peer.
///
/// An endpoint is identified by its `id`, an opaque string that is unique for
/// the lifetime of the owning process. Two endpoints with the same `id` refer
/// to the same member even when their addresses differ; the most recently
/// observed address wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    id: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint with an explicit id.
    #[must_use]
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self { id: id.into(), host: host.into(), port }
    }

    /// Creates an endpoint with a freshly generated process-unique id.
    #[must_use]
    pub fn with_random_id(host: impl Into<String>, port: u16) -> Self {
        Self { id: Uuid::new_v4().to_string(), host: host.into(), port }
    }

    /// Parses a `host:port` string into an endpoint.
    ///
    /// The resulting endpoint carries the address string itself as its id.
    /// This is how seed addresses are represented before the peer's real id
    /// is learned through a sync exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not of the form `host:port` with a
    /// valid port number.
    pub fn from_addr(addr: &str) -> crate::Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::Config(format!("invalid address '{addr}': missing port")))?;
        if host.is_empty() {
            return Err(crate::Error::Config(format!("invalid address '{addr}': empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| crate::Error::Config(format!("invalid address '{addr}': {e}")))?;
        Ok(Self { id: addr.to_string(), host: host.to_string(), port })
    }

    /// Returns the endpoint id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the `host:port` address string.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true when `other` has the same host and port.
    #[must_use]
    pub fn same_addr(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Status of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// The member is believed to be alive.
    Trusted,
    /// The failure detector or a peer has reported the member unresponsive.
    /// A suspected member is rehabilitated only by a trusted observation.
    Suspected,
    /// The member announced a graceful departure. Terminal but retained
    /// until the removal timer expires.
    Shutdown,
    /// The member has been expired from the table. Absorbing: no merge
    /// transitions a member out of this state.
    Removed,
}

impl MemberStatus {
    /// Returns the status as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Suspected => "suspected",
            Self::Shutdown => "shutdown",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A member record: endpoint, status and opaque metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The member's endpoint.
    pub endpoint: Endpoint,
    /// The member's current status.
    pub status: MemberStatus,
    /// Application-defined key-value metadata. Opaque to the membership core.
    pub metadata: HashMap<String, String>,
}

impl Member {
    /// Creates a new member record.
    #[must_use]
    pub fn new(endpoint: Endpoint, status: MemberStatus, metadata: HashMap<String, String>) -> Self {
        Self { endpoint, status, metadata }
    }

    /// Creates a trusted member with empty metadata.
    #[must_use]
    pub fn trusted(endpoint: Endpoint) -> Self {
        Self::new(endpoint, MemberStatus::Trusted, HashMap::new())
    }

    /// Returns the member id (shorthand for `endpoint.id()`).
    #[must_use]
    pub fn id(&self) -> &str {
        self.endpoint.id()
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.endpoint, self.status)
    }
}

/// The wire-visible membership snapshot exchanged in sync requests, sync
/// acknowledgements and gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipPayload {
    /// The member records carried by this payload.
    pub members: Vec<Member>,
    /// The cluster partition label. Payloads from a different group are
    /// silently dropped by receivers.
    pub sync_group: String,
}

impl MembershipPayload {
    /// Creates a new payload.
    #[must_use]
    pub fn new(members: Vec<Member>, sync_group: impl Into<String>) -> Self {
        Self { members, sync_group: sync_group.into() }
    }
}
