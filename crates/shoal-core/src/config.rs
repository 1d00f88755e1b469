// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the membership service.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Endpoint;
use crate::Result;

/// Configuration for the membership service.
///
/// The configuration is immutable once the service is constructed; there are
/// no runtime setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Interval between periodic sync rounds.
    pub sync_period: Duration,

    /// How long to wait for a sync acknowledgement before giving up on
    /// that round. The next round retries.
    pub sync_timeout: Duration,

    /// How long a member may stay suspected before it is expired from the
    /// table.
    pub max_suspect_time: Duration,

    /// How long a gracefully departed member is retained before removal.
    pub max_shutdown_time: Duration,

    /// Cluster partition label. Messages from a different group are
    /// silently dropped.
    pub sync_group: String,

    /// Well-known peer addresses used for bootstrap and ongoing
    /// anti-entropy. May be empty, in which case the node runs standalone
    /// until peers sync with it.
    pub seed_members: Vec<Endpoint>,

    /// Metadata announced for the local member.
    pub local_metadata: HashMap<String, String>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(3),
            max_suspect_time: Duration::from_secs(60),
            max_shutdown_time: Duration::from_secs(60),
            sync_group: "default".to_string(),
            seed_members: Vec::new(),
            local_metadata: HashMap::new(),
        }
    }
}

/// Parses a comma-separated list of `host:port` seed addresses.
///
/// Whitespace around entries is trimmed, empty entries are skipped and
/// duplicate addresses are collapsed, preserving first-seen order.
///
/// # Errors
///
/// Returns an error if any non-empty entry is not a valid `host:port`
/// address.
pub fn parse_seed_members(seeds: &str) -> Result<Vec<Endpoint>> {
    let mut out: Vec<Endpoint> = Vec::new();
    for token in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let endpoint = Endpoint::from_addr(token)?;
        if !out.iter().any(|e| e.same_addr(&endpoint)) {
            out.push(endpoint);
        }
    }
    Ok(out)
}
