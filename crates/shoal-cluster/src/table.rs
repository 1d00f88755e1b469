// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Membership table and merge semantics.
//!
//! The table holds one record per peer id, with a distinguished entry for
//! the local member. It is mutated only through the merge and remove
//! operations, which return the records that actually changed ("deltas");
//! everything downstream (gossip republication, observer notification,
//! timer management) is driven from those deltas.
//!
//! The merge rule is infection-style. Bad news always travels: a trusted
//! member can be demoted by any peer's observation. Good news must be
//! affirmative: a suspected member is rehabilitated only by a trusted
//! observation, never by silence. A shut-down member is terminal but
//! retained so its removal timer expires uniformly across the cluster, and
//! a removed member is absorbing.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use shoal_core::{Endpoint, Member, MemberStatus, MembershipPayload};

use crate::fdetector::{FdEvent, FdStatus};

/// Mapping from endpoint id to member record.
///
/// The dispatch lane has exclusive mutate rights; every other component
/// reads cloned snapshots.
#[derive(Debug)]
pub struct MembershipTable {
    local: Endpoint,
    members: HashMap<String, Member>,
}

impl MembershipTable {
    /// Creates an empty table for the given local endpoint.
    ///
    /// The local member itself is inserted by the first merge the service
    /// performs on startup.
    #[must_use]
    pub fn new(local: Endpoint) -> Self {
        Self { local, members: HashMap::new() }
    }

    /// Returns a snapshot of all members that have not been removed.
    ///
    /// The order of the returned list is not meaningful.
    #[must_use]
    pub fn as_list(&self) -> Vec<Member> {
        self.members
            .values()
            .filter(|m| m.status != MemberStatus::Removed)
            .cloned()
            .collect()
    }

    /// Looks up a member by id. Removed tombstones are visible here.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    /// Returns the number of non-removed members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.values().filter(|m| m.status != MemberStatus::Removed).count()
    }

    /// Returns true when the table holds no non-removed members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the endpoints of all trusted or suspected members, the peer
    /// set the failure detector and gossip disseminator should work with.
    #[must_use]
    pub fn trusted_or_suspected_endpoints(&self) -> HashSet<Endpoint> {
        self.members
            .values()
            .filter(|m| matches!(m.status, MemberStatus::Trusted | MemberStatus::Suspected))
            .map(|m| m.endpoint.clone())
            .collect()
    }

    /// Merges every record of a payload, returning the deltas in the order
    /// the records were processed.
    pub fn merge_payload(&mut self, payload: &MembershipPayload) -> Vec<Member> {
        let mut deltas = Vec::new();
        for member in &payload.members {
            deltas.extend(self.merge_member(member.clone()));
        }
        deltas
    }

    /// Merges a single incoming record against the current table.
    ///
    /// Returns the records whose status, metadata or address changed as a
    /// result, or a synthetic trusted record for the local member when a
    /// remote claim about it had to be refuted.
    pub fn merge_member(&mut self, incoming: Member) -> Vec<Member> {
        let id = incoming.id().to_string();

        let Some(current) = self.members.get(&id) else {
            let emit = incoming.status != MemberStatus::Removed;
            debug!(member = %incoming, "Inserting newly observed member");
            self.members.insert(id, incoming.clone());
            return if emit { vec![incoming] } else { vec![] };
        };

        // A remote opinion never overwrites the local member's status. A
        // claim that we are suspected or shut down is answered with a
        // synthetic trusted delta so our own record gets re-gossiped.
        if id == self.local.id() {
            return match incoming.status {
                MemberStatus::Suspected | MemberStatus::Shutdown => {
                    debug!(claim = %incoming.status, "Refuting remote claim about local member");
                    vec![current.clone()]
                }
                MemberStatus::Trusted | MemberStatus::Removed => vec![],
            };
        }

        use MemberStatus::{Removed, Shutdown, Suspected, Trusted};
        let accepted = match (current.status, incoming.status) {
            // A trusted record accepts any worse news; same-status merges
            // only refresh metadata and address.
            (Trusted, Trusted) => {
                let changed = current.metadata != incoming.metadata
                    || !current.endpoint.same_addr(&incoming.endpoint);
                if !changed {
                    return vec![];
                }
                true
            }
            (Trusted, Suspected | Shutdown | Removed) => true,
            // Recovery requires an affirmative trusted observation.
            (Suspected, Trusted | Shutdown | Removed) => true,
            (Suspected, Suspected) => false,
            (Shutdown, Removed) => true,
            (Shutdown, Trusted | Suspected | Shutdown) => false,
            (Removed, _) => false,
        };

        if !accepted {
            return vec![];
        }

        debug!(member = %incoming, was = %current.status, "Member transitioned");
        self.members.insert(id, incoming.clone());
        vec![incoming]
    }

    /// Merges a failure-detector verdict.
    ///
    /// An alive verdict is a trusted hint, a suspect verdict a suspected
    /// hint; metadata and address are untouched. Verdicts about unknown
    /// endpoints and about the local member are ignored.
    pub fn merge_fd_event(&mut self, event: &FdEvent) -> Vec<Member> {
        if event.endpoint.id() == self.local.id() {
            return vec![];
        }
        let Some(current) = self.members.get(event.endpoint.id()) else {
            return vec![];
        };
        let status = match event.status {
            FdStatus::Alive => MemberStatus::Trusted,
            FdStatus::Suspect => MemberStatus::Suspected,
        };
        let hinted = Member::new(current.endpoint.clone(), status, current.metadata.clone());
        self.merge_member(hinted)
    }

    /// Removes a member outright, returning its record marked removed.
    ///
    /// Removing an absent member yields no deltas, which is what makes a
    /// late timer firing a no-op.
    pub fn remove(&mut self, endpoint: &Endpoint) -> Vec<Member> {
        match self.members.remove(endpoint.id()) {
            Some(mut member) => {
                member.status = MemberStatus::Removed;
                debug!(member = %member, "Removed member from table");
                vec![member]
            }
            None => vec![],
        }
    }
}
