// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Transport contract consumed by the membership service.
//!
//! The membership core needs very little from a transport: a stream of
//! incoming messages and a best-effort, single-attempt send. Connection
//! management, framing and codecs are the transport implementation's
//! concern; messages delivered over one connection are expected to arrive
//! in send order.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use shoal_core::{Endpoint, MembershipPayload, Result};

/// Header naming the protocol operation a message belongs to.
pub const HEADER_QUALIFIER: &str = "qualifier";

/// Header correlating a response with the request that triggered it.
pub const HEADER_CORRELATION_ID: &str = "correlation-id";

/// Qualifier of a membership sync request.
pub const QUALIFIER_SYNC: &str = "shoal.cluster/membership/sync";

/// Qualifier of a membership sync acknowledgement.
pub const QUALIFIER_SYNC_ACK: &str = "shoal.cluster/membership/syncAck";

/// Typed message payload.
///
/// Protocols multiplexed over one transport discriminate on this tag
/// rather than on runtime type inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A membership snapshot or delta set.
    Membership(MembershipPayload),
    /// An opaque payload belonging to some other protocol.
    Opaque(Vec<u8>),
}

/// A message as seen by the membership core: a typed payload plus string
/// headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The message payload.
    pub payload: Payload,
    /// String headers. The core reads `qualifier` and `correlation-id`.
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Creates a message carrying a membership payload and no headers.
    #[must_use]
    pub fn membership(payload: MembershipPayload) -> Self {
        Self { payload: Payload::Membership(payload), headers: HashMap::new() }
    }

    /// Adds a header, consuming and returning the message.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns the `qualifier` header.
    #[must_use]
    pub fn qualifier(&self) -> Option<&str> {
        self.header(HEADER_QUALIFIER)
    }

    /// Returns the `correlation-id` header.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(HEADER_CORRELATION_ID)
    }

    /// Returns the membership payload, if this message carries one.
    #[must_use]
    pub fn membership_payload(&self) -> Option<&MembershipPayload> {
        match &self.payload {
            Payload::Membership(payload) => Some(payload),
            Payload::Opaque(_) => None,
        }
    }
}

/// A message received from a peer, tagged with the sender's endpoint.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The endpoint the message arrived from.
    pub sender: Endpoint,
    /// The message itself.
    pub message: Message,
}

/// Best-effort message transport.
///
/// Implementations deliver messages at most once per send, in order per
/// connection, with no durability. The membership core issues a single
/// `send` per call site and treats failures as logged-and-forgotten;
/// periodic anti-entropy recovers from losses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribes to the stream of incoming messages.
    ///
    /// Every subscriber sees every message; the sync engine and the
    /// dispatcher hold independent subscriptions.
    fn listen(&self) -> broadcast::Receiver<IncomingMessage>;

    /// Sends a message to the given endpoint, connecting if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unreachable or the send fails. The
    /// attempt is not retried.
    async fn send(&self, to: &Endpoint, message: Message) -> Result<()>;
}
