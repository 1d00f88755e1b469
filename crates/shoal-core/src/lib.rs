// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Core types and utilities for Shoal cluster membership.
//!
//! This crate provides the fundamental building blocks used across all Shoal
//! components:
//! - Member identity and status types exchanged on the wire
//! - Configuration for the membership service
//! - Error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{parse_seed_members, MembershipConfig};
pub use error::{Error, Result};
pub use types::{Endpoint, Member, MemberStatus, MembershipPayload};
