// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for Shoal.

use thiserror::Error;

/// A specialized `Result` type for Shoal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the membership service.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A transport send or connect failed. Sends are attempted once per
    /// call site; anti-entropy recovers from individual losses.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service was started more than once.
    #[error("membership service already started")]
    AlreadyStarted,
}
