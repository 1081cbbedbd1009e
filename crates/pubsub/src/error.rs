// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced by topic operations.
//!
//! Every error is returned as a value: publish returns it directly, the
//! subscription surfaces it as a stream item. Only [`Error::UndeliveredEvents`]
//! is advisory; it rides along a valid [`Delivery`](crate::Delivery) and the
//! subscription keeps going. The others end the operation that reported them.

/// Errors produced by topic operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The topic has been disposed. No further events are produced.
    #[error("topic disposed")]
    TopicDisposed,
    /// The subscriber fell behind the ring and some events were overwritten
    /// before it could read them.
    #[error("undelivered events ({dropped} dropped)")]
    UndeliveredEvents {
        /// Advisory count of events skipped at the detected gap.
        dropped: u64,
    },
    /// The caller's cancellation token fired first.
    #[error("operation cancelled")]
    Cancelled,
    /// Topic options failed validation.
    #[error("invalid topic options: {reason}")]
    InvalidOptions {
        /// Validation error details.
        reason: String,
    },
}

impl Error {
    /// Returns `true` when the error ends the operation or subscription that
    /// reported it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::UndeliveredEvents { .. })
    }
}
