// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the TINC control plane.
//!
//! One tagged enum covers the whole library; callers match on the
//! kind rather than on error strings.

use crate::protocol::{MessageType, ObjectType};
use std::time::Duration;
use thiserror::Error;

/// Library-wide error type.
#[derive(Debug, Error)]
pub enum TincError {
    /// Peer speaks an incompatible protocol version. Fatal for the connection.
    #[error("protocol version mismatch: peer {peer}, local {local}")]
    VersionMismatch { peer: u16, local: u16 },

    /// A frame decoded to a payload that does not fit its (message, object) pair.
    #[error("unexpected payload for ({message_type:?}, {object_type:?})")]
    UnexpectedPayload {
        message_type: MessageType,
        object_type: ObjectType,
    },

    /// COMMAND or CONFIGURE named an identifier nobody registered.
    #[error("unknown target identifier: {0}")]
    UnknownTarget(String),

    /// A mutation was rejected; prior state is preserved.
    #[error("parameter validation: {0}")]
    Validation(String),

    /// `send_command` waited past its deadline; the pending entry was evicted.
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Cache catalog or cache file I/O failed.
    #[error("cache I/O: {0}")]
    CacheIo(String),

    /// A sweep is already running on this parameter space.
    #[error("sweep already in progress")]
    SweepInProgress,

    /// The endpoint is not connected (or the socket died mid-send).
    #[error("not connected")]
    Disconnected,

    /// Processor execution failed.
    #[error("process error: {0}")]
    Process(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
