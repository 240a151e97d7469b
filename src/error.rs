// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::stream::StreamId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors raised by the routing engine.
///
/// Only `Resource` is fatal: it stops the router from accepting new
/// requests until the stream set is reconfigured. Everything else is
/// either rejected synchronously (`BadParameter`) or reported per buffer
/// while the pipeline keeps running.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// Malformed request, unconfigured stream, or missing output buffers.
    /// Rejected synchronously with no state mutated.
    #[error("invalid parameter: {0}")]
    BadParameter(String),

    /// A transform or compression step failed for one buffer. The buffer
    /// is still returned to the client marked as failed.
    #[error("stream {stream} frame {frame}: {reason}")]
    Buffer {
        stream: StreamId,
        frame: u64,
        reason: String,
    },

    /// A hardware-side allocation or capture submission failed. The
    /// router cannot guarantee further progress.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Acquisition of a just-submitted output buffer exceeded the
    /// configured timeout. Folded into per-buffer error reporting.
    #[error("timed out acquiring buffer for frame {0}")]
    FenceTimeout(u64),

    /// The router or stream has been shut down.
    #[error("engine is shut down")]
    ShutDown,
}

impl RouterError {
    /// Whether the error latches the router closed to new requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouterError::Resource(_))
    }

    /// Per-buffer helper used by workers reporting a failed job.
    pub fn buffer(stream: StreamId, frame: u64, reason: impl Into<String>) -> Self {
        RouterError::Buffer {
            stream,
            frame,
            reason: reason.into(),
        }
    }
}
