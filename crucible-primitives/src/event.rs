//! Events produced by streaming invocations.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Output stream an event chunk belongs to.
///
/// Chunk ordering is guaranteed within a stream, not between streams.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output of the sandboxed program.
    Stdout,
    /// Standard error of the sandboxed program.
    Stderr,
}

/// Cause attached to a terminal stream error event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamErrorCause {
    /// The invocation was cancelled by the caller.
    Cancelled,
    /// The invocation exceeded its deadline.
    Timeout,
    /// The sandbox reported an execution failure.
    Execution,
}

/// One event in the finite, ordered sequence produced by a streaming
/// invocation.
///
/// A sequence is terminated by exactly one [`StreamEvent::Exit`] or
/// [`StreamEvent::Error`] event, never both and never neither.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental output produced by the sandbox, in producer order.
    Output {
        /// Stream the chunk was written to.
        stream: OutputStream,
        /// Raw chunk bytes.
        bytes: Bytes,
    },
    /// Terminal event carrying the final exit status.
    Exit {
        /// Exit code reported by the sandbox.
        code: i32,
    },
    /// Terminal event carrying a failure cause.
    Error {
        /// Classified cause of the failure.
        cause: StreamErrorCause,
        /// Human-readable description.
        message: String,
    },
}

impl StreamEvent {
    /// Returns `true` for terminal events (`Exit` or `Error`).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_detection() {
        let chunk = StreamEvent::Output {
            stream: OutputStream::Stdout,
            bytes: Bytes::from_static(b"x"),
        };
        assert!(!chunk.is_terminal());
        assert!(StreamEvent::Exit { code: 0 }.is_terminal());
        assert!(
            StreamEvent::Error {
                cause: StreamErrorCause::Cancelled,
                message: "cancelled".into(),
            }
            .is_terminal()
        );
    }
}
