use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// A specialized `Result` for Retrace operations.
///
/// Named `RetraceResult` rather than `Result` so glob imports do not shadow
/// `std::result::Result`.
pub type RetraceResult<T, E = RetraceError> = std::result::Result<T, E>;

/// Everything that can go wrong inside Retrace.
///
/// Three families of failure live here:
///
/// - **Back-pressure** (`PredictionThreshold`, `QueueFull`,
///   `NotSynchronized`): recoverable; skip the tick or wait and retry.
/// - **Contract violations** (`OutOfOrder`, `FrameSkipped`, `StaleFrame`,
///   `MalformedDelta`, `InvalidFrame`, `InvalidHandle`, `MissingInput`,
///   `InvalidRequest`): a caller broke an API precondition; fail fast.
/// - **Fatal inconsistencies** (`MissingSnapshot`, `Desynchronized`,
///   `SerializationFailed`, `InternalInconsistency`): the session can no
///   longer be trusted.
///
/// Peer-level conditions (disconnects, interrupted connections, remote
/// checksum mismatches in a live session) are events, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetraceError {
    /// The speculative lead over the last confirmed frame reached the
    /// prediction window; no further local input can be accepted until
    /// remote inputs arrive.
    PredictionThreshold {
        /// The frame the input was meant for.
        current_frame: Frame,
        /// The last frame confirmed by all peers.
        confirmed_frame: Frame,
    },
    /// An input queue is at capacity and cannot hold another entry.
    QueueFull {
        /// The frame whose entry did not fit.
        frame: Frame,
        /// The queue's fixed capacity.
        capacity: usize,
    },
    /// The session has not finished the synchronization handshake (or has
    /// lost every peer) and cannot accept input.
    NotSynchronized,
    /// An input arrived for a frame older than the head of its queue.
    OutOfOrder {
        /// The offending frame.
        frame: Frame,
        /// The next frame the queue expects.
        head: Frame,
    },
    /// An input arrived past the head of its queue, leaving a gap; inputs
    /// must be supplied contiguously.
    FrameSkipped {
        /// The offending frame.
        frame: Frame,
        /// The next frame the queue expects.
        head: Frame,
    },
    /// A ring-buffer slot holds data for a different frame than requested —
    /// the entry has aged out or was never stored.
    StaleFrame {
        /// The frame that was asked for.
        requested: Frame,
        /// The frame actually stored in the slot.
        stored: Frame,
    },
    /// No snapshot exists for a frame the rollback engine must load.
    MissingSnapshot {
        /// The rollback target.
        frame: Frame,
    },
    /// A delta-encoded buffer does not divide evenly into input blobs, or
    /// its run-length framing is corrupt.
    MalformedDelta {
        /// Length of the encoded buffer.
        length: usize,
        /// Length of the reference blob.
        reference_length: usize,
    },
    /// A frame failed validation for the attempted operation.
    InvalidFrame {
        /// The offending frame.
        frame: Frame,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// A player handle does not refer to a participant this operation
    /// accepts.
    InvalidHandle {
        /// The offending handle.
        handle: PlayerHandle,
        /// Number of players in the session.
        num_players: usize,
    },
    /// `advance_frame()` was called before every local player's input for
    /// the current frame was registered.
    MissingInput {
        /// The player whose input is missing.
        handle: PlayerHandle,
        /// The frame that needs the input.
        frame: Frame,
    },
    /// A request that is malformed in a way the typed variants do not cover.
    InvalidRequest {
        /// Human-readable description.
        info: String,
    },
    /// A sync-test resimulation produced a different checksum — the
    /// simulation is nondeterministic or save/load is lossy.
    Desynchronized {
        /// The frame whose checksums disagree.
        frame: Frame,
        /// Checksum of the original advance.
        local_checksum: u64,
        /// Checksum of the resimulated advance.
        remote_checksum: u64,
    },
    /// Serializing or deserializing user data failed.
    SerializationFailed {
        /// What was being (de)serialized.
        context: &'static str,
    },
    /// An internal invariant was violated; this is a bug in Retrace.
    InternalInconsistency {
        /// Where the invariant broke.
        context: String,
    },
}

impl Display for RetraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PredictionThreshold {
                current_frame,
                confirmed_frame,
            } => write!(
                f,
                "prediction threshold reached (current frame {current_frame}, last confirmed {confirmed_frame})"
            ),
            Self::QueueFull { frame, capacity } => {
                write!(f, "input queue full (frame {frame}, capacity {capacity})")
            }
            Self::NotSynchronized => {
                write!(f, "session is not synchronized with all remote peers")
            }
            Self::OutOfOrder { frame, head } => {
                write!(f, "input for frame {frame} is out of order (head is {head})")
            }
            Self::FrameSkipped { frame, head } => write!(
                f,
                "input for frame {frame} skips ahead of the queue head {head}"
            ),
            Self::StaleFrame { requested, stored } => write!(
                f,
                "stale frame: requested {requested}, slot holds {stored}"
            ),
            Self::MissingSnapshot { frame } => {
                write!(f, "no snapshot saved for rollback target frame {frame}")
            }
            Self::MalformedDelta {
                length,
                reference_length,
            } => write!(
                f,
                "malformed delta buffer ({length} bytes, reference is {reference_length})"
            ),
            Self::InvalidFrame { frame, reason } => {
                write!(f, "invalid frame {frame}: {reason}")
            }
            Self::InvalidHandle {
                handle,
                num_players,
            } => write!(
                f,
                "invalid player handle {handle} for a {num_players}-player session"
            ),
            Self::MissingInput { handle, frame } => {
                write!(f, "missing local input for {handle} at frame {frame}")
            }
            Self::InvalidRequest { info } => write!(f, "invalid request: {info}"),
            Self::Desynchronized {
                frame,
                local_checksum,
                remote_checksum,
            } => write!(
                f,
                "desynchronized at frame {frame}: checksum {local_checksum:#018x} != {remote_checksum:#018x}"
            ),
            Self::SerializationFailed { context } => {
                write!(f, "serialization failed while {context}")
            }
            Self::InternalInconsistency { context } => {
                write!(f, "internal inconsistency: {context}")
            }
        }
    }
}

impl Error for RetraceError {}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_relevant_frames() {
        let err = RetraceError::OutOfOrder {
            frame: Frame::new(3),
            head: Frame::new(7),
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn desync_checksums_render_as_hex() {
        let err = RetraceError::Desynchronized {
            frame: Frame::new(12),
            local_checksum: 0xdead,
            remote_checksum: 0xbeef,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x000000000000dead"));
        assert!(msg.contains("0x000000000000beef"));
    }

    #[test]
    fn implements_std_error() {
        fn assert_error<E: Error>(_: &E) {}
        assert_error(&RetraceError::NotSynchronized);
    }
}
