//! # Retrace
//!
//! Retrace is a peer-to-peer rollback networking runtime for frame-synchronous
//! multiplayer games, written in 100% safe Rust.
//!
//! A [`P2PSession`] collects local inputs each tick, exchanges input messages
//! with remote peers over an unreliable datagram transport, speculatively
//! advances the user's deterministic simulation with predicted remote inputs,
//! and rolls back whenever an authoritative input contradicts a prediction.
//! Instead of callbacks, every tick returns an ordered list of
//! [`SessionRequest`]s for the caller to fulfill against their simulation.
//!
//! The simulation itself is opaque to Retrace: it only needs to be
//! deterministic, serializable for snapshots, and advanced by exactly one
//! input per player per frame. See [`SessionConfig`] for the required types
//! and [`SessionBuilder`] for the configuration surface.
//!
//! A [`SyncTestSession`] is a single-process variant that re-simulates every
//! frame several times and compares checksums, which is the quickest way to
//! find nondeterminism in a simulation before taking it online.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

use std::{fmt::Debug, hash::Hash};

use serde::{de::DeserializeOwned, Serialize};

pub use error::{RetraceError, RetraceResult};
pub use network::messages::{ConnectionStatus, Message};
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use rollback::StateCell;
pub use sessions::builder::SessionBuilder;
pub use sessions::p2p_session::P2PSession;
pub use sessions::sync_test_session::SyncTestSession;
pub use time_sync::FRAME_ADVANTAGE_THRESHOLD;

/// State checksum helpers (FNV-1a 64 over a canonical serialization).
pub mod checksum;
/// The crate-wide error type.
pub mod error;

pub(crate) mod frame_info;
pub(crate) mod input_queue;
pub(crate) mod ring;
pub(crate) mod rollback;
pub(crate) mod time_sync;

/// Network-facing pieces: wire messages, delta compression, the peer
/// endpoint protocol and the default UDP transport.
pub mod network {
    /// XOR delta encoding of input runs, with a run-length stage on top.
    pub mod compression;
    /// Wire message definitions.
    pub mod messages;
    /// Connection quality statistics.
    pub mod network_stats;
    pub(crate) mod protocol;
    /// A ready-made non-blocking UDP socket.
    pub mod udp_socket;
}

pub(crate) mod sessions {
    pub(crate) mod builder;
    pub(crate) mod p2p_session;
    pub(crate) mod player_registry;
    pub(crate) mod sync_test_session;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents "no frame" / an invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A single step of game execution, the unit of logical time.
///
/// Frames start at 0 and increment sequentially. The distinguished value
/// [`Frame::NULL`] (-1) compares less than every real frame and represents
/// "no frame yet".
///
/// ```
/// use retrace::Frame;
///
/// let frame = Frame::FIRST;
/// assert!(frame.is_valid());
/// assert_eq!(frame + 1, Frame::new(1));
/// assert!(Frame::NULL < frame);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame, representing "no frame".
    pub const NULL: Self = Self(NULL_FRAME);

    /// The first frame of a session.
    pub const FIRST: Self = Self(0);

    /// Creates a frame from a raw `i32`. Not validated; use
    /// [`is_valid`](Self::is_valid) to check for a real frame number.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32`.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this is [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is a real (non-negative) frame number.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The ring-buffer slot for this frame given a buffer capacity.
    ///
    /// Returns `None` for invalid frames or a zero capacity.
    #[inline]
    #[must_use]
    pub(crate) const fn slot(self, capacity: usize) -> Option<usize> {
        if self.0 >= 0 && capacity > 0 {
            Some(self.0 as usize % capacity)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// The difference between two frames is a plain frame count.
impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// Identifies a logical participant in a session.
///
/// Handles `0..num_players` are valid players; there is no sentinel value,
/// "unset" is expressed with `Option`.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a handle from a raw index.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        Self(handle)
    }

    /// Returns the underlying index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle is a valid player index for a session
    /// with `num_players` participants.
    #[inline]
    #[must_use]
    pub const fn is_valid_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// The lifecycle state of a session, queried via `current_state()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The session has been built but has not yet contacted any peer.
    Initializing,
    /// The session is performing the synchronization handshake with remotes.
    Synchronizing,
    /// All peers are synchronized; the session accepts and transmits input.
    Running,
    /// Every remote peer has disconnected.
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Synchronizing => write!(f, "Synchronizing"),
            Self::Running => write!(f, "Running"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Tags every input handed back in [`SessionRequest::AdvanceFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputStatus {
    /// The real input received (or locally entered) for this frame.
    Confirmed,
    /// A provisional input; the real one has not arrived yet.
    Predicted,
    /// The player is disconnected at this frame; the input is blank.
    Disconnected,
}

/// The two kinds of participants Retrace knows about.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// A player on the local device.
    #[default]
    Local,
    /// A player on a remote device, identified by its transport address.
    Remote(A),
}

/// Checksum exchange between peers to detect simulation divergence.
///
/// Defaults to [`DesyncDetection::On`] with an interval of 60 confirmed
/// frames (once per second at 60 Hz).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesyncDetection {
    /// Compare checksums every `interval` confirmed frames.
    On {
        /// Number of confirmed frames between checksum reports.
        interval: u32,
    },
    /// No checksum exchange. Divergence will go unnoticed.
    Off,
}

impl Default for DesyncDetection {
    fn default() -> Self {
        Self::On { interval: 60 }
    }
}

// #####################
// # EVENTS & REQUESTS #
// #####################

/// Notifications drained from a session via `events()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent<T>
where
    T: SessionConfig,
{
    /// Handshake progress with a peer; after `total` round trips the peer is
    /// connected.
    Synchronizing {
        /// The peer's address.
        addr: T::Address,
        /// Completed round trips.
        count: u32,
        /// Required round trips.
        total: u32,
    },
    /// The handshake with this peer completed.
    Connected {
        /// The peer's address.
        addr: T::Address,
    },
    /// Every peer is connected; the session is running.
    Running,
    /// No traffic from this peer for a while; it will be disconnected in
    /// `disconnect_timeout` milliseconds unless traffic resumes.
    ConnectionInterrupted {
        /// The peer's address.
        addr: T::Address,
        /// Milliseconds until the peer is dropped.
        disconnect_timeout: u64,
    },
    /// Traffic from an interrupted peer resumed.
    ConnectionResumed {
        /// The peer's address.
        addr: T::Address,
    },
    /// The peer has been disconnected. Its inputs are blank from the
    /// disconnect frame onward and the simulation carries on without it.
    Disconnected {
        /// The peer's address.
        addr: T::Address,
    },
    /// The session is running ahead of its peers; skipping `skip_frames`
    /// local ticks will let them catch up.
    WaitRecommendation {
        /// Recommended number of frames to skip.
        skip_frames: u32,
    },
    /// A remote checksum disagrees with the local one for a confirmed frame.
    DesyncDetected {
        /// The frame the checksums belong to.
        frame: Frame,
        /// Our checksum for that frame.
        local_checksum: u64,
        /// The peer's checksum for that frame.
        remote_checksum: u64,
        /// The peer's address.
        addr: T::Address,
    },
}

/// Requests returned by `advance_frame()`. Fulfilling them **in order** is
/// mandatory; the sequence encodes the rollback algorithm:
///
/// 1. `SaveState` before an advance keeps the frame recoverable.
/// 2. `LoadState` rewinds the simulation during a rollback.
/// 3. `AdvanceFrame` steps the simulation with one input per player.
///
/// Reordering or skipping requests desynchronizes the session.
#[derive(Debug, Clone)]
pub enum SessionRequest<T>
where
    T: SessionConfig,
{
    /// Save the current simulation state into `cell`. The state must belong
    /// to `frame`; pass a checksum if desync detection should cover it.
    SaveState {
        /// Destination cell; call [`StateCell::save`] on it.
        cell: StateCell<T::State>,
        /// The frame the saved state must correspond to.
        frame: Frame,
    },
    /// Replace the current simulation state with the one stored in `cell`.
    LoadState {
        /// Source cell; call [`StateCell::load`] on it.
        cell: StateCell<T::State>,
        /// The frame the loaded state corresponds to.
        frame: Frame,
    },
    /// Advance the simulation by exactly one frame using `inputs`.
    AdvanceFrame {
        /// The frame being advanced *from*.
        frame: Frame,
        /// One `(input, status)` pair per player, in handle order.
        inputs: Vec<(T::Input, InputStatus)>,
    },
}

impl<T: SessionConfig> std::fmt::Display for SessionRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SaveState { frame, .. } => write!(f, "SaveState({frame})"),
            Self::LoadState { frame, .. } => write!(f, "LoadState({frame})"),
            Self::AdvanceFrame { frame, inputs } => {
                write!(f, "AdvanceFrame({frame}, {} inputs)", inputs.len())
            }
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// Compile-time parameterization for sessions, bundling the user-supplied
/// types into one marker.
///
/// ```
/// use retrace::SessionConfig;
/// use serde::{Deserialize, Serialize};
/// use std::net::SocketAddr;
///
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct Buttons(u8);
///
/// #[derive(Clone)]
/// struct World { /* .. */ }
///
/// struct GameConfig;
///
/// impl SessionConfig for GameConfig {
///     type Input = Buttons;
///     type State = World;
///     type Address = SocketAddr;
/// }
/// ```
pub trait SessionConfig: 'static {
    /// The per-player input type — the only game data that crosses the wire.
    /// Its serialized size must be constant for the whole session, and
    /// [`Default`] is the canonical "no input" value (also used for
    /// disconnected players).
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned;

    /// The snapshot type for save/load requests.
    type State;

    /// The address type identifying remote peers.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// The transport capability Retrace needs: fire-and-forget sends and a
/// non-blocking drain of everything received since the last drain.
///
/// Delivery may drop, duplicate and reorder messages; the endpoint protocol
/// tolerates all three through redundant retransmission.
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Sends a message to the given address. May silently drop.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Returns all messages received since the last call, never blocking.
    fn receive_all(&mut self) -> Vec<(A, Message)>;
}

// #########
// # TESTS #
// #########


#[cfg(test)]
mod handle_tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(PlayerHandle::new(1).is_valid_for(2));
        assert!(!PlayerHandle::new(2).is_valid_for(2));
    }

    #[test]
    fn display() {
        assert_eq!(PlayerHandle::new(3).to_string(), "P3");
    }
}
