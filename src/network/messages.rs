use serde::{Deserialize, Serialize};

use crate::Frame;

/// One peer's view of another participant's progress, broadcast inside
/// every input message so each peer continuously refreshes its picture of
/// everyone else.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the participant is known to have disconnected.
    pub disconnected: bool,
    /// The newest frame received from that participant.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    /// Nonce the receiver must echo back.
    pub nonce: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    /// The echoed nonce.
    pub nonce: u32,
}

/// A run of delta-encoded inputs covering `start_frame` and everything the
/// sender has produced since, bundled with acknowledgement and status data.
/// Retransmitted redundantly until acked; idempotent on receipt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectionStatus>,
    pub disconnect_requested: bool,
    pub start_frame: Frame,
    /// The newest frame of the receiver's inputs the sender has seen.
    pub ack_frame: Frame,
    /// Delta- and run-length-encoded input payload.
    pub bytes: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            bytes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("peer_connect_status", &self.peer_connect_status)
            .field("disconnect_requested", &self.disconnect_requested)
            .field("start_frame", &self.start_frame)
            .field("ack_frame", &self.ack_frame)
            .field("bytes", &format_args!("{} bytes", self.bytes.len()))
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// The sender's frame advantage over the receiver. An `i16` keeps the
    /// range generous (a stalled peer can accumulate hundreds of frames)
    /// without paying for a full `i32` on every report.
    pub frame_advantage: i16,
    /// Sender's wall clock in milliseconds, echoed back in the reply.
    pub ping: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct ChecksumReport {
    pub frame: Frame,
    pub checksum: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    /// Random per-session tag; messages with a foreign magic are dropped.
    pub magic: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    ChecksumReport(ChecksumReport),
    KeepAlive,
}

/// A datagram exchanged between peer endpoints.
///
/// Transport implementations treat it as an opaque serde value: serialize
/// on [`send_to`], deserialize whole datagrams on [`receive_all`] and drop
/// anything that does not parse.
///
/// [`send_to`]: crate::NonBlockingSocket::send_to
/// [`receive_all`]: crate::NonBlockingSocket::receive_all
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

// #########
// # TESTS #
// #########
