use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use instant::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::network::compression::{decode, encode};
use crate::network::messages::{
    ChecksumReport, ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader,
    QualityReply, QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::time_sync::TimeSync;
use crate::{
    DesyncDetection, Frame, NonBlockingSocket, PlayerHandle, RetraceError, RetraceResult,
    SessionConfig,
};

/// Sync round trips required before a peer counts as connected.
pub(crate) const SYNC_ROUNDTRIPS: u32 = 5;

const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const QUALITY_REPORT_INTERVAL: Duration = Duration::from_millis(1000);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(200);
/// Grace period in the `Disconnected` state before the endpoint shuts down
/// and stops draining its queues.
const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);
/// Upper bound on buffered unacked outputs; a peer that falls this far
/// behind is not coming back.
const PENDING_OUTPUT_LIMIT: usize = 128;
/// Remote checksums kept for comparison.
const MAX_CHECKSUM_HISTORY: usize = 32;
/// IP + UDP header overhead, counted into the bandwidth estimate.
const UDP_HEADER_SIZE: usize = 28;

fn millis_since_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-endpoint knobs, filled in by the session builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointOptions {
    pub disconnect_timeout: Duration,
    pub disconnect_notify_start: Duration,
    pub send_interval: Duration,
    pub fps: usize,
    pub max_prediction: usize,
    pub desync_detection: DesyncDetection,
}

/// What an endpoint reports back to the session after a poll.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PeerEvent<T>
where
    T: SessionConfig,
{
    /// One sync round trip completed.
    Handshake { count: u32, total: u32 },
    /// The handshake finished; the peer is live.
    Connected,
    /// An authoritative input arrived for one of the peer's players.
    Input {
        frame: Frame,
        player: PlayerHandle,
        input: T::Input,
    },
    /// Nothing heard from the peer for the notify threshold.
    Interrupted { disconnect_timeout: u64 },
    /// Traffic resumed after an interruption.
    Resumed,
    /// The peer timed out or requested a disconnect.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Initializing,
    Syncing,
    Running,
    Disconnected,
    Shutdown,
}

/// The serialized inputs of one sender for one frame (all of the sender's
/// local players, concatenated in handle order).
#[derive(Clone)]
struct InputPayload {
    frame: Frame,
    bytes: Vec<u8>,
}

impl InputPayload {
    fn zeroed<T: SessionConfig>(player_count: usize) -> RetraceResult<Self> {
        let blob_size = bincode::serialized_size(&T::Input::default()).map_err(|_| {
            RetraceError::SerializationFailed {
                context: "sizing the input blob",
            }
        })? as usize;
        Ok(Self {
            frame: Frame::NULL,
            bytes: vec![0; blob_size * player_count],
        })
    }

    fn from_map<T: SessionConfig>(
        frame: Frame,
        inputs: &BTreeMap<PlayerHandle, T::Input>,
    ) -> RetraceResult<Self> {
        let mut bytes = Vec::new();
        // BTreeMap iteration gives ascending handle order on both ends
        for input in inputs.values() {
            bincode::serialize_into(&mut bytes, input).map_err(|_| {
                RetraceError::SerializationFailed {
                    context: "encoding an input blob",
                }
            })?;
        }
        Ok(Self { frame, bytes })
    }

    fn to_inputs<T: SessionConfig>(&self, player_count: usize) -> RetraceResult<Vec<T::Input>> {
        if player_count == 0 || self.bytes.len() % player_count != 0 {
            return Err(RetraceError::MalformedDelta {
                length: self.bytes.len(),
                reference_length: player_count,
            });
        }
        let blob_size = self.bytes.len() / player_count;
        self.bytes
            .chunks_exact(blob_size)
            .map(|chunk| {
                bincode::deserialize(chunk).map_err(|_| RetraceError::SerializationFailed {
                    context: "decoding an input blob",
                })
            })
            .collect()
    }
}

/// The per-remote-peer protocol driver: handshake, input batching with
/// redundant retransmission, acks, quality probes, keep-alives and
/// disconnect detection — everything between "the session produced inputs"
/// and "datagrams on an unreliable socket".
pub(crate) struct PeerEndpoint<T>
where
    T: SessionConfig,
{
    /// Players hosted by this peer, ascending.
    handles: Vec<PlayerHandle>,
    peer_addr: T::Address,
    options: EndpointOptions,
    /// Our session tag; peers echo it back after the handshake.
    magic: u16,
    /// The peer's tag, learned from the concluding sync reply.
    remote_magic: u16,
    state: EndpointState,

    send_queue: VecDeque<Message>,
    event_queue: VecDeque<PeerEvent<T>>,

    // handshake
    sync_remaining: u32,
    outstanding_nonces: BTreeSet<u32>,

    // timers
    last_send: Instant,
    last_recv: Instant,
    last_input_send: Instant,
    last_quality_report: Instant,
    interrupted_notified: bool,
    disconnect_emitted: bool,
    shutdown_at: Option<Instant>,

    // outbound inputs: everything sent since the peer's last ack
    pending_output: VecDeque<InputPayload>,
    last_acked: InputPayload,

    // inbound inputs, kept as delta references for future packets
    recv_inputs: BTreeMap<Frame, InputPayload>,

    /// The peer's view of every participant, merged from its messages.
    peer_connect_status: Vec<ConnectionStatus>,

    // pacing
    time_sync: TimeSync,
    local_advantage: i32,
    remote_advantage: i32,

    // statistics
    stats_start_ms: u64,
    packets_sent: usize,
    bytes_sent: usize,
    round_trip_ms: u64,

    /// Checksums reported by the peer, awaiting comparison.
    pub(crate) pending_checksums: BTreeMap<Frame, u64>,
}

impl<T: SessionConfig> PeerEndpoint<T> {
    pub(crate) fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        num_players: usize,
        local_players: usize,
        options: EndpointOptions,
    ) -> RetraceResult<Self> {
        let mut magic = rand::random::<u16>();
        while magic == 0 {
            magic = rand::random::<u16>();
        }
        handles.sort_unstable();

        let mut recv_inputs = BTreeMap::new();
        recv_inputs.insert(Frame::NULL, InputPayload::zeroed::<T>(handles.len())?);

        let now = Instant::now();
        Ok(Self {
            last_acked: InputPayload::zeroed::<T>(local_players)?,
            handles,
            peer_addr,
            options,
            magic,
            remote_magic: 0,
            state: EndpointState::Initializing,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),
            sync_remaining: SYNC_ROUNDTRIPS,
            outstanding_nonces: BTreeSet::new(),
            last_send: now,
            last_recv: now,
            last_input_send: now,
            last_quality_report: now,
            interrupted_notified: false,
            disconnect_emitted: false,
            shutdown_at: None,
            pending_output: VecDeque::new(),
            recv_inputs,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],
            time_sync: TimeSync::new(),
            local_advantage: 0,
            remote_advantage: 0,
            stats_start_ms: 0,
            packets_sent: 0,
            bytes_sent: 0,
            round_trip_ms: 0,
            pending_checksums: BTreeMap::new(),
        })
    }

    pub(crate) fn peer_addr(&self) -> &T::Address {
        &self.peer_addr
    }

    pub(crate) fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == EndpointState::Running
    }

    /// Whether the handshake has concluded (possibly followed by a
    /// disconnect); the session stops waiting on this endpoint either way.
    pub(crate) fn is_synchronized(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Running | EndpointState::Disconnected | EndpointState::Shutdown
        )
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Disconnected | EndpointState::Shutdown
        )
    }

    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// Starts the handshake. Only valid once, from the fresh state.
    pub(crate) fn synchronize(&mut self) {
        assert_eq!(self.state, EndpointState::Initializing);
        self.state = EndpointState::Syncing;
        self.sync_remaining = SYNC_ROUNDTRIPS;
        self.stats_start_ms = millis_since_epoch();
        self.send_sync_request();
    }

    pub(crate) fn disconnect(&mut self) {
        if self.state == EndpointState::Shutdown {
            return;
        }
        self.state = EndpointState::Disconnected;
        self.shutdown_at = Some(Instant::now() + SHUTDOWN_DELAY);
    }

    /// Ticks timers, queues any due retransmissions/probes and drains the
    /// events produced since the last poll.
    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, PeerEvent<T>> {
        let now = Instant::now();
        match self.state {
            EndpointState::Syncing => {
                if self.last_send + SYNC_RETRY_INTERVAL < now {
                    self.send_sync_request();
                }
            }
            EndpointState::Running => {
                // redundant retransmission covers lost input packets
                if !self.pending_output.is_empty()
                    && self.last_input_send + self.options.send_interval < now
                {
                    self.send_pending_output(connect_status);
                }

                if self.last_quality_report + QUALITY_REPORT_INTERVAL < now {
                    self.send_quality_report();
                }

                if self.last_send + KEEP_ALIVE_INTERVAL < now {
                    self.queue_message(MessageBody::KeepAlive);
                }

                if !self.interrupted_notified
                    && self.last_recv + self.options.disconnect_notify_start < now
                {
                    let remaining =
                        self.options.disconnect_timeout - self.options.disconnect_notify_start;
                    self.event_queue.push_back(PeerEvent::Interrupted {
                        disconnect_timeout: remaining.as_millis() as u64,
                    });
                    self.interrupted_notified = true;
                }

                if !self.disconnect_emitted && self.last_recv + self.options.disconnect_timeout < now
                {
                    debug!("peer timed out, emitting disconnect");
                    self.event_queue.push_back(PeerEvent::Disconnected);
                    self.disconnect_emitted = true;
                }
            }
            EndpointState::Disconnected => {
                if self.shutdown_at.is_some_and(|at| at < now) {
                    self.state = EndpointState::Shutdown;
                }
            }
            EndpointState::Initializing | EndpointState::Shutdown => {}
        }
        self.event_queue.drain(..)
    }

    /// Queues this tick's local inputs for the peer and transmits if the
    /// send interval allows.
    pub(crate) fn send_input(
        &mut self,
        frame: Frame,
        inputs: &BTreeMap<PlayerHandle, T::Input>,
        connect_status: &[ConnectionStatus],
    ) -> RetraceResult<()> {
        if self.state != EndpointState::Running {
            return Ok(());
        }

        self.time_sync
            .record_advantage(frame, self.local_advantage, self.remote_advantage);

        let payload = InputPayload::from_map::<T>(frame, inputs)?;
        self.pending_output.push_back(payload);
        if self.pending_output.len() > PENDING_OUTPUT_LIMIT {
            // the peer has stopped acking; there is no catching up
            warn!("pending output overflow, giving up on peer");
            if !self.disconnect_emitted {
                self.event_queue.push_back(PeerEvent::Disconnected);
                self.disconnect_emitted = true;
            }
            return Ok(());
        }

        if self.last_input_send + self.options.send_interval <= Instant::now() {
            self.send_pending_output(connect_status);
        }
        Ok(())
    }

    /// Sends every unacked input in one delta-encoded message.
    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus]) {
        let Some(front) = self.pending_output.front() else {
            return;
        };
        debug_assert!(self.last_acked.frame.is_null() || self.last_acked.frame + 1 == front.frame);

        let body = Input {
            start_frame: front.frame,
            bytes: encode(
                &self.last_acked.bytes,
                self.pending_output.iter().map(|payload| &payload.bytes),
            ),
            ack_frame: self.last_recv_frame(),
            disconnect_requested: self.state == EndpointState::Disconnected,
            peer_connect_status: connect_status.to_vec(),
        };
        self.last_input_send = Instant::now();
        self.queue_message(MessageBody::Input(body));
    }

    /// Flushes the send queue onto the socket.
    pub(crate) fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket<T::Address>) {
        if self.state == EndpointState::Shutdown {
            self.send_queue.clear();
            return;
        }
        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    pub(crate) fn send_checksum_report(&mut self, frame: Frame, checksum: u64) {
        self.queue_message(MessageBody::ChecksumReport(ChecksumReport {
            frame,
            checksum,
        }));
    }

    /// Re-estimates how many frames ahead of the peer we are, adjusting the
    /// peer's last reported frame by half a round trip of progress.
    pub(crate) fn update_local_advantage(&mut self, local_frame: Frame) {
        let last_recv_frame = self.last_recv_frame();
        if local_frame.is_null() || last_recv_frame.is_null() {
            return;
        }
        let transit_frames = (self.round_trip_ms as i32 / 2) * self.options.fps as i32 / 1000;
        let estimated_remote = last_recv_frame + transit_frames;
        self.local_advantage = local_frame - estimated_remote;
    }

    /// Frames the session should sleep to let this peer catch up.
    pub(crate) fn recommended_wait(&self) -> u32 {
        self.time_sync.recommended_wait()
    }

    pub(crate) fn network_stats(&self) -> RetraceResult<NetworkStats> {
        if !matches!(self.state, EndpointState::Syncing | EndpointState::Running) {
            return Err(RetraceError::NotSynchronized);
        }
        let elapsed_s = millis_since_epoch().saturating_sub(self.stats_start_ms) / 1000;
        if elapsed_s == 0 {
            return Err(RetraceError::NotSynchronized);
        }

        let total_bytes = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;
        Ok(NetworkStats {
            ping_ms: self.round_trip_ms,
            pending_inputs: self.pending_output.len(),
            kbps_sent: total_bytes / elapsed_s as usize / 1024,
            local_frame_advantage: self.local_advantage,
            remote_frame_advantage: self.remote_advantage,
        })
    }

    /*
     *  RECEIVING
     */

    /// Feeds one received datagram through the state machine.
    pub(crate) fn handle_message(&mut self, msg: &Message) {
        if self.state == EndpointState::Shutdown {
            return;
        }
        // silently drop foreign traffic once the peer's magic is known
        if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
            trace!("dropping message with foreign magic");
            return;
        }

        self.last_recv = Instant::now();
        if self.interrupted_notified && self.state == EndpointState::Running {
            self.interrupted_notified = false;
            self.event_queue.push_back(PeerEvent::Resumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => {
                if let Err(err) = self.on_input(body) {
                    // an undecodable packet is dropped; retransmission will
                    // cover the gap
                    warn!("discarding input message: {err}");
                }
            }
            MessageBody::InputAck(body) => self.pop_acked(body.ack_frame),
            MessageBody::QualityReport(body) => self.on_quality_report(*body),
            MessageBody::QualityReply(body) => {
                self.round_trip_ms = millis_since_epoch().saturating_sub(body.pong);
            }
            MessageBody::ChecksumReport(body) => self.on_checksum_report(*body),
            MessageBody::KeepAlive => {}
        }
    }

    fn on_sync_request(&mut self, body: SyncRequest) {
        self.queue_message(MessageBody::SyncReply(SyncReply { nonce: body.nonce }));
    }

    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != EndpointState::Syncing {
            return;
        }
        if !self.outstanding_nonces.remove(&body.nonce) {
            // a reply to a nonce we never sent proves nothing
            return;
        }

        self.sync_remaining -= 1;
        if self.sync_remaining > 0 {
            self.event_queue.push_back(PeerEvent::Handshake {
                count: SYNC_ROUNDTRIPS - self.sync_remaining,
                total: SYNC_ROUNDTRIPS,
            });
            self.send_sync_request();
        } else {
            self.state = EndpointState::Running;
            self.remote_magic = header.magic;
            self.last_quality_report = Instant::now();
            self.event_queue.push_back(PeerEvent::Connected);
        }
    }

    fn on_input(&mut self, body: &Input) -> RetraceResult<()> {
        self.pop_acked(body.ack_frame);

        if body.disconnect_requested {
            if self.state != EndpointState::Disconnected && !self.disconnect_emitted {
                self.event_queue.push_back(PeerEvent::Disconnected);
                self.disconnect_emitted = true;
            }
        } else {
            for (mine, theirs) in self
                .peer_connect_status
                .iter_mut()
                .zip(&body.peer_connect_status)
            {
                mine.disconnected |= theirs.disconnected;
                mine.last_frame = std::cmp::max(mine.last_frame, theirs.last_frame);
            }
        }

        let last_recv_frame = self.last_recv_frame();
        if !last_recv_frame.is_null() && body.start_frame > last_recv_frame + 1 {
            // we lost the packet carrying the reference input; a later
            // retransmission will start earlier and decode fine
            return Err(RetraceError::FrameSkipped {
                frame: body.start_frame,
                head: last_recv_frame + 1,
            });
        }

        let reference_frame = if last_recv_frame.is_null() {
            Frame::NULL
        } else {
            body.start_frame - 1
        };
        let Some(reference) = self.recv_inputs.get(&reference_frame) else {
            return Err(RetraceError::StaleFrame {
                requested: reference_frame,
                stored: Frame::NULL,
            });
        };

        let decoded = decode(&reference.bytes, &body.bytes)?;
        for (offset, blob) in decoded.into_iter().enumerate() {
            let frame = body.start_frame + offset as i32;
            if frame <= last_recv_frame {
                continue;
            }
            let payload = InputPayload { frame, bytes: blob };
            let inputs = payload.to_inputs::<T>(self.handles.len())?;
            self.recv_inputs.insert(frame, payload);
            for (player, input) in self.handles.iter().zip(inputs) {
                self.event_queue.push_back(PeerEvent::Input {
                    frame,
                    player: *player,
                    input,
                });
            }
        }

        self.queue_message(MessageBody::InputAck(InputAck {
            ack_frame: self.last_recv_frame(),
        }));

        // references older than any resend horizon will never be needed
        let horizon = self.last_recv_frame() - 2 * self.options.max_prediction as i32;
        self.recv_inputs.retain(|&frame, _| frame >= horizon);
        Ok(())
    }

    fn on_quality_report(&mut self, body: QualityReport) {
        self.remote_advantage = i32::from(body.frame_advantage);
        self.queue_message(MessageBody::QualityReply(QualityReply { pong: body.ping }));
    }

    fn on_checksum_report(&mut self, body: ChecksumReport) {
        if self.options.desync_detection == DesyncDetection::Off {
            warn!("peer sent a checksum report but desync detection is off locally");
            return;
        }
        if self.pending_checksums.len() >= MAX_CHECKSUM_HISTORY {
            let oldest = self
                .pending_checksums
                .keys()
                .next()
                .copied()
                .unwrap_or(Frame::NULL);
            self.pending_checksums.remove(&oldest);
        }
        self.pending_checksums.insert(body.frame, body.checksum);
    }

    /*
     *  SENDING HELPERS
     */

    fn send_sync_request(&mut self) {
        let nonce = rand::random::<u32>();
        self.outstanding_nonces.insert(nonce);
        self.queue_message(MessageBody::SyncRequest(SyncRequest { nonce }));
    }

    fn send_quality_report(&mut self) {
        self.last_quality_report = Instant::now();
        let clamped = self
            .local_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        self.queue_message(MessageBody::QualityReport(QualityReport {
            frame_advantage: clamped,
            ping: millis_since_epoch(),
        }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        let msg = Message {
            header: MessageHeader { magic: self.magic },
            body,
        };
        self.packets_sent += 1;
        self.bytes_sent += bincode::serialized_size(&msg).unwrap_or(0) as usize;
        self.last_send = Instant::now();
        self.send_queue.push_back(msg);
    }

    /// Drops buffered outputs up to and including the acked frame.
    fn pop_acked(&mut self, ack_frame: Frame) {
        while let Some(front) = self.pending_output.front() {
            if front.frame <= ack_frame {
                self.last_acked = self
                    .pending_output
                    .pop_front()
                    .unwrap_or_else(|| InputPayload {
                        frame: Frame::NULL,
                        bytes: Vec::new(),
                    });
            } else {
                break;
            }
        }
    }

    /// Newest frame received from this peer.
    pub(crate) fn last_recv_frame(&self) -> Frame {
        self.recv_inputs
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Frame::NULL)
    }
}

// #########
// # TESTS #
// #########
