use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::PeerEvent;
use crate::rollback::RollbackEngine;
use crate::sessions::player_registry::PlayerRegistry;
use crate::{
    DesyncDetection, Frame, NonBlockingSocket, PlayerHandle, PlayerType, RetraceError,
    RetraceResult, SessionConfig, SessionEvent, SessionRequest, SessionState,
};

/// Frames between consecutive wait recommendations, so the user is not
/// spammed while the peers converge.
const WAIT_RECOMMENDATION_INTERVAL: i32 = 60;

/// Oldest events are dropped past this, in case the user never drains.
const MAX_EVENT_QUEUE: usize = 100;

/// Locally computed checksums retained for comparison against peers.
const MAX_CHECKSUM_HISTORY: usize = 32;

/// A peer-to-peer rollback session.
///
/// Drive it once per simulation tick:
///
/// 1. [`add_local_input`](Self::add_local_input) for every local player,
/// 2. [`advance_frame`](Self::advance_frame), fulfilling the returned
///    requests in order,
/// 3. [`events`](Self::events) to react to connection changes and pacing
///    recommendations.
///
/// Call [`poll_remote_clients`](Self::poll_remote_clients) as often as
/// possible (more often than the tick rate is fine and lowers latency).
pub struct P2PSession<T>
where
    T: SessionConfig,
{
    num_players: usize,
    max_prediction: usize,
    engine: RollbackEngine<T>,
    state: SessionState,
    socket: Box<dyn NonBlockingSocket<T::Address>>,
    registry: PlayerRegistry<T>,
    /// Our own view of every participant's progress, broadcast with each
    /// input message.
    local_connect_status: Vec<ConnectionStatus>,
    event_queue: VecDeque<SessionEvent<T>>,
    /// Inputs registered for the upcoming tick, keyed by local handle.
    local_inputs: BTreeMap<PlayerHandle, T::Input>,
    /// Rollback floor set when a disconnect invalidates predicted inputs.
    disconnect_frame: Frame,
    /// The next frame at which a wait recommendation may fire.
    next_wait_check: Frame,
    desync_detection: DesyncDetection,
    local_checksum_history: BTreeMap<Frame, u64>,
    last_checksum_frame: Frame,
}

impl<T: SessionConfig> P2PSession<T> {
    pub(crate) fn new(
        num_players: usize,
        max_prediction: usize,
        queue_capacity: usize,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
        registry: PlayerRegistry<T>,
        desync_detection: DesyncDetection,
    ) -> Self {
        Self {
            num_players,
            max_prediction,
            engine: RollbackEngine::new(num_players, max_prediction, queue_capacity),
            state: SessionState::Initializing,
            socket,
            registry,
            local_connect_status: vec![ConnectionStatus::default(); num_players],
            event_queue: VecDeque::new(),
            local_inputs: BTreeMap::new(),
            disconnect_frame: Frame::NULL,
            next_wait_check: Frame::FIRST,
            desync_detection,
            local_checksum_history: BTreeMap::new(),
            last_checksum_frame: Frame::NULL,
        }
    }

    /// Registers the local input for `handle` for the current frame.
    /// Calling it twice before advancing overwrites the earlier input.
    ///
    /// # Errors
    /// - [`RetraceError::PredictionThreshold`] when the session has
    ///   speculated as far as allowed; poll and retry next tick.
    /// - [`RetraceError::InvalidHandle`] / [`RetraceError::InvalidRequest`]
    ///   when `handle` is unknown or not local.
    pub fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        input: T::Input,
    ) -> RetraceResult<()> {
        match self.registry.handles.get(&handle) {
            Some(PlayerType::Local) => {}
            Some(PlayerType::Remote(_)) => {
                return Err(RetraceError::InvalidRequest {
                    info: format!("player {handle} is remote; only local inputs can be added"),
                })
            }
            None => {
                return Err(RetraceError::InvalidHandle {
                    handle,
                    num_players: self.num_players,
                })
            }
        }

        let current = self.engine.current_frame();
        let confirmed = self.engine.last_confirmed_frame();
        let frames_ahead = if confirmed.is_null() {
            current.as_i32()
        } else {
            current - confirmed
        };
        if frames_ahead >= self.max_prediction as i32 {
            return Err(RetraceError::PredictionThreshold {
                current_frame: current,
                confirmed_frame: confirmed,
            });
        }

        self.local_inputs.insert(handle, input);
        Ok(())
    }

    /// Runs one tick of the rollback algorithm and returns the requests the
    /// caller must fulfill, in order.
    ///
    /// # Errors
    /// - [`RetraceError::NotSynchronized`] while the handshake is pending.
    /// - [`RetraceError::MissingInput`] when a local player's input was not
    ///   registered this tick.
    pub fn advance_frame(&mut self) -> RetraceResult<Vec<SessionRequest<T>>> {
        self.poll_remote_clients();

        // a session whose last peer dropped keeps simulating locally
        if !matches!(
            self.state,
            SessionState::Running | SessionState::Disconnected
        ) {
            return Err(RetraceError::NotSynchronized);
        }

        for handle in self.registry.local_player_handles() {
            if !self.local_inputs.contains_key(&handle) {
                return Err(RetraceError::MissingInput {
                    handle,
                    frame: self.engine.current_frame(),
                });
            }
        }

        // checksum state must be examined before this tick can confirm more
        // frames, or a rolled-back frame would be compared against its own
        // replacement
        if self.desync_detection != DesyncDetection::Off {
            self.send_checksum_reports();
            self.compare_checksums_with_peers();
        }

        let mut requests = Vec::with_capacity(2);

        // fold in what other peers know about disconnects
        self.update_player_disconnects();

        let confirmed = self.confirmed_frame();

        // a contradicted prediction (or a disconnect behind the simulated
        // frame) forces a rewind
        let first_incorrect = self.engine.first_incorrect_frame(self.disconnect_frame);
        if !first_incorrect.is_null() {
            self.rollback_to(first_incorrect, &mut requests)?;
            self.disconnect_frame = Frame::NULL;
        }

        // raise the authoritative frame and drop acked input history
        if !confirmed.is_null() {
            self.engine.set_last_confirmed_frame(confirmed);
        }

        self.check_wait_recommendation();

        let current = self.engine.current_frame();
        let frames_ahead = if confirmed.is_null() {
            current.as_i32()
        } else {
            current - confirmed
        };
        if frames_ahead < self.max_prediction as i32 {
            // ingest this tick's local inputs and fan them out
            for (&handle, &input) in &self.local_inputs {
                self.engine.add_local_input(handle, current, input)?;
                if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
                    status.last_frame = current;
                }
            }
            for endpoint in self.registry.remotes.values_mut() {
                endpoint.send_input(current, &self.local_inputs, &self.local_connect_status)?;
                endpoint.send_all_messages(self.socket.as_mut());
            }

            requests.push(self.engine.save_request()?);
            let inputs = self.engine.synchronized_inputs(&self.local_connect_status)?;
            self.engine.advance_frame();
            self.local_inputs.clear();
            requests.push(SessionRequest::AdvanceFrame {
                frame: current,
                inputs,
            });
        } else {
            // the prediction window is exhausted; sit this tick out
            debug!(
                frame = current.as_i32(),
                "prediction window exhausted, skipping advance"
            );
            self.push_event(SessionEvent::WaitRecommendation { skip_frames: 1 });
        }

        Ok(requests)
    }

    /// Drains the socket, drives every peer endpoint's timers, applies
    /// received inputs and flushes outgoing messages. Call freely.
    pub fn poll_remote_clients(&mut self) {
        if self.state == SessionState::Initializing {
            for endpoint in self.registry.remotes.values_mut() {
                endpoint.synchronize();
            }
            self.state = SessionState::Synchronizing;
            self.check_initial_sync();
        }

        for (from, msg) in self.socket.receive_all() {
            if let Some(endpoint) = self.registry.remotes.get_mut(&from) {
                endpoint.handle_message(&msg);
            }
        }

        let current = self.engine.current_frame();
        for endpoint in self.registry.remotes.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_advantage(current);
            }
        }

        let mut events = Vec::new();
        for endpoint in self.registry.remotes.values_mut() {
            let addr = endpoint.peer_addr().clone();
            let handles = endpoint.handles().to_vec();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push((event, addr.clone(), handles.clone()));
            }
        }
        for (event, addr, handles) in events {
            self.handle_peer_event(event, addr, handles);
        }

        for endpoint in self.registry.remotes.values_mut() {
            endpoint.send_all_messages(self.socket.as_mut());
        }

        if self.state == SessionState::Running
            && !self.registry.remotes.is_empty()
            && self
                .registry
                .remotes
                .values()
                .all(|endpoint| endpoint.is_disconnected())
        {
            self.state = SessionState::Disconnected;
        }
    }

    /// Disconnects a remote player by hand (e.g. on a "rage quit" report
    /// from the application layer).
    ///
    /// # Errors
    /// [`RetraceError::InvalidRequest`] for local, unknown or already
    /// disconnected players.
    pub fn disconnect_player(&mut self, handle: PlayerHandle) -> RetraceResult<()> {
        let addr = match self.registry.handles.get(&handle) {
            Some(PlayerType::Remote(addr)) => addr.clone(),
            Some(PlayerType::Local) => {
                return Err(RetraceError::InvalidRequest {
                    info: "local players cannot be disconnected".to_owned(),
                })
            }
            None => {
                return Err(RetraceError::InvalidRequest {
                    info: format!("no player with handle {handle}"),
                })
            }
        };
        let status = self
            .local_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default();
        if status.disconnected {
            return Err(RetraceError::InvalidRequest {
                info: format!("player {handle} is already disconnected"),
            });
        }
        self.disconnect_player_at_frame(handle, status.last_frame);
        self.push_event(SessionEvent::Disconnected { addr });
        Ok(())
    }

    /// Connection quality for the peer hosting `handle`.
    ///
    /// # Errors
    /// - [`RetraceError::InvalidRequest`] when `handle` is not remote.
    /// - [`RetraceError::NotSynchronized`] before any traffic was measured.
    pub fn network_stats(&self, handle: PlayerHandle) -> RetraceResult<NetworkStats> {
        let addr = self
            .registry
            .address_of(handle)
            .ok_or_else(|| RetraceError::InvalidRequest {
                info: format!("player {handle} is not remote"),
            })?;
        match self.registry.remotes.get(addr) {
            Some(endpoint) => endpoint.network_stats(),
            None => Err(RetraceError::InternalInconsistency {
                context: format!("no endpoint for registered remote player {handle}"),
            }),
        }
    }

    /// Events accumulated since the last call.
    pub fn events(&mut self) -> Drain<'_, SessionEvent<T>> {
        self.event_queue.drain(..)
    }

    /// The lifecycle state of this session.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame currently being simulated (the head of speculation).
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.engine.current_frame()
    }

    /// The last frame for which every connected peer's input is confirmed.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        let mut confirmed = Frame::new(i32::MAX);
        for status in &self.local_connect_status {
            if !status.disconnected {
                confirmed = std::cmp::min(confirmed, status.last_frame);
            }
        }
        if confirmed.as_i32() == i32::MAX {
            Frame::NULL
        } else {
            confirmed
        }
    }

    /// Number of participants.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The speculation bound this session was built with.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// Handles of the players on this device.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.registry.local_player_handles()
    }

    /// Handles of the players on remote devices.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.registry.remote_player_handles()
    }

    /*
     *  INTERNALS
     */

    fn handle_peer_event(
        &mut self,
        event: PeerEvent<T>,
        addr: T::Address,
        handles: Vec<PlayerHandle>,
    ) {
        match event {
            PeerEvent::Handshake { count, total } => {
                self.push_event(SessionEvent::Synchronizing { addr, count, total });
            }
            PeerEvent::Connected => {
                self.push_event(SessionEvent::Connected { addr });
                self.check_initial_sync();
            }
            PeerEvent::Interrupted { disconnect_timeout } => {
                self.push_event(SessionEvent::ConnectionInterrupted {
                    addr,
                    disconnect_timeout,
                });
            }
            PeerEvent::Resumed => {
                self.push_event(SessionEvent::ConnectionResumed { addr });
            }
            PeerEvent::Disconnected => {
                for handle in handles {
                    let last_frame = self
                        .local_connect_status
                        .get(handle.as_usize())
                        .map_or(Frame::NULL, |status| status.last_frame);
                    self.disconnect_player_at_frame(handle, last_frame);
                }
                self.push_event(SessionEvent::Disconnected { addr });
            }
            PeerEvent::Input {
                frame,
                player,
                input,
            } => {
                let Some(status) = self.local_connect_status.get_mut(player.as_usize()) else {
                    warn!("input for unknown player {player}");
                    return;
                };
                if status.disconnected {
                    return;
                }
                let expected = status.last_frame + 1;
                if !status.last_frame.is_null() && frame != expected {
                    warn!(
                        "dropping input for frame {frame}, expected contiguous frame {expected}"
                    );
                    return;
                }
                status.last_frame = frame;
                if let Err(err) = self.engine.confirm_remote_input(player, frame, input) {
                    warn!("could not apply remote input at frame {frame}: {err}");
                }
            }
        }
    }

    /// Rewinds to `first_incorrect` and replays up to the frame we were on,
    /// refreshing snapshots along the way.
    fn rollback_to(
        &mut self,
        first_incorrect: Frame,
        requests: &mut Vec<SessionRequest<T>>,
    ) -> RetraceResult<()> {
        let current = self.engine.current_frame();
        if first_incorrect >= current {
            // nothing simulated past the correction; new inputs will simply
            // be used going forward
            self.engine.reset_predictions();
            return Ok(());
        }

        trace!(
            from = current.as_i32(),
            to = first_incorrect.as_i32(),
            "rolling back"
        );
        requests.push(self.engine.load_request(first_incorrect)?);
        self.engine.reset_predictions();

        let count = current - first_incorrect;
        for step in 0..count {
            if step > 0 {
                requests.push(self.engine.save_request()?);
            }
            let frame = self.engine.current_frame();
            let inputs = self.engine.synchronized_inputs(&self.local_connect_status)?;
            self.engine.advance_frame();
            requests.push(SessionRequest::AdvanceFrame { frame, inputs });
        }

        debug_assert_eq!(self.engine.current_frame(), current);
        Ok(())
    }

    /// Adopts disconnects that other peers observed before we did.
    fn update_player_disconnects(&mut self) {
        for idx in 0..self.num_players {
            let handle = PlayerHandle::new(idx);
            let mut all_connected = true;
            let mut min_confirmed = Frame::new(i32::MAX);

            for endpoint in self.registry.remotes.values() {
                if !endpoint.is_running() {
                    continue;
                }
                let status = endpoint.peer_connect_status(handle);
                all_connected &= !status.disconnected;
                min_confirmed = std::cmp::min(min_confirmed, status.last_frame);
            }

            let local = self
                .local_connect_status
                .get(idx)
                .copied()
                .unwrap_or_default();
            if !local.disconnected {
                min_confirmed = std::cmp::min(min_confirmed, local.last_frame);
            }

            if !all_connected && (!local.disconnected || local.last_frame > min_confirmed) {
                debug!("peer-reported disconnect of {handle} at frame {min_confirmed}");
                self.disconnect_player_at_frame(handle, min_confirmed);
            }
        }
    }

    fn disconnect_player_at_frame(&mut self, handle: PlayerHandle, last_frame: Frame) {
        let Some(PlayerType::Remote(addr)) = self.registry.handles.get(&handle) else {
            return;
        };
        let addr = addr.clone();
        let Some(endpoint) = self.registry.remotes.get_mut(&addr) else {
            return;
        };

        // every player hosted by that device goes down with it
        let handles = endpoint.handles().to_vec();
        endpoint.disconnect();
        for &h in &handles {
            let player_last_frame = self
                .local_connect_status
                .get(h.as_usize())
                .map_or(last_frame, |status| status.last_frame);
            if let Some(status) = self.local_connect_status.get_mut(h.as_usize()) {
                status.disconnected = true;
            }
            let _ = self
                .engine
                .set_disconnect_frame(h, player_last_frame + 1);
        }

        // inputs we predicted past the disconnect are wrong; rewind there
        if self.engine.current_frame() > last_frame {
            let rollback_floor = last_frame + 1;
            self.disconnect_frame = if self.disconnect_frame.is_null() {
                rollback_floor
            } else {
                std::cmp::min(self.disconnect_frame, rollback_floor)
            };
        }

        self.check_initial_sync();
    }

    /// Moves to `Running` once every endpoint is through its handshake.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        if self
            .registry
            .remotes
            .values()
            .all(|endpoint| endpoint.is_synchronized())
        {
            self.state = SessionState::Running;
            self.push_event(SessionEvent::Running);
        }
    }

    fn check_wait_recommendation(&mut self) {
        if self.engine.current_frame() < self.next_wait_check {
            return;
        }
        let skip_frames = self
            .registry
            .remotes
            .values()
            .filter(|endpoint| endpoint.is_running())
            .map(|endpoint| endpoint.recommended_wait())
            .max()
            .unwrap_or(0);
        if skip_frames > 0 {
            self.next_wait_check = self.engine.current_frame() + WAIT_RECOMMENDATION_INTERVAL;
            self.push_event(SessionEvent::WaitRecommendation { skip_frames });
        }
    }

    /// Reports the checksum of every `interval`-th confirmed frame.
    fn send_checksum_reports(&mut self) {
        let DesyncDetection::On { interval } = self.desync_detection else {
            return;
        };
        // fixed multiples of the interval keep both peers talking about the
        // same frames
        let frame_to_send = if self.last_checksum_frame.is_null() {
            Frame::new(interval as i32)
        } else {
            self.last_checksum_frame + interval as i32
        };
        if frame_to_send > self.engine.last_confirmed_frame() {
            return;
        }
        let Some(cell) = self.engine.snapshot_by_frame(frame_to_send) else {
            return;
        };
        let Some(checksum) = cell.checksum() else {
            return;
        };

        for endpoint in self.registry.remotes.values_mut() {
            if endpoint.is_running() {
                endpoint.send_checksum_report(frame_to_send, checksum);
            }
        }
        self.local_checksum_history.insert(frame_to_send, checksum);
        self.last_checksum_frame = frame_to_send;

        while self.local_checksum_history.len() > MAX_CHECKSUM_HISTORY {
            let Some(oldest) = self.local_checksum_history.keys().next().copied() else {
                break;
            };
            self.local_checksum_history.remove(&oldest);
        }
    }

    fn compare_checksums_with_peers(&mut self) {
        let confirmed = self.engine.last_confirmed_frame();
        let mut desyncs = Vec::new();

        for (addr, endpoint) in self.registry.remotes.iter_mut() {
            let mut settled = Vec::new();
            for (&frame, &remote_checksum) in &endpoint.pending_checksums {
                if frame >= confirmed {
                    // this frame could still be rolled back locally
                    continue;
                }
                settled.push(frame);
                if let Some(&local_checksum) = self.local_checksum_history.get(&frame) {
                    if local_checksum != remote_checksum {
                        desyncs.push(SessionEvent::DesyncDetected {
                            frame,
                            local_checksum,
                            remote_checksum,
                            addr: addr.clone(),
                        });
                    }
                }
            }
            for frame in settled {
                endpoint.pending_checksums.remove(&frame);
            }
        }

        for event in desyncs {
            self.push_event(event);
        }
    }

    fn push_event(&mut self, event: SessionEvent<T>) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE {
            self.event_queue.pop_front();
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::Message;
    use crate::SessionBuilder;
    use std::net::SocketAddr;

    #[derive(Debug)]
    struct TestConfig;

    impl SessionConfig for TestConfig {
        type Input = u8;
        type State = u64;
        type Address = SocketAddr;
    }

    /// A socket into the void: sends vanish, nothing is received.
    struct NullSocket;

    impl NonBlockingSocket<SocketAddr> for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &SocketAddr) {}
        fn receive_all(&mut self) -> Vec<(SocketAddr, Message)> {
            Vec::new()
        }
    }

    fn local_only_session() -> P2PSession<TestConfig> {
        SessionBuilder::<TestConfig>::new()
            .with_num_players(1)
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .start_p2p_session(NullSocket)
            .unwrap()
    }

    fn two_player_session() -> P2PSession<TestConfig> {
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        SessionBuilder::<TestConfig>::new()
            .with_num_players(2)
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .add_player(PlayerType::Remote(remote), PlayerHandle::new(1))
            .unwrap()
            .start_p2p_session(NullSocket)
            .unwrap()
    }

    #[test]
    fn session_without_remotes_runs_immediately() {
        let mut session = local_only_session();
        assert_eq!(session.current_state(), SessionState::Initializing);
        session.poll_remote_clients();
        assert_eq!(session.current_state(), SessionState::Running);
    }

    #[test]
    fn advancing_before_sync_is_rejected() {
        let mut session = two_player_session();
        session.add_local_input(PlayerHandle::new(0), 1).unwrap();
        assert!(matches!(
            session.advance_frame(),
            Err(RetraceError::NotSynchronized)
        ));
    }

    #[test]
    fn local_session_produces_save_then_advance() {
        let mut session = local_only_session();
        session.add_local_input(PlayerHandle::new(0), 7).unwrap();
        let requests = session.advance_frame().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(matches!(
            requests[0],
            SessionRequest::SaveState { frame, .. } if frame == Frame::FIRST
        ));
        match &requests[1] {
            SessionRequest::AdvanceFrame { frame, inputs } => {
                assert_eq!(*frame, Frame::FIRST);
                assert_eq!(inputs.as_slice(), &[(7, crate::InputStatus::Confirmed)]);
            }
            other => panic!("expected an advance request, got {other}"),
        }
        assert_eq!(session.current_frame(), Frame::new(1));
    }

    #[test]
    fn missing_input_is_rejected() {
        let mut session = local_only_session();
        session.poll_remote_clients();
        assert!(matches!(
            session.advance_frame(),
            Err(RetraceError::MissingInput { .. })
        ));
    }

    #[test]
    fn remote_handles_cannot_receive_local_input() {
        let mut session = two_player_session();
        assert!(matches!(
            session.add_local_input(PlayerHandle::new(1), 0),
            Err(RetraceError::InvalidRequest { .. })
        ));
        assert!(matches!(
            session.add_local_input(PlayerHandle::new(7), 0),
            Err(RetraceError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn speculation_is_bounded_without_remote_input() {
        let mut session = two_player_session();
        session.poll_remote_clients();
        // force the running state: the peer never answers on a null socket
        session.state = SessionState::Running;

        let mut advanced = 0;
        loop {
            match session.add_local_input(PlayerHandle::new(0), 1) {
                Ok(()) => {}
                Err(RetraceError::PredictionThreshold { .. }) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
            let requests = session.advance_frame().unwrap();
            if requests.is_empty() {
                break;
            }
            advanced += 1;
            assert!(advanced <= 8, "speculated past the prediction window");
        }
        assert_eq!(session.current_frame(), Frame::new(8));
    }

    #[test]
    fn manual_disconnect_marks_the_player() {
        let mut session = two_player_session();
        session.poll_remote_clients();
        session.state = SessionState::Running;

        session.disconnect_player(PlayerHandle::new(1)).unwrap();
        assert!(session.local_connect_status[1].disconnected);
        assert!(session
            .events()
            .any(|event| matches!(event, SessionEvent::Disconnected { .. })));
        // a second disconnect is invalid
        assert!(session.disconnect_player(PlayerHandle::new(1)).is_err());
        // the queue hands out blank disconnected inputs now
        assert_eq!(
            session.engine.disconnect_frame(PlayerHandle::new(1)),
            Frame::FIRST
        );
    }

    #[test]
    fn session_keeps_running_after_full_disconnect() {
        let mut session = two_player_session();
        session.poll_remote_clients();
        session.state = SessionState::Running;
        session.disconnect_player(PlayerHandle::new(1)).unwrap();
        session.poll_remote_clients();

        // the lone survivor can still advance
        for frame in 0..20 {
            session.add_local_input(PlayerHandle::new(0), 1).unwrap();
            let requests = session.advance_frame().unwrap();
            assert!(!requests.is_empty(), "stalled at frame {frame}");
        }
    }
}
