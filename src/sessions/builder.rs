use std::collections::BTreeMap;

use instant::Duration;

use crate::network::protocol::EndpointOptions;
use crate::sessions::player_registry::PlayerRegistry;
use crate::{
    input_queue::DEFAULT_QUEUE_CAPACITY, DesyncDetection, NonBlockingSocket, P2PSession,
    PlayerHandle, PlayerType, RetraceError, RetraceResult, SessionConfig, SyncTestSession,
};

const DEFAULT_MAX_PREDICTION: usize = 8;
const DEFAULT_FPS: usize = 60;
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_DISCONNECT_NOTIFY_START: Duration = Duration::from_millis(750);
const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(16);
const DEFAULT_CHECK_ROUNDS: usize = 1;

/// The one way to construct a session; every knob the runtime exposes
/// lives here.
///
/// ```no_run
/// use retrace::{PlayerHandle, PlayerType, SessionBuilder, SessionConfig, UdpNonBlockingSocket};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// # struct Buttons(u8);
/// # struct GameConfig;
/// # impl SessionConfig for GameConfig {
/// #     type Input = Buttons;
/// #     type State = u64;
/// #     type Address = std::net::SocketAddr;
/// # }
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let remote_addr = "203.0.113.1:7000".parse()?;
/// let socket = UdpNonBlockingSocket::bind_to_port(7000)?;
/// let session = SessionBuilder::<GameConfig>::new()
///     .with_num_players(2)
///     .add_player(PlayerType::Local, PlayerHandle::new(0))?
///     .add_player(PlayerType::Remote(remote_addr), PlayerHandle::new(1))?
///     .with_max_prediction_window(8)
///     .start_p2p_session(socket)?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder<T>
where
    T: SessionConfig,
{
    num_players: usize,
    max_prediction: usize,
    fps: usize,
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    send_interval: Duration,
    queue_capacity: usize,
    desync_detection: DesyncDetection,
    check_rounds: usize,
    handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
}

impl<T: SessionConfig> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SessionConfig> SessionBuilder<T> {
    /// A builder with the documented defaults: 2 players, 60 fps, a
    /// prediction window of 8, 5 s disconnect timeout (notify after
    /// 750 ms), 16 ms input send interval, queue capacity 128, desync
    /// detection every 60 frames.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_players: 2,
            max_prediction: DEFAULT_MAX_PREDICTION,
            fps: DEFAULT_FPS,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            send_interval: DEFAULT_SEND_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            desync_detection: DesyncDetection::default(),
            check_rounds: DEFAULT_CHECK_ROUNDS,
            handles: BTreeMap::new(),
        }
    }

    /// Total number of participants; fixes the width of the input vector
    /// handed back in advance requests.
    #[must_use]
    pub fn with_num_players(mut self, num_players: usize) -> Self {
        self.num_players = num_players;
        self
    }

    /// Registers a participant under `handle`. Handles must be the dense
    /// range `0..num_players`, each added exactly once.
    ///
    /// # Errors
    /// [`RetraceError::InvalidHandle`] for out-of-range handles,
    /// [`RetraceError::InvalidRequest`] for duplicates.
    pub fn add_player(
        mut self,
        player: PlayerType<T::Address>,
        handle: PlayerHandle,
    ) -> RetraceResult<Self> {
        if !handle.is_valid_for(self.num_players) {
            return Err(RetraceError::InvalidHandle {
                handle,
                num_players: self.num_players,
            });
        }
        if self.handles.contains_key(&handle) {
            return Err(RetraceError::InvalidRequest {
                info: format!("player {handle} was already added"),
            });
        }
        self.handles.insert(handle, player);
        Ok(self)
    }

    /// Target simulation frequency; drives the ping adjustment of frame
    /// advantage estimates.
    ///
    /// # Errors
    /// [`RetraceError::InvalidRequest`] for a zero rate.
    pub fn with_fps(mut self, fps: usize) -> RetraceResult<Self> {
        if fps == 0 {
            return Err(RetraceError::InvalidRequest {
                info: "fps must be nonzero".to_owned(),
            });
        }
        self.fps = fps;
        Ok(self)
    }

    /// Upper bound on frames simulated past the last confirmed frame.
    #[must_use]
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.max_prediction = window;
        self
    }

    /// Time without traffic after which a peer is dropped.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Time without traffic after which
    /// [`ConnectionInterrupted`](crate::SessionEvent::ConnectionInterrupted)
    /// fires.
    #[must_use]
    pub fn with_disconnect_notify_delay(mut self, delay: Duration) -> Self {
        self.disconnect_notify_start = delay;
        self
    }

    /// Minimum spacing between input messages to one peer.
    #[must_use]
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    /// Per-player bound on buffered inputs.
    #[must_use]
    pub fn with_input_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Enables or disables checksum exchange between peers.
    #[must_use]
    pub fn with_desync_detection_mode(mut self, mode: DesyncDetection) -> Self {
        self.desync_detection = mode;
        self
    }

    /// How many times a [`SyncTestSession`] re-simulates each frame.
    #[must_use]
    pub fn with_check_rounds(mut self, rounds: usize) -> Self {
        self.check_rounds = rounds;
        self
    }

    /// Consumes the builder into a [`P2PSession`] over `socket`.
    ///
    /// # Errors
    /// [`RetraceError::InvalidRequest`] when the configuration is
    /// incomplete or inconsistent.
    pub fn start_p2p_session(
        self,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> RetraceResult<P2PSession<T>> {
        if self.num_players == 0 {
            return Err(RetraceError::InvalidRequest {
                info: "a session needs at least one player".to_owned(),
            });
        }
        if self.max_prediction == 0 {
            return Err(RetraceError::InvalidRequest {
                info: "the prediction window must be at least 1".to_owned(),
            });
        }
        if self.handles.len() != self.num_players {
            return Err(RetraceError::InvalidRequest {
                info: format!(
                    "{} players registered but the session was declared for {}",
                    self.handles.len(),
                    self.num_players
                ),
            });
        }
        if !self
            .handles
            .values()
            .any(|player| matches!(player, PlayerType::Local))
        {
            return Err(RetraceError::InvalidRequest {
                info: "a p2p session needs at least one local player".to_owned(),
            });
        }
        if self.disconnect_notify_start >= self.disconnect_timeout {
            return Err(RetraceError::InvalidRequest {
                info: "the interruption notice must precede the disconnect timeout".to_owned(),
            });
        }
        if self.queue_capacity <= self.max_prediction {
            return Err(RetraceError::InvalidRequest {
                info: "the input queue must outsize the prediction window".to_owned(),
            });
        }

        let options = EndpointOptions {
            disconnect_timeout: self.disconnect_timeout,
            disconnect_notify_start: self.disconnect_notify_start,
            send_interval: self.send_interval,
            fps: self.fps,
            max_prediction: self.max_prediction,
            desync_detection: self.desync_detection,
        };
        let registry = PlayerRegistry::new(self.handles, options)?;
        Ok(P2PSession::new(
            self.num_players,
            self.max_prediction,
            self.queue_capacity,
            Box::new(socket),
            registry,
            self.desync_detection,
        ))
    }

    /// Consumes the builder into a [`SyncTestSession`], where every player
    /// is local and each frame is re-simulated `check_rounds` times.
    ///
    /// # Errors
    /// [`RetraceError::InvalidRequest`] for an impossible configuration.
    pub fn start_sync_test_session(self) -> RetraceResult<SyncTestSession<T>> {
        if self.num_players == 0 {
            return Err(RetraceError::InvalidRequest {
                info: "a session needs at least one player".to_owned(),
            });
        }
        if self.max_prediction == 0 {
            return Err(RetraceError::InvalidRequest {
                info: "the prediction window must be at least 1".to_owned(),
            });
        }
        Ok(SyncTestSession::new(
            self.num_players,
            self.max_prediction,
            self.queue_capacity,
            self.check_rounds,
        ))
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::Message;
    use std::net::SocketAddr;

    struct TestConfig;

    impl SessionConfig for TestConfig {
        type Input = u8;
        type State = ();
        type Address = SocketAddr;
    }

    struct NullSocket;

    impl NonBlockingSocket<SocketAddr> for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &SocketAddr) {}
        fn receive_all(&mut self) -> Vec<(SocketAddr, Message)> {
            Vec::new()
        }
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:7001".parse().unwrap()
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .add_player(PlayerType::Remote(remote()), PlayerHandle::new(0));
        assert!(matches!(result, Err(RetraceError::InvalidRequest { .. })));
    }

    #[test]
    fn out_of_range_handles_are_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_num_players(2)
            .add_player(PlayerType::Local, PlayerHandle::new(2));
        assert!(matches!(result, Err(RetraceError::InvalidHandle { .. })));
    }

    #[test]
    fn missing_players_fail_at_start() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_num_players(2)
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .start_p2p_session(NullSocket);
        assert!(result.is_err());
    }

    #[test]
    fn all_remote_sessions_are_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_num_players(1)
            .add_player(PlayerType::Remote(remote()), PlayerHandle::new(0))
            .unwrap()
            .start_p2p_session(NullSocket);
        assert!(result.is_err());
    }

    #[test]
    fn zero_fps_is_rejected() {
        assert!(SessionBuilder::<TestConfig>::new().with_fps(0).is_err());
    }

    #[test]
    fn notify_must_precede_timeout() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_num_players(1)
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .with_disconnect_timeout(Duration::from_millis(100))
            .with_disconnect_notify_delay(Duration::from_millis(200))
            .start_p2p_session(NullSocket);
        assert!(result.is_err());
    }

    #[test]
    fn queue_capacity_must_cover_the_window() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_num_players(1)
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .with_max_prediction_window(16)
            .with_input_queue_capacity(16)
            .start_p2p_session(NullSocket);
        assert!(result.is_err());
    }

    #[test]
    fn sync_test_needs_no_player_registration() {
        let session = SessionBuilder::<TestConfig>::new()
            .with_num_players(2)
            .with_check_rounds(3)
            .start_sync_test_session()
            .unwrap();
        assert_eq!(session.check_rounds(), 3);
        assert_eq!(session.num_players(), 2);
    }
}
