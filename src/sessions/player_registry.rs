use std::collections::BTreeMap;

use crate::network::protocol::{EndpointOptions, PeerEndpoint};
use crate::{PlayerHandle, PlayerType, RetraceResult, SessionConfig};

/// Who participates in a session and, for every distinct remote address,
/// the endpoint that speaks to it. One remote device may host several
/// players; they share an endpoint.
pub(crate) struct PlayerRegistry<T>
where
    T: SessionConfig,
{
    pub(crate) handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    pub(crate) remotes: BTreeMap<T::Address, PeerEndpoint<T>>,
}

impl<T: SessionConfig> PlayerRegistry<T> {
    /// Builds the registry and one endpoint per distinct remote address.
    pub(crate) fn new(
        handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
        options: EndpointOptions,
    ) -> RetraceResult<Self> {
        let num_players = handles.len();
        let local_players = handles
            .values()
            .filter(|player| matches!(player, PlayerType::Local))
            .count();

        // group remote handles by address
        let mut by_addr: BTreeMap<T::Address, Vec<PlayerHandle>> = BTreeMap::new();
        for (handle, player) in &handles {
            if let PlayerType::Remote(addr) = player {
                by_addr.entry(addr.clone()).or_default().push(*handle);
            }
        }

        let mut remotes = BTreeMap::new();
        for (addr, peer_handles) in by_addr {
            let endpoint = PeerEndpoint::new(
                peer_handles,
                addr.clone(),
                num_players,
                local_players,
                options,
            )?;
            remotes.insert(addr, endpoint);
        }

        Ok(Self { handles, remotes })
    }

    pub(crate) fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter(|(_, player)| matches!(player, PlayerType::Local))
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub(crate) fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter(|(_, player)| matches!(player, PlayerType::Remote(_)))
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub(crate) fn address_of(&self, handle: PlayerHandle) -> Option<&T::Address> {
        match self.handles.get(&handle) {
            Some(PlayerType::Remote(addr)) => Some(addr),
            _ => None,
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DesyncDetection;
    use instant::Duration;
    use std::net::SocketAddr;

    struct TestConfig;

    impl SessionConfig for TestConfig {
        type Input = u8;
        type State = ();
        type Address = SocketAddr;
    }

    fn options() -> EndpointOptions {
        EndpointOptions {
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(750),
            send_interval: Duration::from_millis(16),
            fps: 60,
            max_prediction: 8,
            desync_detection: DesyncDetection::Off,
        }
    }

    #[test]
    fn remote_players_on_one_device_share_an_endpoint() {
        let addr: SocketAddr = "10.0.0.2:7000".parse().unwrap();
        let mut handles = BTreeMap::new();
        handles.insert(PlayerHandle::new(0), PlayerType::<SocketAddr>::Local);
        handles.insert(PlayerHandle::new(1), PlayerType::Remote(addr));
        handles.insert(PlayerHandle::new(2), PlayerType::Remote(addr));

        let registry = PlayerRegistry::<TestConfig>::new(handles, options()).unwrap();
        assert_eq!(registry.handles.len(), 3);
        assert_eq!(registry.remotes.len(), 1);
        assert_eq!(
            registry.remotes.get(&addr).unwrap().handles(),
            &[PlayerHandle::new(1), PlayerHandle::new(2)]
        );
    }

    #[test]
    fn handle_queries() {
        let addr: SocketAddr = "10.0.0.2:7000".parse().unwrap();
        let mut handles = BTreeMap::new();
        handles.insert(PlayerHandle::new(0), PlayerType::<SocketAddr>::Local);
        handles.insert(PlayerHandle::new(1), PlayerType::Remote(addr));

        let registry = PlayerRegistry::<TestConfig>::new(handles, options()).unwrap();
        assert_eq!(registry.local_player_handles(), vec![PlayerHandle::new(0)]);
        assert_eq!(registry.remote_player_handles(), vec![PlayerHandle::new(1)]);
        assert_eq!(registry.address_of(PlayerHandle::new(1)), Some(&addr));
        assert_eq!(registry.address_of(PlayerHandle::new(0)), None);
    }
}
