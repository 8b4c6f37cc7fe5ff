/// A point-in-time picture of the connection quality to one remote peer,
/// obtained from `P2PSession::network_stats()`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct NetworkStats {
    /// Most recent round-trip time in milliseconds.
    pub ping_ms: u64,
    /// Local inputs sent but not yet acknowledged by the peer.
    pub pending_inputs: usize,
    /// Approximate outbound bandwidth in kilobytes per second.
    pub kbps_sent: usize,
    /// Latest estimate of our frame advantage over the peer (positive: we
    /// run ahead).
    pub local_frame_advantage: i32,
    /// The advantage the peer last reported for itself.
    pub remote_frame_advantage: i32,
}
