use crate::Frame;

/// How many frames further ahead than a peer the session may run before a
/// wait is recommended.
pub const FRAME_ADVANTAGE_THRESHOLD: i32 = 2;

/// Number of frame-advantage samples kept per peer (half a second at 60 Hz).
const ADVANTAGE_WINDOW: usize = 30;

/// Tracks how far ahead of (or behind) a remote peer this session runs.
///
/// Every transmitted input records one sample of the local frame advantage
/// (our simulated frame minus the peer's estimated frame) and of the
/// advantage the peer last reported for itself. Both series are kept in
/// small sliding windows and compared by **median**, which shrugs off the
/// occasional jittered sample that a mean would smear across the window.
#[derive(Debug)]
pub(crate) struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
}

impl TimeSync {
    pub(crate) fn new() -> Self {
        Self {
            local: vec![0; ADVANTAGE_WINDOW],
            remote: vec![0; ADVANTAGE_WINDOW],
        }
    }

    /// Records one advantage sample pair for `frame`.
    ///
    /// Null frames can show up while a session is still spinning up; they
    /// carry no timing information and are skipped.
    pub(crate) fn record_advantage(&mut self, frame: Frame, local: i32, remote: i32) {
        let Some(slot) = frame.slot(ADVANTAGE_WINDOW) else {
            return;
        };
        self.local[slot] = local;
        self.remote[slot] = remote;
    }

    /// How many frames the local session should sleep so both peers meet in
    /// the middle, or 0 when the gap is within the threshold.
    pub(crate) fn recommended_wait(&self) -> u32 {
        let local = median(&self.local);
        let remote = median(&self.remote);
        if local > remote + FRAME_ADVANTAGE_THRESHOLD {
            // each side closes half the gap
            ((local - remote) / 2).max(1) as u32
        } else {
            0
        }
    }
}

fn median(window: &[i32]) -> i32 {
    let mut sorted = window.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(local: i32, remote: i32) -> TimeSync {
        let mut sync = TimeSync::new();
        for i in 0..ADVANTAGE_WINDOW as i32 {
            sync.record_advantage(Frame::new(i), local, remote);
        }
        sync
    }

    #[test]
    fn balanced_peers_need_no_wait() {
        assert_eq!(filled(0, 0).recommended_wait(), 0);
    }

    #[test]
    fn small_lead_stays_within_threshold() {
        assert_eq!(filled(2, 0).recommended_wait(), 0);
    }

    #[test]
    fn large_lead_recommends_half_the_gap() {
        assert_eq!(filled(4, 0).recommended_wait(), 2);
        assert_eq!(filled(5, -5).recommended_wait(), 5);
    }

    #[test]
    fn being_behind_never_recommends_waiting() {
        assert_eq!(filled(-4, 4).recommended_wait(), 0);
    }

    #[test]
    fn median_ignores_jitter_spikes() {
        let mut sync = filled(1, 0);
        // a couple of wild samples must not trigger a wait
        sync.record_advantage(Frame::new(3), 50, 0);
        sync.record_advantage(Frame::new(9), 40, 0);
        assert_eq!(sync.recommended_wait(), 0);
    }

    #[test]
    fn null_frames_are_skipped() {
        let mut sync = filled(4, 0);
        sync.record_advantage(Frame::NULL, -100, 100);
        assert_eq!(sync.recommended_wait(), 2);
    }

    #[test]
    fn window_slides_with_the_frame_counter() {
        let mut sync = filled(6, 0);
        assert!(sync.recommended_wait() > 0);
        // once the peer catches up, newer samples overwrite the old lead
        for i in ADVANTAGE_WINDOW as i32..(2 * ADVANTAGE_WINDOW as i32) {
            sync.record_advantage(Frame::new(i), 0, 0);
        }
        assert_eq!(sync.recommended_wait(), 0);
    }
}
