use std::collections::BTreeMap;

use crate::network::messages::ConnectionStatus;
use crate::rollback::RollbackEngine;
use crate::{
    Frame, PlayerHandle, RetraceError, RetraceResult, SessionConfig, SessionRequest, StateCell,
};

/// A single-process session that stress-tests a simulation's determinism.
///
/// Every tick advances the frame once, then rewinds and re-advances it
/// `check_rounds` more times with identical inputs, saving each result into
/// its own scratch cell. At the start of the next tick all recorded
/// checksums must agree; a mismatch means the simulation is
/// nondeterministic (or its save/load is lossy) and surfaces as a fatal
/// [`RetraceError::Desynchronized`].
///
/// There is no network IO; all players are local.
pub struct SyncTestSession<T>
where
    T: SessionConfig,
{
    num_players: usize,
    check_rounds: usize,
    engine: RollbackEngine<T>,
    /// All players are local, so everyone is trivially "connected at the
    /// current frame".
    dummy_status: Vec<ConnectionStatus>,
    local_inputs: BTreeMap<PlayerHandle, T::Input>,
    /// One cell per simulation of the last advanced frame: index 0 is the
    /// original run, 1..=check_rounds the re-simulations.
    scratch: Vec<StateCell<T::State>>,
    /// The frame the scratch cells describe, compared next tick.
    compare_frame: Frame,
}

impl<T: SessionConfig> SyncTestSession<T> {
    pub(crate) fn new(
        num_players: usize,
        max_prediction: usize,
        queue_capacity: usize,
        check_rounds: usize,
    ) -> Self {
        Self {
            num_players,
            check_rounds,
            engine: RollbackEngine::new(num_players, max_prediction, queue_capacity),
            dummy_status: vec![ConnectionStatus::default(); num_players],
            local_inputs: BTreeMap::new(),
            scratch: (0..=check_rounds).map(|_| StateCell::default()).collect(),
            compare_frame: Frame::NULL,
        }
    }

    /// Registers the input for one player for the upcoming frame. All
    /// players count as local here.
    ///
    /// # Errors
    /// [`RetraceError::InvalidHandle`] for an out-of-range handle.
    pub fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        input: T::Input,
    ) -> RetraceResult<()> {
        if !handle.is_valid_for(self.num_players) {
            return Err(RetraceError::InvalidHandle {
                handle,
                num_players: self.num_players,
            });
        }
        self.local_inputs.insert(handle, input);
        Ok(())
    }

    /// Advances one frame and schedules `check_rounds` re-simulations of
    /// it. Fulfill the returned requests in order, saving a checksum with
    /// every state.
    ///
    /// # Errors
    /// - [`RetraceError::Desynchronized`] when the previous tick's
    ///   re-simulations disagree — fatal, the simulation is not
    ///   deterministic.
    /// - [`RetraceError::MissingInput`] when a player's input was not
    ///   registered.
    pub fn advance_frame(&mut self) -> RetraceResult<Vec<SessionRequest<T>>> {
        self.verify_scratch_checksums()?;

        for idx in 0..self.num_players {
            let handle = PlayerHandle::new(idx);
            if !self.local_inputs.contains_key(&handle) {
                return Err(RetraceError::MissingInput {
                    handle,
                    frame: self.engine.current_frame(),
                });
            }
        }

        let mut requests = Vec::with_capacity(3 + 3 * self.check_rounds);
        let frame = self.engine.current_frame();

        for (&handle, &input) in &self.local_inputs {
            self.engine.add_local_input(handle, frame, input)?;
        }
        self.local_inputs.clear();
        for status in &mut self.dummy_status {
            status.last_frame = frame;
        }

        // the original run: save the pre-advance state, advance, record
        requests.push(self.engine.save_request()?);
        let inputs = self.engine.synchronized_inputs(&self.dummy_status)?;
        self.engine.advance_frame();
        requests.push(SessionRequest::AdvanceFrame {
            frame,
            inputs: inputs.clone(),
        });
        requests.push(SessionRequest::SaveState {
            cell: self.scratch[0].clone(),
            frame: frame + 1,
        });

        // re-simulate from the saved state with the very same inputs
        for round in 1..=self.check_rounds {
            requests.push(self.engine.replay_request(frame)?);
            let replay_inputs = self.engine.synchronized_inputs(&self.dummy_status)?;
            self.engine.advance_frame();
            requests.push(SessionRequest::AdvanceFrame {
                frame,
                inputs: replay_inputs,
            });
            requests.push(SessionRequest::SaveState {
                cell: self.scratch[round].clone(),
                frame: frame + 1,
            });
        }

        self.engine.set_last_confirmed_frame(frame);
        self.compare_frame = frame + 1;
        Ok(requests)
    }

    /// The frame about to be simulated.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.engine.current_frame()
    }

    /// Number of participants.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Re-simulations per frame.
    #[must_use]
    pub fn check_rounds(&self) -> usize {
        self.check_rounds
    }

    /// Compares the checksums recorded for the previously advanced frame.
    /// States saved without checksums are skipped.
    fn verify_scratch_checksums(&self) -> RetraceResult<()> {
        if self.compare_frame.is_null() {
            return Ok(());
        }
        let Some(baseline) = self.scratch[0].checksum() else {
            return Ok(());
        };
        for cell in &self.scratch[1..] {
            let Some(resimulated) = cell.checksum() else {
                continue;
            };
            if resimulated != baseline {
                return Err(RetraceError::Desynchronized {
                    frame: self.compare_frame,
                    local_checksum: baseline,
                    remote_checksum: resimulated,
                });
            }
        }
        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use crate::{InputStatus, SessionBuilder};
    use std::net::SocketAddr;

    struct TestConfig;

    impl SessionConfig for TestConfig {
        type Input = u8;
        type State = u64;
        type Address = SocketAddr;
    }

    fn session(check_rounds: usize) -> SyncTestSession<TestConfig> {
        SessionBuilder::<TestConfig>::new()
            .with_num_players(2)
            .with_check_rounds(check_rounds)
            .start_sync_test_session()
            .unwrap()
    }

    /// A deterministic toy simulation: the state sums all inputs.
    fn run_requests(
        state: &mut u64,
        requests: Vec<SessionRequest<TestConfig>>,
        deterministic: bool,
    ) {
        for request in requests {
            match request {
                SessionRequest::SaveState { cell, frame } => {
                    let checksum = if deterministic {
                        compute_checksum(state).unwrap()
                    } else {
                        // emulate hashing uninitialized memory
                        rand::random::<u64>()
                    };
                    cell.save(frame, Some(*state), Some(checksum));
                }
                SessionRequest::LoadState { cell, .. } => {
                    *state = cell.load().unwrap();
                }
                SessionRequest::AdvanceFrame { inputs, .. } => {
                    for (input, _) in inputs {
                        *state += u64::from(input) + 1;
                    }
                }
            }
        }
    }

    fn tick(
        session: &mut SyncTestSession<TestConfig>,
        state: &mut u64,
        deterministic: bool,
    ) -> RetraceResult<()> {
        session.add_local_input(PlayerHandle::new(0), 1)?;
        session.add_local_input(PlayerHandle::new(1), 2)?;
        let requests = session.advance_frame()?;
        run_requests(state, requests, deterministic);
        Ok(())
    }

    #[test]
    fn deterministic_simulation_passes_many_frames() {
        let mut session = session(2);
        let mut state = 0u64;
        for _ in 0..120 {
            tick(&mut session, &mut state, true).unwrap();
        }
        assert_eq!(session.current_frame(), Frame::new(120));
    }

    #[test]
    fn request_pattern_is_save_advance_then_replays() {
        let mut session = session(1);
        session.add_local_input(PlayerHandle::new(0), 0).unwrap();
        session.add_local_input(PlayerHandle::new(1), 0).unwrap();
        let requests = session.advance_frame().unwrap();

        // save, advance, record, then one (load, advance, record) round
        assert_eq!(requests.len(), 6);
        assert!(matches!(requests[0], SessionRequest::SaveState { frame, .. } if frame == 0));
        assert!(matches!(requests[1], SessionRequest::AdvanceFrame { frame, .. } if frame == 0));
        assert!(matches!(requests[2], SessionRequest::SaveState { frame, .. } if frame == 1));
        assert!(matches!(requests[3], SessionRequest::LoadState { frame, .. } if frame == 0));
        assert!(matches!(requests[4], SessionRequest::AdvanceFrame { frame, .. } if frame == 0));
        assert!(matches!(requests[5], SessionRequest::SaveState { frame, .. } if frame == 1));
    }

    #[test]
    fn advance_inputs_are_all_confirmed() {
        let mut session = session(1);
        session.add_local_input(PlayerHandle::new(0), 3).unwrap();
        session.add_local_input(PlayerHandle::new(1), 4).unwrap();
        let requests = session.advance_frame().unwrap();
        for request in requests {
            if let SessionRequest::AdvanceFrame { inputs, .. } = request {
                assert_eq!(
                    inputs,
                    vec![(3, InputStatus::Confirmed), (4, InputStatus::Confirmed)]
                );
            }
        }
    }

    #[test]
    fn nondeterminism_is_reported_on_the_next_tick() {
        let mut session = session(1);
        let mut state = 0u64;
        tick(&mut session, &mut state, false).unwrap();

        let result = tick(&mut session, &mut state, false);
        assert!(matches!(
            result,
            Err(RetraceError::Desynchronized { frame, .. }) if frame == Frame::new(1)
        ));
    }

    #[test]
    fn missing_inputs_are_rejected() {
        let mut session = session(1);
        session.add_local_input(PlayerHandle::new(0), 0).unwrap();
        assert!(matches!(
            session.advance_frame(),
            Err(RetraceError::MissingInput { .. })
        ));
    }

    #[test]
    fn zero_check_rounds_skips_the_replays() {
        let mut session = session(0);
        let mut state = 0u64;
        for _ in 0..10 {
            tick(&mut session, &mut state, true).unwrap();
        }
        // 1 + 2 inputs per player per frame, 10 frames
        assert_eq!(state, 10 * (2 + 3));
    }
}
