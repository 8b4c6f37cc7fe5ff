use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::frame_info::Snapshot;
use crate::input_queue::InputQueue;
use crate::network::messages::ConnectionStatus;
use crate::{
    Frame, InputStatus, PlayerHandle, RetraceError, RetraceResult, SessionConfig, SessionRequest,
};

/// Extra snapshot slots beyond the prediction window, so the oldest
/// in-window frame is never aliased by an incoming save.
const SAVE_WINDOW_SLACK: usize = 2;

/// A shared slot holding one saved simulation state.
///
/// Cells are handed to the user inside [`SessionRequest::SaveState`] and
/// [`SessionRequest::LoadState`]; the engine keeps the same cells and reuses
/// them as their frames age out of the save window.
pub struct StateCell<S>(Arc<Mutex<Snapshot<S>>>);

impl<S> StateCell<S> {
    /// Stores `data` as the state for `frame`, with an optional checksum
    /// for desync detection.
    ///
    /// # Panics
    /// Panics when saving at [`Frame::NULL`]; a save request always names a
    /// real frame.
    pub fn save(&self, frame: Frame, data: Option<S>, checksum: Option<u64>) {
        assert!(!frame.is_null(), "cannot save at the null frame");
        let mut snapshot = self.0.lock();
        snapshot.frame = frame;
        snapshot.data = data;
        snapshot.checksum = checksum;
    }

    /// The frame this cell currently holds, [`Frame::NULL`] if never saved.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.0.lock().frame
    }

    /// The checksum stored with the state, if any.
    #[must_use]
    pub fn checksum(&self) -> Option<u64> {
        self.0.lock().checksum
    }
}

impl<S: Clone> StateCell<S> {
    /// Returns a clone of the stored state, if one was saved.
    #[must_use]
    pub fn load(&self) -> Option<S> {
        self.0.lock().data.clone()
    }
}

impl<S> Default for StateCell<S> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Snapshot::default())))
    }
}

impl<S> Clone for StateCell<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S> std::fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.0.lock();
        f.debug_struct("StateCell")
            .field("frame", &snapshot.frame)
            .field("checksum", &snapshot.checksum)
            .finish_non_exhaustive()
    }
}

/// The frame-indexed ring of snapshot cells forming the save window.
pub(crate) struct SnapshotStore<S> {
    cells: Vec<StateCell<S>>,
}

impl<S> SnapshotStore<S> {
    pub(crate) fn new(max_prediction: usize) -> Self {
        let capacity = max_prediction + SAVE_WINDOW_SLACK;
        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(StateCell::default());
        }
        Self { cells }
    }

    /// The (reusable) cell where `frame` is saved. `None` for invalid frames.
    pub(crate) fn cell_for(&self, frame: Frame) -> Option<StateCell<S>> {
        frame
            .slot(self.cells.len())
            .map(|slot| self.cells[slot].clone())
    }

    /// The cell holding exactly `frame`, failing when the slot has aged out.
    pub(crate) fn get(&self, frame: Frame) -> RetraceResult<StateCell<S>> {
        let cell = self.cell_for(frame).ok_or(RetraceError::StaleFrame {
            requested: frame,
            stored: Frame::NULL,
        })?;
        let stored = cell.frame();
        if stored == frame {
            Ok(cell)
        } else {
            Err(RetraceError::StaleFrame {
                requested: frame,
                stored,
            })
        }
    }
}

/// Owns the simulated-frame counter, the snapshot window and every player's
/// input queue; produces the save/load/advance requests the sessions hand
/// to the user.
pub(crate) struct RollbackEngine<T>
where
    T: SessionConfig,
{
    num_players: usize,
    max_prediction: usize,
    snapshots: SnapshotStore<T::State>,
    queues: Vec<InputQueue<T>>,
    current_frame: Frame,
    last_confirmed: Frame,
}

impl<T: SessionConfig> RollbackEngine<T> {
    pub(crate) fn new(num_players: usize, max_prediction: usize, queue_capacity: usize) -> Self {
        let queues = (0..num_players)
            .map(|_| InputQueue::new(queue_capacity))
            .collect();
        Self {
            num_players,
            max_prediction,
            snapshots: SnapshotStore::new(max_prediction),
            queues,
            current_frame: Frame::FIRST,
            last_confirmed: Frame::NULL,
        }
    }

    pub(crate) fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed
    }

    pub(crate) fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    /// A request to save the current frame into its window cell.
    pub(crate) fn save_request(&mut self) -> RetraceResult<SessionRequest<T>> {
        let cell = self.snapshots.cell_for(self.current_frame).ok_or_else(|| {
            RetraceError::InternalInconsistency {
                context: format!("no snapshot cell for current frame {}", self.current_frame),
            }
        })?;
        Ok(SessionRequest::SaveState {
            cell,
            frame: self.current_frame,
        })
    }

    /// A request to rewind the simulation to `frame`. Resets the current
    /// frame on success.
    ///
    /// # Errors
    /// - [`RetraceError::InvalidFrame`] when `frame` is not a past frame
    ///   inside the save window.
    /// - [`RetraceError::MissingSnapshot`] when nothing was saved at
    ///   `frame` — fatal, the session cannot recover.
    pub(crate) fn load_request(&mut self, frame: Frame) -> RetraceResult<SessionRequest<T>> {
        if frame.is_null() {
            return Err(RetraceError::InvalidFrame {
                frame,
                reason: "cannot load the null frame",
            });
        }
        if frame >= self.current_frame {
            return Err(RetraceError::InvalidFrame {
                frame,
                reason: "rollback target must be in the past",
            });
        }
        if frame.as_i32() < self.current_frame.as_i32() - self.max_prediction as i32 {
            return Err(RetraceError::InvalidFrame {
                frame,
                reason: "rollback target is outside the save window",
            });
        }

        let cell = self
            .snapshots
            .get(frame)
            .map_err(|_| RetraceError::MissingSnapshot { frame })?;
        trace!(
            from = self.current_frame.as_i32(),
            to = frame.as_i32(),
            "rewinding"
        );
        self.current_frame = frame;
        Ok(SessionRequest::LoadState { cell, frame })
    }

    /// Like [`load_request`](Self::load_request), but for rewinding to a
    /// frame whose save request sits earlier in the same batch: the cell
    /// will only be filled once the user works through the requests, so
    /// its stored frame cannot be checked here.
    pub(crate) fn replay_request(&mut self, frame: Frame) -> RetraceResult<SessionRequest<T>> {
        if !frame.is_valid() || frame >= self.current_frame {
            return Err(RetraceError::InvalidFrame {
                frame,
                reason: "replay target must be a past frame",
            });
        }
        let cell = self
            .snapshots
            .cell_for(frame)
            .ok_or(RetraceError::MissingSnapshot { frame })?;
        self.current_frame = frame;
        Ok(SessionRequest::LoadState { cell, frame })
    }

    /// The saved cell for `frame`, if it is still inside the window.
    pub(crate) fn snapshot_by_frame(&self, frame: Frame) -> Option<StateCell<T::State>> {
        self.snapshots.get(frame).ok()
    }

    pub(crate) fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        frame: Frame,
        input: T::Input,
    ) -> RetraceResult<()> {
        self.queue_mut(handle)?.add_input(frame, input)
    }

    pub(crate) fn confirm_remote_input(
        &mut self,
        handle: PlayerHandle,
        frame: Frame,
        input: T::Input,
    ) -> RetraceResult<()> {
        self.queue_mut(handle)?.confirm_input(frame, input)
    }

    /// Assembles one input per player for the current frame, predicting
    /// where no authoritative input exists.
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> RetraceResult<Vec<(T::Input, InputStatus)>> {
        let current = self.current_frame;
        let mut inputs = Vec::with_capacity(self.num_players);
        for (queue, status) in self.queues.iter_mut().zip(connect_status) {
            if status.disconnected && status.last_frame < current {
                inputs.push((T::Input::default(), InputStatus::Disconnected));
            } else {
                inputs.push(queue.input(current)?);
            }
        }
        Ok(inputs)
    }

    /// The earliest frame any queue knows to be mispredicted, merged with
    /// `floor` (used for disconnect-triggered rewinds). NULL when clean.
    pub(crate) fn first_incorrect_frame(&self, floor: Frame) -> Frame {
        let mut first = floor;
        for queue in &self.queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first.is_null() || incorrect < first) {
                first = incorrect;
            }
        }
        first
    }

    pub(crate) fn reset_predictions(&mut self) {
        for queue in &mut self.queues {
            queue.reset_prediction();
        }
    }

    /// Raises the authoritative frame and discards input history every peer
    /// has acknowledged.
    pub(crate) fn set_last_confirmed_frame(&mut self, mut frame: Frame) {
        // never confirm past what is actually simulated, nor past a pending
        // misprediction whose inputs the rollback still needs
        frame = std::cmp::min(frame, self.current_frame);
        let first_incorrect = self.first_incorrect_frame(Frame::NULL);
        if !first_incorrect.is_null() {
            frame = std::cmp::min(frame, first_incorrect);
        }

        self.last_confirmed = frame;
        if frame > Frame::FIRST {
            for queue in &mut self.queues {
                queue.discard_confirmed_before(frame);
            }
        }
    }

    pub(crate) fn set_disconnect_frame(
        &mut self,
        handle: PlayerHandle,
        frame: Frame,
    ) -> RetraceResult<()> {
        self.queue_mut(handle)?.set_disconnect_frame(frame);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn disconnect_frame(&self, handle: PlayerHandle) -> Frame {
        self.queues
            .get(handle.as_usize())
            .map_or(Frame::NULL, |queue| queue.disconnect_frame())
    }

    fn queue_mut(&mut self, handle: PlayerHandle) -> RetraceResult<&mut InputQueue<T>> {
        let num_players = self.num_players;
        self.queues
            .get_mut(handle.as_usize())
            .ok_or(RetraceError::InvalidHandle {
                handle,
                num_players,
            })
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod state_cell_tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let cell = StateCell::<u32>::default();
        assert!(cell.load().is_none());
        cell.save(Frame::new(3), Some(77), Some(0xabc));
        assert_eq!(cell.frame(), Frame::new(3));
        assert_eq!(cell.load(), Some(77));
        assert_eq!(cell.checksum(), Some(0xabc));
    }

    #[test]
    fn clones_share_storage() {
        let a = StateCell::<u8>::default();
        let b = a.clone();
        a.save(Frame::FIRST, Some(1), None);
        assert_eq!(b.load(), Some(1));
    }

    #[test]
    #[should_panic(expected = "null frame")]
    fn saving_null_frame_panics() {
        StateCell::<u8>::default().save(Frame::NULL, None, None);
    }
}
