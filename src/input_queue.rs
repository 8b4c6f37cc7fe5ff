use std::cmp;

use tracing::trace;

use crate::frame_info::InputEntry;
use crate::ring::FrameRing;
use crate::{Frame, InputStatus, RetraceError, RetraceResult, SessionConfig};

/// Default number of inputs a queue can hold per player.
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// An append-mostly, frame-contiguous input log for a single player.
///
/// Entries cover the frames `[tail, head)` with no gaps. Requesting a frame
/// at or past `head` extends the log with predictions (repeat the most
/// recent known input); confirming a frame replaces its prediction with the
/// authoritative input and records the first frame whose prediction turned
/// out wrong, which is what ultimately triggers a rollback.
///
/// Entries at or before `last_confirmed` are authoritative and may be
/// discarded once every peer has acknowledged them.
#[derive(Debug, Clone)]
pub(crate) struct InputQueue<T>
where
    T: SessionConfig,
{
    ring: FrameRing<InputEntry<T::Input>>,
    /// Oldest retained frame.
    tail: Frame,
    /// Next frame to be filled; the queue covers `[tail, head)`.
    head: Frame,
    /// Latest frame whose entries up to and including it are all confirmed.
    last_confirmed: Frame,
    /// Earliest frame whose prediction was contradicted, or NULL.
    first_incorrect: Frame,
    /// Frames at or after this yield blank `Disconnected` entries.
    disconnect_frame: Frame,
}

impl<T: SessionConfig> InputQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ring: FrameRing::new(capacity),
            tail: Frame::FIRST,
            head: Frame::FIRST,
            last_confirmed: Frame::NULL,
            first_incorrect: Frame::NULL,
            disconnect_frame: Frame::NULL,
        }
    }

    pub(crate) fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    #[cfg(test)]
    pub(crate) fn head(&self) -> Frame {
        self.head
    }

    #[cfg(test)]
    pub(crate) fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed
    }

    pub(crate) fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect
    }

    /// Clears the misprediction marker after a rollback handled it.
    pub(crate) fn reset_prediction(&mut self) {
        self.first_incorrect = Frame::NULL;
    }

    /// All requests at or after `frame` will yield `Disconnected` entries.
    pub(crate) fn set_disconnect_frame(&mut self, frame: Frame) {
        self.disconnect_frame = frame;
    }

    #[cfg(test)]
    pub(crate) fn disconnect_frame(&self) -> Frame {
        self.disconnect_frame
    }

    /// Appends the authoritative input for `frame` at the head.
    ///
    /// # Errors
    /// - [`RetraceError::OutOfOrder`] if `frame` is before the head.
    /// - [`RetraceError::FrameSkipped`] if `frame` would leave a gap.
    /// - [`RetraceError::QueueFull`] if the queue is at capacity.
    pub(crate) fn add_input(&mut self, frame: Frame, input: T::Input) -> RetraceResult<()> {
        if frame < self.head {
            return Err(RetraceError::OutOfOrder {
                frame,
                head: self.head,
            });
        }
        if frame > self.head {
            return Err(RetraceError::FrameSkipped {
                frame,
                head: self.head,
            });
        }
        if self.len() == self.ring.capacity() {
            return Err(RetraceError::QueueFull {
                frame,
                capacity: self.ring.capacity(),
            });
        }

        let entry = if self.is_disconnected_at(frame) {
            InputEntry::blank(frame, InputStatus::Disconnected)
        } else {
            InputEntry::new(frame, input, InputStatus::Confirmed)
        };
        self.ring.store(frame, entry);
        self.head = frame + 1;
        self.advance_confirmed(frame);
        // every live frame occupies a ring slot
        debug_assert!(self.ring.contains(frame));
        debug_assert!(self.ring.len() >= self.len());
        Ok(())
    }

    /// Returns the input for `frame`, extending the log with predictions if
    /// the frame has not been filled yet.
    ///
    /// # Errors
    /// - [`RetraceError::QueueFull`] if extending past `frame` would exceed
    ///   the capacity.
    /// - [`RetraceError::InvalidFrame`] if `frame` was already discarded.
    pub(crate) fn input(&mut self, frame: Frame) -> RetraceResult<(T::Input, InputStatus)> {
        if self.is_disconnected_at(frame) {
            return Ok((T::Input::default(), InputStatus::Disconnected));
        }
        if frame < self.tail {
            return Err(RetraceError::InvalidFrame {
                frame,
                reason: "requested input was already discarded",
            });
        }

        while self.head <= frame {
            if self.len() == self.ring.capacity() {
                return Err(RetraceError::QueueFull {
                    frame,
                    capacity: self.ring.capacity(),
                });
            }
            let prediction = self.prediction_basis();
            self.ring.store(
                self.head,
                InputEntry::new(self.head, prediction, InputStatus::Predicted),
            );
            self.head += 1;
        }

        let entry = self.ring.get(frame)?;
        Ok((entry.input, entry.status))
    }

    /// Replaces the prediction for `frame` with the authoritative input.
    ///
    /// Frames at or before `last_confirmed` are duplicates from
    /// retransmission and are silently discarded. A mismatching prediction
    /// records `first_incorrect` and drops every prediction at or after
    /// `frame` — they were derived from the wrong input and will be rebuilt
    /// during the rollback.
    ///
    /// # Errors
    /// [`RetraceError::FrameSkipped`] if `frame` is past the head; remote
    /// inputs must be fed contiguously.
    pub(crate) fn confirm_input(&mut self, frame: Frame, input: T::Input) -> RetraceResult<()> {
        if frame <= self.last_confirmed || frame < self.tail {
            return Ok(());
        }
        if frame > self.head {
            return Err(RetraceError::FrameSkipped {
                frame,
                head: self.head,
            });
        }
        if frame == self.head {
            return self.add_input(frame, input);
        }

        let entry = self.ring.get(frame)?;
        match entry.status {
            InputStatus::Predicted => {
                if entry.input == input {
                    self.ring.get_mut(frame)?.status = InputStatus::Confirmed;
                    self.advance_confirmed(frame);
                    Ok(())
                } else {
                    trace!(frame = frame.as_i32(), "prediction contradicted");
                    self.first_incorrect = if self.first_incorrect.is_null() {
                        frame
                    } else {
                        cmp::min(self.first_incorrect, frame)
                    };
                    // later predictions were derived from the wrong input
                    self.head = frame;
                    self.add_input(frame, input)
                }
            }
            // duplicate delivery, or input for a frame past the disconnect
            InputStatus::Confirmed | InputStatus::Disconnected => Ok(()),
        }
    }

    /// Drops confirmed entries strictly before `frame`, always retaining
    /// the newest entry as the prediction basis.
    pub(crate) fn discard_confirmed_before(&mut self, frame: Frame) {
        if self.head == self.tail {
            return;
        }
        let confirmed_bound = self.last_confirmed + 1;
        let cutoff = cmp::min(cmp::min(frame, confirmed_bound), self.head - 1);
        if cutoff > self.tail {
            self.tail = cutoff;
        }
    }

    fn advance_confirmed(&mut self, frame: Frame) {
        if self.last_confirmed + 1 == frame {
            self.last_confirmed = frame;
        }
    }

    fn is_disconnected_at(&self, frame: Frame) -> bool {
        !self.disconnect_frame.is_null() && frame >= self.disconnect_frame
    }

    /// The input a prediction repeats: the most recent known entry.
    fn prediction_basis(&self) -> T::Input {
        if self.head == self.tail {
            return T::Input::default();
        }
        match self.ring.get(self.head - 1) {
            Ok(entry) => entry.input,
            Err(_) => T::Input::default(),
        }
    }
}

// #########
// # TESTS #
// #########
