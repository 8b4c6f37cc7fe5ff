use crate::{Frame, InputStatus};

/// A snapshot of the user's simulation for one frame, plus an optional
/// checksum for desync detection.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot<S> {
    /// The frame this snapshot belongs to.
    pub frame: Frame,
    /// The serialized-or-cloned simulation state, if one was saved.
    pub data: Option<S>,
    /// Checksum over the state, if the user provided one.
    pub checksum: Option<u64>,
}

impl<S> Default for Snapshot<S> {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            data: None,
            checksum: None,
        }
    }
}

/// One player's input for one frame, with its confirmation status.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct InputEntry<I>
where
    I: Copy + Clone + PartialEq,
{
    pub frame: Frame,
    pub input: I,
    pub status: InputStatus,
}

impl<I: Copy + Clone + PartialEq + Default> InputEntry<I> {
    pub(crate) fn new(frame: Frame, input: I, status: InputStatus) -> Self {
        Self {
            frame,
            input,
            status,
        }
    }

    /// A blank entry: the canonical "no input" value.
    pub(crate) fn blank(frame: Frame, status: InputStatus) -> Self {
        Self {
            frame,
            input: I::default(),
            status,
        }
    }
}

// #########
// # TESTS #
// #########
