//! Deterministic state checksums for desync detection.
//!
//! Both peers must agree on the checksum algorithm; Retrace itself only ever
//! compares the `u64` values supplied through [`StateCell::save`]. The
//! convenience entry point here is [`compute_checksum`], which hashes the
//! bincode serialization of a state with 64-bit FNV-1a:
//!
//! ```
//! use retrace::checksum::compute_checksum;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct World { tick: u32, x: i16 }
//!
//! let world = World { tick: 120, x: -4 };
//! let checksum = compute_checksum(&world)?;
//! # Ok::<(), retrace::RetraceError>(())
//! ```
//!
//! Floating-point state deserves care: `NaN` payloads and `-0.0` serialize
//! to distinct bit patterns, so two simulations that "look equal" can hash
//! differently. Deterministic simulations should avoid depending on such
//! values in the first place.
//!
//! [`StateCell::save`]: crate::StateCell::save

use std::cell::RefCell;

use serde::Serialize;

use crate::{RetraceError, RetraceResult};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over a byte slice.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

thread_local! {
    // Scratch buffer for the canonical serialization; reused across calls so
    // per-frame checksumming does not allocate.
    static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Serializes `state` with bincode and hashes the bytes with [`fnv1a`].
///
/// # Errors
/// Returns [`RetraceError::SerializationFailed`] if bincode cannot encode
/// the state.
pub fn compute_checksum<S: Serialize>(state: &S) -> RetraceResult<u64> {
    SCRATCH.with(|scratch| {
        let mut buffer = scratch.borrow_mut();
        buffer.clear();
        bincode::serialize_into(&mut *buffer, state).map_err(|_| {
            RetraceError::SerializationFailed {
                context: "encoding state for checksumming",
            }
        })?;
        Ok(fnv1a(&buffer))
    })
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors from the FNV specification.
    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn compute_checksum_is_deterministic() {
        #[derive(Serialize)]
        struct State {
            tick: u32,
            values: Vec<i64>,
        }

        let a = State {
            tick: 7,
            values: vec![1, -2, 3],
        };
        let b = State {
            tick: 7,
            values: vec![1, -2, 3],
        };
        assert_eq!(compute_checksum(&a).unwrap(), compute_checksum(&b).unwrap());
    }

    #[test]
    fn different_states_hash_differently() {
        let a = compute_checksum(&(1u32, 2u32)).unwrap();
        let b = compute_checksum(&(2u32, 1u32)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn scratch_buffer_is_reused_across_calls() {
        // Two calls on the same thread must not interfere.
        let first = compute_checksum(&vec![0u8; 64]).unwrap();
        let _ = compute_checksum(&vec![1u8; 8]).unwrap();
        let again = compute_checksum(&vec![0u8; 64]).unwrap();
        assert_eq!(first, again);
    }
}
