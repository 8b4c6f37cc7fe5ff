//! Input payload compression.
//!
//! Inputs travel as a run of fixed-size blobs, XORed blob-by-blob against a
//! reference (the input just before the run, or the all-zero blob at the
//! start of a session). Consecutive game inputs rarely change, so the delta
//! is mostly zero bytes; a run-length stage on top squeezes those out.

use crate::{RetraceError, RetraceResult};

/// Delta-encodes `inputs` against `reference` and run-length-encodes the
/// result for the wire.
pub fn encode<'a>(reference: &[u8], inputs: impl Iterator<Item = &'a Vec<u8>>) -> Vec<u8> {
    bitfield_rle::encode(delta_encode(reference, inputs))
}

/// The inverse of [`encode`].
///
/// # Errors
/// Fails with [`RetraceError::MalformedDelta`] when the payload is corrupt
/// or does not divide into blobs of the reference length.
pub fn decode(reference: &[u8], data: &[u8]) -> RetraceResult<Vec<Vec<u8>>> {
    let delta = bitfield_rle::decode(data).map_err(|_| RetraceError::MalformedDelta {
        length: data.len(),
        reference_length: reference.len(),
    })?;
    delta_decode(reference, &delta)
}

/// XORs each input blob against the reference blob.
///
/// # Panics
/// All blobs must have the (nonzero) reference length; a mismatch is a bug
/// in the caller.
pub fn delta_encode<'a>(
    reference: &[u8],
    inputs: impl Iterator<Item = &'a Vec<u8>>,
) -> Vec<u8> {
    assert!(!reference.is_empty(), "reference blob must be nonempty");
    let (lower, upper) = inputs.size_hint();
    let mut out = Vec::with_capacity(upper.unwrap_or(lower) * reference.len());

    for input in inputs {
        assert_eq!(
            input.len(),
            reference.len(),
            "input blob length must match the reference"
        );
        out.extend(reference.iter().zip(input).map(|(r, i)| r ^ i));
    }
    out
}

/// The exact inverse of [`delta_encode`].
///
/// # Errors
/// Fails with [`RetraceError::MalformedDelta`] when `data` is not a whole
/// number of reference-sized blobs.
pub fn delta_decode(reference: &[u8], data: &[u8]) -> RetraceResult<Vec<Vec<u8>>> {
    if reference.is_empty() || data.len() % reference.len() != 0 {
        return Err(RetraceError::MalformedDelta {
            length: data.len(),
            reference_length: reference.len(),
        });
    }

    Ok(data
        .chunks_exact(reference.len())
        .map(|chunk| reference.iter().zip(chunk).map(|(r, d)| r ^ d).collect())
        .collect())
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let reference = vec![0, 0, 0, 1];
        let inputs = vec![
            vec![0, 0, 1, 0],
            vec![0, 0, 1, 1],
            vec![0, 1, 0, 0],
            vec![0, 1, 0, 1],
        ];
        let encoded = encode(&reference, inputs.iter());
        assert_eq!(decode(&reference, &encoded).unwrap(), inputs);
    }

    #[test]
    fn empty_run_roundtrips() {
        let reference = vec![0u8; 4];
        let inputs: Vec<Vec<u8>> = Vec::new();
        let encoded = encode(&reference, inputs.iter());
        assert!(decode(&reference, &encoded).unwrap().is_empty());
    }

    #[test]
    fn identical_inputs_delta_to_zero() {
        let reference = vec![0xFF, 0xAA, 0x55];
        let inputs = [reference.clone(), reference.clone()];
        let delta = delta_encode(&reference, inputs.iter());
        assert!(delta.iter().all(|&b| b == 0));
    }

    #[test]
    fn repeated_inputs_compress_well() {
        let reference = vec![7u8; 16];
        let inputs: Vec<Vec<u8>> = (0..32).map(|_| reference.clone()).collect();
        let encoded = encode(&reference, inputs.iter());
        assert!(encoded.len() < 16 * 32 / 4);
    }

    #[test]
    fn ragged_delta_is_rejected() {
        let reference = vec![0u8; 4];
        assert!(matches!(
            delta_decode(&reference, &[1, 2, 3]),
            Err(RetraceError::MalformedDelta { .. })
        ));
    }

    #[test]
    fn decoding_with_the_wrong_reference_length_is_rejected() {
        let reference = vec![0u8; 4];
        let encoded = encode(&reference, [vec![1u8, 2, 3, 4]].iter());
        assert!(matches!(
            decode(&[0u8; 3], &encoded),
            Err(RetraceError::MalformedDelta { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "length must match")]
    fn mismatched_blob_length_is_a_contract_violation() {
        let reference = vec![0u8; 4];
        let inputs = vec![vec![0u8; 3]];
        let _ = delta_encode(&reference, inputs.iter());
    }
}
