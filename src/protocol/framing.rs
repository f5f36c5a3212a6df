// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Byte-exact encoders for the two frame formats spoken by the fixtures.
//!
//! The addressed frame is used on the shared bus:
//!
//! ```text
//! [addr_lo, addr_hi, len, payload..., 0xFF]
//! ```
//!
//! The stuffed frame is used on point-to-point strips:
//!
//! ```text
//! [len, checksum, flags, addr, payload (>= 8 bytes)...]
//! ```
//!
//! which is then zero-run encoded by [`zero_stuff`].

/// Terminates an addressed frame.
pub const FRAME_END: u8 = 0xFF;

/// Stuffed payloads are padded with zeros up to this length.
pub const MIN_STUFFED_PAYLOAD: usize = 8;

/// Largest payload a stuffed frame can carry. Runs between zeros are counted
/// in a single byte, so the whole frame has to stay under 255 bytes.
pub const MAX_STUFFED_PAYLOAD: usize = 250;

/// Largest payload the addressed frame's length byte can describe.
pub const MAX_ADDRESSED_PAYLOAD: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the addressed frame limit of {max}")]
    AddressedTooLong { len: usize, max: usize },
    #[error("payload of {len} bytes exceeds the stuffed frame limit of {max}")]
    StuffedTooLong { len: usize, max: usize },
}

/// Encodes an addressed frame. The payload is sent verbatim.
pub fn addressed(addr: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_ADDRESSED_PAYLOAD {
        return Err(FrameError::AddressedTooLong {
            len: payload.len(),
            max: MAX_ADDRESSED_PAYLOAD,
        });
    }

    let [lo, hi] = addr.to_le_bytes();
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&[lo, hi, payload.len() as u8]);
    frame.extend_from_slice(payload);
    frame.push(FRAME_END);
    Ok(frame)
}

/// Builds the unencoded stuffed frame: length, checksum, flags, address and
/// the zero padded payload.
pub fn stuffed_frame(flags: u8, addr: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_STUFFED_PAYLOAD {
        return Err(FrameError::StuffedTooLong {
            len: payload.len(),
            max: MAX_STUFFED_PAYLOAD,
        });
    }

    let mut inner = Vec::with_capacity(payload.len().max(MIN_STUFFED_PAYLOAD) + 2);
    inner.push(flags);
    inner.push(addr);
    inner.extend_from_slice(payload);
    inner.resize(payload.len().max(MIN_STUFFED_PAYLOAD) + 2, 0);

    let checksum = inner.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));

    let mut frame = Vec::with_capacity(inner.len() + 2);
    frame.push(payload.len() as u8);
    frame.push(checksum);
    frame.extend(inner);
    Ok(frame)
}

/// Encodes a stuffed frame ready for the wire.
pub fn stuffed(flags: u8, addr: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    Ok(zero_stuff(&stuffed_frame(flags, addr, payload)?))
}

/// Replaces every zero in `frame` with a run length and prefixes the result
/// with a `0x00` delimiter and the leading run length.
///
/// The frame is walked back to front. Each zero becomes the number of bytes
/// from it (inclusive) up to the previous zero or the end of the frame.
pub fn zero_stuff(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 2);
    let mut run: u8 = 0;
    for byte in frame.iter().rev() {
        run = run.wrapping_add(1);
        if *byte == 0 {
            out.push(run);
            run = 0;
        } else {
            out.push(*byte);
        }
    }
    out.push(run);
    out.push(0x00);
    out.reverse();
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_addressed_frame() {
        assert_eq!(
            addressed(0x0203, &[1, 2, 3]),
            Ok(vec![0x03, 0x02, 3, 1, 2, 3, 0xFF])
        );
    }

    #[test]
    fn test_addressed_frame_is_not_padded() {
        assert_eq!(addressed(0x0010, &[]), Ok(vec![0x10, 0x00, 0, 0xFF]));

        let long = vec![0xAA; 12];
        let frame = addressed(0xFFFF, &long).unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[..3], &[0xFF, 0xFF, 12]);
        assert_eq!(frame[15], FRAME_END);
    }

    #[test]
    fn test_addressed_frame_rejects_oversized_payload() {
        assert!(addressed(1, &[0; 255]).is_ok());
        assert_eq!(
            addressed(1, &[0; 256]),
            Err(FrameError::AddressedTooLong { len: 256, max: 255 })
        );
    }

    #[test]
    fn test_stuffed_frame_layout() {
        let frame = stuffed_frame(0, 0, &[0, 5, 0]).unwrap();
        // [len, checksum, flags, addr, payload padded to 8]
        assert_eq!(frame, vec![3, 5, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_stuffed_frame_reference_encoding() {
        // Worked by hand: walking [3,5,0,0,0,5,0,0,0,0,0,0] backwards the six
        // trailing zeros each close a run of 1, the zero after the second 5
        // closes a run of 2, the next two close runs of 1, and 5 and 3 are
        // left with a run of 2 that becomes the leading length.
        assert_eq!(
            stuffed(0, 0, &[0, 5, 0]).unwrap(),
            vec![0x00, 0x02, 0x03, 0x05, 0x01, 0x01, 0x02, 0x05, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01]
        );
    }

    #[test]
    fn test_stuffed_checksum_wraps() {
        let frame = stuffed_frame(0x80, 0x90, &[0x70, 0x01]).unwrap();
        // 0x80 + 0x90 + 0x70 + 0x01 = 0x181
        assert_eq!(frame[1], 0x81);
        assert_eq!(frame[0], 2);
    }

    #[test]
    fn test_stuffed_frame_keeps_long_payload() {
        let payload: Vec<u8> = (1..=12).collect();
        let frame = stuffed_frame(1, 2, &payload).unwrap();
        assert_eq!(frame.len(), 2 + 2 + 12);
        assert_eq!(&frame[4..], payload.as_slice());
    }

    #[test]
    fn test_stuffed_frame_rejects_oversized_payload() {
        assert!(stuffed(0, 0, &[1; MAX_STUFFED_PAYLOAD]).is_ok());
        assert_eq!(
            stuffed(0, 0, &[1; MAX_STUFFED_PAYLOAD + 1]),
            Err(FrameError::StuffedTooLong { len: 251, max: 250 })
        );
    }

    #[test]
    fn test_zero_stuff_leading_zero_leaves_empty_run() {
        // A frame that starts with a zero leaves no bytes for the leading run.
        assert_eq!(
            zero_stuff(&[0, 0, 7, 0, 9, 9, 0]),
            vec![0, 0, 1, 2, 7, 3, 9, 9, 1]
        );
    }

    #[test]
    fn test_zero_stuff_without_zeros() {
        assert_eq!(zero_stuff(&[4, 5, 6]), vec![0, 3, 4, 5, 6]);
        assert_eq!(zero_stuff(&[]), vec![0, 0]);
    }
}
