//! Packet codec for the Honda K-Line protocol
//!
//! Translates between [HondaPacket] and raw frames:
//!
//! `[header, frame length, payload.., checksum]`

use super::{FRAME_OVERHEAD, HondaPacket, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
use crate::{SrsError, SrsResult};

/// Computes the checksum of the given bytes, such that the sum of all bytes
/// plus the checksum is 0 (mod 256)
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Encodes a packet into a raw frame ready to be written to the bus
pub fn encode(packet: &HondaPacket) -> SrsResult<Vec<u8>> {
    let payload = packet.payload();
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(SrsError::InvalidPayloadLength { len: payload.len() });
    }
    let mut frame = Vec::with_capacity(packet.frame_len());
    frame.push(packet.header());
    frame.push(packet.frame_len() as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    Ok(frame)
}

/// Result of decoding a raw frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// The decoded packet. If [DecodedFrame::checksum_valid] is false, its
    /// contents are unverified
    pub packet: HondaPacket,
    /// True if the checksum byte of the frame was correct
    pub checksum_valid: bool,
    /// Checksum byte found in the frame
    pub received_checksum: u8,
    /// Checksum computed over the frame
    pub expected_checksum: u8,
}

/// Decodes a raw frame read from the bus.
///
/// A bad checksum does not fail decoding: the packet is returned with
/// [DecodedFrame::checksum_valid] unset and it is up to the caller what to do with it.
///
/// The payload length is taken from the physical frame length. Frames longer than
/// [MAX_FRAME_LEN] are truncated, and frames shorter than [FRAME_OVERHEAD] fail with
/// [SrsError::InvalidFrameLength]
pub fn decode(frame: &[u8]) -> SrsResult<DecodedFrame> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(SrsError::InvalidFrameLength { len: frame.len() });
    }
    let frame = if frame.len() > MAX_FRAME_LEN {
        log::warn!(
            "Frame of {} bytes exceeds the maximum of {MAX_FRAME_LEN} bytes, truncating",
            frame.len()
        );
        &frame[..MAX_FRAME_LEN]
    } else {
        frame
    };
    let last = frame.len() - 1;
    if frame[1] as usize != frame.len() {
        log::warn!(
            "Frame length byte is {}, but {} bytes were received",
            frame[1],
            frame.len()
        );
    }
    let received_checksum = frame[last];
    let expected_checksum = checksum(&frame[..last]);
    Ok(DecodedFrame {
        packet: HondaPacket {
            header: frame[0],
            payload: frame[2..last].to_vec(),
        },
        checksum_valid: received_checksum == expected_checksum,
        received_checksum,
        expected_checksum,
    })
}
