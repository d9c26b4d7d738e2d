//! Module for the Honda proprietary K-Line diagnostic protocol, as spoken
//! by the SRS ECU of the 3rd generation CR-V.
//!
//! Every exchange is a single request frame from the tester followed by a single
//! reply frame from the ECU. The requests used by the diagnostic session are
//! listed in [SrsCommand].

use crate::{SrsError, SrsResult};

pub mod codec;
pub mod crash_review;
pub mod report;
pub mod session;

pub use codec::{DecodedFrame, checksum, decode, encode};
pub use crash_review::{CrashReviewDecider, KeepCrashData};
pub use report::{CrashReviewOutcome, SrsReport};
pub use session::{SessionStep, SrsSession, SrsSessionOptions};

/// Maximum size of a frame on the wire (header + length + payload + checksum)
pub const MAX_FRAME_LEN: usize = 100;
/// Bytes of a frame that are not payload (header, length and checksum)
pub const FRAME_OVERHEAD: usize = 3;
/// Maximum payload that fits into a single frame
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_OVERHEAD;

/// Header of a request frame
pub const REQUEST_HEADER: u8 = 0x60;
/// Header of a clear / acknowledge frame
pub const CLEAR_HEADER: u8 = 0x61;

/// Application level message of the Honda protocol
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HondaPacket {
    header: u8,
    payload: Vec<u8>,
}

impl HondaPacket {
    /// Creates a new packet.
    ///
    /// Fails with [SrsError::InvalidPayloadLength] if the payload does not fit into a frame
    pub fn new(header: u8, payload: &[u8]) -> SrsResult<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SrsError::InvalidPayloadLength { len: payload.len() });
        }
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    /// Returns the header (command class) byte
    pub fn header(&self) -> u8 {
        self.header
    }

    /// Returns the payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length of the frame this packet encodes to
    pub fn frame_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Returns a copy of this packet with one payload byte replaced.
    /// If `idx` is outside the payload, the copy is identical
    pub fn with_payload_byte(&self, idx: usize, value: u8) -> Self {
        let mut copy = self.clone();
        if let Some(b) = copy.payload.get_mut(idx) {
            *b = value;
        }
        copy
    }
}

/// Requests sent to the SRS ECU during a diagnostic session
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display, strum_macros::EnumIter,
)]
pub enum SrsCommand {
    /// Wake-up / start of communication
    Hello,
    /// Read ECU information. This is [SrsCommand::Hello] with its second payload byte set to `0x0F`
    GetEcuInfo,
    /// Read the ECU identification string
    GetEcuId,
    /// Read the ECU serial number
    GetEcuSerial,
    /// Read the first DTC slot
    ReadDtc1,
    /// Read the second DTC slot
    ReadDtc2,
    /// Read the third DTC slot
    ReadDtc3,
    /// End of session. The reply carries the crash data flags
    EndSession,
    /// Clear stored DTCs
    ClearErrors,
    /// Clear the crash data. This is [SrsCommand::ClearErrors] with its first payload byte set to `0x02`
    ClearCrashData,
}

/// DTC slots, in the order they are queried
pub const DTC_QUERIES: [SrsCommand; 3] = [SrsCommand::ReadDtc1, SrsCommand::ReadDtc2, SrsCommand::ReadDtc3];

impl SrsCommand {
    /// Header byte of the request
    pub fn header(&self) -> u8 {
        match self {
            SrsCommand::ClearErrors | SrsCommand::ClearCrashData => CLEAR_HEADER,
            _ => REQUEST_HEADER,
        }
    }

    fn base_payload(&self) -> &'static [u8] {
        match self {
            SrsCommand::Hello | SrsCommand::GetEcuInfo => &[0x70, 0x02],
            SrsCommand::GetEcuId => &[0x20, 0x0F],
            SrsCommand::GetEcuSerial => &[0x30, 0x0F],
            SrsCommand::ReadDtc1 => &[0x08, 0x06],
            SrsCommand::ReadDtc2 => &[0x0A, 0x02],
            SrsCommand::ReadDtc3 => &[0x0C, 0x02],
            SrsCommand::EndSession => &[0x80, 0x0A],
            SrsCommand::ClearErrors | SrsCommand::ClearCrashData => &[0x01],
        }
    }

    /// Builds the request packet
    pub fn packet(&self) -> HondaPacket {
        let base = HondaPacket {
            header: self.header(),
            payload: self.base_payload().to_vec(),
        };
        match self {
            SrsCommand::GetEcuInfo => base.with_payload_byte(1, 0x0F),
            SrsCommand::ClearCrashData => base.with_payload_byte(0, 0x02),
            _ => base,
        }
    }
}
