#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for diagnosing the SRS (airbag) ECU of a 3rd generation Honda CR-V
//! over its K-Line diagnostic bus.
//!
//! ## Honda K-Line diagnostic protocol
//!
//! Honda uses an undocumented proprietary protocol over K-Line at 10400 baud. Before
//! the first frame is sent, the ECU is woken with a 70ms low pulse on the bus
//! followed by a high idle period, similar to the ISO14230 fast init.
//!
//! Every frame on the wire has the layout
//!
//! | Byte | Meaning |
//! |--|--|
//! | 0 | Header (command class, `0x60` for requests, `0x61` for clearing) |
//! | 1 | Total frame length (payload length + 3) |
//! | 2..n-1 | Payload |
//! | n-1 | Checksum, such that all bytes of the frame sum to 0 (mod 256) |
//!
//! The [honda::codec] module translates between [honda::HondaPacket] and raw frames,
//! and the [honda::session::SrsSession] drives the fixed diagnostic conversation
//! (wake-up, identification, fault code retrieval, crash data inspection, fault clearing).
//!
//! ## Hardware support (VCIs)
//!
//! ### SAE J2534-2
//!
//! SAE J2534 (AKA Passthru) adapters are supported with the `passthru` feature.
//! The K-Line channel is opened as ISO9141 with the checksum disabled, and the
//! adapter's `FAST_INIT` IOCTL produces the wake-up pulse.
//!
//! NOTE: Although the J2534 API is officially only for Windows, it will also compile for UNIX and OSX operating
//! systems, due to the unofficial porting of the API in the [Macchina-J2534 project](https://github.com/rnd-ash/Macchina-J2534)
//!
//! ### Serial K-Line interfaces
//!
//! Simple USB-serial K-Line cables (FTDI + L9637 style) are supported with the `serial` feature.
//! The wake-up pulse is produced by holding the line in break state.
//!
//! ### Your own adapter
//!
//! Anything that implements [channel::KLineChannel] can be handed to the diagnostic session.

use channel::ChannelError;
use honda::session::SessionStep;

pub mod channel;
pub mod dtc;
pub mod hardware;
pub mod helpers;
pub mod honda;

/// SRS diagnostic result
pub type SrsResult<T> = Result<T, SrsError>;

#[derive(Debug, thiserror::Error)]
/// SRS diagnostic error
pub enum SrsError {
    /// A payload was too large to fit into a single frame
    #[error("Payload of {len} bytes exceeds the maximum of {} bytes per frame", honda::MAX_PAYLOAD_LEN)]
    InvalidPayloadLength {
        /// Length of the rejected payload
        len: usize,
    },
    /// A frame received from the ECU was too short to contain a header, length and checksum
    #[error("Frame of {len} bytes is shorter than the minimum of {} bytes", honda::FRAME_OVERHEAD)]
    InvalidFrameLength {
        /// Length of the received frame
        len: usize,
    },
    /// The ECU did not reply to a request that requires a response
    #[error("ECU did not respond during step '{step}'")]
    EcuSilent {
        /// Step of the diagnostic session that went unanswered
        step: SessionStep,
    },
    /// The session was cancelled by the caller
    #[error("Diagnostic session was cancelled during step '{step}'")]
    Cancelled {
        /// Step of the diagnostic session that was running when cancelled
        step: SessionStep,
    },
    /// Error with underlying communication channel
    #[error("K-Line channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
}

impl SrsError {
    /// Returns true if this error means the ECU stopped answering, rather than
    /// a failure of the adapter or the caller
    pub fn is_ecu_silent(&self) -> bool {
        matches!(self, SrsError::EcuSilent { .. })
    }
}
