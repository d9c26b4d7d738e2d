//! Module for the K-Line communication channel with an ECU
//!
//! The diagnostic session only needs three things from a channel:
//! * [KLineChannel::wake] - Perform the wake-up pulse on the bus, once, before the first frame
//! * [KLineChannel::write_bytes] - Write a raw frame to the bus
//! * [KLineChannel::read_bytes] - Read a raw frame from the bus, giving up after a timeout
//!
//! Opening, configuring and closing the physical interface is the job of the
//! [crate::hardware] implementations.

use crate::hardware::HardwareError;

/// Result of a K-Line channel operation
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug)]
/// Error produced by a K-Line channel
pub enum ChannelError {
    /// IO failure of the port or driver
    IOError(std::io::Error),
    /// Frame could not be written in time
    WriteTimeout,
    /// Frame could not be read in time
    ReadTimeout,
    /// Request the adapter cannot perform, EG: a frame too large for the driver
    UnsupportedRequest,
    /// The channel was already closed
    InterfaceNotOpen,
    /// Adapter driver failure
    APIError {
        /// Name of the API EG: 'Passthru', 'serialport'
        api_name: String,
        /// Error code of the driver
        code: u32,
        /// API error description
        desc: String,
    },
    /// Device level error
    HardwareError(HardwareError),
    /// Serial port error
    #[cfg(feature = "serial")]
    SerialError(serialport::Error),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::UnsupportedRequest => write!(f, "request not supported by the K-Line adapter"),
            ChannelError::ReadTimeout => write!(f, "timed out reading from the K-Line"),
            ChannelError::WriteTimeout => write!(f, "timed out writing to the K-Line"),
            ChannelError::InterfaceNotOpen => write!(f, "K-Line channel is closed"),
            ChannelError::APIError {
                api_name,
                code,
                desc,
            } => write!(f, "underlying {api_name} API error ({code}): {desc}"),
            ChannelError::HardwareError(e) => write!(f, "hardware error: {e}"),
            #[cfg(feature = "serial")]
            ChannelError::SerialError(e) => write!(f, "serial port error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::IOError(e) => Some(e),
            ChannelError::HardwareError(e) => Some(e),
            #[cfg(feature = "serial")]
            ChannelError::SerialError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(err)
    }
}

impl From<HardwareError> for ChannelError {
    fn from(err: HardwareError) -> Self {
        Self::HardwareError(err)
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for ChannelError {
    fn from(err: serialport::Error) -> Self {
        Self::SerialError(err)
    }
}

/// Half duplex K-Line channel to a single ECU.
///
/// Only one request is ever outstanding on the bus, so implementations
/// do not need to handle pipelined writes.
pub trait KLineChannel: Send {
    /// Performs the physical wake-up pulse on the bus.
    ///
    /// The diagnostic session calls this exactly once, immediately before
    /// writing its first frame. Some adapters perform the pulse together with
    /// the next written frame (J2534 `FAST_INIT`), which is allowed.
    fn wake(&mut self) -> ChannelResult<()>;

    /// Attempts to write a raw frame to the bus
    ///
    /// ## Parameters
    /// * buffer - Complete encoded frame
    /// * timeout_ms - Timeout for writing bytes. If a value of 0 is used, it tells the channel to write without checking if
    ///   data was actually written.
    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()>;

    /// Attempts to read a raw frame from the bus.
    ///
    /// Returns `Ok(None)` if nothing arrived within the timeout. This function must
    /// not wait longer than `timeout_ms` for the start of a frame.
    ///
    /// ## Parameters
    /// * max_bytes - Maximum number of bytes to return. Longer frames are truncated
    /// * timeout_ms - Timeout for reading bytes
    fn read_bytes(&mut self, max_bytes: usize, timeout_ms: u32) -> ChannelResult<Option<Vec<u8>>>;

    /// Drops anything received but not yet read
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}

impl<T: KLineChannel + ?Sized> KLineChannel for Box<T> {
    fn wake(&mut self) -> ChannelResult<()> {
        (**self).wake()
    }

    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()> {
        (**self).write_bytes(buffer, timeout_ms)
    }

    fn read_bytes(&mut self, max_bytes: usize, timeout_ms: u32) -> ChannelResult<Option<Vec<u8>>> {
        (**self).read_bytes(max_bytes, timeout_ms)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        (**self).clear_rx_buffer()
    }
}

/// Parity setting of the K-Line
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum KLineParity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// K-Line configuration options
#[derive(Debug, Copy, Clone)]
pub struct KLineSettings {
    /// Baud rate of the K-Line
    pub baud: u32,
    /// Parity of each byte
    pub parity: KLineParity,
    /// Maximum gap between two bytes of the same frame (In milliseconds)
    pub p1_max_ms: u32,
    /// Duration the line is held low for the wake-up pulse (In milliseconds)
    pub tinil_ms: u32,
    /// Total duration of the wake-up pattern, low pulse plus high idle (In milliseconds)
    pub twup_ms: u32,
    /// Discard the echo of our own transmission. KKL cables read back everything
    /// written to the bus. J2534 adapters filter the echo themselves and ignore this
    pub echo_cancel: bool,
}

impl Default for KLineSettings {
    fn default() -> Self {
        Self {
            baud: 10400,
            parity: KLineParity::None,
            p1_max_ms: 50,
            tinil_ms: 70,
            twup_ms: 200,
            echo_cancel: true,
        }
    }
}
