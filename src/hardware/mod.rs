//! K-Line capable diagnostic adapters (VCIs) and the traits used
//! to discover them and open their K-Line channel

#[cfg(feature = "passthru")]
pub mod passthru;
#[cfg(feature = "serial")]
pub mod serial;
pub mod simulation;

use std::sync::{Arc, Mutex};

use crate::channel::{KLineChannel, KLineSettings};

/// Hardware API result
pub type HardwareResult<T> = Result<T, HardwareError>;

/// The hardware trait defines functions supported by all adapters
/// and also functions used to create a [KLineChannel]
pub trait Hardware {
    /// Creates, opens and configures the devices K-Line channel.
    ///
    /// Only one K-Line channel can exist per device. The channel is closed when dropped
    fn create_kline_channel(this: Arc<Mutex<Self>>, cfg: KLineSettings) -> HardwareResult<Box<dyn KLineChannel>>;

    /// Battery voltage measured on pin 16 of the diagnostic connector, if the
    /// adapter can measure it
    fn read_battery_voltage(&mut self) -> Option<f32>;

    /// Returns information about the hardware
    fn get_info(&self) -> &HardwareInfo;

    /// Returns true if a K-Line channel is currently open on the device
    fn is_kline_channel_open(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Adapter description as listed by a [HardwareScanner]
pub struct HardwareInfo {
    /// Name of the hardware
    pub name: String,
    /// Manufacturer, if the driver reports one
    pub vendor: Option<String>,
    /// What the adapter claims to support
    pub capabilities: HardwareCapabilities,
}

/// Discovers adapters of one kind
pub trait HardwareScanner<T: Hardware> {
    /// Adapters found when the scanner was created
    fn list_devices(&self) -> Vec<HardwareInfo>;
    /// Opens the adapter at `idx` in [HardwareScanner::list_devices]
    fn open_device_by_index(&self, idx: usize) -> HardwareResult<T>;
    /// Opens the adapter with the given name
    fn open_device_by_name(&self, name: &str) -> HardwareResult<T>;
}

#[derive(Debug)]
/// Adapter level error
pub enum HardwareError {
    /// The driver reported a failure
    APIError {
        /// API Error code
        code: u32,
        /// API Error description
        desc: String,
    },
    /// A K-Line channel is already open on this device. The bus is half duplex,
    /// so only one channel may talk on it
    ConflictingChannel,
    /// The adapter has no K-Line support
    ChannelNotSupported,
    /// Hardware not found
    DeviceNotFound,
    /// The device was already closed
    DeviceNotOpen,
    /// The device is shared and its lock was poisoned by a panicking thread
    DeviceLockError,
    /// Lib loading error
    #[cfg(feature = "passthru")]
    LibLoadError(libloading::Error),
}

#[cfg(feature = "passthru")]
impl From<libloading::Error> for HardwareError {
    fn from(err: libloading::Error) -> Self {
        Self::LibLoadError(err)
    }
}

impl std::fmt::Display for HardwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            HardwareError::APIError { code, desc } => {
                write!(f, "Hardware API Error. Code {code}, Description: {desc}")
            }
            HardwareError::ConflictingChannel => write!(f, "A K-Line channel is already open on this device"),
            HardwareError::ChannelNotSupported => write!(f, "Device does not support K-Line"),
            HardwareError::DeviceNotFound => write!(f, "Device not found"),
            HardwareError::DeviceNotOpen => write!(f, "Device is not open"),
            HardwareError::DeviceLockError => write!(f, "Hardware device lock was poisoned"),
            #[cfg(feature = "passthru")]
            HardwareError::LibLoadError(e) => write!(f, "LibLoading error: {e}"),
        }
    }
}

impl std::error::Error for HardwareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self {
            #[cfg(feature = "passthru")]
            HardwareError::LibLoadError(l) => Some(l),
            _ => None,
        }
    }
}

/// Protocols and features an adapter supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HardwareCapabilities {
    /// Supports standard Kline (ISO9141)
    pub kline: bool,
    /// Supports ISO14230 on the K-Line
    pub kline_kwp: bool,
    /// Can read the vehicle battery voltage
    pub battery_voltage: bool,
}
