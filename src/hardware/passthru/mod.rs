//! The passthru API (Also known as SAE J2534) is an adapter protocol used by some OBD2 adapters.
//!
//! This module provides support for V04.04 of the API, including experimental support for OSX and Linux, used by
//! [Macchina-J2534][1]
//!
//! [1]: http://github.com/rnd-ash/macchina-J2534
//!
//! Only the ISO9141 protocol is used here. The K-Line is opened with the adapters
//! checksum handling disabled, since Honda frames carry their own checksum.
//! The wake-up pattern is performed by the adapter (FAST_INIT) together with the first request

use std::{
    collections::VecDeque,
    ffi::c_void,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use j2534_rust::{ConnectFlags, FilterType, IoctlID, PASSTHRU_MSG, PassthruError, Protocol};

#[cfg(windows)]
use winreg::{RegKey, enums::HKEY_LOCAL_MACHINE};

use crate::channel::{ChannelError, ChannelResult, KLineChannel, KLineParity, KLineSettings};

use self::lib_funcs::{PassthruDrv, SConfig};

use super::{HardwareCapabilities, HardwareError, HardwareInfo, HardwareResult};

mod lib_funcs;

pub use lib_funcs::DrvVersion;

/// SET_CONFIG parameter IDs used for K-Line
const PARAM_LOOPBACK: u32 = 0x03;
const PARAM_P1_MAX: u32 = 0x07;
const PARAM_TINIL: u32 = 0x14;
const PARAM_TWUP: u32 = 0x15;
const PARAM_PARITY: u32 = 0x16;

/// Rx status bits that mark an indication rather than ECU data
const RX_TX_MSG_TYPE: u32 = 0x01;
const RX_START_OF_MESSAGE: u32 = 0x02;

/// ReadMsgs only returns early once this many messages are buffered, so
/// asking for more would hold every reply back until the timeout expires
const MSGS_PER_READ: u32 = 1;

/// Connect flags of the K-Line channel. Honda frames carry their own checksum
fn kline_connect_flags() -> u32 {
    (ConnectFlags::ISO9141_K_LINE_ONLY | ConnectFlags::ISO9141_NO_CHECKSUM).bits()
}

/// Reads until a message carrying ECU data arrives or `timeout_ms` runs out.
/// Indications are skipped
fn read_data_frame<F>(mut read: F, timeout_ms: u32) -> ChannelResult<Option<Vec<u8>>>
where
    F: FnMut(u32, u32) -> ChannelResult<Vec<PASSTHRU_MSG>>,
{
    let budget = Duration::from_millis(timeout_ms as u64);
    let start = Instant::now();
    loop {
        let remaining = budget.saturating_sub(start.elapsed()).as_millis() as u32;
        for msg in read(MSGS_PER_READ, remaining)? {
            if let Some(data) = PassthruKLineChannel::msg_data(&msg) {
                return Ok(Some(data));
            }
        }
        if remaining == 0 || start.elapsed() >= budget {
            return Ok(None);
        }
    }
}

/// Passthru API device scanner
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PassthruScanner {
    devices: Vec<PassthruInfo>,
}

impl Default for PassthruScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthruScanner {
    #[cfg(unix)]
    /// Creates a passthru scanner
    pub fn new() -> Self {
        match std::fs::read_dir(shellexpand::tilde("~/.passthru").to_string()) {
            Ok(list) => Self {
                devices: list
                    .into_iter()
                    .filter_map(|p| p.ok())
                    .filter(|p| p.file_name().to_string_lossy().ends_with(".json"))
                    .map(|p| PassthruInfo::new(&p.path()))
                    // Entries that cannot be parsed are not adapters
                    .filter_map(|s| s.ok())
                    .collect(),
            },
            Err(e) => {
                log::warn!("Could not read ~/.passthru: {e}");
                Self { devices: Vec::new() }
            }
        }
    }

    #[cfg(windows)]
    /// Creates a passthru scanner
    pub fn new() -> Self {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        match hklm.open_subkey("SOFTWARE\\PassThruSupport.04.04") {
            Ok(root) => Self {
                devices: root
                    .enum_keys()
                    .filter_map(|k| k.ok())
                    .filter_map(|k| root.open_subkey(k).ok())
                    .filter_map(|k| PassthruInfo::new(&k).ok())
                    .collect(),
            },
            Err(e) => {
                log::warn!("No passthru drivers registered: {e}");
                Self { devices: Vec::new() }
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    /// Creates a passthru scanner
    pub fn new() -> Self {
        Self { devices: Vec::new() }
    }
}

impl super::HardwareScanner<PassthruDevice> for PassthruScanner {
    fn list_devices(&self) -> Vec<HardwareInfo> {
        self.devices.iter().map(|x| x.into()).collect()
    }

    fn open_device_by_index(&self, idx: usize) -> HardwareResult<PassthruDevice> {
        match self.devices.get(idx) {
            Some(info) => PassthruDevice::open_device(info),
            None => Err(HardwareError::DeviceNotFound),
        }
    }

    fn open_device_by_name(&self, name: &str) -> HardwareResult<PassthruDevice> {
        match self.devices.iter().find(|s| s.name == name) {
            Some(info) => PassthruDevice::open_device(info),
            None => Err(HardwareError::DeviceNotFound),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PassthruInfo {
    name: String,
    vendor: String,
    function_lib: String,
    iso14230: bool,
    iso9141: bool,
}

impl PassthruInfo {
    #[cfg(unix)]
    pub fn new(path: &std::path::Path) -> HardwareResult<Self> {
        let s = std::fs::read_to_string(path).map_err(|_| HardwareError::DeviceNotFound)?;
        let json = serde_json::from_str::<serde_json::Value>(&s).map_err(|e| {
            log::warn!("Invalid passthru descriptor {}: {e}", path.display());
            HardwareError::DeviceNotFound
        })?;
        let lib = match json["FUNCTION_LIB"].as_str() {
            Some(s) => shellexpand::tilde(s).to_string(),
            None => return Err(HardwareError::DeviceNotFound),
        };
        Ok(PassthruInfo {
            function_lib: lib,
            name: json["NAME"].as_str().unwrap_or("UNKNOWN PASSTHRU DEVICE").to_string(),
            vendor: json["VENDOR"]
                .as_str()
                .unwrap_or("UNKNOWN PASSTHRU DEVICE VENDOR")
                .to_string(),
            iso14230: Self::read_bool(&json, "ISO14230"),
            iso9141: Self::read_bool(&json, "ISO9141"),
        })
    }

    #[cfg(windows)]
    pub fn new(key: &RegKey) -> HardwareResult<Self> {
        let function_lib: String = key
            .get_value("FunctionLibrary")
            .map_err(|_| HardwareError::DeviceNotFound)?;
        Ok(PassthruInfo {
            name: key
                .get_value("Name")
                .unwrap_or_else(|_| "UNKNOWN PASSTHRU DEVICE".to_string()),
            vendor: key
                .get_value("Vendor")
                .unwrap_or_else(|_| "UNKNOWN PASSTHRU DEVICE VENDOR".to_string()),
            function_lib,
            iso14230: Self::read_bool(key, "ISO14230"),
            iso9141: Self::read_bool(key, "ISO9141"),
        })
    }

    #[cfg(unix)]
    #[inline]
    fn read_bool(j: &serde_json::Value, s: &str) -> bool {
        j[s].as_bool().unwrap_or(false)
    }

    #[cfg(windows)]
    #[inline]
    fn read_bool(k: &RegKey, name: &str) -> bool {
        let val: u32 = match k.get_value(name) {
            Ok(b) => b,
            Err(_) => return false,
        };
        val != 0
    }
}

impl From<&PassthruInfo> for HardwareInfo {
    fn from(info: &PassthruInfo) -> Self {
        HardwareInfo {
            name: info.name.clone(),
            vendor: Some(info.vendor.clone()),
            capabilities: HardwareCapabilities {
                kline: info.iso9141,
                kline_kwp: info.iso14230,
                battery_voltage: true,
            },
        }
    }
}

/// Passthru device
#[derive(Debug)]
pub struct PassthruDevice {
    info: HardwareInfo,
    drv: PassthruDrv,
    device_idx: Option<u32>,
    kline_channel: bool,
}

impl PassthruDevice {
    /// Opens the passthru device
    fn open_device(info: &PassthruInfo) -> HardwareResult<Self> {
        log::info!("Opening passthru device {}", info.name);
        let drv = PassthruDrv::load_lib(info.function_lib.clone())?;
        let idx = drv.open()?;
        Ok(Self {
            info: info.into(),
            drv,
            device_idx: Some(idx),
            kline_channel: false,
        })
    }

    /// Returns the driver, library and firmware versions
    pub fn get_version(&self) -> HardwareResult<DrvVersion> {
        self.safe_passthru_op(|idx, drv| drv.get_version(idx))
    }

    pub(crate) fn safe_passthru_op<X, T: FnOnce(u32, &PassthruDrv) -> lib_funcs::PassthruResult<X>>(
        &self,
        f: T,
    ) -> HardwareResult<X> {
        match self.device_idx {
            Some(idx) => match f(idx, &self.drv) {
                Ok(res) => Ok(res),
                Err(PassthruError::ERR_FAILED) => match self.drv.get_last_error() {
                    // Err failed, query the adapter for the reason
                    Ok(reason) => Err(HardwareError::APIError {
                        code: PassthruError::ERR_FAILED as u32,
                        desc: reason,
                    }),
                    Err(_) => Err(PassthruError::ERR_FAILED.into()),
                },
                Err(e) => Err(e.into()),
            },
            None => Err(HardwareError::DeviceNotOpen),
        }
    }
}

impl Drop for PassthruDevice {
    fn drop(&mut self) {
        if let Some(idx) = self.device_idx.take() {
            // Failure here means the device is already gone
            if let Err(e) = self.drv.close(idx) {
                log::warn!("Closing passthru device failed: {e:?}");
            }
        }
    }
}

fn lock_device(device: &Arc<Mutex<PassthruDevice>>) -> HardwareResult<MutexGuard<'_, PassthruDevice>> {
    device.lock().map_err(|_| HardwareError::DeviceLockError)
}

impl super::Hardware for PassthruDevice {
    fn create_kline_channel(
        this: Arc<Mutex<Self>>,
        cfg: KLineSettings,
    ) -> HardwareResult<Box<dyn KLineChannel>> {
        let channel_id;
        let filter_id;
        {
            let mut dev = lock_device(&this)?;
            if !dev.info.capabilities.kline {
                return Err(HardwareError::ChannelNotSupported);
            }
            if dev.kline_channel {
                return Err(HardwareError::ConflictingChannel);
            }
            let flags = kline_connect_flags();
            channel_id = dev.safe_passthru_op(|idx, drv| drv.connect(idx, Protocol::ISO9141, flags, cfg.baud))?;

            let parity = match cfg.parity {
                KLineParity::None => 0,
                KLineParity::Odd => 1,
                KLineParity::Even => 2,
            };
            let mut params = [
                // The adapter counts P1 in 0.5ms steps
                SConfig { parameter: PARAM_P1_MAX, value: cfg.p1_max_ms * 2 },
                SConfig { parameter: PARAM_PARITY, value: parity },
                SConfig { parameter: PARAM_LOOPBACK, value: 0 },
                SConfig { parameter: PARAM_TWUP, value: cfg.twup_ms },
                SConfig { parameter: PARAM_TINIL, value: cfg.tinil_ms },
            ];
            let setup = dev
                .safe_passthru_op(|_, drv| drv.set_config(channel_id, &mut params))
                .and_then(|_| {
                    // Empty mask and pattern lets every frame through
                    let filter_msg = || {
                        let mut msg = PASSTHRU_MSG::default();
                        msg.protocol_id = Protocol::ISO9141 as u32;
                        msg.data_size = 1;
                        msg
                    };
                    let (mask, pattern) = (filter_msg(), filter_msg());
                    dev.safe_passthru_op(|_, drv| {
                        drv.start_msg_filter(channel_id, FilterType::PASS_FILTER, &mask, &pattern)
                    })
                });
            filter_id = match setup {
                Ok(id) => id,
                Err(e) => {
                    log::error!("K-Line channel setup failed: {e}");
                    let _ = dev.safe_passthru_op(|_, drv| drv.disconnect(channel_id));
                    return Err(e);
                }
            };
            dev.kline_channel = true;
        }
        log::info!("Opened K-Line channel {channel_id} at {} baud", cfg.baud);
        Ok(Box::new(PassthruKLineChannel {
            device: this,
            channel_id,
            filter_id,
            fast_init_pending: false,
            rx_backlog: VecDeque::new(),
        }))
    }

    fn read_battery_voltage(&mut self) -> Option<f32> {
        let mut output: u32 = 0;
        match self.safe_passthru_op(|idx, drv| {
            drv.ioctl(
                idx,
                IoctlID::READ_VBATT,
                std::ptr::null_mut(),
                (&mut output) as *mut _ as *mut c_void,
            )
        }) {
            Ok(_) => Some(output as f32 / 1000.0),
            Err(e) => {
                log::debug!("Battery voltage unavailable: {e}");
                None
            }
        }
    }

    fn get_info(&self) -> &HardwareInfo {
        &self.info
    }

    fn is_kline_channel_open(&self) -> bool {
        self.kline_channel
    }
}

/// Passthru device K-Line channel
#[derive(Debug)]
pub struct PassthruKLineChannel {
    device: Arc<Mutex<PassthruDevice>>,
    channel_id: u32,
    filter_id: u32,
    /// Set by [KLineChannel::wake]. The next write goes out through FAST_INIT
    fast_init_pending: bool,
    /// Frames received during FAST_INIT, handed out before anything else
    rx_backlog: VecDeque<Vec<u8>>,
}

impl PassthruKLineChannel {
    fn with_device<X, T: FnOnce(u32, &PassthruDrv) -> lib_funcs::PassthruResult<X>>(
        &self,
        f: T,
    ) -> ChannelResult<X> {
        let dev = lock_device(&self.device)?;
        Ok(dev.safe_passthru_op(|_, drv| f(self.channel_id, drv))?)
    }

    fn make_msg(buffer: &[u8]) -> ChannelResult<PASSTHRU_MSG> {
        let mut msg = PASSTHRU_MSG::default();
        if buffer.len() > msg.data.len() {
            return Err(ChannelError::UnsupportedRequest);
        }
        msg.protocol_id = Protocol::ISO9141 as u32;
        msg.data_size = buffer.len() as u32;
        msg.data[..buffer.len()].copy_from_slice(buffer);
        Ok(msg)
    }

    fn msg_data(msg: &PASSTHRU_MSG) -> Option<Vec<u8>> {
        if msg.rx_status & (RX_TX_MSG_TYPE | RX_START_OF_MESSAGE) != 0 {
            return None;
        }
        let len = (msg.data_size as usize).min(msg.data.len());
        if len == 0 {
            return None;
        }
        Some(msg.data[..len].to_vec())
    }
}

impl KLineChannel for PassthruKLineChannel {
    fn wake(&mut self) -> ChannelResult<()> {
        self.fast_init_pending = true;
        Ok(())
    }

    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()> {
        let mut msg = Self::make_msg(buffer)?;
        if self.fast_init_pending {
            self.fast_init_pending = false;
            match self.with_device(|channel, drv| drv.fast_init(channel, &mut msg)) {
                Ok(resp) => {
                    if let Some(data) = Self::msg_data(&resp) {
                        self.rx_backlog.push_back(data);
                    }
                    return Ok(());
                }
                // Some adapters reject FAST_INIT on ISO9141. The ECU may still answer a plain write
                Err(e) => log::warn!("FAST_INIT failed, sending without wake-up: {e}"),
            }
        }
        let mut msgs = [msg];
        self.with_device(|channel, drv| drv.write_messages(channel, &mut msgs, timeout_ms))
            .map(|_| ())
    }

    fn read_bytes(&mut self, max_bytes: usize, timeout_ms: u32) -> ChannelResult<Option<Vec<u8>>> {
        if let Some(mut data) = self.rx_backlog.pop_front() {
            data.truncate(max_bytes);
            return Ok(Some(data));
        }
        let first = read_data_frame(
            |max, timeout| self.with_device(|channel, drv| drv.read_messages(channel, max, timeout)),
            timeout_ms,
        )?;
        Ok(first.map(|mut d| {
            d.truncate(max_bytes);
            d
        }))
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.rx_backlog.clear();
        self.with_device(|channel, drv| {
            drv.ioctl(
                channel,
                IoctlID::CLEAR_RX_BUFFER,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        })
    }
}

impl Drop for PassthruKLineChannel {
    fn drop(&mut self) {
        log::debug!("K-Line channel {} drop called", self.channel_id);
        if let Ok(mut dev) = self.device.lock() {
            let (channel_id, filter_id) = (self.channel_id, self.filter_id);
            if let Err(e) = dev.safe_passthru_op(|_, drv| drv.stop_msg_filter(channel_id, filter_id)) {
                log::warn!("Stopping filter failed: {e}");
            }
            if let Err(e) = dev.safe_passthru_op(|_, drv| drv.disconnect(channel_id)) {
                log::warn!("Disconnecting K-Line channel failed: {e}");
            }
            dev.kline_channel = false;
        }
    }
}

impl From<PassthruError> for HardwareError {
    fn from(err: PassthruError) -> Self {
        HardwareError::APIError {
            code: err as u32,
            desc: err.to_string(),
        }
    }
}
