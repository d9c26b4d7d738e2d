//! Serial K-Line adapters. These are plain USB-UART to K-Line level shifters
//! (VAG-COM KKL style cables), so the host drives the bus timing itself.
//!
//! The wake-up pattern is produced by holding a break condition on the TX line,
//! and a reply is considered complete once the bus has been idle for P1 max.

use std::{
    io::{ErrorKind, Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use crate::channel::{ChannelError, ChannelResult, KLineChannel, KLineParity, KLineSettings};

use super::{Hardware, HardwareCapabilities, HardwareError, HardwareInfo, HardwareResult, HardwareScanner};

/// Lists serial ports which may have a K-Line cable attached
#[derive(Debug, Clone)]
pub struct SerialKLineScanner {
    devices: Vec<HardwareInfo>,
}

impl Default for SerialKLineScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialKLineScanner {
    /// Creates a scanner from the serial ports currently present on the system
    pub fn new() -> Self {
        let devices = match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| {
                    let vendor = match &p.port_type {
                        SerialPortType::UsbPort(usb) => usb.manufacturer.clone(),
                        _ => None,
                    };
                    HardwareInfo {
                        name: p.port_name,
                        vendor,
                        capabilities: HardwareCapabilities {
                            kline: true,
                            kline_kwp: true,
                            battery_voltage: false,
                        },
                    }
                })
                .collect(),
            Err(e) => {
                log::warn!("Could not list serial ports: {e}");
                Vec::new()
            }
        };
        Self { devices }
    }
}

impl HardwareScanner<SerialKLineDevice> for SerialKLineScanner {
    fn list_devices(&self) -> Vec<HardwareInfo> {
        self.devices.clone()
    }

    fn open_device_by_index(&self, idx: usize) -> HardwareResult<SerialKLineDevice> {
        match self.devices.get(idx) {
            Some(info) => Ok(SerialKLineDevice::new(info.clone())),
            None => Err(HardwareError::DeviceNotFound),
        }
    }

    fn open_device_by_name(&self, name: &str) -> HardwareResult<SerialKLineDevice> {
        match self.devices.iter().find(|d| d.name == name) {
            Some(info) => Ok(SerialKLineDevice::new(info.clone())),
            None => Err(HardwareError::DeviceNotFound),
        }
    }
}

/// Serial port with a K-Line cable attached
#[derive(Debug)]
pub struct SerialKLineDevice {
    info: HardwareInfo,
    kline_channel: bool,
}

impl SerialKLineDevice {
    /// Uses the serial port at `path`, even if it was not listed by [SerialKLineScanner]
    pub fn from_path(path: &str) -> Self {
        Self::new(HardwareInfo {
            name: path.to_string(),
            vendor: None,
            capabilities: HardwareCapabilities {
                kline: true,
                kline_kwp: true,
                battery_voltage: false,
            },
        })
    }

    fn new(info: HardwareInfo) -> Self {
        Self {
            info,
            kline_channel: false,
        }
    }
}

impl Hardware for SerialKLineDevice {
    fn create_kline_channel(
        this: Arc<Mutex<Self>>,
        cfg: KLineSettings,
    ) -> HardwareResult<Box<dyn KLineChannel>> {
        let port = {
            let mut dev = this.lock().map_err(|_| HardwareError::DeviceLockError)?;
            if dev.kline_channel {
                return Err(HardwareError::ConflictingChannel);
            }
            let parity = match cfg.parity {
                KLineParity::None => Parity::None,
                KLineParity::Odd => Parity::Odd,
                KLineParity::Even => Parity::Even,
            };
            let port: Box<dyn SerialPort> = serialport::new(dev.info.name.as_str(), cfg.baud)
                .data_bits(DataBits::Eight)
                .stop_bits(StopBits::One)
                .parity(parity)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(cfg.p1_max_ms as u64))
                .open()
                .map_err(|e| HardwareError::APIError {
                    code: 0,
                    desc: e.to_string(),
                })?;
            dev.kline_channel = true;
            log::info!("Opened K-Line on {} at {} baud", dev.info.name, cfg.baud);
            port
        };
        Ok(Box::new(SerialKLineChannel {
            device: this,
            line: Box::new(port),
            settings: cfg,
        }))
    }

    fn read_battery_voltage(&mut self) -> Option<f32> {
        None
    }

    fn get_info(&self) -> &HardwareInfo {
        &self.info
    }

    fn is_kline_channel_open(&self) -> bool {
        self.kline_channel
    }
}

/// Byte level access to the port the cable is attached to
trait SerialLine: Send {
    fn name(&self) -> Option<String>;
    /// Returns None if nothing arrived within `timeout`
    fn read_byte(&mut self, timeout: Duration) -> ChannelResult<Option<u8>>;
    fn write_frame(&mut self, buffer: &[u8], timeout: Option<Duration>) -> ChannelResult<()>;
    /// Holds TX low while `low` is set
    fn set_break_state(&mut self, low: bool) -> ChannelResult<()>;
    fn clear_input(&mut self) -> ChannelResult<()>;
}

impl SerialLine for Box<dyn SerialPort> {
    fn name(&self) -> Option<String> {
        SerialPort::name(self.as_ref())
    }

    fn read_byte(&mut self, timeout: Duration) -> ChannelResult<Option<u8>> {
        self.set_timeout(timeout)?;
        let mut b = [0u8; 1];
        match self.read(&mut b) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(b[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_frame(&mut self, buffer: &[u8], timeout: Option<Duration>) -> ChannelResult<()> {
        if let Some(t) = timeout {
            self.set_timeout(t)?;
        }
        match self.write_all(buffer).and_then(|_| self.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(ChannelError::WriteTimeout),
            Err(e) => Err(e.into()),
        }
    }

    fn set_break_state(&mut self, low: bool) -> ChannelResult<()> {
        if low {
            self.set_break()?;
        } else {
            self.clear_break()?;
        }
        Ok(())
    }

    fn clear_input(&mut self) -> ChannelResult<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// K-Line channel on a serial port
pub struct SerialKLineChannel {
    device: Arc<Mutex<SerialKLineDevice>>,
    line: Box<dyn SerialLine>,
    settings: KLineSettings,
}

impl std::fmt::Debug for SerialKLineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialKLineChannel")
            .field("port", &self.line.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl SerialKLineChannel {
    fn read_byte(&mut self, timeout_ms: u32) -> ChannelResult<Option<u8>> {
        self.line
            .read_byte(Duration::from_millis(timeout_ms.max(1) as u64))
    }

    /// Consumes the bytes the cable echoes back from our own transmission
    fn discard_echo(&mut self, sent: &[u8]) -> ChannelResult<()> {
        let window = self.settings.p1_max_ms.max(1) * 4;
        for expected in sent {
            match self.read_byte(window)? {
                Some(b) if b == *expected => {}
                Some(b) => {
                    log::warn!("Echo mismatch, sent {expected:02X} but read {b:02X}");
                    return Err(ChannelError::IOError(std::io::Error::other(
                        "K-Line echo does not match transmitted data",
                    )));
                }
                None => return Err(ChannelError::WriteTimeout),
            }
        }
        Ok(())
    }
}

impl KLineChannel for SerialKLineChannel {
    fn wake(&mut self) -> ChannelResult<()> {
        log::debug!(
            "K-Line wake-up, {}ms low, {}ms total",
            self.settings.tinil_ms,
            self.settings.twup_ms
        );
        self.line.set_break_state(true)?;
        std::thread::sleep(Duration::from_millis(self.settings.tinil_ms as u64));
        self.line.set_break_state(false)?;
        std::thread::sleep(Duration::from_millis(
            self.settings.twup_ms.saturating_sub(self.settings.tinil_ms) as u64,
        ));
        Ok(())
    }

    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()> {
        let timeout = (timeout_ms != 0).then(|| Duration::from_millis(timeout_ms as u64));
        self.line.write_frame(buffer, timeout)?;
        if self.settings.echo_cancel {
            self.discard_echo(buffer)?;
        }
        Ok(())
    }

    fn read_bytes(&mut self, max_bytes: usize, timeout_ms: u32) -> ChannelResult<Option<Vec<u8>>> {
        let first = match self.read_byte(timeout_ms)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let mut frame = vec![first];
        // The frame ends once the ECU stays quiet for longer than P1 max
        while frame.len() < max_bytes {
            match self.read_byte(self.settings.p1_max_ms)? {
                Some(b) => frame.push(b),
                None => break,
            }
        }
        Ok(Some(frame))
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.line.clear_input()
    }
}

impl Drop for SerialKLineChannel {
    fn drop(&mut self) {
        log::debug!("Serial K-Line channel drop called");
        if let Ok(mut dev) = self.device.lock() {
            dev.kline_channel = false;
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        honda::{HondaPacket, SessionStep, SrsCommand, SrsSession, SrsSessionOptions, encode},
        SrsError,
    };

    /// Single wire cable: everything written comes straight back, followed by
    /// the ECU reply, if any
    struct EchoingCable {
        rx: VecDeque<u8>,
        on_data: fn(&[u8]) -> Option<Vec<u8>>,
        corrupt_echo: bool,
        breaks: Arc<Mutex<Vec<bool>>>,
    }

    impl SerialLine for EchoingCable {
        fn name(&self) -> Option<String> {
            Some("sim".into())
        }

        fn read_byte(&mut self, _timeout: Duration) -> ChannelResult<Option<u8>> {
            Ok(self.rx.pop_front())
        }

        fn write_frame(&mut self, buffer: &[u8], _timeout: Option<Duration>) -> ChannelResult<()> {
            self.rx.extend(buffer);
            if self.corrupt_echo {
                if let Some(b) = self.rx.back_mut() {
                    *b ^= 0xFF;
                }
            }
            if let Some(resp) = (self.on_data)(buffer) {
                self.rx.extend(resp);
            }
            Ok(())
        }

        fn set_break_state(&mut self, low: bool) -> ChannelResult<()> {
            self.breaks.lock().unwrap().push(low);
            Ok(())
        }

        fn clear_input(&mut self) -> ChannelResult<()> {
            self.rx.clear();
            Ok(())
        }
    }

    fn srs_ecu(buf: &[u8]) -> Option<Vec<u8>> {
        let payload: &[u8] = if buf == encode(&SrsCommand::ReadDtc1.packet()).unwrap().as_slice() {
            &[0x11, 0x02]
        } else if buf == encode(&SrsCommand::EndSession.packet()).unwrap().as_slice() {
            &[0x00, 0x00]
        } else {
            return None;
        };
        Some(encode(&HondaPacket::new(0x02, payload).unwrap()).unwrap())
    }

    fn channel(cable: EchoingCable, settings: KLineSettings) -> SerialKLineChannel {
        SerialKLineChannel {
            device: Arc::new(Mutex::new(SerialKLineDevice::from_path("sim"))),
            line: Box::new(cable),
            settings,
        }
    }

    fn cable(corrupt_echo: bool) -> EchoingCable {
        EchoingCable {
            rx: VecDeque::new(),
            on_data: srs_ecu,
            corrupt_echo,
            breaks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[test]
    fn echo_cancel_is_default() {
        assert!(KLineSettings::default().echo_cancel);
    }

    #[test]
    fn echo_is_not_taken_as_reply() {
        let mut ch = channel(cable(false), KLineSettings::default());
        let req = encode(&SrsCommand::ReadDtc1.packet()).unwrap();
        ch.write_bytes(&req, 0).unwrap();
        let reply = ch.read_bytes(100, 10).unwrap();
        assert_eq!(reply, Some(vec![0x02, 0x05, 0x11, 0x02, 0xE6]));
        assert_eq!(ch.read_bytes(100, 10).unwrap(), None);
    }

    #[test]
    fn session_reads_ecu_data_over_echoing_cable() {
        let options = SrsSessionOptions {
            reply_timeout_ms: 30,
            poll_interval_ms: 10,
            write_timeout_ms: 0,
        };
        let mut session = SrsSession::new(channel(cable(false), KLineSettings::default()), options);
        let dtc = session
            .request_required(SessionStep::ReadDtc, SrsCommand::ReadDtc1)
            .unwrap();
        assert_eq!(dtc.payload(), &[0x11, 0x02]);
        let crash = session
            .request(SessionStep::EndSession, SrsCommand::EndSession)
            .unwrap()
            .unwrap();
        assert_eq!(crash.payload(), &[0x00, 0x00]);
        // Nothing answers GET_ECU_INFO, so the echo alone must not count as a reply
        match session.request_required(SessionStep::QueryInfo, SrsCommand::GetEcuInfo) {
            Err(SrsError::EcuSilent { step }) => assert_eq!(step, SessionStep::QueryInfo),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn echo_mismatch_is_reported() {
        let mut ch = channel(cable(true), KLineSettings::default());
        let req = encode(&SrsCommand::Hello.packet()).unwrap();
        assert!(matches!(ch.write_bytes(&req, 0), Err(ChannelError::IOError(_))));
    }

    #[test]
    fn wake_pulses_break() {
        let settings = KLineSettings {
            tinil_ms: 1,
            twup_ms: 2,
            ..Default::default()
        };
        let cable = cable(false);
        let breaks = cable.breaks.clone();
        let mut ch = channel(cable, settings);
        ch.wake().unwrap();
        assert_eq!(*breaks.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn only_one_channel_per_port() {
        let dev = Arc::new(Mutex::new(SerialKLineDevice::from_path("/dev/does-not-exist")));
        dev.lock().unwrap().kline_channel = true;
        let res = SerialKLineDevice::create_kline_channel(dev.clone(), KLineSettings::default());
        assert!(matches!(res, Err(HardwareError::ConflictingChannel)));
    }

    #[test]
    fn missing_port_is_an_api_error() {
        let dev = Arc::new(Mutex::new(SerialKLineDevice::from_path("/dev/does-not-exist")));
        let res = SerialKLineDevice::create_kline_channel(dev.clone(), KLineSettings::default());
        assert!(matches!(res, Err(HardwareError::APIError { .. })));
        assert!(!dev.lock().unwrap().is_kline_channel_open());
    }
}
