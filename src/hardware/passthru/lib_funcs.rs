use j2534_rust::*;
use libloading::Library;
use std::os::raw::c_char;
use std::sync::Arc;
use std::{ffi::*, fmt};

/// Result which contains a PASSTHRU_ERROR in it's Err() variant
pub type PassthruResult<T> = Result<T, PassthruError>;

type PassThruOpenFn = unsafe extern "system" fn(name: *const c_void, device_id: *mut u32) -> i32;
type PassThruCloseFn = unsafe extern "system" fn(device_id: u32) -> i32;
type PassThruConnectFn = unsafe extern "system" fn(
    device_id: u32,
    protocol_id: u32,
    flags: u32,
    baudrate: u32,
    channel_id: *mut u32,
) -> i32;
type PassThruDisconnectFn = unsafe extern "system" fn(channel_id: u32) -> i32;
type PassThruReadMsgsFn = unsafe extern "system" fn(
    channel_id: u32,
    msgs: *mut PASSTHRU_MSG,
    num_msgs: *mut u32,
    timeout: u32,
) -> i32;
type PassThruWriteMsgsFn = unsafe extern "system" fn(
    channel_id: u32,
    msgs: *mut PASSTHRU_MSG,
    num_msgs: *mut u32,
    timeout: u32,
) -> i32;
type PassThruStartMsgFilterFn = unsafe extern "system" fn(
    channel_id: u32,
    filter_type: u32,
    m_msg: *const PASSTHRU_MSG,
    p_msg: *const PASSTHRU_MSG,
    fc_msg: *const PASSTHRU_MSG,
    filter_id: *mut u32,
) -> i32;
type PassThruStopMsgFilterFn = unsafe extern "system" fn(channel_id: u32, filter_id: u32) -> i32;
type PassThruReadVersionFn = unsafe extern "system" fn(
    device_id: u32,
    firmware_version: *mut c_char,
    dll_version: *mut c_char,
    api_version: *mut c_char,
) -> i32;
type PassThruGetLastErrorFn = unsafe extern "system" fn(error_description: *mut c_char) -> i32;
type PassThruIoctlFn = unsafe extern "system" fn(
    handle_id: u32,
    ioctl_id: u32,
    input: *mut c_void,
    output: *mut c_void,
) -> i32;

/// Single SET_CONFIG / GET_CONFIG parameter
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct SConfig {
    pub parameter: u32,
    pub value: u32,
}

#[repr(C)]
struct SConfigList {
    num_of_params: u32,
    config_ptr: *mut SConfig,
}

/// Version strings reported by the driver
#[derive(Debug, Clone)]
pub struct DrvVersion {
    /// Library (DLL) Version
    pub dll_version: String,
    /// Passthru API Version (Only V04.04 is supported currently!)
    pub api_version: String,
    /// Device Firmware version
    pub fw_version: String,
}

#[derive(Clone)]
pub struct PassthruDrv {
    /// Loaded library to interface with the device
    lib: Arc<Library>,
    /// Open device connection
    open_fn: PassThruOpenFn,
    /// Close device connection
    close_fn: PassThruCloseFn,
    /// Connect a communication channel
    connect_fn: PassThruConnectFn,
    /// Disconnect a communication channel
    disconnect_fn: PassThruDisconnectFn,
    /// Read messages from a communication channel
    read_msg_fn: PassThruReadMsgsFn,
    /// Write messages to a communication channel
    write_msg_fn: PassThruWriteMsgsFn,
    /// Start a filter on a channel
    start_filter_fn: PassThruStartMsgFilterFn,
    /// Stop a filter on a channel
    stop_filter_fn: PassThruStopMsgFilterFn,
    /// Get the last driver error description if ERR_FAILED
    get_last_err_fn: PassThruGetLastErrorFn,
    /// IOCTL
    ioctl_fn: PassThruIoctlFn,
    /// Get driver details
    read_version_fn: PassThruReadVersionFn,
}

impl fmt::Debug for PassthruDrv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthruDrv")
            .field("library", &self.lib)
            .finish()
    }
}

#[inline(always)]
/// Function to reduce boilerplate code with returning a Result
fn ret_res<T>(res: i32, ret: T) -> PassthruResult<T> {
    match res {
        0 => Ok(ret),
        _ => {
            log::error!("Function call failed with status {res}");
            Err(PassthruError::try_from(res as u32).unwrap_or(PassthruError::ERR_FAILED))
        }
    }
}

fn blank_msg() -> PASSTHRU_MSG {
    PASSTHRU_MSG {
        protocol_id: 0,
        rx_status: 0,
        tx_flags: 0,
        timestamp: 0,
        data_size: 0,
        extra_data_size: 0,
        data: [0; 4128],
    }
}

fn c_buf_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

impl PassthruDrv {
    pub fn load_lib(path: String) -> Result<PassthruDrv, libloading::Error> {
        log::debug!("Opening function library {path}");
        let lib = unsafe { Library::new(path)? };
        unsafe {
            let open_fn: PassThruOpenFn = *lib.get(b"PassThruOpen\0")?;
            let close_fn: PassThruCloseFn = *lib.get(b"PassThruClose\0")?;
            let connect_fn: PassThruConnectFn = *lib.get(b"PassThruConnect\0")?;
            let disconnect_fn: PassThruDisconnectFn = *lib.get(b"PassThruDisconnect\0")?;
            let read_msg_fn: PassThruReadMsgsFn = *lib.get(b"PassThruReadMsgs\0")?;
            let write_msg_fn: PassThruWriteMsgsFn = *lib.get(b"PassThruWriteMsgs\0")?;
            let start_filter_fn: PassThruStartMsgFilterFn = *lib.get(b"PassThruStartMsgFilter\0")?;
            let stop_filter_fn: PassThruStopMsgFilterFn = *lib.get(b"PassThruStopMsgFilter\0")?;
            let get_last_err_fn: PassThruGetLastErrorFn = *lib.get(b"PassThruGetLastError\0")?;
            let ioctl_fn: PassThruIoctlFn = *lib.get(b"PassThruIoctl\0")?;
            let read_version_fn: PassThruReadVersionFn = *lib.get(b"PassThruReadVersion\0")?;

            Ok(PassthruDrv {
                lib: Arc::new(lib),
                open_fn,
                close_fn,
                connect_fn,
                disconnect_fn,
                read_msg_fn,
                write_msg_fn,
                start_filter_fn,
                stop_filter_fn,
                get_last_err_fn,
                ioctl_fn,
                read_version_fn,
            })
        }
    }

    //type PassThruOpenFn = unsafe extern "system" fn(name: *const libc::c_void, device_id: *mut u32) -> i32;
    pub fn open(&self) -> PassthruResult<u32> {
        log::debug!("PT_OPEN called");
        let mut id: u32 = 0;
        let res = unsafe { (self.open_fn)(std::ptr::null(), &mut id) };
        ret_res(res, id)
    }

    //type PassThruCloseFn = unsafe extern "system" fn(device_id: u32) -> i32;
    pub fn close(&self, dev_id: u32) -> PassthruResult<()> {
        log::debug!("PT_CLOSE called. Device ID: {dev_id}");
        let res = unsafe { (self.close_fn)(dev_id) };
        ret_res(res, ())
    }

    // type PassThruWriteMsgsFn = unsafe extern "system" fn(channel_id: u32, msgs: *mut PASSTHRU_MSG, num_msgs: *mut u32, timeout: u32) -> i32;
    pub fn write_messages(
        &self,
        channel_id: u32,
        msgs: &mut [PASSTHRU_MSG],
        timeout: u32,
    ) -> PassthruResult<usize> {
        log::debug!(
            "PT_WRITE_MSGS called. Channel ID: {channel_id}, {} msgs, Timeout {timeout}",
            msgs.len()
        );
        if msgs.is_empty() {
            // No messages? Just tell application everything is OK
            return Ok(0);
        }
        let mut msg_count: u32 = msgs.len() as u32;
        let res = unsafe { (self.write_msg_fn)(channel_id, msgs.as_mut_ptr(), &mut msg_count, timeout) };
        ret_res(res, msg_count as usize)
    }

    //type PassThruReadMsgsFn = unsafe extern "system" fn(channel_id: u32, msgs: *mut PASSTHRU_MSG, num_msgs: *mut u32, timeout: u32) -> i32;
    pub fn read_messages(
        &self,
        channel_id: u32,
        max_msgs: u32,
        timeout: u32,
    ) -> PassthruResult<Vec<PASSTHRU_MSG>> {
        let mut msg_count: u32 = max_msgs;
        // Create a blank array of empty passthru messages according to the max we should read
        let mut write_array: Vec<PASSTHRU_MSG> = vec![blank_msg(); max_msgs as usize];

        let res = unsafe { (self.read_msg_fn)(channel_id, write_array.as_mut_ptr(), &mut msg_count, timeout) };
        write_array.truncate(msg_count as usize);
        if res == PassthruError::ERR_BUFFER_EMPTY as i32 || res == PassthruError::ERR_TIMEOUT as i32 {
            return Ok(write_array);
        }
        ret_res(res, write_array)
    }

    //type PassThruReadVersionFn = unsafe extern "system" fn(device_id: u32, firmware_version: *mut libc::c_char, dll_version: *mut libc::c_char, api_version: *mut libc::c_char) -> i32;
    pub fn get_version(&self, dev_id: u32) -> PassthruResult<DrvVersion> {
        log::debug!("PT_GET_VERSION called. Device ID {dev_id}");
        let mut firmware_version: [u8; 80] = [0; 80];
        let mut dll_version: [u8; 80] = [0; 80];
        let mut api_version: [u8; 80] = [0; 80];
        let res = unsafe {
            (self.read_version_fn)(
                dev_id,
                firmware_version.as_mut_ptr() as *mut c_char,
                dll_version.as_mut_ptr() as *mut c_char,
                api_version.as_mut_ptr() as *mut c_char,
            )
        };
        ret_res(
            res,
            DrvVersion {
                api_version: c_buf_to_string(&api_version),
                dll_version: c_buf_to_string(&dll_version),
                fw_version: c_buf_to_string(&firmware_version),
            },
        )
    }

    //type PassThruGetLastErrorFn = unsafe extern "system" fn(error_description: *mut libc::c_char) -> i32;
    pub fn get_last_error(&self) -> PassthruResult<String> {
        let mut err: [u8; 80] = [0; 80];
        let res = unsafe { (self.get_last_err_fn)(err.as_mut_ptr() as *mut c_char) };
        ret_res(res, c_buf_to_string(&err))
    }

    //type PassThruIoctlFn = unsafe extern "system" fn(handle_id: u32, ioctl_id: u32, input: *mut libc::c_void, output: *mut libc::c_void) -> i32;
    pub fn ioctl(
        &self,
        handle_id: u32,
        ioctl_id: IoctlID,
        input: *mut c_void,
        output: *mut c_void,
    ) -> PassthruResult<()> {
        log::debug!("PT_IOCTL called. handle ID {handle_id}, IOCTL ID {ioctl_id}");
        let res = unsafe { (self.ioctl_fn)(handle_id, ioctl_id as u32, input, output) };
        ret_res(res, ())
    }

    /// Sets channel configuration parameters (SET_CONFIG)
    pub fn set_config(&self, channel_id: u32, params: &mut [SConfig]) -> PassthruResult<()> {
        let mut list = SConfigList {
            num_of_params: params.len() as u32,
            config_ptr: params.as_mut_ptr(),
        };
        self.ioctl(
            channel_id,
            IoctlID::SET_CONFIG,
            (&mut list) as *mut SConfigList as *mut c_void,
            std::ptr::null_mut(),
        )
    }

    /// Performs a fast init on the channel, sending `msg` once the wake-up pattern completes.
    /// Returns the response the adapter collected, which may be empty
    pub fn fast_init(&self, channel_id: u32, msg: &mut PASSTHRU_MSG) -> PassthruResult<PASSTHRU_MSG> {
        let mut resp = blank_msg();
        self.ioctl(
            channel_id,
            IoctlID::FAST_INIT,
            msg as *mut PASSTHRU_MSG as *mut c_void,
            (&mut resp) as *mut PASSTHRU_MSG as *mut c_void,
        )?;
        Ok(resp)
    }

    //type PassThruConnectFn = unsafe extern "system" fn(device_id: u32, protocol_id: u32, flags: u32, baudrate: u32, channel_id: *mut u32) -> i32;
    /// Returns channel ID
    pub fn connect(
        &self,
        dev_id: u32,
        protocol: Protocol,
        flags: u32,
        baud: u32,
    ) -> PassthruResult<u32> {
        log::debug!(
            "PT_CONNECT called. Device ID {dev_id}, protocol {protocol}, flags: {flags:08X?}, baud: {baud}"
        );
        let mut channel_id: u32 = 0;
        let res = unsafe { (self.connect_fn)(dev_id, protocol as u32, flags, baud, &mut channel_id) };
        ret_res(res, channel_id)
    }

    //type PassThruDisconnectFn = unsafe extern "system" fn(channel_id: u32) -> i32;
    pub fn disconnect(&self, channel_id: u32) -> PassthruResult<()> {
        log::debug!("PT_DISCONNECT called. Channel ID {channel_id}");
        ret_res(unsafe { (self.disconnect_fn)(channel_id) }, ())
    }

    //type PassThruStartMsgFilterFn = unsafe extern "system" fn(channel_id: u32, filter_type: u32, m_msg: *const PASSTHRU_MSG, p_msg: *const PASSTHRU_MSG, fc_msg: *const PASSTHRU_MSG, filter_id: *mut u32) -> i32;
    /// Returns filter ID. K-Line filters never carry a flow control message
    pub fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: FilterType,
        mask: &PASSTHRU_MSG,
        pattern: &PASSTHRU_MSG,
    ) -> PassthruResult<u32> {
        log::debug!("PT_START_MSG_FILTER called. Channel ID {channel_id}");
        let mut filter_id: u32 = 0;
        let res = unsafe {
            (self.start_filter_fn)(
                channel_id,
                filter_type as u32,
                mask,
                pattern,
                std::ptr::null(),
                &mut filter_id,
            )
        };
        ret_res(res, filter_id)
    }

    //type PassThruStopMsgFilterFn = unsafe extern "system" fn(channel_id: u32, filter_id: u32) -> i32;
    pub fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> PassthruResult<()> {
        log::debug!("PT_STOP_MSG_FILTER called. Channel ID {channel_id}, Filter ID {filter_id}");
        let res = unsafe { (self.stop_filter_fn)(channel_id, filter_id) };
        ret_res(res, ())
    }
}
