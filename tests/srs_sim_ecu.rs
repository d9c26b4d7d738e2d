use std::sync::atomic::{AtomicUsize, Ordering};

use honda_srs_diag::{
    SrsError,
    channel::{ChannelError, ChannelResult, KLineChannel},
    dtc::DtcTable,
    honda::{CrashReviewOutcome, HondaPacket, KeepCrashData, SessionStep, SrsCommand, SrsSession, SrsSessionOptions, encode},
};

pub struct SrsSimEcu<T: Fn(&[u8]) -> Option<Vec<u8>> + Send> {
    on_data_callback: T,
    out_buffer: Vec<Vec<u8>>,
    wake_count: usize,
    written: Vec<Vec<u8>>,
    fail_writes: bool,
    fail_reads: bool,
}

impl<T: Fn(&[u8]) -> Option<Vec<u8>> + Send> SrsSimEcu<T> {
    pub fn new(on_data_callback: T) -> Self {
        Self {
            on_data_callback,
            out_buffer: Vec::new(),
            wake_count: 0,
            written: Vec::new(),
            fail_writes: false,
            fail_reads: false,
        }
    }
}

impl<T: Fn(&[u8]) -> Option<Vec<u8>> + Send> KLineChannel for SrsSimEcu<T> {
    fn wake(&mut self) -> ChannelResult<()> {
        println!("KLineChannel: wake Called");
        self.wake_count += 1;
        Ok(())
    }

    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()> {
        println!("KLineChannel: write_bytes Called. Tx: {buffer:02X?}, timeout_ms: {timeout_ms}");
        if self.fail_writes {
            return Err(ChannelError::WriteTimeout);
        }
        self.written.push(buffer.to_vec());
        if let Some(sim_resp) = (self.on_data_callback)(buffer) {
            self.out_buffer.push(sim_resp);
        }
        Ok(())
    }

    fn read_bytes(&mut self, _max_bytes: usize, timeout_ms: u32) -> ChannelResult<Option<Vec<u8>>> {
        if self.fail_reads {
            return Err(ChannelError::IOError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "cable unplugged",
            )));
        }
        if self.out_buffer.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
            Ok(None)
        } else {
            let send = self.out_buffer.remove(0);
            println!("-- Sending {send:02X?} back to tester");
            Ok(Some(send))
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.out_buffer.clear();
        Ok(())
    }
}

fn options() -> SrsSessionOptions {
    SrsSessionOptions {
        reply_timeout_ms: 30,
        poll_interval_ms: 10,
        write_timeout_ms: 0,
    }
}

fn reply(payload: &[u8]) -> Option<Vec<u8>> {
    Some(encode(&HondaPacket::new(0x02, payload).unwrap()).unwrap())
}

fn is(buf: &[u8], cmd: SrsCommand) -> bool {
    buf == encode(&cmd.packet()).unwrap().as_slice()
}

/// CR-V SRS unit with one stored fault and a crash record
fn crv_ecu(buf: &[u8]) -> Option<Vec<u8>> {
    if is(buf, SrsCommand::Hello) {
        reply(&[0x00])
    } else if is(buf, SrsCommand::GetEcuInfo) {
        reply(&[0x01, 0x02, 0x03])
    } else if is(buf, SrsCommand::GetEcuId) {
        reply(b"77960-SWA-E\0")
    } else if is(buf, SrsCommand::GetEcuSerial) {
        reply(b"A123456")
    } else if is(buf, SrsCommand::ReadDtc1) {
        reply(&[0x11, 0x02])
    } else if is(buf, SrsCommand::ReadDtc2) || is(buf, SrsCommand::ReadDtc3) {
        reply(&[0x00, 0x00])
    } else if is(buf, SrsCommand::EndSession) {
        reply(&[0x00, 0x01])
    } else if is(buf, SrsCommand::ClearCrashData) || is(buf, SrsCommand::ClearErrors) {
        reply(&[0x00])
    } else {
        None
    }
}

fn table() -> DtcTable {
    let mut t = DtcTable::new();
    t.push("11-02", "Driver airbag initiator open");
    t.push("5x-89", "Side airbag initiator");
    t
}

#[test]
pub fn test_full_srs_session() {
    let mut session = SrsSession::new(SrsSimEcu::new(crv_ecu), options());
    let report = session.run(&table(), &mut |_: &[u8]| true).unwrap();

    assert_eq!(report.ecu_id, "77960-SWA-E");
    assert_eq!(report.ecu_serial, "A123456");
    assert_eq!(report.ecu_info_hex(), "01 02 03");
    assert_eq!(report.dtcs.len(), 1);
    assert_eq!(report.dtcs[0].to_string(), "11-02 - Driver airbag initiator open");
    assert_eq!(report.crash_data, vec![0x00, 0x01]);
    assert_eq!(report.crash_review, CrashReviewOutcome::Cleared);

    let ecu = session.into_channel();
    assert_eq!(ecu.wake_count, 1);
    // Hello, info, id, serial, 3 DTC slots, end, hello, crash clear, end, clear
    assert_eq!(ecu.written.len(), 12);
}

#[test]
pub fn test_no_faults_no_crash() {
    fn clean_ecu(buf: &[u8]) -> Option<Vec<u8>> {
        if is(buf, SrsCommand::ReadDtc1) {
            reply(&[0x00, 0x00])
        } else if is(buf, SrsCommand::EndSession) {
            reply(&[0x00, 0x00])
        } else {
            crv_ecu(buf)
        }
    }
    let mut session = SrsSession::new(SrsSimEcu::new(clean_ecu), options());
    let report = session.run(&table(), &mut KeepCrashData).unwrap();
    assert!(report.no_dtcs_present);
    assert!(report.dtcs.is_empty());
    assert_eq!(report.crash_review, CrashReviewOutcome::Skipped);
    assert!(report.to_string().contains("No fault codes present"));
}

#[test]
pub fn test_unanswered_hello_is_tolerated() {
    fn no_hello(buf: &[u8]) -> Option<Vec<u8>> {
        if is(buf, SrsCommand::Hello) { None } else { crv_ecu(buf) }
    }
    let mut session = SrsSession::new(SrsSimEcu::new(no_hello), options());
    let report = session.run(&table(), &mut KeepCrashData).unwrap();
    assert_eq!(report.ecu_id, "77960-SWA-E");
    assert_eq!(report.crash_review, CrashReviewOutcome::LeftAsIs);
}

#[test]
pub fn test_silent_during_dtc_read() {
    fn no_dtc(buf: &[u8]) -> Option<Vec<u8>> {
        if is(buf, SrsCommand::ReadDtc2) { None } else { crv_ecu(buf) }
    }
    let mut session = SrsSession::new(SrsSimEcu::new(no_dtc), options());
    let err = session.run(&table(), &mut KeepCrashData).unwrap_err();
    assert!(err.is_ecu_silent());
    assert!(matches!(err, SrsError::EcuSilent { step: SessionStep::ReadDtc }));

    // Nothing is sent after the unanswered request
    let ecu = session.into_channel();
    assert_eq!(ecu.written.last().unwrap(), &encode(&SrsCommand::ReadDtc2.packet()).unwrap());
}

#[test]
pub fn test_write_failure_is_channel_error() {
    let mut ecu = SrsSimEcu::new(crv_ecu);
    ecu.fail_writes = true;
    let mut session = SrsSession::new(ecu, options());
    match session.run(&table(), &mut KeepCrashData) {
        Err(SrsError::ChannelError(ChannelError::WriteTimeout)) => {}
        other => panic!("Unexpected result {other:?}"),
    }
}

#[test]
pub fn test_bad_checksum_is_counted() {
    fn bad_serial_checksum(buf: &[u8]) -> Option<Vec<u8>> {
        let mut resp = crv_ecu(buf)?;
        if is(buf, SrsCommand::GetEcuSerial) {
            let last = resp.len() - 1;
            resp[last] = resp[last].wrapping_add(1);
        }
        Some(resp)
    }
    let mut session = SrsSession::new(SrsSimEcu::new(bad_serial_checksum), options());
    let report = session.run(&table(), &mut KeepCrashData).unwrap();
    assert_eq!(report.ecu_serial, "A123456");
    assert_eq!(report.checksum_errors, 1);
}

#[test]
pub fn test_truncated_reply_in_required_step() {
    fn short_info(buf: &[u8]) -> Option<Vec<u8>> {
        if is(buf, SrsCommand::GetEcuInfo) { Some(vec![0x02, 0x03]) } else { crv_ecu(buf) }
    }
    let mut session = SrsSession::new(SrsSimEcu::new(short_info), options());
    match session.run(&table(), &mut KeepCrashData) {
        Err(SrsError::InvalidFrameLength { len: 2 }) => {}
        other => panic!("Unexpected result {other:?}"),
    }
}

#[test]
pub fn test_single_byte_dtc_reply_is_padded() {
    fn short_dtc(buf: &[u8]) -> Option<Vec<u8>> {
        if is(buf, SrsCommand::ReadDtc1) { reply(&[0x53]) } else { crv_ecu(buf) }
    }
    let mut session = SrsSession::new(SrsSimEcu::new(short_dtc), options());
    let report = session.run(&table(), &mut KeepCrashData).unwrap();
    assert_eq!(report.dtcs.len(), 1);
    assert_eq!(report.dtcs[0].code, "53-00");
    assert_eq!(report.dtcs[0].description, "Unknown");
}

#[test]
pub fn test_silent_end_session_skips_crash_review() {
    fn no_end(buf: &[u8]) -> Option<Vec<u8>> {
        if is(buf, SrsCommand::EndSession) { None } else { crv_ecu(buf) }
    }
    let mut session = SrsSession::new(SrsSimEcu::new(no_end), options());
    let report = session
        .run(&table(), &mut |_: &[u8]| -> bool { panic!("no crash data was read") })
        .unwrap();
    assert!(report.crash_data.is_empty());
    assert_eq!(report.crash_review, CrashReviewOutcome::Skipped);
    assert_eq!(report.clear_confirmation, vec![0x00]);

    // Fault codes are still cleared
    let ecu = session.into_channel();
    assert!(is(ecu.written.last().unwrap(), SrsCommand::ClearErrors));
}

#[test]
pub fn test_silent_clear_errors() {
    fn no_clear(buf: &[u8]) -> Option<Vec<u8>> {
        if is(buf, SrsCommand::ClearErrors) { None } else { crv_ecu(buf) }
    }
    let mut session = SrsSession::new(SrsSimEcu::new(no_clear), options());
    match session.run(&table(), &mut KeepCrashData) {
        Err(SrsError::EcuSilent { step: SessionStep::ClearDtc }) => {}
        other => panic!("Unexpected result {other:?}"),
    }
}

#[test]
pub fn test_silent_crash_review_is_tolerated() {
    // Only the first END_SESS is answered, with the crash record
    let end_sessions = AtomicUsize::new(0);
    let ecu = SrsSimEcu::new(move |buf: &[u8]| {
        if is(buf, SrsCommand::EndSession) {
            match end_sessions.fetch_add(1, Ordering::Relaxed) {
                0 => reply(&[0x00, 0x01]),
                _ => None,
            }
        } else if is(buf, SrsCommand::ClearCrashData) {
            None
        } else {
            crv_ecu(buf)
        }
    });
    let mut session = SrsSession::new(ecu, options());
    let report = session.run(&table(), &mut |_: &[u8]| true).unwrap();
    assert_eq!(report.crash_data, vec![0x00, 0x01]);
    assert_eq!(report.crash_review, CrashReviewOutcome::ClearUnconfirmed);
    assert_eq!(report.clear_confirmation, vec![0x00]);

    let ecu = session.into_channel();
    assert_eq!(ecu.written.len(), 12);
}

#[test]
pub fn test_read_failure_is_channel_error() {
    let mut ecu = SrsSimEcu::new(crv_ecu);
    ecu.fail_reads = true;
    let mut session = SrsSession::new(ecu, options());
    match session.run(&table(), &mut KeepCrashData) {
        Err(SrsError::ChannelError(ChannelError::IOError(e))) => {
            assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe)
        }
        other => panic!("Unexpected result {other:?}"),
    }
    // The failed read of the hello reply ends the session
    let ecu = session.into_channel();
    assert_eq!(ecu.written.len(), 1);
}
