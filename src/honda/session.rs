//! SRS diagnostic session
//!
//! Drives the fixed conversation with the SRS ECU:
//!
//! 1. [SessionStep::Start] - Hello. Silence is tolerated
//! 2. [SessionStep::QueryInfo] - ECU information
//! 3. [SessionStep::QueryEcuId] - ECU identification string
//! 4. [SessionStep::QueryEcuSerial] - ECU serial number
//! 5. [SessionStep::ReadDtc] - The 3 DTC slots
//! 6. [SessionStep::EndSession] - End of session. Silence is tolerated, the reply carries crash data
//! 7. [SessionStep::CrashReview] - Only if crash data is present. Silence is tolerated
//! 8. [SessionStep::ClearDtc] - Clear stored DTCs
//!
//! Steps 2-5 and 8 must be answered. If the ECU stays silent for the whole reply
//! timeout the session ends with [SrsError::EcuSilent] and no further steps run.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use super::{
    CrashReviewDecider, CrashReviewOutcome, DTC_QUERIES, HondaPacket, MAX_FRAME_LEN, SrsCommand, SrsReport,
    codec::{self, DecodedFrame},
};
use crate::{
    SrsError, SrsResult,
    channel::KLineChannel,
    dtc::{DtcTable, SrsDtc},
    helpers::{ascii_from_payload, hex_string},
};

/// Step of the diagnostic session
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
pub enum SessionStep {
    /// Wake-up and hello
    Start,
    /// Reading ECU information
    QueryInfo,
    /// Reading the ECU identification string
    QueryEcuId,
    /// Reading the ECU serial number
    QueryEcuSerial,
    /// Reading DTCs
    ReadDtc,
    /// Ending the session and reading crash data
    EndSession,
    /// Reviewing (and possibly clearing) crash data
    CrashReview,
    /// Clearing DTCs
    ClearDtc,
}

#[derive(Debug, Copy, Clone)]
/// SRS session options
pub struct SrsSessionOptions {
    /// Total time to wait for a reply to a single request, in ms
    pub reply_timeout_ms: u32,
    /// Time to wait for each individual read of the channel while waiting for a reply, in ms
    pub poll_interval_ms: u32,
    /// Write timeout in ms
    pub write_timeout_ms: u32,
}

impl Default for SrsSessionOptions {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 5000,
            poll_interval_ms: 1000,
            write_timeout_ms: 0,
        }
    }
}

/// SRS diagnostic session over a K-Line channel.
///
/// A session wakes the ECU exactly once, before its first frame. Create a new
/// session for each diagnostic run.
#[derive(Debug)]
pub struct SrsSession<C: KLineChannel> {
    channel: C,
    options: SrsSessionOptions,
    first_message: bool,
    cancel: Option<Arc<AtomicBool>>,
    checksum_errors: u32,
}

impl<C: KLineChannel> SrsSession<C> {
    /// Creates a new session over an already opened and configured K-Line channel
    pub fn new(channel: C, options: SrsSessionOptions) -> Self {
        Self {
            channel,
            options,
            first_message: true,
            cancel: None,
            checksum_errors: 0,
        }
    }

    /// Registers a cancellation flag. Once the flag is set, the session ends with
    /// [SrsError::Cancelled] at the next request or between two polls of the channel.
    /// A read that is already waiting is not interrupted
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Returns the current options of the session
    pub fn get_options(&self) -> SrsSessionOptions {
        self.options
    }

    /// Returns a reference to the underlying channel
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Ends the session, handing back the channel so it can be closed
    pub fn into_channel(self) -> C {
        self.channel
    }

    fn check_cancelled(&self, step: SessionStep) -> SrsResult<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => {
                warn!("Session cancelled during {step}");
                Err(SrsError::Cancelled { step })
            }
            _ => Ok(()),
        }
    }

    /// Encodes and sends a packet to the ECU. The ECU is woken up before the
    /// first packet of the session
    pub fn send_packet(&mut self, packet: &HondaPacket) -> SrsResult<()> {
        let frame = codec::encode(packet)?;
        if self.first_message {
            self.first_message = false;
            debug!("First message of session, waking ECU");
            self.channel.wake()?;
        }
        self.channel.clear_rx_buffer()?;
        debug!("Sending frame to ECU: {frame:02X?}");
        self.channel.write_bytes(&frame, self.options.write_timeout_ms)?;
        Ok(())
    }

    /// Waits for a reply frame from the ECU.
    ///
    /// The channel is polled with reads of at most [SrsSessionOptions::poll_interval_ms]
    /// until a frame arrives or [SrsSessionOptions::reply_timeout_ms] has elapsed in total.
    /// Returns `Ok(None)` if nothing arrived in time
    pub fn receive_packet(&mut self, step: SessionStep) -> SrsResult<Option<DecodedFrame>> {
        let budget = Duration::from_millis(self.options.reply_timeout_ms as u64);
        let poll = Duration::from_millis(self.options.poll_interval_ms.max(1) as u64);
        let start = Instant::now();
        while start.elapsed() < budget {
            self.check_cancelled(step)?;
            let wait = poll.min(budget.saturating_sub(start.elapsed()));
            let wait_ms = (wait.as_millis() as u32).max(1);
            match self.channel.read_bytes(MAX_FRAME_LEN, wait_ms)? {
                Some(bytes) if !bytes.is_empty() => {
                    debug!("ECU Response: {bytes:02X?}");
                    let decoded = codec::decode(&bytes)?;
                    if !decoded.checksum_valid {
                        self.checksum_errors += 1;
                        warn!(
                            "Checksum mismatch in reply during {step}. Expected 0x{:02X}, got 0x{:02X}. Using unverified data",
                            decoded.expected_checksum, decoded.received_checksum
                        );
                    }
                    return Ok(Some(decoded));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Sends a command and waits for its reply. A missing or malformed reply is
    /// logged and returned as `None`
    pub fn request(&mut self, step: SessionStep, cmd: SrsCommand) -> SrsResult<Option<HondaPacket>> {
        self.check_cancelled(step)?;
        self.send_packet(&cmd.packet())?;
        match self.receive_packet(step) {
            Ok(Some(reply)) => Ok(Some(reply.packet)),
            Ok(None) => {
                warn!("No reply to {cmd} during {step}, continuing");
                Ok(None)
            }
            Err(SrsError::InvalidFrameLength { len }) => {
                warn!("Malformed reply ({len} bytes) to {cmd} during {step}, continuing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Sends a command that the ECU must answer. If no reply arrives in time,
    /// fails with [SrsError::EcuSilent]
    pub fn request_required(&mut self, step: SessionStep, cmd: SrsCommand) -> SrsResult<HondaPacket> {
        self.check_cancelled(step)?;
        self.send_packet(&cmd.packet())?;
        match self.receive_packet(step)? {
            Some(reply) => Ok(reply.packet),
            None => {
                error!("ECU did not reply to {cmd} during {step}");
                Err(SrsError::EcuSilent { step })
            }
        }
    }

    /// Runs the complete diagnostic session.
    ///
    /// ## Parameters
    /// * table - Fault code descriptions
    /// * decider - Asked whether to clear crash data, if the ECU reports any
    pub fn run<D: CrashReviewDecider>(&mut self, table: &DtcTable, decider: &mut D) -> SrsResult<SrsReport> {
        info!("Starting SRS diagnostic session");
        self.request(SessionStep::Start, SrsCommand::Hello)?;

        let ecu_info = self
            .request_required(SessionStep::QueryInfo, SrsCommand::GetEcuInfo)?
            .payload()
            .to_vec();
        info!("ECU info: {}", hex_string(&ecu_info));

        let ecu_id = ascii_from_payload(
            self.request_required(SessionStep::QueryEcuId, SrsCommand::GetEcuId)?
                .payload(),
        );
        info!("ECU ID: {ecu_id}");

        let ecu_serial = ascii_from_payload(
            self.request_required(SessionStep::QueryEcuSerial, SrsCommand::GetEcuSerial)?
                .payload(),
        );
        info!("ECU serial: {ecu_serial}");

        let dtcs = self.read_dtcs(table)?;
        let no_dtcs_present = dtcs.is_empty();
        if no_dtcs_present {
            info!("No fault codes present");
        }

        let crash_data = self.end_session()?;
        let crash_review = if crash_data.iter().any(|b| *b != 0) {
            self.review_crash_data(&crash_data, decider)?
        } else {
            CrashReviewOutcome::Skipped
        };

        let clear_confirmation = self
            .request_required(SessionStep::ClearDtc, SrsCommand::ClearErrors)?
            .payload()
            .to_vec();
        info!("Clear: {}", hex_string(&clear_confirmation));

        Ok(SrsReport {
            ecu_info,
            ecu_id,
            ecu_serial,
            dtcs,
            no_dtcs_present,
            crash_data,
            crash_review,
            clear_confirmation,
            checksum_errors: self.checksum_errors,
        })
    }

    fn read_dtcs(&mut self, table: &DtcTable) -> SrsResult<Vec<SrsDtc>> {
        let mut dtcs = Vec::new();
        for cmd in DTC_QUERIES {
            let reply = self.request_required(SessionStep::ReadDtc, cmd)?;
            let payload = reply.payload();
            if payload.len() < 2 {
                warn!("DTC reply to {cmd} is only {} bytes long", payload.len());
            }
            let high = payload.first().copied().unwrap_or(0);
            let low = payload.get(1).copied().unwrap_or(0);
            if high != 0 || low != 0 {
                let dtc = SrsDtc::new(high, low, table);
                info!("DTC: {dtc}");
                dtcs.push(dtc);
            }
        }
        Ok(dtcs)
    }

    fn end_session(&mut self) -> SrsResult<Vec<u8>> {
        Ok(self
            .request(SessionStep::EndSession, SrsCommand::EndSession)?
            .map(|p| p.payload().to_vec())
            .unwrap_or_default())
    }

    fn review_crash_data<D: CrashReviewDecider>(
        &mut self,
        crash_data: &[u8],
        decider: &mut D,
    ) -> SrsResult<CrashReviewOutcome> {
        info!("ECU reports crash data: {}", hex_string(crash_data));
        self.check_cancelled(SessionStep::CrashReview)?;
        if !decider.confirm_crash_clear(crash_data) {
            info!("Crash data left as is");
            return Ok(CrashReviewOutcome::LeftAsIs);
        }
        self.request(SessionStep::CrashReview, SrsCommand::Hello)?;
        let ack = self.request(SessionStep::CrashReview, SrsCommand::ClearCrashData)?;
        self.request(SessionStep::CrashReview, SrsCommand::EndSession)?;
        if ack.is_some() {
            info!("Crash data cleared");
            Ok(CrashReviewOutcome::Cleared)
        } else {
            warn!("Crash clear was sent but the ECU did not acknowledge it");
            Ok(CrashReviewOutcome::ClearUnconfirmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelError,
        hardware::simulation::{ChannelEvent, SimulationKLineChannel},
        honda::{KeepCrashData, encode},
    };

    fn fast_options() -> SrsSessionOptions {
        SrsSessionOptions {
            reply_timeout_ms: 40,
            poll_interval_ms: 10,
            write_timeout_ms: 0,
        }
    }

    fn frame(header: u8, payload: &[u8]) -> Vec<u8> {
        encode(&HondaPacket::new(header, payload).unwrap()).unwrap()
    }

    fn req(cmd: SrsCommand) -> Vec<u8> {
        encode(&cmd.packet()).unwrap()
    }

    fn healthy_ecu(crash: &[u8]) -> SimulationKLineChannel {
        ecu_ignoring(crash, &[])
    }

    /// Healthy ECU that never answers the commands in `silent`
    fn ecu_ignoring(crash: &[u8], silent: &[SrsCommand]) -> SimulationKLineChannel {
        let script: [(SrsCommand, &[u8]); 10] = [
            (SrsCommand::Hello, &[0x00]),
            (SrsCommand::GetEcuInfo, &[0x70, 0x0F, 0x1C]),
            (SrsCommand::GetEcuId, b"77960\0"),
            (SrsCommand::GetEcuSerial, b"SN01"),
            (SrsCommand::ReadDtc1, &[0x53, 0x89]),
            (SrsCommand::ReadDtc2, &[0x00, 0x00]),
            (SrsCommand::ReadDtc3, &[0x00, 0x00]),
            (SrsCommand::EndSession, crash),
            (SrsCommand::ClearCrashData, &[0x02]),
            (SrsCommand::ClearErrors, &[0x01]),
        ];
        let mut ch = SimulationKLineChannel::new();
        for (cmd, payload) in script {
            if !silent.contains(&cmd) {
                ch.add_response(&req(cmd), &frame(0x02, payload));
            }
        }
        ch
    }

    #[test]
    fn full_session() {
        let mut table = DtcTable::new();
        table.push("5x-89", "Passenger airbag initiator");
        let mut session = SrsSession::new(healthy_ecu(&[0x00, 0x00]), fast_options());
        let report = session
            .run(&table, &mut |_: &[u8]| -> bool { panic!("no crash data expected") })
            .unwrap();

        assert_eq!(report.ecu_info, vec![0x70, 0x0F, 0x1C]);
        assert_eq!(report.ecu_id, "77960");
        assert_eq!(report.ecu_serial, "SN01");
        assert_eq!(report.dtcs.len(), 1);
        assert_eq!(report.dtcs[0].code, "53-89");
        assert_eq!(report.dtcs[0].description, "Passenger airbag initiator");
        assert!(!report.no_dtcs_present);
        assert_eq!(report.crash_review, CrashReviewOutcome::Skipped);
        assert_eq!(report.clear_confirmation, vec![0x01]);
        assert_eq!(report.checksum_errors, 0);
    }

    #[test]
    fn wakes_exactly_once_before_first_write() {
        let mut session = SrsSession::new(healthy_ecu(&[0x01]), fast_options());
        session.run(&DtcTable::new(), &mut |_: &[u8]| true).unwrap();
        let events = session.into_channel().events().to_vec();
        let wakes: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == ChannelEvent::Wake)
            .map(|(i, _)| i)
            .collect();
        let first_write = events
            .iter()
            .position(|e| matches!(e, ChannelEvent::Write(_)))
            .unwrap();
        assert_eq!(wakes.len(), 1);
        assert!(wakes[0] < first_write);
    }

    #[test]
    fn crash_data_cleared_on_confirm() {
        let mut seen = Vec::new();
        let mut session = SrsSession::new(healthy_ecu(&[0x00, 0x04]), fast_options());
        let report = session
            .run(&DtcTable::new(), &mut |d: &[u8]| {
                seen = d.to_vec();
                true
            })
            .unwrap();
        assert_eq!(seen, vec![0x00, 0x04]);
        assert_eq!(report.crash_review, CrashReviewOutcome::Cleared);
        let writes = session.into_channel().written_frames();
        let tail: Vec<Vec<u8>> = writes[writes.len() - 5..].to_vec();
        assert_eq!(
            tail,
            vec![
                req(SrsCommand::EndSession),
                req(SrsCommand::Hello),
                req(SrsCommand::ClearCrashData),
                req(SrsCommand::EndSession),
                req(SrsCommand::ClearErrors),
            ]
        );
    }

    #[test]
    fn crash_data_kept_on_decline() {
        let mut session = SrsSession::new(healthy_ecu(&[0x04]), fast_options());
        let report = session.run(&DtcTable::new(), &mut KeepCrashData).unwrap();
        assert_eq!(report.crash_review, CrashReviewOutcome::LeftAsIs);
        let writes = session.into_channel().written_frames();
        assert!(!writes.contains(&req(SrsCommand::ClearCrashData)));
        assert_eq!(writes.last(), Some(&req(SrsCommand::ClearErrors)));
    }

    #[test]
    fn unacknowledged_crash_clear_is_reported() {
        let ecu = ecu_ignoring(&[0x00, 0x04], &[SrsCommand::ClearCrashData]);
        let mut session = SrsSession::new(ecu, fast_options());
        let report = session.run(&DtcTable::new(), &mut |_: &[u8]| true).unwrap();
        assert_eq!(report.crash_review, CrashReviewOutcome::ClearUnconfirmed);
        assert_eq!(report.clear_confirmation, vec![0x01]);
        assert!(report.to_string().contains("crash data clear not acknowledged"));
    }

    #[test]
    fn unplugged_adapter_aborts_session() {
        let mut ecu = healthy_ecu(&[]);
        ecu.set_fail_writes(true);
        let mut session = SrsSession::new(ecu, fast_options());
        match session.run(&DtcTable::new(), &mut KeepCrashData) {
            Err(SrsError::ChannelError(ChannelError::APIError { code: 1, .. })) => {}
            other => panic!("unexpected result {other:?}"),
        }
        assert!(session.channel().written_frames().is_empty());
    }

    #[test]
    fn silent_ecu_stops_at_query_info() {
        let mut session = SrsSession::new(SimulationKLineChannel::new(), fast_options());
        match session.run(&DtcTable::new(), &mut KeepCrashData) {
            Err(SrsError::EcuSilent { step }) => assert_eq!(step, SessionStep::QueryInfo),
            other => panic!("unexpected result {other:?}"),
        }
        let ch = session.into_channel();
        assert_eq!(
            ch.written_frames(),
            vec![req(SrsCommand::Hello), req(SrsCommand::GetEcuInfo)]
        );
        // Reply wait is made of several short polls, not one long read
        assert!(ch.read_count() > 2);
    }

    #[test]
    fn cancel_flag_stops_session() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut session = SrsSession::new(healthy_ecu(&[]), fast_options()).with_cancel_flag(flag);
        match session.run(&DtcTable::new(), &mut KeepCrashData) {
            Err(SrsError::Cancelled { step }) => assert_eq!(step, SessionStep::Start),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(session.channel().written_frames().is_empty());
    }
}
