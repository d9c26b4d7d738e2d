//! Result of a complete SRS diagnostic session

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::{dtc::SrsDtc, helpers::hex_string};

/// What happened to crash data reported by the ECU
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum CrashReviewOutcome {
    /// The ECU reported no crash data, so there was nothing to review
    #[strum(serialize = "no crash data")]
    Skipped,
    /// Crash data was present, the operator chose to clear it and the ECU
    /// acknowledged the clear request
    #[strum(serialize = "crash data cleared")]
    Cleared,
    /// The clear request was sent but the ECU never answered it. The crash
    /// data may still be stored
    #[strum(serialize = "crash data clear not acknowledged")]
    ClearUnconfirmed,
    /// Crash data was present and the operator chose to keep it
    #[strum(serialize = "crash data left as is")]
    LeftAsIs,
}

/// Structured report of an SRS diagnostic session
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SrsReport {
    /// Raw reply to the ECU information request
    pub ecu_info: Vec<u8>,
    /// ECU identification string
    pub ecu_id: String,
    /// ECU serial number
    pub ecu_serial: String,
    /// Active fault codes, in the order they were read
    pub dtcs: Vec<SrsDtc>,
    /// Set when every DTC slot was empty
    pub no_dtcs_present: bool,
    /// Raw crash data from the end of session reply. Empty if the ECU did not reply
    pub crash_data: Vec<u8>,
    /// Outcome of the crash review
    pub crash_review: CrashReviewOutcome,
    /// Raw reply to the DTC clear request
    pub clear_confirmation: Vec<u8>,
    /// Number of replies whose checksum did not verify
    pub checksum_errors: u32,
}

impl SrsReport {
    /// ECU information formatted as hex
    pub fn ecu_info_hex(&self) -> String {
        hex_string(&self.ecu_info)
    }
}

impl std::fmt::Display for SrsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ECU info: {}", self.ecu_info_hex())?;
        writeln!(f, "ECU ID: {}", self.ecu_id)?;
        writeln!(f, "ECU serial: {}", self.ecu_serial)?;
        if self.no_dtcs_present {
            writeln!(f, "No fault codes present")?;
        } else {
            for dtc in &self.dtcs {
                writeln!(f, "DTC: {dtc}")?;
            }
        }
        if !self.crash_data.is_empty() {
            writeln!(f, "Crash data: {}", hex_string(&self.crash_data))?;
        }
        writeln!(f, "Crash review: {}", self.crash_review)?;
        write!(f, "Clear: {}", hex_string(&self.clear_confirmation))?;
        if self.checksum_errors != 0 {
            write!(f, "\n{} replies failed checksum verification", self.checksum_errors)?;
        }
        Ok(())
    }
}
