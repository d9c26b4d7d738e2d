//! Operator decision on whether to clear the crash data of the ECU.
//!
//! When the end of session reply carries crash data, the session asks a
//! [CrashReviewDecider] whether the crash flag should be cleared. How the answer
//! is obtained (console prompt, GUI dialog, fixed policy) is up to the caller.

/// Decides whether crash data stored in the ECU should be cleared
pub trait CrashReviewDecider {
    /// Called with the raw crash data bytes reported by the ECU.
    /// Return true to clear the crash flag, false to leave the ECU untouched
    fn confirm_crash_clear(&mut self, crash_data: &[u8]) -> bool;
}

impl<F: FnMut(&[u8]) -> bool> CrashReviewDecider for F {
    fn confirm_crash_clear(&mut self, crash_data: &[u8]) -> bool {
        self(crash_data)
    }
}

/// Decider that never clears crash data
#[derive(Debug, Copy, Clone, Default)]
pub struct KeepCrashData;

impl CrashReviewDecider for KeepCrashData {
    #[inline(always)]
    fn confirm_crash_clear(&mut self, _crash_data: &[u8]) -> bool {
        false
    }
}
