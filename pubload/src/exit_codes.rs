#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// The run finished but some workers failed or had to be abandoned (`--fail-on-degraded`).
    Degraded = 10,

    /// Invalid CLI/config/options (bad flags, non-positive rate, unreadable run file, etc.).
    InvalidInput = 30,

    /// The run could not be carried out (task construction failed, report sink failed, ...).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_report(report: &pubload_core::RunReport, fail_on_degraded: bool) -> Self {
        if fail_on_degraded && report.is_degraded() {
            Self::Degraded
        } else {
            Self::Success
        }
    }
}
