use serde::Serialize;

/// Coarse failure category shared by every engine error, used by front-ends
/// to pick a diagnostic or exit code without matching on protocol details.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    UnsupportedChip,
    EraseTimeout,
    ProgramTimeout,
    PpbUnlockFailed,
    VerifyMismatch,
    DeviceBusy,
    DeviceLost,
    Cancelled,
    NoDevice,
    Io,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::UnsupportedChip => "unsupported_chip",
            ErrorKind::EraseTimeout => "erase_timeout",
            ErrorKind::ProgramTimeout => "program_timeout",
            ErrorKind::PpbUnlockFailed => "ppb_unlock_failed",
            ErrorKind::VerifyMismatch => "verify_mismatch",
            ErrorKind::DeviceBusy => "device_busy",
            ErrorKind::DeviceLost => "device_lost",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NoDevice => "no_device",
            ErrorKind::Io => "io",
            ErrorKind::Unexpected => "unexpected",
        }
    }

    /// Whether the device should be considered gone after this failure.
    pub fn drops_connection(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::DeviceLost)
    }
}
