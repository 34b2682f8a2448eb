use superchis_burner::ErrorKind;

pub const EXIT_OK: i32 = 0;
pub const EXIT_NO_DEVICE: i32 = 10;
pub const EXIT_INVALID_INPUT: i32 = 11;
pub const EXIT_CHECK_FAILED: i32 = 12;
pub const EXIT_WRITE_FAILED: i32 = 13;
pub const EXIT_DEVICE_BUSY: i32 = 14;
pub const EXIT_AMBIGUOUS: i32 = 15;
pub const EXIT_TRANSPORT: i32 = 16;
pub const EXIT_UNEXPECTED: i32 = 20;

pub fn for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::NoDevice => EXIT_NO_DEVICE,
        ErrorKind::DeviceBusy => EXIT_DEVICE_BUSY,
        ErrorKind::Transport | ErrorKind::DeviceLost | ErrorKind::Protocol => EXIT_TRANSPORT,
        ErrorKind::UnsupportedChip | ErrorKind::PpbUnlockFailed => EXIT_CHECK_FAILED,
        ErrorKind::EraseTimeout | ErrorKind::ProgramTimeout | ErrorKind::VerifyMismatch => {
            EXIT_WRITE_FAILED
        }
        ErrorKind::Io => EXIT_INVALID_INPUT,
        ErrorKind::Cancelled | ErrorKind::Unexpected => EXIT_UNEXPECTED,
    }
}
