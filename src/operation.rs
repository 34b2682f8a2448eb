use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::device::{ConnectionState, DeviceId, DeviceInfo};
use crate::error::ErrorKind;
use crate::flash::FlashDescriptor;
use crate::protocol::ProtocolError;
use crate::quality::{CheckName, CheckResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    QualityCheck,
    Production,
    ResetNor,
    Backup,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::QualityCheck => "quality_check",
            OperationKind::Production => "production",
            OperationKind::ResetNor => "reset_nor",
            OperationKind::Backup => "backup",
        }
    }
}

/// Everything the engine reports while it runs. Events are immutable
/// snapshots; consumers never share state with the workers that emit them.
#[derive(Debug, Clone)]
pub enum OperationEvent {
    DeviceAppeared {
        info: DeviceInfo,
    },
    DeviceRemoved {
        device: DeviceId,
    },
    ConnectionChanged {
        device: DeviceId,
        state: ConnectionState,
    },
    FlashIdentified {
        device: DeviceId,
        descriptor: FlashDescriptor,
    },

    OperationStart {
        device: DeviceId,
        operation: OperationKind,
    },

    CheckStart {
        device: DeviceId,
        check: CheckName,
    },
    CheckDone {
        device: DeviceId,
        result: CheckResult,
    },

    HeaderMatched {
        device: DeviceId,
    },
    EraseStart {
        device: DeviceId,
        sectors: usize,
        bytes: u64,
    },
    SectorErased {
        device: DeviceId,
        index: usize,
        total: usize,
        offset: u64,
    },
    Write {
        device: DeviceId,
        written: u64,
        total: u64,
    },
    VerifyStart {
        device: DeviceId,
        total: u64,
    },
    Read {
        device: DeviceId,
        read: u64,
        total: u64,
    },

    OperationDone {
        device: DeviceId,
        operation: OperationKind,
        ok: bool,
        message: Option<String>,
    },
}

impl OperationEvent {
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            OperationEvent::DeviceAppeared { info } => Some(&info.id),
            OperationEvent::DeviceRemoved { device }
            | OperationEvent::ConnectionChanged { device, .. }
            | OperationEvent::FlashIdentified { device, .. }
            | OperationEvent::OperationStart { device, .. }
            | OperationEvent::CheckStart { device, .. }
            | OperationEvent::CheckDone { device, .. }
            | OperationEvent::HeaderMatched { device }
            | OperationEvent::EraseStart { device, .. }
            | OperationEvent::SectorErased { device, .. }
            | OperationEvent::Write { device, .. }
            | OperationEvent::VerifyStart { device, .. }
            | OperationEvent::Read { device, .. }
            | OperationEvent::OperationDone { device, .. } => Some(device),
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    lost: AtomicBool,
}

/// Shared flag a caller uses to stop a worker between protocol steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// The device was removed from the bus while the worker held it.
    pub fn mark_lost(&self) {
        self.inner.lost.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    /// Called by workers between steps, never inside a hardware command.
    pub fn checkpoint(&self) -> Result<(), StepError> {
        if self.is_lost() {
            return Err(StepError::DeviceLost);
        }
        if self.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        Ok(())
    }

    /// Transport failures on a device known to be gone are reported as loss.
    pub fn classify(&self, err: StepError) -> StepError {
        match err {
            StepError::Protocol(ProtocolError::Transport(_)) if self.is_lost() => {
                StepError::DeviceLost
            }
            other => other,
        }
    }
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("verify mismatch at 0x{offset:08X}: expected 0x{expected:02X}, read 0x{actual:02X}")]
    VerifyMismatch { offset: u64, expected: u8, actual: u8 },

    #[error("image of {len} bytes does not fit the {capacity} byte flash")]
    ImageTooLarge { len: u64, capacity: u64 },

    #[error("device lost")]
    DeviceLost,

    #[error("cancelled")]
    Cancelled,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Protocol(e) => e.kind(),
            StepError::VerifyMismatch { .. } => ErrorKind::VerifyMismatch,
            StepError::ImageTooLarge { .. } => ErrorKind::Unexpected,
            StepError::DeviceLost => ErrorKind::DeviceLost,
            StepError::Cancelled => ErrorKind::Cancelled,
            StepError::Io(_) => ErrorKind::Io,
        }
    }

    /// After a fatal error no further step is attempted on the device.
    pub fn is_fatal(&self) -> bool {
        match self {
            StepError::Protocol(e) => e.is_fatal(),
            StepError::DeviceLost | StepError::Cancelled | StepError::Io(_) => true,
            StepError::VerifyMismatch { .. } | StepError::ImageTooLarge { .. } => false,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self {
            StepError::VerifyMismatch { offset, .. } => Some(*offset),
            StepError::Protocol(ProtocolError::EraseTimeout { addr, .. })
            | StepError::Protocol(ProtocolError::ProgramTimeout { addr, .. })
            | StepError::Protocol(ProtocolError::ProgramFailed { addr, .. }) => Some(*addr),
            StepError::Protocol(ProtocolError::PpbUnlockFailed { sector }) => Some(*sector),
            _ => None,
        }
    }
}

/// Structured failure detail carried in reports and outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            offset: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl From<&StepError> for Failure {
    fn from(e: &StepError) -> Self {
        Self {
            kind: e.kind(),
            offset: e.offset(),
            message: e.to_string(),
        }
    }
}

/// First differing byte between `actual` and `expected`, as an absolute
/// offset from `base`.
pub(crate) fn first_mismatch(base: u64, expected: &[u8], actual: &[u8]) -> Option<StepError> {
    expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a)
        .map(|i| StepError::VerifyMismatch {
            offset: base + i as u64,
            expected: expected[i],
            actual: actual[i],
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    #[test]
    fn checkpoint_prefers_loss_over_cancel() {
        let t = CancelToken::new();
        assert!(t.checkpoint().is_ok());
        t.cancel();
        assert!(matches!(t.checkpoint(), Err(StepError::Cancelled)));
        t.mark_lost();
        assert!(matches!(t.checkpoint(), Err(StepError::DeviceLost)));
    }

    #[test]
    fn transport_error_on_lost_device_is_device_lost() {
        let t = CancelToken::new();
        let err = || StepError::from(ProtocolError::from(TransportError::Timeout));
        assert_eq!(t.classify(err()).kind(), ErrorKind::Transport);
        t.mark_lost();
        assert_eq!(t.classify(err()).kind(), ErrorKind::DeviceLost);
    }

    #[test]
    fn mismatch_reports_absolute_offset() {
        let e = first_mismatch(0x1000, &[1, 2, 3], &[1, 2, 4]).unwrap();
        let f = Failure::from(&e);
        assert_eq!(f.kind, ErrorKind::VerifyMismatch);
        assert_eq!(f.offset, Some(0x1002));
        assert!(first_mismatch(0, &[1], &[1]).is_none());
    }
}
