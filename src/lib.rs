//! Quality-check and mass-production engine for SuperChis cartridge burners.
//!
//! Layers, bottom up: [`transport`] moves bytes, [`protocol`] speaks the
//! burner's framed command set and the AMD flash sequences on top of it,
//! [`device`] pairs an open burner with its [`flash::FlashDescriptor`], the
//! [`quality`], [`production`] and [`maintenance`] modules run one operation
//! on one device, and [`coordinator`] owns every device and runs operations
//! on worker threads.

pub mod cartridge;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod flash;
pub mod maintenance;
pub mod operation;
pub mod poll;
pub mod production;
pub mod protocol;
pub mod quality;
pub mod scanner;
pub mod selector;
pub mod sim;
pub mod transport;

pub use coordinator::{BatchResult, Coordinator, CoordinatorError, CoordinatorOptions, Work, WorkOutcome};
pub use device::{ConnectionState, DeviceId, DeviceInfo};
pub use error::ErrorKind;
pub use operation::{CancelToken, Failure, OperationEvent, OperationKind};
