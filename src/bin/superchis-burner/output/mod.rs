use std::collections::BTreeMap;

use crate::cli;

use superchis_burner::device::DeviceInfo;
use superchis_burner::flash::FlashDescriptor;
use superchis_burner::quality::CheckStatus;
use superchis_burner::{DeviceId, OperationEvent, WorkOutcome};

pub mod human;
pub mod json;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub verbose: bool,
    pub quiet: bool,
    pub json_timestamps: bool,
    pub json_progress: JsonProgressMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonProgressMode {
    Chunks,
    Percent,
    None,
}

/// A burner as shown by `list`, optionally probed for its flash chip.
#[derive(Debug, Clone)]
pub struct ListedDevice {
    pub info: DeviceInfo,
    pub flash: Option<FlashDescriptor>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Operation(OperationEvent),
    Outcome {
        device: DeviceId,
        outcome: WorkOutcome,
    },
    DeviceError {
        device: DeviceId,
        code: i32,
        message: String,
    },
    OperationSummary(OperationSummary),
    ListDevices(Vec<ListedDevice>),
    Error {
        code: i32,
        message: String,
    },
    HintAmbiguousDevices(Vec<DeviceInfo>),
}

#[derive(Debug, Clone)]
pub struct OperationSummary {
    pub operation: &'static str,
    pub exit_code: i32,
    pub message: Option<String>,

    pub devices_ok: Vec<String>,
    pub devices_failed: Vec<String>,

    pub bytes_written: u64,
    pub bytes_read: u64,
    pub sectors_erased: u64,
    pub checks_failed: u64,
}

/// Folds the event stream into an [`OperationSummary`].
pub struct OperationRecorder {
    operation: &'static str,
    /// Per device: did every operation on it succeed.
    devices: BTreeMap<String, bool>,
    written: BTreeMap<DeviceId, u64>,
    read: BTreeMap<DeviceId, u64>,
    sectors_erased: u64,
    checks_failed: u64,
}

impl OperationRecorder {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            devices: BTreeMap::new(),
            written: BTreeMap::new(),
            read: BTreeMap::new(),
            sectors_erased: 0,
            checks_failed: 0,
        }
    }

    pub fn observe(&mut self, ev: &OperationEvent) {
        match ev {
            OperationEvent::OperationDone { device, ok, .. } => {
                self.record(device, *ok);
            }
            OperationEvent::Write {
                device, written, ..
            } => {
                let e = self.written.entry(device.clone()).or_default();
                *e = (*e).max(*written);
            }
            OperationEvent::Read { device, read, .. } => {
                let e = self.read.entry(device.clone()).or_default();
                *e = (*e).max(*read);
            }
            OperationEvent::SectorErased { .. } => {
                self.sectors_erased = self.sectors_erased.saturating_add(1);
            }
            OperationEvent::CheckDone { result, .. } if result.status == CheckStatus::Fail => {
                self.checks_failed = self.checks_failed.saturating_add(1);
            }
            _ => {}
        }
    }

    /// A device that failed before any worker ran on it.
    pub fn device_failed(&mut self, device: &DeviceId) {
        self.record(device, false);
    }

    fn record(&mut self, device: &DeviceId, ok: bool) {
        self.devices
            .entry(device.to_string())
            .and_modify(|all_ok| *all_ok &= ok)
            .or_insert(ok);
    }

    pub fn finish(self, exit_code: i32, message: Option<String>) -> OperationSummary {
        let (ok, failed): (Vec<_>, Vec<_>) = self.devices.into_iter().partition(|(_, ok)| *ok);
        OperationSummary {
            operation: self.operation,
            exit_code,
            message,
            devices_ok: ok.into_iter().map(|(id, _)| id).collect(),
            devices_failed: failed.into_iter().map(|(id, _)| id).collect(),
            bytes_written: self.written.values().sum(),
            bytes_read: self.read.values().sum(),
            sectors_erased: self.sectors_erased,
            checks_failed: self.checks_failed,
        }
    }
}

pub trait Reporter {
    fn emit(&mut self, event: Event);
    fn finish(&mut self);
}

pub fn make(args: &cli::OutputArgs) -> Box<dyn Reporter> {
    let json_progress = match args.json_progress {
        cli::JsonProgressArg::Chunks => JsonProgressMode::Chunks,
        cli::JsonProgressArg::Percent => JsonProgressMode::Percent,
        cli::JsonProgressArg::None => JsonProgressMode::None,
    };
    let opts = OutputOptions {
        verbose: args.verbose,
        quiet: args.quiet,
        json_timestamps: args.json_timestamps,
        json_progress,
    };
    if args.json {
        Box::new(json::JsonOutput::new(opts))
    } else {
        Box::new(human::HumanOutput::new(opts))
    }
}

pub fn make_for_list(args: &cli::ListArgs) -> Box<dyn Reporter> {
    let opts = OutputOptions {
        verbose: false,
        quiet: false,
        json_timestamps: false,
        json_progress: JsonProgressMode::Chunks,
    };
    if args.json {
        Box::new(json::JsonOutput::new(opts))
    } else {
        Box::new(human::HumanOutput::new(opts))
    }
}

pub fn device_to_value(index: usize, info: &DeviceInfo) -> serde_json::Value {
    let mut v = serde_json::to_value(info)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(obj) = &mut v {
        obj.insert("index".to_string(), serde_json::Value::from(index as u64));
    }
    v
}

pub fn format_device_line(index: usize, info: &DeviceInfo) -> String {
    format!(
        "[{index}] {} {:04X}:{:04X} {}",
        info.id,
        info.vid,
        info.pid,
        info.serial_number
            .as_deref()
            .or(info.product.as_deref())
            .unwrap_or("")
    )
    .trim_end()
    .to_string()
}

pub fn format_flash_line(d: &FlashDescriptor) -> String {
    format!(
        "flash {:04X}:{:04X} {} MiB, {} sectors{}",
        d.chip_id.manufacturer,
        d.chip_id.device[0],
        d.total_size / (1024 * 1024),
        d.sector_count(),
        if d.buffer_write {
            format!(", {} byte write buffer", d.buffer_max)
        } else {
            String::new()
        }
    )
}
