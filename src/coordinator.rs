//! Owned registry of burners and their workers.
//!
//! The coordinator is the only owner of [`Device`] values. Starting an
//! operation moves the device into a worker thread; joining the worker moves
//! it back. A device that is out on a worker is `Busy` and cannot be handed
//! out again, so two workers never share a device.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::device::{self, ConnectionState, Connector, Device, DeviceId, DeviceInfo};
use crate::error::ErrorKind;
use crate::flash::FlashDescriptor;
use crate::maintenance;
use crate::operation::{CancelToken, Failure, OperationEvent, OperationKind, StepError};
use crate::production::{JobOutcome, ProductionJob, ProductionOptions};
use crate::protocol::{ProtocolError, ProtocolOptions};
use crate::quality::{self, QualityCheckConfig, QualityCheckReport};
use crate::scanner::ScanEvent;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub protocol: ProtocolOptions,
    pub quality: QualityCheckConfig,
    pub production: ProductionOptions,
    /// Delay between worker starts in a batch, to spread USB inrush.
    pub batch_stagger: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolOptions::default(),
            quality: QualityCheckConfig::default(),
            production: ProductionOptions::default(),
            batch_stagger: Duration::from_millis(500),
        }
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("device {0} is not connected")]
    NotConnected(DeviceId),

    #[error("device {0} is busy")]
    DeviceBusy(DeviceId),

    #[error("device {0} has no running operation")]
    Idle(DeviceId),

    #[error("device {device}: {source}")]
    Protocol {
        device: DeviceId,
        #[source]
        source: ProtocolError,
    },

    #[error("worker for {0} panicked")]
    WorkerPanicked(DeviceId),

    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::UnknownDevice(_) | CoordinatorError::NotConnected(_) => {
                ErrorKind::NoDevice
            }
            CoordinatorError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            CoordinatorError::Protocol { source, .. } => source.kind(),
            CoordinatorError::Idle(_) | CoordinatorError::WorkerPanicked(_) => {
                ErrorKind::Unexpected
            }
            CoordinatorError::Spawn(_) => ErrorKind::Io,
        }
    }
}

/// What a worker is asked to do.
#[derive(Debug, Clone)]
pub enum Work {
    QualityCheck,
    Production(Arc<[u8]>),
    ResetNor,
    Backup { path: PathBuf, limit: u64 },
}

impl Work {
    pub fn kind(&self) -> OperationKind {
        match self {
            Work::QualityCheck => OperationKind::QualityCheck,
            Work::Production(_) => OperationKind::Production,
            Work::ResetNor => OperationKind::ResetNor,
            Work::Backup { .. } => OperationKind::Backup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Terminal result of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    QualityCheck(QualityCheckReport),
    Production(JobOutcome),
    ResetNor(Result<(), Failure>),
    Backup(Result<BackupSummary, Failure>),
}

impl WorkOutcome {
    pub fn operation(&self) -> OperationKind {
        match self {
            WorkOutcome::QualityCheck(_) => OperationKind::QualityCheck,
            WorkOutcome::Production(_) => OperationKind::Production,
            WorkOutcome::ResetNor(_) => OperationKind::ResetNor,
            WorkOutcome::Backup(_) => OperationKind::Backup,
        }
    }

    pub fn is_ok(&self) -> bool {
        match self {
            WorkOutcome::QualityCheck(r) => r.passed(),
            WorkOutcome::Production(o) => o.is_ok(),
            WorkOutcome::ResetNor(r) => r.is_ok(),
            WorkOutcome::Backup(r) => r.is_ok(),
        }
    }

    /// The failure that decided the outcome, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            WorkOutcome::QualityCheck(r) => r
                .aborted
                .as_ref()
                .or_else(|| r.failed_checks().find_map(|c| c.failure.as_ref())),
            WorkOutcome::Production(JobOutcome::Failed(f)) => Some(f),
            WorkOutcome::Production(_) => None,
            WorkOutcome::ResetNor(r) => r.as_ref().err(),
            WorkOutcome::Backup(r) => r.as_ref().err(),
        }
    }

    fn summary(&self) -> Option<String> {
        match self {
            WorkOutcome::QualityCheck(r) if !r.passed() => Some(r.diagnostics.join("; ")),
            WorkOutcome::Production(o) => Some(o.as_str().to_string()),
            WorkOutcome::Backup(Ok(b)) => Some(format!("{} bytes", b.bytes)),
            _ => self.failure().map(|f| f.message.clone()),
        }
    }
}

/// Per-device results of a batch, reported once every worker has ended.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub outcomes: BTreeMap<DeviceId, Result<WorkOutcome, CoordinatorError>>,
}

impl BatchResult {
    pub fn ok_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|r| matches!(r, Ok(o) if o.is_ok()))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.ok_count()
    }

    pub fn all_ok(&self) -> bool {
        self.failed_count() == 0
    }
}

struct Worker {
    kind: OperationKind,
    cancel: CancelToken,
    handle: JoinHandle<(Device, WorkOutcome)>,
}

enum Slot {
    Disconnected,
    Connected(Device),
    Busy(Worker),
}

impl Slot {
    fn state(&self) -> ConnectionState {
        match self {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connected(_) => ConnectionState::Connected,
            Slot::Busy(_) => ConnectionState::Busy,
        }
    }
}

struct Entry {
    info: DeviceInfo,
    slot: Slot,
    /// Unplugged while a worker held it; dropped once the worker is reaped.
    removed: bool,
}

pub struct Coordinator {
    connector: Arc<dyn Connector>,
    opts: CoordinatorOptions,
    entries: BTreeMap<DeviceId, Entry>,
    events: Sender<OperationEvent>,
}

impl Coordinator {
    pub fn new(
        connector: Arc<dyn Connector>,
        opts: CoordinatorOptions,
        events: Sender<OperationEvent>,
    ) -> Self {
        Self {
            connector,
            opts,
            entries: BTreeMap::new(),
            events,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.opts
    }

    fn emit(&self, ev: OperationEvent) {
        // A consumer that went away must not stall the engine.
        let _ = self.events.send(ev);
    }

    fn set_slot(&mut self, id: &DeviceId, slot: Slot) {
        let state = slot.state();
        if let Some(e) = self.entries.get_mut(id) {
            e.slot = slot;
        }
        self.emit(OperationEvent::ConnectionChanged {
            device: id.clone(),
            state,
        });
    }

    fn entry(&mut self, id: &DeviceId) -> Result<&mut Entry, CoordinatorError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::UnknownDevice(id.clone()))
    }

    // --- registry ----------------------------------------------------------

    pub fn add_device(&mut self, info: DeviceInfo) {
        let id = info.id.clone();
        match self.entries.get_mut(&id) {
            Some(e) => {
                e.info = info.clone();
                e.removed = false;
            }
            None => {
                self.entries.insert(
                    id,
                    Entry {
                        info: info.clone(),
                        slot: Slot::Disconnected,
                        removed: false,
                    },
                );
            }
        }
        self.emit(OperationEvent::DeviceAppeared { info });
    }

    /// Forgets a device that left the bus. A worker holding it is told the
    /// device is lost and the entry goes away when that worker is reaped.
    pub fn remove_device(&mut self, id: &DeviceId) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        match &entry.slot {
            Slot::Busy(w) => {
                tracing::warn!(device = %id, "device removed during {}", w.kind.as_str());
                w.cancel.mark_lost();
                entry.removed = true;
            }
            _ => {
                self.entries.remove(id);
            }
        }
        self.emit(OperationEvent::DeviceRemoved { device: id.clone() });
    }

    pub fn apply_scan(&mut self, ev: ScanEvent) {
        match ev {
            ScanEvent::Appeared(info) => self.add_device(info),
            ScanEvent::Removed { id } => self.remove_device(&id),
        }
    }

    pub fn state(&self, id: &DeviceId) -> Option<ConnectionState> {
        self.entries.get(id).map(|e| e.slot.state())
    }

    pub fn devices(&self) -> Vec<(DeviceInfo, ConnectionState)> {
        self.entries
            .values()
            .filter(|e| !e.removed)
            .map(|e| (e.info.clone(), e.slot.state()))
            .collect()
    }

    pub fn connected_ids(&self) -> Vec<DeviceId> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.removed && !matches!(e.slot, Slot::Disconnected))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Workers not yet reaped, including those on removed devices.
    pub fn busy_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.slot, Slot::Busy(_)))
            .count()
    }

    /// Devices with an unreaped worker, including removed ones.
    pub fn busy_ids(&self) -> Vec<DeviceId> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e.slot, Slot::Busy(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    // --- connection --------------------------------------------------------

    pub fn connect(&mut self, id: &DeviceId) -> Result<(), CoordinatorError> {
        let entry = self.entry(id)?;
        let info = match entry.slot {
            Slot::Busy(_) => return Err(CoordinatorError::DeviceBusy(id.clone())),
            Slot::Connected(_) => return Ok(()),
            Slot::Disconnected => entry.info.clone(),
        };

        let dev = device::connect(self.connector.as_ref(), info, self.opts.protocol.clone())
            .map_err(|source| CoordinatorError::Protocol {
                device: id.clone(),
                source,
            })?;
        self.set_slot(id, Slot::Connected(dev));
        Ok(())
    }

    pub fn connect_all(&mut self) -> BTreeMap<DeviceId, Result<(), CoordinatorError>> {
        let ids: Vec<DeviceId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.removed && matches!(e.slot, Slot::Disconnected))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .map(|id| {
                let r = self.connect(&id);
                (id, r)
            })
            .collect()
    }

    pub fn disconnect(&mut self, id: &DeviceId) -> Result<(), CoordinatorError> {
        let entry = self.entry(id)?;
        if matches!(entry.slot, Slot::Busy(_)) {
            return Err(CoordinatorError::DeviceBusy(id.clone()));
        }
        self.set_slot(id, Slot::Disconnected);
        Ok(())
    }

    /// Flash geometry of an idle connected device, querying it if needed.
    pub fn query_flash(&mut self, id: &DeviceId) -> Result<FlashDescriptor, CoordinatorError> {
        let entry = self.entry(id)?;
        let dev = match &mut entry.slot {
            Slot::Busy(_) => return Err(CoordinatorError::DeviceBusy(id.clone())),
            Slot::Disconnected => return Err(CoordinatorError::NotConnected(id.clone())),
            Slot::Connected(dev) => dev,
        };
        let known = dev.descriptor().is_some();
        let entered = if known {
            Ok(())
        } else {
            dev.protocol_mut().enter_flash_mode()
        };
        let queried = match entered {
            Ok(()) => dev.flash(),
            Err(e) => Err(e),
        };
        match queried {
            Ok((_, d)) => {
                let d = d.clone();
                if !known {
                    self.emit(OperationEvent::FlashIdentified {
                        device: id.clone(),
                        descriptor: d.clone(),
                    });
                }
                Ok(d)
            }
            Err(source) => {
                if source.kind().drops_connection() {
                    self.set_slot(id, Slot::Disconnected);
                }
                Err(CoordinatorError::Protocol {
                    device: id.clone(),
                    source,
                })
            }
        }
    }

    // --- workers -----------------------------------------------------------

    /// Hands the device to a new worker running `work`.
    pub fn start(&mut self, id: &DeviceId, work: Work) -> Result<(), CoordinatorError> {
        let entry = self.entry(id)?;
        let dev = match std::mem::replace(&mut entry.slot, Slot::Disconnected) {
            Slot::Connected(dev) => dev,
            other => {
                let err = match other {
                    Slot::Busy(_) => CoordinatorError::DeviceBusy(id.clone()),
                    _ => CoordinatorError::NotConnected(id.clone()),
                };
                entry.slot = other;
                return Err(err);
            }
        };

        let kind = work.kind();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let opts = self.opts.clone();
        let tx = self.events.clone();

        let handle = std::thread::Builder::new()
            .name(format!("burner-{}", id))
            .spawn(move || run_work(dev, work, &opts, &worker_cancel, tx))
            .map_err(|e| {
                tracing::error!(device = %id, error = %e, "worker spawn failed");
                CoordinatorError::Spawn(e)
            });
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                self.set_slot(id, Slot::Disconnected);
                return Err(e);
            }
        };

        tracing::debug!(device = %id, operation = kind.as_str(), "worker started");
        self.set_slot(
            id,
            Slot::Busy(Worker {
                kind,
                cancel,
                handle,
            }),
        );
        Ok(())
    }

    pub fn start_quality_check(&mut self, id: &DeviceId) -> Result<(), CoordinatorError> {
        self.start(id, Work::QualityCheck)
    }

    pub fn start_production(&mut self, id: &DeviceId, rom: Arc<[u8]>) -> Result<(), CoordinatorError> {
        self.start(id, Work::Production(rom))
    }

    pub fn start_reset_nor(&mut self, id: &DeviceId) -> Result<(), CoordinatorError> {
        self.start(id, Work::ResetNor)
    }

    pub fn start_backup(
        &mut self,
        id: &DeviceId,
        path: PathBuf,
        limit: u64,
    ) -> Result<(), CoordinatorError> {
        self.start(id, Work::Backup { path, limit })
    }

    /// Requests cancellation; the worker stops at its next step boundary.
    pub fn cancel(&mut self, id: &DeviceId) -> Result<(), CoordinatorError> {
        match &self.entry(id)?.slot {
            Slot::Busy(w) => {
                w.cancel.cancel();
                Ok(())
            }
            _ => Err(CoordinatorError::Idle(id.clone())),
        }
    }

    /// Blocks until the worker on `id` ends and takes the device back.
    pub fn wait(&mut self, id: &DeviceId) -> Result<WorkOutcome, CoordinatorError> {
        let entry = self.entry(id)?;
        let worker = match std::mem::replace(&mut entry.slot, Slot::Disconnected) {
            Slot::Busy(w) => w,
            other => {
                entry.slot = other;
                return Err(CoordinatorError::Idle(id.clone()));
            }
        };
        let removed = entry.removed;
        let lost = worker.cancel.is_lost();

        let (dev, outcome) = match worker.handle.join() {
            Ok(r) => r,
            Err(_) => {
                tracing::error!(device = %id, "worker panicked");
                if removed {
                    self.entries.remove(id);
                } else {
                    self.set_slot(id, Slot::Disconnected);
                }
                return Err(CoordinatorError::WorkerPanicked(id.clone()));
            }
        };

        if removed {
            self.entries.remove(id);
            return Ok(outcome);
        }

        // A device that came back after a removal reconnects from scratch.
        let drop_connection = lost
            || outcome
                .failure()
                .map(|f| f.kind.drops_connection())
                .unwrap_or(false);
        if drop_connection {
            tracing::warn!(device = %id, "connection dropped after failure");
            drop(dev);
            self.set_slot(id, Slot::Disconnected);
        } else {
            self.set_slot(id, Slot::Connected(dev));
        }
        Ok(outcome)
    }

    /// Reaps every worker that has already finished.
    pub fn poll_finished(&mut self) -> Vec<(DeviceId, Result<WorkOutcome, CoordinatorError>)> {
        let done: Vec<DeviceId> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(&e.slot, Slot::Busy(w) if w.handle.is_finished()))
            .map(|(id, _)| id.clone())
            .collect();
        done.into_iter()
            .map(|id| {
                let r = self.wait(&id);
                (id, r)
            })
            .collect()
    }

    pub fn run(&mut self, id: &DeviceId, work: Work) -> Result<WorkOutcome, CoordinatorError> {
        self.start(id, work)?;
        self.wait(id)
    }

    pub fn run_quality_check(&mut self, id: &DeviceId) -> Result<WorkOutcome, CoordinatorError> {
        self.run(id, Work::QualityCheck)
    }

    pub fn run_production(
        &mut self,
        id: &DeviceId,
        rom: Arc<[u8]>,
    ) -> Result<WorkOutcome, CoordinatorError> {
        self.run(id, Work::Production(rom))
    }

    pub fn run_reset_nor(&mut self, id: &DeviceId) -> Result<WorkOutcome, CoordinatorError> {
        self.run(id, Work::ResetNor)
    }

    pub fn run_backup(
        &mut self,
        id: &DeviceId,
        path: PathBuf,
        limit: u64,
    ) -> Result<WorkOutcome, CoordinatorError> {
        self.run(id, Work::Backup { path, limit })
    }

    // --- batches -----------------------------------------------------------

    /// Fans `make_work` out to every connected device and returns once all
    /// started workers have ended. Busy devices are reported as such.
    pub fn run_batch<W>(&mut self, ids: &[DeviceId], mut make_work: W) -> BatchResult
    where
        W: FnMut(&DeviceId) -> Work,
    {
        let mut result = BatchResult::default();
        let mut started = Vec::new();

        for id in ids {
            if !started.is_empty() && !self.opts.batch_stagger.is_zero() {
                std::thread::sleep(self.opts.batch_stagger);
            }
            match self.start(id, make_work(id)) {
                Ok(()) => started.push(id.clone()),
                Err(e) => {
                    result.outcomes.insert(id.clone(), Err(e));
                }
            }
        }

        for id in started {
            let r = self.wait(&id);
            result.outcomes.insert(id, r);
        }
        result
    }

    pub fn run_quality_check_all(&mut self) -> BatchResult {
        let ids = self.connected_ids();
        self.run_batch(&ids, |_| Work::QualityCheck)
    }

    pub fn run_production_all(&mut self, rom: Arc<[u8]>) -> BatchResult {
        let ids = self.connected_ids();
        self.run_batch(&ids, |_| Work::Production(rom.clone()))
    }

    pub fn run_reset_nor_all(&mut self) -> BatchResult {
        let ids = self.connected_ids();
        self.run_batch(&ids, |_| Work::ResetNor)
    }

    /// Backs up every connected device into `dir`, one file per device.
    pub fn run_backup_all(&mut self, dir: &Path, limit: u64) -> BatchResult {
        let ids = self.connected_ids();
        self.run_batch(&ids, |id| Work::Backup {
            path: backup_path(dir, id),
            limit,
        })
    }
}

/// `<dir>/<device id with path separators flattened>.bin`
pub fn backup_path(dir: &Path, id: &DeviceId) -> PathBuf {
    let name: String = id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{}.bin", name.trim_matches('_')))
}

fn run_work(
    mut dev: Device,
    work: Work,
    opts: &CoordinatorOptions,
    cancel: &CancelToken,
    tx: Sender<OperationEvent>,
) -> (Device, WorkOutcome) {
    let id = dev.id().clone();
    let operation = work.kind();
    let mut on_event = |ev: OperationEvent| {
        let _ = tx.send(ev);
    };

    on_event(OperationEvent::OperationStart {
        device: id.clone(),
        operation,
    });

    let outcome = match work {
        Work::QualityCheck => WorkOutcome::QualityCheck(quality::run_quality_check(
            &mut dev,
            &opts.quality,
            cancel,
            &mut on_event,
        )),
        Work::Production(rom) => {
            let mut job = ProductionJob::new(id.clone(), rom);
            job.run(&mut dev, &opts.production, cancel, &mut on_event);
            WorkOutcome::Production(job.into_outcome())
        }
        Work::ResetNor => WorkOutcome::ResetNor(
            maintenance::reset_nor(&mut dev, cancel, &mut on_event)
                .map_err(|e| Failure::from(&cancel.classify(e))),
        ),
        Work::Backup { path, limit } => {
            let r = File::create(&path)
                .map_err(StepError::from)
                .and_then(|f| {
                    let mut out = BufWriter::new(f);
                    maintenance::backup(&mut dev, &mut out, limit, cancel, &mut on_event)
                })
                .map(|bytes| BackupSummary {
                    path: path.clone(),
                    bytes,
                })
                .map_err(|e| Failure::from(&cancel.classify(e)));
            WorkOutcome::Backup(r)
        }
    };

    on_event(OperationEvent::OperationDone {
        device: id,
        operation,
        ok: outcome.is_ok(),
        message: outcome.summary(),
    });
    (dev, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{fast_protocol_options, SimCartridge, SimConfig, SimConnector};
    use std::sync::mpsc::{channel, Receiver};

    fn opts() -> CoordinatorOptions {
        CoordinatorOptions {
            protocol: fast_protocol_options(),
            quality: QualityCheckConfig {
                sdram_test_len: 8 * 1024,
                sram_test_len: 4 * 1024,
                ..QualityCheckConfig::default()
            },
            batch_stagger: Duration::ZERO,
            ..CoordinatorOptions::default()
        }
    }

    fn coordinator(carts: &[(&str, SimConfig)]) -> (Coordinator, SimConnector, Receiver<OperationEvent>) {
        let connector = SimConnector::default();
        let (tx, rx) = channel();
        let mut c = Coordinator::new(Arc::new(connector.clone()), opts(), tx);
        for (name, cfg) in carts {
            let info = DeviceInfo::from_port(*name, 0x0483, 0x0721);
            connector.insert(&info.id, SimCartridge::new(cfg.clone()));
            c.add_device(info);
        }
        (c, connector, rx)
    }

    #[test]
    fn connect_and_disconnect_track_state() {
        let (mut c, _sims, _rx) = coordinator(&[("a", SimConfig::default())]);
        let a = DeviceId::new("a");
        assert_eq!(c.state(&a), Some(ConnectionState::Disconnected));
        c.connect(&a).unwrap();
        assert_eq!(c.state(&a), Some(ConnectionState::Connected));
        c.disconnect(&a).unwrap();
        assert_eq!(c.state(&a), Some(ConnectionState::Disconnected));
    }

    #[test]
    fn unknown_and_disconnected_devices_are_rejected() {
        let (mut c, _sims, _rx) = coordinator(&[("a", SimConfig::default())]);
        let err = c.run_quality_check(&DeviceId::new("zz")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDevice);
        let err = c.run_quality_check(&DeviceId::new("a")).unwrap_err();
        assert!(matches!(err, CoordinatorError::NotConnected(_)));
    }

    #[test]
    fn busy_device_rejects_second_operation() {
        let (mut c, _sims, _rx) = coordinator(&[("a", SimConfig::default())]);
        let a = DeviceId::new("a");
        c.connect(&a).unwrap();
        c.start_quality_check(&a).unwrap();
        assert_eq!(c.state(&a), Some(ConnectionState::Busy));

        let err = c.run_production(&a, vec![1u8, 2].into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
        assert!(matches!(c.disconnect(&a), Err(CoordinatorError::DeviceBusy(_))));

        let out = c.wait(&a).unwrap();
        assert!(out.is_ok());
        assert_eq!(c.state(&a), Some(ConnectionState::Connected));
    }

    #[test]
    fn transport_failure_disconnects_device() {
        let (mut c, sims, _rx) = coordinator(&[("a", SimConfig::default())]);
        let a = DeviceId::new("a");
        c.connect(&a).unwrap();
        sims.get(&a).unwrap().unplug();

        let out = c.run_production(&a, vec![0u8; 64].into()).unwrap();
        assert_eq!(out.failure().unwrap().kind, ErrorKind::Transport);
        assert_eq!(c.state(&a), Some(ConnectionState::Disconnected));
    }

    #[test]
    fn removal_mid_operation_reports_device_lost() {
        let slow = SimConfig {
            latency: Duration::from_millis(2),
            ..SimConfig::default()
        };
        let (mut c, _sims, _rx) = coordinator(&[("a", slow)]);
        let a = DeviceId::new("a");
        c.connect(&a).unwrap();
        c.start_quality_check(&a).unwrap();
        c.remove_device(&a);

        let out = c.wait(&a).unwrap();
        assert_eq!(out.failure().unwrap().kind, ErrorKind::DeviceLost);
        assert_eq!(c.state(&a), None);
    }

    #[test]
    fn device_replugged_before_reap_comes_back_disconnected() {
        let slow = SimConfig {
            latency: Duration::from_millis(2),
            ..SimConfig::default()
        };
        let (mut c, _sims, _rx) = coordinator(&[("a", slow)]);
        let a = DeviceId::new("a");
        c.connect(&a).unwrap();
        c.start_quality_check(&a).unwrap();
        c.remove_device(&a);
        assert!(c.devices().is_empty());
        c.add_device(DeviceInfo::from_port("a", 0x0483, 0x0721));
        assert_eq!(c.devices().len(), 1);
        assert_eq!(c.state(&a), Some(ConnectionState::Busy));

        let out = c.wait(&a).unwrap();
        assert!(out.failure().is_some());
        assert_eq!(c.state(&a), Some(ConnectionState::Disconnected));
        assert_eq!(c.devices().len(), 1);

        c.connect(&a).unwrap();
        assert_eq!(c.state(&a), Some(ConnectionState::Connected));
    }

    #[test]
    fn busy_ids_include_removed_devices() {
        let slow = SimConfig {
            latency: Duration::from_millis(2),
            ..SimConfig::default()
        };
        let (mut c, _sims, _rx) = coordinator(&[("a", slow.clone()), ("b", slow)]);
        let (a, b) = (DeviceId::new("a"), DeviceId::new("b"));
        c.connect(&a).unwrap();
        c.connect(&b).unwrap();
        c.start_quality_check(&a).unwrap();
        c.start_quality_check(&b).unwrap();
        c.remove_device(&a);

        let mut busy = c.busy_ids();
        busy.sort();
        assert_eq!(busy, vec![a.clone(), b.clone()]);
        assert_eq!(c.connected_ids(), vec![b.clone()]);

        for id in busy {
            c.wait(&id).unwrap();
        }
        assert!(c.busy_ids().is_empty());
        assert_eq!(c.state(&a), None);
    }

    #[test]
    fn cancel_stops_worker_between_steps() {
        let slow = SimConfig {
            latency: Duration::from_millis(2),
            ..SimConfig::default()
        };
        let (mut c, _sims, _rx) = coordinator(&[("a", slow)]);
        let a = DeviceId::new("a");
        c.connect(&a).unwrap();
        c.start_production(&a, vec![0x5Au8; 64 * 1024].into()).unwrap();
        c.cancel(&a).unwrap();

        let out = c.wait(&a).unwrap();
        assert_eq!(out.failure().unwrap().kind, ErrorKind::Cancelled);
        // Cancellation leaves the device usable.
        assert_eq!(c.state(&a), Some(ConnectionState::Connected));
        assert!(matches!(c.cancel(&a), Err(CoordinatorError::Idle(_))));
    }

    #[test]
    fn batch_waits_for_every_device() {
        let (mut c, _sims, rx) = coordinator(&[
            ("a", SimConfig::default()),
            ("b", SimConfig::default()),
            ("c", SimConfig::default()),
        ]);
        let results = c.connect_all();
        assert!(results.values().all(|r| r.is_ok()));
        c.disconnect(&DeviceId::new("c")).unwrap();

        let batch = c.run_quality_check_all();
        assert_eq!(batch.outcomes.len(), 2);
        assert!(batch.all_ok());

        let done = rx
            .try_iter()
            .filter(|e| matches!(e, OperationEvent::OperationDone { .. }))
            .count();
        assert_eq!(done, 2);
    }

    #[test]
    fn poll_finished_reaps_completed_workers() {
        let (mut c, _sims, _rx) = coordinator(&[("a", SimConfig::default())]);
        let a = DeviceId::new("a");
        c.connect(&a).unwrap();
        c.start_reset_nor(&a).unwrap();

        let mut reaped = Vec::new();
        for _ in 0..500 {
            reaped.extend(c.poll_finished());
            if !reaped.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(reaped.len(), 1);
        assert!(reaped[0].1.as_ref().unwrap().is_ok());
        assert_eq!(c.state(&a), Some(ConnectionState::Connected));
    }

    #[test]
    fn scan_events_update_registry() {
        let (mut c, _sims, _rx) = coordinator(&[]);
        c.apply_scan(ScanEvent::Appeared(DeviceInfo::from_port("x", 1, 2)));
        assert_eq!(c.devices().len(), 1);
        c.apply_scan(ScanEvent::Removed {
            id: DeviceId::new("x"),
        });
        assert!(c.devices().is_empty());
    }

    #[test]
    fn backup_paths_are_flat_file_names() {
        let p = backup_path(Path::new("out"), &DeviceId::new("/dev/ttyACM0"));
        assert_eq!(p, Path::new("out").join("dev_ttyACM0.bin"));
    }
}
