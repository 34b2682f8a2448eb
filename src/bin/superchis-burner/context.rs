use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use superchis_burner::device::{Connector, DeviceInfo, SerialConnector};
use superchis_burner::protocol::ProtocolOptions;
use superchis_burner::quality::{FlashCheckMode, QualityCheckConfig, SramCheckMode};
use superchis_burner::scanner::{
    self, Enumerator, ScanError, ScanEvent, ScanOptions, ScannerHandle, SerialEnumerator,
};
use superchis_burner::selector::{self, SelectorError};
use superchis_burner::sim::{SimCartridge, SimConfig, SimConnector, SimEnumerator};
use superchis_burner::transport::SerialOptions;
use superchis_burner::{Coordinator, CoordinatorOptions, DeviceId, OperationEvent};

use crate::cli;
use crate::exit_codes;
use crate::output::{Event, Reporter};

/// Where burners come from: serial ports, or simulated cartridges.
pub enum Bench {
    Serial {
        connector: SerialConnector,
        enumerator: SerialEnumerator,
    },
    Sim {
        connector: SimConnector,
        enumerator: SimEnumerator,
    },
}

impl Bench {
    pub fn new(conn: &cli::ConnectionArgs) -> Self {
        let scan = scan_options(conn);
        match conn.simulate {
            Some(n) => {
                let connector = SimConnector::default();
                let enumerator = SimEnumerator::default();
                for i in 0..n {
                    let info = DeviceInfo::from_port(format!("sim{i}"), scan.vid, scan.pid);
                    connector.insert(&info.id, SimCartridge::new(SimConfig::default()));
                    enumerator.plug(info);
                }
                Bench::Sim {
                    connector,
                    enumerator,
                }
            }
            None => Bench::Serial {
                connector: SerialConnector {
                    options: SerialOptions {
                        timeout: Duration::from_millis(conn.timeout_ms),
                        ..SerialOptions::default()
                    },
                },
                enumerator: SerialEnumerator::new(&scan),
            },
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        match self {
            Bench::Serial { connector, .. } => Arc::new(connector.clone()),
            Bench::Sim { connector, .. } => Arc::new(connector.clone()),
        }
    }

    pub fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, ScanError> {
        match self {
            Bench::Serial { enumerator, .. } => enumerator.enumerate(),
            Bench::Sim { enumerator, .. } => enumerator.enumerate(),
        }
    }

    pub fn spawn_scanner(
        &self,
        interval: Duration,
        tx: Sender<ScanEvent>,
    ) -> Result<ScannerHandle, ScanError> {
        match self {
            Bench::Serial { enumerator, .. } => scanner::spawn(enumerator.clone(), interval, tx),
            Bench::Sim { enumerator, .. } => scanner::spawn(enumerator.clone(), interval, tx),
        }
    }
}

pub fn scan_options(conn: &cli::ConnectionArgs) -> ScanOptions {
    ScanOptions {
        vid: conn.vid,
        pid: conn.pid,
        ..ScanOptions::default()
    }
}

pub fn quality_config(args: &cli::QualityArgs) -> QualityCheckConfig {
    let defaults = QualityCheckConfig::default();
    let seed = match args.seed {
        Some(seed) => seed,
        None if args.fast_flash => clock_seed(),
        None => defaults.seed,
    };
    QualityCheckConfig {
        sdram: !args.no_sdram,
        sram: !args.no_sram,
        flash_blank: !args.no_blank,
        ppb_unlock: !args.no_ppb,
        sram_mode: if args.basic_sram {
            SramCheckMode::Basic
        } else {
            SramCheckMode::Full
        },
        flash_mode: if args.fast_flash {
            FlashCheckMode::Fast
        } else {
            FlashCheckMode::Blank
        },
        sdram_test_len: args.sdram_bytes,
        seed,
        ..defaults
    }
}

/// Varies between runs so sampled regions move.
fn clock_seed() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(0);
    nanos.max(1)
}

pub fn coordinator_options(
    conn: &cli::ConnectionArgs,
    quality: Option<&cli::QualityArgs>,
) -> CoordinatorOptions {
    CoordinatorOptions {
        protocol: ProtocolOptions {
            exchange_timeout: Duration::from_millis(conn.timeout_ms),
            ..ProtocolOptions::default()
        },
        quality: quality.map(quality_config).unwrap_or_default(),
        batch_stagger: Duration::from_millis(conn.stagger_ms),
        ..CoordinatorOptions::default()
    }
}

/// Builds a coordinator that knows `devices`, plus the receiving end of
/// its event stream.
pub fn coordinator(
    bench: &Bench,
    devices: &[DeviceInfo],
    opts: CoordinatorOptions,
) -> (Coordinator, Receiver<OperationEvent>) {
    let (tx, rx) = channel();
    let mut c = Coordinator::new(bench.connector(), opts, tx);
    for info in devices {
        c.add_device(info.clone());
    }
    (c, rx)
}

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("no burner found")]
    NoDevice,

    #[error("{0} burners attached; choose one with --device or use --all")]
    Ambiguous(usize),

    #[error(transparent)]
    Selector(#[from] SelectorError),
}

impl SelectionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SelectionError::NoDevice
            | SelectionError::Selector(SelectorError::NoMatch { .. })
            | SelectionError::Selector(SelectorError::IndexOutOfRange { .. }) => {
                exit_codes::EXIT_NO_DEVICE
            }
            SelectionError::Ambiguous(_)
            | SelectionError::Selector(SelectorError::MultipleMatches { .. }) => {
                exit_codes::EXIT_AMBIGUOUS
            }
            SelectionError::Selector(SelectorError::InvalidSelector(_)) => {
                exit_codes::EXIT_INVALID_INPUT
            }
        }
    }
}

pub fn select(
    args: &cli::SelectArgs,
    devices: &[DeviceInfo],
) -> Result<Vec<DeviceId>, SelectionError> {
    if devices.is_empty() {
        return Err(SelectionError::NoDevice);
    }
    if args.all {
        return Ok(devices.iter().map(|d| d.id.clone()).collect());
    }
    if let Some(s) = &args.device {
        let sel = selector::parse_selector(s)?;
        return Ok(vec![selector::resolve_one(&sel, devices)?.clone()]);
    }
    match devices {
        [only] => Ok(vec![only.id.clone()]),
        _ => Err(SelectionError::Ambiguous(devices.len())),
    }
}

/// Enumerates burners and resolves the selection, reporting failures.
pub fn discover(
    bench: &mut Bench,
    args: &cli::SelectArgs,
    out: &mut dyn Reporter,
) -> Result<(Vec<DeviceInfo>, Vec<DeviceId>), i32> {
    let devices = bench.enumerate().map_err(|e| {
        out.emit(Event::Error {
            code: exit_codes::EXIT_UNEXPECTED,
            message: e.to_string(),
        });
        exit_codes::EXIT_UNEXPECTED
    })?;

    match select(args, &devices) {
        Ok(ids) => Ok((devices, ids)),
        Err(e) => {
            let code = e.exit_code();
            out.emit(Event::Error {
                code,
                message: e.to_string(),
            });
            if code == exit_codes::EXIT_AMBIGUOUS {
                out.emit(Event::HintAmbiguousDevices(devices));
            }
            Err(code)
        }
    }
}

/// Runs `job` on its own thread while forwarding engine events to
/// `on_event` on this one. Returns `None` if the job panicked.
///
/// The event loop ends once the coordinator and every worker have dropped
/// their senders, so no event is lost.
pub fn drive<T, J, F>(
    coordinator: Coordinator,
    events: Receiver<OperationEvent>,
    mut on_event: F,
    job: J,
) -> Option<T>
where
    T: Send,
    J: FnOnce(&mut Coordinator) -> T + Send,
    F: FnMut(OperationEvent),
{
    std::thread::scope(|s| {
        let handle = s.spawn(move || {
            let mut coordinator = coordinator;
            job(&mut coordinator)
        });
        for ev in events {
            on_event(ev);
        }
        handle.join().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_args(all: bool, device: Option<&str>) -> cli::SelectArgs {
        cli::SelectArgs {
            all,
            device: device.map(str::to_string),
        }
    }

    fn devices(n: usize) -> Vec<DeviceInfo> {
        (0..n)
            .map(|i| DeviceInfo::from_port(format!("/dev/ttyACM{i}"), 0x0483, 0x0721))
            .collect()
    }

    #[test]
    fn single_device_is_selected_implicitly() {
        let ids = select(&select_args(false, None), &devices(1)).unwrap();
        assert_eq!(ids, vec![DeviceId::new("/dev/ttyACM0")]);
    }

    #[test]
    fn several_devices_need_a_choice() {
        let err = select(&select_args(false, None), &devices(3)).unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::EXIT_AMBIGUOUS);

        let ids = select(&select_args(false, Some("index:2")), &devices(3)).unwrap();
        assert_eq!(ids, vec![DeviceId::new("/dev/ttyACM2")]);
        assert_eq!(select(&select_args(true, None), &devices(3)).unwrap().len(), 3);
    }

    #[test]
    fn no_devices_is_reported() {
        let err = select(&select_args(true, None), &[]).unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::EXIT_NO_DEVICE);
    }

    fn quality_args(fast_flash: bool, seed: Option<u32>) -> cli::QualityArgs {
        cli::QualityArgs {
            no_sdram: false,
            no_sram: false,
            no_blank: false,
            no_ppb: false,
            sdram_bytes: 1024,
            basic_sram: true,
            fast_flash,
            seed,
        }
    }

    #[test]
    fn quality_flags_select_check_modes() {
        let cfg = quality_config(&quality_args(true, Some(7)));
        assert_eq!(cfg.sram_mode, SramCheckMode::Basic);
        assert_eq!(cfg.flash_mode, FlashCheckMode::Fast);
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.sdram_test_len, 1024);

        let cfg = quality_config(&quality_args(false, None));
        assert_eq!(cfg.flash_mode, FlashCheckMode::Blank);
        assert_eq!(cfg.seed, QualityCheckConfig::default().seed);

        assert_ne!(quality_config(&quality_args(true, None)).seed, 0);
    }

    #[test]
    fn drive_forwards_every_event() {
        let conn = cli::ConnectionArgs {
            vid: 0x0483,
            pid: 0x0721,
            timeout_ms: 1000,
            stagger_ms: 0,
            simulate: Some(2),
        };
        let mut bench = Bench::new(&conn);
        let devices = bench.enumerate().unwrap();
        let (c, rx) = coordinator(&bench, &devices, coordinator_options(&conn, None));

        let mut done = 0;
        let connected = drive(
            c,
            rx,
            |ev| {
                if matches!(ev, OperationEvent::ConnectionChanged { .. }) {
                    done += 1;
                }
            },
            |c| c.connect_all().values().filter(|r| r.is_ok()).count(),
        );
        assert_eq!(connected, Some(2));
        assert_eq!(done, 2);
    }
}
