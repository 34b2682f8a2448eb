use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use superchis_burner::scanner::{ScanEvent, ScannerHandle};
use superchis_burner::{Coordinator, Work, WorkOutcome};

use crate::cli;
use crate::commands::{produce, run_job, Outcomes};
use crate::context::{self, Bench};
use crate::exit_codes;
use crate::output::{Event, Reporter};

const POLL: Duration = Duration::from_millis(100);

/// What to run on each cartridge as its burner appears.
#[derive(Clone)]
pub struct Pipeline {
    pub check: bool,
    pub rom: Option<Arc<[u8]>>,
}

impl Pipeline {
    fn first(&self) -> Option<Work> {
        match (&self.rom, self.check) {
            (_, true) => Some(Work::QualityCheck),
            (Some(rom), false) => Some(Work::Production(rom.clone())),
            (None, false) => None,
        }
    }

    /// The follow-up once `outcome` is in, if the pipeline continues.
    fn next(&self, outcome: &WorkOutcome) -> Option<Work> {
        match (outcome, &self.rom) {
            (WorkOutcome::QualityCheck(report), Some(rom)) if report.passed() => {
                Some(Work::Production(rom.clone()))
            }
            _ => None,
        }
    }
}

/// Serves scan events until `count` cartridges are finished (0 = forever)
/// or the scanner goes away.
pub fn serve(
    c: &mut Coordinator,
    scans: Receiver<ScanEvent>,
    scanner: ScannerHandle,
    pipeline: Pipeline,
    count: usize,
) -> Outcomes {
    let Some(first) = pipeline.first() else {
        return Outcomes::new();
    };
    let mut outcomes = Outcomes::new();
    let mut finished = 0usize;

    loop {
        match scans.recv_timeout(POLL) {
            Ok(ev) => {
                let appeared = match &ev {
                    ScanEvent::Appeared(info) => Some(info.id.clone()),
                    ScanEvent::Removed { .. } => None,
                };
                c.apply_scan(ev);
                if let Some(id) = appeared {
                    if let Err(e) = c.connect(&id).and_then(|()| c.start(&id, first.clone())) {
                        tracing::warn!(device = %id, error = %e, "could not start");
                        outcomes.push((id, Err(e)));
                        finished += 1;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        for (id, r) in c.poll_finished() {
            let next = r.as_ref().ok().and_then(|o| pipeline.next(o));
            outcomes.push((id.clone(), r));
            match next {
                Some(work) => {
                    if let Err(e) = c.start(&id, work) {
                        outcomes.push((id, Err(e)));
                        finished += 1;
                    }
                }
                None => finished += 1,
            }
        }

        if count > 0 && finished >= count && c.busy_count() == 0 {
            break;
        }
    }

    scanner.stop();
    // Workers still running when the scanner went away, unplugged ones too.
    for id in c.busy_ids() {
        let r = c.wait(&id);
        outcomes.push((id, r));
    }
    outcomes
}

pub fn run(args: cli::WatchArgs, out: &mut dyn Reporter) -> i32 {
    let rom = match &args.rom {
        Some(path) => match produce::load_rom(path, out) {
            Ok(rom) => Some(rom),
            Err(code) => return code,
        },
        None => None,
    };
    let pipeline = Pipeline {
        check: !args.no_check,
        rom,
    };
    if pipeline.first().is_none() {
        out.emit(Event::Error {
            code: exit_codes::EXIT_INVALID_INPUT,
            message: "nothing to do: pass --rom or drop --no-check".to_string(),
        });
        return exit_codes::EXIT_INVALID_INPUT;
    }

    let bench = Bench::new(&args.conn);
    let (tx, scans) = channel();
    let scanner = match bench.spawn_scanner(Duration::from_millis(args.scan_interval_ms), tx) {
        Ok(h) => h,
        Err(e) => {
            out.emit(Event::Error {
                code: exit_codes::EXIT_UNEXPECTED,
                message: e.to_string(),
            });
            return exit_codes::EXIT_UNEXPECTED;
        }
    };

    let opts = context::coordinator_options(&args.conn, Some(&args.quality));
    let (coordinator, events) = context::coordinator(&bench, &[], opts);
    let count = args.count;

    run_job("watch", coordinator, events, out, move |c| {
        serve(c, scans, scanner, pipeline, count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use superchis_burner::quality::QualityCheckConfig;
    use superchis_burner::scanner;
    use superchis_burner::sim::{
        fast_protocol_options, SimCartridge, SimConfig, SimConnector, SimEnumerator,
    };
    use superchis_burner::{CoordinatorOptions, DeviceId, DeviceInfo};

    #[test]
    fn serves_each_appearing_cartridge() {
        let connector = SimConnector::default();
        let enumerator = SimEnumerator::default();
        for i in 0..2 {
            let info = DeviceInfo::from_port(format!("sim{i}"), 0x0483, 0x0721);
            connector.insert(&info.id, SimCartridge::new(SimConfig::default()));
            enumerator.plug(info);
        }

        let (scan_tx, scans) = channel();
        let scanner = scanner::spawn(enumerator, Duration::from_millis(10), scan_tx).unwrap();
        let (tx, _rx) = channel();
        let opts = CoordinatorOptions {
            protocol: fast_protocol_options(),
            quality: QualityCheckConfig {
                sdram_test_len: 8 * 1024,
                sram_test_len: 4 * 1024,
                ..QualityCheckConfig::default()
            },
            batch_stagger: Duration::ZERO,
            ..CoordinatorOptions::default()
        };
        let mut c = Coordinator::new(Arc::new(connector.clone()), opts, tx);

        let rom: Arc<[u8]> = vec![0x42u8; 8192].into();
        let pipeline = Pipeline {
            check: true,
            rom: Some(rom.clone()),
        };
        let outcomes = serve(&mut c, scans, scanner, pipeline, 2);

        // A quality check and a production run per cartridge.
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|(_, r)| r.as_ref().is_ok_and(|o| o.is_ok())));
        let sim = connector.get(&DeviceId::new("sim1")).unwrap();
        assert_eq!(sim.flash(0, 8192), rom.to_vec());
    }

    #[test]
    fn cartridge_unplugged_mid_check_is_still_reported() {
        let connector = SimConnector::default();
        let info = DeviceInfo::from_port("sim0", 0x0483, 0x0721);
        let slow = SimConfig {
            latency: Duration::from_millis(2),
            ..SimConfig::default()
        };
        connector.insert(&info.id, SimCartridge::new(slow));

        let (idle_tx, _idle_rx) = channel();
        let scanner =
            scanner::spawn(SimEnumerator::default(), Duration::from_millis(10), idle_tx).unwrap();
        let (scan_tx, scans) = channel();
        scan_tx.send(ScanEvent::Appeared(info.clone())).unwrap();
        scan_tx
            .send(ScanEvent::Removed {
                id: info.id.clone(),
            })
            .unwrap();
        drop(scan_tx);

        let (tx, _rx) = channel();
        let opts = CoordinatorOptions {
            protocol: fast_protocol_options(),
            quality: QualityCheckConfig {
                sdram_test_len: 8 * 1024,
                sram_test_len: 4 * 1024,
                ..QualityCheckConfig::default()
            },
            batch_stagger: Duration::ZERO,
            ..CoordinatorOptions::default()
        };
        let mut c = Coordinator::new(Arc::new(connector), opts, tx);
        let pipeline = Pipeline {
            check: true,
            rom: None,
        };
        let outcomes = serve(&mut c, scans, scanner, pipeline, 0);

        assert_eq!(outcomes.len(), 1);
        let (id, r) = &outcomes[0];
        assert_eq!(id, &info.id);
        let failure = r.as_ref().unwrap().failure().unwrap();
        assert_eq!(failure.kind, superchis_burner::ErrorKind::DeviceLost);
        assert_eq!(c.busy_count(), 0);
    }

    #[test]
    fn pipeline_stops_after_failed_check() {
        let pipeline = Pipeline {
            check: true,
            rom: Some(vec![1u8, 2].into()),
        };
        assert!(matches!(pipeline.first(), Some(Work::QualityCheck)));
        let failed = WorkOutcome::QualityCheck(superchis_burner::quality::QualityCheckReport {
            device: DeviceId::new("a"),
            results: Vec::new(),
            aborted: Some(superchis_burner::Failure::new(
                superchis_burner::ErrorKind::UnsupportedChip,
                "no CFI",
            )),
            diagnostics: Vec::new(),
        });
        assert!(pipeline.next(&failed).is_none());
    }
}
