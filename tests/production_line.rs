use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use superchis_burner::device::{self, DeviceInfo};
use superchis_burner::production::JobOutcome;
use superchis_burner::protocol::ConfigBits;
use superchis_burner::quality::{CheckName, CheckStatus, QualityCheckConfig};
use superchis_burner::sim::{fast_protocol_options, SimCartridge, SimConfig, SimConnector};
use superchis_burner::{
    ConnectionState, Coordinator, CoordinatorOptions, DeviceId, ErrorKind, OperationEvent,
    WorkOutcome,
};

struct Line {
    coordinator: Coordinator,
    sims: SimConnector,
    events: Receiver<OperationEvent>,
}

impl Line {
    fn new(carts: Vec<(&str, SimConfig)>) -> Self {
        let sims = SimConnector::default();
        let (tx, events) = channel();
        let opts = CoordinatorOptions {
            protocol: fast_protocol_options(),
            quality: QualityCheckConfig {
                sdram_test_len: 16 * 1024,
                sram_test_len: 8 * 1024,
                ..QualityCheckConfig::default()
            },
            batch_stagger: Duration::ZERO,
            ..CoordinatorOptions::default()
        };
        let mut coordinator = Coordinator::new(Arc::new(sims.clone()), opts, tx);
        for (port, cfg) in carts {
            let info = DeviceInfo::from_port(port, 0x0483, 0x0721);
            sims.insert(&info.id, SimCartridge::new(cfg));
            coordinator.add_device(info);
        }
        let results = coordinator.connect_all();
        assert!(results.values().all(|r| r.is_ok()));
        Self {
            coordinator,
            sims,
            events,
        }
    }

    fn single(cfg: SimConfig) -> (Self, DeviceId, SimCartridge) {
        let line = Self::new(vec![("slot0", cfg)]);
        let id = DeviceId::new("slot0");
        let sim = line.sims.get(&id).unwrap();
        (line, id, sim)
    }
}

fn rom(len: usize) -> Arc<[u8]> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect::<Vec<u8>>().into()
}

fn production(outcome: WorkOutcome) -> JobOutcome {
    match outcome {
        WorkOutcome::Production(o) => o,
        other => panic!("expected production outcome, got {other:?}"),
    }
}

fn quality_statuses(outcome: &WorkOutcome) -> Vec<CheckStatus> {
    match outcome {
        WorkOutcome::QualityCheck(r) => r.results.iter().map(|c| c.status).collect(),
        other => panic!("expected quality-check outcome, got {other:?}"),
    }
}

#[test]
fn sector_table_sums_to_advertised_size() {
    let chips = vec![
        ("bottom-boot", SimConfig::default()),
        (
            "uniform",
            SimConfig {
                flash_size: 8 * 1024 * 1024,
                regions: vec![(128, 64 * 1024)],
                ..SimConfig::default()
            },
        ),
        (
            "dual-boot",
            SimConfig {
                flash_size: 8 * 1024 * 1024,
                regions: vec![(8, 8 * 1024), (126, 64 * 1024), (8, 8 * 1024)],
                ..SimConfig::default()
            },
        ),
    ];
    let mut line = Line::new(chips);

    for id in line.coordinator.connected_ids() {
        let desc = line.coordinator.query_flash(&id).unwrap();
        let sum: u64 = desc.sectors().map(|s| s.size).sum();
        assert_eq!(sum, desc.total_size, "{id}");
        assert_eq!(desc.sector_table_size(), desc.total_size, "{id}");
    }
}

#[test]
fn quality_check_is_idempotent_on_good_cartridge() {
    let (mut line, id, _sim) = Line::single(SimConfig::default());

    for _ in 0..2 {
        let out = line.coordinator.run_quality_check(&id).unwrap();
        assert_eq!(quality_statuses(&out), vec![CheckStatus::Pass; 4]);
    }

    let done = line
        .events
        .try_iter()
        .filter(|e| matches!(e, OperationEvent::CheckDone { .. }))
        .count();
    assert_eq!(done, 8);
}

#[test]
fn production_writes_then_skips() {
    let (mut line, id, sim) = Line::single(SimConfig::default());
    let image = rom(96 * 1024);

    let first = production(line.coordinator.run_production(&id, image.clone()).unwrap());
    assert_eq!(first, JobOutcome::WrittenVerified);
    assert_eq!(sim.flash(0, image.len()), image.to_vec());

    let second = production(line.coordinator.run_production(&id, image).unwrap());
    assert_eq!(second, JobOutcome::SkippedAlreadyCorrect);
}

#[test]
fn matching_header_skips_even_with_different_body() {
    let (mut line, id, sim) = Line::single(SimConfig::default());
    let image = rom(32 * 1024);

    let mut stale = image.to_vec();
    for b in &mut stale[0x2000..0x2100] {
        *b = !*b;
    }
    sim.load_flash(0, &stale);

    let out = production(line.coordinator.run_production(&id, image).unwrap());
    assert_eq!(out, JobOutcome::SkippedAlreadyCorrect);
    assert_eq!(sim.flash(0x2000, 0x100), stale[0x2000..0x2100].to_vec());
}

#[test]
fn verify_reports_offset_of_corrupted_byte() {
    let (mut line, id, _sim) = Line::single(SimConfig::default());
    let sim = line.sims.get(&id).unwrap();
    sim.corrupt_after_program(0x5A31);

    let out = production(line.coordinator.run_production(&id, rom(64 * 1024)).unwrap());
    match out {
        JobOutcome::Failed(f) => {
            assert_eq!(f.kind, ErrorKind::VerifyMismatch);
            assert_eq!(f.offset, Some(0x5A31));
        }
        other => panic!("expected verify failure, got {other:?}"),
    }
    // A verify failure does not cost the connection.
    assert_eq!(line.coordinator.state(&id), Some(ConnectionState::Connected));
}

#[test]
fn concurrent_devices_keep_their_own_config() {
    let connector = SimConnector::default();
    let a_info = DeviceInfo::from_port("a", 0x0483, 0x0721);
    let b_info = DeviceInfo::from_port("b", 0x0483, 0x0721);
    connector.insert(&a_info.id, SimCartridge::new(SimConfig::default()));
    let sim_b = connector.insert(&b_info.id, SimCartridge::new(SimConfig::default()));

    let mut a = device::connect(&connector, a_info, fast_protocol_options()).unwrap();
    let mut b = device::connect(&connector, b_info, fast_protocol_options()).unwrap();
    let marker = vec![0xB1u8; 64];

    std::thread::scope(|s| {
        s.spawn(|| {
            let p = a.protocol_mut();
            for i in 0..64u8 {
                p.sram_bank_select(i % 2).unwrap();
                p.write_ram(0, &[i; 64]).unwrap();
            }
        });
        s.spawn(|| {
            let p = b.protocol_mut();
            p.sram_bank_select(1).unwrap();
            p.write_ram(0, &marker).unwrap();
            for _ in 0..64 {
                assert!(p.config().contains(ConfigBits::SRAM_BANK));
                assert_eq!(p.read_ram(0, marker.len()).unwrap(), marker);
            }
        });
    });

    assert_eq!(sim_b.config_register() & 0x8, 0x8);
    assert_eq!(sim_b.sram(1, 0, marker.len()), marker);
    assert_ne!(sim_b.sram(0, 0, marker.len()), marker);
}

#[test]
fn production_on_busy_device_is_rejected() {
    let slow = SimConfig {
        latency: Duration::from_millis(2),
        ..SimConfig::default()
    };
    let (mut line, id, _sim) = Line::single(slow);

    line.coordinator.start_quality_check(&id).unwrap();
    let err = line.coordinator.run_production(&id, rom(4096)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);

    let out = line.coordinator.wait(&id).unwrap();
    assert!(out.is_ok());
}

#[test]
fn non_blank_chip_is_erased_by_blank_check() {
    let (mut line, id, sim) = Line::single(SimConfig::default());
    sim.load_flash(0, &[0x12; 4096]);

    let out = line.coordinator.run_quality_check(&id).unwrap();
    let WorkOutcome::QualityCheck(report) = out else {
        panic!("expected quality-check outcome");
    };
    assert_eq!(report.status(CheckName::FlashBlank), Some(CheckStatus::Pass));
    assert_eq!(sim.flash(0, 4096), vec![0xFF; 4096]);
}

#[test]
fn stuck_bit_fails_blank_check_without_hanging() {
    let (mut line, id, sim) = Line::single(SimConfig::default());
    sim.stick_byte(0x40, 0x7F);

    let started = Instant::now();
    let out = line.coordinator.run_quality_check(&id).unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let WorkOutcome::QualityCheck(report) = out else {
        panic!("expected quality-check outcome");
    };
    assert_eq!(report.status(CheckName::FlashBlank), Some(CheckStatus::Fail));
    let failed = report.failed_checks().next().unwrap();
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::VerifyMismatch);
    assert_eq!(failure.offset, Some(0x40));
    assert!(!report.diagnostics.is_empty());
}

#[test]
fn hung_erase_times_out_instead_of_hanging() {
    let (mut line, id, sim) = Line::single(SimConfig::default());
    sim.load_flash(0, &[0x00; 16]);
    sim.hang_erase(true);

    let started = Instant::now();
    let out = line.coordinator.run_quality_check(&id).unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let WorkOutcome::QualityCheck(report) = out else {
        panic!("expected quality-check outcome");
    };
    assert_eq!(report.status(CheckName::FlashBlank), Some(CheckStatus::Fail));
    assert_eq!(
        report.failed_checks().next().unwrap().failure.as_ref().unwrap().kind,
        ErrorKind::EraseTimeout
    );
}

#[test]
fn batch_production_reports_every_device() {
    let mut line = Line::new(vec![
        ("a", SimConfig::default()),
        ("b", SimConfig::default()),
        ("c", SimConfig::default()),
    ]);
    line.sims.get(&DeviceId::new("b")).unwrap().corrupt_after_program(0x10);

    let batch = line.coordinator.run_production_all(rom(16 * 1024));
    assert_eq!(batch.outcomes.len(), 3);
    assert_eq!(batch.ok_count(), 2);
    let b = batch.outcomes[&DeviceId::new("b")].as_ref().unwrap();
    assert_eq!(b.failure().unwrap().offset, Some(0x10));
}
