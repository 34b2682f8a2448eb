use superchis_burner::device::DeviceInfo;
use superchis_burner::operation::Failure;
use superchis_burner::production::JobOutcome;
use superchis_burner::{DeviceId, ErrorKind, OperationEvent, OperationKind, WorkOutcome};

use super::human::HumanOutput;
use super::json::{operation_event_to_json, outcome_to_json, JsonOutput};
use super::{JsonProgressMode, OperationRecorder, OutputOptions};

fn json_opts(progress: JsonProgressMode) -> OutputOptions {
    OutputOptions {
        verbose: false,
        quiet: false,
        json_timestamps: false,
        json_progress: progress,
    }
}

#[test]
fn json_event_has_schema_and_event() {
    let ev = operation_event_to_json(OperationEvent::Write {
        device: DeviceId::new("/dev/ttyACM0"),
        written: 4096,
        total: 8192,
    });
    let v = serde_json::to_value(&ev).unwrap();
    assert_eq!(v.get("schema").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(v.get("event").and_then(|v| v.as_str()), Some("write"));
    assert_eq!(v.get("device").and_then(|v| v.as_str()), Some("/dev/ttyACM0"));
    assert_eq!(v.get("done").and_then(|v| v.as_u64()), Some(4096));
}

#[test]
fn failed_outcome_carries_offset() {
    let failure = Failure::new(ErrorKind::VerifyMismatch, "verify mismatch").at(0x1234);
    let ev = outcome_to_json(
        &DeviceId::new("a"),
        &WorkOutcome::Production(JobOutcome::Failed(failure)),
    );
    let v = serde_json::to_value(&ev).unwrap();
    assert_eq!(v.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(v.get("outcome").and_then(|v| v.as_str()), Some("failed"));
    let f = v.get("failure").unwrap();
    assert_eq!(f.get("kind").and_then(|v| v.as_str()), Some("verify_mismatch"));
    assert_eq!(f.get("offset").and_then(|v| v.as_u64()), Some(0x1234));
}

#[test]
fn percent_mode_throttles_per_device() {
    let mut out = JsonOutput::new(json_opts(JsonProgressMode::Percent));
    let a = DeviceId::new("a");
    let b = DeviceId::new("b");

    assert!(out.should_emit_progress(&a, "write", 0, 1000));
    assert!(!out.should_emit_progress(&a, "write", 5, 1000));
    assert!(out.should_emit_progress(&b, "write", 5, 1000));
    assert!(out.should_emit_progress(&a, "write", 20, 1000));
    assert!(out.should_emit_progress(&a, "write", 1000, 1000));

    let mut quiet = JsonOutput::new(json_opts(JsonProgressMode::None));
    assert!(!quiet.should_emit_progress(&a, "write", 1000, 1000));
}

#[test]
fn timestamps_are_added_when_requested() {
    let mut out = JsonOutput::new(OutputOptions {
        json_timestamps: true,
        ..json_opts(JsonProgressMode::Chunks)
    });
    let line = out.render_event_json(operation_event_to_json(OperationEvent::HeaderMatched {
        device: DeviceId::new("a"),
    }));
    let v: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert!(v.get("t_ms").is_some());
}

#[test]
fn recorder_counts_device_once_across_operations() {
    let mut rec = OperationRecorder::new("produce");
    let a = DeviceId::new("a");
    let done = |ok| OperationEvent::OperationDone {
        device: a.clone(),
        operation: OperationKind::Production,
        ok,
        message: None,
    };
    rec.observe(&done(true));
    rec.observe(&done(false));
    rec.device_failed(&DeviceId::new("b"));
    rec.observe(&OperationEvent::Write {
        device: a.clone(),
        written: 4096,
        total: 4096,
    });

    let s = rec.finish(13, None);
    assert!(s.devices_ok.is_empty());
    assert_eq!(s.devices_failed, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(s.bytes_written, 4096);
}

#[test]
fn ambiguous_help_lists_devices() {
    let mut a = DeviceInfo::from_port("/dev/ttyACM0", 0x0483, 0x0721);
    a.serial_number = Some("SC-7".to_string());
    let b = DeviceInfo::from_port("/dev/ttyACM1", 0x0483, 0x0721);

    let lines = HumanOutput::ambiguous_help_lines(&[a, b]);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("[0] /dev/ttyACM0"));
    assert!(lines[0].contains("SC-7"));
}
