use std::collections::BTreeMap;
use std::time::Instant;

use superchis_burner::coordinator::WorkOutcome;
use superchis_burner::{DeviceId, Failure, OperationEvent};

use crate::output::{
    device_to_value, Event, JsonProgressMode, ListedDevice, OperationSummary, OutputOptions,
    Reporter,
};

#[derive(serde::Serialize)]
pub struct JsonEvent {
    schema: u32,
    event: &'static str,
    #[serde(flatten)]
    fields: BTreeMap<&'static str, serde_json::Value>,
}

impl JsonEvent {
    pub fn status(event: &'static str) -> Self {
        Self {
            schema: 1,
            event,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_u64(mut self, k: &'static str, v: u64) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_str(mut self, k: &'static str, v: &str) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_bool(mut self, k: &'static str, v: bool) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_value(mut self, k: &'static str, v: serde_json::Value) -> Self {
        self.fields.insert(k, v);
        self
    }

    fn with_device(self, device: &DeviceId) -> Self {
        self.with_str("device", device.as_str())
    }

    fn with_serialized<T: serde::Serialize>(self, k: &'static str, v: &T) -> Self {
        let v = serde_json::to_value(v).unwrap_or(serde_json::Value::Null);
        self.with_value(k, v)
    }
}

pub struct JsonOutput {
    opts: OutputOptions,
    start: Instant,
    last_percent: BTreeMap<(DeviceId, &'static str), u64>,
}

impl JsonOutput {
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            opts,
            start: Instant::now(),
            last_percent: BTreeMap::new(),
        }
    }

    pub(crate) fn render_event_json(&mut self, ev: JsonEvent) -> String {
        let mut ev = ev;
        if self.opts.json_timestamps {
            ev.fields.insert(
                "t_ms",
                serde_json::Value::from(self.start.elapsed().as_millis() as u64),
            );
        }
        serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string())
    }

    fn json_event(&mut self, ev: JsonEvent) {
        println!("{}", self.render_event_json(ev));
    }

    fn error_event(&mut self, code: i32, msg: &str) {
        self.json_event(
            JsonEvent::status("error")
                .with_u64("code", code as u64)
                .with_str("message", msg),
        );

        if self.opts.verbose {
            eprintln!("error: {msg}");
        }
    }

    /// Decides whether a progress event passes the configured throttle.
    pub(crate) fn should_emit_progress(
        &mut self,
        device: &DeviceId,
        stream: &'static str,
        done: u64,
        total: u64,
    ) -> bool {
        match self.opts.json_progress {
            JsonProgressMode::Chunks => true,
            JsonProgressMode::None => false,
            JsonProgressMode::Percent => {
                let percent = done.saturating_mul(100) / total.max(1);
                let key = (device.clone(), stream);
                let last = self.last_percent.get(&key).copied();
                let emit = last.is_none() || done >= total || last != Some(percent);
                if emit {
                    self.last_percent.insert(key, percent);
                }
                emit
            }
        }
    }

    fn emit_operation(&mut self, ev: OperationEvent) {
        let pass = match &ev {
            OperationEvent::OperationStart { device, .. } => {
                self.last_percent.retain(|(d, _), _| d != device);
                true
            }
            OperationEvent::Write {
                device,
                written,
                total,
            } => self.should_emit_progress(device, "write", *written, *total),
            OperationEvent::Read {
                device,
                read,
                total,
            } => self.should_emit_progress(device, "read", *read, *total),
            OperationEvent::SectorErased {
                device,
                index,
                total,
                ..
            } => self.should_emit_progress(device, "erase", *index as u64 + 1, *total as u64),
            _ => true,
        };
        if pass {
            self.json_event(operation_event_to_json(ev));
        }
    }
}

impl Reporter for JsonOutput {
    fn emit(&mut self, event: Event) {
        match event {
            Event::Operation(ev) => self.emit_operation(ev),
            Event::Outcome { device, outcome } => {
                self.json_event(outcome_to_json(&device, &outcome));
            }
            Event::DeviceError {
                device,
                code,
                message,
            } => self.json_event(
                JsonEvent::status("device_error")
                    .with_device(&device)
                    .with_u64("code", code as u64)
                    .with_str("message", &message),
            ),
            Event::OperationSummary(summary) => {
                self.json_event(operation_summary_to_json(summary));
            }
            Event::ListDevices(devices) => self.json_event(list_to_json(&devices)),
            Event::Error { code, message } => self.error_event(code, &message),
            Event::HintAmbiguousDevices(_) => {}
        }
    }

    fn finish(&mut self) {}
}

pub fn list_to_json(devices: &[ListedDevice]) -> JsonEvent {
    JsonEvent::status("list")
        .with_u64("count", devices.len() as u64)
        .with_value(
            "devices",
            serde_json::Value::Array(
                devices
                    .iter()
                    .enumerate()
                    .map(|(i, d)| {
                        let mut v = device_to_value(i, &d.info);
                        if let serde_json::Value::Object(obj) = &mut v {
                            if let Some(flash) = &d.flash {
                                obj.insert(
                                    "flash".to_string(),
                                    serde_json::to_value(flash).unwrap_or(serde_json::Value::Null),
                                );
                            }
                            if let Some(e) = &d.error {
                                obj.insert("error".to_string(), serde_json::Value::from(e.as_str()));
                            }
                        }
                        v
                    })
                    .collect(),
            ),
        )
}

fn with_failure(ev: JsonEvent, failure: Option<&Failure>) -> JsonEvent {
    match failure {
        Some(f) => ev.with_serialized("failure", f),
        None => ev,
    }
}

pub fn outcome_to_json(device: &DeviceId, outcome: &WorkOutcome) -> JsonEvent {
    let ev = JsonEvent::status("outcome")
        .with_device(device)
        .with_str("operation", outcome.operation().as_str())
        .with_bool("ok", outcome.is_ok());

    match outcome {
        WorkOutcome::QualityCheck(report) => ev.with_serialized("report", report),
        WorkOutcome::Production(o) => {
            with_failure(ev.with_str("outcome", o.as_str()), outcome.failure())
        }
        WorkOutcome::ResetNor(_) => with_failure(ev, outcome.failure()),
        WorkOutcome::Backup(Ok(b)) => ev
            .with_str("path", &b.path.display().to_string())
            .with_u64("bytes", b.bytes),
        WorkOutcome::Backup(Err(f)) => with_failure(ev, Some(f)),
    }
}

pub fn operation_summary_to_json(summary: OperationSummary) -> JsonEvent {
    let OperationSummary {
        operation,
        exit_code,
        message,
        devices_ok,
        devices_failed,
        bytes_written,
        bytes_read,
        sectors_erased,
        checks_failed,
    } = summary;

    let total = devices_ok.len() + devices_failed.len();

    let mut ev = JsonEvent::status("operation_summary")
        .with_str("operation", operation)
        .with_bool("ok", exit_code == 0)
        .with_u64("exit_code", exit_code.max(0) as u64)
        .with_u64("devices_total", total as u64)
        .with_u64("devices_ok", devices_ok.len() as u64)
        .with_u64("devices_failed", devices_failed.len() as u64)
        .with_u64("bytes_written", bytes_written)
        .with_u64("bytes_read", bytes_read)
        .with_u64("sectors_erased", sectors_erased)
        .with_u64("checks_failed", checks_failed)
        .with_value(
            "devices_ok_ids",
            serde_json::Value::Array(devices_ok.into_iter().map(Into::into).collect()),
        )
        .with_value(
            "devices_failed_ids",
            serde_json::Value::Array(devices_failed.into_iter().map(Into::into).collect()),
        );

    if let Some(msg) = &message {
        ev = ev.with_str("message", msg);
    }

    ev
}

pub fn operation_event_to_json(ev: OperationEvent) -> JsonEvent {
    match ev {
        OperationEvent::DeviceAppeared { info } => JsonEvent::status("device_appeared")
            .with_device(&info.id)
            .with_serialized("info", &info),
        OperationEvent::DeviceRemoved { device } => {
            JsonEvent::status("device_removed").with_device(&device)
        }
        OperationEvent::ConnectionChanged { device, state } => JsonEvent::status("connection")
            .with_device(&device)
            .with_serialized("state", &state),
        OperationEvent::FlashIdentified { device, descriptor } => {
            JsonEvent::status("flash_identified")
                .with_device(&device)
                .with_u64("manufacturer", descriptor.chip_id.manufacturer as u64)
                .with_u64("total_size", descriptor.total_size)
                .with_u64("sectors", descriptor.sector_count())
                .with_u64("buffer_max", descriptor.buffer_max as u64)
                .with_serialized("regions", &descriptor.regions)
        }
        OperationEvent::OperationStart { device, operation } => {
            JsonEvent::status("operation_start")
                .with_device(&device)
                .with_str("operation", operation.as_str())
        }
        OperationEvent::CheckStart { device, check } => JsonEvent::status("check_start")
            .with_device(&device)
            .with_str("check", check.as_str()),
        OperationEvent::CheckDone { device, result } => {
            let mut ev = JsonEvent::status("check_done")
                .with_device(&device)
                .with_str("check", result.check.as_str())
                .with_serialized("status", &result.status);
            if let Some(d) = &result.detail {
                ev = ev.with_str("detail", d);
            }
            with_failure(ev, result.failure.as_ref())
        }
        OperationEvent::HeaderMatched { device } => {
            JsonEvent::status("header_matched").with_device(&device)
        }
        OperationEvent::EraseStart {
            device,
            sectors,
            bytes,
        } => JsonEvent::status("erase_start")
            .with_device(&device)
            .with_u64("sectors", sectors as u64)
            .with_u64("bytes", bytes),
        OperationEvent::SectorErased {
            device,
            index,
            total,
            offset,
        } => JsonEvent::status("sector_erased")
            .with_device(&device)
            .with_u64("i", index as u64)
            .with_u64("n", total as u64)
            .with_u64("offset", offset),
        OperationEvent::Write {
            device,
            written,
            total,
        } => JsonEvent::status("write")
            .with_device(&device)
            .with_u64("done", written)
            .with_u64("total", total),
        OperationEvent::VerifyStart { device, total } => JsonEvent::status("verify_start")
            .with_device(&device)
            .with_u64("total", total),
        OperationEvent::Read { device, read, total } => JsonEvent::status("read")
            .with_device(&device)
            .with_u64("done", read)
            .with_u64("total", total),
        OperationEvent::OperationDone {
            device,
            operation,
            ok,
            message,
        } => {
            let mut ev = JsonEvent::status("operation_done")
                .with_device(&device)
                .with_str("operation", operation.as_str())
                .with_bool("ok", ok);
            if let Some(m) = &message {
                ev = ev.with_str("message", m);
            }
            ev
        }
    }
}
