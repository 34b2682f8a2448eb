use std::io::{IsTerminal, Write};

use superchis_burner::cartridge;
use superchis_burner::coordinator::WorkOutcome;
use superchis_burner::device::DeviceInfo;
use superchis_burner::production::JobOutcome;
use superchis_burner::quality::CheckStatus;
use superchis_burner::{DeviceId, OperationEvent};

use crate::output::{
    format_device_line, format_flash_line, Event, ListedDevice, OperationSummary, OutputOptions,
    Reporter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Quiet,
    Verbose,
    Progress,
}

pub struct HumanOutput {
    opts: OutputOptions,
    is_tty: bool,
    progress_active: bool,
    last_percent: Option<u64>,
}

impl HumanOutput {
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            opts,
            is_tty: std::io::stderr().is_terminal(),
            progress_active: false,
            last_percent: None,
        }
    }

    fn mode(&self) -> Mode {
        if self.opts.quiet {
            Mode::Quiet
        } else if self.opts.verbose {
            Mode::Verbose
        } else {
            Mode::Progress
        }
    }

    fn finish_line(&mut self) {
        if self.progress_active {
            eprintln!();
            self.progress_active = false;
        }
    }

    fn println(&mut self, msg: &str) {
        if self.mode() == Mode::Quiet {
            return;
        }
        self.finish_line();
        eprintln!("{msg}");
    }

    fn progress_update(&mut self, device: &DeviceId, verb: &str, done: u64, total: u64) {
        if self.mode() != Mode::Progress {
            return;
        }
        let percent = done.saturating_mul(100) / total.max(1);

        if self.is_tty {
            eprint!("\r  {device}: {verb} {percent:3}% ({done}/{total})");
            let _ = std::io::stderr().flush();
            self.progress_active = true;
            self.last_percent = Some(percent);
            return;
        }

        let last = self.last_percent.unwrap_or(0);
        if percent == 0 || percent == 100 || percent >= last + 10 {
            self.last_percent = Some(percent);
            self.println(&format!("  {device}: {verb} {percent:3}%"));
        }
    }

    pub(crate) fn ambiguous_help_lines(devices: &[DeviceInfo]) -> Vec<String> {
        devices
            .iter()
            .enumerate()
            .map(|(i, d)| format_device_line(i, d))
            .collect()
    }

    fn print_ambiguous_help(&mut self, devices: &[DeviceInfo]) {
        if self.mode() == Mode::Quiet {
            return;
        }

        let lines = Self::ambiguous_help_lines(devices);
        if lines.is_empty() {
            return;
        }

        self.println("");
        self.println("Detected burners:");
        for line in lines {
            self.println(&line);
        }
        self.println(
            "\nHint: use --device index:<n> (e.g. index:0), or --all, or run `superchis-burner list`.",
        );
    }

    pub(crate) fn outcome_lines(device: &DeviceId, outcome: &WorkOutcome) -> Vec<String> {
        let mut lines = Vec::new();
        match outcome {
            WorkOutcome::QualityCheck(report) => {
                for r in &report.results {
                    let status = match r.status {
                        CheckStatus::Pass => "pass",
                        CheckStatus::Fail => "FAIL",
                        CheckStatus::Skipped => "skip",
                    };
                    let detail = r
                        .failure
                        .as_ref()
                        .map(|f| f.message.clone())
                        .or_else(|| r.detail.clone())
                        .unwrap_or_default();
                    lines.push(format!("  {device}: {:<11} {status} {detail}", r.check.as_str()));
                }
                if let Some(f) = &report.aborted {
                    lines.push(format!("  {device}: aborted: {}", f.message));
                }
            }
            WorkOutcome::Production(JobOutcome::Failed(f)) => {
                lines.push(format!("  {device}: production failed: {}", f.message));
            }
            WorkOutcome::Production(o) => {
                lines.push(format!("  {device}: {}", o.as_str().replace('_', " ")));
            }
            WorkOutcome::ResetNor(Ok(())) => {
                lines.push(format!("  {device}: NOR game table cleared"));
            }
            WorkOutcome::Backup(Ok(b)) => {
                lines.push(format!(
                    "  {device}: {} bytes -> {}",
                    b.bytes,
                    b.path.display()
                ));
            }
            WorkOutcome::ResetNor(Err(f)) | WorkOutcome::Backup(Err(f)) => {
                let at = f.offset.map(|o| format!(" at 0x{o:08X}")).unwrap_or_default();
                lines.push(format!("  {device}: failed{at}: {}", f.message));
            }
        }
        lines
    }

    fn on_operation_event(&mut self, ev: OperationEvent) {
        match ev {
            OperationEvent::DeviceAppeared { info } => {
                if self.mode() != Mode::Quiet {
                    self.println(&format!("burner attached: {}", info.id));
                }
            }
            OperationEvent::DeviceRemoved { device } => {
                if self.mode() != Mode::Quiet {
                    self.println(&format!("burner removed: {device}"));
                }
            }
            OperationEvent::ConnectionChanged { device, state } => {
                if self.mode() == Mode::Verbose {
                    self.println(&format!("{device}: {state:?}"));
                }
            }
            OperationEvent::FlashIdentified { device, descriptor } => {
                if self.mode() != Mode::Quiet {
                    self.println(&format!("{device}: {}", format_flash_line(&descriptor)));
                }
            }
            OperationEvent::OperationStart { device, operation } => {
                self.last_percent = None;
                if self.mode() != Mode::Quiet {
                    self.println(&format!("{device}: {} ...", operation.as_str().replace('_', " ")));
                }
            }
            OperationEvent::CheckStart { device, check } => {
                if self.mode() == Mode::Verbose {
                    self.println(&format!("{device}: check {}", check.as_str()));
                }
            }
            OperationEvent::CheckDone { device, result } => {
                if self.mode() == Mode::Verbose || result.status == CheckStatus::Fail {
                    let msg = result
                        .failure
                        .as_ref()
                        .map(|f| f.message.clone())
                        .or(result.detail.clone())
                        .unwrap_or_default();
                    self.println(&format!(
                        "{device}: {} {:?} {msg}",
                        result.check.as_str(),
                        result.status
                    ));
                }
            }
            OperationEvent::HeaderMatched { device } => {
                if self.mode() != Mode::Quiet {
                    self.println(&format!("{device}: header matches, skipping write"));
                }
            }
            OperationEvent::EraseStart {
                device,
                sectors,
                bytes,
            } => {
                if self.mode() == Mode::Verbose {
                    self.println(&format!("{device}: erase {sectors} sectors ({bytes} bytes)"));
                }
                self.last_percent = None;
            }
            OperationEvent::SectorErased {
                device,
                index,
                total,
                offset,
            } => {
                if self.mode() == Mode::Verbose {
                    self.println(&format!(
                        "{device}: erased sector {}/{total} @ 0x{offset:08X}",
                        index + 1
                    ));
                } else {
                    self.progress_update(&device, "erase", index as u64 + 1, total as u64);
                }
            }
            OperationEvent::Write {
                device,
                written,
                total,
            } => {
                if self.mode() == Mode::Verbose {
                    self.println(&format!("{device}: wrote {written}/{total}"));
                } else {
                    self.progress_update(&device, "write", written, total);
                }
            }
            OperationEvent::VerifyStart { device, total } => {
                self.last_percent = None;
                if self.mode() == Mode::Verbose {
                    self.println(&format!("{device}: verify {total} bytes"));
                }
            }
            OperationEvent::Read { device, read, total } => {
                if self.mode() == Mode::Verbose {
                    self.println(&format!("{device}: read {read}/{total}"));
                } else {
                    self.progress_update(&device, "read", read, total);
                }
            }
            OperationEvent::OperationDone {
                device,
                ok,
                message,
                ..
            } => {
                self.finish_line();
                if ok {
                    self.println(&format!("ok: {device}"));
                } else {
                    // Failures print even in quiet mode.
                    eprintln!("failed: {device}: {}", message.unwrap_or_default());
                }
            }
        }
    }
}

impl Reporter for HumanOutput {
    fn emit(&mut self, event: Event) {
        match event {
            Event::Operation(ev) => self.on_operation_event(ev),
            Event::Outcome { device, outcome } => {
                if self.mode() == Mode::Verbose || !outcome.is_ok() {
                    for line in Self::outcome_lines(&device, &outcome) {
                        self.println(&line);
                    }
                }
            }
            Event::DeviceError {
                device, message, ..
            } => {
                self.finish_line();
                eprintln!("error: {device}: {message}");
            }
            Event::OperationSummary(summary) => emit_summary(summary, self),
            Event::ListDevices(devices) => emit_list_devices(&devices, self),
            Event::Error { code: _, message } => {
                self.finish_line();
                eprintln!("error: {message}");
            }
            Event::HintAmbiguousDevices(devices) => self.print_ambiguous_help(&devices),
        }
    }

    fn finish(&mut self) {
        self.finish_line();
    }
}

fn emit_list_devices(devices: &[ListedDevice], out: &mut HumanOutput) {
    if devices.is_empty() {
        out.println(&format!(
            "No burners found ({:04X}:{:04X})",
            cartridge::VID,
            cartridge::PID
        ));
        return;
    }

    for (i, d) in devices.iter().enumerate() {
        out.println(&format_device_line(i, &d.info));
        if let Some(flash) = &d.flash {
            out.println(&format!("    {}", format_flash_line(flash)));
        }
        if let Some(e) = &d.error {
            out.println(&format!("    error: {e}"));
        }
    }
}

fn emit_summary(summary: OperationSummary, out: &mut HumanOutput) {
    let total = summary.devices_ok.len() + summary.devices_failed.len();
    if total <= 1 && summary.exit_code == 0 {
        return;
    }
    out.println(&format!(
        "{}: {}/{} ok",
        summary.operation,
        summary.devices_ok.len(),
        total
    ));
    if !summary.devices_failed.is_empty() {
        out.println(&format!("failed: {}", summary.devices_failed.join(", ")));
    }
}
