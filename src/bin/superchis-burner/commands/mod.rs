use std::sync::mpsc::Receiver;

use superchis_burner::{Coordinator, CoordinatorError, DeviceId, OperationEvent, WorkOutcome};

use crate::context;
use crate::exit_codes;
use crate::output::{Event, OperationRecorder, Reporter};

pub mod backup;
pub mod check;
pub mod list;
pub mod produce;
pub mod reset_nor;
pub mod watch;

pub type Outcomes = Vec<(DeviceId, Result<WorkOutcome, CoordinatorError>)>;

/// Connects every selected device; those that fail are returned as outcomes.
pub fn connect_selected(c: &mut Coordinator, ids: &[DeviceId]) -> (Vec<DeviceId>, Outcomes) {
    let mut ready = Vec::new();
    let mut failed = Outcomes::new();
    for id in ids {
        match c.connect(id) {
            Ok(()) => ready.push(id.clone()),
            Err(e) => failed.push((id.clone(), Err(e))),
        }
    }
    (ready, failed)
}

pub fn outcome_exit_code(outcome: &WorkOutcome) -> i32 {
    let kind = outcome.failure().map(|f| f.kind);
    match outcome {
        WorkOutcome::QualityCheck(report) => match &report.aborted {
            Some(f) => exit_codes::for_kind(f.kind),
            None => exit_codes::EXIT_CHECK_FAILED,
        },
        _ => kind
            .map(exit_codes::for_kind)
            .unwrap_or(exit_codes::EXIT_UNEXPECTED),
    }
}

/// Runs `job` against the coordinator, streams its events to `out`, then
/// reports each device's outcome and a summary. Returns the exit code of
/// the first failure.
pub fn run_job<J>(
    operation: &'static str,
    coordinator: Coordinator,
    events: Receiver<OperationEvent>,
    out: &mut dyn Reporter,
    job: J,
) -> i32
where
    J: FnOnce(&mut Coordinator) -> Outcomes + Send,
{
    let mut recorder = OperationRecorder::new(operation);
    let outcomes = context::drive(
        coordinator,
        events,
        |ev| {
            recorder.observe(&ev);
            out.emit(Event::Operation(ev));
        },
        job,
    );

    let Some(outcomes) = outcomes else {
        out.emit(Event::Error {
            code: exit_codes::EXIT_UNEXPECTED,
            message: "coordinator thread panicked".to_string(),
        });
        return exit_codes::EXIT_UNEXPECTED;
    };

    let mut exit = exit_codes::EXIT_OK;
    for (device, r) in outcomes {
        match r {
            Ok(outcome) => {
                if !outcome.is_ok() && exit == exit_codes::EXIT_OK {
                    exit = outcome_exit_code(&outcome);
                }
                out.emit(Event::Outcome { device, outcome });
            }
            Err(e) => {
                let code = exit_codes::for_kind(e.kind());
                if exit == exit_codes::EXIT_OK {
                    exit = code;
                }
                recorder.device_failed(&device);
                out.emit(Event::DeviceError {
                    device,
                    code,
                    message: e.to_string(),
                });
            }
        }
    }

    let message = (exit != exit_codes::EXIT_OK).then(|| "one or more devices failed".to_string());
    out.emit(Event::OperationSummary(recorder.finish(exit, message)));
    exit
}
