use std::path::Path;
use std::sync::Arc;

use superchis_burner::{DeviceId, Work};

use crate::cli;
use crate::commands::{connect_selected, run_job};
use crate::context::{self, Bench};
use crate::exit_codes;
use crate::output::{Event, Reporter};

pub fn load_rom(path: &Path, out: &mut dyn Reporter) -> Result<Arc<[u8]>, i32> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => {
            out.emit(Event::Error {
                code: exit_codes::EXIT_INVALID_INPUT,
                message: format!("{}: ROM image is empty", path.display()),
            });
            Err(exit_codes::EXIT_INVALID_INPUT)
        }
        Ok(bytes) => {
            tracing::info!(path = %path.display(), bytes = bytes.len(), "ROM image loaded");
            Ok(bytes.into())
        }
        Err(e) => {
            out.emit(Event::Error {
                code: exit_codes::EXIT_INVALID_INPUT,
                message: format!("{}: {e}", path.display()),
            });
            Err(exit_codes::EXIT_INVALID_INPUT)
        }
    }
}

pub fn run(args: cli::ProduceArgs, out: &mut dyn Reporter) -> i32 {
    let rom = match load_rom(&args.rom, out) {
        Ok(rom) => rom,
        Err(code) => return code,
    };

    let mut bench = Bench::new(&args.conn);
    let (devices, ids) = match context::discover(&mut bench, &args.select, out) {
        Ok(v) => v,
        Err(code) => return code,
    };

    let opts = context::coordinator_options(&args.conn, Some(&args.quality));
    let (coordinator, events) = context::coordinator(&bench, &devices, opts);
    let check_first = args.check;

    run_job("produce", coordinator, events, out, move |c| {
        let (ready, mut outcomes) = connect_selected(c, &ids);

        let to_write: Vec<DeviceId> = if check_first {
            let mut passed = Vec::new();
            for (id, r) in c.run_batch(&ready, |_| Work::QualityCheck).outcomes {
                match &r {
                    Ok(o) if o.is_ok() => passed.push(id),
                    _ => outcomes.push((id, r)),
                }
            }
            passed
        } else {
            ready
        };

        let batch = c.run_batch(&to_write, |_| Work::Production(rom.clone()));
        outcomes.extend(batch.outcomes);
        outcomes
    })
}
