use std::sync::mpsc::channel;

use superchis_burner::Coordinator;

use crate::cli;
use crate::context::{self, Bench};
use crate::exit_codes;
use crate::output::{Event, ListedDevice, Reporter};

pub fn run(args: cli::ListArgs, out: &mut dyn Reporter) -> i32 {
    let mut bench = Bench::new(&args.conn);
    let devices = match bench.enumerate() {
        Ok(d) => d,
        Err(e) => {
            out.emit(Event::Error {
                code: exit_codes::EXIT_UNEXPECTED,
                message: e.to_string(),
            });
            return exit_codes::EXIT_UNEXPECTED;
        }
    };

    if !args.probe {
        let listed = devices
            .into_iter()
            .map(|info| ListedDevice {
                info,
                flash: None,
                error: None,
            })
            .collect();
        out.emit(Event::ListDevices(listed));
        return exit_codes::EXIT_OK;
    }

    // Probing runs no workers, so the event stream is not needed.
    let (tx, _rx) = channel();
    let opts = context::coordinator_options(&args.conn, None);
    let mut c = Coordinator::new(bench.connector(), opts, tx);

    let listed = devices
        .into_iter()
        .map(|info| {
            c.add_device(info.clone());
            let probed = c.connect(&info.id).and_then(|()| c.query_flash(&info.id));
            let _ = c.disconnect(&info.id);
            match probed {
                Ok(flash) => ListedDevice {
                    info,
                    flash: Some(flash),
                    error: None,
                },
                Err(e) => ListedDevice {
                    info,
                    flash: None,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect();
    out.emit(Event::ListDevices(listed));
    exit_codes::EXIT_OK
}
