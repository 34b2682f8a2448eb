use std::path::{Path, PathBuf};

use superchis_burner::coordinator::backup_path;
use superchis_burner::{DeviceId, Work};

use crate::cli;
use crate::commands::{connect_selected, run_job};
use crate::context::{self, Bench};
use crate::exit_codes;
use crate::output::{Event, Reporter};

/// One device writes to `output` itself; several write one file each
/// inside `output` as a directory.
pub fn target_paths(output: &Path, ids: &[DeviceId]) -> Vec<(DeviceId, PathBuf)> {
    match ids {
        [only] if !output.is_dir() => vec![(only.clone(), output.to_path_buf())],
        _ => ids
            .iter()
            .map(|id| (id.clone(), backup_path(output, id)))
            .collect(),
    }
}

pub fn run(args: cli::BackupArgs, out: &mut dyn Reporter) -> i32 {
    let mut bench = Bench::new(&args.conn);
    let (devices, ids) = match context::discover(&mut bench, &args.select, out) {
        Ok(v) => v,
        Err(code) => return code,
    };

    if ids.len() > 1 {
        if let Err(e) = std::fs::create_dir_all(&args.output_path) {
            out.emit(Event::Error {
                code: exit_codes::EXIT_INVALID_INPUT,
                message: format!("{}: {e}", args.output_path.display()),
            });
            return exit_codes::EXIT_INVALID_INPUT;
        }
    }
    let paths = target_paths(&args.output_path, &ids);
    let limit = args.size;

    let opts = context::coordinator_options(&args.conn, None);
    let (coordinator, events) = context::coordinator(&bench, &devices, opts);

    run_job("backup", coordinator, events, out, move |c| {
        let (ready, mut outcomes) = connect_selected(c, &ids);
        let batch = c.run_batch(&ready, |id| Work::Backup {
            path: paths
                .iter()
                .find(|(d, _)| d == id)
                .map(|(_, path)| path.clone())
                .unwrap_or_else(|| backup_path(Path::new("."), id)),
            limit,
        });
        outcomes.extend(batch.outcomes);
        outcomes
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_device_writes_the_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dump.bin");
        let paths = target_paths(&file, &[DeviceId::new("/dev/ttyACM0")]);
        assert_eq!(paths[0].1, file);
    }

    #[test]
    fn several_devices_write_into_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ids = [DeviceId::new("/dev/ttyACM0"), DeviceId::new("/dev/ttyACM1")];
        let paths = target_paths(dir.path(), &ids);
        assert_eq!(paths[1].1, dir.path().join("dev_ttyACM1.bin"));
    }
}
