use superchis_burner::Work;

use crate::cli;
use crate::commands::{connect_selected, run_job};
use crate::context::{self, Bench};
use crate::output::Reporter;

pub fn run(args: cli::ResetNorArgs, out: &mut dyn Reporter) -> i32 {
    let mut bench = Bench::new(&args.conn);
    let (devices, ids) = match context::discover(&mut bench, &args.select, out) {
        Ok(v) => v,
        Err(code) => return code,
    };

    let opts = context::coordinator_options(&args.conn, None);
    let (coordinator, events) = context::coordinator(&bench, &devices, opts);

    run_job("reset_nor", coordinator, events, out, move |c| {
        let (ready, mut outcomes) = connect_selected(c, &ids);
        outcomes.extend(c.run_batch(&ready, |_| Work::ResetNor).outcomes);
        outcomes
    })
}
