use std::process;

use clap::Parser;

mod cli;
mod commands;
mod context;
mod exit_codes;
mod logging;
mod output;

fn main() {
    logging::init_tracing();

    let cli = cli::Cli::parse();

    let exit_code = match cli.command {
        cli::Command::List(args) => {
            let mut out = output::make_for_list(&args);
            let code = commands::list::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Check(args) => {
            let mut out = output::make(&args.output);
            let code = commands::check::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Produce(args) => {
            let mut out = output::make(&args.output);
            let code = commands::produce::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::ResetNor(args) => {
            let mut out = output::make(&args.output);
            let code = commands::reset_nor::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Backup(args) => {
            let mut out = output::make(&args.output);
            let code = commands::backup::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Watch(args) => {
            let mut out = output::make(&args.output);
            let code = commands::watch::run(args, &mut *out);
            out.finish();
            code
        }
    };

    process::exit(exit_code);
}
