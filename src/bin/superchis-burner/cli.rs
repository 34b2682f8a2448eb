use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum JsonProgressArg {
    /// Emit a JSON event for every chunk.
    Chunks,
    /// Throttle chunk progress to percent changes.
    Percent,
    /// Do not emit per-chunk progress events.
    None,
}

#[derive(Parser)]
#[command(name = "superchis-burner")]
#[command(about = "Quality-check and production burner for SuperChis cartridges")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List attached burners.
    List(ListArgs),

    /// Run the cartridge quality check (SDRAM, SRAM, flash blank, PPB).
    Check(CheckArgs),

    /// Write a ROM image and verify it.
    Produce(ProduceArgs),

    /// Clear the NOR game table from flash.
    ResetNor(ResetNorArgs),

    /// Dump cartridge flash to a file.
    Backup(BackupArgs),

    /// Process cartridges as burners are plugged in.
    Watch(WatchArgs),
}

#[derive(Args, Clone)]
pub struct ConnectionArgs {
    /// USB vendor id of the burner (hex).
    #[arg(long, value_parser = parse_hex_u16, default_value = "0483")]
    pub vid: u16,

    /// USB product id of the burner (hex).
    #[arg(long, value_parser = parse_hex_u16, default_value = "0721")]
    pub pid: u16,

    /// Bound on waiting for read data from the burner.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Delay between device starts when running on several burners.
    #[arg(long, default_value_t = 500)]
    pub stagger_ms: u64,

    /// Use N simulated cartridges instead of serial ports.
    #[arg(long, value_name = "N")]
    pub simulate: Option<usize>,
}

#[derive(Args, Clone)]
pub struct SelectArgs {
    /// Run on every attached burner.
    #[arg(long, conflicts_with = "device")]
    pub all: bool,

    /// Select a burner (e.g. /dev/ttyACM0, COM6, serial:SN, index:0).
    #[arg(long, conflicts_with = "all")]
    pub device: Option<String>,
}

#[derive(Args, Clone)]
pub struct OutputArgs {
    /// Emit JSON line events to stdout.
    #[arg(long)]
    pub json: bool,

    /// Include monotonic timestamps in JSON events (milliseconds since process start).
    #[arg(long, requires = "json")]
    pub json_timestamps: bool,

    /// JSON progress verbosity.
    #[arg(long, value_enum, default_value_t = JsonProgressArg::Percent, requires = "json")]
    pub json_progress: JsonProgressArg,

    /// Reduce output (only errors).
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// More output to stderr.
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Args, Clone)]
pub struct QualityArgs {
    #[arg(long)]
    pub no_sdram: bool,

    #[arg(long)]
    pub no_sram: bool,

    /// Skip the flash blank check (and its erase).
    #[arg(long)]
    pub no_blank: bool,

    #[arg(long)]
    pub no_ppb: bool,

    /// Bytes of SDRAM to exercise.
    #[arg(long, default_value_t = 256 * 1024)]
    pub sdram_bytes: usize,

    /// Only check that each SRAM bank holds a short pattern.
    #[arg(long)]
    pub basic_sram: bool,

    /// Erase and blank-check the chip edges plus a few sampled regions
    /// instead of the leading bytes.
    #[arg(long)]
    pub fast_flash: bool,

    /// Seed for test patterns and sampled regions (default: fixed, or the
    /// clock with --fast-flash).
    #[arg(long)]
    pub seed: Option<u32>,
}

#[derive(Parser)]
pub struct ListArgs {
    /// Connect to each burner and report its flash chip.
    #[arg(long)]
    pub probe: bool,

    #[command(flatten)]
    pub conn: ConnectionArgs,

    /// Emit JSON line output.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct CheckArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    #[command(flatten)]
    pub quality: QualityArgs,

    #[command(flatten)]
    pub conn: ConnectionArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct ProduceArgs {
    /// ROM image to write.
    pub rom: PathBuf,

    /// Run the quality check first and skip cartridges that fail it.
    #[arg(long)]
    pub check: bool,

    #[command(flatten)]
    pub select: SelectArgs,

    #[command(flatten)]
    pub quality: QualityArgs,

    #[command(flatten)]
    pub conn: ConnectionArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct ResetNorArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    #[command(flatten)]
    pub conn: ConnectionArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct BackupArgs {
    /// Output file, or a directory when used with --all.
    #[arg(long, short)]
    pub output_path: PathBuf,

    /// Bytes to read (capped at the chip size).
    #[arg(long, default_value_t = 128 * 1024 * 1024)]
    pub size: u64,

    #[command(flatten)]
    pub select: SelectArgs,

    #[command(flatten)]
    pub conn: ConnectionArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct WatchArgs {
    /// ROM image to write to each cartridge.
    #[arg(long)]
    pub rom: Option<PathBuf>,

    /// Do not run the quality check before writing.
    #[arg(long)]
    pub no_check: bool,

    /// Stop after this many cartridges (0 = run until interrupted).
    #[arg(long, default_value_t = 0)]
    pub count: usize,

    /// Device scan interval.
    #[arg(long, default_value_t = 2000)]
    pub scan_interval_ms: u64,

    #[command(flatten)]
    pub quality: QualityArgs,

    #[command(flatten)]
    pub conn: ConnectionArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_ids_accept_optional_prefix() {
        assert_eq!(parse_hex_u16("0483"), Ok(0x0483));
        assert_eq!(parse_hex_u16("0x0721"), Ok(0x0721));
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn produce_parses_selection_and_rom() {
        let cli = Cli::try_parse_from([
            "superchis-burner",
            "produce",
            "game.gba",
            "--all",
            "--json",
            "--stagger-ms",
            "0",
        ])
        .unwrap();
        let Command::Produce(args) = cli.command else {
            panic!("expected produce");
        };
        assert!(args.select.all);
        assert!(args.output.json);
        assert_eq!(args.conn.stagger_ms, 0);
        assert_eq!(args.rom, PathBuf::from("game.gba"));
    }

    #[test]
    fn check_parses_quality_modes() {
        let cli = Cli::try_parse_from([
            "superchis-burner",
            "check",
            "--basic-sram",
            "--fast-flash",
            "--seed",
            "99",
        ])
        .unwrap();
        let Command::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert!(args.quality.basic_sram);
        assert!(args.quality.fast_flash);
        assert_eq!(args.quality.seed, Some(99));
        assert!(!args.quality.no_blank);
    }

    #[test]
    fn all_conflicts_with_device() {
        let r = Cli::try_parse_from(["superchis-burner", "check", "--all", "--device", "index:0"]);
        assert!(r.is_err());
    }
}
