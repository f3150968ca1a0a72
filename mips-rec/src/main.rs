//! Command line runner for the recompiler.
//!
//! Usage:
//!   mips-rec run program.elf --cycles 100000000 --stats
//!   mips-rec run payload.bin --load-addr 0x80010000 --threaded false

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use mips_rec::cpu::reg;
use mips_rec::loader::load_image;
use mips_rec::memory::layout::psx_default_map;
use mips_rec::{CopOps, Engine, EngineConfig, ExitFlags};

#[derive(Parser, Debug)]
#[command(author, version, about = "MIPS R3000A dynamic recompiler")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a guest image into the PlayStation memory map and run it
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// ELF executable or raw binary
    image: PathBuf,

    /// BIOS ROM image
    #[arg(long)]
    bios: Option<PathBuf>,

    /// Entry point (defaults to the ELF entry or the raw load address)
    #[arg(long, value_parser = parse_u32)]
    entry: Option<u32>,

    /// Load address of raw images
    #[arg(long, value_parser = parse_u32, default_value = "0x80010000")]
    load_addr: u32,

    /// Initial stack pointer
    #[arg(long, value_parser = parse_u32, default_value = "0x801ffff0")]
    sp: u32,

    /// Total guest cycles to run
    #[arg(long, default_value_t = 100_000_000)]
    cycles: u64,

    /// Cycles per call into the engine
    #[arg(long, default_value_t = 1_000_000)]
    slice: u32,

    /// Engine configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Compile on a background thread
    #[arg(long)]
    threaded: Option<bool>,

    /// Compile blocks without interpreting them first
    #[arg(long)]
    no_first_pass: bool,

    /// Never compile; interpret every block
    #[arg(long)]
    interpreter: bool,

    /// Record engine events and dump the last ones on exit
    #[arg(long)]
    trace: bool,

    /// Print engine diagnostics as JSON on exit
    #[arg(long)]
    stats: bool,
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.command {
        Command::Run(run) => run_image(run),
    }
}

fn engine_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_json(&json)?
        }
        None => EngineConfig::default(),
    };
    if let Some(threaded) = args.threaded {
        config.threaded = threaded;
    }
    if args.no_first_pass {
        config.first_pass = false;
    }
    if args.trace {
        config.trace_enabled = true;
    }
    if args.interpreter {
        config.threaded = false;
    }
    Ok(config)
}

fn run_image(args: RunArgs) -> Result<()> {
    if args.slice == 0 {
        bail!("--slice must be positive");
    }
    let config = engine_config(&args)?;

    let bios = match &args.bios {
        Some(path) => fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => Vec::new(),
    };
    let mut memory = psx_default_map(&bios)?;

    let image = fs::read(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;
    let loaded = load_image(&mut memory, &image, args.load_addr)?;
    log::info!(
        "Loaded {} ({:?}, {} bytes)",
        args.image.display(),
        loaded.format,
        loaded.total_bytes()
    );

    let mut engine = Engine::new(memory, CopOps::default(), config)?;
    engine.registers_mut().set(reg::SP, args.sp);

    let mut pc = args.entry.unwrap_or(loaded.entry);
    let mut executed: u64 = 0;
    let mut exit = ExitFlags::empty();

    while executed < args.cycles {
        let start = engine.current_cycle();
        let slice = args.slice.min((args.cycles - executed).min(u64::from(u32::MAX)) as u32);

        pc = if args.interpreter {
            interpret_slice(&mut engine, pc, start.wrapping_add(slice))
        } else {
            engine.run(pc, start.wrapping_add(slice))
        };
        executed += u64::from(engine.current_cycle().wrapping_sub(start));

        exit = engine.exit_flags();
        if exit == ExitFlags::CHECK_INTERRUPT {
            // No interrupt controller here: just keep going.
            continue;
        }
        if !exit.is_normal() {
            break;
        }
    }

    if exit.is_normal() {
        log::info!("Ran {executed} cycles, next PC {pc:#010x}");
    } else {
        log::warn!("Stopped at {pc:#010x} after {executed} cycles: {exit:?}");
    }

    if args.trace {
        engine.trace().dump_recent(32);
    }
    if args.stats {
        engine.wait_for_compiler();
        println!("{}", engine.diagnostics_json()?);
    }
    Ok(())
}

/// Interpret blocks until `target` or an exit condition.
fn interpret_slice(engine: &mut Engine, mut pc: u32, target: u32) -> u32 {
    engine.set_target_cycle(target);
    loop {
        pc = engine.run_interpreter(pc);
        if !engine.exit_flags().is_normal() || engine.current_cycle() >= target {
            return pc;
        }
    }
}
