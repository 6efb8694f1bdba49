mod emulator;

use std::path::PathBuf;

use chip8_vm::state::{DEFAULT_FRAME_RATE, DEFAULT_INSTRUCTIONS_PER_SECOND, Quirks};
use clap::Parser;

use crate::emulator::{Emulator, Settings};

/// A CHIP-8 emulator for the terminal
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the ROM to run
    rom: PathBuf,

    /// Frames (and timer ticks) per second
    #[arg(long, default_value_t = DEFAULT_FRAME_RATE, value_parser = clap::value_parser!(u64).range(1..))]
    frame_rate: u64,

    /// Instructions executed per second
    #[arg(long, default_value_t = DEFAULT_INSTRUCTIONS_PER_SECOND)]
    ips: u64,

    /// Shift Vy into Vx for 8xy6/8xyE instead of shifting Vx in place
    #[arg(long)]
    shift_uses_vy: bool,

    /// Advance I past the last register after Fx55/Fx65
    #[arg(long)]
    increment_index: bool,

    /// Clear VF after 8xy1/8xy2/8xy3
    #[arg(long)]
    logic_resets_vf: bool,

    /// Seed for the random number instruction
    #[arg(long)]
    seed: Option<u64>,

    /// Trace every executed instruction (use with a redirected stderr)
    #[arg(short, long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "trace" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let settings = Settings {
        frame_rate: args.frame_rate,
        ips: args.ips,
        rom: args.rom,
        quirks: Quirks {
            shift_uses_vy: args.shift_uses_vy,
            load_store_increments_index: args.increment_index,
            logic_resets_vf: args.logic_resets_vf,
        },
        seed: args.seed,
    };

    let mut emulator = Emulator::new(settings)?;
    emulator.run()?;

    Ok(())
}
