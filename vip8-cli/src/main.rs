//! Entrypoint for CLI
use std::{env, error::Error, fs, thread, time::Instant};

use log::{debug, info};
use vip8::{
    constants::{CPU_FREQUENCY, TIMER_FREQUENCY},
    prelude::*,
    Hz, IMPL_VERSION,
};

static USAGE: &str = r#"
usage: vip8 run FILE [STEPS]

commands:
    run     Run the target ROM file headless and print the final screen

examples:
    vip8 run breakout.rom
    vip8 run breakout.rom 50000
"#;

/// Upper bound on executed cycles, for ROMs that never halt.
const DEFAULT_STEP_LIMIT: usize = 20_000;

fn run_rom(filepath: &str, step_limit: usize) -> Vip8Result<()> {
    let rom = fs::read(filepath)?;

    let conf = Vip8Conf::default();
    let mut cpu_clock = Clock::new(conf.cpu_frequency.unwrap_or(Hz(CPU_FREQUENCY)).into());
    let mut timer_clock = Clock::new(conf.timer_frequency.unwrap_or(Hz(TIMER_FREQUENCY)).into());

    let mut vm = Vip8Vm::new(conf);
    vm.load_rom(&rom)?;

    let mut screen = ScreenBuffer::new();

    info!("running {filepath} ({} bytes)", rom.len());
    let start = Instant::now();

    let mut steps = 0;
    while steps < step_limit {
        // The two schedules are independent of one another; neither is
        // tied to the other's rate.
        if timer_clock.tick() && vm.tick_timers() == Tone::Beep {
            debug!("beep");
        }

        if cpu_clock.tick() {
            match vm.step(&mut screen)? {
                Flow::KeyWait => {
                    // A headless host has no keys to offer.
                    info!("halted waiting for a keypress");
                    break;
                }
                _ => steps += 1,
            }
        } else {
            thread::yield_now();
        }
    }

    info!("executed {steps} cycles in {:?}", start.elapsed());
    debug!("{}", vm.registers());
    print!("{screen}");

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    simple_logger::SimpleLogger::new().env().init().unwrap();

    match parse_args() {
        Some(Cmd::Run { filepath, steps }) => run_rom(&filepath, steps)?,
        None => {
            print_usage();
            // FreeBSD EX_USAGE (64)
            std::process::exit(64)
        }
    }

    Ok(())
}

fn parse_args() -> Option<Cmd> {
    let mut args = env::args().skip(1);
    match args.next()?.as_str() {
        "run" => {
            let filepath = args.next()?;
            let steps = match args.next() {
                Some(arg) => arg.parse().ok()?,
                None => DEFAULT_STEP_LIMIT,
            };
            Some(Cmd::Run { filepath, steps })
        }
        _ => None,
    }
}

fn print_usage() {
    println!("vip8 v{IMPL_VERSION}");
    println!("{USAGE}");
}

enum Cmd {
    /// Run file
    Run { filepath: String, steps: usize },
}
