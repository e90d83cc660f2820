//! Pulseshaper - closed-loop AWG pulse shaping
//!
//! Entry point for the command-line loop runner.

use anyhow::{bail, Context, Result};
use pulseshaper::correction::{FilterRegistry, StrategyRegistry};
use pulseshaper::device::DeviceLock;
use pulseshaper::session::{
    Backend, Decision, DecisionRequest, FeedbackLoopController, Operator, SessionConfig,
    SessionState,
};
use pulseshaper::sim::{AmplifierModel, ScopeSettings, SimulatedAwg, SimulatedScope};
use pulseshaper::trace::{shapes, LoadOptions, Trace, TraceKind, TrimMethod};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};

/// Full scale of the simulated AWG DAC
const SIM_DAC_FULL_SCALE: f64 = 8191.0;

/// Samples of leftover waveform beyond the pulse in the simulated AWG
const SIM_TRAILING_SAMPLES: usize = 32;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulseshaper=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut target_path: Option<PathBuf> = None;
    let mut simulate = false;
    let mut amplifier = false;
    let mut auto = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => {
                list_plugins();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("pulseshaper {} ({})", pulseshaper::VERSION, pulseshaper::BUILD_DATE);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--config" | "-c" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --config requires a path");
                    return Ok(());
                }
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
                continue;
            }
            "--target" | "-t" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --target requires a path");
                    return Ok(());
                }
                target_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
                continue;
            }
            "--simulate" | "-s" => simulate = true,
            "--amplifier" => amplifier = true,
            "--auto" | "-a" => auto = true,
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => SessionConfig::load_strict(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if auto {
        config.safety.auto_loop = true;
    }

    run(config, target_path, simulate, amplifier)
}

fn print_help() {
    println!("Usage: pulseshaper [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH   Session configuration (JSON)");
    println!("  -t, --target PATH   Target curve, one value per line (default: square pulse)");
    println!("  -s, --simulate      Run against the simulated AWG and scope");
    println!("      --amplifier     Pass the simulated pulse through the amplifier model");
    println!("  -a, --auto          Apply each iteration after a countdown instead of asking");
    println!("  -l, --list          List correction strategies and smoothing filters");
    println!("  -v, --version       Show version");
    println!("  -h, --help          Show this help");
    println!();
    println!("Examples:");
    println!("  pulseshaper --simulate --auto");
    println!("  pulseshaper -c session.json -t target.txt --simulate --amplifier");
    println!();
    println!("Press Ctrl+C to abort a running session at the next safe point.");
}

fn list_plugins() {
    println!("Correction strategies:");
    for name in StrategyRegistry::new().names() {
        println!("  {}", name);
    }
    println!();
    println!("Smoothing filters:");
    for name in FilterRegistry::new().names() {
        println!("  {}", name);
    }
}

fn run(
    mut config: SessionConfig,
    target_path: Option<PathBuf>,
    simulate: bool,
    amplifier: bool,
) -> Result<()> {
    let pulse_size = config.awg.pulse_size;
    let target = match &target_path {
        Some(path) => Trace::load(
            path,
            TraceKind::Target,
            LoadOptions {
                num_points: pulse_size,
                trim: TrimMethod::Resample,
            },
            None,
        )?,
        None => Trace::target("square", shapes::square(pulse_size)),
    };

    let backend = if simulate {
        simulated_backend(&mut config, amplifier)
    } else if config.loopback {
        Backend::Loopback {
            initial_output: vec![0.5; pulse_size],
        }
    } else {
        bail!("no hardware transport is built in; use --simulate or set \"loopback\": true");
    };

    let lock = DeviceLock::new(&config.awg.prefix);
    let mut session =
        FeedbackLoopController::new(config, target, backend, Box::new(ConsoleOperator), lock)?;

    let abort = session.abort_handle();
    ctrlc::set_handler(move || {
        abort.request();
    })
    .ok();

    println!("Pulseshaper v{}", pulseshaper::VERSION);
    println!("────────────────────────────────────────");

    session.start()?;
    loop {
        let result = session.run();
        print_status(&session);
        match result {
            Ok(SessionState::Paused) => {
                if !confirm("Session paused. Resume? [y/N] ")? {
                    println!("Leaving session paused at iteration {}.", session.iteration());
                    return Ok(());
                }
                session.resume()?;
            }
            Ok(state) => {
                info!(%state, "Loop ended");
                println!("Loop ended: {}", state);
                return Ok(());
            }
            Err(e) => {
                error!("Loop stopped: {}", e);
                println!("Loop stopped ({}): {}", session.state(), e);
                return Err(e.into());
            }
        }
    }
}

/// Simulated AWG starting from a ramp with some leftover waveform past the
/// pulse, read by a simulated scope. The crop window follows the scope's
/// record geometry.
fn simulated_backend(config: &mut SessionConfig, amplifier: bool) -> Backend {
    let pulse_size = config.awg.pulse_size;
    let mut samples: Vec<f64> = shapes::ramp(0.2, 0.8, pulse_size)
        .into_iter()
        .map(|v| v * SIM_DAC_FULL_SCALE)
        .collect();
    samples.resize(pulse_size + SIM_TRAILING_SAMPLES, 0.05 * SIM_DAC_FULL_SCALE);
    let awg = SimulatedAwg::new(&config.awg.prefix, SIM_DAC_FULL_SCALE, samples);

    let mut scope = SimulatedScope::new(awg.clone(), ScopeSettings::centered(pulse_size));
    if amplifier {
        scope = scope.with_amplifier(AmplifierModel::default());
    }
    let (start, length) = scope.pulse_window();
    config.feedback.crop = Some([start, length]);

    let background = Some(scope.background());
    Backend::Devices {
        awg: Box::new(awg),
        feedback: Box::new(scope),
        background,
    }
}

fn print_status(session: &FeedbackLoopController) {
    let peak = session.last_plan().map(|p| p.peak_power).unwrap_or(f64::NAN);
    println!(
        "Iteration: {:>4} | RMS: {:>7.4} | Peak Power: {:>6.2} | Gain: {:.2}",
        session.iteration(),
        session.rms_error(),
        peak,
        session.gain()
    );
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim(), "y" | "Y" | "yes"))
}

/// Asks on the terminal at each decision point
struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn decide(&mut self, request: &DecisionRequest) -> Decision {
        println!(
            "Iteration: {:>4} | RMS: {:>7.4} | Peak Power: {:>6.2} (limit {:.2}) | Gain: {:.2}",
            request.iteration,
            request.rms_error,
            request.peak_power,
            request.peak_power_limit,
            request.gain
        );

        let stdin = io::stdin();
        loop {
            print!("[Enter] apply, g <gain> recalculate, p pause, q abort: ");
            if io::stdout().flush().is_err() {
                return Decision::Abort;
            }
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return Decision::Abort,
                Ok(_) => {}
            }

            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (None, _) => return Decision::Proceed,
                (Some("p"), None) => return Decision::Pause,
                (Some("q"), None) => return Decision::Abort,
                (Some("g"), Some(value)) => match value.parse::<f64>() {
                    Ok(gain) => return Decision::Recalc(gain),
                    Err(_) => println!("Invalid gain: {}", value),
                },
                _ => println!("Unrecognised input"),
            }
        }
    }
}
