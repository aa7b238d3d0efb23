//! Lockstep simulator - runs the sync engine offline
//!
//! Builds an engine, applies the actions of a scenario at their times and
//! processes buffers as fast as possible, logging the master and every
//! synced deck once per simulated second.
//!
//! ## Usage
//!
//! ```text
//! lockstep-sim [scenario.yaml] [--config path] [--seconds N]
//! ```
//!
//! Without a scenario file the built-in handover scenario runs. Without
//! `--config` the engine config is read from `~/.config/lockstep/sync.yaml`.

mod scenario;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use lockstep_core::config::{default_config_path, load_config, read_config, SyncConfig};
use lockstep_core::control::{ControlKey, DeckControl, GlobalControl};
use lockstep_core::engine::{create_engine, EngineController, SyncRole};
use lockstep_core::DeckId;

use scenario::Scenario;

#[derive(Debug, Default)]
struct Args {
    scenario: Option<PathBuf>,
    config: Option<PathBuf>,
    seconds: Option<f64>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--seconds" => {
                let value = iter.next().context("--seconds needs a value")?;
                let seconds = value
                    .parse()
                    .with_context(|| format!("Invalid --seconds value: {}", value))?;
                args.seconds = Some(seconds);
            }
            "-h" | "--help" => {
                println!("Usage: lockstep-sim [scenario.yaml] [--config path] [--seconds N]");
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("Unknown option: {}", other),
            other => {
                if args.scenario.is_some() {
                    bail!("Only one scenario file can be given");
                }
                args.scenario = Some(PathBuf::from(other));
            }
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;

    let config: SyncConfig = match &args.config {
        Some(path) => read_config(path)?,
        None => load_config(&default_config_path("sync.yaml")),
    };

    let mut scenario: Scenario = match &args.scenario {
        Some(path) => read_config(path)?,
        None => {
            log::info!("No scenario given, running the built-in handover scenario");
            Scenario::default()
        }
    };
    if let Some(seconds) = args.seconds {
        scenario.seconds = seconds;
    }
    scenario.validate()?;

    run(&scenario, config)
}

fn run(scenario: &Scenario, config: SyncConfig) -> Result<()> {
    let (mut engine, mut controller, external) = create_engine(config);
    let sample_rate = controller.config().sample_rate;

    for track in &scenario.tracks {
        scenario::load_track(&mut controller, track, sample_rate)?;
    }

    let timeline = scenario.timeline();
    let mut next_action = 0;
    let buffer_seconds = scenario.buffer_size as f64 / sample_rate as f64;
    let buffers = (scenario.seconds / buffer_seconds).ceil() as u64;
    let buffers_per_report = ((1.0 / buffer_seconds).round() as u64).max(1);

    log::info!(
        "Running {:.1}s: {} buffers of {} frames at {} Hz",
        scenario.seconds,
        buffers,
        scenario.buffer_size,
        sample_rate
    );

    for n in 0..buffers {
        let now = n as f64 * buffer_seconds;
        while let Some(action) = timeline.get(next_action).filter(|a| a.at <= now) {
            scenario::apply(action, &mut controller, &external)?;
            next_action += 1;
        }

        engine.process(scenario.buffer_size);
        controller.drain_events();

        if (n + 1) % buffers_per_report == 0 {
            report(&controller, (n + 1) as f64 * buffer_seconds);
        }
    }

    if engine.dropped_events() > 0 {
        log::warn!("{} engine events were dropped", engine.dropped_events());
    }
    log::info!("Simulation finished");
    Ok(())
}

/// Log the master and the state of every deck that takes part in sync
fn report(controller: &EngineController, time: f64) {
    let global = |control| {
        controller
            .get_key(ControlKey::Global(control))
            .unwrap_or_default()
    };
    let source = match global(GlobalControl::MasterSource) {
        s if s > 0.0 => format!("deck {}", s as usize),
        s if s < 0.0 => "external".to_string(),
        _ => "internal".to_string(),
    };
    log::info!(
        "t={:6.2}s master {:>8} {:7.3} BPM phase {:.3}",
        time,
        source,
        global(GlobalControl::MasterBpm),
        global(GlobalControl::MasterPhase)
    );

    for deck in DeckId::all() {
        let get = |control| {
            controller
                .get_key(ControlKey::Deck(deck, control))
                .unwrap_or_default()
        };
        let role = match get(DeckControl::SyncRole) as u8 {
            2 => SyncRole::Master,
            1 => SyncRole::Follower,
            _ => SyncRole::None,
        };
        if role == SyncRole::None && get(DeckControl::Play) == 0.0 {
            continue;
        }
        log::info!(
            "    deck {} {:>8} {:7.3} BPM rate {:.5} phase {:.3} error {:+.4}",
            deck,
            role,
            get(DeckControl::Bpm),
            get(DeckControl::EffectiveRate),
            get(DeckControl::Phase),
            get(DeckControl::PhaseError)
        );
    }
}
