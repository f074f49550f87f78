//! sonolink - Loopback simulator for replicated audio sources
//!
//! Runs a scenario of several peers in one process and reports whether every
//! peer ended up with the same source state.

mod config;
mod error;
mod sim;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::Scenario;
use sim::{SimPeer, Simulation};
use sonolink_core::{ClipHandle, ClipRegistry, SourceOutput};

#[derive(Parser)]
#[command(name = "sonolink")]
#[command(author, version, about = "Loopback simulator for replicated audio sources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Scenario file path (default: ~/.config/sonolink/scenario.toml)
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Override the number of peers
    #[arg(long)]
    peers: Option<usize>,

    /// Override the index of the authoritative peer
    #[arg(long)]
    authority: Option<usize>,

    /// Override the random loop seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the simulated duration in seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Log replication activity (debug level unless RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default scenario file
    Init,
    /// Show the scenario file path
    ConfigPath,
    /// Print the effective scenario as TOML
    Show,
    /// Print the clip ids derived from clip names
    Clips {
        /// Clip names
        #[arg(required = true)]
        names: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    match cli.command {
        Some(Commands::Init) => {
            let path = Scenario::create_default_config_file()?;
            println!("Created default scenario at: {}", path.display());
            return Ok(());
        }
        Some(Commands::ConfigPath) => {
            let path = Scenario::config_path()?;
            println!("{}", path.display());
            return Ok(());
        }
        Some(Commands::Clips { ref names }) => {
            print_clips(names)?;
            return Ok(());
        }
        Some(Commands::Show) | None => {}
    }

    // Load scenario
    let mut scenario = if let Some(path) = &cli.scenario {
        Scenario::load_from(path)?
    } else {
        Scenario::load_or_default()
    };

    // Apply CLI overrides
    if let Some(peers) = cli.peers {
        scenario.session.peers = peers;
    }
    if let Some(authority) = cli.authority {
        scenario.session.authority = authority;
    }
    if let Some(seed) = cli.seed {
        scenario.session.seed = Some(seed);
    }
    if let Some(duration) = cli.duration {
        scenario.session.duration_secs = duration;
    }
    scenario.validate()?;

    if matches!(cli.command, Some(Commands::Show)) {
        print!("{}", scenario.to_toml()?);
        return Ok(());
    }

    run_scenario(&scenario)
}

fn print_clips(names: &[String]) -> Result<()> {
    let catalog = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), ClipHandle(i as u64)));
    let registry = ClipRegistry::build(catalog)?;
    for entry in registry.iter() {
        println!("{:>4}  {}  {}", entry.ordinal, entry.id, entry.name);
    }
    Ok(())
}

fn run_scenario(scenario: &Scenario) -> Result<()> {
    let mut sim = Simulation::new(scenario)?;
    log::info!(
        "Running {} peers for {:.2}s ({} actions)",
        scenario.session.peers,
        scenario.session.duration_secs,
        scenario.actions.len()
    );
    sim.run();

    let summary = sim.summary();
    println!(
        "Simulated {:.2}s in {} ticks, {} actions ({} failed)",
        summary.elapsed, summary.ticks, summary.actions, summary.failed_actions
    );
    println!();
    for peer in sim.peers() {
        print_peer(peer);
    }

    let divergent = sim.divergent_sources();
    if divergent.is_empty() {
        println!("All peers converged.");
        Ok(())
    } else {
        for (peer, source) in &divergent {
            println!("Peer {} source {} differs from the authority", peer, source);
        }
        bail!("{} source(s) diverged", divergent.len())
    }
}

fn print_peer(peer: &SimPeer) {
    let stats = peer.session.dispatcher().stats();
    let role = if peer.session.is_authoritative() {
        " (authority)"
    } else {
        ""
    };
    println!(
        "{}{}: issued {}, relayed {}, applied {}, dropped {}",
        peer.session.local_peer(),
        role,
        stats.issued,
        stats.relayed,
        stats.applied,
        stats.dropped
    );

    for (id, output) in &peer.outputs {
        let clip = output
            .clip()
            .and_then(|handle| peer.clip_name(handle))
            .unwrap_or("-");
        println!(
            "  source {:>3}: {:<8} volume {:.3} (nominal {:.3})  pitch {:.2}  loop {}  clip {}  one-shots {}",
            id.0,
            format!("{:?}", output.play_state()),
            output.volume(),
            peer.session.context().sources.nominal_volume(*id).unwrap_or(0.0),
            output.pitch(),
            if output.looping() { "on" } else { "off" },
            clip,
            peer.one_shots(*id)
        );
    }
    println!();
}
