// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Drives a multi-unit active message queue simulation in one process: each
//! unit sends one record per round to its ring-topology neighbor, then
//! calls `sync` so every unit drains before the next round starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::info;

use amq_core::{AmqContext, Handler, HandlerMode, Queue};
use amq_team::Team;

#[derive(Parser, Debug)]
#[command(about = "Simulates a multi-unit active message queue in one process")]
struct Cli {
    /// Number of simulated units.
    #[arg(long, default_value_t = 4)]
    units: usize,

    /// Capacity, in bytes, of each unit's queue ring.
    #[arg(long, default_value_t = 4096)]
    capacity: usize,

    /// Number of send-then-sync rounds to run.
    #[arg(long, default_value_t = 10)]
    rounds: usize,

    /// Increase logging verbosity (-v for info, -vv for debug).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Total deliveries across every unit. A real deployment would have one
/// process (and address space) per unit; this demo runs every unit as a
/// thread in one process, so a single global counter is enough to show the
/// simulation actually delivered what it sent.
static DELIVERED: AtomicU64 = AtomicU64::new(0);

fn echo(data: &[u8]) {
    DELIVERED.fetch_add(1, Ordering::Relaxed);
    info!("handler invoked with {}-byte payload", data.len());
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if cli.units < 2 {
        eprintln!("--units must be at least 2");
        std::process::exit(1);
    }

    let team = Team::world(cli.units);

    std::thread::scope(|scope| {
        for rank in 0..cli.units {
            let team = Arc::clone(&team);
            let rounds = cli.rounds;
            let capacity = cli.capacity;
            scope.spawn(move || run_unit(team, rank as u32, capacity, rounds));
        }
    });

    println!(
        "{} units, {} rounds: {} messages delivered",
        cli.units,
        cli.rounds,
        DELIVERED.load(Ordering::Relaxed)
    );
}

fn run_unit(team: Arc<Team>, rank: u32, capacity: usize, rounds: usize) {
    let unit = team.unit(rank);
    let ctx = Arc::new(AmqContext::new(unit.clone()));
    ctx.init().expect("init collective failed");

    // Every unit registers the same handler in the same order, so the
    // assigned HandlerId is identical everywhere.
    let handler_id = ctx.register_handler(echo);

    let queue = Queue::open(capacity, unit.clone(), Arc::clone(&ctx), HandlerMode::Registry)
        .expect("failed to open queue");

    let target = (rank + 1) % team.size() as u32;

    for round in 0..rounds {
        let payload = (round as u64).to_ne_bytes();
        // Each unit has exactly one ring-topology neighbor sending to it
        // per round, and sync drains before the next round starts, so a
        // sanely sized ring never sees AGAIN here.
        queue
            .trysend(target, Handler::Registry(handler_id), &payload)
            .unwrap_or_else(|e| panic!("unit {rank}: trysend to {target} failed: {e}"));

        queue.sync().expect("sync failed");
    }

    queue.close().expect("close failed");
}
