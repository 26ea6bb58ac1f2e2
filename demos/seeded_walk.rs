//! Synchronized random walk - broadcasting a seed for deterministic replay.
//!
//! Rank 0 draws a random seed and a step count and broadcasts both. Every
//! member then runs the same seeded walk and must land on the same endpoint,
//! which rank 0's broadcast lets everyone verify bit-for-bit. Shipping a
//! seed instead of the data itself is the classic way to keep replicated
//! state in sync.
//!
//! Run with: cargo run --example seeded_walk

use meshcast::{Environment, GroupConfig, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::net::TcpListener;
use std::process::{Command, exit};
use std::time::Instant;

const MEMBERS: i32 = 4;

fn main() {
    env_logger::init();
    if std::env::var_os("MESHCAST_RENDEZVOUS").is_some() {
        if let Err(err) = member() {
            eprintln!("member failed: {err}");
            exit(1);
        }
        return;
    }
    exit(launch_group(MEMBERS));
}

fn member() -> Result<()> {
    let env = Environment::init(GroupConfig::from_env()?)?;
    let world = env.world();

    let rank = world.rank();
    let size = world.size();

    // Rank 0 decides the walk; everyone else starts with placeholders.
    let mut seed: u64 = 0;
    let mut steps: u64 = 0;
    if rank == 0 {
        let mut entropy = rand::thread_rng();
        seed = entropy.next_u64();
        steps = entropy.gen_range(10_000..100_000);
    }
    world.broadcast_value(&mut seed, 0)?;
    world.broadcast_value(&mut steps, 0)?;

    if rank == 0 {
        println!("╔════════════════════════════════════════════════════╗");
        println!("║            Synchronized Random Walk                ║");
        println!("╠════════════════════════════════════════════════════╣");
        println!("║ Members: {:>8}                                  ║", size);
        println!("║ Steps:   {:>8}                                  ║", steps);
        println!("║ Seed:    {:>20}                      ║", seed);
        println!("╚════════════════════════════════════════════════════╝");
    }

    world.barrier()?;
    let start = Instant::now();

    // Every member replays the identical walk from the shared seed.
    let mut rng = StdRng::seed_from_u64(seed);
    let mut position = [0.0f64; 2];
    for _ in 0..steps {
        let angle: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        position[0] += angle.cos();
        position[1] += angle.sin();
    }
    let elapsed = start.elapsed();

    // Rank 0 publishes its endpoint; every member must have computed the
    // exact same bits.
    let mut reference = position;
    world.broadcast(&mut reference, 0)?;
    assert_eq!(
        position, reference,
        "rank {rank}: walk diverged from rank 0"
    );

    world.barrier()?;

    if rank == 0 {
        println!();
        println!("Endpoint: ({:+.6}, {:+.6})", position[0], position[1]);
        println!("Walk time: {:.4}s", elapsed.as_secs_f64());
        println!("\n✓ All members reproduced the same walk!");
    }

    Ok(())
}

/// Re-execute this binary once per member, pointing the children at a fresh
/// rendezvous address. Returns the exit code for the parent.
fn launch_group(members: i32) -> i32 {
    let probe = TcpListener::bind("127.0.0.1:0").expect("no free loopback port");
    let rendezvous = probe.local_addr().expect("listener address").to_string();
    drop(probe);

    let exe = std::env::current_exe().expect("own executable path");
    let mut children: Vec<_> = (0..members)
        .map(|_| {
            Command::new(&exe)
                .env("MESHCAST_RENDEZVOUS", &rendezvous)
                .env("MESHCAST_WORLD_SIZE", members.to_string())
                .spawn()
                .expect("spawning member process")
        })
        .collect();

    let mut code = 0;
    for child in &mut children {
        if !child.wait().expect("waiting for member process").success() {
            code = 1;
        }
    }
    code
}
