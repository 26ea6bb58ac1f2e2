//! Integration test for environment and communicator lifecycle.
//!
//! Exercises Environment::init, world, handle cloning, local argument
//! validation, and the finalized state after drop.
//!
//! Run with: cargo run --example test_lifecycle

use meshcast::{Environment, Error, GroupConfig};
use std::net::TcpListener;
use std::process::{Command, exit};

const MEMBERS: i32 = 2;

fn main() {
    env_logger::init();
    if std::env::var_os("MESHCAST_RENDEZVOUS").is_some() {
        member();
        return;
    }
    exit(launch_group(MEMBERS));
}

fn member() {
    let config = GroupConfig::from_env().expect("MESHCAST_* configuration");
    let env = Environment::init(config).expect("group formation failed");

    // Test world
    let world = env.world();
    let rank = world.rank();
    let size = world.size();
    assert!(rank >= 0 && rank < size, "rank should be in [0, size)");
    assert!(size >= 1, "size should be >= 1");
    println!("PASS: world rank={} size={}", rank, size);

    // Test cloned handles: both observe the same group and the same
    // collective sequence
    let world2 = world.clone();
    assert_eq!(world2.rank(), rank);
    assert_eq!(world2.size(), size);
    let mut value = if rank == 0 { 11u32 } else { 0 };
    world.broadcast_value(&mut value, 0).expect("broadcast via first handle");
    assert_eq!(value, 11);
    let mut value = if rank == 0 { 22u32 } else { 0 };
    world2.broadcast_value(&mut value, 0).expect("broadcast via cloned handle");
    assert_eq!(value, 22);
    println!("PASS: cloned handles share one sequence");

    // Test that a rejected argument does not consume a collective slot:
    // the group stays aligned afterwards
    let mut buf = [0i64; 2];
    match world.broadcast(&mut buf, size) {
        Err(Error::InvalidRank(r)) => assert_eq!(r, size),
        other => panic!("expected InvalidRank, got {other:?}"),
    }
    let mut probe = if rank == 0 { 33i64 } else { 0 };
    world.broadcast_value(&mut probe, 0).expect("broadcast after rejection");
    assert_eq!(probe, 33);
    println!("PASS: invalid root rejected without breaking the group");

    // Synchronize, then retire the membership
    world.barrier().expect("final barrier failed");
    drop(env);

    // Test finalized state: every collective now fails with Lifecycle
    match world.barrier() {
        Err(Error::Lifecycle(_)) => {}
        other => panic!("expected Lifecycle after drop, got {other:?}"),
    }
    let mut late = 0u8;
    match world2.broadcast_value(&mut late, 0) {
        Err(Error::Lifecycle(_)) => {}
        other => panic!("expected Lifecycle after drop, got {other:?}"),
    }
    println!("PASS: finalized communicator refuses collectives");

    if rank == 0 {
        println!("\n========================================");
        println!("All lifecycle tests passed!");
        println!("========================================");
    }
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
