//! Integration test for the blocking collective operations.
//!
//! Exercises broadcast (several element types, rotating roots, zero-length
//! buffers), broadcast_value, and barrier across a real multi-process group.
//!
//! Each operation is verified with meaningful assertions.
//! A custom panic hook calls `std::process::abort()` so a failing member
//! cannot leave the rest of the group blocked in a collective.
//!
//! Run with: cargo run --example test_collectives
//! (or start MESHCAST_WORLD_SIZE copies by hand with MESHCAST_* set)

use meshcast::{Environment, GroupConfig};
use std::net::TcpListener;
use std::process::{Command, exit};

const MEMBERS: i32 = 4;

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

    // Install a panic hook that aborts the process. When one member panics
    // (e.g., assertion failure), aborting closes its sockets, so the other
    // members fail fast instead of blocking in the collective.
    // NOTE: Installed AFTER Environment::init() so that an ordinary
    // formation failure still exits through the normal error path.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        std::process::abort();
    }));

    let world = env.world();
    let rank = world.rank();
    let size = world.size();

    assert!(size >= 2, "test_collectives requires at least 2 members");

    // ========================================================================
    // Test 1: broadcast (f64 buffer)
    // ========================================================================
    {
        let mut data = vec![0.0f64; 10];
        if rank == 0 {
            for (i, x) in data.iter_mut().enumerate() {
                *x = (i + 1) as f64;
            }
        }
        world.broadcast(&mut data, 0).expect("broadcast failed");
        for (i, &x) in data.iter().enumerate() {
            assert!(
                (x - (i + 1) as f64).abs() < f64::EPSILON,
                "rank {rank}: broadcast data[{i}] = {x}, expected {}",
                (i + 1) as f64
            );
        }
        if rank == 0 {
            println!("PASS: broadcast (f64)");
        }
    }

    // ========================================================================
    // Test 2: broadcast_value (i32 scalar)
    // ========================================================================
    {
        let mut value = if rank == 0 { 42i32 } else { 0 };
        world
            .broadcast_value(&mut value, 0)
            .expect("broadcast_value failed");
        assert_eq!(value, 42, "rank {rank}: broadcast_value mismatch");
        if rank == 0 {
            println!("PASS: broadcast_value (i32)");
        }
    }

    // ========================================================================
    // Test 3: broadcast with i32 type (test generic API)
    // ========================================================================
    {
        let mut data = vec![0i32; 5];
        if rank == 0 {
            data = vec![10, 20, 30, 40, 50];
        }
        world.broadcast(&mut data, 0).expect("broadcast i32 failed");
        assert_eq!(
            data,
            vec![10, 20, 30, 40, 50],
            "rank {rank}: broadcast i32 mismatch"
        );
        if rank == 0 {
            println!("PASS: broadcast (i32 generic)");
        }
    }

    // ========================================================================
    // Test 4: broadcast from every root in turn
    // ========================================================================
    {
        for root in 0..size {
            let mut data = vec![0u64; 4];
            if rank == root {
                for (i, x) in data.iter_mut().enumerate() {
                    *x = root as u64 * 100 + i as u64;
                }
            }
            world
                .broadcast(&mut data, root)
                .expect("rotating-root broadcast failed");
            for (i, &x) in data.iter().enumerate() {
                assert_eq!(
                    x,
                    root as u64 * 100 + i as u64,
                    "rank {rank}: root {root} broadcast data[{i}] mismatch"
                );
            }
        }
        if rank == 0 {
            println!("PASS: broadcast (rotating roots)");
        }
    }

    // ========================================================================
    // Test 5: zero-length broadcast still synchronizes
    // ========================================================================
    {
        let mut empty: Vec<f32> = Vec::new();
        world
            .broadcast(&mut empty, 1)
            .expect("zero-length broadcast failed");
        assert!(empty.is_empty());
        // A real broadcast afterwards proves the call sequence stayed aligned.
        let mut probe = if rank == 1 { 7u8 } else { 0 };
        world.broadcast_value(&mut probe, 1).expect("probe failed");
        assert_eq!(probe, 7, "rank {rank}: sequence misaligned after empty broadcast");
        if rank == 0 {
            println!("PASS: broadcast (zero-length)");
        }
    }

    // ========================================================================
    // Test 6: barrier storm
    // ========================================================================
    {
        for _ in 0..10 {
            world.barrier().expect("barrier failed");
        }
        if rank == 0 {
            println!("PASS: barrier (x10)");
        }
    }

    // ========================================================================
    // Test 7: interleaved broadcasts and barriers keep their order
    // ========================================================================
    {
        let mut first = if rank == 0 { [1i64, 2, 3] } else { [0; 3] };
        world.broadcast(&mut first, 0).expect("first broadcast failed");
        world.barrier().expect("interleaved barrier failed");
        let mut second = if rank == 0 { [40i64, 50, 60] } else { [0; 3] };
        world
            .broadcast(&mut second, 0)
            .expect("second broadcast failed");

        assert_eq!(first, [1, 2, 3], "rank {rank}: first payload corrupted");
        assert_eq!(second, [40, 50, 60], "rank {rank}: second payload corrupted");
        if rank == 0 {
            println!("PASS: interleaved broadcast/barrier");
        }
    }

    // ========================================================================
    // Test 8: large broadcast (1 MiB of u8)
    // ========================================================================
    {
        let mut data = vec![0u8; 1 << 20];
        if rank == 0 {
            for (i, x) in data.iter_mut().enumerate() {
                *x = (i % 251) as u8;
            }
        }
        world.broadcast(&mut data, 0).expect("large broadcast failed");
        for (i, &x) in data.iter().enumerate() {
            assert_eq!(x, (i % 251) as u8, "rank {rank}: large broadcast byte {i}");
        }
        if rank == 0 {
            println!("PASS: broadcast (1 MiB)");
        }
    }

    // ========================================================================
    // Final barrier and summary
    // ========================================================================
    world.barrier().expect("final barrier failed");
    if rank == 0 {
        println!("\n========================================");
        println!("All collective tests passed! (8 tests)");
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
