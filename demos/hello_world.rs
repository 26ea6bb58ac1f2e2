//! Hello World example - basic group formation and communication.
//!
//! Run with: cargo run --example hello_world
//!
//! Without MESHCAST_* set, this re-executes itself to launch a 4-member
//! group on loopback. With MESHCAST_RENDEZVOUS and MESHCAST_WORLD_SIZE set,
//! the process joins that group as one member, so N copies can also be
//! started by hand or by a job script.

use meshcast::{Environment, GroupConfig, Result};
use std::net::TcpListener;
use std::process::{Command, exit};

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
    // Join the group
    let env = Environment::init(GroupConfig::from_env()?)?;

    // Get the world communicator
    let world = env.world();

    // Get our rank and the total number of members
    let rank = world.rank();
    let size = world.size();

    println!(
        "Hello from rank {} of {} (pid {})",
        rank,
        size,
        std::process::id()
    );

    // Synchronize before exiting
    world.barrier()?;

    if rank == 0 {
        println!("\nAll members reported in. Test passed!");
    }

    // Membership is retired when `env` is dropped
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
