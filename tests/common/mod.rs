//! Common test utilities: run a whole group as threads in one process.
//!
//! Every member gets its own [`Environment`] and registers through a fresh
//! loopback rendezvous address, so groups formed here exercise the same
//! registration, mesh and collective paths as separate processes would.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meshcast::{Communicator, Environment, GroupConfig};

/// Generous enough for CI, short enough that a genuine hang fails the test
/// instead of stalling the whole suite.
pub const TEST_REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
pub const TEST_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserve a loopback address to use as a fresh rendezvous point.
pub fn rendezvous_addr() -> SocketAddr {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

pub fn test_config(rendezvous: SocketAddr, world_size: i32) -> GroupConfig {
    let mut config = GroupConfig::new(rendezvous, world_size);
    config.register_timeout = TEST_REGISTER_TIMEOUT;
    config.op_timeout = Some(TEST_OP_TIMEOUT);
    config
}

/// Form a group of `size` members and run `body` once per member, each in
/// its own thread. Results come back in rank order. A member that panics
/// fails the whole call; its peers abort their current collective within
/// the operation timeout rather than hanging.
pub fn run_group<F, T>(size: i32, body: F) -> Vec<T>
where
    F: Fn(&Communicator) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let rendezvous = rendezvous_addr();
    let body = Arc::new(body);

    let handles: Vec<_> = (0..size)
        .map(|_| {
            let body = Arc::clone(&body);
            let config = test_config(rendezvous, size);
            thread::spawn(move || {
                let env = Environment::init(config).expect("group formation failed");
                let world = env.world();
                (world.rank(), (*body)(&world))
            })
        })
        .collect();

    let mut results: Vec<(i32, T)> = handles
        .into_iter()
        .map(|handle| handle.join().expect("member thread panicked"))
        .collect();
    results.sort_by_key(|(rank, _)| *rank);
    results.into_iter().map(|(_, value)| value).collect()
}
