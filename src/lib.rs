//! # meshcast
//!
//! Self-contained collective communication over TCP for small process
//! groups.
//!
//! N independently launched processes are pointed at the same rendezvous
//! address, form a ranked group, and run blocking collectives over a full
//! mesh of reliable, ordered links. No launcher, daemon or external runtime
//! is involved:
//! - Rendezvous registry: the first member to bind the rendezvous address
//!   assigns ranks to the rest in arrival order
//! - Binomial-tree broadcast and dissemination barrier
//! - Type-safe generic payloads over a closed set of element types
//! - Fail-fast error model: a lost peer, a protocol disagreement or an
//!   expired deadline breaks the communicator instead of corrupting data
//!
//! ## Supported Types
//!
//! All payload-carrying operations are generic over [`Datatype`]:
//! `f32`, `f64`, `i32`, `i64`, `u8`, `u32`, `u64`
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshcast::{Environment, GroupConfig};
//!
//! fn main() -> Result<(), meshcast::Error> {
//!     // MESHCAST_RENDEZVOUS and MESHCAST_WORLD_SIZE identify the group.
//!     let env = Environment::init(GroupConfig::from_env()?)?;
//!     let world = env.world();
//!
//!     let rank = world.rank();
//!     let size = world.size();
//!     println!("Hello from rank {rank} of {size}");
//!
//!     // Generic broadcast — works with any Datatype
//!     let mut data = vec![0.0f64; 100];
//!     if rank == 0 {
//!         data.fill(42.0);
//!     }
//!     world.broadcast(&mut data, 0)?;
//!     world.barrier()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `MESHCAST_RENDEZVOUS` | registry address, identical for all members | required |
//! | `MESHCAST_WORLD_SIZE` | total number of members | required |
//! | `MESHCAST_BIND` | local data-plane listen address | `127.0.0.1:0` |
//! | `MESHCAST_ADVERTISE_IP` | IP peers should dial | bind IP |
//! | `MESHCAST_REGISTER_TIMEOUT_MS` | group-formation deadline | `30000` |
//! | `MESHCAST_OP_TIMEOUT_MS` | per-collective I/O bound | unset (blocks) |
//!
//! ## Capabilities
//!
//! - **Generic API**: all operations work with any [`Datatype`] (`f32`, `f64`, `i32`, `i64`, `u8`, `u32`, `u64`)
//! - **Collectives**: broadcast (buffer or single value), barrier
//! - **Group formation**: rendezvous registry with arrival-order ranks, full pairwise TCP mesh
//! - **Rich error handling**: [`Error`] distinguishes registration, transport, protocol-mismatch, timeout and lifecycle failures

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]

mod comm;
mod config;
mod datatype;
mod error;
mod registry;
mod transport;
mod wire;

pub use comm::Communicator;
pub use config::{DEFAULT_REGISTER_TIMEOUT, GroupConfig};
pub use datatype::{Datatype, DatatypeTag};
pub use error::{Error, Result};

use std::fmt;
use std::net::TcpListener;
use std::time::Instant;

use crate::transport::Mesh;

/// Membership of one process group.
///
/// [`Environment::init`] registers the calling process with its group and
/// connects the link mesh; dropping the environment retires the membership
/// and closes every link, after which collectives on the communicator fail
/// with [`Error::Lifecycle`].
///
/// Environments carry no process-global state. A single process may hold
/// several at once, each a member of its own group; tests run whole groups
/// as threads this way.
///
/// # Example
///
/// ```no_run
/// use meshcast::{Environment, GroupConfig};
///
/// let config = GroupConfig::new("127.0.0.1:7878".parse().unwrap(), 4);
/// let env = Environment::init(config).expect("group formation failed");
/// let world = env.world();
/// println!("Running on {} members", world.size());
/// // Membership is retired when `env` goes out of scope
/// ```
pub struct Environment {
    world: Communicator,
}

impl Environment {
    /// Join the group described by `config`.
    ///
    /// Binds the data-plane listener, registers with the rendezvous
    /// registry and establishes a link to every peer. Blocks until all
    /// `config.world_size` members have done the same, bounded by
    /// `config.register_timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid configuration, [`Error::Timeout`]
    /// when the group does not complete within the registration deadline,
    /// and [`Error::Registration`] when rendezvous or mesh establishment
    /// fails.
    pub fn init(config: GroupConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).map_err(|err| {
            Error::Registration(format!(
                "cannot bind data-plane address {}: {err}",
                config.bind_addr
            ))
        })?;
        let bound = listener
            .local_addr()
            .map_err(|err| Error::Registration(format!("querying data-plane address: {err}")))?;
        let advertised = config.advertised(bound);

        let deadline = Instant::now() + config.register_timeout;
        let roster = registry::register(&config, advertised, deadline)?;
        let mesh = Mesh::establish(&roster, listener, config.op_timeout, deadline)?;
        let world = Communicator::new(roster.rank, roster.size(), mesh)?;
        Ok(Environment { world })
    }

    /// Communicator spanning every member of the group.
    pub fn world(&self) -> Communicator {
        self.world.clone()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("world", &self.world)
            .finish()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.world.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Multi-member coverage lives in tests/; a sole-member group exercises
    // the full init/finalize path without cross-thread coordination.
    #[test]
    fn init_world_drop_roundtrip() {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let rendezvous = probe.local_addr().unwrap();
        drop(probe);

        let env = Environment::init(GroupConfig::new(rendezvous, 1)).unwrap();
        let world = env.world();
        assert_eq!((world.rank(), world.size()), (0, 1));

        let mut token = 99u32;
        world.broadcast_value(&mut token, 0).unwrap();

        drop(env);
        let err = world.barrier().unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)), "got: {err:?}");
    }
}
