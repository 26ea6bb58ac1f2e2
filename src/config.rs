//! Group configuration.
//!
//! A [`GroupConfig`] describes one process group: where the registry
//! rendezvous happens, how many members to wait for, and the timeout bounds.
//! Every member of a group runs with the same configuration; nothing in it is
//! per-rank (ranks are assigned by the registry at registration).
//!
//! Configs are explicit values passed to
//! [`Environment::init`](crate::Environment::init);
//! [`GroupConfig::from_env`] is a convenience for launcher scripts that
//! prefer environment variables.
//!
//! # Environment Variables
//!
//! | Field | Variable | Default | Description |
//! |-------|----------|---------|-------------|
//! | `rendezvous` | `MESHCAST_RENDEZVOUS` | — (required) | Registry address, identical for all members |
//! | `world_size` | `MESHCAST_WORLD_SIZE` | — (required) | Total number of members (1 ≤ N ≤ 65536) |
//! | `bind_addr` | `MESHCAST_BIND` | `127.0.0.1:0` | Local data-plane listen address |
//! | `advertise_ip` | `MESHCAST_ADVERTISE_IP` | bind IP | IP peers should dial (needed when binding a wildcard) |
//! | `register_timeout` | `MESHCAST_REGISTER_TIMEOUT_MS` | `30000` | Group-formation deadline in milliseconds |
//! | `op_timeout` | `MESHCAST_OP_TIMEOUT_MS` | unset | Per-collective I/O bound; unset blocks indefinitely |

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::wire::MAX_GROUP_SIZE;

/// Default group-formation deadline.
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default local bind address for the data plane (any free loopback port).
const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

/// Configuration for forming one process group.
///
/// # Example
///
/// ```no_run
/// use meshcast::{Environment, GroupConfig};
///
/// let config = GroupConfig::new("127.0.0.1:7878".parse().unwrap(), 4);
/// let env = Environment::init(config).unwrap();
/// println!("joined as rank {}", env.world().rank());
/// ```
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Registry rendezvous address. The first member to bind it hosts the
    /// registry and takes rank 0; the rest connect to it.
    pub rendezvous: SocketAddr,
    /// Total number of members the group waits for. Valid sizes are 1
    /// through 65536.
    pub world_size: i32,
    /// Local address the data-plane listener binds to. Port 0 picks any
    /// free port; the actual port is published through the registry.
    pub bind_addr: SocketAddr,
    /// IP address peers should dial for this member. Defaults to the bind
    /// IP; must be set when `bind_addr` is a wildcard address.
    pub advertise_ip: Option<IpAddr>,
    /// Deadline for the whole of registration (rendezvous plus mesh
    /// establishment). Registration never blocks past this bound.
    pub register_timeout: Duration,
    /// Optional per-collective I/O bound. `None` blocks indefinitely, which
    /// matches the usual launcher-supervised deployment; tests set it to
    /// keep a misbehaving group from hanging.
    pub op_timeout: Option<Duration>,
}

impl GroupConfig {
    /// Create a configuration with default bind address and timeouts.
    pub fn new(rendezvous: SocketAddr, world_size: i32) -> Self {
        GroupConfig {
            rendezvous,
            world_size,
            bind_addr: DEFAULT_BIND,
            advertise_ip: None,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            op_timeout: None,
        }
    }

    /// Build a configuration from `MESHCAST_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending variable when a
    /// required variable is missing or a value fails to parse.
    pub fn from_env() -> Result<Self> {
        let rendezvous =
            resolve_addr("MESHCAST_RENDEZVOUS", &required_var("MESHCAST_RENDEZVOUS")?)?;
        let world_size =
            parse_var::<i32>("MESHCAST_WORLD_SIZE", &required_var("MESHCAST_WORLD_SIZE")?)?;

        let mut config = GroupConfig::new(rendezvous, world_size);
        if let Ok(value) = env::var("MESHCAST_BIND") {
            config.bind_addr = resolve_addr("MESHCAST_BIND", &value)?;
        }
        if let Ok(value) = env::var("MESHCAST_ADVERTISE_IP") {
            config.advertise_ip = Some(parse_var::<IpAddr>("MESHCAST_ADVERTISE_IP", &value)?);
        }
        if let Ok(value) = env::var("MESHCAST_REGISTER_TIMEOUT_MS") {
            let ms = parse_var::<u64>("MESHCAST_REGISTER_TIMEOUT_MS", &value)?;
            config.register_timeout = Duration::from_millis(ms);
        }
        if let Ok(value) = env::var("MESHCAST_OP_TIMEOUT_MS") {
            let ms = parse_var::<u64>("MESHCAST_OP_TIMEOUT_MS", &value)?;
            config.op_timeout = Some(Duration::from_millis(ms));
        }
        Ok(config)
    }

    /// Check the configuration for values registration cannot work with.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.world_size < 1 {
            return Err(Error::Config(format!(
                "world_size must be at least 1, got {}",
                self.world_size
            )));
        }
        // The welcome message caps the table it announces; a larger group
        // could register but never parse its own roster.
        if self.world_size as usize > MAX_GROUP_SIZE {
            return Err(Error::Config(format!(
                "world_size must be at most {MAX_GROUP_SIZE}, got {}",
                self.world_size
            )));
        }
        if self.register_timeout.is_zero() {
            return Err(Error::Config("register_timeout must be non-zero".into()));
        }
        if self.op_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("op_timeout must be non-zero when set".into()));
        }
        if self.bind_addr.ip().is_unspecified() && self.advertise_ip.is_none() {
            return Err(Error::Config(
                "advertise_ip is required when bind_addr is a wildcard address".into(),
            ));
        }
        Ok(())
    }

    /// The address peers should dial, given the actually-bound listener
    /// address (the bind port may have been 0).
    pub(crate) fn advertised(&self, bound: SocketAddr) -> SocketAddr {
        let ip = self.advertise_ip.unwrap_or_else(|| self.bind_addr.ip());
        SocketAddr::new(ip, bound.port())
    }
}

fn required_var(name: &'static str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{name} is not set")))
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{name} has unparseable value {value:?}")))
}

/// Resolve an address string, accepting both literal socket addresses and
/// `host:port` names.
fn resolve_addr(name: &'static str, value: &str) -> Result<SocketAddr> {
    value
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("{name} does not resolve ({value:?}): {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("{name} resolved to no address ({value:?})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loopback_and_bounded() {
        let config = GroupConfig::new("127.0.0.1:7878".parse().unwrap(), 4);
        assert_eq!(config.bind_addr, DEFAULT_BIND);
        assert_eq!(config.register_timeout, DEFAULT_REGISTER_TIMEOUT);
        assert!(config.op_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = GroupConfig::new("127.0.0.1:7878".parse().unwrap(), 0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.world_size = 2;
        config.register_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.register_timeout = Duration::from_secs(1);
        config.op_timeout = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.op_timeout = None;
        config.bind_addr = "0.0.0.0:0".parse().unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("advertise_ip"));

        config.advertise_ip = Some("192.0.2.7".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_caps_the_group_size() {
        let mut config = GroupConfig::new("127.0.0.1:7878".parse().unwrap(), 1 << 16);
        assert!(config.validate().is_ok());

        config.world_size = (1 << 16) + 1;
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("at most"), "got: {err}");
    }

    #[test]
    fn advertised_replaces_ip_but_keeps_bound_port() {
        let mut config = GroupConfig::new("127.0.0.1:7878".parse().unwrap(), 2);
        let bound: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        assert_eq!(config.advertised(bound), bound);

        config.advertise_ip = Some("192.0.2.7".parse().unwrap());
        assert_eq!(config.advertised(bound), "192.0.2.7:40123".parse().unwrap());
    }

    /// Tests that mutate environment variables are combined into a single
    /// test to avoid data races when tests run in parallel. `env::set_var`
    /// and `env::remove_var` are not thread-safe — multiple tests touching
    /// the same variables concurrently produce flaky results.
    #[test]
    fn env_var_parsing() {
        let clear = || unsafe {
            env::remove_var("MESHCAST_RENDEZVOUS");
            env::remove_var("MESHCAST_WORLD_SIZE");
            env::remove_var("MESHCAST_BIND");
            env::remove_var("MESHCAST_ADVERTISE_IP");
            env::remove_var("MESHCAST_REGISTER_TIMEOUT_MS");
            env::remove_var("MESHCAST_OP_TIMEOUT_MS");
        };

        // --- missing required variable names the variable ---
        clear();
        let err = GroupConfig::from_env().unwrap_err();
        assert!(format!("{err}").contains("MESHCAST_RENDEZVOUS"), "got: {err}");

        // --- minimal configuration parses with defaults ---
        unsafe {
            env::set_var("MESHCAST_RENDEZVOUS", "127.0.0.1:7878");
            env::set_var("MESHCAST_WORLD_SIZE", "4");
        }
        let config = GroupConfig::from_env().unwrap();
        assert_eq!(config.rendezvous, "127.0.0.1:7878".parse().unwrap());
        assert_eq!(config.world_size, 4);
        assert_eq!(config.bind_addr, DEFAULT_BIND);
        assert!(config.op_timeout.is_none());

        // --- optional variables override the defaults ---
        unsafe {
            env::set_var("MESHCAST_BIND", "127.0.0.1:6000");
            env::set_var("MESHCAST_REGISTER_TIMEOUT_MS", "1500");
            env::set_var("MESHCAST_OP_TIMEOUT_MS", "250");
        }
        let config = GroupConfig::from_env().unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.register_timeout, Duration::from_millis(1500));
        assert_eq!(config.op_timeout, Some(Duration::from_millis(250)));

        // --- unparseable values name the variable ---
        unsafe {
            env::set_var("MESHCAST_WORLD_SIZE", "four");
        }
        let err = GroupConfig::from_env().unwrap_err();
        assert!(format!("{err}").contains("MESHCAST_WORLD_SIZE"), "got: {err}");

        clear();
    }
}
