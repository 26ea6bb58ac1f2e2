//! Rendezvous registry: turns N independent processes into a ranked group.
//!
//! Every member of a group is launched with the same rendezvous address and
//! group size. The first process to bind the rendezvous address becomes the
//! registrar and takes rank 0; everyone else connects to it, submits the
//! data-plane address it has already bound, and blocks until the group is
//! complete. The registrar assigns ranks in arrival order and answers each
//! joiner with the full rank-ordered address table, then closes the
//! rendezvous listener. A rendezvous address therefore forms one group and
//! is free again afterwards.
//!
//! All waiting here is bounded by the registration deadline; a group that
//! never completes surfaces [`Error::Timeout`] instead of hanging.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::GroupConfig;
use crate::error::{Error, Result};
use crate::wire;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of registration: this member's rank and the rank-ordered
/// data-plane address table for the whole group.
#[derive(Debug, Clone)]
pub(crate) struct Roster {
    pub rank: i32,
    pub addrs: Vec<SocketAddr>,
}

impl Roster {
    pub fn size(&self) -> i32 {
        self.addrs.len() as i32
    }
}

/// Register this process with the group, publishing `data_addr` as its
/// data-plane endpoint. Blocks until the group is complete or `deadline`
/// passes; the same deadline bounds the mesh establishment that follows.
pub(crate) fn register(
    config: &GroupConfig,
    data_addr: SocketAddr,
    deadline: Instant,
) -> Result<Roster> {
    match TcpListener::bind(config.rendezvous) {
        Ok(listener) => host(listener, config, data_addr, deadline),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => join(config, data_addr, deadline),
        Err(err) => Err(Error::Registration(format!(
            "cannot bind rendezvous address {}: {err}",
            config.rendezvous
        ))),
    }
}

/// Time left until `deadline`, or [`Error::Timeout`] once it has passed.
pub(crate) fn remaining(deadline: Instant, phase: &'static str) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(Error::Timeout(phase))
    } else {
        Ok(left)
    }
}

fn host(
    listener: TcpListener,
    config: &GroupConfig,
    data_addr: SocketAddr,
    deadline: Instant,
) -> Result<Roster> {
    debug!(
        "hosting registry at {} for a group of {}",
        config.rendezvous, config.world_size
    );
    listener
        .set_nonblocking(true)
        .map_err(|err| reg_io("configuring rendezvous listener", err))?;

    let mut addrs = Vec::with_capacity(config.world_size as usize);
    addrs.push(data_addr);
    let mut joiners: Vec<TcpStream> = Vec::with_capacity(addrs.capacity() - 1);

    while addrs.len() < config.world_size as usize {
        remaining(deadline, "registration")?;
        match listener.accept() {
            Ok((stream, _)) => {
                let (stream, addr) = accept_join(stream, config, deadline)?;
                if addrs.contains(&addr) {
                    return Err(Error::Registration(format!(
                        "two members advertised the same address {addr}"
                    )));
                }
                addrs.push(addr);
                joiners.push(stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => return Err(reg_io("accepting on rendezvous listener", err)),
        }
    }

    for (i, stream) in joiners.iter_mut().enumerate() {
        let rank = (i + 1) as i32;
        // The bound set at accept time may be stale by now; a joiner that
        // stopped reading must not hold the welcome write past the deadline.
        let left = remaining(deadline, "registration")?;
        stream
            .set_write_timeout(Some(left))
            .map_err(|err| reg_io("configuring joiner socket", err))?;
        wire::write_welcome(stream, rank, &addrs)
            .map_err(|err| reg_io("sending rank assignment", err))?;
    }
    info!(
        "group of {} formed at {} (this member is rank 0)",
        config.world_size, config.rendezvous
    );
    Ok(Roster { rank: 0, addrs })
}

fn accept_join(
    stream: TcpStream,
    config: &GroupConfig,
    deadline: Instant,
) -> Result<(TcpStream, SocketAddr)> {
    let mut stream = stream;
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream
        .set_nonblocking(false)
        .and_then(|()| {
            let left = deadline.saturating_duration_since(Instant::now());
            let bound = Some(left.max(Duration::from_millis(1)));
            stream.set_read_timeout(bound).and_then(|()| stream.set_write_timeout(bound))
        })
        .map_err(|err| reg_io("configuring joiner socket", err))?;

    let (world_size, addr) =
        wire::read_join(&mut stream).map_err(|err| reg_io("reading join request", err))?;
    if world_size != config.world_size {
        return Err(Error::Registration(format!(
            "member at {addr} was configured for group size {world_size}, registrar expects {}",
            config.world_size
        )));
    }
    debug!("registered member at {addr}");
    Ok((stream, addr))
}

fn join(config: &GroupConfig, data_addr: SocketAddr, deadline: Instant) -> Result<Roster> {
    debug!("joining registry at {}", config.rendezvous);
    let mut stream = connect_with_retry(config.rendezvous, deadline)?;
    let left = remaining(deadline, "registration")?;
    stream
        .set_read_timeout(Some(left))
        .and_then(|()| stream.set_write_timeout(Some(left)))
        .map_err(|err| reg_io("configuring rendezvous socket", err))?;

    wire::write_join(&mut stream, config.world_size, &data_addr)
        .map_err(|err| reg_io("sending join request", err))?;
    let (rank, addrs) =
        wire::read_welcome(&mut stream).map_err(|err| reg_io("awaiting rank assignment", err))?;
    if addrs.len() != config.world_size as usize {
        return Err(Error::Registration(format!(
            "registrar formed a group of {}, this member was configured for {}",
            addrs.len(),
            config.world_size
        )));
    }
    info!(
        "joined group at {} as rank {rank} of {}",
        config.rendezvous,
        addrs.len()
    );
    Ok(Roster { rank, addrs })
}

/// Connect to the registrar, retrying while the deadline allows.
///
/// The common race is losing the bind to another member and dialing before
/// that member's listener is ready, which shows up as refused connections
/// for a few milliseconds.
fn connect_with_retry(addr: SocketAddr, deadline: Instant) -> Result<TcpStream> {
    loop {
        let left = remaining(deadline, "registration")?;
        match TcpStream::connect_timeout(&addr, left) {
            Ok(stream) => return Ok(stream),
            Err(err) if retryable(&err) => thread::sleep(CONNECT_RETRY_INTERVAL.min(left)),
            Err(err) => {
                return Err(Error::Registration(format!(
                    "cannot reach registry at {addr}: {err}"
                )));
            }
        }
    }
}

fn retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}

/// Map socket errors during group formation; deadline expiry is a timeout,
/// anything else failed the formation protocol.
pub(crate) fn reg_io(context: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout("registration"),
        _ => Error::Registration(format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve_addr() -> SocketAddr {
        // Bind-then-drop to learn a free port for the rendezvous point.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn test_config(rendezvous: SocketAddr, world_size: i32) -> GroupConfig {
        let mut config = GroupConfig::new(rendezvous, world_size);
        config.register_timeout = Duration::from_secs(5);
        config
    }

    fn register_now(config: &GroupConfig, data_addr: SocketAddr) -> Result<Roster> {
        register(config, data_addr, Instant::now() + config.register_timeout)
    }

    #[test]
    fn four_members_get_distinct_ranks_and_one_table() {
        let rendezvous = reserve_addr();
        let mut handles = Vec::new();
        for i in 0..4 {
            let config = test_config(rendezvous, 4);
            let data_addr: SocketAddr = format!("127.0.0.1:{}", 50000 + i).parse().unwrap();
            handles.push(thread::spawn(move || {
                (data_addr, register_now(&config, data_addr).unwrap())
            }));
        }
        let rosters: Vec<(SocketAddr, Roster)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut ranks: Vec<i32> = rosters.iter().map(|(_, r)| r.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2, 3]);

        let table = &rosters[0].1.addrs;
        for (own, roster) in &rosters {
            assert_eq!(&roster.addrs, table, "members saw different tables");
            assert_eq!(roster.size(), 4);
            assert_eq!(roster.addrs[roster.rank as usize], *own);
        }
    }

    #[test]
    fn sole_member_group_forms_instantly() {
        let rendezvous = reserve_addr();
        let config = test_config(rendezvous, 1);
        let data_addr: SocketAddr = "127.0.0.1:50050".parse().unwrap();
        let roster = register_now(&config, data_addr).unwrap();
        assert_eq!(roster.rank, 0);
        assert_eq!(roster.addrs, vec![data_addr]);
    }

    #[test]
    fn registrar_times_out_short_of_members() {
        let rendezvous = reserve_addr();
        let mut config = test_config(rendezvous, 2);
        config.register_timeout = Duration::from_millis(200);
        let err = register_now(&config, "127.0.0.1:50100".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Timeout("registration")), "got: {err:?}");
    }

    #[test]
    fn joiner_times_out_when_registrar_stays_silent() {
        // A listener that accepts but never answers stands in for a stuck
        // registrar; the caller must land on the joiner path and give up.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let rendezvous = listener.local_addr().unwrap();
        let mut config = test_config(rendezvous, 2);
        config.register_timeout = Duration::from_millis(200);
        let err = register_now(&config, "127.0.0.1:50200".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Timeout("registration")), "got: {err:?}");
    }

    #[test]
    fn size_disagreement_aborts_formation() {
        let rendezvous = reserve_addr();
        let registrar = thread::spawn(move || {
            let config = test_config(rendezvous, 2);
            register_now(&config, "127.0.0.1:50300".parse().unwrap())
        });

        // Hand-rolled joiner configured for a different group size.
        let mut stream = loop {
            match TcpStream::connect(rendezvous) {
                Ok(s) => break s,
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        };
        wire::write_join(&mut stream, 3, &"127.0.0.1:50301".parse().unwrap()).unwrap();

        let err = registrar.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("group size"), "got: {err}");
    }

    #[test]
    fn accepted_joiners_are_bounded_in_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let rendezvous = listener.local_addr().unwrap();
        let sender = thread::spawn(move || {
            let mut stream = TcpStream::connect(rendezvous).unwrap();
            wire::write_join(&mut stream, 2, &"127.0.0.1:50400".parse().unwrap()).unwrap();
            stream
        });

        let (stream, _) = listener.accept().unwrap();
        let config = test_config(rendezvous, 2);
        let deadline = Instant::now() + config.register_timeout;
        let (stream, addr) = accept_join(stream, &config, deadline).unwrap();
        assert_eq!(addr, "127.0.0.1:50400".parse().unwrap());
        // A joiner that stops reading must not wedge the registrar's
        // welcome write; both directions carry a deadline.
        assert!(stream.read_timeout().unwrap().is_some());
        assert!(stream.write_timeout().unwrap().is_some());
        drop(sender.join().unwrap());
    }
}
