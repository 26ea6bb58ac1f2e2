//! Blocking TCP transport: one reliable, ordered link per peer.
//!
//! After registration every member establishes a full pairwise mesh. Rank
//! `i` dials every rank below `i` and accepts one connection from every rank
//! above it. Each fresh connection carries a hello in both directions so the
//! acceptor learns which rank is calling; data listeners are bound before
//! registration begins, so a dial can at worst sit in a listen backlog, and
//! the dial/accept split cannot deadlock.
//!
//! Links deliver whole frames in order. Any socket error is fatal to the
//! owning communicator, so a link never needs to resynchronize after a
//! partial read.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};
use crate::registry::{Roster, reg_io, remaining};
use crate::wire::{self, FrameHeader};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A connected, identified channel to one peer.
pub(crate) struct Link {
    peer: i32,
    stream: TcpStream,
}

impl Link {
    fn new(peer: i32, stream: TcpStream) -> Self {
        Link { peer, stream }
    }

    /// Send one frame: header, then `payload` (exactly
    /// `header.payload_len` bytes).
    pub fn send_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        wire::write_frame(&mut self.stream, header, payload)
            .map_err(|err| Error::from_io(self.peer, err))
    }

    /// Receive and validate the next frame header.
    pub fn recv_header(&mut self) -> Result<FrameHeader> {
        wire::read_frame_header(&mut self.stream).map_err(|err| Error::from_io(self.peer, err))
    }

    /// Receive a payload of exactly `buf.len()` bytes.
    pub fn recv_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .map_err(|err| Error::from_io(self.peer, err))
    }

    fn set_op_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }
}

/// The full set of links a member holds, indexed by peer rank. The slot for
/// the member's own rank stays empty.
pub(crate) struct Mesh {
    rank: i32,
    links: Vec<Option<Link>>,
}

impl Mesh {
    /// Connect to every peer in the roster. `listener` is the already-bound
    /// data-plane listener whose address the roster advertises for this
    /// member; it is consumed and closed once the mesh is complete.
    pub fn establish(
        roster: &Roster,
        listener: TcpListener,
        op_timeout: Option<Duration>,
        deadline: Instant,
    ) -> Result<Mesh> {
        let size = roster.size();
        let rank = roster.rank;
        let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();

        for peer in 0..rank {
            let stream = dial(peer, roster.addrs[peer as usize], rank, deadline)?;
            links[peer as usize] = Some(Link::new(peer, stream));
        }

        listener
            .set_nonblocking(true)
            .map_err(|err| reg_io("configuring data listener", err))?;
        let mut pending = (size - 1 - rank) as usize;
        while pending > 0 {
            remaining(deadline, "registration")?;
            match listener.accept() {
                Ok((stream, from)) => {
                    let (peer, stream) = greet(stream, rank, size, deadline, from)?;
                    if links[peer as usize].is_some() {
                        return Err(Error::Registration(format!(
                            "rank {peer} connected twice during mesh establishment"
                        )));
                    }
                    links[peer as usize] = Some(Link::new(peer, stream));
                    pending -= 1;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(reg_io("accepting mesh connection", err)),
            }
        }
        drop(listener);

        for link in links.iter().flatten() {
            link.set_op_timeout(op_timeout)
                .map_err(|err| reg_io("setting collective timeouts", err))?;
        }
        debug!("rank {rank} established {} mesh links", size - 1);
        Ok(Mesh { rank, links })
    }

    /// Link to `peer`, which must be another member of the group.
    pub fn link_mut(&mut self, peer: i32) -> Result<&mut Link> {
        if peer == self.rank || peer < 0 || peer as usize >= self.links.len() {
            return Err(Error::InvalidRank(peer));
        }
        self.links[peer as usize]
            .as_mut()
            .ok_or(Error::InvalidRank(peer))
    }

    /// Clone a handle to every link socket. Shutting the clones down
    /// unblocks a collective that is mid-read on the originals, so the owner
    /// can tear the mesh down from another thread.
    pub fn try_clone_streams(&self) -> io::Result<Vec<TcpStream>> {
        self.links
            .iter()
            .flatten()
            .map(|link| link.stream.try_clone())
            .collect()
    }
}

fn dial(peer: i32, addr: SocketAddr, own_rank: i32, deadline: Instant) -> Result<TcpStream> {
    let mut stream = loop {
        let left = remaining(deadline, "registration")?;
        match TcpStream::connect_timeout(&addr, left) {
            Ok(stream) => break stream,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
                ) =>
            {
                thread::sleep(DIAL_RETRY_INTERVAL.min(left));
            }
            Err(err) => {
                return Err(Error::Registration(format!(
                    "cannot connect to rank {peer} at {addr}: {err}"
                )));
            }
        }
    };
    configure(&stream, deadline)?;
    wire::write_mesh_hello(&mut stream, own_rank)
        .map_err(|err| reg_io("sending mesh hello", err))?;
    let echoed =
        wire::read_mesh_hello(&mut stream).map_err(|err| reg_io("awaiting mesh hello reply", err))?;
    if echoed != peer {
        return Err(Error::Registration(format!(
            "endpoint at {addr} identified as rank {echoed}, expected rank {peer}"
        )));
    }
    Ok(stream)
}

fn greet(
    stream: TcpStream,
    own_rank: i32,
    size: i32,
    deadline: Instant,
    from: SocketAddr,
) -> Result<(i32, TcpStream)> {
    let mut stream = stream;
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream
        .set_nonblocking(false)
        .map_err(|err| reg_io("configuring mesh link", err))?;
    configure(&stream, deadline)?;
    let peer =
        wire::read_mesh_hello(&mut stream).map_err(|err| reg_io("reading mesh hello", err))?;
    if peer <= own_rank || peer >= size {
        return Err(Error::Registration(format!(
            "unexpected mesh hello from {from}: rank {peer}"
        )));
    }
    wire::write_mesh_hello(&mut stream, own_rank)
        .map_err(|err| reg_io("answering mesh hello", err))?;
    Ok((peer, stream))
}

fn configure(stream: &TcpStream, deadline: Instant) -> Result<()> {
    let left = remaining(deadline, "registration")?;
    stream
        .set_nodelay(true)
        .and_then(|()| stream.set_read_timeout(Some(left)))
        .and_then(|()| stream.set_write_timeout(Some(left)))
        .map_err(|err| reg_io("configuring mesh link", err))
}
