//! Communicator: ranked membership plus collective operations.

use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::datatype::{Datatype, DatatypeTag, bytes_of_mut};
use crate::error::{Error, Result};
use crate::transport::Mesh;
use crate::wire::FrameHeader;

const ACTIVE: u8 = 0;
const BROKEN: u8 = 1;
const FINALIZED: u8 = 2;

/// A handle on one ranked group of processes.
///
/// Handles are cheap to clone and safe to share across threads; collective
/// calls on clones of the same communicator serialize against each other.
/// Every member of the group must invoke the same sequence of collectives
/// with matching arguments. A disagreement, a lost peer or an expired
/// per-operation deadline leaves the communicator broken: the failing call
/// reports what happened and every later call fails with
/// [`Error::Lifecycle`].
///
/// # Example
///
/// ```no_run
/// use meshcast::{Environment, GroupConfig};
///
/// let env = Environment::init(GroupConfig::from_env().unwrap()).unwrap();
/// let world = env.world();
///
/// println!("I am rank {} of {}", world.rank(), world.size());
/// ```
#[derive(Clone)]
pub struct Communicator {
    shared: Arc<Shared>,
}

struct Inner {
    mesh: Mesh,
    seq: u64,
}

impl Inner {
    /// Stamp the header for the next data collective. A count too large for
    /// one frame is rejected without consuming a sequence number, so the
    /// caller stays aligned with the rest of the group.
    fn data_header(&mut self, root: i32, tag: DatatypeTag, count: u64) -> Result<FrameHeader> {
        let header =
            FrameHeader::data(self.seq, root, tag, count).ok_or(Error::InvalidCount(count))?;
        self.seq += 1;
        Ok(header)
    }
}

struct Shared {
    rank: i32,
    size: i32,
    state: AtomicU8,
    inner: Mutex<Inner>,
    /// Aliases of every link socket. Shutting these down unblocks a
    /// collective stuck mid-read without taking the `inner` lock.
    shutdown_handles: Vec<TcpStream>,
}

impl Shared {
    fn shutdown_links(&self) {
        for stream in &self.shutdown_handles {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Communicator {
    pub(crate) fn new(rank: i32, size: i32, mesh: Mesh) -> Result<Self> {
        let shutdown_handles = mesh
            .try_clone_streams()
            .map_err(|err| Error::Registration(format!("cloning link handles: {err}")))?;
        Ok(Communicator {
            shared: Arc::new(Shared {
                rank,
                size,
                state: AtomicU8::new(ACTIVE),
                inner: Mutex::new(Inner { mesh, seq: 0 }),
                shutdown_handles,
            }),
        })
    }

    /// Rank of the calling process in this communicator, in `0..size`.
    pub fn rank(&self) -> i32 {
        self.shared.rank
    }

    /// Number of processes in this communicator.
    pub fn size(&self) -> i32 {
        self.shared.size
    }

    /// Broadcast `buf` from `root` to every member.
    ///
    /// On the root the buffer supplies the data; on every other member it is
    /// overwritten in place. All members must pass the same element type,
    /// the same element count and the same `root`, and the call returns only
    /// after this member's part in the broadcast is complete. An empty
    /// buffer is a valid collective and still synchronizes sequence numbers.
    /// A single frame carries at most 1 GiB of payload; a longer buffer is
    /// rejected with [`Error::InvalidCount`] before anything reaches the
    /// wire, and the communicator stays usable.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use meshcast::{Environment, GroupConfig};
    ///
    /// let env = Environment::init(GroupConfig::from_env().unwrap()).unwrap();
    /// let world = env.world();
    ///
    /// let mut data = [0.0f64; 4];
    /// if world.rank() == 0 {
    ///     data = [2.5, 5.0, 7.5, 10.0];
    /// }
    /// world.broadcast(&mut data, 0).unwrap();
    /// assert_eq!(data[3], 10.0);
    /// ```
    pub fn broadcast<T: Datatype>(&self, buf: &mut [T], root: i32) -> Result<()> {
        if root < 0 || root >= self.shared.size {
            return Err(Error::InvalidRank(root));
        }
        let mut inner = self.lock()?;
        let header = inner.data_header(root, T::TAG, buf.len() as u64)?;
        trace!("rank {}: broadcast {header}", self.shared.rank);
        if self.shared.size == 1 {
            return Ok(());
        }
        let result = broadcast_bytes(
            &mut inner.mesh,
            self.shared.rank,
            self.shared.size,
            &header,
            bytes_of_mut(buf),
        );
        self.finish(result)
    }

    /// Broadcast a single value from `root` to every member.
    pub fn broadcast_value<T: Datatype>(&self, value: &mut T, root: i32) -> Result<()> {
        self.broadcast(std::slice::from_mut(value), root)
    }

    /// Block until every member of the group has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let seq = inner.seq;
        inner.seq += 1;
        trace!("rank {}: barrier seq={seq}", self.shared.rank);
        if self.shared.size == 1 {
            return Ok(());
        }
        let result = barrier_rounds(&mut inner.mesh, self.shared.rank, self.shared.size, seq);
        self.finish(result)
    }

    /// Retire the communicator: refuse new collectives and close every link.
    /// Idempotent; a collective stuck on another thread is unblocked and
    /// reports [`Error::Lifecycle`].
    pub(crate) fn finalize(&self) {
        let prev = self.shared.state.swap(FINALIZED, Ordering::AcqRel);
        if prev != FINALIZED {
            trace!("rank {}: finalizing", self.shared.rank);
            self.shared.shutdown_links();
        }
    }

    /// Gate for every collective: the state check and the serializing lock.
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        match self.shared.state.load(Ordering::Acquire) {
            ACTIVE => {}
            BROKEN => return Err(Error::Lifecycle("a previous collective failed")),
            _ => return Err(Error::Lifecycle("communicator is finalized")),
        }
        // A panic mid-collective poisons the lock; the state latch stays
        // authoritative, so keep going.
        Ok(self
            .shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    /// Latch fatal outcomes. A broken communicator tears its links down so
    /// peers blocked on this member fail fast instead of hanging.
    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                let _ = self.shared.state.compare_exchange(
                    ACTIVE,
                    BROKEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.shared.shutdown_links();
                if self.shared.state.load(Ordering::Acquire) == FINALIZED {
                    return Err(Error::Lifecycle("communicator was finalized mid-collective"));
                }
            }
        }
        result
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.shared.rank)
            .field("size", &self.shared.size)
            .finish_non_exhaustive()
    }
}

/// Binomial-tree membership for one rank: the parent to receive from (none
/// at the root) and the children to forward to, in send order.
///
/// Ranks are rotated so the root sits at relative rank 0; each member's
/// parent clears the lowest set bit of its relative rank. The tree has
/// depth `ceil(log2(size))` and every member receives at most once.
fn binomial_schedule(rank: i32, size: i32, root: i32) -> (Option<i32>, Vec<i32>) {
    let relative = (rank + size - root) % size;
    let mut parent = None;
    let mut mask = 1;
    while mask < size {
        if relative & mask != 0 {
            parent = Some((rank + size - mask) % size);
            break;
        }
        mask <<= 1;
    }
    let mut children = Vec::new();
    mask >>= 1;
    while mask > 0 {
        if relative + mask < size {
            children.push((rank + mask) % size);
        }
        mask >>= 1;
    }
    (parent, children)
}

fn broadcast_bytes(
    mesh: &mut Mesh,
    rank: i32,
    size: i32,
    header: &FrameHeader,
    bytes: &mut [u8],
) -> Result<()> {
    let (parent, children) = binomial_schedule(rank, size, header.root);
    if let Some(parent) = parent {
        let link = mesh.link_mut(parent)?;
        let got = link.recv_header()?;
        if got != *header {
            return Err(Error::ProtocolMismatch {
                expected: header.to_string(),
                got: got.to_string(),
            });
        }
        link.recv_payload(bytes)?;
    }
    for child in children {
        mesh.link_mut(child)?.send_frame(header, bytes)?;
    }
    Ok(())
}

/// Dissemination barrier: in round `k` each member sends a token to the
/// rank `2^k` ahead and waits for the token from the rank `2^k` behind.
/// After `ceil(log2(size))` rounds everyone has transitively heard from
/// everyone. Tokens are bare headers, small enough that the kernel buffers
/// the send of a round before the matching receive is posted.
fn barrier_rounds(mesh: &mut Mesh, rank: i32, size: i32, seq: u64) -> Result<()> {
    let mut round = 0u32;
    let mut distance = 1;
    while distance < size {
        let header = FrameHeader::barrier(seq, round);
        let to = (rank + distance) % size;
        let from = (rank + size - distance) % size;
        mesh.link_mut(to)?.send_frame(&header, &[])?;

        let link = mesh.link_mut(from)?;
        let got = link.recv_header()?;
        if got != header {
            return Err(Error::ProtocolMismatch {
                expected: header.to_string(),
                got: got.to_string(),
            });
        }
        round += 1;
        distance <<= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Roster;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    #[test]
    fn schedule_known_tree_for_eight_ranks() {
        assert_eq!(binomial_schedule(0, 8, 0), (None, vec![4, 2, 1]));
        assert_eq!(binomial_schedule(4, 8, 0), (Some(0), vec![6, 5]));
        assert_eq!(binomial_schedule(5, 8, 0), (Some(4), vec![]));
        assert_eq!(binomial_schedule(7, 8, 0), (Some(6), vec![]));
    }

    #[test]
    fn schedule_rotates_with_the_root() {
        let (parent, children) = binomial_schedule(2, 5, 2);
        assert_eq!(parent, None);
        assert_eq!(children, vec![1, 4, 3]);
        assert_eq!(binomial_schedule(1, 5, 2).0, Some(2));
    }

    #[test]
    fn schedule_forms_a_consistent_tree() {
        for size in 1..=17 {
            let max_depth = 32 - ((size - 1) as u32).leading_zeros();
            for root in [0, size / 2, size - 1] {
                for rank in 0..size {
                    let (parent, children) = binomial_schedule(rank, size, root);
                    if rank == root {
                        assert!(parent.is_none());
                    } else {
                        let parent = parent.expect("non-root rank without a parent");
                        let (_, siblings) = binomial_schedule(parent, size, root);
                        assert!(
                            siblings.contains(&rank),
                            "rank {rank} missing from parent {parent} (size {size}, root {root})"
                        );
                    }
                    for child in children {
                        let (child_parent, _) = binomial_schedule(child, size, root);
                        assert_eq!(child_parent, Some(rank));
                    }

                    // Every rank reaches the root within ceil(log2(size)) hops.
                    let mut depth = 0;
                    let mut cursor = rank;
                    while let Some(next) = binomial_schedule(cursor, size, root).0 {
                        cursor = next;
                        depth += 1;
                        assert!(depth <= max_depth, "path from rank {rank} too long");
                    }
                    assert_eq!(cursor, root);
                }
            }
        }
    }

    fn sole() -> Communicator {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let roster = Roster {
            rank: 0,
            addrs: vec![listener.local_addr().unwrap()],
        };
        let deadline = Instant::now() + Duration::from_secs(1);
        let mesh = Mesh::establish(&roster, listener, None, deadline).unwrap();
        Communicator::new(0, 1, mesh).unwrap()
    }

    #[test]
    fn sole_member_collectives_are_local() {
        let world = sole();
        assert_eq!((world.rank(), world.size()), (0, 1));

        let mut buf = [1.5f64; 3];
        world.broadcast(&mut buf, 0).unwrap();
        world.barrier().unwrap();
        let mut value = 7i32;
        world.broadcast_value(&mut value, 0).unwrap();
        assert_eq!(value, 7);
        assert_eq!(buf, [1.5; 3]);
    }

    #[test]
    fn out_of_range_root_is_rejected() {
        let world = sole();
        let mut buf = [0u8; 1];
        assert!(matches!(world.broadcast(&mut buf, 1), Err(Error::InvalidRank(1))));
        assert!(matches!(world.broadcast(&mut buf, -1), Err(Error::InvalidRank(-1))));
        // Rejected calls never begin, so the communicator stays usable.
        world.broadcast(&mut buf, 0).unwrap();
    }

    #[test]
    fn oversize_counts_are_rejected_without_a_sequence_number() {
        let world = sole();
        let mut value = 1u64;
        world.broadcast_value(&mut value, 0).unwrap();

        // One u64 broadcast consumed seq 0; a count past the frame cap must
        // fail locally and leave the sequence where it was.
        let cap = crate::wire::MAX_PAYLOAD_BYTES / 8;
        let mut inner = world.shared.inner.lock().unwrap();
        let err = inner.data_header(0, DatatypeTag::U64, cap + 1).unwrap_err();
        assert!(matches!(err, Error::InvalidCount(n) if n == cap + 1), "got: {err:?}");
        assert_eq!(inner.seq, 1);

        // The largest count that still fits one frame is accepted.
        let header = inner.data_header(0, DatatypeTag::U64, cap).unwrap();
        assert_eq!((header.seq, inner.seq), (1, 2));
        drop(inner);

        world.barrier().unwrap();
    }

    #[test]
    fn finalized_communicator_refuses_collectives() {
        let world = sole();
        world.finalize();
        world.finalize(); // idempotent
        let err = world.barrier().unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert!(err.to_string().contains("finalized"), "got: {err}");
    }
}
