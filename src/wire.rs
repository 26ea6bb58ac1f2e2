//! Wire format for data-plane frames and registration messages.
//!
//! Data-plane frames carry a fixed big-endian header followed by the raw
//! payload bytes:
//!
//! ```text
//! [u8 kind][u64 seq][u32 root][u8 dtype][u64 count][u32 payload_len][payload bytes]
//! ```
//!
//! The header duplicates everything a receiver can derive from its own
//! collective call (operation kind, sequence number, root, datatype tag,
//! element count), so a disagreement between members is detected on the
//! first frame that crosses a mismatched edge instead of corrupting buffers.
//!
//! Registration messages share a `[u32 magic][u16 version]` preamble and use
//! length-prefixed UTF-8 strings for socket addresses.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use crate::datatype::DatatypeTag;

/// Preamble magic for registration messages ("MCST").
const MAGIC: u32 = 0x4D43_5354;

/// Protocol version; bump on any incompatible layout change.
const PROTOCOL_VERSION: u16 = 1;

/// Frame header size: kind + seq + root + dtype + count + payload_len.
pub(crate) const HEADER_LEN: usize = 1 + 8 + 4 + 1 + 8 + 4;

/// Maximum payload per frame (1 GiB). Collectives move whole buffers in one
/// frame per tree edge; the cap rejects corrupt lengths before allocation.
pub(crate) const MAX_PAYLOAD_BYTES: u64 = 1 << 30;

/// Longest accepted address string in registration messages.
const MAX_ADDR_LEN: usize = 256;

/// Largest group size a welcome message may announce, and the cap config
/// validation holds `world_size` to. Bounds the address table allocation
/// when parsing an untrusted registrar response.
pub(crate) const MAX_GROUP_SIZE: usize = 1 << 16;

/// Wire value for "no datatype" (barrier frames).
const DTYPE_NONE: u8 = 0xFF;

/// Kind of a data-plane frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    /// Broadcast payload moving down the tree.
    Data = 1,
    /// Empty barrier token; `count` carries the dissemination round.
    Barrier = 2,
}

impl FrameKind {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Data),
            2 => Some(FrameKind::Barrier),
            _ => None,
        }
    }
}

/// Fixed header preceding every data-plane frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub kind: FrameKind,
    pub seq: u64,
    pub root: i32,
    pub dtype: Option<DatatypeTag>,
    pub count: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Header for a broadcast frame. `None` when the payload would exceed
    /// [`MAX_PAYLOAD_BYTES`].
    pub fn data(seq: u64, root: i32, dtype: DatatypeTag, count: u64) -> Option<Self> {
        let payload_len = count.checked_mul(dtype.size_in_bytes() as u64)?;
        if payload_len > MAX_PAYLOAD_BYTES {
            return None;
        }
        Some(FrameHeader {
            kind: FrameKind::Data,
            seq,
            root,
            dtype: Some(dtype),
            count,
            payload_len: payload_len as u32,
        })
    }

    /// Header for one round of a dissemination barrier.
    pub fn barrier(seq: u64, round: u32) -> Self {
        FrameHeader {
            kind: FrameKind::Barrier,
            seq,
            root: 0,
            dtype: None,
            count: u64::from(round),
            payload_len: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.kind as u8;
        buf[1..9].copy_from_slice(&self.seq.to_be_bytes());
        buf[9..13].copy_from_slice(&(self.root as u32).to_be_bytes());
        buf[13] = self.dtype.map_or(DTYPE_NONE, DatatypeTag::as_wire);
        buf[14..22].copy_from_slice(&self.count.to_be_bytes());
        buf[22..26].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode and structurally validate a header.
    ///
    /// Field consistency (payload length matches count × element size, caps,
    /// known kind and dtype values) is enforced here; agreement with the
    /// local collective call is the coordinator's job.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> io::Result<Self> {
        let kind = FrameKind::from_wire(buf[0])
            .ok_or_else(|| invalid_data(format!("invalid frame kind: {}", buf[0])))?;
        let seq = u64::from_be_bytes(buf[1..9].try_into().unwrap());
        let root = u32::from_be_bytes(buf[9..13].try_into().unwrap()) as i32;
        let dtype = match buf[13] {
            DTYPE_NONE => None,
            value => Some(
                DatatypeTag::from_wire(value)
                    .ok_or_else(|| invalid_data(format!("invalid datatype tag: {value}")))?,
            ),
        };
        let count = u64::from_be_bytes(buf[14..22].try_into().unwrap());
        let payload_len = u32::from_be_bytes(buf[22..26].try_into().unwrap());

        if u64::from(payload_len) > MAX_PAYLOAD_BYTES {
            return Err(invalid_data(format!(
                "frame payload {payload_len} exceeds maximum {MAX_PAYLOAD_BYTES}"
            )));
        }
        match (kind, dtype) {
            (FrameKind::Data, Some(tag)) => {
                let expected = count.checked_mul(tag.size_in_bytes() as u64);
                if expected != Some(u64::from(payload_len)) {
                    return Err(invalid_data(format!(
                        "frame payload {payload_len} does not match {count} x {tag:?}"
                    )));
                }
            }
            (FrameKind::Data, None) => {
                return Err(invalid_data("data frame without a datatype tag"));
            }
            (FrameKind::Barrier, _) if payload_len != 0 => {
                return Err(invalid_data("barrier frame with a payload"));
            }
            (FrameKind::Barrier, _) => {}
        }

        Ok(FrameHeader {
            kind,
            seq,
            root,
            dtype,
            count,
            payload_len,
        })
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dtype = match self.dtype {
            Some(tag) => format!("{tag:?}"),
            None => "none".to_string(),
        };
        write!(
            f,
            "seq={} kind={:?} root={} dtype={} count={}",
            self.seq, self.kind, self.root, dtype, self.count
        )
    }
}

/// Write one frame: header then payload. `payload` must be exactly
/// `header.payload_len` bytes.
pub(crate) fn write_frame<W: Write>(
    w: &mut W,
    header: &FrameHeader,
    payload: &[u8],
) -> io::Result<()> {
    debug_assert_eq!(payload.len() as u32, header.payload_len);
    w.write_all(&header.encode())?;
    w.write_all(payload)
}

/// Read and validate the next frame header.
pub(crate) fn read_frame_header<R: Read>(r: &mut R) -> io::Result<FrameHeader> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)?;
    FrameHeader::decode(&buf)
}

// ============================================================================
// Registration messages
// ============================================================================

fn write_preamble<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&MAGIC.to_be_bytes())?;
    w.write_all(&PROTOCOL_VERSION.to_be_bytes())
}

fn read_preamble<R: Read>(r: &mut R) -> io::Result<()> {
    let mut buf = [0u8; 6];
    r.read_exact(&mut buf)?;
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(invalid_data(format!("bad magic: {magic:#010x}")));
    }
    let version = u16::from_be_bytes(buf[4..6].try_into().unwrap());
    if version != PROTOCOL_VERSION {
        return Err(invalid_data(format!(
            "unsupported protocol version: {version} (expected {PROTOCOL_VERSION})"
        )));
    }
    Ok(())
}

fn write_addr<W: Write>(w: &mut W, addr: &SocketAddr) -> io::Result<()> {
    let text = addr.to_string();
    debug_assert!(text.len() <= MAX_ADDR_LEN);
    w.write_all(&(text.len() as u16).to_be_bytes())?;
    w.write_all(text.as_bytes())
}

fn read_addr<R: Read>(r: &mut R) -> io::Result<SocketAddr> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    if len == 0 || len > MAX_ADDR_LEN {
        return Err(invalid_data(format!("address length {len} out of range")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let text = std::str::from_utf8(&buf).map_err(|_| invalid_data("address is not UTF-8"))?;
    text.parse()
        .map_err(|_| invalid_data(format!("unparseable address: {text:?}")))
}

/// Joiner → registrar: configured group size and own data-plane address.
pub(crate) fn write_join<W: Write>(
    w: &mut W,
    world_size: i32,
    addr: &SocketAddr,
) -> io::Result<()> {
    write_preamble(w)?;
    w.write_all(&(world_size as u32).to_be_bytes())?;
    write_addr(w, addr)
}

pub(crate) fn read_join<R: Read>(r: &mut R) -> io::Result<(i32, SocketAddr)> {
    read_preamble(r)?;
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let world_size = u32::from_be_bytes(buf) as i32;
    let addr = read_addr(r)?;
    Ok((world_size, addr))
}

/// Registrar → joiner: assigned rank, group size, rank-ordered address table.
pub(crate) fn write_welcome<W: Write>(
    w: &mut W,
    rank: i32,
    addrs: &[SocketAddr],
) -> io::Result<()> {
    write_preamble(w)?;
    w.write_all(&(rank as u32).to_be_bytes())?;
    w.write_all(&(addrs.len() as u32).to_be_bytes())?;
    for addr in addrs {
        write_addr(w, addr)?;
    }
    Ok(())
}

pub(crate) fn read_welcome<R: Read>(r: &mut R) -> io::Result<(i32, Vec<SocketAddr>)> {
    read_preamble(r)?;
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    let rank = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as i32;
    let size = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
    if size == 0 || size > MAX_GROUP_SIZE {
        return Err(invalid_data(format!("welcome with group size {size}")));
    }
    if rank < 0 || rank as usize >= size {
        return Err(invalid_data(format!("welcome rank {rank} outside group of {size}")));
    }
    let mut addrs = Vec::with_capacity(size);
    for _ in 0..size {
        addrs.push(read_addr(r)?);
    }
    Ok((rank, addrs))
}

/// Identifying hello exchanged on each fresh mesh link (both directions).
pub(crate) fn write_mesh_hello<W: Write>(w: &mut W, rank: i32) -> io::Result<()> {
    write_preamble(w)?;
    w.write_all(&(rank as u32).to_be_bytes())
}

pub(crate) fn read_mesh_hello<R: Read>(r: &mut R) -> io::Result<i32> {
    read_preamble(r)?;
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf) as i32)
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
