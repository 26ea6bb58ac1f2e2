//! Datatype trait and wire tag mapping.
//!
//! This module provides the [`Datatype`] trait, a sealed trait that maps Rust
//! scalar types to the closed set of wire tags used by collective operations.
//! Every member of a group must agree on the tag (and the element count) for
//! a given operation; the tag travels in each frame header so disagreement is
//! detected instead of silently reinterpreting bytes.
//!
//! # Supported Types
//!
//! | Rust Type | Tag              | Wire Value | Size |
//! |-----------|------------------|------------|------|
//! | `f32`     | `DatatypeTag::F32` | 0        | 4    |
//! | `f64`     | `DatatypeTag::F64` | 1        | 8    |
//! | `i32`     | `DatatypeTag::I32` | 2        | 4    |
//! | `i64`     | `DatatypeTag::I64` | 3        | 8    |
//! | `u8`      | `DatatypeTag::U8`  | 4        | 1    |
//! | `u32`     | `DatatypeTag::U32` | 5        | 4    |
//! | `u64`     | `DatatypeTag::U64` | 6        | 8    |
//!
//! Payload bytes travel in the hosts' native byte order; mixed-endian groups
//! are out of scope.

/// Internal module to seal the trait — prevents external implementations.
mod sealed {
    pub trait Sealed {}
}

/// Closed set of scalar wire layouts supported by collective operations.
///
/// The discriminants are the on-wire tag values carried in frame headers and
/// must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatatypeTag {
    /// 32-bit IEEE floating point
    F32 = 0,
    /// 64-bit IEEE floating point
    F64 = 1,
    /// 32-bit signed integer
    I32 = 2,
    /// 64-bit signed integer
    I64 = 3,
    /// 8-bit unsigned integer
    U8 = 4,
    /// 32-bit unsigned integer
    U32 = 5,
    /// 64-bit unsigned integer
    U64 = 6,
}

impl DatatypeTag {
    /// Size of one element of this type on the wire, in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DatatypeTag::U8 => 1,
            DatatypeTag::F32 | DatatypeTag::I32 | DatatypeTag::U32 => 4,
            DatatypeTag::F64 | DatatypeTag::I64 | DatatypeTag::U64 => 8,
        }
    }

    /// Decode a tag from its wire value.
    ///
    /// Returns `None` for values outside the closed set, which callers treat
    /// as a protocol violation.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(DatatypeTag::F32),
            1 => Some(DatatypeTag::F64),
            2 => Some(DatatypeTag::I32),
            3 => Some(DatatypeTag::I64),
            4 => Some(DatatypeTag::U8),
            5 => Some(DatatypeTag::U32),
            6 => Some(DatatypeTag::U64),
            _ => None,
        }
    }

    /// Encode this tag as its wire value.
    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// Trait for scalar types that can be moved by collective operations.
///
/// This is a **sealed trait** — it cannot be implemented outside this crate.
/// Supported types: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`], [`u32`],
/// [`u64`].
///
/// # Example
///
/// ```no_run
/// use meshcast::{Environment, GroupConfig};
///
/// let env = Environment::init(GroupConfig::from_env().unwrap()).unwrap();
/// let world = env.world();
///
/// // Works with f64
/// let mut data_f64 = vec![1.0f64; 10];
/// world.broadcast(&mut data_f64, 0).unwrap();
///
/// // Works with i32
/// let mut data_i32 = vec![42i32; 10];
/// world.broadcast(&mut data_i32, 0).unwrap();
/// ```
pub trait Datatype: sealed::Sealed + Copy + Send + 'static {
    /// The wire tag carried in frame headers for this type.
    const TAG: DatatypeTag;
}

macro_rules! impl_datatype {
    ($ty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl Datatype for $ty {
            const TAG: DatatypeTag = $tag;
        }
    };
}

impl_datatype!(f32, DatatypeTag::F32);
impl_datatype!(f64, DatatypeTag::F64);
impl_datatype!(i32, DatatypeTag::I32);
impl_datatype!(i64, DatatypeTag::I64);
impl_datatype!(u8, DatatypeTag::U8);
impl_datatype!(u32, DatatypeTag::U32);
impl_datatype!(u64, DatatypeTag::U64);

/// View a mutable scalar slice as raw bytes.
///
/// This is the buffer-view adaptation done once at the call boundary: the
/// coordinator and transport only ever see bytes plus an element count and a
/// tag, never a container type.
pub(crate) fn bytes_of_mut<T: Datatype>(buf: &mut [T]) -> &mut [u8] {
    // SAFETY: every Datatype impl is a sealed fixed-width scalar with no
    // padding bytes, so the element memory is fully initialized and the
    // reinterpreted length cannot overflow (it came from a valid slice).
    // Every bit pattern is a valid value for these types, so writing
    // arbitrary received bytes through the view cannot produce an invalid T.
    unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>(), std::mem::size_of_val(buf))
    }
}
