//! Element datatype tag and the lookup table that maps it to a transport
//! type code.
//!
//! The source this design is modeled on maps a host C++ type to a
//! transport type code via template specialization at compile time; the
//! Rust shape described in the design notes is a runtime tag carried on
//! the collective state plus a lookup table, so the state object becomes
//! a variant discriminated by the tag rather than a monomorphized type.

use std::fmt;

/// Element datatype carried by a collective state.
///
/// Corresponds to the handful of scalar types the host-memory transport
/// understands natively. Enumerated rather than generic so that a
/// `CollectiveState` can be a plain value type with a runtime-checked
/// shape, per the design note on template specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Datatype {
    /// 8-bit unsigned integer.
    U8 = 0,
    /// 32-bit signed integer.
    I32 = 1,
    /// 64-bit signed integer.
    I64 = 2,
    /// 32-bit IEEE-754 float.
    F32 = 3,
    /// 64-bit IEEE-754 float.
    F64 = 4,
}

/// Transport-side type code, opaque beyond `u32` identity and byte width.
///
/// Stands in for whatever type handle a real host-memory transport binding
/// would require at the call site of its non-blocking collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTypeCode {
    /// The transport's internal type identifier.
    pub code: u32,
    /// Size of one element in bytes, used for staging-buffer sizing.
    pub size_bytes: usize,
}

impl Datatype {
    /// Number of bytes occupied by one element of this type.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Look up the transport type code for this datatype.
    ///
    /// This is the table the design notes call for: a lookup keyed by the
    /// runtime type tag rather than a compile-time specialization.
    /// `hostxfer::transport::InProcessTransport` consults it on every
    /// dispatched contribution, to size-check the payload and to trace
    /// the type code actually handed to the transport.
    #[must_use]
    pub const fn transport_code(self) -> TransportTypeCode {
        let code = match self {
            Self::U8 => 0,
            Self::I32 => 1,
            Self::I64 => 2,
            Self::F32 => 3,
            Self::F64 => 4,
        };
        TransportTypeCode {
            code,
            size_bytes: self.size_bytes(),
        }
    }

    /// Human-readable name, mirroring the pack's `as_str`-on-enum convention.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A type that can describe itself as a [`Datatype`] for staging-buffer
/// sizing and transport dispatch.
pub trait HostElement: Copy + Send + Sync + 'static {
    /// The datatype tag for `Self`.
    const DATATYPE: Datatype;
}

impl HostElement for u8 {
    const DATATYPE: Datatype = Datatype::U8;
}
impl HostElement for i32 {
    const DATATYPE: Datatype = Datatype::I32;
}
impl HostElement for i64 {
    const DATATYPE: Datatype = Datatype::I64;
}
impl HostElement for f32 {
    const DATATYPE: Datatype = Datatype::F32;
}
impl HostElement for f64 {
    const DATATYPE: Datatype = Datatype::F64;
}
