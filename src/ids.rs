//! Opaque identifiers shared across the engine.
//!
//! All identifiers are plain 64-bit integers on the wire and on disk; the
//! newtypes exist only so the compiler stops us from mixing a `RegionId`
//! into a slot that expects a `VirtualServerId`.

use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(ServerId);
id_type!(VirtualServerId);
id_type!(RegionId);
id_type!(SpaceId);
id_type!(SubspaceId);
id_type!(IndexId);
id_type!(TransferId);

/// A per-region version number. Strictly monotone and gap-free from the
/// point leader's perspective (spec.md §3, "Invariants").
pub type Version = u64;

/// Sequence number of an `XFER_OP` within one transfer. Strictly increasing
/// from the source's point of view.
pub type SeqNo = u64;
