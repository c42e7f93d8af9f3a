//! Addresses inside the mapped image.
//!
//! An [`Address`] is either flat (`offset`) or segmented (`base:offset`). It also
//! remembers the bit width of its offset, which only drives the canonical text
//! form: a 16-bit flat address `0x1000` renders as `1000`, a 32-bit one as
//! `00001000`. Equality, ordering and hashing only look at `(base, offset)`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::Offset;

/// A byte position in the addressable space of a [`crate::Database`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Address {
    base: Option<u16>,
    offset: Offset,
    bits: u8,
}

impl Address {
    /// Create a flat address whose offset is `bits` wide.
    pub fn flat(offset: Offset, bits: u8) -> Self {
        Self { base: None, offset, bits: Self::clamp_bits(bits) }
    }

    /// Create a segmented `base:offset` address.
    pub fn segmented(base: u16, offset: Offset, bits: u8) -> Self {
        Self { base: Some(base), offset, bits: Self::clamp_bits(bits) }
    }

    fn clamp_bits(bits: u8) -> u8 {
        match bits {
            0 => 8,
            b if b > 64 => 64,
            b => b,
        }
    }

    /// Segment part, if this address is segmented.
    pub fn base(&self) -> Option<u16> {
        self.base
    }

    /// Native offset.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// Width of the offset in bits.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Same addressing scheme, different offset.
    ///
    /// This is how backends build the target of a reference they decoded.
    pub fn with_offset(&self, offset: Offset) -> Self {
        Self { offset, ..*self }
    }

    /// Move forward by `delta` bytes, `None` on overflow.
    pub fn checked_add(&self, delta: u64) -> Option<Self> {
        self.offset.checked_add(delta).map(|offset| self.with_offset(offset))
    }

    /// Whether both addresses live in the same segment.
    pub fn same_space(&self, other: &Address) -> bool {
        self.base == other.base
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.offset == other.offset
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.hash(state);
        self.offset.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.base, self.offset).cmp(&(other.base, other.offset))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = (self.bits as usize + 3) / 4;
        match self.base {
            Some(base) => write!(f, "{:04x}:{:0width$x}", base, self.offset, width = width),
            None => write!(f, "{:0width$x}", self.offset, width = width),
        }
    }
}
