use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Physical address of `segment:offset` in real mode.
#[inline]
pub const fn physical(segment: u16, offset: u16) -> u32 {
    ((segment as u32) << 4) + offset as u32
}

/// A real-mode `segment:offset` pair.
///
/// Equality, ordering and hashing use the physical address, so `1000:0010` and
/// `1001:0000` are the same address.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct SegmentedAddress {
    segment: u16,
    offset: u16,
}

impl SegmentedAddress {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    pub const fn segment(self) -> u16 {
        self.segment
    }

    pub const fn offset(self) -> u16 {
        self.offset
    }

    pub const fn physical(self) -> u32 {
        physical(self.segment, self.offset)
    }

    /// Same segment, offset advanced with 16-bit wraparound.
    pub const fn wrapping_add(self, delta: u16) -> Self {
        Self::new(self.segment, self.offset.wrapping_add(delta))
    }
}

impl PartialEq for SegmentedAddress {
    fn eq(&self, other: &Self) -> bool {
        self.physical() == other.physical()
    }
}

impl Eq for SegmentedAddress {}

impl PartialOrd for SegmentedAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentedAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical().cmp(&other.physical())
    }
}

impl Hash for SegmentedAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.physical().hash(state);
    }
}

impl fmt::Display for SegmentedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

impl fmt::Debug for SegmentedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#07x}", self, self.physical())
    }
}
