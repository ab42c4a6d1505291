//! Core addressing types for BlockIO
//!
//! The array translates a volume-relative block address (RBA) into a
//! virtual stripe address (VSA), and a virtual stripe id into a physical
//! stripe location, in two map lookups. These are the types that flow
//! through both translations.

use std::fmt;

/// Index of an array within the process
pub type ArrayId = u32;

/// Volume slot index within an array
pub type VolumeId = u32;

/// Segment index within the user area
pub type SegmentId = u32;

/// Stripe index (virtual or logical depending on context)
pub type StripeId = u32;

/// Volume-relative block address
pub type BlkAddr = u64;

/// Block offset within a stripe
pub type BlkOffset = u64;

/// Logical page number within a metadata file
pub type MetaLpn = u64;

/// Sentinel stripe id meaning "unmapped"
pub const UNMAP_STRIPE: StripeId = StripeId::MAX;

/// Sentinel segment id meaning "none"
pub const UNMAP_SEGMENT: SegmentId = SegmentId::MAX;

/// A virtual stripe address: which stripe a block lives on, and where
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualBlkAddr {
    pub stripe_id: StripeId,
    pub offset: BlkOffset,
}

/// Sentinel VSA meaning "block has never been written"
pub const UNMAP_VSA: VirtualBlkAddr = VirtualBlkAddr {
    stripe_id: UNMAP_STRIPE,
    offset: u64::MAX,
};

impl VirtualBlkAddr {
    #[must_use]
    pub const fn new(stripe_id: StripeId, offset: BlkOffset) -> Self {
        Self { stripe_id, offset }
    }

    /// True if this address is the unmap sentinel
    #[must_use]
    pub fn is_unmapped(&self) -> bool {
        *self == UNMAP_VSA
    }
}

impl fmt::Debug for VirtualBlkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unmapped() {
            write!(f, "VirtualBlkAddr(UNMAP)")
        } else {
            write!(f, "VirtualBlkAddr({}:{})", self.stripe_id, self.offset)
        }
    }
}

/// A contiguous run of virtual blocks starting at `start_vsa`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBlks {
    pub start_vsa: VirtualBlkAddr,
    pub num_blks: u32,
}

/// Where a logical stripe currently resides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StripeLoc {
    /// NVRAM write buffer
    WriteBuffer = 0,
    /// SSD user data area
    UserArea = 1,
}

impl TryFrom<u8> for StripeLoc {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StripeLoc::WriteBuffer),
            1 => Ok(StripeLoc::UserArea),
            other => Err(other),
        }
    }
}

/// Physical location of a virtual stripe
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StripeAddr {
    pub loc: StripeLoc,
    pub stripe_id: StripeId,
}

/// Sentinel stripe address meaning "stripe has never been placed"
pub const UNMAP_STRIPE_ADDR: StripeAddr = StripeAddr {
    loc: StripeLoc::UserArea,
    stripe_id: UNMAP_STRIPE,
};

impl StripeAddr {
    #[must_use]
    pub const fn new(loc: StripeLoc, stripe_id: StripeId) -> Self {
        Self { loc, stripe_id }
    }

    #[must_use]
    pub fn is_unmapped(&self) -> bool {
        self.stripe_id == UNMAP_STRIPE
    }

    /// True if the stripe has been destaged to the SSD user area
    #[must_use]
    pub fn is_user_area(&self) -> bool {
        self.loc == StripeLoc::UserArea
    }
}

impl fmt::Debug for StripeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unmapped() {
            write!(f, "StripeAddr(UNMAP)")
        } else {
            write!(f, "StripeAddr({:?}:{})", self.loc, self.stripe_id)
        }
    }
}

/// Backing media class for a metadata region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Ssd,
    Nvram,
}

impl MediaType {
    /// NVRAM regions are mapped for direct access; their pages are never
    /// zero-filled on a failed signature check because the raw bytes are
    /// owned by the mapping, not by the page cache.
    #[must_use]
    pub fn supports_direct_access(&self) -> bool {
        matches!(self, MediaType::Nvram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmap_sentinels() {
        assert!(UNMAP_VSA.is_unmapped());
        assert!(UNMAP_STRIPE_ADDR.is_unmapped());
        assert!(!VirtualBlkAddr::new(3, 7).is_unmapped());
        assert!(!StripeAddr::new(StripeLoc::WriteBuffer, 0).is_unmapped());
    }

    #[test]
    fn test_stripe_loc_roundtrip() {
        assert_eq!(StripeLoc::try_from(0u8), Ok(StripeLoc::WriteBuffer));
        assert_eq!(StripeLoc::try_from(1u8), Ok(StripeLoc::UserArea));
        assert_eq!(StripeLoc::try_from(2u8), Err(2));
    }

    #[test]
    fn test_direct_access_media() {
        assert!(MediaType::Nvram.supports_direct_access());
        assert!(!MediaType::Ssd.supports_direct_access());
    }
}
