//! Context section layout
//!
//! Each context owner's file is a sequence of fixed sections laid
//! back-to-back from offset 0 in registration order. The layout is
//! computed once when the engine initializes and is stable for the life
//! of the open file.

use crate::error::{AllocatorError, AllocatorResult};

/// The three context owners, in bring-up order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextOwner {
    SegmentCtx,
    AllocatorCtx,
    RebuildCtx,
}

impl ContextOwner {
    /// On-disk magic for the owner's header section.
    #[must_use]
    pub fn signature(&self) -> u32 {
        match self {
            ContextOwner::SegmentCtx => 0x5347_4D54,   // "SGMT"
            ContextOwner::AllocatorCtx => 0x414C_4354, // "ALCT"
            ContextOwner::RebuildCtx => 0x5242_4C44,   // "RBLD"
        }
    }

    /// File name of the owner's context file within the array directory.
    #[must_use]
    pub fn file_name(&self) -> &'static str {
        match self {
            ContextOwner::SegmentCtx => "segment.ctx",
            ContextOwner::AllocatorCtx => "allocator.ctx",
            ContextOwner::RebuildCtx => "rebuild.ctx",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextOwner::SegmentCtx => "segment",
            ContextOwner::AllocatorCtx => "allocator",
            ContextOwner::RebuildCtx => "rebuild",
        }
    }

    /// Engine index used for per-owner file ids.
    #[must_use]
    pub fn file_id(&self) -> u32 {
        match self {
            ContextOwner::SegmentCtx => 1,
            ContextOwner::AllocatorCtx => 2,
            ContextOwner::RebuildCtx => 3,
        }
    }
}

/// One section within a context file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSection {
    pub offset: u64,
    pub size: u64,
}

impl ContextSection {
    /// The section's byte range within the serialized file image.
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// Back-to-back section layout for one owner.
#[derive(Debug, Clone)]
pub struct SectionLayout {
    sections: Vec<ContextSection>,
    file_size: u64,
}

impl SectionLayout {
    /// Lay sections out from offset 0 in registration order.
    #[must_use]
    pub fn compute(sizes: &[u64]) -> Self {
        let mut sections = Vec::with_capacity(sizes.len());
        let mut offset = 0u64;
        for &size in sizes {
            sections.push(ContextSection { offset, size });
            offset += size;
        }
        Self {
            sections,
            file_size: offset,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Sum of all section sizes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn section(&self, index: usize) -> AllocatorResult<ContextSection> {
        self.sections.get(index).copied().ok_or_else(|| {
            AllocatorError::InvalidSection(format!(
                "section {} of {} requested",
                index,
                self.sections.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_to_back_layout() {
        let layout = SectionLayout::compute(&[64, 256, 1024]);
        assert_eq!(layout.section(0).unwrap(), ContextSection { offset: 0, size: 64 });
        assert_eq!(
            layout.section(1).unwrap(),
            ContextSection { offset: 64, size: 256 }
        );
        assert_eq!(
            layout.section(2).unwrap(),
            ContextSection { offset: 320, size: 1024 }
        );
        assert_eq!(layout.file_size(), 1344);
    }

    #[test]
    fn test_out_of_range_section() {
        let layout = SectionLayout::compute(&[64]);
        assert!(matches!(
            layout.section(1),
            Err(AllocatorError::InvalidSection(_))
        ));
    }

    #[test]
    fn test_owner_signatures_distinct() {
        let owners = [
            ContextOwner::SegmentCtx,
            ContextOwner::AllocatorCtx,
            ContextOwner::RebuildCtx,
        ];
        for a in owners {
            for b in owners {
                if a != b {
                    assert_ne!(a.signature(), b.signature());
                }
            }
        }
    }
}
