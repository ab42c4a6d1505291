//! Array geometry configuration
//!
//! One `ArrayConfig` describes the fixed geometry of an array: how many
//! user-area segments exist, how stripes are sized, and how many volume
//! slots the mapper manages. The geometry is decided at array creation
//! and never changes while the array is mounted, so everything here is
//! plain data validated once at bring-up.

use thiserror::Error;

/// Size of one metadata page, including its trailing control info.
pub const META_PAGE_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fixed geometry of one array.
#[derive(Clone, Debug)]
pub struct ArrayConfig {
    /// Number of segments in the SSD user area
    pub segment_count: u32,
    /// Stripes per segment
    pub stripes_per_segment: u32,
    /// Data blocks per stripe
    pub blocks_per_stripe: u32,
    /// Stripes in the NVRAM write buffer
    pub write_buffer_stripe_count: u32,
    /// Volume slots the mapper manages
    pub volume_slot_count: u32,
    /// Metadata page size in bytes
    pub meta_page_size: usize,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            segment_count: 64,
            stripes_per_segment: 8,
            blocks_per_stripe: 128,
            write_buffer_stripe_count: 16,
            volume_slot_count: 256,
            meta_page_size: META_PAGE_SIZE,
        }
    }
}

impl ArrayConfig {
    /// Validate the geometry. Called once before the array is brought up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_count == 0 {
            return Err(ConfigError::Invalid("segment_count must be > 0".into()));
        }
        if self.stripes_per_segment == 0 {
            return Err(ConfigError::Invalid(
                "stripes_per_segment must be > 0".into(),
            ));
        }
        if self.blocks_per_stripe == 0 {
            return Err(ConfigError::Invalid("blocks_per_stripe must be > 0".into()));
        }
        if self.volume_slot_count == 0 {
            return Err(ConfigError::Invalid("volume_slot_count must be > 0".into()));
        }
        if self.meta_page_size < 512 || !self.meta_page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "meta_page_size must be a power of two >= 512, got {}",
                self.meta_page_size
            )));
        }
        Ok(())
    }

    /// Total stripes in the user area.
    #[must_use]
    pub fn user_area_stripe_count(&self) -> u32 {
        self.segment_count * self.stripes_per_segment
    }

    /// Blocks per segment.
    #[must_use]
    pub fn blocks_per_segment(&self) -> u64 {
        u64::from(self.stripes_per_segment) * u64::from(self.blocks_per_stripe)
    }
}
