//! Allocator configuration.

use core::{alloc::Layout, mem};

use crate::{index, occupancy::OccupancyMap, AllocInitError, HEADER_SIZE};

/// The exclusive upper bound on [`BuddyConfig::levels`].
pub const MAX_LEVELS: u32 = 16;

/// The shape of a buddy allocator.
///
/// An allocator with `levels` levels below the root manages
/// `2^levels * min_block_size` bytes. The root block spans the whole region,
/// and each level halves the block size down to `min_block_size` on level
/// `levels`.
///
/// ```
/// use bitbuddy::BuddyConfig;
///
/// let config = BuddyConfig::new(3, 16);
/// assert_eq!(config.capacity(), Some(128));
/// assert_eq!(config.num_nodes(), 15);
/// assert_eq!(config.metadata_size(), 2);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BuddyConfig {
    /// Depth of the deepest level. Level 0 is the root.
    pub levels: u32,
    /// Size in bytes of a block on the deepest level.
    pub min_block_size: usize,
}

impl BuddyConfig {
    /// Creates a configuration. Nothing is checked until [`validate`](Self::validate).
    pub const fn new(levels: u32, min_block_size: usize) -> BuddyConfig {
        BuddyConfig {
            levels,
            min_block_size,
        }
    }

    /// Checks that the configuration describes a usable allocator.
    ///
    /// # Errors
    ///
    /// - [`AllocInitError::TooManyLevels`] if `levels >= MAX_LEVELS`.
    /// - [`AllocInitError::BlockTooSmall`] if a minimum block cannot hold the
    ///   recovery tag.
    /// - [`AllocInitError::CapacityOverflow`] if the region size does not fit
    ///   in an `isize`.
    pub fn validate(&self) -> Result<(), AllocInitError> {
        if self.levels >= MAX_LEVELS {
            return Err(AllocInitError::TooManyLevels {
                levels: self.levels,
            });
        }

        if self.min_block_size < HEADER_SIZE {
            return Err(AllocInitError::BlockTooSmall {
                min_block_size: self.min_block_size,
            });
        }

        self.capacity()
            .filter(|&cap| cap <= isize::MAX as usize)
            .ok_or(AllocInitError::CapacityOverflow)?;

        Ok(())
    }

    /// Returns the number of bytes managed, or `None` on overflow.
    pub fn capacity(&self) -> Option<usize> {
        1_usize
            .checked_shl(self.levels)?
            .checked_mul(self.min_block_size)
    }

    /// Returns the number of nodes in the block tree.
    pub fn num_nodes(&self) -> usize {
        index::num_nodes(self.levels)
    }

    /// Returns the number of bytes of occupancy map storage required.
    pub fn metadata_size(&self) -> usize {
        OccupancyMap::storage_size(self.num_nodes())
    }

    /// Returns the layout requirements of the managed region.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn region_layout(&self) -> Result<Layout, AllocInitError> {
        self.validate()?;

        let size = self.capacity().ok_or(AllocInitError::CapacityOverflow)?;
        Layout::from_size_align(size, mem::align_of::<crate::Tag>())
            .map_err(|_| AllocInitError::CapacityOverflow)
    }

    /// Returns the layout requirements of the occupancy map storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn metadata_layout(&self) -> Result<Layout, AllocInitError> {
        self.validate()?;

        Layout::array::<u8>(self.metadata_size()).map_err(|_| AllocInitError::CapacityOverflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_shapes() {
        assert!(BuddyConfig::new(0, HEADER_SIZE).validate().is_ok());
        assert!(BuddyConfig::new(MAX_LEVELS - 1, 64).validate().is_ok());

        assert!(matches!(
            BuddyConfig::new(MAX_LEVELS, 64).validate(),
            Err(AllocInitError::TooManyLevels { levels: MAX_LEVELS })
        ));
        assert!(matches!(
            BuddyConfig::new(3, HEADER_SIZE - 1).validate(),
            Err(AllocInitError::BlockTooSmall { .. })
        ));
        assert!(matches!(
            BuddyConfig::new(8, usize::MAX / 2).validate(),
            Err(AllocInitError::CapacityOverflow)
        ));
    }

    #[test]
    fn sizes_follow_levels() {
        let config = BuddyConfig::new(4, 32);

        assert_eq!(config.capacity(), Some(512));
        assert_eq!(config.num_nodes(), 31);
        assert_eq!(config.metadata_size(), 4);
        assert_eq!(config.region_layout().unwrap().size(), 512);
        assert_eq!(config.metadata_layout().unwrap().size(), 4);
    }
}
