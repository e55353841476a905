//! A buddy allocator whose only metadata is a bitmap over the block tree.
//!
//! [`BuddyAllocator`] partitions a single contiguous region into power-of-two
//! blocks. Block occupancy is tracked with one bit per node of a complete
//! binary tree (the [`OccupancyMap`]), and each allocated block carries its
//! tree index in a small header so that it can be freed from its pointer
//! alone.
//!
//! The region and the bitmap storage are supplied by the caller, which makes
//! the allocator usable in freestanding environments:
//!
//! ```
//! use bitbuddy::{BuddyAllocator, BuddyConfig};
//!
//! // Eight 16-byte blocks on the deepest level, 128 bytes in total.
//! let config = BuddyConfig::new(3, 16);
//!
//! let mut region = [0u8; 128];
//! let mut metadata = [0u8; 2];
//! let mut buddy = BuddyAllocator::try_new_in(config, &mut region, &mut metadata).unwrap();
//!
//! let block = buddy.allocate(50).unwrap();
//! assert_eq!(block.len(), 64 - bitbuddy::HEADER_SIZE);
//!
//! unsafe { buddy.deallocate(block.cast::<u8>().as_ptr()).unwrap() };
//! assert!(buddy.is_empty());
//! ```
//!
//! # Crate features
//!
//! - `alloc`: adds constructors backed by the global allocator.
//! - `std`: implies `alloc` and implements `std::error::Error` for the error
//!   types.

#![doc(html_root_url = "https://docs.rs/bitbuddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod config;
pub mod index;
mod occupancy;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, mem, ptr::NonNull};

pub use crate::{
    buddy::BuddyAllocator,
    config::{BuddyConfig, MAX_LEVELS},
    occupancy::OccupancyMap,
};

/// The recovery tag stored at the start of every allocated block.
pub(crate) type Tag = u32;

/// The number of bytes at the start of each block reserved for its recovery
/// tag.
pub const HEADER_SIZE: usize = mem::size_of::<Tag>();

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The tree is deeper than [`MAX_LEVELS`] allows.
    TooManyLevels {
        /// The requested depth.
        levels: u32,
    },

    /// The minimum block size cannot hold a block header.
    BlockTooSmall {
        /// The requested minimum block size.
        min_block_size: usize,
    },

    /// The size of the managed region overflows.
    CapacityOverflow,

    /// The supplied region is smaller than the configuration requires.
    RegionTooSmall {
        /// Bytes required.
        required: usize,
        /// Bytes supplied.
        provided: usize,
    },

    /// The supplied bitmap storage is smaller than the configuration requires.
    MetadataTooSmall {
        /// Bytes required.
        required: usize,
        /// Bytes supplied.
        provided: usize,
    },
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::TooManyLevels { levels } => write!(
                f,
                "{levels} levels requested, but at most {} are supported",
                MAX_LEVELS - 1
            ),
            AllocInitError::BlockTooSmall { min_block_size } => write!(
                f,
                "minimum block size {min_block_size} cannot hold a {HEADER_SIZE}-byte header"
            ),
            AllocInitError::CapacityOverflow => f.write_str("managed region size overflows"),
            AllocInitError::RegionTooSmall { required, provided } => write!(
                f,
                "region too small: {required} bytes required, {provided} provided"
            ),
            AllocInitError::MetadataTooSmall { required, provided } => write!(
                f,
                "bitmap storage too small: {required} bytes required, {provided} provided"
            ),
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion or an oversized
/// request.
///
/// The allocator is left unchanged and remains usable.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The request plus its header is larger than the whole region.
    TooLarge {
        /// The requested size, excluding the header.
        size: usize,
        /// The size of the managed region.
        capacity: usize,
    },
    /// No free block was left on the level that fits the request.
    Exhausted {
        /// The level that was searched.
        level: u32,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::TooLarge { size, capacity } => write!(
                f,
                "request of {size} bytes does not fit in a {capacity}-byte region"
            ),
            AllocError::Exhausted { level } => write!(f, "no free block on level {level}"),
        }
    }
}

/// The error type for releasing blocks.
///
/// The allocator is left unchanged when any of these is returned.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FreeError {
    /// A null pointer was passed to `deallocate`.
    NullPointer,
    /// The pointer does not refer to a block of this allocator.
    InvalidPointer,
    /// The node index is outside the block tree.
    InvalidNode(usize),
    /// The block at the given node is already free.
    DoubleFree(usize),
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::NullPointer => f.write_str("cannot free a null pointer"),
            FreeError::InvalidPointer => f.write_str("pointer was not allocated by this allocator"),
            FreeError::InvalidNode(node) => write!(f, "node {node} is not in the block tree"),
            FreeError::DoubleFree(node) => write!(f, "double free of node {node}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocInitError {}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

#[cfg(feature = "std")]
impl std::error::Error for FreeError {}

/// Types which provide memory which backs an allocator.
///
/// This is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from
///   caller-supplied buffers or raw pointers. The caller keeps ownership of
///   that memory.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by caller-owned memory.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
