//! A binary-buddy memory allocator.

use core::{cmp, fmt, mem::ManuallyDrop, ptr::NonNull};

use log::{debug, trace, warn};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    base::BasePtr, index, AllocError, AllocInitError, BackingAllocator, BuddyConfig, FreeError,
    OccupancyMap, Raw, Tag, HEADER_SIZE,
};

/// A binary-buddy allocator over a single region.
///
/// The region is split into a complete binary tree of blocks: the root
/// (level 0) spans all of it, and each level below halves the block size,
/// down to [`BuddyConfig::min_block_size`] on level [`BuddyConfig::levels`].
/// Occupancy is tracked with one bit per tree node in an [`OccupancyMap`].
///
/// Blocks can be taken at tree-node granularity with [`acquire`] and
/// [`release`], or at byte granularity with [`allocate`] and [`deallocate`].
/// The latter store the node index in the first [`HEADER_SIZE`] bytes of the
/// block and hand out the memory behind it.
///
/// The allocator is not thread-safe. It holds raw pointers and is therefore
/// neither `Send` nor `Sync`.
///
/// [`acquire`]: BuddyAllocator::acquire
/// [`release`]: BuddyAllocator::release
/// [`allocate`]: BuddyAllocator::allocate
/// [`deallocate`]: BuddyAllocator::deallocate
pub struct BuddyAllocator<'a, A: BackingAllocator = Raw> {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    config: BuddyConfig,
    capacity: usize,
    map: OccupancyMap<'a>,
    backing_allocator: A,
}

impl<'a> BuddyAllocator<'a, Raw> {
    /// Constructs a new `BuddyAllocator` over caller-supplied buffers.
    ///
    /// `region` must hold at least `config.capacity()` bytes and `metadata`
    /// at least `config.metadata_size()` bytes. Any excess is left unused.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or either buffer is too small.
    pub fn try_new_in(
        config: BuddyConfig,
        region: &'a mut [u8],
        metadata: &'a mut [u8],
    ) -> Result<BuddyAllocator<'a, Raw>, AllocInitError> {
        let region_len = region.len();
        let metadata_len = metadata.len();

        // SAFETY: both slices are exclusively borrowed for `'a`.
        unsafe {
            Self::try_new_raw(
                config,
                NonNull::from(metadata).cast(),
                metadata_len,
                NonNull::from(region).cast(),
                region_len,
            )
        }
    }

    /// Constructs a new `BuddyAllocator` from raw pointers.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or either length is too small.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `region_len` bytes
    ///   for `'a`.
    /// - `metadata` must be valid for reads and writes for `metadata_len`
    ///   bytes for `'a`.
    /// - Neither region may be accessed other than through the allocator (or
    ///   the blocks it hands out) during `'a`.
    pub unsafe fn try_new_raw(
        config: BuddyConfig,
        metadata: NonNull<u8>,
        metadata_len: usize,
        region: NonNull<u8>,
        region_len: usize,
    ) -> Result<BuddyAllocator<'a, Raw>, AllocInitError> {
        let parts =
            unsafe { BuddyAllocatorParts::new(config, metadata, metadata_len, region, region_len)? };

        Ok(parts.with_backing_allocator(Raw))
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the region pointer and the metadata
    /// pointer. All outstanding allocations should be freed or forgotten
    /// first; their blocks are no longer tracked.
    pub fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>) {
        let this = ManuallyDrop::new(self);

        (this.base.ptr(), this.map.storage())
    }
}

#[cfg(any(feature = "alloc", test))]
impl BuddyAllocator<'static, Global> {
    /// Constructs a new `BuddyAllocator` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or allocation fails.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(config: BuddyConfig) -> Result<BuddyAllocator<'static, Global>, AllocInitError> {
        let region_layout = config.region_layout()?;
        let metadata_layout = config.metadata_layout()?;

        unsafe {
            // Zeroed so that every tag read in `deallocate` is initialized.
            let region = NonNull::new(alloc::alloc::alloc_zeroed(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            let parts = BuddyAllocatorParts::new(
                config,
                metadata,
                metadata_layout.size(),
                region,
                region_layout.size(),
            )?;

            Ok(parts.with_backing_allocator(Global))
        }
    }

    /// Constructs a new `BuddyAllocator` backed by the global allocator.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid. If allocation fails, this constructor
    /// invokes [`handle_alloc_error`].
    ///
    /// [`handle_alloc_error`]: alloc::alloc::handle_alloc_error
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn new(config: BuddyConfig) -> BuddyAllocator<'static, Global> {
        match Self::try_new(config) {
            Ok(a) => a,
            Err(AllocInitError::AllocFailed(layout)) => alloc::alloc::handle_alloc_error(layout),
            Err(e) => panic!("invalid buddy allocator configuration: {e}"),
        }
    }
}

impl<'a, A: BackingAllocator> Drop for BuddyAllocator<'a, A> {
    fn drop(&mut self) {
        // Layouts were validated at construction; `Raw` ignores them anyway.
        if let (Ok(region_layout), Ok(metadata_layout)) =
            (self.config.region_layout(), self.config.metadata_layout())
        {
            unsafe {
                self.backing_allocator
                    .deallocate(self.base.ptr(), region_layout);
                self.backing_allocator
                    .deallocate(self.map.storage(), metadata_layout);
            }
        }
    }
}

impl<'a, A: BackingAllocator> BuddyAllocator<'a, A> {
    /// Returns the depth of the deepest level.
    #[inline]
    pub fn levels(&self) -> u32 {
        self.config.levels
    }

    /// Returns the size of blocks on the deepest level.
    #[inline]
    pub fn min_block_size(&self) -> usize {
        self.config.min_block_size
    }

    /// Returns the configuration the allocator was built with.
    #[inline]
    pub fn config(&self) -> BuddyConfig {
        self.config
    }

    /// Returns the number of bytes managed by the allocator.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the size of blocks on `level`.
    ///
    /// # Panics
    ///
    /// Panics if `level` is deeper than [`levels`](Self::levels).
    #[inline]
    pub fn block_size(&self, level: u32) -> usize {
        assert!(level <= self.config.levels, "level {level} out of range");
        self.capacity >> level
    }

    /// Returns the deepest level whose blocks can hold `size` bytes plus the
    /// block header, or `None` if even the root block is too small.
    pub fn level_for(&self, size: usize) -> Option<u32> {
        let needed = size.checked_add(HEADER_SIZE)?;
        if needed > self.capacity {
            return None;
        }

        // Level 0 spans the whole region, so this stops at the latest there.
        let mut level = self.config.levels;
        while self.block_size(level) < needed {
            level -= 1;
        }

        Some(level)
    }

    /// Returns the occupancy map.
    #[inline]
    pub fn occupancy(&self) -> &OccupancyMap<'a> {
        &self.map
    }

    /// Returns `true` if no block is allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_clear()
    }

    /// Returns the offset from the base of the block represented by `node`.
    fn block_offset(&self, node: usize) -> usize {
        index::offset_in_level(node) * self.block_size(index::level(node))
    }

    /// Claims the leftmost free block on `level` and returns its node index.
    ///
    /// Levels deeper than [`levels`](Self::levels) are clamped to it. Returns
    /// `None`, leaving the allocator unchanged, if every block on the level
    /// is unavailable.
    pub fn acquire(&mut self, level: u32) -> Option<usize> {
        let level = cmp::min(level, self.config.levels);

        let first = index::first_index_of_level(level);
        let end = index::first_index_of_level(level + 1);

        let map = &self.map;
        let node = match (first..end).find(|&n| !map.get(n) && map.all_descendants_free(n)) {
            Some(n) => n,
            None => {
                debug!("no free block on level {level}");
                return None;
            }
        };

        // Every block inside the claimed one and every block containing it
        // becomes unavailable. Ancestors are thereby split implicitly.
        self.map.set_descendants(node, true);
        self.map.set_ancestors(node, true);

        trace!("acquired node {node} on level {level}:\n{}", self.map);

        Some(node)
    }

    /// Releases the block represented by `node`, coalescing it with its
    /// buddies as far up the tree as possible.
    ///
    /// # Errors
    ///
    /// - [`FreeError::InvalidNode`] if `node` is not in the tree.
    /// - [`FreeError::DoubleFree`] if the block is already free.
    ///
    /// The allocator is unchanged on error.
    ///
    /// # Safety
    ///
    /// If `node` is in the tree and unavailable, it must have been returned
    /// by [`acquire`](Self::acquire), or be the node of a block returned by
    /// [`allocate`](Self::allocate), and must not have been released since.
    ///
    /// The occupancy map cannot tell such a node apart from one that is
    /// unavailable only because it lies inside a live block or contains one.
    /// Releasing a node inside a live block marks part of that block free,
    /// so later allocations overlap it. Releasing a node that contains live
    /// blocks frees them as well.
    pub unsafe fn release(&mut self, node: usize) -> Result<(), FreeError> {
        if node >= self.map.num_nodes() {
            warn!("release of node {node} outside the block tree");
            return Err(FreeError::InvalidNode(node));
        }

        if !self.map.get(node) {
            warn!("double free of node {node}");
            return Err(FreeError::DoubleFree(node));
        }

        self.map.set_descendants(node, false);

        let mut current = node;
        while current != 0 {
            let buddy = index::buddy(current);
            if self.map.get(buddy) {
                break;
            }

            trace!(
                "merging buddies {current} and {buddy} on level {}",
                index::level(current)
            );

            current = index::parent(current);
            self.map.set(current, false);
        }

        trace!("released node {node}:\n{}", self.map);

        Ok(())
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] covering the usable part of the
    /// smallest block that fits `size` bytes plus the header. The returned
    /// memory is only guaranteed to be aligned to `align_of::<u32>()` relative
    /// to the region base. Zero-sized requests are served with a minimum
    /// block.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// - [`AllocError::TooLarge`] if the request cannot fit in the region.
    /// - [`AllocError::Exhausted`] if no block on the fitting level is free.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let level = self.level_for(size).ok_or_else(|| {
            debug!(
                "request of {size} bytes exceeds the {}-byte region",
                self.capacity
            );
            AllocError::TooLarge {
                size,
                capacity: self.capacity,
            }
        })?;

        let node = self.acquire(level).ok_or(AllocError::Exhausted { level })?;

        let block_size = self.block_size(level);
        let block_ofs = self.block_offset(node);
        // Trees have fewer than 2^MAX_LEVELS nodes, so every index fits a tag.
        let tag = node as Tag;

        // SAFETY: the block was just claimed, so nothing else is using it, and
        // it is at least `HEADER_SIZE` bytes long.
        unsafe { self.base.write_tag(block_ofs, tag) };

        debug!("allocated {size} bytes as node {node} (level {level}, {block_size}-byte block)");

        // The returned block inherits the provenance of the base pointer.
        Ok(self
            .base
            .with_offset_and_size(block_ofs + HEADER_SIZE, block_size - HEADER_SIZE))
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Errors
    ///
    /// - [`FreeError::NullPointer`] if `ptr` is null.
    /// - [`FreeError::InvalidPointer`] if `ptr` is not where this allocator
    ///   places blocks, or its header does not match its position.
    /// - [`FreeError::DoubleFree`] if the block is already free.
    ///
    /// The allocator is unchanged on error. Detection is best-effort: a
    /// pointer whose block was freed and then covered by a different
    /// allocation may be misreported or release that allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`allocate`](Self::allocate) on this allocator, and the block's header
    /// must not have been overwritten since.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            warn!("attempted to free a null pointer");
            return Err(FreeError::NullPointer);
        }

        let block_ofs = self
            .base
            .offset_of(ptr)
            .and_then(|ofs| ofs.checked_sub(HEADER_SIZE))
            .ok_or_else(|| {
                warn!("attempted to free {ptr:p}, which is outside the region");
                FreeError::InvalidPointer
            })?;

        // SAFETY: `block_ofs + HEADER_SIZE` is within the region, and the
        // caller guarantees the header was written by `allocate`.
        let node = unsafe { self.base.read_tag(block_ofs) } as usize;

        if node >= self.map.num_nodes() || self.block_offset(node) != block_ofs {
            warn!("attempted to free {ptr:p}, whose header names node {node}");
            return Err(FreeError::InvalidPointer);
        }

        debug!("freeing {ptr:p} (node {node})");

        // SAFETY: the header and its position agree, and the caller
        // guarantees `ptr` came from `allocate` and is still live.
        unsafe { self.release(node) }
    }
}

impl<A: BackingAllocator + fmt::Debug> fmt::Debug for BuddyAllocator<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("base", &self.base.ptr())
            .field("config", &self.config)
            .field("map", &self.map)
            .field("backing_allocator", &self.backing_allocator)
            .finish()
    }
}

/// Like a `BuddyAllocator`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this struct can be
/// moved out of, while `BuddyAllocator` itself cannot.
struct BuddyAllocatorParts<'a> {
    base: BasePtr,
    config: BuddyConfig,
    capacity: usize,
    map: OccupancyMap<'a>,
}

impl<'a> BuddyAllocatorParts<'a> {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> BuddyAllocator<'a, A> {
        let BuddyAllocatorParts {
            base,
            config,
            capacity,
            map,
        } = self;

        BuddyAllocator {
            base,
            config,
            capacity,
            map,
            backing_allocator,
        }
    }

    /// Validates `config` against the supplied buffers and initializes the
    /// occupancy map.
    ///
    /// # Safety
    ///
    /// See [`BuddyAllocator::try_new_raw`].
    unsafe fn new(
        config: BuddyConfig,
        metadata: NonNull<u8>,
        metadata_len: usize,
        region: NonNull<u8>,
        region_len: usize,
    ) -> Result<BuddyAllocatorParts<'a>, AllocInitError> {
        config.validate()?;

        let capacity = config.capacity().ok_or(AllocInitError::CapacityOverflow)?;
        if region_len < capacity {
            return Err(AllocInitError::RegionTooSmall {
                required: capacity,
                provided: region_len,
            });
        }

        let metadata_size = config.metadata_size();
        if metadata_len < metadata_size {
            return Err(AllocInitError::MetadataTooSmall {
                required: metadata_size,
                provided: metadata_len,
            });
        }

        // SAFETY: the caller guarantees `metadata` is valid and unaliased for
        // `metadata_len >= metadata_size` bytes.
        let map = unsafe { OccupancyMap::from_raw(config.num_nodes(), metadata) };
        let base = BasePtr::new(region, capacity);

        debug!(
            "buddy allocator at {:p}: {} levels, {}-byte minimum blocks, {} bytes managed, {} bytes of bitmap",
            region.as_ptr(),
            config.levels,
            config.min_block_size,
            capacity,
            metadata_size,
        );

        Ok(BuddyAllocatorParts {
            base,
            config,
            capacity,
            map,
        })
    }
}
