//! The occupancy map: one bit per node of the block tree.

use core::{cmp, fmt, marker::PhantomData, ptr::NonNull};

use crate::{bitmap::Bitmap, index};

/// A bitmap overlaid on a complete binary tree of blocks.
///
/// A set bit marks a node as *unavailable*: the node's block overlaps at least
/// one live allocation, either because the node (or one of its ancestors) was
/// allocated as a whole, or because one of its descendants was. A clear bit
/// means the whole block is free.
///
/// The map does not own its storage. It borrows a caller-supplied byte buffer
/// for the lifetime `'a`.
pub struct OccupancyMap<'a> {
    bits: Bitmap,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> OccupancyMap<'a> {
    /// Returns the number of bytes of storage needed for `num_nodes` nodes.
    #[inline]
    pub const fn storage_size(num_nodes: usize) -> usize {
        Bitmap::num_bytes(num_nodes)
    }

    /// Binds a map of `num_nodes` nodes to `buffer`, marking every node
    /// available.
    ///
    /// # Panics
    ///
    /// Panics if `num_nodes` is zero or if `buffer` is shorter than
    /// [`OccupancyMap::storage_size(num_nodes)`](OccupancyMap::storage_size).
    pub fn new(num_nodes: usize, buffer: &'a mut [u8]) -> OccupancyMap<'a> {
        assert!(
            buffer.len() >= Self::storage_size(num_nodes),
            "occupancy map buffer too small: {} bytes for {} nodes",
            buffer.len(),
            num_nodes,
        );

        let map = NonNull::from(buffer).cast::<u8>();

        // SAFETY: `buffer` is exclusively borrowed for `'a` and long enough.
        unsafe { Self::from_raw(num_nodes, map) }
    }

    /// Binds a map of `num_nodes` nodes to the memory at `map`.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes for
    /// `storage_size(num_nodes)` bytes for `'a`, and must not be accessed
    /// through any other pointer during that time.
    pub(crate) unsafe fn from_raw(num_nodes: usize, map: NonNull<u8>) -> OccupancyMap<'a> {
        OccupancyMap {
            bits: unsafe { Bitmap::new(num_nodes, map) },
            _buffer: PhantomData,
        }
    }

    /// Returns the number of nodes tracked by the map.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.bits.num_bits()
    }

    /// Returns the deepest level that has at least one node in the map.
    #[inline]
    pub fn levels(&self) -> u32 {
        index::level(self.num_nodes() - 1)
    }

    pub(crate) fn storage(&self) -> NonNull<u8> {
        self.bits.as_ptr()
    }

    /// Returns `true` if node `idx` is unavailable.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not a node of this map.
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        self.bits.get(idx)
    }

    /// Marks node `idx` unavailable (`true`) or available (`false`).
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not a node of this map.
    #[inline]
    pub fn set(&mut self, idx: usize, value: bool) {
        self.bits.set(idx, value);
    }

    /// Sets `idx` and every one of its descendants to `value`.
    pub fn set_descendants(&mut self, idx: usize, value: bool) {
        let last_node = self.num_nodes() - 1;

        // At each depth below `idx`, its descendants form one contiguous run
        // of indices.
        let (mut first, mut last) = (idx, idx);
        while first <= last_node {
            for node in first..=cmp::min(last, last_node) {
                self.bits.set(node, value);
            }

            first = index::left_child(first);
            last = index::right_child(last);
        }
    }

    /// Sets `idx` and every one of its ancestors, up to and including the
    /// root, to `value`.
    pub fn set_ancestors(&mut self, mut idx: usize, value: bool) {
        loop {
            self.bits.set(idx, value);

            if idx == 0 {
                break;
            }
            idx = index::parent(idx);
        }
    }

    /// Returns `true` if every strict descendant of `idx` is available.
    ///
    /// Nodes on the deepest level have no descendants, so this is trivially
    /// `true` for them.
    pub fn all_descendants_free(&self, idx: usize) -> bool {
        let last_node = self.num_nodes() - 1;

        let (mut first, mut last) = (index::left_child(idx), index::right_child(idx));
        while first <= last_node {
            if (first..=cmp::min(last, last_node)).any(|node| self.bits.get(node)) {
                return false;
            }

            first = index::left_child(first);
            last = index::right_child(last);
        }

        true
    }

    /// Returns `true` if every node is available.
    pub fn is_clear(&self) -> bool {
        self.bits.is_clear()
    }
}

impl fmt::Debug for OccupancyMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OccupancyMap")
            .field("num_nodes", &self.num_nodes())
            .finish_non_exhaustive()
    }
}

/// Renders the map one level per line, root first, `1` for unavailable nodes.
impl fmt::Display for OccupancyMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let num_nodes = self.num_nodes();

        for level in 0..=self.levels() {
            if level > 0 {
                f.write_str("\n")?;
            }

            let first = index::first_index_of_level(level);
            let end = cmp::min(index::first_index_of_level(level + 1), num_nodes);
            for node in first..end {
                if node > first {
                    f.write_str(" ")?;
                }
                f.write_str(if self.get(node) { "1" } else { "0" })?;
            }
        }

        Ok(())
    }
}
