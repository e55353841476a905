use core::{
    mem,
    ptr::{self, NonNull},
};

use sptr::Strict;

use crate::Tag;

/// A pointer to the base of the region of memory managed by an allocator.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        Strict::addr(ptr.as_ptr())
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> usize {
        Strict::addr(self.ptr.as_ptr())
    }

    /// Returns the offset of `ptr` from the base, or `None` if `ptr` lies
    /// outside the region. One past the end counts as inside.
    ///
    /// Only the address of `ptr` is inspected; it need not share provenance
    /// with the base.
    #[inline]
    pub fn offset_of(self, ptr: *const u8) -> Option<usize> {
        let ofs = Strict::addr(ptr).checked_sub(self.addr())?;
        (ofs <= self.extent).then_some(ofs)
    }

    /// Creates a new pointer `offset` bytes past the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.extent);

        let raw = Strict::with_addr(self.ptr.as_ptr(), self.addr() + offset);

        // SAFETY: `new` checked that `addr + extent` does not wrap, and the
        // base address is nonzero.
        unsafe { NonNull::new_unchecked(raw) }
    }

    /// Creates a slice pointer of `len` bytes starting `offset` bytes past the
    /// base.
    #[inline]
    pub fn with_offset_and_size(self, offset: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(offset + len <= self.extent);

        let raw_slice = ptr::slice_from_raw_parts_mut(self.with_offset(offset).as_ptr(), len);

        // SAFETY: the data pointer is non-null.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Writes a block's recovery tag at `offset`.
    ///
    /// # Safety
    ///
    /// The memory at `offset` must be within the region, valid for writes for
    /// `size_of::<Tag>()` bytes and not in use by any allocation other than
    /// the block being tagged.
    #[inline]
    pub unsafe fn write_tag(self, offset: usize, tag: Tag) {
        debug_assert!(offset + mem::size_of::<Tag>() <= self.extent);

        unsafe {
            self.with_offset(offset)
                .cast::<Tag>()
                .as_ptr()
                .write_unaligned(tag)
        };
    }

    /// Reads the recovery tag stored at `offset`.
    ///
    /// # Safety
    ///
    /// The memory at `offset` must be within the region and valid for reads
    /// for `size_of::<Tag>()` bytes.
    #[inline]
    pub unsafe fn read_tag(self, offset: usize) -> Tag {
        debug_assert!(offset + mem::size_of::<Tag>() <= self.extent);

        unsafe { self.with_offset(offset).cast::<Tag>().as_ptr().read_unaligned() }
    }
}
