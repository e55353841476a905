//! A small library for ~~hating on~~ evaluating the correctness of
//! size-based allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// Limit on generated request sizes, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 20;

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread evenly across powers of two below `2^20`, so that small
/// requests are as likely as large ones.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let exp = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1 << exp);

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate the given number of bytes.
    Alloc(usize),
    /// Free an outstanding block.
    ///
    /// Given `n` outstanding blocks, the block to free is at index `idx % n`.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;
    type FreeError;

    /// Allocates a block of at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::FreeError>;

    /// Returns `true` if the subject has no outstanding blocks.
    fn is_empty(&self) -> bool;
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// Returns `None` if the block is shorter than `size`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block`
    ///   until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, size: usize, id: u64) -> Option<Block> {
        if ptr.len() < size {
            return None;
        }

        let mut b = Block { ptr, id };
        b.paint(id);
        Some(b)
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        // SAFETY: every byte was initialized by `paint`.
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice
            .iter()
            .zip(id_bytes)
            .all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    /// Runs `ops` against the subject, then frees every outstanding block.
    ///
    /// Fails if a block comes back shorter than requested, if a block's
    /// contents change while it is outstanding, if the subject rejects a
    /// free, or if the subject is not empty afterwards. `failed_op` is `None`
    /// when the failure happened during the final cleanup.
    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            let ok = match op {
                AllocatorOp::Alloc(size) => match self.subject.allocate(size) {
                    Ok(ptr) => match unsafe { Block::init(ptr, size, op_id) } {
                        Some(block) => {
                            blocks.push(block);
                            true
                        }
                        None => false,
                    },
                    Err(_) => true,
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(mut block) => {
                        block.verify() && {
                            block.paint(op_id);
                            unsafe { self.subject.deallocate(block.ptr.cast()) }.is_ok()
                        }
                    }
                    None => true,
                },
            };

            if !ok {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                });
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() || unsafe { self.subject.deallocate(block.ptr.cast()) }.is_err() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }
        }

        if !self.subject.is_empty() {
            return Err(Failed {
                completed,
                failed_op: None,
            });
        }

        Ok(())
    }
}
