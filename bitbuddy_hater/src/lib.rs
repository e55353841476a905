#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use bitbuddy::{AllocInitError, BuddyAllocator, BuddyConfig, Global};

pub struct BuddySubject(BuddyAllocator<'static, Global>);

impl BuddySubject {
    pub fn new(config: BuddyConfig) -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new(config)?;
        Ok(BuddySubject(b))
    }

    pub fn allocator(&self) -> &BuddyAllocator<'static, Global> {
        &self.0
    }
}

impl Subject for BuddySubject {
    type AllocError = bitbuddy::AllocError;
    type FreeError = bitbuddy::FreeError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::FreeError> {
        unsafe { self.0.deallocate(ptr.as_ptr()) }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
