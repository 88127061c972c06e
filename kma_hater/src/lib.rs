#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use kma::{AllocError, AllocInitError, Buddy, Global, PagePool, PageProvider, ResourceMap};

pub struct BuddySubject<P: PageProvider>(Buddy<P>);

impl BuddySubject<Global> {
    /// Creates a subject drawing pages from the global allocator.
    pub fn new() -> Self {
        BuddySubject(Buddy::new(Global))
    }
}

impl BuddySubject<PagePool<Global>> {
    /// Creates a subject drawing pages from a pool of `num_pages` pages.
    pub fn with_pool(num_pages: usize) -> Result<Self, AllocInitError> {
        let pool = PagePool::try_new(num_pages)?;
        Ok(BuddySubject(Buddy::new(pool)))
    }
}

impl<P: PageProvider> Subject for BuddySubject<P> {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.0.release(ptr, size) };
    }

    fn is_idle(&self) -> bool {
        !self.0.is_initialized()
    }
}

pub struct ResourceMapSubject<P: PageProvider>(ResourceMap<P>);

impl ResourceMapSubject<Global> {
    /// Creates a subject drawing pages from the global allocator.
    pub fn new() -> Self {
        ResourceMapSubject(ResourceMap::new(Global))
    }
}

impl ResourceMapSubject<PagePool<Global>> {
    /// Creates a subject drawing pages from a pool of `num_pages` pages.
    pub fn with_pool(num_pages: usize) -> Result<Self, AllocInitError> {
        let pool = PagePool::try_new(num_pages)?;
        Ok(ResourceMapSubject(ResourceMap::new(pool)))
    }
}

impl<P: PageProvider> Subject for ResourceMapSubject<P> {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.0.release(ptr, size) };
    }

    fn is_idle(&self) -> bool {
        !self.0.is_initialized()
    }
}
