use core::{mem, num::NonZeroUsize, ptr::NonNull};

#[cfg(any(feature = "alloc", test))]
use core::alloc::Layout;

#[cfg(not(feature = "unstable"))]
use crate::polyfill::*;

use crate::AllocError;

#[cfg(any(feature = "alloc", test))]
use crate::{BackingAllocator, Sealed};

/// The size in bytes of a page.
///
/// Every page supplied by a [`PageProvider`] is this large and aligned to this
/// many bytes.
pub const PAGE_SIZE: usize = 8192;

const _: () = assert!(PAGE_SIZE.is_power_of_two());

// Layout of a single page.
#[cfg(any(feature = "alloc", test))]
const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(l) => l,
    Err(_) => panic!("invalid page layout"),
};

/// Returns the base address of the page containing `addr`.
#[inline]
pub fn page_base(addr: NonZeroUsize) -> usize {
    addr.get() & !(PAGE_SIZE - 1)
}

/// A page handed out by a [`PageProvider`].
#[derive(Copy, Clone, Debug)]
pub struct Page<H> {
    /// The opaque handle used to return the page to its provider.
    pub handle: H,
    /// A pointer to the base of the page.
    ///
    /// All accesses to the page are made through this pointer.
    pub ptr: NonNull<u8>,
}

/// Types which supply pages to an allocation strategy.
///
/// # Safety
///
/// Implementors must uphold the following invariants:
/// - Every page returned by [`acquire_page`] is [`PAGE_SIZE`] bytes long,
///   aligned to [`PAGE_SIZE`] bytes, and valid for reads and writes for its
///   whole length until its handle is passed to [`release_page`].
/// - No two outstanding pages overlap.
///
/// [`acquire_page`]: PageProvider::acquire_page
/// [`release_page`]: PageProvider::release_page
pub unsafe trait PageProvider {
    /// The opaque value identifying an acquired page.
    type Handle: Copy;

    /// Acquires a page.
    ///
    /// The contents of the page are unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfPages`] if no page is available.
    fn acquire_page(&mut self) -> Result<Page<Self::Handle>, AllocError>;

    /// Returns a page to the provider.
    ///
    /// # Safety
    ///
    /// `handle` must have been returned by [`acquire_page`] on this provider,
    /// and the page must not have been released since. No access to the page
    /// may be made after it is released.
    ///
    /// [`acquire_page`]: PageProvider::acquire_page
    unsafe fn release_page(&mut self, handle: Self::Handle);
}

/// The global memory allocator.
///
/// As a [`PageProvider`], every page is a separate page-aligned allocation
/// from the global allocator. As a [`BackingAllocator`], it owns the region of
/// a [`PagePool`](crate::PagePool).
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

// SAFETY: Each page is a fresh global allocation satisfying `PAGE_LAYOUT`,
// which is only deallocated by `release_page`.
#[cfg(any(feature = "alloc", test))]
unsafe impl PageProvider for Global {
    type Handle = NonNull<u8>;

    fn acquire_page(&mut self) -> Result<Page<NonNull<u8>>, AllocError> {
        // SAFETY: `PAGE_LAYOUT` has a nonzero size.
        let raw = unsafe { alloc::alloc::alloc(PAGE_LAYOUT) };
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfPages)?;

        log::trace!("global: acquired page {:#x}", ptr.addr().get());

        Ok(Page { handle: ptr, ptr })
    }

    unsafe fn release_page(&mut self, handle: NonNull<u8>) {
        log::trace!("global: released page {:#x}", handle.addr().get());

        unsafe { self.deallocate(handle, PAGE_LAYOUT) };
    }
}

/// A pointer to the base of a region of memory: a single page, or the whole
/// region managed by a page pool.
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
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Creates a `BasePtr` covering the page at `ptr`.
    #[inline]
    pub fn page(ptr: NonNull<u8>) -> BasePtr {
        debug_assert_eq!(ptr.addr().get() % PAGE_SIZE, 0, "page is not aligned");

        BasePtr::new(ptr, PAGE_SIZE)
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn limit(self) -> usize {
        self.ptr.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr.get() < self.limit()
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        debug_assert!(self.contains_addr(block));

        block.get() - self.ptr.addr().get()
    }

    /// Returns the address `offset` bytes past the base.
    #[inline]
    pub fn addr_at(self, offset: usize) -> NonZeroUsize {
        assert!(offset < self.extent, "offset out of region");

        // SAFETY: the base address is nonzero and `BasePtr::new` checked that
        // the region limit does not overflow.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.addr().get() + offset) }
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    /// Writes `value` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `T` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for writes for `size_of::<T>()` bytes.
    /// - The memory at `addr` must not be in use by anyone else.
    #[inline]
    pub unsafe fn write_at<T>(self, addr: NonZeroUsize, value: T) {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(addr.get() + mem::size_of::<T>() <= self.limit());
        debug_assert_eq!(addr.get() % mem::align_of::<T>(), 0);

        unsafe { self.with_addr(addr).cast::<T>().as_ptr().write(value) };
    }

    /// Returns a mutable reference to the `T` at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `T` values.
    /// - The memory at `addr` must contain a properly initialized `T` value.
    /// - The memory at `addr` must be within the provenance of `self`, and no
    ///   other reference to it may be live for `'a`.
    #[inline]
    pub unsafe fn get_mut<'a, T>(self, addr: NonZeroUsize) -> &'a mut T {
        debug_assert!(self.contains_addr(addr));
        debug_assert_eq!(addr.get() % mem::align_of::<T>(), 0);

        unsafe { self.with_addr(addr).cast::<T>().as_mut() }
    }
}

// Rather than using pointers, store only the addresses of the previous and
// next links.  This avoids accidentally violating stacked borrows; the
// links "point to" other blocks, but by forgoing actual pointers, no borrow
// is implied.
//
// NOTE: Using this method, any actual pointer to a block must be acquired
// via the base pointer of the page or region owning it, and NOT by casting
// these addresses directly!

/// A link in a linked list of blocks of memory.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// linked list.
#[repr(C)]
pub struct BlockLink {
    pub next: Option<NonZeroUsize>,
}

/// A double link in a linked list of blocks of memory.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// doubly linked list.
#[repr(C)]
#[derive(Debug)]
pub struct DoubleBlockLink {
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}
