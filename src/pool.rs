//! A fixed-capacity page provider.
//!
//! A [`PagePool`] divides a contiguous, page-aligned region into
//! [`PAGE_SIZE`]-byte pages and hands them out to a strategy. Free pages are
//! threaded on an intrusive singly linked list stored in the pages
//! themselves, so the pool needs no memory beyond its region.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Acquire                  | O(1)      | O(1)       |
//! | Release                  | O(1)      | O(1)       |
//!
//! Unlike the global-heap provider, a pool can be exhausted, which makes it
//! the provider of choice for exercising out-of-pages paths.

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

#[cfg(not(feature = "unstable"))]
use crate::polyfill::*;

use crate::{
    page::{BasePtr, BlockLink},
    AllocError, AllocInitError, BackingAllocator, Page, PageProvider, Raw, PAGE_SIZE,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// A fixed-capacity pool of pages carved from one region.
pub struct PagePool<A: BackingAllocator> {
    base: BasePtr,
    num_pages: usize,
    available: usize,
    free_list: Option<NonZeroUsize>,
    backing_allocator: A,
}

impl PagePool<Raw> {
    /// Constructs a new `PagePool` from a raw pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_pages` is zero, if `region` is not aligned to
    /// [`PAGE_SIZE`], or if the region would not fit between `region` and the
    /// end of the address space.
    ///
    /// # Safety
    ///
    /// `region` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`Self::region_layout(num_pages)`], and it must be valid
    /// for reads and writes for the entire size indicated by that `Layout`
    /// for as long as the pool exists.
    ///
    /// [`Self::region_layout(num_pages)`]: PagePool::region_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        num_pages: usize,
    ) -> Result<PagePool<Raw>, AllocInitError> {
        unsafe { RawPagePool::try_new(region, num_pages).map(|p| p.with_backing_allocator(Raw)) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl PagePool<Global> {
    /// Attempts to construct a new `PagePool` backed by the global allocator.
    ///
    /// In particular, the region managed by this pool is allocated from the
    /// global allocator according to the layout indicated by
    /// [`Self::region_layout(num_pages)`].
    ///
    /// # Errors
    ///
    /// Returns an error if `num_pages` is zero or too large, or if the region
    /// could not be allocated from the global allocator.
    ///
    /// [`Self::region_layout(num_pages)`]: PagePool::region_layout
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(num_pages: usize) -> Result<PagePool<Global>, AllocInitError> {
        let region_layout = Self::region_layout(num_pages)?;

        unsafe {
            // SAFETY: region size is not zero
            let region_raw = alloc::alloc::alloc(region_layout);
            let region_ptr =
                NonNull::new(region_raw).ok_or(AllocInitError::AllocFailed(region_layout))?;

            match RawPagePool::try_new(region_ptr, num_pages) {
                Ok(p) => Ok(p.with_backing_allocator(Global)),
                Err(e) => {
                    Global.deallocate(region_ptr, region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A> PagePool<A>
where
    A: BackingAllocator,
{
    /// Returns the layout requirements of the region managed by a `PagePool`
    /// of `num_pages` pages.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `num_pages` is zero or the
    /// total size of the region cannot be represented as a [`Layout`].
    pub fn region_layout(num_pages: usize) -> Result<Layout, AllocInitError> {
        if num_pages == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let total_size = PAGE_SIZE
            .checked_mul(num_pages)
            .ok_or(AllocInitError::InvalidConfig)?;

        Layout::from_size_align(total_size, PAGE_SIZE).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the total number of pages in the pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_pages
    }

    /// Returns the number of pages not currently handed out.
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }
}

// SAFETY: The pages are disjoint, page-aligned slices of the region, which
// stays valid until the pool is dropped. A page is only on the free list while
// it is not handed out.
unsafe impl<A> PageProvider for PagePool<A>
where
    A: BackingAllocator,
{
    type Handle = NonZeroUsize;

    fn acquire_page(&mut self) -> Result<Page<NonZeroUsize>, AllocError> {
        let old_head = self.free_list.take().ok_or(AllocError::OutOfPages)?;

        unsafe {
            let link_mut: &mut BlockLink = self.base.get_mut(old_head);
            self.free_list = link_mut.next.take();
        }

        self.available -= 1;

        log::trace!(
            "pool: acquired page {:#x} ({} left)",
            old_head.get(),
            self.available
        );

        Ok(Page {
            handle: old_head,
            ptr: self.base.with_addr(old_head),
        })
    }

    unsafe fn release_page(&mut self, handle: NonZeroUsize) {
        debug_assert!(self.base.contains_addr(handle));
        debug_assert_eq!(self.base.offset_to(handle) % PAGE_SIZE, 0);

        unsafe {
            self.base.write_at(
                handle,
                BlockLink {
                    next: self.free_list,
                },
            )
        };
        self.free_list = Some(handle);
        self.available += 1;

        log::trace!(
            "pool: released page {:#x} ({} left)",
            handle.get(),
            self.available
        );
    }
}

impl<A> fmt::Debug for PagePool<A>
where
    A: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("base", &self.base.ptr())
            .field("num_pages", &self.num_pages)
            .field("available", &self.available)
            .finish()
    }
}

impl<A> Drop for PagePool<A>
where
    A: BackingAllocator,
{
    fn drop(&mut self) {
        // Safe unwrap: this layout was checked when the pool was constructed.
        let region_layout = Self::region_layout(self.num_pages).unwrap();

        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), region_layout)
        }
    }
}

struct RawPagePool {
    base: BasePtr,
    num_pages: usize,
    free_list: Option<NonZeroUsize>,
}

impl RawPagePool {
    /// Attempts to construct a new `RawPagePool` from a raw pointer.
    ///
    /// # Safety
    ///
    /// `region` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`PagePool::region_layout(num_pages)`], and it must be
    /// valid for reads and writes for the entire size indicated by that
    /// `Layout`.
    unsafe fn try_new(
        region: NonNull<u8>,
        num_pages: usize,
    ) -> Result<RawPagePool, AllocInitError> {
        // Ensure the region size fits in a usize.
        let layout = PagePool::<Raw>::region_layout(num_pages)?;

        if region.addr().get() % PAGE_SIZE != 0 {
            return Err(AllocInitError::InvalidLocation);
        }

        // Ensure pointer calculations will not overflow.
        let region_end = region
            .addr()
            .get()
            .checked_add(layout.size())
            .ok_or(AllocInitError::InvalidLocation)?;

        let base = BasePtr::new(region, layout.size());

        // Initialize the free list by emplacing links in each page.
        for page_idx in 0..num_pages {
            let page_addr = base.addr_at(page_idx * PAGE_SIZE);

            let is_not_last = page_addr.get() < region_end - PAGE_SIZE;
            let next = is_not_last.then(|| base.addr_at((page_idx + 1) * PAGE_SIZE));

            unsafe { base.write_at(page_addr, BlockLink { next }) };
        }

        Ok(RawPagePool {
            base,
            num_pages,
            free_list: Some(base.addr()),
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> PagePool<A> {
        PagePool {
            base: self.base,
            num_pages: self.num_pages,
            available: self.num_pages,
            free_list: self.free_list,
            backing_allocator,
        }
    }
}
