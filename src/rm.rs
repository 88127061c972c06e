//! A first-fit resource-map allocator over provider pages.
//!
//! Every owned page starts with a small header. The rest of each page is
//! carved into blocks on demand, and the free space of all pages is kept on a
//! single doubly linked free list in ascending address order. The nodes of the
//! list live in the free blocks themselves.
//!
//! Allocation takes the first free block large enough for the request,
//! splitting off the low end of it. Release reinserts the block in address
//! order, merging it with an address-adjacent neighbour on the same page.
//! After every release, idle pages are swept back to the provider, newest
//! page first.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(P)      | O(P + F)   |
//! | Release                  | O(P + F)  | O(P × F)   |
//!
//! Where:
//! - P is the number of pages owned by the allocator.
//! - F is the number of nodes on the free list.
//!
//! #### Fragmentation
//!
//! Blocks are rounded up to [`MIN_BLOCK_SIZE`] and to a multiple of
//! [`BLOCK_ALIGN`]. A split that would leave a remainder too small to hold a
//! free-list node hands out the whole node instead; that remainder is lost
//! until its page is reclaimed.

use core::{fmt, mem, num::NonZeroUsize, ptr::NonNull};

#[cfg(not(feature = "unstable"))]
use crate::polyfill::*;

use crate::{
    page::{page_base, BasePtr},
    AllocError, Page, PageProvider, Strategy, PAGE_SIZE,
};

/// The alignment of every block. Block sizes are multiples of this.
pub const BLOCK_ALIGN: usize = 8;

/// The size in bytes of the smallest block.
pub const MIN_BLOCK_SIZE: usize = round_up(mem::size_of::<FreeNode>());

const _: () = assert!(BLOCK_ALIGN >= mem::align_of::<FreeNode>());

const fn round_up(size: usize) -> usize {
    (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// Returns the number of bytes actually reserved for a request of `size`.
#[inline]
fn block_size(size: usize) -> usize {
    let size = round_up(size);

    if size < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        size
    }
}

/// The header at the base of every owned page.
#[repr(C)]
struct PageHeader<H> {
    handle: H,
    page: BasePtr,
    num_alloc: usize,
    /// The number of pages owned besides the primary. Primary only.
    extra_pages: usize,
    /// The head of the free list. Primary only.
    free_list: Option<NonZeroUsize>,
    /// The next page down the chain.
    ///
    /// The primary page heads the chain, followed by the extra pages, newest
    /// first.
    next: Option<NonNull<PageHeader<H>>>,
}

impl<H> PageHeader<H> {
    /// The space reserved for the header at the base of each page.
    const SIZE: usize = round_up(mem::size_of::<PageHeader<H>>());

    /// The number of bytes left for blocks in each page.
    const USABLE: usize = PAGE_SIZE - Self::SIZE;

    /// Emplaces a header in `page`.
    ///
    /// # Safety
    ///
    /// `page` must be a page acquired from a provider, not in use for anything
    /// else.
    unsafe fn init(page: Page<H>) -> NonNull<PageHeader<H>> {
        assert!(
            Self::SIZE + MIN_BLOCK_SIZE <= PAGE_SIZE,
            "page handle type is too large for a page header"
        );

        let header = page.ptr.cast::<PageHeader<H>>();

        unsafe {
            header.as_ptr().write(PageHeader {
                handle: page.handle,
                page: BasePtr::page(page.ptr),
                num_alloc: 0,
                extra_pages: 0,
                free_list: None,
                next: None,
            })
        };

        header
    }

    /// Returns the address of the first byte after the header.
    fn first_block(&self) -> NonZeroUsize {
        self.page.addr_at(Self::SIZE)
    }
}

/// A node of the free list, stored at the start of the free block it
/// describes.
#[repr(C)]
struct FreeNode {
    size: usize,
    prev: Option<NonZeroUsize>,
    next: Option<NonZeroUsize>,
    /// The base address of the owning page.
    page: NonZeroUsize,
}

/// A first-fit resource-map allocator.
///
/// For a discussion of the algorithm, see the [module-level documentation].
///
/// The allocator acquires its primary page lazily, on the first call to
/// [`allocate`], and returns it once every allocation has been released.
///
/// [module-level documentation]: crate::rm
/// [`allocate`]: ResourceMap::allocate
pub struct ResourceMap<P: PageProvider> {
    provider: P,
    primary: Option<NonNull<PageHeader<P::Handle>>>,
}

impl<P: PageProvider> ResourceMap<P> {
    /// Constructs a new, uninitialized `ResourceMap` drawing pages from
    /// `provider`.
    pub fn new(provider: P) -> ResourceMap<P> {
        ResourceMap {
            provider,
            primary: None,
        }
    }

    /// Returns the largest request this allocator accepts.
    ///
    /// This is the space left in a page after its header.
    pub fn max_request() -> usize {
        PageHeader::<P::Handle>::USABLE
    }

    /// Returns a reference to the page provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns `true` if the allocator currently owns any pages.
    pub fn is_initialized(&self) -> bool {
        self.primary.is_some()
    }

    /// Returns the number of pages owned by the allocator.
    pub fn pages_owned(&self) -> usize {
        self.primary
            .map_or(0, |primary| 1 + unsafe { primary.as_ref() }.extra_pages)
    }

    /// Returns the number of live allocations.
    pub fn live_allocations(&self) -> usize {
        let mut count = 0;
        let mut cur = self.primary;

        while let Some(header) = cur {
            let h = unsafe { header.as_ref() };
            count += h.num_alloc;
            cur = h.next;
        }

        count
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The block is aligned to [`BLOCK_ALIGN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocError::Oversized(size))` if `size` plus one pointer
    /// width exceeds [`PAGE_SIZE`] or `size` exceeds [`max_request`], and
    /// `Err(AllocError::OutOfPages)` if a page was needed and the provider had
    /// none.
    ///
    /// [`max_request`]: ResourceMap::max_request
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size
            .checked_add(mem::size_of::<usize>())
            .map_or(true, |total| total > PAGE_SIZE)
            || size > Self::max_request()
        {
            return Err(AllocError::Oversized(size));
        }

        let size = block_size(size);
        let primary = self.primary_or_init()?;

        let block = loop {
            if let Some(block) = unsafe { self.first_fit(primary, size) } {
                break block;
            }

            // A fresh page always fits a legal request.
            unsafe { self.grow(primary)? };
        };

        let header = self
            .header_of(block)
            .expect("allocated block outside of any owned page");

        let h = unsafe { &mut *header.as_ptr() };
        h.num_alloc += 1;

        Ok(h.page.with_addr(block))
    }

    /// Releases the block at `ptr`.
    ///
    /// The block is merged with any address-adjacent free space on its page.
    /// Idle pages are then returned to the provider, newest first, stopping at
    /// the first page still in use. Once the primary page is idle and no other
    /// page remains, the allocator becomes uninitialized.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.allocate(size)` with exactly the
    /// same `size`, and must not have been released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        let primary = self.primary.expect("release on an uninitialized allocator");
        let block = ptr.addr();

        let header = self
            .header_of(block)
            .expect("released block outside of any owned page");

        unsafe {
            self.insert(primary, block, block_size(size));
            (*header.as_ptr()).num_alloc -= 1;

            self.sweep(primary);
        }
    }

    /// Returns the primary page header, acquiring and initializing the primary
    /// page if necessary.
    fn primary_or_init(&mut self) -> Result<NonNull<PageHeader<P::Handle>>, AllocError> {
        if let Some(primary) = self.primary {
            return Ok(primary);
        }

        let page = self.provider.acquire_page()?;
        let primary = unsafe { PageHeader::init(page) };
        self.primary = Some(primary);

        log::trace!("rm: primary page at {:#x}", page.ptr.addr().get());

        unsafe {
            let first = primary.as_ref().first_block();
            self.insert(primary, first, PageHeader::<P::Handle>::USABLE);
        }

        Ok(primary)
    }

    /// Acquires an extra page and puts its free space on the free list.
    ///
    /// # Safety
    ///
    /// `primary` must be the primary page header.
    unsafe fn grow(&mut self, primary: NonNull<PageHeader<P::Handle>>) -> Result<(), AllocError> {
        let page = self.provider.acquire_page()?;
        let header = unsafe { PageHeader::init(page) };

        unsafe {
            let p = &mut *primary.as_ptr();
            (*header.as_ptr()).next = p.next;
            p.next = Some(header);
            p.extra_pages += 1;

            let first = header.as_ref().first_block();
            self.insert(primary, first, PageHeader::<P::Handle>::USABLE);
        }

        log::trace!("rm: extra page at {:#x}", page.ptr.addr().get());

        Ok(())
    }

    /// Returns every page still owned to the provider.
    fn release_all(&mut self) {
        let mut cur = self.primary.take();

        while let Some(header) = cur {
            let (handle, next) = {
                let h = unsafe { header.as_ref() };
                (h.handle, h.next)
            };

            unsafe { self.provider.release_page(handle) };

            cur = next;
        }

        log::debug!("rm: all pages released");
    }

    /// Returns the header of the owned page containing `addr`.
    fn header_of(&self, addr: NonZeroUsize) -> Option<NonNull<PageHeader<P::Handle>>> {
        let base = page_base(addr);
        let mut cur = self.primary;

        while let Some(header) = cur {
            let h = unsafe { header.as_ref() };

            if h.page.addr().get() == base {
                return Some(header);
            }

            cur = h.next;
        }

        None
    }

    /// Returns the base pointer of the owned page containing `addr`.
    fn page_of(&self, addr: NonZeroUsize) -> BasePtr {
        let header = self
            .header_of(addr)
            .expect("address outside of any owned page");

        unsafe { header.as_ref() }.page
    }

    /// Returns the free-list node at `addr`.
    ///
    /// # Safety
    ///
    /// A node must be stored at `addr`, and no other reference to it may be
    /// live for `'a`.
    unsafe fn node_mut<'a>(&self, addr: NonZeroUsize) -> &'a mut FreeNode {
        unsafe { self.page_of(addr).get_mut(addr) }
    }

    /// Points the link before the position of a node at `addr`.
    ///
    /// # Safety
    ///
    /// `primary` must be the primary page header, and `prev` must be a node on
    /// the list or `None` for the head.
    unsafe fn set_next_of(
        &self,
        primary: NonNull<PageHeader<P::Handle>>,
        prev: Option<NonZeroUsize>,
        addr: Option<NonZeroUsize>,
    ) {
        match prev {
            Some(p) => unsafe { self.node_mut(p) }.next = addr,
            None => unsafe { (*primary.as_ptr()).free_list = addr },
        }
    }

    /// Points the link after the position of a node at `addr`.
    ///
    /// # Safety
    ///
    /// `next` must be a node on the list or `None` for the tail.
    unsafe fn set_prev_of(&self, next: Option<NonZeroUsize>, addr: Option<NonZeroUsize>) {
        if let Some(n) = next {
            unsafe { self.node_mut(n) }.prev = addr;
        }
    }

    /// Unlinks the node at `addr` from the free list.
    ///
    /// Unlinking the only node leaves the list empty. The allocator stays
    /// initialized.
    ///
    /// # Safety
    ///
    /// `primary` must be the primary page header, and `addr` must be a node on
    /// the list.
    unsafe fn unlink(&mut self, primary: NonNull<PageHeader<P::Handle>>, addr: NonZeroUsize) {
        let (prev, next) = {
            let node = unsafe { self.node_mut(addr) };
            (node.prev, node.next)
        };

        unsafe {
            self.set_next_of(primary, prev, next);
            self.set_prev_of(next, prev);
        }
    }

    /// Removes the first block of at least `size` bytes from the free list.
    ///
    /// # Safety
    ///
    /// `primary` must be the primary page header, and `size` must be the
    /// result of `block_size`.
    unsafe fn first_fit(
        &mut self,
        primary: NonNull<PageHeader<P::Handle>>,
        size: usize,
    ) -> Option<NonZeroUsize> {
        let mut cur = unsafe { primary.as_ref() }.free_list;

        while let Some(addr) = cur {
            let (node_size, prev, next, page) = {
                let node = unsafe { self.node_mut(addr) };
                (node.size, node.prev, node.next, node.page)
            };

            if node_size < size {
                cur = next;
                continue;
            }

            if node_size - size < MIN_BLOCK_SIZE {
                // Too small to split. Hand out the whole node.
                unsafe { self.unlink(primary, addr) };
                return Some(addr);
            }

            // Keep the high end on the list, in the same position.
            let base = self.page_of(addr);
            let rest = base.addr_at(base.offset_to(addr) + size);

            unsafe {
                base.write_at(
                    rest,
                    FreeNode {
                        size: node_size - size,
                        prev,
                        next,
                        page,
                    },
                );

                self.set_next_of(primary, prev, Some(rest));
                self.set_prev_of(next, Some(rest));
            }

            return Some(addr);
        }

        None
    }

    /// Inserts the free block of `size` bytes at `addr` into the free list in
    /// address order, merging it with address-adjacent nodes on its page.
    ///
    /// # Safety
    ///
    /// `primary` must be the primary page header, and the `size` bytes at
    /// `addr` must be free space in an owned page, not on the list.
    unsafe fn insert(
        &mut self,
        primary: NonNull<PageHeader<P::Handle>>,
        addr: NonZeroUsize,
        size: usize,
    ) {
        let base = self.page_of(addr);
        let page = base.addr();

        // Find the neighbours in address order.
        let mut prev = None;
        let mut next = unsafe { primary.as_ref() }.free_list;

        while let Some(n) = next {
            if n > addr {
                break;
            }

            debug_assert_ne!(n, addr, "block is already free");

            prev = Some(n);
            next = unsafe { self.node_mut(n) }.next;
        }

        let joins_prev = prev.map_or(false, |p| {
            let node = unsafe { self.node_mut(p) };
            node.page == page && p.get() + node.size == addr.get()
        });

        let joins_next = next.map_or(false, |n| {
            let node = unsafe { self.node_mut(n) };
            node.page == page && addr.get() + size == n.get()
        });

        match (prev, next) {
            (Some(p), Some(n)) if joins_prev && joins_next => unsafe {
                let next_size = self.node_mut(n).size;
                self.unlink(primary, n);
                self.node_mut(p).size += size + next_size;
            },

            (Some(p), _) if joins_prev => unsafe {
                self.node_mut(p).size += size;
            },

            (_, Some(n)) if joins_next => unsafe {
                let (next_size, after) = {
                    let node = self.node_mut(n);
                    (node.size, node.next)
                };

                base.write_at(
                    addr,
                    FreeNode {
                        size: size + next_size,
                        prev,
                        next: after,
                        page,
                    },
                );

                self.set_next_of(primary, prev, Some(addr));
                self.set_prev_of(after, Some(addr));
            },

            _ => unsafe {
                base.write_at(
                    addr,
                    FreeNode {
                        size,
                        prev,
                        next,
                        page,
                    },
                );

                self.set_next_of(primary, prev, Some(addr));
                self.set_prev_of(next, Some(addr));
            },
        }
    }

    /// Unlinks every node belonging to the page based at `page`.
    ///
    /// # Safety
    ///
    /// `primary` must be the primary page header.
    unsafe fn strip(&mut self, primary: NonNull<PageHeader<P::Handle>>, page: NonZeroUsize) {
        let mut cur = unsafe { primary.as_ref() }.free_list;

        while let Some(addr) = cur {
            let (next, owner) = {
                let node = unsafe { self.node_mut(addr) };
                (node.next, node.page)
            };

            if owner == page {
                unsafe { self.unlink(primary, addr) };
            }

            cur = next;
        }
    }

    /// Returns idle pages to the provider, newest extra page first, stopping
    /// at the first page still in use.
    ///
    /// # Safety
    ///
    /// `primary` must be the primary page header.
    unsafe fn sweep(&mut self, primary: NonNull<PageHeader<P::Handle>>) {
        loop {
            let (top, primary_idle) = {
                let p = unsafe { primary.as_ref() };
                (p.next, p.num_alloc == 0)
            };

            let top = match top {
                Some(top) => top,
                None => {
                    if primary_idle {
                        self.release_all();
                    }

                    return;
                }
            };

            let (handle, page, below, idle) = {
                let t = unsafe { top.as_ref() };
                (t.handle, t.page.addr(), t.next, t.num_alloc == 0)
            };

            if !idle {
                return;
            }

            unsafe {
                self.strip(primary, page);

                let p = &mut *primary.as_ptr();
                p.next = below;
                p.extra_pages -= 1;

                self.provider.release_page(handle);
            }

            log::trace!("rm: reclaimed page {:#x}", page.get());
        }
    }
}

impl<P: PageProvider> Strategy for ResourceMap<P> {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        ResourceMap::allocate(self, size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { ResourceMap::release(self, ptr, size) }
    }
}

impl<P: PageProvider> fmt::Debug for ResourceMap<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMap")
            .field("pages_owned", &self.pages_owned())
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

impl<P: PageProvider> Drop for ResourceMap<P> {
    fn drop(&mut self) {
        self.release_all();
    }
}
