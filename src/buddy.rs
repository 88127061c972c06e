//! A binary-buddy allocator over provider pages.
//!
//! Blocks come in ten power-of-two size classes, from [`MIN_BLOCK_SIZE`] bytes
//! up to a whole page:
//!
//! | Class | Block size | Class | Block size |
//! |-------|------------|-------|------------|
//! | 0     | 16         | 5     | 512        |
//! | 1     | 32         | 6     | 1024       |
//! | 2     | 64         | 7     | 2048       |
//! | 3     | 128        | 8     | 4096       |
//! | 4     | 256        | 9     | 8192       |
//!
//! Each class has its own free list, threaded through the free blocks. Every
//! data page has a metadata entry holding a bitmap with one bit per 16 bytes
//! of the page, set while the covered bytes are allocated. A freed block is
//! merged with its buddy for as long as the buddy's whole range is clear in
//! the bitmap; once a page holds no allocations it is coalesced back into a
//! single block and returned to the provider.
//!
//! Page metadata is stored in *roots*: pages acquired from the provider
//! purely for bookkeeping. The primary root also holds the free lists and the
//! allocator-wide counters. When its metadata slots run out, further roots
//! are chained behind it.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case           |
//! |--------------------------|-----------|----------------------|
//! | Allocate                 | O(P)      | O(P × C)             |
//! | Release                  | O(P)      | O(P × C)             |
//!
//! Where:
//! - P is the number of data pages owned by the allocator.
//! - C is the number of size classes.
//!
//! Finding the metadata of the page owning an address is a linear scan of the
//! metadata slots.
//!
//! #### Fragmentation
//!
//! Requests are rounded up to a power of two, so internal fragmentation is up
//! to half of each block. External fragmentation is limited to blocks whose
//! buddies are still allocated.

use core::{cmp, fmt, mem, num::NonZeroUsize, ptr::NonNull, slice};

#[cfg(not(feature = "unstable"))]
use crate::polyfill::*;

use crate::{
    bitmap::{Bitmap, UNIT},
    page::{page_base, BasePtr, DoubleBlockLink},
    AllocError, Page, PageProvider, Strategy, PAGE_SIZE,
};

/// The size in bytes of the smallest block.
pub const MIN_BLOCK_SIZE: usize = 16;

/// The number of size classes.
pub const NUM_CLASSES: usize = 10;

// The class of whole-page blocks.
const TOP: usize = NUM_CLASSES - 1;

const _: () = assert!(MIN_BLOCK_SIZE << TOP == PAGE_SIZE);
const _: () = assert!(MIN_BLOCK_SIZE == UNIT);
const _: () = assert!(mem::size_of::<DoubleBlockLink>() <= MIN_BLOCK_SIZE);

/// Returns the size in bytes of the blocks in `class`.
#[inline]
pub const fn class_size(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

/// Returns the smallest class whose blocks can hold `size` bytes.
///
/// Returns `None` if `size` exceeds a page.
#[inline]
pub fn class_for(size: usize) -> Option<usize> {
    if size > PAGE_SIZE {
        return None;
    }

    let rounded = cmp::max(size, MIN_BLOCK_SIZE).next_power_of_two();

    Some((rounded.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize)
}

/// Metadata for one data page.
#[repr(C)]
struct PageMeta<H> {
    handle: H,
    page: BasePtr,
    bitmap: Bitmap,
    num_alloc: usize,
}

type Slot<H> = Option<PageMeta<H>>;

/// The header of a metadata page.
///
/// The header is followed in the same page by as many metadata slots as fit.
#[repr(C)]
struct Root<H> {
    /// The handle of the page holding this root.
    this: H,
    /// The number of occupied slots in this root.
    used_slots: usize,
    /// The number of data pages owned by the allocator. Primary root only.
    total_pages: usize,
    /// The number of live allocations. Primary root only.
    num_alloc: usize,
    /// Free list heads, one per size class. Primary root only.
    free_lists: [Option<NonZeroUsize>; NUM_CLASSES],
    next: Option<NonNull<Root<H>>>,
}

impl<H: Copy> Root<H> {
    /// Returns the offset of the first metadata slot from the root.
    fn slots_offset() -> usize {
        let align = mem::align_of::<Slot<H>>();
        (mem::size_of::<Root<H>>() + align - 1) & !(align - 1)
    }

    /// Returns the number of metadata slots per root.
    fn capacity() -> usize {
        (PAGE_SIZE - Self::slots_offset()) / mem::size_of::<Slot<H>>()
    }

    /// Emplaces an empty root in `page`.
    ///
    /// # Safety
    ///
    /// `page` must be a page acquired from a provider, not in use for anything
    /// else.
    unsafe fn init(page: Page<H>) -> NonNull<Root<H>> {
        assert!(
            Self::slots_offset() < PAGE_SIZE && Self::capacity() > 0,
            "page handle type is too large for page metadata"
        );

        let root = page.ptr.cast::<Root<H>>();

        unsafe {
            root.as_ptr().write(Root {
                this: page.handle,
                used_slots: 0,
                total_pages: 0,
                num_alloc: 0,
                free_lists: [None; NUM_CLASSES],
                next: None,
            });

            let slots = Self::slots_ptr(root);
            for i in 0..Self::capacity() {
                slots.add(i).write(None);
            }
        }

        root
    }

    /// # Safety
    ///
    /// `root` must point to a root initialized by `Root::init`.
    unsafe fn slots_ptr(root: NonNull<Root<H>>) -> *mut Slot<H> {
        unsafe {
            root.as_ptr()
                .cast::<u8>()
                .add(Self::slots_offset())
                .cast::<Slot<H>>()
        }
    }

    /// Returns the metadata slots of `root`.
    ///
    /// # Safety
    ///
    /// `root` must point to a root initialized by `Root::init`, and no other
    /// reference to its slots may be live for `'a`.
    unsafe fn slots<'a>(root: NonNull<Root<H>>) -> &'a mut [Slot<H>] {
        unsafe { slice::from_raw_parts_mut(Self::slots_ptr(root), Self::capacity()) }
    }
}

/// The location of a page's metadata.
#[derive(Copy, Clone)]
struct SlotRef<H> {
    root: NonNull<Root<H>>,
    index: usize,
}

impl<H: Copy> SlotRef<H> {
    /// # Safety
    ///
    /// The slot must be occupied, and no other reference to it may be live for
    /// `'a`.
    unsafe fn meta<'a>(self) -> &'a mut PageMeta<H> {
        unsafe { Root::slots(self.root)[self.index].as_mut() }.expect("metadata slot is vacant")
    }
}

/// A binary-buddy allocator.
///
/// For a discussion of buddy allocation, see the [module-level
/// documentation].
///
/// The allocator acquires its first page lazily, on the first call to
/// [`allocate`], and returns its last page once every allocation has been
/// released.
///
/// [module-level documentation]: crate::buddy
/// [`allocate`]: Buddy::allocate
pub struct Buddy<P: PageProvider> {
    provider: P,
    root: Option<NonNull<Root<P::Handle>>>,
}

impl<P: PageProvider> Buddy<P> {
    /// Constructs a new, uninitialized `Buddy` drawing pages from `provider`.
    pub fn new(provider: P) -> Buddy<P> {
        Buddy {
            provider,
            root: None,
        }
    }

    /// Returns a reference to the page provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns `true` if the allocator currently owns any pages.
    pub fn is_initialized(&self) -> bool {
        self.root.is_some()
    }

    /// Returns the number of data pages owned by the allocator.
    ///
    /// Pages holding page metadata are not counted.
    pub fn pages_owned(&self) -> usize {
        self.root
            .map_or(0, |root| unsafe { root.as_ref() }.total_pages)
    }

    /// Returns the number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.root.map_or(0, |root| unsafe { root.as_ref() }.num_alloc)
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The block is the smallest size class that holds `size` bytes, and is
    /// aligned to that class size.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocError::Oversized(size))` if `size` plus one pointer
    /// width exceeds [`PAGE_SIZE`], and `Err(AllocError::OutOfPages)` if a
    /// page was needed and the provider had none.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size
            .checked_add(mem::size_of::<usize>())
            .map_or(true, |total| total > PAGE_SIZE)
        {
            return Err(AllocError::Oversized(size));
        }

        let class = class_for(size).ok_or(AllocError::Oversized(size))?;
        let root = self.root_or_init()?;

        let from = (class..NUM_CLASSES).find(|&c| unsafe { root.as_ref() }.free_lists[c].is_some());

        let from = match from {
            Some(c) => c,
            None => {
                if let Err(e) = unsafe { self.claim_page(root) } {
                    self.release_if_idle(root);
                    return Err(e);
                }

                TOP
            }
        };

        let block = unsafe { self.split(root, from, class) };

        let slot = self
            .find_page(block)
            .expect("allocated block outside of any owned page");

        let meta = unsafe { slot.meta() };
        meta.bitmap
            .set_range(meta.page.offset_to(block), class_size(class), true);
        meta.num_alloc += 1;

        unsafe { (*root.as_ptr()).num_alloc += 1 };

        Ok(meta.page.with_addr(block))
    }

    /// Releases the block at `ptr`.
    ///
    /// The block is merged with its buddy for as long as the buddy is
    /// entirely free. If this was the last allocation on its page, the page is
    /// returned to the provider; if it was the last page, the allocator
    /// returns its metadata pages too and becomes uninitialized.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.allocate(size)` with exactly the
    /// same `size`, and must not have been released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        let root = self.root.expect("release on an uninitialized allocator");
        let class = class_for(size).expect("release size exceeds a page");
        let block = ptr.addr();

        let slot = self
            .find_page(block)
            .expect("released block outside of any owned page");

        let remaining = {
            let meta = unsafe { slot.meta() };
            let ofs = meta.page.offset_to(block);
            debug_assert_eq!(ofs % class_size(class), 0, "block is misaligned for its class");

            meta.bitmap.set_range(ofs, class_size(class), false);
            meta.num_alloc -= 1;
            meta.num_alloc
        };

        unsafe {
            (*root.as_ptr()).num_alloc -= 1;
            self.push(root, class, block);
        }

        let (merged, merged_class) = unsafe { self.coalesce(root, slot, block, class) };

        if remaining == 0 {
            debug_assert!(unsafe { slot.meta() }.bitmap.is_clear());
            debug_assert_eq!(merged_class, TOP, "idle page did not coalesce");
            debug_assert_eq!(merged, unsafe { slot.meta() }.page.addr());

            unsafe { self.reclaim(root, slot) };
        }
    }

    /// Returns the primary root, acquiring and initializing it if necessary.
    fn root_or_init(&mut self) -> Result<NonNull<Root<P::Handle>>, AllocError> {
        if let Some(root) = self.root {
            return Ok(root);
        }

        let page = self.provider.acquire_page()?;
        let root = unsafe { Root::init(page) };

        log::trace!("buddy: primary root at {:#x}", page.ptr.addr().get());

        self.root = Some(root);
        Ok(root)
    }

    /// Releases every page if no data page is owned.
    fn release_if_idle(&mut self, root: NonNull<Root<P::Handle>>) {
        if unsafe { root.as_ref() }.total_pages == 0 {
            self.release_all();
        }
    }

    /// Returns every page still owned to the provider.
    fn release_all(&mut self) {
        let mut cur = self.root.take();

        while let Some(root) = cur {
            let (this, next) = {
                let r = unsafe { root.as_ref() };
                (r.this, r.next)
            };

            for slot in unsafe { Root::slots(root) }.iter_mut() {
                if let Some(meta) = slot.take() {
                    unsafe { self.provider.release_page(meta.handle) };
                }
            }

            unsafe { self.provider.release_page(this) };

            cur = next;
        }

        log::debug!("buddy: all pages released");
    }

    /// Returns the location of the metadata for the page containing `addr`.
    fn find_page(&self, addr: NonZeroUsize) -> Option<SlotRef<P::Handle>> {
        let base = page_base(addr);
        let mut cur = self.root;

        while let Some(root) = cur {
            let slots = unsafe { Root::slots(root) };

            let found = slots
                .iter()
                .position(|s| s.as_ref().map_or(false, |m| m.page.addr().get() == base));

            if let Some(index) = found {
                return Some(SlotRef { root, index });
            }

            cur = unsafe { root.as_ref() }.next;
        }

        None
    }

    /// Returns the location of the first vacant metadata slot.
    fn vacant_slot(&self) -> Option<SlotRef<P::Handle>> {
        let mut cur = self.root;

        while let Some(root) = cur {
            if let Some(index) = unsafe { Root::slots(root) }.iter().position(Option::is_none) {
                return Some(SlotRef { root, index });
            }

            cur = unsafe { root.as_ref() }.next;
        }

        None
    }

    /// Acquires a new root and chains it after the last one.
    ///
    /// Returns the location of its first slot.
    fn grow_roots(&mut self) -> Result<SlotRef<P::Handle>, AllocError> {
        let mut last = self.root.expect("grow_roots on an uninitialized allocator");
        while let Some(next) = unsafe { last.as_ref() }.next {
            last = next;
        }

        let page = self.provider.acquire_page()?;
        let root = unsafe { Root::init(page) };
        unsafe { (*last.as_ptr()).next = Some(root) };

        log::trace!("buddy: overflow root at {:#x}", page.ptr.addr().get());

        Ok(SlotRef { root, index: 0 })
    }

    /// Acquires a data page and puts its single whole-page block on the top
    /// free list.
    ///
    /// # Safety
    ///
    /// `root` must be the primary root.
    unsafe fn claim_page(&mut self, root: NonNull<Root<P::Handle>>) -> Result<(), AllocError> {
        let page = self.provider.acquire_page()?;

        let slot = match self.vacant_slot() {
            Some(s) => s,
            None => match self.grow_roots() {
                Ok(s) => s,
                Err(e) => {
                    unsafe { self.provider.release_page(page.handle) };
                    return Err(e);
                }
            },
        };

        let base = BasePtr::page(page.ptr);

        unsafe {
            Root::slots(slot.root)[slot.index] = Some(PageMeta {
                handle: page.handle,
                page: base,
                bitmap: Bitmap::new(),
                num_alloc: 0,
            });

            (*slot.root.as_ptr()).used_slots += 1;
            (*root.as_ptr()).total_pages += 1;

            self.push(root, TOP, base.addr());
        }

        log::trace!("buddy: claimed page {:#x}", base.addr().get());

        Ok(())
    }

    /// Returns an idle page to the provider and clears its metadata.
    ///
    /// Drops the root holding the metadata if it was an overflow root whose
    /// last slot this was, and the whole allocator if this was the last page.
    ///
    /// # Safety
    ///
    /// `root` must be the primary root. The page must hold no allocations and
    /// must have coalesced into a single block on the top free list.
    unsafe fn reclaim(&mut self, root: NonNull<Root<P::Handle>>, slot: SlotRef<P::Handle>) {
        let page_addr = unsafe { slot.meta() }.page.addr();
        unsafe { self.remove(root, TOP, page_addr) };

        let meta = unsafe { Root::slots(slot.root)[slot.index].take() }
            .expect("metadata slot is vacant");

        unsafe { self.provider.release_page(meta.handle) };

        log::trace!("buddy: reclaimed page {:#x}", page_addr.get());

        let (used_slots, total_pages) = unsafe {
            (*slot.root.as_ptr()).used_slots -= 1;
            (*root.as_ptr()).total_pages -= 1;
            ((*slot.root.as_ptr()).used_slots, (*root.as_ptr()).total_pages)
        };

        if slot.root != root && used_slots == 0 {
            unsafe { self.unlink_root(root, slot.root) };
        }

        if total_pages == 0 {
            self.release_all();
        }
    }

    /// Unlinks an empty overflow root from the chain and releases its page.
    ///
    /// # Safety
    ///
    /// `target` must be an overflow root chained behind `root`.
    unsafe fn unlink_root(
        &mut self,
        root: NonNull<Root<P::Handle>>,
        target: NonNull<Root<P::Handle>>,
    ) {
        let mut prev = root;
        loop {
            let next = unsafe { prev.as_ref() }
                .next
                .expect("overflow root missing from chain");

            if next == target {
                break;
            }

            prev = next;
        }

        let (this, next) = {
            let t = unsafe { target.as_ref() };
            (t.this, t.next)
        };

        unsafe {
            (*prev.as_ptr()).next = next;
            self.provider.release_page(this);
        }

        log::trace!("buddy: released overflow root");
    }

    /// Returns the link embedded in the free block at `block`.
    ///
    /// # Safety
    ///
    /// `block` must be the address of a free block in an owned page, and no
    /// other reference to its link may be live for `'a`.
    unsafe fn link_mut<'a>(&self, block: NonZeroUsize) -> &'a mut DoubleBlockLink {
        let slot = self
            .find_page(block)
            .expect("free block outside of any owned page");
        let page = unsafe { slot.meta() }.page;

        unsafe { page.get_mut(block) }
    }

    /// Pushes a block onto the free list of `class`.
    ///
    /// # Safety
    ///
    /// `root` must be the primary root, and `block` must be a free block of
    /// `class` in an owned page, not on any free list.
    unsafe fn push(&mut self, root: NonNull<Root<P::Handle>>, class: usize, block: NonZeroUsize) {
        let old_head = unsafe { root.as_ref() }.free_lists[class];

        if let Some(old) = old_head {
            unsafe { self.link_mut(old) }.prev = Some(block);
        }

        let slot = self
            .find_page(block)
            .expect("free block outside of any owned page");
        let page = unsafe { slot.meta() }.page;

        unsafe {
            page.write_at(
                block,
                DoubleBlockLink {
                    prev: None,
                    next: old_head,
                },
            );

            (*root.as_ptr()).free_lists[class] = Some(block);
        }
    }

    /// Removes a block from the free list of `class`.
    ///
    /// # Safety
    ///
    /// `root` must be the primary root, and `block` must be on the free list
    /// of `class`.
    unsafe fn remove(&mut self, root: NonNull<Root<P::Handle>>, class: usize, block: NonZeroUsize) {
        let (prev, next) = {
            let link = unsafe { self.link_mut(block) };
            (link.prev, link.next)
        };

        match prev {
            // Link `prev` forward to `next`.
            Some(p) => unsafe { self.link_mut(p) }.next = next,

            // If there's no previous block, then `block` is the head of the
            // free list.
            None => unsafe { (*root.as_ptr()).free_lists[class] = next },
        }

        if let Some(n) = next {
            // Link `next` back to `prev`.
            unsafe { self.link_mut(n) }.prev = prev;
        }
    }

    /// Pops the head of the free list of `class`.
    ///
    /// # Safety
    ///
    /// `root` must be the primary root.
    unsafe fn pop(&mut self, root: NonNull<Root<P::Handle>>, class: usize) -> Option<NonZeroUsize> {
        let head = unsafe { root.as_ref() }.free_lists[class]?;
        unsafe { self.remove(root, class, head) };

        Some(head)
    }

    /// Splits the head block of class `from` down to class `class`, then pops
    /// the resulting block.
    ///
    /// Each split returns both halves to the next class down, the low half
    /// last, so the low half is the one split or popped next.
    ///
    /// # Safety
    ///
    /// `root` must be the primary root, and the free list of `from` must not be
    /// empty.
    unsafe fn split(
        &mut self,
        root: NonNull<Root<P::Handle>>,
        from: usize,
        class: usize,
    ) -> NonZeroUsize {
        for c in ((class + 1)..=from).rev() {
            let block = unsafe { self.pop(root, c) }.expect("split from an empty free list");

            // The address of the low half does not change.
            let high = block
                .checked_add(class_size(c - 1))
                .expect("block address overflows usize");

            unsafe {
                self.push(root, c - 1, high);
                self.push(root, c - 1, block);
            }
        }

        unsafe { self.pop(root, class) }.expect("split from an empty free list")
    }

    /// Merges the free block at `block` with its buddy for as long as the
    /// buddy is entirely free, stopping at whole-page blocks.
    ///
    /// Returns the address and class of the resulting block.
    ///
    /// # Safety
    ///
    /// `root` must be the primary root, and `block` must be on the free list of
    /// `class` in the page described by `slot`.
    unsafe fn coalesce(
        &mut self,
        root: NonNull<Root<P::Handle>>,
        slot: SlotRef<P::Handle>,
        mut block: NonZeroUsize,
        mut class: usize,
    ) -> (NonZeroUsize, usize) {
        let page = unsafe { slot.meta() }.page;

        while class < TOP {
            let size = class_size(class);
            let ofs = page.offset_to(block);
            let buddy_ofs = ofs ^ size;

            if !unsafe { slot.meta() }.bitmap.is_range_clear(buddy_ofs, size) {
                break;
            }

            unsafe {
                self.remove(root, class, page.addr_at(buddy_ofs));
                self.remove(root, class, block);
            }

            block = page.addr_at(ofs & !size);
            class += 1;

            unsafe { self.push(root, class, block) };
        }

        (block, class)
    }
}

impl<P: PageProvider> Strategy for Buddy<P> {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        Buddy::allocate(self, size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { Buddy::release(self, ptr, size) }
    }
}

impl<P: PageProvider> fmt::Debug for Buddy<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("pages_owned", &self.pages_owned())
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

impl<P: PageProvider> Drop for Buddy<P> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{prelude::rust_2021::*, vec};

    use super::*;
    use crate::{Global, PagePool};

    type PoolBuddy = Buddy<PagePool<Global>>;

    fn pool_buddy(num_pages: usize) -> PoolBuddy {
        Buddy::new(PagePool::try_new(num_pages).unwrap())
    }

    impl<P: PageProvider> Buddy<P> {
        /// Returns the addresses on the free list of `class`, in list order.
        fn free_blocks(&self, class: usize) -> Vec<usize> {
            let mut blocks = Vec::new();

            let mut cur = self
                .root
                .and_then(|root| unsafe { root.as_ref() }.free_lists[class]);

            while let Some(block) = cur {
                blocks.push(block.get());
                cur = unsafe { self.link_mut(block) }.next;
            }

            blocks
        }

        /// Returns the sorted contents of every free list.
        fn shape(&self) -> Vec<Vec<usize>> {
            (0..NUM_CLASSES)
                .map(|class| {
                    let mut blocks = self.free_blocks(class);
                    blocks.sort();
                    blocks
                })
                .collect()
        }
    }

    #[test]
    fn class_rounding() {
        assert_eq!(class_for(0), Some(0));
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(100), Some(3));
        assert_eq!(class_for(4000), Some(8));
        assert_eq!(class_for(4097), Some(9));
        assert_eq!(class_for(PAGE_SIZE), Some(TOP));
        assert_eq!(class_for(PAGE_SIZE + 1), None);

        for class in 0..NUM_CLASSES {
            assert_eq!(class_for(class_size(class)), Some(class));
        }
    }

    #[test]
    fn roots_have_capacity() {
        assert!(Root::<NonZeroUsize>::capacity() > 0);
        assert!(Root::<NonNull<u8>>::capacity() > 0);
        assert!(
            Root::<NonZeroUsize>::slots_offset()
                + Root::<NonZeroUsize>::capacity() * mem::size_of::<Slot<NonZeroUsize>>()
                <= PAGE_SIZE
        );
    }

    #[test]
    fn oversized_request_changes_nothing() {
        let mut buddy = pool_buddy(4);

        let limit = PAGE_SIZE - mem::size_of::<usize>();
        assert_eq!(
            buddy.allocate(limit + 1),
            Err(AllocError::Oversized(limit + 1))
        );
        assert_eq!(
            buddy.allocate(usize::MAX),
            Err(AllocError::Oversized(usize::MAX))
        );

        assert!(!buddy.is_initialized());
        assert_eq!(buddy.provider().available(), 4);

        // The largest legal request takes a whole page.
        let block = buddy.allocate(limit).unwrap();
        assert_eq!(buddy.pages_owned(), 1);
        unsafe { buddy.release(block, limit) };
        assert_eq!(buddy.provider().available(), 4);
    }

    #[test]
    fn splits_first_page_and_coalesces_back() {
        let mut buddy = pool_buddy(4);

        let a = buddy.allocate(100).unwrap();
        assert_eq!(a.addr().get() % PAGE_SIZE, 0, "first block is the page base");
        assert_eq!(buddy.pages_owned(), 1);
        // One root page and one data page.
        assert_eq!(buddy.provider().available(), 2);

        let b = buddy.allocate(100).unwrap();
        assert_eq!(b.addr().get(), a.addr().get() + 128);
        assert_eq!(buddy.live_allocations(), 2);

        let base = a.addr().get();
        for class in 3..TOP {
            if class == 3 {
                assert!(buddy.free_blocks(class).is_empty());
            } else {
                assert_eq!(buddy.free_blocks(class), vec![base + class_size(class)]);
            }
        }

        unsafe { buddy.release(a, 100) };
        assert_eq!(buddy.free_blocks(3), vec![base]);

        unsafe { buddy.release(b, 100) };
        assert!(!buddy.is_initialized());
        assert_eq!(buddy.provider().available(), 4);
    }

    #[test]
    fn allocated_buddy_blocks_merging() {
        let mut buddy = pool_buddy(4);

        let first = buddy.allocate(4000).unwrap();
        let second = buddy.allocate(4000).unwrap();
        assert_eq!(buddy.pages_owned(), 1);
        assert_eq!(second.addr().get(), first.addr().get() + 4096);

        unsafe { buddy.release(first, 4000) };

        assert_eq!(buddy.free_blocks(8), vec![first.addr().get()]);
        assert!(buddy.free_blocks(TOP).is_empty());
        assert_eq!(buddy.pages_owned(), 1);

        unsafe { buddy.release(second, 4000) };
        assert!(!buddy.is_initialized());
    }

    #[test]
    fn full_free_list_reuse_before_new_page() {
        let mut buddy = pool_buddy(4);

        let blocks: Vec<_> = (0..PAGE_SIZE / 512)
            .map(|_| buddy.allocate(512).unwrap())
            .collect();
        assert_eq!(buddy.pages_owned(), 1);

        let extra = buddy.allocate(16).unwrap();
        assert_eq!(buddy.pages_owned(), 2);

        for block in blocks {
            unsafe { buddy.release(block, 512) };
        }
        assert_eq!(buddy.pages_owned(), 1);
        assert!(buddy.free_blocks(TOP).is_empty());

        unsafe { buddy.release(extra, 16) };
        assert!(!buddy.is_initialized());
        assert_eq!(buddy.provider().available(), 4);
    }

    #[test]
    fn allocate_release_round_trip_keeps_shape() {
        let mut buddy = pool_buddy(4);
        let keep = buddy.allocate(100).unwrap();

        for size in [1, 16, 17, 300, 1000, 4096, PAGE_SIZE - 8] {
            let before = buddy.shape();
            let pages = buddy.pages_owned();

            let block = buddy.allocate(size).unwrap();
            unsafe { buddy.release(block, size) };

            assert_eq!(buddy.shape(), before, "size {size}");
            assert_eq!(buddy.pages_owned(), pages);
        }

        unsafe { buddy.release(keep, 100) };
    }

    #[test]
    fn out_of_pages_leaves_no_page_behind() {
        // Room for the root, but not for a data page.
        let mut buddy = pool_buddy(1);
        assert_eq!(buddy.allocate(16), Err(AllocError::OutOfPages));
        assert!(!buddy.is_initialized());
        assert_eq!(buddy.provider().available(), 1);

        let mut buddy = pool_buddy(2);
        let block = buddy.allocate(PAGE_SIZE - 8).unwrap();
        assert_eq!(buddy.allocate(16), Err(AllocError::OutOfPages));
        assert_eq!(buddy.pages_owned(), 1);
        assert_eq!(buddy.live_allocations(), 1);

        unsafe { buddy.release(block, PAGE_SIZE - 8) };
        assert_eq!(buddy.provider().available(), 2);
    }

    #[test]
    fn overflow_roots_are_chained_and_released() {
        let capacity = Root::<NonZeroUsize>::capacity();
        let num_blocks = capacity + 3;

        // Data pages, the primary root and one overflow root.
        let num_pages = num_blocks + 2;
        let mut buddy = pool_buddy(num_pages);

        let blocks: Vec<_> = (0..num_blocks)
            .map(|_| buddy.allocate(PAGE_SIZE - 8).unwrap())
            .collect();
        assert_eq!(buddy.pages_owned(), num_blocks);
        assert_eq!(buddy.provider().available(), 0);

        // Freeing the pages tracked by the overflow root drops that root.
        for &block in &blocks[capacity..] {
            unsafe { buddy.release(block, PAGE_SIZE - 8) };
        }
        assert_eq!(buddy.pages_owned(), capacity);
        assert_eq!(buddy.provider().available(), 3 + 1);

        // The chain grows again on demand.
        let again = buddy.allocate(PAGE_SIZE - 8).unwrap();
        assert_eq!(buddy.provider().available(), 3 + 1 - 2);

        unsafe { buddy.release(again, PAGE_SIZE - 8) };
        for &block in &blocks[..capacity] {
            unsafe { buddy.release(block, PAGE_SIZE - 8) };
        }

        assert!(!buddy.is_initialized());
        assert_eq!(buddy.provider().available(), num_pages);
    }

    #[test]
    fn vacated_primary_slot_is_reused() {
        let capacity = Root::<NonZeroUsize>::capacity();
        let mut buddy = pool_buddy(capacity + 4);

        let mut blocks: Vec<_> = (0..capacity)
            .map(|_| buddy.allocate(PAGE_SIZE - 8).unwrap())
            .collect();

        let freed = blocks.swap_remove(capacity / 2);
        unsafe { buddy.release(freed, PAGE_SIZE - 8) };

        // The vacated slot in the primary root takes the next page, so no
        // overflow root is needed.
        blocks.push(buddy.allocate(PAGE_SIZE - 8).unwrap());
        assert_eq!(buddy.provider().available(), 4 - 1);

        for block in blocks {
            unsafe { buddy.release(block, PAGE_SIZE - 8) };
        }
        assert_eq!(buddy.provider().available(), capacity + 4);
    }

    #[test]
    fn drop_returns_outstanding_pages() {
        let pool = PagePool::<Global>::try_new(8).unwrap();
        let mut buddy = Buddy::new(pool);

        let _leaked = buddy.allocate(100).unwrap();
        let _also = buddy.allocate(PAGE_SIZE - 8).unwrap();
        assert_eq!(buddy.provider().available(), 8 - 3);

        // Dropping the allocator returns its pages before the pool goes away.
        drop(buddy);
    }

    #[test]
    fn global_pages() {
        let mut buddy = Buddy::new(Global);

        let sizes = [8, 24, 100, 700, 2048, 5000];
        let blocks: Vec<_> = sizes.iter().map(|&s| buddy.allocate(s).unwrap()).collect();

        for (i, a) in blocks.iter().enumerate() {
            let a_class = class_size(class_for(sizes[i]).unwrap());
            assert_eq!(a.addr().get() % a_class, 0, "block is aligned to its class");

            for (j, b) in blocks.iter().enumerate().skip(i + 1) {
                let b_class = class_size(class_for(sizes[j]).unwrap());
                let (a0, b0) = (a.addr().get(), b.addr().get());
                assert!(a0 + a_class <= b0 || b0 + b_class <= a0, "blocks overlap");
            }
        }

        for (block, size) in blocks.into_iter().zip(sizes) {
            unsafe { buddy.release(block, size) };
        }
        assert!(!buddy.is_initialized());
    }
}
