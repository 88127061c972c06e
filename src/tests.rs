#![cfg(test)]
extern crate std;

use core::{cmp, fmt::Debug, marker::PhantomData, mem, ptr, ptr::NonNull, slice};

use crate::{
    AllocError, AllocInitError, Buddy, Global, PagePool, ResourceMap, Strategy, PAGE_SIZE,
};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

trait QcStrategy: Strategy + Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    /// The largest request that must not be rejected as oversized.
    fn max_request() -> usize;

    /// Returns `true` if every page has gone back to the provider.
    fn pages_returned(&self) -> bool;
}

#[derive(Clone, Debug)]
struct PoolParams {
    num_pages: usize,
}

impl Arbitrary for PoolParams {
    fn arbitrary(g: &mut Gen) -> Self {
        PoolParams {
            num_pages: cmp::max(usize::arbitrary(g) % 32, 1),
        }
    }
}

// Buddy ======================================================================

impl QcStrategy for Buddy<PagePool<Global>> {
    type Params = PoolParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        PagePool::try_new(params.num_pages).map(Buddy::new)
    }

    fn max_request() -> usize {
        PAGE_SIZE - mem::size_of::<usize>()
    }

    fn pages_returned(&self) -> bool {
        !self.is_initialized() && self.provider().available() == self.provider().capacity()
    }
}

impl QcStrategy for Buddy<Global> {
    type Params = ();

    fn with_params(_: ()) -> Result<Self, AllocInitError> {
        Ok(Buddy::new(Global))
    }

    fn max_request() -> usize {
        PAGE_SIZE - mem::size_of::<usize>()
    }

    fn pages_returned(&self) -> bool {
        !self.is_initialized()
    }
}

// Resource map ===============================================================

impl QcStrategy for ResourceMap<PagePool<Global>> {
    type Params = PoolParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        PagePool::try_new(params.num_pages).map(ResourceMap::new)
    }

    fn max_request() -> usize {
        ResourceMap::<PagePool<Global>>::max_request()
    }

    fn pages_returned(&self) -> bool {
        !self.is_initialized() && self.provider().available() == self.provider().capacity()
    }
}

impl QcStrategy for ResourceMap<Global> {
    type Params = ();

    fn with_params(_: ()) -> Result<Self, AllocInitError> {
        Ok(ResourceMap::new(Global))
    }

    fn max_request() -> usize {
        ResourceMap::<Global>::max_request()
    }

    fn pages_returned(&self) -> bool {
        !self.is_initialized()
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp<P: Arbitrary> {
    /// Allocate a block.
    Allocate { params: P },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on the number of `u32` values in an allocation, expressed in bits.
///
/// The largest allocations are slightly over a page, so oversized requests
/// get exercised too.
const ALLOC_LIMIT_BITS: u8 = 11;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl<P: Arbitrary> Arbitrary for AllocatorOp<P> {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                params: P::arbitrary(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

struct RawAllocation {
    id: OpId,
    ptr: NonNull<[u8]>,
}

type AllocResult = Result<NonNull<u8>, AllocError>;

trait PropAllocation {
    type Params: Arbitrary;

    fn size(params: &Self::Params) -> usize;
    fn from_raw(params: &Self::Params, raw: RawAllocation) -> Self;
    fn into_raw(self) -> RawAllocation;
}

trait Prop {
    /// The strategy to test for this property.
    type Allocator: QcStrategy;

    type Allocation: PropAllocation;

    /// Examines the result of an allocation.
    fn post_allocate(
        op_id: OpId,
        params: &<Self::Allocation as PropAllocation>::Params,
        res: &mut AllocResult,
    ) -> bool {
        let _ = (op_id, params, res);
        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        let _ = allocation;
        true
    }

    /// Examines the strategy once every allocation has been freed.
    fn post_run(allocator: &Self::Allocator) -> bool {
        let _ = allocator;
        true
    }
}

struct AllocatorChecker<P: Prop> {
    allocator: P::Allocator,
    allocations: Vec<P::Allocation>,
    num_ops: u32,
}

impl<P: Prop> AllocatorChecker<P> {
    fn new(
        params: <P::Allocator as QcStrategy>::Params,
        capacity: usize,
    ) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: P::Allocator::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp<<P::Allocation as PropAllocation>::Params>) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { params } => {
                let size = P::Allocation::size(&params);
                let mut res = self.allocator.allocate(size);

                if !P::post_allocate(op_id, &params, &mut res) {
                    return false;
                }

                match res {
                    Ok(ptr) => {
                        self.allocations.push(P::Allocation::from_raw(
                            &params,
                            RawAllocation {
                                id: op_id,
                                ptr: NonNull::new(ptr::slice_from_raw_parts_mut(
                                    ptr.as_ptr(),
                                    size,
                                ))
                                .unwrap(),
                            },
                        ));
                    }

                    // If the allocation should have succeeded, this is handled
                    // by post_allocate
                    Err(_) => (),
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_deallocate(&a) {
                    return false;
                }

                let a = a.into_raw();

                unsafe { self.allocator.release(a.ptr.cast::<u8>(), a.ptr.len()) };
            }
        }

        true
    }

    fn run(&mut self, ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for alloc in self.allocations.drain(..) {
            let alloc = alloc.into_raw();
            unsafe {
                self.allocator
                    .release(alloc.ptr.cast::<u8>(), alloc.ptr.len())
            };
        }

        P::post_run(&self.allocator)
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

/// Live allocations never overlap, and every page goes back to the provider
/// once they are all freed.
struct MutuallyExclusive<A: QcStrategy> {
    phantom: PhantomData<A>,
}

struct MutuallyExclusiveAllocation {
    op_id: OpId,
    ptr: NonNull<[u32]>,
}

#[derive(Clone, Debug)]
struct MutuallyExclusiveAllocationParams {
    len: usize,
}

impl Arbitrary for MutuallyExclusiveAllocationParams {
    fn arbitrary(g: &mut Gen) -> Self {
        MutuallyExclusiveAllocationParams {
            len: limited_size(g),
        }
    }
}

impl PropAllocation for MutuallyExclusiveAllocation {
    type Params = MutuallyExclusiveAllocationParams;

    fn size(params: &Self::Params) -> usize {
        mem::size_of::<u32>() * params.len
    }

    fn from_raw(params: &Self::Params, raw: RawAllocation) -> Self {
        MutuallyExclusiveAllocation {
            op_id: raw.id,
            ptr: NonNull::new(ptr::slice_from_raw_parts_mut(
                raw.ptr.as_ptr().cast(),
                params.len,
            ))
            .unwrap(),
        }
    }

    fn into_raw(self) -> RawAllocation {
        let num_bytes = mem::size_of::<u32>() * self.ptr.len();

        let bytes = NonNull::new(ptr::slice_from_raw_parts_mut(
            self.ptr.cast().as_ptr(),
            num_bytes,
        ))
        .unwrap();

        RawAllocation {
            id: self.op_id,
            ptr: bytes,
        }
    }
}

impl<A: QcStrategy> Prop for MutuallyExclusive<A> {
    type Allocator = A;

    type Allocation = MutuallyExclusiveAllocation;

    fn post_allocate(
        op_id: OpId,
        params: &MutuallyExclusiveAllocationParams,
        res: &mut AllocResult,
    ) -> bool {
        let size = MutuallyExclusiveAllocation::size(params);
        let fits = size <= A::max_request();

        match res {
            Ok(block) => {
                if !fits || block.as_ptr() as usize % mem::align_of::<u32>() != 0 {
                    return false;
                }

                let u32_ptr: NonNull<u32> = block.cast();
                let slice = unsafe { slice::from_raw_parts_mut(u32_ptr.as_ptr(), params.len) };
                slice.fill(op_id);

                true
            }

            Err(AllocError::Oversized(requested)) => !fits && *requested == size,

            Err(AllocError::OutOfPages) => fits,
        }
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        let slice = unsafe { allocation.ptr.as_ref() };
        slice.iter().copied().all(|elem| elem == allocation.op_id)
    }

    fn post_run(allocator: &A) -> bool {
        allocator.pages_returned()
    }
}

fn check<P: Prop>(
    params: <P::Allocator as QcStrategy>::Params,
    ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>,
) -> bool {
    let mut checker: AllocatorChecker<P> = AllocatorChecker::new(params, ops.capacity()).unwrap();
    checker.run(ops)
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<Buddy<PagePool<Global>>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive<Buddy<Global>>> as fn(_, _) -> bool);
}

#[test]
fn resource_map_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<ResourceMap<PagePool<Global>>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive<ResourceMap<Global>>> as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
