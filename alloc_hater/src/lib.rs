//! A small library for ~~hating on~~ evaluating the correctness of
//! size-reminded allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// The upper bound on generated request sizes.
///
/// This covers a few pages, so subjects see requests on both sides of their
/// size limit.
pub const MAX_REQUEST: usize = 0x4000;

/// A request size which implements `Arbitrary`.
///
/// Small sizes are favored: the size is drawn below a random power of two.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let limit_shift = u8::arbitrary(u)? % (MAX_REQUEST.trailing_zeros() as u8 + 1);
        let limit: usize = 1 << limit_shift;

        let size = usize::from(u16::arbitrary(u)?) % (limit + 1);

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
    Alloc(usize),
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

    /// Allocates a block of at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError>;

    /// Releases the block of `size` bytes pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with a request of `size`
    /// bytes.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);

    /// Returns `true` if the subject holds no resources on behalf of
    /// allocations.
    ///
    /// Called once every block has been deallocated.
    fn is_idle(&self) -> bool {
        true
    }
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
    // A pointer to the allocated region. Its length is the requested size.
    ptr: NonNull<[u8]>,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block of `size` bytes at `ptr` and paints it according to
    /// `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `size` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<u8>, size: usize, id: u64) -> Block {
        let ptr = NonNull::slice_from_raw_parts(ptr, size);

        let mut b = Block { ptr, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a slice of uninitialized bytes.
    pub fn as_uninit_slice(&self) -> &[MaybeUninit<u8>] {
        // SAFETY: self is immutably borrowed, so only immutable references to
        // the slice can exist
        unsafe { &*slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the pointer to the block and the size it was requested with.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.ptr.cast(), self.ptr.len())
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        unsafe { paint(self.as_uninit_slice_mut(), id) };
        self.id = id;
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        for (byte, value) in slice.iter().zip(id_bytes) {
            if *byte != value {
                return false;
            }
        }

        true
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub enum FailReason {
    /// A block was overwritten while it was allocated.
    Corrupted(AllocatorOp),
    /// The subject still held resources after every block was deallocated.
    NotIdle,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub reason: FailReason,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            match op {
                AllocatorOp::Alloc(size) => {
                    let ptr = match self.subject.allocate(size) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let block = unsafe { Block::init(ptr, size, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            reason: FailReason::Corrupted(op),
                        });
                    }

                    block.paint(op_id);

                    let (ptr, size) = block.into_raw_parts();
                    unsafe { self.subject.deallocate(ptr, size) };
                }
            }

            completed.push(op);
        }

        let mut corrupted = None;

        for (idx, block) in blocks.into_iter().enumerate() {
            if corrupted.is_none() && !block.verify() {
                corrupted = Some(idx);
            }

            let (ptr, size) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr, size) };
        }

        if let Some(idx) = corrupted {
            return Err(Failed {
                completed,
                reason: FailReason::Corrupted(AllocatorOp::Dealloc(idx)),
            });
        }

        if !self.subject.is_idle() {
            return Err(Failed {
                completed,
                reason: FailReason::NotIdle,
            });
        }

        Ok(())
    }
}
