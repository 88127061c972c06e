//! Page-backed kernel memory allocators.
//!
//! This crate services small `allocate(size)` / `release(ptr, size)` requests
//! from whole pages supplied by a [`PageProvider`], and hands pages back to the
//! provider as soon as they fall idle. Two strategies are provided:
//!
//! - [`Buddy`], a binary-buddy allocator with ten power-of-two size classes
//!   (16 bytes up to a full page) and a per-page allocation bitmap.
//! - [`ResourceMap`], a first-fit allocator over a single address-ordered free
//!   list spanning every owned page, coalescing adjacent blocks on release.
//!
//! Both strategies keep their control structures inside pages obtained from
//! the provider, so no other allocator is needed to run them.
//!
//! ## Selecting a strategy
//!
//! Exactly one strategy is meant to be active in a given build. The [`Kma`]
//! alias names it: [`Buddy`] by default, or [`ResourceMap`] when the
//! `resource-map` feature is enabled.
//!
//! ```
//! # #[cfg(feature = "alloc")]
//! # fn main() {
//! use kma::{Global, Kma, Strategy};
//!
//! let mut kma = Kma::new(Global);
//!
//! let block = kma.allocate(100).unwrap();
//! unsafe { kma.release(block, 100) };
//!
//! assert!(!kma.is_initialized());
//! # }
//! # #[cfg(not(feature = "alloc"))]
//! # fn main() {}
//! ```
//!
//! ## Features
//!
//! - `sptr` (default): strict-provenance polyfills from the `sptr` crate.
//! - `unstable`: use the strict-provenance APIs of `core` on nightly instead.
//! - `alloc`: the heap-backed [`Global`] page provider and
//!   [`PagePool::try_new`].
//! - `resource-map`: make [`Kma`] refer to [`ResourceMap`].

#![doc(html_root_url = "https://docs.rs/kma/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(
    all(feature = "unstable", not(feature = "sptr")),
    feature(strict_provenance)
)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by unstable features.
#![allow(unstable_name_collisions)]

macro_rules! requires_sptr_or_unstable {
    ($($it:item)*) => {
        $(
            #[cfg(any(feature = "sptr", feature = "unstable"))]
            $it
        )*
    };
}

#[cfg(not(any(feature = "sptr", feature = "unstable")))]
compile_error!("At least one of these crate features must be enabled: [\"sptr\", \"unstable\"].");

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

requires_sptr_or_unstable! {
    mod bitmap;
    pub mod buddy;
    mod page;
    pub mod pool;
    pub mod rm;

    #[cfg(not(feature = "unstable"))]
    mod polyfill;

    #[cfg(test)]
    mod tests;

    use core::{alloc::Layout, fmt, ptr::NonNull};

    pub use crate::{
        buddy::Buddy,
        page::{Page, PageProvider, PAGE_SIZE},
        pool::PagePool,
        rm::ResourceMap,
    };

    #[cfg(any(feature = "alloc", test))]
    pub use crate::page::Global;

    /// The strategy selected for this build.
    ///
    /// This is [`Buddy`] unless the `resource-map` feature is enabled.
    #[cfg(not(feature = "resource-map"))]
    pub type Kma<P> = Buddy<P>;

    /// The strategy selected for this build.
    ///
    /// This is [`ResourceMap`] because the `resource-map` feature is enabled.
    #[cfg(feature = "resource-map")]
    pub type Kma<P> = ResourceMap<P>;

    /// A small-object allocation strategy backed by whole pages.
    pub trait Strategy {
        /// Allocates a block of at least `size` bytes.
        ///
        /// The contents of the block are uninitialized.
        ///
        /// # Errors
        ///
        /// Returns [`AllocError::Oversized`] if `size` cannot be served from a
        /// single page; the strategy's state is untouched in that case.
        /// Returns [`AllocError::OutOfPages`] if a new page was needed and the
        /// provider could not supply one.
        fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError>;

        /// Releases the block at `ptr`.
        ///
        /// # Safety
        ///
        /// `ptr` must have been returned by a call to `allocate(size)` on this
        /// strategy with exactly the same `size`, and must not have been
        /// released since. Strategies do not record block sizes; releasing with
        /// any other pointer or size is undefined behavior.
        unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);
    }

    /// The error type for allocation requests.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub enum AllocError {
        /// The requested size cannot fit in a single page together with the
        /// strategy's bookkeeping.
        ///
        /// The variant contains the requested size.
        Oversized(usize),

        /// The page provider could not supply another page.
        OutOfPages,
    }

    impl fmt::Display for AllocError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                AllocError::Oversized(size) => {
                    write!(f, "request of {size} bytes does not fit in a {PAGE_SIZE}-byte page")
                }
                AllocError::OutOfPages => f.write_str("page provider is exhausted"),
            }
        }
    }

    /// The error type for page provider constructors.
    #[derive(Clone, Debug)]
    pub enum AllocInitError {
        /// A necessary allocation failed.
        ///
        /// This variant is returned when a constructor attempts to allocate
        /// memory for the managed region, but the underlying allocator fails.
        ///
        /// The variant contains the [`Layout`] that could not be allocated.
        AllocFailed(Layout),

        /// The configuration of the provider is invalid.
        ///
        /// This variant is returned when a provider's configuration
        /// parameters are impossible to satisfy.
        InvalidConfig,

        /// The location of the managed region is invalid.
        ///
        /// This variant is returned when the region is not page-aligned or
        /// would extend past the end of the address space.
        InvalidLocation,
    }

    impl fmt::Display for AllocInitError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                AllocInitError::AllocFailed(layout) => write!(
                    f,
                    "failed to allocate {} bytes with alignment {}",
                    layout.size(),
                    layout.align()
                ),
                AllocInitError::InvalidConfig => f.write_str("invalid provider configuration"),
                AllocInitError::InvalidLocation => f.write_str("invalid region location"),
            }
        }
    }

    /// Types which own the memory region backing a [`PagePool`].
    ///
    /// This trait is sealed, and is implemented by the following types:
    /// - The `Raw` marker type indicates that the region is not owned by the
    ///   pool. This is the case when constructing the pool from a raw pointer.
    /// - The `Global` marker type indicates that the region was obtained from
    ///   the global allocator. The pool will free its region on drop.
    pub trait BackingAllocator: Sealed {
        /// Deallocates the memory referenced by `ptr`.
        ///
        /// # Safety
        ///
        /// * `ptr` must denote a block of memory currently allocated via this
        ///   allocator, and
        /// * `layout` must fit that block of memory.
        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
    }

    /// A marker type indicating that a region is backed by raw pointers.
    #[derive(Clone, Debug)]
    pub struct Raw;
    impl Sealed for Raw {}
    impl BackingAllocator for Raw {
        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
    }

    #[doc(hidden)]
    mod private {
        pub trait Sealed {}
    }
    use private::Sealed;
}
