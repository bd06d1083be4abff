//! Simple allocator for embedded systems
//!
//! This crate provides a single type called [`Allocator`]. This type implements
//! the [`core::alloc::GlobalAlloc`]-trait, which is required to use the
//! [`alloc`-crate][alloc] on `#![no_std]`-targets.
//!
//! # Usage
//! The usage is simple: just copy and paste the following code snipped into
//! your binary crate and potentially adjust the number of bytes of the heap
//! (here 4K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: segalloc::Allocator<4096> = segalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards you don't need to interact with the crate or the variable
//! `ALLOCATOR` anymore. Now you can just `use alloc::vec::Vec` or even
//! `use alloc::collections::BTreeMap`, i.e. every fancy collection which is
//! normally provided by the `std`.
//!
//! The minimal buffer size is `16`, which would allow exactly one allocation
//! of minimum size at a time. Adjust the size as necessary, e.g. by doing a
//! worst case calculation and potentially adding some backup space of 10%
//! (for example).
//!
//! Note to users with things like `MPU`s, `MMU`s, etc.: your device might
//! support things like memory remapping or memory protection with setting
//! read/write/execution rights. This crate _doesn't use_ those features at
//! all! If that is desired, you should take the address of the buffer and
//! use that along with the known size `N` to protect the heap memory.
//!
//! # Implementation
//! Unlike a simple linear scan over every block, this crate keeps eight
//! segregated free lists ("bins"), one per power-of-two size class, so a
//! `find_fit` only has to walk the lists whose members are guaranteed to be
//! within a 2x size range of the request:
//!
//! | bin | block size (bytes) |
//! |-----|---------------------|
//! | 0   | <= 32               |
//! | 1   | 33-64               |
//! | 2   | 65-128              |
//! | 3   | 129-256             |
//! | 4   | 257-512             |
//! | 5   | 513-1024            |
//! | 6   | 1025-2048           |
//! | 7   | >= 2049             |
//!
//! Every block carries a boundary tag: a 4-byte header *and* a 4-byte footer,
//! both holding the same packed `(size, allocated)` word. The footer lets a
//! block look up its *previous* neighbor in O(1) (by reading the 4 bytes
//! just before its own header), which is what makes eager coalescing
//! affordable: whenever a block is freed, both neighbors are inspected and
//! merged in, so two free blocks are never left sitting next to each other.
//!
//! ```text
//! .. | header | payload | footer | header | payload | footer | ..
//!    ^ block A (free)            ^ block B (allocated)
//! ```
//!
//! A free block's payload holds no user data, so its first 8 bytes are
//! reused to thread the block through its bin's doubly linked list (as
//! 4-byte offsets from the heap's base address, not raw pointers, so the
//! encoding is identical regardless of target pointer width). An allocated
//! block's payload, in contrast, belongs entirely to the caller.
//!
//! When an allocation is placed into a free block that is bigger than
//! needed, the trailing remainder is split off into its own (still free)
//! block, provided that remainder is at least 16 bytes (the smallest block
//! that can hold a header, footer, and both free-list links). Otherwise the
//! whole block is handed out as-is, trading a few wasted bytes for not
//! creating an unusably small fragment.
//!
//! See the [`core_alloc`] module for the full engine (`init`/`allocate`/
//! `free`/`reallocate`) and [`heap_primitive`] for the growable backing
//! store abstraction this crate's allocator grows into.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

mod block;
mod coalesce;
pub mod core_alloc;
mod freelist;
pub mod heap_primitive;
mod placement;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use core_alloc::Heap;
use heap_primitive::SimHeap;

/// The memory allocator for embedded systems.
///
/// This is the core type of this crate: it is an allocator with a predefined
/// heap size. Therefore the heap memory usage is statically limited to an
/// upper value, which also helps to prevent issues with heap/stack-smashes,
/// as the heap is counted to the static memory (e.g. `.data`/`.bss`-sections).
/// Such a smash might still happen though, if the stack pointer grows into
/// the heap, but the heap cannot grow into the stack pointer.
///
/// Its usage is simple: just copy and paste the following in the binary
/// crate you're developing. The memory size of the heap is `4096` or 4K in
/// this example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: segalloc::Allocator<4096> = segalloc::Allocator::new();
/// ```
/// Also please refer to the [crate-level](crate)-documentation for
/// recommendations on the buffer size and general usage.
///
/// Only requests with an alignment of up to 8 bytes are guaranteed a
/// non-null result (the underlying engine only promises 8-byte payload
/// alignment, see [`core_alloc`]); a request for a larger alignment always
/// fails rather than risk miscomputing the block this allocator would later
/// need to free.
pub struct Allocator<const N: usize> {
    /// The segregated free-list engine, growing into a reserved-capacity
    /// [`SimHeap`]. Protected by a `spin::Mutex` to make it usable with
    /// shared references (a requirement of [`GlobalAlloc`]).
    heap: spin::Mutex<Heap<SimHeap<N>>>,
}

/// Largest alignment this allocator's payload pointers are guaranteed to
/// satisfy (see `block::ALIGNMENT`).
const MAX_GUARANTEED_ALIGN: usize = 8;

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator. The backing [`SimHeap`] stays
    /// completely uninitialized at construction time (no prologue, no
    /// epilogue, not even an extension) so that a `static` built from this
    /// has no non-zero byte to its name and lands in `.bss` rather than
    /// `.data` (see the crate-level docs). The first call to `alloc` or
    /// `realloc` through [`GlobalAlloc`] runs the real runtime
    /// initialization lazily.
    ///
    /// Please see the [crate-level](crate)-documentation for recommendations
    /// on the buffer size and general usage.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N` is
    /// less than `16` or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= heap_primitive::INIT_BYTES, "heap storage too small: minimum size is 16");
        assert!(N % 8 == 0, "heap storage size has to be divisible by 8");
        let heap = Heap::new(SimHeap::new());
        Self {
            heap: spin::Mutex::new(heap),
        }
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the safety contract of `GlobalAlloc` is lengthy, but in short: this
// implementation never panics on its own and only ever hands out memory it
// owns exclusively (guarded by the mutex) for the duration the caller holds
// it.
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_GUARANTEED_ALIGN {
            return ptr::null_mut();
        }
        let mut heap = self.heap.lock();
        // The backing heap starts out completely uninitialized (see `new`)
        // so that a `static` allocator lands in `.bss`; run the real
        // initialization here, on first use, instead.
        if heap.ensure_init().is_err() {
            return ptr::null_mut();
        }
        match heap.allocate(layout.size()) {
            Some(p) => p.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(bp) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: `ptr` was returned by `alloc`/`realloc` above, which only
        // ever return payload pointers produced by this same `heap`, and
        // only after it was already initialized.
        unsafe { self.heap.lock().free(bp) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        let mut heap = self.heap.lock();
        if heap.ensure_init().is_err() {
            return ptr::null_mut();
        }
        // SAFETY: `ptr` (if non-null) was returned by this allocator.
        match unsafe { heap.reallocate(NonNull::new(ptr), new_size) } {
            Some(p) => p.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
