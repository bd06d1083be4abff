//! The public allocator engine: `init`, `allocate`, `free`, `reallocate`.
//!
//! [`Heap<P>`] is generic over the [`HeapPrimitive`] it grows into, so it can
//! be driven by the bundled [`SimHeap`](crate::heap_primitive::SimHeap) or by
//! a harness-supplied implementation. It owns no synchronization of its own
//! (see the crate-level `Allocator` wrapper for that); every method here runs
//! to completion before the next one may begin.

#[cfg(test)]
extern crate alloc;

use core::ptr::NonNull;

use crate::block::{self, Tag, MIN_BLOCK_SIZE};
use crate::coalesce::coalesce;
use crate::freelist::FreeLists;
use crate::heap_primitive::{HeapPrimitive, OutOfMemory, INIT_BYTES};
use crate::placement::{find_fit, place};

/// Bytes requested per heap extension when a request can't be satisfied by
/// the existing free lists. The extension itself is `max(adj_size, CHUNK)`.
pub(crate) const CHUNK: usize = 4096;

/// [`Heap::init`] could not acquire its initial bytes from the heap
/// primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInitError(pub(crate) OutOfMemory);

/// The segregated-free-list allocator engine.
///
/// Must be [`init`](Self::init)ed before any other method is called; the
/// engine itself does not track whether this happened (the same contract
/// the teacher crate's `RawAllocator` places on its caller).
pub struct Heap<P: HeapPrimitive> {
    primitive: P,
    lists: FreeLists,
}

impl<P: HeapPrimitive> Heap<P> {
    /// Wrap a not-yet-initialized heap primitive. Call [`init`](Self::init)
    /// before use.
    pub const fn new(primitive: P) -> Self {
        Self {
            primitive,
            lists: FreeLists::new(),
        }
    }

    fn heap_lo(&self) -> *mut u8 {
        self.primitive.heap_lo()
    }

    /// Request the initial 16 bytes (4 bytes padding + 8-byte prologue +
    /// 4-byte epilogue header) from the heap primitive and write the
    /// sentinel blocks. Leaves all bins empty, no user-visible free blocks.
    ///
    /// # Errors
    /// Only if the heap primitive refuses the initial extension.
    pub fn init(&mut self) -> Result<(), HeapInitError> {
        let base = self.primitive.extend(INIT_BYTES).map_err(HeapInitError)?;
        // SAFETY: `extend` just handed back `INIT_BYTES` fresh, writable
        // bytes starting at `base`.
        unsafe {
            base.cast::<u32>().write_unaligned(0);
            let prologue_bp = base.wrapping_add(8);
            block::write_block(prologue_bp, Tag::new(8, true));
            let epilogue_header = base.wrapping_add(12).cast::<u32>();
            block::write_tag(epilogue_header, Tag::new(0, true));
        }
        Ok(())
    }

    /// Lazily run [`init`](Self::init) the first time this heap is touched.
    ///
    /// Idempotent: a heap primitive that has extended at all (`heap_size()
    /// != 0`) is assumed already initialized, since [`init`](Self::init)
    /// itself is the only thing that ever performs the first extension.
    /// This is what lets [`crate::Allocator`] stay a `const fn` over an
    /// all-zero/uninitialized [`SimHeap`](crate::heap_primitive::SimHeap)
    /// without ever writing a prologue/epilogue at const-eval time.
    pub(crate) fn ensure_init(&mut self) -> Result<(), HeapInitError> {
        if self.primitive.heap_size() == 0 {
            self.init()?;
        }
        Ok(())
    }

    /// Adjust a requested payload size to a total block size: header+footer
    /// overhead, rounded up to 8 bytes, floored at [`MIN_BLOCK_SIZE`].
    /// `None` on overflow (a request so large it cannot be satisfied).
    fn adjust_size(n: usize) -> Option<usize> {
        let with_overhead = n.checked_add(block::OVERHEAD)?;
        let rounded = with_overhead
            .checked_add(block::ALIGNMENT - 1)?
            / block::ALIGNMENT
            * block::ALIGNMENT;
        Some(rounded.max(MIN_BLOCK_SIZE))
    }

    /// Grow the heap by `max(min_bytes, CHUNK)` bytes, turning the extension
    /// into one new free block at the old epilogue's position, coalescing it
    /// with the previous block if that is free, and writing a fresh
    /// epilogue at the new high-water mark. Returns the (possibly merged)
    /// free block's payload pointer.
    fn extend_heap(&mut self, min_bytes: usize) -> Result<*mut u8, OutOfMemory> {
        let bytes = min_bytes.max(CHUNK);
        let old_epilogue_header = self.primitive.heap_hi().wrapping_sub(4);
        self.primitive.extend(bytes)?;

        let bp = old_epilogue_header.wrapping_add(4);
        // SAFETY: the extension just made `bytes` fresh bytes available
        // starting exactly at the old epilogue's header address.
        unsafe { block::write_block(bp, Tag::new(bytes, false)) };

        let new_hi = self.primitive.heap_hi();
        let epilogue_header = new_hi.wrapping_sub(4).cast::<u32>();
        // SAFETY: within the just-extended range.
        unsafe { block::write_tag(epilogue_header, Tag::new(0, true)) };

        let heap_lo = self.heap_lo();
        // SAFETY: `bp` is a free block inside a well-formed heap.
        Ok(unsafe { coalesce(&mut self.lists, heap_lo, bp, bytes) })
    }

    /// Allocate `n` bytes, returning the payload pointer, or `None` if `n`
    /// is zero or the heap primitive refuses to grow further.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n == 0 {
            return None;
        }
        let adj = Self::adjust_size(n)?;
        let heap_lo = self.heap_lo();

        // SAFETY: free lists and tags are well-formed between public calls.
        if let Some(bp) = unsafe { find_fit(&self.lists, heap_lo, adj) } {
            unsafe { place(&mut self.lists, heap_lo, bp, adj) };
            return NonNull::new(bp);
        }

        let bp = self.extend_heap(adj).ok()?;
        unsafe { place(&mut self.lists, heap_lo, bp, adj) };
        NonNull::new(bp)
    }

    /// Free a previously allocated block. A block already free is left
    /// untouched (defensive idempotence against double-free).
    ///
    /// # Safety
    /// `bp` must have been returned by [`allocate`](Self::allocate) or
    /// [`reallocate`](Self::reallocate) on this same heap and not already
    /// passed to a `free`/`reallocate` call that relocated or consumed it.
    pub unsafe fn free(&mut self, bp: NonNull<u8>) {
        let bp = bp.as_ptr();
        // SAFETY: caller contract.
        let tag = unsafe { block::read_tag(block::header_ptr(bp)) };
        if tag.is_free() {
            return;
        }
        let size = tag.size();
        unsafe { block::write_block(bp, Tag::new(size, false)) };
        let heap_lo = self.heap_lo();
        unsafe { coalesce(&mut self.lists, heap_lo, bp, size) };
    }

    /// Write `requested` bytes allocated at `bp` out of a block currently
    /// `current_size` bytes, splitting a trailing fragment (and coalescing
    /// it, since it may now border another free region) when the remainder
    /// is at least [`MIN_BLOCK_SIZE`].
    ///
    /// # Safety
    /// `bp` must be a block of `current_size` bytes, not a member of any
    /// bin, with `current_size >= requested`.
    unsafe fn split_trailing_and_mark_allocated(&mut self, bp: *mut u8, requested: usize, current_size: usize) {
        debug_assert!(current_size >= requested);
        let remainder = current_size - requested;
        if remainder >= MIN_BLOCK_SIZE {
            unsafe { block::write_block(bp, Tag::new(requested, true)) };
            let trailing = block::next_block(bp, requested);
            unsafe { block::write_block(trailing, Tag::new(remainder, false)) };
            let heap_lo = self.heap_lo();
            unsafe { coalesce(&mut self.lists, heap_lo, trailing, remainder) };
        } else {
            unsafe { block::write_block(bp, Tag::new(current_size, true)) };
        }
    }

    /// Resize a previously allocated block to `n` bytes, relocating it if
    /// necessary. `bp == None` behaves as [`allocate`](Self::allocate); `n
    /// == 0` behaves as [`free`](Self::free) and returns `None`.
    ///
    /// # Safety
    /// `bp`, if present, must satisfy the same contract as
    /// [`free`](Self::free).
    pub unsafe fn reallocate(&mut self, bp: Option<NonNull<u8>>, n: usize) -> Option<NonNull<u8>> {
        let Some(bp) = bp else {
            return self.allocate(n);
        };
        if n == 0 {
            unsafe { self.free(bp) };
            return None;
        }

        let bp_ptr = bp.as_ptr();
        // SAFETY: caller contract.
        let old_size = unsafe { block::read_tag(block::header_ptr(bp_ptr)) }.size();
        let Some(adj) = Self::adjust_size(n) else {
            return None;
        };
        if adj <= old_size {
            return Some(bp);
        }

        let heap_lo = self.heap_lo();
        let next = block::next_block(bp_ptr, old_size);
        // SAFETY: the epilogue guarantees `next`'s header is always valid.
        let next_tag = unsafe { block::read_tag(block::header_ptr(next)) };
        // SAFETY: `bp_ptr` is never the heap's first real block while it is
        // allocated and reallocated by a caller (the prologue is never
        // handed out), so the preceding footer is always valid.
        let prev = unsafe { block::prev_block(bp_ptr) };
        let prev_tag = unsafe { block::read_tag(block::header_ptr(prev)) };

        if next_tag.is_free() && old_size + next_tag.size() >= adj {
            unsafe { self.lists.remove(heap_lo, next, next_tag.size()) };
            let merged = old_size + next_tag.size();
            unsafe { self.split_trailing_and_mark_allocated(bp_ptr, adj, merged) };
            return NonNull::new(bp_ptr);
        }
        if prev_tag.is_free() && old_size + prev_tag.size() >= adj {
            unsafe { self.lists.remove(heap_lo, prev, prev_tag.size()) };
            let merged = old_size + prev_tag.size();
            unsafe { core::ptr::copy(bp_ptr, prev, old_size - block::OVERHEAD) };
            unsafe { self.split_trailing_and_mark_allocated(prev, adj, merged) };
            return NonNull::new(prev);
        }
        if prev_tag.is_free() && next_tag.is_free() && old_size + prev_tag.size() + next_tag.size() >= adj {
            unsafe {
                self.lists.remove(heap_lo, prev, prev_tag.size());
                self.lists.remove(heap_lo, next, next_tag.size());
            }
            let merged = old_size + prev_tag.size() + next_tag.size();
            unsafe { core::ptr::copy(bp_ptr, prev, old_size - block::OVERHEAD) };
            unsafe { self.split_trailing_and_mark_allocated(prev, adj, merged) };
            return NonNull::new(prev);
        }

        let new_bp = self.allocate(n)?;
        unsafe {
            core::ptr::copy_nonoverlapping(bp_ptr, new_bp.as_ptr(), old_size - block::OVERHEAD);
            self.free(bp);
        }
        Some(new_bp)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap_primitive::SimHeap;

    fn new_heap<const N: usize>() -> Heap<SimHeap<N>> {
        let mut heap = Heap::new(SimHeap::<N>::new());
        heap.init().unwrap();
        heap
    }

    #[test]
    fn init_sets_up_empty_heap_with_no_free_blocks() {
        let heap = new_heap::<256>();
        debug::check(&heap);
        assert!(debug::walk_blocks(&heap).is_empty());
    }

    #[test]
    fn ensure_init_initializes_a_fresh_heap_exactly_once() {
        let mut heap: Heap<SimHeap<256>> = Heap::new(SimHeap::new());
        assert_eq!(heap.primitive.heap_size(), 0, "nothing extended before the first touch");

        heap.ensure_init().unwrap();
        let size_after_first_call = heap.primitive.heap_size();
        assert_ne!(size_after_first_call, 0);

        heap.ensure_init().unwrap();
        assert_eq!(heap.primitive.heap_size(), size_after_first_call, "a second call must not re-initialize");
        debug::check(&heap);
    }

    #[test]
    fn simple_allocate_free_reuses_block() {
        let mut heap = new_heap::<4096>();
        let p = heap.allocate(24).unwrap();
        assert_eq!(p.as_ptr() as usize % 8, 0);
        unsafe { heap.free(p) };
        let q = heap.allocate(24).unwrap();
        assert_eq!(p, q);
        unsafe { heap.free(q) };
        debug::check(&heap);
    }

    #[test]
    fn allocate_zero_returns_none() {
        let mut heap = new_heap::<256>();
        assert_eq!(heap.allocate(0), None);
    }

    #[test]
    fn allocate_huge_request_returns_none_without_corrupting_heap() {
        let mut heap = new_heap::<4096>();
        assert_eq!(heap.allocate(usize::MAX), None);
        debug::check(&heap);
        assert!(heap.allocate(16).is_some());
    }

    #[test]
    fn allocate_one_byte_gets_minimum_block() {
        let mut heap = new_heap::<256>();
        let p = heap.allocate(1).unwrap();
        let tag = unsafe { block::read_tag(block::header_ptr(p.as_ptr())) };
        assert_eq!(tag.size(), MIN_BLOCK_SIZE);
    }

    #[test]
    fn double_free_is_silently_ignored() {
        let mut heap = new_heap::<256>();
        let p = heap.allocate(16).unwrap();
        unsafe {
            heap.free(p);
            heap.free(p);
        }
        debug::check(&heap);
    }

    #[test]
    fn split_and_coalesce_reuses_freed_space() {
        let mut heap = new_heap::<8192>();
        let a = heap.allocate(4000).unwrap();
        let _b = heap.allocate(16).unwrap();
        unsafe { heap.free(a) };
        let c = heap.allocate(16).unwrap();
        assert_eq!(a, c, "new allocation should land where `a` was freed");
        debug::check(&heap);
    }

    #[test]
    fn neighbor_coalescing_merges_three_frees_into_one() {
        let mut heap = new_heap::<4096>();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let c = heap.allocate(100).unwrap();
        unsafe {
            heap.free(a);
            heap.free(c);
            heap.free(b);
        }
        let free_blocks = debug::walk_blocks(&heap);
        assert_eq!(free_blocks.len(), 1, "all three should have merged into one free block");
        debug::check(&heap);
    }

    #[test]
    fn reallocate_none_behaves_as_allocate() {
        let mut heap = new_heap::<256>();
        let p = unsafe { heap.reallocate(None, 32) }.unwrap();
        let tag = unsafe { block::read_tag(block::header_ptr(p.as_ptr())) };
        assert!(tag.is_allocated());
    }

    #[test]
    fn reallocate_zero_frees_and_returns_none() {
        let mut heap = new_heap::<256>();
        let p = heap.allocate(32).unwrap();
        let result = unsafe { heap.reallocate(Some(p), 0) };
        assert_eq!(result, None);
        debug::check(&heap);
    }

    #[test]
    fn reallocate_same_size_is_a_no_op() {
        let mut heap = new_heap::<256>();
        let p = heap.allocate(32).unwrap();
        let q = unsafe { heap.reallocate(Some(p), 32) }.unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn reallocate_smaller_returns_same_pointer() {
        let mut heap = new_heap::<256>();
        let p = heap.allocate(100).unwrap();
        let q = unsafe { heap.reallocate(Some(p), 10) }.unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn reallocate_expands_in_place_into_freed_neighbor() {
        let mut heap = new_heap::<4096>();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        unsafe { heap.free(b) };
        let a2 = unsafe { heap.reallocate(Some(a), 300) }.unwrap();
        assert_eq!(a, a2);
        let tag = unsafe { block::read_tag(block::header_ptr(a2.as_ptr())) };
        assert!(tag.size() >= 304);
        debug::check(&heap);
    }

    #[test]
    fn reallocate_relocates_and_preserves_payload() {
        let mut heap = new_heap::<{ 64 * 1024 }>();
        let a = heap.allocate(100).unwrap();
        unsafe {
            for i in 0..100u8 {
                a.as_ptr().add(i as usize).write(i);
            }
        }
        let _b = heap.allocate(100).unwrap();
        let a2 = unsafe { heap.reallocate(Some(a), 4096) }.unwrap();
        assert_ne!(a, a2);
        for i in 0..100u8 {
            assert_eq!(unsafe { a2.as_ptr().add(i as usize).read() }, i, "P7 violated: payload not preserved across relocation");
        }
        debug::check(&heap);
    }

    #[test]
    fn out_of_memory_then_recovery() {
        let mut heap = new_heap::<{ 64 * 1024 }>();
        assert_eq!(heap.allocate(1 << 20), None);
        let p = heap.allocate(16);
        assert!(p.is_some());
        debug::check(&heap);
    }
}
