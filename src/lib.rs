#![allow(clippy::missing_safety_doc)]

//! First-fit list allocator with eager coalescing.
//!
//! Every allocation is prefixed by a block header. Arena blocks live on two
//! intrusive doubly linked lists: the address-ordered all-blocks list (used for
//! neighbor lookups during splitting and coalescing) and the unordered free
//! list (used for first-fit search). Requests at or above [`MMAP_THRESHOLD`]
//! bypass the arena entirely and get their own anonymous mapping, released
//! wholesale on free.
//!
//! The arena itself is a single `MAP_NORESERVE` reservation carved by a private
//! break pointer: growth bumps the break, and freeing the tail-most blocks
//! retracts it (returning the pages with `madvise` under the `release-mem`
//! feature). All state sits behind one [`Allocator`] context guarded by a
//! single mutex, so the allocator is safe to call from multiple threads at
//! coarse-lock throughput.
//!
//! Misuse (double free, foreign pointers, out-of-bounds writes) is undefined
//! behavior, exactly as with a raw libc allocator.

use core::{
  alloc::{GlobalAlloc, Layout},
  mem::size_of,
  ptr::{self, null_mut},
};
use std::sync::{Mutex, MutexGuard, PoisonError};

// =============================================================================
// Constants
// =============================================================================

/// Payload alignment. Every payload size is rounded up to this.
pub const ALIGNMENT: usize = 16;

/// Requests at or above this many bytes get a dedicated mapping.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// Smallest remainder worth carving off as a new free block.
const MIN_SPLIT_SIZE: usize = 32;

/// Virtual address space reserved per arena. Pages are only committed as the
/// break advances over them.
const ARENA_RESERVE: usize = 1 << 30; // 1GB

/// Header bytes preceding every payload. Rounded to a 64-byte boundary, and a
/// power of two, so a page-backed payload sits `HEADER_SIZE`-aligned off its
/// page start; that is the strictest alignment the mapped path honors.
pub const HEADER_SIZE: usize = align_up(size_of::<BlockHeader>(), 64);

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(HEADER_SIZE.is_power_of_two());
const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(MIN_SPLIT_SIZE % ALIGNMENT == 0);
const _: () = assert!(MMAP_THRESHOLD % ALIGNMENT == 0);
const _: () = assert!(MMAP_THRESHOLD < ARENA_RESERVE);

// =============================================================================
// Block Header
// =============================================================================

/// Metadata record sitting [`HEADER_SIZE`] bytes before each payload.
///
/// `next`/`prev` link the address-ordered all-blocks list; consecutive entries
/// are physically contiguous (`next == self + HEADER_SIZE + size`).
/// `next_free`/`prev_free` are meaningful only while `is_free` is set. Mapped
/// blocks (`is_mmap`) never join either list.
#[repr(C)]
struct BlockHeader {
  /// Usable payload bytes, always a multiple of [`ALIGNMENT`].
  size: usize,
  is_free: bool,
  is_mmap: bool,
  next: *mut BlockHeader,
  prev: *mut BlockHeader,
  next_free: *mut BlockHeader,
  prev_free: *mut BlockHeader,
}

impl BlockHeader {
  /// The single payload-from-header conversion.
  #[inline]
  unsafe fn payload(block: *mut BlockHeader) -> *mut u8 {
    unsafe { (block as *mut u8).add(HEADER_SIZE) }
  }

  /// The single header-from-payload conversion.
  #[inline]
  unsafe fn from_payload(ptr: *mut u8) -> *mut BlockHeader {
    unsafe { ptr.sub(HEADER_SIZE) as *mut BlockHeader }
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_reserve(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// System page size, queried once. madvise wants page-aligned addresses, and
/// not every platform runs 4KB pages.
#[cfg(feature = "release-mem")]
fn page_size() -> usize {
  use std::sync::OnceLock;
  static PAGE: OnceLock<usize> = OnceLock::new();
  *PAGE.get_or_init(|| {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 { ps as usize } else { 4096 }
  })
}

/// Hand fully vacated pages in `[lo, hi)` back to the OS. The reservation
/// stays mapped; the pages read as zero if the break ever grows over them
/// again.
#[cfg(feature = "release-mem")]
unsafe fn os_release(lo: *mut u8, hi: *mut u8) {
  let page = page_size();
  let start = align_up(lo as usize, page);
  let end = align_up(hi as usize, page);
  if start < end {
    unsafe { libc::madvise(start as *mut libc::c_void, end - start, libc::MADV_DONTNEED) };
  }
}

#[cfg(not(feature = "release-mem"))]
unsafe fn os_release(_lo: *mut u8, _hi: *mut u8) {}

/// Initialize a dedicated mapping for one large block. Never linked into the
/// arena lists.
unsafe fn map_block(size: usize) -> *mut BlockHeader {
  let total = HEADER_SIZE + size;
  let raw = unsafe { os_mmap(total) };
  if raw.is_null() {
    return null_mut();
  }

  let hdr = raw as *mut BlockHeader;
  unsafe {
    (*hdr).size = size;
    (*hdr).is_free = false;
    (*hdr).is_mmap = true;
    (*hdr).next = null_mut();
    (*hdr).prev = null_mut();
    (*hdr).next_free = null_mut();
    (*hdr).prev_free = null_mut();
  }
  hdr
}

// =============================================================================
// Heap (arena state, lock-holder exclusive)
// =============================================================================

/// All mutable arena state: reservation bounds, the private break, the
/// all-blocks list and the free list. Exclusively owned by whoever holds the
/// [`Allocator`] mutex.
struct Heap {
  /// Reservation start. Null until the first growth request.
  base: *mut u8,
  /// Reservation end; growing past it is the out-of-memory condition.
  limit: *mut u8,
  /// Private break. Blocks occupy `[base, top)`.
  top: *mut u8,
  all_head: *mut BlockHeader,
  all_tail: *mut BlockHeader,
  free_head: *mut BlockHeader,
}

// Raw pointers into memory only ever touched under the mutex.
unsafe impl Send for Heap {}

impl Heap {
  const fn new() -> Self {
    Self {
      base: null_mut(),
      limit: null_mut(),
      top: null_mut(),
      all_head: null_mut(),
      all_tail: null_mut(),
      free_head: null_mut(),
    }
  }

  /// Reserve the arena on first use.
  fn ensure_arena(&mut self) -> bool {
    if !self.base.is_null() {
      return true;
    }
    let raw = unsafe { os_reserve(ARENA_RESERVE) };
    if raw.is_null() {
      return false;
    }
    self.base = raw;
    self.top = raw;
    self.limit = unsafe { raw.add(ARENA_RESERVE) };
    true
  }

  /// Push `b` onto the free-list head.
  unsafe fn insert_free(&mut self, b: *mut BlockHeader) {
    unsafe {
      (*b).is_free = true;
      (*b).next_free = self.free_head;
      (*b).prev_free = null_mut();
      if !self.free_head.is_null() {
        (*self.free_head).prev_free = b;
      }
    }
    self.free_head = b;
  }

  /// Detach `b` from the free list and clear its free mark.
  unsafe fn remove_free(&mut self, b: *mut BlockHeader) {
    unsafe {
      if !(*b).prev_free.is_null() {
        (*(*b).prev_free).next_free = (*b).next_free;
      } else {
        self.free_head = (*b).next_free;
      }
      if !(*b).next_free.is_null() {
        (*(*b).next_free).prev_free = (*b).prev_free;
      }
      (*b).next_free = null_mut();
      (*b).prev_free = null_mut();
      (*b).is_free = false;
    }
  }

  /// Linear first-fit scan. Eager coalescing keeps this list short; the
  /// fragmentation cost versus best-fit is accepted for O(1) insert/remove
  /// and a simpler invariant set.
  unsafe fn find_free_block(&self, size: usize) -> *mut BlockHeader {
    let mut curr = self.free_head;
    while !curr.is_null() {
      unsafe {
        if (*curr).size >= size {
          return curr;
        }
        curr = (*curr).next_free;
      }
    }
    null_mut()
  }

  /// Carve `b` into a used prefix of exactly `size` bytes and a free
  /// remainder, unless the remainder would be too small to ever be useful.
  unsafe fn split_block(&mut self, b: *mut BlockHeader, size: usize) {
    unsafe {
      if (*b).size < size + HEADER_SIZE + MIN_SPLIT_SIZE {
        return;
      }

      let new_hdr = BlockHeader::payload(b).add(size) as *mut BlockHeader;
      (*new_hdr).size = (*b).size - size - HEADER_SIZE;
      (*new_hdr).is_free = false;
      (*new_hdr).is_mmap = false;

      // Link into the all-blocks list right after `b`, keeping address order.
      (*new_hdr).next = (*b).next;
      (*new_hdr).prev = b;
      if !(*b).next.is_null() {
        (*(*b).next).prev = new_hdr;
      } else {
        self.all_tail = new_hdr;
      }
      (*b).next = new_hdr;
      (*b).size = size;

      (*new_hdr).next_free = null_mut();
      (*new_hdr).prev_free = null_mut();
      self.insert_free(new_hdr);
    }
  }

  /// Absorb the physical successor into `b` if it is a free arena block.
  unsafe fn coalesce_with_next(&mut self, b: *mut BlockHeader) {
    unsafe {
      let n = (*b).next;
      if n.is_null() || !(*n).is_free || (*n).is_mmap {
        return;
      }
      self.remove_free(n);
      (*b).size += HEADER_SIZE + (*n).size;
      (*b).next = (*n).next;
      if !(*n).next.is_null() {
        (*(*n).next).prev = b;
      } else {
        self.all_tail = b;
      }
    }
  }

  /// Absorb `b` into its physical predecessor if that one is a free arena
  /// block. Returns the surviving block.
  unsafe fn coalesce_with_prev(&mut self, b: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
      let p = (*b).prev;
      if p.is_null() || !(*p).is_free || (*p).is_mmap {
        return b;
      }
      self.remove_free(b);
      self.remove_free(p);
      (*p).size += HEADER_SIZE + (*b).size;
      (*p).next = (*b).next;
      if !(*b).next.is_null() {
        (*(*b).next).prev = p;
      } else {
        self.all_tail = p;
      }
      self.insert_free(p);
      p
    }
  }

  /// Commit `HEADER_SIZE + size` bytes at the break and append a used block
  /// to the all-blocks tail. Null if the reservation is exhausted; no state
  /// changes on failure.
  unsafe fn grow(&mut self, size: usize) -> *mut BlockHeader {
    if !self.ensure_arena() {
      return null_mut();
    }

    let total = HEADER_SIZE + size;
    if (self.limit as usize - self.top as usize) < total {
      return null_mut();
    }

    let hdr = self.top as *mut BlockHeader;
    self.top = unsafe { self.top.add(total) };
    unsafe {
      (*hdr).size = size;
      (*hdr).is_free = false;
      (*hdr).is_mmap = false;
      (*hdr).next = null_mut();
      (*hdr).prev = self.all_tail;
      (*hdr).next_free = null_mut();
      (*hdr).prev_free = null_mut();
      if self.all_head.is_null() {
        self.all_head = hdr;
      }
      if !self.all_tail.is_null() {
        (*self.all_tail).next = hdr;
      }
    }
    self.all_tail = hdr;
    hdr
  }

  /// Retract the break over every trailing free block. After this the tail
  /// is either used or the arena is empty. Interior free blocks stay put:
  /// retracting them would break registry contiguity.
  unsafe fn shrink_pass(&mut self) {
    let old_top = self.top;
    unsafe {
      while !self.all_tail.is_null() && (*self.all_tail).is_free && !(*self.all_tail).is_mmap {
        let t = self.all_tail;
        self.remove_free(t);
        self.all_tail = (*t).prev;
        if self.all_tail.is_null() {
          self.all_head = null_mut();
        } else {
          (*self.all_tail).next = null_mut();
        }
        self.top = t as *mut u8;
      }
      if (self.top as usize) < (old_top as usize) {
        os_release(self.top, old_top);
      }
    }
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    if !self.base.is_null() {
      unsafe { os_munmap(self.base, ARENA_RESERVE) };
    }
  }
}

// =============================================================================
// Allocator
// =============================================================================

/// An allocator context: one arena, one lock.
///
/// All four operations take the mutex for their full duration, including any
/// OS call made while growing or trimming the arena. Dropping the allocator
/// releases the arena reservation; large-path blocks are independent mappings
/// and survive until freed.
pub struct Allocator {
  heap: Mutex<Heap>,
}

impl Allocator {
  pub const fn new() -> Self {
    Self {
      heap: Mutex::new(Heap::new()),
    }
  }

  // A panic while the lock is held leaves the heap exactly as the panicking
  // call left it, so recover the guard instead of propagating poison.
  fn lock(&self) -> MutexGuard<'_, Heap> {
    self.heap.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Allocate `size` bytes, aligned to [`ALIGNMENT`]. Null on `size == 0` or
  /// when the OS refuses memory.
  pub fn allocate(&self, size: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    let size = align_up(size, ALIGNMENT);
    let mut heap = self.lock();

    if size >= MMAP_THRESHOLD {
      let hdr = unsafe { map_block(size) };
      if hdr.is_null() {
        return null_mut();
      }
      return unsafe { BlockHeader::payload(hdr) };
    }

    let b = unsafe { heap.find_free_block(size) };
    if !b.is_null() {
      unsafe {
        heap.remove_free(b);
        heap.split_block(b, size);
        return BlockHeader::payload(b);
      }
    }

    // No fit: grow by exactly the request. Growth blocks are not pre-split.
    let hdr = unsafe { heap.grow(size) };
    if hdr.is_null() {
      return null_mut();
    }
    unsafe { BlockHeader::payload(hdr) }
  }

  /// Release `ptr`. No-op on null. `ptr` must come from this allocator and
  /// must not have been freed already; anything else is undefined behavior.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let mut heap = self.lock();
    let hdr = unsafe { BlockHeader::from_payload(ptr) };

    if unsafe { (*hdr).is_mmap } {
      let total = HEADER_SIZE + unsafe { (*hdr).size };
      unsafe { os_munmap(hdr as *mut u8, total) };
      return;
    }

    unsafe {
      heap.insert_free(hdr);
      heap.coalesce_with_next(hdr);
      heap.coalesce_with_prev(hdr);
      heap.shrink_pass();
    }
  }

  /// Allocate `count * size` zeroed bytes. Null if either argument is zero
  /// or the product overflows.
  pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
    if count == 0 || size == 0 {
      return null_mut();
    }
    let Some(total) = count.checked_mul(size) else {
      return null_mut();
    };

    let ptr = self.allocate(total);
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
  }

  /// Resize the allocation at `ptr` to `new_size` bytes.
  ///
  /// Null `ptr` behaves as [`allocate`](Self::allocate); `new_size == 0`
  /// behaves as [`free`](Self::free) and returns null. Shrinking is always
  /// in place. Growth is in place when the physical successor is a free
  /// arena block with enough room; otherwise the data moves and the old
  /// block is released.
  pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.allocate(new_size);
    }
    if new_size == 0 {
      unsafe { self.free(ptr) };
      return null_mut();
    }
    let new_size = align_up(new_size, ALIGNMENT);

    let mut heap = self.lock();
    let hdr = unsafe { BlockHeader::from_payload(ptr) };

    if unsafe { (*hdr).is_mmap } {
      // Shrinking keeps the mapping; the recorded size stays the mapping
      // size so the eventual munmap covers the whole region.
      if unsafe { (*hdr).size } >= new_size {
        return ptr;
      }
    } else {
      if unsafe { (*hdr).size } >= new_size {
        unsafe { heap.split_block(hdr, new_size) };
        return ptr;
      }

      // Pointer-stable growth into a free successor.
      let next = unsafe { (*hdr).next };
      if !next.is_null()
        && unsafe { (*next).is_free }
        && unsafe { !(*next).is_mmap }
        && unsafe { (*hdr).size + HEADER_SIZE + (*next).size } >= new_size
      {
        unsafe {
          heap.remove_free(next);
          (*hdr).size += HEADER_SIZE + (*next).size;
          (*hdr).next = (*next).next;
          if !(*next).next.is_null() {
            (*(*next).next).prev = hdr;
          } else {
            heap.all_tail = hdr;
          }
          heap.split_block(hdr, new_size);
        }
        return ptr;
      }
    }

    // Relocate: fresh allocation, copy, release the old block.
    let old_size = unsafe { (*hdr).size };
    drop(heap);

    let new_ptr = self.allocate(new_size);
    if new_ptr.is_null() {
      return null_mut();
    }
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
      self.free(ptr);
    }
    new_ptr
  }

  /// Print every block in the all-blocks list and the free list. Diagnostic
  /// only; takes the lock, mutates nothing.
  pub fn dump_state(&self) {
    let heap = self.lock();

    println!("all blocks:");
    let mut b = heap.all_head;
    while !b.is_null() {
      unsafe {
        println!(
          "  [{:p}] size={} free={} mmap={} next={:p} prev={:p}",
          b,
          (*b).size,
          (*b).is_free,
          (*b).is_mmap,
          (*b).next,
          (*b).prev,
        );
        b = (*b).next;
      }
    }

    println!("free list:");
    let mut b = heap.free_head;
    while !b.is_null() {
      unsafe {
        println!("  [{:p}] size={}", b, (*b).size);
        b = (*b).next_free;
      }
    }
  }
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);

    // Arena payloads are 16-aligned. Page-backed blocks give HEADER_SIZE
    // alignment; beyond that we have nothing to offer.
    if layout.align() > ALIGNMENT {
      if layout.align() > HEADER_SIZE {
        return null_mut();
      }
      let _heap = self.lock();
      let hdr = unsafe { map_block(align_up(size, ALIGNMENT)) };
      if hdr.is_null() {
        return null_mut();
      }
      return unsafe { BlockHeader::payload(hdr) };
    }

    self.allocate(size)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { self.free(ptr) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    // resize() relocates into 16-aligned arena blocks, which would drop a
    // stricter alignment; move by hand in that case.
    if layout.align() > ALIGNMENT {
      let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
      let new_ptr = unsafe { self.alloc(new_layout) };
      if !new_ptr.is_null() {
        unsafe {
          ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
          self.dealloc(ptr, layout);
        }
      }
      return new_ptr;
    }

    unsafe { self.resize(ptr, new_size) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static GLOBAL: Allocator = Allocator::new();

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  GLOBAL.allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { GLOBAL.free(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  GLOBAL.zero_allocate(nmemb, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { GLOBAL.resize(ptr, size) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================
