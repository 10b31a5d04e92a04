//! # cpuheap
//!
//! A general-purpose allocator that partitions its state into one heap per
//! processor. Allocations from different processors take different locks;
//! only growing the underlying memory source is serialized process-wide.
//!
//! - Requests up to 4KB (header included) are rounded to a power-of-two
//!   size class and carved from two-page superblocks. Freed blocks go into
//!   address-ordered per-class lists, where adjacent equal-class neighbours
//!   merge into the next class up; wider free blocks are split on reuse.
//! - Larger requests take whole page runs, which are recycled per heap.
//! - Every block carries a 16-byte header naming its owner and size, so
//!   `deallocate` needs no lookup table.
//! - Pointers are 16-byte aligned. Wider alignments are carved out of a
//!   larger block behind a header that points back to its start.
//!
//! ```no_run
//! use cpuheap::{Allocator, SbrkSource, SchedCpu};
//!
//! #[global_allocator]
//! static GLOBAL: Allocator<SbrkSource> = Allocator::new(SbrkSource::new(1 << 30), SchedCpu);
//! # fn main() {}
//! ```

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

mod arena;
mod cpu;
mod error;
mod free_list;
mod heap;
mod lock;
mod pages;
mod size_class;
mod source;
mod superblock;

pub use cpu::{CpuTopology, SchedCpu};
pub use error::{InitError, SourceError};
pub use size_class::{CLASS_COUNT, CLASS_SIZES, MAX_CLASS_SIZE};
pub use source::{DEFAULT_CAPACITY, MemorySource, SbrkSource};

use arena::{Arena, BlockHeader, HEADER_SIZE, MIN_ALIGN, Offset, Owner};
use heap::{HeapTable, PageSource};
use lock::{SpinMutex, spin_mutex};
use size_class::size_to_class;
use superblock::{PAGES_IN_SUPERBLOCK, SUPERBLOCK_RESERVED, Superblock};

/// Bytes of metadata in front of every returned pointer.
pub const BLOCK_HEADER_SIZE: usize = HEADER_SIZE;

/// Alignment of every returned pointer.
pub const ALIGNMENT: usize = MIN_ALIGN;

/// Smallest page size the allocator accepts from a source.
pub const MIN_PAGE_SIZE: usize = 4096;

const _: () = assert!(PAGES_IN_SUPERBLOCK * MIN_PAGE_SIZE >= SUPERBLOCK_RESERVED + MAX_CLASS_SIZE);

// =============================================================================
// Allocator
// =============================================================================

/// Allocator state: the memory source behind the global growth lock, the
/// processor topology, and the heap table built by `init`.
pub struct Allocator<S, C = SchedCpu> {
  /// Global growth lock. Held only across `MemorySource` calls.
  source: SpinMutex<S>,
  cpu: C,
  table: OnceLock<HeapTable>,
}

impl<S, C> Allocator<S, C> {
  /// An uninitialized allocator. Nothing is reserved until `init`.
  pub const fn new(source: S, cpu: C) -> Self {
    Self {
      source: spin_mutex(source),
      cpu,
      table: OnceLock::new(),
    }
  }

  /// Whether `init` has succeeded.
  pub fn is_initialized(&self) -> bool {
    self.table.get().is_some()
  }

  /// Number of processor heaps, or 0 before `init`.
  pub fn heap_count(&self) -> usize {
    self.table.get().map_or(0, |table| table.heaps().len())
  }

  /// Page size in use, or `None` before `init`.
  pub fn page_size(&self) -> Option<usize> {
    self.table.get().map(|table| table.arena().page_size())
  }

  /// The topology heaps are selected by.
  pub fn topology(&self) -> &C {
    &self.cpu
  }

  /// Runs `f` on the memory source under the global growth lock.
  pub fn with_source<R>(&self, f: impl FnOnce(&S) -> R) -> R {
    f(&self.source.lock())
  }
}

impl<S: MemorySource, C: CpuTopology> Allocator<S, C> {
  /// Sets the allocator up. Idempotent.
  ///
  /// The first successful call initializes the source and lays the heap
  /// table out in the first pages it grows; later calls return at once. On
  /// error nothing is initialized and the call may be retried.
  pub fn init(&self) -> Result<(), InitError> {
    if self.table.get().is_some() {
      return Ok(());
    }

    let result = self.init_locked();
    match &result {
      Ok(true) => log_quietly(|| {
        log::debug!(
          "cpuheap: {} heaps, {} byte pages",
          self.heap_count(),
          self.page_size().unwrap_or(0)
        )
      }),
      Ok(false) => {}
      Err(e) => log_quietly(|| log::warn!("cpuheap: init failed: {e}")),
    }
    result.map(drop)
  }

  /// Builds the table under the global lock. `Ok(false)` if another thread
  /// got there first.
  fn init_locked(&self) -> Result<bool, InitError> {
    let mut source = self.source.lock();
    if self.table.get().is_some() {
      return Ok(false);
    }

    source.init()?;
    let page_size = source.page_size();
    if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE {
      return Err(InitError::PageSize(page_size));
    }

    let heaps = self.cpu.processor_count().max(1);
    let bytes = HeapTable::pages_for(heaps, page_size) * page_size;
    let base = source.grow(bytes).ok_or(InitError::Exhausted { bytes })?;

    let arena = Arena::new(base, page_size, PAGES_IN_SUPERBLOCK * page_size);
    let table = unsafe { HeapTable::build(arena, heaps) };
    // Cannot fail: the table is only ever set under the source lock.
    let _ = self.table.set(table);
    Ok(true)
  }

  /// Allocates at least `size` usable bytes, 16-byte aligned.
  ///
  /// `None` when the memory source is exhausted, or before `init`.
  pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
    let table = self.table.get()?;
    let arena = table.arena();
    let total = size.checked_add(HEADER_SIZE)?;
    let growth = Growth {
      source: &self.source,
      arena,
    };

    let heap = table.select(self.cpu.current_processor());
    let block = {
      let mut state = heap.lock();
      match size_to_class(total) {
        Some(class) => unsafe { state.alloc_small(arena, class, &growth) },
        None => unsafe { state.alloc_large(arena, total, &growth) },
      }
    };

    match block {
      Some(block) => Some(arena.user_ptr(block)),
      None => {
        log_quietly(|| log::warn!("cpuheap: out of memory allocating {size} bytes"));
        None
      }
    }
  }

  /// Allocates at least `size` usable bytes aligned to `align`.
  ///
  /// `align` must be a power of two. Up to 16 this is `allocate`. Wider
  /// alignments over-allocate by `align - 16` bytes and return the first
  /// aligned address inside the block, behind a forwarding header that
  /// leads `deallocate` back to the block start.
  pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() {
      return None;
    }
    if align <= MIN_ALIGN {
      return self.allocate(size);
    }

    let block = self.allocate(size.checked_add(align - MIN_ALIGN)?)?;
    let start = block.as_ptr() as usize;
    let gap = match align_up(start, align) {
      Some(aligned) => aligned - start,
      None => {
        unsafe { self.deallocate(block) };
        return None;
      }
    };
    if gap == 0 {
      return Some(block);
    }

    // Both addresses are 16-byte aligned, so `gap >= HEADER_SIZE` and the
    // forwarding header lies inside the block's user area.
    unsafe {
      let aligned = block.add(gap);
      ptr::write(aligned.sub(HEADER_SIZE).cast::<BlockHeader>().as_ptr(), BlockHeader::forward(gap));
      Some(aligned)
    }
  }

  /// Frees a block, returning it to the heap that allocated it.
  ///
  /// # Safety
  /// `ptr` must come from one of this allocator's allocation methods and
  /// must not have been freed since.
  pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
    let Some(table) = self.table.get() else {
      return;
    };
    let arena = table.arena();
    let Some((_, block, header)) = (unsafe { resolve(arena, ptr) }) else {
      return;
    };

    match header.owner() {
      Some(Owner::Superblock { superblock, class }) => {
        let owner = unsafe { Superblock::open(arena, superblock) }.owner();
        if let Some(heap) = table.heap(owner) {
          unsafe { heap.lock().free_small(arena, superblock, class, block) };
        }
      }
      Some(Owner::Heap { heap }) => {
        if let Some(heap) = table.heap(heap) {
          unsafe { heap.lock().free_large(arena, block, header.size()) };
        }
      }
      Some(Owner::Forward { .. }) | None => debug_assert!(false, "deallocate: corrupt header at {ptr:p}"),
    }
  }

  /// Bytes usable through `ptr`: from `ptr` to the end of its block.
  ///
  /// # Safety
  /// As `deallocate`; `ptr` must be live.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let Some(table) = self.table.get() else {
      return 0;
    };
    let Some((start, _, header)) = (unsafe { resolve(table.arena(), ptr) }) else {
      return 0;
    };
    let gap = ptr.as_ptr() as usize - start.as_ptr() as usize;
    header.size().saturating_sub(HEADER_SIZE + gap)
  }

  /// Like `allocate`, with the first `size` bytes zeroed.
  pub fn allocate_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
    self.allocate_zeroed_aligned(size, MIN_ALIGN)
  }

  /// Like `allocate_aligned`, with the first `size` bytes zeroed.
  pub fn allocate_zeroed_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    let ptr = self.allocate_aligned(size, align)?;
    // Recycled blocks carry stale data and free-list links.
    unsafe { ptr.as_ptr().write_bytes(0, size) };
    Some(ptr)
  }

  /// Resizes a block, moving it only if it is too small for `new_size`.
  ///
  /// On failure `None` is returned and `ptr` stays valid and unchanged.
  ///
  /// # Safety
  /// As `deallocate`.
  pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
    unsafe { self.reallocate_aligned(ptr, new_size, MIN_ALIGN) }
  }

  /// Like `reallocate`, keeping the block aligned to `align` if it moves.
  ///
  /// # Safety
  /// As `deallocate`; `ptr` must already be aligned to `align`.
  pub unsafe fn reallocate_aligned(&self, ptr: NonNull<u8>, new_size: usize, align: usize) -> Option<NonNull<u8>> {
    let usable = unsafe { self.usable_size(ptr) };
    if new_size <= usable {
      return Some(ptr);
    }

    let moved = self.allocate_aligned(new_size, align)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), usable);
      self.deallocate(ptr);
    }
    Some(moved)
  }
}

/// The pointer `allocate` returned for the block behind `ptr`, with that
/// block's offset and header. Follows one forwarding header.
///
/// # Safety
/// `ptr` must be live and come from an allocator over `arena`.
unsafe fn resolve(arena: &Arena, ptr: NonNull<u8>) -> Option<(NonNull<u8>, Offset, BlockHeader)> {
  let (block, header) = unsafe { arena.header_of(ptr) }?;
  let Some(Owner::Forward { gap }) = header.owner() else {
    return Some((ptr, block, header));
  };
  let start = NonNull::new(ptr.as_ptr().wrapping_sub(gap))?;
  let (block, header) = unsafe { arena.header_of(start) }?;
  Some((start, block, header))
}

/// Grows the source for one heap, holding the global lock only for the call.
struct Growth<'a, S> {
  source: &'a SpinMutex<S>,
  arena: &'a Arena,
}

impl<S: MemorySource> PageSource for Growth<'_, S> {
  fn grow_pages(&self, pages: usize) -> Option<Offset> {
    let bytes = pages.checked_mul(self.arena.page_size())?;
    let region = self.source.lock().grow(bytes)?;
    // A region below the base has no offset. It is abandoned and the
    // request fails as if the source were exhausted.
    self.arena.offset_of(region)
  }
}

// =============================================================================
// Logging
// =============================================================================

thread_local! {
  static IN_LOG: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` unless this thread is already inside it. A logger may allocate
/// through this allocator, and a failing allocation would log again.
fn log_quietly(f: impl FnOnce()) {
  // TLS may be gone during thread exit; drop the message then.
  let Ok(busy) = IN_LOG.try_with(|flag| flag.replace(true)) else {
    return;
  };
  if busy {
    return;
  }
  f();
  let _ = IN_LOG.try_with(|flag| flag.set(false));
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl<S: MemorySource, C: CpuTopology> GlobalAlloc for Allocator<S, C> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if self.init().is_err() {
      return null_mut();
    }
    self.allocate_aligned(layout.size(), layout.align()).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { self.deallocate(ptr) };
    }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if self.init().is_err() {
      return null_mut();
    }
    self
      .allocate_zeroed_aligned(layout.size(), layout.align())
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    match NonNull::new(ptr) {
      Some(ptr) => unsafe { self.reallocate_aligned(ptr, new_size, layout.align()) }.map_or(null_mut(), NonNull::as_ptr),
      None => null_mut(),
    }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static C_HEAP: Allocator<SbrkSource> = Allocator::new(SbrkSource::new(DEFAULT_CAPACITY), SchedCpu);

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  if C_HEAP.init().is_err() {
    return null_mut();
  }
  C_HEAP.allocate(size).map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if let Some(ptr) = NonNull::new(ptr) {
    unsafe { C_HEAP.deallocate(ptr) };
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  if C_HEAP.init().is_err() {
    return null_mut();
  }
  C_HEAP.allocate_zeroed(total).map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(old) = NonNull::new(ptr) else {
    return unsafe { malloc(size) };
  };

  if size == 0 {
    unsafe { C_HEAP.deallocate(old) };
    return null_mut();
  }

  unsafe { C_HEAP.reallocate(old, size) }.map_or(null_mut(), NonNull::as_ptr)
}

/// `allocate_aligned` on the C heap, initializing it first.
#[cfg(feature = "c_api")]
fn c_alloc_aligned(size: usize, alignment: usize) -> *mut u8 {
  if C_HEAP.init().is_err() {
    return null_mut();
  }
  C_HEAP.allocate_aligned(size, alignment).map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let ptr = c_alloc_aligned(size, alignment);
  if ptr.is_null() {
    return libc::ENOMEM;
  }
  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  c_alloc_aligned(size, alignment)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
  c_alloc_aligned(size, alignment)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  NonNull::new(ptr).map_or(0, |ptr| unsafe { C_HEAP.usable_size(ptr) })
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(v) => Some(v & !mask),
    None => None,
  }
}
