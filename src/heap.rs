//! Per-processor heaps and the table holding them.
//!
//! Each heap owns a lock, the superblocks it has created and the page runs
//! it has reclaimed. A block stays with the heap that allocated it, so a
//! free issued from another processor locks the owner's heap, never its own.
//!
//! Lock order: a thread holds at most one heap lock, and the global growth
//! lock is only ever taken inside it (see `PageSource`).

use core::{ptr::NonNull, slice};

use crate::{
  arena::{Arena, BlockHeader, Offset},
  lock::{SpinMutex, SpinMutexGuard, spin_mutex},
  pages::{PageRuns, large_extent},
  size_class::class_to_size,
  superblock::{PAGES_IN_SUPERBLOCK, Superblock},
};

/// Fresh pages for a heap whose own runs cannot satisfy a request.
pub(crate) trait PageSource {
  /// Grows the memory source by `pages` whole pages.
  ///
  /// Implementations take the global growth lock for the growth call only.
  fn grow_pages(&self, pages: usize) -> Option<Offset>;
}

/// One processor's partition of allocator state.
///
/// Cache-line aligned so neighbouring heaps' locks never share a line.
#[repr(C, align(64))]
pub(crate) struct ProcessorHeap {
  state: SpinMutex<HeapState>,
}

impl ProcessorHeap {
  #[inline]
  pub(crate) fn lock(&self) -> SpinMutexGuard<'_, HeapState> {
    self.state.lock()
  }
}

/// Everything a heap's lock protects.
pub(crate) struct HeapState {
  index: usize,
  /// First superblock; the rest hang off each header's `next`.
  superblocks: Option<Offset>,
  runs: PageRuns,
}

impl HeapState {
  const fn new(index: usize) -> Self {
    Self {
      index,
      superblocks: None,
      runs: PageRuns::new(),
    }
  }

  /// Allocates a `class` block and stamps its header.
  ///
  /// Reuse first: the first superblock holding a free block of `class` or
  /// wider serves it. Otherwise the first superblock with bump room, or a
  /// new one appended to the list. `None` only if no superblock could be
  /// obtained, in which case nothing has changed.
  ///
  /// # Safety
  /// `arena` must be the arena this heap was built in.
  pub(crate) unsafe fn alloc_small(
    &mut self,
    arena: &Arena,
    class: usize,
    source: &impl PageSource,
  ) -> Option<Offset> {
    let size = class_to_size(class);
    let (superblock, block) = match unsafe { self.reuse(arena, class) } {
      Some(found) => found,
      None => {
        let superblock = unsafe { self.superblock_with_room(arena, size, source) }?;
        (superblock.offset(), superblock.bump(size))
      }
    };

    unsafe { arena.write_header(block, BlockHeader::small(superblock, size)) };
    Some(block)
  }

  /// First free block for `class` across superblocks, in list order.
  unsafe fn reuse(&self, arena: &Arena, class: usize) -> Option<(Offset, Offset)> {
    let mut cur = self.superblocks;
    while let Some(at) = cur {
      let superblock = unsafe { Superblock::open(arena, at) };
      if let Some(block) = superblock.take_free(class) {
        return Some((at, block));
      }
      cur = superblock.next();
    }
    None
  }

  unsafe fn superblock_with_room<'a>(
    &mut self,
    arena: &'a Arena,
    size: usize,
    source: &impl PageSource,
  ) -> Option<Superblock<'a>> {
    let mut tail = None;
    let mut cur = self.superblocks;
    while let Some(at) = cur {
      let superblock = unsafe { Superblock::open(arena, at) };
      if superblock.has_room(size) {
        return Some(superblock);
      }
      tail = Some(superblock);
      cur = superblock.next();
    }

    let at = unsafe { self.alloc_pages(arena, PAGES_IN_SUPERBLOCK, source) }?;
    let superblock = unsafe { Superblock::format(arena, at, self.index) };
    match tail {
      Some(tail) => tail.set_next(Some(at)),
      None => self.superblocks = Some(at),
    }
    Some(superblock)
  }

  /// Pages from this heap's free runs, else from the memory source.
  unsafe fn alloc_pages(&mut self, arena: &Arena, pages: usize, source: &impl PageSource) -> Option<Offset> {
    unsafe { self.runs.take(arena, pages) }.or_else(|| source.grow_pages(pages))
  }

  /// Returns a small block to the superblock it was carved from.
  ///
  /// # Safety
  /// `block` must be a live `class` block carved from `superblock`, which
  /// must belong to this heap.
  #[inline]
  pub(crate) unsafe fn free_small(&mut self, arena: &Arena, superblock: Offset, class: usize, block: Offset) {
    debug_assert_eq!(unsafe { Superblock::open(arena, superblock) }.owner(), self.index);
    unsafe { Superblock::open(arena, superblock).release(class, block) };
  }

  /// Allocates a page run for `size` bytes (header included) and stamps its header.
  ///
  /// # Safety
  /// As `alloc_small`.
  pub(crate) unsafe fn alloc_large(&mut self, arena: &Arena, size: usize, source: &impl PageSource) -> Option<Offset> {
    let (bytes, pages) = large_extent(size, arena.page_size())?;
    let run = unsafe { self.alloc_pages(arena, pages, source) }?;
    unsafe { arena.write_header(run, BlockHeader::large(self.index, bytes)) };
    Some(run)
  }

  /// Takes back a page run this heap allocated.
  ///
  /// # Safety
  /// `run` must be a live large block of `bytes` bytes allocated by this heap.
  #[inline]
  pub(crate) unsafe fn free_large(&mut self, arena: &Arena, run: Offset, bytes: usize) {
    unsafe { self.runs.give(arena, run, bytes / arena.page_size()) };
  }
}

/// All heaps, laid out in the first pages of the arena.
pub(crate) struct HeapTable {
  arena: Arena,
  heaps: NonNull<ProcessorHeap>,
  len: usize,
}

// SAFETY: each heap's state is only reached through its mutex.
unsafe impl Send for HeapTable {}
unsafe impl Sync for HeapTable {}

impl HeapTable {
  /// Pages the table needs for `count` heaps.
  pub(crate) const fn pages_for(count: usize, page_size: usize) -> usize {
    (count * size_of::<ProcessorHeap>()).div_ceil(page_size)
  }

  /// Writes `count` empty heaps at the arena base.
  ///
  /// # Safety
  /// The first `pages_for(count, ..)` pages of `arena` must be grown,
  /// page-aligned and reserved for the table.
  pub(crate) unsafe fn build(arena: Arena, count: usize) -> Self {
    debug_assert!(count > 0);
    let heaps = arena.base().cast::<ProcessorHeap>();
    for index in 0..count {
      let heap = ProcessorHeap {
        state: spin_mutex(HeapState::new(index)),
      };
      unsafe { heaps.add(index).write(heap) };
    }
    Self {
      arena,
      heaps,
      len: count,
    }
  }

  #[inline(always)]
  pub(crate) fn arena(&self) -> &Arena {
    &self.arena
  }

  #[inline]
  pub(crate) fn heaps(&self) -> &[ProcessorHeap] {
    unsafe { slice::from_raw_parts(self.heaps.as_ptr(), self.len) }
  }

  /// Heap serving allocations from `processor`.
  #[inline]
  pub(crate) fn select(&self, processor: usize) -> &ProcessorHeap {
    &self.heaps()[processor % self.len]
  }

  #[inline]
  pub(crate) fn heap(&self, index: usize) -> Option<&ProcessorHeap> {
    self.heaps().get(index)
  }
}
