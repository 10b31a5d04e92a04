//! Page runs: whole-page spans a heap has reclaimed.
//!
//! Large blocks hand their pages back here when freed. The same runs feed
//! later large requests and new superblocks before the heap falls back to
//! growing the memory source. Runs are never merged with each other.

use core::ptr;

use crate::{
  align_up,
  arena::{Arena, Offset},
};

/// Record written over the first page of a free run.
#[repr(C)]
#[derive(Clone, Copy)]
struct FreePageRun {
  pages: usize,
  prev: Option<Offset>,
  next: Option<Offset>,
}

/// One heap's free runs, most recently freed first.
#[derive(Debug, Default)]
pub(crate) struct PageRuns {
  head: Option<Offset>,
}

impl PageRuns {
  pub(crate) const fn new() -> Self {
    Self { head: None }
  }

  /// Takes `pages` pages from the first run large enough.
  ///
  /// A run of exactly `pages` is unlinked whole. A longer run gives up its
  /// front pages: its record moves up to the first remaining page and its
  /// neighbours are pointed at the new position.
  ///
  /// # Safety
  /// Every run on the list must lie in `arena`, and the caller must hold
  /// the lock of the heap owning this list.
  pub(crate) unsafe fn take(&mut self, arena: &Arena, pages: usize) -> Option<Offset> {
    let mut cur = self.head;
    while let Some(at) = cur {
      let run = unsafe { ptr::read(arena.at::<FreePageRun>(at)) };
      if run.pages == pages {
        unsafe { self.relink(arena, run.prev, run.next, run.next, run.prev) };
        return Some(at);
      }
      if run.pages > pages {
        let rest = at.add(pages * arena.page_size());
        unsafe {
          ptr::write(
            arena.at::<FreePageRun>(rest),
            FreePageRun {
              pages: run.pages - pages,
              ..run
            },
          );
          self.relink(arena, run.prev, run.next, Some(rest), Some(rest));
        }
        return Some(at);
      }
      cur = run.next;
    }
    None
  }

  /// Prepends the `pages`-page run starting at `at`.
  ///
  /// # Safety
  /// The run must lie in `arena`, be unused, and the caller must hold the
  /// lock of the heap owning this list.
  pub(crate) unsafe fn give(&mut self, arena: &Arena, at: Offset, pages: usize) {
    let run = FreePageRun {
      pages,
      prev: None,
      next: self.head,
    };
    unsafe {
      ptr::write(arena.at::<FreePageRun>(at), run);
      if let Some(head) = self.head {
        (*arena.at::<FreePageRun>(head)).prev = Some(at);
      }
    }
    self.head = Some(at);
  }

  /// Points `prev.next` (or the head) at `after_prev` and `next.prev` at `before_next`.
  unsafe fn relink(
    &mut self,
    arena: &Arena,
    prev: Option<Offset>,
    next: Option<Offset>,
    after_prev: Option<Offset>,
    before_next: Option<Offset>,
  ) {
    match prev {
      Some(prev) => unsafe { (*arena.at::<FreePageRun>(prev)).next = after_prev },
      None => self.head = after_prev,
    }
    if let Some(next) = next {
      unsafe { (*arena.at::<FreePageRun>(next)).prev = before_next };
    }
  }
}

/// Bytes and pages a large block of `size` bytes (header included) spans:
/// rounded to 8 bytes, then to whole pages.
pub(crate) const fn large_extent(size: usize, page_size: usize) -> Option<(usize, usize)> {
  let Some(words) = align_up(size, 8) else {
    return None;
  };
  let Some(bytes) = align_up(words, page_size) else {
    return None;
  };
  Some((bytes, bytes / page_size))
}
