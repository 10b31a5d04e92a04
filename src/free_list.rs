//! Address-ordered free lists, one per size class per superblock.
//!
//! Nodes are doubly linked through the first bytes of the freed blocks
//! themselves. Keeping each list sorted by address makes a block's list
//! neighbours its nearest free same-class blocks in memory, which is what
//! the coalescing check relies on.

use core::ptr;

use crate::{
  arena::{Arena, Offset},
  size_class::{CLASS_COUNT, class_to_size},
};

/// List node written over the front of a reclaimed block.
#[repr(C)]
#[derive(Clone, Copy)]
struct FreeBlock {
  prev: Option<Offset>,
  next: Option<Offset>,
}

/// Heads of one superblock's lists, indexed by class.
pub(crate) type FreeHeads = [Option<Offset>; CLASS_COUNT];

#[inline(always)]
fn node(arena: &Arena, at: Offset) -> *mut FreeBlock {
  arena.at(at)
}

/// Removes and returns the lowest-addressed block of `class`.
///
/// # Safety
/// `heads` must describe well-formed lists in `arena`, and the caller must
/// hold the lock of the heap owning them.
pub(crate) unsafe fn pop_front(arena: &Arena, heads: &mut FreeHeads, class: usize) -> Option<Offset> {
  let block = heads[class]?;
  unsafe { unlink(arena, heads, class, block) };
  Some(block)
}

/// Inserts `block` into `class` and merges it upward.
///
/// After linking, a list neighbour exactly one class width away is a free
/// buddy: both leave the list and the lower of the two re-enters one class
/// up, where the same check repeats. Stops at the top class, which has
/// nothing to promote into.
///
/// # Safety
/// As `pop_front`; additionally `block` must be a free block of `class`
/// width inside the superblock `heads` belongs to, and not already listed.
pub(crate) unsafe fn insert(arena: &Arena, heads: &mut FreeHeads, mut class: usize, mut block: Offset) {
  loop {
    let (prev, next) = unsafe { link_sorted(arena, heads, class, block) };
    if class + 1 == CLASS_COUNT {
      return;
    }

    let width = class_to_size(class);
    let buddy = match (prev, next) {
      (Some(prev), _) if prev.distance_to(block) == width => prev,
      (_, Some(next)) if block.distance_to(next) == width => next,
      _ => return,
    };

    unsafe {
      unlink(arena, heads, class, block);
      unlink(arena, heads, class, buddy);
    }
    block = block.min(buddy);
    class += 1;
  }
}

/// Links `block` in front of the first entry above it and returns the
/// neighbours it ended up between.
unsafe fn link_sorted(
  arena: &Arena,
  heads: &mut FreeHeads,
  class: usize,
  block: Offset,
) -> (Option<Offset>, Option<Offset>) {
  let mut prev = None;
  let mut next = heads[class];
  while let Some(at) = next {
    if block < at {
      break;
    }
    prev = Some(at);
    next = unsafe { (*node(arena, at)).next };
  }

  unsafe {
    ptr::write(node(arena, block), FreeBlock { prev, next });
    match prev {
      Some(prev) => (*node(arena, prev)).next = Some(block),
      None => heads[class] = Some(block),
    }
    if let Some(next) = next {
      (*node(arena, next)).prev = Some(block);
    }
  }
  (prev, next)
}

unsafe fn unlink(arena: &Arena, heads: &mut FreeHeads, class: usize, block: Offset) {
  let FreeBlock { prev, next } = unsafe { ptr::read(node(arena, block)) };
  unsafe {
    match prev {
      Some(prev) => (*node(arena, prev)).next = next,
      None => heads[class] = next,
    }
    if let Some(next) = next {
      (*node(arena, next)).prev = prev;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::ptr::NonNull;

  struct Fixture {
    _buf: Vec<u128>,
    arena: Arena,
    heads: FreeHeads,
  }

  impl Fixture {
    fn new() -> Self {
      let mut buf = vec![0u128; 1024]; // 16KB
      let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
      Self {
        _buf: buf,
        arena: Arena::new(base, 4096, 16384),
        heads: [None; CLASS_COUNT],
      }
    }

    fn insert(&mut self, class: usize, at: usize) {
      unsafe { insert(&self.arena, &mut self.heads, class, Offset::new(at).unwrap()) };
    }

    /// Walks `class` forward, checking every back link on the way.
    fn list(&self, class: usize) -> Vec<usize> {
      let mut out = Vec::new();
      let mut prev = None;
      let mut cur = self.heads[class];
      while let Some(at) = cur {
        let node = unsafe { ptr::read(node(&self.arena, at)) };
        assert_eq!(node.prev, prev, "broken back link at {}", at.get());
        out.push(at.get());
        prev = Some(at);
        cur = node.next;
      }
      out
    }
  }

  #[test]
  fn keeps_address_order() {
    let mut f = Fixture::new();
    f.insert(0, 512);
    f.insert(0, 128);
    f.insert(0, 320);
    f.insert(0, 1024);
    assert_eq!(f.list(0), vec![128, 320, 512, 1024]);
  }

  #[test]
  fn merges_with_lower_neighbour() {
    let mut f = Fixture::new();
    f.insert(0, 64);
    f.insert(0, 96);
    assert!(f.list(0).is_empty());
    assert_eq!(f.list(1), vec![64]);
  }

  #[test]
  fn merges_with_upper_neighbour() {
    let mut f = Fixture::new();
    f.insert(0, 512);
    f.insert(0, 96);
    f.insert(0, 64);
    assert_eq!(f.list(0), vec![512]);
    assert_eq!(f.list(1), vec![64]);
  }

  #[test]
  fn merge_cascades_upward() {
    let mut f = Fixture::new();
    f.insert(0, 64);
    f.insert(0, 96);
    f.insert(0, 128);
    f.insert(0, 160);
    assert!(f.list(0).is_empty());
    assert!(f.list(1).is_empty());
    assert_eq!(f.list(2), vec![64]);
  }

  #[test]
  fn distance_must_match_class_width() {
    let mut f = Fixture::new();
    f.insert(0, 64);
    f.insert(0, 128);
    f.insert(1, 256);
    f.insert(1, 384);
    assert_eq!(f.list(0), vec![64, 128]);
    assert_eq!(f.list(1), vec![256, 384]);
  }

  #[test]
  fn top_class_never_merges() {
    let mut f = Fixture::new();
    let top = CLASS_COUNT - 1;
    f.insert(top, 4096);
    f.insert(top, 8192);
    assert_eq!(f.list(top), vec![4096, 8192]);
  }

  #[test]
  fn pop_front_takes_lowest_and_relinks() {
    let mut f = Fixture::new();
    f.insert(2, 1024);
    f.insert(2, 256);
    f.insert(2, 2048);
    let popped = unsafe { pop_front(&f.arena, &mut f.heads, 2) };
    assert_eq!(popped.map(Offset::get), Some(256));
    assert_eq!(f.list(2), vec![1024, 2048]);
    assert!(unsafe { pop_front(&f.arena, &mut f.heads, 3) }.is_none());
  }
}
