//! Superblocks: page-backed regions small blocks are carved from.
//!
//! A superblock belongs to one heap for the life of the process. Fresh
//! blocks come off a bump offset; blocks that come back are kept in the
//! superblock's own per-class free lists and handed out again before the
//! bump offset moves.

use core::ptr;

use crate::{
  arena::{Arena, Offset},
  free_list::{self, FreeHeads},
  size_class::{CLASS_COUNT, class_to_size, size_to_class},
};

/// Pages backing one superblock.
pub(crate) const PAGES_IN_SUPERBLOCK: usize = 2;

/// Header at offset 0 of every superblock.
#[repr(C)]
struct Header {
  /// Index of the owning heap. Written once when the superblock is formatted.
  owner: usize,
  /// Bump offset from the superblock start.
  committed: usize,
  free: FreeHeads,
  /// Next superblock of the same heap.
  next: Option<Offset>,
}

/// Bytes reserved for the header. Rounded up to a class width so carved
/// blocks stay aligned to the smallest class.
pub(crate) const SUPERBLOCK_RESERVED: usize = match size_to_class(size_of::<Header>()) {
  Some(class) => class_to_size(class),
  None => panic!("superblock header does not fit a size class"),
};

/// Handle to a formatted superblock.
#[derive(Clone, Copy)]
pub(crate) struct Superblock<'a> {
  arena: &'a Arena,
  at: Offset,
}

impl<'a> Superblock<'a> {
  /// Writes an empty header at `at` and returns a handle to it.
  ///
  /// # Safety
  /// `at` must start `arena.superblock_size()` bytes owned by the caller,
  /// who holds the lock of heap `owner`.
  pub(crate) unsafe fn format(arena: &'a Arena, at: Offset, owner: usize) -> Self {
    let header = Header {
      owner,
      committed: SUPERBLOCK_RESERVED,
      free: [None; CLASS_COUNT],
      next: None,
    };
    unsafe { ptr::write(arena.at::<Header>(at), header) };
    Self { arena, at }
  }

  /// # Safety
  /// `at` must name a formatted superblock. Every method except `owner`
  /// additionally needs the owning heap's lock held while the handle is used.
  #[inline]
  pub(crate) unsafe fn open(arena: &'a Arena, at: Offset) -> Self {
    Self { arena, at }
  }

  #[inline(always)]
  fn header(&self) -> *mut Header {
    self.arena.at(self.at)
  }

  #[inline(always)]
  pub(crate) fn offset(&self) -> Offset {
    self.at
  }

  /// Heap this superblock belongs to. Immutable after `format`, so this may
  /// be read without any lock.
  #[inline]
  pub(crate) fn owner(&self) -> usize {
    unsafe { (&raw const (*self.header()).owner).read() }
  }

  #[inline]
  pub(crate) fn next(&self) -> Option<Offset> {
    unsafe { (*self.header()).next }
  }

  #[inline]
  pub(crate) fn set_next(&self, next: Option<Offset>) {
    unsafe { (*self.header()).next = next };
  }

  /// Whether `size` more bytes fit below the end of the superblock.
  #[inline]
  pub(crate) fn has_room(&self, size: usize) -> bool {
    let committed = unsafe { (*self.header()).committed };
    committed + size <= self.arena.superblock_size()
  }

  /// Carves `size` never-used bytes off the bump offset. Check `has_room` first.
  #[inline]
  pub(crate) fn bump(&self, size: usize) -> Offset {
    let header = self.header();
    unsafe {
      let block = self.at.add((*header).committed);
      (*header).committed += size;
      block
    }
  }

  /// Reuses a free block for `class`.
  ///
  /// Takes the lowest-addressed block of the smallest non-empty class at or
  /// above `class`. A block from a wider class is halved down to `class`;
  /// each upper half goes back to the list one class below the one halved.
  pub(crate) fn take_free(&self, class: usize) -> Option<Offset> {
    let free = unsafe { &mut (*self.header()).free };
    let found = (class..CLASS_COUNT).find(|&c| free[c].is_some())?;
    let block = unsafe { free_list::pop_front(self.arena, free, found) }?;

    for halved in (class + 1..=found).rev() {
      let upper = block.add(class_to_size(halved) / 2);
      unsafe { free_list::insert(self.arena, free, halved - 1, upper) };
    }
    Some(block)
  }

  /// Returns a block of `class` to this superblock, coalescing as it goes.
  ///
  /// # Safety
  /// `block` must have been carved from this superblock as a `class` block
  /// and must not be free already.
  #[inline]
  pub(crate) unsafe fn release(&self, class: usize, block: Offset) {
    let free = unsafe { &mut (*self.header()).free };
    unsafe { free_list::insert(self.arena, free, class, block) };
  }
}
