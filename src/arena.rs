//! Offset addressing into the memory grown from the source.
//!
//! Every structure the allocator keeps in-band (free-list nodes, page-run
//! records, superblock headers, block headers) names other structures by
//! their byte distance from the arena base instead of by raw pointer. The
//! base is the start of the first region grown during init, and the source
//! only ever grows upward from there.

use core::{
  num::NonZeroUsize,
  ptr::{self, NonNull},
};

use crate::size_class::size_to_class;

/// Byte distance from the arena base.
///
/// Never zero: the heap table sits at offset 0, so no block, superblock or
/// page run can live there and `Option<Offset>` costs nothing over `usize`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct Offset(NonZeroUsize);

const _: () = assert!(size_of::<Option<Offset>>() == size_of::<usize>());

impl Offset {
  #[inline]
  pub(crate) const fn new(raw: usize) -> Option<Self> {
    match NonZeroUsize::new(raw) {
      Some(raw) => Some(Self(raw)),
      None => None,
    }
  }

  #[inline(always)]
  pub(crate) const fn get(self) -> usize {
    self.0.get()
  }

  #[inline(always)]
  pub(crate) const fn add(self, bytes: usize) -> Self {
    Self(self.0.saturating_add(bytes))
  }

  /// Distance from `self` up to `higher`.
  #[inline(always)]
  pub(crate) const fn distance_to(self, higher: Offset) -> usize {
    higher.get() - self.get()
  }
}

/// The grown memory and the geometry everything carved from it shares.
#[derive(Debug)]
pub(crate) struct Arena {
  base: NonNull<u8>,
  page_size: usize,
  superblock_size: usize,
}

impl Arena {
  pub(crate) const fn new(base: NonNull<u8>, page_size: usize, superblock_size: usize) -> Self {
    Self {
      base,
      page_size,
      superblock_size,
    }
  }

  #[inline(always)]
  pub(crate) const fn page_size(&self) -> usize {
    self.page_size
  }

  #[inline(always)]
  pub(crate) const fn superblock_size(&self) -> usize {
    self.superblock_size
  }

  #[inline(always)]
  pub(crate) fn base(&self) -> NonNull<u8> {
    self.base
  }

  /// Typed pointer to the structure at `at`.
  #[inline(always)]
  pub(crate) fn at<T>(&self, at: Offset) -> *mut T {
    self.base.as_ptr().wrapping_add(at.get()).cast()
  }

  /// Offset of a pointer the source handed out. `None` for anything at or
  /// below the base, which a monotonic source never produces.
  #[inline]
  pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<Offset> {
    Offset::new((ptr.as_ptr() as usize).checked_sub(self.base.as_ptr() as usize)?)
  }

  /// Pointer handed to the caller for the block at `block`.
  #[inline]
  pub(crate) fn user_ptr(&self, block: Offset) -> NonNull<u8> {
    let ptr = self.at::<u8>(block.add(HEADER_SIZE));
    debug_assert!((ptr as usize) % MIN_ALIGN == 0);
    // SAFETY: `block` is a non-zero offset from a non-null base.
    unsafe { NonNull::new_unchecked(ptr) }
  }

  /// Recovers the block and its header from a pointer `user_ptr` produced.
  ///
  /// # Safety
  /// `ptr` must come from this arena's `user_ptr` and still be live.
  #[inline]
  pub(crate) unsafe fn header_of(&self, ptr: NonNull<u8>) -> Option<(Offset, BlockHeader)> {
    let block = self.offset_of(ptr)?.get().checked_sub(HEADER_SIZE)?;
    let block = Offset::new(block)?;
    Some((block, unsafe { ptr::read(self.at::<BlockHeader>(block)) }))
  }

  /// Stamps `header` at the front of `block`.
  ///
  /// # Safety
  /// `block` must be owned by the caller and at least `HEADER_SIZE` long.
  #[inline]
  pub(crate) unsafe fn write_header(&self, block: Offset, header: BlockHeader) {
    unsafe { ptr::write(self.at::<BlockHeader>(block), header) };
  }
}

// SAFETY: the arena only hands out addresses; every access through them is
// serialized by the lock of the heap owning that memory.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// Alignment of every pointer the allocator returns.
pub(crate) const MIN_ALIGN: usize = 16;

/// Bytes prefixed to every block.
pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE == MIN_ALIGN);

/// Metadata stored immediately before every returned pointer.
///
/// `size` is the full block size (header included): a class width for small
/// blocks, a whole number of pages for large ones. Since every page run is
/// wider than the widest class, `size` alone tells the two apart.
///
/// Over-aligned pointers point into the middle of a block. The header in
/// front of them has `size == 0` and `owner` holding the distance back to
/// the pointer `allocate` returned for that block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockHeader {
  owner: usize,
  size: usize,
}

/// Decoded `BlockHeader::owner`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Owner {
  /// Small block carved from the superblock at this offset.
  Superblock { superblock: Offset, class: usize },
  /// Page run allocated by the heap with this index.
  Heap { heap: usize },
  /// Over-aligned pointer `gap` bytes past the start of a block's user area.
  Forward { gap: usize },
}

/// `size` of a forwarding header. No real block is empty.
const FORWARD: usize = 0;

impl BlockHeader {
  #[inline]
  pub(crate) const fn small(superblock: Offset, size: usize) -> Self {
    Self {
      owner: superblock.get(),
      size,
    }
  }

  #[inline]
  pub(crate) const fn large(heap: usize, size: usize) -> Self {
    Self { owner: heap, size }
  }

  #[inline]
  pub(crate) const fn forward(gap: usize) -> Self {
    Self {
      owner: gap,
      size: FORWARD,
    }
  }

  #[inline(always)]
  pub(crate) const fn size(&self) -> usize {
    self.size
  }

  /// `None` only for a header no allocation of ours could have written.
  #[inline]
  pub(crate) fn owner(&self) -> Option<Owner> {
    if self.size == FORWARD {
      return Some(Owner::Forward { gap: self.owner });
    }
    match size_to_class(self.size) {
      Some(class) => Offset::new(self.owner).map(|superblock| Owner::Superblock { superblock, class }),
      None => Some(Owner::Heap { heap: self.owner }),
    }
  }
}
