//! Fixed size class ladder for small blocks.
//!
//! Every class is exactly twice the width of the one below it. Splitting a
//! block halves it into the next class down and coalescing two neighbours
//! promotes them into the next class up, so the doubling is load-bearing.

/// Number of small size classes.
pub const CLASS_COUNT: usize = 8;

/// Block width of each class, header included.
pub const CLASS_SIZES: [usize; CLASS_COUNT] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Widest small block. Anything larger goes down the page-run path.
pub const MAX_CLASS_SIZE: usize = CLASS_SIZES[CLASS_COUNT - 1];

const fn ladder_doubles() -> bool {
  let mut class = 1;
  while class < CLASS_COUNT {
    if CLASS_SIZES[class] != CLASS_SIZES[class - 1] * 2 {
      return false;
    }
    class += 1;
  }
  true
}

const _: () = assert!(ladder_doubles());
const _: () = assert!(CLASS_SIZES[0].is_power_of_two());
// A free block must hold its two list links.
const _: () = assert!(CLASS_SIZES[0] >= 2 * size_of::<usize>());

/// Index of the smallest class whose width is at least `size`.
///
/// Scans the ladder upward and returns the first match; `None` means the
/// request belongs to the page-run path.
#[inline]
pub const fn size_to_class(size: usize) -> Option<usize> {
  let mut class = 0;
  while class < CLASS_COUNT {
    if size <= CLASS_SIZES[class] {
      return Some(class);
    }
    class += 1;
  }
  None
}

/// Block width of `class`.
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  CLASS_SIZES[class]
}
