//! The raw memory the allocator grows into.

use core::ptr::{NonNull, null_mut};
use std::io;

use crate::{align_up, error::SourceError};

/// Monotonic, page-granular memory growth.
///
/// The allocator keeps a source behind its global growth lock, so `grow`
/// never runs concurrently with itself.
///
/// Growth must be monotonic. The first region `grow` returns becomes the
/// arena base and every later one is addressed by its distance from it, so
/// later regions must lie above the base and should start where the
/// previous one ended. A region returned below the base cannot be
/// addressed: the allocator abandons it and fails that request as if the
/// source were exhausted.
pub trait MemorySource: Send {
  /// One-time setup. Called again if a previous allocator init failed after
  /// this succeeded, so a second call must be harmless.
  fn init(&mut self) -> Result<(), SourceError>;

  /// Extends the source by `bytes` (a multiple of `page_size`) and returns
  /// the start of the new region, or `None` once the source is exhausted.
  fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>>;

  /// Page size in bytes. Only consulted after a successful `init`.
  fn page_size(&self) -> usize;
}

/// Capacity reserved by sources built with `SbrkSource::default`.
pub const DEFAULT_CAPACITY: usize = 1 << 30; // 1GB

/// A break-pointer source over one address range reserved at `init`.
///
/// The range is mapped lazily by the kernel, so reserving a large capacity
/// costs nothing until pages are touched. Memory is never given back before
/// the source is dropped.
#[derive(Debug)]
pub struct SbrkSource {
  capacity: usize,
  base: *mut u8,
  brk: usize,
  page_size: usize,
}

// SAFETY: the source exclusively owns its mapping.
unsafe impl Send for SbrkSource {}

impl SbrkSource {
  /// A source that will reserve `capacity` bytes (rounded up to pages).
  pub const fn new(capacity: usize) -> Self {
    Self {
      capacity,
      base: null_mut(),
      brk: 0,
      page_size: 0,
    }
  }

  /// Bytes handed out so far.
  pub fn committed(&self) -> usize {
    self.brk
  }

  /// Bytes reserved, or 0 before `init`.
  pub fn capacity(&self) -> usize {
    if self.base.is_null() { 0 } else { self.capacity }
  }
}

impl Default for SbrkSource {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

impl MemorySource for SbrkSource {
  fn init(&mut self) -> Result<(), SourceError> {
    if !self.base.is_null() {
      return Ok(());
    }

    let page_size = os_page_size()?;
    let capacity = align_up(self.capacity.max(page_size), page_size).ok_or_else(|| SourceError::Reserve {
      bytes: self.capacity,
      source: io::Error::from_raw_os_error(libc::ENOMEM),
    })?;
    let base = unsafe { os_mmap(capacity) };
    if base.is_null() {
      return Err(SourceError::Reserve {
        bytes: capacity,
        source: io::Error::last_os_error(),
      });
    }

    self.base = base;
    self.capacity = capacity;
    self.page_size = page_size;
    self.brk = 0;
    Ok(())
  }

  fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    if self.base.is_null() {
      return None;
    }
    let end = self.brk.checked_add(bytes)?;
    if end > self.capacity {
      return None;
    }
    let region = self.base.wrapping_add(self.brk);
    self.brk = end;
    NonNull::new(region)
  }

  fn page_size(&self) -> usize {
    self.page_size
  }
}

impl Drop for SbrkSource {
  fn drop(&mut self) {
    if !self.base.is_null() {
      unsafe { os_munmap(self.base, self.capacity) };
    }
  }
}

// =============================================================================
// Platform
// =============================================================================

fn os_page_size() -> Result<usize, SourceError> {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  match usize::try_from(size) {
    Ok(size) if size.is_power_of_two() => Ok(size),
    _ => Err(SourceError::PageSize(size as i64)),
  }
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
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

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}
