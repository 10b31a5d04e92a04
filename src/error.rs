//! Error types for allocator setup.
//!
//! Allocation itself never produces an error value: exhaustion is a `None`
//! from `allocate`, and contract violations are not detected.

use std::io;

use thiserror::Error;

/// Failures of a `MemorySource` during setup.
#[derive(Debug, Error)]
pub enum SourceError {
  /// The address range backing the source could not be reserved.
  #[error("could not reserve {bytes} bytes: {source}")]
  Reserve {
    bytes: usize,
    #[source]
    source: io::Error,
  },

  /// The operating system reported a nonsensical page size.
  #[error("operating system reported page size {0}")]
  PageSize(i64),
}

/// Failures of `Allocator::init`. The allocator stays uninitialized and
/// `init` may be called again.
#[derive(Debug, Error)]
pub enum InitError {
  #[error("memory source setup failed")]
  Source(#[from] SourceError),

  /// Page sizes must be powers of two wide enough for a superblock to hold
  /// its header and one block of the widest class.
  #[error("unsupported page size {0}")]
  PageSize(usize),

  /// The source could not supply the pages for the heap table.
  #[error("memory source exhausted while reserving {bytes} bytes for the heap table")]
  Exhausted { bytes: usize },
}
