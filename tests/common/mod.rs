#![allow(dead_code)]

use core::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use cpuheap::{CpuTopology, MemorySource, SbrkSource, SourceError};

/// Wraps an `SbrkSource`, counting calls and optionally failing setup.
#[derive(Debug)]
pub struct CountingSource {
  inner: SbrkSource,
  pub inits: usize,
  pub grows: usize,
  pub grown_bytes: usize,
  pub failing_inits: usize,
}

impl CountingSource {
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: SbrkSource::new(capacity),
      inits: 0,
      grows: 0,
      grown_bytes: 0,
      failing_inits: 0,
    }
  }

  pub fn failing_first(capacity: usize, failures: usize) -> Self {
    Self {
      failing_inits: failures,
      ..Self::new(capacity)
    }
  }
}

impl MemorySource for CountingSource {
  fn init(&mut self) -> Result<(), SourceError> {
    self.inits += 1;
    if self.failing_inits > 0 {
      self.failing_inits -= 1;
      return Err(SourceError::PageSize(-1));
    }
    self.inner.init()
  }

  fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    self.grows += 1;
    let region = self.inner.grow(bytes)?;
    self.grown_bytes += bytes;
    Some(region)
  }

  fn page_size(&self) -> usize {
    self.inner.page_size()
  }
}

/// A topology whose current processor is set by the test.
#[derive(Debug)]
pub struct PinnedCpu {
  count: usize,
  current: AtomicUsize,
}

impl PinnedCpu {
  pub fn new(count: usize) -> Self {
    Self {
      count,
      current: AtomicUsize::new(0),
    }
  }

  pub fn pin(&self, cpu: usize) {
    self.current.store(cpu, Ordering::Relaxed);
  }
}

impl CpuTopology for PinnedCpu {
  fn processor_count(&self) -> usize {
    self.count
  }

  fn current_processor(&self) -> usize {
    self.current.load(Ordering::Relaxed)
  }
}

/// Spreads threads over `count` processors round robin, whatever the host has.
#[derive(Debug)]
pub struct ThreadCpu {
  count: usize,
}

impl ThreadCpu {
  pub fn new(count: usize) -> Self {
    Self { count }
  }
}

impl CpuTopology for ThreadCpu {
  fn processor_count(&self) -> usize {
    self.count
  }

  fn current_processor(&self) -> usize {
    thread_local! {
      static ID: u32 = {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        NEXT.fetch_add(1, Ordering::Relaxed)
      };
    }
    ID.with(|&id| id as usize)
  }
}

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
  state: u64,
}

impl XorShift64 {
  pub fn new(seed: u64) -> Self {
    Self { state: seed.max(1) }
  }

  pub fn next_u64(&mut self) -> u64 {
    let mut x = self.state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    self.state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
  }

  pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
    assert!(low <= high_inclusive);
    let span = high_inclusive - low + 1;
    low + (self.next_u64() as usize % span)
  }
}

pub fn addr(ptr: NonNull<u8>) -> usize {
  ptr.as_ptr() as usize
}
