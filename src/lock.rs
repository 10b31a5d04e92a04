//! The lock guarding heaps and the memory source.
//!
//! The allocator can be the process allocator, so taking one of its locks
//! must never allocate. Parking mutexes build their wait queues on the heap
//! the first time a thread blocks; this lock spins instead.

use core::{
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::lock_api::{self, GuardSend, RawMutex};

/// Test-and-test-and-set spin lock.
pub(crate) struct RawSpinLock {
  locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
  #[allow(clippy::declare_interior_mutable_const)]
  const INIT: Self = Self {
    locked: AtomicBool::new(false),
  };

  type GuardMarker = GuardSend;

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      // Wait on a plain load so waiters don't bounce the line between cores.
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  unsafe fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }

  #[inline]
  fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }
}

pub(crate) type SpinMutex<T> = lock_api::Mutex<RawSpinLock, T>;
pub(crate) type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// An unlocked `SpinMutex`, usable in constant contexts.
pub(crate) const fn spin_mutex<T>(value: T) -> SpinMutex<T> {
  SpinMutex::const_new(<RawSpinLock as RawMutex>::INIT, value)
}
