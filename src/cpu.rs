//! Which processor the calling thread is running on.

use core::sync::atomic::{AtomicU32, Ordering};

/// Processor identity, as far as the allocator needs it.
///
/// `current_processor` is a hint: the thread may migrate right after the
/// call. It only decides which heap serves an allocation.
pub trait CpuTopology: Sync {
  /// Number of heaps to create. Read once, during init.
  fn processor_count(&self) -> usize;

  /// Id of the processor running the caller. Reduced modulo the heap count.
  fn current_processor(&self) -> usize;
}

/// The host's processors, as reported by the kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedCpu;

impl CpuTopology for SchedCpu {
  fn processor_count(&self) -> usize {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    usize::try_from(count).unwrap_or(1).max(1)
  }

  #[inline]
  fn current_processor(&self) -> usize {
    cpu_id()
  }
}

/// Stand-in processor id for targets without `sched_getcpu`: a number
/// handed out once per thread.
#[cfg_attr(target_os = "linux", allow(dead_code))]
fn thread_ordinal() -> u32 {
  thread_local! {
    static ORDINAL: u32 = {
      static NEXT: AtomicU32 = AtomicU32::new(0);
      NEXT.fetch_add(1, Ordering::Relaxed)
    };
  }
  // Threads being torn down have lost their slot; heap 0 serves them.
  ORDINAL.try_with(|&id| id).unwrap_or(0)
}

// RDPID reads IA32_TSC_AUX, where Linux keeps the processor number in the
// low 12 bits. Faults on CPUs without the instruction, hence opt-in.
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
fn cpu_id() -> usize {
  let cpu: u64;
  unsafe {
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
fn cpu_id() -> usize {
  // -1 when the kernel cannot tell; any heap will do then.
  usize::try_from(unsafe { libc::sched_getcpu() }).unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn cpu_id() -> usize {
  thread_ordinal() as usize
}
