//! Runs the test harness itself, std collections and channels on top of
//! the allocator installed as the process allocator.

use std::alloc::{Layout, alloc, alloc_zeroed, dealloc, realloc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

use cpuheap::{Allocator, CpuTopology, SbrkSource};

/// Puts every thread on one heap so its lock is contended.
struct OneHeap;

impl CpuTopology for OneHeap {
  fn processor_count(&self) -> usize {
    1
  }

  fn current_processor(&self) -> usize {
    0
  }
}

#[global_allocator]
static GLOBAL: Allocator<SbrkSource, OneHeap> = Allocator::new(SbrkSource::new(1 << 30), OneHeap);

#[test]
fn std_runs_on_the_allocator() {
  let boxed = Box::new(7u64);
  assert!(GLOBAL.is_initialized());
  let ptr = core::ptr::NonNull::from(&*boxed).cast::<u8>();
  assert!(unsafe { GLOBAL.usable_size(ptr) } >= size_of::<u64>());
}

#[test]
fn channels_between_threads() {
  let (tx, rx) = mpsc::channel::<String>();
  let senders: Vec<_> = (0..4)
    .map(|id| {
      let tx = tx.clone();
      thread::spawn(move || {
        for i in 0..1_000 {
          tx.send(format!("{id}:{i}")).unwrap();
        }
      })
    })
    .collect();
  drop(tx);

  let received: Vec<String> = rx.iter().collect();
  for sender in senders {
    sender.join().unwrap();
  }
  assert_eq!(received.len(), 4_000);
  assert!(received.iter().any(|m| m == "3:999"));
}

#[test]
fn contended_collection_churn() {
  const THREADS: usize = 16;
  let start = Arc::new(Barrier::new(THREADS));
  let workers: Vec<_> = (0..THREADS)
    .map(|id| {
      let start = Arc::clone(&start);
      thread::spawn(move || {
        start.wait();
        let mut total = 0usize;
        for round in 0..200 {
          let len = (id * 131 + round * 17) % 3000;
          let v: Vec<u32> = (0..len as u32).collect();
          let s: String = v.iter().take(50).map(|n| char::from(b'a' + (n % 26) as u8)).collect();
          let mut map = HashMap::new();
          map.insert(s.clone(), v.clone());
          let tree: BTreeMap<usize, Vec<u32>> = [(len, v)].into_iter().collect();
          total += map[&s].len() + tree[&len].len();
        }
        total
      })
    })
    .collect();

  for (id, worker) in workers.into_iter().enumerate() {
    let expected: usize = (0..200).map(|round| 2 * ((id * 131 + round * 17) % 3000)).sum();
    assert_eq!(worker.join().unwrap(), expected);
  }
}

#[test]
fn over_aligned_layouts() {
  let mut live = Vec::new();
  for shift in 5..=12 {
    let align = 1usize << shift;
    for size in [1, 24, 512, 4000, 9000] {
      let layout = Layout::from_size_align(size, align).unwrap();
      let ptr = unsafe { alloc(layout) };
      assert!(!ptr.is_null(), "size {size} align {align}");
      assert_eq!(ptr as usize % align, 0, "size {size} align {align}");
      unsafe { ptr.write_bytes(shift as u8, size) };
      live.push((ptr, layout));
    }
  }

  for (ptr, layout) in live {
    let bytes = unsafe { core::slice::from_raw_parts(ptr, layout.size()) };
    assert!(bytes.iter().all(|&b| b as usize == layout.align().trailing_zeros() as usize));
    unsafe { dealloc(ptr, layout) };
  }
}

#[test]
fn over_aligned_realloc_and_zeroing() {
  let layout = Layout::from_size_align(100, 256).unwrap();
  unsafe {
    let ptr = alloc_zeroed(layout);
    assert_eq!(ptr as usize % 256, 0);
    assert!(core::slice::from_raw_parts(ptr, 100).iter().all(|&b| b == 0));
    ptr.write_bytes(0x3C, 100);

    let grown = realloc(ptr, layout, 20_000);
    assert_eq!(grown as usize % 256, 0);
    assert!(core::slice::from_raw_parts(grown, 100).iter().all(|&b| b == 0x3C));
    dealloc(grown, Layout::from_size_align(20_000, 256).unwrap());
  }
}

#[repr(align(128))]
struct Padded(u64);

#[test]
fn over_aligned_types_in_collections() {
  let boxes: Vec<Box<Padded>> = (0..500).map(|i| Box::new(Padded(i))).collect();
  for (i, b) in boxes.iter().enumerate() {
    assert_eq!(&**b as *const Padded as usize % 128, 0);
    assert_eq!(b.0, i as u64);
  }
  let flat: Vec<Padded> = (0..500).map(Padded).collect();
  assert_eq!(flat.as_ptr() as usize % 128, 0);
  assert_eq!(flat[499].0, 499);
}
