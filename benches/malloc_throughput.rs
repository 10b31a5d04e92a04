use core::ptr::NonNull;
use std::hint::black_box;

use cpuheap::{Allocator, SbrkSource, SchedCpu};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

const OPS: u64 = 100_000;

static HEAP: Allocator<SbrkSource> = Allocator::new(SbrkSource::new(1 << 30), SchedCpu);

/// cpuheap alloc/free throughput.
fn cpuheap_malloc_free(size: usize) {
  for _ in 0..OPS {
    let ptr = HEAP.allocate(size);
    black_box(ptr);
    if let Some(ptr) = ptr {
      unsafe { HEAP.deallocate(ptr) };
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Allocates a batch, then frees it in reverse so neighbours merge.
fn cpuheap_batch(size: usize, batch: &mut Vec<NonNull<u8>>) {
  for _ in 0..OPS / 100 {
    batch.extend((0..100).filter_map(|_| HEAP.allocate(size)));
    while let Some(ptr) = batch.pop() {
      unsafe { HEAP.deallocate(ptr) };
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  HEAP.init().expect("cpuheap init");
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4080, 16384] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("cpuheap", size), &size, |b, &size| {
      b.iter(|| cpuheap_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();

  let mut group = c.benchmark_group("malloc_batch");
  let mut batch = Vec::with_capacity(100);
  for size in [16, 240, 2032] {
    group.throughput(Throughput::Elements(OPS));
    group.bench_with_input(BenchmarkId::new("cpuheap", size), &size, |b, &size| {
      b.iter(|| cpuheap_batch(size, &mut batch))
    });
  }
  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput);
criterion_main!(benches);
