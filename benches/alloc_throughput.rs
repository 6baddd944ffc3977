use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fitalloc::Allocator;
use std::hint::black_box;

const OPS: u64 = 100_000;

static ALLOC: Allocator = Allocator::new();

/// fitalloc alloc/free throughput.
fn fitalloc_alloc_free(size: usize) {
  for _ in 0..OPS {
    let ptr = ALLOC.allocate(size);
    black_box(ptr);
    unsafe { ALLOC.free(ptr) };
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

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  // 200KB rides the mmap bypass; everything else is arena-path.
  for size in [16, 64, 256, 1024, 4096, 200 * 1024] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("fitalloc", size), &size, |b, &size| {
      b.iter(|| fitalloc_alloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
