//! Driver mirroring a typical malloc workout: small allocations, a free, a
//! reuse, a resize, and a large mmap-path round trip, dumping the arena after
//! each step.

use fitalloc::Allocator;

fn main() {
  let alloc = Allocator::new();

  let p1 = alloc.allocate(100);
  let p2 = alloc.allocate(200);
  println!("after allocate(100) = {p1:?}, allocate(200) = {p2:?}");
  alloc.dump_state();

  unsafe { alloc.free(p1) };
  println!("\nafter free(p1)");
  alloc.dump_state();

  let p3 = alloc.allocate(50);
  println!("\nafter allocate(50) = {p3:?} (reuses p1's block)");
  alloc.dump_state();

  let p2 = unsafe { alloc.resize(p2, 400) };
  println!("\nafter resize(p2, 400) = {p2:?}");
  alloc.dump_state();

  let big = alloc.allocate(200_000);
  println!("\nafter allocate(200000) = {big:?} (mmap path, not in the lists)");
  alloc.dump_state();

  unsafe {
    alloc.free(big);
    alloc.free(p2);
    alloc.free(p3);
  }
  println!("\nafter freeing everything");
  alloc.dump_state();
}
