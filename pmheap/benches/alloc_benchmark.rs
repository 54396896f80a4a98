//! Run with:
//!   cargo bench --bench alloc_benchmark

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use pmheap::{AnonymousRegion, DurabilityMode, Heap, HeapSettings};

fn heap(durability: DurabilityMode) -> (Arc<AnonymousRegion>, Heap) {
    let region = Arc::new(
        AnonymousRegion::new(512 << 20).expect("map benchmark region"),
    );
    let settings = HeapSettings {
        durability,
        ..Default::default()
    };
    let heap = Heap::start(region.clone(), settings).expect("start heap");
    (region, heap)
}

fn bench_small_churn(c: &mut Criterion) {
    let (_region, heap) = heap(DurabilityMode::LogAndFlush);
    let mut ctx = heap.thread_context();

    c.bench_function("thread_cache_alloc_free_32", |b| {
        b.iter(|| {
            let ptr = ctx.allocate(black_box(32)).expect("allocate");
            ctx.release(ptr);
        });
    });

    c.bench_function("global_alloc_free_32", |b| {
        b.iter(|| {
            let ptr = heap.allocate(black_box(32)).expect("allocate");
            heap.release(ptr);
        });
    });
}

fn bench_large_churn(c: &mut Criterion) {
    for (name, mode) in [
        ("large_alloc_free_logged", DurabilityMode::LogAndFlush),
        ("large_alloc_free_volatile", DurabilityMode::Volatile),
    ] {
        let (_region, heap) = heap(mode);
        c.bench_function(name, |b| {
            b.iter(|| {
                let ptr = heap.allocate(black_box(20_000)).expect("allocate");
                heap.release(ptr);
            });
        });
    }
}

fn bench_offline_collection(c: &mut Criterion) {
    let (_region, heap) = heap(DurabilityMode::Volatile);

    // a rooted linked list of 10k nodes plus as much garbage
    let mut head: *mut u8 = std::ptr::null_mut();
    for _ in 0..10_000 {
        let node = heap.allocate(32).expect("allocate");
        // SAFETY: freshly allocated 32 byte object
        unsafe { (node.as_ptr() as *mut usize).write(head as usize) };
        head = node.as_ptr();
        heap.allocate(48).expect("allocate");
    }
    heap.set_persistent_root(0, head);

    c.bench_function("collect_offline_10k_live", |b| {
        b.iter(|| assert!(heap.collect_offline()));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_small_churn, bench_large_churn, bench_offline_collection
}

criterion_main!(benches);
