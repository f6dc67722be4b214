use criterion::{criterion_group, criterion_main, Criterion};
use mason_exec::{Steal, WorkStealingDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn bench_owner_push_pop(c: &mut Criterion) {
    c.bench_function("deque_owner_push_pop", |b| {
        let deque = WorkStealingDeque::new();
        b.iter(|| {
            for i in 0..128u64 {
                deque.push(i);
            }
            while deque.pop().is_some() {}
        });
    });
}

fn bench_contended_steal(c: &mut Criterion) {
    c.bench_function("deque_contended_steal", |b| {
        b.iter_custom(|iterations| {
            let deque = Arc::new(WorkStealingDeque::new());
            let done = Arc::new(AtomicBool::new(false));
            let thief = {
                let deque = deque.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        if let Steal::Success(v) = deque.steal() {
                            std::hint::black_box(v);
                        }
                    }
                })
            };

            let start = std::time::Instant::now();
            for i in 0..iterations {
                deque.push(i);
                if i % 2 == 0 {
                    std::hint::black_box(deque.pop());
                }
            }
            while deque.pop().is_some() {}
            let elapsed = start.elapsed();

            done.store(true, Ordering::Release);
            thief.join().unwrap();
            elapsed
        });
    });
}

criterion_group!(benches, bench_owner_push_pop, bench_contended_steal);
criterion_main!(benches);
