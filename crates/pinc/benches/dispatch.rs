use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pinc::{gather, sync, yield_now, Scheduler, Task};

fn bench_spawn_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_join");

    for workers in [1usize, 4] {
        let scheduler = Scheduler::with_workers(workers);
        scheduler.start().unwrap();
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::new("workers", workers), &scheduler, |b, s| {
            b.iter(|| {
                let tasks: Vec<Task<u64>> = (0..256u64)
                    .map(|i| Task::new(async move { Ok(black_box(i)) }))
                    .collect();
                for task in &tasks {
                    s.add_task(task).unwrap();
                }
                tasks.into_iter().map(|t| t.join().unwrap()).sum::<u64>()
            });
        });
        scheduler.stop(false);
    }

    group.finish();
}

fn bench_yield(c: &mut Criterion) {
    let scheduler = Scheduler::with_workers(2);
    scheduler.start().unwrap();

    c.bench_function("yield_1000", |b| {
        b.iter(|| {
            let task = Task::new(async {
                for _ in 0..1000 {
                    yield_now().await;
                }
                Ok(())
            });
            scheduler.add_task(&task).unwrap();
            task.join().unwrap()
        });
    });

    scheduler.stop(false);
}

fn bench_sync_gather(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_gather");

    for width in [8usize, 64] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("width", width), &width, |b, &width| {
            b.iter(|| {
                let children = (0..width)
                    .map(|i| Task::new(async move { Ok(black_box(i)) }))
                    .collect();
                sync(gather(children)).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_spawn_join, bench_yield, bench_sync_gather);
criterion_main!(benches);
