//! Object directory benchmarks.

use caisson::client::{Client, ClientId};
use caisson::directory::ObjectDirectory;
use caisson::id::ObjectId;
use caisson::memory::ShmAllocator;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_create_seal_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_seal_delete");

    for size in [256usize, 4 * 1024, 64 * 1024] {
        let allocator = ShmAllocator::new("caisson-bench", 64 * 1024 * 1024).unwrap();
        let dir = ObjectDirectory::new(allocator, None, None);
        let mut client = Client::new(ClientId::next());
        let mut next = 0u64;

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                next += 1;
                let id = ObjectId::from_u64(next);
                dir.create_object(id, true, size, 0, 0, &mut client).unwrap();
                dir.seal_objects(&[id]);
                dir.release_object(id, &mut client);
                dir.delete_object(id).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let allocator = ShmAllocator::new("caisson-bench", 16 * 1024 * 1024).unwrap();
    let dir = ObjectDirectory::new(allocator, None, None);
    let mut creator = Client::new(ClientId::next());

    let ids: Vec<ObjectId> = (1..=64).map(ObjectId::from_u64).collect();
    for id in &ids {
        dir.create_and_seal_object(*id, true, &[0u8; 4096], &[], &mut creator)
            .unwrap();
    }

    let mut group = c.benchmark_group("get_hit");
    group.throughput(Throughput::Elements(ids.len() as u64));
    group.bench_function("sealed_batch", |b| {
        let mut reader = Client::new(ClientId::next());
        b.iter(|| {
            let found = dir.get_objects(&ids, &mut reader);
            assert_eq!(found.sealed.len(), ids.len());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_create_seal_delete, bench_get_hit);
criterion_main!(benches);
