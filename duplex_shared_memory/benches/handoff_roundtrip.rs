//! Handoff latency benchmarks

use criterion::{Criterion, criterion_group, criterion_main};
use duplex::apb::{ApbInput, ApbOutput};
use duplex::channel::ResourceNames;
use duplex_shared_memory::{
    CreateOptions, Endpoint, MemoryBackend, ResourceBackend, ResourceGroup, ShmDirBackend,
};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

type Consumer = Endpoint<ApbOutput, ApbInput>;
type Producer = Endpoint<ApbInput, ApbOutput>;

fn pair(backend: Arc<dyn ResourceBackend>) -> (Consumer, Producer) {
    let names = ResourceNames::unique("bench");
    let owner = ResourceGroup::create::<ApbInput, ApbOutput>(
        Arc::clone(&backend),
        &names,
        CreateOptions::default(),
    )
    .unwrap();
    let peer = ResourceGroup::attach::<ApbInput, ApbOutput>(backend, &names).unwrap();
    (
        Endpoint::consumer(owner).unwrap(),
        Endpoint::producer(peer).unwrap(),
    )
}

/// One direction, same thread: Begin/End pairs with no contention
fn bench_uncontended_handoff(c: &mut Criterion) {
    let (mut consumer, mut producer) = pair(Arc::new(MemoryBackend::new()));

    c.bench_function("send_recv_same_thread", |b| {
        b.iter(|| {
            producer.send(black_box(ApbInput { a: 1, b: 2 })).unwrap();
            black_box(consumer.recv().unwrap());
        });
    });
}

/// Full a-plus-b round trip against an echo thread
fn bench_round_trip(c: &mut Criterion) {
    for (label, backend) in [
        ("round_trip_heap", Arc::new(MemoryBackend::new()) as Arc<dyn ResourceBackend>),
        ("round_trip_dev_shm", Arc::new(ShmDirBackend::default()) as Arc<dyn ResourceBackend>),
    ] {
        let (mut consumer, mut producer) = pair(backend);

        let echo = thread::spawn(move || {
            while let Ok(Some(input)) = consumer.recv() {
                if consumer.send(ApbOutput { c: input.sum() }).is_err() {
                    break;
                }
            }
        });

        c.bench_function(label, |b| {
            b.iter(|| {
                producer.send(ApbInput { a: 3, b: 4 }).unwrap();
                black_box(producer.recv().unwrap());
            });
        });

        producer.set_finished().unwrap();
        echo.join().unwrap();
    }
}

criterion_group!(benches, bench_uncontended_handoff, bench_round_trip);
criterion_main!(benches);
