//! A minimal two-thread producer/consumer over a named `ShmRingBuffer`, to exercise the crate the
//! way two separate processes attached to the same shared-memory segment would.

use shm_arena::element::GlobalContextId;
use shm_arena::registry;
use shm_arena::ring::ShmRingBuffer;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let registry = registry::global();
    let path = format!("/shm-ring-demo-{}", std::process::id());
    let ring = Arc::new(
        ShmRingBuffer::create_or_open(&path, 64, true, registry)
            .expect("failed to create demo ring buffer"),
    );

    let producer_ring = Arc::clone(&ring);
    let producer = std::thread::spawn(move || {
        for i in 0..20u64 {
            loop {
                match producer_ring.get_empty_element(GlobalContextId {
                    producer_id: 1,
                    context_id: i,
                }) {
                    Ok(index) => {
                        producer_ring.mark_slot_ready(index);
                        tracing::info!(index, context_id = i, "produced");
                        break;
                    }
                    Err(_) => std::thread::sleep(Duration::from_micros(100)),
                }
            }
        }
    });

    let consumer_ring = Arc::clone(&ring);
    let consumer = std::thread::spawn(move || {
        for _ in 0..20u64 {
            loop {
                match consumer_ring.get_ready_element() {
                    Ok(index) => {
                        consumer_ring.mark_traced(index);
                        consumer_ring.mark_empty(index);
                        tracing::info!(index, "consumed");
                        break;
                    }
                    Err(_) => std::thread::sleep(Duration::from_micros(100)),
                }
            }
        }
    });

    producer.join().expect("producer thread panicked");
    consumer.join().expect("consumer thread panicked");

    let stats = ring.get_statistics();
    tracing::info!(?stats, "final statistics");

    if let Ok(ring) = Arc::try_unwrap(ring) {
        ring.close(registry).expect("close failed");
    }
}
