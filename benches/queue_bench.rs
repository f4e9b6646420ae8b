use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use msgwire::queue::{MultiQueue, Sequencer};
use msgwire::{wire_fields, Capabilities, Envelope, MessageType, Priority};

#[derive(Debug, Default, Clone, PartialEq)]
struct Event {
    n: u32,
}
wire_fields!(Event { n });

impl MessageType for Event {
    const NAME: &'static str = "bench.Event";
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Urgent {
    n: u32,
}
wire_fields!(Urgent { n });

impl MessageType for Urgent {
    const NAME: &'static str = "bench.Urgent";
    const CAPABILITIES: Capabilities = Capabilities::PRIORITIZED;

    fn send_priority(&self) -> Priority {
        Priority::from_level((self.n % 5 + 1) as u8).unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Step {
    n: u32,
}
wire_fields!(Step { n });

impl MessageType for Step {
    const NAME: &'static str = "bench.Step";
    const CAPABILITIES: Capabilities = Capabilities::ORDERED;
}

fn mixed(count: u32) -> Vec<Envelope> {
    let mut sequencer = Sequencer::new();
    (0..count)
        .map(|n| {
            let mut envelope = match n % 3 {
                0 => Envelope::of(Event { n }),
                1 => Envelope::of(Urgent { n }),
                _ => Envelope::of(Step { n }),
            };
            sequencer.assign(&mut envelope);
            envelope
        })
        .collect()
}

fn bench_multi_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_queue");

    group.bench_function("offer_poll_1k", |b| {
        b.iter_batched(
            || mixed(1000),
            |envelopes| {
                let mut queue = MultiQueue::new(4096);
                for envelope in envelopes {
                    queue.offer(envelope).unwrap();
                }
                while queue.poll().is_some() {}
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_multi_queue);
criterion_main!(benches);
