use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tradeflow::core::{Access, EventRef, ProducerMode, RingBuffer, Stage, WaitStrategy};

#[derive(Default)]
struct Marked {
    value: u64,
    branches: AtomicU32,
}

struct Branch {
    name: &'static str,
    delay: Option<Duration>,
}

impl Stage<Marked> for Branch {
    fn name(&self) -> &str {
        self.name
    }

    fn on_event(&mut self, event: EventRef<'_, Marked>, _: u64, _: bool) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        event.branches.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct JoinCounters {
    seen: Arc<AtomicU64>,
    sum: Arc<AtomicU64>,
    early: Arc<AtomicU64>,
}

struct Join {
    expected_branches: u32,
    counters: JoinCounters,
}

impl Stage<Marked> for Join {
    fn name(&self) -> &str {
        "join"
    }

    fn on_event(&mut self, mut event: EventRef<'_, Marked>, _: u64, _: bool) -> anyhow::Result<()> {
        let slot = event.get_mut().expect("join is exclusive");
        if slot.branches.load(Ordering::Acquire) != self.expected_branches {
            self.counters.early.fetch_add(1, Ordering::Relaxed);
        }
        slot.branches.store(0, Ordering::Release);
        self.counters.seen.fetch_add(1, Ordering::Relaxed);
        self.counters.sum.fetch_add(slot.value, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn join_only_sees_slots_every_branch_finished() {
    const N: u64 = 20_000;
    let mut builder = RingBuffer::builder(8, Marked::default);
    let left = builder.add_group("left", &[], Access::Shared);
    let right = builder.add_group("right", &[], Access::Shared);
    let middle = builder.add_group("middle", &[], Access::Shared);
    let join = builder.add_group("join", &[left, right, middle], Access::Exclusive);
    let ring = builder.build().expect("ring");

    let counters = JoinCounters::default();
    let mut handles = Vec::new();
    for (group, name) in [(left, "left"), (right, "right"), (middle, "middle")] {
        let consumer = ring.consumer(group).expect("consumer");
        handles.push(consumer.spawn(Branch { name, delay: None }, None).expect("spawn"));
    }
    handles.push(
        ring.consumer(join)
            .expect("consumer")
            .spawn(
                Join {
                    expected_branches: 3,
                    counters: counters.clone(),
                },
                None,
            )
            .expect("spawn"),
    );

    let mut producer = ring.producer().expect("producer");
    for value in 0..N {
        producer
            .publish_with(|slot| slot.value = value)
            .expect("publish");
    }
    ring.halt();
    for handle in handles {
        handle.join().expect("join thread");
    }

    assert_eq!(counters.early.load(Ordering::Relaxed), 0);
    assert_eq!(counters.seen.load(Ordering::Relaxed), N);
    assert_eq!(counters.sum.load(Ordering::Relaxed), N * (N - 1) / 2);
    for stats in ring.all_group_stats() {
        assert_eq!(stats.processed, N, "group {}", stats.name);
        assert_eq!(stats.sequence, N as i64 - 1, "group {}", stats.name);
    }
}

struct Gated {
    gate: Option<mpsc::Receiver<()>>,
    values: Arc<Mutex<Vec<u64>>>,
}

impl Stage<u64> for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    fn on_event(&mut self, event: EventRef<'_, u64>, _: u64, _: bool) -> anyhow::Result<()> {
        if let Some(gate) = self.gate.take() {
            gate.recv()?;
        }
        self.values.lock().unwrap().push(*event);
        Ok(())
    }
}

#[test]
fn producer_blocks_when_ring_is_full() {
    const CAPACITY: usize = 4;
    const TOTAL: u64 = 12;
    let mut builder = RingBuffer::builder(CAPACITY, || 0u64);
    let group = builder.add_group("gated", &[], Access::Shared);
    let ring = builder.build().expect("ring");

    let (gate_tx, gate_rx) = mpsc::channel();
    let values = Arc::new(Mutex::new(Vec::new()));
    let consumer = ring
        .consumer(group)
        .expect("consumer")
        .spawn(
            Gated {
                gate: Some(gate_rx),
                values: Arc::clone(&values),
            },
            None,
        )
        .expect("spawn");

    let (published_tx, published_rx) = mpsc::channel();
    let mut producer = ring.producer().expect("producer");
    let producer_thread = thread::spawn(move || {
        for value in 0..TOTAL {
            let seq = producer.publish_with(|slot| *slot = value).expect("publish");
            published_tx.send(seq).expect("send");
        }
    });

    for expected in 0..CAPACITY as u64 {
        let seq = published_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("fills the ring");
        assert_eq!(seq, expected);
    }
    // The consumer is parked on its first slot, so nothing was released.
    assert!(published_rx
        .recv_timeout(Duration::from_millis(100))
        .is_err());
    assert_eq!(ring.remaining_capacity(), 0);

    gate_tx.send(()).expect("open gate");
    producer_thread.join().expect("producer thread");
    assert_eq!(published_rx.iter().count(), (TOTAL as usize) - CAPACITY);

    ring.halt();
    consumer.join().expect("consumer thread");
    assert_eq!(*values.lock().unwrap(), (0..TOTAL).collect::<Vec<_>>());
}

struct Recorder {
    expected_seq: u64,
    out_of_order: Arc<AtomicU64>,
    values: Vec<u64>,
    sink: Arc<Mutex<Vec<u64>>>,
}

impl Stage<u64> for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_event(&mut self, event: EventRef<'_, u64>, sequence: u64, _: bool) -> anyhow::Result<()> {
        if sequence != self.expected_seq {
            self.out_of_order.fetch_add(1, Ordering::Relaxed);
        }
        self.expected_seq = sequence + 1;
        self.values.push(*event);
        Ok(())
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        self.sink.lock().unwrap().append(&mut self.values);
        Ok(())
    }
}

#[test]
fn multi_producer_claims_are_gap_free() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 10_000;

    let mut builder = RingBuffer::builder(64, || 0u64)
        .producer_mode(ProducerMode::Multi)
        .wait_strategy(WaitStrategy::SpinThenPark { spin_us: 5 });
    let group = builder.add_group("recorder", &[], Access::Shared);
    let ring = builder.build().expect("ring");

    let out_of_order = Arc::new(AtomicU64::new(0));
    let sink = Arc::new(Mutex::new(Vec::new()));
    let consumer = ring
        .consumer(group)
        .expect("consumer")
        .spawn(
            Recorder {
                expected_seq: 0,
                out_of_order: Arc::clone(&out_of_order),
                values: Vec::new(),
                sink: Arc::clone(&sink),
            },
            None,
        )
        .expect("spawn");

    let producer = ring.multi_producer().expect("producer");
    let writers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let mut producer = producer.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    producer
                        .publish_with(|slot| *slot = (id << 32) | i)
                        .expect("publish");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer");
    }
    ring.halt();
    consumer.join().expect("consumer");

    assert_eq!(out_of_order.load(Ordering::Relaxed), 0);
    let values = sink.lock().unwrap();
    assert_eq!(values.len() as u64, PRODUCERS * PER_PRODUCER);
    // Each writer's values arrive in the order it claimed them.
    let mut next = vec![0u64; PRODUCERS as usize];
    for value in values.iter() {
        let id = (value >> 32) as usize;
        assert_eq!(value & 0xffff_ffff, next[id]);
        next[id] += 1;
    }
    assert!(next.iter().all(|&n| n == PER_PRODUCER));
    assert_eq!(ring.cursor(), (PRODUCERS * PER_PRODUCER) as i64 - 1);
}

#[test]
fn halt_drains_everything_already_published() {
    const N: u64 = 64;
    let mut builder = RingBuffer::builder(16, Marked::default);
    let fast = builder.add_group("fast", &[], Access::Shared);
    let slow = builder.add_group("slow", &[], Access::Shared);
    let join = builder.add_group("join", &[fast, slow], Access::Exclusive);
    let ring = builder.build().expect("ring");

    let counters = JoinCounters::default();
    let handles = vec![
        ring.consumer(fast)
            .expect("consumer")
            .spawn(Branch { name: "fast", delay: None }, None)
            .expect("spawn"),
        ring.consumer(slow)
            .expect("consumer")
            .spawn(
                Branch {
                    name: "slow",
                    delay: Some(Duration::from_micros(200)),
                },
                None,
            )
            .expect("spawn"),
        ring.consumer(join)
            .expect("consumer")
            .spawn(
                Join {
                    expected_branches: 2,
                    counters: counters.clone(),
                },
                None,
            )
            .expect("spawn"),
    ];

    let mut producer = ring.producer().expect("producer");
    for value in 0..N {
        producer
            .publish_with(|slot| slot.value = value)
            .expect("publish");
    }
    // Halt while the slow branch still has work queued.
    ring.halt();
    for handle in handles {
        handle.join().expect("thread");
    }

    assert_eq!(counters.seen.load(Ordering::Relaxed), N);
    assert_eq!(counters.early.load(Ordering::Relaxed), 0);
    let slow_stats = ring.group_stats(slow).expect("stats");
    assert_eq!(slow_stats.processed, N);
    assert!(matches!(
        producer.claim(),
        Err(tradeflow::Error::Halted)
    ));
}

struct Count(Arc<AtomicU64>);

impl Stage<u64> for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn on_event(&mut self, _: EventRef<'_, u64>, _: u64, _: bool) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn publish_until_halted(mode: ProducerMode) {
    let mut builder = RingBuffer::builder(16, || 0u64)
        .producer_mode(mode)
        .wait_strategy(WaitStrategy::BusySpin);
    let group = builder.add_group("count", &[], Access::Shared);
    let ring = builder.build().expect("ring");

    let counted = Arc::new(AtomicU64::new(0));
    let consumer = ring
        .consumer(group)
        .expect("consumer")
        .spawn(Count(Arc::clone(&counted)), None)
        .expect("spawn");

    let writers: Vec<_> = match mode {
        ProducerMode::Single => {
            let mut producer = ring.producer().expect("producer");
            vec![thread::spawn(move || {
                let mut ok = 0u64;
                while producer.publish_with(|slot| *slot = ok).is_ok() {
                    ok += 1;
                }
                ok
            })]
        }
        ProducerMode::Multi => {
            let producer = ring.multi_producer().expect("producer");
            (0..2)
                .map(|_| {
                    let mut producer = producer.clone();
                    thread::spawn(move || {
                        let mut ok = 0u64;
                        while producer.publish_with(|slot| *slot = ok).is_ok() {
                            ok += 1;
                        }
                        ok
                    })
                })
                .collect()
        }
    };

    for _ in 0..200 {
        std::hint::spin_loop();
    }
    ring.halt();
    let published: u64 = writers
        .into_iter()
        .map(|writer| writer.join().expect("writer"))
        .sum();
    consumer.join().expect("consumer");

    assert_eq!(counted.load(Ordering::Relaxed), published);
    let stats = ring.group_stats(group).expect("stats");
    assert_eq!(stats.processed, published);
    assert_eq!(stats.sequence, published as i64 - 1);
}

#[test]
fn every_successful_publish_is_consumed_when_halt_races_the_producer() {
    for _ in 0..300 {
        publish_until_halted(ProducerMode::Single);
    }
    for _ in 0..300 {
        publish_until_halted(ProducerMode::Multi);
    }
}
