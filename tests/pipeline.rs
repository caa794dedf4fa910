use blpl::{Filter, FilterExt, Pipe, Policy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn single_push_pop() {
    let pipe = Pipe::<i32>::new(Policy::Overwrite);
    pipe.push(1);
    assert_eq!(pipe.pop(), Some(1));
    assert_eq!(pipe.size(), 0);
}

#[test]
fn disable_blocks_a_consumer() {
    let pipe = Pipe::<i32>::new(Policy::Overwrite);
    let consumer = {
        let pipe = pipe.clone();
        thread::spawn(move || pipe.blocking_pop())
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!consumer.is_finished());

    pipe.disable();
    assert_eq!(consumer.join().unwrap(), None);
}

#[test]
fn wait_for_consumer_back_pressure() {
    let pipe = Pipe::<i32>::new(Policy::WaitForConsumer);
    pipe.push(1);

    let producer = {
        let pipe = pipe.clone();
        thread::spawn(move || pipe.push(2))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());

    assert_eq!(pipe.pop(), Some(1));
    producer.join().unwrap();
    assert_eq!(pipe.pop(), Some(2));
}

struct Counter {
    next: i32,
}

impl Filter<(), i32> for Counter {
    fn process_impl(&mut self, _input: ()) -> i32 {
        let v = self.next;
        if self.next < 100 {
            self.next += 1;
        }
        v
    }

    fn reset(&mut self) {
        self.next = 0;
    }
}

struct Halve;

impl Filter<i32, f64> for Halve {
    fn process_impl(&mut self, input: i32) -> f64 {
        input as f64 / 2.0
    }
}

struct Format;

impl Filter<f64, String> for Format {
    fn process_impl(&mut self, input: f64) -> String {
        format!("{input}")
    }
}

struct Echo {
    last_input: String,
}

impl Filter<String, String> for Echo {
    fn process_impl(&mut self, input: String) -> String {
        self.last_input = input.clone();
        input
    }
}

#[test]
fn four_stage_pipeline_drains_a_hundred_values() {
    let pipeline = Counter { next: 0 }.boxed()
        | Halve.boxed()
        | Format.boxed()
        | (Echo {
            last_input: String::new(),
        })
        .boxed();

    assert_eq!(pipeline.len(), 4);

    // Drives the pipeline one hop per stage per call, deterministically:
    // every stage runs its one-shot cycle in order within a single `step()`,
    // so priming the head before each call carries one value end to end.
    let mut last = None;
    for _ in 0..101 {
        pipeline.in_pipe().push(());
        last = pipeline.step();
    }

    let last = last.expect("pipeline produced a final value");
    let n: i32 = last.parse().unwrap();
    assert_eq!(n, 50);
}

#[test]
fn four_stage_pipeline_runs_concurrently_to_completion() {
    let pipeline = Counter { next: 0 }.boxed()
        | Halve.boxed()
        | Format.boxed()
        | (Echo {
            last_input: String::new(),
        })
        .boxed();

    assert_eq!(pipeline.len(), 4);

    pipeline.start();

    // Exercises the actual background worker loop (stage.rs's `start()`):
    // a separate thread keeps the head pipe fed while all four stages run
    // concurrently on their own workers, and the terminal pipe is drained
    // while that's happening.
    let keep_feeding = Arc::new(AtomicBool::new(true));
    let feeder = {
        let in_pipe = pipeline.in_pipe().clone();
        let keep_feeding = keep_feeding.clone();
        thread::spawn(move || {
            while keep_feeding.load(Ordering::Relaxed) {
                in_pipe.push(());
            }
        })
    };

    let mut drained = 0;
    let mut last_value = None;
    while drained < 100 {
        if let Some(v) = pipeline.out_pipe().blocking_pop() {
            last_value = Some(v);
            drained += 1;
        }
    }

    keep_feeding.store(false, Ordering::Relaxed);
    feeder.join().unwrap();

    assert!(pipeline.health().is_empty());
    pipeline.stop();

    let last_value = last_value.expect("drained 100 values");
    let n: i32 = last_value.parse().unwrap();
    assert!((0..=100).contains(&n));
}

struct DoubleToFloat;

impl Filter<i32, f64> for DoubleToFloat {
    fn process_impl(&mut self, input: i32) -> f64 {
        input as f64 / 2.0
    }
}

struct Double;

impl Filter<i32, f64> for Double {
    fn process_impl(&mut self, input: i32) -> f64 {
        (input * 2) as f64
    }
}

#[test]
fn multi_filter_fans_out_and_preserves_order() {
    let mut multi = DoubleToFloat.boxed() & Double.boxed();
    assert_eq!(multi.len(), 2);

    let outputs = multi.process_impl(vec![2, 2]);
    assert_eq!(outputs, vec![1.0, 4.0]);
    assert_eq!(outputs[0] * outputs[1], 4.0);
}

#[test]
fn start_then_stop_joins_every_worker() {
    let pipeline = Counter { next: 0 }.boxed() | Halve.boxed();

    pipeline.start();
    thread::sleep(Duration::from_millis(20));
    assert!(pipeline.health().is_empty());

    pipeline.stop();
    assert!(pipeline.health().is_empty(), "health is quiet once stopped");

    // A started-then-stopped pipeline can be started again.
    pipeline.start();
    pipeline.stop();
}

#[test]
fn reset_restores_filter_state() {
    let pipeline = Counter { next: 0 }.boxed() | Halve.boxed();

    pipeline.in_pipe().push(());
    pipeline.step();
    pipeline.in_pipe().push(());
    let second = pipeline.step().expect("second step produced a value");
    assert_eq!(second, 0.5);

    pipeline.reset();

    pipeline.in_pipe().push(());
    let after_reset = pipeline.step().expect("step after reset produced a value");
    assert_eq!(after_reset, 0.0);
}

struct Panicky;

impl Filter<i32, i32> for Panicky {
    fn process_impl(&mut self, input: i32) -> i32 {
        if input == 1 {
            panic!("boom");
        }
        input
    }
}

#[test]
fn multi_filter_propagates_a_sub_filter_panic_after_joining() {
    let mut multi = Panicky.boxed() & Panicky.boxed();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        multi.process_impl(vec![0, 1])
    }));
    assert!(result.is_err());
}

#[test]
fn composition_length() {
    let f1 = DoubleToFloat.boxed();
    let f2 = Format.boxed();
    let f3 = Echo {
        last_input: String::new(),
    }
    .boxed();

    let pipeline = f1 | f2 | f3;
    assert_eq!(pipeline.len(), 3);
}
