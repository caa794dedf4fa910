//! The single-slot rendezvous transport between two adjacent stages.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Back-pressure policy applied by [`Pipe::push`] when the slot is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Discard the value already in the slot and store the new one.
    Overwrite,
    /// Block the producer until the slot is drained (or the pipe is disabled).
    WaitForConsumer,
}

/// Generates trigger values at a paced interval, turning a [`Pipe`] into a
/// rate-limited head source for a pipeline that has no external producer.
///
/// This is the Rust rendition of the original `NullPipe`/`Generator`: rather
/// than a distinct type, it is a construction mode of [`Pipe`] itself, so a
/// trigger-source pipe can still be stored and shared exactly like any other
/// `Arc<Pipe<T>>`.
struct TriggerState<T> {
    generate: Box<dyn FnMut() -> T + Send>,
    interval: Duration,
    last_pop: Option<Instant>,
}

struct Inner<T> {
    slot: Option<T>,
    enabled: bool,
    trigger: Option<TriggerState<T>>,
}

/// A single-slot transport between exactly one producer and one consumer.
///
/// See the crate-level documentation for the full contract. In short:
/// `push`/`pop` never block; `blocking_pop` blocks until a value is
/// available or the pipe is disabled; `disable` wakes every waiter promptly.
pub struct Pipe<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    policy: Policy,
}

impl<T> Pipe<T> {
    /// Creates an ordinary slot pipe with the given back-pressure policy.
    pub fn new(policy: Policy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slot: None,
                enabled: true,
                trigger: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            policy: policy,
        })
    }

    /// Creates a trigger-source pipe: `pop`/`blocking_pop` always synthesise a
    /// fresh value via `generate` instead of waiting on an external producer,
    /// and `push` is a no-op. `blocking_pop` paces itself so that consecutive
    /// returns are at least `msecs_between_pops` apart.
    ///
    /// Like any other pipe, a trigger-source pipe still honours
    /// `disable`/`enable`, so a stage fed by one can still be shut down
    /// promptly; the original `NullPipe` ignored disable entirely, which
    /// could wedge shutdown of the pipeline's head stage (see DESIGN.md).
    pub fn trigger_source<F>(msecs_between_pops: u64, generate: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slot: None,
                enabled: true,
                trigger: Some(TriggerState {
                    generate: Box::new(generate),
                    interval: Duration::from_millis(msecs_between_pops),
                    last_pop: None,
                }),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            policy: Policy::Overwrite,
        })
    }

    /// Stores `v` into the slot, subject to the pipe's policy and gate state.
    pub fn push(&self, v: T) {
        let mut guard = self.inner.lock().unwrap();
        if guard.trigger.is_some() || !guard.enabled {
            return;
        }

        loop {
            if !guard.enabled {
                return;
            }
            if guard.slot.is_none() || self.policy == Policy::Overwrite {
                guard.slot = Some(v);
                self.not_empty.notify_all();
                return;
            }
            // WaitForConsumer, slot full: wait for a pop() or a disable().
            guard = self.not_full.wait(guard).unwrap();
        }
    }

    /// Returns the stored value and empties the slot, without blocking.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(trigger) = guard.trigger.as_mut() {
            trigger.last_pop = Some(Instant::now());
            return Some((trigger.generate)());
        }
        let v = guard.slot.take();
        if v.is_some() {
            self.not_full.notify_all();
        }
        v
    }

    /// Blocks until the slot is non-empty or the pipe is disabled, returning
    /// `None` promptly in the latter case.
    pub fn blocking_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !guard.enabled {
                return None;
            }

            if guard.trigger.is_some() {
                let now = Instant::now();
                let wait_for = {
                    let trigger = guard.trigger.as_ref().unwrap();
                    trigger
                        .last_pop
                        .map(|last| trigger.interval.saturating_sub(now.duration_since(last)))
                        .unwrap_or(Duration::ZERO)
                };
                if wait_for > Duration::ZERO {
                    let (g, _) = self.not_empty.wait_timeout(guard, wait_for).unwrap();
                    guard = g;
                    continue;
                }
                let trigger = guard.trigger.as_mut().unwrap();
                trigger.last_pop = Some(now);
                return Some((trigger.generate)());
            }

            if let Some(v) = guard.slot.take() {
                self.not_full.notify_all();
                return Some(v);
            }

            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Unconditionally empties the slot.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.slot = None;
        self.not_full.notify_all();
    }

    /// Disables the pipe: wakes every waiting `blocking_pop`/`push` promptly.
    pub fn disable(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.enabled = false;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Re-enables the pipe after a `disable`.
    pub fn enable(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.enabled = true;
    }

    /// Returns 0 or 1: whether the slot currently holds a value.
    pub fn size(&self) -> usize {
        let guard = self.inner.lock().unwrap();
        if guard.trigger.is_some() || guard.slot.is_some() {
            1
        } else {
            0
        }
    }
}

/// Object-safe handle used by [`crate::Pipeline`] to reset every pipe it owns,
/// regardless of the pipe's element type.
pub(crate) trait Resettable: Send + Sync {
    fn reset(&self);
}

impl<T: Send> Resettable for Pipe<T> {
    fn reset(&self) {
        Pipe::reset(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn pop_on_empty_is_none() {
        let pipe = Pipe::<i32>::new(Policy::Overwrite);
        assert_eq!(pipe.pop(), None);
    }

    #[test]
    fn overwrite_policy_replaces() {
        let pipe = Pipe::<i32>::new(Policy::Overwrite);
        pipe.push(1);
        pipe.push(2);
        assert_eq!(pipe.pop(), Some(2));
    }

    #[test]
    fn disable_unblocks_consumer() {
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
    fn wait_for_consumer_blocks_producer() {
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

    #[test]
    fn trigger_source_paces_blocking_pop() {
        let pipe = Pipe::trigger_source(30, || 0);
        assert_eq!(pipe.size(), 1);

        let start = Instant::now();
        assert_eq!(pipe.blocking_pop(), Some(0));
        assert_eq!(pipe.blocking_pop(), Some(0));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn trigger_source_push_is_noop() {
        let pipe = Pipe::trigger_source(0, || 7);
        pipe.push(99);
        assert_eq!(pipe.blocking_pop(), Some(7));
    }

    #[test]
    fn disable_unblocks_trigger_source() {
        let pipe = Pipe::trigger_source(10_000, || 0);
        let consumer = {
            let pipe = pipe.clone();
            thread::spawn(move || pipe.blocking_pop())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!consumer.is_finished());

        pipe.disable();
        assert_eq!(consumer.join().unwrap(), None);
    }
}
