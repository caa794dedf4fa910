//! The worker that pairs one filter with its two adjacent pipes.

use crate::error::Error;
use crate::filter::Filter;
use crate::pipe::Pipe;
use crate::profile::ProfileSample;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
#[cfg(feature = "profiling")]
use std::time::Instant;

/// Object-safe handle used by [`crate::Pipeline`] to hold a heterogeneous
/// list of differently-typed stages.
///
/// The type-specific machinery (the concrete `I`, `O`) lives entirely inside
/// [`FilterStage`]; `Pipeline` only ever needs `start`/`stop`/health-check
/// access, so it stores `Box<dyn StageHandle>`.
pub(crate) trait StageHandle: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn reset_filter(&self);
    fn run_once(&self);
    fn is_filtering(&self) -> bool;
    fn name(&self) -> &str;
    fn take_last_error(&self) -> Option<Error>;
    #[cfg(feature = "profiling")]
    fn profile(&self) -> ProfileSample;
}

/// A worker that owns one filter and its input/output pipes.
///
/// Constructed during pipeline build (not yet running). `start` spawns the
/// worker thread; `stop` signals it, drains its input pipe, and joins it;
/// `Drop` performs the same shutdown if the stage is still running.
pub struct FilterStage<I, O> {
    input: Arc<Pipe<I>>,
    output: Arc<Pipe<O>>,
    filter: Arc<Mutex<Box<dyn Filter<I, O>>>>,
    thread_active: Arc<AtomicBool>,
    filtering: Arc<AtomicBool>,
    self_managed: bool,
    handle: Mutex<Option<JoinHandle<()>>>,
    name: String,
    last_error: Arc<Mutex<Option<Error>>>,
    #[cfg(feature = "profiling")]
    profile: Arc<Mutex<ProfileSample>>,
}

impl<I, O> FilterStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(
        name: impl Into<String>,
        input: Arc<Pipe<I>>,
        filter: Box<dyn Filter<I, O>>,
        output: Arc<Pipe<O>>,
    ) -> Self {
        Self {
            input,
            output,
            filter: Arc::new(Mutex::new(filter)),
            thread_active: Arc::new(AtomicBool::new(false)),
            filtering: Arc::new(AtomicBool::new(false)),
            self_managed: true,
            handle: Mutex::new(None),
            name: name.into(),
            last_error: Arc::new(Mutex::new(None)),
            #[cfg(feature = "profiling")]
            profile: Arc::new(Mutex::new(ProfileSample::default())),
        }
    }

    /// One pop-process-push cycle, run synchronously on the calling thread.
    /// Used both by the background worker loop (when `self_managed`) and
    /// directly by [`crate::Pipeline::step`] for single-threaded operation.
    /// Returns `Continue(true)` if a value was processed and pushed,
    /// `Continue(false)` if the filter panicked, or `Stop` if the input pipe
    /// was disabled (in which case nothing is processed or pushed at all).
    fn run_once_inner(
        input: &Pipe<I>,
        output: &Pipe<O>,
        filter: &Mutex<Box<dyn Filter<I, O>>>,
        name: &str,
        last_error: &Mutex<Option<Error>>,
        thread_active: Option<&AtomicBool>,
        #[cfg(feature = "profiling")] profile: &Mutex<ProfileSample>,
    ) -> RunOutcome {
        let Some(v) = input.blocking_pop() else {
            return RunOutcome::Stop;
        };

        // Step 2 of the worker loop sits here, between the unblock and the
        // filter call: a wakeup caused by disabling the input pipe must not
        // push a bogus output.
        if let Some(thread_active) = thread_active {
            if !thread_active.load(Ordering::SeqCst) {
                return RunOutcome::Stop;
            }
        }

        #[cfg(feature = "profiling")]
        let started_at = Instant::now();

        let mut guard = filter.lock().unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| guard.process_impl(v)));
        drop(guard);

        #[cfg(feature = "profiling")]
        profile.lock().unwrap().record(started_at.elapsed());

        match result {
            Ok(w) => {
                output.push(w);
                RunOutcome::Processed
            }
            Err(payload) => {
                tracing::error!(stage = %name, "filter panicked, stopping stage");
                *last_error.lock().unwrap() = Some(Error::FilterPanic {
                    stage: name.to_string(),
                    payload,
                });
                RunOutcome::Panicked
            }
        }
    }
}

/// Result of one pop-process-push cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    /// A value was popped, processed, and pushed downstream.
    Processed,
    /// A value was popped but the filter panicked; nothing was pushed.
    Panicked,
    /// The input pipe was disabled; nothing was popped, processed or pushed.
    Stop,
}

impl<I, O> StageHandle for FilterStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn start(&self) {
        if self.handle.lock().unwrap().is_some() {
            return;
        }

        self.thread_active.store(true, Ordering::SeqCst);

        let input = self.input.clone();
        let output = self.output.clone();
        let filter = self.filter.clone();
        let thread_active = self.thread_active.clone();
        let filtering = self.filtering.clone();
        let self_managed = self.self_managed;
        let name = self.name.clone();
        let last_error = self.last_error.clone();
        #[cfg(feature = "profiling")]
        let profile = self.profile.clone();

        let span_name = name.clone();
        let jh = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let span = tracing::debug_span!("filter_stage", stage = %span_name);
                let _enter = span.enter();

                filtering.store(true, Ordering::SeqCst);
                tracing::debug!(stage = %span_name, "stage started");

                loop {
                    let outcome = FilterStage::run_once_inner(
                        &input,
                        &output,
                        &filter,
                        &name,
                        &last_error,
                        Some(thread_active.as_ref()),
                        #[cfg(feature = "profiling")]
                        &profile,
                    );

                    if outcome != RunOutcome::Processed || !self_managed {
                        break;
                    }
                }

                filtering.store(false, Ordering::SeqCst);
                tracing::debug!(stage = %span_name, "stage stopped");
            })
            .expect("failed to spawn filter stage worker thread");

        *self.handle.lock().unwrap() = Some(jh);
    }

    fn stop(&self) {
        self.thread_active.store(false, Ordering::SeqCst);
        // Disable-then-reset: disabling first prevents a racing push from
        // refilling the slot after the reset has already emptied it.
        self.input.disable();
        self.input.reset();

        if let Some(jh) = self.handle.lock().unwrap().take() {
            let _ = jh.join();
        }

        self.input.enable();
    }

    fn reset_filter(&self) {
        self.filter.lock().unwrap().reset();
    }

    fn run_once(&self) {
        FilterStage::run_once_inner(
            &self.input,
            &self.output,
            &self.filter,
            &self.name,
            &self.last_error,
            None,
            #[cfg(feature = "profiling")]
            &self.profile,
        );
    }

    fn is_filtering(&self) -> bool {
        self.filtering.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn take_last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().take()
    }

    #[cfg(feature = "profiling")]
    fn profile(&self) -> ProfileSample {
        *self.profile.lock().unwrap()
    }
}

impl<I, O> Drop for FilterStage<I, O> {
    fn drop(&mut self) {
        if self.handle.lock().unwrap().is_some() {
            self.thread_active.store(false, Ordering::SeqCst);
            self.input.disable();
            self.input.reset();
            if let Some(jh) = self.handle.lock().unwrap().take() {
                let _ = jh.join();
            }
        }
    }
}
