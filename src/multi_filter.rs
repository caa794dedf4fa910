//! A filter-of-filters that fans a vector of inputs out to N sub-filters.

use crate::filter::Filter;
use std::ops::BitAnd;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;

/// Runs `N` sub-filters of type `Filter<I, O>` in parallel over an
/// index-aligned `Vec<I>`, producing a `Vec<O>` of the same length.
///
/// `MultiFilter<I, O>` *is* a `Filter<Vec<I>, Vec<O>>` — it can be used as
/// the filter for an ordinary pipeline stage, or composed further with `&`.
pub struct MultiFilter<I, O> {
    filters: Vec<Box<dyn Filter<I, O>>>,
}

impl<I, O> MultiFilter<I, O> {
    pub(crate) fn new(first: Box<dyn Filter<I, O>>, second: Box<dyn Filter<I, O>>) -> Self {
        Self {
            filters: vec![first, second],
        }
    }

    pub(crate) fn push(&mut self, filter: Box<dyn Filter<I, O>>) {
        self.filters.push(filter);
    }

    /// The number of sub-filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether this `MultiFilter` holds no sub-filters. Never true for a
    /// `MultiFilter` built through the `&` operator, which always starts
    /// with two.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl<I, O> Filter<Vec<I>, Vec<O>> for MultiFilter<I, O>
where
    I: Send,
    O: Send,
{
    fn process_impl(&mut self, input: Vec<I>) -> Vec<O> {
        assert_eq!(
            input.len(),
            self.filters.len(),
            "MultiFilter received {} inputs but holds {} sub-filters",
            input.len(),
            self.filters.len()
        );

        let mut inputs: Vec<Option<I>> = input.into_iter().map(Some).collect();
        let mut outputs: Vec<Option<O>> = (0..self.filters.len()).map(|_| None).collect();
        let first_panic: Mutex<Option<Box<dyn std::any::Any + Send>>> = Mutex::new(None);

        let (first_filter, rest_filters) = self
            .filters
            .split_first_mut()
            .expect("MultiFilter always holds at least two sub-filters");
        let (first_input, rest_inputs) = inputs.split_first_mut().unwrap();
        let (first_output, rest_outputs) = outputs.split_first_mut().unwrap();

        thread::scope(|scope| {
            // Sub-filters [1, N) each run on their own scoped worker thread.
            for ((filter, input_slot), output_slot) in rest_filters
                .iter_mut()
                .zip(rest_inputs.iter_mut())
                .zip(rest_outputs.iter_mut())
            {
                let first_panic = &first_panic;
                scope.spawn(move || {
                    let value = input_slot.take().expect("input consumed exactly once");
                    match catch_unwind(AssertUnwindSafe(|| filter.process_impl(value))) {
                        Ok(result) => *output_slot = Some(result),
                        Err(payload) => {
                            let mut guard = first_panic.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(payload);
                            }
                        }
                    }
                });
            }

            // Sub-filter 0 runs on the calling thread, amortising one spawn.
            let value = first_input.take().expect("input consumed exactly once");
            match catch_unwind(AssertUnwindSafe(|| first_filter.process_impl(value))) {
                Ok(result) => *first_output = Some(result),
                Err(payload) => {
                    let mut guard = first_panic.lock().unwrap();
                    if guard.is_none() {
                        *guard = Some(payload);
                    }
                }
            }
        });

        // All helper threads are joined by the time `thread::scope` returns
        // (even if the calling thread's own sub-filter panicked above, since
        // that panic was caught, not propagated). Surface the first failure
        // now that nothing is left running.
        if let Some(payload) = first_panic.into_inner().unwrap() {
            resume_unwind(payload);
        }

        outputs
            .into_iter()
            .map(|o| o.expect("every sub-filter produced an output"))
            .collect()
    }
}

/// `filterA & filterB` — fans two filters of the same `(I, O)` out into a
/// new `MultiFilter`. Implemented on `Box<dyn Filter<I, O>>` rather than
/// directly on filter types for the same orphan-rule reason as `Pipeline`'s
/// `BitOr` impl (see `filter::FilterExt`'s documentation).
impl<I, O> BitAnd<Box<dyn Filter<I, O>>> for Box<dyn Filter<I, O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Output = MultiFilter<I, O>;

    fn bitand(self, rhs: Box<dyn Filter<I, O>>) -> MultiFilter<I, O> {
        MultiFilter::new(self, rhs)
    }
}

/// `multi & filter` — extends an existing `MultiFilter` with one more
/// sub-filter.
impl<I, O> BitAnd<Box<dyn Filter<I, O>>> for MultiFilter<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Output = MultiFilter<I, O>;

    fn bitand(mut self, rhs: Box<dyn Filter<I, O>>) -> MultiFilter<I, O> {
        self.push(rhs);
        self
    }
}
