//! Type-checked composition of filters into a running pipeline.

use crate::error::Error;
use crate::filter::Filter;
use crate::pipe::{Pipe, Policy, Resettable};
use crate::stage::{FilterStage, StageHandle};
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A running (or stopped) chain of stages, built only through `|` composition.
///
/// `InData`/`OutData` are phantom at runtime (every stage is stored as a
/// boxed [`StageHandle`]) but drive the compile-time type check that makes
/// `filterA | filterB` a type error when the adjacent types don't match.
pub struct Pipeline<InData, OutData> {
    in_pipe: Arc<Pipe<InData>>,
    out_pipe: Arc<Pipe<OutData>>,
    stages: Vec<Box<dyn StageHandle>>,
    pipes: Vec<Arc<dyn Resettable>>,
    running: AtomicBool,
}

impl<InData, OutData> Pipeline<InData, OutData>
where
    InData: Send + 'static,
    OutData: Send + 'static,
{
    fn from_two<M>(
        filter_a: Box<dyn Filter<InData, M>>,
        filter_b: Box<dyn Filter<M, OutData>>,
    ) -> Self
    where
        M: Send + 'static,
    {
        let in_pipe = Pipe::new(Policy::Overwrite);
        let mid_pipe = Pipe::new(Policy::Overwrite);
        let out_pipe = Pipe::new(Policy::Overwrite);

        let stage_a = FilterStage::new("stage-0", in_pipe.clone(), filter_a, mid_pipe.clone());
        let stage_b = FilterStage::new("stage-1", mid_pipe.clone(), filter_b, out_pipe.clone());

        Self {
            in_pipe,
            out_pipe,
            stages: vec![Box::new(stage_a), Box::new(stage_b)],
            pipes: vec![mid_pipe],
            running: AtomicBool::new(false),
        }
    }
}

impl<I, M, O> BitOr<Box<dyn Filter<M, O>>> for Box<dyn Filter<I, M>>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    type Output = Pipeline<I, O>;

    fn bitor(self, rhs: Box<dyn Filter<M, O>>) -> Pipeline<I, O> {
        Pipeline::from_two(self, rhs)
    }
}

impl<I, M, O> BitOr<Box<dyn Filter<M, O>>> for Pipeline<I, M>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    type Output = Pipeline<I, O>;

    /// Consumes `self`: its stages and input pipe are carried over, its
    /// former output pipe becomes the new between-pipe, and a fresh terminal
    /// pipe is created for `rhs`.
    fn bitor(self, rhs: Box<dyn Filter<M, O>>) -> Pipeline<I, O> {
        let Pipeline {
            in_pipe,
            out_pipe: mid_pipe,
            mut stages,
            mut pipes,
            running,
        } = self;

        let new_out_pipe = Pipe::new(Policy::Overwrite);
        let name = format!("stage-{}", stages.len());
        let new_stage = FilterStage::new(name, mid_pipe.clone(), rhs, new_out_pipe.clone());

        pipes.push(mid_pipe);
        stages.push(Box::new(new_stage));

        Pipeline {
            in_pipe,
            out_pipe: new_out_pipe,
            stages,
            pipes,
            running,
        }
    }
}

impl<InData, OutData> Pipeline<InData, OutData>
where
    InData: Send + 'static,
    OutData: Send + 'static,
{
    /// Starts every stage in order. Idempotent: calling this on an
    /// already-started pipeline logs an error and returns without spawning a
    /// second set of workers.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::error!("Pipeline::start called on a pipeline that is already running");
            return;
        }
        for stage in &self.stages {
            stage.start();
        }
    }

    /// Stops every stage and drains the terminal pipe of any stranded value.
    ///
    /// Three steps, in order: disable-and-reset the terminal pipe (so a
    /// worker racing to finish its last push doesn't wedge against a full
    /// slot nobody will ever drain); stop every stage (each stage's own
    /// disable-then-reset-then-join-then-reenable cycle on its input pipe);
    /// drain the terminal pipe once more and re-enable it.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.out_pipe.disable();
        self.out_pipe.reset();

        for stage in &self.stages {
            stage.stop();
        }

        self.out_pipe.reset();
        self.out_pipe.enable();
    }

    /// Resets every filter, then every pipe. Only valid while stopped.
    pub fn reset(&self) {
        assert!(
            !self.running.load(Ordering::SeqCst),
            "Pipeline::reset called while running"
        );

        for stage in &self.stages {
            stage.reset_filter();
        }

        self.in_pipe.reset();
        for pipe in &self.pipes {
            pipe.reset();
        }
        self.out_pipe.reset();
    }

    /// Drives the pipeline by hand, one value at a time: runs each stage's
    /// one-shot cycle in order, then blocking-pops the terminal pipe.
    ///
    /// Intended for single-threaded operation without ever calling
    /// [`Pipeline::start`].
    pub fn step(&self) -> Option<OutData> {
        for stage in &self.stages {
            stage.run_once();
        }
        self.out_pipe.blocking_pop()
    }

    /// The terminal pipe, for the caller to drain.
    pub fn out_pipe(&self) -> &Arc<Pipe<OutData>> {
        &self.out_pipe
    }

    /// The input pipe, for the caller to feed.
    pub fn in_pipe(&self) -> &Arc<Pipe<InData>> {
        &self.in_pipe
    }

    /// The number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether this pipeline holds no stages. Never true for a pipeline built
    /// through the `|` operator, which always starts with two.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Names of every stage whose `filtering` flag currently reads false
    /// while the pipeline believes itself running — the Rust rendition of
    /// `checkThreads()`. Empty while stopped or while every worker is alive.
    pub fn health(&self) -> Vec<String> {
        if !self.running.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let mut unhealthy = Vec::new();
        for stage in &self.stages {
            if !stage.is_filtering() {
                tracing::warn!(stage = %stage.name(), "stage is not filtering while pipeline is running");
                unhealthy.push(stage.name().to_string());
            }
        }
        unhealthy
    }

    /// Takes and clears the last filter-panic error recorded by each stage,
    /// in stage order, skipping stages with no pending error.
    pub fn take_errors(&self) -> Vec<Error> {
        self.stages
            .iter()
            .filter_map(|stage| stage.take_last_error())
            .collect()
    }
}
