use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::config::{ensure_unique_identity_keys, Configuration};
use crate::pipeline::{ConfigurationPipeline, RunOutcome};

/// Runs a batch over a fixed-size pool of OS threads. Outcomes come
/// back in submission order; progress ticks do not.
pub struct ExperimentScheduler {
    pipeline: ConfigurationPipeline,
}

impl ExperimentScheduler {
    pub fn new(pipeline: ConfigurationPipeline) -> ExperimentScheduler {
        ExperimentScheduler { pipeline }
    }

    pub fn pipeline(&self) -> &ConfigurationPipeline {
        &self.pipeline
    }

    pub fn run_all(
        &self,
        configurations: &[Configuration],
        workers: usize,
    ) -> Result<Vec<RunOutcome>> {
        self.run_all_with_progress(configurations, workers, &|_, _| {})
    }

    pub fn run_all_with_progress(
        &self,
        configurations: &[Configuration],
        workers: usize,
        on_progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<Vec<RunOutcome>> {
        ensure_unique_identity_keys(configurations)?;
        let total = configurations.len();
        info!(total, workers, "starting batch");

        if workers <= 1 {
            let mut outcomes = Vec::with_capacity(total);
            for (index, configuration) in configurations.iter().enumerate() {
                outcomes.push(self.pipeline.execute(configuration));
                on_progress(index + 1, total);
            }
            info!(total, "batch complete");
            return Ok(outcomes);
        }

        let next = AtomicUsize::new(0);
        let completed = AtomicUsize::new(0);
        let (sender, receiver) = mpsc::channel::<(usize, RunOutcome)>();
        let pipeline = &self.pipeline;

        let mut slots: Vec<Option<RunOutcome>> = Vec::new();
        slots.resize_with(total, || None);

        thread::scope(|scope| {
            for _ in 0..workers.min(total) {
                let sender = sender.clone();
                let next = &next;
                let completed = &completed;
                scope.spawn(move || loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    if index >= total {
                        break;
                    }
                    let outcome = pipeline.execute(&configurations[index]);
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    on_progress(done, total);
                    if sender.send((index, outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(sender);
            // Completion order is arbitrary; the index restores
            // submission order.
            for (index, outcome) in receiver {
                slots[index] = Some(outcome);
            }
        });

        let mut outcomes = Vec::with_capacity(total);
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(outcome) => outcomes.push(outcome),
                None => return Err(anyhow!("scheduler_missing_outcome: index {}", index)),
            }
        }
        info!(total, "batch complete");
        Ok(outcomes)
    }
}
