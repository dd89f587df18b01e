use crate::{
    collector::Instance,
    config::RunConfiguration,
    results::{Aggregator, ExportError},
    supervisor::{supervise, ProcfsMemory, RunError},
    sync::{CancelToken, ChildRegistry},
};
use rayon::ThreadPoolBuilder;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

/// how often the completion loop wakes to look for an external interrupt
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("benchmark was interrupted")]
    Interrupted,
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Executor that supervises up to `jobs` solver processes at a time on a
/// local thread pool.
///
/// Completions are handed to the aggregator in completion order. The first
/// failure cancels all queued work, kills everything in flight and
/// propagates, completed records are never discarded.
pub struct LocalExecutor {
    run: Arc<RunConfiguration>,
    jobs: usize,
}

impl LocalExecutor {
    pub fn new(run: RunConfiguration, jobs: usize) -> Self {
        Self {
            run: Arc::new(run),
            jobs,
        }
    }

    pub fn execute(
        &self,
        instances: Vec<Instance>,
        aggregator: &mut Aggregator,
        interrupted: &AtomicBool,
    ) -> Result<(), ExecutorError> {
        debug!("Starting thread pool with {} workers", self.jobs);
        let pool = ThreadPoolBuilder::new().num_threads(self.jobs).build()?;

        let cancel = Arc::new(CancelToken::default());
        let registry = Arc::new(ChildRegistry::default());
        let (sender, receiver) = mpsc::channel();
        let total = instances.len();

        for instance in instances {
            let run = Arc::clone(&self.run);
            let cancel = Arc::clone(&cancel);
            let registry = Arc::clone(&registry);
            let sender = sender.clone();

            pool.spawn(move || {
                // cancelled before this worker slot freed up, never dispatch
                if cancel.is_cancelled() {
                    return;
                }

                let memory = ProcfsMemory::new();
                let result = supervise(&instance, &run, &cancel, &registry, &memory);
                // send fails once the collection loop gave up, nothing to do
                let _ = sender.send(result);
            });
        }
        // workers hold the remaining senders, the channel closes once all
        // of them finished or bailed out
        drop(sender);

        let mut completed = 0;
        loop {
            if interrupted.load(Ordering::SeqCst) {
                cancel.cancel();
                registry.kill_all();

                return Err(ExecutorError::Interrupted);
            }

            match receiver.recv_timeout(INTERRUPT_POLL) {
                Ok(Ok(record)) => {
                    if let Err(failure) = aggregator.append(record) {
                        cancel.cancel();
                        registry.kill_all();

                        return Err(failure.into());
                    }
                    completed += 1;
                    info!("Done with {completed}/{total}");
                }
                // a run observed the cancellation, its data is discarded
                Ok(Err(RunError::Cancelled { .. })) => {}
                Ok(Err(failure)) => {
                    cancel.cancel();
                    registry.kill_all();

                    return Err(failure.into());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Done with processing");

        Ok(())
    }
}
