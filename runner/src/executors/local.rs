use super::{run_guarded, Executor, Work};
use crate::{
    errors::ExecutorError,
    handle::{Handle, MapResults},
    workflow::WorkflowTask,
};
use itertools::Itertools;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, instrument, trace};

/// Options understood by the local executor
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LocalOptions {
    // number of units running at once within `map`, all of them if unset
    pub parallel_units_per_job: Option<usize>,
}

impl LocalOptions {
    pub fn for_task(task: &WorkflowTask) -> Self {
        Self {
            parallel_units_per_job: task.resource_meta().parallel_units_per_job,
        }
    }
}

/// Executor that works on a local thread pool
#[derive(Debug)]
pub struct LocalExecutor {
    pool: Arc<ThreadPool>,
    shut_down: AtomicBool,
}

impl LocalExecutor {
    /// create a new LocalExecutor instance
    pub fn load(threads: Option<usize>) -> Result<Self, ExecutorError> {
        let thread_number = threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        });

        debug!("Starting thread pool with {thread_number} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(thread_number)
            .thread_name(|index| format!("local-executor-{index}"))
            .build()
            .map_err(|error| ExecutorError::Setup(format!("failed to build thread pool: {error}")))?;

        Ok(Self {
            pool: Arc::new(pool),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<(), ExecutorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(ExecutorError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Executor for LocalExecutor {
    type Options = LocalOptions;

    #[instrument(skip_all, fields(work = W::NAME), level = "debug")]
    fn submit<W: Work>(
        &self,
        work: W,
        input: W::Input,
        _options: &LocalOptions,
    ) -> Result<Handle<W::Output>, ExecutorError> {
        self.ensure_running()?;

        let handle = Handle::pending();
        let shared = handle.share();

        self.pool.spawn(move || {
            if shared.start() {
                shared.resolve(run_guarded(&work, input).map_err(ExecutorError::from));
            } else {
                trace!("Skipping cancelled unit");
            }
        });

        Ok(handle)
    }

    /// execute units in consecutive batches of `parallel_units_per_job`
    #[instrument(skip_all, fields(work = W::NAME, units = inputs.len()), level = "debug")]
    fn map<W: Work>(
        &self,
        work: W,
        inputs: Vec<W::Input>,
        options: &LocalOptions,
    ) -> Result<MapResults<W::Output>, ExecutorError> {
        self.ensure_running()?;

        let handles = (0..inputs.len()).map(|_| Handle::pending()).collect_vec();

        if inputs.is_empty() {
            return Ok(MapResults::new(handles));
        }

        let parallel = options
            .parallel_units_per_job
            .unwrap_or(inputs.len())
            .max(1);
        let units = inputs
            .into_iter()
            .zip(handles.iter().map(Handle::share))
            .collect_vec();
        let pool = Arc::clone(&self.pool);
        let work = Arc::new(work);

        debug!("Dispatching {} units with {parallel} in parallel", units.len());

        thread::Builder::new()
            .name("local-map".to_string())
            .spawn(move || {
                let batches = units.into_iter().chunks(parallel);

                for (index, batch) in (&batches).into_iter().enumerate() {
                    // a whole batch is started at once, cancelled units are dropped here
                    let batch = batch.filter(|(_, handle)| handle.start()).collect_vec();

                    if batch.is_empty() {
                        trace!("Batch {index} was cancelled");
                        continue;
                    }

                    pool.scope(|scope| {
                        for (input, handle) in batch {
                            let work = &work;

                            scope.spawn(move |_| {
                                handle.resolve(
                                    run_guarded(work.as_ref(), input).map_err(ExecutorError::from),
                                );
                            });
                        }
                    });
                }
            })?;

        Ok(MapResults::new(handles))
    }

    fn shutdown(&self) {
        debug!("Shutting down local executor");
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
