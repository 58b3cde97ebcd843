pub mod task_call;


use self::task_call::{ComponentTaskCall, ComponentUnit, SingleTaskCall, TaskCall};
use crate::{
    errors::ExecutorError,
    executors::{Executor, Executors, SubmitOptions},
    handle::Handle,
    state::TaskState,
    workflow::{validate_task_list, WorkflowTask},
};
use itertools::Itertools;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, error, info, info_span, instrument, warn};

/// number of chains that can be driven at the same time
const CHAIN_THREADS: usize = 4;

/// Derives the submission options of a workflow task
///
/// Called with the task, the server and user working directories and the state the task
/// will receive.
pub type SetupCallback = dyn Fn(&WorkflowTask, &Path, &Path, &TaskState) -> Result<SubmitOptions, ExecutorError>
    + Send
    + Sync;

/// Turns an ordered list of workflow tasks into a chain of submissions on an executor
pub struct SubmissionEngine {
    chain: Arc<Chain>,
    pool: ThreadPool,
}

struct Chain {
    executor: Arc<Executors>,
    setup: Box<SetupCallback>,
    workflow_dir: PathBuf,
    workflow_dir_user: PathBuf,
}

impl SubmissionEngine {
    pub fn new(
        executor: Arc<Executors>,
        workflow_dir: &Path,
        workflow_dir_user: &Path,
    ) -> Result<Self, ExecutorError> {
        let default_executor = Arc::clone(&executor);

        Self::with_setup(
            executor,
            workflow_dir,
            workflow_dir_user,
            Box::new(
                move |task: &WorkflowTask, dir: &Path, dir_user: &Path, state: &TaskState| {
                    default_executor.setup(task, dir, dir_user, state)
                },
            ),
        )
    }

    pub fn with_setup(
        executor: Arc<Executors>,
        workflow_dir: &Path,
        workflow_dir_user: &Path,
        setup: Box<SetupCallback>,
    ) -> Result<Self, ExecutorError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(CHAIN_THREADS)
            .thread_name(|index| format!("chain-{index}"))
            .build()
            .map_err(|error| ExecutorError::Setup(format!("failed to build thread pool: {error}")))?;

        Ok(Self {
            chain: Arc::new(Chain {
                executor,
                setup,
                workflow_dir: workflow_dir.to_path_buf(),
                workflow_dir_user: workflow_dir_user.to_path_buf(),
            }),
            pool,
        })
    }

    /// Submit all tasks as one chain and return a handle to the final state
    ///
    /// Every task only starts after its predecessor resolved successfully, the first failure
    /// resolves the returned handle with that error.
    pub fn submit(&self, tasks: Vec<WorkflowTask>, initial_state: TaskState) -> Handle<TaskState> {
        if tasks.is_empty() {
            debug!("Empty task list, returning the initial state");
            return Handle::resolved(initial_state);
        }

        let handle = Handle::pending();
        let shared = handle.share();
        let chain = Arc::clone(&self.chain);

        self.pool.spawn(move || {
            if shared.start() {
                let result = chain.run(tasks, initial_state);

                if let Err(error) = &result {
                    error!(error = %error, "Workflow chain failed");
                }

                shared.resolve(result);
            }
        });

        handle
    }

    /// submit and block until the chain finished
    pub fn run(
        &self,
        tasks: Vec<WorkflowTask>,
        initial_state: TaskState,
    ) -> Result<TaskState, ExecutorError> {
        self.submit(tasks, initial_state).wait()
    }
}

impl Chain {
    fn run(
        &self,
        mut tasks: Vec<WorkflowTask>,
        initial_state: TaskState,
    ) -> Result<TaskState, ExecutorError> {
        validate_task_list(&mut tasks).map_err(ExecutorError::InvalidWorkflow)?;

        let span = info_span!("chain", logger = %initial_state.logger_name);
        let _guard = span.enter();

        info!("Running {} tasks", tasks.len());

        tasks
            .iter()
            .try_fold(initial_state, |state, task| self.run_task(task, state))
    }

    #[instrument(skip_all, fields(task = task.name(), order = task.order))]
    fn run_task(&self, task: &WorkflowTask, state: TaskState) -> Result<TaskState, ExecutorError> {
        let options = (self.setup)(task, &self.workflow_dir, &self.workflow_dir_user, &state)?;
        let call = TaskCall::from_task(task, &self.workflow_dir_user);

        let Some(level) = &task.task.parallelization_level else {
            info!("Submitting task");

            let next = self
                .executor
                .submit(SingleTaskCall(call), state, &options)?
                .wait()?;

            info!("Task finished");

            return Ok(next);
        };

        let components = state
            .components(level)
            .map_err(|reason| ExecutorError::Setup(format!("task '{}': {reason}", task.name())))?;

        info!("Submitting parallel task over {} components", components.len());

        let work = ComponentTaskCall {
            call,
            state: state.clone(),
        };
        let units = components
            .iter()
            .enumerate()
            .map(|(index, component)| ComponentUnit {
                index,
                component: component.clone(),
            })
            .collect_vec();
        let outcomes = self.executor.map(work, units, &options)?.wait_all()?;

        for outcome in &outcomes {
            if outcome
                .metadata_diff
                .as_ref()
                .map_or(false, |diff| !diff.is_empty())
            {
                warn!(
                    "Metadata diff of component {} is ignored, parallel tasks can't change metadata",
                    outcome.component
                );
            }
        }

        info!("Parallel task finished");

        let mut next = state;
        next.push_history(format!("{}: [{}]", task.name(), components.iter().join(", ")));

        Ok(next)
    }
}
