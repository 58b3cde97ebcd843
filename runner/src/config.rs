use crate::{
    errors::ExecutorError,
    executors::slurm::{config::SlurmBackendConfig, session::SshTarget},
    state::TaskState,
    workflow::{validate_task_list, WorkflowTask},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Executor failed to load")]
    FailedLoadExecutor(#[from] ExecutorError),
    #[error("Failed to read the configuration")]
    Io(#[from] io::Error),
    #[error("Failed to parse the configuration")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Configuration contains errors, see the log for details")]
    Invalid,
}

/// Backend selection, the variant name is taken from `name`
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ExecutorConfig {
    Local {
        // size of the thread pool, one thread per core if unset
        #[serde(default)]
        threads: Option<usize>,
    },
    SlurmSudo {
        // user to impersonate, the current user if unset
        #[serde(default)]
        slurm_user: Option<String>,
        slurm: SlurmBackendConfig,
    },
    SlurmSsh {
        ssh: SshTarget,
        slurm: SlurmBackendConfig,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    pub executor: ExecutorConfig,
    // directory of the runner itself, a copy of every job file ends up here
    pub workflow_dir: PathBuf,
    // directory owned by the user the tasks run as, the same as workflow_dir if unset
    #[serde(default)]
    pub workflow_dir_user: Option<PathBuf>,
    pub tasks: Vec<WorkflowTask>,
    pub initial_state: TaskState,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn workflow_dir_user(&self) -> &Path {
        self.workflow_dir_user
            .as_deref()
            .unwrap_or(&self.workflow_dir)
    }

    /// Check the whole configuration and log every problem found
    ///
    /// Returns true if any error was found. Tasks are sorted by their order afterwards.
    pub fn preflight_checks(&mut self) -> bool {
        // report every problem instead of stopping at the first one
        let mut contains_error = false;

        if self.tasks.is_empty() {
            warn!("No tasks were defined, the initial state is returned as is");
        }

        if let Err(reason) = validate_task_list(&mut self.tasks) {
            error!("tasks are invalid: {reason}");
            contains_error = true;
        }

        let names = self.tasks.iter().map(WorkflowTask::name).collect_vec();
        for name in names.iter().duplicates() {
            warn!("Task name '{name}' is used more than once, logs are still kept apart by order");
        }

        for task in self.tasks.iter() {
            if let Some(level) = &task.task.parallelization_level {
                if level.trim().is_empty() {
                    error!(
                        "tasks.{}.task.parallelization_level must not be empty",
                        task.order
                    );
                    contains_error = true;
                }
            }

            let meta = task.resource_meta();
            if meta.units_per_job.is_some() != meta.parallel_units_per_job.is_some() {
                error!(
                    "tasks.{}: units_per_job and parallel_units_per_job must be set together",
                    task.order
                );
                contains_error = true;
            }
            if let Some(Err(reason)) = meta.mem.as_ref().map(|mem| mem.to_mb()) {
                error!("tasks.{}.meta.mem: {reason}", task.order);
                contains_error = true;
            }
        }

        match &self.executor {
            ExecutorConfig::Local { threads: Some(0) } => {
                error!("executor.threads must be positive");
                contains_error = true;
            }
            ExecutorConfig::Local { .. } => {}
            ExecutorConfig::SlurmSudo { slurm, .. } | ExecutorConfig::SlurmSsh { slurm, .. } => {
                contains_error |= check_slurm(slurm, &self.tasks);
            }
        }

        if let ExecutorConfig::SlurmSsh { .. } = self.executor {
            if self.workflow_dir_user.is_none() {
                warn!("workflow_dir_user is unset, the remote host has to see workflow_dir under the same path");
            }
        }

        contains_error
    }
}

fn check_slurm(slurm: &SlurmBackendConfig, tasks: &[WorkflowTask]) -> bool {
    let mut contains_error = false;

    if let Err(error) = slurm.batching_config.validate() {
        error!("executor.slurm.batching_config: {error}");
        contains_error = true;
    }

    if let Err(reason) = slurm.default_slurm_config.mem.to_mb() {
        error!("executor.slurm.default_slurm_config.mem: {reason}");
        contains_error = true;
    }

    if slurm.worker_command.trim().is_empty() {
        error!("executor.slurm.worker_command must not be empty");
        contains_error = true;
    }

    if slurm.poll_interval_ms == 0 {
        error!("executor.slurm.poll_interval_ms must be positive");
        contains_error = true;
    }

    for task in tasks {
        if let Err(error) = slurm.slurm_config_for(task) {
            error!("tasks.{} ({}): {error}", task.order, task.name());
            contains_error = true;
        }
    }

    contains_error
}
