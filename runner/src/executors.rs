pub mod local;
pub mod slurm;

#[cfg(test)]
mod slurm_test;

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    errors::{ExecutorError, TaskExecutionError},
    handle::{Handle, MapResults},
    state::TaskState,
    workflow::WorkflowTask,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    path::Path,
};

/// A serializable unit of work
///
/// `NAME` identifies the concrete type when a serialized unit is loaded by the worker entry
/// point on a remote host.
pub trait Work: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(&self, input: Self::Input) -> Result<Self::Output, TaskExecutionError>;
}

/// Common interface of all backends
pub trait Executor {
    type Options;

    /// run exactly one unit
    fn submit<W: Work>(
        &self,
        work: W,
        input: W::Input,
        options: &Self::Options,
    ) -> Result<Handle<W::Output>, ExecutorError>;

    /// run one unit per input, results are yielded in input order
    fn map<W: Work>(
        &self,
        work: W,
        inputs: Vec<W::Input>,
        options: &Self::Options,
    ) -> Result<MapResults<W::Output>, ExecutorError>;

    fn shutdown(&self);
}

/// Backend specific submission options, as produced by the setup callback
#[derive(Clone, Debug)]
pub enum SubmitOptions {
    Local(local::LocalOptions),
    Slurm(slurm::config::SlurmConfig),
}

/// All available executors, selected once from the configuration
///
/// `Executor` has generic methods and can't be a trait object, so backends are matched here.
#[derive(Debug)]
pub enum Executors {
    Local(local::LocalExecutor),
    Slurm(slurm::SlurmExecutor),
}

impl Executors {
    pub fn load(
        config: &ExecutorConfig,
        workflow_dir: &Path,
        workflow_dir_user: &Path,
    ) -> Result<Self, ConfigErrors> {
        match config {
            ExecutorConfig::Local { threads } => {
                Ok(Self::Local(local::LocalExecutor::load(*threads)?))
            }
            ExecutorConfig::SlurmSudo { slurm_user, slurm } => {
                let impersonation = slurm::session::Impersonation::sudo(slurm_user.clone());

                Ok(Self::Slurm(slurm::SlurmExecutor::load(
                    slurm.clone(),
                    impersonation,
                    workflow_dir,
                    workflow_dir_user,
                )?))
            }
            ExecutorConfig::SlurmSsh { ssh, slurm } => {
                let impersonation = slurm::session::Impersonation::Ssh(ssh.clone());

                Ok(Self::Slurm(slurm::SlurmExecutor::load(
                    slurm.clone(),
                    impersonation,
                    workflow_dir,
                    workflow_dir_user,
                )?))
            }
        }
    }

    /// default setup callback, derive the submission options for a single workflow task
    pub fn setup(
        &self,
        task: &WorkflowTask,
        _workflow_dir: &Path,
        _workflow_dir_user: &Path,
        _state: &TaskState,
    ) -> Result<SubmitOptions, ExecutorError> {
        match self {
            Self::Local(_) => Ok(SubmitOptions::Local(local::LocalOptions::for_task(task))),
            Self::Slurm(executor) => Ok(SubmitOptions::Slurm(executor.slurm_config_for(task)?)),
        }
    }
}

impl Executor for Executors {
    type Options = SubmitOptions;

    fn submit<W: Work>(
        &self,
        work: W,
        input: W::Input,
        options: &SubmitOptions,
    ) -> Result<Handle<W::Output>, ExecutorError> {
        match (self, options) {
            (Self::Local(executor), SubmitOptions::Local(options)) => {
                executor.submit(work, input, options)
            }
            (Self::Slurm(executor), SubmitOptions::Slurm(options)) => {
                executor.submit(work, input, options)
            }
            _ => Err(ExecutorError::OptionsMismatch),
        }
    }

    fn map<W: Work>(
        &self,
        work: W,
        inputs: Vec<W::Input>,
        options: &SubmitOptions,
    ) -> Result<MapResults<W::Output>, ExecutorError> {
        match (self, options) {
            (Self::Local(executor), SubmitOptions::Local(options)) => {
                executor.map(work, inputs, options)
            }
            (Self::Slurm(executor), SubmitOptions::Slurm(options)) => {
                executor.map(work, inputs, options)
            }
            _ => Err(ExecutorError::OptionsMismatch),
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Local(executor) => executor.shutdown(),
            Self::Slurm(executor) => executor.shutdown(),
        }
    }
}

/// run a unit and turn panics into task failures
pub fn run_guarded<W: Work>(work: &W, input: W::Input) -> Result<W::Output, TaskExecutionError> {
    match panic::catch_unwind(AssertUnwindSafe(|| work.run(input))) {
        Ok(result) => result,
        Err(payload) => Err(TaskExecutionError::new(format!(
            "{} panicked: {}",
            W::NAME,
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
