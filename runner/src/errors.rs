use crate::executors::slurm::{batching::SizingError, config::SlurmConfigError};
use std::{fmt, fs, path::PathBuf};
use thiserror::Error;

/// Failure raised by the code of a task itself
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionError {
    pub traceback: String,
    pub workflow_task_id: Option<i64>,
    pub workflow_task_order: Option<usize>,
    pub task_name: Option<String>,
}

impl TaskExecutionError {
    pub fn new(traceback: impl Into<String>) -> Self {
        Self {
            traceback: traceback.into(),
            workflow_task_id: None,
            workflow_task_order: None,
            task_name: None,
        }
    }
}

impl fmt::Display for TaskExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.task_name, self.workflow_task_order) {
            (Some(name), Some(order)) => write!(f, "task '{name}' (order {order}) failed")?,
            (Some(name), None) => write!(f, "task '{name}' failed")?,
            _ => write!(f, "task failed")?,
        }

        if let Some(id) = self.workflow_task_id {
            write!(f, " [workflow task {id}]")?;
        }

        write!(f, ":\n{}", self.traceback)
    }
}

impl std::error::Error for TaskExecutionError {}

/// Infrastructure failure, i.e., something went wrong around the task and not inside of it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobExecutionError {
    pub info: Option<String>,
    pub cmd_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
}

impl JobExecutionError {
    pub fn new(info: impl Into<String>) -> Self {
        Self {
            info: Some(info.into()),
            ..Default::default()
        }
    }

    pub fn with_files(
        mut self,
        cmd_file: Option<PathBuf>,
        stdout_file: Option<PathBuf>,
        stderr_file: Option<PathBuf>,
    ) -> Self {
        self.cmd_file = cmd_file;
        self.stdout_file = stdout_file;
        self.stderr_file = stderr_file;
        self
    }

    /// build a human readable message out of all referenced files and the additional info
    pub fn assemble_error(&self) -> String {
        let mut message = String::new();

        for (label, file) in [
            ("COMMAND", &self.cmd_file),
            ("STDOUT", &self.stdout_file),
            ("STDERR", &self.stderr_file),
        ] {
            if let Some(path) = file {
                let content = match fs::read_to_string(path) {
                    Ok(content) if content.trim().is_empty() => {
                        format!("{}: file is empty", path.display())
                    }
                    Ok(content) => content,
                    Err(_) => format!("{}: file is missing", path.display()),
                };

                message.push_str(&format!("{label}:\n{content}\n"));
            }
        }

        if let Some(info) = &self.info {
            message.push_str(&format!("ADDITIONAL INFO:\n{info}\n"));
        }

        message
    }
}

impl fmt::Display for JobExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job execution failed:\n{}", self.assemble_error())
    }
}

impl std::error::Error for JobExecutionError {}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Task(#[from] TaskExecutionError),
    #[error(transparent)]
    Job(#[from] JobExecutionError),
    #[error("Failed to size jobs: {0}")]
    Sizing(#[from] SizingError),
    #[error("Invalid slurm configuration: {0}")]
    SlurmConfig(#[from] SlurmConfigError),
    #[error("Work was cancelled before it started")]
    Cancelled,
    #[error("Executor has already been shut down")]
    Shutdown,
    #[error("Task setup failed: {0}")]
    Setup(String),
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("Submission options do not match the selected executor")]
    OptionsMismatch,
    #[error("Failed to (de)serialize work")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn is_task_error(&self) -> bool {
        matches!(self, Self::Task(_))
    }

    pub fn is_job_error(&self) -> bool {
        matches!(self, Self::Job(_))
    }
}
