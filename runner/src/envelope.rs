use crate::errors::{ExecutorError, JobExecutionError, TaskExecutionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const TASK_EXECUTION_ERROR: &str = "TaskExecutionError";
pub const JOB_EXECUTION_ERROR: &str = "JobExecutionError";

const CONTEXT_WORKFLOW_TASK_ID: &str = "workflow_task_id";
const CONTEXT_WORKFLOW_TASK_ORDER: &str = "workflow_task_order";
const CONTEXT_TASK_NAME: &str = "task_name";

/// Serializable stand-in for an error that has to cross a process or host boundary
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExceptionProxy {
    pub kind: String,
    pub traceback: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

/// Outcome of a single executed unit as written by the worker
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultEnvelope<T> {
    Success { value: T },
    Failure { proxy: ExceptionProxy },
}

impl ExceptionProxy {
    pub fn job(traceback: impl Into<String>) -> Self {
        Self {
            kind: JOB_EXECUTION_ERROR.to_string(),
            traceback: traceback.into(),
            context: BTreeMap::new(),
        }
    }

    /// rebuild the error kind the proxy was created from
    pub fn into_error(self) -> ExecutorError {
        match self.kind.as_str() {
            JOB_EXECUTION_ERROR => JobExecutionError::new(self.traceback).into(),
            // anything raised by the unit itself counts as a task failure
            _ => TaskExecutionError {
                workflow_task_id: self
                    .context
                    .get(CONTEXT_WORKFLOW_TASK_ID)
                    .and_then(Value::as_i64),
                workflow_task_order: self
                    .context
                    .get(CONTEXT_WORKFLOW_TASK_ORDER)
                    .and_then(Value::as_u64)
                    .map(|order| order as usize),
                task_name: self
                    .context
                    .get(CONTEXT_TASK_NAME)
                    .and_then(Value::as_str)
                    .map(str::to_string),
                traceback: self.traceback,
            }
            .into(),
        }
    }
}

impl From<TaskExecutionError> for ExceptionProxy {
    fn from(error: TaskExecutionError) -> Self {
        let mut context = BTreeMap::new();

        if let Some(id) = error.workflow_task_id {
            context.insert(CONTEXT_WORKFLOW_TASK_ID.to_string(), Value::from(id));
        }
        if let Some(order) = error.workflow_task_order {
            context.insert(CONTEXT_WORKFLOW_TASK_ORDER.to_string(), Value::from(order));
        }
        if let Some(name) = error.task_name {
            context.insert(CONTEXT_TASK_NAME.to_string(), Value::from(name));
        }

        Self {
            kind: TASK_EXECUTION_ERROR.to_string(),
            traceback: error.traceback,
            context,
        }
    }
}

impl<T> ResultEnvelope<T> {
    pub fn into_result(self) -> Result<T, ExecutorError> {
        match self {
            Self::Success { value } => Ok(value),
            Self::Failure { proxy } => Err(proxy.into_error()),
        }
    }
}

impl<T> From<Result<T, TaskExecutionError>> for ResultEnvelope<T> {
    fn from(result: Result<T, TaskExecutionError>) -> Self {
        match result {
            Ok(value) => Self::Success { value },
            Err(error) => Self::Failure {
                proxy: error.into(),
            },
        }
    }
}
