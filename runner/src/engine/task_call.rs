use crate::{
    errors::TaskExecutionError,
    executors::Work,
    state::{Metadata, TaskState},
    util::{file_safe, shell_quote_path},
    workflow::WorkflowTask,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, instrument};

/// argument key the component of a parallel task is passed under
pub const COMPONENT_KEY: &str = "component";

/// Everything needed to run the command of one workflow task, possibly on another host
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskCall {
    pub command: String,
    pub task_name: String,
    pub workflow_task_id: Option<i64>,
    pub order: usize,
    pub args: Map<String, Value>,
    pub workflow_dir_user: PathBuf,
}

impl TaskCall {
    pub fn from_task(task: &WorkflowTask, workflow_dir_user: &Path) -> Self {
        Self {
            command: task.task.command.clone(),
            task_name: task.name().to_string(),
            workflow_task_id: task.id,
            order: task.order,
            args: task.args.clone(),
            workflow_dir_user: workflow_dir_user.to_path_buf(),
        }
    }

    // the index keeps apart components whose file-safe names collide
    fn file_stem(&self, unit: Option<&ComponentUnit>) -> String {
        match unit {
            Some(unit) => format!(
                "{}_par_{}_{}",
                self.order,
                unit.index,
                file_safe(&unit.component)
            ),
            None => self.order.to_string(),
        }
    }

    pub fn args_file(&self, component: Option<&ComponentUnit>) -> PathBuf {
        self.workflow_dir_user
            .join(format!("{}.args.json", self.file_stem(component)))
    }

    pub fn metadiff_file(&self, component: Option<&ComponentUnit>) -> PathBuf {
        self.workflow_dir_user
            .join(format!("{}.metadiff.json", self.file_stem(component)))
    }

    pub fn log_file(&self, component: Option<&ComponentUnit>) -> PathBuf {
        self.workflow_dir_user
            .join(format!("{}.log", self.file_stem(component)))
    }

    fn error(&self, traceback: impl Into<String>) -> TaskExecutionError {
        TaskExecutionError {
            traceback: traceback.into(),
            workflow_task_id: self.workflow_task_id,
            workflow_task_order: Some(self.order),
            task_name: Some(self.task_name.clone()),
        }
    }

    /// Run the command once and return the metadata diff it wrote, if any
    ///
    /// The command is called as `<command> --json <args> --metadata-out <diff>`, its stdout
    /// and stderr end up in the log file.
    #[instrument(skip(self, state), fields(task = %self.task_name, order = self.order))]
    pub fn execute(
        &self,
        state: &TaskState,
        component: Option<&ComponentUnit>,
    ) -> Result<Option<Metadata>, TaskExecutionError> {
        fs::create_dir_all(&self.workflow_dir_user).map_err(|error| {
            self.error(format!(
                "Failed to create {}: {error}",
                self.workflow_dir_user.display()
            ))
        })?;

        let args_file = self.args_file(component);
        let metadiff_file = self.metadiff_file(component);
        let log_file = self.log_file(component);

        let mut args = Map::new();
        args.insert(
            "input_paths".to_string(),
            Value::from(
                state
                    .input_paths
                    .iter()
                    .map(|path| path.to_string_lossy().into_owned())
                    .collect::<Vec<_>>(),
            ),
        );
        args.insert(
            "output_path".to_string(),
            Value::from(state.output_path.to_string_lossy().into_owned()),
        );
        args.insert(
            "metadata".to_string(),
            Value::Object(state.metadata.clone()),
        );
        args.extend(self.args.clone());
        if let Some(unit) = component {
            args.insert(
                COMPONENT_KEY.to_string(),
                Value::from(unit.component.as_str()),
            );
        }

        let content = serde_json::to_vec(&Value::Object(args))
            .map_err(|error| self.error(format!("Failed to encode arguments: {error}")))?;
        fs::write(&args_file, content).map_err(|error| {
            self.error(format!("Failed to write {}: {error}", args_file.display()))
        })?;

        // a stale diff from an earlier run must not be picked up
        let _ = fs::remove_file(&metadiff_file);

        let log = File::create(&log_file).map_err(|error| {
            self.error(format!("Failed to create {}: {error}", log_file.display()))
        })?;
        let log_err = log
            .try_clone()
            .map_err(|error| self.error(format!("Failed to duplicate log handle: {error}")))?;

        let command_line = format!(
            "{} --json {} --metadata-out {}",
            self.command,
            shell_quote_path(&args_file),
            shell_quote_path(&metadiff_file)
        );

        debug!("Running `{command_line}`");

        let status = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .stdout(log)
            .stderr(log_err)
            .status()
            .map_err(|error| self.error(format!("Failed to start `{command_line}`: {error}")))?;

        if !status.success() {
            let output = fs::read_to_string(&log_file).unwrap_or_default();

            return Err(self.error(format!(
                "`{command_line}` failed with {status}\n{output}"
            )));
        }

        if !metadiff_file.exists() {
            return Ok(None);
        }

        let diff = fs::read(&metadiff_file)
            .map_err(|error| error.to_string())
            .and_then(|content| {
                serde_json::from_slice::<Value>(&content).map_err(|error| error.to_string())
            })
            .map_err(|reason| {
                self.error(format!(
                    "Failed to read metadata diff {}: {reason}",
                    metadiff_file.display()
                ))
            })?;

        match diff {
            Value::Object(diff) => Ok(Some(diff)),
            Value::Null => Ok(None),
            _ => Err(self.error(format!(
                "Metadata diff {} is not an object",
                metadiff_file.display()
            ))),
        }
    }
}

/// Runs a non-parallel task on the whole state and produces the state for the next task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SingleTaskCall(pub TaskCall);

impl Work for SingleTaskCall {
    const NAME: &'static str = "single_task";

    type Input = TaskState;
    type Output = TaskState;

    fn run(&self, state: TaskState) -> Result<TaskState, TaskExecutionError> {
        let diff = self.0.execute(&state, None)?;

        let mut next = TaskState {
            input_paths: vec![state.output_path.clone()],
            ..state
        };

        if let Some(diff) = diff {
            next.merge_metadata(diff);
        }
        next.push_history(self.0.task_name.clone());

        Ok(next)
    }
}

/// Runs a parallel task for a single component
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ComponentTaskCall {
    pub call: TaskCall,
    pub state: TaskState,
}

/// A component together with its position in the component list
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ComponentUnit {
    pub index: usize,
    pub component: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ComponentOutcome {
    pub component: String,
    pub log_file: PathBuf,
    #[serde(default)]
    pub metadata_diff: Option<Metadata>,
}

impl Work for ComponentTaskCall {
    const NAME: &'static str = "component_task";

    type Input = ComponentUnit;
    type Output = ComponentOutcome;

    fn run(&self, unit: ComponentUnit) -> Result<ComponentOutcome, TaskExecutionError> {
        let metadata_diff = self.call.execute(&self.state, Some(&unit))?;

        Ok(ComponentOutcome {
            log_file: self.call.log_file(Some(&unit)),
            component: unit.component,
            metadata_diff,
        })
    }
}
