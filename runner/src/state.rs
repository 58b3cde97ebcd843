use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

pub type Metadata = Map<String, Value>;

/// metadata key under which executed task names are recorded
pub const HISTORY_KEY: &str = "history";

/// State that is threaded through a chain of tasks
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TaskState {
    pub input_paths: Vec<PathBuf>,
    pub output_path: PathBuf,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "default_logger_name")]
    pub logger_name: String,
}

impl TaskState {
    pub fn new(input_paths: Vec<PathBuf>, output_path: PathBuf) -> Self {
        Self {
            input_paths,
            output_path,
            metadata: Metadata::new(),
            logger_name: default_logger_name(),
        }
    }

    pub fn history(&self) -> Vec<String> {
        match self.metadata.get(HISTORY_KEY) {
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|entry| match entry {
                    Value::String(entry) => entry.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn push_history(&mut self, entry: impl Into<String>) {
        let history = self
            .metadata
            .entry(HISTORY_KEY)
            .or_insert_with(|| Value::Array(Vec::new()));

        // a malformed history is replaced instead of silently dropping the entry
        if !history.is_array() {
            *history = Value::Array(Vec::new());
        }

        if let Value::Array(entries) = history {
            entries.push(Value::String(entry.into()));
        }
    }

    /// merge a metadata diff produced by a task, the history is owned by the engine
    pub fn merge_metadata(&mut self, diff: Metadata) {
        for (key, value) in diff {
            if key != HISTORY_KEY {
                self.metadata.insert(key, value);
            }
        }
    }

    /// list of components stored under `key`, which a parallel task iterates over
    pub fn components(&self, key: &str) -> Result<Vec<String>, String> {
        match self.metadata.get(key) {
            Some(Value::Array(values)) => values
                .iter()
                .map(|value| {
                    value
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| format!("metadata[{key}] contains a non-string entry"))
                })
                .collect(),
            Some(_) => Err(format!("metadata[{key}] is not a list")),
            None => Err(format!("metadata has no entry for '{key}'")),
        }
    }
}

fn default_logger_name() -> String {
    "workflow".to_string()
}
