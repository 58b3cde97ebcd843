use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Memory requirement, either plain megabytes or a string with a unit suffix (e.g., `4G`)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MemValue {
    Megabytes(u64),
    Text(String),
}

impl MemValue {
    pub fn to_mb(&self) -> Result<u64, String> {
        match self {
            Self::Megabytes(value) => Ok(*value),
            Self::Text(text) => parse_mem_value(text),
        }
    }
}

/// parse `1000`, `1000M`, `4G`, `2T` or `512000K` into megabytes
pub fn parse_mem_value(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let error = || format!("invalid memory value '{text}'");

    if let Ok(value) = text.parse::<u64>() {
        return Ok(value);
    }

    let Some((split, suffix)) = text.char_indices().last() else {
        return Err(error());
    };
    let number = text[..split].parse::<u64>().map_err(|_| error())?;

    match suffix.to_ascii_uppercase() {
        'K' => Ok(number.div_ceil(1000).max(1)),
        'M' => Ok(number),
        'G' => number.checked_mul(1000).ok_or_else(error),
        'T' => number.checked_mul(1_000_000).ok_or_else(error),
        _ => Err(error()),
    }
}

/// Per-task resource hints, values set on a workflow task override the task defaults
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceMeta {
    pub cpus_per_task: Option<u32>,
    pub mem: Option<MemValue>,
    pub needs_gpu: Option<bool>,
    pub time: Option<String>,
    pub account: Option<String>,
    pub constraint: Option<String>,
    pub gres: Option<String>,
    pub extra_lines: Option<Vec<String>>,
    pub units_per_job: Option<usize>,
    pub parallel_units_per_job: Option<usize>,
}

impl ResourceMeta {
    /// field-wise override, every value set in `other` wins
    pub fn overridden_by(&self, other: &ResourceMeta) -> ResourceMeta {
        ResourceMeta {
            cpus_per_task: other.cpus_per_task.or(self.cpus_per_task),
            mem: other.mem.clone().or_else(|| self.mem.clone()),
            needs_gpu: other.needs_gpu.or(self.needs_gpu),
            time: other.time.clone().or_else(|| self.time.clone()),
            account: other.account.clone().or_else(|| self.account.clone()),
            constraint: other.constraint.clone().or_else(|| self.constraint.clone()),
            gres: other.gres.clone().or_else(|| self.gres.clone()),
            extra_lines: other
                .extra_lines
                .clone()
                .or_else(|| self.extra_lines.clone()),
            units_per_job: other.units_per_job.or(self.units_per_job),
            parallel_units_per_job: other
                .parallel_units_per_job
                .or(self.parallel_units_per_job),
        }
    }
}

/// Reusable task definition
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub name: String,
    pub command: String,
    // metadata key holding the components a parallel task fans out over
    #[serde(default)]
    pub parallelization_level: Option<String>,
    #[serde(default)]
    pub meta: ResourceMeta,
}

/// A task placed at a position within a workflow
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowTask {
    #[serde(default)]
    pub id: Option<i64>,
    pub order: usize,
    pub task: Task,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub meta: ResourceMeta,
}

impl WorkflowTask {
    pub fn name(&self) -> &str {
        &self.task.name
    }

    /// task defaults overridden by the values of this workflow task
    pub fn resource_meta(&self) -> ResourceMeta {
        self.task.meta.overridden_by(&self.meta)
    }
}

/// sort tasks by order and ensure orders are unique and contiguous
pub fn validate_task_list(tasks: &mut [WorkflowTask]) -> Result<(), String> {
    tasks.sort_by_key(|task| task.order);

    for pair in tasks.windows(2) {
        if pair[0].order == pair[1].order {
            return Err(format!(
                "tasks '{}' and '{}' share order {}",
                pair[0].name(),
                pair[1].name(),
                pair[0].order
            ));
        }

        if pair[1].order != pair[0].order + 1 {
            return Err(format!(
                "gap between order {} and {}",
                pair[0].order, pair[1].order
            ));
        }
    }

    for task in tasks.iter() {
        if task.task.command.trim().is_empty() {
            return Err(format!("task '{}' has an empty command", task.name()));
        }
    }

    Ok(())
}
