use crate::{
    errors::TaskExecutionError,
    executors::{
        slurm::{
            batching::BatchingBudget,
            config::{ClusterCommands, SlurmBackendConfig, SlurmDefaults},
        },
        Work,
    },
    workflow::{MemValue, ResourceMeta, Task, WorkflowTask},
};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

pub fn budget() -> BatchingBudget {
    BatchingBudget {
        target_cpus_per_job: 8,
        max_cpus_per_job: 16,
        target_mem_per_job: 31000,
        max_mem_per_job: 62000,
        target_num_jobs: 100,
        max_num_jobs: 200,
    }
}

pub fn backend_config() -> SlurmBackendConfig {
    SlurmBackendConfig {
        default_slurm_config: SlurmDefaults {
            partition: "main".to_string(),
            cpus_per_task: 1,
            mem: MemValue::Megabytes(1000),
            constraint: None,
            gres: None,
            time: None,
            account: None,
            extra_lines: Vec::new(),
        },
        gpu_slurm_config: None,
        batching_config: budget(),
        worker_command: "tessera-runner worker".to_string(),
        commands: ClusterCommands::default(),
        poll_interval_ms: 20,
        output_grace_ms: 20,
        command_timeout_secs: 10,
    }
}

pub fn workflow_task(order: usize, name: &str, command: &str) -> WorkflowTask {
    WorkflowTask {
        id: Some(order as i64 + 1),
        order,
        task: Task {
            name: name.to_string(),
            command: command.to_string(),
            parallelization_level: None,
            meta: ResourceMeta::default(),
        },
        args: Map::new(),
        meta: ResourceMeta::default(),
    }
}

pub fn parallel_task(order: usize, name: &str, command: &str, level: &str) -> WorkflowTask {
    let mut task = workflow_task(order, name, command);
    task.task.parallelization_level = Some(level.to_string());
    task
}

/// write an executable shell script
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);

    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    path
}

/// squares its input, 13 fails and 99 panics
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Square;

impl Work for Square {
    const NAME: &'static str = "square";

    type Input = u64;
    type Output = u64;

    fn run(&self, input: u64) -> Result<u64, TaskExecutionError> {
        match input {
            13 => Err(TaskExecutionError {
                traceback: "13 is unlucky".to_string(),
                workflow_task_id: Some(7),
                workflow_task_order: Some(2),
                task_name: Some("square".to_string()),
            }),
            99 => panic!("99 panics"),
            input => Ok(input * input),
        }
    }
}
