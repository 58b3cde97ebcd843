use super::batching::BatchingBudget;
use crate::workflow::{MemValue, WorkflowTask};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const SBATCH_PREFIX: &str = "#SBATCH";
pub const SHEBANG: &str = "#!/bin/sh";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlurmConfigError {
    #[error("extra_lines contains repeated entries: {0:?}")]
    DuplicateExtraLines(Vec<String>),
    #[error("Invalid memory value: {0}")]
    InvalidMemory(String),
    #[error("cpus_per_task must be positive")]
    ZeroCpus,
    #[error("mem_per_task must be positive")]
    ZeroMemory,
    #[error("Task requires a GPU but no gpu_slurm_config is defined")]
    MissingGpuConfig,
}

/// Resources and batching parameters for one submission
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SlurmConfig {
    pub partition: String,
    pub cpus_per_task: u32,
    pub mem_per_task_mb: u64,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub gres: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub extra_lines: Vec<String>,
    // both unset means they are derived by the batching heuristics
    #[serde(default)]
    pub units_per_job: Option<usize>,
    #[serde(default)]
    pub parallel_units_per_job: Option<usize>,
    pub budget: BatchingBudget,
}

impl SlurmConfig {
    pub fn validate(&self) -> Result<(), SlurmConfigError> {
        if self.cpus_per_task == 0 {
            return Err(SlurmConfigError::ZeroCpus);
        }
        if self.mem_per_task_mb == 0 {
            return Err(SlurmConfigError::ZeroMemory);
        }

        let duplicates = self
            .extra_lines
            .iter()
            .duplicates()
            .cloned()
            .collect_vec();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(SlurmConfigError::DuplicateExtraLines(duplicates))
        }
    }

    /// extra lines with `#SBATCH` directives before everything else, order is kept otherwise
    pub fn sorted_extra_lines(&self) -> Vec<&str> {
        let (directives, others): (Vec<&str>, Vec<&str>) = self
            .extra_lines
            .iter()
            .map(String::as_str)
            .partition(|line| line.starts_with(SBATCH_PREFIX));

        directives.into_iter().chain(others).collect()
    }

    /// header of a submission script for `ntasks` units running at once
    pub fn to_sbatch_preamble(&self, ntasks: usize, stdout: &Path, stderr: &Path) -> Vec<String> {
        let mem_per_job = self.mem_per_task_mb * ntasks as u64;
        let mut lines = vec![
            SHEBANG.to_string(),
            format!("{SBATCH_PREFIX} --partition={}", self.partition),
            format!("{SBATCH_PREFIX} --ntasks={ntasks}"),
            format!("{SBATCH_PREFIX} --cpus-per-task={}", self.cpus_per_task),
            format!("{SBATCH_PREFIX} --mem={mem_per_job}M"),
        ];

        for (option, value) in [
            ("job-name", &self.job_name),
            ("constraint", &self.constraint),
            ("gres", &self.gres),
            ("time", &self.time),
            ("account", &self.account),
        ] {
            if let Some(value) = value {
                lines.push(format!("{SBATCH_PREFIX} --{option}={value}"));
            }
        }

        lines.push(format!("{SBATCH_PREFIX} --err={}", stderr.display()));
        lines.push(format!("{SBATCH_PREFIX} --out={}", stdout.display()));
        lines.extend(self.sorted_extra_lines().into_iter().map(str::to_string));

        lines
    }
}

/// Cluster wide defaults for every task
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SlurmDefaults {
    pub partition: String,
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u32,
    pub mem: MemValue,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub gres: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub extra_lines: Vec<String>,
}

/// Values replacing the defaults for tasks that need a GPU
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct GpuOverrides {
    pub partition: Option<String>,
    pub cpus_per_task: Option<u32>,
    pub mem: Option<MemValue>,
    pub constraint: Option<String>,
    pub gres: Option<String>,
    pub time: Option<String>,
    pub account: Option<String>,
    #[serde(default)]
    pub extra_lines: Vec<String>,
}

/// Programs used to talk to the cluster
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterCommands {
    #[serde(default = "default_submit")]
    pub submit: String,
    #[serde(default = "default_cancel")]
    pub cancel: String,
    #[serde(default = "default_query")]
    pub query: String,
}

impl Default for ClusterCommands {
    fn default() -> Self {
        Self {
            submit: default_submit(),
            cancel: default_cancel(),
            query: default_query(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SlurmBackendConfig {
    pub default_slurm_config: SlurmDefaults,
    #[serde(default)]
    pub gpu_slurm_config: Option<GpuOverrides>,
    pub batching_config: BatchingBudget,
    /// command line starting the worker on a compute node, `--kind` and the file flags are appended
    pub worker_command: String,
    #[serde(default)]
    pub commands: ClusterCommands,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// wait before declaring an output of a finished job missing
    #[serde(default = "default_output_grace_ms")]
    pub output_grace_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl SlurmBackendConfig {
    /// merge defaults, gpu overrides and the task meta into the config of a single task
    pub fn slurm_config_for(&self, task: &WorkflowTask) -> Result<SlurmConfig, SlurmConfigError> {
        let defaults = &self.default_slurm_config;
        let meta = task.resource_meta();

        let mut partition = defaults.partition.clone();
        let mut cpus_per_task = defaults.cpus_per_task;
        let mut mem = defaults.mem.clone();
        let mut constraint = defaults.constraint.clone();
        let mut gres = defaults.gres.clone();
        let mut time = defaults.time.clone();
        let mut account = defaults.account.clone();
        let mut extra_lines = defaults.extra_lines.clone();

        if meta.needs_gpu.unwrap_or(false) {
            let gpu = self
                .gpu_slurm_config
                .as_ref()
                .ok_or(SlurmConfigError::MissingGpuConfig)?;

            partition = gpu.partition.clone().unwrap_or(partition);
            cpus_per_task = gpu.cpus_per_task.unwrap_or(cpus_per_task);
            mem = gpu.mem.clone().unwrap_or(mem);
            constraint = gpu.constraint.clone().or(constraint);
            gres = gpu.gres.clone().or(gres);
            time = gpu.time.clone().or(time);
            account = gpu.account.clone().or(account);
            extra_lines.extend(gpu.extra_lines.iter().cloned());
        }

        cpus_per_task = meta.cpus_per_task.unwrap_or(cpus_per_task);
        mem = meta.mem.clone().unwrap_or(mem);
        constraint = meta.constraint.clone().or(constraint);
        gres = meta.gres.clone().or(gres);
        time = meta.time.clone().or(time);
        account = meta.account.clone().or(account);
        if let Some(lines) = &meta.extra_lines {
            extra_lines.extend(lines.iter().cloned());
        }

        let config = SlurmConfig {
            partition,
            cpus_per_task,
            mem_per_task_mb: mem.to_mb().map_err(SlurmConfigError::InvalidMemory)?,
            job_name: Some(job_name(task.name())),
            constraint,
            gres,
            time,
            account,
            extra_lines,
            units_per_job: meta.units_per_job,
            parallel_units_per_job: meta.parallel_units_per_job,
            budget: self.batching_config,
        };

        config.validate()?;

        Ok(config)
    }
}

/// task names can contain anything, job names are kept to a safe subset
pub fn job_name(task_name: &str) -> String {
    task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn default_cpus_per_task() -> u32 {
    1
}

fn default_submit() -> String {
    "sbatch".to_string()
}

fn default_cancel() -> String {
    "scancel".to_string()
}

fn default_query() -> String {
    "squeue".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_output_grace_ms() -> u64 {
    4000
}

fn default_command_timeout_secs() -> u64 {
    60
}
