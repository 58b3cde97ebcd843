use super::config::SlurmConfig;
use crate::{errors::JobExecutionError, util::shell_quote_path};
use std::path::{Path, PathBuf};

/// placeholder sbatch replaces with the job id in output file names
pub const JOB_ID_PLACEHOLDER: &str = "%j";

/// A batch of units submitted as one cluster job
///
/// Every file belonging to the job starts with `prefix`, both in the server directory and in
/// the directory owned by the cluster user.
#[derive(Clone, Debug)]
pub struct SlurmJob {
    pub prefix: String,
    pub num_units: usize,
    pub parallel_units: usize,
    pub single_task_submission: bool,
    pub config: SlurmConfig,
    pub server_dir: PathBuf,
    pub user_dir: PathBuf,
    pub job_id: Option<u64>,
}

impl SlurmJob {
    pub fn new(
        prefix: String,
        num_units: usize,
        parallel_units: usize,
        single_task_submission: bool,
        config: SlurmConfig,
        server_dir: &Path,
        user_dir: &Path,
    ) -> Result<Self, JobExecutionError> {
        if num_units == 0 {
            return Err(JobExecutionError::new(format!(
                "Job {prefix} has no units"
            )));
        }
        if single_task_submission && num_units != 1 {
            return Err(JobExecutionError::new(format!(
                "Single task submission {prefix} must contain exactly one unit, got {num_units}"
            )));
        }

        Ok(Self {
            prefix,
            num_units,
            parallel_units: parallel_units.max(1),
            single_task_submission,
            config,
            server_dir: server_dir.to_path_buf(),
            user_dir: user_dir.to_path_buf(),
            job_id: None,
        })
    }

    /// number of units the job runs at once
    pub fn ntasks(&self) -> usize {
        self.parallel_units.min(self.num_units)
    }

    /// glob matching every file of this job
    pub fn file_glob(&self) -> String {
        format!("{}_*", self.prefix)
    }

    pub fn script_name(&self) -> String {
        format!("{}_slurm_submit.sbatch", self.prefix)
    }

    pub fn input_name(&self, index: usize) -> String {
        format!("{}_in_{index}.json", self.prefix)
    }

    pub fn output_name(&self, index: usize) -> String {
        format!("{}_out_{index}.json", self.prefix)
    }

    pub fn output_names(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.num_units).map(|index| self.output_name(index))
    }

    fn stream_name(&self, job_id: &str, extension: &str) -> String {
        format!("{}_slurm_{job_id}.{extension}", self.prefix)
    }

    pub fn server_script(&self) -> PathBuf {
        self.server_dir.join(self.script_name())
    }

    pub fn user_script(&self) -> PathBuf {
        self.user_dir.join(self.script_name())
    }

    pub fn user_input(&self, index: usize) -> PathBuf {
        self.user_dir.join(self.input_name(index))
    }

    pub fn user_output(&self, index: usize) -> PathBuf {
        self.user_dir.join(self.output_name(index))
    }

    pub fn server_input(&self, index: usize) -> PathBuf {
        self.server_dir.join(self.input_name(index))
    }

    pub fn server_output(&self, index: usize) -> PathBuf {
        self.server_dir.join(self.output_name(index))
    }

    /// stdout as given to sbatch, still containing the job id placeholder
    pub fn user_stdout(&self) -> PathBuf {
        self.user_dir
            .join(self.stream_name(JOB_ID_PLACEHOLDER, "out"))
    }

    pub fn user_stderr(&self) -> PathBuf {
        self.user_dir
            .join(self.stream_name(JOB_ID_PLACEHOLDER, "err"))
    }

    /// server side copy of stdout once the job id is known
    pub fn server_stdout(&self) -> Option<PathBuf> {
        self.job_id.map(|job_id| {
            self.server_dir
                .join(self.stream_name(&job_id.to_string(), "out"))
        })
    }

    pub fn server_stderr(&self) -> Option<PathBuf> {
        self.job_id.map(|job_id| {
            self.server_dir
                .join(self.stream_name(&job_id.to_string(), "err"))
        })
    }

    /// Full submission script
    ///
    /// Every unit becomes a backgrounded `srun` step, the final `wait` keeps the allocation
    /// alive until all of them have finished. Steps beyond `ntasks` queue inside the allocation.
    pub fn script(&self, worker_command: &str, kind: &str) -> String {
        let mut lines =
            self.config
                .to_sbatch_preamble(self.ntasks(), &self.user_stdout(), &self.user_stderr());

        lines.push(String::new());

        for index in 0..self.num_units {
            lines.push(format!(
                "srun --ntasks=1 --cpus-per-task={} --mem={}M {worker_command} --kind {kind} --input-file {} --output-file {} &",
                self.config.cpus_per_task,
                self.config.mem_per_task_mb,
                shell_quote_path(&self.user_input(index)),
                shell_quote_path(&self.user_output(index)),
            ));
        }

        lines.push("wait".to_string());

        let mut script = lines.join("\n");
        script.push('\n');
        script
    }

    /// infrastructure error pointing at the server side copies of the job files
    pub fn error(&self, info: impl Into<String>) -> JobExecutionError {
        JobExecutionError::new(info).with_files(
            Some(self.server_script()),
            self.server_stdout(),
            self.server_stderr(),
        )
    }
}
