pub mod batching;
pub mod config;
pub mod job;
pub mod session;
mod watcher;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod session_test;

use self::{
    batching::heuristics,
    config::{SlurmBackendConfig, SlurmConfig},
    job::SlurmJob,
    session::{Impersonation, UserSession},
};
use super::{Executor, Work};
use crate::{
    envelope::ResultEnvelope,
    errors::{ExecutorError, JobExecutionError},
    handle::{Handle, MapResults},
    worker::{temporary_path, UnitCallRef},
    workflow::WorkflowTask,
};
use globset::GlobBuilder;
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};

/// A submitted job whose handles still wait for results
pub(crate) trait LiveJob: Send + Sync {
    fn job(&self) -> &SlurmJob;

    /// copy the results back and resolve every handle of the job
    fn collect(&self, context: &Context);

    /// resolve every handle of the job with the same error
    fn fail(&self, error: JobExecutionError);
}

struct PendingJob<T> {
    job: SlurmJob,
    handles: Vec<Handle<T>>,
}

impl<T: DeserializeOwned + Send + 'static> LiveJob for PendingJob<T> {
    fn job(&self) -> &SlurmJob {
        &self.job
    }

    fn collect(&self, context: &Context) {
        let job = &self.job;
        let job_id = job.job_id.unwrap_or_default();

        context.copy_job_files(job);

        let missing = (0..job.num_units)
            .filter(|index| !job.server_output(*index).exists())
            .collect_vec();

        if !missing.is_empty() {
            // the shared filesystem may lag behind the cluster's view of the job
            debug!(
                job_id,
                missing = missing.len(),
                "Outputs not found, retrying after grace period"
            );
            thread::sleep(context.output_grace());

            for index in missing {
                context.copy_if_present(&job.user_output(index), &job.server_output(index));
            }
        }

        for (index, handle) in self.handles.iter().enumerate() {
            let output = job.server_output(index);

            let result = if output.exists() {
                read_envelope::<T>(&output)
                    .map_err(|info| ExecutorError::from(job.error(info)))
                    .and_then(ResultEnvelope::into_result)
            } else {
                Err(job
                    .error(format!(
                        "Output file {} of unit {index} in job {job_id} is missing",
                        job.user_output(index).display()
                    ))
                    .into())
            };

            if let Err(error) = &result {
                debug!(job_id, index, error = %error, "Unit failed");
            }

            context.remove_unit_files(job, index);
            handle.resolve(result);
        }
    }

    fn fail(&self, error: JobExecutionError) {
        for handle in &self.handles {
            handle.resolve(Err(error.clone().into()));
        }
    }
}

fn read_envelope<T: DeserializeOwned>(path: &Path) -> Result<ResultEnvelope<T>, String> {
    let content = fs::read(path).map_err(|error| format!("Failed to read {}: {error}", path.display()))?;

    serde_json::from_slice(&content)
        .map_err(|error| format!("Failed to decode {}: {error}", path.display()))
}

/// State shared between the executor and its watcher thread
pub(crate) struct Context {
    pub(crate) config: SlurmBackendConfig,
    pub(crate) session: UserSession,
    pub(crate) server_dir: PathBuf,
    pub(crate) user_dir: PathBuf,
    pub(crate) jobs: Mutex<BTreeMap<u64, Arc<dyn LiveJob>>>,
    pub(crate) stopped: Mutex<bool>,
    pub(crate) wake: Condvar,
}

impl Context {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn output_grace(&self) -> Duration {
        Duration::from_millis(self.config.output_grace_ms)
    }

    fn same_dirs(&self) -> bool {
        self.server_dir == self.user_dir
    }

    /// copy every file of the job from the user directory into the server directory
    fn copy_job_files(&self, job: &SlurmJob) {
        if self.same_dirs() {
            return;
        }

        let matcher = match GlobBuilder::new(&job.file_glob())
            .literal_separator(true)
            .build()
        {
            Ok(glob) => glob.compile_matcher(),
            Err(error) => {
                error!(error = ?error, "Invalid job file pattern {}", job.file_glob());
                return;
            }
        };

        let names = match self.session.list_files(&self.user_dir) {
            Ok(names) => names,
            Err(error) => {
                warn!(error = %error, "Failed to list {}", self.user_dir.display());
                return;
            }
        };

        for name in names.into_iter().filter(|name| matcher.is_match(name)) {
            self.copy_file(&self.user_dir.join(&name), &self.server_dir.join(&name));
        }
    }

    fn copy_file(&self, from: &Path, to: &Path) {
        if self.same_dirs() {
            return;
        }

        match self.session.read_file(from) {
            Ok(content) => {
                if let Err(error) = fs::write(to, content) {
                    warn!(error = ?error, "Failed to write {}", to.display());
                }
            }
            Err(error) => debug!(error = %error, "Failed to copy {}", from.display()),
        }
    }

    fn copy_if_present(&self, from: &Path, to: &Path) {
        match self.session.path_exists(from) {
            Ok(true) => self.copy_file(from, to),
            Ok(false) => {}
            Err(error) => warn!(error = %error, "Failed to look for {}", from.display()),
        }
    }

    /// remove input, output and a partially written output of one unit
    fn remove_unit_files(&self, job: &SlurmJob, index: usize) {
        let user_output = job.user_output(index);
        let user_files = [
            job.user_input(index),
            temporary_path(&user_output),
            user_output,
        ];

        if let Err(error) = self.session.remove_files(&user_files) {
            warn!(error = %error, "Failed to remove unit files of {}", job.prefix);
        }

        if !self.same_dirs() {
            let server_output = job.server_output(index);

            for path in [
                job.server_input(index),
                temporary_path(&server_output),
                server_output,
            ] {
                let _ = fs::remove_file(path);
            }
        }
    }

    /// remove every file of a job that never made it onto the cluster
    fn discard_job_files(&self, job: &SlurmJob) {
        for index in 0..job.num_units {
            self.remove_unit_files(job, index);
        }

        if let Err(error) = self.session.remove_files(&[job.user_script()]) {
            warn!(error = %error, "Failed to remove {}", job.script_name());
        }
        if !self.same_dirs() {
            let _ = fs::remove_file(job.server_script());
        }
    }

    fn cancel_job(&self, job_id: u64) {
        if let Err(error) =
            self.session
                .run_checked(&self.config.commands.cancel, &[job_id.to_string()], None)
        {
            warn!(job_id, error = %error, "Failed to cancel job");
        }
    }
}

/// Executor submitting batches of units as jobs to a SLURM cluster
///
/// Files are staged in the directory of the cluster user through a `UserSession`, a watcher
/// thread polls for finished jobs and resolves their handles.
pub struct SlurmExecutor {
    context: Arc<Context>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    counter: AtomicU64,
    shut_down: AtomicBool,
}

impl fmt::Debug for SlurmExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlurmExecutor")
            .field("impersonation", self.context.session.impersonation())
            .field("server_dir", &self.context.server_dir)
            .field("user_dir", &self.context.user_dir)
            .field("live_jobs", &self.context.jobs.lock().len())
            .finish()
    }
}

impl SlurmExecutor {
    /// create the working directories and start the watcher
    pub fn load(
        config: SlurmBackendConfig,
        impersonation: Impersonation,
        workflow_dir: &Path,
        workflow_dir_user: &Path,
    ) -> Result<Self, ExecutorError> {
        config.batching_config.validate()?;

        let session = UserSession::new(
            impersonation,
            Duration::from_secs(config.command_timeout_secs),
        );

        fs::create_dir_all(workflow_dir)?;
        session.mkdir(workflow_dir_user)?;

        let context = Arc::new(Context {
            config,
            session,
            server_dir: workflow_dir.to_path_buf(),
            user_dir: workflow_dir_user.to_path_buf(),
            jobs: Mutex::new(BTreeMap::new()),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let watcher = watcher::spawn(Arc::clone(&context))?;

        info!(
            "Started slurm executor on {} (user directory {})",
            workflow_dir.display(),
            workflow_dir_user.display()
        );

        Ok(Self {
            context,
            watcher: Mutex::new(Some(watcher)),
            counter: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn slurm_config_for(&self, task: &WorkflowTask) -> Result<SlurmConfig, ExecutorError> {
        Ok(self.context.config.slurm_config_for(task)?)
    }

    /// number of submitted jobs that have not been collected yet
    pub fn live_jobs(&self) -> usize {
        self.context.jobs.lock().len()
    }

    fn ensure_running(&self) -> Result<(), ExecutorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(ExecutorError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn submit_units<W: Work>(
        &self,
        work: &W,
        inputs: Vec<W::Input>,
        config: &SlurmConfig,
        single_task_submission: bool,
    ) -> Result<Vec<Handle<W::Output>>, ExecutorError> {
        self.ensure_running()?;
        config.validate()?;

        let handles = (0..inputs.len()).map(|_| Handle::pending()).collect_vec();

        if inputs.is_empty() {
            return Ok(handles);
        }

        let (units_per_job, parallel) = if single_task_submission {
            (1, 1)
        } else {
            heuristics(
                inputs.len(),
                config.units_per_job,
                config.parallel_units_per_job,
                u64::from(config.cpus_per_task),
                config.mem_per_task_mb,
                &config.budget,
            )?
        };

        debug!(
            "Submitting {} units in jobs of {units_per_job} with {parallel} in parallel",
            inputs.len()
        );

        let units = inputs
            .into_iter()
            .zip(handles.iter().map(Handle::share))
            .chunks(units_per_job);

        for batch in &units {
            let (batch_inputs, batch_handles): (Vec<_>, Vec<_>) = batch.unzip();

            if let Err(error) = self.submit_batch(
                work,
                batch_inputs,
                batch_handles,
                parallel,
                config,
                single_task_submission,
            ) {
                error!(error = %error, "Failed to submit job, cancelling the previous ones");

                // already submitted batches hold shares of these handles
                for handle in &handles {
                    handle.cancel();
                }

                return Err(error);
            }
        }

        Ok(handles)
    }

    fn submit_batch<W: Work>(
        &self,
        work: &W,
        inputs: Vec<W::Input>,
        handles: Vec<Handle<W::Output>>,
        parallel: usize,
        config: &SlurmConfig,
        single_task_submission: bool,
    ) -> Result<(), ExecutorError> {
        let context = &self.context;
        let prefix = format!("job_{:06}", self.counter.fetch_add(1, Ordering::SeqCst));
        let mut job = SlurmJob::new(
            prefix,
            inputs.len(),
            parallel,
            single_task_submission,
            config.clone(),
            &context.server_dir,
            &context.user_dir,
        )?;

        let job_id = match self.stage_and_submit(work, &inputs, &job) {
            Ok(job_id) => job_id,
            Err(error) => {
                context.discard_job_files(&job);
                return Err(error);
            }
        };
        job.job_id = Some(job_id);

        info!(job_id, units = job.num_units, "Submitted {}", job.script_name());

        for handle in &handles {
            handle.start();

            let session = context.session.clone();
            let cancel = context.config.commands.cancel.clone();

            handle.set_cancel_hook(move || {
                if let Err(error) = session.run_checked(&cancel, &[job_id.to_string()], None) {
                    warn!(job_id, error = %error, "Failed to cancel job");
                }
            });
        }

        context
            .jobs
            .lock()
            .insert(job_id, Arc::new(PendingJob { job, handles }));

        Ok(())
    }

    /// write the unit files and the script, then submit the script
    fn stage_and_submit<W: Work>(
        &self,
        work: &W,
        inputs: &[W::Input],
        job: &SlurmJob,
    ) -> Result<u64, ExecutorError> {
        let context = &self.context;

        for (index, input) in inputs.iter().enumerate() {
            let payload = serde_json::to_vec(&UnitCallRef { work, input })?;

            context.session.write_file(&job.user_input(index), &payload)?;
        }

        let script = job.script(&context.config.worker_command, W::NAME);

        fs::write(job.server_script(), &script)?;
        if !context.same_dirs() {
            context
                .session
                .write_file(&job.user_script(), script.as_bytes())?;
        }

        Ok(self.submit_script(job)?)
    }

    /// run sbatch and parse the job id it reports
    fn submit_script(&self, job: &SlurmJob) -> Result<u64, JobExecutionError> {
        let args = [
            "--parsable".to_string(),
            job.user_script().to_string_lossy().into_owned(),
        ];
        let output = self
            .context
            .session
            .run(&self.context.config.commands.submit, &args, None)?;

        if !output.status.success() {
            return Err(job.error(format!(
                "Submission of {} failed with {}\nSTDOUT:\n{}\nSTDERR:\n{}",
                job.script_name(),
                output.status,
                output.stdout_lossy(),
                output.stderr_lossy()
            )));
        }

        // `--parsable` prints `<id>` or `<id>;<cluster>`
        let stdout = output.stdout_lossy();
        let id = stdout.trim().split(';').next().unwrap_or_default();

        id.parse::<u64>().map_err(|_| {
            job.error(format!(
                "Submission of {} returned an invalid job id: '{}'",
                job.script_name(),
                stdout.trim()
            ))
        })
    }
}

impl Executor for SlurmExecutor {
    type Options = SlurmConfig;

    #[instrument(skip_all, fields(work = W::NAME))]
    fn submit<W: Work>(
        &self,
        work: W,
        input: W::Input,
        options: &SlurmConfig,
    ) -> Result<Handle<W::Output>, ExecutorError> {
        let mut handles = self.submit_units(&work, vec![input], options, true)?;

        handles
            .pop()
            .ok_or_else(|| JobExecutionError::new("Single task submission produced no handle").into())
    }

    #[instrument(skip_all, fields(work = W::NAME, units = inputs.len()))]
    fn map<W: Work>(
        &self,
        work: W,
        inputs: Vec<W::Input>,
        options: &SlurmConfig,
    ) -> Result<MapResults<W::Output>, ExecutorError> {
        Ok(MapResults::new(
            self.submit_units(&work, inputs, options, false)?,
        ))
    }

    /// stop the watcher, cancel every live job and fail its handles
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Shutting down slurm executor");

        {
            *self.context.stopped.lock() = true;
            self.context.wake.notify_all();
        }

        if let Some(watcher) = self.watcher.lock().take() {
            if watcher.join().is_err() {
                error!("Slurm watcher thread panicked");
            }
        }

        let jobs = std::mem::take(&mut *self.context.jobs.lock());

        for (job_id, live) in jobs {
            self.context.cancel_job(job_id);
            live.fail(live.job().error("Job was cancelled because the executor shut down"));

            for index in 0..live.job().num_units {
                self.context.remove_unit_files(live.job(), index);
            }
        }
    }
}

impl Drop for SlurmExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
