use super::{
    slurm::{
        batching::SizingError,
        config::{SlurmBackendConfig, SlurmConfig},
        session::Impersonation,
        SlurmExecutor,
    },
    Executor,
};
use crate::{
    errors::ExecutorError,
    testing::{backend_config, workflow_task, write_script, Square},
    worker::run_unit,
};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tempfile::TempDir;

const RUNNING_UNTIL_CANCELLED: &str = r#"if [ -f "$(dirname "$0")/cancelled" ]; then exit 0; fi
echo "101 RUNNING"
echo "102 PENDING"
echo "103 RUNNING""#;

// the executor goes first on drop, its shutdown still needs the fake commands
struct FakeCluster {
    executor: SlurmExecutor,
    dir: TempDir,
}

impl FakeCluster {
    fn new(sbatch: &str, squeue: &str) -> Self {
        Self::with_config(sbatch, squeue, |_| {})
    }

    fn with_config(
        sbatch: &str,
        squeue: &str,
        adjust: impl FnOnce(&mut SlurmBackendConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();

        let mut config: SlurmBackendConfig = backend_config();
        config.commands.submit = write_script(&bin, "sbatch", sbatch)
            .to_string_lossy()
            .into_owned();
        config.commands.query = write_script(&bin, "squeue", squeue)
            .to_string_lossy()
            .into_owned();
        config.commands.cancel = write_script(
            &bin,
            "scancel",
            r#"echo "$@" >> "$(dirname "$0")/cancelled""#,
        )
        .to_string_lossy()
        .into_owned();
        adjust(&mut config);

        let executor = SlurmExecutor::load(
            config,
            Impersonation::Direct,
            &dir.path().join("server"),
            &dir.path().join("user"),
        )
        .unwrap();

        Self { executor, dir }
    }

    /// sbatch handing out increasing ids starting at 101
    fn counting() -> &'static str {
        r#"counter="$(dirname "$0")/counter"
n=$(cat "$counter" 2>/dev/null || echo 100)
n=$((n + 1))
echo "$n" > "$counter"
echo "$n;cluster""#
    }

    fn server(&self) -> PathBuf {
        self.dir.path().join("server")
    }

    fn user(&self) -> PathBuf {
        self.dir.path().join("user")
    }

    fn slurm_config(&self) -> SlurmConfig {
        self.executor
            .slurm_config_for(&workflow_task(0, "square", "true"))
            .unwrap()
    }

    /// play the compute nodes, run every staged unit through the worker
    fn run_staged_units(&self) {
        for entry in fs::read_dir(self.user()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();

            if name.contains("_in_") {
                let output = name.replace("_in_", "_out_");

                run_unit::<Square>(&self.user().join(&name), &self.user().join(output)).unwrap();
            }
        }
    }

    fn cancelled(&self) -> String {
        fs::read_to_string(self.dir.path().join("bin").join("cancelled")).unwrap_or_default()
    }
}

fn files_matching(dir: &Path, pattern: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(pattern)
        })
        .count()
}

#[test]
pub fn submitted_unit_is_collected() {
    let cluster = FakeCluster::new(FakeCluster::counting(), RUNNING_UNTIL_CANCELLED);
    let handle = cluster
        .executor
        .submit(Square, 7, &cluster.slurm_config())
        .unwrap();

    assert!(handle.is_running());

    let script = fs::read_to_string(cluster.server().join("job_000000_slurm_submit.sbatch")).unwrap();
    assert!(script.contains("--kind square"));
    assert!(script.contains("#SBATCH --ntasks=1"));
    assert!(cluster.user().join("job_000000_slurm_submit.sbatch").exists());

    cluster.run_staged_units();

    assert_eq!(handle.wait().unwrap(), 49);
    assert_eq!(cluster.executor.live_jobs(), 0);
    assert_eq!(files_matching(&cluster.user(), "_in_"), 0);
    assert_eq!(files_matching(&cluster.server(), "_out_"), 0);
}

#[test]
pub fn map_batches_units_into_jobs() {
    let cluster = FakeCluster::new(FakeCluster::counting(), RUNNING_UNTIL_CANCELLED);
    let mut config = cluster.slurm_config();
    config.units_per_job = Some(2);
    config.parallel_units_per_job = Some(2);

    let results = cluster
        .executor
        .map(Square, vec![1, 2, 3, 4, 5], &config)
        .unwrap();

    assert_eq!(files_matching(&cluster.server(), "_slurm_submit.sbatch"), 3);

    cluster.run_staged_units();

    assert_eq!(results.wait_all().unwrap(), vec![1, 4, 9, 16, 25]);
}

#[test]
pub fn task_failure_crosses_the_job_boundary() {
    let cluster = FakeCluster::new(FakeCluster::counting(), RUNNING_UNTIL_CANCELLED);
    let handle = cluster
        .executor
        .submit(Square, 13, &cluster.slurm_config())
        .unwrap();

    cluster.run_staged_units();

    match handle.wait().unwrap_err() {
        ExecutorError::Task(error) => {
            assert_eq!(error.traceback, "13 is unlucky");
            assert_eq!(error.workflow_task_id, Some(7));
            assert_eq!(error.workflow_task_order, Some(2));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
pub fn finished_job_without_output_is_job_error() {
    // nothing is reported, so the job counts as finished right away
    let cluster = FakeCluster::new(FakeCluster::counting(), "exit 0");
    let handle = cluster
        .executor
        .submit(Square, 3, &cluster.slurm_config())
        .unwrap();

    let error = handle.wait().unwrap_err();

    assert!(error.is_job_error());
    assert!(error.to_string().contains("missing"));
}

#[test]
pub fn terminal_state_counts_as_finished() {
    let cluster = FakeCluster::new(FakeCluster::counting(), r#"echo "101 FAILED""#);
    let handle = cluster
        .executor
        .submit(Square, 3, &cluster.slurm_config())
        .unwrap();

    assert!(handle.wait().unwrap_err().is_job_error());
}

#[test]
pub fn rejected_submission_is_job_error() {
    let cluster = FakeCluster::new(
        r#"echo "sbatch: error: invalid partition specified" >&2
exit 1"#,
        "exit 0",
    );

    let error = cluster
        .executor
        .submit(Square, 3, &cluster.slurm_config())
        .unwrap_err();

    assert!(error.is_job_error());
    assert!(error.to_string().contains("invalid partition"));
    assert_eq!(cluster.executor.live_jobs(), 0);
    assert_eq!(files_matching(&cluster.user(), "job_"), 0);
    assert_eq!(files_matching(&cluster.server(), "job_"), 0);
}

#[test]
pub fn unparsable_job_id_is_job_error() {
    let cluster = FakeCluster::new(r#"echo "Submitted batch job""#, "exit 0");

    assert!(cluster
        .executor
        .submit(Square, 3, &cluster.slurm_config())
        .unwrap_err()
        .is_job_error());
    assert_eq!(files_matching(&cluster.user(), "_in_"), 0);
}

#[test]
pub fn failed_batch_in_map_removes_its_files() {
    // the second submission is refused
    let cluster = FakeCluster::new(
        r#"counter="$(dirname "$0")/counter"
if [ -f "$counter" ]; then echo "sbatch: error: QOSMaxSubmitJobPerUserLimit" >&2; exit 1; fi
echo 101 > "$counter"
echo 101"#,
        RUNNING_UNTIL_CANCELLED,
    );
    let mut config = cluster.slurm_config();
    config.units_per_job = Some(1);
    config.parallel_units_per_job = Some(1);

    let error = cluster
        .executor
        .map(Square, vec![1, 2], &config)
        .unwrap_err();

    assert!(error.to_string().contains("QOSMaxSubmitJobPerUserLimit"));
    assert!(cluster.cancelled().contains("101"));
    assert_eq!(files_matching(&cluster.user(), "job_000001"), 0);
    assert_eq!(files_matching(&cluster.server(), "job_000001"), 0);
}

#[test]
pub fn rejected_status_query_is_retried_per_job() {
    // a batched query fails as soon as one id is unknown, 101 is unknown
    let cluster = FakeCluster::new(
        FakeCluster::counting(),
        r#"case "$3" in
*,*) echo "slurm_load_jobs error: Invalid job id specified" >&2; exit 1 ;;
--jobs=102) echo "102 RUNNING" ;;
*) exit 1 ;;
esac"#,
    );
    let mut config = cluster.slurm_config();
    config.units_per_job = Some(1);
    config.parallel_units_per_job = Some(1);

    let mut results = cluster.executor.map(Square, vec![1, 2], &config).unwrap();

    assert!(results.next().unwrap().unwrap_err().is_job_error());
    assert_eq!(cluster.executor.live_jobs(), 1);
}

#[test]
pub fn grace_period_is_waited_once_per_job() {
    let cluster = FakeCluster::with_config(FakeCluster::counting(), "exit 0", |config| {
        config.output_grace_ms = 400;
    });
    let mut config = cluster.slurm_config();
    config.units_per_job = Some(4);
    config.parallel_units_per_job = Some(4);

    let started = Instant::now();
    let error = cluster
        .executor
        .map(Square, vec![1, 2, 3, 4], &config)
        .unwrap()
        .wait_all()
        .unwrap_err();

    assert!(error.is_job_error());
    assert!(started.elapsed() < Duration::from_millis(1200));
}

#[test]
pub fn partial_worker_output_is_removed() {
    let cluster = FakeCluster::new(FakeCluster::counting(), RUNNING_UNTIL_CANCELLED);
    let handle = cluster
        .executor
        .submit(Square, 5, &cluster.slurm_config())
        .unwrap();

    // the worker died while writing, then the job left the queue
    fs::write(cluster.user().join("job_000000_out_0.json.tmp"), b"{\"sta").unwrap();
    fs::write(cluster.dir.path().join("bin").join("cancelled"), b"").unwrap();

    assert!(handle.wait().unwrap_err().is_job_error());
    assert_eq!(files_matching(&cluster.user(), ".tmp"), 0);
    assert_eq!(files_matching(&cluster.server(), ".tmp"), 0);
}

#[test]
pub fn partial_sizing_fails_at_map() {
    let cluster = FakeCluster::new(FakeCluster::counting(), "exit 0");
    let mut config = cluster.slurm_config();
    config.units_per_job = Some(2);

    assert!(matches!(
        cluster.executor.map(Square, vec![1, 2, 3], &config),
        Err(ExecutorError::Sizing(SizingError::PartialSizing))
    ));
    assert_eq!(files_matching(&cluster.server(), "_slurm_submit.sbatch"), 0);
}

#[test]
pub fn cancelling_a_running_unit_cancels_its_job() {
    let cluster = FakeCluster::new(FakeCluster::counting(), RUNNING_UNTIL_CANCELLED);
    let handle = cluster
        .executor
        .submit(Square, 3, &cluster.slurm_config())
        .unwrap();

    assert!(!handle.cancel());
    assert_eq!(cluster.cancelled().trim(), "101");

    // once the cluster forgets the job it is collected without output
    assert!(handle.wait().unwrap_err().is_job_error());
}

#[test]
pub fn shutdown_fails_live_jobs() {
    let cluster = FakeCluster::new(FakeCluster::counting(), RUNNING_UNTIL_CANCELLED);
    let handle = cluster
        .executor
        .submit(Square, 3, &cluster.slurm_config())
        .unwrap();

    cluster.executor.shutdown();

    let error = handle.wait().unwrap_err();

    assert!(error.is_job_error());
    assert!(error.to_string().contains("shut down"));
    assert!(cluster.cancelled().contains("101"));
    assert!(matches!(
        cluster
            .executor
            .submit(Square, 3, &cluster.slurm_config()),
        Err(ExecutorError::Shutdown)
    ));
}
