use super::{Context, LiveJob};
use itertools::Itertools;
use std::{collections::HashSet, io, sync::Arc, thread};
use tracing::{debug, trace, warn};

/// job states after which a job will never write anything again
const TERMINAL_STATES: [&str; 9] = [
    "BOOT_FAIL",
    "CANCELLED",
    "COMPLETED",
    "DEADLINE",
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "TIMEOUT",
];

enum QueryOutcome {
    /// ids the cluster still reports as active
    Active(HashSet<u64>),
    /// the query ran but was refused, e.g., because an id is unknown
    Rejected,
    /// the query could not be run at all
    Unavailable,
}

pub(crate) fn spawn(context: Arc<Context>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("slurm-watcher".to_string())
        .spawn(move || watch(&context))
}

fn watch(context: &Context) {
    let interval = context.poll_interval();

    loop {
        {
            let mut stopped = context.stopped.lock();

            if !*stopped {
                context.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }

        poll(context);
    }

    debug!("Slurm watcher stopped");
}

/// collect every job that either wrote all outputs or is no longer known to the cluster
fn poll(context: &Context) {
    let snapshot = context
        .jobs
        .lock()
        .iter()
        .map(|(job_id, live)| (*job_id, Arc::clone(live)))
        .collect_vec();

    if snapshot.is_empty() {
        return;
    }

    let existing: HashSet<String> = match context.session.list_files(&context.user_dir) {
        Ok(names) => names.into_iter().collect(),
        Err(error) => {
            warn!(error = %error, "Failed to list {}", context.user_dir.display());
            HashSet::new()
        }
    };
    let job_ids = snapshot.iter().map(|(job_id, _)| *job_id).collect_vec();
    let finished = terminal_jobs(context, &job_ids);

    for (job_id, live) in snapshot {
        let outputs_written = live
            .job()
            .output_names()
            .all(|name| existing.contains(&name));

        if !outputs_written && !finished.contains(&job_id) {
            trace!(job_id, "Job still running");
            continue;
        }

        // removing the job under the lock ensures it is collected exactly once
        let claimed: Option<Arc<dyn LiveJob>> = context.jobs.lock().remove(&job_id);

        if let Some(live) = claimed {
            debug!(job_id, outputs_written, "Collecting job");
            live.collect(context);
        }
    }
}

fn terminal_jobs(context: &Context, job_ids: &[u64]) -> HashSet<u64> {
    match query(context, job_ids) {
        QueryOutcome::Active(active) => job_ids
            .iter()
            .filter(|job_id| !active.contains(*job_id))
            .copied()
            .collect(),
        // a single purged id makes the whole query fail, so ask for every job on its own
        QueryOutcome::Rejected => job_ids
            .iter()
            .filter(|job_id| match query(context, &[**job_id]) {
                QueryOutcome::Active(active) => !active.contains(*job_id),
                QueryOutcome::Rejected => true,
                QueryOutcome::Unavailable => false,
            })
            .copied()
            .collect(),
        QueryOutcome::Unavailable => HashSet::new(),
    }
}

fn query(context: &Context, job_ids: &[u64]) -> QueryOutcome {
    let args = [
        "--noheader".to_string(),
        "--format=%i %T".to_string(),
        format!("--jobs={}", job_ids.iter().join(",")),
    ];

    match context
        .session
        .run(&context.config.commands.query, &args, None)
    {
        Ok(output) if output.status.success() => QueryOutcome::Active(
            output
                .stdout_lossy()
                .lines()
                .filter_map(|line| {
                    let (job_id, state) = line.split_whitespace().collect_tuple()?;
                    let job_id = job_id.parse::<u64>().ok()?;

                    (!TERMINAL_STATES.contains(&state)).then_some(job_id)
                })
                .collect(),
        ),
        Ok(output) => {
            debug!(
                "Job query failed with {}: {}",
                output.status,
                output.stderr_lossy().trim()
            );
            QueryOutcome::Rejected
        }
        Err(error) => {
            warn!(error = %error, "Failed to query job states");
            QueryOutcome::Unavailable
        }
    }
}
