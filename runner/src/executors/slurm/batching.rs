use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// parallelism tried first when no sizing was requested
pub const DEFAULT_PARALLELISM: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingError {
    #[error("Either both or none of units_per_job and parallel_units_per_job must be set")]
    PartialSizing,
    #[error("Sizing values must be positive (units_per_job={units_per_job}, parallel_units_per_job={parallel_units_per_job})")]
    ZeroSizing {
        units_per_job: usize,
        parallel_units_per_job: usize,
    },
    #[error("There are no units to distribute over jobs")]
    NoUnits,
    #[error("Invalid batching budget: {0}")]
    InvalidBudget(String),
    #[error("{num_jobs} jobs would exceed the maximum of {max_num_jobs}")]
    TooManyJobs { num_jobs: usize, max_num_jobs: usize },
    #[error("{cpus_per_job} cpus per job would exceed the maximum of {max_cpus_per_job}")]
    TooManyCpus {
        cpus_per_job: u64,
        max_cpus_per_job: u64,
    },
    #[error("{mem_per_job}MB per job would exceed the maximum of {max_mem_per_job}MB")]
    TooMuchMemory {
        mem_per_job: u64,
        max_mem_per_job: u64,
    },
}

/// Soft (target) and hard (max) limits for a single cluster job
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchingBudget {
    pub target_cpus_per_job: u64,
    pub max_cpus_per_job: u64,
    // memory values are in MB
    pub target_mem_per_job: u64,
    pub max_mem_per_job: u64,
    pub target_num_jobs: usize,
    pub max_num_jobs: usize,
}

impl BatchingBudget {
    pub fn validate(&self) -> Result<(), SizingError> {
        let pairs = [
            ("cpus_per_job", self.target_cpus_per_job, self.max_cpus_per_job),
            ("mem_per_job", self.target_mem_per_job, self.max_mem_per_job),
            (
                "num_jobs",
                self.target_num_jobs as u64,
                self.max_num_jobs as u64,
            ),
        ];

        for (name, target, max) in pairs {
            if target == 0 || max == 0 {
                return Err(SizingError::InvalidBudget(format!(
                    "target_{name} and max_{name} must be positive"
                )));
            }
            if target > max {
                return Err(SizingError::InvalidBudget(format!(
                    "target_{name} ({target}) is larger than max_{name} ({max})"
                )));
            }
        }

        Ok(())
    }
}

/// Decide how many units go into one job and how many of them run at once
///
/// Returns `(units_per_job, parallel_units_per_job)` with `1 <= parallel <= units`.
/// Caller supplied values are only checked against the budget: exceeding a max is fatal,
/// exceeding a target is logged. Without caller values a small default parallelism is tried
/// before deriving the sizing from the target budget.
pub fn heuristics(
    n_units_total: usize,
    units_per_job: Option<usize>,
    parallel_units_per_job: Option<usize>,
    cpus_per_unit: u64,
    mem_per_unit: u64,
    budget: &BatchingBudget,
) -> Result<(usize, usize), SizingError> {
    if n_units_total == 0 {
        return Err(SizingError::NoUnits);
    }
    if cpus_per_unit == 0 || mem_per_unit == 0 {
        return Err(SizingError::InvalidBudget(
            "cpus and memory per unit must be positive".to_string(),
        ));
    }
    budget.validate()?;

    match (units_per_job, parallel_units_per_job) {
        (Some(units), Some(parallel)) => check_requested(
            n_units_total,
            units,
            parallel,
            cpus_per_unit,
            mem_per_unit,
            budget,
        ),
        (None, None) => derive(n_units_total, cpus_per_unit, mem_per_unit, budget),
        _ => Err(SizingError::PartialSizing),
    }
}

fn check_requested(
    n_units_total: usize,
    units: usize,
    parallel: usize,
    cpus_per_unit: u64,
    mem_per_unit: u64,
    budget: &BatchingBudget,
) -> Result<(usize, usize), SizingError> {
    if units == 0 || parallel == 0 {
        return Err(SizingError::ZeroSizing {
            units_per_job: units,
            parallel_units_per_job: parallel,
        });
    }

    let parallel = if parallel > units {
        info!(
            "parallel_units_per_job ({parallel}) is larger than units_per_job ({units}), using {units}"
        );
        units
    } else {
        parallel
    };

    let num_jobs = n_units_total.div_ceil(units);
    if num_jobs > budget.max_num_jobs {
        return Err(SizingError::TooManyJobs {
            num_jobs,
            max_num_jobs: budget.max_num_jobs,
        });
    } else if num_jobs > budget.target_num_jobs {
        warn!(
            "{num_jobs} jobs exceed the target of {} jobs",
            budget.target_num_jobs
        );
    }

    check_footprint(parallel, cpus_per_unit, mem_per_unit, budget)?;

    Ok((units, parallel))
}

fn derive(
    n_units_total: usize,
    cpus_per_unit: u64,
    mem_per_unit: u64,
    budget: &BatchingBudget,
) -> Result<(usize, usize), SizingError> {
    if n_units_total < DEFAULT_PARALLELISM {
        warn!(
            "Only {n_units_total} units available, fewer than the default parallelism of {DEFAULT_PARALLELISM}"
        );
    }

    let default_fits_max = DEFAULT_PARALLELISM as u64 * cpus_per_unit <= budget.max_cpus_per_job
        && DEFAULT_PARALLELISM as u64 * mem_per_unit <= budget.max_mem_per_job;

    if default_fits_max && n_units_total.div_ceil(DEFAULT_PARALLELISM) <= budget.target_num_jobs {
        debug!("Using default parallelism of {DEFAULT_PARALLELISM}");

        return Ok((DEFAULT_PARALLELISM, DEFAULT_PARALLELISM));
    }

    let units = n_units_total.div_ceil(budget.target_num_jobs);
    let by_cpus = (budget.target_cpus_per_job / cpus_per_unit) as usize;
    let by_mem = (budget.target_mem_per_job / mem_per_unit) as usize;
    // a single unit always has to run, even if it alone is above the target
    let parallel = by_cpus.min(by_mem).min(units).max(1);

    check_footprint(parallel, cpus_per_unit, mem_per_unit, budget)?;

    debug!("Derived {units} units per job with {parallel} in parallel");

    Ok((units, parallel))
}

fn check_footprint(
    parallel: usize,
    cpus_per_unit: u64,
    mem_per_unit: u64,
    budget: &BatchingBudget,
) -> Result<(), SizingError> {
    let cpus_per_job = parallel as u64 * cpus_per_unit;
    let mem_per_job = parallel as u64 * mem_per_unit;

    if cpus_per_job > budget.max_cpus_per_job {
        return Err(SizingError::TooManyCpus {
            cpus_per_job,
            max_cpus_per_job: budget.max_cpus_per_job,
        });
    } else if cpus_per_job > budget.target_cpus_per_job {
        warn!(
            "{cpus_per_job} cpus per job exceed the target of {}",
            budget.target_cpus_per_job
        );
    }

    if mem_per_job > budget.max_mem_per_job {
        return Err(SizingError::TooMuchMemory {
            mem_per_job,
            max_mem_per_job: budget.max_mem_per_job,
        });
    } else if mem_per_job > budget.target_mem_per_job {
        warn!(
            "{mem_per_job}MB per job exceed the target of {}MB",
            budget.target_mem_per_job
        );
    }

    Ok(())
}
