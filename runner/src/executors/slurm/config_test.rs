use super::config::{
    job_name, GpuOverrides, SlurmBackendConfig, SlurmConfig, SlurmConfigError, SHEBANG,
};
use crate::{
    testing::{backend_config, budget, workflow_task},
    workflow::{parse_mem_value, MemValue},
};
use std::path::Path;

fn slurm_config() -> SlurmConfig {
    SlurmConfig {
        partition: "main".to_string(),
        cpus_per_task: 2,
        mem_per_task_mb: 1000,
        job_name: Some("segment".to_string()),
        constraint: Some("skylake".to_string()),
        gres: Some("gpu:1".to_string()),
        time: Some("01:00:00".to_string()),
        account: Some("lab".to_string()),
        extra_lines: vec![
            "module load cuda".to_string(),
            "#SBATCH --exclusive".to_string(),
        ],
        units_per_job: None,
        parallel_units_per_job: None,
        budget: budget(),
    }
}

#[test]
pub fn preamble_has_fixed_directive_order() {
    let preamble = slurm_config().to_sbatch_preamble(
        3,
        Path::new("/work/job_slurm_%j.out"),
        Path::new("/work/job_slurm_%j.err"),
    );

    assert_eq!(
        preamble,
        vec![
            SHEBANG,
            "#SBATCH --partition=main",
            "#SBATCH --ntasks=3",
            "#SBATCH --cpus-per-task=2",
            "#SBATCH --mem=3000M",
            "#SBATCH --job-name=segment",
            "#SBATCH --constraint=skylake",
            "#SBATCH --gres=gpu:1",
            "#SBATCH --time=01:00:00",
            "#SBATCH --account=lab",
            "#SBATCH --err=/work/job_slurm_%j.err",
            "#SBATCH --out=/work/job_slurm_%j.out",
            "#SBATCH --exclusive",
            "module load cuda",
        ]
    );
}

#[test]
pub fn unset_options_are_omitted() {
    let mut config = slurm_config();
    config.job_name = None;
    config.constraint = None;
    config.gres = None;
    config.time = None;
    config.account = None;
    config.extra_lines.clear();

    let preamble = config.to_sbatch_preamble(1, Path::new("out"), Path::new("err"));

    assert_eq!(preamble.len(), 7);
    assert!(preamble.iter().all(|line| !line.contains("--gres")));
}

#[test]
pub fn extra_lines_keep_order_within_groups() {
    let mut config = slurm_config();
    config.extra_lines = vec![
        "export A=1".to_string(),
        "#SBATCH --exclusive".to_string(),
        "export B=2".to_string(),
        "#SBATCH --nice=10".to_string(),
    ];

    assert_eq!(
        config.sorted_extra_lines(),
        vec![
            "#SBATCH --exclusive",
            "#SBATCH --nice=10",
            "export A=1",
            "export B=2"
        ]
    );
}

#[test]
pub fn repeated_extra_lines_are_rejected() {
    let mut config = slurm_config();
    config.extra_lines = vec![
        "export A=1".to_string(),
        "export B=2".to_string(),
        "export A=1".to_string(),
    ];

    assert_eq!(
        config.validate(),
        Err(SlurmConfigError::DuplicateExtraLines(vec![
            "export A=1".to_string()
        ]))
    );
}

#[test]
pub fn memory_values_are_parsed() {
    assert_eq!(parse_mem_value("1000"), Ok(1000));
    assert_eq!(parse_mem_value("1000M"), Ok(1000));
    assert_eq!(parse_mem_value("4G"), Ok(4000));
    assert_eq!(parse_mem_value("1T"), Ok(1_000_000));
    assert_eq!(parse_mem_value("512000K"), Ok(512));
    assert!(parse_mem_value("12X").is_err());
    assert!(parse_mem_value("G").is_err());
}

#[test]
pub fn malformed_memory_values_are_errors() {
    assert!(parse_mem_value("4€").is_err());
    assert!(parse_mem_value("€").is_err());
    assert!(parse_mem_value("").is_err());
    assert!(parse_mem_value("18446744073709552T").is_err());
    assert!(parse_mem_value("18446744073709551615G").is_err());
    assert_eq!(
        MemValue::Text("9999999999999T".to_string()).to_mb(),
        Ok(9_999_999_999_999_000_000)
    );
}

#[test]
pub fn task_meta_overrides_defaults() {
    let mut config = backend_config();
    config.default_slurm_config.mem = MemValue::Text("4G".to_string());
    config.default_slurm_config.extra_lines = vec!["module load base".to_string()];

    let mut task = workflow_task(0, "create zarr", "true");
    task.task.meta.cpus_per_task = Some(4);
    task.meta.extra_lines = Some(vec!["module load extra".to_string()]);
    task.meta.time = Some("00:10:00".to_string());

    let slurm = config.slurm_config_for(&task).unwrap();

    assert_eq!(slurm.partition, "main");
    assert_eq!(slurm.cpus_per_task, 4);
    assert_eq!(slurm.mem_per_task_mb, 4000);
    assert_eq!(slurm.time.as_deref(), Some("00:10:00"));
    assert_eq!(slurm.job_name.as_deref(), Some("create_zarr"));
    assert_eq!(
        slurm.extra_lines,
        vec!["module load base".to_string(), "module load extra".to_string()]
    );
}

#[test]
pub fn gpu_tasks_use_gpu_overrides() {
    let mut config = backend_config();
    config.gpu_slurm_config = Some(GpuOverrides {
        partition: Some("gpu".to_string()),
        gres: Some("gpu:1".to_string()),
        mem: Some(MemValue::Megabytes(8000)),
        extra_lines: vec!["module load cuda".to_string()],
        ..Default::default()
    });

    let mut task = workflow_task(0, "segment", "true");
    task.meta.needs_gpu = Some(true);

    let slurm = config.slurm_config_for(&task).unwrap();

    assert_eq!(slurm.partition, "gpu");
    assert_eq!(slurm.gres.as_deref(), Some("gpu:1"));
    assert_eq!(slurm.mem_per_task_mb, 8000);
    assert_eq!(slurm.cpus_per_task, 1);
    assert_eq!(slurm.extra_lines, vec!["module load cuda".to_string()]);
}

#[test]
pub fn gpu_task_without_gpu_config_fails() {
    let mut task = workflow_task(0, "segment", "true");
    task.meta.needs_gpu = Some(true);

    assert_eq!(
        backend_config().slurm_config_for(&task),
        Err(SlurmConfigError::MissingGpuConfig)
    );
}

#[test]
pub fn invalid_task_memory_fails() {
    let mut task = workflow_task(0, "segment", "true");
    task.meta.mem = Some(MemValue::Text("lots".to_string()));

    assert!(matches!(
        backend_config().slurm_config_for(&task),
        Err(SlurmConfigError::InvalidMemory(_))
    ));
}

#[test]
pub fn job_names_are_sanitized() {
    assert_eq!(job_name("Apply Registration (v2)"), "Apply_Registration__v2_");
    assert_eq!(job_name("plain-name_1"), "plain-name_1");
}

#[test]
pub fn backend_config_is_read_from_yaml() {
    let config: SlurmBackendConfig = serde_yaml::from_str(
        r#"
default_slurm_config:
  partition: main
  mem: 4G
  extra_lines:
    - "#SBATCH --exclusive"
gpu_slurm_config:
  partition: gpu
batching_config:
  target_cpus_per_job: 8
  max_cpus_per_job: 16
  target_mem_per_job: 31000
  max_mem_per_job: 62000
  target_num_jobs: 100
  max_num_jobs: 200
worker_command: tessera-runner worker
"#,
    )
    .unwrap();

    assert_eq!(config.default_slurm_config.cpus_per_task, 1);
    assert_eq!(
        config.default_slurm_config.mem,
        MemValue::Text("4G".to_string())
    );
    assert_eq!(config.commands.submit, "sbatch");
    assert_eq!(config.commands.query, "squeue");
    assert_eq!(config.poll_interval_ms, 5000);
    assert_eq!(
        config.gpu_slurm_config.and_then(|gpu| gpu.partition),
        Some("gpu".to_string())
    );
}
