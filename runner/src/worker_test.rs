use crate::{
    envelope::ResultEnvelope,
    testing::Square,
    worker::{dispatch, run_unit, UnitCallRef, WorkerError},
};
use std::fs;

fn read_envelope(path: &std::path::Path) -> ResultEnvelope<u64> {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

#[test]
pub fn unit_result_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.json");
    let output = dir.path().join("out.json");

    fs::write(
        &input,
        serde_json::to_vec(&UnitCallRef {
            work: &Square,
            input: &6,
        })
        .unwrap(),
    )
    .unwrap();

    run_unit::<Square>(&input, &output).unwrap();

    assert_eq!(read_envelope(&output).into_result().unwrap(), 36);
    assert!(!dir.path().join("out.json.tmp").exists());
}

#[test]
pub fn task_failure_is_written_as_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.json");
    let output = dir.path().join("out.json");

    fs::write(
        &input,
        serde_json::to_vec(&UnitCallRef {
            work: &Square,
            input: &13,
        })
        .unwrap(),
    )
    .unwrap();

    run_unit::<Square>(&input, &output).unwrap();

    assert!(read_envelope(&output)
        .into_result()
        .unwrap_err()
        .is_task_error());
}

#[test]
pub fn unreadable_unit_is_job_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.json");
    let output = dir.path().join("out.json");

    fs::write(&input, "{not json").unwrap();

    run_unit::<Square>(&input, &output).unwrap();

    assert!(read_envelope(&output)
        .into_result()
        .unwrap_err()
        .is_job_error());
}

#[test]
pub fn unknown_kind_is_rejected() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        dispatch(
            "does_not_exist",
            &dir.path().join("in.json"),
            &dir.path().join("out.json")
        ),
        Err(WorkerError::UnknownKind(_))
    ));
}
