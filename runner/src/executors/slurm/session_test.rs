use super::session::{Impersonation, SshTarget, UserSession};
use crate::testing::write_script;
use nix::unistd::{getuid, User};
use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
    sync::Once,
    time::Duration,
};

static FAKE_WRAPPERS: Once = Once::new();

/// put `sudo` and `ssh` stand-ins that run the wrapped command locally in front of PATH
fn install_fake_wrappers() {
    FAKE_WRAPPERS.call_once(|| {
        let bin = env::temp_dir().join(format!("tessera-wrappers-{}", std::process::id()));
        fs::create_dir_all(&bin).unwrap();

        // drops `--set-home --non-interactive -u <user>`
        write_script(&bin, "sudo", r#"shift 4; exec "$@""#);
        // the remote command line is the single word after `--`
        write_script(
            &bin,
            "ssh",
            r#"while [ "$1" != "--" ]; do shift; done; shift; exec sh -c "$1""#,
        );

        let path = env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![bin];
        paths.extend(env::split_paths(&path));
        env::set_var("PATH", env::join_paths(paths).unwrap());
    });
}

fn session(impersonation: Impersonation) -> UserSession {
    UserSession::new(impersonation, Duration::from_secs(10))
}

fn sudo() -> Impersonation {
    Impersonation::Sudo {
        user: "slurm".to_string(),
    }
}

fn ssh(port: Option<u16>, identity_file: Option<PathBuf>) -> Impersonation {
    Impersonation::Ssh(SshTarget {
        host: "login.cluster".to_string(),
        user: "alice".to_string(),
        port,
        identity_file,
    })
}

fn words(command: &Command) -> Vec<String> {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|word| word.to_string_lossy().into_owned())
        .collect()
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
pub fn direct_command_is_not_wrapped() {
    let command = session(Impersonation::Direct).command("sbatch", &args(&["--parsable", "a b"]));

    assert_eq!(words(&command), vec!["sbatch", "--parsable", "a b"]);
}

#[test]
pub fn sudo_command_switches_user() {
    let command = session(sudo()).command("sbatch", &args(&["--parsable", "/work/a b.sbatch"]));

    assert_eq!(
        words(&command),
        vec![
            "sudo",
            "--set-home",
            "--non-interactive",
            "-u",
            "slurm",
            "sbatch",
            "--parsable",
            "/work/a b.sbatch"
        ]
    );
}

#[test]
pub fn ssh_command_quotes_remote_words() {
    let command = session(ssh(Some(2222), Some(PathBuf::from("/keys/id_ed25519"))))
        .command("cat", &args(&["/work/it's here.json", "plain"]));

    assert_eq!(
        words(&command),
        vec![
            "ssh",
            "-o",
            "BatchMode=yes",
            "-p",
            "2222",
            "-i",
            "/keys/id_ed25519",
            "alice@login.cluster",
            "--",
            r#"cat '/work/it'\''s here.json' plain"#
        ]
    );
}

#[test]
pub fn ssh_command_without_port_or_identity() {
    let command = session(ssh(None, None)).command("squeue", &args(&["--noheader"]));

    assert_eq!(
        words(&command),
        vec!["ssh", "-o", "BatchMode=yes", "alice@login.cluster", "--", "squeue --noheader"]
    );
}

#[test]
pub fn impersonating_oneself_is_direct() {
    let current = User::from_uid(getuid()).unwrap().unwrap().name;

    assert_eq!(Impersonation::sudo(None), Impersonation::Direct);
    assert_eq!(Impersonation::sudo(Some(current)), Impersonation::Direct);
    assert_eq!(
        Impersonation::sudo(Some("slurm-someone-else".to_string())),
        Impersonation::Sudo {
            user: "slurm-someone-else".to_string()
        }
    );
}

fn exercise_primitives(session: &UserSession, dir: &Path) {
    let nested = dir.join("with space").join("jobs");
    let file = nested.join("job_000000_in_0.json");

    session.mkdir(&nested).unwrap();
    assert!(!session.path_exists(&file).unwrap());

    session.write_file(&file, b"{\"input\": 1}").unwrap();
    session.write_file(&nested.join("other's.txt"), b"x").unwrap();

    assert!(session.path_exists(&file).unwrap());
    assert_eq!(session.read_file(&file).unwrap(), b"{\"input\": 1}");

    let mut names = session.list_files(&nested).unwrap();
    names.sort();
    assert_eq!(names, vec!["job_000000_in_0.json", "other's.txt"]);

    session
        .remove_files(&[file.clone(), nested.join("missing.json")])
        .unwrap();
    assert!(!session.path_exists(&file).unwrap());
    assert!(session.read_file(&file).is_err());
}

#[test]
pub fn primitives_work_directly() {
    let dir = tempfile::tempdir().unwrap();

    exercise_primitives(&session(Impersonation::Direct), dir.path());
}

#[test]
pub fn primitives_work_through_sudo_and_ssh() {
    install_fake_wrappers();

    let sudo_dir = tempfile::tempdir().unwrap();
    exercise_primitives(&session(sudo()), sudo_dir.path());

    let ssh_dir = tempfile::tempdir().unwrap();
    exercise_primitives(&session(ssh(Some(22), None)), ssh_dir.path());
}

#[test]
pub fn failing_command_reports_output() {
    let error = session(Impersonation::Direct)
        .run_checked("sh", &args(&["-c", "echo broken >&2; exit 3"]), None)
        .unwrap_err();

    assert!(error.to_string().contains("broken"));
}

#[test]
pub fn slow_command_times_out() {
    let session = UserSession::new(Impersonation::Direct, Duration::from_millis(100));

    let error = session.run("sleep", &args(&["5"]), None).unwrap_err();

    assert!(error.to_string().contains("timed out"));
}
