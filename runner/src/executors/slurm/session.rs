use crate::{errors::JobExecutionError, util::shell_quote};
use ignore::WalkBuilder;
use itertools::Itertools;
use nix::unistd::{getuid, User};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{ErrorKind, Read, Write},
    iter,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// name of the user running this process, if it can be resolved
static CURRENT_USER: Lazy<Option<String>> = Lazy::new(|| match User::from_uid(getuid()) {
    Ok(Some(user)) => Some(user.name),
    Ok(None) => None,
    Err(error) => {
        warn!(error = ?error, "Failed to resolve the current user");
        None
    }
});

/// Remote host reached over ssh
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

/// How operations on the user side are carried out
#[derive(Clone, Debug, PartialEq)]
pub enum Impersonation {
    /// run everything as the current user
    Direct,
    /// wrap every command with `sudo -u <user>`
    Sudo { user: String },
    /// run every command on a remote host
    Ssh(SshTarget),
}

impl Impersonation {
    /// sudo impersonation, switching to oneself is skipped
    pub fn sudo(user: Option<String>) -> Self {
        match user {
            Some(user) if CURRENT_USER.as_deref() != Some(user.as_str()) => Self::Sudo { user },
            _ => Self::Direct,
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Filesystem and process primitives executed on behalf of the cluster user
#[derive(Clone, Debug)]
pub struct UserSession {
    impersonation: Impersonation,
    timeout: Duration,
}

impl UserSession {
    pub fn new(impersonation: Impersonation, timeout: Duration) -> Self {
        Self {
            impersonation,
            timeout,
        }
    }

    pub fn impersonation(&self) -> &Impersonation {
        &self.impersonation
    }

    pub(crate) fn command(&self, program: &str, args: &[String]) -> Command {
        match &self.impersonation {
            Impersonation::Direct => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            Impersonation::Sudo { user } => {
                let mut command = Command::new("sudo");
                command
                    .args(["--set-home", "--non-interactive", "-u", user.as_str(), program])
                    .args(args);
                command
            }
            Impersonation::Ssh(target) => {
                let mut command = Command::new("ssh");
                command.args(["-o", "BatchMode=yes"]);

                if let Some(port) = target.port {
                    command.arg("-p").arg(port.to_string());
                }
                if let Some(identity_file) = &target.identity_file {
                    command.arg("-i").arg(identity_file);
                }

                // the remote side always goes through a shell, so every word is quoted
                let remote = iter::once(program)
                    .chain(args.iter().map(String::as_str))
                    .map(shell_quote)
                    .join(" ");

                command
                    .arg(format!("{}@{}", target.user, target.host))
                    .arg("--")
                    .arg(remote);
                command
            }
        }
    }

    /// run a command as the user, the exit status is not checked
    pub fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, JobExecutionError> {
        let description = iter::once(program)
            .chain(args.iter().map(String::as_str))
            .join(" ");
        let mut command = self.command(program, args);

        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        trace!(command = ?command, "Spawning command");

        let mut child = command.spawn().map_err(|error| {
            JobExecutionError::new(format!("Failed to spawn `{description}`: {error}"))
        })?;

        // both pipes are drained on their own threads so large outputs can't block the child
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = pipe.read_to_end(&mut buffer);
                buffer
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = pipe.read_to_end(&mut buffer);
                buffer
            })
        });

        if let (Some(content), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(error) = pipe.write_all(content) {
                warn!(error = ?error, "Failed to write stdin of `{description}`");
            }
            // closing stdin signals the end of input
            drop(pipe);
        }

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();

                return Err(JobExecutionError::new(format!(
                    "`{description}` timed out after {}s",
                    self.timeout.as_secs_f64()
                )));
            }
            Err(error) => {
                return Err(JobExecutionError::new(format!(
                    "Failed to wait for `{description}`: {error}"
                )))
            }
        };

        let output = CommandOutput {
            status,
            stdout: stdout_reader
                .map(|reader| reader.join().unwrap_or_default())
                .unwrap_or_default(),
            stderr: stderr_reader
                .map(|reader| reader.join().unwrap_or_default())
                .unwrap_or_default(),
        };

        debug!("`{description}` finished with {status}");

        Ok(output)
    }

    /// run a command as the user and fail on a non-zero exit status
    pub fn run_checked(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, JobExecutionError> {
        let output = self.run(program, args, stdin)?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(JobExecutionError::new(format!(
                "`{program} {}` failed with {}\nSTDOUT:\n{}\nSTDERR:\n{}",
                args.join(" "),
                output.status,
                output.stdout_lossy(),
                output.stderr_lossy()
            )))
        }
    }

    pub fn path_exists(&self, path: &Path) -> Result<bool, JobExecutionError> {
        match self.impersonation {
            Impersonation::Direct => Ok(path.exists()),
            _ => Ok(self
                .run("test", &["-e".to_string(), path_arg(path)], None)?
                .status
                .success()),
        }
    }

    /// names of all regular files directly inside `dir`
    pub fn list_files(&self, dir: &Path) -> Result<Vec<String>, JobExecutionError> {
        match self.impersonation {
            Impersonation::Direct => Ok(WalkBuilder::new(dir)
                .max_depth(Some(1))
                .standard_filters(false)
                .build()
                .filter_map(Result::ok)
                .filter(|entry| {
                    entry.depth() == 1
                        && entry
                            .file_type()
                            .map(|file_type| file_type.is_file())
                            .unwrap_or(false)
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()),
            _ => Ok(self
                .run_checked("ls", &["-1".to_string(), "-A".to_string(), path_arg(dir)], None)?
                .stdout_lossy()
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
        }
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>, JobExecutionError> {
        match self.impersonation {
            Impersonation::Direct => fs::read(path).map_err(|error| {
                JobExecutionError::new(format!("Failed to read {}: {error}", path.display()))
            }),
            _ => Ok(self.run_checked("cat", &[path_arg(path)], None)?.stdout),
        }
    }

    pub fn write_file(&self, path: &Path, content: &[u8]) -> Result<(), JobExecutionError> {
        match self.impersonation {
            Impersonation::Direct => fs::write(path, content).map_err(|error| {
                JobExecutionError::new(format!("Failed to write {}: {error}", path.display()))
            }),
            _ => self
                .run_checked("tee", &[path_arg(path)], Some(content))
                .map(|_| ()),
        }
    }

    pub fn mkdir(&self, path: &Path) -> Result<(), JobExecutionError> {
        match self.impersonation {
            Impersonation::Direct => fs::create_dir_all(path).map_err(|error| {
                JobExecutionError::new(format!("Failed to create {}: {error}", path.display()))
            }),
            _ => self
                .run_checked("mkdir", &["-p".to_string(), path_arg(path)], None)
                .map(|_| ()),
        }
    }

    /// remove files, already missing ones are ignored
    pub fn remove_files(&self, paths: &[PathBuf]) -> Result<(), JobExecutionError> {
        if paths.is_empty() {
            return Ok(());
        }

        match self.impersonation {
            Impersonation::Direct => {
                for path in paths {
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(error) if error.kind() == ErrorKind::NotFound => {}
                        Err(error) => {
                            return Err(JobExecutionError::new(format!(
                                "Failed to remove {}: {error}",
                                path.display()
                            )))
                        }
                    }
                }

                Ok(())
            }
            _ => {
                let args = iter::once("-f".to_string())
                    .chain(paths.iter().map(|path| path_arg(path)))
                    .collect_vec();

                self.run_checked("rm", &args, None).map(|_| ())
            }
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
