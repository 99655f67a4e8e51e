// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest creation through the external provisioning script.
//!
//! Creating a guest can take a long time (image download, OS install), so the
//! script is launched and then watched from a background task. Only a failure
//! to start the script, or an exit within the configured grace period, is
//! reported back to the HTTP caller.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use slog::{error, info, Logger};
use thiserror::Error;
use uuid::Uuid;
use virt_agent_api_types::GuestCreateRequest;

/// Number of trailing stdout lines logged once provisioning succeeds; the
/// script prints its summary there.
const SUMMARY_LINES: usize = 6;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("provisioning {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("lost track of provisioning process: {0}")]
    Io(#[from] std::io::Error),
}

/// What a successful provisioning run printed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionOutput {
    pub stdout: String,
}

impl ProvisionOutput {
    /// The last few lines of output, where the script reports the new
    /// guest's details.
    pub fn summary(&self) -> String {
        let lines: Vec<&str> = self.stdout.lines().collect();
        let start = lines.len().saturating_sub(SUMMARY_LINES);
        lines[start..].join("\n")
    }
}

/// A fully-formed invocation of the provisioning script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProvisionCommand {
    /// Builds the script's argument list. Each flag and its value are
    /// separate arguments; no shell is involved.
    pub fn new(
        program: &Path,
        connection_uri: &str,
        req: &GuestCreateRequest,
    ) -> Self {
        let flags: [(&str, String); 12] = [
            ("--connection", connection_uri.to_string()),
            ("--vm-name", req.name.clone()),
            ("--cpu", req.cpu.to_string()),
            ("--memory", req.memory.to_string()),
            ("--disk-size", req.disk_size.to_string()),
            ("--network", req.network.clone()),
            ("--os-version", req.os_version.clone()),
            ("--disk-image", req.disk_image.clone()),
            ("--host-name", req.host_name.clone()),
            ("--domain-name", req.domain_name.clone()),
            ("--full-name", req.full_name.clone()),
            ("--username", req.username.clone()),
        ];
        let args = flags
            .into_iter()
            .flat_map(|(flag, value)| [flag.to_string(), value])
            .collect();
        Self { program: program.to_path_buf(), args }
    }

    /// Value passed for `flag`, if present.
    pub fn flag(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Completion of a launched provisioning run.
pub type ProvisionTask =
    BoxFuture<'static, Result<ProvisionOutput, ProvisionError>>;

/// Starts provisioning runs.
///
/// `launch` returns once the run has started; the returned future resolves
/// when it finishes.
pub trait Provisioner: Send + Sync {
    fn launch(
        &self,
        command: ProvisionCommand,
    ) -> Result<ProvisionTask, ProvisionError>;
}

/// [`Provisioner`] that runs the script as a child process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptProvisioner;

impl Provisioner for ScriptProvisioner {
    fn launch(
        &self,
        command: ProvisionCommand,
    ) -> Result<ProvisionTask, ProvisionError> {
        let child = tokio::process::Command::new(&command.program)
            .args(command.args.iter().map(OsString::from))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                program: command.program.display().to_string(),
                source,
            })?;

        Ok(Box::pin(async move {
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let status = match output.status.code() {
                    Some(code) => format!("exited with status {code}"),
                    None => "was terminated by a signal".to_string(),
                };
                return Err(ProvisionError::Failed {
                    status,
                    stderr: String::from_utf8_lossy(&output.stderr)
                        .trim()
                        .to_string(),
                });
            }
            Ok(ProvisionOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            })
        }))
    }
}

/// The outcome of [`start`] from the HTTP caller's point of view.
#[derive(Debug)]
pub enum Started {
    /// Still running, or finished successfully within the grace period.
    Accepted { task_id: Uuid },
    /// Failed to launch, or exited unsuccessfully within the grace period.
    Failed(ProvisionError),
}

/// Launches `command` and waits up to `grace` for it to finish. A run that
/// is still going after that is handed to a background task which logs its
/// eventual outcome.
pub async fn start(
    provisioner: &dyn Provisioner,
    command: ProvisionCommand,
    grace: Duration,
    log: &Logger,
) -> Started {
    let task_id = Uuid::new_v4();
    let log = log.new(slog::o!(
        "task_id" => task_id.to_string(),
        "guest" => command.flag("--vm-name").unwrap_or_default().to_string(),
    ));

    info!(log, "launching provisioning script";
        "program" => %command.program.display());
    let mut task = match provisioner.launch(command) {
        Ok(task) => task,
        Err(e) => {
            error!(log, "provisioning script failed to launch";
                "error" => %e);
            return Started::Failed(e);
        }
    };

    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(output)) => {
            info!(log, "guest provisioned"; "summary" => output.summary());
            Started::Accepted { task_id }
        }
        Ok(Err(e)) => {
            error!(log, "guest provisioning failed"; "error" => %e);
            Started::Failed(e)
        }
        Err(_) => {
            tokio::spawn(async move {
                match task.await {
                    Ok(output) => {
                        info!(log, "guest provisioned";
                            "summary" => output.summary());
                    }
                    Err(e) => {
                        error!(log, "guest provisioning failed";
                            "error" => %e);
                    }
                }
            });
            Started::Accepted { task_id }
        }
    }
}
