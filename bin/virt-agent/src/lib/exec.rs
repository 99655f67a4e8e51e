// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running external programs whose output the agent parses.

use std::ffi::OsStr;
use std::process::Stdio;

use async_trait::async_trait;

/// The result of running a program to completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Describes a failed run in a single line: the exit status followed by
    /// whatever the program wrote to stderr.
    pub fn failure_summary(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{status}: {stderr}")
        }
    }
}

/// Runs a program with arguments and captures everything it reports.
///
/// This is abstracted into a trait so that the probes built on top of it can
/// be exercised against canned output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &OsStr,
        args: &[String],
    ) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &OsStr,
        args: &[String],
    ) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_summary_includes_stderr() {
        let out = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "error: failed to connect to the hypervisor\n".to_string(),
        };
        assert!(!out.success());
        assert_eq!(
            out.failure_summary(),
            "exited with status 1: error: failed to connect to the hypervisor"
        );
    }

    #[test]
    fn failure_summary_without_stderr() {
        let out = CommandOutput { code: None, ..Default::default() };
        assert_eq!(out.failure_summary(), "terminated by signal");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_captures_output() {
        let out = ProcessRunner
            .run(OsStr::new("sh"), &["-c".to_string(), "echo hi".to_string()])
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hi\n");
    }
}
