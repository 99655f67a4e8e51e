// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only access to the local hypervisor.
//!
//! The agent only ever needs a handful of administrative queries, so the
//! hypervisor is modeled as a capability: open a read-only handle, ask it
//! about CPU topology or the per-guest vCPU ceiling, then close it.
//! [`VirshHypervisor`] provides that capability by driving `virsh` in
//! read-only mode.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::exec::CommandRunner;

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("failed to open connection to the hypervisor at {uri}: {cause}")]
    Connect { uri: String, cause: String },

    #[error("hypervisor query `{query}` failed: {cause}")]
    Query { query: &'static str, cause: String },

    #[error("unexpected output from `{query}`: {detail}")]
    Parse { query: &'static str, detail: String },
}

/// Which logical CPUs exist on the host and which of them are online.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuMap {
    pub present: u32,
    pub online: Vec<bool>,
}

impl CpuMap {
    pub fn online_count(&self) -> u32 {
        self.online.iter().filter(|online| **online).count() as u32
    }
}

/// Opens read-only administrative handles to a hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn open_read_only(
        &self,
    ) -> Result<Box<dyn HypervisorHandle>, HypervisorError>;
}

/// An open read-only handle.
///
/// Callers must [`close`](HypervisorHandle::close) the handle once done,
/// whether or not their queries succeeded.
#[async_trait]
pub trait HypervisorHandle: Send + Sync {
    async fn cpu_map(&self) -> Result<CpuMap, HypervisorError>;

    /// Maximum number of vCPUs a single guest may be given.
    async fn max_vcpus(&self) -> Result<u32, HypervisorError>;

    async fn close(self: Box<Self>);
}

/// Hypervisor access through the `virsh` command-line client.
///
/// Every query is a separate `virsh --readonly --connect <uri>` invocation;
/// opening a handle verifies that the connection URI is reachable.
pub struct VirshHypervisor {
    virsh: PathBuf,
    uri: String,
    runner: Arc<dyn CommandRunner>,
}

impl VirshHypervisor {
    pub fn new(
        virsh: impl Into<PathBuf>,
        uri: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self { virsh: virsh.into(), uri: uri.into(), runner }
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn open_read_only(
        &self,
    ) -> Result<Box<dyn HypervisorHandle>, HypervisorError> {
        let handle = VirshHandle {
            virsh: self.virsh.clone(),
            uri: self.uri.clone(),
            runner: self.runner.clone(),
        };
        handle.query("uri").await.map_err(|e| HypervisorError::Connect {
            uri: self.uri.clone(),
            cause: e.to_string(),
        })?;
        Ok(Box::new(handle))
    }
}

struct VirshHandle {
    virsh: PathBuf,
    uri: String,
    runner: Arc<dyn CommandRunner>,
}

impl VirshHandle {
    async fn query(
        &self,
        command: &'static str,
    ) -> Result<String, HypervisorError> {
        let args = vec![
            "--readonly".to_string(),
            "--connect".to_string(),
            self.uri.clone(),
            command.to_string(),
        ];
        let out = self
            .runner
            .run(self.virsh.as_os_str(), &args)
            .await
            .map_err(|e| HypervisorError::Query {
                query: command,
                cause: e.to_string(),
            })?;
        if !out.success() {
            return Err(HypervisorError::Query {
                query: command,
                cause: out.failure_summary(),
            });
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl HypervisorHandle for VirshHandle {
    async fn cpu_map(&self) -> Result<CpuMap, HypervisorError> {
        let out = self.query("nodecpumap").await?;
        parse_nodecpumap(&out)
    }

    async fn max_vcpus(&self) -> Result<u32, HypervisorError> {
        let out = self.query("maxvcpus").await?;
        out.trim().parse().map_err(|_| HypervisorError::Parse {
            query: "maxvcpus",
            detail: format!("{:?} is not a vCPU count", out.trim()),
        })
    }

    async fn close(self: Box<Self>) {
        // Each query is its own virsh session; nothing stays open.
    }
}

/// Parses the output of `virsh nodecpumap`:
///
/// ```text
/// CPUs present:   8
/// CPUs online:    6
/// CPU map:        yyyy-yy-
/// ```
pub(crate) fn parse_nodecpumap(out: &str) -> Result<CpuMap, HypervisorError> {
    let field = |name: &str| {
        out.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == name).then(|| value.trim())
        })
    };
    let parse_err = |detail: String| HypervisorError::Parse {
        query: "nodecpumap",
        detail,
    };

    let present = field("CPUs present")
        .ok_or_else(|| parse_err("missing `CPUs present`".to_string()))?;
    let present: u32 = present.parse().map_err(|_| {
        parse_err(format!("{present:?} is not a CPU count"))
    })?;

    let map = field("CPU map")
        .ok_or_else(|| parse_err("missing `CPU map`".to_string()))?;
    let online = map
        .chars()
        .map(|c| match c {
            'y' => Ok(true),
            '-' => Ok(false),
            other => Err(parse_err(format!("bad CPU map character {other:?}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if online.len() as u32 > present {
        return Err(parse_err(format!(
            "CPU map has {} entries but only {present} CPUs are present",
            online.len()
        )));
    }

    Ok(CpuMap { present, online })
}
