// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host probes: independent, read-only queries for one resource metric each.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use slog::{debug, Logger};
use thiserror::Error;
use virt_agent_api_types::{
    CpuTopology, DiskUsage, MemoryUsage, SnapshotField,
};

use crate::exec::CommandRunner;

pub mod hypervisor;
mod os;

use hypervisor::{Hypervisor, HypervisorHandle};

/// A host probe could not produce its value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{probe} probe unavailable: {cause}")]
pub struct ProbeUnavailable {
    pub probe: SnapshotField,
    pub cause: String,
}

impl ProbeUnavailable {
    pub fn new(probe: SnapshotField, cause: impl ToString) -> Self {
        Self { probe, cause: cause.to_string() }
    }
}

pub type ProbeResult<T> = Result<T, ProbeUnavailable>;

/// Read-only queries against the virtualization host.
///
/// Implementations report every failure through [`ProbeUnavailable`] and
/// hold no state between calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Total logical cores, and how many of them are online.
    async fn cpu_topology(&self) -> ProbeResult<CpuTopology>;

    async fn memory(&self) -> ProbeResult<MemoryUsage>;

    /// Usage of the filesystem mounted at `mount_point`.
    async fn disk(&self, mount_point: &str) -> ProbeResult<DiskUsage>;

    /// The most vCPUs a single guest may be assigned.
    async fn max_vcpu_ceiling(&self) -> ProbeResult<u32>;
}

/// Probes the machine the agent runs on: the hypervisor for CPU data, and
/// `free`/`df` for memory and disk.
pub struct SystemProbe {
    hypervisor: Arc<dyn Hypervisor>,
    runner: Arc<dyn CommandRunner>,
    free: PathBuf,
    df: PathBuf,
    log: Logger,
}

impl SystemProbe {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn CommandRunner>,
        log: Logger,
    ) -> Self {
        Self {
            hypervisor,
            runner,
            free: "free".into(),
            df: "df".into(),
            log,
        }
    }

    /// Opens a hypervisor handle, runs `query` against it, and closes the
    /// handle again regardless of the outcome.
    async fn with_hypervisor<T, F>(
        &self,
        probe: SnapshotField,
        query: F,
    ) -> ProbeResult<T>
    where
        F: for<'a> FnOnce(
            &'a dyn HypervisorHandle,
        ) -> futures::future::BoxFuture<
            'a,
            Result<T, hypervisor::HypervisorError>,
        >,
    {
        let handle = self
            .hypervisor
            .open_read_only()
            .await
            .map_err(|e| ProbeUnavailable::new(probe, e))?;
        let result = query(handle.as_ref()).await;
        handle.close().await;
        result.map_err(|e| ProbeUnavailable::new(probe, e))
    }

    async fn run(
        &self,
        probe: SnapshotField,
        program: &Path,
        args: &[&str],
    ) -> ProbeResult<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        debug!(self.log, "running probe command";
            "probe" => %probe,
            "program" => %program.display(),
            "args" => ?args);
        let out = self
            .runner
            .run(program.as_os_str(), &args)
            .await
            .map_err(|e| {
                ProbeUnavailable::new(
                    probe,
                    format!("cannot run {}: {e}", program.display()),
                )
            })?;
        if !out.success() {
            return Err(ProbeUnavailable::new(
                probe,
                format!("{} {}", program.display(), out.failure_summary()),
            ));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    async fn cpu_topology(&self) -> ProbeResult<CpuTopology> {
        let map = self
            .with_hypervisor(SnapshotField::Cpu, |h| h.cpu_map())
            .await?;
        Ok(CpuTopology { total: map.present, available: map.online_count() })
    }

    async fn memory(&self) -> ProbeResult<MemoryUsage> {
        let out = self.run(SnapshotField::Memory, &self.free, &[]).await?;
        os::parse_free(&out)
            .map_err(|e| ProbeUnavailable::new(SnapshotField::Memory, e))
    }

    async fn disk(&self, mount_point: &str) -> ProbeResult<DiskUsage> {
        // POSIX output format keeps long device names from wrapping.
        let out =
            self.run(SnapshotField::Disk, &self.df, &["-h", "-P"]).await?;
        os::parse_df(&out, mount_point)
            .map_err(|e| ProbeUnavailable::new(SnapshotField::Disk, e))
    }

    async fn max_vcpu_ceiling(&self) -> ProbeResult<u32> {
        self.with_hypervisor(SnapshotField::MaxVcpu, |h| h.max_vcpus()).await
    }
}
