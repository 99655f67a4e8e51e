// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregation of every host probe into one [`HostSnapshot`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use slog::{warn, Logger};
use virt_agent_api_types::{HostSnapshot, ProbeDiagnostic, SnapshotField};

use crate::dispatch::panic_message;
use crate::probe::{HostProbe, ProbeResult, ProbeUnavailable};

/// Parameters for [`build_snapshot`].
#[derive(Clone, Debug)]
pub struct SnapshotOptions {
    /// Upper bound on each individual probe.
    pub timeout: Duration,

    /// Mount point reported in the snapshot's disk field.
    pub disk_mount_point: String,
}

impl From<&virt_agent_config::Probe> for SnapshotOptions {
    fn from(cfg: &virt_agent_config::Probe) -> Self {
        Self {
            timeout: cfg.timeout(),
            disk_mount_point: cfg.disk_mount_point.clone(),
        }
    }
}

/// Runs a single probe, converting a timeout into [`ProbeUnavailable`].
pub(crate) async fn bounded<T>(
    field: SnapshotField,
    timeout: Duration,
    probe: impl Future<Output = ProbeResult<T>>,
) -> ProbeResult<T> {
    match tokio::time::timeout(timeout, probe).await {
        Ok(result) => result,
        Err(_) => Err(ProbeUnavailable::new(
            field,
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Like [`bounded`], but a probe that panics is reported as unavailable
/// rather than unwinding into its siblings.
async fn isolated<T>(
    field: SnapshotField,
    timeout: Duration,
    probe: impl Future<Output = ProbeResult<T>>,
) -> ProbeResult<T> {
    AssertUnwindSafe(bounded(field, timeout, probe))
        .catch_unwind()
        .await
        .unwrap_or_else(|p| {
            Err(ProbeUnavailable::new(
                field,
                format!("probe panicked: {}", panic_message(p.as_ref())),
            ))
        })
}

/// Keeps a successful probe value, or records why the probe failed.
fn keep<T>(
    result: ProbeResult<T>,
    diagnostics: &mut Vec<ProbeDiagnostic>,
    log: &Logger,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(ProbeUnavailable { probe, cause }) => {
            warn!(log, "host probe failed";
                "probe" => %probe, "cause" => &cause);
            diagnostics.push(ProbeDiagnostic { field: probe, cause });
            None
        }
    }
}

/// Probes the host and composes the results.
///
/// All four probes run concurrently, each under `options.timeout`. This never
/// fails: a probe that errors, times out or panics leaves its field empty and
/// adds a diagnostic naming the cause, while the remaining fields are still
/// reported.
pub async fn build_snapshot(
    probe: &dyn HostProbe,
    options: &SnapshotOptions,
    log: &Logger,
) -> HostSnapshot {
    let timeout = options.timeout;
    // The probe calls sit inside async blocks so that a panic raised while
    // creating a probe future is caught by `isolated` as well.
    let (cpu, disk, memory, max_vcpu) = tokio::join!(
        isolated(SnapshotField::Cpu, timeout, async {
            probe.cpu_topology().await
        }),
        isolated(SnapshotField::Disk, timeout, async {
            probe.disk(&options.disk_mount_point).await
        }),
        isolated(SnapshotField::Memory, timeout, async {
            probe.memory().await
        }),
        isolated(SnapshotField::MaxVcpu, timeout, async {
            probe.max_vcpu_ceiling().await
        }),
    );

    let mut diagnostics = Vec::new();
    let cpu = keep(cpu, &mut diagnostics, log);
    let disk = keep(disk, &mut diagnostics, log);
    let memory = keep(memory, &mut diagnostics, log);
    let max_vcpu = keep(max_vcpu, &mut diagnostics, log);

    HostSnapshot { cpu, disk, memory, max_vcpu, diagnostics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockHostProbe;
    use std::collections::BTreeMap;
    use virt_agent_api_types::{CpuTopology, DiskUsage, MemoryUsage};

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn options() -> SnapshotOptions {
        SnapshotOptions {
            timeout: Duration::from_secs(3),
            disk_mount_point: "/".to_string(),
        }
    }

    fn root_disk() -> DiskUsage {
        DiskUsage {
            filesystem: "/dev/vda1".to_string(),
            size: "20G".to_string(),
            used: "5G".to_string(),
            available: "15G".to_string(),
            use_percentage: "25%".to_string(),
            mount_point: "/".to_string(),
        }
    }

    fn memory() -> MemoryUsage {
        MemoryUsage(BTreeMap::from([
            ("total".to_string(), "2048Ki".to_string()),
            ("free".to_string(), "1024Ki".to_string()),
        ]))
    }

    #[tokio::test]
    async fn all_probes_succeed() {
        let mut probe = MockHostProbe::new();
        probe
            .expect_cpu_topology()
            .returning(|| Ok(CpuTopology { total: 8, available: 3 }));
        probe
            .expect_disk()
            .withf(|mount| mount == "/")
            .returning(|_| Ok(root_disk()));
        probe.expect_memory().returning(|| Ok(memory()));
        probe.expect_max_vcpu_ceiling().returning(|| Ok(288));

        let snapshot = build_snapshot(&probe, &options(), &log()).await;
        assert_eq!(snapshot.cpu, Some(CpuTopology { total: 8, available: 3 }));
        assert_eq!(snapshot.disk, Some(root_disk()));
        assert_eq!(snapshot.memory, Some(memory()));
        assert_eq!(snapshot.max_vcpu, Some(288));
        assert!(snapshot.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn failed_probe_is_reported_inline() {
        let mut probe = MockHostProbe::new();
        probe
            .expect_cpu_topology()
            .returning(|| Ok(CpuTopology { total: 4, available: 4 }));
        probe.expect_disk().returning(|_| {
            Err(ProbeUnavailable::new(
                SnapshotField::Disk,
                "no filesystem is mounted at /",
            ))
        });
        probe.expect_memory().returning(|| Ok(memory()));
        probe.expect_max_vcpu_ceiling().returning(|| Ok(16));

        let snapshot = build_snapshot(&probe, &options(), &log()).await;
        assert!(snapshot.has(SnapshotField::Cpu));
        assert!(!snapshot.has(SnapshotField::Disk));
        assert!(snapshot.has(SnapshotField::Memory));
        assert_eq!(snapshot.max_vcpu, Some(16));
        assert_eq!(
            snapshot.diagnostics,
            vec![ProbeDiagnostic {
                field: SnapshotField::Disk,
                cause: "no filesystem is mounted at /".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn every_probe_failing_still_yields_a_snapshot() {
        let mut probe = MockHostProbe::new();
        probe.expect_cpu_topology().returning(|| {
            Err(ProbeUnavailable::new(SnapshotField::Cpu, "down"))
        });
        probe.expect_disk().returning(|_| {
            Err(ProbeUnavailable::new(SnapshotField::Disk, "down"))
        });
        probe.expect_memory().returning(|| {
            Err(ProbeUnavailable::new(SnapshotField::Memory, "down"))
        });
        probe.expect_max_vcpu_ceiling().returning(|| {
            Err(ProbeUnavailable::new(SnapshotField::MaxVcpu, "down"))
        });

        let snapshot = build_snapshot(&probe, &options(), &log()).await;
        assert_eq!(snapshot.cpu, None);
        assert_eq!(snapshot.max_vcpu, None);
        let fields: Vec<_> =
            snapshot.diagnostics.iter().map(|d| d.field).collect();
        assert_eq!(
            fields,
            vec![
                SnapshotField::Cpu,
                SnapshotField::Disk,
                SnapshotField::Memory,
                SnapshotField::MaxVcpu,
            ]
        );
    }

    #[tokio::test]
    async fn panicking_probe_does_not_hide_the_others() {
        let mut probe = MockHostProbe::new();
        probe
            .expect_cpu_topology()
            .returning(|| Ok(CpuTopology { total: 8, available: 3 }));
        probe.expect_disk().returning(|_| panic!("disk parser bug"));
        probe.expect_memory().returning(|| Ok(memory()));
        probe.expect_max_vcpu_ceiling().returning(|| Ok(288));

        let snapshot = build_snapshot(&probe, &options(), &log()).await;
        assert_eq!(snapshot.cpu, Some(CpuTopology { total: 8, available: 3 }));
        assert_eq!(snapshot.memory, Some(memory()));
        assert_eq!(snapshot.max_vcpu, Some(288));
        assert_eq!(snapshot.disk, None);
        assert_eq!(
            snapshot.diagnostics,
            vec![ProbeDiagnostic {
                field: SnapshotField::Disk,
                cause: "probe panicked: disk parser bug".to_string(),
            }]
        );
    }

    /// Answers every probe immediately except disk, which never returns.
    struct HangingDisk;

    #[async_trait::async_trait]
    impl HostProbe for HangingDisk {
        async fn cpu_topology(&self) -> ProbeResult<CpuTopology> {
            Ok(CpuTopology { total: 8, available: 3 })
        }

        async fn memory(&self) -> ProbeResult<MemoryUsage> {
            Ok(memory())
        }

        async fn disk(&self, _mount_point: &str) -> ProbeResult<DiskUsage> {
            std::future::pending().await
        }

        async fn max_vcpu_ceiling(&self) -> ProbeResult<u32> {
            Ok(288)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_does_not_hide_the_others() {
        let snapshot = build_snapshot(&HangingDisk, &options(), &log()).await;
        assert_eq!(snapshot.cpu, Some(CpuTopology { total: 8, available: 3 }));
        assert_eq!(snapshot.memory, Some(memory()));
        assert_eq!(snapshot.max_vcpu, Some(288));
        assert_eq!(snapshot.disk, None);
        assert_eq!(
            snapshot.diagnostics,
            vec![ProbeDiagnostic {
                field: SnapshotField::Disk,
                cause: "timed out after 3000ms".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_passes_through_quick_results() {
        let hang = std::future::pending::<ProbeResult<u32>>();
        let result = bounded(
            SnapshotField::MaxVcpu,
            Duration::from_millis(250),
            hang,
        )
        .await;
        assert_eq!(
            result,
            Err(ProbeUnavailable::new(
                SnapshotField::MaxVcpu,
                "timed out after 250ms"
            ))
        );

        let quick = async { Ok(CpuTopology { total: 2, available: 1 }) };
        let result =
            bounded(SnapshotField::Cpu, Duration::from_millis(250), quick)
                .await;
        assert_eq!(result, Ok(CpuTopology { total: 2, available: 1 }));
    }
}
