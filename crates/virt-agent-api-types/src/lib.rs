// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the virt-agent API

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Total and available (online) logical cores on the host.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct CpuTopology {
    pub total: u32,
    pub available: u32,
}

/// Usage of the filesystem backing one mount point.
///
/// Sizes are reported verbatim from `df -hP`, i.e. in human-readable units
/// such as `20G`.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub filesystem: String,
    pub size: String,
    pub used: String,
    pub available: String,
    pub use_percentage: String,
    pub mount_point: String,
}

/// Host memory counters as reported by the kernel (via `free`), keyed by
/// the counter name (`total`, `used`, `free`, `shared`, `buff/cache`,
/// `available`). Each value carries its unit suffix; the agent always
/// reports KiB, suffixed `Ki`.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(transparent)]
pub struct MemoryUsage(pub BTreeMap<String, String>);

impl MemoryUsage {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Names of the fields of a [`HostSnapshot`], one per host probe.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
pub enum SnapshotField {
    #[serde(rename = "cpu")]
    #[strum(serialize = "cpu")]
    Cpu,
    #[serde(rename = "disk")]
    #[strum(serialize = "disk")]
    Disk,
    #[serde(rename = "memory")]
    #[strum(serialize = "memory")]
    Memory,
    #[serde(rename = "maxVCPU")]
    #[strum(serialize = "maxVCPU")]
    MaxVcpu,
}

/// Why one field of a [`HostSnapshot`] is missing.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct ProbeDiagnostic {
    pub field: SnapshotField,
    pub cause: String,
}

/// Everything the agent could learn about the host for one request.
///
/// A field is present if and only if its probe succeeded; every probe that
/// failed has exactly one entry in `diagnostics`.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct HostSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuTopology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(
        default,
        rename = "maxVCPU",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_vcpu: Option<u32>,
    #[serde(default)]
    pub diagnostics: Vec<ProbeDiagnostic>,
}

impl HostSnapshot {
    /// Returns true if the given field was populated.
    pub fn has(&self, field: SnapshotField) -> bool {
        match field {
            SnapshotField::Cpu => self.cpu.is_some(),
            SnapshotField::Disk => self.disk.is_some(),
            SnapshotField::Memory => self.memory.is_some(),
            SnapshotField::MaxVcpu => self.max_vcpu.is_some(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct HostCpuResponse {
    #[serde(rename = "freeCPU")]
    pub free_cpu: u32,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct HostMemoryResponse {
    #[serde(rename = "freeMemory")]
    pub free_memory: MemoryUsage,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct HostMaxVcpuResponse {
    #[serde(rename = "maxvCPU")]
    pub max_vcpu: u32,
}

/// A request to create a new guest.
///
/// Every field is required: the agent never fills in defaults on behalf of
/// the provisioning script.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GuestCreateRequest {
    /// Name of the new guest domain.
    pub name: String,
    /// Number of vCPUs.
    pub cpu: u32,
    /// Memory size in MiB.
    pub memory: u64,
    /// Disk size in GiB.
    pub disk_size: u64,
    /// Network specification, e.g. `bridge=br0`.
    pub network: String,
    /// OS variant identifier, e.g. `debian12`.
    pub os_version: String,
    /// Location of the installation image.
    pub disk_image: String,
    pub host_name: String,
    pub domain_name: String,
    pub full_name: String,
    pub username: String,
}

impl GuestCreateRequest {
    /// Checks the values that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.name.contains('/') || self.name.contains(char::is_whitespace)
        {
            return Err(format!(
                "name {:?} must not contain '/' or whitespace",
                self.name
            ));
        }
        for (field, value) in [
            ("cpu", u64::from(self.cpu)),
            ("memory", self.memory),
            ("diskSize", self.disk_size),
        ] {
            if value == 0 {
                return Err(format!("{field} must be at least 1"));
            }
        }
        for (field, value) in [
            ("name", &self.name),
            ("network", &self.network),
            ("osVersion", &self.os_version),
            ("diskImage", &self.disk_image),
            ("hostName", &self.host_name),
            ("domainName", &self.domain_name),
            ("fullName", &self.full_name),
            ("username", &self.username),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{field} must not be empty"));
            }
            // Values are passed to the provisioning script as flag arguments.
            if value.starts_with('-') {
                return Err(format!("{field} must not start with '-'"));
            }
        }
        Ok(())
    }
}

/// Acknowledgement that guest creation has started.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestCreateAccepted {
    pub name: String,
    /// Identifies the background provisioning task in the agent's log.
    pub task_id: Uuid,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_omits_failed_fields() {
        let snapshot = HostSnapshot {
            cpu: Some(CpuTopology { total: 8, available: 3 }),
            max_vcpu: None,
            diagnostics: vec![ProbeDiagnostic {
                field: SnapshotField::MaxVcpu,
                cause: "hypervisor unreachable".to_string(),
            }],
            ..Default::default()
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            value,
            json!({
                "cpu": { "total": 8, "available": 3 },
                "diagnostics": [
                    { "field": "maxVCPU", "cause": "hypervisor unreachable" }
                ]
            })
        );
    }

    #[test]
    fn field_names_match_wire_names() {
        assert_eq!(SnapshotField::Cpu.to_string(), "cpu");
        assert_eq!(SnapshotField::MaxVcpu.to_string(), "maxVCPU");
        assert_eq!(
            serde_json::to_value(SnapshotField::Memory).unwrap(),
            json!("memory")
        );
    }

    #[test]
    fn disk_usage_uses_camel_case() {
        let disk = DiskUsage {
            filesystem: "/dev/sda1".to_string(),
            size: "20G".to_string(),
            used: "7.1G".to_string(),
            available: "12G".to_string(),
            use_percentage: "38%".to_string(),
            mount_point: "/".to_string(),
        };
        let value = serde_json::to_value(&disk).unwrap();
        assert_eq!(value["usePercentage"], "38%");
        assert_eq!(value["mountPoint"], "/");
    }

    #[test]
    fn guest_create_request_requires_every_field() {
        let body = json!({
            "name": "vm1",
            "cpu": 2,
            "memory": 2048,
            "diskSize": 20,
            "network": "bridge=br0",
            "osVersion": "debian12",
            "diskImage": "https://deb.debian.org/debian/",
            "hostName": "vm1",
            "domainName": "example.com",
            "fullName": "Debian User",
        });
        let err =
            serde_json::from_value::<GuestCreateRequest>(body).unwrap_err();
        assert!(err.to_string().contains("username"), "{err}");
    }

    #[test]
    fn guest_create_request_rejects_legacy_domain_key() {
        let body = json!({
            "name": "vm1",
            "cpu": 2,
            "memory": 2048,
            "diskSize": 20,
            "network": "bridge=br0",
            "osVersion": "debian12",
            "diskImage": "https://deb.debian.org/debian/",
            "hostName": "vm1",
            "domainName": "example.com",
            "pdomain_name": "example.com",
            "fullName": "Debian User",
            "username": "debian",
        });
        assert!(serde_json::from_value::<GuestCreateRequest>(body).is_err());
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let ok = GuestCreateRequest {
            name: "vm1".to_string(),
            cpu: 2,
            memory: 2048,
            disk_size: 20,
            network: "bridge=br0".to_string(),
            os_version: "debian12".to_string(),
            disk_image: "https://deb.debian.org/debian/".to_string(),
            host_name: "vm1".to_string(),
            domain_name: "example.com".to_string(),
            full_name: "Debian User".to_string(),
            username: "debian".to_string(),
        };
        assert_eq!(ok.validate(), Ok(()));

        let bad_name =
            GuestCreateRequest { name: "a b".to_string(), ..ok.clone() };
        assert!(bad_name.validate().is_err());

        let no_cpu = GuestCreateRequest { cpu: 0, ..ok.clone() };
        assert_eq!(
            no_cpu.validate(),
            Err("cpu must be at least 1".to_string())
        );

        let no_user =
            GuestCreateRequest { username: " ".to_string(), ..ok.clone() };
        assert_eq!(
            no_user.validate(),
            Err("username must not be empty".to_string())
        );

        let flag_like = GuestCreateRequest {
            full_name: "--username".to_string(),
            ..ok.clone()
        };
        assert_eq!(
            flag_like.validate(),
            Err("fullName must not start with '-'".to_string())
        );

        let dashed_name = GuestCreateRequest { name: "-vm".to_string(), ..ok };
        assert_eq!(
            dashed_name.validate(),
            Err("name must not start with '-'".to_string())
        );
    }
}
