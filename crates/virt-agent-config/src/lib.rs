// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the virt-agent configuration, which may be parsed from a TOML
//! file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the virt-agent server.
///
/// Every table and every key is optional; anything left out takes the value
/// from [`Config::default`].
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub hypervisor: Hypervisor,

    #[serde(default)]
    pub probe: Probe,

    #[serde(default)]
    pub provision: Provision,

    #[serde(default)]
    pub content: Content,
}

/// How to reach the local hypervisor.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Hypervisor {
    /// Connection URI, handed to `virsh` and to the provisioning script.
    pub uri: String,

    /// The `virsh` executable used for read-only queries.
    pub virsh: PathBuf,
}

impl Default for Hypervisor {
    fn default() -> Self {
        Self { uri: "qemu:///system".to_string(), virsh: "virsh".into() }
    }
}

/// Host probe tuning.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Probe {
    /// Upper bound on any single probe while building a host snapshot.
    pub timeout_ms: u64,

    /// Mount point whose filesystem the disk probe reports.
    pub disk_mount_point: String,
}

impl Probe {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self { timeout_ms: 3000, disk_mount_point: "/".to_string() }
    }
}

/// Guest provisioning.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Provision {
    /// The external executable that creates guests.
    pub script: PathBuf,

    /// How long to wait after launching the script before detaching from
    /// it. An exit within this window is reported to the HTTP caller.
    pub launch_grace_ms: u64,

    /// Largest guest description, in bytes, the server will accept.
    pub request_body_max_bytes: usize,
}

impl Provision {
    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }
}

impl Default for Provision {
    fn default() -> Self {
        Self {
            script: "./create-vm.sh".into(),
            launch_grace_ms: 500,
            request_body_max_bytes: 1024 * 1024,
        }
    }
}

/// Locations of static content served by the agent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Content {
    pub pages_dir: PathBuf,
    pub resources_dir: PathBuf,
}

impl Default for Content {
    fn default() -> Self {
        Self { pages_dir: "pages".into(), resources_dir: "resources".into() }
    }
}

/// Errors which may be returned when parsing the agent configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
