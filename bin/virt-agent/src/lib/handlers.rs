// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The agent's endpoints and the route table binding them to paths.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use slog::Logger;
use virt_agent_api_types::{
    GuestCreateAccepted, GuestCreateRequest, HostCpuResponse,
    HostMaxVcpuResponse, HostMemoryResponse, SnapshotField,
};
use virt_agent_config::Config;

use crate::dispatch::{DispatchError, Reply};
use crate::pages::{Pages, StaticFile};
use crate::probe::HostProbe;
use crate::provision::{self, ProvisionCommand, Provisioner, Started};
use crate::router::{RouteError, RouteTable};
use crate::snapshot::{bounded, build_snapshot, SnapshotOptions};

/// Something a route can be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Page(StaticFile),
    HostSnapshot,
    HostCpu,
    HostDisk,
    HostMemory,
    HostMaxVcpu,
    GuestCreate,
    /// Reserved for future use; always answers 501.
    NotImplemented(&'static str),
}

impl Endpoint {
    /// Whether the request body must be parsed before the handler runs.
    pub fn takes_body(&self) -> bool {
        matches!(self, Endpoint::GuestCreate)
    }
}

/// A request body, already parsed and validated.
#[derive(Debug)]
pub enum Payload {
    Empty,
    Guest(GuestCreateRequest),
}

/// Builds the agent's route table.
pub fn routes() -> Result<RouteTable<Endpoint>, RouteError> {
    use Endpoint::*;

    let mut table = RouteTable::new();
    let get = [
        ("/", Page(StaticFile::Landing)),
        ("/favicon.ico", Page(StaticFile::Favicon)),
        ("/resources/favicon.ico", Page(StaticFile::Favicon)),
        ("/api", Page(StaticFile::ApiOverview)),
        ("/api/v1", Page(StaticFile::ApiV1)),
        ("/api/v1/host", HostSnapshot),
        ("/api/v1/host/cpu", HostCpu),
        ("/api/v1/host/disk", HostDisk),
        ("/api/v1/host/memory", HostMemory),
        ("/api/v1/host/maxvcpu", HostMaxVcpu),
        ("/api/v1/guests", NotImplemented("guest listing")),
        ("/api/v1/guests/{id}", NotImplemented("guest details")),
        ("/api/v1/guests/{id}/cpu", NotImplemented("guest cpu usage")),
        ("/api/v1/guests/{id}/disk", NotImplemented("guest disk usage")),
        ("/api/v1/guests/{id}/memory", NotImplemented("guest memory usage")),
    ];
    for (pattern, endpoint) in get {
        table.register(Method::GET, pattern, endpoint)?;
    }
    table.register(Method::POST, "/api/v1/guests", GuestCreate)?;
    table.register(
        Method::DELETE,
        "/api/v1/guests/{id}",
        NotImplemented("guest deletion"),
    )?;
    Ok(table)
}

/// Collaborators the handlers are built on.
pub struct Services {
    pub probe: Arc<dyn HostProbe>,
    pub provisioner: Arc<dyn Provisioner>,
    pub pages: Pages,
    pub snapshot: SnapshotOptions,
    pub hypervisor_uri: String,
    pub script: PathBuf,
    pub launch_grace: Duration,
}

impl Services {
    pub fn new(
        config: &Config,
        probe: Arc<dyn HostProbe>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            probe,
            provisioner,
            pages: Pages::from(&config.content),
            snapshot: SnapshotOptions::from(&config.probe),
            hypervisor_uri: config.hypervisor.uri.clone(),
            script: config.provision.script.clone(),
            launch_grace: config.provision.launch_grace(),
        }
    }

    /// Runs the handler for `endpoint`.
    pub async fn call(
        &self,
        endpoint: &Endpoint,
        guest: Option<&str>,
        payload: Payload,
        log: &Logger,
    ) -> Result<Reply, DispatchError> {
        let timeout = self.snapshot.timeout;
        match (*endpoint, payload) {
            (Endpoint::Page(file), _) => self.page(file).await,
            (Endpoint::HostSnapshot, _) => {
                let snapshot =
                    build_snapshot(self.probe.as_ref(), &self.snapshot, log)
                        .await;
                Reply::json(StatusCode::OK, &snapshot)
            }
            (Endpoint::HostCpu, _) => {
                let cpu = bounded(
                    SnapshotField::Cpu,
                    timeout,
                    self.probe.cpu_topology(),
                )
                .await?;
                Reply::json(
                    StatusCode::OK,
                    &HostCpuResponse { free_cpu: cpu.available },
                )
            }
            (Endpoint::HostDisk, _) => {
                let disk = bounded(
                    SnapshotField::Disk,
                    timeout,
                    self.probe.disk(&self.snapshot.disk_mount_point),
                )
                .await?;
                Reply::json(StatusCode::OK, &disk)
            }
            (Endpoint::HostMemory, _) => {
                let memory =
                    bounded(SnapshotField::Memory, timeout, self.probe.memory())
                        .await?;
                Reply::json(
                    StatusCode::OK,
                    &HostMemoryResponse { free_memory: memory },
                )
            }
            (Endpoint::HostMaxVcpu, _) => {
                let max_vcpu = bounded(
                    SnapshotField::MaxVcpu,
                    timeout,
                    self.probe.max_vcpu_ceiling(),
                )
                .await?;
                Reply::json(StatusCode::OK, &HostMaxVcpuResponse { max_vcpu })
            }
            (Endpoint::GuestCreate, Payload::Guest(req)) => {
                self.create_guest(req, log).await
            }
            (Endpoint::GuestCreate, Payload::Empty) => Err(
                DispatchError::Internal("guest creation without a body".into()),
            ),
            (Endpoint::NotImplemented(endpoint), _) => {
                Err(DispatchError::NotImplemented {
                    endpoint,
                    guest: guest.map(str::to_string),
                })
            }
        }
    }

    async fn page(&self, file: StaticFile) -> Result<Reply, DispatchError> {
        match self.pages.read(file).await {
            Ok(content) => Ok(Reply::content(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(
                DispatchError::FileNotFound(
                    self.pages.path(file).display().to_string(),
                ),
            ),
            Err(e) => Err(DispatchError::Internal(format!(
                "reading {}: {e}",
                self.pages.path(file).display()
            ))),
        }
    }

    async fn create_guest(
        &self,
        req: GuestCreateRequest,
        log: &Logger,
    ) -> Result<Reply, DispatchError> {
        let command =
            ProvisionCommand::new(&self.script, &self.hypervisor_uri, &req);
        match provision::start(
            self.provisioner.as_ref(),
            command,
            self.launch_grace,
            log,
        )
        .await
        {
            Started::Accepted { task_id } => Reply::json(
                StatusCode::ACCEPTED,
                &GuestCreateAccepted {
                    message: format!(
                        "Creation of VM {} in progress...",
                        req.name
                    ),
                    name: req.name,
                    task_id,
                },
            ),
            Started::Failed(e) => Err(e.into()),
        }
    }
}
