// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! The runtime operator: one contract over the two supported container
//! runtimes. The containerd variant pairs a CRI channel (listing) with the
//! containerd native API (OCI spec); the docker variant drives the Engine
//! API over the daemon socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cri::{
    self, ContainersClient, RuntimeServiceClient, NAMESPACE_K8S,
};
use crate::docker::DockerClient;
use crate::error::ContainerError;

pub const DEFAULT_CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_CRI_DOCKERD_SOCKET: &str = "/run/cri-dockerd.sock";
const DOCKER_CONTAINERD_SOCKET: &str = "/run/docker/containerd/docker-containerd.sock";
const DOCKER_CONTAINERD_ON_EULER: &str = "/run/docker/containerd/containerd.sock";

pub const UNIX_PREFIX: &str = "unix://";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    /// Kubernetes via CRI plus containerd.
    Containerd,
    /// Dockerd with or without Kubernetes.
    Docker,
}

/// How container display names are composed; fixed by the configured mode
/// rather than inferred from whichever fetcher answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameStyle {
    /// `namespace_podName_containerName` from validated pod labels.
    K8s,
    /// The bare container name.
    Plain,
}

#[derive(Clone, Debug)]
pub struct RuntimeOpts {
    pub endpoint_type: EndpointType,
    /// CRI server endpoint (`unix://...`).
    pub cri_endpoint: String,
    /// containerd native endpoint (`unix://...`).
    pub oci_endpoint: String,
    /// Try the well-known backup sockets when the configured ones fail.
    pub use_backup: bool,
}

impl RuntimeOpts {
    pub fn name_style(&self) -> NameStyle {
        match self.endpoint_type {
            EndpointType::Containerd => NameStyle::K8s,
            EndpointType::Docker => NameStyle::Plain,
        }
    }
}

/// One running container as the runtime reports it.
#[derive(Clone, Debug, Default)]
pub struct ContainerInfo {
    pub id: String,
    /// Container-scoped name (CRI metadata name or docker name).
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct OciDevice {
    #[serde(rename = "type", default)]
    pub dev_type: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
}

/// The slice of a container's OCI runtime spec the parser consumes.
#[derive(Clone, Debug, Default)]
pub struct OciView {
    pub cgroups_path: String,
    pub env: Vec<String>,
    pub devices: Vec<OciDevice>,
    pub privileged: bool,
}

#[derive(Deserialize)]
struct OciSpec {
    process: Option<OciProcess>,
    linux: Option<OciLinux>,
}

#[derive(Default, Deserialize)]
struct OciProcess {
    #[serde(default)]
    env: Vec<String>,
    capabilities: Option<OciCapabilities>,
}

#[derive(Default, Deserialize)]
struct OciCapabilities {
    #[serde(default)]
    permitted: Vec<String>,
}

#[derive(Default, Deserialize)]
struct OciLinux {
    #[serde(rename = "cgroupsPath", default)]
    cgroups_path: String,
    #[serde(default)]
    devices: Vec<OciDevice>,
}

// a permitted set covering every capability is how privileged containers
// present in the spec; order matters for the comparison, keep it sorted
const PRIVILEGE_CAPS: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYSLOG",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_WAKE_ALARM",
];

fn is_privileged(permitted: &[String]) -> bool {
    if permitted.len() != PRIVILEGE_CAPS.len() {
        return false;
    }
    let mut sorted: Vec<&str> = permitted.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted == PRIVILEGE_CAPS
}

fn strip_unix(endpoint: &str) -> &str {
    endpoint.strip_prefix(UNIX_PREFIX).unwrap_or(endpoint)
}

fn socket_exists(path: &str) -> bool {
    Path::new(path).exists()
}

pub enum RuntimeOperator {
    Containerd {
        cri: RuntimeServiceClient,
        containers: ContainersClient,
    },
    Docker {
        client: DockerClient,
    },
}

impl RuntimeOperator {
    /// Dial the configured runtime, falling back to the well-known backup
    /// sockets when allowed.
    pub async fn connect(opts: &RuntimeOpts) -> Result<Self, ContainerError> {
        match opts.endpoint_type {
            EndpointType::Containerd => Self::connect_containerd(opts).await,
            EndpointType::Docker => Self::connect_docker(opts).await,
        }
    }

    async fn connect_containerd(opts: &RuntimeOpts) -> Result<Self, ContainerError> {
        let cri_socket = strip_unix(&opts.cri_endpoint);
        let cri_channel = match cri::connect_uds(Path::new(cri_socket)).await {
            Ok(channel) => channel,
            Err(err) if opts.use_backup && socket_exists(DEFAULT_CRI_DOCKERD_SOCKET) => {
                tracing::warn!(%err, "CRI dial failed, retrying on cri-dockerd socket");
                cri::connect_uds(Path::new(DEFAULT_CRI_DOCKERD_SOCKET)).await?
            }
            Err(err) => return Err(err),
        };

        let oci_socket = strip_unix(&opts.oci_endpoint);
        let oci_channel = match cri::connect_uds(Path::new(oci_socket)).await {
            Ok(channel) => channel,
            Err(err) if opts.use_backup => {
                tracing::warn!(%err, "containerd dial failed, trying backup sockets");
                let backup = [DEFAULT_CONTAINERD_SOCKET, DOCKER_CONTAINERD_ON_EULER]
                    .into_iter()
                    .find(|p| socket_exists(p))
                    .ok_or(err)?;
                cri::connect_uds(Path::new(backup)).await?
            }
            Err(err) => return Err(err),
        };

        Ok(RuntimeOperator::Containerd {
            cri: RuntimeServiceClient::new(cri_channel),
            containers: ContainersClient::new(oci_channel, NAMESPACE_K8S),
        })
    }

    async fn connect_docker(opts: &RuntimeOpts) -> Result<Self, ContainerError> {
        let configured = strip_unix(&opts.oci_endpoint);
        let socket: PathBuf = if socket_exists(configured) {
            PathBuf::from(configured)
        } else if opts.use_backup && socket_exists(DEFAULT_DOCKER_SOCKET) {
            tracing::warn!(configured, "docker socket missing, using default");
            PathBuf::from(DEFAULT_DOCKER_SOCKET)
        } else if opts.use_backup && socket_exists(DOCKER_CONTAINERD_SOCKET) {
            PathBuf::from(DOCKER_CONTAINERD_SOCKET)
        } else {
            return Err(ContainerError::runtime(format!(
                "docker socket {configured:?} not found"
            )));
        };
        Ok(RuntimeOperator::Docker {
            client: DockerClient::new(&socket),
        })
    }

    /// Currently running containers.
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>, ContainerError> {
        match self {
            RuntimeOperator::Containerd { cri, .. } => {
                let mut client = cri.clone();
                let response = client.list_containers(cri::running_filter()).await?;
                Ok(response
                    .containers
                    .into_iter()
                    .map(|c| ContainerInfo {
                        name: c.metadata.map(|m| m.name).unwrap_or_default(),
                        id: c.id,
                        labels: c.labels,
                    })
                    .collect())
            }
            RuntimeOperator::Docker { client } => {
                let summaries = client.list_running().await?;
                Ok(summaries
                    .into_iter()
                    .map(|s| ContainerInfo {
                        name: s.plain_name(),
                        id: s.id,
                        labels: s.labels,
                    })
                    .collect())
            }
        }
    }

    /// The OCI-spec slice of one container, as seen by the runtime.
    pub async fn oci_view(&self, id: &str) -> Result<OciView, ContainerError> {
        match self {
            RuntimeOperator::Containerd { containers, .. } => {
                let mut client = containers.clone();
                let response = client.get(id).await?;
                let container = response
                    .container
                    .ok_or_else(|| ContainerError::runtime(format!("container {id} not found")))?;
                let any = container
                    .spec
                    .ok_or_else(|| ContainerError::runtime(format!("container {id} has no spec")))?;
                decode_spec(&any.value)
            }
            RuntimeOperator::Docker { client } => {
                let inspect = client.inspect(id).await?;
                let cgroups_path = inspect.cgroups_path();
                let config = inspect.config.unwrap_or_default();
                let host = inspect.host_config.unwrap_or_default();
                Ok(OciView {
                    cgroups_path,
                    env: config.env,
                    devices: Vec::new(),
                    privileged: host.privileged,
                })
            }
        }
    }
}

/// containerd stores the OCI runtime spec as JSON inside a protobuf `Any`.
fn decode_spec(value: &[u8]) -> Result<OciView, ContainerError> {
    let spec: OciSpec = serde_json::from_slice(value)?;
    let process = spec.process.unwrap_or_default();
    let linux = spec.linux.unwrap_or_default();
    let permitted = process
        .capabilities
        .map(|c| c.permitted)
        .unwrap_or_default();
    Ok(OciView {
        cgroups_path: linux.cgroups_path,
        env: process.env,
        devices: linux.devices,
        privileged: is_privileged(&permitted),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_decodes_cgroups_path_and_devices() {
        let doc = br#"{
            "process": {"env": ["PATH=/bin", "ASCEND_VISIBLE_DEVICES=0,1"]},
            "linux": {
                "cgroupsPath": "kubepods.slice:cri-containerd:abc",
                "devices": [
                    {"path": "/dev/davinci3", "type": "c", "major": 239, "minor": 3}
                ]
            }
        }"#;
        let view = decode_spec(doc).unwrap();
        assert_eq!(view.cgroups_path, "kubepods.slice:cri-containerd:abc");
        assert_eq!(view.devices.len(), 1);
        assert_eq!(view.devices[0].major, 239);
        assert!(!view.privileged);
        assert!(view.env.iter().any(|e| e.starts_with("ASCEND_VISIBLE_DEVICES")));
    }

    #[test]
    fn full_capability_set_is_privileged() {
        let caps: Vec<String> = PRIVILEGE_CAPS.iter().map(|c| c.to_string()).collect();
        assert!(is_privileged(&caps));
        assert!(!is_privileged(&caps[..10].to_vec()));
    }
}
