// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Minimal Docker Engine API client over the daemon's Unix socket. Only the
//! two read paths the parser needs: list running containers and inspect one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::UnixStream;

use crate::error::ContainerError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// Docker prefixes names with a slash.
    pub fn plain_name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "CgroupParent", default)]
    pub cgroup_parent: String,
    #[serde(rename = "Privileged", default)]
    pub privileged: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Config", default)]
    pub config: Option<DockerConfig>,
    #[serde(rename = "HostConfig", default)]
    pub host_config: Option<HostConfig>,
}

impl ContainerInspect {
    /// The runtime-spec style cgroups path of this container: the parent as
    /// reported, with the container's own group appended in whichever
    /// convention the parent uses.
    pub fn cgroups_path(&self) -> String {
        let parent = self
            .host_config
            .as_ref()
            .map(|h| h.cgroup_parent.as_str())
            .unwrap_or("");
        if parent.is_empty() {
            format!("/docker/{}", self.id)
        } else if parent.starts_with('/') {
            format!("{}/{}", parent.trim_end_matches('/'), self.id)
        } else {
            // systemd driver reports a slice name
            format!("{parent}:docker:{}", self.id)
        }
    }
}

#[derive(Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    pub fn new(socket: &Path) -> Self {
        DockerClient {
            socket: socket.to_owned(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ContainerError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| ContainerError::runtime("docker connect timed out"))??;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ContainerError::runtime(format!("docker handshake: {e}")))?;
        let drive = tokio::spawn(conn);

        let request = Request::builder()
            .uri(path)
            .header(HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ContainerError::runtime(format!("docker request: {e}")))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ContainerError::runtime(format!("docker call {path}: {e}")))?;
        if !response.status().is_success() {
            drive.abort();
            return Err(ContainerError::runtime(format!(
                "docker call {path} returned {}",
                response.status()
            )));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ContainerError::runtime(format!("docker body {path}: {e}")))?
            .to_bytes();
        drive.abort();
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn list_running(&self) -> Result<Vec<ContainerSummary>, ContainerError> {
        self.get_json("/containers/json").await
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerInspect, ContainerError> {
        self.get_json(&format!("/containers/{id}/json")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_document_decodes() {
        let doc = r#"{
            "Id": "c1",
            "Name": "/worker",
            "Config": {"Labels": {"io.kubernetes.pod.name": "p"}, "Env": ["A=1"]},
            "HostConfig": {"CgroupParent": "/kubepods/besteffort", "Privileged": false}
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(doc).unwrap();
        assert_eq!(inspect.cgroups_path(), "/kubepods/besteffort/c1");
        assert_eq!(inspect.name, "/worker");
    }

    #[test]
    fn cgroups_path_variants() {
        let mut inspect: ContainerInspect = serde_json::from_str(r#"{"Id": "c1"}"#).unwrap();
        assert_eq!(inspect.cgroups_path(), "/docker/c1");
        inspect.host_config = Some(HostConfig {
            cgroup_parent: "system.slice".to_string(),
            privileged: false,
        });
        assert_eq!(inspect.cgroups_path(), "system.slice:docker:c1");
    }

    #[test]
    fn plain_name_strips_slash() {
        let summary: ContainerSummary =
            serde_json::from_str(r#"{"Id": "c1", "Names": ["/train-0"]}"#).unwrap();
        assert_eq!(summary.plain_name(), "train-0");
    }
}
