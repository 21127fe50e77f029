// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hand-maintained gRPC surface for the two runtime services we consume:
//! the CRI `RuntimeService` (listing running containers) and the containerd
//! `Containers` service (fetching the OCI runtime spec). Only the fields
//! this crate reads are declared; protobuf skips the rest on decode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::ContainerError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// gRPC metadata key carrying the containerd namespace.
pub const NAMESPACE_HEADER: &str = "containerd-namespace";
/// Namespace used by Kubernetes via CRI + containerd.
pub const NAMESPACE_K8S: &str = "k8s.io";
/// Namespace used by dockerd's embedded containerd.
pub const NAMESPACE_MOBY: &str = "moby";

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerMetadata {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ContainerState {
    Created = 0,
    Running = 1,
    Exited = 2,
    Unknown = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerStateValue {
    #[prost(enumeration = "ContainerState", tag = "1")]
    pub state: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerFilter {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub state: Option<ContainerStateValue>,
    #[prost(string, tag = "3")]
    pub pod_sandbox_id: String,
    #[prost(map = "string, string", tag = "4")]
    pub label_selector: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListContainersRequest {
    #[prost(message, optional, tag = "1")]
    pub filter: Option<ContainerFilter>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Container {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub pod_sandbox_id: String,
    #[prost(message, optional, tag = "3")]
    pub metadata: Option<ContainerMetadata>,
    #[prost(enumeration = "ContainerState", tag = "6")]
    pub state: i32,
    #[prost(map = "string, string", tag = "8")]
    pub labels: HashMap<String, String>,
    #[prost(map = "string, string", tag = "9")]
    pub annotations: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListContainersResponse {
    #[prost(message, repeated, tag = "1")]
    pub containers: Vec<Container>,
}

/// Filter selecting only running containers, the one filter we ever send.
pub fn running_filter() -> ListContainersRequest {
    ListContainersRequest {
        filter: Some(ContainerFilter {
            id: String::new(),
            state: Some(ContainerStateValue {
                state: ContainerState::Running as i32,
            }),
            pod_sandbox_id: String::new(),
            label_selector: HashMap::new(),
        }),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetContainerRequest {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerdContainer {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
    #[prost(message, optional, tag = "5")]
    pub spec: Option<prost_types::Any>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetContainerResponse {
    #[prost(message, optional, tag = "1")]
    pub container: Option<ContainerdContainer>,
}

/// Dial a gRPC channel over a Unix socket with a bounded connect window.
pub async fn connect_uds(socket: &Path) -> Result<Channel, ContainerError> {
    let socket: PathBuf = socket.to_owned();
    let endpoint = Endpoint::try_from("http://[::]:0")
        .map_err(|e| ContainerError::runtime(e.to_string()))?
        .connect_timeout(CONNECT_TIMEOUT);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket = socket.clone();
        async move {
            let stream = UnixStream::connect(socket).await?;
            Ok::<_, std::io::Error>(TokioIo::new(stream))
        }
    }));
    let channel = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| ContainerError::runtime("runtime connect timed out"))??;
    Ok(channel)
}

fn not_ready(e: impl std::fmt::Display) -> tonic::Status {
    tonic::Status::unknown(format!("service was not ready: {e}"))
}

/// Client for `runtime.v1.RuntimeService`, list-only.
#[derive(Clone)]
pub struct RuntimeServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl RuntimeServiceClient {
    pub fn new(channel: Channel) -> Self {
        RuntimeServiceClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn list_containers(
        &mut self,
        request: ListContainersRequest,
    ) -> Result<ListContainersResponse, tonic::Status> {
        self.inner.ready().await.map_err(not_ready)?;
        let codec: ProstCodec<ListContainersRequest, ListContainersResponse> =
            ProstCodec::default();
        let path =
            http::uri::PathAndQuery::from_static("/runtime.v1.RuntimeService/ListContainers");
        self.inner
            .unary(tonic::Request::new(request), path, codec)
            .await
            .map(tonic::Response::into_inner)
    }
}

/// Client for `containerd.services.containers.v1.Containers`, get-only.
/// Every call carries the namespace header containerd multiplexes on.
#[derive(Clone)]
pub struct ContainersClient {
    inner: tonic::client::Grpc<Channel>,
    namespace: String,
}

impl ContainersClient {
    pub fn new(channel: Channel, namespace: &str) -> Self {
        ContainersClient {
            inner: tonic::client::Grpc::new(channel),
            namespace: namespace.to_string(),
        }
    }

    pub async fn get(
        &mut self,
        id: &str,
    ) -> Result<GetContainerResponse, tonic::Status> {
        self.inner.ready().await.map_err(not_ready)?;
        let codec: ProstCodec<GetContainerRequest, GetContainerResponse> = ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(
            "/containerd.services.containers.v1.Containers/Get",
        );
        let mut request = tonic::Request::new(GetContainerRequest { id: id.to_string() });
        let value = self
            .namespace
            .parse()
            .map_err(|_| tonic::Status::invalid_argument("invalid containerd namespace"))?;
        request.metadata_mut().insert(NAMESPACE_HEADER, value);
        self.inner
            .unary(request, path, codec)
            .await
            .map(tonic::Response::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn running_filter_round_trips() {
        let req = running_filter();
        let bytes = req.encode_to_vec();
        let decoded = ListContainersRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(
            decoded.filter.unwrap().state.unwrap().state,
            ContainerState::Running as i32
        );
    }

    #[test]
    fn container_decode_skips_unknown_fields() {
        let mut buf = Vec::new();
        Container {
            id: "abc".into(),
            pod_sandbox_id: String::new(),
            metadata: Some(ContainerMetadata {
                name: "main".into(),
                attempt: 0,
            }),
            state: ContainerState::Running as i32,
            labels: HashMap::from([("io.kubernetes.pod.name".to_string(), "p".to_string())]),
            annotations: HashMap::new(),
        }
        .encode(&mut buf)
        .unwrap();
        // splice in the image field (tag 4, length-delimited) which this
        // crate does not declare; decode must skip it
        buf.extend_from_slice(&[0x22, 0x04, 0x0a, 0x02, b'i', b'm']);
        let decoded = Container::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded.id, "abc");
        assert_eq!(decoded.metadata.unwrap().name, "main");
    }
}
