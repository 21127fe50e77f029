// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("unknown cgroupsPath format: {0:?}")]
    UnknownCgroupsPathType(String),

    #[error("parsing fail: {0}")]
    ParseFail(String),

    #[error("no cgroup controller {0:?}")]
    NoCgroupController(String),

    #[error("no cgroup hierarchy")]
    NoCgroupHierarchy,

    #[error("container runtime failure: {0}")]
    Runtime(String),

    #[error("runtime call failed: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("runtime connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("container {container} has an invalid label: {detail}")]
    InvalidLabel { container: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("decoding runtime payload failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("container parse deadline elapsed")]
    Deadline,
}

impl ContainerError {
    pub(crate) fn runtime(detail: impl Into<String>) -> Self {
        ContainerError::Runtime(detail.into())
    }

    pub(crate) fn parse(detail: impl Into<String>) -> Self {
        ContainerError::ParseFail(detail.into())
    }
}
