// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to load the device library: {0}")]
    LoadFailed(String),

    #[error("the device library does not export {0}")]
    FunctionNotFound(&'static str),

    #[error("{op} returned error code {code}")]
    Sdk { op: &'static str, code: i32 },

    #[error("{op} returned an out-of-range value: {detail}")]
    OutOfRange { op: &'static str, detail: String },

    #[error("unsupported chip family {0:?}")]
    UnsupportedChip(String),

    #[error("no valid chip found during initialization")]
    NoChipFound,

    #[error("{tool} execution failed: {detail}")]
    ToolFailed { tool: &'static str, detail: String },
}

impl DeviceError {
    pub(crate) fn out_of_range(op: &'static str, detail: impl Into<String>) -> Self {
        DeviceError::OutOfRange {
            op,
            detail: detail.into(),
        }
    }

    /// True when the error means the installed driver simply does not ship
    /// the requested entry point, which callers treat as "try the older
    /// call" rather than a failure.
    pub fn is_function_not_found(&self) -> bool {
        match self {
            DeviceError::FunctionNotFound(_) => true,
            DeviceError::Sdk { code, .. } => *code == crate::sys::FUNCTION_NOT_FOUND,
            _ => false,
        }
    }
}
