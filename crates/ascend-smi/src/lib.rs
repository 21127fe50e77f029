// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read-only adapter over the Ascend device stack: the `libdcmi` driver
//! library for per-chip telemetry and the `hccn_tool` CLI for interconnect
//! state.

pub mod device;
pub mod error;
pub mod hccn;
pub mod mock;
pub mod sys;

pub use device::{ChipInfo, DeviceInterface, DeviceManager, DeviceUnit, HbmInfo, MemoryInfo};
pub use error::DeviceError;
pub use hccn::{LinkStats, LinkStatus};
pub use sys::{DcmiBackend, DcmiLibrary};
