// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-tick snapshot model: what one inventory pass over the SDK
//! produced. A snapshot is immutable once published; readers always see
//! either the previous complete value or the new one.

use std::time::SystemTime;

use ascend_smi::{ChipInfo, HbmInfo, LinkStats, MemoryInfo};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Health {
    Healthy,
    #[default]
    Unhealthy,
}

impl Health {
    pub fn code(self) -> i64 {
        match self {
            Health::Healthy => 1,
            Health::Unhealthy => 0,
        }
    }
}

/// Everything collected for one chip. Fields that failed to read carry
/// their sentinel value rather than poisoning the snapshot.
#[derive(Clone, Debug, Default)]
pub struct ChipTelemetry {
    pub physical_id: i64,
    pub logical_id: u32,
    pub info: ChipInfo,
    pub health: Health,
    pub network_health: Health,
    pub error_codes: Vec<i64>,
    /// -1 when the query failed.
    pub utilization: i64,
    /// -275 when the query failed.
    pub temperature: i64,
    /// Watts; -1 when the query failed.
    pub power: f64,
    /// Volts; -1 when the query failed.
    pub voltage: f64,
    /// MHz; -1 when the query failed.
    pub frequency: i64,
    pub memory: MemoryInfo,
    pub hbm: Option<HbmInfo>,
    pub process_count: Option<u32>,
    pub link: Option<LinkStats>,
}

impl ChipTelemetry {
    /// Label value of `npu_chip_info_name`: name-type-version.
    pub fn display_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.info.name, self.info.chip_type, self.info.version
        )
    }
}

#[derive(Clone, Debug)]
pub struct CardEntry {
    pub card_id: i32,
    pub chips: Vec<ChipTelemetry>,
    pub produced_at: SystemTime,
}

/// One complete inventory pass, cards in numerical order.
pub type NpuSnapshot = Vec<CardEntry>;

pub fn timestamp_ms(at: SystemTime) -> i64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
