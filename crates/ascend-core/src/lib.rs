// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

/// Maximum number of cards the SDK will report.
pub const MAX_CARDS: usize = 64;

/// Maximum chips hosted on a single card.
pub const MAX_CHIPS_PER_CARD: usize = 4;

/// Physical ids above this value are rejected as invalid.
pub const MAX_PHYSICAL_ID: u32 = 127;

/// Upper bound (exclusive) for NPU char-device minor numbers.
pub const MAX_NPU_MINOR: i64 = 512;

/// Largest error-code count a single chip may report.
pub const MAX_ERROR_CODE_COUNT: usize = 128;

/// Sentinel emitted when a temperature query failed. No real reading can be
/// below absolute zero.
pub const TEMP_SENTINEL: i32 = -275;

/// Sentinel for every other failed per-metric query.
pub const ERROR_VALUE: i64 = -1;

/// Card id used by the flat enumeration fallback when the SDK cannot group
/// chips into cards.
pub const NO_CARD: i32 = -1;

/// Network health codes that count as healthy: freshly initialized or up.
pub const NETWORK_INIT: u32 = 6;
pub const NETWORK_SUCCESS: u32 = 0;

/// Scale factor from SDK tenths-of-watt to watts.
pub const TENTHS: f64 = 0.1;

/// Scale factor from SDK hundredths-of-volt to volts.
pub const HUNDREDTHS: f64 = 0.01;

#[derive(Clone, Hash, Copy, Debug, PartialEq, Eq)]
pub enum ChipKind {
    Ascend910,
    Ascend310P,
    Ascend310,
}

impl ChipKind {
    pub fn is_910(&self) -> bool {
        matches!(self, ChipKind::Ascend910)
    }

    pub fn is_310p(&self) -> bool {
        matches!(self, ChipKind::Ascend310P)
    }

    pub fn is_310(&self) -> bool {
        matches!(self, ChipKind::Ascend310)
    }

    /// HBM stacks and the HCCN interconnect only exist on the training part.
    pub fn has_hbm(&self) -> bool {
        self.is_910()
    }

    pub fn has_link(&self) -> bool {
        self.is_910()
    }

    /// Classify a chip by the name the SDK reports, e.g. "910B", "310P3" or
    /// "Ascend910". The name carries the family prefix; the suffix is a
    /// stepping.
    pub fn from_chip_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix("Ascend").unwrap_or(name);
        if name.starts_with("910") {
            Some(ChipKind::Ascend910)
        } else if name.starts_with("310P") {
            Some(ChipKind::Ascend310P)
        } else if name.starts_with("310") {
            Some(ChipKind::Ascend310)
        } else {
            None
        }
    }
}

impl FromStr for ChipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ascend910" => Ok(ChipKind::Ascend910),
            "Ascend310P" => Ok(ChipKind::Ascend310P),
            "Ascend310" => Ok(ChipKind::Ascend310),
            err => Err(err.to_string()),
        }
    }
}

impl fmt::Display for ChipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipKind::Ascend910 => write!(f, "Ascend910"),
            ChipKind::Ascend310P => write!(f, "Ascend310P"),
            ChipKind::Ascend310 => write!(f, "Ascend310"),
        }
    }
}
