// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Interconnect statistics via the vendor `hccn_tool` CLI.
//!
//! The driver exposes no library call for link state; the supported path is
//! executing `hccn_tool` once per metric and parsing its line-oriented
//! output. All parsers here are pure functions over the captured stdout so
//! they can be exercised without the tool installed.

use std::collections::HashMap;
use std::process::Command;

use crate::error::DeviceError;

const HCCN_TOOL: &str = "/usr/local/Ascend/driver/tools/hccn_tool";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    #[default]
    Down,
}

impl LinkStatus {
    pub fn code(self) -> i64 {
        match self {
            LinkStatus::Up => 1,
            LinkStatus::Down => 0,
        }
    }
}

/// Everything the tool reports for one port.
#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    pub status: LinkStatus,
    pub speed_mbps: i64,
    pub up_count: i64,
    pub rx_mb_per_sec: f64,
    pub tx_mb_per_sec: f64,
    pub stat_counters: HashMap<String, i64>,
    pub optical: HashMap<String, String>,
}

fn run(physical_id: u32, query: &str) -> Result<String, DeviceError> {
    let output = Command::new(HCCN_TOOL)
        .args(["-i", &physical_id.to_string(), query, "-g"])
        .output()
        .map_err(|e| DeviceError::ToolFailed {
            tool: "hccn_tool",
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(DeviceError::ToolFailed {
            tool: "hccn_tool",
            detail: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Gather the full link picture for one port. Individual query failures
/// degrade to the zero value for that field so one flaky query does not
/// discard the rest.
pub fn collect(physical_id: u32) -> Result<LinkStats, DeviceError> {
    let mut stats = LinkStats::default();
    match run(physical_id, "-link") {
        Ok(out) => stats.status = parse_link_status(&out),
        Err(err) => return Err(err),
    }
    if let Ok(out) = run(physical_id, "-speed") {
        stats.speed_mbps = parse_speed(&out).unwrap_or(0);
    }
    if let Ok(out) = run(physical_id, "-link_stat") {
        stats.up_count = parse_link_up_count(&out);
    }
    if let Ok(out) = run(physical_id, "-bandwidth") {
        let (tx, rx) = parse_bandwidth(&out);
        stats.tx_mb_per_sec = tx;
        stats.rx_mb_per_sec = rx;
    }
    if let Ok(out) = run(physical_id, "-stat") {
        stats.stat_counters = parse_stat(&out);
    }
    if let Ok(out) = run(physical_id, "-optical") {
        stats.optical = parse_optical(&out);
    }
    Ok(stats)
}

/// Expected output: `link status: UP`.
pub fn parse_link_status(out: &str) -> LinkStatus {
    let joined = out.replace('\n', "");
    let parts: Vec<&str> = joined.split(' ').collect();
    if parts.len() != 3 {
        return LinkStatus::Down;
    }
    if parts[2] == "UP" {
        LinkStatus::Up
    } else {
        LinkStatus::Down
    }
}

/// Expected output: `Speed: 100000 Mb/s`.
pub fn parse_speed(out: &str) -> Option<i64> {
    let joined = out.replace('\n', "");
    let parts: Vec<&str> = joined.split(' ').collect();
    if parts.len() != 3 {
        return None;
    }
    parts[1].parse().ok()
}

/// Expected output contains `[device 0]link up count : 3`.
pub fn parse_link_up_count(out: &str) -> i64 {
    for line in out.lines() {
        if !line.contains("link up count") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return 0;
        }
        return fields[5].parse().unwrap_or(0);
    }
    0
}

/// Expected output: two lines of `Bandwidth TX: 0.00 MB/sec`. Returns
/// `(tx, rx)`.
pub fn parse_bandwidth(out: &str) -> (f64, f64) {
    let mut tx = 0.0;
    let mut rx = 0.0;
    for line in out.lines() {
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() != 4 {
            continue;
        }
        if line.contains("TX:") {
            if let Ok(v) = parts[2].parse() {
                tx = v;
            }
        } else if line.contains("RX:") {
            if let Ok(v) = parts[2].parse() {
                rx = v;
            }
        }
    }
    (tx, rx)
}

/// Expected output: one `name:count` pair per line.
pub fn parse_stat(out: &str) -> HashMap<String, i64> {
    let mut counters = HashMap::new();
    for line in out.lines() {
        let mut parts = line.splitn(2, ':');
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        match value.trim().parse() {
            Ok(count) => {
                counters.insert(key.trim().to_string(), count);
            }
            Err(_) => {
                tracing::warn!(key, value, "unparseable interface counter");
            }
        }
    }
    counters
}

/// Expected output: one `name : value` pair per line; keys are normalized
/// to lower_snake_case.
pub fn parse_optical(out: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in out.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 2 {
            continue;
        }
        let key = parts[0].trim().to_lowercase().replace(' ', "_");
        values.insert(key, parts[1].trim().to_string());
    }
    values
}

/// Pull the leading float out of a value like `3.1 mW` or `-2.5 dBm`.
pub fn float_from_value(value: &str) -> f64 {
    let parts: Vec<&str> = value.split(' ').collect();
    if parts.len() != 2 {
        return 0.0;
    }
    parts[0].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_status_up_and_down() {
        assert_eq!(parse_link_status("link status: UP\n"), LinkStatus::Up);
        assert_eq!(parse_link_status("link status: DOWN\n"), LinkStatus::Down);
        assert_eq!(parse_link_status("garbage"), LinkStatus::Down);
    }

    #[test]
    fn speed_line() {
        assert_eq!(parse_speed("Speed: 100000 Mb/s\n"), Some(100_000));
        assert_eq!(parse_speed("Speed: fast\n"), None);
        assert_eq!(parse_speed(""), None);
    }

    #[test]
    fn link_up_count_line() {
        let out = "some header\n[device 0]link up count : 3\n";
        assert_eq!(parse_link_up_count(out), 3);
        assert_eq!(parse_link_up_count("no such line"), 0);
    }

    #[test]
    fn bandwidth_lines() {
        let out = "Bandwidth TX: 12.50 MB/sec\nBandwidth RX: 0.25 MB/sec\n";
        let (tx, rx) = parse_bandwidth(out);
        assert!((tx - 12.5).abs() < 1e-9);
        assert!((rx - 0.25).abs() < 1e-9);
    }

    #[test]
    fn stat_counters() {
        let out = "mac_rx_pause_num:4\nmac_tx_pause_num:0\nbroken line\nempty:\n";
        let counters = parse_stat(out);
        assert_eq!(counters.get("mac_rx_pause_num"), Some(&4));
        assert_eq!(counters.get("mac_tx_pause_num"), Some(&0));
        assert_eq!(counters.len(), 2);
    }

    #[test]
    fn optical_values_normalized() {
        let out = "Tx Power 0 : 1.5 mW\npresent : 1\n";
        let optical = parse_optical(out);
        assert_eq!(optical.get("tx_power_0").map(String::as_str), Some("1.5 mW"));
        assert_eq!(optical.get("present").map(String::as_str), Some("1"));
    }

    #[test]
    fn float_extraction() {
        assert!((float_from_value("1.5 mW") - 1.5).abs() < 1e-9);
        assert_eq!(float_from_value("garbage"), 0.0);
        assert_eq!(float_from_value("1.5"), 0.0);
    }
}
