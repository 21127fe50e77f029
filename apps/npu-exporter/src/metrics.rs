// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Conversion of the cached snapshots into Prometheus metric families.
//!
//! Families are built directly as protobuf values so that every sample can
//! carry the snapshot's timestamp; the stock gauge types only stamp at
//! encode time.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use prometheus::core::Desc;
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};

use ascend_container::DevicesInfos;

use crate::types::{timestamp_ms, NpuSnapshot};

pub const VERSION_INFO: &str = "npu_exporter_version_info";
pub const MACHINE_NPU_NUMS: &str = "machine_npu_nums";
pub const CHIP_NAME: &str = "npu_chip_info_name";
pub const CHIP_UTILIZATION: &str = "npu_chip_info_utilization";
pub const CHIP_HBM_UTILIZATION: &str = "npu_chip_info_hbm_utilization";
pub const CHIP_TEMPERATURE: &str = "npu_chip_info_temperature";
pub const CHIP_POWER: &str = "npu_chip_info_power";
pub const CHIP_VOLTAGE: &str = "npu_chip_info_voltage";
pub const CHIP_USED_MEMORY: &str = "npu_chip_info_used_memory";
pub const CHIP_TOTAL_MEMORY: &str = "npu_chip_info_total_memory";
pub const CHIP_HBM_USED_MEMORY: &str = "npu_chip_info_hbm_used_memory";
pub const CHIP_HBM_TOTAL_MEMORY: &str = "npu_chip_info_hbm_total_memory";
pub const CHIP_HEALTH: &str = "npu_chip_info_health_status";
pub const CHIP_NETWORK: &str = "npu_chip_info_network_status";
pub const CHIP_ERROR_CODE: &str = "npu_chip_info_error_code";
pub const CHIP_LINK_STATUS: &str = "npu_chip_info_link_status";
pub const CHIP_LINK_SPEED: &str = "npu_chip_link_speed";
pub const CHIP_LINK_UP_NUM: &str = "npu_chip_link_up_num";
pub const CHIP_BANDWIDTH_RX: &str = "npu_chip_info_bandwidth_rx";
pub const CHIP_BANDWIDTH_TX: &str = "npu_chip_info_bandwidth_tx";
pub const CONTAINER_INFO: &str = "npu_container_info";

/// Interface counters forwarded verbatim under a `npu_chip_` prefix.
const STAT_COUNTERS: &[&str] = &[
    "mac_rx_pause_num",
    "mac_tx_pause_num",
    "mac_rx_pfc_pkt_num",
    "mac_tx_pfc_pkt_num",
    "mac_rx_bad_pkt_num",
    "mac_tx_bad_pkt_num",
    "mac_rx_bad_oct_num",
    "mac_tx_bad_oct_num",
    "roce_rx_all_pkt_num",
    "roce_tx_all_pkt_num",
    "roce_rx_err_pkt_num",
    "roce_tx_err_pkt_num",
    "roce_rx_cnp_pkt_num",
    "roce_tx_cnp_pkt_num",
    "roce_unexpected_ack_num",
    "roce_out_of_order_num",
    "roce_verification_err_num",
    "roce_qp_status_err_num",
    "roce_new_pkt_rty_num",
];

/// Optical diagnostics keyed by the normalized `hccn_tool -optical` names;
/// numeric fields are `(key, metric)` while `optical_state` maps the
/// `present` flag.
const OPTICAL_VALUES: &[(&str, &str)] = &[
    ("tx_power_0", "npu_chip_optical_tx_power_0"),
    ("tx_power_1", "npu_chip_optical_tx_power_1"),
    ("tx_power_2", "npu_chip_optical_tx_power_2"),
    ("tx_power_3", "npu_chip_optical_tx_power_3"),
    ("rx_power_0", "npu_chip_optical_rx_power_0"),
    ("rx_power_1", "npu_chip_optical_rx_power_1"),
    ("rx_power_2", "npu_chip_optical_rx_power_2"),
    ("rx_power_3", "npu_chip_optical_rx_power_3"),
    ("vcc", "npu_chip_optical_vcc"),
    ("temperature", "npu_chip_optical_temp"),
];
const OPTICAL_STATE: &str = "npu_chip_optical_state";

static DESCS: Lazy<Vec<Desc>> = Lazy::new(|| {
    let id = vec!["id".to_string()];
    let mut descs = vec![
        desc(VERSION_INFO, "exporter version with value '1'", &["exporterVersion"]),
        desc(MACHINE_NPU_NUMS, "Amount of npu installed on the machine.", &[]),
        desc(CHIP_NAME, "the Ascend npu name with value '1'", &["id", "name"]),
        desc(
            CONTAINER_INFO,
            "the container name and deviceID relationship",
            &["containerID", "containerName", "npuID"],
        ),
    ];
    for (name, help) in [
        (CHIP_UTILIZATION, "the ai core utilization"),
        (CHIP_HBM_UTILIZATION, "the hbm bandwidth utilization"),
        (CHIP_TEMPERATURE, "the npu temperature"),
        (CHIP_POWER, "the npu power"),
        (CHIP_VOLTAGE, "the npu voltage"),
        (CHIP_USED_MEMORY, "the npu used memory"),
        (CHIP_TOTAL_MEMORY, "the npu total memory"),
        (CHIP_HBM_USED_MEMORY, "the npu hbm used memory"),
        (CHIP_HBM_TOTAL_MEMORY, "the npu hbm total memory"),
        (CHIP_HEALTH, "the npu health status"),
        (CHIP_NETWORK, "the npu network health status"),
        (CHIP_ERROR_CODE, "the npu error code"),
        (CHIP_LINK_STATUS, "the npu link status"),
        (CHIP_LINK_SPEED, "the npu interface speed, unit is 'Mb/s'"),
        (CHIP_LINK_UP_NUM, "the npu interface link up count"),
        (CHIP_BANDWIDTH_RX, "the npu interface receive speed, unit is 'MB/s'"),
        (CHIP_BANDWIDTH_TX, "the npu interface transport speed, unit is 'MB/s'"),
    ] {
        descs.push(Desc::new(name.to_string(), help.to_string(), id.clone(), HashMap::new())
            .expect("static metric descriptor"));
    }
    descs
});

fn desc(name: &str, help: &str, labels: &[&str]) -> Desc {
    Desc::new(
        name.to_string(),
        help.to_string(),
        labels.iter().map(|l| l.to_string()).collect(),
        HashMap::new(),
    )
    .expect("static metric descriptor")
}

pub fn descriptors() -> Vec<&'static Desc> {
    DESCS.iter().collect()
}

/// Accumulates gauge families, one per metric name, in first-use order.
struct FamilySet {
    order: Vec<String>,
    families: HashMap<String, MetricFamily>,
}

impl FamilySet {
    fn new() -> Self {
        FamilySet {
            order: Vec::new(),
            families: HashMap::new(),
        }
    }

    fn push(
        &mut self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
        timestamp: Option<i64>,
    ) {
        if !self.families.contains_key(name) {
            self.order.push(name.to_string());
        }
        let family = self.families.entry(name.to_string()).or_insert_with(|| {
            let mut f = MetricFamily::default();
            f.set_name(name.to_string());
            f.set_help(format!("exporter metric {name}"));
            f.set_field_type(MetricType::GAUGE);
            f
        });
        let mut metric = Metric::default();
        let mut gauge = Gauge::default();
        gauge.set_value(value);
        metric.set_gauge(gauge);
        if let Some(ts) = timestamp {
            metric.set_timestamp_ms(ts);
        }
        for (k, v) in labels {
            let mut pair = LabelPair::default();
            pair.set_name(k.to_string());
            pair.set_value(v.to_string());
            metric.mut_label().push(pair);
        }
        family.mut_metric().push(metric);
    }

    fn into_families(mut self) -> Vec<MetricFamily> {
        self.order
            .iter()
            .filter_map(|name| self.families.remove(name))
            .collect()
    }
}

/// Render one scrape: the chip metrics from the inventory snapshot plus the
/// container correlation from the device map.
pub fn render(
    snapshot: &NpuSnapshot,
    containers: Option<&DevicesInfos>,
    version: &str,
) -> Vec<MetricFamily> {
    let mut set = FamilySet::new();
    set.push(VERSION_INFO, &[("exporterVersion", version)], 1.0, None);

    // chip id -> owning container, inverted from the parse result
    let mut owners: HashMap<i64, &ascend_container::DevicesInfo> = HashMap::new();
    if let Some(containers) = containers {
        for info in containers.values() {
            for &chip in &info.devices {
                owners.insert(chip, info);
            }
        }
    }

    let mut total_chips = 0usize;
    for card in snapshot {
        let ts = Some(timestamp_ms(card.produced_at));
        for chip in &card.chips {
            total_chips += 1;
            let id = chip.physical_id.to_string();
            let labels: [(&str, &str); 1] = [("id", &id)];

            set.push(CHIP_NAME, &[("id", &id), ("name", &chip.display_name())], 1.0, ts);
            set.push(CHIP_UTILIZATION, &labels, chip.utilization as f64, ts);
            set.push(CHIP_TEMPERATURE, &labels, chip.temperature as f64, ts);
            set.push(CHIP_POWER, &labels, chip.power, ts);
            set.push(CHIP_VOLTAGE, &labels, chip.voltage, ts);

            let total = chip.memory.total_bytes as f64;
            let used = total * chip.memory.utilization_pct as f64 / 100.0;
            set.push(CHIP_USED_MEMORY, &labels, used, ts);
            set.push(CHIP_TOTAL_MEMORY, &labels, total, ts);

            let (hbm_used, hbm_total) = chip
                .hbm
                .map(|h| (h.used_bytes as f64, h.total_bytes as f64))
                .unwrap_or((0.0, 0.0));
            set.push(CHIP_HBM_USED_MEMORY, &labels, hbm_used, ts);
            set.push(CHIP_HBM_TOTAL_MEMORY, &labels, hbm_total, ts);
            if let Some(hbm) = &chip.hbm {
                set.push(
                    CHIP_HBM_UTILIZATION,
                    &labels,
                    hbm.bandwidth_util_pct as f64,
                    ts,
                );
            }

            set.push(CHIP_HEALTH, &labels, chip.health.code() as f64, ts);
            set.push(CHIP_NETWORK, &labels, chip.network_health.code() as f64, ts);
            push_error_codes(&mut set, &id, &chip.error_codes, ts);

            // chips without an interconnect report their link as down
            let link_status = chip.link.as_ref().map(|l| l.status.code()).unwrap_or(0);
            set.push(CHIP_LINK_STATUS, &labels, link_status as f64, ts);

            if let Some(link) = &chip.link {
                set.push(CHIP_LINK_SPEED, &labels, link.speed_mbps as f64, ts);
                set.push(CHIP_LINK_UP_NUM, &labels, link.up_count as f64, ts);
                set.push(CHIP_BANDWIDTH_RX, &labels, link.rx_mb_per_sec, ts);
                set.push(CHIP_BANDWIDTH_TX, &labels, link.tx_mb_per_sec, ts);
                for key in STAT_COUNTERS {
                    if let Some(&count) = link.stat_counters.get(*key) {
                        set.push(&format!("npu_chip_{key}"), &labels, count as f64, ts);
                    }
                }
                push_optical(&mut set, &id, &link.optical, ts);
            }

            if let Some(owner) = owners.get(&chip.physical_id) {
                set.push(
                    CONTAINER_INFO,
                    &[
                        ("containerID", owner.id.as_str()),
                        ("containerName", owner.name.as_str()),
                        ("npuID", id.as_str()),
                    ],
                    1.0,
                    None,
                );
            }
        }
    }

    set.push(MACHINE_NPU_NUMS, &[], total_chips as f64, None);
    set.into_families()
}

/// One `npu_chip_info_error_code` sample when at most one code is present;
/// indexed families when the chip reports several.
fn push_error_codes(set: &mut FamilySet, id: &str, codes: &[i64], ts: Option<i64>) {
    let labels: [(&str, &str); 1] = [("id", id)];
    match codes {
        [] => set.push(CHIP_ERROR_CODE, &labels, 0.0, ts),
        [single] => set.push(CHIP_ERROR_CODE, &labels, *single as f64, ts),
        many => {
            for (i, code) in many.iter().enumerate() {
                set.push(&format!("{CHIP_ERROR_CODE}_{i}"), &labels, *code as f64, ts);
            }
        }
    }
}

fn push_optical(
    set: &mut FamilySet,
    id: &str,
    optical: &HashMap<String, String>,
    ts: Option<i64>,
) {
    let labels: [(&str, &str); 1] = [("id", id)];
    for (key, metric) in OPTICAL_VALUES {
        if let Some(value) = optical.get(*key) {
            set.push(metric, &labels, ascend_smi::hccn::float_from_value(value), ts);
        }
    }
    if let Some(present) = optical.get("present") {
        let state = if present.trim() == "1" { 1.0 } else { 0.0 };
        set.push(OPTICAL_STATE, &labels, state, ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CardEntry, ChipTelemetry, Health};
    use ascend_container::DevicesInfo;
    use std::time::SystemTime;

    fn sample_value(families: &[MetricFamily], name: &str) -> Option<f64> {
        families
            .iter()
            .find(|f| f.get_name() == name)
            .and_then(|f| f.get_metric().first())
            .map(|m| m.get_gauge().get_value())
    }

    fn one_chip_snapshot() -> NpuSnapshot {
        let chip = ChipTelemetry {
            physical_id: 0,
            logical_id: 0,
            utilization: 42,
            temperature: 55,
            power: 8.3,
            voltage: 1.8,
            frequency: 1000,
            health: Health::Healthy,
            ..ChipTelemetry::default()
        };
        vec![CardEntry {
            card_id: 0,
            chips: vec![chip],
            produced_at: SystemTime::now(),
        }]
    }

    #[test]
    fn renders_single_healthy_chip() {
        let families = render(&one_chip_snapshot(), None, "v1.0");
        assert_eq!(sample_value(&families, MACHINE_NPU_NUMS), Some(1.0));
        assert_eq!(sample_value(&families, CHIP_UTILIZATION), Some(42.0));
        assert_eq!(sample_value(&families, CHIP_POWER), Some(8.3));
        assert_eq!(sample_value(&families, CHIP_VOLTAGE), Some(1.8));
        assert_eq!(sample_value(&families, CHIP_HEALTH), Some(1.0));
        assert_eq!(sample_value(&families, VERSION_INFO), Some(1.0));
        // no interconnect on this chip, the link still reports as down
        assert_eq!(sample_value(&families, CHIP_LINK_STATUS), Some(0.0));
        assert!(families.iter().all(|f| f.get_name() != CONTAINER_INFO));
        assert!(families.iter().all(|f| f.get_name() != CHIP_LINK_SPEED));
    }

    #[test]
    fn version_label_is_attached() {
        let families = render(&one_chip_snapshot(), None, "v1.0");
        let family = families.iter().find(|f| f.get_name() == VERSION_INFO).unwrap();
        let label = &family.get_metric()[0].get_label()[0];
        assert_eq!(label.get_name(), "exporterVersion");
        assert_eq!(label.get_value(), "v1.0");
    }

    #[test]
    fn container_info_joins_by_chip_id() {
        let mut containers = DevicesInfos::new();
        containers.insert(
            "c1".to_string(),
            DevicesInfo {
                id: "c1".to_string(),
                name: "ns_p_m".to_string(),
                devices: vec![0],
            },
        );
        let families = render(&one_chip_snapshot(), Some(&containers), "v1.0");
        let family = families.iter().find(|f| f.get_name() == CONTAINER_INFO).unwrap();
        let labels = family.get_metric()[0].get_label();
        let get = |name: &str| {
            labels
                .iter()
                .find(|l| l.get_name() == name)
                .map(|l| l.get_value().to_string())
                .unwrap_or_default()
        };
        assert_eq!(get("containerID"), "c1");
        assert_eq!(get("containerName"), "ns_p_m");
        assert_eq!(get("npuID"), "0");
    }

    #[test]
    fn samples_carry_snapshot_timestamp() {
        let snapshot = one_chip_snapshot();
        let expected = timestamp_ms(snapshot[0].produced_at);
        let families = render(&snapshot, None, "v1.0");
        let family = families
            .iter()
            .find(|f| f.get_name() == CHIP_UTILIZATION)
            .unwrap();
        assert_eq!(family.get_metric()[0].get_timestamp_ms(), expected);
    }

    #[test]
    fn multiple_error_codes_use_indexed_families() {
        let mut snapshot = one_chip_snapshot();
        snapshot[0].chips[0].error_codes = vec![7, 9];
        let families = render(&snapshot, None, "v1.0");
        assert!(families.iter().any(|f| f.get_name() == "npu_chip_info_error_code_0"));
        assert!(families.iter().any(|f| f.get_name() == "npu_chip_info_error_code_1"));
        assert!(families.iter().all(|f| f.get_name() != CHIP_ERROR_CODE));
    }
}
