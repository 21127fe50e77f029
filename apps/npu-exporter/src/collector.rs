// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Inventory collection and the coordinator loop.
//!
//! One timer drives both scans: the chip inventory runs on the blocking
//! pool (driver calls block), the container parse is fire-and-forget on the
//! async runtime. Each publishes into its own cache slot; the scrape path
//! only ever reads the caches, with a single Once-gated synchronous refresh
//! for the cold-start case.

use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use tokio::sync::Notify;

use ascend_cache::ShardedCache;
use ascend_container::{DevicesInfos, DevicesParser};
use ascend_core::{ERROR_VALUE, NO_CARD, NETWORK_INIT, NETWORK_SUCCESS, TEMP_SENTINEL};
use ascend_smi::{DeviceInterface, DeviceUnit};

use crate::metrics;
use crate::types::{CardEntry, ChipTelemetry, Health, NpuSnapshot};

pub const INVENTORY_KEY: &str = "inventory";
pub const CONTAINER_MAP_KEY: &str = "containerMap";

/// Entries outlive a missed tick or two, never a restart.
pub const CACHE_TTL: Duration = Duration::from_secs(65);

/// Window granted to the one-shot container-map refresh on the scrape path.
const SCRAPE_REFRESH_WINDOW: Duration = Duration::from_secs(1);

const SNAPSHOT_CACHE_ENTRIES: usize = 128;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct NpuCollector {
    device: Arc<dyn DeviceInterface>,
    parser: Arc<DevicesParser>,
    snapshots: ShardedCache<Arc<NpuSnapshot>>,
    containers: ShardedCache<Arc<DevicesInfos>>,
    cache_ttl: Duration,
    update_interval: Duration,
    inventory_fallback: Once,
    container_fallback: Once,
}

impl NpuCollector {
    pub fn new(
        device: Arc<dyn DeviceInterface>,
        parser: Arc<DevicesParser>,
        update_interval: Duration,
    ) -> Self {
        NpuCollector {
            device,
            parser,
            snapshots: ShardedCache::new(SNAPSHOT_CACHE_ENTRIES),
            containers: ShardedCache::new(SNAPSHOT_CACHE_ENTRIES),
            cache_ttl: CACHE_TTL,
            update_interval,
            inventory_fallback: Once::new(),
            container_fallback: Once::new(),
        }
    }

    /// Run the periodic scans until `shutdown` fires. Owns both cache
    /// slots; everything else only reads them.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.update_interval.as_secs(),
            "collection loop started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.parser.fetch_and_parse();
                    let device = Arc::clone(&self.device);
                    match tokio::task::spawn_blocking(move || build_snapshot(device.as_ref())).await {
                        Ok(snapshot) => self.store_snapshot(snapshot),
                        Err(err) => tracing::error!(%err, "inventory task failed"),
                    }
                    self.drain_parser();
                }
                _ = shutdown.notified() => {
                    if let Err(err) = self.device.teardown() {
                        tracing::error!(%err, "device teardown failed");
                    }
                    tracing::warn!("received the stop signal, collection stopped");
                    return;
                }
            }
        }
    }

    fn store_snapshot(&self, snapshot: NpuSnapshot) {
        if let Err(err) = self
            .snapshots
            .set(INVENTORY_KEY, Arc::new(snapshot), Some(self.cache_ttl))
        {
            tracing::error!(%err, "snapshot cache update failed");
        }
    }

    fn drain_parser(&self) {
        while let Some(result) = self.parser.try_recv_result() {
            if let Err(err) =
                self.containers
                    .set(CONTAINER_MAP_KEY, Arc::new(result), Some(self.cache_ttl))
            {
                tracing::error!(%err, "container map cache update failed");
            }
        }
        while let Some(err) = self.parser.try_recv_err() {
            tracing::warn!(%err, "container parse reported an error");
        }
    }

    /// Current snapshot; on a cold cache the first scrape rebuilds it
    /// synchronously, later misses just render empty.
    fn snapshot_for_scrape(&self) -> Arc<NpuSnapshot> {
        if let Some(snapshot) = self.snapshots.get(INVENTORY_KEY) {
            return snapshot;
        }
        let mut rebuilt = None;
        self.inventory_fallback.call_once(|| {
            tracing::debug!("no cached inventory, rebuilding for scrape");
            let snapshot = Arc::new(build_snapshot(self.device.as_ref()));
            self.store_snapshot((*snapshot).clone());
            rebuilt = Some(snapshot);
        });
        rebuilt.unwrap_or_default()
    }

    /// Current container map; one cold-start refresh with a bounded
    /// window, an expired window silently yields no correlation.
    fn containers_for_scrape(&self) -> Option<Arc<DevicesInfos>> {
        if let Some(map) = self.containers.get(CONTAINER_MAP_KEY) {
            return Some(map);
        }
        let mut refreshed = None;
        self.container_fallback.call_once(|| {
            tracing::warn!("container map missing from cache, rebuilding");
            self.parser.fetch_and_parse();
            match self.parser.recv_result_blocking(SCRAPE_REFRESH_WINDOW) {
                Some(result) => {
                    let result = Arc::new(result);
                    if let Err(err) = self.containers.set(
                        CONTAINER_MAP_KEY,
                        Arc::clone(&result),
                        Some(self.cache_ttl),
                    ) {
                        tracing::error!(%err, "container map cache update failed");
                    }
                    refreshed = Some(result);
                }
                None => tracing::warn!("container map rebuild timed out"),
            }
        });
        refreshed
    }
}

impl Collector for NpuCollector {
    fn desc(&self) -> Vec<&Desc> {
        metrics::descriptors()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.snapshot_for_scrape();
        let containers = self.containers_for_scrape();
        metrics::render(&snapshot, containers.as_deref(), VERSION)
    }
}

/// One full inventory pass (the C2 path): enumerate cards and chips in
/// numerical order and assemble per-chip telemetry. Falls back to the flat
/// logical-id enumeration when the driver cannot group by card.
pub fn build_snapshot(device: &dyn DeviceInterface) -> NpuSnapshot {
    match device.list_cards() {
        Ok(cards) if !cards.is_empty() => {
            let mut snapshot = Vec::with_capacity(cards.len());
            for card_id in cards {
                let count = match device.chips_per_card(card_id) {
                    Ok(count) => count,
                    Err(err) => {
                        tracing::warn!(card_id, %err, "skipping card");
                        continue;
                    }
                };
                let mut chips = Vec::with_capacity(count as usize);
                for index in 0..count {
                    let logical_id = match device.logical_id(card_id, index) {
                        Ok(id) => id,
                        Err(err) => {
                            tracing::warn!(card_id, index, %err, "skipping chip");
                            continue;
                        }
                    };
                    if let Some(chip) = assemble_chip(device, logical_id) {
                        chips.push(chip);
                    }
                }
                snapshot.push(CardEntry {
                    card_id,
                    chips,
                    produced_at: SystemTime::now(),
                });
            }
            snapshot
        }
        other => {
            if let Err(err) = other {
                tracing::error!(%err, "card enumeration failed, using flat device list");
            } else {
                tracing::warn!("no cards reported, using flat device list");
            }
            flat_snapshot(device)
        }
    }
}

fn flat_snapshot(device: &dyn DeviceInterface) -> NpuSnapshot {
    let ids = match device.list_devices_flat() {
        Ok(ids) => ids,
        Err(err) => {
            tracing::error!(%err, "flat device enumeration failed");
            return Vec::new();
        }
    };
    let chips: Vec<ChipTelemetry> = ids
        .into_iter()
        .filter_map(|logical_id| assemble_chip(device, logical_id))
        .collect();
    if chips.is_empty() {
        return Vec::new();
    }
    vec![CardEntry {
        card_id: NO_CARD,
        chips,
        produced_at: SystemTime::now(),
    }]
}

/// Per-metric failures demote to sentinels; only a chip whose physical id
/// cannot be resolved is dropped entirely.
fn assemble_chip(device: &dyn DeviceInterface, logical_id: u32) -> Option<ChipTelemetry> {
    let physical_id = match device.physical_id_of(logical_id) {
        Ok(id) => i64::from(id),
        Err(err) => {
            tracing::warn!(logical_id, %err, "cannot resolve physical id, dropping chip");
            return None;
        }
    };

    let info = device.chip_info(logical_id).unwrap_or_default();
    let health = match device.health(logical_id) {
        Ok(0) => Health::Healthy,
        Ok(_) | Err(_) => Health::Unhealthy,
    };
    let utilization = demote(
        device.utilization(logical_id, DeviceUnit::AiCore).map(i64::from),
        logical_id,
        "utilization",
        ERROR_VALUE,
    );
    let temperature = demote(
        device.temperature(logical_id).map(i64::from),
        logical_id,
        "temperature",
        i64::from(TEMP_SENTINEL),
    );
    let power = demote(device.power(logical_id), logical_id, "power", -1.0);
    let voltage = demote(device.voltage(logical_id), logical_id, "voltage", -1.0);
    let frequency = demote(
        device.frequency(logical_id, DeviceUnit::AiCore).map(i64::from),
        logical_id,
        "frequency",
        ERROR_VALUE,
    );
    let error_codes = match device.error_codes(logical_id) {
        Ok(codes) => codes,
        Err(err) => {
            tracing::warn!(logical_id, %err, "error code query failed");
            vec![ERROR_VALUE]
        }
    };
    let memory = device.memory_info(logical_id).unwrap_or_default();
    let hbm = device
        .chip_kind()
        .has_hbm()
        .then(|| device.hbm_info(logical_id).unwrap_or_default());
    let process_count = device.process_count(logical_id).ok();

    let mut chip = ChipTelemetry {
        physical_id,
        logical_id,
        info,
        health,
        network_health: Health::Unhealthy,
        error_codes,
        utilization,
        temperature,
        power,
        voltage,
        frequency,
        memory,
        hbm,
        process_count,
        link: None,
    };

    if device.chip_kind().has_link() {
        chip.network_health = match device.network_health(logical_id) {
            Ok(code) if code == NETWORK_SUCCESS || code == NETWORK_INIT => Health::Healthy,
            Ok(_) | Err(_) => Health::Unhealthy,
        };
        chip.link = Some(match device.link_stats(physical_id as u32) {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!(logical_id, %err, "link query failed");
                ascend_smi::LinkStats::default()
            }
        });
    }

    Some(chip)
}

fn demote<T>(
    result: Result<T, ascend_smi::DeviceError>,
    logical_id: u32,
    what: &str,
    sentinel: T,
) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(logical_id, %err, "{what} query failed");
            sentinel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ascend_core::ChipKind;
    use ascend_smi::mock::{MockBackend, MockState};
    use ascend_smi::sys::{ChipIdent, RawHbm};
    use ascend_smi::{DcmiBackend, DeviceManager};

    fn device(state: MockState, kind: ChipKind) -> Arc<dyn DeviceInterface> {
        Arc::new(DeviceManager::with_kind(
            Arc::new(MockBackend::new(state)),
            kind,
        ))
    }

    fn chip_310p(state: MockState) -> Arc<dyn DeviceInterface> {
        device(state, ChipKind::Ascend310P)
    }

    #[test]
    fn single_healthy_chip_snapshot() {
        let mut state = MockState::default();
        state.utilization = 42;
        state.temperature = 55;
        state.mcu_power_raw = 83;
        state.voltage_raw = 180;
        state.health = 0;
        let snapshot = build_snapshot(chip_310p(state).as_ref());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].card_id, 0);
        let chip = &snapshot[0].chips[0];
        assert_eq!(chip.utilization, 42);
        assert_eq!(chip.temperature, 55);
        assert!((chip.power - 8.3).abs() < 1e-9);
        assert!((chip.voltage - 1.8).abs() < 1e-9);
        assert_eq!(chip.health, Health::Healthy);
        assert!(chip.hbm.is_none());
        assert!(chip.link.is_none());
    }

    #[test]
    fn busy_utilization_demotes_to_sentinel() {
        let mut state = MockState::default();
        state.utilization = 42;
        state.utilization_failures = 3;
        state.temperature = 55;
        let snapshot = build_snapshot(chip_310p(state).as_ref());
        let chip = &snapshot[0].chips[0];
        assert_eq!(chip.utilization, ERROR_VALUE);
        assert_eq!(chip.temperature, 55);
        assert!(chip.power > 0.0);
    }

    #[test]
    fn empty_card_list_takes_flat_path() {
        let mut state = MockState::default();
        state.cards = Vec::new();
        // the flat path still enumerates nothing, so the snapshot is empty
        let snapshot = build_snapshot(chip_310p(state).as_ref());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn flat_path_uses_no_card_sentinel() {
        let mut state = MockState::default();
        state.cards = vec![0, 1];
        state.chips_per_card = 1;
        let backend = Arc::new(FlatOnlyBackend(MockBackend::new(state)));
        let device: Arc<dyn DeviceInterface> =
            Arc::new(DeviceManager::with_kind(backend, ChipKind::Ascend310P));
        let snapshot = build_snapshot(device.as_ref());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].card_id, NO_CARD);
        assert_eq!(snapshot[0].chips.len(), 2);
    }

    #[test]
    fn hbm_family_carries_hbm_block() {
        let mut state = MockState::default();
        state.chip = ChipIdent {
            name: "910B".to_string(),
            chip_type: "Ascend".to_string(),
            version: "V1".to_string(),
        };
        state.hbm = RawHbm {
            total_kb: 1024,
            used_kb: 512,
            frequency_mhz: 1200,
            temperature: 45,
            bandwidth_util_pct: 7,
        };
        // 910 would also exec hccn_tool for link stats; absent tool degrades
        // to a default link block, which is what we assert on
        let snapshot = build_snapshot(device(state, ChipKind::Ascend910).as_ref());
        let chip = &snapshot[0].chips[0];
        let hbm = chip.hbm.expect("hbm present on 910");
        assert_eq!(hbm.total_bytes, 1024 * 1024);
        assert_eq!(hbm.used_bytes, 512 * 1024);
        assert!(chip.link.is_some());
    }

    /// Backend whose card enumeration fails, forcing the flat path.
    struct FlatOnlyBackend(MockBackend);

    impl ascend_smi::DcmiBackend for FlatOnlyBackend {
        fn init(&self) -> Result<(), ascend_smi::DeviceError> {
            self.0.init()
        }
        fn shutdown(&self) -> Result<(), ascend_smi::DeviceError> {
            self.0.shutdown()
        }
        fn card_list(&self) -> Result<Vec<i32>, ascend_smi::DeviceError> {
            Err(ascend_smi::DeviceError::Sdk {
                op: "dcmi_get_card_num_list",
                code: -8002,
            })
        }
        fn device_count(&self, card_id: i32) -> Result<i32, ascend_smi::DeviceError> {
            self.0.device_count(card_id)
        }
        fn logical_id(&self, card_id: i32, device_id: i32) -> Result<u32, ascend_smi::DeviceError> {
            self.0.logical_id(card_id, device_id)
        }
        fn logical_id_list(&self) -> Result<Vec<u32>, ascend_smi::DeviceError> {
            self.0.logical_id_list()
        }
        fn card_and_device_of(
            &self,
            logical_id: u32,
        ) -> Result<(i32, i32), ascend_smi::DeviceError> {
            self.0.card_and_device_of(logical_id)
        }
        fn physical_id_of(&self, logical_id: u32) -> Result<u32, ascend_smi::DeviceError> {
            self.0.physical_id_of(logical_id)
        }
        fn chip_info(
            &self,
            card_id: i32,
            device_id: i32,
        ) -> Result<ascend_smi::sys::ChipIdent, ascend_smi::DeviceError> {
            self.0.chip_info(card_id, device_id)
        }
        fn health(&self, card_id: i32, device_id: i32) -> Result<u32, ascend_smi::DeviceError> {
            self.0.health(card_id, device_id)
        }
        fn network_health(
            &self,
            card_id: i32,
            device_id: i32,
        ) -> Result<u32, ascend_smi::DeviceError> {
            self.0.network_health(card_id, device_id)
        }
        fn utilization(
            &self,
            card_id: i32,
            device_id: i32,
            unit: u32,
        ) -> Result<u32, ascend_smi::DeviceError> {
            self.0.utilization(card_id, device_id, unit)
        }
        fn temperature(&self, card_id: i32, device_id: i32) -> Result<i32, ascend_smi::DeviceError> {
            self.0.temperature(card_id, device_id)
        }
        fn voltage_raw(&self, card_id: i32, device_id: i32) -> Result<u32, ascend_smi::DeviceError> {
            self.0.voltage_raw(card_id, device_id)
        }
        fn power_raw(&self, card_id: i32, device_id: i32) -> Result<i32, ascend_smi::DeviceError> {
            self.0.power_raw(card_id, device_id)
        }
        fn mcu_power_raw(&self, card_id: i32) -> Result<i32, ascend_smi::DeviceError> {
            self.0.mcu_power_raw(card_id)
        }
        fn frequency(
            &self,
            card_id: i32,
            device_id: i32,
            unit: u32,
        ) -> Result<u32, ascend_smi::DeviceError> {
            self.0.frequency(card_id, device_id, unit)
        }
        fn memory_info_v3(
            &self,
            card_id: i32,
            device_id: i32,
        ) -> Result<ascend_smi::sys::RawMemory, ascend_smi::DeviceError> {
            self.0.memory_info_v3(card_id, device_id)
        }
        fn memory_info_v1(
            &self,
            card_id: i32,
            device_id: i32,
        ) -> Result<ascend_smi::sys::RawMemory, ascend_smi::DeviceError> {
            self.0.memory_info_v1(card_id, device_id)
        }
        fn error_codes_v2(
            &self,
            card_id: i32,
            device_id: i32,
        ) -> Result<Vec<i64>, ascend_smi::DeviceError> {
            self.0.error_codes_v2(card_id, device_id)
        }
        fn error_codes_v1(
            &self,
            card_id: i32,
            device_id: i32,
        ) -> Result<Vec<i64>, ascend_smi::DeviceError> {
            self.0.error_codes_v1(card_id, device_id)
        }
        fn hbm_info(
            &self,
            card_id: i32,
            device_id: i32,
        ) -> Result<ascend_smi::sys::RawHbm, ascend_smi::DeviceError> {
            self.0.hbm_info(card_id, device_id)
        }
        fn process_count(&self, card_id: i32, device_id: i32) -> Result<u32, ascend_smi::DeviceError> {
            self.0.process_count(card_id, device_id)
        }
        fn create_vdevice(
            &self,
            card_id: i32,
            device_id: i32,
            template: &str,
        ) -> Result<u32, ascend_smi::DeviceError> {
            self.0.create_vdevice(card_id, device_id, template)
        }
        fn destroy_vdevice(
            &self,
            card_id: i32,
            device_id: i32,
            vdevice_id: u32,
        ) -> Result<(), ascend_smi::DeviceError> {
            self.0.destroy_vdevice(card_id, device_id, vdevice_id)
        }
    }
}
