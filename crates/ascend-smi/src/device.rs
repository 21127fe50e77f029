// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! The family-neutral device adapter.
//!
//! [`DeviceManager`] wraps a [`DcmiBackend`] and hides the quirks of the
//! chip families behind one read-only contract: the 910 carries HBM and the
//! HCCN interconnect, the 310P substitutes a card-scoped MCU power reading
//! for the per-chip one, and the 310 has neither. Family selection happens
//! once at init by classifying the first valid chip the driver reports.

use std::sync::Arc;

use ascend_core::{ChipKind, HUNDREDTHS, MAX_ERROR_CODE_COUNT, MAX_PHYSICAL_ID, TENTHS};

use crate::error::DeviceError;
use crate::hccn::{self, LinkStats};
use crate::sys::{ChipIdent, DcmiBackend};

/// Query selector shared by the utilization and frequency calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceUnit {
    Memory = 1,
    AiCore = 2,
    AiCpu = 3,
    CtrlCpu = 4,
    MemoryBandwidth = 5,
    Hbm = 6,
    VectorCore = 12,
}

/// Attempts made for the calls the driver is known to answer with a
/// transient busy code under load.
const BUSY_ATTEMPTS: u32 = 3;

pub type ChipInfo = ChipIdent;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub frequency_mhz: u32,
    pub utilization_pct: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HbmInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub frequency_mhz: u32,
    pub temperature: i32,
    pub bandwidth_util_pct: u32,
}

/// Read-only view of the NPU fleet on this host. All operations are
/// synchronous; the underlying driver calls block.
pub trait DeviceInterface: Send + Sync {
    fn chip_kind(&self) -> ChipKind;
    fn list_cards(&self) -> Result<Vec<i32>, DeviceError>;
    fn chips_per_card(&self, card_id: i32) -> Result<i32, DeviceError>;
    /// Flat enumeration used when the driver cannot group chips into cards.
    fn list_devices_flat(&self) -> Result<Vec<u32>, DeviceError>;
    fn logical_id(&self, card_id: i32, chip_index: i32) -> Result<u32, DeviceError>;
    fn physical_id_of(&self, logical_id: u32) -> Result<u32, DeviceError>;
    fn chip_info(&self, logical_id: u32) -> Result<ChipInfo, DeviceError>;
    /// Raw health code; zero means healthy.
    fn health(&self, logical_id: u32) -> Result<u32, DeviceError>;
    /// Raw interconnect health code.
    fn network_health(&self, logical_id: u32) -> Result<u32, DeviceError>;
    fn utilization(&self, logical_id: u32, unit: DeviceUnit) -> Result<u32, DeviceError>;
    fn temperature(&self, logical_id: u32) -> Result<i32, DeviceError>;
    /// Volts.
    fn voltage(&self, logical_id: u32) -> Result<f64, DeviceError>;
    /// Watts.
    fn power(&self, logical_id: u32) -> Result<f64, DeviceError>;
    fn frequency(&self, logical_id: u32, unit: DeviceUnit) -> Result<u32, DeviceError>;
    fn memory_info(&self, logical_id: u32) -> Result<MemoryInfo, DeviceError>;
    fn hbm_info(&self, logical_id: u32) -> Result<HbmInfo, DeviceError>;
    fn error_codes(&self, logical_id: u32) -> Result<Vec<i64>, DeviceError>;
    fn process_count(&self, logical_id: u32) -> Result<u32, DeviceError>;
    fn link_stats(&self, physical_id: u32) -> Result<LinkStats, DeviceError>;
    fn create_virtual_device(
        &self,
        logical_id: u32,
        template: &str,
    ) -> Result<u32, DeviceError>;
    fn destroy_virtual_device(&self, logical_id: u32, vdevice_id: u32)
        -> Result<(), DeviceError>;
    fn teardown(&self) -> Result<(), DeviceError>;
}

pub struct DeviceManager {
    backend: Arc<dyn DcmiBackend>,
    kind: ChipKind,
}

impl DeviceManager {
    /// Initialize the driver and classify the chip family from the first
    /// valid chip it reports.
    pub fn auto_init(backend: Arc<dyn DcmiBackend>) -> Result<Self, DeviceError> {
        backend.init()?;
        let ident = probe_chip(backend.as_ref())?;
        let kind = ChipKind::from_chip_name(&ident.name)
            .ok_or_else(|| DeviceError::UnsupportedChip(ident.name.clone()))?;
        tracing::info!(chip = %ident.name, family = %kind, "device manager initialized");
        Ok(DeviceManager { backend, kind })
    }

    /// Build a manager with a known family, bypassing the probe. Intended
    /// for tests.
    pub fn with_kind(backend: Arc<dyn DcmiBackend>, kind: ChipKind) -> Self {
        DeviceManager { backend, kind }
    }

    fn locate(&self, logical_id: u32) -> Result<(i32, i32), DeviceError> {
        self.backend.card_and_device_of(logical_id)
    }
}

fn probe_chip(backend: &dyn DcmiBackend) -> Result<ChipIdent, DeviceError> {
    let cards = backend.card_list()?;
    for card in cards {
        let count = match backend.device_count(card) {
            Ok(n) => n,
            Err(_) => continue,
        };
        for dev in 0..count {
            match backend.chip_info(card, dev) {
                Ok(ident) if ident.is_valid() => return Ok(ident),
                _ => continue,
            }
        }
    }
    Err(DeviceError::NoChipFound)
}

impl DeviceInterface for DeviceManager {
    fn chip_kind(&self) -> ChipKind {
        self.kind
    }

    fn list_cards(&self) -> Result<Vec<i32>, DeviceError> {
        let mut cards = self.backend.card_list()?;
        cards.sort_unstable();
        Ok(cards)
    }

    fn chips_per_card(&self, card_id: i32) -> Result<i32, DeviceError> {
        let count = self.backend.device_count(card_id)?;
        if count < 1 {
            return Err(DeviceError::out_of_range(
                "chips_per_card",
                format!("card {card_id} reports {count} chips"),
            ));
        }
        Ok(count)
    }

    fn list_devices_flat(&self) -> Result<Vec<u32>, DeviceError> {
        let mut ids = self.backend.logical_id_list()?;
        ids.sort_unstable();
        Ok(ids)
    }

    fn logical_id(&self, card_id: i32, chip_index: i32) -> Result<u32, DeviceError> {
        self.backend.logical_id(card_id, chip_index)
    }

    fn physical_id_of(&self, logical_id: u32) -> Result<u32, DeviceError> {
        let phy = self.backend.physical_id_of(logical_id)?;
        if phy > MAX_PHYSICAL_ID {
            return Err(DeviceError::out_of_range(
                "physical_id_of",
                format!("physical id {phy} for logical id {logical_id}"),
            ));
        }
        Ok(phy)
    }

    fn chip_info(&self, logical_id: u32) -> Result<ChipInfo, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        self.backend.chip_info(card, dev)
    }

    fn health(&self, logical_id: u32) -> Result<u32, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        self.backend.health(card, dev)
    }

    fn network_health(&self, logical_id: u32) -> Result<u32, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        self.backend.network_health(card, dev)
    }

    fn utilization(&self, logical_id: u32, unit: DeviceUnit) -> Result<u32, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        let mut last = DeviceError::Sdk {
            op: "dcmi_get_device_utilization_rate",
            code: crate::sys::FUNCTION_NOT_FOUND,
        };
        for attempt in 0..BUSY_ATTEMPTS {
            match self.backend.utilization(card, dev, unit as u32) {
                Ok(rate) if rate <= 100 => return Ok(rate),
                Ok(rate) => {
                    last = DeviceError::out_of_range(
                        "utilization",
                        format!("rate {rate} for logical id {logical_id}"),
                    );
                }
                Err(err) => last = err,
            }
            if attempt + 1 < BUSY_ATTEMPTS {
                tracing::debug!(logical_id, attempt, "utilization query retry");
            }
        }
        Err(last)
    }

    fn temperature(&self, logical_id: u32) -> Result<i32, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        let temp = self.backend.temperature(card, dev)?;
        if temp < ascend_core::TEMP_SENTINEL {
            return Err(DeviceError::out_of_range(
                "temperature",
                format!("{temp} for logical id {logical_id}"),
            ));
        }
        Ok(temp)
    }

    fn voltage(&self, logical_id: u32) -> Result<f64, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        let raw = self.backend.voltage_raw(card, dev)?;
        Ok(f64::from(raw) * HUNDREDTHS)
    }

    fn power(&self, logical_id: u32) -> Result<f64, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        // the low-profile card only meters power at card scope
        let raw = if self.kind.is_310p() {
            self.backend.mcu_power_raw(card)?
        } else {
            self.backend.power_raw(card, dev)?
        };
        if raw < 0 {
            return Err(DeviceError::out_of_range(
                "power",
                format!("{raw} for logical id {logical_id}"),
            ));
        }
        Ok(f64::from(raw) * TENTHS)
    }

    fn frequency(&self, logical_id: u32, unit: DeviceUnit) -> Result<u32, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        let freq = self.backend.frequency(card, dev, unit as u32)?;
        if freq >= i32::MAX as u32 {
            return Err(DeviceError::out_of_range(
                "frequency",
                format!("{freq} for logical id {logical_id}"),
            ));
        }
        Ok(freq)
    }

    fn memory_info(&self, logical_id: u32) -> Result<MemoryInfo, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        let raw = match self.backend.memory_info_v3(card, dev) {
            Ok(raw) => raw,
            Err(err) if err.is_function_not_found() => self.backend.memory_info_v1(card, dev)?,
            Err(err) => return Err(err),
        };
        if raw.utilization_pct > 100 {
            return Err(DeviceError::out_of_range(
                "memory_info",
                format!("utilization {}", raw.utilization_pct),
            ));
        }
        if raw.total_mb < raw.available_mb {
            return Err(DeviceError::out_of_range(
                "memory_info",
                format!("total {} below available {}", raw.total_mb, raw.available_mb),
            ));
        }
        Ok(MemoryInfo {
            total_bytes: raw.total_mb * 1024 * 1024,
            frequency_mhz: raw.frequency_mhz,
            utilization_pct: raw.utilization_pct,
        })
    }

    fn hbm_info(&self, logical_id: u32) -> Result<HbmInfo, DeviceError> {
        if !self.kind.has_hbm() {
            return Ok(HbmInfo::default());
        }
        let (card, dev) = self.locate(logical_id)?;
        let raw = self.backend.hbm_info(card, dev)?;
        Ok(HbmInfo {
            total_bytes: raw.total_kb * 1024,
            used_bytes: raw.used_kb * 1024,
            frequency_mhz: raw.frequency_mhz,
            temperature: raw.temperature,
            bandwidth_util_pct: raw.bandwidth_util_pct,
        })
    }

    fn error_codes(&self, logical_id: u32) -> Result<Vec<i64>, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        let mut last = None;
        for _ in 0..BUSY_ATTEMPTS {
            let result = match self.backend.error_codes_v2(card, dev) {
                Err(err) if err.is_function_not_found() => self.backend.error_codes_v1(card, dev),
                other => other,
            };
            match result {
                Ok(codes) if codes.len() <= MAX_ERROR_CODE_COUNT => return Ok(codes),
                Ok(codes) => {
                    last = Some(DeviceError::out_of_range(
                        "error_codes",
                        format!("count {}", codes.len()),
                    ));
                }
                Err(err) => last = Some(err),
            }
        }
        Err(last.unwrap_or(DeviceError::Sdk {
            op: "error_codes",
            code: -1,
        }))
    }

    fn process_count(&self, logical_id: u32) -> Result<u32, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        self.backend.process_count(card, dev)
    }

    fn link_stats(&self, physical_id: u32) -> Result<LinkStats, DeviceError> {
        hccn::collect(physical_id)
    }

    fn create_virtual_device(
        &self,
        logical_id: u32,
        template: &str,
    ) -> Result<u32, DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        self.backend.create_vdevice(card, dev, template)
    }

    fn destroy_virtual_device(
        &self,
        logical_id: u32,
        vdevice_id: u32,
    ) -> Result<(), DeviceError> {
        let (card, dev) = self.locate(logical_id)?;
        self.backend.destroy_vdevice(card, dev, vdevice_id)
    }

    fn teardown(&self) -> Result<(), DeviceError> {
        self.backend.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockState};
    use crate::sys::RawHbm;

    fn manager(state: MockState, kind: ChipKind) -> (Arc<MockBackend>, DeviceManager) {
        let backend = Arc::new(MockBackend::new(state));
        let mgr = DeviceManager::with_kind(backend.clone(), kind);
        (backend, mgr)
    }

    #[test]
    fn auto_init_classifies_family() {
        let backend = Arc::new(MockBackend::new(MockState::default()));
        let mgr = DeviceManager::auto_init(backend).unwrap();
        assert_eq!(mgr.chip_kind(), ChipKind::Ascend310P);
    }

    #[test]
    fn auto_init_rejects_unknown_chip() {
        let mut state = MockState::default();
        state.chip.name = "GTX9000".to_string();
        let backend = Arc::new(MockBackend::new(state));
        assert!(matches!(
            DeviceManager::auto_init(backend),
            Err(DeviceError::UnsupportedChip(_))
        ));
    }

    #[test]
    fn utilization_retries_through_transient_busy() {
        let mut state = MockState::default();
        state.utilization = 42;
        state.utilization_failures = 2;
        let (backend, mgr) = manager(state, ChipKind::Ascend310P);
        assert_eq!(mgr.utilization(0, DeviceUnit::AiCore).unwrap(), 42);
        assert_eq!(backend.utilization_calls(), 3);
    }

    #[test]
    fn utilization_gives_up_after_three_attempts() {
        let mut state = MockState::default();
        state.utilization_failures = 3;
        let (backend, mgr) = manager(state, ChipKind::Ascend310P);
        assert!(mgr.utilization(0, DeviceUnit::AiCore).is_err());
        assert_eq!(backend.utilization_calls(), 3);
    }

    #[test]
    fn power_uses_card_reading_on_310p() {
        let mut state = MockState::default();
        state.power_raw = 700;
        state.mcu_power_raw = 830;
        let (_, mgr) = manager(state.clone(), ChipKind::Ascend310P);
        assert!((mgr.power(0).unwrap() - 83.0).abs() < 1e-9);
        let (_, mgr) = manager(state, ChipKind::Ascend910);
        assert!((mgr.power(0).unwrap() - 70.0).abs() < 1e-9);
    }

    #[test]
    fn voltage_scales_to_volts() {
        let mut state = MockState::default();
        state.voltage_raw = 180;
        let (_, mgr) = manager(state, ChipKind::Ascend310);
        assert!((mgr.voltage(0).unwrap() - 1.8).abs() < 1e-9);
    }

    #[test]
    fn hbm_is_zeroed_for_families_without_it() {
        let mut state = MockState::default();
        state.hbm = RawHbm {
            total_kb: 32 * 1024 * 1024,
            used_kb: 1024,
            frequency_mhz: 1200,
            temperature: 50,
            bandwidth_util_pct: 3,
        };
        let (_, mgr) = manager(state.clone(), ChipKind::Ascend310);
        assert_eq!(mgr.hbm_info(0).unwrap(), HbmInfo::default());
        let (_, mgr) = manager(state, ChipKind::Ascend910);
        let hbm = mgr.hbm_info(0).unwrap();
        assert_eq!(hbm.total_bytes, 32 * 1024 * 1024 * 1024);
        assert_eq!(hbm.used_bytes, 1024 * 1024);
    }

    #[test]
    fn memory_info_falls_back_to_v1() {
        let mut state = MockState::default();
        state.memory_v3_missing = true;
        let (_, mgr) = manager(state, ChipKind::Ascend310P);
        let mem = mgr.memory_info(0).unwrap();
        assert_eq!(mem.total_bytes, 21_527 * 1024 * 1024);
    }

    #[test]
    fn temperature_below_sentinel_rejected() {
        let mut state = MockState::default();
        state.temperature = -300;
        let (_, mgr) = manager(state, ChipKind::Ascend310P);
        assert!(mgr.temperature(0).is_err());
    }

    #[test]
    fn physical_id_above_limit_rejected() {
        let state = MockState::default();
        let (_, mgr) = manager(state, ChipKind::Ascend310P);
        assert!(mgr.physical_id_of(200).is_err());
    }
}
