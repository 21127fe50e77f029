// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! A scriptable in-memory stand-in for the driver library, used by unit
//! tests and by the collector tests further up the workspace.

use std::sync::Mutex;

use crate::error::DeviceError;
use crate::sys::{ChipIdent, DcmiBackend, RawHbm, RawMemory};

/// Everything the mock reports, plus failure injection knobs.
#[derive(Clone, Debug)]
pub struct MockState {
    pub cards: Vec<i32>,
    pub chips_per_card: i32,
    pub chip: ChipIdent,
    pub health: u32,
    pub network_health: u32,
    pub utilization: u32,
    /// Fail this many utilization calls with a busy code before succeeding.
    pub utilization_failures: u32,
    pub temperature: i32,
    /// Hundredths of a volt.
    pub voltage_raw: u32,
    /// Tenths of a watt.
    pub power_raw: i32,
    pub mcu_power_raw: i32,
    pub frequency: u32,
    pub memory: RawMemory,
    /// Pretend the v3 memory entry point is missing from the driver.
    pub memory_v3_missing: bool,
    pub error_codes: Vec<i64>,
    /// Pretend the v2 error-code entry point is missing from the driver.
    pub errorcode_v2_missing: bool,
    pub hbm: RawHbm,
    pub process_count: u32,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            cards: vec![0],
            chips_per_card: 1,
            chip: ChipIdent {
                name: "310P3".to_string(),
                chip_type: "Ascend".to_string(),
                version: "V1".to_string(),
            },
            health: 0,
            network_health: 0,
            utilization: 0,
            utilization_failures: 0,
            temperature: 40,
            voltage_raw: 90,
            power_raw: 700,
            mcu_power_raw: 750,
            frequency: 1000,
            memory: RawMemory {
                total_mb: 21_527,
                available_mb: 21_000,
                frequency_mhz: 1200,
                utilization_pct: 2,
            },
            memory_v3_missing: false,
            error_codes: Vec::new(),
            errorcode_v2_missing: false,
            hbm: RawHbm::default(),
            process_count: 0,
        }
    }
}

pub struct MockBackend {
    state: Mutex<MockState>,
    utilization_calls: Mutex<u32>,
}

impl MockBackend {
    pub fn new(state: MockState) -> Self {
        MockBackend {
            state: Mutex::new(state),
            utilization_calls: Mutex::new(0),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state())
    }

    pub fn utilization_calls(&self) -> u32 {
        *lock(&self.utilization_calls)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        lock(&self.state)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

const BUSY: i32 = -8012;

impl DcmiBackend for MockBackend {
    fn init(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn card_list(&self) -> Result<Vec<i32>, DeviceError> {
        Ok(self.state().cards.clone())
    }

    fn device_count(&self, _card_id: i32) -> Result<i32, DeviceError> {
        Ok(self.state().chips_per_card)
    }

    fn logical_id(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError> {
        let per_card = self.state().chips_per_card;
        Ok((card_id * per_card + device_id) as u32)
    }

    fn logical_id_list(&self) -> Result<Vec<u32>, DeviceError> {
        let state = self.state();
        let mut ids = Vec::new();
        for card in &state.cards {
            for dev in 0..state.chips_per_card {
                ids.push((card * state.chips_per_card + dev) as u32);
            }
        }
        Ok(ids)
    }

    fn card_and_device_of(&self, logical_id: u32) -> Result<(i32, i32), DeviceError> {
        let per_card = self.state().chips_per_card.max(1);
        Ok((logical_id as i32 / per_card, logical_id as i32 % per_card))
    }

    fn physical_id_of(&self, logical_id: u32) -> Result<u32, DeviceError> {
        Ok(logical_id)
    }

    fn chip_info(&self, _card_id: i32, _device_id: i32) -> Result<ChipIdent, DeviceError> {
        Ok(self.state().chip.clone())
    }

    fn health(&self, _card_id: i32, _device_id: i32) -> Result<u32, DeviceError> {
        Ok(self.state().health)
    }

    fn network_health(&self, _card_id: i32, _device_id: i32) -> Result<u32, DeviceError> {
        Ok(self.state().network_health)
    }

    fn utilization(&self, _card_id: i32, _device_id: i32, _unit: u32) -> Result<u32, DeviceError> {
        let mut calls = lock(&self.utilization_calls);
        *calls += 1;
        let state = self.state();
        if *calls <= state.utilization_failures {
            return Err(DeviceError::Sdk {
                op: "dcmi_get_device_utilization_rate",
                code: BUSY,
            });
        }
        Ok(state.utilization)
    }

    fn temperature(&self, _card_id: i32, _device_id: i32) -> Result<i32, DeviceError> {
        Ok(self.state().temperature)
    }

    fn voltage_raw(&self, _card_id: i32, _device_id: i32) -> Result<u32, DeviceError> {
        Ok(self.state().voltage_raw)
    }

    fn power_raw(&self, _card_id: i32, _device_id: i32) -> Result<i32, DeviceError> {
        Ok(self.state().power_raw)
    }

    fn mcu_power_raw(&self, _card_id: i32) -> Result<i32, DeviceError> {
        Ok(self.state().mcu_power_raw)
    }

    fn frequency(&self, _card_id: i32, _device_id: i32, _unit: u32) -> Result<u32, DeviceError> {
        Ok(self.state().frequency)
    }

    fn memory_info_v3(&self, _card_id: i32, _device_id: i32) -> Result<RawMemory, DeviceError> {
        let state = self.state();
        if state.memory_v3_missing {
            return Err(DeviceError::FunctionNotFound("dcmi_get_device_memory_info_v3"));
        }
        Ok(state.memory)
    }

    fn memory_info_v1(&self, _card_id: i32, _device_id: i32) -> Result<RawMemory, DeviceError> {
        Ok(self.state().memory)
    }

    fn error_codes_v2(&self, _card_id: i32, _device_id: i32) -> Result<Vec<i64>, DeviceError> {
        let state = self.state();
        if state.errorcode_v2_missing {
            return Err(DeviceError::FunctionNotFound("dcmi_get_device_errorcode_v2"));
        }
        Ok(state.error_codes.clone())
    }

    fn error_codes_v1(&self, _card_id: i32, _device_id: i32) -> Result<Vec<i64>, DeviceError> {
        Ok(self.state().error_codes.iter().take(1).copied().collect())
    }

    fn hbm_info(&self, _card_id: i32, _device_id: i32) -> Result<RawHbm, DeviceError> {
        Ok(self.state().hbm)
    }

    fn process_count(&self, _card_id: i32, _device_id: i32) -> Result<u32, DeviceError> {
        Ok(self.state().process_count)
    }

    fn create_vdevice(
        &self,
        _card_id: i32,
        _device_id: i32,
        _template: &str,
    ) -> Result<u32, DeviceError> {
        Ok(0)
    }

    fn destroy_vdevice(
        &self,
        _card_id: i32,
        _device_id: i32,
        _vdevice_id: u32,
    ) -> Result<(), DeviceError> {
        Ok(())
    }
}
