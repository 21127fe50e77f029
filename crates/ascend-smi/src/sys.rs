// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Raw binding to the DCMI driver library.
//!
//! The driver ships as `libdcmi.so` and is bound at runtime, so the exporter
//! can start (and report load failures cleanly) on hosts without the driver
//! installed. Every entry point is looked up by name on use; a missing
//! symbol maps to [`DeviceError::FunctionNotFound`] which callers use to
//! fall back to older revisions of a call.

use std::os::raw::{c_int, c_uint};

use libloading::{Library, Symbol};

use crate::error::DeviceError;

pub const SUCCESS: i32 = 0;
/// Return code the shim yields when a symbol is absent from the driver.
pub const FUNCTION_NOT_FOUND: i32 = -99998;

pub const DEFAULT_LIBRARY: &str = "libdcmi.so";

/// `dcmi_main_cmd` selector for process queries via `dcmi_get_device_info`.
const MAIN_CMD_PROC_MGR: c_uint = 3;
const SUB_CMD_PROC_INFO: c_uint = 0;

const NAME_LEN: usize = 32;
const MAX_PROC_NUM: usize = 32;

#[repr(C)]
struct RawChipInfo {
    chip_type: [u8; NAME_LEN],
    chip_name: [u8; NAME_LEN],
    chip_ver: [u8; NAME_LEN],
    aicore_cnt: c_uint,
}

#[repr(C)]
struct RawMemoryInfoV3 {
    memory_size: u64,
    memory_available: u64,
    freq: c_uint,
    hugepagesize: u64,
    hugepages_total: u64,
    hugepages_free: u64,
    utilization: c_uint,
    reserved: [u8; 60],
}

#[repr(C)]
struct RawMemoryInfoV1 {
    memory_size: u64,
    freq: c_uint,
    utilization: c_uint,
}

#[repr(C)]
struct RawHbmInfo {
    memory_size: u64,
    freq: c_uint,
    memory_usage: u64,
    temp: c_int,
    bandwidth_util_rate: c_uint,
}

#[repr(C)]
struct RawProcInfo {
    proc_id: c_int,
    mem_usage: u64,
}

#[repr(C)]
struct RawProcList {
    proc_num: c_int,
    proc: [RawProcInfo; MAX_PROC_NUM],
}

/// Chip identity strings as reported by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChipIdent {
    pub name: String,
    pub chip_type: String,
    pub version: String,
}

impl ChipIdent {
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() || !self.chip_type.is_empty() || !self.version.is_empty()
    }
}

/// Main-memory figures, in the driver's native megabyte units.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawMemory {
    pub total_mb: u64,
    pub available_mb: u64,
    pub frequency_mhz: u32,
    pub utilization_pct: u32,
}

/// HBM figures, in the driver's native kilobyte units.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawHbm {
    pub total_kb: u64,
    pub frequency_mhz: u32,
    pub used_kb: u64,
    pub temperature: i32,
    pub bandwidth_util_pct: u32,
}

/// The raw SDK contract. One implementation wraps the loaded driver; tests
/// substitute a scriptable mock.
pub trait DcmiBackend: Send + Sync {
    fn init(&self) -> Result<(), DeviceError>;
    fn shutdown(&self) -> Result<(), DeviceError>;
    fn card_list(&self) -> Result<Vec<i32>, DeviceError>;
    fn device_count(&self, card_id: i32) -> Result<i32, DeviceError>;
    fn logical_id(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError>;
    fn logical_id_list(&self) -> Result<Vec<u32>, DeviceError>;
    fn card_and_device_of(&self, logical_id: u32) -> Result<(i32, i32), DeviceError>;
    fn physical_id_of(&self, logical_id: u32) -> Result<u32, DeviceError>;
    fn chip_info(&self, card_id: i32, device_id: i32) -> Result<ChipIdent, DeviceError>;
    fn health(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError>;
    fn network_health(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError>;
    fn utilization(&self, card_id: i32, device_id: i32, unit: u32) -> Result<u32, DeviceError>;
    fn temperature(&self, card_id: i32, device_id: i32) -> Result<i32, DeviceError>;
    /// Hundredths of a volt.
    fn voltage_raw(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError>;
    /// Tenths of a watt.
    fn power_raw(&self, card_id: i32, device_id: i32) -> Result<i32, DeviceError>;
    /// Card-scoped MCU power, tenths of a watt.
    fn mcu_power_raw(&self, card_id: i32) -> Result<i32, DeviceError>;
    fn frequency(&self, card_id: i32, device_id: i32, unit: u32) -> Result<u32, DeviceError>;
    fn memory_info_v3(&self, card_id: i32, device_id: i32) -> Result<RawMemory, DeviceError>;
    fn memory_info_v1(&self, card_id: i32, device_id: i32) -> Result<RawMemory, DeviceError>;
    fn error_codes_v2(&self, card_id: i32, device_id: i32) -> Result<Vec<i64>, DeviceError>;
    fn error_codes_v1(&self, card_id: i32, device_id: i32) -> Result<Vec<i64>, DeviceError>;
    fn hbm_info(&self, card_id: i32, device_id: i32) -> Result<RawHbm, DeviceError>;
    fn process_count(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError>;
    fn create_vdevice(
        &self,
        card_id: i32,
        device_id: i32,
        template: &str,
    ) -> Result<u32, DeviceError>;
    fn destroy_vdevice(
        &self,
        card_id: i32,
        device_id: i32,
        vdevice_id: u32,
    ) -> Result<(), DeviceError>;
}

fn check(op: &'static str, code: c_int) -> Result<(), DeviceError> {
    if code == SUCCESS {
        Ok(())
    } else if code == FUNCTION_NOT_FOUND {
        Err(DeviceError::FunctionNotFound(op))
    } else {
        Err(DeviceError::Sdk { op, code })
    }
}

fn decode_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// The driver library, opened with `dlopen` semantics.
pub struct DcmiLibrary {
    lib: Library,
}

impl DcmiLibrary {
    pub fn open() -> Result<Self, DeviceError> {
        Self::open_at(DEFAULT_LIBRARY)
    }

    pub fn open_at(path: &str) -> Result<Self, DeviceError> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| DeviceError::LoadFailed(format!("{path}: {e}")))?;
        Ok(DcmiLibrary { lib })
    }

    fn sym<T>(&self, name: &'static str) -> Result<Symbol<'_, T>, DeviceError> {
        unsafe { self.lib.get(name.as_bytes()) }
            .map_err(|_| DeviceError::FunctionNotFound(name))
    }
}

type Fn0 = unsafe extern "C" fn() -> c_int;
type FnCardList = unsafe extern "C" fn(*mut c_int, *mut c_int, c_int) -> c_int;
type FnCardOut1 = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnCardDevOut1 = unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int;
type FnCardDevOutU1 = unsafe extern "C" fn(c_int, c_int, *mut c_uint) -> c_int;
type FnCardDevUnitOutU1 = unsafe extern "C" fn(c_int, c_int, c_int, *mut c_uint) -> c_int;
type FnLogicList = unsafe extern "C" fn(*mut c_int, *mut c_uint, c_int) -> c_int;
type FnIdMap = unsafe extern "C" fn(c_uint, *mut c_uint) -> c_int;
type FnCardDevFromLogic = unsafe extern "C" fn(c_uint, *mut c_int, *mut c_int) -> c_int;
type FnChipInfo = unsafe extern "C" fn(c_int, c_int, *mut RawChipInfo) -> c_int;
type FnMemV3 = unsafe extern "C" fn(c_int, c_int, *mut RawMemoryInfoV3) -> c_int;
type FnMemV1 = unsafe extern "C" fn(c_int, c_int, *mut RawMemoryInfoV1) -> c_int;
type FnHbm = unsafe extern "C" fn(c_int, c_int, *mut RawHbmInfo) -> c_int;
type FnErrV2 =
    unsafe extern "C" fn(c_int, c_int, *mut c_int, *mut c_uint, c_uint) -> c_int;
type FnErrV1 =
    unsafe extern "C" fn(c_int, c_int, *mut c_int, *mut c_uint, c_int) -> c_int;
type FnMcuPower = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnDeviceInfo =
    unsafe extern "C" fn(c_int, c_int, c_uint, c_uint, *mut RawProcList, *mut c_uint) -> c_int;
type FnCreateVdev =
    unsafe extern "C" fn(c_int, c_int, *const u8, *mut c_uint) -> c_int;
type FnDestroyVdev = unsafe extern "C" fn(c_int, c_int, c_uint) -> c_int;

impl DcmiBackend for DcmiLibrary {
    fn init(&self) -> Result<(), DeviceError> {
        let f: Symbol<'_, Fn0> = self.sym("dcmi_init")?;
        check("dcmi_init", unsafe { f() })
    }

    fn shutdown(&self) -> Result<(), DeviceError> {
        // older drivers have no teardown entry point; dropping the handle
        // is all that can be done there
        match self.sym::<Fn0>("dcmi_release") {
            Ok(f) => check("dcmi_release", unsafe { f() }),
            Err(_) => Ok(()),
        }
    }

    fn card_list(&self) -> Result<Vec<i32>, DeviceError> {
        let f: Symbol<'_, FnCardList> = self.sym("dcmi_get_card_num_list")?;
        let mut num: c_int = 0;
        let mut cards = [0 as c_int; ascend_core::MAX_CARDS];
        check("dcmi_get_card_num_list", unsafe {
            f(&mut num, cards.as_mut_ptr(), cards.len() as c_int)
        })?;
        if num < 0 || num as usize > cards.len() {
            return Err(DeviceError::out_of_range(
                "dcmi_get_card_num_list",
                format!("card count {num}"),
            ));
        }
        Ok(cards[..num as usize].to_vec())
    }

    fn device_count(&self, card_id: i32) -> Result<i32, DeviceError> {
        let f: Symbol<'_, FnCardOut1> = self.sym("dcmi_get_device_num_in_card")?;
        let mut count: c_int = 0;
        check("dcmi_get_device_num_in_card", unsafe { f(card_id, &mut count) })?;
        if count < 0 {
            return Err(DeviceError::out_of_range(
                "dcmi_get_device_num_in_card",
                format!("device count {count}"),
            ));
        }
        Ok(count)
    }

    fn logical_id(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, unsafe extern "C" fn(*mut c_int, c_int, c_int) -> c_int> =
            self.sym("dcmi_get_device_logic_id")?;
        let mut logic: c_int = 0;
        check("dcmi_get_device_logic_id", unsafe {
            f(&mut logic, card_id, device_id)
        })?;
        if logic < 0 {
            return Err(DeviceError::out_of_range(
                "dcmi_get_device_logic_id",
                format!("logical id {logic}"),
            ));
        }
        Ok(logic as u32)
    }

    fn logical_id_list(&self) -> Result<Vec<u32>, DeviceError> {
        let f: Symbol<'_, FnLogicList> = self.sym("dcmi_get_logicid_list")?;
        let mut num: c_int = 0;
        let mut ids = [0 as c_uint; ascend_core::MAX_CARDS * ascend_core::MAX_CHIPS_PER_CARD];
        check("dcmi_get_logicid_list", unsafe {
            f(&mut num, ids.as_mut_ptr(), ids.len() as c_int)
        })?;
        if num < 0 || num as usize > ids.len() {
            return Err(DeviceError::out_of_range(
                "dcmi_get_logicid_list",
                format!("device count {num}"),
            ));
        }
        Ok(ids[..num as usize].to_vec())
    }

    fn card_and_device_of(&self, logical_id: u32) -> Result<(i32, i32), DeviceError> {
        let f: Symbol<'_, FnCardDevFromLogic> =
            self.sym("dcmi_get_card_id_device_id_from_logicid")?;
        let (mut card, mut dev): (c_int, c_int) = (0, 0);
        check("dcmi_get_card_id_device_id_from_logicid", unsafe {
            f(logical_id, &mut card, &mut dev)
        })?;
        Ok((card, dev))
    }

    fn physical_id_of(&self, logical_id: u32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnIdMap> = self.sym("dcmi_get_device_phyid_from_logicid")?;
        let mut phy: c_uint = 0;
        check("dcmi_get_device_phyid_from_logicid", unsafe {
            f(logical_id, &mut phy)
        })?;
        Ok(phy)
    }

    fn chip_info(&self, card_id: i32, device_id: i32) -> Result<ChipIdent, DeviceError> {
        let f: Symbol<'_, FnChipInfo> = self.sym("dcmi_get_device_chip_info")?;
        let mut raw: RawChipInfo = unsafe { std::mem::zeroed() };
        check("dcmi_get_device_chip_info", unsafe {
            f(card_id, device_id, &mut raw)
        })?;
        Ok(ChipIdent {
            name: decode_name(&raw.chip_name),
            chip_type: decode_name(&raw.chip_type),
            version: decode_name(&raw.chip_ver),
        })
    }

    fn health(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnCardDevOutU1> = self.sym("dcmi_get_device_health")?;
        let mut health: c_uint = 0;
        check("dcmi_get_device_health", unsafe {
            f(card_id, device_id, &mut health)
        })?;
        Ok(health)
    }

    fn network_health(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnCardDevOutU1> = self.sym("dcmi_get_netdev_link_status")?;
        let mut code: c_uint = 0;
        check("dcmi_get_netdev_link_status", unsafe {
            f(card_id, device_id, &mut code)
        })?;
        Ok(code)
    }

    fn utilization(&self, card_id: i32, device_id: i32, unit: u32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnCardDevUnitOutU1> = self.sym("dcmi_get_device_utilization_rate")?;
        let mut rate: c_uint = 0;
        check("dcmi_get_device_utilization_rate", unsafe {
            f(card_id, device_id, unit as c_int, &mut rate)
        })?;
        Ok(rate)
    }

    fn temperature(&self, card_id: i32, device_id: i32) -> Result<i32, DeviceError> {
        let f: Symbol<'_, FnCardDevOut1> = self.sym("dcmi_get_device_temperature")?;
        let mut temp: c_int = 0;
        check("dcmi_get_device_temperature", unsafe {
            f(card_id, device_id, &mut temp)
        })?;
        Ok(temp)
    }

    fn voltage_raw(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnCardDevOutU1> = self.sym("dcmi_get_device_voltage")?;
        let mut volt: c_uint = 0;
        check("dcmi_get_device_voltage", unsafe {
            f(card_id, device_id, &mut volt)
        })?;
        Ok(volt)
    }

    fn power_raw(&self, card_id: i32, device_id: i32) -> Result<i32, DeviceError> {
        let f: Symbol<'_, FnCardDevOut1> = self.sym("dcmi_get_device_power_info")?;
        let mut power: c_int = 0;
        check("dcmi_get_device_power_info", unsafe {
            f(card_id, device_id, &mut power)
        })?;
        Ok(power)
    }

    fn mcu_power_raw(&self, card_id: i32) -> Result<i32, DeviceError> {
        let f: Symbol<'_, FnMcuPower> = self.sym("dcmi_mcu_get_power_info")?;
        let mut power: c_int = 0;
        check("dcmi_mcu_get_power_info", unsafe { f(card_id, &mut power) })?;
        Ok(power)
    }

    fn frequency(&self, card_id: i32, device_id: i32, unit: u32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnCardDevUnitOutU1> = self.sym("dcmi_get_device_frequency")?;
        let mut freq: c_uint = 0;
        check("dcmi_get_device_frequency", unsafe {
            f(card_id, device_id, unit as c_int, &mut freq)
        })?;
        Ok(freq)
    }

    fn memory_info_v3(&self, card_id: i32, device_id: i32) -> Result<RawMemory, DeviceError> {
        let f: Symbol<'_, FnMemV3> = self.sym("dcmi_get_device_memory_info_v3")?;
        let mut raw: RawMemoryInfoV3 = unsafe { std::mem::zeroed() };
        check("dcmi_get_device_memory_info_v3", unsafe {
            f(card_id, device_id, &mut raw)
        })?;
        Ok(RawMemory {
            total_mb: raw.memory_size,
            available_mb: raw.memory_available,
            frequency_mhz: raw.freq,
            utilization_pct: raw.utilization,
        })
    }

    fn memory_info_v1(&self, card_id: i32, device_id: i32) -> Result<RawMemory, DeviceError> {
        let f: Symbol<'_, FnMemV1> = self.sym("dcmi_get_memory_info")?;
        let mut raw: RawMemoryInfoV1 = unsafe { std::mem::zeroed() };
        check("dcmi_get_memory_info", unsafe {
            f(card_id, device_id, &mut raw)
        })?;
        let used = raw.memory_size * u64::from(raw.utilization) / 100;
        Ok(RawMemory {
            total_mb: raw.memory_size,
            available_mb: raw.memory_size.saturating_sub(used),
            frequency_mhz: raw.freq,
            utilization_pct: raw.utilization,
        })
    }

    fn error_codes_v2(&self, card_id: i32, device_id: i32) -> Result<Vec<i64>, DeviceError> {
        let f: Symbol<'_, FnErrV2> = self.sym("dcmi_get_device_errorcode_v2")?;
        let mut count: c_int = 0;
        let mut codes = [0 as c_uint; ascend_core::MAX_ERROR_CODE_COUNT];
        check("dcmi_get_device_errorcode_v2", unsafe {
            f(
                card_id,
                device_id,
                &mut count,
                codes.as_mut_ptr(),
                codes.len() as c_uint,
            )
        })?;
        if count < 0 || count as usize > codes.len() {
            return Err(DeviceError::out_of_range(
                "dcmi_get_device_errorcode_v2",
                format!("error count {count}"),
            ));
        }
        Ok(codes[..count as usize].iter().map(|&c| i64::from(c)).collect())
    }

    fn error_codes_v1(&self, card_id: i32, device_id: i32) -> Result<Vec<i64>, DeviceError> {
        let f: Symbol<'_, FnErrV1> = self.sym("dcmi_get_device_errorcode")?;
        let mut count: c_int = 0;
        let mut code: c_uint = 0;
        check("dcmi_get_device_errorcode", unsafe {
            f(card_id, device_id, &mut count, &mut code, 1)
        })?;
        if count < 0 || count as usize > ascend_core::MAX_ERROR_CODE_COUNT {
            return Err(DeviceError::out_of_range(
                "dcmi_get_device_errorcode",
                format!("error count {count}"),
            ));
        }
        if count == 0 {
            Ok(Vec::new())
        } else {
            Ok(vec![i64::from(code)])
        }
    }

    fn hbm_info(&self, card_id: i32, device_id: i32) -> Result<RawHbm, DeviceError> {
        let f: Symbol<'_, FnHbm> = self.sym("dcmi_get_hbm_info")?;
        let mut raw: RawHbmInfo = unsafe { std::mem::zeroed() };
        check("dcmi_get_hbm_info", unsafe { f(card_id, device_id, &mut raw) })?;
        Ok(RawHbm {
            total_kb: raw.memory_size,
            frequency_mhz: raw.freq,
            used_kb: raw.memory_usage,
            temperature: raw.temp,
            bandwidth_util_pct: raw.bandwidth_util_rate,
        })
    }

    fn process_count(&self, card_id: i32, device_id: i32) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnDeviceInfo> = self.sym("dcmi_get_device_info")?;
        let mut list: RawProcList = unsafe { std::mem::zeroed() };
        let mut size = std::mem::size_of::<RawProcList>() as c_uint;
        check("dcmi_get_device_info", unsafe {
            f(
                card_id,
                device_id,
                MAIN_CMD_PROC_MGR,
                SUB_CMD_PROC_INFO,
                &mut list,
                &mut size,
            )
        })?;
        if list.proc_num < 0 || list.proc_num as usize > MAX_PROC_NUM {
            return Err(DeviceError::out_of_range(
                "dcmi_get_device_info",
                format!("process count {}", list.proc_num),
            ));
        }
        Ok(list.proc_num as u32)
    }

    fn create_vdevice(
        &self,
        card_id: i32,
        device_id: i32,
        template: &str,
    ) -> Result<u32, DeviceError> {
        let f: Symbol<'_, FnCreateVdev> = self.sym("dcmi_create_vdevice")?;
        let mut name = [0u8; NAME_LEN];
        let len = template.len().min(NAME_LEN - 1);
        name[..len].copy_from_slice(&template.as_bytes()[..len]);
        let mut vdev_id: c_uint = 0;
        check("dcmi_create_vdevice", unsafe {
            f(card_id, device_id, name.as_ptr(), &mut vdev_id)
        })?;
        Ok(vdev_id)
    }

    fn destroy_vdevice(
        &self,
        card_id: i32,
        device_id: i32,
        vdevice_id: u32,
    ) -> Result<(), DeviceError> {
        let f: Symbol<'_, FnDestroyVdev> = self.sym("dcmi_set_destroy_vdevice")?;
        check("dcmi_set_destroy_vdevice", unsafe {
            f(card_id, device_id, vdevice_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_name_stops_at_nul() {
        let mut raw = [0u8; NAME_LEN];
        raw[..4].copy_from_slice(b"910B");
        assert_eq!(decode_name(&raw), "910B");
        assert_eq!(decode_name(&[0u8; NAME_LEN]), "");
    }

    #[test]
    fn check_maps_codes() {
        assert!(check("op", SUCCESS).is_ok());
        assert!(matches!(
            check("op", FUNCTION_NOT_FOUND),
            Err(DeviceError::FunctionNotFound("op"))
        ));
        assert!(matches!(
            check("op", -8012),
            Err(DeviceError::Sdk { code: -8012, .. })
        ));
    }
}
