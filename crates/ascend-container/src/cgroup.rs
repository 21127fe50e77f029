// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resolution from a runtime's `cgroupsPath` down to the `devices.list`
//! file of the container, and the scan of that file for NPU minors.
//!
//! Three steps, all pure over their inputs:
//!  1. find where the `devices` cgroup controller is mounted (mountinfo),
//!  2. expand the runtime's `cgroupsPath` into a filesystem hierarchy
//!     (cgroupfs paths pass through, systemd `slice:prefix:name` triples
//!     are expanded),
//!  3. scan `devices.list` for char devices whose major is an NPU major.

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ContainerError;

pub const DEVICES_CONTROLLER: &str = "devices";
pub const DEVICES_LIST: &str = "devices.list";

const SLICE_SUFFIX: &str = ".slice";
const SCOPE_SUFFIX: &str = ".scope";
const DEFAULT_SLICE: &str = "system.slice";

/// Minimum column count of a mountinfo record per proc(5).
const MOUNTINFO_MIN_COLS: usize = 10;
const MOUNTINFO_MOUNT_POINT: usize = 4;
/// Offset of the filesystem type, counted from the end of the record
/// (optional fields make the absolute position variable).
const MOUNTINFO_FSTYPE_FROM_END: usize = 3;

/// Driver name the NPU char devices register under in /proc/devices.
static NPU_MAJOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]{1,3}\s[v]?devdrv-cdev$").expect("static pattern")
});

const PROC_DEVICES: &str = "/proc/devices";
const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mount root of the given cgroup controller on this host.
pub fn controller_root(controller: &str) -> Result<PathBuf, ContainerError> {
    controller_root_from(Path::new(PROC_MOUNTINFO), controller)
}

pub fn controller_root_from(
    mountinfo: &Path,
    controller: &str,
) -> Result<PathBuf, ContainerError> {
    let file = std::fs::File::open(mountinfo)?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let cols: Vec<&str> = line.split(' ').collect();
        if cols.len() < MOUNTINFO_MIN_COLS {
            return Err(ContainerError::parse(format!(
                "mountinfo record has fewer than {MOUNTINFO_MIN_COLS} columns"
            )));
        }
        if cols[cols.len() - MOUNTINFO_FSTYPE_FROM_END] != "cgroup" {
            continue;
        }
        let options = cols[cols.len() - 1];
        if options.split(',').any(|opt| opt == controller) {
            return Ok(PathBuf::from(cols[MOUNTINFO_MOUNT_POINT]));
        }
    }
    Err(ContainerError::NoCgroupController(controller.to_string()))
}

/// Expand a runtime `cgroupsPath` into the path below the controller root.
///
/// Two formats exist: cgroupfs paths come through absolute and are used
/// as-is; systemd paths are `slice:prefix:name` triples where the slice
/// nests by dash (`a-b.slice` lives at `/a.slice/a-b.slice`).
pub fn to_hierarchy(cgroups_path: &str) -> Result<String, ContainerError> {
    if cgroups_path.starts_with('/') {
        return Ok(cgroups_path.to_string());
    }
    if cgroups_path.contains(':') {
        return parse_systemd_cgroup(cgroups_path)
            .ok_or_else(|| ContainerError::parse(format!("bad systemd cgroup {cgroups_path:?}")));
    }
    Err(ContainerError::UnknownCgroupsPathType(
        cgroups_path.to_string(),
    ))
}

fn parse_systemd_cgroup(cgroup: &str) -> Option<String> {
    let parts: Vec<&str> = cgroup.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let slice = parse_slice(parts[0])?;
    let unit = unit_name(parts[1], parts[2]);
    if slice.ends_with('/') {
        Some(format!("{slice}{unit}"))
    } else {
        Some(format!("{slice}/{unit}"))
    }
}

fn parse_slice(slice: &str) -> Option<String> {
    if slice.is_empty() {
        return Some(format!("/{DEFAULT_SLICE}"));
    }
    if slice.len() < SLICE_SUFFIX.len() || !slice.ends_with(SLICE_SUFFIX) || slice.contains('/') {
        return None;
    }
    let main = slice.trim_end_matches(SLICE_SUFFIX);
    if main == "-" {
        return Some("/".to_string());
    }
    let mut out = String::new();
    let mut prefix = String::new();
    for part in main.split('-') {
        if part.is_empty() {
            return None;
        }
        out.push('/');
        out.push_str(&prefix);
        out.push_str(part);
        out.push_str(SLICE_SUFFIX);
        prefix.push_str(part);
        prefix.push('-');
    }
    Some(out)
}

fn unit_name(prefix: &str, name: &str) -> String {
    if name.ends_with(SLICE_SUFFIX) {
        name.to_string()
    } else if name.ends_with(SCOPE_SUFFIX) {
        format!("{prefix}-{name}")
    } else {
        format!("{prefix}-{name}{SCOPE_SUFFIX}")
    }
}

/// The set of char-device majors the NPU driver registered, discovered from
/// /proc/devices.
#[derive(Clone, Debug, Default)]
pub struct NpuMajors {
    majors: HashSet<String>,
}

impl NpuMajors {
    pub fn probe() -> Result<Self, ContainerError> {
        Self::probe_from(Path::new(PROC_DEVICES), &NPU_MAJOR_PATTERN)
    }

    pub fn probe_from(path: &Path, pattern: &Regex) -> Result<Self, ContainerError> {
        const MAX_SEARCH_LINES: usize = 512;
        let file = std::fs::File::open(path)?;
        let mut majors = HashSet::new();
        for line in BufReader::new(file).lines().take(MAX_SEARCH_LINES) {
            let line = line?;
            let line = line.trim();
            if !pattern.is_match(line) {
                continue;
            }
            let major = line
                .split_whitespace()
                .next()
                .ok_or_else(|| ContainerError::parse(format!("bad devices line {line:?}")))?;
            majors.insert(major.to_string());
        }
        Ok(NpuMajors { majors })
    }

    pub fn from_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        NpuMajors {
            majors: ids.into_iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.majors.is_empty()
    }

    pub fn contains(&self, major: &str) -> bool {
        self.majors.contains(major)
    }
}

/// Minors of NPU char devices granted to the cgroup owning `devices_list`,
/// in file order, plus whether any were present. A missing file means the
/// hierarchy does not exist, which callers treat as "no devices here".
pub fn scan_devices_list(
    devices_list: &Path,
    majors: &NpuMajors,
) -> Result<(Vec<i64>, bool), ContainerError> {
    if majors.is_empty() {
        return Err(ContainerError::parse("no NPU major ids discovered"));
    }
    let file = match std::fs::File::open(devices_list) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ContainerError::NoCgroupHierarchy)
        }
        Err(e) => return Err(e.into()),
    };

    let mut minors = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(ContainerError::parse(format!(
                "cgroup entry {line:?} must have three fields"
            )));
        }
        let id: Vec<&str> = fields[1].split(':').collect();
        if id.len() != 2 {
            return Err(ContainerError::parse(format!(
                "cgroup entry {line:?} should have one colon in its device id"
            )));
        }
        if fields[0] != "c" || !majors.contains(id[0]) {
            continue;
        }
        if id[1] == "*" {
            // wildcard grant, counted as no explicit NPU assignment
            return Ok((Vec::new(), false));
        }
        let minor: i64 = id[1]
            .parse()
            .map_err(|_| ContainerError::parse(format!("minor in {line:?} is not an integer")))?;
        if minor < ascend_core::MAX_NPU_MINOR {
            minors.push(minor);
        }
    }
    let has_npu = !minors.is_empty();
    Ok((minors, has_npu))
}
