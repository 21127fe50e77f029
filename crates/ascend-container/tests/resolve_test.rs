// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end resolution from a container's runtime view down to its NPU
//! minors, against a synthetic cgroup tree on disk.
//!
//! These tests verify:
//! - The cgroupfs and systemd cgroupsPath formats both resolve to the
//!   devices.list that was planted for them
//! - The composed Kubernetes display name joins validated labels
//! - Probing the NPU majors against the real /proc/devices (driver hosts
//!   only, ignored by default)

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use ascend_container::cgroup::{self, NpuMajors, DEVICES_LIST};
use ascend_container::parser::{compose_name, devices_from_view};
use ascend_container::runtime::{ContainerInfo, NameStyle, OciView};

fn plant_devices_list(root: &Path, hierarchy: &str, lines: &[&str]) {
    let dir = root.join(hierarchy.trim_start_matches('/'));
    std::fs::create_dir_all(&dir).unwrap();
    let mut file = std::fs::File::create(dir.join(DEVICES_LIST)).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

#[test]
fn cgroupfs_container_resolves_to_its_minors() {
    let root = tempfile::tempdir().unwrap();
    plant_devices_list(
        root.path(),
        "/kubepods/besteffort/pod9/c1",
        &["c 1:3 rwm", "c 239:3 rwm", "c 239:7 rwm"],
    );
    let view = OciView {
        cgroups_path: "/kubepods/besteffort/pod9/c1".to_string(),
        ..OciView::default()
    };
    let majors = NpuMajors::from_ids([239]);
    let (minors, has) = devices_from_view(&view, &majors, root.path()).unwrap();
    assert!(has);
    assert_eq!(minors, vec![3, 7]);
}

#[test]
fn systemd_container_resolves_through_the_expanded_slice() {
    let root = tempfile::tempdir().unwrap();
    let hierarchy = cgroup::to_hierarchy(
        "kubepods-burstable-pod123.slice:cri-containerd:abc.scope",
    )
    .unwrap();
    assert_eq!(
        hierarchy,
        "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod123.slice/cri-containerd-abc.scope"
    );
    plant_devices_list(root.path(), &hierarchy, &["c 239:0 rwm"]);
    let view = OciView {
        cgroups_path: "kubepods-burstable-pod123.slice:cri-containerd:abc.scope".to_string(),
        ..OciView::default()
    };
    let majors = NpuMajors::from_ids([239]);
    let (minors, has) = devices_from_view(&view, &majors, root.path()).unwrap();
    assert!(has);
    assert_eq!(minors, vec![0]);
}

#[test]
fn container_without_npu_grants_is_empty() {
    let root = tempfile::tempdir().unwrap();
    plant_devices_list(root.path(), "/docker/c9", &["c 1:3 rwm", "b 8:0 rwm"]);
    let view = OciView {
        cgroups_path: "/docker/c9".to_string(),
        ..OciView::default()
    };
    let majors = NpuMajors::from_ids([239]);
    let (minors, has) = devices_from_view(&view, &majors, root.path()).unwrap();
    assert!(!has);
    assert!(minors.is_empty());
}

#[test]
fn k8s_display_name_joins_validated_labels() {
    let container = ContainerInfo {
        id: "c1".to_string(),
        name: "m".to_string(),
        labels: HashMap::from([
            ("io.kubernetes.pod.namespace".to_string(), "ns".to_string()),
            ("io.kubernetes.pod.name".to_string(), "p0".to_string()),
            ("io.kubernetes.container.name".to_string(), "m0".to_string()),
        ]),
    };
    assert_eq!(compose_name(&container, NameStyle::K8s).unwrap(), "ns_p0_m0");
}

#[test]
#[ignore = "Requires the Ascend driver to have registered its char devices"]
fn probe_finds_majors_on_a_driver_host() {
    let majors = NpuMajors::probe().unwrap();
    assert!(!majors.is_empty(), "no devdrv-cdev entry in /proc/devices");
}
