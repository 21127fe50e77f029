// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! The container-device parser: walks every running container concurrently,
//! recovers the NPU minors visible to it, and publishes a
//! `containerId -> {displayName, chipIds}` map.
//!
//! Workers report on a single typed stream; a collector counts outstanding
//! workers down to zero or stops at the deadline. One failing container
//! never blocks the others.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

use crate::cgroup::{self, NpuMajors, DEVICES_CONTROLLER, DEVICES_LIST};
use crate::error::ContainerError;
use crate::runtime::{ContainerInfo, NameStyle, OciView, RuntimeOperator, RuntimeOpts};

const LABEL_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
const LABEL_POD_NAME: &str = "io.kubernetes.pod.name";
const LABEL_CONTAINER_NAME: &str = "io.kubernetes.container.name";

/// Env var the Ascend container runtime injects with the granted minors.
const ASCEND_VISIBLE_DEVICES: &str = "ASCEND_VISIBLE_DEVICES";

const MAX_CONTAINERS: usize = 1024;

/// Floor for the per-cycle deadline; a very short scrape interval must not
/// starve the runtime walk.
pub const MIN_PARSE_TIMEOUT: Duration = Duration::from_secs(3);

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+[a-z0-9-.]*[a-z0-9]+$").expect("static pattern"));

const MIN_DNS_LEN: usize = 2;
const MAX_DNS_LEN: usize = 63;

pub fn valid_dns_label(value: &str) -> bool {
    value.len() >= MIN_DNS_LEN && value.len() <= MAX_DNS_LEN && DNS_LABEL.is_match(value)
}

/// Devices held by one container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevicesInfo {
    pub id: String,
    pub name: String,
    pub devices: Vec<i64>,
}

pub type DevicesInfos = HashMap<String, DevicesInfo>;

enum WorkerReport {
    Devices(DevicesInfo),
    Empty,
    Failed(ContainerError),
}

pub struct DevicesParser {
    runtime: Arc<RuntimeOperator>,
    majors: Arc<NpuMajors>,
    name_style: NameStyle,
    devices_root: Arc<PathBuf>,
    pub timeout: Duration,
    result_tx: mpsc::Sender<DevicesInfos>,
    result_rx: Mutex<mpsc::Receiver<DevicesInfos>>,
    err_tx: mpsc::Sender<ContainerError>,
    err_rx: Mutex<mpsc::Receiver<ContainerError>>,
}

impl DevicesParser {
    /// Connect to the configured runtime and resolve host-side state (NPU
    /// majors, devices-controller mount) once.
    pub async fn connect(opts: &RuntimeOpts, timeout: Duration) -> Result<Self, ContainerError> {
        let runtime = RuntimeOperator::connect(opts).await?;
        let majors = NpuMajors::probe().unwrap_or_else(|err| {
            tracing::warn!(%err, "NPU major discovery failed, container correlation disabled");
            NpuMajors::default()
        });
        let devices_root = cgroup::controller_root(DEVICES_CONTROLLER).unwrap_or_else(|err| {
            tracing::warn!(%err, "devices controller root not found");
            PathBuf::new()
        });
        let (result_tx, result_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(4);
        Ok(DevicesParser {
            runtime: Arc::new(runtime),
            majors: Arc::new(majors),
            name_style: opts.name_style(),
            devices_root: Arc::new(devices_root),
            timeout: timeout.max(MIN_PARSE_TIMEOUT),
            result_tx,
            result_rx: Mutex::new(result_rx),
            err_tx,
            err_rx: Mutex::new(err_rx),
        })
    }

    /// Kick off one asynchronous parse cycle. Results and errors surface on
    /// the cached channels.
    pub fn fetch_and_parse(&self) {
        let runtime = Arc::clone(&self.runtime);
        let majors = Arc::clone(&self.majors);
        let devices_root = Arc::clone(&self.devices_root);
        let style = self.name_style;
        let timeout = self.timeout;
        let result_tx = self.result_tx.clone();
        let err_tx = self.err_tx.clone();
        tokio::spawn(async move {
            do_parse(
                runtime,
                majors,
                devices_root,
                style,
                timeout,
                result_tx,
                err_tx,
            )
            .await;
        });
    }

    /// Non-blocking poll of the most recent parse result.
    pub fn try_recv_result(&self) -> Option<DevicesInfos> {
        lock(&self.result_rx).try_recv().ok()
    }

    /// Non-blocking poll of pending worker errors.
    pub fn try_recv_err(&self) -> Option<ContainerError> {
        lock(&self.err_rx).try_recv().ok()
    }

    /// Wait for a result up to `window`, polling the cached channel. Used by
    /// the one-shot scrape refresh; an expired window yields `None`.
    pub fn recv_result_blocking(&self, window: Duration) -> Option<DevicesInfos> {
        let deadline = Instant::now() + window;
        loop {
            if let Some(result) = self.try_recv_result() {
                return Some(result);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn do_parse(
    runtime: Arc<RuntimeOperator>,
    majors: Arc<NpuMajors>,
    devices_root: Arc<PathBuf>,
    style: NameStyle,
    timeout: Duration,
    result_tx: mpsc::Sender<DevicesInfos>,
    err_tx: mpsc::Sender<ContainerError>,
) {
    let containers = match runtime.list_containers().await {
        Ok(containers) => containers,
        Err(err) => {
            let _ = err_tx.try_send(err);
            return;
        }
    };
    if containers.is_empty() {
        let _ = result_tx.try_send(DevicesInfos::new());
        return;
    }
    if containers.len() > MAX_CONTAINERS {
        let _ = err_tx.try_send(ContainerError::runtime(format!(
            "{} containers exceed the supported maximum",
            containers.len()
        )));
        return;
    }

    let mut outstanding = containers.len();
    let (tx, mut rx) = mpsc::channel(outstanding);
    for container in containers {
        let runtime = Arc::clone(&runtime);
        let majors = Arc::clone(&majors);
        let devices_root = Arc::clone(&devices_root);
        let tx = tx.clone();
        tokio::spawn(async move {
            let report = match tokio::time::timeout(
                timeout,
                parse_one(&runtime, &majors, &devices_root, &container, style),
            )
            .await
            {
                Ok(report) => report,
                Err(_) => WorkerReport::Failed(ContainerError::Deadline),
            };
            let _ = tx.send(report).await;
        });
    }
    drop(tx);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut results = DevicesInfos::new();
    while outstanding > 0 {
        let report = tokio::select! {
            report = rx.recv() => report,
            _ = tokio::time::sleep_until(deadline) => {
                let _ = err_tx.try_send(ContainerError::Deadline);
                return;
            }
        };
        let Some(report) = report else { break };
        outstanding -= 1;
        match report {
            WorkerReport::Devices(info) => {
                results.insert(info.id.clone(), info);
            }
            WorkerReport::Empty => {}
            WorkerReport::Failed(err) => {
                let _ = err_tx.try_send(err);
            }
        }
    }
    let _ = result_tx.try_send(results);
}

async fn parse_one(
    runtime: &RuntimeOperator,
    majors: &NpuMajors,
    devices_root: &Path,
    container: &ContainerInfo,
    style: NameStyle,
) -> WorkerReport {
    if majors.is_empty() {
        return WorkerReport::Empty;
    }
    let view = match runtime.oci_view(&container.id).await {
        Ok(view) => view,
        Err(err) => {
            return WorkerReport::Failed(ContainerError::runtime(format!(
                "reading spec of container {} failed: {err}",
                container.id
            )))
        }
    };
    let (minors, has_npu) = match devices_from_view(&view, majors, devices_root) {
        Ok(found) => found,
        Err(err) => return WorkerReport::Failed(err),
    };
    if !has_npu {
        return WorkerReport::Empty;
    }
    match compose_name(container, style) {
        Ok(name) => WorkerReport::Devices(DevicesInfo {
            id: container.id.clone(),
            name,
            devices: minors,
        }),
        Err(err) => WorkerReport::Failed(err),
    }
}

/// Recover the NPU minors a container holds. The injected
/// `ASCEND_VISIBLE_DEVICES` env wins when present; otherwise the cgroup-v1
/// `devices.list` is scanned, and on hosts without that hierarchy the OCI
/// spec's device allow-list is filtered instead.
pub fn devices_from_view(
    view: &OciView,
    majors: &NpuMajors,
    devices_root: &Path,
) -> Result<(Vec<i64>, bool), ContainerError> {
    if let Some(minors) = minors_from_env(&view.env) {
        let has = !minors.is_empty();
        return Ok((minors, has));
    }

    let hierarchy = cgroup::to_hierarchy(&view.cgroups_path)?;
    let devices_list = devices_root
        .join(hierarchy.trim_start_matches('/'))
        .join(DEVICES_LIST);
    match cgroup::scan_devices_list(&devices_list, majors) {
        Ok(found) => Ok(found),
        Err(ContainerError::NoCgroupHierarchy) => Ok(minors_from_spec(view, majors)),
        Err(err) => Err(err),
    }
}

fn minors_from_env(env: &[String]) -> Option<Vec<i64>> {
    let value = env
        .iter()
        .find_map(|e| e.strip_prefix(ASCEND_VISIBLE_DEVICES)?.strip_prefix('='))?;
    let mut minors = Vec::new();
    for part in value.split(',') {
        match part.trim().parse::<i64>() {
            Ok(id) if (0..ascend_core::MAX_NPU_MINOR).contains(&id) => minors.push(id),
            _ => {
                tracing::warn!(part, "invalid entry in {ASCEND_VISIBLE_DEVICES}");
            }
        }
    }
    Some(minors)
}

fn minors_from_spec(view: &OciView, majors: &NpuMajors) -> (Vec<i64>, bool) {
    if view.privileged {
        // privileged containers see every device; that is not an assignment
        return (Vec::new(), false);
    }
    let minors: Vec<i64> = view
        .devices
        .iter()
        .filter(|d| d.dev_type == "c" && majors.contains(&d.major.to_string()))
        .filter(|d| (0..ascend_core::MAX_NPU_MINOR).contains(&d.minor))
        .map(|d| d.minor)
        .collect();
    let has = !minors.is_empty();
    (minors, has)
}

/// Compose the display name for one container according to the configured
/// style. Kubernetes labels must be DNS-shaped before they are embedded.
pub fn compose_name(
    container: &ContainerInfo,
    style: NameStyle,
) -> Result<String, ContainerError> {
    match style {
        NameStyle::Plain => {
            if container.name.is_empty() {
                Err(ContainerError::InvalidLabel {
                    container: container.id.clone(),
                    detail: "container has no name".to_string(),
                })
            } else {
                Ok(container.name.clone())
            }
        }
        NameStyle::K8s => {
            let namespace = container.labels.get(LABEL_POD_NAMESPACE);
            let pod = container.labels.get(LABEL_POD_NAME);
            let name = container
                .labels
                .get(LABEL_CONTAINER_NAME)
                .cloned()
                .unwrap_or_else(|| container.name.clone());
            let (Some(namespace), Some(pod)) = (namespace, pod) else {
                return Err(ContainerError::InvalidLabel {
                    container: container.id.clone(),
                    detail: "missing pod labels".to_string(),
                });
            };
            for value in [namespace.as_str(), pod.as_str(), name.as_str()] {
                if !valid_dns_label(value) {
                    return Err(ContainerError::InvalidLabel {
                        container: container.id.clone(),
                        detail: format!("{value:?} is not a DNS label"),
                    });
                }
            }
            Ok(format!("{namespace}_{pod}_{name}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::OciDevice;
    use std::io::Write;

    fn k8s_container() -> ContainerInfo {
        ContainerInfo {
            id: "c1".to_string(),
            name: "m".to_string(),
            labels: HashMap::from([
                (LABEL_POD_NAMESPACE.to_string(), "ns".to_string()),
                (LABEL_POD_NAME.to_string(), "p0".to_string()),
                (LABEL_CONTAINER_NAME.to_string(), "main".to_string()),
            ]),
        }
    }

    #[test]
    fn dns_label_validation() {
        assert!(valid_dns_label("ns"));
        assert!(valid_dns_label("my-pod.v2"));
        assert!(!valid_dns_label("a"));
        assert!(!valid_dns_label("UPPER"));
        assert!(!valid_dns_label("-leading"));
        assert!(!valid_dns_label(&"x".repeat(64)));
    }

    #[test]
    fn k8s_name_is_namespace_pod_container() {
        let name = compose_name(&k8s_container(), NameStyle::K8s).unwrap();
        assert_eq!(name, "ns_p0_main");
    }

    #[test]
    fn k8s_name_rejects_bad_labels() {
        let mut container = k8s_container();
        container
            .labels
            .insert(LABEL_POD_NAMESPACE.to_string(), "Not Valid".to_string());
        assert!(compose_name(&container, NameStyle::K8s).is_err());
        container.labels.remove(LABEL_POD_NAMESPACE);
        assert!(compose_name(&container, NameStyle::K8s).is_err());
    }

    #[test]
    fn plain_name_is_container_name() {
        let container = ContainerInfo {
            id: "c2".to_string(),
            name: "train-0".to_string(),
            labels: HashMap::new(),
        };
        assert_eq!(
            compose_name(&container, NameStyle::Plain).unwrap(),
            "train-0"
        );
    }

    #[test]
    fn env_override_wins() {
        let view = OciView {
            cgroups_path: "/ignored".to_string(),
            env: vec!["ASCEND_VISIBLE_DEVICES=1,3,bogus,900".to_string()],
            devices: Vec::new(),
            privileged: false,
        };
        let majors = NpuMajors::from_ids([239]);
        let (minors, has) = devices_from_view(&view, &majors, Path::new("/nonexistent")).unwrap();
        assert!(has);
        assert_eq!(minors, vec![1, 3]);
    }

    #[test]
    fn devices_list_scan_with_real_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("kubepods/pod1/c1");
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join(DEVICES_LIST)).unwrap();
        writeln!(f, "c 239:3 rwm").unwrap();
        let view = OciView {
            cgroups_path: "/kubepods/pod1/c1".to_string(),
            ..OciView::default()
        };
        let majors = NpuMajors::from_ids([239]);
        let (minors, has) = devices_from_view(&view, &majors, root.path()).unwrap();
        assert!(has);
        assert_eq!(minors, vec![3]);
    }

    #[test]
    fn missing_hierarchy_falls_back_to_spec_devices() {
        let root = tempfile::tempdir().unwrap();
        let view = OciView {
            cgroups_path: "/kubepods/gone".to_string(),
            env: Vec::new(),
            devices: vec![
                OciDevice {
                    dev_type: "c".to_string(),
                    major: 239,
                    minor: 2,
                },
                OciDevice {
                    dev_type: "b".to_string(),
                    major: 239,
                    minor: 7,
                },
                OciDevice {
                    dev_type: "c".to_string(),
                    major: 1,
                    minor: 9,
                },
            ],
            privileged: false,
        };
        let majors = NpuMajors::from_ids([239]);
        let (minors, has) = devices_from_view(&view, &majors, root.path()).unwrap();
        assert!(has);
        assert_eq!(minors, vec![2]);
    }

    #[test]
    fn privileged_containers_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let view = OciView {
            cgroups_path: "/kubepods/gone".to_string(),
            env: Vec::new(),
            devices: vec![OciDevice {
                dev_type: "c".to_string(),
                major: 239,
                minor: 2,
            }],
            privileged: true,
        };
        let majors = NpuMajors::from_ids([239]);
        let (minors, has) = devices_from_view(&view, &majors, root.path()).unwrap();
        assert!(!has);
        assert!(minors.is_empty());
    }
}
