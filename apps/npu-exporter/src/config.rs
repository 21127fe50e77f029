// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Command line surface and startup validation. Anything out of range here
//! is a fatal init error; the process exits non-zero before any socket is
//! bound or the driver is touched.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use ascend_container::{EndpointType, RuntimeOpts, UNIX_PREFIX};

use crate::limiter::IpRate;

pub const DEFAULT_LOG_FILE: &str = "/var/log/mindx-dl/npu-exporter/npu-exporter.log";

const DEFAULT_DOCKER_ENDPOINT: &str = "unix:///var/run/docker.sock";
const DEFAULT_CONTAINERD_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("the port is invalid")]
    Port,
    #[error("the listen ip is invalid")]
    Ip,
    #[error("the update time is invalid")]
    UpdateTime,
    #[error("the tls suite selection is invalid")]
    TlsSuites,
    #[error("the encrypt algorithm is invalid")]
    EncryptAlgorithm,
    #[error("invalid container mode {0:?}")]
    ContainerMode(String),
    #[error("{0} must be a unix:// socket address")]
    Endpoint(&'static str),
    #[error("concurrency range error")]
    Concurrency,
    #[error("limit-ip-req format error: {0}")]
    IpReq(String),
    #[error("limit-ip-conn range error")]
    IpConn,
    #[error("limit-total-conn range error")]
    TotalConn,
    #[error("cache size range error")]
    CacheSize,
    #[error("log level range error")]
    LogLevel,
    #[error("log max-age range error")]
    LogMaxAge,
    #[error("log max-backups range error")]
    LogMaxBackups,
    #[error("https is enabled but certificate material is missing")]
    MissingCert,
}

/// Prometheus exporter for Huawei Ascend NPUs.
#[derive(Parser, Debug, Clone)]
#[command(name = "npu-exporter", version, about)]
pub struct Args {
    /// The server port of the http service, range [1025, 40000]
    #[arg(long, default_value_t = 8082)]
    pub port: u16,

    /// The listen ip of the service; 0.0.0.0 is not recommended on
    /// multi-NIC hosts
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: String,

    /// Interval (seconds) to update the npu metrics cache, range [1, 60]
    #[arg(long = "update-time", default_value_t = 5)]
    pub update_time: u64,

    /// If true, serve plain http and skip certificate checks
    #[arg(long = "enable-http", default_value_t = false)]
    pub enable_http: bool,

    /// Cipher suite selection: 0 for AES128-GCM, 1 for AES256-GCM
    #[arg(long = "tls-suites", default_value_t = 0)]
    pub tls_suites: u8,

    /// Key-at-rest algorithm used by the importer: 8 for AES128-GCM,
    /// 9 for AES256-GCM
    #[arg(long = "encrypt-algorithm", default_value_t = 9)]
    pub encrypt_algorithm: u8,

    /// 'docker' to monitor docker containers, 'containerd' for CRI +
    /// containerd
    #[arg(long = "container-mode", default_value = "docker")]
    pub container_mode: String,

    /// The containerd endpoint used for reading container specs
    #[arg(long, default_value = "")]
    pub containerd: String,

    /// The endpoint of the CRI server to connect to
    #[arg(long, default_value = "")]
    pub endpoint: String,

    /// Max concurrent http requests, range [1, 50]
    #[arg(long, default_value_t = 5)]
    pub concurrency: usize,

    /// Request allowance per client ip, as burst/seconds
    #[arg(long = "limit-ip-req", default_value = "20/1")]
    pub limit_ip_req: String,

    /// Tcp connection limit per client ip, range [1, 128]
    #[arg(long = "limit-ip-conn", default_value_t = 5)]
    pub limit_ip_conn: i64,

    /// Tcp connection limit for the whole listener, range [1, 512]
    #[arg(long = "limit-total-conn", default_value_t = 20)]
    pub limit_total_conn: usize,

    /// Entry budget for the admission caches, range [1, 1024000]
    #[arg(long = "cache-size", default_value_t = 102_400)]
    pub cache_size: usize,

    /// Server certificate (PEM)
    #[arg(long = "cert-file")]
    pub cert_file: Option<PathBuf>,

    /// Server private key (PEM); the importer decrypts it at provisioning
    #[arg(long = "key-file")]
    pub key_file: Option<PathBuf>,

    /// Client CA bundle (PEM); enables mutual TLS when set
    #[arg(long = "ca-file")]
    pub ca_file: Option<PathBuf>,

    /// Offline CRL (PEM or DER)
    #[arg(long = "crl-file")]
    pub crl_file: Option<PathBuf>,

    /// Days before notAfter at which /v1/certstatus reports overdue
    #[arg(long = "overdue-days", default_value_t = 100)]
    pub overdue_days: i32,

    /// Log level: -1 debug, 0 info, 1 warning, 2 error, 3 critical
    #[arg(long = "log-level", default_value_t = 0)]
    pub log_level: i8,

    /// Days to keep rotated log files, range [7, 700]
    #[arg(long = "log-max-age", default_value_t = 7)]
    pub log_max_age: u32,

    /// Number of rotated log files to keep, range [1, 30]
    #[arg(long = "log-max-backups", default_value_t = 30)]
    pub log_max_backups: u32,

    /// Log file path
    #[arg(long = "log-file", default_value = DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,

    /// Seconds a duplicate log line is suppressed; 0 disables
    #[arg(long = "log-dedup-expiry", default_value_t = 1)]
    pub log_dedup_expiry: u64,

    /// Entry budget for the log dedup cache, range [0, 102400]; 0 disables
    #[arg(long = "log-dedup-cache", default_value_t = 10_240)]
    pub log_dedup_cache: usize,
}

impl Args {
    pub fn validate(&self) -> Result<IpRate, ConfigError> {
        if self.port < 1025 || self.port > 40_000 {
            return Err(ConfigError::Port);
        }
        self.ip.parse::<IpAddr>().map_err(|_| ConfigError::Ip)?;
        if self.update_time < 1 || self.update_time > 60 {
            return Err(ConfigError::UpdateTime);
        }
        if self.tls_suites > 1 {
            return Err(ConfigError::TlsSuites);
        }
        if self.encrypt_algorithm != 8 && self.encrypt_algorithm != 9 {
            return Err(ConfigError::EncryptAlgorithm);
        }
        match self.container_mode.as_str() {
            "docker" | "containerd" => {}
            other => return Err(ConfigError::ContainerMode(other.to_string())),
        }
        for (name, value) in [("endpoint", &self.endpoint), ("containerd", &self.containerd)] {
            if !value.is_empty() && !value.starts_with(UNIX_PREFIX) {
                return Err(ConfigError::Endpoint(match name {
                    "endpoint" => "endpoint",
                    _ => "containerd",
                }));
            }
        }
        if self.concurrency < 1 || self.concurrency > 50 {
            return Err(ConfigError::Concurrency);
        }
        let rate: IpRate = self
            .limit_ip_req
            .parse()
            .map_err(ConfigError::IpReq)?;
        if self.limit_ip_conn < 1 || self.limit_ip_conn > 128 {
            return Err(ConfigError::IpConn);
        }
        if self.limit_total_conn < 1 || self.limit_total_conn > 512 {
            return Err(ConfigError::TotalConn);
        }
        if self.cache_size < 1 || self.cache_size > 1_024_000 {
            return Err(ConfigError::CacheSize);
        }
        if self.log_level < -1 || self.log_level > 3 {
            return Err(ConfigError::LogLevel);
        }
        if self.log_max_age < 7 || self.log_max_age > 700 {
            return Err(ConfigError::LogMaxAge);
        }
        if self.log_max_backups < 1 || self.log_max_backups > 30 {
            return Err(ConfigError::LogMaxBackups);
        }
        if !self.enable_http && (self.cert_file.is_none() || self.key_file.is_none()) {
            return Err(ConfigError::MissingCert);
        }
        Ok(rate)
    }

    /// Runtime endpoints implied by the container mode, with explicit
    /// endpoint flags overriding the defaults (and disabling the backup
    /// probing, since the operator asked for something specific).
    pub fn runtime_opts(&self) -> RuntimeOpts {
        let mut opts = match self.container_mode.as_str() {
            "containerd" => RuntimeOpts {
                endpoint_type: EndpointType::Containerd,
                cri_endpoint: DEFAULT_CONTAINERD_ENDPOINT.to_string(),
                oci_endpoint: DEFAULT_CONTAINERD_ENDPOINT.to_string(),
                use_backup: true,
            },
            _ => RuntimeOpts {
                endpoint_type: EndpointType::Docker,
                cri_endpoint: DEFAULT_DOCKER_ENDPOINT.to_string(),
                oci_endpoint: DEFAULT_DOCKER_ENDPOINT.to_string(),
                use_backup: true,
            },
        };
        if !self.containerd.is_empty() {
            opts.oci_endpoint = self.containerd.clone();
            opts.use_backup = false;
        }
        if !self.endpoint.is_empty() {
            opts.cri_endpoint = self.endpoint.clone();
            opts.use_backup = false;
        }
        opts
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level {
            -1 => tracing::Level::DEBUG,
            0 => tracing::Level::INFO,
            1 => tracing::Level::WARN,
            _ => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["npu-exporter", "--enable-http"])
    }

    #[test]
    fn defaults_validate() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn port_bounds_are_enforced() {
        let mut args = base_args();
        args.port = 1024;
        assert!(matches!(args.validate(), Err(ConfigError::Port)));
        args.port = 40_001;
        assert!(matches!(args.validate(), Err(ConfigError::Port)));
    }

    #[test]
    fn update_time_bounds_are_enforced() {
        let mut args = base_args();
        args.update_time = 0;
        assert!(matches!(args.validate(), Err(ConfigError::UpdateTime)));
        args.update_time = 61;
        assert!(matches!(args.validate(), Err(ConfigError::UpdateTime)));
        args.update_time = 60;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn concurrency_bounds_are_enforced() {
        let mut args = base_args();
        args.concurrency = 0;
        assert!(matches!(args.validate(), Err(ConfigError::Concurrency)));
        args.concurrency = 51;
        assert!(matches!(args.validate(), Err(ConfigError::Concurrency)));
    }

    #[test]
    fn endpoints_must_be_unix() {
        let mut args = base_args();
        args.endpoint = "tcp://1.2.3.4:5".to_string();
        assert!(matches!(args.validate(), Err(ConfigError::Endpoint(_))));
        args.endpoint = "unix:///run/containerd/containerd.sock".to_string();
        assert!(args.validate().is_ok());
    }

    #[test]
    fn https_requires_cert_material() {
        let mut args = base_args();
        args.enable_http = false;
        assert!(matches!(args.validate(), Err(ConfigError::MissingCert)));
        args.cert_file = Some(PathBuf::from("/tmp/cert.pem"));
        args.key_file = Some(PathBuf::from("/tmp/key.pem"));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn explicit_endpoints_disable_backup() {
        let mut args = base_args();
        args.container_mode = "containerd".to_string();
        args.endpoint = "unix:///run/other.sock".to_string();
        let opts = args.runtime_opts();
        assert_eq!(opts.cri_endpoint, "unix:///run/other.sock");
        assert!(!opts.use_backup);
        assert_eq!(opts.endpoint_type, EndpointType::Containerd);
    }

    #[test]
    fn bad_ip_rate_is_rejected() {
        let mut args = base_args();
        args.limit_ip_req = "0/0".to_string();
        assert!(matches!(args.validate(), Err(ConfigError::IpReq(_))));
    }
}
