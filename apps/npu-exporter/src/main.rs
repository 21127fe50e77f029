// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus exporter for Huawei Ascend NPUs.
//!
//! Wires the pieces together: the DCMI device manager, the container-device
//! parser, the collection loop, and the hardened HTTP front. Everything that
//! can be validated before touching the driver or a socket is validated
//! first; any failure there exits non-zero.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus::core::Collector;
use prometheus::Registry;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use ascend_cache::ShardedCache;
use ascend_container::DevicesParser;
use ascend_smi::{DcmiLibrary, DeviceInterface, DeviceManager};

mod collector;
mod config;
mod limiter;
mod log_limiter;
mod metrics;
mod server;
mod tlsconf;
mod types;

use crate::collector::NpuCollector;
use crate::config::{Args, ConfigError};
use crate::limiter::{Admission, IpRate};
use crate::log_limiter::{LimitedWriter, LogLimiter};
use crate::server::{AppState, ConnLimits};
use crate::tlsconf::{RevocationState, SuiteChoice, TlsError, TlsGate, TlsPaths};

#[derive(Error, Debug)]
enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device manager init failed: {0}")]
    Device(#[from] ascend_smi::DeviceError),

    #[error("container runtime connection failed: {0}")]
    Container(#[from] ascend_container::ContainerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("metric registration failed: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("log file setup failed: {0}")]
    Log(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();
    let rate = match args.validate() {
        Ok(rate) => rate,
        Err(err) => {
            eprintln!("npu-exporter: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_logging(&args) {
        eprintln!("npu-exporter: {err}");
        return ExitCode::FAILURE;
    }
    match run(args, rate) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "fatal init error");
            eprintln!("npu-exporter: {err}");
            ExitCode::FAILURE
        }
    }
}

/// File-only logging through the dedup limiter; duplicate diagnostics from
/// a flapping driver call collapse to one line per window.
fn init_logging(args: &Args) -> Result<(), InitError> {
    let directory = args
        .log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let filename = args
        .log_file
        .file_name()
        .ok_or_else(|| InitError::Log(format!("{:?} has no file name", args.log_file)))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(args.log_max_backups as usize)
        .filename_prefix(filename.to_string_lossy())
        .build(directory)
        .map_err(|e| InitError::Log(e.to_string()))?;
    let limiter = Arc::new(LogLimiter::new(
        appender,
        args.log_dedup_cache,
        args.log_dedup_expiry,
    ));
    tracing_subscriber::fmt()
        .with_max_level(args.tracing_level())
        .with_ansi(false)
        .with_writer(LimitedWriter(limiter))
        .init();
    Ok(())
}

/// Registry adapter: the collection loop owns the collector, the registry
/// only borrows it for scrapes.
struct SharedCollector(Arc<NpuCollector>);

impl Collector for SharedCollector {
    fn desc(&self) -> Vec<&prometheus::core::Desc> {
        self.0.desc()
    }

    fn collect(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.0.collect()
    }
}

#[tokio::main]
async fn run(args: Args, rate: IpRate) -> Result<(), InitError> {
    let library = DcmiLibrary::open()?;
    let device: Arc<dyn DeviceInterface> =
        Arc::new(DeviceManager::auto_init(Arc::new(library))?);

    let update_interval = Duration::from_secs(args.update_time);
    let parser = Arc::new(DevicesParser::connect(&args.runtime_opts(), update_interval).await?);

    let collector = Arc::new(NpuCollector::new(device, parser, update_interval));
    let registry = Registry::new();
    registry.register(Box::new(SharedCollector(Arc::clone(&collector))))?;

    // request marks and connection counts share one cache under distinct
    // key prefixes
    let admission_cache = Arc::new(ShardedCache::new(args.cache_size));
    let admission = Arc::new(Admission::new(
        args.concurrency,
        rate,
        Arc::clone(&admission_cache),
        Some(axum::http::Method::GET),
        true,
    ));
    let limits = ConnLimits::new(args.limit_total_conn, args.limit_ip_conn, admission_cache);

    let (tls, revocation, cert_status) = if args.enable_http {
        tracing::warn!("serving plain http, certificate checks disabled");
        let revocation = Arc::new(RevocationState {
            revoked: Arc::new(HashSet::new()),
        });
        (None, revocation, Arc::new(BTreeMap::new()))
    } else {
        let paths = tls_paths(&args)?;
        let suite = SuiteChoice::from_flag(args.tls_suites).ok_or(ConfigError::TlsSuites)?;
        let gate = Arc::new(TlsGate::build(&paths, suite, args.overdue_days)?);
        let revocation = Arc::new(RevocationState {
            revoked: gate.revoked(),
        });
        let status = Arc::new(gate.cert_status().clone());
        tracing::info!(mutual = gate.is_mutual(), "tls listener configured");
        (Some(gate), revocation, status)
    };

    let state = AppState {
        registry,
        cert_status,
        port: args.port,
    };
    let router = server::build_router(state, admission, revocation);

    let ip = args.ip.parse().map_err(|_| ConfigError::Ip)?;
    let listener = TcpListener::bind(SocketAddr::new(ip, args.port)).await?;
    tracing::info!(ip = %args.ip, port = args.port, version = collector::VERSION, "npu-exporter started");

    let shutdown = Arc::new(Notify::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let collection = tokio::spawn(Arc::clone(&collector).run(Arc::clone(&shutdown)));
    let serving = tokio::spawn(server::serve(listener, router, limits, tls, stop_rx));

    wait_for_signal().await?;
    shutdown.notify_one();
    let _ = stop_tx.send(true);
    if let Err(err) = collection.await {
        tracing::error!(%err, "collection task ended abnormally");
    }
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(%err, "listener ended abnormally"),
        Err(err) => tracing::error!(%err, "serve task ended abnormally"),
    }
    tracing::info!("npu-exporter stopped");
    Ok(())
}

fn tls_paths(args: &Args) -> Result<TlsPaths, InitError> {
    let (Some(cert), Some(key)) = (&args.cert_file, &args.key_file) else {
        return Err(ConfigError::MissingCert.into());
    };
    Ok(TlsPaths {
        cert: cert.clone(),
        key: key.clone(),
        ca: args.ca_file.clone(),
        crl: args.crl_file.clone(),
    })
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = interrupt.recv() => tracing::warn!("SIGINT received"),
        _ = terminate.recv() => tracing::warn!("SIGTERM received"),
        _ = hangup.recv() => tracing::warn!("SIGHUP received"),
        _ = quit.recv() => tracing::warn!("SIGQUIT received"),
    }
    Ok(())
}
