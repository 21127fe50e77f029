// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! TLS serving config and the revocation gate.
//!
//! rustls carries the handshake; a pinned ECDHE-GCM suite on TLS 1.2 and,
//! when a CA bundle is configured, mandatory client verification. The leaf
//! is served through a hot-swappable resolver. Revocation is not part of
//! the handshake: the loaded CRL's serials are checked against the verified
//! peer chain on every request, before any handler runs.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use openssl::x509::{X509Crl, X509};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite};
use serde::Serialize;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("reading {path:?} failed: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificate found in {0:?}")]
    EmptyCert(PathBuf),

    #[error("no private key found in {0:?}")]
    EmptyKey(PathBuf),

    #[error("certificate validation failed: {0}")]
    Validate(#[from] openssl::error::ErrorStack),

    #[error("tls configuration rejected: {0}")]
    Config(#[from] rustls::Error),

    #[error("client verifier rejected: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("the server certificate key is unusable: {0}")]
    BadKey(String),
}

/// Selects the single cipher suite the listener will negotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuiteChoice {
    Aes128Gcm,
    Aes256Gcm,
}

impl SuiteChoice {
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(SuiteChoice::Aes128Gcm),
            1 => Some(SuiteChoice::Aes256Gcm),
            _ => None,
        }
    }

    fn suite(self) -> SupportedCipherSuite {
        match self {
            SuiteChoice::Aes128Gcm => {
                ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
            }
            SuiteChoice::Aes256Gcm => {
                ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: Option<PathBuf>,
    pub crl: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CertStatus {
    #[serde(rename = "notBefore")]
    pub not_before: String,
    #[serde(rename = "notAfter")]
    pub not_after: String,
    pub status: String,
}

/// Serial numbers of certificates presented on this connection, stored by
/// the accept loop for the per-request gate.
#[derive(Clone, Debug, Default)]
pub struct PeerSerials(pub Arc<Vec<Vec<u8>>>);

/// Serves the current leaf under a lock-free swap so a re-imported
/// certificate can take effect without restarting the listener.
#[derive(Debug)]
struct SwappableCert(ArcSwap<CertifiedKey>);

impl ResolvesServerCert for SwappableCert {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.load_full())
    }
}

pub struct TlsGate {
    pub acceptor: TlsAcceptor,
    leaf: Arc<SwappableCert>,
    revoked: Arc<HashSet<Vec<u8>>>,
    status: BTreeMap<String, CertStatus>,
    mutual: bool,
}

impl TlsGate {
    pub fn build(
        paths: &TlsPaths,
        suite: SuiteChoice,
        overdue_days: i32,
    ) -> Result<Self, TlsError> {
        let cert_chain = load_certs(&paths.cert)?;
        if cert_chain.is_empty() {
            return Err(TlsError::EmptyCert(paths.cert.clone()));
        }
        let key = load_key(&paths.key)?;
        let status = cert_status(&paths.cert, overdue_days)?;

        let provider = Arc::new(rustls::crypto::CryptoProvider {
            cipher_suites: vec![suite.suite()],
            ..ring::default_provider()
        });
        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| TlsError::BadKey(e.to_string()))?;
        let leaf = Arc::new(SwappableCert(ArcSwap::from_pointee(CertifiedKey::new(
            cert_chain,
            signing_key,
        ))));

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS12])?;
        let (builder, mutual) = match &paths.ca {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(TlsError::Config)?;
                }
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                        .build()?;
                (builder.with_client_cert_verifier(verifier), true)
            }
            None => (builder.with_no_client_auth(), false),
        };
        let mut config = builder.with_cert_resolver(Arc::clone(&leaf) as Arc<dyn ResolvesServerCert>);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let revoked = match &paths.crl {
            Some(crl_path) => Arc::new(load_crl_serials(crl_path)?),
            None => Arc::new(HashSet::new()),
        };
        if !revoked.is_empty() {
            tracing::info!(serials = revoked.len(), "CRL loaded");
        }

        Ok(TlsGate {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            leaf,
            revoked,
            status,
            mutual,
        })
    }

    pub fn is_mutual(&self) -> bool {
        self.mutual
    }

    pub fn cert_status(&self) -> &BTreeMap<String, CertStatus> {
        &self.status
    }

    /// Replace the served leaf, e.g. after the importer re-provisioned it.
    pub fn swap_leaf(&self, cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<(), TlsError> {
        let provider = ring::default_provider();
        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| TlsError::BadKey(e.to_string()))?;
        self.leaf
            .0
            .store(Arc::new(CertifiedKey::new(cert_chain, signing_key)));
        Ok(())
    }

    pub fn revoked(&self) -> Arc<HashSet<Vec<u8>>> {
        Arc::clone(&self.revoked)
    }

    /// True when any certificate of the presented chain is on the CRL.
    pub fn is_revoked(&self, serials: &[Vec<u8>]) -> bool {
        serials.iter().any(|s| self.revoked.contains(s))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.to_owned(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_owned(),
            source,
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.to_owned(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_owned(),
            source,
        })?
        .ok_or_else(|| TlsError::EmptyKey(path.to_owned()))
}

/// Revoked serial numbers from a PEM or DER CRL.
fn load_crl_serials(path: &Path) -> Result<HashSet<Vec<u8>>, TlsError> {
    let bytes = std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_owned(),
        source,
    })?;
    let crl = X509Crl::from_pem(&bytes).or_else(|_| X509Crl::from_der(&bytes))?;
    let mut serials = HashSet::new();
    if let Some(revoked) = crl.get_revoked() {
        for entry in revoked {
            serials.insert(entry.serial_number().to_bn()?.to_vec());
        }
    }
    Ok(serials)
}

/// Serial numbers of a DER chain, for the per-request revocation check.
pub fn chain_serials(chain: &[CertificateDer<'_>]) -> Vec<Vec<u8>> {
    chain
        .iter()
        .filter_map(|der| X509::from_der(der).ok())
        .filter_map(|cert| cert.serial_number().to_bn().ok().map(|bn| bn.to_vec()))
        .collect()
}

/// Subject -> validity window of every certificate in the served chain.
fn cert_status(
    cert_path: &Path,
    overdue_days: i32,
) -> Result<BTreeMap<String, CertStatus>, TlsError> {
    let bytes = std::fs::read(cert_path).map_err(|source| TlsError::Read {
        path: cert_path.to_owned(),
        source,
    })?;
    let mut status = BTreeMap::new();
    for cert in X509::stack_from_pem(&bytes)? {
        let subject = subject_string(&cert);
        let threshold = openssl::asn1::Asn1Time::days_from_now(overdue_days as u32)?;
        let state = if cert.not_after() < threshold.as_ref() {
            "overdue"
        } else {
            "ok"
        };
        status.insert(
            subject,
            CertStatus {
                not_before: cert.not_before().to_string(),
                not_after: cert.not_after().to_string(),
                status: state.to_string(),
            },
        );
    }
    Ok(status)
}

fn subject_string(cert: &X509) -> String {
    cert.subject_name()
        .entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Per-request gate: reject any request whose connection presented a
/// revoked certificate, before the admission chain or any handler runs.
pub async fn revocation_gate(
    State(gate): State<Arc<RevocationState>>,
    request: Request,
    next: Next,
) -> Response {
    if !gate.revoked.is_empty() {
        if let Some(serials) = request.extensions().get::<PeerSerials>() {
            if serials.0.iter().any(|s| gate.revoked.contains(s)) {
                tracing::warn!("rejecting request from a revoked certificate");
                return (StatusCode::FORBIDDEN, "certificate revoked").into_response();
            }
        }
    }
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        "strict-transport-security",
        axum::http::HeaderValue::from_static("max-age=31536000"),
    );
    response
}

/// The revocation middleware's state: just the serial set, so the gate can
/// exist (as a no-op) on plain HTTP listeners too.
pub struct RevocationState {
    pub revoked: Arc<HashSet<Vec<u8>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Integer;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use std::io::Write;

    fn self_signed(serial_hex: &str) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "npu-exporter-test").unwrap();
        let name = name.build();
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial_bn = BigNum::from_hex_str(serial_hex).unwrap();
        let serial = Asn1Integer::from_bn(&serial_bn).unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder
            .set_not_before(openssl::asn1::Asn1Time::days_from_now(0).unwrap().as_ref())
            .unwrap();
        builder
            .set_not_after(openssl::asn1::Asn1Time::days_from_now(365).unwrap().as_ref())
            .unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();
        (
            cert.to_pem().unwrap(),
            key.private_key_to_pem_pkcs8().unwrap(),
            serial_bn.to_vec(),
        )
    }

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn suite_flags_map() {
        assert_eq!(SuiteChoice::from_flag(0), Some(SuiteChoice::Aes128Gcm));
        assert_eq!(SuiteChoice::from_flag(1), Some(SuiteChoice::Aes256Gcm));
        assert_eq!(SuiteChoice::from_flag(2), None);
    }

    #[test]
    fn gate_builds_from_pem_material() {
        let (cert_pem, key_pem, serial) = self_signed("dead");
        let cert_file = write_temp(&cert_pem);
        let key_file = write_temp(&key_pem);
        let paths = TlsPaths {
            cert: cert_file.path().to_owned(),
            key: key_file.path().to_owned(),
            ca: None,
            crl: None,
        };
        let gate = TlsGate::build(&paths, SuiteChoice::Aes128Gcm, 100).unwrap();
        assert!(!gate.is_mutual());
        let status = gate.cert_status();
        assert_eq!(status.len(), 1);
        let entry = status.values().next().unwrap();
        assert_eq!(entry.status, "ok");
        assert!(!gate.is_revoked(&[serial]));
    }

    #[test]
    fn near_expiry_certificate_reports_overdue() {
        let (cert_pem, key_pem, _) = self_signed("01");
        let cert_file = write_temp(&cert_pem);
        let key_file = write_temp(&key_pem);
        let paths = TlsPaths {
            cert: cert_file.path().to_owned(),
            key: key_file.path().to_owned(),
            ca: None,
            crl: None,
        };
        // validity is 365 days; a 400 day overdue window flags it
        let gate = TlsGate::build(&paths, SuiteChoice::Aes256Gcm, 400).unwrap();
        assert_eq!(gate.cert_status().values().next().unwrap().status, "overdue");
    }

    #[test]
    fn chain_serials_recovers_the_serial() {
        let (cert_pem, _, serial) = self_signed("dead");
        let cert = X509::from_pem(&cert_pem).unwrap();
        let der = CertificateDer::from(cert.to_der().unwrap());
        assert_eq!(chain_serials(&[der]), vec![serial]);
    }

    #[test]
    fn revoked_chain_is_flagged() {
        let (cert_pem, key_pem, serial) = self_signed("dead");
        let cert_file = write_temp(&cert_pem);
        let key_file = write_temp(&key_pem);
        let paths = TlsPaths {
            cert: cert_file.path().to_owned(),
            key: key_file.path().to_owned(),
            ca: None,
            crl: None,
        };
        let mut gate = TlsGate::build(&paths, SuiteChoice::Aes128Gcm, 100).unwrap();
        gate.revoked = Arc::new(HashSet::from([serial.clone()]));
        assert!(gate.is_revoked(&[vec![1, 2], serial]));
        assert!(!gate.is_revoked(&[vec![1, 2]]));
    }

    #[test]
    fn leaf_hot_swap_accepts_new_material() {
        let (cert_pem, key_pem, _) = self_signed("01");
        let cert_file = write_temp(&cert_pem);
        let key_file = write_temp(&key_pem);
        let paths = TlsPaths {
            cert: cert_file.path().to_owned(),
            key: key_file.path().to_owned(),
            ca: None,
            crl: None,
        };
        let gate = TlsGate::build(&paths, SuiteChoice::Aes128Gcm, 100).unwrap();
        let (new_cert, new_key, _) = self_signed("02");
        let chain = {
            let cert = X509::from_pem(&new_cert).unwrap();
            vec![CertificateDer::from(cert.to_der().unwrap())]
        };
        let key = rustls_pemfile::private_key(&mut new_key.as_slice())
            .unwrap()
            .unwrap();
        gate.swap_leaf(chain, key).unwrap();
    }
}

