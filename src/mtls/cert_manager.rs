//! Certificate management: PEM loading, TLS listener config, and the
//! `trauth tls` generation helpers.
//!
//! All certificate, key and CRL files are PEM.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::ServerConfig;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use tracing::debug;

use crate::config::ServerTlsConfig;
use crate::mtls::acceptor::RequestClientCert;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// TLS listener config
// ─────────────────────────────────────────────────────────────────────────────

/// Build the `rustls::ServerConfig` for the TLS listener.
///
/// Client certificates are requested but neither required nor judged during
/// the handshake; the gate decides what a presented certificate is worth.
///
/// # Errors
///
/// Returns `Error::Tls` if the certificate or key cannot be loaded, or they
/// do not form a usable pair.
pub fn build_server_tls_config(tls: &ServerTlsConfig) -> Result<ServerConfig> {
    let certs = load_certs(&tls.cert)?;
    let key = load_private_key(&tls.key)?;

    let provider = Arc::new(aws_lc_rs::default_provider());
    let verifier = Arc::new(RequestClientCert::new(&provider));

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("unsupported protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(cert = %tls.cert, "TLS listener config built");
    Ok(config)
}

// ─────────────────────────────────────────────────────────────────────────────
// PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns `Error::Tls` if the file cannot be read, is malformed, or holds no
/// certificate.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    let certs = parse_certs(&pem)
        .map_err(|e| Error::Tls(format!("failed to parse certificates from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in '{path}'")));
    }
    Ok(certs)
}

/// Parse every `CERTIFICATE` block in PEM data.
///
/// # Errors
///
/// Returns the PEM error message for malformed input.
pub fn parse_certs(pem: &[u8]) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
///
/// # Errors
///
/// Returns `Error::Tls` if the file cannot be read or holds no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = read_file(path)?;
    PrivateKeyDer::from_pem_slice(&pem)
        .map_err(|e| Error::Tls(format!("failed to parse private key from '{path}': {e}")))
}

/// Load every CRL from a PEM file.
///
/// # Errors
///
/// Returns `Error::Tls` if the file cannot be read or is malformed.
pub fn load_crls(path: &str) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let pem = read_file(path)?;
    CertificateRevocationListDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse CRL from '{path}': {e}")))
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Tls(format!("cannot read '{path}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate generation (CLI helpers)
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for a self-signed CA.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name of the CA
    pub cn: &'a str,
    /// Validity period in days
    pub validity_days: u32,
}

/// What a leaf certificate is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// TLS listener certificate (`serverAuth`)
    Server,
    /// User certificate (`clientAuth`); its CN becomes the session username
    Client,
}

/// Parameters for a leaf certificate.
#[derive(Debug)]
pub struct LeafCertParams<'a> {
    /// Common Name
    pub cn: &'a str,
    /// DNS subject alternative names
    pub san_dns: Vec<String>,
    /// Validity period in days
    pub validity_days: u32,
    /// Intended usage
    pub kind: LeafKind,
}

/// Generated certificate and key in PEM format.
#[derive(Debug)]
pub struct GeneratedCert {
    /// PEM certificate
    pub cert_pem: String,
    /// PEM private key
    pub key_pem: String,
}

/// `rcgen`-backed certificate generator, so a trust anchor and user
/// certificates can be produced without openssl.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if key generation or signing fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key = KeyPair::generate()
            .map_err(|e| Error::Tls(format!("failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = common_name_dn(params.cn);
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_after = not_after(params.validity_days)?;

        let cert = ca_params
            .self_signed(&key)
            .map_err(|e| Error::Tls(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Issue a leaf certificate signed by the given CA.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if the CA cannot be parsed, a SAN is not valid
    /// IA5, or signing fails.
    pub fn issue_leaf(
        params: &LeafCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Tls(format!("failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
            .map_err(|e| Error::Tls(format!("failed to parse CA cert: {e}")))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Tls(format!("failed to generate leaf key: {e}")))?;

        let mut leaf_params = CertificateParams::default();
        leaf_params.distinguished_name = common_name_dn(params.cn);
        leaf_params.not_after = not_after(params.validity_days)?;
        leaf_params.extended_key_usages = vec![match params.kind {
            LeafKind::Server => ExtendedKeyUsagePurpose::ServerAuth,
            LeafKind::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        leaf_params.subject_alt_names = params
            .san_dns
            .iter()
            .map(|dns| {
                Ia5String::try_from(dns.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::Tls(format!("invalid DNS SAN '{dns}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Tls(format!("leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Write `<stem>.crt` and `<stem>.key` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the directory or files cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)?;
        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)?;
        Ok(())
    }
}

fn common_name_dn(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

fn not_after(days: u32) -> Result<time::OffsetDateTime> {
    let secs = chrono::Utc::now().timestamp() + i64::from(days) * 86_400;
    time::OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| Error::Tls(format!("invalid validity period of {days} days: {e}")))
}
