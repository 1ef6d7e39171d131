//! Client certificate subject extraction.
//!
//! Only the subject Common Name matters for authentication: it becomes the
//! session username. The full subject DN and serial are kept for logs.

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

/// Subject fields of a client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertSubject {
    /// First Common Name (CN) attribute in the subject, if any.
    pub common_name: Option<String>,
    /// RFC 4514 rendering of the subject DN
    pub subject: String,
    /// Serial number as colon-separated hex
    pub serial: String,
}

impl CertSubject {
    /// Parse a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Tls(format!("failed to parse client certificate: {e}")))?;

        Ok(Self {
            common_name: extract_cn(&cert),
            subject: cert.subject().to_string(),
            serial: cert.raw_serial_as_string(),
        })
    }
}

/// Common Name of a DER-encoded certificate.
///
/// `None` when the certificate cannot be parsed, has no CN, or the CN is
/// empty or not valid UTF-8.
#[must_use]
pub fn common_name(der: &[u8]) -> Option<String> {
    CertSubject::from_der(der).ok()?.common_name
}

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .map(str::to_owned)
}
