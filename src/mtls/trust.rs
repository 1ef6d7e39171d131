//! Client certificate trust.
//!
//! [`TrustAnchor`] holds the configured CA pool (and optional CRLs) and
//! answers whether a single certificate chains to it and is not revoked. [`try_authenticate`]
//! turns a presented chain into a username.

use std::fmt;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use tracing::{debug, info};

use crate::mtls::cert_manager::{load_certs, load_crls};
use crate::mtls::subject::CertSubject;
use crate::{Error, Result};

/// Set of CAs trusted to vouch for client certificates.
#[derive(Clone)]
pub struct TrustAnchor {
    verifier: Arc<dyn ClientCertVerifier>,
    roots: usize,
    crls: usize,
}

impl TrustAnchor {
    /// Build an anchor from DER CA certificates and CRLs.
    ///
    /// A certificate listed in a CRL from its issuer is rejected. CAs with no
    /// CRL in `crls` are not subject to revocation checks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if a CA certificate is unusable or no CA is given.
    pub fn from_der(
        cas: Vec<CertificateDer<'static>>,
        crls: Vec<CertificateRevocationListDer<'static>>,
    ) -> Result<Self> {
        let mut store = RootCertStore::empty();
        for ca in cas {
            store
                .add(ca)
                .map_err(|e| Error::Tls(format!("failed to add CA to trust store: {e}")))?;
        }
        let roots = store.len();
        let crl_count = crls.len();

        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(store),
            Arc::new(aws_lc_rs::default_provider()),
        )
        .with_crls(crls)
        .allow_unknown_revocation_status()
        .build()
        .map_err(|e| Error::Tls(format!("failed to build client verifier: {e}")))?;

        Ok(Self {
            verifier,
            roots,
            crls: crl_count,
        })
    }

    /// Load the CA bundle at `ca_path` and, if given, the CRLs at `crl_path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if either file is unreadable or malformed.
    pub fn from_pem_files(ca_path: &str, crl_path: Option<&str>) -> Result<Self> {
        let cas = load_certs(ca_path)?;
        let crls = match crl_path {
            Some(path) => load_crls(path)?,
            None => Vec::new(),
        };
        let anchor = Self::from_der(cas, crls)?;
        info!(
            ca_path = %ca_path,
            roots = anchor.roots,
            crls = anchor.crls,
            "Loaded client certificate trust anchor"
        );
        Ok(anchor)
    }

    /// `true` when `cert` chains to a trusted CA, is within its validity
    /// period, is usable for client auth and is not revoked.
    ///
    /// Each certificate is judged on its own; no intermediates are
    /// considered.
    #[must_use]
    pub fn verifies(&self, cert: &CertificateDer<'_>) -> bool {
        self.verifier
            .verify_client_cert(cert, &[], UnixTime::now())
            .is_ok()
    }

    /// Number of trusted CA certificates
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("roots", &self.roots)
            .field("crls", &self.crls)
            .finish_non_exhaustive()
    }
}

/// Username from the first presented certificate that verifies.
///
/// Certificates are tried in presentation order. A certificate that verifies
/// but has no Common Name is skipped. Returns `None` when there is no anchor,
/// no certificate, or none verifies.
#[must_use]
pub fn try_authenticate(
    chain: &[CertificateDer<'_>],
    anchor: Option<&TrustAnchor>,
) -> Option<String> {
    let anchor = anchor?;

    for (index, cert) in chain.iter().enumerate() {
        if !anchor.verifies(cert) {
            debug!(index, "Client certificate did not verify");
            continue;
        }
        match CertSubject::from_der(cert) {
            Ok(CertSubject {
                common_name: Some(cn),
                serial,
                ..
            }) => {
                debug!(index, user = %cn, serial = %serial, "Client certificate verified");
                return Some(cn);
            }
            Ok(subject) => {
                debug!(index, subject = %subject.subject, "Verified client certificate has no CN");
            }
            Err(e) => debug!(index, error = %e, "Verified client certificate unparsable"),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::cert_manager::{
        CaParams, CertGenerator, GeneratedCert, LeafCertParams, LeafKind, parse_certs,
    };
    use rcgen::{
        CertificateRevocationList, CertificateRevocationListParams, Issuer, KeyIdMethod, KeyPair,
        RevocationReason, RevokedCertParams, SerialNumber,
    };
    use time::OffsetDateTime;

    fn ca(cn: &str) -> GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn,
            validity_days: 30,
        })
        .unwrap()
    }

    fn client(cn: &str, ca: &GeneratedCert) -> CertificateDer<'static> {
        let leaf = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn,
                san_dns: vec![],
                validity_days: 30,
                kind: LeafKind::Client,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        der(&leaf.cert_pem)
    }

    fn der(pem: &str) -> CertificateDer<'static> {
        parse_certs(pem.as_bytes()).unwrap().remove(0)
    }

    fn anchor_for(ca: &GeneratedCert) -> TrustAnchor {
        TrustAnchor::from_der(vec![der(&ca.cert_pem)], vec![]).unwrap()
    }

    /// CRL issued by `ca` listing the given certificates as revoked.
    fn crl_revoking(
        ca: &GeneratedCert,
        revoked: &[&CertificateDer<'_>],
    ) -> CertificateRevocationList {
        let key = KeyPair::from_pem(&ca.key_pem).unwrap();
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, key).unwrap();
        let now = OffsetDateTime::from_unix_timestamp(chrono::Utc::now().timestamp()).unwrap();

        let revoked_certs = revoked
            .iter()
            .map(|cert| {
                let (_, parsed) = x509_parser::parse_x509_certificate(cert).unwrap();
                RevokedCertParams {
                    serial_number: SerialNumber::from_slice(parsed.raw_serial()),
                    revocation_time: now,
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                }
            })
            .collect();

        CertificateRevocationListParams {
            this_update: now - time::Duration::hours(1),
            next_update: now + time::Duration::days(7),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&issuer)
        .unwrap()
    }

    #[test]
    fn cert_signed_by_anchor_yields_its_cn() {
        // GIVEN: an anchor and a client cert it issued
        let root = ca("Root");
        let anchor = anchor_for(&root);
        let alice = client("alice", &root);
        // WHEN/THEN: alice is authenticated
        assert_eq!(
            try_authenticate(&[alice], Some(&anchor)).as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn cert_from_foreign_ca_is_rejected() {
        let anchor = anchor_for(&ca("Root"));
        let mallory = client("mallory", &ca("Other"));
        assert_eq!(try_authenticate(&[mallory], Some(&anchor)), None);
    }

    #[test]
    fn first_verifying_cert_wins() {
        // GIVEN: an untrusted cert followed by a trusted one
        let root = ca("Root");
        let anchor = anchor_for(&root);
        let chain = [client("mallory", &ca("Other")), client("bob", &root)];
        // THEN: the trusted one supplies the username
        assert_eq!(
            try_authenticate(&chain, Some(&anchor)).as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn no_anchor_means_no_certificate_authentication() {
        let root = ca("Root");
        assert_eq!(try_authenticate(&[client("alice", &root)], None), None);
    }

    #[test]
    fn empty_chain_is_rejected() {
        let anchor = anchor_for(&ca("Root"));
        assert_eq!(try_authenticate(&[], Some(&anchor)), None);
    }

    #[test]
    fn ca_certificate_itself_is_not_a_client_identity() {
        let root = ca("Root");
        let anchor = anchor_for(&root);
        assert_eq!(try_authenticate(&[der(&root.cert_pem)], Some(&anchor)), None);
    }

    #[test]
    fn from_pem_files_loads_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let root = ca("Root");
        CertGenerator::write_to_dir(&root, dir.path(), "ca").unwrap();

        let anchor =
            TrustAnchor::from_pem_files(dir.path().join("ca.crt").to_str().unwrap(), None).unwrap();
        assert_eq!(anchor.root_count(), 1);
        assert!(anchor.verifies(&client("carol", &root)));
    }

    // ── revocation ───────────────────────────────────────────────────────────

    #[test]
    fn revoked_cert_is_rejected_and_unlisted_cert_accepted() {
        // GIVEN: a CA whose CRL revokes mallory's certificate
        let root = ca("Root");
        let good = client("good", &root);
        let revoked = client("mallory", &root);
        let crl = crl_revoking(&root, &[&revoked]);
        let anchor =
            TrustAnchor::from_der(vec![der(&root.cert_pem)], vec![crl.der().clone()]).unwrap();

        // THEN: the revoked certificate yields no identity
        assert_eq!(try_authenticate(&[revoked], Some(&anchor)), None);
        // AND: another certificate from the same CA still authenticates
        assert_eq!(
            try_authenticate(&[good], Some(&anchor)).as_deref(),
            Some("good")
        );
    }

    #[test]
    fn ca_without_crl_is_not_locked_out() {
        // GIVEN: two CAs, only the first publishing a CRL
        let first = ca("First");
        let second = ca("Second");
        let crl = crl_revoking(&first, &[&client("old", &first)]);
        let anchor = TrustAnchor::from_der(
            vec![der(&first.cert_pem), der(&second.cert_pem)],
            vec![crl.der().clone()],
        )
        .unwrap();

        // WHEN: a client of the second CA presents its certificate
        let user = try_authenticate(&[client("dave", &second)], Some(&anchor));

        // THEN: it is accepted; unknown revocation status is not a rejection
        assert_eq!(user.as_deref(), Some("dave"));
    }

    #[test]
    fn from_pem_files_applies_crl() {
        let dir = tempfile::tempdir().unwrap();
        let root = ca("Root");
        let revoked = client("mallory", &root);
        CertGenerator::write_to_dir(&root, dir.path(), "ca").unwrap();
        let crl_path = dir.path().join("ca.crl");
        std::fs::write(&crl_path, crl_revoking(&root, &[&revoked]).pem().unwrap()).unwrap();

        let anchor = TrustAnchor::from_pem_files(
            dir.path().join("ca.crt").to_str().unwrap(),
            Some(crl_path.to_str().unwrap()),
        )
        .unwrap();

        assert!(!anchor.verifies(&revoked));
        assert!(anchor.verifies(&client("carol", &root)));
    }

    #[test]
    fn unreadable_crl_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        CertGenerator::write_to_dir(&ca("Root"), dir.path(), "ca").unwrap();
        let result = TrustAnchor::from_pem_files(
            dir.path().join("ca.crt").to_str().unwrap(),
            Some("/nonexistent/ca.crl"),
        );
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[test]
    fn empty_anchor_is_an_error() {
        let err = TrustAnchor::from_der(vec![], vec![]).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        assert!(TrustAnchor::from_pem_files("/nonexistent/ca.pem", None).is_err());
    }
}
