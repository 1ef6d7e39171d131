//! TLS listener plumbing.
//!
//! The handshake asks every client for a certificate but accepts any answer,
//! including none. Whatever chain the client presented is attached to each
//! request on that connection as a [`PeerCertificates`] extension; the gate
//! checks it against the trust anchor.

use std::io;
use std::sync::Arc;

use axum::Extension;
use axum::middleware::AddExtension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::ServerConnection;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;

/// Certificate chain presented by the client, leaf first.
///
/// Empty for plain HTTP connections and for TLS clients that sent none.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(Arc<Vec<CertificateDer<'static>>>);

impl PeerCertificates {
    /// Chain captured from a finished handshake.
    #[must_use]
    pub fn from_connection(conn: &ServerConnection) -> Self {
        conn.peer_certificates()
            .map(|certs| Self::from(certs.to_vec()))
            .unwrap_or_default()
    }

    /// Certificates in presentation order
    #[must_use]
    pub fn as_slice(&self) -> &[CertificateDer<'static>] {
        &self.0
    }

    /// Returns `true` when the client presented no certificate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of certificates presented
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<CertificateDer<'static>>> for PeerCertificates {
    fn from(certs: Vec<CertificateDer<'static>>) -> Self {
        Self(Arc::new(certs))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake verifier
// ─────────────────────────────────────────────────────────────────────────────

/// Client certificate verifier that requests a certificate and accepts any.
///
/// Handshake signatures are still checked, so the client must hold the key
/// of the certificate it presents.
#[derive(Debug)]
pub struct RequestClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl RequestClientCert {
    /// Verifier using the provider's signature algorithms.
    #[must_use]
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for RequestClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection acceptor
// ─────────────────────────────────────────────────────────────────────────────

/// `axum-server` acceptor that terminates TLS and exposes the client chain
/// to handlers and middleware.
#[derive(Clone)]
pub struct PeerCertificateAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertificateAcceptor {
    /// Acceptor for the given TLS config.
    #[must_use]
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertificateAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let certs = PeerCertificates::from_connection(stream.get_ref().1);
            Ok((stream, Extension(certs).layer(service)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::crypto::aws_lc_rs;

    #[test]
    fn verifier_requests_but_does_not_require_a_certificate() {
        let verifier = RequestClientCert::new(&aws_lc_rs::default_provider());
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
        assert!(verifier.root_hint_subjects().is_empty());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn verifier_accepts_any_chain() {
        let verifier = RequestClientCert::new(&aws_lc_rs::default_provider());
        let junk = CertificateDer::from(vec![0u8; 8]);
        assert!(
            verifier
                .verify_client_cert(&junk, &[], UnixTime::now())
                .is_ok()
        );
    }

    #[test]
    fn peer_certificates_default_is_empty() {
        let certs = PeerCertificates::default();
        assert!(certs.is_empty());
        assert_eq!(certs.len(), 0);
    }

    #[test]
    fn peer_certificates_keep_presentation_order() {
        let certs = PeerCertificates::from(vec![
            CertificateDer::from(vec![1u8]),
            CertificateDer::from(vec![2u8]),
        ]);
        assert_eq!(certs.len(), 2);
        assert_eq!(certs.as_slice()[0].as_ref(), &[1u8]);
    }
}
