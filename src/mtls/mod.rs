//! Client certificate authentication.
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (certificate requested, never required)
//!   → PeerCertificates attached to every request on the connection
//!   → gate: try_authenticate(chain, trust anchor) → CN becomes the username
//! ```
//!
//! # Modules
//!
//! - [`acceptor`]: handshake verifier and the `axum-server` acceptor
//! - [`trust`]: CA pool, CRLs and chain evaluation
//! - [`subject`]: X.509 subject field extraction
//! - [`cert_manager`]: PEM loading, listener config and `trauth tls` helpers

pub mod acceptor;
pub mod cert_manager;
pub mod subject;
pub mod trust;

pub use acceptor::{PeerCertificateAcceptor, PeerCertificates, RequestClientCert};
pub use cert_manager::{
    CaParams, CertGenerator, GeneratedCert, LeafCertParams, LeafKind, build_server_tls_config,
    load_certs, load_crls, load_private_key,
};
pub use subject::CertSubject;
pub use trust::{TrustAnchor, try_authenticate};
