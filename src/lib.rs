//! PVACMS - PVA Certificate Management Service Library
//!
//! Core of a certificate management service for a PVA control-system fleet,
//! together with the client-side status manager that lets TLS peers act on
//! certificate status in real time.
//!
//! # Overview
//!
//! The service owns a Certificate Authority and solves three coupled
//! problems:
//!
//! - **Issuance**: clients, servers, and gateways submit certificate
//!   creation requests over the management channel; pluggable
//!   authentication methods decide whether a certificate is signed
//!   immediately or held for administrator approval.
//! - **Lifecycle tracking**: every issued certificate lives in a durable
//!   SQLite table and moves through
//!   `PENDING_APPROVAL -> PENDING -> VALID -> EXPIRED/REVOKED`, driven by
//!   admin operations and a periodic expiry sweep.
//! - **Status distribution**: each certificate has its own status PV
//!   (`CERT:STATUS:<issuer_id>:<serial>`) carrying a structure with the
//!   lifecycle state and a CA-signed OCSP response. Peers subscribe to
//!   accept or reject TLS connections, and servers staple the signed bytes
//!   into their handshakes.
//!
//! # Crate layout
//!
//! - [`crypto`] / [`ocsp`] - capability layer over OpenSSL: keys, PKCS#12
//!   keychains, the custom status-PV extension, OCSP build and verify
//! - [`cert_factory`] - X.509 assembly and signing
//! - [`status`] / [`status_factory`] - status model and signed responses
//! - [`store`] - the durable `certs` table
//! - [`auth`] / [`issuance`] - authentication plug points and the issuance
//!   pipeline
//! - [`bus`] / [`status_publisher`] / [`expiry_monitor`] - retained-topic
//!   distribution and time-driven transitions
//! - [`peer_status`] / [`tls`] - the client-side cache, verification, and
//!   TLS handshake hooks
//! - [`admin_channel`] - the Unix-socket management endpoint shared with
//!   the `pvacert` operator tool
//!
//! # Security model
//!
//! Private keys never travel: requests carry only public keys, and the CA
//! key is loaded once at startup and shared read-only. Peers believe a
//! status only after verifying its OCSP signature against their own trust
//! anchors, so a compromised distribution path can delay but not forge
//! status.

pub mod admin_channel;
pub mod auth;
pub mod bus;
pub mod cert_factory;
pub mod configs;
pub mod crypto;
pub mod error;
pub mod expiry_monitor;
pub mod issuance;
pub mod ocsp;
pub mod peer_status;
pub mod status;
pub mod status_factory;
pub mod status_publisher;
pub mod store;
pub mod tls;

pub use error::{CmsError, CmsResult};
pub use status::{CertStatus, CertificateStatus, OcspCertStatus, StatusValue};
