//! TLS handshake integration.
//!
//! Two hooks tie the status machinery into TLS: a verify callback on the
//! client/server side that consults the peer status manager before
//! accepting a cryptographically-valid peer, and a stapling callback on the
//! server side that injects the latest signed OCSP bytes into the
//! handshake.

use std::sync::{Arc, Mutex};

use openssl::ssl::SslContextBuilder;
use openssl::x509::{X509StoreContextRef, X509VerifyResult};
use tracing::{debug, error, warn};

use crate::crypto::status_uri_from_cert;
use crate::peer_status::CertStatusManager;

/// Latest signed OCSP bytes for the serving certificate.
///
/// One buffer per serving context. Replacement compares content and skips
/// the swap when nothing changed, so the handshake path never sees a
/// half-written staple.
#[derive(Default)]
pub struct StapleCache {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl StapleCache {
    pub fn new() -> Self {
        StapleCache::default()
    }

    /// Store new staple bytes; returns true when the cache changed.
    pub fn replace(&self, ocsp_der: &[u8]) -> bool {
        let mut guard = self.bytes.lock().expect("staple lock poisoned");
        match guard.as_deref() {
            Some(current) if current == ocsp_der => false,
            _ => {
                *guard = Some(ocsp_der.to_vec());
                true
            }
        }
    }

    pub fn current(&self) -> Option<Vec<u8>> {
        self.bytes.lock().expect("staple lock poisoned").clone()
    }
}

/// Chain-verification errors that a permissive deployment may tolerate.
fn is_self_signed_error(err: X509VerifyResult) -> bool {
    matches!(
        err.as_raw(),
        openssl_sys::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT
            | openssl_sys::X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN
            | openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY
    )
}

/// The verify decision for one certificate in the peer chain.
///
/// Factored out of the callback so the policy is testable without a live
/// handshake: `preverified` is OpenSSL's own chain verdict, `error` its
/// failure reason when not preverified.
pub fn verify_peer_cert(
    preverified: bool,
    error: X509VerifyResult,
    cert: Option<&openssl::x509::X509Ref>,
    manager: &CertStatusManager,
    allow_self_signed: bool,
) -> bool {
    if !preverified {
        if allow_self_signed && is_self_signed_error(error) {
            debug!("accepting self-signed peer chain by configuration");
            return true;
        }
        warn!(reason = %error.error_string(), "rejecting peer: chain verification failed");
        return false;
    }

    let cert = match cert {
        Some(c) => c,
        None => return true,
    };

    match status_uri_from_cert(cert) {
        Ok(None) => true, // certificate does not participate in status monitoring
        Ok(Some(_)) => match manager.check_peer(cert) {
            Ok(good) => {
                if !good {
                    warn!("rejecting peer: certificate status is not GOOD");
                }
                good
            }
            Err(e) => {
                warn!(error = %e, "rejecting peer: unable to verify revocation status");
                false
            }
        },
        Err(e) => {
            warn!(error = %e, "rejecting peer: unreadable status extension");
            false
        }
    }
}

/// Install the status-aware verify callback on a TLS context.
pub fn configure_peer_verification(
    builder: &mut SslContextBuilder,
    manager: Arc<CertStatusManager>,
    allow_self_signed: bool,
) {
    use openssl::ssl::SslVerifyMode;
    builder.set_verify_callback(
        SslVerifyMode::PEER,
        move |preverified, ctx: &mut X509StoreContextRef| {
            verify_peer_cert(
                preverified,
                ctx.error(),
                ctx.current_cert(),
                &manager,
                allow_self_signed,
            )
        },
    );
}

/// Install the stapling callback on a server TLS context.
///
/// Every handshake that asks for a status payload receives the latest
/// signed OCSP bytes; when none are available the handshake is aborted
/// rather than served unverifiable.
pub fn configure_server_stapling(
    builder: &mut SslContextBuilder,
    staple: Arc<StapleCache>,
) -> Result<(), openssl::error::ErrorStack> {
    builder.set_status_callback(move |ssl| match staple.current() {
        Some(bytes) => {
            ssl.set_ocsp_status(&bytes)?;
            Ok(true)
        }
        None => {
            error!("no signed status available to staple; aborting handshake");
            Ok(false)
        }
    })
}
