//! Client-side peer status manager.
//!
//! Keeps one verified `CertificateStatus` per peer serial, fed by a
//! subscription to the peer certificate's status PV. Every update is
//! verified (OCSP signature, trust chain, validity window, and consistency
//! with the published plain fields) before it reaches the cache; the user's
//! transition callback fires outside the cache lock, and only when the
//! good/bad verdict actually flips.
//!
//! Subscription tasks hold weak references to the manager and the callback,
//! so dropping either tears the pump down without leaking the task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use openssl::x509::X509Ref;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::StatusBus;
use crate::crypto::status_uri_from_cert;
use crate::error::{CmsError, CmsResult};
use crate::ocsp::{parse_and_verify, VerifyOptions};
use crate::status::{parse_status_pv_name, CertificateStatus, StatusDate, StatusValue};

/// How long `wait_for_status` polls before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const WAIT_POLL: Duration = Duration::from_millis(500);

/// Called with the new verdict whenever a peer's `is_good` flips.
pub type TransitionCallback = dyn Fn(bool) + Send + Sync;

struct PeerEntry {
    status: CertificateStatus,
    pump: Option<JoinHandle<()>>,
    callback: Option<Arc<TransitionCallback>>,
}

impl Drop for PeerEntry {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct ManagerInner {
    bus: Arc<dyn StatusBus>,
    verify_opts: VerifyOptions,
    cache: Mutex<HashMap<u64, PeerEntry>>,
}

/// Verify one published status value against the expected serial.
///
/// The signed OCSP response is the source of truth; the plain fields of the
/// published structure must agree with what the signature certifies.
pub fn verify_status_value(
    value: &StatusValue,
    expected_serial: u64,
    opts: &VerifyOptions,
) -> CmsResult<CertificateStatus> {
    if value.serial != expected_serial {
        return Err(CmsError::CryptoParse(format!(
            "published serial {} does not match certificate serial {}",
            value.serial, expected_serial
        )));
    }
    let claimed = value.to_certificate_status()?;
    if claimed.ocsp_bytes.is_empty() {
        return Err(CmsError::CryptoParse(
            "published status carries no signed response".into(),
        ));
    }

    let certified = parse_and_verify(&claimed.ocsp_bytes, opts)?;
    if certified.serial != expected_serial {
        return Err(CmsError::CryptoParse(format!(
            "signed response is for serial {}, not {}",
            certified.serial, expected_serial
        )));
    }
    if certified.status != claimed.ocsp_status {
        return Err(CmsError::CryptoParse(
            "published OCSP status does not match the signed response".into(),
        ));
    }
    if certified.this_update != claimed.status_date.t
        || certified.next_update != claimed.valid_until_date.t
    {
        return Err(CmsError::CryptoParse(
            "published status dates do not match the signed response".into(),
        ));
    }

    Ok(CertificateStatus {
        status: claimed.status,
        ocsp_status: certified.status,
        status_date: StatusDate::new(certified.this_update),
        valid_until_date: StatusDate::new(certified.next_update),
        revocation_date: certified.revocation_time.map(StatusDate::new),
        ocsp_bytes: claimed.ocsp_bytes,
    })
}

#[derive(Clone)]
pub struct CertStatusManager {
    inner: Arc<ManagerInner>,
}

impl CertStatusManager {
    pub fn new(bus: Arc<dyn StatusBus>, verify_opts: VerifyOptions) -> Self {
        CertStatusManager {
            inner: Arc::new(ManagerInner {
                bus,
                verify_opts,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Serial number of a certificate as u64.
    pub fn serial_of(cert: &X509Ref) -> CmsResult<u64> {
        let bn = cert.serial_number().to_bn()?;
        bn.to_dec_str()?
            .parse()
            .map_err(|_| CmsError::CryptoParse("certificate serial does not fit in u64".into()))
    }

    /// True when the certificate carries the status-PV extension and so must
    /// be monitored.
    pub fn monitoring_required(cert: &X509Ref) -> bool {
        matches!(status_uri_from_cert(cert), Ok(Some(_)))
    }

    /// The handshake-time question: is this peer acceptable right now?
    ///
    /// Certificates without the status extension do not participate in
    /// revocation tracking and pass by default. For monitored certificates
    /// the answer comes from the verified cache, refreshed from the topic's
    /// retained value when the cached entry has lapsed.
    pub fn check_peer(&self, cert: &X509Ref) -> CmsResult<bool> {
        let uri = match status_uri_from_cert(cert)? {
            Some(uri) => uri,
            None => return Ok(true),
        };
        let serial = Self::serial_of(cert)?;

        {
            let cache = self.inner.cache.lock().expect("peer cache poisoned");
            if let Some(entry) = cache.get(&serial) {
                if entry.status.is_valid() {
                    return Ok(entry.status.is_good());
                }
            }
        }

        // Nothing current in the cache: verify the retained topic value.
        let value = match self.inner.bus.latest(&uri) {
            Some(v) => v,
            None => {
                debug!(serial, %uri, "no status available for peer");
                return Ok(false);
            }
        };
        match verify_status_value(&value, serial, &self.inner.verify_opts) {
            Ok(status) => {
                let good = status.is_good();
                let mut cache = self.inner.cache.lock().expect("peer cache poisoned");
                let entry = cache.entry(serial).or_insert_with(|| PeerEntry {
                    status: CertificateStatus::unknown(),
                    pump: None,
                    callback: None,
                });
                entry.status = status;
                Ok(good)
            }
            Err(e) => {
                warn!(serial, error = %e, "peer status failed verification");
                Ok(false)
            }
        }
    }

    /// Subscribe to a peer certificate's status PV, driving `callback`
    /// whenever the good/bad verdict flips.
    ///
    /// Asking to monitor a certificate that lacks the status extension is an
    /// internal inconsistency (the verify path must have checked first) and
    /// takes the process down rather than running unprotected.
    pub fn subscribe(&self, cert: &X509Ref, callback: Arc<TransitionCallback>) -> CmsResult<u64> {
        let uri = match status_uri_from_cert(cert) {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                error!("status monitoring requested on a certificate without the status extension");
                std::process::abort();
            }
            Err(e) => return Err(e),
        };
        // Cross-check the embedded PV name against the certificate itself.
        let (_, pv_serial) = parse_status_pv_name(&uri)?;
        let serial = Self::serial_of(cert)?;
        if pv_serial != serial {
            return Err(CmsError::CryptoParse(format!(
                "status PV names serial {pv_serial:016x} but certificate carries {serial:016x}"
            )));
        }

        let mut cache = self.inner.cache.lock().expect("peer cache poisoned");
        let entry = cache.entry(serial).or_insert_with(|| PeerEntry {
            status: CertificateStatus::unknown(),
            pump: None,
            callback: None,
        });
        entry.callback = Some(Arc::clone(&callback));
        if entry.pump.is_none() {
            let weak_inner = Arc::downgrade(&self.inner);
            let weak_callback = Arc::downgrade(&callback);
            let mut subscription = self.inner.bus.subscribe(&uri);
            entry.pump = Some(tokio::spawn(async move {
                Self::pump(weak_inner, weak_callback, serial, &mut subscription).await;
            }));
        }
        Ok(serial)
    }

    async fn pump(
        weak_inner: Weak<ManagerInner>,
        weak_callback: Weak<TransitionCallback>,
        serial: u64,
        subscription: &mut crate::bus::Subscription,
    ) {
        while let Some(value) = subscription.next().await {
            let inner = match weak_inner.upgrade() {
                Some(inner) => inner,
                None => return, // manager is gone; stop quietly
            };
            let status = match verify_status_value(&value, serial, &inner.verify_opts) {
                Ok(status) => status,
                Err(e) => {
                    // Unverifiable updates never reach the cache or callback
                    debug!(serial, error = %e, "ignoring unverified status update");
                    continue;
                }
            };

            let flipped = {
                let mut cache = inner.cache.lock().expect("peer cache poisoned");
                let entry = cache.entry(serial).or_insert_with(|| PeerEntry {
                    status: CertificateStatus::unknown(),
                    pump: None,
                    callback: None,
                });
                let was_good = entry.status.is_good();
                entry.status = status;
                let is_good = entry.status.is_good();
                (was_good != is_good).then_some(is_good)
            };

            // Callback runs outside the lock; a dropped callback ends the
            // subscription's interest but the cache keeps serving lookups.
            if let Some(is_good) = flipped {
                if let Some(callback) = weak_callback.upgrade() {
                    callback(is_good);
                }
            }
        }
    }

    /// The cached status for a serial, or UNKNOWN when nothing is cached.
    pub fn get_status(&self, serial: u64) -> CertificateStatus {
        let cache = self.inner.cache.lock().expect("peer cache poisoned");
        cache
            .get(&serial)
            .map(|e| e.status.clone())
            .unwrap_or_else(CertificateStatus::unknown)
    }

    /// Wait up to three seconds for a valid status to arrive, polling the
    /// cache twice a second. Returns whatever is cached at the end, possibly
    /// still UNKNOWN.
    pub async fn wait_for_status(&self, serial: u64) -> CertificateStatus {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let current = self.get_status(serial);
            if current.is_valid() || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Tear down the subscription and cache entry for a serial. Idempotent.
    pub fn unsubscribe(&self, serial: u64) {
        let mut cache = self.inner.cache.lock().expect("peer cache poisoned");
        cache.remove(&serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::cert_factory::{usage, CaMaterial, CertFactory};
    use crate::crypto::KeyPair;
    use crate::status::{issuer_id, status_pv_name, CertStatus};
    use crate::status_factory::CertStatusFactory;
    use crate::status_publisher::{AdminAction, StatusPublisher};
    use crate::store::{CertRecord, CertStore};
    use crate::tls::StapleCache;
    use chrono::Utc;
    use openssl::x509::X509;
    use tempfile::tempdir;

    struct World {
        manager: CertStatusManager,
        publisher: Arc<StatusPublisher>,
        store: Arc<CertStore>,
        ca: CaMaterial,
        issuer: String,
        _dir: tempfile::TempDir,
    }

    fn world() -> World {
        let dir = tempdir().unwrap();
        let store = Arc::new(CertStore::open(&dir.path().join("certs.db")).unwrap());
        let bus = Arc::new(InProcessBus::new());

        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let signed = CertFactory::new(1, kp.public_key().unwrap())
            .common_name("Peer Status Test CA")
            .validity(now - 60, now + 86_400 * 365)
            .usage(usage::CA)
            .self_signed(kp.pkey.clone())
            .build()
            .unwrap();
        let ca = CaMaterial {
            cert: signed.cert,
            key: kp.pkey,
            chain: Vec::new(),
        };
        let issuer = issuer_id(&ca.cert).unwrap();

        let publisher = Arc::new(StatusPublisher::new(
            Arc::clone(&store),
            CertStatusFactory::new(ca.clone(), 30),
            bus.clone() as Arc<dyn StatusBus>,
            ca.clone(),
            issuer.clone(),
            vec!["admin".to_string()],
            true,
            Arc::new(StapleCache::new()),
        ));

        let manager = CertStatusManager::new(
            bus as Arc<dyn StatusBus>,
            VerifyOptions {
                allow_self_signed_ca: true,
                trusted_ca_dir: None,
            },
        );

        World {
            manager,
            publisher,
            store,
            ca,
            issuer,
            _dir: dir,
        }
    }

    fn issue_monitored_cert(w: &World, serial: u64, cn: &str) -> X509 {
        let now = Utc::now().timestamp();
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        w.store
            .insert(&CertRecord {
                serial,
                skid: format!("skid{serial}"),
                cn: cn.to_string(),
                o: String::new(),
                ou: String::new(),
                c: String::new(),
                not_before: now - 60,
                not_after: now + 3_600,
                status: CertStatus::Valid,
                status_date: now,
            })
            .unwrap();
        CertFactory::new(serial, kp.public_key().unwrap())
            .common_name(cn)
            .validity(now - 60, now + 3_600)
            .usage(usage::SERVER)
            .issued_by(&w.ca)
            .status_pv(&status_pv_name(&w.issuer, serial))
            .build()
            .unwrap()
            .cert
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_revocation_propagates_to_subscriber() {
        let w = world();
        let cert = issue_monitored_cert(&w, 100, "srv-revoke");
        w.publisher.publish_status(100).unwrap();

        let flips: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flips);
        let callback: Arc<TransitionCallback> =
            Arc::new(move |good| sink.lock().unwrap().push(good));

        w.manager.subscribe(&cert, Arc::clone(&callback)).unwrap();

        // First verified update flips unknown -> good
        wait_until("initial good status", || {
            flips.lock().unwrap().as_slice() == [true]
        })
        .await;
        assert!(w.manager.get_status(100).is_good());

        // Admin revokes; within one publish the verdict flips to bad
        w.publisher
            .put_state(100, AdminAction::Revoked, "admin")
            .unwrap();
        wait_until("revocation flip", || {
            flips.lock().unwrap().as_slice() == [true, false]
        })
        .await;
        let status = w.manager.get_status(100);
        assert_eq!(status.status, CertStatus::Revoked);
        assert!(!status.is_good());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_check_peer_accepts_good_and_rejects_revoked() {
        let w = world();
        let cert = issue_monitored_cert(&w, 101, "srv-check");
        w.publisher.publish_status(101).unwrap();

        assert!(w.manager.check_peer(&cert).unwrap());

        w.publisher
            .put_state(101, AdminAction::Revoked, "admin")
            .unwrap();
        // Drop the stale cache entry so the retained value is re-verified
        w.manager.unsubscribe(101);
        assert!(!w.manager.check_peer(&cert).unwrap());
    }

    #[tokio::test]
    async fn test_unmonitored_cert_passes_by_default() {
        let w = world();
        let now = Utc::now().timestamp();
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let plain = CertFactory::new(102, kp.public_key().unwrap())
            .common_name("plain-peer")
            .validity(now - 60, now + 3_600)
            .usage(usage::CLIENT)
            .issued_by(&w.ca)
            .build()
            .unwrap()
            .cert;
        assert!(w.manager.check_peer(&plain).unwrap());
    }

    #[tokio::test]
    async fn test_check_peer_without_status_is_rejected() {
        let w = world();
        let cert = issue_monitored_cert(&w, 103, "srv-nostatus");
        // No publish: the topic has no retained value
        assert!(!w.manager.check_peer(&cert).unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_for_status_returns_cached_value() {
        let w = world();
        let cert = issue_monitored_cert(&w, 104, "srv-wait");
        w.publisher.publish_status(104).unwrap();

        let callback: Arc<TransitionCallback> = Arc::new(|_| {});
        w.manager.subscribe(&cert, callback).unwrap();
        wait_until("status arrival", || w.manager.get_status(104).is_valid()).await;

        let status = w.manager.wait_for_status(104).await;
        assert!(status.is_good());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let w = world();
        w.manager.unsubscribe(9999);
        w.manager.unsubscribe(9999);
    }

    #[test]
    fn test_verify_status_value_rejects_serial_mismatch() {
        let w = world();
        let now = Utc::now().timestamp();
        w.store
            .insert(&CertRecord {
                serial: 105,
                skid: "skid105".to_string(),
                cn: "x".to_string(),
                o: String::new(),
                ou: String::new(),
                c: String::new(),
                not_before: now - 60,
                not_after: now + 3_600,
                status: CertStatus::Valid,
                status_date: now,
            })
            .unwrap();
        let value = w.publisher.publish_status(105).unwrap();
        let opts = VerifyOptions {
            allow_self_signed_ca: true,
            trusted_ca_dir: None,
        };
        assert!(verify_status_value(&value, 105, &opts).is_ok());
        assert!(verify_status_value(&value, 106, &opts).is_err());
    }
}
