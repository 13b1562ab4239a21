//! Time-driven status transitions.
//!
//! A periodic sweep promotes PENDING certificates whose validity window has
//! opened and expires VALID certificates whose window has closed. Each row
//! moves through the store's guarded transition and is republished, so
//! subscribers see the change within one tick. Store hiccups are logged and
//! retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::status::CertStatus;
use crate::status_publisher::StatusPublisher;
use crate::store::CertStore;

/// Default sweep period.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(60);

pub struct ExpiryMonitor {
    store: Arc<CertStore>,
    publisher: Arc<StatusPublisher>,
    period: Duration,
}

impl ExpiryMonitor {
    pub fn new(store: Arc<CertStore>, publisher: Arc<StatusPublisher>, period: Duration) -> Self {
        ExpiryMonitor {
            store,
            publisher,
            period,
        }
    }

    /// One sweep pass. Returns `(promoted, expired)` row counts.
    pub fn sweep(&self, now: i64) -> (usize, usize) {
        let mut promoted = 0;
        let mut expired = 0;

        match self.store.scan_to_valid(now) {
            Ok(serials) => {
                for serial in serials {
                    match self
                        .store
                        .set_status(serial, CertStatus::Valid, &[CertStatus::Pending], now)
                    {
                        Ok(()) => {
                            promoted += 1;
                            if let Err(e) = self.publisher.publish_status(serial) {
                                warn!(serial, error = %e, "promoted but unable to publish");
                            }
                        }
                        Err(e) => debug!(serial, error = %e, "skipping promotion"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "validity sweep failed; will retry"),
        }

        match self.store.scan_to_expired(now) {
            Ok(serials) => {
                for serial in serials {
                    match self
                        .store
                        .set_status(serial, CertStatus::Expired, &[CertStatus::Valid], now)
                    {
                        Ok(()) => {
                            expired += 1;
                            if let Err(e) = self.publisher.publish_status(serial) {
                                warn!(serial, error = %e, "expired but unable to publish");
                            }
                        }
                        Err(e) => debug!(serial, error = %e, "skipping expiry"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "expiry sweep failed; will retry"),
        }

        if promoted > 0 || expired > 0 {
            info!(promoted, expired, "expiry sweep applied transitions");
        }
        (promoted, expired)
    }

    /// Run sweeps forever on the configured period.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let monitor = &self;
            let now = Utc::now().timestamp();
            // The sweep does blocking SQLite work; keep it off the I/O loop.
            tokio::task::block_in_place(|| {
                monitor.sweep(now);
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InProcessBus, StatusBus};
    use crate::cert_factory::{usage, CaMaterial, CertFactory};
    use crate::crypto::KeyPair;
    use crate::status::issuer_id;
    use crate::status_factory::CertStatusFactory;
    use crate::store::CertRecord;
    use crate::tls::StapleCache;
    use tempfile::tempdir;

    fn fixture() -> (ExpiryMonitor, Arc<CertStore>, Arc<InProcessBus>, String, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(CertStore::open(&dir.path().join("certs.db")).unwrap());
        let bus = Arc::new(InProcessBus::new());

        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let signed = CertFactory::new(1, kp.public_key().unwrap())
            .common_name("Sweep Test CA")
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
            ca,
            issuer.clone(),
            vec![],
            true,
            Arc::new(StapleCache::new()),
        ));
        let monitor = ExpiryMonitor::new(Arc::clone(&store), publisher, DEFAULT_SWEEP_PERIOD);
        (monitor, store, bus, issuer, dir)
    }

    fn insert(store: &CertStore, serial: u64, status: CertStatus, not_before: i64, not_after: i64) {
        store
            .insert(&CertRecord {
                serial,
                skid: format!("skid{serial}"),
                cn: format!("cn{serial}"),
                o: String::new(),
                ou: String::new(),
                c: String::new(),
                not_before,
                not_after,
                status,
                status_date: not_before,
            })
            .unwrap();
    }

    #[test]
    fn test_sweep_promotes_and_expires() {
        let (monitor, store, bus, issuer, _dir) = fixture();
        let now = Utc::now().timestamp();

        insert(&store, 20, CertStatus::Pending, now - 10, now + 3_600);
        insert(&store, 21, CertStatus::Valid, now - 3_600, now - 1);
        insert(&store, 22, CertStatus::Valid, now - 10, now + 3_600);

        let (promoted, expired) = monitor.sweep(now);
        assert_eq!((promoted, expired), (1, 1));

        assert_eq!(store.get_status(20).unwrap().0, CertStatus::Valid);
        assert_eq!(store.get_status(21).unwrap().0, CertStatus::Expired);
        assert_eq!(store.get_status(22).unwrap().0, CertStatus::Valid);

        // Transitions were published
        let promoted_value = bus
            .latest(&crate::status::status_pv_name(&issuer, 20))
            .unwrap();
        assert_eq!(promoted_value.status, CertStatus::Valid);
        let expired_value = bus
            .latest(&crate::status::status_pv_name(&issuer, 21))
            .unwrap();
        assert_eq!(expired_value.status, CertStatus::Expired);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let (monitor, store, _bus, _issuer, _dir) = fixture();
        let now = Utc::now().timestamp();
        insert(&store, 23, CertStatus::Valid, now - 3_600, now - 1);

        assert_eq!(monitor.sweep(now), (0, 1));
        assert_eq!(monitor.sweep(now), (0, 0));
        assert_eq!(store.get_status(23).unwrap().0, CertStatus::Expired);
    }

    #[test]
    fn test_pending_before_window_stays_pending() {
        let (monitor, store, _bus, _issuer, _dir) = fixture();
        let now = Utc::now().timestamp();
        insert(&store, 24, CertStatus::Pending, now + 600, now + 3_600);

        assert_eq!(monitor.sweep(now), (0, 0));
        assert_eq!(store.get_status(24).unwrap().0, CertStatus::Pending);
    }
}
