//! Status publisher.
//!
//! Owns the per-certificate status topics. Every state transition flows
//! through here: the row is updated under the store's guard, a fresh signed
//! OCSP response is produced, and the topic's retained value is replaced.
//! Admin PUTs (approve / deny / revoke) and the expiry monitor both drive
//! the same path, so publishes always appear in commit order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use crate::bus::StatusBus;
use crate::cert_factory::{CaMaterial, CertFactory};
use crate::error::{CmsError, CmsResult};
use crate::status::{status_pv_name, CertStatus, StatusValue};
use crate::status_factory::CertStatusFactory;
use crate::store::CertStore;
use crate::tls::StapleCache;

/// Admin operations accepted on a status PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Approved,
    Denied,
    Revoked,
}

impl AdminAction {
    pub fn parse(state: &str) -> CmsResult<Self> {
        Ok(match state {
            "APPROVED" => AdminAction::Approved,
            "DENIED" => AdminAction::Denied,
            "REVOKED" => AdminAction::Revoked,
            other => {
                return Err(CmsError::Config(format!(
                    "unrecognized state {other:?}; expected APPROVED, DENIED or REVOKED"
                )))
            }
        })
    }
}

/// Key material parked while a request waits for admin approval. Only the
/// requester holds the private key; this is the public half plus the
/// requested usage, enough to sign once approval lands.
pub struct PendingRequest {
    pub pub_key_pem: Vec<u8>,
    pub usage: u16,
}

pub struct StatusPublisher {
    store: Arc<CertStore>,
    factory: CertStatusFactory,
    bus: Arc<dyn StatusBus>,
    ca: CaMaterial,
    issuer_id: String,
    /// Common names allowed to approve, deny, and revoke.
    admins: Vec<String>,
    /// Stamp the status-PV extension into certificates signed on approval.
    status_subscription: bool,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    staple: Arc<StapleCache>,
    staple_serial: Mutex<Option<u64>>,
}

impl StatusPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CertStore>,
        factory: CertStatusFactory,
        bus: Arc<dyn StatusBus>,
        ca: CaMaterial,
        issuer_id: String,
        admins: Vec<String>,
        status_subscription: bool,
        staple: Arc<StapleCache>,
    ) -> Self {
        StatusPublisher {
            store,
            factory,
            bus,
            ca,
            issuer_id,
            admins,
            status_subscription,
            pending: Mutex::new(HashMap::new()),
            staple,
            staple_serial: Mutex::new(None),
        }
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    pub fn pv_name(&self, serial: u64) -> String {
        status_pv_name(&self.issuer_id, serial)
    }

    /// Park the public key of a request awaiting approval.
    pub fn register_pending(&self, serial: u64, request: PendingRequest) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(serial, request);
    }

    /// Mark which serial is this server's own certificate; its published
    /// status feeds the TLS stapling cache.
    pub fn set_staple_serial(&self, serial: u64) {
        *self.staple_serial.lock().expect("staple serial lock poisoned") = Some(serial);
    }

    /// Sign the current status of `serial` and replace the topic's retained
    /// value with it.
    pub fn publish_status(&self, serial: u64) -> CmsResult<StatusValue> {
        self.publish_with_pem(serial, None)
    }

    fn publish_with_pem(&self, serial: u64, cert_pem: Option<String>) -> CmsResult<StatusValue> {
        let (status, status_date) = self.store.get_status(serial)?;
        let revocation_date = (status == CertStatus::Revoked).then_some(status_date);
        let cert_status = self
            .factory
            .create_status(serial, status, status_date, revocation_date)?;

        if *self.staple_serial.lock().expect("staple serial lock poisoned") == Some(serial)
            && self.staple.replace(&cert_status.ocsp_bytes)
        {
            info!(serial, "refreshed stapling cache");
        }

        let mut value = StatusValue::new(serial, &cert_status);
        value.cert_pem = cert_pem;
        self.bus.publish(&self.pv_name(serial), value.clone());
        Ok(value)
    }

    /// GET on a status PV: the retained value, published fresh if the topic
    /// has never carried one.
    pub fn get_status_value(&self, serial: u64) -> CmsResult<StatusValue> {
        if let Some(value) = self.bus.latest(&self.pv_name(serial)) {
            return Ok(value);
        }
        self.publish_status(serial)
    }

    /// PUT on a status PV. `requester` is the authenticated common name of
    /// the caller; only configured administrators may transition state.
    pub fn put_state(
        &self,
        serial: u64,
        action: AdminAction,
        requester: &str,
    ) -> CmsResult<StatusValue> {
        if !self.admins.iter().any(|cn| cn == requester) {
            return Err(CmsError::AuthReject(format!(
                "{requester:?} is not a certificate administrator"
            )));
        }

        let now = Utc::now().timestamp();
        match action {
            AdminAction::Approved => {
                let rec = self.store.get_record(serial)?;
                let target = if rec.not_before <= now && now < rec.not_after {
                    CertStatus::Valid
                } else {
                    CertStatus::Pending
                };
                self.store.set_status(
                    serial,
                    target,
                    &[CertStatus::PendingApproval],
                    now,
                )?;
                info!(serial, status = %target, approved_by = requester, "certificate approved");

                let pem = match self.sign_approved(serial) {
                    Ok(pem) => pem,
                    Err(e) => {
                        warn!(serial, error = %e, "approved but unable to sign certificate");
                        None
                    }
                };
                self.publish_with_pem(serial, pem)
            }
            AdminAction::Denied => {
                self.store.set_status(
                    serial,
                    CertStatus::Revoked,
                    &[CertStatus::PendingApproval],
                    now,
                )?;
                self.pending.lock().expect("pending lock poisoned").remove(&serial);
                info!(serial, denied_by = requester, "certificate request denied");
                self.publish_status(serial)
            }
            AdminAction::Revoked => {
                self.store.set_status(
                    serial,
                    CertStatus::Revoked,
                    &[
                        CertStatus::PendingApproval,
                        CertStatus::Pending,
                        CertStatus::Valid,
                    ],
                    now,
                )?;
                self.pending.lock().expect("pending lock poisoned").remove(&serial);
                info!(serial, revoked_by = requester, "certificate revoked");
                self.publish_status(serial)
            }
        }
    }

    /// Sign the certificate for a just-approved request, if its public key
    /// is still parked here.
    fn sign_approved(&self, serial: u64) -> CmsResult<Option<String>> {
        let parked = self.pending.lock().expect("pending lock poisoned").remove(&serial);
        let parked = match parked {
            Some(p) => p,
            None => return Ok(None),
        };
        let rec = self.store.get_record(serial)?;
        let public_key = crate::crypto::public_key_from_pem(&parked.pub_key_pem)?;

        let mut factory = CertFactory::new(serial, public_key)
            .common_name(&rec.cn)
            .organization(&rec.o)
            .organizational_unit(&rec.ou)
            .country(&rec.c)
            .validity(rec.not_before, rec.not_after)
            .usage(parked.usage)
            .issued_by(&self.ca);
        if self.status_subscription {
            let pv = self.pv_name(serial);
            factory = factory.status_pv(&pv);
        }
        Ok(Some(factory.build()?.pem_bundle))
    }

    /// Republish every live record so topics carry retained values after a
    /// restart.
    pub fn prime(&self) -> CmsResult<usize> {
        let records = self.store.live_records()?;
        let mut published = 0;
        for rec in &records {
            match self.publish_status(rec.serial) {
                Ok(_) => published += 1,
                Err(e) => warn!(serial = rec.serial, error = %e, "unable to republish status"),
            }
        }
        Ok(published)
    }
}
