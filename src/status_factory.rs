//! Signed status response factory.
//!
//! Turns a `(serial, status, dates)` triple into a full `CertificateStatus`
//! whose OCSP bytes are signed by the CA. Every published status and every
//! stapled handshake payload comes from here.

use crate::cert_factory::CaMaterial;
use crate::error::{CmsError, CmsResult};
use crate::ocsp::{build_signed_response, OcspEntry};
use crate::status::{CertStatus, CertificateStatus, StatusDate};

pub struct CertStatusFactory {
    ca: CaMaterial,
    /// Minutes a signed status stays valid before peers must re-fetch.
    cert_status_validity_mins: u32,
}

impl CertStatusFactory {
    pub fn new(ca: CaMaterial, cert_status_validity_mins: u32) -> Self {
        CertStatusFactory {
            ca,
            cert_status_validity_mins,
        }
    }

    /// Validity window length in seconds.
    pub fn validity_secs(&self) -> i64 {
        i64::from(self.cert_status_validity_mins) * 60
    }

    /// Build and sign the status response for one certificate.
    ///
    /// `thisUpdate` is the status date and `nextUpdate` is the status date
    /// plus the configured validity. REVOKED entries must carry a
    /// revocation date.
    pub fn create_status(
        &self,
        serial: u64,
        status: CertStatus,
        status_date: i64,
        revocation_date: Option<i64>,
    ) -> CmsResult<CertificateStatus> {
        let ocsp_status = status.ocsp_status();
        if status == CertStatus::Revoked && revocation_date.is_none() {
            return Err(CmsError::Config(format!(
                "revocation date is required to publish REVOKED status for serial {serial}"
            )));
        }

        let valid_until = status_date + self.validity_secs();
        let entry = OcspEntry {
            serial,
            status: ocsp_status,
            this_update: status_date,
            next_update: valid_until,
            revocation_time: if status == CertStatus::Revoked {
                revocation_date
            } else {
                None
            },
        };
        let ocsp_bytes = build_signed_response(&self.ca.cert, &self.ca.key, &self.ca.chain, &entry)?;

        Ok(CertificateStatus {
            status,
            ocsp_status,
            status_date: StatusDate::new(status_date),
            valid_until_date: StatusDate::new(valid_until),
            revocation_date: entry.revocation_time.map(StatusDate::new),
            ocsp_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_factory::{usage, CertFactory};
    use crate::crypto::KeyPair;
    use crate::ocsp::{parse_and_verify, VerifyOptions};
    use crate::status::OcspCertStatus;
    use chrono::Utc;

    fn make_factory(mins: u32) -> CertStatusFactory {
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let signed = CertFactory::new(1, kp.public_key().unwrap())
            .common_name("Status Test CA")
            .validity(now - 60, now + 86_400)
            .usage(usage::CA)
            .self_signed(kp.pkey.clone())
            .build()
            .unwrap();
        let ca = CaMaterial {
            cert: signed.cert,
            key: kp.pkey,
            chain: Vec::new(),
        };
        CertStatusFactory::new(ca, mins)
    }

    #[test]
    fn test_valid_status_window() {
        let factory = make_factory(30);
        let now = Utc::now().timestamp();
        let cs = factory
            .create_status(42, CertStatus::Valid, now, None)
            .unwrap();
        assert_eq!(cs.ocsp_status, OcspCertStatus::Good);
        assert_eq!(cs.valid_until_date.t - cs.status_date.t, 30 * 60);
        assert!(cs.is_good());

        let verified = parse_and_verify(
            &cs.ocsp_bytes,
            &VerifyOptions {
                allow_self_signed_ca: true,
                trusted_ca_dir: None,
            },
        )
        .unwrap();
        assert_eq!(verified.serial, 42);
        assert_eq!(verified.status, OcspCertStatus::Good);
        assert_eq!(verified.next_update - verified.this_update, 30 * 60);
    }

    #[test]
    fn test_pending_maps_to_unknown() {
        let factory = make_factory(30);
        let now = Utc::now().timestamp();
        let cs = factory
            .create_status(43, CertStatus::PendingApproval, now, None)
            .unwrap();
        assert_eq!(cs.ocsp_status, OcspCertStatus::Unknown);
        assert!(cs.is_valid());
        assert!(!cs.is_good());
    }

    #[test]
    fn test_revoked_requires_date() {
        let factory = make_factory(30);
        let now = Utc::now().timestamp();
        assert!(factory
            .create_status(44, CertStatus::Revoked, now, None)
            .is_err());

        let cs = factory
            .create_status(44, CertStatus::Revoked, now, Some(now))
            .unwrap();
        assert_eq!(cs.ocsp_status, OcspCertStatus::Revoked);
        assert_eq!(cs.revocation_date.as_ref().map(|d| d.t), Some(now));
        assert!(!cs.is_good());
    }

    #[test]
    fn test_configured_validity_is_respected() {
        let factory = make_factory(5);
        let now = Utc::now().timestamp();
        let cs = factory
            .create_status(45, CertStatus::Valid, now, None)
            .unwrap();
        assert_eq!(cs.valid_until_date.t - cs.status_date.t, 5 * 60);
    }
}
