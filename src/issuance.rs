//! Certificate issuance pipeline.
//!
//! Takes certificate creation requests off the management channel, runs
//! them through validation and the registered authentication method,
//! computes the initial lifecycle state from the approval policy, persists
//! the record, and either signs immediately or parks the request for admin
//! approval. The initial status is published either way.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{AuthRegistry, MethodClass};
use crate::cert_factory::{usage, usage_is_recognized, usage_to_string, CaMaterial, CertFactory};
use crate::crypto::{public_key_from_pem, ski_hex};
use crate::error::{CmsError, CmsResult};
use crate::status::CertStatus;
use crate::status_publisher::{PendingRequest, StatusPublisher};
use crate::store::{CertRecord, CertStore};

/// Requested validity may reach back one day and forward ten years.
const MAX_BACKDATE_SECS: i64 = 86_400;
const MAX_VALIDITY_SECS: i64 = 10 * 365 * 86_400;

/// A certificate creation request as it arrives over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertCreationRequest {
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub organization_unit: String,
    /// Authentication method type name.
    #[serde(rename = "type")]
    pub auth_type: String,
    pub usage: u16,
    pub not_before: i64,
    pub not_after: i64,
    /// PEM-encoded public key; the private half stays with the requester.
    pub pub_key: Vec<u8>,
    /// Method-specific verifier fields.
    #[serde(default)]
    pub verifier: BTreeMap<String, String>,
}

/// What the requester gets back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceResponse {
    pub serial: u64,
    pub status: CertStatus,
    /// Where to watch for approval and later lifecycle changes.
    pub status_pv_uri: String,
    /// The signed bundle, present only when the certificate was issued
    /// immediately.
    pub cert_pem: Option<String>,
}

/// Per-role admin approval switches for basic-class methods.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub client_require_approval: bool,
    pub server_require_approval: bool,
    pub gateway_require_approval: bool,
    /// Stamp the status-PV extension into issued certificates.
    pub status_subscription: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        ApprovalPolicy {
            client_require_approval: true,
            server_require_approval: true,
            gateway_require_approval: true,
            status_subscription: true,
        }
    }
}

impl ApprovalPolicy {
    /// Does a basic-class request for this usage need admin approval?
    fn requires_approval(&self, mask: u16) -> bool {
        if mask & usage::CA != 0 {
            // CA issuance over the request channel is always held for review
            return true;
        }
        (mask & usage::CLIENT != 0 && self.client_require_approval)
            || (mask & usage::SERVER != 0 && self.server_require_approval)
            || (mask & usage::GATEWAY != 0 && self.gateway_require_approval)
    }
}

pub struct IssuancePipeline {
    store: Arc<CertStore>,
    publisher: Arc<StatusPublisher>,
    ca: CaMaterial,
    registry: AuthRegistry,
    policy: ApprovalPolicy,
}

impl IssuancePipeline {
    pub fn new(
        store: Arc<CertStore>,
        publisher: Arc<StatusPublisher>,
        ca: CaMaterial,
        registry: AuthRegistry,
        policy: ApprovalPolicy,
    ) -> Self {
        IssuancePipeline {
            store,
            publisher,
            ca,
            registry,
            policy,
        }
    }

    /// Process one certificate creation request end to end.
    pub fn process(&self, ccr: &CertCreationRequest) -> CmsResult<IssuanceResponse> {
        self.validate(ccr)?;

        let method = self
            .registry
            .get(&ccr.auth_type)
            .ok_or_else(|| {
                CmsError::AuthReject(format!("unknown authentication type {:?}", ccr.auth_type))
            })?;
        for field in method.verifier_fields() {
            if !ccr.verifier.contains_key(*field) {
                return Err(CmsError::AuthReject(format!(
                    "authentication type {:?} requires field {field:?}",
                    ccr.auth_type
                )));
            }
        }
        let credentials = method.verify(ccr)?;

        let initial_status = match method.method_class() {
            MethodClass::Strong => CertStatus::Valid,
            MethodClass::Basic => {
                if self.policy.requires_approval(ccr.usage) {
                    CertStatus::PendingApproval
                } else {
                    CertStatus::Valid
                }
            }
        };

        let public_key = public_key_from_pem(&ccr.pub_key)?;
        let skid = ski_hex(&public_key)?;
        let serial = generate_serial()?;

        // Fast duplicate check first for a clear message; the insert below
        // re-checks inside its transaction.
        if self
            .store
            .count_dup_subject(
                &credentials.name,
                &credentials.organization,
                &credentials.organization_unit,
                &credentials.country,
            )? > 0
        {
            return Err(CmsError::Duplicate(format!(
                "a live certificate already exists for {}",
                credentials.name
            )));
        }
        if self.store.count_dup_skid(&skid)? > 0 {
            return Err(CmsError::Duplicate(format!(
                "a live certificate already exists for this key (SKID {skid})"
            )));
        }

        let now = Utc::now().timestamp();
        self.store.insert(&CertRecord {
            serial,
            skid,
            cn: credentials.name.clone(),
            o: credentials.organization.clone(),
            ou: credentials.organization_unit.clone(),
            c: credentials.country.clone(),
            not_before: ccr.not_before,
            not_after: ccr.not_after,
            status: initial_status,
            status_date: now,
        })?;

        let status_pv_uri = self.publisher.pv_name(serial);

        let cert_pem = if initial_status == CertStatus::Valid {
            let mut factory = CertFactory::new(serial, public_key)
                .common_name(&credentials.name)
                .organization(&credentials.organization)
                .organizational_unit(&credentials.organization_unit)
                .country(&credentials.country)
                .validity(ccr.not_before, ccr.not_after)
                .usage(ccr.usage)
                .issued_by(&self.ca);
            if self.policy.status_subscription {
                factory = factory.status_pv(&status_pv_uri);
            }
            Some(factory.build()?.pem_bundle)
        } else {
            self.publisher.register_pending(
                serial,
                PendingRequest {
                    pub_key_pem: ccr.pub_key.clone(),
                    usage: ccr.usage,
                },
            );
            None
        };

        self.publisher.publish_status(serial)?;
        info!(
            serial,
            cn = %credentials.name,
            usage = %usage_to_string(ccr.usage),
            status = %initial_status,
            method = %ccr.auth_type,
            "certificate request processed"
        );

        Ok(IssuanceResponse {
            serial,
            status: initial_status,
            status_pv_uri,
            cert_pem,
        })
    }

    fn validate(&self, ccr: &CertCreationRequest) -> CmsResult<()> {
        if ccr.name.is_empty() {
            return Err(CmsError::AuthReject("common name is required".into()));
        }
        if !usage_is_recognized(ccr.usage) {
            return Err(CmsError::AuthReject(format!(
                "unrecognized usage combination {:#06x}",
                ccr.usage
            )));
        }
        let now = Utc::now().timestamp();
        let earliest = now - MAX_BACKDATE_SECS;
        let latest = now + MAX_VALIDITY_SECS;
        if ccr.not_before > ccr.not_after {
            return Err(CmsError::AuthReject(
                "not_before must not be after not_after".into(),
            ));
        }
        if ccr.not_before < earliest || ccr.not_after > latest {
            return Err(CmsError::AuthReject(format!(
                "validity must lie within [now - 1 day, now + 10 years]; got [{}, {}]",
                ccr.not_before, ccr.not_after
            )));
        }
        Ok(())
    }
}

/// Random non-zero serial from the process CSPRNG.
pub fn generate_serial() -> CmsResult<u64> {
    loop {
        let mut bytes = [0u8; 8];
        openssl::rand::rand_bytes(&mut bytes)?;
        let serial = u64::from_be_bytes(bytes);
        if serial != 0 {
            return Ok(serial);
        }
    }
}
