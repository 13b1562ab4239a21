//! Certificate status model.
//!
//! Two status vocabularies meet here: the PVA certificate lifecycle
//! (`CertStatus`) that the service tracks in its database, and the OCSP
//! vocabulary (`OcspCertStatus`) that travels inside signed responses.
//! The mapping between them is fixed: VALID certificates are GOOD, REVOKED
//! certificates are REVOKED, and everything else is UNKNOWN.
//!
//! Status dates carry both an epoch-seconds value and a canonical UTC string
//! rendering. The string form appears in the published structure for human
//! consumption and cross-checking; all comparisons use the epoch value.

use chrono::{NaiveDateTime, TimeZone, Utc};
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};

use crate::error::{CmsError, CmsResult};

/// Root of every certificate status PV name.
pub const CERT_STATUS_PREFIX: &str = "CERT:STATUS";

/// strftime-style layout of the canonical status date string.
pub const CERT_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y UTC";

/// Lifecycle state of an issued certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertStatus {
    Unknown,
    PendingApproval,
    Pending,
    Valid,
    Expired,
    Revoked,
}

impl CertStatus {
    /// Integer form stored in the `status` column.
    pub fn as_i64(self) -> i64 {
        match self {
            CertStatus::Unknown => 0,
            CertStatus::PendingApproval => 1,
            CertStatus::Pending => 2,
            CertStatus::Valid => 3,
            CertStatus::Expired => 4,
            CertStatus::Revoked => 5,
        }
    }

    pub fn from_i64(value: i64) -> CmsResult<Self> {
        Ok(match value {
            0 => CertStatus::Unknown,
            1 => CertStatus::PendingApproval,
            2 => CertStatus::Pending,
            3 => CertStatus::Valid,
            4 => CertStatus::Expired,
            5 => CertStatus::Revoked,
            other => {
                return Err(CmsError::CryptoParse(format!(
                    "unrecognized certificate status code {other}"
                )))
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CertStatus::Unknown => "UNKNOWN",
            CertStatus::PendingApproval => "PENDING_APPROVAL",
            CertStatus::Pending => "PENDING",
            CertStatus::Valid => "VALID",
            CertStatus::Expired => "EXPIRED",
            CertStatus::Revoked => "REVOKED",
        }
    }

    /// Statuses whose records participate in the uniqueness invariants.
    pub fn live_set() -> [CertStatus; 3] {
        [
            CertStatus::PendingApproval,
            CertStatus::Pending,
            CertStatus::Valid,
        ]
    }

    /// OCSP status published for a certificate in this state.
    pub fn ocsp_status(self) -> OcspCertStatus {
        match self {
            CertStatus::Valid => OcspCertStatus::Good,
            CertStatus::Revoked => OcspCertStatus::Revoked,
            _ => OcspCertStatus::Unknown,
        }
    }
}

impl std::fmt::Display for CertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OCSP certificate status carried in signed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcspCertStatus {
    #[serde(rename = "OCSP_GOOD")]
    Good,
    #[serde(rename = "OCSP_REVOKED")]
    Revoked,
    #[serde(rename = "OCSP_UNKNOWN")]
    Unknown,
}

impl OcspCertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OcspCertStatus::Good => "OCSP_GOOD",
            OcspCertStatus::Revoked => "OCSP_REVOKED",
            OcspCertStatus::Unknown => "OCSP_UNKNOWN",
        }
    }
}

impl std::fmt::Display for OcspCertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in time with its canonical UTC string rendering.
///
/// Equality compares only the epoch value; the string exists for display and
/// for the cross-check a client performs on published structures.
#[derive(Debug, Clone)]
pub struct StatusDate {
    pub t: i64,
    pub s: String,
}

impl StatusDate {
    pub fn new(t: i64) -> Self {
        StatusDate {
            t,
            s: format_cert_time(t),
        }
    }

    pub fn now() -> Self {
        StatusDate::new(Utc::now().timestamp())
    }

    /// Parse the canonical string form back into a date.
    pub fn parse(s: &str) -> CmsResult<Self> {
        let naive = NaiveDateTime::parse_from_str(s, CERT_TIME_FORMAT)
            .map_err(|e| CmsError::CryptoParse(format!("bad status date {s:?}: {e}")))?;
        Ok(StatusDate::new(naive.and_utc().timestamp()))
    }
}

impl PartialEq for StatusDate {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t
    }
}
impl Eq for StatusDate {}

impl From<i64> for StatusDate {
    fn from(t: i64) -> Self {
        StatusDate::new(t)
    }
}

/// Render epoch seconds in the canonical UTC form.
pub fn format_cert_time(t: i64) -> String {
    match Utc.timestamp_opt(t, 0).single() {
        Some(dt) => dt.format(CERT_TIME_FORMAT).to_string(),
        None => String::new(),
    }
}

/// Full status of one certificate: lifecycle state, OCSP state, the dates
/// certified by the signed response, and the signed response itself.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateStatus {
    pub status: CertStatus,
    pub ocsp_status: OcspCertStatus,
    pub status_date: StatusDate,
    pub valid_until_date: StatusDate,
    pub revocation_date: Option<StatusDate>,
    /// DER-encoded signed OCSP response; empty only for locally-synthesized
    /// UNKNOWN placeholders.
    pub ocsp_bytes: Vec<u8>,
}

impl CertificateStatus {
    /// Placeholder status used when nothing verified is known about a peer.
    pub fn unknown() -> Self {
        CertificateStatus {
            status: CertStatus::Unknown,
            ocsp_status: OcspCertStatus::Unknown,
            status_date: StatusDate::new(0),
            valid_until_date: StatusDate::new(0),
            revocation_date: None,
            ocsp_bytes: Vec::new(),
        }
    }

    /// The status is still inside its certified validity window.
    pub fn is_valid(&self) -> bool {
        Utc::now().timestamp() < self.valid_until_date.t
    }

    /// Valid and GOOD; the only answer that lets a TLS peer through.
    pub fn is_good(&self) -> bool {
        self.is_valid() && self.ocsp_status == OcspCertStatus::Good
    }

    fn self_consistent(&self) -> bool {
        self.status.ocsp_status() == self.ocsp_status
    }
}

/// The structure published on a certificate's status PV.
///
/// Enum fields travel with their string rendition alongside so that generic
/// monitoring clients display something useful; the `ocsp_response` bytes are
/// the only part a verifying client ultimately trusts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusValue {
    pub status: CertStatus,
    pub serial: u64,
    pub state: String,
    pub ocsp_status: OcspCertStatus,
    pub ocsp_state: String,
    pub ocsp_status_date: String,
    pub ocsp_certified_until: String,
    pub ocsp_revocation_date: String,
    pub ocsp_response: Vec<u8>,
    /// Present only on the publish that follows an admin approval: the
    /// freshly signed PEM bundle for the requester to collect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
}

impl StatusValue {
    pub fn new(serial: u64, cs: &CertificateStatus) -> Self {
        StatusValue {
            status: cs.status,
            serial,
            state: cs.status.as_str().to_string(),
            ocsp_status: cs.ocsp_status,
            ocsp_state: cs.ocsp_status.as_str().to_string(),
            ocsp_status_date: cs.status_date.s.clone(),
            ocsp_certified_until: cs.valid_until_date.s.clone(),
            ocsp_revocation_date: cs
                .revocation_date
                .as_ref()
                .map(|d| d.s.clone())
                .unwrap_or_default(),
            ocsp_response: cs.ocsp_bytes.clone(),
            cert_pem: None,
        }
    }

    /// Reconstruct a `CertificateStatus` from a published value, rejecting
    /// structures whose plain fields disagree with each other.
    ///
    /// This does *not* verify the OCSP signature; callers that care feed
    /// `ocsp_response` through the OCSP verifier and compare against the
    /// certified result.
    pub fn to_certificate_status(&self) -> CmsResult<CertificateStatus> {
        if self.status.ocsp_status() != self.ocsp_status {
            return Err(CmsError::CryptoParse(format!(
                "published status {} does not match OCSP status {}",
                self.status, self.ocsp_status
            )));
        }
        let status_date = StatusDate::parse(&self.ocsp_status_date)?;
        let valid_until_date = StatusDate::parse(&self.ocsp_certified_until)?;
        let revocation_date = if self.ocsp_revocation_date.is_empty() {
            None
        } else {
            Some(StatusDate::parse(&self.ocsp_revocation_date)?)
        };
        let cs = CertificateStatus {
            status: self.status,
            ocsp_status: self.ocsp_status,
            status_date,
            valid_until_date,
            revocation_date,
            ocsp_bytes: self.ocsp_response.clone(),
        };
        if !cs.self_consistent() {
            return Err(CmsError::CryptoParse(
                "published status is not self-consistent".into(),
            ));
        }
        Ok(cs)
    }
}

/// First 8 hex digits of a certificate's Subject Key Identifier, used as the
/// short issuer handle in status PV names.
pub fn issuer_id(cert: &X509Ref) -> CmsResult<String> {
    let mut id = crate::crypto::cert_ski_hex(cert)
        .ok_or_else(|| CmsError::CryptoParse("certificate has no subject key identifier".into()))?;
    id.truncate(8);
    Ok(id)
}

/// Status PV name for one certificate: `CERT:STATUS:<issuer_id>:<serial>`
/// with the serial rendered as 16 lower-case hex digits.
pub fn status_pv_name(issuer_id: &str, serial: u64) -> String {
    format!("{CERT_STATUS_PREFIX}:{issuer_id}:{serial:016x}")
}

/// Split a status PV name back into its issuer id and serial.
pub fn parse_status_pv_name(pv: &str) -> CmsResult<(String, u64)> {
    let rest = pv
        .strip_prefix(CERT_STATUS_PREFIX)
        .and_then(|r| r.strip_prefix(':'))
        .ok_or_else(|| CmsError::CryptoParse(format!("not a status PV name: {pv}")))?;
    let (issuer, serial_hex) = rest
        .split_once(':')
        .ok_or_else(|| CmsError::CryptoParse(format!("status PV missing serial: {pv}")))?;
    let serial = u64::from_str_radix(serial_hex, 16)
        .map_err(|e| CmsError::CryptoParse(format!("bad serial in status PV {pv}: {e}")))?;
    Ok((issuer.to_string(), serial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(CertStatus::Valid.ocsp_status(), OcspCertStatus::Good);
        assert_eq!(CertStatus::Revoked.ocsp_status(), OcspCertStatus::Revoked);
        for s in [
            CertStatus::Unknown,
            CertStatus::PendingApproval,
            CertStatus::Pending,
            CertStatus::Expired,
        ] {
            assert_eq!(s.ocsp_status(), OcspCertStatus::Unknown);
        }
    }

    #[test]
    fn test_status_db_roundtrip() {
        for s in [
            CertStatus::Unknown,
            CertStatus::PendingApproval,
            CertStatus::Pending,
            CertStatus::Valid,
            CertStatus::Expired,
            CertStatus::Revoked,
        ] {
            assert_eq!(CertStatus::from_i64(s.as_i64()).unwrap(), s);
        }
        assert!(CertStatus::from_i64(42).is_err());
    }

    #[test]
    fn test_status_date_format() {
        // 2024-02-29 12:00:00 UTC, a leap day
        let d = StatusDate::new(1_709_208_000);
        assert_eq!(d.s, "Thu Feb 29 12:00:00 2024 UTC");
    }

    #[test]
    fn test_status_date_roundtrip() {
        for t in [0i64, 1, 86_399, 951_827_696, 1_709_208_000, 2_147_483_647] {
            let d = StatusDate::new(t);
            let parsed = StatusDate::parse(&d.s).unwrap();
            assert_eq!(parsed.t, t, "roundtrip failed for {t} ({})", d.s);
        }
    }

    #[test]
    fn test_pv_name_roundtrip() {
        let pv = status_pv_name("27975e6b", 0x7246);
        assert_eq!(pv, "CERT:STATUS:27975e6b:0000000000007246");
        let (issuer, serial) = parse_status_pv_name(&pv).unwrap();
        assert_eq!(issuer, "27975e6b");
        assert_eq!(serial, 0x7246);

        assert!(parse_status_pv_name("SOMETHING:ELSE").is_err());
        assert!(parse_status_pv_name("CERT:STATUS:abcd1234:nothex").is_err());
    }

    #[test]
    fn test_status_value_consistency() {
        let cs = CertificateStatus {
            status: CertStatus::Valid,
            ocsp_status: OcspCertStatus::Good,
            status_date: StatusDate::new(1_700_000_000),
            valid_until_date: StatusDate::new(1_700_001_800),
            revocation_date: None,
            ocsp_bytes: vec![1, 2, 3],
        };
        let value = StatusValue::new(7, &cs);
        let back = value.to_certificate_status().unwrap();
        assert_eq!(back.status, CertStatus::Valid);
        assert_eq!(back.status_date, cs.status_date);
        assert_eq!(back.valid_until_date, cs.valid_until_date);
        assert_eq!(back.ocsp_bytes, vec![1, 2, 3]);

        // A mismatched pair must be rejected
        let mut bad = StatusValue::new(7, &cs);
        bad.ocsp_status = OcspCertStatus::Revoked;
        assert!(bad.to_certificate_status().is_err());
    }

    #[test]
    fn test_status_value_serde_roundtrip() {
        let cs = CertificateStatus {
            status: CertStatus::Revoked,
            ocsp_status: OcspCertStatus::Revoked,
            status_date: StatusDate::new(1_700_000_000),
            valid_until_date: StatusDate::new(1_700_001_800),
            revocation_date: Some(StatusDate::new(1_699_999_999)),
            ocsp_bytes: vec![0x30, 0x82, 0x01, 0x00],
        };
        let value = StatusValue::new(9, &cs);
        let json = serde_json::to_string(&value).unwrap();
        // Wire form uses the SCREAMING names
        assert!(json.contains("\"REVOKED\""));
        assert!(json.contains("\"OCSP_REVOKED\""));

        let back: StatusValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, CertStatus::Revoked);
        assert_eq!(back.ocsp_status, OcspCertStatus::Revoked);
        assert_eq!(back.serial, 9);
        assert_eq!(back.ocsp_response, value.ocsp_response);
        assert_eq!(
            back.to_certificate_status().unwrap(),
            value.to_certificate_status().unwrap()
        );
    }

    #[test]
    fn test_unknown_status_is_not_good() {
        let unknown = CertificateStatus::unknown();
        assert!(!unknown.is_valid());
        assert!(!unknown.is_good());
    }
}
