//! OCSP response construction and verification.
//!
//! The service signs one-entry OCSP responses with the CA key; clients
//! verify them against their trust store before believing any published
//! status. OpenSSL's OCSP response *builder* has no safe Rust binding, so
//! this module declares the needed entry points itself and keeps every raw
//! pointer behind a drop guard. Nothing unsafe escapes this file.

use std::os::raw::{c_int, c_long, c_ulong};
use std::path::PathBuf;
use std::ptr;

use foreign_types::{ForeignType, ForeignTypeRef};
use openssl::asn1::Asn1TimeRef;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Private};
use openssl::ssl::SslFiletype;
use openssl::stack::{Stack, StackRef};
use openssl::x509::store::{X509Lookup, X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509Ref, X509StoreContext, X509VerifyResult, X509};

use crate::crypto::{asn1_time_to_unix, unix_to_asn1_time};
use crate::error::{CmsError, CmsResult};
use crate::status::OcspCertStatus;

const V_OCSP_CERTSTATUS_GOOD: c_int = 0;
const V_OCSP_CERTSTATUS_REVOKED: c_int = 1;
const V_OCSP_CERTSTATUS_UNKNOWN: c_int = 2;
const OCSP_RESPONSE_STATUS_SUCCESSFUL: c_int = 0;

/// Allowed clock skew when checking a response's validity window.
const OCSP_VALIDITY_LEEWAY_SECS: c_long = 5;

mod sys {
    use super::*;
    use openssl_sys::{
        stack_st_X509, ASN1_INTEGER, ASN1_TIME, BIGNUM, EVP_MD, EVP_PKEY, OCSP_BASICRESP,
        OCSP_CERTID, OCSP_RESPONSE, X509, X509_NAME, X509_STORE,
    };

    // Not exposed by openssl-sys; opaque here, only ever handled by pointer.
    #[allow(non_camel_case_types)]
    pub enum OCSP_SINGLERESP {}

    extern "C" {
        pub fn OCSP_BASICRESP_new() -> *mut OCSP_BASICRESP;
        pub fn OCSP_BASICRESP_free(bs: *mut OCSP_BASICRESP);
        pub fn OCSP_RESPONSE_free(resp: *mut OCSP_RESPONSE);
        pub fn OCSP_CERTID_free(id: *mut OCSP_CERTID);

        // ASN1_BIT_STRING and ASN1_OCTET_STRING are typedefs of ASN1_STRING
        // in OpenSSL; declared as such here.
        pub fn OCSP_cert_id_new(
            dgst: *const EVP_MD,
            issuer_name: *const X509_NAME,
            issuer_key: *const openssl_sys::ASN1_STRING,
            serial: *const ASN1_INTEGER,
        ) -> *mut OCSP_CERTID;

        pub fn OCSP_basic_add1_status(
            rsp: *mut OCSP_BASICRESP,
            cid: *mut OCSP_CERTID,
            status: c_int,
            reason: c_int,
            revtime: *mut ASN1_TIME,
            thisupd: *mut ASN1_TIME,
            nextupd: *mut ASN1_TIME,
        ) -> *mut OCSP_SINGLERESP;

        pub fn OCSP_basic_sign(
            brsp: *mut OCSP_BASICRESP,
            signer: *mut X509,
            key: *mut EVP_PKEY,
            dgst: *const EVP_MD,
            certs: *mut stack_st_X509,
            flags: c_ulong,
        ) -> c_int;

        pub fn OCSP_response_create(status: c_int, bs: *mut OCSP_BASICRESP)
            -> *mut OCSP_RESPONSE;

        pub fn i2d_OCSP_RESPONSE(resp: *mut OCSP_RESPONSE, out: *mut *mut u8) -> c_int;
        pub fn d2i_OCSP_RESPONSE(
            out: *mut *mut OCSP_RESPONSE,
            input: *mut *const u8,
            len: c_long,
        ) -> *mut OCSP_RESPONSE;

        pub fn OCSP_response_status(resp: *mut OCSP_RESPONSE) -> c_int;
        pub fn OCSP_response_get1_basic(resp: *mut OCSP_RESPONSE) -> *mut OCSP_BASICRESP;

        pub fn OCSP_resp_get0_signer(
            bs: *mut OCSP_BASICRESP,
            signer: *mut *mut X509,
            extra_certs: *mut stack_st_X509,
        ) -> c_int;
        pub fn OCSP_resp_get0_certs(bs: *const OCSP_BASICRESP) -> *mut stack_st_X509;
        pub fn OCSP_resp_get0(bs: *mut OCSP_BASICRESP, idx: c_int) -> *mut OCSP_SINGLERESP;
        pub fn OCSP_SINGLERESP_get0_id(single: *const OCSP_SINGLERESP) -> *const OCSP_CERTID;

        pub fn OCSP_single_get0_status(
            single: *mut OCSP_SINGLERESP,
            reason: *mut c_int,
            revtime: *mut *mut ASN1_TIME,
            thisupd: *mut *mut ASN1_TIME,
            nextupd: *mut *mut ASN1_TIME,
        ) -> c_int;

        pub fn OCSP_id_get0_info(
            name_hash: *mut *mut openssl_sys::ASN1_STRING,
            md: *mut *mut openssl_sys::ASN1_OBJECT,
            key_hash: *mut *mut openssl_sys::ASN1_STRING,
            serial: *mut *mut ASN1_INTEGER,
            cid: *mut OCSP_CERTID,
        ) -> c_int;

        pub fn OCSP_check_validity(
            thisupd: *mut ASN1_TIME,
            nextupd: *mut ASN1_TIME,
            sec: c_long,
            maxsec: c_long,
        ) -> c_int;

        pub fn OCSP_basic_verify(
            bs: *mut OCSP_BASICRESP,
            certs: *mut stack_st_X509,
            st: *mut X509_STORE,
            flags: c_ulong,
        ) -> c_int;

        pub fn X509_get0_pubkey_bitstr(x: *const X509) -> *mut openssl_sys::ASN1_STRING;
        pub fn ASN1_INTEGER_to_BN(
            ai: *const ASN1_INTEGER,
            bn: *mut BIGNUM,
        ) -> *mut BIGNUM;
    }
}

struct BasicRespGuard(*mut openssl_sys::OCSP_BASICRESP);
impl Drop for BasicRespGuard {
    fn drop(&mut self) {
        unsafe { sys::OCSP_BASICRESP_free(self.0) }
    }
}

struct ResponseGuard(*mut openssl_sys::OCSP_RESPONSE);
impl Drop for ResponseGuard {
    fn drop(&mut self) {
        unsafe { sys::OCSP_RESPONSE_free(self.0) }
    }
}

struct CertIdGuard(*mut openssl_sys::OCSP_CERTID);
impl Drop for CertIdGuard {
    fn drop(&mut self) {
        unsafe { sys::OCSP_CERTID_free(self.0) }
    }
}

fn ocsp_status_to_int(status: OcspCertStatus) -> c_int {
    match status {
        OcspCertStatus::Good => V_OCSP_CERTSTATUS_GOOD,
        OcspCertStatus::Revoked => V_OCSP_CERTSTATUS_REVOKED,
        OcspCertStatus::Unknown => V_OCSP_CERTSTATUS_UNKNOWN,
    }
}

fn ocsp_status_from_int(status: c_int) -> CmsResult<OcspCertStatus> {
    Ok(match status {
        V_OCSP_CERTSTATUS_GOOD => OcspCertStatus::Good,
        V_OCSP_CERTSTATUS_REVOKED => OcspCertStatus::Revoked,
        V_OCSP_CERTSTATUS_UNKNOWN => OcspCertStatus::Unknown,
        other => {
            return Err(CmsError::CryptoParse(format!(
                "unrecognized OCSP certificate status {other}"
            )))
        }
    })
}

/// The single entry of a status response to be signed.
#[derive(Debug, Clone)]
pub struct OcspEntry {
    pub serial: u64,
    pub status: OcspCertStatus,
    pub this_update: i64,
    pub next_update: i64,
    pub revocation_time: Option<i64>,
}

/// Build and sign a one-entry OCSP response with the CA key.
///
/// The response embeds the signer certificate and the supplied chain so a
/// verifier can rebuild the path to its trust anchors.
pub fn build_signed_response(
    ca_cert: &X509Ref,
    ca_key: &PKeyRef<Private>,
    ca_chain: &[X509],
    entry: &OcspEntry,
) -> CmsResult<Vec<u8>> {
    if entry.status == OcspCertStatus::Revoked && entry.revocation_time.is_none() {
        return Err(CmsError::CryptoParse(
            "revocation time is required for a REVOKED entry".into(),
        ));
    }

    let serial_bn = BigNum::from_dec_str(&entry.serial.to_string())?;
    let serial_asn1 = serial_bn.to_asn1_integer()?;
    let this_update = unix_to_asn1_time(entry.this_update)?;
    let next_update = unix_to_asn1_time(entry.next_update)?;
    let revocation = match entry.revocation_time {
        Some(t) => Some(unix_to_asn1_time(t)?),
        None => None,
    };

    let mut extra = Stack::new()?;
    for c in ca_chain {
        extra.push(c.clone())?;
    }

    unsafe {
        let basic = BasicRespGuard(sys::OCSP_BASICRESP_new());
        if basic.0.is_null() {
            return Err(CmsError::CryptoParse("cannot allocate OCSP response".into()));
        }

        let cert_id = CertIdGuard(sys::OCSP_cert_id_new(
            MessageDigest::sha1().as_ptr(),
            openssl_sys::X509_get_subject_name(ca_cert.as_ptr()),
            sys::X509_get0_pubkey_bitstr(ca_cert.as_ptr()),
            serial_asn1.as_ptr(),
        ));
        if cert_id.0.is_null() {
            return Err(CmsError::CryptoParse("cannot build OCSP cert id".into()));
        }

        let single = sys::OCSP_basic_add1_status(
            basic.0,
            cert_id.0,
            ocsp_status_to_int(entry.status),
            0,
            revocation
                .as_ref()
                .map(|t| t.as_ptr())
                .unwrap_or(ptr::null_mut()),
            this_update.as_ptr(),
            next_update.as_ptr(),
        );
        if single.is_null() {
            return Err(CmsError::CryptoParse("cannot add OCSP status entry".into()));
        }

        if sys::OCSP_basic_sign(
            basic.0,
            ca_cert.as_ptr(),
            ca_key.as_ptr(),
            MessageDigest::sha256().as_ptr(),
            extra.as_ptr(),
            0,
        ) != 1
        {
            return Err(CmsError::CryptoParse("cannot sign OCSP response".into()));
        }

        let response = ResponseGuard(sys::OCSP_response_create(
            OCSP_RESPONSE_STATUS_SUCCESSFUL,
            basic.0,
        ));
        if response.0.is_null() {
            return Err(CmsError::CryptoParse("cannot assemble OCSP response".into()));
        }

        let len = sys::i2d_OCSP_RESPONSE(response.0, ptr::null_mut());
        if len <= 0 {
            return Err(CmsError::CryptoParse("cannot encode OCSP response".into()));
        }
        let mut der = vec![0u8; len as usize];
        let mut out = der.as_mut_ptr();
        if sys::i2d_OCSP_RESPONSE(response.0, &mut out) != len {
            return Err(CmsError::CryptoParse("cannot encode OCSP response".into()));
        }
        Ok(der)
    }
}

/// Trust parameters for response verification.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Accept a self-signed responder certificate as its own anchor.
    pub allow_self_signed_ca: bool,
    /// Extra hashed trust directory loaded alongside the process defaults.
    pub trusted_ca_dir: Option<PathBuf>,
}

/// What a verified response certifies.
#[derive(Debug, Clone)]
pub struct VerifiedOcsp {
    pub serial: u64,
    pub status: OcspCertStatus,
    pub this_update: i64,
    pub next_update: i64,
    pub revocation_time: Option<i64>,
}

fn build_trust_store(
    opts: &VerifyOptions,
    extra_trusted: &[X509],
) -> CmsResult<X509Store> {
    let mut builder = X509StoreBuilder::new()?;
    builder.set_default_paths()?;
    if let Some(dir) = &opts.trusted_ca_dir {
        let lookup = builder.add_lookup(X509Lookup::hash_dir())?;
        lookup
            .add_dir(&dir.to_string_lossy(), SslFiletype::PEM)
            .map_err(|e| {
                CmsError::CryptoParse(format!(
                    "cannot load trusted CA directory {}: {e}",
                    dir.display()
                ))
            })?;
    }
    builder.set_flags(
        X509VerifyFlags::PARTIAL_CHAIN
            | X509VerifyFlags::CHECK_SS_SIGNATURE
            | X509VerifyFlags::TRUSTED_FIRST,
    )?;
    for cert in extra_trusted {
        builder.add_cert(cert.clone())?;
    }
    Ok(builder.build())
}

/// Parse a DER OCSP response and verify it end to end.
///
/// Enforces, in order: a successful response status, a signer chain ending
/// at a trust anchor (with the self-signed escape only when configured), a
/// valid signature, the ±5 s validity window, and a revocation time on
/// REVOKED entries. Returns the certified status fields.
pub fn parse_and_verify(ocsp_der: &[u8], opts: &VerifyOptions) -> CmsResult<VerifiedOcsp> {
    unsafe {
        let mut input = ocsp_der.as_ptr();
        let response = ResponseGuard(sys::d2i_OCSP_RESPONSE(
            ptr::null_mut(),
            &mut input,
            ocsp_der.len() as c_long,
        ));
        if response.0.is_null() {
            return Err(CmsError::CryptoParse("malformed OCSP response".into()));
        }

        if sys::OCSP_response_status(response.0) != OCSP_RESPONSE_STATUS_SUCCESSFUL {
            return Err(CmsError::CryptoParse(
                "OCSP response status not successful".into(),
            ));
        }

        let basic = BasicRespGuard(sys::OCSP_response_get1_basic(response.0));
        if basic.0.is_null() {
            return Err(CmsError::CryptoParse(
                "OCSP response has no basic response".into(),
            ));
        }

        // Signer certificate and any chain the responder included; both are
        // borrowed from the basic response.
        let mut signer_ptr: *mut openssl_sys::X509 = ptr::null_mut();
        if sys::OCSP_resp_get0_signer(basic.0, &mut signer_ptr, ptr::null_mut()) != 1
            || signer_ptr.is_null()
        {
            return Err(CmsError::CryptoParse(
                "cannot find signer certificate in OCSP response".into(),
            ));
        }
        let signer = X509Ref::from_ptr(signer_ptr);
        let chain_ptr = sys::OCSP_resp_get0_certs(basic.0);

        let empty_chain;
        let chain: &StackRef<X509> = if chain_ptr.is_null() {
            empty_chain = Stack::new()?;
            &empty_chain
        } else {
            StackRef::from_ptr(chain_ptr)
        };

        let self_signed = signer.issued(signer) == X509VerifyResult::OK;
        let trust_signer_directly = opts.allow_self_signed_ca && self_signed;

        if !trust_signer_directly {
            let store = build_trust_store(opts, &[])?;
            let mut ctx = X509StoreContext::new()?;
            let trusted = ctx
                .init(&store, signer, chain, |c| c.verify_cert())
                .map_err(|e| {
                    CmsError::CryptoParse(format!("verifying OCSP signer chain: {e}"))
                })?;
            if !trusted {
                return Err(CmsError::CryptoParse(
                    "OCSP signer chain does not reach a trust anchor".into(),
                ));
            }
        }

        // The signer (and its chain) are trusted now; verify the signature
        // against a store that contains them.
        let mut trusted_extra: Vec<X509> = vec![signer.to_owned()];
        for cert in chain {
            trusted_extra.push(cert.to_owned());
        }
        let store = build_trust_store(opts, &trusted_extra)?;
        if sys::OCSP_basic_verify(basic.0, chain_ptr, store.as_ptr(), 0) <= 0 {
            return Err(CmsError::CryptoParse(
                "OCSP response signature verification failed".into(),
            ));
        }

        let single = sys::OCSP_resp_get0(basic.0, 0);
        if single.is_null() {
            return Err(CmsError::CryptoParse(
                "no entries found in OCSP response".into(),
            ));
        }

        let cert_id = sys::OCSP_SINGLERESP_get0_id(single);
        let mut serial_asn1: *mut openssl_sys::ASN1_INTEGER = ptr::null_mut();
        if sys::OCSP_id_get0_info(
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            &mut serial_asn1,
            cert_id as *mut _,
        ) != 1
            || serial_asn1.is_null()
        {
            return Err(CmsError::CryptoParse(
                "cannot read serial from OCSP response".into(),
            ));
        }
        let serial_bn_ptr = sys::ASN1_INTEGER_to_BN(serial_asn1, ptr::null_mut());
        if serial_bn_ptr.is_null() {
            return Err(CmsError::CryptoParse("bad serial in OCSP response".into()));
        }
        let serial_bn = BigNum::from_ptr(serial_bn_ptr);
        let serial: u64 = serial_bn
            .to_dec_str()?
            .parse()
            .map_err(|_| CmsError::CryptoParse("OCSP serial does not fit in u64".into()))?;

        let mut reason: c_int = 0;
        let mut revtime: *mut openssl_sys::ASN1_TIME = ptr::null_mut();
        let mut thisupd: *mut openssl_sys::ASN1_TIME = ptr::null_mut();
        let mut nextupd: *mut openssl_sys::ASN1_TIME = ptr::null_mut();
        let status_int = sys::OCSP_single_get0_status(
            single,
            &mut reason,
            &mut revtime,
            &mut thisupd,
            &mut nextupd,
        );
        let status = ocsp_status_from_int(status_int)?;

        if thisupd.is_null() || nextupd.is_null() {
            return Err(CmsError::CryptoParse(
                "OCSP response is missing its validity window".into(),
            ));
        }
        if sys::OCSP_check_validity(thisupd, nextupd, OCSP_VALIDITY_LEEWAY_SECS, -1) != 1 {
            return Err(CmsError::OcspStale);
        }

        if status == OcspCertStatus::Revoked && revtime.is_null() {
            return Err(CmsError::CryptoParse(
                "revocation time not set when status is REVOKED".into(),
            ));
        }

        let this_update = asn1_time_to_unix(Asn1TimeRef::from_ptr(thisupd))?;
        let next_update = asn1_time_to_unix(Asn1TimeRef::from_ptr(nextupd))?;
        let revocation_time = if revtime.is_null() {
            None
        } else {
            Some(asn1_time_to_unix(Asn1TimeRef::from_ptr(revtime))?)
        };

        Ok(VerifiedOcsp {
            serial,
            status,
            this_update,
            next_update,
            revocation_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::extension::{BasicConstraints, KeyUsage};
    use openssl::x509::{X509Name, X509};

    fn make_test_ca() -> (PKey<openssl::pkey::Private>, X509) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, "OCSP Test CA")
            .unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .digital_signature()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (key, builder.build())
    }

    #[test]
    fn test_build_and_verify_roundtrip() {
        let (ca_key, ca_cert) = make_test_ca();
        let now = Utc::now().timestamp();
        let entry = OcspEntry {
            serial: 0xdead_beef_1234,
            status: OcspCertStatus::Good,
            this_update: now,
            next_update: now + 1800,
            revocation_time: None,
        };
        let der = build_signed_response(&ca_cert, &ca_key, &[], &entry).unwrap();

        let opts = VerifyOptions {
            allow_self_signed_ca: true,
            trusted_ca_dir: None,
        };
        let verified = parse_and_verify(&der, &opts).unwrap();
        assert_eq!(verified.serial, 0xdead_beef_1234);
        assert_eq!(verified.status, OcspCertStatus::Good);
        assert_eq!(verified.this_update, now);
        assert_eq!(verified.next_update, now + 1800);
        assert!(verified.revocation_time.is_none());
    }

    #[test]
    fn test_revoked_carries_revocation_time() {
        let (ca_key, ca_cert) = make_test_ca();
        let now = Utc::now().timestamp();
        let entry = OcspEntry {
            serial: 99,
            status: OcspCertStatus::Revoked,
            this_update: now,
            next_update: now + 1800,
            revocation_time: Some(now - 60),
        };
        let der = build_signed_response(&ca_cert, &ca_key, &[], &entry).unwrap();
        let opts = VerifyOptions {
            allow_self_signed_ca: true,
            trusted_ca_dir: None,
        };
        let verified = parse_and_verify(&der, &opts).unwrap();
        assert_eq!(verified.status, OcspCertStatus::Revoked);
        assert_eq!(verified.revocation_time, Some(now - 60));
    }

    #[test]
    fn test_revoked_requires_revocation_time() {
        let (ca_key, ca_cert) = make_test_ca();
        let now = Utc::now().timestamp();
        let entry = OcspEntry {
            serial: 7,
            status: OcspCertStatus::Revoked,
            this_update: now,
            next_update: now + 1800,
            revocation_time: None,
        };
        assert!(build_signed_response(&ca_cert, &ca_key, &[], &entry).is_err());
    }

    #[test]
    fn test_stale_response_rejected() {
        let (ca_key, ca_cert) = make_test_ca();
        let now = Utc::now().timestamp();
        let entry = OcspEntry {
            serial: 11,
            status: OcspCertStatus::Good,
            this_update: now - 7200,
            next_update: now - 3600,
            revocation_time: None,
        };
        let der = build_signed_response(&ca_cert, &ca_key, &[], &entry).unwrap();
        let opts = VerifyOptions {
            allow_self_signed_ca: true,
            trusted_ca_dir: None,
        };
        match parse_and_verify(&der, &opts) {
            Err(CmsError::OcspStale) => {}
            other => panic!("expected OcspStale, got {other:?}"),
        }
    }

    #[test]
    fn test_untrusted_signer_rejected_without_self_signed_escape() {
        let (ca_key, ca_cert) = make_test_ca();
        let now = Utc::now().timestamp();
        let entry = OcspEntry {
            serial: 13,
            status: OcspCertStatus::Good,
            this_update: now,
            next_update: now + 1800,
            revocation_time: None,
        };
        let der = build_signed_response(&ca_cert, &ca_key, &[], &entry).unwrap();
        // The test CA is in no trust store and the escape hatch is off.
        let opts = VerifyOptions {
            allow_self_signed_ca: false,
            trusted_ca_dir: None,
        };
        assert!(parse_and_verify(&der, &opts).is_err());
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        let opts = VerifyOptions::default();
        match parse_and_verify(b"not an ocsp response", &opts) {
            Err(CmsError::CryptoParse(_)) => {}
            other => panic!("expected CryptoParse, got {other:?}"),
        }
    }
}
