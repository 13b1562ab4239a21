//! Certificate factory.
//!
//! Assembles and signs an X.509 certificate from validated subject data and
//! issuer material. End-entity certificates are signed by the CA; the CA's
//! own certificate is produced by the same factory in self-signed mode
//! during first-start bootstrap.

use std::fs;
use std::path::{Path, PathBuf};

use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509};

use crate::crypto::{make_status_uri_extension, subject_name_hash, unix_to_asn1_time};
use crate::error::{CmsError, CmsResult};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const CA_PATH_LENGTH: u32 = 1;

/// Usage bitmask bits carried in certificate creation requests.
pub mod usage {
    pub const CLIENT: u16 = 0x01;
    pub const SERVER: u16 = 0x02;
    pub const GATEWAY: u16 = 0x04;
    pub const CA: u16 = 0x08;
}

/// Recognized usage combinations: one role, or a client+server pair.
pub fn usage_is_recognized(mask: u16) -> bool {
    mask == usage::CLIENT
        || mask == usage::SERVER
        || mask == usage::GATEWAY
        || mask == usage::CA
        || mask == (usage::CLIENT | usage::SERVER)
}

pub fn usage_to_string(mask: u16) -> String {
    let mut parts = Vec::new();
    if mask & usage::CLIENT != 0 {
        parts.push("client");
    }
    if mask & usage::SERVER != 0 {
        parts.push("server");
    }
    if mask & usage::GATEWAY != 0 {
        parts.push("gateway");
    }
    if mask & usage::CA != 0 {
        parts.push("ca");
    }
    parts.join("+")
}

/// The CA's signing material, loaded once at startup and shared read-only
/// for the service's lifetime.
#[derive(Clone)]
pub struct CaMaterial {
    pub cert: X509,
    pub key: PKey<Private>,
    pub chain: Vec<X509>,
}

/// A signed certificate plus the PEM bundle handed back to the requester.
#[derive(Debug)]
pub struct SignedCert {
    pub cert: X509,
    /// This certificate first, then the issuer chain in order.
    pub pem_bundle: String,
}

/// Builder for issuing certificates.
///
/// Mirrors the usual chain: subject fields, validity, usage, issuer, then
/// `build()`. Empty subject attributes are skipped; only CN is required.
pub struct CertFactory {
    serial: u64,
    public_key: PKey<Public>,
    common_name: String,
    organization: String,
    organizational_unit: String,
    country: String,
    not_before: i64,
    not_after: i64,
    usage: u16,
    issuer: Option<CaMaterial>,
    self_key: Option<PKey<Private>>,
    status_pv: Option<String>,
}

impl CertFactory {
    pub fn new(serial: u64, public_key: PKey<Public>) -> Self {
        CertFactory {
            serial,
            public_key,
            common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            country: String::new(),
            not_before: 0,
            not_after: 0,
            usage: usage::CLIENT,
            issuer: None,
            self_key: None,
            status_pv: None,
        }
    }

    pub fn common_name(mut self, cn: &str) -> Self {
        self.common_name = cn.to_string();
        self
    }

    pub fn organization(mut self, o: &str) -> Self {
        self.organization = o.to_string();
        self
    }

    pub fn organizational_unit(mut self, ou: &str) -> Self {
        self.organizational_unit = ou.to_string();
        self
    }

    pub fn country(mut self, c: &str) -> Self {
        self.country = c.to_string();
        self
    }

    /// Validity bounds in Unix seconds, UTC.
    pub fn validity(mut self, not_before: i64, not_after: i64) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn usage(mut self, mask: u16) -> Self {
        self.usage = mask;
        self
    }

    /// Sign with the CA. The AKI extension will reference the CA's SKI and
    /// the PEM bundle will carry the CA chain.
    pub fn issued_by(mut self, ca: &CaMaterial) -> Self {
        self.issuer = Some(ca.clone());
        self
    }

    /// Self-signed mode for CA bootstrap: issuer name equals subject name
    /// and the subject's own private key signs.
    pub fn self_signed(mut self, key: PKey<Private>) -> Self {
        self.self_key = Some(key);
        self
    }

    /// Require status subscription: embeds the status PV name in the custom
    /// extension so peers know where to watch.
    pub fn status_pv(mut self, uri: &str) -> Self {
        self.status_pv = Some(uri.to_string());
        self
    }

    pub fn build(self) -> CmsResult<SignedCert> {
        if self.serial == 0 {
            return Err(CmsError::Config("serial number must be positive".into()));
        }
        if self.common_name.is_empty() {
            return Err(CmsError::Config("common name is required".into()));
        }
        if self.not_before > self.not_after {
            return Err(CmsError::Config(
                "not_before must not be after not_after".into(),
            ));
        }
        if self.issuer.is_none() && self.self_key.is_none() {
            return Err(CmsError::Config(
                "either an issuer or a self-signing key is required".into(),
            ));
        }

        let mut name = X509Name::builder()?;
        name.append_entry_by_nid(Nid::COMMONNAME, &self.common_name)?;
        if !self.organization.is_empty() {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)?;
        }
        if !self.organizational_unit.is_empty() {
            name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit)?;
        }
        if !self.country.is_empty() {
            name.append_entry_by_nid(Nid::COUNTRYNAME, &self.country)?;
        }
        let subject_name = name.build();

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let serial_bn = BigNum::from_dec_str(&self.serial.to_string())?;
        let serial_asn1 = serial_bn.to_asn1_integer()?;
        builder.set_serial_number(&serial_asn1)?;

        builder.set_subject_name(&subject_name)?;
        match &self.issuer {
            Some(ca) => builder.set_issuer_name(ca.cert.subject_name())?,
            None => builder.set_issuer_name(&subject_name)?,
        }

        let not_before = unix_to_asn1_time(self.not_before)?;
        builder.set_not_before(&not_before)?;
        let not_after = unix_to_asn1_time(self.not_after)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&self.public_key)?;

        let is_ca = self.usage & usage::CA != 0;

        let mut bc = BasicConstraints::new();
        bc.critical();
        if is_ca {
            bc.ca();
            bc.pathlen(CA_PATH_LENGTH);
        }
        builder.append_extension(bc.build()?)?;

        let mut ku = KeyUsage::new();
        ku.critical();
        if is_ca {
            ku.key_cert_sign();
            ku.crl_sign();
        } else {
            ku.digital_signature();
            ku.key_encipherment();
        }
        builder.append_extension(ku.build()?)?;

        if !is_ca {
            let mut eku = ExtendedKeyUsage::new();
            if self.usage & (usage::CLIENT | usage::GATEWAY) != 0 {
                eku.client_auth();
            }
            if self.usage & (usage::SERVER | usage::GATEWAY) != 0 {
                eku.server_auth();
            }
            builder.append_extension(eku.build()?)?;
        }

        let ski = {
            let ctx = builder.x509v3_context(self.issuer.as_ref().map(|ca| &*ca.cert), None);
            SubjectKeyIdentifier::new().build(&ctx)?
        };
        builder.append_extension(ski)?;

        if let Some(ca) = &self.issuer {
            let aki = {
                let ctx = builder.x509v3_context(Some(&*ca.cert), None);
                AuthorityKeyIdentifier::new().keyid(true).build(&ctx)?
            };
            builder.append_extension(aki)?;
        }

        if let Some(uri) = &self.status_pv {
            builder.append_extension(make_status_uri_extension(uri)?)?;
        }

        match (&self.issuer, &self.self_key) {
            (Some(ca), _) => builder.sign(&ca.key, MessageDigest::sha256())?,
            (None, Some(key)) => builder.sign(key, MessageDigest::sha256())?,
            (None, None) => unreachable!("checked above"),
        }

        let cert = builder.build();

        let mut pem_bundle = String::from_utf8(cert.to_pem()?)
            .map_err(|e| CmsError::CryptoParse(format!("PEM is not UTF-8: {e}")))?;
        if let Some(ca) = &self.issuer {
            pem_bundle.push_str(
                &String::from_utf8(ca.cert.to_pem()?)
                    .map_err(|e| CmsError::CryptoParse(format!("PEM is not UTF-8: {e}")))?,
            );
            for link in &ca.chain {
                pem_bundle.push_str(
                    &String::from_utf8(link.to_pem()?)
                        .map_err(|e| CmsError::CryptoParse(format!("PEM is not UTF-8: {e}")))?,
                );
            }
        }

        Ok(SignedCert { cert, pem_bundle })
    }
}

/// OpenSSL-style hash name for a PEM certificate file: first 32 bits of the
/// canonical subject-name digest, rendered as `<hash>.0`.
pub fn cert_hash_name(cert_path: &Path) -> CmsResult<String> {
    let pem = fs::read(cert_path)
        .map_err(|e| CmsError::CryptoParse(format!("cannot read {}: {e}", cert_path.display())))?;
    let cert = X509::from_pem(&pem)?;
    Ok(format!("{:08x}.0", subject_name_hash(&cert)))
}

/// Create a `<hash>.0` sibling link so the directory works as an OpenSSL
/// hashed trust directory. Falls back to a hard link where symlinks are
/// unavailable.
pub fn create_cert_symlink(cert_path: &Path) -> CmsResult<PathBuf> {
    let hash_name = cert_hash_name(cert_path)?;
    let dir = cert_path.parent().unwrap_or_else(|| Path::new("."));
    let link_path = dir.join(&hash_name);
    if link_path.exists() {
        fs::remove_file(&link_path).map_err(|e| {
            CmsError::CryptoParse(format!("cannot replace {}: {e}", link_path.display()))
        })?;
    }

    #[cfg(unix)]
    {
        let target = cert_path
            .file_name()
            .ok_or_else(|| CmsError::CryptoParse("certificate path has no file name".into()))?;
        std::os::unix::fs::symlink(target, &link_path).map_err(|e| {
            CmsError::CryptoParse(format!("cannot create {}: {e}", link_path.display()))
        })?;
    }
    #[cfg(not(unix))]
    {
        fs::hard_link(cert_path, &link_path).map_err(|e| {
            CmsError::CryptoParse(format!("cannot create {}: {e}", link_path.display()))
        })?;
    }

    Ok(link_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{status_uri_from_cert, KeyPair};
    use crate::status::{issuer_id, status_pv_name};
    use chrono::Utc;
    use tempfile::tempdir;

    fn make_ca() -> CaMaterial {
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let signed = CertFactory::new(1, kp.public_key().unwrap())
            .common_name("Test Root CA")
            .organization("test.org")
            .organizational_unit("Certificate Authority")
            .validity(now - 60, now + 3_600 * 24 * 365)
            .usage(usage::CA)
            .self_signed(kp.pkey.clone())
            .build()
            .unwrap();
        CaMaterial {
            cert: signed.cert,
            key: kp.pkey,
            chain: Vec::new(),
        }
    }

    fn common_name_of(name: &openssl::x509::X509NameRef) -> String {
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_self_signed_ca() {
        let ca = make_ca();
        assert!(ca.cert.subject_key_id().is_some());
        // Self-signed: subject equals issuer
        assert_eq!(
            common_name_of(ca.cert.subject_name()),
            common_name_of(ca.cert.issuer_name())
        );
        // The CA verifies under its own key
        let pub_key = ca.cert.public_key().unwrap();
        assert!(ca.cert.verify(&pub_key).unwrap());
    }

    #[test]
    fn test_server_certificate_with_status_pv() {
        let ca = make_ca();
        let issuer = issuer_id(&ca.cert).unwrap();
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let serial = 0x1234_5678_9abc_def0u64;
        let pv = status_pv_name(&issuer, serial);

        let signed = CertFactory::new(serial, kp.public_key().unwrap())
            .common_name("srv1")
            .organization("test.org")
            .validity(now - 60, now + 86_400)
            .usage(usage::SERVER)
            .issued_by(&ca)
            .status_pv(&pv)
            .build()
            .unwrap();

        // Signed by the CA and chained to it via the AKI extension
        let ca_key = ca.cert.public_key().unwrap();
        assert!(signed.cert.verify(&ca_key).unwrap());
        assert_eq!(
            crate::crypto::cert_aki_hex(&signed.cert),
            crate::crypto::cert_ski_hex(&ca.cert)
        );

        // The custom extension carries the status PV name
        assert_eq!(status_uri_from_cert(&signed.cert).unwrap().as_deref(), Some(pv.as_str()));

        // The SKI stamped into the certificate matches the one computed
        // directly from the public key (the store records the latter)
        assert_eq!(
            crate::crypto::cert_ski_hex(&signed.cert).unwrap(),
            crate::crypto::ski_hex(&kp.pkey).unwrap()
        );

        // Bundle holds the leaf and the CA
        assert_eq!(signed.pem_bundle.matches("BEGIN CERTIFICATE").count(), 2);
    }

    #[test]
    fn test_certificate_without_status_pv_has_no_extension() {
        let ca = make_ca();
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let signed = CertFactory::new(77, kp.public_key().unwrap())
            .common_name("plain")
            .validity(now, now + 3_600)
            .usage(usage::CLIENT)
            .issued_by(&ca)
            .build()
            .unwrap();
        assert_eq!(status_uri_from_cert(&signed.cert).unwrap(), None);
    }

    #[test]
    fn test_usage_validation() {
        assert!(usage_is_recognized(usage::CLIENT));
        assert!(usage_is_recognized(usage::SERVER));
        assert!(usage_is_recognized(usage::GATEWAY));
        assert!(usage_is_recognized(usage::CA));
        assert!(usage_is_recognized(usage::CLIENT | usage::SERVER));
        assert!(!usage_is_recognized(0));
        assert!(!usage_is_recognized(usage::CLIENT | usage::CA));
        assert!(!usage_is_recognized(usage::GATEWAY | usage::SERVER));
    }

    #[test]
    fn test_zero_serial_rejected() {
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let err = CertFactory::new(0, kp.public_key().unwrap())
            .common_name("x")
            .validity(now, now + 1)
            .self_signed(kp.pkey.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, CmsError::Config(_)));
    }

    #[test]
    fn test_cert_hash_link() {
        let ca = make_ca();
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        std::fs::write(&cert_path, ca.cert.to_pem().unwrap()).unwrap();

        let link = create_cert_symlink(&cert_path).unwrap();
        let name = link.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".0"));
        assert_eq!(name.len(), 10);
        // The link resolves to the same certificate
        let via_link = std::fs::read(&link).unwrap();
        assert_eq!(via_link, std::fs::read(&cert_path).unwrap());

        // Recreating is idempotent
        create_cert_symlink(&cert_path).unwrap();
    }
}
