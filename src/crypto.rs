//! Crypto primitives adapter.
//!
//! Thin capability layer over OpenSSL: key-pair generation, PKCS#12 keychain
//! I/O, PEM helpers, subject-key-identifier computation, ASN.1 time
//! conversion, raw DER signing, and the custom `PvaCertStatusURI` X.509
//! extension that carries a certificate's status PV name.
//!
//! The few entry points the safe `openssl` crate does not expose (object
//! registration and generic extension lookup) are declared in a private
//! `sys` block and wrapped here; no unsafe leaks out of this module.

use std::ffi::CString;
use std::fs;
use std::os::raw::{c_char, c_int, c_uchar, c_ulong};
use std::path::Path;
use std::sync::OnceLock;

use foreign_types::ForeignTypeRef;
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use openssl::stack::Stack;
use openssl::x509::{X509Extension, X509Ref, X509};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{CmsError, CmsResult};

/// OID of the custom extension holding the status PV name.
pub const PVA_CERT_STATUS_URI_OID: &str = "1.3.6.1.4.1.37427.1";
const PVA_CERT_STATUS_URI_SN: &str = "PvaCertStatusURI";
const PVA_CERT_STATUS_URI_LN: &str = "PVA Certificate Status URI";

/// Default key size for generated certificates.
pub const RSA_KEY_SIZE_DEFAULT: u32 = 2048;

mod sys {
    use super::*;
    use openssl_sys::{ASN1_OBJECT, ASN1_STRING, X509, X509_EXTENSION};

    extern "C" {
        pub fn OBJ_create(oid: *const c_char, sn: *const c_char, ln: *const c_char) -> c_int;
        pub fn X509_get_ext_count(x: *const X509) -> c_int;
        pub fn X509_get_ext(x: *const X509, loc: c_int) -> *mut X509_EXTENSION;
        pub fn X509_EXTENSION_get_object(ex: *mut X509_EXTENSION) -> *mut ASN1_OBJECT;
        pub fn X509_EXTENSION_get_data(ex: *mut X509_EXTENSION) -> *mut ASN1_STRING;
        pub fn OBJ_obj2txt(
            buf: *mut c_char,
            buf_len: c_int,
            a: *const ASN1_OBJECT,
            no_name: c_int,
        ) -> c_int;
        pub fn ASN1_STRING_get0_data(x: *const ASN1_STRING) -> *const c_uchar;
        pub fn ASN1_STRING_length(x: *const ASN1_STRING) -> c_int;
        pub fn X509_subject_name_hash(x: *mut X509) -> c_ulong;
    }
}

static STATUS_URI_NID: OnceLock<i32> = OnceLock::new();

/// Register the `PvaCertStatusURI` object with the OpenSSL object table.
///
/// Idempotent; every path that touches the custom extension calls this
/// first so the registration happens exactly once per process.
pub fn init_status_uri_oid() -> i32 {
    *STATUS_URI_NID.get_or_init(|| {
        let oid = CString::new(PVA_CERT_STATUS_URI_OID).expect("static oid");
        let sn = CString::new(PVA_CERT_STATUS_URI_SN).expect("static sn");
        let ln = CString::new(PVA_CERT_STATUS_URI_LN).expect("static ln");
        unsafe { sys::OBJ_create(oid.as_ptr(), sn.as_ptr(), ln.as_ptr()) }
    })
}

/// A freshly generated key pair. The private half never leaves the owner;
/// only `public_key_pem` travels in certificate creation requests.
pub struct KeyPair {
    pub pkey: PKey<Private>,
}

impl KeyPair {
    /// Generate a new RSA key pair of the default size.
    pub fn generate() -> CmsResult<Self> {
        Self::generate_with_bits(RSA_KEY_SIZE_DEFAULT)
    }

    pub fn generate_with_bits(bits: u32) -> CmsResult<Self> {
        let rsa = Rsa::generate(bits)?;
        let pkey = PKey::from_rsa(rsa)?;
        Ok(KeyPair { pkey })
    }

    pub fn public_key_pem(&self) -> CmsResult<Vec<u8>> {
        Ok(self.pkey.public_key_to_pem()?)
    }

    pub fn public_key(&self) -> CmsResult<PKey<Public>> {
        public_key_from_pem(&self.public_key_pem()?)
    }
}

/// Parse a PEM-encoded public key.
pub fn public_key_from_pem(pem: &[u8]) -> CmsResult<PKey<Public>> {
    PKey::public_key_from_pem(pem)
        .map_err(|e| CmsError::CryptoParse(format!("bad public key PEM: {e}")))
}

/// Contents of a PKCS#12 keychain file.
pub struct Keychain {
    pub key: PKey<Private>,
    pub cert: X509,
    pub chain: Vec<X509>,
}

/// Load key, certificate, and chain from a PKCS#12 keychain file.
pub fn load_keychain(path: &Path, password: Option<&SecretString>) -> CmsResult<Keychain> {
    let der = fs::read(path)
        .map_err(|e| CmsError::CryptoParse(format!("cannot read {}: {e}", path.display())))?;
    let p12 = Pkcs12::from_der(&der)
        .map_err(|e| CmsError::CryptoParse(format!("bad PKCS#12 in {}: {e}", path.display())))?;
    let pass = password.map(|p| p.expose_secret().to_string()).unwrap_or_default();
    let parsed = p12
        .parse2(&pass)
        .map_err(|e| CmsError::CryptoParse(format!("cannot unlock {}: {e}", path.display())))?;

    let key = parsed
        .pkey
        .ok_or_else(|| CmsError::CryptoParse(format!("{} holds no private key", path.display())))?;
    let cert = parsed
        .cert
        .ok_or_else(|| CmsError::CryptoParse(format!("{} holds no certificate", path.display())))?;
    let chain = match parsed.ca {
        Some(stack) => stack.into_iter().collect(),
        None => Vec::new(),
    };
    Ok(Keychain { key, cert, chain })
}

/// Write a PKCS#12 keychain file for the given key, certificate, and chain.
pub fn save_keychain(
    path: &Path,
    name: &str,
    key: &PKeyRef<Private>,
    cert: &X509Ref,
    chain: &[X509],
    password: Option<&SecretString>,
) -> CmsResult<()> {
    let mut ca = Stack::new()?;
    for c in chain {
        ca.push(c.clone())?;
    }
    let pass = password.map(|p| p.expose_secret().to_string()).unwrap_or_default();
    let p12 = Pkcs12::builder()
        .name(name)
        .pkey(key)
        .cert(cert)
        .ca(ca)
        .build2(&pass)?;
    let der = p12.to_der()?;
    fs::write(path, der)
        .map_err(|e| CmsError::CryptoParse(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

/// Hex-encoded Subject Key Identifier of a public key: the SHA-1 digest of
/// the key's BIT STRING payload, matching what OpenSSL stamps into the SKI
/// extension.
pub fn ski_hex<T: HasPublic>(key: &PKeyRef<T>) -> CmsResult<String> {
    let rsa = key
        .rsa()
        .map_err(|e| CmsError::CryptoParse(format!("only RSA keys are supported: {e}")))?;
    let der = rsa.public_key_to_der_pkcs1()?;
    let digest = openssl::hash::hash(MessageDigest::sha1(), &der)?;
    Ok(hex::encode(digest.as_ref()))
}

/// Hex form of a certificate's Subject Key Identifier extension, if present.
pub fn cert_ski_hex(cert: &X509Ref) -> Option<String> {
    cert.subject_key_id().map(|id| hex::encode(id.as_slice()))
}

/// Hex form of a certificate's Authority Key Identifier extension, if
/// present.
pub fn cert_aki_hex(cert: &X509Ref) -> Option<String> {
    cert.authority_key_id().map(|id| hex::encode(id.as_slice()))
}

/// Convert an ASN.1 time to Unix seconds (UTC).
pub fn asn1_time_to_unix(time: &Asn1TimeRef) -> CmsResult<i64> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

/// Convert Unix seconds (UTC) to an ASN.1 time.
pub fn unix_to_asn1_time(t: i64) -> CmsResult<Asn1Time> {
    Ok(Asn1Time::from_unix(t)?)
}

/// Sign arbitrary DER with SHA-256 under the given private key.
pub fn sign_der(key: &PKeyRef<Private>, data: &[u8]) -> CmsResult<Vec<u8>> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

/// Verify a SHA-256 signature over arbitrary DER.
pub fn verify_der<T: HasPublic>(
    key: &PKeyRef<T>,
    data: &[u8],
    signature: &[u8],
) -> CmsResult<bool> {
    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    verifier.update(data)?;
    Ok(verifier.verify(signature)?)
}

/// Build the custom extension carrying a status PV name.
pub fn make_status_uri_extension(uri: &str) -> CmsResult<X509Extension> {
    init_status_uri_oid();
    let oid = Asn1Object::from_str(PVA_CERT_STATUS_URI_OID)?;
    let contents = Asn1OctetString::new_from_bytes(&der_utf8_string(uri.as_bytes()))?;
    Ok(X509Extension::new_from_der(&oid, false, &contents)?)
}

/// Read the status PV name out of a certificate's custom extension.
///
/// A certificate without the extension simply does not participate in
/// status monitoring, so absence is `Ok(None)` rather than an error.
pub fn status_uri_from_cert(cert: &X509Ref) -> CmsResult<Option<String>> {
    init_status_uri_oid();
    unsafe {
        let x = cert.as_ptr();
        let count = sys::X509_get_ext_count(x);
        for i in 0..count {
            let ext = sys::X509_get_ext(x, i);
            if ext.is_null() {
                continue;
            }
            let obj = sys::X509_EXTENSION_get_object(ext);
            if obj.is_null() {
                continue;
            }
            let mut buf = [0u8; 128];
            let n = sys::OBJ_obj2txt(buf.as_mut_ptr() as *mut c_char, buf.len() as c_int, obj, 1);
            if n <= 0 || n as usize >= buf.len() {
                continue;
            }
            let oid_txt = match std::str::from_utf8(&buf[..n as usize]) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if oid_txt != PVA_CERT_STATUS_URI_OID {
                continue;
            }
            let data = sys::X509_EXTENSION_get_data(ext);
            if data.is_null() {
                return Err(CmsError::CryptoParse(
                    "status URI extension has no data".into(),
                ));
            }
            let ptr = sys::ASN1_STRING_get0_data(data);
            let len = sys::ASN1_STRING_length(data);
            if ptr.is_null() || len < 0 {
                return Err(CmsError::CryptoParse(
                    "status URI extension data is invalid".into(),
                ));
            }
            let raw = std::slice::from_raw_parts(ptr, len as usize);
            return parse_der_string(raw).map(Some);
        }
    }
    Ok(None)
}

/// OpenSSL-style subject name hash, used to build `<hash>.0` trust-directory
/// link names.
pub fn subject_name_hash(cert: &X509Ref) -> u32 {
    unsafe { sys::X509_subject_name_hash(cert.as_ptr()) as u32 }
}

/// DER-encode a UTF8String.
fn der_utf8_string(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x0c];
    let len = data.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let mut n = len;
        let mut len_bytes = Vec::new();
        while n > 0 {
            len_bytes.push((n & 0xff) as u8);
            n >>= 8;
        }
        len_bytes.reverse();
        out.push(0x80 | len_bytes.len() as u8);
        out.extend_from_slice(&len_bytes);
    }
    out.extend_from_slice(data);
    out
}

/// Parse a DER UTF8String/IA5String/OCTET STRING payload into text.
fn parse_der_string(raw: &[u8]) -> CmsResult<String> {
    if raw.len() < 2 {
        return Err(CmsError::CryptoParse("extension value too short".into()));
    }
    match raw[0] {
        0x0c | 0x16 | 0x04 => {}
        tag => {
            return Err(CmsError::CryptoParse(format!(
                "unexpected extension value tag {tag:#x}"
            )))
        }
    }
    let (len, header) = if raw[1] < 0x80 {
        (raw[1] as usize, 2usize)
    } else {
        let n = (raw[1] & 0x7f) as usize;
        if n == 0 || n > 8 || raw.len() < 2 + n {
            return Err(CmsError::CryptoParse("bad extension value length".into()));
        }
        let mut len = 0usize;
        for &b in &raw[2..2 + n] {
            len = (len << 8) | b as usize;
        }
        (len, 2 + n)
    };
    if raw.len() < header + len {
        return Err(CmsError::CryptoParse("truncated extension value".into()));
    }
    String::from_utf8(raw[header..header + len].to_vec())
        .map_err(|e| CmsError::CryptoParse(format!("extension value is not UTF-8: {e}")))
}
