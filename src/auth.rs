//! Authentication method plug points.
//!
//! The issuance pipeline knows only the `AuthMethod` trait; concrete
//! methods register under their type name and classify themselves as
//! `Basic` (subject to per-role admin approval) or `Strong` (issued
//! immediately). Two methods ship here: caller-asserted standard
//! credentials, and JWT bearer tokens.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{CmsError, CmsResult};
use crate::issuance::CertCreationRequest;

/// Approval class of an authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodClass {
    /// Weakly verified; issuance may require admin approval.
    Basic,
    /// Strongly verified; certificates are issued immediately.
    Strong,
}

/// The verified identity an authentication method vouches for.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub name: String,
    pub organization: String,
    pub organization_unit: String,
    pub country: String,
}

pub trait AuthMethod: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn method_class(&self) -> MethodClass;

    /// Names of the request fields this method needs for verification.
    fn verifier_fields(&self) -> &'static [&'static str];

    /// Verify the request. A failure here refuses issuance outright and
    /// writes nothing.
    fn verify(&self, ccr: &CertCreationRequest) -> CmsResult<Credentials>;
}

/// Registry of available authentication methods, keyed by type name.
#[derive(Default)]
pub struct AuthRegistry {
    methods: HashMap<&'static str, Box<dyn AuthMethod>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        AuthRegistry::default()
    }

    pub fn register(&mut self, method: Box<dyn AuthMethod>) {
        self.methods.insert(method.type_name(), method);
    }

    pub fn get(&self, type_name: &str) -> Option<&dyn AuthMethod> {
        self.methods.get(type_name).map(|m| m.as_ref())
    }

    /// The stock setup: standard credentials always, JWT when a verification
    /// secret is configured.
    pub fn with_defaults(jwt_secret: Option<&str>) -> Self {
        let mut registry = AuthRegistry::new();
        registry.register(Box::new(StdAuth));
        if let Some(secret) = jwt_secret {
            registry.register(Box::new(JwtAuth::new(secret)));
        }
        registry
    }
}

/// Standard credentials: the caller asserts its own identity. Basic class,
/// so issuance falls under the per-role approval policy.
pub struct StdAuth;

impl AuthMethod for StdAuth {
    fn type_name(&self) -> &'static str {
        "std"
    }

    fn method_class(&self) -> MethodClass {
        MethodClass::Basic
    }

    fn verifier_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn verify(&self, ccr: &CertCreationRequest) -> CmsResult<Credentials> {
        if ccr.name.is_empty() {
            return Err(CmsError::AuthReject("empty name".into()));
        }
        Ok(Credentials {
            name: ccr.name.clone(),
            organization: ccr.organization.clone(),
            organization_unit: ccr.organization_unit.clone(),
            country: ccr.country.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[allow(dead_code)]
    exp: i64,
}

/// JWT bearer tokens verified against a shared secret. Strong class: the
/// token issuer already authenticated the subject.
pub struct JwtAuth {
    decoding_key: DecodingKey,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        JwtAuth {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

impl AuthMethod for JwtAuth {
    fn type_name(&self) -> &'static str {
        "jwt"
    }

    fn method_class(&self) -> MethodClass {
        MethodClass::Strong
    }

    fn verifier_fields(&self) -> &'static [&'static str] {
        &["token"]
    }

    fn verify(&self, ccr: &CertCreationRequest) -> CmsResult<Credentials> {
        let token = ccr
            .verifier
            .get("token")
            .ok_or_else(|| CmsError::AuthReject("missing token".into()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["sub", "exp"]);
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| CmsError::AuthReject(format!("token rejected: {e}")))?;

        if data.claims.sub != ccr.name {
            return Err(CmsError::AuthReject(format!(
                "token subject {:?} does not match requested name {:?}",
                data.claims.sub, ccr.name
            )));
        }

        Ok(Credentials {
            name: data.claims.sub,
            organization: ccr.organization.clone(),
            organization_unit: ccr.organization_unit.clone(),
            country: ccr.country.clone(),
        })
    }
}
