use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// SQLite certificate database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Unix socket for the management channel.
    #[serde(default = "default_admin_socket_path")]
    pub admin_socket_path: PathBuf,
    /// Access control file listing administrator names.
    #[serde(default = "default_acf_path")]
    pub acf_path: PathBuf,
    /// Minutes a signed status response stays valid before peers must
    /// re-request an update.
    #[serde(default = "default_status_validity_mins")]
    pub cert_status_validity_mins: u32,
    /// Shared secret enabling the JWT authentication method.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            admin_socket_path: default_admin_socket_path(),
            acf_path: default_acf_path(),
            cert_status_validity_mins: default_status_validity_mins(),
            jwt_secret: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("certs.db")
}

fn default_admin_socket_path() -> PathBuf {
    PathBuf::from("/tmp/pvacms.sock")
}

fn default_acf_path() -> PathBuf {
    PathBuf::from("pvacms.acf")
}

fn default_status_validity_mins() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaConfig {
    /// PKCS#12 keychain holding the CA certificate, key, and chain.
    #[serde(default = "default_ca_keychain_path")]
    pub ca_keychain_path: PathBuf,
    #[serde(default)]
    pub ca_keychain_password: Option<SecretString>,
    /// Separate private key file; the keychain is used when absent.
    #[serde(default)]
    pub ca_private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_private_key_password: Option<SecretString>,
    /// PKCS#12 keychain for the service's own server certificate.
    #[serde(default = "default_pvacms_keychain_path")]
    pub pvacms_keychain_path: PathBuf,
    #[serde(default)]
    pub pvacms_keychain_password: Option<SecretString>,
    /// Keychain for the admin user's certificate.
    #[serde(default)]
    pub admin_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub admin_cert_password: Option<SecretString>,
    // Subject used when the CA certificate is generated on first start.
    #[serde(default = "default_ca_name")]
    pub ca_name: String,
    #[serde(default = "default_ca_organization")]
    pub ca_organization: String,
    #[serde(default = "default_ca_organizational_unit")]
    pub ca_organizational_unit: String,
    #[serde(default)]
    pub ca_country: String,
    // Subject used when the service certificate is generated on first start.
    #[serde(default = "default_pvacms_name")]
    pub pvacms_name: String,
    #[serde(default = "default_ca_organization")]
    pub pvacms_organization: String,
    #[serde(default = "default_pvacms_organizational_unit")]
    pub pvacms_organizational_unit: String,
    #[serde(default)]
    pub pvacms_country: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            ca_keychain_path: default_ca_keychain_path(),
            ca_keychain_password: None,
            ca_private_key_path: None,
            ca_private_key_password: None,
            pvacms_keychain_path: default_pvacms_keychain_path(),
            pvacms_keychain_password: None,
            admin_cert_path: None,
            admin_cert_password: None,
            ca_name: default_ca_name(),
            ca_organization: default_ca_organization(),
            ca_organizational_unit: default_ca_organizational_unit(),
            ca_country: String::new(),
            pvacms_name: default_pvacms_name(),
            pvacms_organization: default_ca_organization(),
            pvacms_organizational_unit: default_pvacms_organizational_unit(),
            pvacms_country: String::new(),
        }
    }
}

fn default_ca_keychain_path() -> PathBuf {
    PathBuf::from("ca.p12")
}

fn default_pvacms_keychain_path() -> PathBuf {
    PathBuf::from("server.p12")
}

fn default_ca_name() -> String {
    "EPICS Root CA".to_string()
}

fn default_ca_organization() -> String {
    "ca.epics.org".to_string()
}

fn default_ca_organizational_unit() -> String {
    "EPICS Certificate Authority".to_string()
}

fn default_pvacms_name() -> String {
    "PVACMS Service".to_string()
}

fn default_pvacms_organizational_unit() -> String {
    "EPICS PVA Certificate Management Service".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApprovalConfig {
    /// Require admin approval of basic-credential client certificates.
    #[serde(default = "default_true")]
    pub cert_client_require_approval: bool,
    /// Require admin approval of basic-credential server certificates.
    #[serde(default = "default_true")]
    pub cert_server_require_approval: bool,
    /// Require admin approval of basic-credential gateway certificates.
    #[serde(default = "default_true")]
    pub cert_gateway_require_approval: bool,
    /// Stamp the status-PV extension into issued certificates so holders
    /// and their peers subscribe for revocation status.
    #[serde(default = "default_true")]
    pub cert_status_subscription: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            cert_client_require_approval: true,
            cert_server_require_approval: true,
            cert_gateway_require_approval: true,
            cert_status_subscription: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClientConfig {
    /// Accept a self-signed CA as its own trust anchor when verifying OCSP
    /// responses.
    #[serde(default)]
    pub allow_self_signed_ca: bool,
    /// Extra hashed trust directory consulted during OCSP verification.
    #[serde(default)]
    pub trusted_ca_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (pvacms.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("pvacms.toml")
    }
}

/// Administrator names read from the access control file: one name per
/// line, `#` comments and blank lines ignored.
pub fn load_admin_list(path: &std::path::Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .context(format!("Failed to read ACF file: {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
