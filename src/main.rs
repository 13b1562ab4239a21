//! PVACMS service binary: bootstrap the CA, open the store, start status
//! distribution, and serve the management channel.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pvacms::auth::AuthRegistry;
use pvacms::bus::{InProcessBus, StatusBus};
use pvacms::cert_factory::{create_cert_symlink, usage, CaMaterial, CertFactory};
use pvacms::configs::{load_admin_list, AppConfig};
use pvacms::crypto::{load_keychain, save_keychain, ski_hex, KeyPair};
use pvacms::expiry_monitor::{ExpiryMonitor, DEFAULT_SWEEP_PERIOD};
use pvacms::issuance::{generate_serial, ApprovalPolicy, IssuancePipeline};
use pvacms::status::{issuer_id, CertStatus};
use pvacms::status_factory::CertStatusFactory;
use pvacms::status_publisher::StatusPublisher;
use pvacms::store::{CertRecord, CertStore};
use pvacms::tls::StapleCache;

/// Lifetime of an auto-generated CA certificate.
const CA_VALIDITY_SECS: i64 = 10 * 365 * 86_400;
/// Lifetime of the auto-generated service certificate.
const SERVER_VALIDITY_SECS: i64 = 365 * 86_400;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pvacms=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = if Path::new("pvacms.toml").exists() {
        AppConfig::load()?
    } else {
        info!("no pvacms.toml found; using built-in defaults");
        AppConfig::default()
    };

    let store = Arc::new(CertStore::open(&config.service.db_path)?);

    let ca = get_or_create_ca(&config, &store)?;
    let our_issuer_id = issuer_id(&ca.cert)?;
    info!(issuer = %our_issuer_id, "certificate authority ready");

    let admins = match load_admin_list(&config.service.acf_path) {
        Ok(admins) => admins,
        Err(e) => {
            warn!(error = %e, "no ACF file; admin operations are disabled");
            Vec::new()
        }
    };

    let bus: Arc<dyn StatusBus> = Arc::new(InProcessBus::new());
    let staple = Arc::new(StapleCache::new());
    let publisher = Arc::new(StatusPublisher::new(
        Arc::clone(&store),
        CertStatusFactory::new(ca.clone(), config.service.cert_status_validity_mins),
        bus,
        ca.clone(),
        our_issuer_id.clone(),
        admins,
        config.approval.cert_status_subscription,
        Arc::clone(&staple),
    ));

    let server_serial = ensure_server_certificate(&config, &store, &ca, &publisher)?;
    publisher.set_staple_serial(server_serial);

    let republished = publisher.prime()?;
    info!(republished, "status topics primed");
    publisher.publish_status(server_serial)?;

    let monitor = ExpiryMonitor::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        DEFAULT_SWEEP_PERIOD,
    );
    let sweep_task = monitor.spawn();

    let policy = ApprovalPolicy {
        client_require_approval: config.approval.cert_client_require_approval,
        server_require_approval: config.approval.cert_server_require_approval,
        gateway_require_approval: config.approval.cert_gateway_require_approval,
        status_subscription: config.approval.cert_status_subscription,
    };
    let pipeline = Arc::new(IssuancePipeline::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        ca,
        AuthRegistry::with_defaults(config.service.jwt_secret.as_deref()),
        policy,
    ));

    let channel = Arc::new(pvacms::admin_channel::AdminChannel::new(
        publisher,
        pipeline,
        config.service.admin_socket_path.clone(),
    ));

    tokio::select! {
        result = channel.serve() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    sweep_task.abort();
    Ok(())
}

/// Load the CA keychain, or generate a self-signed CA on first start.
fn get_or_create_ca(config: &AppConfig, store: &CertStore) -> Result<CaMaterial> {
    let keychain_path = &config.ca.ca_keychain_path;
    if keychain_path.exists() {
        let mut keychain = load_keychain(keychain_path, config.ca.ca_keychain_password.as_ref())
            .context("Failed to load CA keychain")?;
        if let Some(key_path) = &config.ca.ca_private_key_path {
            let key_only = load_keychain(key_path, config.ca.ca_private_key_password.as_ref())
                .context("Failed to load CA private key file")?;
            keychain.key = key_only.key;
        }
        return Ok(CaMaterial {
            cert: keychain.cert,
            key: keychain.key,
            chain: keychain.chain,
        });
    }

    info!("no CA keychain found; generating a certificate authority");
    let key_pair = KeyPair::generate()?;
    let now = Utc::now().timestamp();
    let serial = generate_serial()?;
    let signed = CertFactory::new(serial, key_pair.public_key()?)
        .common_name(&config.ca.ca_name)
        .organization(&config.ca.ca_organization)
        .organizational_unit(&config.ca.ca_organizational_unit)
        .country(&config.ca.ca_country)
        .validity(now, now + CA_VALIDITY_SECS)
        .usage(usage::CA)
        .self_signed(key_pair.pkey.clone())
        .build()?;

    store.insert(&CertRecord {
        serial,
        skid: ski_hex(&key_pair.pkey)?,
        cn: config.ca.ca_name.clone(),
        o: config.ca.ca_organization.clone(),
        ou: config.ca.ca_organizational_unit.clone(),
        c: config.ca.ca_country.clone(),
        not_before: now,
        not_after: now + CA_VALIDITY_SECS,
        status: CertStatus::Valid,
        status_date: now,
    })?;

    save_keychain(
        keychain_path,
        "pvacms-ca",
        &key_pair.pkey,
        &signed.cert,
        &[],
        config.ca.ca_keychain_password.as_ref(),
    )?;

    // Drop a PEM copy with its hash link next to the keychain so the
    // directory can be used directly as a trust anchor store.
    let pem_path = keychain_path.with_extension("pem");
    fs::write(&pem_path, signed.cert.to_pem()?)
        .with_context(|| format!("Failed to write {}", pem_path.display()))?;
    if let Err(e) = create_cert_symlink(&pem_path) {
        warn!(error = %e, "unable to create trust-directory link for the CA certificate");
    }

    info!(serial, cn = %config.ca.ca_name, "certificate authority created");
    Ok(CaMaterial {
        cert: signed.cert,
        key: key_pair.pkey,
        chain: Vec::new(),
    })
}

/// Make sure the service's own server certificate exists; returns its
/// serial for the stapling cache.
fn ensure_server_certificate(
    config: &AppConfig,
    store: &CertStore,
    ca: &CaMaterial,
    publisher: &StatusPublisher,
) -> Result<u64> {
    let keychain_path = &config.ca.pvacms_keychain_path;
    if keychain_path.exists() {
        let keychain = load_keychain(keychain_path, config.ca.pvacms_keychain_password.as_ref())
            .context("Failed to load service keychain")?;
        let serial = pvacms::peer_status::CertStatusManager::serial_of(&keychain.cert)?;
        return Ok(serial);
    }

    info!("no service keychain found; issuing the service certificate");
    let key_pair = KeyPair::generate()?;
    let now = Utc::now().timestamp();
    let serial = generate_serial()?;

    store.insert(&CertRecord {
        serial,
        skid: ski_hex(&key_pair.pkey)?,
        cn: config.ca.pvacms_name.clone(),
        o: config.ca.pvacms_organization.clone(),
        ou: config.ca.pvacms_organizational_unit.clone(),
        c: config.ca.pvacms_country.clone(),
        not_before: now,
        not_after: now + SERVER_VALIDITY_SECS,
        status: CertStatus::Valid,
        status_date: now,
    })?;

    let mut factory = CertFactory::new(serial, key_pair.public_key()?)
        .common_name(&config.ca.pvacms_name)
        .organization(&config.ca.pvacms_organization)
        .organizational_unit(&config.ca.pvacms_organizational_unit)
        .country(&config.ca.pvacms_country)
        .validity(now, now + SERVER_VALIDITY_SECS)
        .usage(usage::SERVER)
        .issued_by(ca);
    if config.approval.cert_status_subscription {
        let pv = publisher.pv_name(serial);
        factory = factory.status_pv(&pv);
    }
    let signed = factory.build()?;

    save_keychain(
        keychain_path,
        "pvacms-server",
        &key_pair.pkey,
        &signed.cert,
        &[ca.cert.clone()],
        config.ca.pvacms_keychain_password.as_ref(),
    )?;

    info!(serial, cn = %config.ca.pvacms_name, "service certificate issued");
    Ok(serial)
}
