//! `acmed`: wires the web front end, registration authority, and
//! validation authority together over an in-memory store and a local
//! signer, and serves the subscriber API.

use std::{path::PathBuf, sync::Arc};

use actix_web::{App, HttpServer};
use clap::Parser;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use acme_issuer::{
    ca::CaSigner,
    policy::PolicyAuthorityImpl,
    ra::RegistrationAuthorityImpl,
    sa::MemoryStorage,
    va::ValidationAuthorityImpl,
    wfe::{self, WebFrontEnd},
};

#[derive(Debug, Parser)]
#[command(name = "acmed", about = "ACME-style certificate issuance core")]
struct Config {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: String,

    /// Absolute URL prefix for Location/Link headers; empty means
    /// origin-relative.
    #[arg(long, default_value = "")]
    base_url: String,

    /// Current subscriber agreement URL.
    #[arg(long, default_value = "")]
    agreement_url: String,

    /// PEM file with the CA signing key (PKCS#1).
    #[arg(long)]
    ca_key: PathBuf,

    /// PEM file with the CA certificate.
    #[arg(long)]
    ca_cert: PathBuf,

    /// Certificate validity in days.
    #[arg(long, default_value_t = 90)]
    validity_days: i64,

    /// Hard ceiling on notAfter, in days from startup.
    #[arg(long, default_value_t = 365)]
    not_after_cap_days: i64,

    /// Minimum RSA modulus size accepted from subscribers.
    #[arg(long, default_value_t = 2048)]
    min_key_bits: usize,

    /// Maximum RSA modulus size the signer will certify.
    #[arg(long, default_value_t = 4096)]
    max_key_bits: usize,

    /// Test mode: host:port that challenge probes target instead of the
    /// identifier (simpleHttps downgrades to plain HTTP).
    #[arg(long)]
    probe_override: Option<String>,
}

#[actix_web::main]
async fn main() -> eyre::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();

    let key_pem = std::fs::read_to_string(&config.ca_key)?;
    let cert_pem = std::fs::read_to_string(&config.ca_cert)?;
    let ca = Arc::new(CaSigner::from_pem(
        &key_pem,
        &cert_pem,
        time::Duration::days(config.validity_days),
        OffsetDateTime::now_utc() + time::Duration::days(config.not_after_cap_days),
        config.max_key_bits,
    )?);

    let sa = Arc::new(MemoryStorage::new());
    let pa = Arc::new(PolicyAuthorityImpl::new());
    let va = Arc::new(ValidationAuthorityImpl::new(config.probe_override.clone()));

    let ra = Arc::new(RegistrationAuthorityImpl::new(
        sa.clone(),
        va.clone(),
        ca,
        pa,
        format!("{}{}", config.base_url, wfe::AUTHZ_PATH),
        config.agreement_url.clone(),
        config.min_key_bits,
    ));
    va.set_registration_authority(ra.clone());

    let wfe = Arc::new(WebFrontEnd {
        ra,
        sa,
        base_url: config.base_url.clone(),
    });

    tracing::info!(listen = %config.listen, "starting ACME issuance core");
    if let Some(probe_override) = &config.probe_override {
        tracing::warn!(%probe_override, "test mode: validation probes are redirected");
    }

    HttpServer::new(move || App::new().configure(wfe::configure(wfe.clone())))
        .bind(&config.listen)?
        .run()
        .await?;

    Ok(())
}
