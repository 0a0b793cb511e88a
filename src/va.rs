//! Validation authority: asynchronous challenge probes.
//!
//! Each dispatch becomes one independent worker task. A worker runs a
//! per-challenge sanity check, performs the network probe under a hard 5
//! second timeout, then reports the updated authorization back into the
//! registration authority exactly once. Workers share no mutable state.

use std::sync::{Arc, OnceLock};

use der::Decode as _;
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq as _;
use tokio::net::TcpStream;

use crate::{
    api::{Authorization, Challenge, ChallengeDetails, ChallengeStatus, Identifier, Problem},
    csr,
    error::{Error, Result},
    ra::RegistrationAuthority,
    util,
};

const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const MAX_PROBE_BODY: usize = 4096;
const DVSNI_SUFFIX: &str = ".acme.invalid";

pub trait ValidationAuthority: Send + Sync {
    /// Dispatch an asynchronous probe for one challenge of `authz`.
    /// Returns as soon as the worker is spawned.
    fn update_validations(&self, authz: Authorization, challenge_index: usize) -> Result<()>;
}

pub struct ValidationAuthorityImpl {
    ra: OnceLock<Arc<dyn RegistrationAuthority>>,
    /// Test-mode host:port override. When set, simpleHttps probes go over
    /// plain HTTP to this address and dvsni probes dial it.
    probe_override: Option<String>,
}

impl ValidationAuthorityImpl {
    pub fn new(probe_override: Option<String>) -> Self {
        ValidationAuthorityImpl {
            ra: OnceLock::new(),
            probe_override,
        }
    }

    /// Wire in the callback target. The registration authority holds the
    /// validation authority and vice versa, so this is set after both are
    /// constructed.
    pub fn set_registration_authority(&self, ra: Arc<dyn RegistrationAuthority>) {
        let _ = self.ra.set(ra);
    }
}

impl ValidationAuthority for ValidationAuthorityImpl {
    fn update_validations(&self, authz: Authorization, challenge_index: usize) -> Result<()> {
        let ra = self
            .ra
            .get()
            .cloned()
            .ok_or_else(|| Error::internal("Validation authority is not wired to a callback"))?;
        let prober = Prober {
            probe_override: self.probe_override.clone(),
        };

        tokio::spawn(async move {
            let id = authz.id.clone();
            let requester = authz.registration_id;
            let started = std::time::Instant::now();

            let updated = prober.validate(authz, challenge_index).await;

            let challenge = updated.challenges.get(challenge_index);
            tracing::info!(
                authz_id = %id,
                requester,
                challenge_index,
                status = ?challenge.map(|c| c.status),
                error = challenge.and_then(|c| c.error.as_ref()).and_then(|e| e.detail.as_deref()),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "validation result"
            );

            if let Err(err) = ra.on_validation_update(updated) {
                tracing::warn!(authz_id = %id, %err, "failed to record validation result");
            }
        });

        Ok(())
    }
}

#[derive(Clone)]
struct Prober {
    probe_override: Option<String>,
}

impl Prober {
    /// Run one challenge to completion and return the authorization with
    /// the challenge's status (and error detail, on failure) updated.
    async fn validate(&self, mut authz: Authorization, challenge_index: usize) -> Authorization {
        let identifier = authz.identifier.clone();
        let Some(challenge) = authz.challenges.get_mut(challenge_index) else {
            tracing::warn!(authz_id = %authz.id, challenge_index, "challenge index out of range");
            return authz;
        };

        if let Err(err) = sanity_check(challenge) {
            fail(challenge, err);
            return authz;
        }

        let outcome = match challenge.details.clone() {
            ChallengeDetails::SimpleHttps { token, path } => {
                self.validate_simple_https(&identifier, &token, &path).await
            }
            ChallengeDetails::Dvsni { r, s, nonce } => {
                self.validate_dvsni(&identifier, &r, &s, &nonce).await
            }
        };

        match outcome {
            Ok(()) => challenge.status = ChallengeStatus::Valid,
            Err(err) => fail(challenge, err),
        }

        authz
    }

    async fn validate_simple_https(
        &self,
        identifier: &Identifier,
        token: &str,
        path: &str,
    ) -> Result<()> {
        let (host, scheme) = match &self.probe_override {
            Some(host_port) => (host_port.clone(), "http"),
            None => (identifier.value.clone(), "https"),
        };
        let url = format!("{scheme}://{host}/.well-known/acme-challenge/{path}");

        tracing::info!(%url, "attempting simpleHttps validation");

        // the endpoint cannot have a real certificate yet, and one fetch
        // is all we need from it
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(0)
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|err| Error::internal(format!("Failed to build probe client: {err}")))?;

        let mut response = client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::unauthorized(format!("Could not connect to {url}: {err}")))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::unauthorized(format!(
                "Invalid response from {url}: {}",
                response.status().as_u16()
            )));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| Error::unauthorized(format!("Failed reading {url}: {err}")))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > MAX_PROBE_BODY {
                return Err(Error::unauthorized(format!(
                    "Oversized response from {url}"
                )));
            }
        }

        if bool::from(body.as_slice().ct_eq(token.as_bytes())) {
            Ok(())
        } else {
            Err(Error::unauthorized(format!(
                "Incorrect token validating simpleHttps for {url}"
            )))
        }
    }

    async fn validate_dvsni(
        &self,
        identifier: &Identifier,
        r: &str,
        s: &str,
        nonce: &str,
    ) -> Result<()> {
        let z_name = compute_z_name(r, s)?;
        let nonce_name = format!("{nonce}{DVSNI_SUFFIX}");

        let host_port = match &self.probe_override {
            Some(host_port) => host_port.clone(),
            None => format!("{}:443", identifier.value),
        };

        tracing::info!(%host_port, %z_name, "attempting DVSNI validation");

        let verifier = Arc::new(AcceptAnyServerCert);
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::internal(format!("TLS configuration failed: {err}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let server_name = rustls::pki_types::ServerName::try_from(nonce_name.clone())
            .map_err(|_| Error::unauthorized("Invalid SNI name for DVSNI challenge"))?;

        let tcp = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&host_port))
            .await
            .map_err(|_| Error::unauthorized("Timed out connecting for DVSNI challenge"))?
            .map_err(|err| {
                Error::unauthorized(format!("Failed to connect to host for DVSNI: {err}"))
            })?;

        let tls = tokio::time::timeout(PROBE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::unauthorized("Timed out in TLS handshake for DVSNI challenge"))?
            .map_err(|err| Error::unauthorized(format!("TLS handshake failed for DVSNI: {err}")))?;

        let (_, session) = tls.get_ref();
        let peer_certs = session
            .peer_certificates()
            .filter(|certs| !certs.is_empty())
            .ok_or_else(|| Error::unauthorized("No certs presented for DVSNI challenge"))?;

        let leaf = x509_cert::Certificate::from_der(peer_certs[0].as_ref())
            .map_err(|_| Error::unauthorized("Unparseable certificate for DVSNI challenge"))?;
        let extensions = leaf.tbs_certificate.extensions.unwrap_or_default();

        for name in csr::dns_names_from_extensions(&extensions) {
            if bool::from(name.as_bytes().ct_eq(z_name.as_bytes())) {
                return Ok(());
            }
        }

        Err(Error::unauthorized(
            "Correct zName not found for DVSNI challenge",
        ))
    }
}

fn fail(challenge: &mut Challenge, err: Error) {
    challenge.status = ChallengeStatus::Invalid;
    challenge.error = Some(Problem {
        _type: format!("urn:acme:error:{}", err.kind()),
        detail: Some(err.to_string()),
    });
}

/// The validation name a dvsni responder must present:
/// `hex(SHA256(R || S))` followed by the `.acme.invalid` suffix.
fn compute_z_name(r: &str, s: &str) -> Result<String> {
    let r = util::base64url_decode(r)
        .map_err(|_| Error::unauthorized("Failed to decode R value from DVSNI challenge"))?;
    let s = util::base64url_decode(s)
        .map_err(|_| Error::unauthorized("Failed to decode S value from DVSNI challenge"))?;

    let mut hasher = Sha256::new();
    hasher.update(&r);
    hasher.update(&s);
    let z = hasher.finalize();

    Ok(format!("{}{DVSNI_SUFFIX}", hex::encode(z)))
}

/// Pre-probe gate. Failures skip network I/O entirely.
fn sanity_check(challenge: &Challenge) -> Result<()> {
    match &challenge.details {
        ChallengeDetails::SimpleHttps { token, path } => {
            if token.is_empty() {
                return Err(Error::malformed("No token in simpleHttps challenge"));
            }
            if path.is_empty() {
                return Err(Error::malformed("No path provided for SimpleHTTPS challenge"));
            }
            if !path
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'~' | b'.'))
            {
                return Err(Error::malformed("Path is not URL-safe"));
            }
            Ok(())
        }
        ChallengeDetails::Dvsni { r, s, nonce } => {
            let r = util::base64url_decode(r)
                .map_err(|_| Error::malformed("Undecodable R value in DVSNI challenge"))?;
            let s = util::base64url_decode(s)
                .map_err(|_| Error::malformed("Undecodable S value in DVSNI challenge"))?;
            if r.len() != 32 || s.len() != 32 {
                return Err(Error::malformed("DVSNI R or S has the wrong length"));
            }
            let nonce = hex::decode(nonce)
                .map_err(|_| Error::malformed("Undecodable nonce in DVSNI challenge"))?;
            if nonce.len() != 16 {
                return Err(Error::malformed("DVSNI nonce has the wrong length"));
            }
            Ok(())
        }
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert;

// The probe target is by definition untrusted during bootstrap; the
// challenge semantics live in the presented names, not in chain trust.
impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        api::{AuthorizationStatus, ChallengeResponse, Identifier, Registration},
        ra::{RegistrationAuthority as _, RegistrationAuthorityImpl},
        sa::{MemoryStorage, StorageAuthority as _},
        test,
    };

    fn pending_authz_with(details: ChallengeDetails) -> Authorization {
        let mut authz = Authorization::request(Identifier::dns("not-example.com"));
        authz.id = "sanity".to_owned();
        authz.registration_id = 1;
        authz.challenges = vec![Challenge {
            details,
            status: ChallengeStatus::Pending,
            uri: String::new(),
            error: None,
        }];
        authz.combinations = vec![vec![0]];
        authz
    }

    fn prober() -> Prober {
        Prober {
            probe_override: None,
        }
    }

    #[tokio::test]
    async fn test_sanity_gate_empty_path() {
        let authz = pending_authz_with(ChallengeDetails::SimpleHttps {
            token: "token".to_owned(),
            path: String::new(),
        });
        let updated = prober().validate(authz, 0).await;
        assert_eq!(updated.challenges[0].status, ChallengeStatus::Invalid);
        let detail = updated.challenges[0]
            .error
            .as_ref()
            .and_then(|e| e.detail.as_deref())
            .unwrap();
        assert_eq!(detail, "No path provided for SimpleHTTPS challenge");
    }

    #[tokio::test]
    async fn test_sanity_gate_unsafe_path() {
        let authz = pending_authz_with(ChallengeDetails::SimpleHttps {
            token: "token".to_owned(),
            path: "../../etc/passwd".to_owned(),
        });
        let updated = prober().validate(authz, 0).await;
        assert_eq!(updated.challenges[0].status, ChallengeStatus::Invalid);
    }

    #[tokio::test]
    async fn test_sanity_gate_dvsni_material() {
        // undecodable R
        let authz = pending_authz_with(ChallengeDetails::Dvsni {
            r: "!!not-base64!!".to_owned(),
            s: crate::util::random_token(32),
            nonce: "f011c9a0ce1a4fe0f18f2252d64c4239".to_owned(),
        });
        let updated = prober().validate(authz, 0).await;
        assert_eq!(updated.challenges[0].status, ChallengeStatus::Invalid);

        // nonce of the wrong length
        let authz = pending_authz_with(ChallengeDetails::Dvsni {
            r: crate::util::random_token(32),
            s: crate::util::random_token(32),
            nonce: "f011c9".to_owned(),
        });
        let updated = prober().validate(authz, 0).await;
        assert_eq!(updated.challenges[0].status, ChallengeStatus::Invalid);

        // S of the wrong length
        let authz = pending_authz_with(ChallengeDetails::Dvsni {
            r: crate::util::random_token(32),
            s: crate::util::random_token(16),
            nonce: "f011c9a0ce1a4fe0f18f2252d64c4239".to_owned(),
        });
        let updated = prober().validate(authz, 0).await;
        assert_eq!(updated.challenges[0].status, ChallengeStatus::Invalid);
    }

    #[test]
    fn test_z_name_shape() {
        let r = crate::util::random_token(32);
        let s = crate::util::random_token(32);
        let z_name = compute_z_name(&r, &s).unwrap();
        assert!(z_name.ends_with(".acme.invalid"));
        let digits = z_name.strip_suffix(".acme.invalid").unwrap();
        assert_eq!(digits.len(), 64);
        assert!(digits.bytes().all(|b| b.is_ascii_hexdigit()));

        // must equal SHA256 over the concatenated raw values
        let mut hasher = Sha256::new();
        hasher.update(crate::util::base64url_decode(&r).unwrap());
        hasher.update(crate::util::base64url_decode(&s).unwrap());
        assert!(digits == hex::encode(hasher.finalize()));
    }

    /// Full loop: update a pending authorization, let the real validation
    /// authority probe a local challenge server, and watch the
    /// registration authority finalize it.
    #[tokio::test]
    async fn test_simple_https_validation_end_to_end() {
        let token = "pDX9vBFJ043_gEc9Wyp8of-SqZMN2H3-fvj5iUgP7mg";
        let path = "Hf5GrX4Q7EBax9hc2jJnfw";
        let server = test::with_challenge_server(path, token);

        let sa = Arc::new(MemoryStorage::new());
        let va = Arc::new(ValidationAuthorityImpl::new(Some(server.addr.clone())));
        let ra = Arc::new(RegistrationAuthorityImpl::new(
            sa.clone(),
            va.clone(),
            Arc::new(test::MockCa),
            Arc::new(crate::policy::PolicyAuthorityImpl::new()),
            "http://acme.invalid/authz/".to_owned(),
            test::AGREEMENT_URL.to_owned(),
            2048,
        ));
        va.set_registration_authority(ra.clone());

        sa.new_registration(Registration {
            key: Some(serde_json::from_str(test::ACCOUNT_KEY_A_JSON).unwrap()),
            ..Default::default()
        })
        .unwrap();

        let request = Authorization::request(Identifier::dns("not-example.com"));
        let mut authz = ra.new_authorization(request, 1).unwrap();
        // pin the token so the challenge server content matches
        match &mut authz.challenges[0].details {
            ChallengeDetails::SimpleHttps { token: t, .. } => *t = token.to_owned(),
            _ => unreachable!(),
        }
        sa.update_pending_authorization(authz.clone()).unwrap();

        let response = ChallengeResponse {
            path: Some(path.to_owned()),
            ..Default::default()
        };
        let updated = ra.update_authorization(authz, 0, response).unwrap();
        // dispatch returns synchronously while the probe runs
        assert_eq!(updated.status, AuthorizationStatus::Pending);

        let mut finalized = None;
        for _ in 0..100 {
            let current = sa.get_authorization(&updated.id).unwrap().unwrap();
            if current.status != AuthorizationStatus::Pending {
                finalized = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let finalized = finalized.expect("validation did not finalize the authorization");
        assert_eq!(finalized.status, AuthorizationStatus::Valid);
        assert!(finalized.expires.is_some());
        assert_eq!(finalized.challenges[0].status, ChallengeStatus::Valid);
    }

    /// A mismatched token must finalize the authorization as invalid.
    #[tokio::test]
    async fn test_simple_https_wrong_token_end_to_end() {
        let path = "Hf5GrX4Q7EBax9hc2jJnfw";
        let server = test::with_challenge_server(path, "not-the-right-token");

        let sa = Arc::new(MemoryStorage::new());
        let va = Arc::new(ValidationAuthorityImpl::new(Some(server.addr.clone())));
        let ra = Arc::new(RegistrationAuthorityImpl::new(
            sa.clone(),
            va.clone(),
            Arc::new(test::MockCa),
            Arc::new(crate::policy::PolicyAuthorityImpl::new()),
            "http://acme.invalid/authz/".to_owned(),
            test::AGREEMENT_URL.to_owned(),
            2048,
        ));
        va.set_registration_authority(ra.clone());

        sa.new_registration(Registration {
            key: Some(serde_json::from_str(test::ACCOUNT_KEY_A_JSON).unwrap()),
            ..Default::default()
        })
        .unwrap();

        let request = Authorization::request(Identifier::dns("not-example.com"));
        let authz = ra.new_authorization(request, 1).unwrap();
        let response = ChallengeResponse {
            path: Some(path.to_owned()),
            ..Default::default()
        };
        let updated = ra.update_authorization(authz, 0, response).unwrap();

        let mut finalized = None;
        for _ in 0..100 {
            let current = sa.get_authorization(&updated.id).unwrap().unwrap();
            if current.status != AuthorizationStatus::Pending {
                finalized = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let finalized = finalized.expect("validation did not finalize the authorization");
        assert_eq!(finalized.status, AuthorizationStatus::Invalid);
        let detail = finalized.challenges[0]
            .error
            .as_ref()
            .and_then(|e| e.detail.as_deref())
            .unwrap();
        assert!(detail.contains("Incorrect token"));
    }
}
