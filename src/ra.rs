//! Registration authority: the central policy and state-transition engine.
//!
//! Every business invariant lives here. The web front end authenticates
//! requests and hands them over; the storage, policy, certificate, and
//! validation authorities are consulted through the trait objects this
//! struct is constructed with. The authority keeps no state of its own and
//! is safe for concurrent invocation.

use std::{collections::HashSet, sync::Arc};

use time::OffsetDateTime;
use x509_cert::request::CertReq;

use crate::{
    api::{
        Authorization, AuthorizationStatus, Certificate, Challenge, ChallengeDetails,
        ChallengeKind, ChallengeResponse, ChallengeStatus, Registration,
    },
    ca::CertificateAuthority,
    csr,
    error::{Error, Result},
    policy::PolicyAuthority,
    sa::StorageAuthority,
    util,
    va::ValidationAuthority,
};

/// The operations the web front end and the validation authority invoke.
pub trait RegistrationAuthority: Send + Sync {
    fn new_registration(&self, input: Registration) -> Result<Registration>;

    fn update_registration(&self, base: Registration, updates: Registration)
        -> Result<Registration>;

    fn new_authorization(&self, request: Authorization, registration_id: i64)
        -> Result<Authorization>;

    fn update_authorization(
        &self,
        authz: Authorization,
        challenge_index: usize,
        response: ChallengeResponse,
    ) -> Result<Authorization>;

    /// Callback from the validation authority. The registration authority
    /// is the sole writer that moves an authorization out of `pending`;
    /// calls against a finalized authorization are no-ops.
    fn on_validation_update(&self, authz: Authorization) -> Result<()>;

    fn new_certificate(&self, request: IssuanceRequest, registration_id: i64)
        -> Result<Certificate>;
}

/// A decoded issuance request: the parsed CSR and the authorization URIs
/// claimed to cover its names.
#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    pub csr: CertReq,
    pub authorizations: Vec<String>,
}

pub struct RegistrationAuthorityImpl {
    sa: Arc<dyn StorageAuthority>,
    va: Arc<dyn ValidationAuthority>,
    ca: Arc<dyn CertificateAuthority>,
    pa: Arc<dyn PolicyAuthority>,
    /// Prefix for challenge URIs, e.g. `http://.../acme/authz/`.
    authz_base: String,
    subscriber_agreement_url: String,
    min_key_bits: usize,
    authorization_lifetime: time::Duration,
}

const ALLOWED_CONTACT_SCHEMES: &[&str] = &["mailto", "tel"];

impl RegistrationAuthorityImpl {
    pub fn new(
        sa: Arc<dyn StorageAuthority>,
        va: Arc<dyn ValidationAuthority>,
        ca: Arc<dyn CertificateAuthority>,
        pa: Arc<dyn PolicyAuthority>,
        authz_base: String,
        subscriber_agreement_url: String,
        min_key_bits: usize,
    ) -> Self {
        RegistrationAuthorityImpl {
            sa,
            va,
            ca,
            pa,
            authz_base,
            subscriber_agreement_url,
            min_key_bits,
            authorization_lifetime: time::Duration::days(365),
        }
    }

    fn validate_contacts(&self, contacts: &[String]) -> Result<()> {
        for contact in contacts {
            let parsed = url::Url::parse(contact)
                .map_err(|_| Error::malformed(format!("Invalid contact URI: {contact}")))?;
            if !ALLOWED_CONTACT_SCHEMES.contains(&parsed.scheme()) {
                return Err(Error::malformed(format!(
                    "Contact scheme '{}' is not supported",
                    parsed.scheme()
                )));
            }
        }
        Ok(())
    }

    fn validate_agreement(&self, agreement: &str) -> Result<()> {
        if agreement != self.subscriber_agreement_url {
            return Err(Error::malformed(format!(
                "Provided agreement URL [{agreement}] does not match current agreement URL [{}]",
                self.subscriber_agreement_url
            )));
        }
        Ok(())
    }
}

impl RegistrationAuthority for RegistrationAuthorityImpl {
    fn new_registration(&self, input: Registration) -> Result<Registration> {
        let key = input
            .key
            .clone()
            .ok_or_else(|| Error::malformed("No key in registration"))?;
        key.check_strength(self.min_key_bits)?;

        if self.sa.get_registration_by_key(&key)?.is_some() {
            return Err(Error::malformed("key is already in use"));
        }

        self.validate_contacts(&input.contact)?;

        // an agreement may be accepted at creation, but anything other
        // than the current terms URL is discarded
        let agreement = if input.agreement == self.subscriber_agreement_url {
            input.agreement
        } else {
            String::new()
        };

        // id and recoveryToken are server-authoritative; whatever the
        // subscriber sent is dropped here
        let registration = Registration {
            id: 0,
            key: Some(key),
            contact: input.contact,
            agreement,
            recovery_token: util::random_token(32),
        };

        let registration = self.sa.new_registration(registration)?;
        tracing::info!(id = registration.id, "new registration");
        Ok(registration)
    }

    fn update_registration(
        &self,
        base: Registration,
        updates: Registration,
    ) -> Result<Registration> {
        let mut registration = base;

        // field-merge policy: only contact and agreement may change
        if !updates.contact.is_empty() {
            self.validate_contacts(&updates.contact)?;
            registration.contact = updates.contact;
        }
        if !updates.agreement.is_empty() {
            self.validate_agreement(&updates.agreement)?;
            registration.agreement = updates.agreement;
        }

        self.sa.update_registration(registration.clone())?;
        Ok(registration)
    }

    fn new_authorization(
        &self,
        request: Authorization,
        registration_id: i64,
    ) -> Result<Authorization> {
        if registration_id <= 0 {
            return Err(Error::malformed("Invalid registration ID"));
        }
        self.sa
            .get_registration(registration_id)?
            .ok_or_else(|| Error::malformed("Invalid registration ID"))?;

        let identifier = request.identifier;
        self.pa.willing_to_issue(&identifier)?;

        let (kinds, combinations) = self.pa.challenges_for(&identifier)?;

        let id = util::random_token(32);
        let mut challenges = Vec::with_capacity(kinds.len());
        for (index, kind) in kinds.iter().enumerate() {
            let mut challenge = match kind {
                ChallengeKind::SimpleHttps => Challenge::simple_https(util::random_token(32)),
                ChallengeKind::Dvsni => {
                    Challenge::dvsni(util::random_token(32), util::random_hex(16))
                }
            };
            challenge.uri = format!("{}{id}?challenge={index}", self.authz_base);
            challenges.push(challenge);
        }

        let authz = Authorization {
            id,
            registration_id,
            identifier,
            status: AuthorizationStatus::Pending,
            expires: None,
            challenges,
            combinations,
        };

        self.sa.new_pending_authorization(authz)
    }

    fn update_authorization(
        &self,
        mut authz: Authorization,
        challenge_index: usize,
        response: ChallengeResponse,
    ) -> Result<Authorization> {
        if authz.status != AuthorizationStatus::Pending {
            return Err(Error::malformed(
                "Only pending authorizations can be updated",
            ));
        }
        let challenge = authz
            .challenges
            .get_mut(challenge_index)
            .ok_or_else(|| Error::malformed("Invalid challenge index"))?;

        // merge the client-controlled half only; server material is
        // untouchable
        match &mut challenge.details {
            ChallengeDetails::SimpleHttps { path, .. } => {
                if let Some(value) = response.path {
                    *path = value;
                }
            }
            ChallengeDetails::Dvsni { s, .. } => {
                if let Some(value) = response.s {
                    *s = value;
                }
            }
        }

        self.sa.update_pending_authorization(authz.clone())?;

        // dispatch returns immediately; the probe runs on a worker and
        // re-enters through on_validation_update
        self.va.update_validations(authz.clone(), challenge_index)?;

        Ok(authz)
    }

    fn on_validation_update(&self, authz: Authorization) -> Result<()> {
        let current = self
            .sa
            .get_authorization(&authz.id)?
            .ok_or_else(|| Error::internal("Validation update for unknown authorization"))?;
        if current.status != AuthorizationStatus::Pending {
            // already finalized; repeated callbacks are no-ops
            return Ok(());
        }

        let mut authz = authz;

        let any_invalid = authz
            .challenges
            .iter()
            .any(|challenge| challenge.status == ChallengeStatus::Invalid);

        let satisfied = authz.combinations.iter().any(|combination| {
            !combination.is_empty()
                && combination.iter().all(|&index| {
                    authz
                        .challenges
                        .get(index)
                        .map(|challenge| challenge.status == ChallengeStatus::Valid)
                        .unwrap_or(false)
                })
        });

        if any_invalid {
            authz.status = AuthorizationStatus::Invalid;
        } else if satisfied {
            authz.status = AuthorizationStatus::Valid;
            authz.expires = Some(OffsetDateTime::now_utc() + self.authorization_lifetime);
        } else {
            // partial progress: keep pending, persist challenge statuses
            return self.sa.update_pending_authorization(authz);
        }

        tracing::info!(id = %authz.id, status = ?authz.status, "finalizing authorization");
        self.sa.finalize_authorization(authz)
    }

    fn new_certificate(
        &self,
        request: IssuanceRequest,
        registration_id: i64,
    ) -> Result<Certificate> {
        let csr = request.csr;

        let csr_key = csr::public_key_jwk(&csr)?;
        csr_key.check_strength(self.min_key_bits)?;

        let names = csr::requested_names(&csr);
        if names.is_empty() {
            return Err(Error::malformed("CSR contains no DNS names"));
        }

        let registration = self
            .sa
            .get_registration(registration_id)?
            .ok_or_else(|| Error::unauthorized("No such registration"))?;
        let account_key = registration
            .key
            .ok_or_else(|| Error::internal("Registration has no key"))?;
        if csr_key.digest_equals(&account_key) {
            return Err(Error::malformed(
                "Certificate public key must be different than account key",
            ));
        }

        let now = OffsetDateTime::now_utc();
        let mut earliest_expiry: Option<OffsetDateTime> = None;
        let mut covered = HashSet::new();

        for uri in &request.authorizations {
            let id = uri.rsplit('/').next().unwrap_or(uri);
            let authz = self
                .sa
                .get_authorization(id)?
                .ok_or_else(|| Error::unauthorized("Unknown authorization"))?;
            if authz.registration_id != registration_id {
                return Err(Error::unauthorized(
                    "Authorization belongs to a different registration",
                ));
            }
            if authz.status != AuthorizationStatus::Valid {
                return Err(Error::unauthorized("Authorization is not valid"));
            }
            let expires = authz
                .expires
                .ok_or_else(|| Error::internal("Valid authorization without expiry"))?;
            if expires <= now {
                return Err(Error::unauthorized("Authorization has expired"));
            }

            earliest_expiry = Some(match earliest_expiry {
                Some(current) => current.min(expires),
                None => expires,
            });
            covered.insert(authz.identifier.value.to_ascii_lowercase());
        }

        for name in &names {
            if !covered.contains(name) {
                return Err(Error::unauthorized(format!(
                    "No valid authorization for {name}"
                )));
            }
        }

        if self.sa.already_denied_csr(&names)? {
            return Err(Error::unauthorized("CSR has already been denied"));
        }

        let earliest_expiry =
            earliest_expiry.ok_or_else(|| Error::unauthorized("No authorizations provided"))?;

        let certificate = self
            .ca
            .issue_certificate(&csr, registration_id, earliest_expiry)?;

        let serial = self.sa.add_certificate(&certificate.der, registration_id)?;
        tracing::info!(serial, registration_id, "certificate issued and stored");

        Ok(Certificate {
            serial,
            ..certificate
        })
    }
}
