//! Certificate authority signer: a pure issuing function over a CSR.
//!
//! The registration authority has already established that the requester
//! controls every requested name by the time this is called; the signer
//! only enforces its own profile (key size ceiling, validity cap).

use der::{asn1::Ia5String, DecodePem as _, Encode as _};
use rand::RngCore as _;
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use sha2::Sha256;
use time::OffsetDateTime;
use x509_cert::{
    builder::{Builder as _, CertificateBuilder, Profile},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    request::CertReq,
    serial_number::SerialNumber,
    time::Validity,
};

use crate::{
    api::Certificate,
    csr,
    error::{Error, Result},
    sa::serial_to_string,
};

pub trait CertificateAuthority: Send + Sync {
    /// Sign a certificate for the CSR on behalf of `registration_id`.
    ///
    /// `earliest_expiry` is the soonest expiry among the authorizations
    /// backing the request; issuance against proof that has already lapsed
    /// is refused.
    fn issue_certificate(
        &self,
        csr: &CertReq,
        registration_id: i64,
        earliest_expiry: OffsetDateTime,
    ) -> Result<Certificate>;
}

/// Local RSA signer. Builds a leaf from the CSR's subject, key, and SAN
/// names; the private key and issuer certificate are loaded from PEM files
/// at startup.
pub struct CaSigner {
    signing_key: rsa::pkcs1v15::SigningKey<Sha256>,
    issuer: Name,
    validity: time::Duration,
    not_after_cap: OffsetDateTime,
    max_key_bits: usize,
}

impl CaSigner {
    pub fn new(
        key: rsa::RsaPrivateKey,
        issuer: Name,
        validity: time::Duration,
        not_after_cap: OffsetDateTime,
        max_key_bits: usize,
    ) -> Self {
        CaSigner {
            signing_key: rsa::pkcs1v15::SigningKey::new(key),
            issuer,
            validity,
            not_after_cap,
            max_key_bits,
        }
    }

    /// Load the signer from a PKCS#1 private key PEM and the issuer
    /// certificate PEM.
    pub fn from_pem(
        key_pem: &str,
        cert_pem: &str,
        validity: time::Duration,
        not_after_cap: OffsetDateTime,
        max_key_bits: usize,
    ) -> eyre::Result<Self> {
        let key = rsa::RsaPrivateKey::from_pkcs1_pem(key_pem)?;
        let issuer_cert = x509_cert::Certificate::from_pem(cert_pem)?;
        Ok(Self::new(
            key,
            issuer_cert.tbs_certificate.subject,
            validity,
            not_after_cap,
            max_key_bits,
        ))
    }
}

fn random_serial() -> ([u8; 8], String) {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    // positive, nonzero, no leading-zero encoding
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    let hex = serial_to_string(&bytes);
    (bytes, hex)
}

impl CertificateAuthority for CaSigner {
    fn issue_certificate(
        &self,
        csr: &CertReq,
        registration_id: i64,
        earliest_expiry: OffsetDateTime,
    ) -> Result<Certificate> {
        let now = OffsetDateTime::now_utc();
        if earliest_expiry <= now {
            return Err(Error::unauthorized("Authorization proof has expired"));
        }

        let key = csr::public_key_jwk(csr)?;
        if key.kty == "RSA" {
            use rsa::traits::PublicKeyParts as _;
            let bits = key.rsa_public_key()?.n().bits();
            if bits > self.max_key_bits {
                return Err(Error::malformed(format!("Key too large: {bits} bits")));
            }
        }

        let names = csr::requested_names(csr);
        if names.is_empty() {
            return Err(Error::malformed("CSR contains no DNS names"));
        }

        let lifetime = std::cmp::min(self.validity, self.not_after_cap - now);
        let lifetime: std::time::Duration = lifetime
            .try_into()
            .map_err(|_| Error::internal("Validity cap is in the past"))?;
        let validity = Validity::from_now(lifetime)
            .map_err(|err| Error::internal(format!("Invalid validity window: {err}")))?;

        let (serial_bytes, serial) = random_serial();
        let serial_number = SerialNumber::new(&serial_bytes)
            .map_err(|err| Error::internal(format!("Bad serial: {err}")))?;

        let profile = Profile::Leaf {
            issuer: self.issuer.clone(),
            enable_key_agreement: false,
            enable_key_encipherment: true,
        };

        let mut builder = CertificateBuilder::new(
            profile,
            serial_number,
            validity,
            csr.info.subject.clone(),
            csr.info.public_key.clone(),
            &self.signing_key,
        )
        .map_err(|err| Error::internal(format!("Failed to start certificate: {err}")))?;

        let san = SubjectAltName(
            names
                .iter()
                .map(|name| {
                    Ia5String::new(name)
                        .map(GeneralName::DnsName)
                        .map_err(|err| Error::internal(format!("Bad SAN value: {err}")))
                })
                .collect::<Result<Vec<_>>>()?,
        );
        builder
            .add_extension(&san)
            .map_err(|err| Error::internal(format!("Failed to add SAN: {err}")))?;

        let certificate = builder
            .build::<rsa::pkcs1v15::Signature>()
            .map_err(|err| Error::internal(format!("Signing failed: {err}")))?;
        let der = certificate
            .to_der()
            .map_err(|err| Error::internal(format!("Failed to encode certificate: {err}")))?;

        tracing::info!(serial, registration_id, names = ?names, "issued certificate");

        Ok(Certificate {
            der,
            serial,
            issued_at: now,
            registration_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use der::Decode as _;

    use super::*;
    use crate::test;

    fn test_signer(validity_days: i64, cap_days: i64) -> CaSigner {
        CaSigner::new(
            test::ca_private_key(),
            "CN=Test CA,O=Test CA,C=US".parse().unwrap(),
            time::Duration::days(validity_days),
            OffsetDateTime::now_utc() + time::Duration::days(cap_days),
            4096,
        )
    }

    #[test]
    fn test_issue_covers_all_requested_names() {
        let signer = test_signer(90, 365);
        let csr = crate::csr::parse_csr(&test::example_csr_der()).unwrap();
        let expiry = OffsetDateTime::now_utc() + time::Duration::days(365);

        let cert = signer.issue_certificate(&csr, 1, expiry).unwrap();
        assert_eq!(cert.registration_id, 1);
        assert_eq!(cert.serial.len(), 16);

        let parsed = x509_cert::Certificate::from_der(&cert.der).unwrap();
        let extensions = parsed.tbs_certificate.extensions.unwrap_or_default();
        let sans = crate::csr::dns_names_from_extensions(&extensions);
        assert!(sans.contains(&"not-example.com".to_owned()));
        assert!(sans.contains(&"www.not-example.com".to_owned()));
        assert_eq!(
            serial_to_string(parsed.tbs_certificate.serial_number.as_bytes()),
            cert.serial
        );
    }

    #[test]
    fn test_not_after_respects_cap() {
        // a 90-day cap truncates the nominal one-year validity
        let signer = test_signer(365, 90);
        let csr = crate::csr::parse_csr(&test::example_csr_der()).unwrap();
        let expiry = OffsetDateTime::now_utc() + time::Duration::days(365);

        let cert = signer.issue_certificate(&csr, 1, expiry).unwrap();
        let parsed = x509_cert::Certificate::from_der(&cert.der).unwrap();
        let not_after = parsed
            .tbs_certificate
            .validity
            .not_after
            .to_date_time()
            .unix_duration();
        let cap = std::time::Duration::from_secs(
            (OffsetDateTime::now_utc().unix_timestamp() as u64) + 91 * 24 * 3600,
        );
        assert!(not_after < cap);
    }

    #[test]
    fn test_expired_proof_is_refused() {
        let signer = test_signer(90, 365);
        let csr = crate::csr::parse_csr(&test::example_csr_der()).unwrap();
        let expiry = OffsetDateTime::now_utc() - time::Duration::hours(1);
        assert!(matches!(
            signer.issue_certificate(&csr, 1, expiry),
            Err(Error::Unauthorized(_))
        ));
    }
}
