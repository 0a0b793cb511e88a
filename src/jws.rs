//! Request authentication: flattened-JWS parsing and verification, JWKs,
//! and the canonical key digest.
//!
//! Every mutating endpoint is authenticated against the public key embedded
//! in the JWS `jwk` header; no truststore is consulted. See
//! [RFC 7515 §7.2.2](https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2)
//! for the serialization.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use signature::Verifier as _;

use crate::{
    error::{Error, Result},
    util,
};

/// A public key as it appears in a JWS `jwk` header or a registration.
///
/// RSA keys carry `n`/`e`, EC keys carry `crv`/`x`/`y`; every component is
/// unpadded base64url.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

// LEXICAL ORDER OF FIELDS MATTER! The digest is defined over the canonical
// JSON of the required members with sorted keys.

#[derive(Serialize)]
struct RsaThumb<'a> {
    e: &'a str,
    kty: &'a str,
    n: &'a str,
}

#[derive(Serialize)]
struct EcThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

impl Jwk {
    pub fn from_rsa(key: &rsa::RsaPublicKey) -> Jwk {
        use rsa::traits::PublicKeyParts as _;

        Jwk {
            kty: "RSA".to_owned(),
            n: Some(util::base64url(&key.n().to_bytes_be())),
            e: Some(util::base64url(&key.e().to_bytes_be())),
            ..Default::default()
        }
    }

    pub fn from_p256(key: &p256::ecdsa::VerifyingKey) -> Jwk {
        let point = key.to_encoded_point(false);

        Jwk {
            kty: "EC".to_owned(),
            crv: Some("P-256".to_owned()),
            x: point.x().map(|x| util::base64url(x)),
            y: point.y().map(|y| util::base64url(y)),
            ..Default::default()
        }
    }

    /// SHA-256 over the canonical JSON serialization of the key's required
    /// members. This digest, never the JSON text, is what all key identity
    /// comparisons use.
    pub fn digest(&self) -> Result<[u8; 32]> {
        let canonical = match self.kty.as_str() {
            "RSA" => serde_json::to_vec(&RsaThumb {
                e: self.e.as_deref().unwrap_or_default(),
                kty: &self.kty,
                n: self.n.as_deref().unwrap_or_default(),
            }),
            "EC" => serde_json::to_vec(&EcThumb {
                crv: self.crv.as_deref().unwrap_or_default(),
                kty: &self.kty,
                x: self.x.as_deref().unwrap_or_default(),
                y: self.y.as_deref().unwrap_or_default(),
            }),
            other => {
                return Err(Error::malformed(format!("Unsupported key type: {other}")));
            }
        }
        .map_err(|err| Error::internal(format!("Failed to serialize key thumbprint: {err}")))?;

        Ok(Sha256::digest(canonical).into())
    }

    /// Digest comparison; false when either key cannot be digested.
    pub fn digest_equals(&self, other: &Jwk) -> bool {
        match (self.digest(), other.digest()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    pub fn rsa_public_key(&self) -> Result<rsa::RsaPublicKey> {
        let n = self
            .n
            .as_deref()
            .ok_or_else(|| Error::malformed("RSA key missing modulus"))?;
        let e = self
            .e
            .as_deref()
            .ok_or_else(|| Error::malformed("RSA key missing public exponent"))?;

        let n = rsa::BigUint::from_bytes_be(
            &util::base64url_decode(n).map_err(|_| Error::malformed("Undecodable RSA modulus"))?,
        );
        let e = rsa::BigUint::from_bytes_be(
            &util::base64url_decode(e)
                .map_err(|_| Error::malformed("Undecodable RSA public exponent"))?,
        );

        rsa::RsaPublicKey::new(n, e)
            .map_err(|err| Error::malformed(format!("Invalid RSA key: {err}")))
    }

    pub fn p256_verifying_key(&self) -> Result<p256::ecdsa::VerifyingKey> {
        if self.crv.as_deref() != Some("P-256") {
            return Err(Error::malformed("Unsupported EC curve"));
        }
        let x = self
            .x
            .as_deref()
            .and_then(|x| util::base64url_decode(x).ok())
            .ok_or_else(|| Error::malformed("Undecodable EC x coordinate"))?;
        let y = self
            .y
            .as_deref()
            .and_then(|y| util::base64url_decode(y).ok())
            .ok_or_else(|| Error::malformed("Undecodable EC y coordinate"))?;
        if x.len() != 32 || y.len() != 32 {
            return Err(Error::malformed("EC coordinates have the wrong length"));
        }

        let point = p256::EncodedPoint::from_affine_coordinates(
            p256::FieldBytes::from_slice(&x),
            p256::FieldBytes::from_slice(&y),
            false,
        );
        p256::ecdsa::VerifyingKey::from_encoded_point(&point)
            .map_err(|_| Error::malformed("Invalid EC public key"))
    }

    /// Minimum key strength policy.
    ///
    /// RSA moduli must be at least `min_rsa_bits` wide and use a public
    /// exponent of 3 or 65537 (compared by value, so leading-zero encodings
    /// are accepted). EC keys must be on P-256.
    pub fn check_strength(&self, min_rsa_bits: usize) -> Result<()> {
        use rsa::traits::PublicKeyParts as _;

        match self.kty.as_str() {
            "RSA" => {
                let key = self.rsa_public_key()?;
                let bits = key.n().bits();
                if bits < min_rsa_bits {
                    return Err(Error::malformed(format!("Key too small: {bits} bits")));
                }
                let e = key.e();
                if *e != rsa::BigUint::from(3u32) && *e != rsa::BigUint::from(65537u32) {
                    return Err(Error::malformed("Unsupported RSA public exponent"));
                }
                Ok(())
            }
            "EC" => self.p256_verifying_key().map(|_| ()),
            other => Err(Error::malformed(format!("Unsupported key type: {other}"))),
        }
    }
}

/// Flattened JSON serialization. The header is usually in `protected`;
/// legacy senders put it in the unprotected `header` member, in which case
/// the signing input uses an empty protected segment.
#[derive(Debug, Deserialize)]
struct FlattenedJws {
    #[serde(default)]
    protected: Option<String>,
    #[serde(default)]
    header: Option<JwsHeader>,
    payload: String,
    signature: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    jwk: Option<Jwk>,
}

/// The outcome of verification: the decoded payload and the key that
/// signed it.
#[derive(Debug, Clone)]
pub struct VerifiedJws {
    pub payload: Vec<u8>,
    pub key: Jwk,
}

fn read_failure() -> Error {
    Error::malformed("Unable to read/verify body")
}

/// Parse a flattened JWS, verify its signature against the embedded `jwk`,
/// and return the decoded payload. Every failure collapses to the same
/// `malformed` error so the response leaks nothing about which step broke.
pub fn verify_jws(body: &[u8]) -> Result<VerifiedJws> {
    let jws: FlattenedJws = serde_json::from_slice(body).map_err(|_| read_failure())?;

    let (header, protected_segment) = match (&jws.protected, &jws.header) {
        (Some(protected), _) => {
            let raw = util::base64url_decode(protected).map_err(|_| read_failure())?;
            let header: JwsHeader = serde_json::from_slice(&raw).map_err(|_| read_failure())?;
            (header, protected.as_str())
        }
        (None, Some(header)) => (header.clone(), ""),
        (None, None) => return Err(read_failure()),
    };

    let key = header.jwk.ok_or_else(read_failure)?;
    let signature = util::base64url_decode(&jws.signature).map_err(|_| read_failure())?;
    let signing_input = format!("{protected_segment}.{}", jws.payload);

    verify_signature(&header.alg, &key, signing_input.as_bytes(), &signature)?;

    let payload = util::base64url_decode(&jws.payload).map_err(|_| read_failure())?;

    Ok(VerifiedJws { payload, key })
}

fn verify_signature(alg: &str, key: &Jwk, signing_input: &[u8], signature: &[u8]) -> Result<()> {
    match alg {
        "RS256" => {
            let public_key = key.rsa_public_key().map_err(|_| read_failure())?;
            let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);
            let signature =
                rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| read_failure())?;
            verifying_key
                .verify(signing_input, &signature)
                .map_err(|_| read_failure())
        }
        "ES256" => {
            let verifying_key = key.p256_verifying_key().map_err(|_| read_failure())?;
            let signature =
                p256::ecdsa::Signature::from_slice(signature).map_err(|_| read_failure())?;
            verifying_key
                .verify(signing_input, &signature)
                .map_err(|_| read_failure())
        }
        _ => Err(read_failure()),
    }
}
