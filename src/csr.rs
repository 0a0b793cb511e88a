//! PKCS#10 handling: decoding, name extraction, and reducing subject
//! public keys to JWKs for identity comparison.

use der::{asn1::ObjectIdentifier, Decode as _, Encode as _};
use rsa::pkcs1::DecodeRsaPublicKey as _;
use spki::SubjectPublicKeyInfoOwned;
use x509_cert::{
    ext::{pkix::name::GeneralName, pkix::SubjectAltName, Extension},
    request::{CertReq, ExtensionReq},
};

use crate::{
    error::{Error, Result},
    jws::Jwk,
};

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_EXTENSION_REQ: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

pub(crate) fn parse_csr(der_bytes: &[u8]) -> Result<CertReq> {
    CertReq::from_der(der_bytes)
        .map_err(|_| Error::malformed("Error unmarshaling certificate request"))
}

/// The DNS names a CSR requests: the CN when it looks like a DNS name,
/// followed by the SAN dNSName entries. Lowercased, deduplicated, in
/// order of appearance.
pub(crate) fn requested_names(csr: &CertReq) -> Vec<String> {
    let mut names = Vec::new();

    if let Some(cn) = common_name(csr) {
        if looks_like_dns_name(&cn) {
            names.push(cn.to_ascii_lowercase());
        }
    }

    for san in san_dns_names(csr) {
        names.push(san.to_ascii_lowercase());
    }

    let mut seen = std::collections::HashSet::new();
    names.retain(|name| seen.insert(name.clone()));
    names
}

/// The CSR's subject public key as a JWK.
pub(crate) fn public_key_jwk(csr: &CertReq) -> Result<Jwk> {
    spki_jwk(&csr.info.public_key)
}

pub(crate) fn spki_jwk(spki: &SubjectPublicKeyInfoOwned) -> Result<Jwk> {
    let raw = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| Error::malformed("Malformed subject public key"))?;

    if spki.algorithm.oid == OID_RSA_ENCRYPTION {
        let key = rsa::RsaPublicKey::from_pkcs1_der(raw)
            .map_err(|_| Error::malformed("Malformed RSA public key"))?;
        Ok(Jwk::from_rsa(&key))
    } else if spki.algorithm.oid == OID_EC_PUBLIC_KEY {
        let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(raw)
            .map_err(|_| Error::malformed("Malformed EC public key"))?;
        Ok(Jwk::from_p256(&key))
    } else {
        Err(Error::malformed("Unsupported public key algorithm"))
    }
}

fn common_name(csr: &CertReq) -> Option<String> {
    for rdn in csr.info.subject.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid == OID_COMMON_NAME {
                // content bytes of PrintableString and UTF8String are the
                // raw characters either way
                if let Ok(value) = std::str::from_utf8(atv.value.value()) {
                    return Some(value.to_owned());
                }
            }
        }
    }
    None
}

fn san_dns_names(csr: &CertReq) -> Vec<String> {
    let mut names = Vec::new();
    for attr in csr.info.attributes.iter() {
        if attr.oid != OID_EXTENSION_REQ {
            continue;
        }
        for value in attr.values.iter() {
            let Ok(raw) = value.to_der() else { continue };
            let Ok(extension_req) = ExtensionReq::from_der(&raw) else {
                continue;
            };
            names.extend(dns_names_from_extensions(&extension_req.0));
        }
    }
    names
}

/// SAN dNSName entries from a list of X.509 extensions. Shared with the
/// dvsni probe, which scans peer certificates the same way.
pub(crate) fn dns_names_from_extensions(extensions: &[Extension]) -> Vec<String> {
    let mut names = Vec::new();
    for extension in extensions {
        if extension.extn_id != OID_SUBJECT_ALT_NAME {
            continue;
        }
        let Ok(san) = SubjectAltName::from_der(extension.extn_value.as_bytes()) else {
            continue;
        };
        for name in &san.0 {
            if let GeneralName::DnsName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    names
}

/// Loose syntax check used to decide whether a CN should count as a
/// requested DNS name.
pub(crate) fn looks_like_dns_name(value: &str) -> bool {
    value.contains('.')
        && !value.ends_with('.')
        && !value.starts_with('.')
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn test_requested_names_from_fixture_csr() {
        let csr = parse_csr(&test::example_csr_der()).unwrap();
        // CN is not-example.com, SANs are not-example.com and
        // www.not-example.com; the CN duplicate collapses
        assert_eq!(
            requested_names(&csr),
            vec!["not-example.com", "www.not-example.com"]
        );
    }

    #[test]
    fn test_fixture_csr_key_is_2048_bit_rsa() {
        let csr = parse_csr(&test::example_csr_der()).unwrap();
        let jwk = public_key_jwk(&csr).unwrap();
        assert_eq!(jwk.kty, "RSA");
        jwk.check_strength(2048).unwrap();
        assert!(jwk.check_strength(4096).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_csr(b"not a csr").is_err());
        assert!(parse_csr(b"").is_err());
    }

    #[test]
    fn test_dns_names_from_certificate_extensions() {
        use der::Decode as _;

        let cert = x509_cert::Certificate::from_der(&test::good_cert_der()).unwrap();
        let extensions = cert.tbs_certificate.extensions.unwrap_or_default();
        assert_eq!(
            dns_names_from_extensions(&extensions),
            vec!["not-an-example.com"]
        );
    }

    #[test]
    fn test_dns_name_shapes() {
        assert!(looks_like_dns_name("not-example.com"));
        assert!(!looks_like_dns_name("lets-encrypt"));
        assert!(!looks_like_dns_name("bad domain.com"));
        assert!(!looks_like_dns_name("trailing.com."));
    }
}
