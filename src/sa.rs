//! Storage authority: the durable-store interface consumed by the
//! registration authority and the web front end, plus the in-memory
//! implementation used by the binary and the tests.
//!
//! The production store is an external service backed by SQL; this crate
//! only fixes the interface. Every operation is atomic.

use std::collections::{HashMap, HashSet};

use der::Decode as _;
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::{
    api::{Authorization, Certificate, Registration},
    error::{Error, Result},
    jws::Jwk,
    util,
};

pub trait StorageAuthority: Send + Sync {
    /// Persist a new registration. The store assigns the id.
    fn new_registration(&self, registration: Registration) -> Result<Registration>;

    fn get_registration(&self, id: i64) -> Result<Option<Registration>>;

    /// Primary account lookup: by the canonical digest of the key.
    fn get_registration_by_key(&self, key: &Jwk) -> Result<Option<Registration>>;

    fn update_registration(&self, registration: Registration) -> Result<()>;

    /// Persist a pending authorization. An id is assigned when the caller
    /// left it empty.
    fn new_pending_authorization(&self, authz: Authorization) -> Result<Authorization>;

    fn update_pending_authorization(&self, authz: Authorization) -> Result<()>;

    /// One-shot move of an authorization out of the pending set. A second
    /// finalization of the same authorization is a no-op.
    fn finalize_authorization(&self, authz: Authorization) -> Result<()>;

    fn get_authorization(&self, id: &str) -> Result<Option<Authorization>>;

    /// Store an issued certificate; returns its serial as zero-padded hex.
    fn add_certificate(&self, der: &[u8], registration_id: i64) -> Result<String>;

    fn get_certificate(&self, serial: &str) -> Result<Option<Vec<u8>>>;

    fn already_denied_csr(&self, names: &[String]) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_registration_id: i64,
    registrations: HashMap<i64, Registration>,
    registration_ids_by_key: HashMap<String, i64>,
    pending_authorizations: HashMap<String, Authorization>,
    finalized_authorizations: HashMap<String, Authorization>,
    certificates: HashMap<String, Certificate>,
    denied_csrs: HashSet<String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: record a name set as previously denied.
    pub fn deny_names(&self, names: &[String]) {
        self.inner.lock().denied_csrs.insert(denied_key(names));
    }
}

fn key_digest_hex(key: &Jwk) -> Result<String> {
    Ok(hex::encode(key.digest()?))
}

fn denied_key(names: &[String]) -> String {
    let mut sorted: Vec<String> = names.iter().map(|n| n.to_ascii_lowercase()).collect();
    sorted.sort();
    sorted.join(",")
}

/// Serial numbers render as lowercase hex, zero-padded to at least 16
/// digits.
pub(crate) fn serial_to_string(serial: &[u8]) -> String {
    format!("{:0>16}", hex::encode(serial))
}

impl StorageAuthority for MemoryStorage {
    fn new_registration(&self, mut registration: Registration) -> Result<Registration> {
        let key = registration
            .key
            .as_ref()
            .ok_or_else(|| Error::internal("Registration has no key"))?;
        let digest = key_digest_hex(key)?;

        let mut inner = self.inner.lock();
        if inner.registration_ids_by_key.contains_key(&digest) {
            return Err(Error::malformed("Registration key is already in use"));
        }

        inner.next_registration_id += 1;
        registration.id = inner.next_registration_id;
        inner.registration_ids_by_key.insert(digest, registration.id);
        inner
            .registrations
            .insert(registration.id, registration.clone());

        Ok(registration)
    }

    fn get_registration(&self, id: i64) -> Result<Option<Registration>> {
        Ok(self.inner.lock().registrations.get(&id).cloned())
    }

    fn get_registration_by_key(&self, key: &Jwk) -> Result<Option<Registration>> {
        let digest = key_digest_hex(key)?;
        let inner = self.inner.lock();
        Ok(inner
            .registration_ids_by_key
            .get(&digest)
            .and_then(|id| inner.registrations.get(id))
            .cloned())
    }

    fn update_registration(&self, registration: Registration) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.registrations.contains_key(&registration.id) {
            return Err(Error::internal("No such registration"));
        }
        inner.registrations.insert(registration.id, registration);
        Ok(())
    }

    fn new_pending_authorization(&self, mut authz: Authorization) -> Result<Authorization> {
        if authz.id.is_empty() {
            authz.id = util::random_token(32);
        }

        let mut inner = self.inner.lock();
        if inner.pending_authorizations.contains_key(&authz.id)
            || inner.finalized_authorizations.contains_key(&authz.id)
        {
            return Err(Error::internal("Duplicate authorization ID"));
        }
        inner
            .pending_authorizations
            .insert(authz.id.clone(), authz.clone());

        Ok(authz)
    }

    fn update_pending_authorization(&self, authz: Authorization) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.pending_authorizations.contains_key(&authz.id) {
            return Err(Error::malformed(
                "Only pending authorizations can be updated",
            ));
        }
        inner.pending_authorizations.insert(authz.id.clone(), authz);
        Ok(())
    }

    fn finalize_authorization(&self, authz: Authorization) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.finalized_authorizations.contains_key(&authz.id) {
            return Ok(());
        }
        if inner.pending_authorizations.remove(&authz.id).is_none() {
            return Err(Error::internal("No such pending authorization"));
        }
        inner.finalized_authorizations.insert(authz.id.clone(), authz);
        Ok(())
    }

    fn get_authorization(&self, id: &str) -> Result<Option<Authorization>> {
        let inner = self.inner.lock();
        Ok(inner
            .pending_authorizations
            .get(id)
            .or_else(|| inner.finalized_authorizations.get(id))
            .cloned())
    }

    fn add_certificate(&self, der: &[u8], registration_id: i64) -> Result<String> {
        let parsed = x509_cert::Certificate::from_der(der)
            .map_err(|err| Error::internal(format!("Unparseable certificate: {err}")))?;
        let serial = serial_to_string(parsed.tbs_certificate.serial_number.as_bytes());

        let certificate = Certificate {
            der: der.to_vec(),
            serial: serial.clone(),
            issued_at: OffsetDateTime::now_utc(),
            registration_id,
        };
        self.inner
            .lock()
            .certificates
            .insert(serial.clone(), certificate);

        Ok(serial)
    }

    fn get_certificate(&self, serial: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .lock()
            .certificates
            .get(serial)
            .map(|cert| cert.der.clone()))
    }

    fn already_denied_csr(&self, names: &[String]) -> Result<bool> {
        Ok(self.inner.lock().denied_csrs.contains(&denied_key(names)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::Identifier, test};

    fn registration_with_key(json: &str) -> Registration {
        Registration {
            key: Some(serde_json::from_str(json).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_registration_key_is_unique() {
        let sa = MemoryStorage::new();
        let first = sa
            .new_registration(registration_with_key(test::TEST1_KEY_PUBLIC_JSON))
            .unwrap();
        assert_eq!(first.id, 1);

        let err = sa
            .new_registration(registration_with_key(test::TEST1_KEY_PUBLIC_JSON))
            .unwrap_err();
        assert_eq!(err, Error::malformed("Registration key is already in use"));

        let by_key = sa
            .get_registration_by_key(first.key.as_ref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, first.id);
    }

    #[test]
    fn test_finalization_is_one_shot() {
        let sa = MemoryStorage::new();
        let mut authz = Authorization::request(Identifier::dns("not-example.com"));
        authz.registration_id = 1;
        let authz = sa.new_pending_authorization(authz).unwrap();
        assert!(!authz.id.is_empty());

        sa.finalize_authorization(authz.clone()).unwrap();
        // repeat finalization is a no-op
        sa.finalize_authorization(authz.clone()).unwrap();

        let err = sa.update_pending_authorization(authz).unwrap_err();
        assert_eq!(
            err,
            Error::malformed("Only pending authorizations can be updated")
        );
    }

    #[test]
    fn test_certificate_serial_roundtrip() {
        let sa = MemoryStorage::new();
        let der = test::good_cert_der();
        let serial = sa.add_certificate(&der, 1).unwrap();
        assert_eq!(serial, "0000000000000000");
        assert_eq!(sa.get_certificate(&serial).unwrap().unwrap(), der);
        assert_eq!(sa.get_certificate("ffff").unwrap(), None);
    }

    #[test]
    fn test_denied_csr_names_are_canonicalized() {
        let sa = MemoryStorage::new();
        sa.deny_names(&["B.com".to_owned(), "a.com".to_owned()]);
        assert!(sa
            .already_denied_csr(&["a.com".to_owned(), "b.com".to_owned()])
            .unwrap());
        assert!(!sa.already_denied_csr(&["a.com".to_owned()]).unwrap());
    }
}
