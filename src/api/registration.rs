use serde::{Deserialize, Serialize};

use crate::jws::Jwk;

/// An account record, keyed by its public key.
///
/// `id`, `key`, and `recoveryToken` are server-authoritative: values a
/// subscriber supplies for them are discarded by the registration
/// authority, and the key is immutable after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(default)]
    pub id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Jwk>,

    /// Contact URIs, `mailto:` or `tel:`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,

    /// The subscriber agreement URL the account has accepted, or empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agreement: String,

    #[serde(rename = "recoveryToken", default)]
    pub recovery_token: String,
}
