use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Issuance request body: a CSR plus the authorization URIs that cover its
/// names.
///
/// The CSR is DER, encoded with unpadded URL-safe base64 like every other
/// binary field on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub csr: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorizations: Vec<String>,
}

/// An issued certificate as persisted by the storage authority.
///
/// Append-only; revocation state is a separate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub der: Vec<u8>,

    /// Serial number, zero-padded lowercase hex.
    pub serial: String,

    pub issued_at: OffsetDateTime,

    pub registration_id: i64,
}
