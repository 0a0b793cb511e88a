use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::api;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    #[default]
    Pending,
    Processing,
    Valid,
    Invalid,
    Revoked,
}

/// Binds an account to proof of control over one identifier.
///
/// Created `pending`, mutated only by the registration authority in
/// response to validation results, then finalized exactly once to `valid`
/// or `invalid`. The `id` and owning registration never travel in response
/// bodies; the id is carried by the `Location` header instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    #[serde(skip)]
    pub id: String,

    #[serde(skip)]
    pub registration_id: i64,

    pub identifier: api::Identifier,

    #[serde(default)]
    pub status: AuthorizationStatus,

    /// Set when the authorization becomes valid.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires: Option<OffsetDateTime>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub challenges: Vec<api::Challenge>,

    /// Sets of challenge indexes whose simultaneous validation satisfies
    /// the authorization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combinations: Vec<Vec<usize>>,
}

impl Authorization {
    /// A bare request as submitted by a subscriber: just the identifier.
    pub fn request(identifier: api::Identifier) -> Self {
        Authorization {
            id: String::new(),
            registration_id: 0,
            identifier,
            status: AuthorizationStatus::Pending,
            expires: None,
            challenges: Vec::new(),
            combinations: Vec::new(),
        }
    }
}
