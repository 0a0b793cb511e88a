use serde::{Deserialize, Serialize};

use crate::api;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    #[default]
    Pending,
    Valid,
    Invalid,
}

/// The supported proof tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    SimpleHttps,
    Dvsni,
}

/// Per-kind challenge material, dispatched on the wire `type` tag.
///
/// Server-chosen fields (`token`, `r`, `nonce`) are generated at
/// authorization creation and never overwritten afterwards; the
/// client-controlled halves (`path`, `s`) arrive through
/// [`ChallengeResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChallengeDetails {
    #[serde(rename = "simpleHttps")]
    SimpleHttps {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        token: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        path: String,
    },

    #[serde(rename = "dvsni")]
    Dvsni {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        r: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        s: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        nonce: String,
    },
}

/// One proof task offered under an authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(flatten)]
    pub details: ChallengeDetails,

    #[serde(default)]
    pub status: ChallengeStatus,

    /// Points back at the authorization plus this challenge's index.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,

    /// Why validation failed, surfaced when the subscriber polls the
    /// authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<api::Problem>,
}

impl Challenge {
    pub fn simple_https(token: String) -> Self {
        Challenge {
            details: ChallengeDetails::SimpleHttps {
                token,
                path: String::new(),
            },
            status: ChallengeStatus::Pending,
            uri: String::new(),
            error: None,
        }
    }

    pub fn dvsni(r: String, nonce: String) -> Self {
        Challenge {
            details: ChallengeDetails::Dvsni {
                r,
                s: String::new(),
                nonce,
            },
            status: ChallengeStatus::Pending,
            uri: String::new(),
            error: None,
        }
    }

    pub fn kind(&self) -> ChallengeKind {
        match self.details {
            ChallengeDetails::SimpleHttps { .. } => ChallengeKind::SimpleHttps,
            ChallengeDetails::Dvsni { .. } => ChallengeKind::Dvsni,
        }
    }
}

/// The client-controlled half of a challenge, POSTed to the challenge URI.
///
/// Server material is not representable here, so a subscriber payload can
/// never overwrite it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub _type: Option<String>,

    /// simpleHttps: path component under `/.well-known/acme-challenge/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// dvsni: the client's 32-byte `S` value, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
}
