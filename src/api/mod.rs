//! JSON wire objects for the subscriber protocol.

use serde::{Deserialize, Serialize};

mod authorization;
mod certificate;
mod challenge;
mod identifier;
mod registration;

pub use self::{
    authorization::{Authorization, AuthorizationStatus},
    certificate::{Certificate, CertificateRequest},
    challenge::{Challenge, ChallengeDetails, ChallengeKind, ChallengeResponse, ChallengeStatus},
    identifier::Identifier,
    registration::Registration,
};

/// An RFC 7807 problem document.
///
/// Error responses carry one of these with media type
/// `application/problem+json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_omits_empty_detail() {
        let problem = Problem {
            _type: "urn:acme:error:malformed".to_owned(),
            detail: None,
        };
        assert_eq!(
            serde_json::to_string(&problem).unwrap(),
            r#"{"type":"urn:acme:error:malformed"}"#
        );
    }
}
