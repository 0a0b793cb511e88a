//! Policy authority: per-identifier acceptance and the challenge menu.

use crate::{
    api::{ChallengeKind, Identifier},
    error::{Error, Result},
};

pub trait PolicyAuthority: Send + Sync {
    /// Whether the authority will issue for the identifier at all.
    fn willing_to_issue(&self, identifier: &Identifier) -> Result<()>;

    /// The challenge kinds offered for an identifier, and which index sets
    /// satisfy the authorization.
    fn challenges_for(
        &self,
        identifier: &Identifier,
    ) -> Result<(Vec<ChallengeKind>, Vec<Vec<usize>>)>;
}

/// Default policy: DNS identifiers with conservative hostname syntax, no
/// wildcards, no bare TLDs, no IP-shaped names. Either challenge alone
/// satisfies an authorization.
#[derive(Debug, Default)]
pub struct PolicyAuthorityImpl;

impl PolicyAuthorityImpl {
    pub fn new() -> Self {
        Self
    }
}

const MAX_DNS_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

fn refuse(detail: &str) -> Error {
    Error::unauthorized(format!("Policy forbids issuing for identifier: {detail}"))
}

impl PolicyAuthority for PolicyAuthorityImpl {
    fn willing_to_issue(&self, identifier: &Identifier) -> Result<()> {
        if !identifier.is_type_dns() {
            return Err(refuse("only DNS identifiers are supported"));
        }

        let name = identifier.value.to_ascii_lowercase();
        if name.is_empty() || name.len() > MAX_DNS_NAME_LEN {
            return Err(refuse("invalid name length"));
        }
        if name.contains('*') {
            return Err(refuse("wildcard names are not supported"));
        }

        let labels: Vec<&str> = name.split('.').collect();
        if labels.len() < 2 {
            return Err(refuse("name does not have at least two labels"));
        }
        for label in &labels {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(refuse("invalid label length"));
            }
            if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
                return Err(refuse("invalid character in label"));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(refuse("label starts or ends with a hyphen"));
            }
        }

        // an all-numeric name is an IP address in disguise
        if labels
            .iter()
            .all(|label| label.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(refuse("IP addresses are not DNS identifiers"));
        }

        Ok(())
    }

    fn challenges_for(
        &self,
        identifier: &Identifier,
    ) -> Result<(Vec<ChallengeKind>, Vec<Vec<usize>>)> {
        self.willing_to_issue(identifier)?;
        Ok((
            vec![ChallengeKind::SimpleHttps, ChallengeKind::Dvsni],
            vec![vec![0], vec![1]],
        ))
    }
}
