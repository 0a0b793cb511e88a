use thiserror::Error;

use crate::api::Problem;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Typed errors returned by the authorities.
///
/// The web front end renders these as `application/problem+json` documents
/// with type `urn:acme:error:<kind>`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Input structure, signatures, or invariants violated by the caller.
    #[error("{0}")]
    Malformed(String),

    /// The authenticated caller lacks rights over the requested resource.
    #[error("{0}")]
    Unauthorized(String),

    /// Unexpected failure in a backing authority.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Error::Malformed(detail.into())
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Error::Unauthorized(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Error::Internal(detail.into())
    }

    /// The `<kind>` segment of the problem type URN.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Malformed(_) => "malformed",
            Error::Unauthorized(_) => "unauthorized",
            Error::Internal(_) => "serverInternal",
        }
    }

    pub fn problem(&self) -> Problem {
        Problem {
            _type: format!("urn:acme:error:{}", self.kind()),
            detail: Some(self.to_string()),
        }
    }
}
