//! Bearer token authentication for proxied cluster requests.
//!
//! Every request must carry a signed token naming the cluster it targets and
//! the identity to act as. The [`Verifier`] checks the token's signature and
//! claims; the [`Authorize`] middleware binds the verified cluster onto the
//! request and replaces any client-supplied identity headers with impersonation
//! headers derived from the claims.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod claims;
pub mod metrics;
mod middleware;
#[cfg(test)]
mod tests;
mod verify;

pub use self::{
    claims::Claims,
    metrics::AuthMetrics,
    middleware::{Authorize, AuthorizeLayer},
    verify::{Verifier, ALGORITHM},
};
use jsonwebtoken::Algorithm;

/// Why a request failed authentication.
///
/// Causes are logged and counted, but a client only ever sees a bare 401.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing authorization header")]
    MissingHeader,

    #[error("malformed authorization header")]
    MalformedHeader,

    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    #[error("token has no key id")]
    MissingKeyId,

    #[error("failed to look up key {kid:?}: {error:#}")]
    KeyLookup { kid: String, error: anyhow::Error },

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token has expired")]
    Expired,

    #[error("token is not yet valid")]
    NotYetValid,

    #[error("missing {0} claim")]
    MissingClaim(&'static str),

    #[error("invalid {0} claim")]
    InvalidClaim(&'static str),

    #[error("failed to resolve UUID of cluster {cluster}: {error:#}")]
    ClusterUuid { cluster: String, error: anyhow::Error },

    #[error("cluster {cluster} UUID does not match token")]
    ClusterUuidMismatch { cluster: String },

    #[error("token has no cluster_uuid claim")]
    LegacyToken,
}

// === impl Error ===

impl Error {
    /// A short, stable label for the failure cause.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingHeader => "missing_header",
            Self::MalformedHeader => "malformed_header",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::MissingKeyId => "missing_key_id",
            Self::KeyLookup { .. } => "unknown_key",
            Self::InvalidToken(_) => "invalid_token",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::MissingClaim(_) => "missing_claim",
            Self::InvalidClaim(_) => "invalid_claim",
            Self::ClusterUuid { .. } => "cluster_uuid_unresolved",
            Self::ClusterUuidMismatch { .. } => "cluster_uuid_mismatch",
            Self::LegacyToken => "legacy_token",
        }
    }
}
