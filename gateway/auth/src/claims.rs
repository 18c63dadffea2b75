use crate::Error;
use serde::{Deserialize, Serialize};

/// The payload of a gateway token.
///
/// Every field is optional at the serialization layer so that a missing claim
/// is reported by [`Claims::validate`] by name rather than as a decode error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_uuid: Option<String>,
}

// === impl Claims ===

impl Claims {
    /// Checks the claims against the current time, given in seconds since the
    /// Unix epoch.
    pub fn validate(&self, now: u64) -> Result<(), Error> {
        match self.exp {
            None => return Err(Error::MissingClaim("exp")),
            Some(exp) if exp <= now => return Err(Error::Expired),
            Some(_) => {}
        }
        if self.sub.is_empty() {
            return Err(Error::MissingClaim("sub"));
        }
        if self.cluster.is_empty() {
            return Err(Error::MissingClaim("cluster"));
        }
        if self.groups.is_empty() {
            return Err(Error::MissingClaim("groups"));
        }
        if self.groups.iter().any(String::is_empty) {
            return Err(Error::InvalidClaim("groups"));
        }
        if self.nbf.is_some_and(|nbf| nbf > now) {
            return Err(Error::NotYetValid);
        }
        Ok(())
    }

    /// The cluster UUID claim, treating an empty value as absent.
    pub fn cluster_uuid(&self) -> Option<&str> {
        self.cluster_uuid.as_deref().filter(|uuid| !uuid.is_empty())
    }
}
