use crate::{Claims, Error};
use fleet_gateway_core::{ClusterUuidResolver, KeyLookup};
use jsonwebtoken::{Algorithm, Validation};
use std::{fmt, sync::Arc};

/// The only algorithm tokens may be signed with, whatever their header says.
pub const ALGORITHM: Algorithm = Algorithm::RS256;

/// Verifies gateway tokens.
#[derive(Clone)]
pub struct Verifier {
    keys: Arc<dyn KeyLookup>,
    clusters: Arc<dyn ClusterUuidResolver>,
    require_cluster_uuid: bool,
    validation: Validation,
}

// === impl Verifier ===

impl Verifier {
    pub fn new(keys: Arc<dyn KeyLookup>, clusters: Arc<dyn ClusterUuidResolver>) -> Self {
        // Only the signature is checked when decoding; time-based and
        // structural claim checks are applied by `Claims::validate`.
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self {
            keys,
            clusters,
            require_cluster_uuid: false,
            validation,
        }
    }

    /// Rejects tokens that do not carry a `cluster_uuid` claim.
    ///
    /// By default such tokens are accepted on their cluster name alone, so that
    /// tokens issued before the claim existed remain usable.
    pub fn require_cluster_uuid(mut self, require: bool) -> Self {
        self.require_cluster_uuid = require;
        self
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, Error> {
        let header = jsonwebtoken::decode_header(token)?;
        if header.alg != ALGORITHM {
            return Err(Error::UnsupportedAlgorithm(header.alg));
        }
        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or(Error::MissingKeyId)?;
        let key = match self.keys.lookup_key(&kid).await {
            Ok(key) => key,
            Err(error) => return Err(Error::KeyLookup { kid, error }),
        };

        let claims = jsonwebtoken::decode::<Claims>(token, &key, &self.validation)?.claims;
        claims.validate(jsonwebtoken::get_current_timestamp())?;
        self.check_cluster_uuid(&claims).await?;
        Ok(claims)
    }

    async fn check_cluster_uuid(&self, claims: &Claims) -> Result<(), Error> {
        let Some(uuid) = claims.cluster_uuid() else {
            if self.require_cluster_uuid {
                return Err(Error::LegacyToken);
            }
            tracing::debug!(cluster = %claims.cluster, "Accepting token without cluster UUID");
            return Ok(());
        };

        let current = match self.clusters.cluster_uuid(&claims.cluster).await {
            Ok(current) => current,
            Err(error) => {
                return Err(Error::ClusterUuid {
                    cluster: claims.cluster.clone(),
                    error,
                })
            }
        };
        if current != uuid {
            return Err(Error::ClusterUuidMismatch {
                cluster: claims.cluster.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("algorithm", &ALGORITHM)
            .field("require_cluster_uuid", &self.require_cluster_uuid)
            .finish_non_exhaustive()
    }
}
