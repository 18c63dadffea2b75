use crate::{secret_data, PUBLIC_KEY_KEY, SIGNING_KEY_LABEL};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Context, Result};
use fleet_gateway_core::{DecodingKey, KeyLookup};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};

/// Indexes token verification keys by key id.
#[derive(Default)]
pub struct Index {
    keys: HashMap<String, SigningKey>,
    by_secret: HashMap<String, String>,
}

pub type SharedIndex = Arc<RwLock<Index>>;

/// A handle on the key index that serves key lookups.
#[derive(Clone, Default)]
pub struct KeyIndex {
    index: SharedIndex,
}

struct SigningKey {
    secret: String,
    key: DecodingKey,
}

// === impl KeyIndex ===

impl KeyIndex {
    pub fn index(&self) -> SharedIndex {
        self.index.clone()
    }

    /// The ids of all known keys, sorted.
    pub fn key_ids(&self) -> Vec<String> {
        let mut kids = self.index.read().keys.keys().cloned().collect::<Vec<_>>();
        kids.sort();
        kids
    }
}

#[async_trait::async_trait]
impl KeyLookup for KeyIndex {
    async fn lookup_key(&self, kid: &str) -> Result<DecodingKey> {
        self.index
            .read()
            .keys
            .get(kid)
            .map(|signing| signing.key.clone())
            .ok_or_else(|| anyhow!("unknown key id {kid}"))
    }
}

impl fmt::Debug for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIndex")
            .field("key_ids", &self.key_ids())
            .finish()
    }
}

// === impl Index ===

impl kubert::index::IndexNamespacedResource<Secret> for Index {
    fn apply(&mut self, secret: Secret) {
        let secret_name = secret.name_unchecked();
        let (kid, key) = match parse(&secret) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(secret = %secret_name, %error, "Ignoring invalid signing key");
                self.remove_secret(&secret_name);
                return;
            }
        };

        if let Some(previous) = self.by_secret.insert(secret_name.clone(), kid.clone()) {
            if previous != kid && self.keys.get(&previous).is_some_and(|k| k.secret == secret_name) {
                self.keys.remove(&previous);
            }
        }
        tracing::debug!(%kid, secret = %secret_name, "Signing key updated");
        self.keys.insert(
            kid,
            SigningKey {
                secret: secret_name,
                key,
            },
        );
    }

    fn delete(&mut self, _namespace: String, name: String) {
        self.remove_secret(&name);
    }
}

impl Index {
    fn remove_secret(&mut self, secret: &str) {
        let Some(kid) = self.by_secret.remove(secret) else {
            return;
        };
        // Another secret may have since claimed the key id.
        if self.keys.get(&kid).is_some_and(|k| k.secret == secret) {
            tracing::debug!(%kid, %secret, "Signing key removed");
            self.keys.remove(&kid);
        }
    }
}

fn parse(secret: &Secret) -> Result<(String, DecodingKey)> {
    let kid = secret
        .labels()
        .get(SIGNING_KEY_LABEL)
        .filter(|kid| !kid.is_empty())
        .ok_or_else(|| anyhow!("missing {SIGNING_KEY_LABEL} label"))?
        .clone();
    let pem = secret_data(secret, PUBLIC_KEY_KEY)
        .ok_or_else(|| anyhow!("missing {PUBLIC_KEY_KEY} data"))?;
    let key = DecodingKey::from_rsa_pem(pem).context("invalid RSA public key")?;
    Ok((kid, key))
}
