//! Indexes of the management cluster's `Secret`s that back the gateway's
//! cluster and signing key lookups.
//!
//! Each managed cluster is recorded as a `Secret` labelled with the cluster's
//! name, annotated with its UUID, and holding a kubeconfig for its API:
//!
//! ```text
//! metadata:
//!   labels:
//!     fleet.io/cluster: <name>
//!   annotations:
//!     fleet.io/cluster-uuid: <uuid>
//! data:
//!   kubeconfig: <kubeconfig yaml>
//! ```
//!
//! Token signing keys are `Secret`s labelled with their key id and holding a
//! PEM encoded RSA public key under `public.pem`.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod key;

pub use self::{cluster::ClusterIndex, key::KeyIndex};

/// Labels a cluster record `Secret` with the cluster's name.
pub const CLUSTER_LABEL: &str = "fleet.io/cluster";

/// Annotates a cluster record `Secret` with the cluster's UUID.
pub const CLUSTER_UUID_ANNOTATION: &str = "fleet.io/cluster-uuid";

/// The cluster record `Secret` data key holding the cluster's kubeconfig.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Labels a signing key `Secret` with the key's id.
pub const SIGNING_KEY_LABEL: &str = "fleet.io/signing-key-id";

/// The signing key `Secret` data key holding the PEM encoded public key.
pub const PUBLIC_KEY_KEY: &str = "public.pem";

fn secret_data<'s>(
    secret: &'s k8s_openapi::api::core::v1::Secret,
    key: &str,
) -> Option<&'s [u8]> {
    secret.data.as_ref()?.get(key).map(|bytes| bytes.0.as_slice())
}
