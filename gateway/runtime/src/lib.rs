#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use fleet_gateway_auth as auth;
pub use fleet_gateway_cache as cache;
pub use fleet_gateway_core as core;
pub use fleet_gateway_k8s_index as index;
pub use fleet_gateway_k8s_proxy as proxy;

mod args;
pub mod kubernetes;
mod probe;
pub mod server;

pub use self::{
    args::Args,
    kubernetes::{ClientCacheConfig, KubernetesRuntime},
    probe::Probe,
    server::{Server, ServerArgs},
};
