//! A name-indexed registry of cluster runtimes.
//!
//! Each runtime backend (one per cluster technology) is installed once at
//! process start. Other subsystems never see a backend's concrete type: they
//! look up a narrow capability, e.g. `dyn RegisterCleanuper`, and receive it
//! only if the backend chose to provide it.

use parking_lot::RwLock;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

/// A runtime backend that can be installed in a [`Registry`].
pub trait Runtime: Send + Sync + 'static {
    /// Publishes the capabilities this runtime implements.
    fn provide(self: Arc<Self>, caps: &mut Capabilities);
}

/// The set of capabilities published by a single runtime, keyed by type.
#[derive(Default)]
pub struct Capabilities(HashMap<TypeId, Box<dyn Any + Send + Sync>>);

#[derive(Default)]
pub struct Registry {
    runtimes: RwLock<HashMap<String, Installed>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("runtime {0:?} is already installed")]
    AlreadyInstalled(String),

    #[error("runtime {0:?} is not installed")]
    NotFound(String),

    #[error("runtime {runtime:?} of type {concrete} does not implement {interface}")]
    Unsupported {
        runtime: String,
        interface: &'static str,
        concrete: &'static str,
    },
}

struct Installed {
    concrete: &'static str,
    caps: Capabilities,
}

// === impl Capabilities ===

impl Capabilities {
    /// Publishes `cap` as an implementation of `T`, which is typically a trait
    /// object type such as `dyn KubeconfigSource`.
    pub fn insert<T>(&mut self, cap: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.0.insert(TypeId::of::<Arc<T>>(), Box::new(cap));
        self
    }

    fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let cap: &(dyn Any + Send + Sync) = self.0.get(&TypeId::of::<Arc<T>>())?.as_ref();
        cap.downcast_ref::<Arc<T>>().cloned()
    }
}

// === impl Registry ===

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a runtime under `name`.
    ///
    /// Fails if a runtime is already installed under that name; use
    /// [`Registry::reset`] to start over in tests.
    pub fn install<R: Runtime>(&self, name: impl Into<String>, runtime: Arc<R>) -> Result<(), Error> {
        let name = name.into();
        let mut runtimes = self.runtimes.write();
        if runtimes.contains_key(&name) {
            return Err(Error::AlreadyInstalled(name));
        }

        let mut caps = Capabilities::default();
        runtime.provide(&mut caps);
        let concrete = std::any::type_name::<R>();
        tracing::debug!(%name, %concrete, "Installed runtime");
        runtimes.insert(name, Installed { concrete, caps });
        Ok(())
    }

    /// Returns the capability `T` of the runtime installed under `name`.
    pub fn lookup_interface<T>(&self, name: &str) -> Result<Arc<T>, Error>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let runtimes = self.runtimes.read();
        let installed = runtimes
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        installed.caps.get::<T>().ok_or_else(|| Error::Unsupported {
            runtime: name.to_string(),
            interface: std::any::type_name::<T>(),
            concrete: installed.concrete,
        })
    }

    /// Removes all installed runtimes.
    pub fn reset(&self) {
        self.runtimes.write().clear();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runtimes = self.runtimes.read();
        f.debug_map()
            .entries(runtimes.iter().map(|(name, i)| (name, i.concrete)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CleanupCoordinator, Cleanuper, RegisterCleanuper};

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Talos {
        cleanup: Arc<CleanupCoordinator>,
    }

    impl Greeter for Talos {
        fn greet(&self) -> String {
            "hello from talos".to_string()
        }
    }

    impl Runtime for Talos {
        fn provide(self: Arc<Self>, caps: &mut Capabilities) {
            caps.insert::<dyn RegisterCleanuper>(self.cleanup.clone())
                .insert::<dyn Greeter>(self);
        }
    }

    fn talos() -> Arc<Talos> {
        Arc::new(Talos {
            cleanup: Arc::new(CleanupCoordinator::new()),
        })
    }

    #[test]
    fn lookup_provided_interface() {
        let registry = Registry::new();
        let rt = talos();
        registry.install("talos", rt.clone()).unwrap();

        let greeter = registry.lookup_interface::<dyn Greeter>("talos").unwrap();
        assert_eq!(greeter.greet(), "hello from talos");

        let register = registry
            .lookup_interface::<dyn RegisterCleanuper>("talos")
            .unwrap();
        register.register_cleanuper(Arc::new(CleanupCoordinator::new()));
        assert_eq!(rt.cleanup.len(), 1);
    }

    #[test]
    fn lookup_unsupported_interface_names_both_types() {
        let registry = Registry::new();
        registry.install("talos", talos()).unwrap();

        let error = registry
            .lookup_interface::<dyn Cleanuper>("talos")
            .err()
            .expect("talos must not provide Cleanuper");
        match &error {
            Error::Unsupported {
                runtime,
                interface,
                concrete,
            } => {
                assert_eq!(runtime, "talos");
                assert!(interface.contains("Cleanuper"), "{interface}");
                assert!(concrete.contains("Talos"), "{concrete}");
            }
            error => panic!("unexpected error: {error}"),
        }
        let msg = error.to_string();
        assert!(msg.contains("Cleanuper") && msg.contains("Talos"), "{msg}");
    }

    #[test]
    fn lookup_missing_runtime() {
        let registry = Registry::new();
        assert!(matches!(
            registry.lookup_interface::<dyn Greeter>("kubernetes"),
            Err(Error::NotFound(name)) if name == "kubernetes"
        ));
    }

    #[test]
    fn install_is_once_until_reset() {
        let registry = Registry::new();
        registry.install("talos", talos()).unwrap();
        assert!(matches!(
            registry.install("talos", talos()),
            Err(Error::AlreadyInstalled(_))
        ));

        registry.reset();
        registry.install("talos", talos()).unwrap();
        assert!(registry.lookup_interface::<dyn Greeter>("talos").is_ok());
    }
}
