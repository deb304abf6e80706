//! Warden controller configuration: per-controller dispatch policy and the
//! process-scoped registry resolving a controller to its policy.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use warden_core::TargetScope;

/// Who a configuration belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ControllerIdentity {
    /// Fully qualified type name of the controller, e.g. `my_op::WidgetController`.
    pub type_name: String,
    /// Explicit controller name; overrides the name derived from `type_name`.
    pub name: Option<String>,
}

impl ControllerIdentity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), name: None }
    }

    pub fn of<T: ?Sized>() -> Self {
        Self::new(std::any::type_name::<T>())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Registry key: the explicit name, else the last path segment of the
    /// type name, lowercased. Generic arguments are ignored.
    pub fn controller_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let base = self.type_name.split('<').next().unwrap_or(&self.type_name);
        base.rsplit("::").next().unwrap_or(base).to_ascii_lowercase()
    }
}

impl fmt::Display for ControllerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name)
    }
}

/// Dispatch policy of one controller. Built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfiguration {
    pub name: String,
    pub crd_name: String,
    /// Watched kind as `version/Kind` or `group/version/Kind`.
    pub gvk_key: String,
    pub finalizer_name: String,
    pub generation_aware: bool,
    pub target_scope: TargetScope,
    pub controller_identity: ControllerIdentity,
}

impl ControllerConfiguration {
    pub fn builder(
        identity: ControllerIdentity,
        crd_name: impl Into<String>,
        gvk_key: impl Into<String>,
    ) -> ControllerConfigurationBuilder {
        ControllerConfigurationBuilder {
            identity,
            crd_name: crd_name.into(),
            gvk_key: gvk_key.into(),
            finalizer: None,
            generation_aware: true,
            scope: TargetScope::All,
        }
    }
}

pub fn default_finalizer_name(crd_name: &str) -> String {
    format!("{}/finalizer", crd_name)
}

#[derive(Debug, Clone)]
pub struct ControllerConfigurationBuilder {
    identity: ControllerIdentity,
    crd_name: String,
    gvk_key: String,
    finalizer: Option<String>,
    generation_aware: bool,
    scope: TargetScope,
}

impl ControllerConfigurationBuilder {
    pub fn finalizer(mut self, name: impl Into<String>) -> Self {
        self.finalizer = Some(name.into());
        self
    }

    pub fn generation_aware(mut self, on: bool) -> Self {
        self.generation_aware = on;
        self
    }

    pub fn scope(mut self, scope: TargetScope) -> Self {
        self.scope = scope;
        self
    }

    /// See [`TargetScope::from_namespaces`].
    pub fn namespaces<I, S>(self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope(TargetScope::from_namespaces(namespaces))
    }

    pub fn build(self) -> Result<ControllerConfiguration, RegistryError> {
        let name = self.identity.controller_name();
        if name.is_empty() {
            return Err(RegistryError::InvalidConfiguration(format!("controller {} has an empty name", self.identity)));
        }
        if self.crd_name.trim().is_empty() {
            return Err(RegistryError::InvalidConfiguration(format!("controller '{}' has an empty CRD name", name)));
        }
        let finalizer_name = self.finalizer.unwrap_or_else(|| default_finalizer_name(&self.crd_name));
        if finalizer_name.trim().is_empty() {
            return Err(RegistryError::InvalidConfiguration(format!("controller '{}' has an empty finalizer name", name)));
        }
        Ok(ControllerConfiguration {
            name,
            crd_name: self.crd_name,
            gvk_key: self.gvk_key,
            finalizer_name,
            generation_aware: self.generation_aware,
            target_scope: self.scope,
            controller_identity: self.identity,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("controller name '{name}' is used by both {existing} and {incoming}")]
    NameCollision { name: String, existing: String, incoming: String },
    #[error("invalid controller configuration: {0}")]
    InvalidConfiguration(String),
}

type ConfigMap = FxHashMap<String, Arc<ControllerConfiguration>>;

/// Name-keyed controller configurations.
///
/// Writers are serialized by a mutex; readers load an immutable map and never block.
#[derive(Debug, Default)]
pub struct ConfigurationRegistry {
    configs: ArcSwap<ConfigMap>,
    write: Mutex<()>,
}

impl ConfigurationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `config`; fails without touching the registry if its name is taken.
    pub fn register(&self, config: ControllerConfiguration) -> Result<(), RegistryError> {
        let _guard = self.lock_writers();
        let current = self.configs.load_full();
        if let Some(existing) = current.get(&config.name) {
            return Err(RegistryError::NameCollision {
                name: existing.name.clone(),
                existing: existing.controller_identity.to_string(),
                incoming: config.controller_identity.to_string(),
            });
        }
        self.install(&current, config);
        Ok(())
    }

    /// Install `config`, overwriting any entry with the same name.
    pub fn replace(&self, config: ControllerConfiguration) {
        let _guard = self.lock_writers();
        let current = self.configs.load_full();
        if current.contains_key(&config.name) {
            debug!(controller = %config.name, "replacing controller configuration");
        }
        self.install(&current, config);
    }

    fn lock_writers(&self) -> MutexGuard<'_, ()> {
        self.write.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish `current` plus `config`. Callers hold the writer lock.
    fn install(&self, current: &ConfigMap, config: ControllerConfiguration) {
        let mut next: ConfigMap = current.clone();
        info!(controller = %config.name, gvk = %config.gvk_key, finalizer = %config.finalizer_name, generation_aware = config.generation_aware, "controller configuration installed");
        next.insert(config.name.clone(), Arc::new(config));
        self.configs.store(Arc::new(next));
    }

    pub fn get_configuration_for(&self, controller: &ControllerIdentity) -> Option<Arc<ControllerConfiguration>> {
        self.get(&controller.controller_name())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ControllerConfiguration>> {
        self.configs.load().get(name).cloned()
    }

    pub fn get_known_controller_names(&self) -> BTreeSet<String> {
        self.configs.load().keys().cloned().collect()
    }

    /// Snapshot of every configuration, ordered by name.
    pub fn configurations(&self) -> Vec<Arc<ControllerConfiguration>> {
        let map = self.configs.load();
        let mut out: Vec<_> = map.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
