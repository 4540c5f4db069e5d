//! Cache Policies
//!
//! A policy is a list of key-material providers. Each provider looks at
//! the run and contributes a piece of JSON, or nothing. The cache key is
//! the SHA-256 hex digest of the canonical JSON of every contribution,
//! labelled by provider. A policy whose providers all contribute nothing
//! yields no key and the run is never cached.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::locking::LockManager;
use crate::run::Parameters;
use crate::storage::ResultStorage;
use crate::transaction::IsolationLevel;

/// Everything a provider may derive key material from.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyContext {
    pub run_id: Option<Uuid>,
    pub definition_name: String,
    pub definition_source: String,
    /// Parent run id, when the run is nested
    pub scope: Option<Uuid>,
    pub parameters: Parameters,
    pub flow_parameters: Option<Parameters>,
}

/// User-supplied key material function.
pub type KeyFn = Arc<dyn Fn(&CacheKeyContext) -> Option<String> + Send + Sync>;

/// One provider of cache key material.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Hash of the run's parameters, minus excluded names
    Inputs { exclude: BTreeSet<String> },
    /// Hash of the definition's source text
    DefinitionSource,
    /// The enclosing run's id
    RunScope,
    /// Parameters of the enclosing flow run
    FlowParameters,
    Custom { name: String, func: KeyFn },
}

impl KeyMaterial {
    fn label(&self) -> &str {
        match self {
            Self::Inputs { .. } => "inputs",
            Self::DefinitionSource => "definition_source",
            Self::RunScope => "run_scope",
            Self::FlowParameters => "flow_parameters",
            Self::Custom { name, .. } => name,
        }
    }

    fn material(&self, ctx: &CacheKeyContext) -> Option<Value> {
        match self {
            Self::Inputs { exclude } => {
                let inputs: serde_json::Map<String, Value> = ctx
                    .parameters
                    .iter()
                    .filter(|(name, _)| !exclude.contains(*name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                Some(Value::Object(inputs))
            }
            Self::DefinitionSource => Some(json!({
                "name": ctx.definition_name,
                "source": hash_hex(ctx.definition_source.as_bytes()),
            })),
            Self::RunScope => ctx.scope.map(|id| Value::String(id.to_string())),
            Self::FlowParameters => ctx
                .flow_parameters
                .as_ref()
                .and_then(|p| serde_json::to_value(p).ok()),
            Self::Custom { func, .. } => func(ctx).map(Value::String),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inputs { exclude } => f.debug_struct("Inputs").field("exclude", exclude).finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
            other => f.write_str(other.label()),
        }
    }
}

/// A composable recipe for cache keys plus where records live.
#[derive(Clone, Default)]
pub struct CachePolicy {
    materials: Vec<KeyMaterial>,
    key_storage: Option<Arc<dyn ResultStorage>>,
    isolation_level: Option<IsolationLevel>,
    lock_manager: Option<Arc<dyn LockManager>>,
}

impl CachePolicy {
    /// Never caches.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn inputs() -> Self {
        Self::from_material(KeyMaterial::Inputs {
            exclude: BTreeSet::new(),
        })
    }

    pub fn definition_source() -> Self {
        Self::from_material(KeyMaterial::DefinitionSource)
    }

    pub fn run_scope() -> Self {
        Self::from_material(KeyMaterial::RunScope)
    }

    pub fn flow_parameters() -> Self {
        Self::from_material(KeyMaterial::FlowParameters)
    }

    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&CacheKeyContext) -> Option<String> + Send + Sync + 'static,
    {
        Self::from_material(KeyMaterial::Custom {
            name: name.into(),
            func: Arc::new(func),
        })
    }

    /// Definition source, inputs and run scope.
    pub fn default_policy() -> Self {
        Self::definition_source()
            .combine(Self::inputs())
            .combine(Self::run_scope())
    }

    fn from_material(material: KeyMaterial) -> Self {
        Self {
            materials: vec![material],
            ..Self::default()
        }
    }

    /// Adds `other`'s providers to this policy.
    ///
    /// Storage, isolation and lock settings of `self` win; `other`'s
    /// fill in whatever `self` leaves unset.
    pub fn combine(mut self, other: CachePolicy) -> Self {
        self.materials.extend(other.materials);
        self.key_storage = self.key_storage.or(other.key_storage);
        self.isolation_level = self.isolation_level.or(other.isolation_level);
        self.lock_manager = self.lock_manager.or(other.lock_manager);
        self
    }

    /// Excludes a named input from every inputs provider.
    pub fn without_input(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        for material in &mut self.materials {
            if let KeyMaterial::Inputs { exclude } = material {
                exclude.insert(name.clone());
            }
        }
        self
    }

    pub fn with_key_storage(mut self, storage: Arc<dyn ResultStorage>) -> Self {
        self.key_storage = Some(storage);
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(lock_manager);
        self
    }

    pub fn materials(&self) -> &[KeyMaterial] {
        &self.materials
    }

    pub fn key_storage(&self) -> Option<&Arc<dyn ResultStorage>> {
        self.key_storage.as_ref()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level.unwrap_or_default()
    }

    pub fn lock_manager(&self) -> Option<&Arc<dyn LockManager>> {
        self.lock_manager.as_ref()
    }

    /// Returns true if this policy can never produce a key.
    pub fn is_none(&self) -> bool {
        self.materials.is_empty()
    }

    /// Computes the cache key for a run, or `None` if it must not be cached.
    pub fn compute_key(&self, ctx: &CacheKeyContext) -> Option<String> {
        let parts: Vec<Value> = self
            .materials
            .iter()
            .filter_map(|m| m.material(ctx).map(|v| json!([m.label(), v])))
            .collect();

        if parts.is_empty() {
            return None;
        }

        // serde_json maps are ordered, so this encoding is canonical
        let canonical = serde_json::to_vec(&parts).ok()?;
        Some(hash_hex(&canonical))
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("materials", &self.materials)
            .field("key_storage", &self.key_storage.as_ref().map(|s| s.describe()))
            .field("isolation_level", &self.isolation_level)
            .field("lock_manager", &self.lock_manager.is_some())
            .finish()
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
