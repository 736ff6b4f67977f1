//! Registry of the units a worker program provides.
//!
//! A registry is immutable once built. Reloads build a fresh one and publish
//! it through a [`RegistryHandle`] as a new `{generation, registry}` snapshot.

use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::{CallArgs, ComputationUnit, FunctionDescriptor, Globals};

/// What a worker program reports in response to `Describe`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub units: Vec<FunctionDescriptor>,
    #[serde(default)]
    pub globals: Globals,
}

/// Units by name, plus the globals they can read.
#[derive(Debug, Clone, Default)]
pub struct UnitRegistry {
    units: FxHashMap<String, FunctionDescriptor>,
    globals: Arc<Globals>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a catalog, rejecting duplicate unit names.
    pub fn from_catalog(catalog: Catalog) -> Result<Self> {
        let mut registry = Self {
            units: FxHashMap::default(),
            globals: Arc::new(catalog.globals),
        };
        for unit in catalog.units {
            registry.register(unit)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, unit: FunctionDescriptor) -> Result<()> {
        if self.units.contains_key(&unit.name) {
            return Err(Error::DuplicateUnit(unit.name));
        }
        self.units.insert(unit.name.clone(), unit);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.units.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.units.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.globals
    }

    /// Bind `call` to the unit `name`.
    pub fn unit(&self, name: &str, call: CallArgs) -> Result<ComputationUnit> {
        let function = self
            .get(name)
            .ok_or_else(|| Error::UnitNotFound(name.to_string()))?;
        Ok(ComputationUnit::new(function.clone(), Arc::clone(&self.globals)).with_call(call))
    }
}

/// A registry together with the code generation it belongs to.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub generation: u64,
    pub registry: Arc<UnitRegistry>,
}

/// Shared, atomically swappable registry snapshot.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    current: Arc<RwLock<Arc<RegistrySnapshot>>>,
}

impl RegistryHandle {
    /// Handle publishing `registry` as generation 0.
    pub fn new(registry: UnitRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(RegistrySnapshot {
                generation: 0,
                registry: Arc::new(registry),
            }))),
        }
    }

    /// The current snapshot. Never observes a partially published registry.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Replace the registry, bumping the generation. Returns the new generation.
    pub fn publish(&self, registry: UnitRegistry) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = current.generation + 1;
        *current = Arc::new(RegistrySnapshot {
            generation,
            registry: Arc::new(registry),
        });
        generation
    }
}
