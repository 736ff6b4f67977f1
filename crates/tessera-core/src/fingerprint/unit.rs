//! Computation units: a function descriptor plus everything bound to it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::value::{Canonical, Value};

/// Author-supplied description of a unit's output-relevant state.
///
/// Compiled closures can't be introspected portably, so a unit declares what
/// affects its output: a stable identifier for its logic, its default
/// arguments, the values it captures, and the globals it reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Registry name. Not part of the fingerprint.
    pub name: String,
    /// Stable identifier of the executable logic (version tag, source digest, ...).
    pub logic: String,
    /// Default argument values, in declaration order.
    #[serde(default)]
    pub defaults: Vec<(String, Value)>,
    /// Captured values, by name.
    #[serde(default)]
    pub captures: Vec<(String, Value)>,
    /// Names of the globals this function reads.
    #[serde(default)]
    pub globals: Vec<String>,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, logic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logic: logic.into(),
            defaults: Vec::new(),
            captures: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn with_default(mut self, name: impl Into<String>, value: impl Canonical) -> Self {
        self.defaults.push((name.into(), value.canonical()));
        self
    }

    pub fn capture(mut self, name: impl Into<String>, value: impl Canonical) -> Self {
        self.captures.push((name.into(), value.canonical()));
        self
    }

    pub fn reads_global(mut self, name: impl Into<String>) -> Self {
        self.globals.push(name.into());
        self
    }

    /// Default value for a parameter, if one was declared.
    pub fn default_for(&self, name: &str) -> Option<&Value> {
        self.defaults
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value)
    }
}

/// Module-level state visible to units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Globals(BTreeMap<String, Value>);

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Canonical) -> Option<Value> {
        self.0.insert(name.into(), value.canonical())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Arguments of a single call, as sent to a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
    }
}

/// What to run: a function, its bound arguments, and the globals it can see.
///
/// Immutable once built; cheap to clone since globals are shared.
#[derive(Debug, Clone)]
pub struct ComputationUnit {
    function: FunctionDescriptor,
    call: CallArgs,
    globals: Arc<Globals>,
}

impl ComputationUnit {
    pub fn new(function: FunctionDescriptor, globals: Arc<Globals>) -> Self {
        Self {
            function,
            call: CallArgs::default(),
            globals,
        }
    }

    /// Unit with no globals in scope.
    pub fn standalone(function: FunctionDescriptor) -> Self {
        Self::new(function, Arc::new(Globals::new()))
    }

    pub fn arg(mut self, value: impl Canonical) -> Self {
        self.call.args.push(value.canonical());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Canonical) -> Self {
        self.call.kwargs.insert(name.into(), value.canonical());
        self
    }

    pub fn with_call(mut self, call: CallArgs) -> Self {
        self.call = call;
        self
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn function(&self) -> &FunctionDescriptor {
        &self.function
    }

    pub fn call(&self) -> &CallArgs {
        &self.call
    }

    pub fn args(&self) -> &[Value] {
        &self.call.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.call.kwargs
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }
}
