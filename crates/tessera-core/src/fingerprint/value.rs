//! Structural value model for unit arguments, captures and globals.
//!
//! Everything that can influence a unit's output is expressed as a [`Value`].
//! The set of shapes is closed on purpose: each variant has exactly one
//! canonical encoding in the fingerprint engine.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

use super::Uncacheable;
use super::unit::FunctionDescriptor;

/// A value that can be passed to, captured by, or read by a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Unsigned integer above `i64::MAX`. Smaller values are `Int`.
    UInt(u64),
    /// JSON has no NaN or infinities; they travel as `null` and decode as NaN.
    Float(#[serde(deserialize_with = "float_or_nan")] f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Point in time relative to the Unix epoch. `nanos` is always in `0..1e9`.
    Timestamp { secs: i64, nanos: u32 },
    Duration { secs: u64, nanos: u32 },
    Path(String),
    /// Ordered sequence. Element order is significant.
    Seq(Vec<Value>),
    /// Unordered key/value pairs. Pair order is not significant.
    Map(Vec<(Value, Value)>),
    /// Unordered collection. Element order and duplicates are not significant.
    Set(Vec<Value>),
    /// A function-like value (e.g. a callback passed as an argument).
    Function(Box<FunctionDescriptor>),
    /// A pre-serialized value with no structural encoding.
    Opaque(OpaqueBlob),
}

fn float_or_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Where an opaque blob's serialized form came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpaqueOrigin {
    /// Bytes are stable across processes and builds.
    Portable,
    /// Bytes reference a type that only exists in the entry-point binary,
    /// so they cannot be trusted to mean the same thing in another build.
    EntryPoint,
}

/// Serialized value with a declared origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueBlob {
    pub type_name: String,
    pub bytes: Vec<u8>,
    pub origin: OpaqueOrigin,
}

impl OpaqueBlob {
    /// Blob whose bytes are stable across processes.
    pub fn portable(type_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            bytes: bytes.into(),
            origin: OpaqueOrigin::Portable,
        }
    }

    /// Blob that embeds a reference to the entry-point binary.
    ///
    /// Any unit touching such a blob is uncacheable.
    pub fn entry_point(type_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            bytes: bytes.into(),
            origin: OpaqueOrigin::EntryPoint,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.origin == OpaqueOrigin::Portable
    }
}

impl Value {
    /// Raw byte string.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    /// Build a value from anything implementing [`Canonical`].
    pub fn of<T: Canonical + ?Sized>(value: &T) -> Self {
        value.canonical()
    }

    /// General fallback: serialize through `serde_json` into the structural model.
    ///
    /// JSON objects become [`Value::Map`] with string keys, so field order does
    /// not matter. Unsigned integers above `i64::MAX` become [`Value::UInt`].
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, Uncacheable> {
        let json = serde_json::to_value(value).map_err(|e| {
            Uncacheable::new(format!(
                "{} cannot be serialized: {}",
                std::any::type_name::<T>(),
                e
            ))
        })?;
        Ok(Self::from_json(json))
    }

    fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (Value::Str(k), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Short name of the variant, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Timestamp { .. } => "timestamp",
            Value::Duration { .. } => "duration",
            Value::Path(_) => "path",
            Value::Seq(_) => "seq",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Function(_) => "function",
            Value::Opaque(_) => "opaque",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) => u64::try_from(*i).ok(),
            Value::UInt(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<FunctionDescriptor> for Value {
    fn from(f: FunctionDescriptor) -> Self {
        Value::Function(Box::new(f))
    }
}

/// Conversion of a Rust value into its canonical [`Value`].
///
/// Implement this for domain types whose output-relevant state should be
/// spelled out explicitly instead of going through [`Value::from_serialize`].
pub trait Canonical {
    fn canonical(&self) -> Value;
}

impl Canonical for Value {
    fn canonical(&self) -> Value {
        self.clone()
    }
}

impl Canonical for bool {
    fn canonical(&self) -> Value {
        Value::Bool(*self)
    }
}

macro_rules! canonical_int {
    ($($t:ty),*) => {
        $(impl Canonical for $t {
            fn canonical(&self) -> Value {
                Value::Int(i64::from(*self))
            }
        })*
    };
}

canonical_int!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! canonical_wide_uint {
    ($($t:ty),*) => {
        $(impl Canonical for $t {
            fn canonical(&self) -> Value {
                match i64::try_from(*self) {
                    Ok(i) => Value::Int(i),
                    Err(_) => Value::UInt(*self as u64),
                }
            }
        })*
    };
}

canonical_wide_uint!(u64, usize);

impl Canonical for f32 {
    fn canonical(&self) -> Value {
        Value::Float(f64::from(*self))
    }
}

impl Canonical for f64 {
    fn canonical(&self) -> Value {
        Value::Float(*self)
    }
}

impl Canonical for str {
    fn canonical(&self) -> Value {
        Value::Str(self.to_string())
    }
}

impl Canonical for String {
    fn canonical(&self) -> Value {
        Value::Str(self.clone())
    }
}

impl Canonical for Path {
    fn canonical(&self) -> Value {
        Value::Path(self.to_string_lossy().into_owned())
    }
}

impl Canonical for PathBuf {
    fn canonical(&self) -> Value {
        self.as_path().canonical()
    }
}

impl Canonical for Duration {
    fn canonical(&self) -> Value {
        Value::Duration {
            secs: self.as_secs(),
            nanos: self.subsec_nanos(),
        }
    }
}

impl Canonical for SystemTime {
    fn canonical(&self) -> Value {
        let (secs, nanos) = match self.duration_since(UNIX_EPOCH) {
            Ok(after) => (after.as_secs() as i64, after.subsec_nanos()),
            Err(e) => {
                let before = e.duration();
                let mut secs = -(before.as_secs() as i64);
                let mut nanos = before.subsec_nanos();
                if nanos > 0 {
                    secs -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                (secs, nanos)
            }
        };
        Value::Timestamp { secs, nanos }
    }
}

impl Canonical for FunctionDescriptor {
    fn canonical(&self) -> Value {
        Value::Function(Box::new(self.clone()))
    }
}

impl<T: Canonical + ?Sized> Canonical for &T {
    fn canonical(&self) -> Value {
        (**self).canonical()
    }
}

impl<T: Canonical> Canonical for Option<T> {
    fn canonical(&self) -> Value {
        match self {
            Some(v) => v.canonical(),
            None => Value::Null,
        }
    }
}

impl<T: Canonical> Canonical for [T] {
    fn canonical(&self) -> Value {
        Value::Seq(self.iter().map(Canonical::canonical).collect())
    }
}

impl<T: Canonical> Canonical for Vec<T> {
    fn canonical(&self) -> Value {
        self.as_slice().canonical()
    }
}

impl<K: Canonical, V: Canonical> Canonical for BTreeMap<K, V> {
    fn canonical(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.canonical(), v.canonical()))
                .collect(),
        )
    }
}

impl<K: Canonical, V: Canonical, S> Canonical for HashMap<K, V, S> {
    fn canonical(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.canonical(), v.canonical()))
                .collect(),
        )
    }
}

impl<T: Canonical> Canonical for BTreeSet<T> {
    fn canonical(&self) -> Value {
        Value::Set(self.iter().map(Canonical::canonical).collect())
    }
}

impl<T: Canonical, S> Canonical for HashSet<T, S> {
    fn canonical(&self) -> Value {
        Value::Set(self.iter().map(Canonical::canonical).collect())
    }
}

impl<A: Canonical, B: Canonical> Canonical for (A, B) {
    fn canonical(&self) -> Value {
        Value::Seq(vec![self.0.canonical(), self.1.canonical()])
    }
}

impl<A: Canonical, B: Canonical, C: Canonical> Canonical for (A, B, C) {
    fn canonical(&self) -> Value {
        Value::Seq(vec![
            self.0.canonical(),
            self.1.canonical(),
            self.2.canonical(),
        ])
    }
}
