//! Deterministic fingerprints for computation units.
//!
//! A fingerprint is a SHA-256 digest over a canonical byte encoding of a
//! unit: its logic identifier, defaults, captured values, the globals it
//! reads, and its bound arguments. The encoding never depends on memory
//! addresses, hash-map iteration order or the unit's name, so the same unit
//! yields the same digest in every process.
//!
//! # Encoding
//!
//! ```text
//! DOMAIN | [GENERATION u64] | function | seq(args) | sorted(kwargs)
//! ```
//!
//! Every value is a one-byte tag followed by its payload; variable-length
//! payloads are prefixed with their length (u64 LE). Unordered containers
//! encode each element separately and sort the encodings before emitting them.

mod unit;
mod value;

use std::fmt;

use sha2::{Digest, Sha256};

pub use unit::{CallArgs, ComputationUnit, FunctionDescriptor, Globals};
pub use value::{Canonical, OpaqueBlob, OpaqueOrigin, Value};

const DOMAIN: &[u8] = b"tessera-fingerprint-v1";

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_TIMESTAMP: u8 = 0x06;
const TAG_DURATION: u8 = 0x07;
const TAG_PATH: u8 = 0x08;
const TAG_UINT: u8 = 0x09;
const TAG_SEQ: u8 = 0x10;
const TAG_MAP: u8 = 0x11;
const TAG_SET: u8 = 0x12;
const TAG_FUNCTION: u8 = 0x20;
const TAG_GLOBAL_MISSING: u8 = 0x21;
const TAG_GLOBAL_CYCLE: u8 = 0x22;
const TAG_OPAQUE: u8 = 0x30;
const TAG_GENERATION: u8 = 0x40;

const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

/// SHA-256 digest identifying a unit and its inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex digest.
    pub fn from_hex(hex_digest: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_digest, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Name of the advisory lock guarding computation of this key.
    pub fn lock_key(&self) -> String {
        format!("{}-lock", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// The unit can't be fingerprinted deterministically.
///
/// Not an error: the caller runs the unit without caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uncacheable {
    pub reason: String,
}

impl Uncacheable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Uncacheable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uncacheable: {}", self.reason)
    }
}

/// Computes fingerprints, optionally salted with a code generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter {
    generation: Option<u64>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mix a code generation into every digest, so keys computed under
    /// different code versions never collide.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn fingerprint(&self, unit: &ComputationUnit) -> Result<Fingerprint, Uncacheable> {
        let mut encoder = Encoder::new(unit.globals());
        encoder.out.extend_from_slice(DOMAIN);
        if let Some(generation) = self.generation {
            encoder.out.push(TAG_GENERATION);
            encoder.out.extend_from_slice(&generation.to_le_bytes());
        }

        encoder.function(unit.function())?;
        encoder.seq(unit.args())?;
        encoder.len(unit.kwargs().len());
        // BTreeMap iteration is already sorted by name.
        for (name, value) in unit.kwargs() {
            encoder.str(TAG_STR, name);
            encoder.value(value)?;
        }

        Ok(Fingerprint(Sha256::digest(&encoder.out).into()))
    }

    /// Fingerprint a standalone value, resolving function globals against `globals`.
    pub fn fingerprint_value(
        &self,
        value: &Value,
        globals: &Globals,
    ) -> Result<Fingerprint, Uncacheable> {
        let mut encoder = Encoder::new(globals);
        encoder.out.extend_from_slice(DOMAIN);
        if let Some(generation) = self.generation {
            encoder.out.push(TAG_GENERATION);
            encoder.out.extend_from_slice(&generation.to_le_bytes());
        }
        encoder.value(value)?;
        Ok(Fingerprint(Sha256::digest(&encoder.out).into()))
    }
}

/// Fingerprint a unit without a generation salt.
pub fn fingerprint(unit: &ComputationUnit) -> Result<Fingerprint, Uncacheable> {
    Fingerprinter::new().fingerprint(unit)
}

/// Canonical byte encoder.
struct Encoder<'g> {
    globals: &'g Globals,
    /// Globals currently being expanded, to cut reference cycles.
    resolving: Vec<String>,
    out: Vec<u8>,
}

impl<'g> Encoder<'g> {
    fn new(globals: &'g Globals) -> Self {
        Self {
            globals,
            resolving: Vec::new(),
            out: Vec::with_capacity(256),
        }
    }

    /// Encoder sharing this one's globals and cycle state, with a fresh buffer.
    fn nested(&self) -> Encoder<'g> {
        Encoder {
            globals: self.globals,
            resolving: self.resolving.clone(),
            out: Vec::new(),
        }
    }

    fn len(&mut self, len: usize) {
        self.out.extend_from_slice(&(len as u64).to_le_bytes());
    }

    fn str(&mut self, tag: u8, s: &str) {
        self.out.push(tag);
        self.len(s.len());
        self.out.extend_from_slice(s.as_bytes());
    }

    fn value(&mut self, value: &Value) -> Result<(), Uncacheable> {
        match value {
            Value::Null => self.out.push(TAG_NULL),
            Value::Bool(b) => {
                self.out.push(TAG_BOOL);
                self.out.push(u8::from(*b));
            }
            Value::Int(i) => {
                self.out.push(TAG_INT);
                self.out.extend_from_slice(&i.to_le_bytes());
            }
            // Small values fold into `Int` so both spellings agree.
            Value::UInt(u) => match i64::try_from(*u) {
                Ok(i) => {
                    self.out.push(TAG_INT);
                    self.out.extend_from_slice(&i.to_le_bytes());
                }
                Err(_) => {
                    self.out.push(TAG_UINT);
                    self.out.extend_from_slice(&u.to_le_bytes());
                }
            },
            Value::Float(f) => {
                self.out.push(TAG_FLOAT);
                self.out.extend_from_slice(&canonical_float_bits(*f).to_le_bytes());
            }
            Value::Str(s) => self.str(TAG_STR, s),
            Value::Bytes(b) => {
                self.out.push(TAG_BYTES);
                self.len(b.len());
                self.out.extend_from_slice(b);
            }
            Value::Timestamp { secs, nanos } => {
                self.out.push(TAG_TIMESTAMP);
                self.out.extend_from_slice(&secs.to_le_bytes());
                self.out.extend_from_slice(&nanos.to_le_bytes());
            }
            Value::Duration { secs, nanos } => {
                self.out.push(TAG_DURATION);
                self.out.extend_from_slice(&secs.to_le_bytes());
                self.out.extend_from_slice(&nanos.to_le_bytes());
            }
            Value::Path(p) => self.str(TAG_PATH, p),
            Value::Seq(items) => {
                self.out.push(TAG_SEQ);
                self.seq(items)?;
            }
            Value::Map(pairs) => {
                let mut encoded = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let mut pair = self.nested();
                    pair.value(k)?;
                    pair.value(v)?;
                    encoded.push(pair.out);
                }
                encoded.sort_unstable();
                self.out.push(TAG_MAP);
                self.sorted(encoded);
            }
            Value::Set(items) => {
                let mut encoded = Vec::with_capacity(items.len());
                for item in items {
                    let mut element = self.nested();
                    element.value(item)?;
                    encoded.push(element.out);
                }
                encoded.sort_unstable();
                encoded.dedup();
                self.out.push(TAG_SET);
                self.sorted(encoded);
            }
            Value::Function(f) => self.function(f)?,
            Value::Opaque(blob) => {
                if !blob.is_deterministic() {
                    return Err(Uncacheable::new(format!(
                        "value of type {} references the entry-point binary",
                        blob.type_name
                    )));
                }
                self.str(TAG_OPAQUE, &blob.type_name);
                self.len(blob.bytes.len());
                self.out.extend_from_slice(&blob.bytes);
            }
        }
        Ok(())
    }

    fn seq(&mut self, items: &[Value]) -> Result<(), Uncacheable> {
        self.len(items.len());
        for item in items {
            self.value(item)?;
        }
        Ok(())
    }

    fn sorted(&mut self, encoded: Vec<Vec<u8>>) {
        self.len(encoded.len());
        for chunk in encoded {
            self.len(chunk.len());
            self.out.extend_from_slice(&chunk);
        }
    }

    fn function(&mut self, f: &FunctionDescriptor) -> Result<(), Uncacheable> {
        self.str(TAG_FUNCTION, &f.logic);

        self.len(f.defaults.len());
        for (name, value) in &f.defaults {
            self.str(TAG_STR, name);
            self.value(value)?;
        }

        let mut captures: Vec<&(String, Value)> = f.captures.iter().collect();
        captures.sort_by(|a, b| a.0.cmp(&b.0));
        self.len(captures.len());
        for (name, value) in captures {
            self.str(TAG_STR, name);
            self.value(value)?;
        }

        let mut names: Vec<&str> = f.globals.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        self.len(names.len());
        for name in names {
            self.str(TAG_STR, name);
            if self.resolving.iter().any(|r| r == name) {
                self.out.push(TAG_GLOBAL_CYCLE);
                continue;
            }
            match self.globals.get(name) {
                Some(value) => {
                    self.resolving.push(name.to_string());
                    let result = self.value(value);
                    self.resolving.pop();
                    result?;
                }
                None => self.out.push(TAG_GLOBAL_MISSING),
            }
        }
        Ok(())
    }
}

fn canonical_float_bits(f: f64) -> u64 {
    if f.is_nan() {
        CANONICAL_NAN
    } else if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}
