//! Deterministic task identities.
//!
//! A signature is derived from a task's name, version and parameter tree
//! only. The tree is first written out in a canonical, type-tagged byte form:
//! parameters sorted by name, sequences in their original order, sets and
//! maps sorted by the canonical bytes of their elements, records field by
//! field with ignored fields left out, and outputs replaced by the signature
//! of the task that owns them. The bytes are hashed with BLAKE3 and the digest
//! is reduced modulo 10^10.
//!
//! Nothing in the canonical form depends on memory addresses, hasher seeds or
//! container iteration order, so equal inputs produce equal signatures in
//! every process on every machine.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Debug, Display};

use crate::error::SignatureError;
use crate::value::{Record, Value};

const MODULUS: u64 = 10_000_000_000;

/// The identity of a task and the key its result is persisted under.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Signature(u64);

impl Signature {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Cache key used by the persistence layer.
    pub fn key(self) -> String {
        self.0.to_string()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", self.0)
    }
}

/// 32 bytes length BLAKE3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Reads the digest as a big-endian integer and reduces it.
    pub(crate) fn reduce(self) -> Signature {
        let rem = self
            .0
            .iter()
            .fold(0u64, |acc, &byte| (acc * 256 + u64::from(byte)) % MODULUS);
        Signature(rem)
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Computes the signature of a task.
pub fn compute_signature(
    name: &str,
    version: u32,
    params: &BTreeMap<String, Value>,
) -> Result<Signature, SignatureError> {
    let bytes = canonical_form(name, version, params)?;
    let digest = Hash32::hash(&bytes);
    tracing::trace!(name, version, digest = ?digest, "computed signature");
    Ok(digest.reduce())
}

/// The byte string that gets hashed.
pub(crate) fn canonical_form(
    name: &str,
    version: u32,
    params: &BTreeMap<String, Value>,
) -> Result<Vec<u8>, SignatureError> {
    let mut enc = Encoder::default();
    enc.str(name);
    enc.len(version as usize);
    enc.len(params.len());

    // BTreeMap iterates sorted by parameter name
    for (key, value) in params {
        enc.str(key);
        enc.value(value)?;
    }

    Ok(enc.buf)
}

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn len(&mut self, len: usize) {
        self.buf.extend_from_slice(&(len as u64).to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.blob(s.as_bytes());
    }

    fn blob(&mut self, bytes: &[u8]) {
        self.len(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Any value without structure: type tag plus canonical string form.
    fn scalar(&mut self, tag: &str, repr: &str) {
        self.buf.push(b'v');
        self.str(tag);
        self.str(repr);
    }

    fn value(&mut self, value: &Value) -> Result<(), SignatureError> {
        match value {
            Value::Str(s) => {
                self.buf.push(b's');
                self.str(s);
            }
            Value::Output(output) => {
                self.buf.push(b'o');
                self.buf
                    .extend_from_slice(&output.owner().signature().as_u64().to_le_bytes());
            }
            Value::List(items) | Value::Tuple(items) => {
                self.buf.push(if matches!(value, Value::List(_)) { b'l' } else { b't' });
                self.len(items.len());
                for item in items {
                    self.value(item)?;
                }
            }
            Value::Set(items) => {
                let mut encoded = items.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
                encoded.sort();
                self.buf.push(b'S');
                self.len(encoded.len());
                for item in &encoded {
                    self.blob(item);
                }
            }
            Value::Map(map) => {
                let mut encoded = map
                    .iter()
                    .map(|(k, v)| Ok((encode(k)?, encode(v)?)))
                    .collect::<Result<Vec<_>, SignatureError>>()?;
                encoded.sort();
                self.buf.push(b'm');
                self.len(encoded.len());
                for (k, v) in &encoded {
                    self.blob(k);
                    self.blob(v);
                }
            }
            Value::Record(record) => self.record(record)?,
            Value::Null => self.scalar("null", "null"),
            Value::Bool(b) => self.scalar("bool", if *b { "true" } else { "false" }),
            Value::Int(i) => self.scalar("int", &i.to_string()),
            Value::Float(f) => self.scalar("float", &format!("{f:?}")),
        }
        Ok(())
    }

    fn record(&mut self, record: &Record) -> Result<(), SignatureError> {
        let mut seen = HashSet::new();
        let mut fields = Vec::new();

        for field in record.fields() {
            if !seen.insert(field.name.as_str()) {
                return Err(SignatureError::DuplicateField {
                    record: record.name().to_string(),
                    field: field.name.clone(),
                });
            }
            if !field.ignored {
                fields.push((field.name.as_str(), &field.value));
            }
        }

        fields.sort_by(|a, b| a.0.cmp(b.0));

        self.buf.push(b'r');
        self.str(record.name());
        self.len(fields.len());
        for (name, value) in fields {
            self.str(name);
            self.value(value)?;
        }
        Ok(())
    }
}

fn encode(value: &Value) -> Result<Vec<u8>, SignatureError> {
    let mut enc = Encoder::default();
    enc.value(value)?;
    Ok(enc.buf)
}
