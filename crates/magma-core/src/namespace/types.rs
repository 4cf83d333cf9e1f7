//! Namespace data types and their binary encoding.

use std::collections::BTreeMap;

use bincode::{Decode, Encode};

use crate::error::{Error, Result};
use crate::ipc::protocol::MAX_MESSAGE_LEN;
use crate::script::{StoredValue, Value};

/// Version written into every namespace file.
pub const FORMAT_VERSION: u32 = 1;

/// Variables and import statements of one document.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub variables: BTreeMap<String, Value>,
    /// Import statements in first-seen order, without duplicates.
    pub imports: Vec<String>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.imports.is_empty()
    }

    /// Record an import statement unless it is already known.
    pub fn add_import(&mut self, line: &str) {
        if !self.imports.iter().any(|l| l == line) {
            self.imports.push(line.to_string());
        }
    }

    /// Apply a delta on top of this namespace.
    pub fn apply(&mut self, delta: &NamespaceDelta) {
        for name in &delta.removed {
            self.variables.remove(name);
        }
        for (name, value) in &delta.set {
            self.variables.insert(name.clone(), Value::from(value.clone()));
        }
        for line in &delta.imports {
            self.add_import(line);
        }
    }

    /// The serializable subset of the variables.
    pub fn stored_variables(&self) -> BTreeMap<String, StoredValue> {
        let mut stored = BTreeMap::new();
        for (name, value) in &self.variables {
            match value.to_stored() {
                Some(v) => {
                    stored.insert(name.clone(), v);
                }
                None => {
                    tracing::debug!("Skipping non-serializable variable '{}' ({})", name, value.type_name());
                }
            }
        }
        stored
    }
}

/// Changes produced by executing statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceDelta {
    /// Names bound or rebound to serializable values.
    pub set: BTreeMap<String, StoredValue>,
    /// Names that were deleted or became non-serializable.
    pub removed: Vec<String>,
    /// Newly seen import statements.
    pub imports: Vec<String>,
}

impl NamespaceDelta {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty() && self.imports.is_empty()
    }

    /// Fold a later delta into this one.
    pub fn absorb(&mut self, later: NamespaceDelta) {
        for name in later.removed {
            self.set.remove(&name);
            if !self.removed.contains(&name) {
                self.removed.push(name);
            }
        }
        for (name, value) in later.set {
            self.removed.retain(|n| *n != name);
            self.set.insert(name, value);
        }
        for line in later.imports {
            if !self.imports.contains(&line) {
                self.imports.push(line);
            }
        }
    }
}

/// On-disk layout of a namespace file.
#[derive(Debug, Encode, Decode)]
pub(crate) struct NamespaceFile {
    pub format_version: u32,
    pub variables: BTreeMap<String, StoredValue>,
    pub imports: Vec<String>,
}

type Config = bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Varint,
    bincode::config::Limit<MAX_MESSAGE_LEN>,
>;

/// Decoding never allocates more than one IPC frame can carry.
fn config() -> Config {
    bincode::config::standard().with_limit::<MAX_MESSAGE_LEN>()
}

pub(crate) fn encode_namespace(namespace: &Namespace) -> Result<Vec<u8>> {
    let file = NamespaceFile {
        format_version: FORMAT_VERSION,
        variables: namespace.stored_variables(),
        imports: namespace.imports.clone(),
    };
    bincode::encode_to_vec(&file, config()).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn decode_namespace(bytes: &[u8]) -> Result<Namespace> {
    let (file, _): (NamespaceFile, _) = bincode::decode_from_slice(bytes, config())
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    if file.format_version != FORMAT_VERSION {
        return Err(Error::Deserialization(format!(
            "unsupported namespace format version {}",
            file.format_version
        )));
    }
    Ok(Namespace {
        variables: file
            .variables
            .into_iter()
            .map(|(name, value)| (name, Value::from(value)))
            .collect(),
        imports: file.imports,
    })
}

/// Encode a single value for transport.
pub fn encode_value(value: &StoredValue) -> Result<Vec<u8>> {
    bincode::encode_to_vec(value, config()).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a value produced by [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> Result<StoredValue> {
    bincode::decode_from_slice(bytes, config())
        .map(|(value, _)| value)
        .map_err(|e| Error::Deserialization(e.to_string()))
}

/// Encode the serializable variables of a namespace for transport.
pub fn encode_variables(variables: &BTreeMap<String, StoredValue>) -> Result<Vec<u8>> {
    bincode::encode_to_vec(variables, config()).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode variables produced by [`encode_variables`].
pub fn decode_variables(bytes: &[u8]) -> Result<BTreeMap<String, StoredValue>> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    bincode::decode_from_slice(bytes, config())
        .map(|(vars, _)| vars)
        .map_err(|e| Error::Deserialization(e.to_string()))
}
