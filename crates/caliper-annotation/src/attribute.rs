//! The attribute registry: user-declared annotation names and their
//! metadata, append-only for the engine's lifetime.

use bitflags::bitflags;
use hashbrown::HashMap;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::RwLock;

use crate::node::INV_ID;
use crate::sink::AttributeSink;

bitflags! {
    /// Declaration-time flags describing how an attribute's values are
    /// stored and where they are visible.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttributeProperties: u32 {
        /// Store the 8-byte value inline in the `Context` entry instead of
        /// interning it as a node in the context trie.
        const STORE_AS_VALUE = 0x01;
        /// The attribute is visible from every environment, not just the
        /// one that last set it.
        const GLOBAL = 0x02;
    }
}

impl Serialize for AttributeProperties {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for AttributeProperties {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        AttributeProperties::from_bits(bits).ok_or_else(|| D::Error::custom("invalid attribute property bits"))
    }
}

/// The declared type of an attribute's values.
///
/// Carried purely as metadata for sinks and for `unpack`'s typed-record
/// projection; the engine itself is agnostic to which variant an attribute
/// uses except for `STORE_AS_VALUE`'s 8-byte immediate fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    /// Reserved; never assigned to a real attribute.
    Inv,
    /// User-defined, opaque byte payload.
    Usr,
    Int,
    UInt,
    String,
    Addr,
    Double,
    Bool,
    Type,
}

/// A declared annotation dimension: a stable id, its name, type, and
/// properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    id: u32,
    name: String,
    kind: AttributeType,
    properties: AttributeProperties,
}

impl Attribute {
    /// The sentinel returned by lookups that miss.
    pub fn invalid() -> Attribute {
        Attribute {
            id: INV_ID,
            name: String::new(),
            kind: AttributeType::Inv,
            properties: AttributeProperties::empty(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttributeType {
        self.kind
    }

    pub fn properties(&self) -> AttributeProperties {
        self.properties
    }

    pub fn is_valid(&self) -> bool {
        self.id != INV_ID
    }

    pub fn store_as_value(&self) -> bool {
        self.properties.contains(AttributeProperties::STORE_AS_VALUE)
    }

    pub fn is_global(&self) -> bool {
        self.properties.contains(AttributeProperties::GLOBAL)
    }
}

/// Registry of declared attributes, append-only and safe to read
/// concurrently with creates.
pub struct AttributeStore {
    inner: RwLock<Inner>,
}

struct Inner {
    by_id: Vec<Attribute>,
    by_name: HashMap<String, u32>,
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeStore {
    pub fn new() -> Self {
        AttributeStore {
            inner: RwLock::new(Inner {
                by_id: Vec::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    /// Returns the attribute named `name`, creating it with `kind` and
    /// `properties` if it does not already exist.
    ///
    /// A second declaration of an existing name returns the first
    /// declaration's record unchanged; `kind`/`properties` are ignored and
    /// not validated against the original declaration. A mismatch is
    /// logged at `warn` so the ambiguity is at least observable (see
    /// DESIGN.md, Open Question 1).
    pub fn create(&self, name: &str, kind: AttributeType, properties: AttributeProperties) -> Attribute {
        {
            let guard = self.inner.read().expect("attribute store lock poisoned");
            if let Some(&id) = guard.by_name.get(name) {
                let existing = guard.by_id[id as usize].clone();
                if existing.kind != kind || existing.properties != properties {
                    tracing::warn!(
                        attribute = name,
                        "re-declared with a different type or property set; keeping the original"
                    );
                }
                return existing;
            }
        }
        let mut guard = self.inner.write().expect("attribute store lock poisoned");
        // Re-check under the write lock: another thread may have raced us.
        if let Some(&id) = guard.by_name.get(name) {
            return guard.by_id[id as usize].clone();
        }
        let id = guard.by_id.len() as u32;
        let attribute = Attribute {
            id,
            name: name.to_string(),
            kind,
            properties,
        };
        guard.by_id.push(attribute.clone());
        guard.by_name.insert(name.to_string(), id);
        tracing::trace!(attribute = name, id, "created attribute");
        attribute
    }

    /// Looks up an attribute by id; `Attribute::invalid()` on miss.
    pub fn get_by_id(&self, id: u32) -> Attribute {
        let guard = self.inner.read().expect("attribute store lock poisoned");
        guard
            .by_id
            .get(id as usize)
            .cloned()
            .unwrap_or_else(Attribute::invalid)
    }

    /// Looks up an attribute by name; `Attribute::invalid()` on miss.
    pub fn get_by_name(&self, name: &str) -> Attribute {
        let guard = self.inner.read().expect("attribute store lock poisoned");
        guard
            .by_name
            .get(name)
            .and_then(|&id| guard.by_id.get(id as usize).cloned())
            .unwrap_or_else(Attribute::invalid)
    }

    /// Streams every declared attribute, in id order, to `sink`.
    pub fn write(&self, sink: &mut dyn AttributeSink) {
        let guard = self.inner.read().expect("attribute store lock poisoned");
        for attribute in &guard.by_id {
            sink.write_attribute(
                attribute.id,
                &attribute.name,
                attribute.kind,
                attribute.properties,
            );
        }
    }
}
