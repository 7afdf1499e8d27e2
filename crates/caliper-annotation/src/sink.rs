//! Trait boundaries to the excluded serialization collaborators.
//!
//! `write_nodes`/`write_attributes` are generic over these traits; concrete
//! on-disk formats (and MPI-aware variants of them) are an external
//! front end's concern. This module only ships one in-memory reference
//! implementation of each, used by this crate's own tests and as a usage
//! example for front ends wiring up their own sink.

use crate::attribute::{Attribute, AttributeProperties, AttributeType};

/// Receives one call per node as [`crate::engine::Engine::write_nodes`]
/// walks the dense node vector in id order.
pub trait NodeSink {
    fn write_node(&mut self, id: u32, parent_id: Option<u32>, attribute_id: u32, value: &[u8], attribute: &Attribute);
}

/// Receives one call per attribute as
/// [`crate::engine::Engine::write_attributes`] walks the registry in id
/// order.
pub trait AttributeSink {
    fn write_attribute(&mut self, id: u32, name: &str, kind: AttributeType, properties: AttributeProperties);
}

/// A minimal, human-readable reference sink used by this crate's own
/// integration tests and as a usage example for front ends that have not
/// yet picked a concrete wire format.
#[derive(Debug, Default)]
pub struct TextSink {
    pub lines: Vec<String>,
}

impl NodeSink for TextSink {
    fn write_node(&mut self, id: u32, parent_id: Option<u32>, attribute_id: u32, value: &[u8], attribute: &Attribute) {
        self.lines.push(format!(
            "node id={id} parent={parent:?} attribute={attribute_id}({name}) value={value:?}",
            id = id,
            parent = parent_id,
            attribute_id = attribute_id,
            name = attribute.name(),
            value = value,
        ));
    }
}

impl AttributeSink for TextSink {
    fn write_attribute(&mut self, id: u32, name: &str, kind: AttributeType, properties: AttributeProperties) {
        self.lines.push(format!(
            "attribute id={id} name={name} kind={kind:?} properties={properties:?}"
        ));
    }
}
