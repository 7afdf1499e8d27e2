//! Snapshot buffer decoding: projecting a flat `u64[]` produced by
//! [`crate::context::Context::get_context`] back into typed
//! `(attribute, value)` records.

use crate::attribute::{Attribute, AttributeStore};
use crate::node::{NodeStore, INV_ID};

/// One decoded step of a reconstructed active path.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub attribute: Attribute,
    pub value: RecordValue,
}

/// The decoded payload of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    /// An inline 64-bit value, from a `STORE_AS_VALUE` attribute.
    Immediate(u64),
    /// The raw value bytes of one node on the reconstructed path.
    Bytes(Vec<u8>),
}

/// Decodes `buf` (a flat `[attribute_id, payload, attribute_id, payload,
/// ...]` sequence) into an ordered list of typed records.
///
/// For a `STORE_AS_VALUE` attribute the payload decodes to one immediate
/// record. Otherwise the payload is a leaf node id: this walks the node's
/// parent chain, emitting one record per ancestor with a non-invalid
/// attribute, from the leaf up to (but not including) the root. A
/// never-nested attribute yields exactly one record; an attribute with an
/// active nested `begin` (no intervening `end`) reconstructs the whole
/// stack of frames on the way up.
pub fn unpack(buf: &[u64], attributes: &AttributeStore, nodes: &NodeStore) -> Vec<Record> {
    let mut records = Vec::new();
    let mut i = 0;
    while i + 1 < buf.len() {
        let attribute_id = buf[i] as u32;
        let payload = buf[i + 1];
        i += 2;

        let attribute = attributes.get_by_id(attribute_id);
        if !attribute.is_valid() {
            continue;
        }

        if attribute.store_as_value() {
            records.push(Record {
                attribute,
                value: RecordValue::Immediate(payload),
            });
            continue;
        }

        let mut cursor = nodes.get(payload as u32);
        while let Some(node) = cursor {
            if node.attribute_id() != INV_ID {
                let node_attribute = attributes.get_by_id(node.attribute_id());
                records.push(Record {
                    attribute: node_attribute,
                    value: RecordValue::Bytes(node.value().to_vec()),
                });
            }
            cursor = node.parent().and_then(|id| nodes.get(id));
        }
    }
    records
}
