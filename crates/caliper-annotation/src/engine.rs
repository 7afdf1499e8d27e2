//! The top-level annotation engine: attribute registry, context trie, and
//! per-environment active-path tables, composed behind the public
//! `begin`/`end`/`set`/`get`/`unpack`/`write` surface.

use std::cell::UnsafeCell;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::attribute::{Attribute, AttributeProperties, AttributeStore, AttributeType};
use crate::config::EngineConfig;
use crate::context::{Context, Entry};
use crate::error::{AnnotationError, Result};
use crate::node::{Node, NodeStore};
use crate::record::{self, Record};
use crate::sigsafe_lock::{ReadGuard, SigsafeRWLock};
use crate::sink::{AttributeSink, NodeSink};

/// The process-wide annotation engine.
///
/// Owns the attribute registry, the node tree (and its memory pool), and
/// the per-environment context tables. An `Engine` is cheap to construct
/// in isolation for tests (see `Engine::new`); production code normally
/// reaches it through [`instance`]/[`try_instance`] instead.
pub struct Engine {
    attributes: AttributeStore,
    tree_lock: SigsafeRWLock,
    nodes: UnsafeCell<NodeStore>,
    context: Context,
}

// SAFETY: `nodes` is only ever read through `&*nodes.get()` while holding
// `tree_lock` for reading, and only ever written through `&mut
// *nodes.get()` while holding `tree_lock` for writing. That discipline is
// exactly what a `RwLock<NodeStore>` would enforce for us; we hand-roll it
// here because `SigsafeRWLock` (unlike `std::sync::RwLock`) must stay
// signal-reentrant, which rules out wrapping a standard lock type.
unsafe impl Sync for Engine {}

impl Engine {
    /// Builds a fresh, standalone engine. Tests should prefer this over
    /// touching the process singleton.
    pub fn new(config: EngineConfig) -> Self {
        let config = config.normalized();
        Engine {
            attributes: AttributeStore::new(),
            tree_lock: SigsafeRWLock::new(),
            nodes: UnsafeCell::new(NodeStore::new(config.initial_slab_size, config.node_capacity)),
            context: Context::new(config.environment_capacity),
        }
    }

    /// Alias for [`Engine::new`], for call sites that read more naturally
    /// as "build with this config" than "construct a new one".
    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(config)
    }

    fn nodes_read(&self) -> (ReadGuard<'_>, &NodeStore) {
        let guard = self.tree_lock.read();
        // SAFETY: `guard` holds the read lock for as long as the returned
        // reference is alive, and no writer can run concurrently with any
        // outstanding reader (`SigsafeRWLock::wlock` waits for the reader
        // count to reach zero).
        let nodes = unsafe { &*self.nodes.get() };
        (guard, nodes)
    }

    fn with_nodes_write<T>(&self, f: impl FnOnce(&mut NodeStore) -> T) -> T {
        let _guard = self.tree_lock.write();
        // SAFETY: `_guard` holds the exclusive write lock for the duration
        // of `f`, and `SigsafeRWLock::wlock` does not return until every
        // prior reader has released, so no other reference to `NodeStore`
        // can be alive concurrently with this `&mut`.
        let nodes = unsafe { &mut *self.nodes.get() };
        f(nodes)
    }

    /// The core exposes a single implicit environment; callers that want
    /// per-thread scopes should `clone_environment` from it.
    pub fn current_environment(&self) -> u32 {
        0
    }

    /// Creates a new environment seeded with a copy of `source`'s entries.
    pub fn clone_environment(&self, source: u32) -> u32 {
        self.context.clone_environment(source)
    }

    pub fn context_size(&self, env: u32) -> usize {
        self.context.context_size(env)
    }

    /// Serializes `env`'s active entries into `buf`, returning the number
    /// of `(key, payload)` pairs written.
    pub fn get_context(&self, env: u32, buf: &mut [u64]) -> usize {
        self.context.get_context(env, buf)
    }

    /// Declares (or looks up) an attribute. See
    /// [`AttributeStore::create`] for re-declaration semantics.
    pub fn create_attribute(&self, name: &str, kind: AttributeType, properties: AttributeProperties) -> Attribute {
        self.attributes.create(name, kind, properties)
    }

    pub fn get_attribute_by_id(&self, id: u32) -> Attribute {
        self.attributes.get_by_id(id)
    }

    pub fn get_attribute_by_name(&self, name: &str) -> Attribute {
        self.attributes.get_by_name(name)
    }

    /// Signal-safe: returns the node at `id`, or `None` if `id` is out of
    /// range. Never acquires the write lock.
    pub fn get(&self, node_id: u32) -> Option<NodeView<'_>> {
        let (guard, nodes) = self.nodes_read();
        nodes.get(node_id).map(|node| NodeView { _guard: guard, node })
    }

    /// Pushes `value` as the active value of `attribute`, nesting under
    /// whatever value was already active for it (if any).
    ///
    /// A `STORE_AS_VALUE` attribute with an 8-byte value takes the inline
    /// fast path; everything else interns `value` as a node under the
    /// attribute's current leaf (or the root, if this is the attribute's
    /// first `begin`).
    pub fn begin(&self, env: u32, attribute: &Attribute, value: &[u8]) -> Result<()> {
        if !attribute.is_valid() {
            return Err(AnnotationError::Invalid("unknown attribute".to_string()));
        }
        if attribute.store_as_value() && value.len() == 8 {
            let v = u64::from_le_bytes(value.try_into().expect("checked len == 8"));
            self.context.set(env, attribute.id(), v, attribute.is_global());
            return Ok(());
        }

        let parent = match self.context.get_entry(env, attribute.id()) {
            Some(Entry::NodeRef(id)) => id,
            _ => {
                let (_guard, nodes) = self.nodes_read();
                nodes.root_id()
            }
        };
        let node_id = self.find_or_create_child(parent, attribute.id(), value);
        self.context.set_node_ref(env, attribute.id(), node_id, attribute.is_global());
        Ok(())
    }

    /// Replaces the innermost value of `attribute` on the active path
    /// without pushing a new nesting level: `begin(A, v1); set(A, v2);
    /// end(A)` leaves the active path exactly as it was before `begin`.
    pub fn set(&self, env: u32, attribute: &Attribute, value: &[u8]) -> Result<()> {
        if !attribute.is_valid() {
            return Err(AnnotationError::Invalid("unknown attribute".to_string()));
        }
        if attribute.store_as_value() && value.len() == 8 {
            let v = u64::from_le_bytes(value.try_into().expect("checked len == 8"));
            self.context.set(env, attribute.id(), v, attribute.is_global());
            return Ok(());
        }

        let parent = match self.context.get_entry(env, attribute.id()) {
            Some(Entry::NodeRef(id)) => {
                let (_guard, nodes) = self.nodes_read();
                nodes.get(id).and_then(Node::parent).unwrap_or_else(|| nodes.root_id())
            }
            _ => {
                let (_guard, nodes) = self.nodes_read();
                nodes.root_id()
            }
        };
        let node_id = self.find_or_create_child(parent, attribute.id(), value);
        self.context.set_node_ref(env, attribute.id(), node_id, attribute.is_global());
        Ok(())
    }

    /// Pops the innermost value of `attribute` off the active path,
    /// restoring whatever was active before the matching `begin`/`set`.
    ///
    /// `end` can unwind past unrelated nested attributes: it walks up from
    /// the current leaf until it finds a node whose attribute matches, so
    /// `begin(A); begin(B); end(A)` is well-defined even though `B`'s
    /// frame sits between `A`'s two frames.
    ///
    /// Known sharp edge (see DESIGN.md): if `attribute` is `GLOBAL`, the
    /// restored entry is written back without the global flag, since by
    /// this point `end` no longer knows whether the popped leaf was
    /// originally written globally.
    pub fn end(&self, env: u32, attribute: &Attribute) -> Result<()> {
        if !attribute.is_valid() {
            return Err(AnnotationError::Invalid("unknown attribute".to_string()));
        }
        if attribute.store_as_value() {
            self.context.unset(env, attribute.id());
            return Ok(());
        }

        let leaf = match self.context.get_entry(env, attribute.id()) {
            Some(Entry::NodeRef(id)) => id,
            _ => return Err(AnnotationError::Invalid(format!("`{}` was never begun", attribute.name()))),
        };

        let (_guard, nodes) = self.nodes_read();
        let mut cursor = nodes.get(leaf).ok_or_else(|| AnnotationError::Invalid("dangling leaf node".to_string()))?;
        while cursor.attribute_id() != attribute.id() {
            match cursor.parent().and_then(|id| nodes.get(id)) {
                Some(parent) => cursor = parent,
                None => return Err(AnnotationError::Invalid(format!("no active frame for `{}`", attribute.name()))),
            }
        }
        let popped = cursor.parent();
        let root = nodes.root_id();
        drop(_guard);

        match popped {
            None => self.context.unset(env, attribute.id()),
            Some(id) if id == root => self.context.unset(env, attribute.id()),
            Some(id) => self.context.set_node_ref(env, attribute.id(), id, false),
        }
        Ok(())
    }

    fn root_id(&self) -> u32 {
        let (_guard, nodes) = self.nodes_read();
        nodes.root_id()
    }

    fn find_or_create_child(&self, parent: u32, attribute_id: u32, value: &[u8]) -> u32 {
        {
            let (_guard, nodes) = self.nodes_read();
            if let Some(existing) = nodes.find_child(parent, attribute_id, value) {
                return existing;
            }
        }
        self.with_nodes_write(|nodes| {
            // Re-check: another thread may have created the same child
            // while we were waiting for the write lock.
            if let Some(existing) = nodes.find_child(parent, attribute_id, value) {
                return existing;
            }
            let child = nodes.create_node(attribute_id, value);
            nodes.append_child(parent, child);
            child
        })
    }

    /// Decodes a snapshot buffer (as produced by `get_context`) into typed
    /// records. Takes only the read lock.
    pub fn unpack(&self, buf: &[u64]) -> Vec<Record> {
        let (_guard, nodes) = self.nodes_read();
        record::unpack(buf, &self.attributes, nodes)
    }

    /// Streams every node in the tree, in id order, to `sink`.
    pub fn write_nodes(&self, sink: &mut dyn NodeSink) {
        let (_guard, nodes) = self.nodes_read();
        let mut id = 0u32;
        while let Some(node) = nodes.get(id) {
            let attribute = self.attributes.get_by_id(node.attribute_id());
            sink.write_node(node.id(), node.parent(), node.attribute_id(), node.value(), &attribute);
            id += 1;
        }
    }

    /// Streams every declared attribute, in id order, to `sink`.
    pub fn write_attributes(&self, sink: &mut dyn AttributeSink) {
        self.attributes.write(sink);
    }
}

/// A read-locked view of one node, returned by [`Engine::get`]. Dropping
/// it releases the read lock.
pub struct NodeView<'a> {
    _guard: ReadGuard<'a>,
    node: &'a Node,
}

impl std::ops::Deref for NodeView<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.node
    }
}

static INSTANCE: OnceCell<Arc<Engine>> = OnceCell::new();

/// Returns the process-wide engine, constructing it on first call under a
/// one-shot lock.
pub fn instance() -> Arc<Engine> {
    INSTANCE
        .get_or_init(|| Arc::new(Engine::new(EngineConfig::default())))
        .clone()
}

/// Signal-safe accessor: returns the singleton if it has already been
/// constructed, or `None` otherwise, without ever blocking. Implemented as
/// a single atomic load by [`once_cell::sync::OnceCell::get`], so a signal
/// handler can call this safely even while another thread is in the middle
/// of first-time construction.
pub fn try_instance() -> Option<Arc<Engine>> {
    INSTANCE.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeType;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default())
    }

    #[test]
    fn scenario_a_single_begin() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        engine.begin(0, &function, b"foo").unwrap();
        assert_eq!(engine.context_size(0), 1);
        let mut buf = [0u64; 2];
        engine.get_context(0, &mut buf);
        let node = engine.get(buf[1] as u32).unwrap();
        assert_eq!(node.value(), b"foo");
        assert_eq!(node.parent(), Some(engine.root_id()));
    }

    #[test]
    fn scenario_b_nested_begin_and_end() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        engine.begin(0, &function, b"foo").unwrap();
        engine.begin(0, &function, b"bar").unwrap();

        let leaf_before = engine.context.get(0, function.id()).unwrap() as u32;
        assert_eq!(engine.get(leaf_before).unwrap().value(), b"bar");
        let foo_id = engine.get(leaf_before).unwrap().parent().unwrap();
        assert_eq!(engine.get(foo_id).unwrap().value(), b"foo");

        engine.end(0, &function).unwrap();
        let restored = engine.context.get(0, function.id()).unwrap() as u32;
        assert_eq!(restored, foo_id);

        engine.end(0, &function).unwrap();
        assert_eq!(engine.context_size(0), 0);
    }

    #[test]
    fn scenario_c_mixed_node_and_immediate_attributes() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        let loop_attr = engine.create_attribute("loop", AttributeType::Int, AttributeProperties::STORE_AS_VALUE);

        engine.begin(0, &function, b"main").unwrap();
        engine.begin(0, &loop_attr, &42u64.to_le_bytes()).unwrap();
        assert_eq!(engine.context_size(0), 2);

        engine.end(0, &loop_attr).unwrap();
        assert_eq!(engine.context_size(0), 1);
        assert!(engine.context.get(0, function.id()).is_some());
    }

    #[test]
    fn scenario_d_set_replaces_innermost_value() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        engine.begin(0, &function, b"main").unwrap();
        engine.begin(0, &function, b"inner").unwrap();
        engine.set(0, &function, b"other").unwrap();

        let active = engine.context.get(0, function.id()).unwrap() as u32;
        let active_node = engine.get(active).unwrap();
        assert_eq!(active_node.value(), b"other");
        let main_id = active_node.parent().unwrap();
        assert_eq!(engine.get(main_id).unwrap().value(), b"main");

        // "inner" still exists in the tree but is off the active path.
        let inner_id = {
            let (_g, nodes) = engine.nodes_read();
            nodes.find_child(main_id, function.id(), b"inner").unwrap()
        };
        assert_ne!(inner_id, active);
    }

    #[test]
    fn scenario_e_shared_interning_across_cloned_environments() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        let env1 = engine.clone_environment(0);
        let env2 = engine.clone_environment(0);

        engine.begin(env1, &function, b"f").unwrap();
        engine.begin(env2, &function, b"f").unwrap();

        let leaf1 = engine.context.get(env1, function.id()).unwrap();
        let leaf2 = engine.context.get(env2, function.id()).unwrap();
        assert_eq!(leaf1, leaf2);
    }

    #[test]
    fn scenario_f_end_without_begin_is_einv_and_noop() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        let before = engine.context_size(0);
        let result = engine.end(0, &function);
        assert!(result.is_err());
        assert_eq!(engine.context_size(0), before);
    }

    #[test]
    fn end_unwinds_past_an_unrelated_nested_attribute() {
        let engine = engine();
        let a = engine.create_attribute("a", AttributeType::String, AttributeProperties::empty());
        let b = engine.create_attribute("b", AttributeType::String, AttributeProperties::empty());
        engine.begin(0, &a, b"a1").unwrap();
        engine.begin(0, &b, b"b1").unwrap();
        engine.end(0, &a).unwrap();
        assert!(engine.context.get(0, a.id()).is_none());
        assert!(engine.context.get(0, b.id()).is_some());
    }

    #[test]
    fn duplicate_begin_with_identical_value_dedups_to_one_child() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        engine.begin(0, &function, b"foo").unwrap();
        engine.end(0, &function).unwrap();
        engine.begin(0, &function, b"foo").unwrap();
        let leaf = engine.context.get(0, function.id()).unwrap() as u32;

        let (_g, nodes) = engine.nodes_read();
        assert_eq!(nodes.find_child(nodes.root_id(), function.id(), b"foo"), Some(leaf));
        assert_eq!(nodes.len(), 2); // root + one "foo" node, never two.
    }

    #[test]
    fn zero_length_values_are_legal_and_distinct_from_absence() {
        let engine = engine();
        let marker = engine.create_attribute("marker", AttributeType::String, AttributeProperties::empty());
        engine.begin(0, &marker, b"").unwrap();
        assert_eq!(engine.context_size(0), 1);
        engine.end(0, &marker).unwrap();
        assert_eq!(engine.context_size(0), 0);
    }

    #[test]
    fn unpack_round_trips_get_context() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        let loop_attr = engine.create_attribute("loop", AttributeType::Int, AttributeProperties::STORE_AS_VALUE);
        engine.begin(0, &function, b"main").unwrap();
        engine.begin(0, &loop_attr, &7u64.to_le_bytes()).unwrap();

        let mut buf = [0u64; 4];
        let written = engine.get_context(0, &mut buf);
        let records = engine.unpack(&buf[..written * 2]);

        assert!(records.iter().any(|r| r.attribute == function));
        assert!(records.iter().any(|r| r.attribute == loop_attr));
    }

    #[test]
    fn signal_safe_reads_do_not_deadlock_while_reentered() {
        let engine = engine();
        let function = engine.create_attribute("function", AttributeType::String, AttributeProperties::empty());
        engine.begin(0, &function, b"foo").unwrap();
        let node_id = engine.context.get(0, function.id()).unwrap() as u32;

        // Hold a read view open (as `get_context` would while being read
        // mid-sample), then simulate a signal handler on the same thread
        // re-entering via `get`/`try_instance`.
        let outer = engine.get(node_id).unwrap();
        let inner = engine.get(engine.root_id()).expect("reentrant get must not deadlock");
        assert!(inner.is_root());
        drop(outer);
    }
}
