//! Signal-safe annotation runtime for performance instrumentation tools.
//!
//! Call sites push and pop `(attribute, value)` pairs onto a per-thread
//! active path ([`Engine::begin`]/[`Engine::set`]/[`Engine::end`]); a
//! sampler elsewhere reads the current path ([`Engine::get_context`]) and
//! decodes it into typed records ([`Engine::unpack`]) without ever taking
//! a lock a signal handler cannot safely wait on. Distinct values are
//! interned once into a shared context trie, so two call sites with the
//! same active path share the same node ids.

pub mod attribute;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod node;
pub mod pool;
pub mod record;
pub mod sigsafe_lock;
pub mod sink;

pub use attribute::{Attribute, AttributeProperties, AttributeStore, AttributeType};
pub use config::EngineConfig;
pub use context::Context;
pub use engine::{instance, try_instance, Engine, NodeView};
pub use error::{AnnotationError, Result};
pub use node::{Node, NodeStore};
pub use record::{Record, RecordValue};
pub use sink::{AttributeSink, NodeSink, TextSink};
