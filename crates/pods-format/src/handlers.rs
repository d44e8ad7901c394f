use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{FormatError, Value};

/// Transforms a decoded tagged representation into a host value.
pub type ReadHandler = Arc<dyn Fn(Value) -> Result<Value, FormatError> + Send + Sync>;

/// Produces a `(tag, representation)` pair for a tagged host value.
pub type WriteHandler =
    Arc<dyn Fn(&Value) -> Result<(String, Value), FormatError> + Send + Sync>;

/// Per-pod handler tables. Read handlers key on the wire tag; write
/// handlers key on the tag of a [`Value::Tagged`] host value. Runtime
/// registrations shadow reader functions a pod supplied at describe time.
#[derive(Default, Clone)]
pub struct Handlers {
    pub edn_read: BTreeMap<String, ReadHandler>,
    pub edn_write: BTreeMap<String, WriteHandler>,
    pub transit_read: BTreeMap<String, ReadHandler>,
    pub transit_write: BTreeMap<String, WriteHandler>,
    pub transit_default_write: Option<WriteHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Handlers::default()
    }

    pub(crate) fn edn_read_for(&self, tag: &str) -> Option<&ReadHandler> {
        self.edn_read.get(tag)
    }

    pub(crate) fn transit_read_for(&self, tag: &str) -> Option<&ReadHandler> {
        self.transit_read.get(tag)
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("edn_read", &self.edn_read.keys().collect::<Vec<_>>())
            .field("edn_write", &self.edn_write.keys().collect::<Vec<_>>())
            .field("transit_read", &self.transit_read.keys().collect::<Vec<_>>())
            .field("transit_write", &self.transit_write.keys().collect::<Vec<_>>())
            .field(
                "transit_default_write",
                &self.transit_default_write.is_some(),
            )
            .finish()
    }
}
