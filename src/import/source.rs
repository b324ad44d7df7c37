//! Input object sources.
//!
//! An `ObjectSource` yields the snapshot's raw objects, with way member
//! coordinates already resolved by the decoder. The importer scans a source
//! several times: once for the dictionary/density pass and once per
//! sub-extent, so sources must be re-scannable.

use crate::error::Result;
use crate::model::RawObject;

pub trait ObjectSource {
    /// Stream every object into `sink`, in a stable order across scans.
    /// Errors from the sink abort the scan and propagate.
    fn scan(&mut self, sink: &mut dyn FnMut(RawObject) -> Result<()>) -> Result<()>;
}

/// Source over an in-memory object list. Backs tests and programmatic
/// imports.
pub struct MemorySource {
    objects: Vec<RawObject>,
}

impl MemorySource {
    pub fn new(objects: Vec<RawObject>) -> Self {
        Self { objects }
    }
}

impl ObjectSource for MemorySource {
    fn scan(&mut self, sink: &mut dyn FnMut(RawObject) -> Result<()>) -> Result<()> {
        for obj in &self.objects {
            sink(obj.clone())?;
        }
        Ok(())
    }
}
