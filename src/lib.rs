//! osmgrid — spatial + tag queries over a static OpenStreetMap snapshot.
//!
//! The engine ingests an OSM-style snapshot and builds two cooperating
//! on-disk indices: a tag dictionary mapping tag strings to dense integer
//! ids, and a world-wide grid of append-only cell files holding encoded
//! features. Queries combine bounding-box selection, object-type selection,
//! tag predicates, and context-aware sub-statements ("nodes that are members
//! of a way tagged building=*"); results come back as decoded features ready
//! for GeoJSON serialization.
//!
//! Both indices are read-only after import and shared freely across scan
//! workers.

pub mod error;
pub mod geojson;
pub mod geometry;
pub mod grid;
pub mod import;
pub mod model;
pub mod query;
pub mod server;
pub mod tag_index;

use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

pub use error::{OsmGridError, Result};
pub use geometry::BoundingBox;
pub use grid::GridIndex;
pub use model::{Feature, ObjectType};
pub use tag_index::TagIndex;

/// Build- and scan-time knobs. Cell sizes are fixed when the index is built
/// and persisted next to it; the remaining fields are per-process.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Cell width in degrees of longitude.
    pub cell_width: f64,
    /// Cell height in degrees of latitude.
    pub cell_height: f64,
    /// Max nodes per import sub-extent.
    pub node_budget: u64,
    /// Worker threads per bbox scan.
    pub scan_workers: usize,
    /// Re-check decoded features against the dictionary.
    pub check_validity: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            cell_width: 0.1,
            cell_height: 0.1,
            node_budget: 10_000_000,
            scan_workers: 3,
            check_validity: false,
        }
    }
}

/// Handle over a built index: the loaded dictionary plus the grid. This is
/// what the CLI and the HTTP server hold; one handle serves any number of
/// sequential queries (each query owns its own sub-statement caches).
pub struct OsmIndex {
    tags: Arc<TagIndex>,
    grid: GridIndex,
}

impl OsmIndex {
    pub fn open(base_dir: &Path, options: IndexOptions) -> Result<Self> {
        let dict_path = base_dir.join(tag_index::TAG_INDEX_FILE);
        let file = match File::open(&dict_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(OsmGridError::InvalidFormat(format!(
                    "no tag dictionary at {}; run an import first",
                    dict_path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let tags = Arc::new(TagIndex::load(BufReader::new(file))?);
        let grid = GridIndex::open(base_dir, &options, Arc::clone(&tags))?;
        Ok(Self { tags, grid })
    }

    /// Parse and execute a query, returning deduplicated features.
    pub fn query(&self, text: &str) -> Result<Vec<Feature>> {
        let mut statements = query::parse_query(text, &self.tags)?;
        let ctx = query::QueryContext {
            grid: &self.grid,
            tags: &self.tags,
        };
        query::execute(&mut statements, &ctx)
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    pub fn grid(&self) -> &GridIndex {
        &self.grid
    }
}
