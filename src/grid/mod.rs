//! Grid index: a world-wide regular grid of append-only cell files.
//!
//! The world is tiled into cells of fixed angular size chosen at build time.
//! Nodes live in the cell containing their point; ways are duplicated into
//! every cell a member node falls into, which keeps each cell self-contained
//! for geometry checks; relations live in one global file.
//!
//! Rectangle scans fan out over cell columns: the column range of the query
//! rectangle is split into contiguous shards, one worker thread per shard,
//! and workers push batched features into a bounded channel drained by the
//! consumer. Cell files are read-only after import, so workers share nothing
//! but the channel.

pub mod cell;
pub mod extent;

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OsmGridError, Result};
use crate::geometry::BoundingBox;
use crate::model::{Feature, ObjectType, RelationFeature, WayMember};
use crate::tag_index::TagIndex;
use crate::IndexOptions;

use extent::CellExtent;

/// Batches per in-flight channel slot; keeps slow consumers from buffering
/// an unbounded scan.
const BATCH_CHANNEL_CAPACITY: usize = 8;

// ── Cell math ──────────────────────────────────────────────────────

/// Integer cell coordinates: `(⌊lon/CW⌋, ⌊lat/CH⌋)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellIndex {
    pub x: i32,
    pub y: i32,
}

/// Cell containing a coordinate. Flooring rounds toward −∞ so negative
/// coordinates land in the right cell.
pub fn cell_of(lon: f64, lat: f64, cell_width: f64, cell_height: f64) -> CellIndex {
    CellIndex {
        x: (lon / cell_width).floor() as i32,
        y: (lat / cell_height).floor() as i32,
    }
}

// ── Persisted grid parameters ──────────────────────────────────────

/// Cell sizes are fixed at build time; queries must use the same values, so
/// the importer persists them next to the cell files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridMeta {
    pub cell_width: f64,
    pub cell_height: f64,
}

impl GridMeta {
    fn path(base: &Path) -> PathBuf {
        base.join(cell::GRID_DIR).join("meta.json")
    }

    pub fn save(&self, base: &Path) -> Result<()> {
        let path = Self::path(base);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(base: &Path) -> Result<Option<Self>> {
        let file = match File::open(Self::path(base)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_reader(BufReader::new(file))?))
    }
}

// ── Feature streams ────────────────────────────────────────────────

/// One cell's worth of decoded features, in write order.
#[derive(Debug)]
pub struct FeatureBatch {
    pub cell: CellIndex,
    pub features: Vec<Feature>,
}

/// Stream of batches produced by scan workers. Dropping the stream stops the
/// workers promptly: their next send fails and they exit.
pub struct FeatureStream {
    rx: Receiver<Result<FeatureBatch>>,
}

impl Iterator for FeatureStream {
    type Item = Result<FeatureBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl FeatureStream {
    /// Drain the stream into a flat feature list, surfacing the first error.
    pub fn collect_features(self) -> Result<Vec<Feature>> {
        let mut features = Vec::new();
        for batch in self {
            features.extend(batch?.features);
        }
        Ok(features)
    }
}

/// Outcome of a full-index validity sweep.
#[derive(Debug, Clone, Copy)]
pub struct ValidationReport {
    pub files: usize,
    pub features: u64,
}

// ── Grid index ─────────────────────────────────────────────────────

/// Read-only handle over a built grid index.
pub struct GridIndex {
    base_dir: PathBuf,
    cell_width: f64,
    cell_height: f64,
    scan_workers: usize,
    tags: Arc<TagIndex>,
    check_validity: bool,
}

impl GridIndex {
    /// Open a built index. Build-time cell sizes persisted by the importer
    /// take precedence over the caller's options.
    pub fn open(base_dir: &Path, options: &IndexOptions, tags: Arc<TagIndex>) -> Result<Self> {
        let meta = GridMeta::load(base_dir)?;
        let (cell_width, cell_height) = match meta {
            Some(m) => (m.cell_width, m.cell_height),
            None => (options.cell_width, options.cell_height),
        };
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            cell_width,
            cell_height,
            scan_workers: options.scan_workers.max(1),
            tags,
            check_validity: options.check_validity,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn cell_at(&self, lon: f64, lat: f64) -> CellIndex {
        cell_of(lon, lat, self.cell_width, self.cell_height)
    }

    /// Inclusive cell rectangle spanning a bbox.
    pub fn extent_for_bbox(&self, bbox: &BoundingBox) -> CellExtent {
        CellExtent {
            min: self.cell_at(bbox.min_lon, bbox.min_lat),
            max: self.cell_at(bbox.max_lon, bbox.max_lat),
        }
    }

    /// Cells touched by a feature's own geometry: the containing cell for a
    /// node, the member-node cells for a way. Relations store member ids
    /// without coordinates, so no cell set can be derived from one.
    pub fn feature_cells(&self, feature: &Feature) -> Result<BTreeSet<CellIndex>> {
        match feature {
            Feature::Node(n) => Ok([self.cell_at(n.lon as f64, n.lat as f64)].into()),
            Feature::Way(w) => Ok(w
                .members
                .iter()
                .map(|m| self.cell_at(m.lon as f64, m.lat as f64))
                .collect()),
            Feature::Relation(r) => Err(OsmGridError::Unsupported(format!(
                "cannot derive member cells for relation {}: members carry no coordinates",
                r.id
            ))),
        }
    }

    // ── Scans ──────────────────────────────────────────────────────

    /// Stream every feature of `object_type` in the cells spanned by `bbox`.
    ///
    /// Cell columns are split into contiguous worker shards; within a shard
    /// cells are walked row-major. Feature order within a cell is write
    /// order; order across cells is unspecified.
    pub fn query_bbox(&self, bbox: &BoundingBox, object_type: ObjectType) -> FeatureStream {
        if object_type == ObjectType::Relation {
            return self.relation_stream();
        }
        let extent = self.extent_for_bbox(bbox);
        let shards = column_shards(extent.min.x, extent.max.x, self.scan_workers);
        debug!(
            ?extent,
            shards = shards.len(),
            "bbox scan over {} cells",
            extent.cell_count()
        );

        let (tx, rx) = bounded(BATCH_CHANNEL_CAPACITY);
        for (start_x, end_x) in shards {
            let cells: Vec<CellIndex> = (extent.min.y..=extent.max.y)
                .flat_map(|y| (start_x..=end_x).map(move |x| CellIndex { x, y }))
                .collect();
            self.spawn_worker(object_type, cells, None, tx.clone());
        }
        FeatureStream { rx }
    }

    /// Stream features of `object_type` from an explicit cell list. Used by
    /// context-aware sub-statements.
    pub fn query_cells(&self, cells: Vec<CellIndex>, object_type: ObjectType) -> FeatureStream {
        if object_type == ObjectType::Relation {
            return self.relation_stream();
        }
        let (tx, rx) = bounded(BATCH_CHANNEL_CAPACITY);
        self.spawn_worker(object_type, cells, None, tx);
        FeatureStream { rx }
    }

    /// Stream the node features for a member list: reads the cells the
    /// member coordinates fall into and filters to the requested ids.
    pub fn query_member_nodes(&self, members: &[WayMember]) -> FeatureStream {
        let cells: BTreeSet<CellIndex> = members
            .iter()
            .map(|m| self.cell_at(m.lon as f64, m.lat as f64))
            .collect();
        let ids: HashSet<u64> = members.iter().map(|m| m.id).collect();
        let (tx, rx) = bounded(BATCH_CHANNEL_CAPACITY);
        self.spawn_worker(
            ObjectType::Node,
            cells.into_iter().collect(),
            Some(Arc::new(ids)),
            tx,
        );
        FeatureStream { rx }
    }

    /// Decode the entire relation file. Relations are not bucketed by cell;
    /// consumers filter by membership or envelope themselves.
    pub fn scan_relations(&self) -> Result<Vec<RelationFeature>> {
        let path = cell::relation_file_path(&self.base_dir);
        let features = cell::read_cell_file(&path, ObjectType::Relation)?;
        let mut relations = Vec::with_capacity(features.len());
        for f in features {
            if self.check_validity {
                if let Some(detail) = cell::check_feature_validity(&f, &self.tags) {
                    return Err(OsmGridError::ValidityViolation { x: 0, y: 0, detail });
                }
            }
            match f {
                Feature::Relation(r) => relations.push(r),
                _ => unreachable!("relation file only holds relations"),
            }
        }
        Ok(relations)
    }

    fn relation_stream(&self) -> FeatureStream {
        let (tx, rx) = bounded(BATCH_CHANNEL_CAPACITY);
        let base = self.base_dir.clone();
        let validity = self.validity_index();
        thread::spawn(move || {
            let path = cell::relation_file_path(&base);
            let result = cell::read_cell_file(&path, ObjectType::Relation).and_then(|features| {
                if let Some(tags) = &validity {
                    for f in &features {
                        if let Some(detail) = cell::check_feature_validity(f, tags) {
                            return Err(OsmGridError::ValidityViolation { x: 0, y: 0, detail });
                        }
                    }
                }
                Ok(features)
            });
            let batch = result.map(|features| FeatureBatch {
                cell: CellIndex { x: 0, y: 0 },
                features,
            });
            let _ = tx.send(batch);
        });
        FeatureStream { rx }
    }

    fn validity_index(&self) -> Option<Arc<TagIndex>> {
        self.check_validity.then(|| Arc::clone(&self.tags))
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Decode every cell file and check each feature against the dictionary.
    /// Files are independent, so the sweep runs in parallel (`None` thread
    /// count = rayon's default); a single file or thread falls back to a
    /// sequential pass.
    pub fn validate_all(&self, thread_count: Option<usize>) -> Result<ValidationReport> {
        use rayon::prelude::*;

        let files = self.list_cell_files()?;
        let check_one = |(object_type, cell_index, path): &(ObjectType, CellIndex, PathBuf)| {
            let features = cell::read_cell_file(path, *object_type)?;
            for f in &features {
                if let Some(detail) = cell::check_feature_validity(f, &self.tags) {
                    return Err(OsmGridError::ValidityViolation {
                        x: cell_index.x,
                        y: cell_index.y,
                        detail,
                    });
                }
            }
            Ok(features.len() as u64)
        };

        let counts: Vec<Result<u64>> = if thread_count == Some(1) || files.len() <= 1 {
            files.iter().map(check_one).collect()
        } else {
            let mut builder = rayon::ThreadPoolBuilder::new();
            if let Some(threads) = thread_count {
                builder = builder.num_threads(threads);
            }
            let pool = builder
                .build()
                .map_err(|e| OsmGridError::Unsupported(format!("rayon pool: {e}")))?;
            pool.install(|| files.par_iter().map(check_one).collect())
        };

        let mut report = ValidationReport {
            files: files.len(),
            features: 0,
        };
        for count in counts {
            report.features += count?;
        }
        Ok(report)
    }

    /// Every cell file on disk, plus the relation file when present.
    fn list_cell_files(&self) -> Result<Vec<(ObjectType, CellIndex, PathBuf)>> {
        let mut files = Vec::new();
        for object_type in [ObjectType::Node, ObjectType::Way] {
            let type_dir = self
                .base_dir
                .join(cell::GRID_DIR)
                .join(object_type.dir_name());
            let columns = match std::fs::read_dir(&type_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for column in columns {
                let column = column?;
                let x: i32 = match column.file_name().to_string_lossy().parse() {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                for entry in std::fs::read_dir(column.path())? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let y: i32 = match name.to_string_lossy().strip_suffix(".cell").and_then(|s| s.parse().ok()) {
                        Some(y) => y,
                        None => continue,
                    };
                    files.push((object_type, CellIndex { x, y }, entry.path()));
                }
            }
        }
        let relation_path = cell::relation_file_path(&self.base_dir);
        if relation_path.exists() {
            files.push((ObjectType::Relation, CellIndex { x: 0, y: 0 }, relation_path));
        }
        files.sort_by(|a, b| (a.0.dir_name(), a.1).cmp(&(b.0.dir_name(), b.1)));
        Ok(files)
    }

    fn spawn_worker(
        &self,
        object_type: ObjectType,
        cells: Vec<CellIndex>,
        id_filter: Option<Arc<HashSet<u64>>>,
        tx: Sender<Result<FeatureBatch>>,
    ) {
        let base = self.base_dir.clone();
        let validity = self.validity_index();
        thread::spawn(move || {
            scan_cells(&base, object_type, &cells, id_filter.as_deref(), validity.as_deref(), &tx);
        });
    }
}

/// Walk a cell list, decoding each file and pushing one batch per non-empty
/// cell. Stops on the first error or when the consumer hangs up.
fn scan_cells(
    base: &Path,
    object_type: ObjectType,
    cells: &[CellIndex],
    id_filter: Option<&HashSet<u64>>,
    validity: Option<&TagIndex>,
    tx: &Sender<Result<FeatureBatch>>,
) {
    for &cell_index in cells {
        let path = cell::cell_file_path(base, object_type, cell_index);
        let mut features = match cell::read_cell_file(&path, object_type) {
            Ok(features) => features,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        if let Some(tags) = validity {
            for f in &features {
                if let Some(detail) = cell::check_feature_validity(f, tags) {
                    let _ = tx.send(Err(OsmGridError::ValidityViolation {
                        x: cell_index.x,
                        y: cell_index.y,
                        detail,
                    }));
                    return;
                }
            }
        }
        if let Some(ids) = id_filter {
            features.retain(|f| ids.contains(&f.id()));
        }
        if features.is_empty() {
            continue;
        }
        let batch = FeatureBatch {
            cell: cell_index,
            features,
        };
        if tx.send(Ok(batch)).is_err() {
            // Consumer dropped the stream; exit promptly.
            return;
        }
    }
}

/// Split an inclusive column range into contiguous worker shards.
///
/// Shard i owns `[min_x + i·stride + (i>0 ? 1 : 0), min_x + (i+1)·stride]`,
/// with the last shard extended to `max_x`; empty shards are dropped. Both
/// ends of every shard are inclusive.
fn column_shards(min_x: i32, max_x: i32, workers: usize) -> Vec<(i32, i32)> {
    let workers = workers.max(1) as i32;
    let stride = (max_x - min_x) / workers;
    let mut shards = Vec::new();
    for i in 0..workers {
        let start = min_x + i * stride + if i > 0 { 1 } else { 0 };
        let end = if i == workers - 1 {
            max_x
        } else {
            min_x + (i + 1) * stride
        };
        if start <= end {
            shards.push((start, end));
        }
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeFeature;
    use crate::tag_index::TagIndexBuilder;

    fn test_tags() -> Arc<TagIndex> {
        let mut b = TagIndexBuilder::new();
        b.insert("a", "1");
        Arc::new(b.finish().unwrap())
    }

    fn open_grid(base: &Path, workers: usize) -> GridIndex {
        let options = IndexOptions {
            scan_workers: workers,
            ..IndexOptions::default()
        };
        GridIndex::open(base, &options, test_tags()).unwrap()
    }

    fn write_node(base: &Path, grid: &GridIndex, id: u64, lon: f32, lat: f32) {
        let node = NodeFeature {
            id,
            lon,
            lat,
            tags: Default::default(),
        };
        let mut buf = Vec::new();
        cell::encode_node(&node, &mut buf).unwrap();
        let mut writers = cell::CellWriterSet::new(base);
        writers
            .append(
                ObjectType::Node,
                grid.cell_at(lon as f64, lat as f64),
                &buf,
            )
            .unwrap();
        writers.finish().unwrap();
    }

    #[test]
    fn test_cell_at_floors_toward_negative_infinity() {
        let dir = tempfile::tempdir().unwrap();
        let grid = open_grid(dir.path(), 1);
        assert_eq!(grid.cell_at(0.05, 0.05), CellIndex { x: 0, y: 0 });
        assert_eq!(grid.cell_at(0.15, 0.05), CellIndex { x: 1, y: 0 });
        assert_eq!(grid.cell_at(-0.05, -0.05), CellIndex { x: -1, y: -1 });
        assert_eq!(grid.cell_at(-0.15, 0.0), CellIndex { x: -2, y: 0 });
    }

    #[test]
    fn test_column_shards_cover_range_inclusively() {
        for (min_x, max_x, workers) in
            [(0, 9, 3), (0, 2, 3), (0, 0, 3), (-5, 5, 3), (0, 6, 3), (0, 100, 7)]
        {
            let shards = column_shards(min_x, max_x, workers);
            let mut covered = Vec::new();
            for &(start, end) in &shards {
                assert!(start <= end);
                covered.extend(start..=end);
            }
            let expected: Vec<i32> = (min_x..=max_x).collect();
            assert_eq!(covered, expected, "range {}..={} w={}", min_x, max_x, workers);
        }
    }

    #[test]
    fn test_bbox_scan_finds_nodes_across_cells() {
        let dir = tempfile::tempdir().unwrap();
        let grid = open_grid(dir.path(), 3);
        write_node(dir.path(), &grid, 1, 0.05, 0.05);
        write_node(dir.path(), &grid, 2, 0.15, 0.05);

        let bbox = BoundingBox::new(0.0, 0.0, 0.2, 0.1);
        let features = grid
            .query_bbox(&bbox, ObjectType::Node)
            .collect_features()
            .unwrap();
        let mut ids: Vec<u64> = features.iter().map(|f| f.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_scan_empty_region_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let grid = open_grid(dir.path(), 3);
        let bbox = BoundingBox::new(10.0, 10.0, 11.0, 11.0);
        let features = grid
            .query_bbox(&bbox, ObjectType::Node)
            .collect_features()
            .unwrap();
        assert!(features.is_empty());
    }

    #[test]
    fn test_member_node_fetch_filters_ids() {
        let dir = tempfile::tempdir().unwrap();
        let grid = open_grid(dir.path(), 1);
        write_node(dir.path(), &grid, 1, 0.05, 0.05);
        write_node(dir.path(), &grid, 2, 0.06, 0.05);

        // Only node 1 requested; node 2 shares the cell but is filtered out.
        let members = [WayMember { id: 1, lon: 0.05, lat: 0.05 }];
        let features = grid.query_member_nodes(&members).collect_features().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id(), 1);
    }

    #[test]
    fn test_meta_round_trip_overrides_options() {
        let dir = tempfile::tempdir().unwrap();
        GridMeta {
            cell_width: 0.5,
            cell_height: 0.25,
        }
        .save(dir.path())
        .unwrap();

        let grid = open_grid(dir.path(), 1); // options say 0.1
        assert_eq!(grid.cell_at(0.4, 0.2), CellIndex { x: 0, y: 0 });
        assert_eq!(grid.cell_at(0.6, 0.3), CellIndex { x: 1, y: 1 });
    }

    #[test]
    fn test_feature_cells_unsupported_for_relations() {
        let dir = tempfile::tempdir().unwrap();
        let grid = open_grid(dir.path(), 1);
        let rel = Feature::Relation(RelationFeature {
            id: 1,
            tags: vec![],
            node_ids: vec![2],
            way_ids: vec![],
            child_relation_ids: vec![],
        });
        assert!(matches!(
            grid.feature_cells(&rel),
            Err(OsmGridError::Unsupported(_))
        ));
    }
}
