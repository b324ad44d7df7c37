//! Two-pass snapshot importer.
//!
//! Pass 1 streams the input once to build the tag dictionary and a per-cell
//! node density map. Pass 2 partitions the input's cell rectangle into
//! budget-bounded sub-extents; for each, it re-scans the input, spills the
//! objects touching the extent into a temporary file, then converts the
//! spill into the final per-cell files. The spill bounds the working set of
//! a conversion slice to roughly one node budget.
//!
//! Ways are appended to every cell a member node falls into, so a bbox query
//! can answer from the intersected cells alone. Relations go to the single
//! global relation file during the first extent's scan.
//!
//! Any I/O error aborts the import; partial files stay on disk and recovery
//! is a re-run (imports into the same directory start clean).

pub mod pbf;
pub mod source;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{OsmGridError, Result};
use crate::grid::cell::{self, CellWriterSet};
use crate::grid::extent::{pack_extents, CellExtent};
use crate::grid::{cell_of, CellIndex, GridMeta};
use crate::model::{
    NodeFeature, ObjectType, RawObject, RelationFeature, WayFeature,
};
use crate::tag_index::{TagIndex, TagIndexBuilder, TAG_INDEX_FILE};
use crate::IndexOptions;

use source::ObjectSource;

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportStats {
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
    pub extents: usize,
    pub cells: usize,
}

pub struct Importer {
    base_dir: PathBuf,
    options: IndexOptions,
}

impl Importer {
    pub fn new(base_dir: &Path, options: IndexOptions) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            options,
        }
    }

    /// Build the tag dictionary and grid index from a source. Replaces any
    /// index previously built in the same directory.
    pub fn run(&self, src: &mut dyn ObjectSource) -> Result<ImportStats> {
        self.reset_output()?;

        let start = Instant::now();
        let (tags, density, bounds, mut stats) = self.pass1(src)?;
        info!(
            nodes = stats.nodes,
            ways = stats.ways,
            relations = stats.relations,
            keys = tags.key_count(),
            "pass 1 finished in {:.2?}",
            start.elapsed()
        );

        let bounds = match bounds {
            Some(b) => b,
            None => {
                info!("input contains no nodes; index is empty");
                return Ok(stats);
            }
        };

        let start = Instant::now();
        let extents = pack_extents(&density, bounds, self.options.node_budget);
        stats.extents = extents.len();
        info!(
            budget = self.options.node_budget,
            "pass 2 over {} sub-extents",
            extents.len()
        );

        for (i, extent) in extents.iter().enumerate() {
            let spill_path = self
                .base_dir
                .join(cell::GRID_DIR)
                .join(format!("extent-{}.tmp", i));
            let spilled = self.spill_extent(src, *extent, i == 0, &spill_path)?;
            let cells = self.convert_extent(&spill_path, *extent, &tags)?;
            stats.cells += cells;
            std::fs::remove_file(&spill_path)?;
            debug!(spilled, cells, "converted sub-extent {} of {:?}", i, extent);
        }
        info!("pass 2 finished in {:.2?}", start.elapsed());
        Ok(stats)
    }

    /// Start clean: a re-import must not append onto a previous index.
    fn reset_output(&self) -> Result<()> {
        let grid_dir = self.base_dir.join(cell::GRID_DIR);
        if grid_dir.exists() {
            std::fs::remove_dir_all(&grid_dir)?;
        }
        match std::fs::remove_file(self.base_dir.join(TAG_INDEX_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Pass 1: dictionary + density ───────────────────────────────

    #[allow(clippy::type_complexity)]
    fn pass1(
        &self,
        src: &mut dyn ObjectSource,
    ) -> Result<(TagIndex, HashMap<CellIndex, u64>, Option<CellExtent>, ImportStats)> {
        let mut builder = TagIndexBuilder::new();
        let mut density: HashMap<CellIndex, u64> = HashMap::new();
        let mut bounds: Option<CellExtent> = None;
        let mut stats = ImportStats::default();
        let (cw, ch) = (self.options.cell_width, self.options.cell_height);

        src.scan(&mut |obj| {
            for (key, value) in obj.tags() {
                builder.insert(key, value);
            }
            match &obj {
                RawObject::Node(node) => {
                    stats.nodes += 1;
                    let cell = cell_of(node.lon as f64, node.lat as f64, cw, ch);
                    *density.entry(cell).or_insert(0) += 1;
                    match bounds.as_mut() {
                        Some(b) => b.extend(cell),
                        None => bounds = Some(CellExtent::point(cell)),
                    }
                }
                RawObject::Way(_) => stats.ways += 1,
                RawObject::Relation(_) => stats.relations += 1,
            }
            Ok(())
        })?;

        let tags = builder.finish()?;

        std::fs::create_dir_all(&self.base_dir)?;
        let file = File::create(self.base_dir.join(TAG_INDEX_FILE))?;
        let mut writer = BufWriter::new(file);
        tags.save(&mut writer)?;
        writer.flush()?;

        GridMeta {
            cell_width: cw,
            cell_height: ch,
        }
        .save(&self.base_dir)?;

        Ok((tags, density, bounds, stats))
    }

    // ── Pass 2: spill + convert ────────────────────────────────────

    /// Re-scan the source, writing every object that touches `extent` into
    /// the spill file. Relations have no coordinates of their own and target
    /// the global relation file, so they spill exactly once, with the first
    /// extent.
    fn spill_extent(
        &self,
        src: &mut dyn ObjectSource,
        extent: CellExtent,
        include_relations: bool,
        spill_path: &Path,
    ) -> Result<u64> {
        if let Some(parent) = spill_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(spill_path)?;
        let mut writer = BufWriter::new(file);
        let (cw, ch) = (self.options.cell_width, self.options.cell_height);
        let mut count: u64 = 0;

        src.scan(&mut |obj| {
            let touches = match &obj {
                RawObject::Node(n) => {
                    extent.contains(cell_of(n.lon as f64, n.lat as f64, cw, ch))
                }
                RawObject::Way(w) => w
                    .members
                    .iter()
                    .any(|m| extent.contains(cell_of(m.lon as f64, m.lat as f64, cw, ch))),
                RawObject::Relation(_) => include_relations,
            };
            if touches {
                write_frame(&mut writer, &obj)?;
                count += 1;
            }
            Ok(())
        })?;
        writer.flush()?;
        Ok(count)
    }

    /// Convert one spill file into final per-cell records. Only cells inside
    /// `extent` are written here; a way crossing into another extent is
    /// spilled there too and gets its remaining cells from that slice.
    fn convert_extent(
        &self,
        spill_path: &Path,
        extent: CellExtent,
        tags: &TagIndex,
    ) -> Result<usize> {
        let file = File::open(spill_path)?;
        let mut reader = BufReader::new(file);
        let mut writers = CellWriterSet::new(&self.base_dir);
        let (cw, ch) = (self.options.cell_width, self.options.cell_height);
        let mut buf = Vec::new();

        while let Some(obj) = read_frame(&mut reader)? {
            buf.clear();
            match obj {
                RawObject::Node(n) => {
                    let cell = cell_of(n.lon as f64, n.lat as f64, cw, ch);
                    let feature = NodeFeature {
                        id: n.id,
                        lon: n.lon,
                        lat: n.lat,
                        tags: tags.encode_tags(&n.tags),
                    };
                    cell::encode_node(&feature, &mut buf)?;
                    writers.append(ObjectType::Node, cell, &buf)?;
                }
                RawObject::Way(w) => {
                    if w.members.is_empty() {
                        continue;
                    }
                    let feature = WayFeature {
                        id: w.id,
                        tags: tags.encode_tags(&w.tags),
                        members: w.members,
                    };
                    cell::encode_way(&feature, &mut buf)?;
                    let cells: BTreeSet<CellIndex> = feature
                        .members
                        .iter()
                        .map(|m| cell_of(m.lon as f64, m.lat as f64, cw, ch))
                        .filter(|c| extent.contains(*c))
                        .collect();
                    for cell_index in cells {
                        writers.append(ObjectType::Way, cell_index, &buf)?;
                    }
                }
                RawObject::Relation(r) => {
                    let encoded: BTreeMap<u32, u32> = r
                        .tags
                        .iter()
                        .filter_map(|(k, v)| tags.value_id(k, v))
                        .collect();
                    let feature = RelationFeature {
                        id: r.id,
                        tags: encoded.into_iter().collect(),
                        node_ids: r.node_ids,
                        way_ids: r.way_ids,
                        child_relation_ids: r.child_relation_ids,
                    };
                    cell::encode_relation(&feature, &mut buf)?;
                    writers.append_relation(&buf)?;
                }
            }
        }

        let cells = writers.cells_touched();
        writers.finish()?;
        Ok(cells)
    }
}

// ── Spill framing ──────────────────────────────────────────────────

fn write_frame<W: Write>(writer: &mut W, obj: &RawObject) -> Result<()> {
    let bytes = bincode::serialize(obj)?;
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Option<RawObject>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).map_err(|_| {
        OsmGridError::InvalidFormat("truncated spill frame".to_string())
    })?;
    Ok(Some(bincode::deserialize(&bytes)?))
}
