//! Cell files: append-only binary record storage, one file per
//! (object-type, cell), plus the single global relation file.
//!
//! All fields are little-endian. Value-ids are packed as 3 bytes,
//! least-significant byte first. Key bitsets are stored tail-trimmed; the
//! `num_key_bytes` field is the byte length of the truncated bitset, not the
//! number of set bits.
//!
//! Record layouts:
//!
//! ```text
//! node:     id(8) lon_f32(4) lat_f32(4) num_key_bytes(4) num_values(4)
//!           key_bytes values[num_values*3]
//! way:      id(8) num_key_bytes(4) num_values(4) num_nodes(2)
//!           key_bytes values[num_values*3]
//!           members[num_nodes * (id(8) lon_f32(4) lat_f32(4))]
//! relation: id(8) num_keys(2) num_nodes(2) num_ways(2) num_child_rel(2)
//!           tags[num_keys * (key(4) value(4))]
//!           node_ids[num_nodes*8] way_ids[num_ways*8] child_rel_ids[num_child_rel*8]
//! ```
//!
//! A record's length is fully determined by its header, so readers scan
//! linearly and may skip records. Writes are strictly append; files are
//! read-only after import.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{OsmGridError, Result};
use crate::model::{
    Feature, NodeFeature, ObjectType, RelationFeature, WayFeature, WayMember,
};
use crate::tag_index::{TagIndex, TagSet};

use super::CellIndex;

/// Directory holding all cell files, under the index base directory.
pub const GRID_DIR: &str = "grid-index";

/// Largest value-id representable in a 3-byte field.
pub const MAX_VALUE_ID: u32 = (1 << 24) - 1;

// ── Paths ──────────────────────────────────────────────────────────

/// `<base>/grid-index/<type>/<x>/<y>.cell`
pub fn cell_file_path(base: &Path, object_type: ObjectType, cell: CellIndex) -> PathBuf {
    base.join(GRID_DIR)
        .join(object_type.dir_name())
        .join(cell.x.to_string())
        .join(format!("{}.cell", cell.y))
}

/// `<base>/grid-index/relation.cell` — relations are not sharded by cell.
pub fn relation_file_path(base: &Path) -> PathBuf {
    base.join(GRID_DIR).join("relation.cell")
}

// ── Record encoding ────────────────────────────────────────────────

fn put_u24(buf: &mut Vec<u8>, value: u32) -> Result<()> {
    if value > MAX_VALUE_ID {
        return Err(OsmGridError::InvalidFormat(format!(
            "value-id {} exceeds 24-bit field",
            value
        )));
    }
    let b = value.to_le_bytes();
    buf.extend_from_slice(&b[..3]);
    Ok(())
}

fn put_tags(buf: &mut Vec<u8>, tags: &TagSet) -> Result<()> {
    for &v in &tags.values {
        put_u24(buf, v)?;
    }
    Ok(())
}

pub fn encode_node(node: &NodeFeature, buf: &mut Vec<u8>) -> Result<()> {
    buf.extend_from_slice(&node.id.to_le_bytes());
    buf.extend_from_slice(&node.lon.to_le_bytes());
    buf.extend_from_slice(&node.lat.to_le_bytes());
    buf.extend_from_slice(&(node.tags.key_bits.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(node.tags.values.len() as u32).to_le_bytes());
    buf.extend_from_slice(&node.tags.key_bits);
    put_tags(buf, &node.tags)
}

pub fn encode_way(way: &WayFeature, buf: &mut Vec<u8>) -> Result<()> {
    if way.members.len() > u16::MAX as usize {
        return Err(OsmGridError::InvalidFormat(format!(
            "way {} has {} members, exceeding the 16-bit member count",
            way.id,
            way.members.len()
        )));
    }
    buf.extend_from_slice(&way.id.to_le_bytes());
    buf.extend_from_slice(&(way.tags.key_bits.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(way.tags.values.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(way.members.len() as u16).to_le_bytes());
    buf.extend_from_slice(&way.tags.key_bits);
    put_tags(buf, &way.tags)?;
    for m in &way.members {
        buf.extend_from_slice(&m.id.to_le_bytes());
        buf.extend_from_slice(&m.lon.to_le_bytes());
        buf.extend_from_slice(&m.lat.to_le_bytes());
    }
    Ok(())
}

pub fn encode_relation(rel: &RelationFeature, buf: &mut Vec<u8>) -> Result<()> {
    let counts = [
        rel.tags.len(),
        rel.node_ids.len(),
        rel.way_ids.len(),
        rel.child_relation_ids.len(),
    ];
    if counts.iter().any(|&c| c > u16::MAX as usize) {
        return Err(OsmGridError::InvalidFormat(format!(
            "relation {} exceeds a 16-bit member or tag count",
            rel.id
        )));
    }
    buf.extend_from_slice(&rel.id.to_le_bytes());
    for c in counts {
        buf.extend_from_slice(&(c as u16).to_le_bytes());
    }
    for &(k, v) in &rel.tags {
        buf.extend_from_slice(&k.to_le_bytes());
        buf.extend_from_slice(&v.to_le_bytes());
    }
    for ids in [&rel.node_ids, &rel.way_ids, &rel.child_relation_ids] {
        for &id in ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
    }
    Ok(())
}

// ── Record decoding ────────────────────────────────────────────────

/// Bounds-checked cursor over a cell file's bytes. Truncation mid-record is
/// a format error, never a panic.
struct RecordCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(OsmGridError::InvalidFormat(format!(
                "unexpected end of record data at offset {}",
                self.pos
            ))),
        }
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn tag_set(&mut self, num_key_bytes: u32, num_values: u32) -> Result<TagSet> {
        let key_bits = self.take(num_key_bytes as usize)?.to_vec();
        let mut values = Vec::with_capacity(num_values as usize);
        for _ in 0..num_values {
            values.push(self.u24()?);
        }
        Ok(TagSet { key_bits, values })
    }

    fn node(&mut self) -> Result<NodeFeature> {
        let id = self.u64()?;
        let lon = self.f32()?;
        let lat = self.f32()?;
        let num_key_bytes = self.u32()?;
        let num_values = self.u32()?;
        let tags = self.tag_set(num_key_bytes, num_values)?;
        Ok(NodeFeature { id, lon, lat, tags })
    }

    fn way(&mut self) -> Result<WayFeature> {
        let id = self.u64()?;
        let num_key_bytes = self.u32()?;
        let num_values = self.u32()?;
        let num_nodes = self.u16()?;
        let tags = self.tag_set(num_key_bytes, num_values)?;
        let mut members = Vec::with_capacity(num_nodes as usize);
        for _ in 0..num_nodes {
            let id = self.u64()?;
            let lon = self.f32()?;
            let lat = self.f32()?;
            members.push(WayMember { id, lon, lat });
        }
        Ok(WayFeature { id, tags, members })
    }

    fn relation(&mut self) -> Result<RelationFeature> {
        let id = self.u64()?;
        let num_keys = self.u16()?;
        let num_nodes = self.u16()?;
        let num_ways = self.u16()?;
        let num_child = self.u16()?;
        let mut tags = Vec::with_capacity(num_keys as usize);
        for _ in 0..num_keys {
            let k = self.u32()?;
            let v = self.u32()?;
            tags.push((k, v));
        }
        let mut id_list = |n: u16, cursor: &mut Self| -> Result<Vec<u64>> {
            let mut ids = Vec::with_capacity(n as usize);
            for _ in 0..n {
                ids.push(cursor.u64()?);
            }
            Ok(ids)
        };
        let node_ids = id_list(num_nodes, self)?;
        let way_ids = id_list(num_ways, self)?;
        let child_relation_ids = id_list(num_child, self)?;
        Ok(RelationFeature {
            id,
            tags,
            node_ids,
            way_ids,
            child_relation_ids,
        })
    }
}

/// Decode every record in a cell file's byte content.
pub fn decode_all(data: &[u8], object_type: ObjectType) -> Result<Vec<Feature>> {
    let mut cursor = RecordCursor::new(data);
    let mut features = Vec::new();
    while !cursor.is_at_end() {
        let feature = match object_type {
            ObjectType::Node => Feature::Node(cursor.node()?),
            ObjectType::Way => Feature::Way(cursor.way()?),
            ObjectType::Relation => Feature::Relation(cursor.relation()?),
        };
        features.push(feature);
    }
    Ok(features)
}

/// Read and decode one cell file. A missing file is an empty cell, not an
/// error; anything else unreadable is fatal to the scan.
pub fn read_cell_file(path: &Path, object_type: ObjectType) -> Result<Vec<Feature>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(OsmGridError::CellIo {
                path: path.display().to_string(),
                source: e,
            })
        }
    };
    let len = file
        .metadata()
        .map_err(|e| OsmGridError::CellIo {
            path: path.display().to_string(),
            source: e,
        })?
        .len();
    if len == 0 {
        return Ok(Vec::new());
    }
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| OsmGridError::CellIo {
        path: path.display().to_string(),
        source: e,
    })?;
    decode_all(&mmap, object_type)
}

// ── Validity check ─────────────────────────────────────────────────

/// Post-decode consistency check against the dictionary: every set key-id
/// must be a valid dictionary key and every value-id in range for its key.
/// Returns a human-readable violation, or `None` when the feature is clean.
pub fn check_feature_validity(feature: &Feature, tags: &TagIndex) -> Option<String> {
    let bitset = match feature {
        Feature::Node(n) => Some(&n.tags),
        Feature::Way(w) => Some(&w.tags),
        Feature::Relation(_) => None,
    };
    if let Some(tag_set) = bitset {
        if tag_set.key_bits.len() > tags.key_count().div_ceil(8) {
            return Some(format!(
                "{} {}: key bitset spans {} bytes but the dictionary holds {} keys",
                feature.object_type().dir_name(),
                feature.id(),
                tag_set.key_bits.len(),
                tags.key_count()
            ));
        }
    }
    for (k, v) in feature.tag_pairs() {
        if k as usize >= tags.key_count() {
            return Some(format!(
                "{} {}: key-id {} out of dictionary range",
                feature.object_type().dir_name(),
                feature.id(),
                k
            ));
        }
        if v as usize >= tags.value_count(k) {
            return Some(format!(
                "{} {}: value-id {} out of range for key '{}'",
                feature.object_type().dir_name(),
                feature.id(),
                v,
                tags.key_string(k)
            ));
        }
    }
    None
}

// ── Append writers ─────────────────────────────────────────────────

/// Cache of open append-mode cell files, used by the importer's conversion
/// step. Files are created lazily on first append; flushed by `finish`.
pub struct CellWriterSet {
    base: PathBuf,
    writers: HashMap<(ObjectType, CellIndex), BufWriter<File>>,
    relation_writer: Option<BufWriter<File>>,
    cells_created: usize,
}

impl CellWriterSet {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            writers: HashMap::new(),
            relation_writer: None,
            cells_created: 0,
        }
    }

    fn open_append(path: &Path) -> Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OsmGridError::CellIo {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| OsmGridError::CellIo {
                path: path.display().to_string(),
                source: e,
            })?;
        Ok(BufWriter::new(file))
    }

    /// Append an encoded record to a (type, cell) file.
    pub fn append(&mut self, object_type: ObjectType, cell: CellIndex, record: &[u8]) -> Result<()> {
        let writer = match self.writers.entry((object_type, cell)) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let path = cell_file_path(&self.base, object_type, cell);
                self.cells_created += 1;
                v.insert(Self::open_append(&path)?)
            }
        };
        writer.write_all(record)?;
        Ok(())
    }

    /// Append an encoded record to the global relation file.
    pub fn append_relation(&mut self, record: &[u8]) -> Result<()> {
        if self.relation_writer.is_none() {
            let path = relation_file_path(&self.base);
            self.relation_writer = Some(Self::open_append(&path)?);
        }
        let writer = self.relation_writer.as_mut().expect("initialized above");
        writer.write_all(record)?;
        Ok(())
    }

    /// Number of distinct cell files opened by this writer set.
    pub fn cells_touched(&self) -> usize {
        self.cells_created
    }

    /// Flush everything. Must be called; dropping unflushed buffers loses
    /// tail records.
    pub fn finish(mut self) -> Result<()> {
        for (_, writer) in self.writers.iter_mut() {
            writer.flush()?;
        }
        if let Some(w) = self.relation_writer.as_mut() {
            w.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag_index::TagIndexBuilder;

    fn tag_index() -> TagIndex {
        let mut b = TagIndexBuilder::new();
        b.insert("a", "1");
        b.insert("a", "2");
        b.insert("b", "x");
        b.finish().unwrap()
    }

    fn node(id: u64, lon: f32, lat: f32, tags: TagSet) -> NodeFeature {
        NodeFeature { id, lon, lat, tags }
    }

    #[test]
    fn test_node_record_layout() {
        let index = tag_index();
        let n = node(42, 0.05, 0.06, index.encode_tags(&[("a", "2")]));
        let mut buf = Vec::new();
        encode_node(&n, &mut buf).unwrap();

        // id(8) lon(4) lat(4) num_key_bytes(4) num_values(4) key_bytes(1) values(3)
        assert_eq!(buf.len(), 8 + 4 + 4 + 4 + 4 + 1 + 3);
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 42);
        assert_eq!(f32::from_le_bytes(buf[8..12].try_into().unwrap()), 0.05);
        assert_eq!(u32::from_le_bytes(buf[16..20].try_into().unwrap()), 1); // key bytes
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), 1); // values
        assert_eq!(buf[24], 0b01); // key bitset
        assert_eq!(&buf[25..28], &[1, 0, 0]); // value-id 1, LSB first
    }

    #[test]
    fn test_node_round_trip() {
        let index = tag_index();
        let n = node(7, -1.5, 53.25, index.encode_tags(&[("a", "1"), ("b", "x")]));
        let mut buf = Vec::new();
        encode_node(&n, &mut buf).unwrap();
        let decoded = decode_all(&buf, ObjectType::Node).unwrap();
        assert_eq!(decoded, vec![Feature::Node(n)]);
    }

    #[test]
    fn test_way_round_trip_and_member_order() {
        let index = tag_index();
        let w = WayFeature {
            id: 900,
            tags: index.encode_tags(&[("b", "x")]),
            members: vec![
                WayMember { id: 1, lon: 0.05, lat: 0.05 },
                WayMember { id: 2, lon: 0.15, lat: 0.05 },
            ],
        };
        let mut buf = Vec::new();
        encode_way(&w, &mut buf).unwrap();
        // num_key_bytes counts the truncated bitset bytes, not set bits.
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 1);
        let decoded = decode_all(&buf, ObjectType::Way).unwrap();
        match &decoded[0] {
            Feature::Way(got) => {
                assert_eq!(got, &w);
                assert_eq!(got.members[0].id, 1);
                assert_eq!(got.members[1].id, 2);
            }
            other => panic!("expected way, got {:?}", other),
        }
    }

    #[test]
    fn test_relation_round_trip() {
        let r = RelationFeature {
            id: 31,
            tags: vec![(0, 1), (5, 2)],
            node_ids: vec![100, 101],
            way_ids: vec![900],
            child_relation_ids: vec![],
        };
        let mut buf = Vec::new();
        encode_relation(&r, &mut buf).unwrap();
        assert_eq!(
            buf.len(),
            8 + 2 * 4 + 2 * 8 + 2 * 8 + 1 * 8
        );
        let decoded = decode_all(&buf, ObjectType::Relation).unwrap();
        assert_eq!(decoded, vec![Feature::Relation(r)]);
    }

    #[test]
    fn test_multiple_records_scan_in_write_order() {
        let index = tag_index();
        let mut buf = Vec::new();
        for id in [3u64, 1, 2] {
            let n = node(id, 0.0, 0.0, index.encode_tags::<&str, &str>(&[]));
            encode_node(&n, &mut buf).unwrap();
        }
        let decoded = decode_all(&buf, ObjectType::Node).unwrap();
        let ids: Vec<u64> = decoded.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_truncated_record_is_format_error() {
        let index = tag_index();
        let n = node(7, 0.0, 0.0, index.encode_tags(&[("a", "1")]));
        let mut buf = Vec::new();
        encode_node(&n, &mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        let err = decode_all(&buf, ObjectType::Node).unwrap_err();
        assert!(
            err.to_string().contains("unexpected end of record"),
            "got: {}",
            err
        );
    }

    #[test]
    fn test_value_id_must_fit_24_bits() {
        let n = node(
            1,
            0.0,
            0.0,
            TagSet {
                key_bits: vec![0b1],
                values: vec![1 << 24],
            },
        );
        let mut buf = Vec::new();
        assert!(encode_node(&n, &mut buf).is_err());
    }

    #[test]
    fn test_validity_check_flags_bad_value_id() {
        let index = tag_index();
        let bad = Feature::Node(node(
            1,
            0.0,
            0.0,
            TagSet {
                key_bits: vec![0b1],
                values: vec![99], // key "a" only has 2 values
            },
        ));
        let detail = check_feature_validity(&bad, &index).unwrap();
        assert!(detail.contains("value-id 99"), "got: {}", detail);

        let good = Feature::Node(node(1, 0.0, 0.0, index.encode_tags(&[("a", "2")])));
        assert!(check_feature_validity(&good, &index).is_none());
    }

    #[test]
    fn test_missing_cell_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = cell_file_path(dir.path(), ObjectType::Node, CellIndex { x: 4, y: -2 });
        assert_eq!(
            path,
            dir.path().join("grid-index/node/4/-2.cell")
        );
        let features = read_cell_file(&path, ObjectType::Node).unwrap();
        assert!(features.is_empty());
    }

    #[test]
    fn test_writer_set_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let index = tag_index();
        let cell = CellIndex { x: 0, y: 0 };

        let mut writers = CellWriterSet::new(dir.path());
        for id in 0..3u64 {
            let n = node(id, 0.01, 0.02, index.encode_tags(&[("a", "1")]));
            let mut buf = Vec::new();
            encode_node(&n, &mut buf).unwrap();
            writers.append(ObjectType::Node, cell, &buf).unwrap();
        }
        assert_eq!(writers.cells_touched(), 1);
        writers.finish().unwrap();

        let path = cell_file_path(dir.path(), ObjectType::Node, cell);
        let features = read_cell_file(&path, ObjectType::Node).unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].id(), 0);
        assert_eq!(features[2].id(), 2);
    }
}
