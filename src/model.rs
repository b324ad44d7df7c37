//! Object model: raw import objects and decoded features.
//!
//! `Raw*` types are what the input decoder emits and what the importer spills
//! to temporary per-extent files; they carry tag strings. `Feature` and its
//! variants are what lives in cell files and flows through queries; their
//! tags are encoded against the dictionary.

use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;
use crate::tag_index::TagSet;

// ── Object type ────────────────────────────────────────────────────

/// The three OSM object kinds. Stored in distinct cell-file trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Node,
    Way,
    Relation,
}

impl ObjectType {
    /// Directory name under `grid-index/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ObjectType::Node => "node",
            ObjectType::Way => "way",
            ObjectType::Relation => "relation",
        }
    }

    /// `@osm_type` property value in query output.
    pub fn osm_name(&self) -> &'static str {
        self.dir_name()
    }
}

// ── Raw input objects ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNode {
    pub id: u64,
    pub lon: f32,
    pub lat: f32,
    pub tags: Vec<(String, String)>,
}

/// Way member with its coordinates embedded by the input decoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WayMember {
    pub id: u64,
    pub lon: f32,
    pub lat: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWay {
    pub id: u64,
    pub tags: Vec<(String, String)>,
    /// Ordered, never empty.
    pub members: Vec<WayMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRelation {
    pub id: u64,
    pub tags: Vec<(String, String)>,
    pub node_ids: Vec<u64>,
    pub way_ids: Vec<u64>,
    pub child_relation_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RawObject {
    Node(RawNode),
    Way(RawWay),
    Relation(RawRelation),
}

impl RawObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            RawObject::Node(_) => ObjectType::Node,
            RawObject::Way(_) => ObjectType::Way,
            RawObject::Relation(_) => ObjectType::Relation,
        }
    }

    pub fn tags(&self) -> &[(String, String)] {
        match self {
            RawObject::Node(n) => &n.tags,
            RawObject::Way(w) => &w.tags,
            RawObject::Relation(r) => &r.tags,
        }
    }
}

// ── Decoded features ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NodeFeature {
    pub id: u64,
    pub lon: f32,
    pub lat: f32,
    pub tags: TagSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WayFeature {
    pub id: u64,
    pub tags: TagSet,
    pub members: Vec<WayMember>,
}

impl WayFeature {
    /// Envelope of the member nodes.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(
            self.members
                .iter()
                .map(|m| (m.lon as f64, m.lat as f64)),
        )
        .expect("way has at least one member")
    }
}

/// Relation tags are stored as explicit (key-id, value-id) pairs, sorted by
/// key-id, not as a bitset. Member references are ids only; no geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationFeature {
    pub id: u64,
    pub tags: Vec<(u32, u32)>,
    pub node_ids: Vec<u64>,
    pub way_ids: Vec<u64>,
    pub child_relation_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Node(NodeFeature),
    Way(WayFeature),
    Relation(RelationFeature),
}

impl Feature {
    pub fn id(&self) -> u64 {
        match self {
            Feature::Node(n) => n.id,
            Feature::Way(w) => w.id,
            Feature::Relation(r) => r.id,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            Feature::Node(_) => ObjectType::Node,
            Feature::Way(_) => ObjectType::Way,
            Feature::Relation(_) => ObjectType::Relation,
        }
    }

    /// Dedup key across cells: ways are duplicated into every cell their
    /// geometry crosses, so consumers collapse on this.
    pub fn dedup_key(&self) -> (ObjectType, u64) {
        (self.object_type(), self.id())
    }

    pub fn has_key(&self, key_id: u32) -> bool {
        match self {
            Feature::Node(n) => n.tags.has_key(key_id),
            Feature::Way(w) => w.tags.has_key(key_id),
            Feature::Relation(r) => r.tags.iter().any(|&(k, _)| k == key_id),
        }
    }

    pub fn tag_value(&self, key_id: u32) -> Option<u32> {
        match self {
            Feature::Node(n) => n.tags.value_of(key_id),
            Feature::Way(w) => w.tags.value_of(key_id),
            Feature::Relation(r) => r
                .tags
                .iter()
                .find(|&&(k, _)| k == key_id)
                .map(|&(_, v)| v),
        }
    }

    /// Decoded tag pairs as (key-id, value-id), ascending key-id.
    pub fn tag_pairs(&self) -> Vec<(u32, u32)> {
        match self {
            Feature::Node(n) => n.tags.iter().collect(),
            Feature::Way(w) => w.tags.iter().collect(),
            Feature::Relation(r) => r.tags.clone(),
        }
    }

    /// The feature's own id plus the ids of everything it references, typed.
    /// This is the id universe used by context-aware sub-statements: an outer
    /// feature matches when one of these ids was touched by a matching inner
    /// feature, and a matching inner feature contributes exactly this set.
    pub fn context_ids(&self) -> Vec<(ObjectType, u64)> {
        match self {
            Feature::Node(n) => vec![(ObjectType::Node, n.id)],
            Feature::Way(w) => {
                let mut ids = Vec::with_capacity(w.members.len() + 1);
                ids.push((ObjectType::Way, w.id));
                ids.extend(w.members.iter().map(|m| (ObjectType::Node, m.id)));
                ids
            }
            Feature::Relation(r) => {
                let mut ids = Vec::with_capacity(
                    1 + r.node_ids.len() + r.way_ids.len() + r.child_relation_ids.len(),
                );
                ids.push((ObjectType::Relation, r.id));
                ids.extend(r.node_ids.iter().map(|&id| (ObjectType::Node, id)));
                ids.extend(r.way_ids.iter().map(|&id| (ObjectType::Way, id)));
                ids.extend(
                    r.child_relation_ids
                        .iter()
                        .map(|&id| (ObjectType::Relation, id)),
                );
                ids
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_way_bounding_box() {
        let way = WayFeature {
            id: 1,
            tags: TagSet::default(),
            members: vec![
                WayMember { id: 10, lon: 0.05, lat: 0.05 },
                WayMember { id: 11, lon: 0.15, lat: 0.02 },
            ],
        };
        let bbox = way.bounding_box();
        assert!((bbox.min_lon - 0.05).abs() < 1e-6);
        assert!((bbox.max_lon - 0.15).abs() < 1e-6);
        assert!((bbox.min_lat - 0.02).abs() < 1e-6);
        assert!((bbox.max_lat - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_relation_tag_lookup() {
        let rel = Feature::Relation(RelationFeature {
            id: 5,
            tags: vec![(2, 7), (4, 0)],
            node_ids: vec![],
            way_ids: vec![],
            child_relation_ids: vec![],
        });
        assert!(rel.has_key(2));
        assert!(!rel.has_key(3));
        assert_eq!(rel.tag_value(4), Some(0));
        assert_eq!(rel.tag_value(1), None);
    }

    #[test]
    fn test_context_ids_typed() {
        let way = Feature::Way(WayFeature {
            id: 7,
            tags: TagSet::default(),
            members: vec![WayMember { id: 7, lon: 0.0, lat: 0.0 }],
        });
        let ids = way.context_ids();
        // A node id equal to the way id stays distinct because ids are typed.
        assert!(ids.contains(&(ObjectType::Way, 7)));
        assert!(ids.contains(&(ObjectType::Node, 7)));
        assert_eq!(ids.len(), 2);
    }
}
