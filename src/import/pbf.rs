//! `.osm.pbf` input decoder.
//!
//! Wraps `osmpbf`'s element reader as an [`ObjectSource`]. PBF ways reference
//! member nodes by id only, so the first scan builds a node-id → coordinate
//! cache; every scan then emits ways with member coordinates embedded. The
//! cache holds every node of the snapshot — bounding import memory is the
//! grid importer's job (node budget), resolving coordinates is the decoder's.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use osmpbf::{Element, ElementReader, RelMemberType};
use tracing::{debug, info, warn};

use crate::error::{OsmGridError, Result};
use crate::model::{RawNode, RawObject, RawRelation, RawWay, WayMember};

use super::source::ObjectSource;

#[derive(Debug)]
pub struct PbfSource {
    path: PathBuf,
    coords: Option<HashMap<u64, (f32, f32)>>,
}

impl PbfSource {
    /// Open a `.osm.pbf` file. Any other suffix is rejected up front.
    pub fn open(path: &Path) -> Result<Self> {
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pbf"));
        if !supported {
            return Err(OsmGridError::InputMalformed(format!(
                "unsupported input file suffix: {} (expected .osm.pbf)",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            coords: None,
        })
    }

    fn ensure_coords(&mut self) -> Result<&HashMap<u64, (f32, f32)>> {
        if self.coords.is_none() {
            info!("collecting node coordinates from {}", self.path.display());
            let mut coords = HashMap::new();
            let reader = ElementReader::from_path(&self.path).map_err(pbf_error)?;
            reader
                .for_each(|element| match element {
                    Element::Node(node) => {
                        coords.insert(node.id() as u64, (node.lon() as f32, node.lat() as f32));
                    }
                    Element::DenseNode(node) => {
                        coords.insert(node.id() as u64, (node.lon() as f32, node.lat() as f32));
                    }
                    _ => {}
                })
                .map_err(pbf_error)?;
            debug!("cached {} node coordinates", coords.len());
            self.coords = Some(coords);
        }
        Ok(self.coords.as_ref().expect("coords just populated"))
    }
}

fn pbf_error(e: osmpbf::Error) -> OsmGridError {
    OsmGridError::InputMalformed(format!("pbf read error: {}", e))
}

fn node_tags<'a, I: Iterator<Item = (&'a str, &'a str)>>(tags: I) -> Vec<(String, String)> {
    tags.map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl ObjectSource for PbfSource {
    fn scan(&mut self, sink: &mut dyn FnMut(RawObject) -> Result<()>) -> Result<()> {
        self.ensure_coords()?;
        let coords = self.coords.as_ref().expect("coords populated above");

        let mut sink_err: Option<OsmGridError> = None;
        let mut dropped_members: u64 = 0;
        let reader = ElementReader::from_path(&self.path).map_err(pbf_error)?;
        reader
            .for_each(|element| {
                if sink_err.is_some() {
                    return;
                }
                let object = match element {
                    Element::Node(node) => Some(RawObject::Node(RawNode {
                        id: node.id() as u64,
                        lon: node.lon() as f32,
                        lat: node.lat() as f32,
                        tags: node_tags(node.tags()),
                    })),
                    Element::DenseNode(node) => Some(RawObject::Node(RawNode {
                        id: node.id() as u64,
                        lon: node.lon() as f32,
                        lat: node.lat() as f32,
                        tags: node_tags(node.tags()),
                    })),
                    Element::Way(way) => {
                        let mut members = Vec::new();
                        for id in way.refs() {
                            let id = id as u64;
                            match coords.get(&id) {
                                Some(&(lon, lat)) => members.push(WayMember { id, lon, lat }),
                                None => dropped_members += 1,
                            }
                        }
                        if members.is_empty() {
                            // A way with no resolvable members has no
                            // geometry to index.
                            None
                        } else {
                            Some(RawObject::Way(RawWay {
                                id: way.id() as u64,
                                tags: node_tags(way.tags()),
                                members,
                            }))
                        }
                    }
                    Element::Relation(relation) => {
                        let mut node_ids = Vec::new();
                        let mut way_ids = Vec::new();
                        let mut child_relation_ids = Vec::new();
                        for member in relation.members() {
                            let id = member.member_id as u64;
                            match member.member_type {
                                RelMemberType::Node => node_ids.push(id),
                                RelMemberType::Way => way_ids.push(id),
                                RelMemberType::Relation => child_relation_ids.push(id),
                            }
                        }
                        Some(RawObject::Relation(RawRelation {
                            id: relation.id() as u64,
                            tags: node_tags(relation.tags()),
                            node_ids,
                            way_ids,
                            child_relation_ids,
                        }))
                    }
                };
                if let Some(object) = object {
                    if let Err(e) = sink(object) {
                        sink_err = Some(e);
                    }
                }
            })
            .map_err(pbf_error)?;

        if dropped_members > 0 {
            warn!(
                "{} way member references had no coordinates in the snapshot",
                dropped_members
            );
        }
        match sink_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_suffix() {
        let err = PbfSource::open(Path::new("snapshot.osm.xml")).unwrap_err();
        assert!(matches!(err, OsmGridError::InputMalformed(_)));
        assert!(err.to_string().contains("unsupported input file suffix"));
    }

    #[test]
    fn test_accepts_pbf_suffix() {
        assert!(PbfSource::open(Path::new("region.osm.pbf")).is_ok());
        assert!(PbfSource::open(Path::new("region.PBF")).is_ok());
    }
}
