//! GeoJSON output serialization.
//!
//! Decoded features leave the engine as a `FeatureCollection`: nodes become
//! Points, ways LineStrings, relations carry a null geometry (their members
//! are referenced by id only). Properties hold `@osm_id`, `@osm_type`, and
//! one entry per tag, decoded back to strings against the dictionary.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::Feature;
use crate::tag_index::TagIndex;

#[derive(Debug, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    kind: &'static str,
    features: Vec<GeoFeature>,
}

#[derive(Debug, Serialize)]
struct GeoFeature {
    #[serde(rename = "type")]
    kind: &'static str,
    geometry: Option<Geometry>,
    properties: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum Geometry {
    Point { coordinates: [f64; 2] },
    LineString { coordinates: Vec<[f64; 2]> },
}

/// Serialize query results into a GeoJSON feature collection.
pub fn feature_collection(features: &[Feature], tags: &TagIndex) -> FeatureCollection {
    FeatureCollection {
        kind: "FeatureCollection",
        features: features.iter().map(|f| geo_feature(f, tags)).collect(),
    }
}

fn geo_feature(feature: &Feature, tags: &TagIndex) -> GeoFeature {
    let geometry = match feature {
        Feature::Node(n) => Some(Geometry::Point {
            coordinates: [n.lon as f64, n.lat as f64],
        }),
        Feature::Way(w) => Some(Geometry::LineString {
            coordinates: w
                .members
                .iter()
                .map(|m| [m.lon as f64, m.lat as f64])
                .collect(),
        }),
        Feature::Relation(_) => None,
    };

    let mut properties = Map::new();
    properties.insert("@osm_id".to_string(), Value::from(feature.id()));
    properties.insert(
        "@osm_type".to_string(),
        Value::from(feature.object_type().osm_name()),
    );
    for (key_id, value_id) in feature.tag_pairs() {
        properties.insert(
            tags.key_string(key_id).to_string(),
            Value::from(tags.value_string(key_id, value_id)),
        );
    }

    GeoFeature {
        kind: "Feature",
        geometry,
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeFeature, RelationFeature, WayFeature, WayMember};
    use crate::tag_index::TagIndexBuilder;

    fn dict() -> TagIndex {
        let mut b = TagIndexBuilder::new();
        b.insert("building", "yes");
        b.insert("name", "town hall");
        b.finish().unwrap()
    }

    #[test]
    fn test_node_point_with_tag_properties() {
        let tags = dict();
        let node = Feature::Node(NodeFeature {
            id: 42,
            lon: 9.97,
            lat: 53.55,
            tags: tags.encode_tags(&[("building", "yes")]),
        });
        let json =
            serde_json::to_value(feature_collection(&[node], &tags)).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        let feature = &json["features"][0];
        assert_eq!(feature["type"], "Feature");
        assert_eq!(feature["geometry"]["type"], "Point");
        assert_eq!(feature["properties"]["@osm_id"], 42);
        assert_eq!(feature["properties"]["@osm_type"], "node");
        assert_eq!(feature["properties"]["building"], "yes");
    }

    #[test]
    fn test_way_line_string_geometry() {
        let tags = dict();
        let way = Feature::Way(WayFeature {
            id: 7,
            tags: tags.encode_tags(&[("name", "town hall")]),
            members: vec![
                WayMember { id: 1, lon: 0.0, lat: 0.0 },
                WayMember { id: 2, lon: 1.0, lat: 1.0 },
            ],
        });
        let json = serde_json::to_value(feature_collection(&[way], &tags)).unwrap();
        let feature = &json["features"][0];
        assert_eq!(feature["geometry"]["type"], "LineString");
        assert_eq!(
            feature["geometry"]["coordinates"][1][0].as_f64().unwrap(),
            1.0
        );
        assert_eq!(feature["properties"]["name"], "town hall");
    }

    #[test]
    fn test_relation_has_null_geometry() {
        let tags = dict();
        let rel = Feature::Relation(RelationFeature {
            id: 9,
            tags: vec![(0, 0)],
            node_ids: vec![1],
            way_ids: vec![],
            child_relation_ids: vec![],
        });
        let json = serde_json::to_value(feature_collection(&[rel], &tags)).unwrap();
        let feature = &json["features"][0];
        assert!(feature["geometry"].is_null());
        assert_eq!(feature["properties"]["@osm_type"], "relation");
        assert_eq!(feature["properties"]["building"], "yes");
    }
}
