//! Axis-aligned bounding boxes over WGS84 degree coordinates.
//!
//! All selection geometry in the engine is rectangular: a query bbox selects
//! points by containment and ways/relations by envelope intersection. Degrees
//! are compared directly; no great-circle math.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in (lon, lat) degrees, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Degenerate box covering a single point.
    pub fn from_point(lon: f64, lat: f64) -> Self {
        Self::new(lon, lat, lon, lat)
    }

    /// Envelope of a point sequence. `None` for an empty sequence.
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (lon, lat) = iter.next()?;
        let mut bbox = Self::from_point(lon, lat);
        for (lon, lat) in iter {
            bbox.extend(lon, lat);
        }
        Some(bbox)
    }

    /// Grow the box to include a point.
    pub fn extend(&mut self, lon: f64, lat: f64) {
        self.min_lon = self.min_lon.min(lon);
        self.min_lat = self.min_lat.min(lat);
        self.max_lon = self.max_lon.max(lon);
        self.max_lat = self.max_lat.max(lat);
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_inclusive_bounds() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(bbox.contains(0.0, 0.0));
        assert!(bbox.contains(1.0, 1.0));
        assert!(bbox.contains(0.5, 0.5));
        assert!(!bbox.contains(1.0001, 0.5));
        assert!(!bbox.contains(0.5, -0.0001));
    }

    #[test]
    fn test_intersects_overlap_and_touch() {
        let a = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let b = BoundingBox::new(0.5, 0.5, 2.0, 2.0);
        let c = BoundingBox::new(1.0, 1.0, 2.0, 2.0); // touches at a corner
        let d = BoundingBox::new(1.5, 1.5, 2.0, 2.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(a.intersects(&c));
        assert!(!a.intersects(&d));
    }

    #[test]
    fn test_from_points_envelope() {
        let bbox = BoundingBox::from_points(vec![(0.1, 0.2), (-0.5, 0.7), (0.3, -0.4)]).unwrap();
        assert_eq!(bbox.min_lon, -0.5);
        assert_eq!(bbox.min_lat, -0.4);
        assert_eq!(bbox.max_lon, 0.3);
        assert_eq!(bbox.max_lat, 0.7);
        assert!(BoundingBox::from_points(std::iter::empty()).is_none());
    }
}
