//! Area-of-interest polygons and point membership
//!
//! Coordinates are WGS84 `[lon, lat]` pairs. Distances are evaluated in a
//! local equirectangular frame, which is accurate for field-sized polygons.

use crate::io::geojson;
use crate::types::{BoundingBox, CanopyError, CanopyResult};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Meters per degree of latitude (and of longitude at the equator)
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Rings enclosing less than this (0.01 m²) count as degenerate
const MIN_AREA_HECTARES: f64 = 1e-6;

/// Polygon area of interest, outer ring only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AoiPayload", into = "AoiPayload")]
pub struct Aoi {
    ring: Vec<[f64; 2]>,
    name: Option<String>,
    bbox: BoundingBox,
}

impl Aoi {
    /// Build an AOI from an outer ring, closing it when open
    pub fn new(mut ring: Vec<[f64; 2]>, name: Option<String>) -> CanopyResult<Self> {
        if ring.is_empty() {
            return Err(CanopyError::Validation("AOI ring is empty".to_string()));
        }
        if let Some(bad) = ring.iter().find(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return Err(CanopyError::Validation(format!(
                "AOI ring contains a non-finite vertex: [{}, {}]",
                bad[0], bad[1]
            )));
        }
        if let Some(bad) = ring.iter().find(|p| p[0].abs() > 180.0 || p[1].abs() > 90.0) {
            return Err(CanopyError::Validation(format!(
                "AOI vertex [{}, {}] is outside WGS84 bounds",
                bad[0], bad[1]
            )));
        }

        let distinct = distinct_vertex_count(&ring);
        if distinct < 3 {
            return Err(CanopyError::Geometry(format!(
                "AOI ring has {} distinct vertices, at least 3 are required",
                distinct
            )));
        }

        if ring.first() != ring.last() {
            log::debug!("Closing open AOI ring with {} vertices", ring.len());
            ring.push(ring[0]);
        }

        let bbox = BoundingBox::from_points(&ring)
            .ok_or_else(|| CanopyError::Geometry("AOI ring has no vertices".to_string()))?;

        let aoi = Self { ring, name, bbox };
        if aoi.area_hectares() < MIN_AREA_HECTARES {
            return Err(CanopyError::Geometry(
                "AOI ring encloses no area, its vertices are collinear".to_string(),
            ));
        }
        Ok(aoi)
    }

    /// Axis-aligned rectangle as an AOI
    pub fn from_bbox(bbox: &BoundingBox, name: Option<String>) -> CanopyResult<Self> {
        Self::new(
            vec![
                [bbox.min_lon, bbox.min_lat],
                [bbox.min_lon, bbox.max_lat],
                [bbox.max_lon, bbox.max_lat],
                [bbox.max_lon, bbox.min_lat],
            ],
            name,
        )
    }

    /// Closed outer ring
    pub fn ring(&self) -> &[[f64; 2]] {
        &self.ring
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bbox
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.bbox.contains(lon, lat) && point_in_polygon(&self.ring, lon, lat)
    }

    /// Region used for cloud scoring; a zero buffer keeps the exact polygon
    pub fn buffered(&self, buffer_meters: f64) -> Region<'_> {
        Region::new(self, buffer_meters)
    }

    /// Mean of the ring vertices (closing vertex excluded)
    pub fn centroid(&self) -> (f64, f64) {
        let open = &self.ring[..self.ring.len() - 1];
        let n = open.len() as f64;
        let (sx, sy) = open
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
        (sx / n, sy / n)
    }

    /// Planar area in hectares using the shoelace formula in local meters
    pub fn area_hectares(&self) -> f64 {
        let (_, lat0) = self.bbox.center();
        let kx = METERS_PER_DEGREE * lat0.to_radians().cos();
        let ky = METERS_PER_DEGREE;
        let twice_area: f64 = self
            .ring
            .windows(2)
            .map(|w| (w[0][0] * kx) * (w[1][1] * ky) - (w[1][0] * kx) * (w[0][1] * ky))
            .sum();
        twice_area.abs() / 2.0 / 10_000.0
    }

    /// Stable fingerprint of the ring coordinates, used as a cache key
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for p in &self.ring {
            p[0].to_bits().hash(&mut hasher);
            p[1].to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// AOI as exchanged with callers: a GeoJSON geometry plus optional name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AoiPayload {
    pub geometry: serde_json::Value,
    #[serde(default)]
    pub name: Option<String>,
}

impl TryFrom<AoiPayload> for Aoi {
    type Error = CanopyError;

    fn try_from(payload: AoiPayload) -> Result<Self, Self::Error> {
        let ring = geojson::outer_ring(&payload.geometry)?;
        Aoi::new(ring, payload.name)
    }
}

impl From<Aoi> for AoiPayload {
    fn from(aoi: Aoi) -> Self {
        AoiPayload {
            geometry: geojson::polygon_value(&aoi.ring),
            name: aoi.name,
        }
    }
}

/// AOI optionally grown outward by a buffer distance
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    aoi: &'a Aoi,
    buffer_meters: f64,
    bbox: BoundingBox,
}

impl<'a> Region<'a> {
    pub fn new(aoi: &'a Aoi, buffer_meters: f64) -> Self {
        let buffer_meters = if buffer_meters.is_finite() {
            buffer_meters.max(0.0)
        } else {
            0.0
        };
        let bbox = aoi.bounds();
        let (_, lat0) = bbox.center();
        let lat_margin = buffer_meters / METERS_PER_DEGREE;
        let lon_margin = buffer_meters / (METERS_PER_DEGREE * lat0.to_radians().cos().max(1e-6));
        Self {
            aoi,
            buffer_meters,
            bbox: bbox.expanded(lon_margin, lat_margin),
        }
    }

    pub fn aoi(&self) -> &'a Aoi {
        self.aoi
    }

    pub fn buffer_meters(&self) -> f64 {
        self.buffer_meters
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bbox
    }

    /// Inside the polygon, or within the buffer distance of its boundary
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        if !self.bbox.contains(lon, lat) {
            return false;
        }
        if self.aoi.contains(lon, lat) {
            return true;
        }
        self.buffer_meters > 0.0
            && distance_to_ring_meters(self.aoi.ring(), lon, lat) <= self.buffer_meters
    }
}

/// Ray-casting point-in-polygon test over an outer ring
///
/// Rings with fewer than three distinct vertices contain nothing. Points
/// exactly on an edge may fall on either side.
pub fn point_in_polygon(ring: &[[f64; 2]], lon: f64, lat: f64) -> bool {
    if distinct_vertex_count(ring) < 3 {
        return false;
    }
    let n = ring.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i][0], ring[i][1]);
        let (xj, yj) = (ring[j][0], ring[j][1]);
        if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Shortest distance in meters from a point to any edge of the ring
pub fn distance_to_ring_meters(ring: &[[f64; 2]], lon: f64, lat: f64) -> f64 {
    let kx = METERS_PER_DEGREE * lat.to_radians().cos();
    let ky = METERS_PER_DEGREE;
    let to_local = |p: &[f64; 2]| ((p[0] - lon) * kx, (p[1] - lat) * ky);

    if ring.len() == 1 {
        let (x, y) = to_local(&ring[0]);
        return x.hypot(y);
    }

    ring.windows(2)
        .map(|w| {
            let (ax, ay) = to_local(&w[0]);
            let (bx, by) = to_local(&w[1]);
            point_segment_distance(ax, ay, bx, by)
        })
        .fold(f64::INFINITY, f64::min)
}

/// Distance from the origin to segment A-B
fn point_segment_distance(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let (dx, dy) = (bx - ax, by - ay);
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return ax.hypot(ay);
    }
    let t = (-(ax * dx + ay * dy) / len2).clamp(0.0, 1.0);
    (ax + t * dx).hypot(ay + t * dy)
}

fn distinct_vertex_count(ring: &[[f64; 2]]) -> usize {
    let mut points: Vec<[f64; 2]> = ring.to_vec();
    points.sort_by(|a, b| {
        a[0].partial_cmp(&b[0])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a[1].partial_cmp(&b[1]).unwrap_or(std::cmp::Ordering::Equal))
    });
    points.dedup();
    points.len()
}
