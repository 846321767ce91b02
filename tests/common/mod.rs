//! Synthetic Sentinel-2 scenes around a ~1 km2 field near Casablanca
#![allow(dead_code)]

use canopy::core::geometry::Aoi;
use canopy::types::{Band, GeoTransform, ImageRecord, Scene};
use chrono::NaiveDate;
use ndarray::Array2;
use std::collections::HashMap;

pub const GRID: usize = 60;
pub const PIXEL_DEG: f64 = 0.0005;
pub const TOP_LEFT: (f64, f64) = (-7.52, 33.52);

/// Pixels of the field: columns 30..48, rows 22..40
pub const FIELD_PIXELS: usize = 18 * 18;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn field() -> Aoi {
    Aoi::new(
        vec![
            [-7.505, 33.500],
            [-7.505, 33.509],
            [-7.496, 33.509],
            [-7.496, 33.500],
        ],
        Some("field 7".to_string()),
    )
    .unwrap()
}

pub fn grid() -> GeoTransform {
    GeoTransform::north_up(TOP_LEFT.0, TOP_LEFT.1, PIXEL_DEG, PIXEL_DEG)
}

/// Where the clouds of a synthetic scene sit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sky {
    Clear,
    /// Overcast everywhere
    Overcast,
    /// Three cloudy columns just west of the field, inside a 300 m buffer
    CloudyNearby,
    /// Cloud bank about 1 km west of the field
    CloudyFarAway,
}

impl Sky {
    fn is_cloudy(&self, col: usize) -> bool {
        match self {
            Sky::Clear => false,
            Sky::Overcast => true,
            Sky::CloudyNearby => (27..30).contains(&col),
            Sky::CloudyFarAway => col < 10,
        }
    }
}

/// Scene with constant reflectance and QA60/SCL cloud layers
pub fn scene(id: &str, date: NaiveDate, tile_cloud: f64, sky: Sky, nir: f32, red: f32) -> Scene {
    let dim = (GRID, GRID);
    let mut bands: HashMap<Band, Array2<f32>> = [
        (Band::Green, 0.08),
        (Band::Red, red),
        (Band::RedEdge1, 0.20),
        (Band::RedEdge2, 0.30),
        (Band::Nir, nir),
        (Band::Swir1, 0.15),
    ]
    .into_iter()
    .map(|(b, v)| (b, Array2::from_elem(dim, v)))
    .collect();

    let qa = Array2::from_shape_fn(dim, |(_, c)| if sky.is_cloudy(c) { 1024.0 } else { 0.0 });
    let scl = Array2::from_shape_fn(dim, |(_, c)| if sky.is_cloudy(c) { 8.0 } else { 4.0 });
    bands.insert(Band::Qa60, qa);
    bands.insert(Band::Scl, scl);

    Scene {
        record: ImageRecord::new(id, date, tile_cloud),
        geo_transform: grid(),
        bands,
    }
}

pub fn clear(id: &str, date: NaiveDate, nir: f32, red: f32) -> Scene {
    scene(id, date, 5.0, Sky::Clear, nir, red)
}
