//! Bounded pixel sampling and polygon-filtered heatmap grids for visualisation

use crate::core::geometry::{Aoi, METERS_PER_DEGREE};
use crate::core::statistics::nearest_rank;
use crate::types::{BoundingBox, IndexRaster, PixelSample, VegetationIndex};
use serde::{Deserialize, Serialize};

/// Axis metadata of a sampled grid
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CoordinateSystem {
    pub lon_step: f64,
    pub lat_step: f64,
    /// Longitudes of the column centres, west to east
    pub x_axis: Vec<f64>,
    /// Latitudes of the row centres, south to north
    pub y_axis: Vec<f64>,
}

/// One heatmap cell; `i` indexes `x_axis`, `j` indexes `y_axis`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatmapCell {
    pub i: usize,
    pub j: usize,
    pub lon: f64,
    pub lat: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heatmap {
    pub cells: Vec<HeatmapCell>,
    pub coordinates: CoordinateSystem,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelSampleSet {
    pub samples: Vec<PixelSample>,
    /// Finite pixels inside the AOI before thinning
    pub candidates: usize,
    pub coordinates: CoordinateSystem,
}

/// Colour ramp and display range for an index layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationParams {
    pub min: f64,
    pub max: f64,
    pub palette: Vec<String>,
}

const VEGETATION_PALETTE: [&str; 5] = ["#d73027", "#fc8d59", "#fee08b", "#91cf60", "#1a9850"];
const WATER_PALETTE: [&str; 5] = ["#8c510a", "#d8b365", "#f6e8c3", "#5ab4ac", "#01665e"];
const STRESS_PALETTE: [&str; 5] = ["#1a9850", "#91cf60", "#fee08b", "#fc8d59", "#d73027"];

pub fn palette(index: VegetationIndex) -> &'static [&'static str] {
    match index {
        VegetationIndex::Ndmi | VegetationIndex::Mndwi => &WATER_PALETTE,
        VegetationIndex::Msi => &STRESS_PALETTE,
        _ => &VEGETATION_PALETTE,
    }
}

/// Display range from the 2nd and 98th percentiles of the values
pub fn visualization_params(index: VegetationIndex, values: &[f64]) -> VisualizationParams {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let (min, max) = match (nearest_rank(&sorted, 0.02), nearest_rank(&sorted, 0.98)) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => (-1.0, 1.0),
    };
    VisualizationParams {
        min,
        max,
        palette: palette(index).iter().map(|c| c.to_string()).collect(),
    }
}

/// Finite AOI pixels of the raster, thinned to at most `max_pixels` by an even stride
pub fn sample(raster: &IndexRaster, aoi: &Aoi, max_pixels: usize) -> PixelSampleSet {
    sample_seeded(raster, aoi, max_pixels, 0)
}

/// [`sample`] with the stride phase chosen by `seed`
pub fn sample_seeded(raster: &IndexRaster, aoi: &Aoi, max_pixels: usize, seed: u64) -> PixelSampleSet {
    let gt = raster.geo_transform;
    let candidates: Vec<PixelSample> = raster
        .data
        .indexed_iter()
        .filter(|(_, v)| v.is_finite())
        .filter_map(|((row, col), v)| {
            let (lon, lat) = gt.pixel_center(row, col);
            aoi.contains(lon, lat).then(|| PixelSample {
                lon,
                lat,
                value: *v as f64,
            })
        })
        .collect();

    let total = candidates.len();
    let samples = if total <= max_pixels {
        candidates
    } else if max_pixels == 0 {
        Vec::new()
    } else {
        let offset = (seed as usize) % (total / max_pixels);
        (0..max_pixels)
            .map(|k| candidates[k * total / max_pixels + offset])
            .collect()
    };

    log::debug!(
        "Sampled {} of {} {} pixels inside AOI",
        samples.len(),
        total,
        raster.index
    );

    PixelSampleSet {
        samples,
        candidates: total,
        coordinates: axes(raster),
    }
}

/// Pixel-centre axes of a raster
pub fn axes(raster: &IndexRaster) -> CoordinateSystem {
    let (rows, cols) = raster.dim();
    let gt = raster.geo_transform;
    let x_axis = (0..cols).map(|c| gt.pixel_center(0, c).0).collect();
    let y_axis = (0..rows).rev().map(|r| gt.pixel_center(r, 0).1).collect();
    CoordinateSystem {
        lon_step: gt.pixel_width.abs(),
        lat_step: gt.pixel_height.abs(),
        x_axis,
        y_axis,
    }
}

/// Grid dimensions `(cols, rows)` holding about `grid_size` cells over the box
pub fn grid_shape(bounds: &BoundingBox, grid_size: usize) -> (usize, usize) {
    let (_, lat0) = bounds.center();
    let width_m = bounds.width() * METERS_PER_DEGREE * lat0.to_radians().cos();
    let height_m = bounds.height() * METERS_PER_DEGREE;
    let aspect = if width_m > 0.0 && height_m > 0.0 {
        width_m / height_m
    } else {
        1.0
    };
    let target = grid_size.max(1) as f64;
    let cols = (target * aspect).sqrt().round().max(1.0) as usize;
    let rows = (target / cols as f64).round().max(1.0) as usize;
    (cols, rows)
}

/// Regular grid over the AOI bounding box, keeping cells inside the polygon
/// whose nearest raster pixel holds a finite value
pub fn heatmap(raster: &IndexRaster, aoi: &Aoi, grid_size: usize) -> Heatmap {
    let bounds = aoi.bounds();
    let (cols, rows) = grid_shape(&bounds, grid_size);
    let lon_step = bounds.width() / cols as f64;
    let lat_step = bounds.height() / rows as f64;

    let x_axis: Vec<f64> = (0..cols)
        .map(|i| bounds.min_lon + (i as f64 + 0.5) * lon_step)
        .collect();
    let y_axis: Vec<f64> = (0..rows)
        .map(|j| bounds.min_lat + (j as f64 + 0.5) * lat_step)
        .collect();

    let mut cells = Vec::new();
    for (j, &lat) in y_axis.iter().enumerate() {
        for (i, &lon) in x_axis.iter().enumerate() {
            if !aoi.contains(lon, lat) {
                continue;
            }
            if let Some(value) = raster.value_at(lon, lat) {
                cells.push(HeatmapCell {
                    i,
                    j,
                    lon,
                    lat,
                    value: value as f64,
                });
            }
        }
    }

    log::debug!(
        "Heatmap {}x{} for {}: {} cells inside AOI",
        cols,
        rows,
        raster.index,
        cells.len()
    );

    Heatmap {
        cells,
        coordinates: CoordinateSystem {
            lon_step,
            lat_step,
            x_axis,
            y_axis,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::Array2;

    fn square() -> Aoi {
        Aoi::new(
            vec![[-7.50, 33.50], [-7.50, 33.51], [-7.49, 33.51], [-7.49, 33.50]],
            None,
        )
        .unwrap()
    }

    fn ndvi(data: Array2<f32>, gt: GeoTransform) -> IndexRaster {
        IndexRaster {
            index: VegetationIndex::Ndvi,
            data,
            geo_transform: gt,
            date: None,
        }
    }

    #[test]
    fn test_sample_is_bounded_and_inside() {
        let aoi = square();
        let gt = GeoTransform::covering(&aoi.bounds(), 50, 50);
        let raster = ndvi(Array2::from_shape_fn((50, 50), |(r, c)| (r * 50 + c) as f32), gt);

        let all = sample(&raster, &aoi, 10_000);
        assert_eq!(all.samples.len(), 2500);
        assert_eq!(all.candidates, 2500);

        let thinned = sample(&raster, &aoi, 100);
        assert_eq!(thinned.samples.len(), 100);
        assert!(thinned.samples.iter().all(|s| aoi.contains(s.lon, s.lat)));
        assert_eq!(thinned.samples, sample(&raster, &aoi, 100).samples);
        assert_eq!(thinned.coordinates.x_axis.len(), 50);

        // 2500 / 100 leaves a stride of 25, so seeds shift the phase
        let shifted = sample_seeded(&raster, &aoi, 100, 3);
        assert_eq!(shifted.samples.len(), 100);
        assert_ne!(shifted.samples, thinned.samples);
        assert_eq!(shifted.samples, sample_seeded(&raster, &aoi, 100, 28).samples);
    }

    #[test]
    fn test_sample_skips_masked_pixels() {
        let aoi = square();
        let gt = GeoTransform::covering(&aoi.bounds(), 4, 4);
        let mut data = Array2::from_elem((4, 4), 0.5f32);
        data[[0, 0]] = f32::NAN;
        data[[3, 3]] = f32::INFINITY;
        let result = sample(&ndvi(data, gt), &aoi, 100);
        assert_eq!(result.samples.len(), 14);
        assert!(result.samples.iter().all(|s| s.value == 0.5));
    }

    #[test]
    fn test_grid_shape_follows_aspect() {
        let wide = BoundingBox { min_lon: 0.0, max_lon: 0.04, min_lat: 0.0, max_lat: 0.01 };
        let (cols, rows) = grid_shape(&wide, 1000);
        assert!(cols > rows);
        assert!((cols * rows) as f64 > 900.0 && ((cols * rows) as f64) < 1100.0);

        let point = BoundingBox { min_lon: 1.0, max_lon: 1.0, min_lat: 1.0, max_lat: 1.0 };
        assert_eq!(grid_shape(&point, 0), (1, 1));
    }

    #[test]
    fn test_heatmap_cells_inside_polygon() {
        let triangle = Aoi::new(vec![[0.0, 0.0], [0.0, 0.01], [0.01, 0.0]], None).unwrap();
        let gt = GeoTransform::covering(&triangle.bounds(), 20, 20);
        let raster = ndvi(Array2::from_elem((20, 20), 0.7), gt);

        let map = heatmap(&raster, &triangle, 400);
        assert_eq!(map.coordinates.x_axis.len(), 20);
        assert_eq!(map.coordinates.y_axis.len(), 20);
        assert!(!map.cells.is_empty());
        assert!(map.cells.len() < 400);
        for cell in &map.cells {
            assert!(triangle.contains(cell.lon, cell.lat));
            assert_eq!(cell.lon, map.coordinates.x_axis[cell.i]);
            assert_eq!(cell.lat, map.coordinates.y_axis[cell.j]);
        }
    }

    #[test]
    fn test_visualization_range() {
        let values: Vec<f64> = (0..=100).map(|v| v as f64 / 100.0).collect();
        let params = visualization_params(VegetationIndex::Ndvi, &values);
        assert_eq!(params.min, 0.02);
        assert_eq!(params.max, 0.98);
        assert_eq!(params.palette.len(), 5);

        let empty = visualization_params(VegetationIndex::Ndmi, &[]);
        assert_eq!((empty.min, empty.max), (-1.0, 1.0));
        assert_eq!(empty.palette[0], WATER_PALETTE[0]);
    }
}
