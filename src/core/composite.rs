use crate::core::geometry::METERS_PER_DEGREE;
use crate::core::statistics::nearest_rank;
use crate::types::{
    Band, BoundingBox, CanopyError, CanopyResult, GeoTransform, ImageRecord, Raster, Scene,
};
use ndarray::Array2;
use std::borrow::Cow;
use std::collections::HashMap;

/// Upper bound on the pixels of a composite grid
pub const MAX_GRID_PIXELS: usize = 100_000_000;

/// North-up pixel grid a composite is computed on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetGrid {
    pub geo_transform: GeoTransform,
    pub dim: (usize, usize),
}

impl TargetGrid {
    /// Grid over a bounding box with pixels of about `scale_m` meters
    pub fn over(bounds: &BoundingBox, scale_m: f64) -> CanopyResult<Self> {
        if !(scale_m.is_finite() && scale_m > 0.0) {
            return Err(CanopyError::Validation(format!(
                "Scale must be a positive number of meters, got {}",
                scale_m
            )));
        }
        let (_, lat0) = bounds.center();
        let width_m = bounds.width() * METERS_PER_DEGREE * lat0.to_radians().cos();
        let height_m = bounds.height() * METERS_PER_DEGREE;
        let cols = (width_m / scale_m).ceil().max(1.0);
        let rows = (height_m / scale_m).ceil().max(1.0);
        if rows * cols > MAX_GRID_PIXELS as f64 {
            return Err(CanopyError::Processing(format!(
                "A {} m grid over the AOI needs {:.0} pixels, more than {}",
                scale_m,
                rows * cols,
                MAX_GRID_PIXELS
            )));
        }
        let dim = (rows as usize, cols as usize);
        Ok(Self {
            geo_transform: GeoTransform::covering(bounds, dim.0, dim.1),
            dim,
        })
    }

    /// Native grid of a scene
    pub fn of_scene(scene: &Scene) -> Option<Self> {
        scene.dim().map(|dim| Self {
            geo_transform: scene.geo_transform,
            dim,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.dim.0 * self.dim.1
    }
}

/// Nearest-neighbour resampling of a raster onto another grid
///
/// Target pixels whose centre falls outside the source raster are NaN.
pub fn resample(raster: &Raster, from: &GeoTransform, to: &TargetGrid) -> Raster {
    let source_dim = raster.dim();
    Array2::from_shape_fn(to.dim, |(r, c)| {
        let (lon, lat) = to.geo_transform.pixel_center(r, c);
        from.pixel_at(lon, lat, source_dim)
            .map(|(sr, sc)| raster[[sr, sc]])
            .unwrap_or(f32::NAN)
    })
}

/// Per-pixel median of every reflectance band shared by all scenes, on the
/// grid of the first scene
///
/// See [`median_composite_on`].
pub fn median_composite(scenes: &[Scene]) -> CanopyResult<Scene> {
    let first = scenes
        .first()
        .ok_or_else(|| CanopyError::Processing("Cannot composite an empty collection".to_string()))?;
    let grid = TargetGrid::of_scene(first)
        .ok_or_else(|| CanopyError::Processing(format!("Image {} has no bands", first.record.id)))?;
    median_composite_on(scenes, &grid)
}

/// Per-pixel median of every reflectance band shared by all scenes
///
/// Scenes not already on `grid` are resampled onto it, so overlapping tiles
/// with different footprints combine. NaN pixels are skipped; a pixel with
/// no finite value in any scene stays NaN. Cloud bands are not composited,
/// so mask clouds before calling this.
pub fn median_composite_on(scenes: &[Scene], grid: &TargetGrid) -> CanopyResult<Scene> {
    let (first, last) = match (scenes.first(), scenes.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(CanopyError::Processing(
                "Cannot composite an empty collection".to_string(),
            ))
        }
    };

    let bands: Vec<Band> = Band::REFLECTANCE
        .iter()
        .copied()
        .filter(|b| scenes.iter().all(|s| s.has_band(*b)))
        .collect();

    let resampled = scenes
        .iter()
        .filter(|s| s.geo_transform != grid.geo_transform || s.dim() != Some(grid.dim))
        .count();
    log::info!(
        "Median composite of {} images over {} bands on a {}x{} grid ({} resampled)",
        scenes.len(),
        bands.len(),
        grid.dim.0,
        grid.dim.1,
        resampled
    );

    #[cfg(feature = "parallel")]
    let composited: Vec<(Band, Raster)> = {
        use rayon::prelude::*;
        bands
            .par_iter()
            .map(|&band| (band, median_band(scenes, band, grid)))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let composited: Vec<(Band, Raster)> = bands
        .iter()
        .map(|&band| (band, median_band(scenes, band, grid)))
        .collect();

    let mean_cloud =
        scenes.iter().map(|s| s.record.effective_cloud_pct()).sum::<f64>() / scenes.len() as f64;
    let record = ImageRecord {
        id: format!("median_{}_{}", first.record.date, last.record.date),
        date: first.record.date,
        tile_cloud_pct: mean_cloud,
        aoi_cloud_pct: None,
    };

    Ok(Scene {
        record,
        geo_transform: grid.geo_transform,
        bands: composited.into_iter().collect::<HashMap<_, _>>(),
    })
}

fn on_grid<'a>(scene: &'a Scene, band: Band, grid: &TargetGrid) -> Option<Cow<'a, Raster>> {
    let raster = scene.band(band)?;
    if scene.geo_transform == grid.geo_transform && raster.dim() == grid.dim {
        Some(Cow::Borrowed(raster))
    } else {
        Some(Cow::Owned(resample(raster, &scene.geo_transform, grid)))
    }
}

fn median_band(scenes: &[Scene], band: Band, grid: &TargetGrid) -> Raster {
    let layers: Vec<Cow<'_, Raster>> = scenes.iter().filter_map(|s| on_grid(s, band, grid)).collect();
    let mut stack = Vec::with_capacity(layers.len());
    Array2::from_shape_fn(grid.dim, |(r, c)| {
        stack.clear();
        stack.extend(layers.iter().map(|l| l[[r, c]]).filter(|v| v.is_finite()));
        stack.sort_by(|a, b| a.total_cmp(b));
        nearest_rank(&stack, 0.5).unwrap_or(f32::NAN)
    })
}
