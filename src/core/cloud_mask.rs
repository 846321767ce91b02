//! AOI-scoped cloud scoring from the QA60 bitmask and scene classification
//!
//! A pixel counts as cloud when QA60 bit 10 (opaque) or bit 11 (cirrus) is
//! set, or when the SCL band classifies it as cloud shadow, medium or high
//! probability cloud, or thin cirrus.

use crate::core::geometry::Aoi;
use crate::types::{Band, ImageRecord, Scene};
use ndarray::{Array2, Zip};

pub const QA60_OPAQUE_BIT: u32 = 1 << 10;
pub const QA60_CIRRUS_BIT: u32 = 1 << 11;

/// SCL classes counted as cloud: shadow, cloud medium, cloud high, cirrus
pub const SCL_CLOUD_CLASSES: [i32; 4] = [3, 8, 9, 10];
pub const SCL_NO_DATA: i32 = 0;
pub const SCL_SATURATED: i32 = 1;

/// Cloud buffer applied around the AOI unless the caller overrides it
pub const DEFAULT_BUFFER_METERS: f64 = 300.0;

/// Cloud test for one pixel; `scl` is `None` when the scene has no SCL band
pub fn is_cloud_pixel(qa: f32, scl: Option<f32>) -> bool {
    let qa_cloud =
        qa.is_finite() && qa >= 0.0 && ((qa as u32) & (QA60_OPAQUE_BIT | QA60_CIRRUS_BIT)) != 0;
    let scl_cloud = scl
        .filter(|v| v.is_finite())
        .map(|v| SCL_CLOUD_CLASSES.contains(&(v.round() as i32)))
        .unwrap_or(false);
    qa_cloud || scl_cloud
}

fn is_valid_pixel(qa: f32, scl: Option<f32>) -> bool {
    qa.is_finite()
        && match scl {
            Some(v) => v.is_finite() && v.round() as i32 != SCL_NO_DATA,
            None => true,
        }
}

/// SCL band aligned with QA60, `None` when absent or on a different grid
fn aligned_scl(scene: &Scene, dim: (usize, usize)) -> Option<&Array2<f32>> {
    let scl = scene.band(Band::Scl)?;
    if scl.dim() != dim {
        log::warn!(
            "Ignoring SCL for image {}: shape {:?} differs from QA60 {:?}",
            scene.record.id,
            scl.dim(),
            dim
        );
        return None;
    }
    Some(scl)
}

/// Cloud percentage over valid pixels whose centre lies in the (buffered) AOI
///
/// Returns `None` when the scene has no QA60 band or no valid pixel falls in
/// the region. The result is always within `[0, 100]`.
pub fn cloud_fraction(scene: &Scene, aoi: &Aoi, buffer_meters: Option<f64>) -> Option<f64> {
    let qa = match scene.band(Band::Qa60) {
        Some(qa) => qa,
        None => {
            log::debug!("Image {} has no QA60 band", scene.record.id);
            return None;
        }
    };
    let scl = aligned_scl(scene, qa.dim());
    let region = aoi.buffered(buffer_meters.unwrap_or(0.0));
    let gt = scene.geo_transform;

    let mut valid = 0usize;
    let mut cloudy = 0usize;
    for ((row, col), &qa_val) in qa.indexed_iter() {
        let (lon, lat) = gt.pixel_center(row, col);
        if !region.contains(lon, lat) {
            continue;
        }
        let scl_val = scl.map(|s| s[[row, col]]);
        if !is_valid_pixel(qa_val, scl_val) {
            continue;
        }
        valid += 1;
        if is_cloud_pixel(qa_val, scl_val) {
            cloudy += 1;
        }
    }

    if valid == 0 {
        log::debug!("Image {}: no valid pixels in region", scene.record.id);
        return None;
    }

    let fraction = (cloudy as f64 / valid as f64 * 100.0).clamp(0.0, 100.0);
    log::debug!(
        "Image {}: {:.2}% cloud over {} valid pixels (buffer {} m)",
        scene.record.id,
        fraction,
        valid,
        region.buffer_meters()
    );
    Some(fraction)
}

/// AOI cloud fraction of every scene, in input order
pub fn cloud_fractions(scenes: &[Scene], aoi: &Aoi, buffer_meters: f64) -> Vec<Option<f64>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        scenes
            .par_iter()
            .map(|scene| cloud_fraction(scene, aoi, Some(buffer_meters)))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        scenes
            .iter()
            .map(|scene| cloud_fraction(scene, aoi, Some(buffer_meters)))
            .collect()
    }
}

/// Tag each record with its AOI cloud percentage and keep those at or below `max_pct`
///
/// Scenes whose fraction is undefined are dropped.
pub fn filter_by_aoi_cloud(
    scenes: &[Scene],
    aoi: &Aoi,
    max_pct: f64,
    buffer_meters: f64,
) -> Vec<ImageRecord> {
    let scores = cloud_fractions(scenes, aoi, buffer_meters);

    let kept: Vec<ImageRecord> = scenes
        .iter()
        .zip(scores)
        .filter_map(|(scene, score)| {
            let pct = score?;
            (pct <= max_pct).then(|| {
                let mut record = scene.record.clone();
                record.aoi_cloud_pct = Some(pct);
                record
            })
        })
        .collect();

    log::info!(
        "AOI cloud filter kept {} of {} images at <= {}% (buffer {} m)",
        kept.len(),
        scenes.len(),
        max_pct,
        buffer_meters
    );
    kept
}

/// Lowest-cloud scene by AOI fraction, undefined fractions ranked last
pub fn best_image<'a>(
    scenes: &'a [Scene],
    aoi: &Aoi,
    buffer_meters: f64,
) -> Option<(&'a Scene, Option<f64>)> {
    let mut ranked: Vec<(&Scene, Option<f64>)> = scenes
        .iter()
        .zip(cloud_fractions(scenes, aoi, buffer_meters))
        .collect();

    ranked.sort_by(|a, b| match (a.1, b.1) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    ranked.into_iter().next()
}

/// Copy of the scene with cloudy, no-data and saturated pixels set to NaN
/// in every reflectance band
pub fn mask_clouds(scene: &Scene) -> Scene {
    let dim = match scene.dim() {
        Some(dim) => dim,
        None => return scene.clone(),
    };
    let qa = scene.band(Band::Qa60).filter(|qa| qa.dim() == dim);
    let scl = scene.band(Band::Scl).filter(|scl| scl.dim() == dim);

    let mut masked = Array2::from_elem(dim, false);
    if let Some(qa) = qa {
        Zip::from(&mut masked).and(qa).for_each(|m, &q| {
            *m |= is_cloud_pixel(q, None);
        });
    }
    if let Some(scl) = scl {
        Zip::from(&mut masked).and(scl).for_each(|m, &s| {
            let class = s.round() as i32;
            *m |= !s.is_finite()
                || class == SCL_NO_DATA
                || class == SCL_SATURATED
                || SCL_CLOUD_CLASSES.contains(&class);
        });
    }

    let mut out = scene.clone();
    for (band, raster) in out.bands.iter_mut() {
        if !band.is_reflectance() || raster.dim() != dim {
            continue;
        }
        Zip::from(raster).and(&masked).for_each(|v, &m| {
            if m {
                *v = f32::NAN;
            }
        });
    }
    log::debug!(
        "Masked {} of {} pixels in image {}",
        masked.iter().filter(|&&m| m).count(),
        dim.0 * dim.1,
        scene.record.id
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    const OPAQUE: f32 = 1024.0;
    const CIRRUS: f32 = 2048.0;

    fn aoi() -> Aoi {
        Aoi::new(
            vec![[-7.50, 33.50], [-7.50, 33.51], [-7.49, 33.51], [-7.49, 33.50]],
            None,
        )
        .unwrap()
    }

    /// 20x20 grid of 0.001 degree pixels centred on the AOI with a 0.005 margin
    fn scene(day: u32, qa: Array2<f32>, scl: Option<Array2<f32>>) -> Scene {
        let mut bands = HashMap::new();
        bands.insert(Band::Qa60, qa);
        if let Some(scl) = scl {
            bands.insert(Band::Scl, scl);
        }
        bands.insert(Band::Nir, Array2::from_elem((20, 20), 0.4));
        Scene {
            record: ImageRecord::new(
                format!("IMG_{:02}", day),
                NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
                50.0,
            ),
            geo_transform: GeoTransform::north_up(-7.505, 33.515, 0.001, 0.001),
            bands,
        }
    }

    #[test]
    fn test_cloud_bits_and_classes() {
        assert!(is_cloud_pixel(OPAQUE, None));
        assert!(is_cloud_pixel(CIRRUS, None));
        assert!(!is_cloud_pixel(0.0, None));
        assert!(!is_cloud_pixel(512.0, None));
        assert!(is_cloud_pixel(0.0, Some(3.0)));
        assert!(is_cloud_pixel(0.0, Some(9.0)));
        assert!(!is_cloud_pixel(0.0, Some(4.0)));
        assert!(!is_cloud_pixel(f32::NAN, None));
    }

    #[test]
    fn test_fraction_counts_only_region_pixels() {
        // Cloud everywhere outside the AOI, clear inside
        let gt = GeoTransform::north_up(-7.505, 33.515, 0.001, 0.001);
        let region = aoi();
        let qa = Array2::from_shape_fn((20, 20), |(r, c)| {
            let (lon, lat) = gt.pixel_center(r, c);
            if region.contains(lon, lat) {
                0.0
            } else {
                OPAQUE
            }
        });
        let s = scene(15, qa, None);
        assert_eq!(cloud_fraction(&s, &region, None), Some(0.0));

        let buffered = cloud_fraction(&s, &region, Some(300.0)).unwrap();
        assert!(buffered > 0.0 && buffered <= 100.0);
    }

    #[test]
    fn test_fraction_bounds_and_undefined() {
        let region = aoi();
        let half = Array2::from_shape_fn((20, 20), |(_, c)| if c < 10 { OPAQUE } else { 0.0 });
        let pct = cloud_fraction(&scene(1, half, None), &region, Some(DEFAULT_BUFFER_METERS)).unwrap();
        assert!((0.0..=100.0).contains(&pct));

        let no_data = Array2::from_elem((20, 20), f32::NAN);
        assert_eq!(cloud_fraction(&scene(2, no_data, None), &region, None), None);

        let scl_no_data = Array2::from_elem((20, 20), 0.0);
        let s = scene(3, Array2::zeros((20, 20)), Some(scl_no_data));
        assert_eq!(cloud_fraction(&s, &region, None), None);
    }

    #[test]
    fn test_filter_and_best_image() {
        let region = aoi();
        let scenes = vec![
            scene(5, Array2::from_elem((20, 20), OPAQUE), None),
            scene(15, Array2::zeros((20, 20)), None),
            scene(25, Array2::from_elem((20, 20), f32::NAN), None),
        ];

        let kept = filter_by_aoi_cloud(&scenes, &region, 10.0, DEFAULT_BUFFER_METERS);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "IMG_15");
        assert_eq!(kept[0].aoi_cloud_pct, Some(0.0));

        let (best, pct) = best_image(&scenes, &region, DEFAULT_BUFFER_METERS).unwrap();
        assert_eq!(best.record.id, "IMG_15");
        assert_eq!(pct, Some(0.0));

        let undefined_only = vec![scene(25, Array2::from_elem((20, 20), f32::NAN), None)];
        let (best, pct) = best_image(&undefined_only, &region, 0.0).unwrap();
        assert_eq!(best.record.id, "IMG_25");
        assert_eq!(pct, None);
    }

    #[test]
    fn test_mask_clouds_sets_reflectance_nan() {
        let qa = Array2::from_shape_fn((20, 20), |(r, _)| if r == 0 { OPAQUE } else { 0.0 });
        let scl = Array2::from_shape_fn((20, 20), |(r, _)| if r == 1 { 1.0 } else { 4.0 });
        let masked = mask_clouds(&scene(10, qa, Some(scl)));

        let nir = masked.band(Band::Nir).unwrap();
        assert!(nir.row(0).iter().all(|v| v.is_nan()));
        assert!(nir.row(1).iter().all(|v| v.is_nan()));
        assert!(nir.row(2).iter().all(|v| *v == 0.4));
        // QA band itself is untouched
        assert_eq!(masked.band(Band::Qa60).unwrap()[[0, 0]], OPAQUE);
    }
}
