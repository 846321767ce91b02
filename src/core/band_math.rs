use crate::types::{Band, IndexRaster, Scene, VegetationIndex};
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};

/// Soil brightness correction for SAVI
pub const SAVI_L: f32 = 0.5;
/// Soil adjustment constant for OSAVI
pub const OSAVI_Y: f32 = 0.16;
/// Denominators smaller than this mask the pixel
const EPS: f32 = 1e-10;
const MAX_INPUT_BANDS: usize = 3;

impl VegetationIndex {
    /// Bands read by the formula, in the order `evaluate` expects them
    pub fn required_bands(&self) -> &'static [Band] {
        match self {
            VegetationIndex::Ndvi => &[Band::Nir, Band::Red],
            VegetationIndex::Ndre => &[Band::Nir, Band::RedEdge1],
            VegetationIndex::Ndmi => &[Band::Nir, Band::Swir1],
            VegetationIndex::Mndwi => &[Band::Green, Band::Swir1],
            VegetationIndex::Gci => &[Band::Nir, Band::Green],
            VegetationIndex::Savi => &[Band::Nir, Band::Red],
            VegetationIndex::Osavi => &[Band::Nir, Band::Red],
            VegetationIndex::Msavi2 => &[Band::Nir, Band::Red],
            VegetationIndex::Pri => &[Band::RedEdge1, Band::RedEdge2],
            VegetationIndex::Msi => &[Band::Swir1, Band::Nir],
            VegetationIndex::Mcari => &[Band::RedEdge1, Band::Red, Band::Green],
            VegetationIndex::Tcari => &[Band::RedEdge1, Band::Red, Band::Green],
        }
    }
}

#[inline]
fn safe_div(num: f32, den: f32) -> f32 {
    if !num.is_finite() || !den.is_finite() || den.abs() < EPS {
        f32::NAN
    } else {
        num / den
    }
}

#[inline]
fn normalized_difference(a: f32, b: f32) -> f32 {
    safe_div(a - b, a + b)
}

/// Evaluate one index for a pixel; `px` follows `required_bands()`
pub fn evaluate(index: VegetationIndex, px: &[f32]) -> f32 {
    let value = match index {
        VegetationIndex::Ndvi
        | VegetationIndex::Ndre
        | VegetationIndex::Ndmi
        | VegetationIndex::Mndwi
        | VegetationIndex::Pri => normalized_difference(px[0], px[1]),
        VegetationIndex::Gci => safe_div(px[0], px[1]) - 1.0,
        VegetationIndex::Savi => {
            let (nir, red) = (px[0], px[1]);
            safe_div((nir - red) * (1.0 + SAVI_L), nir + red + SAVI_L)
        }
        VegetationIndex::Osavi => {
            let (nir, red) = (px[0], px[1]);
            safe_div(nir - red, nir + red + OSAVI_Y)
        }
        VegetationIndex::Msavi2 => {
            let (nir, red) = (px[0], px[1]);
            let a = 2.0 * nir + 1.0;
            let disc = a * a - 8.0 * (nir - red);
            if disc < 0.0 {
                f32::NAN
            } else {
                (a - disc.sqrt()) / 2.0
            }
        }
        VegetationIndex::Msi => safe_div(px[0], px[1]),
        VegetationIndex::Mcari => {
            let (re, red, green) = (px[0], px[1], px[2]);
            ((re - red) - 0.2 * (re - green)) * safe_div(re, green)
        }
        VegetationIndex::Tcari => {
            let (re, red, green) = (px[0], px[1], px[2]);
            3.0 * ((re - red) - 0.2 * (re - green) * safe_div(re, red))
        }
    };

    if value.is_finite() {
        value
    } else {
        f32::NAN
    }
}

/// Vegetation index calculator over reflectance scenes
pub struct BandMath;

impl BandMath {
    /// Compute the requested indices; indices with missing bands are omitted
    pub fn compute(
        scene: &Scene,
        indices: &BTreeSet<VegetationIndex>,
    ) -> BTreeMap<VegetationIndex, IndexRaster> {
        log::debug!(
            "Computing {} indices for image {}",
            indices.len(),
            scene.record.id
        );

        #[cfg(feature = "parallel")]
        let computed: Vec<(VegetationIndex, Option<IndexRaster>)> = {
            use rayon::prelude::*;
            indices
                .par_iter()
                .map(|&idx| (idx, Self::compute_index(scene, idx)))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let computed: Vec<(VegetationIndex, Option<IndexRaster>)> = indices
            .iter()
            .map(|&idx| (idx, Self::compute_index(scene, idx)))
            .collect();

        computed
            .into_iter()
            .filter_map(|(idx, raster)| raster.map(|r| (idx, r)))
            .collect()
    }

    /// Single index, `None` when a required band is missing or misaligned
    pub fn compute_index(scene: &Scene, index: VegetationIndex) -> Option<IndexRaster> {
        let mut inputs = Vec::with_capacity(MAX_INPUT_BANDS);
        for band in index.required_bands() {
            match scene.band(*band) {
                Some(raster) => inputs.push(raster),
                None => {
                    log::debug!(
                        "Skipping {} for image {}: band {} not available",
                        index,
                        scene.record.id,
                        band
                    );
                    return None;
                }
            }
        }

        let dim = inputs[0].dim();
        if inputs.iter().any(|r| r.dim() != dim) {
            log::warn!(
                "Skipping {} for image {}: band shapes differ",
                index,
                scene.record.id
            );
            return None;
        }

        let data = Array2::from_shape_fn(dim, |(r, c)| {
            let mut px = [0.0f32; MAX_INPUT_BANDS];
            for (k, raster) in inputs.iter().enumerate() {
                px[k] = raster[[r, c]];
            }
            evaluate(index, &px[..inputs.len()])
        });

        Some(IndexRaster {
            index,
            data,
            geo_transform: scene.geo_transform,
            date: Some(scene.record.date),
        })
    }
}
