//! In-memory imagery archive
//!
//! Holds fully materialised scenes and serves them through the
//! [`ImageryPlatform`] contract. Used for offline runs and tests; exports are
//! kept in memory and addressed by `archive://exports/<n>` URLs.

use crate::core::geometry::Aoi;
use crate::core::sampler;
use crate::io::platform::{ExportParams, ImageryPlatform, Reducer};
use crate::types::{
    Band, BoundingBox, CanopyError, CanopyResult, DateRange, ImageRecord, IndexRaster,
    PixelSample, Scene,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

pub const EXPORT_URL_PREFIX: &str = "archive://exports/";

#[derive(Default)]
pub struct ArchivePlatform {
    scenes: RwLock<Vec<Scene>>,
    exports: Mutex<Vec<IndexRaster>>,
    failures: Mutex<VecDeque<CanopyError>>,
    latency: Option<Duration>,
    auth_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl ArchivePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scenes(scenes: Vec<Scene>) -> Self {
        Self {
            scenes: RwLock::new(scenes),
            ..Self::default()
        }
    }

    /// Delay every search, to exercise caller timeouts
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, scene: Scene) -> CanopyResult<()> {
        let mut guard = self
            .scenes
            .write()
            .map_err(|_| CanopyError::Platform("Archive lock poisoned".to_string()))?;
        log::debug!("Archiving image {} ({})", scene.record.id, scene.record.date);
        guard.push(scene);
        Ok(())
    }

    /// Fail the next search with `error`; queued failures are consumed in order
    pub fn fail_next_search(&self, error: CanopyError) {
        if let Ok(mut queue) = self.failures.lock() {
            queue.push_back(error);
        }
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Raster previously exported through `download_url`
    pub fn fetch_export(&self, url: &str) -> CanopyResult<IndexRaster> {
        let n: usize = url
            .strip_prefix(EXPORT_URL_PREFIX)
            .and_then(|rest| rest.parse().ok())
            .ok_or_else(|| CanopyError::Validation(format!("Not an archive export URL: {}", url)))?;
        let exports = self
            .exports
            .lock()
            .map_err(|_| CanopyError::Platform("Export store lock poisoned".to_string()))?;
        exports
            .get(n)
            .cloned()
            .ok_or_else(|| CanopyError::Platform(format!("Export {} not found", url)))
    }

    fn region_values(raster: &IndexRaster, region: &Aoi) -> Vec<(f64, f64, f64)> {
        let gt = raster.geo_transform;
        let mut values = Vec::new();
        for ((row, col), &v) in raster.data.indexed_iter() {
            if !v.is_finite() {
                continue;
            }
            let (lon, lat) = gt.pixel_center(row, col);
            if region.contains(lon, lat) {
                values.push((lon, lat, v as f64));
            }
        }
        values
    }
}

#[async_trait]
impl ImageryPlatform for ArchivePlatform {
    async fn authenticate(&self) -> CanopyResult<()> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        log::debug!("Archive platform authenticated");
        Ok(())
    }

    async fn filter_by_bounds_and_date(
        &self,
        bounds: &BoundingBox,
        range: &DateRange,
    ) -> CanopyResult<Vec<ImageRecord>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .failures
            .lock()
            .map_err(|_| CanopyError::Platform("Failure queue lock poisoned".to_string()))?
            .pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let scenes = self
            .scenes
            .read()
            .map_err(|_| CanopyError::Platform("Archive lock poisoned".to_string()))?;
        let mut records: Vec<ImageRecord> = scenes
            .iter()
            .filter(|s| range.contains(s.record.date))
            .filter(|s| match s.dim() {
                Some(dim) => s.geo_transform.bounds(dim).intersects(bounds),
                None => false,
            })
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

        log::debug!("Archive search {} matched {} images", range, records.len());
        Ok(records)
    }

    async fn select_bands(&self, image: &ImageRecord, bands: &[Band]) -> CanopyResult<Scene> {
        let scenes = self
            .scenes
            .read()
            .map_err(|_| CanopyError::Platform("Archive lock poisoned".to_string()))?;
        let scene = scenes
            .iter()
            .find(|s| s.record.id == image.id)
            .ok_or_else(|| CanopyError::Platform(format!("Image {} not in archive", image.id)))?;

        let mut selected = HashMap::with_capacity(bands.len());
        for band in bands {
            match scene.band(*band) {
                Some(raster) => {
                    selected.insert(*band, raster.clone());
                }
                None => log::debug!("Image {} has no band {}", image.id, band),
            }
        }

        Ok(Scene {
            record: image.clone(),
            geo_transform: scene.geo_transform,
            bands: selected,
        })
    }

    async fn reduce_region(
        &self,
        raster: &IndexRaster,
        reducers: &[Reducer],
        region: &Aoi,
        scale: f64,
        max_pixels: u64,
    ) -> CanopyResult<BTreeMap<String, f64>> {
        let values: Vec<f64> = Self::region_values(raster, region)
            .into_iter()
            .map(|(_, _, v)| v)
            .collect();
        if values.len() as u64 > max_pixels {
            return Err(CanopyError::Platform(format!(
                "Region has {} pixels at {} m, more than max_pixels {}",
                values.len(),
                scale,
                max_pixels
            )));
        }

        let band = raster.index.name();
        Ok(reducers
            .iter()
            .flat_map(|r| r.apply(band, &values))
            .collect())
    }

    async fn sample(
        &self,
        raster: &IndexRaster,
        region: &Aoi,
        _scale: f64,
        num_pixels: usize,
        seed: u64,
    ) -> CanopyResult<Vec<PixelSample>> {
        Ok(sampler::sample_seeded(raster, region, num_pixels, seed).samples)
    }

    async fn download_url(&self, raster: &IndexRaster, params: &ExportParams) -> CanopyResult<String> {
        let mut clipped = raster.clone();
        let gt = clipped.geo_transform;
        for ((row, col), v) in clipped.data.indexed_iter_mut() {
            let (lon, lat) = gt.pixel_center(row, col);
            if !params.region.contains(lon, lat) {
                *v = f32::NAN;
            }
        }

        let mut exports = self
            .exports
            .lock()
            .map_err(|_| CanopyError::Platform("Export store lock poisoned".to_string()))?;
        exports.push(clipped);
        let url = format!("{}{}", EXPORT_URL_PREFIX, exports.len() - 1);
        log::info!(
            "Exported {} at {} m ({}) to {}",
            raster.index,
            params.scale,
            params.crs,
            url
        );
        Ok(url)
    }
}
