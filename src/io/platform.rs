//! Remote imagery compute platform contract and the shared client handle
//!
//! Every call made through [`PlatformClient`] is bounded by the configured
//! timeout; an expired call surfaces as [`CanopyError::Retryable`].

use crate::core::geometry::Aoi;
use crate::core::statistics::nearest_rank;
use crate::types::{
    Band, BoundingBox, CanopyError, CanopyResult, DateRange, ImageRecord, IndexRaster,
    PixelSample, Scene,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Region reducers understood by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Mean,
    StdDev,
    /// Percentiles in percent, e.g. `[2.0, 50.0, 98.0]`
    Percentile(Vec<f64>),
    Count,
    Sum,
    MinMax,
}

impl Reducer {
    /// Reduce finite values into named outputs (`<band>_mean`, `<band>_p50`, ...)
    ///
    /// Percentiles use the nearest-rank rule. Empty inputs only produce a count.
    pub fn apply(&self, band: &str, values: &[f64]) -> Vec<(String, f64)> {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let n = finite.len();
        if n == 0 {
            return match self {
                Reducer::Count => vec![(format!("{}_count", band), 0.0)],
                Reducer::Sum => vec![(format!("{}_sum", band), 0.0)],
                _ => Vec::new(),
            };
        }

        match self {
            Reducer::Mean => vec![(format!("{}_mean", band), finite.iter().sum::<f64>() / n as f64)],
            Reducer::StdDev => {
                let mean = finite.iter().sum::<f64>() / n as f64;
                let sq = finite.iter().fold(0.0, |acc, v| acc + (v - mean) * (v - mean));
                vec![(format!("{}_stdDev", band), (sq / n as f64).sqrt())]
            }
            Reducer::Percentile(ps) => {
                let mut sorted = finite;
                sorted.sort_by(|a, b| a.total_cmp(b));
                ps.iter()
                    .filter_map(|p| {
                        nearest_rank(&sorted, p / 100.0).map(|v| (format!("{}_p{}", band, p), v))
                    })
                    .collect()
            }
            Reducer::Count => vec![(format!("{}_count", band), n as f64)],
            Reducer::Sum => vec![(format!("{}_sum", band), finite.iter().sum())],
            Reducer::MinMax => {
                let (min, max) = finite
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                vec![(format!("{}_min", band), min), (format!("{}_max", band), max)]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    #[serde(rename = "GeoTIFF")]
    GeoTiff,
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportFormat::GeoTiff => write!(f, "GeoTIFF"),
        }
    }
}

/// Parameters of a raster export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportParams {
    pub scale: f64,
    pub crs: String,
    pub format: ExportFormat,
    pub region: Aoi,
}

impl ExportParams {
    /// GeoTIFF in EPSG:4326 clipped to the region
    pub fn geotiff(region: Aoi, scale: f64) -> Self {
        Self {
            scale,
            crs: "EPSG:4326".to_string(),
            format: ExportFormat::GeoTiff,
            region,
        }
    }
}

/// Remote compute platform holding the Sentinel-2 archive
#[async_trait]
pub trait ImageryPlatform: Send + Sync {
    /// Establish credentials; run once per client
    async fn authenticate(&self) -> CanopyResult<()>;

    /// Candidate images intersecting the bounds within the date window
    async fn filter_by_bounds_and_date(
        &self,
        bounds: &BoundingBox,
        range: &DateRange,
    ) -> CanopyResult<Vec<ImageRecord>>;

    async fn collection_size(&self, records: &[ImageRecord]) -> CanopyResult<usize> {
        Ok(records.len())
    }

    /// Fetch the requested bands of one image; unavailable bands are left out
    async fn select_bands(&self, image: &ImageRecord, bands: &[Band]) -> CanopyResult<Scene>;

    async fn reduce_region(
        &self,
        raster: &IndexRaster,
        reducers: &[Reducer],
        region: &Aoi,
        scale: f64,
        max_pixels: u64,
    ) -> CanopyResult<BTreeMap<String, f64>>;

    async fn sample(
        &self,
        raster: &IndexRaster,
        region: &Aoi,
        scale: f64,
        num_pixels: usize,
        seed: u64,
    ) -> CanopyResult<Vec<PixelSample>>;

    async fn download_url(&self, raster: &IndexRaster, params: &ExportParams) -> CanopyResult<String>;
}

/// Shared handle to a platform with one-time authentication and call timeouts
pub struct PlatformClient {
    platform: Arc<dyn ImageryPlatform>,
    timeout: Duration,
    connected: OnceCell<()>,
}

impl PlatformClient {
    pub fn new(platform: Arc<dyn ImageryPlatform>, timeout: Duration) -> Self {
        Self {
            platform,
            timeout,
            connected: OnceCell::new(),
        }
    }

    pub fn platform(&self) -> &Arc<dyn ImageryPlatform> {
        &self.platform
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.connected.initialized()
    }

    /// Authenticate once; later calls return immediately
    pub async fn connect(&self) -> CanopyResult<()> {
        self.connected
            .get_or_try_init(|| async {
                log::info!("Connecting to imagery platform");
                self.timed("authenticate", self.platform.authenticate()).await
            })
            .await
            .map(|_| ())
    }

    async fn timed<T, F>(&self, operation: &str, call: F) -> CanopyResult<T>
    where
        F: Future<Output = CanopyResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Platform call {} timed out after {:?}", operation, self.timeout);
                Err(CanopyError::Retryable(format!(
                    "{} timed out after {:?}",
                    operation, self.timeout
                )))
            }
        }
    }

    pub async fn filter_by_bounds_and_date(
        &self,
        bounds: &BoundingBox,
        range: &DateRange,
    ) -> CanopyResult<Vec<ImageRecord>> {
        self.connect().await?;
        self.timed(
            "filter_by_bounds_and_date",
            self.platform.filter_by_bounds_and_date(bounds, range),
        )
        .await
    }

    pub async fn collection_size(&self, records: &[ImageRecord]) -> CanopyResult<usize> {
        self.connect().await?;
        self.timed("collection_size", self.platform.collection_size(records))
            .await
    }

    pub async fn select_bands(&self, image: &ImageRecord, bands: &[Band]) -> CanopyResult<Scene> {
        self.connect().await?;
        self.timed("select_bands", self.platform.select_bands(image, bands))
            .await
    }

    /// Fetch several images in order
    pub async fn select_bands_many(
        &self,
        images: &[ImageRecord],
        bands: &[Band],
    ) -> CanopyResult<Vec<Scene>> {
        let mut scenes = Vec::with_capacity(images.len());
        for image in images {
            scenes.push(self.select_bands(image, bands).await?);
        }
        Ok(scenes)
    }

    pub async fn reduce_region(
        &self,
        raster: &IndexRaster,
        reducers: &[Reducer],
        region: &Aoi,
        scale: f64,
        max_pixels: u64,
    ) -> CanopyResult<BTreeMap<String, f64>> {
        self.connect().await?;
        self.timed(
            "reduce_region",
            self.platform
                .reduce_region(raster, reducers, region, scale, max_pixels),
        )
        .await
    }

    pub async fn sample(
        &self,
        raster: &IndexRaster,
        region: &Aoi,
        scale: f64,
        num_pixels: usize,
        seed: u64,
    ) -> CanopyResult<Vec<PixelSample>> {
        self.connect().await?;
        self.timed(
            "sample",
            self.platform.sample(raster, region, scale, num_pixels, seed),
        )
        .await
    }

    pub async fn download_url(
        &self,
        raster: &IndexRaster,
        params: &ExportParams,
    ) -> CanopyResult<String> {
        self.connect().await?;
        self.timed("download_url", self.platform.download_url(raster, params))
            .await
    }
}
