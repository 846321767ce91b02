//! Request and response records of the index service
//!
//! Requests are validated once, when the service receives them. Optional
//! cloud settings fall back to the service configuration.

use crate::core::geometry::Aoi;
use crate::core::resolver::EscalationOutcome;
use crate::core::sampler::{CoordinateSystem, HeatmapCell, VisualizationParams};
use crate::core::statistics::{PeriodComparison, SeriesSummary, TimeInterval, TimeSeriesPoint};
use crate::types::{
    BoundingBox, CanopyError, CanopyResult, DateRange, PixelSample, Statistics, VegetationIndex,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_INTERACTIVE_SCALE: f64 = 30.0;
pub const DEFAULT_MAX_PIXELS: usize = 10_000;
pub const DEFAULT_GRID_SIZE: usize = 1_000;

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> CanopyResult<()> {
    if value < min || value > max {
        return Err(CanopyError::Validation(format!(
            "{} must be within {}-{}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

fn check_indices(indices: &[VegetationIndex]) -> CanopyResult<()> {
    if indices.is_empty() {
        return Err(CanopyError::Validation(
            "At least one index must be requested".to_string(),
        ));
    }
    Ok(())
}

/// Cloud filtering overrides shared by the collection-based requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudOptions {
    #[serde(default)]
    pub cloud_coverage: Option<f64>,
    #[serde(default)]
    pub use_aoi_cloud_filter: Option<bool>,
    #[serde(default)]
    pub cloud_buffer_meters: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCalculationRequest {
    pub aoi: Aoi,
    pub date_range: DateRange,
    pub indices: Vec<VegetationIndex>,
    #[serde(flatten)]
    pub cloud: CloudOptions,
    #[serde(default)]
    pub scale: Option<f64>,
}

impl IndexCalculationRequest {
    pub fn validate(&self) -> CanopyResult<()> {
        check_indices(&self.indices)?;
        if let Some(scale) = self.scale {
            check_range("scale", scale, 10.0, 1000.0)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationMetadata {
    pub image_count: usize,
    pub cloud_coverage: f64,
    pub use_aoi_cloud_filter: bool,
    pub cloud_buffer_meters: f64,
    pub scale: f64,
}

/// Per-index AOI means; an index missing from `results` could not be computed,
/// a `null` value means it was computed but no pixel was valid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCalculationResponse {
    pub aoi_name: Option<String>,
    pub date_range: DateRange,
    pub results: BTreeMap<VegetationIndex, Option<f64>>,
    pub metadata: CalculationMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRequest {
    pub aoi: Aoi,
    pub date_range: DateRange,
    pub index: VegetationIndex,
    #[serde(default)]
    pub interval: TimeInterval,
    #[serde(flatten)]
    pub cloud: CloudOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesResponse {
    pub index: VegetationIndex,
    pub aoi_name: Option<String>,
    pub date_range: DateRange,
    pub interval: TimeInterval,
    pub data: Vec<TimeSeriesPoint>,
    pub statistics: SeriesSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCoverageCheckRequest {
    pub aoi: Aoi,
    pub date_range: DateRange,
    #[serde(default)]
    pub max_cloud_coverage: Option<f64>,
    #[serde(default)]
    pub use_aoi_cloud_filter: Option<bool>,
    #[serde(default)]
    pub cloud_buffer_meters: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveRequest {
    pub aoi: Aoi,
    pub date: NaiveDate,
    pub index: VegetationIndex,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub max_pixels: Option<usize>,
}

impl InteractiveRequest {
    pub fn scale(&self) -> f64 {
        self.scale.unwrap_or(DEFAULT_INTERACTIVE_SCALE)
    }

    pub fn max_pixels(&self) -> usize {
        self.max_pixels.unwrap_or(DEFAULT_MAX_PIXELS)
    }

    pub fn validate(&self) -> CanopyResult<()> {
        check_range("scale", self.scale(), 10.0, 1000.0)?;
        check_range("max_pixels", self.max_pixels(), 100, 50_000)
    }
}

/// Image actually used for a single-date request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub image_id: String,
    pub aoi_cloud_coverage: Option<f64>,
    pub tile_cloud_coverage: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveDataResponse {
    pub date: NaiveDate,
    pub index: VegetationIndex,
    pub bounds: BoundingBox,
    pub pixel_data: Vec<PixelSample>,
    /// Finite AOI pixels before thinning to `max_pixels`
    pub total_pixels: usize,
    pub statistics: Statistics,
    pub visualization: VisualizationParams,
    pub coordinates: CoordinateSystem,
    pub metadata: SceneMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapRequest {
    pub aoi: Aoi,
    pub date: NaiveDate,
    pub index: VegetationIndex,
    #[serde(default)]
    pub grid_size: Option<usize>,
}

impl HeatmapRequest {
    pub fn grid_size(&self) -> usize {
        self.grid_size.unwrap_or(DEFAULT_GRID_SIZE)
    }

    pub fn validate(&self) -> CanopyResult<()> {
        check_range("grid_size", self.grid_size(), 100, 50_000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapDataResponse {
    pub date: NaiveDate,
    pub index: VegetationIndex,
    pub bounds: BoundingBox,
    pub grid: Vec<HeatmapCell>,
    pub aoi_boundary: Vec<[f64; 2]>,
    pub statistics: Statistics,
    pub visualization: VisualizationParams,
    pub coordinates: CoordinateSystem,
    pub metadata: SceneMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRequest {
    pub aoi: Aoi,
    pub date_range: DateRange,
    pub indices: Vec<VegetationIndex>,
    #[serde(flatten)]
    pub cloud: CloudOptions,
}

impl StatisticsRequest {
    pub fn validate(&self) -> CanopyResult<()> {
        check_indices(&self.indices)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub aoi_name: Option<String>,
    pub date_range: DateRange,
    pub statistics: BTreeMap<VegetationIndex, Statistics>,
    pub image_count: usize,
    pub cloud_coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareRequest {
    pub aoi: Aoi,
    pub baseline: DateRange,
    pub comparison: DateRange,
    pub indices: Vec<VegetationIndex>,
    #[serde(flatten)]
    pub cloud: CloudOptions,
}

impl CompareRequest {
    pub fn validate(&self) -> CanopyResult<()> {
        check_indices(&self.indices)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareResponse {
    pub baseline: DateRange,
    pub comparison: DateRange,
    pub indices: Vec<VegetationIndex>,
    pub changes: BTreeMap<VegetationIndex, PeriodComparison>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableDatesRequest {
    pub aoi: Aoi,
    pub date_range: DateRange,
    #[serde(flatten)]
    pub cloud: CloudOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    AoiFilter,
    TileFilter,
    /// AOI scoring found nothing and the tile-wide filter was used instead
    TileFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableDate {
    pub date: NaiveDate,
    pub image_id: String,
    pub cloud_coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableDatesResponse {
    pub dates: Vec<AvailableDate>,
    pub total_images: usize,
    pub source: DateSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub aoi: Aoi,
    pub date: NaiveDate,
    pub index: VegetationIndex,
    #[serde(default)]
    pub scale: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResponse {
    pub download_url: String,
    pub index: VegetationIndex,
    pub date: NaiveDate,
    pub file_format: String,
    pub metadata: SceneMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageryRequest {
    pub aoi: Aoi,
    pub date_range: DateRange,
    pub index: VegetationIndex,
    #[serde(flatten)]
    pub cloud: CloudOptions,
    /// End of the look-back windows, today when absent
    #[serde(default)]
    pub anchor_date: Option<NaiveDate>,
}

/// Best imagery found by the escalation ladder and its export, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSelection {
    pub index: VegetationIndex,
    pub requested_threshold: f64,
    pub threshold_used: Option<f64>,
    pub date: Option<NaiveDate>,
    pub export: Option<ExportResponse>,
    pub ladder: EscalationOutcome,
    /// Set when the chosen image exceeds the requested cloud threshold
    pub warning: Option<String>,
}
