use chrono::{Duration, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Single-band raster of 32-bit values, NaN marks a masked pixel
pub type Raster = Array2<f32>;

/// Vegetation and moisture indices derived from Sentinel-2 reflectance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VegetationIndex {
    Ndvi,
    Ndre,
    Ndmi,
    Mndwi,
    Gci,
    Savi,
    Osavi,
    Msavi2,
    Pri,
    Msi,
    Mcari,
    Tcari,
}

impl VegetationIndex {
    pub const ALL: [VegetationIndex; 12] = [
        VegetationIndex::Ndvi,
        VegetationIndex::Ndre,
        VegetationIndex::Ndmi,
        VegetationIndex::Mndwi,
        VegetationIndex::Gci,
        VegetationIndex::Savi,
        VegetationIndex::Osavi,
        VegetationIndex::Msavi2,
        VegetationIndex::Pri,
        VegetationIndex::Msi,
        VegetationIndex::Mcari,
        VegetationIndex::Tcari,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            VegetationIndex::Ndvi => "NDVI",
            VegetationIndex::Ndre => "NDRE",
            VegetationIndex::Ndmi => "NDMI",
            VegetationIndex::Mndwi => "MNDWI",
            VegetationIndex::Gci => "GCI",
            VegetationIndex::Savi => "SAVI",
            VegetationIndex::Osavi => "OSAVI",
            VegetationIndex::Msavi2 => "MSAVI2",
            VegetationIndex::Pri => "PRI",
            VegetationIndex::Msi => "MSI",
            VegetationIndex::Mcari => "MCARI",
            VegetationIndex::Tcari => "TCARI",
        }
    }
}

impl fmt::Display for VegetationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for VegetationIndex {
    type Err = CanopyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        VegetationIndex::ALL
            .iter()
            .copied()
            .find(|idx| idx.name() == upper)
            .ok_or_else(|| CanopyError::Validation(format!("Unknown vegetation index: {}", s)))
    }
}

/// Sentinel-2 L2A bands used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Band {
    #[serde(rename = "B2")]
    Blue,
    #[serde(rename = "B3")]
    Green,
    #[serde(rename = "B4")]
    Red,
    #[serde(rename = "B5")]
    RedEdge1,
    #[serde(rename = "B6")]
    RedEdge2,
    #[serde(rename = "B7")]
    RedEdge3,
    #[serde(rename = "B8")]
    Nir,
    #[serde(rename = "B8A")]
    NirNarrow,
    #[serde(rename = "B11")]
    Swir1,
    #[serde(rename = "B12")]
    Swir2,
    /// Quality bitmask, bit 10 opaque cloud, bit 11 cirrus
    #[serde(rename = "QA60")]
    Qa60,
    /// Scene classification layer
    #[serde(rename = "SCL")]
    Scl,
}

impl Band {
    pub const REFLECTANCE: [Band; 10] = [
        Band::Blue,
        Band::Green,
        Band::Red,
        Band::RedEdge1,
        Band::RedEdge2,
        Band::RedEdge3,
        Band::Nir,
        Band::NirNarrow,
        Band::Swir1,
        Band::Swir2,
    ];

    pub const CLOUD: [Band; 2] = [Band::Qa60, Band::Scl];

    pub fn name(&self) -> &'static str {
        match self {
            Band::Blue => "B2",
            Band::Green => "B3",
            Band::Red => "B4",
            Band::RedEdge1 => "B5",
            Band::RedEdge2 => "B6",
            Band::RedEdge3 => "B7",
            Band::Nir => "B8",
            Band::NirNarrow => "B8A",
            Band::Swir1 => "B11",
            Band::Swir2 => "B12",
            Band::Qa60 => "QA60",
            Band::Scl => "SCL",
        }
    }

    pub fn is_reflectance(&self) -> bool {
        !matches!(self, Band::Qa60 | Band::Scl)
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Band {
    type Err = CanopyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Band::REFLECTANCE
            .iter()
            .chain(Band::CLOUD.iter())
            .copied()
            .find(|band| band.name() == upper)
            .ok_or_else(|| CanopyError::Validation(format!("Unknown band: {}", s)))
    }
}

/// Geospatial bounding box in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Smallest box containing every vertex, `None` for an empty slice
    pub fn from_points(points: &[[f64; 2]]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = BoundingBox {
            min_lon: first[0],
            max_lon: first[0],
            min_lat: first[1],
            max_lat: first[1],
        };
        for p in &points[1..] {
            bbox.min_lon = bbox.min_lon.min(p[0]);
            bbox.max_lon = bbox.max_lon.max(p[0]);
            bbox.min_lat = bbox.min_lat.min(p[1]);
            bbox.max_lat = bbox.max_lat.max(p[1]);
        }
        Some(bbox)
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
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

    /// Grow the box by the given margins in degrees
    pub fn expanded(&self, lon_margin: f64, lat_margin: f64) -> BoundingBox {
        BoundingBox {
            min_lon: self.min_lon - lon_margin,
            max_lon: self.max_lon + lon_margin,
            min_lat: self.min_lat - lat_margin,
            max_lat: self.max_lat + lat_margin,
        }
    }
}

/// Geospatial transformation parameters (GDAL ordering, EPSG:4326 degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up grid; `pixel_height` is given as a positive size and stored negated
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    /// Grid of `rows x cols` pixels covering a bounding box
    pub fn covering(bbox: &BoundingBox, rows: usize, cols: usize) -> Self {
        Self::north_up(
            bbox.min_lon,
            bbox.max_lat,
            bbox.width() / cols.max(1) as f64,
            bbox.height() / rows.max(1) as f64,
        )
    }

    /// Longitude/latitude of a pixel centre
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let x = col as f64 + 0.5;
        let y = row as f64 + 0.5;
        (
            self.top_left_x + x * self.pixel_width + y * self.rotation_x,
            self.top_left_y + x * self.rotation_y + y * self.pixel_height,
        )
    }

    /// Pixel containing a coordinate, `None` outside a `rows x cols` grid
    pub fn pixel_at(&self, lon: f64, lat: f64, dims: (usize, usize)) -> Option<(usize, usize)> {
        if self.pixel_width == 0.0 || self.pixel_height == 0.0 {
            return None;
        }
        let col = ((lon - self.top_left_x) / self.pixel_width).floor();
        let row = ((lat - self.top_left_y) / self.pixel_height).floor();
        if row < 0.0 || col < 0.0 || row >= dims.0 as f64 || col >= dims.1 as f64 {
            return None;
        }
        Some((row as usize, col as usize))
    }

    pub fn bounds(&self, dims: (usize, usize)) -> BoundingBox {
        let (rows, cols) = (dims.0 as f64, dims.1 as f64);
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + cols * self.pixel_width;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + rows * self.pixel_height;
        BoundingBox {
            min_lon: x0.min(x1),
            max_lon: x0.max(x1),
            min_lat: y0.min(y1),
            max_lat: y0.max(y1),
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

/// Calendar date window, start inclusive and end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(rename = "start_date")]
    pub start: NaiveDate,
    #[serde(rename = "end_date")]
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> CanopyResult<Self> {
        if start >= end {
            return Err(CanopyError::Validation(format!(
                "Invalid date range: start date {} must be before end date {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `YYYY-MM-DD` strings
    pub fn parse(start: &str, end: &str) -> CanopyResult<Self> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    /// Window of `days` days ending at `anchor`
    pub fn ending_at(anchor: NaiveDate, days: i64) -> CanopyResult<Self> {
        Self::new(anchor - Duration::days(days), anchor)
    }

    /// Single-day window starting at `date`
    pub fn single_day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date + Duration::days(1),
        }
    }

    pub fn validate_epoch(&self, epoch: NaiveDate) -> CanopyResult<()> {
        if self.start >= self.end {
            return Err(CanopyError::Validation(format!(
                "Invalid date range: start date {} must be before end date {}",
                self.start, self.end
            )));
        }
        if self.start < epoch {
            return Err(CanopyError::Validation(format!(
                "Invalid date range: start date cannot be before {} (imagery epoch)",
                epoch.format("%Y-%m-%d")
            )));
        }
        Ok(())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

pub fn parse_date(value: &str) -> CanopyResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
        CanopyError::Validation(format!(
            "Invalid date format '{}', use YYYY-MM-DD: {}",
            value, e
        ))
    })
}

/// One candidate image from the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub date: NaiveDate,
    /// Tile-wide cloud percentage as reported by the archive
    pub tile_cloud_pct: f64,
    /// Cloud percentage measured inside the AOI, set by cloud scoring
    #[serde(default)]
    pub aoi_cloud_pct: Option<f64>,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>, date: NaiveDate, tile_cloud_pct: f64) -> Self {
        Self {
            id: id.into(),
            date,
            tile_cloud_pct,
            aoi_cloud_pct: None,
        }
    }

    /// AOI-scoped cloud percentage when known, tile-wide otherwise
    pub fn effective_cloud_pct(&self) -> f64 {
        self.aoi_cloud_pct.unwrap_or(self.tile_cloud_pct)
    }
}

/// Ordered set of candidate images
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub images: Vec<ImageRecord>,
}

impl Collection {
    pub fn new(mut images: Vec<ImageRecord>) -> Self {
        images.sort_by_key(|img| img.date);
        Self { images }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ImageRecord> {
        self.images.iter()
    }
}

/// Image record with fetched pixel data
#[derive(Debug, Clone)]
pub struct Scene {
    pub record: ImageRecord,
    pub geo_transform: GeoTransform,
    pub bands: HashMap<Band, Raster>,
}

impl Scene {
    pub fn band(&self, band: Band) -> Option<&Raster> {
        self.bands.get(&band)
    }

    pub fn has_band(&self, band: Band) -> bool {
        self.bands.contains_key(&band)
    }

    /// Grid shape shared by all bands, `None` when the scene has no bands
    pub fn dim(&self) -> Option<(usize, usize)> {
        self.bands.values().next().map(|b| b.dim())
    }
}

/// Computed index raster, never mutated after creation
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRaster {
    pub index: VegetationIndex,
    pub data: Raster,
    pub geo_transform: GeoTransform,
    pub date: Option<NaiveDate>,
}

impl IndexRaster {
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.geo_transform.bounds(self.data.dim())
    }

    /// Value of the pixel containing a coordinate, `None` outside or masked
    pub fn value_at(&self, lon: f64, lat: f64) -> Option<f32> {
        let (row, col) = self.geo_transform.pixel_at(lon, lat, self.data.dim())?;
        let value = self.data[[row, col]];
        value.is_finite().then_some(value)
    }
}

/// Pixel-level sample for visualisation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelSample {
    pub lon: f64,
    pub lat: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value: f64,
}

/// Scalar summary of an index over a region
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p10: f64,
    pub p25: f64,
    pub p75: f64,
    pub p90: f64,
    pub std: f64,
    pub count: usize,
    /// Extra percentiles requested by the caller
    #[serde(default)]
    pub percentiles: Vec<PercentileValue>,
}

impl Statistics {
    /// All-zero sentinel for regions without valid pixels
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|pv| (pv.percentile - p).abs() < 1e-9)
            .map(|pv| pv.value)
    }
}

/// Outcome of a cloud availability check over a date window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCoverageResult {
    pub has_suitable_images: bool,
    pub available_images_count: usize,
    pub suitable_images_count: usize,
    pub min_cloud_coverage: Option<f64>,
    pub max_cloud_coverage: Option<f64>,
    pub avg_cloud_coverage: Option<f64>,
    pub recommended_date: Option<NaiveDate>,
    pub cloud_percentages: Vec<f64>,
    pub max_cloud_threshold: f64,
    pub date_range: DateRange,
}

impl CloudCoverageResult {
    /// Result for a window without any imagery
    pub fn empty(date_range: DateRange, max_cloud_threshold: f64) -> Self {
        Self {
            has_suitable_images: false,
            available_images_count: 0,
            suitable_images_count: 0,
            min_cloud_coverage: None,
            max_cloud_coverage: None,
            avg_cloud_coverage: None,
            recommended_date: None,
            cloud_percentages: Vec::new(),
            max_cloud_threshold,
            date_range,
        }
    }
}

/// Error types for the imagery pipeline
#[derive(Debug, thiserror::Error)]
pub enum CanopyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Retryable platform error: {0}")]
    Retryable(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl CanopyError {
    /// Whether the escalation ladder may move past this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, CanopyError::Retryable(_))
    }
}

impl From<reqwest::Error> for CanopyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return CanopyError::Retryable(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                CanopyError::Retryable(e.to_string())
            }
            _ => CanopyError::Platform(e.to_string()),
        }
    }
}

impl From<toml::de::Error> for CanopyError {
    fn from(e: toml::de::Error) -> Self {
        CanopyError::Config(e.to_string())
    }
}

/// Result type for pipeline operations
pub type CanopyResult<T> = Result<T, CanopyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_names_round_trip() {
        for idx in VegetationIndex::ALL {
            assert_eq!(idx.name().parse::<VegetationIndex>().unwrap(), idx);
        }
        assert!("EVI".parse::<VegetationIndex>().is_err());
        assert_eq!(
            serde_json::to_string(&VegetationIndex::Msavi2).unwrap(),
            "\"MSAVI2\""
        );
    }

    #[test]
    fn test_date_range_validation() {
        assert!(DateRange::parse("2024-05-01", "2024-06-01").is_ok());
        assert!(DateRange::parse("2024-06-01", "2024-05-01").is_err());
        assert!(DateRange::parse("2024-06-01", "2024-06-01").is_err());
        assert!(DateRange::parse("2024/06/01", "2024-07-01").is_err());

        let epoch = NaiveDate::from_ymd_opt(2015, 6, 23).unwrap();
        let early = DateRange::parse("2015-01-01", "2015-12-31").unwrap();
        assert!(matches!(
            early.validate_epoch(epoch),
            Err(CanopyError::Validation(_))
        ));
    }

    #[test]
    fn test_geo_transform_pixel_lookup() {
        let gt = GeoTransform::north_up(-7.5, 33.51, 0.001, 0.001);
        let (lon, lat) = gt.pixel_center(0, 0);
        assert!((lon - -7.4995).abs() < 1e-9);
        assert!((lat - 33.5095).abs() < 1e-9);
        assert_eq!(gt.pixel_at(lon, lat, (10, 10)), Some((0, 0)));
        assert_eq!(gt.pixel_at(-7.6, 33.505, (10, 10)), None);

        let bounds = gt.bounds((10, 10));
        assert!((bounds.min_lat - 33.50).abs() < 1e-9);
        assert!((bounds.max_lon - -7.49).abs() < 1e-9);
    }

    #[test]
    fn test_error_classification() {
        assert!(CanopyError::Retryable("timeout".into()).is_retryable());
        assert!(!CanopyError::Validation("bad".into()).is_retryable());
    }
}
