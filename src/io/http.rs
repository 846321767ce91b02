//! JSON gateway client for a hosted imagery compute service

use crate::core::geometry::{Aoi, AoiPayload};
use crate::io::platform::{ExportParams, ImageryPlatform, Reducer};
use crate::types::{
    Band, BoundingBox, CanopyError, CanopyResult, DateRange, GeoTransform, ImageRecord,
    IndexRaster, PixelSample, Raster, Scene, VegetationIndex,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const USER_AGENT: &str = concat!("canopy/", env!("CARGO_PKG_VERSION"));
const MAX_ATTEMPTS: usize = 3;

/// Raster as exchanged with the gateway; `null` marks a masked pixel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterPayload {
    pub rows: usize,
    pub cols: usize,
    pub geo_transform: GeoTransform,
    pub values: Vec<Option<f32>>,
}

impl RasterPayload {
    pub fn from_raster(data: &Raster, geo_transform: GeoTransform) -> Self {
        let (rows, cols) = data.dim();
        Self {
            rows,
            cols,
            geo_transform,
            values: data.iter().map(|v| v.is_finite().then_some(*v)).collect(),
        }
    }

    pub fn into_raster(self) -> CanopyResult<Raster> {
        let values: Vec<f32> = self.values.into_iter().map(|v| v.unwrap_or(f32::NAN)).collect();
        Array2::from_shape_vec((self.rows, self.cols), values)
            .map_err(|e| CanopyError::Platform(format!("Malformed raster payload: {}", e)))
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    bounds: &'a BoundingBox,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

#[derive(Serialize)]
struct SelectRequest<'a> {
    bands: &'a [Band],
}

#[derive(Deserialize)]
struct SelectResponse {
    geo_transform: GeoTransform,
    rows: usize,
    cols: usize,
    bands: HashMap<Band, Vec<Option<f32>>>,
}

#[derive(Serialize)]
struct IndexPayload {
    index: VegetationIndex,
    raster: RasterPayload,
}

#[derive(Serialize)]
struct ReduceRequest<'a> {
    image: IndexPayload,
    reducers: &'a [Reducer],
    region: AoiPayload,
    scale: f64,
    max_pixels: u64,
}

#[derive(Serialize)]
struct SampleRequest {
    image: IndexPayload,
    region: AoiPayload,
    scale: f64,
    num_pixels: usize,
    seed: u64,
}

#[derive(Serialize)]
struct ExportRequest<'a> {
    image: IndexPayload,
    params: &'a ExportParams,
}

#[derive(Deserialize)]
struct ExportResponse {
    url: String,
}

pub struct HttpPlatform {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPlatform {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> CanopyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CanopyError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    /// POST a JSON body, retrying transient failures
    async fn post<B, R>(&self, path: &str, body: &B) -> CanopyResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            log::debug!("POST {} attempt {} of {}", url, attempt, MAX_ATTEMPTS);
            match self.post_once(&url, body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    log::warn!("POST {} attempt {} failed: {}, retrying", url, attempt, e);
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CanopyError::Retryable(format!("POST {} failed after all retries", url))
        }))
    }

    async fn post_once<B, R>(&self, url: &str, body: &B) -> CanopyResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json::<R>().await?)
    }

    fn index_payload(raster: &IndexRaster) -> IndexPayload {
        IndexPayload {
            index: raster.index,
            raster: RasterPayload::from_raster(&raster.data, raster.geo_transform),
        }
    }
}

#[async_trait]
impl ImageryPlatform for HttpPlatform {
    async fn authenticate(&self) -> CanopyResult<()> {
        if self.api_key.is_none() {
            log::warn!("No platform key configured, connecting anonymously");
        }
        let _: serde_json::Value = self.post("session", &serde_json::json!({})).await?;
        log::info!("Authenticated with imagery gateway at {}", self.base_url);
        Ok(())
    }

    async fn filter_by_bounds_and_date(
        &self,
        bounds: &BoundingBox,
        range: &DateRange,
    ) -> CanopyResult<Vec<ImageRecord>> {
        let body = SearchRequest {
            bounds,
            start_date: range.start,
            end_date: range.end,
        };
        let mut records: Vec<ImageRecord> = self.post("images:search", &body).await?;
        records.sort_by_key(|r| r.date);
        Ok(records)
    }

    async fn select_bands(&self, image: &ImageRecord, bands: &[Band]) -> CanopyResult<Scene> {
        let path = format!("images/{}:select", image.id);
        let response: SelectResponse = self.post(&path, &SelectRequest { bands }).await?;

        let mut selected = HashMap::with_capacity(response.bands.len());
        for (band, values) in response.bands {
            let payload = RasterPayload {
                rows: response.rows,
                cols: response.cols,
                geo_transform: response.geo_transform,
                values,
            };
            selected.insert(band, payload.into_raster()?);
        }

        Ok(Scene {
            record: image.clone(),
            geo_transform: response.geo_transform,
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
        let body = ReduceRequest {
            image: Self::index_payload(raster),
            reducers,
            region: region.clone().into(),
            scale,
            max_pixels,
        };
        let values: BTreeMap<String, Option<f64>> = self.post("reduce", &body).await?;
        Ok(values
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    async fn sample(
        &self,
        raster: &IndexRaster,
        region: &Aoi,
        scale: f64,
        num_pixels: usize,
        seed: u64,
    ) -> CanopyResult<Vec<PixelSample>> {
        let body = SampleRequest {
            image: Self::index_payload(raster),
            region: region.clone().into(),
            scale,
            num_pixels,
            seed,
        };
        self.post("sample", &body).await
    }

    async fn download_url(&self, raster: &IndexRaster, params: &ExportParams) -> CanopyResult<String> {
        let body = ExportRequest {
            image: Self::index_payload(raster),
            params,
        };
        let response: ExportResponse = self.post("export", &body).await?;
        Ok(response.url)
    }
}
