//! Index service facade
//!
//! Every operation validates its request, resolves imagery through the
//! [`CollectionResolver`] and runs the in-process pipeline
//! (cloud masking, median compositing, band math) before reducing the result
//! into a response record.

use crate::config::ServiceConfig;
use crate::core::band_math::BandMath;
use crate::core::cloud_mask;
use crate::core::composite::{median_composite_on, TargetGrid};
use crate::core::geometry::Aoi;
use crate::core::resolver::{
    CollectionResolver, EscalationOutcome, ResolveParams, ResolvedCollectionCache,
};
use crate::core::sampler;
use crate::core::statistics::{self, REPORT_PERCENTILES};
use crate::io::http::HttpPlatform;
use crate::io::platform::{ExportParams, ImageryPlatform, PlatformClient, Reducer};
use crate::models::*;
use crate::types::{
    Band, CanopyError, CanopyResult, CloudCoverageResult, Collection, DateRange, ImageRecord,
    IndexRaster, Scene, Statistics, VegetationIndex,
};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Fixed so repeated interactive requests return the same pixels
const INTERACTIVE_SEED: u64 = 42;

/// Bands to fetch for a set of indices, cloud bands included
fn bands_for(indices: &BTreeSet<VegetationIndex>) -> Vec<Band> {
    let mut bands: BTreeSet<Band> = indices
        .iter()
        .flat_map(|idx| idx.required_bands().iter().copied())
        .collect();
    bands.extend(Band::CLOUD);
    bands.into_iter().collect()
}

pub struct IndexService {
    client: PlatformClient,
    config: ServiceConfig,
    cache: Option<ResolvedCollectionCache>,
}

impl IndexService {
    pub fn new(platform: Arc<dyn ImageryPlatform>, config: ServiceConfig) -> CanopyResult<Self> {
        config.validate()?;
        let client = PlatformClient::new(platform, config.platform_timeout());
        let cache = config.cache_collections.then(ResolvedCollectionCache::new);
        Ok(Self {
            client,
            config,
            cache,
        })
    }

    /// Service backed by the HTTP gateway named in the configuration
    pub fn from_config(config: ServiceConfig) -> CanopyResult<Self> {
        let url = config.platform_url.clone().ok_or_else(|| {
            CanopyError::Config("platform_url is required to reach the imagery gateway".to_string())
        })?;
        let platform = HttpPlatform::new(&url, config.platform_key.clone(), config.platform_timeout())?;
        Self::new(Arc::new(platform), config)
    }

    pub fn client(&self) -> &PlatformClient {
        &self.client
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&ResolvedCollectionCache> {
        self.cache.as_ref()
    }

    fn resolver(&self) -> CollectionResolver<'_> {
        let resolver = CollectionResolver::new(&self.client, &self.config.resolver);
        match &self.cache {
            Some(cache) => resolver.with_cache(cache),
            None => resolver,
        }
    }

    fn params(&self, cloud: &CloudOptions) -> ResolveParams {
        let defaults = ResolveParams::from_config(&self.config);
        ResolveParams {
            max_cloud_pct: cloud.cloud_coverage.unwrap_or(defaults.max_cloud_pct),
            use_aoi_filter: cloud.use_aoi_cloud_filter.unwrap_or(defaults.use_aoi_filter),
            buffer_meters: cloud.cloud_buffer_meters.unwrap_or(defaults.buffer_meters),
        }
    }

    /// Clear-sky scenes of a resolved collection with the given bands
    async fn masked_scenes(&self, collection: &Collection, bands: &[Band]) -> CanopyResult<Vec<Scene>> {
        let scenes = self.client.select_bands_many(&collection.images, bands).await?;
        Ok(scenes.iter().map(cloud_mask::mask_clouds).collect())
    }

    /// Index rasters over the cloud-masked median composite of the window
    async fn composite_indices(
        &self,
        aoi: &Aoi,
        range: &DateRange,
        params: &ResolveParams,
        indices: &[VegetationIndex],
        scale: f64,
    ) -> CanopyResult<(Collection, BTreeMap<VegetationIndex, IndexRaster>)> {
        let grid = TargetGrid::over(&aoi.bounds(), scale)?;
        let collection = self.resolver().resolve(aoi, range, params).await?;
        if collection.is_empty() {
            log::warn!("No imagery for {} at {}% cloud", range, params.max_cloud_pct);
            return Ok((collection, BTreeMap::new()));
        }

        let wanted: BTreeSet<VegetationIndex> = indices.iter().copied().collect();
        let scenes = self.masked_scenes(&collection, &bands_for(&wanted)).await?;
        let composite = median_composite_on(&scenes, &grid)?;

        let mut rasters = BandMath::compute(&composite, &wanted);
        for raster in rasters.values_mut() {
            raster.date = None;
        }
        log::info!(
            "Computed {} of {} indices over {} images",
            rasters.len(),
            wanted.len(),
            collection.len()
        );
        Ok((collection, rasters))
    }

    async fn composite_statistics(
        &self,
        aoi: &Aoi,
        range: &DateRange,
        params: &ResolveParams,
        indices: &[VegetationIndex],
    ) -> CanopyResult<(usize, BTreeMap<VegetationIndex, Statistics>)> {
        let (collection, rasters) = self
            .composite_indices(aoi, range, params, indices, self.config.default_scale)
            .await?;
        let stats = rasters
            .iter()
            .map(|(idx, raster)| (*idx, statistics::reduce(raster, aoi, &REPORT_PERCENTILES)))
            .collect();
        Ok((collection.len(), stats))
    }

    /// Least cloudy clear-sky scene acquired on `date`
    async fn scene_for_date(
        &self,
        aoi: &Aoi,
        date: NaiveDate,
        index: VegetationIndex,
    ) -> CanopyResult<(Scene, Option<f64>)> {
        let range = DateRange::single_day(date);
        range.validate_epoch(self.config.resolver.imagery_epoch)?;

        let records: Vec<ImageRecord> = self
            .client
            .filter_by_bounds_and_date(&aoi.bounds(), &range)
            .await?;
        if records.is_empty() {
            return Err(CanopyError::Processing(format!(
                "No images found for date {}",
                date
            )));
        }

        let bands = bands_for(&[index].into_iter().collect());
        let scenes = self.client.select_bands_many(&records, &bands).await?;
        let (scene, aoi_cloud) =
            cloud_mask::best_image(&scenes, aoi, self.config.cloud_buffer_meters).ok_or_else(
                || CanopyError::Processing(format!("No images found for date {}", date)),
            )?;
        log::info!(
            "Using image {} for {} (AOI cloud {:?}%)",
            scene.record.id,
            date,
            aoi_cloud
        );
        Ok((cloud_mask::mask_clouds(scene), aoi_cloud))
    }

    async fn index_for_date(
        &self,
        aoi: &Aoi,
        date: NaiveDate,
        index: VegetationIndex,
        scale: f64,
    ) -> CanopyResult<(IndexRaster, SceneMetadata)> {
        let (scene, aoi_cloud) = self.scene_for_date(aoi, date, index).await?;
        let raster = BandMath::compute_index(&scene, index).ok_or_else(|| {
            CanopyError::Processing(format!(
                "Image {} lacks the bands needed for {}",
                scene.record.id, index
            ))
        })?;
        let metadata = SceneMetadata {
            image_id: scene.record.id.clone(),
            aoi_cloud_coverage: aoi_cloud,
            tile_cloud_coverage: scene.record.tile_cloud_pct,
            scale,
        };
        Ok((raster, metadata))
    }

    /// Per-index AOI mean over the cloud-masked median composite
    pub async fn calculate_indices(
        &self,
        request: &IndexCalculationRequest,
    ) -> CanopyResult<IndexCalculationResponse> {
        request.validate()?;
        let params = self.params(&request.cloud);
        let scale = request.scale.unwrap_or(self.config.default_scale);
        log::info!(
            "Calculating {:?} for {} at {} m",
            request.indices,
            request.date_range,
            scale
        );

        let (collection, rasters) = self
            .composite_indices(&request.aoi, &request.date_range, &params, &request.indices, scale)
            .await?;

        let mut results = BTreeMap::new();
        for (idx, raster) in &rasters {
            let reduced = self
                .client
                .reduce_region(raster, &[Reducer::Mean], &request.aoi, scale, self.config.max_pixels)
                .await?;
            let mean = reduced.get(&format!("{}_mean", idx.name())).copied();
            if mean.is_none() {
                log::warn!("{} has no valid pixels inside the AOI", idx);
            }
            results.insert(*idx, mean);
        }

        Ok(IndexCalculationResponse {
            aoi_name: request.aoi.name().map(str::to_string),
            date_range: request.date_range,
            results,
            metadata: CalculationMetadata {
                image_count: collection.len(),
                cloud_coverage: params.max_cloud_pct,
                use_aoi_cloud_filter: params.use_aoi_filter,
                cloud_buffer_meters: params.buffer_meters,
                scale,
            },
        })
    }

    pub async fn get_time_series(&self, request: &TimeSeriesRequest) -> CanopyResult<TimeSeriesResponse> {
        let params = self.params(&request.cloud);
        let collection = self
            .resolver()
            .resolve(&request.aoi, &request.date_range, &params)
            .await?;

        let data = if collection.is_empty() {
            Vec::new()
        } else {
            let bands = bands_for(&[request.index].into_iter().collect());
            let scenes = self.masked_scenes(&collection, &bands).await?;
            let points = statistics::time_series(&scenes, &request.aoi, request.index);
            statistics::aggregate_by_interval(points, request.interval)
        };
        log::info!(
            "{} series for {}: {} points by {}",
            request.index,
            request.date_range,
            data.len(),
            request.interval
        );

        Ok(TimeSeriesResponse {
            index: request.index,
            aoi_name: request.aoi.name().map(str::to_string),
            date_range: request.date_range,
            interval: request.interval,
            statistics: statistics::series_summary(&data),
            data,
        })
    }

    pub async fn check_cloud_coverage(
        &self,
        request: &CloudCoverageCheckRequest,
    ) -> CanopyResult<CloudCoverageResult> {
        let params = self.params(&CloudOptions {
            cloud_coverage: request.max_cloud_coverage,
            use_aoi_cloud_filter: request.use_aoi_cloud_filter,
            cloud_buffer_meters: request.cloud_buffer_meters,
        });
        self.resolver()
            .check_cloud_coverage(&request.aoi, &request.date_range, params.max_cloud_pct, &params)
            .await
    }

    /// Bounded pixel samples of one date for scatter display
    pub async fn export_interactive(
        &self,
        request: &InteractiveRequest,
    ) -> CanopyResult<InteractiveDataResponse> {
        request.validate()?;
        let (raster, metadata) = self
            .index_for_date(&request.aoi, request.date, request.index, request.scale())
            .await?;

        let pixel_data = self
            .client
            .sample(
                &raster,
                &request.aoi,
                request.scale(),
                request.max_pixels(),
                INTERACTIVE_SEED,
            )
            .await?;
        let values = statistics::aoi_values(&raster, &request.aoi);
        log::info!(
            "Sampled {} of {} {} pixels for {}",
            pixel_data.len(),
            values.len(),
            request.index,
            request.date
        );

        Ok(InteractiveDataResponse {
            date: request.date,
            index: request.index,
            bounds: request.aoi.bounds(),
            pixel_data,
            total_pixels: values.len(),
            statistics: statistics::summarize(&values, &REPORT_PERCENTILES),
            visualization: sampler::visualization_params(request.index, &values),
            coordinates: sampler::axes(&raster),
            metadata,
        })
    }

    pub async fn export_heatmap(&self, request: &HeatmapRequest) -> CanopyResult<HeatmapDataResponse> {
        request.validate()?;
        let (raster, metadata) = self
            .index_for_date(&request.aoi, request.date, request.index, self.config.default_scale)
            .await?;

        let grid = sampler::heatmap(&raster, &request.aoi, request.grid_size());
        let values = statistics::aoi_values(&raster, &request.aoi);

        Ok(HeatmapDataResponse {
            date: request.date,
            index: request.index,
            bounds: request.aoi.bounds(),
            grid: grid.cells,
            aoi_boundary: request.aoi.ring().to_vec(),
            statistics: statistics::summarize(&values, &REPORT_PERCENTILES),
            visualization: sampler::visualization_params(request.index, &values),
            coordinates: grid.coordinates,
            metadata,
        })
    }

    pub async fn get_statistics(&self, request: &StatisticsRequest) -> CanopyResult<StatisticsResponse> {
        request.validate()?;
        let params = self.params(&request.cloud);
        let (image_count, stats) = self
            .composite_statistics(&request.aoi, &request.date_range, &params, &request.indices)
            .await?;

        Ok(StatisticsResponse {
            aoi_name: request.aoi.name().map(str::to_string),
            date_range: request.date_range,
            statistics: stats,
            image_count,
            cloud_coverage: params.max_cloud_pct,
        })
    }

    pub async fn compare_periods(&self, request: &CompareRequest) -> CanopyResult<CompareResponse> {
        request.validate()?;
        let params = self.params(&request.cloud);
        let (_, baseline) = self
            .composite_statistics(&request.aoi, &request.baseline, &params, &request.indices)
            .await?;
        let (_, comparison) = self
            .composite_statistics(&request.aoi, &request.comparison, &params, &request.indices)
            .await?;

        Ok(CompareResponse {
            baseline: request.baseline,
            comparison: request.comparison,
            indices: request.indices.clone(),
            changes: statistics::compare(&baseline, &comparison, &request.indices),
        })
    }

    /// Acquisition dates with usable imagery, lowest cloud per date
    pub async fn available_dates(
        &self,
        request: &AvailableDatesRequest,
    ) -> CanopyResult<AvailableDatesResponse> {
        let params = self.params(&request.cloud);
        let resolver = self.resolver();

        let (collection, source) = if params.use_aoi_filter {
            let scored = resolver.resolve(&request.aoi, &request.date_range, &params).await?;
            if scored.is_empty() {
                log::info!("AOI cloud filter found no dates, falling back to tile cloud");
                let tile = ResolveParams {
                    use_aoi_filter: false,
                    ..params
                };
                (
                    resolver.resolve(&request.aoi, &request.date_range, &tile).await?,
                    DateSource::TileFallback,
                )
            } else {
                (scored, DateSource::AoiFilter)
            }
        } else {
            (
                resolver.resolve(&request.aoi, &request.date_range, &params).await?,
                DateSource::TileFilter,
            )
        };

        let mut by_date: BTreeMap<NaiveDate, &ImageRecord> = BTreeMap::new();
        for record in collection.iter() {
            by_date
                .entry(record.date)
                .and_modify(|kept| {
                    if record.effective_cloud_pct() < kept.effective_cloud_pct() {
                        *kept = record;
                    }
                })
                .or_insert(record);
        }

        Ok(AvailableDatesResponse {
            dates: by_date
                .into_values()
                .map(|r| AvailableDate {
                    date: r.date,
                    image_id: r.id.clone(),
                    cloud_coverage: r.effective_cloud_pct(),
                })
                .collect(),
            total_images: collection.len(),
            source,
        })
    }

    /// Download URL of a single-date index map clipped to the AOI
    pub async fn export_index_map(&self, request: &ExportRequest) -> CanopyResult<ExportResponse> {
        let scale = request.scale.unwrap_or(self.config.default_scale);
        let (raster, metadata) = self
            .index_for_date(&request.aoi, request.date, request.index, scale)
            .await?;

        let params = ExportParams::geotiff(request.aoi.clone(), scale);
        let download_url = self.client.download_url(&raster, &params).await?;

        Ok(ExportResponse {
            download_url,
            index: request.index,
            date: request.date,
            file_format: params.format.to_string(),
            metadata,
        })
    }

    /// Walk the escalation ladder and export the recommended date when found
    pub async fn find_imagery(&self, request: &ImageryRequest) -> CanopyResult<ImageSelection> {
        let params = self.params(&request.cloud);
        let anchor = request
            .anchor_date
            .unwrap_or_else(|| chrono::Local::now().date_naive());

        let ladder = self
            .resolver()
            .find_suitable(&request.aoi, &request.date_range, &params, anchor)
            .await?;

        let (threshold_used, warning) = match &ladder {
            EscalationOutcome::Found {
                threshold,
                window_days,
                ..
            } => {
                let warning = match window_days {
                    Some(days) => Some(format!(
                        "No imagery in the requested window; using the last {} days at {}% cloud",
                        days, threshold
                    )),
                    None if *threshold > params.max_cloud_pct => Some(format!(
                        "No imagery at {}% cloud; relaxed to {}%",
                        params.max_cloud_pct, threshold
                    )),
                    None => None,
                };
                (Some(*threshold), warning)
            }
            EscalationOutcome::Exhausted { .. } => (
                None,
                Some("No suitable imagery found for this area".to_string()),
            ),
        };

        let date = ladder.result().recommended_date;
        let export = match (ladder.is_found(), date) {
            (true, Some(date)) => Some(
                self.export_index_map(&ExportRequest {
                    aoi: request.aoi.clone(),
                    date,
                    index: request.index,
                    scale: None,
                })
                .await?,
            ),
            _ => None,
        };

        Ok(ImageSelection {
            index: request.index,
            requested_threshold: params.max_cloud_pct,
            threshold_used,
            date,
            export,
            ladder,
            warning,
        })
    }
}
