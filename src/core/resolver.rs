//! Resolution of usable imagery for an AOI and date window
//!
//! [`CollectionResolver::resolve`] narrows the archive to the images whose
//! cloud cover meets the threshold. When nothing qualifies,
//! [`CollectionResolver::find_suitable`] walks the escalation ladder: the
//! requested threshold, the relaxed thresholds of the [`EscalationPolicy`],
//! then look-back windows ending at an anchor date.

use crate::config::{EscalationPolicy, ResolverConfig, ServiceConfig, SuitabilityRule};
use crate::core::cloud_mask;
use crate::core::geometry::Aoi;
use crate::io::platform::PlatformClient;
use crate::types::{
    Band, CanopyError, CanopyResult, CloudCoverageResult, Collection, DateRange, ImageRecord,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Cloud filtering parameters of one resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolveParams {
    pub max_cloud_pct: f64,
    /// Score clouds inside the AOI instead of trusting the tile-wide figure
    pub use_aoi_filter: bool,
    pub buffer_meters: f64,
}

impl Default for ResolveParams {
    fn default() -> Self {
        Self {
            max_cloud_pct: 10.0,
            use_aoi_filter: true,
            buffer_meters: cloud_mask::DEFAULT_BUFFER_METERS,
        }
    }
}

impl ResolveParams {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_cloud_pct: config.max_cloud_coverage,
            use_aoi_filter: config.use_aoi_cloud_filter,
            buffer_meters: config.cloud_buffer_meters,
        }
    }

    pub fn with_max_cloud(mut self, max_cloud_pct: f64) -> Self {
        self.max_cloud_pct = max_cloud_pct;
        self
    }

    pub fn validate(&self) -> CanopyResult<()> {
        if !(0.0..=100.0).contains(&self.max_cloud_pct) {
            return Err(CanopyError::Validation(format!(
                "Cloud threshold must be within 0-100, got {}",
                self.max_cloud_pct
            )));
        }
        if !self.buffer_meters.is_finite() || self.buffer_meters < 0.0 {
            return Err(CanopyError::Validation(format!(
                "Cloud buffer must be a non-negative distance, got {}",
                self.buffer_meters
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    aoi: u64,
    start: NaiveDate,
    end: NaiveDate,
    max_cloud_bits: u64,
    use_aoi_filter: bool,
    buffer_bits: u64,
}

impl CacheKey {
    fn new(aoi: &Aoi, range: &DateRange, params: &ResolveParams) -> Self {
        Self {
            aoi: aoi.fingerprint(),
            start: range.start,
            end: range.end,
            max_cloud_bits: params.max_cloud_pct.to_bits(),
            use_aoi_filter: params.use_aoi_filter,
            buffer_bits: params.buffer_meters.to_bits(),
        }
    }
}

/// Resolved collections keyed on the AOI, date window and every cloud parameter
#[derive(Default)]
pub struct ResolvedCollectionCache {
    entries: Mutex<HashMap<CacheKey, Collection>>,
}

impl ResolvedCollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, aoi: &Aoi, range: &DateRange, params: &ResolveParams) -> Option<Collection> {
        let entries = self.entries.lock().ok()?;
        entries.get(&CacheKey::new(aoi, range, params)).cloned()
    }

    pub fn insert(&self, aoi: &Aoi, range: &DateRange, params: &ResolveParams, collection: Collection) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(CacheKey::new(aoi, range, params), collection);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Result of one ladder step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum StepStatus {
    Suitable,
    Unsuitable,
    /// Transient platform failure, the ladder moved on
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderStep {
    pub threshold: f64,
    pub date_range: DateRange,
    /// Look-back window length, `None` for the caller's own window
    pub window_days: Option<i64>,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EscalationOutcome {
    Found {
        result: CloudCoverageResult,
        threshold: f64,
        window_days: Option<i64>,
        attempts: Vec<LadderStep>,
    },
    Exhausted {
        result: CloudCoverageResult,
        attempts: Vec<LadderStep>,
    },
}

impl EscalationOutcome {
    pub fn result(&self) -> &CloudCoverageResult {
        match self {
            EscalationOutcome::Found { result, .. } | EscalationOutcome::Exhausted { result, .. } => result,
        }
    }

    pub fn attempts(&self) -> &[LadderStep] {
        match self {
            EscalationOutcome::Found { attempts, .. }
            | EscalationOutcome::Exhausted { attempts, .. } => attempts,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, EscalationOutcome::Found { .. })
    }
}

/// Planned ladder steps as `(threshold, window, window_days)`
///
/// Relaxed thresholds at or below the requested one are skipped. Look-back
/// windows end on (and include) the anchor date and never start before the
/// imagery epoch.
pub fn ladder_plan(
    policy: &EscalationPolicy,
    requested: f64,
    range: &DateRange,
    anchor: NaiveDate,
    epoch: NaiveDate,
) -> Vec<(f64, DateRange, Option<i64>)> {
    let mut plan = vec![(requested, *range, None)];
    plan.extend(
        policy
            .cloud_thresholds
            .iter()
            .filter(|&&t| t > requested)
            .map(|&t| (t, *range, None)),
    );

    let end = anchor + Duration::days(1);
    for &days in &policy.window_days {
        if days <= 0 {
            continue;
        }
        let start = (anchor - Duration::days(days)).max(epoch);
        match DateRange::new(start, end) {
            Ok(window) => plan.push((policy.window_cloud_threshold, window, Some(days))),
            Err(_) => log::debug!("Skipping empty {}-day window ending {}", days, anchor),
        }
    }
    plan
}

pub struct CollectionResolver<'a> {
    client: &'a PlatformClient,
    config: &'a ResolverConfig,
    cache: Option<&'a ResolvedCollectionCache>,
}

impl<'a> CollectionResolver<'a> {
    pub fn new(client: &'a PlatformClient, config: &'a ResolverConfig) -> Self {
        Self {
            client,
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: &'a ResolvedCollectionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        self.config
    }

    /// Images in the window meeting the cloud threshold, ordered by date
    ///
    /// Only validation problems are fatal to the caller; an empty collection
    /// is a normal result.
    pub async fn resolve(
        &self,
        aoi: &Aoi,
        range: &DateRange,
        params: &ResolveParams,
    ) -> CanopyResult<Collection> {
        range.validate_epoch(self.config.imagery_epoch)?;
        params.validate()?;

        if let Some(cached) = self.cache.and_then(|c| c.get(aoi, range, params)) {
            log::debug!("Resolved collection for {} served from cache", range);
            return Ok(cached);
        }

        let candidates = self
            .client
            .filter_by_bounds_and_date(&aoi.bounds(), range)
            .await?;
        log::info!("Found {} candidate images for {}", candidates.len(), range);

        let records = if params.use_aoi_filter {
            // never stricter than the AOI threshold it feeds
            let loose = (params.max_cloud_pct * self.config.prefilter_factor).max(params.max_cloud_pct);
            let prefiltered: Vec<ImageRecord> = candidates
                .into_iter()
                .filter(|r| r.tile_cloud_pct <= loose)
                .collect();
            log::debug!(
                "Tile pre-filter at <= {}% kept {} images",
                loose,
                prefiltered.len()
            );
            let scenes = self
                .client
                .select_bands_many(&prefiltered, &Band::CLOUD)
                .await?;
            cloud_mask::filter_by_aoi_cloud(&scenes, aoi, params.max_cloud_pct, params.buffer_meters)
        } else {
            candidates
                .into_iter()
                .filter(|r| r.tile_cloud_pct < params.max_cloud_pct)
                .collect()
        };

        let collection = Collection::new(records);
        log::info!(
            "Resolved {} images for {} at {}% cloud (AOI filter: {})",
            collection.len(),
            range,
            params.max_cloud_pct,
            params.use_aoi_filter
        );

        if let Some(cache) = self.cache {
            cache.insert(aoi, range, params, collection.clone());
        }
        Ok(collection)
    }

    /// Cloud availability summary over every image in the window
    ///
    /// With the AOI filter, an image is suitable when its AOI cloud is at or
    /// below `max_cloud_pct` (tile figure when the AOI fraction is undefined);
    /// without it, when its tile cloud is strictly below.
    pub async fn check_cloud_coverage(
        &self,
        aoi: &Aoi,
        range: &DateRange,
        max_cloud_pct: f64,
        params: &ResolveParams,
    ) -> CanopyResult<CloudCoverageResult> {
        range.validate_epoch(self.config.imagery_epoch)?;
        params.with_max_cloud(max_cloud_pct).validate()?;

        let records = self
            .client
            .filter_by_bounds_and_date(&aoi.bounds(), range)
            .await?;
        let available = self.client.collection_size(&records).await?;
        log::info!("Found {} images in collection for {}", available, range);
        if available == 0 {
            return Ok(CloudCoverageResult::empty(*range, max_cloud_pct));
        }

        let scored: Vec<(ImageRecord, f64, bool)> = if params.use_aoi_filter {
            let scenes = self.client.select_bands_many(&records, &Band::CLOUD).await?;
            let fractions = cloud_mask::cloud_fractions(&scenes, aoi, params.buffer_meters);
            records
                .into_iter()
                .zip(fractions)
                .map(|(mut record, fraction)| {
                    record.aoi_cloud_pct = fraction;
                    let pct = record.effective_cloud_pct();
                    (record, pct, pct <= max_cloud_pct)
                })
                .collect()
        } else {
            records
                .into_iter()
                .map(|record| {
                    let pct = record.tile_cloud_pct;
                    (record, pct, pct < max_cloud_pct)
                })
                .collect()
        };

        let cloud_percentages: Vec<f64> = scored.iter().map(|(_, pct, _)| *pct).collect();
        let suitable_count = scored.iter().filter(|(_, _, ok)| *ok).count();
        let min = cloud_percentages.iter().copied().fold(f64::INFINITY, f64::min);
        let max = cloud_percentages.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = cloud_percentages.iter().sum::<f64>() / cloud_percentages.len() as f64;

        let lowest = |only_suitable: bool| {
            scored
                .iter()
                .filter(|(_, _, ok)| *ok || !only_suitable)
                .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.date.cmp(&b.0.date)))
                .map(|(record, _, _)| record.date)
        };
        let recommended_date = if suitable_count > 0 {
            lowest(true)
        } else {
            lowest(false)
        };

        let has_suitable_images = match self.config.suitability {
            SuitabilityRule::BestAvailable => recommended_date.is_some(),
            SuitabilityRule::ThresholdOnly => suitable_count > 0,
        };

        log::info!(
            "Cloud coverage check: {} available, {} suitable, best date: {:?}",
            available,
            suitable_count,
            recommended_date
        );

        Ok(CloudCoverageResult {
            has_suitable_images,
            available_images_count: available,
            suitable_images_count: suitable_count,
            min_cloud_coverage: Some(min),
            max_cloud_coverage: Some(max),
            avg_cloud_coverage: Some(avg),
            recommended_date,
            cloud_percentages,
            max_cloud_threshold: max_cloud_pct,
            date_range: *range,
        })
    }

    /// Walk the escalation ladder until a step reports suitable imagery
    ///
    /// Transient failures are recorded and skipped; validation failures of
    /// the caller's window abort the walk.
    pub async fn find_suitable(
        &self,
        aoi: &Aoi,
        range: &DateRange,
        params: &ResolveParams,
        anchor: NaiveDate,
    ) -> CanopyResult<EscalationOutcome> {
        range.validate_epoch(self.config.imagery_epoch)?;
        params.validate()?;

        let plan = ladder_plan(
            &self.config.escalation,
            params.max_cloud_pct,
            range,
            anchor,
            self.config.imagery_epoch,
        );

        let mut attempts = Vec::with_capacity(plan.len());
        let mut last_result = None;

        for (threshold, window, window_days) in plan {
            log::info!("Ladder step: {}% cloud over {}", threshold, window);
            let status = match self
                .check_cloud_coverage(aoi, &window, threshold, params)
                .await
            {
                Ok(result) if result.has_suitable_images => {
                    log::info!("Found suitable images with cloud threshold {}%", threshold);
                    attempts.push(LadderStep {
                        threshold,
                        date_range: window,
                        window_days,
                        status: StepStatus::Suitable,
                    });
                    return Ok(EscalationOutcome::Found {
                        result,
                        threshold,
                        window_days,
                        attempts,
                    });
                }
                Ok(result) => {
                    last_result = Some(result);
                    StepStatus::Unsuitable
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("Cloud coverage check failed at {}%: {}", threshold, e);
                    StepStatus::Failed(e.to_string())
                }
                Err(e) => return Err(e),
            };
            attempts.push(LadderStep {
                threshold,
                date_range: window,
                window_days,
                status,
            });
        }

        log::warn!(
            "No suitable imagery after {} ladder steps for {}",
            attempts.len(),
            range
        );
        let mut result =
            last_result.unwrap_or_else(|| CloudCoverageResult::empty(*range, params.max_cloud_pct));
        result.has_suitable_images = false;
        Ok(EscalationOutcome::Exhausted { result, attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sentinel2_epoch;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_ladder_plan_order() {
        let range = DateRange::new(d(2024, 6, 1), d(2024, 7, 1)).unwrap();
        let plan = ladder_plan(&EscalationPolicy::default(), 25.0, &range, d(2024, 9, 30), sentinel2_epoch());

        let thresholds: Vec<f64> = plan.iter().map(|s| s.0).collect();
        assert_eq!(thresholds, vec![25.0, 30.0, 50.0, 80.0, 90.0, 90.0, 90.0, 90.0]);
        assert!(plan[..4].iter().all(|s| s.1 == range && s.2.is_none()));

        let windows: Vec<Option<i64>> = plan[4..].iter().map(|s| s.2).collect();
        assert_eq!(windows, vec![Some(30), Some(90), Some(180), Some(365)]);
        assert_eq!(plan[4].1.start, d(2024, 8, 31));
        assert_eq!(plan[4].1.end, d(2024, 10, 1));
    }

    #[test]
    fn test_ladder_windows_clamped_to_epoch() {
        let range = DateRange::new(d(2015, 7, 1), d(2015, 8, 1)).unwrap();
        let plan = ladder_plan(&EscalationPolicy::default(), 10.0, &range, d(2015, 7, 10), sentinel2_epoch());
        let last = plan.last().unwrap();
        assert_eq!(last.1.start, sentinel2_epoch());
        assert_eq!(plan.len(), 9);
    }

    #[test]
    fn test_cache_keys_include_cloud_settings() {
        let cache = ResolvedCollectionCache::new();
        let aoi = Aoi::new(vec![[0.0, 0.0], [0.0, 1.0], [1.0, 1.0]], None).unwrap();
        let range = DateRange::new(d(2024, 1, 1), d(2024, 2, 1)).unwrap();
        let params = ResolveParams::default();
        cache.insert(&aoi, &range, &params, Collection::default());

        assert!(cache.get(&aoi, &range, &params).is_some());
        assert!(cache.get(&aoi, &range, &params.with_max_cloud(20.0)).is_none());
        let no_aoi = ResolveParams { use_aoi_filter: false, ..params };
        assert!(cache.get(&aoi, &range, &no_aoi).is_none());
        let wider = ResolveParams { buffer_meters: 500.0, ..params };
        assert!(cache.get(&aoi, &range, &wider).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_params_validation() {
        assert!(ResolveParams::default().validate().is_ok());
        assert!(ResolveParams::default().with_max_cloud(120.0).validate().is_err());
        let negative = ResolveParams { buffer_meters: -1.0, ..Default::default() };
        assert!(matches!(negative.validate(), Err(CanopyError::Validation(_))));
    }
}
