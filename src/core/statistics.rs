//! Reduction of index rasters to per-AOI statistics and time series

use crate::core::band_math::BandMath;
use crate::core::geometry::Aoi;
use crate::types::{
    CanopyError, IndexRaster, PercentileValue, Scene, Statistics, VegetationIndex,
};
use chrono::{Datelike, Duration, NaiveDate};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Percentiles reported by the statistics endpoint
pub const REPORT_PERCENTILES: [f64; 5] = [2.0, 25.0, 50.0, 75.0, 98.0];

/// Nearest-rank percentile of an ascending slice, `q` in `[0, 1]`
pub fn nearest_rank<T: Float>(sorted: &[T], q: f64) -> Option<T> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((n as f64) * q.clamp(0.0, 1.0)).floor() as usize;
    Some(sorted[rank.min(n - 1)])
}

/// Finite values of the raster whose pixel centre falls inside the AOI
pub fn aoi_values(raster: &IndexRaster, aoi: &Aoi) -> Vec<f64> {
    let bounds = aoi.bounds();
    let gt = raster.geo_transform;
    raster
        .data
        .indexed_iter()
        .filter(|(_, v)| v.is_finite())
        .filter_map(|((row, col), v)| {
            let (lon, lat) = gt.pixel_center(row, col);
            (bounds.contains(lon, lat) && aoi.contains(lon, lat)).then(|| *v as f64)
        })
        .collect()
}

/// Summarise a set of values; non-finite entries are ignored
pub fn summarize<T: Float>(values: &[T], percentiles: &[f64]) -> Statistics {
    let mut sorted: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .filter_map(|v| v.to_f64())
        .collect();
    if sorted.is_empty() {
        return Statistics::empty();
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let rank = |q: f64| nearest_rank(&sorted, q).unwrap_or(0.0);

    Statistics {
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean,
        median: rank(0.5),
        p10: rank(0.10),
        p25: rank(0.25),
        p75: rank(0.75),
        p90: rank(0.90),
        std: variance.sqrt(),
        count: sorted.len(),
        percentiles: percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value: rank(p / 100.0),
            })
            .collect(),
    }
}

/// Statistics over the AOI pixels of an index raster
pub fn reduce(raster: &IndexRaster, aoi: &Aoi, percentiles: &[f64]) -> Statistics {
    let values = aoi_values(raster, aoi);
    let stats = summarize(&values, percentiles);
    log::debug!(
        "{} over AOI: {} pixels, mean {:.4}",
        raster.index,
        stats.count,
        stats.mean
    );
    stats
}

/// One point of an index time series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Lazy per-scene AOI means; clone it to restart the series
#[derive(Clone)]
pub struct TimeSeries<'a> {
    scenes: std::slice::Iter<'a, Scene>,
    aoi: &'a Aoi,
    index: VegetationIndex,
}

impl<'a> Iterator for TimeSeries<'a> {
    type Item = TimeSeriesPoint;

    fn next(&mut self) -> Option<Self::Item> {
        for scene in self.scenes.by_ref() {
            let raster = match BandMath::compute_index(scene, self.index) {
                Some(raster) => raster,
                None => continue,
            };
            let stats = reduce(&raster, self.aoi, &[]);
            if stats.is_empty() {
                log::debug!(
                    "Skipping {} in {} series: no valid AOI pixels",
                    scene.record.id,
                    self.index
                );
                continue;
            }
            return Some(TimeSeriesPoint {
                date: scene.record.date,
                value: stats.mean,
            });
        }
        None
    }
}

pub fn time_series<'a>(scenes: &'a [Scene], aoi: &'a Aoi, index: VegetationIndex) -> TimeSeries<'a> {
    TimeSeries {
        scenes: scenes.iter(),
        aoi,
        index,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInterval {
    Day,
    Week,
    Month,
    Year,
}

impl Default for TimeInterval {
    fn default() -> Self {
        TimeInterval::Month
    }
}

impl TimeInterval {
    /// First day of the bucket containing `date`; weeks start on Monday
    pub fn bucket_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            TimeInterval::Day => date,
            TimeInterval::Week => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            TimeInterval::Month => date.with_day(1).unwrap_or(date),
            TimeInterval::Year => date.with_ordinal(1).unwrap_or(date),
        }
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeInterval::Day => "day",
            TimeInterval::Week => "week",
            TimeInterval::Month => "month",
            TimeInterval::Year => "year",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for TimeInterval {
    type Err = CanopyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(TimeInterval::Day),
            "week" => Ok(TimeInterval::Week),
            "month" => Ok(TimeInterval::Month),
            "year" => Ok(TimeInterval::Year),
            other => Err(CanopyError::Validation(format!(
                "Unknown time interval: {}",
                other
            ))),
        }
    }
}

/// Average points per interval bucket, dated at the bucket start
pub fn aggregate_by_interval<I>(points: I, interval: TimeInterval) -> Vec<TimeSeriesPoint>
where
    I: IntoIterator<Item = TimeSeriesPoint>,
{
    let mut buckets: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for point in points {
        if !point.value.is_finite() {
            continue;
        }
        let entry = buckets.entry(interval.bucket_start(point.date)).or_insert((0.0, 0));
        entry.0 += point.value;
        entry.1 += 1;
    }
    buckets
        .into_iter()
        .map(|(date, (sum, n))| TimeSeriesPoint {
            date,
            value: sum / n as f64,
        })
        .collect()
}

/// Mean, spread and extremes of a series
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub count: usize,
}

pub fn series_summary(points: &[TimeSeriesPoint]) -> SeriesSummary {
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let stats = summarize(&values, &[]);
    SeriesSummary {
        mean: stats.mean,
        std: stats.std,
        min: stats.min,
        max: stats.max,
        median: stats.median,
        count: stats.count,
    }
}

/// Change of one index between a baseline and a comparison period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub baseline_mean: f64,
    pub baseline_median: f64,
    pub comparison_mean: f64,
    pub comparison_median: f64,
    pub mean_diff: f64,
    pub median_diff: f64,
    /// Relative mean change in percent; zero when the baseline mean is zero
    pub mean_pct_change: f64,
}

/// Compare per-index statistics of two periods, for indices present in both
pub fn compare(
    baseline: &BTreeMap<VegetationIndex, Statistics>,
    comparison: &BTreeMap<VegetationIndex, Statistics>,
    indices: &[VegetationIndex],
) -> BTreeMap<VegetationIndex, PeriodComparison> {
    indices
        .iter()
        .filter_map(|idx| {
            let a = baseline.get(idx)?;
            let b = comparison.get(idx)?;
            let mean_diff = b.mean - a.mean;
            let mean_pct_change = if a.mean == 0.0 {
                0.0
            } else {
                mean_diff / a.mean * 100.0
            };
            Some((
                *idx,
                PeriodComparison {
                    baseline_mean: a.mean,
                    baseline_median: a.median,
                    comparison_mean: b.mean,
                    comparison_median: b.median,
                    mean_diff,
                    median_diff: b.median - a.median,
                    mean_pct_change,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Band, GeoTransform, ImageRecord};
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use std::collections::HashMap;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn unit_aoi() -> Aoi {
        Aoi::new(vec![[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0]], None).unwrap()
    }

    fn raster(data: Array2<f32>) -> IndexRaster {
        let dim = data.dim();
        IndexRaster {
            index: VegetationIndex::Ndvi,
            geo_transform: GeoTransform::north_up(0.0, 1.0, 1.0 / dim.1 as f64, 1.0 / dim.0 as f64),
            data,
            date: None,
        }
    }

    #[test]
    fn test_nearest_rank_rule() {
        let sorted: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(nearest_rank(&sorted, 0.5), Some(6.0));
        assert_eq!(nearest_rank(&sorted, 0.0), Some(1.0));
        assert_eq!(nearest_rank(&sorted, 1.0), Some(10.0));
        assert_eq!(nearest_rank(&sorted, 0.25), Some(3.0));
        assert_eq!(nearest_rank::<f64>(&[], 0.5), None);
    }

    #[test]
    fn test_summarize_population_std() {
        let stats = summarize(&[2.0f64, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0, f64::NAN], &[98.0]);
        assert_eq!(stats.count, 8);
        assert_relative_eq!(stats.mean, 5.0);
        assert_relative_eq!(stats.std, 2.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.percentile(98.0), Some(9.0));

        let empty = summarize::<f32>(&[f32::NAN], &[]);
        assert!(empty.is_empty());
        assert_eq!(empty, Statistics::empty());
    }

    #[test]
    fn test_reduce_ignores_pixels_outside_aoi() {
        let triangle = Aoi::new(vec![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0]], None).unwrap();
        // Pixel centres with c > r lie outside the triangle
        let data = Array2::from_shape_fn((10, 10), |(r, c)| if c <= r { 1.0 } else { 100.0 });
        let stats = reduce(&raster(data), &triangle, &[]);
        assert!(stats.count > 0);
        assert_eq!(stats.max, 1.0);
    }

    #[test]
    fn test_time_series_is_restartable() {
        let scene = |day: u32, nir: f32| Scene {
            record: ImageRecord::new(format!("S{}", day), date(6, day), 0.0),
            geo_transform: GeoTransform::north_up(0.0, 1.0, 0.25, 0.25),
            bands: [
                (Band::Nir, Array2::from_elem((4, 4), nir)),
                (Band::Red, Array2::from_elem((4, 4), 0.1f32)),
            ]
            .into_iter()
            .collect::<HashMap<_, _>>(),
        };
        let mut missing_red = scene(20, 0.5);
        missing_red.bands.remove(&Band::Red);
        let scenes = vec![scene(1, 0.3), missing_red, scene(10, 0.5)];
        let aoi = unit_aoi();

        let series = time_series(&scenes, &aoi, VegetationIndex::Ndvi);
        let first: Vec<_> = series.clone().collect();
        let second: Vec<_> = series.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_relative_eq!(first[0].value, 0.5, epsilon = 1e-6);
        assert_eq!(first[1].date, date(6, 10));
    }

    #[test]
    fn test_interval_buckets() {
        let points = vec![
            TimeSeriesPoint { date: date(6, 3), value: 0.2 },
            TimeSeriesPoint { date: date(6, 5), value: 0.4 },
            TimeSeriesPoint { date: date(6, 12), value: 0.6 },
            TimeSeriesPoint { date: date(7, 1), value: 0.8 },
        ];

        let weekly = aggregate_by_interval(points.clone(), TimeInterval::Week);
        assert_eq!(weekly.len(), 3);
        assert_eq!(weekly[0].date, date(6, 3));
        assert_relative_eq!(weekly[0].value, 0.3, epsilon = 1e-12);

        let monthly = aggregate_by_interval(points.clone(), TimeInterval::Month);
        assert_eq!(monthly.len(), 2);
        assert_eq!(monthly[0].date, date(6, 1));
        assert_relative_eq!(monthly[0].value, 0.4, epsilon = 1e-12);

        let yearly = aggregate_by_interval(points, TimeInterval::Year);
        assert_eq!(yearly.len(), 1);
        assert_eq!(yearly[0].date, date(1, 1));

        assert_eq!("Week".parse::<TimeInterval>().unwrap(), TimeInterval::Week);
        assert!("fortnight".parse::<TimeInterval>().is_err());
    }

    #[test]
    fn test_compare_zero_baseline() {
        let mut a = BTreeMap::new();
        let mut b = BTreeMap::new();
        a.insert(VegetationIndex::Ndvi, Statistics { mean: 0.0, median: 0.1, count: 4, ..Statistics::default() });
        b.insert(VegetationIndex::Ndvi, Statistics { mean: 0.5, median: 0.4, count: 4, ..Statistics::default() });
        b.insert(VegetationIndex::Ndre, Statistics { mean: 0.3, count: 4, ..Statistics::default() });

        let result = compare(&a, &b, &[VegetationIndex::Ndvi, VegetationIndex::Ndre]);
        assert_eq!(result.len(), 1);
        let ndvi = result[&VegetationIndex::Ndvi];
        assert_eq!(ndvi.mean_pct_change, 0.0);
        assert_relative_eq!(ndvi.mean_diff, 0.5);
        assert_relative_eq!(ndvi.median_diff, 0.3, epsilon = 1e-12);

        a.insert(VegetationIndex::Ndvi, Statistics { mean: 0.4, count: 4, ..Statistics::default() });
        let result = compare(&a, &b, &[VegetationIndex::Ndvi]);
        assert_relative_eq!(result[&VegetationIndex::Ndvi].mean_pct_change, 25.0, epsilon = 1e-9);
    }

    #[test]
    fn test_series_summary() {
        let points: Vec<_> = [0.1, 0.3, 0.5]
            .iter()
            .enumerate()
            .map(|(i, &v)| TimeSeriesPoint { date: date(5, i as u32 + 1), value: v })
            .collect();
        let summary = series_summary(&points);
        assert_eq!(summary.count, 3);
        assert_relative_eq!(summary.mean, 0.3, epsilon = 1e-12);
        assert_relative_eq!(summary.max, 0.5);
        assert_relative_eq!(summary.median, 0.3);
    }
}
