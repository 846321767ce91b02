//! Core imagery processing modules

pub mod band_math;
pub mod cloud_mask;
pub mod composite;
pub mod geometry;
pub mod resolver;
pub mod sampler;
pub mod statistics;

// Re-export main types
pub use band_math::BandMath;
pub use cloud_mask::{best_image, cloud_fraction, filter_by_aoi_cloud, mask_clouds};
pub use composite::{median_composite, median_composite_on, TargetGrid};
pub use geometry::{point_in_polygon, Aoi, Region};
pub use resolver::{
    CollectionResolver, EscalationOutcome, LadderStep, ResolveParams, ResolvedCollectionCache,
    StepStatus,
};
pub use sampler::{CoordinateSystem, Heatmap, HeatmapCell, PixelSampleSet, VisualizationParams};
pub use statistics::{PeriodComparison, SeriesSummary, TimeInterval, TimeSeries, TimeSeriesPoint};
