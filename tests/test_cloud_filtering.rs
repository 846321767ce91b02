mod common;

use canopy::core::cloud_mask;
use canopy::core::resolver::{CollectionResolver, ResolveParams};
use canopy::models::{AvailableDatesRequest, CloudCoverageCheckRequest, CloudOptions, DateSource};
use canopy::{ArchivePlatform, DateRange, IndexService, PlatformClient, ResolverConfig, ServiceConfig};
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn june() -> DateRange {
    DateRange::new(d(2024, 6, 1), d(2024, 7, 1)).unwrap()
}

#[tokio::test]
async fn test_recommended_date_is_least_cloudy_over_field() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![
        scene("S2A_0605", d(2024, 6, 5), 3.0, Sky::Overcast, 0.5, 0.1),
        scene("S2B_0615", d(2024, 6, 15), 8.0, Sky::Clear, 0.5, 0.1),
        scene("S2A_0625", d(2024, 6, 25), 9.0, Sky::CloudyNearby, 0.5, 0.1),
    ]);
    let service = IndexService::new(Arc::new(archive), ServiceConfig::default()).unwrap();

    let result = service
        .check_cloud_coverage(&CloudCoverageCheckRequest {
            aoi: field(),
            date_range: june(),
            max_cloud_coverage: Some(10.0),
            use_aoi_cloud_filter: Some(true),
            cloud_buffer_meters: None,
        })
        .await
        .unwrap();

    assert!(result.has_suitable_images);
    assert_eq!(result.available_images_count, 3);
    assert!(result.suitable_images_count >= 1);
    assert_eq!(result.recommended_date, Some(d(2024, 6, 15)));
    assert_eq!(result.min_cloud_coverage, Some(0.0));
    assert_eq!(result.max_cloud_coverage, Some(100.0));
    assert_eq!(result.cloud_percentages.len(), 3);
}

#[tokio::test]
async fn test_tile_mode_uses_strict_threshold() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![
        scene("at_limit", d(2024, 6, 3), 10.0, Sky::Clear, 0.5, 0.1),
        scene("below", d(2024, 6, 9), 9.5, Sky::Overcast, 0.5, 0.1),
    ]);
    let service = IndexService::new(Arc::new(archive), ServiceConfig::default()).unwrap();

    let result = service
        .check_cloud_coverage(&CloudCoverageCheckRequest {
            aoi: field(),
            date_range: june(),
            max_cloud_coverage: Some(10.0),
            use_aoi_cloud_filter: Some(false),
            cloud_buffer_meters: None,
        })
        .await
        .unwrap();

    assert_eq!(result.suitable_images_count, 1);
    assert_eq!(result.recommended_date, Some(d(2024, 6, 9)));
    assert_eq!(result.cloud_percentages, vec![10.0, 9.5]);
}

#[tokio::test]
async fn test_aoi_filter_disagrees_with_tile_cloud() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![
        // cloudy tile, clear field
        scene("clear_field", d(2024, 6, 4), 15.0, Sky::CloudyFarAway, 0.5, 0.1),
        // clear tile, field under cloud
        scene("cloudy_field", d(2024, 6, 8), 4.0, Sky::Overcast, 0.5, 0.1),
        // beyond the 2x tile pre-filter
        scene("very_cloudy_tile", d(2024, 6, 12), 25.0, Sky::Clear, 0.5, 0.1),
    ]);
    let client = PlatformClient::new(Arc::new(archive), Duration::from_secs(5));
    let config = ResolverConfig::default();
    let resolver = CollectionResolver::new(&client, &config);
    let aoi = field();

    let scored = resolver
        .resolve(&aoi, &june(), &ResolveParams::default())
        .await
        .unwrap();
    let ids: Vec<_> = scored.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["clear_field"]);
    assert_eq!(scored.images[0].aoi_cloud_pct, Some(0.0));

    let tile_only = ResolveParams {
        use_aoi_filter: false,
        ..ResolveParams::default()
    };
    let tiled = resolver.resolve(&aoi, &june(), &tile_only).await.unwrap();
    let ids: Vec<_> = tiled.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["cloudy_field"]);
    assert_eq!(tiled.images[0].aoi_cloud_pct, None);
}

#[tokio::test]
async fn test_zero_threshold_keeps_cloud_free_scene() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![
        scene("S2A_0607", d(2024, 6, 7), 0.0, Sky::Clear, 0.5, 0.1),
        scene("S2B_0617", d(2024, 6, 17), 0.5, Sky::Clear, 0.5, 0.1),
    ]);
    let client = PlatformClient::new(Arc::new(archive), Duration::from_secs(5));
    let config = ResolverConfig::default();
    let resolver = CollectionResolver::new(&client, &config);
    let strict = ResolveParams {
        max_cloud_pct: 0.0,
        use_aoi_filter: true,
        buffer_meters: 0.0,
    };

    let scored = resolver.resolve(&field(), &june(), &strict).await.unwrap();
    let ids: Vec<_> = scored.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["S2A_0607"]);
    assert_eq!(scored.images[0].aoi_cloud_pct, Some(0.0));
}

#[test]
fn test_buffer_widens_scored_region() {
    init_logging();
    let aoi = field();
    let nearby = scene("nearby", d(2024, 6, 4), 5.0, Sky::CloudyNearby, 0.5, 0.1);

    assert_eq!(cloud_mask::cloud_fraction(&nearby, &aoi, None), Some(0.0));
    assert_eq!(cloud_mask::cloud_fraction(&nearby, &aoi, Some(0.0)), Some(0.0));
    let buffered = cloud_mask::cloud_fraction(&nearby, &aoi, Some(300.0)).unwrap();
    assert!(buffered > 0.0 && buffered < 100.0);

    let far = scene("far", d(2024, 6, 4), 5.0, Sky::CloudyFarAway, 0.5, 0.1);
    assert_eq!(cloud_mask::cloud_fraction(&far, &aoi, Some(300.0)), Some(0.0));
}

#[test]
fn test_best_image_prefers_clear_field() {
    let aoi = field();
    let scenes = vec![
        scene("overcast", d(2024, 6, 1), 1.0, Sky::Overcast, 0.5, 0.1),
        scene("nearby", d(2024, 6, 2), 2.0, Sky::CloudyNearby, 0.5, 0.1),
        scene("clear", d(2024, 6, 3), 30.0, Sky::Clear, 0.5, 0.1),
    ];
    let (best, pct) = cloud_mask::best_image(&scenes, &aoi, 300.0).unwrap();
    assert_eq!(best.record.id, "clear");
    assert_eq!(pct, Some(0.0));
}

#[tokio::test]
async fn test_available_dates_fall_back_to_tile_cloud() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![
        scene("S2A_0610", d(2024, 6, 10), 6.0, Sky::Overcast, 0.5, 0.1),
        scene("S2B_0610", d(2024, 6, 10), 3.0, Sky::Overcast, 0.5, 0.1),
        scene("S2A_0620", d(2024, 6, 20), 40.0, Sky::Overcast, 0.5, 0.1),
    ]);
    let service = IndexService::new(Arc::new(archive), ServiceConfig::default()).unwrap();

    let response = service
        .available_dates(&AvailableDatesRequest {
            aoi: field(),
            date_range: june(),
            cloud: CloudOptions::default(),
        })
        .await
        .unwrap();

    assert_eq!(response.source, DateSource::TileFallback);
    assert_eq!(response.total_images, 2);
    assert_eq!(response.dates.len(), 1);
    assert_eq!(response.dates[0].image_id, "S2B_0610");
    assert_eq!(response.dates[0].cloud_coverage, 3.0);
}

#[tokio::test]
async fn test_available_dates_keep_lowest_aoi_cloud_per_day() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![
        scene("S2A_0610", d(2024, 6, 10), 2.0, Sky::CloudyNearby, 0.5, 0.1),
        scene("S2B_0610", d(2024, 6, 10), 12.0, Sky::Clear, 0.5, 0.1),
        scene("S2A_0618", d(2024, 6, 18), 1.0, Sky::Clear, 0.5, 0.1),
    ]);
    let service = IndexService::new(Arc::new(archive), ServiceConfig::default()).unwrap();

    let response = service
        .available_dates(&AvailableDatesRequest {
            aoi: field(),
            date_range: june(),
            cloud: CloudOptions {
                cloud_coverage: Some(100.0),
                ..CloudOptions::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(response.source, DateSource::AoiFilter);
    let dates: Vec<_> = response.dates.iter().map(|d| (d.date, d.image_id.as_str())).collect();
    assert_eq!(
        dates,
        vec![(d(2024, 6, 10), "S2B_0610"), (d(2024, 6, 18), "S2A_0618")]
    );
}
