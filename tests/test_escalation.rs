mod common;

use canopy::core::resolver::{CollectionResolver, ResolveParams, StepStatus};
use canopy::io::archive::EXPORT_URL_PREFIX;
use canopy::models::{CloudOptions, ImageryRequest};
use canopy::types::VegetationIndex;
use canopy::{
    ArchivePlatform, CanopyError, DateRange, EscalationOutcome, IndexService, PlatformClient,
    ResolverConfig, ServiceConfig, SuitabilityRule,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn imagery_request(range: DateRange, use_aoi: bool) -> ImageryRequest {
    ImageryRequest {
        aoi: field(),
        date_range: range,
        index: VegetationIndex::Ndvi,
        cloud: CloudOptions {
            use_aoi_cloud_filter: Some(use_aoi),
            ..CloudOptions::default()
        },
        anchor_date: Some(d(2024, 9, 30)),
    }
}

fn june() -> DateRange {
    DateRange::new(d(2024, 6, 1), d(2024, 7, 1)).unwrap()
}

#[tokio::test]
async fn test_empty_archive_exhausts_ladder() {
    init_logging();
    let service = IndexService::new(Arc::new(ArchivePlatform::new()), ServiceConfig::default()).unwrap();

    let selection = service.find_imagery(&imagery_request(june(), true)).await.unwrap();

    assert!(!selection.ladder.is_found());
    assert!(!selection.ladder.result().has_suitable_images);
    assert_eq!(selection.ladder.result().available_images_count, 0);
    // requested threshold, four relaxed thresholds, four look-back windows
    assert_eq!(selection.ladder.attempts().len(), 9);
    assert!(selection
        .ladder
        .attempts()
        .iter()
        .all(|s| s.status == StepStatus::Unsuitable));
    assert!(selection.export.is_none());
    assert!(selection.threshold_used.is_none());
    assert!(selection.warning.is_some());
}

#[tokio::test]
async fn test_threshold_relaxed_until_tile_cloud_fits() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![scene(
        "S2A_0612",
        d(2024, 6, 12),
        35.0,
        Sky::Clear,
        0.6,
        0.2,
    )]);
    let mut config = ServiceConfig::default();
    config.resolver.suitability = SuitabilityRule::ThresholdOnly;
    let service = IndexService::new(Arc::new(archive), config).unwrap();

    let selection = service.find_imagery(&imagery_request(june(), false)).await.unwrap();

    assert_eq!(selection.threshold_used, Some(50.0));
    assert_eq!(selection.date, Some(d(2024, 6, 12)));
    let thresholds: Vec<f64> = selection.ladder.attempts().iter().map(|s| s.threshold).collect();
    assert_eq!(thresholds, vec![10.0, 20.0, 30.0, 50.0]);
    assert_eq!(
        selection.ladder.attempts().last().map(|s| &s.status),
        Some(&StepStatus::Suitable)
    );

    let export = selection.export.expect("found imagery is exported");
    assert!(export.download_url.starts_with(EXPORT_URL_PREFIX));
    assert_eq!(export.metadata.image_id, "S2A_0612");
    assert!(selection.warning.unwrap().contains("50%"));
}

#[tokio::test]
async fn test_look_back_window_used_when_range_is_empty() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![clear("S2B_0920", d(2024, 9, 20), 0.6, 0.2)]);
    let service = IndexService::new(Arc::new(archive), ServiceConfig::default()).unwrap();

    let selection = service.find_imagery(&imagery_request(june(), true)).await.unwrap();

    match &selection.ladder {
        EscalationOutcome::Found {
            threshold,
            window_days,
            result,
            attempts,
        } => {
            assert_eq!(*threshold, 90.0);
            assert_eq!(*window_days, Some(30));
            assert_eq!(result.recommended_date, Some(d(2024, 9, 20)));
            assert_eq!(attempts.len(), 6);
            assert_eq!(result.date_range.end, d(2024, 10, 1));
        }
        other => panic!("expected imagery in the 30-day window, got {:?}", other),
    }
    assert!(selection.export.is_some());
    assert!(selection.warning.unwrap().contains("30 days"));
}

#[tokio::test]
async fn test_retryable_failures_are_skipped() {
    init_logging();
    let archive = Arc::new(ArchivePlatform::with_scenes(vec![clear(
        "S2A_0614",
        d(2024, 6, 14),
        0.6,
        0.2,
    )]));
    archive.fail_next_search(CanopyError::Retryable("gateway busy".into()));
    archive.fail_next_search(CanopyError::Retryable("gateway busy".into()));
    let service = IndexService::new(archive.clone(), ServiceConfig::default()).unwrap();

    let selection = service.find_imagery(&imagery_request(june(), true)).await.unwrap();

    let statuses: Vec<&StepStatus> = selection.ladder.attempts().iter().map(|s| &s.status).collect();
    assert!(matches!(statuses[0], StepStatus::Failed(_)));
    assert!(matches!(statuses[1], StepStatus::Failed(_)));
    assert_eq!(statuses[2], &StepStatus::Suitable);
    assert_eq!(selection.threshold_used, Some(30.0));
    assert_eq!(archive.auth_calls(), 1);
}

#[tokio::test]
async fn test_validation_error_aborts_ladder() {
    init_logging();
    let archive = Arc::new(ArchivePlatform::new());
    let service = IndexService::new(archive.clone(), ServiceConfig::default()).unwrap();
    let before_epoch = DateRange::new(d(2014, 1, 1), d(2014, 2, 1)).unwrap();

    let result = service.find_imagery(&imagery_request(before_epoch, true)).await;

    assert!(matches!(result, Err(CanopyError::Validation(_))));
    assert_eq!(archive.search_calls(), 0);
}

#[tokio::test]
async fn test_connect_runs_once_across_operations() {
    init_logging();
    let archive = Arc::new(ArchivePlatform::with_scenes(vec![clear(
        "S2A_0614",
        d(2024, 6, 14),
        0.6,
        0.2,
    )]));
    let service = IndexService::new(archive.clone(), ServiceConfig::default()).unwrap();
    assert!(!service.client().is_connected());

    for _ in 0..3 {
        service.find_imagery(&imagery_request(june(), true)).await.unwrap();
    }

    assert!(service.client().is_connected());
    assert_eq!(archive.auth_calls(), 1);
    assert!(archive.search_calls() >= 3);
}

#[tokio::test]
async fn test_slow_platform_times_out_as_retryable() {
    init_logging();
    let archive = ArchivePlatform::with_scenes(vec![clear("S2A_0614", d(2024, 6, 14), 0.6, 0.2)])
        .with_latency(Duration::from_millis(250));
    let client = PlatformClient::new(Arc::new(archive), Duration::from_millis(20));

    let err = client
        .filter_by_bounds_and_date(&field().bounds(), &june())
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let config = ResolverConfig::default();
    let resolver = CollectionResolver::new(&client, &config);
    let outcome = resolver
        .find_suitable(&field(), &june(), &ResolveParams::default(), d(2024, 9, 30))
        .await
        .unwrap();
    assert!(!outcome.is_found());
    assert!(outcome
        .attempts()
        .iter()
        .all(|s| matches!(s.status, StepStatus::Failed(_))));
}
