//! End-to-end tests of the fetch pipeline against a scripted fetcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use terrastream::layer::{HEIGHTMAP, IMAGERY};
use terrastream::{
    AtlasBuild, AtlasCompositor, Error, ErrorClass, Fetcher, LayerDescriptor, LayerRegistry,
    RequestStatus, TileCache, TileCacheConfig, TileEvent, TileKey, TileState,
};
use tokio::runtime::Handle;

use common::{Call, MockFetcher, Reply, init_tracing, png_tile, url};

const HEIGHTMAP_URL: &str = "https://tiles.test/h/{z}/{x}/{y}.png";
const IMAGERY_URL: &str = "https://tiles.test/i/{z}/{x}/{y}.png";

fn ok_png() -> Reply {
    Reply::Body(png_tile(4, 1000.0))
}

fn config() -> TileCacheConfig {
    TileCacheConfig {
        memory_capacity: 16,
        fetch_workers: 2,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
        ..TileCacheConfig::default()
    }
}

fn heightmap_layer() -> LayerDescriptor {
    LayerDescriptor::new(HEIGHTMAP, HEIGHTMAP_URL, "png").with_priority(10)
}

fn cache_with(
    config: TileCacheConfig,
    layers: Vec<LayerDescriptor>,
    fetcher: &Arc<MockFetcher>,
) -> TileCache {
    init_tracing();
    let registry = LayerRegistry::from_layers(layers).unwrap();
    let fetcher: Arc<dyn Fetcher> = fetcher.clone();
    TileCache::new(config, registry, fetcher, &Handle::current()).unwrap()
}

/// Poll until `done` holds for the collected events, or time out.
async fn poll_until(
    cache: &mut TileCache,
    mut done: impl FnMut(&TileCache, &[TileEvent]) -> bool,
) -> Vec<TileEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    loop {
        events.extend(cache.poll());
        if done(cache, &events) || tokio::time::Instant::now() > deadline {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn loaded(events: &[TileEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, TileEvent::Loaded { .. }))
        .count()
}

fn failed(events: &[TileEvent]) -> Vec<Arc<Error>> {
    events
        .iter()
        .filter_map(|event| match event {
            TileEvent::LoadFailed { error, .. } => Some(Arc::clone(error)),
            TileEvent::Loaded { .. } => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_share_one_fetch() {
    let fetcher = Arc::new(MockFetcher::gated(ok_png()));
    let mut cache = cache_with(config(), vec![heightmap_layer()], &fetcher);
    let key = TileKey::new(5, 5, 15);

    let statuses: Vec<RequestStatus> = (0..3)
        .map(|_| cache.request(key, HEIGHTMAP).unwrap())
        .collect();
    assert_eq!(
        statuses,
        vec![
            RequestStatus::Queued,
            RequestStatus::Pending,
            RequestStatus::Pending
        ]
    );

    fetcher.release(1);
    let events = poll_until(&mut cache, |_, events| loaded(events) == 1).await;
    assert_eq!(loaded(&events), 1);
    assert_eq!(fetcher.calls().len(), 1);

    let first = cache.get(key, HEIGHTMAP).unwrap();
    for _ in 0..2 {
        assert!(Arc::ptr_eq(&first, &cache.get(key, HEIGHTMAP).unwrap()));
    }
    assert!(first.as_raster().is_some());

    // A memory hit raises no further event.
    assert_eq!(cache.request(key, HEIGHTMAP).unwrap(), RequestStatus::Cached);
    assert!(cache.poll().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_token_refreshed_once() {
    let template = "https://secure.test/{z}/{x}/{y}.png?token={token}";
    let refresh_url = "https://auth.test/token";
    let key = TileKey::new(1, 2, 3);
    let stale_url = url(template, key).replace("{token}", "stale");

    let fetcher = Arc::new(
        MockFetcher::new(ok_png())
            .script(&stale_url, [Reply::Status(401)])
            .script(
                refresh_url,
                [Reply::Body(
                    br#"{"token": "fresh", "expires_in": 3600}"#.to_vec(),
                )],
            ),
    );
    let layer = LayerDescriptor::new(HEIGHTMAP, template, "png").with_token_auth(
        Some("stale".to_string()),
        refresh_url,
        Duration::from_secs(600),
    );
    let mut cache = cache_with(config(), vec![layer], &fetcher);

    cache.request(key, HEIGHTMAP).unwrap();
    let events = poll_until(&mut cache, |_, events| !events.is_empty()).await;

    assert_eq!(loaded(&events), 1);
    assert!(failed(&events).is_empty());
    assert_eq!(cache.tokens().refresh_count(HEIGHTMAP), 1);
    assert_eq!(
        fetcher.calls(),
        vec![
            Call {
                url: stale_url,
                bearer: Some("stale".to_string()),
            },
            Call {
                url: refresh_url.to_string(),
                bearer: None,
            },
            Call {
                url: url(template, key).replace("{token}", "fresh"),
                bearer: Some("fresh".to_string()),
            },
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_rejection_is_terminal() {
    let refresh_url = "https://auth.test/token";
    let fetcher = Arc::new(
        MockFetcher::new(Reply::Status(403)).script(refresh_url, [Reply::Body(b"fresh".to_vec())]),
    );
    let layer = LayerDescriptor::new(HEIGHTMAP, HEIGHTMAP_URL, "png").with_token_auth(
        Some("stale".to_string()),
        refresh_url,
        Duration::from_secs(600),
    );
    let mut cache = cache_with(config(), vec![layer], &fetcher);
    let key = TileKey::new(0, 0, 1);

    cache.request(key, HEIGHTMAP).unwrap();
    let events = poll_until(&mut cache, |_, events| !events.is_empty()).await;

    let errors = failed(&events);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].class(), ErrorClass::Auth);
    assert_eq!(cache.tokens().refresh_count(HEIGHTMAP), 1);
    // Stale attempt, refresh, fresh attempt; auth failures are not retried.
    assert_eq!(fetcher.calls().len(), 3);
    assert_eq!(cache.state(key, HEIGHTMAP), TileState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_exhausted_then_failure_remembered() {
    let fetcher = Arc::new(MockFetcher::new(Reply::Status(503)));
    let mut cache = cache_with(config(), vec![heightmap_layer()], &fetcher);
    let key = TileKey::new(3, 3, 4);

    cache.request(key, HEIGHTMAP).unwrap();
    let events = poll_until(&mut cache, |_, events| !events.is_empty()).await;

    let errors = failed(&events);
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        *errors[0],
        Error::HttpStatus { status: 503, .. }
    ));
    assert_eq!(fetcher.calls().len(), 3);
    assert_eq!(cache.stats().failed, 1);

    // The failure sticks until cleared.
    assert_eq!(cache.request(key, HEIGHTMAP).unwrap(), RequestStatus::Failed);
    cache.clear_failures();
    assert_eq!(cache.request(key, HEIGHTMAP).unwrap(), RequestStatus::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failure_recovers() {
    let key = TileKey::new(7, 1, 5);
    let fetcher = Arc::new(MockFetcher::new(ok_png()).script(
        &url(HEIGHTMAP_URL, key),
        [Reply::Transport, Reply::Status(500)],
    ));
    let mut cache = cache_with(config(), vec![heightmap_layer()], &fetcher);

    cache.request(key, HEIGHTMAP).unwrap();
    let events = poll_until(&mut cache, |_, events| !events.is_empty()).await;

    assert_eq!(loaded(&events), 1);
    assert_eq!(fetcher.calls().len(), 3);
    assert_eq!(cache.stats().network_fetches, 3);
    assert_eq!(cache.state(key, HEIGHTMAP), TileState::Loaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_fetch_times_out_and_retries() {
    // The gate is never opened, so every request stalls until the timeout.
    let fetcher = Arc::new(MockFetcher::gated(ok_png()));
    let config = TileCacheConfig {
        max_attempts: 2,
        request_timeout: Duration::from_millis(50),
        ..config()
    };
    let mut cache = cache_with(config, vec![heightmap_layer()], &fetcher);
    let key = TileKey::new(3, 3, 4);

    cache.request(key, HEIGHTMAP).unwrap();
    let events = poll_until(&mut cache, |_, events| !events.is_empty()).await;

    let errors = failed(&events);
    assert_eq!(errors.len(), 1);
    assert!(matches!(*errors[0], Error::Timeout { ref url } if url.ends_with("/4/3/3.png")));
    assert_eq!(fetcher.calls().len(), 2);
    assert_eq!(cache.state(key, HEIGHTMAP), TileState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_decode_error_not_retried() {
    let fetcher = Arc::new(MockFetcher::new(Reply::Body(b"not a png".to_vec())));
    let mut cache = cache_with(config(), vec![heightmap_layer()], &fetcher);

    cache.request(TileKey::new(0, 0, 0), HEIGHTMAP).unwrap();
    let events = poll_until(&mut cache, |_, events| !events.is_empty()).await;

    let errors = failed(&events);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].class(), ErrorClass::Decode);
    assert_eq!(fetcher.calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disk_cache_serves_second_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = TileCacheConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        ..config()
    };
    let key = TileKey::new(2, 1, 6);

    {
        let fetcher = Arc::new(MockFetcher::new(ok_png()));
        let mut cache = cache_with(config.clone(), vec![heightmap_layer()], &fetcher);
        cache.request(key, HEIGHTMAP).unwrap();
        let events = poll_until(&mut cache, |_, events| loaded(events) == 1).await;
        assert_eq!(loaded(&events), 1);
    }
    assert!(dir.path().join("heightmap/zoom_6/2/1.png").is_file());

    let fetcher = Arc::new(MockFetcher::new(Reply::Status(500)));
    let mut cache = cache_with(config, vec![heightmap_layer()], &fetcher);
    assert_eq!(cache.request(key, HEIGHTMAP).unwrap(), RequestStatus::DiskHit);
    assert!(cache.get(key, HEIGHTMAP).is_some());
    assert_eq!(loaded(&cache.poll()), 1);
    assert!(fetcher.calls().is_empty());
    assert_eq!(cache.stats().disk_hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_after_unload_dropped() {
    let fetcher = Arc::new(MockFetcher::gated(ok_png()));
    let mut cache = cache_with(config(), vec![heightmap_layer()], &fetcher);
    let key = TileKey::new(9, 9, 5);

    cache.request(key, HEIGHTMAP).unwrap();
    poll_until(&mut cache, |cache, _| {
        cache.state(key, HEIGHTMAP) == TileState::InFlight
    })
    .await;

    cache.unload(key);
    fetcher.release(1);
    let events = poll_until(&mut cache, |cache, _| cache.stats().stale_results == 1).await;

    assert!(events.is_empty());
    assert!(cache.get(key, HEIGHTMAP).is_none());
    assert_eq!(cache.state(key, HEIGHTMAP), TileState::Unrequested);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_higher_priority_fetched_first() {
    let fetcher = Arc::new(MockFetcher::gated(ok_png()));
    let imagery = LayerDescriptor::new(IMAGERY, IMAGERY_URL, "png").with_priority(1);
    let config = TileCacheConfig {
        fetch_workers: 1,
        ..config()
    };
    let mut cache = cache_with(config, vec![heightmap_layer(), imagery], &fetcher);

    // The single worker blocks on the first request while the rest queue up.
    let first = TileKey::new(0, 0, 3);
    cache.request(first, IMAGERY).unwrap();
    poll_until(&mut cache, |cache, _| {
        cache.state(first, IMAGERY) == TileState::InFlight
    })
    .await;

    let low = TileKey::new(1, 0, 3);
    let high_a = TileKey::new(2, 0, 3);
    let high_b = TileKey::new(3, 0, 3);
    cache.request(low, IMAGERY).unwrap();
    cache.request(high_a, HEIGHTMAP).unwrap();
    cache.request(high_b, HEIGHTMAP).unwrap();

    fetcher.release(4);
    let events = poll_until(&mut cache, |_, events| loaded(events) == 4).await;
    assert_eq!(loaded(&events), 4);
    assert_eq!(
        fetcher.urls(),
        vec![
            url(IMAGERY_URL, first),
            url(HEIGHTMAP_URL, high_a),
            url(HEIGHTMAP_URL, high_b),
            url(IMAGERY_URL, low),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_only_removes_queued() {
    let fetcher = Arc::new(MockFetcher::gated(ok_png()));
    let config = TileCacheConfig {
        fetch_workers: 1,
        ..config()
    };
    let mut cache = cache_with(config, vec![heightmap_layer()], &fetcher);
    let running = TileKey::new(0, 0, 2);
    let queued = TileKey::new(1, 0, 2);

    cache.request(running, HEIGHTMAP).unwrap();
    poll_until(&mut cache, |cache, _| {
        cache.state(running, HEIGHTMAP) == TileState::InFlight
    })
    .await;
    cache.request(queued, HEIGHTMAP).unwrap();

    assert!(cache.cancel(queued, HEIGHTMAP));
    assert!(!cache.cancel(running, HEIGHTMAP));
    assert_eq!(cache.state(queued, HEIGHTMAP), TileState::Unrequested);

    fetcher.release(2);
    let events = poll_until(&mut cache, |_, events| loaded(events) == 1).await;
    assert_eq!(loaded(&events), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.urls(), vec![url(HEIGHTMAP_URL, running)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_layer_errors_fail_fast() {
    let fetcher = Arc::new(MockFetcher::new(ok_png()));
    let mut cache = cache_with(config(), vec![heightmap_layer()], &fetcher);
    let key = TileKey::new(0, 0, 1);

    assert!(matches!(
        cache.request(key, IMAGERY),
        Err(Error::UnknownLayer(_))
    ));
    assert!(matches!(
        cache.request(TileKey::new(4, 0, 1), HEIGHTMAP),
        Err(Error::InvalidTile(_))
    ));

    cache.set_layer_enabled(HEIGHTMAP, false).unwrap();
    let err = cache.request(key, HEIGHTMAP).unwrap_err();
    assert!(matches!(err, Error::LayerDisabled(_)));
    assert_eq!(err.class(), ErrorClass::Configuration);

    cache.set_layer_enabled(HEIGHTMAP, true).unwrap();
    assert_eq!(cache.request(key, HEIGHTMAP).unwrap(), RequestStatus::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_memory_bound_evicts_oldest() {
    let fetcher = Arc::new(MockFetcher::new(ok_png()));
    let config = TileCacheConfig {
        memory_capacity: 2,
        fetch_workers: 1,
        ..config()
    };
    let mut cache = cache_with(config, vec![heightmap_layer()], &fetcher);
    let keys = [
        TileKey::new(0, 0, 2),
        TileKey::new(1, 0, 2),
        TileKey::new(2, 0, 2),
    ];

    for (i, key) in keys.iter().enumerate() {
        cache.request(*key, HEIGHTMAP).unwrap();
        poll_until(&mut cache, |_, events| loaded(events) == 1).await;
        assert_eq!(cache.stats().memory_entries, (i + 1).min(2));
    }

    assert!(cache.peek(keys[0], HEIGHTMAP).is_none());
    assert!(cache.peek(keys[2], HEIGHTMAP).is_some());
    assert_eq!(cache.stats().evictions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_atlas_waits_for_coarse_source() {
    let fetcher = Arc::new(MockFetcher::new(Reply::Body(png_tile(8, 250.0))));
    let layer = heightmap_layer().with_max_native_zoom(10);
    let mut cache = cache_with(config(), vec![layer], &fetcher);
    let compositor = AtlasCompositor::new(4);
    let grid = [
        TileKey::new(0, 0, 12),
        TileKey::new(1, 0, 12),
        TileKey::new(0, 1, 12),
        TileKey::new(1, 1, 12),
    ];

    let pending = compositor.build(&mut cache, HEIGHTMAP, &grid).unwrap();
    let AtlasBuild::Pending { missing } = pending else {
        panic!("expected a pending build");
    };
    assert_eq!(missing, vec![TileKey::new(0, 0, 10)]);

    poll_until(&mut cache, |_, events| loaded(events) == 1).await;
    let AtlasBuild::Ready(atlas) = compositor.build(&mut cache, HEIGHTMAP, &grid).unwrap() else {
        panic!("expected a ready atlas");
    };
    assert_eq!(atlas.entries.len(), 4);
    assert!(atlas.skipped.is_empty());
    assert!(atlas.depends_on(TileKey::new(0, 0, 10)));
    assert_eq!(atlas.source_zoom, 10);
    let height = atlas.sample_height(grid[3], 0.5, 0.5).unwrap();
    assert!((height - 250.0).abs() < 0.01);
    assert_eq!(fetcher.calls().len(), 1);
}
