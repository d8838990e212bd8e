//! Tests for the reqwest-backed fetcher against a wiremock server.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tessera::{
    BoundingBox, ByteRange, FetchRequest, Fetcher, HttpFetcher, QueryTileLocator, RetryConfig,
    StreamerConfig, TesseraError, TileStreamer, Viewport,
};

#[tokio::test]
async fn sends_range_and_cache_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scene.tif"))
        .and(header("range", "bytes=0-1023"))
        .and(header("cache-control", "max-age=86400"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 1024]))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new().unwrap();
    let request = FetchRequest::new(format!("{}/scene.tif", server.uri()))
        .range(Some(ByteRange::new(0, 1023)))
        .max_age(Duration::from_secs(86_400));

    let body = fetcher.fetch(&request).await.unwrap();
    assert_eq!(body.len(), 1024);
}

#[tokio::test]
async fn not_found_maps_to_permanent_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new().unwrap();
    let err = fetcher
        .fetch(&FetchRequest::new(format!("{}/missing", server.uri())))
        .await
        .unwrap_err();

    assert!(matches!(err, TesseraError::Api { status: 404, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new().unwrap();
    let err = fetcher
        .fetch(&FetchRequest::new(server.uri()))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::with_timeout(Duration::from_millis(100)).unwrap();
    let err = fetcher
        .fetch(&FetchRequest::new(server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::Timeout(_)));
}

#[tokio::test]
async fn streamer_requests_each_tile_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scene.tif"))
        .and(query_param("tile", "0/0/0"))
        .and(header("range", "bytes=0-99"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"root".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let streamer = TileStreamer::builder(Arc::new(HttpFetcher::new().unwrap()))
        .config(StreamerConfig::new().retry(RetryConfig::disabled()))
        .locator(Arc::new(QueryTileLocator::with_range_fn(|_| {
            Some(ByteRange::new(0, 99))
        })))
        .build();

    let viewport = Viewport::new(BoundingBox::new(-180.0, -85.0, 180.0, 85.0), 0.0);
    let url = format!("{}/scene.tif", server.uri());

    let mut tiles = Vec::new();
    let summary = streamer
        .stream_tiles(&url, &viewport, |data, key| tiles.push((key.to_string(), data.clone())), |_, _| {})
        .await;
    assert_eq!(summary.succeeded(), 1);
    assert_eq!(tiles[0].0, "0/0/0");
    assert_eq!(tiles[0].1.as_ref(), b"root");

    // Second pass is served from the tile cache; `expect(1)` verifies on drop.
    let again = streamer.stream_tiles(&url, &viewport, |_, _| {}, |_, _| {}).await;
    assert_eq!(again.cache_hits, 1);
}
