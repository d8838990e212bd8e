//! Tests for TOML configuration loading.

use std::time::Duration;

use tessera::{Config, TesseraError};

const FULL: &str = r#"
[streamer]
tile_size = 512
max_zoom = 16
cache_megabytes = 64
overview_zooms = [8, 10]
max_in_flight = 8

[progressive]
levels = [2, 4]
cache_megabytes = 32
ttl_secs = 3600
request_max_age_secs = 0

[persistent]
dir = "/var/cache/tessera"
max_megabytes = 256

[memory]
max_total_megabytes = 256
max_layers = 3
pressure_interval_secs = 10
high_water_ratio = 0.85
target_ratio = 0.7

[retry]
max_attempts = 5
initial_delay_ms = 200
timeout_secs = 10
"#;

#[test]
fn defaults_match_component_defaults() {
    let config = Config::default();
    let streamer = config.streamer_config();
    assert_eq!(streamer.tile_size, 256);
    assert_eq!(streamer.max_zoom, 18);
    assert_eq!(streamer.cache_bytes, 100 * 1024 * 1024);
    assert_eq!(streamer.max_in_flight, 4);

    let progressive = config.progressive_config();
    assert_eq!(progressive.levels, vec![1, 2, 4, 8]);
    assert_eq!(progressive.cache_bytes, 200 * 1024 * 1024);
    assert_eq!(progressive.ttl, Duration::from_secs(86_400));
    assert_eq!(progressive.request_max_age, Some(Duration::from_secs(86_400)));

    let limits = config.memory_limits();
    assert_eq!(limits.max_total_memory, 512 * 1024 * 1024);
    assert_eq!(limits.max_layers, 4);
    assert_eq!(limits.thumbnail_budget, 50 * 1024 * 1024);
    assert_eq!(limits.pressure_interval, Duration::from_secs(5));

    let retry = config.retry_config();
    assert_eq!(retry.max_attempts, 3);
    assert_eq!(retry.initial_delay, Duration::from_secs(1));
    assert_eq!(retry.timeout, Duration::from_secs(30));
}

#[test]
fn full_file_converts_into_component_configs() {
    let config = Config::from_toml(FULL).unwrap();

    let streamer = config.streamer_config();
    assert_eq!(streamer.tile_size, 512);
    assert_eq!(streamer.max_zoom, 16);
    assert_eq!(streamer.cache_bytes, 64 * 1024 * 1024);
    assert_eq!(streamer.overview_zooms, vec![8, 10]);
    assert_eq!(streamer.max_in_flight, 8);
    assert_eq!(streamer.retry.max_attempts, 5);

    let progressive = config.progressive_config();
    assert_eq!(progressive.levels, vec![2, 4]);
    assert_eq!(progressive.ttl, Duration::from_secs(3600));
    assert_eq!(progressive.request_max_age, None);
    assert_eq!(progressive.retry.initial_delay, Duration::from_millis(200));

    let persistent = config.persistent_config();
    assert_eq!(persistent.max_bytes, 256 * 1024 * 1024);
    assert_eq!(persistent.ttl, progressive.ttl);
    let store = config.persistent.disk_store().unwrap();
    assert_eq!(store.dir(), std::path::Path::new("/var/cache/tessera"));

    let limits = config.memory_limits();
    assert_eq!(limits.max_layers, 3);
    assert_eq!(limits.high_water_ratio, 0.85);
    assert_eq!(limits.target_ratio, 0.7);
    assert_eq!(limits.pressure_interval, Duration::from_secs(10));
}

#[test]
fn persistent_section_has_no_separate_ttl() {
    let err = Config::from_toml("[persistent]\nttl_secs = 60\n").unwrap_err();
    assert!(matches!(err, TesseraError::Configuration(_)));

    let config = Config::from_toml("[progressive]\nttl_secs = 60\n").unwrap();
    assert_eq!(config.persistent_config().ttl, Duration::from_secs(60));
    assert_eq!(config.progressive_config().ttl, Duration::from_secs(60));
}

#[test]
fn load_reads_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[memory]\nmax_layers = 2\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.memory.max_layers, 2);
    assert_eq!(config.streamer.max_zoom, 18);
}

#[test]
fn missing_explicit_path_is_an_error() {
    let err = Config::load(Some(std::path::Path::new("/nonexistent/tessera.toml"))).unwrap_err();
    assert!(matches!(err, TesseraError::Configuration(msg) if msg.contains("not found")));
}

#[test]
fn invalid_values_are_rejected() {
    for toml in [
        "[progressive]\nlevels = []\n",
        "[retry]\nmax_attempts = 0\n",
        "[streamer]\nmax_in_flight = 0\n",
        "[streamer]\nmax_zoom = 40\n",
        "[memory]\nhigh_water_ratio = 1.5\n",
        "[streamer]\ntile_size = \"big\"\n",
    ] {
        assert!(Config::from_toml(toml).is_err(), "{toml}");
    }
}
