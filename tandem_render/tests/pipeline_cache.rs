mod common;

use glam::UVec2;
use tandem_render::backend::null::{NullAdapterDesc, NullStats};

use common::{cache_files, harness};

const PIPELINES: u64 = 5;

/// Renders one frame with a fresh renderer and returns the device counters.
fn first_frame(dir: &std::path::Path) -> NullStats {
    let mut h = harness(dir, NullAdapterDesc::default(), UVec2::new(64, 64));
    h.renderer.render_frame().unwrap();
    let stats = h.renderer.device().unwrap().raw().stats();
    h.renderer.shutdown().unwrap();
    stats
}

#[test]
fn second_run_hits_cache() {
    let cache = tempfile::tempdir().unwrap();

    let stats = first_frame(cache.path());
    assert_eq!(stats.pipelines_created, PIPELINES);
    assert_eq!(stats.pipelines_from_cache, 0);
    assert_eq!(cache_files(cache.path()).len(), PIPELINES as usize);

    let stats = first_frame(cache.path());
    assert_eq!(stats.pipelines_created, 0);
    assert_eq!(stats.pipelines_from_cache, PIPELINES);
}

#[test]
fn stale_cache_is_replaced() {
    let cache = tempfile::tempdir().unwrap();
    first_frame(cache.path());

    for name in cache_files(cache.path()) {
        std::fs::write(cache.path().join(name), b"not a pipeline").unwrap();
    }

    let stats = first_frame(cache.path());
    assert_eq!(stats.pipelines_created, PIPELINES);
    assert_eq!(stats.pipelines_from_cache, 0);

    let stats = first_frame(cache.path());
    assert_eq!(stats.pipelines_from_cache, PIPELINES);
}

#[test]
fn missing_directory_is_created() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("nested").join("cache");

    first_frame(&dir);
    assert_eq!(cache_files(&dir).len(), PIPELINES as usize);
}

fn blobs(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    cache_files(dir)
        .into_iter()
        .map(|name| {
            let bytes = std::fs::read(dir.join(&name)).unwrap();
            (name, bytes)
        })
        .collect()
}

#[test]
fn cache_blobs_are_reproducible() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();

    first_frame(first.path());
    first_frame(second.path());
    assert_eq!(blobs(first.path()), blobs(second.path()));

    // A run served from the cache leaves the blobs untouched.
    let before = blobs(first.path());
    first_frame(first.path());
    assert_eq!(blobs(first.path()), before);
}
