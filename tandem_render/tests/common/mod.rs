#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::UVec2;
use tandem_render::backend::null::{Null, NullAdapterDesc, NullControl, NullInstance};
use tandem_render::window::HeadlessWindow;
use tandem_render::{Renderer, RendererConfig};

pub fn config(pipeline_cache: &Path) -> RendererConfig {
    RendererConfig {
        shader_dir: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/shaders")),
        shader_debug: false,
        validation: false,
        pipeline_cache_dir: Some(pipeline_cache.to_path_buf()),
        staging_capacity: 1 << 20,
        ..Default::default()
    }
}

pub struct Harness {
    pub renderer: Renderer<Null>,
    pub window: Arc<HeadlessWindow>,
    pub control: Arc<NullControl>,
}

pub fn harness(pipeline_cache: &Path, adapter: NullAdapterDesc, size: UVec2) -> Harness {
    let instance = NullInstance::with_adapters(vec![adapter]);
    let control = instance.control();
    let window = Arc::new(HeadlessWindow::new(size));

    let renderer = Renderer::with_instance(config(pipeline_cache), instance, window.clone())
        .unwrap();

    Harness {
        renderer,
        window,
        control,
    }
}

/// Names of the `.pso` files in `dir`, sorted.
pub fn cache_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".pso"))
        .collect();
    files.sort();
    files
}
