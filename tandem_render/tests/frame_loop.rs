mod common;

use glam::{Mat4, UVec2, Vec2, Vec3};
use tandem_render::backend::null::NullAdapterDesc;
use tandem_render::mesh::MeshData;
use tandem_render::passes::{BLIT_PASS, COMPOSITE_PASS};
use tandem_render::renderer::FrameStatus;
use tandem_render::scene::{DebugLine, MeshInstance};
use tandem_render::texture::ImageData;
use tandem_render::ui::{RectUi, UiContext};

use common::{cache_files, harness};

fn run_frames(adapter: NullAdapterDesc) {
    let cache = tempfile::tempdir().unwrap();
    let mut h = harness(cache.path(), adapter, UVec2::new(320, 240));

    for frame in 1..=1000 {
        assert_eq!(
            h.renderer.render_frame().unwrap(),
            FrameStatus::Presented(frame)
        );
    }

    assert_eq!(h.renderer.present_value(), 1000);

    let stats = h.renderer.frame_stats();
    assert_eq!(stats.frames, 1000);
    assert_eq!(stats.reuse_violations, 0);

    h.renderer.shutdown().unwrap();
}

#[test]
fn thousand_frames_immediate() {
    run_frames(NullAdapterDesc::default());
}

#[test]
fn thousand_frames_deferred() {
    run_frames(NullAdapterDesc {
        deferred: true,
        ..Default::default()
    });
}

#[test]
fn presents_reach_the_device() {
    let cache = tempfile::tempdir().unwrap();
    let mut h = harness(cache.path(), NullAdapterDesc::default(), UVec2::new(64, 64));

    for _ in 0..10 {
        h.renderer.render_frame().unwrap();
    }

    let stats = h.renderer.device().unwrap().raw().stats();
    assert_eq!(stats.presents, 10);
    // Upload batch plus one submission per frame.
    assert_eq!(stats.submissions, 11);
}

#[test]
fn default_graph_uses_distinct_pipelines() {
    let cache = tempfile::tempdir().unwrap();
    let mut h = harness(cache.path(), NullAdapterDesc::default(), UVec2::new(64, 64));

    let mesh = h.renderer.add_mesh(MeshData::cube(1.0)).unwrap();
    let texture = h
        .renderer
        .add_texture(ImageData::solid([200, 100, 50, 255]))
        .unwrap();
    h.renderer.add_instance(MeshInstance {
        mesh,
        texture: Some(texture),
        transform: Mat4::IDENTITY,
    });
    h.renderer.push_line(DebugLine {
        start: Vec3::ZERO,
        end: Vec3::X,
        color: [255, 0, 0, 255],
    });

    let mut ui = RectUi::new();
    ui.begin_frame(UVec2::new(64, 64));
    ui.rect(Vec2::ZERO, Vec2::new(10.0, 10.0), [255; 4]);
    h.renderer.set_ui(ui.end_frame());

    h.renderer.render_frame().unwrap();
    h.renderer.render_frame().unwrap();

    let names = h.renderer.graph().unwrap().sorted_names();
    assert_eq!(names.len(), 5);
    assert_eq!(&names[3..], [COMPOSITE_PASS, BLIT_PASS]);

    let labels: Vec<_> = cache_files(cache.path())
        .iter()
        .map(|name| {
            // <label>-<hex32>-<hex32>.pso
            let stem = name.strip_suffix(".pso").unwrap();
            let mut parts = stem.rsplitn(3, '-');
            let fragment = parts.next().unwrap();
            let vertex = parts.next().unwrap();
            assert_eq!(fragment.len(), 32);
            assert_eq!(vertex.len(), 32);
            assert!(fragment.chars().all(|c| c.is_ascii_hexdigit()));
            parts.next().unwrap().to_owned()
        })
        .collect();

    assert_eq!(
        labels,
        [
            "debug-geometry",
            "draw-model",
            "final-composite",
            "image-blit",
            "ui-overlay",
        ]
    );

    let stats = h.renderer.device().unwrap().raw().stats();
    assert!(stats.draws_executed > 0);
}

#[test]
fn debug_lines_last_one_frame() {
    let cache = tempfile::tempdir().unwrap();
    let mut h = harness(cache.path(), NullAdapterDesc::default(), UVec2::new(32, 32));

    h.renderer.push_line(DebugLine {
        start: Vec3::ZERO,
        end: Vec3::Y,
        color: [0, 0, 255, 255],
    });
    assert_eq!(h.renderer.scene().lock().debug_lines().len(), 1);

    h.renderer.render_frame().unwrap();
    assert!(h.renderer.scene().lock().debug_lines().is_empty());
}
