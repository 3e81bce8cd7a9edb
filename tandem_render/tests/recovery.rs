mod common;

use glam::UVec2;
use tandem_render::backend::null::NullAdapterDesc;
use tandem_render::mesh::MeshData;
use tandem_render::passes::SCENE_COLOR;
use tandem_render::renderer::FrameStatus;

use common::harness;

#[test]
fn device_loss_restarts_device() {
    let cache = tempfile::tempdir().unwrap();
    let mut h = harness(cache.path(), NullAdapterDesc::default(), UVec2::new(64, 64));

    let mesh = h.renderer.add_mesh(MeshData::cube(0.5)).unwrap();
    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Presented(1));
    assert!(h.renderer.scene().lock().mesh_slot(mesh).unwrap().lock().is_some());

    h.control.lose_device();
    assert_eq!(
        h.renderer.render_frame().unwrap(),
        FrameStatus::DeviceRestarted
    );
    assert!(h.renderer.scene().lock().mesh_slot(mesh).unwrap().lock().is_none());
    assert!(h.renderer.graph().is_none());

    // The new swapchain starts counting from zero.
    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Presented(1));
    assert!(h.renderer.scene().lock().mesh_slot(mesh).unwrap().lock().is_some());
    assert!(h.renderer.graph().is_some());
}

#[test]
fn out_of_date_swapchain_is_rebuilt() {
    let cache = tempfile::tempdir().unwrap();
    let mut h = harness(cache.path(), NullAdapterDesc::default(), UVec2::new(64, 64));

    h.renderer.render_frame().unwrap();

    h.control.invalidate_swapchain();
    // The present fence still advances for the frame that failed to present.
    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Presented(2));

    h.control.set_surface_size(UVec2::new(48, 32));
    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Presented(3));

    let color = h.renderer.graph().unwrap().attachment(SCENE_COLOR).unwrap();
    assert_eq!(color.size(), UVec2::new(48, 32));

    for frame in 4..10 {
        assert_eq!(
            h.renderer.render_frame().unwrap(),
            FrameStatus::Presented(frame)
        );
    }
}

#[test]
fn minimized_window_skips_frames() {
    let cache = tempfile::tempdir().unwrap();
    let mut h = harness(cache.path(), NullAdapterDesc::default(), UVec2::new(64, 64));

    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Presented(1));

    h.window.set_size(UVec2::ZERO);
    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Skipped);
    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Skipped);

    h.window.set_size(UVec2::new(80, 60));
    assert_eq!(h.renderer.render_frame().unwrap(), FrameStatus::Presented(2));

    let color = h.renderer.graph().unwrap().attachment(SCENE_COLOR).unwrap();
    assert_eq!(color.size(), UVec2::new(80, 60));
}
