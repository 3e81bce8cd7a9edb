use std::sync::Arc;

use glam::UVec2;
use parking_lot::Mutex;
use tandem_render::backend::null::{Null, NullAdapterDesc, NullInstance};
use tandem_render::backend::{
    CommandEncoder, CommandPool, Device, Queue, QueueKind, Submission, TextureDescriptor,
    TextureFormat, TextureLayout, TextureUsage,
};
use tandem_render::config::{AdapterPreference, DescriptorCapacities};
use tandem_render::device::RenderDevice;
use tandem_render::staging::{ReadbackBuffer, SubresourceData, UploadEngine};

fn device(deferred: bool) -> RenderDevice<Null> {
    let instance = NullInstance::with_adapters(vec![NullAdapterDesc {
        deferred,
        ..Default::default()
    }]);

    RenderDevice::new(
        &instance,
        &AdapterPreference::HighPerformance,
        &DescriptorCapacities::default(),
    )
    .unwrap()
}

fn round_trip(deferred: bool) {
    let device = device(deferred);
    let mut uploads = UploadEngine::new(&device, 1 << 16).unwrap();

    let pixels: Vec<u8> = (0..8 * 8)
        .flat_map(|i: u32| [i as u8, (i * 3) as u8, 255 - i as u8, 255])
        .collect();
    let descriptor = TextureDescriptor::new_2d(
        UVec2::new(8, 8),
        TextureFormat::Rgba8Unorm,
        TextureUsage::SAMPLED | TextureUsage::TRANSFER_SRC,
    );

    let slot = Arc::new(Mutex::new(None));
    uploads.begin_loading(&device).unwrap();
    uploads
        .load_texture(
            &device,
            &descriptor,
            &[SubresourceData::packed(&pixels, 8 * 4, 8)],
            slot.clone(),
        )
        .unwrap();
    uploads.finish_loading(&device).unwrap();

    let mut pool = device.raw().create_command_pool(QueueKind::Graphics).unwrap();
    let mut encoder = pool.create_encoder().unwrap();
    unsafe {
        encoder.begin().unwrap();
    }

    uploads.finalise_all(&device, &mut encoder).unwrap();
    let mut texture = slot.lock().take().unwrap();
    assert_eq!(texture.layout(), TextureLayout::ShaderRead);

    let readback = ReadbackBuffer::record(&device, &mut encoder, &mut texture).unwrap();
    assert_eq!(texture.layout(), TextureLayout::CopySrc);

    let fence = device.raw().create_fence(0).unwrap();
    unsafe {
        encoder.end().unwrap();
        device
            .graphics_queue()
            .submit(&Submission {
                encoders: &[&encoder],
                wait: &[],
                signal: &[(&fence, 1)],
                swapchain: None,
            })
            .unwrap();
    }
    device.raw().wait_fence(&fence, 1).unwrap();

    assert_eq!(readback.subresource_count(), 1);
    assert_eq!(readback.read(0).unwrap(), pixels);
}

#[test]
fn texture_round_trip() {
    round_trip(false);
}

#[test]
fn texture_round_trip_deferred() {
    round_trip(true);
}
