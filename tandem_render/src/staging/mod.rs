//! Asynchronous uploads of host data into device-local resources.
//!
//! Uploads are recorded between [`UploadEngine::begin_loading`] and
//! [`UploadEngine::finish_loading`] on the transfer queue. Host data is first copied
//! into a persistently mapped staging arena and then copied into the destination
//! resource by the GPU. Callbacks registered with [`UploadEngine::on_finalise`] run on
//! the graphics recording thread once the copies of their batch completed and
//! typically transition the resource for shader access.

pub mod footprint;

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_tracing::trace_span;

use crate::backend::allocator::{BuddyAllocator, Region};
use crate::backend::{
    Api, BufferBarrier, BufferState, BufferUsage, CommandEncoder, CommandPool, Device,
    MemoryLocation, QueueKind, Queue, Submission, TextureDescriptor, TextureLayout,
    TextureUsage,
};
use crate::device::RenderDevice;
use crate::error::{Error, Result};
use crate::resources::{Buffer, ResourceAllocator, Texture};

pub use footprint::{CopyLayout, SubresourceData};

/// Number of upload contexts recording in turn.
const UPLOAD_CONTEXTS: usize = 2;

/// Alignment of buffer uploads in the staging arena.
const BUFFER_ALIGNMENT: u64 = 16;

/// A location the finalise callback stores a loaded resource into.
pub type ResourceSlot<T> = Arc<Mutex<Option<T>>>;

pub type FinaliseFn<A> = Box<dyn FnOnce(&mut FinaliseContext<'_, A>)>;

/// Passed to finalise callbacks.
pub struct FinaliseContext<'a, A: Api> {
    pub device: &'a A::Device,
    /// The graphics encoder of the current frame.
    pub encoder: &'a mut A::CommandEncoder,
}

struct UploadContext<A: Api> {
    pool: A::CommandPool,
    encoder: A::CommandEncoder,
    /// Fence value signaled by the last batch recorded with this context.
    fence_value: u64,
}

struct PendingCallback<A: Api> {
    value: u64,
    callback: FinaliseFn<A>,
}

#[derive(Copy, Clone, Debug)]
struct InFlightRegion {
    value: u64,
    region: Region,
}

pub struct UploadEngine<A: Api> {
    contexts: Vec<UploadContext<A>>,
    current: usize,
    fence: A::Fence,
    /// Last fence value submitted to the transfer queue.
    submitted: u64,
    /// Last fence value observed as completed.
    completed: u64,
    recording: bool,
    callbacks: VecDeque<PendingCallback<A>>,
    arena: Buffer<A>,
    allocator: BuddyAllocator,
    /// Regions of submitted batches, in submission order.
    in_flight: VecDeque<InFlightRegion>,
    /// Regions of the batch being recorded.
    batch: Vec<Region>,
}

impl<A: Api> UploadEngine<A> {
    /// Creates the engine with a staging arena of at least `capacity` bytes.
    pub fn new(device: &RenderDevice<A>, capacity: u64) -> Result<Self> {
        let capacity = capacity.max(1).next_power_of_two();
        tracing::debug!("creating staging arena of {} bytes", capacity);

        let arena = ResourceAllocator::<A>::new(device.raw()).create_staging_buffer(capacity)?;

        let mut contexts = Vec::with_capacity(UPLOAD_CONTEXTS);
        for _ in 0..UPLOAD_CONTEXTS {
            let mut pool = device.raw().create_command_pool(QueueKind::Transfer)?;
            let encoder = pool.create_encoder()?;
            contexts.push(UploadContext {
                pool,
                encoder,
                fence_value: 0,
            });
        }

        Ok(Self {
            contexts,
            current: 0,
            fence: device.raw().create_fence(0)?,
            submitted: 0,
            completed: 0,
            recording: false,
            callbacks: VecDeque::new(),
            arena,
            allocator: BuddyAllocator::new(capacity),
            in_flight: VecDeque::new(),
            batch: Vec::new(),
        })
    }

    pub fn is_loading(&self) -> bool {
        self.recording
    }

    pub fn submitted_value(&self) -> u64 {
        self.submitted
    }

    /// Last completed fence value observed by [`finalise_ready`].
    ///
    /// [`finalise_ready`]: Self::finalise_ready
    pub fn completed_value(&self) -> u64 {
        self.completed
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Bytes of the staging arena in use by batches that did not complete.
    pub fn arena_used(&self) -> u64 {
        self.allocator.used()
    }

    pub fn arena_capacity(&self) -> u64 {
        self.allocator.capacity()
    }

    /// Starts recording a new batch of uploads.
    ///
    /// Blocks if the upload context being reused is still executing.
    pub fn begin_loading(&mut self, device: &RenderDevice<A>) -> Result<()> {
        let _span = trace_span!("UploadEngine::begin_loading").entered();

        if self.recording {
            return Err(Error::Backend("begin_loading called twice".to_owned()));
        }

        let context = &mut self.contexts[self.current];
        if context.fence_value > self.completed {
            device.raw().wait_fence(&self.fence, context.fence_value)?;
        }

        // SAFETY: The last batch recorded with this context completed above.
        unsafe {
            context.pool.reset()?;
            context.encoder.begin()?;
        }

        self.recording = true;
        Ok(())
    }

    /// Creates a device-local buffer holding `data` and records the copy.
    pub fn upload_buffer(
        &mut self,
        device: &RenderDevice<A>,
        data: &[u8],
        usage: BufferUsage,
    ) -> Result<Buffer<A>> {
        let _span = trace_span!("UploadEngine::upload_buffer").entered();
        self.ensure_recording()?;

        let buffer = ResourceAllocator::<A>::new(device.raw()).create_buffer(
            data.len() as u64,
            usage | BufferUsage::TRANSFER_DST,
            MemoryLocation::DeviceLocal,
        )?;

        let region = self.alloc(device, data.len() as u64, BUFFER_ALIGNMENT)?;
        self.arena.write(region.offset, data)?;

        let encoder = &mut self.contexts[self.current].encoder;
        encoder.copy_buffer_to_buffer(
            self.arena.raw(),
            region.offset,
            buffer.raw(),
            0,
            data.len() as u64,
        );

        Ok(buffer)
    }

    /// Creates a device-local texture and records the copies of all `subresources`.
    ///
    /// `subresources` are ordered by subresource index (`mip + layer * mip_levels`).
    /// The returned texture is in [`TextureLayout::CopyDst`].
    pub fn upload_texture(
        &mut self,
        device: &RenderDevice<A>,
        descriptor: &TextureDescriptor,
        subresources: &[SubresourceData<'_>],
    ) -> Result<Texture<A>> {
        let _span = trace_span!("UploadEngine::upload_texture").entered();
        self.ensure_recording()?;

        if subresources.len() != descriptor.subresource_count() as usize {
            return Err(Error::Backend(format!(
                "texture has {} subresources, got data for {}",
                descriptor.subresource_count(),
                subresources.len()
            )));
        }

        let descriptor = TextureDescriptor {
            usage: descriptor.usage | TextureUsage::TRANSFER_DST,
            ..*descriptor
        };
        let mut texture = ResourceAllocator::<A>::new(device.raw()).create_texture(&descriptor)?;

        let limits = device.limits();
        let count = descriptor.subresource_count();
        let size = footprint::compute_footprints(&descriptor, 0, count, 0, limits).total_size;

        let region = self.alloc(device, size, limits.placement_alignment)?;
        let layout =
            footprint::compute_footprints(&descriptor, 0, count, region.offset, limits);

        for (footprint, data) in layout.footprints.iter().zip(subresources) {
            footprint::copy_subresource(&self.arena, footprint, data)?;
        }

        let encoder = &mut self.contexts[self.current].encoder;
        texture.transition(encoder, TextureLayout::CopyDst);
        for (index, footprint) in layout.footprints.iter().enumerate() {
            encoder.copy_buffer_to_texture(
                self.arena.raw(),
                footprint,
                texture.raw(),
                footprint::subresource(&descriptor, index as u32),
            );
        }

        Ok(texture)
    }

    /// Uploads a buffer and stores it in `slot` once it is ready for use.
    pub fn load_buffer(
        &mut self,
        device: &RenderDevice<A>,
        data: &[u8],
        usage: BufferUsage,
        slot: ResourceSlot<Buffer<A>>,
    ) -> Result<()> {
        let buffer = self.upload_buffer(device, data, usage)?;
        let state = buffer_state(usage);

        self.on_finalise(move |ctx| {
            ctx.encoder.buffer_barriers(&[BufferBarrier {
                buffer: buffer.raw(),
                src: BufferState::CopyDst,
                dst: state,
            }]);
            *slot.lock() = Some(buffer);
        });

        Ok(())
    }

    /// Uploads a texture and stores it in `slot` in [`TextureLayout::ShaderRead`] once
    /// it is ready for use.
    pub fn load_texture(
        &mut self,
        device: &RenderDevice<A>,
        descriptor: &TextureDescriptor,
        subresources: &[SubresourceData<'_>],
        slot: ResourceSlot<Texture<A>>,
    ) -> Result<()> {
        let mut texture = self.upload_texture(device, descriptor, subresources)?;

        self.on_finalise(move |ctx| {
            texture.transition(ctx.encoder, TextureLayout::ShaderRead);
            *slot.lock() = Some(texture);
        });

        Ok(())
    }

    /// Registers a callback that runs once the current batch completed.
    ///
    /// Outside of a loading session the callback waits for the last submitted batch.
    /// Callbacks run in registration order.
    pub fn on_finalise<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut FinaliseContext<'_, A>) + 'static,
    {
        let value = if self.recording {
            self.submitted + 1
        } else {
            self.submitted
        };

        debug_assert!(self
            .callbacks
            .back()
            .map_or(true, |last| last.value <= value));
        self.callbacks.push_back(PendingCallback {
            value,
            callback: Box::new(callback),
        });
    }

    /// Closes the current batch and submits it to the transfer queue.
    ///
    /// Returns the fence value signaled once the batch completed.
    pub fn finish_loading(&mut self, device: &RenderDevice<A>) -> Result<u64> {
        let _span = trace_span!("UploadEngine::finish_loading").entered();
        self.ensure_recording()?;

        let value = self.submitted + 1;
        let context = &mut self.contexts[self.current];

        // SAFETY: The encoder is recording and the staging regions referenced by it are
        // only reclaimed after `value` was reached.
        unsafe {
            context.encoder.end()?;
            device.transfer_queue().submit(&Submission {
                encoders: &[&context.encoder],
                wait: &[],
                signal: &[(&self.fence, value)],
                swapchain: None,
            })?;
        }

        context.fence_value = value;
        self.submitted = value;
        self.recording = false;
        self.current = (self.current + 1) % self.contexts.len();

        self.in_flight.extend(
            self.batch
                .drain(..)
                .map(|region| InFlightRegion { value, region }),
        );

        tracing::trace!("submitted upload batch {}", value);
        Ok(value)
    }

    /// Runs every callback whose batch completed, in registration order.
    ///
    /// Returns the number of callbacks that ran.
    pub fn finalise_ready(
        &mut self,
        device: &RenderDevice<A>,
        encoder: &mut A::CommandEncoder,
    ) -> Result<usize> {
        let _span = trace_span!("UploadEngine::finalise_ready").entered();

        self.poll(device)?;

        let mut ctx = FinaliseContext {
            device: device.raw(),
            encoder,
        };

        let mut count = 0;
        while self
            .callbacks
            .front()
            .is_some_and(|pending| pending.value <= self.completed)
        {
            if let Some(pending) = self.callbacks.pop_front() {
                (pending.callback)(&mut ctx);
                count += 1;
            }
        }

        Ok(count)
    }

    /// Blocks until all submitted batches completed and runs all callbacks.
    pub fn finalise_all(
        &mut self,
        device: &RenderDevice<A>,
        encoder: &mut A::CommandEncoder,
    ) -> Result<usize> {
        let _span = trace_span!("UploadEngine::finalise_all").entered();

        if self.recording {
            return Err(Error::Backend(
                "finalise_all called before finish_loading".to_owned(),
            ));
        }

        device.raw().wait_fence(&self.fence, self.submitted)?;
        let count = self.finalise_ready(device, encoder)?;
        debug_assert!(self.callbacks.is_empty());
        Ok(count)
    }

    /// Blocks until all submitted batches completed. Callbacks are not run.
    pub fn wait_idle(&mut self, device: &RenderDevice<A>) -> Result<()> {
        device.raw().wait_fence(&self.fence, self.submitted)?;
        self.poll(device)
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.recording {
            Ok(())
        } else {
            Err(Error::Backend(
                "upload recorded outside of begin_loading/finish_loading".to_owned(),
            ))
        }
    }

    /// Reads the fence and reclaims the staging regions of completed batches.
    fn poll(&mut self, device: &RenderDevice<A>) -> Result<()> {
        self.completed = device.raw().fence_value(&self.fence)?;

        while let Some(region) = self.in_flight.front().copied() {
            if region.value > self.completed {
                break;
            }

            self.in_flight.pop_front();
            self.allocator.free(region.region);
        }

        Ok(())
    }

    fn alloc(&mut self, device: &RenderDevice<A>, size: u64, align: u64) -> Result<Region> {
        let region = match self.allocator.alloc(size, align) {
            Some(region) => region,
            None => {
                self.poll(device)?;
                self.allocator
                    .alloc(size, align)
                    .ok_or(Error::OutOfCapacity("staging arena"))?
            }
        };

        self.batch.push(region);
        Ok(region)
    }
}

impl<A: Api> Debug for UploadEngine<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadEngine")
            .field("submitted", &self.submitted)
            .field("completed", &self.completed)
            .field("recording", &self.recording)
            .field("pending_callbacks", &self.callbacks.len())
            .field("arena_used", &self.allocator.used())
            .finish_non_exhaustive()
    }
}

fn buffer_state(usage: BufferUsage) -> BufferState {
    if usage.contains(BufferUsage::VERTEX) {
        BufferState::Vertex
    } else if usage.contains(BufferUsage::INDEX) {
        BufferState::Index
    } else if usage.contains(BufferUsage::UNIFORM) {
        BufferState::Uniform
    } else {
        BufferState::ShaderRead
    }
}

/// A host-visible copy of all subresources of a texture.
pub struct ReadbackBuffer<A: Api> {
    buffer: Buffer<A>,
    layout: CopyLayout,
}

impl<A: Api> ReadbackBuffer<A> {
    /// Records the copy of every subresource of `texture` into a new host-visible
    /// buffer.
    ///
    /// The contents can be read once the submission of `encoder` completed. The
    /// texture is left in [`TextureLayout::CopySrc`].
    pub fn record(
        device: &RenderDevice<A>,
        encoder: &mut A::CommandEncoder,
        texture: &mut Texture<A>,
    ) -> Result<Self> {
        let _span = trace_span!("ReadbackBuffer::record").entered();

        let descriptor = *texture.descriptor();
        let layout = footprint::compute_footprints(
            &descriptor,
            0,
            descriptor.subresource_count(),
            0,
            device.limits(),
        );

        let buffer =
            ResourceAllocator::<A>::new(device.raw()).create_readback_buffer(layout.total_size)?;

        texture.transition(encoder, TextureLayout::CopySrc);
        for (index, footprint) in layout.footprints.iter().enumerate() {
            encoder.copy_texture_to_buffer(
                texture.raw(),
                footprint::subresource(&descriptor, index as u32),
                buffer.raw(),
                footprint,
            );
        }

        Ok(Self { buffer, layout })
    }

    pub fn subresource_count(&self) -> usize {
        self.layout.footprints.len()
    }

    /// Returns the tightly packed rows of subresource `index`.
    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        let footprint = self.layout.footprints.get(index).ok_or_else(|| {
            Error::Backend(format!("readback has no subresource {}", index))
        })?;

        footprint::read_subresource(&self.buffer, footprint)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use glam::UVec2;
    use parking_lot::Mutex;

    use crate::backend::null::{Null, NullAdapterDesc, NullCommand, NullCommandEncoder};
    use crate::backend::{
        BufferUsage, CommandEncoder, CommandPool, Device, QueueKind, TextureDescriptor,
        TextureFormat, TextureLayout, TextureUsage,
    };
    use crate::device::RenderDevice;
    use crate::error::Error;
    use crate::test_util::{render_device, render_device_with};

    use super::{SubresourceData, UploadEngine};

    fn graphics_encoder(device: &RenderDevice<Null>) -> NullCommandEncoder {
        let mut pool = device.raw().create_command_pool(QueueKind::Graphics).unwrap();
        let mut encoder = pool.create_encoder().unwrap();
        unsafe {
            encoder.begin().unwrap();
        }
        encoder
    }

    fn rgba(size: u32) -> TextureDescriptor {
        TextureDescriptor::new_2d(
            UVec2::splat(size),
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        )
    }

    #[test]
    fn upload_requires_loading_session() {
        let device = render_device();
        let mut engine = UploadEngine::<Null>::new(&device, 4096).unwrap();

        assert!(engine
            .upload_buffer(&device, &[0; 16], BufferUsage::VERTEX)
            .is_err());
        assert!(engine.finish_loading(&device).is_err());

        engine.begin_loading(&device).unwrap();
        assert!(engine.begin_loading(&device).is_err());
    }

    #[test]
    fn callbacks_run_in_fifo_order() {
        let device = render_device_with(NullAdapterDesc {
            deferred: true,
            ..Default::default()
        });
        let mut engine = UploadEngine::<Null>::new(&device, 4096).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        engine.begin_loading(&device).unwrap();
        for id in 0..3 {
            let order = order.clone();
            engine.on_finalise(move |_| order.borrow_mut().push(id));
        }
        engine.finish_loading(&device).unwrap();

        engine.begin_loading(&device).unwrap();
        for id in 3..5 {
            let order = order.clone();
            engine.on_finalise(move |_| order.borrow_mut().push(id));
        }
        engine.finish_loading(&device).unwrap();

        let mut encoder = graphics_encoder(&device);

        // Nothing executed yet on the deferred device.
        assert_eq!(engine.finalise_ready(&device, &mut encoder).unwrap(), 0);
        assert_eq!(engine.pending_callbacks(), 5);

        assert_eq!(engine.finalise_all(&device, &mut encoder).unwrap(), 5);
        assert_eq!(*order.borrow(), [0, 1, 2, 3, 4]);
        assert_eq!(engine.completed_value(), 2);
    }

    #[test]
    fn callbacks_wait_for_their_batch() {
        let device = render_device_with(NullAdapterDesc {
            deferred: true,
            ..Default::default()
        });
        let mut engine = UploadEngine::<Null>::new(&device, 4096).unwrap();
        let ran = Rc::new(RefCell::new(Vec::new()));

        engine.begin_loading(&device).unwrap();
        let first = ran.clone();
        engine.on_finalise(move |_| first.borrow_mut().push(1));
        let value = engine.finish_loading(&device).unwrap();

        engine.begin_loading(&device).unwrap();
        let second = ran.clone();
        engine.on_finalise(move |_| second.borrow_mut().push(2));
        engine.finish_loading(&device).unwrap();

        device.raw().wait_fence(&engine.fence, value).unwrap();

        let mut encoder = graphics_encoder(&device);
        assert_eq!(engine.finalise_ready(&device, &mut encoder).unwrap(), 1);
        assert_eq!(*ran.borrow(), [1]);
    }

    #[test]
    fn texture_round_trip() {
        let device = render_device();
        let mut engine = UploadEngine::<Null>::new(&device, 1 << 16).unwrap();

        let pattern: Vec<u8> = (0..8 * 8 * 4).map(|i| (i * 7 % 251) as u8).collect();
        let slot = Arc::new(Mutex::new(None));

        engine.begin_loading(&device).unwrap();
        engine
            .load_texture(
                &device,
                &rgba(8),
                &[SubresourceData::packed(&pattern, 32, 8)],
                slot.clone(),
            )
            .unwrap();
        engine.finish_loading(&device).unwrap();

        let mut encoder = graphics_encoder(&device);
        assert!(slot.lock().is_none());
        engine.finalise_all(&device, &mut encoder).unwrap();

        let texture = slot.lock().take().unwrap();
        assert_eq!(texture.layout(), TextureLayout::ShaderRead);
        assert_eq!(
            texture.raw().read_subresource(crate::backend::Subresource {
                mip_level: 0,
                array_layer: 0,
            }),
            pattern
        );

        assert!(encoder.commands().iter().any(|command| matches!(
            command,
            NullCommand::TextureBarrier {
                src: TextureLayout::CopyDst,
                dst: TextureLayout::ShaderRead,
                ..
            }
        )));
    }

    #[test]
    fn buffer_upload_copies_data() {
        let device = render_device();
        let mut engine = UploadEngine::<Null>::new(&device, 4096).unwrap();
        let slot = Arc::new(Mutex::new(None));

        engine.begin_loading(&device).unwrap();
        engine
            .load_buffer(&device, &[3; 64], BufferUsage::VERTEX, slot.clone())
            .unwrap();
        engine.finish_loading(&device).unwrap();

        let mut encoder = graphics_encoder(&device);
        engine.finalise_all(&device, &mut encoder).unwrap();

        let buffer = slot.lock().take().unwrap();
        assert_eq!(buffer.raw().read_bytes(0, 64), vec![3; 64]);
    }

    #[test]
    fn staging_arena_is_reclaimed() {
        let device = render_device_with(NullAdapterDesc {
            deferred: true,
            ..Default::default()
        });
        let mut engine = UploadEngine::<Null>::new(&device, 1024).unwrap();

        engine.begin_loading(&device).unwrap();
        engine
            .upload_buffer(&device, &[1; 1024], BufferUsage::VERTEX)
            .unwrap();
        assert!(matches!(
            engine.upload_buffer(&device, &[1; 16], BufferUsage::VERTEX),
            Err(Error::OutOfCapacity(_))
        ));
        engine.finish_loading(&device).unwrap();
        assert_eq!(engine.arena_used(), 1024);

        device.raw().flush();

        engine.begin_loading(&device).unwrap();
        engine
            .upload_buffer(&device, &[2; 512], BufferUsage::VERTEX)
            .unwrap();
        engine.finish_loading(&device).unwrap();
        assert_eq!(engine.arena_used(), 512);
    }

    #[test]
    fn texture_subresource_count_mismatch() {
        let device = render_device();
        let mut engine = UploadEngine::<Null>::new(&device, 4096).unwrap();

        engine.begin_loading(&device).unwrap();
        let desc = TextureDescriptor {
            mip_levels: 2,
            ..rgba(4)
        };
        let data = [0; 64];
        assert!(engine
            .upload_texture(&device, &desc, &[SubresourceData::packed(&data, 16, 4)])
            .is_err());
    }
}
