//! Ring of submission contexts recording frames ahead of the GPU.

use std::fmt::{self, Debug, Formatter};

use tandem_tracing::trace_span;

use crate::backend::{Api, CommandEncoder, CommandPool, Device, QueueKind, Queue, Submission};
use crate::device::RenderDevice;
use crate::error::{Error, Result};
use crate::swapchain::WindowSwapchain;

/// Counters of the frame loop.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames started on the ring.
    pub frames: u64,
    /// Contexts that were reset before the frame last recorded with them completed.
    pub reuse_violations: u64,
}

/// Command pool and encoder of one frame in flight.
pub struct SubmissionContext<A: Api> {
    // The encoder must be dropped before its pool.
    encoder: A::CommandEncoder,
    pool: A::CommandPool,
    index: usize,
    present_fence_value: u64,
    recording: bool,
}

impl<A: Api> SubmissionContext<A> {
    pub fn new(device: &RenderDevice<A>, index: usize) -> Result<Self> {
        let mut pool = device.raw().create_command_pool(QueueKind::Graphics)?;
        let encoder = pool.create_encoder()?;

        Ok(Self {
            encoder,
            pool,
            index,
            present_fence_value: 0,
            recording: false,
        })
    }

    /// Position of the context in its ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Present fence value that retires the last frame recorded with this context.
    pub fn present_fence_value(&self) -> u64 {
        self.present_fence_value
    }

    pub fn set_present_fence_value(&mut self, value: u64) {
        debug_assert!(value > self.present_fence_value);
        self.present_fence_value = value;
    }

    pub fn encoder(&mut self) -> &mut A::CommandEncoder {
        &mut self.encoder
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Resets the pool and starts recording with the device descriptor heaps bound.
    ///
    /// # Safety
    ///
    /// The frame last recorded with this context must have completed.
    pub unsafe fn begin_rendering(&mut self) -> Result<&mut A::CommandEncoder> {
        // SAFETY: Guaranteed by the caller.
        unsafe {
            self.pool.reset()?;
            self.encoder.begin()?;
        }

        self.encoder.bind_descriptor_heaps();
        self.recording = true;
        Ok(&mut self.encoder)
    }

    /// Discards the frame being recorded without submitting it.
    pub fn abandon(&mut self) {
        if !self.recording {
            return;
        }
        self.recording = false;

        // Closing leaves the encoder in a state its pool can reset from.
        // SAFETY: The encoder is recording and the graph closed its render passes.
        if let Err(err) = unsafe { self.encoder.end() } {
            tracing::warn!("failed to close abandoned encoder: {}", err);
        }
    }

    /// Closes the encoder and submits it to the graphics queue.
    ///
    /// `swapchain` is the swapchain whose acquired image the frame renders to.
    pub fn finish_rendering(
        &mut self,
        device: &RenderDevice<A>,
        swapchain: Option<&A::Swapchain>,
    ) -> Result<()> {
        let _span = trace_span!("SubmissionContext::finish_rendering").entered();

        if !self.recording {
            return Err(Error::Backend("finish_rendering without begin".to_owned()));
        }
        self.recording = false;

        // SAFETY: Resources referenced by the frame are kept alive until the present
        // fence value of this context retired.
        unsafe {
            self.encoder.end()?;
            device.graphics_queue().submit(&Submission {
                encoders: &[&self.encoder],
                wait: &[],
                signal: &[],
                swapchain,
            })
        }
    }
}

impl<A: Api> Debug for SubmissionContext<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionContext")
            .field("index", &self.index)
            .field("present_fence_value", &self.present_fence_value)
            .field("recording", &self.recording)
            .finish_non_exhaustive()
    }
}

/// Fixed-size ring of [`SubmissionContext`]s.
pub struct FrameRing<A: Api> {
    contexts: Vec<SubmissionContext<A>>,
    frame: u64,
    stats: FrameStats,
}

impl<A: Api> FrameRing<A> {
    pub fn new(device: &RenderDevice<A>, len: u32) -> Result<Self> {
        let contexts = (0..len.max(1) as usize)
            .map(|index| SubmissionContext::new(device, index))
            .collect::<Result<_>>()?;

        Ok(Self {
            contexts,
            frame: 0,
            stats: FrameStats::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Number of the next frame.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Selects the context of the next frame.
    pub fn next(&mut self) -> &mut SubmissionContext<A> {
        let index = (self.frame % self.contexts.len() as u64) as usize;
        self.frame += 1;
        &mut self.contexts[index]
    }

    /// Selects the context of the next frame, waits until its previous frame
    /// completed and starts recording.
    pub fn begin_frame(
        &mut self,
        device: &RenderDevice<A>,
        swapchain: &WindowSwapchain<A>,
    ) -> Result<&mut SubmissionContext<A>> {
        let _span = trace_span!("FrameRing::begin_frame").entered();

        let context = {
            let index = (self.frame % self.contexts.len() as u64) as usize;
            &mut self.contexts[index]
        };

        let value = context.present_fence_value();
        swapchain.wait_for_value(device, value)?;

        if swapchain.completed_value(device)? < value {
            tracing::error!(
                "submission context {} reused before fence value {} retired",
                context.index(),
                value
            );
            self.stats.reuse_violations += 1;
        }

        // SAFETY: The frame last recorded with the context completed above.
        unsafe {
            context.begin_rendering()?;
        }

        self.frame += 1;
        self.stats.frames += 1;
        Ok(context)
    }

    /// Returns the context of the frame being recorded.
    pub fn current(&mut self) -> Option<&mut SubmissionContext<A>> {
        let index = (self.frame.checked_sub(1)? % self.contexts.len() as u64) as usize;
        Some(&mut self.contexts[index])
    }

    /// Blocks until every frame recorded with the ring completed.
    pub fn wait_idle(&self, device: &RenderDevice<A>, swapchain: &WindowSwapchain<A>) -> Result<()> {
        let last = self
            .contexts
            .iter()
            .map(|context| context.present_fence_value())
            .max()
            .unwrap_or(0);
        swapchain.wait_for_value(device, last)
    }
}

impl<A: Api> Debug for FrameRing<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRing")
            .field("contexts", &self.contexts)
            .field("frame", &self.frame)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::null::{Null, NullCommand};
    use crate::test_util::render_device;

    use super::FrameRing;

    #[test]
    fn ring_cycles_through_contexts() {
        let device = render_device();
        let mut ring = FrameRing::<Null>::new(&device, 3).unwrap();

        let indices: Vec<_> = (0..7).map(|_| ring.next().index()).collect();
        assert_eq!(indices, [0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(ring.frame(), 7);
    }

    #[test]
    fn begin_rendering_binds_heaps() {
        let device = render_device();
        let mut ring = FrameRing::<Null>::new(&device, 2).unwrap();

        let context = ring.next();
        let encoder = unsafe { context.begin_rendering().unwrap() };
        assert!(matches!(encoder.commands(), [NullCommand::BindDescriptorHeaps]));

        context.finish_rendering(&device, None).unwrap();
        assert!(context.finish_rendering(&device, None).is_err());
        assert_eq!(device.raw().stats().submissions, 1);
    }

    #[test]
    fn abandoned_frame_is_not_submitted() {
        let device = render_device();
        let mut ring = FrameRing::<Null>::new(&device, 2).unwrap();

        let context = ring.next();
        unsafe { context.begin_rendering().unwrap() };
        context.abandon();
        assert!(!context.is_recording());
        assert!(context.finish_rendering(&device, None).is_err());
        assert_eq!(device.raw().stats().submissions, 0);

        // The context records again after an abandoned frame.
        let context = ring.next();
        unsafe { context.begin_rendering().unwrap() };
        context.finish_rendering(&device, None).unwrap();
        assert_eq!(device.raw().stats().submissions, 1);
    }
}
