use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::UVec2;

use crate::backend::{
    BufferBarrier, BufferState, IndexFormat, LoadOp, PlacedFootprint, QueueKind,
    RenderPassDescriptor, ScissorRect, Subresource, TextureBarrier, TextureLayout, Viewport,
};
use crate::error::Error;

use super::resources::Memory;
use super::{DeviceShared, Null, NullBuffer, NullDescriptorHeap, NullPipeline, NullPipelineLayout, NullStats, NullTexture};

/// A command recorded by a [`NullCommandEncoder`].
#[derive(Clone, Debug)]
pub enum NullCommand {
    BindDescriptorHeaps,
    TextureBarrier {
        texture: u64,
        src: TextureLayout,
        dst: TextureLayout,
    },
    BufferBarrier {
        src: BufferState,
        dst: BufferState,
    },
    CopyBufferToBuffer {
        src: Arc<Memory>,
        src_offset: u64,
        dst: Arc<Memory>,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: Arc<Memory>,
        footprint: PlacedFootprint,
        dst: Arc<Memory>,
        dst_offset: u64,
        dst_row_size: u64,
    },
    CopyTextureToBuffer {
        src: Arc<Memory>,
        src_offset: u64,
        src_row_size: u64,
        dst: Arc<Memory>,
        footprint: PlacedFootprint,
    },
    BeginRenderPass {
        label: String,
        extent: UVec2,
        color_attachments: usize,
        has_depth: bool,
        clears: usize,
    },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindPipeline {
        label: String,
    },
    SetDescriptorTable {
        table: u32,
        heap: u64,
        slot: u32,
    },
    BindVertexBuffer {
        slot: u32,
        offset: u64,
        stride: u32,
    },
    BindIndexBuffer {
        offset: u64,
        format: IndexFormat,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
}

impl NullCommand {
    pub(super) fn execute(&self, stats: &mut NullStats) {
        match self {
            Self::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                dst.copy_from(
                    *dst_offset as usize,
                    src,
                    *src_offset as usize,
                    *size as usize,
                );
                stats.copies_executed += 1;
            }
            Self::CopyBufferToTexture {
                src,
                footprint,
                dst,
                dst_offset,
                dst_row_size,
            } => {
                let rows = footprint.row_count * footprint.depth;
                for row in 0..u64::from(rows) {
                    dst.copy_from(
                        (dst_offset + row * dst_row_size) as usize,
                        src,
                        (footprint.offset + row * footprint.row_pitch) as usize,
                        footprint.row_size as usize,
                    );
                }
                stats.copies_executed += 1;
            }
            Self::CopyTextureToBuffer {
                src,
                src_offset,
                src_row_size,
                dst,
                footprint,
            } => {
                let rows = footprint.row_count * footprint.depth;
                for row in 0..u64::from(rows) {
                    dst.copy_from(
                        (footprint.offset + row * footprint.row_pitch) as usize,
                        src,
                        (src_offset + row * src_row_size) as usize,
                        footprint.row_size as usize,
                    );
                }
                stats.copies_executed += 1;
            }
            Self::Draw { .. } | Self::DrawIndexed { .. } => stats.draws_executed += 1,
            _ => (),
        }
    }

    /// Returns `true` for commands that produce GPU work rather than state changes.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Self::CopyBufferToBuffer { .. }
                | Self::CopyBufferToTexture { .. }
                | Self::CopyTextureToBuffer { .. }
                | Self::Draw { .. }
                | Self::DrawIndexed { .. }
        )
    }
}

#[derive(Debug)]
pub struct NullCommandPool {
    queue: QueueKind,
    shared: Arc<DeviceShared>,
    /// Serial of the last submission of every encoder allocated from the pool.
    submissions: Vec<Arc<AtomicU64>>,
}

impl NullCommandPool {
    pub(super) fn new(queue: QueueKind, shared: Arc<DeviceShared>) -> Self {
        Self {
            queue,
            shared,
            submissions: Vec::new(),
        }
    }
}

impl crate::backend::CommandPool<Null> for NullCommandPool {
    unsafe fn reset(&mut self) -> Result<(), Error> {
        let completed = self.shared.completed.load(Ordering::Acquire);
        let in_flight = self
            .submissions
            .iter()
            .map(|serial| serial.load(Ordering::Acquire))
            .max()
            .filter(|serial| *serial > completed);

        match in_flight {
            Some(serial) => Err(Error::Backend(format!(
                "command pool reset while submission {} is in flight (completed {})",
                serial, completed
            ))),
            None => Ok(()),
        }
    }

    fn create_encoder(&mut self) -> Result<NullCommandEncoder, Error> {
        let submission = Arc::new(AtomicU64::new(0));
        self.submissions.push(submission.clone());

        Ok(NullCommandEncoder {
            queue: self.queue,
            state: EncoderState::Initial,
            in_render_pass: false,
            commands: Vec::new(),
            submission,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum EncoderState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
pub struct NullCommandEncoder {
    queue: QueueKind,
    state: EncoderState,
    in_render_pass: bool,
    commands: Vec<NullCommand>,
    submission: Arc<AtomicU64>,
}

impl NullCommandEncoder {
    /// Commands recorded since the last [`begin`].
    ///
    /// [`begin`]: crate::backend::CommandEncoder::begin
    pub fn commands(&self) -> &[NullCommand] {
        &self.commands
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub(super) fn is_executable(&self) -> bool {
        self.state == EncoderState::Executable
    }

    pub(super) fn mark_submitted(&self, serial: u64) {
        self.submission.store(serial, Ordering::Release);
    }

    fn push(&mut self, command: NullCommand) {
        debug_assert_eq!(self.state, EncoderState::Recording, "encoder is not recording");
        self.commands.push(command);
    }

    fn push_graphics(&mut self, command: NullCommand) {
        debug_assert_eq!(self.queue, QueueKind::Graphics);
        debug_assert!(self.in_render_pass, "draw outside of render pass");
        self.push(command);
    }
}

impl crate::backend::CommandEncoder<Null> for NullCommandEncoder {
    unsafe fn begin(&mut self) -> Result<(), Error> {
        self.commands.clear();
        self.in_render_pass = false;
        self.state = EncoderState::Recording;
        Ok(())
    }

    unsafe fn end(&mut self) -> Result<(), Error> {
        if self.state != EncoderState::Recording || self.in_render_pass {
            return Err(Error::Backend(format!(
                "invalid encoder state at end: {:?} (render pass active: {})",
                self.state, self.in_render_pass
            )));
        }

        self.state = EncoderState::Executable;
        Ok(())
    }

    fn bind_descriptor_heaps(&mut self) {
        self.push(NullCommand::BindDescriptorHeaps);
    }

    fn texture_barriers(&mut self, barriers: &[TextureBarrier<'_, Null>]) {
        for barrier in barriers {
            self.push(NullCommand::TextureBarrier {
                texture: barrier.texture.id,
                src: barrier.src,
                dst: barrier.dst,
            });
        }
    }

    fn buffer_barriers(&mut self, barriers: &[BufferBarrier<'_, Null>]) {
        for barrier in barriers {
            self.push(NullCommand::BufferBarrier {
                src: barrier.src,
                dst: barrier.dst,
            });
        }
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: &NullBuffer,
        src_offset: u64,
        dst: &NullBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        self.push(NullCommand::CopyBufferToBuffer {
            src: src.memory.clone(),
            src_offset,
            dst: dst.memory.clone(),
            dst_offset,
            size,
        });
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &NullBuffer,
        footprint: &PlacedFootprint,
        dst: &NullTexture,
        subresource: Subresource,
    ) {
        let (dst_offset, dst_row_size, _) = dst.subresource_layout(subresource);
        debug_assert_eq!(dst_row_size, footprint.row_size);

        self.push(NullCommand::CopyBufferToTexture {
            src: src.memory.clone(),
            footprint: *footprint,
            dst: dst.memory.clone(),
            dst_offset,
            dst_row_size,
        });
    }

    fn copy_texture_to_buffer(
        &mut self,
        src: &NullTexture,
        subresource: Subresource,
        dst: &NullBuffer,
        footprint: &PlacedFootprint,
    ) {
        let (src_offset, src_row_size, _) = src.subresource_layout(subresource);
        debug_assert_eq!(src_row_size, footprint.row_size);

        self.push(NullCommand::CopyTextureToBuffer {
            src: src.memory.clone(),
            src_offset,
            src_row_size,
            dst: dst.memory.clone(),
            footprint: *footprint,
        });
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_, Null>) {
        debug_assert!(!self.in_render_pass, "nested render pass");

        let clears = desc
            .color_attachments
            .iter()
            .filter(|attachment| matches!(attachment.load_op, LoadOp::Clear(_)))
            .count()
            + desc
                .depth_attachment
                .as_ref()
                .filter(|attachment| matches!(attachment.load_op, LoadOp::Clear(_)))
                .map_or(0, |_| 1);

        self.push(NullCommand::BeginRenderPass {
            label: desc.label.to_owned(),
            extent: desc.extent,
            color_attachments: desc.color_attachments.len(),
            has_depth: desc.depth_attachment.is_some(),
            clears,
        });
        self.in_render_pass = true;
    }

    fn end_render_pass(&mut self) {
        debug_assert!(self.in_render_pass, "no active render pass");
        self.push(NullCommand::EndRenderPass);
        self.in_render_pass = false;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.push(NullCommand::SetViewport(*viewport));
    }

    fn set_scissor(&mut self, scissor: &ScissorRect) {
        self.push(NullCommand::SetScissor(*scissor));
    }

    fn bind_pipeline(&mut self, layout: &NullPipelineLayout, pipeline: &NullPipeline) {
        let _ = layout;
        self.push(NullCommand::BindPipeline {
            label: pipeline.label.clone(),
        });
    }

    fn set_descriptor_table(
        &mut self,
        layout: &NullPipelineLayout,
        table: u32,
        heap: &NullDescriptorHeap,
        slot: u32,
    ) {
        debug_assert!((table as usize) < layout.tables.len(), "table out of range");
        debug_assert!(slot < crate::backend::DescriptorHeap::capacity(heap));

        self.push(NullCommand::SetDescriptorTable {
            table,
            heap: crate::backend::DescriptorHeap::cpu_base(heap),
            slot,
        });
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: &NullBuffer, offset: u64, stride: u32) {
        debug_assert!(offset < crate::backend::BufferResource::size(buffer));
        self.push(NullCommand::BindVertexBuffer {
            slot,
            offset,
            stride,
        });
    }

    fn bind_index_buffer(&mut self, buffer: &NullBuffer, offset: u64, format: IndexFormat) {
        debug_assert!(offset < crate::backend::BufferResource::size(buffer));
        self.push(NullCommand::BindIndexBuffer { offset, format });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32) {
        self.push_graphics(NullCommand::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _base_vertex: i32,
    ) {
        self.push_graphics(NullCommand::DrawIndexed {
            index_count,
            instance_count,
        });
    }
}
