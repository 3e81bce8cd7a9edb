use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::{size_of_val, ManuallyDrop};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use windows::core::Interface;
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D12::*;

use crate::backend::{
    BufferBarrier, BufferResource, IndexFormat, LoadOp, PlacedFootprint, QueueKind,
    RenderPassDescriptor, ScissorRect, Subresource, TextureBarrier, Viewport,
};
use crate::error::Error;

use super::device::{
    DeviceShared, Dx12Buffer, Dx12DescriptorHeap, Dx12Pipeline, Dx12PipelineLayout, Dx12Texture,
};
use super::{borrow_interface, conv, Dx12};

#[derive(Debug)]
pub struct Dx12CommandPool {
    allocator: ID3D12CommandAllocator,
    ty: D3D12_COMMAND_LIST_TYPE,
    kind: QueueKind,
    shared: Arc<DeviceShared>,
}

impl Dx12CommandPool {
    pub(super) fn new(shared: Arc<DeviceShared>, kind: QueueKind) -> Result<Self, Error> {
        let ty = match kind {
            QueueKind::Graphics => D3D12_COMMAND_LIST_TYPE_DIRECT,
            QueueKind::Transfer => D3D12_COMMAND_LIST_TYPE_COPY,
        };

        let allocator: ID3D12CommandAllocator = unsafe { shared.raw.CreateCommandAllocator(ty)? };

        Ok(Self {
            allocator,
            ty,
            kind,
            shared,
        })
    }
}

impl crate::backend::CommandPool<Dx12> for Dx12CommandPool {
    unsafe fn reset(&mut self) -> Result<(), Error> {
        unsafe { self.allocator.Reset()? };
        Ok(())
    }

    fn create_encoder(&mut self) -> Result<Dx12CommandEncoder, Error> {
        let list: ID3D12GraphicsCommandList = unsafe {
            self.shared
                .raw
                .CreateCommandList(0, self.ty, &self.allocator, None::<&ID3D12PipelineState>)?
        };

        // Lists are created in the recording state. `begin` expects a closed list.
        unsafe { list.Close()? };

        Ok(Dx12CommandEncoder {
            list,
            allocator: self.allocator.clone(),
            kind: self.kind,
            buffer_states: HashMap::new(),
            copy_touched: Vec::new(),
            labeled: false,
            shared: self.shared.clone(),
        })
    }
}

/// A graphics command list.
///
/// Textures carry their resource state across command lists. Buffers always decay
/// to `COMMON` at the end of an `ExecuteCommandLists` call, so their state is only
/// tracked while recording.
#[derive(Debug)]
pub struct Dx12CommandEncoder {
    list: ID3D12GraphicsCommandList,
    allocator: ID3D12CommandAllocator,
    kind: QueueKind,
    buffer_states: HashMap<usize, D3D12_RESOURCE_STATES>,
    /// Texture states accessed on a copy queue. They decay to `COMMON` after
    /// execution.
    copy_touched: Vec<Arc<AtomicI32>>,
    labeled: bool,
    shared: Arc<DeviceShared>,
}

impl Dx12CommandEncoder {
    pub(super) fn raw(&self) -> &ID3D12GraphicsCommandList {
        &self.list
    }

    fn touch(&mut self, texture: &Dx12Texture) {
        if self.kind == QueueKind::Transfer {
            self.copy_touched.push(texture.state.clone());
        }
    }

    /// Records the state a buffer is implicitly promoted to by a copy.
    fn promote(&mut self, buffer: &Dx12Buffer, state: D3D12_RESOURCE_STATES) {
        if !buffer.host_visible {
            self.buffer_states
                .entry(buffer.raw.as_raw() as usize)
                .or_insert(state);
        }
    }

    fn begin_label(&mut self, label: &str) {
        // PIX reads nul-terminated UTF-16 with metadata 0.
        let name: Vec<u16> = label.encode_utf16().chain(Some(0)).collect();

        unsafe {
            self.list.BeginEvent(
                0,
                Some(name.as_ptr().cast::<c_void>()),
                size_of_val(&*name) as u32,
            );
        }
        self.labeled = true;
    }

    fn end_label(&mut self) {
        if self.labeled {
            unsafe { self.list.EndEvent() };
            self.labeled = false;
        }
    }
}

impl crate::backend::CommandEncoder<Dx12> for Dx12CommandEncoder {
    unsafe fn begin(&mut self) -> Result<(), Error> {
        unsafe { self.list.Reset(&self.allocator, None::<&ID3D12PipelineState>)? };

        self.buffer_states.clear();
        self.copy_touched.clear();
        self.labeled = false;
        Ok(())
    }

    unsafe fn end(&mut self) -> Result<(), Error> {
        unsafe { self.list.Close()? };

        for state in self.copy_touched.drain(..) {
            state.store(D3D12_RESOURCE_STATE_COMMON.0, Ordering::Relaxed);
        }

        Ok(())
    }

    fn bind_descriptor_heaps(&mut self) {
        // Copy lists cannot bind descriptor heaps.
        if self.kind != QueueKind::Graphics {
            return;
        }

        let heaps = [
            Some(self.shared.resource_heap.raw.clone()),
            Some(self.shared.sampler_heap.raw.clone()),
        ];

        unsafe { self.list.SetDescriptorHeaps(&heaps) };
    }

    fn texture_barriers(&mut self, barriers: &[TextureBarrier<'_, Dx12>]) {
        let mut raw_barriers = Vec::with_capacity(barriers.len());

        for barrier in barriers {
            self.touch(barrier.texture);

            let after = conv::texture_state(barrier.dst);
            let before =
                D3D12_RESOURCE_STATES(barrier.texture.state.swap(after.0, Ordering::Relaxed));

            if before == after {
                continue;
            }

            raw_barriers.push(transition(&barrier.texture.raw, before, after));
        }

        if !raw_barriers.is_empty() {
            unsafe { self.list.ResourceBarrier(&raw_barriers) };
        }
    }

    fn buffer_barriers(&mut self, barriers: &[BufferBarrier<'_, Dx12>]) {
        let mut raw_barriers = Vec::with_capacity(barriers.len());

        for barrier in barriers {
            if barrier.buffer.host_visible {
                continue;
            }

            let after = conv::buffer_state(barrier.dst);
            let before = self
                .buffer_states
                .insert(barrier.buffer.raw.as_raw() as usize, after)
                .unwrap_or(D3D12_RESOURCE_STATE_COMMON);

            if before == after {
                continue;
            }

            raw_barriers.push(transition(&barrier.buffer.raw, before, after));
        }

        if !raw_barriers.is_empty() {
            unsafe { self.list.ResourceBarrier(&raw_barriers) };
        }
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: &Dx12Buffer,
        src_offset: u64,
        dst: &Dx12Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        self.promote(src, D3D12_RESOURCE_STATE_COPY_SOURCE);
        self.promote(dst, D3D12_RESOURCE_STATE_COPY_DEST);

        unsafe {
            self.list
                .CopyBufferRegion(&dst.raw, dst_offset, &src.raw, src_offset, size);
        }
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &Dx12Buffer,
        footprint: &PlacedFootprint,
        dst: &Dx12Texture,
        subresource: Subresource,
    ) {
        self.touch(dst);
        self.promote(src, D3D12_RESOURCE_STATE_COPY_SOURCE);

        let src = unsafe { placed_location(src, footprint, dst) };
        let dst = unsafe { subresource_location(dst, subresource) };

        unsafe { self.list.CopyTextureRegion(&dst, 0, 0, 0, &src, None) };
    }

    fn copy_texture_to_buffer(
        &mut self,
        src: &Dx12Texture,
        subresource: Subresource,
        dst: &Dx12Buffer,
        footprint: &PlacedFootprint,
    ) {
        self.touch(src);
        self.promote(dst, D3D12_RESOURCE_STATE_COPY_DEST);

        let dst = unsafe { placed_location(dst, footprint, src) };
        let src = unsafe { subresource_location(src, subresource) };

        unsafe { self.list.CopyTextureRegion(&dst, 0, 0, 0, &src, None) };
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_, Dx12>) {
        self.begin_label(desc.label);

        let color_handles: Vec<_> = desc
            .color_attachments
            .iter()
            .filter_map(|attachment| attachment.view.rtv)
            .map(|index| self.shared.rtv(index))
            .collect();

        let depth_handle = desc
            .depth_attachment
            .as_ref()
            .and_then(|attachment| attachment.view.dsv)
            .map(|index| self.shared.dsv(index));

        if color_handles.len() != desc.color_attachments.len() {
            tracing::error!(
                "render pass {}: color attachment without render target view",
                desc.label
            );
        }

        unsafe {
            self.list.OMSetRenderTargets(
                color_handles.len() as u32,
                Some(color_handles.as_ptr()),
                false,
                depth_handle.as_ref().map(|handle| handle as *const _),
            );

            for (attachment, handle) in desc.color_attachments.iter().zip(&color_handles) {
                if let LoadOp::Clear(color) = attachment.load_op {
                    self.list.ClearRenderTargetView(*handle, &color, None);
                }
            }

            if let (Some(attachment), Some(handle)) = (&desc.depth_attachment, depth_handle) {
                if let LoadOp::Clear(depth) = attachment.load_op {
                    self.list
                        .ClearDepthStencilView(handle, D3D12_CLEAR_FLAG_DEPTH, depth, 0, None);
                }
            }
        }

        self.set_viewport(&Viewport::from_extent(desc.extent));
        self.set_scissor(&ScissorRect::from_extent(desc.extent));
    }

    fn end_render_pass(&mut self) {
        self.end_label();
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        let viewport = D3D12_VIEWPORT {
            TopLeftX: viewport.x,
            TopLeftY: viewport.y,
            Width: viewport.width,
            Height: viewport.height,
            MinDepth: viewport.min_depth,
            MaxDepth: viewport.max_depth,
        };

        unsafe { self.list.RSSetViewports(&[viewport]) };
    }

    fn set_scissor(&mut self, scissor: &ScissorRect) {
        let rect = RECT {
            left: scissor.x,
            top: scissor.y,
            right: scissor.x + scissor.width as i32,
            bottom: scissor.y + scissor.height as i32,
        };

        unsafe { self.list.RSSetScissorRects(&[rect]) };
    }

    fn bind_pipeline(&mut self, layout: &Dx12PipelineLayout, pipeline: &Dx12Pipeline) {
        unsafe {
            self.list.SetGraphicsRootSignature(&layout.raw);
            self.list.SetPipelineState(&pipeline.raw);
            self.list.IASetPrimitiveTopology(pipeline.topology);
        }
    }

    fn set_descriptor_table(
        &mut self,
        _layout: &Dx12PipelineLayout,
        table: u32,
        heap: &Dx12DescriptorHeap,
        slot: u32,
    ) {
        unsafe {
            self.list
                .SetGraphicsRootDescriptorTable(table, heap.gpu_handle(slot));
        }
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: &Dx12Buffer, offset: u64, stride: u32) {
        let view = D3D12_VERTEX_BUFFER_VIEW {
            BufferLocation: buffer.gpu_address + offset,
            SizeInBytes: (buffer.size() - offset) as u32,
            StrideInBytes: stride,
        };

        unsafe { self.list.IASetVertexBuffers(slot, Some(&[view])) };
    }

    fn bind_index_buffer(&mut self, buffer: &Dx12Buffer, offset: u64, format: IndexFormat) {
        let view = D3D12_INDEX_BUFFER_VIEW {
            BufferLocation: buffer.gpu_address + offset,
            SizeInBytes: (buffer.size() - offset) as u32,
            Format: conv::index_format(format),
        };

        unsafe { self.list.IASetIndexBuffer(Some(&view)) };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        unsafe {
            self.list
                .DrawInstanced(vertex_count, instance_count, first_vertex, 0);
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    ) {
        unsafe {
            self.list.DrawIndexedInstanced(
                index_count,
                instance_count,
                first_index,
                base_vertex,
                0,
            );
        }
    }
}

fn transition(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // SAFETY: The barrier is consumed before the resource can be dropped.
                pResource: unsafe { borrow_interface(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

/// # Safety
///
/// The returned location must not outlive `buffer`.
unsafe fn placed_location(
    buffer: &Dx12Buffer,
    footprint: &PlacedFootprint,
    texture: &Dx12Texture,
) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { borrow_interface(&buffer.raw) },
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: footprint.offset,
                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: conv::texture_format(texture.desc.format),
                    Width: footprint.width,
                    Height: footprint.height,
                    Depth: footprint.depth,
                    RowPitch: footprint.row_pitch as u32,
                },
            },
        },
    }
}

/// # Safety
///
/// The returned location must not outlive `texture`.
unsafe fn subresource_location(
    texture: &Dx12Texture,
    subresource: Subresource,
) -> D3D12_TEXTURE_COPY_LOCATION {
    let index = subresource.mip_level + subresource.array_layer * texture.desc.mip_levels;

    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { borrow_interface(&texture.raw) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            SubresourceIndex: index,
        },
    }
}
