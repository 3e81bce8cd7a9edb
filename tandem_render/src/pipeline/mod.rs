//! Pipeline layouts and graphics pipelines built from reflected shaders.

pub mod cache;

use std::fmt::{self, Debug, Formatter};

use tandem_tracing::trace_span;

use crate::backend::{
    Api, ColorTarget, CommandEncoder, CullMode, DepthState, DescriptorRange, Device, FrontFace,
    GraphicsPipelineDescriptor, PipelineLayoutDescriptor, PrimitiveTopology, RootTable,
    SamplerDescriptor, ShaderEntry, ShaderStages, StaticSampler, VertexLayout,
};
use crate::descriptors::DescriptorHandle;
use crate::error::{Error, Result};
use crate::shader::{FragmentShader, VertexShader};

pub use cache::{create_pso_with_caching, CacheStatus, PipelineCacheDir};

/// Fixed-function state of a graphics pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineState {
    pub vertex_layout: Option<VertexLayout>,
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub wireframe: bool,
    pub depth: Option<DepthState>,
    pub color_targets: Vec<ColorTarget>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            vertex_layout: None,
            topology: PrimitiveTopology::TriangleList,
            cull_mode: CullMode::None,
            front_face: FrontFace::Ccw,
            wireframe: false,
            depth: None,
            color_targets: Vec::new(),
        }
    }
}

/// Merges the tables of both stages.
///
/// Tables binding the same `(kind, register, space)` are merged into one table
/// visible to both stages. Otherwise the order is vertex tables then fragment tables.
pub fn merge_tables(vertex: &[RootTable], fragment: &[RootTable]) -> Vec<RootTable> {
    let mut tables: Vec<RootTable> = Vec::with_capacity(vertex.len() + fragment.len());

    for table in vertex.iter().chain(fragment) {
        let existing = tables.iter_mut().find(|other| {
            other.range.kind == table.range.kind
                && other.range.register == table.range.register
                && other.range.space == table.range.space
        });

        match existing {
            Some(other) => other.visibility |= table.visibility,
            None => tables.push(*table),
        }
    }

    tables
}

fn merge_samplers<'a>(
    vertex: &'a [DescriptorRange],
    fragment: &'a [DescriptorRange],
) -> Vec<(DescriptorRange, ShaderStages)> {
    let mut samplers: Vec<(DescriptorRange, ShaderStages)> = Vec::new();

    let ranges = vertex
        .iter()
        .map(|range| (range, ShaderStages::VERTEX))
        .chain(fragment.iter().map(|range| (range, ShaderStages::FRAGMENT)));

    for (range, stage) in ranges {
        match samplers
            .iter_mut()
            .find(|(other, _)| other.register == range.register && other.space == range.space)
        {
            Some((_, stages)) => *stages |= stage,
            None => samplers.push((*range, stage)),
        }
    }

    samplers
}

/// A pipeline layout and the pipeline created with it.
pub struct PipelineBundle<A: Api> {
    // The pipeline must be dropped before its layout.
    pipeline: A::Pipeline,
    layout: A::PipelineLayout,
    tables: Vec<RootTable>,
    static_samplers: Vec<StaticSampler>,
    label: String,
    status: CacheStatus,
}

impl<A: Api> PipelineBundle<A> {
    /// Creates the layout from the reflection of `vertex` and `fragment` and the
    /// pipeline through the pipeline cache.
    ///
    /// `sampler` returns the static sampler for every reflected sampler binding.
    pub fn new<F>(
        device: &A::Device,
        cache: &PipelineCacheDir,
        label: &str,
        vertex: &VertexShader,
        fragment: &FragmentShader,
        state: &PipelineState,
        mut sampler: F,
    ) -> Result<Self>
    where
        F: FnMut(&DescriptorRange) -> SamplerDescriptor,
    {
        let _span = trace_span!("PipelineBundle::new").entered();

        if vertex.bytecode().target() != fragment.bytecode().target() {
            return Err(Error::PipelineCreate(format!(
                "{}: vertex and fragment shaders target different backends",
                label
            )));
        }

        let tables = merge_tables(vertex.tables(), fragment.tables());
        let static_samplers: Vec<_> = merge_samplers(vertex.samplers(), fragment.samplers())
            .into_iter()
            .map(|(range, visibility)| StaticSampler {
                register: range.register,
                space: range.space,
                visibility,
                descriptor: sampler(&range),
            })
            .collect();

        let layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            tables: &tables,
            static_samplers: &static_samplers,
        })?;

        let vertex_module = device.create_shader_module(vertex.bytecode())?;
        let fragment_module = device.create_shader_module(fragment.bytecode())?;

        let desc = GraphicsPipelineDescriptor {
            label,
            layout: &layout,
            vertex: ShaderEntry {
                module: &vertex_module,
                entry: vertex.entry(),
            },
            fragment: ShaderEntry {
                module: &fragment_module,
                entry: fragment.entry(),
            },
            vertex_layout: state.vertex_layout.as_ref(),
            topology: state.topology,
            cull_mode: state.cull_mode,
            front_face: state.front_face,
            wireframe: state.wireframe,
            depth: state.depth,
            color_targets: &state.color_targets,
        };

        let (pipeline, status) = create_pso_with_caching::<A>(
            device,
            cache,
            &desc,
            vertex.bytecode().as_bytes(),
            fragment.bytecode().as_bytes(),
        )?;

        tracing::debug!(
            "created pipeline {} with {} tables and {} static samplers ({:?})",
            label,
            tables.len(),
            static_samplers.len(),
            status
        );

        Ok(Self {
            pipeline,
            layout,
            tables,
            static_samplers,
            label: label.to_owned(),
            status,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.status
    }

    pub fn tables(&self) -> &[RootTable] {
        &self.tables
    }

    pub fn static_samplers(&self) -> &[StaticSampler] {
        &self.static_samplers
    }

    pub fn layout(&self) -> &A::PipelineLayout {
        &self.layout
    }

    pub fn pipeline(&self) -> &A::Pipeline {
        &self.pipeline
    }

    /// Index of the table bound to `register` in `space`.
    pub fn table_index(&self, space: u32, register: u32) -> Option<u32> {
        self.tables
            .iter()
            .position(|table| table.range.space == space && table.range.register == register)
            .map(|index| index as u32)
    }

    pub fn bind(&self, encoder: &mut A::CommandEncoder) {
        encoder.bind_pipeline(&self.layout, &self.pipeline);
    }

    /// Binds the descriptor of `handle` to table `table`. Empty handles are skipped.
    pub fn set_table(
        &self,
        encoder: &mut A::CommandEncoder,
        table: u32,
        handle: &DescriptorHandle<A>,
    ) {
        debug_assert!((table as usize) < self.tables.len());

        if let Some((heap, slot)) = handle.binding() {
            encoder.set_descriptor_table(&self.layout, table, heap, slot);
        }
    }
}

impl<A: Api> Debug for PipelineBundle<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBundle")
            .field("label", &self.label)
            .field("tables", &self.tables)
            .field("static_samplers", &self.static_samplers.len())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{
        DescriptorKind, DescriptorRange, RangeType, RootTable, ShaderStages, OFFSET_APPEND,
    };

    use super::merge_tables;

    fn table(kind: DescriptorKind, space: u32, visibility: ShaderStages) -> RootTable {
        RootTable {
            range: DescriptorRange {
                ty: kind.range_type(),
                kind,
                register: 0,
                space,
                count: 1,
                offset: OFFSET_APPEND,
            },
            visibility,
        }
    }

    #[test]
    fn merge_tables_combines_visibility() {
        let vertex = [
            table(DescriptorKind::UniformBuffer, 0, ShaderStages::VERTEX),
            table(DescriptorKind::UniformBuffer, 1, ShaderStages::VERTEX),
        ];
        let fragment = [
            table(DescriptorKind::UniformBuffer, 0, ShaderStages::FRAGMENT),
            table(DescriptorKind::SampledImage, 3, ShaderStages::FRAGMENT),
        ];

        let merged = merge_tables(&vertex, &fragment);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].visibility, ShaderStages::VERTEX | ShaderStages::FRAGMENT);
        assert_eq!(merged[1].range.space, 1);
        assert_eq!(merged[2].range.ty, RangeType::Srv);
    }
}
