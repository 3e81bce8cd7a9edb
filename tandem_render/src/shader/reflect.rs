//! Descriptor ranges used by a shader entry point.

use naga::{AddressSpace, ImageClass, Module, StorageAccess, TypeInner};

use crate::backend::{
    DescriptorKind, DescriptorRange, RangeType, ShaderStage, OFFSET_APPEND,
};

/// Resources bound by one entry point, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reflection {
    /// Constant buffer, shader resource and unordered access ranges.
    pub ranges: Vec<DescriptorRange>,
    /// Sampler ranges.
    pub samplers: Vec<DescriptorRange>,
}

impl Reflection {
    /// Number of distinct `(space, register, type)` bindings, samplers excluded.
    pub fn binding_count(&self) -> usize {
        let mut bindings: Vec<_> = self
            .ranges
            .iter()
            .map(|range| (range.space, range.register, range.ty as u8))
            .collect();
        bindings.sort_unstable();
        bindings.dedup();
        bindings.len()
    }
}

/// Collects the resources used by entry point `index` of `module`.
///
/// Globals that are declared but never used by the entry point are skipped. A
/// binding `@group(g) @binding(b)` becomes a one-slot range at register `b` in space
/// `g`.
pub fn reflect(module: &Module, info: &naga::valid::ModuleInfo, index: usize) -> Reflection {
    let usage = info.get_entry_point(index);
    let mut reflection = Reflection::default();

    for (handle, var) in module.global_variables.iter() {
        if usage[handle].is_empty() {
            continue;
        }

        let Some(binding) = &var.binding else {
            continue;
        };

        let Some((kind, ty, count)) = classify(module, var.space, &module.types[var.ty].inner)
        else {
            tracing::debug!(
                "skipping unsupported binding {:?} at group {} binding {}",
                var.name,
                binding.group,
                binding.binding
            );
            continue;
        };

        let range = DescriptorRange {
            ty,
            kind,
            register: binding.binding,
            space: binding.group,
            count,
            offset: OFFSET_APPEND,
        };

        if ty == RangeType::Sampler {
            reflection.samplers.push(range);
        } else {
            reflection.ranges.push(range);
        }
    }

    reflection
}

fn classify(
    module: &Module,
    space: AddressSpace,
    ty: &TypeInner,
) -> Option<(DescriptorKind, RangeType, u32)> {
    match (space, ty) {
        (AddressSpace::Uniform, _) => Some((DescriptorKind::UniformBuffer, RangeType::Cbv, 1)),
        (AddressSpace::Storage { access }, _) => {
            if access.contains(StorageAccess::STORE) {
                Some((DescriptorKind::StorageBuffer, RangeType::Uav, 1))
            } else {
                Some((DescriptorKind::StorageBuffer, RangeType::Srv, 1))
            }
        }
        (AddressSpace::Handle, TypeInner::Image { class, .. }) => match class {
            ImageClass::Sampled { .. } | ImageClass::Depth { .. } => {
                Some((DescriptorKind::SampledImage, RangeType::Srv, 1))
            }
            ImageClass::Storage { .. } => Some((DescriptorKind::StorageImage, RangeType::Uav, 1)),
        },
        (AddressSpace::Handle, TypeInner::Sampler { .. }) => {
            Some((DescriptorKind::Sampler, RangeType::Sampler, 1))
        }
        (AddressSpace::Handle, TypeInner::BindingArray { base, size }) => {
            let count = match size {
                naga::ArraySize::Constant(count) => count.get(),
                _ => return None,
            };

            let (kind, ty, _) = classify(module, space, &module.types[*base].inner)?;
            Some((kind, ty, count))
        }
        _ => None,
    }
}

/// Converts a naga stage into a renderer stage.
pub(super) fn shader_stage(stage: naga::ShaderStage) -> Option<ShaderStage> {
    match stage {
        naga::ShaderStage::Vertex => Some(ShaderStage::Vertex),
        naga::ShaderStage::Fragment => Some(ShaderStage::Fragment),
        naga::ShaderStage::Compute => None,
    }
}

#[cfg(test)]
mod tests {
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    use crate::backend::{DescriptorKind, RangeType, OFFSET_APPEND};

    use super::reflect;

    fn reflect_str(source: &str, entry: usize) -> super::Reflection {
        let module = naga::front::wgsl::parse_str(source).unwrap();
        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .unwrap();
        reflect(&module, &info, entry)
    }

    const SOURCE: &str = r#"
        struct View { view_proj: mat4x4<f32> }

        @group(0) @binding(0) var<uniform> view: View;
        @group(1) @binding(0) var albedo: texture_2d<f32>;
        @group(2) @binding(0) var albedo_sampler: sampler;
        @group(3) @binding(0) var<storage, read> lights: array<vec4<f32>>;
        @group(4) @binding(0) var<storage, read_write> counters: array<u32>;
        @group(5) @binding(0) var unused: texture_2d<f32>;

        @vertex
        fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
            return view.view_proj * vec4(position, 1.0);
        }

        @fragment
        fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
            counters[0] = 1u;
            let uv = position.xy;
            return textureSample(albedo, albedo_sampler, uv) * lights[0];
        }
    "#;

    #[test]
    fn reflect_vertex_entry() {
        let reflection = reflect_str(SOURCE, 0);
        assert_eq!(reflection.ranges.len(), 1);
        assert!(reflection.samplers.is_empty());

        let view = reflection.ranges[0];
        assert_eq!(view.ty, RangeType::Cbv);
        assert_eq!(view.kind, DescriptorKind::UniformBuffer);
        assert_eq!((view.space, view.register), (0, 0));
        assert_eq!(view.offset, OFFSET_APPEND);
    }

    #[test]
    fn reflect_fragment_entry() {
        let reflection = reflect_str(SOURCE, 1);

        let kinds: Vec<_> = reflection
            .ranges
            .iter()
            .map(|range| (range.space, range.ty))
            .collect();
        assert_eq!(
            kinds,
            [(1, RangeType::Srv), (3, RangeType::Srv), (4, RangeType::Uav)]
        );
        assert_eq!(reflection.ranges[1].kind, DescriptorKind::StorageBuffer);

        assert_eq!(reflection.samplers.len(), 1);
        assert_eq!(reflection.samplers[0].space, 2);
        assert_eq!(reflection.binding_count(), 3);
    }
}
