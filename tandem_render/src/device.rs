//! Adapter selection and the logical device.

use tandem_tracing::trace_span;

use crate::backend::{
    Adapter, AdapterFeatures, AdapterInfo, AdapterKind, Api, DescriptorKind, Device,
    DeviceDescriptor, DeviceLimits, Instance,
};
use crate::config::{AdapterPreference, DescriptorCapacities};
use crate::descriptors::{DescriptorHandle, DescriptorPool, DescriptorPools};
use crate::error::{Error, Result};

pub const DEFAULT_DEVICE_DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    resource_descriptors: 4096,
    sampler_descriptors: 256,
};

/// An adapter reported by the instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterEntry {
    pub index: usize,
    pub info: AdapterInfo,
    pub features: AdapterFeatures,
}

impl AdapterEntry {
    /// Returns `true` if the adapter supports all required features.
    pub fn is_suitable(&self) -> bool {
        self.features.contains(AdapterFeatures::REQUIRED)
    }
}

/// Lists all adapters of `instance`.
pub fn enumerate_adapters<A: Api>(instance: &A::Instance) -> Result<Vec<AdapterEntry>> {
    Ok(instance
        .adapters()?
        .iter()
        .enumerate()
        .map(|(index, adapter)| AdapterEntry {
            index,
            info: adapter.info(),
            features: adapter.features(),
        })
        .collect())
}

/// Picks an adapter according to `preference`.
///
/// Only adapters supporting [`AdapterFeatures::REQUIRED`] are considered.
pub fn select_adapter(entries: &[AdapterEntry], preference: &AdapterPreference) -> Result<usize> {
    let mut suitable = entries.iter().filter(|entry| entry.is_suitable());

    let selected = match preference {
        AdapterPreference::Index(index) => suitable.find(|entry| entry.index == *index),
        AdapterPreference::Name(name) => {
            let name = name.to_lowercase();
            suitable.find(|entry| entry.info.name.to_lowercase().contains(&name))
        }
        AdapterPreference::HighPerformance => {
            let candidates: Vec<_> = suitable.collect();
            candidates
                .iter()
                .find(|entry| entry.info.kind == AdapterKind::DiscreteGpu)
                .or_else(|| candidates.first())
                .copied()
        }
    };

    match selected {
        Some(entry) => Ok(entry.index),
        None => {
            for entry in entries.iter().filter(|entry| !entry.is_suitable()) {
                tracing::warn!(
                    "adapter {} is missing features {:?}",
                    entry.info.name,
                    AdapterFeatures::REQUIRED - entry.features
                );
            }

            Err(Error::NoSuitableAdapter)
        }
    }
}

/// The logical device with its queues and descriptor pools.
///
/// Dropping the device waits until the GPU is idle.
pub struct RenderDevice<A: Api> {
    // Fields are dropped in declaration order: pools before the device.
    descriptors: DescriptorPools<A>,
    graphics_queue: A::Queue,
    transfer_queue: A::Queue,
    raw: A::Device,
    adapter: A::Adapter,
    info: AdapterInfo,
    index: usize,
    dedicated_transfer: bool,
    limits: DeviceLimits,
}

impl<A: Api> RenderDevice<A> {
    /// Selects an adapter of `instance` and opens it.
    pub fn new(
        instance: &A::Instance,
        preference: &AdapterPreference,
        capacities: &DescriptorCapacities,
    ) -> Result<Self> {
        let entries = enumerate_adapters::<A>(instance)?;
        for entry in &entries {
            tracing::info!(
                "adapter {}: {} ({:?}, suitable: {})",
                entry.index,
                entry.info.name,
                entry.info.kind,
                entry.is_suitable()
            );
        }

        let index = select_adapter(&entries, preference)?;
        let adapter = instance.adapters()?.swap_remove(index);
        Self::from_adapter(adapter, index, capacities)
    }

    pub fn from_adapter(
        adapter: A::Adapter,
        index: usize,
        capacities: &DescriptorCapacities,
    ) -> Result<Self> {
        let _span = trace_span!("RenderDevice::from_adapter").entered();

        let info = adapter.info();
        tracing::info!("using adapter {} on {}", info.name, A::KIND);

        let open = adapter.open(&DeviceDescriptor {
            resource_descriptors: capacities.resource_total(),
            sampler_descriptors: capacities.get(DescriptorKind::Sampler),
        })?;

        if !open.dedicated_transfer {
            tracing::info!("no dedicated transfer queue, sharing the graphics queue");
        }

        let descriptors = DescriptorPools::new(&open.device, |kind| capacities.get(kind))?;
        let limits = open.device.limits();

        Ok(Self {
            descriptors,
            graphics_queue: open.graphics_queue,
            transfer_queue: open.transfer_queue,
            raw: open.device,
            adapter,
            info,
            index,
            dedicated_transfer: open.dedicated_transfer,
            limits,
        })
    }

    pub fn raw(&self) -> &A::Device {
        &self.raw
    }

    pub fn adapter(&self) -> &A::Adapter {
        &self.adapter
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Index of the adapter in the instance's adapter list.
    pub fn adapter_index(&self) -> usize {
        self.index
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn graphics_queue(&self) -> &A::Queue {
        &self.graphics_queue
    }

    pub fn transfer_queue(&self) -> &A::Queue {
        &self.transfer_queue
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        self.dedicated_transfer
    }

    pub fn descriptor_pool(&self, kind: DescriptorKind) -> &DescriptorPool<A> {
        self.descriptors.get(kind)
    }

    pub fn allocate_descriptor(&self, kind: DescriptorKind) -> Result<DescriptorHandle<A>> {
        self.descriptors.allocate(kind)
    }

    pub fn wait_idle(&self) -> Result<()> {
        let _span = trace_span!("RenderDevice::wait_idle").entered();
        self.raw.wait_idle()
    }
}

impl<A: Api> Drop for RenderDevice<A> {
    fn drop(&mut self) {
        if let Err(err) = self.raw.wait_idle() {
            tracing::error!("failed to wait for device idle: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::null::{Null, NullAdapterDesc, NullInstance};
    use crate::backend::{AdapterFeatures, AdapterInfo, AdapterKind, DescriptorKind};
    use crate::config::{AdapterPreference, DescriptorCapacities};
    use crate::error::Error;

    use super::{enumerate_adapters, select_adapter, AdapterEntry, RenderDevice};

    fn entry(index: usize, name: &str, kind: AdapterKind, features: AdapterFeatures) -> AdapterEntry {
        AdapterEntry {
            index,
            info: AdapterInfo {
                name: name.to_owned(),
                kind,
                vendor_id: 0,
                device_id: 0,
            },
            features,
        }
    }

    #[test]
    fn select_prefers_discrete() {
        let entries = [
            entry(0, "iGPU", AdapterKind::IntegratedGpu, AdapterFeatures::all()),
            entry(1, "dGPU", AdapterKind::DiscreteGpu, AdapterFeatures::all()),
        ];
        assert_eq!(
            select_adapter(&entries, &AdapterPreference::HighPerformance).unwrap(),
            1
        );
    }

    #[test]
    fn select_skips_unsuitable() {
        let entries = [
            entry(0, "old", AdapterKind::DiscreteGpu, AdapterFeatures::SWAPCHAIN),
            entry(1, "new", AdapterKind::IntegratedGpu, AdapterFeatures::REQUIRED),
        ];
        assert_eq!(
            select_adapter(&entries, &AdapterPreference::HighPerformance).unwrap(),
            1
        );
        assert!(matches!(
            select_adapter(&entries, &AdapterPreference::Index(0)),
            Err(Error::NoSuitableAdapter)
        ));
        assert_eq!(
            select_adapter(&entries, &AdapterPreference::Name("NEW".to_owned())).unwrap(),
            1
        );
    }

    #[test]
    fn select_without_adapters() {
        assert!(matches!(
            select_adapter(&[], &AdapterPreference::HighPerformance),
            Err(Error::NoSuitableAdapter)
        ));
    }

    #[test]
    fn render_device_creates_pools() {
        let instance = NullInstance::with_adapters(vec![
            NullAdapterDesc {
                features: AdapterFeatures::SWAPCHAIN,
                ..Default::default()
            },
            NullAdapterDesc::default(),
        ]);

        assert_eq!(enumerate_adapters::<Null>(&instance).unwrap().len(), 2);

        let mut capacities = DescriptorCapacities::default();
        capacities.set(DescriptorKind::Sampler, 7);

        let device = RenderDevice::<Null>::new(
            &instance,
            &AdapterPreference::HighPerformance,
            &capacities,
        )
        .unwrap();

        assert_eq!(device.adapter_index(), 1);
        assert_eq!(device.descriptor_pool(DescriptorKind::Sampler).capacity(), 7);
        assert_eq!(device.descriptor_pool(DescriptorKind::Sampler).free_count(), 7);
        assert!(device.has_dedicated_transfer());
    }
}
