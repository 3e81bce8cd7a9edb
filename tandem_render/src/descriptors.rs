//! Fixed-capacity descriptor pools.
//!
//! A [`DescriptorPool`] owns one backend descriptor heap of a single
//! [`DescriptorKind`]. Slots are handed out as [`DescriptorHandle`]s which return
//! their slot to the pool when dropped.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_tracing::trace_span;

use crate::backend::{Api, DescriptorHeap, DescriptorKind, DescriptorWrite, Device};
use crate::error::{Error, Result};

pub struct DescriptorPool<A: Api> {
    inner: Arc<PoolInner<A>>,
}

struct PoolInner<A: Api> {
    heap: A::DescriptorHeap,
    kind: DescriptorKind,
    capacity: u32,
    cpu_handles: Vec<u64>,
    gpu_handles: Option<Vec<u64>>,
    /// Free slots. The last element is handed out next.
    free: Mutex<Vec<u32>>,
}

impl<A: Api> DescriptorPool<A> {
    pub fn new(device: &A::Device, kind: DescriptorKind, capacity: u32) -> Result<Self> {
        let heap = device.create_descriptor_heap(kind, capacity)?;

        let stride = heap.stride();
        let cpu_base = heap.cpu_base();
        let cpu_handles = (0..u64::from(capacity))
            .map(|index| cpu_base + index * stride)
            .collect();
        let gpu_handles = heap.gpu_base().map(|base| {
            (0..u64::from(capacity))
                .map(|index| base + index * stride)
                .collect()
        });

        // Reversed so that slot 0 is allocated first.
        let free = (0..capacity).rev().collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                heap,
                kind,
                capacity,
                cpu_handles,
                gpu_handles,
                free: Mutex::new(free),
            }),
        })
    }

    pub fn kind(&self) -> DescriptorKind {
        self.inner.kind
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Number of slots that are currently not allocated.
    pub fn free_count(&self) -> u32 {
        self.inner.free.lock().len() as u32
    }

    pub fn heap(&self) -> &A::DescriptorHeap {
        &self.inner.heap
    }

    /// Allocates a single slot.
    ///
    /// Returns [`Error::OutOfCapacity`] if all slots are in use.
    pub fn allocate(&self) -> Result<DescriptorHandle<A>> {
        let _span = trace_span!("DescriptorPool::allocate").entered();

        let index = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or(Error::OutOfCapacity("descriptor pool"))?;

        Ok(DescriptorHandle {
            slot: Some(Slot {
                pool: self.inner.clone(),
                index,
            }),
        })
    }

    /// Allocates `count` slots and appends them to `out`.
    ///
    /// Either all `count` slots are allocated or none are.
    pub fn allocate_n(&self, count: u32, out: &mut Vec<DescriptorHandle<A>>) -> Result<()> {
        let _span = trace_span!("DescriptorPool::allocate_n").entered();

        let mut free = self.inner.free.lock();
        if free.len() < count as usize {
            return Err(Error::OutOfCapacity("descriptor pool"));
        }

        out.reserve(count as usize);
        for _ in 0..count {
            // Cannot fail, the length was checked above.
            let Some(index) = free.pop() else { break };
            out.push(DescriptorHandle {
                slot: Some(Slot {
                    pool: self.inner.clone(),
                    index,
                }),
            });
        }

        Ok(())
    }
}

impl<A: Api> Clone for DescriptorPool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Api> Debug for DescriptorPool<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("kind", &self.inner.kind)
            .field("capacity", &self.inner.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

struct Slot<A: Api> {
    pool: Arc<PoolInner<A>>,
    index: u32,
}

/// Exclusive ownership of one slot in a [`DescriptorPool`].
///
/// A handle is either empty or owns exactly one slot. The slot is returned to the
/// pool when the handle is dropped.
pub struct DescriptorHandle<A: Api> {
    slot: Option<Slot<A>>,
}

impl<A: Api> DescriptorHandle<A> {
    /// Creates a handle that owns no slot.
    pub const fn empty() -> Self {
        Self { slot: None }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    /// Moves the slot out of this handle, leaving an empty handle behind.
    pub fn take(&mut self) -> Self {
        Self {
            slot: self.slot.take(),
        }
    }

    /// Index of the slot in its heap.
    pub fn index(&self) -> Option<u32> {
        self.slot.as_ref().map(|slot| slot.index)
    }

    pub fn cpu_handle(&self) -> Option<u64> {
        self.slot
            .as_ref()
            .map(|slot| slot.pool.cpu_handles[slot.index as usize])
    }

    pub fn gpu_handle(&self) -> Option<u64> {
        let slot = self.slot.as_ref()?;
        let handles = slot.pool.gpu_handles.as_ref()?;
        Some(handles[slot.index as usize])
    }

    pub fn heap(&self) -> Option<&A::DescriptorHeap> {
        self.slot.as_ref().map(|slot| &slot.pool.heap)
    }

    /// Returns the heap and slot index to bind this descriptor.
    pub fn binding(&self) -> Option<(&A::DescriptorHeap, u32)> {
        self.slot.as_ref().map(|slot| (&slot.pool.heap, slot.index))
    }

    /// Writes `write` into the slot.
    ///
    /// The slot must not be in use by GPU work that has not completed yet.
    pub fn write(&self, device: &A::Device, write: &DescriptorWrite<'_, A>) {
        let Some(slot) = &self.slot else {
            tracing::warn!("writing to empty descriptor handle");
            return;
        };

        // SAFETY: The slot index is within the heap capacity and exclusively owned by
        // this handle.
        unsafe {
            device.write_descriptor(&slot.pool.heap, slot.index, write);
        }
    }
}

impl<A: Api> Default for DescriptorHandle<A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A: Api> Debug for DescriptorHandle<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Some(slot) => f
                .debug_struct("DescriptorHandle")
                .field("kind", &slot.pool.kind)
                .field("index", &slot.index)
                .finish(),
            None => f.write_str("DescriptorHandle(empty)"),
        }
    }
}

impl<A: Api> Drop for DescriptorHandle<A> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let mut free = slot.pool.free.lock();
            debug_assert!(!free.contains(&slot.index), "double free of descriptor slot");
            free.push(slot.index);
        }
    }
}

/// One [`DescriptorPool`] for every [`DescriptorKind`].
pub struct DescriptorPools<A: Api> {
    pools: Vec<DescriptorPool<A>>,
}

impl<A: Api> DescriptorPools<A> {
    pub fn new(
        device: &A::Device,
        capacity: impl Fn(DescriptorKind) -> u32,
    ) -> Result<Self> {
        let pools = DescriptorKind::ALL
            .iter()
            .map(|kind| DescriptorPool::new(device, *kind, capacity(*kind)))
            .collect::<Result<_>>()?;

        Ok(Self { pools })
    }

    pub fn get(&self, kind: DescriptorKind) -> &DescriptorPool<A> {
        &self.pools[kind as usize]
    }

    pub fn allocate(&self, kind: DescriptorKind) -> Result<DescriptorHandle<A>> {
        self.get(kind).allocate()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::backend::null::Null;
    use crate::backend::DescriptorKind;
    use crate::error::Error;
    use crate::test_util::null_device;

    use super::{DescriptorHandle, DescriptorPool};

    #[test]
    fn descriptor_pool_lifo() {
        let device = null_device();
        let pool = DescriptorPool::<Null>::new(&device, DescriptorKind::SampledImage, 4).unwrap();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.index(), Some(0));
        assert_eq!(b.index(), Some(1));

        drop(a);
        let c = pool.allocate().unwrap();
        assert_eq!(c.index(), Some(0));
    }

    #[test]
    fn descriptor_pool_out_of_capacity() {
        let device = null_device();
        let pool = DescriptorPool::<Null>::new(&device, DescriptorKind::Sampler, 2).unwrap();

        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(Error::OutOfCapacity(_))));
    }

    #[test]
    fn descriptor_pool_allocate_n_is_all_or_nothing() {
        let device = null_device();
        let pool = DescriptorPool::<Null>::new(&device, DescriptorKind::UniformBuffer, 8).unwrap();

        let mut handles = Vec::new();
        pool.allocate_n(5, &mut handles).unwrap();
        assert_eq!(pool.free_count(), 3);

        assert!(pool.allocate_n(4, &mut handles).is_err());
        assert_eq!(handles.len(), 5);
        assert_eq!(pool.free_count(), 3);

        handles.clear();
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn descriptor_handle_addresses() {
        let device = null_device();
        let pool = DescriptorPool::<Null>::new(&device, DescriptorKind::SampledImage, 4).unwrap();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let stride = b.cpu_handle().unwrap() - a.cpu_handle().unwrap();
        assert_eq!(stride, 32);
        assert_eq!(b.gpu_handle().unwrap() - a.gpu_handle().unwrap(), stride);
    }

    #[test]
    fn descriptor_handle_take_moves_slot() {
        let device = null_device();
        let pool = DescriptorPool::<Null>::new(&device, DescriptorKind::SampledImage, 1).unwrap();

        let mut a = pool.allocate().unwrap();
        let b = a.take();
        assert!(a.is_empty());
        assert!(!b.is_empty());

        drop(a);
        assert_eq!(pool.free_count(), 0);
        drop(b);
        assert_eq!(pool.free_count(), 1);

        let empty = DescriptorHandle::<Null>::empty();
        assert_eq!(empty.cpu_handle(), None);
    }

    #[test]
    fn descriptor_pool_free_count_invariant() {
        let device = null_device();
        let capacity = 32;
        let pool =
            DescriptorPool::<Null>::new(&device, DescriptorKind::SampledImage, capacity).unwrap();

        let mut rng = StdRng::seed_from_u64(0x7a4d);
        let mut live = Vec::new();

        for _ in 0..2000 {
            if rng.random_bool(0.55) {
                match pool.allocate() {
                    Ok(handle) => live.push(handle),
                    Err(_) => assert_eq!(live.len() as u32, capacity),
                }
            } else if !live.is_empty() {
                let index = rng.random_range(0..live.len());
                live.swap_remove(index);
            }

            assert_eq!(pool.free_count(), capacity - live.len() as u32);
        }

        live.clear();
        assert_eq!(pool.free_count(), capacity);
    }
}
