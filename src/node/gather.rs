//! Shared device-side indexed gather — spec.md §4.6's "gpuFilter" kernel,
//! used by [`crate::node::compact::CompactByFieldNode`]'s scatter and
//! [`crate::node::radar::RadarPostprocessNode`]'s final per-field gather of
//! cluster centers (spec.md §4.6 step 5: "gathered from the input via the
//! stream-scoped `gpuFilter` kernel"). One `dispatch_gather` call per field,
//! all against the same compiled pipeline.

use std::borrow::Cow;

use bytemuck_derive::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::array::Array;
use crate::node::FieldBuffer;
use crate::types::{M3x4f, V3f};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GatherParams {
    count: u32,
    stride: u32,
    _pad: [u32; 2],
}

fn pipeline(device: &wgpu::Device) -> wgpu::ComputePipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("gather"),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("gather.wgsl"))),
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("gather"),
        layout: None,
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

fn dispatch_gather(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    dst: &wgpu::Buffer,
    indices: &[u32],
    stride_words: u32,
) {
    let pipeline = pipeline(device);
    let indices_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("gather::indices"),
        contents: bytemuck::cast_slice(indices),
        usage: wgpu::BufferUsages::STORAGE,
    });
    let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("gather::params"),
        contents: bytemuck::bytes_of(&GatherParams {
            count: indices.len() as u32,
            stride: stride_words,
            _pad: [0; 2],
        }),
        usage: wgpu::BufferUsages::UNIFORM,
    });
    let layout = pipeline.get_bind_group_layout(0);
    let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("gather::group"),
        layout: &layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: src.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: indices_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: dst.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
        ],
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("gather::enqueue"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("gather::pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, Some(&group), &[]);
        pass.dispatch_workgroups((indices.len() as u32).div_ceil(64).max(1), 1, 1);
    }
    queue.submit(Some(encoder.finish()));
}

/// Gathers `field` from `src` at `indices` (in order) into a freshly
/// allocated same-kind buffer of length `indices.len()`.
pub(crate) fn gpu_gather(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &FieldBuffer,
    indices: &[u32],
) -> FieldBuffer {
    match src {
        FieldBuffer::Vec3(a) => {
            let dst = Array::<V3f>::new_device(device, a.field(), indices.len());
            if !indices.is_empty() {
                dispatch_gather(device, queue, a.device_buffer().unwrap(), dst.device_buffer().unwrap(), indices, 3);
            }
            FieldBuffer::Vec3(dst)
        }
        FieldBuffer::Scalar(a) => {
            let dst = Array::<f32>::new_device(device, a.field(), indices.len());
            if !indices.is_empty() {
                dispatch_gather(device, queue, a.device_buffer().unwrap(), dst.device_buffer().unwrap(), indices, 1);
            }
            FieldBuffer::Scalar(dst)
        }
        FieldBuffer::Index(a) => {
            let dst = Array::<u32>::new_device(device, a.field(), indices.len());
            if !indices.is_empty() {
                dispatch_gather(device, queue, a.device_buffer().unwrap(), dst.device_buffer().unwrap(), indices, 1);
            }
            FieldBuffer::Index(dst)
        }
        FieldBuffer::Flag(a) => {
            let dst = Array::<u32>::new_device(device, a.field(), indices.len());
            if !indices.is_empty() {
                dispatch_gather(device, queue, a.device_buffer().unwrap(), dst.device_buffer().unwrap(), indices, 1);
            }
            FieldBuffer::Flag(dst)
        }
        FieldBuffer::Rays(a) => {
            let dst = Array::<M3x4f>::new_device(device, a.field(), indices.len());
            if !indices.is_empty() {
                dispatch_gather(device, queue, a.device_buffer().unwrap(), dst.device_buffer().unwrap(), indices, 12);
            }
            FieldBuffer::Rays(dst)
        }
    }
}
