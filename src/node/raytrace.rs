//! Ray-trace node (spec.md §4.5): launches the ray-query kernel against the
//! scene's TLAS and writes XYZ/DISTANCE/AZIMUTH/ELEVATION/INTENSITY/IS_HIT/
//! RAY_IDX/NORMAL for every input ray.
//!
//! Grounded in the teacher's `Lidar::render_lidar_beams`/`render_depth_camera`:
//! same shape (build a bind group around the TLAS + a uniform + a ray buffer,
//! dispatch one workgroup per chunk of rays, read back through a staging
//! buffer), generalized from a fixed ray-direction buffer baked in at
//! construction to an arbitrary upstream rays-producing node, and from a
//! single flat output buffer to the crate's per-field `Array`s.

use std::borrow::Cow;
use std::sync::Arc;

use bytemuck_derive::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::array::Array;
use crate::error::{NodeError, SimError};
use crate::field::Field;
use crate::node::{
    find_predecessor, require_input, Capabilities, EnqueueEnv, FieldBuffer, NodeId, NodeKind,
    OutputStore, PredecessorView,
};

/// Matches `MAX_GEOMETRIES` in `raytrace.wgsl`. Bounds the vertex/index
/// binding-array size declared at pipeline-layout time; scenes with more live
/// meshes than this would need a larger constant recompiled into the shader.
const MAX_GEOMETRIES: u32 = 32;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GpuInstanceResource {
    geometry_id: u32,
    intensity_texture: i32,
    ring_id: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GpuParams {
    num_rays: u32,
    range_max: f32,
    epsilon: f32,
    _pad: u32,
}

/// Static parameters (spec.md §4.5: "range, beam divergence, etc."). Beam
/// divergence is modeled downstream by [`crate::node::noise::GaussianNoiseNode`]
/// rather than inside the trace kernel itself, so this node only owns range
/// and the self-intersection epsilon.
#[derive(Clone, Copy, Debug)]
pub struct RayTraceParams {
    pub range_max: f32,
    pub epsilon: f32,
}

impl Default for RayTraceParams {
    fn default() -> Self {
        Self { range_max: 100.0, epsilon: 1e-4 }
    }
}

pub struct RayTraceNode {
    rays_input: NodeId,
    params: RayTraceParams,
    pipeline: Option<wgpu::ComputePipeline>,
    outputs: OutputStore,
    width: usize,
}

impl RayTraceNode {
    pub fn new(rays_input: NodeId, params: RayTraceParams) -> Self {
        Self { rays_input, params, pipeline: None, outputs: OutputStore::default(), width: 0 }
    }

    pub fn set_params(&mut self, params: RayTraceParams) {
        self.params = params;
    }

    fn pipeline(&mut self, device: &wgpu::Device) -> &wgpu::ComputePipeline {
        if self.pipeline.is_none() {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("raytrace_node"),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("raytrace.wgsl"))),
            });
            self.pipeline = Some(device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("raytrace_node"),
                layout: None,
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            }));
        }
        self.pipeline.as_ref().unwrap()
    }
}

impl NodeKind for RayTraceNode {
    fn name(&self) -> &str {
        "raytrace"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_rays: true, produces_points: true, needs_scene: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::RayTransform]
    }

    fn produced_fields(&self) -> Vec<Field> {
        vec![
            Field::Xyz,
            Field::Distance,
            Field::Azimuth,
            Field::Elevation,
            Field::Intensity,
            Field::IsHit,
            Field::RayIdx,
            Field::Normal,
        ]
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.rays_input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        if !pred.capabilities.produces_rays || !pred.produced_fields.contains(&Field::RayTransform) {
            return Err(NodeError::FieldTypeMismatch {
                node: self.name().to_string(),
                field: Field::RayTransform,
            });
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        let rays_buf = require_input(env.inputs, self.rays_input, Field::RayTransform, self.name())?;
        let rays = rays_buf.as_rays().ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        let ray_count = rays.get_count();
        self.width = ray_count;

        let scene = env
            .scene
            .as_deref_mut()
            .ok_or_else(|| NodeError::NotDeviceAccessible(self.name().to_string()))?;
        let tlas = scene.commit(env.device, env.queue).map_err(SimError::Scene)?;

        let device = env.device;
        let queue = env.queue;

        let mut out_xyz = Array::<crate::types::V3f>::new_device(device, Field::Xyz, ray_count.max(1));
        let mut out_normal = Array::<crate::types::V3f>::new_device(device, Field::Normal, ray_count.max(1));
        let mut out_distance = Array::<f32>::new_device(device, Field::Distance, ray_count.max(1));
        let mut out_azimuth = Array::<f32>::new_device(device, Field::Azimuth, ray_count.max(1));
        let mut out_elevation = Array::<f32>::new_device(device, Field::Elevation, ray_count.max(1));
        let mut out_intensity = Array::<f32>::new_device(device, Field::Intensity, ray_count.max(1));
        let mut out_is_hit = Array::<u32>::new_device(device, Field::IsHit, ray_count.max(1));
        let mut out_ray_idx = Array::<u32>::new_device(device, Field::RayIdx, ray_count.max(1));

        if ray_count == 0 {
            self.outputs.set(Field::Xyz, FieldBuffer::Vec3(out_xyz));
            self.outputs.set(Field::Normal, FieldBuffer::Vec3(out_normal));
            self.outputs.set(Field::Distance, FieldBuffer::Scalar(out_distance));
            self.outputs.set(Field::Azimuth, FieldBuffer::Scalar(out_azimuth));
            self.outputs.set(Field::Elevation, FieldBuffer::Scalar(out_elevation));
            self.outputs.set(Field::Intensity, FieldBuffer::Scalar(out_intensity));
            self.outputs.set(Field::IsHit, FieldBuffer::Flag(out_is_hit));
            self.outputs.set(Field::RayIdx, FieldBuffer::Index(out_ray_idx));
            return Ok(());
        }

        let geometry_order = scene.geometry_order().to_vec();
        let mut vertex_buffers: Vec<&wgpu::Buffer> = Vec::with_capacity(MAX_GEOMETRIES as usize);
        let mut index_buffers: Vec<&wgpu::Buffer> = Vec::with_capacity(MAX_GEOMETRIES as usize);
        for id in &geometry_order {
            let (vbuf, ibuf, _) = scene
                .mesh_buffers(*id)
                .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
            vertex_buffers.push(vbuf);
            index_buffers.push(ibuf);
        }
        let dummy_vertex = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("raytrace::dummy_vertex"),
            contents: bytemuck::cast_slice(&[0.0f32; 3]),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let dummy_index = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("raytrace::dummy_index"),
            contents: bytemuck::cast_slice(&[0u32; 3]),
            usage: wgpu::BufferUsages::STORAGE,
        });
        while vertex_buffers.len() < MAX_GEOMETRIES as usize {
            vertex_buffers.push(&dummy_vertex);
            index_buffers.push(&dummy_index);
        }

        let gpu_resources: Vec<GpuInstanceResource> = scene
            .instance_resources()
            .into_iter()
            .map(|r| GpuInstanceResource {
                geometry_id: r.geometry_id,
                intensity_texture: r.intensity_texture,
                ring_id: r.ring_id,
                _pad: 0,
            })
            .collect();
        let resources_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("raytrace::instance_resources"),
            contents: bytemuck::cast_slice(if gpu_resources.is_empty() {
                &[GpuInstanceResource { geometry_id: 0, intensity_texture: -1, ring_id: 0, _pad: 0 }]
            } else {
                gpu_resources.as_slice()
            }),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("raytrace::params"),
            contents: bytemuck::bytes_of(&GpuParams {
                num_rays: ray_count as u32,
                range_max: self.params.range_max,
                epsilon: self.params.epsilon,
                _pad: 0,
            }),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let pipeline = self.pipeline(device);
        let group0_layout = pipeline.get_bind_group_layout(0);
        let group1_layout = pipeline.get_bind_group_layout(1);

        let group0 = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("raytrace::group0"),
            layout: &group0_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::AccelerationStructure(tlas) },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: rays.device_buffer().ok_or_else(|| NodeError::NotDeviceAccessible(self.name().to_string()))?.as_entire_binding(),
                },
                wgpu::BindGroupEntry { binding: 2, resource: resources_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::BufferArray(
                        &vertex_buffers.iter().map(|b| b.as_entire_buffer_binding()).collect::<Vec<_>>(),
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::BufferArray(
                        &index_buffers.iter().map(|b| b.as_entire_buffer_binding()).collect::<Vec<_>>(),
                    ),
                },
            ],
        });

        let group1 = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("raytrace::group1"),
            layout: &group1_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: out_xyz.device_buffer().unwrap().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: out_normal.device_buffer().unwrap().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: out_distance.device_buffer().unwrap().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: out_azimuth.device_buffer().unwrap().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: out_elevation.device_buffer().unwrap().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: out_intensity.device_buffer().unwrap().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: out_is_hit.device_buffer().unwrap().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 7, resource: out_ray_idx.device_buffer().unwrap().as_entire_binding() },
            ],
        });

        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("raytrace::enqueue") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("raytrace::pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(&group0), &[]);
            pass.set_bind_group(1, Some(&group1), &[]);
            let workgroups = (ray_count as u32).div_ceil(64);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        queue.submit(Some(encoder.finish()));

        self.outputs.set(Field::Xyz, FieldBuffer::Vec3(out_xyz));
        self.outputs.set(Field::Normal, FieldBuffer::Vec3(out_normal));
        self.outputs.set(Field::Distance, FieldBuffer::Scalar(out_distance));
        self.outputs.set(Field::Azimuth, FieldBuffer::Scalar(out_azimuth));
        self.outputs.set(Field::Elevation, FieldBuffer::Scalar(out_elevation));
        self.outputs.set(Field::Intensity, FieldBuffer::Scalar(out_intensity));
        self.outputs.set(Field::IsHit, FieldBuffer::Flag(out_is_hit));
        self.outputs.set(Field::RayIdx, FieldBuffer::Index(out_ray_idx));
        Ok(())
    }

    fn width(&self) -> usize {
        self.width
    }

    fn output_fields(&self) -> Vec<Field> {
        self.outputs.fields()
    }

    fn output(&self, field: Field) -> Option<Arc<FieldBuffer>> {
        self.outputs.get(field)
    }

    fn get_field_data(
        &mut self,
        field: Field,
        _device: &wgpu::Device,
        _queue: &wgpu::Queue,
    ) -> Result<Arc<FieldBuffer>, NodeError> {
        self.outputs.get(field).ok_or_else(|| NodeError::MissingInput(self.name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produced_fields_cover_spec_minimum() {
        let node = RayTraceNode::new(NodeId(0), RayTraceParams::default());
        for f in [
            Field::Xyz,
            Field::Distance,
            Field::Azimuth,
            Field::Elevation,
            Field::Intensity,
            Field::IsHit,
            Field::RayIdx,
            Field::Normal,
        ] {
            assert!(node.produced_fields().contains(&f));
        }
    }
}
