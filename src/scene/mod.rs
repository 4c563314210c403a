//! Scene / acceleration-structure manager (spec.md §4.1).
//!
//! Grounded in the teacher's `RayTraceScene`: one vertex buffer, one index
//! buffer, a `wgpu::Blas` per mesh and a `wgpu::Tlas` for the whole scene,
//! built with `device.create_blas`/`create_tlas` and submitted via
//! `encoder.build_acceleration_structures`. This module generalizes that
//! fixed-at-construction scene into one that supports incremental
//! add/update/remove of meshes and entities with lazy, dirty-driven
//! rebuild/refit at `commit()`.

use std::collections::HashMap;
use std::iter;

use wgpu::util::DeviceExt;

use crate::error::SceneError;
use crate::types::{M3x4f, V3f, V3i};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

/// One mesh's GPU geometry plus its cached acceleration structure.
///
/// Invariant (spec.md §3): if `blas` is `Some` and `!gas_needs_update`, `blas`
/// reflects the current contents of `vertex_buf`/`index_buf`.
struct MeshRecord {
    vertex_buf: wgpu::Buffer,
    index_buf: wgpu::Buffer,
    vertex_count: u32,
    index_count: u32,
    geometry_size: wgpu::BlasTriangleGeometrySizeDescriptor,
    blas: wgpu::Blas,
    gas_needs_update: bool,
    /// Set when index content or vertex *count* changed since the last build;
    /// forces a rebuild instead of a refit.
    topology_dirty: bool,
    ref_count: u32,
}

struct EntityRecord {
    mesh: MeshId,
    transform: M3x4f,
    instance_id: u32,
    texture: Option<u32>,
    visible: bool,
}

/// One TLAS slot's per-instance data for the ray-trace node's resource table
/// (SPEC_FULL.md §2: "per-instance ray-trace resources without an SBT").
/// `geometry_id` indexes the binding array of per-mesh vertex/index buffers
/// the ray-trace node builds from [`Scene::geometry_order`]; `intensity_texture`
/// is `-1` when the entity has none.
#[derive(Clone, Copy, Debug)]
pub struct InstanceResource {
    pub geometry_id: u32,
    pub intensity_texture: i32,
    pub ring_id: u32,
}

/// Owns every mesh and entity in one scene plus its Instance AS, per
/// spec.md §3 "Scene".
///
/// Entities and meshes each keep a separate insertion-order `Vec` alongside
/// their `HashMap` (the same pattern `graph::Graph` uses for its node
/// insertion order): a `HashMap`'s iteration order is an implementation
/// detail, and the ray-trace node's instance/geometry resource tables must
/// line up with the literal TLAS slot / binding-array index the GPU sees, so
/// committing the scene twice without mutating it has to walk entities and
/// meshes in the exact same order both times.
pub struct Scene {
    meshes: HashMap<MeshId, MeshRecord>,
    mesh_order: Vec<MeshId>,
    entities: HashMap<EntityId, EntityRecord>,
    entity_order: Vec<EntityId>,
    next_mesh_id: u64,
    next_entity_id: u64,
    tlas: Option<wgpu::Tlas>,
    /// Any entity added or removed since the last commit: forces a TLAS rebuild.
    ias_structural_dirty: bool,
    /// Only transforms changed since the last commit: a TLAS refit suffices.
    ias_transforms_dirty: bool,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            meshes: HashMap::new(),
            mesh_order: Vec::new(),
            entities: HashMap::new(),
            entity_order: Vec::new(),
            next_mesh_id: 0,
            next_entity_id: 0,
            tlas: None,
            ias_structural_dirty: false,
            ias_transforms_dirty: false,
        }
    }

    fn validate_geometry(vertices: &[V3f], indices: &[V3i]) -> Result<(), SceneError> {
        if vertices.is_empty() {
            return Err(SceneError::EmptyVertices);
        }
        if indices.is_empty() {
            return Err(SceneError::BadIndexCount(0));
        }
        for tri in indices {
            for idx in [tri.x, tri.y, tri.z] {
                if idx < 0 || idx as usize >= vertices.len() {
                    return Err(SceneError::IndexOutOfRange {
                        index: idx as u32,
                        vertex_count: vertices.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Adds a mesh from already-extracted vertex/index arrays (mesh loading
    /// from disk is an external collaborator, per spec.md §1). Validation
    /// happens before any state mutation, so a rejected call leaves the scene
    /// untouched (spec.md §7 "transactional per mutation call").
    pub fn add_mesh(
        &mut self,
        device: &wgpu::Device,
        vertices: &[V3f],
        indices: &[V3i],
    ) -> Result<MeshId, SceneError> {
        Self::validate_geometry(vertices, indices)?;

        let vertex_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scene::mesh::vertices"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::BLAS_INPUT,
        });
        let index_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scene::mesh::indices"),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::BLAS_INPUT,
        });

        let geometry_size = wgpu::BlasTriangleGeometrySizeDescriptor {
            vertex_count: vertices.len() as u32,
            vertex_format: wgpu::VertexFormat::Float32x3,
            index_count: Some((indices.len() * 3) as u32),
            index_format: Some(wgpu::IndexFormat::Uint32),
            flags: wgpu::AccelerationStructureGeometryFlags::OPAQUE,
        };

        let blas = device.create_blas(
            &wgpu::CreateBlasDescriptor {
                label: Some("scene::mesh::blas"),
                flags: wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE
                    | wgpu::AccelerationStructureFlags::ALLOW_UPDATE,
                // `PreferUpdate` lets `update_vertices` refit this handle in
                // place on a position-only change instead of forcing a
                // rebuild through `commit()` every time.
                update_mode: wgpu::AccelerationStructureUpdateMode::PreferUpdate,
            },
            wgpu::BlasGeometrySizeDescriptors::Triangles {
                descriptors: vec![geometry_size.clone()],
            },
        );

        let id = MeshId(self.next_mesh_id);
        self.next_mesh_id += 1;
        self.meshes.insert(
            id,
            MeshRecord {
                vertex_buf,
                index_buf,
                vertex_count: vertices.len() as u32,
                index_count: (indices.len() * 3) as u32,
                geometry_size,
                blas,
                gas_needs_update: true,
                topology_dirty: true,
                ref_count: 0,
            },
        );
        self.mesh_order.push(id);
        Ok(id)
    }

    /// Updates a mesh's vertex positions. If the vertex count is unchanged
    /// only positions moved, so the next commit refits the GAS in place;
    /// otherwise the next commit rebuilds it (spec.md §4.1 build policy).
    pub fn update_vertices(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        mesh: MeshId,
        vertices: &[V3f],
    ) -> Result<(), SceneError> {
        let record = self.meshes.get_mut(&mesh).ok_or(SceneError::MeshNotFound(mesh))?;
        if vertices.is_empty() {
            return Err(SceneError::EmptyVertices);
        }
        let topology_changed = vertices.len() as u32 != record.vertex_count;
        if topology_changed {
            let new_vertex_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("scene::mesh::vertices"),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::BLAS_INPUT,
            });
            record.vertex_buf = new_vertex_buf;
            record.vertex_count = vertices.len() as u32;
            record.geometry_size.vertex_count = record.vertex_count;
            // A `Blas` is sized at creation from its `BlasGeometrySizeDescriptors`
            // (spec.md §4.1: topology change forces a rebuild, not a refit) — the
            // old handle was built for the previous vertex count and can't just be
            // re-pointed at a differently-sized geometry, so it's recreated here
            // and the next `commit()` does a fresh build against it.
            record.blas = device.create_blas(
                &wgpu::CreateBlasDescriptor {
                    label: Some("scene::mesh::blas"),
                    flags: wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE
                        | wgpu::AccelerationStructureFlags::ALLOW_UPDATE,
                    update_mode: wgpu::AccelerationStructureUpdateMode::PreferUpdate,
                },
                wgpu::BlasGeometrySizeDescriptors::Triangles {
                    descriptors: vec![record.geometry_size.clone()],
                },
            );
            record.topology_dirty = true;
        } else {
            queue.write_buffer(&record.vertex_buf, 0, bytemuck::cast_slice(vertices));
        }
        record.gas_needs_update = true;
        Ok(())
    }

    pub fn remove_mesh(&mut self, mesh: MeshId) -> Result<(), SceneError> {
        let record = self.meshes.get(&mesh).ok_or(SceneError::MeshNotFound(mesh))?;
        if record.ref_count > 0 {
            return Err(SceneError::BuildFailed(format!(
                "mesh {mesh:?} is still referenced by {} entities",
                record.ref_count
            )));
        }
        self.meshes.remove(&mesh);
        self.mesh_order.retain(|m| *m != mesh);
        Ok(())
    }

    pub fn add_entity(
        &mut self,
        mesh: MeshId,
        transform: M3x4f,
        instance_id: u32,
        texture: Option<u32>,
    ) -> Result<EntityId, SceneError> {
        let record = self.meshes.get_mut(&mesh).ok_or(SceneError::MeshNotFound(mesh))?;
        record.ref_count += 1;
        let id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;
        self.entities.insert(
            id,
            EntityRecord {
                mesh,
                transform,
                instance_id,
                texture,
                visible: true,
            },
        );
        self.entity_order.push(id);
        self.ias_structural_dirty = true;
        Ok(id)
    }

    pub fn set_transform(&mut self, entity: EntityId, transform: M3x4f) -> Result<(), SceneError> {
        let record = self
            .entities
            .get_mut(&entity)
            .ok_or(SceneError::EntityNotFound(entity))?;
        record.transform = transform;
        self.ias_transforms_dirty = true;
        Ok(())
    }

    pub fn set_visible(&mut self, entity: EntityId, visible: bool) -> Result<(), SceneError> {
        let record = self
            .entities
            .get_mut(&entity)
            .ok_or(SceneError::EntityNotFound(entity))?;
        record.visible = visible;
        self.ias_structural_dirty = true;
        Ok(())
    }

    pub fn remove_entity(&mut self, entity: EntityId) -> Result<(), SceneError> {
        let record = self
            .entities
            .remove(&entity)
            .ok_or(SceneError::EntityNotFound(entity))?;
        if let Some(mesh) = self.meshes.get_mut(&record.mesh) {
            mesh.ref_count = mesh.ref_count.saturating_sub(1);
        }
        self.entity_order.retain(|e| *e != entity);
        self.ias_structural_dirty = true;
        Ok(())
    }

    /// Stable per-mesh index used both as the ray-trace node's vertex/index
    /// binding-array slot and as [`InstanceResource::geometry_id`]. Positions
    /// only change when a mesh is removed.
    pub fn geometry_order(&self) -> &[MeshId] {
        &self.mesh_order
    }

    /// The vertex buffer, index buffer, and triangle-index count for one
    /// mesh, for the ray-trace node to bind into its vertex/index binding
    /// arrays in [`Scene::geometry_order`] order.
    pub fn mesh_buffers(&self, mesh: MeshId) -> Option<(&wgpu::Buffer, &wgpu::Buffer, u32)> {
        self.meshes.get(&mesh).map(|m| (&m.vertex_buf, &m.index_buf, m.index_count))
    }

    /// One [`InstanceResource`] per live TLAS slot, in the same order
    /// `commit()` assigns slots — i.e. the order a ray query's built-in
    /// `instance_index` will report. Entities hidden via `set_visible(false)`
    /// still occupy a slot (their TLAS entry is `None`, so a ray can never
    /// actually report that `instance_index`) so the table stays aligned with
    /// slot position without the caller having to track which slots are holes.
    pub fn instance_resources(&self) -> Vec<InstanceResource> {
        let geometry_index: HashMap<MeshId, u32> =
            self.mesh_order.iter().enumerate().map(|(i, id)| (*id, i as u32)).collect();
        self.entity_order
            .iter()
            .filter_map(|id| self.entities.get(id))
            .map(|e| InstanceResource {
                geometry_id: geometry_index.get(&e.mesh).copied().unwrap_or(0),
                intensity_texture: e.texture.map(|t| t as i32).unwrap_or(-1),
                ring_id: e.instance_id,
            })
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// Idempotent: ensures every dirty GAS is rebuilt or refit and the IAS
    /// reflects the current entity set, then returns the TLAS handle
    /// (spec.md §4.1). Builds submit to `queue` via one command encoder, the
    /// crate's stand-in for "the provided stream".
    pub fn commit(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<&wgpu::Tlas, SceneError> {
        let any_gas_dirty = self.meshes.values().any(|m| m.gas_needs_update);
        if !any_gas_dirty && !self.ias_structural_dirty && !self.ias_transforms_dirty && self.tlas.is_some()
        {
            return Ok(self.tlas.as_ref().unwrap());
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("scene::commit"),
        });

        let dirty_mesh_ids: Vec<MeshId> = self
            .mesh_order
            .iter()
            .copied()
            .filter(|id| self.meshes[id].gas_needs_update)
            .collect();

        for id in &dirty_mesh_ids {
            let record = self.meshes.get(id).unwrap();
            if record.topology_dirty {
                tracing::debug!(mesh = ?id, "rebuilding geometry acceleration structure");
            } else {
                tracing::debug!(mesh = ?id, "refitting geometry acceleration structure");
            }
            let entry = wgpu::BlasBuildEntry {
                blas: &record.blas,
                geometry: wgpu::BlasGeometries::TriangleGeometries(vec![
                    wgpu::BlasTriangleGeometry {
                        size: &record.geometry_size,
                        vertex_buffer: &record.vertex_buf,
                        first_vertex: 0,
                        vertex_stride: std::mem::size_of::<V3f>() as u64,
                        index_buffer: Some(&record.index_buf),
                        first_index: Some(0),
                        transform_buffer: None,
                        transform_buffer_offset: None,
                    },
                ]),
            };
            encoder.build_acceleration_structures(iter::once(&entry), iter::empty());
        }

        if self.tlas.is_none() || self.ias_structural_dirty {
            let max_instances = self.entity_order.len().max(1) as u32;
            let tlas = device.create_tlas(&wgpu::CreateTlasDescriptor {
                label: Some("scene::tlas"),
                flags: wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE
                    | wgpu::AccelerationStructureFlags::ALLOW_UPDATE,
                // Only recreated on a structural change (entity added/removed);
                // a transform-only change reuses this handle below, and
                // `PreferUpdate` is what makes that reuse an actual IAS refit
                // instead of a full rebuild every frame.
                update_mode: wgpu::AccelerationStructureUpdateMode::PreferUpdate,
                max_instances,
            });
            self.tlas = Some(tlas);
        }

        {
            let tlas_package = self.tlas.as_mut().unwrap();
            for (idx, entity) in
                self.entity_order.iter().filter_map(|id| self.entities.get(id)).enumerate()
            {
                if !entity.visible {
                    tlas_package[idx] = None;
                    continue;
                }
                let Some(mesh) = self.meshes.get(&entity.mesh) else {
                    continue;
                };
                tlas_package[idx] = Some(wgpu::TlasInstance::new(
                    &mesh.blas,
                    entity.transform.rows,
                    entity.instance_id,
                    0xff,
                ));
            }
            encoder.build_acceleration_structures(iter::empty(), iter::once(&*tlas_package));
        }

        queue.submit(Some(encoder.finish()));

        for id in dirty_mesh_ids {
            if let Some(record) = self.meshes.get_mut(&id) {
                record.gas_needs_update = false;
                record.topology_dirty = false;
            }
        }
        self.ias_structural_dirty = false;
        self.ias_transforms_dirty = false;

        Ok(self.tlas.as_ref().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_geometry_rejects_empty_vertices() {
        let err = Scene::validate_geometry(&[], &[]);
        assert!(matches!(err, Err(SceneError::EmptyVertices)));
    }

    #[test]
    fn validate_geometry_rejects_out_of_range_index() {
        let verts = [V3f::new(0.0, 0.0, 0.0), V3f::new(1.0, 0.0, 0.0), V3f::new(0.0, 1.0, 0.0)];
        let idx = [V3i::new(0, 1, 5)];
        let err = Scene::validate_geometry(&verts, &idx);
        assert!(matches!(err, Err(SceneError::IndexOutOfRange { .. })));
    }

    #[test]
    fn validate_geometry_accepts_one_triangle() {
        let verts = [V3f::new(0.0, 0.0, 0.0), V3f::new(1.0, 0.0, 0.0), V3f::new(0.0, 1.0, 0.0)];
        let idx = [V3i::new(0, 1, 2)];
        assert!(Scene::validate_geometry(&verts, &idx).is_ok());
    }
}
