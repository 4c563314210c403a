//! GPU ray-traced LiDAR and radar point-cloud simulation against
//! triangle-mesh scenes, built around a dynamically mutable processing
//! graph (spec.md §1-§2).
//!
//! A caller builds a [`scene::Scene`] of meshes and entities, wires up a
//! [`graph::Graph`] of [`node`] kinds — a rays-producing node feeding a
//! [`node::raytrace::RayTraceNode`], whose output feeds a chain of
//! transform/filter/merge nodes — and calls [`graph::Graph::run`] to get
//! back a [`graph::RunHandle`] the client reads fields from.

pub mod array;
pub mod config;
pub mod device;
pub mod error;
pub mod field;
pub mod graph;
pub mod node;
pub mod scene;
pub mod types;

pub use array::{Array, ArrayMgr, MemoryDomain};
pub use config::{DeviceConfig, LogLevel, LoggingConfig};
pub use device::GpuContext;
pub use error::{DeviceError, GraphError, NodeError, SceneError, SimError, SimResult};
pub use field::Field;
pub use graph::{CancelToken, Graph, RunHandle};
pub use scene::{EntityId, MeshId, Scene};
pub use types::{M3x4f, V3f, V3i};
