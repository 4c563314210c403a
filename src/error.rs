use thiserror::Error;

use crate::field::Field;
use crate::scene::{EntityId, MeshId};

/// Errors raised while mutating or committing a [`crate::scene::Scene`].
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("mesh has an empty vertex array")]
    EmptyVertices,
    #[error("mesh has no triangles ({0} indices)")]
    BadIndexCount(usize),
    #[error("index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("mesh {0:?} not found")]
    MeshNotFound(MeshId),
    #[error("entity {0:?} not found")]
    EntityNotFound(EntityId),
    #[error("acceleration structure build failed: {0}")]
    BuildFailed(String),
    #[error("device reported out of memory while building acceleration structures")]
    OutOfMemory,
}

/// Errors raised while validating or scheduling a [`crate::graph::Graph`].
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("cycle detected at node `{0}`")]
    Cycle(String),
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("a run is already in progress for this graph")]
    RunInProgress,
    #[error("run was cancelled")]
    Cancelled,
}

/// Errors raised from an individual node's `validate()`/`enqueue()`.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("node `{0}` has no input wired")]
    MissingInput(String),
    #[error("node `{node}` requires field {field:?} which its input does not produce")]
    FieldTypeMismatch { node: String, field: Field },
    #[error("node `{0}` input is not device-accessible")]
    NotDeviceAccessible(String),
    #[error("node `{0}` was skipped because a predecessor failed")]
    Skipped(String),
}

/// Errors wrapping a GPU-device-level failure captured via an error scope.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("wgpu validation error: {0}")]
    Validation(String),
    #[error("wgpu device is out of memory")]
    OutOfMemory,
    #[error("no suitable GPU adapter was found")]
    NoAdapter,
    #[error("device request failed: {0}")]
    RequestFailed(String),
}

/// Top-level error type returned at every API boundary of this crate.
#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not initialized")]
    NotInitialized,
    #[error("already initialized")]
    AlreadyInitialized,
}

pub type SimResult<T> = Result<T, SimError>;
