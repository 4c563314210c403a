//! Process-global GPU handles (spec.md §5 "process-global" OptiX equivalent).
//!
//! Grounded in `utils::get_raytracing_gpu`/`get_adapter_with_capabilities_or_from_env`:
//! same required-features set, same `WGPU_ADAPTER_NAME` convention (now routed
//! through [`crate::config::DeviceConfig`]), but returning `Result` instead of
//! `.expect()`/`panic!`, per SPEC_FULL.md §1.1.

use crate::config::DeviceConfig;
use crate::error::{DeviceError, SimError};

/// The adapter/device/queue triple every scene, array, and node operates
/// against. Created once per process and shared by reference, the way the
/// teacher creates one `(adapter, device, queue)` in `main`/each example and
/// threads it through every call.
pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects an adapter with the ray-tracing feature set the teacher
    /// requires (`get_raytracing_gpu`), honoring `config.adapter_name`/
    /// `config.backend` instead of only an environment variable.
    pub async fn new(config: &DeviceConfig) -> Result<Self, SimError> {
        let instance = wgpu::Instance::default();
        let required_features = wgpu::Features::TEXTURE_BINDING_ARRAY
            | wgpu::Features::STORAGE_RESOURCE_BINDING_ARRAY
            | wgpu::Features::VERTEX_WRITABLE_STORAGE
            | wgpu::Features::EXPERIMENTAL_RAY_QUERY
            | wgpu::Features::EXPERIMENTAL_RAY_TRACING_ACCELERATION_STRUCTURE;

        let adapter = if config.adapter_name.is_some() || config.backend.is_some() {
            wgpu::util::initialize_adapter_from_env_or_default(&instance, config.backend)
                .await
                .map_err(|_| SimError::Device(DeviceError::NoAdapter))?
        } else {
            let backends = wgpu::Backends::all();
            instance
                .enumerate_adapters(backends)
                .into_iter()
                .find(|a| a.features().contains(required_features))
                .ok_or(SimError::Device(DeviceError::NoAdapter))?
        };

        let adapter_features = adapter.features();
        if !adapter_features.contains(required_features) {
            return Err(SimError::Device(DeviceError::NoAdapter));
        }

        let adapter_info = adapter.get_info();
        tracing::info!(name = %adapter_info.name, backend = ?adapter_info.backend, "selected GPU adapter");

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features,
                required_limits: wgpu::Limits::default()
                    .using_minimum_supported_acceleration_structure_values(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| SimError::Device(DeviceError::RequestFailed(e.to_string())))?;

        Ok(Self { adapter, device, queue })
    }

    /// Captures the next validation/OOM error raised by calls issued after
    /// this is called, the way the teacher's `push_error_scope` calls do, but
    /// actually drained via `pop_error_scope` instead of being left open.
    pub fn begin_error_scope(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    pub async fn end_error_scope(&self) -> Result<(), DeviceError> {
        match self.device.pop_error_scope().await {
            None => Ok(()),
            Some(wgpu::Error::OutOfMemory { .. }) => Err(DeviceError::OutOfMemory),
            Some(e) => Err(DeviceError::Validation(e.to_string())),
        }
    }
}
