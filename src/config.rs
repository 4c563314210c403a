//! Logging/configuration plumbing (spec.md §6, SPEC_FULL.md §1.2/§1.3).
//!
//! The teacher logs with bare `println!` and has no configuration type at
//! all — GPU adapter selection is governed purely by the `WGPU_ADAPTER_NAME`
//! environment variable read inline in `utils::get_adapter_with_capabilities_or_from_env`.
//! This crate keeps that environment-variable convention but gives it a
//! proper serializable type, and replaces the `println!`s with `tracing`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Mirrors spec.md §6's `LogLevel` enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            // tracing has no "critical" level; map it to the closest one down.
            LogLevel::Error | LogLevel::Critical => "error",
            LogLevel::Off => "off",
        }
    }
}

/// The configure-time settings spec.md §6 lists as owned by the (out-of-scope)
/// C API: `LogToStdout`, `LogLevel`, `LogFile`. `AutoTapePath` belongs to the
/// tape subsystem, which is out of scope for this crate entirely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub to_stdout: bool,
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { to_stdout: true, level: LogLevel::Info, file: None }
    }
}

#[cfg(feature = "logging")]
static SUBSCRIBER_INSTALLED: std::sync::Once = std::sync::Once::new();

/// Installs a `tracing_subscriber::fmt` layer filtered at `config.level`.
/// Installing twice is a no-op, logged at `warn` (SPEC_FULL.md §1.2). Only
/// compiled with the `logging` feature — the library itself only depends on
/// the `tracing` facade; a concrete subscriber is a binary/test concern
/// (SPEC_FULL.md §1.2), matching the teacher's habit of leaving subscriber
/// setup out of the library entirely.
#[cfg(feature = "logging")]
pub fn init_tracing(config: &LoggingConfig) {
    let mut already_installed = true;
    SUBSCRIBER_INSTALLED.call_once(|| {
        already_installed = false;
        let filter = config.level.as_filter();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(match config.level {
                LogLevel::Off => tracing::level_filters::LevelFilter::OFF,
                _ => tracing::level_filters::LevelFilter::from_level(
                    filter.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO),
                ),
            })
            .with_writer(std::io::stdout);
        if config.to_stdout {
            let _ = subscriber.try_init();
        }
    });
    if already_installed {
        tracing::warn!("init_tracing called after a subscriber was already installed; ignoring");
    }
}

/// Adapter/backend selection, generalizing the teacher's inline
/// `WGPU_ADAPTER_NAME` check in `get_adapter_with_capabilities_or_from_env`
/// into a type consulted by [`crate::device::GpuContext::new`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub adapter_name: Option<String>,
    #[serde(skip)]
    pub backend: Option<wgpu::Backends>,
}

impl DeviceConfig {
    /// Reads `WGPU_ADAPTER_NAME`/`WGPU_BACKEND` the way the teacher's helper
    /// reads `WGPU_ADAPTER_NAME` today, generalized to return `Option`s
    /// instead of panicking when absent.
    pub fn from_env() -> Self {
        let adapter_name = std::env::var("WGPU_ADAPTER_NAME").ok();
        let backend = std::env::var("WGPU_BACKEND").ok().map(|s| match s.to_lowercase().as_str() {
            "vulkan" => wgpu::Backends::VULKAN,
            "metal" => wgpu::Backends::METAL,
            "dx12" => wgpu::Backends::DX12,
            "gl" => wgpu::Backends::GL,
            _ => wgpu::Backends::all(),
        });
        Self { adapter_name, backend }
    }
}
