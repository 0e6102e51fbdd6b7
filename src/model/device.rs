//! Accelerator selection.

use std::fmt;
use std::str::FromStr;

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
    ExecutionProviderDispatch,
};

use crate::error::{Error, Result};

/// Device the ONNX sessions run on. Chosen once when the pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// General-purpose processor.
    Cpu,
    /// NVIDIA GPU with the given device ordinal.
    Cuda(i32),
    /// Apple Neural Engine / GPU through Core ML.
    CoreMl,
}

impl Device {
    /// Resolve a device identifier.
    ///
    /// Accepts `cpu`, `cuda`, `cuda:N`, `coreml`, or `best`, which picks the first
    /// available accelerator and falls back to the CPU.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] for unknown identifiers, or when an explicitly
    /// requested accelerator is not available in this build.
    pub fn resolve(identifier: &str) -> Result<Self> {
        if identifier.eq_ignore_ascii_case("best") {
            let device = Self::best_available();
            tracing::info!("Resolved device 'best' to {device}");
            return Ok(device);
        }

        let device: Self = identifier.parse()?;
        if device != Self::Cpu && !device.is_available() {
            return Err(Error::Device {
                device: device.to_string(),
                reason: "execution provider is not available in this build".to_string(),
            });
        }
        Ok(device)
    }

    /// First available accelerator, or the CPU.
    #[must_use]
    pub fn best_available() -> Self {
        [Self::Cuda(0), Self::CoreMl]
            .into_iter()
            .find(Self::is_available)
            .unwrap_or(Self::Cpu)
    }

    /// Whether ONNX Runtime can use this device.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let available = match self {
            Self::Cpu => return true,
            Self::Cuda(_) => CUDAExecutionProvider::default().is_available(),
            Self::CoreMl => CoreMLExecutionProvider::default().is_available(),
        };
        available.unwrap_or(false)
    }

    /// Execution providers to register on a session builder.
    ///
    /// Accelerators are registered with `error_on_failure` so a broken device
    /// surfaces as a load error instead of silently running on the CPU.
    #[must_use]
    pub fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Self::Cpu => vec![CPUExecutionProvider::default().build()],
            Self::Cuda(id) => vec![CUDAExecutionProvider::default()
                .with_device_id(*id)
                .build()
                .error_on_failure()],
            Self::CoreMl => vec![CoreMLExecutionProvider::default().build().error_on_failure()],
        }
    }

    /// Error for an execution provider that failed to register on a session.
    pub(crate) fn registration_error(&self, reason: impl fmt::Display) -> Error {
        Error::Device {
            device: self.to_string(),
            reason: format!("failed to register execution provider: {reason}"),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
            Self::CoreMl => f.write_str("coreml"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            "coreml" | "mps" => Ok(Self::CoreMl),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| Error::Device {
                    device: s.to_string(),
                    reason: "expected one of cpu, cuda, cuda:N, coreml, best".to_string(),
                }),
        }
    }
}
