//! Compute device selection.

use candle_core::Device;

use crate::error::{AlignError, Result};

/// Resolve a device string (`cpu`, `cuda`, `cuda:N`, `metal`).
///
/// Accelerators that were not compiled in produce [`AlignError::DeviceUnavailable`]
/// with the rebuild hint instead of a late backend failure.
pub fn resolve_device(device: &str) -> Result<Device> {
    match device {
        "cpu" => Ok(Device::Cpu),
        "cuda" => cuda_device(device, 0),
        s if s.starts_with("cuda:") => {
            let id: usize = s["cuda:".len()..].parse().map_err(|_| {
                AlignError::InvalidConfig(format!("Invalid CUDA device id in '{}'", s))
            })?;
            cuda_device(device, id)
        }
        "metal" => metal_device(device),
        other => Err(AlignError::InvalidConfig(format!(
            "Unknown device: {}. Use 'cpu', 'cuda', 'cuda:N' or 'metal'.",
            other
        ))),
    }
}

#[cfg(feature = "cuda")]
fn cuda_device(name: &str, id: usize) -> Result<Device> {
    Device::new_cuda(id).map_err(|e| AlignError::DeviceUnavailable {
        device: name.to_string(),
        hint: format!("failed to initialize CUDA device {}: {}", id, e),
    })
}

#[cfg(not(feature = "cuda"))]
fn cuda_device(name: &str, _id: usize) -> Result<Device> {
    Err(AlignError::DeviceUnavailable {
        device: name.to_string(),
        hint: "this build has no CUDA support; rebuild with `--features cuda`".to_string(),
    })
}

#[cfg(feature = "metal")]
fn metal_device(name: &str) -> Result<Device> {
    Device::new_metal(0).map_err(|e| AlignError::DeviceUnavailable {
        device: name.to_string(),
        hint: format!("failed to initialize Metal device: {}", e),
    })
}

#[cfg(not(feature = "metal"))]
fn metal_device(name: &str) -> Result<Device> {
    Err(AlignError::DeviceUnavailable {
        device: name.to_string(),
        hint: "this build has no Metal support; rebuild with `--features metal`".to_string(),
    })
}
