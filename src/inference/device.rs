use anyhow::{anyhow, Result};
use candle::{DType, Device};
use tracing::warn;

/// Resolve `MODEL_DEVICE` (`cpu`, `cuda`, `cuda:1`, `gpu:0`) into a candle device.
pub fn build_device(preference: &str) -> Result<Device> {
    let trimmed = preference.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty() || lower == "cpu" {
        Ok(Device::Cpu)
    } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
        let ordinal = trimmed
            .split(':')
            .nth(1)
            .and_then(|part| part.trim().parse::<usize>().ok())
            .unwrap_or(0);
        Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {} but initialization failed ({err}). Build with the \
                 `cuda` feature and ensure CUDA libraries are available.",
                ordinal
            )
        })
    } else {
        warn!(
            "unrecognized MODEL_DEVICE value '{}', defaulting to cpu",
            trimmed
        );
        Ok(Device::Cpu)
    }
}

/// Half precision on GPU, full precision on CPU.
pub fn weight_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}
