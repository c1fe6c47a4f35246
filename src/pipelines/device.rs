use super::PipelineError;
use candle_core::Device;

/// Which compute device to build pipelines on.
#[derive(Debug, Clone, Copy, Default)]
pub enum DeviceRequest {
    /// Accelerator index 0 when available, otherwise CPU.
    #[default]
    Default,
    /// Force CPU even when an accelerator is present.
    Cpu,
    /// A specific CUDA device by index.
    Cuda(usize),
}

impl DeviceRequest {
    pub fn resolve(&self) -> Result<Device, PipelineError> {
        match self {
            DeviceRequest::Default => Ok(Device::cuda_if_available(0).unwrap_or(Device::Cpu)),
            DeviceRequest::Cpu => Ok(Device::Cpu),
            DeviceRequest::Cuda(i) => Device::new_cuda(*i)
                .map_err(|e| PipelineError::Model(format!("cuda device {i}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_request_resolves_to_cpu() {
        let device = DeviceRequest::Cpu.resolve().unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn default_request_always_resolves() {
        // Falls back to CPU when no accelerator is present.
        DeviceRequest::Default.resolve().unwrap();
    }
}
