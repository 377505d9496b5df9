//! Device Hints
//!
//! Where a model should run. A hint is either a single device for the whole
//! model, or a map from submodule name (e.g. `encoder_model`) to device for
//! models made of several graphs.
//!
//! Hints are forwarded to the [`ModelRuntime`](crate::runtime::ModelRuntime)
//! untouched; the coordinator never interprets them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution device understood by model runtimes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Device {
    /// Let the runtime pick
    Auto,
    /// Any available GPU backend
    Gpu,
    /// Plain CPU execution
    Cpu,
    /// WebAssembly execution
    Wasm,
    /// WebGPU
    Webgpu,
    /// NVIDIA CUDA
    Cuda,
    /// DirectML
    Dml,
    /// WebNN, default device
    Webnn,
    /// WebNN on a neural processing unit
    WebnnNpu,
    /// WebNN on the GPU
    WebnnGpu,
    /// WebNN on the CPU
    WebnnCpu,
}

impl Device {
    /// All known devices
    pub const ALL: [Device; 11] = [
        Device::Auto,
        Device::Gpu,
        Device::Cpu,
        Device::Wasm,
        Device::Webgpu,
        Device::Cuda,
        Device::Dml,
        Device::Webnn,
        Device::WebnnNpu,
        Device::WebnnGpu,
        Device::WebnnCpu,
    ];

    /// Wire name of the device
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Gpu => "gpu",
            Device::Cpu => "cpu",
            Device::Wasm => "wasm",
            Device::Webgpu => "webgpu",
            Device::Cuda => "cuda",
            Device::Dml => "dml",
            Device::Webnn => "webnn",
            Device::WebnnNpu => "webnn-npu",
            Device::WebnnGpu => "webnn-gpu",
            Device::WebnnCpu => "webnn-cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a device or device hint cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown device: {0}")]
pub struct UnknownDevice(pub String);

impl FromStr for Device {
    type Err = UnknownDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Device::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == needle)
            .ok_or_else(|| UnknownDevice(s.to_string()))
    }
}

/// Device placement for a model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceHint {
    /// One device for every submodule
    Single(Device),
    /// Device per named submodule
    PerModule(BTreeMap<String, Device>),
}

impl DeviceHint {
    /// Device for a submodule, if the hint names one
    ///
    /// A single-device hint applies to every submodule.
    #[must_use]
    pub fn for_module(&self, module: &str) -> Option<Device> {
        match self {
            DeviceHint::Single(device) => Some(*device),
            DeviceHint::PerModule(map) => map.get(module).copied(),
        }
    }
}

impl From<Device> for DeviceHint {
    fn from(device: Device) -> Self {
        DeviceHint::Single(device)
    }
}

impl FromStr for DeviceHint {
    type Err = UnknownDevice;

    /// Parse `gpu` or `encoder=gpu,decoder=cpu`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains('=') {
            return s.parse().map(DeviceHint::Single);
        }

        let mut map = BTreeMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (module, device) = pair
                .split_once('=')
                .ok_or_else(|| UnknownDevice(pair.to_string()))?;
            map.insert(module.trim().to_string(), device.parse()?);
        }
        Ok(DeviceHint::PerModule(map))
    }
}
