// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Kernel availability: which operation types can run on which device.
//!
//! Placement only asks one question, [`KernelSupport::supports`]. The
//! [`KernelRegistry`] answers it from a per-device table of include/exclude
//! patterns; any closure `Fn(&str, DeviceKind) -> bool` works as well.

use std::fmt;

use crate::device::DeviceKind;

/// Capability oracle consulted by the placement heuristic.
pub trait KernelSupport {
    /// Whether a kernel for `op_type` exists on `device`.
    fn supports(&self, op_type: &str, device: DeviceKind) -> bool;
}

impl<F> KernelSupport for F
where
    F: Fn(&str, DeviceKind) -> bool,
{
    fn supports(&self, op_type: &str, device: DeviceKind) -> bool {
        self(op_type, device)
    }
}

/// Operation types whose kernels only exist on the host.
pub const HOST_ONLY_KERNELS: &[&str] = &[
    "*Dataset",
    "Iterator*",
    "PrintV2",
    "StringFormat",
    "ReadFile",
];

/// Operation type matcher: `*`, `Prefix*`, `*Suffix`, or an exact name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpPattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
}

impl OpPattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            OpPattern::Any
        } else if let Some(prefix) = raw.strip_suffix('*') {
            OpPattern::Prefix(prefix.to_string())
        } else if let Some(suffix) = raw.strip_prefix('*') {
            OpPattern::Suffix(suffix.to_string())
        } else {
            OpPattern::Exact(raw.to_string())
        }
    }

    pub fn matches(&self, op_type: &str) -> bool {
        match self {
            OpPattern::Any => true,
            OpPattern::Exact(name) => op_type == name,
            OpPattern::Prefix(prefix) => op_type.starts_with(prefix.as_str()),
            OpPattern::Suffix(suffix) => op_type.ends_with(suffix.as_str()),
        }
    }
}

impl fmt::Display for OpPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpPattern::Any => f.write_str("*"),
            OpPattern::Exact(name) => f.write_str(name),
            OpPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            OpPattern::Suffix(suffix) => write!(f, "*{suffix}"),
        }
    }
}

/// Kernel table for one device: an op is supported when it matches some
/// include pattern and no exclude pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceKernels {
    pub supports: Vec<OpPattern>,
    pub excludes: Vec<OpPattern>,
}

impl DeviceKernels {
    pub fn from_patterns<S: AsRef<str>>(supports: &[S], excludes: &[S]) -> Self {
        Self {
            supports: supports.iter().map(|p| OpPattern::parse(p.as_ref())).collect(),
            excludes: excludes.iter().map(|p| OpPattern::parse(p.as_ref())).collect(),
        }
    }

    pub fn allows(&self, op_type: &str) -> bool {
        self.supports.iter().any(|p| p.matches(op_type))
            && !self.excludes.iter().any(|p| p.matches(op_type))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRegistry {
    devices: [DeviceKernels; DeviceKind::COUNT],
}

impl KernelRegistry {
    /// A registry in which no device supports anything.
    pub fn empty() -> Self {
        Self {
            devices: Default::default(),
        }
    }

    pub fn set(&mut self, device: DeviceKind, kernels: DeviceKernels) {
        self.devices[device.index()] = kernels;
    }

    pub fn with_device(mut self, device: DeviceKind, kernels: DeviceKernels) -> Self {
        self.set(device, kernels);
        self
    }

    pub fn kernels(&self, device: DeviceKind) -> &DeviceKernels {
        &self.devices[device.index()]
    }
}

impl Default for KernelRegistry {
    /// The host runs everything; accelerators run everything except
    /// [`HOST_ONLY_KERNELS`].
    fn default() -> Self {
        let accelerator = DeviceKernels::from_patterns(&["*"], HOST_ONLY_KERNELS);
        Self::empty()
            .with_device(DeviceKind::Cpu, DeviceKernels::from_patterns::<&str>(&["*"], &[]))
            .with_device(DeviceKind::Gpu, accelerator.clone())
            .with_device(DeviceKind::Tpu, accelerator)
    }
}

impl KernelSupport for KernelRegistry {
    fn supports(&self, op_type: &str, device: DeviceKind) -> bool {
        self.kernels(device).allows(op_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_parse_and_match() {
        assert_eq!(OpPattern::parse("*"), OpPattern::Any);
        assert!(OpPattern::parse("Iterator*").matches("IteratorGetNext"));
        assert!(OpPattern::parse("*Dataset").matches("TensorSliceDataset"));
        assert!(!OpPattern::parse("*Dataset").matches("DatasetToGraph"));
        assert!(OpPattern::parse("MatMul").matches("MatMul"));
        assert!(!OpPattern::parse("MatMul").matches("BatchMatMul"));
        assert_eq!(OpPattern::parse("*Dataset").to_string(), "*Dataset");
    }

    #[test]
    fn default_registry_keeps_host_only_kernels_on_cpu() {
        let registry = KernelRegistry::default();
        assert!(registry.supports("MatMul", DeviceKind::Gpu));
        assert!(registry.supports("MatMul", DeviceKind::Tpu));
        assert!(registry.supports("TensorSliceDataset", DeviceKind::Cpu));
        assert!(!registry.supports("TensorSliceDataset", DeviceKind::Gpu));
        assert!(!registry.supports("PrintV2", DeviceKind::Tpu));
    }

    #[test]
    fn empty_registry_supports_nothing() {
        let registry = KernelRegistry::empty();
        for device in DeviceKind::ALL {
            assert!(!registry.supports("Add", device));
        }
    }

    #[test]
    fn closures_are_oracles() {
        let only_gpu = |_: &str, device: DeviceKind| device == DeviceKind::Gpu;
        assert!(only_gpu.supports("Add", DeviceKind::Gpu));
        assert!(!only_gpu.supports("Add", DeviceKind::Cpu));
    }
}
