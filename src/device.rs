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

//! Device catalog: the closed set of execution targets and their names.
//!
//! Concrete targets are [`DeviceKind`]s. The "replicate on every used device"
//! pseudo-target only exists as [`Placement::AllDevices`], so it can never be
//! stored where a concrete device is required (a used-device set, or the
//! device of an extracted per-device function).

use std::fmt;
use std::str::FromStr;

/// Identifier of the general-purpose host processor.
pub const DEFAULT_CPU_DEVICE: &str = "/device:CPU:0";
/// Identifier of the accelerator.
pub const DEFAULT_GPU_DEVICE: &str = "/device:GPU:0";
/// Identifier of the tensor processor.
pub const DEFAULT_TPU_DEVICE: &str = "TPU_SYSTEM";
/// Pseudo-device resolved into one replica per used device at partition time.
pub const ALL_DEVICES: &str = "ALL_DEVICES";

/// Concrete device an operation (and its results) can live on.
///
/// Variants are declared in enumeration order; `Ord` follows that order and
/// every ordered walk over devices in this crate relies on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    /// General-purpose processor.
    Cpu,
    /// Accelerator.
    Gpu,
    /// Specialized tensor processor.
    Tpu,
}

/// Placement decision for one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Run on exactly one concrete device.
    Device(DeviceKind),
    /// Replicate on every device currently in use.
    AllDevices,
}

/// Errors raised by catalog lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The string is not one of the canonical device identifiers.
    #[error("unknown device identifier '{0}'")]
    UnknownIdentifier(String),
    /// The string is not a known short device name.
    #[error("unknown device name '{0}' (expected cpu|gpu|tpu)")]
    UnknownShortName(String),
    /// A concrete device was required but the pseudo-device was supplied.
    #[error("'ALL_DEVICES' is not a concrete device")]
    NotConcrete,
}

impl DeviceKind {
    /// Every concrete kind, ascending.
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Tpu];

    /// Number of concrete kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Canonical identifier, compatible with device names in exported graphs.
    pub fn identifier(self) -> &'static str {
        match self {
            DeviceKind::Cpu => DEFAULT_CPU_DEVICE,
            DeviceKind::Gpu => DEFAULT_GPU_DEVICE,
            DeviceKind::Tpu => DEFAULT_TPU_DEVICE,
        }
    }

    /// Short tag used when naming generated per-device functions.
    pub fn short_name(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Tpu => "TPU",
        }
    }

    /// Resolve a short tag (`cpu`, `GPU`, ...). Case-insensitive.
    pub fn from_short_name(raw: &str) -> Result<Self, DeviceError> {
        match raw.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" => Ok(DeviceKind::Gpu),
            "tpu" => Ok(DeviceKind::Tpu),
            _ => Err(DeviceError::UnknownShortName(raw.to_string())),
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Placement {
    /// Resolve a canonical identifier. Only exact matches are accepted:
    /// anything else points at a corrupt or unsupported upstream annotation.
    pub fn from_identifier(identifier: &str) -> Result<Self, DeviceError> {
        match identifier {
            DEFAULT_CPU_DEVICE => Ok(Placement::Device(DeviceKind::Cpu)),
            DEFAULT_GPU_DEVICE => Ok(Placement::Device(DeviceKind::Gpu)),
            DEFAULT_TPU_DEVICE => Ok(Placement::Device(DeviceKind::Tpu)),
            ALL_DEVICES => Ok(Placement::AllDevices),
            other => Err(DeviceError::UnknownIdentifier(other.to_string())),
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            Placement::Device(kind) => kind.identifier(),
            Placement::AllDevices => ALL_DEVICES,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Placement::Device(kind) => kind.short_name(),
            Placement::AllDevices => "ALL",
        }
    }

    /// The concrete device, or [`DeviceError::NotConcrete`] for the pseudo-device.
    pub fn concrete(self) -> Result<DeviceKind, DeviceError> {
        match self {
            Placement::Device(kind) => Ok(kind),
            Placement::AllDevices => Err(DeviceError::NotConcrete),
        }
    }
}

impl From<DeviceKind> for Placement {
    fn from(kind: DeviceKind) -> Self {
        Placement::Device(kind)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for Placement {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Placement::from_identifier(s)
    }
}

impl FromStr for DeviceKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Placement::from_identifier(s)?.concrete()
    }
}

/// Resolve either a canonical identifier or a short tag. Used by front-ends
/// that accept user-typed device names.
pub fn parse_device_name(raw: &str) -> Result<DeviceKind, DeviceError> {
    match raw.parse::<DeviceKind>() {
        Ok(kind) => Ok(kind),
        Err(DeviceError::NotConcrete) => Err(DeviceError::NotConcrete),
        Err(_) => DeviceKind::from_short_name(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_order_is_ascending() {
        let mut sorted = DeviceKind::ALL;
        sorted.sort();
        assert_eq!(sorted, DeviceKind::ALL);
        assert_eq!(DeviceKind::Cpu.index(), 0);
        assert_eq!(DeviceKind::Tpu.index(), 2);
    }

    #[test]
    fn variants_of_identifiers_are_rejected() {
        for raw in ["CPU:0", "/device:cpu:0", "/device:CPU:0 ", "", "all_devices"] {
            assert!(matches!(
                Placement::from_identifier(raw),
                Err(DeviceError::UnknownIdentifier(_))
            ));
        }
    }

    #[test]
    fn device_kind_from_str_rejects_pseudo_device() {
        assert_eq!("ALL_DEVICES".parse::<DeviceKind>(), Err(DeviceError::NotConcrete));
        assert_eq!("TPU_SYSTEM".parse::<DeviceKind>(), Ok(DeviceKind::Tpu));
    }

    #[test]
    fn parse_device_name_accepts_both_spellings() {
        assert_eq!(parse_device_name("gpu"), Ok(DeviceKind::Gpu));
        assert_eq!(parse_device_name("/device:GPU:0"), Ok(DeviceKind::Gpu));
        assert_eq!(parse_device_name("ALL_DEVICES"), Err(DeviceError::NotConcrete));
        assert!(matches!(
            parse_device_name("npu"),
            Err(DeviceError::UnknownShortName(_))
        ));
    }
}
