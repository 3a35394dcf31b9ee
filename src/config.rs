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

//! Partitioning configuration, read from a TOML file:
//!
//! ```toml
//! primary_device = "tpu"
//! infeed_enabled = true
//! fallback_devices = ["cpu"]
//! first_transfer_id = 1
//!
//! [kernels.tpu]
//! supports = ["*"]
//! excludes = ["*Dataset", "Conv2D"]
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::device::{parse_device_name, DeviceError, DeviceKind};
use crate::kernels::{DeviceKernels, KernelRegistry};
use crate::partition::TransferIdCounter;
use crate::placement::DeviceInfo;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    /// Identifier or short name of the primary device.
    #[serde(default = "default_primary_device")]
    pub primary_device: String,
    /// Feed host values to a TPU primary through its infeed queue.
    #[serde(default)]
    pub infeed_enabled: bool,
    #[serde(default)]
    pub fallback_devices: Vec<String>,
    #[serde(default = "default_first_transfer_id")]
    pub first_transfer_id: u64,
    /// Per-device overrides of the default kernel table.
    #[serde(default)]
    pub kernels: KernelTables,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KernelTables {
    pub cpu: Option<KernelTable>,
    pub gpu: Option<KernelTable>,
    pub tpu: Option<KernelTable>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KernelTable {
    #[serde(default)]
    pub supports: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

fn default_primary_device() -> String {
    "cpu".to_string()
}

fn default_first_transfer_id() -> u64 {
    1
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            primary_device: default_primary_device(),
            infeed_enabled: false,
            fallback_devices: Vec::new(),
            first_transfer_id: default_first_transfer_id(),
            kernels: KernelTables::default(),
        }
    }
}

impl KernelTables {
    fn table(&self, device: DeviceKind) -> Option<&KernelTable> {
        match device {
            DeviceKind::Cpu => self.cpu.as_ref(),
            DeviceKind::Gpu => self.gpu.as_ref(),
            DeviceKind::Tpu => self.tpu.as_ref(),
        }
    }
}

impl PartitionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn primary(&self) -> Result<DeviceKind, DeviceError> {
        parse_device_name(&self.primary_device)
    }

    pub fn fallbacks(&self) -> Result<Vec<DeviceKind>, DeviceError> {
        self.fallback_devices
            .iter()
            .map(|raw| parse_device_name(raw))
            .collect()
    }

    /// Fresh usage tracker seeded with the configured primary and fallbacks.
    pub fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        Ok(DeviceInfo::new(self.primary()?)
            .with_infeed(self.infeed_enabled)
            .with_fallbacks(self.fallbacks()?))
    }

    /// The default registry with every configured device table swapped in.
    pub fn kernel_registry(&self) -> KernelRegistry {
        let mut registry = KernelRegistry::default();
        for device in DeviceKind::ALL {
            if let Some(table) = self.kernels.table(device) {
                registry.set(
                    device,
                    DeviceKernels::from_patterns(&table.supports, &table.excludes),
                );
            }
        }
        registry
    }

    pub fn transfer_ids(&self) -> TransferIdCounter {
        TransferIdCounter::starting_at(self.first_transfer_id)
    }
}

/// Read and validate a configuration file.
pub fn load_config(path: &Path) -> Result<PartitionConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = PartitionConfig::from_toml_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config
        .device_info()
        .with_context(|| format!("invalid device in {}", path.display()))?;
    log::debug!("loaded partition config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::TransferId;
    use crate::kernels::KernelSupport;

    #[test]
    fn empty_file_gives_defaults() {
        let config = PartitionConfig::from_toml_str("").expect("parse");
        assert_eq!(config, PartitionConfig::default());
        assert_eq!(config.primary(), Ok(DeviceKind::Cpu));
        assert_eq!(config.transfer_ids().peek(), TransferId(1));
    }

    #[test]
    fn kernel_tables_override_defaults_per_device() {
        let config = PartitionConfig::from_toml_str(
            r#"
primary_device = "/device:GPU:0"
fallback_devices = ["cpu"]

[kernels.gpu]
supports = ["MatMul", "Add"]
"#,
        )
        .expect("parse");
        let registry = config.kernel_registry();
        assert!(registry.supports("MatMul", DeviceKind::Gpu));
        assert!(!registry.supports("Conv2D", DeviceKind::Gpu));
        // Untouched tables keep their defaults.
        assert!(registry.supports("Conv2D", DeviceKind::Tpu));

        let info = config.device_info().expect("devices");
        assert_eq!(info.primary(), DeviceKind::Gpu);
        assert!(info.fallbacks().contains(DeviceKind::Cpu));
    }

    #[test]
    fn infeed_flag_reaches_the_tracker() {
        let text = "primary_device = \"tpu\"\ninfeed_enabled = true";
        let config = PartitionConfig::from_toml_str(text).expect("parse");
        assert!(config.infeed_enabled);
        assert!(config.device_info().expect("devices").is_infeed_enabled());

        let config = PartitionConfig::from_toml_str("infeed_enabled = true").expect("parse");
        assert!(!config.device_info().expect("devices").is_infeed_enabled());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PartitionConfig::from_toml_str("primary = \"cpu\"").is_err());
    }

    #[test]
    fn pseudo_device_cannot_be_primary() {
        let config =
            PartitionConfig::from_toml_str("primary_device = \"ALL_DEVICES\"").expect("parse");
        assert_eq!(config.primary(), Err(DeviceError::NotConcrete));
    }
}
