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

//! Device placement and per-graph device usage tracking.
//!
//! A [`DeviceInfo`] is created once per source graph, seeded with the primary
//! device. Placement decisions mark further devices as used; the partitioner
//! later produces exactly one function per device in
//! [`DeviceInfo::used_devices`].
//!
//! A graph may choose its own primary device with a standalone configuration
//! op, read by [`DeviceInfo::for_graph`]:
//!
//! ```text
//! ConfigureDevice device="tpu" infeed=true
//! ```

use crate::device::{parse_device_name, DeviceError, DeviceKind, Placement};
use crate::diagnostics::{Diagnostic, Span};
use crate::ir::{AttrValue, Attribute, Graph, Instr};
use crate::kernels::KernelSupport;

/// Op type of the in-graph device configuration op.
pub const DEVICE_CONFIG_OP: &str = "ConfigureDevice";

/// Set of concrete devices, iterated in enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSet {
    members: [bool; DeviceKind::COUNT],
    len: usize,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `kind` was not yet a member.
    pub fn insert(&mut self, kind: DeviceKind) -> bool {
        let slot = &mut self.members[kind.index()];
        if *slot {
            return false;
        }
        *slot = true;
        self.len += 1;
        true
    }

    pub fn contains(&self, kind: DeviceKind) -> bool {
        self.members[kind.index()]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Members in ascending enumeration order. Each call starts over.
    pub fn iter(&self) -> impl Iterator<Item = DeviceKind> + Clone + '_ {
        DeviceKind::ALL
            .into_iter()
            .filter(move |kind| self.members[kind.index()])
    }
}

impl FromIterator<DeviceKind> for DeviceSet {
    fn from_iter<I: IntoIterator<Item = DeviceKind>>(iter: I) -> Self {
        let mut set = DeviceSet::new();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// An explicit device string is not a catalog identifier.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Neither the primary, any used device, nor any fallback runs the op.
    #[error("no available device supports operation '{op_type}'")]
    Unsupported {
        op_type: String,
        tried: Vec<DeviceKind>,
    },
}

/// A malformed device configuration op.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceConfigError {
    #[error("second device configuration op at instruction {second} (first at {first})")]
    Duplicate { first: usize, second: usize },
    #[error("device configuration op at instruction {instr_index} must not use or define values")]
    NotStandalone { instr_index: usize },
    #[error("device configuration op at instruction {instr_index} is missing 'device'")]
    MissingDevice { instr_index: usize },
    #[error("device configuration op at instruction {instr_index}: {source}")]
    Device {
        instr_index: usize,
        #[source]
        source: DeviceError,
    },
    #[error("device configuration op at instruction {instr_index} has invalid attribute '{name}'")]
    InvalidAttr { instr_index: usize, name: String },
    #[error("infeed requires a TPU primary device, found {primary}")]
    InfeedWithoutTpu { primary: DeviceKind },
}

/// Device bookkeeping for one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    primary: DeviceKind,
    infeed_enabled: bool,
    used: DeviceSet,
    fallbacks: DeviceSet,
}

impl DeviceInfo {
    /// Tracker whose only used device is `primary`.
    pub fn new(primary: DeviceKind) -> Self {
        let mut used = DeviceSet::new();
        used.insert(primary);
        Self {
            primary,
            infeed_enabled: false,
            used,
            fallbacks: DeviceSet::new(),
        }
    }

    /// Tracker configured by the graph's [`DEVICE_CONFIG_OP`], or `None` when
    /// the graph has no such op. With `remove_config_op` the op is taken out
    /// of the graph once it has been read.
    pub fn for_graph(
        graph: &mut Graph,
        remove_config_op: bool,
    ) -> Result<Option<Self>, DeviceConfigError> {
        let mut config_ops = graph
            .instrs
            .iter()
            .enumerate()
            .filter_map(|(idx, instr)| match instr {
                Instr::Op(op) if op.op_type == DEVICE_CONFIG_OP => Some((idx, op)),
                _ => None,
            });
        let Some((instr_index, op)) = config_ops.next() else {
            return Ok(None);
        };
        if let Some((second, _)) = config_ops.next() {
            return Err(DeviceConfigError::Duplicate {
                first: instr_index,
                second,
            });
        }
        if !op.results.is_empty() || !op.operands.is_empty() {
            return Err(DeviceConfigError::NotStandalone { instr_index });
        }

        let mut primary = None;
        let mut infeed = false;
        for attr in &op.attrs {
            match (attr.name.as_str(), &attr.value) {
                ("device", AttrValue::Str(raw)) => {
                    let kind = parse_device_name(raw)
                        .map_err(|source| DeviceConfigError::Device { instr_index, source })?;
                    primary = Some(kind);
                }
                ("infeed", AttrValue::Bool(enabled)) => infeed = *enabled,
                (name, _) => {
                    return Err(DeviceConfigError::InvalidAttr {
                        instr_index,
                        name: name.to_string(),
                    })
                }
            }
        }
        let primary = primary.ok_or(DeviceConfigError::MissingDevice { instr_index })?;
        if infeed && primary != DeviceKind::Tpu {
            return Err(DeviceConfigError::InfeedWithoutTpu { primary });
        }

        if remove_config_op {
            graph.instrs.remove(instr_index);
        }
        log::info!(
            "graph '{}' configures primary device {} (infeed {})",
            graph.name,
            primary.short_name(),
            if infeed { "on" } else { "off" }
        );
        Ok(Some(Self::new(primary).with_infeed(infeed)))
    }

    /// Enable host-to-TPU infeed. Only honoured when the primary is the TPU.
    pub fn with_infeed(mut self, enabled: bool) -> Self {
        if enabled && self.primary != DeviceKind::Tpu {
            log::warn!(
                "infeed ignored: primary device is {}, not TPU",
                self.primary.short_name()
            );
        }
        self.infeed_enabled = enabled && self.primary == DeviceKind::Tpu;
        self
    }

    /// Declare devices that may be added when no used device runs an op.
    pub fn with_fallbacks(mut self, devices: impl IntoIterator<Item = DeviceKind>) -> Self {
        self.fallbacks = devices.into_iter().collect();
        self
    }

    pub fn primary(&self) -> DeviceKind {
        self.primary
    }

    pub fn fallbacks(&self) -> &DeviceSet {
        &self.fallbacks
    }

    pub fn is_infeed_enabled(&self) -> bool {
        self.infeed_enabled
    }

    pub fn is_used(&self, kind: DeviceKind) -> bool {
        self.used.contains(kind)
    }

    pub fn num_used(&self) -> usize {
        self.used.len()
    }

    /// Record that `placement` is in use. No-op for the pseudo-device and for
    /// devices already recorded.
    pub fn mark_used(&mut self, placement: Placement) {
        if let Placement::Device(kind) = placement {
            if self.used.insert(kind) {
                log::debug!("device {} is now in use", kind.short_name());
            }
        }
    }

    /// Used devices in ascending enumeration order. Reflects the marks made
    /// before the call; each call starts over.
    pub fn used_devices(&self) -> impl Iterator<Item = DeviceKind> + Clone + '_ {
        self.used.iter()
    }

    /// Candidate order: primary, the other used devices, then fallbacks that
    /// are not used yet.
    fn candidates(&self) -> Vec<DeviceKind> {
        let mut order = vec![self.primary];
        order.extend(self.used.iter().filter(|&kind| kind != self.primary));
        order.extend(self.fallbacks.iter().filter(|&kind| !self.used.contains(kind)));
        order
    }

    /// First candidate device that runs `op_type`.
    pub fn choose_device(&self, op_type: &str, kernels: &dyn KernelSupport) -> Option<DeviceKind> {
        self.candidates()
            .into_iter()
            .find(|&kind| kernels.supports(op_type, kind))
    }

    /// Decide where an op runs, append the matching device attribute to
    /// `attributes`, and record the device as used.
    ///
    /// An explicit device is honoured as-is and may be
    /// [`ALL_DEVICES`](crate::device::ALL_DEVICES). Callers must invoke this
    /// at most once per op: a second call appends a second device attribute,
    /// which [`verify_source_graph`](crate::ir::verify_source_graph) rejects.
    pub fn place_operation(
        &mut self,
        op_type: &str,
        explicit_device: Option<&str>,
        kernels: &dyn KernelSupport,
        attributes: &mut Vec<Attribute>,
    ) -> Result<Placement, PlacementError> {
        let placement = match explicit_device.filter(|raw| !raw.is_empty()) {
            Some(raw) => Placement::from_identifier(raw)?,
            None => self
                .choose_device(op_type, kernels)
                .map(Placement::Device)
                .ok_or_else(|| PlacementError::Unsupported {
                    op_type: op_type.to_string(),
                    tried: self.candidates(),
                })?,
        };

        log::debug!("placing {op_type} on {}", placement.short_name());
        attributes.push(Attribute::device(placement));
        self.mark_used(placement);
        Ok(placement)
    }
}

/// Place every op of `graph` that has no device attribute yet.
///
/// Ops that already carry one are resolved and marked used first, so the
/// heuristic sees the complete set of explicitly requested devices. Every
/// failure is collected; any failure is fatal for the pass.
pub fn place_graph(
    graph: &mut Graph,
    info: &mut DeviceInfo,
    kernels: &dyn KernelSupport,
) -> Result<(), Vec<Diagnostic>> {
    let mut diags = Vec::new();

    for op in graph.ops() {
        match op.placement() {
            Ok(Some(placement)) => info.mark_used(placement),
            Ok(None) => {}
            Err(err) => diags.push(
                Diagnostic::error("placement", "E2001", err.to_string())
                    .with_span(op_span(op.line, &op.op_type))
                    .with_help("use one of /device:CPU:0, /device:GPU:0, TPU_SYSTEM, ALL_DEVICES"),
            ),
        }
    }

    for op in graph.ops_mut() {
        if op.device_attr_count() > 0 {
            continue;
        }
        if let Err(err) = info.place_operation(&op.op_type, None, kernels, &mut op.attrs) {
            let mut diag = Diagnostic::error("placement", "E2002", err.to_string())
                .with_span(op_span(op.line, &op.op_type));
            if let PlacementError::Unsupported { tried, .. } = &err {
                let tried: Vec<&str> = tried.iter().map(|kind| kind.short_name()).collect();
                diag = diag
                    .with_note(format!("devices considered: {}", tried.join(", ")))
                    .with_help(
                        "place the op explicitly or allow a fallback device that has the kernel",
                    );
            }
            diags.push(diag);
        }
    }

    if diags.is_empty() {
        log::info!(
            "placed graph '{}' on {} device(s)",
            graph.name,
            info.num_used()
        );
        Ok(())
    } else {
        Err(diags)
    }
}

fn op_span(line: Option<usize>, op_type: &str) -> Option<Span> {
    line.map(|line| Span::line(line, op_type.len()))
}
