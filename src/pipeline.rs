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

//! High-level pipeline: parse, verify, place, partition, and verify the
//! resulting per-device functions.

use crate::config::PartitionConfig;
use crate::device::{DeviceError, DeviceKind};
use crate::diagnostics::{Diagnostic, Span};
use crate::ir::{self, Graph, ParseError, VerifyError};
use crate::kernels::KernelRegistry;
use crate::partition::{partition_graph, Partition, PartitionError, TransferIdCounter};
use crate::placement::{place_graph, DeviceConfigError, DeviceInfo};

/// Options controlling one pipeline run.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub primary: DeviceKind,
    /// Host-to-TPU infeed; only honoured with a TPU primary.
    pub infeed_enabled: bool,
    /// Devices placement may add when no used device runs an op.
    pub fallbacks: Vec<DeviceKind>,
    pub kernels: KernelRegistry,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            primary: DeviceKind::Cpu,
            infeed_enabled: false,
            fallbacks: Vec::new(),
            kernels: KernelRegistry::default(),
        }
    }
}

impl PartitionOptions {
    pub fn from_config(config: &PartitionConfig) -> Result<Self, DeviceError> {
        Ok(Self {
            primary: config.primary()?,
            infeed_enabled: config.infeed_enabled,
            fallbacks: config.fallbacks()?,
            kernels: config.kernel_registry(),
        })
    }

    /// Tracker for `graph`: its device configuration op wins over the
    /// configured primary and infeed flag. The op is removed from the graph.
    fn device_info(&self, graph: &mut Graph) -> Result<DeviceInfo, DeviceConfigError> {
        let info = match DeviceInfo::for_graph(graph, true)? {
            Some(info) => info,
            None => DeviceInfo::new(self.primary).with_infeed(self.infeed_enabled),
        };
        Ok(info.with_fallbacks(self.fallbacks.iter().copied()))
    }
}

/// Artifacts produced by [`partition_source`].
#[derive(Debug, Clone)]
pub struct PartitionProducts {
    /// Source graph with a device attribute on every op.
    pub placed: Graph,
    /// Device usage after placement.
    pub devices: DeviceInfo,
    pub partition: Partition,
}

/// Errors surfaced by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The graph's device configuration op is malformed.
    #[error("invalid device configuration: {0}")]
    DeviceConfig(#[from] DeviceConfigError),
    /// The input graph is malformed.
    #[error("graph verification failed: {0}")]
    Verify(#[from] VerifyError),
    /// One or more ops could not be placed.
    #[error("placement failed")]
    Placement(Vec<Diagnostic>),
    #[error("partitioning failed: {0}")]
    Partition(#[from] PartitionError),
    /// The partitioner produced inconsistent functions.
    #[error("partition verification failed: {0}")]
    InvalidPartition(VerifyError),
}

impl PipelineError {
    /// Convert into diagnostics, attaching `file` to any spans.
    pub fn into_diagnostics(self, file: Option<&str>) -> Vec<Diagnostic> {
        let diags = match self {
            PipelineError::Parse(err) => {
                let span = (err.line > 0).then(|| Span::line(err.line, 1));
                vec![Diagnostic::error("parse", "E1001", err.message).with_span(span)]
            }
            PipelineError::DeviceConfig(err) => {
                vec![Diagnostic::error("placement", "E2003", err.to_string())]
            }
            PipelineError::Verify(err) => {
                vec![Diagnostic::error("verify", "E1101", err.to_string())]
            }
            PipelineError::Placement(diags) => diags,
            PipelineError::Partition(err) => vec![Diagnostic::error(
                "partition",
                "E3001",
                err.to_string(),
            )],
            PipelineError::InvalidPartition(err) => vec![Diagnostic::error(
                "partition",
                "E1101",
                err.to_string(),
            )
            .with_note("this is an internal error in the partitioner")],
        };
        diags.into_iter().map(|d| d.in_file(file)).collect()
    }
}

/// Parse and verify a `dfg@1` source without placing it.
pub fn check_source(source: &str) -> Result<Graph, PipelineError> {
    let graph = ir::parse_graph(source)?;
    ir::verify_source_graph(&graph)?;
    Ok(graph)
}

/// Place and partition an already-parsed graph.
pub fn place_and_partition(
    mut graph: Graph,
    opts: &PartitionOptions,
    transfer_ids: &mut TransferIdCounter,
) -> Result<PartitionProducts, PipelineError> {
    ir::verify_source_graph(&graph)?;

    let mut devices = opts.device_info(&mut graph)?;
    place_graph(&mut graph, &mut devices, &opts.kernels).map_err(PipelineError::Placement)?;
    ir::verify_source_graph(&graph)?;

    let partition = partition_graph(&graph, &devices, transfer_ids)?;
    for function in &partition.functions {
        ir::verify_device_function(function).map_err(PipelineError::InvalidPartition)?;
    }
    ir::verify_transfers(&partition.functions).map_err(PipelineError::InvalidPartition)?;

    Ok(PartitionProducts {
        placed: graph,
        devices,
        partition,
    })
}

/// Pipeline entry point: parse `source`, then place and partition it.
pub fn partition_source(
    source: &str,
    opts: &PartitionOptions,
    transfer_ids: &mut TransferIdCounter,
) -> Result<PartitionProducts, PipelineError> {
    let graph = ir::parse_graph(source)?;
    place_and_partition(graph, opts, transfer_ids)
}
