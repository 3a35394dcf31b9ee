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

//! Device placement and partitioning for dataflow graphs.
//!
//! Every operation of a graph is assigned to a device (CPU, GPU, TPU, or
//! replicated on all used devices), and the graph is then split into one
//! function per used device, with matched send/receive pairs wherever a value
//! crosses a device boundary.

pub mod config;
pub mod device;
pub mod diagnostics;
pub mod ir;
pub mod kernels;
pub mod partition;
pub mod pipeline;
pub mod placement;
pub mod types;

pub use config::{load_config, PartitionConfig};
pub use device::{parse_device_name, DeviceError, DeviceKind, Placement, ALL_DEVICES};
pub use ir::{Graph, GraphOp, Instr, TransferId, ValueId};
pub use kernels::{KernelRegistry, KernelSupport};
pub use partition::{
    partition_graph, DeviceFunction, DevicePartitioner, Partition, PartitionError,
    TransferIdCounter, TransferRecord,
};
pub use pipeline::{partition_source, PartitionOptions, PartitionProducts, PipelineError};
pub use placement::{
    place_graph, DeviceConfigError, DeviceInfo, DeviceSet, PlacementError, DEVICE_CONFIG_OP,
};
