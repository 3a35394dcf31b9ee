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

//! Splits a placed graph into one function per used device.
//!
//! Say `a` is a constant placed on the CPU and `b = neg a` is placed on the
//! GPU. The CPU function holds `a` followed by a send of `a` to the GPU; the
//! GPU function starts with the matching receive and then computes `b` from
//! the received value. Both transfer instructions carry the same
//! [`TransferId`].
//!
//! Ops placed on [`Placement::AllDevices`] are copied into every function and
//! each copy is treated exactly as if it had been placed on that one device.
//! `output` instructions live on the primary device.
//!
//! Shape-array metadata on a transfer comes from the consuming op that caused
//! it. A transfer reused for a later consumer keeps the metadata it was
//! created with.

use std::collections::HashMap;

use crate::device::{DeviceError, DeviceKind, Placement};
use crate::ir::{Graph, Instr, ShapeArray, TransferId, ValueId};
use crate::placement::DeviceInfo;

/// Source of transfer ids for one compilation.
///
/// Pass the same counter to every partitioning run of a compilation so ids
/// are never reused across graphs. Runs are sequential; the counter is
/// borrowed mutably for the duration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIdCounter {
    next: u64,
}

impl TransferIdCounter {
    /// Counter whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    /// Id the next allocation will return.
    pub fn peek(&self) -> TransferId {
        TransferId(self.next)
    }

    pub fn allocate(&mut self) -> TransferId {
        let id = TransferId(self.next);
        self.next += 1;
        id
    }
}

impl Default for TransferIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// One extracted per-device function.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFunction {
    pub device: DeviceKind,
    pub graph: Graph,
}

impl DeviceFunction {
    pub fn name(&self) -> &str {
        &self.graph.name
    }

    /// Copied operations, excluding transfers and outputs.
    pub fn op_count(&self) -> usize {
        self.graph.ops().count()
    }

    pub fn transfer_count(&self) -> usize {
        self.graph.instrs.iter().filter(|i| i.is_transfer()).count()
    }
}

/// `<source>_<SHORT>`, e.g. `model_GPU`.
pub fn device_function_name(source: &str, device: DeviceKind) -> String {
    format!("{source}_{}", device.short_name())
}

/// Bookkeeping for one inserted send/receive pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: TransferId,
    /// Value in the source graph (and in the sending function).
    pub value: ValueId,
    pub from: DeviceKind,
    pub to: DeviceKind,
    /// Value defined by the receive in the destination function.
    pub received_as: ValueId,
}

/// Result of one partitioning run.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// One function per used device, in enumeration order.
    pub functions: Vec<DeviceFunction>,
    /// Transfers in allocation order.
    pub transfers: Vec<TransferRecord>,
}

impl Partition {
    pub fn function(&self, device: DeviceKind) -> Option<&DeviceFunction> {
        self.functions.iter().find(|f| f.device == device)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("operation '{op_type}' at instruction {instr_index} has no device placement")]
    MissingPlacement { instr_index: usize, op_type: String },
    #[error("instruction {instr_index}: {source}")]
    Device {
        instr_index: usize,
        #[source]
        source: DeviceError,
    },
    #[error("instruction {instr_index} is placed on {device}, which is not a used device")]
    UnusedDevice {
        instr_index: usize,
        device: DeviceKind,
    },
    #[error("instruction {instr_index} reads {value}, which no earlier instruction defines")]
    UndefinedOperand { instr_index: usize, value: ValueId },
    #[error("instruction {instr_index} is a transfer; source graphs must not contain transfers")]
    TransferInSource { instr_index: usize },
}

/// Partitions one placed source graph. The source graph is never modified.
pub struct DevicePartitioner<'a> {
    source: &'a Graph,
    info: &'a DeviceInfo,
}

struct Builder {
    functions: Vec<DeviceFunction>,
    slots: [Option<usize>; DeviceKind::COUNT],
    /// Producing device of each source value; `None` for replicated values.
    homes: HashMap<ValueId, Option<DeviceKind>>,
    /// (source value, device) -> value naming it inside that device's function.
    available: HashMap<(ValueId, DeviceKind), ValueId>,
    transfers: Vec<TransferRecord>,
}

impl<'a> DevicePartitioner<'a> {
    pub fn new(source: &'a Graph, info: &'a DeviceInfo) -> Self {
        Self { source, info }
    }

    /// Produce one function per used device, allocating transfer ids from
    /// `transfer_ids`. Either every function is produced or an error is
    /// returned and nothing is.
    pub fn partition(
        &self,
        transfer_ids: &mut TransferIdCounter,
    ) -> Result<Partition, PartitionError> {
        let mut builder = Builder::new(self.source, self.info);

        for (idx, instr) in self.source.instrs.iter().enumerate() {
            match instr {
                Instr::Op(op) => {
                    let placement = op
                        .placement()
                        .map_err(|source| PartitionError::Device {
                            instr_index: idx,
                            source,
                        })?
                        .ok_or_else(|| PartitionError::MissingPlacement {
                            instr_index: idx,
                            op_type: op.op_type.clone(),
                        })?;

                    let targets: Vec<DeviceKind> = match placement {
                        Placement::Device(kind) if self.info.is_used(kind) => vec![kind],
                        Placement::Device(kind) => {
                            return Err(PartitionError::UnusedDevice {
                                instr_index: idx,
                                device: kind,
                            })
                        }
                        Placement::AllDevices => self.info.used_devices().collect(),
                    };

                    let shapes = op.shape_array();
                    for device in targets {
                        let mut copy = op.without_device_attr();
                        for operand in copy.operands.iter_mut() {
                            *operand =
                                builder.materialize(*operand, device, shapes, idx, transfer_ids)?;
                        }
                        builder.push(device, Instr::Op(copy));
                        for &result in &op.results {
                            builder.available.insert((result, device), result);
                        }
                    }

                    let home = match placement {
                        Placement::Device(kind) => Some(kind),
                        Placement::AllDevices => None,
                    };
                    for &result in &op.results {
                        builder.homes.insert(result, home);
                    }
                }
                Instr::Output(value) => {
                    let primary = self.info.primary();
                    let local = builder.materialize(*value, primary, None, idx, transfer_ids)?;
                    builder.push(primary, Instr::Output(local));
                }
                Instr::Send { .. } | Instr::Recv { .. } => {
                    return Err(PartitionError::TransferInSource { instr_index: idx });
                }
            }
        }

        for function in &builder.functions {
            log::info!(
                "extracted '{}': {} instruction(s), {} transfer(s)",
                function.name(),
                function.graph.instrs.len(),
                function.transfer_count()
            );
        }

        Ok(Partition {
            functions: builder.functions,
            transfers: builder.transfers,
        })
    }
}

impl Builder {
    fn new(source: &Graph, info: &DeviceInfo) -> Self {
        let mut functions = Vec::with_capacity(info.num_used());
        let mut slots = [None; DeviceKind::COUNT];
        for device in info.used_devices() {
            slots[device.index()] = Some(functions.len());
            let mut graph = Graph::new(device_function_name(&source.name, device));
            graph.next_id = source.next_id;
            functions.push(DeviceFunction { device, graph });
        }
        Self {
            functions,
            slots,
            homes: HashMap::new(),
            available: HashMap::new(),
            transfers: Vec::new(),
        }
    }

    fn function_mut(&mut self, device: DeviceKind) -> &mut DeviceFunction {
        let slot = self.slots[device.index()]
            .unwrap_or_else(|| panic!("no function was created for used device {device}"));
        &mut self.functions[slot]
    }

    fn push(&mut self, device: DeviceKind, instr: Instr) {
        self.function_mut(device).graph.instrs.push(instr);
    }

    /// Name `value` inside `device`'s function, inserting a transfer from the
    /// producing device the first time the pair is seen. `shapes` is the
    /// consumer's shape array and is attached to a newly created transfer only.
    fn materialize(
        &mut self,
        value: ValueId,
        device: DeviceKind,
        shapes: Option<&ShapeArray>,
        instr_index: usize,
        transfer_ids: &mut TransferIdCounter,
    ) -> Result<ValueId, PartitionError> {
        if let Some(&local) = self.available.get(&(value, device)) {
            return Ok(local);
        }

        let home = match self.homes.get(&value) {
            Some(Some(home)) => *home,
            _ => return Err(PartitionError::UndefinedOperand { instr_index, value }),
        };
        let shapes = shapes.cloned();

        let transfer = transfer_ids.allocate();
        self.push(
            home,
            Instr::Send {
                value,
                transfer,
                dest: device,
                shapes: shapes.clone(),
            },
        );
        let dest = self.function_mut(device);
        let received_as = dest.graph.fresh();
        dest.graph.instrs.push(Instr::Recv {
            dst: received_as,
            transfer,
            src: home,
            shapes,
        });

        log::debug!(
            "transfer {transfer}: {value} {} -> {} as {received_as}",
            home.short_name(),
            device.short_name()
        );
        self.available.insert((value, device), received_as);
        self.transfers.push(TransferRecord {
            id: transfer,
            value,
            from: home,
            to: device,
            received_as,
        });
        Ok(received_as)
    }
}

/// Convenience wrapper around [`DevicePartitioner::partition`].
pub fn partition_graph(
    source: &Graph,
    info: &DeviceInfo,
    transfer_ids: &mut TransferIdCounter,
) -> Result<Partition, PartitionError> {
    DevicePartitioner::new(source, info).partition(transfer_ids)
}
