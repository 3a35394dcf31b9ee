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

use std::collections::{BTreeMap, BTreeSet};

use crate::device::DeviceKind;
use crate::ir::{instruction_defs, instruction_operands, Graph, Instr, TransferId, ValueId};
use crate::partition::DeviceFunction;

/// Structured errors returned by the graph verifiers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    /// Multiple instructions attempted to define the same SSA value.
    #[error("duplicate definition for value {0}")]
    DuplicateDefinition(ValueId),
    /// A value was referenced before it had been defined.
    #[error("use of undefined value {value} at instruction {instr_index}")]
    UseBeforeDefinition { value: ValueId, instr_index: usize },
    /// A value id too large for `next_id` to cover.
    #[error("value {0} is out of range")]
    ValueIdOutOfRange(ValueId),
    /// The graph's `next_id` counter does not cover the SSA IDs in use.
    #[error("next_id {found} is smaller than required {expected}")]
    NextIdOutOfSync { found: usize, expected: usize },
    /// Source graphs must not contain send/receive instructions.
    #[error("transfer instruction {instr_index} found in source graph")]
    TransferInSourceGraph { instr_index: usize },
    /// An op carries more than one placement annotation.
    #[error("instruction {instr_index} has {count} device attributes")]
    DuplicateDeviceAttr { instr_index: usize, count: usize },
    /// A copied op in a per-device function still carries a placement.
    #[error("instruction {instr_index} of '{function}' still carries a device attribute")]
    DeviceAttrInSubgraph { function: String, instr_index: usize },
    /// A transfer goes from a device to itself.
    #[error(
        "transfer {transfer} at instruction {instr_index} of '{function}' targets its own device"
    )]
    SelfTransfer {
        function: String,
        instr_index: usize,
        transfer: TransferId,
    },
    /// Two sends share one transfer id.
    #[error("transfer {0} has more than one send")]
    DuplicateSend(TransferId),
    /// A send has no receive.
    #[error("transfer {0} is sent but never received")]
    UnmatchedSend(TransferId),
    /// A receive has no send.
    #[error("transfer {0} is received but never sent")]
    UnmatchedRecv(TransferId),
    /// Send and receive disagree on their endpoints.
    #[error(
        "transfer {transfer} endpoints disagree: \
         send {send_from}->{send_to}, recv {recv_from}->{recv_on}"
    )]
    EndpointMismatch {
        transfer: TransferId,
        send_from: DeviceKind,
        send_to: DeviceKind,
        recv_from: DeviceKind,
        recv_on: DeviceKind,
    },
}

/// Verify SSA discipline: unique definitions, no use-before-def, and a
/// `next_id` counter that covers every defined value.
pub fn verify_graph(graph: &Graph) -> Result<(), VerifyError> {
    let mut defined: BTreeSet<ValueId> = BTreeSet::new();
    let mut max_seen = 0usize;

    for (idx, instr) in graph.instrs.iter().enumerate() {
        for &value in instruction_operands(instr) {
            if !defined.contains(&value) {
                return Err(VerifyError::UseBeforeDefinition {
                    value,
                    instr_index: idx,
                });
            }
        }
        for &dst in instruction_defs(instr) {
            if !defined.insert(dst) {
                return Err(VerifyError::DuplicateDefinition(dst));
            }
            let next = dst
                .0
                .checked_add(1)
                .ok_or(VerifyError::ValueIdOutOfRange(dst))?;
            max_seen = max_seen.max(next);
        }
    }

    if graph.next_id < max_seen {
        return Err(VerifyError::NextIdOutOfSync {
            found: graph.next_id,
            expected: max_seen,
        });
    }

    Ok(())
}

/// Verify a graph handed to placement/partitioning: SSA-valid, free of
/// transfers, and at most one placement annotation per op.
pub fn verify_source_graph(graph: &Graph) -> Result<(), VerifyError> {
    verify_graph(graph)?;
    for (idx, instr) in graph.instrs.iter().enumerate() {
        match instr {
            Instr::Send { .. } | Instr::Recv { .. } => {
                return Err(VerifyError::TransferInSourceGraph { instr_index: idx });
            }
            Instr::Op(op) => {
                let count = op.device_attr_count();
                if count > 1 {
                    return Err(VerifyError::DuplicateDeviceAttr {
                        instr_index: idx,
                        count,
                    });
                }
            }
            Instr::Output(_) => {}
        }
    }
    Ok(())
}

/// Verify one extracted per-device function in isolation.
pub fn verify_device_function(function: &DeviceFunction) -> Result<(), VerifyError> {
    verify_graph(&function.graph)?;
    for (idx, instr) in function.graph.instrs.iter().enumerate() {
        match instr {
            Instr::Op(op) if op.device_attr_count() > 0 => {
                return Err(VerifyError::DeviceAttrInSubgraph {
                    function: function.graph.name.clone(),
                    instr_index: idx,
                });
            }
            Instr::Send { dest: peer, transfer, .. } | Instr::Recv { src: peer, transfer, .. }
                if *peer == function.device =>
            {
                return Err(VerifyError::SelfTransfer {
                    function: function.graph.name.clone(),
                    instr_index: idx,
                    transfer: *transfer,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Verify that the transfers of a partitioning session pair up: one send per
/// id, at least one receive per send, and agreeing endpoints.
pub fn verify_transfers(functions: &[DeviceFunction]) -> Result<(), VerifyError> {
    // id -> (sending device, destination)
    let mut sends: BTreeMap<TransferId, (DeviceKind, DeviceKind)> = BTreeMap::new();
    // id -> [(receiving device, claimed source)]
    let mut recvs: BTreeMap<TransferId, Vec<(DeviceKind, DeviceKind)>> = BTreeMap::new();

    for function in functions {
        for instr in &function.graph.instrs {
            match instr {
                Instr::Send { transfer, dest, .. } => {
                    if sends.insert(*transfer, (function.device, *dest)).is_some() {
                        return Err(VerifyError::DuplicateSend(*transfer));
                    }
                }
                Instr::Recv { transfer, src, .. } => {
                    recvs
                        .entry(*transfer)
                        .or_default()
                        .push((function.device, *src));
                }
                _ => {}
            }
        }
    }

    for (transfer, (send_from, send_to)) in &sends {
        let receivers = recvs
            .get(transfer)
            .ok_or(VerifyError::UnmatchedSend(*transfer))?;
        for &(recv_on, recv_from) in receivers {
            if recv_on != *send_to || recv_from != *send_from {
                return Err(VerifyError::EndpointMismatch {
                    transfer: *transfer,
                    send_from: *send_from,
                    send_to: *send_to,
                    recv_from,
                    recv_on,
                });
            }
        }
    }

    if let Some(orphan) = recvs.keys().find(|id| !sends.contains_key(id)) {
        return Err(VerifyError::UnmatchedRecv(*orphan));
    }

    Ok(())
}
