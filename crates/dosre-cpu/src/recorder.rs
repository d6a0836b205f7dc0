//! Ledger of statically addressed memory operands.
//!
//! While debug mode is on, every memory operand an instruction actually reads
//! or writes through ModRM is recorded with the segment register that was used
//! and the operand width. Offline tooling uses the ledger to propose named
//! accessors for the program's global variables.

use std::collections::{BTreeMap, BTreeSet};

use dosre_mem::physical;
use serde::Serialize;

use crate::registers::segment_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ValueOperation {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum OperandSize {
    Byte8,
    Word16,
    Dword32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AddressOperation {
    pub operation: ValueOperation,
    pub size: OperandSize,
    pub segment_register: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticAddress {
    pub segment: u16,
    pub offset: u16,
    pub physical: u32,
    pub name: Option<String>,
    pub operations: BTreeSet<AddressOperation>,
}

#[derive(Debug, Clone, Copy)]
struct StagedAddress {
    segment_index: usize,
    segment: u16,
    offset: u16,
}

#[derive(Debug, Default)]
pub struct StaticAddressesRecorder {
    enabled: bool,
    staged_address: Option<StagedAddress>,
    staged_operations: Vec<(ValueOperation, OperandSize)>,
    addresses: BTreeMap<u32, StaticAddress>,
    names: BTreeMap<u32, String>,
}

impl StaticAddressesRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.reset();
    }

    /// Drops anything staged by the previous instruction.
    #[inline]
    pub fn reset(&mut self) {
        self.staged_address = None;
        self.staged_operations.clear();
    }

    #[inline]
    pub fn set_current_value(&mut self, segment_index: usize, segment: u16, offset: u16) {
        if self.enabled {
            self.staged_address = Some(StagedAddress {
                segment_index,
                segment,
                offset,
            });
        }
    }

    #[inline]
    pub fn set_current_operation(&mut self, operation: ValueOperation, size: OperandSize) {
        if self.enabled {
            self.staged_operations.push((operation, size));
        }
    }

    /// Stores the staged address if the instruction read or wrote it.
    pub fn commit(&mut self) {
        if !self.enabled {
            return;
        }
        let Some(staged) = self.staged_address.take() else {
            self.staged_operations.clear();
            return;
        };
        if self.staged_operations.is_empty() {
            return;
        }

        let address = physical(staged.segment, staged.offset);
        let names = &self.names;
        let entry = self
            .addresses
            .entry(address)
            .or_insert_with(|| StaticAddress {
                segment: staged.segment,
                offset: staged.offset,
                physical: address,
                name: names.get(&address).cloned(),
                operations: BTreeSet::new(),
            });
        for (operation, size) in self.staged_operations.drain(..) {
            entry.operations.insert(AddressOperation {
                operation,
                size,
                segment_register: segment_name(staged.segment_index),
            });
        }
    }

    /// Attaches a name to a physical address, now or when it is first recorded.
    pub fn add_name(&mut self, physical_address: u32, name: impl Into<String>) {
        let name = name.into();
        if let Some(entry) = self.addresses.get_mut(&physical_address) {
            entry.name = Some(name.clone());
        }
        self.names.insert(physical_address, name);
    }

    pub fn addresses(&self) -> &BTreeMap<u32, StaticAddress> {
        &self.addresses
    }

    pub fn export_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.addresses.values().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::registers::{DS, ES};

    #[test]
    fn computed_but_unused_addresses_are_not_recorded() {
        let mut recorder = StaticAddressesRecorder::new(true);
        recorder.set_current_value(DS, 0x1000, 0x20);
        recorder.commit();
        assert!(recorder.addresses().is_empty());
    }

    #[test]
    fn disabled_recorder_ignores_everything() {
        let mut recorder = StaticAddressesRecorder::new(false);
        recorder.set_current_value(DS, 0x1000, 0x20);
        recorder.set_current_operation(ValueOperation::Read, OperandSize::Word16);
        recorder.commit();
        assert!(recorder.addresses().is_empty());
    }

    #[test]
    fn read_modify_write_records_both_operations() {
        let mut recorder = StaticAddressesRecorder::new(true);
        recorder.add_name(0x10020, "score");
        recorder.set_current_value(ES, 0x1000, 0x20);
        recorder.set_current_operation(ValueOperation::Read, OperandSize::Byte8);
        recorder.set_current_operation(ValueOperation::Write, OperandSize::Byte8);
        recorder.commit();

        let entry = &recorder.addresses()[&0x10020];
        assert_eq!(entry.name.as_deref(), Some("score"));
        assert_eq!(entry.operations.len(), 2);
        assert!(entry.operations.iter().all(|op| op.segment_register == "ES"));

        recorder.reset();
        recorder.commit();
        assert_eq!(recorder.addresses().len(), 1);
    }
}
