// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! ExpectedSubmoduleBlockReq and the ModuleDiffBlock response.

use log::debug;

use crate::codec::{get_bits, set_bits, ParseError};
use crate::{BlockReader, BlockWriter, WriteError};

/// Data direction of a submodule, as declared by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SubmoduleDir {
    /// No cyclic data.
    #[default]
    NoIo = 0,
    /// Input only.
    Input = 1,
    /// Output only.
    Output = 2,
    /// Input and output.
    Io = 3,
}

impl SubmoduleDir {
    /// From the 2-bit properties field.
    pub fn from_bits(value: u8) -> Self {
        match value & 0x3 {
            1 => Self::Input,
            2 => Self::Output,
            3 => Self::Io,
            _ => Self::NoIo,
        }
    }
}

/// Data direction of one data descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum DataDirection {
    /// Not a valid wire value.
    #[default]
    Invalid = 0,
    /// Input descriptor.
    Input = 1,
    /// Output descriptor.
    Output = 2,
}

impl DataDirection {
    /// From the wire value.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::Input,
            2 => Self::Output,
            _ => Self::Invalid,
        }
    }
}

/// The submodule properties word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmoduleProperties {
    /// Bits 0..2: the submodule direction.
    pub direction: SubmoduleDir,
    /// Bit 2.
    pub shared_input: bool,
    /// Bit 3: zero the input data length in the layout.
    pub reduce_input_submodule_data_length: bool,
    /// Bit 4: zero the output data length in the layout.
    pub reduce_output_submodule_data_length: bool,
    /// Bit 5: drop the IOCS contribution; legal only for IO submodules.
    pub discard_ioxs: bool,
}

impl SubmoduleProperties {
    /// Unpack from the 16-bit word.
    pub fn from_word(word: u16) -> Self {
        let word = word as u32;
        Self {
            direction: SubmoduleDir::from_bits(get_bits(word, 0, 2) as u8),
            shared_input: get_bits(word, 2, 1) != 0,
            reduce_input_submodule_data_length: get_bits(word, 3, 1) != 0,
            reduce_output_submodule_data_length: get_bits(word, 4, 1) != 0,
            discard_ioxs: get_bits(word, 5, 1) != 0,
        }
    }

    /// Pack into the 16-bit word.
    pub fn to_word(&self) -> u16 {
        let mut w = 0;
        w = set_bits(w, self.direction as u32, 0, 2);
        w = set_bits(w, self.shared_input as u32, 2, 1);
        w = set_bits(w, self.reduce_input_submodule_data_length as u32, 3, 1);
        w = set_bits(w, self.reduce_output_submodule_data_length as u32, 4, 1);
        w = set_bits(w, self.discard_ioxs as u32, 5, 1);
        w as u16
    }
}

/// One submodule data descriptor: direction, data length and the IOxS
/// lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDescriptor {
    /// Descriptor direction.
    pub data_direction: DataDirection,
    /// Cyclic data length in bytes.
    pub submodule_data_length: u16,
    /// IOCS length; expected to be 1.
    pub length_iocs: u8,
    /// IOPS length; expected to be 1.
    pub length_iops: u8,
}

impl DataDescriptor {
    fn decode(r: &mut BlockReader) -> Self {
        Self {
            data_direction: DataDirection::from_u16(r.get_u16()),
            submodule_data_length: r.get_u16(),
            length_iocs: r.get_u8(),
            length_iops: r.get_u8(),
        }
    }

    fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.data_direction as u16)?;
        w.put_u16(self.submodule_data_length)?;
        w.put_u8(self.length_iocs)?;
        w.put_u8(self.length_iops)
    }
}

/// One expected submodule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpSubmodule {
    /// Subslot number.
    pub subslot_number: u16,
    /// Submodule ident number.
    pub ident_number: u32,
    /// Properties.
    pub properties: SubmoduleProperties,
    /// One descriptor, or two for IO submodules.
    pub data_descriptors: Vec<DataDescriptor>,
}

impl ExpSubmodule {
    fn decode(r: &mut BlockReader) -> Self {
        let subslot_number = r.get_u16();
        let ident_number = r.get_u32();
        let properties = SubmoduleProperties::from_word(r.get_u16());
        // At least one descriptor; IO submodules carry a second one.
        let mut data_descriptors = vec![DataDescriptor::decode(r)];
        if properties.direction == SubmoduleDir::Io {
            data_descriptors.push(DataDescriptor::decode(r));
        }
        debug!(
            "expected submodule 0x{:08x} in subslot 0x{:04x}, direction {:?}",
            ident_number, subslot_number, properties.direction
        );
        Self {
            subslot_number,
            ident_number,
            properties,
            data_descriptors,
        }
    }

    fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.subslot_number)?;
        w.put_u32(self.ident_number)?;
        w.put_u16(self.properties.to_word())?;
        for desc in &self.data_descriptors {
            desc.encode(w)?;
        }
        Ok(())
    }

    /// Find the descriptor with the given direction.
    pub fn descriptor(&self, direction: DataDirection) -> Option<&DataDescriptor> {
        self.data_descriptors
            .iter()
            .find(|d| d.data_direction == direction)
    }
}

/// One expected module in a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpModule {
    /// Slot number.
    pub slot_number: u16,
    /// Module ident number.
    pub ident_number: u32,
    /// Module properties word.
    pub properties: u16,
    /// Expected submodules.
    pub submodules: Vec<ExpSubmodule>,
}

/// One expected API with its modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpApi {
    /// The API identifier.
    pub api: u32,
    /// Expected modules.
    pub modules: Vec<ExpModule>,
}

/// The accumulated expected configuration of an AR. Multiple
/// ExpectedSubmoduleBlockReq blocks in one Connect merge into the same
/// structure, augmenting APIs that were already mentioned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedIdent {
    /// Expected APIs in arrival order.
    pub apis: Vec<ExpApi>,
}

impl ExpectedIdent {
    /// Merge one ExpectedSubmoduleBlockReq body into the accumulated
    /// configuration. `max_apis` and `max_slots` bound the device
    /// resources; running out latches the corresponding parse error.
    pub fn merge_block(&mut self, r: &mut BlockReader, max_apis: usize, max_slots: usize) {
        let nbr_api = r.get_u16();
        for _ in 0..nbr_api {
            let api_id = r.get_u32();

            let api_ix = match self.apis.iter().position(|a| a.api == api_id) {
                Some(ix) => ix,
                None if self.apis.len() < max_apis => {
                    self.apis.push(ExpApi {
                        api: api_id,
                        modules: Vec::new(),
                    });
                    self.apis.len() - 1
                }
                None => {
                    r.fail(ParseError::OutOfApiResources);
                    return;
                }
            };

            let slot_number = r.get_u16();
            if self.apis[api_ix].modules.len() >= max_slots {
                r.fail(ParseError::OutOfExpSubmoduleResources);
                return;
            }
            let ident_number = r.get_u32();
            let properties = r.get_u16();
            let nbr_submodules = r.get_u16();
            let submodules = (0..nbr_submodules).map(|_| ExpSubmodule::decode(r)).collect();
            self.apis[api_ix].modules.push(ExpModule {
                slot_number,
                ident_number,
                properties,
                submodules,
            });
        }
    }

    /// Write the expected configuration as one block body, for tests and
    /// for building Connect requests.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        let mut count = 0u16;
        for api in &self.apis {
            count += api.modules.len() as u16;
        }
        w.put_u16(count)?;
        for api in &self.apis {
            for module in &api.modules {
                w.put_u32(api.api)?;
                w.put_u16(module.slot_number)?;
                w.put_u32(module.ident_number)?;
                w.put_u16(module.properties)?;
                w.put_u16(module.submodules.len() as u16)?;
                for sub in &module.submodules {
                    sub.encode(w)?;
                }
            }
        }
        Ok(())
    }

    /// Find an expected submodule by address.
    pub fn find_submodule(
        &self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
    ) -> Option<&ExpSubmodule> {
        self.apis
            .iter()
            .find(|a| a.api == api)?
            .modules
            .iter()
            .find(|m| m.slot_number == slot_number)?
            .submodules
            .iter()
            .find(|s| s.subslot_number == subslot_number)
    }
}

/// Module plug state in the diff block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum ModuleState {
    /// No module plugged.
    #[default]
    NoModule = 0,
    /// Wrong module plugged.
    WrongModule = 1,
    /// Proper module.
    ProperModule = 2,
    /// Substitute module.
    SubstituteModule = 3,
}

/// Submodule ident info nibble in the diff block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SubmoduleIdentInfo {
    /// Submodule matches.
    #[default]
    Ok = 0,
    /// Substitute.
    Substitute = 1,
    /// Wrong submodule.
    Wrong = 2,
    /// No submodule.
    NoSubmodule = 3,
}

/// Submodule AR info nibble in the diff block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SubmoduleArInfo {
    /// Owned by this AR.
    #[default]
    Own = 0,
    /// Application ready pending.
    ApplicationReadyPending = 1,
    /// Superordinated locked.
    SuperordinatedLocked = 2,
    /// Locked by IO controller.
    LockedByIoController = 3,
    /// Locked by IO supervisor.
    LockedByIoSupervisor = 4,
}

/// Submodule state word in the diff block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmoduleState {
    /// Add-info bits 0..3.
    pub add_info: u8,
    /// Maintenance qualified bit.
    pub qualified_info: bool,
    /// Maintenance required.
    pub maintenance_required: bool,
    /// Maintenance demanded.
    pub maintenance_demanded: bool,
    /// Fault present.
    pub fault: bool,
    /// AR ownership info.
    pub ar_info: SubmoduleArInfo,
    /// Ident match info.
    pub ident_info: SubmoduleIdentInfo,
    /// Format indicator; always set for this coding.
    pub format_indicator: bool,
}

impl SubmoduleState {
    /// Pack into the 16-bit word.
    pub fn to_word(&self) -> u16 {
        let mut w = 0;
        w = set_bits(w, self.add_info as u32, 0, 3);
        w = set_bits(w, self.qualified_info as u32, 3, 1);
        w = set_bits(w, self.maintenance_required as u32, 4, 1);
        w = set_bits(w, self.maintenance_demanded as u32, 5, 1);
        w = set_bits(w, self.fault as u32, 6, 1);
        w = set_bits(w, self.ar_info as u32, 7, 4);
        w = set_bits(w, self.ident_info as u32, 11, 4);
        w = set_bits(w, self.format_indicator as u32, 15, 1);
        w as u16
    }
}

/// One submodule difference entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmoduleDiff {
    /// Subslot number.
    pub subslot_number: u16,
    /// The plugged submodule ident (zero when absent).
    pub submodule_ident_number: u32,
    /// The state word.
    pub submodule_state: SubmoduleState,
}

/// One module difference entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDiff {
    /// Slot number.
    pub slot_number: u16,
    /// The plugged module ident (zero when absent).
    pub module_ident_number: u32,
    /// The module plug state.
    pub module_state: ModuleState,
    /// Submodule differences.
    pub submodule_diffs: Vec<SubmoduleDiff>,
}

/// One API difference entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiDiff {
    /// The API identifier.
    pub api: u32,
    /// Module differences.
    pub module_diffs: Vec<ModuleDiff>,
}

/// The ModuleDiffBlock body: what the device really has versus what the
/// controller expected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDiffBlock {
    /// API differences.
    pub api_diffs: Vec<ApiDiff>,
}

impl ModuleDiffBlock {
    /// True when there is nothing to report.
    pub fn is_empty(&self) -> bool {
        self.api_diffs.is_empty()
    }

    /// Write the ModuleDiffBlock body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.api_diffs.len() as u16)?;
        for api in &self.api_diffs {
            w.put_u32(api.api)?;
            w.put_u16(api.module_diffs.len() as u16)?;
            for module in &api.module_diffs {
                w.put_u16(module.slot_number)?;
                w.put_u32(module.module_ident_number)?;
                w.put_u16(module.module_state as u16)?;
                w.put_u16(module.submodule_diffs.len() as u16)?;
                for sub in &module.submodule_diffs {
                    w.put_u16(sub.subslot_number)?;
                    w.put_u32(sub.submodule_ident_number)?;
                    w.put_u16(sub.submodule_state.to_word())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_submodule(direction: SubmoduleDir) -> ExpSubmodule {
        let mut data_descriptors = vec![DataDescriptor {
            data_direction: if direction == SubmoduleDir::Output {
                DataDirection::Output
            } else {
                DataDirection::Input
            },
            submodule_data_length: 4,
            length_iocs: 1,
            length_iops: 1,
        }];
        if direction == SubmoduleDir::Io {
            data_descriptors.push(DataDescriptor {
                data_direction: DataDirection::Output,
                submodule_data_length: 2,
                length_iocs: 1,
                length_iops: 1,
            });
        }
        ExpSubmodule {
            subslot_number: 1,
            ident_number: 0x0000_0133,
            properties: SubmoduleProperties {
                direction,
                ..Default::default()
            },
            data_descriptors,
        }
    }

    fn sample_ident() -> ExpectedIdent {
        ExpectedIdent {
            apis: vec![ExpApi {
                api: 0,
                modules: vec![ExpModule {
                    slot_number: 1,
                    ident_number: 0x0000_0032,
                    properties: 0,
                    submodules: vec![one_submodule(SubmoduleDir::Input)],
                }],
            }],
        }
    }

    #[test]
    fn expected_ident_round_trip() {
        let ident = sample_ident();
        let mut w = BlockWriter::new(256);
        ident.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let mut decoded = ExpectedIdent::default();
        decoded.merge_block(&mut r, 4, 16);
        assert!(r.result().is_ok());
        assert_eq!(ident, decoded);
    }

    #[test]
    fn io_submodule_reads_two_descriptors() {
        let ident = ExpectedIdent {
            apis: vec![ExpApi {
                api: 0,
                modules: vec![ExpModule {
                    slot_number: 2,
                    ident_number: 7,
                    properties: 0,
                    submodules: vec![one_submodule(SubmoduleDir::Io)],
                }],
            }],
        };
        let mut w = BlockWriter::new(256);
        ident.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let mut decoded = ExpectedIdent::default();
        decoded.merge_block(&mut r, 4, 16);
        assert!(r.result().is_ok());
        assert_eq!(2, decoded.apis[0].modules[0].submodules[0].data_descriptors.len());
        assert_eq!(0, r.remaining());
    }

    #[test]
    fn merge_respects_api_bound() {
        let ident = sample_ident();
        let mut w = BlockWriter::new(256);
        ident.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let mut decoded = ExpectedIdent {
            apis: vec![ExpApi {
                api: 42,
                modules: Vec::new(),
            }],
        };
        decoded.merge_block(&mut r, 1, 16);
        assert_eq!(Err(ParseError::OutOfApiResources), r.result());
    }

    #[test]
    fn submodule_state_word() {
        let state = SubmoduleState {
            fault: true,
            ident_info: SubmoduleIdentInfo::Wrong,
            format_indicator: true,
            ..Default::default()
        };
        let word = state.to_word();
        assert_eq!(1, get_bits(word as u32, 6, 1));
        assert_eq!(2, get_bits(word as u32, 11, 4));
        assert_eq!(1, get_bits(word as u32, 15, 1));
    }
}
