// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! IOCRBlockReq / IOCRBlockRes.

use crate::codec::{get_bits, set_bits};
use crate::{BlockReader, BlockWriter, WriteError};

/// IOCR type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum IocrType {
    /// Not a valid wire value; the default for zeroed state.
    #[default]
    Invalid = 0,
    /// Input CR (device is provider).
    Input = 1,
    /// Output CR (device is consumer).
    Output = 2,
    /// Multicast provider CR.
    MulticastProvider = 3,
    /// Multicast consumer CR.
    MulticastConsumer = 4,
}

impl IocrType {
    /// From the wire value. Out-of-range values map to `Invalid` and are
    /// rejected by validation.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::Input,
            2 => Self::Output,
            3 => Self::MulticastProvider,
            4 => Self::MulticastConsumer,
            _ => Self::Invalid,
        }
    }

    /// True for the provider (device-to-controller) directions.
    pub fn is_provider(self) -> bool {
        matches!(self, Self::Input | Self::MulticastProvider)
    }
}

/// RT class carried in the IOCRProperties word.
pub mod rt_class {
    /// RT class 1 (unsynchronized).
    pub const CLASS_1: u8 = 1;
    /// RT class 2.
    pub const CLASS_2: u8 = 2;
    /// RT class 3 (IRT).
    pub const CLASS_3: u8 = 3;
    /// RT over UDP.
    pub const UDP: u8 = 4;
    /// Stream class.
    pub const STREAM: u8 = 5;
}

/// The IOCRProperties bit field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IocrProperties {
    /// Bits 0..4.
    pub rt_class: u8,
    /// Bits 4..13, must be zero.
    pub reserved_1: bool,
    /// Bits 13..24, may hold anything; not checked.
    pub reserved_2: bool,
    /// Bits 24..32, must be zero.
    pub reserved_3: bool,
}

impl IocrProperties {
    /// Unpack from the 32-bit word.
    pub fn from_word(word: u32) -> Self {
        Self {
            rt_class: get_bits(word, 0, 4) as u8,
            reserved_1: get_bits(word, 4, 9) != 0,
            reserved_2: get_bits(word, 13, 11) != 0,
            reserved_3: get_bits(word, 24, 8) != 0,
        }
    }

    /// Pack into the 32-bit word. Reserved ranges are emitted as zero.
    pub fn to_word(&self) -> u32 {
        set_bits(0, self.rt_class as u32, 0, 4)
    }
}

/// The VLAN tag header of a CR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IocrTagHeader {
    /// Bits 0..11 (cyclic CRs use an 11-bit VLAN id field).
    pub vlan_id: u16,
    /// Bits 13..16.
    pub user_priority: u8,
}

impl IocrTagHeader {
    /// Unpack from the 16-bit word.
    pub fn from_word(word: u16) -> Self {
        Self {
            vlan_id: get_bits(word as u32, 0, 11) as u16,
            user_priority: get_bits(word as u32, 13, 3) as u8,
        }
    }

    /// Pack into the 16-bit word.
    pub fn to_word(&self) -> u16 {
        let mut w = 0;
        w = set_bits(w, self.vlan_id as u32, 0, 11);
        w = set_bits(w, self.user_priority as u32, 13, 3);
        w as u16
    }
}

/// One IO data / IOCS reference: a subslot and its byte offset within the
/// RT frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Byte offset inside the C_SDU.
    pub frame_offset: u16,
}

impl FrameDescriptor {
    fn decode(r: &mut BlockReader) -> Self {
        Self {
            slot_number: r.get_u16(),
            subslot_number: r.get_u16(),
            frame_offset: r.get_u16(),
        }
    }

    fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.slot_number)?;
        w.put_u16(self.subslot_number)?;
        w.put_u16(self.frame_offset)
    }
}

/// Per-API list of IO data objects and IOCS references inside one IOCR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IocrApiEntry {
    /// The API identifier.
    pub api: u32,
    /// IO data object references.
    pub io_data: Vec<FrameDescriptor>,
    /// IOCS references.
    pub iocs: Vec<FrameDescriptor>,
}

impl IocrApiEntry {
    fn decode(r: &mut BlockReader) -> Self {
        let api = r.get_u32();
        let nbr_io_data = r.get_u16();
        let io_data = (0..nbr_io_data)
            .map(|_| FrameDescriptor::decode(r))
            .collect();
        let nbr_iocs = r.get_u16();
        let iocs = (0..nbr_iocs).map(|_| FrameDescriptor::decode(r)).collect();
        Self { api, io_data, iocs }
    }

    fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u32(self.api)?;
        w.put_u16(self.io_data.len() as u16)?;
        for fd in &self.io_data {
            fd.encode(w)?;
        }
        w.put_u16(self.iocs.len() as u16)?;
        for fd in &self.iocs {
            fd.encode(w)?;
        }
        Ok(())
    }
}

/// IOCRBlockReq, without its block header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IocrParam {
    /// CR type.
    pub iocr_type: IocrType,
    /// CR reference, echoed in the response.
    pub iocr_reference: u16,
    /// The LT (EtherType) field: 0x8892 for Ethernet, 0x0800 for UDP.
    pub lt_field: u16,
    /// IOCRProperties.
    pub properties: IocrProperties,
    /// Cyclic frame payload length.
    pub c_sdu_length: u16,
    /// FrameID, or 0xFFFF to let the device choose (output CRs).
    pub frame_id: u16,
    /// Send clock factor in units of 31.25 us; power of two 1..128.
    pub send_clock_factor: u16,
    /// Reduction ratio.
    pub reduction_ratio: u16,
    /// Phase, 1..=reduction_ratio.
    pub phase: u16,
    /// Sequence.
    pub sequence: u16,
    /// Frame send offset in ns, or 0xFFFFFFFF for best effort.
    pub frame_send_offset: u32,
    /// Watchdog factor (legacy, mirrors data hold factor).
    pub watchdog_factor: u16,
    /// Data hold factor.
    pub data_hold_factor: u16,
    /// VLAN tag.
    pub tag_header: IocrTagHeader,
    /// Multicast MAC address for multicast CRs.
    pub multicast_mac: [u8; 6],
    /// Per-API references.
    pub apis: Vec<IocrApiEntry>,
}

impl IocrParam {
    /// Read an IOCRBlockReq body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let iocr_type = IocrType::from_u16(r.get_u16());
        let iocr_reference = r.get_u16();
        let lt_field = r.get_u16();
        let properties = IocrProperties::from_word(r.get_u32());
        let c_sdu_length = r.get_u16();
        let frame_id = r.get_u16();
        let send_clock_factor = r.get_u16();
        let reduction_ratio = r.get_u16();
        let phase = r.get_u16();
        let sequence = r.get_u16();
        let frame_send_offset = r.get_u32();
        let watchdog_factor = r.get_u16();
        let data_hold_factor = r.get_u16();
        let tag_header = IocrTagHeader::from_word(r.get_u16());
        let multicast_mac = r.get_array::<6>();
        let nbr_apis = r.get_u16();
        let apis = (0..nbr_apis).map(|_| IocrApiEntry::decode(r)).collect();
        Self {
            iocr_type,
            iocr_reference,
            lt_field,
            properties,
            c_sdu_length,
            frame_id,
            send_clock_factor,
            reduction_ratio,
            phase,
            sequence,
            frame_send_offset,
            watchdog_factor,
            data_hold_factor,
            tag_header,
            multicast_mac,
            apis,
        }
    }

    /// Write an IOCRBlockReq body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.iocr_type as u16)?;
        w.put_u16(self.iocr_reference)?;
        w.put_u16(self.lt_field)?;
        w.put_u32(self.properties.to_word())?;
        w.put_u16(self.c_sdu_length)?;
        w.put_u16(self.frame_id)?;
        w.put_u16(self.send_clock_factor)?;
        w.put_u16(self.reduction_ratio)?;
        w.put_u16(self.phase)?;
        w.put_u16(self.sequence)?;
        w.put_u32(self.frame_send_offset)?;
        w.put_u16(self.watchdog_factor)?;
        w.put_u16(self.data_hold_factor)?;
        w.put_u16(self.tag_header.to_word())?;
        w.put_mem(&self.multicast_mac)?;
        w.put_u16(self.apis.len() as u16)?;
        for api in &self.apis {
            api.encode(w)?;
        }
        Ok(())
    }
}

/// IOCRBlockRes body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IocrResult {
    /// Echoed CR type.
    pub iocr_type: IocrType,
    /// Echoed CR reference.
    pub iocr_reference: u16,
    /// The FrameID in effect, after any fix-up.
    pub frame_id: u16,
}

impl IocrResult {
    /// Read an IOCRBlockRes body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            iocr_type: IocrType::from_u16(r.get_u16()),
            iocr_reference: r.get_u16(),
            frame_id: r.get_u16(),
        }
    }

    /// Write an IOCRBlockRes body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.iocr_type as u16)?;
        w.put_u16(self.iocr_reference)?;
        w.put_u16(self.frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_iocr() -> IocrParam {
        IocrParam {
            iocr_type: IocrType::Input,
            iocr_reference: 1,
            lt_field: crate::ETHTYPE_PROFINET,
            properties: IocrProperties {
                rt_class: rt_class::CLASS_1,
                ..Default::default()
            },
            c_sdu_length: 40,
            frame_id: 0xC010,
            send_clock_factor: 32,
            reduction_ratio: 4,
            phase: 1,
            sequence: 0,
            frame_send_offset: 0xFFFF_FFFF,
            watchdog_factor: 3,
            data_hold_factor: 3,
            tag_header: IocrTagHeader {
                vlan_id: 0,
                user_priority: 6,
            },
            multicast_mac: [0; 6],
            apis: vec![IocrApiEntry {
                api: 0,
                io_data: vec![FrameDescriptor {
                    slot_number: 1,
                    subslot_number: 1,
                    frame_offset: 0,
                }],
                iocs: vec![FrameDescriptor {
                    slot_number: 2,
                    subslot_number: 1,
                    frame_offset: 10,
                }],
            }],
        }
    }

    #[test]
    fn iocr_param_round_trip() {
        let param = sample_iocr();
        let mut w = BlockWriter::new(256);
        param.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let decoded = IocrParam::decode(&mut r);
        assert!(r.result().is_ok());
        assert_eq!(param, decoded);
        assert_eq!(0, r.remaining());
    }

    #[test]
    fn tag_header_priority_bits() {
        let tag = IocrTagHeader::from_word(0xC000);
        assert_eq!(6, tag.user_priority);
        assert_eq!(0, tag.vlan_id);
        assert_eq!(0xC000, tag.to_word());
    }

    #[test]
    fn iocr_result_round_trip() {
        let result = IocrResult {
            iocr_type: IocrType::Output,
            iocr_reference: 2,
            frame_id: 0xC001,
        };
        let mut w = BlockWriter::new(16);
        result.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        assert_eq!(result, IocrResult::decode(&mut r));
    }
}
