// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Alarm wire format: the RTA fixed header and the Alarm Notification /
//! Alarm Ack payload blocks.

use crate::codec::{get_bits, set_bits};
use crate::{BlockReader, BlockWriter, WriteError};

/// RTA PDU types in the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RtaPduType {
    /// Not a valid wire value.
    #[default]
    Invalid = 0,
    /// DATA: carries an alarm notification or acknowledge block.
    Data = 1,
    /// NACK: sequence error report.
    Nack = 2,
    /// ACK: transport acknowledge.
    Ack = 3,
    /// ERR: carries a PNIO status.
    Err = 4,
}

impl RtaPduType {
    /// From the 4-bit wire field.
    pub fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Data,
            2 => Self::Nack,
            3 => Self::Ack,
            4 => Self::Err,
            _ => Self::Invalid,
        }
    }
}

/// The RTA PDU version this stack speaks.
pub const RTA_PDU_VERSION: u8 = 1;

/// Alarm type codes.
pub mod alarm_type {
    /// Diagnosis alarm.
    pub const DIAGNOSIS: u16 = 0x0001;
    /// Process alarm.
    pub const PROCESS: u16 = 0x0002;
    /// Pull alarm (submodule removed).
    pub const PULL: u16 = 0x0003;
    /// Plug alarm (proper submodule inserted).
    pub const PLUG: u16 = 0x0004;
    /// Plug wrong submodule.
    pub const PLUG_WRONG_MODULE: u16 = 0x000A;
    /// Port data change notification.
    pub const PORT_DATA_CHANGE: u16 = 0x000E;
    /// Pull module (subslot 0, allowed by AR properties).
    pub const PULL_MODULE: u16 = 0x001F;
}

/// User structure identifiers classifying alarm / diagnosis payloads.
pub mod usi {
    /// Values below this are manufacturer specific payload.
    pub const CHANNEL_DIAGNOSIS: u16 = 0x8000;
    /// Extended channel diagnosis.
    pub const EXTENDED_CHANNEL_DIAGNOSIS: u16 = 0x8002;
    /// Qualified channel diagnosis.
    pub const QUALIFIED_CHANNEL_DIAGNOSIS: u16 = 0x8003;
    /// Maintenance item, precedes the maintenance status word.
    pub const MAINTENANCE: u16 = 0x8100;
}

/// The fixed part of every alarm frame. Not a block: it carries no block
/// header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmFixed {
    /// Destination endpoint reference.
    pub dst_ref: u16,
    /// Source endpoint reference.
    pub src_ref: u16,
    /// PDU type, low nibble of the third byte.
    pub pdu_type: RtaPduType,
    /// PDU version, high nibble of the third byte.
    pub version: u8,
    /// Advertised window size; this stack always uses 1.
    pub window_size: u8,
    /// Transport-acknowledge request bit.
    pub tack: bool,
    /// Send sequence number.
    pub send_seq_num: u16,
    /// Acknowledge sequence number.
    pub ack_seq_num: u16,
}

impl AlarmFixed {
    /// Read the fixed part.
    pub fn decode(r: &mut BlockReader) -> Self {
        let dst_ref = r.get_u16();
        let src_ref = r.get_u16();
        let b = r.get_u8() as u32;
        let pdu_type = RtaPduType::from_bits(get_bits(b, 0, 4) as u8);
        let version = get_bits(b, 4, 4) as u8;
        let b = r.get_u8() as u32;
        let window_size = get_bits(b, 0, 4) as u8;
        let tack = get_bits(b, 4, 1) != 0;
        Self {
            dst_ref,
            src_ref,
            pdu_type,
            version,
            window_size,
            tack,
            send_seq_num: r.get_u16(),
            ack_seq_num: r.get_u16(),
        }
    }

    /// Write the fixed part.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.dst_ref)?;
        w.put_u16(self.src_ref)?;
        let mut b = 0;
        b = set_bits(b, self.pdu_type as u32, 0, 4);
        b = set_bits(b, self.version as u32, 4, 4);
        w.put_u8(b as u8)?;
        let mut b = 0;
        b = set_bits(b, self.window_size as u32, 0, 4);
        b = set_bits(b, self.tack as u32, 4, 1);
        w.put_u8(b as u8)?;
        w.put_u16(self.send_seq_num)?;
        w.put_u16(self.ack_seq_num)
    }
}

/// The AlarmSpecifier bits, carried together with the 11-bit alarm
/// sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmSpecifier {
    /// A channel diagnosis is available.
    pub channel_diagnosis: bool,
    /// A manufacturer specific diagnosis is available.
    pub manufacturer_diagnosis: bool,
    /// A submodule diagnosis is available.
    pub submodule_diagnosis: bool,
    /// A diagnosis exists on this AR.
    pub ar_diagnosis: bool,
}

impl AlarmSpecifier {
    /// Unpack specifier and sequence number from the 16-bit word.
    pub fn from_word(word: u16) -> (Self, u16) {
        let w = word as u32;
        (
            Self {
                channel_diagnosis: get_bits(w, 11, 1) != 0,
                manufacturer_diagnosis: get_bits(w, 12, 1) != 0,
                submodule_diagnosis: get_bits(w, 13, 1) != 0,
                ar_diagnosis: get_bits(w, 15, 1) != 0,
            },
            get_bits(w, 0, 11) as u16,
        )
    }

    /// Pack specifier and sequence number into the 16-bit word.
    pub fn to_word(&self, sequence_number: u16) -> u16 {
        let mut w = 0;
        w = set_bits(w, sequence_number as u32, 0, 11);
        w = set_bits(w, self.channel_diagnosis as u32, 11, 1);
        w = set_bits(w, self.manufacturer_diagnosis as u32, 12, 1);
        w = set_bits(w, self.submodule_diagnosis as u32, 13, 1);
        w = set_bits(w, self.ar_diagnosis as u32, 15, 1);
        w as u16
    }
}

/// The Alarm Notification payload block body (after the block header).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmNotification {
    /// Alarm type, see [`alarm_type`].
    pub alarm_type: u16,
    /// API identifier.
    pub api_id: u32,
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Plugged module ident.
    pub module_ident: u32,
    /// Plugged submodule ident.
    pub submodule_ident: u32,
    /// Specifier bits.
    pub specifier: AlarmSpecifier,
    /// 11-bit alarm sequence number.
    pub sequence_number: u16,
}

impl AlarmNotification {
    /// Read the notification body up to and including the specifier word.
    /// Any USI payload follows in the buffer.
    pub fn decode(r: &mut BlockReader) -> Self {
        let alarm_type = r.get_u16();
        let api_id = r.get_u32();
        let slot_number = r.get_u16();
        let subslot_number = r.get_u16();
        let module_ident = r.get_u32();
        let submodule_ident = r.get_u32();
        let (specifier, sequence_number) = AlarmSpecifier::from_word(r.get_u16());
        Self {
            alarm_type,
            api_id,
            slot_number,
            subslot_number,
            module_ident,
            submodule_ident,
            specifier,
            sequence_number,
        }
    }

    /// Write the notification body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.alarm_type)?;
        w.put_u32(self.api_id)?;
        w.put_u16(self.slot_number)?;
        w.put_u16(self.subslot_number)?;
        w.put_u32(self.module_ident)?;
        w.put_u32(self.submodule_ident)?;
        w.put_u16(self.specifier.to_word(self.sequence_number))
    }
}

/// The Alarm Ack payload block body (after the block header).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmAck {
    /// Alarm type being acknowledged.
    pub alarm_type: u16,
    /// API identifier.
    pub api_id: u32,
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Specifier bits.
    pub specifier: AlarmSpecifier,
    /// 11-bit alarm sequence number.
    pub sequence_number: u16,
}

impl AlarmAck {
    /// Read the ack body. The PNIO status follows in the buffer.
    pub fn decode(r: &mut BlockReader) -> Self {
        let alarm_type = r.get_u16();
        let api_id = r.get_u32();
        let slot_number = r.get_u16();
        let subslot_number = r.get_u16();
        let (specifier, sequence_number) = AlarmSpecifier::from_word(r.get_u16());
        Self {
            alarm_type,
            api_id,
            slot_number,
            subslot_number,
            specifier,
            sequence_number,
        }
    }

    /// Write the ack body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.alarm_type)?;
        w.put_u32(self.api_id)?;
        w.put_u16(self.slot_number)?;
        w.put_u16(self.subslot_number)?;
        w.put_u16(self.specifier.to_word(self.sequence_number))
    }
}

/// AlarmCRBlockReq body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmCrRequest {
    /// Alarm CR type; must be 1.
    pub alarm_cr_type: u16,
    /// The LT field: 0x8892 for Ethernet transport.
    pub lt_field: u16,
    /// Properties bit 0: priority.
    pub priority: bool,
    /// Properties bit 1: requested UDP transport.
    pub transport_udp: bool,
    /// Retransmission timeout factor, units of 100 ms.
    pub rta_timeout_factor: u16,
    /// Number of retransmissions.
    pub rta_retries: u16,
    /// The controller's endpoint reference.
    pub local_alarm_reference: u16,
    /// Longest alarm data the controller accepts.
    pub max_alarm_data_length: u16,
    /// VLAN tag for high priority alarms.
    pub tag_header_high: super::iocr::IocrTagHeader,
    /// VLAN tag for low priority alarms.
    pub tag_header_low: super::iocr::IocrTagHeader,
}

/// The alarm CR type value for a regular alarm CR.
pub const ALARM_CR_TYPE: u16 = 0x0001;

impl AlarmCrRequest {
    /// Read an AlarmCRBlockReq body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let alarm_cr_type = r.get_u16();
        let lt_field = r.get_u16();
        let props = r.get_u32();
        let priority = get_bits(props, 0, 1) != 0;
        let transport_udp = get_bits(props, 1, 1) != 0;
        let rta_timeout_factor = r.get_u16();
        let rta_retries = r.get_u16();
        let local_alarm_reference = r.get_u16();
        let max_alarm_data_length = r.get_u16();
        // The alarm CR tag headers use a 12-bit VLAN id field.
        let w = r.get_u16() as u32;
        let tag_header_high = super::iocr::IocrTagHeader {
            vlan_id: get_bits(w, 0, 12) as u16,
            user_priority: get_bits(w, 13, 3) as u8,
        };
        let w = r.get_u16() as u32;
        let tag_header_low = super::iocr::IocrTagHeader {
            vlan_id: get_bits(w, 0, 12) as u16,
            user_priority: get_bits(w, 13, 3) as u8,
        };
        Self {
            alarm_cr_type,
            lt_field,
            priority,
            transport_udp,
            rta_timeout_factor,
            rta_retries,
            local_alarm_reference,
            max_alarm_data_length,
            tag_header_high,
            tag_header_low,
        }
    }

    /// Write an AlarmCRBlockReq body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.alarm_cr_type)?;
        w.put_u16(self.lt_field)?;
        let mut props = 0;
        props = set_bits(props, self.priority as u32, 0, 1);
        props = set_bits(props, self.transport_udp as u32, 1, 1);
        w.put_u32(props)?;
        w.put_u16(self.rta_timeout_factor)?;
        w.put_u16(self.rta_retries)?;
        w.put_u16(self.local_alarm_reference)?;
        w.put_u16(self.max_alarm_data_length)?;
        let mut word = 0;
        word = set_bits(word, self.tag_header_high.vlan_id as u32, 0, 12);
        word = set_bits(word, self.tag_header_high.user_priority as u32, 13, 3);
        w.put_u16(word as u16)?;
        let mut word = 0;
        word = set_bits(word, self.tag_header_low.vlan_id as u32, 0, 12);
        word = set_bits(word, self.tag_header_low.user_priority as u32, 13, 3);
        w.put_u16(word as u16)
    }
}

/// AlarmCRBlockRes body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmCrResult {
    /// Echoed alarm CR type.
    pub alarm_cr_type: u16,
    /// The device's endpoint reference.
    pub local_alarm_reference: u16,
    /// Longest alarm data the device emits.
    pub max_alarm_data_length: u16,
}

impl AlarmCrResult {
    /// Read an AlarmCRBlockRes body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            alarm_cr_type: r.get_u16(),
            local_alarm_reference: r.get_u16(),
            max_alarm_data_length: r.get_u16(),
        }
    }

    /// Write an AlarmCRBlockRes body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.alarm_cr_type)?;
        w.put_u16(self.local_alarm_reference)?;
        w.put_u16(self.max_alarm_data_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_fixed_round_trip() {
        let fixed = AlarmFixed {
            dst_ref: 0x0102,
            src_ref: 0x0304,
            pdu_type: RtaPduType::Data,
            version: RTA_PDU_VERSION,
            window_size: 1,
            tack: true,
            send_seq_num: 0x7FFF,
            ack_seq_num: 0xFFFE,
        };
        let mut w = BlockWriter::new(16);
        fixed.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(10, bytes.len());
        // PDU type in low nibble, version in high nibble.
        assert_eq!(0x11, bytes[4]);
        // Window size 1, TACK bit 4.
        assert_eq!(0x11, bytes[5]);
        let mut r = BlockReader::new(&bytes);
        assert_eq!(fixed, AlarmFixed::decode(&mut r));
        assert!(r.result().is_ok());
    }

    #[test]
    fn alarm_specifier_word_layout() {
        let spec = AlarmSpecifier {
            channel_diagnosis: true,
            ar_diagnosis: true,
            ..Default::default()
        };
        let word = spec.to_word(0x7FF);
        assert_eq!(0x7FF, word & 0x7FF);
        assert_ne!(0, word & (1 << 11));
        assert_eq!(0, word & (1 << 12));
        assert_ne!(0, word & (1 << 15));
        let (decoded, seq) = AlarmSpecifier::from_word(word);
        assert_eq!(spec, decoded);
        assert_eq!(0x7FF, seq);
    }

    #[test]
    fn notification_round_trip() {
        let notification = AlarmNotification {
            alarm_type: alarm_type::PROCESS,
            api_id: 0,
            slot_number: 1,
            subslot_number: 1,
            module_ident: 0x32,
            submodule_ident: 0x133,
            specifier: AlarmSpecifier::default(),
            sequence_number: 5,
        };
        let mut w = BlockWriter::new(64);
        notification.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        assert_eq!(notification, AlarmNotification::decode(&mut r));
        assert!(r.result().is_ok());
    }

    #[test]
    fn alarm_cr_request_round_trip() {
        let req = AlarmCrRequest {
            alarm_cr_type: ALARM_CR_TYPE,
            lt_field: crate::ETHTYPE_PROFINET,
            priority: false,
            transport_udp: false,
            rta_timeout_factor: 10,
            rta_retries: 3,
            local_alarm_reference: 0x1234,
            max_alarm_data_length: 1432,
            tag_header_high: super::super::iocr::IocrTagHeader {
                vlan_id: 0,
                user_priority: 6,
            },
            tag_header_low: super::super::iocr::IocrTagHeader {
                vlan_id: 0,
                user_priority: 5,
            },
        };
        let mut w = BlockWriter::new(64);
        req.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        assert_eq!(req, AlarmCrRequest::decode(&mut r));
        assert!(r.result().is_ok());
    }
}
