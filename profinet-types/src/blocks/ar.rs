// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! ARBlockReq / ARBlockRes / ARServerBlock.

use crate::codec::{get_bits, set_bits};
use crate::{BlockReader, BlockWriter, PnetUuid, WriteError};

/// Longest accepted station name, excluding any terminator.
pub const STATION_NAME_MAX_LEN: usize = 240;

/// AR type: IO controller AR, single.
pub const AR_TYPE_IOCAR_SINGLE: u16 = 0x0001;
/// AR type: supervisor AR (device access).
pub const AR_TYPE_IOSAR: u16 = 0x0006;

/// The ARProperties bit field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArProperties {
    /// Bits 0..3. 1 = active.
    pub state: u8,
    /// Bit 3.
    pub supervisor_takeover_allowed: bool,
    /// Bit 4: 1 = external parameter server.
    pub parameterization_server: u8,
    /// Bit 8: supervisor AR with device access.
    pub device_access: bool,
    /// Bits 9..11.
    pub companion_ar: u8,
    /// Bit 11.
    pub acknowledge_companion_ar: bool,
    /// Bit 29.
    pub combined_object_container: bool,
    /// Bit 30: false = legacy startup, true = advanced.
    pub startup_mode: bool,
    /// Bit 31.
    pub pull_module_alarm_allowed: bool,
}

impl ArProperties {
    /// Unpack from the 32-bit properties word.
    pub fn from_word(word: u32) -> Self {
        Self {
            state: get_bits(word, 0, 3) as u8,
            supervisor_takeover_allowed: get_bits(word, 3, 1) != 0,
            parameterization_server: get_bits(word, 4, 1) as u8,
            device_access: get_bits(word, 8, 1) != 0,
            companion_ar: get_bits(word, 9, 2) as u8,
            acknowledge_companion_ar: get_bits(word, 11, 1) != 0,
            combined_object_container: get_bits(word, 29, 1) != 0,
            startup_mode: get_bits(word, 30, 1) != 0,
            pull_module_alarm_allowed: get_bits(word, 31, 1) != 0,
        }
    }

    /// Pack into the 32-bit properties word.
    pub fn to_word(&self) -> u32 {
        let mut w = 0;
        w = set_bits(w, self.state as u32, 0, 3);
        w = set_bits(w, self.supervisor_takeover_allowed as u32, 3, 1);
        w = set_bits(w, self.parameterization_server as u32, 4, 1);
        w = set_bits(w, self.device_access as u32, 8, 1);
        w = set_bits(w, self.companion_ar as u32, 9, 2);
        w = set_bits(w, self.acknowledge_companion_ar as u32, 11, 1);
        w = set_bits(w, self.combined_object_container as u32, 29, 1);
        w = set_bits(w, self.startup_mode as u32, 30, 1);
        w = set_bits(w, self.pull_module_alarm_allowed as u32, 31, 1);
        w
    }
}

/// ARBlockReq, without its block header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArParam {
    /// AR type, see [`AR_TYPE_IOCAR_SINGLE`].
    pub ar_type: u16,
    /// The AR UUID chosen by the initiator.
    pub ar_uuid: PnetUuid,
    /// Session key; echoed on control blocks.
    pub session_key: u16,
    /// Initiator (controller) MAC address.
    pub cm_initiator_mac: [u8; 6],
    /// Initiator object UUID; must match the well-known pattern.
    pub cm_initiator_object_uuid: PnetUuid,
    /// ARProperties.
    pub properties: ArProperties,
    /// Activity timeout factor, units of 100 ms.
    pub cm_initiator_activity_timeout_factor: u16,
    /// Initiator UDP port for RT-over-UDP.
    pub cm_initiator_udp_rt_port: u16,
    /// Initiator station name. Clamped to [`STATION_NAME_MAX_LEN`] on
    /// decode; the wire length before clamping is kept for validation.
    pub cm_initiator_station_name: String,
    /// Station name length as declared on the wire.
    pub cm_initiator_station_name_len: u16,
}

impl ArParam {
    /// Read an ARBlockReq body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let ar_type = r.get_u16();
        let ar_uuid = r.get_uuid();
        let session_key = r.get_u16();
        let cm_initiator_mac = r.get_array::<6>();
        let cm_initiator_object_uuid = r.get_uuid();
        let properties = ArProperties::from_word(r.get_u32());
        let cm_initiator_activity_timeout_factor = r.get_u16();
        let cm_initiator_udp_rt_port = r.get_u16();
        let name_len = r.get_u16();
        let cm_initiator_station_name = r.get_string(name_len as usize, STATION_NAME_MAX_LEN);
        Self {
            ar_type,
            ar_uuid,
            session_key,
            cm_initiator_mac,
            cm_initiator_object_uuid,
            properties,
            cm_initiator_activity_timeout_factor,
            cm_initiator_udp_rt_port,
            cm_initiator_station_name,
            cm_initiator_station_name_len: name_len,
        }
    }

    /// Write an ARBlockReq body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.ar_type)?;
        w.put_uuid(&self.ar_uuid)?;
        w.put_u16(self.session_key)?;
        w.put_mem(&self.cm_initiator_mac)?;
        w.put_uuid(&self.cm_initiator_object_uuid)?;
        w.put_u32(self.properties.to_word())?;
        w.put_u16(self.cm_initiator_activity_timeout_factor)?;
        w.put_u16(self.cm_initiator_udp_rt_port)?;
        let bytes = self.cm_initiator_station_name.as_bytes();
        w.put_u16(bytes.len() as u16)?;
        w.put_mem(bytes)
    }
}

/// ARBlockRes body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArResult {
    /// Echoed AR type.
    pub ar_type: u16,
    /// Echoed AR UUID.
    pub ar_uuid: PnetUuid,
    /// Echoed session key.
    pub session_key: u16,
    /// Responder (device) MAC address.
    pub cm_responder_mac: [u8; 6],
    /// Responder UDP port.
    pub responder_udp_rt_port: u16,
}

impl ArResult {
    /// Read an ARBlockRes body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            ar_type: r.get_u16(),
            ar_uuid: r.get_uuid(),
            session_key: r.get_u16(),
            cm_responder_mac: r.get_array::<6>(),
            responder_udp_rt_port: r.get_u16(),
        }
    }

    /// Write an ARBlockRes body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.ar_type)?;
        w.put_uuid(&self.ar_uuid)?;
        w.put_u16(self.session_key)?;
        w.put_mem(&self.cm_responder_mac)?;
        w.put_u16(self.responder_udp_rt_port)
    }
}

/// ARServerBlock body: the responder station name, padded to 32-bit
/// alignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArServer {
    /// The device station name echoed to the controller.
    pub cm_responder_station_name: String,
}

impl ArServer {
    /// Read an ARServerBlock body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let len = r.get_u16();
        let cm_responder_station_name = r.get_string(len as usize, STATION_NAME_MAX_LEN);
        let padding = (4 - ((2 + len as usize) % 4)) % 4;
        r.skip(padding);
        Self {
            cm_responder_station_name,
        }
    }

    /// Write an ARServerBlock body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        let bytes = self.cm_responder_station_name.as_bytes();
        w.put_u16(bytes.len() as u16)?;
        w.put_mem(bytes)?;
        let padding = (4 - ((2 + bytes.len()) % 4)) % 4;
        w.put_padding(padding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ar_param() -> ArParam {
        ArParam {
            ar_type: AR_TYPE_IOCAR_SINGLE,
            ar_uuid: PnetUuid::from_fields(0x12345678, 0x9ABC, 0xDEF0, [1, 2, 3, 4, 5, 6, 7, 8]),
            session_key: 0x0007,
            cm_initiator_mac: [0x02, 0x11, 0x22, 0x33, 0x44, 0x55],
            cm_initiator_object_uuid: PnetUuid::from_fields(
                0xDEA0_0000,
                0x6C97,
                0x11D1,
                [0x82, 0x71, 0, 0, 0, 0, 0, 1],
            ),
            properties: ArProperties {
                state: 1,
                pull_module_alarm_allowed: true,
                ..Default::default()
            },
            cm_initiator_activity_timeout_factor: 600,
            cm_initiator_udp_rt_port: 0x8892,
            cm_initiator_station_name: "plc-station-1".to_string(),
            cm_initiator_station_name_len: 13,
        }
    }

    #[test]
    fn ar_param_round_trip() {
        let param = sample_ar_param();
        let mut w = BlockWriter::new(256);
        param.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let decoded = ArParam::decode(&mut r);
        assert!(r.result().is_ok());
        assert_eq!(param, decoded);
    }

    #[test]
    fn ar_properties_word_layout() {
        let props = ArProperties::from_word(0x8000_0001);
        assert_eq!(1, props.state);
        assert!(props.pull_module_alarm_allowed);
        assert!(!props.startup_mode);
        assert_eq!(0x8000_0001, props.to_word());
    }

    #[test]
    fn ar_server_pads_to_32_bits() {
        let server = ArServer {
            cm_responder_station_name: "dev".to_string(),
        };
        let mut w = BlockWriter::new(64);
        server.encode(&mut w).unwrap();
        // 2 length bytes + 3 name bytes + 3 padding.
        assert_eq!(8, w.pos());
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        assert_eq!(server, ArServer::decode(&mut r));
        assert_eq!(0, r.remaining());
    }
}
