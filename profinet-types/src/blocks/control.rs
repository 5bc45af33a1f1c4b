// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! DControl / CControl block bodies.

use bitflags::bitflags;

use crate::{BlockReader, BlockWriter, PnetUuid, WriteError};

bitflags! {
    /// The ControlCommand word. Always big-endian on the wire, regardless
    /// of the NDR endianness of the enclosing message.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ControlCommand: u16 {
        /// Parameterisation has ended.
        const PRM_END = 1 << 0;
        /// Application is ready for cyclic data.
        const APPLICATION_READY = 1 << 1;
        /// Release the AR.
        const RELEASE = 1 << 2;
        /// The command was executed.
        const DONE = 1 << 3;
        /// Ready for companion AR.
        const READY_FOR_COMPANION = 1 << 4;
        /// Ready for RT class 3 data.
        const READY_FOR_RT_CLASS_3 = 1 << 5;
    }
}

/// A control block body: shared by PrmEnd, ApplicationReady and Release
/// blocks. Two bytes of padding lead the body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlBlock {
    /// The AR this control refers to.
    pub ar_uuid: PnetUuid,
    /// Session key of the AR.
    pub session_key: u16,
    /// Alarm sequence number field (reserved in most uses).
    pub alarm_sequence_number: u16,
    /// The command bits.
    pub control_command: ControlCommand,
    /// Properties word.
    pub control_block_properties: u16,
}

impl ControlBlock {
    /// Read a control block body.
    pub fn decode(r: &mut BlockReader) -> Self {
        r.skip(2);
        let ar_uuid = r.get_uuid();
        let session_key = r.get_u16();
        let alarm_sequence_number = r.get_u16();
        let control_command = ControlCommand::from_bits_truncate(r.get_u16());
        let control_block_properties = r.get_u16();
        Self {
            ar_uuid,
            session_key,
            alarm_sequence_number,
            control_command,
            control_block_properties,
        }
    }

    /// Write a control block body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_padding(2)?;
        w.put_uuid(&self.ar_uuid)?;
        w.put_u16(self.session_key)?;
        w.put_u16(self.alarm_sequence_number)?;
        w.put_u16(self.control_command.bits())?;
        w.put_u16(self.control_block_properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_round_trip() {
        let block = ControlBlock {
            ar_uuid: PnetUuid::from_fields(1, 2, 3, [4, 5, 6, 7, 8, 9, 10, 11]),
            session_key: 0x99,
            alarm_sequence_number: 0,
            control_command: ControlCommand::PRM_END,
            control_block_properties: 0,
        };
        let mut w = BlockWriter::new(64);
        block.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(26, bytes.len());
        let mut r = BlockReader::new(&bytes);
        assert_eq!(block, ControlBlock::decode(&mut r));
        assert!(r.result().is_ok());
    }

    #[test]
    fn unknown_command_bits_are_dropped() {
        let mut w = BlockWriter::new(32);
        w.put_padding(2).unwrap();
        w.put_uuid(&PnetUuid::nil()).unwrap();
        w.put_u16(0).unwrap();
        w.put_u16(0).unwrap();
        w.put_u16(0xFF08).unwrap();
        w.put_u16(0).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let block = ControlBlock::decode(&mut r);
        assert!(block.control_command.contains(ControlCommand::DONE));
    }
}
