// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! IODRead / IODWrite record request and response headers.
//!
//! Both headers are padded so the whole block, including the block header,
//! is 64 bytes.

use crate::{BlockReader, BlockWriter, PnetUuid, PnioStatus, WriteError};

/// IODReadReqHeader body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRequest {
    /// Request sequence number.
    pub sequence_number: u16,
    /// The AR the read belongs to (nil for implicit reads).
    pub ar_uuid: PnetUuid,
    /// API identifier.
    pub api: u32,
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Record index.
    pub index: u16,
    /// Maximum record data length the controller accepts.
    pub record_data_length: u32,
    /// Target AR UUID for implicit reads.
    pub target_ar_uuid: PnetUuid,
}

impl ReadRequest {
    /// Read an IODReadReqHeader body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let sequence_number = r.get_u16();
        let ar_uuid = r.get_uuid();
        let api = r.get_u32();
        let slot_number = r.get_u16();
        let subslot_number = r.get_u16();
        r.skip(2);
        let index = r.get_u16();
        let record_data_length = r.get_u32();
        let target_ar_uuid = r.get_uuid();
        r.skip(8);
        Self {
            sequence_number,
            ar_uuid,
            api,
            slot_number,
            subslot_number,
            index,
            record_data_length,
            target_ar_uuid,
        }
    }

    /// Write an IODReadReqHeader body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.sequence_number)?;
        w.put_uuid(&self.ar_uuid)?;
        w.put_u32(self.api)?;
        w.put_u16(self.slot_number)?;
        w.put_u16(self.subslot_number)?;
        w.put_padding(2)?;
        w.put_u16(self.index)?;
        w.put_u32(self.record_data_length)?;
        w.put_uuid(&self.target_ar_uuid)?;
        w.put_padding(8)
    }
}

/// IODWriteReqHeader body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteRequest {
    /// Request sequence number.
    pub sequence_number: u16,
    /// The AR the write belongs to.
    pub ar_uuid: PnetUuid,
    /// API identifier.
    pub api: u32,
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Record index.
    pub index: u16,
    /// Length of the record data following the header.
    pub record_data_length: u32,
}

impl WriteRequest {
    /// Read an IODWriteReqHeader body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let sequence_number = r.get_u16();
        let ar_uuid = r.get_uuid();
        let api = r.get_u32();
        let slot_number = r.get_u16();
        let subslot_number = r.get_u16();
        r.skip(2);
        let index = r.get_u16();
        let record_data_length = r.get_u32();
        r.skip(24);
        Self {
            sequence_number,
            ar_uuid,
            api,
            slot_number,
            subslot_number,
            index,
            record_data_length,
        }
    }

    /// Write an IODWriteReqHeader body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.sequence_number)?;
        w.put_uuid(&self.ar_uuid)?;
        w.put_u32(self.api)?;
        w.put_u16(self.slot_number)?;
        w.put_u16(self.subslot_number)?;
        w.put_padding(2)?;
        w.put_u16(self.index)?;
        w.put_u32(self.record_data_length)?;
        w.put_padding(24)
    }
}

/// IODReadResHeader body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadResult {
    /// Echoed sequence number.
    pub sequence_number: u16,
    /// Echoed AR UUID.
    pub ar_uuid: PnetUuid,
    /// Echoed API.
    pub api: u32,
    /// Echoed slot.
    pub slot_number: u16,
    /// Echoed subslot.
    pub subslot_number: u16,
    /// Echoed index.
    pub index: u16,
    /// Length of the record data following the header.
    pub record_data_length: u32,
    /// AdditionalValue1.
    pub add_data_1: u16,
    /// AdditionalValue2.
    pub add_data_2: u16,
}

impl ReadResult {
    /// Read an IODReadResHeader body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let sequence_number = r.get_u16();
        let ar_uuid = r.get_uuid();
        let api = r.get_u32();
        let slot_number = r.get_u16();
        let subslot_number = r.get_u16();
        r.skip(2);
        let index = r.get_u16();
        let record_data_length = r.get_u32();
        let add_data_1 = r.get_u16();
        let add_data_2 = r.get_u16();
        r.skip(20);
        Self {
            sequence_number,
            ar_uuid,
            api,
            slot_number,
            subslot_number,
            index,
            record_data_length,
            add_data_1,
            add_data_2,
        }
    }

    /// Write an IODReadResHeader body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.sequence_number)?;
        w.put_uuid(&self.ar_uuid)?;
        w.put_u32(self.api)?;
        w.put_u16(self.slot_number)?;
        w.put_u16(self.subslot_number)?;
        w.put_padding(2)?;
        w.put_u16(self.index)?;
        w.put_u32(self.record_data_length)?;
        w.put_u16(self.add_data_1)?;
        w.put_u16(self.add_data_2)?;
        w.put_padding(20)
    }
}

/// IODWriteResHeader body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Echoed sequence number.
    pub sequence_number: u16,
    /// Echoed AR UUID.
    pub ar_uuid: PnetUuid,
    /// Echoed API.
    pub api: u32,
    /// Echoed slot.
    pub slot_number: u16,
    /// Echoed subslot.
    pub subslot_number: u16,
    /// Echoed index.
    pub index: u16,
    /// Length of the written record data.
    pub record_data_length: u32,
    /// AdditionalValue1.
    pub add_data_1: u16,
    /// AdditionalValue2.
    pub add_data_2: u16,
    /// The write outcome.
    pub pnio_status: PnioStatus,
}

impl WriteResult {
    /// Read an IODWriteResHeader body.
    pub fn decode(r: &mut BlockReader) -> Self {
        let sequence_number = r.get_u16();
        let ar_uuid = r.get_uuid();
        let api = r.get_u32();
        let slot_number = r.get_u16();
        let subslot_number = r.get_u16();
        r.skip(2);
        let index = r.get_u16();
        let record_data_length = r.get_u32();
        let add_data_1 = r.get_u16();
        let add_data_2 = r.get_u16();
        let pnio_status = PnioStatus::decode(r);
        r.skip(16);
        Self {
            sequence_number,
            ar_uuid,
            api,
            slot_number,
            subslot_number,
            index,
            record_data_length,
            add_data_1,
            add_data_2,
            pnio_status,
        }
    }

    /// Write an IODWriteResHeader body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u16(self.sequence_number)?;
        w.put_uuid(&self.ar_uuid)?;
        w.put_u32(self.api)?;
        w.put_u16(self.slot_number)?;
        w.put_u16(self.subslot_number)?;
        w.put_padding(2)?;
        w.put_u16(self.index)?;
        w.put_u32(self.record_data_length)?;
        w.put_u16(self.add_data_1)?;
        w.put_u16(self.add_data_2)?;
        self.pnio_status.encode(w)?;
        w.put_padding(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_body_is_58_bytes() {
        let req = WriteRequest {
            sequence_number: 1,
            ar_uuid: PnetUuid::from_fields(1, 2, 3, [0; 8]),
            api: 0,
            slot_number: 1,
            subslot_number: 1,
            index: super::super::index::SUB_IM_1,
            record_data_length: 54,
        };
        let mut w = BlockWriter::new(128);
        req.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        // 64-byte block minus the 6-byte block header.
        assert_eq!(58, bytes.len());
        let mut r = BlockReader::new(&bytes);
        assert_eq!(req, WriteRequest::decode(&mut r));
        assert!(r.result().is_ok());
    }

    #[test]
    fn read_request_round_trip() {
        let req = ReadRequest {
            sequence_number: 9,
            ar_uuid: PnetUuid::nil(),
            api: 0,
            slot_number: 0,
            subslot_number: 1,
            index: super::super::index::SUB_IM_0,
            record_data_length: 4096,
            target_ar_uuid: PnetUuid::from_fields(9, 9, 9, [9; 8]),
        };
        let mut w = BlockWriter::new(128);
        req.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(58, bytes.len());
        let mut r = BlockReader::new(&bytes);
        assert_eq!(req, ReadRequest::decode(&mut r));
    }

    #[test]
    fn write_result_carries_status() {
        let result = WriteResult {
            sequence_number: 2,
            pnio_status: PnioStatus::new(0xDF, 0x80, 0xB6, 0),
            ..Default::default()
        };
        let mut w = BlockWriter::new(128);
        result.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(58, bytes.len());
        let mut r = BlockReader::new(&bytes);
        let decoded = WriteResult::decode(&mut r);
        assert_eq!(result, decoded);
        assert_eq!(0xB6, decoded.pnio_status.error_code_1);
    }
}
