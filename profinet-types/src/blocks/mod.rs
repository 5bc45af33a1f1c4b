// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Typed PROFINET blocks.
//!
//! Every block on the wire starts with the 6-byte header
//! `{type u16 | length u16 | version_high u8 | version_low u8}`. The
//! composite readers in the submodules deliberately do not consume that
//! header; the dispatcher reads it and selects the reader from the type
//! code.

pub mod alarm;
pub mod ar;
pub mod control;
pub mod exp_ident;
pub mod im;
pub mod iocr;
pub mod port;
pub mod record;
pub mod rpc;

use crate::{BlockReader, BlockWriter, LenSlot, WriteError};

/// Block type codes.
pub mod block_type {
    /// Alarm notification, high priority.
    pub const ALARM_NOTIFICATION_HIGH: u16 = 0x0001;
    /// Alarm notification, low priority.
    pub const ALARM_NOTIFICATION_LOW: u16 = 0x0002;
    /// IODWriteReqHeader.
    pub const IOD_WRITE_REQ_HEADER: u16 = 0x0008;
    /// IODReadReqHeader.
    pub const IOD_READ_REQ_HEADER: u16 = 0x0009;
    /// I&M0 record.
    pub const IM_0: u16 = 0x0020;
    /// I&M1 record.
    pub const IM_1: u16 = 0x0021;
    /// I&M2 record.
    pub const IM_2: u16 = 0x0022;
    /// I&M3 record.
    pub const IM_3: u16 = 0x0023;
    /// I&M4 record.
    pub const IM_4: u16 = 0x0024;
    /// ARBlockReq.
    pub const AR_BLOCK_REQ: u16 = 0x0101;
    /// IOCRBlockReq.
    pub const IOCR_BLOCK_REQ: u16 = 0x0102;
    /// AlarmCRBlockReq.
    pub const ALARM_CR_BLOCK_REQ: u16 = 0x0103;
    /// ExpectedSubmoduleBlockReq.
    pub const EXPECTED_SUBMODULE_BLOCK: u16 = 0x0104;
    /// PrmServerBlockReq (recognised, not implemented).
    pub const PRM_SERVER_BLOCK_REQ: u16 = 0x0105;
    /// MCRBlockReq (recognised, not implemented).
    pub const MCR_BLOCK_REQ: u16 = 0x0106;
    /// ARRPCBlockReq.
    pub const AR_RPC_BLOCK_REQ: u16 = 0x0107;
    /// DControl PrmEnd request.
    pub const PRM_END_REQ: u16 = 0x0110;
    /// CControl ApplicationReady request (device to controller).
    pub const APP_READY_REQ: u16 = 0x0112;
    /// Release block request.
    pub const RELEASE_BLOCK_REQ: u16 = 0x0114;
    /// PDPortDataCheck.
    pub const PDPORT_DATA_CHECK: u16 = 0x0200;
    /// PDPortDataAdjust.
    pub const PDPORT_DATA_ADJUST: u16 = 0x0202;
    /// CheckPeers.
    pub const CHECKPEERS: u16 = 0x020A;
    /// AdjustPeerToPeerBoundary.
    pub const PEER_TO_PEER_BOUNDARY: u16 = 0x0224;
    /// PDInterfaceAdjust.
    pub const INTERFACE_ADJUST: u16 = 0x0250;

    /// Alarm acknowledge, high priority.
    pub const ALARM_ACK_HIGH: u16 = 0x8001;
    /// Alarm acknowledge, low priority.
    pub const ALARM_ACK_LOW: u16 = 0x8002;
    /// IODWriteResHeader.
    pub const IOD_WRITE_RES_HEADER: u16 = 0x8008;
    /// IODReadResHeader.
    pub const IOD_READ_RES_HEADER: u16 = 0x8009;
    /// ARBlockRes.
    pub const AR_BLOCK_RES: u16 = 0x8101;
    /// IOCRBlockRes.
    pub const IOCR_BLOCK_RES: u16 = 0x8102;
    /// AlarmCRBlockRes.
    pub const ALARM_CR_BLOCK_RES: u16 = 0x8103;
    /// ModuleDiffBlock.
    pub const MODULE_DIFF_BLOCK: u16 = 0x8104;
    /// ARServerBlock.
    pub const AR_SERVER_BLOCK: u16 = 0x8106;
    /// ARRPCBlockRes.
    pub const AR_RPC_BLOCK_RES: u16 = 0x8107;
    /// DControl PrmEnd response.
    pub const PRM_END_RES: u16 = 0x8110;
    /// CControl ApplicationReady response.
    pub const APP_READY_RES: u16 = 0x8112;
    /// Release block response.
    pub const RELEASE_BLOCK_RES: u16 = 0x8114;
}

/// Record data indices routed by the write/read record paths.
pub mod index {
    /// Highest index owned by the application.
    pub const USER_MAX: u16 = 0x7FFF;
    /// PDPortDataReal.
    pub const SUB_PDPORT_DATA_REAL: u16 = 0x802A;
    /// PDPortDataCheck.
    pub const SUB_PDPORT_DATA_CHECK: u16 = 0x802B;
    /// PDPortDataAdjust.
    pub const SUB_PDPORT_DATA_ADJ: u16 = 0x802F;
    /// I&M0.
    pub const SUB_IM_0: u16 = 0xAFF0;
    /// I&M1.
    pub const SUB_IM_1: u16 = 0xAFF1;
    /// I&M2.
    pub const SUB_IM_2: u16 = 0xAFF2;
    /// I&M3.
    pub const SUB_IM_3: u16 = 0xAFF3;
    /// I&M4.
    pub const SUB_IM_4: u16 = 0xAFF4;
    /// Last index of the I&M window.
    pub const SUB_IM_15: u16 = 0xAFFF;
    /// Device log book.
    pub const DEV_LOGBOOK_DATA: u16 = 0xF830;
}

/// The common 6-byte block header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block type code, see [`block_type`].
    pub block_type: u16,
    /// Number of bytes following the length field.
    pub block_length: u16,
    /// Version, high byte.
    pub version_high: u8,
    /// Version, low byte.
    pub version_low: u8,
}

impl BlockHeader {
    /// Read the header. This is the dispatch point for all composite
    /// blocks.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            block_type: r.get_u16(),
            block_length: r.get_u16(),
            version_high: r.get_u8(),
            version_low: r.get_u8(),
        }
    }
}

/// Begin a block: write type, reserve the length field and write version
/// 1.0. Returns the slot to patch with [`end_block`] once the body is
/// written.
pub fn begin_block(w: &mut BlockWriter, block_type: u16) -> Result<LenSlot, WriteError> {
    w.put_u16(block_type)?;
    let slot = w.reserve_u16()?;
    w.put_u8(1)?;
    w.put_u8(0)?;
    Ok(slot)
}

/// Patch the block length reserved by [`begin_block`].
pub fn end_block(w: &mut BlockWriter, slot: LenSlot) {
    w.patch_u16_len(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockReader, BlockWriter};

    #[test]
    fn block_header_length_covers_version_and_body() {
        let mut w = BlockWriter::new(64);
        let slot = begin_block(&mut w, block_type::AR_BLOCK_RES).unwrap();
        w.put_u32(0x11223344).unwrap();
        end_block(&mut w, slot);

        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let hdr = BlockHeader::decode(&mut r);
        assert_eq!(block_type::AR_BLOCK_RES, hdr.block_type);
        // Version (2) + body (4).
        assert_eq!(6, hdr.block_length);
        assert_eq!((1, 0), (hdr.version_high, hdr.version_low));
        assert_eq!(0x11223344, r.get_u32());
        assert!(r.result().is_ok());
    }
}
