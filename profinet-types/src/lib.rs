// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! PROFINET IO wire types.
//!
//! Contains the big-endian block reader and writer cursors, the bit-field
//! extractor, the 16-byte DCE-ordered UUID, the PNIO status quadruple with
//! the ERRCLS/ERRCODE taxonomy, and typed decode/encode implementations for
//! every PROFINET block this device stack touches: AR, IOCR, expected
//! ident, alarm CR, RTA frames, control blocks, IODRead/IODWrite record
//! headers, I&M records, PDPort records and the DCE/RPC + NDR headers.
//!
//! Composite block readers do *not* consume the 6-byte block header; the
//! caller reads a [`blocks::BlockHeader`] first and dispatches on its type
//! code.

pub mod blocks;
pub mod codec;
pub mod status;
mod uuid;

pub use codec::{get_bits, BlockReader, BlockWriter, LenSlot, ParseError, WriteError};
pub use status::{PnioStatus, StackError};
pub use uuid::{device_interface_uuid, PnetUuid};

/// EtherType for PROFINET frames.
pub const ETHTYPE_PROFINET: u16 = 0x8892;
/// EtherType for VLAN tagging.
pub const ETHTYPE_VLAN: u16 = 0x8100;
/// EtherType for IP, used as the LT field by UDP-transported CRs.
pub const ETHTYPE_IP: u16 = 0x0800;

/// FrameID carrying high priority alarm frames.
pub const FRAME_ID_ALARM_HIGH: u16 = 0xFC01;
/// FrameID carrying low priority alarm frames.
pub const FRAME_ID_ALARM_LOW: u16 = 0xFE01;
