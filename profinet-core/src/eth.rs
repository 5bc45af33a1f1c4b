// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Ethernet framing for acyclic PROFINET traffic.
//!
//! Builds the VLAN-tagged header in front of a FrameID-addressed payload
//! and defines the outbound sink wired in at construction. Raw Ethernet
//! I/O itself lives outside the stack; senders return immediately.

use bytes::Bytes;
use thiserror::Error;

use pnet_types::{BlockWriter, WriteError, ETHTYPE_PROFINET, ETHTYPE_VLAN};

/// A MAC address.
pub type MacAddr = [u8; 6];

/// Failure to hand a frame to the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The underlying port rejected the frame.
    #[error("ethernet send failed: {0}")]
    Port(String),
}

/// Outbound Ethernet port. Implementations must not block; queue-and-return
/// is the expected behavior.
pub trait FrameSink {
    /// Hand a complete Ethernet frame to the wire.
    fn send_frame(&mut self, frame: Bytes) -> Result<(), SendError>;
}

/// A sink that records frames instead of sending them. The test double for
/// the whole stack.
#[derive(Default)]
pub struct CapturingSink {
    /// Every frame sent, in order.
    pub frames: Vec<Bytes>,
}

impl FrameSink for CapturingSink {
    fn send_frame(&mut self, frame: Bytes) -> Result<(), SendError> {
        self.frames.push(frame);
        Ok(())
    }
}

/// The Ethernet + VLAN + FrameID prologue of an acyclic PROFINET frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    /// Destination MAC.
    pub dst: MacAddr,
    /// Source MAC.
    pub src: MacAddr,
    /// VLAN priority (PCP); VLAN id is always 0.
    pub vlan_prio: u8,
    /// The FrameID following the EtherType.
    pub frame_id: u16,
}

impl EthHeader {
    /// Size of the emitted prologue: MACs, VLAN tag, EtherType, FrameID.
    pub const WIRE_SIZE: usize = 6 + 6 + 4 + 2 + 2;

    /// Emit the prologue. The caller appends the payload afterwards.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_mem(&self.dst)?;
        w.put_mem(&self.src)?;
        w.put_u16(ETHTYPE_VLAN)?;
        // PCP in the three leftmost bits, VLAN id 0.
        w.put_u16(((self.vlan_prio as u16) & 0x0007) << 13)?;
        w.put_u16(ETHTYPE_PROFINET)?;
        w.put_u16(self.frame_id)
    }
}

/// Read the FrameID out of a received frame, tolerating an optional VLAN
/// tag. Returns the FrameID and the offset of the byte after it.
pub fn frame_id_of(frame: &[u8]) -> Option<(u16, usize)> {
    let ethertype_at = 12;
    let (payload_at, ethertype) = match frame.get(ethertype_at..ethertype_at + 2)? {
        [0x81, 0x00] => {
            let et = frame.get(16..18)?;
            (18, u16::from_be_bytes([et[0], et[1]]))
        }
        et => (14, u16::from_be_bytes([et[0], et[1]])),
    };
    if ethertype != ETHTYPE_PROFINET {
        return None;
    }
    let id = frame.get(payload_at..payload_at + 2)?;
    Some((u16::from_be_bytes([id[0], id[1]]), payload_at + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_types::FRAME_ID_ALARM_LOW;

    #[test]
    fn header_layout() {
        let hdr = EthHeader {
            dst: [0x02, 0, 0, 0, 0, 1],
            src: [0x02, 0, 0, 0, 0, 2],
            vlan_prio: 5,
            frame_id: FRAME_ID_ALARM_LOW,
        };
        let mut w = BlockWriter::new(64);
        hdr.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(EthHeader::WIRE_SIZE, bytes.len());
        // VLAN tag.
        assert_eq!(&[0x81, 0x00, 0xA0, 0x00], &bytes[12..16]);
        // EtherType + FrameID.
        assert_eq!(&[0x88, 0x92, 0xFE, 0x01], &bytes[16..20]);
    }

    #[test]
    fn frame_id_parsing_with_and_without_vlan() {
        let hdr = EthHeader {
            dst: [0; 6],
            src: [0; 6],
            vlan_prio: 6,
            frame_id: 0xFC01,
        };
        let mut w = BlockWriter::new(64);
        hdr.encode(&mut w).unwrap();
        let tagged = w.into_vec();
        assert_eq!(Some((0xFC01, 20)), frame_id_of(&tagged));

        let mut untagged = Vec::new();
        untagged.extend_from_slice(&[0u8; 12]);
        untagged.extend_from_slice(&ETHTYPE_PROFINET.to_be_bytes());
        untagged.extend_from_slice(&0xFE01u16.to_be_bytes());
        assert_eq!(Some((0xFE01, 16)), frame_id_of(&untagged));

        let mut other = untagged.clone();
        other[12] = 0x08;
        other[13] = 0x00;
        assert_eq!(None, frame_id_of(&other));
    }
}
