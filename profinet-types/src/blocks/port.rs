// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! PDPortDataCheck / PDPortDataAdjust records and their inner blocks.

use bitflags::bitflags;
use log::error;

use crate::blocks::{begin_block, block_type, end_block, BlockHeader};
use crate::{BlockReader, BlockWriter, WriteError};

/// Longest peer port or station name accepted.
pub const PEER_NAME_MAX_LEN: usize = 240;

/// The outer PDPortDataCheck record: the addressed subslot plus the inner
/// block header, which selects the check payload (CheckPeers).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortDataCheck {
    /// Slot number of the port submodule.
    pub slot_number: u16,
    /// Subslot number of the port submodule.
    pub subslot_number: u16,
    /// The inner block header.
    pub block_header: BlockHeader,
}

impl PortDataCheck {
    /// Read the outer record: 2 bytes padding, the address, the inner
    /// header.
    pub fn decode(r: &mut BlockReader) -> Self {
        r.skip(2);
        Self {
            slot_number: r.get_u16(),
            subslot_number: r.get_u16(),
            block_header: BlockHeader::decode(r),
        }
    }
}

/// One expected peer: port id and chassis (station) id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckPeer {
    /// Peer port name.
    pub peer_port_name: String,
    /// Peer station name.
    pub peer_station_name: String,
}

impl CheckPeer {
    fn decode(r: &mut BlockReader) -> Self {
        let port_len = r.get_u8();
        let peer_port_name = r.get_string(port_len as usize, PEER_NAME_MAX_LEN);
        let station_len = r.get_u8();
        let peer_station_name = r.get_string(station_len as usize, PEER_NAME_MAX_LEN);
        Self {
            peer_port_name,
            peer_station_name,
        }
    }

    fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u8(self.peer_port_name.len() as u8)?;
        w.put_mem(self.peer_port_name.as_bytes())?;
        w.put_u8(self.peer_station_name.len() as u8)?;
        w.put_mem(self.peer_station_name.as_bytes())
    }

    /// True when both names are empty.
    pub fn is_empty(&self) -> bool {
        self.peer_port_name.is_empty() && self.peer_station_name.is_empty()
    }
}

/// The CheckPeers block body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckPeers {
    /// Expected peers; the device evaluates the first one.
    pub peers: Vec<CheckPeer>,
}

impl CheckPeers {
    /// Read a CheckPeers body, keeping at most `max_peers` entries.
    pub fn decode(r: &mut BlockReader, max_peers: usize) -> Self {
        let mut count = r.get_u8() as usize;
        if count > max_peers {
            error!("unsupported number of check peers: {}", count);
            count = max_peers;
        }
        let peers = (0..count).map(|_| CheckPeer::decode(r)).collect();
        Self { peers }
    }

    /// Write a CheckPeers body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u8(self.peers.len() as u8)?;
        for peer in &self.peers {
            peer.encode(w)?;
        }
        Ok(())
    }

    /// Write the full PDPortDataCheck record for a read-back response.
    pub fn encode_record(
        &self,
        w: &mut BlockWriter,
        slot_number: u16,
        subslot_number: u16,
    ) -> Result<(), WriteError> {
        let outer = begin_block(w, block_type::PDPORT_DATA_CHECK)?;
        w.put_padding(2)?;
        w.put_u16(slot_number)?;
        w.put_u16(subslot_number)?;
        let inner = begin_block(w, block_type::CHECKPEERS)?;
        self.encode(w)?;
        end_block(w, inner);
        end_block(w, outer);
        Ok(())
    }
}

/// The outer PDPortDataAdjust record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortDataAdjust {
    /// Slot number of the port submodule.
    pub slot_number: u16,
    /// Subslot number of the port submodule.
    pub subslot_number: u16,
    /// The inner block header.
    pub block_header: BlockHeader,
}

impl PortDataAdjust {
    /// Read the outer record.
    pub fn decode(r: &mut BlockReader) -> Self {
        r.skip(2);
        Self {
            slot_number: r.get_u16(),
            subslot_number: r.get_u16(),
            block_header: BlockHeader::decode(r),
        }
    }
}

bitflags! {
    /// The peer-to-peer boundary word.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BoundaryFlags: u32 {
        /// Do not send LLDP frames on this port.
        const DO_NOT_SEND_LLDP = 1 << 0;
        /// Do not send PTCP delay request frames.
        const DO_NOT_SEND_PTCP_DELAY_REQUEST = 1 << 1;
        /// Do not send path delay request frames.
        const DO_NOT_SEND_PATH_DELAY_REQUEST = 1 << 2;
    }
}

/// The AdjustPeerToPeerBoundary block body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerToPeerBoundary {
    /// The boundary bits.
    pub boundary: BoundaryFlags,
    /// Adjust properties word.
    pub adjust_properties: u16,
}

impl PeerToPeerBoundary {
    /// Read the body: 2 bytes padding, the boundary word, the properties.
    pub fn decode(r: &mut BlockReader) -> Self {
        r.skip(2);
        let boundary = BoundaryFlags::from_bits_truncate(r.get_u32());
        let adjust_properties = r.get_u16();
        Self {
            boundary,
            adjust_properties,
        }
    }

    /// Write the body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_padding(2)?;
        w.put_u32(self.boundary.bits())?;
        w.put_u16(self.adjust_properties)
    }

    /// Write the full PDPortDataAdjust record for a read-back response.
    pub fn encode_record(
        &self,
        w: &mut BlockWriter,
        slot_number: u16,
        subslot_number: u16,
    ) -> Result<(), WriteError> {
        let outer = begin_block(w, block_type::PDPORT_DATA_ADJUST)?;
        w.put_padding(2)?;
        w.put_u16(slot_number)?;
        w.put_u16(subslot_number)?;
        let inner = begin_block(w, block_type::PEER_TO_PEER_BOUNDARY)?;
        self.encode(w)?;
        end_block(w, inner);
        end_block(w, outer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_peers_record_round_trip() {
        let peers = CheckPeers {
            peers: vec![CheckPeer {
                peer_port_name: "port-003".to_string(),
                peer_station_name: "b".to_string(),
            }],
        };
        let mut w = BlockWriter::new(128);
        peers.encode_record(&mut w, 0, 0x8001).unwrap();
        let bytes = w.into_vec();

        let mut r = BlockReader::new(&bytes);
        let check = PortDataCheck::decode(&mut r);
        assert_eq!(0x8001, check.subslot_number);
        assert_eq!(block_type::CHECKPEERS, check.block_header.block_type);
        let decoded = CheckPeers::decode(&mut r, 4);
        assert!(r.result().is_ok());
        assert_eq!(peers, decoded);
    }

    #[test]
    fn check_peers_clamps_count() {
        let peers = CheckPeers {
            peers: vec![
                CheckPeer {
                    peer_port_name: "p1".into(),
                    peer_station_name: "s1".into(),
                },
                CheckPeer {
                    peer_port_name: "p2".into(),
                    peer_station_name: "s2".into(),
                },
            ],
        };
        let mut w = BlockWriter::new(128);
        peers.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        let decoded = CheckPeers::decode(&mut r, 1);
        assert_eq!(1, decoded.peers.len());
        assert_eq!("p1", decoded.peers[0].peer_port_name);
    }

    #[test]
    fn boundary_round_trip() {
        let boundary = PeerToPeerBoundary {
            boundary: BoundaryFlags::DO_NOT_SEND_LLDP,
            adjust_properties: 0,
        };
        let mut w = BlockWriter::new(64);
        boundary.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(8, bytes.len());
        let mut r = BlockReader::new(&bytes);
        assert_eq!(boundary, PeerToPeerBoundary::decode(&mut r));
    }
}
