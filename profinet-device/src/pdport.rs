// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! PDPort: physical-port identity, the expected-peer check and the
//! peer-to-peer boundary, persisted per port.

use std::path::Path;

use log::{error, info};

use pnet_core::files;
use pnet_types::blocks::port::{CheckPeer, CheckPeers, PeerToPeerBoundary};
use pnet_types::{BlockReader, BlockWriter, WriteError};

/// Nonvolatile file holding the expected peer of port 1.
pub const FILENAME_PDPORT_1: &str = "pdport-1.dat";

/// Subslot of the DAP carrying port 1.
pub const SUBSLOT_DAP_PORT_1: u16 = 0x8001;

/// State of the single local port.
#[derive(Debug, Clone, Default)]
pub struct PdPort {
    /// The expected peer written by the controller (or loaded from nvm).
    pub expected_peer: CheckPeer,
    /// The peer check is armed.
    pub check_active: bool,
    /// The adjusted peer-to-peer boundary.
    pub boundary: PeerToPeerBoundary,
    /// A boundary adjustment is active.
    pub adjust_active: bool,
    /// The neighbour most recently observed by LLDP.
    pub lldp_peer: Option<CheckPeer>,
}

fn encode_peer(peer: &CheckPeer) -> Vec<u8> {
    let mut w = BlockWriter::new(512);
    let encoded = (|| {
        w.put_u8(peer.peer_port_name.len() as u8)?;
        w.put_mem(peer.peer_port_name.as_bytes())?;
        w.put_u8(peer.peer_station_name.len() as u8)?;
        w.put_mem(peer.peer_station_name.as_bytes())?;
        Ok::<(), WriteError>(())
    })();
    if encoded.is_err() {
        error!("expected peer too long to persist");
    }
    w.into_vec()
}

fn decode_peer(data: &[u8]) -> Option<CheckPeer> {
    let mut r = BlockReader::new(data);
    let port_len = r.get_u8();
    let peer_port_name = r.get_string(port_len as usize, 255);
    let station_len = r.get_u8();
    let peer_station_name = r.get_string(station_len as usize, 255);
    r.result().ok()?;
    Some(CheckPeer {
        peer_port_name,
        peer_station_name,
    })
}

impl PdPort {
    /// Load the stored peer check; create the file when missing.
    pub fn init(&mut self, directory: &Path) {
        match files::load(directory, FILENAME_PDPORT_1).and_then(|data| decode_peer(&data)) {
            Some(peer) => {
                info!("read PDPort settings from nonvolatile storage");
                self.check_active = !peer.is_empty();
                self.expected_peer = peer;
            }
            None => {
                self.save(directory);
            }
        }
    }

    /// Persist the expected peer when the stored content differs.
    pub fn save(&self, directory: &Path) {
        let data = encode_peer(&self.expected_peer);
        if let Err(e) = files::save_if_modified(directory, FILENAME_PDPORT_1, &data) {
            error!("failed to store PDPort settings: {}", e);
        }
    }

    /// Clear the configuration and the stored file (factory reset).
    pub fn reset(&mut self, directory: &Path) {
        files::clear(directory, FILENAME_PDPORT_1);
        self.expected_peer = CheckPeer::default();
        self.check_active = false;
        self.boundary = PeerToPeerBoundary::default();
        self.adjust_active = false;
    }

    /// Arm the peer check with a newly written expected peer.
    pub fn set_expected_peer(&mut self, peer: CheckPeer) {
        self.expected_peer = peer;
        self.check_active = true;
    }

    /// Store a written boundary adjustment.
    pub fn set_boundary(&mut self, boundary: PeerToPeerBoundary) {
        self.boundary = boundary;
        self.adjust_active = true;
    }

    /// Record the neighbour observed by the external LLDP collaborator.
    pub fn set_lldp_peer(&mut self, peer: Option<CheckPeer>) {
        self.lldp_peer = peer;
    }

    /// Encode the PDPortDataCheck record for a read, when armed.
    pub fn read_check(&self, w: &mut BlockWriter) -> Result<bool, WriteError> {
        if !self.check_active {
            return Ok(false);
        }
        CheckPeers {
            peers: vec![self.expected_peer.clone()],
        }
        .encode_record(w, 0, SUBSLOT_DAP_PORT_1)?;
        Ok(true)
    }

    /// Encode the PDPortDataAdjust record for a read, when armed.
    pub fn read_adjust(&self, w: &mut BlockWriter) -> Result<bool, WriteError> {
        if !self.adjust_active {
            return Ok(false);
        }
        self.boundary.encode_record(w, 0, SUBSLOT_DAP_PORT_1)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: &str, station: &str) -> CheckPeer {
        CheckPeer {
            peer_port_name: port.to_string(),
            peer_station_name: station.to_string(),
        }
    }

    #[test]
    fn peer_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut port = PdPort::default();
            port.init(dir.path());
            assert!(!port.check_active);
            port.set_expected_peer(peer("port-003", "plc-1"));
            port.save(dir.path());
        }
        let mut port = PdPort::default();
        port.init(dir.path());
        assert!(port.check_active);
        assert_eq!(peer("port-003", "plc-1"), port.expected_peer);
    }

    #[test]
    fn reset_clears_file_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = PdPort::default();
        port.init(dir.path());
        port.set_expected_peer(peer("p", "s"));
        port.save(dir.path());

        port.reset(dir.path());
        assert!(!port.check_active);
        let mut fresh = PdPort::default();
        fresh.init(dir.path());
        assert!(!fresh.check_active);
        assert!(fresh.expected_peer.is_empty());
    }

    #[test]
    fn read_back_when_armed_only() {
        let mut port = PdPort::default();
        let mut w = BlockWriter::new(256);
        assert!(!port.read_check(&mut w).unwrap());
        port.set_expected_peer(peer("port-001", "plc-9"));
        assert!(port.read_check(&mut w).unwrap());
        assert!(w.pos() > 0);
    }
}
