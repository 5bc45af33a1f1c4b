// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! CMWRR: the IODWrite record router.
//!
//! Dispatches writes by index: application records go to the user
//! callback, the I&M window to FSPM, and the PDPort records to the port
//! check / adjust handlers. The PDPort peer check compares the written
//! expected peer against the observed LLDP neighbour and raises a
//! remote-mismatch diagnosis on difference.

use log::{error, info};

use pnet_types::blocks::port::{CheckPeers, PeerToPeerBoundary, PortDataAdjust, PortDataCheck};
use pnet_types::blocks::record::WriteRequest;
use pnet_types::blocks::{block_type, index};
use pnet_types::status::error_code_1;
use pnet_types::{BlockReader, StackError};

use crate::ar::{Ar, ArRole};
use crate::cmdev::{self, CmdevEvent};
use crate::dev::{ch_prop, CHANNEL_WHOLE_SUBMODULE};
use crate::diag::{self, StdDiagnosis};
use crate::net::Net;

/// Number of expected peers a port check may carry.
pub const CHECK_PEERS_PER_PORT: usize = 1;

/// CMWRR states; one instance per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmwrrState {
    /// No AR in parameterisation.
    #[default]
    Idle,
    /// An AR is being parameterised.
    Startup,
    /// Parameterisation ended; writes are refused.
    PrmEnd,
    /// Cyclic data running; runtime writes allowed.
    Data,
}

/// Track the CMDEV events that move the write window.
pub fn cmdev_state_ind(state: &mut CmwrrState, event: CmdevEvent) {
    *state = match (*state, event) {
        (CmwrrState::Idle, CmdevEvent::Startup) => CmwrrState::Startup,
        (CmwrrState::Startup, CmdevEvent::PrmEnd) => CmwrrState::PrmEnd,
        (CmwrrState::Startup, CmdevEvent::Abort) => CmwrrState::Idle,
        (CmwrrState::PrmEnd, CmdevEvent::Abort) => CmwrrState::Idle,
        (CmwrrState::PrmEnd, CmdevEvent::ApplRdy) => CmwrrState::Data,
        (CmwrrState::Data, CmdevEvent::Abort) => CmwrrState::Idle,
        (state, _) => state,
    };
}

/// RM_Write.ind: gate on the CMWRR state and the AR role, then route.
pub fn rm_write_ind(
    net: &mut Net,
    ar: &mut Ar,
    request: &WriteRequest,
    data: &[u8],
) -> Result<(), StackError> {
    match net.cmwrr_state {
        CmwrrState::Idle | CmwrrState::PrmEnd => {
            Err(StackError::write_access(error_code_1::ACC_STATE_CONFLICT))
        }
        CmwrrState::Startup | CmwrrState::Data => {
            if ar.role == ArRole::Backup {
                Err(StackError::write_access(error_code_1::ACC_BACKUP))
            } else {
                write(net, ar, request, data)
            }
        }
    }
}

fn write(
    net: &mut Net,
    ar: &mut Ar,
    request: &WriteRequest,
    data: &[u8],
) -> Result<(), StackError> {
    if request.index <= index::USER_MAX {
        let arep = ar.arep;
        return net.fspm_write_ind(arep, request, data);
    }
    if (index::SUB_IM_0..=index::SUB_IM_15).contains(&request.index) {
        return net.fspm_write_im(request.index, data);
    }
    match request.index {
        index::SUB_PDPORT_DATA_CHECK => write_port_data_check(net, ar, request, data),
        index::SUB_PDPORT_DATA_ADJ => write_port_data_adjust(net, request, data),
        _ => Err(StackError::write_access(error_code_1::ACC_INVALID_INDEX)),
    }
}

/// PDPortDataCheck: record the expected peer and compare it against the
/// observed LLDP neighbour. On mismatch a remote-mismatch diagnosis is
/// raised and the submodule diff of the AR gains an entry.
fn write_port_data_check(
    net: &mut Net,
    ar: &mut Ar,
    request: &WriteRequest,
    data: &[u8],
) -> Result<(), StackError> {
    let mut r = BlockReader::new(data);
    let check = PortDataCheck::decode(&mut r);
    if check.block_header.block_type != block_type::CHECKPEERS {
        error!(
            "unsupported port data check block type {:#06x}",
            check.block_header.block_type
        );
        return Err(StackError::write_access(error_code_1::ACC_INVALID_INDEX));
    }
    let peers = CheckPeers::decode(&mut r, CHECK_PEERS_PER_PORT);
    if r.result().is_err() {
        error!("failed to parse incoming PDPort data check");
        return Err(StackError::write_access(
            error_code_1::ACC_WRITE_LENGTH_ERROR,
        ));
    }
    let Some(expected) = peers.peers.first().cloned() else {
        error!(
            "wrong number of peers in PDPort data check, slot {} subslot {:#06x}",
            check.slot_number, check.subslot_number
        );
        return Err(StackError::write_access(
            error_code_1::ACC_WRITE_LENGTH_ERROR,
        ));
    };

    info!(
        "PLC writes PDPort data check. Slot {} subslot {:#06x} peer station '{}' port '{}'",
        check.slot_number,
        check.subslot_number,
        expected.peer_station_name,
        expected.peer_port_name
    );
    net.ports.set_expected_peer(expected.clone());
    net.pdport_save();

    // Compare against the observed neighbour.
    let Some(actual) = net.ports.lldp_peer.clone() else {
        return Ok(());
    };
    let mismatch = if actual.peer_station_name != expected.peer_station_name {
        Some(diag::EXT_CHASSISID_MISMATCH)
    } else if actual.peer_port_name != expected.peer_port_name {
        Some(diag::EXT_PORTID_MISMATCH)
    } else {
        None
    };
    let Some(ext_error) = mismatch else {
        return Ok(());
    };

    info!(
        "peer check mismatch on slot {} subslot {:#06x}: expected '{}'/'{}', observed '{}'/'{}'",
        request.slot_number,
        request.subslot_number,
        expected.peer_station_name,
        expected.peer_port_name,
        actual.peer_station_name,
        actual.peer_port_name
    );
    let diagnosis = StdDiagnosis {
        channel_number: CHANNEL_WHOLE_SUBMODULE,
        channel_properties: ch_prop::build(ch_prop::MAINT_FAULT, ch_prop::SPEC_APPEARS),
        channel_error_type: diag::CH_ERROR_REMOTE_MISMATCH,
        ext_channel_error_type: ext_error,
        ext_channel_add_value: 0,
        qualifier: 0,
    };
    let _ = diag::std_add(
        net,
        ar,
        request.api,
        request.slot_number,
        request.subslot_number,
        diagnosis,
        pnet_types::blocks::alarm::usi::EXTENDED_CHANNEL_DIAGNOSIS,
    );
    cmdev::append_submodule_diff(ar, request.api, request.slot_number, request.subslot_number);
    Ok(())
}

/// PDPortDataAdjust: store the peer-to-peer boundary for the port.
fn write_port_data_adjust(
    net: &mut Net,
    _request: &WriteRequest,
    data: &[u8],
) -> Result<(), StackError> {
    let mut r = BlockReader::new(data);
    let adjust = PortDataAdjust::decode(&mut r);
    if adjust.block_header.block_type != block_type::PEER_TO_PEER_BOUNDARY {
        error!(
            "unsupported port data adjust block type {:#06x}",
            adjust.block_header.block_type
        );
        return Err(StackError::write_access(error_code_1::ACC_INVALID_INDEX));
    }
    let boundary = PeerToPeerBoundary::decode(&mut r);
    if r.result().is_err() {
        error!("failed to parse incoming PDPort data adjust");
        return Err(StackError::write_access(
            error_code_1::ACC_WRITE_LENGTH_ERROR,
        ));
    }
    info!(
        "PLC writes PDPort data adjust. Do not send LLDP: {}",
        boundary
            .boundary
            .contains(pnet_types::blocks::port::BoundaryFlags::DO_NOT_SEND_LLDP)
    );
    net.ports.set_boundary(boundary);
    net.pdport_save();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_follows_ar_lifecycle() {
        let mut state = CmwrrState::Idle;
        cmdev_state_ind(&mut state, CmdevEvent::Startup);
        assert_eq!(CmwrrState::Startup, state);
        cmdev_state_ind(&mut state, CmdevEvent::PrmEnd);
        assert_eq!(CmwrrState::PrmEnd, state);
        cmdev_state_ind(&mut state, CmdevEvent::ApplRdy);
        assert_eq!(CmwrrState::Data, state);
        cmdev_state_ind(&mut state, CmdevEvent::Abort);
        assert_eq!(CmwrrState::Idle, state);
    }

    #[test]
    fn unrelated_events_keep_state() {
        let mut state = CmwrrState::Startup;
        cmdev_state_ind(&mut state, CmdevEvent::Data);
        assert_eq!(CmwrrState::Startup, state);
        cmdev_state_ind(&mut state, CmdevEvent::Startup);
        assert_eq!(CmwrrState::Startup, state);
    }
}
