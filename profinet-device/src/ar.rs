// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Application Relations and their runtime IOCR layout.

use pnet_types::blocks::alarm::AlarmCrRequest;
use pnet_types::blocks::ar::{ArParam, ArResult, ArServer};
use pnet_types::blocks::exp_ident::{ExpectedIdent, ModuleDiffBlock};
use pnet_types::blocks::iocr::{IocrParam, IocrResult};

use crate::alarm::{AlarmQueue, Alpmx, Apmx};
use crate::cmdev::CmdevState;

/// Opaque AR endpoint reference, assigned by the device. Stable for the
/// whole lifetime of the AR.
pub type Arep = u32;

/// Number of simultaneous ARs supported.
pub const MAX_ARS: usize = 2;
/// Number of CRs per AR (input, output and room for multicast variants).
pub const MAX_CRS: usize = 4;

/// Primary / backup role of an AR in a redundant pair. Without system
/// redundancy an AR is always primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArRole {
    /// The AR is primary; records are writable.
    #[default]
    Primary,
    /// Backup AR; record writes are refused with AccessBackup.
    Backup,
}

/// One IO data object inside an IOCR: the byte layout of a subslot's data
/// and status within the cyclic frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IodataObject {
    /// API identifier.
    pub api_id: u32,
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Offset of the cyclic data.
    pub data_offset: u16,
    /// Length of the cyclic data.
    pub data_length: u16,
    /// Offset of the provider status byte(s).
    pub iops_offset: u16,
    /// Length of the provider status.
    pub iops_length: u16,
    /// Offset of the consumer status byte(s).
    pub iocs_offset: u16,
    /// Length of the consumer status.
    pub iocs_length: u16,
    /// The application staged data or IOPS for this object.
    pub data_avail: bool,
    /// Staged input data (provider direction).
    pub data: Vec<u8>,
    /// Staged provider status.
    pub iops: u8,
    /// Staged consumer status.
    pub iocs: u8,
}

/// An IOCR: the controller's parameters, the negotiated result and the
/// computed per-subslot layout.
#[derive(Debug, Clone, Default)]
pub struct Iocr {
    /// Parameters from the Connect request.
    pub param: IocrParam,
    /// The negotiated response values.
    pub result: IocrResult,
    /// Computed IO data objects.
    pub data_desc: Vec<IodataObject>,
    /// Total bytes carried in the input direction.
    pub in_length: u16,
    /// Total bytes carried in the output direction.
    pub out_length: u16,
}

impl Iocr {
    /// Find the data object of a subslot.
    pub fn find_desc(&self, api_id: u32, slot_number: u16, subslot_number: u16) -> Option<usize> {
        self.data_desc.iter().position(|d| {
            d.api_id == api_id
                && d.slot_number == slot_number
                && d.subslot_number == subslot_number
        })
    }
}

/// An Application Relation.
pub struct Ar {
    /// The endpoint reference the device assigned.
    pub arep: Arep,
    /// AR parameters from the Connect request.
    pub ar_param: ArParam,
    /// Whether an AR block was present in the Connect.
    pub has_ar_param: bool,
    /// The AR response values.
    pub ar_result: ArResult,
    /// The AR server block (our station name).
    pub ar_server: ArServer,
    /// The communication relations.
    pub iocrs: Vec<Iocr>,
    /// Number of input (provider) CRs.
    pub input_cr_cnt: usize,
    /// Number of output (consumer) CRs.
    pub output_cr_cnt: usize,
    /// The alarm CR request, when one was present.
    pub alarm_cr_request: Option<AlarmCrRequest>,
    /// Number of alarm CR blocks seen; exactly one is valid.
    pub nbr_alarm_cr: usize,
    /// Our alarm CR response.
    pub alarm_cr_result: pnet_types::blocks::alarm::AlarmCrResult,
    /// The initiator's RPC server port, when an RPC block was present.
    pub rpc_initiator_port: Option<u16>,
    /// The accumulated expected configuration.
    pub exp_ident: ExpectedIdent,
    /// The generated module diff.
    pub diff: ModuleDiffBlock,
    /// Connection state.
    pub cmdev_state: CmdevState,
    /// Primary / backup role.
    pub role: ArRole,
    /// CPM reported consumer data possible.
    pub ready_4_data: bool,
    /// Alarm transmission enabled (on Application Ready confirmation).
    pub alarm_enable: bool,
    /// ERRCLS of the most recent failure.
    pub err_cls: u8,
    /// ERRCODE of the most recent failure.
    pub err_code: u8,
    /// Alarm protocol machines, low prio at 0, high prio at 1.
    pub alpmx: [Alpmx; 2],
    /// Acknowledge protocol machines, low prio at 0, high prio at 1.
    pub apmx: [Apmx; 2],
    /// Outbound alarm queues per priority.
    pub alarm_send_q: [AlarmQueue; 2],
}

impl Ar {
    /// A fresh AR for an incoming Connect.
    pub fn new(arep: Arep) -> Self {
        Self {
            arep,
            ar_param: ArParam::default(),
            has_ar_param: false,
            ar_result: ArResult::default(),
            ar_server: ArServer::default(),
            iocrs: Vec::new(),
            input_cr_cnt: 0,
            output_cr_cnt: 0,
            alarm_cr_request: None,
            nbr_alarm_cr: 0,
            alarm_cr_result: Default::default(),
            rpc_initiator_port: None,
            exp_ident: ExpectedIdent::default(),
            diff: ModuleDiffBlock::default(),
            cmdev_state: CmdevState::PowerOn,
            role: ArRole::Primary,
            ready_4_data: false,
            alarm_enable: false,
            err_cls: 0,
            err_code: 0,
            alpmx: [Alpmx::default(), Alpmx::default()],
            apmx: [Apmx::new(false), Apmx::new(true)],
            alarm_send_q: [AlarmQueue::default(), AlarmQueue::default()],
        }
    }

    /// The session key from the AR parameters.
    pub fn session_key(&self) -> u16 {
        self.ar_param.session_key
    }

    /// The controller's MAC address.
    pub fn peer_mac(&self) -> [u8; 6] {
        self.ar_param.cm_initiator_mac
    }

    /// The CR carrying a given FrameID, if any.
    pub fn iocr_by_frame_id(&self, frame_id: u16) -> Option<&Iocr> {
        self.iocrs.iter().find(|cr| cr.param.frame_id == frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ar_is_powered_on() {
        let ar = Ar::new(1);
        assert_eq!(CmdevState::PowerOn, ar.cmdev_state);
        assert!(!ar.alarm_enable);
        assert_eq!(ArRole::Primary, ar.role);
        assert!(!ar.apmx[0].high_priority);
        assert!(ar.apmx[1].high_priority);
    }

    #[test]
    fn find_desc_by_address() {
        let mut iocr = Iocr::default();
        iocr.data_desc.push(IodataObject {
            api_id: 0,
            slot_number: 1,
            subslot_number: 1,
            ..Default::default()
        });
        assert_eq!(Some(0), iocr.find_desc(0, 1, 1));
        assert_eq!(None, iocr.find_desc(0, 1, 2));
    }
}
