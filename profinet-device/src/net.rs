// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The single owner of the device stack.
//!
//! Everything funnels through one [`Net`] value threaded explicitly
//! through every entry point; there is no process-wide mutable state. The
//! host drives the stack by calling [`Net::handle_periodic`] at the
//! configured device interval; receive callbacks only enqueue onto
//! mailboxes.

use bytes::Bytes;
use log::{debug, error, info};

use pnet_core::eth::{frame_id_of, FrameSink, SendError};
use pnet_core::mbox::Mailbox;
use pnet_core::sched::Scheduler;
use pnet_core::TimeSource;
use pnet_types::blocks::record::{ReadRequest, WriteRequest};
use pnet_types::status::error_code_1;
use pnet_types::{PnetUuid, PnioStatus, StackError, FRAME_ID_ALARM_HIGH, FRAME_ID_ALARM_LOW};

use crate::alarm::{self, AlarmFrame, ApmrState};
use crate::ar::{Ar, Arep, MAX_ARS};
use crate::cmdev::{self, CmdevEvent, CmdevState};
use crate::cmrpc::{self, Cmrpc};
use crate::cmwrr::{self, CmwrrState};
use crate::config::{AlarmArgument, Callbacks, ConfigError, PnetCfg};
use crate::dev::Device;
use crate::fspm::Fspm;
use crate::pdport::PdPort;

/// Size of the buffer an outbound Ethernet frame is built in.
pub const FRAME_BUFFER_SIZE: usize = 1522;

/// Capacity of the inbound RPC packet mailbox.
const RPC_MAILBOX_CAPACITY: usize = 8;

/// Tokens dispatched by the scheduler at the periodic tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutToken {
    /// An alarm DATA frame awaits its transport acknowledge.
    AlarmRetransmit {
        /// The owning AR.
        arep: Arep,
        /// Priority index, 0 = low, 1 = high.
        prio: usize,
    },
}

impl TimeoutToken {
    /// Whether this timeout belongs to the given AR. Aborting an AR
    /// cancels everything that matches.
    pub fn belongs_to(&self, arep: Arep) -> bool {
        match self {
            TimeoutToken::AlarmRetransmit { arep: owner, .. } => *owner == arep,
        }
    }
}

/// The device stack instance.
pub struct Net {
    pub(crate) fspm: Fspm,
    /// The device tree and diagnosis pool.
    pub device: Device,
    pub(crate) ars: Vec<Option<Ar>>,
    next_arep: Arep,
    /// The write-record router state.
    pub cmwrr_state: CmwrrState,
    /// Pending timeouts, drained each tick.
    pub sched: Scheduler<TimeoutToken>,
    time: Box<dyn TimeSource + Send>,
    /// Outbound Ethernet frames (alarms).
    pub eth_sink: Box<dyn FrameSink + Send>,
    rpc_sink: Box<dyn FrameSink + Send>,
    pub(crate) rpc: Cmrpc,
    rpc_mailbox: Mailbox<Bytes>,
    /// The physical port state.
    pub ports: PdPort,
    /// Master switch for alarm transmission.
    pub global_alarm_enable: bool,
    boot_time: u32,
}

impl Net {
    /// Create the stack. Fails when the configuration is invalid; this is
    /// the only fatal, device-wide error path.
    pub fn new(
        cfg: PnetCfg,
        callbacks: Callbacks,
        time: Box<dyn TimeSource + Send>,
        eth_sink: Box<dyn FrameSink + Send>,
        rpc_sink: Box<dyn FrameSink + Send>,
    ) -> Result<Self, ConfigError> {
        let fspm = Fspm::init(cfg, callbacks)?;
        let mut ports = PdPort::default();
        ports.init(&fspm.cfg.file_directory);
        let boot_time = time.current_time_us();
        Ok(Self {
            fspm,
            device: Device::default(),
            ars: (0..MAX_ARS).map(|_| None).collect(),
            next_arep: 1,
            cmwrr_state: CmwrrState::Idle,
            sched: Scheduler::new(),
            time,
            eth_sink,
            rpc_sink,
            rpc: Cmrpc::default(),
            rpc_mailbox: Mailbox::new(RPC_MAILBOX_CAPACITY),
            ports,
            global_alarm_enable: true,
            boot_time,
        })
    }

    /// The periodic entry point. Drains the RPC receive queue, the alarm
    /// receive mailboxes, expired timeouts and pending alarm sends.
    pub fn handle_periodic(&mut self) {
        // Inbound RPC packets.
        while let Some(packet) = self.rpc_mailbox.fetch() {
            let responses = cmrpc::handle_packet(self, &packet);
            for response in responses {
                if let Err(e) = self.rpc_sink.send_frame(response) {
                    error!("failed to send RPC response: {}", e);
                }
            }
        }

        // Alarm receive and send paths, per AR.
        if self.global_alarm_enable {
            for ix in 0..self.ars.len() {
                let Some(mut ar) = self.ars[ix].take() else {
                    continue;
                };
                alarm::apmr_periodic(self, &mut ar);
                if ar.cmdev_state != CmdevState::Abort {
                    alarm::almpi_periodic(self, &mut ar);
                }
                if ar.cmdev_state != CmdevState::Abort {
                    self.ars[ix] = Some(ar);
                }
            }
        }

        // Expired timeouts.
        let now = self.now_us();
        for token in self.sched.take_expired(now) {
            match token {
                TimeoutToken::AlarmRetransmit { arep, prio } => {
                    self.with_ar(arep, |net, ar| alarm::apms_timeout(net, ar, prio));
                }
            }
        }
    }

    /// Handle one RPC request or response PDU synchronously, returning
    /// any response PDUs to transmit.
    pub fn handle_rpc_packet(&mut self, packet: &[u8]) -> Vec<Bytes> {
        cmrpc::handle_packet(self, packet)
    }

    /// Enqueue an RPC PDU for the next periodic tick. Safe to call from a
    /// receive callback; a full queue drops the packet with a logged
    /// error.
    pub fn post_rpc_packet(&self, packet: Bytes) -> bool {
        self.rpc_mailbox.sender().post(packet)
    }

    /// Route a received Ethernet frame carrying an alarm FrameID onto the
    /// owning mailbox. Returns whether the frame was taken.
    pub fn handle_alarm_frame(&self, frame: &[u8]) -> bool {
        let Some((frame_id, payload_at)) = frame_id_of(frame) else {
            return false;
        };
        let prio = match frame_id {
            FRAME_ID_ALARM_LOW => 0,
            FRAME_ID_ALARM_HIGH => 1,
            _ => return false,
        };
        let Some(dst) = frame.get(payload_at..payload_at + 2) else {
            return false;
        };
        let dst_ref = u16::from_be_bytes([dst[0], dst[1]]);
        for ar in self.live_ars() {
            let apmx = &ar.apmx[prio];
            if apmx.apmr_state != ApmrState::Closed && apmx.src_ref == dst_ref {
                info!(
                    "received {} prio alarm frame for AREP {}",
                    if prio == 1 { "high" } else { "low" },
                    ar.arep
                );
                return apmx.mailbox.sender().post(AlarmFrame {
                    buf: Bytes::copy_from_slice(frame),
                    payload_at,
                });
            }
        }
        debug!("alarm frame with no owner (dst_ref {:#06x})", dst_ref);
        false
    }

    // ------------------------------------------------------------------
    // Accessors used across the subsystems.

    /// The configured device MAC address.
    pub fn mac_address(&self) -> [u8; 6] {
        self.fspm.cfg.mac_address
    }

    /// The configured station name.
    pub fn station_name(&self) -> String {
        self.fspm.cfg.identity.station_name.clone()
    }

    /// The configured smallest device interval, units of 1/32 ms.
    pub fn min_device_interval(&self) -> u16 {
        self.fspm.cfg.min_device_interval
    }

    /// The current time from the wired time source.
    pub fn now_us(&self) -> u32 {
        self.time.current_time_us()
    }

    /// The boot timestamp, used in RPC headers.
    pub fn boot_time(&self) -> u32 {
        self.boot_time
    }

    /// Send one RPC PDU through the wired transport.
    pub(crate) fn rpc_send(&mut self, packet: Bytes) -> Result<(), SendError> {
        self.rpc_sink.send_frame(packet)
    }

    /// All live ARs.
    pub fn live_ars(&self) -> impl Iterator<Item = &Ar> {
        self.ars.iter().filter_map(|slot| slot.as_ref())
    }

    /// Find a live AR by its AR UUID.
    pub fn find_ar_by_uuid(&self, ar_uuid: &PnetUuid) -> Option<Arep> {
        self.live_ars()
            .find(|ar| ar.ar_param.ar_uuid == *ar_uuid)
            .map(|ar| ar.arep)
    }

    /// Allocate the next endpoint reference.
    pub(crate) fn next_arep(&mut self) -> Arep {
        let arep = self.next_arep;
        self.next_arep = self.next_arep.wrapping_add(1).max(1);
        arep
    }

    /// Store a freshly connected AR. Fails when every slot is taken.
    pub(crate) fn store_ar(&mut self, ar: Ar) -> bool {
        match self.ars.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(ar);
                true
            }
            None => {
                error!("out of AR resources");
                false
            }
        }
    }

    /// Run `f` with an AR temporarily taken out of its slot, so the
    /// callee can borrow the rest of the stack mutably. An AR that
    /// reached `Abort` is released instead of being put back.
    pub(crate) fn with_ar<R>(
        &mut self,
        arep: Arep,
        f: impl FnOnce(&mut Net, &mut Ar) -> R,
    ) -> Option<R> {
        let ix = self
            .ars
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|ar| ar.arep == arep))?;
        let mut ar = self.ars[ix].take()?;
        let result = f(self, &mut ar);
        if ar.cmdev_state == CmdevState::Abort {
            debug!("AREP {} released", arep);
        } else {
            self.ars[ix] = Some(ar);
        }
        Some(result)
    }

    // ------------------------------------------------------------------
    // Subsystem notification fan-out.

    /// CMWRR follows the AR lifecycle events.
    pub(crate) fn cmwrr_state_ind(&mut self, event: CmdevEvent) {
        cmwrr::cmdev_state_ind(&mut self.cmwrr_state, event);
    }

    /// CMRPC drops sessions of aborted ARs.
    pub(crate) fn cmrpc_state_ind(&mut self, arep: Arep, event: CmdevEvent) {
        if event == CmdevEvent::Abort {
            self.rpc.release_for_ar(arep);
        }
    }

    /// Kick the device-originated Application Ready exchange.
    pub(crate) fn cmrpc_ccontrol_req(&mut self, ar: &Ar) -> Result<(), ()> {
        cmrpc::ccontrol_req(self, ar)
    }

    /// Observers are reset when a new connection is established.
    pub(crate) fn pdport_reset_observers(&mut self) {
        let directory = self.fspm.cfg.file_directory.clone();
        self.ports.reset(&directory);
    }

    /// Persist the port configuration.
    pub(crate) fn pdport_save(&mut self) {
        let directory = self.fspm.cfg.file_directory.clone();
        self.ports.save(&directory);
    }

    // ------------------------------------------------------------------
    // FSPM callback dispatch. Unset callbacks approve vetoing operations
    // and answer record access with "not supported".

    pub(crate) fn fspm_connect_ind(&mut self, arep: Arep) -> Result<(), StackError> {
        match self.fspm.callbacks.connect.as_mut() {
            Some(cb) => cb(arep),
            None => Ok(()),
        }
    }

    pub(crate) fn fspm_release_ind(&mut self, arep: Arep) -> Result<(), StackError> {
        match self.fspm.callbacks.release.as_mut() {
            Some(cb) => cb(arep),
            None => Ok(()),
        }
    }

    pub(crate) fn fspm_dcontrol_ind(
        &mut self,
        arep: Arep,
        control_command: u16,
    ) -> Result<(), StackError> {
        match self.fspm.callbacks.dcontrol.as_mut() {
            Some(cb) => cb(arep, control_command),
            None => Ok(()),
        }
    }

    pub(crate) fn fspm_ccontrol_cnf(&mut self, arep: Arep, status: PnioStatus) {
        if let Some(cb) = self.fspm.callbacks.ccontrol.as_mut() {
            cb(arep, status);
        }
    }

    pub(crate) fn fspm_state_ind(&mut self, arep: Arep, event: CmdevEvent) {
        debug!("user state callback: AREP {} event {:?}", arep, event);
        if let Some(cb) = self.fspm.callbacks.state.as_mut() {
            cb(arep, event);
        }
    }

    pub(crate) fn fspm_exp_module(
        &mut self,
        api: u32,
        slot_number: u16,
        module_ident: u32,
    ) -> Result<(), StackError> {
        match self.fspm.callbacks.exp_module.as_mut() {
            Some(cb) => cb(api, slot_number, module_ident),
            None => Ok(()),
        }
    }

    pub(crate) fn fspm_exp_submodule(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        module_ident: u32,
        submodule_ident: u32,
    ) -> Result<(), StackError> {
        match self.fspm.callbacks.exp_submodule.as_mut() {
            Some(cb) => cb(api, slot_number, subslot_number, module_ident, submodule_ident),
            None => Ok(()),
        }
    }

    pub(crate) fn fspm_read_ind(
        &mut self,
        arep: Arep,
        request: &ReadRequest,
    ) -> Result<Vec<u8>, StackError> {
        match self.fspm.callbacks.read.as_mut() {
            Some(cb) => cb(
                arep,
                request.api,
                request.slot_number,
                request.subslot_number,
                request.index,
            ),
            None => Err(StackError::read_access(error_code_1::APP_NOT_SUPPORTED)),
        }
    }

    pub(crate) fn fspm_write_ind(
        &mut self,
        arep: Arep,
        request: &WriteRequest,
        data: &[u8],
    ) -> Result<(), StackError> {
        match self.fspm.callbacks.write.as_mut() {
            Some(cb) => cb(
                arep,
                request.api,
                request.slot_number,
                request.subslot_number,
                request.index,
                data,
            ),
            None => Err(StackError::write_access(error_code_1::APP_NOT_SUPPORTED)),
        }
    }

    pub(crate) fn fspm_write_im(&mut self, idx: u16, data: &[u8]) -> Result<(), StackError> {
        self.fspm.write_im(idx, data)
    }

    pub(crate) fn fspm_alarm_ind(
        &mut self,
        arep: Arep,
        arg: &AlarmArgument,
        data_usi: u16,
        payload: &[u8],
    ) {
        if let Some(cb) = self.fspm.callbacks.alarm_ind.as_mut() {
            cb(arep, arg, data_usi, payload);
        }
    }

    pub(crate) fn fspm_alarm_cnf(&mut self, arep: Arep, status: PnioStatus) {
        if let Some(cb) = self.fspm.callbacks.alarm_cnf.as_mut() {
            cb(arep, status);
        }
    }

    pub(crate) fn fspm_alarm_ack_cnf(&mut self, arep: Arep, positive: bool) {
        if let Some(cb) = self.fspm.callbacks.alarm_ack_cnf.as_mut() {
            cb(arep, positive);
        }
    }

    pub(crate) fn fspm_reset_ind(&mut self, reset_application: bool, reset_mode: u16) {
        if let Some(cb) = self.fspm.callbacks.reset.as_mut() {
            cb(reset_application, reset_mode);
        }
    }

    /// Append a log book entry for an AR.
    pub(crate) fn fspm_log_book_entry(
        &mut self,
        arep: Arep,
        ar_uuid: &PnetUuid,
        status: PnioStatus,
        detail: u32,
    ) {
        debug!(
            "log book entry for AREP {}: {:02x}/{:02x}/{:02x}/{:02x}",
            arep,
            status.error_code,
            status.error_decode,
            status.error_code_1,
            status.error_code_2
        );
        let now = self.now_us();
        self.fspm.log_book_entry(now, ar_uuid, status, detail);
    }

    /// Abort every live AR. Used by factory reset.
    pub(crate) fn abort_all_ars(&mut self) {
        let areps: Vec<Arep> = self.live_ars().map(|ar| ar.arep).collect();
        for arep in areps {
            self.with_ar(arep, |net, ar| cmdev::abort(net, ar));
        }
    }
}
