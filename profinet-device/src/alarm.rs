// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The alarm subsystem.
//!
//! Two priority pairs per AR, each with four machines: ALPMI tracks
//! device-originated alarms against the controller's acknowledge, ALPMR
//! handles controller-originated alarms, APMS owns reliable transmission
//! with retransmission of the stored frame, APMR accepts DATA / ACK /
//! NACK / ERR frames posted by the Ethernet receive path.
//!
//! Incoming frames are queued onto per-priority mailboxes by the receive
//! callback; the periodic tick drains at most the queued frames and at
//! most one outbound alarm per priority, preferring high priority.

use bytes::Bytes;
use log::{debug, error, info, warn};

use pnet_core::eth::EthHeader;
use pnet_core::mbox::Mailbox;
use pnet_types::blocks::alarm::{
    alarm_type, usi, AlarmAck, AlarmFixed, AlarmNotification, AlarmSpecifier, RtaPduType,
    RTA_PDU_VERSION,
};
use pnet_types::blocks::{begin_block, block_type, end_block, BlockHeader};
use pnet_types::status::{error_code, error_code_1, error_code_2_abort, error_code_2_alarm, error_decode};
use pnet_types::{BlockReader, BlockWriter, PnioStatus, FRAME_ID_ALARM_HIGH, FRAME_ID_ALARM_LOW};

use crate::ar::Ar;
use crate::cmdev;
use crate::config::AlarmArgument;
use crate::dev::{ch_prop, DiagItem};
use crate::net::{Net, TimeoutToken, FRAME_BUFFER_SIZE};

/// VLAN priority of low priority alarm frames.
pub const ALARM_VLAN_PRIO_LOW: u8 = 5;
/// VLAN priority of high priority alarm frames.
pub const ALARM_VLAN_PRIO_HIGH: u8 = 6;

/// Queue capacity per priority.
pub const MAX_ALARMS: usize = 6;
/// Mailbox capacity for received alarm frames, per priority.
const ALARM_MAILBOX_CAPACITY: usize = MAX_ALARMS;

/// Longest alarm data this device emits, advertised in the alarm CR
/// response.
pub const MAX_ALARM_DATA_LEN: u16 = 200;

/// ALPMI (initiator) states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlpmiState {
    /// Not activated.
    #[default]
    WStart,
    /// Idle, ready to send an alarm.
    WAlarm,
    /// Alarm sent, waiting for the controller's Alarm Ack.
    WAck,
}

/// ALPMR (responder) states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlpmrState {
    /// Not activated.
    #[default]
    WStart,
    /// Waiting for an alarm notification from the controller.
    WNotify,
    /// Notification delivered, waiting for the application's ack.
    WUserAck,
    /// Ack sent, waiting for the transport acknowledge.
    WTack,
}

/// APMS (sender) states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApmsState {
    /// Not activated.
    #[default]
    Closed,
    /// Ready to send.
    Open,
    /// DATA sent, waiting for the transport acknowledge.
    Wtack,
}

/// APMR (receiver) states. The original protocol table has a WCNF state
/// that is only ever reached to log an error; it is collapsed into
/// `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApmrState {
    /// Not activated.
    #[default]
    Closed,
    /// Accepting frames.
    Open,
}

/// ALPMI + ALPMR state for one priority.
#[derive(Debug, Clone, Default)]
pub struct Alpmx {
    /// Initiator state.
    pub alpmi_state: AlpmiState,
    /// Responder state.
    pub alpmr_state: AlpmrState,
    /// Next 11-bit alarm sequence number.
    pub sequence_number: u16,
    /// Previously used sequence number.
    pub prev_sequence_number: u16,
}

/// A frame delivered by the Ethernet receive path: the whole frame plus
/// the offset just past the FrameID.
pub struct AlarmFrame {
    /// The received frame.
    pub buf: Bytes,
    /// Offset of the alarm fixed part.
    pub payload_at: usize,
}

/// APMS + APMR state for one priority.
pub struct Apmx {
    /// True for the high priority pair.
    pub high_priority: bool,
    /// VLAN priority used on outbound frames.
    pub vlan_prio: u8,
    /// FrameID used by this pair.
    pub frame_id: u16,
    /// Block type of notifications at this priority.
    pub block_type_alarm_notify: u16,
    /// Block type of acknowledges at this priority.
    pub block_type_alarm_ack: u16,
    /// Our endpoint reference (the controller's destination).
    pub src_ref: u16,
    /// The controller's endpoint reference.
    pub dst_ref: u16,
    /// Sender state.
    pub apms_state: ApmsState,
    /// Receiver state.
    pub apmr_state: ApmrState,
    /// Send sequence counter, 15-bit.
    pub send_seq_count: u16,
    /// Previous send sequence counter.
    pub send_seq_count_o: u16,
    /// Expected receive sequence counter, 15-bit.
    pub exp_seq_count: u16,
    /// Previous expected receive sequence counter.
    pub exp_seq_count_o: u16,
    /// Remaining retransmissions of the stored frame.
    pub retry: u16,
    /// Retransmission timeout in microseconds.
    pub timeout_us: u32,
    /// Handle of the armed retransmission timeout.
    pub timeout: Option<pnet_core::sched::TimeoutHandle>,
    /// The last TACK-requesting frame, kept for retransmission.
    pub stored_frame: Option<Bytes>,
    /// Frames delivered by the receive path, drained each tick.
    pub mailbox: Mailbox<AlarmFrame>,
}

impl Apmx {
    /// A closed pair for the given priority.
    pub fn new(high_priority: bool) -> Self {
        Self {
            high_priority,
            vlan_prio: if high_priority {
                ALARM_VLAN_PRIO_HIGH
            } else {
                ALARM_VLAN_PRIO_LOW
            },
            frame_id: if high_priority {
                FRAME_ID_ALARM_HIGH
            } else {
                FRAME_ID_ALARM_LOW
            },
            block_type_alarm_notify: if high_priority {
                block_type::ALARM_NOTIFICATION_HIGH
            } else {
                block_type::ALARM_NOTIFICATION_LOW
            },
            block_type_alarm_ack: if high_priority {
                block_type::ALARM_ACK_HIGH
            } else {
                block_type::ALARM_ACK_LOW
            },
            src_ref: 0,
            dst_ref: 0,
            apms_state: ApmsState::Closed,
            apmr_state: ApmrState::Closed,
            send_seq_count: 0xFFFF,
            send_seq_count_o: 0xFFFE,
            exp_seq_count: 0xFFFF,
            exp_seq_count_o: 0xFFFE,
            retry: 0,
            timeout_us: 0,
            timeout: None,
            stored_frame: None,
            mailbox: Mailbox::new(ALARM_MAILBOX_CAPACITY),
        }
    }
}

/// One queued outbound alarm.
#[derive(Debug, Clone, Default)]
pub struct PendingAlarm {
    /// Alarm type.
    pub alarm_type: u16,
    /// API identifier.
    pub api_id: u32,
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Plugged module ident.
    pub module_ident: u32,
    /// Plugged submodule ident.
    pub submodule_ident: u32,
    /// Payload USI; 0 for none.
    pub payload_usi: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Per-priority ring of pending outbound alarms.
#[derive(Default)]
pub struct AlarmQueue {
    items: std::collections::VecDeque<PendingAlarm>,
}

impl AlarmQueue {
    /// Append an alarm. Fails when the queue is full.
    pub fn push(&mut self, alarm: PendingAlarm) -> Result<(), ()> {
        if self.items.len() >= MAX_ALARMS {
            error!("alarm send queue full, alarm dropped");
            return Err(());
        }
        self.items.push_back(alarm);
        Ok(())
    }

    /// Take the oldest alarm.
    pub fn pop(&mut self) -> Option<PendingAlarm> {
        self.items.pop_front()
    }

    /// Number of queued alarms.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// What rides behind the fixed part of an outbound frame.
enum PduPayload<'a> {
    /// ACK and NACK carry nothing.
    None,
    /// A notification block with optional maintenance and USI payload.
    Notification {
        data: AlarmNotification,
        maint_status: u32,
        payload_usi: u16,
        payload: &'a [u8],
    },
    /// An alarm-ack block with its status.
    Ack {
        data: AlarmAck,
        status: PnioStatus,
    },
    /// An ERR frame: the raw status.
    Err(PnioStatus),
}

/// Activate both priority pairs when the AR reaches its startup phase.
pub fn activate(net: &mut Net, ar: &mut Ar) -> Result<(), ()> {
    let Some(alarm_cr) = ar.alarm_cr_request.clone() else {
        return Err(());
    };

    for ix in 0..2 {
        let alpmx = &mut ar.alpmx[ix];
        if alpmx.alpmi_state != AlpmiState::WStart {
            ar.err_cls = error_code_1::ALPMI;
            ar.err_code = error_code_2_alarm::ALPMI_WRONG_STATE;
            return Err(());
        }
        if alpmx.alpmr_state != AlpmrState::WStart {
            ar.err_cls = error_code_1::ALPMR;
            ar.err_code = error_code_2_alarm::ALPMR_WRONG_STATE;
            return Err(());
        }
        alpmx.prev_sequence_number = 0xFFFF;
        alpmx.sequence_number = 0;
        alpmx.alpmr_state = AlpmrState::WNotify;
        alpmx.alpmi_state = AlpmiState::WAlarm;
    }

    for ix in 0..2 {
        let apmx = &mut ar.apmx[ix];
        if apmx.apms_state != ApmsState::Closed {
            ar.err_cls = error_code_1::APMS;
            ar.err_code = error_code_2_alarm::APMS_INVALID_STATE;
            return Err(());
        }
        if apmx.apmr_state != ApmrState::Closed {
            ar.err_cls = error_code_1::APMR;
            ar.err_code = error_code_2_alarm::APMR_INVALID_STATE;
            return Err(());
        }
        apmx.src_ref = ar.alarm_cr_result.local_alarm_reference;
        apmx.dst_ref = alarm_cr.local_alarm_reference;
        apmx.send_seq_count = 0xFFFF;
        apmx.send_seq_count_o = 0xFFFE;
        apmx.exp_seq_count = 0xFFFF;
        apmx.exp_seq_count_o = 0xFFFE;
        apmx.timeout_us = 100_000u32.saturating_mul(alarm_cr.rta_timeout_factor as u32);
        apmx.retry = 0;
        apmx.timeout = None;
        apmx.stored_frame = None;
        apmx.mailbox.drain();
        apmx.apms_state = ApmsState::Open;
        apmx.apmr_state = ApmrState::Open;
    }

    for q in &mut ar.alarm_send_q {
        q.clear();
    }

    let _ = net;
    Ok(())
}

/// Close both pairs: an ERR frame on the low priority sender first
/// (best effort, no TACK), then timers, mailboxes and stored frames.
pub fn close(net: &mut Net, ar: &mut Ar) {
    debug!("closing alarm instance for AREP {}", ar.arep);

    for alpmx in &mut ar.alpmx {
        alpmx.alpmi_state = AlpmiState::WStart;
        alpmx.alpmr_state = AlpmrState::WStart;
    }

    if ar.apmx[0].apms_state != ApmsState::Closed {
        let status = PnioStatus::new(
            error_code::RTA_ERROR,
            error_decode::PNIO,
            error_code_1::RTA_ERR_CLS_PROTOCOL,
            ar.err_code,
        );
        let fixed = AlarmFixed {
            src_ref: ar.apmx[0].src_ref,
            dst_ref: ar.apmx[0].dst_ref,
            pdu_type: RtaPduType::Err,
            version: RTA_PDU_VERSION,
            window_size: 1,
            tack: false,
            send_seq_num: ar.apmx[0].send_seq_count,
            ack_seq_num: ar.apmx[0].exp_seq_count_o,
        };
        if a_data_req(net, ar, 0, fixed, PduPayload::Err(status)).is_err() {
            warn!("could not send close alarm for AREP {}", ar.arep);
        }
    }

    for ix in 0..2 {
        let apmx = &mut ar.apmx[ix];
        if let Some(handle) = apmx.timeout.take() {
            net.sched.cancel(handle);
        }
        apmx.stored_frame = None;
        apmx.mailbox.drain();
        apmx.apms_state = ApmsState::Closed;
        apmx.apmr_state = ApmrState::Closed;
    }

    for q in &mut ar.alarm_send_q {
        q.clear();
    }
}

/// Whether any outbound alarm is queued or not yet acknowledged on either
/// priority.
pub fn pending(ar: &Ar) -> bool {
    ar.alarm_send_q.iter().any(|q| !q.is_empty())
        || ar
            .alpmx
            .iter()
            .any(|alpmx| alpmx.alpmi_state == AlpmiState::WAck)
        || ar.apmx.iter().any(|apmx| apmx.apms_state == ApmsState::Wtack)
}

/// An alarm machine failed in a way the AR cannot survive.
fn error_ind(net: &mut Net, ar: &mut Ar, err_cls: u8, err_code: u8) {
    info!(
        "alarm error for AREP {}: err_cls {:#04x} err_code {:#04x}",
        ar.arep, err_cls, err_code
    );
    ar.err_cls = err_cls;
    ar.err_code = err_code;
    cmdev::abort(net, ar);
}

/// Build and send one alarm frame; store it for retransmission when TACK
/// is requested.
fn a_data_req(
    net: &mut Net,
    ar: &mut Ar,
    prio: usize,
    fixed: AlarmFixed,
    payload: PduPayload,
) -> Result<(), ()> {
    let apmx = &ar.apmx[prio];
    let mut w = BlockWriter::new(FRAME_BUFFER_SIZE);
    let header = EthHeader {
        dst: ar.ar_param.cm_initiator_mac,
        src: net.mac_address(),
        vlan_prio: apmx.vlan_prio,
        frame_id: apmx.frame_id,
    };
    let build = (|| {
        header.encode(&mut w)?;
        fixed.encode(&mut w)?;
        let var_part_len = w.reserve_u16()?;
        match &payload {
            PduPayload::None => {}
            PduPayload::Notification {
                data,
                maint_status,
                payload_usi,
                payload,
            } => {
                let block = begin_block(&mut w, apmx.block_type_alarm_notify)?;
                data.encode(&mut w)?;
                if *maint_status != 0 {
                    w.put_u16(usi::MAINTENANCE)?;
                    w.put_u32(*maint_status)?;
                }
                if *payload_usi != 0 {
                    w.put_u16(*payload_usi)?;
                    w.put_mem(payload)?;
                }
                end_block(&mut w, block);
            }
            PduPayload::Ack { data, status } => {
                let block = begin_block(&mut w, apmx.block_type_alarm_ack)?;
                data.encode(&mut w)?;
                status.encode(&mut w)?;
                end_block(&mut w, block);
            }
            PduPayload::Err(status) => {
                status.encode(&mut w)?;
            }
        }
        w.patch_u16_len(var_part_len);
        Ok::<(), pnet_types::WriteError>(())
    })();
    if let Err(e) = build {
        error!("could not build alarm frame: {}", e);
        return Err(());
    }

    let frame = Bytes::from(w.into_vec());
    info!(
        "sending alarm frame {:?}, FrameID {:#06x}, tack {}, send seq {}, ack seq {}",
        fixed.pdu_type, apmx.frame_id, fixed.tack, fixed.send_seq_num, fixed.ack_seq_num
    );
    if let Err(e) = net.eth_sink.send_frame(frame.clone()) {
        error!("alarm frame send failed: {}", e);
        return Err(());
    }

    if fixed.tack {
        let apmx = &mut ar.apmx[prio];
        if apmx.stored_frame.is_some() {
            error!("stored alarm frame with TACK lost");
        }
        apmx.stored_frame = Some(frame);
    }
    Ok(())
}

/// APMS: send a DATA RTA-PDU with TACK and arm the retransmission timer.
fn apms_a_data_req(
    net: &mut Net,
    ar: &mut Ar,
    prio: usize,
    payload: PduPayload,
) -> Result<(), ()> {
    if ar.apmx[prio].apms_state != ApmsState::Open {
        alpmi_apms_a_data_cnf(net, ar, prio, false);
        alpmr_apms_a_data_cnf(net, ar, prio, false);
        return Err(());
    }

    let fixed = AlarmFixed {
        src_ref: ar.apmx[prio].src_ref,
        dst_ref: ar.apmx[prio].dst_ref,
        pdu_type: RtaPduType::Data,
        version: RTA_PDU_VERSION,
        window_size: 1,
        tack: true,
        send_seq_num: ar.apmx[prio].send_seq_count,
        ack_seq_num: ar.apmx[prio].exp_seq_count_o,
    };
    ar.apmx[prio].retry = ar
        .alarm_cr_request
        .as_ref()
        .map(|cr| cr.rta_retries)
        .unwrap_or(0);

    let result = a_data_req(net, ar, prio, fixed, payload);

    ar.apmx[prio].apms_state = ApmsState::Wtack;
    let now = net.now_us();
    let delay = ar.apmx[prio].timeout_us;
    let handle = net.sched.schedule(
        now,
        delay,
        TimeoutToken::AlarmRetransmit {
            arep: ar.arep,
            prio,
        },
    );
    ar.apmx[prio].timeout = Some(handle);

    result
}

/// Retransmission timeout fired for one priority.
pub fn apms_timeout(net: &mut Net, ar: &mut Ar, prio: usize) {
    ar.apmx[prio].timeout = None;
    if ar.apmx[prio].apms_state != ApmsState::Wtack {
        debug!(
            "skipping alarm retransmission, APMS is {:?}",
            ar.apmx[prio].apms_state
        );
        ar.apmx[prio].stored_frame = None;
        return;
    }

    let Some(frame) = ar.apmx[prio].stored_frame.clone() else {
        error!("no alarm frame available for resending");
        return;
    };

    if ar.apmx[prio].retry > 0 {
        ar.apmx[prio].retry -= 1;
        info!("re-sending alarm frame for AREP {}", ar.arep);
        if let Err(e) = net.eth_sink.send_frame(frame) {
            error!("alarm retransmission send failed: {}", e);
        }
        let now = net.now_us();
        let delay = ar.apmx[prio].timeout_us;
        let handle = net.sched.schedule(
            now,
            delay,
            TimeoutToken::AlarmRetransmit {
                arep: ar.arep,
                prio,
            },
        );
        ar.apmx[prio].timeout = Some(handle);
    } else {
        // Retries exhausted.
        ar.apmx[prio].apms_state = ApmsState::Open;
        ar.apmx[prio].stored_frame = None;
        error_ind(
            net,
            ar,
            error_code_1::APMS,
            error_code_2_abort::AR_ALARM_SEND_CNF_NEG,
        );
    }
}

/// APMS: consume the acknowledge number of an incoming ACK or DATA frame.
fn apms_a_data_ind(net: &mut Net, ar: &mut Ar, prio: usize, fixed: &AlarmFixed) {
    if !matches!(fixed.pdu_type, RtaPduType::Ack | RtaPduType::Data) {
        return;
    }
    if ar.apmx[prio].apms_state != ApmsState::Wtack {
        // A timeout already gave up on this frame.
        return;
    }
    if fixed.ack_seq_num != ar.apmx[prio].send_seq_count {
        // Wrong sequence number; the retransmission timer will resend.
        return;
    }

    {
        let apmx = &mut ar.apmx[prio];
        apmx.send_seq_count_o = apmx.send_seq_count;
        apmx.send_seq_count = apmx.send_seq_count.wrapping_add(1) & 0x7FFF;
        apmx.stored_frame = None;
        if let Some(handle) = apmx.timeout.take() {
            net.sched.cancel(handle);
        }
        apmx.apms_state = ApmsState::Open;
    }

    alpmi_apms_a_data_cnf(net, ar, prio, true);
    alpmr_apms_a_data_cnf(net, ar, prio, true);
}

/// ALPMI: confirmation for a frame APMS sent on its behalf.
fn alpmi_apms_a_data_cnf(net: &mut Net, ar: &mut Ar, prio: usize, positive: bool) {
    if !positive {
        let _ = prio;
        error_ind(
            net,
            ar,
            error_code_1::ALPMI,
            error_code_2_alarm::ALPMI_INVALID,
        );
    }
}

/// ALPMR: confirmation for a frame APMS sent on its behalf. A positive
/// confirmation in `WTack` completes the application's alarm ack.
fn alpmr_apms_a_data_cnf(net: &mut Net, ar: &mut Ar, prio: usize, positive: bool) {
    match ar.alpmx[prio].alpmr_state {
        AlpmrState::WStart => {}
        AlpmrState::WNotify | AlpmrState::WUserAck => {
            if !positive {
                error_ind(
                    net,
                    ar,
                    error_code_1::ALPMR,
                    error_code_2_alarm::ALPMR_INVALID,
                );
            }
        }
        AlpmrState::WTack => {
            if positive {
                ar.alpmx[prio].alpmr_state = AlpmrState::WNotify;
                let arep = ar.arep;
                net.fspm_alarm_ack_cnf(arep, true);
            } else {
                error_ind(
                    net,
                    ar,
                    error_code_1::ALPMR,
                    error_code_2_alarm::ALPMR_INVALID,
                );
            }
        }
    }
}

/// ALPMI: the controller's Alarm Ack DATA arrived.
fn alpmi_apmr_a_data_ind(net: &mut Net, ar: &mut Ar, prio: usize, status: PnioStatus) {
    match ar.alpmx[prio].alpmi_state {
        AlpmiState::WStart | AlpmiState::WAlarm => {}
        AlpmiState::WAck => {
            ar.alpmx[prio].alpmi_state = AlpmiState::WAlarm;
            let arep = ar.arep;
            net.fspm_alarm_cnf(arep, status);
        }
    }
}

/// ALPMR: an Alarm Notification DATA arrived; surface it to the
/// application.
fn alpmr_apmr_a_data_ind(
    net: &mut Net,
    ar: &mut Ar,
    prio: usize,
    data: &AlarmNotification,
    data_usi: u16,
    payload: &[u8],
) {
    match ar.alpmx[prio].alpmr_state {
        AlpmrState::WStart => {}
        AlpmrState::WNotify => {
            ar.alpmx[prio].alpmr_state = AlpmrState::WUserAck;
            let arg = AlarmArgument {
                api_id: data.api_id,
                slot_number: data.slot_number,
                subslot_number: data.subslot_number,
                alarm_type: data.alarm_type,
                specifier: data.specifier,
                sequence_number: data.sequence_number,
            };
            let arep = ar.arep;
            net.fspm_alarm_ind(arep, &arg, data_usi, payload);
        }
        AlpmrState::WUserAck | AlpmrState::WTack => {
            error_ind(
                net,
                ar,
                error_code_1::RTA_ERR_CLS_PROTOCOL,
                error_code_2_abort::AR_PROTOCOL_VIOLATION,
            );
        }
    }
}

fn apmr_send_ack(net: &mut Net, ar: &mut Ar, prio: usize) -> Result<(), ()> {
    let fixed = AlarmFixed {
        src_ref: ar.apmx[prio].src_ref,
        dst_ref: ar.apmx[prio].dst_ref,
        pdu_type: RtaPduType::Ack,
        version: RTA_PDU_VERSION,
        window_size: 1,
        tack: false,
        send_seq_num: ar.apmx[prio].send_seq_count_o,
        ack_seq_num: ar.apmx[prio].exp_seq_count_o,
    };
    a_data_req(net, ar, prio, fixed, PduPayload::None)
}

fn apmr_send_nack(net: &mut Net, ar: &mut Ar, prio: usize) -> Result<(), ()> {
    let fixed = AlarmFixed {
        src_ref: ar.apmx[prio].src_ref,
        dst_ref: ar.apmx[prio].dst_ref,
        pdu_type: RtaPduType::Nack,
        version: RTA_PDU_VERSION,
        window_size: 1,
        tack: false,
        send_seq_num: ar.apmx[prio].send_seq_count_o,
        ack_seq_num: ar.apmx[prio].exp_seq_count_o,
    };
    a_data_req(net, ar, prio, fixed, PduPayload::None)
}

/// APMR: handle a DATA frame.
fn apmr_a_data_ind(
    net: &mut Net,
    ar: &mut Ar,
    prio: usize,
    fixed: &AlarmFixed,
    r: &mut BlockReader,
) {
    if ar.apmx[prio].apmr_state != ApmrState::Open || !fixed.tack {
        return;
    }

    if fixed.send_seq_num == ar.apmx[prio].exp_seq_count {
        let header = BlockHeader::decode(r);
        if header.block_type == ar.apmx[prio].block_type_alarm_ack {
            // An Alarm Ack PDU: deliver to ALPMI.
            apms_a_data_ind(net, ar, prio, fixed);
            let apmx = &mut ar.apmx[prio];
            apmx.exp_seq_count_o = apmx.exp_seq_count;
            apmx.exp_seq_count = apmx.exp_seq_count.wrapping_add(1) & 0x7FFF;
            if apmr_send_ack(net, ar, prio).is_ok() {
                let _ack = AlarmAck::decode(r);
                let status = PnioStatus::decode(r);
                if r.result().is_ok() {
                    alpmi_apmr_a_data_ind(net, ar, prio, status);
                } else {
                    error!("error parsing alarm ack");
                }
            }
        } else if header.block_type == ar.apmx[prio].block_type_alarm_notify {
            // An Alarm Notification PDU: deliver to ALPMR.
            apms_a_data_ind(net, ar, prio, fixed);
            let apmx = &mut ar.apmx[prio];
            apmx.exp_seq_count_o = apmx.exp_seq_count;
            apmx.exp_seq_count = apmx.exp_seq_count.wrapping_add(1) & 0x7FFF;
            if apmr_send_ack(net, ar, prio).is_ok() {
                let data = AlarmNotification::decode(r);
                let data_usi = r.get_u16();
                if r.result().is_ok() {
                    let payload = r.tail().to_vec();
                    alpmr_apmr_a_data_ind(net, ar, prio, &data, data_usi, &payload);
                } else {
                    error!("error parsing alarm notification");
                }
            }
        } else {
            error!(
                "unhandled incoming alarm block type {:#06x}",
                header.block_type
            );
            error_ind(
                net,
                ar,
                error_code_1::RTA_ERR_CLS_PROTOCOL,
                error_code_2_abort::AR_ALARM_IND_ERROR,
            );
        }
    } else if fixed.send_seq_num == ar.apmx[prio].exp_seq_count_o {
        // A repeat of the previous frame: re-ack idempotently, no user
        // callback.
        apms_a_data_ind(net, ar, prio, fixed);
        let _ = apmr_send_ack(net, ar, prio);
    } else {
        ar.err_cls = error_code_1::RTA_ERR_CLS_PROTOCOL;
        ar.err_code = error_code_2_abort::CODE_SEQ;
        let status = PnioStatus::new(
            error_code::PNIO,
            error_decode::PNIO,
            ar.err_cls,
            ar.err_code,
        );
        let arep = ar.arep;
        net.fspm_log_book_entry(arep, &ar.ar_param.ar_uuid, status, 0);
        let _ = apmr_send_nack(net, ar, prio);
    }
}

/// Drain the receive mailboxes of one AR, handling at most the frames
/// already queued.
pub fn apmr_periodic(net: &mut Net, ar: &mut Ar) {
    for prio in 0..2 {
        while ar.apmx[prio].apmr_state != ApmrState::Closed {
            let Some(msg) = ar.apmx[prio].mailbox.fetch() else {
                break;
            };
            let buf = msg.buf.clone();
            let mut r = BlockReader::new(&buf[msg.payload_at..]);
            let fixed = AlarmFixed::decode(&mut r);
            let var_part_len = r.get_u16();
            if r.result().is_err() {
                error!("truncated alarm frame dropped");
                continue;
            }
            if fixed.version != RTA_PDU_VERSION {
                error!("wrong alarm PDU version {}", fixed.version);
                continue;
            }
            match fixed.pdu_type {
                RtaPduType::Ack => {
                    if var_part_len == 0 {
                        apms_a_data_ind(net, ar, prio, &fixed);
                    } else {
                        error!("wrong var_part_len {} for ACK frame", var_part_len);
                    }
                }
                RtaPduType::Nack => {
                    if var_part_len != 0 {
                        error!("wrong var_part_len {} for NACK frame", var_part_len);
                    }
                }
                RtaPduType::Data => {
                    apmr_a_data_ind(net, ar, prio, &fixed, &mut r);
                }
                RtaPduType::Err => {
                    if var_part_len == 4 {
                        let status = PnioStatus::decode(&mut r);
                        info!(
                            "alarm ERR from controller: ERRCLS {:#04x} ERRCODE {:#04x}",
                            status.error_code_1, status.error_code_2
                        );
                        error_ind(net, ar, status.error_code_1, status.error_code_2);
                    } else {
                        error!("wrong var_part_len {} for ERR frame", var_part_len);
                    }
                }
                RtaPduType::Invalid => {
                    error!("invalid alarm PDU type");
                }
            }
            // An error handler may have aborted the AR mid-drain.
            if ar.cmdev_state == crate::cmdev::CmdevState::Abort {
                return;
            }
        }
    }
}

/// Send at most one queued alarm per priority, preferring high priority.
pub fn almpi_periodic(net: &mut Net, ar: &mut Ar) {
    if !ar.alarm_enable {
        return;
    }
    for prio in (0..2).rev() {
        if ar.alpmx[prio].alpmi_state != AlpmiState::WAlarm {
            continue;
        }
        if let Some(pending) = ar.alarm_send_q[prio].pop() {
            send_internal(net, ar, prio, pending);
            // A high prio alarm postpones low prio work to the next tick.
            break;
        }
    }
}

/// Build the diagnosis summary and hand one alarm to APMS.
fn send_internal(net: &mut Net, ar: &mut Ar, prio: usize, pending: PendingAlarm) {
    let (specifier, maint_status) = diag_summary(
        net,
        ar,
        pending.api_id,
        pending.slot_number,
        pending.subslot_number,
        None,
    );

    let sequence_number = ar.alpmx[prio].sequence_number;
    ar.alpmx[prio].prev_sequence_number = sequence_number;
    ar.alpmx[prio].sequence_number = (sequence_number + 1) % 0x0800;

    let data = AlarmNotification {
        alarm_type: pending.alarm_type,
        api_id: pending.api_id,
        slot_number: pending.slot_number,
        subslot_number: pending.subslot_number,
        module_ident: pending.module_ident,
        submodule_ident: pending.submodule_ident,
        specifier,
        sequence_number,
    };
    let result = apms_a_data_req(
        net,
        ar,
        prio,
        PduPayload::Notification {
            data,
            maint_status,
            payload_usi: pending.payload_usi,
            payload: &pending.payload,
        },
    );
    if result.is_ok() {
        ar.alpmx[prio].alpmi_state = AlpmiState::WAck;
    } else {
        error!("failed to send alarm for AREP {}", ar.arep);
    }
}

/// The application acknowledges a controller alarm. Always uses the high
/// priority pair.
pub fn alpmr_alarm_ack(
    net: &mut Net,
    ar: &mut Ar,
    arg: &AlarmArgument,
    status: PnioStatus,
) -> Result<(), ()> {
    let prio = 1;
    match ar.alpmx[prio].alpmr_state {
        AlpmrState::WUserAck => {
            let data = AlarmAck {
                alarm_type: arg.alarm_type,
                api_id: arg.api_id,
                slot_number: arg.slot_number,
                subslot_number: arg.subslot_number,
                specifier: arg.specifier,
                sequence_number: arg.sequence_number,
            };
            let seq = ar.alpmx[prio].sequence_number;
            ar.alpmx[prio].prev_sequence_number = seq;
            ar.alpmx[prio].sequence_number = (seq + 1) % 0x0800;

            let result = apms_a_data_req(net, ar, prio, PduPayload::Ack { data, status });
            ar.alpmx[prio].alpmr_state = AlpmrState::WTack;
            result
        }
        state => {
            error!("alarm ack attempted in ALPMR state {:?}", state);
            ar.err_cls = error_code_1::ALPMI;
            ar.err_code = error_code_2_alarm::ALPMI_WRONG_STATE;
            Err(())
        }
    }
}

/// Reduce one diagnosis item into the alarm specifier and maintenance
/// status.
pub fn add_diag_item_to_summary(
    same_ar: bool,
    item: &DiagItem,
    specifier: &mut AlarmSpecifier,
    maint_status: &mut u32,
) {
    /// Qualifier bits 7..17: maintenance-required severity.
    const QUALIFIER_MASK_REQUIRED: u32 = 0x0001_FF80;
    /// Qualifier bits 17..27: maintenance-demanded severity.
    const QUALIFIER_MASK_DEMANDED: u32 = 0x07FE_0000;
    /// Qualifier bits 27..32: fault severity.
    const QUALIFIER_MASK_FAULT: u32 = 0xF800_0000;
    /// All severity bits of the qualifier.
    const QUALIFIED_SEVERITY_MASK: u32 =
        QUALIFIER_MASK_REQUIRED | QUALIFIER_MASK_DEMANDED | QUALIFIER_MASK_FAULT;

    if item.usi < usi::CHANNEL_DIAGNOSIS {
        // Manufacturer specific format: always a fault.
        specifier.manufacturer_diagnosis = true;
        specifier.submodule_diagnosis = true;
        if same_ar {
            specifier.ar_diagnosis = true;
        }
        return;
    }

    let severity_qualifier = item.qualifier & QUALIFIED_SEVERITY_MASK;
    let maintenance = ch_prop::maintenance(item.channel_properties);

    let is_required = maintenance == ch_prop::MAINT_REQUIRED
        || (maintenance == ch_prop::MAINT_QUALIFIED
            && severity_qualifier & QUALIFIER_MASK_REQUIRED != 0);
    let is_demanded = maintenance == ch_prop::MAINT_DEMANDED
        || (maintenance == ch_prop::MAINT_QUALIFIED
            && severity_qualifier & QUALIFIER_MASK_DEMANDED != 0);
    let is_fault = maintenance == ch_prop::MAINT_FAULT
        || (maintenance == ch_prop::MAINT_QUALIFIED
            && severity_qualifier & QUALIFIER_MASK_FAULT != 0);
    let is_appearing = ch_prop::specifier(item.channel_properties) == ch_prop::SPEC_APPEARS;

    *maint_status |= severity_qualifier;
    if is_required {
        *maint_status |= 1 << 0;
    }
    if is_demanded {
        *maint_status |= 1 << 1;
    }

    if is_appearing {
        specifier.channel_diagnosis = true;
        if is_fault {
            specifier.submodule_diagnosis = true;
            if same_ar {
                specifier.ar_diagnosis = true;
            }
        }
    }
}

/// Summarise the diagnosis state of one subslot, optionally including a
/// not-yet-listed "current" item.
pub fn diag_summary(
    net: &Net,
    ar: &Ar,
    api_id: u32,
    slot_number: u16,
    subslot_number: u16,
    current: Option<&DiagItem>,
) -> (AlarmSpecifier, u32) {
    let mut specifier = AlarmSpecifier::default();
    let mut maint_status = 0u32;

    let Some(subslot) = net.device.subslot(api_id, slot_number, subslot_number) else {
        return (specifier, maint_status);
    };
    let same_ar = subslot.owning_ar == Some(ar.arep);

    if let Some(item) = current {
        add_diag_item_to_summary(same_ar, item, &mut specifier, &mut maint_status);
    }

    let pool = net.device.diag.lock();
    for ix in net.device.diag_chain(&pool, subslot) {
        if let Some(item) = pool.get(ix) {
            add_diag_item_to_summary(same_ar, item, &mut specifier, &mut maint_status);
        }
    }

    (specifier, maint_status)
}

fn queue_alarm(ar: &mut Ar, high_prio: bool, alarm: PendingAlarm) -> Result<(), ()> {
    if !ar.alarm_enable {
        return Err(());
    }
    ar.alarm_send_q[if high_prio { 1 } else { 0 }].push(alarm)
}

/// Queue a process alarm (high priority).
pub fn send_process(
    net: &mut Net,
    ar: &mut Ar,
    api_id: u32,
    slot_number: u16,
    subslot_number: u16,
    payload_usi: u16,
    payload: &[u8],
) -> Result<(), ()> {
    if !net.global_alarm_enable {
        return Err(());
    }
    if payload_usi >= usi::CHANNEL_DIAGNOSIS {
        error!(
            "wrong USI {:#06x} for process alarm, slot {} subslot {}",
            payload_usi, slot_number, subslot_number
        );
        return Err(());
    }
    info!(
        "queueing process alarm, slot {} subslot {}, {} bytes, USI {:#06x}",
        slot_number,
        subslot_number,
        payload.len(),
        payload_usi
    );
    queue_alarm(
        ar,
        true,
        PendingAlarm {
            alarm_type: alarm_type::PROCESS,
            api_id,
            slot_number,
            subslot_number,
            payload_usi,
            payload: payload.to_vec(),
            ..Default::default()
        },
    )
}

/// Queue a diagnosis (or port-data-change) alarm for a diagnosis item
/// (low priority).
pub fn send_diagnosis(
    net: &mut Net,
    ar: &mut Ar,
    api_id: u32,
    slot_number: u16,
    subslot_number: u16,
    item: &DiagItem,
) -> Result<(), ()> {
    if !net.global_alarm_enable {
        return Err(());
    }
    let mut kind = alarm_type::DIAGNOSIS;
    if item.usi >= usi::CHANNEL_DIAGNOSIS
        && item.channel_error_type == crate::diag::CH_ERROR_REMOTE_MISMATCH
    {
        kind = alarm_type::PORT_DATA_CHANGE;
    }
    let Some(module_ident) = net.device.module_ident(api_id, slot_number) else {
        error!("no module ident for slot {}", slot_number);
        return Err(());
    };
    let Some(submodule_ident) = net.device.submodule_ident(api_id, slot_number, subslot_number)
    else {
        error!(
            "no submodule ident for slot {} subslot {}",
            slot_number, subslot_number
        );
        return Err(());
    };
    // The diagnosis item itself rides as the payload: standard format for
    // channel diagnoses, the raw manufacturer data for USI format.
    let mut w = BlockWriter::new(64);
    let encoded = (|| {
        if item.usi < usi::CHANNEL_DIAGNOSIS {
            w.put_mem(&item.manuf_data[..item.manuf_len as usize])?;
        } else {
            w.put_u16(item.channel_number)?;
            w.put_u16(item.channel_properties)?;
            w.put_u16(item.channel_error_type)?;
            if item.usi >= usi::EXTENDED_CHANNEL_DIAGNOSIS {
                w.put_u16(item.ext_channel_error_type)?;
                w.put_u32(item.ext_channel_add_value)?;
            }
            if item.usi >= usi::QUALIFIED_CHANNEL_DIAGNOSIS {
                w.put_u32(item.qualifier)?;
            }
        }
        Ok::<(), pnet_types::WriteError>(())
    })();
    if encoded.is_err() {
        return Err(());
    }
    info!(
        "queueing diagnosis alarm type {:#06x}, slot {} subslot {:#06x} USI {:#06x}",
        kind, slot_number, subslot_number, item.usi
    );
    queue_alarm(
        ar,
        false,
        PendingAlarm {
            alarm_type: kind,
            api_id,
            slot_number,
            subslot_number,
            module_ident,
            submodule_ident,
            payload_usi: item.usi,
            payload: w.into_vec(),
        },
    )
}

/// Queue a pull alarm (low priority). Subslot 0 with the AR's permission
/// becomes a pull-module alarm.
pub fn send_pull(
    net: &mut Net,
    ar: &mut Ar,
    api_id: u32,
    slot_number: u16,
    subslot_number: u16,
) {
    if !net.global_alarm_enable {
        return;
    }
    let mut kind = alarm_type::PULL;
    if subslot_number == 0 && ar.ar_param.properties.pull_module_alarm_allowed {
        kind = alarm_type::PULL_MODULE;
    }
    info!(
        "queueing pull alarm, slot {} subslot {:#06x}",
        slot_number, subslot_number
    );
    let _ = queue_alarm(
        ar,
        false,
        PendingAlarm {
            alarm_type: kind,
            api_id,
            slot_number,
            subslot_number,
            ..Default::default()
        },
    );
}

/// Queue a plug alarm (low priority).
pub fn send_plug(
    net: &mut Net,
    ar: &mut Ar,
    api_id: u32,
    slot_number: u16,
    subslot_number: u16,
    module_ident: u32,
    submodule_ident: u32,
    wrong: bool,
) {
    if !net.global_alarm_enable {
        return;
    }
    info!(
        "queueing {} alarm, slot {} subslot {:#06x}",
        if wrong { "plug-wrong" } else { "plug" },
        slot_number,
        subslot_number
    );
    let _ = queue_alarm(
        ar,
        false,
        PendingAlarm {
            alarm_type: if wrong {
                alarm_type::PLUG_WRONG_MODULE
            } else {
                alarm_type::PLUG
            },
            api_id,
            slot_number,
            subslot_number,
            module_ident,
            submodule_ident,
            ..Default::default()
        },
    );
}
