// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! CMRPC: the DCE/RPC dispatcher.
//!
//! Parses connectionless DCE/RPC PDUs, reassembles fragmented requests
//! keyed on the activity UUID, routes the opcode to CMDEV / CMWRR / FSPM,
//! caches the prepared response so retransmissions are answered without
//! re-running the handler, fragments oversized responses, and drives the
//! device-originated CControl (Application Ready) exchange.
//!
//! Response bodies are `NDR header | PNIO status | blocks`.

use bytes::Bytes;
use log::{debug, error, info, warn};

use pnet_types::blocks::control::{ControlBlock, ControlCommand};
use pnet_types::blocks::record::{ReadRequest, ReadResult, WriteRequest, WriteResult};
use pnet_types::blocks::rpc::{opnum, NdrHeader, RpcFlags, RpcHeader, RpcPacketType, RPC_HEADER_SIZE};
use pnet_types::blocks::{begin_block, block_type, end_block, index, BlockHeader};
use pnet_types::status::{error_code_1, error_code_2_cmrpc};
use pnet_types::{
    device_interface_uuid, BlockReader, BlockWriter, ParseError, PnetUuid, PnioStatus, StackError,
};

use crate::ar::{Ar, Arep, Iocr, MAX_CRS};
use crate::cmdev;
use crate::cmwrr;
use crate::net::Net;

/// Number of concurrently tracked RPC sessions.
pub const MAX_SESSIONS: usize = 8;
/// Upper bound of a reassembled request or prepared response body.
pub const MAX_SESSION_BUFFER_SIZE: usize = 4500;
/// Body bytes carried per fragment.
pub const FRAGMENT_BODY_SIZE: usize = 1398;

/// One RPC session, keyed on the activity UUID.
pub struct RpcSession {
    /// The peer's activity UUID.
    pub activity_uuid: PnetUuid,
    /// Sequence number of the call being served.
    pub sequence_number: u32,
    /// The AR this session belongs to, once known.
    pub arep: Option<Arep>,
    /// True for sessions we originated (CControl out).
    pub from_me: bool,
    /// Reassembly buffer for fragmented requests.
    pub in_buf: Vec<u8>,
    /// Next expected inbound fragment number.
    pub next_fragment: u16,
    /// The prepared response, kept for retransmissions.
    pub response: Vec<Bytes>,
}

/// The session table.
#[derive(Default)]
pub struct Cmrpc {
    sessions: Vec<RpcSession>,
}

impl Cmrpc {
    fn find(&mut self, activity_uuid: &PnetUuid, from_me: bool) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.activity_uuid == *activity_uuid && s.from_me == from_me)
    }

    fn alloc(&mut self, activity_uuid: PnetUuid, from_me: bool) -> Option<usize> {
        if self.sessions.len() >= MAX_SESSIONS {
            error!("RPC session pool exhausted");
            return None;
        }
        self.sessions.push(RpcSession {
            activity_uuid,
            sequence_number: 0,
            arep: None,
            from_me,
            in_buf: Vec::new(),
            next_fragment: 0,
            response: Vec::new(),
        });
        Some(self.sessions.len() - 1)
    }

    fn release(&mut self, ix: usize) {
        self.sessions.swap_remove(ix);
    }

    /// Drop every session bound to an aborted AR.
    pub fn release_for_ar(&mut self, arep: Arep) {
        self.sessions.retain(|s| s.arep != Some(arep));
    }
}

/// Handle one received RPC PDU. Returns the response PDUs to transmit
/// (empty for no response).
pub fn handle_packet(net: &mut Net, packet: &[u8]) -> Vec<Bytes> {
    let mut r = BlockReader::new(packet);
    let hdr = RpcHeader::decode(&mut r);
    if r.result().is_err() {
        error!("truncated RPC header");
        return Vec::new();
    }
    match hdr.packet_type {
        RpcPacketType::Request => handle_request(net, &hdr, packet),
        RpcPacketType::Response => {
            handle_response(net, &hdr, packet);
            Vec::new()
        }
        other => {
            debug!("ignoring RPC packet type {:?}", other);
            Vec::new()
        }
    }
}

fn body_of<'a>(hdr: &RpcHeader, packet: &'a [u8]) -> Option<&'a [u8]> {
    let start = RPC_HEADER_SIZE;
    let end = start + hdr.length_of_body as usize;
    packet.get(start..end)
}

fn handle_request(net: &mut Net, hdr: &RpcHeader, packet: &[u8]) -> Vec<Bytes> {
    let Some(body) = body_of(hdr, packet) else {
        error!("RPC body shorter than length_of_body");
        return Vec::new();
    };

    let session_ix = match net.rpc.find(&hdr.activity_uuid, false) {
        Some(ix) => ix,
        None => match net.rpc.alloc(hdr.activity_uuid, false) {
            Some(ix) => ix,
            None => return Vec::new(),
        },
    };

    {
        let session = &mut net.rpc.sessions[session_ix];
        if hdr.sequence_number == session.sequence_number && !session.response.is_empty() {
            // A retransmission: answer from the cache without re-running
            // the handler.
            info!(
                "RPC retransmission of seq {} answered from cache",
                hdr.sequence_number
            );
            return session.response.clone();
        }
        if hdr.sequence_number != session.sequence_number {
            session.sequence_number = hdr.sequence_number;
            session.in_buf.clear();
            session.next_fragment = 0;
            session.response.clear();
        }
    }

    // Reassemble fragments keyed on {activity uuid, sequence number}.
    let full_body: Vec<u8> = if hdr.flags.fragment {
        let session = &mut net.rpc.sessions[session_ix];
        if hdr.fragment_number != session.next_fragment {
            warn!(
                "out-of-order RPC fragment {} (expected {}), dropped",
                hdr.fragment_number, session.next_fragment
            );
            return Vec::new();
        }
        if session.in_buf.len() + body.len() > MAX_SESSION_BUFFER_SIZE {
            error!("fragmented RPC request exceeds the session buffer");
            session.in_buf.clear();
            session.next_fragment = 0;
            return Vec::new();
        }
        session.in_buf.extend_from_slice(body);
        session.next_fragment += 1;
        if !hdr.flags.last_fragment {
            return Vec::new();
        }
        std::mem::take(&mut net.rpc.sessions[session_ix].in_buf)
    } else {
        body.to_vec()
    };

    let mut r = BlockReader::new(&full_body);
    r.set_big_endian(hdr.is_big_endian);
    let ndr = NdrHeader::decode(&mut r);
    // Block payloads are big-endian regardless of the NDR representation.
    r.set_big_endian(true);
    if r.result().is_err() {
        error!("truncated NDR header");
        return Vec::new();
    }

    let mut args = BlockWriter::new(MAX_SESSION_BUFFER_SIZE);
    let outcome = match hdr.opnum {
        opnum::CONNECT => rm_connect_ind(net, &hdr.activity_uuid, &mut r, &mut args),
        opnum::RELEASE => rm_release_ind(net, &mut r, &mut args),
        opnum::READ | opnum::READ_IMPLICIT => rm_read_ind(net, &mut r, &mut args),
        opnum::WRITE => rm_write_ind(net, &mut r, &mut args),
        opnum::CONTROL => rm_dcontrol_ind(net, &mut r, &mut args),
        other => {
            error!("unknown RPC opnum {}", other);
            Err(StackError::new(
                pnet_types::status::error_code::PNIO,
                pnet_types::status::error_decode::PNIO,
                error_code_1::CMRPC,
                error_code_2_cmrpc::UNKNOWN_BLOCKS,
            ))
        }
    };

    let (status, blocks) = match outcome {
        Ok(()) => (PnioStatus::ok(), args.into_vec()),
        Err(e) => {
            info!("RPC request opnum {} rejected: {}", hdr.opnum, e);
            (e.pnio_status, Vec::new())
        }
    };

    let response = build_response(hdr, &ndr, status, &blocks);
    // A handler may have torn sessions down (AR abort); re-resolve the
    // session before caching the response.
    if let Some(ix) = net.rpc.find(&hdr.activity_uuid, false) {
        net.rpc.sessions[ix].response = response.clone();
    }
    response
}

/// Assemble the response PDUs: header plus `NDR | status | blocks`,
/// fragmented when the body exceeds one PDU.
fn build_response(
    req: &RpcHeader,
    req_ndr: &NdrHeader,
    status: PnioStatus,
    blocks: &[u8],
) -> Vec<Bytes> {
    let mut args = BlockWriter::new(MAX_SESSION_BUFFER_SIZE + 8);
    let _ = status.encode(&mut args);
    let _ = args.put_mem(blocks);
    let args = args.into_vec();

    let mut body = BlockWriter::new(MAX_SESSION_BUFFER_SIZE + 32);
    let _ = NdrHeader {
        args_maximum: req_ndr.args_maximum,
        args_length: args.len() as u32,
        maximum_count: req_ndr.args_maximum,
        offset: 0,
        actual_count: args.len() as u32,
    }
    .encode(&mut body);
    let _ = body.put_mem(&args);
    let body = body.into_vec();

    let fragments: Vec<&[u8]> = if body.len() <= FRAGMENT_BODY_SIZE {
        vec![&body[..]]
    } else {
        body.chunks(FRAGMENT_BODY_SIZE).collect()
    };
    let fragmented = fragments.len() > 1;

    let mut out = Vec::with_capacity(fragments.len());
    for (ix, chunk) in fragments.iter().enumerate() {
        let hdr = RpcHeader {
            version: 4,
            packet_type: RpcPacketType::Response,
            flags: RpcFlags {
                fragment: fragmented,
                last_fragment: fragmented && ix == fragments.len() - 1,
                no_fack: true,
                idempotent: req.flags.idempotent,
                ..Default::default()
            },
            cancel_pending: false,
            is_big_endian: true,
            float_repr: 0,
            serial_high: 0,
            object_uuid: req.object_uuid,
            interface_uuid: req.interface_uuid,
            activity_uuid: req.activity_uuid,
            server_boot_time: req.server_boot_time,
            interface_version: req.interface_version,
            sequence_number: req.sequence_number,
            opnum: req.opnum,
            interface_hint: 0xFFFF,
            activity_hint: 0xFFFF,
            length_of_body: chunk.len() as u16,
            fragment_number: ix as u16,
            auth_protocol: 0,
            serial_low: 0,
        };
        let mut w = BlockWriter::new(RPC_HEADER_SIZE + chunk.len());
        let _ = hdr.encode(&mut w);
        let _ = w.put_mem(chunk);
        out.push(Bytes::from(w.into_vec()));
    }
    out
}

/// Skip to the end of a block whose header was already consumed,
/// tolerating trailing padding inside the declared length.
fn finish_block(r: &mut BlockReader, block_start: usize, header: &BlockHeader) {
    // block_length counts the version bytes plus the body.
    let end = block_start + 4 + header.block_length as usize;
    if r.pos() < end {
        r.skip(end - r.pos());
    }
}

fn map_parse_error(e: ParseError) -> StackError {
    match e {
        ParseError::OutOfApiResources | ParseError::OutOfExpSubmoduleResources => StackError::new(
            pnet_types::status::error_code::CONNECT,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::OUT_OF_MEMORY,
        ),
        _ => StackError::new(
            pnet_types::status::error_code::CONNECT,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::WRONG_BLOCK_COUNT,
        ),
    }
}

/// Connect: parse the request blocks into a fresh AR, validate through
/// CMDEV, and emit the response blocks.
fn rm_connect_ind(
    net: &mut Net,
    activity_uuid: &PnetUuid,
    r: &mut BlockReader,
    out: &mut BlockWriter,
) -> Result<(), StackError> {
    let arep = net.next_arep();
    let mut ar = Ar::new(arep);

    while r.remaining() >= 6 && r.result().is_ok() {
        let block_start = r.pos();
        let header = BlockHeader::decode(r);
        match header.block_type {
            block_type::AR_BLOCK_REQ => {
                ar.ar_param = pnet_types::blocks::ar::ArParam::decode(r);
                ar.has_ar_param = true;
            }
            block_type::IOCR_BLOCK_REQ => {
                if ar.iocrs.len() >= MAX_CRS {
                    return Err(StackError::new(
                        pnet_types::status::error_code::CONNECT,
                        pnet_types::status::error_decode::PNIO,
                        error_code_1::CMRPC,
                        error_code_2_cmrpc::OUT_OF_MEMORY,
                    ));
                }
                let param = pnet_types::blocks::iocr::IocrParam::decode(r);
                ar.iocrs.push(Iocr {
                    param,
                    ..Default::default()
                });
            }
            block_type::ALARM_CR_BLOCK_REQ => {
                ar.alarm_cr_request =
                    Some(pnet_types::blocks::alarm::AlarmCrRequest::decode(r));
                ar.nbr_alarm_cr += 1;
            }
            block_type::EXPECTED_SUBMODULE_BLOCK => {
                ar.exp_ident
                    .merge_block(r, crate::dev::MAX_APIS, crate::dev::MAX_SLOTS);
            }
            block_type::AR_RPC_BLOCK_REQ => {
                ar.rpc_initiator_port = Some(r.get_u16());
            }
            block_type::PRM_SERVER_BLOCK_REQ | block_type::MCR_BLOCK_REQ => {
                // Recognised but not implemented.
                info!(
                    "rejecting connect with unsupported block {:#06x}",
                    header.block_type
                );
                return Err(StackError::new(
                    pnet_types::status::error_code::CONNECT,
                    pnet_types::status::error_decode::PNIO,
                    error_code_1::CMRPC,
                    error_code_2_cmrpc::UNKNOWN_BLOCKS,
                ));
            }
            other => {
                error!("unknown block {:#06x} in connect request", other);
                return Err(StackError::new(
                    pnet_types::status::error_code::CONNECT,
                    pnet_types::status::error_decode::PNIO,
                    error_code_1::CMRPC,
                    error_code_2_cmrpc::UNKNOWN_BLOCKS,
                ));
            }
        }
        finish_block(r, block_start, &header);
    }
    r.result().map_err(map_parse_error)?;

    // A connect for an AR UUID that is already live replaces the old AR.
    let old_arep = net
        .live_ars()
        .find(|other| other.ar_param.ar_uuid == ar.ar_param.ar_uuid)
        .map(|other| other.arep);
    if let Some(old_arep) = old_arep {
        warn!(
            "connect for already-known AR UUID {}; aborting AREP {}",
            ar.ar_param.ar_uuid, old_arep
        );
        net.with_ar(old_arep, |net, old| cmdev::abort(net, old));
    }

    cmdev::init_req(net, &mut ar);
    match cmdev::rm_connect_ind(net, &mut ar) {
        Ok(()) => {
            let write = (|| {
                let slot = begin_block(out, block_type::AR_BLOCK_RES)?;
                ar.ar_result.encode(out)?;
                end_block(out, slot);
                for iocr in &ar.iocrs {
                    let slot = begin_block(out, block_type::IOCR_BLOCK_RES)?;
                    iocr.result.encode(out)?;
                    end_block(out, slot);
                }
                let slot = begin_block(out, block_type::ALARM_CR_BLOCK_RES)?;
                ar.alarm_cr_result.encode(out)?;
                end_block(out, slot);
                if !ar.diff.is_empty() {
                    let slot = begin_block(out, block_type::MODULE_DIFF_BLOCK)?;
                    ar.diff.encode(out)?;
                    end_block(out, slot);
                }
                let slot = begin_block(out, block_type::AR_SERVER_BLOCK)?;
                ar.ar_server.encode(out)?;
                end_block(out, slot);
                Ok::<(), pnet_types::WriteError>(())
            })();
            if write.is_err() {
                error!("connect response did not fit the session buffer");
                return Err(StackError::new(
                    pnet_types::status::error_code::CONNECT,
                    pnet_types::status::error_decode::PNIO,
                    error_code_1::CMRPC,
                    error_code_2_cmrpc::OUT_OF_MEMORY,
                ));
            }
            if !net.store_ar(ar) {
                return Err(StackError::new(
                    pnet_types::status::error_code::CONNECT,
                    pnet_types::status::error_decode::PNIO,
                    error_code_1::CMRPC,
                    error_code_2_cmrpc::OUT_OF_AR_RESOURCES,
                ));
            }
            if let Some(ix) = net.rpc.find(activity_uuid, false) {
                net.rpc.sessions[ix].arep = Some(arep);
            }
            Ok(())
        }
        Err(e) => {
            cmdev::connect_rsp_neg(net, &mut ar, &e);
            Err(e)
        }
    }
}

/// Release: tear the AR down and confirm.
fn rm_release_ind(
    net: &mut Net,
    r: &mut BlockReader,
    out: &mut BlockWriter,
) -> Result<(), StackError> {
    let block_start = r.pos();
    let header = BlockHeader::decode(r);
    if header.block_type != block_type::RELEASE_BLOCK_REQ {
        return Err(StackError::new(
            pnet_types::status::error_code::RELEASE,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::UNKNOWN_BLOCKS,
        ));
    }
    let control = ControlBlock::decode(r);
    finish_block(r, block_start, &header);
    r.result().map_err(|_| {
        StackError::new(
            pnet_types::status::error_code::RELEASE,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::WRONG_BLOCK_COUNT,
        )
    })?;

    let Some(arep) = net.find_ar_by_uuid(&control.ar_uuid) else {
        return Err(StackError::new(
            pnet_types::status::error_code::RELEASE,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::AR_UUID_UNKNOWN,
        ));
    };
    info!("release for AREP {}", arep);
    net.with_ar(arep, |net, ar| cmdev::rm_release_ind(net, ar));

    let response = ControlBlock {
        ar_uuid: control.ar_uuid,
        session_key: control.session_key,
        alarm_sequence_number: 0,
        control_command: ControlCommand::DONE,
        control_block_properties: 0,
    };
    let slot = begin_block(out, block_type::RELEASE_BLOCK_RES).map_err(write_overflow)?;
    response.encode(out).map_err(write_overflow)?;
    end_block(out, slot);
    Ok(())
}

fn write_overflow(_: pnet_types::WriteError) -> StackError {
    StackError::new(
        pnet_types::status::error_code::PNIO,
        pnet_types::status::error_decode::PNIO,
        error_code_1::CMRPC,
        error_code_2_cmrpc::OUT_OF_MEMORY,
    )
}

/// DControl: PrmEnd from the controller.
fn rm_dcontrol_ind(
    net: &mut Net,
    r: &mut BlockReader,
    out: &mut BlockWriter,
) -> Result<(), StackError> {
    let block_start = r.pos();
    let header = BlockHeader::decode(r);
    if header.block_type != block_type::PRM_END_REQ {
        return Err(StackError::new(
            pnet_types::status::error_code::CONTROL,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::UNKNOWN_BLOCKS,
        ));
    }
    let control = ControlBlock::decode(r);
    finish_block(r, block_start, &header);
    r.result().map_err(|_| {
        StackError::new(
            pnet_types::status::error_code::CONTROL,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::WRONG_BLOCK_COUNT,
        )
    })?;

    let Some(arep) = net.find_ar_by_uuid(&control.ar_uuid) else {
        return Err(StackError::new(
            pnet_types::status::error_code::CONTROL,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::AR_UUID_UNKNOWN,
        ));
    };

    let result = net
        .with_ar(arep, |net, ar| {
            if control.session_key != ar.session_key() {
                return Err(StackError::new(
                    pnet_types::status::error_code::CONTROL,
                    pnet_types::status::error_decode::PNIO,
                    error_code_1::CMRPC,
                    error_code_2_cmrpc::STATE_CONFLICT,
                ));
            }
            cmdev::rm_dcontrol_ind(net, ar, &control)
        })
        .unwrap_or(Err(StackError::new(
            pnet_types::status::error_code::CONTROL,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::AR_UUID_UNKNOWN,
        )));
    result?;

    let response = ControlBlock {
        ar_uuid: control.ar_uuid,
        session_key: control.session_key,
        alarm_sequence_number: 0,
        control_command: ControlCommand::DONE,
        control_block_properties: 0,
    };
    let slot = begin_block(out, block_type::PRM_END_RES).map_err(write_overflow)?;
    response.encode(out).map_err(write_overflow)?;
    end_block(out, slot);

    // The PrmEnd event is delivered after the response is prepared; the
    // application may then stage data and call application_ready().
    net.with_ar(arep, |net, ar| cmdev::prm_end_event(net, ar));
    Ok(())
}

/// Read: route the record index and emit the response header plus data.
fn rm_read_ind(
    net: &mut Net,
    r: &mut BlockReader,
    out: &mut BlockWriter,
) -> Result<(), StackError> {
    let block_start = r.pos();
    let header = BlockHeader::decode(r);
    if header.block_type != block_type::IOD_READ_REQ_HEADER {
        return Err(StackError::read_access(error_code_1::ACC_INVALID_INDEX));
    }
    let request = ReadRequest::decode(r);
    finish_block(r, block_start, &header);
    r.result()
        .map_err(|_| StackError::read_access(error_code_1::ACC_INVALID_INDEX))?;

    let arep = net.find_ar_by_uuid(&request.ar_uuid);
    let data = read_record(net, arep, &request)?;

    let result = ReadResult {
        sequence_number: request.sequence_number,
        ar_uuid: request.ar_uuid,
        api: request.api,
        slot_number: request.slot_number,
        subslot_number: request.subslot_number,
        index: request.index,
        record_data_length: data.len() as u32,
        add_data_1: 0,
        add_data_2: 0,
    };
    let slot = begin_block(out, block_type::IOD_READ_RES_HEADER).map_err(write_overflow)?;
    result.encode(out).map_err(write_overflow)?;
    end_block(out, slot);
    out.put_mem(&data).map_err(write_overflow)?;
    Ok(())
}

fn read_record(
    net: &mut Net,
    arep: Option<Arep>,
    request: &ReadRequest,
) -> Result<Vec<u8>, StackError> {
    if request.index <= index::USER_MAX {
        let Some(arep) = arep else {
            return Err(StackError::read_access(error_code_1::ACC_STATE_CONFLICT));
        };
        return net.fspm_read_ind(arep, request);
    }
    if (index::SUB_IM_0..=index::SUB_IM_15).contains(&request.index) {
        return net.fspm.read_im(request.index);
    }
    match request.index {
        index::DEV_LOGBOOK_DATA => {
            info!("PLC reads the log book");
            let mut w = BlockWriter::new(1024);
            net.fspm
                .log_book
                .lock()
                .encode(&mut w)
                .map_err(|_| StackError::read_access(error_code_1::APP_READ_ERROR))?;
            Ok(w.into_vec())
        }
        index::SUB_PDPORT_DATA_CHECK => {
            let mut w = BlockWriter::new(512);
            let present = net
                .ports
                .read_check(&mut w)
                .map_err(|_| StackError::read_access(error_code_1::APP_READ_ERROR))?;
            let _ = present;
            Ok(w.into_vec())
        }
        index::SUB_PDPORT_DATA_ADJ => {
            let mut w = BlockWriter::new(512);
            let present = net
                .ports
                .read_adjust(&mut w)
                .map_err(|_| StackError::read_access(error_code_1::APP_READ_ERROR))?;
            let _ = present;
            Ok(w.into_vec())
        }
        _ => Err(StackError::read_access(error_code_1::ACC_INVALID_INDEX)),
    }
}

/// Write: route through CMWRR and emit the response header.
fn rm_write_ind(
    net: &mut Net,
    r: &mut BlockReader,
    out: &mut BlockWriter,
) -> Result<(), StackError> {
    let block_start = r.pos();
    let header = BlockHeader::decode(r);
    if header.block_type != block_type::IOD_WRITE_REQ_HEADER {
        return Err(StackError::write_access(error_code_1::ACC_INVALID_INDEX));
    }
    let request = WriteRequest::decode(r);
    finish_block(r, block_start, &header);
    r.result()
        .map_err(|_| StackError::write_access(error_code_1::ACC_INVALID_INDEX))?;

    let tail = r.tail();
    let data_len = request.record_data_length as usize;
    if tail.len() < data_len {
        error!(
            "write record data truncated: {} of {} bytes",
            tail.len(),
            data_len
        );
        return Err(StackError::write_access(
            error_code_1::ACC_WRITE_LENGTH_ERROR,
        ));
    }
    let data = tail[..data_len].to_vec();

    let Some(arep) = net.find_ar_by_uuid(&request.ar_uuid) else {
        return Err(StackError::new(
            pnet_types::status::error_code::WRITE,
            pnet_types::status::error_decode::PNIO,
            error_code_1::CMRPC,
            error_code_2_cmrpc::AR_UUID_UNKNOWN,
        ));
    };

    let write_result = net
        .with_ar(arep, |net, ar| cmwrr::rm_write_ind(net, ar, &request, &data))
        .unwrap_or(Err(StackError::write_access(
            error_code_1::ACC_STATE_CONFLICT,
        )));

    let (status, add_data_1, add_data_2) = match &write_result {
        Ok(()) => (PnioStatus::ok(), 0, 0),
        Err(e) => (e.pnio_status, e.add_data_1, e.add_data_2),
    };
    let result = WriteResult {
        sequence_number: request.sequence_number,
        ar_uuid: request.ar_uuid,
        api: request.api,
        slot_number: request.slot_number,
        subslot_number: request.subslot_number,
        index: request.index,
        record_data_length: request.record_data_length,
        add_data_1,
        add_data_2,
        pnio_status: status,
    };
    let slot = begin_block(out, block_type::IOD_WRITE_RES_HEADER).map_err(write_overflow)?;
    result.encode(out).map_err(write_overflow)?;
    end_block(out, slot);

    // The write outcome rides in the response block; the RPC level status
    // stays positive unless the request itself was malformed.
    Ok(())
}

/// Send the device-originated CControl request (Application Ready).
pub fn ccontrol_req(net: &mut Net, ar: &Ar) -> Result<(), ()> {
    let activity_uuid = PnetUuid::new_random();
    let Some(session_ix) = net.rpc.alloc(activity_uuid, true) else {
        return Err(());
    };
    net.rpc.sessions[session_ix].arep = Some(ar.arep);

    let control = ControlBlock {
        ar_uuid: ar.ar_param.ar_uuid,
        session_key: ar.session_key(),
        alarm_sequence_number: 0,
        control_command: ControlCommand::APPLICATION_READY,
        control_block_properties: 0,
    };
    let mut args = BlockWriter::new(256);
    let build = (|| {
        let slot = begin_block(&mut args, block_type::APP_READY_REQ)?;
        control.encode(&mut args)?;
        end_block(&mut args, slot);
        Ok::<(), pnet_types::WriteError>(())
    })();
    if build.is_err() {
        return Err(());
    }
    let args = args.into_vec();

    let mut body = BlockWriter::new(512);
    let _ = NdrHeader {
        args_maximum: MAX_SESSION_BUFFER_SIZE as u32,
        args_length: args.len() as u32,
        maximum_count: MAX_SESSION_BUFFER_SIZE as u32,
        offset: 0,
        actual_count: args.len() as u32,
    }
    .encode(&mut body);
    let _ = body.put_mem(&args);
    let body = body.into_vec();

    let hdr = RpcHeader {
        version: 4,
        packet_type: RpcPacketType::Request,
        flags: RpcFlags {
            idempotent: true,
            no_fack: true,
            ..Default::default()
        },
        cancel_pending: false,
        is_big_endian: true,
        float_repr: 0,
        serial_high: 0,
        object_uuid: ar.ar_param.cm_initiator_object_uuid,
        interface_uuid: device_interface_uuid(),
        activity_uuid,
        server_boot_time: net.boot_time(),
        interface_version: 1,
        sequence_number: 0,
        opnum: opnum::CONTROL,
        interface_hint: 0xFFFF,
        activity_hint: 0xFFFF,
        length_of_body: body.len() as u16,
        fragment_number: 0,
        auth_protocol: 0,
        serial_low: 0,
    };
    let mut w = BlockWriter::new(RPC_HEADER_SIZE + body.len());
    let _ = hdr.encode(&mut w);
    let _ = w.put_mem(&body);

    info!("sending Application Ready request for AREP {}", ar.arep);
    net.rpc_send(Bytes::from(w.into_vec())).map_err(|_| ())
}

/// A response PDU arrived: complete the CControl exchange.
fn handle_response(net: &mut Net, hdr: &RpcHeader, packet: &[u8]) {
    let Some(session_ix) = net.rpc.find(&hdr.activity_uuid, true) else {
        debug!("RPC response for unknown activity {}", hdr.activity_uuid);
        return;
    };
    let arep = net.rpc.sessions[session_ix].arep;
    net.rpc.release(session_ix);

    let Some(body) = body_of(hdr, packet) else {
        error!("truncated RPC response body");
        return;
    };
    let mut r = BlockReader::new(body);
    r.set_big_endian(hdr.is_big_endian);
    let _ndr = NdrHeader::decode(&mut r);
    r.set_big_endian(true);
    let status = PnioStatus::decode(&mut r);
    let header = BlockHeader::decode(&mut r);
    let control = if r.result().is_ok() && header.block_type == block_type::APP_READY_RES {
        ControlBlock::decode(&mut r)
    } else {
        // A bare status without the control block still confirms.
        ControlBlock {
            control_command: ControlCommand::DONE,
            ..Default::default()
        }
    };

    if let Some(arep) = arep {
        net.with_ar(arep, |net, ar| {
            cmdev::rm_ccontrol_cnf(net, ar, &control, status);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_table_bounds() {
        let mut rpc = Cmrpc::default();
        for i in 0..MAX_SESSIONS {
            assert!(rpc.alloc(PnetUuid::from_fields(i as u32, 0, 0, [0; 8]), false).is_some());
        }
        assert!(rpc.alloc(PnetUuid::from_fields(99, 0, 0, [0; 8]), false).is_none());
    }

    #[test]
    fn release_for_ar_sweeps_sessions() {
        let mut rpc = Cmrpc::default();
        let a = rpc.alloc(PnetUuid::from_fields(1, 0, 0, [0; 8]), false).unwrap();
        rpc.sessions[a].arep = Some(7);
        let b = rpc.alloc(PnetUuid::from_fields(2, 0, 0, [0; 8]), true).unwrap();
        rpc.sessions[b].arep = Some(8);
        rpc.release_for_ar(7);
        assert_eq!(1, rpc.sessions.len());
        assert_eq!(Some(8), rpc.sessions[0].arep);
    }

    #[test]
    fn response_fragmentation() {
        let req = RpcHeader {
            version: 4,
            packet_type: RpcPacketType::Request,
            is_big_endian: true,
            ..Default::default()
        };
        let ndr = NdrHeader {
            args_maximum: 8000,
            ..Default::default()
        };
        let blocks = vec![0xAB; 3000];
        let fragments = build_response(&req, &ndr, PnioStatus::ok(), &blocks);
        assert!(fragments.len() > 1);
        // Every fragment but the last is full-size.
        for frag in &fragments[..fragments.len() - 1] {
            assert_eq!(RPC_HEADER_SIZE + FRAGMENT_BODY_SIZE, frag.len());
        }
        // Reassemble and verify the payload survives.
        let mut body = Vec::new();
        for (ix, frag) in fragments.iter().enumerate() {
            let mut r = BlockReader::new(frag);
            let hdr = RpcHeader::decode(&mut r);
            assert!(hdr.flags.fragment);
            assert_eq!(ix == fragments.len() - 1, hdr.flags.last_fragment);
            assert_eq!(ix as u16, hdr.fragment_number);
            body.extend_from_slice(&frag[RPC_HEADER_SIZE..]);
        }
        let mut r = BlockReader::new(&body);
        let ndr = NdrHeader::decode(&mut r);
        assert_eq!(3004, ndr.args_length);
        let status = PnioStatus::decode(&mut r);
        assert!(status.is_ok());
        assert_eq!(3000, r.remaining());
    }

    #[test]
    fn small_response_is_single_unfragmented_pdu() {
        let req = RpcHeader::default();
        let ndr = NdrHeader::default();
        let fragments = build_response(&req, &ndr, PnioStatus::ok(), &[1, 2, 3]);
        assert_eq!(1, fragments.len());
        let mut r = BlockReader::new(&fragments[0]);
        let hdr = RpcHeader::decode(&mut r);
        assert!(!hdr.flags.fragment);
        assert_eq!(RpcPacketType::Response, hdr.packet_type);
    }
}
