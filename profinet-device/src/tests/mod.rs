// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! End-to-end scenarios: a controller connecting, parameterising and
//! exchanging alarms with the device, driven through the same entry
//! points a host would wire.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use pnet_core::eth::{EthHeader, FrameSink, SendError};
use pnet_types::blocks::alarm::{
    alarm_type, AlarmCrRequest, AlarmFixed, AlarmNotification, RtaPduType, ALARM_CR_TYPE,
    RTA_PDU_VERSION,
};
use pnet_types::blocks::ar::{ArParam, ArProperties, ArResult, ArServer, AR_TYPE_IOCAR_SINGLE};
use pnet_types::blocks::control::{ControlBlock, ControlCommand};
use pnet_types::blocks::exp_ident::{
    DataDescriptor, DataDirection, ExpApi, ExpModule, ExpSubmodule, ExpectedIdent,
    SubmoduleProperties, SubmoduleDir,
};
use pnet_types::blocks::im::Im1;
use pnet_types::blocks::iocr::{
    rt_class, FrameDescriptor, IocrApiEntry, IocrParam, IocrProperties, IocrResult, IocrTagHeader,
    IocrType,
};
use pnet_types::blocks::port::{CheckPeer, CheckPeers};
use pnet_types::blocks::record::{ReadRequest, ReadResult, WriteRequest, WriteResult};
use pnet_types::blocks::rpc::{opnum, NdrHeader, RpcFlags, RpcHeader, RpcPacketType, RPC_HEADER_SIZE};
use pnet_types::blocks::{begin_block, block_type, end_block, index, BlockHeader};
use pnet_types::status::{error_code, error_code_1, error_code_2_abort, error_decode};
use pnet_types::{BlockReader, BlockWriter, PnetUuid, PnioStatus, ETHTYPE_PROFINET};

use crate::cmdev::CmdevState;
use crate::config::{Callbacks, DeviceIdentity, PnetCfg};
use crate::dev::MAX_DIAG_ITEMS;
use crate::diag;
use crate::net::Net;

const DEVICE_MAC: [u8; 6] = [0x02, 0x12, 0x34, 0x00, 0x00, 0x01];
const CONTROLLER_MAC: [u8; 6] = [0x02, 0x12, 0x34, 0x00, 0x00, 0x99];
const CONTROLLER_ALARM_REF: u16 = 0x1234;

#[derive(Clone, Default)]
struct SharedSink {
    frames: Arc<Mutex<Vec<Bytes>>>,
}

impl FrameSink for SharedSink {
    fn send_frame(&mut self, frame: Bytes) -> Result<(), SendError> {
        self.frames.lock().push(frame);
        Ok(())
    }
}

struct Harness {
    net: Net,
    eth: Arc<Mutex<Vec<Bytes>>>,
    rpc_out: Arc<Mutex<Vec<Bytes>>>,
    clock: Arc<AtomicU32>,
    _dir: tempfile::TempDir,
}

fn harness_with(callbacks: Callbacks) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    harness_in(callbacks, dir)
}

fn harness_in(callbacks: Callbacks, dir: tempfile::TempDir) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(AtomicU32::new(1_000));
    let eth_sink = SharedSink::default();
    let rpc_sink = SharedSink::default();
    let eth = eth_sink.frames.clone();
    let rpc_out = rpc_sink.frames.clone();
    let cfg = PnetCfg {
        identity: DeviceIdentity {
            station_name: "rust-device-1".to_string(),
            product_name: "demo".to_string(),
            ..Default::default()
        },
        mac_address: DEVICE_MAC,
        min_device_interval: 32,
        file_directory: dir.path().to_path_buf(),
        ..Default::default()
    };
    let tick = clock.clone();
    let net = Net::new(
        cfg,
        callbacks,
        Box::new(move || tick.load(Ordering::SeqCst)),
        Box::new(eth_sink),
        Box::new(rpc_sink),
    )
    .unwrap();
    Harness {
        net,
        eth,
        rpc_out,
        clock,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(Callbacks::default())
}

struct ConnectOptions {
    ar_uuid: PnetUuid,
    rt_class: u8,
    c_sdu_length: u16,
    input_frame_id: u16,
    output_frame_id: u16,
    input_frame_offset: u16,
    rta_timeout_factor: u16,
    rta_retries: u16,
    overlapping_input: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            ar_uuid: PnetUuid::from_fields(0x11112222, 0x3333, 0x4444, [5, 6, 7, 8, 9, 10, 11, 12]),
            rt_class: rt_class::CLASS_1,
            c_sdu_length: 40,
            input_frame_id: 0xC010,
            output_frame_id: 0xC800,
            input_frame_offset: 0,
            rta_timeout_factor: 10,
            rta_retries: 3,
            overlapping_input: false,
        }
    }
}

fn ar_param(opts: &ConnectOptions) -> ArParam {
    ArParam {
        ar_type: AR_TYPE_IOCAR_SINGLE,
        ar_uuid: opts.ar_uuid,
        session_key: 0x0001,
        cm_initiator_mac: CONTROLLER_MAC,
        cm_initiator_object_uuid: PnetUuid::from_fields(
            0xDEA0_0000,
            0x6C97,
            0x11D1,
            [0x82, 0x71, 0, 0, 0, 0, 0, 0x42],
        ),
        properties: ArProperties {
            state: 1,
            ..Default::default()
        },
        cm_initiator_activity_timeout_factor: 600,
        cm_initiator_udp_rt_port: 0x8892,
        cm_initiator_station_name: "controller-1".to_string(),
        cm_initiator_station_name_len: 12,
    }
}

fn input_submodule() -> ExpSubmodule {
    ExpSubmodule {
        subslot_number: 1,
        ident_number: 0x133,
        properties: SubmoduleProperties {
            direction: SubmoduleDir::Input,
            ..Default::default()
        },
        data_descriptors: vec![DataDescriptor {
            data_direction: DataDirection::Input,
            submodule_data_length: 4,
            length_iocs: 1,
            length_iops: 1,
        }],
    }
}

fn expected_ident(opts: &ConnectOptions) -> ExpectedIdent {
    let mut modules = vec![ExpModule {
        slot_number: 1,
        ident_number: 0x32,
        properties: 0,
        submodules: vec![input_submodule()],
    }];
    if opts.overlapping_input {
        modules.push(ExpModule {
            slot_number: 2,
            ident_number: 0x32,
            properties: 0,
            submodules: vec![input_submodule()],
        });
    }
    ExpectedIdent {
        apis: vec![ExpApi { api: 0, modules }],
    }
}

fn iocr(opts: &ConnectOptions, input: bool) -> IocrParam {
    let mut io_data = Vec::new();
    let mut iocs = Vec::new();
    if input {
        io_data.push(FrameDescriptor {
            slot_number: 1,
            subslot_number: 1,
            frame_offset: opts.input_frame_offset,
        });
        if opts.overlapping_input {
            io_data.push(FrameDescriptor {
                slot_number: 2,
                subslot_number: 1,
                frame_offset: 2,
            });
        }
    } else {
        iocs.push(FrameDescriptor {
            slot_number: 1,
            subslot_number: 1,
            frame_offset: 0,
        });
        if opts.overlapping_input {
            iocs.push(FrameDescriptor {
                slot_number: 2,
                subslot_number: 1,
                frame_offset: 1,
            });
        }
    }
    IocrParam {
        iocr_type: if input { IocrType::Input } else { IocrType::Output },
        iocr_reference: if input { 1 } else { 2 },
        lt_field: ETHTYPE_PROFINET,
        properties: IocrProperties {
            rt_class: opts.rt_class,
            ..Default::default()
        },
        c_sdu_length: opts.c_sdu_length,
        frame_id: if input {
            opts.input_frame_id
        } else {
            opts.output_frame_id
        },
        send_clock_factor: 32,
        reduction_ratio: 4,
        phase: 1,
        sequence: 0,
        frame_send_offset: 0xFFFF_FFFF,
        watchdog_factor: 3,
        data_hold_factor: 3,
        tag_header: IocrTagHeader {
            vlan_id: 0,
            user_priority: 6,
        },
        multicast_mac: [0; 6],
        apis: vec![IocrApiEntry {
            api: 0,
            io_data,
            iocs,
        }],
    }
}

fn alarm_cr(opts: &ConnectOptions) -> AlarmCrRequest {
    AlarmCrRequest {
        alarm_cr_type: ALARM_CR_TYPE,
        lt_field: ETHTYPE_PROFINET,
        priority: false,
        transport_udp: false,
        rta_timeout_factor: opts.rta_timeout_factor,
        rta_retries: opts.rta_retries,
        local_alarm_reference: CONTROLLER_ALARM_REF,
        max_alarm_data_length: 1432,
        tag_header_high: IocrTagHeader {
            vlan_id: 0,
            user_priority: 6,
        },
        tag_header_low: IocrTagHeader {
            vlan_id: 0,
            user_priority: 5,
        },
    }
}

fn rpc_request(op: u16, sequence_number: u32, activity: PnetUuid, args: &[u8]) -> Vec<u8> {
    let mut body = BlockWriter::new(8000);
    NdrHeader {
        args_maximum: 4500,
        args_length: args.len() as u32,
        maximum_count: 4500,
        offset: 0,
        actual_count: args.len() as u32,
    }
    .encode(&mut body)
    .unwrap();
    body.put_mem(args).unwrap();
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
        object_uuid: PnetUuid::from_fields(0xDEA0_0000, 0x6C97, 0x11D1, [0x82, 0x71, 0, 0, 0, 0, 0, 1]),
        interface_uuid: pnet_types::device_interface_uuid(),
        activity_uuid: activity,
        server_boot_time: 0,
        interface_version: 1,
        sequence_number,
        opnum: op,
        interface_hint: 0xFFFF,
        activity_hint: 0xFFFF,
        length_of_body: body.len() as u16,
        fragment_number: 0,
        auth_protocol: 0,
        serial_low: 0,
    };
    let mut w = BlockWriter::new(RPC_HEADER_SIZE + body.len());
    hdr.encode(&mut w).unwrap();
    w.put_mem(&body).unwrap();
    w.into_vec()
}

fn connect_args(opts: &ConnectOptions) -> Vec<u8> {
    let mut w = BlockWriter::new(4000);
    let slot = begin_block(&mut w, block_type::AR_BLOCK_REQ).unwrap();
    ar_param(opts).encode(&mut w).unwrap();
    end_block(&mut w, slot);

    for input in [true, false] {
        let slot = begin_block(&mut w, block_type::IOCR_BLOCK_REQ).unwrap();
        iocr(opts, input).encode(&mut w).unwrap();
        end_block(&mut w, slot);
    }

    let slot = begin_block(&mut w, block_type::ALARM_CR_BLOCK_REQ).unwrap();
    alarm_cr(opts).encode(&mut w).unwrap();
    end_block(&mut w, slot);

    let slot = begin_block(&mut w, block_type::EXPECTED_SUBMODULE_BLOCK).unwrap();
    expected_ident(opts).encode(&mut w).unwrap();
    end_block(&mut w, slot);
    w.into_vec()
}

/// Parse a response PDU into its status and `(block_type, body)` list.
fn parse_response(packet: &[u8]) -> (RpcHeader, PnioStatus, Vec<(u16, Vec<u8>)>) {
    let mut r = BlockReader::new(packet);
    let hdr = RpcHeader::decode(&mut r);
    assert_eq!(RpcPacketType::Response, hdr.packet_type);
    let _ndr = NdrHeader::decode(&mut r);
    let status = PnioStatus::decode(&mut r);
    let mut blocks = Vec::new();
    while r.remaining() >= 6 {
        let header = BlockHeader::decode(&mut r);
        let body_len = header.block_length.saturating_sub(2) as usize;
        let mut body = vec![0u8; body_len];
        r.get_mem(&mut body);
        blocks.push((header.block_type, body));
    }
    assert!(r.result().is_ok());
    (hdr, status, blocks)
}

fn block_body<'a>(blocks: &'a [(u16, Vec<u8>)], bt: u16) -> Option<&'a [u8]> {
    blocks
        .iter()
        .find(|(block_type, _)| *block_type == bt)
        .map(|(_, body)| body.as_slice())
}

fn connect(harness: &mut Harness, opts: &ConnectOptions) -> (PnioStatus, Vec<(u16, Vec<u8>)>) {
    let activity = PnetUuid::from_fields(0xAAAA, 1, 2, [3; 8]);
    let request = rpc_request(opnum::CONNECT, 1, activity, &connect_args(opts));
    let responses = harness.net.handle_rpc_packet(&request);
    assert_eq!(1, responses.len());
    let (_, status, blocks) = parse_response(&responses[0]);
    (status, blocks)
}

fn dcontrol_prm_end(harness: &mut Harness, opts: &ConnectOptions) {
    let mut args = BlockWriter::new(256);
    let slot = begin_block(&mut args, block_type::PRM_END_REQ).unwrap();
    ControlBlock {
        ar_uuid: opts.ar_uuid,
        session_key: 0x0001,
        alarm_sequence_number: 0,
        control_command: ControlCommand::PRM_END,
        control_block_properties: 0,
    }
    .encode(&mut args)
    .unwrap();
    end_block(&mut args, slot);
    let request = rpc_request(
        opnum::CONTROL,
        2,
        PnetUuid::from_fields(0xBBBB, 1, 2, [3; 8]),
        &args.into_vec(),
    );
    let responses = harness.net.handle_rpc_packet(&request);
    assert_eq!(1, responses.len());
    let (_, status, blocks) = parse_response(&responses[0]);
    assert!(status.is_ok());
    let body = block_body(&blocks, block_type::PRM_END_RES).expect("PrmEnd response block");
    let mut r = BlockReader::new(body);
    let control = ControlBlock::decode(&mut r);
    assert!(control.control_command.contains(ControlCommand::DONE));
}

/// Answer the device's Application Ready request so the AR can proceed.
fn confirm_application_ready(harness: &mut Harness) {
    let request = harness
        .rpc_out
        .lock()
        .pop()
        .expect("device should have sent a CControl request");
    let mut r = BlockReader::new(&request);
    let hdr = RpcHeader::decode(&mut r);
    assert_eq!(RpcPacketType::Request, hdr.packet_type);
    assert_eq!(opnum::CONTROL, hdr.opnum);
    let _ndr = NdrHeader::decode(&mut r);
    let header = BlockHeader::decode(&mut r);
    assert_eq!(block_type::APP_READY_REQ, header.block_type);
    let control = ControlBlock::decode(&mut r);
    assert!(control
        .control_command
        .contains(ControlCommand::APPLICATION_READY));

    let mut args = BlockWriter::new(256);
    PnioStatus::ok().encode(&mut args).unwrap();
    let slot = begin_block(&mut args, block_type::APP_READY_RES).unwrap();
    ControlBlock {
        ar_uuid: control.ar_uuid,
        session_key: control.session_key,
        alarm_sequence_number: 0,
        control_command: ControlCommand::DONE,
        control_block_properties: 0,
    }
    .encode(&mut args)
    .unwrap();
    end_block(&mut args, slot);
    let args = args.into_vec();

    let mut body = BlockWriter::new(512);
    NdrHeader {
        args_maximum: 4500,
        args_length: args.len() as u32,
        maximum_count: 4500,
        offset: 0,
        actual_count: args.len() as u32,
    }
    .encode(&mut body)
    .unwrap();
    body.put_mem(&args).unwrap();
    let body = body.into_vec();

    let response_hdr = RpcHeader {
        packet_type: RpcPacketType::Response,
        length_of_body: body.len() as u16,
        ..hdr
    };
    let mut w = BlockWriter::new(RPC_HEADER_SIZE + body.len());
    response_hdr.encode(&mut w).unwrap();
    w.put_mem(&body).unwrap();
    let responses = harness.net.handle_rpc_packet(&w.into_vec());
    assert!(responses.is_empty());
}

/// Bring an AR to the point where alarms are enabled.
fn connect_to_alarms_enabled(harness: &mut Harness, opts: &ConnectOptions) -> crate::ar::Arep {
    let (status, _) = connect(harness, opts);
    assert!(status.is_ok());
    let arep = harness.net.find_ar_by_uuid(&opts.ar_uuid).unwrap();
    dcontrol_prm_end(harness, opts);
    harness
        .net
        .input_set_data_and_iops(0, 1, 1, &[1, 2, 3, 4], 0x80)
        .unwrap();
    harness.net.application_ready(arep).unwrap();
    confirm_application_ready(harness);
    arep
}

fn advance_ms(harness: &mut Harness, ms: u32) {
    harness.clock.fetch_add(ms * 1000, Ordering::SeqCst);
    harness.net.handle_periodic();
}

// ---------------------------------------------------------------------
// Scenario 1: happy connect.

#[test]
fn happy_connect_reaches_w_peind() {
    let mut harness = harness();
    let opts = ConnectOptions::default();
    let (status, blocks) = connect(&mut harness, &opts);
    assert!(status.is_ok(), "connect rejected: {:?}", status);

    let arep = harness.net.find_ar_by_uuid(&opts.ar_uuid).unwrap();
    assert_eq!(Some(CmdevState::WPeind), harness.net.ar_state(arep));

    // The AR block result echoes the request and carries our MAC.
    let body = block_body(&blocks, block_type::AR_BLOCK_RES).unwrap();
    let mut r = BlockReader::new(body);
    let ar_result = ArResult::decode(&mut r);
    assert_eq!(opts.ar_uuid, ar_result.ar_uuid);
    assert_eq!(DEVICE_MAC, ar_result.cm_responder_mac);

    // Both CRs are confirmed with their FrameIDs.
    let iocr_blocks: Vec<IocrResult> = blocks
        .iter()
        .filter(|(bt, _)| *bt == block_type::IOCR_BLOCK_RES)
        .map(|(_, body)| IocrResult::decode(&mut BlockReader::new(body)))
        .collect();
    assert_eq!(2, iocr_blocks.len());
    assert_eq!(0xC010, iocr_blocks[0].frame_id);
    assert_eq!(0xC800, iocr_blocks[1].frame_id);

    // The station name is echoed in the AR server block.
    let body = block_body(&blocks, block_type::AR_SERVER_BLOCK).unwrap();
    let server = ArServer::decode(&mut BlockReader::new(body));
    assert_eq!("rust-device-1", server.cm_responder_station_name);

    // Nothing differed: the module diff block is absent.
    assert!(block_body(&blocks, block_type::MODULE_DIFF_BLOCK).is_none());
}

// ---------------------------------------------------------------------
// Scenario 2: FrameID fix-up.

#[test]
fn frame_id_fix_up_assigns_free_class_1_id() {
    let mut harness = harness();
    let opts = ConnectOptions {
        output_frame_id: 0xFFFF,
        ..Default::default()
    };
    let (status, blocks) = connect(&mut harness, &opts);
    assert!(status.is_ok());

    let assigned = blocks
        .iter()
        .filter(|(bt, _)| *bt == block_type::IOCR_BLOCK_RES)
        .map(|(_, body)| IocrResult::decode(&mut BlockReader::new(body)))
        .find(|result| result.iocr_type == IocrType::Output)
        .unwrap()
        .frame_id;
    assert!((0xC000..=0xF7FF).contains(&assigned));
    // Unique across the live CRs: the input CR occupies 0xC010.
    assert_ne!(0xC010, assigned);
}

// ---------------------------------------------------------------------
// Scenario 3: overlap rejection.

#[test]
fn overlapping_iodata_objects_reject_the_connect() {
    let mut harness = harness();
    let opts = ConnectOptions {
        overlapping_input: true,
        ..Default::default()
    };
    let (status, blocks) = connect(&mut harness, &opts);
    assert_eq!(error_code::CONNECT, status.error_code);
    assert_eq!(error_decode::PNIO, status.error_decode);
    assert_eq!(error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ, status.error_code_1);
    assert_eq!(24, status.error_code_2);
    assert!(blocks.is_empty());
    // No AR was created.
    assert_eq!(None, harness.net.find_ar_by_uuid(&opts.ar_uuid));
}

#[test]
fn frame_offset_near_u16_max_rejects_the_connect() {
    let mut harness = harness();
    // The IOPS rides right after the data; an offset this close to the
    // end of the u16 range cannot hold both.
    let opts = ConnectOptions {
        input_frame_offset: 0xFFFE,
        ..Default::default()
    };
    let (status, blocks) = connect(&mut harness, &opts);
    assert_eq!(error_code::CONNECT, status.error_code);
    assert_eq!(error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ, status.error_code_1);
    assert_eq!(22, status.error_code_2);
    assert!(blocks.is_empty());
    assert_eq!(None, harness.net.find_ar_by_uuid(&opts.ar_uuid));
}

#[test]
fn class_2_oversized_c_sdu_length_is_rejected() {
    let mut harness = harness();
    let opts = ConnectOptions {
        rt_class: rt_class::CLASS_2,
        c_sdu_length: 2000,
        input_frame_id: 0x8010,
        output_frame_id: 0x8800,
        ..Default::default()
    };
    let (status, _) = connect(&mut harness, &opts);
    assert_eq!(error_code::CONNECT, status.error_code);
    assert_eq!(error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ, status.error_code_1);
    assert_eq!(8, status.error_code_2);
    assert_eq!(None, harness.net.find_ar_by_uuid(&opts.ar_uuid));
}

// ---------------------------------------------------------------------
// Scenario 4: alarm retransmit, then abort.

#[test]
fn unacknowledged_alarm_is_retransmitted_then_aborts_the_ar() {
    let mut harness = harness();
    let opts = ConnectOptions::default();
    let arep = connect_to_alarms_enabled(&mut harness, &opts);

    harness.eth.lock().clear();
    harness
        .net
        .alarm_send_process(arep, 0, 1, 1, 0x0001, &[0xAB])
        .unwrap();
    harness.net.handle_periodic();
    assert_eq!(1, harness.eth.lock().len(), "initial alarm frame");

    // Three retries at ~1 s intervals (rta_timeout_factor 10).
    for expected in 2..=4 {
        advance_ms(&mut harness, 1_001);
        assert_eq!(expected, harness.eth.lock().len());
    }
    // All four copies are identical.
    {
        let frames = harness.eth.lock();
        assert!(frames[1..4].iter().all(|f| *f == frames[0]));
    }

    // The fourth timeout exhausts the retries: the AR aborts and the
    // close path emits a best-effort ERR frame.
    advance_ms(&mut harness, 1_001);
    assert_eq!(None, harness.net.ar_state(arep));
    let frames = harness.eth.lock();
    let last = frames.last().unwrap();
    let mut r = BlockReader::new(&last[20..]);
    let fixed = AlarmFixed::decode(&mut r);
    assert_eq!(RtaPduType::Err, fixed.pdu_type);
    let _var_part_len = r.get_u16();
    let status = PnioStatus::decode(&mut r);
    assert_eq!(error_code_1::RTA_ERR_CLS_PROTOCOL, status.error_code_1);
    assert_eq!(error_code_2_abort::AR_ALARM_SEND_CNF_NEG, status.error_code_2);
}

// ---------------------------------------------------------------------
// Alarm receive path: ACK consumption and idempotent re-ACK.

fn controller_alarm_frame(arep: crate::ar::Arep, fixed: AlarmFixed, var_part: &[u8]) -> Vec<u8> {
    let mut w = BlockWriter::new(512);
    EthHeader {
        dst: DEVICE_MAC,
        src: CONTROLLER_MAC,
        vlan_prio: 6,
        frame_id: pnet_types::FRAME_ID_ALARM_HIGH,
    }
    .encode(&mut w)
    .unwrap();
    let _ = arep;
    fixed.encode(&mut w).unwrap();
    w.put_u16(var_part.len() as u16).unwrap();
    w.put_mem(var_part).unwrap();
    w.into_vec()
}

#[test]
fn controller_ack_advances_send_sequence_and_stops_retransmission() {
    let mut harness = harness();
    let opts = ConnectOptions::default();
    let arep = connect_to_alarms_enabled(&mut harness, &opts);

    harness.eth.lock().clear();
    harness
        .net
        .alarm_send_process(arep, 0, 1, 1, 0x0001, &[0xAB])
        .unwrap();
    harness.net.handle_periodic();
    assert_eq!(1, harness.eth.lock().len());

    // The controller acknowledges with a transport ACK matching our
    // initial send sequence number 0xFFFF.
    let ack = controller_alarm_frame(
        arep,
        AlarmFixed {
            dst_ref: (arep & 0xFFFF) as u16,
            src_ref: CONTROLLER_ALARM_REF,
            pdu_type: RtaPduType::Ack,
            version: RTA_PDU_VERSION,
            window_size: 1,
            tack: false,
            send_seq_num: 0xFFFE,
            ack_seq_num: 0xFFFF,
        },
        &[],
    );
    assert!(harness.net.handle_alarm_frame(&ack));
    harness.net.handle_periodic();

    // No retransmissions after the ACK, even past the timeout.
    advance_ms(&mut harness, 1_100);
    advance_ms(&mut harness, 1_100);
    assert_eq!(1, harness.eth.lock().len());
    assert_eq!(Some(CmdevState::WData), harness.net.ar_state(arep));
}

#[test]
fn replayed_notification_is_reacked_without_second_callback() {
    let notifications = Arc::new(AtomicUsize::new(0));
    let seen = notifications.clone();
    let mut callbacks = Callbacks::default();
    callbacks.alarm_ind = Some(Box::new(move |_arep, _arg, _usi, _payload| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    let mut harness = harness_with(callbacks);
    let opts = ConnectOptions::default();
    let arep = connect_to_alarms_enabled(&mut harness, &opts);
    harness.eth.lock().clear();

    let mut var_part = BlockWriter::new(256);
    let slot = begin_block(&mut var_part, block_type::ALARM_NOTIFICATION_HIGH).unwrap();
    AlarmNotification {
        alarm_type: alarm_type::PROCESS,
        api_id: 0,
        slot_number: 1,
        subslot_number: 1,
        module_ident: 0x32,
        submodule_ident: 0x133,
        specifier: Default::default(),
        sequence_number: 0,
    }
    .encode(&mut var_part)
    .unwrap();
    var_part.put_u16(0x0001).unwrap();
    var_part.put_mem(&[0xCA, 0xFE]).unwrap();
    end_block(&mut var_part, slot);
    let var_part = var_part.into_vec();

    let data = controller_alarm_frame(
        arep,
        AlarmFixed {
            dst_ref: (arep & 0xFFFF) as u16,
            src_ref: CONTROLLER_ALARM_REF,
            pdu_type: RtaPduType::Data,
            version: RTA_PDU_VERSION,
            window_size: 1,
            tack: true,
            send_seq_num: 0xFFFF,
            ack_seq_num: 0xFFFE,
        },
        &var_part,
    );

    assert!(harness.net.handle_alarm_frame(&data));
    harness.net.handle_periodic();
    assert_eq!(1, notifications.load(Ordering::SeqCst));
    assert_eq!(1, harness.eth.lock().len(), "one transport ACK");

    // Replay: exactly one additional ACK, no additional callback.
    assert!(harness.net.handle_alarm_frame(&data));
    harness.net.handle_periodic();
    assert_eq!(1, notifications.load(Ordering::SeqCst));
    assert_eq!(2, harness.eth.lock().len());
}

// ---------------------------------------------------------------------
// Scenario 5: peer mismatch.

#[test]
fn peer_check_mismatch_raises_remote_mismatch_diagnosis() {
    let mut harness = harness();
    let opts = ConnectOptions::default();
    let (status, _) = connect(&mut harness, &opts);
    assert!(status.is_ok());
    let arep = harness.net.find_ar_by_uuid(&opts.ar_uuid).unwrap();

    harness.net.lldp_peer_ind(Some(CheckPeer {
        peer_port_name: "portX".to_string(),
        peer_station_name: "otherStation".to_string(),
    }));

    // PDPortDataCheck record data: expected peer portX / stationY.
    let mut record = BlockWriter::new(512);
    CheckPeers {
        peers: vec![CheckPeer {
            peer_port_name: "portX".to_string(),
            peer_station_name: "stationY".to_string(),
        }],
    }
    .encode_record(&mut record, 0, 0x8001)
    .unwrap();
    let record = record.into_vec();
    // The outer record block header is consumed by the write dispatcher.
    let record_body = &record[6..];

    let mut args = BlockWriter::new(1024);
    let slot = begin_block(&mut args, block_type::IOD_WRITE_REQ_HEADER).unwrap();
    WriteRequest {
        sequence_number: 5,
        ar_uuid: opts.ar_uuid,
        api: 0,
        slot_number: 1,
        subslot_number: 1,
        index: index::SUB_PDPORT_DATA_CHECK,
        record_data_length: record_body.len() as u32,
    }
    .encode(&mut args)
    .unwrap();
    end_block(&mut args, slot);
    args.put_mem(record_body).unwrap();

    let request = rpc_request(
        opnum::WRITE,
        9,
        PnetUuid::from_fields(0xCCCC, 1, 2, [3; 8]),
        &args.into_vec(),
    );
    let responses = harness.net.handle_rpc_packet(&request);
    let (_, status, blocks) = parse_response(&responses[0]);
    assert!(status.is_ok());
    let body = block_body(&blocks, block_type::IOD_WRITE_RES_HEADER).unwrap();
    let result = WriteResult::decode(&mut BlockReader::new(body));
    assert!(result.pnio_status.is_ok());

    // The diagnosis is on the addressed subslot.
    let subslot = harness.net.device.subslot(0, 1, 1).unwrap();
    let pool = harness.net.device.diag.lock();
    let chain = harness.net.device.diag_chain(&pool, subslot);
    assert_eq!(1, chain.len());
    let item = pool.get(chain[0]).unwrap();
    assert_eq!(diag::CH_ERROR_REMOTE_MISMATCH, item.channel_error_type);
    assert_eq!(diag::EXT_CHASSISID_MISMATCH, item.ext_channel_error_type);
    drop(pool);

    // And the AR's diff gained a submodule entry.
    let ar = harness
        .net
        .live_ars()
        .find(|ar| ar.arep == arep)
        .unwrap();
    assert_eq!(1, ar.diff.api_diffs.len());
    assert_eq!(1, ar.diff.api_diffs[0].module_diffs[0].submodule_diffs.len());
    assert!(
        ar.diff.api_diffs[0].module_diffs[0].submodule_diffs[0]
            .submodule_state
            .fault
    );
}

// ---------------------------------------------------------------------
// Scenario 6: I&M write persistence.

fn write_im1_request(harness: &mut Harness, opts: &ConnectOptions, seq: u32) -> PnioStatus {
    let im_1 = Im1::new("PUMP-01", "LINE-A");
    let mut record = BlockWriter::new(128);
    im_1.encode(&mut record).unwrap();
    let record = record.into_vec();

    let mut args = BlockWriter::new(512);
    let slot = begin_block(&mut args, block_type::IOD_WRITE_REQ_HEADER).unwrap();
    WriteRequest {
        sequence_number: seq as u16,
        ar_uuid: opts.ar_uuid,
        api: 0,
        slot_number: 0,
        subslot_number: 1,
        index: index::SUB_IM_1,
        record_data_length: record.len() as u32,
    }
    .encode(&mut args)
    .unwrap();
    end_block(&mut args, slot);
    args.put_mem(&record).unwrap();

    let request = rpc_request(
        opnum::WRITE,
        seq,
        PnetUuid::from_fields(0xDDDD, 1, 2, [3; 8]),
        &args.into_vec(),
    );
    let responses = harness.net.handle_rpc_packet(&request);
    let (_, _, blocks) = parse_response(&responses[0]);
    let body = block_body(&blocks, block_type::IOD_WRITE_RES_HEADER).unwrap();
    WriteResult::decode(&mut BlockReader::new(body)).pnio_status
}

#[test]
fn im1_write_survives_restart_and_rewrite_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let opts = ConnectOptions::default();
    let dir = {
        let mut harness = harness_in(Callbacks::default(), dir);
        let (status, _) = connect(&mut harness, &opts);
        assert!(status.is_ok());

        assert!(write_im1_request(&mut harness, &opts, 5).is_ok());
        // Writing the identical value again succeeds without changing
        // the stored file.
        let stored = std::fs::read(harness._dir.path().join("im.dat")).unwrap();
        assert!(write_im1_request(&mut harness, &opts, 6).is_ok());
        assert_eq!(
            stored,
            std::fs::read(harness._dir.path().join("im.dat")).unwrap()
        );
        harness._dir
    };

    // Restart the device on the same directory and read I&M1 back,
    // implicitly (no AR needed).
    let mut harness = harness_in(Callbacks::default(), dir);
    let mut args = BlockWriter::new(256);
    let slot = begin_block(&mut args, block_type::IOD_READ_REQ_HEADER).unwrap();
    ReadRequest {
        sequence_number: 1,
        ar_uuid: PnetUuid::nil(),
        api: 0,
        slot_number: 0,
        subslot_number: 1,
        index: index::SUB_IM_1,
        record_data_length: 4096,
        target_ar_uuid: PnetUuid::nil(),
    }
    .encode(&mut args)
    .unwrap();
    end_block(&mut args, slot);

    let request = rpc_request(
        opnum::READ_IMPLICIT,
        1,
        PnetUuid::from_fields(0xEEEE, 1, 2, [3; 8]),
        &args.into_vec(),
    );
    let responses = harness.net.handle_rpc_packet(&request);
    let (_, status, blocks) = parse_response(&responses[0]);
    assert!(status.is_ok());

    let body = block_body(&blocks, block_type::IOD_READ_RES_HEADER).unwrap();
    let result = ReadResult::decode(&mut BlockReader::new(body));
    assert!(result.record_data_length > 0);
    // The record data follows as its own I&M1 block.
    let body = block_body(&blocks, block_type::IM_1).unwrap();
    let im_1 = Im1::decode(&mut BlockReader::new(body));
    assert_eq!(Im1::new("PUMP-01", "LINE-A"), im_1);
}

// ---------------------------------------------------------------------
// RPC session behavior.

#[test]
fn rpc_retransmission_is_answered_from_the_cached_response() {
    let mut harness = harness();
    let opts = ConnectOptions::default();
    let activity = PnetUuid::from_fields(0xAAAA, 1, 2, [3; 8]);
    let request = rpc_request(opnum::CONNECT, 1, activity, &connect_args(&opts));

    let first = harness.net.handle_rpc_packet(&request);
    assert_eq!(1, first.len());
    // The exact same PDU again: the cached response comes back and no
    // second AR is created.
    let second = harness.net.handle_rpc_packet(&request);
    assert_eq!(first, second);
    assert_eq!(1, harness.net.live_ars().count());
}

// ---------------------------------------------------------------------
// Diagnosis pool partition across API operations.

#[test]
fn diagnosis_pool_partition_holds_across_add_and_remove() {
    let mut harness = harness();
    let opts = ConnectOptions::default();
    let (status, _) = connect(&mut harness, &opts);
    assert!(status.is_ok());
    let arep = harness.net.find_ar_by_uuid(&opts.ar_uuid).unwrap();

    let diagnosis = crate::diag::StdDiagnosis {
        channel_number: 1,
        channel_properties: crate::dev::ch_prop::build(
            crate::dev::ch_prop::MAINT_FAULT,
            crate::dev::ch_prop::SPEC_APPEARS,
        ),
        channel_error_type: 0x0010,
        ext_channel_error_type: 0,
        ext_channel_add_value: 0,
        qualifier: 0,
    };
    harness
        .net
        .diag_std_add(
            arep,
            0,
            1,
            1,
            diagnosis,
            pnet_types::blocks::alarm::usi::CHANNEL_DIAGNOSIS,
        )
        .unwrap();

    {
        let subslot = harness.net.device.subslot(0, 1, 1).unwrap();
        let pool = harness.net.device.diag.lock();
        let chained = harness.net.device.diag_chain(&pool, subslot).len();
        assert_eq!(1, chained);
        assert_eq!(MAX_DIAG_ITEMS, pool.free_count() + chained);
    }

    harness
        .net
        .diag_std_remove(arep, 0, 1, 1, 1, 0x0010)
        .unwrap();
    let pool = harness.net.device.diag.lock();
    assert_eq!(MAX_DIAG_ITEMS, pool.free_count());
}
