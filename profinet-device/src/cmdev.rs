// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! CMDEV: the per-AR connection state machine.
//!
//! Owns connect validation (the APDUCheck of the PROFINET standard), the
//! computation of each IOCR's byte layout, FrameID fix-up, the module
//! diff, and the lifecycle from `PowerOn` through `Data` to `Abort`.

use log::{debug, error, info};

use pnet_types::blocks::alarm::ALARM_CR_TYPE;
use pnet_types::blocks::ar::AR_TYPE_IOCAR_SINGLE;
use pnet_types::blocks::control::{ControlBlock, ControlCommand};
use pnet_types::blocks::exp_ident::{
    ApiDiff, DataDirection, ExpSubmodule, ModuleDiff, ModuleState, SubmoduleDiff,
    SubmoduleDir, SubmoduleIdentInfo, SubmoduleArInfo, SubmoduleState,
};
use pnet_types::blocks::iocr::{rt_class, IocrType};
use pnet_types::status::{error_code_1, error_code_2_cmrpc};
use pnet_types::{PnioStatus, StackError, ETHTYPE_PROFINET};

use crate::alarm;
use crate::ar::{Ar, IodataObject};
use crate::dev::ModulePlugState;
use crate::net::Net;

/// CMDEV states of one AR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmdevState {
    /// Created, not yet accepting a connect.
    #[default]
    PowerOn,
    /// Waiting for a connect indication.
    WCind,
    /// Connect accepted, waiting for the local response path.
    WCres,
    /// Waiting for the subsystem start confirmation.
    WSucnf,
    /// Waiting for the parameterisation-end indication.
    WPeind,
    /// PrmEnd received, waiting for the application's verdict.
    WPeres,
    /// Waiting for the application-ready request.
    WArdy,
    /// Application-ready sent, waiting for the confirmation.
    WArdycnf,
    /// Confirmed, waiting for consumer data to become valid.
    WData,
    /// Cyclic data is running.
    Data,
    /// Terminal: the AR is being torn down.
    Abort,
}

/// Events reported to the application and the sibling machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdevEvent {
    /// The AR is being torn down.
    Abort,
    /// Connect accepted; machines are starting.
    Startup,
    /// Parameterisation ended.
    PrmEnd,
    /// Application reported ready.
    ApplRdy,
    /// Cyclic data exchange reached.
    Data,
}

/// UDP port the device claims for RT-over-UDP in connect responses.
pub const UDP_UNICAST_PORT: u16 = 0x8894;

/// Request a state transition.
fn set_state(net: &mut Net, ar: &mut Ar, state: CmdevState) {
    if state != ar.cmdev_state {
        debug!(
            "CMDEV: new state {:?} for AREP {} (was {:?})",
            state, ar.arep, ar.cmdev_state
        );
    }
    ar.cmdev_state = state;
    if state == CmdevState::Abort {
        state_ind(net, ar, CmdevEvent::Abort);
        // Clear device-tree references to this AR.
        net.device.clear_ar(ar.arep);
    }
}

/// Notify the application and every sibling machine of an AR event.
pub fn state_ind(net: &mut Net, ar: &mut Ar, event: CmdevEvent) {
    debug!(
        "CMDEV: event {:?} for AREP {} in state {:?}",
        event, ar.arep, ar.cmdev_state
    );
    // The application first, so it can still read the AR error codes
    // while the AR is being torn down.
    let arep = ar.arep;
    net.fspm_state_ind(arep, event);
    if event == CmdevEvent::Abort {
        alarm::close(net, ar);
        net.sched
            .cancel_matching(|token| token.belongs_to(arep));
        ar.ready_4_data = false;
        ar.alarm_enable = false;
    }
    net.cmwrr_state_ind(event);
    net.cmrpc_state_ind(arep, event);
}

/// Abort an AR: the single destructor path.
pub fn abort(net: &mut Net, ar: &mut Ar) {
    if ar.cmdev_state != CmdevState::Abort {
        set_state(net, ar, CmdevState::Abort);
    }
}

/// Abort with an explicit error pair.
pub fn abort_with_error(net: &mut Net, ar: &mut Ar, err_cls: u8, err_code: u8) {
    ar.err_cls = err_cls;
    ar.err_code = err_code;
    abort(net, ar);
}

/// Move a fresh AR into the connect-accepting state.
pub fn init_req(net: &mut Net, ar: &mut Ar) {
    if ar.cmdev_state == CmdevState::PowerOn {
        set_state(net, ar, CmdevState::WCind);
    }
}

/// True if `s` is non-empty and contains only visible ASCII
/// (0x20 ..= 0x7E).
pub fn check_visible_string(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

fn check_ar_param(ar: &Ar) -> Result<(), StackError> {
    let faulty =
        |code2: u8| StackError::connect_faulty(error_code_1::CONN_FAULTY_AR_BLOCK_REQ, code2);
    let param = &ar.ar_param;
    if param.ar_type != AR_TYPE_IOCAR_SINGLE {
        info!("wrong incoming AR type {:#06x}", param.ar_type);
        return Err(faulty(4));
    }
    if param.ar_uuid.is_nil() {
        return Err(faulty(5));
    }
    if param.cm_initiator_mac[0] & 0x01 != 0 {
        // Multicast MAC address.
        return Err(faulty(7));
    }
    if !param.cm_initiator_object_uuid.is_cm_initiator_object_uuid() {
        return Err(faulty(8));
    }
    if param.properties.state != 0x1 {
        return Err(faulty(9));
    }
    if param.properties.parameterization_server != 0 {
        // External parameter server: recognised, not implemented.
        return Err(faulty(9));
    }
    if param.properties.device_access {
        return Err(faulty(9));
    }
    if param.properties.companion_ar == 3 {
        return Err(faulty(9));
    }
    if !(1..=1000).contains(&param.cm_initiator_activity_timeout_factor) {
        return Err(faulty(10));
    }
    if param.cm_initiator_station_name_len == 0
        || param.cm_initiator_station_name_len as usize
            > pnet_types::blocks::ar::STATION_NAME_MAX_LEN
    {
        return Err(faulty(12));
    }
    if !check_visible_string(&param.cm_initiator_station_name) {
        return Err(faulty(13));
    }
    Ok(())
}

fn check_iocr_param(net: &Net, ar: &Ar) -> Result<(), StackError> {
    let faulty =
        |code2: u8| StackError::connect_faulty(error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ, code2);
    for iocr in &ar.iocrs {
        let p = &iocr.param;
        let class = p.properties.rt_class;
        if p.iocr_type == IocrType::Invalid {
            return Err(faulty(4));
        }
        if class != rt_class::UDP && p.lt_field != ETHTYPE_PROFINET {
            return Err(faulty(6));
        }
        if class == rt_class::UDP {
            // The Ethernet-only core refuses RT over UDP at connect time.
            return Err(faulty(7));
        }
        let class_range_ok = if ar.ar_param.properties.startup_mode {
            (rt_class::CLASS_2..=rt_class::STREAM).contains(&class)
        } else {
            (rt_class::CLASS_1..=rt_class::STREAM).contains(&class)
        };
        if !class_range_ok {
            return Err(faulty(7));
        }
        if p.properties.reserved_1 || p.properties.reserved_3 {
            return Err(faulty(7));
        }
        let c_sdu_ok = match class {
            rt_class::CLASS_1 => (40..=1440).contains(&p.c_sdu_length),
            _ => (12..=1440).contains(&p.c_sdu_length),
        };
        if !c_sdu_ok {
            return Err(faulty(8));
        }
        // FrameID must sit in the range implied by CR type and RT class;
        // 0xFFFF on an output CR requests a device-assigned id.
        let frame_id_ok = match (p.iocr_type, class) {
            (IocrType::Output | IocrType::MulticastConsumer, _) if p.frame_id == 0xFFFF => true,
            (IocrType::MulticastProvider | IocrType::MulticastConsumer, rt_class::CLASS_1) => {
                (0xF800..=0xFBFF).contains(&p.frame_id)
            }
            (IocrType::MulticastProvider | IocrType::MulticastConsumer, rt_class::CLASS_2) => {
                (0xBC00..=0xBFFF).contains(&p.frame_id)
            }
            (IocrType::MulticastProvider | IocrType::MulticastConsumer, rt_class::CLASS_3) => {
                (0x0100..=0x7FFF).contains(&p.frame_id)
            }
            (IocrType::Input | IocrType::Output, rt_class::CLASS_1) => {
                (0xC000..=0xF7FF).contains(&p.frame_id)
            }
            (IocrType::Input | IocrType::Output, rt_class::CLASS_2) => {
                (0x8000..=0xBBFF).contains(&p.frame_id)
            }
            (IocrType::Input | IocrType::Output, rt_class::CLASS_3) => {
                (0x0100..=0x7FFF).contains(&p.frame_id)
            }
            _ => true,
        };
        if !frame_id_ok {
            return Err(faulty(9));
        }
        if !p.send_clock_factor.is_power_of_two() || !(1..=128).contains(&p.send_clock_factor) {
            return Err(faulty(10));
        }
        let rr = p.reduction_ratio;
        if !(1..=512).contains(&rr)
            || (rr >= 256 && p.send_clock_factor > 64)
            || (rr == 512 && p.send_clock_factor > 32)
            || (net.min_device_interval() as u32 > p.send_clock_factor as u32 * rr as u32)
        {
            return Err(faulty(11));
        }
        if p.phase == 0 || p.phase > rr {
            return Err(faulty(12));
        }
        if p.frame_send_offset != 0xFFFF_FFFF
            && p.frame_send_offset >= p.send_clock_factor as u32 * 31_250
        {
            return Err(faulty(14));
        }
        let data_hold_budget =
            p.data_hold_factor as u64 * rr as u64 * p.send_clock_factor as u64 * 1000 / 32;
        if !(1..=0x1E00).contains(&p.data_hold_factor) || data_hold_budget > 1_920_000 {
            return Err(faulty(16));
        }
        if p.tag_header.vlan_id != 0 {
            return Err(faulty(17));
        }
        if p.tag_header.user_priority != 6 {
            return Err(faulty(17));
        }
        if matches!(
            p.iocr_type,
            IocrType::MulticastProvider | IocrType::MulticastConsumer
        ) && p.multicast_mac[0] & 0x01 == 0
        {
            return Err(faulty(18));
        }
        if p.apis.is_empty() {
            return Err(faulty(19));
        }
    }
    Ok(())
}

/// The data direction to search for in the expected submodule, given the
/// CR direction and whether IOPS or IOCS is wanted.
///
/// An output module sends its IOPS in the output CR and its IOCS in the
/// input CR; a NO_IO or input module is the other way round; an IO module
/// has both descriptors.
pub fn descriptor_direction(
    submodule_dir: SubmoduleDir,
    cr_is_input: bool,
    wants_iops: bool,
) -> Option<DataDirection> {
    match submodule_dir {
        SubmoduleDir::NoIo | SubmoduleDir::Input => {
            (cr_is_input == wants_iops).then_some(DataDirection::Input)
        }
        SubmoduleDir::Io => Some(if cr_is_input == wants_iops {
            DataDirection::Input
        } else {
            DataDirection::Output
        }),
        SubmoduleDir::Output => {
            (cr_is_input != wants_iops).then_some(DataDirection::Output)
        }
    }
}

fn exp_descriptor<'a>(
    exp_sub: &'a ExpSubmodule,
    cr_is_input: bool,
    wants_iops: bool,
) -> Option<&'a pnet_types::blocks::exp_ident::DataDescriptor> {
    let dir = descriptor_direction(exp_sub.properties.direction, cr_is_input, wants_iops)?;
    exp_sub.descriptor(dir)
}

/// First pass of the layout computation: place data and IOPS for every
/// referenced IO data object.
fn iocr_setup_data_iops(ar: &mut Ar, crep: usize) -> Result<(), StackError> {
    let cr_is_input = ar.iocrs[crep].param.iocr_type.is_provider();
    let api_entries = ar.iocrs[crep].param.apis.clone();
    for api_entry in &api_entries {
        for fd in &api_entry.io_data {
            let Some(exp_sub) =
                ar.exp_ident
                    .find_submodule(api_entry.api, fd.slot_number, fd.subslot_number)
            else {
                error!(
                    "API {} slot {} subslot {:#06x} referenced by IOCR but not expected",
                    api_entry.api, fd.slot_number, fd.subslot_number
                );
                return Err(StackError::connect_faulty(
                    error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ,
                    20,
                ));
            };
            let Some(desc) = exp_descriptor(exp_sub, cr_is_input, true) else {
                error!(
                    "no matching data descriptor for API {} slot {} subslot {:#06x}",
                    api_entry.api, fd.slot_number, fd.subslot_number
                );
                return Err(StackError::connect_faulty(
                    error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ,
                    21,
                ));
            };
            let desc = *desc;
            let props = exp_sub.properties;

            let iocr = &mut ar.iocrs[crep];
            let ix = iocr
                .find_desc(api_entry.api, fd.slot_number, fd.subslot_number)
                .unwrap_or_else(|| {
                    iocr.data_desc.push(IodataObject {
                        api_id: api_entry.api,
                        slot_number: fd.slot_number,
                        subslot_number: fd.subslot_number,
                        ..Default::default()
                    });
                    iocr.data_desc.len() - 1
                });
            let obj = &mut iocr.data_desc[ix];

            let reduce = (cr_is_input && props.reduce_input_submodule_data_length)
                || (!cr_is_input && props.reduce_output_submodule_data_length);
            if reduce {
                obj.data_length = 0;
                obj.data_offset = 0;
            } else {
                obj.data_length = desc.submodule_data_length;
                obj.data_offset = fd.frame_offset;
            }
            if props.discard_ioxs {
                // Only allowed for NO_IO submodules.
                obj.data_length = 0;
                obj.data_offset = 0;
                obj.iops_length = 0;
                obj.iops_offset = 0;
            } else {
                // Both fields come off the wire; the IOPS offset must
                // still be a valid frame position.
                let iops_offset = obj.data_offset as u32 + obj.data_length as u32;
                if iops_offset > u16::MAX as u32 {
                    error!(
                        "IOPS offset overflow for API {} slot {} subslot {:#06x}",
                        api_entry.api, fd.slot_number, fd.subslot_number
                    );
                    return Err(StackError::connect_faulty(
                        error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ,
                        22,
                    ));
                }
                obj.iops_length = desc.length_iops as u16;
                obj.iops_offset = iops_offset as u16;
            }

            let contributed = obj.data_length.saturating_add(obj.iops_length);
            if cr_is_input {
                iocr.in_length = iocr.in_length.saturating_add(contributed);
            } else {
                iocr.out_length = iocr.out_length.saturating_add(contributed);
            }
        }
    }
    Ok(())
}

/// Second pass: place IOCS bytes. A submodule can contribute IOCS in the
/// CR of the opposite direction to its data.
fn iocr_setup_iocs(ar: &mut Ar, crep: usize) -> Result<(), StackError> {
    let cr_is_input = ar.iocrs[crep].param.iocr_type.is_provider();
    let api_entries = ar.iocrs[crep].param.apis.clone();
    for api_entry in &api_entries {
        for fd in &api_entry.iocs {
            let Some(exp_sub) =
                ar.exp_ident
                    .find_submodule(api_entry.api, fd.slot_number, fd.subslot_number)
            else {
                error!(
                    "API {} slot {} subslot {:#06x} IOCS reference not expected",
                    api_entry.api, fd.slot_number, fd.subslot_number
                );
                return Err(StackError::connect_faulty(
                    error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ,
                    20,
                ));
            };
            let Some(desc) = exp_descriptor(exp_sub, cr_is_input, false) else {
                error!(
                    "no IOCS descriptor for API {} slot {} subslot {:#06x}",
                    api_entry.api, fd.slot_number, fd.subslot_number
                );
                return Err(StackError::connect_faulty(
                    error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ,
                    21,
                ));
            };
            let length_iocs = desc.length_iocs as u16;
            let discard = exp_sub.properties.discard_ioxs;

            let iocr = &mut ar.iocrs[crep];
            let ix = iocr
                .find_desc(api_entry.api, fd.slot_number, fd.subslot_number)
                .unwrap_or_else(|| {
                    iocr.data_desc.push(IodataObject {
                        api_id: api_entry.api,
                        slot_number: fd.slot_number,
                        subslot_number: fd.subslot_number,
                        ..Default::default()
                    });
                    iocr.data_desc.len() - 1
                });
            let obj = &mut iocr.data_desc[ix];
            if discard {
                obj.iocs_offset = 0;
                obj.iocs_length = 0;
            } else {
                obj.iocs_offset = fd.frame_offset;
                obj.iocs_length = length_iocs;
            }

            let contributed = obj.iocs_length;
            if cr_is_input {
                iocr.in_length = iocr.in_length.saturating_add(contributed);
            } else {
                iocr.out_length = iocr.out_length.saturating_add(contributed);
            }
        }
    }
    Ok(())
}

/// Two byte ranges straddle if both are non-empty and share any byte.
pub fn ranges_straddle(start_1: u16, length_1: u16, start_2: u16, length_2: u16) -> bool {
    if length_1 == 0 || length_2 == 0 {
        return false;
    }
    if start_1 <= start_2 {
        start_1 + length_1 > start_2
    } else {
        start_1 < start_2 + length_2
    }
}

/// Validate expected descriptor shapes and the final layout of every CR:
/// descriptor counts, status lengths, byte ranges pairwise disjoint and
/// inside `c_sdu_length`.
fn check_iocr_layout(ar: &mut Ar) -> Result<(), StackError> {
    let faulty =
        |code2: u8| StackError::connect_faulty(error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ, code2);

    for api in &ar.exp_ident.apis {
        for module in &api.modules {
            for sub in &module.submodules {
                let expected = match sub.properties.direction {
                    SubmoduleDir::Io => 2,
                    _ => 1,
                };
                if sub.data_descriptors.len() != expected {
                    return Err(faulty(22));
                }
                for desc in &sub.data_descriptors {
                    if desc.length_iops != 1 || desc.length_iocs != 1 {
                        return Err(faulty(23));
                    }
                }
            }
        }
    }

    for iocr in &ar.iocrs {
        let c_sdu_length = iocr.param.c_sdu_length;
        let ranges: Vec<(u16, u16, bool)> = iocr
            .data_desc
            .iter()
            .flat_map(|d| {
                [
                    (d.data_offset, d.data_length, false),
                    (d.iops_offset, d.iops_length, false),
                    (d.iocs_offset, d.iocs_length, true),
                ]
            })
            .collect();
        for (start, length, _) in &ranges {
            // Sum in u32: both values come off the wire and may add past
            // the u16 range.
            if *length > 0 && *start as u32 + *length as u32 > c_sdu_length as u32 {
                return Err(faulty(22));
            }
        }
        for (ix, (start_1, length_1, is_iocs)) in ranges.iter().enumerate() {
            for (start_2, length_2, _) in &ranges[ix + 1..] {
                if ranges_straddle(*start_1, *length_1, *start_2, *length_2) {
                    return Err(faulty(if *is_iocs { 28 } else { 24 }));
                }
            }
        }
    }
    Ok(())
}

fn check_alarm_cr(ar: &Ar) -> Result<(), StackError> {
    let faulty =
        |code2: u8| StackError::connect_faulty(error_code_1::CONN_FAULTY_ALARM_BLOCK_REQ, code2);
    let Some(cr) = ar.alarm_cr_request.as_ref() else {
        return Ok(());
    };
    if cr.alarm_cr_type != ALARM_CR_TYPE {
        return Err(faulty(4));
    }
    if cr.transport_udp || cr.lt_field != ETHTYPE_PROFINET {
        // The Ethernet-only core refuses UDP alarm transport explicitly.
        return Err(faulty(5));
    }
    if !(1..=0x64).contains(&cr.rta_timeout_factor) {
        return Err(faulty(7));
    }
    if !(3..=15).contains(&cr.rta_retries) {
        return Err(faulty(8));
    }
    if !(200..=1432).contains(&cr.max_alarm_data_length) {
        return Err(faulty(10));
    }
    if cr.tag_header_high.vlan_id != 0 || cr.tag_header_high.user_priority != 6 {
        return Err(faulty(11));
    }
    if cr.tag_header_low.vlan_id != 0 || cr.tag_header_low.user_priority != 5 {
        return Err(faulty(12));
    }
    Ok(())
}

fn check_ar_rpc(ar: &Ar) -> Result<(), StackError> {
    if let Some(port) = ar.rpc_initiator_port {
        if port < 0x0400 {
            return Err(StackError::connect_faulty(
                error_code_1::CONN_FAULTY_AR_RPC_BLOCK_REQ,
                4,
            ));
        }
    }
    Ok(())
}

/// Let the application plug the expected configuration: every expected
/// module / submodule that is absent (or mismatching) is offered to the
/// callbacks and plugged with the expected ident unless vetoed.
fn exp_configure(net: &mut Net, ar: &mut Ar) {
    let exp = ar.exp_ident.clone();
    for api in &exp.apis {
        for module in &api.modules {
            let plugged = net.device.module_ident(api.api, module.slot_number);
            if plugged != Some(module.ident_number) {
                let approved = net.fspm_exp_module(api.api, module.slot_number, module.ident_number);
                if approved.is_ok() {
                    let _ =
                        net.device
                            .plug_module(api.api, module.slot_number, module.ident_number);
                }
            }
            for sub in &module.submodules {
                let plugged = net.device.submodule_ident(
                    api.api,
                    module.slot_number,
                    sub.subslot_number,
                );
                if plugged != Some(sub.ident_number) {
                    let approved = net.fspm_exp_submodule(
                        api.api,
                        module.slot_number,
                        sub.subslot_number,
                        module.ident_number,
                        sub.ident_number,
                    );
                    if approved.is_ok() {
                        let input_length = sub
                            .descriptor(DataDirection::Input)
                            .map(|d| d.submodule_data_length)
                            .unwrap_or(0);
                        let output_length = sub
                            .descriptor(DataDirection::Output)
                            .map(|d| d.submodule_data_length)
                            .unwrap_or(0);
                        let _ = net.device.plug_submodule(
                            api.api,
                            module.slot_number,
                            sub.subslot_number,
                            sub.ident_number,
                            sub.properties.direction,
                            input_length,
                            output_length,
                        );
                    }
                }
                // Take ownership of free matching subslots.
                if let Some(subslot) =
                    net.device
                        .subslot_mut(api.api, module.slot_number, sub.subslot_number)
                {
                    if subslot.owning_ar.is_none() {
                        subslot.owning_ar = Some(ar.arep);
                    }
                }
            }
        }
    }
}

/// Build the module diff for the connect response: what the device really
/// has versus what the controller expected.
pub fn generate_submodule_diff(net: &Net, ar: &mut Ar) {
    let mut api_diffs = Vec::new();
    for exp_api in &ar.exp_ident.apis {
        let mut module_diffs = Vec::new();
        for exp_mod in &exp_api.modules {
            let mut diff = ModuleDiff {
                slot_number: exp_mod.slot_number,
                ..Default::default()
            };
            let mut has_mod_diff = false;
            match net.device.slot(exp_api.api, exp_mod.slot_number) {
                None => {
                    diff.module_state = ModuleState::NoModule;
                    has_mod_diff = true;
                }
                Some(slot) if slot.module_ident_number != exp_mod.ident_number => {
                    diff.module_state = ModuleState::WrongModule;
                    diff.module_ident_number = slot.module_ident_number;
                    has_mod_diff = true;
                }
                Some(slot) => {
                    diff.module_state = if slot.plug_state == ModulePlugState::Substitute {
                        ModuleState::SubstituteModule
                    } else {
                        ModuleState::ProperModule
                    };
                    diff.module_ident_number = slot.module_ident_number;
                    for exp_sub in &exp_mod.submodules {
                        let mut sub_diff = SubmoduleDiff {
                            subslot_number: exp_sub.subslot_number,
                            submodule_state: SubmoduleState {
                                format_indicator: true,
                                ..Default::default()
                            },
                            ..Default::default()
                        };
                        let mut has_sub_diff = false;
                        match slot
                            .subslots
                            .iter()
                            .find(|s| s.subslot_number == exp_sub.subslot_number)
                        {
                            None => {
                                sub_diff.submodule_state.ident_info =
                                    SubmoduleIdentInfo::NoSubmodule;
                                has_sub_diff = true;
                            }
                            Some(subslot) => {
                                sub_diff.submodule_ident_number = subslot.submodule_ident_number;
                                if subslot.submodule_ident_number != exp_sub.ident_number {
                                    sub_diff.submodule_state.ident_info =
                                        SubmoduleIdentInfo::Wrong;
                                    has_sub_diff = true;
                                }
                                if subslot.fault
                                    || subslot.maintenance_demanded
                                    || subslot.maintenance_required
                                {
                                    sub_diff.submodule_state.fault = subslot.fault;
                                    sub_diff.submodule_state.maintenance_demanded =
                                        subslot.maintenance_demanded;
                                    sub_diff.submodule_state.maintenance_required =
                                        subslot.maintenance_required;
                                    has_sub_diff = true;
                                }
                                if subslot
                                    .owning_ar
                                    .is_some_and(|owner| owner != ar.arep)
                                {
                                    sub_diff.submodule_state.ar_info =
                                        SubmoduleArInfo::LockedByIoController;
                                    has_sub_diff = true;
                                }
                            }
                        }
                        if has_sub_diff {
                            diff.submodule_diffs.push(sub_diff);
                            has_mod_diff = true;
                        }
                    }
                }
            }
            if has_mod_diff {
                module_diffs.push(diff);
            }
        }
        if !module_diffs.is_empty() {
            api_diffs.push(ApiDiff {
                api: exp_api.api,
                module_diffs,
            });
        }
    }
    ar.diff = pnet_types::blocks::exp_ident::ModuleDiffBlock { api_diffs };
}

/// Append one submodule difference outside the connect path (peer check
/// mismatch reporting).
pub fn append_submodule_diff(ar: &mut Ar, api: u32, slot_number: u16, subslot_number: u16) {
    let Some(exp_sub) = ar.exp_ident.find_submodule(api, slot_number, subslot_number) else {
        return;
    };
    let sub_diff = SubmoduleDiff {
        subslot_number,
        submodule_ident_number: exp_sub.ident_number,
        submodule_state: SubmoduleState {
            fault: true,
            format_indicator: true,
            ..Default::default()
        },
    };
    let module_ident = ar
        .exp_ident
        .apis
        .iter()
        .find(|a| a.api == api)
        .and_then(|a| a.modules.iter().find(|m| m.slot_number == slot_number))
        .map(|m| m.ident_number)
        .unwrap_or(0);
    let api_diff = match ar.diff.api_diffs.iter_mut().find(|d| d.api == api) {
        Some(d) => d,
        None => {
            ar.diff.api_diffs.push(ApiDiff {
                api,
                ..Default::default()
            });
            ar.diff.api_diffs.last_mut().unwrap()
        }
    };
    let module_diff = match api_diff
        .module_diffs
        .iter_mut()
        .find(|d| d.slot_number == slot_number)
    {
        Some(d) => d,
        None => {
            api_diff.module_diffs.push(ModuleDiff {
                slot_number,
                module_ident_number: module_ident,
                module_state: ModuleState::ProperModule,
                ..Default::default()
            });
            api_diff.module_diffs.last_mut().unwrap()
        }
    };
    module_diff
        .submodule_diffs
        .retain(|d| d.subslot_number != subslot_number);
    module_diff.submodule_diffs.push(sub_diff);
}

fn verify_free_frame_id(net: &Net, ar: &Ar, frame_id: u16) -> bool {
    let in_use = |iocr: &crate::ar::Iocr| iocr.param.frame_id == frame_id;
    if ar.iocrs.iter().any(in_use) {
        return false;
    }
    !net
        .live_ars()
        .any(|other| other.iocrs.iter().any(in_use))
}

/// Assign device-chosen FrameIDs where the controller requested 0xFFFF on
/// an output CR, unique across all live ARs.
fn fix_frame_id(net: &Net, ar: &mut Ar) {
    for ix in 0..ar.iocrs.len() {
        let param = &ar.iocrs[ix].param;
        if param.iocr_type != IocrType::Output || param.frame_id != 0xFFFF {
            continue;
        }
        let (start, stop) = match param.properties.rt_class {
            rt_class::CLASS_1 => (0xC000u16, 0xF7FFu16),
            rt_class::CLASS_2 => (0x8000, 0xBBFF),
            rt_class::CLASS_3 => (0x0100, 0x7FFF),
            _ => {
                error!("invalid RT class for FrameID fix-up");
                continue;
            }
        };
        let chosen = (start..=stop).find(|id| verify_free_frame_id(net, ar, *id));
        match chosen {
            Some(frame_id) => {
                debug!(
                    "using FrameID {:#06x} for output CR of AREP {}",
                    frame_id, ar.arep
                );
                ar.iocrs[ix].param.frame_id = frame_id;
            }
            None => error!("no free FrameID found"),
        }
    }
}

/// APDUCheck: the full connect validation ladder.
fn check_apdu(net: &mut Net, ar: &mut Ar) -> Result<(), StackError> {
    if ar.has_ar_param {
        check_ar_param(ar)?;
    }
    check_iocr_param(net, ar)?;

    // Let the application plug the expected configuration.
    exp_configure(net, ar);

    // Build the byte layout of every CR.
    ar.input_cr_cnt = 0;
    ar.output_cr_cnt = 0;
    for crep in 0..ar.iocrs.len() {
        ar.iocrs[crep].data_desc.clear();
        ar.iocrs[crep].in_length = 0;
        ar.iocrs[crep].out_length = 0;
        iocr_setup_data_iops(ar, crep)?;
        iocr_setup_iocs(ar, crep)?;
        match ar.iocrs[crep].param.iocr_type {
            IocrType::Input => ar.input_cr_cnt += 1,
            IocrType::Output => ar.output_cr_cnt += 1,
            _ => {}
        }
    }

    check_iocr_layout(ar)?;

    if ar.input_cr_cnt == 0 || ar.output_cr_cnt == 0 {
        return Err(StackError::connect_faulty(
            error_code_1::CMRPC,
            error_code_2_cmrpc::IOCR_MISSING,
        ));
    }
    if ar.nbr_alarm_cr != 1 {
        return Err(StackError::connect_faulty(
            error_code_1::CMRPC,
            error_code_2_cmrpc::WRONG_BLOCK_COUNT,
        ));
    }
    check_alarm_cr(ar)?;
    check_ar_rpc(ar)?;
    Ok(())
}

/// RM_Connect.ind: validate, lay out, and accept or reject a connect.
pub fn rm_connect_ind(net: &mut Net, ar: &mut Ar) -> Result<(), StackError> {
    check_apdu(net, ar)?;

    net.pdport_reset_observers();
    generate_submodule_diff(net, ar);

    // Start building the response.
    ar.ar_result = pnet_types::blocks::ar::ArResult {
        ar_type: ar.ar_param.ar_type,
        ar_uuid: ar.ar_param.ar_uuid,
        session_key: ar.ar_param.session_key,
        cm_responder_mac: net.mac_address(),
        responder_udp_rt_port: UDP_UNICAST_PORT,
    };

    fix_frame_id(net, ar);
    for iocr in &mut ar.iocrs {
        iocr.result = pnet_types::blocks::iocr::IocrResult {
            iocr_type: iocr.param.iocr_type,
            iocr_reference: iocr.param.iocr_reference,
            frame_id: iocr.param.frame_id,
        };
    }
    if let Some(alarm_cr) = &ar.alarm_cr_request {
        ar.alarm_cr_result = pnet_types::blocks::alarm::AlarmCrResult {
            alarm_cr_type: alarm_cr.alarm_cr_type,
            local_alarm_reference: (ar.arep & 0xFFFF) as u16,
            max_alarm_data_length: alarm::MAX_ALARM_DATA_LEN,
        };
    }
    ar.ar_server = pnet_types::blocks::ar::ArServer {
        cm_responder_station_name: net.station_name(),
    };
    ar.ready_4_data = false;

    let arep = ar.arep;
    net.fspm_connect_ind(arep)?;

    set_state(net, ar, CmdevState::WCres);
    connect_rsp_pos(net, ar)
}

/// Positive connect response path: start the subordinate machines.
fn connect_rsp_pos(net: &mut Net, ar: &mut Ar) -> Result<(), StackError> {
    set_state(net, ar, CmdevState::WSucnf);
    if alarm::activate(net, ar).is_ok() {
        state_ind(net, ar, CmdevEvent::Startup);
        set_state(net, ar, CmdevState::WPeind);
        Ok(())
    } else {
        let err = StackError::connect_faulty(
            error_code_1::CMRPC,
            error_code_2_cmrpc::PDEV_ALREADY_OWNED,
        );
        let arep = ar.arep;
        net.fspm_log_book_entry(arep, &ar.ar_param.ar_uuid, err.pnio_status, 0);
        Err(err)
    }
}

/// Negative connect response path.
pub fn connect_rsp_neg(net: &mut Net, ar: &mut Ar, err: &StackError) {
    let arep = ar.arep;
    let detail = ((err.add_data_1 as u32) << 16) | err.add_data_2 as u32;
    net.fspm_log_book_entry(arep, &ar.ar_param.ar_uuid, err.pnio_status, detail);
    error!("connect failed for AREP {}: {}", arep, err);
    set_state(net, ar, CmdevState::WCind);
}

/// RM_Release.ind: a release request arrived.
pub fn rm_release_ind(net: &mut Net, ar: &mut Ar) {
    match ar.cmdev_state {
        CmdevState::WPeind
        | CmdevState::WArdy
        | CmdevState::WArdycnf
        | CmdevState::WData
        | CmdevState::Data => {
            ar.err_cls = error_code_1::RTA_ERR_CLS_PROTOCOL;
            ar.err_code = pnet_types::status::error_code_2_abort::AR_RELEASE_IND_RECEIVED;
            let arep = ar.arep;
            if let Err(e) = net.fspm_release_ind(arep) {
                ar.err_code = e.pnio_status.error_code_2;
            }
            set_state(net, ar, CmdevState::Abort);
        }
        _ => {
            // Ignore and stay in all other states.
        }
    }
}

/// RM_DControl.ind: PrmEnd from the controller. On success the caller
/// must deliver the PrmEnd event after emitting the response.
pub fn rm_dcontrol_ind(
    net: &mut Net,
    ar: &mut Ar,
    control: &ControlBlock,
) -> Result<(), StackError> {
    if ar.cmdev_state != CmdevState::WPeind {
        // Ignore and stay in all other states.
        return Ok(());
    }
    if !control.control_command.contains(ControlCommand::PRM_END) {
        return Ok(());
    }
    set_state(net, ar, CmdevState::WPeres);
    let arep = ar.arep;
    match net.fspm_dcontrol_ind(arep, control.control_command.bits()) {
        Ok(()) => {
            set_state(net, ar, CmdevState::WArdy);
            Ok(())
        }
        Err(e) => {
            ar.err_cls = error_code_1::CMDEV;
            ar.err_code = e.pnio_status.error_code_2;
            state_ind(net, ar, CmdevEvent::Abort);
            Err(e)
        }
    }
}

/// Deliver the PrmEnd event, after the DControl response went out.
pub fn prm_end_event(net: &mut Net, ar: &mut Ar) {
    debug!("delivering PrmEnd event for AREP {}", ar.arep);
    state_ind(net, ar, CmdevEvent::PrmEnd);
}

/// CM_CControl.req: the application reported ready. Requires input data
/// or IOPS staged on every provider IO data object.
pub fn cm_ccontrol_req(net: &mut Net, ar: &mut Ar) -> Result<(), ()> {
    if ar.cmdev_state != CmdevState::WArdy {
        // Ignore and stay in all other states.
        return Ok(());
    }
    let data_avail = ar
        .iocrs
        .iter()
        .filter(|iocr| iocr.param.iocr_type.is_provider())
        .all(|iocr| {
            iocr.data_desc
                .iter()
                .filter(|d| d.iops_length > 0)
                .all(|d| d.data_avail)
        });
    if !data_avail {
        error!(
            "application_ready for AREP {} but input data is not staged",
            ar.arep
        );
        return Err(());
    }
    state_ind(net, ar, CmdevEvent::ApplRdy);
    if net.cmrpc_ccontrol_req(ar).is_ok() {
        set_state(net, ar, CmdevState::WArdycnf);
        Ok(())
    } else {
        Err(())
    }
}

/// RM_CControl.cnf: the controller answered our Application Ready.
pub fn rm_ccontrol_cnf(net: &mut Net, ar: &mut Ar, control: &ControlBlock, status: PnioStatus) {
    if ar.cmdev_state != CmdevState::WArdycnf {
        error!(
            "ccontrol confirmation in state {:?} for AREP {}",
            ar.cmdev_state, ar.arep
        );
        return;
    }
    let arep = ar.arep;
    if status.is_ok() {
        if !control.control_command.contains(ControlCommand::DONE) {
            error!("ccontrol confirmation without DONE bit");
            return;
        }
        // Alarm transmitter enabled on the Application Ready confirmation.
        ar.alarm_enable = true;
        if ar.ready_4_data {
            state_ind(net, ar, CmdevEvent::Data);
            set_state(net, ar, CmdevState::Data);
        } else {
            set_state(net, ar, CmdevState::WData);
        }
        net.fspm_ccontrol_cnf(arep, status);
    } else {
        net.fspm_log_book_entry(arep, &ar.ar_param.ar_uuid, status, 0);
        net.fspm_ccontrol_cnf(arep, status);
        set_state(net, ar, CmdevState::Abort);
    }
}

/// CMIO info indication: the consumer data path reports whether data is
/// possible.
pub fn cmio_info_ind(net: &mut Net, ar: &mut Ar, data_possible: bool) {
    if data_possible != ar.ready_4_data {
        debug!(
            "data-possible indication {} for AREP {}",
            data_possible, ar.arep
        );
    }
    match ar.cmdev_state {
        CmdevState::WArdy | CmdevState::WArdycnf => {
            ar.ready_4_data = data_possible;
        }
        CmdevState::WData => {
            ar.ready_4_data = data_possible;
            if data_possible {
                state_ind(net, ar, CmdevEvent::Data);
                set_state(net, ar, CmdevState::Data);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_string_check() {
        assert!(check_visible_string("plc-station.1"));
        assert!(check_visible_string(" ~"));
        assert!(!check_visible_string(""));
        assert!(!check_visible_string("with\tcontrol"));
        assert!(!check_visible_string("nul\0"));
        assert!(!check_visible_string("über"));
    }

    #[test]
    fn straddle_matrix() {
        // Area 1: start 4, length 3 (bytes 4, 5, 6).
        assert!(!ranges_straddle(0, 2, 4, 3));
        assert!(!ranges_straddle(1, 2, 4, 3));
        assert!(!ranges_straddle(2, 2, 4, 3));
        assert!(ranges_straddle(3, 2, 4, 3));
        assert!(ranges_straddle(4, 2, 4, 3));
        assert!(ranges_straddle(5, 2, 4, 3));
        assert!(ranges_straddle(6, 2, 4, 3));
        assert!(!ranges_straddle(7, 2, 4, 3));
        assert!(!ranges_straddle(8, 2, 4, 3));
        // Empty ranges never straddle.
        assert!(!ranges_straddle(4, 0, 4, 3));
        assert!(!ranges_straddle(4, 3, 5, 0));
    }

    #[test]
    fn descriptor_direction_matrix() {
        let dir = descriptor_direction;
        // Input submodule: IOPS rides the input CR, IOCS the output CR.
        assert_eq!(Some(DataDirection::Input), dir(SubmoduleDir::Input, true, true));
        assert_eq!(None, dir(SubmoduleDir::Input, true, false));
        assert_eq!(Some(DataDirection::Input), dir(SubmoduleDir::Input, false, false));
        // Output submodule: IOPS rides the output CR, IOCS the input CR.
        assert_eq!(Some(DataDirection::Output), dir(SubmoduleDir::Output, false, true));
        assert_eq!(Some(DataDirection::Output), dir(SubmoduleDir::Output, true, false));
        assert_eq!(None, dir(SubmoduleDir::Output, true, true));
        // NO_IO behaves as input.
        assert_eq!(Some(DataDirection::Input), dir(SubmoduleDir::NoIo, true, true));
        // IO has both.
        assert_eq!(Some(DataDirection::Input), dir(SubmoduleDir::Io, true, true));
        assert_eq!(Some(DataDirection::Output), dir(SubmoduleDir::Io, true, false));
        assert_eq!(Some(DataDirection::Output), dir(SubmoduleDir::Io, false, true));
        assert_eq!(Some(DataDirection::Input), dir(SubmoduleDir::Io, false, false));
    }
}
