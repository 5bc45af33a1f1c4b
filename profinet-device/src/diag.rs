// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Diagnosis operations against the pooled per-subslot lists.
//!
//! Items live in the pool owned by the device tree; the per-subslot chain
//! and the free list partition it. Adding, updating and removing raise
//! diagnosis alarms towards the owning AR.

use log::{error, info};

use pnet_types::blocks::alarm::usi;

use crate::alarm;
use crate::ar::Ar;
use crate::dev::{ch_prop, DiagItem, DIAG_IX_NULL};
use crate::net::Net;

/// ChannelErrorType: remote (peer) mismatch, raised by the port check.
pub const CH_ERROR_REMOTE_MISMATCH: u16 = 0x8000;
/// ExtChannelErrorType under remote mismatch: peer station (chassis) name
/// differs.
pub const EXT_CHASSISID_MISMATCH: u16 = 0x8000;
/// ExtChannelErrorType under remote mismatch: peer port name differs.
pub const EXT_PORTID_MISMATCH: u16 = 0x8001;

/// Source description of a standard-format diagnosis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdDiagnosis {
    /// Channel number, or 0x8000 for the whole submodule.
    pub channel_number: u16,
    /// Channel properties (maintenance severity and specifier).
    pub channel_properties: u16,
    /// Channel error type.
    pub channel_error_type: u16,
    /// Extended channel error type.
    pub ext_channel_error_type: u16,
    /// Extended channel additional value.
    pub ext_channel_add_value: u32,
    /// Qualified channel qualifier.
    pub qualifier: u32,
}

fn severity_flags(item: &DiagItem) -> (bool, bool, bool) {
    let maintenance = ch_prop::maintenance(item.channel_properties);
    (
        maintenance == ch_prop::MAINT_FAULT,
        maintenance == ch_prop::MAINT_REQUIRED,
        maintenance == ch_prop::MAINT_DEMANDED,
    )
}

/// Recompute the subslot's severity summary from its chain.
fn refresh_subslot_summary(net: &mut Net, api: u32, slot_number: u16, subslot_number: u16) {
    let mut fault = false;
    let mut required = false;
    let mut demanded = false;
    {
        let Some(subslot) = net.device.subslot(api, slot_number, subslot_number) else {
            return;
        };
        let pool = net.device.diag.lock();
        for ix in net.device.diag_chain(&pool, subslot) {
            if let Some(item) = pool.get(ix) {
                let (f, r, d) = severity_flags(item);
                fault |= f || item.usi < usi::CHANNEL_DIAGNOSIS;
                required |= r;
                demanded |= d;
            }
        }
    }
    if let Some(subslot) = net.device.subslot_mut(api, slot_number, subslot_number) {
        subslot.fault = fault;
        subslot.maintenance_required = required;
        subslot.maintenance_demanded = demanded;
    }
}

fn find_in_chain(
    net: &Net,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    matches: impl Fn(&DiagItem) -> bool,
) -> Option<u16> {
    let subslot = net.device.subslot(api, slot_number, subslot_number)?;
    let pool = net.device.diag.lock();
    net.device
        .diag_chain(&pool, subslot)
        .into_iter()
        .find(|ix| pool.get(*ix).map(&matches).unwrap_or(false))
}

/// Add (or update in place) a standard-format diagnosis and raise the
/// alarm.
pub fn std_add(
    net: &mut Net,
    ar: &mut Ar,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    diagnosis: StdDiagnosis,
    item_usi: u16,
) -> Result<(), ()> {
    if item_usi < usi::CHANNEL_DIAGNOSIS {
        error!("standard diagnosis with manufacturer USI {:#06x}", item_usi);
        return Err(());
    }

    let existing = find_in_chain(net, api, slot_number, subslot_number, |item| {
        item.usi == item_usi
            && item.channel_number == diagnosis.channel_number
            && item.channel_error_type == diagnosis.channel_error_type
            && item.ext_channel_error_type == diagnosis.ext_channel_error_type
    });

    let item = {
        let mut pool = net.device.diag.lock();
        let ix = match existing {
            Some(ix) => ix,
            None => {
                let Some(ix) = pool.alloc() else {
                    return Err(());
                };
                ix
            }
        };
        let next = pool.get(ix).map(|i| i.next).unwrap_or(DIAG_IX_NULL);
        let item = DiagItem {
            usi: item_usi,
            channel_number: diagnosis.channel_number,
            channel_properties: diagnosis.channel_properties,
            channel_error_type: diagnosis.channel_error_type,
            ext_channel_error_type: diagnosis.ext_channel_error_type,
            ext_channel_add_value: diagnosis.ext_channel_add_value,
            qualifier: diagnosis.qualifier,
            next,
            ..Default::default()
        };
        *pool.get_mut(ix).unwrap() = item;
        drop(pool);

        if existing.is_none() {
            // Link at the head of the subslot chain.
            let Some(subslot) = net.device.subslot_mut(api, slot_number, subslot_number) else {
                net.device.diag.lock().free(ix);
                return Err(());
            };
            let head = subslot.diag_list;
            subslot.diag_list = ix;
            net.device.diag.lock().get_mut(ix).unwrap().next = head;
        }
        *net.device.diag.lock().get(ix).unwrap()
    };

    refresh_subslot_summary(net, api, slot_number, subslot_number);
    info!(
        "diagnosis added: slot {} subslot {:#06x} channel {:#06x} error {:#06x}",
        slot_number, subslot_number, diagnosis.channel_number, diagnosis.channel_error_type
    );
    // The alarm is best effort: it only goes out once the AR has
    // enabled alarm transmission.
    let _ = alarm::send_diagnosis(net, ar, api, slot_number, subslot_number, &item);
    Ok(())
}

/// Update the additional value and qualifier of an existing standard
/// diagnosis and raise the alarm again.
pub fn std_update(
    net: &mut Net,
    ar: &mut Ar,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    diagnosis: StdDiagnosis,
) -> Result<(), ()> {
    let Some(ix) = find_in_chain(net, api, slot_number, subslot_number, |item| {
        item.usi >= usi::CHANNEL_DIAGNOSIS
            && item.channel_number == diagnosis.channel_number
            && item.channel_error_type == diagnosis.channel_error_type
    }) else {
        return Err(());
    };
    let item = {
        let mut pool = net.device.diag.lock();
        let item = pool.get_mut(ix).unwrap();
        item.ext_channel_add_value = diagnosis.ext_channel_add_value;
        item.qualifier = diagnosis.qualifier;
        *item
    };
    // The alarm is best effort: it only goes out once the AR has
    // enabled alarm transmission.
    let _ = alarm::send_diagnosis(net, ar, api, slot_number, subslot_number, &item);
    Ok(())
}

/// Remove a standard diagnosis and raise a disappearing alarm.
pub fn std_remove(
    net: &mut Net,
    ar: &mut Ar,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    channel_number: u16,
    channel_error_type: u16,
) -> Result<(), ()> {
    let Some(ix) = find_in_chain(net, api, slot_number, subslot_number, |item| {
        item.usi >= usi::CHANNEL_DIAGNOSIS
            && item.channel_number == channel_number
            && item.channel_error_type == channel_error_type
    }) else {
        return Err(());
    };
    remove_item(net, ar, api, slot_number, subslot_number, ix)
}

/// Add (or replace) a manufacturer specific (USI format) diagnosis.
pub fn usi_add(
    net: &mut Net,
    ar: &mut Ar,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    item_usi: u16,
    data: &[u8],
) -> Result<(), ()> {
    if item_usi >= usi::CHANNEL_DIAGNOSIS {
        error!("manufacturer diagnosis with standard USI {:#06x}", item_usi);
        return Err(());
    }
    let existing = find_in_chain(net, api, slot_number, subslot_number, |item| {
        item.usi == item_usi
    });

    let item = {
        let mut pool = net.device.diag.lock();
        let ix = match existing {
            Some(ix) => ix,
            None => {
                let Some(ix) = pool.alloc() else {
                    return Err(());
                };
                ix
            }
        };
        let next = pool.get(ix).map(|i| i.next).unwrap_or(DIAG_IX_NULL);
        let mut item = DiagItem {
            usi: item_usi,
            next,
            ..Default::default()
        };
        let keep = data.len().min(item.manuf_data.len());
        item.manuf_data[..keep].copy_from_slice(&data[..keep]);
        item.manuf_len = keep as u8;
        *pool.get_mut(ix).unwrap() = item;
        drop(pool);

        if existing.is_none() {
            let Some(subslot) = net.device.subslot_mut(api, slot_number, subslot_number) else {
                net.device.diag.lock().free(ix);
                return Err(());
            };
            let head = subslot.diag_list;
            subslot.diag_list = ix;
            net.device.diag.lock().get_mut(ix).unwrap().next = head;
        }
        *net.device.diag.lock().get(ix).unwrap()
    };

    refresh_subslot_summary(net, api, slot_number, subslot_number);
    // The alarm is best effort: it only goes out once the AR has
    // enabled alarm transmission.
    let _ = alarm::send_diagnosis(net, ar, api, slot_number, subslot_number, &item);
    Ok(())
}

/// Update a manufacturer specific diagnosis payload.
pub fn usi_update(
    net: &mut Net,
    ar: &mut Ar,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    item_usi: u16,
    data: &[u8],
) -> Result<(), ()> {
    let Some(ix) = find_in_chain(net, api, slot_number, subslot_number, |item| {
        item.usi == item_usi
    }) else {
        return Err(());
    };
    let item = {
        let mut pool = net.device.diag.lock();
        let item = pool.get_mut(ix).unwrap();
        let keep = data.len().min(item.manuf_data.len());
        item.manuf_data = Default::default();
        item.manuf_data[..keep].copy_from_slice(&data[..keep]);
        item.manuf_len = keep as u8;
        *item
    };
    // The alarm is best effort: it only goes out once the AR has
    // enabled alarm transmission.
    let _ = alarm::send_diagnosis(net, ar, api, slot_number, subslot_number, &item);
    Ok(())
}

/// Remove a manufacturer specific diagnosis.
pub fn usi_remove(
    net: &mut Net,
    ar: &mut Ar,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    item_usi: u16,
) -> Result<(), ()> {
    let Some(ix) = find_in_chain(net, api, slot_number, subslot_number, |item| {
        item.usi == item_usi
    }) else {
        return Err(());
    };
    remove_item(net, ar, api, slot_number, subslot_number, ix)
}

fn remove_item(
    net: &mut Net,
    ar: &mut Ar,
    api: u32,
    slot_number: u16,
    subslot_number: u16,
    ix: u16,
) -> Result<(), ()> {
    // Unlink from the chain, then free.
    let removed = {
        let head = {
            let Some(subslot) = net.device.subslot(api, slot_number, subslot_number) else {
                return Err(());
            };
            subslot.diag_list
        };
        let mut pool = net.device.diag.lock();
        let item = *pool.get(ix).ok_or(())?;
        if head == ix {
            let next = item.next;
            drop(pool);
            net.device
                .subslot_mut(api, slot_number, subslot_number)
                .unwrap()
                .diag_list = next;
        } else {
            let mut prev = head;
            while prev != DIAG_IX_NULL {
                let prev_next = pool.get(prev).map(|i| i.next).unwrap_or(DIAG_IX_NULL);
                if prev_next == ix {
                    pool.get_mut(prev).unwrap().next = item.next;
                    break;
                }
                prev = prev_next;
            }
            drop(pool);
        }
        net.device.diag.lock().free(ix);
        item
    };

    refresh_subslot_summary(net, api, slot_number, subslot_number);

    // Raise the disappearing alarm with the removed item's identity.
    let mut gone = removed;
    gone.channel_properties = ch_prop::build(
        ch_prop::maintenance(removed.channel_properties),
        ch_prop::SPEC_DISAPPEARS,
    );
    info!(
        "diagnosis removed: slot {} subslot {:#06x} USI {:#06x}",
        slot_number, subslot_number, removed.usi
    );
    let _ = alarm::send_diagnosis(net, ar, api, slot_number, subslot_number, &gone);
    Ok(())
}
