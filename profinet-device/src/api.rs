// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The application operations on [`Net`].

use std::path::Path;

use log::info;

use pnet_types::blocks::exp_ident::SubmoduleDir;
use pnet_types::blocks::port::CheckPeer;
use pnet_types::PnioStatus;

use crate::alarm;
use crate::ar::Arep;
use crate::cmdev::{self, CmdevState};
use crate::config::AlarmArgument;
use crate::dev::{DiagPool, PlugError, DIAG_IX_NULL};
use crate::diag::{self, StdDiagnosis};
use crate::fspm::Fspm;
use crate::net::Net;
use crate::pdport::FILENAME_PDPORT_1;

impl Net {
    /// Plug a module into a slot.
    pub fn plug_module(&mut self, api: u32, slot_number: u16, module_ident: u32) -> Result<(), PlugError> {
        self.device.plug_module(api, slot_number, module_ident)?;
        Ok(())
    }

    /// Plug a submodule. When the subslot is owned by an AR, the matching
    /// plug or plug-wrong alarm is queued towards its controller.
    #[allow(clippy::too_many_arguments)]
    pub fn plug_submodule(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        module_ident: u32,
        submodule_ident: u32,
        direction: SubmoduleDir,
        input_length: u16,
        output_length: u16,
    ) -> Result<(), PlugError> {
        self.device.plug_submodule(
            api,
            slot_number,
            subslot_number,
            submodule_ident,
            direction,
            input_length,
            output_length,
        )?;
        let owner = self
            .device
            .subslot(api, slot_number, subslot_number)
            .and_then(|s| s.owning_ar);
        if let Some(arep) = owner {
            self.with_ar(arep, |net, ar| {
                let wrong = ar
                    .exp_ident
                    .find_submodule(api, slot_number, subslot_number)
                    .map(|exp| exp.ident_number != submodule_ident)
                    .unwrap_or(true);
                alarm::send_plug(
                    net,
                    ar,
                    api,
                    slot_number,
                    subslot_number,
                    module_ident,
                    submodule_ident,
                    wrong,
                );
            });
        }
        Ok(())
    }

    /// Pull a submodule; its diagnosis items return to the pool and a
    /// pull alarm is queued towards the owning controller.
    pub fn pull_submodule(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
    ) -> Result<(), PlugError> {
        let removed = self.device.pull_submodule(api, slot_number, subslot_number)?;
        free_diag_chain(&mut self.device.diag.lock(), removed.diag_list);
        if let Some(arep) = removed.owning_ar {
            self.with_ar(arep, |net, ar| {
                alarm::send_pull(net, ar, api, slot_number, subslot_number);
            });
        }
        Ok(())
    }

    /// Pull a module: every submodule is pulled first, all-or-nothing.
    pub fn pull_module(&mut self, api: u32, slot_number: u16) -> Result<(), PlugError> {
        // Verify the slot exists before touching anything.
        if self.device.slot(api, slot_number).is_none() {
            return Err(PlugError::NotFound);
        }
        let subslots: Vec<u16> = self
            .device
            .slot(api, slot_number)
            .map(|slot| slot.subslots.iter().map(|s| s.subslot_number).collect())
            .unwrap_or_default();
        for subslot_number in subslots {
            self.pull_submodule(api, slot_number, subslot_number)?;
        }
        self.device.pull_module(api, slot_number)?;
        Ok(())
    }

    /// Stage input data and provider status for a submodule. Marks the
    /// readiness gate checked by `application_ready`.
    pub fn input_set_data_and_iops(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        data: &[u8],
        iops: u8,
    ) -> Result<(), ()> {
        for slot in self.ars.iter_mut() {
            let Some(ar) = slot.as_mut() else { continue };
            for iocr in ar.iocrs.iter_mut() {
                if !iocr.param.iocr_type.is_provider() {
                    continue;
                }
                if let Some(ix) = iocr.find_desc(api, slot_number, subslot_number) {
                    let desc = &mut iocr.data_desc[ix];
                    desc.data = data.to_vec();
                    desc.iops = iops;
                    desc.data_avail = true;
                    return Ok(());
                }
            }
        }
        Err(())
    }

    /// The consumer status the controller reported for an input
    /// submodule. It rides in the output CR.
    pub fn input_get_iocs(
        &self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
    ) -> Option<u8> {
        for ar in self.live_ars() {
            for iocr in &ar.iocrs {
                if iocr.param.iocr_type.is_provider() {
                    continue;
                }
                if let Some(ix) = iocr.find_desc(api, slot_number, subslot_number) {
                    let desc = &iocr.data_desc[ix];
                    if desc.iocs_length > 0 {
                        return Some(desc.iocs);
                    }
                }
            }
        }
        None
    }

    /// The staged output data and provider status of an output submodule.
    pub fn output_get_data_and_iops(
        &self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
    ) -> Option<(Vec<u8>, u8)> {
        for ar in self.live_ars() {
            for iocr in &ar.iocrs {
                if iocr.param.iocr_type.is_provider() {
                    continue;
                }
                if let Some(ix) = iocr.find_desc(api, slot_number, subslot_number) {
                    let desc = &iocr.data_desc[ix];
                    return Some((desc.data.clone(), desc.iops));
                }
            }
        }
        None
    }

    /// Stage the consumer status for an output submodule.
    pub fn output_set_iocs(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        iocs: u8,
    ) -> Result<(), ()> {
        for slot in self.ars.iter_mut() {
            let Some(ar) = slot.as_mut() else { continue };
            for iocr in ar.iocrs.iter_mut() {
                if iocr.param.iocr_type.is_provider() {
                    continue;
                }
                if let Some(ix) = iocr.find_desc(api, slot_number, subslot_number) {
                    iocr.data_desc[ix].iocs = iocs;
                    return Ok(());
                }
            }
        }
        Err(())
    }

    /// The application finished parameterisation and is ready for cyclic
    /// data. Must be called after the PrmEnd event.
    pub fn application_ready(&mut self, arep: Arep) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| cmdev::cm_ccontrol_req(net, ar))
            .unwrap_or(Err(()))
    }

    /// Confirmation of a supervisor release; kept for API parity.
    pub fn sm_released_cnf(&mut self, arep: Arep) {
        info!("sm_released confirmation for AREP {}", arep);
    }

    /// Abort an AR from the application.
    pub fn ar_abort(&mut self, arep: Arep) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| cmdev::abort(net, ar))
            .map(|_| ())
            .ok_or(())
    }

    /// Whether any outbound alarm is queued or unacknowledged on the AR.
    pub fn alarm_pending(&self, arep: Arep) -> bool {
        self.live_ars()
            .find(|ar| ar.arep == arep)
            .map(alarm::pending)
            .unwrap_or(false)
    }

    /// The error pair of a live AR.
    pub fn get_ar_error_codes(&self, arep: Arep) -> Option<(u8, u8)> {
        self.live_ars()
            .find(|ar| ar.arep == arep)
            .map(|ar| (ar.err_cls, ar.err_code))
    }

    /// The CMDEV state of a live AR.
    pub fn ar_state(&self, arep: Arep) -> Option<CmdevState> {
        self.live_ars()
            .find(|ar| ar.arep == arep)
            .map(|ar| ar.cmdev_state)
    }

    /// Queue a process alarm.
    pub fn alarm_send_process(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        payload_usi: u16,
        payload: &[u8],
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| {
            alarm::send_process(net, ar, api, slot_number, subslot_number, payload_usi, payload)
        })
        .unwrap_or(Err(()))
    }

    /// Acknowledge a controller alarm delivered through the alarm
    /// indication callback.
    pub fn alarm_send_ack(
        &mut self,
        arep: Arep,
        arg: &AlarmArgument,
        status: PnioStatus,
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| alarm::alpmr_alarm_ack(net, ar, arg, status))
            .unwrap_or(Err(()))
    }

    /// Add a standard-format diagnosis.
    pub fn diag_std_add(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        diagnosis: StdDiagnosis,
        usi: u16,
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| {
            diag::std_add(net, ar, api, slot_number, subslot_number, diagnosis, usi)
        })
        .unwrap_or(Err(()))
    }

    /// Update a standard-format diagnosis.
    pub fn diag_std_update(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        diagnosis: StdDiagnosis,
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| {
            diag::std_update(net, ar, api, slot_number, subslot_number, diagnosis)
        })
        .unwrap_or(Err(()))
    }

    /// Remove a standard-format diagnosis.
    pub fn diag_std_remove(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        channel_number: u16,
        channel_error_type: u16,
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| {
            diag::std_remove(
                net,
                ar,
                api,
                slot_number,
                subslot_number,
                channel_number,
                channel_error_type,
            )
        })
        .unwrap_or(Err(()))
    }

    /// Add a diagnosis in either format: standard for USI values at or
    /// above 0x8000, manufacturer specific below.
    #[allow(clippy::too_many_arguments)]
    pub fn diag_add(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        diagnosis: StdDiagnosis,
        usi: u16,
        manuf_data: &[u8],
    ) -> Result<(), ()> {
        if usi < pnet_types::blocks::alarm::usi::CHANNEL_DIAGNOSIS {
            self.diag_usi_add(arep, api, slot_number, subslot_number, usi, manuf_data)
        } else {
            self.diag_std_add(arep, api, slot_number, subslot_number, diagnosis, usi)
        }
    }

    /// Update a diagnosis in either format.
    #[allow(clippy::too_many_arguments)]
    pub fn diag_update(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        diagnosis: StdDiagnosis,
        usi: u16,
        manuf_data: &[u8],
    ) -> Result<(), ()> {
        if usi < pnet_types::blocks::alarm::usi::CHANNEL_DIAGNOSIS {
            self.diag_usi_update(arep, api, slot_number, subslot_number, usi, manuf_data)
        } else {
            self.diag_std_update(arep, api, slot_number, subslot_number, diagnosis)
        }
    }

    /// Remove a diagnosis in either format.
    #[allow(clippy::too_many_arguments)]
    pub fn diag_remove(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        channel_number: u16,
        channel_error_type: u16,
        usi: u16,
    ) -> Result<(), ()> {
        if usi < pnet_types::blocks::alarm::usi::CHANNEL_DIAGNOSIS {
            self.diag_usi_remove(arep, api, slot_number, subslot_number, usi)
        } else {
            self.diag_std_remove(
                arep,
                api,
                slot_number,
                subslot_number,
                channel_number,
                channel_error_type,
            )
        }
    }

    /// Add a manufacturer specific (USI format) diagnosis.
    pub fn diag_usi_add(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        usi: u16,
        data: &[u8],
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| {
            diag::usi_add(net, ar, api, slot_number, subslot_number, usi, data)
        })
        .unwrap_or(Err(()))
    }

    /// Update a manufacturer specific diagnosis.
    pub fn diag_usi_update(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        usi: u16,
        data: &[u8],
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| {
            diag::usi_update(net, ar, api, slot_number, subslot_number, usi, data)
        })
        .unwrap_or(Err(()))
    }

    /// Remove a manufacturer specific diagnosis.
    pub fn diag_usi_remove(
        &mut self,
        arep: Arep,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        usi: u16,
    ) -> Result<(), ()> {
        self.with_ar(arep, |net, ar| {
            diag::usi_remove(net, ar, api, slot_number, subslot_number, usi)
        })
        .unwrap_or(Err(()))
    }

    /// The external cyclic-data path reports whether consumer data is
    /// possible. Moves `WData` to `Data` when it becomes true.
    pub fn io_data_possible_ind(&mut self, arep: Arep, data_possible: bool) {
        self.with_ar(arep, |net, ar| {
            cmdev::cmio_info_ind(net, ar, data_possible);
        });
    }

    /// The external LLDP collaborator reports the observed neighbour of
    /// port 1.
    pub fn lldp_peer_ind(&mut self, peer: Option<CheckPeer>) {
        self.ports.set_lldp_peer(peer);
    }

    /// The external cyclic-data path reports a data status change on a
    /// CR; forwarded to the application callback.
    pub fn cyclic_data_status_ind(&mut self, arep: Arep, crep: u32, changes: u8, data_status: u8) {
        if let Some(cb) = self.fspm.callbacks.new_data_status.as_mut() {
            cb(arep, crep, changes, data_status);
        }
    }

    /// Factory reset: abort every AR, restore the default configuration,
    /// blank the I&M records and clear the port files.
    pub fn factory_reset(&mut self) {
        info!("factory reset");
        self.abort_all_ars();
        self.fspm_reset_ind(true, 0);
        let directory = self.fspm.cfg.file_directory.clone();
        self.fspm.cfg = self.fspm.default_cfg.clone();
        self.fspm.clear_im_data();
        self.ports.reset(&directory);
    }

    /// Remove every nonvolatile file this stack writes under `directory`.
    pub fn remove_data_files(directory: &Path) {
        Fspm::remove_im_file(directory);
        pnet_core::files::clear(directory, FILENAME_PDPORT_1);
    }
}

fn free_diag_chain(pool: &mut DiagPool, mut head: u16) {
    while head != DIAG_IX_NULL {
        let next = pool.get(head).map(|i| i.next).unwrap_or(DIAG_IX_NULL);
        pool.free(head);
        head = next;
    }
}
