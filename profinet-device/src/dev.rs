// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The device tree (API -> slot -> subslot) and the pooled diagnosis
//! items.
//!
//! Cross-references are 16-bit indices into the arenas, never pointers:
//! a subslot names its owning AR by `arep` and its diagnosis chain by a
//! pool index, so clearing an aborted AR is a plain sweep.

use log::{debug, error, info};
use parking_lot::Mutex;

use pnet_types::blocks::exp_ident::SubmoduleDir;

use crate::ar::Arep;

/// Number of diagnosis items in the pool.
pub const MAX_DIAG_ITEMS: usize = 64;
/// End-of-list marker in diagnosis chains.
pub const DIAG_IX_NULL: u16 = u16::MAX;
/// Slot limit per API.
pub const MAX_SLOTS: usize = 16;
/// Subslot limit per slot.
pub const MAX_SUBSLOTS: usize = 8;
/// API limit.
pub const MAX_APIS: usize = 4;

/// Channel number addressing the whole submodule.
pub const CHANNEL_WHOLE_SUBMODULE: u16 = 0x8000;

/// Plug state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModulePlugState {
    /// Nothing plugged.
    #[default]
    None,
    /// The proper module is plugged.
    Proper,
    /// A different module is plugged.
    Wrong,
    /// A substitute accepted in place of the expected module.
    Substitute,
}

/// One diagnosis item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagItem {
    /// User structure identifier classifying the payload format.
    pub usi: u16,
    /// Channel number, or [`CHANNEL_WHOLE_SUBMODULE`].
    pub channel_number: u16,
    /// Channel properties word (direction, maintenance, specifier).
    pub channel_properties: u16,
    /// Channel error type.
    pub channel_error_type: u16,
    /// Extended channel error type.
    pub ext_channel_error_type: u16,
    /// Extended channel additional value.
    pub ext_channel_add_value: u32,
    /// Qualified channel qualifier.
    pub qualifier: u32,
    /// Length of the manufacturer specific payload (USI format).
    pub manuf_len: u8,
    /// Manufacturer specific payload, for USI values below 0x8000.
    pub manuf_data: [u8; 16],
    /// Next item in the per-subslot chain, or [`DIAG_IX_NULL`].
    pub next: u16,
}

/// Channel properties helpers: maintenance bits 9..11, specifier bits 11..13.
pub mod ch_prop {
    /// Severity: fault.
    pub const MAINT_FAULT: u16 = 0;
    /// Severity: maintenance required.
    pub const MAINT_REQUIRED: u16 = 1;
    /// Severity: maintenance demanded.
    pub const MAINT_DEMANDED: u16 = 2;
    /// Severity: qualified by the qualifier word.
    pub const MAINT_QUALIFIED: u16 = 3;

    /// Specifier: all diagnoses gone.
    pub const SPEC_ALL_DISAPPEARS: u16 = 0;
    /// Specifier: this diagnosis appears.
    pub const SPEC_APPEARS: u16 = 1;
    /// Specifier: this diagnosis disappears.
    pub const SPEC_DISAPPEARS: u16 = 2;

    /// Read the maintenance field.
    pub fn maintenance(properties: u16) -> u16 {
        (properties >> 9) & 0x3
    }

    /// Read the specifier field.
    pub fn specifier(properties: u16) -> u16 {
        (properties >> 11) & 0x3
    }

    /// Build a properties word from maintenance and specifier fields.
    pub fn build(maintenance: u16, specifier: u16) -> u16 {
        ((maintenance & 0x3) << 9) | ((specifier & 0x3) << 11)
    }
}

/// The pooled diagnosis items plus the free list.
pub struct DiagPool {
    items: Vec<DiagItem>,
    in_use: Vec<bool>,
    free_head: u16,
}

impl Default for DiagPool {
    fn default() -> Self {
        let mut items = vec![DiagItem::default(); MAX_DIAG_ITEMS];
        for (ix, item) in items.iter_mut().enumerate() {
            item.next = if ix + 1 < MAX_DIAG_ITEMS {
                (ix + 1) as u16
            } else {
                DIAG_IX_NULL
            };
        }
        Self {
            items,
            in_use: vec![false; MAX_DIAG_ITEMS],
            free_head: 0,
        }
    }
}

impl DiagPool {
    /// Allocate an item from the free list.
    pub fn alloc(&mut self) -> Option<u16> {
        let ix = self.free_head;
        if ix == DIAG_IX_NULL {
            error!("diagnosis pool exhausted ({} items)", MAX_DIAG_ITEMS);
            return None;
        }
        self.free_head = self.items[ix as usize].next;
        self.items[ix as usize] = DiagItem {
            next: DIAG_IX_NULL,
            ..Default::default()
        };
        self.in_use[ix as usize] = true;
        Some(ix)
    }

    /// Return an item to the free list.
    pub fn free(&mut self, ix: u16) {
        debug_assert!(self.in_use[ix as usize]);
        self.in_use[ix as usize] = false;
        self.items[ix as usize].next = self.free_head;
        self.free_head = ix;
    }

    /// Borrow an item.
    pub fn get(&self, ix: u16) -> Option<&DiagItem> {
        if ix == DIAG_IX_NULL || !self.in_use.get(ix as usize).copied().unwrap_or(false) {
            None
        } else {
            Some(&self.items[ix as usize])
        }
    }

    /// Borrow an item mutably.
    pub fn get_mut(&mut self, ix: u16) -> Option<&mut DiagItem> {
        if ix == DIAG_IX_NULL || !self.in_use.get(ix as usize).copied().unwrap_or(false) {
            None
        } else {
            Some(&mut self.items[ix as usize])
        }
    }

    /// Number of items on the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut ix = self.free_head;
        while ix != DIAG_IX_NULL {
            count += 1;
            ix = self.items[ix as usize].next;
        }
        count
    }
}

/// A subslot with a plugged submodule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subslot {
    /// Subslot number.
    pub subslot_number: u16,
    /// Plugged submodule ident.
    pub submodule_ident_number: u32,
    /// Data direction of the plugged submodule.
    pub direction: SubmoduleDir,
    /// Input data length in bytes.
    pub input_length: u16,
    /// Output data length in bytes.
    pub output_length: u16,
    /// The AR owning this subslot, if any.
    pub owning_ar: Option<Arep>,
    /// Plugged submodule differs from the expected one.
    pub substitute: bool,
    /// Head of the diagnosis chain in the pool.
    pub diag_list: u16,
    /// Fault summary from standard diagnoses.
    pub fault: bool,
    /// Maintenance-required summary.
    pub maintenance_required: bool,
    /// Maintenance-demanded summary.
    pub maintenance_demanded: bool,
}

impl Subslot {
    fn new(subslot_number: u16) -> Self {
        Self {
            subslot_number,
            diag_list: DIAG_IX_NULL,
            ..Default::default()
        }
    }
}

/// A slot with a plugged module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slot {
    /// Slot number.
    pub slot_number: u16,
    /// Plugged module ident.
    pub module_ident_number: u32,
    /// Plug state.
    pub plug_state: ModulePlugState,
    /// Plugged subslots.
    pub subslots: Vec<Subslot>,
}

/// One API in the device tree.
#[derive(Debug, Clone, Default)]
pub struct ApiEntry {
    /// The API identifier.
    pub api: u32,
    /// Plugged slots.
    pub slots: Vec<Slot>,
}

/// The device tree plus the diagnosis pool.
pub struct Device {
    /// APIs; API 0 always exists.
    pub apis: Vec<ApiEntry>,
    /// The diagnosis pool, shared with the application thread.
    pub diag: Mutex<DiagPool>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            apis: vec![ApiEntry::default()],
            diag: Mutex::new(DiagPool::default()),
        }
    }
}

/// Failure of a plug or pull operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugError {
    /// API / slot / subslot limits reached.
    NoResources,
    /// Addressed entity not found.
    NotFound,
}

impl Device {
    /// Find an API.
    pub fn api(&self, api: u32) -> Option<&ApiEntry> {
        self.apis.iter().find(|a| a.api == api)
    }

    fn api_mut_or_new(&mut self, api: u32) -> Result<&mut ApiEntry, PlugError> {
        if let Some(ix) = self.apis.iter().position(|a| a.api == api) {
            return Ok(&mut self.apis[ix]);
        }
        if self.apis.len() >= MAX_APIS {
            return Err(PlugError::NoResources);
        }
        self.apis.push(ApiEntry {
            api,
            slots: Vec::new(),
        });
        let ix = self.apis.len() - 1;
        Ok(&mut self.apis[ix])
    }

    /// Find a slot.
    pub fn slot(&self, api: u32, slot_number: u16) -> Option<&Slot> {
        self.api(api)?.slots.iter().find(|s| s.slot_number == slot_number)
    }

    /// Find a slot mutably.
    pub fn slot_mut(&mut self, api: u32, slot_number: u16) -> Option<&mut Slot> {
        self.apis
            .iter_mut()
            .find(|a| a.api == api)?
            .slots
            .iter_mut()
            .find(|s| s.slot_number == slot_number)
    }

    /// Find a subslot.
    pub fn subslot(&self, api: u32, slot_number: u16, subslot_number: u16) -> Option<&Subslot> {
        self.slot(api, slot_number)?
            .subslots
            .iter()
            .find(|s| s.subslot_number == subslot_number)
    }

    /// Find a subslot mutably.
    pub fn subslot_mut(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
    ) -> Option<&mut Subslot> {
        self.slot_mut(api, slot_number)?
            .subslots
            .iter_mut()
            .find(|s| s.subslot_number == subslot_number)
    }

    /// Module ident of a plugged slot.
    pub fn module_ident(&self, api: u32, slot_number: u16) -> Option<u32> {
        let slot = self.slot(api, slot_number)?;
        (slot.plug_state != ModulePlugState::None).then_some(slot.module_ident_number)
    }

    /// Submodule ident of a plugged subslot.
    pub fn submodule_ident(&self, api: u32, slot_number: u16, subslot_number: u16) -> Option<u32> {
        self.subslot(api, slot_number, subslot_number)
            .map(|s| s.submodule_ident_number)
    }

    /// Plug a module into a slot. A matching re-plug is a no-op; plugging
    /// over a different module marks the slot substitute.
    pub fn plug_module(
        &mut self,
        api: u32,
        slot_number: u16,
        module_ident: u32,
    ) -> Result<ModulePlugState, PlugError> {
        let api_entry = self.api_mut_or_new(api)?;
        if let Some(slot) = api_entry
            .slots
            .iter_mut()
            .find(|s| s.slot_number == slot_number)
        {
            if slot.plug_state != ModulePlugState::None && slot.module_ident_number != module_ident
            {
                info!(
                    "slot {} re-plugged with 0x{:08x} (was 0x{:08x}): substitute",
                    slot_number, module_ident, slot.module_ident_number
                );
                slot.module_ident_number = module_ident;
                slot.plug_state = ModulePlugState::Substitute;
            } else {
                slot.module_ident_number = module_ident;
                slot.plug_state = ModulePlugState::Proper;
            }
            return Ok(slot.plug_state);
        }
        if api_entry.slots.len() >= MAX_SLOTS {
            return Err(PlugError::NoResources);
        }
        debug!("plugging module 0x{:08x} into slot {}", module_ident, slot_number);
        api_entry.slots.push(Slot {
            slot_number,
            module_ident_number: module_ident,
            plug_state: ModulePlugState::Proper,
            subslots: Vec::new(),
        });
        Ok(ModulePlugState::Proper)
    }

    /// Plug a submodule. Returns whether the plug is proper or a
    /// substitute for something else the controller expected.
    #[allow(clippy::too_many_arguments)]
    pub fn plug_submodule(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
        submodule_ident: u32,
        direction: SubmoduleDir,
        input_length: u16,
        output_length: u16,
    ) -> Result<&mut Subslot, PlugError> {
        let slot = self
            .slot_mut(api, slot_number)
            .ok_or(PlugError::NotFound)?;
        if let Some(ix) = slot
            .subslots
            .iter()
            .position(|s| s.subslot_number == subslot_number)
        {
            let sub = &mut slot.subslots[ix];
            sub.substitute = sub.submodule_ident_number != submodule_ident
                && sub.submodule_ident_number != 0;
            sub.submodule_ident_number = submodule_ident;
            sub.direction = direction;
            sub.input_length = input_length;
            sub.output_length = output_length;
            return Ok(sub);
        }
        if slot.subslots.len() >= MAX_SUBSLOTS {
            return Err(PlugError::NoResources);
        }
        debug!(
            "plugging submodule 0x{:08x} into slot {} subslot 0x{:04x}",
            submodule_ident, slot_number, subslot_number
        );
        slot.subslots.push(Subslot {
            submodule_ident_number: submodule_ident,
            direction,
            input_length,
            output_length,
            ..Subslot::new(subslot_number)
        });
        Ok(slot.subslots.last_mut().unwrap())
    }

    /// Pull a submodule, returning its diagnosis chain head so the caller
    /// can free the items.
    pub fn pull_submodule(
        &mut self,
        api: u32,
        slot_number: u16,
        subslot_number: u16,
    ) -> Result<Subslot, PlugError> {
        let slot = self
            .slot_mut(api, slot_number)
            .ok_or(PlugError::NotFound)?;
        let ix = slot
            .subslots
            .iter()
            .position(|s| s.subslot_number == subslot_number)
            .ok_or(PlugError::NotFound)?;
        Ok(slot.subslots.remove(ix))
    }

    /// Pull a module with all its submodules. All-or-nothing: fails
    /// without touching anything if the slot is unknown.
    pub fn pull_module(&mut self, api: u32, slot_number: u16) -> Result<Slot, PlugError> {
        let api_entry = self
            .apis
            .iter_mut()
            .find(|a| a.api == api)
            .ok_or(PlugError::NotFound)?;
        let ix = api_entry
            .slots
            .iter()
            .position(|s| s.slot_number == slot_number)
            .ok_or(PlugError::NotFound)?;
        Ok(api_entry.slots.remove(ix))
    }

    /// Clear every back-reference to an aborted AR.
    pub fn clear_ar(&mut self, arep: Arep) {
        for api in &mut self.apis {
            for slot in &mut api.slots {
                for sub in &mut slot.subslots {
                    if sub.owning_ar == Some(arep) {
                        sub.owning_ar = None;
                    }
                }
            }
        }
    }

    /// Walk a subslot's diagnosis chain, collecting the item indices.
    pub fn diag_chain(&self, pool: &DiagPool, subslot: &Subslot) -> Vec<u16> {
        let mut out = Vec::new();
        let mut ix = subslot.diag_list;
        while ix != DIAG_IX_NULL {
            out.push(ix);
            match pool.get(ix) {
                Some(item) => ix = item.next,
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diag_pool_partition_invariant() {
        let mut pool = DiagPool::default();
        assert_eq!(MAX_DIAG_ITEMS, pool.free_count());

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(MAX_DIAG_ITEMS - 2, pool.free_count());

        pool.free(a);
        assert_eq!(MAX_DIAG_ITEMS - 1, pool.free_count());
        pool.free(b);
        assert_eq!(MAX_DIAG_ITEMS, pool.free_count());
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let mut pool = DiagPool::default();
        for _ in 0..MAX_DIAG_ITEMS {
            assert!(pool.alloc().is_some());
        }
        assert_eq!(None, pool.alloc());
    }

    #[test]
    fn plug_matching_then_mismatching_module() {
        let mut dev = Device::default();
        assert_eq!(
            ModulePlugState::Proper,
            dev.plug_module(0, 1, 0x32).unwrap()
        );
        assert_eq!(
            ModulePlugState::Proper,
            dev.plug_module(0, 1, 0x32).unwrap()
        );
        assert_eq!(
            ModulePlugState::Substitute,
            dev.plug_module(0, 1, 0x99).unwrap()
        );
    }

    #[test]
    fn pull_module_removes_subslots() {
        let mut dev = Device::default();
        dev.plug_module(0, 1, 0x32).unwrap();
        dev.plug_submodule(0, 1, 1, 0x133, SubmoduleDir::Input, 4, 0)
            .unwrap();
        dev.plug_submodule(0, 1, 2, 0x134, SubmoduleDir::Output, 0, 2)
            .unwrap();
        let slot = dev.pull_module(0, 1).unwrap();
        assert_eq!(2, slot.subslots.len());
        assert!(dev.slot(0, 1).is_none());
        assert_eq!(Err(PlugError::NotFound), dev.pull_module(0, 1));
    }

    #[test]
    fn clear_ar_sweeps_owners() {
        let mut dev = Device::default();
        dev.plug_module(0, 1, 1).unwrap();
        dev.plug_submodule(0, 1, 1, 2, SubmoduleDir::Input, 1, 0)
            .unwrap();
        dev.subslot_mut(0, 1, 1).unwrap().owning_ar = Some(7);
        dev.clear_ar(7);
        assert_eq!(None, dev.subslot(0, 1, 1).unwrap().owning_ar);
    }
}
