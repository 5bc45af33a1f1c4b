// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! FSPM: the application-facing surface.
//!
//! Owns the configuration copy, the default configuration used at factory
//! reset, the I&M records with their nonvolatile mirror, the wrap-around
//! log book, and the application callback record.

use std::path::Path;

use log::{error, info};
use parking_lot::Mutex;

use pnet_core::files;
use pnet_types::blocks::im::{im_supported, Im1, Im2, Im3, Im4};
use pnet_types::blocks::{begin_block, block_type, end_block, index};
use pnet_types::status::error_code_1;
use pnet_types::{BlockReader, BlockWriter, PnetUuid, PnioStatus, StackError, WriteError};

use crate::config::{Callbacks, ConfigError, PnetCfg};

/// Nonvolatile file holding I&M1 through I&M4.
pub const FILENAME_IM: &str = "im.dat";

/// Capacity of the log book ring.
pub const MAX_LOG_BOOK_ENTRIES: usize = 16;

/// One log book entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogBookEntry {
    /// Timestamp in microseconds from the wired time source.
    pub time_us: u32,
    /// The AR the event belongs to.
    pub ar_uuid: PnetUuid,
    /// The reported status.
    pub pnio_status: PnioStatus,
    /// Implementation detail word.
    pub entry_detail: u32,
}

/// Wrap-around ring of log book entries.
#[derive(Debug, Default)]
pub struct LogBook {
    entries: Vec<LogBookEntry>,
    put: usize,
    wrap: bool,
}

impl LogBook {
    /// Append an entry, overwriting the oldest once full.
    pub fn add(&mut self, entry: LogBookEntry) {
        if self.entries.len() < MAX_LOG_BOOK_ENTRIES {
            self.entries.push(entry);
        } else {
            self.entries[self.put] = entry;
        }
        self.put += 1;
        if self.put >= MAX_LOG_BOOK_ENTRIES {
            self.put = 0;
            self.wrap = true;
        }
    }

    /// Entries in insertion order, oldest first.
    pub fn entries(&self) -> Vec<LogBookEntry> {
        if !self.wrap {
            self.entries.clone()
        } else {
            let mut out = Vec::with_capacity(self.entries.len());
            out.extend_from_slice(&self.entries[self.put..]);
            out.extend_from_slice(&self.entries[..self.put]);
            out
        }
    }

    /// Encode for the log book record read.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        let entries = self.entries();
        w.put_u16(entries.len() as u16)?;
        for entry in &entries {
            w.put_u32(entry.time_us)?;
            w.put_uuid(&entry.ar_uuid)?;
            entry.pnio_status.encode(w)?;
            w.put_u32(entry.entry_detail)?;
        }
        Ok(())
    }
}

/// The FSPM instance.
pub struct Fspm {
    /// The runtime configuration; I&M data herein mutates at runtime.
    pub cfg: PnetCfg,
    /// The pristine configuration restored at factory reset.
    pub default_cfg: PnetCfg,
    /// The application callback record.
    pub callbacks: Callbacks,
    /// The log book, shared with the application thread.
    pub log_book: Mutex<LogBook>,
}

impl Fspm {
    /// Validate the configuration and load persisted I&M modifications.
    pub fn init(cfg: PnetCfg, callbacks: Callbacks) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let mut fspm = Self {
            default_cfg: cfg.clone(),
            cfg,
            callbacks,
            log_book: Mutex::new(LogBook::default()),
        };
        fspm.load_im();
        fspm.save_im_if_modified();
        // Turn the signal LED off.
        if let Some(cb) = fspm.callbacks.signal_led.as_mut() {
            cb(false);
        }
        Ok(fspm)
    }

    fn encode_im_file(&self) -> Vec<u8> {
        let mut w = BlockWriter::new(256);
        let _ = self.cfg.im_1_data.encode(&mut w);
        let _ = self.cfg.im_2_data.encode(&mut w);
        let _ = self.cfg.im_3_data.encode(&mut w);
        let _ = self.cfg.im_4_data.encode(&mut w);
        w.into_vec()
    }

    fn load_im(&mut self) {
        let Some(data) = files::load(&self.cfg.file_directory, FILENAME_IM) else {
            info!("no stored I&M settings, using configured values");
            return;
        };
        let mut r = BlockReader::new(&data);
        let im_1 = Im1::decode(&mut r);
        let im_2 = Im2::decode(&mut r);
        let im_3 = Im3::decode(&mut r);
        let im_4 = Im4::decode(&mut r);
        if r.result().is_ok() {
            info!("read I&M settings from nonvolatile storage");
            self.cfg.im_1_data = im_1;
            self.cfg.im_2_data = im_2;
            self.cfg.im_3_data = im_3;
            self.cfg.im_4_data = im_4;
        } else {
            error!("stored I&M settings are truncated, ignoring them");
        }
    }

    /// Persist I&M1..4 when the stored content differs.
    pub fn save_im_if_modified(&self) {
        let data = self.encode_im_file();
        if let Err(e) = files::save_if_modified(&self.cfg.file_directory, FILENAME_IM, &data) {
            error!("failed to store I&M settings: {}", e);
        }
    }

    /// Blank the writable I&M records (factory reset) and persist.
    pub fn clear_im_data(&mut self) {
        self.cfg.im_1_data = Im1::new("", "");
        self.cfg.im_2_data = Im2::new("");
        self.cfg.im_3_data = Im3::new("");
        self.cfg.im_4_data = Im4::default();
        self.save_im_if_modified();
    }

    /// Append a log book entry.
    pub fn log_book_entry(
        &self,
        time_us: u32,
        ar_uuid: &PnetUuid,
        pnio_status: PnioStatus,
        entry_detail: u32,
    ) {
        self.log_book.lock().add(LogBookEntry {
            time_us,
            ar_uuid: *ar_uuid,
            pnio_status,
            entry_detail,
        });
    }

    fn im_enabled(&self, bit: u16) -> bool {
        self.cfg.im_0_data.im_supported & bit != 0
    }

    /// Read one I&M record as a complete block. I&M0 is always readable;
    /// I&M1..4 only when enabled by the supported mask.
    pub fn read_im(&self, idx: u16) -> Result<Vec<u8>, StackError> {
        let mut w = BlockWriter::new(128);
        let write = |w: &mut BlockWriter, block: u16, f: &dyn Fn(&mut BlockWriter) -> Result<(), WriteError>| {
            let slot = begin_block(w, block)?;
            f(w)?;
            end_block(w, slot);
            Ok::<(), WriteError>(())
        };
        let result = match idx {
            index::SUB_IM_0 => {
                info!("PLC reads I&M0");
                write(&mut w, block_type::IM_0, &|w| self.cfg.im_0_data.encode(w))
            }
            index::SUB_IM_1 if self.im_enabled(im_supported::IM1) => {
                info!(
                    "PLC reads I&M1. Function '{}' location '{}'",
                    self.cfg.im_1_data.im_tag_function.trim_end(),
                    self.cfg.im_1_data.im_tag_location.trim_end()
                );
                write(&mut w, block_type::IM_1, &|w| self.cfg.im_1_data.encode(w))
            }
            index::SUB_IM_2 if self.im_enabled(im_supported::IM2) => {
                write(&mut w, block_type::IM_2, &|w| self.cfg.im_2_data.encode(w))
            }
            index::SUB_IM_3 if self.im_enabled(im_supported::IM3) => {
                write(&mut w, block_type::IM_3, &|w| self.cfg.im_3_data.encode(w))
            }
            index::SUB_IM_4 if self.im_enabled(im_supported::IM4) => {
                write(&mut w, block_type::IM_4, &|w| self.cfg.im_4_data.encode(w))
            }
            _ => {
                info!("PLC reads unavailable I&M record {:#06x}", idx);
                return Err(StackError::read_access(error_code_1::ACC_INVALID_INDEX));
            }
        };
        result.map_err(|_| StackError::read_access(error_code_1::APP_READ_ERROR))?;
        Ok(w.into_vec())
    }

    /// Write one I&M record. I&M0 is read-only; lengths are exact; the
    /// nonvolatile mirror is updated only on change.
    pub fn write_im(&mut self, idx: u16, data: &[u8]) -> Result<(), StackError> {
        let result = match idx {
            index::SUB_IM_0 => {
                error!("request to write I&M0, but it is read-only");
                Err(StackError::write_access(error_code_1::ACC_ACCESS_DENIED))
            }
            index::SUB_IM_1 if self.im_enabled(im_supported::IM1) => {
                let mut r = BlockReader::new(data);
                let im_1 = Im1::decode(&mut r);
                if r.result().is_ok() && r.remaining() == 0 {
                    info!(
                        "PLC writes I&M1. Function '{}' location '{}'",
                        im_1.im_tag_function.trim_end(),
                        im_1.im_tag_location.trim_end()
                    );
                    self.cfg.im_1_data = im_1;
                    Ok(())
                } else {
                    error!("wrong length of incoming I&M1 data");
                    Err(StackError::write_access(
                        error_code_1::ACC_WRITE_LENGTH_ERROR,
                    ))
                }
            }
            index::SUB_IM_2 if self.im_enabled(im_supported::IM2) => {
                let mut r = BlockReader::new(data);
                let im_2 = Im2::decode(&mut r);
                if r.result().is_ok() && r.remaining() == 0 {
                    info!("PLC writes I&M2. Date '{}'", im_2.im_date.trim_end());
                    self.cfg.im_2_data = im_2;
                    Ok(())
                } else {
                    Err(StackError::write_access(
                        error_code_1::ACC_WRITE_LENGTH_ERROR,
                    ))
                }
            }
            index::SUB_IM_3 if self.im_enabled(im_supported::IM3) => {
                let mut r = BlockReader::new(data);
                let im_3 = Im3::decode(&mut r);
                if r.result().is_ok() && r.remaining() == 0 {
                    self.cfg.im_3_data = im_3;
                    Ok(())
                } else {
                    Err(StackError::write_access(
                        error_code_1::ACC_WRITE_LENGTH_ERROR,
                    ))
                }
            }
            index::SUB_IM_4 if self.im_enabled(im_supported::IM4) => {
                let mut r = BlockReader::new(data);
                let im_4 = Im4::decode(&mut r);
                if r.result().is_ok() && r.remaining() == 0 {
                    self.cfg.im_4_data = im_4;
                    Ok(())
                } else {
                    Err(StackError::write_access(
                        error_code_1::ACC_WRITE_LENGTH_ERROR,
                    ))
                }
            }
            idx if (index::SUB_IM_0..=index::SUB_IM_15).contains(&idx) => {
                error!("request to write unsupported I&M record {:#06x}", idx);
                Err(StackError::write_access(error_code_1::ACC_INVALID_INDEX))
            }
            _ => Err(StackError::write_access(error_code_1::ACC_INVALID_INDEX)),
        };
        self.save_im_if_modified();
        result
    }

    /// Remove the stored I&M file.
    pub fn remove_im_file(directory: &Path) {
        files::clear(directory, FILENAME_IM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PnetCfg;

    fn fspm_in(dir: &Path) -> Fspm {
        let cfg = PnetCfg {
            file_directory: dir.to_path_buf(),
            ..Default::default()
        };
        Fspm::init(cfg, Callbacks::default()).unwrap()
    }

    #[test]
    fn log_book_wraps() {
        let mut book = LogBook::default();
        for i in 0..(MAX_LOG_BOOK_ENTRIES as u32 + 3) {
            book.add(LogBookEntry {
                time_us: i,
                ..Default::default()
            });
        }
        let entries = book.entries();
        assert_eq!(MAX_LOG_BOOK_ENTRIES, entries.len());
        // Oldest surviving entry first.
        assert_eq!(3, entries[0].time_us);
        assert_eq!(MAX_LOG_BOOK_ENTRIES as u32 + 2, entries.last().unwrap().time_us);
    }

    #[test]
    fn im1_write_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut fspm = fspm_in(dir.path());
            let im_1 = Im1::new("PUMP-01", "LINE-A");
            let mut w = BlockWriter::new(64);
            im_1.encode(&mut w).unwrap();
            fspm.write_im(index::SUB_IM_1, w.as_slice()).unwrap();
        }
        // Restart: the stored record is loaded.
        let fspm = fspm_in(dir.path());
        assert_eq!(Im1::new("PUMP-01", "LINE-A"), fspm.cfg.im_1_data);
    }

    #[test]
    fn im0_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut fspm = fspm_in(dir.path());
        let err = fspm.write_im(index::SUB_IM_0, &[0u8; 54]).unwrap_err();
        assert_eq!(
            error_code_1::ACC_ACCESS_DENIED,
            err.pnio_status.error_code_1
        );
    }

    #[test]
    fn im1_wrong_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut fspm = fspm_in(dir.path());
        let err = fspm.write_im(index::SUB_IM_1, &[0u8; 10]).unwrap_err();
        assert_eq!(
            error_code_1::ACC_WRITE_LENGTH_ERROR,
            err.pnio_status.error_code_1
        );
    }
}
