// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Identification & Maintenance records 0 through 4.
//!
//! The text fields are fixed-width on the wire, space padded. The
//! constructors pad, so a freshly-built record equals its own decode.

use crate::{BlockReader, BlockWriter, WriteError};

/// Supported-I&M mask bits carried in I&M0.
pub mod im_supported {
    /// I&M1 is implemented.
    pub const IM1: u16 = 1 << 1;
    /// I&M2 is implemented.
    pub const IM2: u16 = 1 << 2;
    /// I&M3 is implemented.
    pub const IM3: u16 = 1 << 3;
    /// I&M4 is implemented.
    pub const IM4: u16 = 1 << 4;
    /// Every bit this stack accepts in the mask.
    pub const ALL: u16 = IM1 | IM2 | IM3 | IM4;
}

fn pad_fixed(s: &str, width: usize) -> String {
    let mut out: String = s.chars().filter(char::is_ascii).take(width).collect();
    while out.len() < width {
        out.push(' ');
    }
    out
}

/// I&M0: the read-only identification record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Im0 {
    /// Vendor ID, high byte.
    pub vendor_id_hi: u8,
    /// Vendor ID, low byte.
    pub vendor_id_lo: u8,
    /// Order ID, 20 characters.
    pub order_id: String,
    /// Serial number, 16 characters.
    pub im_serial_number: String,
    /// Hardware revision.
    pub im_hardware_revision: u16,
    /// Software revision prefix character (e.g. 'V').
    pub sw_revision_prefix: u8,
    /// Functional enhancement.
    pub im_sw_revision_functional_enhancement: u8,
    /// Bug fix.
    pub im_sw_revision_bug_fix: u8,
    /// Internal change.
    pub im_sw_revision_internal_change: u8,
    /// Revision counter.
    pub im_revision_counter: u16,
    /// Profile ID.
    pub im_profile_id: u16,
    /// Profile specific type.
    pub im_profile_specific_type: u16,
    /// I&M version, major.
    pub im_version_major: u8,
    /// I&M version, minor.
    pub im_version_minor: u8,
    /// Which optional records are implemented, see [`im_supported`].
    pub im_supported: u16,
}

impl Im0 {
    /// Wire size of the record body.
    pub const WIRE_SIZE: usize = 54;

    /// Read an I&M0 body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            vendor_id_hi: r.get_u8(),
            vendor_id_lo: r.get_u8(),
            order_id: r.get_string(20, 20),
            im_serial_number: r.get_string(16, 16),
            im_hardware_revision: r.get_u16(),
            sw_revision_prefix: r.get_u8(),
            im_sw_revision_functional_enhancement: r.get_u8(),
            im_sw_revision_bug_fix: r.get_u8(),
            im_sw_revision_internal_change: r.get_u8(),
            im_revision_counter: r.get_u16(),
            im_profile_id: r.get_u16(),
            im_profile_specific_type: r.get_u16(),
            im_version_major: r.get_u8(),
            im_version_minor: r.get_u8(),
            im_supported: r.get_u16(),
        }
    }

    /// Write an I&M0 body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u8(self.vendor_id_hi)?;
        w.put_u8(self.vendor_id_lo)?;
        w.put_fixed_string(&self.order_id, 20)?;
        w.put_fixed_string(&self.im_serial_number, 16)?;
        w.put_u16(self.im_hardware_revision)?;
        w.put_u8(self.sw_revision_prefix)?;
        w.put_u8(self.im_sw_revision_functional_enhancement)?;
        w.put_u8(self.im_sw_revision_bug_fix)?;
        w.put_u8(self.im_sw_revision_internal_change)?;
        w.put_u16(self.im_revision_counter)?;
        w.put_u16(self.im_profile_id)?;
        w.put_u16(self.im_profile_specific_type)?;
        w.put_u8(self.im_version_major)?;
        w.put_u8(self.im_version_minor)?;
        w.put_u16(self.im_supported)
    }
}

/// I&M1: tag function and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Im1 {
    /// Tag function, 32 characters.
    pub im_tag_function: String,
    /// Tag location, 22 characters.
    pub im_tag_location: String,
}

impl Im1 {
    /// Wire size of the record body.
    pub const WIRE_SIZE: usize = 54;

    /// Build with space padding to the fixed widths.
    pub fn new(tag_function: &str, tag_location: &str) -> Self {
        Self {
            im_tag_function: pad_fixed(tag_function, 32),
            im_tag_location: pad_fixed(tag_location, 22),
        }
    }

    /// Read an I&M1 body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            im_tag_function: r.get_string(32, 32),
            im_tag_location: r.get_string(22, 22),
        }
    }

    /// Write an I&M1 body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_fixed_string(&self.im_tag_function, 32)?;
        w.put_fixed_string(&self.im_tag_location, 22)
    }
}

impl Default for Im1 {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// I&M2: installation date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Im2 {
    /// Installation date, 16 characters, `YYYY-MM-DD HH:MM`.
    pub im_date: String,
}

impl Im2 {
    /// Wire size of the record body.
    pub const WIRE_SIZE: usize = 16;

    /// Build with space padding to the fixed width.
    pub fn new(date: &str) -> Self {
        Self {
            im_date: pad_fixed(date, 16),
        }
    }

    /// Read an I&M2 body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            im_date: r.get_string(16, 16),
        }
    }

    /// Write an I&M2 body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_fixed_string(&self.im_date, 16)
    }
}

impl Default for Im2 {
    fn default() -> Self {
        Self::new("")
    }
}

/// I&M3: descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Im3 {
    /// Free-form descriptor, 54 characters.
    pub im_descriptor: String,
}

impl Im3 {
    /// Wire size of the record body.
    pub const WIRE_SIZE: usize = 54;

    /// Build with space padding to the fixed width.
    pub fn new(descriptor: &str) -> Self {
        Self {
            im_descriptor: pad_fixed(descriptor, 54),
        }
    }

    /// Read an I&M3 body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            im_descriptor: r.get_string(54, 54),
        }
    }

    /// Write an I&M3 body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_fixed_string(&self.im_descriptor, 54)
    }
}

impl Default for Im3 {
    fn default() -> Self {
        Self::new("")
    }
}

/// I&M4: signature, binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Im4 {
    /// 54 bytes of signature data.
    pub im_signature: [u8; 54],
}

impl Im4 {
    /// Wire size of the record body.
    pub const WIRE_SIZE: usize = 54;

    /// Read an I&M4 body.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            im_signature: r.get_array::<54>(),
        }
    }

    /// Write an I&M4 body.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_mem(&self.im_signature)
    }
}

impl Default for Im4 {
    fn default() -> Self {
        Self {
            im_signature: [0; 54],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockReader;

    #[test]
    fn im1_round_trip_with_padding() {
        let im1 = Im1::new("PUMP-01", "LINE-A");
        assert_eq!(32, im1.im_tag_function.len());
        assert_eq!(22, im1.im_tag_location.len());

        let mut w = BlockWriter::new(64);
        im1.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(Im1::WIRE_SIZE, bytes.len());
        let mut r = BlockReader::new(&bytes);
        assert_eq!(im1, Im1::decode(&mut r));
        assert!(r.result().is_ok());
    }

    #[test]
    fn im0_round_trip() {
        let im0 = Im0 {
            vendor_id_hi: 0x01,
            vendor_id_lo: 0x41,
            order_id: pad_fixed("DEV-0001", 20),
            im_serial_number: pad_fixed("00001", 16),
            im_hardware_revision: 1,
            sw_revision_prefix: b'V',
            im_sw_revision_functional_enhancement: 0,
            im_sw_revision_bug_fix: 1,
            im_sw_revision_internal_change: 0,
            im_revision_counter: 0,
            im_profile_id: 0x1234,
            im_profile_specific_type: 0,
            im_version_major: 1,
            im_version_minor: 1,
            im_supported: im_supported::IM1 | im_supported::IM2,
        };
        let mut w = BlockWriter::new(64);
        im0.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(Im0::WIRE_SIZE, bytes.len());
        let mut r = BlockReader::new(&bytes);
        assert_eq!(im0, Im0::decode(&mut r));
    }

    #[test]
    fn over_long_input_is_truncated() {
        let im2 = Im2::new("2024-02-29 10:33:59.123");
        assert_eq!(16, im2.im_date.len());
        assert_eq!("2024-02-29 10:33", im2.im_date);
    }
}
