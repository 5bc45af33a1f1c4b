// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `PnetUuid`.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// A 16-byte UUID with DCE field ordering: `data1 u32`, `data2 u16`,
/// `data3 u16`, `data4 [u8; 8]`.
///
/// AR UUIDs, activity UUIDs and interface UUIDs are all carried in this
/// layout; the integer fields follow the endianness of the enclosing
/// message while `data4` is plain bytes.
#[derive(Eq, PartialEq, Clone, Copy, Default, Hash)]
pub struct PnetUuid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl PnetUuid {
    /// The nil UUID.
    pub fn nil() -> Self {
        Self::default()
    }

    /// Build from the four DCE fields.
    pub fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// The four DCE fields.
    pub fn as_fields(&self) -> (u32, u16, u16, [u8; 8]) {
        (self.data1, self.data2, self.data3, self.data4)
    }

    /// A random (v4) UUID. Used for activity UUIDs originated by this side.
    pub fn new_random() -> Self {
        Uuid::new_v4().into()
    }

    /// True if every byte is zero.
    pub fn is_nil(&self) -> bool {
        self.data1 == 0 && self.data2 == 0 && self.data3 == 0 && self.data4 == [0u8; 8]
    }

    /// Check for the well-known CM-initiator object UUID pattern
    /// `DEA00000-6C97-11D1-8271-...`. Only the leading fields are
    /// significant; the tail encodes the initiator instance.
    pub fn is_cm_initiator_object_uuid(&self) -> bool {
        self.data1 == 0xDEA0_0000
            && self.data2 == 0x6C97
            && self.data3 == 0x11D1
            && self.data4[0] == 0x82
            && self.data4[1] == 0x71
    }
}

impl From<Uuid> for PnetUuid {
    fn from(value: Uuid) -> Self {
        let (data1, data2, data3, data4) = value.as_fields();
        Self {
            data1,
            data2,
            data3,
            data4: *data4,
        }
    }
}

impl From<PnetUuid> for Uuid {
    fn from(value: PnetUuid) -> Self {
        Uuid::from_fields(value.data1, value.data2, value.data3, &value.data4)
    }
}

impl FromStr for PnetUuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Into::into)
    }
}

impl fmt::Display for PnetUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from(*self).hyphenated())
    }
}

impl fmt::Debug for PnetUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// The PROFINET IO device interface UUID, `DEA00001-6C97-11D1-8271-00A02442DF7D`.
pub fn device_interface_uuid() -> PnetUuid {
    PnetUuid::from_fields(
        0xDEA0_0001,
        0x6C97,
        0x11D1,
        [0x82, 0x71, 0x00, 0xA0, 0x24, 0x42, 0xDF, 0x7D],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_object_uuid_pattern() {
        let good = PnetUuid::from_fields(
            0xDEA0_0000,
            0x6C97,
            0x11D1,
            [0x82, 0x71, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC],
        );
        assert!(good.is_cm_initiator_object_uuid());

        let bad = PnetUuid::from_fields(0xDEA0_0001, 0x6C97, 0x11D1, [0x82, 0x71, 0, 0, 0, 0, 0, 0]);
        assert!(!bad.is_cm_initiator_object_uuid());
    }

    #[test]
    fn nil_detection() {
        assert!(PnetUuid::nil().is_nil());
        assert!(!PnetUuid::new_random().is_nil());
    }

    #[test]
    fn string_round_trip() {
        let uuid: PnetUuid = "dea00001-6c97-11d1-8271-00a02442df7d".parse().unwrap();
        assert_eq!(uuid, device_interface_uuid());
        assert_eq!("dea00001-6c97-11d1-8271-00a02442df7d", uuid.to_string());
    }
}
