// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Device configuration and the application callback record.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pnet_types::blocks::im::{im_supported, Im0, Im1, Im2, Im3, Im4};
use pnet_types::{PnioStatus, StackError};

use crate::ar::Arep;
use crate::cmdev::CmdevEvent;

/// Upper bound on `min_device_interval`: 128 ms in units of 1/32 ms.
pub const MIN_DEVICE_INTERVAL_MAX: u16 = 0x1000;

/// Configuration rejected at init.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `min_device_interval` out of the accepted range.
    #[error("min_device_interval {0} not in 1..=4096 (units of 1/32 ms)")]
    BadMinDeviceInterval(u16),
    /// The I&M supported mask names records beyond I&M1..4.
    #[error("im_supported mask {0:#06x} has bits outside I&M1..I&M4")]
    BadImSupportedMask(u16),
    /// The YAML identity file could not be parsed.
    #[error("identity file error: {0}")]
    IdentityFile(String),
}

/// Static device identity, loadable from a YAML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Station name used in connect responses.
    pub station_name: String,
    /// Product name.
    pub product_name: String,
    /// Order id for I&M0.
    pub order_id: String,
    /// Serial number for I&M0.
    pub serial_number: String,
    /// Vendor id, high byte.
    pub vendor_id_hi: u8,
    /// Vendor id, low byte.
    pub vendor_id_lo: u8,
}

impl DeviceIdentity {
    /// Load the identity from a YAML file.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::IdentityFile(e.to_string()))
    }

    /// Serialise the identity to YAML.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}

/// The device configuration handed to `Net::init`. A copy is kept inside
/// the stack; I&M data in the copy is updated at runtime and persisted.
#[derive(Debug, Clone)]
pub struct PnetCfg {
    /// Device identity.
    pub identity: DeviceIdentity,
    /// Device MAC address, used as the source of alarm frames.
    pub mac_address: [u8; 6],
    /// Smallest supported device interval in units of 1/32 ms (32 = 1 ms).
    pub min_device_interval: u16,
    /// Directory for the nonvolatile files.
    pub file_directory: PathBuf,
    /// I&M0 (read-only identification, carries the supported mask).
    pub im_0_data: Im0,
    /// I&M1.
    pub im_1_data: Im1,
    /// I&M2.
    pub im_2_data: Im2,
    /// I&M3.
    pub im_3_data: Im3,
    /// I&M4.
    pub im_4_data: Im4,
}

impl PnetCfg {
    /// Validate the ranges the stack refuses to start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_device_interval == 0 || self.min_device_interval > MIN_DEVICE_INTERVAL_MAX {
            return Err(ConfigError::BadMinDeviceInterval(self.min_device_interval));
        }
        if self.im_0_data.im_supported & !im_supported::ALL != 0 {
            return Err(ConfigError::BadImSupportedMask(self.im_0_data.im_supported));
        }
        Ok(())
    }
}

impl Default for PnetCfg {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::default(),
            mac_address: [0; 6],
            min_device_interval: 32,
            file_directory: PathBuf::from("."),
            im_0_data: Im0 {
                im_supported: im_supported::ALL,
                ..Default::default()
            },
            im_1_data: Im1::default(),
            im_2_data: Im2::default(),
            im_3_data: Im3::default(),
            im_4_data: Im4::default(),
        }
    }
}

/// Outcome of an application callback that can veto an operation.
pub type CallbackResult = Result<(), StackError>;

/// Arguments of an incoming alarm indication.
#[derive(Debug, Clone)]
pub struct AlarmArgument {
    /// API identifier.
    pub api_id: u32,
    /// Slot number.
    pub slot_number: u16,
    /// Subslot number.
    pub subslot_number: u16,
    /// Alarm type.
    pub alarm_type: u16,
    /// Specifier bits.
    pub specifier: pnet_types::blocks::alarm::AlarmSpecifier,
    /// 11-bit alarm sequence number.
    pub sequence_number: u16,
}

/// The application callback record, wired once at construction.
///
/// Every callback is optional; the stack tolerates `None` and applies its
/// default behavior (approve for vetoing callbacks, not-supported status
/// for record access).
#[allow(clippy::type_complexity)]
#[derive(Default)]
pub struct Callbacks {
    /// A controller connected; may veto.
    pub connect: Option<Box<dyn FnMut(Arep) -> CallbackResult + Send>>,
    /// A controller released the AR.
    pub release: Option<Box<dyn FnMut(Arep) -> CallbackResult + Send>>,
    /// DControl (PrmEnd) received; may veto.
    pub dcontrol: Option<Box<dyn FnMut(Arep, u16) -> CallbackResult + Send>>,
    /// CControl confirmation (response to Application Ready).
    pub ccontrol: Option<Box<dyn FnMut(Arep, PnioStatus) + Send>>,
    /// AR state change.
    pub state: Option<Box<dyn FnMut(Arep, CmdevEvent) + Send>>,
    /// Read an application record. Returns the record data.
    pub read: Option<
        Box<dyn FnMut(Arep, u32, u16, u16, u16) -> Result<Vec<u8>, StackError> + Send>,
    >,
    /// Write an application record.
    pub write: Option<
        Box<dyn FnMut(Arep, u32, u16, u16, u16, &[u8]) -> CallbackResult + Send>,
    >,
    /// Incoming alarm notification; answer with `alarm_send_ack`.
    pub alarm_ind: Option<Box<dyn FnMut(Arep, &AlarmArgument, u16, &[u8]) + Send>>,
    /// The controller acknowledged our alarm.
    pub alarm_cnf: Option<Box<dyn FnMut(Arep, PnioStatus) + Send>>,
    /// Our alarm ack reached the controller.
    pub alarm_ack_cnf: Option<Box<dyn FnMut(Arep, bool) + Send>>,
    /// Cyclic data status changed.
    pub new_data_status: Option<Box<dyn FnMut(Arep, u32, u8, u8) + Send>>,
    /// An expected module is not plugged; approve to auto-plug it.
    pub exp_module: Option<Box<dyn FnMut(u32, u16, u32) -> CallbackResult + Send>>,
    /// An expected submodule is not plugged; approve to auto-plug it.
    pub exp_submodule: Option<Box<dyn FnMut(u32, u16, u16, u32, u32) -> CallbackResult + Send>>,
    /// Factory reset requested.
    pub reset: Option<Box<dyn FnMut(bool, u16) + Send>>,
    /// Signal-LED state change.
    pub signal_led: Option<Box<dyn FnMut(bool) + Send>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("connect", &self.connect.is_some())
            .field("release", &self.release.is_some())
            .field("dcontrol", &self.dcontrol.is_some())
            .field("state", &self.state.is_some())
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("alarm_ind", &self.alarm_ind.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_bounds() {
        let mut cfg = PnetCfg::default();
        cfg.min_device_interval = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadMinDeviceInterval(0))
        ));
        cfg.min_device_interval = 4096;
        assert!(cfg.validate().is_ok());
        cfg.min_device_interval = 4097;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn im_mask_must_stay_in_window() {
        let mut cfg = PnetCfg::default();
        cfg.im_0_data.im_supported = im_supported::IM1 | im_supported::IM4;
        assert!(cfg.validate().is_ok());
        cfg.im_0_data.im_supported |= 1 << 5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadImSupportedMask(_))
        ));
    }

    #[test]
    fn identity_yaml_round_trip() {
        let identity = DeviceIdentity {
            station_name: "dev-1".into(),
            product_name: "demo device".into(),
            order_id: "DEV-0001".into(),
            serial_number: "00042".into(),
            vendor_id_hi: 0x01,
            vendor_id_lo: 0x41,
        };
        let yaml = identity.to_yaml();
        assert_eq!(identity, DeviceIdentity::from_yaml(&yaml).unwrap());
    }
}
