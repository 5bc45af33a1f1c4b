// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Device-side PROFINET IO protocol state machines.
//!
//! The stack implements one device with a small fixed number of
//! Application Relations. All state is owned by a single [`Net`] value:
//!
//! * **CMRPC** parses DCE/RPC requests, reassembles fragments, routes
//!   Connect / Release / Read / Write / Control, answers retransmissions
//!   from a cached response, and drives the Application Ready exchange.
//! * **CMDEV** validates connects (APDUCheck), computes the per-IOCR byte
//!   layout, fixes up FrameIDs, generates the module diff, and walks the
//!   AR through parameterisation to cyclic data.
//! * The **alarm subsystem** runs two priorities of acknowledged alarm
//!   transport with retransmission and 15-bit sequence tracking.
//! * **CMWRR** routes IODWrite records to the application, the I&M
//!   window and the PDPort check/adjust handlers.
//! * **FSPM** owns the configuration, the application callbacks, the
//!   persisted I&M records and the log book.
//! * **PDPort** persists the expected-peer check and raises a
//!   remote-mismatch diagnosis against the observed LLDP neighbour.
//!
//! The host wires Ethernet and RPC transports plus a time source at
//! construction and calls [`Net::handle_periodic`] at the device
//! interval; receive paths hand frames in through
//! [`Net::handle_alarm_frame`] / [`Net::post_rpc_packet`]. No call into
//! the stack blocks.

mod api;
pub mod alarm;
pub mod ar;
pub mod cmdev;
pub mod cmrpc;
pub mod cmwrr;
pub mod config;
pub mod dev;
pub mod diag;
pub mod fspm;
pub mod net;
pub mod pdport;

#[cfg(test)]
mod tests;

pub use ar::{Ar, Arep, MAX_ARS};
pub use cmdev::{CmdevEvent, CmdevState};
pub use config::{AlarmArgument, Callbacks, ConfigError, DeviceIdentity, PnetCfg};
pub use diag::StdDiagnosis;
pub use net::Net;
