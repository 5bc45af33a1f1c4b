// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The PNIO status quadruple and the ERRCLS / ERRCODE taxonomy.
//!
//! Every failure a controller can observe is expressed as the four bytes
//! `(error_code, error_decode, error_code_1, error_code_2)`. The same four
//! bytes ride on negative responses, RTA ERR frames and log book entries.
//! [`StackError`] is the in-process form, adding the two AdditionalValue
//! words of record responses.

use thiserror::Error;

use crate::{BlockReader, BlockWriter, WriteError};

/// PNIO status as carried on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PnioStatus {
    /// ErrorCode: the failing service.
    pub error_code: u8,
    /// ErrorDecode: which coding the two remaining bytes use.
    pub error_decode: u8,
    /// ErrorCode1: ERRCLS, or the faulty-block selector for connect errors.
    pub error_code_1: u8,
    /// ErrorCode2: ERRCODE, or the faulty-field index within the block.
    pub error_code_2: u8,
}

impl PnioStatus {
    /// All-zero status: success.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Build an error status.
    pub fn new(error_code: u8, error_decode: u8, error_code_1: u8, error_code_2: u8) -> Self {
        Self {
            error_code,
            error_decode,
            error_code_1,
            error_code_2,
        }
    }

    /// True if all four bytes are zero.
    pub fn is_ok(&self) -> bool {
        *self == Self::default()
    }

    /// Read four bytes.
    pub fn decode(r: &mut BlockReader) -> Self {
        Self {
            error_code: r.get_u8(),
            error_decode: r.get_u8(),
            error_code_1: r.get_u8(),
            error_code_2: r.get_u8(),
        }
    }

    /// Write four bytes.
    pub fn encode(&self, w: &mut BlockWriter) -> Result<(), WriteError> {
        w.put_u8(self.error_code)?;
        w.put_u8(self.error_decode)?;
        w.put_u8(self.error_code_1)?;
        w.put_u8(self.error_code_2)
    }
}

/// Structured stack error: a PNIO status plus the two AdditionalValue words
/// used by record responses. Replaces out-parameter error reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error(
    "pnio status {:#04x}/{:#04x}/{:#04x}/{:#04x} (add {}, {})",
    .pnio_status.error_code,
    .pnio_status.error_decode,
    .pnio_status.error_code_1,
    .pnio_status.error_code_2,
    .add_data_1,
    .add_data_2
)]
pub struct StackError {
    /// The wire-visible status.
    pub pnio_status: PnioStatus,
    /// AdditionalValue1.
    pub add_data_1: u16,
    /// AdditionalValue2.
    pub add_data_2: u16,
}

impl StackError {
    /// Build an error with zero additional values.
    pub fn new(error_code: u8, error_decode: u8, error_code_1: u8, error_code_2: u8) -> Self {
        Self {
            pnio_status: PnioStatus::new(error_code, error_decode, error_code_1, error_code_2),
            add_data_1: 0,
            add_data_2: 0,
        }
    }

    /// A connect rejection pointing at a faulty block / field pair.
    pub fn connect_faulty(error_code_1: u8, error_code_2: u8) -> Self {
        Self::new(
            error_code::CONNECT,
            error_decode::PNIO,
            error_code_1,
            error_code_2,
        )
    }

    /// A PNIORW access error for record reads.
    pub fn read_access(error_code_1: u8) -> Self {
        Self::new(error_code::READ, error_decode::PNIORW, error_code_1, 0)
    }

    /// A PNIORW access error for record writes.
    pub fn write_access(error_code_1: u8) -> Self {
        Self::new(error_code::WRITE, error_decode::PNIORW, error_code_1, 0)
    }
}

/// ErrorCode values (the failing service).
pub mod error_code {
    /// No error.
    pub const NOERROR: u8 = 0x00;
    /// PNIO generic.
    pub const PNIO: u8 = 0x81;
    /// RTA error (alarm ERR frames).
    pub const RTA_ERROR: u8 = 0xCF;
    /// Alarm ack service.
    pub const ALARM_ACK: u8 = 0xDA;
    /// Connect service.
    pub const CONNECT: u8 = 0xDB;
    /// Release service.
    pub const RELEASE: u8 = 0xDC;
    /// Control service.
    pub const CONTROL: u8 = 0xDD;
    /// Record read service.
    pub const READ: u8 = 0xDE;
    /// Record write service.
    pub const WRITE: u8 = 0xDF;
}

/// ErrorDecode values.
pub mod error_decode {
    /// No error.
    pub const NOERROR: u8 = 0x00;
    /// ErrorCode1/2 use the PNIORW (record access) coding.
    pub const PNIORW: u8 = 0x80;
    /// ErrorCode1/2 use the PNIO coding.
    pub const PNIO: u8 = 0x81;
}

/// ErrorCode1 values.
pub mod error_code_1 {
    /// Faulty ARBlockReq; ErrorCode2 selects the field.
    pub const CONN_FAULTY_AR_BLOCK_REQ: u8 = 0x01;
    /// Faulty IOCRBlockReq.
    pub const CONN_FAULTY_IOCR_BLOCK_REQ: u8 = 0x02;
    /// Faulty ExpectedSubmoduleBlockReq.
    pub const CONN_FAULTY_EXP_BLOCK_REQ: u8 = 0x03;
    /// Faulty AlarmCRBlockReq.
    pub const CONN_FAULTY_ALARM_BLOCK_REQ: u8 = 0x04;
    /// Faulty ARRPCBlockReq.
    pub const CONN_FAULTY_AR_RPC_BLOCK_REQ: u8 = 0x07;
    /// Faulty record (IODWrite during connect).
    pub const CONN_FAULTY_FAULTY_RECORD: u8 = 0x08;

    /// CMDEV state machine.
    pub const CMDEV: u8 = 0x3D;
    /// CMCTL.
    pub const CMCTL: u8 = 0x3E;
    /// CMRPC / NRPM.
    pub const CMRPC: u8 = 0x3F;
    /// ALPMI.
    pub const ALPMI: u8 = 0x41;
    /// ALPMR.
    pub const ALPMR: u8 = 0x42;
    /// APMR.
    pub const APMR: u8 = 0x46;
    /// APMS.
    pub const APMS: u8 = 0x47;

    /// RTA protocol-class error (ERRCLS on alarm ERR frames).
    pub const RTA_ERR_CLS_PROTOCOL: u8 = 0xFD;

    // PNIORW application errors.
    /// Application read error.
    pub const APP_READ_ERROR: u8 = 0xA0;
    /// Application write error.
    pub const APP_WRITE_ERROR: u8 = 0xA1;
    /// Feature not supported by the application.
    pub const APP_NOT_SUPPORTED: u8 = 0xA9;

    // PNIORW access errors.
    /// Invalid index.
    pub const ACC_INVALID_INDEX: u8 = 0xB0;
    /// Write length error.
    pub const ACC_WRITE_LENGTH_ERROR: u8 = 0xB1;
    /// Invalid slot/subslot.
    pub const ACC_INVALID_SLOT_SUBSLOT: u8 = 0xB2;
    /// Invalid area / API.
    pub const ACC_INVALID_AREA_API: u8 = 0xB4;
    /// State conflict.
    pub const ACC_STATE_CONFLICT: u8 = 0xB5;
    /// Access denied.
    pub const ACC_ACCESS_DENIED: u8 = 0xB6;
    /// Backup AR: the write must go to the primary.
    pub const ACC_BACKUP: u8 = 0xBA;
}

/// ErrorCode2 values for ErrorCode1 = CMRPC.
pub mod error_code_2_cmrpc {
    /// Wrong number of blocks in the request.
    pub const WRONG_BLOCK_COUNT: u8 = 0x01;
    /// Unknown block type in the request.
    pub const UNKNOWN_BLOCKS: u8 = 0x02;
    /// Input or output CR missing.
    pub const IOCR_MISSING: u8 = 0x03;
    /// Out of AR resources.
    pub const OUT_OF_AR_RESOURCES: u8 = 0x05;
    /// AR UUID not known to the device.
    pub const AR_UUID_UNKNOWN: u8 = 0x06;
    /// Out of memory / provider-consumer resources.
    pub const OUT_OF_MEMORY: u8 = 0x08;
    /// Request in wrong session state.
    pub const STATE_CONFLICT: u8 = 0x0B;
    /// The physical device is already owned by another AR.
    pub const PDEV_ALREADY_OWNED: u8 = 0x0C;
}

/// ErrorCode2 abort codes for ErrorCode1 = RTA_ERR_CLS_PROTOCOL, plus the
/// per-machine codes surfaced when an alarm machine fails.
pub mod error_code_2_abort {
    /// AR consumer data-hold timer expired.
    pub const AR_CONSUMER_DHT_EXPIRED: u8 = 0x01;
    /// CM initiator activity timeout.
    pub const AR_CMI_TIMEOUT: u8 = 0x02;
    /// Alarm channel open failed.
    pub const AR_ALARM_OPEN_FAILED: u8 = 0x03;
    /// Negative confirmation while sending an alarm (retries exhausted).
    pub const AR_ALARM_SEND_CNF_NEG: u8 = 0x04;
    /// Negative confirmation while sending an alarm acknowledge.
    pub const AR_ALARM_ACK_SEND_CNF_NEG: u8 = 0x05;
    /// Error while handling an incoming alarm.
    pub const AR_ALARM_IND_ERROR: u8 = 0x06;
    /// Release indication received.
    pub const AR_RELEASE_IND_RECEIVED: u8 = 0x0B;
    /// Wrong send sequence number on the alarm channel.
    pub const CODE_SEQ: u8 = 0x11;
    /// Protocol violation on the alarm channel.
    pub const AR_PROTOCOL_VIOLATION: u8 = 0x13;
    /// No Ethernet port with the required speed.
    pub const PDEV_CHECK_FAILED: u8 = 0x18;
}

/// ErrorCode2 values for the alarm protocol machines.
pub mod error_code_2_alarm {
    /// ALPMI invoked in the wrong state.
    pub const ALPMI_WRONG_STATE: u8 = 0x01;
    /// ALPMI invalid parameter / negative send confirmation.
    pub const ALPMI_INVALID: u8 = 0x02;
    /// ALPMR invoked in the wrong state.
    pub const ALPMR_WRONG_STATE: u8 = 0x01;
    /// ALPMR invalid parameter / negative send confirmation.
    pub const ALPMR_INVALID: u8 = 0x02;
    /// APMS activated in an invalid state.
    pub const APMS_INVALID_STATE: u8 = 0x01;
    /// APMR activated in an invalid state.
    pub const APMR_INVALID_STATE: u8 = 0x01;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockWriter;

    #[test]
    fn pnio_status_round_trip() {
        let status = PnioStatus::new(
            error_code::CONNECT,
            error_decode::PNIO,
            error_code_1::CONN_FAULTY_IOCR_BLOCK_REQ,
            24,
        );
        let mut w = BlockWriter::new(8);
        status.encode(&mut w).unwrap();
        let bytes = w.into_vec();
        assert_eq!(&[0xDB, 0x81, 0x02, 24], bytes.as_slice());
        let mut r = BlockReader::new(&bytes);
        assert_eq!(status, PnioStatus::decode(&mut r));
        assert!(r.result().is_ok());
    }

    #[test]
    fn ok_status_is_all_zero() {
        assert!(PnioStatus::ok().is_ok());
        assert!(!PnioStatus::new(0xDE, 0x80, 0xB0, 0).is_ok());
    }
}
