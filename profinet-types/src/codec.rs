// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The block reader and writer cursors.
//!
//! The reader latches the first error it encounters: every later read
//! returns a default value without advancing, and the outcome is inspected
//! once at the end of a parse with [`BlockReader::result`]. This mirrors
//! how the block parsers are composed: a dozen field reads in a row and a
//! single check afterwards.
//!
//! The writer is bounds-checked against a caller-supplied limit. Variable
//! length blocks are emitted in two passes: [`BlockWriter::reserve_u16`]
//! hands out a typed [`LenSlot`] for the length field, the body is written,
//! and the slot is patched. A slot is the only way to rewind past committed
//! bytes.

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use log::{debug, error};
use thiserror::Error;

use crate::PnetUuid;

/// Outcome of a parse. The first failure is latched in the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A read ran past the end of the input buffer.
    #[error("unexpected end of input data")]
    EndOfInput,
    /// The cursor was constructed without a backing buffer.
    #[error("no input buffer")]
    NullBuffer,
    /// An expected-ident block referenced more APIs than the device supports.
    #[error("out of expected API resources")]
    OutOfApiResources,
    /// An expected-ident block referenced more modules than the device supports.
    #[error("out of expected submodule resources")]
    OutOfExpSubmoduleResources,
}

/// Failure while emitting a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The output buffer limit would be exceeded.
    #[error("output buffer full: need {needed} bytes, limit is {limit}")]
    BufferFull {
        /// Bytes the write would have needed.
        needed: usize,
        /// The buffer limit.
        limit: usize,
    },
}

/// Extract `len` bits starting at bit `pos` from `bits`, shifted down to
/// bit 0.
///
/// A zero `len` acts as a skip and yields 0. Illegal combinations
/// (`pos + len > 32`) yield 0. `len == 32` at `pos == 0` returns the word
/// unchanged.
pub fn get_bits(bits: u32, pos: u8, len: u8) -> u32 {
    if len == 0 {
        0
    } else if pos as u32 + len as u32 > 32 {
        error!("get_bits: pos {} + len {} > 32", pos, len);
        0
    } else if pos == 0 && len == 32 {
        bits
    } else {
        (bits >> pos) & ((1u32 << len) - 1)
    }
}

/// Insert `len` bits of `value` at bit `pos`. The inverse of [`get_bits`],
/// used by the writers when packing property words.
pub fn set_bits(word: u32, value: u32, pos: u8, len: u8) -> u32 {
    if len == 0 || pos as u32 + len as u32 > 32 {
        return word;
    }
    let mask = if len == 32 {
        u32::MAX
    } else {
        ((1u32 << len) - 1) << pos
    };
    (word & !mask) | ((value << pos) & mask)
}

/// Parser state over a borrowed buffer.
pub struct BlockReader<'a> {
    buf: Option<&'a [u8]>,
    len: usize,
    pos: usize,
    big_endian: bool,
    err: Option<ParseError>,
}

impl<'a> BlockReader<'a> {
    /// A big-endian reader over `buf`. All PROFINET block payloads are
    /// big-endian on the wire.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf: Some(buf),
            len: buf.len(),
            pos: 0,
            big_endian: true,
            err: None,
        }
    }

    /// A reader with no backing buffer. Every read fails with
    /// [`ParseError::NullBuffer`].
    pub fn detached(len: usize) -> Self {
        Self {
            buf: None,
            len,
            pos: 0,
            big_endian: true,
            err: None,
        }
    }

    /// Switch the integer representation. DCE/RPC headers carry their own
    /// endianness flag; everything downstream of the header follows it.
    pub fn set_big_endian(&mut self, big_endian: bool) {
        self.big_endian = big_endian;
    }

    /// Whether multi-byte integers are currently read big-endian.
    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Current read position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left before the end of input.
    pub fn remaining(&self) -> usize {
        self.len.saturating_sub(self.pos)
    }

    /// The latched outcome of all reads so far.
    pub fn result(&self) -> Result<(), ParseError> {
        match self.err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Latch an error. Keeps the first one.
    pub fn fail(&mut self, err: ParseError) {
        if self.err.is_none() {
            debug!("block reader: latched {} at position {}", err, self.pos);
            self.err = Some(err);
        }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.err.is_some() {
            return None;
        }
        if self.pos + n > self.len {
            self.fail(ParseError::EndOfInput);
            return None;
        }
        let Some(buf) = self.buf else {
            self.fail(ParseError::NullBuffer);
            return None;
        };
        let slice = &buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Read one byte.
    pub fn get_u8(&mut self) -> u8 {
        self.take(1).map(|s| s[0]).unwrap_or(0)
    }

    /// Read a 16-bit integer in the current endianness.
    pub fn get_u16(&mut self) -> u16 {
        let big_endian = self.big_endian;
        self.take(2)
            .map(|s| {
                if big_endian {
                    BigEndian::read_u16(s)
                } else {
                    LittleEndian::read_u16(s)
                }
            })
            .unwrap_or(0)
    }

    /// Read a 32-bit integer in the current endianness.
    pub fn get_u32(&mut self) -> u32 {
        let big_endian = self.big_endian;
        self.take(4)
            .map(|s| {
                if big_endian {
                    BigEndian::read_u32(s)
                } else {
                    LittleEndian::read_u32(s)
                }
            })
            .unwrap_or(0)
    }

    /// Copy `dest.len()` bytes out of the buffer.
    pub fn get_mem(&mut self, dest: &mut [u8]) {
        let n = dest.len();
        if let Some(s) = self.take(n) {
            dest.copy_from_slice(s);
        } else {
            dest.fill(0);
        }
    }

    /// Read a fixed-size byte array.
    pub fn get_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        self.get_mem(&mut out);
        out
    }

    /// Skip `n` bytes (padding and reserved fields).
    pub fn skip(&mut self, n: usize) {
        let _ = self.take(n);
    }

    /// Read `wire_len` bytes as a string, clamped to `capacity` bytes.
    ///
    /// Input longer than the capacity is consumed but truncated, matching
    /// the fixed destination buffers of the wire format. Non-UTF8 input is
    /// replaced lossily.
    pub fn get_string(&mut self, wire_len: usize, capacity: usize) -> String {
        let keep = wire_len.min(capacity);
        let mut out = vec![0u8; keep];
        self.get_mem(&mut out);
        if wire_len > keep {
            self.skip(wire_len - keep);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Read a UUID with DCE field ordering (u32, u16, u16, 8 bytes).
    ///
    /// The three integer fields follow the current endianness; the trailing
    /// bytes do not.
    pub fn get_uuid(&mut self) -> PnetUuid {
        let data1 = self.get_u32();
        let data2 = self.get_u16();
        let data3 = self.get_u16();
        let data4 = self.get_array::<8>();
        PnetUuid::from_fields(data1, data2, data3, data4)
    }

    /// The unread remainder of the buffer. Payload tails (alarm USI data,
    /// record data) are handed on as raw slices.
    pub fn tail(&self) -> &'a [u8] {
        match self.buf {
            Some(buf) if self.err.is_none() && self.pos <= buf.len() => &buf[self.pos..],
            _ => &[],
        }
    }
}

/// A reserved 16-bit length field, produced by [`BlockWriter::reserve_u16`]
/// and consumed exactly once by a patch call.
#[must_use = "a reserved length slot must be patched"]
pub struct LenSlot(usize);

/// Emitter state with a hard upper bound on the output size.
pub struct BlockWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl BlockWriter {
    /// A writer that refuses to grow beyond `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(1500)),
            limit,
        }
    }

    /// Current write position.
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// The emitted bytes so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer, returning the emitted frame.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn ensure(&mut self, n: usize) -> Result<(), WriteError> {
        let needed = self.buf.len() + n;
        if needed > self.limit {
            return Err(WriteError::BufferFull {
                needed,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Append one byte.
    pub fn put_u8(&mut self, value: u8) -> Result<(), WriteError> {
        self.ensure(1)?;
        self.buf.push(value);
        Ok(())
    }

    /// Append a big-endian 16-bit integer.
    pub fn put_u16(&mut self, value: u16) -> Result<(), WriteError> {
        self.ensure(2)?;
        self.buf.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Append a big-endian 32-bit integer.
    pub fn put_u32(&mut self, value: u32) -> Result<(), WriteError> {
        self.ensure(4)?;
        self.buf.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Append raw bytes.
    pub fn put_mem(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        self.ensure(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Append `n` bytes of the given fill value.
    pub fn put_fill(&mut self, value: u8, n: usize) -> Result<(), WriteError> {
        self.ensure(n)?;
        self.buf.resize(self.buf.len() + n, value);
        Ok(())
    }

    /// Append zero padding.
    pub fn put_padding(&mut self, n: usize) -> Result<(), WriteError> {
        self.put_fill(0, n)
    }

    /// Append a string as raw bytes, truncated or space-padded to
    /// `wire_len`.
    pub fn put_fixed_string(&mut self, s: &str, wire_len: usize) -> Result<(), WriteError> {
        let bytes = s.as_bytes();
        let keep = bytes.len().min(wire_len);
        self.put_mem(&bytes[..keep])?;
        self.put_fill(b' ', wire_len - keep)
    }

    /// Append a UUID with DCE field ordering, big-endian integer fields.
    pub fn put_uuid(&mut self, uuid: &PnetUuid) -> Result<(), WriteError> {
        let (data1, data2, data3, data4) = uuid.as_fields();
        self.put_u32(data1)?;
        self.put_u16(data2)?;
        self.put_u16(data3)?;
        self.put_mem(&data4)
    }

    /// Reserve a 16-bit field to be patched later.
    pub fn reserve_u16(&mut self) -> Result<LenSlot, WriteError> {
        let at = self.buf.len();
        self.put_u16(0)?;
        Ok(LenSlot(at))
    }

    /// Patch a reserved field with an explicit value.
    pub fn patch_u16(&mut self, slot: LenSlot, value: u16) {
        BigEndian::write_u16(&mut self.buf[slot.0..slot.0 + 2], value);
    }

    /// Patch a reserved field with the number of bytes written since it.
    /// This is the VarPartLen / BlockLength pattern: the count starts just
    /// after the length field itself.
    pub fn patch_u16_len(&mut self, slot: LenSlot) {
        let len = (self.buf.len() - (slot.0 + 2)) as u16;
        BigEndian::write_u16(&mut self.buf[slot.0..slot.0 + 2], len);
    }
}

/// Decode helper used by tests and by the RPC layer when peeking at
/// little-endian NDR words inside an already-buffered body.
pub fn read_u32_at(buf: &[u8], pos: usize, big_endian: bool) -> u32 {
    let mut cursor = Cursor::new(&buf[pos..]);
    if big_endian {
        cursor.read_u32::<BigEndian>().unwrap_or(0)
    } else {
        cursor.read_u32::<LittleEndian>().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_bits_extracts_expected_ranges() {
        // 11111111 11111111 11111111 11111111
        assert_eq!(0x0000_0000, get_bits(0xFFFF_FFFF, 0, 0));
        assert_eq!(0x0000_0001, get_bits(0xFFFF_FFFF, 0, 1));
        assert_eq!(0x0000_00FF, get_bits(0xFFFF_FFFF, 0, 8));
        assert_eq!(0x7FFF_FFFF, get_bits(0xFFFF_FFFF, 0, 31));
        assert_eq!(0xFFFF_FFFF, get_bits(0xFFFF_FFFF, 0, 32));
        assert_eq!(0, get_bits(0xFFFF_FFFF, 0, 33));

        assert_eq!(0x0000_0001, get_bits(0xFFFF_FFFF, 31, 1));
        assert_eq!(0, get_bits(0xFFFF_FFFF, 31, 2));
        assert_eq!(0, get_bits(0xFFFF_FFFF, 1, 32));
        assert_eq!(0, get_bits(0xFFFF_FFFF, 32, 1));
        assert_eq!(0, get_bits(0xFFFF_FFFF, 0xFF, 0xFF));

        // 00000000 00000000 00000000 00010000
        assert_eq!(0x0000_0000, get_bits(0x0000_0010, 0, 3));
        assert_eq!(0x0000_0004, get_bits(0x0000_0010, 2, 3));
        assert_eq!(0x0000_0002, get_bits(0x0000_0010, 3, 3));
        assert_eq!(0x0000_0001, get_bits(0x0000_0010, 4, 3));
        assert_eq!(0x0000_0000, get_bits(0x0000_0010, 5, 3));

        // 10000000 00000000 00000000 00000000
        assert_eq!(0x0000_0004, get_bits(0x8000_0000, 29, 3));
        assert_eq!(0, get_bits(0x8000_0000, 30, 3));
    }

    #[test]
    fn set_bits_round_trips_with_get_bits() {
        let word = set_bits(0, 0b101, 13, 3);
        assert_eq!(0b101, get_bits(word, 13, 3));
        assert_eq!(0, get_bits(word, 0, 13));
        let word = set_bits(word, 0x3F, 0, 6);
        assert_eq!(0x3F, get_bits(word, 0, 6));
        assert_eq!(0b101, get_bits(word, 13, 3));
    }

    #[test]
    fn reader_latches_first_error() {
        let mut r = BlockReader::new(&[0x12, 0x34, 0x56]);
        assert_eq!(0x1234, r.get_u16());
        // Runs past the end: returns 0 and latches the error.
        assert_eq!(0, r.get_u32());
        // Further reads are suppressed even though a byte remains.
        assert_eq!(0, r.get_u8());
        assert_eq!(Err(ParseError::EndOfInput), r.result());
        assert_eq!(2, r.pos());
    }

    #[test]
    fn reader_without_buffer_reports_null() {
        let mut r = BlockReader::detached(16);
        assert_eq!(0, r.get_u16());
        assert_eq!(Err(ParseError::NullBuffer), r.result());
    }

    #[test]
    fn reader_endianness_switch() {
        let mut r = BlockReader::new(&[0x01, 0x02, 0x01, 0x02]);
        assert_eq!(0x0102, r.get_u16());
        r.set_big_endian(false);
        assert_eq!(0x0201, r.get_u16());
        assert!(r.result().is_ok());
    }

    #[test]
    fn string_clamped_to_capacity_and_consumed() {
        let mut r = BlockReader::new(b"stationname-too-long\x01\x02");
        let s = r.get_string(20, 7);
        assert_eq!("station", s);
        // The full wire length was consumed.
        assert_eq!(0x0102, r.get_u16());
        assert!(r.result().is_ok());
    }

    #[test]
    fn writer_respects_limit() {
        let mut w = BlockWriter::new(4);
        w.put_u16(0xAABB).unwrap();
        w.put_u8(0xCC).unwrap();
        assert_eq!(
            Err(WriteError::BufferFull {
                needed: 5,
                limit: 4
            }),
            w.put_u16(0xDDEE)
        );
        assert_eq!(&[0xAA, 0xBB, 0xCC], w.as_slice());
    }

    #[test]
    fn length_slot_backpatches_var_part() {
        let mut w = BlockWriter::new(64);
        w.put_u16(0x1234).unwrap();
        let slot = w.reserve_u16().unwrap();
        w.put_u32(0xDEADBEEF).unwrap();
        w.put_u8(0x55).unwrap();
        w.patch_u16_len(slot);
        assert_eq!(&[0x12, 0x34, 0x00, 0x05, 0xDE, 0xAD, 0xBE, 0xEF, 0x55], w.as_slice());
    }

    #[test]
    fn uuid_round_trip() {
        let uuid = PnetUuid::from_fields(
            0xDEA0_0000,
            0x6C97,
            0x11D1,
            [0x82, 0x71, 0x00, 0xA0, 0x24, 0x42, 0xDF, 0x7D],
        );
        let mut w = BlockWriter::new(16);
        w.put_uuid(&uuid).unwrap();
        let bytes = w.into_vec();
        let mut r = BlockReader::new(&bytes);
        assert_eq!(uuid, r.get_uuid());
        assert!(r.result().is_ok());
    }
}
