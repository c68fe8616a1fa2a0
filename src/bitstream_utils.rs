// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io::Cursor;
#[cfg(test)]
use std::io::Write;
use std::marker::PhantomData;

use anyhow::anyhow;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use bytes::Buf;
use thiserror::Error;

/// Size of the big-endian length field preceding every unit of an access unit.
pub const UNIT_LENGTH_SIZE: usize = 4;

/// A bit reader for H.264/H.265 RBSPs. It properly handles emulation-prevention
/// bytes and stop bits.
#[derive(Clone)]
pub(crate) struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in epb detection.
    prev_two_bytes: u32,
    /// Number of epbs (i.e. 0x000003) we found.
    num_epb: usize,
}

#[derive(Debug, Error)]
pub(crate) enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error)]
pub(crate) enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        self.data.chunk().iter().any(|b| *b != 0)
    }

    /// Reads an unsigned Exp-Golomb coded number. This may advance the
    /// position within the bitstream even if the read fails.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut num_bits = 0;

        while self.read_bits::<u32>(1)? == 0 {
            num_bits += 1;
            if num_bits > 31 {
                return Err(anyhow!("Invalid stream"));
            }
        }

        let value = ((1u32 << num_bits) - 1)
            .checked_add(self.read_bits::<u32>(num_bits)?)
            .ok_or_else(|| anyhow!("Exp-Golomb value does not fit in 32 bits"))?;

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue()?;
        if ue > max || ue < min {
            Err(anyhow!(
                "Value out of bounds: expected {} - {}, got {}",
                min,
                max,
                ue
            ))
        } else {
            Ok(U::try_from(ue).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb coded number. Odd code numbers map to
    /// positive values and even ones to negative values.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> anyhow::Result<U> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let value = if ue % 2 == 0 { -(ue / 2) } else { ue / 2 + 1 };

        i32::try_from(value)
            .ok()
            .and_then(|v| U::try_from(v).ok())
            .ok_or_else(|| anyhow!("Conversion error"))
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> anyhow::Result<U> {
        let se = self.read_se()?;
        if se < min || se > max {
            Err(anyhow!(
                "Value out of bounds, expected between {}-{}, got {}",
                min,
                max,
                se
            ))
        } else {
            Ok(U::try_from(se).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    fn get_byte(&mut self) -> Result<u8, GetByteError> {
        if self.data.remaining() == 0 {
            return Err(GetByteError::OutOfBits);
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<(), GetByteError> {
        let mut byte = self.get_byte()?;

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // We found an epb
            self.num_epb += 1;
            // Read another byte
            byte = self.get_byte()?;
            // We need another 3 bytes before another epb can happen.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Writes RBSP syntax elements, inserting emulation-prevention bytes when
/// enabled so the output can be read back by the crate's bit reader.
#[cfg(test)]
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
    /// Emulation prevention enabled.
    ep_enabled: bool,
    /// Number of consecutive zero bytes written so far.
    zeros: usize,
}

#[cfg(test)]
impl<W: Write> BitWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self {
            out: writer,
            nth_bit: 0,
            curr_byte: 0,
            ep_enabled,
            zeros: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit). Corresponds to `f(n)` and `u(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1)?;
        }

        Ok(bits)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            let byte = self.curr_byte;
            self.nth_bit = 0;
            self.curr_byte = 0;
            self.emit_byte(byte)?;
        }

        Ok(())
    }

    /// Writes an unsigned integer in Exp-Golomb format. Corresponds to `ue(v)`.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> BitWriterResult<()> {
        let value = value
            .into()
            .checked_add(1)
            .ok_or(BitWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;

        self.write_f(bits - 1, 0u32)?;
        self.write_f(bits, value)?;

        Ok(())
    }

    /// Writes a signed integer in Exp-Golomb format. Corresponds to `se(v)`.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> BitWriterResult<()> {
        let value: i32 = value.into();
        let abs_value: u32 = value.unsigned_abs();

        if value <= 0 {
            self.write_ue(2 * abs_value)
        } else {
            self.write_ue(2 * abs_value - 1)
        }
    }

    /// Writes `rbsp_trailing_bits()`: a stop bit followed by zero bits up to
    /// the next byte boundary.
    pub fn write_trailing_bits(&mut self) -> BitWriterResult<()> {
        self.write_bit(true)?;
        while self.nth_bit != 0 {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            let byte = self.curr_byte;
            self.nth_bit = 0;
            self.curr_byte = 0;
            self.emit_byte(byte)?;
        }

        self.out.flush()?;
        Ok(())
    }

    fn emit_byte(&mut self, byte: u8) -> BitWriterResult<()> {
        if self.ep_enabled && self.zeros >= 2 && byte <= 0x03 {
            self.out.write_all(&[0x03])?;
            self.zeros = 0;
        }

        self.out.write_all(&[byte])?;
        self.zeros = if byte == 0 { self.zeros + 1 } else { 0 };

        Ok(())
    }
}

#[cfg(test)]
impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

/// Errors found while splitting an access unit into units.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedBitstream {
    #[error("truncated length prefix at offset {offset}")]
    TruncatedPrefix { offset: usize },
    #[error("unit at offset {offset} claims {claimed} bytes but only {remaining} remain")]
    LengthExceedsBuffer {
        offset: usize,
        claimed: usize,
        remaining: usize,
    },
    #[error("unit at offset {offset} is {size} bytes, shorter than its {header_len}-byte header")]
    ShorterThanHeader {
        offset: usize,
        size: usize,
        header_len: usize,
    },
    #[error("invalid unit header at offset {offset}")]
    InvalidHeader { offset: usize },
}

/// Header carried by the first bytes of every unit of a codec.
pub trait UnitHeader: Sized + Copy + fmt::Debug {
    /// Number of bytes taken by the header.
    const LEN: usize;

    /// Parses the header from the first [`Self::LEN`] bytes of `data`. Returns
    /// `None` if the header is invalid.
    fn parse(data: &[u8]) -> Option<Self>;
}

/// One unit of a length-prefixed access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit<'a, H> {
    pub header: H,
    /// Offset of the unit (past its length prefix) in the access unit.
    pub offset: usize,
    /// Size of the unit, header included.
    pub size: usize,
    /// The unit bytes, header included.
    pub data: &'a [u8],
}

impl<'a, H: UnitHeader> Unit<'a, H> {
    /// The unit payload, after the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[H::LEN..]
    }
}

/// Lazily splits an access unit framed with 4-byte big-endian length prefixes.
///
/// The scanner never modifies its input and can be cloned or restarted to
/// iterate again. Once it has returned an error it yields nothing else.
pub struct UnitScanner<'a, H> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
    _header: PhantomData<H>,
}

impl<'a, H> Clone for UnitScanner<'a, H> {
    fn clone(&self) -> Self {
        Self {
            data: self.data,
            pos: self.pos,
            failed: self.failed,
            _header: PhantomData,
        }
    }
}

impl<'a, H: UnitHeader> UnitScanner<'a, H> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
            _header: PhantomData,
        }
    }

    /// Rewinds the scanner to the start of the access unit.
    pub fn restart(&mut self) {
        self.pos = 0;
        self.failed = false;
    }

    fn next_unit(&mut self) -> Result<Unit<'a, H>, MalformedBitstream> {
        let offset = self.pos;
        let mut prefix = self
            .data
            .get(offset..offset + UNIT_LENGTH_SIZE)
            .ok_or(MalformedBitstream::TruncatedPrefix { offset })?;
        let claimed = prefix
            .read_u32::<BigEndian>()
            .map_err(|_| MalformedBitstream::TruncatedPrefix { offset })?
            as usize;

        let start = offset + UNIT_LENGTH_SIZE;
        let remaining = self.data.len() - start;
        if claimed > remaining {
            return Err(MalformedBitstream::LengthExceedsBuffer {
                offset,
                claimed,
                remaining,
            });
        }

        if claimed < H::LEN {
            return Err(MalformedBitstream::ShorterThanHeader {
                offset: start,
                size: claimed,
                header_len: H::LEN,
            });
        }

        let data = &self.data[start..start + claimed];
        let header = H::parse(data).ok_or(MalformedBitstream::InvalidHeader { offset: start })?;
        self.pos = start + claimed;

        Ok(Unit {
            header,
            offset: start,
            size: claimed,
            data,
        })
    }
}

impl<'a, H: UnitHeader> Iterator for UnitScanner<'a, H> {
    type Item = Result<Unit<'a, H>, MalformedBitstream>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }

        let unit = self.next_unit();
        if let Err(e) = &unit {
            log::warn!(
                "Skipping {} trailing bytes of the access unit: {}",
                self.data.len() - self.pos,
                e
            );
            self.failed = true;
        }

        Some(unit)
    }
}

/// Frames `units` with 4-byte big-endian length prefixes.
#[cfg(test)]
pub fn frame_units<'a>(units: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        out.extend_from_slice(unit);
    }

    out
}
