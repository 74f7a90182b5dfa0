// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use bytes::Buf;
use thiserror::Error;

/// A bit reader over the payload of a single NAL unit.
///
/// Emulation-prevention bytes (the `0x03` in a `0x00 0x00 0x03` sequence) are skipped
/// transparently and counted, so the bits returned are the RBSP bits. Exp-Golomb codes are
/// decoded by [`NaluReader::read_ue`] and [`NaluReader::read_se`].
pub(crate) struct NaluReader<'a> {
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
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("bitstream exhausted")]
    BitstreamExhausted(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("exp-golomb code longer than 32 bits")]
    InvalidExpGolomb,
    #[error("value {value} out of range [{min}, {max}]")]
    OutOfRange { value: i64, min: i64, max: i64 },
}

impl<'a> NaluReader<'a> {
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

    /// Read up to 32 bits from the stream, MSB first.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        if num_bits == 32 {
            let hi = self.read_bits::<u32>(16)?;
            let lo = self.read_bits::<u32>(16)?;
            return U::try_from((hi << 16) | lo).map_err(|_| ReadBitsError::ConversionFailed);
        }

        let mut bits_left = num_bits;
        let mut out = 0u32;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1u32 << num_bits) - 1;
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

    /// Returns the number of bits consumed so far, emulation-prevention bytes included.
    pub fn position(&self) -> usize {
        self.data.get_ref().len() * 8 - self.num_bits_left()
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the reader sits on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte % 8 == 0
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

        if self.data.chunk().iter().any(|&b| b != 0) {
            return true;
        }

        self.data.advance(self.data.remaining());
        false
    }

    /// Reads an unsigned Exp-Golomb code, `ue(v)`.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U, ReadBitsError> {
        let mut leading_zeros = 0;

        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 32 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        let value = match leading_zeros {
            0 => 0,
            // 2^32 - 1 is the only representable 32 zero code.
            32 => {
                if self.read_bits::<u32>(32)? != 0 {
                    return Err(ReadBitsError::InvalidExpGolomb);
                }
                u32::MAX
            }
            n => ((1u32 << n) - 1) + self.read_bits::<u32>(n)?,
        };

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(
        &mut self,
        min: u32,
        max: u32,
    ) -> Result<U, ReadBitsError> {
        let ue = self.read_ue::<u32>()?;
        if ue > max || ue < min {
            return Err(ReadBitsError::OutOfRange {
                value: i64::from(ue),
                min: i64::from(min),
                max: i64::from(max),
            });
        }

        U::try_from(ue).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> Result<U, ReadBitsError> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb code, `se(v)`. The code number k maps to
    /// (-1)^(k+1) * ceil(k / 2).
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U, ReadBitsError> {
        let k = i64::from(self.read_ue::<u32>()?);
        let value = if k % 2 == 0 { -(k / 2) } else { k / 2 + 1 };
        let value = i32::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)?;

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(
        &mut self,
        min: i32,
        max: i32,
    ) -> Result<U, ReadBitsError> {
        let se = self.read_se::<i32>()?;
        if se < min || se > max {
            return Err(ReadBitsError::OutOfRange {
                value: i64::from(se),
                min: i64::from(min),
                max: i64::from(max),
            });
        }

        U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
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
