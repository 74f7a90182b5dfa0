// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::io::Cursor;

use anyhow::anyhow;
use bytes::Bytes;
use bytes::BytesMut;
use log::debug;
use log::trace;
use thiserror::Error;

use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::NaluType;

/// Largest NAL unit the extractor will buffer.
pub const NALU_BUF_MAX_SIZE: usize = 10 * 1024 * 1024;
/// Growth increment of the extractor buffer.
pub const NALU_BUF_ADD_SIZE: usize = 1024;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// The `nal_unit_header_mvc_extension()` carried by prefix (14) and slice
/// extension (20) NAL units. See H.7.3.1.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MvcExtension {
    pub non_idr_flag: bool,
    pub priority_id: u8,
    pub view_id: u16,
    pub temporal_id: u8,
    pub anchor_pic_flag: bool,
    pub inter_view_flag: bool,
    pub reserved_one_bit: bool,
    /// Whether this extension came from a prefix NAL unit rather than from the
    /// unit itself.
    pub from_prefix: bool,
}

impl MvcExtension {
    fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut r = NaluReader::new(bytes);

        let svc_extension_flag = r.read_bit()?;
        if svc_extension_flag {
            return Err(anyhow!("SVC NAL unit extensions are not supported"));
        }

        Ok(MvcExtension {
            non_idr_flag: r.read_bit()?,
            priority_id: r.read_bits(6)?,
            view_id: r.read_bits(10)?,
            temporal_id: r.read_bits(3)?,
            anchor_pic_flag: r.read_bit()?,
            inter_view_flag: r.read_bit()?,
            reserved_one_bit: r.read_bit()?,
            from_prefix: false,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
    /// MVC fields, either from the unit's own extension header or from the
    /// prefix unit that preceded it.
    pub mvc: Option<MvcExtension>,
}

impl NaluHeader {
    /// Parses the NAL unit header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, NaluError> {
        let byte = *data.first().ok_or(NaluError::Empty)?;

        if byte & 0x80 != 0 {
            return Err(NaluError::ForbiddenBit);
        }

        let raw_type = byte & 0x1f;
        let type_ = NaluType::n(raw_type).ok_or(NaluError::Unsupported(raw_type))?;
        let ref_idc = (byte & 0x60) >> 5;

        let mvc = match type_ {
            NaluType::PrefixUnit | NaluType::SliceExt => {
                let ext = data
                    .get(1..4)
                    .ok_or(NaluError::Truncated)
                    .and_then(|ext| {
                        MvcExtension::parse(ext).map_err(|_| NaluError::Unsupported(raw_type))
                    })?;
                Some(ext)
            }
            _ => None,
        };

        let idr_pic_flag = match (type_, &mvc) {
            (NaluType::SliceIdr, _) => true,
            (NaluType::SliceExt, Some(ext)) => !ext.non_idr_flag,
            _ => false,
        };

        Ok(NaluHeader {
            ref_idc,
            type_,
            idr_pic_flag,
            mvc,
        })
    }

    /// The length of the header in bytes.
    pub fn len(&self) -> usize {
        match self.type_ {
            NaluType::PrefixUnit | NaluType::SliceExt => 4,
            _ => 1,
        }
    }

    /// View the unit belongs to. Units without MVC information belong to the
    /// base view.
    pub fn view_id(&self) -> u16 {
        self.mvc.map(|ext| ext.view_id).unwrap_or(0)
    }

    /// Whether the unit belongs to a non-base view (NAL type 20).
    pub fn is_non_base_view(&self) -> bool {
        matches!(self.type_, NaluType::SliceExt)
    }

    pub fn is_slice(&self) -> bool {
        matches!(
            self.type_,
            NaluType::Slice | NaluType::SliceIdr | NaluType::SliceExt
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NaluError {
    #[error("empty NAL unit")]
    Empty,
    #[error("forbidden_zero_bit is set")]
    ForbiddenBit,
    #[error("NAL unit header is truncated")]
    Truncated,
    #[error("unsupported NAL unit type {0}")]
    Unsupported(u8),
    #[error("NAL unit exceeds the maximum buffer size of {0} bytes")]
    TooLarge(usize),
}

/// A NAL unit, header included, with its emulation-prevention bytes still in
/// place.
#[derive(Clone, Debug)]
pub struct Nalu {
    pub header: NaluHeader,
    /// Header and payload bytes.
    pub data: Bytes,
    /// Offset of the start code in the stream.
    pub sc_offset: usize,
    /// Offset of the NAL header in the stream.
    pub offset: usize,
    /// Timestamp of the input chunk the unit started in.
    pub timestamp: u64,
}

impl Nalu {
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        data.get(offset..)?
            .windows(3)
            .position(|window| window == START_CODE)
            .map(|pos| pos + offset)
    }

    /// Offset of the start code located at `pos`, accounting for the zero_byte
    /// of a 4-byte start code.
    fn start_code_offset(data: &[u8], pos: usize) -> usize {
        if pos > 0 && data[pos - 1] == 0x00 {
            pos - 1
        } else {
            pos
        }
    }

    /// End of the unit starting at `start` and ending before `end`, with
    /// `trailing_zero_8bits` removed.
    fn trim_trailing_zeros(data: &[u8], start: usize, mut end: usize) -> usize {
        while end > start && data[end - 1] == 0x00 {
            end -= 1;
        }
        end
    }

    /// Find the next Annex B encoded NAL unit in an in-memory buffer.
    pub fn next(cursor: &mut Cursor<&[u8]>) -> anyhow::Result<Nalu> {
        let bitstream = *cursor.get_ref();
        let pos = usize::try_from(cursor.position())?;

        let sc_pos = Self::find_start_code(bitstream, pos).ok_or(anyhow!("No NAL found"))?;
        let sc_offset = Self::start_code_offset(bitstream, sc_pos);
        let nalu_offset = sc_pos + START_CODE.len();

        let next_sc = Self::find_start_code(bitstream, nalu_offset).unwrap_or(bitstream.len());
        let end = Self::trim_trailing_zeros(bitstream, nalu_offset, next_sc);

        cursor.set_position(u64::try_from(end)?);

        let data = &bitstream[nalu_offset..end];
        let header = NaluHeader::parse(data)?;

        Ok(Nalu {
            header,
            data: Bytes::copy_from_slice(data),
            sc_offset,
            offset: nalu_offset,
            timestamp: 0,
        })
    }

    /// Size of the unit in bytes, header included.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The payload following the NAL header, emulation prevention included.
    pub fn payload(&self) -> &[u8] {
        self.data.get(self.header.len()..).unwrap_or_default()
    }
}

impl AsRef<[u8]> for Nalu {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Result of asking the extractor for its next unit.
#[derive(Debug)]
pub enum NaluStatus {
    /// Nothing is buffered.
    HaveNoStream,
    /// A unit has started but its end has not been seen yet.
    MidOfNalu,
    /// A complete unit.
    EndOfNalu(Nalu),
    /// A unit of a reserved or unsupported type was dropped.
    NaluNotSupport(u8),
    /// End of stream was signalled and every buffered unit was returned.
    EndofStream,
}

/// Splits a byte stream delivered in arbitrary chunks into NAL units.
///
/// Data is accumulated in a buffer grown in fixed increments. A unit is only
/// returned once the start code of the following unit is seen, or once the
/// end of the stream has been signalled.
pub struct NalExtractor {
    buf: BytesMut,
    /// Stream offset of `buf[0]`.
    base_offset: usize,
    /// Where the next start code search resumes, relative to `buf`.
    search_pos: usize,
    /// `(stream offset, timestamp)` of every pushed chunk still buffered.
    timestamps: VecDeque<(usize, u64)>,
    /// Extension of the last prefix unit, waiting for its slice.
    prefix: Option<MvcExtension>,
    eos: bool,
    max_size: usize,
    grow_size: usize,
}

impl Default for NalExtractor {
    fn default() -> Self {
        Self::new(NALU_BUF_MAX_SIZE, NALU_BUF_ADD_SIZE)
    }
}

impl NalExtractor {
    pub fn new(max_size: usize, grow_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(grow_size),
            base_offset: 0,
            search_pos: 0,
            timestamps: Default::default(),
            prefix: None,
            eos: false,
            max_size,
            grow_size: grow_size.max(1),
        }
    }

    /// Appends `data`, tagged with `timestamp`, to the buffer.
    pub fn push(&mut self, data: &[u8], timestamp: u64) {
        if data.is_empty() {
            return;
        }

        let free = self.buf.capacity() - self.buf.len();
        if free < data.len() {
            let increments = (data.len() - free).div_ceil(self.grow_size);
            self.buf.reserve(increments * self.grow_size);
        }

        self.timestamps
            .push_back((self.base_offset + self.buf.len(), timestamp));
        self.buf.extend_from_slice(data);
        self.eos = false;
    }

    /// Signals that no more data will be pushed. Buffered data is returned as
    /// the last unit.
    pub fn set_eos(&mut self) {
        self.eos = true;
    }

    /// Drops all buffered data and state.
    pub fn reset(&mut self) {
        self.base_offset += self.buf.len();
        self.buf.clear();
        self.search_pos = 0;
        self.timestamps.clear();
        self.prefix = None;
        self.eos = false;
    }

    fn timestamp_at(&self, offset: usize) -> u64 {
        self.timestamps
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map(|(_, ts)| *ts)
            .unwrap_or_default()
    }

    /// Removes the first `n` bytes of the buffer.
    fn consume(&mut self, n: usize) -> Bytes {
        let bytes = self.buf.split_to(n).freeze();
        self.base_offset += n;
        self.search_pos = self.search_pos.saturating_sub(n);

        while self.timestamps.len() > 1 && self.timestamps[1].0 <= self.base_offset {
            self.timestamps.pop_front();
        }

        bytes
    }

    /// Returns the next unit, or the reason why none is available.
    pub fn next(&mut self) -> Result<NaluStatus, NaluError> {
        loop {
            let sc_pos = match Nalu::find_start_code(&self.buf, 0) {
                Some(pos) => pos,
                None => {
                    if self.eos {
                        self.consume(self.buf.len());
                        return Ok(NaluStatus::EndofStream);
                    }

                    // Keep a possible partial start code.
                    let keep = self.buf.len().min(START_CODE.len() - 1);
                    self.consume(self.buf.len() - keep);
                    return Ok(NaluStatus::HaveNoStream);
                }
            };

            let sc_offset = Nalu::start_code_offset(&self.buf, sc_pos);
            let nalu_start = sc_pos + START_CODE.len();
            let search_from = self.search_pos.max(nalu_start);

            let end = match Nalu::find_start_code(&self.buf, search_from) {
                Some(next_sc) => next_sc,
                None if self.eos => self.buf.len(),
                None => {
                    let pending = self.buf.len() - nalu_start;
                    if pending > self.max_size {
                        return Err(NaluError::TooLarge(self.max_size));
                    }

                    // Resume where a new start code could still begin.
                    self.search_pos = self.buf.len().saturating_sub(START_CODE.len() - 1);
                    return Ok(NaluStatus::MidOfNalu);
                }
            };

            let end = Nalu::trim_trailing_zeros(&self.buf, nalu_start, end);
            if end - nalu_start > self.max_size {
                self.consume(end);
                return Err(NaluError::TooLarge(self.max_size));
            }

            let stream_sc_offset = self.base_offset + sc_offset;
            let stream_offset = self.base_offset + nalu_start;
            let timestamp = self.timestamp_at(stream_sc_offset);

            self.consume(nalu_start);
            let data = self.consume(end - nalu_start);
            self.search_pos = 0;

            if data.is_empty() {
                continue;
            }

            let mut header = match NaluHeader::parse(&data) {
                Ok(header) => header,
                Err(NaluError::Unsupported(type_)) => {
                    debug!("Dropping unsupported NAL unit type {}", type_);
                    self.prefix = None;
                    return Ok(NaluStatus::NaluNotSupport(type_));
                }
                Err(e) => return Err(e),
            };

            let prefix = self.prefix.take();

            match header.type_ {
                NaluType::PrefixUnit => {
                    trace!("Prefix NAL unit {:?}", header.mvc);
                    self.prefix = header.mvc.map(|ext| MvcExtension {
                        from_prefix: true,
                        ..ext
                    });
                    continue;
                }
                NaluType::Slice | NaluType::SliceIdr => header.mvc = prefix,
                NaluType::Unknown
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::DepthSps
                | NaluType::SliceAux
                | NaluType::SliceDepth => {
                    debug!("Dropping unsupported NAL unit type {:?}", header.type_);
                    return Ok(NaluStatus::NaluNotSupport(header.type_ as u8));
                }
                _ => (),
            }

            return Ok(NaluStatus::EndOfNalu(Nalu {
                header,
                data,
                sc_offset: stream_sc_offset,
                offset: stream_offset,
                timestamp,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h264::nalu_reader::NaluReader;

    fn expect_nalu(extractor: &mut NalExtractor) -> Nalu {
        match extractor.next().unwrap() {
            NaluStatus::EndOfNalu(nalu) => nalu,
            other => panic!("expected a NAL unit, got {:?}", other),
        }
    }

    #[test]
    fn three_and_four_byte_start_codes() {
        const STREAM: [u8; 15] = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xaa, 0x00, 0x00, 0x01, 0x68, 0xbb, 0x00, 0x00, 0x01,
            0x65,
        ];

        let mut cursor = Cursor::new(&STREAM[..]);

        let sps = Nalu::next(&mut cursor).unwrap();
        assert_eq!(sps.header.type_, NaluType::Sps);
        assert_eq!(sps.header.ref_idc, 3);
        assert_eq!(sps.sc_offset, 0);
        assert_eq!(sps.offset, 4);
        assert_eq!(sps.as_ref(), &[0x67, 0xaa]);

        let pps = Nalu::next(&mut cursor).unwrap();
        assert_eq!(pps.header.type_, NaluType::Pps);
        assert_eq!(pps.sc_offset, 6);
        assert_eq!(pps.as_ref(), &[0x68, 0xbb]);

        let idr = Nalu::next(&mut cursor).unwrap();
        assert!(idr.header.idr_pic_flag);
        assert_eq!(idr.size(), 1);

        assert!(Nalu::next(&mut cursor).is_err());
    }

    #[test]
    fn emulation_prevention_skipped_by_reader() {
        const STREAM: [u8; 9] = [0x00, 0x00, 0x01, 0x06, 0x00, 0x00, 0x03, 0x01, 0x80];

        let mut cursor = Cursor::new(&STREAM[..]);
        let sei = Nalu::next(&mut cursor).unwrap();

        assert_eq!(sei.payload(), &[0x00, 0x00, 0x03, 0x01, 0x80]);

        let mut r = NaluReader::new(sei.payload());
        assert_eq!(r.read_bits::<u32>(24).unwrap(), 0x000001);
        assert_eq!(r.num_epb(), 1);
        assert!(!r.has_more_rsbp_data());
    }

    #[test]
    fn streaming_across_chunks() {
        let mut extractor = NalExtractor::new(NALU_BUF_MAX_SIZE, 4);

        assert!(matches!(
            extractor.next().unwrap(),
            NaluStatus::HaveNoStream
        ));

        extractor.push(&[0x00, 0x00, 0x00, 0x01, 0x09], 10);
        assert!(matches!(extractor.next().unwrap(), NaluStatus::MidOfNalu));

        extractor.push(&[0xf0, 0x00, 0x00], 20);
        assert!(matches!(extractor.next().unwrap(), NaluStatus::MidOfNalu));

        extractor.push(&[0x01, 0x67, 0x42], 30);
        let aud = expect_nalu(&mut extractor);
        assert_eq!(aud.header.type_, NaluType::AuDelimiter);
        assert_eq!(aud.as_ref(), &[0x09, 0xf0]);
        assert_eq!(aud.timestamp, 10);
        assert_eq!(aud.offset, 4);

        assert!(matches!(extractor.next().unwrap(), NaluStatus::MidOfNalu));

        extractor.set_eos();
        let sps = expect_nalu(&mut extractor);
        assert_eq!(sps.header.type_, NaluType::Sps);
        assert_eq!(sps.as_ref(), &[0x67, 0x42]);
        assert_eq!(sps.timestamp, 20);
        assert_eq!(sps.sc_offset, 6);

        assert!(matches!(extractor.next().unwrap(), NaluStatus::EndofStream));
    }

    #[test]
    fn oversized_unit_is_fatal() {
        let mut extractor = NalExtractor::new(8, 4);

        extractor.push(&[0x00, 0x00, 0x01, 0x01], 0);
        extractor.push(&[0xff; 16], 0);

        assert_eq!(extractor.next().unwrap_err(), NaluError::TooLarge(8));
    }

    #[test]
    fn reserved_types_are_not_supported() {
        let mut extractor = NalExtractor::default();

        // Type 23 is reserved, type 2 is data partitioning.
        extractor.push(&[0x00, 0x00, 0x01, 0x17, 0x00, 0x00, 0x01, 0x02, 0x11], 0);
        extractor.set_eos();

        assert!(matches!(
            extractor.next().unwrap(),
            NaluStatus::NaluNotSupport(23)
        ));
        assert!(matches!(
            extractor.next().unwrap(),
            NaluStatus::NaluNotSupport(2)
        ));
        assert!(matches!(extractor.next().unwrap(), NaluStatus::EndofStream));
    }

    #[test]
    fn prefix_unit_augments_next_slice() {
        let mut extractor = NalExtractor::default();

        // Prefix: svc_extension_flag=0 non_idr_flag=0 priority_id=0 view_id=0
        // temporal_id=0 anchor=1 inter_view=1 reserved_one_bit=1.
        extractor.push(&[0x00, 0x00, 0x01, 0x6e, 0x00, 0x00, 0x07], 0);
        // IDR slice.
        extractor.push(&[0x00, 0x00, 0x01, 0x65, 0x88], 0);
        // Slice extension: non_idr_flag=1, view_id=1, anchor=0, inter_view=1.
        extractor.push(&[0x00, 0x00, 0x01, 0x74, 0x40, 0x00, 0x43, 0x88], 0);
        extractor.set_eos();

        let base = expect_nalu(&mut extractor);
        assert_eq!(base.header.type_, NaluType::SliceIdr);
        let ext = base.header.mvc.unwrap();
        assert!(ext.from_prefix);
        assert!(ext.anchor_pic_flag);
        assert!(ext.inter_view_flag);
        assert_eq!(base.header.view_id(), 0);

        let non_base = expect_nalu(&mut extractor);
        assert_eq!(non_base.header.type_, NaluType::SliceExt);
        assert!(non_base.header.is_non_base_view());
        assert!(!non_base.header.idr_pic_flag);
        assert_eq!(non_base.header.view_id(), 1);
        assert_eq!(non_base.payload(), &[0x88]);
    }
}
