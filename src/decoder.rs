// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h264;
pub mod pipeline;

use std::collections::VecDeque;

use thiserror::Error;

use crate::codec::h264::nalu::NALU_BUF_ADD_SIZE;
use crate::codec::h264::nalu::NALU_BUF_MAX_SIZE;
use crate::codec::h264::parser::UnknownParameterSet;
use crate::codec::h264::picture::Field;
use crate::Resolution;

/// Number of DPB layers: one for the base view, one shared by all the other views.
pub const MAX_NUM_DPB_LAYERS: usize = 2;

/// Error returned by the reconstruction backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A stream property that a conformant encoder would never produce.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingError {
    #[error("POC {pic_order_cnt} of view {view_id} output after a higher POC")]
    PocRegression { view_id: u16, pic_order_cnt: i32 },
    #[error("frame_num jumped from {prev} to {frame_num} but gaps are not allowed")]
    FrameNumGap { prev: i32, frame_num: i32 },
}

#[derive(Error, Debug)]
pub enum DecodeError {
    /// Input was submitted after the stream has been flushed.
    #[error("end of stream reached")]
    StreamExhausted,
    #[error("malformed NAL unit: {0:#}")]
    MalformedNal(#[source] anyhow::Error),
    #[error(transparent)]
    UnknownParameterSetId(#[from] UnknownParameterSet),
    /// A picture of the given layer had to be stored by dropping a reference.
    #[error("DPB of layer {0} overflowed")]
    DpbOverflow(usize),
    #[error(transparent)]
    NonConformantOrdering(#[from] OrderingError),
    #[error("NAL unit exceeds the {0} bytes limit")]
    NaluTooLarge(usize),
    #[error(transparent)]
    BackendError(#[from] BackendError),
}

impl DecodeError {
    /// Whether decoding cannot go on after this error. Other errors are scoped to a NAL
    /// unit or an access unit and are reported through [`DecoderEvent::Error`].
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::StreamExhausted | DecodeError::NaluTooLarge(_) | DecodeError::BackendError(_)
        )
    }
}

impl From<anyhow::Error> for DecodeError {
    fn from(e: anyhow::Error) -> Self {
        let e = match e.downcast::<UnknownParameterSet>() {
            Ok(ps) => return DecodeError::UnknownParameterSetId(ps),
            Err(e) => e,
        };

        match e.downcast::<OrderingError>() {
            Ok(ordering) => DecodeError::NonConformantOrdering(ordering),
            Err(e) => DecodeError::MalformedNal(e),
        }
    }
}

/// Instructs the decoder on whether it should block on the decode operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockingMode {
    /// Wait for every slice of a picture to be released by the backend once the picture is
    /// submitted.
    #[default]
    Blocking,
    /// Only wait when the task pipeline is full.
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub blocking_mode: BlockingMode,
    /// NAL units larger than this are rejected with [`DecodeError::NaluTooLarge`].
    pub max_nalu_size: usize,
    /// Growth step of the NAL extraction buffer.
    pub nalu_grow_size: usize,
    /// Decode non-base views. When unset only the base view is decoded.
    pub enable_mvc: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            blocking_mode: Default::default(),
            max_nalu_size: NALU_BUF_MAX_SIZE,
            nalu_grow_size: NALU_BUF_ADD_SIZE,
            enable_mvc: true,
        }
    }
}

/// Stream parameters, as reported by a [`DecoderEvent::FormatChanged`] event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub profile_idc: u8,
    pub coded_resolution: Resolution,
    pub display_resolution: Resolution,
    /// Number of frame buffers the DPB of the base view may hold.
    pub min_num_frames: usize,
    pub interlaced: bool,
}

/// A picture leaving the decoder in output order.
#[derive(Debug, Clone)]
pub struct DecodedPicture<H> {
    pub handle: H,
    pub pic_order_cnt: i32,
    pub view_id: u16,
    pub structure: Field,
    pub timestamp: u64,
}

/// Events that can be retrieved using the `next_event` method of a decoder.
#[derive(Debug)]
pub enum DecoderEvent<H> {
    /// The next frame in output order is ready.
    FrameReady(DecodedPicture<H>),
    /// A new sequence with the given parameters has started.
    FormatChanged(StreamInfo),
    /// A NAL unit or access unit had to be dropped, or the stream misbehaved.
    Error(DecodeError),
}

/// Events waiting to be retrieved by the client, in the order they happened.
struct EventQueue<H> {
    queue: VecDeque<DecoderEvent<H>>,
}

impl<H> Default for EventQueue<H> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<H> EventQueue<H> {
    /// Push `event` to the back of the queue.
    fn push(&mut self, event: DecoderEvent<H>) {
        self.queue.push_back(event)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<H> Extend<DecoderEvent<H>> for EventQueue<H> {
    fn extend<I: IntoIterator<Item = DecoderEvent<H>>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the event queue like an iterator without consuming it.
impl<'a, H> Iterator for &'a mut EventQueue<H> {
    type Item = DecoderEvent<H>;

    /// Returns the next event (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<DecoderEvent<H>> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn anyhow_errors_are_classified() {
        let e = DecodeError::from(anyhow::Error::from(UnknownParameterSet::Pps(3)));
        assert!(matches!(
            e,
            DecodeError::UnknownParameterSetId(UnknownParameterSet::Pps(3))
        ));

        let e = DecodeError::from(anyhow::Error::from(OrderingError::FrameNumGap {
            prev: 0,
            frame_num: 3,
        }));
        assert!(matches!(e, DecodeError::NonConformantOrdering(_)));
        assert!(!e.is_fatal());

        let e = DecodeError::from(anyhow!("bad exp-golomb code"));
        assert!(matches!(e, DecodeError::MalformedNal(_)));
        assert!(!e.is_fatal());
    }

    #[test]
    fn context_does_not_hide_the_parameter_set() {
        use anyhow::Context;

        let res: anyhow::Result<()> =
            Err(UnknownParameterSet::SubsetSps(1)).context("while parsing slice header");
        let e = DecodeError::from(res.unwrap_err());

        assert!(matches!(
            e,
            DecodeError::UnknownParameterSetId(UnknownParameterSet::SubsetSps(1))
        ));
    }

    #[test]
    fn fatal_errors() {
        assert!(DecodeError::StreamExhausted.is_fatal());
        assert!(DecodeError::NaluTooLarge(16).is_fatal());
        assert!(DecodeError::BackendError(BackendError::OutOfResources).is_fatal());
        assert!(!DecodeError::DpbOverflow(0).is_fatal());
    }

    #[test]
    fn event_queue_is_fifo() {
        let mut queue = EventQueue::<u32>::default();
        queue.push(DecoderEvent::Error(DecodeError::DpbOverflow(1)));
        queue.extend([DecoderEvent::FrameReady(DecodedPicture {
            handle: 7,
            pic_order_cnt: 0,
            view_id: 0,
            structure: Field::Frame,
            timestamp: 0,
        })]);
        assert_eq!(queue.len(), 2);

        assert!(matches!(
            (&mut queue).next(),
            Some(DecoderEvent::Error(DecodeError::DpbOverflow(1)))
        ));
        assert!(matches!(
            (&mut queue).next(),
            Some(DecoderEvent::FrameReady(DecodedPicture { handle: 7, .. }))
        ));
        assert!((&mut queue).next().is_none());
    }
}
