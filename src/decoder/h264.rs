// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[cfg(test)]
mod dummy;

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use bytes::Bytes;
use log::debug;
use log::trace;
use log::warn;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbInfo;
use crate::codec::h264::dpb::DpbInsertion;
use crate::codec::h264::dpb::DpbOutput;
use crate::codec::h264::dpb::PicId;
use crate::codec::h264::dpb::ReferencePicLists;
use crate::codec::h264::dpb::StorePictureError;
use crate::codec::h264::nalu::NalExtractor;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluError;
use crate::codec::h264::nalu::NaluStatus;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::RefPicListModification;
use crate::codec::h264::parser::ScalingMatrices;
use crate::codec::h264::parser::SeiPayload;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::SubsetSps;
use crate::codec::h264::parser::UnknownParameterSet;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::poc::PocState;
use crate::decoder::pipeline::Task;
use crate::decoder::pipeline::TaskPool;
use crate::decoder::pipeline::MAX_TASK_SIZE;
use crate::decoder::BackendError;
use crate::decoder::BackendResult;
use crate::decoder::BlockingMode;
use crate::decoder::DecodeError;
use crate::decoder::DecodedPicture;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderEvent;
use crate::decoder::EventQueue;
use crate::decoder::OrderingError;
use crate::decoder::StreamInfo;
use crate::decoder::MAX_NUM_DPB_LAYERS;
use crate::Resolution;

/// A reference picture as seen by the reconstruction engine.
#[derive(Clone, Debug)]
pub struct RefPicEntry<H> {
    pub handle: Option<H>,
    /// DPB layer holding the picture.
    pub layer: usize,
    pub id: PicId,
    /// `Field::Frame` when the current picture is a frame, the parity of the referenced
    /// field otherwise.
    pub structure: Field,
    pub pic_order_cnt: i32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub long_term: bool,
    /// `FrameNumWrap` of a short-term reference, `LongTermFrameIdx` of a long-term one.
    pub frame_idx: i32,
    /// `PicNum` of a short-term reference, `LongTermPicNum` of a long-term one.
    pub pic_num: i32,
    pub view_id: u16,
    pub nonexisting: bool,
}

/// Everything the reconstruction engine needs to decode one slice.
#[derive(Clone, Debug)]
pub struct SliceDescriptor<H> {
    pub sps: Arc<Sps>,
    /// Subset SPS in effect for non-base views.
    pub subset_sps: Option<Arc<SubsetSps>>,
    pub pps: Arc<Pps>,
    pub scaling_matrices: ScalingMatrices,
    pub header: SliceHeader,
    /// Picture the slice is decoded into.
    pub target: H,
    pub pic_order_cnt: i32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub frame_num: i32,
    pub structure: Field,
    pub view_id: u16,
    /// View order index of `view_id`.
    pub voidx: u16,
    pub inter_view_flag: bool,
    pub anchor_pic_flag: bool,
    pub is_reference: bool,
    pub is_idr: bool,
    pub ref_pic_list0: Vec<RefPicEntry<H>>,
    pub ref_pic_list1: Vec<RefPicEntry<H>>,
    /// The stores the slice may reference, inter-view pictures of other layers included.
    pub dpb: Vec<DpbInfo<H>>,
    /// The whole NAL unit, header included.
    pub data: Bytes,
    /// Offset in bits of `slice_data()` from the start of the payload.
    pub slice_data_bit_offset: usize,
    /// Offset of the NAL unit in the stream.
    pub stream_offset: usize,
    pub timestamp: u64,
}

/// Reconstruction engine fed by [`H264Decoder`].
pub trait H264DecoderBackend {
    /// Handle to a decoded picture. Clones refer to the same picture.
    type Handle: Clone;

    /// Called when a new SPS is activated for the base view.
    fn new_sequence(&mut self, sps: &Arc<Sps>) -> BackendResult<()>;

    /// Allocates the target of a frame or of a first field.
    fn new_picture(&mut self, picture: &PictureData, timestamp: u64)
        -> BackendResult<Self::Handle>;

    /// Returns the target of a second field. `first_field` is the target of its first field.
    fn new_field_picture(
        &mut self,
        picture: &PictureData,
        timestamp: u64,
        first_field: &Self::Handle,
    ) -> BackendResult<Self::Handle>;

    /// Decodes one slice. The task must be dropped once the backend is done with it, which
    /// lets the decoder assemble the next descriptors.
    fn decode_slice(&mut self, task: Task<SliceDescriptor<Self::Handle>>) -> BackendResult<()>;

    /// Called once every slice of the picture has been handed over.
    fn submit_picture(&mut self, picture: &Self::Handle) -> BackendResult<()>;
}

/// The fields of the last slice that tell whether the next slice starts a new picture, as
/// described in 7.4.1.2.4.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct OldSlice {
    pps_id: u8,
    frame_num: u16,
    field_pic_flag: bool,
    bottom_field_flag: bool,
    nal_ref_idc: u8,
    pic_order_cnt_lsb: u16,
    delta_pic_order_cnt_bottom: i32,
    delta_pic_order_cnt: [i32; 2],
    idr_flag: bool,
    idr_pic_id: u16,
    redundant_pic_cnt: u8,
    view_id: u16,
    anchor_pic_flag: bool,
    inter_view_flag: bool,
    layer_id: usize,
}

impl OldSlice {
    fn from_slice(slice: &Slice) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu.header;
        let (anchor_pic_flag, inter_view_flag) = nalu_hdr
            .mvc
            .as_ref()
            .map_or((false, false), |mvc| (mvc.anchor_pic_flag, mvc.inter_view_flag));

        Self {
            pps_id: hdr.pic_parameter_set_id,
            frame_num: hdr.frame_num,
            field_pic_flag: hdr.field_pic_flag,
            bottom_field_flag: hdr.bottom_field_flag,
            nal_ref_idc: nalu_hdr.ref_idc,
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: hdr.delta_pic_order_cnt,
            idr_flag: nalu_hdr.idr_pic_flag,
            idr_pic_id: hdr.idr_pic_id,
            redundant_pic_cnt: hdr.redundant_pic_cnt,
            view_id: nalu_hdr.view_id(),
            anchor_pic_flag,
            inter_view_flag,
            layer_id: usize::from(nalu_hdr.is_non_base_view()),
        }
    }

    /// Whether a slice described by `next` belongs to a different picture than the slice
    /// described by `self`. POC fields not used by the active POC type are always zero.
    fn is_new_picture(&self, next: &OldSlice) -> bool {
        self.pps_id != next.pps_id
            || self.frame_num != next.frame_num
            || self.field_pic_flag != next.field_pic_flag
            || (next.field_pic_flag && self.bottom_field_flag != next.bottom_field_flag)
            || (self.nal_ref_idc == 0) != (next.nal_ref_idc == 0)
            || self.pic_order_cnt_lsb != next.pic_order_cnt_lsb
            || self.delta_pic_order_cnt_bottom != next.delta_pic_order_cnt_bottom
            || self.delta_pic_order_cnt != next.delta_pic_order_cnt
            || self.idr_flag != next.idr_flag
            || (self.idr_flag && next.idr_flag && self.idr_pic_id != next.idr_pic_id)
            || (self.redundant_pic_cnt != 0 && next.redundant_pic_cnt == 0)
            || self.view_id != next.view_id
            || self.anchor_pic_flag != next.anchor_pic_flag
            || self.inter_view_flag != next.inter_view_flag
            || self.layer_id != next.layer_id
    }
}

/// A reference picture in one of the DPB layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RefPic {
    layer: usize,
    id: PicId,
}

/// State of the picture being decoded.
struct CurrentPicState<H> {
    pic: PictureData,
    handle: H,
    layer: usize,
    /// Slot of the first field when the picture is a second field.
    first_field: Option<usize>,
    /// Initial reference lists, before truncation and modification.
    ref_pic_lists: ReferencePicLists,
    sps: Arc<Sps>,
    subset_sps: Option<Arc<SubsetSps>>,
    voidx: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodingState {
    Decoding,
    /// An access unit was lost: drop everything until the next IDR picture.
    SkipUntilIdr,
}

/// Per-layer decoding state.
struct DpbLayer<H> {
    dpb: Dpb<H>,
    poc: PocState,
    active_sps: Option<Arc<Sps>>,
}

impl<H> DpbLayer<H> {
    fn new(layer_id: usize) -> Self {
        Self {
            dpb: Dpb::new(layer_id),
            poc: Default::default(),
            active_sps: None,
        }
    }
}

fn store_error(layer: usize, e: StorePictureError) -> DecodeError {
    match e {
        StorePictureError::DpbIsFull => DecodeError::DpbOverflow(layer),
        StorePictureError::NoFirstField => DecodeError::MalformedNal(e.into()),
    }
}

/// Inserts `entry` at `ref_idx_lx` and removes its later occurrence, as the modification
/// process of 8.2.4.3.1, 8.2.4.3.2 and H.8.2.2.3 does.
fn place_ref_pic(list: &mut Vec<RefPic>, ref_idx_lx: &mut usize, entry: RefPic) {
    let idx = (*ref_idx_lx).min(list.len());
    list.insert(idx, entry);
    *ref_idx_lx = idx + 1;

    if let Some(dup) = list[*ref_idx_lx..].iter().position(|e| *e == entry) {
        list.remove(*ref_idx_lx + dup);
    }
}

/// H.264 and MVC decoding front end.
///
/// Bytes pushed with [`H264Decoder::decode`] are split into NAL units, parsed, and turned
/// into one [`SliceDescriptor`] per slice for the backend. Decoded pictures leave through
/// [`H264Decoder::next_event`] in output order.
pub struct H264Decoder<B: H264DecoderBackend> {
    backend: B,
    config: DecoderConfig,
    extractor: NalExtractor,
    parser: Parser,
    layers: [DpbLayer<B::Handle>; MAX_NUM_DPB_LAYERS],
    pool: TaskPool,
    events: EventQueue<B::Handle>,
    cur_pic: Option<CurrentPicState<B::Handle>>,
    old_slice: Option<OldSlice>,
    stream_info: Option<StreamInfo>,
    state: DecodingState,
    /// Decoding order number of the last picture.
    dec_no: u64,
    /// Number of the current access unit.
    au_no: u64,
    /// Set by `flush`, cleared by `reset`.
    exhausted: bool,
}

impl<B: H264DecoderBackend> H264Decoder<B> {
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        Self {
            backend,
            extractor: NalExtractor::new(config.max_nalu_size, config.nalu_grow_size),
            config,
            parser: Default::default(),
            layers: [DpbLayer::new(0), DpbLayer::new(1)],
            pool: TaskPool::new(MAX_TASK_SIZE),
            events: Default::default(),
            cur_pic: None,
            old_slice: None,
            stream_info: None,
            state: DecodingState::Decoding,
            dec_no: 0,
            au_no: 0,
            exhausted: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Parameters of the current sequence, once its first picture has been seen.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    pub fn dpb(&self, layer: usize) -> Option<&Dpb<B::Handle>> {
        self.layers.get(layer).map(|l| &l.dpb)
    }

    /// Number of slice descriptors the backend has not released yet.
    pub fn tasks_in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn next_event(&mut self) -> Option<DecoderEvent<B::Handle>> {
        (&mut self.events).next()
    }

    /// Feeds `bitstream` to the decoder. Every complete NAL unit is processed before
    /// returning. Errors scoped to a NAL unit or access unit are reported as
    /// [`DecoderEvent::Error`], only fatal ones are returned.
    pub fn decode(&mut self, timestamp: u64, bitstream: &[u8]) -> Result<usize, DecodeError> {
        if self.exhausted {
            return Err(DecodeError::StreamExhausted);
        }

        self.extractor.push(bitstream, timestamp);
        self.process_nalus()?;

        Ok(bitstream.len())
    }

    /// Signals the end of the stream: the last NAL unit and picture are processed and every
    /// pending picture is output. Further calls to `decode` fail until `reset` is called.
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        if self.exhausted {
            return Ok(());
        }

        debug!("Flushing the decoder");
        self.extractor.set_eos();
        self.process_nalus()?;
        self.finish_current()?;
        self.pool.wait_idle().map_err(BackendError::Other)?;
        self.drain_layers();
        self.exhausted = true;

        Ok(())
    }

    /// Drops every buffered byte and picture without output, so a new stream can be
    /// decoded. Parameter sets are kept.
    pub fn reset(&mut self) -> Result<(), DecodeError> {
        debug!("Resetting the decoder");
        self.pool.wait_idle().map_err(BackendError::Other)?;
        self.extractor.reset();
        self.cur_pic = None;
        self.old_slice = None;
        for layer in &mut self.layers {
            layer.dpb.clear();
            layer.poc = Default::default();
            layer.active_sps = None;
        }
        self.stream_info = None;
        self.state = DecodingState::Decoding;
        self.exhausted = false;

        Ok(())
    }

    fn report(&mut self, e: DecodeError) {
        warn!("{}", e);
        self.events.push(DecoderEvent::Error(e));
    }

    fn next_dec_no(&mut self) -> u64 {
        self.dec_no += 1;
        self.dec_no
    }

    fn queue_outputs(&mut self, outputs: Vec<DpbOutput<B::Handle>>) {
        for output in outputs {
            if output.out_of_order {
                self.report(
                    OrderingError::PocRegression {
                        view_id: output.view_id,
                        pic_order_cnt: output.pic_order_cnt,
                    }
                    .into(),
                );
            }

            match output.handle {
                Some(handle) => self.events.push(DecoderEvent::FrameReady(DecodedPicture {
                    handle,
                    pic_order_cnt: output.pic_order_cnt,
                    view_id: output.view_id,
                    structure: output.structure,
                    timestamp: output.timestamp,
                })),
                None => trace!("POC {} has no handle to output", output.pic_order_cnt),
            }
        }
    }

    fn handle_insertion(&mut self, layer: usize, insertion: DpbInsertion<B::Handle>) {
        if insertion.overflowed {
            self.report(DecodeError::DpbOverflow(layer));
        }

        self.queue_outputs(insertion.outputs);
    }

    fn drain_layers(&mut self) {
        for layer in 0..MAX_NUM_DPB_LAYERS {
            let outputs = self.layers[layer].dpb.drain();
            self.queue_outputs(outputs);
        }
    }

    fn process_nalus(&mut self) -> Result<(), DecodeError> {
        loop {
            match self.extractor.next() {
                Ok(NaluStatus::EndOfNalu(nalu)) => self.handle_nalu(nalu)?,
                Ok(NaluStatus::NaluNotSupport(type_)) => self.report(DecodeError::MalformedNal(
                    anyhow!("unsupported NAL unit type {}", type_),
                )),
                Ok(NaluStatus::HaveNoStream)
                | Ok(NaluStatus::MidOfNalu)
                | Ok(NaluStatus::EndofStream) => return Ok(()),
                Err(NaluError::TooLarge(max_size)) => {
                    self.extractor.reset();
                    return Err(DecodeError::NaluTooLarge(max_size));
                }
                Err(e) => self.report(DecodeError::MalformedNal(e.into())),
            }
        }
    }

    fn handle_nalu(&mut self, nalu: Nalu) -> Result<(), DecodeError> {
        trace!(
            "NAL unit {:?} of {} bytes at offset {}",
            nalu.header.type_,
            nalu.size(),
            nalu.offset
        );

        match nalu.header.type_ {
            NaluType::Sps => {
                self.finish_current()?;
                let res = self.parser.parse_sps(&nalu).map(|_| ());
                if let Err(e) = res {
                    self.report(e.into());
                }
            }
            NaluType::SubsetSps => {
                self.finish_current()?;
                let res = self.parser.parse_subset_sps(&nalu).map(|_| ());
                if let Err(e) = res {
                    self.report(e.into());
                }
            }
            NaluType::Pps => {
                let res = self.parser.parse_pps(&nalu).map(|_| ());
                if let Err(e) = res {
                    self.report(e.into());
                }
            }
            NaluType::Slice | NaluType::SliceIdr | NaluType::SliceExt => {
                self.handle_slice_nalu(nalu)?
            }
            NaluType::Sei => self.handle_sei_nalu(&nalu),
            NaluType::AuDelimiter | NaluType::SeqEnd | NaluType::StreamEnd => {
                self.finish_current()?
            }
            _ => trace!("Ignoring NAL unit {:?}", nalu.header.type_),
        }

        Ok(())
    }

    /// A recovery point is a valid place to start decoding, like an IDR picture.
    fn handle_sei_nalu(&mut self, nalu: &Nalu) {
        let messages = match self.parser.parse_sei(nalu) {
            Ok(messages) => messages,
            Err(e) => {
                self.report(e.into());
                return;
            }
        };

        for message in messages {
            if let SeiPayload::RecoveryPoint(recovery) = message.payload {
                debug!(
                    "Recovery point: recovery_frame_cnt {}, broken_link {}",
                    recovery.recovery_frame_cnt, recovery.broken_link_flag
                );

                if self.state == DecodingState::SkipUntilIdr {
                    debug!("Resuming at recovery point");
                    self.state = DecodingState::Decoding;
                }
            }
        }
    }

    /// Reports `e`. A missing parameter set makes the whole access unit unusable, and so is
    /// everything predicted from it. It is only reported once until the next IDR picture.
    fn drop_until_idr(&mut self, e: DecodeError) {
        if matches!(e, DecodeError::UnknownParameterSetId(_)) {
            self.cur_pic = None;
            self.old_slice = None;
            if self.state == DecodingState::SkipUntilIdr {
                trace!("Skipping slice while waiting for an IDR picture: {}", e);
                return;
            }
            self.state = DecodingState::SkipUntilIdr;
        }
        self.report(e);
    }

    fn handle_slice_nalu(&mut self, nalu: Nalu) -> Result<(), DecodeError> {
        if nalu.header.is_non_base_view() && !self.config.enable_mvc {
            trace!("Skipping slice of view {}", nalu.header.view_id());
            return Ok(());
        }

        let slice = match self.parser.parse_slice_header(nalu) {
            Ok(slice) => slice,
            Err(e) => {
                self.drop_until_idr(DecodeError::from(e));
                return Ok(());
            }
        };

        if self.state == DecodingState::SkipUntilIdr {
            if !slice.nalu.header.idr_pic_flag {
                trace!("Skipping slice while waiting for an IDR picture");
                return Ok(());
            }
            debug!("Resuming at IDR picture");
            self.state = DecodingState::Decoding;
        }

        if slice.header.redundant_pic_cnt > 0 {
            trace!("Skipping redundant slice");
            return Ok(());
        }

        let old_slice = OldSlice::from_slice(&slice);
        let new_picture = self
            .old_slice
            .as_ref()
            .map_or(true, |old| old.is_new_picture(&old_slice));

        if new_picture {
            self.finish_current()?;

            match self.begin_picture(&slice) {
                Ok(cur) => self.cur_pic = Some(cur),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.drop_until_idr(e);
                    return Ok(());
                }
            }
        }
        self.old_slice = Some(old_slice);

        let Some(cur) = self.cur_pic.take() else {
            return Ok(());
        };

        match self.handle_slice(&cur, slice) {
            Ok(()) => self.cur_pic = Some(cur),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // The picture cannot be reconstructed correctly, drop it.
                self.report(e);
                self.old_slice = None;
            }
        }

        Ok(())
    }

    /// Makes `sps` the active SPS of `layer`. A new SPS for the base view starts a new
    /// sequence: everything decoded so far is output first.
    fn activate_sps(&mut self, layer: usize, sps: &Arc<Sps>) -> Result<(), DecodeError> {
        let changed = self.layers[layer]
            .active_sps
            .as_ref()
            .map_or(true, |active| **active != **sps);
        if !changed {
            return Ok(());
        }

        debug!(
            "Activating SPS {} (profile {}) for layer {}",
            sps.seq_parameter_set_id, sps.profile_idc, layer
        );

        if layer == 0 {
            self.drain_layers();
            self.backend.new_sequence(sps)?;

            let visible_rect = sps.visible_rectangle();
            let info = StreamInfo {
                profile_idc: sps.profile_idc,
                coded_resolution: Resolution {
                    width: sps.width(),
                    height: sps.height(),
                },
                display_resolution: Resolution {
                    width: visible_rect.max.x - visible_rect.min.x,
                    height: visible_rect.max.y - visible_rect.min.y,
                },
                min_num_frames: sps.max_dpb_frames(),
                interlaced: !sps.frame_mbs_only_flag,
            };
            self.stream_info = Some(info.clone());
            self.events.push(DecoderEvent::FormatChanged(info));
        }

        let dpb = &mut self.layers[layer].dpb;
        dpb.set_limits(sps.max_dpb_frames(), sps.max_num_order_frames() as usize);
        dpb.set_interlaced(!sps.frame_mbs_only_flag);
        self.layers[layer].active_sps = Some(Arc::clone(sps));

        Ok(())
    }

    fn begin_picture(
        &mut self,
        slice: &Slice,
    ) -> Result<CurrentPicState<B::Handle>, DecodeError> {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu.header;
        let layer = usize::from(nalu_hdr.is_non_base_view());
        let timestamp = slice.nalu.timestamp;

        if layer == 0 {
            self.au_no += 1;
        }
        for l in &mut self.layers {
            l.dpb.set_current_au(self.au_no);
        }

        let subset_sps = if layer > 0 {
            let sps_id = slice.pps.seq_parameter_set_id;
            let subset_sps = self
                .parser
                .get_subset_sps(sps_id)
                .ok_or(UnknownParameterSet::SubsetSps(sps_id))?;
            Some(Arc::clone(subset_sps))
        } else {
            None
        };

        self.activate_sps(layer, &slice.sps)?;

        let sps = Arc::clone(&slice.sps);
        let max_frame_num =
            i32::try_from(sps.max_frame_num()).context("max_frame_num out of range")?;
        let frame_num = i32::from(hdr.frame_num);

        if nalu_hdr.idr_pic_flag {
            self.layers[layer].poc.start_idr();
        }

        let first_field = self.layers[layer].dpb.find_first_field(frame_num, hdr.field());
        if first_field.is_none() {
            self.layers[layer].dpb.seal_last_field();

            let prev_ref_frame_num = self.layers[layer].poc.prev_ref_frame_num();
            if !nalu_hdr.idr_pic_flag
                && frame_num != prev_ref_frame_num
                && frame_num != (prev_ref_frame_num + 1) % max_frame_num
            {
                self.handle_frame_num_gap(layer, &sps, frame_num, nalu_hdr.view_id(), timestamp)?;
            }
        }

        let mut pic = PictureData::new_from_slice(slice, timestamp);
        pic.dec_no = self.next_dec_no();
        pic.au_no = self.au_no;
        pic.set_second_field(first_field.is_some());

        self.layers[layer].poc.compute(&mut pic, &sps)?;

        debug!(
            "Decode picture POC {} frame_num {} view {} ({:?}), dec_no {}",
            pic.pic_order_cnt, pic.frame_num, pic.view_id, pic.field, pic.dec_no
        );

        if pic.is_idr() && first_field.is_none() {
            if hdr.dec_ref_pic_marking.no_output_of_prior_pics_flag {
                self.layers[layer].dpb.clear();
            } else {
                let outputs = self.layers[layer].dpb.drain();
                self.queue_outputs(outputs);
            }
        }

        let dpb = &mut self.layers[layer].dpb;
        dpb.update_pic_nums(frame_num, max_frame_num, pic.field);
        let ref_pic_lists = dpb.build_ref_pic_lists(&pic);

        let first_handle = first_field
            .and_then(|slot| self.layers[layer].dpb.store(slot))
            .and_then(|fs| fs.handle())
            .cloned();
        let handle = match &first_handle {
            Some(first_handle) => self
                .backend
                .new_field_picture(&pic, timestamp, first_handle)?,
            None => self.backend.new_picture(&pic, timestamp)?,
        };

        let voidx = subset_sps
            .as_ref()
            .and_then(|subset| subset.mvc.view_order_idx(pic.view_id))
            .unwrap_or_default();

        Ok(CurrentPicState {
            pic,
            handle,
            layer,
            first_field,
            ref_pic_lists,
            sps,
            subset_sps,
            voidx: voidx as u16,
        })
    }

    /// Decoding process for gaps in frame_num (8.2.5.2).
    fn handle_frame_num_gap(
        &mut self,
        layer: usize,
        sps: &Sps,
        frame_num: i32,
        view_id: u16,
        timestamp: u64,
    ) -> Result<(), DecodeError> {
        if self.layers[layer].dpb.is_empty() {
            return Ok(());
        }

        let prev_ref_frame_num = self.layers[layer].poc.prev_ref_frame_num();

        if !sps.gaps_in_frame_num_value_allowed_flag {
            self.report(
                OrderingError::FrameNumGap {
                    prev: prev_ref_frame_num,
                    frame_num,
                }
                .into(),
            );
            return Ok(());
        }

        debug!(
            "Filling frame_num gap {} -> {} in layer {}",
            prev_ref_frame_num, frame_num, layer
        );

        let max_frame_num =
            i32::try_from(sps.max_frame_num()).context("max_frame_num out of range")?;
        let max_num_ref_frames = usize::from(sps.max_num_ref_frames);

        let mut unused_short_term_frame_num = (prev_ref_frame_num + 1) % max_frame_num;
        while unused_short_term_frame_num != frame_num {
            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num, timestamp);
            pic.pic_order_cnt_type = sps.pic_order_cnt_type;
            pic.view_id = view_id;
            pic.layer_id = layer;
            pic.dec_no = self.next_dec_no();
            pic.au_no = self.au_no;

            let l = &mut self.layers[layer];
            // POC type 0 cannot be derived for frames that were never coded.
            if sps.pic_order_cnt_type != 0 {
                l.poc.compute(&mut pic, sps)?;
            }

            l.dpb
                .update_pic_nums(unused_short_term_frame_num, max_frame_num, Field::Frame);
            l.dpb
                .sliding_window_marking(&mut pic, max_num_ref_frames, None)?;

            if sps.pic_order_cnt_type != 0 {
                l.poc.update_after_ref(&pic);
                l.poc.update_after_pic(&pic);
            }

            let insertion = l
                .dpb
                .insert_picture(pic, None, None)
                .map_err(|e| store_error(layer, e))?;
            self.handle_insertion(layer, insertion);

            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    fn finish_current(&mut self) -> Result<(), DecodeError> {
        self.old_slice = None;

        let Some(cur) = self.cur_pic.take() else {
            return Ok(());
        };

        match self.finish_picture(cur) {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.report(e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn finish_picture(&mut self, cur: CurrentPicState<B::Handle>) -> Result<(), DecodeError> {
        let CurrentPicState {
            mut pic,
            handle,
            layer,
            first_field,
            sps,
            ..
        } = cur;

        debug!(
            "Finishing picture POC {} of view {}",
            pic.pic_order_cnt, pic.view_id
        );

        self.backend.submit_picture(&handle)?;
        if self.config.blocking_mode == BlockingMode::Blocking {
            self.pool.wait_idle().map_err(BackendError::Other)?;
        }

        if pic.is_ref() {
            let first_field = first_field.map(|slot| PicId {
                slot,
                second: false,
            });
            let marking = self.layers[layer].dpb.mark_references(
                &mut pic,
                usize::from(sps.max_num_ref_frames),
                first_field,
            );
            if let Err(e) = marking {
                self.report(e.into());
            }

            self.layers[layer].poc.update_after_ref(&pic);
        }
        self.layers[layer].poc.update_after_pic(&pic);

        let insertion = self.layers[layer]
            .dpb
            .insert_picture(pic, Some(handle), first_field)
            .map_err(|e| store_error(layer, e))?;
        self.handle_insertion(layer, insertion);

        Ok(())
    }

    fn handle_slice(
        &mut self,
        cur: &CurrentPicState<B::Handle>,
        slice: Slice,
    ) -> Result<(), DecodeError> {
        let (list0, list1) = self.create_ref_pic_lists(cur, &slice.header)?;

        let field = cur.pic.field;
        let ref_pic_list0 = list0
            .into_iter()
            .filter_map(|r| self.ref_pic_entry(r, field))
            .collect();
        let ref_pic_list1 = list1
            .into_iter()
            .filter_map(|r| self.ref_pic_entry(r, field))
            .collect();

        let mut dpb = self.layers[cur.layer].dpb.dpb_info();
        for layer in self.layers.iter().take(cur.layer) {
            dpb.extend(layer.dpb.inter_view_info());
        }
        if let Some(subset) = &cur.subset_sps {
            for info in &mut dpb {
                info.voidx = subset
                    .mvc
                    .view_order_idx(info.view_id)
                    .unwrap_or_default() as u16;
            }
        }

        let Slice {
            header, nalu, pps, ..
        } = slice;

        let descriptor = SliceDescriptor {
            sps: Arc::clone(&cur.sps),
            subset_sps: cur.subset_sps.clone(),
            scaling_matrices: pps.scaling_matrices(),
            pps,
            slice_data_bit_offset: header.header_bit_size,
            header,
            target: cur.handle.clone(),
            pic_order_cnt: cur.pic.pic_order_cnt,
            top_field_order_cnt: cur.pic.top_field_order_cnt,
            bottom_field_order_cnt: cur.pic.bottom_field_order_cnt,
            frame_num: cur.pic.frame_num,
            structure: field,
            view_id: cur.pic.view_id,
            voidx: cur.voidx,
            inter_view_flag: cur.pic.inter_view_flag,
            anchor_pic_flag: cur.pic.anchor_pic_flag,
            is_reference: cur.pic.is_ref(),
            is_idr: cur.pic.is_idr(),
            ref_pic_list0,
            ref_pic_list1,
            dpb,
            stream_offset: nalu.offset,
            timestamp: nalu.timestamp,
            data: nalu.data,
        };

        let task = self
            .pool
            .acquire(descriptor)
            .map_err(BackendError::Other)?;
        self.backend.decode_slice(task)?;

        Ok(())
    }

    fn ref_pic_entry(&self, r: RefPic, field: Field) -> Option<RefPicEntry<B::Handle>> {
        let dpb = &self.layers[r.layer].dpb;
        let fs = dpb.store(r.id.slot)?;
        let pic = dpb.get(r.id)?;
        let long_term = matches!(pic.reference(), Reference::LongTerm);

        let (structure, pic_order_cnt) = match field {
            Field::Frame => (Field::Frame, fs.pic_order_cnt()),
            _ => (pic.field, pic.pic_order_cnt),
        };

        Some(RefPicEntry {
            handle: fs.handle().cloned(),
            layer: r.layer,
            id: r.id,
            structure,
            pic_order_cnt,
            top_field_order_cnt: fs
                .field(Field::Top)
                .map_or(pic.top_field_order_cnt, |p| p.top_field_order_cnt),
            bottom_field_order_cnt: fs
                .field(Field::Bottom)
                .map_or(pic.bottom_field_order_cnt, |p| p.bottom_field_order_cnt),
            long_term,
            frame_idx: if long_term {
                pic.long_term_frame_idx
            } else {
                pic.frame_num_wrap
            },
            pic_num: if long_term {
                pic.long_term_pic_num
            } else {
                pic.pic_num
            },
            view_id: pic.view_id,
            nonexisting: pic.nonexisting,
        })
    }

    fn find_inter_view_ref(&self, cur: &CurrentPicState<B::Handle>, view_id: u16) -> Option<RefPic> {
        self.layers.iter().enumerate().find_map(|(layer, l)| {
            l.dpb
                .find_inter_view_ref(view_id, cur.pic.au_no, cur.pic.field)
                .map(|id| RefPic { layer, id })
        })
    }

    fn create_ref_pic_lists(
        &self,
        cur: &CurrentPicState<B::Handle>,
        hdr: &SliceHeader,
    ) -> anyhow::Result<(Vec<RefPic>, Vec<RefPic>)> {
        let lists = &cur.ref_pic_lists;

        if hdr.slice_type.is_p() || hdr.slice_type.is_sp() {
            let list0 = self.init_ref_pic_list(cur, hdr, 0, &lists.ref_pic_list_p0);
            let list0 = self.modify_ref_pic_list(cur, hdr, 0, list0)?;
            Ok((list0, vec![]))
        } else if hdr.slice_type.is_b() {
            let list0 = self.init_ref_pic_list(cur, hdr, 0, &lists.ref_pic_list_b0);
            let list0 = self.modify_ref_pic_list(cur, hdr, 0, list0)?;
            let list1 = self.init_ref_pic_list(cur, hdr, 1, &lists.ref_pic_list_b1);
            let list1 = self.modify_ref_pic_list(cur, hdr, 1, list1)?;
            Ok((list0, list1))
        } else {
            Ok((vec![], vec![]))
        }
    }

    /// Initial list `list_idx` of the slice: the temporal references truncated to the
    /// number of active entries, followed by the inter-view references of the view.
    fn init_ref_pic_list(
        &self,
        cur: &CurrentPicState<B::Handle>,
        hdr: &SliceHeader,
        list_idx: usize,
        initial: &[PicId],
    ) -> Vec<RefPic> {
        let num_active = Self::num_active(hdr, list_idx);

        let mut list = initial
            .iter()
            .take(num_active)
            .map(|&id| RefPic {
                layer: cur.layer,
                id,
            })
            .collect::<Vec<_>>();

        let view = cur
            .subset_sps
            .as_ref()
            .and_then(|subset| subset.mvc.view(cur.pic.view_id));
        if let Some(view) = view {
            for &view_id in view.refs(cur.pic.anchor_pic_flag, list_idx) {
                match self.find_inter_view_ref(cur, view_id) {
                    Some(r) => list.push(r),
                    None => debug!("No inter-view reference from view {}", view_id),
                }
            }
        }

        list
    }

    fn num_active(hdr: &SliceHeader, list_idx: usize) -> usize {
        let minus1 = match list_idx {
            0 => hdr.num_ref_idx_l0_active_minus1,
            _ => hdr.num_ref_idx_l1_active_minus1,
        };

        usize::from(minus1) + 1
    }

    /// Modification process for reference picture lists (8.2.4.3 and H.8.2.2).
    fn modify_ref_pic_list(
        &self,
        cur: &CurrentPicState<B::Handle>,
        hdr: &SliceHeader,
        list_idx: usize,
        mut ref_pic_list_x: Vec<RefPic>,
    ) -> anyhow::Result<Vec<RefPic>> {
        let (modification_flag, rplm) = match list_idx {
            0 => (
                hdr.ref_pic_list_modification_flag_l0,
                &hdr.ref_pic_list_modification_l0,
            ),
            _ => (
                hdr.ref_pic_list_modification_flag_l1,
                &hdr.ref_pic_list_modification_l1,
            ),
        };

        if modification_flag {
            let mut pic_num_lx_pred = cur.pic.pic_num;
            let mut pic_view_idx_lx_pred = -1;
            let mut ref_idx_lx = 0;

            for modification in rplm {
                let entry = match modification.modification_of_pic_nums_idc {
                    0 | 1 => self.short_term_pic(cur, hdr, modification, &mut pic_num_lx_pred)?,
                    2 => self.long_term_pic(cur, modification)?,
                    3 => break,
                    4 | 5 => self.inter_view_pic(
                        cur,
                        list_idx,
                        modification,
                        &mut pic_view_idx_lx_pred,
                    )?,
                    idc => anyhow::bail!("unexpected modification_of_pic_nums_idc {}", idc),
                };

                place_ref_pic(&mut ref_pic_list_x, &mut ref_idx_lx, entry);
            }
        }

        ref_pic_list_x.truncate(Self::num_active(hdr, list_idx));

        Ok(ref_pic_list_x)
    }

    /// 8.2.4.3.1
    fn short_term_pic(
        &self,
        cur: &CurrentPicState<B::Handle>,
        hdr: &SliceHeader,
        rplm: &RefPicListModification,
        pic_num_lx_pred: &mut i32,
    ) -> anyhow::Result<RefPic> {
        let abs_diff_pic_num = i32::try_from(rplm.abs_diff_pic_num_minus1)? + 1;
        let max_pic_num = i32::try_from(hdr.max_pic_num)?;

        let pic_num_lx_no_wrap = if rplm.modification_of_pic_nums_idc == 0 {
            if *pic_num_lx_pred - abs_diff_pic_num < 0 {
                *pic_num_lx_pred - abs_diff_pic_num + max_pic_num
            } else {
                *pic_num_lx_pred - abs_diff_pic_num
            }
        } else if *pic_num_lx_pred + abs_diff_pic_num >= max_pic_num {
            *pic_num_lx_pred + abs_diff_pic_num - max_pic_num
        } else {
            *pic_num_lx_pred + abs_diff_pic_num
        };

        *pic_num_lx_pred = pic_num_lx_no_wrap;

        let pic_num_lx = if pic_num_lx_no_wrap > cur.pic.pic_num {
            pic_num_lx_no_wrap - max_pic_num
        } else {
            pic_num_lx_no_wrap
        };

        let id = self.layers[cur.layer]
            .dpb
            .find_short_term_with_pic_num(pic_num_lx)
            .with_context(|| format!("No ShortTerm reference found with pic_num {}", pic_num_lx))?;

        Ok(RefPic {
            layer: cur.layer,
            id,
        })
    }

    /// 8.2.4.3.2
    fn long_term_pic(
        &self,
        cur: &CurrentPicState<B::Handle>,
        rplm: &RefPicListModification,
    ) -> anyhow::Result<RefPic> {
        let long_term_pic_num = i32::try_from(rplm.long_term_pic_num)?;

        let id = self.layers[cur.layer]
            .dpb
            .find_long_term_with_long_term_pic_num(long_term_pic_num)
            .with_context(|| {
                format!(
                    "No LongTerm reference found with long_term_pic_num {}",
                    long_term_pic_num
                )
            })?;

        Ok(RefPic {
            layer: cur.layer,
            id,
        })
    }

    /// H.8.2.2.3
    fn inter_view_pic(
        &self,
        cur: &CurrentPicState<B::Handle>,
        list_idx: usize,
        rplm: &RefPicListModification,
        pic_view_idx_lx_pred: &mut i32,
    ) -> anyhow::Result<RefPic> {
        let refs = cur
            .subset_sps
            .as_ref()
            .and_then(|subset| subset.mvc.view(cur.pic.view_id))
            .map(|view| view.refs(cur.pic.anchor_pic_flag, list_idx))
            .context("Inter-view modification outside of a non-base view")?;

        let num_refs = i32::try_from(refs.len())?;
        let abs_diff_view_idx = i32::try_from(rplm.abs_diff_view_idx_minus1)? + 1;

        let pic_view_idx_lx = if rplm.modification_of_pic_nums_idc == 4 {
            let idx = *pic_view_idx_lx_pred - abs_diff_view_idx;
            if idx < 0 {
                idx + num_refs
            } else {
                idx
            }
        } else {
            let idx = *pic_view_idx_lx_pred + abs_diff_view_idx;
            if idx >= num_refs {
                idx - num_refs
            } else {
                idx
            }
        };

        *pic_view_idx_lx_pred = pic_view_idx_lx;

        let view_id = usize::try_from(pic_view_idx_lx)
            .ok()
            .and_then(|idx| refs.get(idx))
            .with_context(|| format!("Inter-view index {} out of range", pic_view_idx_lx))?;

        self.find_inter_view_ref(cur, *view_id)
            .with_context(|| format!("No inter-view reference from view {}", view_id))
    }
}

#[cfg(test)]
mod tests {
    use super::dummy::Backend;
    use super::*;
    use crate::codec::h264::nalu_writer::pps_nalu;
    use crate::codec::h264::nalu_writer::prefix_nalu;
    use crate::codec::h264::nalu_writer::recovery_point_payload;
    use crate::codec::h264::nalu_writer::sei_nalu;
    use crate::codec::h264::nalu_writer::slice_nalu;
    use crate::codec::h264::nalu_writer::sps_nalu;
    use crate::codec::h264::nalu_writer::subset_sps_nalu;
    use crate::codec::h264::nalu_writer::PpsSyntax;
    use crate::codec::h264::nalu_writer::SliceSyntax;
    use crate::codec::h264::nalu_writer::SpsSyntax;
    use crate::codec::h264::nalu_writer::ViewSyntax;
    use crate::codec::h264::parser::SliceType;
    use crate::codec::h264::parser::SEI_RECOVERY_POINT;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn new_decoder(config: DecoderConfig) -> H264Decoder<Backend> {
        init_logger();
        H264Decoder::new(Backend::default(), config)
    }

    /// Decodes `units` in one go, then flushes and collects every event.
    fn run(decoder: &mut H264Decoder<Backend>, units: &[Vec<u8>]) -> Vec<DecoderEvent<u32>> {
        decoder.decode(0, &units.concat()).unwrap();
        decoder.flush().unwrap();
        std::iter::from_fn(|| decoder.next_event()).collect()
    }

    fn output_pocs(events: &[DecoderEvent<u32>]) -> Vec<(u16, i32)> {
        events
            .iter()
            .filter_map(|e| match e {
                DecoderEvent::FrameReady(pic) => Some((pic.view_id, pic.pic_order_cnt)),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[DecoderEvent<u32>]) -> Vec<&DecodeError> {
        events
            .iter()
            .filter_map(|e| match e {
                DecoderEvent::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn idr(poc_lsb: u32) -> SliceSyntax {
        SliceSyntax {
            nal_ref_idc: 3,
            idr: true,
            slice_type: 2,
            poc_lsb,
            ..Default::default()
        }
    }

    fn p(frame_num: u32, poc_lsb: u32) -> SliceSyntax {
        SliceSyntax {
            nal_ref_idc: 2,
            slice_type: 0,
            frame_num,
            poc_lsb,
            ..Default::default()
        }
    }

    fn b(frame_num: u32, poc_lsb: u32) -> SliceSyntax {
        SliceSyntax {
            nal_ref_idc: 0,
            slice_type: 1,
            frame_num,
            poc_lsb,
            ..Default::default()
        }
    }

    #[test]
    fn old_slice_detects_first_slice_of_picture() {
        let base = OldSlice {
            frame_num: 1,
            nal_ref_idc: 2,
            pic_order_cnt_lsb: 4,
            ..Default::default()
        };

        assert!(!base.is_new_picture(&base.clone()));
        assert!(!base.is_new_picture(&OldSlice {
            nal_ref_idc: 1,
            ..base.clone()
        }));
        assert!(base.is_new_picture(&OldSlice {
            nal_ref_idc: 0,
            ..base.clone()
        }));
        assert!(base.is_new_picture(&OldSlice {
            frame_num: 2,
            ..base.clone()
        }));
        assert!(base.is_new_picture(&OldSlice {
            pic_order_cnt_lsb: 6,
            ..base.clone()
        }));
        assert!(base.is_new_picture(&OldSlice {
            view_id: 1,
            ..base.clone()
        }));

        let idr = OldSlice {
            idr_flag: true,
            ..base.clone()
        };
        assert!(idr.is_new_picture(&OldSlice {
            idr_pic_id: 1,
            ..idr.clone()
        }));

        let redundant = OldSlice {
            redundant_pic_cnt: 1,
            ..base.clone()
        };
        assert!(redundant.is_new_picture(&base));

        // Bottom field flag only matters for fields.
        assert!(!base.is_new_picture(&OldSlice {
            bottom_field_flag: true,
            ..base.clone()
        }));
        let top = OldSlice {
            field_pic_flag: true,
            ..base.clone()
        };
        assert!(top.is_new_picture(&OldSlice {
            bottom_field_flag: true,
            ..top.clone()
        }));
    }

    #[test]
    fn place_ref_pic_moves_entry() {
        let pic = |slot| RefPic {
            layer: 0,
            id: PicId {
                slot,
                second: false,
            },
        };

        let mut list = vec![pic(2), pic(1), pic(0)];
        let mut ref_idx = 0;
        place_ref_pic(&mut list, &mut ref_idx, pic(1));
        assert_eq!(list, vec![pic(1), pic(2), pic(0)]);
        assert_eq!(ref_idx, 1);

        place_ref_pic(&mut list, &mut ref_idx, pic(0));
        assert_eq!(list, vec![pic(1), pic(0), pic(2)]);

        // An entry missing from the list is inserted, pushing the others back.
        place_ref_pic(&mut list, &mut ref_idx, pic(5));
        assert_eq!(list, vec![pic(1), pic(0), pic(5), pic(2)]);
    }

    #[test]
    fn i_frame_descriptor() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[sps_nalu(&sps), pps_nalu(&pps), slice_nalu(&sps, &pps, &idr(0))],
        );

        assert!(matches!(
            &events[0],
            DecoderEvent::FormatChanged(info) if info.coded_resolution == Resolution { width: 176, height: 144 }
        ));
        assert_eq!(output_pocs(&events), vec![(0, 0)]);
        assert!(errors(&events).is_empty());

        let backend = decoder.backend();
        assert_eq!(backend.sequences.len(), 1);
        assert_eq!(backend.slices.len(), 1);
        assert_eq!(backend.submitted, vec![1]);

        let desc = &backend.slices[0];
        assert_eq!(desc.sps.width(), 176);
        assert_eq!(desc.sps.height(), 144);
        assert_eq!(desc.header.slice_type, SliceType::I);
        assert_eq!(desc.target, 1);
        assert!(desc.is_idr);
        assert!(desc.is_reference);
        assert!(desc.ref_pic_list0.is_empty());
        assert!(desc.ref_pic_list1.is_empty());
        assert!(desc.dpb.is_empty());
        assert_eq!(desc.data[0] & 0x1f, 5);
    }

    #[test]
    fn frame_num_gap_fills_non_existing_frames() {
        let sps = SpsSyntax {
            gaps_allowed: true,
            ..Default::default()
        };
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(&sps, &pps, &p(3, 6)),
            ],
        );

        assert!(errors(&events).is_empty());
        // Non-existing frames are never output.
        assert_eq!(output_pocs(&events), vec![(0, 0), (0, 6)]);

        let desc = &decoder.backend().slices[1];
        let mut non_existing = desc
            .dpb
            .iter()
            .filter(|info| info.nonexisting)
            .map(|info| info.frame_idx)
            .collect::<Vec<_>>();
        non_existing.sort();
        assert_eq!(non_existing, vec![1, 2]);

        // The closest reference in decoding order is a non-existing frame.
        assert_eq!(desc.ref_pic_list0.len(), 1);
        assert!(desc.ref_pic_list0[0].nonexisting);
        assert_eq!(desc.ref_pic_list0[0].pic_num, 2);
        assert!(desc.ref_pic_list0[0].handle.is_none());
    }

    #[test]
    fn frame_num_gap_not_allowed_is_reported() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(&sps, &pps, &p(3, 6)),
            ],
        );

        assert!(matches!(
            errors(&events)[..],
            [DecodeError::NonConformantOrdering(OrderingError::FrameNumGap {
                prev: 0,
                frame_num: 3
            })]
        ));
        assert_eq!(output_pocs(&events), vec![(0, 0), (0, 6)]);
    }

    #[test]
    fn b_frames_are_reordered() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(&sps, &pps, &p(1, 6)),
                slice_nalu(&sps, &pps, &b(2, 2)),
                slice_nalu(&sps, &pps, &b(2, 4)),
            ],
        );

        assert!(errors(&events).is_empty());
        assert_eq!(output_pocs(&events), vec![(0, 0), (0, 2), (0, 4), (0, 6)]);

        // Both B pictures predict from the I picture (before) and the P picture (after).
        let desc = &decoder.backend().slices[2];
        assert_eq!(desc.header.slice_type, SliceType::B);
        assert_eq!(desc.ref_pic_list0[0].pic_order_cnt, 0);
        assert_eq!(desc.ref_pic_list1[0].pic_order_cnt, 6);
    }

    #[test]
    fn bitstream_restriction_bounds_reordering() {
        let sps = SpsSyntax {
            reorder: Some((0, 4)),
            ..Default::default()
        };
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let units = [
            sps_nalu(&sps),
            pps_nalu(&pps),
            slice_nalu(&sps, &pps, &idr(0)),
            slice_nalu(&sps, &pps, &p(1, 2)),
            slice_nalu(&sps, &pps, &p(2, 4)),
            slice_nalu(&sps, &pps, &p(3, 6)),
        ];
        decoder.decode(0, &units.concat()).unwrap();

        // Without reordering pictures leave as soon as they are stored. A picture is only
        // complete once the first slice of the next one is extracted, and the last unit
        // stays in the extractor until the stream ends.
        let events = std::iter::from_fn(|| decoder.next_event()).collect::<Vec<_>>();
        assert_eq!(output_pocs(&events), vec![(0, 0), (0, 2)]);
    }

    #[test]
    fn mmco_5_outputs_previous_pictures() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(&sps, &pps, &p(1, 8)),
                slice_nalu(
                    &sps,
                    &pps,
                    &SliceSyntax {
                        mmco: vec![(5, 0, 0)],
                        ..p(2, 12)
                    },
                ),
                slice_nalu(&sps, &pps, &p(1, 4)),
            ],
        );

        assert!(errors(&events).is_empty());
        // The memory_management_control_operation 5 picture restarts POC at 0.
        assert_eq!(
            output_pocs(&events),
            vec![(0, 0), (0, 8), (0, 0), (0, 4)]
        );
    }

    #[test]
    fn missing_pps_drops_until_idr() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let missing = PpsSyntax {
            id: 1,
            ..Default::default()
        };
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(
                    &sps,
                    &missing,
                    &SliceSyntax {
                        pps_id: 1,
                        ..idr(0)
                    },
                ),
                slice_nalu(&sps, &pps, &p(1, 2)),
                slice_nalu(
                    &sps,
                    &pps,
                    &SliceSyntax {
                        idr_pic_id: 1,
                        ..idr(0)
                    },
                ),
            ],
        );

        assert!(matches!(
            errors(&events)[..],
            [DecodeError::UnknownParameterSetId(UnknownParameterSet::Pps(1))]
        ));
        assert_eq!(output_pocs(&events), vec![(0, 0)]);
        assert_eq!(decoder.backend().slices.len(), 1);
    }

    #[test]
    fn recovery_point_ends_skipping() {
        let _ = env_logger::builder().is_test(true).try_init();

        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let missing = PpsSyntax {
            id: 1,
            ..Default::default()
        };
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(
                    &sps,
                    &missing,
                    &SliceSyntax {
                        pps_id: 1,
                        ..idr(0)
                    },
                ),
                slice_nalu(&sps, &pps, &p(1, 2)),
                sei_nalu(&[(SEI_RECOVERY_POINT, recovery_point_payload(0, false))]),
                slice_nalu(
                    &sps,
                    &pps,
                    &SliceSyntax {
                        slice_type: 2,
                        ..p(2, 4)
                    },
                ),
                slice_nalu(&sps, &pps, &p(3, 6)),
            ],
        );

        assert!(matches!(
            errors(&events)[..],
            [DecodeError::UnknownParameterSetId(UnknownParameterSet::Pps(1))]
        ));
        // Only the P picture before the recovery point is skipped.
        assert_eq!(output_pocs(&events), vec![(0, 4), (0, 6)]);

        let slices = &decoder.backend().slices;
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1].ref_pic_list0[0].pic_order_cnt, 4);
    }

    #[test]
    fn missing_subset_sps_drops_until_idr() {
        let _ = env_logger::builder().is_test(true).try_init();

        let sps = SpsSyntax::default();
        let subset_sps = SpsSyntax {
            profile_idc: 118,
            ..Default::default()
        };
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let non_base = |slice: SliceSyntax, anchor| SliceSyntax {
            view: Some((1, anchor, true)),
            ..slice
        };

        // No subset SPS was ever sent for the second view.
        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(
                    &subset_sps,
                    &pps,
                    &non_base(
                        SliceSyntax {
                            slice_type: 0,
                            ..idr(0)
                        },
                        true,
                    ),
                ),
                slice_nalu(&sps, &pps, &p(1, 2)),
                slice_nalu(&subset_sps, &pps, &non_base(p(1, 2), false)),
                slice_nalu(
                    &sps,
                    &pps,
                    &SliceSyntax {
                        idr_pic_id: 1,
                        ..idr(0)
                    },
                ),
            ],
        );

        assert!(matches!(
            errors(&events)[..],
            [DecodeError::UnknownParameterSetId(UnknownParameterSet::SubsetSps(0))]
        ));
        // The first access unit and the P picture are dropped, decoding resumes at the IDR.
        assert_eq!(output_pocs(&events), vec![(0, 0)]);
        let slices = &decoder.backend().slices;
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1].header.idr_pic_id, 1);
    }

    #[test]
    fn short_term_modification_reorders_list_0() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let with_mods = |frame_num, poc_lsb, mods_l0| SliceSyntax {
            num_ref_idx_override: Some((2, 0)),
            mods_l0,
            ..p(frame_num, poc_lsb)
        };

        run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                pps_nalu(&pps),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(&sps, &pps, &p(1, 2)),
                slice_nalu(&sps, &pps, &p(2, 4)),
                // abs_diff_pic_num_minus1 = 0 picks the closest reference, which is
                // already first.
                slice_nalu(&sps, &pps, &with_mods(3, 6, vec![(0, 0)])),
                // abs_diff_pic_num_minus1 = 1 brings frame_num 2 to the front.
                slice_nalu(&sps, &pps, &with_mods(4, 8, vec![(0, 1)])),
            ],
        );

        let list_pocs = |desc: &SliceDescriptor<u32>| {
            desc.ref_pic_list0
                .iter()
                .map(|r| r.pic_order_cnt)
                .collect::<Vec<_>>()
        };

        let slices = &decoder.backend().slices;
        assert_eq!(list_pocs(&slices[3]), vec![4, 2, 0]);
        assert_eq!(list_pocs(&slices[4]), vec![4, 6, 2]);
    }

    #[test]
    fn mvc_inter_view_references_follow_temporal_ones() {
        let sps = SpsSyntax::default();
        let subset_sps = SpsSyntax {
            profile_idc: 118,
            ..Default::default()
        };
        let views = [
            ViewSyntax {
                view_id: 0,
                ..Default::default()
            },
            ViewSyntax {
                view_id: 1,
                anchor_refs_l0: vec![0],
                non_anchor_refs_l0: vec![0],
            },
        ];
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                subset_sps_nalu(&subset_sps, &views),
                pps_nalu(&pps),
                // Anchor access unit.
                prefix_nalu(3, true, true, true),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(
                    &subset_sps,
                    &pps,
                    &SliceSyntax {
                        slice_type: 0,
                        view: Some((1, true, true)),
                        ..idr(0)
                    },
                ),
                // Non-anchor access unit.
                prefix_nalu(2, false, false, true),
                slice_nalu(&sps, &pps, &p(1, 2)),
                slice_nalu(
                    &subset_sps,
                    &pps,
                    &SliceSyntax {
                        num_ref_idx_override: Some((1, 0)),
                        view: Some((1, false, true)),
                        ..p(1, 2)
                    },
                ),
            ],
        );

        assert!(errors(&events).is_empty());
        let mut outputs = output_pocs(&events);
        outputs.sort();
        assert_eq!(outputs, vec![(0, 0), (0, 2), (1, 0), (1, 2)]);

        let slices = &decoder.backend().slices;
        assert_eq!(slices.len(), 4);

        let anchor = &slices[1];
        assert_eq!(anchor.view_id, 1);
        assert_eq!(anchor.voidx, 1);
        assert!(anchor.subset_sps.is_some());
        assert_eq!(anchor.ref_pic_list0.len(), 1);
        assert_eq!(anchor.ref_pic_list0[0].view_id, 0);
        assert_eq!(anchor.ref_pic_list0[0].layer, 0);
        assert_eq!(anchor.ref_pic_list0[0].handle, Some(slices[0].target));

        let non_anchor = &slices[3];
        let refs = non_anchor
            .ref_pic_list0
            .iter()
            .map(|r| (r.view_id, r.layer, r.pic_order_cnt))
            .collect::<Vec<_>>();
        assert_eq!(refs, vec![(1, 1, 0), (0, 0, 2)]);
        assert!(non_anchor.dpb.iter().any(|info| info.view_id == 0 && info.voidx == 0));
        assert!(non_anchor.dpb.iter().any(|info| info.view_id == 1 && info.voidx == 1));
    }

    #[test]
    fn mvc_disabled_decodes_base_view_only() {
        let sps = SpsSyntax::default();
        let subset_sps = SpsSyntax {
            profile_idc: 118,
            ..Default::default()
        };
        let views = [
            ViewSyntax::default(),
            ViewSyntax {
                view_id: 1,
                anchor_refs_l0: vec![0],
                non_anchor_refs_l0: vec![0],
            },
        ];
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(DecoderConfig {
            enable_mvc: false,
            ..Default::default()
        });

        let events = run(
            &mut decoder,
            &[
                sps_nalu(&sps),
                subset_sps_nalu(&subset_sps, &views),
                pps_nalu(&pps),
                prefix_nalu(3, true, true, true),
                slice_nalu(&sps, &pps, &idr(0)),
                slice_nalu(
                    &subset_sps,
                    &pps,
                    &SliceSyntax {
                        slice_type: 0,
                        view: Some((1, true, true)),
                        ..idr(0)
                    },
                ),
            ],
        );

        assert_eq!(output_pocs(&events), vec![(0, 0)]);
        assert_eq!(decoder.backend().slices.len(), 1);
    }

    #[test]
    fn pipeline_stays_bounded() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(DecoderConfig {
            blocking_mode: BlockingMode::NonBlocking,
            ..Default::default()
        });

        decoder.decode(0, &sps_nalu(&sps)).unwrap();
        decoder.decode(0, &pps_nalu(&pps)).unwrap();
        decoder
            .decode(0, &slice_nalu(&sps, &pps, &idr(0)))
            .unwrap();
        for frame_num in 1..8 {
            // Two slices per picture.
            let first = p(frame_num, frame_num * 2);
            let second = SliceSyntax {
                first_mb: 50,
                ..first.clone()
            };
            decoder
                .decode(u64::from(frame_num), &slice_nalu(&sps, &pps, &first))
                .unwrap();
            assert!(decoder.tasks_in_flight() <= MAX_TASK_SIZE);
            decoder
                .decode(u64::from(frame_num), &slice_nalu(&sps, &pps, &second))
                .unwrap();
            assert!(decoder.tasks_in_flight() <= MAX_TASK_SIZE);
        }
        decoder.flush().unwrap();

        assert_eq!(decoder.tasks_in_flight(), 0);
        assert_eq!(decoder.backend().slices.len(), 15);
        assert_eq!(decoder.backend().submitted.len(), 8);

        let events = std::iter::from_fn(|| decoder.next_event()).collect::<Vec<_>>();
        let timestamps = events
            .iter()
            .filter_map(|e| match e {
                DecoderEvent::FrameReady(pic) => Some(pic.timestamp),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(timestamps, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn oversized_nalu_is_fatal() {
        let mut decoder = new_decoder(DecoderConfig {
            max_nalu_size: 16,
            ..Default::default()
        });

        let mut stream = vec![0, 0, 0, 1, 0x06];
        stream.extend(std::iter::repeat(0xff).take(64));
        stream.extend_from_slice(&[0, 0, 0, 1, 0x09, 0x10]);

        assert!(matches!(
            decoder.decode(0, &stream),
            Err(DecodeError::NaluTooLarge(16))
        ));
    }

    #[test]
    fn decode_after_flush_fails_until_reset() {
        let sps = SpsSyntax::default();
        let pps = PpsSyntax::default();
        let mut decoder = new_decoder(Default::default());
        let units = [sps_nalu(&sps), pps_nalu(&pps), slice_nalu(&sps, &pps, &idr(0))];

        run(&mut decoder, &units);
        assert!(matches!(
            decoder.decode(0, &units[2]),
            Err(DecodeError::StreamExhausted)
        ));

        decoder.reset().unwrap();
        let events = run(&mut decoder, &units[2..]);
        // Parameter sets survive a reset.
        assert_eq!(output_pocs(&events), vec![(0, 0)]);
    }
}
