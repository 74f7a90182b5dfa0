// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp::Reverse;

use anyhow::Context;
use log::debug;
use log::trace;
use log::warn;
use thiserror::Error;

use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::RefPicMarkingInner;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

/// Location of a picture in the DPB: the frame store slot, and whether the picture is the
/// second field of that store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PicId {
    pub slot: usize,
    pub second: bool,
}

impl PicId {
    fn first(slot: usize) -> Self {
        Self {
            slot,
            second: false,
        }
    }

    /// The complementary field of this picture.
    pub fn other(self) -> Self {
        Self {
            slot: self.slot,
            second: !self.second,
        }
    }
}

pub type DpbPicRefList = Vec<PicId>;

/// All the reference picture lists used to decode a picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencePicLists {
    /// Reference picture list for P slices. Retains the same meaning as in
    /// ITU-T H.264. Points into the pictures stored in the DPB. Derived once
    /// per picture.
    pub ref_pic_list_p0: DpbPicRefList,
    /// Reference picture list 0 for B slices. Retains the same meaning as in
    /// ITU-T H.264. Points into the pictures stored in the DPB. Derived
    /// once per picture.
    pub ref_pic_list_b0: DpbPicRefList,
    /// Reference picture list 1 for B slices. Retains the same meaning as in
    /// ITU-T H.264. Points into the pictures stored in the DPB. Derived
    /// once per picture.
    pub ref_pic_list_b1: DpbPicRefList,
}

/// Storage unit of the DPB: a frame, a complementary field pair, or a single field.
///
/// In interlaced streams decoded frames are split into two fields at insertion, so marking
/// always works at field level. The backend handle is shared by both fields.
pub struct FrameStore<H> {
    /// The frame, or the first field in decoding order.
    first: PictureData,
    second: Option<PictureData>,
    /// `None` for frames inferred from a gap in `frame_num`.
    handle: Option<H>,
    /// No further field will be added to this store.
    sealed: bool,
}

impl<H> FrameStore<H> {
    pub fn first(&self) -> &PictureData {
        &self.first
    }

    pub fn second(&self) -> Option<&PictureData> {
        self.second.as_ref()
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub fn pictures(&self) -> impl Iterator<Item = &PictureData> {
        std::iter::once(&self.first).chain(self.second.iter())
    }

    fn pictures_mut(&mut self) -> impl Iterator<Item = &mut PictureData> {
        std::iter::once(&mut self.first).chain(self.second.iter_mut())
    }

    fn picture(&self, second: bool) -> Option<&PictureData> {
        if second {
            self.second.as_ref()
        } else {
            Some(&self.first)
        }
    }

    fn picture_mut(&mut self, second: bool) -> Option<&mut PictureData> {
        if second {
            self.second.as_mut()
        } else {
            Some(&mut self.first)
        }
    }

    /// 0 for empty, 1 for top field only, 2 for bottom field only, 3 for a frame or a field
    /// pair.
    pub fn is_used(&self) -> u8 {
        match (self.first.field, &self.second) {
            (Field::Frame, _) | (_, Some(_)) => 3,
            (Field::Top, None) => 1,
            (Field::Bottom, None) => 2,
        }
    }

    /// The field of the given parity, or the frame.
    pub fn field(&self, parity: Field) -> Option<&PictureData> {
        self.pictures()
            .find(|p| p.field == parity || p.field == Field::Frame)
    }

    /// POC of the frame or field pair, the lowest of its fields.
    pub fn pic_order_cnt(&self) -> i32 {
        self.pictures()
            .fold(self.first.pic_order_cnt, |poc, p| poc.min(p.pic_order_cnt))
    }

    /// POC of the fields carrying `reference`, as used to order reference frames when
    /// decoding a field.
    fn ref_pic_order_cnt(&self, reference: Reference) -> i32 {
        self.pictures()
            .filter(|p| *p.reference() == reference)
            .map(|p| p.pic_order_cnt)
            .min()
            .unwrap_or(self.first.pic_order_cnt)
    }

    fn ref_frame_num_wrap(&self) -> i32 {
        self.pictures()
            .find(|p| matches!(p.reference(), Reference::ShortTerm))
            .map_or(self.first.frame_num_wrap, |p| p.frame_num_wrap)
    }

    fn ref_long_term_frame_idx(&self) -> i32 {
        self.pictures()
            .find(|p| matches!(p.reference(), Reference::LongTerm))
            .map_or(self.first.long_term_frame_idx, |p| p.long_term_frame_idx)
    }

    pub fn is_ref(&self) -> bool {
        self.pictures().any(|p| p.is_ref())
    }

    pub fn has_reference(&self, reference: Reference) -> bool {
        self.pictures().any(|p| *p.reference() == reference)
    }

    /// Marking of the store as a whole. A frame or field pair is only a reference frame if
    /// all its fields carry the same marking.
    pub fn frame_reference(&self) -> Reference {
        if self.is_used() != 3 {
            return Reference::None;
        }

        let reference = *self.first.reference();
        if self.pictures().all(|p| *p.reference() == reference) {
            reference
        } else {
            Reference::None
        }
    }

    pub fn needed_for_output(&self) -> bool {
        self.first.needed_for_output
    }

    pub fn nonexisting(&self) -> bool {
        self.first.nonexisting
    }

    pub fn dec_no(&self) -> u64 {
        self.first.dec_no
    }

    /// Structure the store is output as.
    pub fn structure(&self) -> Field {
        if self.is_used() == 3 {
            Field::Frame
        } else {
            self.first.field
        }
    }
}

impl<H> std::fmt::Debug for FrameStore<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("first", &self.first)
            .field("second", &self.second)
            .field("has_handle", &self.handle.is_some())
            .field("sealed", &self.sealed)
            .finish()
    }
}

/// A picture leaving the DPB in output order.
#[derive(Debug)]
pub struct DpbOutput<H> {
    pub handle: Option<H>,
    pub pic_order_cnt: i32,
    pub view_id: u16,
    pub structure: Field,
    pub timestamp: u64,
    /// The POC is lower than the one of the previously output picture of the same view.
    pub out_of_order: bool,
}

/// Result of inserting a decoded picture.
#[derive(Debug)]
pub struct DpbInsertion<H> {
    pub outputs: Vec<DpbOutput<H>>,
    /// The picture could only be stored after flushing pending output or dropping a
    /// reference.
    pub overflowed: bool,
    pub id: Option<PicId>,
}

/// Per-store snapshot handed to the reconstruction engine.
#[derive(Clone, Debug)]
pub struct DpbInfo<H> {
    pub handle: Option<H>,
    pub top_poc: i32,
    pub bottom_poc: i32,
    /// `FrameNumWrap` of a short-term reference, `LongTermFrameIdx` of a long-term one.
    pub frame_idx: i32,
    /// The store holds a single field.
    pub field_flag: bool,
    pub is_long_term: bool,
    /// View order index, filled in by the decoder from the active subset SPS.
    pub voidx: u16,
    pub view_id: u16,
    pub is_used: u8,
    /// The top field (or frame) is marked as used for reference.
    pub top_valid: bool,
    pub bot_valid: bool,
    pub nonexisting: bool,
}

#[derive(Debug, Error)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
    #[error("picture is second field but first field doesn't exist")]
    NoFirstField,
}

#[derive(Debug, Error)]
pub enum MmcoError {
    #[error("could not find a ShortTerm picture to mark in the DPB")]
    NoShortTermPic,
    #[error("could not find a LongTerm picture to mark in the DPB")]
    NoLongTermPic,
    #[error("picture cannot be marked as nonexisting for MMCO=3")]
    ExpectedExisting,
    #[error("invalid long term index {0}")]
    InvalidIndex(u32),
    #[error("unknown MMCO={0}")]
    UnknownOperation(u8),
}

pub struct Dpb<H> {
    /// Frame stores, `None` for free slots.
    entries: Vec<Option<FrameStore<H>>>,
    /// The maximum number of frame stores.
    max_num_pics: usize,
    /// Indicates an upper bound for the number of frames buffers, in the
    /// decoded picture buffer (DPB), that are required for storing frames,
    /// complementary field pairs, and non-paired fields before output. It is a
    /// requirement of bitstream conformance that the maximum number of frames,
    /// complementary field pairs, or non-paired fields that precede any frame,
    /// complementary field pair, or non-paired field in the coded video
    /// sequence in decoding order and follow it in output order shall be less
    /// than or equal to max_num_reorder_frames.
    max_num_reorder_frames: usize,
    /// Whether we're decoding in interlaced mode. Frames are split into fields
    /// when inserted, and both fields are output once as a frame.
    interlaced: bool,
    /// 0 for the base view, 1 for the other views.
    layer_id: usize,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    last_output_poc: Option<i32>,
    last_output_view_id: Option<u16>,
    /// Slot of a first field still waiting for its second field.
    last_field: Option<usize>,
    /// Access unit being decoded. Inter-view pictures of this access unit are kept.
    current_au: u64,
}

impl<H> Dpb<H> {
    pub fn new(layer_id: usize) -> Self {
        Self {
            layer_id,
            ..Default::default()
        }
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    /// Set the DPB's limits in terms of maximum number or pictures.
    pub fn set_limits(&mut self, max_num_pics: usize, max_num_reorder_frames: usize) {
        self.max_num_pics = std::cmp::max(1, max_num_pics);
        self.max_num_reorder_frames = max_num_reorder_frames;
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// Get a reference to the dpb's interlaced mode.
    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    /// Set the dpb's interlaced mode.
    pub fn set_interlaced(&mut self, interlaced: bool) {
        self.interlaced = interlaced;
    }

    pub fn set_current_au(&mut self, au_no: u64) {
        self.current_au = au_no;
    }

    pub fn max_long_term_frame_idx(&self) -> MaxLongTermFrameIdx {
        self.max_long_term_frame_idx
    }

    /// Returns the occupied frame stores and their slot.
    pub fn stores(&self) -> impl Iterator<Item = (usize, &FrameStore<H>)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|fs| (slot, fs)))
    }

    pub fn store(&self, slot: usize) -> Option<&FrameStore<H>> {
        self.entries.get(slot)?.as_ref()
    }

    fn store_mut(&mut self, slot: usize) -> Option<&mut FrameStore<H>> {
        self.entries.get_mut(slot)?.as_mut()
    }

    /// Returns an iterator over all the pictures stored in the DPB.
    pub fn pictures(&self) -> impl Iterator<Item = (PicId, &PictureData)> {
        self.stores().flat_map(|(slot, fs)| {
            std::iter::once((PicId::first(slot), &fs.first)).chain(
                fs.second
                    .iter()
                    .map(move |p| (PicId { slot, second: true }, p)),
            )
        })
    }

    fn pictures_mut(&mut self) -> impl Iterator<Item = (PicId, &mut PictureData)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, e)| e.as_mut().map(|fs| (slot, fs)))
            .flat_map(|(slot, fs)| {
                let FrameStore { first, second, .. } = fs;
                std::iter::once((PicId::first(slot), first)).chain(
                    second
                        .iter_mut()
                        .map(move |p| (PicId { slot, second: true }, p)),
                )
            })
    }

    pub fn get(&self, id: PicId) -> Option<&PictureData> {
        self.store(id.slot)?.picture(id.second)
    }

    fn get_mut(&mut self, id: PicId) -> Option<&mut PictureData> {
        self.store_mut(id.slot)?.picture_mut(id.second)
    }

    pub fn handle(&self, id: PicId) -> Option<&H> {
        self.store(id.slot)?.handle()
    }

    /// Whether a store only lingers until its slot is needed: it is neither a reference nor
    /// waiting for output, and no other view of the current access unit may predict from it.
    fn is_evictable(&self, fs: &FrameStore<H>) -> bool {
        !fs.is_ref() && !fs.needed_for_output() && !self.is_pinned(fs)
    }

    /// Inter-view picture of the access unit being decoded.
    fn is_pinned(&self, fs: &FrameStore<H>) -> bool {
        fs.first.inter_view_flag && fs.first.au_no == self.current_au
    }

    /// Returns the number of frame stores holding pictures still in use.
    pub fn len(&self) -> usize {
        self.stores().filter(|(_, fs)| !self.is_evictable(fs)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the DPB has an empty slot for a new picture.
    pub fn has_empty_frame_buffer(&self) -> bool {
        self.len() < self.max_num_pics
    }

    // Returns the number of reference frames, counting field pairs once.
    pub fn num_ref_frames(&self) -> usize {
        self.stores().filter(|(_, fs)| fs.is_ref()).count()
    }

    fn num_needed_for_output(&self) -> usize {
        self.stores()
            .filter(|(_, fs)| fs.needed_for_output() && fs.sealed)
            .count()
    }

    /// Find the frame store holding the short term reference picture with the lowest
    /// `frame_num_wrap` value.
    pub fn find_short_term_lowest_frame_num_wrap(&self) -> Option<usize> {
        self.pictures()
            .filter(|(_, p)| matches!(p.reference(), Reference::ShortTerm))
            .min_by_key(|(_, p)| p.frame_num_wrap)
            .map(|(id, _)| id.slot)
    }

    /// Find a short term reference picture with the given `pic_num` value.
    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<PicId> {
        let found = self
            .pictures()
            .find(|(_, p)| matches!(p.reference(), Reference::ShortTerm) && p.pic_num == pic_num)
            .map(|(id, _)| id);

        debug!(
            "find_short_term_with_pic_num: {}, found {:?}",
            pic_num, found
        );

        found
    }

    /// Find a long term reference picture with the given `long_term_pic_num`
    /// value.
    pub fn find_long_term_with_long_term_pic_num(&self, long_term_pic_num: i32) -> Option<PicId> {
        let found = self
            .pictures()
            .find(|(_, p)| {
                matches!(p.reference(), Reference::LongTerm)
                    && p.long_term_pic_num == long_term_pic_num
            })
            .map(|(id, _)| id);

        debug!(
            "find_long_term_with_long_term_pic_num: {}, found {:?}",
            long_term_pic_num, found
        );

        found
    }

    /// Finds the picture of `view_id` decoded in access unit `au_no` that other views may
    /// predict from. When decoding a field, the field of the same parity is returned.
    pub fn find_inter_view_ref(&self, view_id: u16, au_no: u64, field: Field) -> Option<PicId> {
        self.pictures()
            .find(|(id, p)| {
                p.view_id == view_id
                    && p.au_no == au_no
                    && p.inter_view_flag
                    && !p.nonexisting
                    && match field {
                        Field::Frame => !id.second,
                        _ => p.field == field,
                    }
            })
            .map(|(id, _)| id)
    }

    /// Mark a picture, and optionally its complementary field, as `reference`.
    fn set_reference(&mut self, id: PicId, reference: Reference, apply_to_other_field: bool) {
        if let Some(fs) = self.store_mut(id.slot) {
            if apply_to_other_field {
                for pic in fs.pictures_mut() {
                    pic.set_reference(reference);
                }
            } else if let Some(pic) = fs.picture_mut(id.second) {
                pic.set_reference(reference);
            }
        }
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for (_, pic) in self.pictures_mut() {
            pic.set_reference(Reference::None);
        }
    }

    /// Returns the slot of a first field waiting for its complementary field, if the picture
    /// described by `frame_num` and `field` is that complementary field.
    pub fn find_first_field(&self, frame_num: i32, field: Field) -> Option<usize> {
        if field == Field::Frame {
            return None;
        }

        let slot = self.last_field?;
        let fs = self.store(slot)?;

        if fs.second.is_none() && fs.first.field == field.opposite() && fs.first.frame_num == frame_num
        {
            Some(slot)
        } else {
            None
        }
    }

    /// The pending first field, if any, will stay a non-paired field.
    pub fn seal_last_field(&mut self) {
        if let Some(slot) = self.last_field.take() {
            if let Some(fs) = self.store_mut(slot) {
                debug!("Field in slot {} stays unpaired", slot);
                fs.sealed = true;
            }
        }
    }

    /// Returns the lowest (POC, decoding order) store among the non-evictable ones.
    pub fn eviction_candidate(&self) -> Option<usize> {
        self.stores()
            .filter(|(_, fs)| self.is_evictable(fs))
            .min_by_key(|(_, fs)| (fs.pic_order_cnt(), fs.dec_no()))
            .map(|(slot, _)| slot)
    }

    fn free_slot(&mut self) -> Option<usize> {
        if self.stores().count() < self.max_num_pics {
            if let Some(slot) = self.entries.iter().position(Option::is_none) {
                return Some(slot);
            }

            self.entries.push(None);
            return Some(self.entries.len() - 1);
        }

        let victim = self.eviction_candidate()?;
        if let Some(fs) = self.entries[victim].take() {
            debug!(
                "Evicting POC {} (dec_no {}) from slot {}",
                fs.pic_order_cnt(),
                fs.dec_no(),
                victim
            );
        }

        Some(victim)
    }

    /// Store a picture and its backend handle in a new frame store.
    pub fn store_picture(
        &mut self,
        mut pic: PictureData,
        handle: Option<H>,
    ) -> Result<PicId, StorePictureError> {
        self.seal_last_field();

        let slot = self.free_slot().ok_or(StorePictureError::DpbIsFull)?;

        // C.4.2. Decoding of gaps in frame_num and storage of "non-existing"
        // pictures
        pic.needed_for_output = !pic.nonexisting;

        let field = pic.field;
        let (second, sealed) = match field {
            Field::Frame if self.interlaced => (Some(pic.split_frame()), true),
            Field::Frame => (None, true),
            Field::Top | Field::Bottom => {
                self.last_field = Some(slot);
                (None, false)
            }
        };

        debug!(
            "Stored picture POC {:?}, field {:?} in slot {}, the DPB length is {:?}",
            pic.pic_order_cnt,
            pic.field,
            slot,
            self.len() + 1
        );

        self.entries[slot] = Some(FrameStore {
            first: pic,
            second,
            handle,
            sealed,
        });

        Ok(PicId::first(slot))
    }

    /// Completes the field pair in `slot` with `pic`.
    pub fn add_second_field(
        &mut self,
        slot: usize,
        mut pic: PictureData,
    ) -> Result<PicId, StorePictureError> {
        let fs = self
            .store_mut(slot)
            .ok_or(StorePictureError::NoFirstField)?;

        if fs.second.is_some() || fs.first.field != pic.field.opposite() || pic.field == Field::Frame
        {
            return Err(StorePictureError::NoFirstField);
        }

        debug!(
            "Completing field pair in slot {} with POC {}",
            slot, pic.pic_order_cnt
        );

        pic.set_second_field(true);
        pic.needed_for_output = false;
        fs.second = Some(pic);
        fs.sealed = true;

        if self.last_field == Some(slot) {
            self.last_field = None;
        }

        Ok(PicId { slot, second: true })
    }

    /// Whether the DPB needs bumping, as described by clauses 1, 4, 5, 6 of
    /// C.4.5.3 "Bumping" process.
    pub fn needs_bumping(&self, to_insert: &PictureData) -> bool {
        // In C.4.5.3 we handle clauses 2 and 3 separately. All other clauses
        // check for an empty frame buffer first. Here we handle:
        //    - There is no empty frame buffer and a empty frame buffer is
        //    needed for storage of an inferred "non-existing" frame.
        //
        //    - There is no empty frame buffer and an empty frame buffer is
        //    needed for storage of a decoded (non-IDR) reference picture.
        //
        //    - There is no empty frame buffer and the current picture is a non-
        //    reference picture that is not the second field of a complementary
        //    non-reference field pair and there are pictures in the DPB that
        //    are marked as "needed for output" that precede the current
        //    non-reference picture in output order.
        if self.has_empty_frame_buffer() {
            return false;
        }

        if to_insert.nonexisting {
            return true;
        }

        let non_idr_ref = to_insert.is_ref() && !to_insert.is_idr();
        if non_idr_ref {
            return true;
        }

        let lowest_poc = match self.find_lowest_poc_for_bumping(false) {
            Some(slot) => self.entries[slot]
                .as_ref()
                .map_or(i32::MAX, |fs| fs.pic_order_cnt()),
            None => return false,
        };

        to_insert.pic_order_cnt > lowest_poc
    }

    /// Find the store with the lowest POC that can be bumped. Ties are broken by decoding
    /// order. Unpaired first fields are only considered when `include_unpaired` is set.
    fn find_lowest_poc_for_bumping(&self, include_unpaired: bool) -> Option<usize> {
        self.stores()
            .filter(|(_, fs)| fs.needed_for_output() && (fs.sealed || include_unpaired))
            .min_by_key(|(_, fs)| (fs.pic_order_cnt(), fs.dec_no()))
            .map(|(slot, _)| slot)
    }

    /// Records an output and checks that POCs of a view do not go backwards.
    fn check_output_order(&mut self, pic_order_cnt: i32, view_id: u16) -> bool {
        let out_of_order = match (self.last_output_poc, self.last_output_view_id) {
            (Some(last_poc), Some(last_view)) => last_view == view_id && pic_order_cnt < last_poc,
            _ => false,
        };

        if out_of_order {
            warn!(
                "Output POC {} of view {} precedes the previous output POC {:?}",
                pic_order_cnt, view_id, self.last_output_poc
            );
        }

        self.last_output_poc = Some(pic_order_cnt);
        self.last_output_view_id = Some(view_id);

        out_of_order
    }

    /// Drops all stored pictures without output.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB");

        self.entries.clear();
        self.last_field = None;
        self.last_output_poc = None;
        self.last_output_view_id = None;
    }

    /// Returns an iterator of short term refs.
    pub fn short_term_refs_iter(&self) -> impl Iterator<Item = (usize, &FrameStore<H>)> {
        self.stores()
            .filter(|(_, fs)| fs.has_reference(Reference::ShortTerm))
    }

    /// Returns an iterator of long term refs.
    pub fn long_term_refs_iter(&self) -> impl Iterator<Item = (usize, &FrameStore<H>)> {
        self.stores()
            .filter(|(_, fs)| fs.has_reference(Reference::LongTerm))
    }

    /// Returns an iterator of the stores other views of the current access unit can
    /// predict from.
    pub fn inter_view_refs_iter(&self) -> impl Iterator<Item = (usize, &FrameStore<H>)> {
        self.stores().filter(|(_, fs)| self.is_pinned(fs))
    }

    /// Derives `FrameNumWrap`, `PicNum` and `LongTermPicNum` of the stored references with
    /// respect to the current picture (8.2.4.1).
    pub fn update_pic_nums(&mut self, frame_num: i32, max_frame_num: i32, current_field: Field) {
        for (_, pic) in self.pictures_mut() {
            if !pic.is_ref() {
                continue;
            }

            if *pic.reference() == Reference::LongTerm {
                pic.long_term_pic_num = if current_field == Field::Frame {
                    pic.long_term_frame_idx
                } else if current_field == pic.field {
                    2 * pic.long_term_frame_idx + 1
                } else {
                    2 * pic.long_term_frame_idx
                };
            } else {
                pic.frame_num_wrap = if pic.frame_num > frame_num {
                    pic.frame_num - max_frame_num
                } else {
                    pic.frame_num
                };

                pic.pic_num = if current_field == Field::Frame {
                    pic.frame_num_wrap
                } else if pic.field == current_field {
                    2 * pic.frame_num_wrap + 1
                } else {
                    2 * pic.frame_num_wrap
                };
            }
        }
    }

    // 8.2.5.3
    pub fn sliding_window_marking(
        &mut self,
        pic: &mut PictureData,
        max_num_ref_frames: usize,
        first_field: Option<PicId>,
    ) -> anyhow::Result<()> {
        // If the current picture is a coded field that is the second field in
        // decoding order of a complementary reference field pair, and the first
        // field has been marked as "used for short-term reference", the current
        // picture and the complementary reference field pair are also marked as
        // "used for short-term reference".
        if pic.is_second_field()
            && first_field
                .and_then(|id| self.get(id))
                .map_or(false, |first| {
                    matches!(first.reference(), Reference::ShortTerm)
                })
        {
            pic.set_reference(Reference::ShortTerm);
            return Ok(());
        }

        let mut num_ref_pics = self.num_ref_frames();
        let max_num_ref_frames = std::cmp::max(1, max_num_ref_frames);

        while num_ref_pics >= max_num_ref_frames {
            let slot = self
                .find_short_term_lowest_frame_num_wrap()
                .context("Could not find a ShortTerm picture to unmark in the DPB")?;

            debug!("Sliding window unmarks slot {}", slot);
            self.set_reference(PicId::first(slot), Reference::None, true);
            num_ref_pics -= 1;
        }

        Ok(())
    }

    /// Decoded reference picture marking process (8.2.5) for the current picture.
    pub fn mark_references(
        &mut self,
        pic: &mut PictureData,
        max_num_ref_frames: usize,
        first_field: Option<PicId>,
    ) -> anyhow::Result<()> {
        // 8.2.5.1
        if pic.is_idr() {
            if !pic.is_second_field() {
                self.mark_all_as_unused_for_ref();
            }

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm);
                pic.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                pic.set_reference(Reference::ShortTerm);
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }

            return Ok(());
        }

        if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.handle_memory_management_ops(pic, first_field)?;
        } else {
            self.sliding_window_marking(pic, max_num_ref_frames, first_field)?;
        }

        Ok(())
    }

    fn handle_memory_management_ops(
        &mut self,
        pic: &mut PictureData,
        first_field: Option<PicId>,
    ) -> Result<(), MmcoError> {
        let markings = pic.ref_pic_marking.inner.clone();

        for marking in &markings {
            match marking.memory_management_control_operation {
                0 => break,
                1 => self.mmco_op_1(pic, marking)?,
                2 => self.mmco_op_2(pic, marking)?,
                3 => self.mmco_op_3(pic, marking)?,
                4 => self.mmco_op_4(marking),
                5 => self.mmco_op_5(pic),
                6 => self.mmco_op_6(pic, marking, first_field)?,
                other => return Err(MmcoError::UnknownOperation(other)),
            }
        }

        Ok(())
    }

    fn pic_num_x(pic: &PictureData, marking: &RefPicMarkingInner) -> Result<i32, MmcoError> {
        i32::try_from(marking.difference_of_pic_nums_minus1)
            .ok()
            .and_then(|diff| diff.checked_add(1))
            .and_then(|diff| pic.pic_num.checked_sub(diff))
            .ok_or(MmcoError::NoShortTermPic)
    }

    /// Returns the index assigned by `marking`, which must not exceed `MaxLongTermFrameIdx`.
    fn long_term_frame_idx(&self, marking: &RefPicMarkingInner) -> Result<i32, MmcoError> {
        let idx = marking.long_term_frame_idx;

        match self.max_long_term_frame_idx {
            MaxLongTermFrameIdx::Idx(max) if idx <= max => {
                i32::try_from(idx).map_err(|_| MmcoError::InvalidIndex(idx))
            }
            _ => Err(MmcoError::InvalidIndex(idx)),
        }
    }

    /// Marks as unused every long-term picture with `long_term_frame_idx`, except those in
    /// `keep_slot`, which is part of the pair receiving the index.
    fn unmark_long_term_frame_idx(&mut self, long_term_frame_idx: i32, keep_slot: Option<usize>) {
        for (id, pic) in self.pictures_mut() {
            if Some(id.slot) != keep_slot
                && matches!(pic.reference(), Reference::LongTerm)
                && pic.long_term_frame_idx == long_term_frame_idx
            {
                pic.set_reference(Reference::None);
            }
        }
    }

    pub fn mmco_op_1(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = Self::pic_num_x(pic, marking)?;

        debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic)?;

        self.set_reference(to_mark, Reference::None, pic.field == Field::Frame);

        Ok(())
    }

    pub fn mmco_op_2(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        debug!(
            "MMCO op 2 for long_term_pic_num {}",
            marking.long_term_pic_num
        );
        trace!("Dpb state before MMCO=2: {:#?}", self);

        let long_term_pic_num = i32::try_from(marking.long_term_pic_num)
            .map_err(|_| MmcoError::InvalidIndex(marking.long_term_pic_num))?;

        let to_mark = self
            .find_long_term_with_long_term_pic_num(long_term_pic_num)
            .ok_or(MmcoError::NoLongTermPic)?;

        self.set_reference(to_mark, Reference::None, pic.field == Field::Frame);

        Ok(())
    }

    pub fn mmco_op_3(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = Self::pic_num_x(pic, marking)?;

        debug!("MMCO op 3 for pic_num_x {}", pic_num_x);
        trace!("Dpb state before MMCO=3: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic)?;

        if self.get(to_mark).map_or(false, |p| p.nonexisting) {
            return Err(MmcoError::ExpectedExisting);
        }

        let long_term_frame_idx = self.long_term_frame_idx(marking)?;

        // When LongTermFrameIdx equal to long_term_frame_idx is already
        // assigned to a long-term reference frame or a long-term complementary
        // reference field pair, that frame or complementary field pair and both
        // of its fields are marked as "unused for reference". When
        // LongTermFrameIdx is already assigned to a reference field, and that
        // reference field is not part of a complementary field pair that
        // includes the picture specified by picNumX, that field is marked as
        // "unused for reference".
        self.unmark_long_term_frame_idx(long_term_frame_idx, Some(to_mark.slot));

        self.set_reference(to_mark, Reference::LongTerm, pic.field == Field::Frame);

        if let Some(fs) = self.store_mut(to_mark.slot) {
            for field in fs.pictures_mut() {
                if matches!(field.reference(), Reference::LongTerm) {
                    field.long_term_frame_idx = long_term_frame_idx;
                }
            }
        }

        Ok(())
    }

    /// Updates `max_long_term_frame_idx`, dropping long term references above it.
    pub fn mmco_op_4(&mut self, marking: &RefPicMarkingInner) {
        debug!(
            "MMCO op 4, max_long_term_frame_idx: {:?}",
            marking.max_long_term_frame_idx
        );
        trace!("Dpb state before MMCO=4: {:#?}", self);

        let max_long_term_frame_idx = marking.max_long_term_frame_idx;

        for (_, pic) in self.pictures_mut() {
            let above_max = u32::try_from(pic.long_term_frame_idx)
                .map_or(true, |idx| max_long_term_frame_idx < idx);

            if matches!(pic.reference(), Reference::LongTerm) && above_max {
                pic.set_reference(Reference::None);
            }
        }

        self.max_long_term_frame_idx = max_long_term_frame_idx;
    }

    pub fn mmco_op_5(&mut self, pic: &mut PictureData) {
        debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");
        trace!("Dpb state before MMCO=5: {:#?}", self);

        self.mark_all_as_unused_for_ref();

        pic.has_mmco_5 = true;

        // A picture including a memory_management_control_operation equal to 5
        // shall have frame_num constraints as described above and, after the
        // decoding of the current picture and the processing of the memory
        // management control operations, the picture shall be inferred to have
        // had frame_num equal to 0 for all subsequent use in the decoding
        // process, except as specified in clause 7.4.1.2.4.
        pic.frame_num = 0;

        // When the current picture includes a
        // memory_management_control_operation equal to 5, after the decoding of
        // the current picture, tempPicOrderCnt is set equal to PicOrderCnt(
        // CurrPic ), TopFieldOrderCnt of the current picture (if any) is set
        // equal to TopFieldOrderCnt − tempPicOrderCnt, and BottomFieldOrderCnt
        // of the current picture (if any) is set equal to BottomFieldOrderCnt −
        // tempPicOrderCnt
        match pic.field {
            Field::Top => {
                pic.top_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Frame => {
                let temp_pic_order_cnt = pic.pic_order_cnt;
                pic.top_field_order_cnt = pic.top_field_order_cnt.wrapping_sub(temp_pic_order_cnt);
                pic.bottom_field_order_cnt =
                    pic.bottom_field_order_cnt.wrapping_sub(temp_pic_order_cnt);
                pic.pic_order_cnt =
                    std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
            }
        }

        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
    }

    pub fn mmco_op_6(
        &mut self,
        pic: &mut PictureData,
        marking: &RefPicMarkingInner,
        first_field: Option<PicId>,
    ) -> Result<(), MmcoError> {
        let long_term_frame_idx = self.long_term_frame_idx(marking)?;

        debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        trace!("Dpb state before MMCO=6: {:#?}", self);

        // The first field of the current picture is part of the pair that
        // receives the index.
        self.unmark_long_term_frame_idx(long_term_frame_idx, first_field.map(|id| id.slot));

        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;

        if let Some(first) = first_field.and_then(|id| self.get_mut(id)) {
            if matches!(first.reference(), Reference::LongTerm) {
                first.long_term_frame_idx = long_term_frame_idx;
            }
        }

        Ok(())
    }

    fn debug_ref_list(&self, ref_pic_list: &[PicId], name: &str) {
        debug!(
            "{}: (ShortTerm|LongTerm, pic_num, long_term_pic_num, POC) {:?}",
            name,
            ref_pic_list
                .iter()
                .filter_map(|id| self.get(*id))
                .map(|p| (
                    *p.reference(),
                    p.pic_num,
                    p.long_term_pic_num,
                    p.pic_order_cnt
                ))
                .collect::<Vec<_>>()
        );
    }

    // When the reference picture list RefPicList1 has more than one entry
    // and RefPicList1 is identical to the reference picture list
    // RefPicList0, the first two entries RefPicList1[0] and RefPicList1[1]
    // are switched.
    fn swap_b1_if_needed(b0: &DpbPicRefList, b1: &mut DpbPicRefList) {
        if b1.len() > 1 && b0 == b1 {
            b1.swap(0, 1);
        }
    }

    /// Copies from refFrameList(XShort|Long)Term into RefPicListX as per 8.2.4.2.5. Used when
    /// building the reference list for fields in interlaced decoding.
    fn init_ref_field_pic_list(
        field: Field,
        reference: Reference,
        ref_frame_list: &[(usize, &FrameStore<H>)],
        ref_pic_list: &mut DpbPicRefList,
    ) {
        // When one field of a reference frame was not decoded or is not marked as "used for
        // (short|long)-term reference", the missing field is ignored and instead the next
        // available stored reference field of the chosen parity from the ordered list of frames
        // refFrameListX(Short|Long)Term is inserted into RefPicListX.
        let mut same_parity = vec![];
        let mut opposite_parity = vec![];

        for &(slot, fs) in ref_frame_list {
            let fields = std::iter::once((false, &fs.first))
                .chain(fs.second.iter().map(|p| (true, p)));

            for (second, pic) in fields {
                if *pic.reference() != reference {
                    continue;
                }

                let id = PicId { slot, second };
                if pic.field == field {
                    same_parity.push(id);
                } else {
                    opposite_parity.push(id);
                }
            }
        }

        // Fields are taken alternately starting with the parity of the current field. Once
        // one parity runs out, the remaining fields of the other are appended in order.
        let mut same_parity = same_parity.into_iter();
        let mut opposite_parity = opposite_parity.into_iter();

        loop {
            match same_parity.next() {
                Some(id) => ref_pic_list.push(id),
                None => {
                    ref_pic_list.extend(opposite_parity);
                    break;
                }
            }

            match opposite_parity.next() {
                Some(id) => ref_pic_list.push(id),
                None => {
                    ref_pic_list.extend(same_parity);
                    break;
                }
            }
        }
    }

    fn ref_frames(&self, reference: Reference) -> Vec<(usize, &FrameStore<H>)> {
        self.stores()
            .filter(|(_, fs)| fs.frame_reference() == reference)
            .collect()
    }

    /// 8.2.4.2.1 Initialization process for the reference picture list for P
    /// and SP slices in frames
    fn build_ref_pic_list_p(&self) -> DpbPicRefList {
        let mut short_term = self.ref_frames(Reference::ShortTerm);
        short_term.sort_by_key(|(_, fs)| Reverse(fs.first.pic_num));

        let mut long_term = self.ref_frames(Reference::LongTerm);
        long_term.sort_by_key(|(_, fs)| fs.first.long_term_pic_num);

        let ref_pic_list_p0: DpbPicRefList = short_term
            .iter()
            .chain(long_term.iter())
            .map(|(slot, _)| PicId::first(*slot))
            .collect();

        self.debug_ref_list(&ref_pic_list_p0, "ref_pic_list_p0");

        ref_pic_list_p0
    }

    /// 8.2.4.2.2 Initialization process for the reference picture list for P
    /// and SP slices in fields
    fn build_ref_field_pic_list_p(&self, cur_pic: &PictureData) -> DpbPicRefList {
        let mut ref_pic_list_p0 = vec![];

        let mut ref_frame_list_0_short_term: Vec<_> = self.short_term_refs_iter().collect();
        ref_frame_list_0_short_term.sort_by_key(|(_, fs)| Reverse(fs.ref_frame_num_wrap()));

        let mut ref_frame_list_long_term: Vec<_> = self.long_term_refs_iter().collect();
        ref_frame_list_long_term.sort_by_key(|(_, fs)| fs.ref_long_term_frame_idx());

        // 8.2.4.2.5
        Self::init_ref_field_pic_list(
            cur_pic.field,
            Reference::ShortTerm,
            &ref_frame_list_0_short_term,
            &mut ref_pic_list_p0,
        );
        Self::init_ref_field_pic_list(
            cur_pic.field,
            Reference::LongTerm,
            &ref_frame_list_long_term,
            &mut ref_pic_list_p0,
        );

        self.debug_ref_list(&ref_pic_list_p0, "ref_field_pic_list_p0");

        ref_pic_list_p0
    }

    // 8.2.4.2.3 Initialization process for reference picture lists for B slices
    // in frames
    fn build_ref_pic_list_b(&self, cur_pic: &PictureData) -> (DpbPicRefList, DpbPicRefList) {
        let mut short_term_refs = self.ref_frames(Reference::ShortTerm);

        // When pic_order_cnt_type is equal to 0, reference pictures that are
        // marked as "non-existing" as specified in clause 8.2.5.2 are not
        // included in either RefPicList0 or RefPicList1.
        if cur_pic.pic_order_cnt_type == 0 {
            short_term_refs.retain(|(_, fs)| !fs.nonexisting());
        }

        let cur_poc = cur_pic.pic_order_cnt;

        let (mut before, mut after): (Vec<&(usize, &FrameStore<H>)>, Vec<&(usize, &FrameStore<H>)>) = short_term_refs
            .iter()
            .partition(|(_, fs)| fs.pic_order_cnt() < cur_poc);
        before.sort_by_key(|(_, fs)| Reverse(fs.pic_order_cnt()));
        after.sort_by_key(|(_, fs)| fs.pic_order_cnt());

        let mut long_term_refs = self.ref_frames(Reference::LongTerm);
        long_term_refs.retain(|(_, fs)| !fs.nonexisting());
        long_term_refs.sort_by_key(|(_, fs)| fs.first.long_term_pic_num);

        let to_ids = |lists: &[&[&(usize, &FrameStore<H>)]]| -> DpbPicRefList {
            lists
                .iter()
                .flat_map(|list| list.iter())
                .map(|(slot, _)| PicId::first(*slot))
                .collect()
        };

        let long_term_refs: Vec<_> = long_term_refs.iter().collect();

        // b0 contains three inner lists of pictures, i.e. [[0] [1] [2]]
        // [0]: short term pictures with POC < current, sorted by descending POC.
        // [1]: short term pictures with POC > current, sorted by ascending POC.
        // [2]: long term pictures sorted by ascending long_term_pic_num
        let ref_pic_list_b0 = to_ids(&[&before[..], &after[..], &long_term_refs[..]]);

        // b1 contains three inner lists of pictures, i.e. [[0] [1] [2]]
        // [0]: short term pictures with POC > current, sorted by ascending POC.
        // [1]: short term pictures with POC < current, sorted by descending POC.
        // [2]: long term pictures sorted by ascending long_term_pic_num
        let mut ref_pic_list_b1 = to_ids(&[&after[..], &before[..], &long_term_refs[..]]);

        Self::swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

        self.debug_ref_list(&ref_pic_list_b0, "ref_pic_list_b0");
        self.debug_ref_list(&ref_pic_list_b1, "ref_pic_list_b1");

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// 8.2.4.2.4 Initialization process for reference picture lists for B
    /// slices in fields
    fn build_ref_field_pic_list_b(&self, cur_pic: &PictureData) -> (DpbPicRefList, DpbPicRefList) {
        let mut ref_pic_list_b0 = vec![];
        let mut ref_pic_list_b1 = vec![];

        let mut short_term_refs: Vec<_> = self.short_term_refs_iter().collect();

        // When pic_order_cnt_type is equal to 0, reference pictures that are
        // marked as "non-existing" as specified in clause 8.2.5.2 are not
        // included in either RefPicList0 or RefPicList1.
        if cur_pic.pic_order_cnt_type == 0 {
            short_term_refs.retain(|(_, fs)| !fs.nonexisting());
        }

        let cur_poc = cur_pic.pic_order_cnt;

        // refFrameList0ShortTerm is comprised of two inner lists, [[0] [1]]
        // [0]: short term pictures with POC <= current, sorted by descending POC
        // [1]: short term pictures with POC > current, sorted by ascending POC
        // A first field of the current frame is already stored in the DPB and is
        // ordered using its own POC.
        let (mut before, mut after): (Vec<_>, Vec<_>) = short_term_refs
            .iter()
            .copied()
            .partition(|(_, fs)| fs.ref_pic_order_cnt(Reference::ShortTerm) <= cur_poc);
        before.sort_by_key(|(_, fs)| Reverse(fs.ref_pic_order_cnt(Reference::ShortTerm)));
        after.sort_by_key(|(_, fs)| fs.ref_pic_order_cnt(Reference::ShortTerm));

        let ref_frame_list_0_short_term: Vec<_> =
            before.iter().chain(after.iter()).copied().collect();

        // refFrameList1ShortTerm is comprised of two inner lists, [[0] [1]]
        // [0]: short term pictures with POC > current, sorted by ascending POC
        // [1]: short term pictures with POC <= current, sorted by descending POC
        let ref_frame_list_1_short_term: Vec<_> =
            after.iter().chain(before.iter()).copied().collect();

        // refFrameListLongTerm: long term pictures sorted by ascending
        // LongTermFrameIdx.
        let mut ref_frame_list_long_term: Vec<_> = self
            .long_term_refs_iter()
            .filter(|(_, fs)| !fs.nonexisting())
            .collect();
        ref_frame_list_long_term.sort_by_key(|(_, fs)| fs.ref_long_term_frame_idx());

        // 8.2.4.2.5
        let field = cur_pic.field;
        Self::init_ref_field_pic_list(
            field,
            Reference::ShortTerm,
            &ref_frame_list_0_short_term,
            &mut ref_pic_list_b0,
        );
        Self::init_ref_field_pic_list(
            field,
            Reference::LongTerm,
            &ref_frame_list_long_term,
            &mut ref_pic_list_b0,
        );

        Self::init_ref_field_pic_list(
            field,
            Reference::ShortTerm,
            &ref_frame_list_1_short_term,
            &mut ref_pic_list_b1,
        );
        Self::init_ref_field_pic_list(
            field,
            Reference::LongTerm,
            &ref_frame_list_long_term,
            &mut ref_pic_list_b1,
        );

        Self::swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

        self.debug_ref_list(&ref_pic_list_b0, "ref_field_pic_list_b0");
        self.debug_ref_list(&ref_pic_list_b1, "ref_field_pic_list_b1");

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// Returns the initial lists of reference pictures for `pic`.
    pub fn build_ref_pic_lists(&self, pic: &PictureData) -> ReferencePicLists {
        let num_refs = self
            .pictures()
            .filter(|(_, p)| p.is_ref() && !p.nonexisting)
            .count();

        // 8.2.4.2.1 ~ 8.2.4.2.4: When this process is invoked, there shall be
        // at least one reference frame or complementary reference field pair
        // that is currently marked as "used for reference" (i.e., as "used for
        // short-term reference" or "used for long-term reference") and is not
        // marked as "non-existing".
        if num_refs == 0 {
            return Default::default();
        }

        let (ref_pic_list_p0, (ref_pic_list_b0, ref_pic_list_b1)) =
            if matches!(pic.field, Field::Frame) {
                (self.build_ref_pic_list_p(), self.build_ref_pic_list_b(pic))
            } else {
                (
                    self.build_ref_field_pic_list_p(pic),
                    self.build_ref_field_pic_list_b(pic),
                )
            };

        ReferencePicLists {
            ref_pic_list_p0,
            ref_pic_list_b0,
            ref_pic_list_b1,
        }
    }
}

impl<H: Clone> Dpb<H> {
    /// Bump the dpb, returning a picture as per the bumping process described in C.4.5.3.
    fn bump(&mut self, include_unpaired: bool) -> Option<DpbOutput<H>> {
        let slot = self.find_lowest_poc_for_bumping(include_unpaired)?;
        let fs = self.store_mut(slot)?;

        for pic in fs.pictures_mut() {
            pic.needed_for_output = false;
        }

        let pic_order_cnt = fs.pic_order_cnt();
        let view_id = fs.first.view_id;
        let structure = fs.structure();
        let timestamp = fs.first.timestamp;
        let handle = fs.handle.clone();

        debug!(
            "Bumping POC {} of view {} from slot {}",
            pic_order_cnt, view_id, slot
        );

        let out_of_order = self.check_output_order(pic_order_cnt, view_id);

        Some(DpbOutput {
            handle,
            pic_order_cnt,
            view_id,
            structure,
            timestamp,
            out_of_order,
        })
    }

    /// Outputs a non-reference picture that precedes everything in the DPB without storing
    /// it (C.4.5.2).
    pub fn output_direct(&mut self, pic: &PictureData, handle: H) -> DpbOutput<H> {
        debug!("Outputting POC {} without storing it", pic.pic_order_cnt);

        let out_of_order = self.check_output_order(pic.pic_order_cnt, pic.view_id);

        DpbOutput {
            handle: Some(handle),
            pic_order_cnt: pic.pic_order_cnt,
            view_id: pic.view_id,
            structure: pic.field,
            timestamp: pic.timestamp,
            out_of_order,
        }
    }

    /// Drains the DPB by continuously invoking the bumping process, then clears it.
    pub fn drain(&mut self) -> Vec<DpbOutput<H>> {
        debug!("Draining the DPB.");

        let mut pics = vec![];

        while let Some(pic) = self.bump(true) {
            pics.push(pic);
        }

        self.clear();

        pics
    }

    /// Bumps the DPB if needed. DPB bumping is described on C.4.5.3.
    pub fn bump_as_needed(&mut self, current_pic: &PictureData) -> Vec<DpbOutput<H>> {
        let mut pics = vec![];

        while self.needs_bumping(current_pic) {
            match self.bump(false) {
                Some(pic) => pics.push(pic),
                None => break,
            }
        }

        pics
    }

    /// Outputs pictures as long as more than `max_num_reorder_frames` wait for output.
    pub fn bump_reorder(&mut self) -> Vec<DpbOutput<H>> {
        let mut pics = vec![];

        while self.num_needed_for_output() > self.max_num_reorder_frames {
            match self.bump(false) {
                Some(pic) => pics.push(pic),
                None => break,
            }
        }

        pics
    }

    /// Makes room when no store can be freed: outputs everything pending, then drops the
    /// least recently decoded short-term reference if the DPB is still full.
    pub fn emergency_flush(&mut self) -> Vec<DpbOutput<H>> {
        warn!("No room left in DPB layer {}, flushing", self.layer_id);

        let mut pics = vec![];
        while let Some(pic) = self.bump(true) {
            pics.push(pic);
        }

        if !self.has_empty_frame_buffer() {
            let victim = self
                .short_term_refs_iter()
                .min_by_key(|(_, fs)| fs.dec_no())
                .or_else(|| {
                    self.stores()
                        .filter(|(_, fs)| fs.is_ref())
                        .min_by_key(|(_, fs)| fs.dec_no())
                })
                .map(|(slot, _)| slot);

            if let Some(slot) = victim {
                warn!("Dropping reference in slot {}", slot);
                self.set_reference(PicId::first(slot), Reference::None, true);
            }
        }

        pics
    }

    /// Inserts a decoded picture, after reference marking, as described in C.4.4 and C.4.5.
    ///
    /// `first_field` is the slot of the first field when `pic` is a second field.
    pub fn insert_picture(
        &mut self,
        pic: PictureData,
        handle: Option<H>,
        first_field: Option<usize>,
    ) -> Result<DpbInsertion<H>, StorePictureError> {
        let mut outputs = vec![];
        let mut overflowed = false;

        let id = if let Some(slot) = first_field {
            Some(self.add_second_field(slot, pic)?)
        } else {
            if pic.has_mmco_5 {
                // C.4.5.3 "Bumping process"
                // The bumping process is invoked in the following cases:
                // Clause 3:
                // The current picture has memory_management_control_operation equal
                // to 5, as specified in clause C.4.4.
                outputs.extend(self.drain());
            }

            // Bump the DPB as per C.4.5.3 to cover clauses 1, 4, 5 and 6.
            outputs.extend(self.bump_as_needed(&pic));

            // C.4.5.1: reference pictures are always stored. Fields are stored so they
            // can be paired, and inter-view pictures so other views can use them.
            let must_store = pic.is_ref() || pic.inter_view_flag || pic.field != Field::Frame;

            if must_store && !self.has_empty_frame_buffer() && self.eviction_candidate().is_none()
            {
                overflowed = true;
                outputs.extend(self.emergency_flush());
            }

            if must_store || self.has_empty_frame_buffer() {
                Some(self.store_picture(pic, handle)?)
            } else {
                // C.4.5.2: a non-reference picture that precedes everything in the DPB
                // in output order is output immediately.
                if let Some(handle) = handle {
                    outputs.push(self.output_direct(&pic, handle));
                }
                None
            }
        };

        outputs.extend(self.bump_reorder());

        Ok(DpbInsertion {
            outputs,
            overflowed,
            id,
        })
    }

    fn store_info(&self, fs: &FrameStore<H>) -> DpbInfo<H> {
        let is_long_term = fs.has_reference(Reference::LongTerm);
        let top = fs.field(Field::Top);
        let bottom = fs.field(Field::Bottom);

        DpbInfo {
            handle: fs.handle.clone(),
            top_poc: top.map_or(0, |p| p.top_field_order_cnt),
            bottom_poc: bottom.map_or(0, |p| p.bottom_field_order_cnt),
            frame_idx: if is_long_term {
                fs.ref_long_term_frame_idx()
            } else {
                fs.ref_frame_num_wrap()
            },
            field_flag: fs.is_used() != 3,
            is_long_term,
            voidx: 0,
            view_id: fs.first.view_id,
            is_used: fs.is_used(),
            top_valid: top.map_or(false, |p| p.is_ref()),
            bot_valid: bottom.map_or(false, |p| p.is_ref()),
            nonexisting: fs.nonexisting(),
        }
    }

    /// Snapshot of the stores the reconstruction engine may reference.
    pub fn dpb_info(&self) -> Vec<DpbInfo<H>> {
        self.stores()
            .filter(|(_, fs)| fs.is_ref() || self.is_pinned(fs))
            .map(|(_, fs)| self.store_info(fs))
            .collect()
    }

    /// Snapshot of the inter-view pictures of the current access unit only, for views
    /// decoded in another layer.
    pub fn inter_view_info(&self) -> Vec<DpbInfo<H>> {
        self.stores()
            .filter(|(_, fs)| self.is_pinned(fs))
            .map(|(_, fs)| self.store_info(fs))
            .collect()
    }
}

impl<H> Default for Dpb<H> {
    fn default() -> Self {
        // See https://github.com/rust-lang/rust/issues/26925 on why this can't
        // be derived.
        Self {
            entries: Default::default(),
            max_num_pics: 1,
            max_num_reorder_frames: Default::default(),
            interlaced: Default::default(),
            layer_id: Default::default(),
            max_long_term_frame_idx: Default::default(),
            last_output_poc: Default::default(),
            last_output_view_id: Default::default(),
            last_field: Default::default(),
            current_au: Default::default(),
        }
    }
}

impl<H> std::fmt::Debug for Dpb<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores = self.stores().collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("stores", &stores)
            .field("max_num_pics", &self.max_num_pics)
            .field("max_num_reorder_frames", &self.max_num_reorder_frames)
            .field("interlaced", &self.interlaced)
            .field("layer_id", &self.layer_id)
            .finish()
    }
}
