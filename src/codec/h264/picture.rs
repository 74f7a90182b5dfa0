// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::codec::h264::parser::RefPicMarking;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::SliceType;
use crate::Resolution;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity. A frame has no parity and maps to itself.
    pub fn opposite(&self) -> Self {
        match *self {
            Field::Frame => Field::Frame,
            Field::Top => Field::Bottom,
            Field::Bottom => Field::Top,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// A decoded frame or field, as tracked by the DPB.
///
/// Pairing between the two fields of a frame is positional: both live in the same
/// [`FrameStore`](crate::codec::h264::dpb::FrameStore), so a picture never points to its
/// complementary field.
#[derive(Clone, Debug, Default)]
pub struct PictureData {
    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,

    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: i32,

    pub coded_resolution: Resolution,
    pub display_resolution: Resolution,

    pub type_: SliceType,
    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    reference: Reference,
    pub needed_for_output: bool,

    // Does memory management op 5 needs to be executed after this
    // picture has finished decoding?
    pub has_mmco_5: bool,

    // Created by the decoding process for gaps in frame_num.
    // Not for decode or output.
    pub nonexisting: bool,

    pub field: Field,

    // Values from slice_hdr to be used during reference marking and
    // memory management after finishing this picture.
    pub ref_pic_marking: RefPicMarking,

    is_second_field: bool,

    /// View this picture belongs to. Always 0 for streams without MVC.
    pub view_id: u16,
    /// Whether pictures of other views in the same access unit may predict from this one.
    pub inter_view_flag: bool,
    pub anchor_pic_flag: bool,
    /// DPB layer holding this picture: 0 for the base view, 1 for every other view.
    pub layer_id: usize,
    /// Decoding order number, used to break ties between equal POCs.
    pub dec_no: u64,
    /// Access unit this picture was decoded in.
    pub au_no: u64,

    pub timestamp: u64,
}

impl PictureData {
    pub fn new_non_existing(frame_num: i32, timestamp: u64) -> Self {
        PictureData {
            frame_num,
            nonexisting: true,
            nal_ref_idc: 1,
            field: Field::Frame,
            pic_num: frame_num,
            reference: Reference::ShortTerm,
            timestamp,
            ..Default::default()
        }
    }

    pub fn new_from_slice(slice: &Slice, timestamp: u64) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu.header;
        let sps = &slice.sps;

        let is_idr = if nalu_hdr.idr_pic_flag {
            IsIdr::Yes {
                idr_pic_id: hdr.idr_pic_id,
            }
        } else {
            IsIdr::No
        };

        let reference = if nalu_hdr.ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        let pic_num = if !hdr.field_pic_flag {
            i32::from(hdr.frame_num)
        } else {
            2 * i32::from(hdr.frame_num) + 1
        };

        let (
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0,
            delta_pic_order_cnt1,
        ) = match sps.pic_order_cnt_type {
            0 => (
                hdr.pic_order_cnt_lsb,
                hdr.delta_pic_order_cnt_bottom,
                Default::default(),
                Default::default(),
            ),
            1 => (
                Default::default(),
                Default::default(),
                hdr.delta_pic_order_cnt[0],
                hdr.delta_pic_order_cnt[1],
            ),
            _ => Default::default(),
        };

        let coded_resolution = Resolution {
            width: sps.width(),
            height: sps.height(),
        };

        let visible_rect = sps.visible_rectangle();
        let display_resolution = Resolution {
            width: visible_rect.max.x - visible_rect.min.x,
            height: visible_rect.max.y - visible_rect.min.y,
        };

        let (view_id, inter_view_flag, anchor_pic_flag) = match &nalu_hdr.mvc {
            Some(mvc) => (mvc.view_id, mvc.inter_view_flag, mvc.anchor_pic_flag),
            None => (0, false, false),
        };

        PictureData {
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb: i32::from(pic_order_cnt_lsb),
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0,
            delta_pic_order_cnt1,
            pic_num,
            frame_num: i32::from(hdr.frame_num),
            type_: hdr.slice_type,
            nal_ref_idc: nalu_hdr.ref_idc,
            is_idr,
            reference,
            field: hdr.field(),
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            coded_resolution,
            display_resolution,
            view_id,
            inter_view_flag,
            anchor_pic_flag,
            layer_id: usize::from(nalu_hdr.is_non_base_view()),
            timestamp,
            ..Default::default()
        }
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_idr(&self) -> bool {
        matches!(self.is_idr, IsIdr::Yes { .. })
    }

    /// Whether this picture is a second field.
    pub fn is_second_field(&self) -> bool {
        self.is_second_field
    }

    pub fn set_second_field(&mut self, is_second_field: bool) {
        self.is_second_field = is_second_field;
    }

    /// Returns a reference to the picture's Reference
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Mark the picture as a reference picture. Marking of the complementary field, when
    /// needed, is done by the DPB which owns both fields.
    pub fn set_reference(&mut self, reference: Reference) {
        log::trace!(
            "Set reference of POC {} ({:?}) to {:?}",
            self.pic_order_cnt,
            self.field,
            reference
        );
        self.reference = reference;
    }

    /// Split a frame into two complementary fields. `self` becomes the field with the lower
    /// POC and the other field is returned.
    pub fn split_frame(&mut self) -> PictureData {
        debug!(
            "Splitting picture (frame_num, POC) ({:?}, {:?})",
            self.frame_num, self.pic_order_cnt
        );

        let (field, pic_order_cnt) = if self.top_field_order_cnt < self.bottom_field_order_cnt {
            self.field = Field::Top;
            self.pic_order_cnt = self.top_field_order_cnt;

            (Field::Bottom, self.bottom_field_order_cnt)
        } else {
            self.field = Field::Bottom;
            self.pic_order_cnt = self.bottom_field_order_cnt;

            (Field::Top, self.top_field_order_cnt)
        };

        PictureData {
            pic_order_cnt,
            field,
            is_second_field: true,
            needed_for_output: false,
            ..self.clone()
        }
    }
}
