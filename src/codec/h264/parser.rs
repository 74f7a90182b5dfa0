// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use enumn::N;
use log::debug;
use thiserror::Error;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::picture::Field;

pub(super) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(super) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(super) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(super) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27, 20,
    13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58, 59,
    52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

/// Number of SPS and subset SPS slots.
pub const MAX_SPS_COUNT: usize = 32;
/// Number of PPS slots.
pub const MAX_PPS_COUNT: usize = 256;
/// The maximum number of frames in the DPB, as per A.3.1, clause h)
pub const MAX_DPB_SIZE: usize = 16;
/// Maximum number of views of a MVC stream.
pub const MAX_VIEW_NUM: usize = 1024;
/// Maximum number of slice groups, see A.2.1.
pub const MAX_SLICE_GROUPS: usize = 8;
/// Upper bound on the number of entries of a reference picture list, including
/// the terminating modification command.
pub const MAX_LIST_SIZE: usize = 33;

/// A slice, SPS or PPS referenced an id that has no parameter set stored.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnknownParameterSet {
    #[error("SPS {0} has not been received")]
    Sps(u8),
    #[error("subset SPS {0} has not been received")]
    SubsetSps(u8),
    #[error("PPS {0} has not been received")]
    Pps(u8),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
    /* if modification_of_pic_nums_idc == 4 || 5 */
    pub abs_diff_view_idx_minus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i8; 32],

    /* if seq->ChromaArrayType != 0 */
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i8; 2]; 32],

    /* if slice->slice_type % 5 == 1 */
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],

    /* and if seq->ChromaArrayType != 0 */
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i8; 2]; 32],
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value indicating "no long-term frame indices". This type allows easy conversion
/// between the actual and "plus1" representation, while ensuring that the special value is always
/// handled by the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Specifies a control operation to be applied to affect the reference
    /// picture marking. See Table 7-9.
    pub memory_management_control_operation: u8,

    /// Used (with memory_management_control_operation equal to 3 or 1) to
    /// assign a long-term frame index to a short-term reference picture or to
    /// mark a short-term reference picture as "unused for reference".
    pub difference_of_pic_nums_minus1: u32,

    /// Used (with memory_management_control_operation equal to 2) to mark a
    /// long-term reference picture as "unused for reference".
    pub long_term_pic_num: u32,

    /// Used (with memory_management_control_operation equal to 3 or 6) to
    /// assign a long-term frame index to a picture.
    pub long_term_frame_idx: u32,

    /// Specifies the maximum value of long-term frame index allowed for
    /// long-term reference pictures (until receipt of another value of
    /// `max_long_term_frame_idx_plus1`).
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// If unset, the IDR picture is marked as "used for short-term reference"
    /// and MaxLongTermFrameIdx becomes "no long-term frame indices". If set,
    /// the IDR picture is marked "used for long-term reference" with
    /// LongTermFrameIdx 0 and MaxLongTermFrameIdx is set to 0.
    pub long_term_reference_flag: bool,

    /// Selects the reference picture marking mode of the currently decoded
    /// picture as specified in Table 7-8.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// The memory management control operations, in bitstream order.
    pub inner: Vec<RefPicMarkingInner>,
}

impl RefPicMarking {
    /// Whether the marking contains a `memory_management_control_operation`
    /// equal to 5.
    pub fn has_mmco_5(&self) -> bool {
        self.inner
            .iter()
            .any(|m| m.memory_management_control_operation == 5)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// Specifies the coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,

    // Specifies the picture parameter set in use
    pub pic_parameter_set_id: u8,

    /// Specifies the colour plane associated with the current slice RBSP when
    /// `separate_colour_plane_flag` is set.
    pub colour_plane_id: u8,

    /// Used as an identifier for pictures and shall be represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,

    /// If set, specifies that the slice is a slice of a coded field. If not
    /// set, specifies that the slice is a slice of a coded frame.
    pub field_pic_flag: bool,

    /// If set, specifies that the slice is part of a coded bottom field. If not
    /// set, specifies that the picture is a coded top field.
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture. Consecutive IDR access units use different
    /// values.
    pub idr_pic_id: u16,

    /// Specifies the picture order count modulo `MaxPicOrderCntLsb` for the top
    /// field of a coded frame or for a coded field.
    pub pic_order_cnt_lsb: u16,

    /// Specifies the picture order count difference between the bottom field
    /// and the top field of a coded frame.
    pub delta_pic_order_cnt_bottom: i32,

    /// Picture order count differences from the expected picture order count
    /// for the top field (or field) and for the bottom field of a coded frame.
    /// See clause 8.2.1.
    pub delta_pic_order_cnt: [i32; 2],

    /// Size in bits of the picture order count syntax elements.
    pub pic_order_cnt_bit_size: usize,

    /// Zero for slices belonging to the primary coded picture, greater than
    /// zero for redundant coded pictures.
    pub redundant_pic_cnt: u8,

    /// Specifies the method used in the decoding process to derive motion
    /// vectors and reference indices for inter prediction.
    pub direct_spatial_mv_pred_flag: bool,

    /// If set, `num_ref_idx_l0_active_minus1` (and `num_ref_idx_l1_active_minus1`
    /// for B slices) are present in the header instead of being inferred from
    /// the PPS.
    pub num_ref_idx_active_override_flag: bool,

    /// Specifies the maximum reference index for reference picture list 0 that
    /// shall be used to decode the slice.
    pub num_ref_idx_l0_active_minus1: u8,

    /// Specifies the maximum reference index for reference picture list 1 that
    /// shall be used to decode the slice.
    pub num_ref_idx_l1_active_minus1: u8,

    /// If set, `ref_pic_list_modification_l0` holds the modification commands
    /// of list 0.
    pub ref_pic_list_modification_flag_l0: bool,

    /// Reference picture list 0 modification as parsed with the
    /// `ref_pic_list_modification()` or `ref_pic_list_mvc_modification()`
    /// process.
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,

    /// If set, `ref_pic_list_modification_l1` holds the modification commands
    /// of list 1.
    pub ref_pic_list_modification_flag_l1: bool,

    /// Reference picture list 1 modification commands.
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    /// Prediction weight table as parsed using 7.3.3.2
    pub pred_weight_table: PredWeightTable,

    /// Decoded reference picture marking parsed using 7.3.3.3
    pub dec_ref_pic_marking: RefPicMarking,

    /// Size in bits of `dec_ref_pic_marking()`.
    pub dec_ref_pic_marking_bit_size: usize,

    /// Specifies the index for determining the initialization table used in the
    /// initialization process for context variables.
    pub cabac_init_idc: u8,

    /// Specifies the initial value of QP Y to be used for all the macroblocks
    /// in the slice until modified by `mb_qp_delta`.
    pub slice_qp_delta: i8,

    /// Specifies the decoding process to be used to decode P macroblocks in an
    /// SP slice.
    pub sp_for_switch_flag: bool,

    /// Specifies the value of QSY for all the macroblocks in SP and SI slices.
    pub slice_qs_delta: i8,

    /// Specifies whether the operation of the deblocking filter shall be
    /// disabled across some block edges of the slice.
    pub disable_deblocking_filter_idc: u8,

    /// Offset used in accessing the α and tC0 deblocking filter tables.
    pub slice_alpha_c0_offset_div2: i8,

    /// Offset used in accessing the β deblocking filter table.
    pub slice_beta_offset_div2: i8,

    /// Slice group change cycle, present when the PPS uses slice group map
    /// types 3 to 5.
    pub slice_group_change_cycle: u32,

    /// Same as `MaxPicNum` in ITU-T H.264.
    pub max_pic_num: u32,

    /// Size of the slice_header() in bits
    pub header_bit_size: usize,

    /// Number of emulation prevention bytes (EPB) in this slice_header()
    pub n_emulation_prevention_bytes: usize,
}

impl SliceHeader {
    /// Returns the field that is coded by this header.
    pub fn field(&self) -> Field {
        if self.field_pic_flag {
            if self.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        }
    }
}

/// A H264 slice. An integer number of macroblocks or macroblock pairs ordered
/// consecutively in the raster scan within a particular slice group.
#[derive(Clone, Debug)]
pub struct Slice {
    /// The slice header.
    pub header: SliceHeader,
    /// The NAL unit backing this slice.
    pub nalu: Nalu,
    /// The SPS in effect for this slice, taken from the subset SPS table for
    /// non-base views.
    pub sps: Arc<Sps>,
    /// The PPS referenced by the slice.
    pub pps: Arc<Pps>,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
/// See table 7-6 in ITU-T H.264.
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6 in ITU-T H.264.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6 in ITU-T H.264.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-6 in ITU-T H.264.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    /// Whether this is a SP slice. See table 7-6 in ITU-T H.264.
    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    /// Whether this is a SI slice. See table 7-6 in ITU-T H.264.
    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

impl Default for SliceType {
    fn default() -> Self {
        Self::P
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Cavlc444 = 44,
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    MultiviewHigh = 118,
    High422P = 122,
    StereoHigh = 128,
    High444P = 244,
}

impl Profile {
    /// Whether `profile_idc` signals one of the MVC profiles.
    pub fn is_mvc(profile_idc: u8) -> bool {
        profile_idc == Profile::MultiviewHigh as u8 || profile_idc == Profile::StereoHigh as u8
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// A H264 Sequence Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded video sequences.
#[derive(Debug, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by the picture
    /// parameter set
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,

    /// Retains the same meaning as in ITU-T H.264. See 7.4.2.1.1
    pub constraint_set0_flag: bool,
    /// Retains the same meaning as in ITU-T H.264. See 7.4.2.1.1
    pub constraint_set1_flag: bool,
    /// Retains the same meaning as in ITU-T H.264. See 7.4.2.1.1
    pub constraint_set2_flag: bool,
    /// Retains the same meaning as in ITU-T H.264. See 7.4.2.1.1
    pub constraint_set3_flag: bool,
    /// Retains the same meaning as in ITU-T H.264. See 7.4.2.1.1
    pub constraint_set4_flag: bool,
    /// Retains the same meaning as in ITU-T H.264. See 7.4.2.1.1
    pub constraint_set5_flag: bool,

    /// Level to which the coded video sequence conforms
    pub level_idc: Level,

    /// Specifies the chroma sampling relative to the luma sampling as specified
    /// in clause 6.2.
    pub chroma_format_idc: u8,

    /// Specifies whether the three colour components of the 4:4:4 chroma format
    /// are coded separately.
    pub separate_colour_plane_flag: bool,

    /// Bit depth of the luma samples minus 8.
    pub bit_depth_luma_minus8: u8,

    /// Bit depth of the chroma samples minus 8.
    pub bit_depth_chroma_minus8: u8,

    /// Whether the transform bypass applies when QP′Y is 0.
    pub qpprime_y_zero_transform_bypass_flag: bool,

    /// Whether `seq_scaling_list_present_flag[i]` is present. If not, the flat
    /// lists apply.
    pub seq_scaling_matrix_present_flag: bool,

    /// 4x4 Scaling list as read with 7.3.2.1.1.1
    pub scaling_lists_4x4: [[u8; 16]; 6],
    /// 8x8 Scaling list as read with 7.3.2.1.1.1
    pub scaling_lists_8x8: [[u8; 64]; 6],

    /// MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4)
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count (as specified in
    /// clause 8.2.1)
    pub pic_order_cnt_type: u8,

    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4)
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// If true, `delta_pic_order_cnt[0]` and `delta_pic_order_cnt[1]` are not
    /// present in the slice headers and are inferred to be 0.
    pub delta_pic_order_always_zero_flag: bool,

    /// Used to calculate the picture order count of a non-reference picture as
    /// specified in clause 8.2.1.
    pub offset_for_non_ref_pic: i32,

    /// Used to calculate the picture order count of a bottom field as specified
    /// in clause 8.2.1.
    pub offset_for_top_to_bottom_field: i32,

    /// Used in the decoding process for picture order count as specified in
    /// clause 8.2.1
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,

    /// An element of a list of num_ref_frames_in_pic_order_cnt_cycle values
    /// used in the decoding process for picture order count as specified in
    /// clause 8.2.
    pub offset_for_ref_frame: [i32; 255],

    /// Specifies the maximum number of short-term and long-term reference
    /// frames, complementary reference field pairs, and non-paired reference
    /// fields. Also determines the size of the sliding window operation as
    /// specified in clause 8.2.5.3.
    pub max_num_ref_frames: u8,

    /// Whether gaps in frame_num are allowed, see clause 8.2.5.2.
    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1 specifies the width of each decoded picture in units of
    /// macroblocks.
    pub pic_width_in_mbs_minus1: u16,
    /// Plus 1 specifies the height in slice group map units of a decoded frame
    /// or field.
    pub pic_height_in_map_units_minus1: u16,

    /// If true, every coded picture of the coded video sequence is a coded
    /// frame containing only frame macroblocks.
    pub frame_mbs_only_flag: bool,

    /// If true, specifies the possible use of switching between frame and field
    /// macroblocks within frames.
    pub mb_adaptive_frame_field_flag: bool,

    /// Specifies the method used in the derivation process for luma motion
    /// vectors for B_Skip, B_Direct_16x16 and B_Direct_8x8.
    pub direct_8x8_inference_flag: bool,

    /// If true, the frame cropping offsets follow.
    pub frame_cropping_flag: bool,

    /// Frame cropping offsets, in crop units.
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    // Calculated
    /// Same as ExpectedDeltaPerPicOrderCntCycle, see 7-12 in ITU-T H.264.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17 in ITU-T H.264.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17 in ITU-T H.264.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Same as `PicSizeInMapUnits`, see 7-17.
    pub fn pic_size_in_map_units(&self) -> u32 {
        (u32::from(self.pic_width_in_mbs_minus1) + 1)
            * (u32::from(self.pic_height_in_map_units_minus1) + 1)
    }

    /// Returns `ChromaArrayType`, as computed in ITU-T H.264.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC`.
    ///
    /// See table 6-1 in ITU-T H.264.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // undefined.
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`.
    ///
    /// See 7-19 through 7-22 in ITU-T H.264.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }

    /// Same as MaxFrameNum. See 7-10 in ITU-T H.264.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11 in ITU-T H.264.
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect {
                min: Point { x: 0, y: 0 },
                max: Point {
                    x: self.width(),
                    y: self.height(),
                },
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        let crop_left = crop_unit_x * self.frame_crop_left_offset;
        let crop_right = crop_unit_x * self.frame_crop_right_offset;
        let crop_top = crop_unit_y * self.frame_crop_top_offset;
        let crop_bottom = crop_unit_y * self.frame_crop_bottom_offset;

        Rect {
            min: Point {
                x: crop_left,
                y: crop_top,
            },
            max: Point {
                x: self.width() - crop_left - crop_right,
                y: self.height() - crop_top - crop_bottom,
            },
        }
    }

    /// Returns the DPB capacity in frames for this sequence (Table A-1),
    /// clamped to [`MAX_DPB_SIZE`].
    pub fn max_dpb_frames(&self) -> usize {
        let profile = self.profile_idc;
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(level, Level::L1_1)
            && (profile == Profile::Baseline as u8 || profile == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        };

        // Table A.1
        let max_dpb_mbs = match level {
            Level::L1 => 396,
            Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        };

        let width_mb = self.width() / 16;
        let height_mb = self.height() / 16;

        let max_dpb_frames =
            std::cmp::min(max_dpb_mbs / (width_mb * height_mb), MAX_DPB_SIZE as u32) as usize;

        let mut max_dpb_frames = std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize);

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            max_dpb_frames = std::cmp::max(1, self.vui_parameters.max_dec_frame_buffering as usize);
        }

        std::cmp::min(max_dpb_frames, MAX_DPB_SIZE)
    }

    pub fn max_num_order_frames(&self) -> u32 {
        let vui = &self.vui_parameters;
        let present = self.vui_parameters_present_flag && vui.bitstream_restriction_flag;

        if present {
            vui.max_num_reorder_frames
        } else {
            let profile = self.profile_idc;
            if (profile == 44
                || profile == 86
                || profile == 100
                || profile == 110
                || profile == 122
                || profile == 244)
                && self.constraint_set3_flag
            {
                0
            } else {
                self.max_dpb_frames() as u32
            }
        }
    }
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            scaling_lists_4x4: [[16; 16]; 6],
            scaling_lists_8x8: [[16; 64]; 6],
            offset_for_ref_frame: [0; 255],
            seq_parameter_set_id: Default::default(),
            profile_idc: Default::default(),
            constraint_set0_flag: Default::default(),
            constraint_set1_flag: Default::default(),
            constraint_set2_flag: Default::default(),
            constraint_set3_flag: Default::default(),
            constraint_set4_flag: Default::default(),
            constraint_set5_flag: Default::default(),
            level_idc: Default::default(),
            chroma_format_idc: 1,
            separate_colour_plane_flag: Default::default(),
            bit_depth_luma_minus8: Default::default(),
            bit_depth_chroma_minus8: Default::default(),
            qpprime_y_zero_transform_bypass_flag: Default::default(),
            seq_scaling_matrix_present_flag: Default::default(),
            log2_max_frame_num_minus4: Default::default(),
            pic_order_cnt_type: Default::default(),
            log2_max_pic_order_cnt_lsb_minus4: Default::default(),
            delta_pic_order_always_zero_flag: Default::default(),
            offset_for_non_ref_pic: Default::default(),
            offset_for_top_to_bottom_field: Default::default(),
            num_ref_frames_in_pic_order_cnt_cycle: Default::default(),
            max_num_ref_frames: Default::default(),
            gaps_in_frame_num_value_allowed_flag: Default::default(),
            pic_width_in_mbs_minus1: Default::default(),
            pic_height_in_map_units_minus1: Default::default(),
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: Default::default(),
            direct_8x8_inference_flag: Default::default(),
            frame_cropping_flag: Default::default(),
            frame_crop_left_offset: Default::default(),
            frame_crop_right_offset: Default::default(),
            frame_crop_top_offset: Default::default(),
            frame_crop_bottom_offset: Default::default(),
            expected_delta_per_pic_order_cnt_cycle: Default::default(),
            vui_parameters_present_flag: Default::default(),
            vui_parameters: Default::default(),
        }
    }
}

/// Builds a [`Sps`] without going through the bitstream. Used by tests that
/// exercise the picture management code directly.
#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        let mb_width = (width + MB_SIZE - 1) / MB_SIZE;
        let mb_height = (height + MB_SIZE - 1) / MB_SIZE;

        self.0.pic_width_in_mbs_minus1 = (mb_width - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (mb_height - 1) as u16;
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    pub fn max_frame_num(mut self, value: u32) -> Self {
        self.0.log2_max_frame_num_minus4 = value.ilog2() as u8 - 4u8;
        self
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn max_pic_order_cnt_lsb(mut self, value: u32) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value.ilog2() as u8 - 4u8;
        self
    }

    /// Sets the POC type 1 parameters.
    pub fn pic_order_cnt_cycle(
        mut self,
        offset_for_non_ref_pic: i32,
        offset_for_top_to_bottom_field: i32,
        offsets: &[i32],
    ) -> Self {
        self.0.pic_order_cnt_type = 1;
        self.0.offset_for_non_ref_pic = offset_for_non_ref_pic;
        self.0.offset_for_top_to_bottom_field = offset_for_top_to_bottom_field;
        self.0.num_ref_frames_in_pic_order_cnt_cycle = offsets.len() as u8;
        self.0.offset_for_ref_frame[..offsets.len()].copy_from_slice(offsets);
        self.0.expected_delta_per_pic_order_cnt_cycle =
            offsets.iter().fold(0i32, |acc, offset| acc.wrapping_add(*offset));
        self
    }

    pub fn max_num_reorder_frames(mut self, value: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_num_reorder_frames = value;
        self.0.vui_parameters.max_dec_frame_buffering =
            std::cmp::max(value, u32::from(self.0.max_num_ref_frames));
        self
    }

    pub fn build(self) -> Arc<Sps> {
        Arc::new(self.0)
    }
}

/// References of one view as listed in `seq_parameter_set_mvc_extension()`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcViewRefs {
    pub view_id: u16,
    pub anchor_refs_l0: Vec<u16>,
    pub anchor_refs_l1: Vec<u16>,
    pub non_anchor_refs_l0: Vec<u16>,
    pub non_anchor_refs_l1: Vec<u16>,
}

impl MvcViewRefs {
    /// The inter-view references of `list` for anchor or non-anchor pictures.
    pub fn refs(&self, anchor: bool, list: usize) -> &[u16] {
        match (anchor, list) {
            (true, 0) => &self.anchor_refs_l0,
            (true, _) => &self.anchor_refs_l1,
            (false, 0) => &self.non_anchor_refs_l0,
            (false, _) => &self.non_anchor_refs_l1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcOperationPoint {
    pub temporal_id: u8,
    pub target_view_ids: Vec<u16>,
    pub num_views_minus1: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcLevel {
    pub level_idc: u8,
    pub operation_points: Vec<MvcOperationPoint>,
}

/// `seq_parameter_set_mvc_extension()`, see H.7.3.2.1.4.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsMvcExtension {
    pub num_views_minus1: u16,
    /// Views in view order, i.e. indexed by VOIdx.
    pub views: Vec<MvcViewRefs>,
    pub levels: Vec<MvcLevel>,
}

impl SpsMvcExtension {
    /// Returns the view order index of `view_id`.
    pub fn view_order_idx(&self, view_id: u16) -> Option<usize> {
        self.views.iter().position(|v| v.view_id == view_id)
    }

    pub fn view(&self, view_id: u16) -> Option<&MvcViewRefs> {
        self.views.iter().find(|v| v.view_id == view_id)
    }
}

/// A subset sequence parameter set (NAL 15) of a MVC stream: an SPS body
/// followed by the MVC extension.
#[derive(Debug, PartialEq, Eq)]
pub struct SubsetSps {
    pub sps: Arc<Sps>,
    pub mvc: SpsMvcExtension,
    pub mvc_vui_parameters_present_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Plus 1 specifies the number of alternative CPB specifications in the
    /// bitstream.
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,

    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],

    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    /// Table E-1. 255 means Extended_SAR.
    pub aspect_ratio_idc: u8,

    /* if aspect_ratio_idc == 255 */
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    /* if overscan_info_present_flag */
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    /// Table E-2. Inferred to be 5 when absent.
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    /* if timing_info_present_flag */
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    /* if nal_hrd_parameters_present_flag */
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    /* if vcl_hrd_parameters_present_flag */
    pub vcl_hrd_parameters: HrdParams,

    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    /*  if bitstream_restriction_flag */
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    /// Upper bound of the number of frames that precede any frame in decoding
    /// order and follow it in output order.
    pub max_num_reorder_frames: u32,
    /// Required size of the DPB in frame buffers.
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: Default::default(),
            aspect_ratio_idc: Default::default(),
            sar_width: Default::default(),
            sar_height: Default::default(),
            overscan_info_present_flag: Default::default(),
            overscan_appropriate_flag: Default::default(),
            video_signal_type_present_flag: Default::default(),
            video_format: 5,
            video_full_range_flag: Default::default(),
            colour_description_present_flag: Default::default(),
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: Default::default(),
            chroma_sample_loc_type_top_field: Default::default(),
            chroma_sample_loc_type_bottom_field: Default::default(),
            timing_info_present_flag: Default::default(),
            num_units_in_tick: Default::default(),
            time_scale: Default::default(),
            fixed_frame_rate_flag: Default::default(),
            nal_hrd_parameters_present_flag: Default::default(),
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: Default::default(),
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: Default::default(),
            pic_struct_present_flag: Default::default(),
            bitstream_restriction_flag: Default::default(),
            motion_vectors_over_pic_boundaries_flag: Default::default(),
            max_bytes_per_pic_denom: Default::default(),
            max_bits_per_mb_denom: Default::default(),
            log2_max_mv_length_horizontal: Default::default(),
            log2_max_mv_length_vertical: Default::default(),
            max_num_reorder_frames: Default::default(),
            max_dec_frame_buffering: Default::default(),
        }
    }
}

/// Scaling lists of a picture in raster order, ready to be handed to the
/// reconstruction engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingMatrices {
    pub lists_4x4: [[u8; 16]; 6],
    pub lists_8x8: [[u8; 64]; 6],
}

/// A H264 Picture Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded pictures as determined by the
/// `pic_parameter_set_id` syntax element found in each slice header.
#[derive(Debug, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the picture parameter set that is referred to in the slice header.
    pub pic_parameter_set_id: u8,

    /// Refers to the active sequence parameter set.
    pub seq_parameter_set_id: u8,

    /// Selects CABAC when set and Exp-Golomb/CAVLC otherwise.
    pub entropy_coding_mode_flag: bool,

    /// If true, `delta_pic_order_cnt_bottom` (POC type 0) or
    /// `delta_pic_order_cnt[1]` (POC type 1) are present in the slice headers
    /// of coded frames.
    pub bottom_field_pic_order_in_frame_present_flag: bool,

    /// Plus 1 specifies the number of slice groups for a picture.
    pub num_slice_groups_minus1: u32,

    /// How the macroblocks are mapped to slice groups, see 8.2.2.
    pub slice_group_map_type: u8,
    /* if slice_group_map_type == 0 */
    pub run_length_minus1: Vec<u32>,
    /* if slice_group_map_type == 2 */
    pub top_left: Vec<u32>,
    pub bottom_right: Vec<u32>,
    /* if slice_group_map_type == 3 || 4 || 5 */
    pub slice_group_change_direction_flag: bool,
    pub slice_group_change_rate_minus1: u32,
    /* if slice_group_map_type == 6 */
    pub pic_size_in_map_units_minus1: u32,
    pub slice_group_id: Vec<u8>,

    /// Specifies how `num_ref_idx_l0_active_minus1` is inferred for P, SP, and
    /// B slices with `num_ref_idx_active_override_flag` not set.
    pub num_ref_idx_l0_default_active_minus1: u8,

    /// Specifies how `num_ref_idx_l1_active_minus1` is inferred for B slices
    /// with `num_ref_idx_active_override_flag` not set.
    pub num_ref_idx_l1_default_active_minus1: u8,

    /// Whether explicit weighted prediction applies to P and SP slices.
    pub weighted_pred_flag: bool,

    /// 0: default, 1: explicit, 2: implicit weighted prediction for B slices.
    pub weighted_bipred_idc: u8,

    /// Initial value minus 26 of SliceQPY.
    pub pic_init_qp_minus26: i8,

    /// Initial value minus 26 of SliceQSY.
    pub pic_init_qs_minus26: i8,

    /// Offset added to QPY and QSY for the Cb chroma component.
    pub chroma_qp_index_offset: i8,

    /// Whether the deblocking filter controls are present in the slice header.
    pub deblocking_filter_control_present_flag: bool,

    /// Whether constrained intra prediction is in use.
    pub constrained_intra_pred_flag: bool,

    /// Whether `redundant_pic_cnt` is present in slice headers.
    pub redundant_pic_cnt_present_flag: bool,

    /// Whether the 8x8 transform decoding process may be in use.
    pub transform_8x8_mode_flag: bool,

    /// Whether the PPS carries its own scaling lists. If not, the lists of the
    /// SPS apply.
    pub pic_scaling_matrix_present_flag: bool,

    /// 4x4 Scaling list as read with 7.3.2.1.1.1
    pub scaling_lists_4x4: [[u8; 16]; 6],
    /// 8x8 Scaling list as read with 7.3.2.1.1.1
    pub scaling_lists_8x8: [[u8; 64]; 6],

    /// Offset added to QPY and QSY for the Cr chroma component. Inferred to be
    /// `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,

    /// The SPS referenced by this PPS at the time it was parsed.
    pub sps: Arc<Sps>,
}

impl Pps {
    fn new(pic_parameter_set_id: u8, sps: Arc<Sps>) -> Self {
        Pps {
            pic_parameter_set_id,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            slice_group_map_type: 0,
            run_length_minus1: vec![],
            top_left: vec![],
            bottom_right: vec![],
            slice_group_change_direction_flag: false,
            slice_group_change_rate_minus1: 0,
            pic_size_in_map_units_minus1: 0,
            slice_group_id: vec![],
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists_4x4: sps.scaling_lists_4x4,
            scaling_lists_8x8: sps.scaling_lists_8x8,
            second_chroma_qp_index_offset: 0,
            sps,
        }
    }

    /// Returns the scaling lists in raster scan order.
    pub fn scaling_matrices(&self) -> ScalingMatrices {
        let mut matrices = ScalingMatrices {
            lists_4x4: [[0; 16]; 6],
            lists_8x8: [[0; 64]; 6],
        };

        for (src, dst) in self.scaling_lists_4x4.iter().zip(&mut matrices.lists_4x4) {
            for (i, &coeff) in src.iter().enumerate() {
                dst[ZIGZAG_4X4[i]] = coeff;
            }
        }

        for (src, dst) in self.scaling_lists_8x8.iter().zip(&mut matrices.lists_8x8) {
            for (i, &coeff) in src.iter().enumerate() {
                dst[ZIGZAG_8X8[i]] = coeff;
            }
        }

        matrices
    }

    /// Number of bits of `slice_group_change_cycle`, see 7-35.
    fn slice_group_change_cycle_bits(&self, sps: &Sps) -> usize {
        let pic_size = u64::from(sps.pic_size_in_map_units());
        let rate = u64::from(self.slice_group_change_rate_minus1) + 1;

        // Ceil(Log2(PicSizeInMapUnits ÷ SliceGroupChangeRate + 1))
        let mut bits = 0;
        while (rate << bits) < pic_size + rate {
            bits += 1;
        }
        bits
    }
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Arc<Sps>) -> Self {
        PpsBuilder(Pps::new(0, sps))
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn num_ref_idx_l0_default_active(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l0_default_active_minus1 = value - 1;
        self
    }

    pub fn num_ref_idx_l1_default_active(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l1_default_active_minus1 = value - 1;
        self
    }

    pub fn build(self) -> Arc<Pps> {
        Arc::new(self.0)
    }
}

/// SEI payload type of a recovery point message.
pub const SEI_RECOVERY_POINT: u32 = 6;

/// Contents of a recovery point SEI message (D.2.8). Decoding may start at the picture it is
/// attached to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryPoint {
    /// Number of frames, in output order, before the output is correct.
    pub recovery_frame_cnt: u32,
    pub exact_match_flag: bool,
    /// The references before the recovery point may be unavailable, e.g. after splicing.
    pub broken_link_flag: bool,
    pub changing_slice_group_idc: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiPayload {
    RecoveryPoint(RecoveryPoint),
    /// A payload this parser does not interpret. Its bytes are skipped.
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeiMessage {
    pub payload_type: u32,
    pub payload_size: u32,
    pub payload: SeiPayload,
}

/// The parameter set store. Holds the last SPS, subset SPS and PPS received for
/// every id.
#[derive(Debug)]
pub struct Parser {
    spses: Vec<Option<Arc<Sps>>>,
    subset_spses: Vec<Option<Arc<SubsetSps>>>,
    ppses: Vec<Option<Arc<Pps>>>,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            spses: vec![None; MAX_SPS_COUNT],
            subset_spses: vec![None; MAX_SPS_COUNT],
            ppses: vec![None; MAX_PPS_COUNT],
        }
    }
}

impl Parser {
    fn fill_default_scaling_list_4x4(scaling_list4x4: &mut [u8; 16], i: usize) {
        // See table 7.2 in the spec.
        if i < 3 {
            *scaling_list4x4 = DEFAULT_4X4_INTRA;
        } else {
            *scaling_list4x4 = DEFAULT_4X4_INTER;
        }
    }

    fn fill_default_scaling_list_8x8(scaling_list8x8: &mut [u8; 64], i: usize) {
        if i % 2 == 0 {
            *scaling_list8x8 = DEFAULT_8X8_INTRA;
        } else {
            *scaling_list8x8 = DEFAULT_8X8_INTER;
        }
    }

    fn fill_fallback_scaling_list_4x4(
        scaling_list4x4: &mut [[u8; 16]; 6],
        i: usize,
        default_scaling_list_intra: &[u8; 16],
        default_scaling_list_inter: &[u8; 16],
    ) {
        // See table 7.2 in the spec.
        scaling_list4x4[i] = match i {
            0 => *default_scaling_list_intra,
            3 => *default_scaling_list_inter,
            _ => scaling_list4x4[i - 1],
        }
    }

    fn fill_fallback_scaling_list_8x8(
        scaling_list8x8: &mut [[u8; 64]; 6],
        i: usize,
        default_scaling_list_intra: &[u8; 64],
        default_scaling_list_inter: &[u8; 64],
    ) {
        // See table 7.2 in the spec.
        scaling_list8x8[i] = match i {
            0 => *default_scaling_list_intra,
            1 => *default_scaling_list_inter,
            _ => scaling_list8x8[i - 2],
        }
    }

    fn parse_scaling_list<U: AsMut<[u8]>>(
        r: &mut NaluReader,
        scaling_list: &mut U,
        use_default: &mut bool,
    ) -> anyhow::Result<()> {
        // 7.3.2.1.1.1
        let mut last_scale = 8u8;
        let mut next_scale = 8u8;

        for j in 0..scaling_list.as_mut().len() {
            if next_scale != 0 {
                let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
                next_scale = ((last_scale as i32 + delta_scale + 256) % 256) as u8;
                *use_default = j == 0 && next_scale == 0;
                if *use_default {
                    return Ok(());
                }
            }

            scaling_list.as_mut()[j] = if next_scale == 0 {
                last_scale
            } else {
                next_scale
            };

            last_scale = scaling_list.as_mut()[j];
        }

        Ok(())
    }

    fn parse_sps_scaling_lists(r: &mut NaluReader, sps: &mut Sps) -> anyhow::Result<()> {
        let scaling_lists4x4 = &mut sps.scaling_lists_4x4;
        let scaling_lists8x8 = &mut sps.scaling_lists_8x8;

        for i in 0..6 {
            let seq_scaling_list_present_flag = r.read_bit()?;
            if seq_scaling_list_present_flag {
                let mut use_default = false;

                Parser::parse_scaling_list(r, &mut scaling_lists4x4[i], &mut use_default)?;

                if use_default {
                    Parser::fill_default_scaling_list_4x4(&mut scaling_lists4x4[i], i);
                }
            } else {
                // Table 7-2: Fallback rule A
                Parser::fill_fallback_scaling_list_4x4(
                    scaling_lists4x4,
                    i,
                    &DEFAULT_4X4_INTRA,
                    &DEFAULT_4X4_INTER,
                );
            }
        }

        let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
        for i in 0..num_8x8 {
            let seq_scaling_list_present_flag = r.read_bit()?;
            if seq_scaling_list_present_flag {
                let mut use_default = false;
                Parser::parse_scaling_list(r, &mut scaling_lists8x8[i], &mut use_default)?;

                if use_default {
                    Parser::fill_default_scaling_list_8x8(&mut scaling_lists8x8[i], i);
                }
            } else {
                Parser::fill_fallback_scaling_list_8x8(
                    scaling_lists8x8,
                    i,
                    &DEFAULT_8X8_INTRA,
                    &DEFAULT_8X8_INTER,
                );
            }
        }
        Ok(())
    }

    fn parse_pps_scaling_lists(r: &mut NaluReader, pps: &mut Pps, sps: &Sps) -> anyhow::Result<()> {
        let scaling_lists4x4 = &mut pps.scaling_lists_4x4;
        let scaling_lists8x8 = &mut pps.scaling_lists_8x8;

        for i in 0..6 {
            let pic_scaling_list_present_flag = r.read_bit()?;
            if pic_scaling_list_present_flag {
                let mut use_default = false;

                Parser::parse_scaling_list(r, &mut scaling_lists4x4[i], &mut use_default)?;

                if use_default {
                    Parser::fill_default_scaling_list_4x4(&mut scaling_lists4x4[i], i);
                }
            } else if !sps.seq_scaling_matrix_present_flag {
                // Table 7-2: Fallback rule A
                Parser::fill_fallback_scaling_list_4x4(
                    scaling_lists4x4,
                    i,
                    &DEFAULT_4X4_INTRA,
                    &DEFAULT_4X4_INTER,
                );
            } else {
                // Table 7-2: Fallback rule B
                Parser::fill_fallback_scaling_list_4x4(
                    scaling_lists4x4,
                    i,
                    &sps.scaling_lists_4x4[0],
                    &sps.scaling_lists_4x4[3],
                );
            }
        }

        if pps.transform_8x8_mode_flag {
            let num8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };

            for i in 0..num8x8 {
                let pic_scaling_list_present_flag = r.read_bit()?;
                if pic_scaling_list_present_flag {
                    let mut use_default = false;

                    Parser::parse_scaling_list(r, &mut scaling_lists8x8[i], &mut use_default)?;

                    if use_default {
                        Parser::fill_default_scaling_list_8x8(&mut scaling_lists8x8[i], i);
                    }
                } else if !sps.seq_scaling_matrix_present_flag {
                    // Table 7-2: Fallback rule A
                    Parser::fill_fallback_scaling_list_8x8(
                        scaling_lists8x8,
                        i,
                        &DEFAULT_8X8_INTRA,
                        &DEFAULT_8X8_INTER,
                    );
                } else {
                    // Table 7-2: Fallback rule B
                    Parser::fill_fallback_scaling_list_8x8(
                        scaling_lists8x8,
                        i,
                        &sps.scaling_lists_8x8[0],
                        &sps.scaling_lists_8x8[1],
                    );
                }
            }
        }

        Ok(())
    }

    fn parse_hrd(r: &mut NaluReader, hrd: &mut HrdParams) -> anyhow::Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui(r: &mut NaluReader, sps: &mut Sps) -> anyhow::Result<()> {
        let vui = &mut sps.vui_parameters;

        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits(32)?;
            if vui.num_units_in_tick == 0 {
                bail!("num_units_in_tick == 0, which is not allowed by E.2.1");
            }

            vui.time_scale = r.read_bits(32)?;
            if vui.time_scale == 0 {
                bail!("time_scale == 0, which is not allowed by E.2.1");
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.max_num_reorder_frames = r.read_ue()?;
            vui.max_dec_frame_buffering = r.read_ue()?;
        }

        Ok(())
    }

    /// Parses `seq_parameter_set_data()`, shared by SPS and subset SPS units.
    fn parse_sps_data(r: &mut NaluReader) -> anyhow::Result<Sps> {
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).with_context(|| format!("Unsupported level {}", level))?;
        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                Parser::parse_sps_scaling_lists(r, &mut sps)?;
            }
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
            sps.expected_delta_per_pic_order_cnt_cycle = 0;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;

            let mut offset_acc: i32 = 0;
            for i in 0..usize::from(sps.num_ref_frames_in_pic_order_cnt_cycle) {
                sps.offset_for_ref_frame[i] = r.read_se()?;

                // (7-12) in the spec.
                offset_acc = offset_acc.wrapping_add(sps.offset_for_ref_frame[i]);
            }

            sps.expected_delta_per_pic_order_cnt_cycle = offset_acc;
        }

        sps.max_num_ref_frames = r.read_ue_max(MAX_DPB_SIZE as u32)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // Validate that cropping info is valid.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            let _ = sps
                .frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .ok_or(anyhow!("Invalid frame crop width"))?;

            let _ = sps
                .frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .ok_or(anyhow!("invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(r, &mut sps)?;
        }

        Ok(sps)
    }

    /// Parse a SPS and store it in the slot of its id, replacing any previous
    /// SPS with the same id.
    ///
    /// Returns a reference to the new SPS.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Arc<Sps>> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            bail!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            );
        }

        let mut r = NaluReader::new(nalu.payload());
        let sps = Parser::parse_sps_data(&mut r)?;
        let key = usize::from(sps.seq_parameter_set_id);

        debug!(
            "SPS {}: profile {} {}x{}",
            key,
            sps.profile_idc,
            sps.width(),
            sps.height()
        );

        let slot = self
            .spses
            .get_mut(key)
            .ok_or(anyhow!("SPS id {} out of range", key))?;
        Ok(slot.insert(Arc::new(sps)))
    }

    fn parse_view_ids(r: &mut NaluReader, max_count: u32) -> anyhow::Result<Vec<u16>> {
        let count: u32 = r.read_ue_max(max_count)?;
        let view_ids = (0..count)
            .map(|_| r.read_ue_max(MAX_VIEW_NUM as u32 - 1))
            .collect::<Result<Vec<u16>, _>>()?;

        Ok(view_ids)
    }

    fn parse_sps_mvc_extension(r: &mut NaluReader) -> anyhow::Result<SpsMvcExtension> {
        let mut ext = SpsMvcExtension {
            num_views_minus1: r.read_ue_max(MAX_VIEW_NUM as u32 - 1)?,
            ..Default::default()
        };

        for _ in 0..=ext.num_views_minus1 {
            ext.views.push(MvcViewRefs {
                view_id: r.read_ue_max(MAX_VIEW_NUM as u32 - 1)?,
                ..Default::default()
            });
        }

        for view in ext.views.iter_mut().skip(1) {
            view.anchor_refs_l0 = Parser::parse_view_ids(r, 15)?;
            view.anchor_refs_l1 = Parser::parse_view_ids(r, 15)?;
        }

        for view in ext.views.iter_mut().skip(1) {
            view.non_anchor_refs_l0 = Parser::parse_view_ids(r, 15)?;
            view.non_anchor_refs_l1 = Parser::parse_view_ids(r, 15)?;
        }

        let num_level_values_signalled_minus1: u32 = r.read_ue_max(63)?;
        for _ in 0..=num_level_values_signalled_minus1 {
            let mut level = MvcLevel {
                level_idc: r.read_bits(8)?,
                ..Default::default()
            };

            let num_applicable_ops_minus1: u32 = r.read_ue_max(MAX_VIEW_NUM as u32 - 1)?;
            for _ in 0..=num_applicable_ops_minus1 {
                let temporal_id = r.read_bits(3)?;
                let num_target_views_minus1: u32 = r.read_ue_max(MAX_VIEW_NUM as u32 - 1)?;
                let target_view_ids = (0..=num_target_views_minus1)
                    .map(|_| r.read_ue_max(MAX_VIEW_NUM as u32 - 1))
                    .collect::<Result<Vec<u16>, _>>()?;

                level.operation_points.push(MvcOperationPoint {
                    temporal_id,
                    target_view_ids,
                    num_views_minus1: r.read_ue_max(MAX_VIEW_NUM as u32 - 1)?,
                });
            }

            ext.levels.push(level);
        }

        Ok(ext)
    }

    /// Parse a subset SPS carrying the MVC extension and store it in the
    /// subset SPS slot of its id.
    pub fn parse_subset_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Arc<SubsetSps>> {
        if !matches!(nalu.header.type_, NaluType::SubsetSps) {
            bail!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::SubsetSps,
                nalu.header.type_
            );
        }

        let mut r = NaluReader::new(nalu.payload());
        let sps = Parser::parse_sps_data(&mut r)?;

        if !Profile::is_mvc(sps.profile_idc) {
            bail!("Unsupported subset SPS profile {}", sps.profile_idc);
        }

        let bit_equal_to_one = r.read_bit()?;
        if !bit_equal_to_one {
            bail!("Broken data: bit_equal_to_one is not set");
        }

        let mvc = Parser::parse_sps_mvc_extension(&mut r)?;
        // The MVC VUI extension is not needed to manage pictures and is skipped.
        let mvc_vui_parameters_present_flag = r.read_bit()?;

        let key = usize::from(sps.seq_parameter_set_id);
        debug!(
            "Subset SPS {}: {} views, profile {}",
            key,
            mvc.views.len(),
            sps.profile_idc
        );

        let subset_sps = SubsetSps {
            sps: Arc::new(sps),
            mvc,
            mvc_vui_parameters_present_flag,
        };

        let slot = self
            .subset_spses
            .get_mut(key)
            .ok_or(anyhow!("subset SPS id {} out of range", key))?;
        Ok(slot.insert(Arc::new(subset_sps)))
    }

    fn parse_slice_groups(r: &mut NaluReader, pps: &mut Pps, sps: &Sps) -> anyhow::Result<()> {
        pps.slice_group_map_type = r.read_ue_max(6)?;
        let num_groups = pps.num_slice_groups_minus1 as usize + 1;

        match pps.slice_group_map_type {
            0 => {
                for _ in 0..num_groups {
                    pps.run_length_minus1.push(r.read_ue()?);
                }
            }
            2 => {
                for _ in 0..num_groups - 1 {
                    pps.top_left.push(r.read_ue()?);
                    pps.bottom_right.push(r.read_ue()?);
                }
            }
            3..=5 => {
                pps.slice_group_change_direction_flag = r.read_bit()?;
                pps.slice_group_change_rate_minus1 =
                    r.read_ue_max(sps.pic_size_in_map_units() - 1)?;
            }
            6 => {
                pps.pic_size_in_map_units_minus1 = r.read_ue_max(sps.pic_size_in_map_units() - 1)?;

                // Ceil(Log2(num_slice_groups_minus1 + 1))
                let bits = num_groups.next_power_of_two().trailing_zeros() as usize;
                for _ in 0..=pps.pic_size_in_map_units_minus1 {
                    pps.slice_group_id.push(r.read_bits(bits)?);
                }
            }
            _ => (),
        }

        Ok(())
    }

    /// Returns the SPS a PPS with `seq_parameter_set_id` refers to. Non-base
    /// view PPSes may only have a subset SPS with that id.
    fn sps_for_pps(&self, seq_parameter_set_id: u8) -> Result<Arc<Sps>, UnknownParameterSet> {
        self.get_sps(seq_parameter_set_id)
            .cloned()
            .or_else(|| {
                self.get_subset_sps(seq_parameter_set_id)
                    .map(|subset| Arc::clone(&subset.sps))
            })
            .ok_or(UnknownParameterSet::Sps(seq_parameter_set_id))
    }

    /// Parse a PPS and store it in the slot of its id, replacing any previous
    /// PPS with the same id.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<&Arc<Pps>> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            bail!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header.type_
            );
        }

        let mut r = NaluReader::new(nalu.payload());
        let pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;
        let seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;
        let sps = self.sps_for_pps(seq_parameter_set_id)?;

        let mut pps = Pps::new(pic_parameter_set_id, Arc::clone(&sps));
        pps.seq_parameter_set_id = seq_parameter_set_id;

        pps.entropy_coding_mode_flag = r.read_bit()?;
        pps.bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;
        pps.num_slice_groups_minus1 = r.read_ue_max(MAX_SLICE_GROUPS as u32 - 1)?;

        if pps.num_slice_groups_minus1 > 0 {
            Parser::parse_slice_groups(&mut r, &mut pps, &sps)?;
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = i32::from(6 * (sps.bit_depth_luma_minus8));
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;

        // When second_chroma_qp_index_offset is not present, it shall be
        // inferred to be equal to chroma_qp_index_offset.
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                Parser::parse_pps_scaling_lists(&mut r, &mut pps, &sps)?;
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        let key = usize::from(pps.pic_parameter_set_id);
        debug!("PPS {} referencing SPS {}", key, seq_parameter_set_id);

        let slot = self
            .ppses
            .get_mut(key)
            .ok_or(anyhow!("PPS id {} out of range", key))?;
        Ok(slot.insert(Arc::new(pps)))
    }

    fn parse_ref_pic_list_modification(
        r: &mut NaluReader,
        mvc: bool,
        ref_list_mods: &mut Vec<RefPicListModification>,
    ) -> anyhow::Result<()> {
        let max_idc = if mvc { 5 } else { 3 };

        loop {
            if ref_list_mods.len() >= MAX_LIST_SIZE {
                bail!("Broken Data: too many reference list modifications");
            }

            let mut pic_num_mod = RefPicListModification {
                modification_of_pic_nums_idc: r.read_ue_max(max_idc)?,
                ..Default::default()
            };

            match pic_num_mod.modification_of_pic_nums_idc {
                0 | 1 => {
                    pic_num_mod.abs_diff_pic_num_minus1 = r.read_ue()?;
                }

                2 => {
                    pic_num_mod.long_term_pic_num = r.read_ue()?;
                }

                3 => {
                    ref_list_mods.push(pic_num_mod);
                    break;
                }

                // 4 | 5, only reachable for MVC slices.
                _ => {
                    pic_num_mod.abs_diff_view_idx_minus1 = r.read_ue()?;
                }
            }

            ref_list_mods.push(pic_num_mod);
        }

        Ok(())
    }

    fn parse_ref_pic_list_modifications(
        r: &mut NaluReader,
        header: &mut SliceHeader,
        mvc: bool,
    ) -> anyhow::Result<()> {
        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    mvc,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if header.slice_type.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    mvc,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

        Ok(())
    }

    fn parse_pred_weight_table(
        r: &mut NaluReader,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let pt = &mut header.pred_weight_table;
        pt.luma_log2_weight_denom = r.read_ue_max(7)?;

        // Weights default to 2 ^ luma_log2_weight_denom when their flag is
        // not set.
        let default_luma_weight = 1 << pt.luma_log2_weight_denom;
        for i in 0..=header.num_ref_idx_l0_active_minus1 {
            pt.luma_weight_l0[usize::from(i)] = default_luma_weight;
        }

        if header.slice_type.is_b() {
            for i in 0..=header.num_ref_idx_l1_active_minus1 {
                pt.luma_weight_l1[usize::from(i)] = default_luma_weight;
            }
        }

        if sps.chroma_array_type() != 0 {
            pt.chroma_log2_weight_denom = r.read_ue_max(7)?;
            let default_chroma_weight = 1 << pt.chroma_log2_weight_denom;

            for i in 0..=header.num_ref_idx_l0_active_minus1 {
                pt.chroma_weight_l0[usize::from(i)] = [default_chroma_weight; 2];
            }

            for i in 0..=header.num_ref_idx_l1_active_minus1 {
                pt.chroma_weight_l1[usize::from(i)] = [default_chroma_weight; 2];
            }
        }

        for i in 0..=header.num_ref_idx_l0_active_minus1 {
            let luma_weight_l0_flag = r.read_bit()?;

            if luma_weight_l0_flag {
                pt.luma_weight_l0[usize::from(i)] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l0[usize::from(i)] = r.read_se_bounded(-128, 127)?;
            }

            if sps.chroma_array_type() != 0 {
                let chroma_weight_l0_flag = r.read_bit()?;
                if chroma_weight_l0_flag {
                    for j in 0..2 {
                        pt.chroma_weight_l0[usize::from(i)][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l0[usize::from(i)][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        if header.slice_type.is_b() {
            for i in 0..=header.num_ref_idx_l1_active_minus1 {
                let luma_weight_l1_flag = r.read_bit()?;

                if luma_weight_l1_flag {
                    pt.luma_weight_l1[usize::from(i)] = r.read_se_bounded(-128, 127)?;
                    pt.luma_offset_l1[usize::from(i)] = r.read_se_bounded(-128, 127)?;
                }

                if sps.chroma_array_type() != 0 {
                    let chroma_weight_l1_flag = r.read_bit()?;
                    if chroma_weight_l1_flag {
                        for j in 0..2 {
                            pt.chroma_weight_l1[usize::from(i)][j] =
                                r.read_se_bounded(-128, 127)?;
                            pt.chroma_offset_l1[usize::from(i)][j] =
                                r.read_se_bounded(-128, 127)?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking(
        r: &mut NaluReader,
        idr: bool,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let rpm = &mut header.dec_ref_pic_marking;

        let num_bits_left = r.num_bits_left();
        if idr {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
        } else {
            rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;

            if rpm.adaptive_ref_pic_marking_mode_flag {
                loop {
                    let mut marking = RefPicMarkingInner::default();

                    let mem_mgmt_ctrl_op = r.read_ue_max::<u8>(6)?;
                    marking.memory_management_control_operation = mem_mgmt_ctrl_op;

                    if mem_mgmt_ctrl_op == 0 {
                        break;
                    }

                    if mem_mgmt_ctrl_op == 1 || mem_mgmt_ctrl_op == 3 {
                        marking.difference_of_pic_nums_minus1 = r.read_ue()?;
                    }

                    if mem_mgmt_ctrl_op == 2 {
                        marking.long_term_pic_num = r.read_ue()?;
                    }

                    // Long-term indices never exceed max_num_ref_frames - 1.
                    if mem_mgmt_ctrl_op == 3 || mem_mgmt_ctrl_op == 6 {
                        marking.long_term_frame_idx = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
                    }

                    if mem_mgmt_ctrl_op == 4 {
                        marking.max_long_term_frame_idx = MaxLongTermFrameIdx::from_value_plus1(
                            r.read_ue_max(MAX_DPB_SIZE as u32)?,
                        );
                    }

                    rpm.inner.push(marking);

                    if rpm.inner.len() > 2 * MAX_LIST_SIZE {
                        bail!("Broken Data: too many memory management operations");
                    }
                }
            }
        }
        header.dec_ref_pic_marking_bit_size = num_bits_left - r.num_bits_left();

        Ok(())
    }

    /// Parse the header of a slice of the base view (NAL 1 and 5) or of a
    /// non-base view (NAL 20), resolving its parameter sets.
    pub fn parse_slice_header(&self, nalu: Nalu) -> anyhow::Result<Slice> {
        if !nalu.header.is_slice() {
            bail!(
                "Invalid NALU type: {:?} is not a supported slice NALU",
                nalu.header.type_
            );
        }

        let mvc = nalu.header.is_non_base_view();
        let mut r = NaluReader::new(nalu.payload());

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("Invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;

        let pps = self
            .get_pps(header.pic_parameter_set_id)
            .ok_or(UnknownParameterSet::Pps(header.pic_parameter_set_id))?;

        let sps_id = pps.seq_parameter_set_id;
        let sps = if mvc {
            self.get_subset_sps(sps_id)
                .map(|subset| &subset.sps)
                .ok_or(UnknownParameterSet::SubsetSps(sps_id))?
        } else {
            self.get_sps(sps_id)
                .ok_or(UnknownParameterSet::Sps(sps_id))?
        };

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        if header.field_pic_flag {
            header.max_pic_num = 2 * sps.max_frame_num();
        } else {
            header.max_pic_num = sps.max_frame_num();
        }

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        let num_bits_left = r.num_bits_left();
        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }
        header.pic_order_cnt_bit_size = num_bits_left - r.num_bits_left();

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_max(31)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_max(31)?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        if !header.field_pic_flag
            && (header.num_ref_idx_l0_active_minus1 > 15
                || header.num_ref_idx_l1_active_minus1 > 15)
        {
            bail!("Broken Data: too many active references for a frame");
        }

        Parser::parse_ref_pic_list_modifications(&mut r, &mut header, mvc)?;

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            Parser::parse_pred_weight_table(&mut r, sps, &mut header)?;
        }

        if nalu.header.ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(&mut r, nalu.header.idr_pic_flag, &mut header)?;
        }

        if pps.entropy_coding_mode_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.cabac_init_idc = r.read_ue_max(2)?;
        }

        header.slice_qp_delta = r.read_se_bounded(-87, 77)?;

        if header.slice_type.is_sp() || header.slice_type.is_si() {
            if header.slice_type.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }

            header.slice_qs_delta = r.read_se_bounded(-51, 51)?;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc = r.read_ue_max(2)?;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 = r.read_se_bounded(-6, 6)?;
                header.slice_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            let bits = pps.slice_group_change_cycle_bits(sps);
            header.slice_group_change_cycle = r.read_bits(bits)?;
        }

        let epb = r.num_epb();
        header.header_bit_size = (nalu.size() - epb) * 8 - r.num_bits_left();
        header.n_emulation_prevention_bytes = epb;

        let sps = Arc::clone(sps);
        let pps = Arc::clone(pps);

        Ok(Slice {
            header,
            nalu,
            sps,
            pps,
        })
    }

    /// Reads `payloadType` or `payloadSize`: a run of 0xff bytes, each adding 255, closed by
    /// the last byte.
    fn read_sei_value(r: &mut NaluReader) -> anyhow::Result<u32> {
        let mut value = 0u32;

        loop {
            let byte = r.read_bits::<u32>(8)?;
            value = value
                .checked_add(byte)
                .context("SEI payload type or size overflows")?;
            if byte != 0xff {
                return Ok(value);
            }
        }
    }

    /// Parses the messages of a SEI NAL unit. Only recovery points are interpreted.
    pub fn parse_sei(&self, nalu: &Nalu) -> anyhow::Result<Vec<SeiMessage>> {
        if !matches!(nalu.header.type_, NaluType::Sei) {
            bail!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sei,
                nalu.header.type_
            );
        }

        // Positions in RBSP bits, emulation-prevention bytes excluded.
        let rbsp_position = |r: &NaluReader| r.position() - 8 * r.num_epb();

        let mut r = NaluReader::new(nalu.payload());
        let mut messages = vec![];

        loop {
            let payload_type = Self::read_sei_value(&mut r)?;
            let payload_size = Self::read_sei_value(&mut r)?;
            let start = rbsp_position(&r);

            let payload = match payload_type {
                SEI_RECOVERY_POINT => SeiPayload::RecoveryPoint(RecoveryPoint {
                    recovery_frame_cnt: r.read_ue()?,
                    exact_match_flag: r.read_bit()?,
                    broken_link_flag: r.read_bit()?,
                    changing_slice_group_idc: r.read_bits(2)?,
                }),
                _ => SeiPayload::Unsupported,
            };

            let payload_bits = payload_size as usize * 8;
            let consumed = rbsp_position(&r) - start;
            if consumed > payload_bits {
                bail!(
                    "SEI payload {} is larger than its size of {} bytes",
                    payload_type,
                    payload_size
                );
            }
            r.skip_bits(payload_bits - consumed)?;

            debug!("SEI message {} of {} bytes", payload_type, payload_size);
            messages.push(SeiMessage {
                payload_type,
                payload_size,
                payload,
            });

            if !r.has_more_rsbp_data() {
                break;
            }
        }

        Ok(messages)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Arc<Sps>> {
        self.spses.get(usize::from(sps_id))?.as_ref()
    }

    pub fn get_subset_sps(&self, sps_id: u8) -> Option<&Arc<SubsetSps>> {
        self.subset_spses.get(usize::from(sps_id))?.as_ref()
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Arc<Pps>> {
        self.ppses.get(usize::from(pps_id))?.as_ref()
    }
}
