// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count derivation, clause 8.2.1.

use anyhow::anyhow;

use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;

/// Variables kept from the previous reference picture.
#[derive(Debug)]
struct PrevReferencePicInfo {
    frame_num: i32,
    has_mmco_5: bool,
    top_field_order_cnt: i32,
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
    field: Field,
}

impl Default for PrevReferencePicInfo {
    fn default() -> Self {
        Self {
            frame_num: Default::default(),
            has_mmco_5: Default::default(),
            top_field_order_cnt: Default::default(),
            pic_order_cnt_msb: Default::default(),
            pic_order_cnt_lsb: Default::default(),
            field: Field::Frame,
        }
    }
}

/// Variables kept from the previous picture, reference or not.
#[derive(Debug, Default)]
struct PrevPicInfo {
    frame_num: i32,
    frame_num_offset: i32,
    has_mmco_5: bool,
}

/// POC state of one decoding layer.
#[derive(Debug, Default)]
pub struct PocState {
    prev_ref_pic_info: PrevReferencePicInfo,
    prev_pic_info: PrevPicInfo,
}

impl PocState {
    /// `frame_num` of the previous reference picture, used to detect gaps.
    pub fn prev_ref_frame_num(&self) -> i32 {
        self.prev_ref_pic_info.frame_num
    }

    /// An IDR picture restarts `frame_num` numbering.
    pub fn start_idr(&mut self) {
        self.prev_ref_pic_info.frame_num = 0;
    }

    /// Computes the top, bottom and picture order counts of `pic`.
    pub fn compute(&self, pic: &mut PictureData, sps: &Sps) -> anyhow::Result<()> {
        match pic.pic_order_cnt_type {
            0 => self.compute_type_0(pic, sps),
            1 => self.compute_type_1(pic, sps)?,
            2 => self.compute_type_2(pic, sps),
            other => return Err(anyhow!("Invalid pic_order_cnt_type: {}", other)),
        }

        pic.pic_order_cnt = match pic.field {
            Field::Frame => std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt),
            Field::Top => pic.top_field_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt,
        };

        Ok(())
    }

    // 8.2.1.1
    fn compute_type_0(&self, pic: &mut PictureData, sps: &Sps) {
        let prev = &self.prev_ref_pic_info;

        let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) = if pic.is_idr() {
            (0, 0)
        } else if prev.has_mmco_5 {
            if !matches!(prev.field, Field::Bottom) {
                (0, prev.top_field_order_cnt)
            } else {
                (0, 0)
            }
        } else {
            (prev.pic_order_cnt_msb, prev.pic_order_cnt_lsb)
        };

        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();
        let lsb = pic.pic_order_cnt_lsb;

        pic.pic_order_cnt_msb = if lsb < prev_pic_order_cnt_lsb
            && prev_pic_order_cnt_lsb - lsb >= max_pic_order_cnt_lsb / 2
        {
            prev_pic_order_cnt_msb.wrapping_add(max_pic_order_cnt_lsb)
        } else if lsb > prev_pic_order_cnt_lsb
            && lsb - prev_pic_order_cnt_lsb > max_pic_order_cnt_lsb / 2
        {
            prev_pic_order_cnt_msb.wrapping_sub(max_pic_order_cnt_lsb)
        } else {
            prev_pic_order_cnt_msb
        };

        let order_cnt = pic.pic_order_cnt_msb.wrapping_add(lsb);
        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = order_cnt;
                pic.bottom_field_order_cnt = order_cnt.wrapping_add(pic.delta_pic_order_cnt_bottom);
            }
            Field::Top => pic.top_field_order_cnt = order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt = order_cnt,
        }
    }

    /// `FrameNumOffset`, shared by types 1 and 2.
    fn frame_num_offset(&self, pic: &PictureData, sps: &Sps) -> i32 {
        let prev_frame_num_offset = if self.prev_pic_info.has_mmco_5 {
            0
        } else {
            self.prev_pic_info.frame_num_offset
        };

        if pic.is_idr() {
            0
        } else if self.prev_pic_info.frame_num > pic.frame_num {
            prev_frame_num_offset.wrapping_add(sps.max_frame_num() as i32)
        } else {
            prev_frame_num_offset
        }
    }

    // 8.2.1.2
    fn compute_type_1(&self, pic: &mut PictureData, sps: &Sps) -> anyhow::Result<()> {
        pic.frame_num_offset = self.frame_num_offset(pic, sps);

        let num_ref_frames_in_cycle = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);

        let mut abs_frame_num = if num_ref_frames_in_cycle != 0 {
            pic.frame_num_offset.wrapping_add(pic.frame_num)
        } else {
            0
        };

        if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected_pic_order_cnt = 0i32;

        if abs_frame_num > 0 {
            let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / num_ref_frames_in_cycle;
            let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % num_ref_frames_in_cycle;

            expected_pic_order_cnt =
                pic_order_cnt_cycle_cnt.wrapping_mul(sps.expected_delta_per_pic_order_cnt_cycle);

            let offsets = sps
                .offset_for_ref_frame
                .get(..=frame_num_in_pic_order_cnt_cycle as usize)
                .ok_or_else(|| anyhow!("Invalid num_ref_frames_in_pic_order_cnt_cycle"))?;

            for offset in offsets {
                expected_pic_order_cnt = expected_pic_order_cnt.wrapping_add(*offset);
            }
        }

        if pic.nal_ref_idc == 0 {
            expected_pic_order_cnt = expected_pic_order_cnt.wrapping_add(sps.offset_for_non_ref_pic);
        }

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt =
                    expected_pic_order_cnt.wrapping_add(pic.delta_pic_order_cnt0);
                pic.bottom_field_order_cnt = pic
                    .top_field_order_cnt
                    .wrapping_add(sps.offset_for_top_to_bottom_field)
                    .wrapping_add(pic.delta_pic_order_cnt1);
            }
            Field::Top => {
                pic.top_field_order_cnt =
                    expected_pic_order_cnt.wrapping_add(pic.delta_pic_order_cnt0);
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = expected_pic_order_cnt
                    .wrapping_add(sps.offset_for_top_to_bottom_field)
                    .wrapping_add(pic.delta_pic_order_cnt0);
            }
        }

        Ok(())
    }

    // 8.2.1.3
    fn compute_type_2(&self, pic: &mut PictureData, sps: &Sps) {
        pic.frame_num_offset = self.frame_num_offset(pic, sps);

        let abs_frame_num = pic.frame_num_offset.wrapping_add(pic.frame_num);
        let temp_pic_order_cnt = if pic.is_idr() {
            0
        } else if pic.nal_ref_idc == 0 {
            abs_frame_num.wrapping_mul(2).wrapping_sub(1)
        } else {
            abs_frame_num.wrapping_mul(2)
        };

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = temp_pic_order_cnt;
                pic.bottom_field_order_cnt = temp_pic_order_cnt;
            }
            Field::Top => pic.top_field_order_cnt = temp_pic_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt = temp_pic_order_cnt,
        }
    }

    /// Records `pic` as the previous reference picture. Must be called after reference
    /// marking, so that a memory management operation 5 has already rebased its POC.
    pub fn update_after_ref(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_ref_pic_info;

        prev.has_mmco_5 = pic.has_mmco_5;
        prev.top_field_order_cnt = pic.top_field_order_cnt;
        prev.pic_order_cnt_msb = pic.pic_order_cnt_msb;
        prev.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        prev.field = pic.field;
        prev.frame_num = pic.frame_num;
    }

    /// Records `pic` as the previous picture.
    pub fn update_after_pic(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.frame_num_offset = pic.frame_num_offset;
    }
}
