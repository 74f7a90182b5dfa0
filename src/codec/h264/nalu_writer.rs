// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream writer used to synthesize NAL units in unit tests.

/// Inserts emulation prevention bytes into `rbsp`, turning it back into the
/// payload of a NAL unit.
fn insert_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 2);
    let mut zeros = 0;

    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }

        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
        out.push(byte);
    }

    out
}

/// Returns the one-byte NAL unit header for `ref_idc` and `type_`.
pub(crate) fn nal_header(ref_idc: u8, type_: u8) -> u8 {
    (ref_idc & 0b11) << 5 | (type_ & 0b11111)
}

/// Returns the four-byte header of a prefix (14) or slice extension (20) unit.
pub(crate) fn mvc_nal_header(
    ref_idc: u8,
    type_: u8,
    idr: bool,
    view_id: u16,
    anchor_pic_flag: bool,
    inter_view_flag: bool,
) -> [u8; 4] {
    let mut w = NaluWriter::new();
    w.write_f(1, 0u32); // svc_extension_flag
    w.write_bit(!idr);
    w.write_f(6, 0u32); // priority_id
    w.write_f(10, u32::from(view_id));
    w.write_f(3, 0u32); // temporal_id
    w.write_bit(anchor_pic_flag);
    w.write_bit(inter_view_flag);
    w.write_bit(true); // reserved_one_bit

    let ext = w.bytes;
    [nal_header(ref_idc, type_), ext[0], ext[1], ext[2]]
}

/// An MSB-first bit writer producing RBSP bytes.
#[derive(Default)]
pub(crate) struct NaluWriter {
    bytes: Vec<u8>,
    curr: u8,
    num_bits: usize,
}

impl NaluWriter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Writes the `bits` least significant bits of `value`. Corresponds to
    /// `f(n)` and `u(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) {
        assert!(bits <= 32);
        let value = value.into();

        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) {
        self.write_f(bits, value)
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.curr = (self.curr << 1) | u8::from(bit);
        self.num_bits += 1;

        if self.num_bits == 8 {
            self.bytes.push(self.curr);
            self.curr = 0;
            self.num_bits = 0;
        }
    }

    /// Corresponds to `ue(v)`.
    pub fn write_ue(&mut self, value: u32) {
        let value = u64::from(value) + 1;
        let bits = 64 - value.leading_zeros() as usize;

        for _ in 0..bits - 1 {
            self.write_bit(false);
        }

        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Corresponds to `se(v)`.
    pub fn write_se(&mut self, value: i32) {
        let abs_value = value.unsigned_abs();

        if value <= 0 {
            self.write_ue(2 * abs_value)
        } else {
            self.write_ue(2 * abs_value - 1)
        }
    }

    /// Whether the next bit starts a new byte.
    pub fn aligned(&self) -> bool {
        self.num_bits == 0
    }

    /// Appends `rbsp_trailing_bits()` and returns the RBSP.
    pub fn into_rbsp(mut self) -> Vec<u8> {
        self.write_bit(true);
        while !self.aligned() {
            self.write_bit(false);
        }

        self.bytes
    }

    /// Finishes the RBSP and wraps it into an Annex B unit with a four-byte
    /// start code and the given NAL header bytes.
    pub fn into_annex_b(self, header: &[u8]) -> Vec<u8> {
        let payload = insert_emulation_prevention(&self.into_rbsp());

        let mut out = vec![0x00, 0x00, 0x00, 0x01];
        out.extend_from_slice(header);
        out.extend_from_slice(&payload);
        out
    }
}

/// Syntax of a sequence parameter set to synthesize. The defaults describe a
/// 176x144 baseline stream with POC type 0.
#[derive(Clone, Debug)]
pub(crate) struct SpsSyntax {
    pub id: u32,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width_mbs: u32,
    pub height_map_units: u32,
    pub frame_mbs_only: bool,
    pub log2_max_frame_num: u32,
    pub poc_type: u32,
    pub log2_max_poc_lsb: u32,
    pub delta_pic_order_always_zero: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offsets_for_ref_frame: Vec<i32>,
    pub max_num_ref_frames: u32,
    pub gaps_allowed: bool,
    /// Emits VUI with `bitstream_restriction_flag` and these
    /// `max_num_reorder_frames` / `max_dec_frame_buffering` values.
    pub reorder: Option<(u32, u32)>,
}

impl Default for SpsSyntax {
    fn default() -> Self {
        Self {
            id: 0,
            profile_idc: 66,
            level_idc: 30,
            width_mbs: 11,
            height_map_units: 9,
            frame_mbs_only: true,
            log2_max_frame_num: 4,
            poc_type: 0,
            log2_max_poc_lsb: 8,
            delta_pic_order_always_zero: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offsets_for_ref_frame: vec![],
            max_num_ref_frames: 4,
            gaps_allowed: false,
            reorder: None,
        }
    }
}

/// One view of a synthesized subset SPS: its id and its anchor and
/// non-anchor list 0 references.
#[derive(Clone, Debug, Default)]
pub(crate) struct ViewSyntax {
    pub view_id: u16,
    pub anchor_refs_l0: Vec<u16>,
    pub non_anchor_refs_l0: Vec<u16>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PpsSyntax {
    pub id: u32,
    pub sps_id: u32,
    pub bottom_field_pic_order_in_frame_present: bool,
    pub num_ref_idx_l0_default_minus1: u32,
    pub num_ref_idx_l1_default_minus1: u32,
}

/// A memory management control operation as `(op, first, second)` where the
/// operands follow the order of the syntax table.
pub(crate) type MmcoSyntax = (u32, u32, u32);

#[derive(Clone, Debug, Default)]
pub(crate) struct SliceSyntax {
    pub nal_ref_idc: u8,
    pub idr: bool,
    /// Raw `slice_type`, 0 = P, 1 = B, 2 = I.
    pub slice_type: u32,
    pub first_mb: u32,
    pub pps_id: u32,
    pub frame_num: u32,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub idr_pic_id: u32,
    pub poc_lsb: u32,
    pub delta_poc_bottom: i32,
    pub delta_poc: [i32; 2],
    pub num_ref_idx_override: Option<(u32, u32)>,
    /// `(modification_of_pic_nums_idc, value)` pairs for list 0.
    pub mods_l0: Vec<(u32, u32)>,
    pub mods_l1: Vec<(u32, u32)>,
    pub no_output_of_prior_pics: bool,
    pub long_term_reference: bool,
    pub mmco: Vec<MmcoSyntax>,
    /// `(view_id, anchor_pic_flag, inter_view_flag)`; writes a slice
    /// extension unit (20) when set and `view_id != 0`.
    pub view: Option<(u16, bool, bool)>,
}

pub(crate) fn write_sps_data(w: &mut NaluWriter, sps: &SpsSyntax) {
    w.write_u(8, sps.profile_idc);
    w.write_u(8, 0u32); // constraint flags and reserved_zero_2bits
    w.write_u(8, sps.level_idc);
    w.write_ue(sps.id);

    if matches!(sps.profile_idc, 100 | 110 | 122 | 244 | 44 | 118 | 128) {
        w.write_ue(1); // chroma_format_idc
        w.write_ue(0); // bit_depth_luma_minus8
        w.write_ue(0); // bit_depth_chroma_minus8
        w.write_bit(false); // qpprime_y_zero_transform_bypass_flag
        w.write_bit(false); // seq_scaling_matrix_present_flag
    }

    w.write_ue(sps.log2_max_frame_num - 4);
    w.write_ue(sps.poc_type);
    match sps.poc_type {
        0 => w.write_ue(sps.log2_max_poc_lsb - 4),
        1 => {
            w.write_bit(sps.delta_pic_order_always_zero);
            w.write_se(sps.offset_for_non_ref_pic);
            w.write_se(sps.offset_for_top_to_bottom_field);
            w.write_ue(sps.offsets_for_ref_frame.len() as u32);
            for offset in &sps.offsets_for_ref_frame {
                w.write_se(*offset);
            }
        }
        _ => (),
    }

    w.write_ue(sps.max_num_ref_frames);
    w.write_bit(sps.gaps_allowed);
    w.write_ue(sps.width_mbs - 1);
    w.write_ue(sps.height_map_units - 1);
    w.write_bit(sps.frame_mbs_only);
    if !sps.frame_mbs_only {
        w.write_bit(false); // mb_adaptive_frame_field_flag
    }
    w.write_bit(true); // direct_8x8_inference_flag
    w.write_bit(false); // frame_cropping_flag

    match sps.reorder {
        None => w.write_bit(false),
        Some((max_num_reorder_frames, max_dec_frame_buffering)) => {
            w.write_bit(true);
            // aspect ratio, overscan, video signal, chroma loc, timing, nal hrd,
            // vcl hrd, pic struct
            for _ in 0..8 {
                w.write_bit(false);
            }
            w.write_bit(true); // bitstream_restriction_flag
            w.write_bit(true); // motion_vectors_over_pic_boundaries_flag
            w.write_ue(2); // max_bytes_per_pic_denom
            w.write_ue(1); // max_bits_per_mb_denom
            w.write_ue(16); // log2_max_mv_length_horizontal
            w.write_ue(16); // log2_max_mv_length_vertical
            w.write_ue(max_num_reorder_frames);
            w.write_ue(max_dec_frame_buffering);
        }
    }
}

pub(crate) fn sps_nalu(sps: &SpsSyntax) -> Vec<u8> {
    let mut w = NaluWriter::new();
    write_sps_data(&mut w, sps);
    w.into_annex_b(&[nal_header(3, 7)])
}

/// Writes a subset SPS whose first view is the base view.
pub(crate) fn subset_sps_nalu(sps: &SpsSyntax, views: &[ViewSyntax]) -> Vec<u8> {
    let mut w = NaluWriter::new();
    write_sps_data(&mut w, sps);
    w.write_bit(true); // bit_equal_to_one

    w.write_ue(views.len() as u32 - 1);
    for view in views {
        w.write_ue(u32::from(view.view_id));
    }
    for view in views.iter().skip(1) {
        w.write_ue(view.anchor_refs_l0.len() as u32);
        for id in &view.anchor_refs_l0 {
            w.write_ue(u32::from(*id));
        }
        w.write_ue(0); // num_anchor_refs_l1
    }
    for view in views.iter().skip(1) {
        w.write_ue(view.non_anchor_refs_l0.len() as u32);
        for id in &view.non_anchor_refs_l0 {
            w.write_ue(u32::from(*id));
        }
        w.write_ue(0); // num_non_anchor_refs_l1
    }

    // A single level with one operation point covering every view.
    w.write_ue(0);
    w.write_u(8, sps.level_idc);
    w.write_ue(0);
    w.write_u(3, 0u32);
    w.write_ue(views.len() as u32 - 1);
    for view in views {
        w.write_ue(u32::from(view.view_id));
    }
    w.write_ue(views.len() as u32 - 1);

    w.write_bit(false); // mvc_vui_parameters_present_flag
    w.write_bit(false); // additional_extension2_flag

    w.into_annex_b(&[nal_header(3, 15)])
}

pub(crate) fn pps_nalu(pps: &PpsSyntax) -> Vec<u8> {
    let mut w = NaluWriter::new();
    w.write_ue(pps.id);
    w.write_ue(pps.sps_id);
    w.write_bit(false); // entropy_coding_mode_flag
    w.write_bit(pps.bottom_field_pic_order_in_frame_present);
    w.write_ue(0); // num_slice_groups_minus1
    w.write_ue(pps.num_ref_idx_l0_default_minus1);
    w.write_ue(pps.num_ref_idx_l1_default_minus1);
    w.write_bit(false); // weighted_pred_flag
    w.write_u(2, 0u32); // weighted_bipred_idc
    w.write_se(0); // pic_init_qp_minus26
    w.write_se(0); // pic_init_qs_minus26
    w.write_se(0); // chroma_qp_index_offset
    w.write_bit(false); // deblocking_filter_control_present_flag
    w.write_bit(false); // constrained_intra_pred_flag
    w.write_bit(false); // redundant_pic_cnt_present_flag
    w.into_annex_b(&[nal_header(3, 8)])
}

fn write_modifications(w: &mut NaluWriter, mods: &[(u32, u32)]) {
    w.write_bit(!mods.is_empty());
    if mods.is_empty() {
        return;
    }

    for (idc, value) in mods {
        w.write_ue(*idc);
        w.write_ue(*value);
    }
    w.write_ue(3);
}

/// Writes a CAVLC slice with a few bytes of fake slice data.
pub(crate) fn slice_nalu(sps: &SpsSyntax, pps: &PpsSyntax, slice: &SliceSyntax) -> Vec<u8> {
    let mut w = NaluWriter::new();
    let is_p = slice.slice_type % 5 == 0;
    let is_b = slice.slice_type % 5 == 1;

    w.write_ue(slice.first_mb);
    w.write_ue(slice.slice_type);
    w.write_ue(slice.pps_id);
    w.write_u(sps.log2_max_frame_num as usize, slice.frame_num);

    if !sps.frame_mbs_only {
        w.write_bit(slice.field_pic);
        if slice.field_pic {
            w.write_bit(slice.bottom_field);
        }
    }

    if slice.idr {
        w.write_ue(slice.idr_pic_id);
    }

    if sps.poc_type == 0 {
        w.write_u(sps.log2_max_poc_lsb as usize, slice.poc_lsb);
        if pps.bottom_field_pic_order_in_frame_present && !slice.field_pic {
            w.write_se(slice.delta_poc_bottom);
        }
    }

    if sps.poc_type == 1 && !sps.delta_pic_order_always_zero {
        w.write_se(slice.delta_poc[0]);
        if pps.bottom_field_pic_order_in_frame_present && !slice.field_pic {
            w.write_se(slice.delta_poc[1]);
        }
    }

    if is_b {
        w.write_bit(true); // direct_spatial_mv_pred_flag
    }

    if is_p || is_b {
        match slice.num_ref_idx_override {
            Some((l0, l1)) => {
                w.write_bit(true);
                w.write_ue(l0);
                if is_b {
                    w.write_ue(l1);
                }
            }
            None => w.write_bit(false),
        }

        write_modifications(&mut w, &slice.mods_l0);
        if is_b {
            write_modifications(&mut w, &slice.mods_l1);
        }
    }

    if slice.nal_ref_idc != 0 {
        if slice.idr {
            w.write_bit(slice.no_output_of_prior_pics);
            w.write_bit(slice.long_term_reference);
        } else {
            w.write_bit(!slice.mmco.is_empty());
            if !slice.mmco.is_empty() {
                for (op, first, second) in &slice.mmco {
                    w.write_ue(*op);
                    match op {
                        1 | 2 | 4 | 6 => w.write_ue(*first),
                        3 => {
                            w.write_ue(*first);
                            w.write_ue(*second);
                        }
                        _ => (),
                    }
                }
                w.write_ue(0);
            }
        }
    }

    w.write_se(0); // slice_qp_delta

    // Stand-in for slice_data().
    w.write_u(16, 0xa5c3u32);

    match slice.view {
        Some((view_id, anchor, inter_view)) if view_id != 0 => w.into_annex_b(&mvc_nal_header(
            slice.nal_ref_idc,
            20,
            slice.idr,
            view_id,
            anchor,
            inter_view,
        )),
        _ => {
            let type_ = if slice.idr { 5 } else { 1 };
            w.into_annex_b(&[nal_header(slice.nal_ref_idc, type_)])
        }
    }
}

fn write_sei_value(w: &mut NaluWriter, mut value: u32) {
    while value >= 0xff {
        w.write_u(8, 0xffu32);
        value -= 0xff;
    }
    w.write_u(8, value);
}

/// Writes a SEI unit (6) carrying `(payloadType, payload)` messages.
pub(crate) fn sei_nalu(messages: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut w = NaluWriter::new();
    for (payload_type, payload) in messages {
        write_sei_value(&mut w, *payload_type);
        write_sei_value(&mut w, payload.len() as u32);
        for byte in payload {
            w.write_u(8, *byte);
        }
    }
    w.into_annex_b(&[nal_header(0, 6)])
}

/// Payload of a recovery point message, byte aligned.
pub(crate) fn recovery_point_payload(recovery_frame_cnt: u32, broken_link: bool) -> Vec<u8> {
    let mut w = NaluWriter::new();
    w.write_ue(recovery_frame_cnt);
    w.write_bit(true); // exact_match_flag
    w.write_bit(broken_link);
    w.write_u(2, 0u32); // changing_slice_group_idc
    if w.aligned() {
        w.bytes
    } else {
        // bit_equal_to_one and alignment zeros
        w.into_rbsp()
    }
}

/// Writes the prefix unit (14) announcing the MVC fields of a base view slice.
pub(crate) fn prefix_nalu(nal_ref_idc: u8, idr: bool, anchor: bool, inter_view: bool) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x01];
    out.extend_from_slice(&mvc_nal_header(nal_ref_idc, 14, idr, 0, anchor, inter_view));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu_reader::NaluReader;

    #[test]
    fn first_few_ue() {
        fn single_ue(value: u32) -> Vec<u8> {
            let mut writer = NaluWriter::new();
            writer.write_ue(value);
            while !writer.aligned() {
                writer.write_bit(false);
            }
            writer.bytes
        }

        assert_eq!(single_ue(0), vec![0b10000000u8]);
        assert_eq!(single_ue(1), vec![0b01000000u8]);
        assert_eq!(single_ue(2), vec![0b01100000u8]);
        assert_eq!(single_ue(3), vec![0b00100000u8]);
        assert_eq!(single_ue(7), vec![0b00010000u8]);
        assert_eq!(single_ue(9), vec![0b00010100u8]);
    }

    #[test]
    fn writer_reader() {
        let mut writer = NaluWriter::new();
        writer.write_ue(10);
        writer.write_se(-42);
        writer.write_se(3);
        writer.write_f(16, 0u32);
        writer.write_f(8, 1u32);
        writer.write_ue(5);
        let annex_b = writer.into_annex_b(&[nal_header(3, 7)]);

        // 0x00 0x00 0x01 inside the payload must have been escaped.
        assert!(annex_b[5..].windows(3).all(|w| w != [0x00, 0x00, 0x01]));

        let mut reader = NaluReader::new(&annex_b[5..]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 10);
        assert_eq!(reader.read_se::<i32>().unwrap(), -42);
        assert_eq!(reader.read_se::<i32>().unwrap(), 3);
        assert_eq!(reader.read_bits::<u32>(16).unwrap(), 0);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 5);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn mvc_header_layout() {
        let header = mvc_nal_header(2, 20, false, 1, true, true);
        assert_eq!(header[0], 0x54);
        // svc=0, non_idr=1, priority=0
        assert_eq!(header[1], 0x40);
        // view_id=1 spans the next ten bits.
        assert_eq!(header[2], 0x00);
        assert_eq!(header[3], 0x47);
    }
}
