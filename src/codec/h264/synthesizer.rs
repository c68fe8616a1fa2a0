// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes small H.264 streams for tests. Only frame coding is produced and slices carry no
//! macroblock data, which is enough for everything that happens before the hardware.

use crate::bitstream_utils::frame_units;
use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterResult;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Profile;
use crate::codec::h264::parser::RefPicMarkingInner;
use crate::codec::h264::parser::SliceType;

type Writer<'a> = BitWriter<&'a mut Vec<u8>>;

#[derive(Clone, Debug)]
pub(crate) struct SpsParams {
    pub sps_id: u8,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub constraint_set3_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub width_mbs: u16,
    pub height_mbs: u16,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    /// Left, right, top and bottom offsets.
    pub crop: Option<(u32, u32, u32, u32)>,
    /// `max_num_reorder_frames` and `max_dec_frame_buffering`, written in the VUI.
    pub reorder: Option<(u32, u32)>,
}

impl Default for SpsParams {
    fn default() -> Self {
        Self {
            sps_id: 0,
            profile_idc: Profile::Main as u8,
            level_idc: 40,
            constraint_set3_flag: false,
            bit_depth_luma_minus8: 0,
            width_mbs: 4,
            height_mbs: 4,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 2,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offset_for_ref_frame: vec![],
            max_num_ref_frames: 4,
            gaps_in_frame_num_value_allowed_flag: false,
            crop: None,
            reorder: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PpsParams {
    pub pps_id: u8,
    pub sps_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub deblocking_filter_control_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    /// Sends a picture scaling matrix where every list selects its default.
    pub default_scaling_matrix: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct SliceParams {
    pub pps_id: u8,
    pub ref_idc: u8,
    pub idr: bool,
    pub slice_type: SliceType,
    pub frame_num: u16,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt: [i32; 2],
    pub num_ref_idx_active: Option<(u8, u8)>,
    /// `modification_of_pic_nums_idc` and its operand.
    pub modifications_l0: Vec<(u8, u32)>,
    pub modifications_l1: Vec<(u8, u32)>,
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub mmco: Vec<RefPicMarkingInner>,
}

impl Default for SliceParams {
    fn default() -> Self {
        Self {
            pps_id: 0,
            ref_idc: 1,
            idr: false,
            slice_type: SliceType::P,
            frame_num: 0,
            idr_pic_id: 0,
            pic_order_cnt_lsb: 0,
            delta_pic_order_cnt: [0; 2],
            num_ref_idx_active: None,
            modifications_l0: vec![],
            modifications_l1: vec![],
            no_output_of_prior_pics_flag: false,
            long_term_reference_flag: false,
            mmco: vec![],
        }
    }
}

impl SliceParams {
    pub fn idr(idr_pic_id: u16) -> Self {
        Self {
            ref_idc: 3,
            idr: true,
            slice_type: SliceType::I,
            idr_pic_id,
            ..Default::default()
        }
    }

    /// A reference P slice.
    pub fn p(frame_num: u16, pic_order_cnt_lsb: u16) -> Self {
        Self {
            frame_num,
            pic_order_cnt_lsb,
            ..Default::default()
        }
    }

    /// A non-reference B slice.
    pub fn b(frame_num: u16, pic_order_cnt_lsb: u16) -> Self {
        Self {
            ref_idc: 0,
            slice_type: SliceType::B,
            frame_num,
            pic_order_cnt_lsb,
            ..Default::default()
        }
    }
}

/// Accumulates units and frames them with length prefixes.
pub(crate) struct StreamSynthesizer {
    sps: SpsParams,
    pps: PpsParams,
    units: Vec<Vec<u8>>,
}

impl StreamSynthesizer {
    pub fn new(sps: SpsParams, pps: PpsParams) -> Self {
        Self {
            sps,
            pps,
            units: vec![],
        }
    }

    pub fn parameter_sets(mut self) -> Self {
        self.units.push(Self::sps(&self.sps));
        self.units.push(Self::pps(&self.pps, &self.sps));
        self
    }

    pub fn slice(mut self, params: &SliceParams) -> Self {
        self.units
            .push(Self::slice_unit(params, &self.sps, &self.pps));
        self
    }

    pub fn build(self) -> Vec<u8> {
        frame_units(self.units.iter().map(|u| u.as_slice()))
    }

    /// Frames the units written so far and starts a new batch.
    pub fn take(&mut self) -> Vec<u8> {
        let data = frame_units(self.units.iter().map(|u| u.as_slice()));
        self.units.clear();
        data
    }

    pub fn push_slice(&mut self, params: &SliceParams) -> &mut Self {
        self.units
            .push(Self::slice_unit(params, &self.sps, &self.pps));
        self
    }

    pub fn push_end_of_sequence(&mut self) -> &mut Self {
        self.units.push(vec![NaluType::SeqEnd as u8]);
        self
    }

    pub fn push_parameter_sets(&mut self) -> &mut Self {
        self.units.push(Self::sps(&self.sps));
        self.units.push(Self::pps(&self.pps, &self.sps));
        self
    }

    fn write_unit<F>(ref_idc: u8, type_: NaluType, body: F) -> Vec<u8>
    where
        F: FnOnce(&mut Writer) -> BitWriterResult<()>,
    {
        let mut data = Vec::new();
        {
            let mut w = BitWriter::new(&mut data, true);
            w.write_f(8, (ref_idc << 5) | type_ as u8).unwrap();
            body(&mut w).unwrap();
            w.write_trailing_bits().unwrap();
            w.flush().unwrap();
        }

        data
    }

    pub fn sps(sps: &SpsParams) -> Vec<u8> {
        Self::write_unit(3, NaluType::Sps, |w| {
            w.write_f(8, sps.profile_idc)?;
            w.write_f(3, 0u32)?;
            w.write_bit(sps.constraint_set3_flag)?;
            w.write_f(4, 0u32)?;
            w.write_f(8, sps.level_idc)?;
            w.write_ue(sps.sps_id)?;

            if sps.profile_idc >= Profile::High as u8 {
                // chroma_format_idc
                w.write_ue(1u32)?;
                w.write_ue(sps.bit_depth_luma_minus8)?;
                w.write_ue(sps.bit_depth_luma_minus8)?;
                w.write_bit(false)?;
                w.write_bit(false)?;
            }

            w.write_ue(sps.log2_max_frame_num_minus4)?;
            w.write_ue(sps.pic_order_cnt_type)?;
            match sps.pic_order_cnt_type {
                0 => w.write_ue(sps.log2_max_pic_order_cnt_lsb_minus4)?,
                1 => {
                    w.write_bit(sps.delta_pic_order_always_zero_flag)?;
                    w.write_se(sps.offset_for_non_ref_pic)?;
                    w.write_se(sps.offset_for_top_to_bottom_field)?;
                    w.write_ue(sps.offset_for_ref_frame.len() as u32)?;
                    for offset in &sps.offset_for_ref_frame {
                        w.write_se(*offset)?;
                    }
                }
                _ => (),
            }

            w.write_ue(sps.max_num_ref_frames)?;
            w.write_bit(sps.gaps_in_frame_num_value_allowed_flag)?;
            w.write_ue(sps.width_mbs - 1)?;
            w.write_ue(sps.height_mbs - 1)?;
            // frame_mbs_only_flag
            w.write_bit(true)?;
            // direct_8x8_inference_flag
            w.write_bit(true)?;

            w.write_bit(sps.crop.is_some())?;
            if let Some((left, right, top, bottom)) = sps.crop {
                w.write_ue(left)?;
                w.write_ue(right)?;
                w.write_ue(top)?;
                w.write_ue(bottom)?;
            }

            w.write_bit(sps.reorder.is_some())?;
            if let Some((max_num_reorder_frames, max_dec_frame_buffering)) = sps.reorder {
                // No aspect ratio, overscan, signal type, chroma location, timing nor HRD.
                w.write_f(7, 0u32)?;
                // pic_struct_present_flag
                w.write_bit(false)?;
                // bitstream_restriction_flag
                w.write_bit(true)?;
                w.write_bit(true)?;
                w.write_ue(2u32)?;
                w.write_ue(1u32)?;
                w.write_ue(16u32)?;
                w.write_ue(16u32)?;
                w.write_ue(max_num_reorder_frames)?;
                w.write_ue(max_dec_frame_buffering)?;
            }

            Ok(())
        })
    }

    pub fn pps(pps: &PpsParams, _sps: &SpsParams) -> Vec<u8> {
        Self::write_unit(3, NaluType::Pps, |w| {
            w.write_ue(pps.pps_id)?;
            w.write_ue(pps.sps_id)?;
            w.write_bit(pps.entropy_coding_mode_flag)?;
            // bottom_field_pic_order_in_frame_present_flag
            w.write_bit(false)?;
            // num_slice_groups_minus1
            w.write_ue(0u32)?;
            w.write_ue(pps.num_ref_idx_l0_default_active_minus1)?;
            w.write_ue(pps.num_ref_idx_l1_default_active_minus1)?;
            // weighted_pred_flag and weighted_bipred_idc
            w.write_f(3, 0u32)?;
            // pic_init_qp_minus26, pic_init_qs_minus26, chroma_qp_index_offset
            w.write_se(0)?;
            w.write_se(0)?;
            w.write_se(0)?;
            w.write_bit(pps.deblocking_filter_control_present_flag)?;
            // constrained_intra_pred_flag and redundant_pic_cnt_present_flag
            w.write_f(2, 0u32)?;

            if pps.transform_8x8_mode_flag || pps.default_scaling_matrix {
                w.write_bit(pps.transform_8x8_mode_flag)?;
                w.write_bit(pps.default_scaling_matrix)?;
                if pps.default_scaling_matrix {
                    let num_lists = if pps.transform_8x8_mode_flag { 8 } else { 6 };
                    for _ in 0..num_lists {
                        w.write_bit(true)?;
                        // A first delta bringing nextScale to 0 selects the default list.
                        w.write_se(-8)?;
                    }
                }
                w.write_se(0)?;
            }

            Ok(())
        })
    }

    pub fn slice_unit(slice: &SliceParams, sps: &SpsParams, pps: &PpsParams) -> Vec<u8> {
        let type_ = if slice.idr {
            NaluType::SliceIdr
        } else {
            NaluType::Slice
        };

        Self::write_unit(slice.ref_idc, type_, |w| {
            let is_b = slice.slice_type.is_b();
            let is_i = slice.slice_type.is_i();

            // first_mb_in_slice
            w.write_ue(0u32)?;
            w.write_ue(slice.slice_type as u32)?;
            w.write_ue(slice.pps_id)?;
            w.write_f(
                usize::from(sps.log2_max_frame_num_minus4) + 4,
                slice.frame_num,
            )?;

            if slice.idr {
                w.write_ue(slice.idr_pic_id)?;
            }

            if sps.pic_order_cnt_type == 0 {
                w.write_f(
                    usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                    slice.pic_order_cnt_lsb,
                )?;
            } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
                w.write_se(slice.delta_pic_order_cnt[0])?;
            }

            if is_b {
                // direct_spatial_mv_pred_flag
                w.write_bit(true)?;
            }

            if !is_i {
                w.write_bit(slice.num_ref_idx_active.is_some())?;
                if let Some((l0, l1)) = slice.num_ref_idx_active {
                    w.write_ue(l0 - 1)?;
                    if is_b {
                        w.write_ue(l1 - 1)?;
                    }
                }

                Self::write_modifications(w, &slice.modifications_l0)?;
                if is_b {
                    Self::write_modifications(w, &slice.modifications_l1)?;
                }
            }

            if slice.ref_idc != 0 {
                if slice.idr {
                    w.write_bit(slice.no_output_of_prior_pics_flag)?;
                    w.write_bit(slice.long_term_reference_flag)?;
                } else {
                    w.write_bit(!slice.mmco.is_empty())?;
                    if !slice.mmco.is_empty() {
                        for op in &slice.mmco {
                            Self::write_mmco(w, op)?;
                        }
                        w.write_ue(0u32)?;
                    }
                }
            }

            if pps.entropy_coding_mode_flag && !is_i {
                // cabac_init_idc
                w.write_ue(0u32)?;
            }

            // slice_qp_delta
            w.write_se(0)?;

            if pps.deblocking_filter_control_present_flag {
                w.write_ue(0u32)?;
                w.write_se(0)?;
                w.write_se(0)?;
            }

            Ok(())
        })
    }

    fn write_modifications(w: &mut Writer, modifications: &[(u8, u32)]) -> BitWriterResult<()> {
        w.write_bit(!modifications.is_empty())?;
        if modifications.is_empty() {
            return Ok(());
        }

        for (idc, value) in modifications {
            w.write_ue(*idc)?;
            w.write_ue(*value)?;
        }

        w.write_ue(3u32)
    }

    fn write_mmco(w: &mut Writer, op: &RefPicMarkingInner) -> BitWriterResult<()> {
        let mmco = op.memory_management_control_operation;
        w.write_ue(mmco)?;

        if mmco == 1 || mmco == 3 {
            w.write_ue(op.difference_of_pic_nums_minus1)?;
        }

        if mmco == 2 {
            w.write_ue(op.long_term_pic_num)?;
        }

        if mmco == 3 || mmco == 6 {
            w.write_ue(op.long_term_frame_idx)?;
        }

        if mmco == 4 {
            w.write_ue(op.max_long_term_frame_idx.to_value_plus1())?;
        }

        Ok(())
    }
}
