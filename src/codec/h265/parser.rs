// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Not every parsed field is consumed by the decoder.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::bitstream_utils::Unit;
use crate::bitstream_utils::UnitHeader;
use crate::decoder::param_sets::IngestStatus;
use crate::decoder::param_sets::ParamSetKind;
use crate::decoder::param_sets::ParamSetMap;
use crate::decoder::param_sets::ParameterSet;
use crate::decoder::param_sets::ParameterSetStore;
use crate::Point;
use crate::Rect;
use crate::Resolution;

pub type Nalu<'a> = Unit<'a, NaluHeader>;

// Given the max VPS id.
const MAX_VPS_COUNT: u32 = 16;
// Given the max SPS id.
const MAX_SPS_COUNT: u32 = 16;
// Given the max PPS id.
const MAX_PPS_COUNT: u32 = 64;
// 7.4.7.1
const MAX_REF_IDX_ACTIVE: u32 = 15;
// 7.4.3.2.1: the SPS carries at most 64 sets.
const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
// 7.4.3.2.1: at most 32 candidate long-term pictures in the SPS, and as many per slice.
const MAX_LONG_TERM_REF_PICS: usize = 32;

/// A.4.2: upper bound on `MaxDpbSize`.
pub const MAX_DPB_SIZE: usize = 16;

// Table 7-5.
const DEFAULT_SCALING_LIST_0: [u8; 16] = [16; 16];

// Table 7-6, intra.
const DEFAULT_SCALING_LIST_1: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

// Table 7-6, inter.
const DEFAULT_SCALING_LIST_2: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

/// Ceil(Log2(n)), as used for the length of several fixed-size slice header fields.
pub(crate) fn ceil_log2(n: u32) -> usize {
    if n <= 1 {
        0
    } else {
        (u32::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// Reads a 32-bit fixed-length field.
fn read_u32(r: &mut BitReader) -> anyhow::Result<u32> {
    let high: u32 = r.read_bits(16)?;
    let low: u32 = r.read_bits(16)?;

    Ok((high << 16) | low)
}

/// Table 7-1 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    /// Types 48 to 63.
    Unspecified = 48,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        (Self::BlaWLp..=Self::RsvIrapVcl23).contains(self)
    }

    /// Whether this is a BLA NALU.
    pub fn is_bla(&self) -> bool {
        (Self::BlaWLp..=Self::BlaNLp).contains(self)
    }

    /// Whether this is a CRA NALU.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Whether this is a RADL NALU.
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// Whether this is a RASL NALU.
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// Whether this is a sub-layer non-reference picture.
    pub fn is_slnr(&self) -> bool {
        matches!(
            self,
            Self::TrailN
                | Self::TsaN
                | Self::StsaN
                | Self::RadlN
                | Self::RaslN
                | Self::RsvVclN10
                | Self::RsvVclN12
                | Self::RsvVclN14
        )
    }

    /// Whether this NALU carries a slice segment of a type the decoder handles.
    pub fn is_slice(&self) -> bool {
        (Self::TrailN..=Self::RaslR).contains(self) || (Self::BlaWLp..=Self::CraNut).contains(self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub type_: NaluType,
    /// Specifies the identifier of the layer to which a VCL NAL unit belongs or the identifier
    /// of a layer to which a non-VCL NAL unit applies.
    pub nuh_layer_id: u8,
    /// Minus 1 specifies a temporal identifier for the NAL unit. Never 0.
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1.saturating_sub(1)
    }
}

impl UnitHeader for NaluHeader {
    // 7.3.1.2
    const LEN: usize = 2;

    fn parse(data: &[u8]) -> Option<Self> {
        let bytes = data.get(0..2)?;

        // forbidden_zero_bit
        if bytes[0] & 0x80 != 0 {
            return None;
        }

        let nuh_temporal_id_plus1 = bytes[1] & 0x7;
        if nuh_temporal_id_plus1 == 0 {
            return None;
        }

        let type_ = (bytes[0] >> 1) & 0x3f;

        Some(NaluHeader {
            type_: NaluType::n(type_).unwrap_or(NaluType::Unspecified),
            nuh_layer_id: ((bytes[0] & 0x1) << 5) | (bytes[1] >> 3),
            nuh_temporal_id_plus1,
        })
    }
}

/// The general part of profile_tier_level( ), 7.3.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flag: [bool; 32],
    pub general_progressive_source_flag: bool,
    pub general_interlaced_source_flag: bool,
    pub general_non_packed_constraint_flag: bool,
    pub general_frame_only_constraint_flag: bool,
    /// 30 times the level number.
    pub general_level_idc: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub cpb_cnt_minus1: [u32; 7],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    pub video_parameter_set_id: u8,
    pub base_layer_internal_flag: bool,
    pub base_layer_available_flag: bool,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u32; 7],
    pub max_num_reorder_pics: [u32; 7],
    pub max_latency_increase_plus1: [u32; 7],
    pub max_layer_id: u8,
    pub num_layer_sets_minus1: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub num_hrd_parameters: u32,
    pub hrd_parameters: Vec<HrdParams>,
    pub extension_flag: bool,
}

/// The scaling factors of 7.4.5, indexed by `matrixId`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 6],
    pub scaling_list_16x16: [[u8; 64]; 6],
    pub scaling_list_32x32: [[u8; 64]; 6],
    pub scaling_list_dc_coef_minus8_16x16: [i16; 6],
    pub scaling_list_dc_coef_minus8_32x32: [i16; 6],
}

impl ScalingLists {
    /// The lists of Table 7-5 and Table 7-6, used when scaling lists are enabled but not sent.
    pub fn default_lists() -> Self {
        let mut lists = ScalingLists::default();
        for matrix_id in 0..6 {
            lists.set_default(0, matrix_id);
            lists.set_default(1, matrix_id);
            lists.set_default(2, matrix_id);
            lists.set_default(3, matrix_id);
        }
        lists
    }

    fn set_default(&mut self, size_id: usize, matrix_id: usize) {
        let default = if matrix_id < 3 {
            DEFAULT_SCALING_LIST_1
        } else {
            DEFAULT_SCALING_LIST_2
        };

        match size_id {
            0 => self.scaling_list_4x4[matrix_id] = DEFAULT_SCALING_LIST_0,
            1 => self.scaling_list_8x8[matrix_id] = default,
            2 => {
                self.scaling_list_16x16[matrix_id] = default;
                self.scaling_list_dc_coef_minus8_16x16[matrix_id] = 8;
            }
            _ => {
                self.scaling_list_32x32[matrix_id] = default;
                self.scaling_list_dc_coef_minus8_32x32[matrix_id] = 8;
            }
        }
    }

    fn copy_from(&mut self, size_id: usize, matrix_id: usize, ref_matrix_id: usize) {
        match size_id {
            0 => self.scaling_list_4x4[matrix_id] = self.scaling_list_4x4[ref_matrix_id],
            1 => self.scaling_list_8x8[matrix_id] = self.scaling_list_8x8[ref_matrix_id],
            2 => {
                self.scaling_list_16x16[matrix_id] = self.scaling_list_16x16[ref_matrix_id];
                self.scaling_list_dc_coef_minus8_16x16[matrix_id] =
                    self.scaling_list_dc_coef_minus8_16x16[ref_matrix_id];
            }
            _ => {
                self.scaling_list_32x32[matrix_id] = self.scaling_list_32x32[ref_matrix_id];
                self.scaling_list_dc_coef_minus8_32x32[matrix_id] =
                    self.scaling_list_dc_coef_minus8_32x32[ref_matrix_id];
            }
        }
    }

    fn coefficients_mut(&mut self, size_id: usize, matrix_id: usize) -> &mut [u8] {
        match size_id {
            0 => &mut self.scaling_list_4x4[matrix_id],
            1 => &mut self.scaling_list_8x8[matrix_id],
            2 => &mut self.scaling_list_16x16[matrix_id],
            _ => &mut self.scaling_list_32x32[matrix_id],
        }
    }
}

/// Flat lists, as used when `scaling_list_enabled_flag` is 0.
impl Default for ScalingLists {
    fn default() -> Self {
        Self {
            scaling_list_4x4: [[16; 16]; 6],
            scaling_list_8x8: [[16; 64]; 6],
            scaling_list_16x16: [[16; 64]; 6],
            scaling_list_32x32: [[16; 64]; 6],
            scaling_list_dc_coef_minus8_16x16: [8; 6],
            scaling_list_dc_coef_minus8_32x32: [8; 6],
        }
    }
}

/// A st_ref_pic_set( ) structure with the variables of (7-61) and (7-62) already derived.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub inter_ref_pic_set_prediction_flag: bool,
    pub delta_idx_minus1: u8,
    pub delta_rps_sign: bool,
    pub abs_delta_rps_minus1: u16,
    pub num_negative_pics: u8,
    pub num_positive_pics: u8,
    pub used_by_curr_pic_s0: [bool; MAX_DPB_SIZE],
    pub used_by_curr_pic_s1: [bool; MAX_DPB_SIZE],
    pub delta_poc_s0: [i32; MAX_DPB_SIZE],
    pub delta_poc_s1: [i32; MAX_DPB_SIZE],
    pub num_delta_pocs: u32,
}

impl ShortTermRefPicSet {
    /// Number of entries of this set the current picture may use for inter prediction.
    pub fn num_used_by_curr_pic(&self) -> u32 {
        let s0 = self.used_by_curr_pic_s0[..usize::from(self.num_negative_pics)]
            .iter()
            .filter(|used| **used)
            .count();
        let s1 = self.used_by_curr_pic_s1[..usize::from(self.num_positive_pics)]
            .iter()
            .filter(|used| **used)
            .count();

        (s0 + s1) as u32
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    pub default_display_window_flag: bool,
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub hrd_parameters_present_flag: bool,
    pub hrd: HrdParams,
    pub bitstream_restriction_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsRangeExtension {
    pub transform_skip_rotation_enabled_flag: bool,
    pub transform_skip_context_enabled_flag: bool,
    pub implicit_rdpcm_enabled_flag: bool,
    pub explicit_rdpcm_enabled_flag: bool,
    pub extended_precision_processing_flag: bool,
    pub intra_smoothing_disabled_flag: bool,
    pub high_precision_offsets_enabled_flag: bool,
    pub persistent_rice_adaptation_enabled_flag: bool,
    pub cabac_bypass_alignment_enabled_flag: bool,
}

/// A H.265 Sequence Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u8; 7],
    pub max_num_reorder_pics: [u8; 7],
    pub max_latency_increase_plus1: [u32; 7],
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_luma_transform_block_size_minus2: u8,
    pub log2_diff_max_min_luma_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub scaling_list_enabled_flag: bool,
    pub scaling_list_data_present_flag: bool,
    /// The lists in effect for this sequence, flat when scaling lists are disabled.
    pub scaling_list: ScalingLists,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u8,
    pub short_term_ref_pic_set: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub lt_ref_pic_poc_lsb_sps: [u16; MAX_LONG_TERM_REF_PICS],
    pub used_by_curr_pic_lt_sps_flag: [bool; MAX_LONG_TERM_REF_PICS],
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub range_extension: SpsRangeExtension,

    // Derived variables.
    pub chroma_array_type: u8,
    pub min_cb_log2_size_y: u32,
    pub ctb_log2_size_y: u32,
    pub ctb_size_y: u32,
    pub pic_width_in_ctbs_y: u32,
    pub pic_height_in_ctbs_y: u32,
    pub pic_size_in_ctbs_y: u32,
    pub max_tb_log2_size_y: u32,
    pub wp_offset_half_range_y: u32,
    pub wp_offset_half_range_c: u32,
}

impl Sps {
    pub fn width(&self) -> u32 {
        u32::from(self.pic_width_in_luma_samples)
    }

    pub fn height(&self) -> u32 {
        u32::from(self.pic_height_in_luma_samples)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width(), self.height()))
    }

    pub fn bit_depth_luma(&self) -> u8 {
        self.bit_depth_luma_minus8 + 8
    }

    pub fn bit_depth_chroma(&self) -> u8 {
        self.bit_depth_chroma_minus8 + 8
    }

    /// SubWidthC and SubHeightC, Table 6-1.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, _) => (2, 2),
            (2, _) => (2, 1),
            _ => (1, 1),
        }
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (u32::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4)
    }

    /// The conformance cropping window.
    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.conformance_window_flag {
            return Rect::from(self.resolution());
        }

        let (sub_width_c, sub_height_c) = self.sub_width_height_c();

        Rect {
            min: Point {
                x: sub_width_c * self.conf_win_left_offset,
                y: sub_height_c * self.conf_win_top_offset,
            },
            max: Point {
                x: self.width() - sub_width_c * self.conf_win_right_offset,
                y: self.height() - sub_height_c * self.conf_win_bottom_offset,
            },
        }
    }

    /// `sps_max_dec_pic_buffering_minus1 + 1` for the highest sub-layer.
    pub fn max_dpb_size(&self) -> usize {
        usize::from(self.max_dec_pic_buffering_minus1[usize::from(self.max_sub_layers_minus1)]) + 1
    }

    pub fn max_num_reorder(&self) -> usize {
        usize::from(self.max_num_reorder_pics[usize::from(self.max_sub_layers_minus1)])
    }

    /// SpsMaxLatencyPictures (7-9) for the highest sub-layer, if there is a latency limit.
    pub fn max_latency_pictures(&self) -> Option<u32> {
        let highest_tid = usize::from(self.max_sub_layers_minus1);
        match self.max_latency_increase_plus1[highest_tid] {
            0 => None,
            plus1 => Some(u32::from(self.max_num_reorder_pics[highest_tid]) + plus1 - 1),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpsRangeExtension {
    pub log2_max_transform_skip_block_size_minus2: u32,
    pub cross_component_prediction_enabled_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
    pub diff_cu_chroma_qp_offset_depth: u32,
    pub chroma_qp_offset_list_len_minus1: u32,
    pub cb_qp_offset_list: [i32; 6],
    pub cr_qp_offset_list: [i32; 6],
    pub log2_sao_offset_scale_luma: u32,
    pub log2_sao_offset_scale_chroma: u32,
}

/// A H.265 Picture Parameter Set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i8,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u8,
    pub num_tile_rows_minus1: u8,
    pub uniform_spacing_flag: bool,
    pub column_width_minus1: [u32; 20],
    pub row_height_minus1: [u32; 22],
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub scaling_list_data_present_flag: bool,
    /// The lists in effect for pictures using this PPS, inherited from the SPS when not sent.
    pub scaling_list: ScalingLists,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u8,
    pub slice_segment_header_extension_present_flag: bool,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub range_extension: PpsRangeExtension,

    // Derived variables.
    pub qp_bd_offset_y: u32,
    pub temporal_id: u8,
}

impl Default for Pps {
    fn default() -> Self {
        Self {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: 0,
            dependent_slice_segments_enabled_flag: false,
            output_flag_present_flag: false,
            num_extra_slice_header_bits: 0,
            sign_data_hiding_enabled_flag: false,
            cabac_init_present_flag: false,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            init_qp_minus26: 0,
            constrained_intra_pred_flag: false,
            transform_skip_enabled_flag: false,
            cu_qp_delta_enabled_flag: false,
            diff_cu_qp_delta_depth: 0,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            slice_chroma_qp_offsets_present_flag: false,
            weighted_pred_flag: false,
            weighted_bipred_flag: false,
            transquant_bypass_enabled_flag: false,
            tiles_enabled_flag: false,
            entropy_coding_sync_enabled_flag: false,
            num_tile_columns_minus1: 0,
            num_tile_rows_minus1: 0,
            uniform_spacing_flag: true,
            column_width_minus1: [0; 20],
            row_height_minus1: [0; 22],
            loop_filter_across_tiles_enabled_flag: true,
            loop_filter_across_slices_enabled_flag: false,
            deblocking_filter_control_present_flag: false,
            deblocking_filter_override_enabled_flag: false,
            deblocking_filter_disabled_flag: false,
            beta_offset_div2: 0,
            tc_offset_div2: 0,
            scaling_list_data_present_flag: false,
            scaling_list: Default::default(),
            lists_modification_present_flag: false,
            log2_parallel_merge_level_minus2: 0,
            slice_segment_header_extension_present_flag: false,
            extension_present_flag: false,
            range_extension_flag: false,
            range_extension: Default::default(),
            qp_bd_offset_y: 0,
            temporal_id: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub ref_pic_list_modification_flag_l0: bool,
    pub list_entry_l0: Vec<u32>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub list_entry_l1: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub delta_chroma_log2_weight_denom: i8,
    pub chroma_log2_weight_denom: u8,
    pub luma_weight_l0_flag: [bool; 15],
    pub chroma_weight_l0_flag: [bool; 15],
    pub delta_luma_weight_l0: [i8; 15],
    pub luma_offset_l0: [i32; 15],
    pub delta_chroma_weight_l0: [[i8; 2]; 15],
    pub delta_chroma_offset_l0: [[i32; 2]; 15],
    pub luma_weight_l1_flag: [bool; 15],
    pub chroma_weight_l1_flag: [bool; 15],
    pub delta_luma_weight_l1: [i8; 15],
    pub luma_offset_l1: [i32; 15],
    pub delta_chroma_weight_l1: [[i8; 2]; 15],
    pub delta_chroma_offset_l1: [[i32; 2]; 15],
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,
    pub type_: SliceType,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub pic_order_cnt_lsb: u16,
    pub short_term_ref_pic_set_sps_flag: bool,
    /// The set signalled in the slice header, if `short_term_ref_pic_set_sps_flag` is 0.
    pub short_term_ref_pic_set: ShortTermRefPicSet,
    pub short_term_ref_pic_set_idx: u8,
    /// The index of the set in use, `num_short_term_ref_pic_sets` for the one in the header.
    pub curr_rps_idx: u8,
    /// Bits taken by the st_ref_pic_set( ) of the header.
    pub st_rps_bits: u32,
    pub num_long_term_sps: u8,
    pub num_long_term_pics: u8,
    pub lt_idx_sps: [u8; MAX_LONG_TERM_REF_PICS],
    /// PocLsbLt.
    pub poc_lsb_lt: [u16; MAX_LONG_TERM_REF_PICS],
    /// UsedByCurrPicLt.
    pub used_by_curr_pic_lt: [bool; MAX_LONG_TERM_REF_PICS],
    pub delta_poc_msb_present_flag: [bool; MAX_LONG_TERM_REF_PICS],
    /// DeltaPocMsbCycleLt (7-52).
    pub delta_poc_msb_cycle_lt: [u32; MAX_LONG_TERM_REF_PICS],
    pub temporal_mvp_enabled_flag: bool,
    pub sao_luma_flag: bool,
    pub sao_chroma_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification: RefPicListModification,
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,
    pub pred_weight_table: PredWeightTable,
    pub five_minus_max_num_merge_cand: u8,
    pub qp_delta: i8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub cu_chroma_qp_offset_enabled_flag: bool,
    pub deblocking_filter_override_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub num_entry_point_offsets: u32,
    pub offset_len_minus1: u8,
    pub entry_point_offset_minus1: Vec<u32>,
    /// NumPicTotalCurr (7-55).
    pub num_pic_total_curr: u32,
    /// Size of the slice segment header in bits, emulation prevention bytes excluded.
    pub header_bit_size: u32,
    pub n_emulation_prevention_bytes: u32,
}

impl Default for SliceHeader {
    fn default() -> Self {
        Self {
            first_slice_segment_in_pic_flag: false,
            no_output_of_prior_pics_flag: false,
            pic_parameter_set_id: 0,
            dependent_slice_segment_flag: false,
            segment_address: 0,
            type_: Default::default(),
            pic_output_flag: true,
            colour_plane_id: 0,
            pic_order_cnt_lsb: 0,
            short_term_ref_pic_set_sps_flag: false,
            short_term_ref_pic_set: Default::default(),
            short_term_ref_pic_set_idx: 0,
            curr_rps_idx: 0,
            st_rps_bits: 0,
            num_long_term_sps: 0,
            num_long_term_pics: 0,
            lt_idx_sps: [0; MAX_LONG_TERM_REF_PICS],
            poc_lsb_lt: [0; MAX_LONG_TERM_REF_PICS],
            used_by_curr_pic_lt: [false; MAX_LONG_TERM_REF_PICS],
            delta_poc_msb_present_flag: [false; MAX_LONG_TERM_REF_PICS],
            delta_poc_msb_cycle_lt: [0; MAX_LONG_TERM_REF_PICS],
            temporal_mvp_enabled_flag: false,
            sao_luma_flag: false,
            sao_chroma_flag: false,
            num_ref_idx_active_override_flag: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_pic_list_modification: Default::default(),
            mvd_l1_zero_flag: false,
            cabac_init_flag: false,
            collocated_from_l0_flag: true,
            collocated_ref_idx: 0,
            pred_weight_table: Default::default(),
            five_minus_max_num_merge_cand: 0,
            qp_delta: 0,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            cu_chroma_qp_offset_enabled_flag: false,
            deblocking_filter_override_flag: false,
            deblocking_filter_disabled_flag: false,
            beta_offset_div2: 0,
            tc_offset_div2: 0,
            loop_filter_across_slices_enabled_flag: false,
            num_entry_point_offsets: 0,
            offset_len_minus1: 0,
            entry_point_offset_minus1: vec![],
            num_pic_total_curr: 0,
            header_bit_size: 0,
            n_emulation_prevention_bytes: 0,
        }
    }
}

impl SliceHeader {
    /// The short-term RPS in use for this slice.
    pub fn short_term_ref_pic_set<'a>(&'a self, sps: &'a Sps) -> Option<&'a ShortTermRefPicSet> {
        if self.short_term_ref_pic_set_sps_flag {
            sps.short_term_ref_pic_set
                .get(usize::from(self.short_term_ref_pic_set_idx))
        } else {
            Some(&self.short_term_ref_pic_set)
        }
    }

    pub fn num_long_term(&self) -> usize {
        usize::from(self.num_long_term_sps) + usize::from(self.num_long_term_pics)
    }
}

/// A slice segment header and the unit it was parsed from.
#[derive(Debug)]
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
}

#[derive(Debug)]
struct PendingPps {
    seq_parameter_set_id: u8,
    data: Vec<u8>,
}

/// Parses H.265 units and keeps the parameter sets they carry.
#[derive(Debug, Default)]
pub struct Parser {
    vpses: ParamSetMap<Vps>,
    spses: ParamSetMap<Sps>,
    ppses: ParamSetMap<Pps>,
    pending_ppses: BTreeMap<u8, PendingPps>,
    /// Header of the last independent slice segment, which dependent segments inherit.
    last_independent_header: Option<SliceHeader>,
}

impl Parser {
    fn parse_profile_tier_level(
        r: &mut BitReader,
        ptl: &mut ProfileTierLevel,
        max_sub_layers_minus1: u8,
    ) -> anyhow::Result<()> {
        ptl.general_profile_space = r.read_bits(2)?;
        ptl.general_tier_flag = r.read_bit()?;
        ptl.general_profile_idc = r.read_bits(5)?;

        for flag in ptl.general_profile_compatibility_flag.iter_mut() {
            *flag = r.read_bit()?;
        }

        ptl.general_progressive_source_flag = r.read_bit()?;
        ptl.general_interlaced_source_flag = r.read_bit()?;
        ptl.general_non_packed_constraint_flag = r.read_bit()?;
        ptl.general_frame_only_constraint_flag = r.read_bit()?;

        // The 43 bits of constraint flags and general_inbld_flag.
        r.skip_bits(44)?;

        ptl.general_level_idc = r.read_bits(8)?;

        let mut sub_layer_profile_present_flag = [false; 8];
        let mut sub_layer_level_present_flag = [false; 8];

        for i in 0..usize::from(max_sub_layers_minus1) {
            sub_layer_profile_present_flag[i] = r.read_bit()?;
            sub_layer_level_present_flag[i] = r.read_bit()?;
        }

        if max_sub_layers_minus1 > 0 {
            // reserved_zero_2bits
            for _ in max_sub_layers_minus1..8 {
                r.skip_bits(2)?;
            }
        }

        for i in 0..usize::from(max_sub_layers_minus1) {
            if sub_layer_profile_present_flag[i] {
                r.skip_bits(88)?;
            }

            if sub_layer_level_present_flag[i] {
                r.skip_bits(8)?;
            }
        }

        Ok(())
    }

    fn parse_sub_layer_hrd_parameters(
        r: &mut BitReader,
        cpb_cnt: u32,
        sub_pic_hrd_params_present_flag: bool,
    ) -> anyhow::Result<()> {
        for _ in 0..cpb_cnt {
            // bit_rate_value_minus1 and cpb_size_value_minus1
            let _: u32 = r.read_ue()?;
            let _: u32 = r.read_ue()?;
            if sub_pic_hrd_params_present_flag {
                // cpb_size_du_value_minus1 and bit_rate_du_value_minus1
                let _: u32 = r.read_ue()?;
                let _: u32 = r.read_ue()?;
            }

            // cbr_flag
            r.skip_bits(1)?;
        }

        Ok(())
    }

    fn parse_hrd_parameters(
        r: &mut BitReader,
        common_inf_present_flag: bool,
        max_sub_layers_minus1: u8,
        hrd: &mut HrdParams,
    ) -> anyhow::Result<()> {
        if common_inf_present_flag {
            hrd.nal_hrd_parameters_present_flag = r.read_bit()?;
            hrd.vcl_hrd_parameters_present_flag = r.read_bit()?;
            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                hrd.sub_pic_hrd_params_present_flag = r.read_bit()?;
                if hrd.sub_pic_hrd_params_present_flag {
                    // tick_divisor_minus2, du_cpb_removal_delay_increment_length_minus1,
                    // sub_pic_cpb_params_in_pic_timing_sei_flag and
                    // dpb_output_delay_du_length_minus1.
                    r.skip_bits(19)?;
                }
                hrd.bit_rate_scale = r.read_bits(4)?;
                hrd.cpb_size_scale = r.read_bits(4)?;
                if hrd.sub_pic_hrd_params_present_flag {
                    // cpb_size_du_scale
                    r.skip_bits(4)?;
                }
                hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.au_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
            }
        }

        for i in 0..=usize::from(max_sub_layers_minus1) {
            let fixed_pic_rate_general_flag = r.read_bit()?;
            let fixed_pic_rate_within_cvs_flag = if !fixed_pic_rate_general_flag {
                r.read_bit()?
            } else {
                true
            };

            let mut low_delay_hrd_flag = false;
            if fixed_pic_rate_within_cvs_flag {
                // elemental_duration_in_tc_minus1
                let _: u32 = r.read_ue_max(2047)?;
            } else {
                low_delay_hrd_flag = r.read_bit()?;
            }

            if !low_delay_hrd_flag {
                hrd.cpb_cnt_minus1[i] = r.read_ue_max(31)?;
            }

            let cpb_cnt = hrd.cpb_cnt_minus1[i] + 1;
            if hrd.nal_hrd_parameters_present_flag {
                Parser::parse_sub_layer_hrd_parameters(
                    r,
                    cpb_cnt,
                    hrd.sub_pic_hrd_params_present_flag,
                )?;
            }

            if hrd.vcl_hrd_parameters_present_flag {
                Parser::parse_sub_layer_hrd_parameters(
                    r,
                    cpb_cnt,
                    hrd.sub_pic_hrd_params_present_flag,
                )?;
            }
        }

        Ok(())
    }

    /// 7.3.4, with the inference rules of 7.4.5.
    fn parse_scaling_list_data(r: &mut BitReader, lists: &mut ScalingLists) -> anyhow::Result<()> {
        for size_id in 0..4 {
            let step = if size_id == 3 { 3 } else { 1 };
            for matrix_id in (0..6).step_by(step) {
                let scaling_list_pred_mode_flag = r.read_bit()?;

                if !scaling_list_pred_mode_flag {
                    let delta: usize = r.read_ue_max(matrix_id as u32 / step as u32)?;
                    if delta == 0 {
                        lists.set_default(size_id, matrix_id);
                    } else {
                        // (7-42)
                        lists.copy_from(size_id, matrix_id, matrix_id - delta * step);
                    }
                    continue;
                }

                let mut next_coef = 8i32;
                let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));

                if size_id > 1 {
                    let dc_coef_minus8: i16 = r.read_se_bounded(-7, 247)?;
                    if size_id == 2 {
                        lists.scaling_list_dc_coef_minus8_16x16[matrix_id] = dc_coef_minus8;
                    } else {
                        lists.scaling_list_dc_coef_minus8_32x32[matrix_id] = dc_coef_minus8;
                    }

                    next_coef = i32::from(dc_coef_minus8) + 8;
                }

                let coefficients = lists.coefficients_mut(size_id, matrix_id);
                for coefficient in coefficients.iter_mut().take(coef_num) {
                    let scaling_list_delta_coef: i32 = r.read_se_bounded(-128, 127)?;
                    next_coef = (next_coef + scaling_list_delta_coef + 256) % 256;
                    *coefficient = next_coef as u8;
                }
            }
        }

        Ok(())
    }

    /// Parses st_ref_pic_set(`st_rps_idx`), deriving the delta POCs of inter-predicted sets from
    /// the sets already in `sps`.
    fn parse_short_term_ref_pic_set(
        r: &mut BitReader,
        sps: &Sps,
        st_rps_idx: u8,
    ) -> anyhow::Result<ShortTermRefPicSet> {
        let mut st = ShortTermRefPicSet::default();

        if st_rps_idx != 0 {
            st.inter_ref_pic_set_prediction_flag = r.read_bit()?;
        }

        if st.inter_ref_pic_set_prediction_flag {
            if st_rps_idx == sps.num_short_term_ref_pic_sets {
                st.delta_idx_minus1 = r.read_ue_max(u32::from(st_rps_idx) - 1)?;
            }

            st.delta_rps_sign = r.read_bit()?;
            st.abs_delta_rps_minus1 = r.read_ue_max(32767)?;

            let ref_rps_idx = st_rps_idx - (st.delta_idx_minus1 + 1);
            // (7-60)
            let delta_rps =
                (1 - 2 * i32::from(st.delta_rps_sign)) * (i32::from(st.abs_delta_rps_minus1) + 1);

            let ref_st = sps
                .short_term_ref_pic_set
                .get(usize::from(ref_rps_idx))
                .with_context(|| format!("invalid RefRpsIdx {}", ref_rps_idx))?;

            let num_delta_pocs = ref_st.num_delta_pocs as usize;
            let mut used_by_curr_pic_flag = vec![false; num_delta_pocs + 1];
            // Inferred to be 1 when not present.
            let mut use_delta_flag = vec![true; num_delta_pocs + 1];

            for j in 0..=num_delta_pocs {
                used_by_curr_pic_flag[j] = r.read_bit()?;
                if !used_by_curr_pic_flag[j] {
                    use_delta_flag[j] = r.read_bit()?;
                }
            }

            let ref_num_negative = usize::from(ref_st.num_negative_pics);
            let ref_num_positive = usize::from(ref_st.num_positive_pics);

            let mut s0: Vec<(i32, bool)> = vec![];
            let mut s1: Vec<(i32, bool)> = vec![];

            // (7-61)
            for j in (0..ref_num_positive).rev() {
                let d_poc = ref_st.delta_poc_s1[j] + delta_rps;
                if d_poc < 0 && use_delta_flag[ref_num_negative + j] {
                    s0.push((d_poc, used_by_curr_pic_flag[ref_num_negative + j]));
                }
            }

            if delta_rps < 0 && use_delta_flag[num_delta_pocs] {
                s0.push((delta_rps, used_by_curr_pic_flag[num_delta_pocs]));
            }

            for j in 0..ref_num_negative {
                let d_poc = ref_st.delta_poc_s0[j] + delta_rps;
                if d_poc < 0 && use_delta_flag[j] {
                    s0.push((d_poc, used_by_curr_pic_flag[j]));
                }
            }

            // (7-62)
            for j in (0..ref_num_negative).rev() {
                let d_poc = ref_st.delta_poc_s0[j] + delta_rps;
                if d_poc > 0 && use_delta_flag[j] {
                    s1.push((d_poc, used_by_curr_pic_flag[j]));
                }
            }

            if delta_rps > 0 && use_delta_flag[num_delta_pocs] {
                s1.push((delta_rps, used_by_curr_pic_flag[num_delta_pocs]));
            }

            for j in 0..ref_num_positive {
                let d_poc = ref_st.delta_poc_s1[j] + delta_rps;
                if d_poc > 0 && use_delta_flag[ref_num_negative + j] {
                    s1.push((d_poc, used_by_curr_pic_flag[ref_num_negative + j]));
                }
            }

            if s0.len() + s1.len() > MAX_DPB_SIZE {
                return Err(anyhow!(
                    "predicted RPS has {} entries",
                    s0.len() + s1.len()
                ));
            }

            for (i, (d_poc, used)) in s0.iter().enumerate() {
                st.delta_poc_s0[i] = *d_poc;
                st.used_by_curr_pic_s0[i] = *used;
            }

            for (i, (d_poc, used)) in s1.iter().enumerate() {
                st.delta_poc_s1[i] = *d_poc;
                st.used_by_curr_pic_s1[i] = *used;
            }

            st.num_negative_pics = s0.len() as u8;
            st.num_positive_pics = s1.len() as u8;
        } else {
            let max_dec_pic_buffering_minus1 = u32::from(
                sps.max_dec_pic_buffering_minus1[usize::from(sps.max_sub_layers_minus1)],
            );

            st.num_negative_pics = r.read_ue_max(max_dec_pic_buffering_minus1)?;
            st.num_positive_pics = r.read_ue_max(
                max_dec_pic_buffering_minus1 - u32::from(st.num_negative_pics),
            )?;

            for i in 0..usize::from(st.num_negative_pics) {
                let delta_poc_s0_minus1: i32 = r.read_ue_max(32767)?;
                let previous = if i == 0 { 0 } else { st.delta_poc_s0[i - 1] };

                // (7-67)
                st.delta_poc_s0[i] = previous - (delta_poc_s0_minus1 + 1);
                st.used_by_curr_pic_s0[i] = r.read_bit()?;
            }

            for i in 0..usize::from(st.num_positive_pics) {
                let delta_poc_s1_minus1: i32 = r.read_ue_max(32767)?;
                let previous = if i == 0 { 0 } else { st.delta_poc_s1[i - 1] };

                // (7-68)
                st.delta_poc_s1[i] = previous + delta_poc_s1_minus1 + 1;
                st.used_by_curr_pic_s1[i] = r.read_bit()?;
            }
        }

        st.num_delta_pocs = u32::from(st.num_negative_pics) + u32::from(st.num_positive_pics);

        Ok(st)
    }

    fn parse_vui_parameters(r: &mut BitReader, sps: &mut Sps) -> anyhow::Result<()> {
        let max_sub_layers_minus1 = sps.max_sub_layers_minus1;
        let vui = &mut sps.vui_parameters;

        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            const EXTENDED_SAR: u8 = 255;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        // overscan_info_present_flag
        if r.read_bit()? {
            // overscan_appropriate_flag
            r.skip_bits(1)?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coeffs = r.read_bits(8)?;
            }
        }

        // chroma_loc_info_present_flag
        if r.read_bit()? {
            let _: u32 = r.read_ue_max(5)?;
            let _: u32 = r.read_ue_max(5)?;
        }

        // neutral_chroma_indication_flag
        r.skip_bits(1)?;
        vui.field_seq_flag = r.read_bit()?;
        vui.frame_field_info_present_flag = r.read_bit()?;
        vui.default_display_window_flag = r.read_bit()?;

        if vui.default_display_window_flag {
            vui.def_disp_win_left_offset = r.read_ue()?;
            vui.def_disp_win_right_offset = r.read_ue()?;
            vui.def_disp_win_top_offset = r.read_ue()?;
            vui.def_disp_win_bottom_offset = r.read_ue()?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = read_u32(r)?;
            vui.time_scale = read_u32(r)?;

            // vui_poc_proportional_to_timing_flag
            if r.read_bit()? {
                let _: u32 = r.read_ue()?;
            }

            vui.hrd_parameters_present_flag = r.read_bit()?;
            if vui.hrd_parameters_present_flag {
                Parser::parse_hrd_parameters(r, true, max_sub_layers_minus1, &mut vui.hrd)?;
            }
        }

        vui.bitstream_restriction_flag = r.read_bit()?;
        if vui.bitstream_restriction_flag {
            // tiles_fixed_structure_flag, motion_vectors_over_pic_boundaries_flag and
            // restricted_ref_pic_lists_flag.
            r.skip_bits(3)?;
            let _: u32 = r.read_ue_max(4095)?;
            let _: u32 = r.read_ue()?;
            let _: u32 = r.read_ue()?;
            let _: u32 = r.read_ue_max(15)?;
            let _: u32 = r.read_ue_max(15)?;
        }

        Ok(())
    }

    fn parse_sps_range_extension(r: &mut BitReader, ext: &mut SpsRangeExtension) -> anyhow::Result<()> {
        ext.transform_skip_rotation_enabled_flag = r.read_bit()?;
        ext.transform_skip_context_enabled_flag = r.read_bit()?;
        ext.implicit_rdpcm_enabled_flag = r.read_bit()?;
        ext.explicit_rdpcm_enabled_flag = r.read_bit()?;
        ext.extended_precision_processing_flag = r.read_bit()?;
        ext.intra_smoothing_disabled_flag = r.read_bit()?;
        ext.high_precision_offsets_enabled_flag = r.read_bit()?;
        ext.persistent_rice_adaptation_enabled_flag = r.read_bit()?;
        ext.cabac_bypass_alignment_enabled_flag = r.read_bit()?;

        Ok(())
    }

    pub fn parse_vps(nalu: &Nalu) -> anyhow::Result<Vps> {
        if !matches!(nalu.header.type_, NaluType::VpsNut) {
            return Err(anyhow!("expected a VPS, got {:?}", nalu.header.type_));
        }

        let mut r = BitReader::new(nalu.payload());
        let mut vps = Vps {
            video_parameter_set_id: r.read_bits(4)?,
            base_layer_internal_flag: r.read_bit()?,
            base_layer_available_flag: r.read_bit()?,
            max_layers_minus1: r.read_bits(6)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if vps.max_sub_layers_minus1 > 6 {
            return Err(anyhow!(
                "invalid vps_max_sub_layers_minus1 {}",
                vps.max_sub_layers_minus1
            ));
        }

        // vps_reserved_0xffff_16bits
        r.skip_bits(16)?;

        Parser::parse_profile_tier_level(
            &mut r,
            &mut vps.profile_tier_level,
            vps.max_sub_layers_minus1,
        )?;

        vps.sub_layer_ordering_info_present_flag = r.read_bit()?;

        let max_sub_layers = usize::from(vps.max_sub_layers_minus1);
        let start = if vps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers
        };

        for i in start..=max_sub_layers {
            vps.max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
            vps.max_num_reorder_pics[i] = r.read_ue_max(vps.max_dec_pic_buffering_minus1[i])?;
            vps.max_latency_increase_plus1[i] = r.read_ue_max(u32::MAX - 1)?;
        }

        // Values of the highest sub-layer apply to all of them.
        for i in 0..start {
            vps.max_dec_pic_buffering_minus1[i] = vps.max_dec_pic_buffering_minus1[max_sub_layers];
            vps.max_num_reorder_pics[i] = vps.max_num_reorder_pics[max_sub_layers];
            vps.max_latency_increase_plus1[i] = vps.max_latency_increase_plus1[max_sub_layers];
        }

        vps.max_layer_id = r.read_bits(6)?;
        vps.num_layer_sets_minus1 = r.read_ue_max(1023)?;

        for _ in 1..=vps.num_layer_sets_minus1 {
            // layer_id_included_flag
            r.skip_bits(usize::from(vps.max_layer_id) + 1)?;
        }

        vps.timing_info_present_flag = r.read_bit()?;
        if vps.timing_info_present_flag {
            vps.num_units_in_tick = read_u32(&mut r)?;
            vps.time_scale = read_u32(&mut r)?;

            vps.poc_proportional_to_timing_flag = r.read_bit()?;
            if vps.poc_proportional_to_timing_flag {
                vps.num_ticks_poc_diff_one_minus1 = r.read_ue_max(u32::MAX - 1)?;
            }

            vps.num_hrd_parameters = r.read_ue_max(vps.num_layer_sets_minus1 + 1)?;

            for i in 0..vps.num_hrd_parameters {
                // hrd_layer_set_idx
                let _: u32 = r.read_ue()?;
                let cprms_present_flag = if i > 0 { r.read_bit()? } else { true };

                let mut hrd = HrdParams::default();
                Parser::parse_hrd_parameters(
                    &mut r,
                    cprms_present_flag,
                    vps.max_sub_layers_minus1,
                    &mut hrd,
                )?;
                vps.hrd_parameters.push(hrd);
            }
        }

        vps.extension_flag = r.read_bit()?;

        Ok(vps)
    }

    pub fn parse_sps(nalu: &Nalu) -> anyhow::Result<Sps> {
        if !matches!(nalu.header.type_, NaluType::SpsNut) {
            return Err(anyhow!("expected a SPS, got {:?}", nalu.header.type_));
        }

        let mut r = BitReader::new(nalu.payload());
        let mut sps = Sps {
            video_parameter_set_id: r.read_bits(4)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if sps.max_sub_layers_minus1 > 6 {
            return Err(anyhow!(
                "invalid sps_max_sub_layers_minus1 {}",
                sps.max_sub_layers_minus1
            ));
        }

        Parser::parse_profile_tier_level(
            &mut r,
            &mut sps.profile_tier_level,
            sps.max_sub_layers_minus1,
        )?;

        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT - 1)?;
        sps.chroma_format_idc = r.read_ue_max(3)?;

        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bit()?;
        }

        sps.chroma_array_type = if sps.separate_colour_plane_flag {
            0
        } else {
            sps.chroma_format_idc
        };

        sps.pic_width_in_luma_samples = r.read_ue_bounded(1, 16888)?;
        sps.pic_height_in_luma_samples = r.read_ue_bounded(1, 16888)?;

        sps.conformance_window_flag = r.read_bit()?;
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.read_ue()?;
            sps.conf_win_right_offset = r.read_ue()?;
            sps.conf_win_top_offset = r.read_ue()?;
            sps.conf_win_bottom_offset = r.read_ue()?;

            let (sub_width_c, sub_height_c) = sps.sub_width_height_c();

            sps.conf_win_left_offset
                .checked_add(sps.conf_win_right_offset)
                .and_then(|v| v.checked_mul(sub_width_c))
                .and_then(|v| sps.width().checked_sub(v))
                .ok_or(anyhow!("invalid conformance window width"))?;

            sps.conf_win_top_offset
                .checked_add(sps.conf_win_bottom_offset)
                .and_then(|v| v.checked_mul(sub_height_c))
                .and_then(|v| sps.height().checked_sub(v))
                .ok_or(anyhow!("invalid conformance window height"))?;
        }

        sps.bit_depth_luma_minus8 = r.read_ue_max(8)?;
        sps.bit_depth_chroma_minus8 = r.read_ue_max(8)?;
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        sps.sub_layer_ordering_info_present_flag = r.read_bit()?;

        let max_sub_layers = usize::from(sps.max_sub_layers_minus1);
        let start = if sps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers
        };

        for i in start..=max_sub_layers {
            sps.max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
            sps.max_num_reorder_pics[i] =
                r.read_ue_max(u32::from(sps.max_dec_pic_buffering_minus1[i]))?;
            sps.max_latency_increase_plus1[i] = r.read_ue_max(u32::MAX - 1)?;
        }

        for i in 0..start {
            sps.max_dec_pic_buffering_minus1[i] = sps.max_dec_pic_buffering_minus1[max_sub_layers];
            sps.max_num_reorder_pics[i] = sps.max_num_reorder_pics[max_sub_layers];
            sps.max_latency_increase_plus1[i] = sps.max_latency_increase_plus1[max_sub_layers];
        }

        sps.log2_min_luma_coding_block_size_minus3 = r.read_ue_max(3)?;
        sps.log2_diff_max_min_luma_coding_block_size = r.read_ue_max(3)?;
        sps.log2_min_luma_transform_block_size_minus2 = r.read_ue_max(3)?;
        sps.log2_diff_max_min_luma_transform_block_size = r.read_ue_max(3)?;

        // (7-10)
        sps.min_cb_log2_size_y = u32::from(sps.log2_min_luma_coding_block_size_minus3) + 3;
        // (7-11)
        sps.ctb_log2_size_y =
            sps.min_cb_log2_size_y + u32::from(sps.log2_diff_max_min_luma_coding_block_size);
        // (7-13)
        sps.ctb_size_y = 1 << sps.ctb_log2_size_y;
        // (7-15)
        sps.pic_width_in_ctbs_y = sps.width().div_ceil(sps.ctb_size_y);
        // (7-17)
        sps.pic_height_in_ctbs_y = sps.height().div_ceil(sps.ctb_size_y);
        // (7-19)
        sps.pic_size_in_ctbs_y = sps.pic_width_in_ctbs_y * sps.pic_height_in_ctbs_y;

        sps.max_tb_log2_size_y = u32::from(sps.log2_min_luma_transform_block_size_minus2)
            + 2
            + u32::from(sps.log2_diff_max_min_luma_transform_block_size);

        if sps.max_tb_log2_size_y > std::cmp::min(sps.ctb_log2_size_y, 5) {
            return Err(anyhow!(
                "invalid MaxTbLog2SizeY {}",
                sps.max_tb_log2_size_y
            ));
        }

        sps.max_transform_hierarchy_depth_inter = r.read_ue_max(4)?;
        sps.max_transform_hierarchy_depth_intra = r.read_ue_max(4)?;

        sps.scaling_list_enabled_flag = r.read_bit()?;
        if sps.scaling_list_enabled_flag {
            sps.scaling_list = ScalingLists::default_lists();

            sps.scaling_list_data_present_flag = r.read_bit()?;
            if sps.scaling_list_data_present_flag {
                Parser::parse_scaling_list_data(&mut r, &mut sps.scaling_list)
                    .context("while parsing the SPS scaling lists")?;
            }
        }

        sps.amp_enabled_flag = r.read_bit()?;
        sps.sample_adaptive_offset_enabled_flag = r.read_bit()?;

        sps.pcm_enabled_flag = r.read_bit()?;
        if sps.pcm_enabled_flag {
            sps.pcm_sample_bit_depth_luma_minus1 = r.read_bits(4)?;
            sps.pcm_sample_bit_depth_chroma_minus1 = r.read_bits(4)?;
            sps.log2_min_pcm_luma_coding_block_size_minus3 = r.read_ue_max(2)?;
            sps.log2_diff_max_min_pcm_luma_coding_block_size = r.read_ue_max(2)?;
            sps.pcm_loop_filter_disabled_flag = r.read_bit()?;
        }

        sps.num_short_term_ref_pic_sets = r.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS)?;

        for i in 0..sps.num_short_term_ref_pic_sets {
            let st = Parser::parse_short_term_ref_pic_set(&mut r, &sps, i)
                .with_context(|| format!("while parsing short-term RPS {}", i))?;
            sps.short_term_ref_pic_set.push(st);
        }

        sps.long_term_ref_pics_present_flag = r.read_bit()?;
        if sps.long_term_ref_pics_present_flag {
            sps.num_long_term_ref_pics_sps = r.read_ue_max(MAX_LONG_TERM_REF_PICS as u32)?;
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                sps.lt_ref_pic_poc_lsb_sps[i] =
                    r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;
                sps.used_by_curr_pic_lt_sps_flag[i] = r.read_bit()?;
            }
        }

        sps.temporal_mvp_enabled_flag = r.read_bit()?;
        sps.strong_intra_smoothing_enabled_flag = r.read_bit()?;

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui_parameters(&mut r, &mut sps)
                .context("while parsing the VUI parameters")?;
        }

        sps.extension_present_flag = r.read_bit()?;
        if sps.extension_present_flag {
            sps.range_extension_flag = r.read_bit()?;
            if sps.range_extension_flag {
                Parser::parse_sps_range_extension(&mut r, &mut sps.range_extension)?;
            }

            let multilayer_extension_flag = r.read_bit()?;
            let three_d_extension_flag = r.read_bit()?;
            let scc_extension_flag = r.read_bit()?;
            if multilayer_extension_flag || three_d_extension_flag || scc_extension_flag {
                return Err(anyhow!("multilayer, 3D and SCC extensions are not supported"));
            }
        }

        let high_precision = sps.range_extension.high_precision_offsets_enabled_flag;
        let shift_y = if high_precision {
            u32::from(sps.bit_depth_luma_minus8) + 7
        } else {
            7
        };
        let shift_c = if high_precision {
            u32::from(sps.bit_depth_chroma_minus8) + 7
        } else {
            7
        };

        sps.wp_offset_half_range_y = 1 << shift_y;
        sps.wp_offset_half_range_c = 1 << shift_c;

        Ok(sps)
    }

    fn parse_pps_range_extension(
        r: &mut BitReader,
        pps: &mut Pps,
        sps: &Sps,
    ) -> anyhow::Result<()> {
        let rext = &mut pps.range_extension;

        if pps.transform_skip_enabled_flag {
            rext.log2_max_transform_skip_block_size_minus2 =
                r.read_ue_max(sps.max_tb_log2_size_y - 2)?;
        }

        rext.cross_component_prediction_enabled_flag = r.read_bit()?;
        rext.chroma_qp_offset_list_enabled_flag = r.read_bit()?;
        if rext.chroma_qp_offset_list_enabled_flag {
            rext.diff_cu_chroma_qp_offset_depth = r.read_ue()?;
            rext.chroma_qp_offset_list_len_minus1 = r.read_ue_max(5)?;
            for i in 0..=rext.chroma_qp_offset_list_len_minus1 as usize {
                rext.cb_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                rext.cr_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
            }
        }

        let max = u32::from(sps.bit_depth_luma().saturating_sub(10));
        rext.log2_sao_offset_scale_luma = r.read_ue_max(max)?;
        let max = u32::from(sps.bit_depth_chroma().saturating_sub(10));
        rext.log2_sao_offset_scale_chroma = r.read_ue_max(max)?;

        Ok(())
    }

    /// 6.5.1, for tiles with uniform spacing.
    fn fill_uniform_tiles(pps: &mut Pps, sps: &Sps) {
        let num_columns = u32::from(pps.num_tile_columns_minus1) + 1;
        let num_rows = u32::from(pps.num_tile_rows_minus1) + 1;

        for i in 0..num_columns {
            pps.column_width_minus1[i as usize] = ((i + 1) * sps.pic_width_in_ctbs_y) / num_columns
                - (i * sps.pic_width_in_ctbs_y) / num_columns
                - 1;
        }

        for j in 0..num_rows {
            pps.row_height_minus1[j as usize] = ((j + 1) * sps.pic_height_in_ctbs_y) / num_rows
                - (j * sps.pic_height_in_ctbs_y) / num_rows
                - 1;
        }
    }

    /// Parses the RBSP of a PPS against `sps`.
    fn parse_pps_payload(payload: &[u8], temporal_id: u8, sps: &Sps) -> anyhow::Result<Pps> {
        let mut r = BitReader::new(payload);
        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_max(MAX_PPS_COUNT - 1)?,
            seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT - 1)?,
            temporal_id,
            ..Default::default()
        };

        pps.dependent_slice_segments_enabled_flag = r.read_bit()?;
        pps.output_flag_present_flag = r.read_bit()?;
        pps.num_extra_slice_header_bits = r.read_bits(3)?;
        pps.sign_data_hiding_enabled_flag = r.read_bit()?;
        pps.cabac_init_present_flag = r.read_bit()?;

        // 7.4.3.3.1
        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;

        // (7-5)
        let qp_bd_offset_y = 6 * i32::from(sps.bit_depth_luma_minus8);
        pps.qp_bd_offset_y = qp_bd_offset_y as u32;
        pps.init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;

        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.transform_skip_enabled_flag = r.read_bit()?;
        pps.cu_qp_delta_enabled_flag = r.read_bit()?;

        if pps.cu_qp_delta_enabled_flag {
            pps.diff_cu_qp_delta_depth =
                r.read_ue_max(u32::from(sps.log2_diff_max_min_luma_coding_block_size))?;
        }

        pps.cb_qp_offset = r.read_se_bounded(-12, 12)?;
        pps.cr_qp_offset = r.read_se_bounded(-12, 12)?;

        pps.slice_chroma_qp_offsets_present_flag = r.read_bit()?;
        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_flag = r.read_bit()?;
        pps.transquant_bypass_enabled_flag = r.read_bit()?;
        pps.tiles_enabled_flag = r.read_bit()?;
        pps.entropy_coding_sync_enabled_flag = r.read_bit()?;

        if pps.tiles_enabled_flag {
            pps.num_tile_columns_minus1 =
                r.read_ue_max(std::cmp::min(sps.pic_width_in_ctbs_y - 1, 19))?;
            pps.num_tile_rows_minus1 =
                r.read_ue_max(std::cmp::min(sps.pic_height_in_ctbs_y - 1, 21))?;
            pps.uniform_spacing_flag = r.read_bit()?;

            if pps.uniform_spacing_flag {
                Parser::fill_uniform_tiles(&mut pps, sps);
            } else {
                let num_columns_minus1 = usize::from(pps.num_tile_columns_minus1);
                let mut remaining = sps.pic_width_in_ctbs_y - 1;
                for i in 0..num_columns_minus1 {
                    pps.column_width_minus1[i] = r.read_ue_max(remaining.saturating_sub(1))?;
                    remaining = remaining
                        .checked_sub(pps.column_width_minus1[i] + 1)
                        .context("tile columns exceed the picture width")?;
                }
                pps.column_width_minus1[num_columns_minus1] = remaining;

                let num_rows_minus1 = usize::from(pps.num_tile_rows_minus1);
                let mut remaining = sps.pic_height_in_ctbs_y - 1;
                for i in 0..num_rows_minus1 {
                    pps.row_height_minus1[i] = r.read_ue_max(remaining.saturating_sub(1))?;
                    remaining = remaining
                        .checked_sub(pps.row_height_minus1[i] + 1)
                        .context("tile rows exceed the picture height")?;
                }
                pps.row_height_minus1[num_rows_minus1] = remaining;
            }

            pps.loop_filter_across_tiles_enabled_flag = r.read_bit()?;
        }

        pps.loop_filter_across_slices_enabled_flag = r.read_bit()?;
        pps.deblocking_filter_control_present_flag = r.read_bit()?;

        if pps.deblocking_filter_control_present_flag {
            pps.deblocking_filter_override_enabled_flag = r.read_bit()?;
            pps.deblocking_filter_disabled_flag = r.read_bit()?;
            if !pps.deblocking_filter_disabled_flag {
                pps.beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                pps.tc_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        pps.scaling_list = sps.scaling_list.clone();
        pps.scaling_list_data_present_flag = r.read_bit()?;
        if pps.scaling_list_data_present_flag {
            if !sps.scaling_list_enabled_flag {
                return Err(anyhow!("PPS scaling lists sent while the SPS disables them"));
            }

            let mut lists = ScalingLists::default_lists();
            Parser::parse_scaling_list_data(&mut r, &mut lists)
                .context("while parsing the PPS scaling lists")?;
            pps.scaling_list = lists;
        }

        pps.lists_modification_present_flag = r.read_bit()?;
        pps.log2_parallel_merge_level_minus2 = r.read_ue_max(sps.ctb_log2_size_y - 2)?;
        pps.slice_segment_header_extension_present_flag = r.read_bit()?;

        pps.extension_present_flag = r.read_bit()?;
        if pps.extension_present_flag {
            pps.range_extension_flag = r.read_bit()?;

            if pps.range_extension_flag {
                Parser::parse_pps_range_extension(&mut r, &mut pps, sps)?;
            }

            let multilayer_extension_flag = r.read_bit()?;
            let three_d_extension_flag = r.read_bit()?;
            let scc_extension_flag = r.read_bit()?;
            if multilayer_extension_flag || three_d_extension_flag || scc_extension_flag {
                return Err(anyhow!("multilayer, 3D and SCC extensions are not supported"));
            }
        }

        Ok(pps)
    }

    fn parse_pred_weight_table(
        r: &mut BitReader,
        sps: &Sps,
        hdr: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let pwt = &mut hdr.pred_weight_table;

        pwt.luma_log2_weight_denom = r.read_ue_max(7)?;
        if sps.chroma_array_type != 0 {
            pwt.delta_chroma_log2_weight_denom = r.read_se()?;
            pwt.chroma_log2_weight_denom = (i32::from(pwt.luma_log2_weight_denom)
                + i32::from(pwt.delta_chroma_log2_weight_denom))
            .try_into()
            .context("invalid delta_chroma_log2_weight_denom")?;
        }

        let offset_y = sps.wp_offset_half_range_y as i32;
        let offset_c = sps.wp_offset_half_range_c as i32;

        let lists = if hdr.type_.is_b() { 2 } else { 1 };
        for list in 0..lists {
            let num_active = if list == 0 {
                usize::from(hdr.num_ref_idx_l0_active_minus1) + 1
            } else {
                usize::from(hdr.num_ref_idx_l1_active_minus1) + 1
            };

            let (luma_flags, chroma_flags, luma_weights, luma_offsets, chroma_weights, chroma_offsets) =
                if list == 0 {
                    (
                        &mut pwt.luma_weight_l0_flag,
                        &mut pwt.chroma_weight_l0_flag,
                        &mut pwt.delta_luma_weight_l0,
                        &mut pwt.luma_offset_l0,
                        &mut pwt.delta_chroma_weight_l0,
                        &mut pwt.delta_chroma_offset_l0,
                    )
                } else {
                    (
                        &mut pwt.luma_weight_l1_flag,
                        &mut pwt.chroma_weight_l1_flag,
                        &mut pwt.delta_luma_weight_l1,
                        &mut pwt.luma_offset_l1,
                        &mut pwt.delta_chroma_weight_l1,
                        &mut pwt.delta_chroma_offset_l1,
                    )
                };

            for flag in luma_flags.iter_mut().take(num_active) {
                *flag = r.read_bit()?;
            }

            if sps.chroma_array_type != 0 {
                for flag in chroma_flags.iter_mut().take(num_active) {
                    *flag = r.read_bit()?;
                }
            }

            for i in 0..num_active {
                if luma_flags[i] {
                    luma_weights[i] = r.read_se_bounded(-128, 127)?;
                    luma_offsets[i] = r.read_se_bounded(-offset_y, offset_y - 1)?;
                }

                if chroma_flags[i] {
                    for j in 0..2 {
                        chroma_weights[i][j] = r.read_se_bounded(-128, 127)?;
                        chroma_offsets[i][j] = r.read_se_bounded(-4 * offset_c, 4 * offset_c - 1)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_ref_pic_lists_modification(
        r: &mut BitReader,
        hdr: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let num_bits = ceil_log2(hdr.num_pic_total_curr);
        let rplm = &mut hdr.ref_pic_list_modification;

        rplm.ref_pic_list_modification_flag_l0 = r.read_bit()?;
        if rplm.ref_pic_list_modification_flag_l0 {
            for _ in 0..=hdr.num_ref_idx_l0_active_minus1 {
                let entry: u32 = r.read_bits(num_bits)?;
                if entry >= hdr.num_pic_total_curr {
                    return Err(anyhow!("invalid list_entry_l0 {}", entry));
                }
                rplm.list_entry_l0.push(entry);
            }
        }

        if hdr.type_.is_b() {
            rplm.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if rplm.ref_pic_list_modification_flag_l1 {
                for _ in 0..=hdr.num_ref_idx_l1_active_minus1 {
                    let entry: u32 = r.read_bits(num_bits)?;
                    if entry >= hdr.num_pic_total_curr {
                        return Err(anyhow!("invalid list_entry_l1 {}", entry));
                    }
                    rplm.list_entry_l1.push(entry);
                }
            }
        }

        Ok(())
    }

    fn parse_long_term_ref_pics(
        r: &mut BitReader,
        sps: &Sps,
        hdr: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        if sps.num_long_term_ref_pics_sps > 0 {
            hdr.num_long_term_sps = r.read_ue_max(u32::from(sps.num_long_term_ref_pics_sps))?;
        }

        hdr.num_long_term_pics =
            r.read_ue_max(MAX_LONG_TERM_REF_PICS as u32 - u32::from(hdr.num_long_term_sps))?;

        let poc_lsb_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
        let num_long_term_sps = usize::from(hdr.num_long_term_sps);

        for i in 0..hdr.num_long_term() {
            if i < num_long_term_sps {
                if sps.num_long_term_ref_pics_sps > 1 {
                    let num_bits = ceil_log2(u32::from(sps.num_long_term_ref_pics_sps));
                    hdr.lt_idx_sps[i] = r.read_bits(num_bits)?;
                }

                let lt_idx_sps = usize::from(hdr.lt_idx_sps[i]);
                if lt_idx_sps >= usize::from(sps.num_long_term_ref_pics_sps) {
                    return Err(anyhow!("invalid lt_idx_sps[{}] {}", i, lt_idx_sps));
                }

                hdr.poc_lsb_lt[i] = sps.lt_ref_pic_poc_lsb_sps[lt_idx_sps];
                hdr.used_by_curr_pic_lt[i] = sps.used_by_curr_pic_lt_sps_flag[lt_idx_sps];
            } else {
                hdr.poc_lsb_lt[i] = r.read_bits(poc_lsb_bits)?;
                hdr.used_by_curr_pic_lt[i] = r.read_bit()?;
            }

            hdr.delta_poc_msb_present_flag[i] = r.read_bit()?;
            let delta_poc_msb_cycle_lt: u32 = if hdr.delta_poc_msb_present_flag[i] {
                r.read_ue_max(1 << (32 - poc_lsb_bits))?
            } else {
                0
            };

            // (7-52)
            hdr.delta_poc_msb_cycle_lt[i] = if i == 0 || i == num_long_term_sps {
                delta_poc_msb_cycle_lt
            } else {
                delta_poc_msb_cycle_lt + hdr.delta_poc_msb_cycle_lt[i - 1]
            };
        }

        Ok(())
    }

    /// Parses a slice segment header. Dependent slice segments inherit the header of the last
    /// independent segment.
    pub fn parse_slice_header<'a>(&mut self, nalu: Nalu<'a>) -> anyhow::Result<Slice<'a>> {
        if !nalu.header.type_.is_slice() {
            return Err(anyhow!(
                "{:?} is not a supported slice unit",
                nalu.header.type_
            ));
        }

        let mut r = BitReader::new(nalu.payload());

        let first_slice_segment_in_pic_flag = r.read_bit()?;
        let no_output_of_prior_pics_flag = if nalu.header.type_.is_irap() {
            r.read_bit()?
        } else {
            false
        };

        let pic_parameter_set_id: u8 = r.read_ue_max(MAX_PPS_COUNT - 1)?;

        let pps = Rc::clone(
            self.get_pps(pic_parameter_set_id)
                .with_context(|| format!("slice references unknown PPS {}", pic_parameter_set_id))?,
        );
        let sps = Rc::clone(
            self.get_sps(pps.seq_parameter_set_id)
                .with_context(|| format!("PPS references unknown SPS {}", pps.seq_parameter_set_id))?,
        );

        let mut dependent_slice_segment_flag = false;
        let mut segment_address = 0;

        if !first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                dependent_slice_segment_flag = r.read_bit()?;
            }

            segment_address = r.read_bits(ceil_log2(sps.pic_size_in_ctbs_y))?;
            if segment_address >= sps.pic_size_in_ctbs_y {
                return Err(anyhow!("invalid slice_segment_address {}", segment_address));
            }
        }

        let mut hdr = if dependent_slice_segment_flag {
            let independent = self
                .last_independent_header
                .clone()
                .context("dependent slice segment without a preceding independent one")?;

            SliceHeader {
                first_slice_segment_in_pic_flag,
                no_output_of_prior_pics_flag,
                pic_parameter_set_id,
                dependent_slice_segment_flag,
                segment_address,
                num_entry_point_offsets: 0,
                offset_len_minus1: 0,
                entry_point_offset_minus1: vec![],
                ..independent
            }
        } else {
            SliceHeader {
                first_slice_segment_in_pic_flag,
                no_output_of_prior_pics_flag,
                pic_parameter_set_id,
                segment_address,
                deblocking_filter_disabled_flag: pps.deblocking_filter_disabled_flag,
                beta_offset_div2: pps.beta_offset_div2,
                tc_offset_div2: pps.tc_offset_div2,
                loop_filter_across_slices_enabled_flag: pps
                    .loop_filter_across_slices_enabled_flag,
                curr_rps_idx: sps.num_short_term_ref_pic_sets,
                ..Default::default()
            }
        };

        if !dependent_slice_segment_flag {
            Parser::parse_independent_slice_header(&mut r, &nalu, &sps, &pps, &mut hdr)?;
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let max = match (pps.tiles_enabled_flag, pps.entropy_coding_sync_enabled_flag) {
                (false, true) => sps.pic_height_in_ctbs_y - 1,
                (true, false) => {
                    (u32::from(pps.num_tile_columns_minus1) + 1)
                        * (u32::from(pps.num_tile_rows_minus1) + 1)
                        - 1
                }
                _ => (u32::from(pps.num_tile_columns_minus1) + 1) * sps.pic_height_in_ctbs_y - 1,
            };

            hdr.num_entry_point_offsets = r.read_ue_max(max)?;
            if hdr.num_entry_point_offsets > 0 {
                hdr.offset_len_minus1 = r.read_ue_max(31)?;
                for _ in 0..hdr.num_entry_point_offsets {
                    let offset = r.read_bits(usize::from(hdr.offset_len_minus1) + 1)?;
                    hdr.entry_point_offset_minus1.push(offset);
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            let slice_segment_header_extension_length: usize = r.read_ue_max(256)?;
            r.skip_bits(8 * slice_segment_header_extension_length)?;
        }

        // byte_alignment( ): a one bit, then zeros up to the byte boundary.
        if !r.read_bit()? {
            return Err(anyhow!("invalid alignment_bit_equal_to_one"));
        }
        let num_bits = r.num_bits_left() % 8;
        r.skip_bits(num_bits)?;

        let epb = r.num_epb();
        hdr.header_bit_size = ((nalu.size - epb) * 8 - r.num_bits_left()) as u32;
        hdr.n_emulation_prevention_bytes = epb as u32;

        if !dependent_slice_segment_flag {
            self.last_independent_header = Some(hdr.clone());
        }

        Ok(Slice { header: hdr, nalu })
    }

    fn parse_independent_slice_header(
        r: &mut BitReader,
        nalu: &Nalu,
        sps: &Sps,
        pps: &Pps,
        hdr: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        r.skip_bits(usize::from(pps.num_extra_slice_header_bits))?;

        let slice_type: u8 = r.read_ue_max(2)?;
        hdr.type_ =
            SliceType::n(slice_type).with_context(|| format!("invalid slice type {}", slice_type))?;

        if nalu.header.type_.is_irap() && !hdr.type_.is_i() {
            return Err(anyhow!("IRAP pictures only carry I slices"));
        }

        if pps.output_flag_present_flag {
            hdr.pic_output_flag = r.read_bit()?;
        }

        if sps.separate_colour_plane_flag {
            hdr.colour_plane_id = r.read_bits(2)?;
        }

        if !nalu.header.type_.is_idr() {
            hdr.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            hdr.short_term_ref_pic_set_sps_flag = r.read_bit()?;
            if !hdr.short_term_ref_pic_set_sps_flag {
                let num_bits_left = r.num_bits_left();
                hdr.short_term_ref_pic_set =
                    Parser::parse_short_term_ref_pic_set(r, sps, sps.num_short_term_ref_pic_sets)
                        .context("while parsing the slice short-term RPS")?;
                hdr.st_rps_bits = (num_bits_left - r.num_bits_left()) as u32;
            } else {
                if sps.num_short_term_ref_pic_sets == 0 {
                    return Err(anyhow!("slice selects a short-term RPS but the SPS has none"));
                }

                if sps.num_short_term_ref_pic_sets > 1 {
                    let num_bits = ceil_log2(u32::from(sps.num_short_term_ref_pic_sets));
                    hdr.short_term_ref_pic_set_idx = r.read_bits(num_bits)?;
                }

                if hdr.short_term_ref_pic_set_idx >= sps.num_short_term_ref_pic_sets {
                    return Err(anyhow!(
                        "invalid short_term_ref_pic_set_idx {}",
                        hdr.short_term_ref_pic_set_idx
                    ));
                }

                hdr.curr_rps_idx = hdr.short_term_ref_pic_set_idx;
            }

            if sps.long_term_ref_pics_present_flag {
                Parser::parse_long_term_ref_pics(r, sps, hdr)?;
            }

            if sps.temporal_mvp_enabled_flag {
                hdr.temporal_mvp_enabled_flag = r.read_bit()?;
            }
        }

        if sps.sample_adaptive_offset_enabled_flag {
            hdr.sao_luma_flag = r.read_bit()?;
            if sps.chroma_array_type != 0 {
                hdr.sao_chroma_flag = r.read_bit()?;
            }
        }

        if hdr.type_.is_p() || hdr.type_.is_b() {
            hdr.num_ref_idx_active_override_flag = r.read_bit()?;
            if hdr.num_ref_idx_active_override_flag {
                hdr.num_ref_idx_l0_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;
                if hdr.type_.is_b() {
                    hdr.num_ref_idx_l1_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE - 1)?;
                }
            } else {
                hdr.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                hdr.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
            }

            // (7-55)
            let rps = hdr
                .short_term_ref_pic_set(sps)
                .context("invalid short-term RPS index")?;
            let num_long_term_used = hdr.used_by_curr_pic_lt[..hdr.num_long_term()]
                .iter()
                .filter(|used| **used)
                .count() as u32;
            hdr.num_pic_total_curr = rps.num_used_by_curr_pic() + num_long_term_used;

            if hdr.num_pic_total_curr == 0 {
                return Err(anyhow!("inter slice without any reference picture"));
            }

            if pps.lists_modification_present_flag && hdr.num_pic_total_curr > 1 {
                Parser::parse_ref_pic_lists_modification(r, hdr)?;
            }

            if hdr.type_.is_b() {
                hdr.mvd_l1_zero_flag = r.read_bit()?;
            }

            if pps.cabac_init_present_flag {
                hdr.cabac_init_flag = r.read_bit()?;
            }

            if hdr.temporal_mvp_enabled_flag {
                if hdr.type_.is_b() {
                    hdr.collocated_from_l0_flag = r.read_bit()?;
                }

                let max = if hdr.collocated_from_l0_flag {
                    hdr.num_ref_idx_l0_active_minus1
                } else {
                    hdr.num_ref_idx_l1_active_minus1
                };

                if max > 0 {
                    hdr.collocated_ref_idx = r.read_ue_max(u32::from(max))?;
                }
            }

            if (pps.weighted_pred_flag && hdr.type_.is_p())
                || (pps.weighted_bipred_flag && hdr.type_.is_b())
            {
                Parser::parse_pred_weight_table(r, sps, hdr)?;
            }

            hdr.five_minus_max_num_merge_cand = r.read_ue_max(4)?;
        }

        hdr.qp_delta = r.read_se_bounded(-87, 77)?;

        let slice_qp_y = 26 + i32::from(pps.init_qp_minus26) + i32::from(hdr.qp_delta);
        if slice_qp_y < -(pps.qp_bd_offset_y as i32) || slice_qp_y > 51 {
            return Err(anyhow!("invalid slice_qp_delta {}", hdr.qp_delta));
        }

        if pps.slice_chroma_qp_offsets_present_flag {
            hdr.cb_qp_offset = r.read_se_bounded(-12, 12)?;
            hdr.cr_qp_offset = r.read_se_bounded(-12, 12)?;

            let cb = i32::from(pps.cb_qp_offset) + i32::from(hdr.cb_qp_offset);
            let cr = i32::from(pps.cr_qp_offset) + i32::from(hdr.cr_qp_offset);
            if !(-12..=12).contains(&cb) || !(-12..=12).contains(&cr) {
                return Err(anyhow!("invalid slice chroma QP offsets ({}, {})", cb, cr));
            }
        }

        if pps.range_extension.chroma_qp_offset_list_enabled_flag {
            hdr.cu_chroma_qp_offset_enabled_flag = r.read_bit()?;
        }

        if pps.deblocking_filter_override_enabled_flag {
            hdr.deblocking_filter_override_flag = r.read_bit()?;
        }

        if hdr.deblocking_filter_override_flag {
            hdr.deblocking_filter_disabled_flag = r.read_bit()?;
            if !hdr.deblocking_filter_disabled_flag {
                hdr.beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                hdr.tc_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        if pps.loop_filter_across_slices_enabled_flag
            && (hdr.sao_luma_flag || hdr.sao_chroma_flag || !hdr.deblocking_filter_disabled_flag)
        {
            hdr.loop_filter_across_slices_enabled_flag = r.read_bit()?;
        }

        Ok(())
    }

    pub fn get_vps(&self, vps_id: u8) -> Option<&Rc<Vps>> {
        self.vpses.get(vps_id)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.spses.get(sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.ppses.get(pps_id)
    }

    /// Stores the PPS in `nalu`, or holds it back until its SPS shows up.
    fn ingest_pps(&mut self, data: &[u8]) -> anyhow::Result<IngestStatus> {
        let header = NaluHeader::parse(data).context("invalid PPS unit header")?;
        let payload = data
            .get(NaluHeader::LEN..)
            .context("PPS unit is shorter than its header")?;

        let mut r = BitReader::new(payload);
        let pps_id: u8 = r.read_ue_max(MAX_PPS_COUNT - 1)?;
        let sps_id: u8 = r.read_ue_max(MAX_SPS_COUNT - 1)?;

        let Some(sps) = self.spses.get(sps_id) else {
            log::debug!("Holding PPS {} until SPS {} is received", pps_id, sps_id);
            self.pending_ppses.insert(
                pps_id,
                PendingPps {
                    seq_parameter_set_id: sps_id,
                    data: data.to_vec(),
                },
            );
            return Ok(IngestStatus::Unchanged);
        };

        let pps = Parser::parse_pps_payload(payload, header.temporal_id(), sps)
            .with_context(|| format!("while parsing PPS {}", pps_id))?;
        self.pending_ppses.remove(&pps_id);

        Ok(self.ppses.insert(pps_id, data, pps))
    }

    /// Ingests the PPSs that were waiting for SPS `sps_id`.
    fn resolve_pending_ppses(&mut self, sps_id: u8) -> IngestStatus {
        let ready: Vec<u8> = self
            .pending_ppses
            .iter()
            .filter(|(_, pending)| pending.seq_parameter_set_id == sps_id)
            .map(|(id, _)| *id)
            .collect();

        let mut status = IngestStatus::Unchanged;
        for pps_id in ready {
            let Some(pending) = self.pending_ppses.remove(&pps_id) else {
                continue;
            };

            match self.ingest_pps(&pending.data) {
                Ok(result) => status = status.or(result),
                Err(e) => log::warn!("Dropping pending PPS {}: {:#}", pps_id, e),
            }
        }

        status
    }
}

impl ParameterSetStore for Parser {
    type Header = NaluHeader;

    fn ingest(&mut self, nalu: &Nalu) -> anyhow::Result<IngestStatus> {
        match nalu.header.type_ {
            NaluType::VpsNut => {
                let vps = Parser::parse_vps(nalu).context("while parsing VPS")?;
                Ok(self.vpses.insert(vps.video_parameter_set_id, nalu.data, vps))
            }
            NaluType::SpsNut => {
                let sps = Parser::parse_sps(nalu).context("while parsing SPS")?;
                let sps_id = sps.seq_parameter_set_id;
                let status = self.spses.insert(sps_id, nalu.data, sps);

                Ok(status.or(self.resolve_pending_ppses(sps_id)))
            }
            NaluType::PpsNut => self.ingest_pps(nalu.data),
            other => Err(anyhow!("{:?} is not a parameter set", other)),
        }
    }

    fn get(&self, kind: ParamSetKind, id: u8) -> Option<ParameterSet<'_>> {
        match kind {
            ParamSetKind::Video => self.get_vps(id).map(|vps| ParameterSet::H265Vps(vps)),
            ParamSetKind::Sequence => self.get_sps(id).map(|sps| ParameterSet::H265Sps(sps)),
            ParamSetKind::Picture => self.get_pps(id).map(|pps| ParameterSet::H265Pps(pps)),
        }
    }

    fn reset(&mut self) {
        self.vpses.clear();
        self.spses.clear();
        self.ppses.clear();
        self.pending_ppses.clear();
        self.last_independent_header = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::UnitScanner;
    use crate::codec::h265::synthesizer::LongTermParams;
    use crate::codec::h265::synthesizer::PpsParams;
    use crate::codec::h265::synthesizer::RpsParams;
    use crate::codec::h265::synthesizer::SliceParams;
    use crate::codec::h265::synthesizer::SliceRps;
    use crate::codec::h265::synthesizer::SpsParams;
    use crate::codec::h265::synthesizer::StreamSynthesizer;

    /// Ingests the parameter sets of `data` and returns the headers of its slices.
    fn parse_stream(parser: &mut Parser, data: &[u8]) -> Vec<SliceHeader> {
        let mut headers = vec![];

        for nalu in UnitScanner::<NaluHeader>::new(data) {
            let nalu = nalu.unwrap();
            match nalu.header.type_ {
                NaluType::VpsNut | NaluType::SpsNut | NaluType::PpsNut => {
                    parser.ingest(&nalu).unwrap();
                }
                type_ if type_.is_slice() => {
                    headers.push(parser.parse_slice_header(nalu).unwrap().header)
                }
                _ => (),
            }
        }

        headers
    }

    #[test]
    fn nalu_header() {
        let header = NaluHeader::parse(&[0x40, 0x01]).unwrap();
        assert_eq!(header.type_, NaluType::VpsNut);
        assert_eq!(header.nuh_layer_id, 0);
        assert_eq!(header.temporal_id(), 0);

        let header = NaluHeader::parse(&[0x26, 0x03]).unwrap();
        assert_eq!(header.type_, NaluType::IdrWRadl);
        assert_eq!(header.temporal_id(), 2);

        let header = NaluHeader::parse(&[(NaluType::EosNut as u8) << 1, 0x01]).unwrap();
        assert_eq!(header.type_, NaluType::EosNut);

        let header = NaluHeader::parse(&[0x7e, 0x01]).unwrap();
        assert_eq!(header.type_, NaluType::Unspecified);
        assert!(!header.type_.is_slice());

        // forbidden_zero_bit
        assert!(NaluHeader::parse(&[0x80, 0x01]).is_none());
        // nuh_temporal_id_plus1 of 0
        assert!(NaluHeader::parse(&[0x40, 0x00]).is_none());
        assert!(NaluHeader::parse(&[0x40]).is_none());
    }

    #[test]
    fn nalu_type_classes() {
        assert!(NaluType::IdrNLp.is_irap());
        assert!(NaluType::BlaWRadl.is_bla());
        assert!(NaluType::CraNut.is_irap());
        assert!(!NaluType::RaslN.is_irap());
        assert!(NaluType::RaslN.is_rasl());
        assert!(NaluType::RadlR.is_radl());
        assert!(NaluType::TrailN.is_slnr());
        assert!(!NaluType::TrailR.is_slnr());
        assert!(!NaluType::RsvIrapVcl22.is_slice());
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(16), 4);
        assert_eq!(ceil_log2(17), 5);
    }

    #[test]
    fn parameter_sets() {
        let sps_params = SpsParams {
            width: 64,
            height: 48,
            conformance_window: Some((0, 4, 0, 2)),
            max_dec_pic_buffering_minus1: 5,
            max_num_reorder_pics: 3,
            max_latency_increase_plus1: 2,
            ..Default::default()
        };
        let data = StreamSynthesizer::new(sps_params, PpsParams::default())
            .parameter_sets()
            .build();

        let mut parser = Parser::default();
        parse_stream(&mut parser, &data);

        let vps = parser.get_vps(0).unwrap();
        assert_eq!(vps.max_dec_pic_buffering_minus1[0], 5);
        assert_eq!(vps.max_num_reorder_pics[0], 3);

        let sps = parser.get_sps(0).unwrap();
        assert_eq!(sps.profile_tier_level.general_profile_idc, 1);
        assert!(sps.profile_tier_level.general_profile_compatibility_flag[1]);
        assert!(!sps.profile_tier_level.general_profile_compatibility_flag[2]);
        assert_eq!(sps.profile_tier_level.general_level_idc, 93);
        assert_eq!(sps.resolution(), Resolution::from((64, 48)));
        assert_eq!(sps.ctb_size_y, 16);
        assert_eq!(sps.pic_size_in_ctbs_y, 12);
        assert_eq!(sps.max_dpb_size(), 6);
        assert_eq!(sps.max_num_reorder(), 3);
        assert_eq!(sps.max_latency_pictures(), Some(4));
        assert_eq!(sps.max_pic_order_cnt_lsb(), 256);

        let visible = sps.visible_rectangle();
        assert_eq!(visible.min, Point { x: 0, y: 0 });
        assert_eq!(visible.max, Point { x: 56, y: 44 });

        let pps = parser.get_pps(0).unwrap();
        assert_eq!(pps.seq_parameter_set_id, 0);
        assert!(pps.uniform_spacing_flag);
        assert_eq!(pps.scaling_list, ScalingLists::default());

        assert!(matches!(
            parser.get(ParamSetKind::Video, 0),
            Some(ParameterSet::H265Vps(_))
        ));
        assert!(parser.get(ParamSetKind::Picture, 1).is_none());

        parser.reset();
        assert!(parser.get_sps(0).is_none());
    }

    #[test]
    fn scaling_lists_default_when_not_sent() {
        let sps_params = SpsParams {
            scaling_list_enabled_flag: true,
            ..Default::default()
        };
        let data = StreamSynthesizer::new(sps_params, PpsParams::default())
            .parameter_sets()
            .build();

        let mut parser = Parser::default();
        parse_stream(&mut parser, &data);

        let pps = parser.get_pps(0).unwrap();
        assert_eq!(pps.scaling_list.scaling_list_4x4[0], [16; 16]);
        assert_eq!(pps.scaling_list.scaling_list_8x8[0], DEFAULT_SCALING_LIST_1);
        assert_eq!(pps.scaling_list.scaling_list_32x32[3], DEFAULT_SCALING_LIST_2);
        assert_eq!(pps.scaling_list.scaling_list_dc_coef_minus8_16x16[0], 8);
    }

    #[test]
    fn pps_waits_for_its_sps() {
        let sps = StreamSynthesizer::sps(&SpsParams::default());
        let pps = StreamSynthesizer::pps(&PpsParams::default());

        fn unit(data: &[u8]) -> Nalu<'_> {
            Nalu {
                header: NaluHeader::parse(data).unwrap(),
                offset: 0,
                size: data.len(),
                data,
            }
        }

        let mut parser = Parser::default();
        assert_eq!(parser.ingest(&unit(&pps)).unwrap(), IngestStatus::Unchanged);
        assert!(parser.get_pps(0).is_none());

        assert_eq!(parser.ingest(&unit(&sps)).unwrap(), IngestStatus::Changed);
        assert!(parser.get_pps(0).is_some());

        // Same bytes again.
        assert_eq!(parser.ingest(&unit(&sps)).unwrap(), IngestStatus::Unchanged);
        assert_eq!(parser.ingest(&unit(&pps)).unwrap(), IngestStatus::Unchanged);
    }

    #[test]
    fn corrupt_sps_keeps_previous_value() {
        let sps = StreamSynthesizer::sps(&SpsParams::default());
        let unit = Nalu {
            header: NaluHeader::parse(&sps).unwrap(),
            offset: 0,
            size: sps.len(),
            data: &sps,
        };

        let mut parser = Parser::default();
        parser.ingest(&unit).unwrap();

        let truncated = &sps[..8];
        let unit = Nalu {
            header: NaluHeader::parse(truncated).unwrap(),
            offset: 0,
            size: truncated.len(),
            data: truncated,
        };
        assert!(parser.ingest(&unit).is_err());
        assert_eq!(parser.get_sps(0).unwrap().width(), 64);
    }

    #[test]
    fn inter_predicted_short_term_ref_pic_set() {
        let sps_params = SpsParams {
            short_term_ref_pic_sets: vec![
                RpsParams::explicit(&[-1, -2], &[]),
                RpsParams::Predicted {
                    delta_idx_minus1: 0,
                    delta_rps: -1,
                    flags: vec![(true, true), (true, true), (true, true)],
                },
                RpsParams::Explicit {
                    negative: vec![(-2, true)],
                    positive: vec![(1, false), (3, true)],
                },
                // Drops the positive entries of the previous set and reuses its negative one
                // shifted by 2.
                RpsParams::Predicted {
                    delta_idx_minus1: 0,
                    delta_rps: 2,
                    flags: vec![(false, true), (false, false), (false, false), (true, true)],
                },
            ],
            ..Default::default()
        };
        let data = StreamSynthesizer::new(sps_params, PpsParams::default())
            .parameter_sets()
            .build();

        let mut parser = Parser::default();
        parse_stream(&mut parser, &data);
        let sps = parser.get_sps(0).unwrap();

        let st = &sps.short_term_ref_pic_set[1];
        assert!(st.inter_ref_pic_set_prediction_flag);
        assert_eq!(st.num_negative_pics, 3);
        assert_eq!(st.num_positive_pics, 0);
        assert_eq!(&st.delta_poc_s0[..3], &[-1, -2, -3]);
        assert_eq!(st.num_delta_pocs, 3);

        let st = &sps.short_term_ref_pic_set[2];
        assert_eq!(&st.delta_poc_s0[..1], &[-2]);
        assert_eq!(&st.delta_poc_s1[..2], &[1, 3]);
        assert_eq!(st.num_used_by_curr_pic(), 2);

        // dPoc of -2 + 2 is the current picture itself, so only the predicted entry survives.
        let st = &sps.short_term_ref_pic_set[3];
        assert_eq!(st.num_negative_pics, 0);
        assert_eq!(st.num_positive_pics, 1);
        assert_eq!(st.delta_poc_s1[0], 2);
        assert!(st.used_by_curr_pic_s1[0]);
    }

    #[test]
    fn slice_headers() {
        let sps_params = SpsParams {
            short_term_ref_pic_sets: vec![RpsParams::explicit(&[-1], &[])],
            ..Default::default()
        };
        let pps_params = PpsParams {
            output_flag_present_flag: true,
            lists_modification_present_flag: true,
            dependent_slice_segments_enabled_flag: true,
            ..Default::default()
        };

        let data = StreamSynthesizer::new(sps_params, pps_params)
            .parameter_sets()
            .slice(&SliceParams::idr())
            .slice(&SliceParams {
                rps: SliceRps::Sps(0),
                pic_order_cnt_lsb: 1,
                pic_output_flag: false,
                ..Default::default()
            })
            .slice(&SliceParams {
                num_ref_idx_active: Some((2, 2)),
                list_entry_l0: Some(vec![1, 0]),
                list_entry_l1: Some(vec![0, 1]),
                ..SliceParams::b(NaluType::TrailN, 2, &[-1, -2], &[1])
            })
            .slice(&SliceParams {
                first_slice_segment_in_pic_flag: false,
                dependent_slice_segment_flag: true,
                segment_address: 4,
                ..Default::default()
            })
            .build();

        let mut parser = Parser::default();
        let headers = parse_stream(&mut parser, &data);
        assert_eq!(headers.len(), 4);

        assert!(headers[0].type_.is_i());
        assert!(headers[0].pic_output_flag);
        assert_eq!(headers[0].num_pic_total_curr, 0);

        assert!(headers[1].type_.is_p());
        assert!(!headers[1].pic_output_flag);
        assert!(headers[1].short_term_ref_pic_set_sps_flag);
        assert_eq!(headers[1].curr_rps_idx, 0);
        assert_eq!(headers[1].st_rps_bits, 0);
        assert_eq!(headers[1].num_pic_total_curr, 1);

        let b = &headers[2];
        assert!(b.type_.is_b());
        assert_eq!(b.pic_order_cnt_lsb, 2);
        assert_eq!(b.curr_rps_idx, 1);
        assert!(b.st_rps_bits > 0);
        assert_eq!(b.num_pic_total_curr, 3);
        assert_eq!(b.num_ref_idx_l0_active_minus1, 1);
        assert_eq!(b.ref_pic_list_modification.list_entry_l0, vec![1, 0]);
        assert_eq!(b.ref_pic_list_modification.list_entry_l1, vec![0, 1]);
        assert!(b.header_bit_size > 0);

        // The dependent segment carries the fields of the B slice.
        let dependent = &headers[3];
        assert!(dependent.dependent_slice_segment_flag);
        assert_eq!(dependent.segment_address, 4);
        assert!(dependent.type_.is_b());
        assert_eq!(dependent.pic_order_cnt_lsb, 2);
        assert_eq!(dependent.num_pic_total_curr, 3);
    }

    #[test]
    fn dependent_slice_without_independent_one() {
        let pps_params = PpsParams {
            dependent_slice_segments_enabled_flag: true,
            ..Default::default()
        };
        let mut synth = StreamSynthesizer::new(SpsParams::default(), pps_params);
        synth.push_parameter_sets();
        let parameter_sets = synth.take();
        synth.push_slice(&SliceParams {
            first_slice_segment_in_pic_flag: false,
            dependent_slice_segment_flag: true,
            segment_address: 1,
            ..Default::default()
        });
        let slice = synth.take();

        let mut parser = Parser::default();
        parse_stream(&mut parser, &parameter_sets);

        let nalu = UnitScanner::<NaluHeader>::new(&slice)
            .next()
            .unwrap()
            .unwrap();
        assert!(parser.parse_slice_header(nalu).is_err());
    }

    #[test]
    fn long_term_pictures() {
        let sps_params = SpsParams {
            long_term_ref_pics: Some(vec![(5, true), (9, false)]),
            ..Default::default()
        };

        let data = StreamSynthesizer::new(sps_params, PpsParams::default())
            .parameter_sets()
            .slice(&SliceParams {
                pic_order_cnt_lsb: 20,
                long_term: vec![
                    LongTermParams {
                        lt_idx_sps: Some(1),
                        poc_lsb_lt: 0,
                        used_by_curr_pic_lt_flag: false,
                        delta_poc_msb_cycle_lt: Some(1),
                    },
                    LongTermParams {
                        lt_idx_sps: None,
                        poc_lsb_lt: 7,
                        used_by_curr_pic_lt_flag: true,
                        delta_poc_msb_cycle_lt: Some(2),
                    },
                    LongTermParams {
                        lt_idx_sps: None,
                        poc_lsb_lt: 3,
                        used_by_curr_pic_lt_flag: true,
                        delta_poc_msb_cycle_lt: Some(3),
                    },
                ],
                ..SliceParams::trail(20, &[-1])
            })
            .build();

        let mut parser = Parser::default();
        let headers = parse_stream(&mut parser, &data);
        let hdr = &headers[0];

        assert_eq!(hdr.num_long_term_sps, 1);
        assert_eq!(hdr.num_long_term_pics, 2);
        assert_eq!(hdr.lt_idx_sps[0], 1);
        assert_eq!(&hdr.poc_lsb_lt[..3], &[9, 7, 3]);
        assert_eq!(&hdr.used_by_curr_pic_lt[..3], &[false, true, true]);
        // Accumulation restarts with the first explicitly signalled entry.
        assert_eq!(&hdr.delta_poc_msb_cycle_lt[..3], &[1, 2, 5]);
        assert_eq!(hdr.num_pic_total_curr, 3);
    }

    #[test]
    fn rejects_slice_with_unknown_pps() {
        let mut synth = StreamSynthesizer::new(SpsParams::default(), PpsParams::default());
        synth.push_slice(&SliceParams::idr());
        let data = synth.take();

        let mut parser = Parser::default();
        let nalu = UnitScanner::<NaluHeader>::new(&data)
            .next()
            .unwrap()
            .unwrap();
        assert!(parser.parse_slice_header(nalu).is_err());
    }
}
