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

pub(crate) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(crate) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(crate) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(crate) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_PPS_COUNT: u32 = 256;
const MAX_SPS_COUNT: u32 = 32;

/// Upper bound on the number of frames in the DPB, A.3.1 item h).
pub const DPB_MAX_SIZE: usize = 16;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl UnitHeader for NaluHeader {
    const LEN: usize = 1;

    fn parse(data: &[u8]) -> Option<Self> {
        let byte = *data.first()?;

        // forbidden_zero_bit
        if byte & 0x80 != 0 {
            return None;
        }

        let type_ = NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown);

        Some(NaluHeader {
            ref_idc: (byte & 0x60) >> 5,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }
}

impl NaluHeader {
    /// Whether this unit carries a slice of the primary coded picture.
    pub fn is_slice(&self) -> bool {
        matches!(self.type_, NaluType::Slice | NaluType::SliceIdr)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i8; 32],
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i8; 2]; 32],

    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i8; 32],
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i8; 2]; 32],
}

/// `MaxLongTermFrameIdx`, which is either an index or the special "no long-term frame indices"
/// value coded as zero in `max_long_term_frame_idx_plus1`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

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

/// One memory management control operation, 7.3.3.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    pub memory_management_control_operation: u8,
    /// Operations 1 and 3.
    pub difference_of_pic_nums_minus1: u32,
    /// Operation 2.
    pub long_term_pic_num: u32,
    /// Operations 3 and 6.
    pub long_term_frame_idx: u32,
    /// Operation 4.
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// IDR only: drop the pictures still waiting for output when this IDR arrives.
    pub no_output_of_prior_pics_flag: bool,
    /// IDR only: mark the IDR as long-term with `LongTermFrameIdx` 0.
    pub long_term_reference_flag: bool,
    /// Non-IDR only: use the operations in `inner` instead of the sliding window.
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Table 7-6.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
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

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    /// Coded on `log2_max_frame_num_minus4 + 4` bits.
    pub frame_num: u16,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    /// Bits used by the picture order count fields. Some hardware wants it.
    pub pic_order_cnt_bit_size: usize,
    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub pred_weight_table: PredWeightTable,
    pub dec_ref_pic_marking: RefPicMarking,
    pub dec_ref_pic_marking_bit_size: usize,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    /// `MaxPicNum`. Equal to `MaxFrameNum` since only frames are decoded.
    pub max_pic_num: u32,
    /// Size of slice_header() in bits, NAL header byte included.
    pub header_bit_size: usize,
    pub n_emulation_prevention_bytes: usize,
}

/// A slice header together with the unit it was read from.
#[derive(Debug)]
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
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

impl Level {
    /// `MaxDpbMbs` from Table A-1.
    fn max_dpb_mbs(self) -> u32 {
        match self {
            Level::L1 | Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        }
    }
}

/// The six 4x4 and six 8x8 scaling lists of a parameter set, in zig-zag order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub lists_4x4: [[u8; 16]; 6],
    pub lists_8x8: [[u8; 64]; 6],
}

impl Default for ScalingLists {
    /// Flat_4x4_16 and Flat_8x8_16.
    fn default() -> Self {
        Self {
            lists_4x4: [[16; 16]; 6],
            lists_8x8: [[16; 64]; 6],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
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

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
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
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,
    pub pic_struct_present_flag: bool,
    /// When set, the reorder and buffering limits below are present.
    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// A H.264 Sequence Parameter Set, 7.3.2.1.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub level_idc: Level,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,
    /// Also the size of the sliding window, 8.2.5.3.
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    /// `ExpectedDeltaPerPicOrderCntCycle`, 7-12.
    pub expected_delta_per_pic_order_cnt_cycle: i32,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Coded width in luma samples, 7-13 and 7-14.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Coded height in luma samples, 7-15 to 7-17.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }

    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    pub fn bit_depth_luma(&self) -> u8 {
        self.bit_depth_luma_minus8 + 8
    }

    pub fn bit_depth_chroma(&self) -> u8 {
        self.bit_depth_chroma_minus8 + 8
    }

    /// `SubWidthC` and `SubHeightC`, Table 6-1.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            _ => (1, 1),
        }
    }

    /// `CropUnitX` and `CropUnitY`, 7-19 to 7-22.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        let frame_mult = 2 - u32::from(self.frame_mbs_only_flag);
        match self.chroma_array_type() {
            0 => (1, frame_mult),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (sub_width_c, sub_height_c * frame_mult)
            }
        }
    }

    /// `MaxFrameNum`, 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// `MaxPicOrderCntLsb`, 7-11.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// The part of the coded frame that is meant to be displayed.
    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect::from(self.resolution());
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        Rect {
            min: Point {
                x: crop_unit_x * self.frame_crop_left_offset,
                y: crop_unit_y * self.frame_crop_top_offset,
            },
            max: Point {
                x: self.width() - crop_unit_x * self.frame_crop_right_offset,
                y: self.height() - crop_unit_y * self.frame_crop_bottom_offset,
            },
        }
    }

    /// Number of frames the DPB must be able to hold for this sequence.
    pub fn max_dpb_frames(&self) -> usize {
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: level_idc 11 with constraint_set3_flag means level 1b for the
        // Baseline and Main profiles.
        if matches!(level, Level::L1_1)
            && (self.profile_idc == Profile::Baseline as u8
                || self.profile_idc == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        }

        let frame_size_in_mbs = (self.width() / 16) * (self.height() / 16);
        let max_dpb_frames = std::cmp::min(
            level.max_dpb_mbs() / frame_size_in_mbs.max(1),
            DPB_MAX_SIZE as u32,
        ) as usize;

        let max_dpb_frames = std::cmp::max(max_dpb_frames, usize::from(self.max_num_ref_frames));

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            std::cmp::max(1, self.vui_parameters.max_dec_frame_buffering as usize)
        } else {
            max_dpb_frames
        }
    }

    /// Number of frames that may precede any frame in decoding order and follow it in output
    /// order.
    pub fn max_num_order_frames(&self) -> u32 {
        let vui = &self.vui_parameters;

        if self.vui_parameters_present_flag && vui.bitstream_restriction_flag {
            return vui.max_num_reorder_frames;
        }

        // Intra-only profiles.
        let intra_profile = matches!(self.profile_idc, 44 | 86 | 100 | 110 | 122 | 244);
        if intra_profile && self.constraint_set3_flag {
            0
        } else {
            self.max_dpb_frames() as u32
        }
    }
}

/// A H.264 Picture Parameter Set, 7.3.2.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub second_chroma_qp_index_offset: i8,
    /// The lists in effect for pictures using this PPS, inherited from the SPS when the PPS
    /// carries no matrix.
    pub scaling_lists: ScalingLists,
}

/// A PPS whose SPS has not been seen yet.
#[derive(Debug)]
struct PendingPps {
    seq_parameter_set_id: u8,
    data: Vec<u8>,
}

/// H.264 syntax parser. Also the parameter set store of H.264 sessions.
#[derive(Debug, Default)]
pub struct Parser {
    spses: ParamSetMap<Sps>,
    ppses: ParamSetMap<Pps>,
    pending_ppses: BTreeMap<u8, PendingPps>,
}

impl Parser {
    fn default_scaling_list_4x4(i: usize) -> [u8; 16] {
        // Table 7-2.
        if i < 3 {
            DEFAULT_4X4_INTRA
        } else {
            DEFAULT_4X4_INTER
        }
    }

    fn default_scaling_list_8x8(i: usize) -> [u8; 64] {
        if i % 2 == 0 {
            DEFAULT_8X8_INTRA
        } else {
            DEFAULT_8X8_INTER
        }
    }

    /// Applies fall-back rule A or B of Table 7-2 to the 4x4 list `i`.
    fn fallback_scaling_list_4x4(
        lists: &[[u8; 16]; 6],
        i: usize,
        intra: &[u8; 16],
        inter: &[u8; 16],
    ) -> [u8; 16] {
        match i {
            0 => *intra,
            3 => *inter,
            _ => lists[i - 1],
        }
    }

    fn fallback_scaling_list_8x8(
        lists: &[[u8; 64]; 6],
        i: usize,
        intra: &[u8; 64],
        inter: &[u8; 64],
    ) -> [u8; 64] {
        match i {
            0 => *intra,
            1 => *inter,
            _ => lists[i - 2],
        }
    }

    /// Reads scaling_list(), 7.3.2.1.1.1. Returns whether the default list must be used instead.
    fn parse_scaling_list(r: &mut BitReader, scaling_list: &mut [u8]) -> anyhow::Result<bool> {
        let mut last_scale = 8u8;
        let mut next_scale = 8u8;

        for j in 0..scaling_list.len() {
            if next_scale != 0 {
                let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
                next_scale = ((i32::from(last_scale) + delta_scale + 256) % 256) as u8;
                if j == 0 && next_scale == 0 {
                    return Ok(true);
                }
            }

            scaling_list[j] = if next_scale == 0 {
                last_scale
            } else {
                next_scale
            };
            last_scale = scaling_list[j];
        }

        Ok(false)
    }

    /// Reads the scaling matrix of a SPS or PPS. `fallback` provides the lists used by rule B,
    /// `None` selects rule A.
    fn parse_scaling_matrix(
        r: &mut BitReader,
        lists: &mut ScalingLists,
        num_8x8: usize,
        fallback: Option<&ScalingLists>,
    ) -> anyhow::Result<()> {
        let (intra_4x4, inter_4x4) = match fallback {
            Some(sps) => (sps.lists_4x4[0], sps.lists_4x4[3]),
            None => (DEFAULT_4X4_INTRA, DEFAULT_4X4_INTER),
        };

        for i in 0..6 {
            let present = r.read_bit()?;
            if present {
                if Parser::parse_scaling_list(r, &mut lists.lists_4x4[i])? {
                    lists.lists_4x4[i] = Parser::default_scaling_list_4x4(i);
                }
            } else {
                lists.lists_4x4[i] =
                    Parser::fallback_scaling_list_4x4(&lists.lists_4x4, i, &intra_4x4, &inter_4x4);
            }
        }

        let (intra_8x8, inter_8x8) = match fallback {
            Some(sps) => (sps.lists_8x8[0], sps.lists_8x8[1]),
            None => (DEFAULT_8X8_INTRA, DEFAULT_8X8_INTER),
        };

        for i in 0..num_8x8 {
            let present = r.read_bit()?;
            if present {
                if Parser::parse_scaling_list(r, &mut lists.lists_8x8[i])? {
                    lists.lists_8x8[i] = Parser::default_scaling_list_8x8(i);
                }
            } else {
                lists.lists_8x8[i] =
                    Parser::fallback_scaling_list_8x8(&lists.lists_8x8, i, &intra_8x8, &inter_8x8);
            }
        }

        Ok(())
    }

    fn parse_hrd(r: &mut BitReader, hrd: &mut HrdParams) -> anyhow::Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[idx] = r.read_ue()?;
            hrd.cbr_flag[idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    /// Reads a 32-bit value in two steps, since the reader returns at most 31 bits at once.
    fn read_u32(r: &mut BitReader) -> anyhow::Result<u32> {
        let high = r.read_bits::<u32>(31)?;
        Ok((high << 1) | u32::from(r.read_bit()?))
    }

    fn parse_vui(r: &mut BitReader, vui: &mut VuiParams) -> anyhow::Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            // Extended_SAR
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
            vui.num_units_in_tick = Parser::read_u32(r)?;
            if vui.num_units_in_tick == 0 {
                return Err(anyhow!("num_units_in_tick cannot be zero"));
            }

            vui.time_scale = Parser::read_u32(r)?;
            if vui.time_scale == 0 {
                return Err(anyhow!("time_scale cannot be zero"));
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
            vui.max_num_reorder_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
            vui.max_dec_frame_buffering = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        }

        Ok(())
    }

    /// Parses a SPS without storing it.
    pub fn parse_sps(nalu: &Nalu) -> anyhow::Result<Sps> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(anyhow!("expected a SPS, got {:?}", nalu.header.type_));
        }

        let mut r = BitReader::new(nalu.payload());
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

        // reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).with_context(|| format!("unsupported level {}", level))?;
        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT - 1)?;

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
                let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
                Parser::parse_scaling_matrix(&mut r, &mut sps.scaling_lists, num_8x8, None)
                    .context("while parsing the SPS scaling matrix")?;
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;
        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        match sps.pic_order_cnt_type {
            0 => {
                sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
            }
            1 => {
                sps.delta_pic_order_always_zero_flag = r.read_bit()?;
                sps.offset_for_non_ref_pic = r.read_se()?;
                sps.offset_for_top_to_bottom_field = r.read_se()?;
                sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;

                for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                    sps.offset_for_ref_frame.push(r.read_se()?);
                }

                // (7-12)
                sps.expected_delta_per_pic_order_cnt_cycle =
                    sps.offset_for_ref_frame.iter().sum();
            }
            _ => (),
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
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

            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .ok_or(anyhow!("invalid frame crop width"))?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .ok_or(anyhow!("invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps.vui_parameters)
                .context("while parsing the VUI parameters")?;
        }

        Ok(sps)
    }

    /// Parses the RBSP of a PPS against `sps`.
    fn parse_pps_payload(payload: &[u8], sps: &Sps) -> anyhow::Result<Pps> {
        let mut r = BitReader::new(payload);
        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_max(MAX_PPS_COUNT - 1)?,
            seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT - 1)?,
            ..Default::default()
        };

        pps.entropy_coding_mode_flag = r.read_bit()?;
        pps.bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;
        pps.num_slice_groups_minus1 = r.read_ue_max(7)?;

        if pps.num_slice_groups_minus1 > 0 {
            return Err(anyhow!("slice groups are not supported"));
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = 6 * i32::from(sps.bit_depth_luma_minus8);
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;
        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        pps.scaling_lists = sps.scaling_lists.clone();

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                let num_8x8 = match (pps.transform_8x8_mode_flag, sps.chroma_format_idc) {
                    (false, _) => 0,
                    (true, 3) => 6,
                    (true, _) => 2,
                };
                let fallback = sps
                    .seq_scaling_matrix_present_flag
                    .then_some(&sps.scaling_lists);

                let mut lists = ScalingLists::default();
                Parser::parse_scaling_matrix(&mut r, &mut lists, num_8x8, fallback)
                    .context("while parsing the PPS scaling matrix")?;
                pps.scaling_lists = lists;
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        Ok(pps)
    }

    fn parse_ref_pic_list_modification(
        r: &mut BitReader,
        ref_list_mods: &mut Vec<RefPicListModification>,
    ) -> anyhow::Result<()> {
        loop {
            let mut modification = RefPicListModification {
                modification_of_pic_nums_idc: r.read_ue_max(3)?,
                ..Default::default()
            };

            match modification.modification_of_pic_nums_idc {
                0 | 1 => modification.abs_diff_pic_num_minus1 = r.read_ue()?,
                2 => modification.long_term_pic_num = r.read_ue()?,
                _ => break,
            }

            if ref_list_mods.len() > 32 {
                return Err(anyhow!("too many reference list modifications"));
            }

            ref_list_mods.push(modification);
        }

        Ok(())
    }

    fn parse_pred_weight_table(
        r: &mut BitReader,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let pt = &mut header.pred_weight_table;
        let num_l0 = usize::from(header.num_ref_idx_l0_active_minus1) + 1;
        let num_l1 = if header.slice_type.is_b() {
            usize::from(header.num_ref_idx_l1_active_minus1) + 1
        } else {
            0
        };
        let has_chroma = sps.chroma_array_type() != 0;

        pt.luma_log2_weight_denom = r.read_ue_max(7)?;
        if has_chroma {
            pt.chroma_log2_weight_denom = r.read_ue_max(7)?;
        }

        // Absent weights are inferred to 2^denom.
        let luma_weight = 1 << pt.luma_log2_weight_denom;
        let chroma_weight = 1 << pt.chroma_log2_weight_denom;

        for i in 0..num_l0 {
            pt.luma_weight_l0[i] = luma_weight;
            if r.read_bit()? {
                pt.luma_weight_l0[i] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l0[i] = r.read_se_bounded(-128, 127)?;
            }

            if has_chroma {
                pt.chroma_weight_l0[i] = [chroma_weight; 2];
                if r.read_bit()? {
                    for j in 0..2 {
                        pt.chroma_weight_l0[i][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l0[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        for i in 0..num_l1 {
            pt.luma_weight_l1[i] = luma_weight;
            if r.read_bit()? {
                pt.luma_weight_l1[i] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l1[i] = r.read_se_bounded(-128, 127)?;
            }

            if has_chroma {
                pt.chroma_weight_l1[i] = [chroma_weight; 2];
                if r.read_bit()? {
                    for j in 0..2 {
                        pt.chroma_weight_l1[i][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l1[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking(
        r: &mut BitReader,
        idr_pic_flag: bool,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let rpm = &mut header.dec_ref_pic_marking;
        let num_bits_left = r.num_bits_left();

        if idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
        } else {
            rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;

            if rpm.adaptive_ref_pic_marking_mode_flag {
                loop {
                    let mut marking = RefPicMarkingInner {
                        memory_management_control_operation: r.read_ue_max(6)?,
                        ..Default::default()
                    };

                    let op = marking.memory_management_control_operation;
                    if op == 0 {
                        break;
                    }

                    if op == 1 || op == 3 {
                        marking.difference_of_pic_nums_minus1 = r.read_ue()?;
                    }

                    if op == 2 {
                        marking.long_term_pic_num = r.read_ue()?;
                    }

                    if op == 3 || op == 6 {
                        marking.long_term_frame_idx = r.read_ue()?;
                    }

                    if op == 4 {
                        marking.max_long_term_frame_idx =
                            MaxLongTermFrameIdx::from_value_plus1(r.read_ue()?);
                    }

                    rpm.inner.push(marking);
                }
            }
        }

        header.dec_ref_pic_marking_bit_size = num_bits_left - r.num_bits_left();
        Ok(())
    }

    /// Parses the header of a slice using the stored parameter sets.
    pub fn parse_slice_header<'a>(&self, nalu: Nalu<'a>) -> anyhow::Result<Slice<'a>> {
        if !nalu.header.is_slice() {
            return Err(anyhow!(
                "{:?} is not a supported slice unit",
                nalu.header.type_
            ));
        }

        let mut r = BitReader::new(nalu.payload());

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT - 1)?;

        let pps = self
            .get_pps(header.pic_parameter_set_id)
            .with_context(|| format!("slice references unknown PPS {}", header.pic_parameter_set_id))?;
        let sps = self
            .get_sps(pps.seq_parameter_set_id)
            .with_context(|| format!("PPS references unknown SPS {}", pps.seq_parameter_set_id))?;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag && r.read_bit()? {
            return Err(anyhow!("field pictures are not supported"));
        }

        header.max_pic_num = sps.max_frame_num();

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        let num_bits_left = r.num_bits_left();
        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag {
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

        // Frames use at most 16 entries per list.
        if header.num_ref_idx_l0_active_minus1 > 15 || header.num_ref_idx_l1_active_minus1 > 15 {
            return Err(anyhow!(
                "invalid number of active references ({}, {})",
                header.num_ref_idx_l0_active_minus1 + 1,
                header.num_ref_idx_l1_active_minus1 + 1
            ));
        }

        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    &mut r,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if header.slice_type.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    &mut r,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

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

        let epb = r.num_epb();
        header.header_bit_size = (nalu.size - epb) * 8 - r.num_bits_left();
        header.n_emulation_prevention_bytes = epb;

        Ok(Slice { header, nalu })
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.spses.get(sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.ppses.get(pps_id)
    }

    /// Stores the PPS in `data`, or holds it back until its SPS shows up.
    fn ingest_pps(&mut self, data: &[u8]) -> anyhow::Result<IngestStatus> {
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

        let pps = Parser::parse_pps_payload(payload, sps)
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
                Ok(IngestStatus::Changed) => status = IngestStatus::Changed,
                Ok(IngestStatus::Unchanged) => (),
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
            NaluType::Sps => {
                let sps = Parser::parse_sps(nalu).context("while parsing SPS")?;
                let sps_id = sps.seq_parameter_set_id;
                let status = self.spses.insert(sps_id, nalu.data, sps);

                Ok(status.or(self.resolve_pending_ppses(sps_id)))
            }
            NaluType::Pps => self.ingest_pps(nalu.data),
            other => Err(anyhow!("{:?} is not a parameter set", other)),
        }
    }

    fn get(&self, kind: ParamSetKind, id: u8) -> Option<ParameterSet<'_>> {
        match kind {
            ParamSetKind::Sequence => self.get_sps(id).map(|sps| ParameterSet::H264Sps(sps)),
            ParamSetKind::Picture => self.get_pps(id).map(|pps| ParameterSet::H264Pps(pps)),
            ParamSetKind::Video => None,
        }
    }

    fn reset(&mut self) {
        self.spses.clear();
        self.ppses.clear();
        self.pending_ppses.clear();
    }
}
