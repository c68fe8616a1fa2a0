// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes small H.265 streams for tests. Slices carry no CTU data and the sequence uses a single
//! temporal sub-layer.

use crate::bitstream_utils::frame_units;
use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterResult;
use crate::codec::h265::parser::ceil_log2;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::SliceType;

type Writer<'a> = BitWriter<&'a mut Vec<u8>>;

/// A short-term reference picture set.
#[derive(Clone, Debug)]
pub(crate) enum RpsParams {
    /// Delta POCs and `used_by_curr_pic` flags, negative ones in decreasing order.
    Explicit {
        negative: Vec<(i32, bool)>,
        positive: Vec<(i32, bool)>,
    },
    /// Predicted from another set: `used_by_curr_pic_flag` and `use_delta_flag` for every entry
    /// of the reference set plus one.
    Predicted {
        delta_idx_minus1: u8,
        delta_rps: i32,
        flags: Vec<(bool, bool)>,
    },
}

impl RpsParams {
    /// A set where every picture is used by the current one.
    pub fn explicit(negative: &[i32], positive: &[i32]) -> Self {
        RpsParams::Explicit {
            negative: negative.iter().map(|d| (*d, true)).collect(),
            positive: positive.iter().map(|d| (*d, true)).collect(),
        }
    }

    fn num_used_by_curr_pic(&self) -> u32 {
        match self {
            RpsParams::Explicit { negative, positive } => negative
                .iter()
                .chain(positive.iter())
                .filter(|(_, used)| *used)
                .count() as u32,
            RpsParams::Predicted { flags, .. } => {
                flags.iter().filter(|(used, _)| *used).count() as u32
            }
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SpsParams {
    pub sps_id: u8,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u16,
    pub height: u16,
    /// Left, right, top and bottom offsets, in chroma samples.
    pub conformance_window: Option<(u32, u32, u32, u32)>,
    pub bit_depth_luma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_dec_pic_buffering_minus1: u8,
    pub max_num_reorder_pics: u8,
    pub max_latency_increase_plus1: u32,
    pub scaling_list_enabled_flag: bool,
    pub short_term_ref_pic_sets: Vec<RpsParams>,
    /// `lt_ref_pic_poc_lsb_sps` and `used_by_curr_pic_lt_sps_flag`, if long-term pictures are
    /// enabled.
    pub long_term_ref_pics: Option<Vec<(u16, bool)>>,
}

impl Default for SpsParams {
    fn default() -> Self {
        Self {
            sps_id: 0,
            profile_idc: 1,
            level_idc: 93,
            width: 64,
            height: 64,
            conformance_window: None,
            bit_depth_luma_minus8: 0,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            max_dec_pic_buffering_minus1: 4,
            max_num_reorder_pics: 2,
            max_latency_increase_plus1: 0,
            scaling_list_enabled_flag: false,
            short_term_ref_pic_sets: vec![],
            long_term_ref_pics: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PpsParams {
    pub pps_id: u8,
    pub sps_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub lists_modification_present_flag: bool,
}

/// The short-term set a slice uses.
#[derive(Clone, Debug)]
pub(crate) enum SliceRps {
    /// `short_term_ref_pic_set_idx`.
    Sps(u8),
    Explicit(RpsParams),
}

#[derive(Clone, Debug)]
pub(crate) struct LongTermParams {
    /// Picks the entry from the SPS instead of signalling it.
    pub lt_idx_sps: Option<u8>,
    pub poc_lsb_lt: u16,
    pub used_by_curr_pic_lt_flag: bool,
    pub delta_poc_msb_cycle_lt: Option<u32>,
}

#[derive(Clone, Debug)]
pub(crate) struct SliceParams {
    pub nalu_type: NaluType,
    pub temporal_id: u8,
    pub pps_id: u8,
    pub first_slice_segment_in_pic_flag: bool,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,
    pub no_output_of_prior_pics_flag: bool,
    pub slice_type: SliceType,
    pub pic_output_flag: bool,
    pub pic_order_cnt_lsb: u16,
    pub rps: SliceRps,
    /// SPS-selected entries must come first.
    pub long_term: Vec<LongTermParams>,
    pub num_ref_idx_active: Option<(u8, u8)>,
    pub list_entry_l0: Option<Vec<u32>>,
    pub list_entry_l1: Option<Vec<u32>>,
}

impl Default for SliceParams {
    fn default() -> Self {
        Self {
            nalu_type: NaluType::TrailR,
            temporal_id: 0,
            pps_id: 0,
            first_slice_segment_in_pic_flag: true,
            dependent_slice_segment_flag: false,
            segment_address: 0,
            no_output_of_prior_pics_flag: false,
            slice_type: SliceType::P,
            pic_output_flag: true,
            pic_order_cnt_lsb: 0,
            rps: SliceRps::Explicit(RpsParams::explicit(&[], &[])),
            long_term: vec![],
            num_ref_idx_active: None,
            list_entry_l0: None,
            list_entry_l1: None,
        }
    }
}

impl SliceParams {
    pub fn idr() -> Self {
        Self {
            nalu_type: NaluType::IdrNLp,
            slice_type: SliceType::I,
            ..Default::default()
        }
    }

    pub fn cra(pic_order_cnt_lsb: u16) -> Self {
        Self {
            nalu_type: NaluType::CraNut,
            slice_type: SliceType::I,
            pic_order_cnt_lsb,
            ..Default::default()
        }
    }

    /// A trailing P slice referencing the pictures at `negative` delta POCs.
    pub fn trail(pic_order_cnt_lsb: u16, negative: &[i32]) -> Self {
        Self {
            pic_order_cnt_lsb,
            rps: SliceRps::Explicit(RpsParams::explicit(negative, &[])),
            ..Default::default()
        }
    }

    /// A B slice referencing pictures on both sides.
    pub fn b(nalu_type: NaluType, pic_order_cnt_lsb: u16, negative: &[i32], positive: &[i32]) -> Self {
        Self {
            nalu_type,
            slice_type: SliceType::B,
            pic_order_cnt_lsb,
            rps: SliceRps::Explicit(RpsParams::explicit(negative, positive)),
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
        self.push_parameter_sets();
        self
    }

    pub fn slice(mut self, params: &SliceParams) -> Self {
        self.push_slice(params);
        self
    }

    pub fn push_end_of_sequence(&mut self) -> &mut Self {
        self.units.push(vec![(NaluType::EosNut as u8) << 1, 1]);
        self
    }

    pub fn push_end_of_bitstream(&mut self) -> &mut Self {
        self.units.push(vec![(NaluType::EobNut as u8) << 1, 1]);
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

    pub fn push_parameter_sets(&mut self) -> &mut Self {
        self.units.push(Self::vps(&self.sps));
        self.units.push(Self::sps(&self.sps));
        self.units.push(Self::pps(&self.pps));
        self
    }

    fn write_unit<F>(type_: NaluType, temporal_id: u8, body: F) -> Vec<u8>
    where
        F: FnOnce(&mut Writer) -> BitWriterResult<()>,
    {
        let mut data = Vec::new();
        {
            let mut w = BitWriter::new(&mut data, true);
            w.write_f(8, (type_ as u8) << 1).unwrap();
            w.write_f(8, temporal_id + 1).unwrap();
            body(&mut w).unwrap();
            w.write_trailing_bits().unwrap();
            w.flush().unwrap();
        }

        data
    }

    fn write_profile_tier_level(w: &mut Writer, sps: &SpsParams) -> BitWriterResult<()> {
        // general_profile_space and general_tier_flag
        w.write_f(3, 0u32)?;
        w.write_f(5, sps.profile_idc)?;
        // general_profile_compatibility_flag
        w.write_f(usize::from(sps.profile_idc) + 1, 1u32)?;
        w.write_f(31 - usize::from(sps.profile_idc), 0u32)?;
        // progressive, interlaced, non-packed and frame-only flags
        w.write_f(4, 0b1001u32)?;
        w.write_f(22, 0u32)?;
        w.write_f(22, 0u32)?;
        w.write_f(8, sps.level_idc)?;

        Ok(())
    }

    fn write_sub_layer_ordering_info(w: &mut Writer, sps: &SpsParams) -> BitWriterResult<()> {
        // sub_layer_ordering_info_present_flag
        w.write_bit(true)?;
        w.write_ue(sps.max_dec_pic_buffering_minus1)?;
        w.write_ue(sps.max_num_reorder_pics)?;
        w.write_ue(sps.max_latency_increase_plus1)
    }

    pub fn vps(sps: &SpsParams) -> Vec<u8> {
        Self::write_unit(NaluType::VpsNut, 0, |w| {
            // vps_video_parameter_set_id
            w.write_f(4, 0u32)?;
            // base layer internal and available
            w.write_f(2, 0b11u32)?;
            // vps_max_layers_minus1 and vps_max_sub_layers_minus1
            w.write_f(6, 0u32)?;
            w.write_f(3, 0u32)?;
            w.write_bit(true)?;
            w.write_f(16, 0xffffu32)?;
            Self::write_profile_tier_level(w, sps)?;
            Self::write_sub_layer_ordering_info(w, sps)?;
            // vps_max_layer_id and vps_num_layer_sets_minus1
            w.write_f(6, 0u32)?;
            w.write_ue(0u32)?;
            // vps_timing_info_present_flag and vps_extension_flag
            w.write_bit(false)?;
            w.write_bit(false)
        })
    }

    fn write_st_ref_pic_set(
        w: &mut Writer,
        rps: &RpsParams,
        idx: usize,
        num_sets: usize,
    ) -> BitWriterResult<()> {
        if idx != 0 {
            w.write_bit(matches!(rps, RpsParams::Predicted { .. }))?;
        }

        match rps {
            RpsParams::Explicit { negative, positive } => {
                w.write_ue(negative.len() as u32)?;
                w.write_ue(positive.len() as u32)?;

                let mut prev = 0;
                for (delta_poc, used) in negative {
                    w.write_ue((prev - delta_poc - 1) as u32)?;
                    w.write_bit(*used)?;
                    prev = *delta_poc;
                }

                let mut prev = 0;
                for (delta_poc, used) in positive {
                    w.write_ue((delta_poc - prev - 1) as u32)?;
                    w.write_bit(*used)?;
                    prev = *delta_poc;
                }
            }
            RpsParams::Predicted {
                delta_idx_minus1,
                delta_rps,
                flags,
            } => {
                if idx == num_sets {
                    w.write_ue(*delta_idx_minus1)?;
                }

                w.write_bit(*delta_rps < 0)?;
                w.write_ue(delta_rps.unsigned_abs() - 1)?;

                for (used_by_curr_pic_flag, use_delta_flag) in flags {
                    w.write_bit(*used_by_curr_pic_flag)?;
                    if !used_by_curr_pic_flag {
                        w.write_bit(*use_delta_flag)?;
                    }
                }
            }
        }

        Ok(())
    }

    pub fn sps(sps: &SpsParams) -> Vec<u8> {
        Self::write_unit(NaluType::SpsNut, 0, |w| {
            // sps_video_parameter_set_id and sps_max_sub_layers_minus1
            w.write_f(4, 0u32)?;
            w.write_f(3, 0u32)?;
            // sps_temporal_id_nesting_flag
            w.write_bit(true)?;
            Self::write_profile_tier_level(w, sps)?;

            w.write_ue(sps.sps_id)?;
            // chroma_format_idc
            w.write_ue(1u32)?;
            w.write_ue(sps.width)?;
            w.write_ue(sps.height)?;

            w.write_bit(sps.conformance_window.is_some())?;
            if let Some((left, right, top, bottom)) = sps.conformance_window {
                w.write_ue(left)?;
                w.write_ue(right)?;
                w.write_ue(top)?;
                w.write_ue(bottom)?;
            }

            w.write_ue(sps.bit_depth_luma_minus8)?;
            w.write_ue(sps.bit_depth_luma_minus8)?;
            w.write_ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;
            Self::write_sub_layer_ordering_info(w, sps)?;

            // 8x8 to 16x16 coding blocks, 4x4 to 16x16 transform blocks.
            w.write_ue(0u32)?;
            w.write_ue(1u32)?;
            w.write_ue(0u32)?;
            w.write_ue(2u32)?;
            // max_transform_hierarchy_depth_inter and _intra
            w.write_ue(0u32)?;
            w.write_ue(0u32)?;

            w.write_bit(sps.scaling_list_enabled_flag)?;
            if sps.scaling_list_enabled_flag {
                // sps_scaling_list_data_present_flag
                w.write_bit(false)?;
            }

            // amp, SAO and PCM
            w.write_f(3, 0u32)?;

            let num_sets = sps.short_term_ref_pic_sets.len();
            w.write_ue(num_sets as u32)?;
            for (idx, rps) in sps.short_term_ref_pic_sets.iter().enumerate() {
                Self::write_st_ref_pic_set(w, rps, idx, num_sets)?;
            }

            w.write_bit(sps.long_term_ref_pics.is_some())?;
            if let Some(long_term) = &sps.long_term_ref_pics {
                w.write_ue(long_term.len() as u32)?;
                for (poc_lsb, used) in long_term {
                    w.write_f(
                        usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                        *poc_lsb,
                    )?;
                    w.write_bit(*used)?;
                }
            }

            // temporal MVP, strong intra smoothing, VUI and extensions
            w.write_f(4, 0u32)?;
            Ok(())
        })
    }

    pub fn pps(pps: &PpsParams) -> Vec<u8> {
        Self::write_unit(NaluType::PpsNut, 0, |w| {
            w.write_ue(pps.pps_id)?;
            w.write_ue(pps.sps_id)?;
            w.write_bit(pps.dependent_slice_segments_enabled_flag)?;
            w.write_bit(pps.output_flag_present_flag)?;
            // num_extra_slice_header_bits, sign data hiding and cabac_init_present_flag
            w.write_f(5, 0u32)?;
            w.write_ue(pps.num_ref_idx_l0_default_active_minus1)?;
            w.write_ue(pps.num_ref_idx_l1_default_active_minus1)?;
            // init_qp_minus26
            w.write_se(0)?;
            // constrained intra, transform skip and cu_qp_delta_enabled_flag
            w.write_f(3, 0u32)?;
            // pps_cb_qp_offset and pps_cr_qp_offset
            w.write_se(0)?;
            w.write_se(0)?;
            // Chroma QP offsets, weighted prediction, transquant bypass, tiles, entropy sync,
            // loop filter across slices, deblocking control and scaling lists.
            w.write_f(9, 0u32)?;
            w.write_bit(pps.lists_modification_present_flag)?;
            // log2_parallel_merge_level_minus2
            w.write_ue(0u32)?;
            // slice header extension and pps_extension_present_flag
            w.write_f(2, 0u32)?;
            Ok(())
        })
    }

    fn num_pic_total_curr(slice: &SliceParams, sps: &SpsParams) -> u32 {
        let short_term = match &slice.rps {
            SliceRps::Sps(idx) => sps
                .short_term_ref_pic_sets
                .get(usize::from(*idx))
                .map_or(0, |rps| rps.num_used_by_curr_pic()),
            SliceRps::Explicit(rps) => rps.num_used_by_curr_pic(),
        };

        let long_term = slice
            .long_term
            .iter()
            .filter(|lt| match lt.lt_idx_sps {
                Some(idx) => sps
                    .long_term_ref_pics
                    .as_ref()
                    .and_then(|pics| pics.get(usize::from(idx)))
                    .is_some_and(|(_, used)| *used),
                None => lt.used_by_curr_pic_lt_flag,
            })
            .count() as u32;

        short_term + long_term
    }

    pub fn slice_unit(slice: &SliceParams, sps: &SpsParams, pps: &PpsParams) -> Vec<u8> {
        Self::write_unit(slice.nalu_type, slice.temporal_id, |w| {
            let is_irap = slice.nalu_type.is_irap();
            let is_b = slice.slice_type.is_b();

            w.write_bit(slice.first_slice_segment_in_pic_flag)?;
            if is_irap {
                w.write_bit(slice.no_output_of_prior_pics_flag)?;
            }
            w.write_ue(slice.pps_id)?;

            if !slice.first_slice_segment_in_pic_flag {
                if pps.dependent_slice_segments_enabled_flag {
                    w.write_bit(slice.dependent_slice_segment_flag)?;
                }

                // 16x16 CTBs
                let ctbs = u32::from(sps.width).div_ceil(16) * u32::from(sps.height).div_ceil(16);
                w.write_f(ceil_log2(ctbs), slice.segment_address)?;
            }

            if !slice.dependent_slice_segment_flag {
                w.write_ue(slice.slice_type as u32)?;
                if pps.output_flag_present_flag {
                    w.write_bit(slice.pic_output_flag)?;
                }

                if !slice.nalu_type.is_idr() {
                    w.write_f(
                        usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                        slice.pic_order_cnt_lsb,
                    )?;

                    match &slice.rps {
                        SliceRps::Sps(idx) => {
                            w.write_bit(true)?;
                            let num_sets = sps.short_term_ref_pic_sets.len() as u32;
                            if num_sets > 1 {
                                w.write_f(ceil_log2(num_sets), *idx)?;
                            }
                        }
                        SliceRps::Explicit(rps) => {
                            w.write_bit(false)?;
                            let num_sets = sps.short_term_ref_pic_sets.len();
                            Self::write_st_ref_pic_set(w, rps, num_sets, num_sets)?;
                        }
                    }

                    if let Some(sps_long_term) = &sps.long_term_ref_pics {
                        Self::write_long_term(w, slice, sps, sps_long_term.len() as u32)?;
                    }
                }

                if !slice.slice_type.is_i() {
                    w.write_bit(slice.num_ref_idx_active.is_some())?;
                    if let Some((l0, l1)) = slice.num_ref_idx_active {
                        w.write_ue(l0 - 1)?;
                        if is_b {
                            w.write_ue(l1 - 1)?;
                        }
                    }

                    let num_pic_total_curr = Self::num_pic_total_curr(slice, sps);
                    if pps.lists_modification_present_flag && num_pic_total_curr > 1 {
                        let num_bits = ceil_log2(num_pic_total_curr);
                        Self::write_list_entries(w, &slice.list_entry_l0, num_bits)?;
                        if is_b {
                            Self::write_list_entries(w, &slice.list_entry_l1, num_bits)?;
                        }
                    }

                    if is_b {
                        // mvd_l1_zero_flag
                        w.write_bit(false)?;
                    }

                    // five_minus_max_num_merge_cand
                    w.write_ue(0u32)?;
                }

                // slice_qp_delta
                w.write_se(0)?;
            }

            // byte_alignment( )
            w.write_trailing_bits()
        })
    }

    fn write_long_term(
        w: &mut Writer,
        slice: &SliceParams,
        sps: &SpsParams,
        num_long_term_ref_pics_sps: u32,
    ) -> BitWriterResult<()> {
        let num_long_term_sps = slice
            .long_term
            .iter()
            .filter(|lt| lt.lt_idx_sps.is_some())
            .count() as u32;

        if num_long_term_ref_pics_sps > 0 {
            w.write_ue(num_long_term_sps)?;
        }
        w.write_ue(slice.long_term.len() as u32 - num_long_term_sps)?;

        for lt in &slice.long_term {
            match lt.lt_idx_sps {
                Some(idx) => {
                    if num_long_term_ref_pics_sps > 1 {
                        w.write_f(ceil_log2(num_long_term_ref_pics_sps), idx)?;
                    }
                }
                None => {
                    w.write_f(
                        usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                        lt.poc_lsb_lt,
                    )?;
                    w.write_bit(lt.used_by_curr_pic_lt_flag)?;
                }
            }

            w.write_bit(lt.delta_poc_msb_cycle_lt.is_some())?;
            if let Some(cycle) = lt.delta_poc_msb_cycle_lt {
                w.write_ue(cycle)?;
            }
        }

        Ok(())
    }

    fn write_list_entries(
        w: &mut Writer,
        entries: &Option<Vec<u32>>,
        num_bits: usize,
    ) -> BitWriterResult<()> {
        w.write_bit(entries.is_some())?;
        if let Some(entries) = entries {
            for entry in entries {
                w.write_f(num_bits, *entry)?;
            }
        }

        Ok(())
    }
}
