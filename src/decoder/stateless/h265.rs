// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use byteorder::LittleEndian;
use byteorder::WriteBytesExt;
use log::debug;

use crate::backend::frame_pool::FrameHandle;
use crate::backend::submission::PictureSubmission;
use crate::backend::submission::ReferenceTable;
use crate::backend::submission::SliceFraming;
use crate::backend::submission::SliceSubmission;
use crate::backend::DecodeHeapConfig;
use crate::backend::HwDecodeDevice;
use crate::backend::VideoCodec;
use crate::bitstream_utils::Unit;
use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::RefPicSet;
use crate::codec::h265::dpb::RpsPocs;
use crate::codec::h265::parser::NaluHeader;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Parser;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::ScalingLists;
use crate::codec::h265::parser::Slice;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::MAX_DPB_SIZE;
use crate::codec::h265::picture::PictureData;
use crate::decoder::stateless::HwState;
use crate::decoder::stateless::StatelessCodec;
use crate::decoder::stateless::StreamParams;
use crate::decoder::AccessUnit;
use crate::decoder::DecoderError;
use crate::PixelLayout;

/// Table index of unused reference entries.
const NO_REFERENCE: u8 = 0xff;

/// Entries of each reference list in the slice control payload.
const MAX_REF_LIST_ENTRIES: usize = 15;

// See 6.5.3
const fn up_right_diagonal<const N: usize, const ROWS: usize>() -> [usize; N] {
    // Generics can't be used in const operations for now, so [0; ROWS * ROWS]
    // is rejected by the compiler
    assert!(ROWS * ROWS == N);

    let mut i = 0;
    let mut x = 0i32;
    let mut y = 0i32;
    let mut ret = [0; N];

    loop {
        while y >= 0 {
            if x < (ROWS as i32) && y < (ROWS as i32) {
                ret[i] = (x + ROWS as i32 * y) as usize;
                i += 1;
            }
            y -= 1;
            x += 1;
        }

        y = x;
        x = 0;
        if i >= N {
            break;
        }
    }

    ret
}

const UP_RIGHT_DIAGONAL_4X4: [usize; 16] = up_right_diagonal::<16, 4>();
const UP_RIGHT_DIAGONAL_8X8: [usize; 64] = up_right_diagonal::<64, 8>();

fn raster_from_up_right_diagonal_8x8(src: &[u8; 64]) -> [u8; 64] {
    let mut dst = [0; 64];
    for (i, value) in src.iter().enumerate() {
        dst[UP_RIGHT_DIAGONAL_8X8[i]] = *value;
    }
    dst
}

fn raster_from_up_right_diagonal_4x4(src: &[u8; 16]) -> [u8; 16] {
    let mut dst = [0; 16];
    for (i, value) in src.iter().enumerate() {
        dst[UP_RIGHT_DIAGONAL_4X4[i]] = *value;
    }
    dst
}

/// A picture of the reference picture set as seen by the hardware.
#[derive(Clone, Copy, Debug)]
struct RefEntry {
    /// Position in the DPB, `None` if the picture is missing.
    dpb_index: Option<usize>,
    pic_order_cnt_val: i32,
    long_term: bool,
}

/// The reference frames of the current picture, in the order StCurrBefore, StCurrAfter, LtCurr,
/// StFoll, LtFoll.
fn ref_entries(rps: &RefPicSet, pocs: &RpsPocs) -> Vec<RefEntry> {
    let short_term = |set: &[Option<usize>], pocs: &[i32]| -> Vec<RefEntry> {
        set.iter()
            .zip(pocs)
            .map(|(dpb_index, poc)| RefEntry {
                dpb_index: *dpb_index,
                pic_order_cnt_val: *poc,
                long_term: false,
            })
            .collect()
    };
    let long_term = |set: &[Option<usize>], pocs: &[(i32, bool)]| -> Vec<RefEntry> {
        set.iter()
            .zip(pocs)
            .map(|(dpb_index, (poc, _))| RefEntry {
                dpb_index: *dpb_index,
                pic_order_cnt_val: *poc,
                long_term: true,
            })
            .collect()
    };

    let mut entries = short_term(&rps.st_curr_before, &pocs.st_curr_before);
    entries.extend(short_term(&rps.st_curr_after, &pocs.st_curr_after));
    entries.extend(long_term(&rps.lt_curr, &pocs.lt_curr));
    entries.extend(short_term(&rps.st_foll, &pocs.st_foll));
    entries.extend(long_term(&rps.lt_foll, &pocs.lt_foll));
    entries.truncate(MAX_DPB_SIZE);

    entries
}

/// Picture order state carried from one picture to the next.
#[derive(Clone, Debug)]
struct OrderState {
    /// Set for the first picture of the bitstream and the first one after an end of sequence.
    first_picture_in_cvs: bool,
    /// PrevTid0Pic.
    prev_tid0_pic: Option<PictureData>,
    /// NoRaslOutputFlag of the last IRAP picture.
    irap_no_rasl_output_flag: bool,
}

impl Default for OrderState {
    fn default() -> Self {
        Self {
            first_picture_in_cvs: true,
            prev_tid0_pic: None,
            irap_no_rasl_output_flag: false,
        }
    }
}

/// State of the H.265 decoder.
#[derive(Default)]
pub struct H265 {
    /// H.265 bitstream parser, also holding the parameter sets.
    parser: Parser,
    /// The decoded picture buffer.
    dpb: Dpb<FrameHandle>,
    order: OrderState,
}

impl H265 {
    pub fn dpb(&self) -> &Dpb<FrameHandle> {
        &self.dpb
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    fn stream_params(sps: &Sps, alignment: u32) -> anyhow::Result<StreamParams> {
        let bit_depth = sps.bit_depth_luma();
        let layout = PixelLayout::for_bit_depth(bit_depth)
            .with_context(|| format!("unsupported bit depth {}", bit_depth))?;
        let dpb_size = std::cmp::min(sps.max_dpb_size(), MAX_DPB_SIZE);

        Ok(StreamParams {
            heap: DecodeHeapConfig {
                codec: VideoCodec::H265,
                coded_resolution: sps.resolution().round_up(alignment),
                layout,
                max_references: dpb_size,
            },
            dpb_size,
            visible_rect: sps.visible_rectangle(),
            bit_depth,
        })
    }

    /// Decodes the slice segments of one picture. Frames ready for output are appended to
    /// `outputs`.
    #[allow(clippy::too_many_arguments)]
    fn decode_picture_inner<D: HwDecodeDevice>(
        &mut self,
        hw: &mut HwState<D>,
        slices: &[Slice],
        sps: &Sps,
        pps: &Pps,
        mut pic: PictureData,
        access_unit: &AccessUnit,
        outputs: &mut Vec<FrameHandle>,
    ) -> Result<(), DecoderError> {
        let first = slices.first().context("picture without slice segments")?;

        let target = hw.acquire_target()?;

        pic.pic_output_flag &= !access_unit.do_not_output;
        if pic.nalu_type.is_irap() {
            self.order.irap_no_rasl_output_flag = pic.no_rasl_output_flag;
        }
        self.order.first_picture_in_cvs = false;

        // 8.3.2
        let pocs = self.dpb.apply_rps(&pic, &first.header, sps)?;

        // C.5.2.2
        if pic.starts_cvs() {
            if pic.no_output_of_prior_pics_flag {
                self.dpb.clear();
            } else {
                outputs.extend(self.dpb.drain());
            }
        } else {
            self.dpb.remove_unused();
            outputs.extend(self.dpb.bump_as_needed());
        }

        // Positions are only stable once the DPB is done removing pictures.
        let rps = self.dpb.ref_pic_set(&pocs, sps);

        debug!("Decode picture POC {}", pic.pic_order_cnt_val);

        let entries = ref_entries(&rps, &pocs);
        let handles: Vec<Option<FrameHandle>> = entries
            .iter()
            .map(|entry| {
                entry
                    .dpb_index
                    .and_then(|idx| self.dpb.entries().get(idx))
                    .map(|dpb_entry| dpb_entry.handle)
            })
            .collect();
        let table = ReferenceTable::new(hw.pool(), &handles)?;

        let to_entry_index = |list: &[Option<usize>]| -> Vec<u8> {
            list.iter()
                .map(|dpb_index| {
                    entries
                        .iter()
                        .position(|entry| entry.dpb_index == *dpb_index)
                        .map_or(NO_REFERENCE, |pos| pos as u8)
                })
                .collect()
        };

        let mut slice_submissions = Vec::with_capacity(slices.len());
        for slice in slices {
            let lists = self
                .dpb
                .build_ref_pic_lists(&rps, &slice.header)
                .with_context(|| {
                    format!(
                        "while building the reference lists of a slice of POC {}",
                        pic.pic_order_cnt_val
                    )
                })?;

            slice_submissions.push(SliceSubmission {
                data: slice.nalu.data,
                control: slice_control(
                    slice,
                    &to_entry_index(&lists.ref_pic_list0),
                    &to_entry_index(&lists.ref_pic_list1),
                )?,
            });
        }

        let picture_params = picture_params(sps, pps, &pic, &rps, &entries, &table)?;
        let quantization_matrix = if sps.scaling_list_enabled_flag {
            Some(quantization_matrix(&pps.scaling_list))
        } else {
            None
        };

        hw.submit(
            &PictureSubmission {
                codec: Self::CODEC,
                framing: Self::SLICE_FRAMING,
                target,
                slices: &slice_submissions,
                picture_params: &picture_params,
                quantization_matrix: quantization_matrix.as_deref(),
                references: &table,
            },
            access_unit.timestamp,
        )?;

        // C.5.2.3
        if pic.valid_for_prev_tid0_pic {
            self.order.prev_tid0_pic = Some(pic.clone());
        }
        self.dpb
            .store_picture(Rc::new(RefCell::new(pic)), target)
            .context("while storing the decoded picture")?;
        outputs.extend(self.dpb.bump_after_store());

        Ok(())
    }

    fn decode_picture<D: HwDecodeDevice>(
        &mut self,
        hw: &mut HwState<D>,
        slices: &[Slice],
        access_unit: &AccessUnit,
    ) -> Result<(), DecoderError> {
        let first = slices.first().context("picture without slice segments")?;
        if !first.header.first_slice_segment_in_pic_flag {
            return Err(anyhow::anyhow!("missing the first slice segment of the picture").into());
        }

        let pps = Rc::clone(
            self.parser
                .get_pps(first.header.pic_parameter_set_id)
                .context("invalid PPS in slice header")?,
        );
        let sps = Rc::clone(
            self.parser
                .get_sps(pps.seq_parameter_set_id)
                .context("invalid SPS in slice header")?,
        );

        let pic = PictureData::new_from_slice(
            first,
            &sps,
            self.order.first_picture_in_cvs,
            self.order.prev_tid0_pic.as_ref(),
            access_unit.timestamp,
        );

        // C.5.2.2: RASL pictures of an IRAP with NoRaslOutputFlag reference pictures that were
        // never decoded.
        if pic.nalu_type.is_rasl() && self.order.irap_no_rasl_output_flag {
            debug!("Dropping RASL picture POC {}", pic.pic_order_cnt_val);
            return Ok(());
        }

        let params = Self::stream_params(&sps, hw.config().alignment)?;
        if hw.needs_reconfiguration(&params) {
            if !pic.starts_cvs() {
                log::warn!("Stream parameters changed outside of an IRAP picture");
                return Err(DecoderError::ResetRequired);
            }

            // Frames of the previous configuration are never referenced again.
            let frames = self.dpb.drain();
            hw.output_frames(frames);
            hw.reconfigure(&params)?;
        } else if !hw.has_free_frame() {
            return Err(DecoderError::NoBuffer);
        }

        let dpb = self.dpb.snapshot();
        let order = self.order.clone();
        let mut outputs = vec![];

        self.dpb.set_limits(&sps);

        match self.decode_picture_inner(hw, slices, &sps, &pps, pic, access_unit, &mut outputs) {
            Ok(()) => {
                hw.output_frames(outputs);
                Ok(())
            }
            Err(e) => {
                debug!("Rolling back picture order state: {}", e);
                self.dpb = dpb;
                self.order = order;
                Err(e)
            }
        }
    }
}

fn flags_u32(flags: &[bool]) -> u32 {
    flags
        .iter()
        .enumerate()
        .fold(0, |acc, (bit, set)| acc | (u32::from(*set) << bit))
}

/// Picture parameters payload: sequence and picture level fields, the reference frames and the
/// sizes of the reference picture set lists.
fn picture_params(
    sps: &Sps,
    pps: &Pps,
    pic: &PictureData,
    rps: &RefPicSet,
    entries: &[RefEntry],
    table: &ReferenceTable,
) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();

    out.write_u16::<LittleEndian>(sps.pic_width_in_luma_samples)?;
    out.write_u16::<LittleEndian>(sps.pic_height_in_luma_samples)?;
    out.write_u8(sps.chroma_format_idc)?;
    out.write_u8(sps.bit_depth_luma_minus8)?;
    out.write_u8(sps.bit_depth_chroma_minus8)?;
    out.write_u8(sps.log2_max_pic_order_cnt_lsb_minus4)?;
    out.write_u8(sps.log2_min_luma_coding_block_size_minus3)?;
    out.write_u8(sps.log2_diff_max_min_luma_coding_block_size)?;
    out.write_u8(sps.log2_min_luma_transform_block_size_minus2)?;
    out.write_u8(sps.log2_diff_max_min_luma_transform_block_size)?;
    out.write_u8(sps.max_transform_hierarchy_depth_inter)?;
    out.write_u8(sps.max_transform_hierarchy_depth_intra)?;
    out.write_u8(sps.num_short_term_ref_pic_sets)?;
    out.write_u8(sps.num_long_term_ref_pics_sps)?;
    out.write_u8(sps.pcm_sample_bit_depth_luma_minus1)?;
    out.write_u8(sps.pcm_sample_bit_depth_chroma_minus1)?;
    out.write_u8(sps.log2_min_pcm_luma_coding_block_size_minus3)?;
    out.write_u8(sps.log2_diff_max_min_pcm_luma_coding_block_size)?;

    out.write_u8(pps.num_ref_idx_l0_default_active_minus1)?;
    out.write_u8(pps.num_ref_idx_l1_default_active_minus1)?;
    out.write_i8(pps.init_qp_minus26)?;
    out.write_i8(pps.cb_qp_offset)?;
    out.write_i8(pps.cr_qp_offset)?;
    out.write_u8(u8::try_from(pps.diff_cu_qp_delta_depth)?)?;
    out.write_i8(pps.beta_offset_div2)?;
    out.write_i8(pps.tc_offset_div2)?;
    out.write_u8(pps.log2_parallel_merge_level_minus2)?;
    out.write_u8(pps.num_extra_slice_header_bits)?;

    out.write_u32::<LittleEndian>(flags_u32(&[
        sps.separate_colour_plane_flag,
        sps.scaling_list_enabled_flag,
        sps.amp_enabled_flag,
        sps.sample_adaptive_offset_enabled_flag,
        sps.pcm_enabled_flag,
        sps.pcm_loop_filter_disabled_flag,
        sps.long_term_ref_pics_present_flag,
        sps.temporal_mvp_enabled_flag,
        sps.strong_intra_smoothing_enabled_flag,
        pps.dependent_slice_segments_enabled_flag,
        pps.output_flag_present_flag,
        pps.sign_data_hiding_enabled_flag,
        pps.cabac_init_present_flag,
        pps.constrained_intra_pred_flag,
        pps.transform_skip_enabled_flag,
        pps.cu_qp_delta_enabled_flag,
        pps.slice_chroma_qp_offsets_present_flag,
        pps.weighted_pred_flag,
        pps.weighted_bipred_flag,
        pps.transquant_bypass_enabled_flag,
        pps.tiles_enabled_flag,
        pps.entropy_coding_sync_enabled_flag,
        pps.uniform_spacing_flag,
        pps.loop_filter_across_tiles_enabled_flag,
        pps.loop_filter_across_slices_enabled_flag,
        pps.deblocking_filter_override_enabled_flag,
        pps.deblocking_filter_disabled_flag,
        pps.lists_modification_present_flag,
        pps.slice_segment_header_extension_present_flag,
        pic.nalu_type.is_irap(),
        pic.nalu_type.is_idr(),
        pic.nalu_type.is_irap() && pic.no_rasl_output_flag,
    ]))?;

    out.write_u8(pps.num_tile_columns_minus1)?;
    out.write_u8(pps.num_tile_rows_minus1)?;
    for width in &pps.column_width_minus1 {
        out.write_u16::<LittleEndian>(u16::try_from(*width)?)?;
    }
    for height in &pps.row_height_minus1 {
        out.write_u16::<LittleEndian>(u16::try_from(*height)?)?;
    }

    out.write_i32::<LittleEndian>(pic.pic_order_cnt_val)?;
    out.write_u32::<LittleEndian>(pic.short_term_ref_pic_set_size_bits)?;

    for i in 0..MAX_DPB_SIZE {
        match entries.get(i) {
            Some(entry) => {
                out.write_u8(table.index(i).unwrap_or(NO_REFERENCE))?;
                out.write_u8(flags_u32(&[entry.long_term, entry.dpb_index.is_none()]) as u8)?;
                out.write_i32::<LittleEndian>(entry.pic_order_cnt_val)?;
            }
            None => {
                out.write_u8(NO_REFERENCE)?;
                out.write_u8(0)?;
                out.write_i32::<LittleEndian>(0)?;
            }
        }
    }

    // The entries start with StCurrBefore, StCurrAfter and LtCurr, in that order.
    out.write_u8(u8::try_from(rps.st_curr_before.len())?)?;
    out.write_u8(u8::try_from(rps.st_curr_after.len())?)?;
    out.write_u8(u8::try_from(rps.lt_curr.len())?)?;

    Ok(out)
}

/// The scaling lists in raster order: 4x4, 8x8 and 16x16 for the 6 matrices, then 32x32 for the
/// two luma ones, then the DC coefficients of the 16x16 and 32x32 lists.
fn quantization_matrix(lists: &ScalingLists) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 * 16 + 6 * 64 * 2 + 2 * 64 + 6 + 2);

    for list in &lists.scaling_list_4x4 {
        out.extend_from_slice(&raster_from_up_right_diagonal_4x4(list));
    }
    for list in &lists.scaling_list_8x8 {
        out.extend_from_slice(&raster_from_up_right_diagonal_8x8(list));
    }
    for list in &lists.scaling_list_16x16 {
        out.extend_from_slice(&raster_from_up_right_diagonal_8x8(list));
    }
    for matrix_id in [0, 3] {
        out.extend_from_slice(&raster_from_up_right_diagonal_8x8(
            &lists.scaling_list_32x32[matrix_id],
        ));
    }

    let dc = |coef_minus8: i16| (coef_minus8 + 8).clamp(0, 255) as u8;
    out.extend(lists.scaling_list_dc_coef_minus8_16x16.iter().map(|c| dc(*c)));
    out.extend([0, 3].map(|matrix_id| dc(lists.scaling_list_dc_coef_minus8_32x32[matrix_id])));

    out
}

/// Codec part of a slice control entry. List entries index the reference frames of the picture
/// parameters.
fn slice_control(slice: &Slice, list0: &[u8], list1: &[u8]) -> anyhow::Result<Vec<u8>> {
    let hdr = &slice.header;
    let mut out = Vec::new();

    out.write_u32::<LittleEndian>(hdr.header_bit_size)?;
    out.write_u32::<LittleEndian>(hdr.segment_address)?;
    out.write_u8(hdr.type_ as u8)?;
    out.write_u8(hdr.num_ref_idx_l0_active_minus1)?;
    out.write_u8(hdr.num_ref_idx_l1_active_minus1)?;
    out.write_i8(hdr.qp_delta)?;
    out.write_i8(hdr.cb_qp_offset)?;
    out.write_i8(hdr.cr_qp_offset)?;
    out.write_u8(hdr.collocated_ref_idx)?;
    out.write_u8(hdr.five_minus_max_num_merge_cand)?;
    out.write_u8(flags_u32(&[
        hdr.dependent_slice_segment_flag,
        hdr.temporal_mvp_enabled_flag,
        hdr.sao_luma_flag,
        hdr.sao_chroma_flag,
        hdr.mvd_l1_zero_flag,
        hdr.cabac_init_flag,
        hdr.collocated_from_l0_flag,
        hdr.deblocking_filter_disabled_flag,
    ]) as u8)?;

    for list in [list0, list1] {
        for i in 0..MAX_REF_LIST_ENTRIES {
            out.write_u8(list.get(i).copied().unwrap_or(NO_REFERENCE))?;
        }
    }

    Ok(out)
}

impl StatelessCodec for H265 {
    type Header = NaluHeader;
    type Store = Parser;

    const CODEC: VideoCodec = VideoCodec::H265;
    const SLICE_FRAMING: SliceFraming = SliceFraming::H265;

    fn param_sets(&mut self) -> &mut Parser {
        &mut self.parser
    }

    fn is_parameter_set(header: &NaluHeader) -> bool {
        matches!(
            header.type_,
            NaluType::VpsNut | NaluType::SpsNut | NaluType::PpsNut
        )
    }

    fn decode_access_unit<D: HwDecodeDevice>(
        &mut self,
        hw: &mut HwState<D>,
        units: &[Unit<NaluHeader>],
        access_unit: &AccessUnit,
    ) -> Result<(), DecoderError> {
        // Slice segments of each picture, split on first_slice_segment_in_pic_flag.
        let mut pictures: Vec<Vec<Slice>> = vec![];
        let mut end_of_sequence = false;

        for unit in units {
            match unit.header.type_ {
                type_ if type_.is_slice() => {
                    let slice = self
                        .parser
                        .parse_slice_header(*unit)
                        .with_context(|| format!("while parsing slice at offset {}", unit.offset))?;

                    match pictures.last_mut() {
                        Some(picture) if !slice.header.first_slice_segment_in_pic_flag => {
                            picture.push(slice)
                        }
                        _ => pictures.push(vec![slice]),
                    }
                }
                NaluType::EosNut | NaluType::EobNut => end_of_sequence = true,
                other => debug!("Skipping {:?} unit", other),
            }
        }

        for slices in &pictures {
            self.decode_picture(hw, slices, access_unit)?;
        }

        if end_of_sequence {
            debug!("End of sequence");
            // The next picture is an IRAP starting a new coded video sequence.
            hw.output_frames(self.dpb.drain());
            self.order = Default::default();
        }

        Ok(())
    }

    fn drain(&mut self) -> Vec<FrameHandle> {
        self.dpb.drain()
    }

    fn flush(&mut self) {
        self.dpb.clear();
        self.order = Default::default();
    }

    fn dpb_handles(&self) -> Vec<FrameHandle> {
        self.dpb.handles().copied().collect()
    }
}
