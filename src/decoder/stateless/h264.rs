// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
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
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::ReferencePicLists;
use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::NaluHeader;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::RefPicListModification;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::DPB_MAX_SIZE;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::decoder::stateless::HwState;
use crate::decoder::stateless::StatelessCodec;
use crate::decoder::stateless::StreamParams;
use crate::decoder::AccessUnit;
use crate::decoder::DecoderError;
use crate::PixelLayout;

/// Table index of unused reference entries.
const NO_REFERENCE: u8 = 0xff;

/// Entries of each reference list in the slice control payload.
const MAX_REF_LIST_ENTRIES: usize = 32;

fn raster_from_zigzag_8x8(src: &[u8; 64]) -> [u8; 64] {
    const ZIGZAG_8X8: [usize; 64] = [
        0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
        20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51,
        58, 59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
    ];

    let mut dst = [0; 64];
    for (i, value) in src.iter().enumerate() {
        dst[ZIGZAG_8X8[i]] = *value;
    }
    dst
}

fn raster_from_zigzag_4x4(src: &[u8; 16]) -> [u8; 16] {
    const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

    let mut dst = [0; 16];
    for (i, value) in src.iter().enumerate() {
        dst[ZIGZAG_4X4[i]] = *value;
    }
    dst
}

#[derive(Clone, Debug, Default)]
struct PrevReferencePicInfo {
    frame_num: u32,
    has_mmco_5: bool,
    top_field_order_cnt: i32,
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
}

#[derive(Clone, Debug, Default)]
struct PrevPicInfo {
    frame_num: u32,
    frame_num_offset: u32,
    has_mmco_5: bool,
}

/// Picture order and marking state carried from one picture to the next.
#[derive(Clone, Debug, Default)]
struct OrderState {
    prev_ref_pic_info: PrevReferencePicInfo,
    prev_pic_info: PrevPicInfo,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
}

/// State of the H.264 decoder.
#[derive(Default)]
pub struct H264 {
    /// H.264 bitstream parser, also holding the parameter sets.
    parser: Parser,
    /// The decoded picture buffer.
    dpb: Dpb<FrameHandle>,
    order: OrderState,
}

impl H264 {
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
        let dpb_size = sps.max_dpb_frames();

        Ok(StreamParams {
            heap: DecodeHeapConfig {
                codec: VideoCodec::H264,
                coded_resolution: sps.resolution().round_up(alignment),
                layout,
                max_references: dpb_size,
            },
            dpb_size,
            visible_rect: sps.visible_rectangle(),
            bit_depth,
        })
    }

    /// Computes the POC of `pic` as per 8.2.1.
    fn compute_pic_order_count(&self, sps: &Sps, pic: &mut PictureData) -> anyhow::Result<()> {
        let prev_ref = &self.order.prev_ref_pic_info;
        let prev = &self.order.prev_pic_info;

        // 8-6 and 8-11.
        let frame_num_offset = || {
            let prev_frame_num_offset = if prev.has_mmco_5 {
                0
            } else {
                prev.frame_num_offset
            };

            if pic.is_idr() {
                0
            } else if prev.frame_num > pic.frame_num {
                prev_frame_num_offset + sps.max_frame_num()
            } else {
                prev_frame_num_offset
            }
        };

        match sps.pic_order_cnt_type {
            // 8.2.1.1
            0 => {
                let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) = if pic.is_idr() {
                    (0, 0)
                } else if prev_ref.has_mmco_5 {
                    (0, prev_ref.top_field_order_cnt)
                } else {
                    (prev_ref.pic_order_cnt_msb, prev_ref.pic_order_cnt_lsb)
                };

                let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb() as i32;
                let lsb = pic.pic_order_cnt_lsb;

                pic.pic_order_cnt_msb = if lsb < prev_pic_order_cnt_lsb
                    && prev_pic_order_cnt_lsb - lsb >= max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb + max_pic_order_cnt_lsb
                } else if lsb > prev_pic_order_cnt_lsb
                    && lsb - prev_pic_order_cnt_lsb > max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb - max_pic_order_cnt_lsb
                } else {
                    prev_pic_order_cnt_msb
                };

                pic.top_field_order_cnt = pic.pic_order_cnt_msb + lsb;
                pic.bottom_field_order_cnt = pic.top_field_order_cnt + pic.delta_pic_order_cnt_bottom;
            }

            // 8.2.1.2
            1 => {
                pic.frame_num_offset = frame_num_offset();

                let cycle_len = u32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
                let mut abs_frame_num = if cycle_len != 0 {
                    pic.frame_num_offset + pic.frame_num
                } else {
                    0
                };

                if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected_pic_order_cnt = 0;
                if abs_frame_num > 0 {
                    let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / cycle_len;
                    let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % cycle_len;

                    expected_pic_order_cnt = pic_order_cnt_cycle_cnt as i32
                        * sps.expected_delta_per_pic_order_cnt_cycle;
                    for i in 0..=frame_num_in_pic_order_cnt_cycle as usize {
                        expected_pic_order_cnt += sps
                            .offset_for_ref_frame
                            .get(i)
                            .context("offset_for_ref_frame is too short")?;
                    }
                }

                if pic.nal_ref_idc == 0 {
                    expected_pic_order_cnt += sps.offset_for_non_ref_pic;
                }

                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
                pic.bottom_field_order_cnt = pic.top_field_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt1;
            }

            // 8.2.1.3
            2 => {
                pic.frame_num_offset = frame_num_offset();

                let temp_pic_order_cnt = if pic.is_idr() {
                    0
                } else if pic.nal_ref_idc == 0 {
                    2 * (pic.frame_num_offset + pic.frame_num) as i32 - 1
                } else {
                    2 * (pic.frame_num_offset + pic.frame_num) as i32
                };

                pic.top_field_order_cnt = temp_pic_order_cnt;
                pic.bottom_field_order_cnt = temp_pic_order_cnt;
            }

            other => return Err(anyhow!("invalid pic_order_cnt_type {}", other)),
        }

        pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);

        Ok(())
    }

    /// Store some variables related to the previous reference picture. These will be used in
    /// the decoding of future pictures.
    fn fill_prev_ref_info(&mut self, pic: &PictureData) {
        let prev = &mut self.order.prev_ref_pic_info;

        prev.has_mmco_5 = pic.has_mmco_5;
        prev.top_field_order_cnt = pic.top_field_order_cnt;
        prev.pic_order_cnt_msb = pic.pic_order_cnt_msb;
        prev.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        prev.frame_num = pic.frame_num;
    }

    /// Store some variables related to the previous picture. These will be used in the decoding
    /// of future pictures.
    fn fill_prev_info(&mut self, pic: &PictureData) {
        let prev = &mut self.order.prev_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.frame_num_offset = pic.frame_num_offset;
    }

    fn handle_memory_management_ops(&mut self, pic: &mut PictureData) -> anyhow::Result<()> {
        let markings = pic.ref_pic_marking.inner.clone();

        for marking in &markings {
            match marking.memory_management_control_operation {
                0 => break,
                1 => self.dpb.mmco_op_1(pic, marking)?,
                2 => self.dpb.mmco_op_2(marking)?,
                3 => self.dpb.mmco_op_3(pic, marking)?,
                4 => self.order.max_long_term_frame_idx = self.dpb.mmco_op_4(marking),
                5 => self.order.max_long_term_frame_idx = self.dpb.mmco_op_5(pic),
                6 => self.dpb.mmco_op_6(pic, marking),
                other => anyhow::bail!("unknown MMCO={}", other),
            }
        }

        Ok(())
    }

    /// 8.2.5.1
    fn reference_pic_marking(&mut self, sps: &Sps, pic: &mut PictureData) -> anyhow::Result<()> {
        if pic.is_idr() {
            self.dpb.mark_all_as_unused_for_ref();

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm);
                pic.long_term_frame_idx = 0;
                self.order.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                pic.set_reference(Reference::ShortTerm);
                self.order.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }

            return Ok(());
        }

        if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.handle_memory_management_ops(pic)
        } else {
            self.dpb.sliding_window_marking(sps.max_num_ref_frames)
        }
    }

    /// Inserts "non-existing" frames for the `frame_num` values skipped before `frame_num`, as
    /// per 8.2.5.2.
    fn handle_frame_num_gap(
        &mut self,
        sps: &Sps,
        frame_num: u32,
        timestamp: u64,
        outputs: &mut Vec<FrameHandle>,
    ) -> anyhow::Result<()> {
        if self.dpb.is_empty() {
            return Ok(());
        }

        if !sps.gaps_in_frame_num_value_allowed_flag {
            log::warn!(
                "Unexpected frame_num {} after {}, assuming lost frames",
                frame_num,
                self.order.prev_ref_pic_info.frame_num
            );
        }

        let max_frame_num = sps.max_frame_num();
        let mut unused_short_term_frame_num =
            (self.order.prev_ref_pic_info.frame_num + 1) % max_frame_num;

        while unused_short_term_frame_num != frame_num {
            debug!("frame_num gap, inferring frame {}", unused_short_term_frame_num);

            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num, timestamp);
            self.compute_pic_order_count(sps, &mut pic)?;

            self.dpb
                .update_pic_nums(unused_short_term_frame_num, max_frame_num);
            self.dpb.sliding_window_marking(sps.max_num_ref_frames)?;
            self.dpb.remove_unused();
            outputs.extend(self.dpb.bump_as_needed(&pic).into_iter().flatten());

            self.order.prev_ref_pic_info.frame_num = pic.frame_num;
            self.order.prev_pic_info.frame_num = pic.frame_num;
            self.order.prev_pic_info.frame_num_offset = pic.frame_num_offset;
            self.order.prev_pic_info.has_mmco_5 = false;

            self.dpb
                .store_picture(Rc::new(RefCell::new(pic)), None)
                .context("while storing a non-existing frame")?;

            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    /// The reference lists of `slice`, as indices into the DPB.
    fn slice_ref_pic_lists(
        &self,
        pic: &PictureData,
        slice: &Slice,
        initial: &ReferencePicLists,
    ) -> anyhow::Result<(Vec<usize>, Vec<usize>)> {
        let hdr = &slice.header;
        let max_pic_num = hdr.max_pic_num as i32;
        let num_l0 = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
        let num_l1 = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;

        let modify = |list: &[usize],
                      num_active: usize,
                      modifications: &[RefPicListModification]| {
            self.dpb
                .modify_ref_pic_list(pic, list.to_vec(), num_active, modifications, max_pic_num)
        };

        let lists = if hdr.slice_type.is_p() || hdr.slice_type.is_sp() {
            (
                modify(
                    &initial.ref_pic_list_p0,
                    num_l0,
                    &hdr.ref_pic_list_modification_l0,
                )?,
                vec![],
            )
        } else if hdr.slice_type.is_b() {
            (
                modify(
                    &initial.ref_pic_list_b0,
                    num_l0,
                    &hdr.ref_pic_list_modification_l0,
                )?,
                modify(
                    &initial.ref_pic_list_b1,
                    num_l1,
                    &hdr.ref_pic_list_modification_l1,
                )?,
            )
        } else {
            (vec![], vec![])
        };

        Ok(lists)
    }

    /// Decodes the slices of one picture. Frames ready for output are appended to `outputs`.
    fn decode_picture_inner<D: HwDecodeDevice>(
        &mut self,
        hw: &mut HwState<D>,
        slices: &[Slice],
        sps: &Sps,
        pps: &Pps,
        access_unit: &AccessUnit,
        outputs: &mut Vec<FrameHandle>,
    ) -> Result<(), DecoderError> {
        let first = slices.first().context("picture without slices")?;
        let timestamp = access_unit.timestamp;

        let target = hw.acquire_target()?;

        self.dpb
            .set_limits(sps.max_dpb_frames(), sps.max_num_order_frames() as usize);

        if first.nalu.header.idr_pic_flag {
            self.order.prev_ref_pic_info.frame_num = 0;
        }

        let frame_num = u32::from(first.header.frame_num);
        let prev_frame_num = self.order.prev_ref_pic_info.frame_num;
        if frame_num != prev_frame_num && frame_num != (prev_frame_num + 1) % sps.max_frame_num()
        {
            self.handle_frame_num_gap(sps, frame_num, timestamp, outputs)?;
        }

        let mut pic = PictureData::new_from_slice(first, sps, timestamp);
        pic.needed_for_output = !access_unit.do_not_output;
        pic.pic_num = pic.frame_num as i32;
        self.compute_pic_order_count(sps, &mut pic)?;

        if pic.is_idr() {
            // C.4.4
            if pic.ref_pic_marking.no_output_of_prior_pics_flag {
                self.dpb.clear();
            } else {
                outputs.extend(self.dpb.drain().into_iter().flatten());
            }
        }

        self.dpb.update_pic_nums(frame_num, sps.max_frame_num());
        let initial_lists = self.dpb.build_ref_pic_lists(&pic);

        debug!("Decode picture POC {}, frame_num {}", pic.pic_order_cnt, frame_num);

        // Reference frames as seen by the hardware: the references of the DPB, in DPB order.
        let ref_frames: Vec<usize> = self
            .dpb
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.pic.borrow().is_ref())
            .map(|(idx, _)| idx)
            .take(DPB_MAX_SIZE)
            .collect();
        let ref_handles: Vec<Option<FrameHandle>> = ref_frames
            .iter()
            .map(|idx| self.dpb.entries()[*idx].handle)
            .collect();
        let table = ReferenceTable::new(hw.pool(), &ref_handles)?;

        let to_ref_frame_index = |list: &[usize]| -> Vec<u8> {
            list.iter()
                .map(|dpb_idx| {
                    ref_frames
                        .iter()
                        .position(|idx| idx == dpb_idx)
                        .map_or(NO_REFERENCE, |pos| pos as u8)
                })
                .collect()
        };

        let mut slice_submissions = Vec::with_capacity(slices.len());
        for slice in slices {
            let (list0, list1) = self
                .slice_ref_pic_lists(&pic, slice, &initial_lists)
                .with_context(|| {
                    format!("while building the reference lists of a slice of POC {}", pic.pic_order_cnt)
                })?;

            slice_submissions.push(SliceSubmission {
                data: slice.nalu.data,
                control: slice_control(
                    slice,
                    &to_ref_frame_index(&list0),
                    &to_ref_frame_index(&list1),
                )?,
            });
        }

        let picture_params = picture_params(sps, pps, &pic, &self.dpb, &ref_frames, &table)?;
        let quantization_matrix = quantization_matrix(pps);

        hw.submit(
            &PictureSubmission {
                codec: Self::CODEC,
                framing: Self::SLICE_FRAMING,
                target,
                slices: &slice_submissions,
                picture_params: &picture_params,
                quantization_matrix: Some(&quantization_matrix),
                references: &table,
            },
            timestamp,
        )?;

        self.finish_picture(sps, pic, target, outputs)?;

        Ok(())
    }

    /// Marks the references and stores the decoded picture, as per C.4.4 and C.4.5.
    fn finish_picture(
        &mut self,
        sps: &Sps,
        mut pic: PictureData,
        target: FrameHandle,
        outputs: &mut Vec<FrameHandle>,
    ) -> anyhow::Result<()> {
        debug!("Finishing picture POC {}", pic.pic_order_cnt);

        if pic.is_ref() {
            self.reference_pic_marking(sps, &mut pic)?;
            self.fill_prev_ref_info(&pic);
        }

        self.fill_prev_info(&pic);

        self.dpb.remove_unused();

        if pic.has_mmco_5 {
            // C.4.5.3 "Bumping process", clause 3.
            outputs.extend(self.dpb.drain().into_iter().flatten());
        }

        // C.4.5.3 clauses 1, 4, 5 and 6.
        outputs.extend(self.dpb.bump_as_needed(&pic).into_iter().flatten());

        // C.4.5.1 and C.4.5.2: a non-reference frame only goes to the DPB if it fits.
        if pic.is_ref() || self.dpb.has_empty_frame_buffer() {
            self.dpb
                .store_picture(Rc::new(RefCell::new(pic)), Some(target))?;
        } else if pic.needed_for_output {
            outputs.push(target);
        }

        outputs.extend(self.dpb.bump_for_reorder().into_iter().flatten());

        Ok(())
    }

    fn decode_picture<D: HwDecodeDevice>(
        &mut self,
        hw: &mut HwState<D>,
        slices: &[Slice],
        access_unit: &AccessUnit,
    ) -> Result<(), DecoderError> {
        let first = slices.first().context("picture without slices")?;

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

        let params = Self::stream_params(&sps, hw.config().alignment)?;
        if hw.needs_reconfiguration(&params) {
            if !first.nalu.header.idr_pic_flag {
                log::warn!("Stream parameters changed outside of an IDR picture");
                return Err(DecoderError::ResetRequired);
            }

            // Frames of the previous configuration are never referenced again.
            let frames = self.dpb.drain();
            hw.output_frames(frames.into_iter().flatten());
            hw.reconfigure(&params)?;
        } else if !hw.has_free_frame() {
            return Err(DecoderError::NoBuffer);
        }

        let dpb = self.dpb.snapshot();
        let order = self.order.clone();
        let mut outputs = vec![];

        match self.decode_picture_inner(hw, slices, &sps, &pps, access_unit, &mut outputs) {
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

fn flags_byte(flags: &[bool]) -> u8 {
    flags
        .iter()
        .enumerate()
        .fold(0, |acc, (bit, set)| acc | (u8::from(*set) << bit))
}

/// Picture parameters payload: sequence and picture level fields, then one entry per possible
/// reference frame.
fn picture_params(
    sps: &Sps,
    pps: &Pps,
    pic: &PictureData,
    dpb: &Dpb<FrameHandle>,
    ref_frames: &[usize],
    table: &ReferenceTable,
) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();

    out.write_u16::<LittleEndian>(sps.pic_width_in_mbs_minus1)?;
    out.write_u16::<LittleEndian>(sps.pic_height_in_map_units_minus1)?;
    out.write_u8(sps.max_num_ref_frames)?;
    out.write_u8(sps.bit_depth_luma_minus8)?;
    out.write_u8(sps.bit_depth_chroma_minus8)?;
    out.write_u8(sps.chroma_format_idc)?;
    out.write_u8(flags_byte(&[
        pps.entropy_coding_mode_flag,
        pps.transform_8x8_mode_flag,
        pps.constrained_intra_pred_flag,
        pps.weighted_pred_flag,
        sps.direct_8x8_inference_flag,
        pps.deblocking_filter_control_present_flag,
        pic.is_ref(),
        pic.is_idr(),
    ]))?;
    out.write_u8(pps.weighted_bipred_idc)?;
    out.write_i8(pps.pic_init_qp_minus26)?;
    out.write_i8(pps.chroma_qp_index_offset)?;
    out.write_i8(pps.second_chroma_qp_index_offset)?;
    out.write_u16::<LittleEndian>(u16::try_from(pic.frame_num)?)?;
    out.write_i32::<LittleEndian>(pic.top_field_order_cnt)?;
    out.write_i32::<LittleEndian>(pic.bottom_field_order_cnt)?;
    out.write_u8(sps.log2_max_frame_num_minus4)?;
    out.write_u8(sps.pic_order_cnt_type)?;
    out.write_u8(sps.log2_max_pic_order_cnt_lsb_minus4)?;
    out.write_u8(u8::from(sps.delta_pic_order_always_zero_flag))?;
    out.write_u8(pps.num_ref_idx_l0_default_active_minus1)?;
    out.write_u8(pps.num_ref_idx_l1_default_active_minus1)?;

    for i in 0..DPB_MAX_SIZE {
        let Some(entry) = ref_frames.get(i).and_then(|idx| dpb.entries().get(*idx)) else {
            out.write_u8(NO_REFERENCE)?;
            out.write_u8(0)?;
            out.write_u16::<LittleEndian>(0)?;
            out.write_i32::<LittleEndian>(0)?;
            out.write_i32::<LittleEndian>(0)?;
            continue;
        };

        let ref_pic = entry.pic.borrow();
        let frame_idx = if ref_pic.is_long_term_ref() {
            ref_pic.long_term_frame_idx
        } else {
            ref_pic.frame_num
        };

        out.write_u8(table.index(i).unwrap_or(NO_REFERENCE))?;
        out.write_u8(flags_byte(&[ref_pic.is_long_term_ref(), ref_pic.nonexisting]))?;
        out.write_u16::<LittleEndian>(u16::try_from(frame_idx)?)?;
        out.write_i32::<LittleEndian>(ref_pic.top_field_order_cnt)?;
        out.write_i32::<LittleEndian>(ref_pic.bottom_field_order_cnt)?;
    }

    Ok(out)
}

/// The scaling lists in effect for `pps`, in raster order.
fn quantization_matrix(pps: &Pps) -> Vec<u8> {
    let lists = &pps.scaling_lists;
    let mut out = Vec::with_capacity(6 * 16 + 6 * 64);

    for list in &lists.lists_4x4 {
        out.extend_from_slice(&raster_from_zigzag_4x4(list));
    }
    for list in &lists.lists_8x8 {
        out.extend_from_slice(&raster_from_zigzag_8x8(list));
    }

    out
}

/// Codec part of a slice control entry. List entries index the reference frames of the picture
/// parameters.
fn slice_control(slice: &Slice, list0: &[u8], list1: &[u8]) -> anyhow::Result<Vec<u8>> {
    let hdr = &slice.header;
    let mut out = Vec::new();

    out.write_u32::<LittleEndian>(u32::try_from(hdr.header_bit_size)?)?;
    out.write_u8(hdr.slice_type as u8)?;
    out.write_u8(hdr.num_ref_idx_l0_active_minus1)?;
    out.write_u8(hdr.num_ref_idx_l1_active_minus1)?;
    out.write_i8(hdr.slice_qp_delta)?;
    out.write_u8(hdr.disable_deblocking_filter_idc)?;

    for list in [list0, list1] {
        for i in 0..MAX_REF_LIST_ENTRIES {
            out.write_u8(list.get(i).copied().unwrap_or(NO_REFERENCE))?;
        }
    }

    Ok(out)
}

impl StatelessCodec for H264 {
    type Header = NaluHeader;
    type Store = Parser;

    const CODEC: VideoCodec = VideoCodec::H264;
    const SLICE_FRAMING: SliceFraming = SliceFraming::H264;

    fn param_sets(&mut self) -> &mut Parser {
        &mut self.parser
    }

    fn is_parameter_set(header: &NaluHeader) -> bool {
        matches!(header.type_, NaluType::Sps | NaluType::Pps)
    }

    fn decode_access_unit<D: HwDecodeDevice>(
        &mut self,
        hw: &mut HwState<D>,
        units: &[Unit<NaluHeader>],
        access_unit: &AccessUnit,
    ) -> Result<(), DecoderError> {
        // Slices of each picture, split on first_mb_in_slice == 0.
        let mut pictures: Vec<Vec<Slice>> = vec![];
        let mut end_of_sequence = false;

        for unit in units {
            match unit.header.type_ {
                NaluType::Slice | NaluType::SliceIdr => {
                    let slice = self
                        .parser
                        .parse_slice_header(*unit)
                        .with_context(|| format!("while parsing slice at offset {}", unit.offset))?;

                    match pictures.last_mut() {
                        Some(picture) if slice.header.first_mb_in_slice != 0 => {
                            picture.push(slice)
                        }
                        _ => pictures.push(vec![slice]),
                    }
                }
                NaluType::SeqEnd | NaluType::StreamEnd => end_of_sequence = true,
                other => debug!("Skipping {:?} unit", other),
            }
        }

        for slices in &pictures {
            self.decode_picture(hw, slices, access_unit)?;
        }

        if end_of_sequence {
            debug!("End of sequence");
            // The next picture is an IDR and starts from a clean state.
            self.order = Default::default();
        }

        Ok(())
    }

    fn drain(&mut self) -> Vec<FrameHandle> {
        self.dpb.drain().into_iter().flatten().collect()
    }

    fn flush(&mut self) {
        self.dpb.clear();
        self.order = Default::default();
    }

    fn dpb_handles(&self) -> Vec<FrameHandle> {
        self.dpb.handles().copied().collect()
    }
}
