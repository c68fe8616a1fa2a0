// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::parser::RefPicMarking;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;

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

/// Data associated with a H.264 frame. The POC and picture number fields follow the naming of
/// the derivation processes in clause 8.2.
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
    pub frame_num: u32,
    pub frame_num_offset: u32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: u32,

    pub is_idr: IsIdr,
    pub nal_ref_idc: u8,
    /// Stands in for a frame lost to a `frame_num` gap.
    pub nonexisting: bool,
    pub needed_for_output: bool,
    pub has_mmco_5: bool,
    pub ref_pic_marking: RefPicMarking,

    pub timestamp: u64,
    pub(crate) reference: Reference,
}

impl PictureData {
    /// Creates the picture described by the first slice of a frame. The POC fields are computed
    /// later by the decoder.
    pub fn new_from_slice(slice: &Slice, sps: &Sps, timestamp: u64) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu.header;

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

        let mut pic_order_cnt_lsb = 0;
        let mut delta_pic_order_cnt_bottom = 0;
        let mut delta_pic_order_cnt0 = 0;
        let mut delta_pic_order_cnt1 = 0;

        match sps.pic_order_cnt_type {
            0 => {
                pic_order_cnt_lsb = i32::from(hdr.pic_order_cnt_lsb);
                delta_pic_order_cnt_bottom = hdr.delta_pic_order_cnt_bottom;
            }
            1 => {
                delta_pic_order_cnt0 = hdr.delta_pic_order_cnt[0];
                delta_pic_order_cnt1 = hdr.delta_pic_order_cnt[1];
            }
            _ => (),
        }

        Self {
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0,
            delta_pic_order_cnt1,
            frame_num: u32::from(hdr.frame_num),
            is_idr,
            nal_ref_idc: nalu_hdr.ref_idc,
            needed_for_output: true,
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            timestamp,
            reference,
            ..Default::default()
        }
    }

    /// Creates a placeholder for frame `frame_num`, inferred from a gap in `frame_num`. See
    /// 8.2.5.2.
    pub fn new_non_existing(frame_num: u32, timestamp: u64) -> Self {
        log::debug!("Creating non-existing frame for frame_num {}", frame_num);

        Self {
            frame_num,
            nal_ref_idc: 1,
            nonexisting: true,
            needed_for_output: false,
            timestamp,
            reference: Reference::ShortTerm,
            ..Default::default()
        }
    }

    pub fn is_idr(&self) -> bool {
        matches!(self.is_idr, IsIdr::Yes { .. })
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_short_term_ref(&self) -> bool {
        matches!(self.reference, Reference::ShortTerm)
    }

    pub fn is_long_term_ref(&self) -> bool {
        matches!(self.reference, Reference::LongTerm)
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!(
            "Set reference of frame_num {} (POC {}) to {:?}",
            self.frame_num,
            self.pic_order_cnt,
            reference
        );

        self.reference = reference;
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }
}
