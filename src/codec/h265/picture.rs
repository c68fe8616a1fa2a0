// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Slice;
use crate::codec::h265::parser::Sps;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Data associated with a H.265 picture. Most fields are extracted from the first slice segment
/// header and kept for the reference picture set and output processes.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PictureData {
    pub nalu_type: NaluType,
    pub no_rasl_output_flag: bool,
    pub pic_output_flag: bool,
    /// Whether this picture qualifies as prevTid0Pic for the pictures that follow.
    pub valid_for_prev_tid0_pic: bool,
    pub slice_pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_val: i32,
    /// NoOutputOfPriorPicsFlag, as inferred in C.5.2.2.
    pub no_output_of_prior_pics_flag: bool,

    pub pic_latency_cnt: u32,
    pub needed_for_output: bool,
    pub short_term_ref_pic_set_size_bits: u32,
    pub timestamp: u64,
    pub(crate) reference: Reference,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the first slice segment of a picture and runs the
    /// picture order count process of clause 8.3.1.
    ///
    /// `first_picture_in_cvs` is set for the first picture of the bitstream and for the first one
    /// after an end of sequence unit. HandleCraAsBlaFlag is always 0.
    pub fn new_from_slice(
        slice: &Slice,
        sps: &Sps,
        first_picture_in_cvs: bool,
        prev_tid0_pic: Option<&PictureData>,
        timestamp: u64,
    ) -> Self {
        let hdr = &slice.header;
        let nalu_type = slice.nalu.header.type_;
        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

        let no_rasl_output_flag = nalu_type.is_idr()
            || nalu_type.is_bla()
            || (nalu_type.is_cra() && first_picture_in_cvs);

        let slice_pic_order_cnt_lsb = i32::from(hdr.pic_order_cnt_lsb);
        let mut pic_order_cnt_msb = 0;

        if !(nalu_type.is_irap() && no_rasl_output_flag) {
            if let Some(prev) = prev_tid0_pic {
                let prev_lsb = prev.slice_pic_order_cnt_lsb;
                let prev_msb = prev.pic_order_cnt_msb;

                // (8-1)
                pic_order_cnt_msb = if slice_pic_order_cnt_lsb < prev_lsb
                    && prev_lsb - slice_pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2
                {
                    prev_msb + max_pic_order_cnt_lsb
                } else if slice_pic_order_cnt_lsb > prev_lsb
                    && slice_pic_order_cnt_lsb - prev_lsb > max_pic_order_cnt_lsb / 2
                {
                    prev_msb - max_pic_order_cnt_lsb
                } else {
                    prev_msb
                };
            }
        }

        let valid_for_prev_tid0_pic = slice.nalu.header.temporal_id() == 0
            && !nalu_type.is_radl()
            && !nalu_type.is_rasl()
            && !nalu_type.is_slnr();

        // C.5.2.2: CRA pictures always discard the pictures left in the DPB.
        let no_output_of_prior_pics_flag = if nalu_type.is_irap() && no_rasl_output_flag {
            nalu_type.is_cra() || hdr.no_output_of_prior_pics_flag
        } else {
            false
        };

        Self {
            nalu_type,
            no_rasl_output_flag,
            pic_output_flag: hdr.pic_output_flag,
            valid_for_prev_tid0_pic,
            slice_pic_order_cnt_lsb,
            pic_order_cnt_msb,
            // (8-2)
            pic_order_cnt_val: pic_order_cnt_msb + slice_pic_order_cnt_lsb,
            no_output_of_prior_pics_flag,
            pic_latency_cnt: 0,
            needed_for_output: false,
            short_term_ref_pic_set_size_bits: hdr.st_rps_bits,
            timestamp,
            reference: Default::default(),
        }
    }

    /// Whether the current picture is an IRAP that starts a coded video sequence.
    pub fn starts_cvs(&self) -> bool {
        self.nalu_type.is_irap() && self.no_rasl_output_flag
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
            "Set reference of POC {} to {:?}",
            self.pic_order_cnt_val,
            reference
        );

        self.reference = reference;
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }
}
