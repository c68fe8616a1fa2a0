// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use thiserror::Error;

use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::MAX_DPB_SIZE;
use crate::codec::h265::picture::PictureData;
use crate::codec::h265::picture::Reference;

/// A picture of the DPB and the backend handle of its frame.
#[derive(Clone, Debug)]
pub struct DpbEntry<T> {
    pub pic: Rc<RefCell<PictureData>>,
    pub handle: T,
}

/// POC values of the five lists of the reference picture set, as derived in 8.3.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpsPocs {
    pub st_curr_before: Vec<i32>,
    pub st_curr_after: Vec<i32>,
    pub st_foll: Vec<i32>,
    /// POC and `delta_poc_msb_present_flag`.
    pub lt_curr: Vec<(i32, bool)>,
    pub lt_foll: Vec<(i32, bool)>,
}

/// The reference picture set of the current picture, resolved to positions in the DPB. `None`
/// stands for a picture missing from the DPB.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicSet {
    pub st_curr_before: Vec<Option<usize>>,
    pub st_curr_after: Vec<Option<usize>>,
    pub st_foll: Vec<Option<usize>>,
    pub lt_curr: Vec<Option<usize>>,
    pub lt_foll: Vec<Option<usize>>,
}

impl RefPicSet {
    /// NumPicTotalCurr, the number of entries usable by the current picture.
    pub fn num_pic_total_curr(&self) -> usize {
        self.st_curr_before.len() + self.st_curr_after.len() + self.lt_curr.len()
    }
}

/// RefPicList0 and RefPicList1 of a slice, as positions in the DPB.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencePicLists {
    pub ref_pic_list0: Vec<Option<usize>>,
    pub ref_pic_list1: Vec<Option<usize>>,
}

#[derive(Error, Debug)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
}

pub struct Dpb<T> {
    entries: Vec<DpbEntry<T>>,
    /// sps_max_dec_pic_buffering_minus1 + 1.
    max_num_pics: usize,
    /// sps_max_num_reorder_pics.
    max_num_reorder: usize,
    /// SpsMaxLatencyPictures, if the stream limits output latency.
    max_latency_pictures: Option<u32>,
}

// See https://github.com/rust-lang/rust/issues/26925 on why this can't be derived.
impl<T> Default for Dpb<T> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
            max_num_reorder: Default::default(),
            max_latency_pictures: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|e| &e.pic)
            .enumerate()
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .field("max_num_reorder", &self.max_num_reorder)
            .field("max_latency_pictures", &self.max_latency_pictures)
            .finish()
    }
}

impl<T: Clone> Dpb<T> {
    fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|e| e.pic.borrow())
    }

    fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, PictureData>> {
        self.entries.iter().map(|e| e.pic.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[DpbEntry<T>] {
        &self.entries
    }

    pub fn handles(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.handle)
    }

    /// Applies the DPB limits of `sps`.
    pub fn set_limits(&mut self, sps: &Sps) {
        self.max_num_pics = std::cmp::min(sps.max_dpb_size(), MAX_DPB_SIZE);
        self.max_num_reorder = sps.max_num_reorder();
        self.max_latency_pictures = sps.max_latency_pictures();
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    pub fn mark_all_as_unused_for_ref(&mut self) {
        for mut pic in self.pictures_mut() {
            pic.set_reference(Reference::None);
        }
    }

    /// Position of the reference picture with POC `poc`. Only the bits in `mask` are compared.
    fn find_ref_by_poc(&self, poc: i32, mask: i32, long_term_only: bool) -> Option<usize> {
        self.pictures().position(|p| {
            let candidate = if long_term_only {
                p.is_long_term_ref()
            } else {
                p.is_ref()
            };

            candidate && (p.pic_order_cnt_val & mask) == (poc & mask)
        })
    }

    fn find_short_term_ref_by_poc(&self, poc: i32) -> Option<usize> {
        self.pictures()
            .position(|p| p.is_short_term_ref() && p.pic_order_cnt_val == poc)
    }

    /// Derives the POC lists of the reference picture set of `cur_pic`, per 8.3.2.
    pub fn rps_pocs(cur_pic: &PictureData, hdr: &SliceHeader, sps: &Sps) -> anyhow::Result<RpsPocs> {
        let mut pocs = RpsPocs::default();

        if cur_pic.nalu_type.is_idr() {
            return Ok(pocs);
        }

        let st_rps = hdr
            .short_term_ref_pic_set(sps)
            .context("invalid short-term RPS index")?;

        for i in 0..usize::from(st_rps.num_negative_pics) {
            let poc = cur_pic.pic_order_cnt_val + st_rps.delta_poc_s0[i];
            if st_rps.used_by_curr_pic_s0[i] {
                pocs.st_curr_before.push(poc);
            } else {
                pocs.st_foll.push(poc);
            }
        }

        for i in 0..usize::from(st_rps.num_positive_pics) {
            let poc = cur_pic.pic_order_cnt_val + st_rps.delta_poc_s1[i];
            if st_rps.used_by_curr_pic_s1[i] {
                pocs.st_curr_after.push(poc);
            } else {
                pocs.st_foll.push(poc);
            }
        }

        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();
        for i in 0..hdr.num_long_term() {
            let msb_present = hdr.delta_poc_msb_present_flag[i];
            let mut poc_lt = i32::from(hdr.poc_lsb_lt[i]);

            // (8-5)
            if msb_present {
                poc_lt += cur_pic.pic_order_cnt_val
                    - hdr.delta_poc_msb_cycle_lt[i] as i32 * max_pic_order_cnt_lsb
                    - (cur_pic.pic_order_cnt_val & (max_pic_order_cnt_lsb - 1));
            }

            if hdr.used_by_curr_pic_lt[i] {
                pocs.lt_curr.push((poc_lt, msb_present));
            } else {
                pocs.lt_foll.push((poc_lt, msb_present));
            }
        }

        Ok(pocs)
    }

    /// Marks the pictures of the DPB according to the reference picture set of `cur_pic`, per
    /// 8.3.2. Pictures outside of the set become unused for reference. Returns the POC lists
    /// of the set.
    pub fn apply_rps(
        &mut self,
        cur_pic: &PictureData,
        hdr: &SliceHeader,
        sps: &Sps,
    ) -> anyhow::Result<RpsPocs> {
        if cur_pic.starts_cvs() {
            self.mark_all_as_unused_for_ref();
        }

        let pocs = Self::rps_pocs(cur_pic, hdr, sps)?;
        let lsb_mask = sps.max_pic_order_cnt_lsb() - 1;

        let mut in_rps = vec![false; self.entries.len()];

        for (poc, msb_present) in pocs.lt_curr.iter().chain(pocs.lt_foll.iter()) {
            let mask = if *msb_present { !0 } else { lsb_mask };
            match self.find_ref_by_poc(*poc, mask, false) {
                Some(pos) => {
                    in_rps[pos] = true;
                    self.entries[pos]
                        .pic
                        .borrow_mut()
                        .set_reference(Reference::LongTerm);
                }
                None => log::warn!("No long-term reference found for POC {}", poc),
            }
        }

        let short_term = pocs
            .st_curr_before
            .iter()
            .chain(pocs.st_curr_after.iter())
            .chain(pocs.st_foll.iter());
        for poc in short_term {
            match self.find_short_term_ref_by_poc(*poc) {
                Some(pos) => in_rps[pos] = true,
                None => log::warn!("No short-term reference found for POC {}", poc),
            }
        }

        for (entry, in_rps) in self.entries.iter().zip(in_rps) {
            let mut pic = entry.pic.borrow_mut();
            if !in_rps && pic.is_ref() {
                pic.set_reference(Reference::None);
            }
        }

        Ok(pocs)
    }

    /// Looks up the pictures of `pocs` in the DPB. Must follow [`Dpb::apply_rps`] with no
    /// change in marking in between.
    pub fn ref_pic_set(&self, pocs: &RpsPocs, sps: &Sps) -> RefPicSet {
        let lsb_mask = sps.max_pic_order_cnt_lsb() - 1;
        let long_term = |(poc, msb_present): &(i32, bool)| {
            let mask = if *msb_present { !0 } else { lsb_mask };
            self.find_ref_by_poc(*poc, mask, true)
        };
        let short_term = |poc: &i32| self.find_short_term_ref_by_poc(*poc);

        RefPicSet {
            st_curr_before: pocs.st_curr_before.iter().map(short_term).collect(),
            st_curr_after: pocs.st_curr_after.iter().map(short_term).collect(),
            st_foll: pocs.st_foll.iter().map(short_term).collect(),
            lt_curr: pocs.lt_curr.iter().map(long_term).collect(),
            lt_foll: pocs.lt_foll.iter().map(long_term).collect(),
        }
    }

    /// Builds the reference picture lists of a P or B slice, per 8.3.4.
    pub fn build_ref_pic_lists(
        &self,
        rps: &RefPicSet,
        hdr: &SliceHeader,
    ) -> anyhow::Result<ReferencePicLists> {
        let mut lists = ReferencePicLists::default();

        if hdr.type_.is_i() {
            return Ok(lists);
        }

        if rps.num_pic_total_curr() == 0 {
            return Err(anyhow!("inter slice with an empty reference picture set"));
        }

        let rplm = &hdr.ref_pic_list_modification;

        // (8-8)
        let num_active_l0 = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
        let temp0 = Self::ref_pic_list_temp(
            [&rps.st_curr_before, &rps.st_curr_after, &rps.lt_curr],
            std::cmp::max(num_active_l0, rps.num_pic_total_curr()),
        );

        // (8-9)
        lists.ref_pic_list0 = Self::apply_list_entries(
            &temp0,
            num_active_l0,
            rplm.ref_pic_list_modification_flag_l0,
            &rplm.list_entry_l0,
        )
        .context("while building RefPicList0")?;

        if hdr.type_.is_b() {
            // (8-10)
            let num_active_l1 = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;
            let temp1 = Self::ref_pic_list_temp(
                [&rps.st_curr_after, &rps.st_curr_before, &rps.lt_curr],
                std::cmp::max(num_active_l1, rps.num_pic_total_curr()),
            );

            // (8-11)
            lists.ref_pic_list1 = Self::apply_list_entries(
                &temp1,
                num_active_l1,
                rplm.ref_pic_list_modification_flag_l1,
                &rplm.list_entry_l1,
            )
            .context("while building RefPicList1")?;
        }

        Ok(lists)
    }

    /// Cycles through `sets` until `len` entries are collected.
    fn ref_pic_list_temp(sets: [&Vec<Option<usize>>; 3], len: usize) -> Vec<Option<usize>> {
        sets.into_iter()
            .flat_map(|set| set.iter().copied())
            .cycle()
            .take(len)
            .collect()
    }

    fn apply_list_entries(
        temp: &[Option<usize>],
        num_active: usize,
        modification_flag: bool,
        list_entries: &[u32],
    ) -> anyhow::Result<Vec<Option<usize>>> {
        (0..num_active)
            .map(|r_idx| {
                let idx = if modification_flag {
                    *list_entries
                        .get(r_idx)
                        .with_context(|| format!("missing list_entry {}", r_idx))?
                        as usize
                } else {
                    r_idx
                };

                temp.get(idx)
                    .copied()
                    .with_context(|| format!("list entry {} out of range", idx))
            })
            .collect()
    }

    /// Whether the bumping process must run before the current picture is decoded. See C.5.2.2.
    pub fn needs_bumping(&self) -> bool {
        self.needs_additional_bumping() || self.entries.len() >= self.max_num_pics
    }

    /// Whether the bumping process must run once the current picture is stored. See C.5.2.3.
    pub fn needs_additional_bumping(&self) -> bool {
        let num_needed_for_output = self.pictures().filter(|p| p.needed_for_output).count();

        let over_latency = self.max_latency_pictures.is_some_and(|max_latency| {
            self.pictures()
                .any(|p| p.needed_for_output && p.pic_latency_cnt >= max_latency)
        });

        num_needed_for_output > self.max_num_reorder || over_latency
    }

    /// Position of the picture to output next: the lowest POC, then the earliest stored.
    fn find_lowest_poc_for_bumping(&self) -> Option<usize> {
        self.pictures()
            .enumerate()
            .filter(|(_, pic)| pic.needed_for_output)
            .min_by_key(|(_, pic)| pic.pic_order_cnt_val)
            .map(|(pos, _)| pos)
    }

    /// See C.5.2.4 "Bumping process". Outputs the next picture in POC order and removes it
    /// from the DPB unless it is still a reference.
    pub fn bump(&mut self) -> Option<T> {
        let pos = self.find_lowest_poc_for_bumping()?;
        let entry = self.entries[pos].clone();
        let mut pic = entry.pic.borrow_mut();

        pic.needed_for_output = false;
        debug!("Bumping picture POC {} from the DPB", pic.pic_order_cnt_val);

        if !pic.is_ref() {
            self.entries.remove(pos);
        }

        Some(entry.handle.clone())
    }

    /// Runs the bumping process of C.5.2.2 and returns the output handles.
    pub fn bump_as_needed(&mut self) -> Vec<T> {
        let mut outputs = vec![];

        while self.needs_bumping() {
            match self.bump() {
                Some(handle) => outputs.push(handle),
                None => break,
            }
        }

        outputs
    }

    /// Runs the additional bumping process of C.5.2.3 and returns the output handles.
    pub fn bump_after_store(&mut self) -> Vec<T> {
        let mut outputs = vec![];

        while self.needs_additional_bumping() {
            match self.bump() {
                Some(handle) => outputs.push(handle),
                None => break,
            }
        }

        outputs
    }

    /// Outputs every picture still waiting for output, then empties the DPB.
    pub fn drain(&mut self) -> Vec<T> {
        debug!("Draining the DPB");

        let mut outputs = vec![];
        while let Some(handle) = self.bump() {
            outputs.push(handle);
        }

        self.clear();
        outputs
    }

    pub fn clear(&mut self) {
        debug!("Clearing the DPB");
        self.entries.clear();
    }

    /// A copy of the DPB that shares no picture with it, to roll back to if a picture fails.
    pub fn snapshot(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|e| DpbEntry {
                    pic: Rc::new(RefCell::new(e.pic.borrow().clone())),
                    handle: e.handle.clone(),
                })
                .collect(),
            max_num_pics: self.max_num_pics,
            max_num_reorder: self.max_num_reorder,
            max_latency_pictures: self.max_latency_pictures,
        }
    }

    /// Removes the pictures that are neither needed for output nor used for reference.
    pub fn remove_unused(&mut self) {
        self.entries.retain(|e| {
            let pic = e.pic.borrow();
            let retain = pic.needed_for_output || pic.is_ref();
            if !retain {
                debug!("Removing POC {} from the DPB", pic.pic_order_cnt_val);
            }
            retain
        })
    }

    /// Stores the current picture, per C.5.2.3. It becomes a short-term reference and is
    /// needed for output if its `pic_output_flag` is set.
    pub fn store_picture(
        &mut self,
        picture: Rc<RefCell<PictureData>>,
        handle: T,
    ) -> Result<(), StorePictureError> {
        if self.entries.len() >= self.max_num_pics {
            return Err(StorePictureError::DpbIsFull);
        }

        for mut pic in self.pictures_mut() {
            if pic.needed_for_output {
                pic.pic_latency_cnt += 1;
            }
        }

        {
            let mut pic = picture.borrow_mut();
            pic.needed_for_output = pic.pic_output_flag;
            pic.pic_latency_cnt = 0;
            pic.set_reference(Reference::ShortTerm);

            debug!(
                "Stored picture POC {}, the DPB length is {}",
                pic.pic_order_cnt_val,
                self.entries.len() + 1
            );
        }

        self.entries.push(DpbEntry {
            pic: picture,
            handle,
        });

        Ok(())
    }
}
