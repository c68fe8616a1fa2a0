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

use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::RefPicListModification;
use crate::codec::h264::parser::RefPicMarkingInner;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

/// The initial reference picture lists of a frame, as indices into [`Dpb::entries`]. Derived once
/// per picture, before the first slice is decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencePicLists {
    pub ref_pic_list_p0: Vec<usize>,
    pub ref_pic_list_b0: Vec<usize>,
    pub ref_pic_list_b1: Vec<usize>,
}

// A frame in the DPB along with its decoded frame handle. The handle is `None` for frames
// inferred from a `frame_num` gap.
#[derive(Clone, Debug)]
pub struct DpbEntry<T> {
    pub pic: Rc<RefCell<PictureData>>,
    pub handle: Option<T>,
}

pub struct Dpb<T> {
    entries: Vec<DpbEntry<T>>,
    /// The maximum number of frames that can be stored.
    max_num_pics: usize,
    /// Upper bound on the number of frames that precede any frame in decoding order and follow it
    /// in output order.
    max_num_reorder_frames: usize,
}

#[derive(Debug, Error)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
}

#[derive(Debug, Error)]
pub enum MmcoError {
    #[error("could not find a ShortTerm picture to mark in the DPB")]
    NoShortTermPic,
    #[error("could not find a LongTerm picture to mark in the DPB")]
    NoLongTermPic,
    #[error("a ShortTerm picture was expected to be marked for MMCO=3")]
    ExpectedMarked,
    #[error("picture cannot be marked as nonexisting for MMCO=3")]
    ExpectedExisting,
    #[error("picture number difference {0} is out of range")]
    InvalidDifference(u32),
}

impl<T: Clone> Dpb<T> {
    fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|h| h.pic.borrow())
    }

    fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, PictureData>> {
        self.entries.iter().map(|h| h.pic.borrow_mut())
    }

    fn pic(&self, idx: usize) -> Ref<'_, PictureData> {
        self.entries[idx].pic.borrow()
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

    /// The handles of every stored frame, in decoding order.
    pub fn handles(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(|e| e.handle.as_ref())
    }

    pub fn set_limits(&mut self, max_num_pics: usize, max_num_reorder_frames: usize) {
        self.max_num_pics = max_num_pics;
        self.max_num_reorder_frames = max_num_reorder_frames;
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    pub fn max_num_reorder_frames(&self) -> usize {
        self.max_num_reorder_frames
    }

    pub fn num_ref_frames(&self) -> usize {
        self.pictures().filter(|p| p.is_ref()).count()
    }

    /// Find the short term reference picture with the lowest `frame_num_wrap` value.
    pub fn find_short_term_lowest_frame_num_wrap(&self) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|h| h.pic.borrow().is_short_term_ref())
            .min_by_key(|h| h.pic.borrow().frame_num_wrap)
    }

    pub fn mark_all_as_unused_for_ref(&mut self) {
        for mut picture in self.pictures_mut() {
            picture.set_reference(Reference::None);
        }
    }

    /// Remove the frames that are neither references nor waiting for output.
    pub fn remove_unused(&mut self) {
        self.entries.retain(|handle| {
            let pic = handle.pic.borrow();
            let discard = !pic.is_ref() && !pic.needed_for_output;

            if discard {
                log::debug!("Removing unused picture {:#?}", pic);
            }

            !discard
        });
    }

    fn find_short_term_with_pic_num_pos(&self, pic_num: i32) -> Option<usize> {
        let position = self
            .pictures()
            .position(|p| p.is_short_term_ref() && p.pic_num == pic_num);

        log::debug!(
            "find_short_term_with_pic_num: {}, found position {:?}",
            pic_num,
            position
        );

        position
    }

    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<&DpbEntry<T>> {
        let position = self.find_short_term_with_pic_num_pos(pic_num)?;
        Some(&self.entries[position])
    }

    fn find_long_term_with_long_term_pic_num_pos(&self, long_term_pic_num: i32) -> Option<usize> {
        let position = self
            .pictures()
            .position(|p| p.is_long_term_ref() && p.long_term_pic_num == long_term_pic_num);

        log::debug!(
            "find_long_term_with_long_term_pic_num: {}, found position {:?}",
            long_term_pic_num,
            position
        );

        position
    }

    pub fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: i32,
    ) -> Option<&DpbEntry<T>> {
        let position = self.find_long_term_with_long_term_pic_num_pos(long_term_pic_num)?;
        Some(&self.entries[position])
    }

    /// Store a picture and its decoded frame handle in the DPB.
    pub fn store_picture(
        &mut self,
        picture: Rc<RefCell<PictureData>>,
        handle: Option<T>,
    ) -> Result<(), StorePictureError> {
        if self.entries.len() >= self.max_num_pics {
            return Err(StorePictureError::DpbIsFull);
        }

        {
            let mut pic = picture.borrow_mut();

            // C.4.2: "non-existing" frames are never output.
            if pic.nonexisting {
                pic.needed_for_output = false;
            }

            debug!(
                "Stored picture POC {:?}, frame_num {}, the DPB length is {:?}",
                pic.pic_order_cnt,
                pic.frame_num,
                self.entries.len()
            );
        }

        self.entries.push(DpbEntry {
            pic: picture,
            handle,
        });

        Ok(())
    }

    pub fn has_empty_frame_buffer(&self) -> bool {
        self.entries.len() < self.max_num_pics
    }

    /// Whether the DPB needs bumping before `to_insert` can be handled, as described by clauses
    /// 1, 4, 5 and 6 of C.4.5.3.
    pub fn needs_bumping(&self, to_insert: &PictureData) -> bool {
        if self.has_empty_frame_buffer() {
            return false;
        }

        if to_insert.nonexisting {
            return true;
        }

        if to_insert.is_ref() && !to_insert.is_idr() {
            return true;
        }

        let lowest_poc = match self.find_lowest_poc_for_bumping() {
            Some(handle) => handle.pic.borrow().pic_order_cnt,
            None => return false,
        };

        to_insert.pic_order_cnt > lowest_poc
    }

    /// The frame waiting for output with the lowest POC. Ties go to the frame decoded first.
    fn find_lowest_poc_for_bumping(&self) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|handle| handle.pic.borrow().needed_for_output)
            .min_by_key(|handle| handle.pic.borrow().pic_order_cnt)
    }

    /// Outputs the frame with the lowest POC, as per the bumping process of C.4.5.3. The frame
    /// stays in the DPB if it is still a reference.
    fn bump(&mut self) -> Option<Option<T>> {
        let dpb_entry = self.find_lowest_poc_for_bumping()?.clone();
        let mut pic = dpb_entry.pic.borrow_mut();

        debug!(
            "Bumping picture POC {} frame_num {} from the dpb",
            pic.pic_order_cnt, pic.frame_num
        );

        pic.needed_for_output = false;
        Some(dpb_entry.handle)
    }

    /// Bumps the DPB until `current_pic` can be handled. See C.4.5.3.
    pub fn bump_as_needed(&mut self, current_pic: &PictureData) -> Vec<Option<T>> {
        let mut pics = vec![];
        while self.needs_bumping(current_pic) && self.len() >= self.max_num_reorder_frames {
            match self.bump() {
                Some(pic) => pics.push(pic),
                None => return pics,
            }
            self.remove_unused();
        }

        pics
    }

    /// Outputs frames while more of them wait for output than the stream may reorder.
    pub fn bump_for_reorder(&mut self) -> Vec<Option<T>> {
        let mut pics = vec![];
        while self.pictures().filter(|p| p.needed_for_output).count()
            > self.max_num_reorder_frames
        {
            match self.bump() {
                Some(pic) => pics.push(pic),
                None => break,
            }
            self.remove_unused();
        }

        pics
    }

    /// Outputs every frame still waiting for output, then empties the DPB.
    pub fn drain(&mut self) -> Vec<Option<T>> {
        debug!("Draining the DPB.");

        let mut pics = vec![];

        while let Some(pic) = self.bump() {
            pics.push(pic);
        }

        self.clear();

        pics
    }

    /// Drops every frame, keeping the limits.
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
            max_num_reorder_frames: self.max_num_reorder_frames,
        }
    }

    /// Derives `FrameNumWrap`, `PicNum` and `LongTermPicNum` of every reference frame relative
    /// to the current `frame_num`. See 8.2.4.1.
    pub fn update_pic_nums(&mut self, frame_num: u32, max_frame_num: u32) {
        for mut pic in self.pictures_mut() {
            match *pic.reference() {
                Reference::None => (),
                Reference::LongTerm => {
                    pic.long_term_pic_num = pic.long_term_frame_idx as i32;
                }
                Reference::ShortTerm => {
                    pic.frame_num_wrap = if pic.frame_num > frame_num {
                        pic.frame_num as i32 - max_frame_num as i32
                    } else {
                        pic.frame_num as i32
                    };

                    pic.pic_num = pic.frame_num_wrap;
                }
            }
        }
    }

    /// 8.2.5.3. Unmarks the oldest short-term references so that `current` fits within
    /// `max_num_ref_frames`.
    pub fn sliding_window_marking(&mut self, max_num_ref_frames: u8) -> anyhow::Result<()> {
        let mut num_ref_pics = self.num_ref_frames();
        let max_num_ref_frames = usize::from(std::cmp::max(1, max_num_ref_frames));

        if num_ref_pics < max_num_ref_frames {
            return Ok(());
        }

        while num_ref_pics >= max_num_ref_frames {
            let to_unmark = self
                .find_short_term_lowest_frame_num_wrap()
                .context("Could not find a ShortTerm picture to unmark in the DPB")?;

            to_unmark.pic.borrow_mut().set_reference(Reference::None);
            num_ref_pics -= 1;
        }

        self.remove_unused();

        Ok(())
    }

    fn pic_num_x(pic: &PictureData, marking: &RefPicMarkingInner) -> Result<i32, MmcoError> {
        let difference = marking.difference_of_pic_nums_minus1;
        let difference = i32::try_from(difference)
            .ok()
            .and_then(|d| d.checked_add(1))
            .ok_or(MmcoError::InvalidDifference(difference))?;

        Ok(pic.pic_num - difference)
    }

    /// Unmarks the long-term frame using `long_term_frame_idx`, if any.
    fn unmark_long_term_frame_idx(&mut self, long_term_frame_idx: u32) {
        for mut pic in self.pictures_mut() {
            if pic.is_long_term_ref() && pic.long_term_frame_idx == long_term_frame_idx {
                pic.set_reference(Reference::None);
            }
        }
    }

    /// Marks a short-term frame as unused for reference.
    pub fn mmco_op_1(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = Self::pic_num_x(pic, marking)?;

        log::debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic)?;

        to_mark.pic.borrow_mut().set_reference(Reference::None);

        Ok(())
    }

    /// Marks a long-term frame as unused for reference.
    pub fn mmco_op_2(&mut self, marking: &RefPicMarkingInner) -> Result<(), MmcoError> {
        log::debug!(
            "MMCO op 2 for long_term_pic_num {}",
            marking.long_term_pic_num
        );
        log::trace!("Dpb state before MMCO=2: {:#?}", self);

        let long_term_pic_num =
            i32::try_from(marking.long_term_pic_num).map_err(|_| MmcoError::NoLongTermPic)?;
        let to_mark = self
            .find_long_term_with_long_term_pic_num(long_term_pic_num)
            .ok_or(MmcoError::NoLongTermPic)?;

        to_mark.pic.borrow_mut().set_reference(Reference::None);

        Ok(())
    }

    /// Turns a short-term frame into a long-term one.
    pub fn mmco_op_3(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = Self::pic_num_x(pic, marking)?;

        log::debug!("MMCO op 3 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=3: {:#?}", self);

        let to_mark_as_long_pos = self
            .find_short_term_with_pic_num_pos(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic)?;

        {
            let to_mark_as_long = self.pic(to_mark_as_long_pos);
            if !to_mark_as_long.is_short_term_ref() {
                return Err(MmcoError::ExpectedMarked);
            }

            if to_mark_as_long.nonexisting {
                return Err(MmcoError::ExpectedExisting);
            }
        }

        let long_term_frame_idx = marking.long_term_frame_idx;
        self.unmark_long_term_frame_idx(long_term_frame_idx);

        let mut to_mark_as_long = self.entries[to_mark_as_long_pos].pic.borrow_mut();
        to_mark_as_long.set_reference(Reference::LongTerm);
        to_mark_as_long.long_term_frame_idx = long_term_frame_idx;

        Ok(())
    }

    /// Unmarks the long-term frames above the new maximum index, which is returned.
    pub fn mmco_op_4(&mut self, marking: &RefPicMarkingInner) -> MaxLongTermFrameIdx {
        log::debug!(
            "MMCO op 4, max_long_term_frame_idx: {:?}",
            marking.max_long_term_frame_idx
        );
        log::trace!("Dpb state before MMCO=4: {:#?}", self);

        for mut dpb_pic in self
            .pictures_mut()
            .filter(|pic| pic.is_long_term_ref())
            .filter(|pic| marking.max_long_term_frame_idx < pic.long_term_frame_idx)
        {
            dpb_pic.set_reference(Reference::None);
        }

        marking.max_long_term_frame_idx
    }

    /// Unmarks every reference and resets the numbering of `pic` as in 8.2.1. Returns the new
    /// `max_long_term_frame_idx`.
    pub fn mmco_op_5(&mut self, pic: &mut PictureData) -> MaxLongTermFrameIdx {
        log::debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");
        log::trace!("Dpb state before MMCO=5: {:#?}", self);

        self.mark_all_as_unused_for_ref();

        pic.has_mmco_5 = true;

        // The picture is inferred to have had frame_num 0 and its POC is made relative to itself.
        pic.frame_num = 0;
        let temp_pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
        pic.top_field_order_cnt -= temp_pic_order_cnt;
        pic.bottom_field_order_cnt -= temp_pic_order_cnt;
        pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);

        MaxLongTermFrameIdx::NoLongTermFrameIndices
    }

    /// Marks the current frame as long-term.
    pub fn mmco_op_6(&mut self, pic: &mut PictureData, marking: &RefPicMarkingInner) {
        let long_term_frame_idx = marking.long_term_frame_idx;

        log::debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        log::trace!("Dpb state before MMCO=6: {:#?}", self);

        self.unmark_long_term_frame_idx(long_term_frame_idx);

        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;
    }

    fn debug_ref_list(&self, list: &[usize], name: &str) {
        debug!(
            "{}: (reference, pic_num|long_term_pic_num, POC) {:?}",
            name,
            list.iter()
                .map(|&idx| {
                    let p = self.pic(idx);
                    match p.reference() {
                        Reference::LongTerm => ("LongTerm", p.long_term_pic_num, p.pic_order_cnt),
                        _ => ("ShortTerm", p.pic_num, p.pic_order_cnt),
                    }
                })
                .collect::<Vec<_>>()
        );
    }

    fn short_term_ref_indices(&self) -> Vec<usize> {
        (0..self.entries.len())
            .filter(|&idx| self.pic(idx).is_short_term_ref())
            .collect()
    }

    fn long_term_ref_indices(&self) -> Vec<usize> {
        let mut long_term: Vec<usize> = (0..self.entries.len())
            .filter(|&idx| {
                let pic = self.pic(idx);
                pic.is_long_term_ref() && !pic.nonexisting
            })
            .collect();

        long_term.sort_by_key(|&idx| self.pic(idx).long_term_pic_num);
        long_term
    }

    /// 8.2.4.2.1: short-term frames by descending `PicNum`, then long-term frames by ascending
    /// `LongTermPicNum`.
    fn build_ref_pic_list_p(&self) -> Vec<usize> {
        let mut ref_pic_list_p0 = self.short_term_ref_indices();
        ref_pic_list_p0.sort_by_key(|&idx| std::cmp::Reverse(self.pic(idx).pic_num));
        ref_pic_list_p0.extend(self.long_term_ref_indices());

        self.debug_ref_list(&ref_pic_list_p0, "ref_pic_list_p0");

        ref_pic_list_p0
    }

    /// 8.2.4.2.3: short-term frames before the current one by descending POC, the ones after it by
    /// ascending POC (reversed for list 1), then long-term frames.
    fn build_ref_pic_list_b(&self, cur_pic: &PictureData) -> (Vec<usize>, Vec<usize>) {
        let mut short_term_refs = self.short_term_ref_indices();

        // Frames inferred from a frame_num gap have no meaningful POC with POC type 0.
        if cur_pic.pic_order_cnt_type == 0 {
            short_term_refs.retain(|&idx| !self.pic(idx).nonexisting);
        }

        let cur_poc = cur_pic.pic_order_cnt;
        let (mut before, mut after): (Vec<usize>, Vec<usize>) = short_term_refs
            .into_iter()
            .partition(|&idx| self.pic(idx).pic_order_cnt < cur_poc);

        before.sort_by_key(|&idx| std::cmp::Reverse(self.pic(idx).pic_order_cnt));
        after.sort_by_key(|&idx| self.pic(idx).pic_order_cnt);

        let long_term_refs = self.long_term_ref_indices();

        let mut ref_pic_list_b0 = before.clone();
        ref_pic_list_b0.extend(&after);
        ref_pic_list_b0.extend(&long_term_refs);

        let mut ref_pic_list_b1 = after;
        ref_pic_list_b1.extend(before);
        ref_pic_list_b1.extend(long_term_refs);

        // When RefPicList1 has more than one entry and is identical to RefPicList0, its first two
        // entries are switched.
        if ref_pic_list_b1.len() > 1 && ref_pic_list_b0 == ref_pic_list_b1 {
            ref_pic_list_b1.swap(0, 1);
        }

        self.debug_ref_list(&ref_pic_list_b0, "ref_pic_list_b0");
        self.debug_ref_list(&ref_pic_list_b1, "ref_pic_list_b1");

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// Builds the initial reference picture lists of `cur_pic`. `update_pic_nums` must have been
    /// called for the current frame first.
    pub fn build_ref_pic_lists(&self, cur_pic: &PictureData) -> ReferencePicLists {
        let ref_pic_list_p0 = self.build_ref_pic_list_p();
        let (ref_pic_list_b0, ref_pic_list_b1) = self.build_ref_pic_list_b(cur_pic);

        ReferencePicLists {
            ref_pic_list_p0,
            ref_pic_list_b0,
            ref_pic_list_b1,
        }
    }

    /// Applies the modifications of a slice header to an initial list, then truncates it to
    /// `num_ref_idx_active` entries. See 8.2.4.3.
    pub fn modify_ref_pic_list(
        &self,
        cur_pic: &PictureData,
        mut ref_pic_list: Vec<usize>,
        num_ref_idx_active: usize,
        modifications: &[RefPicListModification],
        max_pic_num: i32,
    ) -> anyhow::Result<Vec<usize>> {
        ref_pic_list.truncate(num_ref_idx_active);

        let mut pic_num_lx_pred = cur_pic.pic_num;
        let mut ref_idx_lx = 0;

        for modification in modifications {
            let target = match modification.modification_of_pic_nums_idc {
                idc @ (0 | 1) => {
                    let abs_diff_pic_num = i32::try_from(modification.abs_diff_pic_num_minus1)?
                        .checked_add(1)
                        .context("abs_diff_pic_num_minus1 is out of range")?;

                    let pic_num_lx_no_wrap = if idc == 0 {
                        let no_wrap = pic_num_lx_pred - abs_diff_pic_num;
                        if no_wrap < 0 {
                            no_wrap + max_pic_num
                        } else {
                            no_wrap
                        }
                    } else {
                        let no_wrap = pic_num_lx_pred + abs_diff_pic_num;
                        if no_wrap >= max_pic_num {
                            no_wrap - max_pic_num
                        } else {
                            no_wrap
                        }
                    };

                    pic_num_lx_pred = pic_num_lx_no_wrap;

                    let pic_num_lx = if pic_num_lx_no_wrap > cur_pic.pic_num {
                        pic_num_lx_no_wrap - max_pic_num
                    } else {
                        pic_num_lx_no_wrap
                    };

                    self.find_short_term_with_pic_num_pos(pic_num_lx)
                        .with_context(|| {
                            format!("No ShortTerm reference found with pic_num {}", pic_num_lx)
                        })?
                }
                2 => {
                    let long_term_pic_num = i32::try_from(modification.long_term_pic_num)?;
                    self.find_long_term_with_long_term_pic_num_pos(long_term_pic_num)
                        .with_context(|| {
                            format!(
                                "No LongTerm reference found with long_term_pic_num {}",
                                long_term_pic_num
                            )
                        })?
                }
                3 => break,
                idc => return Err(anyhow!("unexpected modification_of_pic_nums_idc {}", idc)),
            };

            ref_pic_list.insert(ref_idx_lx.min(ref_pic_list.len()), target);
            ref_idx_lx += 1;

            // The picture now at ref_idx_lx - 1 may not appear again further down the list.
            let mut idx = ref_idx_lx;
            while idx < ref_pic_list.len() {
                if ref_pic_list[idx] == target {
                    ref_pic_list.remove(idx);
                } else {
                    idx += 1;
                }
            }

            ref_pic_list.truncate(num_ref_idx_active);
        }

        Ok(ref_pic_list)
    }
}

// See https://github.com/rust-lang/rust/issues/26925 on why this can't be derived.
impl<T> Default for Dpb<T> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
            max_num_reorder_frames: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|h| &h.pic)
            .enumerate()
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pics", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .field("max_num_reorder_frames", &self.max_num_reorder_frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::picture::IsIdr;

    fn frame(frame_num: u32, poc: i32, reference: Reference) -> Rc<RefCell<PictureData>> {
        let mut pic = PictureData {
            frame_num,
            pic_order_cnt: poc,
            top_field_order_cnt: poc,
            bottom_field_order_cnt: poc,
            nal_ref_idc: u8::from(reference != Reference::None),
            needed_for_output: true,
            ..Default::default()
        };
        pic.set_reference(reference);
        Rc::new(RefCell::new(pic))
    }

    fn dpb_with(frames: &[(u32, i32)], max_num_pics: usize) -> Dpb<u32> {
        let mut dpb = Dpb::default();
        dpb.set_limits(max_num_pics, max_num_pics);
        for (handle, &(frame_num, poc)) in frames.iter().enumerate() {
            dpb.store_picture(frame(frame_num, poc, Reference::ShortTerm), Some(handle as u32))
                .unwrap();
        }
        dpb
    }

    fn current(frame_num: u32, poc: i32) -> PictureData {
        let pic = frame(frame_num, poc, Reference::ShortTerm);
        let mut pic = pic.borrow().clone();
        pic.pic_num = frame_num as i32;
        pic
    }

    fn handles(dpb: &Dpb<u32>, list: &[usize]) -> Vec<u32> {
        list.iter()
            .map(|&idx| dpb.entries()[idx].handle.unwrap())
            .collect()
    }

    #[test]
    fn store_rejects_when_full() {
        let mut dpb = dpb_with(&[(0, 0)], 1);
        assert!(!dpb.has_empty_frame_buffer());
        assert!(matches!(
            dpb.store_picture(frame(1, 2, Reference::ShortTerm), Some(1)),
            Err(StorePictureError::DpbIsFull)
        ));
    }

    #[test]
    fn bump_outputs_lowest_poc_first_and_keeps_decode_order_on_ties() {
        let mut dpb = dpb_with(&[(0, 4), (1, 2), (2, 2), (3, 0)], 4);

        assert_eq!(dpb.drain(), vec![Some(3), Some(1), Some(2), Some(0)]);
        assert!(dpb.is_empty());
        assert_eq!(dpb.max_num_pics(), 4);
    }

    #[test]
    fn bump_for_reorder_respects_reorder_depth() {
        let mut dpb = dpb_with(&[(0, 0), (1, 8), (2, 4)], 4);
        dpb.set_limits(4, 2);

        assert_eq!(dpb.bump_for_reorder(), vec![Some(0)]);
        assert!(dpb.bump_for_reorder().is_empty());

        // Outputting a reference frame keeps it in the DPB.
        assert_eq!(dpb.len(), 3);
    }

    #[test]
    fn needs_bumping_for_non_idr_reference() {
        let dpb = dpb_with(&[(0, 0), (1, 2)], 2);
        assert!(dpb.needs_bumping(&current(2, 4)));

        let mut idr = current(0, 0);
        idr.is_idr = IsIdr::Yes { idr_pic_id: 1 };
        idr.set_reference(Reference::None);
        // Nothing waiting for output has a lower POC.
        assert!(!dpb.needs_bumping(&idr));
    }

    #[test]
    fn sliding_window_unmarks_oldest_frame() {
        let mut dpb = dpb_with(&[(14, 0), (15, 2), (0, 4)], 4);
        // Frame 0 follows frame 15 after a wrap of MaxFrameNum 16.
        dpb.update_pic_nums(1, 16);
        dpb.drain_outputs_for_test();

        dpb.sliding_window_marking(3).unwrap();

        let frame_nums: Vec<u32> = dpb.pictures().map(|p| p.frame_num).collect();
        assert_eq!(frame_nums, vec![15, 0]);
    }

    #[test]
    fn p_list_orders_by_pic_num_then_long_term() {
        let mut dpb = dpb_with(&[(0, 0), (1, 2), (2, 4), (3, 6)], 4);
        {
            let mut lt = dpb.entries()[1].pic.borrow_mut();
            lt.set_reference(Reference::LongTerm);
            lt.long_term_frame_idx = 0;
        }

        let cur = current(4, 8);
        dpb.update_pic_nums(cur.frame_num, 16);
        let lists = dpb.build_ref_pic_lists(&cur);

        assert_eq!(handles(&dpb, &lists.ref_pic_list_p0), vec![3, 2, 0, 1]);
    }

    #[test]
    fn b_lists_split_around_current_poc() {
        let mut dpb = dpb_with(&[(0, 0), (1, 8), (2, 4), (3, 12)], 4);

        let cur = current(4, 6);
        dpb.update_pic_nums(cur.frame_num, 16);
        let lists = dpb.build_ref_pic_lists(&cur);

        assert_eq!(handles(&dpb, &lists.ref_pic_list_b0), vec![2, 0, 1, 3]);
        assert_eq!(handles(&dpb, &lists.ref_pic_list_b1), vec![1, 3, 2, 0]);
    }

    #[test]
    fn b1_is_swapped_when_identical_to_b0() {
        let mut dpb = dpb_with(&[(0, 0), (1, 2)], 4);

        let cur = current(2, 6);
        dpb.update_pic_nums(cur.frame_num, 16);
        let lists = dpb.build_ref_pic_lists(&cur);

        assert_eq!(handles(&dpb, &lists.ref_pic_list_b0), vec![1, 0]);
        assert_eq!(handles(&dpb, &lists.ref_pic_list_b1), vec![0, 1]);
    }

    #[test]
    fn nonexisting_frames_are_left_out_of_b_lists() {
        let mut dpb = dpb_with(&[(0, 0)], 4);
        let gap = Rc::new(RefCell::new(PictureData::new_non_existing(1, 0)));
        dpb.store_picture(gap, None).unwrap();

        let cur = current(2, 4);
        dpb.update_pic_nums(cur.frame_num, 16);
        let lists = dpb.build_ref_pic_lists(&cur);

        assert_eq!(lists.ref_pic_list_p0, vec![1, 0]);
        assert_eq!(lists.ref_pic_list_b0, vec![0]);
    }

    #[test]
    fn modification_moves_pictures_to_the_front() {
        let mut dpb = dpb_with(&[(0, 0), (1, 2), (2, 4)], 4);
        let cur = current(3, 6);
        dpb.update_pic_nums(cur.frame_num, 16);
        let lists = dpb.build_ref_pic_lists(&cur);

        // pic_num 3 - (1 + 1) = 1, then 1 - (0 + 1) = 0.
        let modifications = [
            RefPicListModification {
                modification_of_pic_nums_idc: 0,
                abs_diff_pic_num_minus1: 1,
                ..Default::default()
            },
            RefPicListModification {
                modification_of_pic_nums_idc: 0,
                abs_diff_pic_num_minus1: 0,
                ..Default::default()
            },
        ];

        let list = dpb
            .modify_ref_pic_list(&cur, lists.ref_pic_list_p0, 3, &modifications, 16)
            .unwrap();
        assert_eq!(handles(&dpb, &list), vec![1, 0, 2]);

        let missing = [RefPicListModification {
            modification_of_pic_nums_idc: 2,
            long_term_pic_num: 5,
            ..Default::default()
        }];
        assert!(dpb.modify_ref_pic_list(&cur, vec![0], 1, &missing, 16).is_err());
    }

    #[test]
    fn mmco_operations() {
        let mut dpb = dpb_with(&[(0, 0), (1, 2), (2, 4)], 4);
        let mut cur = current(3, 6);
        dpb.update_pic_nums(cur.frame_num, 16);

        // Unmark pic_num 3 - (1 + 1) = 1.
        let op1 = RefPicMarkingInner {
            memory_management_control_operation: 1,
            difference_of_pic_nums_minus1: 1,
            ..Default::default()
        };
        dpb.mmco_op_1(&cur, &op1).unwrap();
        assert!(!dpb.entries()[1].pic.borrow().is_ref());
        assert!(matches!(
            dpb.mmco_op_1(&cur, &op1),
            Err(MmcoError::NoShortTermPic)
        ));

        // Make pic_num 0 long-term with index 2.
        let op3 = RefPicMarkingInner {
            memory_management_control_operation: 3,
            difference_of_pic_nums_minus1: 2,
            long_term_frame_idx: 2,
            ..Default::default()
        };
        dpb.mmco_op_3(&cur, &op3).unwrap();
        assert!(dpb.entries()[0].pic.borrow().is_long_term_ref());

        // The current frame takes index 2 over.
        let op6 = RefPicMarkingInner {
            memory_management_control_operation: 6,
            long_term_frame_idx: 2,
            ..Default::default()
        };
        dpb.mmco_op_6(&mut cur, &op6);
        assert!(cur.is_long_term_ref());
        assert!(!dpb.entries()[0].pic.borrow().is_ref());

        let op4 = RefPicMarkingInner {
            memory_management_control_operation: 4,
            max_long_term_frame_idx: MaxLongTermFrameIdx::NoLongTermFrameIndices,
            ..Default::default()
        };
        assert_eq!(
            dpb.mmco_op_4(&op4),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );

        dpb.mmco_op_5(&mut cur);
        assert!(cur.has_mmco_5);
        assert_eq!(cur.frame_num, 0);
        assert_eq!(cur.pic_order_cnt, 0);
        assert_eq!(dpb.num_ref_frames(), 0);
    }

    #[test]
    fn mmco_op_2_unmarks_long_term() {
        let mut dpb = dpb_with(&[(0, 0)], 4);
        {
            let mut lt = dpb.entries()[0].pic.borrow_mut();
            lt.set_reference(Reference::LongTerm);
            lt.long_term_frame_idx = 3;
        }
        dpb.update_pic_nums(1, 16);

        let op2 = RefPicMarkingInner {
            memory_management_control_operation: 2,
            long_term_pic_num: 3,
            ..Default::default()
        };
        dpb.mmco_op_2(&op2).unwrap();
        assert_eq!(dpb.num_ref_frames(), 0);
        assert!(matches!(dpb.mmco_op_2(&op2), Err(MmcoError::NoLongTermPic)));
    }

    impl Dpb<u32> {
        /// Marks every frame as already output.
        fn drain_outputs_for_test(&mut self) {
            for mut pic in self.pictures_mut() {
                pic.needed_for_output = false;
            }
        }
    }
}
