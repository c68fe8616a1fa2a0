// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership of the decode targets, the decode heap and the decode-work resources of a session.
//!
//! Frames are owned by the pool and referred to by [`FrameHandle`]. A frame is available as a
//! decode target only once it is neither being decoded, stored in the DPB, waiting for output nor
//! held by the caller. One extra frame is always allocated to stand in for missing references.
//!
//! Reallocating the pool does not invalidate frames that are waiting for output or held by the
//! caller: they are kept aside as stale frames and destroyed once released.

use bytes::BytesMut;
use log::debug;

use crate::backend::BufferId;
use crate::backend::DecodeHeapConfig;
use crate::backend::Fence;
use crate::backend::FenceId;
use crate::backend::HeapId;
use crate::backend::HwDecodeDevice;
use crate::backend::HwResult;
use crate::backend::TextureId;
use crate::PixelLayout;
use crate::Rect;
use crate::Resolution;

/// Smallest bitstream buffer created for a decode-work resource.
const MIN_BITSTREAM_BUFFER_SIZE: usize = 64 * 1024;

/// A frame of a [`FramePool`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    index: usize,
    /// Allocation of the pool the frame belongs to.
    generation: u32,
}

impl FrameHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Properties of the picture last decoded into a frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub timestamp: u64,
    pub coded_resolution: Resolution,
    pub visible_rect: Rect<u32>,
    pub bit_depth: u8,
    pub layout: PixelLayout,
}

#[derive(Debug)]
struct FrameSlot {
    texture: TextureId,
    fence: FenceId,
    /// Value `fence` reaches once the last decode into `texture` is complete.
    fence_value: u64,
    info: FrameInfo,
    decoding: bool,
    in_dpb: bool,
    pending_output: bool,
    held_by_caller: bool,
}

impl FrameSlot {
    fn allocate<D: HwDecodeDevice + ?Sized>(
        device: &mut D,
        resolution: Resolution,
        layout: PixelLayout,
    ) -> HwResult<Self> {
        let texture = device.create_texture(resolution, layout)?;
        let fence = match device.create_fence() {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_texture(texture);
                return Err(e);
            }
        };

        Ok(Self {
            texture,
            fence,
            fence_value: 0,
            info: Default::default(),
            decoding: false,
            in_dpb: false,
            pending_output: false,
            held_by_caller: false,
        })
    }

    fn destroy<D: HwDecodeDevice + ?Sized>(self, device: &mut D) {
        device.destroy_texture(self.texture);
        device.destroy_fence(self.fence);
    }

    fn is_available(&self) -> bool {
        !(self.decoding || self.in_dpb || self.pending_output || self.held_by_caller)
    }

    /// Whether the frame must outlive a reallocation of its pool.
    fn is_out_for_display(&self) -> bool {
        self.pending_output || self.held_by_caller
    }

    fn fence(&self) -> Fence {
        Fence {
            counter: self.fence,
            target_value: self.fence_value,
        }
    }
}

/// Identifies a [`DecodeWork`] of a [`FramePool`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodeWorkId(usize);

/// Per-decode resources: the bitstream upload buffer and the payloads of the decode command.
#[derive(Debug, Default)]
pub struct DecodeWork {
    /// Device buffer and its capacity.
    buffer: Option<(BufferId, usize)>,
    pub bitstream: BytesMut,
    pub picture_params: Vec<u8>,
    pub quantization_matrix: Vec<u8>,
    pub slice_control: Vec<u8>,
    pub reference_textures: Vec<TextureId>,
    in_use: bool,
    /// Completion of the last decode that used this resource.
    last_use: Option<Fence>,
}

impl DecodeWork {
    fn clear(&mut self) {
        self.bitstream.clear();
        self.picture_params.clear();
        self.quantization_matrix.clear();
        self.slice_control.clear();
        self.reference_textures.clear();
    }

    /// Copies `bitstream` to the device buffer, growing the buffer if it is too small.
    pub fn upload<D: HwDecodeDevice + ?Sized>(&mut self, device: &mut D) -> HwResult<BufferId> {
        let len = self.bitstream.len();

        let buffer = match self.buffer {
            Some((buffer, capacity)) if capacity >= len => buffer,
            previous => {
                if let Some((buffer, _)) = previous {
                    device.destroy_buffer(buffer);
                    self.buffer = None;
                }

                let capacity = std::cmp::max(len.next_power_of_two(), MIN_BITSTREAM_BUFFER_SIZE);
                debug!("Allocating a {} bytes bitstream buffer", capacity);
                let buffer = device.create_buffer(capacity)?;
                self.buffer = Some((buffer, capacity));
                buffer
            }
        };

        device.write_buffer(buffer, &self.bitstream)?;
        Ok(buffer)
    }

    fn destroy<D: HwDecodeDevice + ?Sized>(self, device: &mut D) {
        if let Some((buffer, _)) = self.buffer {
            device.destroy_buffer(buffer);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FramesConfig {
    count: usize,
    resolution: Resolution,
    layout: PixelLayout,
}

/// Frame pool, decode heap and decode-work pool of a session.
#[derive(Debug, Default)]
pub struct FramePool {
    generation: u32,
    heap: Option<(HeapId, DecodeHeapConfig)>,
    config: Option<FramesConfig>,
    /// `config.count` decode targets followed by the missing-reference frame.
    slots: Vec<FrameSlot>,
    stale: Vec<(FrameHandle, FrameSlot)>,
    work: Vec<DecodeWork>,
}

impl FramePool {
    pub fn heap(&self) -> Option<HeapId> {
        self.heap.as_ref().map(|(heap, _)| *heap)
    }

    pub fn heap_config(&self) -> Option<&DecodeHeapConfig> {
        self.heap.as_ref().map(|(_, config)| config)
    }

    /// Makes sure the decode heap matches `config`, creating a new one if it doesn't. Returns
    /// whether a new heap was created.
    pub fn ensure_decode_heap<D: HwDecodeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        config: &DecodeHeapConfig,
    ) -> HwResult<bool> {
        if self.heap_config() == Some(config) {
            return Ok(false);
        }

        if let Some((heap, _)) = self.heap.take() {
            device.destroy_decode_heap(heap);
        }

        debug!("Creating decode heap for {:?}", config);
        let heap = device.create_decode_heap(config)?;
        self.heap = Some((heap, config.clone()));

        Ok(true)
    }

    /// Whether [`FramePool::ensure_frame_pool`] would reallocate with these arguments.
    pub fn needs_reallocation(
        &self,
        count: usize,
        resolution: Resolution,
        layout: PixelLayout,
        alignment: u32,
    ) -> bool {
        let config = FramesConfig {
            count,
            resolution: resolution.round_up(alignment),
            layout,
        };

        self.config.as_ref() != Some(&config)
    }

    /// Makes sure the pool holds `count` decode targets of `resolution`, rounded up to
    /// `alignment`, plus the missing-reference frame. Returns whether the frames were
    /// reallocated.
    ///
    /// On failure the pool is left without frames.
    pub fn ensure_frame_pool<D: HwDecodeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        count: usize,
        resolution: Resolution,
        layout: PixelLayout,
        alignment: u32,
    ) -> HwResult<bool> {
        if !self.needs_reallocation(count, resolution, layout, alignment) {
            return Ok(false);
        }

        self.release_frames(device);
        self.generation = self.generation.wrapping_add(1);

        let resolution = resolution.round_up(alignment);
        debug!(
            "Allocating {} frames of {}x{} ({:?})",
            count + 1,
            resolution.width,
            resolution.height,
            layout
        );

        let mut slots = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            match FrameSlot::allocate(device, resolution, layout) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    log::error!("Frame allocation failed: {}", e);
                    for slot in slots {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        self.slots = slots;
        self.config = Some(FramesConfig {
            count,
            resolution,
            layout,
        });

        Ok(true)
    }

    /// Drops the current frames. Frames still out for display become stale.
    fn release_frames<D: HwDecodeDevice + ?Sized>(&mut self, device: &mut D) {
        let generation = self.generation;

        for (index, slot) in std::mem::take(&mut self.slots).into_iter().enumerate() {
            if slot.is_out_for_display() {
                self.stale.push((FrameHandle { index, generation }, slot));
            } else {
                slot.destroy(device);
            }
        }

        self.config = None;
    }

    /// Destroys every device object owned by the pool.
    pub fn clear<D: HwDecodeDevice + ?Sized>(&mut self, device: &mut D) {
        for slot in std::mem::take(&mut self.slots) {
            slot.destroy(device);
        }
        for (_, slot) in std::mem::take(&mut self.stale) {
            slot.destroy(device);
        }
        for work in std::mem::take(&mut self.work) {
            work.destroy(device);
        }
        if let Some((heap, _)) = self.heap.take() {
            device.destroy_decode_heap(heap);
        }

        self.config = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Number of decode targets, the missing-reference frame excluded.
    pub fn num_frames(&self) -> usize {
        self.config.as_ref().map_or(0, |config| config.count)
    }

    pub fn num_available_frames(&self) -> usize {
        self.targets().iter().filter(|slot| slot.is_available()).count()
    }

    pub fn has_free_frame(&self) -> bool {
        self.targets().iter().any(FrameSlot::is_available)
    }

    pub fn num_stale_frames(&self) -> usize {
        self.stale.len()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.config.as_ref().map(|config| config.resolution)
    }

    fn targets(&self) -> &[FrameSlot] {
        &self.slots[..self.num_frames().min(self.slots.len())]
    }

    fn handle(&self, index: usize) -> FrameHandle {
        FrameHandle {
            index,
            generation: self.generation,
        }
    }

    fn slot(&self, handle: FrameHandle) -> Option<&FrameSlot> {
        if handle.generation == self.generation {
            self.slots.get(handle.index)
        } else {
            self.stale
                .iter()
                .find(|(h, _)| *h == handle)
                .map(|(_, slot)| slot)
        }
    }

    fn slot_mut(&mut self, handle: FrameHandle) -> Option<&mut FrameSlot> {
        if handle.generation == self.generation {
            self.slots.get_mut(handle.index)
        } else {
            self.stale
                .iter_mut()
                .find(|(h, _)| *h == handle)
                .map(|(_, slot)| slot)
        }
    }

    /// The frame standing in for references that were never decoded.
    pub fn missing_frame(&self) -> Option<FrameHandle> {
        let config = self.config.as_ref()?;
        Some(self.handle(config.count))
    }

    /// Takes a frame to decode into, or `None` if every frame is in use.
    pub fn acquire_target_frame(&mut self) -> Option<FrameHandle> {
        let index = self.targets().iter().position(FrameSlot::is_available)?;
        self.slots[index].decoding = true;

        Some(self.handle(index))
    }

    /// Marks exactly the frames of `handles` as stored in the DPB, and ends the decoding state of
    /// every frame.
    pub fn sync_dpb(&mut self, handles: impl IntoIterator<Item = FrameHandle>) {
        for slot in &mut self.slots {
            slot.in_dpb = false;
            slot.decoding = false;
        }

        for handle in handles {
            if handle.generation != self.generation {
                continue;
            }
            if let Some(slot) = self.slots.get_mut(handle.index) {
                slot.in_dpb = true;
            }
        }
    }

    pub fn mark_pending_output(&mut self, handle: FrameHandle) -> bool {
        match self.slot_mut(handle) {
            Some(slot) => {
                slot.pending_output = true;
                true
            }
            None => false,
        }
    }

    /// Moves a frame from pending output to held by the caller.
    pub fn take_pending_output(&mut self, handle: FrameHandle) -> bool {
        match self.slot_mut(handle) {
            Some(slot) if slot.pending_output => {
                slot.pending_output = false;
                slot.held_by_caller = true;
                true
            }
            _ => false,
        }
    }

    /// Drops a frame from the pending output set without handing it out.
    pub fn cancel_pending_output<D: HwDecodeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        handle: FrameHandle,
    ) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.pending_output = false;
        }
        self.destroy_released_stale_frames(device);
    }

    /// Returns a frame the caller no longer needs.
    pub fn release_frame<D: HwDecodeDevice + ?Sized>(&mut self, device: &mut D, handle: FrameHandle) {
        match self.slot_mut(handle) {
            Some(slot) => slot.held_by_caller = false,
            None => log::warn!("Releasing unknown frame {:?}", handle),
        }
        self.destroy_released_stale_frames(device);
    }

    fn destroy_released_stale_frames<D: HwDecodeDevice + ?Sized>(&mut self, device: &mut D) {
        let (keep, released): (Vec<_>, Vec<_>) = std::mem::take(&mut self.stale)
            .into_iter()
            .partition(|(_, slot)| slot.is_out_for_display());

        for (handle, slot) in released {
            debug!("Destroying stale frame {:?}", handle);
            slot.destroy(device);
        }
        self.stale = keep;
    }

    pub fn texture(&self, handle: FrameHandle) -> Option<TextureId> {
        self.slot(handle).map(|slot| slot.texture)
    }

    /// Completion fence of the last decode into the frame.
    pub fn fence(&self, handle: FrameHandle) -> Option<Fence> {
        self.slot(handle).map(FrameSlot::fence)
    }

    /// Moves the fence of the frame to its next value and returns it, for a new decode.
    pub fn advance_fence(&mut self, handle: FrameHandle) -> Option<Fence> {
        let slot = self.slot_mut(handle)?;
        slot.fence_value += 1;
        Some(slot.fence())
    }

    pub fn info(&self, handle: FrameHandle) -> Option<&FrameInfo> {
        self.slot(handle).map(|slot| &slot.info)
    }

    pub fn set_info(&mut self, handle: FrameHandle, info: FrameInfo) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.info = info;
        }
    }

    /// Takes a decode-work resource whose previous decode has completed, growing the pool if
    /// there is none.
    pub fn acquire_decode_work<D: HwDecodeDevice + ?Sized>(&mut self, device: &D) -> DecodeWorkId {
        let free = self.work.iter().position(|work| {
            !work.in_use && work.last_use.map_or(true, |fence| fence.is_signaled(device))
        });

        let index = match free {
            Some(index) => index,
            None => {
                self.work.push(Default::default());
                debug!("Growing the decode work pool to {}", self.work.len());
                self.work.len() - 1
            }
        };

        let work = &mut self.work[index];
        work.in_use = true;
        work.clear();

        DecodeWorkId(index)
    }

    /// Returns a decode-work resource. `last_use` guards its reuse if it was submitted.
    pub fn release_decode_work(&mut self, id: DecodeWorkId, last_use: Option<Fence>) {
        if let Some(work) = self.work.get_mut(id.0) {
            work.in_use = false;
            if last_use.is_some() {
                work.last_use = last_use;
            }
        }
    }

    pub fn decode_work_mut(&mut self, id: DecodeWorkId) -> Option<&mut DecodeWork> {
        self.work.get_mut(id.0)
    }

    pub fn num_decode_work(&self) -> usize {
        self.work.len()
    }
}
