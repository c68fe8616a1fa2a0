// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy device whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! Decodes complete as soon as they are signaled, unless `hold_completion` is set, in which case
//! signals are queued until [`DummyDevice::complete_all`] is called. Waits never block.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::backend::BufferId;
use crate::backend::DecodeCommand;
use crate::backend::DecodeHeapConfig;
use crate::backend::Fence;
use crate::backend::FenceId;
use crate::backend::HeapId;
use crate::backend::HwDecodeDevice;
use crate::backend::HwError;
use crate::backend::HwResult;
use crate::backend::ResourceBarrier;
use crate::backend::TextureId;
use crate::backend::VideoCodec;
use crate::PixelLayout;
use crate::Resolution;

/// Owned copy of a decode command.
#[derive(Clone, Debug)]
pub struct RecordedDecode {
    pub codec: VideoCodec,
    pub heap: HeapId,
    pub target: TextureId,
    pub bitstream: Vec<u8>,
    pub picture_params: Vec<u8>,
    pub quantization_matrix: Option<Vec<u8>>,
    pub slice_control: Vec<u8>,
    pub reference_textures: Vec<TextureId>,
}

#[derive(Debug, Default)]
pub struct DummyDevice {
    pub(crate) next_id: u32,
    pub(crate) heaps: BTreeMap<HeapId, DecodeHeapConfig>,
    pub(crate) heaps_created: usize,
    pub(crate) textures: BTreeMap<TextureId, (Resolution, PixelLayout)>,
    pub(crate) textures_created: usize,
    pub(crate) buffers: BTreeMap<BufferId, (usize, Vec<u8>)>,
    pub(crate) fences: BTreeMap<FenceId, u64>,
    pub(crate) pending_signals: Vec<Fence>,
    pub(crate) recorded_barriers: Vec<ResourceBarrier>,
    pub(crate) recorded_decodes: Vec<RecordedDecode>,

    /// Queue signals instead of completing them.
    pub hold_completion: bool,
    /// Number of live textures past which texture creation fails.
    pub texture_budget: Option<usize>,
    /// Error code the next `record_decode` fails with.
    pub fail_next_record: Option<i32>,
    /// Error code the next `execute` fails with.
    pub fail_next_execute: Option<i32>,
    /// Error code the next `signal` fails with.
    pub fail_next_signal: Option<i32>,
    /// Barriers of every executed command list.
    pub barriers: Vec<ResourceBarrier>,
    /// Every executed decode.
    pub decodes: Vec<RecordedDecode>,
}

impl DummyDevice {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Completes every queued signal.
    pub fn complete_all(&mut self) {
        for fence in std::mem::take(&mut self.pending_signals) {
            self.complete(fence);
        }
    }

    fn complete(&mut self, fence: Fence) {
        if let Some(value) = self.fences.get_mut(&fence.counter) {
            *value = std::cmp::max(*value, fence.target_value);
        }
    }

    pub fn num_heaps(&self) -> usize {
        self.heaps.len()
    }

    pub fn heaps_created(&self) -> usize {
        self.heaps_created
    }

    pub fn heap_config(&self, heap: HeapId) -> Option<&DecodeHeapConfig> {
        self.heaps.get(&heap)
    }

    pub fn num_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn textures_created(&self) -> usize {
        self.textures_created
    }

    pub fn texture_resolution(&self, texture: TextureId) -> Option<Resolution> {
        self.textures.get(&texture).map(|(resolution, _)| *resolution)
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|(_, data)| data.as_slice())
    }

    pub fn num_fences(&self) -> usize {
        self.fences.len()
    }
}

impl HwDecodeDevice for DummyDevice {
    fn create_decode_heap(&mut self, config: &DecodeHeapConfig) -> HwResult<HeapId> {
        let heap = HeapId(self.next_id());
        self.heaps.insert(heap, config.clone());
        self.heaps_created += 1;
        Ok(heap)
    }

    fn destroy_decode_heap(&mut self, heap: HeapId) {
        self.heaps.remove(&heap);
    }

    fn create_texture(
        &mut self,
        resolution: Resolution,
        layout: PixelLayout,
    ) -> HwResult<TextureId> {
        if matches!(self.texture_budget, Some(budget) if self.textures.len() >= budget) {
            return Err(HwError::OutOfResources);
        }

        let texture = TextureId(self.next_id());
        self.textures.insert(texture, (resolution, layout));
        self.textures_created += 1;
        Ok(texture)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn create_buffer(&mut self, size: usize) -> HwResult<BufferId> {
        let buffer = BufferId(self.next_id());
        self.buffers.insert(buffer, (size, Vec::new()));
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> HwResult<()> {
        match self.buffers.get_mut(&buffer) {
            Some((size, contents)) if *size >= data.len() => {
                contents.clear();
                contents.extend_from_slice(data);
                Ok(())
            }
            _ => Err(HwError::Failed(-1)),
        }
    }

    fn create_fence(&mut self) -> HwResult<FenceId> {
        let fence = FenceId(self.next_id());
        self.fences.insert(fence, 0);
        Ok(fence)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn completed_value(&self, fence: FenceId) -> u64 {
        self.fences.get(&fence).copied().unwrap_or(0)
    }

    fn wait_fence(&self, fence: FenceId, value: u64, _: Duration) -> bool {
        self.completed_value(fence) >= value
    }

    fn record_barriers(&mut self, barriers: &[ResourceBarrier]) -> HwResult<()> {
        self.recorded_barriers.extend_from_slice(barriers);
        Ok(())
    }

    fn record_decode(&mut self, command: &DecodeCommand) -> HwResult<()> {
        if let Some(code) = self.fail_next_record.take() {
            return Err(HwError::Failed(code));
        }

        let bitstream = self
            .buffers
            .get(&command.bitstream)
            .and_then(|(_, data)| data.get(..command.bitstream_len))
            .ok_or(HwError::Failed(-2))?
            .to_vec();

        self.recorded_decodes.push(RecordedDecode {
            codec: command.codec,
            heap: command.heap,
            target: command.target,
            bitstream,
            picture_params: command.picture_params.to_vec(),
            quantization_matrix: command.quantization_matrix.map(|m| m.to_vec()),
            slice_control: command.slice_control.to_vec(),
            reference_textures: command.reference_textures.to_vec(),
        });

        Ok(())
    }

    fn discard_commands(&mut self) {
        self.recorded_barriers.clear();
        self.recorded_decodes.clear();
    }

    fn execute(&mut self) -> HwResult<()> {
        if let Some(code) = self.fail_next_execute.take() {
            self.discard_commands();
            return Err(HwError::Failed(code));
        }

        self.barriers.append(&mut self.recorded_barriers);
        self.decodes.append(&mut self.recorded_decodes);
        Ok(())
    }

    fn signal(&mut self, fence: Fence) -> HwResult<()> {
        if let Some(code) = self.fail_next_signal.take() {
            return Err(HwError::Failed(code));
        }

        if self.hold_completion {
            self.pending_signals.push(fence);
        } else {
            self.complete(fence);
        }
        Ok(())
    }
}
