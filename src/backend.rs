// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hardware seam of the decoder.
//!
//! A [`HwDecodeDevice`] is a GPU-resident decode engine reached through a command queue. This
//! module defines that interface along with the objects that cross it: fences, decode heap
//! configurations, resource states and the decode command itself. Frame and decode-work
//! ownership lives in [`frame_pool`], and command construction in [`submission`].

#[cfg(test)]
pub(crate) mod dummy;
pub mod frame_pool;
pub mod submission;

use std::time::Duration;

use thiserror::Error;

use crate::PixelLayout;
use crate::Resolution;

/// Error returned by device methods.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwError {
    #[error("not enough hardware resources to proceed with the operation now")]
    OutOfResources,
    #[error("hardware call failed with code {0:#x}")]
    Failed(i32),
}

/// Result type returned by device methods.
pub type HwResult<T> = Result<T, HwError>;

/// A texture that decoded frames are written to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// A device buffer holding compressed bitstream data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// A decode heap, see [`DecodeHeapConfig`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(pub u32);

/// A monotonically increasing counter signaled by the command queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub u32);

/// A point on the timeline of a fence counter: the work it guards is complete once `counter`
/// reaches `target_value`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fence {
    pub counter: FenceId,
    pub target_value: u64,
}

impl Fence {
    /// Whether the guarded work has completed.
    pub fn is_signaled<D: HwDecodeDevice + ?Sized>(&self, device: &D) -> bool {
        device.completed_value(self.counter) >= self.target_value
    }

    /// Blocks until the guarded work has completed or `timeout` has expired. Returns `false` on
    /// timeout.
    pub fn wait<D: HwDecodeDevice + ?Sized>(&self, device: &D, timeout: Duration) -> bool {
        self.is_signaled(device) || device.wait_fence(self.counter, self.target_value, timeout)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
}

/// Configuration a decode heap is created against. Creating a heap is expensive, so sessions
/// only do it when this changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeHeapConfig {
    pub codec: VideoCodec,
    /// Coded size, aligned.
    pub coded_resolution: Resolution,
    pub layout: PixelLayout,
    /// Number of reference frames a decode may read.
    pub max_references: usize,
}

/// States a texture can be in as far as the decode engine is concerned.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResourceState {
    #[default]
    Common,
    DecodeRead,
    DecodeWrite,
}

/// A state transition of one texture, recorded in the command list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub texture: TextureId,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// One hardware decode operation.
#[derive(Debug)]
pub struct DecodeCommand<'a> {
    pub codec: VideoCodec,
    pub heap: HeapId,
    /// Texture the frame is decoded into.
    pub target: TextureId,
    /// Compressed data, already in the framing the engine expects.
    pub bitstream: BufferId,
    pub bitstream_len: usize,
    pub picture_params: &'a [u8],
    pub quantization_matrix: Option<&'a [u8]>,
    pub slice_control: &'a [u8],
    /// Textures referred to by index from the picture parameters.
    pub reference_textures: &'a [TextureId],
}

/// A decode engine and the command queue feeding it.
///
/// Commands are recorded with [`record_barriers`](HwDecodeDevice::record_barriers) and
/// [`record_decode`](HwDecodeDevice::record_decode), then handed to the engine by
/// [`execute`](HwDecodeDevice::execute). Completion is asynchronous and reported through fences.
pub trait HwDecodeDevice {
    fn create_decode_heap(&mut self, config: &DecodeHeapConfig) -> HwResult<HeapId>;
    fn destroy_decode_heap(&mut self, heap: HeapId);

    fn create_texture(&mut self, resolution: Resolution, layout: PixelLayout)
        -> HwResult<TextureId>;
    fn destroy_texture(&mut self, texture: TextureId);

    /// Creates a bitstream buffer able to hold `size` bytes.
    fn create_buffer(&mut self, size: usize) -> HwResult<BufferId>;
    fn destroy_buffer(&mut self, buffer: BufferId);
    /// Copies `data` to the start of `buffer`.
    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> HwResult<()>;

    /// Creates a fence counter starting at 0.
    fn create_fence(&mut self) -> HwResult<FenceId>;
    fn destroy_fence(&mut self, fence: FenceId);
    /// Last value the engine signaled on `fence`.
    fn completed_value(&self, fence: FenceId) -> u64;
    /// Blocks until `fence` reaches `value` or `timeout` expires. Returns `false` on timeout.
    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Duration) -> bool;

    fn record_barriers(&mut self, barriers: &[ResourceBarrier]) -> HwResult<()>;
    fn record_decode(&mut self, command: &DecodeCommand) -> HwResult<()>;
    /// Throws away the commands recorded since the last [`execute`](HwDecodeDevice::execute).
    fn discard_commands(&mut self);
    /// Submits the recorded commands to the queue.
    fn execute(&mut self) -> HwResult<()>;
    /// Makes the queue set `fence.counter` to `fence.target_value` once the work submitted so far
    /// has completed.
    fn signal(&mut self, fence: Fence) -> HwResult<()>;
}
