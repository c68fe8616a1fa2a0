// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Public types of the decode pipeline.
//!
//! The session itself lives in [`stateless`]; this module holds what crosses its boundary:
//! errors, configuration, access units and decoded frame descriptors.

pub mod output;
pub mod param_sets;
pub mod stateless;

use std::time::Duration;

use thiserror::Error;

use crate::backend::frame_pool::FrameHandle;
use crate::backend::Fence;
use crate::backend::HwError;
use crate::backend::TextureId;
use crate::PixelLayout;
use crate::Rect;
use crate::Resolution;

#[derive(Error, Debug)]
pub enum DecoderError {
    /// Malformed parameter set or slice header. State parsed before the error is retained.
    #[error("parse error: {0:#}")]
    ParseError(#[from] anyhow::Error),
    /// A hardware call failed. The current frame is aborted.
    #[error("decode submission failed with code {0:#x}")]
    SubmissionFailed(i32),
    /// Hardware resources could not be allocated. Retrying later may succeed.
    #[error("hardware resources exhausted")]
    ResourceExhausted,
    /// No frame is available to decode into. Retry the same access unit once frames are
    /// released.
    #[error("no buffer available, retry later")]
    NoBuffer,
    /// The stream changed in a way that requires a new session.
    #[error("decoder must be reset")]
    ResetRequired,
    /// The session was closed.
    #[error("decoder is closed")]
    AlreadyClosed,
}

impl From<HwError> for DecoderError {
    fn from(err: HwError) -> Self {
        match err {
            HwError::OutOfResources => DecoderError::ResourceExhausted,
            HwError::Failed(code) => DecoderError::SubmissionFailed(code),
        }
    }
}

/// Session configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// When `false`, sessions cannot be created and the caller is expected to use another path.
    pub hw_decode_enabled: bool,
    /// How long to wait for a reference frame before returning [`DecoderError::NoBuffer`].
    pub ref_fence_timeout: Duration,
    /// How long to wait for in-flight decodes when tearing the session down.
    pub teardown_fence_timeout: Duration,
    /// Alignment of the decode targets, in pixels.
    pub alignment: u32,
    /// Frames allocated on top of the DPB size so the caller can hold on to outputs.
    pub extra_output_frames: usize,
    pub use_quantization_matrices: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            hw_decode_enabled: true,
            ref_fence_timeout: Duration::from_millis(100),
            teardown_fence_timeout: Duration::from_millis(500),
            alignment: 16,
            extra_output_frames: 4,
            use_quantization_matrices: true,
        }
    }
}

/// One access unit of length-prefixed units.
#[derive(Clone, Copy, Debug)]
pub struct AccessUnit<'a> {
    pub data: &'a [u8],
    pub timestamp: u64,
    /// Whether the access unit can start decoding, i.e. holds an IDR or IRAP picture.
    pub is_sync_sample: bool,
    /// Decode the picture but never output it.
    pub do_not_output: bool,
}

impl<'a> AccessUnit<'a> {
    pub fn new(data: &'a [u8], timestamp: u64) -> Self {
        Self {
            data,
            timestamp,
            is_sync_sample: false,
            do_not_output: false,
        }
    }

    pub fn sync(mut self) -> Self {
        self.is_sync_sample = true;
        self
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeOptions<'a> {
    /// Length-prefixed parameter sets sent out of band.
    pub codec_specific_data: Option<&'a [u8]>,
}

/// Result of [`stateless::DecoderSession::have_output`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStatus {
    Available,
    NeedInput,
    /// Everything before the end of data has been output.
    EndOfData,
    Error,
}

/// A decoded frame handed to the caller. The frame stays reserved until given back with
/// [`stateless::DecoderSession::release_frame`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    pub handle: FrameHandle,
    pub timestamp: u64,
    pub coded_resolution: Resolution,
    pub visible_rect: Rect<u32>,
    pub bit_depth: u8,
    pub layout: PixelLayout,
    pub texture: TextureId,
    /// Signaled once the frame has been written. Consumers must wait on it before reading
    /// `texture`.
    pub fence: Fence,
}
