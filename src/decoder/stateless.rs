// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the hardware interface targeted by these decoders: the engine only
//! decodes one picture at a time, and the decoder keeps all the stream state (parameter sets,
//! picture order, reference marking, DPB) itself.
//!
//! The [`DecoderSession`] struct is the basis of all stateless decoders. It is created by
//! combining a codec to a [device](crate::backend::HwDecodeDevice), after which access units can
//! be submitted through the [`DecoderSession::decode`] method and decoded frames retrieved in
//! display order with [`DecoderSession::get_output`].

pub mod h264;
pub mod h265;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;

use crate::backend::frame_pool::FrameHandle;
use crate::backend::frame_pool::FrameInfo;
use crate::backend::frame_pool::FramePool;
use crate::backend::submission;
use crate::backend::submission::PictureSubmission;
use crate::backend::submission::SliceFraming;
use crate::backend::DecodeHeapConfig;
use crate::backend::Fence;
use crate::backend::HwDecodeDevice;
use crate::backend::VideoCodec;
use crate::bitstream_utils::Unit;
use crate::bitstream_utils::UnitHeader;
use crate::bitstream_utils::UnitScanner;
use crate::decoder::output::OutputScheduler;
use crate::decoder::param_sets::IngestStatus;
use crate::decoder::param_sets::ParameterSetStore;
use crate::decoder::AccessUnit;
use crate::decoder::DecodeOptions;
use crate::decoder::DecodedFrame;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderError;
use crate::decoder::OutputStatus;
use crate::Rect;

/// Stream properties the hardware resources of a session are allocated against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamParams {
    pub heap: DecodeHeapConfig,
    /// Size of the DPB, in frames.
    pub dpb_size: usize,
    pub visible_rect: Rect<u32>,
    pub bit_depth: u8,
}

/// The hardware half of a session: the device and everything allocated from it.
pub struct HwState<D: HwDecodeDevice> {
    device: D,
    pool: FramePool,
    config: DecoderConfig,
    /// Signaled after every submission.
    session_fence: Fence,
    output: OutputScheduler,
    /// What the pool is currently allocated for.
    stream: Option<StreamParams>,
}

impl<D: HwDecodeDevice> HwState<D> {
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn stream_params(&self) -> Option<&StreamParams> {
        self.stream.as_ref()
    }

    pub fn needs_reconfiguration(&self, params: &StreamParams) -> bool {
        self.stream.as_ref() != Some(params)
    }

    /// Waits for the last submission to complete. A timeout is logged and otherwise ignored.
    fn await_idle(&self) {
        let fence = self.session_fence;
        if !fence.wait(&self.device, self.config.teardown_fence_timeout) {
            log::warn!(
                "Timed out waiting for decode {} to complete",
                fence.target_value
            );
        }
    }

    /// (Re)allocates the decode heap and the frame pool for `params`.
    pub fn reconfigure(&mut self, params: &StreamParams) -> Result<(), DecoderError> {
        debug!("Configuring the session for {:?}", params);

        // Frames of the previous configuration may still be written to.
        self.await_idle();
        self.stream = None;

        let num_frames = params.dpb_size + 1 + self.config.extra_output_frames;

        self.pool.ensure_decode_heap(&mut self.device, &params.heap)?;
        self.pool.ensure_frame_pool(
            &mut self.device,
            num_frames,
            params.heap.coded_resolution,
            params.heap.layout,
            self.config.alignment,
        )?;

        self.stream = Some(params.clone());

        Ok(())
    }

    /// Takes a frame to decode the current picture into.
    pub fn acquire_target(&mut self) -> Result<FrameHandle, DecoderError> {
        self.pool.acquire_target_frame().ok_or(DecoderError::NoBuffer)
    }

    pub fn has_free_frame(&self) -> bool {
        self.pool.has_free_frame()
    }

    /// Waits for the last decode into each of `frames`. Returns `false` if one of them did not
    /// complete within the reference timeout.
    pub fn await_frames<'a>(&self, frames: impl IntoIterator<Item = &'a FrameHandle>) -> bool {
        frames.into_iter().all(|frame| {
            self.pool.fence(*frame).map_or(true, |fence| {
                fence.wait(&self.device, self.config.ref_fence_timeout)
            })
        })
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Decodes `picture` and records the properties of the frame it is decoded into.
    pub fn submit(
        &mut self,
        picture: &PictureSubmission,
        timestamp: u64,
    ) -> Result<Fence, DecoderError> {
        let fence = submission::submit(
            &mut self.device,
            &mut self.pool,
            &mut self.session_fence,
            &self.config,
            picture,
        )?;

        if let Some(stream) = &self.stream {
            let info = FrameInfo {
                timestamp,
                coded_resolution: stream.heap.coded_resolution,
                visible_rect: stream.visible_rect,
                bit_depth: stream.bit_depth,
                layout: stream.heap.layout,
            };
            self.pool.set_info(picture.target, info);
        }

        Ok(fence)
    }

    /// Queues `frames` for output, in order.
    pub fn output_frames(&mut self, frames: impl IntoIterator<Item = FrameHandle>) {
        for frame in frames {
            self.pool.mark_pending_output(frame);
            self.output.push(frame);
        }
    }

    /// Releases every resource of the session.
    fn teardown(&mut self) {
        self.await_idle();

        for frame in self.output.reset() {
            self.pool.cancel_pending_output(&mut self.device, frame);
        }
        self.pool.clear(&mut self.device);
        self.stream = None;
    }
}

/// Codec half of a session: the parameter sets, the picture order and the DPB.
pub trait StatelessCodec: Default {
    type Header: UnitHeader;
    type Store: ParameterSetStore<Header = Self::Header>;

    const CODEC: VideoCodec;
    const SLICE_FRAMING: SliceFraming;

    fn param_sets(&mut self) -> &mut Self::Store;

    fn is_parameter_set(header: &Self::Header) -> bool;

    /// Decodes the units of one access unit, parameter sets excluded. Frames that become ready
    /// are queued with [`HwState::output_frames`].
    ///
    /// On error, the picture order and DPB state are left as they were before the call.
    fn decode_access_unit<D: HwDecodeDevice>(
        &mut self,
        hw: &mut HwState<D>,
        units: &[Unit<Self::Header>],
        access_unit: &AccessUnit,
    ) -> Result<(), DecoderError>;

    /// Empties the DPB, returning the frames still waiting for output in display order.
    fn drain(&mut self) -> Vec<FrameHandle>;

    /// Empties the DPB without output and forgets the picture order state.
    fn flush(&mut self);

    /// The frames currently stored in the DPB.
    fn dpb_handles(&self) -> Vec<FrameHandle>;
}

/// A decode session, combining a codec `C` to a device `D`.
///
/// So for instance, a H.264 session on a device type `MyDevice` will have the following type:
///
/// ```text
/// let session: DecoderSession<H264, MyDevice>;
/// ```
///
/// The session manages access unit splitting, parameter set ingestion, frame ownership and the
/// output queue. All the rest is left to codec-specific code.
pub struct DecoderSession<C: StatelessCodec, D: HwDecodeDevice> {
    hw: HwState<D>,
    codec: C,
    closed: bool,
    /// Set until the first sync access unit following creation, flush or reset.
    awaiting_sync: bool,
}

impl<C: StatelessCodec, D: HwDecodeDevice> DecoderSession<C, D> {
    pub fn new(mut device: D, config: DecoderConfig) -> Result<Self, DecoderError> {
        if !config.hw_decode_enabled {
            return Err(DecoderError::ResetRequired);
        }

        let session_fence = Fence {
            counter: device.create_fence()?,
            target_value: 0,
        };

        Ok(Self {
            hw: HwState {
                device,
                pool: Default::default(),
                config,
                session_fence,
                output: Default::default(),
                stream: None,
            },
            codec: Default::default(),
            closed: false,
            awaiting_sync: true,
        })
    }

    fn ingest_parameter_set(&mut self, unit: &Unit<C::Header>) -> anyhow::Result<IngestStatus> {
        let status = self.codec.param_sets().ingest(unit)?;
        if status == IngestStatus::Changed {
            debug!("Parameter set {:?} changed", unit.header);
        }

        Ok(status)
    }

    /// Decodes `access_unit`.
    ///
    /// Parameter sets of `options` are ingested first, and errors in them are reported. Errors
    /// in parameter sets carried by the access unit itself only skip the offending unit.
    ///
    /// On [`DecoderError::NoBuffer`], the same access unit should be sent again once frames have
    /// been released.
    pub fn decode(
        &mut self,
        access_unit: &AccessUnit,
        options: &DecodeOptions,
    ) -> Result<(), DecoderError> {
        if self.closed {
            return Err(DecoderError::AlreadyClosed);
        }

        if let Some(csd) = options.codec_specific_data {
            for unit in UnitScanner::<C::Header>::new(csd) {
                let unit = unit.context("while splitting codec specific data")?;
                if C::is_parameter_set(&unit.header) {
                    self.ingest_parameter_set(&unit)
                        .context("while ingesting codec specific data")?;
                }
            }
        }

        let units = UnitScanner::<C::Header>::new(access_unit.data)
            .collect::<Result<Vec<_>, _>>()
            .context("while splitting access unit")?;

        let mut pictures = Vec::with_capacity(units.len());
        for unit in units {
            if !C::is_parameter_set(&unit.header) {
                pictures.push(unit);
            } else if let Err(e) = self.ingest_parameter_set(&unit) {
                log::warn!(
                    "Skipping parameter set at offset {}: {:#}",
                    unit.offset,
                    e
                );
            }
        }

        if self.awaiting_sync && !access_unit.is_sync_sample {
            return Err(anyhow!("decoding can only start at a sync sample").into());
        }

        let res = self
            .codec
            .decode_access_unit(&mut self.hw, &pictures, access_unit);
        self.hw.pool.sync_dpb(self.codec.dpb_handles());

        res?;
        self.awaiting_sync = false;

        Ok(())
    }

    /// Drops the DPB and every frame waiting for output. Parameter sets are kept, and decoding
    /// resumes at the next sync access unit.
    pub fn flush(&mut self) -> Result<(), DecoderError> {
        if self.closed {
            return Err(DecoderError::AlreadyClosed);
        }

        debug!("Flushing the session");
        self.codec.flush();
        for frame in self.hw.output.clear() {
            self.hw.pool.cancel_pending_output(&mut self.hw.device, frame);
        }
        self.hw.pool.sync_dpb(std::iter::empty());
        self.awaiting_sync = true;

        Ok(())
    }

    /// Outputs every frame of the DPB. [`DecoderSession::have_output`] reports
    /// [`OutputStatus::EndOfData`] once they have all been retrieved.
    pub fn send_end_of_data(&mut self) -> Result<(), DecoderError> {
        if self.closed {
            return Err(DecoderError::AlreadyClosed);
        }

        let frames = self.codec.drain();
        debug!("End of data, {} frames left in the DPB", frames.len());
        self.hw.output_frames(frames);
        self.hw.pool.sync_dpb(self.codec.dpb_handles());
        self.hw.output.start_draining();

        Ok(())
    }

    /// Drops every frame, parameter set and hardware resource of the session. The next access
    /// unit must be a sync sample.
    pub fn reset(&mut self) -> Result<(), DecoderError> {
        if self.closed {
            return Err(DecoderError::AlreadyClosed);
        }

        debug!("Resetting the session");
        self.codec.flush();
        self.codec.param_sets().reset();
        self.hw.teardown();
        self.awaiting_sync = true;

        Ok(())
    }

    /// Releases every resource of the session. Every later call fails with
    /// [`DecoderError::AlreadyClosed`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.codec.flush();
        self.codec.param_sets().reset();
        self.hw.teardown();
        self.hw.output.set_error();
        self.closed = true;
    }

    pub fn have_output(&mut self) -> OutputStatus {
        self.hw.output.status()
    }

    /// Takes the next frame in display order. The caller owns it until
    /// [`DecoderSession::release_frame`] is called.
    pub fn get_output(&mut self) -> Result<Option<DecodedFrame>, DecoderError> {
        if self.closed {
            return Err(DecoderError::AlreadyClosed);
        }

        while let Some(handle) = self.hw.output.pop() {
            if !self.hw.pool.take_pending_output(handle) {
                log::warn!("Dropping output of vanished frame {:?}", handle);
                continue;
            }

            let (Some(texture), Some(fence), Some(info)) = (
                self.hw.pool.texture(handle),
                self.hw.pool.fence(handle),
                self.hw.pool.info(handle),
            ) else {
                continue;
            };

            return Ok(Some(DecodedFrame {
                handle,
                timestamp: info.timestamp,
                coded_resolution: info.coded_resolution,
                visible_rect: info.visible_rect,
                bit_depth: info.bit_depth,
                layout: info.layout,
                texture,
                fence,
            }));
        }

        Ok(None)
    }

    /// Gives a frame obtained from [`DecoderSession::get_output`] back to the session.
    pub fn release_frame(&mut self, handle: FrameHandle) -> Result<(), DecoderError> {
        if self.closed {
            return Err(DecoderError::AlreadyClosed);
        }

        self.hw.pool.release_frame(&mut self.hw.device, handle);
        Ok(())
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn device(&self) -> &D {
        &self.hw.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.hw.device
    }

    pub fn pool(&self) -> &FramePool {
        &self.hw.pool
    }

    pub fn stream_params(&self) -> Option<&StreamParams> {
        self.hw.stream_params()
    }
}

impl<C: StatelessCodec, D: HwDecodeDevice> Drop for DecoderSession<C, D> {
    fn drop(&mut self) {
        self.hw.teardown();
        self.hw.device.destroy_fence(self.hw.session_fence.counter);
    }
}
