// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns one decoded picture worth of data into a hardware decode command.
//!
//! [`submit`] awaits the references, repackages the slices into the framing the engine expects,
//! fills the parameter payloads of a decode-work resource, records the decode between the
//! resource barriers, executes it and signals the fences of the target frame and of the session.

use anyhow::anyhow;
use anyhow::Context;
use byteorder::LittleEndian;
use byteorder::WriteBytesExt;
use log::debug;

use crate::backend::frame_pool::DecodeWork;
use crate::backend::frame_pool::FrameHandle;
use crate::backend::frame_pool::FramePool;
use crate::backend::DecodeCommand;
use crate::backend::Fence;
use crate::backend::HeapId;
use crate::backend::HwDecodeDevice;
use crate::backend::HwResult;
use crate::backend::ResourceBarrier;
use crate::backend::ResourceState;
use crate::backend::TextureId;
use crate::backend::VideoCodec;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderError;

/// How slices are laid out in the bitstream buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SliceFraming {
    /// Prepended to every slice.
    pub start_code: &'static [u8],
    /// Every slice is zero-padded to a multiple of this many bytes.
    pub alignment: Option<usize>,
}

impl SliceFraming {
    pub const H264: Self = Self {
        start_code: &[0, 0, 1],
        alignment: None,
    };

    pub const H265: Self = Self {
        start_code: &[0, 0, 1],
        alignment: Some(128),
    };
}

/// Size of the part of a slice control entry common to both codecs: offset, size and chopping.
pub const SLICE_CONTROL_HEADER_SIZE: usize = 10;

/// Maps the reference entries of a picture to the textures bound to its decode command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceTable {
    /// Distinct frames read by the decode.
    frames: Vec<FrameHandle>,
    /// Texture of each frame of `frames`.
    textures: Vec<TextureId>,
    /// Index into `textures` of each entry the table was built from.
    indices: Vec<u8>,
}

impl ReferenceTable {
    /// Builds the table of `entries`. `None` entries, and entries whose frame no longer exists,
    /// read the missing-reference frame of `pool`.
    ///
    /// When two entries resolve to the same frame, the first one owns the texture slot and the
    /// later one reuses its index.
    pub fn new(pool: &FramePool, entries: &[Option<FrameHandle>]) -> anyhow::Result<Self> {
        let missing = pool
            .missing_frame()
            .context("no frame to stand in for missing references")?;

        let mut table = Self::default();

        for (entry, handle) in entries.iter().enumerate() {
            let frame = match handle {
                Some(handle) if pool.texture(*handle).is_some() => *handle,
                Some(handle) => {
                    log::warn!("Reference {:?} is gone, using the missing frame", handle);
                    missing
                }
                None => missing,
            };

            let index = match table.frames.iter().position(|f| *f == frame) {
                Some(index) => {
                    if frame != missing {
                        debug!(
                            "Reference entry {} shares frame {:?} with an earlier entry",
                            entry, frame
                        );
                    }
                    index
                }
                None => {
                    let texture = pool
                        .texture(frame)
                        .with_context(|| format!("no texture for frame {:?}", frame))?;
                    table.frames.push(frame);
                    table.textures.push(texture);
                    table.frames.len() - 1
                }
            };

            table.indices.push(
                u8::try_from(index).map_err(|_| anyhow!("too many reference textures"))?,
            );
        }

        Ok(table)
    }

    pub fn textures(&self) -> &[TextureId] {
        &self.textures
    }

    /// Texture index of each entry, in the order the table was built from.
    pub fn indices(&self) -> &[u8] {
        &self.indices
    }

    pub fn index(&self, entry: usize) -> Option<u8> {
        self.indices.get(entry).copied()
    }
}

/// One slice of a picture.
#[derive(Clone, Debug)]
pub struct SliceSubmission<'a> {
    /// The slice unit, header included, without length prefix.
    pub data: &'a [u8],
    /// Codec specific bytes appended to the common slice control entry.
    pub control: Vec<u8>,
}

/// Everything needed to decode one picture.
#[derive(Debug)]
pub struct PictureSubmission<'a> {
    pub codec: VideoCodec,
    pub framing: SliceFraming,
    pub target: FrameHandle,
    pub slices: &'a [SliceSubmission<'a>],
    pub picture_params: &'a [u8],
    pub quantization_matrix: Option<&'a [u8]>,
    pub references: &'a ReferenceTable,
}

/// Writes the slices and payloads of `picture` into `work`.
fn fill_decode_work(
    work: &mut DecodeWork,
    picture: &PictureSubmission,
    use_quantization_matrices: bool,
) -> anyhow::Result<()> {
    for slice in picture.slices {
        let offset = work.bitstream.len();

        work.bitstream.extend_from_slice(picture.framing.start_code);
        work.bitstream.extend_from_slice(slice.data);
        if let Some(alignment) = picture.framing.alignment {
            let padded = work.bitstream.len().next_multiple_of(alignment);
            work.bitstream.resize(padded, 0);
        }

        let size = work.bitstream.len() - offset;
        work.slice_control
            .write_u32::<LittleEndian>(u32::try_from(offset).context("bitstream too large")?)?;
        work.slice_control
            .write_u32::<LittleEndian>(u32::try_from(size).context("slice too large")?)?;
        // Slices are never chopped.
        work.slice_control.write_u16::<LittleEndian>(0)?;
        work.slice_control.extend_from_slice(&slice.control);
    }

    work.picture_params.extend_from_slice(picture.picture_params);
    if use_quantization_matrices {
        if let Some(matrix) = picture.quantization_matrix {
            work.quantization_matrix.extend_from_slice(matrix);
        }
    }
    work.reference_textures
        .extend_from_slice(picture.references.textures());

    Ok(())
}

fn barriers(
    target: TextureId,
    references: &[TextureId],
    common_to_decode: bool,
) -> Vec<ResourceBarrier> {
    let transition = |texture, state| {
        let (before, after) = if common_to_decode {
            (ResourceState::Common, state)
        } else {
            (state, ResourceState::Common)
        };
        ResourceBarrier {
            texture,
            before,
            after,
        }
    };

    std::iter::once(transition(target, ResourceState::DecodeWrite))
        .chain(
            references
                .iter()
                .map(|texture| transition(*texture, ResourceState::DecodeRead)),
        )
        .collect()
}

/// Uploads the contents of `work` and records and executes the decode.
fn execute_decode<D: HwDecodeDevice + ?Sized>(
    device: &mut D,
    work: &mut DecodeWork,
    codec: VideoCodec,
    heap: HeapId,
    target: TextureId,
) -> HwResult<()> {
    let bitstream = work.upload(device)?;

    let command = DecodeCommand {
        codec,
        heap,
        target,
        bitstream,
        bitstream_len: work.bitstream.len(),
        picture_params: &work.picture_params,
        quantization_matrix: if work.quantization_matrix.is_empty() {
            None
        } else {
            Some(&work.quantization_matrix)
        },
        slice_control: &work.slice_control,
        reference_textures: &work.reference_textures,
    };

    let recorded = device
        .record_barriers(&barriers(target, &work.reference_textures, true))
        .and_then(|()| device.record_decode(&command))
        .and_then(|()| device.record_barriers(&barriers(target, &work.reference_textures, false)));

    // Nothing of a failed frame may reach the queue with the next one.
    match recorded.and_then(|()| device.execute()) {
        Ok(()) => Ok(()),
        Err(e) => {
            device.discard_commands();
            Err(e)
        }
    }
}

/// Decodes `picture` into its target frame. Returns the fence signaled once the target frame is
/// decoded.
///
/// Returns [`DecoderError::NoBuffer`] without touching the device if a reference could not be
/// awaited within `config.ref_fence_timeout`.
pub fn submit<D: HwDecodeDevice + ?Sized>(
    device: &mut D,
    pool: &mut FramePool,
    session_fence: &mut Fence,
    config: &DecoderConfig,
    picture: &PictureSubmission,
) -> Result<Fence, DecoderError> {
    for frame in &picture.references.frames {
        if let Some(fence) = pool.fence(*frame) {
            if !fence.wait(&*device, config.ref_fence_timeout) {
                log::warn!("Timed out waiting for reference {:?}", frame);
                return Err(DecoderError::NoBuffer);
            }
        }
    }

    let heap = pool.heap().context("no decode heap")?;
    let target = pool
        .texture(picture.target)
        .with_context(|| format!("no texture for target frame {:?}", picture.target))?;

    let work_id = pool.acquire_decode_work(&*device);
    let res = match pool.decode_work_mut(work_id) {
        Some(work) => fill_decode_work(work, picture, config.use_quantization_matrices)
            .map_err(DecoderError::from)
            .and_then(|()| {
                execute_decode(device, work, picture.codec, heap, target).map_err(|e| {
                    log::error!("Decode submission failed: {}", e);
                    DecoderError::from(e)
                })
            }),
        None => Err(anyhow!("decode work {:?} vanished", work_id).into()),
    };

    if let Err(e) = res {
        pool.release_decode_work(work_id, None);
        return Err(e);
    }

    let frame_fence = pool
        .advance_fence(picture.target)
        .context("target frame vanished")?;
    session_fence.target_value += 1;

    // The decode is queued from here on. Even if a signal fails, the work stays guarded by the
    // session fence, which a later signal moves past, and the frame keeps its advanced fence.
    pool.release_decode_work(work_id, Some(*session_fence));

    let signaled = device
        .signal(frame_fence)
        .and_then(|()| device.signal(*session_fence));
    if let Err(e) = signaled {
        log::error!("Failed to signal decode completion: {}", e);
        return Err(e.into());
    }

    debug!(
        "Submitted decode into {:?}, completes at {:?}",
        picture.target, frame_fence
    );

    Ok(frame_fence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::backend::DecodeHeapConfig;
    use crate::PixelLayout;
    use crate::Resolution;

    struct Fixture {
        device: DummyDevice,
        pool: FramePool,
        session_fence: Fence,
        config: DecoderConfig,
    }

    impl Fixture {
        fn new(device: DummyDevice) -> Self {
            let mut device = device;
            let mut pool = FramePool::default();
            pool.ensure_decode_heap(
                &mut device,
                &DecodeHeapConfig {
                    codec: VideoCodec::H265,
                    coded_resolution: Resolution::from((64, 64)),
                    layout: PixelLayout::NV12,
                    max_references: 4,
                },
            )
            .unwrap();
            pool.ensure_frame_pool(&mut device, 4, Resolution::from((64, 64)), PixelLayout::NV12, 16)
                .unwrap();

            let session_fence = Fence {
                counter: device.create_fence().unwrap(),
                target_value: 0,
            };

            Self {
                device,
                pool,
                session_fence,
                config: Default::default(),
            }
        }

        fn submit(&mut self, picture: &PictureSubmission) -> Result<Fence, DecoderError> {
            submit(
                &mut self.device,
                &mut self.pool,
                &mut self.session_fence,
                &self.config,
                picture,
            )
        }
    }

    fn picture<'a>(
        target: FrameHandle,
        slices: &'a [SliceSubmission<'a>],
        references: &'a ReferenceTable,
    ) -> PictureSubmission<'a> {
        PictureSubmission {
            codec: VideoCodec::H265,
            framing: SliceFraming::H265,
            target,
            slices,
            picture_params: &[1, 2, 3, 4],
            quantization_matrix: Some(&[9; 16]),
            references,
        }
    }

    #[test]
    fn reference_table_shares_colliding_entries() {
        let mut device = DummyDevice::default();
        let mut pool = FramePool::default();
        pool.ensure_frame_pool(&mut device, 4, Resolution::from((64, 64)), PixelLayout::NV12, 16)
            .unwrap();

        let a = pool.acquire_target_frame().unwrap();
        let b = pool.acquire_target_frame().unwrap();

        let table = ReferenceTable::new(&pool, &[Some(a), None, Some(b), Some(a), None]).unwrap();
        assert_eq!(table.indices(), &[0, 1, 2, 0, 1]);
        assert_eq!(table.textures().len(), 3);
        assert_eq!(table.textures()[0], pool.texture(a).unwrap());
        assert_eq!(
            table.textures()[1],
            pool.texture(pool.missing_frame().unwrap()).unwrap()
        );
    }

    #[test]
    fn reference_table_needs_frames() {
        assert!(ReferenceTable::new(&FramePool::default(), &[None]).is_err());
    }

    #[test]
    fn slices_are_framed_and_padded() {
        let mut fixture = Fixture::new(DummyDevice::default());
        let target = fixture.pool.acquire_target_frame().unwrap();
        let references = ReferenceTable::default();
        let slices = [
            SliceSubmission {
                data: &[0x26, 0x01, 0xaa],
                control: vec![7],
            },
            SliceSubmission {
                data: &[0x02, 0x01, 0xbb, 0xcc],
                control: vec![8],
            },
        ];

        fixture
            .submit(&picture(target, &slices, &references))
            .unwrap();

        let decode = &fixture.device.decodes[0];
        assert_eq!(decode.bitstream.len(), 256);
        assert_eq!(&decode.bitstream[..6], &[0, 0, 1, 0x26, 0x01, 0xaa]);
        assert!(decode.bitstream[6..128].iter().all(|b| *b == 0));
        assert_eq!(&decode.bitstream[128..135], &[0, 0, 1, 0x02, 0x01, 0xbb, 0xcc]);

        assert_eq!(
            decode.slice_control,
            [
                &[0, 0, 0, 0, 128, 0, 0, 0, 0, 0, 7][..],
                &[128, 0, 0, 0, 128, 0, 0, 0, 0, 0, 8][..],
            ]
            .concat()
        );
        assert_eq!(decode.picture_params, vec![1, 2, 3, 4]);
        assert_eq!(decode.quantization_matrix, Some(vec![9; 16]));
    }

    #[test]
    fn h264_slices_are_not_padded() {
        let mut fixture = Fixture::new(DummyDevice::default());
        let target = fixture.pool.acquire_target_frame().unwrap();
        let references = ReferenceTable::default();
        let slices = [SliceSubmission {
            data: &[0x65, 0x88],
            control: vec![],
        }];
        let mut picture = picture(target, &slices, &references);
        picture.codec = VideoCodec::H264;
        picture.framing = SliceFraming::H264;
        fixture.config.use_quantization_matrices = false;

        fixture.submit(&picture).unwrap();

        let decode = &fixture.device.decodes[0];
        assert_eq!(decode.bitstream, vec![0, 0, 1, 0x65, 0x88]);
        assert_eq!(decode.slice_control.len(), SLICE_CONTROL_HEADER_SIZE);
        assert_eq!(decode.quantization_matrix, None);
    }

    #[test]
    fn barriers_and_fences() {
        let mut fixture = Fixture::new(DummyDevice::default());
        let reference = fixture.pool.acquire_target_frame().unwrap();
        let target = fixture.pool.acquire_target_frame().unwrap();
        let references = ReferenceTable::new(&fixture.pool, &[Some(reference)]).unwrap();
        let slices = [SliceSubmission {
            data: &[0x02, 0x01],
            control: vec![],
        }];

        let fence = fixture
            .submit(&picture(target, &slices, &references))
            .unwrap();
        assert_eq!(fence.target_value, 1);
        assert_eq!(fixture.session_fence.target_value, 1);
        assert!(fence.is_signaled(&fixture.device));
        assert_eq!(fixture.pool.fence(target), Some(fence));

        let target_texture = fixture.pool.texture(target).unwrap();
        let reference_texture = fixture.pool.texture(reference).unwrap();
        assert_eq!(
            fixture.device.barriers,
            vec![
                ResourceBarrier {
                    texture: target_texture,
                    before: ResourceState::Common,
                    after: ResourceState::DecodeWrite,
                },
                ResourceBarrier {
                    texture: reference_texture,
                    before: ResourceState::Common,
                    after: ResourceState::DecodeRead,
                },
                ResourceBarrier {
                    texture: target_texture,
                    before: ResourceState::DecodeWrite,
                    after: ResourceState::Common,
                },
                ResourceBarrier {
                    texture: reference_texture,
                    before: ResourceState::DecodeRead,
                    after: ResourceState::Common,
                },
            ]
        );
        assert_eq!(
            fixture.device.decodes[0].reference_textures,
            vec![reference_texture]
        );
    }

    #[test]
    fn pending_reference_is_backpressure() {
        let mut fixture = Fixture::new(DummyDevice {
            hold_completion: true,
            ..Default::default()
        });
        let reference = fixture.pool.acquire_target_frame().unwrap();
        let target = fixture.pool.acquire_target_frame().unwrap();
        let slices = [SliceSubmission {
            data: &[0x02, 0x01],
            control: vec![],
        }];

        let no_references = ReferenceTable::default();
        fixture
            .submit(&picture(reference, &slices, &no_references))
            .unwrap();

        let references = ReferenceTable::new(&fixture.pool, &[Some(reference)]).unwrap();
        assert!(matches!(
            fixture.submit(&picture(target, &slices, &references)),
            Err(DecoderError::NoBuffer)
        ));
        assert_eq!(fixture.device.decodes.len(), 1);
        assert_eq!(fixture.pool.fence(target).unwrap().target_value, 0);

        fixture.device.complete_all();
        fixture
            .submit(&picture(target, &slices, &references))
            .unwrap();
        assert_eq!(fixture.device.decodes.len(), 2);
    }

    #[test]
    fn failed_execution_rolls_back_fences() {
        let mut fixture = Fixture::new(DummyDevice {
            fail_next_execute: Some(-5),
            ..Default::default()
        });
        let target = fixture.pool.acquire_target_frame().unwrap();
        let references = ReferenceTable::default();
        let slices = [SliceSubmission {
            data: &[0x02, 0x01],
            control: vec![],
        }];

        assert!(matches!(
            fixture.submit(&picture(target, &slices, &references)),
            Err(DecoderError::SubmissionFailed(-5))
        ));
        assert!(fixture.device.decodes.is_empty());
        assert_eq!(fixture.pool.fence(target).unwrap().target_value, 0);
        assert_eq!(fixture.session_fence.target_value, 0);

        // The decode work resource is free again.
        fixture
            .submit(&picture(target, &slices, &references))
            .unwrap();
        assert_eq!(fixture.pool.num_decode_work(), 1);
    }

    #[test]
    fn failed_recording_is_not_executed_later() {
        let mut fixture = Fixture::new(DummyDevice {
            fail_next_record: Some(-7),
            ..Default::default()
        });
        let target = fixture.pool.acquire_target_frame().unwrap();
        let references = ReferenceTable::default();
        let slices = [SliceSubmission {
            data: &[0x02, 0x01],
            control: vec![],
        }];

        assert!(matches!(
            fixture.submit(&picture(target, &slices, &references)),
            Err(DecoderError::SubmissionFailed(-7))
        ));
        assert!(fixture.device.barriers.is_empty());
        assert_eq!(fixture.pool.fence(target).unwrap().target_value, 0);

        fixture
            .submit(&picture(target, &slices, &references))
            .unwrap();
        // One barrier into the decode state and one back, for the target alone.
        assert_eq!(fixture.device.barriers.len(), 2);
        assert_eq!(fixture.device.decodes.len(), 1);
    }

    #[test]
    fn failed_signal_keeps_work_guarded() {
        let mut fixture = Fixture::new(DummyDevice {
            fail_next_signal: Some(-3),
            ..Default::default()
        });
        let target = fixture.pool.acquire_target_frame().unwrap();
        let references = ReferenceTable::default();
        let slices = [SliceSubmission {
            data: &[0x02, 0x01],
            control: vec![],
        }];

        assert!(matches!(
            fixture.submit(&picture(target, &slices, &references)),
            Err(DecoderError::SubmissionFailed(-3))
        ));
        // The decode reached the queue, so its fences are not handed back.
        assert_eq!(fixture.device.decodes.len(), 1);
        let fence = fixture.pool.fence(target).unwrap();
        assert_eq!(fence.target_value, 1);
        assert!(!fence.is_signaled(&fixture.device));
        assert_eq!(fixture.session_fence.target_value, 1);

        // The work of the failed frame is still busy, so the pool grows.
        fixture
            .submit(&picture(target, &slices, &references))
            .unwrap();
        assert_eq!(fixture.pool.num_decode_work(), 2);
        assert!(fixture.pool.fence(target).unwrap().is_signaled(&fixture.device));

        // The later session signal covers it.
        fixture
            .submit(&picture(target, &slices, &references))
            .unwrap();
        assert_eq!(fixture.pool.num_decode_work(), 2);
    }
}
