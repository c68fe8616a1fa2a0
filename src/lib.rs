// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated H.264 and H.265 decode pipeline.
//!
//! Compressed access units go in through [`decoder::stateless::DecoderSession::decode`], are
//! parsed by the codec modules under [`codec`], ordered by the codec DPBs, submitted to a
//! [`backend::HwDecodeDevice`] and come back out in display order through
//! [`decoder::stateless::DecoderSession::get_output`].

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod decoder;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` is large enough to hold a picture of `other`'s size.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Returns this resolution with both dimensions rounded up to `alignment`.
    pub fn round_up(&self, alignment: u32) -> Self {
        if alignment <= 1 {
            return *self;
        }

        Self {
            width: self.width.div_ceil(alignment) * alignment,
            height: self.height.div_ceil(alignment) * alignment,
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

/// A rectangle given by its top-left (inclusive) and bottom-right (exclusive) corners.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

impl Rect<u32> {
    pub fn width(&self) -> u32 {
        self.max.x.saturating_sub(self.min.x)
    }

    pub fn height(&self) -> u32 {
        self.max.y.saturating_sub(self.min.y)
    }
}

impl From<Resolution> for Rect<u32> {
    fn from(value: Resolution) -> Self {
        Self {
            min: Point { x: 0, y: 0 },
            max: Point {
                x: value.width,
                y: value.height,
            },
        }
    }
}

/// Memory layout of the decoded frames.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// 8-bit 4:2:0, interleaved chroma.
    #[default]
    NV12,
    /// 10-bit 4:2:0 in 16-bit containers, interleaved chroma.
    P010,
}

impl PixelLayout {
    /// Picks the layout able to hold samples of `bit_depth` bits.
    pub fn for_bit_depth(bit_depth: u8) -> Option<Self> {
        match bit_depth {
            8 => Some(PixelLayout::NV12),
            9 | 10 => Some(PixelLayout::P010),
            _ => None,
        }
    }
}

impl FromStr for PixelLayout {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(PixelLayout::NV12),
            "p010" | "P010" => Ok(PixelLayout::P010),
            _ => Err("unrecognized pixel layout. Valid values: nv12, p010"),
        }
    }
}
