// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream parsing and reference picture management for the supported codecs.

pub mod h264;
pub mod h265;
