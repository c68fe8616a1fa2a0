// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dpb;
pub mod parser;
pub mod picture;
#[cfg(test)]
pub(crate) mod synthesizer;
