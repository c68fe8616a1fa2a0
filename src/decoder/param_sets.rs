// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter set storage shared by the codec parsers.
//!
//! Every parameter set is kept along with the exact bytes it was parsed from, so that re-sending
//! an identical set can be told apart from a real change. A set is only stored once it has been
//! parsed successfully: corrupt data never replaces a previously good value.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::bitstream_utils::Unit;
use crate::bitstream_utils::UnitHeader;
use crate::codec::h264;
use crate::codec::h265;

/// The kinds of parameter sets a store may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSetKind {
    /// H.265 only.
    Video,
    Sequence,
    Picture,
}

/// Result of ingesting a parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// A stored value was added or its bytes changed.
    Changed,
    /// The stored value is byte-for-byte identical to what was ingested, or nothing was stored.
    Unchanged,
}

impl IngestStatus {
    /// `Changed` if either `self` or `other` is.
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (IngestStatus::Unchanged, IngestStatus::Unchanged) => IngestStatus::Unchanged,
            _ => IngestStatus::Changed,
        }
    }
}

/// A borrowed view of a stored parameter set.
#[derive(Debug, Clone, Copy)]
pub enum ParameterSet<'a> {
    H264Sps(&'a h264::parser::Sps),
    H264Pps(&'a h264::parser::Pps),
    H265Vps(&'a h265::parser::Vps),
    H265Sps(&'a h265::parser::Sps),
    H265Pps(&'a h265::parser::Pps),
}

/// Per-codec parameter set store.
pub trait ParameterSetStore {
    type Header: UnitHeader;

    /// Parses and stores the parameter set carried by `unit`. On error, the value previously
    /// stored under the same ID is left untouched.
    fn ingest(&mut self, unit: &Unit<Self::Header>) -> anyhow::Result<IngestStatus>;

    fn get(&self, kind: ParamSetKind, id: u8) -> Option<ParameterSet<'_>>;

    /// Forgets every parameter set.
    fn reset(&mut self);
}

#[derive(Debug)]
struct Entry<T> {
    raw: Vec<u8>,
    value: Rc<T>,
}

/// Parameter sets of one kind, keyed by ID.
#[derive(Debug)]
pub struct ParamSetMap<T> {
    entries: BTreeMap<u8, Entry<T>>,
}

// See https://github.com/rust-lang/rust/issues/26925 on why this can't be derived.
impl<T> Default for ParamSetMap<T> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
        }
    }
}

impl<T> ParamSetMap<T> {
    /// Stores `value`, parsed from `raw`, under `id`.
    ///
    /// The value is replaced even when `raw` is identical to the stored bytes, since it may have
    /// been parsed against a different referenced set.
    pub fn insert(&mut self, id: u8, raw: &[u8], value: T) -> IngestStatus {
        let value = Rc::new(value);

        match self.entries.get_mut(&id) {
            Some(entry) if entry.raw == raw => {
                entry.value = value;
                IngestStatus::Unchanged
            }
            Some(entry) => {
                log::debug!("Replacing parameter set {}", id);
                entry.raw = raw.to_vec();
                entry.value = value;
                IngestStatus::Changed
            }
            None => {
                self.entries.insert(
                    id,
                    Entry {
                        raw: raw.to_vec(),
                        value,
                    },
                );
                IngestStatus::Changed
            }
        }
    }

    pub fn get(&self, id: u8) -> Option<&Rc<T>> {
        self.entries.get(&id).map(|entry| &entry.value)
    }

    /// The bytes `id` was parsed from.
    pub fn raw(&self, id: u8) -> Option<&[u8]> {
        self.entries.get(&id).map(|entry| entry.raw.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
