// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

use crate::backend::frame_pool::FrameHandle;
use crate::decoder::OutputStatus;

/// Queue of the frames waiting to be sent to the client, in display order.
#[derive(Debug, Default)]
pub struct OutputScheduler {
    queue: VecDeque<FrameHandle>,
    /// End of data was requested and not reported yet.
    draining: bool,
    error: bool,
}

impl OutputScheduler {
    /// Push `handle` to the back of the queue.
    pub fn push(&mut self, handle: FrameHandle) {
        self.queue.push_back(handle)
    }

    /// Returns the next frame (if any) waiting to be dequeued.
    pub fn pop(&mut self) -> Option<FrameHandle> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn start_draining(&mut self) {
        self.draining = true;
    }

    pub fn set_error(&mut self) {
        self.error = true;
    }

    /// Drops every queued frame and the draining state. Returns the dropped frames.
    pub fn clear(&mut self) -> Vec<FrameHandle> {
        self.draining = false;
        self.queue.drain(..).collect()
    }

    /// Drops everything, error state included.
    pub fn reset(&mut self) -> Vec<FrameHandle> {
        self.error = false;
        self.clear()
    }

    /// Reports [`OutputStatus::EndOfData`] once per drain, after the queue has been emptied.
    pub fn status(&mut self) -> OutputStatus {
        if self.error {
            OutputStatus::Error
        } else if !self.queue.is_empty() {
            OutputStatus::Available
        } else if self.draining {
            self.draining = false;
            OutputStatus::EndOfData
        } else {
            OutputStatus::NeedInput
        }
    }
}

impl Extend<FrameHandle> for OutputScheduler {
    fn extend<I: IntoIterator<Item = FrameHandle>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::backend::frame_pool::FramePool;
    use crate::PixelLayout;
    use crate::Resolution;

    fn handles(count: usize) -> Vec<FrameHandle> {
        let mut device = DummyDevice::default();
        let mut pool = FramePool::default();
        pool.ensure_frame_pool(&mut device, count, Resolution::from((16, 16)), PixelLayout::NV12, 16)
            .unwrap();
        (0..count)
            .map(|_| pool.acquire_target_frame().unwrap())
            .collect()
    }

    #[test]
    fn end_of_data_reported_once() {
        let frames = handles(2);
        let mut scheduler = OutputScheduler::default();

        assert_eq!(scheduler.status(), OutputStatus::NeedInput);
        scheduler.extend(frames.iter().copied());
        scheduler.start_draining();

        assert_eq!(scheduler.status(), OutputStatus::Available);
        assert_eq!(scheduler.pop(), Some(frames[0]));
        assert_eq!(scheduler.status(), OutputStatus::Available);
        assert_eq!(scheduler.pop(), Some(frames[1]));
        assert_eq!(scheduler.status(), OutputStatus::EndOfData);
        assert_eq!(scheduler.status(), OutputStatus::NeedInput);
    }

    #[test]
    fn error_is_sticky_until_reset() {
        let frames = handles(1);
        let mut scheduler = OutputScheduler::default();

        scheduler.push(frames[0]);
        scheduler.set_error();
        assert_eq!(scheduler.status(), OutputStatus::Error);
        assert_eq!(scheduler.clear(), frames);
        assert_eq!(scheduler.status(), OutputStatus::Error);

        scheduler.reset();
        assert_eq!(scheduler.status(), OutputStatus::NeedInput);
    }
}
