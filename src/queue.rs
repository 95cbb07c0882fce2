//! Ordered, format/rate-tagged PCM queue (spec §3/§4.2).
use std::collections::VecDeque;
use std::sync::MutexGuard;

use crate::error::EngineError;
use crate::raw_audio::{RawAudioBuffer, RawAudioFormat};
use crate::refcount::Shared;

/// The FIFO's internal state, behind the queue's own lock. Exposed
/// `pub(crate)` so [`crate::stream::PlaybackStream`]'s writer thread can
/// hold the queue's lock across several reads (the `*_locked` contract
/// from spec §4.2).
pub(crate) struct QueueState {
    buffers: VecDeque<RawAudioBuffer>,
    read_cursor: usize,
    max_duration_usec: u64,
}

impl QueueState {
    fn total_duration_usec(&self) -> u64 {
        self.buffers.iter().map(RawAudioBuffer::duration_usec).sum()
    }

    pub(crate) fn push(&mut self, buffer: RawAudioBuffer) -> Result<(), EngineError> {
        if buffer.len_bytes() == 0 || buffer.format() == RawAudioFormat::Unspecified {
            return Err(EngineError::InvalidArgument);
        }
        self.buffers.push_back(buffer);

        // FIFO eviction: drop from the head until we fit the duration bound,
        // but never evict the only buffer left (spec §3).
        while self.total_duration_usec() > self.max_duration_usec && self.buffers.len() > 1 {
            self.buffers.pop_front();
            self.read_cursor = 0;
        }
        Ok(())
    }

    pub(crate) fn has_bytes(&self) -> bool {
        self.buffers
            .front()
            .is_some_and(|b| self.read_cursor < b.len_bytes())
    }

    pub(crate) fn has_buffers(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub(crate) fn front_format(&self) -> Option<RawAudioFormat> {
        self.buffers.front().map(RawAudioBuffer::format)
    }

    pub(crate) fn front_sample_rate(&self) -> Option<u32> {
        self.buffers.front().map(RawAudioBuffer::sample_rate)
    }

    /// Amount of `dst` that can be filled from the current front buffer,
    /// rounded down to a whole-sample multiple so a read call never
    /// splits a sample across two calls (spec §4.2).
    fn copyable_amount(front: &RawAudioBuffer, cursor: usize, dst_len: usize) -> usize {
        let remaining = front.len_bytes() - cursor;
        let mut amount = remaining.min(dst_len);
        if let Some(width) = front.format().byte_width() {
            if width > 1 {
                amount -= amount % width;
            }
        }
        amount
    }

    fn pop_front_if_exhausted(&mut self) {
        if let Some(front) = self.buffers.front() {
            if self.read_cursor >= front.len_bytes() {
                self.buffers.pop_front();
                self.read_cursor = 0;
            }
        }
    }

    /// `read_bytes_locked`: FIFO copy, stops at the first buffer boundary.
    pub(crate) fn read_locked(
        &mut self,
        dst: &mut [u8],
    ) -> (usize, Option<RawAudioFormat>, Option<u32>) {
        let Some(front) = self.buffers.front() else {
            return (0, None, None);
        };
        let format = front.format();
        let rate = front.sample_rate();
        let amount = Self::copyable_amount(front, self.read_cursor, dst.len());
        if amount == 0 {
            return (0, Some(format), Some(rate));
        }
        dst[..amount].copy_from_slice(&front.bytes()[self.read_cursor..self.read_cursor + amount]);
        self.read_cursor += amount;
        self.pop_front_if_exhausted();
        (amount, Some(format), Some(rate))
    }

    /// `read_bytes_with_props_locked`: copies only while the front
    /// buffer's `(format, rate)` matches `expected`. Returns
    /// `(bytes_copied, same_props)`.
    pub(crate) fn read_with_props_locked(
        &mut self,
        dst: &mut [u8],
        expected_format: RawAudioFormat,
        expected_rate: u32,
    ) -> (usize, bool) {
        let Some(front) = self.buffers.front() else {
            // Nothing to compare against; the writer keeps playing silence
            // without flagging a property change (spec §4.5.2).
            return (0, true);
        };
        if front.format() != expected_format || front.sample_rate() != expected_rate {
            return (0, false);
        }
        let amount = Self::copyable_amount(front, self.read_cursor, dst.len());
        if amount == 0 {
            return (0, true);
        }
        dst[..amount].copy_from_slice(&front.bytes()[self.read_cursor..self.read_cursor + amount]);
        self.read_cursor += amount;
        self.pop_front_if_exhausted();
        (amount, true)
    }
}

/// `read_bytes` result (spec §6's `raw_audio_queue_read_bytes`), realized
/// as an owned record rather than the C API's `(buf, &n, &fmt, &rate)`
/// out-parameters.
#[derive(Debug, Clone, uniffi::Record)]
pub struct QueueReadResult {
    pub bytes: Vec<u8>,
    pub format: Option<RawAudioFormat>,
    pub sample_rate: Option<u32>,
}

/// `read_bytes_with_props` result (spec §6).
#[derive(Debug, Clone, uniffi::Record)]
pub struct QueueReadWithPropsResult {
    pub bytes: Vec<u8>,
    pub same_props: bool,
}

/// FIFO queue of raw PCM buffers, shared between a producer and the
/// playback stream's writer thread (spec §3).
#[derive(Clone, uniffi::Object)]
pub struct RawAudioQueue(Shared<QueueState>);

#[uniffi::export]
impl RawAudioQueue {
    #[uniffi::constructor]
    pub fn new(max_duration_usec: u64) -> Self {
        Self(Shared::new(QueueState {
            buffers: VecDeque::new(),
            read_cursor: 0,
            max_duration_usec,
        }))
    }

    /// Builds a buffer from raw parts and appends it (spec §6's
    /// `raw_audio_queue_push`, which the FFI table folds into the buffer
    /// constructor on the C side).
    pub fn push_bytes(&self, bytes: Vec<u8>, format: RawAudioFormat, sample_rate: u32) -> Result<(), EngineError> {
        self.push(RawAudioBuffer::new(bytes, format, sample_rate))
    }

    pub fn read_bytes(&self, max_len: u32) -> QueueReadResult {
        let mut buf = vec![0u8; max_len as usize];
        let (n, format, sample_rate) = self.read(&mut buf);
        buf.truncate(n);
        QueueReadResult {
            bytes: buf,
            format,
            sample_rate,
        }
    }

    pub fn read_bytes_with_props(&self, max_len: u32, format: RawAudioFormat, sample_rate: u32) -> QueueReadWithPropsResult {
        let mut buf = vec![0u8; max_len as usize];
        let (n, same_props) = self.read_with_props(&mut buf, format, sample_rate);
        buf.truncate(n);
        QueueReadWithPropsResult {
            bytes: buf,
            same_props,
        }
    }

    pub fn front_buffer_format(&self) -> Option<RawAudioFormat> {
        self.front_format()
    }

    pub fn front_buffer_sample_rate(&self) -> Option<u32> {
        self.front_sample_rate()
    }

    pub fn has_bytes(&self) -> bool {
        self.0.lock().has_bytes()
    }

    pub fn has_buffers(&self) -> bool {
        self.0.lock().has_buffers()
    }
}

impl RawAudioQueue {
    pub fn push(&self, buffer: RawAudioBuffer) -> Result<(), EngineError> {
        self.0.lock().push(buffer)
    }

    pub fn front_format(&self) -> Option<RawAudioFormat> {
        self.0.lock().front_format()
    }

    pub fn front_sample_rate(&self) -> Option<u32> {
        self.0.lock().front_sample_rate()
    }

    pub fn read(&self, dst: &mut [u8]) -> (usize, Option<RawAudioFormat>, Option<u32>) {
        self.0.lock().read_locked(dst)
    }

    pub fn read_with_props(
        &self,
        dst: &mut [u8],
        expected_format: RawAudioFormat,
        expected_rate: u32,
    ) -> (usize, bool) {
        self.0.lock().read_with_props_locked(dst, expected_format, expected_rate)
    }

    /// Hold the queue's own lock for a multi-step atomic drain, per the
    /// `*_locked` contract in spec §4.2 — used by the stream writer thread,
    /// which acquires this after the mainloop lock (lock order in spec §5).
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.0.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(bytes: &[u8], format: RawAudioFormat, rate: u32) -> RawAudioBuffer {
        RawAudioBuffer::new(bytes.to_vec(), format, rate)
    }

    #[test]
    fn round_trip_read_matches_pushed_bytes() {
        let queue = RawAudioQueue::new(10_000_000);
        let data: Vec<u8> = (0..=255u8).collect();
        queue
            .push(buf(&data, RawAudioFormat::U8, 8000))
            .expect("push should succeed");

        let mut out = vec![0u8; data.len()];
        let (n, format, rate) = queue.read(&mut out);
        assert_eq!(n, data.len());
        assert_eq!(format, Some(RawAudioFormat::U8));
        assert_eq!(rate, Some(8000));
        assert_eq!(out, data);
    }

    #[test]
    fn fifo_order_across_multiple_buffers() {
        let queue = RawAudioQueue::new(10_000_000);
        queue.push(buf(&[1, 2, 3], RawAudioFormat::U8, 8000)).unwrap();
        queue.push(buf(&[4, 5, 6], RawAudioFormat::U8, 8000)).unwrap();

        let mut collected = Vec::new();
        loop {
            let mut out = [0u8; 2];
            let (n, _, _) = queue.read(&mut out);
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&out[..n]);
        }
        assert_eq!(collected, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn read_with_props_stops_at_property_boundary() {
        let queue = RawAudioQueue::new(10_000_000);
        queue.push(buf(&[1, 2, 3, 4], RawAudioFormat::U8, 8000)).unwrap();
        queue
            .push(buf(&[9, 9, 9, 9], RawAudioFormat::U8, 16000))
            .unwrap();

        let mut out = [0u8; 16];
        let (n, same) = queue.read_with_props(&mut out, RawAudioFormat::U8, 8000);
        assert_eq!(n, 4);
        assert!(same);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);

        // Next call sees the rate change and reports it without copying.
        let (n, same) = queue.read_with_props(&mut out, RawAudioFormat::U8, 8000);
        assert_eq!(n, 0);
        assert!(!same);
    }

    #[test]
    fn push_rejects_empty_and_unspecified() {
        let queue = RawAudioQueue::new(1_000_000);
        assert!(queue.push(buf(&[], RawAudioFormat::U8, 8000)).is_err());
        assert!(queue
            .push(buf(&[1, 2, 3], RawAudioFormat::Unspecified, 8000))
            .is_err());
    }

    #[test]
    fn backpressure_evicts_oldest_buffer_first() {
        // 1s cap; push two 1s buffers of U8 @ 8000Hz (8000 bytes each).
        let queue = RawAudioQueue::new(1_000_000);
        let first = vec![1u8; 8000];
        let second = vec![2u8; 8000];
        queue.push(buf(&first, RawAudioFormat::U8, 8000)).unwrap();
        queue.push(buf(&second, RawAudioFormat::U8, 8000)).unwrap();

        // The oldest buffer should have been evicted; only `second` remains.
        let mut out = vec![0u8; 8000];
        let (n, _, _) = queue.read(&mut out);
        assert_eq!(n, 8000);
        assert_eq!(out, second);
        assert!(!queue.has_buffers());
    }

    #[test]
    fn backpressure_never_evicts_the_last_buffer() {
        let queue = RawAudioQueue::new(1);
        queue.push(buf(&[1, 2, 3, 4], RawAudioFormat::U8, 8000)).unwrap();
        assert!(queue.has_buffers());
    }
}
