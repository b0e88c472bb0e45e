//! Buffer Module
//!
//! Planar multi-channel float storage and the fixed scratch-buffer pool
//! lent to voices during rendering. Both are sized once, off the audio
//! thread; render-time operations never allocate.

use crate::config::constants::SCRATCH_BUFFERS;

/// Planar multi-channel audio storage.
///
/// Channels are stored back to back in one allocation. The buffer is sized
/// at construction (or via `resize`, off the audio thread) and exposes
/// per-channel slices for processing.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    channels: usize,
    frames: usize,
    data: Vec<f32>,
}

impl AudioBuffer {
    /// Creates a zeroed buffer with the given channel count and capacity.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels,
            frames,
            data: vec![0.0; channels * frames],
        }
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Gets a channel as an immutable slice.
    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        let start = index * self.frames;
        &self.data[start..start + self.frames]
    }

    /// Gets a channel as a mutable slice.
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let start = index * self.frames;
        &mut self.data[start..start + self.frames]
    }

    /// Gets mutable access to the first two channels at once.
    #[inline]
    pub fn stereo_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        debug_assert!(self.channels >= 2);
        let (left, rest) = self.data.split_at_mut(self.frames);
        (left, &mut rest[..self.frames])
    }

    /// Zeroes all channels.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Resizes the buffer, zeroing its content. Not real-time safe.
    pub fn resize(&mut self, channels: usize, frames: usize) {
        self.channels = channels;
        self.frames = frames;
        self.data.clear();
        self.data.resize(channels * frames, 0.0);
    }

    /// Adds `other`, scaled by `gain`, into this buffer over the first
    /// `frames` frames of each shared channel.
    pub fn accumulate(&mut self, other: &AudioBuffer, gain: f32, frames: usize) {
        let frames = frames.min(self.frames).min(other.frames);
        for ch in 0..self.channels.min(other.channels) {
            let src = other.channel(ch);
            let dst = self.channel_mut(ch);
            for i in 0..frames {
                dst[i] += src[i] * gain;
            }
        }
    }

    /// Multiplies every sample by `gain`.
    pub fn apply_gain(&mut self, gain: f32) {
        for sample in &mut self.data {
            *sample *= gain;
        }
    }
}

/// Fixed set of pre-sized stereo scratch buffers lent to voices per render
/// call.
///
/// Buffers are moved out on acquire and moved back on release, so leasing
/// never allocates. Exhausting the pool is a programming error on the
/// render path; callers treat `None` as "skip this voice for the block".
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<AudioBuffer>,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool of stereo buffers sized for `frames` frames.
    pub fn new(frames: usize) -> Self {
        Self::with_capacity(SCRATCH_BUFFERS, frames)
    }

    /// Creates a pool with an explicit buffer count.
    pub fn with_capacity(count: usize, frames: usize) -> Self {
        Self {
            free: (0..count).map(|_| AudioBuffer::new(2, frames)).collect(),
            capacity: count,
        }
    }

    /// Takes a cleared scratch buffer from the pool.
    pub fn acquire(&mut self) -> Option<AudioBuffer> {
        let mut buffer = self.free.pop()?;
        buffer.clear();
        Some(buffer)
    }

    /// Returns a previously acquired buffer.
    pub fn release(&mut self, buffer: AudioBuffer) {
        debug_assert!(self.free.len() < self.capacity);
        self.free.push(buffer);
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Re-sizes every pooled buffer for a new block size. Not real-time
    /// safe; the caller stops rendering first.
    pub fn resize(&mut self, frames: usize) {
        for buffer in &mut self.free {
            buffer.resize(2, frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_channels_are_disjoint() {
        let mut buffer = AudioBuffer::new(2, 16);
        buffer.channel_mut(0).fill(1.0);
        buffer.channel_mut(1).fill(2.0);
        assert!(buffer.channel(0).iter().all(|&s| s == 1.0));
        assert!(buffer.channel(1).iter().all(|&s| s == 2.0));
    }

    #[test]
    fn test_stereo_mut_split() {
        let mut buffer = AudioBuffer::new(2, 8);
        {
            let (left, right) = buffer.stereo_mut();
            left.fill(0.5);
            right.fill(-0.5);
        }
        assert_eq!(buffer.channel(0)[3], 0.5);
        assert_eq!(buffer.channel(1)[3], -0.5);
    }

    #[test]
    fn test_accumulate_with_gain() {
        let mut target = AudioBuffer::new(2, 4);
        let mut source = AudioBuffer::new(2, 4);
        source.channel_mut(0).fill(1.0);
        source.channel_mut(1).fill(1.0);

        target.accumulate(&source, 0.5, 4);
        target.accumulate(&source, 0.25, 4);

        assert!(target.channel(0).iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_pool_acquire_release_cycle() {
        let mut pool = BufferPool::with_capacity(2, 64);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_returns_cleared_buffers() {
        let mut pool = BufferPool::with_capacity(1, 8);
        let mut buffer = pool.acquire().unwrap();
        buffer.channel_mut(0).fill(1.0);
        pool.release(buffer);

        let buffer = pool.acquire().unwrap();
        assert!(buffer.channel(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_buffer_resize_zeroes() {
        let mut buffer = AudioBuffer::new(2, 4);
        buffer.channel_mut(0).fill(1.0);
        buffer.resize(2, 8);
        assert_eq!(buffer.frames(), 8);
        assert!(buffer.channel(0).iter().all(|&s| s == 0.0));
    }
}
