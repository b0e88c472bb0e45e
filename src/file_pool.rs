//! FilePool Module
//!
//! Two-tier sample storage: every distinct (path, reverse) identity owns
//! one `FileData` with a preloaded head resident in memory; the remainder
//! is streamed by background worker threads the first time a voice needs
//! it. The audio thread only ever clones an `Arc`, bumps an atomic reader
//! count and posts a load request on a bounded queue; it never blocks,
//! allocates or touches the filesystem.
//!
//! Thread roles: a dispatcher consumes handle registrations and schedules
//! jobs onto the worker pool; N workers decode from disk and publish
//! progress through `available_frames` (release ordering, monotonically
//! non-decreasing while readers hold the file); a GC thread periodically
//! frees streamed bodies whose reader count has been zero for longer than
//! a grace window, keeping the preload head.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::constants::{
    GC_GRACE_SECONDS, GC_PERIOD_SECONDS, PROMISE_QUEUE_CAPACITY, WORKER_THREADS,
};
use crate::config::Oversampling;
use crate::error::EngineError;
use crate::file_metadata::{read_metadata, LoopPoints};

/// Stable file identity within the pool: an index into the entry table.
pub type FileId = usize;

/// Frames appended to the stream buffer per write-lock acquisition.
const STREAM_CHUNK_FRAMES: usize = 65536;

/// Lifecycle of a pooled file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileStatus {
    /// Could not be opened or decoded
    Invalid = 0,

    /// Head resident, body not yet requested
    Preloaded = 1,

    /// A worker is filling the stream buffer
    Streaming = 2,

    /// Stream buffer holds the full file
    Done = 3,

    /// The preload covers the whole file; no streaming needed
    FullLoaded = 4,
}

impl FileStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FileStatus::Preloaded,
            2 => FileStatus::Streaming,
            3 => FileStatus::Done,
            4 => FileStatus::FullLoaded,
            _ => FileStatus::Invalid,
        }
    }
}

/// Immutable facts about a pooled file, fixed at preload time. Frame
/// counts and loop points are expressed post-oversampling.
#[derive(Debug, Clone)]
pub struct FileInformation {
    pub path: PathBuf,
    pub reverse: bool,
    pub sample_rate: f64,
    pub channels: usize,
    pub total_frames: usize,
    pub loop_points: Option<LoopPoints>,
    pub root_key: Option<u8>,
    pub oversampling: usize,
}

/// One pooled sample file.
#[derive(Debug)]
pub struct FileData {
    information: FileInformation,

    /// Preloaded head, per channel; immutable after construction
    preloaded: Vec<Vec<f32>>,

    /// Streamed body from frame zero, grown by workers. Buffers are only
    /// resized while the reader count is zero (GC) or by the single
    /// worker assigned to the file.
    stream: RwLock<Vec<Vec<f32>>>,

    /// Frames of `stream` that are safe to read; published with release
    /// ordering, read with acquire
    available_frames: AtomicUsize,

    status: AtomicU8,
    readers: AtomicUsize,

    /// Milliseconds since the pool epoch of the last handle release
    released_at_millis: AtomicUsize,
    epoch: Instant,
}

impl FileData {
    /// Facts about the file.
    pub fn information(&self) -> &FileInformation {
        &self.information
    }

    /// Current lifecycle status.
    pub fn status(&self) -> FileStatus {
        FileStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Frames currently readable from the stream buffer.
    pub fn available_frames(&self) -> usize {
        self.available_frames.load(Ordering::Acquire)
    }

    /// Active handle count.
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Frames of the preloaded head.
    pub fn preloaded_frames(&self) -> usize {
        self.preloaded.first().map(|c| c.len()).unwrap_or(0)
    }

    fn release_age(&self, now: Instant) -> Duration {
        let released = self.released_at_millis.load(Ordering::Acquire);
        if released == usize::MAX {
            return Duration::ZERO;
        }
        let now_millis = now.duration_since(self.epoch).as_millis() as usize;
        Duration::from_millis(now_millis.saturating_sub(released) as u64)
    }
}

/// RAII handle to a pooled file held by a voice.
///
/// While any handle exists the file's buffers are never resized or freed.
/// Dropping the handle decrements the reader count and stamps the release
/// time for the garbage collector.
#[derive(Debug)]
pub struct FileHandle {
    data: Arc<FileData>,
}

impl FileHandle {
    fn new(data: Arc<FileData>) -> Self {
        data.readers.fetch_add(1, Ordering::AcqRel);
        Self { data }
    }

    /// The shared file record.
    pub fn data(&self) -> &FileData {
        &self.data
    }

    /// Acquires a read view for one render block. Uses a try-lock; when a
    /// worker holds the write side, the view falls back to the preloaded
    /// head only, which is always safe.
    pub fn view(&self) -> FileView<'_> {
        let stream = self.data.stream.try_read();
        let available = match &stream {
            Some(_) => self.data.available_frames(),
            None => 0,
        };
        FileView {
            information: &self.data.information,
            preloaded: &self.data.preloaded,
            stream,
            available,
        }
    }
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.data))
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.data.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let millis = Instant::now()
                .duration_since(self.data.epoch)
                .as_millis() as usize;
            self.data
                .released_at_millis
                .store(millis, Ordering::Release);
        }
    }
}

/// A per-block read view over a pooled file.
pub struct FileView<'a> {
    information: &'a FileInformation,
    preloaded: &'a [Vec<f32>],
    stream: Option<RwLockReadGuard<'a, Vec<Vec<f32>>>>,
    available: usize,
}

impl<'a> FileView<'a> {
    /// Frames readable right now: the streamed prefix or at least the
    /// preloaded head.
    pub fn frames(&self) -> usize {
        self.available
            .max(self.preloaded.first().map(|c| c.len()).unwrap_or(0))
            .min(self.information.total_frames)
    }

    /// Total frames of the file once fully loaded.
    pub fn total_frames(&self) -> usize {
        self.information.total_frames
    }

    /// Channel count (1 or 2).
    pub fn channels(&self) -> usize {
        self.information.channels
    }

    /// Reads one sample; indices at or beyond `frames()` return zero.
    #[inline]
    pub fn sample(&self, channel: usize, frame: usize) -> f32 {
        let head = &self.preloaded[channel.min(self.preloaded.len() - 1)];
        if frame < head.len() {
            return head[frame];
        }
        if frame < self.available {
            if let Some(stream) = &self.stream {
                if let Some(data) = stream.get(channel.min(stream.len().saturating_sub(1))) {
                    if let Some(&sample) = data.get(frame) {
                        return sample;
                    }
                }
            }
        }
        0.0
    }
}

/// Case-insensitive path resolution: walks `relative`'s segments against
/// the directory tree under `root`, accepting the first case-insensitive
/// match per segment.
pub fn resolve_path(root: &Path, relative: &Path) -> Option<PathBuf> {
    let direct = root.join(relative);
    if direct.exists() {
        return Some(direct);
    }

    let mut current = root.to_path_buf();
    for segment in relative.iter() {
        let target = segment.to_string_lossy().to_lowercase();
        let next = std::fs::read_dir(&current).ok()?.find_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name();
            (name.to_string_lossy().to_lowercase() == target).then(|| current.join(name))
        })?;
        current = next;
    }
    Some(current)
}

/// Windowed-sinc interpolating upsampler used for the oversampling
/// option. Internals are deliberately simple; the contract is only that
/// the output holds `factor` times as many frames at the same pitch.
fn oversample_channel(input: &[f32], factor: usize) -> Vec<f32> {
    if factor <= 1 || input.is_empty() {
        return input.to_vec();
    }

    const TAPS: isize = 8;
    let mut output = Vec::with_capacity(input.len() * factor);
    for out_index in 0..input.len() * factor {
        let position = out_index as f64 / factor as f64;
        let center = position.floor() as isize;
        let frac = position - center as f64;

        if frac.abs() < 1e-9 {
            output.push(input[center as usize]);
            continue;
        }

        let mut accumulator = 0.0f64;
        for tap in (center - TAPS + 1)..=(center + TAPS) {
            let sample = if tap < 0 || tap as usize >= input.len() {
                0.0
            } else {
                input[tap as usize] as f64
            };
            let x = std::f64::consts::PI * (position - tap as f64);
            let sinc = x.sin() / x;
            // Hann window over the tap span
            let window_phase =
                (position - tap as f64) / (TAPS as f64) * std::f64::consts::PI * 0.5;
            let window = window_phase.cos().powi(2);
            accumulator += sample * sinc * window;
        }
        output.push(accumulator as f32);
    }
    output
}

/// Decodes a file into planar f32 channels (mono kept as one channel,
/// anything above stereo folded down to two).
fn decode_wav(path: &Path) -> Result<(Vec<Vec<f32>>, u32), EngineError> {
    let reader = hound::WavReader::open(path).map_err(|e| EngineError::FileDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let spec = reader.spec();
    let channels = (spec.channels as usize).min(2).max(1);
    let source_channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .filter_map(|s| s.ok())
            .collect(),
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 * scale)
                .collect()
        }
    };

    let frames = interleaved.len() / source_channels.max(1);
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in 0..frames {
        for channel in 0..channels {
            planar[channel].push(interleaved[frame * source_channels + channel]);
        }
    }
    Ok((planar, spec.sample_rate))
}

/// A load request traveling engine -> dispatcher -> worker.
struct LoadJob {
    data: Arc<FileData>,
}

/// The preload cache, streaming queue and background threads.
pub struct FilePool {
    entries: Vec<Arc<FileData>>,
    index: HashMap<(PathBuf, bool), FileId>,

    /// Mirror of `entries` for the GC thread
    gc_entries: Arc<Mutex<Vec<Arc<FileData>>>>,

    job_sender: Option<Sender<LoadJob>>,
    pending_jobs: Arc<AtomicUsize>,
    overflowed_jobs: AtomicUsize,

    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    gc_thread: Option<JoinHandle<()>>,
    running: Arc<std::sync::atomic::AtomicBool>,

    preload_size: usize,
    oversampling: Oversampling,
    root_directory: PathBuf,
    epoch: Instant,
}

impl std::fmt::Debug for FilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePool")
            .field("entries", &self.entries.len())
            .field("preload_size", &self.preload_size)
            .finish()
    }
}

impl FilePool {
    /// Creates the pool and spawns its dispatcher, worker and GC threads.
    pub fn new(preload_size: usize, oversampling: Oversampling) -> Self {
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let pending_jobs = Arc::new(AtomicUsize::new(0));
        let gc_entries: Arc<Mutex<Vec<Arc<FileData>>>> = Arc::new(Mutex::new(Vec::new()));

        let (job_sender, job_receiver) = bounded::<LoadJob>(PROMISE_QUEUE_CAPACITY);
        let (work_sender, work_receiver) = bounded::<LoadJob>(PROMISE_QUEUE_CAPACITY);

        // Dispatcher: moves handle registrations onto the worker queue.
        // On shutdown the queue is drained without forwarding, so pending
        // jobs are discarded rather than executed.
        let dispatcher = {
            let work_sender = work_sender.clone();
            let running = Arc::clone(&running);
            let pending = Arc::clone(&pending_jobs);
            std::thread::Builder::new()
                .name("ripple-dispatch".to_string())
                .spawn(move || {
                    while let Ok(job) = job_receiver.recv() {
                        if !running.load(Ordering::Acquire) {
                            pending.fetch_sub(1, Ordering::AcqRel);
                            continue;
                        }
                        if work_sender.send(job).is_err() {
                            break;
                        }
                    }
                })
                .expect("spawn dispatcher thread")
        };
        drop(work_sender);

        // Workers: decode from disk and publish progress
        let workers = (0..WORKER_THREADS)
            .map(|index| {
                let receiver: Receiver<LoadJob> = work_receiver.clone();
                let pending = Arc::clone(&pending_jobs);
                std::thread::Builder::new()
                    .name(format!("ripple-load-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            Self::stream_file(&job.data);
                            pending.fetch_sub(1, Ordering::AcqRel);
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        // GC: frees streamed bodies of long-unused files
        let gc_thread = {
            let entries = Arc::clone(&gc_entries);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("ripple-gc".to_string())
                .spawn(move || {
                    let period = Duration::from_secs_f32(GC_PERIOD_SECONDS);
                    let grace = Duration::from_secs_f32(GC_GRACE_SECONDS);
                    while running.load(Ordering::Acquire) {
                        std::thread::sleep(period);
                        let entries = entries.lock();
                        gc_pass(&entries, Instant::now(), grace);
                    }
                })
                .expect("spawn gc thread")
        };

        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            gc_entries,
            job_sender: Some(job_sender),
            pending_jobs,
            overflowed_jobs: AtomicUsize::new(0),
            dispatcher: Some(dispatcher),
            workers,
            gc_thread: Some(gc_thread),
            running,
            preload_size,
            oversampling,
            root_directory: PathBuf::from("."),
            epoch: Instant::now(),
        }
    }

    /// Sets the directory sample paths resolve against.
    pub fn set_root_directory(&mut self, root: &Path) {
        self.root_directory = root.to_path_buf();
    }

    /// Updates the preload size for subsequent loads.
    pub fn set_preload_size(&mut self, preload_size: usize) {
        self.preload_size = preload_size;
    }

    /// Number of pooled files.
    pub fn num_preloaded(&self) -> usize {
        self.entries.len()
    }

    /// Jobs dropped because the promise queue was full.
    pub fn overflowed_jobs(&self) -> usize {
        self.overflowed_jobs.load(Ordering::Relaxed)
    }

    /// Preloads a file and returns its id. Off-audio-thread only; called
    /// while building regions. `max_offset` extends the preloaded head to
    /// cover the region's largest possible start offset.
    pub fn preload(
        &mut self,
        path: &Path,
        reverse: bool,
        max_offset: u64,
    ) -> Result<FileId, EngineError> {
        let resolved = resolve_path(&self.root_directory, path)
            .ok_or_else(|| EngineError::FileMissing(path.to_path_buf()))?;

        let key = (resolved.clone(), reverse);
        if let Some(&id) = self.index.get(&key) {
            return Ok(id);
        }

        let (mut channels, sample_rate) = decode_wav(&resolved)?;
        let factor = self.oversampling.factor();
        if factor > 1 {
            for channel in &mut channels {
                *channel = oversample_channel(channel, factor);
            }
        }
        if reverse {
            for channel in &mut channels {
                channel.reverse();
            }
        }

        let metadata = read_metadata(&resolved);
        let total_frames = channels.first().map(|c| c.len()).unwrap_or(0);

        // Reversed files keep the whole body resident: playback starts at
        // the far end, which streaming cannot serve incrementally.
        let full = self.preload_size == 0 || reverse;
        let head_frames = if full {
            total_frames
        } else {
            (self.preload_size + max_offset as usize * factor).min(total_frames)
        };

        let preloaded: Vec<Vec<f32>> = channels
            .iter()
            .map(|channel| channel[..head_frames].to_vec())
            .collect();

        let status = if head_frames >= total_frames {
            FileStatus::FullLoaded
        } else {
            FileStatus::Preloaded
        };

        let information = FileInformation {
            path: resolved,
            reverse,
            sample_rate: sample_rate as f64 * factor as f64,
            channels: channels.len(),
            total_frames,
            loop_points: metadata.loop_points.map(|lp| LoopPoints {
                start: lp.start * factor as u64,
                end: lp.end * factor as u64 + (factor as u64 - 1),
            }),
            root_key: metadata.root_key,
            oversampling: factor,
        };

        let data = Arc::new(FileData {
            information,
            preloaded,
            stream: RwLock::new(Vec::new()),
            available_frames: AtomicUsize::new(0),
            status: AtomicU8::new(status as u8),
            readers: AtomicUsize::new(0),
            released_at_millis: AtomicUsize::new(usize::MAX),
            epoch: self.epoch,
        });

        let id = self.entries.len();
        self.entries.push(Arc::clone(&data));
        self.gc_entries.lock().push(data);
        self.index.insert(key, id);
        log::debug!(
            "preloaded {} ({} frames, head {})",
            self.entries[id].information.path.display(),
            total_frames,
            head_frames
        );
        Ok(id)
    }

    /// Audio-thread handle acquisition. Bumps the reader count and, for a
    /// not-yet-streamed file, posts a load request. Never blocks; when the
    /// promise queue is full the file simply stays on its preload head.
    pub fn get_handle(&self, id: FileId) -> Option<FileHandle> {
        let data = self.entries.get(id)?;
        let handle = FileHandle::new(Arc::clone(data));

        let status = data.status.compare_exchange(
            FileStatus::Preloaded as u8,
            FileStatus::Streaming as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if status.is_ok() {
            if let Some(sender) = self.job_sender.as_ref() {
                self.pending_jobs.fetch_add(1, Ordering::AcqRel);
                match sender.try_send(LoadJob {
                    data: Arc::clone(data),
                }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        // Roll back so a later trigger can retry
                        self.pending_jobs.fetch_sub(1, Ordering::AcqRel);
                        data.status
                            .store(FileStatus::Preloaded as u8, Ordering::Release);
                        self.overflowed_jobs.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        Some(handle)
    }

    /// File information without taking a handle.
    pub fn information(&self, id: FileId) -> Option<&FileInformation> {
        self.entries.get(id).map(|data| data.information())
    }

    /// Blocks until every posted load finished. Used by freewheeling
    /// renders and tests; never called on a live audio thread.
    pub fn wait_for_loads(&self) {
        while self.pending_jobs.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Drops every pooled file. The caller guarantees no handles survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.gc_entries.lock().clear();
    }

    /// Worker-side: decode the full file and publish it chunk by chunk.
    fn stream_file(data: &Arc<FileData>) {
        let information = &data.information;
        let decoded = decode_wav(&information.path);
        let (mut channels, _) = match decoded {
            Ok(result) => result,
            Err(error) => {
                log::warn!(
                    "streaming {} failed: {}",
                    information.path.display(),
                    error
                );
                data.status
                    .store(FileStatus::Invalid as u8, Ordering::Release);
                return;
            }
        };

        if information.oversampling > 1 {
            for channel in &mut channels {
                *channel = oversample_channel(channel, information.oversampling);
            }
        }

        let total = channels.first().map(|c| c.len()).unwrap_or(0);
        {
            let mut stream = data.stream.write();
            stream.clear();
            stream.resize(channels.len(), Vec::new());
            for (target, _) in stream.iter_mut().zip(&channels) {
                target.reserve_exact(total);
            }
        }

        let mut published = 0usize;
        while published < total {
            let chunk_end = (published + STREAM_CHUNK_FRAMES).min(total);
            {
                let mut stream = data.stream.write();
                for (target, source) in stream.iter_mut().zip(&channels) {
                    target.extend_from_slice(&source[published..chunk_end]);
                }
            }
            published = chunk_end;
            data.available_frames.store(published, Ordering::Release);
        }

        data.status.store(FileStatus::Done as u8, Ordering::Release);
    }
}

/// One garbage collection sweep: frees the streamed body of entries with
/// no readers whose last release is older than the grace window.
fn gc_pass(entries: &[Arc<FileData>], now: Instant, grace: Duration) {
    for data in entries {
        if data.reader_count() != 0 {
            continue;
        }
        if data.status() != FileStatus::Done {
            continue;
        }
        if data.release_age(now) < grace {
            continue;
        }

        // Readers re-check under the same lock the writer holds, so a
        // racing handle simply sees the preload head for one block.
        let mut stream = data.stream.write();
        if data.reader_count() != 0 {
            continue;
        }
        data.available_frames.store(0, Ordering::Release);
        stream.clear();
        stream.shrink_to_fit();
        data.status
            .store(FileStatus::Preloaded as u8, Ordering::Release);
        log::debug!(
            "gc: dropped streamed body of {}",
            data.information.path.display()
        );
    }
}

impl Drop for FilePool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.job_sender.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(gc) = self.gc_thread.take() {
            let _ = gc.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(name: &str, frames: usize) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample(i as f32 / frames as f32).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_preload_and_identity() {
        let path = write_test_wav("ripple_pool_identity.wav", 4096);
        let mut pool = FilePool::new(1024, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());

        let a = pool
            .preload(Path::new("ripple_pool_identity.wav"), false, 0)
            .unwrap();
        let b = pool
            .preload(Path::new("ripple_pool_identity.wav"), false, 0)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.num_preloaded(), 1);

        let info = pool.information(a).unwrap();
        assert_eq!(info.total_frames, 4096);
        assert_eq!(info.channels, 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_errors() {
        let mut pool = FilePool::new(1024, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());
        let result = pool.preload(Path::new("ripple_does_not_exist.wav"), false, 0);
        assert!(matches!(result, Err(EngineError::FileMissing(_))));
    }

    #[test]
    fn test_preload_head_then_streamed_body() {
        let path = write_test_wav("ripple_pool_stream.wav", 8192);
        let mut pool = FilePool::new(1024, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());

        let id = pool
            .preload(Path::new("ripple_pool_stream.wav"), false, 0)
            .unwrap();
        assert_eq!(pool.entries[id].status(), FileStatus::Preloaded);
        assert_eq!(pool.entries[id].preloaded_frames(), 1024);

        let handle = pool.get_handle(id).unwrap();
        pool.wait_for_loads();
        assert_eq!(handle.data().status(), FileStatus::Done);

        let view = handle.view();
        assert_eq!(view.frames(), 8192);
        // Head and stream agree where they overlap, and the tail is there
        assert!((view.sample(0, 512) - 512.0 / 8192.0).abs() < 1e-6);
        assert!((view.sample(0, 8000) - 8000.0 / 8192.0).abs() < 1e-6);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_available_frames_monotonic() {
        let path = write_test_wav("ripple_pool_monotonic.wav", 200000);
        let mut pool = FilePool::new(512, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());
        let id = pool
            .preload(Path::new("ripple_pool_monotonic.wav"), false, 0)
            .unwrap();

        let handle = pool.get_handle(id).unwrap();
        let mut last = 0;
        for _ in 0..1000 {
            let available = handle.data().available_frames();
            assert!(available >= last);
            last = available;
            if handle.data().status() == FileStatus::Done {
                break;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
        pool.wait_for_loads();

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reader_count_tracks_handles() {
        let path = write_test_wav("ripple_pool_readers.wav", 2048);
        let mut pool = FilePool::new(0, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());
        let id = pool
            .preload(Path::new("ripple_pool_readers.wav"), false, 0)
            .unwrap();

        assert_eq!(pool.entries[id].reader_count(), 0);
        let first = pool.get_handle(id).unwrap();
        let second = first.clone();
        assert_eq!(pool.entries[id].reader_count(), 2);
        drop(first);
        assert_eq!(pool.entries[id].reader_count(), 1);
        drop(second);
        assert_eq!(pool.entries[id].reader_count(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_full_preload_skips_streaming() {
        let path = write_test_wav("ripple_pool_full.wav", 512);
        let mut pool = FilePool::new(1024, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());
        let id = pool
            .preload(Path::new("ripple_pool_full.wav"), false, 0)
            .unwrap();
        assert_eq!(pool.entries[id].status(), FileStatus::FullLoaded);

        let handle = pool.get_handle(id).unwrap();
        assert_eq!(handle.data().status(), FileStatus::FullLoaded);
        assert_eq!(handle.view().frames(), 512);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reverse_loads_fully_reversed() {
        let path = write_test_wav("ripple_pool_reverse.wav", 1000);
        let mut pool = FilePool::new(100, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());
        let id = pool
            .preload(Path::new("ripple_pool_reverse.wav"), true, 0)
            .unwrap();
        let handle = pool.get_handle(id).unwrap();
        let view = handle.view();
        // First frame of the reversed file is the last of the original
        assert!((view.sample(0, 0) - 999.0 / 1000.0).abs() < 1e-6);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_gc_frees_streamed_body_after_grace() {
        let path = write_test_wav("ripple_pool_gc.wav", 8192);
        let mut pool = FilePool::new(1024, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());
        let id = pool
            .preload(Path::new("ripple_pool_gc.wav"), false, 0)
            .unwrap();

        {
            let handle = pool.get_handle(id).unwrap();
            pool.wait_for_loads();
            assert_eq!(handle.data().status(), FileStatus::Done);
        }

        // Handle dropped; a pass after the grace window frees the body
        let data = Arc::clone(&pool.entries[id]);
        gc_pass(
            &[Arc::clone(&data)],
            Instant::now() + Duration::from_secs(60),
            Duration::from_secs_f32(GC_GRACE_SECONDS),
        );
        assert_eq!(data.status(), FileStatus::Preloaded);
        assert_eq!(data.available_frames(), 0);
        // The preload head survives
        assert_eq!(data.preloaded_frames(), 1024);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_gc_spares_held_files() {
        let path = write_test_wav("ripple_pool_gc_held.wav", 8192);
        let mut pool = FilePool::new(1024, Oversampling::X1);
        pool.set_root_directory(&std::env::temp_dir());
        let id = pool
            .preload(Path::new("ripple_pool_gc_held.wav"), false, 0)
            .unwrap();

        let handle = pool.get_handle(id).unwrap();
        pool.wait_for_loads();

        let data = Arc::clone(&pool.entries[id]);
        gc_pass(
            &[Arc::clone(&data)],
            Instant::now() + Duration::from_secs(60),
            Duration::from_secs_f32(GC_GRACE_SECONDS),
        );
        assert_eq!(data.status(), FileStatus::Done);
        assert!(handle.view().frames() == 8192);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_oversampling_doubles_frames() {
        let path = write_test_wav("ripple_pool_oversample.wav", 1000);
        let mut pool = FilePool::new(0, Oversampling::X2);
        pool.set_root_directory(&std::env::temp_dir());
        let id = pool
            .preload(Path::new("ripple_pool_oversample.wav"), false, 0)
            .unwrap();
        let info = pool.information(id).unwrap();
        assert_eq!(info.total_frames, 2000);
        assert_eq!(info.sample_rate, 96000.0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_case_insensitive_resolution() {
        let dir = std::env::temp_dir().join("RippleCaseDir");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("Sample.wav");
        std::fs::write(&file, b"stub").unwrap();

        let resolved = resolve_path(&std::env::temp_dir(), Path::new("ripplecasedir/sample.wav"));
        assert_eq!(resolved, Some(file.clone()));

        let _ = std::fs::remove_file(&file);
        let _ = std::fs::remove_dir(&dir);
    }
}
