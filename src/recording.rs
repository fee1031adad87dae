//! Segmented recording.
//!
//! A [`RecordingSession`] accumulates the acquired samples in one growable
//! buffer per channel and writes them out as a sequence of segment files
//! `<name>_<index>`. The session decides, once per acquisition tick and before
//! new samples are absorbed, whether the current segment is complete and must
//! be rotated, or whether the buffers are exhausted and must grow. Growth
//! writes a work-in-progress snapshot of the current segment first, so that an
//! abrupt stop loses at most what was absorbed since the last snapshot.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Writer of complete segment files.
///
/// Each call to [`SegmentWriter::write_segment`] creates (or replaces) the
/// file for `index`, writes all the channels and closes it.
pub trait SegmentWriter<T> {
    /// Path of the segment file with the given index.
    fn segment_path(&self, index: usize) -> PathBuf;

    /// Writes the segment with the given index.
    ///
    /// The channels are given non-interleaved. Fails with [`Error::Flush`].
    fn write_segment(&mut self, index: usize, channels: &[Vec<T>]) -> Result<PathBuf>;
}

/// Per-channel sample buffers sharing a common capacity.
///
/// The capacity grows linearly, in whole increments, and is always the same
/// for every channel.
#[derive(Debug, Clone)]
pub struct ChannelBuffers<T> {
    channels: Vec<Vec<T>>,
    capacity: usize,
    increment: usize,
}

impl<T> ChannelBuffers<T> {
    /// Creates `channels` buffers with an initial capacity of `increment`
    /// samples each.
    pub fn new(channels: usize, increment: usize) -> ChannelBuffers<T> {
        ChannelBuffers {
            channels: (0..channels)
                .map(|_| Vec::with_capacity(increment))
                .collect(),
            capacity: increment,
            increment,
        }
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Current capacity of each channel, in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Growth increment, in samples.
    pub fn increment(&self) -> usize {
        self.increment
    }

    /// The channel buffers.
    pub fn channels(&self) -> &[Vec<T>] {
        &self.channels
    }

    /// Length of the fullest channel.
    pub fn max_len(&self) -> usize {
        self.channels.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Number of complete frames, that is, the length of the shortest channel.
    pub fn frames(&self) -> usize {
        self.channels.iter().map(Vec::len).min().unwrap_or(0)
    }

    /// Returns `true` if the fullest channel has reached the capacity.
    pub fn is_exhausted(&self) -> bool {
        self.max_len() >= self.capacity
    }

    /// Appends a sample to a channel.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is out of range.
    pub fn push(&mut self, channel: usize, sample: T) {
        self.channels[channel].push(sample);
    }

    /// Grows the capacity of every channel.
    ///
    /// The capacity grows by one increment, or by as many increments as
    /// needed to exceed the fullest channel if that has overshot it.
    pub fn grow(&mut self) {
        let increment = self.increment.max(1);
        let increments = self.max_len().saturating_sub(self.capacity) / increment + 1;
        self.capacity += increments * increment;
        for channel in &mut self.channels {
            let additional = self.capacity.saturating_sub(channel.len());
            channel.reserve_exact(additional);
        }
    }

    /// Removes the samples that follow the last complete frame.
    ///
    /// Returns them per channel.
    fn take_partial_frame(&mut self) -> Vec<Vec<T>> {
        let frames = self.frames();
        self.channels
            .iter_mut()
            .map(|channel| channel.split_off(frames))
            .collect()
    }

    fn restore(&mut self, partial: Vec<Vec<T>>) {
        for (channel, samples) in self.channels.iter_mut().zip(partial) {
            channel.extend(samples);
        }
    }

    /// Empties every channel and returns the capacity to one increment.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
            channel.shrink_to(self.increment);
        }
        self.capacity = self.increment;
    }
}

/// What [`RecordingSession::prepare`] did.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Prepared {
    /// Nothing to do.
    Nothing,
    /// The current segment was snapshotted and the buffers grew.
    Grown {
        /// Per-channel capacity before growing.
        from: usize,
        /// Per-channel capacity after growing.
        to: usize,
    },
    /// The current segment was completed and a new one started.
    Rotated {
        /// The completed segment file.
        saved: PathBuf,
    },
}

/// Recording session.
#[derive(Debug)]
pub struct RecordingSession<T, W> {
    writer: W,
    buffers: ChannelBuffers<T>,
    file_index: usize,
    bytes_per_sample: usize,
    samples_per_file: usize,
    recorded: usize,
    files_written: usize,
    last_written: Option<usize>,
}

impl<T: Clone, W: SegmentWriter<T>> RecordingSession<T, W> {
    /// Creates a recording session.
    ///
    /// `buffer_increment` is the per-channel buffer growth increment and the
    /// initial capacity. Fails with [`Error::Config`] if any of the sizes is
    /// zero.
    pub fn new(
        writer: W,
        channels: usize,
        buffer_increment: usize,
        bytes_per_sample: usize,
        samples_per_file: usize,
    ) -> Result<Self> {
        if channels == 0 || buffer_increment == 0 || samples_per_file == 0 {
            return Err(Error::Config(format!(
                "invalid recording session: {channels} channels, \
                 buffer increment {buffer_increment}, {samples_per_file} samples per file"
            )));
        }
        Ok(RecordingSession {
            writer,
            buffers: ChannelBuffers::new(channels, buffer_increment),
            file_index: 0,
            bytes_per_sample,
            samples_per_file,
            recorded: 0,
            files_written: 0,
            last_written: None,
        })
    }

    /// Index of the current segment.
    pub fn file_index(&self) -> usize {
        self.file_index
    }

    /// Samples absorbed into the current segment.
    pub fn recorded_samples(&self) -> usize {
        self.recorded
    }

    /// Rotation threshold.
    pub fn samples_per_file(&self) -> usize {
        self.samples_per_file
    }

    /// Number of distinct segment files written so far.
    pub fn files_written(&self) -> usize {
        self.files_written
    }

    /// The channel buffers.
    pub fn buffers(&self) -> &ChannelBuffers<T> {
        &self.buffers
    }

    /// The segment writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Path of the current segment file.
    pub fn current_path(&self) -> PathBuf {
        self.writer.segment_path(self.file_index)
    }

    /// Total bytes recorded by the session.
    pub fn total_bytes(&self) -> usize {
        self.bytes_per_sample * (self.file_index * self.samples_per_file + self.recorded)
    }

    /// Runs the per-tick flush decision.
    ///
    /// Must be called once per tick, before absorbing the new samples. A
    /// segment only ever holds complete frames: on rotation, the samples of an
    /// incomplete last frame are carried over to the next segment.
    pub fn prepare(&mut self) -> Result<Prepared> {
        if self.recorded >= self.samples_per_file && self.buffers.frames() > 0 {
            let partial = self.buffers.take_partial_frame();
            let saved = match self.flush() {
                Ok(saved) => saved,
                Err(e) => {
                    self.buffers.restore(partial);
                    return Err(e);
                }
            };
            tracing::info!("save audio file {}", saved.display());
            self.file_index += 1;
            self.buffers.reset();
            self.recorded = partial.iter().map(Vec::len).sum();
            self.buffers.restore(partial);
            Ok(Prepared::Rotated { saved })
        } else if self.buffers.is_exhausted() {
            let saved = self.flush()?;
            tracing::info!("save work in progress to {}", saved.display());
            let from = self.buffers.capacity();
            self.buffers.grow();
            let to = self.buffers.capacity();
            tracing::debug!("increase audio file buffer size from {from} to {to}");
            Ok(Prepared::Grown { from, to })
        } else {
            Ok(Prepared::Nothing)
        }
    }

    /// Absorbs a sample into a channel.
    pub fn absorb(&mut self, channel: usize, sample: T) {
        self.buffers.push(channel, sample);
        self.recorded += 1;
    }

    /// Absorbs one sample into each of the first `frame.len()` channels.
    pub fn absorb_frame(&mut self, frame: &[T]) {
        for (channel, sample) in frame.iter().enumerate() {
            self.absorb(channel, sample.clone());
        }
    }

    /// Writes the final flush.
    ///
    /// The current segment is written if it holds any sample. Returns the
    /// path written, if any.
    pub fn finish(&mut self) -> Result<Option<PathBuf>> {
        if self.recorded == 0 {
            return Ok(None);
        }
        let saved = self.flush()?;
        tracing::info!("save audio file {}", saved.display());
        Ok(Some(saved))
    }

    fn flush(&mut self) -> Result<PathBuf> {
        let path = self
            .writer
            .write_segment(self.file_index, self.buffers.channels())?;
        if self.last_written != Some(self.file_index) {
            self.last_written = Some(self.file_index);
            self.files_written += 1;
        }
        Ok(path)
    }
}

impl<T: Clone, W: SegmentWriter<T>> std::fmt::Display for RecordingSession<T, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Audio file: {}\tSamples this file: {}\tTotal size in bytes: {}",
            self.current_path().display(),
            self.recorded,
            self.total_bytes()
        )
    }
}
