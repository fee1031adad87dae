//! Acquisition loop.
//!
//! The [`AcquisitionLoop`] owns the DMA driver and the recording session, and
//! runs the acquisition ticks until it is cancelled, the stimulus runs out or
//! the hardware faults. Each tick drains the S2MM channel and hands the words
//! to a [`SampleRouter`], which decides how they reach the channel buffers of
//! the session.

use crate::dma::{DmaChannelDriver, TRANSFER_QUANTUM};
use crate::error::{Error, Result};
use crate::filter::NoiseCanceller;
use crate::recording::{RecordingSession, SegmentWriter};
use crate::register::RegisterAccess;
use tokio_util::sync::CancellationToken;

/// Interval, in ticks, of the transfer statistics log.
pub const STATISTICS_INTERVAL: u64 = 1024;

/// Sign-extends the low `bits` bits of a word.
///
/// # Panics
///
/// Panics if `bits` is not in `1..=32`.
pub fn sign_extend(word: u32, bits: u32) -> i32 {
    assert!((1..=32).contains(&bits));
    let shift = 32 - bits;
    ((word << shift) as i32) >> shift
}

/// Distribution of the received words to the recorded channels.
pub trait SampleRouter<T> {
    /// Number of channels recorded by the session.
    fn channels(&self) -> usize;

    /// Routes the words received in one tick into the session.
    ///
    /// Returns the number of samples absorbed.
    fn route<W: SegmentWriter<T>>(
        &mut self,
        words: impl IntoIterator<Item = u32>,
        session: &mut RecordingSession<T, W>,
    ) -> usize;

    /// Words held back until the rest of their frame arrives.
    fn pending(&self) -> usize {
        0
    }
}

/// Round-robin distribution over several channels.
///
/// The channel cursor persists across ticks, so a frame split between two
/// transfers is still distributed correctly.
#[derive(Debug, Clone)]
pub struct Interleaved {
    channels: usize,
    cursor: usize,
    bits: u32,
}

impl Interleaved {
    /// Creates a router over `channels` channels of `bits`-bit samples.
    pub fn new(channels: usize, bits: u32) -> Interleaved {
        Interleaved {
            channels,
            cursor: 0,
            bits,
        }
    }
}

impl SampleRouter<i32> for Interleaved {
    fn channels(&self) -> usize {
        self.channels
    }

    fn route<W: SegmentWriter<i32>>(
        &mut self,
        words: impl IntoIterator<Item = u32>,
        session: &mut RecordingSession<i32, W>,
    ) -> usize {
        let mut absorbed = 0;
        for word in words {
            session.absorb(self.cursor, sign_extend(word, self.bits));
            self.cursor = (self.cursor + 1) % self.channels;
            absorbed += 1;
        }
        absorbed
    }
}

/// All the words go to a single channel.
#[derive(Debug, Clone)]
pub struct Raw {
    bits: u32,
}

impl Raw {
    /// Creates a router of `bits`-bit samples.
    pub fn new(bits: u32) -> Raw {
        Raw { bits }
    }
}

impl SampleRouter<i32> for Raw {
    fn channels(&self) -> usize {
        1
    }

    fn route<W: SegmentWriter<i32>>(
        &mut self,
        words: impl IntoIterator<Item = u32>,
        session: &mut RecordingSession<i32, W>,
    ) -> usize {
        let mut absorbed = 0;
        for word in words {
            session.absorb(0, sign_extend(word, self.bits));
            absorbed += 1;
        }
        absorbed
    }
}

/// Noise cancellation of `(optical, reference)` word pairs.
///
/// The samples are scaled to full scale before filtering. The session records
/// the filter error, or, with `record_all`, the DC-free optical and
/// reference signals, the filter error and the step size.
#[derive(Debug, Clone)]
pub struct Cancellation {
    canceller: NoiseCanceller<f32>,
    bits: u32,
    scale: f32,
    record_all: bool,
    pending: Option<u32>,
}

impl Cancellation {
    /// Creates a router feeding `canceller` with `bits`-bit samples.
    pub fn new(canceller: NoiseCanceller<f32>, bits: u32, record_all: bool) -> Cancellation {
        Cancellation {
            canceller,
            bits,
            scale: 1.0 / (1u64 << (bits - 1)) as f32,
            record_all,
            pending: None,
        }
    }

    /// The noise canceller.
    pub fn canceller(&self) -> &NoiseCanceller<f32> {
        &self.canceller
    }
}

impl SampleRouter<f32> for Cancellation {
    fn channels(&self) -> usize {
        if self.record_all {
            4
        } else {
            1
        }
    }

    fn route<W: SegmentWriter<f32>>(
        &mut self,
        words: impl IntoIterator<Item = u32>,
        session: &mut RecordingSession<f32, W>,
    ) -> usize {
        let mut absorbed = 0;
        for word in words {
            let Some(optical) = self.pending.take() else {
                self.pending = Some(word);
                continue;
            };
            let optical = sign_extend(optical, self.bits) as f32 * self.scale;
            let reference = sign_extend(word, self.bits) as f32 * self.scale;
            let out = self.canceller.process(optical, reference);
            if self.record_all {
                session.absorb_frame(&[out.optical, out.reference, out.error, out.step_size]);
                absorbed += 4;
            } else {
                session.absorb(0, out.error);
                absorbed += 1;
            }
        }
        absorbed
    }

    fn pending(&self) -> usize {
        usize::from(self.pending.is_some())
    }
}

/// Words sent through the MM2S channel, one transfer quantum per tick.
#[derive(Debug, Clone)]
pub struct Stimulus {
    words: Vec<u32>,
    index: usize,
    repeat: bool,
}

impl Stimulus {
    const STRIDE: usize = TRANSFER_QUANTUM / 4;

    /// Creates a stimulus that is sent once.
    ///
    /// A trailing word that does not fill a whole transfer is dropped.
    pub fn new(mut words: Vec<u32>) -> Stimulus {
        words.truncate(words.len() - words.len() % Self::STRIDE);
        Stimulus {
            words,
            index: 0,
            repeat: false,
        }
    }

    /// Creates a stimulus that starts over when it runs out.
    pub fn repeating(words: Vec<u32>) -> Stimulus {
        Stimulus {
            repeat: true,
            ..Stimulus::new(words)
        }
    }

    /// Number of transfers left, or `None` if the stimulus repeats.
    pub fn remaining(&self) -> Option<usize> {
        (!self.repeat).then(|| (self.words.len() - self.index) / Self::STRIDE)
    }

    /// Index of the next words to send.
    fn next_index(&mut self) -> Option<usize> {
        if self.index >= self.words.len() {
            if !self.repeat || self.words.is_empty() {
                return None;
            }
            self.index = 0;
        }
        let index = self.index;
        self.index += Self::STRIDE;
        Some(index)
    }
}

/// Reason why an acquisition run stopped.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StopReason {
    /// The cancellation token was cancelled.
    Cancelled,
    /// All the stimulus was sent and received.
    StimulusExhausted,
    /// The DMA hardware faulted.
    HardwareFault(String),
}

/// Summary of an acquisition run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RunSummary {
    /// Ticks run.
    pub ticks: u64,
    /// Bytes received through the S2MM channel.
    pub bytes_received: u64,
    /// Bytes sent through the MM2S channel.
    pub bytes_sent: u64,
    /// Samples absorbed by the recording session.
    pub samples: u64,
    /// Distinct segment files written.
    pub files: usize,
    /// Why the run stopped.
    pub reason: StopReason,
}

/// Acquisition loop.
#[derive(Debug)]
pub struct AcquisitionLoop<A, T, W, R> {
    driver: DmaChannelDriver<A>,
    session: RecordingSession<T, W>,
    router: R,
    stimulus: Option<Stimulus>,
    cancel: CancellationToken,
}

impl<A, T, W, R> AcquisitionLoop<A, T, W, R>
where
    A: RegisterAccess,
    T: Clone,
    W: SegmentWriter<T>,
    R: SampleRouter<T>,
{
    /// Creates an acquisition loop.
    ///
    /// The session must record as many channels as `router` produces.
    pub fn new(
        driver: DmaChannelDriver<A>,
        session: RecordingSession<T, W>,
        router: R,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let channels = session.buffers().num_channels();
        if channels != router.channels() {
            return Err(Error::Config(format!(
                "recording session has {channels} channels but the capture mode produces {}",
                router.channels()
            )));
        }
        Ok(AcquisitionLoop {
            driver,
            session,
            router,
            stimulus: None,
            cancel,
        })
    }

    /// Sends `stimulus` through the MM2S channel, one transfer per tick.
    ///
    /// The run stops once a non-repeating stimulus has been sent and received.
    pub fn with_stimulus(mut self, stimulus: Stimulus) -> Self {
        self.stimulus = Some(stimulus);
        self
    }

    /// The recording session.
    pub fn session(&self) -> &RecordingSession<T, W> {
        &self.session
    }

    /// The DMA driver.
    pub fn driver(&self) -> &DmaChannelDriver<A> {
        &self.driver
    }

    /// The sample router.
    pub fn router(&self) -> &R {
        &self.router
    }

    /// Runs ticks until the loop stops.
    ///
    /// The cancellation token is checked once per tick, before the tick
    /// starts. Whatever the stop reason, the session gets its final flush
    /// before this returns. Hardware faults end the run with
    /// [`StopReason::HardwareFault`]; segment write failures are returned as
    /// errors immediately.
    #[tracing::instrument(name = "AcquisitionLoop::run", level = "debug", skip_all)]
    pub fn run(&mut self) -> Result<RunSummary> {
        let mut ticks = 0;
        let mut bytes_received = 0;
        let mut bytes_sent = 0;
        let mut samples = 0;
        tracing::info!("{}", self.session);
        let reason = loop {
            if self.cancel.is_cancelled() {
                tracing::info!("stopping data feed");
                break StopReason::Cancelled;
            }
            if !self.driver.state().is_usable() {
                break StopReason::HardwareFault(format!(
                    "DMA driver is in state {:?}",
                    self.driver.state()
                ));
            }

            self.session.prepare()?;

            if let Some(stimulus) = &mut self.stimulus {
                let Some(index) = stimulus.next_index() else {
                    break StopReason::StimulusExhausted;
                };
                match self.driver.send(&stimulus.words, index) {
                    Ok(bytes) => bytes_sent += bytes as u64,
                    Err(Error::HardwareFault(reason)) => break StopReason::HardwareFault(reason),
                    Err(e) => return Err(e),
                }
            }

            match self.driver.fill_buffer() {
                Ok(bytes) => bytes_received += bytes as u64,
                Err(Error::HardwareFault(reason)) => break StopReason::HardwareFault(reason),
                Err(e) => return Err(e),
            }
            samples += self
                .router
                .route(self.driver.drain_buffer(), &mut self.session) as u64;

            ticks += 1;
            if ticks % STATISTICS_INTERVAL == 0 {
                tracing::debug!(
                    "ticks: {ticks}\treceived: {bytes_received}\tsent: {bytes_sent}\t{}",
                    self.session
                );
            }
        };
        if let StopReason::HardwareFault(fault) = &reason {
            tracing::error!("FPGA not available: {fault}");
        }
        let pending = self.router.pending();
        if pending != 0 {
            tracing::debug!("discarding {pending} words of an incomplete frame");
        }

        self.session.finish()?;
        let summary = RunSummary {
            ticks,
            bytes_received,
            bytes_sent,
            samples,
            files: self.session.files_written(),
            reason,
        };
        tracing::info!(
            "acquisition stopped ({:?}) after {} ticks, {} samples in {} files",
            summary.reason,
            summary.ticks,
            summary.samples,
            summary.files
        );
        Ok(summary)
    }
}
