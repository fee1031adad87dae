//! optrode application.
//!
//! This module contains a top-level structure [`App`] that represents the whole
//! optrode application. The acquisition and filtering work is synchronous and
//! runs on a blocking thread, while the async runtime only listens for the
//! operator stop request.

use crate::{
    acquisition::{
        AcquisitionLoop, Cancellation, Interleaved, Raw, RunSummary, SampleRouter, StopReason,
        Stimulus,
    },
    args::{Args, Command},
    config::{timestamped, CaptureMode, Config, RecordingConfig, RecordingSizes},
    dma::DmaChannelDriver,
    recording::RecordingSession,
    register::RegisterAccess,
    sim::SimulatedFpga,
    wav::{self, WavSegmentWriter},
    Error,
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// optrode application.
#[derive(Debug)]
pub struct App {
    args: Args,
    config: Config,
    cancel: CancellationToken,
}

/// What a run of the application produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// An acquisition run finished.
    Acquired(RunSummary),
    /// An offline filter run finished.
    Filtered {
        /// Number of samples processed.
        samples: usize,
    },
}

impl Outcome {
    /// Process exit status for this outcome.
    ///
    /// A run stopped by a hardware fault exits with the hardware fault status,
    /// even though the captured samples were saved.
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Acquired(RunSummary {
                reason: StopReason::HardwareFault(reason),
                ..
            }) => Error::HardwareFault(reason.clone()).exit_code(),
            _ => 0,
        }
    }
}

impl App {
    /// Creates a new application.
    #[tracing::instrument(name = "App::new", level = "debug")]
    pub fn new(args: &Args) -> Result<App> {
        let config = Config::load(args.config.as_deref())?;
        Ok(App {
            args: args.clone(),
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the application when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the application.
    ///
    /// The first Ctrl-C stops an acquisition at the next tick boundary, after
    /// which the captured samples are saved.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<Outcome> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("stopping data feed safely...");
                cancel.cancel();
            }
        });
        tokio::task::spawn_blocking(move || self.run_blocking())
            .await
            .context("application task failed")?
    }

    /// Runs the application on the current thread.
    pub fn run_blocking(self) -> Result<Outcome> {
        std::fs::create_dir_all(&self.args.output_dir).with_context(|| {
            format!(
                "failed to create output directory {}",
                self.args.output_dir.display()
            )
        })?;
        match &self.args.command {
            Command::Record => {
                let section = &self.config.recording;
                let stimulus = self
                    .args
                    .simulate
                    .then(|| synthetic_stimulus(section));
                self.acquire(section, stimulus).map(Outcome::Acquired)
            }
            Command::Collect { input } => {
                let section = &self.config.collection;
                let words = wav::read_collection_input(
                    input,
                    section.bits_per_sample,
                    section.sample_rate,
                )?
                .into_iter()
                .map(|x| x as u32)
                .collect();
                tracing::info!("{}: input meets the requirements", input.display());
                self.acquire(section, Some(Stimulus::new(words)))
                    .map(Outcome::Acquired)
            }
            Command::Filter { reference, optical } => self
                .filter(reference, optical)
                .map(|samples| Outcome::Filtered { samples }),
        }
    }

    fn acquire(&self, section: &RecordingConfig, stimulus: Option<Stimulus>) -> Result<RunSummary> {
        let sizes = section.sizes()?;
        let name = timestamped(&section.name, &chrono::Local::now());
        tracing::info!(
            "{name}: {} channels, {} Hz, {} bits, {:?} capture, {} samples per file, \
             file interval {}, buffer increment {}",
            sizes.recorded_channels,
            section.sample_rate,
            section.bits_per_sample,
            section.mode,
            sizes.samples_per_file,
            sizes.file_interval,
            sizes.buffer_increment
        );
        let run = Run {
            section,
            sizes,
            name,
            dir: self.args.output_dir.clone(),
            stimulus,
            cancel: self.cancel.clone(),
            app: self,
        };
        let device = self.config.device;
        let max_polls = self.config.dma.max_sync_polls;
        if self.args.simulate {
            let sim = SimulatedFpga::new(device);
            sim.set_loopback(true);
            let (ctrl, mm2s, s2mm) = sim.windows();
            tracing::info!("using simulated AXI DMA");
            run.start(DmaChannelDriver::new(ctrl, mm2s, s2mm, device, max_polls)?)
        } else {
            run.start(DmaChannelDriver::open(device, max_polls)?)
        }
    }

    fn filter(&self, reference: &Path, optical: &Path) -> Result<usize> {
        let (spec, reference) = wav::read_f32(reference)?;
        let (_, optical) = wav::read_f32(optical)?;
        if reference.len() != optical.len() {
            tracing::warn!(
                "reference has {} samples and optical {}; processing the shortest",
                reference.len(),
                optical.len()
            );
        }
        let mut canceller = self.config.filter.canceller();
        let samples = reference.len().min(optical.len());
        let mut err = Vec::with_capacity(samples);
        let mut stp = Vec::with_capacity(samples);
        let mut anc = Vec::with_capacity(samples);
        for (&o, &r) in optical.iter().zip(&reference) {
            let out = canceller.process(o, r);
            err.push(out.error);
            stp.push(out.step_size);
            anc.push(out.cancelled);
        }
        for (name, signal) in [("err.wav", &err), ("stp.wav", &stp), ("anc.wav", &anc)] {
            let path = self.args.output_dir.join(name);
            wav::write_f32(&path, spec.sample_rate, signal)?;
            tracing::info!("wrote {}", path.display());
        }
        Ok(samples)
    }
}

// Everything an acquisition needs once the DMA driver is open.
struct Run<'a> {
    app: &'a App,
    section: &'a RecordingConfig,
    sizes: RecordingSizes,
    name: String,
    dir: PathBuf,
    stimulus: Option<Stimulus>,
    cancel: CancellationToken,
}

impl Run<'_> {
    fn start<A: RegisterAccess>(self, driver: DmaChannelDriver<A>) -> Result<RunSummary> {
        let section = self.section;
        let channels = self.sizes.recorded_channels;
        let bits = u32::from(section.bits_per_sample);
        match section.mode {
            CaptureMode::Interleaved => {
                let spec = wav::int_spec(channels as u16, section.sample_rate, section.bits_per_sample);
                self.run::<_, i32, _>(driver, spec, Interleaved::new(channels, bits))
            }
            CaptureMode::Raw => {
                let spec = wav::int_spec(1, section.sample_rate, section.bits_per_sample);
                self.run::<_, i32, _>(driver, spec, Raw::new(bits))
            }
            CaptureMode::Cancellation => {
                let spec = wav::float_spec(channels as u16, section.sample_rate);
                let canceller = self.app.config.filter.canceller();
                self.run::<_, f32, _>(
                    driver,
                    spec,
                    Cancellation::new(canceller, bits, section.record_all),
                )
            }
        }
    }

    fn run<A, T, R>(
        self,
        driver: DmaChannelDriver<A>,
        spec: hound::WavSpec,
        router: R,
    ) -> Result<RunSummary>
    where
        A: RegisterAccess,
        T: hound::Sample + Copy + num_traits::Zero,
        R: SampleRouter<T>,
    {
        let writer = WavSegmentWriter::new(&self.dir, &self.name, spec);
        let session = RecordingSession::new(
            writer,
            self.sizes.recorded_channels,
            self.sizes.buffer_increment,
            self.section.bytes_per_sample as usize,
            self.sizes.samples_per_file,
        )?;
        let mut acquisition = AcquisitionLoop::new(driver, session, router, self.cancel)?;
        if let Some(stimulus) = self.stimulus {
            acquisition = acquisition.with_stimulus(stimulus);
        }
        Ok(acquisition.run()?)
    }
}

/// One second of `(optical, reference)` words: a 37 Hz signal buried in a
/// 50 Hz hum that the reference channel picks up too.
fn synthetic_stimulus(section: &RecordingConfig) -> Stimulus {
    let full_scale = (1u64 << (section.bits_per_sample - 1)) as f64;
    let rate = f64::from(section.sample_rate);
    let words = (0..section.sample_rate)
        .flat_map(|n| {
            let t = f64::from(n) / rate;
            let signal = 0.1 * (2.0 * std::f64::consts::PI * 37.0 * t).sin();
            let hum = 0.3 * (2.0 * std::f64::consts::PI * 50.0 * t).sin();
            [
                ((signal + hum) * full_scale) as i32 as u32,
                (hum * full_scale) as i32 as u32,
            ]
        })
        .collect();
    Stimulus::repeating(words)
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    fn args(dir: &Path, extra: &[&str]) -> Args {
        let mut argv = vec!["optrode", "--simulate", "--output-dir", dir.to_str().unwrap()];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn simulated_record_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(&args(dir.path(), &["record"])).unwrap();
        app.cancellation_token().cancel();
        let outcome = app.run_blocking().unwrap();
        let Outcome::Acquired(summary) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.files, 0);
        assert_eq!(Outcome::Acquired(summary).exit_code(), 0);
    }

    #[test]
    fn missing_collection_input() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.wav");
        let app = App::new(&args(dir.path(), &["collect", missing.to_str().unwrap()])).unwrap();
        let err = app.run_blocking().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>().map(Error::exit_code), Some(2));
    }

    #[test]
    fn hardware_fault_exit_code() {
        let outcome = Outcome::Acquired(RunSummary {
            ticks: 1,
            bytes_received: 8,
            bytes_sent: 8,
            samples: 2,
            files: 1,
            reason: StopReason::HardwareFault("S2MM status".into()),
        });
        assert_eq!(outcome.exit_code(), 12);
        assert_eq!(Outcome::Filtered { samples: 3 }.exit_code(), 0);
    }

    #[test]
    fn synthetic_stimulus_is_paired_and_repeats() {
        let stimulus = synthetic_stimulus(&RecordingConfig::default());
        assert_eq!(stimulus.remaining(), None);
    }
}
