use optrode::{
    acquisition::{AcquisitionLoop, Cancellation, Raw, StopReason, Stimulus},
    dma::{regs, DeviceAddresses, DmaChannelDriver, DmaState},
    filter::{LeakyIntegrator, NlmsParameters, NoiseCanceller, StepMode},
    recording::RecordingSession,
    sim::{SimWindow, SimulatedFpga},
    wav::{self, WavSegmentWriter},
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn driver(sim: &SimulatedFpga) -> DmaChannelDriver<SimWindow> {
    let (ctrl, mm2s, s2mm) = sim.windows();
    DmaChannelDriver::new(ctrl, mm2s, s2mm, sim.addresses(), 10_000).unwrap()
}

fn read_f32(path: &Path) -> Vec<f32> {
    hound::WavReader::open(path)
        .unwrap()
        .samples::<f32>()
        .map(|s| s.unwrap())
        .collect()
}

#[test]
fn cancellation_rotates_segments_and_saves_remainder() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedFpga::new(DeviceAddresses::default());
    sim.set_loopback(true);

    let params = NlmsParameters {
        initial_step: 1e-6,
        min_step: 1e-7,
        max_step: 1e-5,
        epsilon: 1e-6,
        mode: StepMode::Variable {
            alpha: 0.5,
            gamma: 0.5,
        },
        normalized: true,
    };
    let canceller = NoiseCanceller::new(1, params, LeakyIntegrator::new(0.99, 0.01, 0.0));
    let writer = WavSegmentWriter::new(dir.path(), "anc", wav::float_spec(1, 10_000));
    let session = RecordingSession::new(writer, 1, 64, 4, 4).unwrap();
    // identical optical and reference channels
    let words: Vec<u32> = (0..10).flat_map(|_| [0x10_0000, 0x10_0000]).collect();
    let mut acquisition = AcquisitionLoop::new(
        driver(&sim),
        session,
        Cancellation::new(canceller, 24, false),
        CancellationToken::new(),
    )
    .unwrap()
    .with_stimulus(Stimulus::new(words));

    let summary = acquisition.run().unwrap();
    assert_eq!(summary.reason, StopReason::StimulusExhausted);
    assert_eq!(summary.ticks, 10);
    assert_eq!(summary.samples, 10);
    assert_eq!(summary.files, 3);

    let segments: Vec<Vec<f32>> = (0..3)
        .map(|n| read_f32(&dir.path().join(format!("anc_{n}.wav"))))
        .collect();
    assert_eq!(segments[0].len(), 4);
    assert_eq!(segments[1].len(), 4);
    assert_eq!(segments[2].len(), 2);
    assert!(!dir.path().join("anc_3.wav").exists());

    let errors: Vec<f32> = segments.concat();
    for pair in errors.windows(2) {
        assert!(pair[1].abs() <= pair[0].abs(), "{errors:?}");
    }
    assert_eq!(
        acquisition.session().to_string(),
        format!(
            "Audio file: {}\tSamples this file: 2\tTotal size in bytes: 40",
            dir.path().join("anc_2.wav").display()
        )
    );
}

#[test]
fn hardware_fault_saves_what_was_captured() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedFpga::new(DeviceAddresses::default());
    sim.push_stream(&[1, 2]);
    let dma = driver(&sim);
    sim.force_status(regs::STATUS_DMA_INTERNAL_ERR);

    let writer = WavSegmentWriter::new(dir.path(), "raw", wav::int_spec(1, 1000, 24));
    let mut session = RecordingSession::new(writer, 1, 64, 4, 1000).unwrap();
    for sample in [5, -6, 7] {
        session.absorb(0, sample);
    }
    let mut acquisition =
        AcquisitionLoop::new(dma, session, Raw::new(24), CancellationToken::new()).unwrap();
    let summary = acquisition.run().unwrap();
    assert!(matches!(summary.reason, StopReason::HardwareFault(_)));
    assert_eq!(summary.ticks, 0);
    assert_eq!(acquisition.driver().state(), DmaState::Error);

    let saved: Vec<i32> = hound::WavReader::open(dir.path().join("raw_0.wav"))
        .unwrap()
        .samples::<i32>()
        .map(|s| s.unwrap())
        .collect();
    assert_eq!(saved, [5, -6, 7]);
}

#[test]
fn cancellation_from_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        let dir = dir.path().to_owned();
        std::thread::spawn(move || {
            let sim = SimulatedFpga::new(DeviceAddresses::default());
            sim.set_loopback(true);
            let writer = WavSegmentWriter::new(dir, "raw", wav::int_spec(1, 1000, 24));
            let session = RecordingSession::new(writer, 1, 1 << 16, 4, usize::MAX).unwrap();
            AcquisitionLoop::new(driver(&sim), session, Raw::new(24), cancel)
                .unwrap()
                .with_stimulus(Stimulus::repeating(vec![1, 2]))
                .run()
                .unwrap()
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(50));
    cancel.cancel();
    let summary = handle.join().unwrap();
    assert_eq!(summary.reason, StopReason::Cancelled);
    assert!(summary.ticks > 0);
    assert_eq!(summary.samples, 2 * summary.ticks);
    let saved = hound::WavReader::open(dir.path().join("raw_0.wav")).unwrap();
    assert_eq!(u64::from(saved.len()), summary.samples);
}
