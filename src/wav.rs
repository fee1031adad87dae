//! WAV file input and output.
//!
//! Segment files are written with [`WavSegmentWriter`], which implements the
//! [`SegmentWriter`] boundary of the recording session. The input helpers load
//! and validate the files used by the data collection and offline filtering
//! commands.

use crate::error::{Error, Result};
use crate::recording::SegmentWriter;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Returns the format of an integer WAV file.
pub fn int_spec(channels: u16, sample_rate: u32, bits_per_sample: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample,
        sample_format: SampleFormat::Int,
    }
}

/// Returns the format of a 32-bit float WAV file.
pub fn float_spec(channels: u16, sample_rate: u32) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Segment writer producing `<dir>/<name>_<index>.wav`.
///
/// Shorter channels are padded with zeros up to the length of the longest
/// one, since a WAV file holds whole frames only.
#[derive(Debug, Clone)]
pub struct WavSegmentWriter<T> {
    dir: PathBuf,
    name: String,
    spec: WavSpec,
    _sample: PhantomData<fn(T)>,
}

impl<T> WavSegmentWriter<T> {
    /// Creates a segment writer.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>, spec: WavSpec) -> Self {
        WavSegmentWriter {
            dir: dir.into(),
            name: name.into(),
            spec,
            _sample: PhantomData,
        }
    }

    /// Format of the segment files.
    pub fn spec(&self) -> WavSpec {
        self.spec
    }

    /// Base name of the segment files.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> SegmentWriter<T> for WavSegmentWriter<T>
where
    T: hound::Sample + Copy + num_traits::Zero,
{
    fn segment_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{}.wav", self.name, index))
    }

    fn write_segment(&mut self, index: usize, channels: &[Vec<T>]) -> Result<PathBuf> {
        let path = self.segment_path(index);
        let flush_error = |reason: String| Error::Flush {
            path: path.clone(),
            reason,
        };
        if channels.len() != usize::from(self.spec.channels) {
            return Err(flush_error(format!(
                "{} channels given for a {}-channel file",
                channels.len(),
                self.spec.channels
            )));
        }
        let frames = channels.iter().map(Vec::len).max().unwrap_or(0);
        let mut writer =
            WavWriter::create(&path, self.spec).map_err(|e| flush_error(e.to_string()))?;
        for n in 0..frames {
            for channel in channels {
                let sample = channel.get(n).copied().unwrap_or_else(T::zero);
                writer
                    .write_sample(sample)
                    .map_err(|e| flush_error(e.to_string()))?;
            }
        }
        writer.finalize().map_err(|e| flush_error(e.to_string()))?;
        tracing::debug!("wrote {frames} frames to {}", path.display());
        Ok(path)
    }
}

/// Opens a WAV file for reading.
///
/// Fails with [`Error::InputMissing`] if the file cannot be opened and with
/// [`Error::InputUnreadable`] if it is not a WAV file.
pub fn open(path: &Path) -> Result<WavReader<BufReader<File>>> {
    let file = File::open(path).map_err(|_| Error::InputMissing(path.to_owned()))?;
    WavReader::new(BufReader::new(file)).map_err(|e| Error::InputUnreadable {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

/// Loads the first channel of a data collection input file.
///
/// The file must have the given bit depth and a sample rate of at least
/// `min_sample_rate`. The samples are trimmed to an even count, since they
/// are sent two at a time.
pub fn read_collection_input(path: &Path, bits: u16, min_sample_rate: u32) -> Result<Vec<i32>> {
    let mut reader = open(path)?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int {
        return Err(Error::InputUnreadable {
            path: path.to_owned(),
            reason: "float samples where integer samples were expected".into(),
        });
    }
    if spec.bits_per_sample != bits {
        return Err(Error::BitDepthMismatch {
            expected: bits,
            actual: spec.bits_per_sample,
        });
    }
    if spec.sample_rate < min_sample_rate {
        return Err(Error::SampleRateTooLow {
            minimum: min_sample_rate,
            actual: spec.sample_rate,
        });
    }
    let mut samples = first_channel(path, &spec, reader.samples::<i32>())?;
    tracing::info!("{}: {} samples", path.display(), samples.len());
    if samples.len() % 2 != 0 {
        samples.pop();
        tracing::info!("input trimmed to {} samples", samples.len());
    }
    Ok(samples)
}

/// Loads the first channel of a WAV file as floating point samples.
///
/// Integer samples are scaled to the range [-1, 1).
pub fn read_f32(path: &Path) -> Result<(WavSpec, Vec<f32>)> {
    let mut reader = open(path)?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        SampleFormat::Float => first_channel(path, &spec, reader.samples::<f32>())?,
        SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
            first_channel(path, &spec, reader.samples::<i32>())?
                .into_iter()
                .map(|x| x as f32 * scale)
                .collect()
        }
    };
    Ok((spec, samples))
}

fn first_channel<S>(
    path: &Path,
    spec: &WavSpec,
    samples: impl Iterator<Item = hound::Result<S>>,
) -> Result<Vec<S>> {
    samples
        .step_by(usize::from(spec.channels.max(1)))
        .collect::<hound::Result<Vec<S>>>()
        .map_err(|e| Error::InputUnreadable {
            path: path.to_owned(),
            reason: e.to_string(),
        })
}

/// Writes a mono 32-bit float WAV file.
pub fn write_f32(path: &Path, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let flush_error = |e: hound::Error| Error::Flush {
        path: path.to_owned(),
        reason: e.to_string(),
    };
    let mut writer = WavWriter::create(path, float_spec(1, sample_rate)).map_err(flush_error)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(flush_error)?;
    }
    writer.finalize().map_err(flush_error)
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_int(path: &Path, spec: WavSpec, samples: &[i32]) {
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn segment_files_interleave_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WavSegmentWriter::<i32>::new(dir.path(), "rec", int_spec(2, 1000, 24));
        let path = writer
            .write_segment(3, &[vec![1, 2, 3], vec![-1, -2]])
            .unwrap();
        assert_eq!(path, dir.path().join("rec_3.wav"));
        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 24);
        let samples: Vec<i32> = reader.samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, [1, -1, 2, -2, 3, 0]);
    }

    #[test]
    fn segment_rewrite_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WavSegmentWriter::<f32>::new(dir.path(), "anc", float_spec(1, 1000));
        writer.write_segment(0, &[vec![0.5, 0.25]]).unwrap();
        let path = writer.write_segment(0, &[vec![0.5, 0.25, 0.125]]).unwrap();
        assert_eq!(WavReader::open(&path).unwrap().len(), 3);
    }

    #[test]
    fn unwritable_segment_is_flush_error() {
        let mut writer = WavSegmentWriter::<i32>::new("/nonexistent/dir", "rec", int_spec(1, 1000, 24));
        let err = writer.write_segment(0, &[vec![1]]).unwrap_err();
        assert!(matches!(err, Error::Flush { .. }));
        assert_eq!(err.exit_code(), 13);
    }

    #[test]
    fn collection_input_validation() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.wav");
        assert_eq!(
            read_collection_input(&missing, 24, 64000).unwrap_err().exit_code(),
            2
        );

        let garbage = dir.path().join("garbage.wav");
        std::fs::write(&garbage, b"not a wav file").unwrap();
        assert_eq!(
            read_collection_input(&garbage, 24, 64000).unwrap_err().exit_code(),
            3
        );

        let shallow = dir.path().join("shallow.wav");
        write_int(&shallow, int_spec(1, 64000, 16), &[1, 2]);
        assert_eq!(
            read_collection_input(&shallow, 24, 64000).unwrap_err().exit_code(),
            4
        );

        let slow = dir.path().join("slow.wav");
        write_int(&slow, int_spec(1, 48000, 24), &[1, 2]);
        assert_eq!(
            read_collection_input(&slow, 24, 64000).unwrap_err().exit_code(),
            5
        );
    }

    #[test]
    fn collection_input_first_channel_trimmed_to_even() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        write_int(&path, int_spec(2, 96000, 24), &[1, 10, 2, 20, 3, 30]);
        assert_eq!(read_collection_input(&path, 24, 64000).unwrap(), [1, 2]);
    }

    #[test]
    fn float_input_from_int_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        write_int(&path, int_spec(1, 1000, 16), &[16384, -32768]);
        let (spec, samples) = read_f32(&path).unwrap();
        assert_eq!(spec.sample_rate, 1000);
        assert_eq!(samples, [0.5, -1.0]);

        let out = dir.path().join("out.wav");
        write_f32(&out, 1000, &samples).unwrap();
        assert_eq!(read_f32(&out).unwrap().1, [0.5, -1.0]);
    }
}
