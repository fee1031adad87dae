//! Error taxonomy.
//!
//! Library components return [`Error`]. Each variant maps to a distinct process
//! exit status through [`Error::exit_code`], so that supervisors can tell a
//! missing `/dev/mem` apart from a hardware fault in the middle of a run.

use std::path::PathBuf;

/// Result type used by the library components.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the acquisition components.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The physical memory device could not be opened.
    #[error("failed to open {path}: {source}")]
    DeviceOpen {
        /// Path of the device.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Mapping a register window failed.
    #[error("failed to map {size:#x} bytes at physical address {base:#010x}: {source}")]
    Map {
        /// Physical base address of the window.
        base: usize,
        /// Size of the window in bytes.
        size: usize,
        /// Error reported by `mmap`.
        #[source]
        source: std::io::Error,
    },

    /// The DMA engine reported a fault or stopped answering.
    #[error("DMA hardware fault: {0}")]
    HardwareFault(String),

    /// Writing an output segment failed.
    #[error("failed to write {path}: {reason}")]
    Flush {
        /// Segment file that could not be written.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The input file does not exist or cannot be opened.
    #[error("input file {0} does not exist or cannot be opened")]
    InputMissing(PathBuf),

    /// The input file exists but cannot be decoded.
    #[error("unable to load input file {path}: {reason}")]
    InputUnreadable {
        /// Input file.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// The input file has the wrong bit depth.
    #[error("input bit depth is {actual} bits, expected {expected} bits")]
    BitDepthMismatch {
        /// Required bit depth.
        expected: u16,
        /// Bit depth of the input file.
        actual: u16,
    },

    /// The input file sample rate is below the acquisition rate.
    #[error("input sample rate {actual} Hz is less than {minimum} Hz")]
    SampleRateTooLow {
        /// Required minimum sample rate.
        minimum: u32,
        /// Sample rate of the input file.
        actual: u32,
    },
}

impl Error {
    /// Returns the process exit status associated with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 1,
            Error::InputMissing(_) => 2,
            Error::InputUnreadable { .. } => 3,
            Error::BitDepthMismatch { .. } => 4,
            Error::SampleRateTooLow { .. } => 5,
            Error::DeviceOpen { .. } => 10,
            Error::Map { .. } => 11,
            Error::HardwareFault(_) => 12,
            Error::Flush { .. } => 13,
        }
    }

    /// Returns `true` for errors that can only happen while opening the device.
    pub fn is_startup(&self) -> bool {
        matches!(self, Error::DeviceOpen { .. } | Error::Map { .. })
    }
}
