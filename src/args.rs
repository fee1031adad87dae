//! optrode CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the optrode
//! application.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// optrode CLI arguments.
#[derive(Parser, Debug, Clone, Eq, PartialEq, Hash)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Use a simulated AXI DMA with the MM2S channel looped back to S2MM
    #[clap(long, global = true)]
    pub simulate: bool,
    /// Directory for the output files
    #[clap(long, global = true, default_value = ".")]
    pub output_dir: PathBuf,
    /// Command to run
    #[clap(subcommand)]
    pub command: Command,
}

/// optrode commands.
#[derive(Subcommand, Debug, Clone, Eq, PartialEq, Hash)]
pub enum Command {
    /// Record continuously until interrupted
    Record,
    /// Send a WAV file through the FPGA and record what comes back
    Collect {
        /// Input WAV file (the first channel is sent)
        input: PathBuf,
    },
    /// Run the noise canceller offline on two WAV files
    Filter {
        /// Reference (noise) WAV file
        #[clap(long)]
        reference: PathBuf,
        /// Optical (signal plus noise) WAV file
        #[clap(long)]
        optical: PathBuf,
    },
}
