//! optrode acquires the sample stream of an FPGA optrode front end through an
//! AXI DMA, removes the noise that the optical channel shares with a reference
//! channel with an adaptive filter, and records the result as segmented WAV
//! files. It runs on the processing system of a Zynq device, accessing the DMA
//! registers through `/dev/mem`, or on a development host against a simulated
//! DMA.

#![warn(missing_docs)]

pub mod acquisition;
pub mod app;
pub mod args;
pub mod config;
pub mod dma;
pub mod error;
pub mod filter;
pub mod recording;
pub mod register;
pub mod sim;
pub mod wav;

pub use error::{Error, Result};
