//! AXI DMA userspace driver.
//!
//! This module drives the two channels of a Xilinx AXI DMA in direct register
//! mode: MM2S (memory to stream), used to feed an outbound or simulated stream,
//! and S2MM (stream to memory), which brings the acquired samples in. The
//! driver owns three register windows: the DMA control block and the source
//! and destination memory windows.

use crate::error::{Error, Result};
use crate::register::{RegisterAccess, RegisterWindow};
use serde::{Deserialize, Serialize};

/// Register offsets and bit definitions of the AXI DMA.
///
/// These values are fixed by the FPGA IP and must not be changed.
pub mod regs {
    /// MM2S control register.
    pub const MM2S_CONTROL_REGISTER: usize = 0x00;
    /// MM2S status register.
    pub const MM2S_STATUS_REGISTER: usize = 0x04;
    /// MM2S source address register.
    pub const MM2S_SRC_ADDRESS_REGISTER: usize = 0x18;
    /// MM2S transfer length register.
    pub const MM2S_TRNSFR_LENGTH_REGISTER: usize = 0x28;

    /// S2MM control register.
    pub const S2MM_CONTROL_REGISTER: usize = 0x30;
    /// S2MM status register.
    pub const S2MM_STATUS_REGISTER: usize = 0x34;
    /// S2MM destination address register.
    pub const S2MM_DST_ADDRESS_REGISTER: usize = 0x48;
    /// S2MM buffer length register.
    pub const S2MM_BUFF_LENGTH_REGISTER: usize = 0x58;

    /// Channel halted.
    pub const STATUS_HALTED: u32 = 0x0000_0001;
    /// Channel idle.
    pub const STATUS_IDLE: u32 = 0x0000_0002;
    /// Scatter-gather engine included.
    pub const STATUS_SG_INCLDED: u32 = 0x0000_0008;
    /// DMA internal error.
    pub const STATUS_DMA_INTERNAL_ERR: u32 = 0x0000_0010;
    /// DMA slave error.
    pub const STATUS_DMA_SLAVE_ERR: u32 = 0x0000_0020;
    /// DMA decode error.
    pub const STATUS_DMA_DECODE_ERR: u32 = 0x0000_0040;
    /// Scatter-gather internal error.
    pub const STATUS_SG_INTERNAL_ERR: u32 = 0x0000_0100;
    /// Scatter-gather slave error.
    pub const STATUS_SG_SLAVE_ERR: u32 = 0x0000_0200;
    /// Scatter-gather decode error.
    pub const STATUS_SG_DECODE_ERR: u32 = 0x0000_0400;
    /// Interrupt on completion.
    pub const STATUS_IOC_IRQ: u32 = 0x0000_1000;
    /// Interrupt on delay.
    pub const STATUS_DELAY_IRQ: u32 = 0x0000_2000;
    /// Error interrupt.
    pub const STATUS_ERR_IRQ: u32 = 0x0000_4000;

    /// All the error bits of the status register.
    pub const STATUS_ANY_ERR: u32 = STATUS_DMA_INTERNAL_ERR
        | STATUS_DMA_SLAVE_ERR
        | STATUS_DMA_DECODE_ERR
        | STATUS_SG_INTERNAL_ERR
        | STATUS_SG_SLAVE_ERR
        | STATUS_SG_DECODE_ERR
        | STATUS_ERR_IRQ;

    /// Control code: halt.
    pub const HALT_DMA: u32 = 0x0000_0000;
    /// Control code: run.
    pub const RUN_DMA: u32 = 0x0000_0001;
    /// Control code: soft reset.
    pub const RESET_DMA: u32 = 0x0000_0004;
    /// Control code: enable IOC, delay and error interrupts.
    pub const ENABLE_ALL_IRQ: u32 = 0x0000_7000;
}

use regs::*;

/// Size in bytes of a single DMA transfer.
pub const TRANSFER_QUANTUM: usize = 8;

/// Words staged by [`DmaChannelDriver::spoof`].
pub const SPOOF_PATTERN: [u32; TRANSFER_QUANTUM / 4] = [0xdead_beef, 0x1234_5678];

/// Default bound on the number of status polls of a single handshake.
pub const DEFAULT_MAX_SYNC_POLLS: u64 = 1 << 24;

/// Physical addresses of the DMA control block and memory windows.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceAddresses {
    /// Physical base address of the AXI DMA control block.
    pub ctrl_base: u32,
    /// Size of the control block window in bytes.
    pub ctrl_size: u32,
    /// Physical base address of the MM2S source window.
    pub mm2s_base: u32,
    /// Physical base address of the S2MM destination window.
    pub s2mm_base: u32,
    /// Size of each of the stream windows in bytes.
    pub stream_size: u32,
}

impl Default for DeviceAddresses {
    fn default() -> DeviceAddresses {
        DeviceAddresses {
            ctrl_base: 0x4040_0000,
            ctrl_size: 0xFFFF,
            mm2s_base: 0x0e00_0000,
            s2mm_base: 0x0f00_0000,
            stream_size: 0xFFFF,
        }
    }
}

/// State of the DMA driver.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DmaState {
    /// Registers not mapped yet.
    Stopped,
    /// Windows mapped and both channels reset and running.
    Initialised,
    /// At least one transfer completed.
    Active,
    /// The hardware faulted. This state is terminal.
    Error,
}

impl DmaState {
    /// Returns `true` if transfers can be issued in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, DmaState::Initialised | DmaState::Active)
    }
}

/// Decoded value of a channel status register.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    /// Returns `true` if any error bit is set, or if the register reads as all
    /// ones, which is what an absent device returns.
    pub fn is_fault(self) -> bool {
        self.0 == u32::MAX || self.0 & STATUS_ANY_ERR != 0
    }

    /// Returns `true` if both the completion interrupt and idle bits are set.
    pub fn is_complete(self) -> bool {
        self.0 & STATUS_IOC_IRQ != 0 && self.0 & STATUS_IDLE != 0
    }
}

impl std::fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        const FLAGS: [(u32, &str); 11] = [
            (STATUS_IDLE, "idle"),
            (STATUS_SG_INCLDED, "SG included"),
            (STATUS_DMA_INTERNAL_ERR, "DMA internal error"),
            (STATUS_DMA_SLAVE_ERR, "DMA slave error"),
            (STATUS_DMA_DECODE_ERR, "DMA decode error"),
            (STATUS_SG_INTERNAL_ERR, "SG internal error"),
            (STATUS_SG_SLAVE_ERR, "SG slave error"),
            (STATUS_SG_DECODE_ERR, "SG decode error"),
            (STATUS_IOC_IRQ, "IOC interrupt"),
            (STATUS_DELAY_IRQ, "delay interrupt"),
            (STATUS_ERR_IRQ, "error interrupt"),
        ];
        let run = if self.0 & STATUS_HALTED != 0 {
            "halted"
        } else {
            "running"
        };
        write!(f, "{:#010x} ({run}", self.0)?;
        for (_, name) in FLAGS.iter().filter(|(bit, _)| self.0 & bit != 0) {
            write!(f, ", {name}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Copy, Clone)]
struct Channel {
    name: &'static str,
    control: usize,
    status: usize,
    address: usize,
    length: usize,
}

const MM2S: Channel = Channel {
    name: "MM2S",
    control: MM2S_CONTROL_REGISTER,
    status: MM2S_STATUS_REGISTER,
    address: MM2S_SRC_ADDRESS_REGISTER,
    length: MM2S_TRNSFR_LENGTH_REGISTER,
};

const S2MM: Channel = Channel {
    name: "S2MM",
    control: S2MM_CONTROL_REGISTER,
    status: S2MM_STATUS_REGISTER,
    address: S2MM_DST_ADDRESS_REGISTER,
    length: S2MM_BUFF_LENGTH_REGISTER,
};

/// AXI DMA channel driver.
///
/// The driver exclusively owns the three register windows and the
/// accumulation buffer into which [`DmaChannelDriver::fill_buffer`] copies the
/// received words. The consumer drains the buffer after each call.
#[derive(Debug)]
pub struct DmaChannelDriver<W = RegisterWindow> {
    ctrl: W,
    mm2s: W,
    s2mm: W,
    addresses: DeviceAddresses,
    state: DmaState,
    max_sync_polls: u64,
    buffer: Vec<u32>,
}

impl DmaChannelDriver<RegisterWindow> {
    /// Opens the AXI DMA through `/dev/mem`.
    ///
    /// Maps the control block and the two stream windows and initialises both
    /// channels. If any mapping fails, the windows mapped so far are unmapped
    /// before the error is returned.
    #[tracing::instrument(name = "DmaChannelDriver::open", level = "debug")]
    pub fn open(addresses: DeviceAddresses, max_sync_polls: u64) -> Result<Self> {
        let ctrl = RegisterWindow::acquire(addresses.ctrl_base as usize, addresses.ctrl_size as usize)?;
        let mm2s = RegisterWindow::acquire(
            addresses.mm2s_base as usize,
            addresses.stream_size as usize,
        )?;
        let s2mm = RegisterWindow::acquire(
            addresses.s2mm_base as usize,
            addresses.stream_size as usize,
        )?;
        let driver = Self::new(ctrl, mm2s, s2mm, addresses, max_sync_polls)?;
        tracing::info!(
            "opened AXI DMA at physical address {:#010x} (MM2S window {:#010x}, S2MM window {:#010x})",
            addresses.ctrl_base,
            addresses.mm2s_base,
            addresses.s2mm_base
        );
        Ok(driver)
    }
}

impl<W: RegisterAccess> DmaChannelDriver<W> {
    /// Creates a driver from already mapped windows and initialises it.
    ///
    /// Both channels are reset, halted, have all their interrupts enabled and
    /// are set running. Fails with [`Error::HardwareFault`] if the control
    /// block does not look like an AXI DMA.
    pub fn new(
        ctrl: W,
        mm2s: W,
        s2mm: W,
        addresses: DeviceAddresses,
        max_sync_polls: u64,
    ) -> Result<Self> {
        let mut driver = DmaChannelDriver {
            ctrl,
            mm2s,
            s2mm,
            addresses,
            state: DmaState::Stopped,
            max_sync_polls,
            buffer: Vec::new(),
        };
        driver.initialize()?;
        Ok(driver)
    }

    fn initialize(&mut self) -> Result<()> {
        self.restart(&MM2S);
        self.restart(&S2MM);
        for channel in [MM2S, S2MM] {
            let status = StatusFlags(self.ctrl.read(channel.status));
            if status.0 == u32::MAX {
                return Err(self.fault(format!(
                    "{} status reads {status}: hardware absent",
                    channel.name
                )));
            }
        }
        self.state = DmaState::Initialised;
        tracing::debug!(
            "AXI DMA initialised: ctrl {:#010x}/{:#x}, MM2S {:#010x}, S2MM {:#010x}, stream windows {:#x}",
            self.addresses.ctrl_base,
            self.addresses.ctrl_size,
            self.addresses.mm2s_base,
            self.addresses.s2mm_base,
            self.addresses.stream_size
        );
        Ok(())
    }

    /// Current state of the driver.
    pub fn state(&self) -> DmaState {
        self.state
    }

    /// Addresses the driver was opened with.
    pub fn addresses(&self) -> &DeviceAddresses {
        &self.addresses
    }

    /// Words accumulated by [`DmaChannelDriver::fill_buffer`] and not yet
    /// drained.
    pub fn buffer(&self) -> &[u32] {
        &self.buffer
    }

    /// Removes and returns all the accumulated words.
    pub fn drain_buffer(&mut self) -> std::vec::Drain<'_, u32> {
        self.buffer.drain(..)
    }

    /// Sends one transfer quantum through the MM2S channel.
    ///
    /// The words `data[index..index + TRANSFER_QUANTUM / 4]` are staged at the
    /// start of the MM2S window and transferred to the stream. Returns the
    /// number of bytes transferred.
    ///
    /// # Panics
    ///
    /// Panics if `data` has fewer than `index + TRANSFER_QUANTUM / 4` words.
    pub fn send(&mut self, data: &[u32], index: usize) -> Result<usize> {
        self.ensure_usable()?;
        let words = &data[index..index + TRANSFER_QUANTUM / 4];
        for (n, &word) in words.iter().enumerate() {
            self.mm2s.write(4 * n, word);
        }
        self.transfer(&MM2S, self.addresses.mm2s_base)?;
        self.log_status();
        Ok(TRANSFER_QUANTUM)
    }

    /// Sends the fixed `SPOOF_PATTERN` through the MM2S channel.
    ///
    /// Transfers are repeated until at least `bytes` bytes have been sent.
    /// Returns the number of bytes transferred.
    pub fn spoof(&mut self, bytes: usize) -> Result<usize> {
        self.ensure_usable()?;
        for (n, &word) in SPOOF_PATTERN.iter().enumerate() {
            self.mm2s.write(4 * n, word);
        }
        let mut sent = 0;
        while sent < bytes {
            self.transfer(&MM2S, self.addresses.mm2s_base)?;
            self.log_status();
            sent += TRANSFER_QUANTUM;
        }
        Ok(sent)
    }

    /// Receives from the S2MM channel until it is drained.
    ///
    /// Transfers are issued one quantum at a time, each to the next address of
    /// the destination window, for as long as the S2MM status register does
    /// not read exactly `0` or exactly `STATUS_IOC_IRQ`. The received words are
    /// appended to the accumulation buffer. Returns the number of bytes moved.
    pub fn fill_buffer(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        let window = self.addresses.stream_size as usize;
        let mut bytes = 0;
        loop {
            let status = StatusFlags(self.ctrl.read(S2MM.status));
            if status.is_fault() {
                return Err(self.fault(format!("S2MM status {status}")));
            }
            if status.0 == 0 || status.0 == STATUS_IOC_IRQ {
                break;
            }
            if bytes + TRANSFER_QUANTUM > window {
                tracing::warn!("S2MM window full after {bytes} bytes");
                break;
            }
            self.transfer(&S2MM, self.addresses.s2mm_base + bytes as u32)?;
            self.log_status();
            bytes += TRANSFER_QUANTUM;
        }
        if bytes > 0 {
            self.s2mm.read_words(0, bytes / 4, &mut self.buffer);
        }
        Ok(bytes)
    }

    fn transfer(&mut self, channel: &Channel, address: u32) -> Result<()> {
        self.restart(channel);
        self.ctrl.write(channel.address, address);
        self.ctrl.write(channel.length, TRANSFER_QUANTUM as u32);
        self.sync(channel)?;
        self.state = DmaState::Active;
        Ok(())
    }

    fn restart(&self, channel: &Channel) {
        for code in [RESET_DMA, HALT_DMA, ENABLE_ALL_IRQ, RUN_DMA] {
            self.ctrl.write(channel.control, code);
        }
    }

    /// Waits until the channel reports both completion and idle.
    fn sync(&mut self, channel: &Channel) -> Result<()> {
        match self.ctrl.poll(channel.status, self.max_sync_polls, |s| {
            let s = StatusFlags(s);
            s.is_fault() || s.is_complete()
        }) {
            Some(s) if StatusFlags(s).is_fault() => Err(self.fault(format!(
                "{} status {}",
                channel.name,
                StatusFlags(s)
            ))),
            Some(_) => Ok(()),
            None => Err(self.fault(format!(
                "{} transfer not complete after {} polls",
                channel.name, self.max_sync_polls
            ))),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.is_usable() {
            Ok(())
        } else {
            Err(Error::HardwareFault(format!(
                "DMA driver is in state {:?}",
                self.state
            )))
        }
    }

    fn fault(&mut self, reason: String) -> Error {
        tracing::error!("AXI DMA fault: {reason}");
        self.state = DmaState::Error;
        Error::HardwareFault(reason)
    }

    fn log_status(&self) {
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                s2mm = %StatusFlags(self.ctrl.read(S2MM_STATUS_REGISTER)),
                mm2s = %StatusFlags(self.ctrl.read(MM2S_STATUS_REGISTER)),
                "DMA status"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimulatedFpga;

    fn driver(sim: &SimulatedFpga) -> DmaChannelDriver<crate::sim::SimWindow> {
        let (ctrl, mm2s, s2mm) = sim.windows();
        DmaChannelDriver::new(ctrl, mm2s, s2mm, sim.addresses(), 1000).unwrap()
    }

    #[test]
    fn status_display() {
        assert_eq!(
            StatusFlags(STATUS_IOC_IRQ | STATUS_IDLE).to_string(),
            "0x00001002 (running, idle, IOC interrupt)"
        );
        assert_eq!(
            StatusFlags(STATUS_HALTED | STATUS_DMA_SLAVE_ERR).to_string(),
            "0x00000021 (halted, DMA slave error)"
        );
    }

    #[test]
    fn status_classification() {
        assert!(StatusFlags(u32::MAX).is_fault());
        assert!(StatusFlags(STATUS_ERR_IRQ).is_fault());
        assert!(!StatusFlags(STATUS_IOC_IRQ | STATUS_IDLE).is_fault());
        assert!(StatusFlags(STATUS_IOC_IRQ | STATUS_IDLE).is_complete());
        assert!(!StatusFlags(STATUS_IOC_IRQ).is_complete());
        assert!(!StatusFlags(STATUS_IDLE).is_complete());
    }

    #[test]
    fn initialize_restarts_both_channels() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        let dma = driver(&sim);
        assert_eq!(dma.state(), DmaState::Initialised);
        let restart = [RESET_DMA, HALT_DMA, ENABLE_ALL_IRQ, RUN_DMA];
        let log = sim.control_log();
        let mm2s: Vec<u32> = log
            .iter()
            .filter(|(reg, _)| *reg == MM2S_CONTROL_REGISTER)
            .map(|(_, v)| *v)
            .collect();
        let s2mm: Vec<u32> = log
            .iter()
            .filter(|(reg, _)| *reg == S2MM_CONTROL_REGISTER)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(mm2s, restart);
        assert_eq!(s2mm, restart);
    }

    #[test]
    fn absent_hardware_is_rejected() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.force_status(u32::MAX);
        let (ctrl, mm2s, s2mm) = sim.windows();
        let err = DmaChannelDriver::new(ctrl, mm2s, s2mm, sim.addresses(), 10).unwrap_err();
        assert!(matches!(err, Error::HardwareFault(_)));
    }

    #[test]
    fn fill_buffer_loops_once_per_pending_quantum() {
        for m in 0..5 {
            let sim = SimulatedFpga::new(DeviceAddresses::default());
            let words: Vec<u32> = (0..2 * (m as u32 + 1)).collect();
            sim.push_stream(&words);
            let mut dma = driver(&sim);
            let bytes = dma.fill_buffer().unwrap();
            assert_eq!(bytes, (m + 1) * TRANSFER_QUANTUM);
            assert_eq!(sim.s2mm_transfers(), m + 1);
            assert_eq!(dma.buffer(), &words[..]);
            assert_eq!(dma.state(), DmaState::Active);
        }
    }

    #[test]
    fn fill_buffer_waits_for_idle() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.set_busy_polls(7);
        sim.push_stream(&[1, 2, 3, 4]);
        let mut dma = driver(&sim);
        assert_eq!(dma.fill_buffer().unwrap(), 2 * TRANSFER_QUANTUM);
        assert_eq!(dma.buffer(), &[1, 2, 3, 4]);
    }

    #[test]
    fn fill_buffer_programs_consecutive_destinations() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.push_stream(&[10, 11, 12, 13, 14, 15]);
        let mut dma = driver(&sim);
        dma.fill_buffer().unwrap();
        let base = DeviceAddresses::default().s2mm_base;
        assert_eq!(sim.s2mm_destinations(), [base, base + 8, base + 16]);
    }

    #[test]
    fn fill_buffer_appends_until_drained() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        let mut dma = driver(&sim);
        assert_eq!(dma.fill_buffer().unwrap(), 0);
        assert!(dma.buffer().is_empty());
        sim.push_stream(&[1, 2]);
        dma.fill_buffer().unwrap();
        sim.push_stream(&[3, 4]);
        dma.fill_buffer().unwrap();
        assert_eq!(dma.drain_buffer().collect::<Vec<_>>(), [1, 2, 3, 4]);
        assert!(dma.buffer().is_empty());
    }

    #[test]
    fn send_stages_two_words() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.set_loopback(true);
        let mut dma = driver(&sim);
        let data = [0xdead_beef, 0x1234_5678, 0xffff_0000];
        assert_eq!(dma.send(&data, 0).unwrap(), TRANSFER_QUANTUM);
        assert_eq!(dma.send(&data, 1).unwrap(), TRANSFER_QUANTUM);
        dma.fill_buffer().unwrap();
        assert_eq!(
            dma.buffer(),
            &[0xdead_beef, 0x1234_5678, 0x1234_5678, 0xffff_0000]
        );
    }

    #[test]
    fn spoof_repeats_test_pattern() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.set_loopback(true);
        let mut dma = driver(&sim);
        assert_eq!(dma.spoof(20).unwrap(), 24);
        dma.fill_buffer().unwrap();
        assert_eq!(dma.buffer(), SPOOF_PATTERN.repeat(3));
        assert_eq!(dma.spoof(0).unwrap(), 0);
    }

    #[test]
    fn sync_timeout_is_terminal_fault() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.set_busy_polls(u64::MAX);
        sim.push_stream(&[1, 2]);
        let mut dma = driver(&sim);
        assert!(matches!(dma.fill_buffer(), Err(Error::HardwareFault(_))));
        assert_eq!(dma.state(), DmaState::Error);
        // ERROR is terminal
        sim.set_busy_polls(0);
        assert!(matches!(dma.fill_buffer(), Err(Error::HardwareFault(_))));
        assert!(matches!(dma.send(&[1, 2], 0), Err(Error::HardwareFault(_))));
    }

    #[test]
    fn error_bits_fault_the_driver() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        let mut dma = driver(&sim);
        sim.force_status(STATUS_HALTED | STATUS_DMA_DECODE_ERR);
        assert!(matches!(dma.fill_buffer(), Err(Error::HardwareFault(_))));
        assert_eq!(dma.state(), DmaState::Error);
    }

    #[test]
    fn fill_buffer_stops_at_window_end() {
        let addresses = DeviceAddresses {
            stream_size: 16,
            ..Default::default()
        };
        let sim = SimulatedFpga::new(addresses);
        sim.push_stream(&[1, 2, 3, 4, 5, 6]);
        let mut dma = driver(&sim);
        assert_eq!(dma.fill_buffer().unwrap(), 16);
        assert_eq!(dma.drain_buffer().collect::<Vec<_>>(), [1, 2, 3, 4]);
        assert_eq!(dma.fill_buffer().unwrap(), 8);
        assert_eq!(dma.buffer(), &[5, 6]);
    }
}
