//! Simulated AXI DMA.
//!
//! [`SimulatedFpga`] models the register behaviour of an AXI DMA in direct
//! register mode, so that the [`DmaChannelDriver`](crate::dma::DmaChannelDriver)
//! can run on a development host and in tests. The MM2S channel can be looped
//! back into the S2MM stream, which reproduces the data collection setup where
//! the FPGA echoes the stimulus it is fed.
//!
//! The S2MM status register reads `STATUS_IDLE` while stream data is pending
//! and `STATUS_IOC_IRQ` once the stream is drained. A transfer in flight reads
//! as busy (`0`) for a configurable number of polls, and then as
//! `STATUS_IOC_IRQ | STATUS_IDLE`.

use crate::dma::{regs::*, DeviceAddresses, TRANSFER_QUANTUM};
use crate::register::RegisterAccess;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Simulated FPGA with an AXI DMA.
#[derive(Debug, Clone)]
pub struct SimulatedFpga {
    state: Rc<RefCell<State>>,
}

/// One of the three register windows of a [`SimulatedFpga`].
#[derive(Debug, Clone)]
pub struct SimWindow {
    state: Rc<RefCell<State>>,
    region: Region,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Region {
    Control,
    Mm2s,
    S2mm,
}

#[derive(Debug)]
struct State {
    addresses: DeviceAddresses,
    control: Vec<u32>,
    mm2s: Vec<u32>,
    s2mm: Vec<u32>,
    stream: VecDeque<u32>,
    loopback: bool,
    busy_polls: u64,
    mm2s_busy: Option<u64>,
    s2mm_busy: Option<u64>,
    forced_status: Option<u32>,
    control_log: Vec<(usize, u32)>,
    s2mm_destinations: Vec<u32>,
}

const QUANTUM_WORDS: usize = TRANSFER_QUANTUM / 4;

impl SimulatedFpga {
    /// Creates a simulated FPGA whose windows have the sizes in `addresses`.
    pub fn new(addresses: DeviceAddresses) -> SimulatedFpga {
        let state = State {
            addresses,
            control: vec![0; addresses.ctrl_size as usize / 4],
            mm2s: vec![0; addresses.stream_size as usize / 4],
            s2mm: vec![0; addresses.stream_size as usize / 4],
            stream: VecDeque::new(),
            loopback: false,
            busy_polls: 0,
            mm2s_busy: None,
            s2mm_busy: None,
            forced_status: None,
            control_log: Vec::new(),
            s2mm_destinations: Vec::new(),
        };
        SimulatedFpga {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Returns the control, MM2S and S2MM windows.
    pub fn windows(&self) -> (SimWindow, SimWindow, SimWindow) {
        let window = |region| SimWindow {
            state: Rc::clone(&self.state),
            region,
        };
        (
            window(Region::Control),
            window(Region::Mm2s),
            window(Region::S2mm),
        )
    }

    /// Returns the addresses the simulated FPGA was created with.
    pub fn addresses(&self) -> DeviceAddresses {
        self.state.borrow().addresses
    }

    /// Routes every MM2S transfer into the S2MM stream.
    pub fn set_loopback(&self, loopback: bool) {
        self.state.borrow_mut().loopback = loopback;
    }

    /// Sets the number of status polls that read busy before a transfer
    /// completes.
    pub fn set_busy_polls(&self, polls: u64) {
        self.state.borrow_mut().busy_polls = polls;
    }

    /// Appends words to the incoming S2MM stream.
    pub fn push_stream(&self, words: &[u32]) {
        self.state.borrow_mut().stream.extend(words);
    }

    /// Number of words pending in the S2MM stream.
    pub fn stream_len(&self) -> usize {
        self.state.borrow().stream.len()
    }

    /// Makes every status register read `status`.
    pub fn force_status(&self, status: u32) {
        self.state.borrow_mut().forced_status = Some(status);
    }

    /// Returns all the writes made to the control registers of both channels.
    pub fn control_log(&self) -> Vec<(usize, u32)> {
        self.state.borrow().control_log.clone()
    }

    /// Returns the destination addresses of all the S2MM transfers.
    pub fn s2mm_destinations(&self) -> Vec<u32> {
        self.state.borrow().s2mm_destinations.clone()
    }

    /// Number of S2MM transfers issued.
    pub fn s2mm_transfers(&self) -> usize {
        self.state.borrow().s2mm_destinations.len()
    }
}

impl State {
    fn write_control(&mut self, offset: usize, value: u32) {
        self.control[offset / 4] = value;
        match offset {
            MM2S_CONTROL_REGISTER | S2MM_CONTROL_REGISTER => {
                self.control_log.push((offset, value));
                if value & RESET_DMA != 0 {
                    if offset == MM2S_CONTROL_REGISTER {
                        self.mm2s_busy = None;
                    } else {
                        self.s2mm_busy = None;
                    }
                }
            }
            MM2S_TRNSFR_LENGTH_REGISTER => self.start_mm2s(value as usize / 4),
            S2MM_BUFF_LENGTH_REGISTER => self.start_s2mm(value as usize / 4),
            _ => (),
        }
    }

    fn start_mm2s(&mut self, words: usize) {
        let src = self.control[MM2S_SRC_ADDRESS_REGISTER / 4];
        let offset = (src - self.addresses.mm2s_base) as usize / 4;
        if self.loopback {
            self.stream.extend(&self.mm2s[offset..offset + words]);
        }
        self.mm2s_busy = Some(self.busy_polls);
    }

    fn start_s2mm(&mut self, words: usize) {
        let dst = self.control[S2MM_DST_ADDRESS_REGISTER / 4];
        self.s2mm_destinations.push(dst);
        let offset = (dst - self.addresses.s2mm_base) as usize / 4;
        for n in 0..words {
            self.s2mm[offset + n] = self.stream.pop_front().unwrap_or(0);
        }
        self.s2mm_busy = Some(self.busy_polls);
    }

    fn read_status(&mut self, offset: usize) -> u32 {
        if let Some(status) = self.forced_status {
            return status;
        }
        let busy = if offset == MM2S_STATUS_REGISTER {
            &mut self.mm2s_busy
        } else {
            &mut self.s2mm_busy
        };
        match *busy {
            Some(0) => {
                *busy = None;
                STATUS_IOC_IRQ | STATUS_IDLE
            }
            Some(n) => {
                *busy = Some(n - 1);
                0
            }
            None if offset == MM2S_STATUS_REGISTER => STATUS_IOC_IRQ | STATUS_IDLE,
            None if self.stream.len() >= QUANTUM_WORDS => STATUS_IDLE,
            None => STATUS_IOC_IRQ,
        }
    }
}

impl RegisterAccess for SimWindow {
    fn read(&self, offset: usize) -> u32 {
        let mut state = self.state.borrow_mut();
        match self.region {
            Region::Control => match offset {
                MM2S_STATUS_REGISTER | S2MM_STATUS_REGISTER => state.read_status(offset),
                _ => state.control[offset / 4],
            },
            Region::Mm2s => state.mm2s[offset / 4],
            Region::S2mm => state.s2mm[offset / 4],
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.borrow_mut();
        match self.region {
            Region::Control => state.write_control(offset, value),
            Region::Mm2s => state.mm2s[offset / 4] = value,
            Region::S2mm => state.s2mm[offset / 4] = value,
        }
    }

    fn size(&self) -> usize {
        let state = self.state.borrow();
        match self.region {
            Region::Control => state.addresses.ctrl_size as usize,
            Region::Mm2s | Region::S2mm => state.addresses.stream_size as usize,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn s2mm_status_follows_stream() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        let (ctrl, _, s2mm) = sim.windows();
        assert_eq!(ctrl.read(S2MM_STATUS_REGISTER), STATUS_IOC_IRQ);
        sim.push_stream(&[5, 6]);
        assert_eq!(ctrl.read(S2MM_STATUS_REGISTER), STATUS_IDLE);
        let base = sim.addresses().s2mm_base;
        ctrl.write(S2MM_DST_ADDRESS_REGISTER, base + 8);
        ctrl.write(S2MM_BUFF_LENGTH_REGISTER, 8);
        assert_eq!(
            ctrl.read(S2MM_STATUS_REGISTER),
            STATUS_IOC_IRQ | STATUS_IDLE
        );
        assert_eq!(ctrl.read(S2MM_STATUS_REGISTER), STATUS_IOC_IRQ);
        assert_eq!(s2mm.read(8), 5);
        assert_eq!(s2mm.read(12), 6);
    }

    #[test]
    fn busy_polls_delay_completion() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.set_busy_polls(2);
        let (ctrl, _, _) = sim.windows();
        ctrl.write(MM2S_SRC_ADDRESS_REGISTER, sim.addresses().mm2s_base);
        ctrl.write(MM2S_TRNSFR_LENGTH_REGISTER, 8);
        assert_eq!(ctrl.read(MM2S_STATUS_REGISTER), 0);
        assert_eq!(ctrl.read(MM2S_STATUS_REGISTER), 0);
        assert_eq!(
            ctrl.read(MM2S_STATUS_REGISTER),
            STATUS_IOC_IRQ | STATUS_IDLE
        );
    }

    #[test]
    fn loopback_echoes_mm2s() {
        let sim = SimulatedFpga::new(DeviceAddresses::default());
        sim.set_loopback(true);
        let (ctrl, mm2s, _) = sim.windows();
        mm2s.write(0, 0xdead_beef);
        mm2s.write(4, 0x1234_5678);
        ctrl.write(MM2S_SRC_ADDRESS_REGISTER, sim.addresses().mm2s_base);
        ctrl.write(MM2S_TRNSFR_LENGTH_REGISTER, 8);
        assert_eq!(sim.stream_len(), 2);
    }
}
