//! Memory-mapped register access.
//!
//! This module gives scoped access to windows of physical memory through
//! `/dev/mem`. The [`RegisterAccess`] trait is the seam used by the DMA driver,
//! so that the same driver code runs against the real hardware
//! ([`RegisterWindow`]) or against the [simulated backend](crate::sim).

use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Default physical memory device.
pub const MEM_DEVICE: &str = "/dev/mem";

/// 32-bit register access at byte offsets.
///
/// Offsets are byte offsets from the start of a window and must be 4-byte
/// aligned. Every access is a single 32-bit access that is neither cached nor
/// reordered with respect to other accesses to the same window.
pub trait RegisterAccess {
    /// Reads the 32-bit register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes `value` to the 32-bit register at `offset`.
    fn write(&self, offset: usize, value: u32);

    /// Size of the window in bytes.
    fn size(&self) -> usize;

    /// Polls a register until `done` returns `true`.
    ///
    /// Returns the value that satisfied `done`, or `None` if `max_polls` reads
    /// were made without success.
    fn poll(&self, offset: usize, max_polls: u64, mut done: impl FnMut(u32) -> bool) -> Option<u32>
    where
        Self: Sized,
    {
        (0..max_polls)
            .map(|_| self.read(offset))
            .find(|&value| done(value))
    }

    /// Appends `count` consecutive words starting at `offset` to `out`.
    fn read_words(&self, offset: usize, count: usize, out: &mut Vec<u32>)
    where
        Self: Sized,
    {
        out.reserve(count);
        out.extend((0..count).map(|n| self.read(offset + 4 * n)));
    }
}

/// A mapped window of physical memory.
///
/// The window is unmapped exactly once, when the struct is dropped. Since a
/// `RegisterWindow` only exists after a successful `mmap`, a failure while
/// mapping later windows never leaks the ones that were already mapped.
#[derive(Debug)]
pub struct RegisterWindow {
    _file: fs::File,
    base: *mut libc::c_void,
    effective: *mut u32,
    map_size: usize,
    phys_addr: usize,
    size: usize,
}

unsafe impl Send for RegisterWindow {}

impl RegisterWindow {
    /// Maps `size` bytes of physical memory starting at `phys_addr`.
    ///
    /// The mapping is done through `/dev/mem`, opened with `O_SYNC` so that
    /// accesses are not cached.
    pub fn acquire(phys_addr: usize, size: usize) -> Result<RegisterWindow> {
        Self::acquire_from(Path::new(MEM_DEVICE), phys_addr, size)
    }

    /// Maps a window using `device` as the physical memory device.
    pub fn acquire_from(device: &Path, phys_addr: usize, size: usize) -> Result<RegisterWindow> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(device)
            .map_err(|source| Error::DeviceOpen {
                path: device.to_owned(),
                source,
            })?;
        let page_offset = phys_addr & (page_size::get() - 1);
        let map_size = size + page_offset;
        let base = unsafe {
            match libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                (phys_addr - page_offset) as libc::off_t,
            ) {
                libc::MAP_FAILED => {
                    return Err(Error::Map {
                        base: phys_addr,
                        size,
                        source: std::io::Error::last_os_error(),
                    })
                }
                x => x,
            }
        };
        let effective = unsafe { (base as *mut u8).add(page_offset) } as *mut u32;
        tracing::debug!("mapped {size:#x} bytes at physical address {phys_addr:#010x}");
        Ok(RegisterWindow {
            _file: file,
            base,
            effective,
            map_size,
            phys_addr,
            size,
        })
    }

    /// Physical address of the start of the window.
    pub fn phys_addr(&self) -> usize {
        self.phys_addr
    }

    fn word(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "register offset {offset:#x} outside window of {:#x} bytes",
            self.size
        );
        unsafe { self.effective.add(offset >> 2) }
    }
}

impl RegisterAccess for RegisterWindow {
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or outside the window.
    fn read(&self, offset: usize) -> u32 {
        unsafe { std::ptr::read_volatile(self.word(offset)) }
    }

    /// # Panics
    ///
    /// Panics if `offset` is unaligned or outside the window.
    fn write(&self, offset: usize, value: u32) {
        unsafe { std::ptr::write_volatile(self.word(offset), value) }
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Unmaps the window.
impl Drop for RegisterWindow {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base, self.map_size) } != 0 {
            tracing::warn!(
                "munmap of window at {:#010x} failed: {}",
                self.phys_addr,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    // A regular file stands in for /dev/mem: mapping it MAP_SHARED gives the
    // same read/write behaviour as a block of physical memory.
    fn backing_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn read_write_through_file_mapping() {
        let file = backing_file(page_size::get());
        let window = RegisterWindow::acquire_from(file.path(), 0, 0x100).unwrap();
        window.write(0x34, 0x1002);
        window.write(0x00, 0xdead_beef);
        assert_eq!(window.read(0x34), 0x1002);
        assert_eq!(window.read(0x00), 0xdead_beef);
        assert_eq!(window.size(), 0x100);
        let mut words = Vec::new();
        window.read_words(0x30, 2, &mut words);
        assert_eq!(words, [0, 0x1002]);
    }

    #[test]
    fn poll_stops_on_match() {
        let file = backing_file(page_size::get());
        let window = RegisterWindow::acquire_from(file.path(), 0, 0x10).unwrap();
        window.write(4, 7);
        assert_eq!(window.poll(4, 3, |v| v == 7), Some(7));
        assert_eq!(window.poll(4, 3, |v| v == 8), None);
    }

    #[test]
    fn missing_device_is_device_open_error() {
        let err = RegisterWindow::acquire_from(Path::new("/nonexistent/mem"), 0, 0x10).unwrap_err();
        assert!(matches!(err, Error::DeviceOpen { .. }));
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    #[should_panic]
    fn out_of_window_access_panics() {
        let file = backing_file(page_size::get());
        let window = RegisterWindow::acquire_from(file.path(), 0, 0x10).unwrap();
        window.read(0x10);
    }
}
