//! Interfaces to the kernel's external collaborators: the disk, the
//! terminal, the keyboard and the timer.
//!
//! Drivers implement these; everything above them (loader, shell plumbing,
//! scheduler accounting) programs against the traits and is tested with
//! in-memory doubles.

use thiserror::Error;

/// Fixed sector size all block transfers use.
pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DeviceError {
    #[error("i/o error at sector {lba}")]
    Io { lba: u64 },

    #[error("request beyond the end of the device")]
    OutOfRange,

    #[error("device timed out")]
    Timeout,
}

/// Sector-addressed storage.
pub trait BlockDevice {
    fn sector_count(&self) -> u64;

    /// Read whole sectors starting at `lba`; `buf` must be a multiple of
    /// [`SECTOR_SIZE`].
    ///
    /// # Errors
    /// [`DeviceError`] if the transfer fails or runs off the device.
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write whole sectors starting at `lba`; `buf` must be a multiple of
    /// [`SECTOR_SIZE`].
    ///
    /// # Errors
    /// [`DeviceError`] if the transfer fails or runs off the device.
    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), DeviceError>;
}

/// Character output towards the user.
pub trait TtySink {
    fn write_str(&mut self, s: &str);
}

/// One keyboard state change, already translated from scan codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyEvent {
    pub scancode: u8,
    pub pressed: bool,
    /// Printable translation under the current modifiers, if any.
    pub ascii: Option<char>,
}

/// Non-blocking source of keyboard events.
pub trait KeyEventSource {
    fn poll_event(&mut self) -> Option<KeyEvent>;
}

/// Monotonic tick counter driven by the timer interrupt.
pub trait TickSource {
    fn ticks(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RamDisk {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl BlockDevice for RamDisk {
        fn sector_count(&self) -> u64 {
            self.sectors.len() as u64
        }

        fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            assert_eq!(buf.len() % SECTOR_SIZE, 0);
            let count = buf.len() / SECTOR_SIZE;
            if lba + count as u64 > self.sector_count() {
                return Err(DeviceError::OutOfRange);
            }
            for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
                chunk.copy_from_slice(&self.sectors[lba as usize + i]);
            }
            Ok(())
        }

        fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), DeviceError> {
            assert_eq!(buf.len() % SECTOR_SIZE, 0);
            let count = buf.len() / SECTOR_SIZE;
            if lba + count as u64 > self.sector_count() {
                return Err(DeviceError::OutOfRange);
            }
            for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
                self.sectors[lba as usize + i].copy_from_slice(chunk);
            }
            Ok(())
        }
    }

    #[test]
    fn block_contract_round_trips_and_bounds_check() {
        let mut disk = RamDisk {
            sectors: vec![[0u8; SECTOR_SIZE]; 4],
        };
        let mut sector = [0xabu8; SECTOR_SIZE];
        disk.write_sectors(2, &sector).unwrap();

        sector.fill(0);
        disk.read_sectors(2, &mut sector).unwrap();
        assert!(sector.iter().all(|b| *b == 0xab));

        let mut two = [0u8; 2 * SECTOR_SIZE];
        assert_eq!(disk.read_sectors(3, &mut two), Err(DeviceError::OutOfRange));
    }
}
