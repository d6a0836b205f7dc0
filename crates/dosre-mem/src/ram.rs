use std::sync::Arc;

use dosre_debug::MemoryBreakpoints;
use thiserror::Error;

use crate::Memory;

/// 1 MiB plus the 64 KiB reachable above it through `FFFF:xxxx`.
pub const REAL_MODE_MEMORY_SIZE: usize = 0x11_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("image of {len} bytes does not fit at {address:#x} (memory size {size:#x})")]
    ImageTooLarge {
        address: u32,
        len: usize,
        size: usize,
    },
}

/// Flat guest RAM.
///
/// Accesses outside the array panic like plain slice indexing. When memory
/// breakpoints are attached, every byte access is reported to them.
#[derive(Debug, Clone)]
pub struct Ram {
    data: Vec<u8>,
    breakpoints: Option<Arc<MemoryBreakpoints>>,
}

impl Default for Ram {
    fn default() -> Self {
        Self::new(REAL_MODE_MEMORY_SIZE)
    }
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            breakpoints: None,
        }
    }

    pub fn with_breakpoints(size: usize, breakpoints: Arc<MemoryBreakpoints>) -> Self {
        Self {
            data: vec![0; size],
            breakpoints: Some(breakpoints),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copies `bytes` to `address` without consulting breakpoints.
    pub fn load(&mut self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let start = address as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= self.data.len())
            .ok_or(MemoryError::ImageTooLarge {
                address,
                len: bytes.len(),
                size: self.data.len(),
            })?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn slice(&self, address: u32, len: usize) -> &[u8] {
        let start = address as usize;
        &self.data[start..start + len]
    }
}

impl Memory for Ram {
    #[inline]
    fn read_u8(&self, address: u32) -> u8 {
        if let Some(bps) = &self.breakpoints {
            if !bps.is_empty() {
                bps.monitor_read(address);
            }
        }
        self.data[address as usize]
    }

    #[inline]
    fn write_u8(&mut self, address: u32, value: u8) {
        if let Some(bps) = &self.breakpoints {
            if !bps.is_empty() {
                bps.monitor_write(address);
            }
        }
        self.data[address as usize] = value;
    }

    #[inline]
    fn peek_u8(&self, address: u32) -> u8 {
        self.data[address as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use dosre_debug::{BreakPoint, BreakPointType};

    #[test]
    fn words_are_little_endian() {
        let mut ram = Ram::new(0x100);
        ram.write_u16(0x10, 0xBEEF);
        assert_eq!(ram.slice(0x10, 2), &[0xEF, 0xBE]);
        ram.write_u32(0x20, 0x1234_5678);
        assert_eq!(ram.read_u16(0x22), 0x1234);
        assert_eq!(ram.read_u32(0x20), 0x1234_5678);
    }

    #[test]
    fn load_rejects_images_that_overflow() {
        let mut ram = Ram::new(0x10);
        assert!(ram.load(0x08, &[1; 8]).is_ok());
        assert_eq!(
            ram.load(0x09, &[1; 8]),
            Err(MemoryError::ImageTooLarge {
                address: 0x09,
                len: 8,
                size: 0x10
            })
        );
    }

    #[test]
    fn write_breakpoint_fires_on_each_covered_byte() {
        let bps = Arc::new(MemoryBreakpoints::new());
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        bps.toggle(
            BreakPoint::memory(BreakPointType::MemoryWrite, 0x41, false, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        let mut ram = Ram::with_breakpoints(0x100, bps);

        ram.write_u16(0x40, 0xAAAA);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let _ = ram.read_u16(0x40);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        ram.write_u8(0x42, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn peeks_bypass_read_breakpoints() {
        let bps = Arc::new(MemoryBreakpoints::new());
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        bps.toggle(
            BreakPoint::memory(BreakPointType::MemoryRead, 0x40, false, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        let mut ram = Ram::with_breakpoints(0x100, bps);
        ram.load(0x40, &[0x34, 0x12]).unwrap();

        assert_eq!(ram.peek_u16(0x40), 0x1234);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(ram.read_u16(0x40), 0x1234);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
