//! First-fit allocator for the controller's on-chip endpoint FIFO.
//!
//! The FIFO is divided into [`FIFO_UNIT`]-byte units. The first
//! [`FIFO_RESERVED_UNITS`] belong to EP0 and are never handed out, so a
//! returned address is never zero.

use alloc::vec::Vec;
use crate::config::{FIFO_RESERVED_UNITS, FIFO_UNIT};

#[derive(Debug)]
pub struct FifoAllocator {
    /// For each unit, the first unit of the allocation that holds it
    owners: Vec<Option<u16>>,
}

impl FifoAllocator {
    pub fn new(fifo_bytes: usize) -> Self {
        FifoAllocator {
            owners: alloc::vec![None; fifo_bytes / FIFO_UNIT],
        }
    }

    pub fn units(&self) -> usize {
        self.owners.len()
    }

    /// Units needed to hold `bytes`, never less than one.
    pub fn units_for(bytes: usize) -> usize {
        ((bytes + FIFO_UNIT - 1) / FIFO_UNIT).max(1)
    }

    /// Reserves a contiguous run of units for `bytes` and returns its byte address.
    pub fn allocate(&mut self, bytes: usize) -> Option<u32> {
        let units = Self::units_for(bytes);
        let mut start = FIFO_RESERVED_UNITS;

        while start + units <= self.owners.len() {
            // restart right after the first busy unit in the window
            match (start..start + units).find(|&u| self.owners[u].is_some()) {
                Some(busy) => start = busy + 1,
                None => {
                    for owner in &mut self.owners[start..start + units] {
                        *owner = Some(start as u16);
                    }
                    return Some((start * FIFO_UNIT) as u32);
                }
            }
        }

        None
    }

    /// Releases the allocation starting at `addr`. Unknown addresses are ignored.
    pub fn free(&mut self, addr: u32) -> usize {
        let start = addr as usize / FIFO_UNIT;
        if start < FIFO_RESERVED_UNITS {
            return 0;
        }
        let mut freed = 0;
        for owner in self.owners.iter_mut().skip(start) {
            if *owner != Some(start as u16) {
                break;
            }
            *owner = None;
            freed += 1;
        }
        freed
    }

    pub fn free_units(&self) -> usize {
        self.owners[FIFO_RESERVED_UNITS.min(self.owners.len())..].iter().filter(|o| o.is_none()).count()
    }
}
