//! Controller limits and tunables.

use static_assertions::const_assert;
use usb_hcd::HcdError;

/// Highest endpoint index of each direction; index 0 is the control endpoint.
pub const MAX_EP_NUM: usize = 15;

/// Control endpoints of different devices kept configured at once.
pub const MAX_EP0_SLOTS: usize = 6;

/// Size of the EP0 FIFO, and so the largest EP0 packet.
pub const EP0_FIFO_BYTES: u16 = 64;

/// Preallocated transfer bookkeeping records. Submissions beyond this
/// spill over to the heap.
pub const QUEUE_POOL_CNT: usize = 60;

/// Granularity of the endpoint FIFO, in bytes.
pub const FIFO_UNIT: usize = 64;

/// FIFO units at the bottom of the FIFO that belong to EP0.
pub const FIFO_RESERVED_UNITS: usize = 2;

pub const BULK_RING_TRBS: usize = 64;
pub const INTR_RING_TRBS: usize = 8;
pub const ISOC_RING_TRBS: usize = 64;

/// Largest buffer a single TRB may describe.
pub const TRB_MAX_LEN: usize = 16 * 1024;

/// Consecutive transaction errors tolerated before a TD is failed.
pub const MAX_ERROR_COUNT: u32 = 6;

/// Polls of EP0 busy after sending SETUP, one microsecond apart.
pub const EP0_BUSY_POLL_CAP: u32 = 1000;

/// Polls of the DMA control register after a cancel, one microsecond apart.
pub const DMA_STOP_POLL_CAP: u32 = 1000;

/// Polls of the PHY calibration flag during bring-up, ten microseconds apart.
pub const PLL_CALIB_POLL_CAP: u32 = 500;

/// Deferred passes that may find EP0 busy with queued control work before
/// the active control transfer is failed.
pub const EP0_BLOCK_PERIOD: u32 = 10;

/// Least time between two deferred passes that count towards
/// [`EP0_BLOCK_PERIOD`]; also how often a busy EP0 is looked at.
pub const EP0_BLOCK_TICK_MS: u64 = 100;

/// Failed attempts to enter the deferred pass before it flags a retry
/// for whoever currently runs it.
pub const TRYLOCK_RETRY_MAX: u32 = 3;

/// Deadline of a control transfer once it reaches the bus, in milliseconds.
pub const CONTROL_TIMEOUT_MS: u64 = 5000;

const_assert!(BULK_RING_TRBS.is_power_of_two());
const_assert!(INTR_RING_TRBS.is_power_of_two());
const_assert!(ISOC_RING_TRBS.is_power_of_two());
const_assert!(MAX_EP_NUM < 16);
const_assert!(TRB_MAX_LEN % FIFO_UNIT == 0);

/// Runtime configuration of one controller instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HcdConfig {
    pub bulk_ring_trbs: usize,
    pub intr_ring_trbs: usize,
    pub isoc_ring_trbs: usize,
    pub trb_max_len: usize,
    /// Overrides the FIFO size of the hardware profile.
    pub fifo_bytes: Option<usize>,
    pub max_error_count: u32,
    pub ep0_block_period: u32,
    pub ep0_block_tick_ms: u64,
    pub control_timeout_ms: u64,
}

impl Default for HcdConfig {
    fn default() -> Self {
        HcdConfig {
            bulk_ring_trbs: BULK_RING_TRBS,
            intr_ring_trbs: INTR_RING_TRBS,
            isoc_ring_trbs: ISOC_RING_TRBS,
            trb_max_len: TRB_MAX_LEN,
            fifo_bytes: None,
            max_error_count: MAX_ERROR_COUNT,
            ep0_block_period: EP0_BLOCK_PERIOD,
            ep0_block_tick_ms: EP0_BLOCK_TICK_MS,
            control_timeout_ms: CONTROL_TIMEOUT_MS,
        }
    }
}

impl HcdConfig {
    pub fn validate(&self) -> Result<(), HcdError> {
        let rings = [self.bulk_ring_trbs, self.intr_ring_trbs, self.isoc_ring_trbs];
        if rings.iter().any(|n| !n.is_power_of_two()) {
            log::error!("[CANINOS-HCD] ring sizes must be powers of two: {:?}", rings);
            return Err(HcdError::InvalidRequest);
        }
        if self.trb_max_len == 0 || self.ep0_block_period == 0 || self.ep0_block_tick_ms == 0 {
            return Err(HcdError::InvalidRequest);
        }
        if let Some(bytes) = self.fifo_bytes {
            if bytes <= FIFO_RESERVED_UNITS * FIFO_UNIT {
                return Err(HcdError::InvalidRequest);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(HcdConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_odd_ring() {
        let config = HcdConfig { bulk_ring_trbs: 12, ..Default::default() };
        assert_eq!(config.validate(), Err(HcdError::InvalidRequest));
        let config = HcdConfig { fifo_bytes: Some(FIFO_UNIT), ..Default::default() };
        assert_eq!(config.validate(), Err(HcdError::InvalidRequest));
    }
}
