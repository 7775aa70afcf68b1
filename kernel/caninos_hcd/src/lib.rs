//! Driver for the USB 2.0 host controller of the Caninos Labrador SoCs.
//!
//! The controller drives a single root port. Control transfers of every
//! device share the EP0 hardware and run one at a time; bulk, interrupt and
//! isochronous endpoints each get a hardware endpoint, a slice of the
//! endpoint FIFO and a descriptor ring walked by a DMA engine.
//!
//! Work happens in two contexts. [`CaninosHcd::handle_irq`] runs in the
//! interrupt context and only moves finished work onto give-back lists;
//! [`CaninosHcd::run_deferred`] runs later and hands URBs back to the host
//! stack through [`GenericHost::complete`](usb_hcd::GenericHost::complete),
//! never with the controller lock held.
//!
//! The platform supplies register access ([`RegisterIo`]), coherent DMA
//! memory ([`DmaAllocator`]) and scheduling and timing ([`Platform`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod regs;
mod dma;
mod fifo;
mod ep;
mod ring;
mod queue;
mod ep0;
mod hub;
mod hcd;
mod urb;
mod irq;
mod deferred;
#[cfg(test)]
mod test;

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use spin::RwLock;
use usb_hcd::HcdError;

pub use config::*;
pub use dma::{DmaAllocator, DmaRegion};
pub use ep::EndpointStats;
pub use hcd::CaninosHcd;
pub use hub::RhState;
pub use regs::{HardwareProfile, MmioRegion, RegisterIo};

/// Services the driver needs from the platform it runs on.
pub trait Platform: Send + Sync {
    /// Masks the controller's interrupt line.
    fn disable_irq(&self);
    fn enable_irq(&self);
    /// Arranges for [`CaninosHcd::run_deferred`] to run soon, outside of
    /// interrupt context.
    fn schedule_deferred(&self);
    /// Arranges for [`CaninosHcd::run_deferred`] to run once `delay_ms`
    /// milliseconds from now. Asking again before then moves the deadline.
    fn schedule_deferred_in(&self, delay_ms: u64);
    fn udelay(&self, us: u32);
    /// A monotonic millisecond clock.
    fn now_ms(&self) -> u64;
}

/// The controllers present in the system, by instance id.
pub struct ControllerRegistry<C> {
    controllers: RwLock<BTreeMap<usize, Arc<C>>>,
}

impl<C> ControllerRegistry<C> {
    pub const fn new() -> Self {
        ControllerRegistry { controllers: RwLock::new(BTreeMap::new()) }
    }

    pub fn register(&self, id: usize, controller: Arc<C>) -> Result<(), HcdError> {
        let mut controllers = self.controllers.write();
        if controllers.contains_key(&id) {
            log::error!("[CANINOS-HCD] controller {} registered twice", id);
            return Err(HcdError::Busy);
        }
        controllers.insert(id, controller);
        Ok(())
    }

    pub fn get(&self, id: usize) -> Option<Arc<C>> {
        self.controllers.read().get(&id).cloned()
    }

    pub fn unregister(&self, id: usize) -> Option<Arc<C>> {
        self.controllers.write().remove(&id)
    }

    pub fn ids(&self) -> Vec<usize> {
        self.controllers.read().keys().copied().collect()
    }
}

impl<C> Default for ControllerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicates() {
        let registry = ControllerRegistry::new();
        registry.register(0, Arc::new("k5")).unwrap();
        registry.register(1, Arc::new("k7")).unwrap();
        assert_eq!(registry.register(0, Arc::new("again")), Err(HcdError::Busy));
        assert_eq!(registry.get(0).as_deref(), Some(&"k5"));
        assert_eq!(registry.ids(), [0, 1]);
        assert!(registry.unregister(0).is_some());
        assert!(registry.get(0).is_none());
        assert!(registry.unregister(0).is_none());
    }
}
