//! The contract between a USB host controller driver and the generic USB host stack.
//!
//! The host stack owns devices, enumeration and URB bookkeeping. It hands
//! URBs to a controller through [`HostControllerOps`], and the controller
//! reports back through [`GenericHost`]: linking URBs to their endpoint,
//! mapping buffers for DMA and delivering completions.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod error;
mod hub;
mod request;
mod urb;

pub use error::*;
pub use hub::*;
pub use request::*;
pub use urb::*;

use alloc::vec::Vec;

/// Operations a host controller driver provides to the host stack.
pub trait HostControllerOps: Send + Sync {
    /// Marks the controller running; URBs may be submitted afterwards.
    fn start(&self) -> Result<(), HcdError>;

    fn stop(&self);

    /// Queues a URB. Failure means the URB was never accepted and no
    /// completion will follow.
    fn enqueue(&self, urb: UrbRef) -> Result<(), HcdError>;

    /// Cancels a previously accepted URB. On success the URB completes
    /// later with `status`.
    fn dequeue(&self, urb: &UrbRef, status: UrbError) -> Result<(), HcdError>;

    /// Releases the controller resources held for `ep`.
    fn endpoint_disable(&self, ep: &HostEndpoint);

    fn get_frame_number(&self) -> u32;

    /// Returns the port-change bitmap if any root hub port changed.
    fn hub_status_data(&self) -> Option<u8>;

    fn hub_control(&self, req: HubRequest) -> Result<Vec<u8>, HcdError>;

    fn bus_suspend(&self) -> Result<(), HcdError>;

    fn bus_resume(&self) -> Result<(), HcdError>;
}

/// Services of the generic host stack a controller driver relies on.
pub trait GenericHost: Send + Sync {
    /// Records that `urb` is now owned by its endpoint's queue.
    fn link_to_endpoint(&self, urb: &UrbRef) -> Result<(), HcdError>;

    fn unlink_from_endpoint(&self, urb: &UrbRef);

    /// Maps the URB's buffer for DMA and stores its bus address in `transfer_dma`.
    fn map_for_dma(&self, urb: &UrbRef) -> Result<(), HcdError>;

    fn unmap_for_dma(&self, urb: &UrbRef);

    /// Delivers the final status of `urb`. Called exactly once per accepted URB,
    /// never with controller locks held.
    fn complete(&self, urb: UrbRef, status: UrbStatus);

    /// Asks the host stack to poll the root hub for port changes.
    fn root_hub_changed(&self);
}
