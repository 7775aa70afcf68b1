//! The controller object and its lifecycle.

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use usb_hcd::{GenericHost, HcdError, HostControllerOps, HostEndpoint, HubRequest, UrbError, UrbRef};
use crate::{
    config::{HcdConfig, MAX_EP_NUM, PLL_CALIB_POLL_CAP},
    deferred::DeferredWork,
    dma::DmaAllocator,
    ep::{disable_endpoint_hardware, endpoint_mask, reset_endpoint_hardware, EndpointId, EndpointStats, EndpointTable, EpResetFlags, Removed},
    fifo::FifoAllocator,
    hub::RootHub,
    queue::{QueueList, QueuePool, QueueHandle},
    regs::{bits, otg_state, try_wait_until, HardwareProfile, RegisterIo, RegisterMap},
    ring::Td,
    Platform,
};

/// Everything guarded by the controller lock.
#[derive(Debug)]
pub(crate) struct ControllerState {
    pub hub: RootHub,
    /// Last OTG state seen by the interrupt handler
    pub otg_state: u8,
    /// No new work is accepted until the port comes back
    pub exiting: bool,
    /// The controller is being detached for good
    pub removed: bool,
    pub fifo: FifoAllocator,
    pub endpoints: EndpointTable,
    pub queues: QueuePool,
    /// The control transfer that owns EP0
    pub active_ep0: Option<QueueHandle>,
    /// Deferred passes that found EP0 busy with control work waiting
    pub ep0_block_count: u32,
    /// Clock reading of the last pass counted in `ep0_block_count`
    pub ep0_block_mark: u64,
    /// TDs of endpoints torn down before their TDs were given back
    pub orphaned_tds: VecDeque<Td>,
}

impl ControllerState {
    /// Whether any URB waits to be given back.
    pub fn has_givebacks(&self) -> bool {
        !self.queues.is_empty(QueueList::Dequeue)
            || !self.queues.is_empty(QueueList::Finished)
            || !self.orphaned_tds.is_empty()
            || self.endpoints.endpoint_ids().into_iter()
                .filter_map(|id| self.endpoints.get(id))
                .any(|ep| !ep.dering_td_list.is_empty())
    }

    /// Whether the deferred pass has anything to do.
    pub fn has_deferred_work(&self) -> bool {
        self.has_givebacks() || !self.queues.is_empty(QueueList::Enqueue)
    }
}

/// One Caninos USB 2.0 host controller.
pub struct CaninosHcd<R: RegisterIo> {
    id: usize,
    profile: HardwareProfile,
    pub(crate) map: &'static RegisterMap,
    pub(crate) config: HcdConfig,
    pub(crate) regs: R,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) host: Arc<dyn GenericHost>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) state: Mutex<ControllerState>,
    pub(crate) deferred: DeferredWork,
    running: AtomicBool,
}

impl<R: RegisterIo> CaninosHcd<R> {
    pub fn new(
        id: usize,
        profile: HardwareProfile,
        config: HcdConfig,
        regs: R,
        dma: Arc<dyn DmaAllocator>,
        host: Arc<dyn GenericHost>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, HcdError> {
        config.validate()?;
        let map = profile.registers();
        let fifo_bytes = config.fifo_bytes.unwrap_or(map.fifo_bytes);
        Ok(CaninosHcd {
            id,
            profile,
            map,
            config,
            regs,
            dma,
            host,
            platform,
            state: Mutex::new(ControllerState {
                hub: RootHub::new(),
                otg_state: otg_state::A_IDLE,
                exiting: false,
                removed: false,
                fifo: FifoAllocator::new(fifo_bytes),
                endpoints: EndpointTable::new(),
                queues: QueuePool::new(),
                active_ep0: None,
                ep0_block_count: 0,
                ep0_block_mark: 0,
                orphaned_tds: VecDeque::new(),
            }),
            deferred: DeferredWork::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn profile(&self) -> HardwareProfile {
        self.profile
    }

    pub fn config(&self) -> &HcdConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Brings the controller up in host mode and reports a device that is
    /// already on the port.
    pub fn attach(&self) -> Result<(), HcdError> {
        let connected = {
            let mut state = self.state.lock();

            self.regs.set_bits8(self.map.phy_ctrl, bits::PHY_PLL_EN);
            // calibration timeout is not fatal
            if try_wait_until!(self.platform, 10, PLL_CALIB_POLL_CAP, self.regs.read8(self.map.phy_ctrl) & bits::PHY_CAL_DONE != 0).is_err() {
                log::error!("[CANINOS-HCD] controller {}: PHY calibration did not finish, continuing", self.id);
            }

            self.regs.clear_bits8(self.map.otgctrl, bits::OTGCTRL_ABUSDROP);
            self.regs.set_bits8(self.map.otgctrl, bits::OTGCTRL_BUSREQ);

            for index in 0..=MAX_EP_NUM as u8 {
                for dir in [usb_hcd::Direction::In, usb_hcd::Direction::Out] {
                    reset_endpoint_hardware(&self.regs, self.map, endpoint_mask(index, dir), EpResetFlags::FIFO | EpResetFlags::TOGGLE);
                }
            }

            self.clear_pending_irqs();
            self.regs.write8(self.map.usbien, bits::USBIRQ_RESET | bits::USBIRQ_HS);
            self.regs.write8(self.map.otgien, bits::OTGIRQ_ALL);
            self.regs.write8(self.map.usbeien, bits::USBEIRQ_USBIRQ);
            self.enable_endpoint_irqs();

            state.exiting = false;
            state.removed = false;
            state.otg_state = self.regs.read8(self.map.otgstate);
            let connected = state.otg_state == otg_state::A_HOST;
            if connected {
                state.hub.connect();
            }
            connected
        };

        log::info!("[CANINOS-HCD] controller {} ({:?}) attached", self.id, self.profile);
        if connected {
            log::info!("[CANINOS-HCD] device present on the port");
            self.host.root_hub_changed();
        }
        Ok(())
    }

    /// Fails all outstanding work, gives it back and releases every
    /// endpoint. The controller accepts no work afterwards.
    pub fn detach(&self) {
        {
            let mut state = self.state.lock();
            state.removed = true;
            self.abort_all_locked(&mut state, UrbError::Shutdown);
        }
        self.run_deferred();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let host_eps: Vec<u64> = state.endpoints.all_ids().into_iter()
            .filter_map(|id| match id {
                EndpointId::Control(slot) => state.endpoints.ep0(slot).map(|s| s.host_ep),
                _ => state.endpoints.get(id).map(|ep| ep.host_ep),
            })
            .collect();
        for host_ep in host_eps {
            self.release_endpoint(state, host_ep);
        }
        self.quiesce();
        self.regs.clear_bits8(self.map.phy_ctrl, bits::PHY_PLL_EN);
        self.running.store(false, Ordering::Release);
        let leftovers = state.has_givebacks();
        drop(guard);
        if leftovers {
            self.run_deferred();
        }
        log::info!("[CANINOS-HCD] controller {} detached", self.id);
    }

    /// Silences the hardware without touching software state.
    pub fn shutdown(&self) {
        let _state = self.state.lock();
        self.quiesce();
        log::info!("[CANINOS-HCD] controller {} shut down", self.id);
    }

    fn quiesce(&self) {
        self.regs.write8(self.map.usbeien, 0);
        self.regs.write8(self.map.usbien, 0);
        self.regs.write8(self.map.otgien, 0);
        self.disable_endpoint_irqs();
        self.regs.clear_bits8(self.map.otgctrl, bits::OTGCTRL_BUSREQ);
    }

    fn clear_pending_irqs(&self) {
        self.regs.write8(self.map.usbirq, 0xff);
        self.regs.write8(self.map.usbeirq, bits::USBEIRQ_USBIRQ);
        self.regs.write8(self.map.otgirq, bits::OTGIRQ_ALL);
        for reg in [
            self.map.hcin_err_irq,
            self.map.hcout_err_irq,
            self.map.hcin_done_irq,
            self.map.hcout_done_irq,
            self.map.hcin_dma_irq,
            self.map.hcout_dma_irq,
        ] {
            self.regs.write16(reg, 0xffff);
        }
        for reg in self.map.surprise_irqs {
            self.regs.write16(reg, 0xffff);
        }
    }

    pub(crate) fn enable_endpoint_irqs(&self) {
        for reg in [self.map.hcin_err_ien, self.map.hcout_err_ien, self.map.hcin_dma_ien, self.map.hcout_dma_ien] {
            self.regs.write16(reg, 0xffff);
        }
    }

    pub(crate) fn disable_endpoint_irqs(&self) {
        for reg in [self.map.hcin_err_ien, self.map.hcout_err_ien, self.map.hcin_dma_ien, self.map.hcout_dma_ien] {
            self.regs.write16(reg, 0);
        }
    }

    /// Emergency path for a device that vanished: marks the controller
    /// exiting and moves every outstanding URB towards give-back with `error`.
    pub(crate) fn abort_all_locked(&self, state: &mut ControllerState, error: UrbError) {
        state.exiting = true;
        self.disable_endpoint_irqs();

        if let Some(handle) = state.active_ep0.take() {
            self.reset_ep0_hardware();
            if let Some(q) = state.queues.get_mut(handle) {
                q.ctrl.fail(error);
                q.status.get_or_insert(error);
            }
            state.queues.push(handle, QueueList::Dequeue);
        }
        while let Some(handle) = state.queues.pop_front(QueueList::Enqueue) {
            if let Some(q) = state.queues.get_mut(handle) {
                q.status.get_or_insert(error);
            }
            state.queues.push(handle, QueueList::Dequeue);
        }

        let mut aborted = 0;
        for ep in state.endpoints.endpoints_mut() {
            let id = ep.id();
            if let Some(ring) = ep.ring.as_mut() {
                if ring.stop(&self.regs, &*self.platform).is_err() {
                    log::error!("[CANINOS-HCD] {:?} ring did not stop", id);
                }
                while let Some(mut td) = ep.enring_td_list.pop_front() {
                    ring.retire(&td);
                    td.status.get_or_insert(error);
                    ep.dering_td_list.push_back(td);
                    aborted += 1;
                }
            }
            while let Some(mut td) = ep.queue_td_list.pop_front() {
                td.status.get_or_insert(error);
                ep.dering_td_list.push_back(td);
                aborted += 1;
            }
        }
        log::warn!("[CANINOS-HCD] controller {}: aborted {} ring transfers with {:?}", self.id, aborted, error);
    }

    /// Takes the endpoint bound to `host_ep` down and frees its resources.
    /// Its outstanding TDs are parked for the deferred pass.
    fn release_endpoint(&self, state: &mut ControllerState, host_ep: u64) -> bool {
        let id = match state.endpoints.lookup(host_ep) {
            Some(id) => id,
            None => return false,
        };

        if let EndpointId::Control(_) = id {
            if let Some(active) = state.active_ep0 {
                if state.queues.get(active).map_or(false, |q| q.ep == id) {
                    self.fail_active_control(state, UrbError::Shutdown);
                }
            }
            for handle in state.queues.all_handles() {
                let waiting = state.queues.get(handle)
                    .map_or(false, |q| q.ep == id && q.list() == QueueList::Enqueue);
                if waiting {
                    if let Some(q) = state.queues.get_mut(handle) {
                        q.status.get_or_insert(UrbError::Shutdown);
                    }
                    state.queues.push(handle, QueueList::Dequeue);
                }
            }
        } else if let Some(ep) = state.endpoints.get_mut(id) {
            disable_endpoint_hardware(&self.regs, ep);
            if let Some(ring) = ep.ring.as_mut() {
                if ring.stop(&self.regs, &*self.platform).is_err() {
                    log::error!("[CANINOS-HCD] {:?} ring did not stop", id);
                }
            }
            let lists = [&mut ep.queue_td_list, &mut ep.enring_td_list, &mut ep.dering_td_list];
            for list in lists {
                for mut td in list.drain(..) {
                    td.status.get_or_insert(UrbError::Shutdown);
                    state.orphaned_tds.push_back(td);
                }
            }
        }

        match state.endpoints.free_endpoint(host_ep, &mut state.fifo) {
            Some(Removed::Endpoint(mut ep)) => {
                if let Some(ring) = ep.ring.take() {
                    ring.release(&*self.dma);
                }
                log::debug!("[CANINOS-HCD] {:?} released", id);
            }
            Some(Removed::Control(_)) => log::debug!("[CANINOS-HCD] {:?} released", id),
            None => {}
        }
        true
    }

    /// Releases the controller resources of `ep`. Disabling an endpoint
    /// that holds none is a no-op.
    pub fn endpoint_disable(&self, ep: &HostEndpoint) {
        let (released, schedule) = {
            let mut state = self.state.lock();
            let released = self.release_endpoint(&mut state, ep.id());
            (released, state.has_givebacks())
        };
        if !released {
            log::trace!("[CANINOS-HCD] endpoint {} already disabled", ep.id());
        }
        if schedule {
            self.platform.schedule_deferred();
        }
    }

    pub fn endpoint_stats(&self, ep: &HostEndpoint) -> Option<EndpointStats> {
        let state = self.state.lock();
        state.endpoints.lookup(ep.id()).and_then(|id| state.endpoints.stats(id))
    }

    pub fn get_frame_number(&self) -> u32 {
        self.platform.now_ms() as u32
    }
}

impl<R: RegisterIo> HostControllerOps for CaninosHcd<R> {
    fn start(&self) -> Result<(), HcdError> {
        if self.state.lock().removed {
            return Err(HcdError::ControllerExiting);
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn enqueue(&self, urb: UrbRef) -> Result<(), HcdError> {
        self.submit(urb)
    }

    fn dequeue(&self, urb: &UrbRef, status: UrbError) -> Result<(), HcdError> {
        self.cancel(urb, status)
    }

    fn endpoint_disable(&self, ep: &HostEndpoint) {
        CaninosHcd::endpoint_disable(self, ep)
    }

    fn get_frame_number(&self) -> u32 {
        CaninosHcd::get_frame_number(self)
    }

    fn hub_status_data(&self) -> Option<u8> {
        CaninosHcd::hub_status_data(self)
    }

    fn hub_control(&self, req: HubRequest) -> Result<Vec<u8>, HcdError> {
        CaninosHcd::hub_control(self, req)
    }

    fn bus_suspend(&self) -> Result<(), HcdError> {
        CaninosHcd::bus_suspend(self)
    }

    fn bus_resume(&self) -> Result<(), HcdError> {
        CaninosHcd::bus_resume(self)
    }
}
