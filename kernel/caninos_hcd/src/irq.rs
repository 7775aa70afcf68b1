//! The interrupt handler of the controller.
//!
//! Runs with the controller lock held for its whole duration and never
//! calls into the host stack's completion path; finished URBs are parked
//! for the deferred pass instead.

use usb_hcd::{Direction, ProtocolError, Speed, UrbError, UrbFlags};
use crate::{
    config::MAX_EP_NUM,
    ep::{reset_endpoint_hardware, Endpoint, EndpointId, EpResetFlags},
    hcd::{CaninosHcd, ControllerState},
    regs::{bits, otg_state, HcErr, HcErrKind, RegisterIo},
    ring::{TdProgress, Td},
};

/// Maps the error code of an HCxERR register to the status of the URB.
pub(crate) fn protocol_error(kind: HcErrKind) -> UrbError {
    let error = match kind {
        HcErrKind::Crc | HcErrKind::Toggle | HcErrKind::Pid => ProtocolError::CrcOrToggleOrPid,
        HcErrKind::Stall => ProtocolError::Stall,
        HcErrKind::Overrun => ProtocolError::Overrun,
        HcErrKind::Underrun => ProtocolError::Underrun,
        HcErrKind::None | HcErrKind::Timeout => ProtocolError::Timeout,
    };
    UrbError::Protocol(error)
}

fn endpoint_id(index: u8, dir: Direction) -> EndpointId {
    match dir {
        Direction::In => EndpointId::In(index),
        Direction::Out => EndpointId::Out(index),
    }
}

/// Stores what the engine moved for `td` in its URB.
fn record_lengths(td: &mut Td, lengths: &[usize], short: bool) {
    let urb = td.urb.clone();
    let mut state = urb.lock();
    if !state.iso_packets.is_empty() {
        for (packet, &n) in state.iso_packets.iter_mut().zip(lengths) {
            packet.actual_length = n;
            packet.status = Ok(());
        }
    }
    state.actual_length = lengths.iter().sum::<usize>().min(urb.transfer_length);
    if short && urb.is_in() && urb.flags.contains(UrbFlags::SHORT_NOT_OK) {
        td.status.get_or_insert(UrbError::ShortTransfer);
    }
}

impl<R: RegisterIo> CaninosHcd<R> {
    /// Services every pending interrupt source. Returns whether the
    /// controller raised anything at all.
    pub fn handle_irq(&self) -> bool {
        let mut handled = false;
        let mut hub_changed = false;
        let schedule = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for dir in [Direction::In, Direction::Out] {
                let (dma_irq, done_irq) = match dir {
                    Direction::In => (self.map.hcin_dma_irq, self.map.hcin_done_irq),
                    Direction::Out => (self.map.hcout_dma_irq, self.map.hcout_done_irq),
                };
                let pending = self.regs.read16(dma_irq) | self.regs.read16(done_irq);
                if pending == 0 {
                    continue;
                }
                handled = true;
                self.regs.write16(dma_irq, pending);
                self.regs.write16(done_irq, pending);
                for index in 1..=MAX_EP_NUM as u8 {
                    if pending & (1 << index) == 0 {
                        continue;
                    }
                    match state.endpoints.get_mut(endpoint_id(index, dir)) {
                        Some(ep) => self.process_ring(ep),
                        None => log::trace!("[CANINOS-HCD] DMA interrupt for unused endpoint {} {:?}", index, dir),
                    }
                }
            }

            for reg in self.map.surprise_irqs {
                let pending = self.regs.read16(reg);
                if pending != 0 {
                    self.regs.write16(reg, pending);
                    handled = true;
                }
            }

            if self.regs.read8(self.map.usbeirq) & bits::USBEIRQ_USBIRQ != 0 {
                self.regs.write8(self.map.usbeirq, bits::USBEIRQ_USBIRQ);
                let vector = self.regs.read8(self.map.ivect);
                hub_changed = self.dispatch_vector(state, vector);
                handled = true;
            }
            state.has_deferred_work()
        };

        if hub_changed {
            self.host.root_hub_changed();
        }
        if schedule {
            self.platform.schedule_deferred();
        }
        handled
    }

    /// Handles one IVECT vector. Returns whether the root hub port changed.
    fn dispatch_vector(&self, state: &mut ControllerState, vector: u8) -> bool {
        let v = &self.map.vectors;
        match vector {
            _ if vector == v.otg => self.otg_irq(state),
            _ if vector == v.sof => {
                self.regs.write8(self.map.usbirq, bits::USBIRQ_SOF);
                false
            }
            _ if vector == v.usb_reset => self.bus_reset_irq(state),
            _ if vector == v.ep0_in => {
                self.ep0_in_irq(state);
                false
            }
            _ if vector == v.ep0_out => {
                self.ep0_out_irq(state);
                false
            }
            _ if (v.hcin_err..v.hcin_err + 16).contains(&vector) => {
                self.endpoint_error(state, vector - v.hcin_err, Direction::In);
                false
            }
            _ if (v.hcout_err..v.hcout_err + 16).contains(&vector) => {
                self.endpoint_error(state, vector - v.hcout_err, Direction::Out);
                false
            }
            _ => {
                log::error!("[CANINOS-HCD] controller {}: unknown interrupt vector {:#04x}", self.id(), vector);
                false
            }
        }
    }

    fn otg_irq(&self, state: &mut ControllerState) -> bool {
        self.regs.write8(self.map.otgirq, bits::OTGIRQ_ALL);
        let old = state.otg_state;
        let new = self.regs.read8(self.map.otgstate);
        state.otg_state = new;
        if old == new {
            return false;
        }
        log::info!("[CANINOS-HCD] controller {}: OTG state {:#04x} -> {:#04x}", self.id(), old, new);

        if new == otg_state::A_HOST {
            if !state.removed {
                state.exiting = false;
                self.enable_endpoint_irqs();
            }
            state.hub.connect();
            true
        } else if old == otg_state::A_HOST {
            if new == otg_state::A_WAIT_BCON {
                self.abort_all_locked(state, UrbError::Shutdown);
            }
            state.hub.disconnect();
            true
        } else {
            false
        }
    }

    /// The port reset finished. Everything in flight is lost.
    fn bus_reset_irq(&self, state: &mut ControllerState) -> bool {
        self.regs.write8(self.map.usbirq, bits::USBIRQ_RESET);

        for ep in state.endpoints.endpoints_mut() {
            let id = ep.id();
            if let Some(ring) = ep.ring.as_mut() {
                if ring.stop(&self.regs, &*self.platform).is_err() {
                    log::error!("[CANINOS-HCD] {:?} ring did not stop for bus reset", id);
                }
                while let Some(mut td) = ep.enring_td_list.pop_front() {
                    ring.retire(&td);
                    td.status.get_or_insert(UrbError::ConnectionReset);
                    ep.dering_td_list.push_back(td);
                }
            }
            while let Some(mut td) = ep.queue_td_list.pop_front() {
                td.status.get_or_insert(UrbError::ConnectionReset);
                ep.dering_td_list.push_back(td);
            }
            reset_endpoint_hardware(&self.regs, self.map, ep.mask(), EpResetFlags::FIFO | EpResetFlags::TOGGLE);
            ep.error_count = 0;
        }
        self.reset_ep0_hardware();
        self.fail_active_control(state, UrbError::ConnectionReset);

        let usbcs = self.regs.read8(self.map.usbcs);
        let speed = if usbcs & bits::USBCS_HSMODE != 0 {
            Speed::High
        } else if usbcs & bits::USBCS_LSMODE != 0 {
            Speed::Low
        } else {
            Speed::Full
        };
        state.hub.bus_reset_done(speed);
        log::info!("[CANINOS-HCD] controller {}: bus reset done, {:?} speed", self.id(), speed);
        true
    }

    /// A transaction on endpoint `index` failed.
    fn endpoint_error(&self, state: &mut ControllerState, index: u8, dir: Direction) {
        let (irq_reg, err_reg) = match dir {
            Direction::In => (self.map.hcin_err_irq, self.map.endpoint_regs(index, dir).err),
            Direction::Out => (self.map.hcout_err_irq, self.map.endpoint_regs(index, dir).err),
        };
        self.regs.write16(irq_reg, 1 << index);
        let err = HcErr::from(self.regs.read8(err_reg));
        let error = protocol_error(err.kind());

        if index == 0 {
            log::debug!("[CANINOS-HCD] ep0 {:?} error {:?}", dir, err);
            self.fail_active_control(state, error);
            return;
        }

        let connected = state.hub.is_connected();
        let max_errors = self.config.max_error_count;
        let id = endpoint_id(index, dir);
        let ep = match state.endpoints.get_mut(id) {
            Some(ep) => ep,
            None => {
                log::warn!("[CANINOS-HCD] error interrupt for unused endpoint {:?}", id);
                return;
            }
        };

        let window = ep.uses_intr_window();
        let count = if window {
            ep.error_count += 1;
            ep.error_count
        } else {
            match ep.enring_td_list.front_mut() {
                Some(td) => {
                    td.err_count += 1;
                    td.err_count
                }
                None => {
                    log::warn!("[CANINOS-HCD] {:?} error {:?} with nothing in the ring", id, err.kind());
                    return;
                }
            }
        };

        let fatal = match error {
            UrbError::Protocol(ProtocolError::Stall) => Some(error),
            _ if !connected => Some(UrbError::NoDevice),
            _ => None,
        };
        if fatal.is_none() && count <= max_errors {
            log::warn!("[CANINOS-HCD] {:?} {:?} error {}/{}, resending", id, err.kind(), count, max_errors);
            let mut resend = HcErr::from(0u8);
            resend.set_resend(true);
            self.regs.write8(err_reg, u8::from(resend));
            return;
        }

        let status = fatal.unwrap_or(error);
        log::error!("[CANINOS-HCD] {:?} failed after {} errors: {}", id, count, status);
        if let Some(ring) = ep.ring.as_mut() {
            if ring.stop(&self.regs, &*self.platform).is_err() {
                log::error!("[CANINOS-HCD] {:?} ring did not stop after an error", id);
            }
        }
        reset_endpoint_hardware(&self.regs, self.map, ep.mask(), EpResetFlags::FIFO | EpResetFlags::TOGGLE);
        if status == UrbError::Protocol(ProtocolError::Stall) {
            ep.stats.stalled += 1;
        }

        if window {
            ep.error_count = 0;
            if let Some(mut td) = ep.queue_td_list.pop_front() {
                td.status = Some(status);
                ep.dering_td_list.push_back(td);
            }
            self.service_intr_window(ep);
        } else {
            let failed = ep.ring.as_mut().and_then(|ring| ring.remove_td(&mut ep.enring_td_list, 0));
            if let Some(mut td) = failed {
                td.status = Some(status);
                ep.dering_td_list.push_back(td);
            }
            self.fill_ring(ep);
        }
    }

    /// Collects the TDs the engine has finished on `ep`.
    pub(crate) fn process_ring(&self, ep: &mut Endpoint) {
        if ep.uses_intr_window() {
            let collected = ep.ring.as_mut().map_or(0, |ring| ring.collect_intr());
            if collected > 0 {
                ep.error_count = 0;
            }
            self.service_intr_window(ep);
            return;
        }

        let id = ep.id();
        loop {
            let ring = match ep.ring.as_mut() {
                Some(ring) => ring,
                None => return,
            };
            let progress = match ep.enring_td_list.front() {
                Some(td) => ring.td_progress(td),
                None => break,
            };
            let (lengths, short) = match progress {
                TdProgress::Pending => break,
                TdProgress::Done { lengths, short } => (lengths, short),
            };
            let mut td = match ep.enring_td_list.pop_front() {
                Some(td) => td,
                None => break,
            };
            if short && lengths.len() < td.num_trbs {
                // the rest of the TD is still owned by the engine
                if ring.stop(&self.regs, &*self.platform).is_err() {
                    log::error!("[CANINOS-HCD] {:?} ring did not stop after a short packet", id);
                }
                ring.retire(&td);
                ring.restart(&self.regs, &ep.enring_td_list);
            } else {
                ring.retire(&td);
            }
            record_lengths(&mut td, &lengths, short);
            log::trace!("[CANINOS-HCD] URB {} done on {:?}, {} bytes", td.urb.id(), id, td.urb.actual_length());
            ep.dering_td_list.push_back(td);
        }
        self.fill_ring(ep);
    }
}
