//! URB submission, cancellation and give-back.
//!
//! Control URBs become [`Queue`] records that wait on the enqueue list for
//! EP0. Every other URB becomes a [`Td`] on its endpoint: waiting for ring
//! space on `queue_td_list`, described by TRBs on `enring_td_list`, and
//! pulled out of the ring for give-back on `dering_td_list`.

use alloc::vec::Vec;
use usb_hcd::{HcdError, PipeType, UrbError, UrbFlags, UrbRef, UrbStatus};
use crate::{
    config::EP0_FIFO_BYTES,
    ep::{configure_endpoint_hardware, Endpoint, EndpointId},
    ep0::ControlTransfer,
    hcd::{CaninosHcd, ControllerState},
    queue::{Queue, QueueList},
    regs::RegisterIo,
    ring::{Ring, Segment, Td},
};

/// A URB on its way back to the host stack.
#[derive(Debug)]
pub(crate) struct Giveback {
    pub urb: UrbRef,
    pub status: Option<UrbError>,
    pub dma_mapped: bool,
}

impl From<Td> for Giveback {
    fn from(td: Td) -> Self {
        Giveback { urb: td.urb, status: td.status, dma_mapped: td.dma_mapped }
    }
}

impl From<Queue> for Giveback {
    fn from(q: Queue) -> Self {
        Giveback { urb: q.urb, status: q.status, dma_mapped: false }
    }
}

/// Splits the mapped buffer of `urb` into ring segments.
fn build_segments(urb: &UrbRef, trb_max_len: usize, max_packet: u16) -> Result<Vec<Segment>, HcdError> {
    let state = urb.lock();
    let base = state.transfer_dma.ok_or(HcdError::InvalidRequest)?;

    if !state.iso_packets.is_empty() {
        return Ok(state.iso_packets.iter()
            .map(|p| Segment { addr: base + p.offset as u32, len: p.length as u32 })
            .collect());
    }

    let len = urb.transfer_length;
    let mut segments = Vec::new();
    let mut offset = 0;
    while offset < len {
        let n = (len - offset).min(trb_max_len);
        segments.push(Segment { addr: base + offset as u32, len: n as u32 });
        offset += n;
    }
    let max_packet = max_packet as usize;
    let needs_zlp = urb.flags.contains(UrbFlags::ZERO_PACKET)
        && !urb.is_in()
        && max_packet != 0
        && len % max_packet == 0;
    if segments.is_empty() || needs_zlp {
        segments.push(Segment { addr: base + len as u32, len: 0 });
    }
    Ok(segments)
}

impl<R: RegisterIo> CaninosHcd<R> {
    /// Accepts `urb`. On error the URB was never accepted and will not be
    /// given back.
    pub fn submit(&self, urb: UrbRef) -> Result<(), HcdError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.exiting {
            return Err(HcdError::ControllerExiting);
        }
        if !state.hub.is_connected() {
            return Err(HcdError::Disconnected);
        }
        self.host.link_to_endpoint(&urb)?;
        urb.lock().restart();

        let result = match urb.pipe_type() {
            PipeType::Control => self.submit_control(state, &urb),
            PipeType::Bulk | PipeType::Interrupt | PipeType::Isochronous => self.submit_ring(state, &urb),
        };
        if let Err(e) = result {
            drop(guard);
            log::error!("[CANINOS-HCD] submission to endpoint {:#04x} failed: {}", urb.ep.desc.address, e);
            self.host.unlink_from_endpoint(&urb);
            return Err(e);
        }

        if let Some(stats) = state.endpoints.lookup(urb.ep.id()).and_then(|id| state.endpoints.stats_mut(id)) {
            stats.enqueued += 1;
        }
        let schedule = state.has_deferred_work();
        drop(guard);
        if schedule {
            self.platform.schedule_deferred();
        }
        Ok(())
    }

    fn submit_control(&self, state: &mut ControllerState, urb: &UrbRef) -> Result<(), HcdError> {
        let setup = urb.setup.ok_or(HcdError::InvalidRequest)?;
        let id = match state.endpoints.lookup(urb.ep.id()) {
            Some(id) => id,
            None => state.endpoints.allocate_control(&urb.ep, urb.device)?,
        };
        let slot = match id {
            EndpointId::Control(slot) => slot,
            _ => return Err(HcdError::InvalidRequest),
        };
        let max_packet = match state.endpoints.ep0_mut(slot) {
            Some(ep0) => {
                // enumeration changes both after the first requests
                ep0.device = urb.device;
                ep0.max_packet = urb.ep.desc.max_packet().clamp(8, EP0_FIFO_BYTES);
                ep0.max_packet
            }
            None => return Err(HcdError::NotFound),
        };

        let buf_len = urb.lock().buffer.len();
        let ctrl = ControlTransfer::new(setup, buf_len, max_packet, urb.flags.contains(UrbFlags::SHORT_NOT_OK));
        let handle = state.queues.alloc(Queue::new(urb.clone(), id, ctrl));
        state.queues.push(handle, QueueList::Enqueue);
        log::trace!("[CANINOS-HCD] control URB {} queued on {:?}", urb.id(), id);
        Ok(())
    }

    /// Binds the endpoint of `urb` to hardware and gives it a ring.
    fn open_endpoint(&self, state: &mut ControllerState, urb: &UrbRef) -> Result<EndpointId, HcdError> {
        let id = state.endpoints.allocate_endpoint(&mut state.fifo, self.map, &urb.ep, urb.device)?;
        let ep = state.endpoints.get_mut(id).ok_or(HcdError::NotFound)?;
        let capacity = match ep.pipe_type {
            PipeType::Interrupt => self.config.intr_ring_trbs,
            PipeType::Isochronous => self.config.isoc_ring_trbs,
            PipeType::Bulk | PipeType::Control => self.config.bulk_ring_trbs,
        };

        let ring = Ring::allocate(&*self.dma, self.map.ring_regs(ep.index, ep.dir), ep.pipe_type, ep.dir, capacity)
            .and_then(|mut ring| {
                if ep.uses_intr_window() {
                    if let Err(e) = ring.init_intr_window(&*self.dma, ep.packet_size()) {
                        ring.release(&*self.dma);
                        return Err(e);
                    }
                }
                Ok(ring)
            });
        match ring {
            Ok(ring) => {
                ep.ring = Some(ring);
                configure_endpoint_hardware(&self.regs, self.map, ep);
                Ok(id)
            }
            Err(e) => {
                state.endpoints.free_endpoint(urb.ep.id(), &mut state.fifo);
                Err(e)
            }
        }
    }

    fn submit_ring(&self, state: &mut ControllerState, urb: &UrbRef) -> Result<(), HcdError> {
        let id = match state.endpoints.lookup(urb.ep.id()) {
            Some(id) => id,
            None => self.open_endpoint(state, urb)?,
        };
        let ep = state.endpoints.get_mut(id).ok_or(HcdError::NotFound)?;

        if ep.uses_intr_window() {
            // data is copied out of the staging window, the buffer is never mapped
            ep.queue_td_list.push_back(Td::new(urb.clone(), Vec::new(), false));
            self.service_intr_window(ep);
            return Ok(());
        }

        let capacity = ep.ring.as_ref().map_or(0, Ring::capacity);
        self.host.map_for_dma(urb)?;
        let segments = match build_segments(urb, self.config.trb_max_len, ep.max_packet) {
            Ok(segments) if segments.len() <= capacity => segments,
            Ok(segments) => {
                log::warn!("[CANINOS-HCD] URB {} needs {} TRBs, ring holds {}", urb.id(), segments.len(), capacity);
                self.host.unmap_for_dma(urb);
                return Err(HcdError::TransferTooLarge);
            }
            Err(e) => {
                self.host.unmap_for_dma(urb);
                return Err(e);
            }
        };
        ep.queue_td_list.push_back(Td::new(urb.clone(), segments, true));
        self.fill_ring(ep);
        Ok(())
    }

    /// Moves waiting TDs into the ring while they fit and keeps the engine
    /// running while it has work.
    pub(crate) fn fill_ring(&self, ep: &mut Endpoint) {
        let ring = match ep.ring.as_mut() {
            Some(ring) => ring,
            None => return,
        };
        while let Some(front) = ep.queue_td_list.front() {
            if front.segments.len() > ring.free_slots() {
                break;
            }
            let mut td = match ep.queue_td_list.pop_front() {
                Some(td) => td,
                None => break,
            };
            if ring.enqueue_td(&mut td).is_err() {
                ep.queue_td_list.push_front(td);
                break;
            }
            log::trace!("[CANINOS-HCD] URB {} in ring slots {}+{}", td.urb.id(), td.start, td.num_trbs);
            ep.enring_td_list.push_back(td);
        }
        if ring.is_running() && ring.engine_idle(&self.regs) {
            ring.mark_idle();
        }
        if !ring.is_running() && !ep.enring_td_list.is_empty() {
            ring.restart(&self.regs, &ep.enring_td_list);
        }
    }

    /// Hands data collected in the interrupt IN window to waiting URBs.
    pub(crate) fn service_intr_window(&self, ep: &mut Endpoint) {
        let ring = match ep.ring.as_mut() {
            Some(ring) => ring,
            None => return,
        };
        while !ep.queue_td_list.is_empty() {
            let (slot, len) = match ring.next_intr_data() {
                Some(data) => data,
                None => break,
            };
            if let Some(td) = ep.queue_td_list.pop_front() {
                {
                    let mut urb = td.urb.lock();
                    let n = len.min(urb.buffer.len());
                    ring.copy_intr_data(slot, &mut urb.buffer[..n]);
                    urb.actual_length = n;
                }
                ep.dering_td_list.push_back(td);
            }
            if let Err(e) = ring.reorder_intr_td(slot) {
                log::error!("[CANINOS-HCD] could not re-arm interrupt slot {}: {}", slot, e);
            }
        }
        if !ep.queue_td_list.is_empty() && !ring.is_running() && ring.outstanding() > 0 {
            let slot = ring.dequeue_index();
            ring.start_at(&self.regs, slot);
        }
    }

    /// Cancels `urb`. The URB is given back later, by the deferred pass,
    /// with `status` unless it was already on its way back.
    pub fn cancel(&self, urb: &UrbRef, status: UrbError) -> Result<(), HcdError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let already = urb.lock().unlinked;
        if already.is_some() {
            log::warn!("[CANINOS-HCD] URB {} unlinked twice", urb.id());
            return Err(HcdError::Busy);
        }

        let id = if let Some(handle) = state.queues.find_by_urb(urb.id()) {
            let (list, ep) = match state.queues.get(handle) {
                Some(q) => (q.list(), q.ep),
                None => return Err(HcdError::NotFound),
            };
            match list {
                QueueList::Dequeue | QueueList::Finished => {}
                QueueList::Enqueue => state.queues.push(handle, QueueList::Dequeue),
                QueueList::Detached => {
                    if state.active_ep0 == Some(handle) {
                        state.active_ep0 = None;
                        self.reset_ep0_hardware();
                        if let Some(q) = state.queues.get_mut(handle) {
                            q.ctrl.fail(status);
                        }
                    }
                    state.queues.push(handle, QueueList::Dequeue);
                }
            }
            ep
        } else {
            let id = state.endpoints.lookup(urb.ep.id()).ok_or(HcdError::NotFound)?;
            let ep = state.endpoints.get_mut(id).ok_or(HcdError::NotFound)?;
            if let Some(pos) = ep.queue_td_list.iter().position(|td| td.urb.id() == urb.id()) {
                if let Some(td) = ep.queue_td_list.remove(pos) {
                    ep.dering_td_list.push_back(td);
                }
            } else if let Some(pos) = ep.enring_td_list.iter().position(|td| td.urb.id() == urb.id()) {
                if let Some(ring) = ep.ring.as_mut() {
                    if ring.stop(&self.regs, &*self.platform).is_err() {
                        log::error!("[CANINOS-HCD] {:?} ring did not stop for unlink", id);
                    }
                    if let Some(td) = ring.remove_td(&mut ep.enring_td_list, pos) {
                        ep.dering_td_list.push_back(td);
                    }
                }
                self.fill_ring(ep);
            } else if !ep.dering_td_list.iter().any(|td| td.urb.id() == urb.id()) {
                return Err(HcdError::NotFound);
            }
            id
        };

        urb.lock().unlinked = Some(status);
        if let Some(stats) = state.endpoints.stats_mut(id) {
            stats.unlinked += 1;
        }
        log::debug!("[CANINOS-HCD] URB {} unlinked from {:?} with {}", urb.id(), id, status);
        drop(guard);
        self.platform.schedule_deferred();
        Ok(())
    }

    /// Completes one URB towards the host stack. Runs without the
    /// controller lock; a URB that was already given back is skipped.
    pub(crate) fn giveback(&self, item: Giveback) {
        let status: UrbStatus = {
            let mut urb = item.urb.lock();
            if urb.status.is_some() {
                log::warn!("[CANINOS-HCD] URB {} already given back", item.urb.id());
                return;
            }
            let status = match urb.unlinked.or(item.status) {
                Some(e) => Err(e),
                None => Ok(()),
            };
            urb.status = Some(status);
            status
        };
        self.host.unlink_from_endpoint(&item.urb);
        if item.dma_mapped {
            self.host.unmap_for_dma(&item.urb);
        }
        log::trace!("[CANINOS-HCD] URB {} given back: {:?}", item.urb.id(), status);
        self.host.complete(item.urb, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use usb_hcd::{DeviceInfo, EndpointDescriptor, HostEndpoint, Speed, Urb};

    fn mapped(urb: Urb) -> UrbRef {
        let urb = urb.into_ref();
        urb.lock().transfer_dma = Some(0x8000_0000);
        urb
    }

    fn device() -> DeviceInfo {
        DeviceInfo { address: 2, speed: Speed::High, port: 1, tt: None }
    }

    fn bulk(address: u8) -> alloc::sync::Arc<HostEndpoint> {
        HostEndpoint::new(EndpointDescriptor { address, attributes: 0x02, max_packet_size: 512, interval: 0 })
    }

    #[test]
    fn segments_split_at_trb_max_len() {
        let urb = mapped(Urb::transfer(bulk(0x01), device(), vec![0; 200]));
        let segments = build_segments(&urb, 64, 64).unwrap();
        let lens: Vec<u32> = segments.iter().map(|s| s.len).collect();
        assert_eq!(lens, [64, 64, 64, 8]);
        assert_eq!(segments[3].addr, 0x8000_0000 + 192);
    }

    #[test]
    fn zero_length_packets() {
        let empty = mapped(Urb::transfer(bulk(0x01), device(), Vec::new()));
        assert_eq!(build_segments(&empty, 16384, 512).unwrap(), [Segment { addr: 0x8000_0000, len: 0 }]);

        let full = mapped(Urb::transfer(bulk(0x01), device(), vec![0; 1024]).with_flags(UrbFlags::ZERO_PACKET));
        let lens: Vec<u32> = build_segments(&full, 16384, 512).unwrap().iter().map(|s| s.len).collect();
        assert_eq!(lens, [1024, 0]);

        // IN transfers never end with a host-generated zero-length packet
        let incoming = mapped(Urb::transfer(bulk(0x81), device(), vec![0; 1024]).with_flags(UrbFlags::ZERO_PACKET));
        assert_eq!(build_segments(&incoming, 16384, 512).unwrap().len(), 1);
    }

    #[test]
    fn one_segment_per_iso_packet() {
        let ep = HostEndpoint::new(EndpointDescriptor { address: 0x83, attributes: 0x01, max_packet_size: 256, interval: 1 });
        let urb = mapped(Urb::isochronous(ep, device(), Vec::new(), &[256, 100, 0, 256]));
        let segments = build_segments(&urb, 16384, 256).unwrap();
        let offsets: Vec<u32> = segments.iter().map(|s| s.addr - 0x8000_0000).collect();
        assert_eq!(offsets, [0, 256, 356, 356]);
        assert_eq!(segments[2].len, 0);
    }

    #[test]
    fn unmapped_urbs_are_rejected() {
        let urb = Urb::transfer(bulk(0x02), device(), vec![0; 16]).into_ref();
        assert_eq!(build_segments(&urb, 16384, 512), Err(HcdError::InvalidRequest));
    }
}
