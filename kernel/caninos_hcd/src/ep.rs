//! Endpoint resources: hardware endpoint indices, FIFO space and the
//! register banks that go with them.
//!
//! Every non-control endpoint occupies one of 15 hardware indices per
//! direction. Control endpoints of all devices share the EP0 hardware; each
//! gets a slot in a small pool and is programmed into EP0 while it owns the
//! active control transfer.

use alloc::{collections::{BTreeMap, VecDeque}, vec::Vec};
use bitflags::bitflags;
use usb_hcd::{DeviceInfo, Direction, HcdError, HostEndpoint, PipeType, Speed};
use crate::{
    config::{EP0_FIFO_BYTES, MAX_EP0_SLOTS, MAX_EP_NUM},
    fifo::FifoAllocator,
    regs::{bits, BufferType, EndpointRegs, EpCon, EpType, RegisterIo, RegisterMap},
    ring::{Ring, Td},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointId {
    /// A slot of the EP0 pool
    Control(u8),
    In(u8),
    Out(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub enqueued: u32,
    pub completed: u32,
    pub stalled: u32,
    pub unlinked: u32,
}

bitflags! {
    pub struct EpResetFlags: u8 {
        const FIFO = bits::ENDPRST_FIFO;
        const TOGGLE = bits::ENDPRST_TOGGLE;
    }
}

/// A control endpoint parked in the EP0 pool.
#[derive(Debug)]
pub struct Ep0Slot {
    pub host_ep: u64,
    pub device: DeviceInfo,
    pub max_packet: u16,
    pub stats: EndpointStats,
}

/// One direction of a non-control endpoint bound to a hardware index.
#[derive(Debug)]
pub struct Endpoint {
    pub index: u8,
    pub dir: Direction,
    pub pipe_type: PipeType,
    pub max_packet: u16,
    /// Extra transactions per microframe
    pub mult: u8,
    pub buf_type: BufferType,
    pub fifo_addr: u32,
    pub regs: EndpointRegs,
    pub host_ep: u64,
    pub device: DeviceInfo,
    pub interval: u8,
    pub stats: EndpointStats,
    pub ring: Option<Ring>,
    /// Accepted, waiting for ring space (or for data, on the interrupt IN window)
    pub queue_td_list: VecDeque<Td>,
    /// Described by ring TRBs, oldest first
    pub enring_td_list: VecDeque<Td>,
    /// Pulled out of the ring, waiting for the deferred pass to give them back
    pub dering_td_list: VecDeque<Td>,
    /// Consecutive errors on the interrupt IN window
    pub error_count: u32,
}

impl Endpoint {
    pub fn id(&self) -> EndpointId {
        match self.dir {
            Direction::In => EndpointId::In(self.index),
            Direction::Out => EndpointId::Out(self.index),
        }
    }

    pub fn mask(&self) -> u8 {
        endpoint_mask(self.index, self.dir)
    }

    /// Bytes moved per (micro)frame, counting high-bandwidth transactions.
    pub fn packet_size(&self) -> usize {
        self.max_packet as usize * (self.mult as usize + 1)
    }

    pub fn has_parent_hub(&self) -> bool {
        self.device.tt.is_some()
    }

    /// Whether this endpoint uses the interrupt IN staging window
    /// instead of mapping URB buffers.
    pub fn uses_intr_window(&self) -> bool {
        self.pipe_type == PipeType::Interrupt && self.dir == Direction::In
    }

    /// Whether a TD for `urb_id` is tracked by this endpoint.
    pub fn holds(&self, urb_id: u64) -> bool {
        [&self.queue_td_list, &self.enring_td_list, &self.dering_td_list]
            .iter()
            .any(|list| list.iter().any(|td| td.urb.id() == urb_id))
    }
}

/// Subbuffers per endpoint by pipe type.
pub fn buffer_type_for(pipe_type: PipeType) -> BufferType {
    match pipe_type {
        PipeType::Isochronous => BufferType::Double,
        PipeType::Control | PipeType::Bulk | PipeType::Interrupt => BufferType::Single,
    }
}

pub fn endpoint_mask(index: u8, dir: Direction) -> u8 {
    match dir {
        Direction::In => index & 0x0f,
        Direction::Out => (index & 0x0f) | bits::ENDPRST_OUT,
    }
}

/// Result of removing an endpoint from the table.
#[derive(Debug)]
pub enum Removed {
    Control(Ep0Slot),
    Endpoint(Endpoint),
}

/// The driver-wide endpoint table.
#[derive(Debug)]
pub struct EndpointTable {
    ep0: Vec<Option<Ep0Slot>>,
    inep: Vec<Option<Endpoint>>,
    outep: Vec<Option<Endpoint>>,
    by_host: BTreeMap<u64, EndpointId>,
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointTable {
    pub fn new() -> Self {
        let mut ep0 = Vec::with_capacity(MAX_EP0_SLOTS);
        ep0.resize_with(MAX_EP0_SLOTS, || None);
        let mut inep = Vec::with_capacity(MAX_EP_NUM + 1);
        inep.resize_with(MAX_EP_NUM + 1, || None);
        let mut outep = Vec::with_capacity(MAX_EP_NUM + 1);
        outep.resize_with(MAX_EP_NUM + 1, || None);
        EndpointTable { ep0, inep, outep, by_host: BTreeMap::new() }
    }

    pub fn lookup(&self, host_ep: u64) -> Option<EndpointId> {
        self.by_host.get(&host_ep).copied()
    }

    pub fn ep0(&self, slot: u8) -> Option<&Ep0Slot> {
        self.ep0.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn ep0_mut(&mut self, slot: u8) -> Option<&mut Ep0Slot> {
        self.ep0.get_mut(slot as usize).and_then(Option::as_mut)
    }

    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        match id {
            EndpointId::In(i) => self.inep.get(i as usize).and_then(Option::as_ref),
            EndpointId::Out(i) => self.outep.get(i as usize).and_then(Option::as_ref),
            EndpointId::Control(_) => None,
        }
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        match id {
            EndpointId::In(i) => self.inep.get_mut(i as usize).and_then(Option::as_mut),
            EndpointId::Out(i) => self.outep.get_mut(i as usize).and_then(Option::as_mut),
            EndpointId::Control(_) => None,
        }
    }

    pub fn stats(&self, id: EndpointId) -> Option<EndpointStats> {
        match id {
            EndpointId::Control(slot) => self.ep0(slot).map(|s| s.stats),
            _ => self.get(id).map(|ep| ep.stats),
        }
    }

    pub fn stats_mut(&mut self, id: EndpointId) -> Option<&mut EndpointStats> {
        match id {
            EndpointId::Control(slot) => self.ep0_mut(slot).map(|s| &mut s.stats),
            _ => self.get_mut(id).map(|ep| &mut ep.stats),
        }
    }

    /// Ids of all live non-control endpoints.
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.inep.iter().chain(self.outep.iter()).flatten().map(Endpoint::id).collect()
    }

    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.inep.iter_mut().chain(self.outep.iter_mut()).flatten()
    }

    /// Parks a control endpoint in the EP0 pool.
    pub fn allocate_control(&mut self, host_ep: &HostEndpoint, device: DeviceInfo) -> Result<EndpointId, HcdError> {
        let slot = self.ep0.iter().position(Option::is_none).ok_or(HcdError::ResourceExhausted)?;
        self.ep0[slot] = Some(Ep0Slot {
            host_ep: host_ep.id(),
            device,
            max_packet: host_ep.desc.max_packet().clamp(8, EP0_FIFO_BYTES),
            stats: EndpointStats::default(),
        });
        let id = EndpointId::Control(slot as u8);
        self.by_host.insert(host_ep.id(), id);
        Ok(id)
    }

    /// Binds a non-control endpoint to a free hardware index and FIFO range.
    pub fn allocate_endpoint(
        &mut self,
        fifo: &mut FifoAllocator,
        map: &RegisterMap,
        host_ep: &HostEndpoint,
        device: DeviceInfo,
    ) -> Result<EndpointId, HcdError> {
        let desc = &host_ep.desc;
        let pipe_type = desc.pipe_type();
        let dir = desc.direction();
        let table = match dir {
            Direction::In => &mut self.inep,
            Direction::Out => &mut self.outep,
        };
        let index = (1..=MAX_EP_NUM).find(|&i| table[i].is_none()).ok_or_else(|| {
            log::warn!("[CANINOS-HCD] no free {:?} endpoint index", dir);
            HcdError::ResourceExhausted
        })?;

        let buf_type = buffer_type_for(pipe_type);
        let mult = if device.speed == Speed::High { desc.mult() } else { 0 };
        let bytes = buf_type.subbuffers() * desc.max_packet() as usize * (mult as usize + 1);
        // the index is only taken once the FIFO range is secured
        let fifo_addr = fifo.allocate(bytes).ok_or_else(|| {
            log::warn!("[CANINOS-HCD] FIFO exhausted allocating {} bytes", bytes);
            HcdError::ResourceExhausted
        })?;

        table[index] = Some(Endpoint {
            index: index as u8,
            dir,
            pipe_type,
            max_packet: desc.max_packet(),
            mult,
            buf_type,
            fifo_addr,
            regs: map.endpoint_regs(index as u8, dir),
            host_ep: host_ep.id(),
            device,
            interval: desc.interval,
            stats: EndpointStats::default(),
            ring: None,
            queue_td_list: VecDeque::new(),
            enring_td_list: VecDeque::new(),
            dering_td_list: VecDeque::new(),
            error_count: 0,
        });
        let id = match dir {
            Direction::In => EndpointId::In(index as u8),
            Direction::Out => EndpointId::Out(index as u8),
        };
        self.by_host.insert(host_ep.id(), id);
        log::debug!("[CANINOS-HCD] {:?} {:?} endpoint at FIFO {:#x}", id, pipe_type, fifo_addr);
        Ok(id)
    }

    /// Releases the index and FIFO range of the endpoint bound to `host_ep`.
    /// The caller must already have stopped its ring. Returns `None` if the
    /// endpoint is not (or no longer) allocated.
    pub fn free_endpoint(&mut self, host_ep: u64, fifo: &mut FifoAllocator) -> Option<Removed> {
        let id = self.by_host.remove(&host_ep)?;
        match id {
            EndpointId::Control(slot) => self.ep0.get_mut(slot as usize)?.take().map(Removed::Control),
            EndpointId::In(i) | EndpointId::Out(i) => {
                let table = if matches!(id, EndpointId::In(_)) { &mut self.inep } else { &mut self.outep };
                let ep = table.get_mut(i as usize)?.take()?;
                fifo.free(ep.fifo_addr);
                Some(Removed::Endpoint(ep))
            }
        }
    }

    /// Ids of every allocated endpoint, control slots included.
    pub fn all_ids(&self) -> Vec<EndpointId> {
        self.by_host.values().copied().collect()
    }
}

/// Issues a FIFO and/or toggle reset. The reset register wants the endpoint
/// selected first and the command in a second write.
pub fn reset_endpoint_hardware<R: RegisterIo>(regs: &R, map: &RegisterMap, mask: u8, flags: EpResetFlags) {
    regs.write8(map.endprst, mask);
    regs.write8(map.endprst, mask | flags.bits());
}

fn split_settings(device: &DeviceInfo) -> (u8, u8) {
    match device.tt {
        Some(tt) if device.speed != Speed::High => (bits::SPLIT_ENABLE | (tt.hub_address & 0x7f), tt.port),
        _ => (0, device.port),
    }
}

/// Programs the register bank of `ep` and enables it.
pub fn configure_endpoint_hardware<R: RegisterIo>(regs: &R, map: &RegisterMap, ep: &Endpoint) {
    let r = &ep.regs;
    regs.write8(r.con, 0);
    regs.write16(r.maxpck, ep.max_packet);
    regs.write32(r.staddr, ep.fifo_addr);
    regs.write8(r.devaddr, ep.device.address);
    let (split, port) = split_settings(&ep.device);
    regs.write8(r.split, split);
    regs.write8(r.port, port);
    if matches!(ep.pipe_type, PipeType::Interrupt | PipeType::Isochronous) {
        regs.write8(r.interval, ep.interval);
    }

    let mut con = EpCon::from(0u8);
    con.set_buf_type(ep.buf_type);
    con.set_ep_type(match ep.pipe_type {
        PipeType::Control => EpType::Control,
        PipeType::Isochronous => EpType::Isochronous,
        PipeType::Bulk => EpType::Bulk,
        PipeType::Interrupt => EpType::Interrupt,
    });
    con.set_dma_mode(true);
    con.set_enabled(true);
    regs.write8(r.con, u8::from(con));
    reset_endpoint_hardware(regs, map, ep.mask(), EpResetFlags::FIFO | EpResetFlags::TOGGLE);
}

pub fn disable_endpoint_hardware<R: RegisterIo>(regs: &R, ep: &Endpoint) {
    regs.write8(ep.regs.con, 0);
}

/// Points the shared EP0 hardware at the device owning `slot`.
pub fn configure_ep0_hardware<R: RegisterIo>(regs: &R, map: &RegisterMap, slot: &Ep0Slot) {
    let (split, port) = split_settings(&slot.device);
    for dir in [Direction::In, Direction::Out] {
        let r = map.endpoint_regs(0, dir);
        regs.write8(r.devaddr, slot.device.address);
        regs.write8(r.split, split);
        regs.write8(r.port, port);
    }
    regs.write8(map.ep0_maxpck, slot.max_packet as u8);
    reset_endpoint_hardware(regs, map, endpoint_mask(0, Direction::In), EpResetFlags::FIFO | EpResetFlags::TOGGLE);
    reset_endpoint_hardware(regs, map, endpoint_mask(0, Direction::Out), EpResetFlags::FIFO | EpResetFlags::TOGGLE);
}
