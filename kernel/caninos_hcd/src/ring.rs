//! Descriptor rings feeding the per-endpoint DMA engines.
//!
//! A ring is a power-of-two array of [`Trb`]s in coherent memory. Software
//! fills slots at the enqueue cursor and hands them to the engine by setting
//! [`TrbFlags::OWNED`]; the engine clears that flag as it retires each TRB
//! and writes back the residue. The last physical slot always carries
//! [`TrbFlags::LINK`] and never [`TrbFlags::CHAIN`], so the engine wraps to
//! slot zero instead of reading past the end of the array.
//!
//! Software transfer descriptors ([`Td`]) map a contiguous run of slots back
//! to the URB that produced them.

use alloc::{collections::VecDeque, vec::Vec};
use core::{mem::size_of, sync::atomic::{AtomicUsize, Ordering}};
use bitflags::bitflags;
use static_assertions::const_assert_eq;
use volatile::Volatile;
use usb_hcd::{Direction, HcdError, PipeType, UrbError, UrbRef};
use crate::{
    config::DMA_STOP_POLL_CAP,
    dma::{DmaAllocator, DmaRegion},
    regs::{bits, try_wait_until, RegisterIo, RingRegs},
    Platform,
};

bitflags! {
    pub struct TrbFlags: u32 {
        /// The DMA engine owns this TRB
        const OWNED = 1 << 0;
        /// Interrupt when a short packet ends this TRB
        const IOS   = 1 << 1;
        /// Interrupt when a zero-length packet ends this TRB
        const IOZ   = 1 << 2;
        /// Interrupt when this TRB completes
        const IOC   = 1 << 3;
        /// Continue at the start of the ring after this TRB
        const LINK  = 1 << 4;
        /// The next TRB belongs to the same transfer
        const CHAIN = 1 << 10;
    }
}

#[repr(C)]
pub struct Trb {
    pub buf_ptr: Volatile<u32>,
    pub buf_len: Volatile<u32>,
    /// Bytes left untransferred, written back by the engine
    pub remain: Volatile<u32>,
    pub token: Volatile<u32>,
}

pub const TRB_SIZE: usize = size_of::<Trb>();
const_assert_eq!(TRB_SIZE, 16);

impl Trb {
    pub fn flags(&self) -> TrbFlags {
        TrbFlags::from_bits_truncate(self.token.read())
    }

    pub fn owned(&self) -> bool {
        self.flags().contains(TrbFlags::OWNED)
    }

    /// Bytes the engine actually moved.
    pub fn transferred(&self) -> usize {
        let len = self.buf_len.read();
        (len - self.remain.read().min(len)) as usize
    }

    fn clear(&mut self) {
        self.token.write(0);
        self.buf_ptr.write(0);
        self.buf_len.write(0);
        self.remain.write(0);
    }
}

/// One DMA-contiguous piece of a transfer, described by a single TRB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    pub len: u32,
}

/// Software transfer descriptor: one URB on a ring-backed endpoint.
#[derive(Debug)]
pub struct Td {
    pub urb: UrbRef,
    pub segments: Vec<Segment>,
    /// First ring slot, valid while the TD sits in the ring
    pub start: usize,
    pub num_trbs: usize,
    pub err_count: u32,
    pub dma_mapped: bool,
    /// Failure recorded before the TD is given back
    pub status: Option<UrbError>,
}

impl Td {
    pub fn new(urb: UrbRef, segments: Vec<Segment>, dma_mapped: bool) -> Self {
        Td { urb, segments, start: 0, num_trbs: 0, err_count: 0, dma_mapped, status: None }
    }

    /// Whether the TD's slots run past the end of the ring array.
    pub fn crosses_wrap(&self, capacity: usize) -> bool {
        self.start + self.num_trbs > capacity
    }
}

/// How far the engine got through a TD.
#[derive(Debug, PartialEq, Eq)]
pub enum TdProgress {
    Pending,
    /// Bytes moved by each retired TRB, and whether a short packet ended
    /// the TD before all its TRBs ran
    Done { lengths: Vec<usize>, short: bool },
}

/// Staging memory of the interrupt IN window. Slot `i` of the ring always
/// receives into staging buffer `i`.
#[derive(Debug)]
struct IntrWindow {
    staging: DmaRegion,
    slot_len: usize,
    /// Retired slots and their byte counts, oldest first
    ready: VecDeque<(usize, usize)>,
}

#[derive(Debug)]
pub struct Ring {
    mem: DmaRegion,
    capacity: usize,
    enqueue: usize,
    dequeue: usize,
    free: AtomicUsize,
    running: bool,
    pub dir: Direction,
    pub pipe_type: PipeType,
    regs: RingRegs,
    window: Option<IntrWindow>,
}

impl Ring {
    pub fn allocate(
        dma: &dyn DmaAllocator,
        regs: RingRegs,
        pipe_type: PipeType,
        dir: Direction,
        capacity: usize,
    ) -> Result<Ring, HcdError> {
        if !capacity.is_power_of_two() {
            return Err(HcdError::InvalidRequest);
        }
        let mut mem = dma.alloc_coherent(capacity * TRB_SIZE).map_err(|e| {
            log::error!("[CANINOS-HCD] failed to allocate a {}-TRB ring", capacity);
            e
        })?;
        mem.fill(0);
        Ok(Ring {
            mem,
            capacity,
            enqueue: 0,
            dequeue: 0,
            free: AtomicUsize::new(capacity),
            running: false,
            dir,
            pipe_type,
            regs,
            window: None,
        })
    }

    /// Returns the ring memory, and the staging window if any, to `dma`.
    pub fn release(self, dma: &dyn DmaAllocator) {
        if let Some(window) = self.window {
            dma.free_coherent(window.staging);
        }
        dma.free_coherent(self.mem);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// TRBs handed to the ring and not yet retired.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.free_slots()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue
    }

    pub fn dequeue_index(&self) -> usize {
        self.dequeue
    }

    pub fn slot_bus(&self, slot: usize) -> u32 {
        self.mem.bus() + (slot * TRB_SIZE) as u32
    }

    fn wrap(&self, slot: usize) -> usize {
        slot & (self.capacity - 1)
    }

    pub fn trb(&self, slot: usize) -> Option<&Trb> {
        self.mem.get::<Trb>(self.wrap(slot) * TRB_SIZE)
    }

    fn trb_mut(&mut self, slot: usize) -> Option<&mut Trb> {
        let offset = self.wrap(slot) * TRB_SIZE;
        self.mem.get_mut::<Trb>(offset)
    }

    /// Writes a TRB, applying the wrap rule for the slot it lands in.
    /// The token goes last so the engine never sees a half-written TRB.
    fn place(&mut self, slot: usize, buf: u32, len: u32, remain: u32, mut flags: TrbFlags) {
        if self.wrap(slot) == self.capacity - 1 {
            flags.remove(TrbFlags::CHAIN);
            flags.insert(TrbFlags::LINK);
        } else {
            flags.remove(TrbFlags::LINK);
        }
        if let Some(trb) = self.trb_mut(slot) {
            trb.buf_ptr.write(buf);
            trb.buf_len.write(len);
            trb.remain.write(remain);
            trb.token.write(flags.bits());
        }
    }

    fn clear_slot(&mut self, slot: usize) {
        if let Some(trb) = self.trb_mut(slot) {
            trb.clear();
        }
    }

    /// Claims the slot at the enqueue cursor and hands it to the engine.
    pub fn enqueue_descriptor(&mut self, buf: u32, len: u32, flags: TrbFlags) -> Result<usize, HcdError> {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| HcdError::RingFull)?;
        let slot = self.enqueue;
        self.place(slot, buf, len, 0, flags | TrbFlags::OWNED);
        self.enqueue = self.wrap(slot + 1);
        Ok(slot)
    }

    /// Describes every segment of `td` in consecutive slots, or nothing at
    /// all if the ring lacks room for the whole TD.
    pub fn enqueue_td(&mut self, td: &mut Td) -> Result<(), HcdError> {
        let n = td.segments.len();
        if n > self.free_slots() {
            return Err(HcdError::RingFull);
        }
        let mut base = TrbFlags::empty();
        if self.dir == Direction::In {
            base |= TrbFlags::IOS;
        }
        td.start = self.enqueue;
        td.num_trbs = n;
        for (i, seg) in td.segments.iter().enumerate() {
            let flags = if i + 1 < n { base | TrbFlags::CHAIN } else { base | TrbFlags::IOC };
            self.enqueue_descriptor(seg.addr, seg.len, flags)?;
        }
        Ok(())
    }

    /// Points the engine at `slot` and starts it.
    pub fn start_at<R: RegisterIo>(&mut self, regs: &R, slot: usize) {
        let bus = self.slot_bus(self.wrap(slot));
        regs.write32(self.regs.link, bus);
        regs.write32(self.regs.ctrl, bits::DMACTRL_START);
        self.running = true;
        log::trace!("[CANINOS-HCD] ring {:?}/{:?} started at {:#x}", self.pipe_type, self.dir, bus);
    }

    /// Cancels the engine and waits for it to go quiet. The ring is marked
    /// stopped even if the engine never acknowledges.
    pub fn stop<R: RegisterIo>(&mut self, regs: &R, platform: &dyn Platform) -> Result<(), HcdError> {
        self.running = false;
        regs.write32(self.regs.ctrl, bits::DMACTRL_CANCEL);
        let result = try_wait_until!(platform, 1, DMA_STOP_POLL_CAP, regs.read32(self.regs.ctrl) & bits::DMACTRL_START == 0);
        log::trace!("[CANINOS-HCD] ring stopped at {:#x}", regs.read32(self.regs.cur));
        result
    }

    /// Whether the engine went idle on its own, having run out of owned TRBs.
    pub fn engine_idle<R: RegisterIo>(&self, regs: &R) -> bool {
        regs.read32(self.regs.ctrl) & bits::DMACTRL_START == 0
    }

    pub fn mark_idle(&mut self) {
        self.running = false;
    }

    pub fn td_progress(&self, td: &Td) -> TdProgress {
        let mut lengths = Vec::with_capacity(td.num_trbs);
        let mut short = false;
        for k in 0..td.num_trbs {
            let trb = match self.trb(td.start + k) {
                Some(trb) => trb,
                None => return TdProgress::Pending,
            };
            if trb.owned() {
                return if short { TdProgress::Done { lengths, short } } else { TdProgress::Pending };
            }
            let moved = trb.transferred();
            if moved < trb.buf_len.read() as usize && self.pipe_type != PipeType::Isochronous {
                short = true;
            }
            lengths.push(moved);
        }
        TdProgress::Done { lengths, short }
    }

    /// Frees the slots of `td`, which must be the oldest TD in the ring.
    pub fn retire(&mut self, td: &Td) {
        for k in 0..td.num_trbs {
            self.clear_slot(td.start + k);
        }
        self.dequeue = self.wrap(td.start + td.num_trbs);
        self.free.fetch_add(td.num_trbs, Ordering::AcqRel);
    }

    /// Takes the TD at `pos` out of `tds` and out of the ring, closing the
    /// gap by moving every younger TD down. The ring must be stopped.
    pub fn remove_td(&mut self, tds: &mut VecDeque<Td>, pos: usize) -> Option<Td> {
        let td = tds.remove(pos)?;
        if pos == 0 {
            self.retire(&td);
            return Some(td);
        }

        let mut dst = td.start;
        for later in tds.iter_mut().skip(pos) {
            let new_start = dst;
            for k in 0..later.num_trbs {
                let (buf, len, remain, flags) = match self.trb(later.start + k) {
                    Some(trb) => (trb.buf_ptr.read(), trb.buf_len.read(), trb.remain.read(), trb.flags()),
                    None => continue,
                };
                let mut flags = flags - (TrbFlags::CHAIN | TrbFlags::LINK);
                if k + 1 < later.num_trbs {
                    flags |= TrbFlags::CHAIN;
                }
                self.place(dst, buf, len, remain, flags);
                dst = self.wrap(dst + 1);
            }
            later.start = new_start;
        }
        for k in 0..td.num_trbs {
            self.clear_slot(dst + k);
        }
        self.enqueue = dst;
        self.free.fetch_add(td.num_trbs, Ordering::AcqRel);
        Some(td)
    }

    /// Restarts the engine at the first TRB it still owns, if any.
    pub fn restart<R: RegisterIo>(&mut self, regs: &R, tds: &VecDeque<Td>) -> bool {
        let first = tds.iter()
            .flat_map(|td| (0..td.num_trbs).map(move |k| td.start + k))
            .find(|&slot| self.trb(slot).map_or(false, Trb::owned));
        match first {
            Some(slot) => {
                self.start_at(regs, slot);
                true
            }
            None => {
                self.running = false;
                false
            }
        }
    }

    /// Arms every slot with its own staging buffer of `slot_len` bytes.
    pub fn init_intr_window(&mut self, dma: &dyn DmaAllocator, slot_len: usize) -> Result<(), HcdError> {
        let mut staging = dma.alloc_coherent(slot_len * self.capacity)?;
        staging.fill(0);
        let base = staging.bus();
        self.window = Some(IntrWindow { staging, slot_len, ready: VecDeque::new() });
        for i in 0..self.capacity {
            self.enqueue_descriptor(base + (i * slot_len) as u32, slot_len as u32, TrbFlags::IOC | TrbFlags::IOS)?;
        }
        Ok(())
    }

    pub fn has_intr_window(&self) -> bool {
        self.window.is_some()
    }

    /// Moves window slots the engine has filled onto the ready list.
    pub fn collect_intr(&mut self) -> usize {
        let mut collected = 0;
        while self.outstanding() > 0 {
            let slot = self.dequeue;
            let moved = match self.trb(slot) {
                Some(trb) if !trb.owned() => trb.transferred(),
                _ => break,
            };
            if let Some(window) = self.window.as_mut() {
                window.ready.push_back((slot, moved));
            }
            self.dequeue = self.wrap(slot + 1);
            self.free.fetch_add(1, Ordering::AcqRel);
            collected += 1;
        }
        if self.outstanding() == 0 {
            // every slot holds data nobody has claimed; the engine is parked
            self.running = false;
        }
        collected
    }

    /// The oldest filled window slot and its byte count.
    pub fn next_intr_data(&mut self) -> Option<(usize, usize)> {
        self.window.as_mut()?.ready.pop_front()
    }

    pub fn copy_intr_data(&self, slot: usize, dst: &mut [u8]) {
        if let Some(window) = self.window.as_ref() {
            window.staging.read_bytes(slot * window.slot_len, dst);
        }
    }

    /// Re-arms a consumed window slot at the tail of the ring. Slots are
    /// consumed in ring order, so the enqueue cursor always sits on the
    /// slot being recycled.
    pub fn reorder_intr_td(&mut self, slot: usize) -> Result<usize, HcdError> {
        let (bus, len) = match self.window.as_ref() {
            Some(w) => (w.staging.bus() + (slot * w.slot_len) as u32, w.slot_len as u32),
            None => return Err(HcdError::InvalidRequest),
        };
        debug_assert_eq!(self.enqueue, slot);
        self.enqueue_descriptor(bus, len, TrbFlags::IOC | TrbFlags::IOS)
    }
}
