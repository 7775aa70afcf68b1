//! Software stand-ins for the register window, coherent memory, the
//! platform and the host stack.

use alloc::{boxed::Box, collections::{BTreeMap, BTreeSet}, sync::Arc, vec, vec::Vec};
use core::{ptr::NonNull, sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering}};
use spin::Mutex;
use usb_hcd::{GenericHost, HcdError, UrbRef, UrbStatus};
use crate::{
    dma::{DmaAllocator, DmaRegion},
    regs::{RegisterIo, RegisterMap},
    ring::TrbFlags,
    Platform,
};

/// A register window backed by plain memory. Interrupt status registers
/// are write-one-to-clear like the real ones.
pub struct FakeRegs {
    mem: Mutex<Vec<u8>>,
    stuck: Mutex<BTreeMap<usize, u8>>,
    w1c: BTreeSet<usize>,
    writes: Mutex<Vec<(usize, u32)>>,
}

impl FakeRegs {
    pub fn new(map: &'static RegisterMap) -> Self {
        let mut w1c = BTreeSet::new();
        w1c.extend([map.usbirq, map.usbeirq, map.otgirq]);
        for reg in [
            map.hcin_err_irq,
            map.hcout_err_irq,
            map.hcin_done_irq,
            map.hcout_done_irq,
            map.hcin_dma_irq,
            map.hcout_dma_irq,
        ]
        .into_iter()
        .chain(map.surprise_irqs)
        {
            w1c.extend([reg, reg + 1]);
        }
        FakeRegs {
            mem: Mutex::new(vec![0; map.window]),
            stuck: Mutex::new(BTreeMap::new()),
            w1c,
            writes: Mutex::new(Vec::new()),
        }
    }

    fn store(&self, offset: usize, bytes: &[u8]) {
        let mut mem = self.mem.lock();
        for (i, &b) in bytes.iter().enumerate() {
            let at = offset + i;
            if self.w1c.contains(&at) {
                mem[at] &= !b;
            } else {
                mem[at] = b;
            }
        }
    }

    fn load(&self, offset: usize, n: usize) -> u32 {
        let mem = self.mem.lock();
        let stuck = self.stuck.lock();
        (0..n).fold(0, |acc, i| {
            let b = mem[offset + i] | stuck.get(&(offset + i)).copied().unwrap_or(0);
            acc | (b as u32) << (8 * i)
        })
    }

    /// Keeps `bits` of the byte at `offset` set whatever gets written.
    pub fn stick(&self, offset: usize, bits: u8) {
        *self.stuck.lock().entry(offset).or_insert(0) |= bits;
    }

    pub fn peek8(&self, offset: usize) -> u8 {
        self.load(offset, 1) as u8
    }

    pub fn peek16(&self, offset: usize) -> u16 {
        self.load(offset, 2) as u16
    }

    pub fn peek32(&self, offset: usize) -> u32 {
        self.load(offset, 4)
    }

    /// Sets register contents the way the hardware would, bypassing
    /// write-one-to-clear and the write log.
    pub fn poke8(&self, offset: usize, value: u8) {
        self.mem.lock()[offset] = value;
    }

    pub fn poke16(&self, offset: usize, value: u16) {
        self.mem.lock()[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn poke32(&self, offset: usize, value: u32) {
        self.mem.lock()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Raises interrupt status bits.
    pub fn raise8(&self, offset: usize, bits: u8) {
        self.mem.lock()[offset] |= bits;
    }

    pub fn raise16(&self, offset: usize, bits: u16) {
        let mut mem = self.mem.lock();
        for (i, b) in bits.to_le_bytes().iter().enumerate() {
            mem[offset + i] |= b;
        }
    }

    /// Values written to exactly `offset`, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes.lock().iter().filter(|(at, _)| *at == offset).map(|&(_, v)| v).collect()
    }

    fn log(&self, offset: usize, value: u32) {
        self.writes.lock().push((offset, value));
    }
}

impl RegisterIo for FakeRegs {
    fn read8(&self, offset: usize) -> u8 {
        self.load(offset, 1) as u8
    }

    fn write8(&self, offset: usize, value: u8) {
        self.log(offset, value as u32);
        self.store(offset, &[value]);
    }

    fn read16(&self, offset: usize) -> u16 {
        self.load(offset, 2) as u16
    }

    fn write16(&self, offset: usize, value: u16) {
        self.log(offset, value as u32);
        self.store(offset, &value.to_le_bytes());
    }

    fn read32(&self, offset: usize) -> u32 {
        self.load(offset, 4)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.log(offset, value);
        self.store(offset, &value.to_le_bytes());
    }
}

const FAKE_BUS_BASE: u32 = 0x1000_0000;

struct Allocation {
    addr: usize,
    words: usize,
}

/// Coherent memory from the heap, at made-up bus addresses.
pub struct FakeDma {
    regions: Mutex<BTreeMap<u32, Allocation>>,
    next_bus: Mutex<u32>,
    fail_next: AtomicBool,
}

impl FakeDma {
    pub fn new() -> Self {
        FakeDma {
            regions: Mutex::new(BTreeMap::new()),
            next_bus: Mutex::new(FAKE_BUS_BASE),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Makes the next allocation fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    pub fn live_regions(&self) -> usize {
        self.regions.lock().len()
    }

    fn host_ptr(&self, bus: u32, len: usize) -> *mut u8 {
        let regions = self.regions.lock();
        let (&base, region) = regions.range(..=bus).next_back().expect("bus address outside of any region");
        let offset = (bus - base) as usize;
        assert!(offset + len <= region.words * 8, "access past the end of a DMA region");
        (region.addr + offset) as *mut u8
    }

    pub fn read_u32(&self, bus: u32) -> u32 {
        unsafe { core::ptr::read_volatile(self.host_ptr(bus, 4) as *const u32) }
    }

    pub fn write_u32(&self, bus: u32, value: u32) {
        unsafe { core::ptr::write_volatile(self.host_ptr(bus, 4) as *mut u32, value) }
    }

    pub fn write_bytes(&self, bus: u32, bytes: &[u8]) {
        let ptr = self.host_ptr(bus, bytes.len());
        for (i, &b) in bytes.iter().enumerate() {
            unsafe { core::ptr::write_volatile(ptr.add(i), b) };
        }
    }

    /// Retires the TRB at `bus` as the engine would, leaving `remain`
    /// bytes untransferred.
    pub fn retire_trb(&self, bus: u32, remain: u32) {
        self.write_u32(bus + 8, remain);
        let token = self.read_u32(bus + 12);
        self.write_u32(bus + 12, token & !TrbFlags::OWNED.bits());
    }
}

impl DmaAllocator for FakeDma {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, HcdError> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(HcdError::OutOfMemory);
        }
        let words = ((len + 7) / 8).max(1);
        let mem: &mut [u64] = Box::leak(vec![0u64; words].into_boxed_slice());
        let ptr = NonNull::new(mem.as_mut_ptr() as *mut u8).ok_or(HcdError::OutOfMemory)?;

        let mut next = self.next_bus.lock();
        let bus = *next;
        *next += ((words * 8 + 0xfff) & !0xfff) as u32;
        self.regions.lock().insert(bus, Allocation { addr: ptr.as_ptr() as usize, words });
        Ok(unsafe { DmaRegion::from_raw(ptr, bus, len) })
    }

    fn free_coherent(&self, region: DmaRegion) {
        let allocation = self.regions.lock().remove(&region.bus()).expect("freeing an unknown DMA region");
        let slice = core::ptr::slice_from_raw_parts_mut(allocation.addr as *mut u64, allocation.words);
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Platform services with a manual clock. Deferred work is only counted;
/// tests run the deferred pass themselves.
pub struct FakePlatform {
    now: AtomicU64,
    delays: AtomicUsize,
    scheduled: AtomicUsize,
    timed: AtomicUsize,
    irq_disabled: AtomicUsize,
    irq_enabled: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        FakePlatform {
            now: AtomicU64::new(0),
            delays: AtomicUsize::new(0),
            scheduled: AtomicUsize::new(0),
            timed: AtomicUsize::new(0),
            irq_disabled: AtomicUsize::new(0),
            irq_enabled: AtomicUsize::new(0),
        }
    }

    pub fn delays(&self) -> usize {
        self.delays.load(Ordering::Acquire)
    }

    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Requests for a pass at a later time.
    pub fn timed_schedules(&self) -> usize {
        self.timed.load(Ordering::Acquire)
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    /// Times the interrupt line was masked and unmasked.
    pub fn irq_toggles(&self) -> (usize, usize) {
        (self.irq_disabled.load(Ordering::Acquire), self.irq_enabled.load(Ordering::Acquire))
    }
}

impl Platform for FakePlatform {
    fn disable_irq(&self) {
        self.irq_disabled.fetch_add(1, Ordering::AcqRel);
    }

    fn enable_irq(&self) {
        self.irq_enabled.fetch_add(1, Ordering::AcqRel);
    }

    fn schedule_deferred(&self) {
        self.scheduled.fetch_add(1, Ordering::AcqRel);
    }

    fn schedule_deferred_in(&self, _delay_ms: u64) {
        self.timed.fetch_add(1, Ordering::AcqRel);
    }

    fn udelay(&self, _us: u32) {
        self.delays.fetch_add(1, Ordering::AcqRel);
    }

    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub urb: u64,
    pub status: UrbStatus,
    pub actual: usize,
}

pub type CompleteHook = Arc<dyn Fn(UrbRef) + Send + Sync>;

/// A host stack that records what the driver tells it.
pub struct RecordingHost {
    completions: Mutex<Vec<Completion>>,
    linked: Mutex<BTreeSet<u64>>,
    mapped: Mutex<BTreeSet<u64>>,
    hub_changes: AtomicUsize,
    hook: Mutex<Option<CompleteHook>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        RecordingHost {
            completions: Mutex::new(Vec::new()),
            linked: Mutex::new(BTreeSet::new()),
            mapped: Mutex::new(BTreeSet::new()),
            hub_changes: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.completions.lock().clone()
    }

    pub fn completions_of(&self, urb: &UrbRef) -> Vec<Completion> {
        self.completions.lock().iter().filter(|c| c.urb == urb.id()).cloned().collect()
    }

    pub fn is_linked(&self, urb: &UrbRef) -> bool {
        self.linked.lock().contains(&urb.id())
    }

    pub fn is_mapped(&self, urb: &UrbRef) -> bool {
        self.mapped.lock().contains(&urb.id())
    }

    pub fn hub_changes(&self) -> usize {
        self.hub_changes.load(Ordering::Acquire)
    }

    /// Runs `hook` after every recorded completion.
    pub fn on_complete(&self, hook: CompleteHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Bus address a mapped URB buffer gets.
    pub fn dma_address(urb: &UrbRef) -> u32 {
        0x4000_0000 | ((urb.id() as u32 & 0x3fff) << 16)
    }
}

impl GenericHost for RecordingHost {
    fn link_to_endpoint(&self, urb: &UrbRef) -> Result<(), HcdError> {
        self.linked.lock().insert(urb.id());
        Ok(())
    }

    fn unlink_from_endpoint(&self, urb: &UrbRef) {
        self.linked.lock().remove(&urb.id());
    }

    fn map_for_dma(&self, urb: &UrbRef) -> Result<(), HcdError> {
        urb.lock().transfer_dma = Some(Self::dma_address(urb));
        self.mapped.lock().insert(urb.id());
        Ok(())
    }

    fn unmap_for_dma(&self, urb: &UrbRef) {
        urb.lock().transfer_dma = None;
        self.mapped.lock().remove(&urb.id());
    }

    fn complete(&self, urb: UrbRef, status: UrbStatus) {
        let actual = urb.actual_length();
        self.completions.lock().push(Completion { urb: urb.id(), status, actual });
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(urb);
        }
    }

    fn root_hub_changed(&self) {
        self.hub_changes.fetch_add(1, Ordering::AcqRel);
    }
}
