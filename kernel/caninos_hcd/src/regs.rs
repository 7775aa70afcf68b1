//! Register access and the per-SoC register layout of the controller.

use alloc::sync::Arc;
use core::ptr::NonNull;
use bilge::prelude::*;
use volatile::Volatile;
use usb_hcd::Direction;

/// Byte-granular access to the controller's register window.
pub trait RegisterIo: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn write8(&self, offset: usize, value: u8);
    fn read16(&self, offset: usize) -> u16;
    fn write16(&self, offset: usize, value: u16);
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);

    fn set_bits8(&self, offset: usize, bits: u8) {
        let value = self.read8(offset);
        self.write8(offset, value | bits);
    }

    fn clear_bits8(&self, offset: usize, bits: u8) {
        let value = self.read8(offset);
        self.write8(offset, value & !bits);
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn read8(&self, offset: usize) -> u8 { (**self).read8(offset) }
    fn write8(&self, offset: usize, value: u8) { (**self).write8(offset, value) }
    fn read16(&self, offset: usize) -> u16 { (**self).read16(offset) }
    fn write16(&self, offset: usize, value: u16) { (**self).write16(offset, value) }
    fn read32(&self, offset: usize) -> u32 { (**self).read32(offset) }
    fn write32(&self, offset: usize, value: u32) { (**self).write32(offset, value) }
}

/// A mapped MMIO window.
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

// The region is only ever touched through volatile accesses.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// # Safety
    /// `base` must point to `len` bytes of device memory mapped for the
    /// lifetime of the returned region.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(base).map(|base| MmioRegion { base, len })
    }

    fn register<T: Copy>(&self, offset: usize) -> Option<*mut Volatile<T>> {
        if offset + core::mem::size_of::<T>() > self.len {
            log::error!("[CANINOS-HCD] register offset {:#x} outside of the MMIO window", offset);
            return None;
        }
        Some(unsafe { self.base.as_ptr().add(offset) } as *mut Volatile<T>)
    }

    fn read<T: Copy + Default>(&self, offset: usize) -> T {
        match self.register::<T>(offset) {
            Some(reg) => unsafe { (*reg).read() },
            None => T::default(),
        }
    }

    fn write<T: Copy>(&self, offset: usize, value: T) {
        if let Some(reg) = self.register::<T>(offset) {
            unsafe { (*reg).write(value) }
        }
    }
}

impl RegisterIo for MmioRegion {
    fn read8(&self, offset: usize) -> u8 { self.read(offset) }
    fn write8(&self, offset: usize, value: u8) { self.write(offset, value) }
    fn read16(&self, offset: usize) -> u16 { self.read(offset) }
    fn write16(&self, offset: usize, value: u16) { self.write(offset, value) }
    fn read32(&self, offset: usize) -> u32 { self.read(offset) }
    fn write32(&self, offset: usize, value: u32) { self.write(offset, value) }
}

/// Polls `$cond` up to `$cap` times, waiting `$interval_us` between polls.
macro_rules! try_wait_until {
    ($platform:expr, $interval_us:expr, $cap:expr, $cond:expr) => {{
        let mut polls = 0;
        while !($cond) && polls < $cap {
            $platform.udelay($interval_us);
            polls += 1;
        }

        if polls >= $cap && !($cond) {
            log::error!("[CANINOS-HCD] line {}: timeout expiry", line!());
            Err(usb_hcd::HcdError::HardwareTimeout)
        } else {
            Ok(())
        }
    }}
}
pub(crate) use try_wait_until;

/// The SoC generations the controller ships in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareProfile {
    K5,
    K7,
}

impl HardwareProfile {
    pub fn registers(self) -> &'static RegisterMap {
        match self {
            HardwareProfile::K5 => &K5_REGISTERS,
            HardwareProfile::K7 => &K7_REGISTERS,
        }
    }
}

/// Per-endpoint register banks of one direction.
#[derive(Debug)]
pub struct EndpointBank {
    /// HCxCON of endpoint 1; endpoint N sits `con_stride * (N - 1)` above
    pub con: usize,
    pub con_stride: usize,
    /// 16-bit max packet registers, endpoint 1 first
    pub maxpck: usize,
    /// 32-bit FIFO start address registers, endpoint 1 first
    pub staddr: usize,
    /// Error registers, endpoint 0 first
    pub err: usize,
    pub err_stride: usize,
    /// Byte-wide per-endpoint registers, endpoint 0 first
    pub devaddr: usize,
    pub port: usize,
    pub split: usize,
    pub interval: usize,
}

/// Descriptor ring engine registers of one direction.
#[derive(Debug)]
pub struct RingBank {
    /// Registers of endpoint 1
    pub base: usize,
    pub stride: usize,
}

/// Interrupt vector numbers reported in IVECT.
#[derive(Debug)]
pub struct VectorMap {
    pub sof: u8,
    pub usb_reset: u8,
    pub ep0_in: u8,
    pub ep0_out: u8,
    pub otg: u8,
    /// First of 16 consecutive IN error vectors, endpoint 0 first
    pub hcin_err: u8,
    /// First of 16 consecutive OUT error vectors, endpoint 0 first
    pub hcout_err: u8,
}

/// Register offsets of one SoC generation, relative to the MMIO base.
#[derive(Debug)]
pub struct RegisterMap {
    pub hcout0bc: usize,
    pub hcin0bc: usize,
    pub ep0cs: usize,
    pub ep0_maxpck: usize,
    pub ep0_in_fifo: usize,
    pub ep0_out_fifo: usize,
    pub setup_data: usize,

    pub usbirq: usize,
    pub usbien: usize,
    pub usbeirq: usize,
    pub usbeien: usize,
    pub ivect: usize,
    pub otgirq: usize,
    pub otgien: usize,
    pub otgstate: usize,
    pub otgctrl: usize,
    pub usbcs: usize,
    pub hcportctrl: usize,
    pub endprst: usize,
    pub phy_ctrl: usize,

    /// 16-bit pending bitmaps, bit N for endpoint N
    pub hcin_err_irq: usize,
    pub hcout_err_irq: usize,
    pub hcin_err_ien: usize,
    pub hcout_err_ien: usize,
    pub hcin_done_irq: usize,
    pub hcout_done_irq: usize,
    pub hcin_dma_irq: usize,
    pub hcout_dma_irq: usize,
    pub hcin_dma_ien: usize,
    pub hcout_dma_ien: usize,
    /// Short packet, zero packet and empty FIFO conditions the driver
    /// does not act upon but must acknowledge
    pub surprise_irqs: [usize; 4],

    pub hcin: EndpointBank,
    pub hcout: EndpointBank,
    pub ring_in: RingBank,
    pub ring_out: RingBank,

    pub vectors: VectorMap,
    pub fifo_bytes: usize,
    /// Size of the register window
    pub window: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRegs {
    pub con: usize,
    pub maxpck: usize,
    pub staddr: usize,
    pub err: usize,
    pub devaddr: usize,
    pub port: usize,
    pub split: usize,
    pub interval: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRegs {
    pub link: usize,
    pub cur: usize,
    pub ctrl: usize,
}

impl RegisterMap {
    fn bank(&self, dir: Direction) -> &EndpointBank {
        match dir {
            Direction::In => &self.hcin,
            Direction::Out => &self.hcout,
        }
    }

    /// Registers of endpoint `index` (1..=15) in direction `dir`.
    pub fn endpoint_regs(&self, index: u8, dir: Direction) -> EndpointRegs {
        let bank = self.bank(dir);
        let i = index as usize;
        let n = i.saturating_sub(1);
        EndpointRegs {
            con: bank.con + bank.con_stride * n,
            maxpck: bank.maxpck + 2 * n,
            staddr: bank.staddr + 4 * n,
            err: bank.err + bank.err_stride * i,
            devaddr: bank.devaddr + i,
            port: bank.port + i,
            split: bank.split + i,
            interval: bank.interval + i,
        }
    }

    /// The error register of EP0 in direction `dir`.
    pub fn ep0_err(&self, dir: Direction) -> usize {
        self.bank(dir).err
    }

    pub fn ring_regs(&self, index: u8, dir: Direction) -> RingRegs {
        let bank = match dir {
            Direction::In => &self.ring_in,
            Direction::Out => &self.ring_out,
        };
        let base = bank.base + bank.stride * (index as usize).saturating_sub(1);
        RingRegs { link: base, cur: base + 0x4, ctrl: base + 0x8 }
    }
}

pub static K5_REGISTERS: RegisterMap = RegisterMap {
    hcout0bc: 0x000,
    hcin0bc: 0x001,
    ep0cs: 0x002,
    ep0_maxpck: 0x1c0,
    ep0_in_fifo: 0x100,
    ep0_out_fifo: 0x140,
    setup_data: 0x180,

    usbirq: 0x18c,
    usbeirq: 0x190,
    usbeien: 0x194,
    usbien: 0x198,
    otgien: 0x19a,
    ivect: 0x1a0,
    endprst: 0x1a2,
    usbcs: 0x1a3,
    hcportctrl: 0x1ab,
    otgirq: 0x1bc,
    otgstate: 0x1bd,
    otgctrl: 0x1be,
    phy_ctrl: 0x480,

    hcin_err_irq: 0x1b4,
    hcout_err_irq: 0x1b6,
    hcin_err_ien: 0x1b8,
    hcout_err_ien: 0x1ba,
    hcin_done_irq: 0x1c4,
    hcout_done_irq: 0x1c6,
    hcin_dma_irq: 0xa00,
    hcout_dma_irq: 0xa02,
    hcin_dma_ien: 0xa04,
    hcout_dma_ien: 0xa06,
    surprise_irqs: [0xa08, 0xa0a, 0xa0c, 0xa0e],

    hcin: EndpointBank {
        con: 0x00a,
        con_stride: 8,
        maxpck: 0x1e0,
        staddr: 0x300,
        err: 0x0c0,
        err_stride: 4,
        devaddr: 0x400,
        port: 0x420,
        split: 0x440,
        interval: 0x460,
    },
    hcout: EndpointBank {
        con: 0x00e,
        con_stride: 8,
        maxpck: 0x200,
        staddr: 0x340,
        err: 0x0c2,
        err_stride: 4,
        devaddr: 0x410,
        port: 0x430,
        split: 0x450,
        interval: 0x470,
    },
    ring_in: RingBank { base: 0x800, stride: 0x20 },
    ring_out: RingBank { base: 0x600, stride: 0x20 },

    vectors: VectorMap {
        sof: 0x04,
        usb_reset: 0x10,
        ep0_in: 0x18,
        ep0_out: 0x28,
        otg: 0xd8,
        hcin_err: 0x60,
        hcout_err: 0x70,
    },
    fifo_bytes: 64 * 64,
    window: 0x1000,
};

pub static K7_REGISTERS: RegisterMap = RegisterMap {
    hcout0bc: 0x000,
    hcin0bc: 0x001,
    ep0cs: 0x002,
    ep0_maxpck: 0x1c0,
    ep0_in_fifo: 0x100,
    ep0_out_fifo: 0x140,
    setup_data: 0x180,

    usbirq: 0x18c,
    usbeirq: 0x190,
    usbeien: 0x194,
    usbien: 0x198,
    otgien: 0x19a,
    ivect: 0x1a0,
    endprst: 0x1a2,
    usbcs: 0x1a3,
    hcportctrl: 0x1ab,
    otgirq: 0x1bc,
    otgstate: 0x1bd,
    otgctrl: 0x1be,
    phy_ctrl: 0x4c0,

    hcin_err_irq: 0x1b4,
    hcout_err_irq: 0x1b6,
    hcin_err_ien: 0x1b8,
    hcout_err_ien: 0x1ba,
    hcin_done_irq: 0x1c4,
    hcout_done_irq: 0x1c6,
    hcin_dma_irq: 0x1400,
    hcout_dma_irq: 0x1402,
    hcin_dma_ien: 0x1404,
    hcout_dma_ien: 0x1406,
    surprise_irqs: [0x1408, 0x140a, 0x140c, 0x140e],

    hcin: EndpointBank {
        con: 0x00a,
        con_stride: 8,
        maxpck: 0x1e0,
        staddr: 0x300,
        err: 0x0c0,
        err_stride: 4,
        devaddr: 0x400,
        port: 0x420,
        split: 0x440,
        interval: 0x460,
    },
    hcout: EndpointBank {
        con: 0x00e,
        con_stride: 8,
        maxpck: 0x200,
        staddr: 0x340,
        err: 0x0c2,
        err_stride: 4,
        devaddr: 0x410,
        port: 0x430,
        split: 0x450,
        interval: 0x470,
    },
    ring_in: RingBank { base: 0x1000, stride: 0x40 },
    ring_out: RingBank { base: 0xc00, stride: 0x40 },

    vectors: VectorMap {
        sof: 0x02,
        usb_reset: 0x05,
        ep0_in: 0x08,
        ep0_out: 0x18,
        otg: 0xd8,
        hcin_err: 0x40,
        hcout_err: 0x50,
    },
    fifo_bytes: 128 * 64,
    window: 0x2000,
};

pub mod bits {
    pub const USBEIRQ_USBIRQ: u8 = 1 << 3;

    pub const USBIRQ_SOF: u8 = 1 << 1;
    pub const USBIRQ_RESET: u8 = 1 << 4;
    pub const USBIRQ_HS: u8 = 1 << 5;

    pub const OTGIRQ_ALL: u8 = 0x1f;

    pub const OTGCTRL_BUSREQ: u8 = 1 << 0;
    pub const OTGCTRL_ABUSDROP: u8 = 1 << 1;

    pub const USBCS_LSMODE: u8 = 1 << 1;
    pub const USBCS_HSMODE: u8 = 1 << 6;

    pub const HCPORTCTRL_RESET: u8 = 1 << 6;
    pub const HCPORTCTRL_RESET_TIME: u8 = 0x1f;

    pub const ENDPRST_OUT: u8 = 1 << 4;
    pub const ENDPRST_FIFO: u8 = 1 << 5;
    pub const ENDPRST_TOGGLE: u8 = 1 << 6;

    pub const DMACTRL_START: u32 = 1 << 0;
    pub const DMACTRL_CANCEL: u32 = 1 << 1;

    pub const PHY_PLL_EN: u8 = 1 << 0;
    pub const PHY_CAL_DONE: u8 = 1 << 7;

    pub const SPLIT_ENABLE: u8 = 1 << 7;
}

/// OTG state machine values reported in OTGSTATE.
pub mod otg_state {
    pub const A_IDLE: u8 = 0x00;
    pub const A_WAIT_VRISE: u8 = 0x01;
    pub const A_WAIT_BCON: u8 = 0x02;
    pub const A_HOST: u8 = 0x03;
    pub const A_SUSPEND: u8 = 0x04;
}

/// Buffering of an endpoint FIFO.
#[bitsize(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBits)]
pub enum BufferType {
    Single = 0,
    Double = 1,
    Triple = 2,
    Quad = 3,
}

impl BufferType {
    pub fn subbuffers(self) -> usize {
        match self {
            BufferType::Single => 1,
            BufferType::Double => 2,
            BufferType::Triple => 3,
            BufferType::Quad => 4,
        }
    }
}

#[bitsize(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBits)]
pub enum EpType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// HCxCON, the per-endpoint configuration register.
#[bitsize(8)]
#[derive(DebugBits, Clone, Copy, FromBits)]
pub struct EpCon {
    pub buf_type: BufferType,
    pub ep_type: EpType,
    pub dma_mode: bool,
    pub spare: u2,
    pub enabled: bool,
}

/// EP0CS, the control endpoint status and handshake register.
#[bitsize(8)]
#[derive(DebugBits, Clone, Copy, FromBits)]
pub struct Ep0Cs {
    pub stall: bool,
    pub in_busy: bool,
    pub out_busy: bool,
    pub hs_nak: bool,
    /// Send the SETUP packet in the setup data registers
    pub setup: bool,
    pub toggle: bool,
    /// Force the next data toggle to DATA1
    pub force_data1: bool,
    /// Force the next data toggle to DATA0
    pub force_data0: bool,
}

#[bitsize(3)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBits)]
pub enum HcErrKind {
    None = 0,
    Crc = 1,
    Toggle = 2,
    Stall = 3,
    Timeout = 4,
    Pid = 5,
    Overrun = 6,
    Underrun = 7,
}

/// HCxERR, the per-endpoint transaction error register.
#[bitsize(8)]
#[derive(DebugBits, Clone, Copy, FromBits)]
pub struct HcErr {
    pub count: u2,
    pub kind: HcErrKind,
    /// Retry the failed transaction
    pub resend: bool,
    pub ping: bool,
    pub split_err: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strides() {
        let map = HardwareProfile::K5.registers();
        let ep1 = map.endpoint_regs(1, Direction::In);
        let ep3 = map.endpoint_regs(3, Direction::In);
        assert_eq!(ep3.con - ep1.con, 16);
        assert_eq!(ep3.maxpck - ep1.maxpck, 4);
        assert_eq!(ep3.staddr - ep1.staddr, 8);
        assert_eq!(map.endpoint_regs(2, Direction::Out).err, map.ep0_err(Direction::Out) + 8);
        let ring = map.ring_regs(2, Direction::Out);
        assert_eq!(ring.link, 0x620);
        assert_eq!(ring.ctrl, 0x628);
    }

    #[test]
    fn profiles_fit_their_window() {
        for profile in [HardwareProfile::K5, HardwareProfile::K7] {
            let map = profile.registers();
            let last_ring = map.ring_regs(15, Direction::In);
            assert!(last_ring.ctrl + 4 <= map.window);
            assert!(map.hcout_dma_ien + 2 <= map.window);
            for irq in map.surprise_irqs {
                assert!(irq + 2 <= map.window);
            }
        }
    }

    #[test]
    fn mmio_accesses_stay_in_the_window() {
        let mut backing = alloc::vec![0u32; 4];
        let mmio = unsafe { MmioRegion::new(backing.as_mut_ptr() as *mut u8, 16) }.unwrap();
        mmio.write32(4, 0x1234_5678);
        assert_eq!(mmio.read8(4), 0x78);
        assert_eq!(mmio.read16(6), 0x1234);
        mmio.set_bits8(0, 0x81);
        mmio.clear_bits8(0, 0x01);
        assert_eq!(mmio.read8(0), 0x80);
        // past the end reads as zero and writes are dropped
        mmio.write32(14, 0xffff_ffff);
        assert_eq!(mmio.read32(14), 0);
        assert_eq!(backing[3], 0);
    }

    #[test]
    fn register_bitfields() {
        let err = HcErr::from(0x2cu8);
        assert_eq!(err.kind(), HcErrKind::Stall);
        assert!(err.resend());

        let mut con = EpCon::from(0u8);
        con.set_ep_type(EpType::Bulk);
        con.set_buf_type(BufferType::Double);
        con.set_enabled(true);
        assert_eq!(u8::from(con), 0x89);

        let mut cs = Ep0Cs::from(0u8);
        cs.set_setup(true);
        cs.set_force_data0(true);
        assert_eq!(u8::from(cs), 0x90);
        assert!(!cs.force_data1());

        let mut cs = Ep0Cs::from(0u8);
        cs.set_toggle(true);
        cs.set_force_data1(true);
        assert_eq!(u8::from(cs), 0x60);
    }
}
