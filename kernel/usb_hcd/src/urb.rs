//! USB Request Blocks and the endpoints they target.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use crate::{Direction, RawRequest, UrbStatus, UrbError};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_URB_ID: AtomicU64 = AtomicU64::new(1);

/// The four USB transfer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipeType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl PipeType {
    /// Decodes the transfer type from `bmAttributes` of an endpoint descriptor.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => PipeType::Control,
            1 => PipeType::Isochronous,
            2 => PipeType::Bulk,
            _ => PipeType::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

/// The parts of an endpoint descriptor the controller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 { Direction::In } else { Direction::Out }
    }

    pub fn pipe_type(&self) -> PipeType {
        PipeType::from_attributes(self.attributes)
    }

    /// Payload size of a single packet, without the high-bandwidth bits.
    pub fn max_packet(&self) -> u16 {
        self.max_packet_size & 0x7ff
    }

    /// Additional transactions per microframe for high-bandwidth endpoints.
    pub fn mult(&self) -> u8 {
        ((self.max_packet_size >> 11) & 0b11) as u8
    }
}

/// An endpoint as the generic host stack sees it.
#[derive(Debug)]
pub struct HostEndpoint {
    id: u64,
    pub desc: EndpointDescriptor,
}

impl HostEndpoint {
    pub fn new(desc: EndpointDescriptor) -> Arc<Self> {
        Arc::new(HostEndpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            desc,
        })
    }

    /// The default control endpoint of a device.
    pub fn control(max_packet_size: u16) -> Arc<Self> {
        Self::new(EndpointDescriptor { address: 0, attributes: 0, max_packet_size, interval: 0 })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The hub whose transaction translator serves a full/low speed device
/// behind a high speed hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTranslator {
    pub hub_address: u8,
    pub port: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: u8,
    pub speed: Speed,
    /// Root port the device (or its upstream hub) hangs off
    pub port: u8,
    pub tt: Option<TransactionTranslator>,
}

bitflags! {
    pub struct UrbFlags: u32 {
        /// Treat a short IN packet as an error
        const SHORT_NOT_OK = 0x0001;
        /// Schedule isochronous packets as soon as possible
        const ISO_ASAP     = 0x0002;
        /// Terminate an OUT transfer of full packets with a zero-length packet
        const ZERO_PACKET  = 0x0040;
    }
}

/// One packet of an isochronous URB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: usize,
    pub length: usize,
    pub actual_length: usize,
    pub status: UrbStatus,
}

impl IsoPacket {
    pub fn new(offset: usize, length: usize) -> Self {
        IsoPacket { offset, length, actual_length: 0, status: Ok(()) }
    }
}

/// The mutable part of a URB, shared between the submitter and the controller.
#[derive(Debug)]
pub struct UrbState {
    pub buffer: Vec<u8>,
    /// Bus address of `buffer` while it is mapped for DMA
    pub transfer_dma: Option<u32>,
    pub actual_length: usize,
    pub iso_packets: Vec<IsoPacket>,
    /// Set by an unlink request; overrides whatever status the transfer ends with
    pub unlinked: Option<UrbError>,
    /// Set exactly once, right before the completion callback runs
    pub status: Option<UrbStatus>,
}

impl UrbState {
    /// Clears what the previous run of the URB left behind, so the same
    /// URB can be submitted again from its completion callback.
    pub fn restart(&mut self) {
        self.actual_length = 0;
        self.unlinked = None;
        self.status = None;
        for packet in self.iso_packets.iter_mut() {
            packet.actual_length = 0;
            packet.status = Ok(());
        }
    }
}

/// A single USB transfer request.
#[derive(Debug)]
pub struct Urb {
    id: u64,
    pub ep: Arc<HostEndpoint>,
    pub device: DeviceInfo,
    pub setup: Option<RawRequest>,
    pub flags: UrbFlags,
    pub transfer_length: usize,
    state: Mutex<UrbState>,
}

pub type UrbRef = Arc<Urb>;

impl Urb {
    fn new(ep: Arc<HostEndpoint>, device: DeviceInfo, setup: Option<RawRequest>, buffer: Vec<u8>, transfer_length: usize) -> Self {
        Urb {
            id: NEXT_URB_ID.fetch_add(1, Ordering::Relaxed),
            ep,
            device,
            setup,
            flags: UrbFlags::empty(),
            transfer_length,
            state: Mutex::new(UrbState {
                buffer,
                transfer_dma: None,
                actual_length: 0,
                iso_packets: Vec::new(),
                unlinked: None,
                status: None,
            }),
        }
    }

    /// A control transfer. The data stage length is `wLength` of `setup`,
    /// and `buffer` holds OUT data or receives IN data.
    pub fn control(ep: Arc<HostEndpoint>, device: DeviceInfo, setup: RawRequest, mut buffer: Vec<u8>) -> Self {
        let len = setup.len() as usize;
        if buffer.len() < len {
            buffer.resize(len, 0);
        }
        Self::new(ep, device, Some(setup), buffer, len)
    }

    /// A bulk or interrupt transfer covering all of `buffer`.
    pub fn transfer(ep: Arc<HostEndpoint>, device: DeviceInfo, buffer: Vec<u8>) -> Self {
        let len = buffer.len();
        Self::new(ep, device, None, buffer, len)
    }

    /// An isochronous transfer of `packet_lengths` laid out back to back in `buffer`.
    pub fn isochronous(ep: Arc<HostEndpoint>, device: DeviceInfo, mut buffer: Vec<u8>, packet_lengths: &[usize]) -> Self {
        let total: usize = packet_lengths.iter().sum();
        if buffer.len() < total {
            buffer.resize(total, 0);
        }
        let mut urb = Self::new(ep, device, None, buffer, total);
        let mut offset = 0;
        let packets = packet_lengths.iter().map(|&len| {
            let p = IsoPacket::new(offset, len);
            offset += len;
            p
        }).collect();
        urb.state.get_mut().iso_packets = packets;
        urb
    }

    pub fn with_flags(mut self, flags: UrbFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn into_ref(self) -> UrbRef {
        Arc::new(self)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pipe_type(&self) -> PipeType {
        self.ep.desc.pipe_type()
    }

    /// Control transfers take their direction from the SETUP packet.
    pub fn direction(&self) -> Direction {
        match self.setup {
            Some(setup) => setup.direction(),
            None => self.ep.desc.direction(),
        }
    }

    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    pub fn lock(&self) -> MutexGuard<'_, UrbState> {
        self.state.lock()
    }

    pub fn actual_length(&self) -> usize {
        self.state.lock().actual_length
    }

    /// The final status, once the URB has been given back.
    pub fn status(&self) -> Option<UrbStatus> {
        self.state.lock().status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn device() -> DeviceInfo {
        DeviceInfo { address: 3, speed: Speed::High, port: 1, tt: None }
    }

    #[test]
    fn descriptor_fields() {
        let desc = EndpointDescriptor { address: 0x81, attributes: 0x03, max_packet_size: (2 << 11) | 1024, interval: 4 };
        assert_eq!(desc.number(), 1);
        assert_eq!(desc.direction(), Direction::In);
        assert_eq!(desc.pipe_type(), PipeType::Interrupt);
        assert_eq!(desc.max_packet(), 1024);
        assert_eq!(desc.mult(), 2);
    }

    #[test]
    fn control_direction_follows_setup() {
        let ep = HostEndpoint::control(64);
        let urb = Urb::control(ep, device(), RawRequest::get_descriptor(1, 0, 18), Vec::new());
        assert!(urb.is_in());
        assert_eq!(urb.transfer_length, 18);
        assert_eq!(urb.lock().buffer.len(), 18);
    }

    #[test]
    fn iso_packets_are_contiguous() {
        let ep = HostEndpoint::new(EndpointDescriptor { address: 0x82, attributes: 0x01, max_packet_size: 192, interval: 1 });
        let urb = Urb::isochronous(ep, device(), vec![0; 8], &[192, 100, 192]);
        assert_eq!(urb.transfer_length, 484);
        let state = urb.lock();
        let offsets: Vec<usize> = state.iso_packets.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 192, 292]);
        assert_eq!(state.buffer.len(), 484);
    }

    #[test]
    fn restart_clears_the_previous_run() {
        let ep = HostEndpoint::new(EndpointDescriptor { address: 0x82, attributes: 0x01, max_packet_size: 192, interval: 1 });
        let urb = Urb::isochronous(ep, device(), Vec::new(), &[192, 192]);
        let mut state = urb.lock();
        state.actual_length = 384;
        state.unlinked = Some(UrbError::ConnectionReset);
        state.status = Some(Err(UrbError::ConnectionReset));
        state.iso_packets[1].actual_length = 12;
        state.iso_packets[1].status = Err(UrbError::Protocol(crate::ProtocolError::Overrun));

        state.restart();
        assert_eq!(state.actual_length, 0);
        assert_eq!((state.unlinked, state.status), (None, None));
        assert_eq!(state.iso_packets[1], IsoPacket::new(192, 192));
        assert_eq!(state.buffer.len(), 384);
    }
}
