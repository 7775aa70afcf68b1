//! Control transfers on the shared EP0 hardware.
//!
//! [`ControlTransfer`] is the stage machine of one transfer; it does no I/O
//! and tells its driver what to put on the bus next. Only one transfer owns
//! EP0 at a time, the one in `ControllerState::active_ep0`.
//!
//! ```text
//! Idle -> SetupSent -> { DataIn | DataOut | (no data) } -> Status -> Ack -> Complete
//! ```

use alloc::vec;
use usb_hcd::{Direction, RawRequest, UrbError, UrbStatus};
use crate::{
    config::EP0_BUSY_POLL_CAP,
    ep::{configure_ep0_hardware, endpoint_mask, reset_endpoint_hardware, EndpointId, EpResetFlags},
    hcd::{CaninosHcd, ControllerState},
    queue::{QueueHandle, QueueList},
    regs::{try_wait_until, Ep0Cs, RegisterIo},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    Idle,
    SetupSent,
    DataIn,
    DataOut,
    Status,
    Ack,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataToggle {
    Data0,
    Data1,
}

impl DataToggle {
    pub fn flip(self) -> Self {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }
}

/// What the driver has to do next for a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ep0Step {
    SendSetup,
    /// Accept one IN data packet
    ArmIn { toggle: DataToggle },
    /// Send `len` bytes of the buffer, starting at `offset`
    SendOut { offset: usize, len: usize, toggle: DataToggle },
    /// Zero-length status handshake from the device
    StatusIn { toggle: DataToggle },
    /// Zero-length status handshake to the device
    StatusOut { toggle: DataToggle },
    Complete(UrbStatus),
    /// The event does not fit the current phase
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ControlTransfer {
    setup: RawRequest,
    phase: ControlPhase,
    toggle: DataToggle,
    requested: usize,
    actual: usize,
    max_packet: usize,
    short_not_ok: bool,
    short_error: bool,
    /// Length of the OUT packet on the bus
    in_flight: usize,
}

impl ControlTransfer {
    /// The data stage moves `wLength` bytes, capped at `buf_len`.
    pub fn new(setup: RawRequest, buf_len: usize, max_packet: u16, short_not_ok: bool) -> Self {
        ControlTransfer {
            setup,
            phase: ControlPhase::Idle,
            toggle: DataToggle::Data1,
            requested: (setup.len() as usize).min(buf_len),
            actual: 0,
            max_packet: max_packet.max(1) as usize,
            short_not_ok,
            short_error: false,
            in_flight: 0,
        }
    }

    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    pub fn setup(&self) -> RawRequest {
        self.setup
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn actual(&self) -> usize {
        self.actual
    }

    pub fn start(&mut self) -> Ep0Step {
        if self.phase != ControlPhase::Idle {
            return Ep0Step::Ignore;
        }
        self.phase = ControlPhase::SetupSent;
        Ep0Step::SendSetup
    }

    /// The SETUP packet left the controller.
    pub fn setup_done(&mut self) -> Ep0Step {
        if self.phase != ControlPhase::SetupSent {
            return Ep0Step::Ignore;
        }
        // the data stage always opens with DATA1
        self.toggle = DataToggle::Data1;
        if self.requested == 0 {
            self.phase = ControlPhase::Status;
            return Ep0Step::StatusIn { toggle: DataToggle::Data1 };
        }
        match self.setup.direction() {
            Direction::In => {
                self.phase = ControlPhase::DataIn;
                Ep0Step::ArmIn { toggle: self.toggle }
            }
            Direction::Out => {
                self.phase = ControlPhase::DataOut;
                self.next_out()
            }
        }
    }

    fn next_out(&mut self) -> Ep0Step {
        let len = (self.requested - self.actual).min(self.max_packet);
        self.in_flight = len;
        Ep0Step::SendOut { offset: self.actual, len, toggle: self.toggle }
    }

    /// An IN data packet of `received` bytes arrived.
    pub fn in_data(&mut self, received: usize) -> Ep0Step {
        if self.phase != ControlPhase::DataIn {
            return Ep0Step::Ignore;
        }
        self.actual += received.min(self.requested - self.actual);
        self.toggle = self.toggle.flip();
        let short = received < self.max_packet;
        if short || self.actual >= self.requested {
            self.short_error = self.short_not_ok && self.actual < self.requested;
            self.phase = ControlPhase::Status;
            return Ep0Step::StatusOut { toggle: DataToggle::Data1 };
        }
        Ep0Step::ArmIn { toggle: self.toggle }
    }

    /// The OUT packet on the bus was acknowledged.
    pub fn out_done(&mut self) -> Ep0Step {
        if self.phase != ControlPhase::DataOut {
            return Ep0Step::Ignore;
        }
        self.actual += self.in_flight;
        self.in_flight = 0;
        self.toggle = self.toggle.flip();
        if self.actual >= self.requested {
            self.phase = ControlPhase::Status;
            return Ep0Step::StatusIn { toggle: DataToggle::Data1 };
        }
        self.next_out()
    }

    /// The status handshake was acknowledged.
    pub fn status_done(&mut self) -> Ep0Step {
        if self.phase != ControlPhase::Status {
            return Ep0Step::Ignore;
        }
        self.phase = ControlPhase::Ack;
        if self.short_error {
            Ep0Step::Complete(Err(UrbError::ShortTransfer))
        } else {
            Ep0Step::Complete(Ok(()))
        }
    }

    pub fn fail(&mut self, error: UrbError) -> Ep0Step {
        self.phase = ControlPhase::Complete;
        Ep0Step::Complete(Err(error))
    }

    pub fn finish(&mut self) {
        self.phase = ControlPhase::Complete;
    }
}

impl<R: RegisterIo> CaninosHcd<R> {
    /// Hands EP0 to the oldest queued control transfer if it is free.
    pub(crate) fn start_control(&self, state: &mut ControllerState) -> bool {
        if state.active_ep0.is_some() {
            return false;
        }
        let handle = match state.queues.pop_front(QueueList::Enqueue) {
            Some(handle) => handle,
            None => return false,
        };
        let deadline = self.platform.now_ms() + self.config.control_timeout_ms;
        let step = match state.queues.get_mut(handle) {
            Some(q) => {
                q.xfer_started = true;
                q.deadline = Some(deadline);
                if let EndpointId::Control(slot) = q.ep {
                    if let Some(ep0) = state.endpoints.ep0(slot) {
                        configure_ep0_hardware(&self.regs, self.map, ep0);
                    }
                }
                q.ctrl.start()
            }
            None => return false,
        };
        state.active_ep0 = Some(handle);
        state.ep0_block_count = 0;
        state.ep0_block_mark = self.platform.now_ms();
        self.drive_ep0(state, handle, step);
        true
    }

    fn write_toggle(&self, toggle: DataToggle) {
        let mut cs = Ep0Cs::from(0u8);
        match toggle {
            DataToggle::Data0 => cs.set_force_data0(true),
            DataToggle::Data1 => cs.set_force_data1(true),
        }
        self.regs.write8(self.map.ep0cs, u8::from(cs));
    }

    fn send_setup(&self, setup: RawRequest) -> Result<(), UrbError> {
        for (i, byte) in setup.to_bytes().iter().enumerate() {
            self.regs.write8(self.map.setup_data + i, *byte);
        }
        let mut cs = Ep0Cs::from(0u8);
        cs.set_setup(true);
        self.regs.write8(self.map.ep0cs, u8::from(cs));
        try_wait_until!(self.platform, 1, EP0_BUSY_POLL_CAP, !Ep0Cs::from(self.regs.read8(self.map.ep0cs)).out_busy())
            .map_err(|_| UrbError::HardwareTimeout)
    }

    /// Carries out `step` for the active transfer `handle`.
    pub(crate) fn drive_ep0(&self, state: &mut ControllerState, handle: QueueHandle, mut step: Ep0Step) {
        loop {
            let q = match state.queues.get_mut(handle) {
                Some(q) => q,
                None => return,
            };
            log::trace!("[CANINOS-HCD] ep0 {:?}: {:?}", q.ctrl.phase(), step);
            match step {
                Ep0Step::SendSetup => {
                    step = match self.send_setup(q.ctrl.setup()) {
                        Ok(()) => q.ctrl.setup_done(),
                        Err(e) => q.ctrl.fail(e),
                    };
                }
                Ep0Step::ArmIn { toggle } | Ep0Step::StatusIn { toggle } => {
                    self.write_toggle(toggle);
                    self.regs.write8(self.map.hcin0bc, 0);
                    return;
                }
                Ep0Step::SendOut { offset, len, toggle } => {
                    self.write_toggle(toggle);
                    let urb = q.urb.lock();
                    let end = (offset + len).min(urb.buffer.len());
                    for (i, byte) in urb.buffer[offset.min(end)..end].iter().enumerate() {
                        self.regs.write8(self.map.ep0_out_fifo + i, *byte);
                    }
                    self.regs.write8(self.map.hcout0bc, len as u8);
                    return;
                }
                Ep0Step::StatusOut { toggle } => {
                    self.write_toggle(toggle);
                    self.regs.write8(self.map.hcout0bc, 0);
                    return;
                }
                Ep0Step::Complete(status) => {
                    self.finish_control(state, handle, status);
                    return;
                }
                Ep0Step::Ignore => return,
            }
        }
    }

    /// Moves the active transfer to the finished list and frees EP0.
    fn finish_control(&self, state: &mut ControllerState, handle: QueueHandle, status: UrbStatus) {
        if state.active_ep0 == Some(handle) {
            state.active_ep0 = None;
        }
        let (ep, actual) = match state.queues.get_mut(handle) {
            Some(q) => {
                q.ctrl.finish();
                q.status = status.err();
                q.urb.lock().actual_length = q.ctrl.actual();
                (q.ep, q.ctrl.actual())
            }
            None => return,
        };
        if let Err(UrbError::Protocol(usb_hcd::ProtocolError::Stall)) = status {
            if let Some(stats) = state.endpoints.stats_mut(ep) {
                stats.stalled += 1;
            }
        }
        log::debug!("[CANINOS-HCD] control transfer done, {} bytes, {:?}", actual, status);
        state.queues.push(handle, QueueList::Finished);
    }

    pub(crate) fn reset_ep0_hardware(&self) {
        for dir in [Direction::In, Direction::Out] {
            reset_endpoint_hardware(&self.regs, self.map, endpoint_mask(0, dir), EpResetFlags::FIFO | EpResetFlags::TOGGLE);
        }
    }

    /// Fails the transfer owning EP0 with `error`.
    pub(crate) fn fail_active_control(&self, state: &mut ControllerState, error: UrbError) {
        let handle = match state.active_ep0 {
            Some(handle) => handle,
            None => return,
        };
        self.reset_ep0_hardware();
        let step = match state.queues.get_mut(handle) {
            Some(q) => q.ctrl.fail(error),
            None => {
                state.active_ep0 = None;
                return;
            }
        };
        self.drive_ep0(state, handle, step);
    }

    /// A handshake moved the active transfer along, so EP0 is not blocked.
    fn ep0_progress(&self, state: &mut ControllerState, handle: QueueHandle, step: Ep0Step) {
        if !matches!(step, Ep0Step::Ignore) {
            state.ep0_block_count = 0;
            state.ep0_block_mark = self.platform.now_ms();
        }
        self.drive_ep0(state, handle, step);
    }

    /// EP0 IN completion: a data packet arrived or the status stage ended.
    pub(crate) fn ep0_in_irq(&self, state: &mut ControllerState) {
        let handle = match state.active_ep0 {
            Some(handle) => handle,
            None => {
                log::trace!("[CANINOS-HCD] ep0 IN interrupt with no active transfer");
                return;
            }
        };
        let step = match state.queues.get_mut(handle) {
            Some(q) => match q.ctrl.phase() {
                ControlPhase::DataIn => {
                    let received = self.regs.read8(self.map.hcin0bc) as usize;
                    let mut packet = vec![0u8; received];
                    for (i, byte) in packet.iter_mut().enumerate() {
                        *byte = self.regs.read8(self.map.ep0_in_fifo + i);
                    }
                    let offset = q.ctrl.actual();
                    let room = q.ctrl.requested() - offset;
                    {
                        let mut urb = q.urb.lock();
                        let n = received.min(room).min(urb.buffer.len().saturating_sub(offset));
                        urb.buffer[offset..offset + n].copy_from_slice(&packet[..n]);
                    }
                    q.ctrl.in_data(received)
                }
                ControlPhase::Status => q.ctrl.status_done(),
                _ => Ep0Step::Ignore,
            },
            None => return,
        };
        self.ep0_progress(state, handle, step);
    }

    /// EP0 OUT completion: a data packet or the status stage went out.
    pub(crate) fn ep0_out_irq(&self, state: &mut ControllerState) {
        let handle = match state.active_ep0 {
            Some(handle) => handle,
            None => {
                log::trace!("[CANINOS-HCD] ep0 OUT interrupt with no active transfer");
                return;
            }
        };
        let step = match state.queues.get_mut(handle) {
            Some(q) => match q.ctrl.phase() {
                ControlPhase::DataOut => q.ctrl.out_done(),
                ControlPhase::Status => q.ctrl.status_done(),
                _ => Ep0Step::Ignore,
            },
            None => return,
        };
        self.ep0_progress(state, handle, step);
    }
}
