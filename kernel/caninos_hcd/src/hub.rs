//! The emulated single-port root hub.

use alloc::vec::Vec;
use static_assertions::const_assert_eq;
use zerocopy::AsBytes;
use usb_hcd::{desc_type, HcdError, HubRequest, PortFeature, PortStatus, Speed};
use crate::{
    hcd::CaninosHcd,
    regs::{bits, RegisterIo},
};

/// Port states of the root hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhState {
    PoweredOff,
    Powered,
    Attached,
    Reset,
    Enabled,
    Suspended,
    Disabled,
    NotAttached,
}

/// USB 2.0 hub descriptor of a hub with a single port.
#[derive(AsBytes, Clone, Copy, Debug)]
#[repr(C, packed)]
struct HubDescriptor {
    length: u8,
    descriptor_type: u8,
    num_ports: u8,
    characteristics: u16,
    power_on_to_good: u8,
    hub_control_current: u8,
    device_removable: u8,
    port_power_mask: u8,
}

const_assert_eq!(core::mem::size_of::<HubDescriptor>(), 9);

/// Individual port power switching, individual over-current protection.
const HUB_CHARACTERISTICS: u16 = 0x0009;

static ROOT_HUB_DESCRIPTOR: HubDescriptor = HubDescriptor {
    length: 9,
    descriptor_type: desc_type::HUB,
    num_ports: 1,
    characteristics: HUB_CHARACTERISTICS.to_le(),
    power_on_to_good: 1,
    hub_control_current: 0,
    device_removable: 0x00,
    port_power_mask: 0xff,
};

#[derive(Debug)]
pub struct RootHub {
    status: PortStatus,
    state: RhState,
    speed: Option<Speed>,
}

impl Default for RootHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RootHub {
    pub fn new() -> Self {
        RootHub { status: PortStatus::empty(), state: RhState::PoweredOff, speed: None }
    }

    pub fn state(&self) -> RhState {
        self.state
    }

    pub fn port_status(&self) -> PortStatus {
        self.status
    }

    pub fn speed(&self) -> Option<Speed> {
        self.speed
    }

    pub fn is_connected(&self) -> bool {
        self.status.contains(PortStatus::CONNECTION)
    }

    /// The controller entered host mode with a device on the port.
    pub fn connect(&mut self) {
        self.status.insert(PortStatus::CONNECTION | PortStatus::C_CONNECTION);
        if self.state != RhState::PoweredOff {
            self.state = RhState::Attached;
        }
    }

    pub fn disconnect(&mut self) {
        if self.status.contains(PortStatus::ENABLE) {
            self.status.insert(PortStatus::C_ENABLE);
        }
        self.status.remove(
            PortStatus::CONNECTION
                | PortStatus::ENABLE
                | PortStatus::SUSPEND
                | PortStatus::RESET
                | PortStatus::LOW_SPEED
                | PortStatus::HIGH_SPEED,
        );
        self.status.insert(PortStatus::C_CONNECTION);
        self.state = RhState::NotAttached;
        self.speed = None;
    }

    pub fn power(&mut self, on: bool) {
        if on {
            self.status.insert(PortStatus::POWER);
            if self.state == RhState::PoweredOff {
                self.state = if self.is_connected() { RhState::Attached } else { RhState::Powered };
            }
        } else {
            self.status = self.status.changes();
            self.state = RhState::PoweredOff;
            self.speed = None;
        }
    }

    /// A port reset was started.
    pub fn reset_started(&mut self) {
        self.status.remove(PortStatus::ENABLE | PortStatus::LOW_SPEED | PortStatus::HIGH_SPEED);
        self.status.insert(PortStatus::RESET);
        self.state = RhState::Reset;
        self.speed = None;
    }

    /// The bus reset finished and the port came up at `speed`.
    pub fn bus_reset_done(&mut self, speed: Speed) {
        if !self.is_connected() {
            return;
        }
        self.status.remove(PortStatus::RESET | PortStatus::LOW_SPEED | PortStatus::HIGH_SPEED);
        self.status.insert(PortStatus::ENABLE | PortStatus::C_RESET);
        match speed {
            Speed::Low => self.status.insert(PortStatus::LOW_SPEED),
            Speed::High => self.status.insert(PortStatus::HIGH_SPEED),
            Speed::Full => {}
        }
        self.state = RhState::Enabled;
        self.speed = Some(speed);
    }

    pub fn suspend(&mut self) {
        if self.state == RhState::Enabled {
            self.status.insert(PortStatus::SUSPEND);
            self.state = RhState::Suspended;
        }
    }

    pub fn resume(&mut self) {
        if self.state == RhState::Suspended {
            self.status.remove(PortStatus::SUSPEND);
            self.status.insert(PortStatus::C_SUSPEND);
            self.state = RhState::Enabled;
        }
    }

    pub fn disable(&mut self) {
        if self.status.contains(PortStatus::ENABLE) {
            self.status.remove(PortStatus::ENABLE | PortStatus::SUSPEND);
            self.state = RhState::Disabled;
        }
    }

    pub fn clear_change(&mut self, change: PortStatus) {
        self.status.remove(change.changes());
    }

    /// Port change bitmap as sent on the hub's status endpoint: bit 1 is port 1.
    pub fn status_data(&self) -> Option<u8> {
        if self.status.changes().is_empty() {
            None
        } else {
            Some(1 << 1)
        }
    }
}

fn check_port(port: u16) -> Result<(), HcdError> {
    if port == 1 {
        Ok(())
    } else {
        log::debug!("[CANINOS-HCD] hub request for nonexistent port {}", port);
        Err(HcdError::InvalidRequest)
    }
}

impl<R: RegisterIo> CaninosHcd<R> {
    pub fn hub_status_data(&self) -> Option<u8> {
        self.state.lock().hub.status_data()
    }

    pub fn hub_control(&self, req: HubRequest) -> Result<Vec<u8>, HcdError> {
        let mut state = self.state.lock();
        match req {
            HubRequest::ClearHubFeature(_) | HubRequest::SetHubFeature(_) => Ok(Vec::new()),
            HubRequest::GetHubDescriptor { len } => {
                let bytes = ROOT_HUB_DESCRIPTOR.as_bytes();
                Ok(bytes[..bytes.len().min(len as usize)].to_vec())
            }
            HubRequest::GetHubStatus => Ok(alloc::vec![0; 4]),
            HubRequest::GetPortStatus { port } => {
                check_port(port)?;
                Ok(state.hub.port_status().bits().to_le_bytes().to_vec())
            }
            HubRequest::SetPortFeature { port, feature } => {
                check_port(port)?;
                match feature {
                    PortFeature::Power => state.hub.power(true),
                    PortFeature::Reset => {
                        if state.exiting {
                            log::warn!("[CANINOS-HCD] port reset refused, controller is exiting");
                            return Err(HcdError::NotPermitted);
                        }
                        self.regs.write8(self.map.hcportctrl, bits::HCPORTCTRL_RESET | bits::HCPORTCTRL_RESET_TIME);
                        state.hub.reset_started();
                        log::debug!("[CANINOS-HCD] port reset started");
                    }
                    PortFeature::Suspend => {
                        self.regs.clear_bits8(self.map.otgctrl, bits::OTGCTRL_BUSREQ);
                        state.hub.suspend();
                    }
                    _ => return Err(HcdError::InvalidRequest),
                }
                Ok(Vec::new())
            }
            HubRequest::ClearPortFeature { port, feature } => {
                check_port(port)?;
                match feature {
                    PortFeature::Power => state.hub.power(false),
                    PortFeature::Enable => state.hub.disable(),
                    PortFeature::Suspend => {
                        self.regs.set_bits8(self.map.otgctrl, bits::OTGCTRL_BUSREQ);
                        state.hub.resume();
                    }
                    PortFeature::CConnection
                    | PortFeature::CEnable
                    | PortFeature::CSuspend
                    | PortFeature::COverCurrent
                    | PortFeature::CReset => {
                        if let Some(change) = feature.status_bit() {
                            state.hub.clear_change(change);
                        }
                    }
                    _ => return Err(HcdError::InvalidRequest),
                }
                Ok(Vec::new())
            }
        }
    }

    pub fn bus_suspend(&self) -> Result<(), HcdError> {
        let mut state = self.state.lock();
        self.regs.clear_bits8(self.map.otgctrl, bits::OTGCTRL_BUSREQ);
        state.hub.suspend();
        log::debug!("[CANINOS-HCD] bus suspended");
        Ok(())
    }

    pub fn bus_resume(&self) -> Result<(), HcdError> {
        let mut state = self.state.lock();
        if state.exiting {
            return Err(HcdError::ControllerExiting);
        }
        self.regs.set_bits8(self.map.otgctrl, bits::OTGCTRL_BUSREQ);
        state.hub.resume();
        log::debug!("[CANINOS-HCD] bus resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_lifecycle() {
        let mut hub = RootHub::new();
        assert_eq!(hub.status_data(), None);
        hub.power(true);
        assert_eq!(hub.state(), RhState::Powered);
        hub.connect();
        assert_eq!(hub.state(), RhState::Attached);
        assert_eq!(hub.status_data(), Some(0x02));
        hub.clear_change(PortStatus::C_CONNECTION);
        assert_eq!(hub.status_data(), None);

        hub.reset_started();
        assert!(hub.port_status().contains(PortStatus::RESET));
        hub.bus_reset_done(Speed::High);
        assert_eq!(hub.state(), RhState::Enabled);
        let status = hub.port_status();
        assert!(status.contains(PortStatus::ENABLE | PortStatus::HIGH_SPEED | PortStatus::C_RESET));
        assert!(!status.contains(PortStatus::RESET));

        hub.suspend();
        assert_eq!(hub.state(), RhState::Suspended);
        hub.resume();
        assert!(hub.port_status().contains(PortStatus::C_SUSPEND));

        hub.disconnect();
        assert_eq!(hub.state(), RhState::NotAttached);
        let status = hub.port_status();
        assert!(!status.intersects(PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::HIGH_SPEED));
        assert!(status.contains(PortStatus::C_CONNECTION | PortStatus::C_ENABLE));
    }

    #[test]
    fn reset_without_a_device_stays_in_reset() {
        let mut hub = RootHub::new();
        hub.power(true);
        hub.reset_started();
        hub.bus_reset_done(Speed::Full);
        assert_eq!(hub.state(), RhState::Reset);
        assert!(!hub.port_status().contains(PortStatus::ENABLE));
    }

    #[test]
    fn descriptor_layout() {
        let bytes = ROOT_HUB_DESCRIPTOR.as_bytes();
        assert_eq!(bytes, [9, 0x29, 1, 0x09, 0x00, 1, 0, 0x00, 0xff]);
    }
}
