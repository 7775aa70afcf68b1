//! Hub class requests as they reach a root hub.

use bitflags::bitflags;
use crate::{HcdError, RawRequest};

bitflags! {
    /// `wPortStatus` in the low half, `wPortChange` in the high half.
    pub struct PortStatus: u32 {
        const CONNECTION   = 1 << 0;
        const ENABLE       = 1 << 1;
        const SUSPEND      = 1 << 2;
        const OVERCURRENT  = 1 << 3;
        const RESET        = 1 << 4;
        const POWER        = 1 << 8;
        const LOW_SPEED    = 1 << 9;
        const HIGH_SPEED   = 1 << 10;
        const C_CONNECTION = 1 << 16;
        const C_ENABLE     = 1 << 17;
        const C_SUSPEND    = 1 << 18;
        const C_OVERCURRENT = 1 << 19;
        const C_RESET      = 1 << 20;
    }
}

impl PortStatus {
    /// All change bits.
    pub fn changes(self) -> PortStatus {
        self & (PortStatus::C_CONNECTION
            | PortStatus::C_ENABLE
            | PortStatus::C_SUSPEND
            | PortStatus::C_OVERCURRENT
            | PortStatus::C_RESET)
    }
}

/// Port feature selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Connection,
    Enable,
    Suspend,
    OverCurrent,
    Reset,
    Power,
    LowSpeed,
    CConnection,
    CEnable,
    CSuspend,
    COverCurrent,
    CReset,
    Test,
    Indicator,
}

impl TryFrom<u16> for PortFeature {
    type Error = HcdError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PortFeature::Connection,
            1 => PortFeature::Enable,
            2 => PortFeature::Suspend,
            3 => PortFeature::OverCurrent,
            4 => PortFeature::Reset,
            8 => PortFeature::Power,
            9 => PortFeature::LowSpeed,
            16 => PortFeature::CConnection,
            17 => PortFeature::CEnable,
            18 => PortFeature::CSuspend,
            19 => PortFeature::COverCurrent,
            20 => PortFeature::CReset,
            21 => PortFeature::Test,
            22 => PortFeature::Indicator,
            _ => return Err(HcdError::InvalidRequest),
        })
    }
}

impl PortFeature {
    /// The status bit this feature sets or clears, if it maps onto one.
    pub fn status_bit(self) -> Option<PortStatus> {
        Some(match self {
            PortFeature::Connection => PortStatus::CONNECTION,
            PortFeature::Enable => PortStatus::ENABLE,
            PortFeature::Suspend => PortStatus::SUSPEND,
            PortFeature::OverCurrent => PortStatus::OVERCURRENT,
            PortFeature::Reset => PortStatus::RESET,
            PortFeature::Power => PortStatus::POWER,
            PortFeature::LowSpeed => PortStatus::LOW_SPEED,
            PortFeature::CConnection => PortStatus::C_CONNECTION,
            PortFeature::CEnable => PortStatus::C_ENABLE,
            PortFeature::CSuspend => PortStatus::C_SUSPEND,
            PortFeature::COverCurrent => PortStatus::C_OVERCURRENT,
            PortFeature::CReset => PortStatus::C_RESET,
            PortFeature::Test | PortFeature::Indicator => return None,
        })
    }
}

mod type_req {
    pub const CLEAR_HUB_FEATURE: u16 = 0x2001;
    pub const CLEAR_PORT_FEATURE: u16 = 0x2301;
    pub const GET_HUB_DESCRIPTOR: u16 = 0xa006;
    pub const GET_HUB_STATUS: u16 = 0xa000;
    pub const GET_PORT_STATUS: u16 = 0xa300;
    pub const SET_HUB_FEATURE: u16 = 0x2003;
    pub const SET_PORT_FEATURE: u16 = 0x2303;
}

/// A decoded hub class request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubRequest {
    ClearHubFeature(u16),
    SetHubFeature(u16),
    ClearPortFeature { port: u16, feature: PortFeature },
    SetPortFeature { port: u16, feature: PortFeature },
    GetHubDescriptor { len: u16 },
    GetHubStatus,
    GetPortStatus { port: u16 },
}

impl HubRequest {
    pub fn from_raw(req: RawRequest) -> Result<Self, HcdError> {
        let type_req = ((req.request_type_byte() as u16) << 8) | req.request_name() as u16;
        let port = req.index() & 0xff;
        Ok(match type_req {
            type_req::CLEAR_HUB_FEATURE => HubRequest::ClearHubFeature(req.value()),
            type_req::SET_HUB_FEATURE => HubRequest::SetHubFeature(req.value()),
            type_req::CLEAR_PORT_FEATURE => HubRequest::ClearPortFeature {
                port,
                feature: PortFeature::try_from(req.value())?,
            },
            type_req::SET_PORT_FEATURE => HubRequest::SetPortFeature {
                port,
                feature: PortFeature::try_from(req.value())?,
            },
            type_req::GET_HUB_DESCRIPTOR => HubRequest::GetHubDescriptor { len: req.len() },
            type_req::GET_HUB_STATUS => HubRequest::GetHubStatus,
            type_req::GET_PORT_STATUS => HubRequest::GetPortStatus { port },
            _ => {
                log::debug!("unsupported hub request {:#06x}", type_req);
                return Err(HcdError::InvalidRequest);
            }
        })
    }
}
