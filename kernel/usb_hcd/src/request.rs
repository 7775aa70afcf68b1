//! The 8-byte SETUP packet that opens every control transfer.

use bilge::prelude::*;

#[bitsize(64)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct RawRequest {
    pub recipient: RawRequestRecipient,
    pub req_type: RequestType,
    pub direction: Direction,

    pub request_name: u8,
    pub value: u16,
    pub index: u16,
    pub len: u16,
}

impl RawRequest {
    /// Decodes a SETUP packet as it appears on the wire.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self::from(u64::from_le_bytes(bytes))
    }

    /// Encodes this SETUP packet in wire order.
    pub fn to_bytes(self) -> [u8; 8] {
        u64::from(self).to_le_bytes()
    }

    /// The raw `bmRequestType` byte.
    pub fn request_type_byte(self) -> u8 {
        self.to_bytes()[0]
    }

    /// A standard GET_DESCRIPTOR request addressed to the device.
    pub fn get_descriptor(desc_type: u8, desc_index: u8, len: u16) -> Self {
        Self::new(
            RawRequestRecipient::Device,
            RequestType::Standard,
            Direction::In,
            std_req::GET_DESCRIPTOR,
            ((desc_type as u16) << 8) | desc_index as u16,
            0u16,
            len,
        )
    }

    /// A standard SET_ADDRESS request.
    pub fn set_address(address: u8) -> Self {
        Self::new(
            RawRequestRecipient::Device,
            RequestType::Standard,
            Direction::Out,
            std_req::SET_ADDRESS,
            address as u16,
            0u16,
            0u16,
        )
    }

    /// A standard SET_CONFIGURATION request.
    pub fn set_configuration(value: u8) -> Self {
        Self::new(
            RawRequestRecipient::Device,
            RequestType::Standard,
            Direction::Out,
            std_req::SET_CONFIGURATION,
            value as u16,
            0u16,
            0u16,
        )
    }
}

#[bitsize(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBits)]
pub enum Direction {
    /// Host to function
    Out = 0,
    /// Function to host
    In = 1,
}

#[bitsize(5)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBits)]
pub enum RawRequestRecipient {
    Device = 0x0,
    Interface = 0x1,
    Endpoint = 0x2,
    Other = 0x3,
    #[fallback]
    Reserved = 0x4,
}

#[bitsize(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBits)]
pub enum RequestType {
    Standard = 0x0,
    Class = 0x1,
    Vendor = 0x2,
    Reserved = 0x3,
}

pub mod std_req {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE_ALT_SETTING: u8 = 0x0a;
    pub const SET_INTERFACE_ALT_SETTING: u8 = 0x0b;
}

pub mod desc_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const HUB: u8 = 0x29;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_descriptor_wire_layout() {
        let req = RawRequest::get_descriptor(desc_type::DEVICE, 0, 18);
        assert_eq!(req.to_bytes(), [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(req.direction(), Direction::In);
        assert_eq!(req.request_type_byte(), 0x80);
    }

    #[test]
    fn decode_class_request() {
        // SetPortFeature(PORT_RESET) on port 1
        let req = RawRequest::from_bytes([0x23, 0x03, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(req.recipient(), RawRequestRecipient::Other);
        assert_eq!(req.req_type(), RequestType::Class);
        assert_eq!(req.direction(), Direction::Out);
        assert_eq!(req.request_name(), std_req::SET_FEATURE);
        assert_eq!(req.value(), 4);
        assert_eq!(req.index(), 1);
        assert_eq!(req.len(), 0);
    }
}
