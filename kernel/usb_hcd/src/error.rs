/// Errors returned synchronously by host controller operations.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum HcdError {
    /// No free endpoint index or no room left in the controller FIFO
    ResourceExhausted,
    /// A descriptor ring has no free slot
    RingFull,
    /// A bounded poll on a hardware register expired
    HardwareTimeout,
    /// The device is no longer attached
    Disconnected,
    /// The controller is shutting down and accepts no new work
    ControllerExiting,
    /// The URB or endpoint is unknown to the controller
    NotFound,
    /// The operation is not allowed in the current state
    NotPermitted,
    /// A coherent DMA allocation failed
    OutOfMemory,
    /// The URB was unlinked before the controller could accept it
    AlreadyUnlinked,
    /// The request is malformed or unsupported
    InvalidRequest,
    /// The transfer needs more descriptors than the ring holds
    TransferTooLarge,
    /// The resource is in use
    Busy,
}

impl HcdError {
    /// The negative errno the generic host stack expects for this error.
    pub fn errno(self) -> i32 {
        match self {
            HcdError::ResourceExhausted => -28,
            HcdError::RingFull => -11,
            HcdError::HardwareTimeout => -110,
            HcdError::Disconnected => -19,
            HcdError::ControllerExiting => -108,
            HcdError::NotFound => -43,
            HcdError::NotPermitted => -1,
            HcdError::OutOfMemory => -12,
            HcdError::AlreadyUnlinked => -1,
            HcdError::InvalidRequest => -32,
            HcdError::TransferTooLarge => -27,
            HcdError::Busy => -16,
        }
    }
}

impl From<HcdError> for &'static str {
    fn from(error: HcdError) -> Self {
        match error {
            HcdError::ResourceExhausted => "no free endpoint or FIFO space",
            HcdError::RingFull => "descriptor ring is full",
            HcdError::HardwareTimeout => "timed out waiting for the controller",
            HcdError::Disconnected => "device is not attached",
            HcdError::ControllerExiting => "controller is shutting down",
            HcdError::NotFound => "URB or endpoint not found",
            HcdError::NotPermitted => "operation not permitted in this state",
            HcdError::OutOfMemory => "DMA allocation failed",
            HcdError::AlreadyUnlinked => "URB was unlinked before submission",
            HcdError::InvalidRequest => "invalid or unsupported request",
            HcdError::TransferTooLarge => "transfer exceeds the descriptor ring",
            HcdError::Busy => "resource is busy",
        }
    }
}

impl core::fmt::Display for HcdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str((*self).into())
    }
}

/// Bus-level failures reported by the controller for a transaction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProtocolError {
    /// The device answered with STALL
    Stall,
    /// No handshake arrived in time
    Timeout,
    /// CRC, data toggle or PID check failed
    CrcOrToggleOrPid,
    /// The device sent more data than requested
    Overrun,
    /// The host could not supply data fast enough
    Underrun,
}

/// The reason a URB did not complete successfully.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum UrbError {
    Protocol(ProtocolError),
    /// A short packet ended an IN transfer that forbids them
    ShortTransfer,
    /// The controller stopped responding during the transfer
    HardwareTimeout,
    /// The device went away
    NoDevice,
    /// The controller is being torn down
    Shutdown,
    /// The URB was cancelled asynchronously, or the bus was reset under it
    ConnectionReset,
    /// The URB was cancelled synchronously
    Unlinked,
}

impl UrbError {
    /// The negative errno reported to the completion callback.
    pub fn errno(self) -> i32 {
        match self {
            UrbError::Protocol(ProtocolError::Stall) => -32,
            UrbError::Protocol(ProtocolError::Timeout) => -62,
            UrbError::Protocol(ProtocolError::CrcOrToggleOrPid) => -84,
            UrbError::Protocol(ProtocolError::Overrun) => -75,
            UrbError::Protocol(ProtocolError::Underrun) => -63,
            UrbError::ShortTransfer => -121,
            UrbError::HardwareTimeout => -110,
            UrbError::NoDevice => -19,
            UrbError::Shutdown => -108,
            UrbError::ConnectionReset => -104,
            UrbError::Unlinked => -2,
        }
    }
}

impl From<ProtocolError> for UrbError {
    fn from(error: ProtocolError) -> Self {
        UrbError::Protocol(error)
    }
}

impl core::fmt::Display for UrbError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UrbError::Protocol(p) => write!(f, "protocol error: {:?}", p),
            UrbError::ShortTransfer => f.write_str("short packet on a SHORT_NOT_OK transfer"),
            UrbError::HardwareTimeout => f.write_str("controller timed out"),
            UrbError::NoDevice => f.write_str("no device"),
            UrbError::Shutdown => f.write_str("host controller shut down"),
            UrbError::ConnectionReset => f.write_str("connection reset"),
            UrbError::Unlinked => f.write_str("unlinked"),
        }
    }
}

/// The final status handed to a completion callback.
pub type UrbStatus = Result<(), UrbError>;

/// Converts a final status into the errno convention (0 on success).
pub fn status_errno(status: UrbStatus) -> i32 {
    match status {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}
