//! MeshCoP protocol numbers: TLV types, URI paths and the State TLV.

/// Length of a PSKc.
pub const PSKC_LEN: usize = 16;

/// Longest PSKd a joiner may use.
pub const PSKD_MAX_LEN: usize = 32;

/// Shortest PSKd a joiner may use.
pub const PSKD_MIN_LEN: usize = 6;

/// Length of the key-encryption key exported by a finished handshake.
pub const KEK_LEN: usize = 32;

/// Length of an EUI-64 and of a Joiner IID.
pub const EUI64_LEN: usize = 8;

/// MeshCoP TLV types used by the commissioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    SteeringData,
    CommissionerId,
    CommissionerSessionId,
    State,
    JoinerDtlsEncapsulation,
    JoinerUdpPort,
    JoinerIid,
    JoinerRouterLocator,
    JoinerRouterKek,
    UdpEncapsulation,
    Ipv6Address,
    Unknown(u8),
}

impl TlvType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            8 => TlvType::SteeringData,
            10 => TlvType::CommissionerId,
            11 => TlvType::CommissionerSessionId,
            16 => TlvType::State,
            17 => TlvType::JoinerDtlsEncapsulation,
            18 => TlvType::JoinerUdpPort,
            19 => TlvType::JoinerIid,
            20 => TlvType::JoinerRouterLocator,
            21 => TlvType::JoinerRouterKek,
            48 => TlvType::UdpEncapsulation,
            49 => TlvType::Ipv6Address,
            _ => TlvType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            TlvType::SteeringData => 8,
            TlvType::CommissionerId => 10,
            TlvType::CommissionerSessionId => 11,
            TlvType::State => 16,
            TlvType::JoinerDtlsEncapsulation => 17,
            TlvType::JoinerUdpPort => 18,
            TlvType::JoinerIid => 19,
            TlvType::JoinerRouterLocator => 20,
            TlvType::JoinerRouterKek => 21,
            TlvType::UdpEncapsulation => 48,
            TlvType::Ipv6Address => 49,
            TlvType::Unknown(value) => *value,
        }
    }
}

impl From<TlvType> for u8 {
    fn from(value: TlvType) -> Self {
        value.as_u8()
    }
}

/// Value carried in the State TLV on the wire.
///
/// Distinct from the commissioner's own session state; see
/// [`CommissionerState`](crate::commissioner::CommissionerState) for the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    Pending,
    Accepted,
    Rejected,
}

impl WireState {
    /// Decode a State TLV value.
    ///
    /// Rejection is `-1` (0xFF). Some agents send `2`, which is read as a
    /// rejection as well.
    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            0 => Some(WireState::Pending),
            1 => Some(WireState::Accepted),
            -1 | 2 => Some(WireState::Rejected),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> i8 {
        match self {
            WireState::Pending => 0,
            WireState::Accepted => 1,
            WireState::Rejected => -1,
        }
    }
}

/// CoAP resource paths.
pub mod uri {
    pub const PETITION: &str = "c/cp";
    pub const COMMISSIONER_SET: &str = "c/cs";
    pub const KEEP_ALIVE: &str = "c/ca";
    pub const RELAY_TX: &str = "c/tx";
    pub const RELAY_RX: &str = "c/rx";
    pub const JOINER_FINALIZE: &str = "c/jf";
    pub const JOINER_ENTRUST: &str = "c/je";
    pub const COMMISSIONER_GET: &str = "c/cg";
}
