//! Tor cell protocol
//!
//! Implements the Tor cell format for communication with relays.
//! Cells are the basic unit of communication in the Tor protocol: fixed
//! 514-byte cells for most commands, variable-length cells for VERSIONS
//! and everything with command >= 128. Before the VERSIONS exchange the
//! circuit id field on the wire is 2 bytes; afterwards it is 4.

use crate::error::{Result, TorError};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for keepalive
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation (deprecated)
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created (deprecated)
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that may carry an EXTEND
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether this command uses the variable-length cell format
    /// (2-byte length prefix instead of padding to a fixed size).
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// Width of the circuit id field on the wire.
///
/// Link protocol v4 uses 4 bytes; the VERSIONS exchange itself still runs
/// with the legacy 2-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircIdLen {
    Legacy,
    Full,
}

impl CircIdLen {
    pub fn width(self) -> usize {
        match self {
            CircIdLen::Legacy => 2,
            CircIdLen::Full => 4,
        }
    }
}

/// Tor cell
#[derive(Debug, Clone)]
pub struct Cell {
    /// Circuit ID (4 bytes for v4+ protocol)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload (509 bytes for fixed-length cells, arbitrary for
    /// variable-length ones)
    pub payload: Vec<u8>,
}

impl Cell {
    /// Fixed cell size (514 bytes total: 4 circuit_id + 1 command + 509 payload)
    pub const SIZE: usize = 514;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Create a PADDING cell (keepalive)
    pub fn padding(circuit_id: u32) -> Self {
        Self::new(circuit_id, CellCommand::Padding, Vec::new())
    }

    /// Create a DESTROY cell with the given reason
    pub fn destroy(circuit_id: u32, reason: u8) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason])
    }

    /// Serialize cell to wire bytes
    pub fn to_bytes(&self, circ_id_len: CircIdLen) -> Result<Vec<u8>> {
        let variable = self.command.is_variable_length();
        let mut buf = Vec::with_capacity(if variable {
            circ_id_len.width() + 3 + self.payload.len()
        } else {
            circ_id_len.width() + 1 + Self::PAYLOAD_SIZE
        });

        match circ_id_len {
            CircIdLen::Legacy => buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes()),
            CircIdLen::Full => buf.extend_from_slice(&self.circuit_id.to_be_bytes()),
        }

        buf.push(self.command as u8);

        if variable {
            if self.payload.len() > u16::MAX as usize {
                return Err(TorError::Protocol("Variable cell payload too long".into()));
            }
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            if self.payload.len() > Self::PAYLOAD_SIZE {
                return Err(TorError::Protocol("Cell payload too long".into()));
            }
            buf.extend_from_slice(&self.payload);
            buf.resize(circ_id_len.width() + 1 + Self::PAYLOAD_SIZE, 0);
        }

        Ok(buf)
    }

    /// Parse a cell from a complete wire buffer.
    pub fn from_bytes(data: &[u8], circ_id_len: CircIdLen) -> Result<Self> {
        let id_width = circ_id_len.width();
        if data.len() < id_width + 1 {
            return Err(TorError::Protocol("Cell too short".into()));
        }

        let circuit_id = match circ_id_len {
            CircIdLen::Legacy => u16::from_be_bytes([data[0], data[1]]) as u32,
            CircIdLen::Full => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        };

        let command = CellCommand::from_u8(data[id_width])
            .ok_or_else(|| TorError::Protocol(format!("Unknown command: {}", data[id_width])))?;

        let payload = if command.is_variable_length() {
            if data.len() < id_width + 3 {
                return Err(TorError::Protocol("Variable cell header truncated".into()));
            }
            let length = u16::from_be_bytes([data[id_width + 1], data[id_width + 2]]) as usize;
            if data.len() < id_width + 3 + length {
                return Err(TorError::Protocol("Variable cell body truncated".into()));
            }
            data[id_width + 3..id_width + 3 + length].to_vec()
        } else {
            if data.len() < id_width + 1 + Self::PAYLOAD_SIZE {
                return Err(TorError::Protocol("Fixed cell truncated".into()));
            }
            data[id_width + 1..id_width + 1 + Self::PAYLOAD_SIZE].to_vec()
        };

        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }
}
