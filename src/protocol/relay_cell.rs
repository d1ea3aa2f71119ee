//! RELAY cell payloads
//!
//! The 509-byte payload of a RELAY (or RELAY_EARLY) cell carries its own
//! header: command, recognized, stream id, running digest and length. This
//! module packs and unpacks that header plus the payload bodies the engine
//! uses: EXTEND2/EXTENDED2, TRUNCATE, BEGIN/CONNECTED/END and the raw DATA
//! body. Hidden-service command bodies live in [`super::hs_cell`].

use crate::error::{Result, TorError};
use std::net::Ipv4Addr;

use super::cell::Cell;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
    /// ESTABLISH_INTRO - register an introduction point
    EstablishIntro = 32,
    /// ESTABLISH_RENDEZVOUS - client side, unused by a service
    EstablishRendezvous = 33,
    /// INTRODUCE1 - client -> intro point
    Introduce1 = 34,
    /// INTRODUCE2 - intro point -> service
    Introduce2 = 35,
    /// RENDEZVOUS1 - service -> rendezvous point
    Rendezvous1 = 36,
    /// RENDEZVOUS2 - rendezvous point -> client
    Rendezvous2 = 37,
    /// INTRO_ESTABLISHED - intro point ack
    IntroEstablished = 38,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point ack
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - intro point -> client
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// RELAY_END reason codes (tor-spec 6.3)
pub const END_REASON_DONE: u8 = 6;
pub const END_REASON_EXITPOLICY: u8 = 4;

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for cells we originate)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level commands)
    pub stream_id: u16,

    /// Digest (4 bytes of the running SHA; 0 until sealed)
    pub digest: [u8; 4],

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Relay payload header size
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data size in a relay cell
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - Self::HEADER_SIZE;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= Self::MAX_DATA_SIZE);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize into a full 509-byte cell payload, digest field zeroed
    /// unless previously set. Padding bytes are zero; the running digest
    /// covers the entire padded payload.
    pub fn to_payload(&self) -> Result<[u8; Cell::PAYLOAD_SIZE]> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::Protocol("Relay cell data too long".into()));
        }

        let mut buf = [0u8; Cell::PAYLOAD_SIZE];
        buf[0] = self.command as u8;
        buf[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[11..11 + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse a relay cell from a decrypted 509-byte payload
    pub fn from_payload(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(TorError::Protocol("Relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0])
            .ok_or_else(|| TorError::Protocol(format!("Unknown relay command: {}", data[0])))?;

        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]) as usize;

        if Self::HEADER_SIZE + length > data.len() {
            return Err(TorError::Protocol("Relay cell data truncated".into()));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: data[Self::HEADER_SIZE..Self::HEADER_SIZE + length].to_vec(),
        })
    }
}

/// Link specifier (tor-spec 5.1.2), used in EXTEND2 and in hidden-service
/// introduction payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    /// TLS-over-TCP, IPv4 (type 0)
    Ipv4(Ipv4Addr, u16),
    /// Legacy RSA identity (type 2)
    LegacyId([u8; 20]),
    /// Anything else, carried opaquely
    Other { ls_type: u8, data: Vec<u8> },
}

impl LinkSpecifier {
    pub const TYPE_IPV4: u8 = 0;
    pub const TYPE_LEGACY_ID: u8 = 2;

    fn pack_into(&self, buf: &mut Vec<u8>) {
        match self {
            LinkSpecifier::Ipv4(addr, port) => {
                buf.push(Self::TYPE_IPV4);
                buf.push(6);
                buf.extend_from_slice(&addr.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::LegacyId(id) => {
                buf.push(Self::TYPE_LEGACY_ID);
                buf.push(20);
                buf.extend_from_slice(id);
            }
            LinkSpecifier::Other { ls_type, data } => {
                buf.push(*ls_type);
                buf.push(data.len() as u8);
                buf.extend_from_slice(data);
            }
        }
    }

    /// Pack a specifier list with its leading count byte.
    pub fn pack_list(specs: &[LinkSpecifier]) -> Vec<u8> {
        let mut buf = vec![specs.len() as u8];
        for spec in specs {
            spec.pack_into(&mut buf);
        }
        buf
    }

    /// Parse a count-prefixed specifier list; returns the specifiers and
    /// the number of bytes consumed.
    pub fn parse_list(data: &[u8]) -> Result<(Vec<LinkSpecifier>, usize)> {
        if data.is_empty() {
            return Err(TorError::Protocol("Empty link specifier list".into()));
        }
        let count = data[0] as usize;
        let mut specs = Vec::with_capacity(count);
        let mut pos = 1;

        for _ in 0..count {
            if pos + 2 > data.len() {
                return Err(TorError::Protocol("Link specifier truncated".into()));
            }
            let ls_type = data[pos];
            let ls_len = data[pos + 1] as usize;
            pos += 2;
            if pos + ls_len > data.len() {
                return Err(TorError::Protocol("Link specifier truncated".into()));
            }
            let body = &data[pos..pos + ls_len];
            pos += ls_len;

            let spec = match (ls_type, ls_len) {
                (Self::TYPE_IPV4, 6) => LinkSpecifier::Ipv4(
                    Ipv4Addr::new(body[0], body[1], body[2], body[3]),
                    u16::from_be_bytes([body[4], body[5]]),
                ),
                (Self::TYPE_LEGACY_ID, 20) => {
                    let mut id = [0u8; 20];
                    id.copy_from_slice(body);
                    LinkSpecifier::LegacyId(id)
                }
                _ => LinkSpecifier::Other {
                    ls_type,
                    data: body.to_vec(),
                },
            };
            specs.push(spec);
        }

        Ok((specs, pos))
    }
}

/// ntor handshake type for CREATE2/EXTEND2
pub const HANDSHAKE_TYPE_NTOR: u16 = 2;

/// EXTEND2 body: link specifiers plus the ntor handshake blob.
pub fn pack_extend2(specs: &[LinkSpecifier], handshake_data: &[u8]) -> Vec<u8> {
    let mut buf = LinkSpecifier::pack_list(specs);
    buf.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
    buf.extend_from_slice(&(handshake_data.len() as u16).to_be_bytes());
    buf.extend_from_slice(handshake_data);
    buf
}

/// EXTENDED2 (and CREATED2) body: 2-byte length plus the server handshake.
pub fn parse_handshake_reply(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 2 {
        return Err(TorError::Protocol("Handshake reply too short".into()));
    }
    let hlen = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + hlen {
        return Err(TorError::Protocol("Handshake reply truncated".into()));
    }
    Ok(&data[2..2 + hlen])
}

/// Parsed RELAY_BEGIN body: "addr:port\0" plus 4 flag bytes.
#[derive(Debug, Clone)]
pub struct BeginPayload {
    pub address: String,
    pub port: u16,
}

impl BeginPayload {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| TorError::Protocol("BEGIN address not terminated".into()))?;
        let addrport = std::str::from_utf8(&data[..nul])
            .map_err(|_| TorError::Protocol("BEGIN address not UTF-8".into()))?;
        let (address, port) = addrport
            .rsplit_once(':')
            .ok_or_else(|| TorError::Protocol("BEGIN address missing port".into()))?;
        let port = port
            .parse()
            .map_err(|_| TorError::Protocol("BEGIN port invalid".into()))?;
        Ok(Self {
            address: address.to_string(),
            port,
        })
    }
}

/// RELAY_CONNECTED body for an IPv4 peer: address plus TTL.
pub fn pack_connected(addr: Ipv4Addr, ttl: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&addr.octets());
    buf.extend_from_slice(&ttl.to_be_bytes());
    buf
}
