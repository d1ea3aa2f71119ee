//! Onion circuits
//!
//! Owns one TLS link and the ordered chain of hops built over it: the link
//! handshake, CREATE2/EXTEND2 ntor exchanges, per-hop crypto state, the
//! RELAY send/receive paths, truncation and teardown.
//!
//! A circuit is driven synchronously while it is being built (the builder
//! reads replies directly off the link); once handed to the core loop its
//! read half moves into a reader task and all further cells arrive through
//! the core queue.

use crate::directory::OnionRelay;
use crate::error::{Result, TorError};
use crate::hs::intro::IntroCrypto;
use crate::protocol::cell::{Cell, CellCommand, CircIdLen};
use crate::protocol::handshake::{self, AuthenticateInputs, LinkAuthKeys};
use crate::protocol::ntor::{parse_server_handshake, NtorHandshake};
use crate::protocol::relay_cell::{
    pack_extend2, parse_handshake_reply, LinkSpecifier, RelayCell, RelayCommand,
    HANDSHAKE_TYPE_NTOR,
};
use crate::protocol::relay_crypto::{
    open_backward, seal_forward, seal_forward_hs, HsCrypto, RecognizedLayer, RelayCrypto,
};
use crate::transport::BoxTransport;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use x25519_dalek::PublicKey;

/// Per-hop build timeout.
pub const BUILD_HOP_TIMEOUT: Duration = Duration::from_secs(30);

/// RELAY_EARLY budget per circuit (tor-spec 5.6).
pub const MAX_RELAY_EARLY: u8 = 8;

/// Keepalive period for idle circuits.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 60;

/// Circuit lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    New,
    Building,
    Standby,
    IntroPoint,
    Rendezvous,
    HsDir,
    DirConnect,
    Truncated,
    Destroyed,
}

/// Allocates originator circuit ids: never zero, MSB always set.
#[derive(Default)]
pub struct CircIdAllocator {
    next: u32,
}

impl CircIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> u32 {
        self.next = self.next.wrapping_add(1) & 0x7FFF_FFFF;
        if self.next == 0 {
            self.next = 1;
        }
        0x8000_0000 | self.next
    }
}

/// One hop: the relay and our crypto state with it.
pub struct CircuitHop {
    pub relay: OnionRelay,
    pub crypto: RelayCrypto,
}

/// Read one complete cell off a link.
pub async fn read_raw_cell<R: AsyncRead + Unpin>(
    reader: &mut R,
    circ_id_len: CircIdLen,
) -> Result<Cell> {
    let id_width = circ_id_len.width();
    let mut header = [0u8; 5];
    reader.read_exact(&mut header[..id_width + 1]).await?;

    let command_byte = header[id_width];
    let variable = CellCommand::from_u8(command_byte)
        .map(|c| c.is_variable_length())
        .unwrap_or(false);

    let mut wire = header[..id_width + 1].to_vec();
    if variable {
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await?;
        wire.extend_from_slice(&len_buf);
        let length = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        wire.extend_from_slice(&body);
    } else {
        let mut body = vec![0u8; Cell::PAYLOAD_SIZE];
        reader.read_exact(&mut body).await?;
        wire.extend_from_slice(&body);
    }

    Cell::from_bytes(&wire, circ_id_len)
}

/// An originator circuit over one TLS link.
pub struct OnionCircuit {
    pub circ_id: u32,
    pub status: CircuitStatus,
    hops: Vec<CircuitHop>,
    reader: Option<ReadHalf<BoxTransport>>,
    writer: WriteHalf<BoxTransport>,
    relay_early_remaining: u8,
    /// Introduction-point key material (intro circuits only).
    pub intro: Option<IntroCrypto>,
    /// Rendezvous end-to-end layer (rendezvous circuits only).
    pub hs: Option<HsCrypto>,
}

impl OnionCircuit {
    /// Run the link handshake on a fresh transport and wrap it as a
    /// zero-hop circuit.
    ///
    /// VERSIONS is exchanged with the legacy 2-byte circuit id; everything
    /// after settles on protocol v4. CERTS is verified against the TLS
    /// peer certificate; when the transport surfaces TLS session secrets
    /// we answer the AUTH_CHALLENGE with an AUTH0001 AUTHENTICATE,
    /// otherwise we proceed unauthenticated. NETINFO echoes the peer's
    /// observed address back.
    pub async fn open(circ_id: u32, transport: BoxTransport, now_unix: u64) -> Result<Self> {
        let peer_cert_der = transport
            .peer_cert_der()
            .ok_or_else(|| TorError::Tls("transport has no peer certificate".into()))?;
        let auth_material = transport.auth_material();

        let (mut reader, mut writer) = tokio::io::split(transport);

        let mut client_log = Sha256::new();
        let mut server_log = Sha256::new();

        // -> VERSIONS (legacy circ id width)
        let versions = Cell::new(
            0,
            CellCommand::Versions,
            handshake::pack_versions(&handshake::SUPPORTED_VERSIONS),
        );
        let wire = versions.to_bytes(CircIdLen::Legacy)?;
        client_log.update(&wire);
        writer.write_all(&wire).await?;

        // <- VERSIONS
        let cell = recv_handshake_cell(&mut reader, CircIdLen::Legacy, Some(&mut server_log)).await?;
        expect_command(&cell, CellCommand::Versions)?;
        let version = handshake::negotiate_version(&cell.payload)?;
        log::debug!("link protocol v{}", version);

        // <- CERTS
        let cell = recv_handshake_cell(&mut reader, CircIdLen::Full, Some(&mut server_log)).await?;
        expect_command(&cell, CellCommand::Certs)?;
        let certs = handshake::parse_certs(&cell.payload)?;
        let responder = handshake::verify_certs(&certs, &peer_cert_der, now_unix)?;

        // <- AUTH_CHALLENGE
        let cell = recv_handshake_cell(&mut reader, CircIdLen::Full, Some(&mut server_log)).await?;
        expect_command(&cell, CellCommand::AuthChallenge)?;
        let offers_auth1 = handshake::parse_auth_challenge(&cell.payload)?;

        if let Some(tls) = auth_material.filter(|_| offers_auth1) {
            let keys = LinkAuthKeys::generate()?;

            // -> CERTS with our identity and auth certs
            let certs_cell = Cell::new(
                0,
                CellCommand::Certs,
                handshake::pack_certs(&keys.certs_entries()),
            );
            let wire = certs_cell.to_bytes(CircIdLen::Full)?;
            client_log.update(&wire);
            writer.write_all(&wire).await?;

            // -> AUTHENTICATE over the logs accumulated so far
            let inputs = AuthenticateInputs {
                client_log: client_log.clone().finalize().into(),
                server_log: server_log.clone().finalize().into(),
                peer_cert_der: &peer_cert_der,
                responder_id_key_der: &responder.rsa_identity_key_der,
                tls: &tls,
            };
            let auth_cell = Cell::new(
                0,
                CellCommand::Authenticate,
                handshake::build_authenticate(&keys, &inputs)?,
            );
            writer.write_all(&auth_cell.to_bytes(CircIdLen::Full)?).await?;
            log::debug!("link authenticated (AUTH0001)");
        }

        // <- NETINFO
        let cell = recv_handshake_cell(&mut reader, CircIdLen::Full, None).await?;
        expect_command(&cell, CellCommand::Netinfo)?;
        let netinfo = handshake::NetinfoPayload::parse(&cell.payload)?;

        // -> NETINFO echoing the peer's observed address
        let own = netinfo.other_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let peer = netinfo
            .my_addresses
            .first()
            .copied()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let reply = Cell::new(
            0,
            CellCommand::Netinfo,
            handshake::NetinfoPayload::pack(now_unix as u32, peer, own),
        );
        writer.write_all(&reply.to_bytes(CircIdLen::Full)?).await?;

        Ok(Self {
            circ_id,
            status: CircuitStatus::New,
            hops: Vec::new(),
            reader: Some(reader),
            writer,
            relay_early_remaining: MAX_RELAY_EARLY,
            intro: None,
            hs: None,
        })
    }

    pub fn built_length(&self) -> usize {
        self.hops.len()
    }

    pub fn hops(&self) -> &[CircuitHop] {
        &self.hops
    }

    pub fn guard_identity(&self) -> Option<[u8; 20]> {
        self.hops.first().map(|h| h.relay.identity)
    }

    /// The ntor nonce of the last hop, keying ESTABLISH_INTRO MACs.
    pub fn last_hop_nonce(&self) -> Option<[u8; 20]> {
        self.hops.last().map(|h| h.crypto.nonce)
    }

    /// Detach the read half for a reader task. Build operations must be
    /// finished first.
    pub fn take_reader(&mut self) -> Option<ReadHalf<BoxTransport>> {
        self.reader.take()
    }

    /// CREATE2 with the first hop.
    pub async fn create2(&mut self, relay: &OnionRelay) -> Result<()> {
        self.status = CircuitStatus::Building;
        let ntor = NtorHandshake::new();
        let onion_key = PublicKey::from(relay.ntor_onion_key);

        let handshake_data = ntor.handshake_data(&relay.identity, &onion_key);
        let mut payload = Vec::with_capacity(4 + handshake_data.len());
        payload.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
        payload.extend_from_slice(&(handshake_data.len() as u16).to_be_bytes());
        payload.extend_from_slice(&handshake_data);

        self.send_cell(Cell::new(self.circ_id, CellCommand::Create2, payload))
            .await?;

        let cell = self.recv_build_cell().await?;
        expect_command(&cell, CellCommand::Created2)?;
        let reply = parse_handshake_reply(&cell.payload)?;
        let (server_public, auth) = parse_server_handshake(reply)?;
        let keys = ntor.complete(&relay.identity, &onion_key, &server_public, &auth)?;

        self.hops.push(CircuitHop {
            relay: relay.clone(),
            crypto: RelayCrypto::new(&keys),
        });
        log::debug!(
            "circuit {:08x}: created through {}",
            self.circ_id,
            relay.address
        );
        Ok(())
    }

    /// EXTEND2 through the built prefix to one more relay.
    pub async fn extend2(&mut self, relay: &OnionRelay) -> Result<()> {
        if self.hops.is_empty() {
            return Err(TorError::InvalidState("extend on an unbuilt circuit".into()));
        }
        self.status = CircuitStatus::Building;

        let ntor = NtorHandshake::new();
        let onion_key = PublicKey::from(relay.ntor_onion_key);
        let specs = [
            LinkSpecifier::Ipv4(relay.address, relay.or_port),
            LinkSpecifier::LegacyId(relay.identity),
        ];
        let body = pack_extend2(&specs, &ntor.handshake_data(&relay.identity, &onion_key));

        let extend = RelayCell::new(RelayCommand::Extend2, 0, body);
        self.send_relay_cell(extend, true).await?;

        let (_, reply) = self.recv_relay_cell().await?;
        if reply.command != RelayCommand::Extended2 {
            return Err(TorError::UnexpectedCell {
                expected: "EXTENDED2".into(),
                got: format!("{:?}", reply.command),
            });
        }
        let server_handshake = parse_handshake_reply(&reply.data)?;
        let (server_public, auth) = parse_server_handshake(server_handshake)?;
        let keys = ntor.complete(&relay.identity, &onion_key, &server_public, &auth)?;

        self.hops.push(CircuitHop {
            relay: relay.clone(),
            crypto: RelayCrypto::new(&keys),
        });
        log::debug!(
            "circuit {:08x}: extended to {} ({} hops)",
            self.circ_id,
            relay.address,
            self.hops.len()
        );
        Ok(())
    }

    /// Build the whole path. Any failure destroys the circuit.
    pub async fn build(&mut self, path: &[OnionRelay]) -> Result<()> {
        let result = async {
            self.create2(&path[0]).await?;
            for relay in &path[1..] {
                self.extend2(relay).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.status = CircuitStatus::Standby;
                log::info!(
                    "🧅 circuit {:08x} ready with {} hops",
                    self.circ_id,
                    self.hops.len()
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("circuit {:08x} build failed: {}", self.circ_id, e);
                let _ = self.destroy(0).await;
                Err(e)
            }
        }
    }

    /// Truncate to `new_length` hops: drop the tail crypto, tell the new
    /// last hop, await RELAY_TRUNCATED.
    pub async fn truncate(&mut self, new_length: usize) -> Result<()> {
        if new_length == 0 || new_length > self.hops.len() {
            return Err(TorError::InvalidState("bad truncate length".into()));
        }
        if new_length == self.hops.len() {
            return Ok(());
        }

        // RelayCrypto zeroizes key material on drop.
        self.hops.truncate(new_length);

        let cell = RelayCell::new(RelayCommand::Truncate, 0, Vec::new());
        self.send_relay_cell(cell, false).await?;

        let (_, reply) = self.recv_relay_cell().await?;
        if reply.command != RelayCommand::Truncated {
            return Err(TorError::UnexpectedCell {
                expected: "TRUNCATED".into(),
                got: format!("{:?}", reply.command),
            });
        }
        self.status = CircuitStatus::Truncated;
        log::debug!(
            "circuit {:08x}: truncated to {} hops",
            self.circ_id,
            new_length
        );
        Ok(())
    }

    /// Send DESTROY and drop all key material.
    pub async fn destroy(&mut self, reason: u8) -> Result<()> {
        if self.status == CircuitStatus::Destroyed {
            return Ok(());
        }
        let _ = self
            .send_cell(Cell::destroy(self.circ_id, reason))
            .await;
        let _ = self.writer.shutdown().await;
        self.hops.clear();
        self.intro = None;
        self.hs = None;
        self.status = CircuitStatus::Destroyed;
        Ok(())
    }

    /// Keepalive PADDING on the link.
    pub async fn send_padding(&mut self) -> Result<()> {
        self.send_cell(Cell::padding(self.circ_id)).await
    }

    /// Seal and send one relay cell to the last hop. `early` selects
    /// RELAY_EARLY, spending its budget.
    pub async fn send_relay_cell(&mut self, cell: RelayCell, early: bool) -> Result<()> {
        if self.hops.is_empty() {
            return Err(TorError::InvalidState("relay cell on an unbuilt circuit".into()));
        }
        let mut payload = cell.to_payload()?;
        let mut hops: Vec<&mut RelayCrypto> =
            self.hops.iter_mut().map(|h| &mut h.crypto).collect();
        match self.hs.as_mut() {
            Some(hs) => seal_forward_hs(&mut hops, hs, &mut payload),
            None => seal_forward(&mut hops, &mut payload),
        }

        let command = if early {
            if self.relay_early_remaining == 0 {
                return Err(TorError::Protocol("RELAY_EARLY budget exhausted".into()));
            }
            self.relay_early_remaining -= 1;
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };

        self.send_cell(Cell::new(self.circ_id, command, payload.to_vec()))
            .await
    }

    /// Decrypt an inbound RELAY payload delivered by the reader task.
    pub fn unseal_relay_payload(
        &mut self,
        payload: &[u8],
    ) -> Result<(RecognizedLayer, RelayCell)> {
        if payload.len() != Cell::PAYLOAD_SIZE {
            return Err(TorError::Protocol("relay payload has wrong size".into()));
        }
        let mut buf = [0u8; Cell::PAYLOAD_SIZE];
        buf.copy_from_slice(payload);

        let mut hops: Vec<&mut RelayCrypto> =
            self.hops.iter_mut().map(|h| &mut h.crypto).collect();
        let layer = open_backward(&mut hops, self.hs.as_mut(), &mut buf)?;
        let cell = RelayCell::from_payload(&buf)?;
        Ok((layer, cell))
    }

    /// Receive and unseal the next relay cell (build-time flows only).
    pub async fn recv_relay_cell(&mut self) -> Result<(RecognizedLayer, RelayCell)> {
        loop {
            let cell = self.recv_build_cell().await?;
            match cell.command {
                CellCommand::Relay | CellCommand::RelayEarly => {
                    return self.unseal_relay_payload(&cell.payload);
                }
                CellCommand::Padding | CellCommand::Vpadding => continue,
                CellCommand::Destroy => {
                    let reason = cell.payload.first().copied().unwrap_or(0);
                    self.status = CircuitStatus::Destroyed;
                    return Err(TorError::CircuitDestroyed { reason });
                }
                other => {
                    return Err(TorError::UnexpectedCell {
                        expected: "RELAY".into(),
                        got: format!("{:?}", other),
                    })
                }
            }
        }
    }

    async fn recv_build_cell(&mut self) -> Result<Cell> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| TorError::InvalidState("circuit reader already detached".into()))?;
        let cell = timeout(BUILD_HOP_TIMEOUT, read_raw_cell(reader, CircIdLen::Full))
            .await
            .map_err(|_| TorError::Timeout)??;
        match cell.command {
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                self.status = CircuitStatus::Destroyed;
                Err(TorError::CircuitDestroyed { reason })
            }
            _ => Ok(cell),
        }
    }

    async fn send_cell(&mut self, cell: Cell) -> Result<()> {
        let wire = cell.to_bytes(CircIdLen::Full)?;
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn expect_command(cell: &Cell, expected: CellCommand) -> Result<()> {
    if cell.command == expected {
        Ok(())
    } else {
        Err(TorError::UnexpectedCell {
            expected: format!("{:?}", expected),
            got: format!("{:?}", cell.command),
        })
    }
}

async fn recv_handshake_cell(
    reader: &mut ReadHalf<BoxTransport>,
    circ_id_len: CircIdLen,
    log_into: Option<&mut Sha256>,
) -> Result<Cell> {
    let cell = timeout(BUILD_HOP_TIMEOUT, read_raw_cell(reader, circ_id_len))
        .await
        .map_err(|_| TorError::Timeout)??;
    if let Some(log) = log_into {
        log.update(&cell.to_bytes(circ_id_len)?);
    }
    Ok(cell)
}
