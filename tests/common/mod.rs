//! Mock Tor network for integration tests
//!
//! A `MockDialer` hands out in-memory transports; each one is served by a
//! chain task that plays every relay on the path: it answers the link
//! handshake with real certificates, runs the server side of ntor for
//! CREATE2/EXTEND2, keeps per-hop relay crypto and services the relay
//! commands the engine uses (TRUNCATE, ESTABLISH_INTRO, BEGIN_DIR uploads,
//! DATA echo, RENDEZVOUS1 capture). Cells can also be injected backward
//! into a chain to simulate traffic arriving from the network.

#![allow(dead_code)]

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use microtor::circuit::read_raw_cell;
use microtor::directory::{
    ConsensusDocument, ConsensusRelay, Directory, MemoryBlockStore, NetworkConsensus, RelayFlags,
    ServerDescriptor,
};
use microtor::protocol::cell::{Cell, CellCommand, CircIdLen};
use microtor::protocol::handshake::{
    pack_certs, pack_versions, CertEntry, LinkAuthKeys, NetinfoPayload,
};
use microtor::protocol::relay_cell::{LinkSpecifier, RelayCell, RelayCommand};
use microtor::storage::MemoryBlobStore;
use microtor::transport::{BoxTransport, Dialer, LinkTransport, TlsAuthMaterial};
use microtor::{OnionRelay, Result};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// The fixed mock network: N relays with deterministic keys.
pub struct MockNetwork {
    pub consensus_relays: Vec<ConsensusRelay>,
    pub descriptors: HashMap<[u8; 20], ServerDescriptor>,
    pub ntor_secrets: HashMap<[u8; 20], [u8; 32]>,
    pub consensus: NetworkConsensus,
}

impl MockNetwork {
    pub fn new(relay_count: u8, now: u64) -> Self {
        let mut consensus_relays = Vec::new();
        let mut descriptors = HashMap::new();
        let mut ntor_secrets = HashMap::new();

        for seed in 1..=relay_count {
            let identity = [seed; 20];
            let ntor_seed = [seed | 0x40; 32];
            let ntor_public = PublicKey::from(&StaticSecret::from(ntor_seed)).to_bytes();

            consensus_relays.push(ConsensusRelay {
                nickname: format!("mock{}", seed),
                identity,
                digest: [seed; 20],
                address: Ipv4Addr::new(10, 0, 0, seed),
                or_port: 9001,
                dir_port: 9030,
                flags: RelayFlags {
                    bad_exit: false,
                    exit: false,
                    fast: true,
                    guard: true,
                    hs_dir: true,
                    running: true,
                    stable: true,
                    v2_dir: true,
                    valid: true,
                },
            });
            descriptors.insert(
                identity,
                ServerDescriptor {
                    ntor_onion_key: ntor_public,
                    master_key: Some([seed; 32]),
                },
            );
            ntor_secrets.insert(identity, ntor_seed);
        }

        let consensus = NetworkConsensus {
            method: 28,
            valid_after: now - 600,
            fresh_until: now + 3600,
            valid_until: now + 10800,
            hsdir_interval: 1440,
            hsdir_n_replicas: 2,
            hsdir_spread_store: 3,
            previous_shared_rand: [0x11; 32],
            shared_rand: [0x22; 32],
        };

        Self {
            consensus_relays,
            descriptors,
            ntor_secrets,
            consensus,
        }
    }

    /// A directory with this network's consensus installed.
    pub fn directory(&self) -> Directory<MemoryBlockStore> {
        let mut dir = Directory::new(
            "127.0.0.1:9030".parse().unwrap(),
            MemoryBlockStore::new(1024 * 256),
            Box::new(MemoryBlobStore::new()),
        )
        .unwrap();
        dir.install_consensus(
            ConsensusDocument {
                consensus: self.consensus.clone(),
                relays: self.consensus_relays.clone(),
            },
            &self.descriptors,
        )
        .unwrap();
        dir
    }

    /// The materialized relay records, for building paths by hand.
    pub fn onion_relay(&self, seed: u8) -> OnionRelay {
        let identity = [seed; 20];
        let descriptor = &self.descriptors[&identity];
        OnionRelay {
            identity,
            digest: [seed; 20],
            master_key: [seed; 32],
            ntor_onion_key: descriptor.ntor_onion_key,
            address: Ipv4Addr::new(10, 0, 0, seed),
            or_port: 9001,
            dir_port: 9030,
            hsdir: true,
            dir_cache: true,
            suitable: true,
            can_guard: true,
            can_exit: false,
            is_guard: false,
            id_hash: [0; 32],
            id_hash_previous: [0; 32],
        }
    }
}

/// Everything a chain observed, for test assertions.
#[derive(Default)]
pub struct ChainEvents {
    pub established_intro: bool,
    pub intro_auth_key: Option<[u8; 32]>,
    pub posted_descriptors: Vec<String>,
    pub rendezvous1: Vec<Vec<u8>>,
    pub recognized_hops: Vec<usize>,
    pub destroys: usize,
}

pub struct ChainHandle {
    pub inject: mpsc::UnboundedSender<RelayCell>,
    pub events: Arc<Mutex<ChainEvents>>,
}

/// In-memory transport backed by a duplex pipe.
pub struct MockTransport {
    inner: tokio::io::DuplexStream,
    peer_der: Vec<u8>,
    auth: Option<TlsAuthMaterial>,
}

impl LinkTransport for MockTransport {
    fn peer_cert_der(&self) -> Option<Vec<u8>> {
        Some(self.peer_der.clone())
    }

    fn auth_material(&self) -> Option<TlsAuthMaterial> {
        self.auth.clone()
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Hands out mock transports; one relay chain task per dial.
pub struct MockDialer {
    ntor_secrets: HashMap<[u8; 20], [u8; 32]>,
    link_keys: Arc<LinkAuthKeys>,
    pub chains: Arc<Mutex<Vec<ChainHandle>>>,
    pub echo_data: bool,
    pub with_auth_material: bool,
}

impl MockDialer {
    pub fn new(network: &MockNetwork) -> Self {
        Self {
            ntor_secrets: network.ntor_secrets.clone(),
            link_keys: Arc::new(LinkAuthKeys::generate().unwrap()),
            chains: Arc::new(Mutex::new(Vec::new())),
            echo_data: false,
            with_auth_material: false,
        }
    }

    pub fn chain_events(&self, index: usize) -> Arc<Mutex<ChainEvents>> {
        self.chains.lock().unwrap()[index].events.clone()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.lock().unwrap().len()
    }

    /// Find a chain that accepted an ESTABLISH_INTRO with this auth key.
    pub fn intro_chain_for(&self, auth_key: &[u8; 32]) -> Option<usize> {
        let chains = self.chains.lock().unwrap();
        chains
            .iter()
            .position(|c| c.events.lock().unwrap().intro_auth_key.as_ref() == Some(auth_key))
    }

    pub fn inject(&self, chain: usize, cell: RelayCell) {
        let chains = self.chains.lock().unwrap();
        chains[chain].inject.send(cell).unwrap();
    }

    /// All descriptors posted anywhere in this network.
    pub fn all_posted_descriptors(&self) -> Vec<String> {
        let chains = self.chains.lock().unwrap();
        chains
            .iter()
            .flat_map(|c| c.events.lock().unwrap().posted_descriptors.clone())
            .collect()
    }

    pub fn all_rendezvous1(&self) -> Vec<Vec<u8>> {
        let chains = self.chains.lock().unwrap();
        chains
            .iter()
            .flat_map(|c| c.events.lock().unwrap().rendezvous1.clone())
            .collect()
    }
}

impl Dialer for MockDialer {
    fn dial<'a>(
        &'a self,
        _addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<BoxTransport>> + Send + 'a>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(256 * 1024);
            let (inject_tx, inject_rx) = mpsc::unbounded_channel();
            let events = Arc::new(Mutex::new(ChainEvents::default()));

            tokio::spawn(chain_task(
                server,
                self.ntor_secrets.clone(),
                self.link_keys.clone(),
                events.clone(),
                inject_rx,
                self.echo_data,
            ));

            self.chains.lock().unwrap().push(ChainHandle {
                inject: inject_tx,
                events,
            });

            let auth = self.with_auth_material.then(|| TlsAuthMaterial {
                client_random: [1; 32],
                server_random: [2; 32],
                master_secret: vec![3; 48],
            });

            Ok(Box::new(MockTransport {
                inner: client,
                peer_der: self.link_keys.auth_cert_der.clone(),
                auth,
            }) as BoxTransport)
        })
    }
}

/// Relay-side per-hop state.
struct MockHop {
    forward_sha: Sha1,
    backward_sha: Sha1,
    aes_forward: Aes128Ctr,
    aes_backward: Aes128Ctr,
}

impl MockHop {
    fn from_seed(key_seed: &[u8; 32]) -> Self {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed).unwrap();
        let mut okm = [0u8; 92];
        hkdf.expand(M_EXPAND, &mut okm).unwrap();

        let mut forward_sha = Sha1::new();
        forward_sha.update(&okm[0..20]);
        let mut backward_sha = Sha1::new();
        backward_sha.update(&okm[20..40]);

        let mut forward_key = [0u8; 16];
        forward_key.copy_from_slice(&okm[40..56]);
        let mut backward_key = [0u8; 16];
        backward_key.copy_from_slice(&okm[56..72]);

        let zero_iv = [0u8; 16];
        Self {
            forward_sha,
            backward_sha,
            aes_forward: Aes128Ctr::new((&forward_key).into(), (&zero_iv).into()),
            aes_backward: Aes128Ctr::new((&backward_key).into(), (&zero_iv).into()),
        }
    }

    fn recognizes(&mut self, payload: &[u8; 509]) -> bool {
        if payload[1] != 0 || payload[2] != 0 {
            return false;
        }
        let mut spec = self.forward_sha.clone();
        spec.update(&payload[0..5]);
        spec.update([0u8; 4]);
        spec.update(&payload[9..]);
        let hash = spec.clone().finalize();
        if hash[..4] == payload[5..9] {
            self.forward_sha = spec;
            true
        } else {
            false
        }
    }
}

/// Server side of ntor: answer a CREATE2/EXTEND2 handshake blob.
fn ntor_server(handshake_data: &[u8], ntor_secrets: &HashMap<[u8; 20], [u8; 32]>) -> Option<(Vec<u8>, [u8; 32])> {
    if handshake_data.len() < 84 {
        return None;
    }
    let identity: [u8; 20] = handshake_data[0..20].try_into().unwrap();
    let onion_secret = StaticSecret::from(*ntor_secrets.get(&identity)?);
    let onion_public = PublicKey::from(&onion_secret);
    if handshake_data[20..52] != onion_public.to_bytes() {
        return None;
    }
    let client_public = PublicKey::from(
        <[u8; 32]>::try_from(&handshake_data[52..84]).unwrap(),
    );

    let server_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let server_public = PublicKey::from(&server_secret);

    let shared_xy = server_secret.diffie_hellman(&client_public);
    let shared_xb = onion_secret.diffie_hellman(&client_public);

    let mut secret_input = Vec::new();
    secret_input.extend_from_slice(shared_xy.as_bytes());
    secret_input.extend_from_slice(shared_xb.as_bytes());
    secret_input.extend_from_slice(&identity);
    secret_input.extend_from_slice(onion_public.as_bytes());
    secret_input.extend_from_slice(client_public.as_bytes());
    secret_input.extend_from_slice(server_public.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = hmac_sha256(T_KEY, &secret_input);
    let verify = hmac_sha256(T_VERIFY, &secret_input);

    let mut auth_input = Vec::new();
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(&identity);
    auth_input.extend_from_slice(onion_public.as_bytes());
    auth_input.extend_from_slice(server_public.as_bytes());
    auth_input.extend_from_slice(client_public.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");
    let auth = hmac_sha256(T_MAC, &auth_input);

    let mut reply = Vec::with_capacity(64);
    reply.extend_from_slice(server_public.as_bytes());
    reply.extend_from_slice(&auth);
    Some((reply, key_seed))
}

async fn send_cell<W: AsyncWrite + Unpin>(writer: &mut W, cell: Cell, id_len: CircIdLen) {
    let _ = writer.write_all(&cell.to_bytes(id_len).unwrap()).await;
    let _ = writer.flush().await;
}

/// Seal a relay cell backward from hop `from` and send it.
async fn send_backward<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hops: &mut [MockHop],
    from: usize,
    circ_id: u32,
    cell: RelayCell,
) {
    let mut payload = cell.to_payload().unwrap();
    hops[from].backward_sha.update(&payload[..]);
    let digest = hops[from].backward_sha.clone().finalize();
    payload[5..9].copy_from_slice(&digest[..4]);
    for hop in hops[..=from].iter_mut().rev() {
        hop.aes_backward.apply_keystream(&mut payload);
    }
    send_cell(
        writer,
        Cell::new(circ_id, CellCommand::Relay, payload.to_vec()),
        CircIdLen::Full,
    )
    .await;
}

struct DirStream {
    stream_id: u16,
    request: Vec<u8>,
}

async fn chain_task(
    stream: tokio::io::DuplexStream,
    ntor_secrets: HashMap<[u8; 20], [u8; 32]>,
    link_keys: Arc<LinkAuthKeys>,
    events: Arc<Mutex<ChainEvents>>,
    mut inject_rx: mpsc::UnboundedReceiver<RelayCell>,
    echo_data: bool,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // --- Link handshake, responder side ---
    let Ok(versions) = read_raw_cell(&mut reader, CircIdLen::Legacy).await else {
        return;
    };
    if versions.command != CellCommand::Versions {
        return;
    }
    send_cell(
        &mut writer,
        Cell::new(0, CellCommand::Versions, pack_versions(&[3, 4])),
        CircIdLen::Legacy,
    )
    .await;

    let certs = vec![
        CertEntry {
            cert_type: 1, // LINK_KEY: same key the "TLS" transport presented
            cert: link_keys.auth_cert_der.clone(),
        },
        CertEntry {
            cert_type: 2,
            cert: link_keys.identity_cert_der.clone(),
        },
    ];
    send_cell(
        &mut writer,
        Cell::new(0, CellCommand::Certs, pack_certs(&certs)),
        CircIdLen::Full,
    )
    .await;

    let mut challenge = vec![0u8; 32];
    challenge.extend_from_slice(&1u16.to_be_bytes());
    challenge.extend_from_slice(&1u16.to_be_bytes());
    send_cell(
        &mut writer,
        Cell::new(0, CellCommand::AuthChallenge, challenge),
        CircIdLen::Full,
    )
    .await;

    send_cell(
        &mut writer,
        Cell::new(
            0,
            CellCommand::Netinfo,
            NetinfoPayload::pack(0, Ipv4Addr::new(192, 0, 2, 99), Ipv4Addr::new(10, 0, 0, 1)),
        ),
        CircIdLen::Full,
    )
    .await;

    // Drain client CERTS/AUTHENTICATE until its NETINFO arrives.
    loop {
        match read_raw_cell(&mut reader, CircIdLen::Full).await {
            Ok(cell) if cell.command == CellCommand::Netinfo => break,
            Ok(_) => continue,
            Err(_) => return,
        }
    }

    // --- Circuit phase ---
    let mut hops: Vec<MockHop> = Vec::new();
    let mut circ_id = 0u32;
    let mut dir_stream: Option<DirStream> = None;

    loop {
        tokio::select! {
            cell = read_raw_cell(&mut reader, CircIdLen::Full) => {
                let Ok(cell) = cell else { return };
                match cell.command {
                    CellCommand::Padding => continue,
                    CellCommand::Destroy => {
                        events.lock().unwrap().destroys += 1;
                        return;
                    }
                    CellCommand::Create2 => {
                        circ_id = cell.circuit_id;
                        let hlen = u16::from_be_bytes([cell.payload[2], cell.payload[3]]) as usize;
                        let Some((reply, key_seed)) =
                            ntor_server(&cell.payload[4..4 + hlen], &ntor_secrets)
                        else {
                            return;
                        };
                        hops.push(MockHop::from_seed(&key_seed));
                        let mut payload = (reply.len() as u16).to_be_bytes().to_vec();
                        payload.extend_from_slice(&reply);
                        send_cell(
                            &mut writer,
                            Cell::new(circ_id, CellCommand::Created2, payload),
                            CircIdLen::Full,
                        )
                        .await;
                    }
                    CellCommand::Relay | CellCommand::RelayEarly => {
                        let mut payload: [u8; 509] = cell.payload.clone().try_into().unwrap();
                        let mut recognized_at = None;
                        for index in 0..hops.len() {
                            hops[index].aes_forward.apply_keystream(&mut payload);
                            if hops[index].recognizes(&payload) {
                                recognized_at = Some(index);
                                break;
                            }
                        }
                        let Some(at) = recognized_at else { continue };
                        events.lock().unwrap().recognized_hops.push(at);
                        let Ok(relay_cell) = RelayCell::from_payload(&payload) else {
                            continue;
                        };
                        handle_recognized(
                            &mut writer,
                            &mut hops,
                            at,
                            circ_id,
                            relay_cell,
                            &ntor_secrets,
                            &events,
                            &mut dir_stream,
                            echo_data,
                        )
                        .await;
                    }
                    _ => continue,
                }
            }
            injected = inject_rx.recv() => {
                let Some(cell) = injected else { return };
                let from = hops.len().saturating_sub(1);
                send_backward(&mut writer, &mut hops, from, circ_id, cell).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_recognized<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hops: &mut Vec<MockHop>,
    at: usize,
    circ_id: u32,
    cell: RelayCell,
    ntor_secrets: &HashMap<[u8; 20], [u8; 32]>,
    events: &Arc<Mutex<ChainEvents>>,
    dir_stream: &mut Option<DirStream>,
    echo_data: bool,
) {
    match cell.command {
        RelayCommand::Extend2 => {
            let Ok((_, consumed)) = LinkSpecifier::parse_list(&cell.data) else {
                return;
            };
            let rest = &cell.data[consumed..];
            let hlen = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            let Some((reply, key_seed)) = ntor_server(&rest[4..4 + hlen], ntor_secrets) else {
                return;
            };
            hops.push(MockHop::from_seed(&key_seed));
            let mut body = (reply.len() as u16).to_be_bytes().to_vec();
            body.extend_from_slice(&reply);
            let reply_cell = RelayCell::new(RelayCommand::Extended2, 0, body);
            send_backward(writer, hops, at, circ_id, reply_cell).await;
        }
        RelayCommand::Truncate => {
            hops.truncate(at + 1);
            let reply = RelayCell::new(RelayCommand::Truncated, 0, vec![0]);
            send_backward(writer, hops, at, circ_id, reply).await;
        }
        RelayCommand::EstablishIntro => {
            {
                let mut ev = events.lock().unwrap();
                ev.established_intro = true;
                if cell.data.len() >= 35 {
                    ev.intro_auth_key = Some(cell.data[3..35].try_into().unwrap());
                }
            }
            let reply = RelayCell::new(RelayCommand::IntroEstablished, 0, vec![0]);
            send_backward(writer, hops, at, circ_id, reply).await;
        }
        RelayCommand::BeginDir => {
            *dir_stream = Some(DirStream {
                stream_id: cell.stream_id,
                request: Vec::new(),
            });
            let reply = RelayCell::new(
                RelayCommand::Connected,
                cell.stream_id,
                vec![10, 0, 0, 1, 0, 0, 0, 120],
            );
            send_backward(writer, hops, at, circ_id, reply).await;
        }
        RelayCommand::Data => {
            let is_dir = dir_stream
                .as_ref()
                .map(|d| d.stream_id == cell.stream_id)
                .unwrap_or(false);
            if is_dir {
                let done = {
                    let dir = dir_stream.as_mut().unwrap();
                    dir.request.extend_from_slice(&cell.data);
                    request_complete(&dir.request)
                };
                if done {
                    let dir = dir_stream.take().unwrap();
                    let text = String::from_utf8_lossy(&dir.request);
                    if let Some(body_at) = text.find("\r\n\r\n") {
                        events
                            .lock()
                            .unwrap()
                            .posted_descriptors
                            .push(text[body_at + 4..].to_string());
                    }
                    let response = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
                    let reply = RelayCell::new(RelayCommand::Data, dir.stream_id, response);
                    send_backward(writer, hops, at, circ_id, reply).await;
                }
            } else if echo_data {
                let echo = RelayCell::new(RelayCommand::Data, cell.stream_id, cell.data.clone());
                send_backward(writer, hops, at, circ_id, echo).await;
            }
        }
        RelayCommand::Rendezvous1 => {
            events.lock().unwrap().rendezvous1.push(cell.data.clone());
        }
        _ => {}
    }
}

/// A directory POST is complete once the Content-Length worth of body has
/// arrived.
fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    request.len() >= header_end + 4 + content_length
}
