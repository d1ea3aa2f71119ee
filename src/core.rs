//! Core event loop
//!
//! One task owns every circuit, every service and the directory, and
//! serializes all state changes by draining a single queue. Per-circuit
//! reader tasks and per-stream reader tasks only ever touch the queue;
//! a periodic task feeds timer ticks into the same queue.
//!
//! Within one circuit, cells are handled in wire order because there is
//! exactly one reader, one queue and one consumer.

use crate::circuit::{
    read_raw_cell, CircIdAllocator, CircuitStatus, OnionCircuit, KEEPALIVE_INTERVAL_SECS,
};
use crate::directory::{BlockStore, Directory, OnionRelay, Period};
use crate::error::{Result, TorError};
use crate::hs::descriptor::{build_descriptor, DescriptorContext, IntroPointEntry};
use crate::hs::intro::{verify_and_decrypt_introduce2, IntroCrypto};
use crate::hs::keys::ServiceIdentity;
use crate::hs::publish::{build_circuit_to, publish_descriptors};
use crate::hs::rend::{complete_hs_ntor, rendezvous1_cell};
use crate::hs::{OnionService, INTRO_POINT_COUNT};
use crate::protocol::cell::{Cell, CellCommand, CircIdLen};
use crate::protocol::hs_cell::Introduce2Body;
use crate::protocol::relay_cell::{
    pack_connected, BeginPayload, RelayCell, RelayCommand, END_REASON_DONE,
    END_REASON_EXITPOLICY, LinkSpecifier,
};
use crate::storage::BlobStore;
use crate::transport::Dialer;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Timer tick kinds delivered through the core queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Keepalive,
    ConsensusRefresh,
    DescriptorRepublish,
    IntroPointHealth,
}

/// Everything the core task consumes.
#[derive(Debug)]
pub enum CoreMessage {
    /// A cell read off some circuit's link.
    OnionCell { circ_id: u32, cell: Cell },
    /// Bytes from a local TCP stream; empty data means EOF.
    ServiceTcpData {
        circ_id: u32,
        stream_id: u16,
        data: Vec<u8>,
    },
    TimerTick(TimerKind),
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reader task: forwards raw cells into the queue; a dead link is turned
/// into a synthetic DESTROY so teardown flows through the normal path.
fn spawn_circuit_reader(
    circ_id: u32,
    mut reader: tokio::io::ReadHalf<crate::transport::BoxTransport>,
    tx: mpsc::UnboundedSender<CoreMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_raw_cell(&mut reader, CircIdLen::Full).await {
                Ok(cell) => {
                    if tx.send(CoreMessage::OnionCell { circ_id, cell }).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    let _ = tx.send(CoreMessage::OnionCell {
                        circ_id,
                        cell: Cell::destroy(circ_id, 8), // CHANNEL_CLOSED
                    });
                    break;
                }
            }
        }
    })
}

/// Per-stream reader task: chunks local TCP data into the queue. A zero
/// byte read closes the stream with an EOF marker.
fn spawn_local_reader(
    circ_id: u32,
    stream_id: u16,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::UnboundedSender<CoreMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; RelayCell::MAX_DATA_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = tx.send(CoreMessage::ServiceTcpData {
                        circ_id,
                        stream_id,
                        data: Vec::new(),
                    });
                    break;
                }
                Ok(n) => {
                    let msg = CoreMessage::ServiceTcpData {
                        circ_id,
                        stream_id,
                        data: buf[..n].to_vec(),
                    };
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_timer_task(tx: mpsc::UnboundedSender<CoreMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(KEEPALIVE_INTERVAL_SECS);
        let start = tokio::time::Instant::now();
        let mut keepalive = tokio::time::interval_at(start + period, period);
        let mut refresh = tokio::time::interval_at(
            start + Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let mut health = tokio::time::interval_at(
            start + Duration::from_secs(45),
            Duration::from_secs(60),
        );
        let mut republish = tokio::time::interval_at(
            start + Duration::from_secs(300),
            Duration::from_secs(300),
        );
        loop {
            let message = tokio::select! {
                _ = keepalive.tick() => CoreMessage::TimerTick(TimerKind::Keepalive),
                _ = refresh.tick() => CoreMessage::TimerTick(TimerKind::ConsensusRefresh),
                _ = health.tick() => CoreMessage::TimerTick(TimerKind::IntroPointHealth),
                _ = republish.tick() => CoreMessage::TimerTick(TimerKind::DescriptorRepublish),
            };
            if tx.send(message).is_err() {
                break;
            }
        }
    })
}

/// The core: sole owner of circuits, services and the directory.
pub struct Core<S: BlockStore> {
    directory: Directory<S>,
    dialer: Arc<dyn Dialer>,
    circ_ids: CircIdAllocator,
    circuits: HashMap<u32, OnionCircuit>,
    reader_tasks: HashMap<u32, JoinHandle<()>>,
    services: Vec<OnionService>,
    tx: mpsc::UnboundedSender<CoreMessage>,
    rx: mpsc::UnboundedReceiver<CoreMessage>,
}

impl<S: BlockStore> Core<S> {
    pub fn new(directory: Directory<S>, dialer: Arc<dyn Dialer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            directory,
            dialer,
            circ_ids: CircIdAllocator::new(),
            circuits: HashMap::new(),
            reader_tasks: HashMap::new(),
            services: Vec::new(),
            tx,
            rx,
        }
    }

    /// Handle other producers can use to feed the queue.
    pub fn sender(&self) -> mpsc::UnboundedSender<CoreMessage> {
        self.tx.clone()
    }

    pub fn directory_mut(&mut self) -> &mut Directory<S> {
        &mut self.directory
    }

    /// Fetch the consensus before any circuit work.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.directory.bootstrap().await
    }

    /// Move a finished circuit under core management and start its reader.
    fn adopt_circuit(&mut self, mut circuit: OnionCircuit) {
        let circ_id = circuit.circ_id;
        if let Some(reader) = circuit.take_reader() {
            self.reader_tasks
                .insert(circ_id, spawn_circuit_reader(circ_id, reader, self.tx.clone()));
        }
        self.circuits.insert(circ_id, circuit);
    }

    /// Build a random standby circuit, establish an introduction point on
    /// it and return it (not yet adopted).
    async fn build_intro_circuit(&mut self, now: u64) -> Result<OnionCircuit> {
        let path = self.directory.select_path(3, &[], now)?;
        let guard = &path[0];
        let transport = self
            .dialer
            .dial(std::net::SocketAddr::from((guard.address, guard.or_port)))
            .await?;
        let mut circuit = OnionCircuit::open(self.circ_ids.allocate(), transport, now).await?;
        circuit.build(&path).await?;

        let intro = IntroCrypto::generate();
        let nonce = circuit
            .last_hop_nonce()
            .ok_or_else(|| TorError::InvalidState("built circuit has no hops".into()))?;
        circuit
            .send_relay_cell(intro.establish_intro_cell(&nonce), false)
            .await?;

        let (_, reply) = circuit.recv_relay_cell().await?;
        if reply.command != RelayCommand::IntroEstablished {
            let _ = circuit.destroy(0).await;
            return Err(TorError::UnexpectedCell {
                expected: "INTRO_ESTABLISHED".into(),
                got: format!("{:?}", reply.command),
            });
        }

        let mut intro = intro;
        intro.established = true;
        circuit.intro = Some(intro);
        circuit.status = CircuitStatus::IntroPoint;
        log::info!("📍 introduction point ready on circuit {:08x}", circuit.circ_id);
        Ok(circuit)
    }

    /// Descriptor records for a service's live introduction circuits.
    fn intro_entries(&self, service: &OnionService) -> Vec<IntroPointEntry> {
        service
            .intro_circuits
            .iter()
            .filter_map(|id| self.circuits.get(id))
            .filter_map(|circuit| {
                let intro = circuit.intro.as_ref()?;
                let relay = &circuit.hops().last()?.relay;
                Some(IntroPointEntry {
                    link_specifiers: vec![
                        LinkSpecifier::Ipv4(relay.address, relay.or_port),
                        LinkSpecifier::LegacyId(relay.identity),
                    ],
                    ntor_onion_key: relay.ntor_onion_key,
                    auth_key: intro.auth_key.verifying_key().to_bytes(),
                    enc_key: intro.enc_public,
                })
            })
            .collect()
    }

    /// Build and upload descriptors for the current and previous periods.
    async fn publish_service_descriptors(&mut self, service_index: usize, now: u64) -> Result<()> {
        let (valid_after, interval, period) = {
            let consensus = self.directory.consensus().ok_or(TorError::StaleDirectory)?;
            (
                consensus.valid_after,
                consensus.hsdir_interval,
                consensus.time_period(),
            )
        };

        let (current, previous) = self.services[service_index].roll_period(period, interval)?;
        let entries = self.intro_entries(&self.services[service_index]);
        if entries.is_empty() {
            return Err(TorError::ResourceExhausted("no live intro points".into()));
        }

        for (keys, period_kind) in [(current, Period::Current), (previous, Period::Previous)] {
            let descriptor = {
                let service = &self.services[service_index];
                let ctx = DescriptorContext {
                    blinded: &keys.blinded,
                    signing_key: &service.descriptor_signing,
                    subcredential: keys.subcredential,
                    valid_after,
                    revision: service.revision,
                };
                build_descriptor(&ctx, &entries)?
            };

            let outcome = publish_descriptors(
                &mut self.directory,
                self.dialer.as_ref(),
                &mut self.circ_ids,
                &descriptor,
                &keys.blinded.public(),
                keys.period,
                period_kind,
                now,
            )
            .await;

            match (outcome, period_kind) {
                (Ok(stored), _) => {
                    log::info!("descriptor for period {} stored at {} HSDirs", keys.period, stored)
                }
                // The previous-period descriptor is best effort; clients on
                // the new period only need the current one.
                (Err(e), Period::Previous) => {
                    log::warn!("previous-period publish failed: {}", e)
                }
                (Err(e), Period::Current) => return Err(e),
            }
        }

        self.services[service_index].revision += 1;
        Ok(())
    }

    /// Bring up a hidden service: keys, three introduction points,
    /// descriptors on their HSDirs. Returns the onion hostname.
    pub async fn setup_hidden_service(
        &mut self,
        storage: &mut dyn BlobStore,
        local_port: u16,
        exit_port: u16,
    ) -> Result<String> {
        let now = unix_now();
        let identity = ServiceIdentity::load_or_generate(storage)?;
        let hostname = identity.hostname.clone();
        let mut service = OnionService::new(identity, local_port, exit_port);

        let mut intro_circuits = Vec::new();
        let mut failures = 0;
        while intro_circuits.len() < INTRO_POINT_COUNT {
            match self.build_intro_circuit(now).await {
                Ok(circuit) => intro_circuits.push(circuit),
                Err(e) if e.is_retryable() && failures < 6 => {
                    failures += 1;
                    log::warn!("intro circuit failed ({}), retrying", e);
                }
                Err(e) => {
                    for mut circuit in intro_circuits {
                        let _ = circuit.destroy(0).await;
                    }
                    return Err(e);
                }
            }
        }

        for circuit in intro_circuits {
            service.intro_circuits.push(circuit.circ_id);
            self.adopt_circuit(circuit);
        }

        self.services.push(service);
        let index = self.services.len() - 1;
        self.publish_service_descriptors(index, now).await?;

        log::info!("🧅 hidden service up: {}", hostname);
        Ok(hostname)
    }

    /// Tear down a service: destroy its circuits and drop its state.
    pub async fn stop_service(&mut self, index: usize) -> Result<()> {
        if index >= self.services.len() {
            return Err(TorError::InvalidState("no such service".into()));
        }
        let service = self.services.remove(index);
        for circ_id in service
            .intro_circuits
            .iter()
            .chain(service.rend_circuits.iter())
        {
            self.teardown_circuit(*circ_id, 9).await; // FINISHED
        }
        Ok(())
    }

    async fn teardown_circuit(&mut self, circ_id: u32, reason: u8) {
        if let Some(mut circuit) = self.circuits.remove(&circ_id) {
            let _ = circuit.destroy(reason).await;
        }
        if let Some(task) = self.reader_tasks.remove(&circ_id) {
            task.abort();
        }
        for service in &mut self.services {
            service.remove_circuit(circ_id);
        }
    }

    /// Run the loop forever, draining the queue.
    pub async fn run(mut self) {
        let _timer = spawn_timer_task(self.tx.clone());
        while let Some(message) = self.rx.recv().await {
            self.handle_message(message).await;
        }
    }

    pub(crate) async fn handle_message(&mut self, message: CoreMessage) {
        match message {
            CoreMessage::OnionCell { circ_id, cell } => {
                if let Err(e) = self.handle_cell(circ_id, cell).await {
                    if e.is_silent_drop() {
                        log::debug!("dropping cell on {:08x}: {}", circ_id, e);
                    } else {
                        log::warn!("cell on circuit {:08x} failed: {}", circ_id, e);
                    }
                }
            }
            CoreMessage::ServiceTcpData {
                circ_id,
                stream_id,
                data,
            } => {
                if let Err(e) = self.handle_tcp_data(circ_id, stream_id, data).await {
                    log::warn!(
                        "local stream ({:08x},{}) failed: {}",
                        circ_id,
                        stream_id,
                        e
                    );
                }
            }
            CoreMessage::TimerTick(kind) => self.handle_timer(kind).await,
        }
    }

    async fn handle_cell(&mut self, circ_id: u32, cell: Cell) -> Result<()> {
        match cell.command {
            CellCommand::Padding | CellCommand::Vpadding => Ok(()),
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                log::info!(
                    "circuit {:08x} destroyed by peer: {}",
                    circ_id,
                    crate::error::destroy_reason_name(reason)
                );
                self.teardown_circuit(circ_id, reason).await;
                Ok(())
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                let relay_cell = {
                    let circuit = self
                        .circuits
                        .get_mut(&circ_id)
                        .ok_or_else(|| TorError::InvalidState("cell for unknown circuit".into()))?;
                    match circuit.unseal_relay_payload(&cell.payload) {
                        Ok((_, relay_cell)) => relay_cell,
                        Err(TorError::Unrecognized) => {
                            // Protocol violation: fail the circuit.
                            self.teardown_circuit(circ_id, 1).await;
                            return Err(TorError::Unrecognized);
                        }
                        Err(e) => return Err(e),
                    }
                };
                self.handle_relay_cell(circ_id, relay_cell).await
            }
            other => {
                log::debug!("ignoring {:?} on circuit {:08x}", other, circ_id);
                Ok(())
            }
        }
    }

    async fn handle_relay_cell(&mut self, circ_id: u32, cell: RelayCell) -> Result<()> {
        match cell.command {
            RelayCommand::Introduce2 => self.handle_introduce2(circ_id, &cell).await,
            RelayCommand::Begin => self.handle_relay_begin(circ_id, &cell).await,
            RelayCommand::Data => self.handle_relay_data(circ_id, &cell).await,
            RelayCommand::End => {
                if let Some(service) = self.service_for_circuit_mut(circ_id) {
                    service.close_stream(circ_id, cell.stream_id);
                }
                Ok(())
            }
            RelayCommand::IntroEstablished => {
                if let Some(circuit) = self.circuits.get_mut(&circ_id) {
                    if let Some(intro) = circuit.intro.as_mut() {
                        intro.established = true;
                    }
                }
                Ok(())
            }
            RelayCommand::Drop | RelayCommand::Sendme | RelayCommand::Truncated => Ok(()),
            other => {
                log::debug!("unhandled relay command {:?} on {:08x}", other, circ_id);
                Ok(())
            }
        }
    }

    fn service_for_circuit_mut(&mut self, circ_id: u32) -> Option<&mut OnionService> {
        self.services.iter_mut().find(|s| s.owns_circuit(circ_id))
    }

    /// INTRODUCE2: verify, decrypt, suppress replays, build the rendezvous
    /// circuit and answer with RENDEZVOUS1.
    async fn handle_introduce2(&mut self, circ_id: u32, cell: &RelayCell) -> Result<()> {
        let now = unix_now();
        let service_index = self
            .services
            .iter()
            .position(|s| s.intro_circuits.contains(&circ_id))
            .ok_or_else(|| TorError::InvalidState("INTRODUCE2 on non-intro circuit".into()))?;

        let body = Introduce2Body::parse(&cell.data)?;

        let (plaintext, handshake) = {
            let circuit = self
                .circuits
                .get(&circ_id)
                .ok_or_else(|| TorError::InvalidState("intro circuit missing".into()))?;
            let intro = circuit
                .intro
                .as_ref()
                .ok_or_else(|| TorError::InvalidState("intro crypto missing".into()))?;

            let subcredentials = self.services[service_index].subcredentials();
            let plaintext = verify_and_decrypt_introduce2(&body, intro, &subcredentials)?;
            let handshake = complete_hs_ntor(intro, &body.client_pk)?;
            (plaintext, handshake)
        };

        if self.services[service_index].seen_cookie(&plaintext.rendezvous_cookie) {
            log::debug!("replayed INTRODUCE2, dropping");
            return Err(TorError::Replay);
        }

        // Assemble the rendezvous relay from the client's link specifiers.
        let mut address = None;
        let mut identity = None;
        for spec in &plaintext.link_specifiers {
            match spec {
                LinkSpecifier::Ipv4(addr, port) => address = Some((*addr, *port)),
                LinkSpecifier::LegacyId(id) => identity = Some(*id),
                LinkSpecifier::Other { .. } => {}
            }
        }
        let (addr, port) = address
            .ok_or_else(|| TorError::Protocol("rendezvous point has no IPv4 specifier".into()))?;
        let rend_relay = OnionRelay {
            identity: identity
                .ok_or_else(|| TorError::Protocol("rendezvous point has no identity".into()))?,
            digest: [0; 20],
            master_key: [0; 32],
            ntor_onion_key: plaintext.onion_key,
            address: addr,
            or_port: port,
            dir_port: 0,
            hsdir: false,
            dir_cache: false,
            suitable: false,
            can_guard: false,
            can_exit: false,
            is_guard: false,
            id_hash: [0; 32],
            id_hash_previous: [0; 32],
        };

        let mut rend_circuit = build_circuit_to(
            &mut self.directory,
            self.dialer.as_ref(),
            &mut self.circ_ids,
            &rend_relay,
            now,
        )
        .await?;

        // RENDEZVOUS1 travels without the end-to-end layer; it only comes
        // into effect afterwards.
        rend_circuit
            .send_relay_cell(
                rendezvous1_cell(&plaintext.rendezvous_cookie, &handshake),
                false,
            )
            .await?;
        rend_circuit.hs = Some(handshake.hs_crypto);
        rend_circuit.status = CircuitStatus::Rendezvous;

        log::info!(
            "🤝 rendezvous joined at {} on circuit {:08x}",
            rend_relay.address,
            rend_circuit.circ_id
        );
        self.services[service_index]
            .rend_circuits
            .push(rend_circuit.circ_id);
        self.adopt_circuit(rend_circuit);
        Ok(())
    }

    /// RELAY_BEGIN on a rendezvous circuit: bridge to the local TCP port.
    async fn handle_relay_begin(&mut self, circ_id: u32, cell: &RelayCell) -> Result<()> {
        let stream_id = cell.stream_id;
        let service_index = self
            .services
            .iter()
            .position(|s| s.rend_circuits.contains(&circ_id))
            .ok_or_else(|| TorError::InvalidState("BEGIN on non-rendezvous circuit".into()))?;

        let begin = BeginPayload::parse(&cell.data)?;
        let (local_port, exit_port) = {
            let service = &self.services[service_index];
            (service.local_port, service.exit_port)
        };

        if begin.port != exit_port {
            log::debug!("BEGIN for wrong port {} (serving {})", begin.port, exit_port);
            self.send_relay(
                circ_id,
                RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_EXITPOLICY]),
            )
            .await?;
            return Ok(());
        }

        let stream =
            tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, local_port)).await;
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("local connect to port {} failed: {}", local_port, e);
                self.send_relay(
                    circ_id,
                    RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_DONE]),
                )
                .await?;
                return Ok(());
            }
        };

        let (read_half, write_half) = stream.into_split();
        self.services[service_index].register_stream(circ_id, stream_id, write_half);
        let _reader = spawn_local_reader(circ_id, stream_id, read_half, self.tx.clone());

        self.send_relay(
            circ_id,
            RelayCell::new(
                RelayCommand::Connected,
                stream_id,
                pack_connected(Ipv4Addr::LOCALHOST, 120),
            ),
        )
        .await
    }

    /// Inbound RELAY_DATA goes straight to the local socket.
    async fn handle_relay_data(&mut self, circ_id: u32, cell: &RelayCell) -> Result<()> {
        let stream_id = cell.stream_id;
        let write_failed = {
            let service = self
                .service_for_circuit_mut(circ_id)
                .ok_or_else(|| TorError::InvalidState("DATA for unknown service".into()))?;
            match service.stream_mut(circ_id, stream_id) {
                None => {
                    log::debug!("DATA for unknown stream ({:08x},{})", circ_id, stream_id);
                    return Ok(());
                }
                Some(writer) => writer.write_all(&cell.data).await.is_err(),
            }
        };

        if write_failed {
            if let Some(service) = self.service_for_circuit_mut(circ_id) {
                service.close_stream(circ_id, stream_id);
            }
            self.send_relay(
                circ_id,
                RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_DONE]),
            )
            .await?;
        }
        Ok(())
    }

    /// Local TCP bytes (or EOF) from a stream reader task.
    async fn handle_tcp_data(
        &mut self,
        circ_id: u32,
        stream_id: u16,
        data: Vec<u8>,
    ) -> Result<()> {
        if self.service_for_circuit_mut(circ_id).is_none() {
            // Service already stopped; discard.
            return Ok(());
        }

        if data.is_empty() {
            if let Some(service) = self.service_for_circuit_mut(circ_id) {
                service.close_stream(circ_id, stream_id);
            }
            self.send_relay(
                circ_id,
                RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_DONE]),
            )
            .await
        } else {
            self.send_relay(
                circ_id,
                RelayCell::new(RelayCommand::Data, stream_id, data),
            )
            .await
        }
    }

    async fn send_relay(&mut self, circ_id: u32, cell: RelayCell) -> Result<()> {
        let circuit = self
            .circuits
            .get_mut(&circ_id)
            .ok_or_else(|| TorError::InvalidState("send on unknown circuit".into()))?;
        circuit.send_relay_cell(cell, false).await
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        let now = unix_now();
        match kind {
            TimerKind::Keepalive => self.keepalive_tick().await,
            TimerKind::ConsensusRefresh => {
                if self.directory.needs_refresh(now) {
                    match self.directory.bootstrap().await {
                        Ok(()) => {
                            // A fresh consensus may have rolled the time
                            // period; republish if so.
                            self.republish_tick(now).await;
                        }
                        Err(e) => {
                            log::warn!("consensus refresh failed: {}", e);
                            self.directory.note_refresh_failure();
                        }
                    }
                }
            }
            TimerKind::DescriptorRepublish => self.republish_tick(now).await,
            TimerKind::IntroPointHealth => self.intro_health_tick(now).await,
        }
    }

    async fn keepalive_tick(&mut self) {
        let mut dead = Vec::new();
        for (circ_id, circuit) in self.circuits.iter_mut() {
            let idle = matches!(
                circuit.status,
                CircuitStatus::Standby
                    | CircuitStatus::IntroPoint
                    | CircuitStatus::Rendezvous
                    | CircuitStatus::HsDir
            );
            if idle && circuit.send_padding().await.is_err() {
                dead.push(*circ_id);
            }
        }
        for circ_id in dead {
            log::info!("keepalive failed, dropping circuit {:08x}", circ_id);
            self.teardown_circuit(circ_id, 8).await;
        }
    }

    async fn republish_tick(&mut self, now: u64) {
        let Some(period) = self.directory.consensus().map(|c| c.time_period()) else {
            return;
        };
        for index in 0..self.services.len() {
            if self.services[index].published_period != period {
                log::info!("time period rolled to {}, republishing", period);
                if let Err(e) = self.publish_service_descriptors(index, now).await {
                    log::warn!("republish failed: {}", e);
                }
            }
        }
    }

    async fn intro_health_tick(&mut self, now: u64) {
        for index in 0..self.services.len() {
            let live = self.services[index]
                .intro_circuits
                .iter()
                .filter(|id| {
                    self.circuits
                        .get(id)
                        .map(|c| c.status == CircuitStatus::IntroPoint)
                        .unwrap_or(false)
                })
                .count();
            if live >= INTRO_POINT_COUNT {
                continue;
            }

            log::info!(
                "service has {}/{} intro points, rebuilding",
                live,
                INTRO_POINT_COUNT
            );
            // Drop the stale ids first.
            let stale: Vec<u32> = self.services[index]
                .intro_circuits
                .iter()
                .filter(|id| !self.circuits.contains_key(id))
                .copied()
                .collect();
            for id in stale {
                self.services[index].remove_circuit(id);
            }

            let mut rebuilt = false;
            while self.services[index].intro_circuits.len() < INTRO_POINT_COUNT {
                match self.build_intro_circuit(now).await {
                    Ok(circuit) => {
                        self.services[index].intro_circuits.push(circuit.circ_id);
                        self.adopt_circuit(circuit);
                        rebuilt = true;
                    }
                    Err(e) => {
                        log::warn!("intro rebuild failed: {}", e);
                        break;
                    }
                }
            }

            // New intro points invalidate the published descriptors.
            if rebuilt {
                if let Err(e) = self.publish_service_descriptors(index, now).await {
                    log::warn!("republish after intro rebuild failed: {}", e);
                }
            }
        }
    }
}
