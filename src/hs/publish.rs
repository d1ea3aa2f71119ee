//! Descriptor publication
//!
//! Computes the replica placement indices, walks the responsible HSDirs in
//! index order and uploads the descriptor over a single reusable 3-hop
//! circuit: when the next target shares a prefix of hops the circuit is
//! truncated and re-extended, otherwise it is torn down and rebuilt.

use crate::circuit::{CircIdAllocator, CircuitStatus, OnionCircuit};
use crate::crypto::sha3_256;
use crate::directory::{parse_http_response, BlockStore, Directory, OnionRelay, Period};
use crate::error::{Result, TorError};
use crate::protocol::relay_cell::{RelayCell, RelayCommand};
use crate::protocol::relay_crypto::RecognizedLayer;

/// Placement index for one replica:
/// `SHA3-256("store-at-idx" || blinded_pub || int64_be(replica) ||
/// int64_be(interval) || int64_be(period))`.
pub fn store_at_index(
    blinded_pub: &[u8; 32],
    replica: u64,
    interval: u64,
    period: u64,
) -> [u8; 32] {
    sha3_256(&[
        b"store-at-idx",
        blinded_pub,
        &replica.to_be_bytes(),
        &interval.to_be_bytes(),
        &period.to_be_bytes(),
    ])
}

/// Build a fresh 3-hop circuit whose last hop is `target`.
pub(crate) async fn build_circuit_to<S: BlockStore>(
    directory: &mut Directory<S>,
    dialer: &dyn crate::transport::Dialer,
    alloc: &mut CircIdAllocator,
    target: &OnionRelay,
    now: u64,
) -> Result<OnionCircuit> {
    let mut path = directory.select_path(2, &[target.identity], now)?;
    path.push(target.clone());

    let guard = &path[0];
    let transport = dialer
        .dial(std::net::SocketAddr::from((guard.address, guard.or_port)))
        .await?;
    let mut circuit = OnionCircuit::open(alloc.allocate(), transport, now).await?;
    circuit.build(&path).await?;
    Ok(circuit)
}

/// Steer the publish circuit at `target`, reusing the built prefix where
/// the paths agree.
async fn aim_circuit_at<S: BlockStore>(
    publish_circuit: &mut Option<OnionCircuit>,
    directory: &mut Directory<S>,
    dialer: &dyn crate::transport::Dialer,
    alloc: &mut CircIdAllocator,
    target: &OnionRelay,
    now: u64,
) -> Result<()> {
    if let Some(circuit) = publish_circuit.as_mut() {
        let position = circuit
            .hops()
            .iter()
            .position(|h| h.relay.identity == target.identity);

        let steered = match position {
            // The target is our guard: no usable prefix, rebuild.
            Some(0) => Err(TorError::InvalidState("target is the guard".into())),
            // The target sits mid-path: truncate so it becomes the tail.
            Some(k) if k + 1 == circuit.built_length() => Ok(()),
            Some(k) => match circuit.truncate(k + 1).await {
                Ok(()) => Ok(()),
                Err(e) => Err(e),
            },
            // Fresh tail: keep guard+middle, swap the last hop.
            None => match circuit.truncate(2).await {
                Ok(()) => circuit.extend2(target).await,
                Err(e) => Err(e),
            },
        };

        match steered {
            Ok(()) => {
                circuit.status = CircuitStatus::HsDir;
                return Ok(());
            }
            Err(e) => {
                log::debug!("publish circuit not reusable ({}), rebuilding", e);
                let _ = circuit.destroy(0).await;
                *publish_circuit = None;
            }
        }
    }

    let mut circuit = build_circuit_to(directory, dialer, alloc, target, now).await?;
    circuit.status = CircuitStatus::HsDir;
    *publish_circuit = Some(circuit);
    Ok(())
}

/// Upload `descriptor` to every responsible HSDir of every replica.
/// Returns how many HSDirs accepted it.
#[allow(clippy::too_many_arguments)]
pub async fn publish_descriptors<S: BlockStore>(
    directory: &mut Directory<S>,
    dialer: &dyn crate::transport::Dialer,
    alloc: &mut CircIdAllocator,
    descriptor: &str,
    blinded_pub: &[u8; 32],
    period: u64,
    period_kind: Period,
    now: u64,
) -> Result<usize> {
    let (n_replicas, spread, interval) = {
        let consensus = directory
            .consensus()
            .ok_or(TorError::StaleDirectory)?;
        (
            consensus.hsdir_n_replicas as u64,
            consensus.hsdir_spread_store as usize,
            consensus.hsdir_interval,
        )
    };

    let mut chosen: Vec<[u8; 20]> = Vec::new();
    let mut publish_circuit: Option<OnionCircuit> = None;
    let mut stored = 0usize;
    let mut stream_id = 0u16;

    for replica in 0..n_replicas {
        let target = store_at_index(blinded_pub, replica, interval, period);
        let hsdirs = directory.hsdirs_for(&target, period_kind, spread, &chosen)?;

        for hsdir in hsdirs {
            chosen.push(hsdir.identity);
            stream_id += 1;

            let mut attempts = 0;
            loop {
                attempts += 1;
                let result = async {
                    aim_circuit_at(
                        &mut publish_circuit,
                        directory,
                        dialer,
                        alloc,
                        &hsdir,
                        now,
                    )
                    .await?;
                    let circuit = publish_circuit.as_mut().expect("circuit was just aimed");
                    post_descriptor(circuit, descriptor, stream_id).await
                }
                .await;

                match result {
                    Ok(()) => {
                        stored += 1;
                        log::info!(
                            "📤 descriptor stored at {} (replica {})",
                            hsdir.address,
                            replica
                        );
                        break;
                    }
                    Err(e) if e.is_retryable() && attempts < 3 => {
                        log::warn!("descriptor upload to {} failed: {}", hsdir.address, e);
                        if let Some(mut dead) = publish_circuit.take() {
                            let _ = dead.destroy(0).await;
                        }
                    }
                    Err(e) => {
                        log::warn!("giving up on {}: {}", hsdir.address, e);
                        if let Some(mut dead) = publish_circuit.take() {
                            let _ = dead.destroy(0).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    if let Some(mut circuit) = publish_circuit.take() {
        let _ = circuit.destroy(0).await;
    }

    if stored == 0 {
        return Err(TorError::ResourceExhausted(
            "no HSDir accepted the descriptor".into(),
        ));
    }
    Ok(stored)
}

/// POST the descriptor over a directory stream on the publish circuit.
async fn post_descriptor(
    circuit: &mut OnionCircuit,
    descriptor: &str,
    stream_id: u16,
) -> Result<()> {
    circuit
        .send_relay_cell(RelayCell::new(RelayCommand::BeginDir, stream_id, Vec::new()), false)
        .await?;

    let (_, reply) = circuit.recv_relay_cell().await?;
    if reply.command != RelayCommand::Connected {
        return Err(TorError::UnexpectedCell {
            expected: "CONNECTED".into(),
            got: format!("{:?}", reply.command),
        });
    }

    let request = format!(
        "POST /tor/hs/3/publish HTTP/1.0\r\nHost: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        circuit
            .hops()
            .last()
            .map(|h| h.relay.address.to_string())
            .unwrap_or_default(),
        descriptor.len(),
        descriptor
    );

    for chunk in request.as_bytes().chunks(RelayCell::MAX_DATA_SIZE) {
        circuit
            .send_relay_cell(RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec()), false)
            .await?;
    }

    // Collect the response until the stream ends.
    let mut response = Vec::new();
    loop {
        let (layer, cell) = circuit.recv_relay_cell().await?;
        debug_assert!(matches!(layer, RecognizedLayer::Hop(_)));
        match cell.command {
            RelayCommand::Data if cell.stream_id == stream_id => {
                response.extend_from_slice(&cell.data);
                // HTTP/1.0 responses end with the connection; a complete
                // header with status is enough to decide.
                if response.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            RelayCommand::End => break,
            _ => continue,
        }
    }

    parse_http_response(&response).map(|_| ())
}
