//! Relay directory
//!
//! Owns the network consensus, the materialized relay set, the persistent
//! guard set and the HSDir index. All relay selection goes through this one
//! service; callers never touch the underlying state directly, which keeps
//! the locking trivial (the core task holds the directory exclusively).

pub mod consensus;
pub mod hsdir_index;

use crate::crypto::sha3_256;
use crate::error::{Result, TorError};
use crate::storage::{BlobStore, GuardState};
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use consensus::{
    parse_consensus, parse_server_descriptor, ConsensusDocument, ConsensusRelay,
    NetworkConsensus, RelayFlags, ServerDescriptor,
};
pub use hsdir_index::{BlockStore, HsDirIndex, MemoryBlockStore, Period};

/// A relay materialized from the consensus plus its server descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct OnionRelay {
    pub identity: [u8; 20],
    pub digest: [u8; 20],
    pub master_key: [u8; 32],
    pub ntor_onion_key: [u8; 32],
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
    pub hsdir: bool,
    pub dir_cache: bool,
    pub suitable: bool,
    pub can_guard: bool,
    pub can_exit: bool,
    pub is_guard: bool,
    /// HSDir index hash for the current time period
    pub id_hash: [u8; 32],
    /// HSDir index hash for the previous time period
    pub id_hash_previous: [u8; 32],
}

impl OnionRelay {
    /// `H = SHA3-256("node-idx" || identity || shared_rand ||
    /// int64_be(period) || int64_be(interval))`
    pub fn hsdir_index_hash(
        identity: &[u8; 20],
        shared_rand: &[u8; 32],
        period: u64,
        interval: u64,
    ) -> [u8; 32] {
        sha3_256(&[
            b"node-idx",
            identity,
            shared_rand,
            &period.to_be_bytes(),
            &interval.to_be_bytes(),
        ])
    }
}

/// Fetch consensus and descriptors from this many relays per attempt before
/// backing off.
const DESCRIPTOR_BATCH: usize = 32;

/// Exponential backoff cap for consensus fetches.
pub const REFRESH_BACKOFF_CAP_SECS: u64 = 300;

/// The relay directory service.
pub struct Directory<S: BlockStore> {
    authority: SocketAddr,
    consensus: Option<NetworkConsensus>,
    relays: Vec<OnionRelay>,
    index: HsDirIndex<S>,
    guards: GuardState,
    storage: Box<dyn BlobStore>,
    refresh_failures: u32,
}

impl<S: BlockStore> Directory<S> {
    pub fn new(authority: SocketAddr, index_store: S, storage: Box<dyn BlobStore>) -> Result<Self> {
        let guards = GuardState::load(storage.as_ref())?;
        Ok(Self {
            authority,
            consensus: None,
            relays: Vec::new(),
            index: HsDirIndex::new(index_store),
            guards,
            storage,
            refresh_failures: 0,
        })
    }

    pub fn consensus(&self) -> Option<&NetworkConsensus> {
        self.consensus.as_ref()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Consensus needs refetching at `fresh_until`.
    pub fn needs_refresh(&self, now: u64) -> bool {
        self.consensus.as_ref().map_or(true, |c| !c.is_fresh(now))
    }

    /// Seconds until the next refresh attempt, honoring exponential backoff
    /// after failures (capped).
    pub fn refresh_delay(&self, now: u64) -> u64 {
        if self.refresh_failures > 0 {
            return (1u64 << self.refresh_failures.min(8)).min(REFRESH_BACKOFF_CAP_SECS);
        }
        self.consensus
            .as_ref()
            .map_or(0, |c| c.fresh_until.saturating_sub(now))
    }

    fn usable_consensus(&self, now: u64) -> Result<&NetworkConsensus> {
        match self.consensus.as_ref() {
            Some(c) if c.is_valid(now) => Ok(c),
            _ => Err(TorError::StaleDirectory),
        }
    }

    /// Install a parsed consensus and its descriptors, recomputing the
    /// HSDir hashes and rebuilding the ordered index.
    pub fn install_consensus(
        &mut self,
        doc: ConsensusDocument,
        descriptors: &HashMap<[u8; 20], ServerDescriptor>,
    ) -> Result<()> {
        let consensus = doc.consensus;
        let period = consensus.time_period();
        let interval = consensus.hsdir_interval;

        self.relays.clear();
        self.index.reset();

        for entry in doc.relays {
            let Some(descriptor) = descriptors.get(&entry.identity) else {
                continue;
            };
            let flags = &entry.flags;
            let suitable = flags.fast && flags.stable && flags.valid && flags.running;

            let relay = OnionRelay {
                identity: entry.identity,
                digest: entry.digest,
                master_key: descriptor.master_key.unwrap_or([0; 32]),
                ntor_onion_key: descriptor.ntor_onion_key,
                address: entry.address,
                or_port: entry.or_port,
                dir_port: entry.dir_port,
                hsdir: flags.hs_dir,
                dir_cache: flags.v2_dir,
                suitable,
                can_guard: flags.guard && suitable,
                can_exit: flags.exit && !flags.bad_exit,
                is_guard: self.guards.contains(&entry.identity),
                id_hash: OnionRelay::hsdir_index_hash(
                    &entry.identity,
                    &consensus.shared_rand,
                    period,
                    interval,
                ),
                id_hash_previous: OnionRelay::hsdir_index_hash(
                    &entry.identity,
                    &consensus.previous_shared_rand,
                    period.saturating_sub(1),
                    interval,
                ),
            };

            if relay.hsdir && relay.dir_cache {
                self.index.insert(&relay)?;
            }
            self.relays.push(relay);
        }

        log::info!(
            "directory installed: {} relays, {} hsdirs, period {}",
            self.relays.len(),
            self.index.len(),
            period
        );
        self.consensus = Some(consensus);
        self.refresh_failures = 0;
        Ok(())
    }

    /// Record a refresh failure for backoff pacing.
    pub fn note_refresh_failure(&mut self) {
        self.refresh_failures = self.refresh_failures.saturating_add(1);
    }

    /// Select `length` distinct suitable relays, uniformly, honoring the
    /// exclusion set. Position 0 is the guard slot: a remembered guard is
    /// reused when present; otherwise a fresh guard-capable relay is chosen,
    /// marked and persisted.
    pub fn select_path(
        &mut self,
        length: usize,
        exclude: &[[u8; 20]],
        now: u64,
    ) -> Result<Vec<OnionRelay>> {
        self.usable_consensus(now)?;

        let suitable: Vec<usize> = (0..self.relays.len())
            .filter(|&i| self.relays[i].suitable)
            .collect();
        if suitable.len() < length {
            return Err(TorError::NoSuitableRelays(format!(
                "need {}, have {}",
                length,
                suitable.len()
            )));
        }

        let mut rng = rand::thread_rng();
        let mut path: Vec<OnionRelay> = Vec::with_capacity(length);

        // Guard slot: reuse a persisted guard when the consensus still
        // lists it as suitable.
        let remembered = suitable
            .iter()
            .map(|&i| &self.relays[i])
            .find(|r| r.is_guard && r.can_guard && !exclude.contains(&r.identity));
        if let Some(guard) = remembered {
            path.push(guard.clone());
        }

        let mut attempts = 0usize;
        while path.len() < length {
            attempts += 1;
            if attempts > suitable.len() * 20 {
                return Err(TorError::NoSuitableRelays(
                    "selection exhausted the suitable set".into(),
                ));
            }

            let candidate = &self.relays[suitable[rng.gen_range(0..suitable.len())]];
            if exclude.contains(&candidate.identity) {
                continue;
            }
            if path.iter().any(|r| r.identity == candidate.identity) {
                continue;
            }
            if path.is_empty() {
                // Fresh guard: guard-capable and not already burned.
                if !candidate.can_guard || candidate.is_guard {
                    continue;
                }
                let identity = candidate.identity;
                path.push(candidate.clone());
                self.mark_guard(&identity)?;
                continue;
            }
            path.push(candidate.clone());
        }

        Ok(path)
    }

    fn mark_guard(&mut self, identity: &[u8; 20]) -> Result<()> {
        if let Some(relay) = self.relays.iter_mut().find(|r| r.identity == *identity) {
            relay.is_guard = true;
        }
        self.guards.add(identity);
        self.guards.save(self.storage.as_mut())?;
        log::info!("🛡️ marked new guard {}", hex::encode(identity));
        Ok(())
    }

    /// The HSDirs responsible for `target` in the given period, skipping
    /// the identities in `exclude`.
    pub fn hsdirs_for(
        &mut self,
        target: &[u8; 32],
        period: Period,
        spread: usize,
        exclude: &[[u8; 20]],
    ) -> Result<Vec<OnionRelay>> {
        self.index.responsible_for(target, period, spread, exclude)
    }

    /// Fetch the consensus and all descriptors from the configured
    /// authority over plain directory HTTP, then install.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let text = fetch_document(self.authority, "/tor/status-vote/current/consensus").await?;
        let doc = parse_consensus(&text)?;
        log::info!("📥 consensus lists {} relays", doc.relays.len());

        let mut descriptors = HashMap::new();
        for batch in doc.relays.chunks(DESCRIPTOR_BATCH) {
            for relay in batch {
                let path = format!("/tor/server/d/{}", hex::encode(relay.digest).to_uppercase());
                match fetch_document(self.authority, &path).await {
                    Ok(body) => match parse_server_descriptor(&body) {
                        Ok(desc) => {
                            descriptors.insert(relay.identity, desc);
                        }
                        Err(e) => log::debug!("descriptor for {} unusable: {}", relay.nickname, e),
                    },
                    Err(e) => log::debug!("descriptor fetch for {} failed: {}", relay.nickname, e),
                }
            }
        }

        self.install_consensus(doc, &descriptors)
    }
}

/// One line-oriented HTTP/1.0 GET against a directory port.
async fn fetch_document(addr: SocketAddr, path: &str) -> Result<String> {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .map_err(|e| TorError::ConnectionFailed(e.to_string()))?;
    http_get(stream, &addr.ip().to_string(), path).await
}

/// Issue a GET on an already-open byte stream and return the body.
pub async fn http_get<T: AsyncRead + AsyncWrite + Unpin>(
    mut stream: T,
    host: &str,
    path: &str,
) -> Result<String> {
    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: microtor/0.1\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    parse_http_response(&response)
}

/// Split an HTTP response, insisting on a 2xx status.
pub fn parse_http_response(raw: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| TorError::Directory("malformed HTTP response".into()))?;
    let status_line = head.lines().next().unwrap_or("");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TorError::Directory("missing HTTP status".into()))?;
    if !(200..300).contains(&status) {
        return Err(TorError::Directory(format!("HTTP status {}", status)));
    }
    Ok(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    pub(crate) fn test_relay(seed: u8, guard: bool, hsdir: bool) -> (ConsensusRelay, ServerDescriptor) {
        let entry = ConsensusRelay {
            nickname: format!("relay{}", seed),
            identity: [seed; 20],
            digest: [seed; 20],
            address: Ipv4Addr::new(10, 0, 0, seed),
            or_port: 9000 + seed as u16,
            dir_port: 0,
            flags: RelayFlags {
                bad_exit: false,
                exit: false,
                fast: true,
                guard,
                hs_dir: hsdir,
                running: true,
                stable: true,
                v2_dir: hsdir,
                valid: true,
            },
        };
        let descriptor = ServerDescriptor {
            ntor_onion_key: [seed; 32],
            master_key: Some([seed; 32]),
        };
        (entry, descriptor)
    }

    pub(crate) fn test_directory(relay_count: u8) -> Directory<MemoryBlockStore> {
        let mut relays = Vec::new();
        let mut descriptors = HashMap::new();
        for seed in 1..=relay_count {
            let (entry, desc) = test_relay(seed, seed % 2 == 1, true);
            descriptors.insert(entry.identity, desc);
            relays.push(entry);
        }

        let doc = ConsensusDocument {
            consensus: NetworkConsensus {
                method: 28,
                valid_after: 1_785_585_600,
                fresh_until: 1_785_589_200,
                valid_until: 1_785_596_400,
                hsdir_interval: 1440,
                hsdir_n_replicas: 2,
                hsdir_spread_store: 4,
                previous_shared_rand: [1; 32],
                shared_rand: [2; 32],
            },
            relays,
        };

        let mut dir = Directory::new(
            "127.0.0.1:7000".parse().unwrap(),
            MemoryBlockStore::new(4096 * hsdir_index::SLOT_SIZE as usize),
            Box::new(MemoryBlobStore::new()),
        )
        .unwrap();
        dir.install_consensus(doc, &descriptors).unwrap();
        dir
    }

    #[test]
    fn test_install_populates_index() {
        let dir = test_directory(10);
        assert_eq!(dir.relay_count(), 10);
        assert_eq!(dir.index.len(), 10);
    }

    #[test]
    fn test_select_path_is_distinct_and_suitable() {
        let mut dir = test_directory(12);
        let now = 1_785_585_700;
        let path = dir.select_path(3, &[], now).unwrap();
        assert_eq!(path.len(), 3);
        assert!(path.iter().all(|r| r.suitable));
        assert_ne!(path[0].identity, path[1].identity);
        assert_ne!(path[1].identity, path[2].identity);
        assert!(path[0].can_guard);
    }

    #[test]
    fn test_guard_is_persisted_and_reused() {
        let mut dir = test_directory(12);
        let now = 1_785_585_700;
        let first = dir.select_path(3, &[], now).unwrap();
        let second = dir.select_path(3, &[], now).unwrap();
        assert_eq!(first[0].identity, second[0].identity);
        assert!(dir.guards.contains(&first[0].identity));
    }

    #[test]
    fn test_exclusion_respected() {
        let mut dir = test_directory(8);
        let now = 1_785_585_700;
        let excluded = [[3u8; 20], [4u8; 20]];
        for _ in 0..10 {
            let path = dir.select_path(3, &excluded, now).unwrap();
            assert!(path.iter().all(|r| !excluded.contains(&r.identity)));
        }
    }

    #[test]
    fn test_selection_requires_enough_relays() {
        let mut dir = test_directory(2);
        let now = 1_785_585_700;
        assert!(matches!(
            dir.select_path(3, &[], now),
            Err(TorError::NoSuitableRelays(_))
        ));
    }

    #[test]
    fn test_stale_directory_blocks_selection() {
        let mut dir = test_directory(8);
        let past_valid_until = 1_785_596_400;
        assert!(matches!(
            dir.select_path(3, &[], past_valid_until),
            Err(TorError::StaleDirectory)
        ));
    }

    #[test]
    fn test_refresh_boundary_and_backoff() {
        let mut dir = test_directory(4);
        assert!(!dir.needs_refresh(1_785_589_199));
        assert!(dir.needs_refresh(1_785_589_200));

        dir.note_refresh_failure();
        dir.note_refresh_failure();
        assert_eq!(dir.refresh_delay(0), 4);
        for _ in 0..10 {
            dir.note_refresh_failure();
        }
        assert_eq!(dir.refresh_delay(0), REFRESH_BACKOFF_CAP_SECS);
    }

    #[test]
    fn test_hsdir_placement_deterministic() {
        let mut dir = test_directory(10);
        let target = [0x80u8; 32];
        let a = dir.hsdirs_for(&target, Period::Current, 4, &[]).unwrap();
        let b = dir.hsdirs_for(&target, Period::Current, 4, &[]).unwrap();
        assert_eq!(a.len(), 4);
        let ids_a: Vec<_> = a.iter().map(|r| r.identity).collect();
        let ids_b: Vec<_> = b.iter().map(|r| r.identity).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_http_response_parsing() {
        let ok = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nbody here";
        assert_eq!(parse_http_response(ok).unwrap(), "body here");

        let not_found = b"HTTP/1.0 404 Not Found\r\n\r\n";
        assert!(parse_http_response(not_found).is_err());
        assert!(parse_http_response(b"garbage").is_err());
    }
}
