//! Hidden services
//!
//! The control plane (keys, descriptors, introduction points, publication)
//! and the per-service state the core task owns: intro and rendezvous
//! circuit sets, the replay cache and the local stream table.

pub mod descriptor;
pub mod intro;
pub mod keys;
pub mod publish;
pub mod rend;

use crate::error::Result;
use ed25519_dalek::SigningKey;
use keys::{PeriodKeys, ServiceIdentity};
use rand::rngs::OsRng;
use std::collections::{HashMap, VecDeque};
use tokio::net::tcp::OwnedWriteHalf;

/// Introduction points a service keeps alive.
pub const INTRO_POINT_COUNT: usize = 3;

/// Bound on the rendezvous-cookie replay cache.
pub const REPLAY_CACHE_CAPACITY: usize = 128;

/// One hidden service: identity, per-period credentials and the live
/// circuit/stream bookkeeping. Circuits themselves are owned by the core;
/// the service holds only their ids.
pub struct OnionService {
    pub local_port: u16,
    pub exit_port: u16,
    pub identity: ServiceIdentity,
    /// Fresh per publication cycle; crosscertified by the blinded key.
    pub descriptor_signing: SigningKey,
    pub current_subcredential: [u8; 32],
    pub previous_subcredential: [u8; 32],
    /// Time period the current descriptors were published for.
    pub published_period: u64,
    pub revision: u64,
    pub intro_circuits: Vec<u32>,
    pub rend_circuits: Vec<u32>,
    recent_cookies: VecDeque<[u8; 20]>,
    streams: HashMap<(u32, u16), OwnedWriteHalf>,
}

impl OnionService {
    pub fn new(identity: ServiceIdentity, local_port: u16, exit_port: u16) -> Self {
        Self {
            local_port,
            exit_port,
            identity,
            descriptor_signing: SigningKey::generate(&mut OsRng),
            current_subcredential: [0; 32],
            previous_subcredential: [0; 32],
            published_period: 0,
            revision: 0,
            intro_circuits: Vec::new(),
            rend_circuits: Vec::new(),
            recent_cookies: VecDeque::new(),
            streams: HashMap::new(),
        }
    }

    /// Derive and store the credentials for a period pair; returns the
    /// period keys for (current, previous).
    pub fn roll_period(&mut self, period: u64, interval: u64) -> Result<(PeriodKeys, PeriodKeys)> {
        let current = PeriodKeys::derive(&self.identity.master, period, interval)?;
        let previous =
            PeriodKeys::derive(&self.identity.master, period.saturating_sub(1), interval)?;
        self.current_subcredential = current.subcredential;
        self.previous_subcredential = previous.subcredential;
        self.published_period = period;
        self.descriptor_signing = SigningKey::generate(&mut OsRng);
        Ok((current, previous))
    }

    /// Subcredentials in trial order for INTRODUCE2 decryption.
    pub fn subcredentials(&self) -> [[u8; 32]; 2] {
        [self.current_subcredential, self.previous_subcredential]
    }

    /// Replay suppression: true if the cookie was seen before; otherwise
    /// records it, evicting the oldest entry once the cache is full.
    pub fn seen_cookie(&mut self, cookie: &[u8; 20]) -> bool {
        if self.recent_cookies.contains(cookie) {
            return true;
        }
        if self.recent_cookies.len() == REPLAY_CACHE_CAPACITY {
            self.recent_cookies.pop_front();
        }
        self.recent_cookies.push_back(*cookie);
        false
    }

    pub fn register_stream(&mut self, circ_id: u32, stream_id: u16, writer: OwnedWriteHalf) {
        self.streams.insert((circ_id, stream_id), writer);
    }

    pub fn stream_mut(&mut self, circ_id: u32, stream_id: u16) -> Option<&mut OwnedWriteHalf> {
        self.streams.get_mut(&(circ_id, stream_id))
    }

    /// Drop a stream; closing the write half signals EOF to the local app.
    pub fn close_stream(&mut self, circ_id: u32, stream_id: u16) {
        self.streams.remove(&(circ_id, stream_id));
    }

    pub fn owns_circuit(&self, circ_id: u32) -> bool {
        self.intro_circuits.contains(&circ_id) || self.rend_circuits.contains(&circ_id)
    }

    /// Forget a circuit and all streams riding on it.
    pub fn remove_circuit(&mut self, circ_id: u32) {
        self.intro_circuits.retain(|&id| id != circ_id);
        self.rend_circuits.retain(|&id| id != circ_id);
        self.streams.retain(|(id, _), _| *id != circ_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> OnionService {
        OnionService::new(ServiceIdentity::from_seed([1; 32]), 8080, 80)
    }

    #[test]
    fn test_roll_period_sets_credentials() {
        let mut svc = service();
        let (current, previous) = svc.roll_period(19000, 1440).unwrap();
        assert_eq!(svc.current_subcredential, current.subcredential);
        assert_eq!(svc.previous_subcredential, previous.subcredential);
        assert_ne!(svc.current_subcredential, svc.previous_subcredential);
        assert_eq!(svc.published_period, 19000);
    }

    #[test]
    fn test_replay_cache_suppresses_duplicates() {
        let mut svc = service();
        let cookie = [7u8; 20];
        assert!(!svc.seen_cookie(&cookie));
        assert!(svc.seen_cookie(&cookie));
    }

    #[test]
    fn test_replay_cache_is_bounded() {
        let mut svc = service();
        for i in 0..REPLAY_CACHE_CAPACITY {
            let mut cookie = [0u8; 20];
            cookie[..8].copy_from_slice(&(i as u64).to_be_bytes());
            assert!(!svc.seen_cookie(&cookie));
        }
        // One more evicts the oldest entry.
        assert!(!svc.seen_cookie(&[0xFF; 20]));
        let mut oldest = [0u8; 20];
        oldest[..8].copy_from_slice(&0u64.to_be_bytes());
        assert!(!svc.seen_cookie(&oldest));
    }

    #[test]
    fn test_remove_circuit_cleans_up() {
        let mut svc = service();
        svc.intro_circuits.push(0x8000_0001);
        svc.rend_circuits.push(0x8000_0002);
        assert!(svc.owns_circuit(0x8000_0001));
        svc.remove_circuit(0x8000_0001);
        svc.remove_circuit(0x8000_0002);
        assert!(!svc.owns_circuit(0x8000_0001));
        assert!(svc.rend_circuits.is_empty());
    }
}
