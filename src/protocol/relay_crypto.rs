//! Circuit-layer cryptography
//!
//! Per-hop state for RELAY cells: AES-128-CTR streams and running SHA-1
//! digests in both directions, seeded from the ntor key material. The
//! rendezvous end-to-end layer uses the same shape with SHA3-256 and
//! AES-256-CTR.
//!
//! The onion discipline: an outbound cell updates the target hop's forward
//! digest over the whole 509-byte payload (digest field zeroed), carries the
//! first 4 digest bytes, and is encrypted once per hop. Inbound cells are
//! peeled hop by hop; a hop "recognizes" a cell when the recognized field
//! is zero and a speculative digest over the zeroed digest field matches.
//! Only then is the speculative digest state committed.
//!
//! Security: key material is zeroized on drop.

use crate::crypto::{shake256, HS_PROTOID_EXPAND};
use crate::error::{Result, TorError};
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use sha3::Sha3_256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::cell::Cell;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Key material for one hop, straight out of the ntor KDF.
///
/// `K = HKDF-SHA256(KEY_SEED, m_expand)` split as
/// `Df(20) | Db(20) | Kf(16) | Kb(16) | nonce(20)`; the nonce keys
/// hidden-service MACs on this hop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    pub forward_digest: [u8; 20],
    pub backward_digest: [u8; 20],
    pub forward_key: [u8; 16],
    pub backward_key: [u8; 16],
    pub nonce: [u8; 20],
}

impl CircuitKeys {
    /// Derive circuit keys from KEY_SEED using Tor's KDF.
    ///
    /// KEY_SEED is already the output of HMAC-SHA256, so the HKDF Extract
    /// step is skipped and the seed is used directly as the PRK.
    pub fn derive_from_seed(key_seed: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::Crypto("ntor KEY_SEED has wrong length".into()))?;

        let mut okm = [0u8; 92];
        hkdf.expand(super::ntor::M_EXPAND, &mut okm)
            .map_err(|_| TorError::Crypto("ntor key expansion failed".into()))?;

        let mut keys = CircuitKeys {
            forward_digest: [0; 20],
            backward_digest: [0; 20],
            forward_key: [0; 16],
            backward_key: [0; 16],
            nonce: [0; 20],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        keys.nonce.copy_from_slice(&okm[72..92]);
        okm.zeroize();
        Ok(keys)
    }
}

/// Live per-hop crypto state: running digests and CTR streams.
///
/// The IVs start at zero and each stream is used exactly once per byte in
/// wire order, so the cipher state advances with every cell.
pub struct RelayCrypto {
    forward_digest: Sha1,
    backward_digest: Sha1,
    aes_forward: Aes128Ctr,
    aes_backward: Aes128Ctr,
    pub nonce: [u8; 20],
}

impl RelayCrypto {
    pub fn new(keys: &CircuitKeys) -> Self {
        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);

        let zero_iv = [0u8; 16];
        Self {
            forward_digest,
            backward_digest,
            aes_forward: Aes128Ctr::new((&keys.forward_key).into(), (&zero_iv).into()),
            aes_backward: Aes128Ctr::new((&keys.backward_key).into(), (&zero_iv).into()),
            nonce: keys.nonce,
        }
    }
}

impl Drop for RelayCrypto {
    fn drop(&mut self) {
        self.nonce.zeroize();
    }
}

/// Rendezvous end-to-end layer: SHA3-256 digests, AES-256-CTR streams.
pub struct HsCrypto {
    forward_digest: Sha3_256,
    backward_digest: Sha3_256,
    aes_forward: Aes256Ctr,
    aes_backward: Aes256Ctr,
}

impl HsCrypto {
    /// Expand the hs-ntor NTOR_KEY_SEED into the end-to-end layer:
    /// `SHAKE-256(seed || m_hsexpand)` into `Df(32) | Db(32) | Kf(32) | Kb(32)`.
    pub fn derive_from_seed(key_seed: &[u8; 32]) -> Self {
        let mut okm = [0u8; 128];
        shake256(&[key_seed, HS_PROTOID_EXPAND], &mut okm);

        let mut forward_digest = Sha3_256::new();
        forward_digest.update(&okm[0..32]);
        let mut backward_digest = Sha3_256::new();
        backward_digest.update(&okm[32..64]);

        let mut forward_key = [0u8; 32];
        forward_key.copy_from_slice(&okm[64..96]);
        let mut backward_key = [0u8; 32];
        backward_key.copy_from_slice(&okm[96..128]);

        let zero_iv = [0u8; 16];
        let hs = Self {
            forward_digest,
            backward_digest,
            aes_forward: Aes256Ctr::new((&forward_key).into(), (&zero_iv).into()),
            aes_backward: Aes256Ctr::new((&backward_key).into(), (&zero_iv).into()),
        };
        okm.zeroize();
        forward_key.zeroize();
        backward_key.zeroize();
        hs
    }
}

/// Which layer recognized an inbound RELAY cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizedLayer {
    /// Hop index from the guard outward.
    Hop(usize),
    /// The rendezvous end-to-end layer.
    Rendezvous,
}

const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

fn digest_matches<D: Digest + Clone>(running: &mut D, payload: &[u8]) -> bool {
    let mut speculative = running.clone();
    speculative.update(&payload[0..5]);
    speculative.update([0u8; 4]);
    speculative.update(&payload[9..]);
    let hash = speculative.clone().finalize();

    if hash[..4] == payload[DIGEST_RANGE] {
        // Commit: the running digest now includes this cell.
        *running = speculative;
        true
    } else {
        false
    }
}

/// Seal an outbound relay payload for the last hop of `hops`: write the
/// running digest and apply every hop's forward stream.
pub fn seal_forward(hops: &mut [&mut RelayCrypto], payload: &mut [u8; Cell::PAYLOAD_SIZE]) {
    let target = hops.len() - 1;
    hops[target].forward_digest.update(&payload[..]);
    let digest = hops[target].forward_digest.clone().finalize();
    payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);

    for hop in hops.iter_mut().rev() {
        hop.aes_forward.apply_keystream(payload);
    }
}

/// Seal an outbound relay payload on a rendezvous circuit: the digest and
/// innermost encryption come from the service side of the end-to-end layer
/// (its "backward" direction), then each hop's forward stream applies.
pub fn seal_forward_hs(
    hops: &mut [&mut RelayCrypto],
    hs: &mut HsCrypto,
    payload: &mut [u8; Cell::PAYLOAD_SIZE],
) {
    hs.backward_digest.update(&payload[..]);
    let digest = hs.backward_digest.clone().finalize();
    payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);

    hs.aes_backward.apply_keystream(payload);
    for hop in hops.iter_mut().rev() {
        hop.aes_forward.apply_keystream(payload);
    }
}

/// Peel an inbound relay payload: decrypt hop by hop from the guard outward
/// until some layer recognizes the cell. With an end-to-end layer present
/// it is tried after every hop failed. Unrecognized everywhere is a
/// protocol violation and fails the circuit.
pub fn open_backward(
    hops: &mut [&mut RelayCrypto],
    hs: Option<&mut HsCrypto>,
    payload: &mut [u8; Cell::PAYLOAD_SIZE],
) -> Result<RecognizedLayer> {
    for (index, hop) in hops.iter_mut().enumerate() {
        hop.aes_backward.apply_keystream(payload);

        if payload[1] == 0
            && payload[2] == 0
            && digest_matches(&mut hop.backward_digest, payload)
        {
            return Ok(RecognizedLayer::Hop(index));
        }
    }

    if let Some(hs) = hs {
        hs.aes_forward.apply_keystream(payload);
        if payload[1] == 0
            && payload[2] == 0
            && digest_matches(&mut hs.forward_digest, payload)
        {
            return Ok(RecognizedLayer::Rendezvous);
        }
    }

    Err(TorError::Unrecognized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay_cell::{RelayCell, RelayCommand};

    fn hop_pair(seed: &[u8; 32]) -> (RelayCrypto, RelayCrypto) {
        let keys = CircuitKeys::derive_from_seed(seed).unwrap();
        // A relay mirrors the originator's state with directions swapped at
        // use time; both ends seed from identical key material.
        (RelayCrypto::new(&keys), RelayCrypto::new(&keys))
    }

    /// A mock relay peels one forward layer and checks recognition the way
    /// a real hop would.
    fn relay_peel_forward(hop: &mut RelayCrypto, payload: &mut [u8; Cell::PAYLOAD_SIZE]) -> bool {
        hop.aes_forward.apply_keystream(payload);
        payload[1] == 0 && payload[2] == 0 && digest_matches(&mut hop.forward_digest, payload)
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let keys = CircuitKeys::derive_from_seed(&[42u8; 32]).unwrap();
        let again = CircuitKeys::derive_from_seed(&[42u8; 32]).unwrap();
        assert_eq!(keys.forward_key, again.forward_key);
        assert_eq!(keys.nonce, again.nonce);
        assert_ne!(keys.forward_key, keys.backward_key);
        assert_ne!(keys.forward_digest, keys.backward_digest);
    }

    #[test]
    fn test_forward_roundtrip_three_hops() {
        let (our_guard, mut relay_guard) = hop_pair(&[1u8; 32]);
        let (our_middle, mut relay_middle) = hop_pair(&[2u8; 32]);
        let (our_exit, mut relay_exit) = hop_pair(&[3u8; 32]);

        let cell = RelayCell::new(RelayCommand::Data, 7, b"hello".to_vec());
        let mut payload = cell.to_payload().unwrap();
        let clear = payload;

        let mut our_hops = vec![our_guard, our_middle, our_exit];
        let mut refs: Vec<&mut RelayCrypto> = our_hops.iter_mut().collect();
        seal_forward(&mut refs, &mut payload);
        assert_ne!(payload, clear);

        // Guard and middle must NOT recognize the cell, the exit must.
        assert!(!relay_peel_forward(&mut relay_guard, &mut payload));
        assert!(!relay_peel_forward(&mut relay_middle, &mut payload));
        assert!(relay_peel_forward(&mut relay_exit, &mut payload));

        let parsed = RelayCell::from_payload(&payload).unwrap();
        assert_eq!(parsed.data, b"hello".to_vec());
    }

    #[test]
    fn test_backward_recognition_at_single_hop() {
        let (mut our, mut relay) = hop_pair(&[9u8; 32]);

        // The relay seals a backward cell the same way we seal forward.
        let cell = RelayCell::new(RelayCommand::Connected, 3, vec![1, 2, 3, 4]);
        let mut payload = cell.to_payload().unwrap();
        relay.backward_digest.update(&payload[..]);
        let digest = relay.backward_digest.clone().finalize();
        payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);
        relay.aes_backward.apply_keystream(&mut payload);

        let mut refs = vec![&mut our];
        let layer = open_backward(&mut refs, None, &mut payload).unwrap();
        assert_eq!(layer, RecognizedLayer::Hop(0));
        let parsed = RelayCell::from_payload(&payload).unwrap();
        assert_eq!(parsed.command, RelayCommand::Connected);
    }

    #[test]
    fn test_unrecognized_cell_is_protocol_violation() {
        let (mut our, _) = hop_pair(&[4u8; 32]);
        let mut refs = vec![&mut our];
        let mut payload = [0xAAu8; Cell::PAYLOAD_SIZE];
        assert!(matches!(
            open_backward(&mut refs, None, &mut payload),
            Err(TorError::Unrecognized)
        ));
    }

    #[test]
    fn test_failed_recognition_leaves_digest_untouched() {
        let (mut our, mut relay) = hop_pair(&[5u8; 32]);

        // Garbage first: must not poison the running digest.
        let mut garbage = [0x55u8; Cell::PAYLOAD_SIZE];
        assert!(open_backward(&mut vec![&mut our], None, &mut garbage).is_err());

        // The relay cipher state advanced past one cell of keystream on our
        // side; resync the mock relay by encrypting a dummy cell.
        let mut dummy = [0u8; Cell::PAYLOAD_SIZE];
        relay.aes_backward.apply_keystream(&mut dummy);

        let cell = RelayCell::new(RelayCommand::Data, 1, b"still fine".to_vec());
        let mut payload = cell.to_payload().unwrap();
        relay.backward_digest.update(&payload[..]);
        let digest = relay.backward_digest.clone().finalize();
        payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);
        relay.aes_backward.apply_keystream(&mut payload);

        let layer = open_backward(&mut vec![&mut our], None, &mut payload).unwrap();
        assert_eq!(layer, RecognizedLayer::Hop(0));
    }

    #[test]
    fn test_hs_layer_roundtrip() {
        let seed = [7u8; 32];
        let mut service = HsCrypto::derive_from_seed(&seed);
        let mut client = HsCrypto::derive_from_seed(&seed);
        let (mut our_hop, mut relay_hop) = hop_pair(&[8u8; 32]);

        // Service -> client: sealed with the service's backward direction.
        let cell = RelayCell::new(RelayCommand::Data, 2, b"rendezvous data".to_vec());
        let mut payload = cell.to_payload().unwrap();
        seal_forward_hs(&mut vec![&mut our_hop], &mut service, &mut payload);

        // The hop peels its layer, does not recognize, forwards to the
        // client, which opens the end-to-end layer with its forward keys.
        assert!(!relay_peel_forward(&mut relay_hop, &mut payload));
        client.aes_backward.apply_keystream(&mut payload);
        assert!(digest_matches(&mut client.backward_digest, &payload));

        let parsed = RelayCell::from_payload(&payload).unwrap();
        assert_eq!(parsed.data, b"rendezvous data".to_vec());
    }
}
