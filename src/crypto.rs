//! Shared cryptographic helpers
//!
//! The hidden-service protocol leans on a small set of SHA3-based
//! constructions that several modules share: the Tor MAC, SHAKE-256 key
//! expansion, per-period key blinding and the onion address codec. They are
//! collected here so the circuit and hidden-service code can stay focused
//! on protocol flow.
//!
//! Security: blinded key material lives in an `ExpandedSecretKey` and is
//! zeroized when dropped.

use crate::error::{Result, TorError};
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};

/// Protocol id for the hidden-service ntor variant (rend-spec-v3).
pub const HS_PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
pub const HS_PROTOID_KEY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
pub const HS_PROTOID_VERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
pub const HS_PROTOID_MAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
pub const HS_PROTOID_EXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// The ed25519 basepoint as rend-spec-v3 spells it into the blinding hash.
pub const ED_BASEPOINT_STR: &[u8] =
    b"(15112221349535400772501151409588531511454012693041857206046113283949847762202, \
46316835694926478169428394003475163141307993866256225615783033603165251855960)";

/// SHA3-256 over a sequence of byte slices.
pub fn sha3_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// Tor's MAC construction: `SHA3-256(int64_be(len(key)) || key || message)`.
pub fn tor_mac(key: &[u8], message: &[u8]) -> [u8; 32] {
    sha3_256(&[&(key.len() as u64).to_be_bytes(), key, message])
}

/// SHAKE-256 expansion of concatenated inputs into `out`.
pub fn shake256(parts: &[&[u8]], out: &mut [u8]) {
    let mut shake = Shake256::default();
    for part in parts {
        shake.update(part);
    }
    shake.finalize_xof().read(out);
}

/// `credential = SHA3-256("credential" || A)`
pub fn credential(master_pub: &[u8; 32]) -> [u8; 32] {
    sha3_256(&[b"credential", master_pub])
}

/// `subcredential = SHA3-256("subcredential" || credential || A_blinded)`
pub fn subcredential(credential: &[u8; 32], blinded_pub: &[u8; 32]) -> [u8; 32] {
    sha3_256(&[b"subcredential", credential, blinded_pub])
}

/// Version byte of v3 onion addresses.
const ONION_VERSION: u8 = 0x03;

fn onion_checksum(pubkey: &[u8; 32]) -> [u8; 2] {
    let sum = sha3_256(&[b".onion checksum", pubkey, &[ONION_VERSION]]);
    [sum[0], sum[1]]
}

/// Encode a service public key as `<base32(pub || checksum || version)>.onion`.
pub fn onion_address(pubkey: &[u8; 32]) -> String {
    let mut raw = [0u8; 35];
    raw[..32].copy_from_slice(pubkey);
    raw[32..34].copy_from_slice(&onion_checksum(pubkey));
    raw[34] = ONION_VERSION;

    let mut address = data_encoding::BASE32_NOPAD.encode(&raw).to_lowercase();
    address.push_str(".onion");
    address
}

/// Decode and validate a v3 onion hostname back into its public key.
pub fn decode_onion_address(hostname: &str) -> Result<[u8; 32]> {
    let label = hostname
        .strip_suffix(".onion")
        .ok_or_else(|| TorError::Protocol("hostname missing .onion suffix".into()))?;
    let raw = data_encoding::BASE32_NOPAD
        .decode(label.to_uppercase().as_bytes())
        .map_err(|_| TorError::Protocol("hostname is not base32".into()))?;
    if raw.len() != 35 || raw[34] != ONION_VERSION {
        return Err(TorError::Protocol("hostname has wrong length or version".into()));
    }

    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(&raw[..32]);
    if raw[32..34] != onion_checksum(&pubkey) {
        return Err(TorError::Protocol("hostname checksum mismatch".into()));
    }
    Ok(pubkey)
}

/// A per-period blinded signing key derived from the service master key.
pub struct BlindedKey {
    expanded: ExpandedSecretKey,
    verifying: VerifyingKey,
}

impl BlindedKey {
    /// Derive the blinded key for `(period, interval)`.
    ///
    /// rend-spec-v3 A.2: the blinding parameter is
    /// `SHA3-256(BLIND_STRING || A || B || "key-blind" || INT_8(period) ||
    /// INT_8(interval))` clamped like an ed25519 scalar; the blinded secret
    /// is the clamped master scalar times the parameter mod ℓ, and the
    /// prefix is rehashed so signatures stay deterministic.
    pub fn derive(master: &SigningKey, period: u64, interval: u64) -> Result<Self> {
        let master_expanded = ExpandedSecretKey::from(&master.to_bytes());
        let master_pub = master.verifying_key();

        let mut param = sha3_256(&[
            b"Derive temporary signing key\0",
            master_pub.as_bytes(),
            ED_BASEPOINT_STR,
            b"key-blind",
            &period.to_be_bytes(),
            &interval.to_be_bytes(),
        ]);
        param = clamp_integer(param);

        let blinded_scalar = master_expanded.scalar * Scalar::from_bytes_mod_order(param);

        let mut prefix_hasher = sha2::Sha512::new();
        sha2::Digest::update(&mut prefix_hasher, b"Derive temporary signing key hash input");
        sha2::Digest::update(&mut prefix_hasher, master_expanded.hash_prefix);
        let prefix_full: [u8; 64] = sha2::Digest::finalize(prefix_hasher).into();
        let mut hash_prefix = [0u8; 32];
        hash_prefix.copy_from_slice(&prefix_full[..32]);

        let point = EdwardsPoint::mul_base(&blinded_scalar);
        let verifying = VerifyingKey::from_bytes(&point.compress().to_bytes())
            .map_err(|e| TorError::Crypto(format!("blinded key invalid: {}", e)))?;

        Ok(Self {
            expanded: ExpandedSecretKey {
                scalar: blinded_scalar,
                hash_prefix,
            },
            verifying,
        })
    }

    pub fn public(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    /// Sign a message under the blinded key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        raw_sign::<sha2::Sha512>(&self.expanded, message, &self.verifying)
    }
}

/// Convert a curve25519 public key to the equivalent ed25519 public key
/// (Montgomery u to Edwards y) with the given sign bit.
pub fn ed_pubkey_from_curve_pubkey(curve_pub: &[u8; 32], sign_bit: u8) -> Result<[u8; 32]> {
    let edwards = MontgomeryPoint(*curve_pub)
        .to_edwards(sign_bit)
        .ok_or_else(|| TorError::Crypto("curve25519 key not convertible".into()))?;
    Ok(edwards.compress().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn test_tor_mac_includes_key_length() {
        let a = tor_mac(b"key", b"message");
        let b = tor_mac(b"ke", b"ymessage");
        assert_ne!(a, b);
    }

    #[test]
    fn test_onion_address_roundtrip() {
        let pubkey = [0x42u8; 32];
        let address = onion_address(&pubkey);
        assert_eq!(address.len(), 56 + 6);
        assert!(address.ends_with(".onion"));
        assert_eq!(address, address.to_lowercase());

        let decoded = decode_onion_address(&address).unwrap();
        assert_eq!(decoded, pubkey);
    }

    #[test]
    fn test_onion_address_rejects_corruption() {
        let address = onion_address(&[7u8; 32]);
        let mut corrupted = address.clone();
        // flip one base32 character
        let replacement = if corrupted.starts_with('a') { 'b' } else { 'a' };
        corrupted.replace_range(0..1, &replacement.to_string());
        assert!(decode_onion_address(&corrupted).is_err());
        assert!(decode_onion_address("tooshort.onion").is_err());
        assert!(decode_onion_address("nosuffix").is_err());
    }

    #[test]
    fn test_blinded_key_deterministic_and_valid() {
        let master = SigningKey::from_bytes(&[9u8; 32]);
        let a = BlindedKey::derive(&master, 19000, 1440).unwrap();
        let b = BlindedKey::derive(&master, 19000, 1440).unwrap();
        assert_eq!(a.public(), b.public());

        let c = BlindedKey::derive(&master, 19001, 1440).unwrap();
        assert_ne!(a.public(), c.public());

        // blinded public key differs from the master key
        assert_ne!(a.public(), master.verifying_key().to_bytes());

        // signatures under the blinded key verify against the blinded public
        let sig = a.sign(b"descriptor body");
        let vk = VerifyingKey::from_bytes(&a.public()).unwrap();
        vk.verify(b"descriptor body", &sig).unwrap();
    }

    #[test]
    fn test_subcredential_binds_both_keys() {
        let cred = credential(&[1u8; 32]);
        let sub_a = subcredential(&cred, &[2u8; 32]);
        let sub_b = subcredential(&cred, &[3u8; 32]);
        assert_ne!(sub_a, sub_b);
    }

    #[test]
    fn test_curve_to_ed_conversion() {
        // The curve25519 basepoint (u = 9) converts to the ed25519 basepoint.
        let mut basepoint = [0u8; 32];
        basepoint[0] = 9;
        let ed = ed_pubkey_from_curve_pubkey(&basepoint, 0).unwrap();
        assert_eq!(
            ed,
            curve25519_dalek::constants::ED25519_BASEPOINT_POINT
                .compress()
                .to_bytes()
        );
    }
}
