//! ntor handshake implementation
//!
//! Implements the ntor key exchange used for CREATE2 and EXTEND2, based on
//! X25519 Diffie-Hellman with HMAC-SHA256 key extraction.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html
//!
//! Security: AUTH verification uses a constant-time comparison; the
//! ephemeral secret is zeroized when the handshake is dropped.

use crate::error::{Result, TorError};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use super::relay_crypto::CircuitKeys;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
pub(crate) const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Client side of one ntor handshake.
pub struct NtorHandshake {
    /// Our ephemeral secret; StaticSecret zeroizes on drop.
    client_secret: StaticSecret,
    client_public: PublicKey,
}

impl NtorHandshake {
    pub fn new() -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
        }
    }

    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// CREATE2/EXTEND2 handshake data: `ID(20) || B(32) || X(32)`.
    pub fn handshake_data(
        &self,
        relay_identity: &[u8; 20],
        relay_onion_key: &PublicKey,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(84);
        data.extend_from_slice(relay_identity);
        data.extend_from_slice(relay_onion_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Complete the handshake with the relay's CREATED2/EXTENDED2 reply and
    /// derive the per-hop circuit keys.
    ///
    /// Tor spec: `secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y |
    /// PROTOID`, AUTH verified against
    /// `H(verify | ID | B | Y | X | PROTOID | "Server", t_mac)`.
    pub fn complete(
        self,
        relay_identity: &[u8; 20],
        relay_onion_key: &PublicKey,
        server_public: &PublicKey,
        server_auth: &[u8; 32],
    ) -> Result<CircuitKeys> {
        let shared_yx = self.client_secret.diffie_hellman(server_public);
        let shared_bx = self.client_secret.diffie_hellman(relay_onion_key);

        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(relay_identity);
        secret_input.extend_from_slice(relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);

        let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(relay_identity);
        auth_input.extend_from_slice(relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_sha256(T_MAC, &auth_input);

        let auth_valid: bool = computed_auth[..].ct_eq(&server_auth[..]).into();
        if !auth_valid {
            log::warn!("ntor server AUTH verification failed");
            return Err(TorError::AuthMismatch);
        }

        CircuitKeys::derive_from_seed(&key_seed)
    }
}

impl Default for NtorHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a CREATED2/EXTENDED2 server handshake: `Y(32) || AUTH(32)`.
pub fn parse_server_handshake(data: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if data.len() < 64 {
        return Err(TorError::Protocol("ntor reply too short".into()));
    }
    let mut server_public = [0u8; 32];
    server_public.copy_from_slice(&data[0..32]);
    let mut server_auth = [0u8; 32];
    server_auth.copy_from_slice(&data[32..64]);
    Ok((PublicKey::from(server_public), server_auth))
}
