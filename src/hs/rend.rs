//! Rendezvous handshake
//!
//! Completes the service side of the hs-ntor handshake after a verified
//! INTRODUCE2: derives the rendezvous key seed, the AUTH_INPUT_MAC carried
//! in RENDEZVOUS1 and the end-to-end cell layer.

use crate::crypto::{
    tor_mac, HS_PROTOID, HS_PROTOID_KEY, HS_PROTOID_MAC, HS_PROTOID_VERIFY,
};
use crate::error::Result;
use crate::protocol::hs_cell::pack_rendezvous1;
use crate::protocol::relay_cell::{RelayCell, RelayCommand};
use crate::protocol::relay_crypto::HsCrypto;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use super::intro::IntroCrypto;

/// Outcome of the hs-ntor completion: the end-to-end layer plus what goes
/// into RENDEZVOUS1.
pub struct RendezvousHandshake {
    pub hs_crypto: HsCrypto,
    pub auth_mac: [u8; 32],
    pub server_public: [u8; 32],
    /// NTOR_KEY_SEED, kept so callers can audit the derivation.
    pub key_seed: [u8; 32],
}

/// Complete the hs-ntor handshake with a fresh ephemeral key.
pub fn complete_hs_ntor(intro: &IntroCrypto, client_pk: &[u8; 32]) -> Result<RendezvousHandshake> {
    complete_hs_ntor_with(intro, client_pk, StaticSecret::random_from_rng(OsRng))
}

/// Complete the hs-ntor handshake with a caller-chosen ephemeral key
/// (deterministic tests).
///
/// rend-spec-v3:
/// `rend_secret = EXP(X,y) || EXP(X,b) || AUTH_KEY || B || X || Y || PROTOID`,
/// `NTOR_KEY_SEED = MAC(rend_secret, t_hsenc)`,
/// `verify = MAC(rend_secret, t_hsverify)`,
/// `AUTH_INPUT_MAC = MAC(verify || AUTH_KEY || B || Y || X || PROTOID ||
/// "Server", t_hsmac)`.
pub fn complete_hs_ntor_with(
    intro: &IntroCrypto,
    client_pk: &[u8; 32],
    ephemeral: StaticSecret,
) -> Result<RendezvousHandshake> {
    let client_public = PublicKey::from(*client_pk);
    let server_public = PublicKey::from(&ephemeral).to_bytes();
    let auth_key = intro.auth_key.verifying_key().to_bytes();

    let exp_xy = ephemeral.diffie_hellman(&client_public).to_bytes();
    let exp_xb = intro.enc_shared_secret(client_pk);

    let mut rend_secret = Vec::with_capacity(32 * 6 + HS_PROTOID.len());
    rend_secret.extend_from_slice(&exp_xy);
    rend_secret.extend_from_slice(&exp_xb);
    rend_secret.extend_from_slice(&auth_key);
    rend_secret.extend_from_slice(&intro.enc_public);
    rend_secret.extend_from_slice(client_pk);
    rend_secret.extend_from_slice(&server_public);
    rend_secret.extend_from_slice(HS_PROTOID);

    let key_seed = tor_mac(&rend_secret, HS_PROTOID_KEY);
    let verify = tor_mac(&rend_secret, HS_PROTOID_VERIFY);

    let mut auth_input = Vec::with_capacity(32 * 5 + HS_PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(&auth_key);
    auth_input.extend_from_slice(&intro.enc_public);
    auth_input.extend_from_slice(&server_public);
    auth_input.extend_from_slice(client_pk);
    auth_input.extend_from_slice(HS_PROTOID);
    auth_input.extend_from_slice(b"Server");
    let auth_mac = tor_mac(&auth_input, HS_PROTOID_MAC);

    Ok(RendezvousHandshake {
        hs_crypto: HsCrypto::derive_from_seed(&key_seed),
        auth_mac,
        server_public,
        key_seed,
    })
}

/// The RENDEZVOUS1 relay cell for a completed handshake.
pub fn rendezvous1_cell(cookie: &[u8; 20], handshake: &RendezvousHandshake) -> RelayCell {
    RelayCell::new(
        RelayCommand::Rendezvous1,
        0,
        pack_rendezvous1(cookie, &handshake.server_public, &handshake.auth_mac),
    )
}
