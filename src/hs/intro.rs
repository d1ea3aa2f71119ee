//! Introduction points
//!
//! Key material for one introduction circuit, the ESTABLISH_INTRO cell and
//! the verification and decryption of incoming INTRODUCE2 cells.

use crate::crypto::{
    shake256, tor_mac, HS_PROTOID, HS_PROTOID_EXPAND, HS_PROTOID_KEY,
};
use crate::error::{Result, TorError};
use crate::protocol::hs_cell::{
    pack_establish_intro, Introduce2Body, IntroducePlaintext, AUTH_KEY_TYPE_EDSHA3,
    ESTABLISH_INTRO_SIG_PREFIX,
};
use crate::protocol::relay_cell::{RelayCell, RelayCommand};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Per-introduction-point keys: an ed25519 auth key the service advertises
/// in its descriptor and a curve25519 key clients encrypt INTRODUCE
/// payloads to.
pub struct IntroCrypto {
    pub auth_key: SigningKey,
    enc_secret: StaticSecret,
    pub enc_public: [u8; 32],
    /// Set once the intro point answered with INTRO_ESTABLISHED.
    pub established: bool,
}

impl IntroCrypto {
    pub fn generate() -> Self {
        let auth_key = SigningKey::generate(&mut OsRng);
        let enc_secret = StaticSecret::random_from_rng(OsRng);
        let enc_public = PublicKey::from(&enc_secret).to_bytes();
        Self {
            auth_key,
            enc_secret,
            enc_public,
            established: false,
        }
    }

    /// Build from fixed secrets (tests).
    pub fn from_secrets(auth_seed: [u8; 32], enc_seed: [u8; 32]) -> Self {
        let auth_key = SigningKey::from_bytes(&auth_seed);
        let enc_secret = StaticSecret::from(enc_seed);
        let enc_public = PublicKey::from(&enc_secret).to_bytes();
        Self {
            auth_key,
            enc_secret,
            enc_public,
            established: false,
        }
    }

    pub(crate) fn enc_shared_secret(&self, peer: &[u8; 32]) -> [u8; 32]
    {
        self.enc_secret
            .diffie_hellman(&PublicKey::from(*peer))
            .to_bytes()
    }

    /// The ESTABLISH_INTRO relay cell for this intro point. The MAC is
    /// keyed by the introduction hop's ntor nonce; the signature binds the
    /// cell to the auth key.
    pub fn establish_intro_cell(&self, hop_nonce: &[u8; 20]) -> RelayCell {
        let auth_pub = self.auth_key.verifying_key().to_bytes();
        let body = pack_establish_intro(
            &auth_pub,
            |covered| tor_mac(hop_nonce, covered),
            |prefixed| self.auth_key.sign(prefixed).to_bytes(),
        );
        RelayCell::new(RelayCommand::EstablishIntro, 0, body)
    }
}

/// Verify an INTRODUCE2 body against this intro point and decrypt its
/// payload, trying the current then the previous subcredential.
///
/// The MAC is checked before any plaintext is touched; failure with both
/// subcredentials is a silent drop.
pub fn verify_and_decrypt_introduce2(
    body: &Introduce2Body,
    intro: &IntroCrypto,
    subcredentials: &[[u8; 32]],
) -> Result<IntroducePlaintext> {
    if body.auth_key_type != AUTH_KEY_TYPE_EDSHA3 || body.auth_key_len != 32 {
        return Err(TorError::Protocol("INTRODUCE2 auth key type".into()));
    }
    if body.auth_key != intro.auth_key.verifying_key().to_bytes() {
        return Err(TorError::Protocol("INTRODUCE2 auth key mismatch".into()));
    }

    // intro_secret_hs_input = EXP(X,b) || AUTH_KEY || X || B || PROTOID
    let shared = intro.enc_shared_secret(&body.client_pk);
    let mut intro_secret = Vec::with_capacity(32 * 4 + HS_PROTOID.len());
    intro_secret.extend_from_slice(&shared);
    intro_secret.extend_from_slice(&body.auth_key);
    intro_secret.extend_from_slice(&body.client_pk);
    intro_secret.extend_from_slice(&intro.enc_public);
    intro_secret.extend_from_slice(HS_PROTOID);

    for subcredential in subcredentials {
        // hs_keys = SHAKE-256(intro_secret || t_hsenc || m_hsexpand || subcred)
        let mut hs_keys = [0u8; 64];
        shake256(
            &[&intro_secret, HS_PROTOID_KEY, HS_PROTOID_EXPAND, subcredential],
            &mut hs_keys,
        );

        let mac = tor_mac(&hs_keys[32..64], &body.mac_input);
        let matches: bool = mac[..].ct_eq(&body.mac[..]).into();
        if !matches {
            hs_keys.zeroize();
            continue;
        }

        let mut enc_key = [0u8; 32];
        enc_key.copy_from_slice(&hs_keys[0..32]);
        let mut plaintext = body.encrypted.clone();
        let zero_iv = [0u8; 16];
        let mut cipher = Aes256Ctr::new((&enc_key).into(), (&zero_iv).into());
        cipher.apply_keystream(&mut plaintext);
        enc_key.zeroize();
        hs_keys.zeroize();

        return IntroducePlaintext::parse(&plaintext);
    }

    Err(TorError::StaleIntroduction)
}

/// The client half of the INTRODUCE encryption, used by tests to craft
/// valid INTRODUCE2 cells.
pub fn encrypt_introduce_plaintext(
    plaintext: &IntroducePlaintext,
    client_secret: &StaticSecret,
    intro_auth_key: &[u8; 32],
    intro_enc_public: &[u8; 32],
    subcredential: &[u8; 32],
) -> Vec<u8> {
    let client_public = PublicKey::from(client_secret).to_bytes();
    let shared = client_secret
        .diffie_hellman(&PublicKey::from(*intro_enc_public))
        .to_bytes();

    let mut intro_secret = Vec::new();
    intro_secret.extend_from_slice(&shared);
    intro_secret.extend_from_slice(intro_auth_key);
    intro_secret.extend_from_slice(&client_public);
    intro_secret.extend_from_slice(intro_enc_public);
    intro_secret.extend_from_slice(HS_PROTOID);

    let mut hs_keys = [0u8; 64];
    shake256(
        &[&intro_secret, HS_PROTOID_KEY, HS_PROTOID_EXPAND, subcredential],
        &mut hs_keys,
    );

    let mut enc_key = [0u8; 32];
    enc_key.copy_from_slice(&hs_keys[0..32]);
    let mut encrypted = plaintext.pack();
    let zero_iv = [0u8; 16];
    let mut cipher = Aes256Ctr::new((&enc_key).into(), (&zero_iv).into());
    cipher.apply_keystream(&mut encrypted);

    // Assemble the full INTRODUCE2 body with its MAC.
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 20]); // legacy key id
    body.push(AUTH_KEY_TYPE_EDSHA3);
    body.extend_from_slice(&32u16.to_be_bytes());
    body.extend_from_slice(intro_auth_key);
    body.push(0); // no extensions
    body.extend_from_slice(&client_public);
    body.extend_from_slice(&encrypted);
    let mac = tor_mac(&hs_keys[32..64], &body);
    body.extend_from_slice(&mac);
    body
}

/// Signature check a relay would perform on ESTABLISH_INTRO, used by
/// tests to validate the cell.
pub fn check_establish_intro(body: &[u8], hop_nonce: &[u8; 20]) -> Result<[u8; 32]> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    if body.len() < 3 + 32 + 1 + 32 + 2 + 64 {
        return Err(TorError::Protocol("ESTABLISH_INTRO too short".into()));
    }
    let auth_key: [u8; 32] = body[3..35].try_into().unwrap();
    let mac: [u8; 32] = body[36..68].try_into().unwrap();
    let sig: [u8; 64] = body[70..134].try_into().unwrap();

    let expected_mac = tor_mac(hop_nonce, &body[..36]);
    if expected_mac != mac {
        return Err(TorError::Protocol("ESTABLISH_INTRO MAC mismatch".into()));
    }

    let mut signed = Vec::new();
    signed.extend_from_slice(ESTABLISH_INTRO_SIG_PREFIX);
    signed.extend_from_slice(&body[..68]);
    let key = VerifyingKey::from_bytes(&auth_key)
        .map_err(|_| TorError::Crypto("bad auth key".into()))?;
    key.verify(&signed, &Signature::from_bytes(&sig))
        .map_err(|_| TorError::Protocol("ESTABLISH_INTRO signature invalid".into()))?;
    Ok(auth_key)
}
