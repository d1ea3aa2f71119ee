//! Hidden-service relay cell bodies
//!
//! Pure pack/unpack for ESTABLISH_INTRO (v1, ed25519), INTRODUCE2 and
//! RENDEZVOUS1. The cryptographic verification and key derivation around
//! these bodies lives in the `hs` module; this file only knows the byte
//! layouts from rend-spec-v3.

use crate::error::{Result, TorError};

use super::relay_cell::LinkSpecifier;

/// AUTH_KEY_TYPE for an ed25519 key hashed with SHA3-256.
pub const AUTH_KEY_TYPE_EDSHA3: u8 = 2;

/// ONION_KEY_TYPE for an ntor curve25519 key.
pub const ONION_KEY_TYPE_NTOR: u8 = 1;

/// Signature prefix for ESTABLISH_INTRO.
pub const ESTABLISH_INTRO_SIG_PREFIX: &[u8] = b"Tor establish-intro cell v1";

/// ESTABLISH_INTRO body with the MAC and signature already filled in.
///
/// Layout: `AUTH_KEY_TYPE(1) || AUTH_KEY_LEN(2) || AUTH_KEY(32) ||
/// N_EXTENSIONS(1) || HANDSHAKE_AUTH(32) || SIG_LEN(2) || SIG(64)`.
/// The handshake MAC covers the bytes through N_EXTENSIONS and is keyed by
/// the introduction hop's ntor nonce; `sign` receives the prefixed body
/// through the MAC.
pub fn pack_establish_intro(
    auth_key: &[u8; 32],
    mac: impl FnOnce(&[u8]) -> [u8; 32],
    sign: impl FnOnce(&[u8]) -> [u8; 64],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(3 + 32 + 1 + 32 + 2 + 64);
    body.push(AUTH_KEY_TYPE_EDSHA3);
    body.extend_from_slice(&32u16.to_be_bytes());
    body.extend_from_slice(auth_key);
    body.push(0); // N_EXTENSIONS

    let handshake_auth = mac(&body);
    body.extend_from_slice(&handshake_auth);

    let mut to_sign = Vec::with_capacity(ESTABLISH_INTRO_SIG_PREFIX.len() + body.len());
    to_sign.extend_from_slice(ESTABLISH_INTRO_SIG_PREFIX);
    to_sign.extend_from_slice(&body);
    let signature = sign(&to_sign);

    body.extend_from_slice(&64u16.to_be_bytes());
    body.extend_from_slice(&signature);
    body
}

/// Parsed INTRODUCE2 body.
#[derive(Debug, Clone)]
pub struct Introduce2Body {
    pub legacy_key_id: [u8; 20],
    pub auth_key_type: u8,
    pub auth_key_len: u16,
    pub auth_key: [u8; 32],
    pub client_pk: [u8; 32],
    /// The encrypted section (decrypted in place by the service).
    pub encrypted: Vec<u8>,
    pub mac: [u8; 32],
    /// Everything the MAC covers: the body up to but excluding the MAC.
    pub mac_input: Vec<u8>,
}

impl Introduce2Body {
    pub fn parse(data: &[u8]) -> Result<Self> {
        // legacy_key_id(20) + type(1) + len(2) + key(32) + n_ext(1) + pk(32)
        // + at least one encrypted byte + mac(32)
        if data.len() < 20 + 1 + 2 + 32 + 1 + 32 + 1 + 32 {
            return Err(TorError::Protocol("INTRODUCE2 too short".into()));
        }

        let mut legacy_key_id = [0u8; 20];
        legacy_key_id.copy_from_slice(&data[0..20]);
        let auth_key_type = data[20];
        let auth_key_len = u16::from_be_bytes([data[21], data[22]]);
        if auth_key_len != 32 {
            return Err(TorError::Protocol("INTRODUCE2 auth key length".into()));
        }
        let mut auth_key = [0u8; 32];
        auth_key.copy_from_slice(&data[23..55]);

        let n_extensions = data[55];
        let mut pos = 56;
        for _ in 0..n_extensions {
            if pos + 2 > data.len() {
                return Err(TorError::Protocol("INTRODUCE2 extension truncated".into()));
            }
            let ext_len = data[pos + 1] as usize;
            pos += 2 + ext_len;
        }

        if pos + 32 + 1 + 32 > data.len() {
            return Err(TorError::Protocol("INTRODUCE2 truncated".into()));
        }
        let mut client_pk = [0u8; 32];
        client_pk.copy_from_slice(&data[pos..pos + 32]);
        pos += 32;

        let mac_start = data.len() - 32;
        if mac_start <= pos {
            return Err(TorError::Protocol("INTRODUCE2 missing encrypted data".into()));
        }
        let encrypted = data[pos..mac_start].to_vec();
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&data[mac_start..]);

        Ok(Self {
            legacy_key_id,
            auth_key_type,
            auth_key_len,
            auth_key,
            client_pk,
            encrypted,
            mac,
            mac_input: data[..mac_start].to_vec(),
        })
    }
}

/// Decrypted INTRODUCE2 payload: where to meet the client.
#[derive(Debug, Clone)]
pub struct IntroducePlaintext {
    pub rendezvous_cookie: [u8; 20],
    pub onion_key: [u8; 32],
    pub link_specifiers: Vec<LinkSpecifier>,
}

impl IntroducePlaintext {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 20 + 1 {
            return Err(TorError::Protocol("INTRODUCE2 plaintext too short".into()));
        }
        let mut rendezvous_cookie = [0u8; 20];
        rendezvous_cookie.copy_from_slice(&data[0..20]);

        let n_extensions = data[20];
        let mut pos = 21;
        for _ in 0..n_extensions {
            if pos + 2 > data.len() {
                return Err(TorError::Protocol("plaintext extension truncated".into()));
            }
            let ext_len = data[pos + 1] as usize;
            pos += 2 + ext_len;
        }

        if pos + 1 + 2 > data.len() {
            return Err(TorError::Protocol("plaintext onion key truncated".into()));
        }
        let onion_key_type = data[pos];
        let onion_key_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if onion_key_type != ONION_KEY_TYPE_NTOR || onion_key_len != 32 {
            return Err(TorError::Protocol("unsupported rendezvous onion key".into()));
        }
        if pos + 32 > data.len() {
            return Err(TorError::Protocol("plaintext onion key truncated".into()));
        }
        let mut onion_key = [0u8; 32];
        onion_key.copy_from_slice(&data[pos..pos + 32]);
        pos += 32;

        let (link_specifiers, _) = LinkSpecifier::parse_list(&data[pos..])?;
        if link_specifiers.is_empty() {
            return Err(TorError::Protocol("no rendezvous link specifiers".into()));
        }

        Ok(Self {
            rendezvous_cookie,
            onion_key,
            link_specifiers,
        })
    }

    /// Pack (used by tests to craft INTRODUCE2 cells).
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.rendezvous_cookie);
        buf.push(0);
        buf.push(ONION_KEY_TYPE_NTOR);
        buf.extend_from_slice(&32u16.to_be_bytes());
        buf.extend_from_slice(&self.onion_key);
        buf.extend_from_slice(&LinkSpecifier::pack_list(&self.link_specifiers));
        buf
    }
}

/// RENDEZVOUS1 body: `COOKIE(20) || Y(32) || AUTH_INPUT_MAC(32)`.
pub fn pack_rendezvous1(cookie: &[u8; 20], server_pk: &[u8; 32], auth_mac: &[u8; 32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(84);
    buf.extend_from_slice(cookie);
    buf.extend_from_slice(server_pk);
    buf.extend_from_slice(auth_mac);
    buf
}
