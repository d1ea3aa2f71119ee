//! Hidden-service descriptors
//!
//! Builds the v3 descriptor: the inner layer listing introduction points
//! with their crosscerts, the outer layer with its fake client-auth
//! records, the SHAKE-derived layer encryption and the signed outer
//! document. A parse path decrypts and validates a descriptor again, used
//! for self-checks and tests.

use crate::crypto::{ed_pubkey_from_curve_pubkey, sha3_256, shake256, BlindedKey};
use crate::error::{Result, TorError};
use crate::protocol::relay_cell::LinkSpecifier;
use aes::Aes256;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Signature prefix of the outer document.
pub const HS_DESC_SIG_PREFIX: &str = "Tor onion service descriptor sig v3";

/// Descriptor lifetime advertised to HSDirs, minutes.
pub const DESCRIPTOR_LIFETIME: u32 = 180;

/// Crosscert types (cert-spec).
pub const CERT_TYPE_SIGNING_BY_BLINDED: u8 = 0x08;
pub const CERT_TYPE_AUTH_BY_SIGNING: u8 = 0x09;
pub const CERT_TYPE_ENC_BY_SIGNING: u8 = 0x0B;

/// One introduction point as it appears in the inner descriptor layer.
#[derive(Debug, Clone, PartialEq)]
pub struct IntroPointEntry {
    pub link_specifiers: Vec<LinkSpecifier>,
    pub ntor_onion_key: [u8; 32],
    pub auth_key: [u8; 32],
    pub enc_key: [u8; 32],
}

/// Everything a descriptor build needs beyond the intro points.
pub struct DescriptorContext<'a> {
    pub blinded: &'a BlindedKey,
    pub signing_key: &'a SigningKey,
    pub subcredential: [u8; 32],
    pub valid_after: u64,
    pub revision: u64,
}

/// The packed ed25519 crosscert: version, cert type, expiration in hours,
/// certified key, one signing-key extension, signature over the first 76
/// bytes. 140 bytes total.
pub fn pack_crosscert(
    certified_key: &[u8; 32],
    signing_pub: &[u8; 32],
    cert_type: u8,
    valid_after: u64,
    sign: impl FnOnce(&[u8]) -> [u8; 64],
) -> [u8; 140] {
    let expiration_hours = (valid_after / 3600 + 3) as u32;

    let mut cert = [0u8; 140];
    cert[0] = 0x01;
    cert[1] = cert_type;
    cert[2..6].copy_from_slice(&expiration_hours.to_be_bytes());
    cert[6] = cert_type;
    cert[7..39].copy_from_slice(certified_key);
    cert[39] = 1; // one extension
    cert[40..42].copy_from_slice(&32u16.to_be_bytes());
    cert[42] = 0x04; // signed-with-ed25519-key
    cert[43] = 0x01; // affects validation
    cert[44..76].copy_from_slice(signing_pub);

    let signature = sign(&cert[..76]);
    cert[76..140].copy_from_slice(&signature);
    cert
}

/// Parse and verify a packed crosscert; returns (cert_type, certified key,
/// signing key).
pub fn verify_crosscert(cert: &[u8]) -> Result<(u8, [u8; 32], [u8; 32])> {
    if cert.len() != 140 || cert[0] != 0x01 {
        return Err(TorError::Protocol("malformed crosscert".into()));
    }
    let certified: [u8; 32] = cert[7..39].try_into().unwrap();
    let signing: [u8; 32] = cert[44..76].try_into().unwrap();
    let signature = Signature::from_bytes(cert[76..140].try_into().unwrap());

    let key = VerifyingKey::from_bytes(&signing)
        .map_err(|_| TorError::Crypto("crosscert signing key invalid".into()))?;
    key.verify(&cert[..76], &signature)
        .map_err(|_| TorError::Protocol("crosscert signature invalid".into()))?;
    Ok((cert[1], certified, signing))
}

fn cert_block(cert: &[u8; 140]) -> String {
    format!(
        "-----BEGIN ED25519 CERT-----\n{}\n-----END ED25519 CERT-----\n",
        STANDARD_NO_PAD.encode(cert)
    )
}

/// The inner ("second") plaintext layer: create2 formats plus one record
/// per introduction point.
pub fn build_inner_plaintext(
    ctx: &DescriptorContext<'_>,
    intro_points: &[IntroPointEntry],
) -> Result<String> {
    let signing_pub = ctx.signing_key.verifying_key().to_bytes();
    let mut layer = String::from("create2-formats 2\n");

    for point in intro_points {
        let specs = LinkSpecifier::pack_list(&point.link_specifiers);
        layer.push_str(&format!(
            "introduction-point {}\n",
            STANDARD_NO_PAD.encode(&specs)
        ));
        layer.push_str(&format!(
            "onion-key ntor {}\n",
            STANDARD_NO_PAD.encode(point.ntor_onion_key)
        ));

        layer.push_str("auth-key\n");
        let auth_cert = pack_crosscert(
            &point.auth_key,
            &signing_pub,
            CERT_TYPE_AUTH_BY_SIGNING,
            ctx.valid_after,
            |body| ctx.signing_key.sign(body).to_bytes(),
        );
        layer.push_str(&cert_block(&auth_cert));

        layer.push_str(&format!(
            "enc-key ntor {}\n",
            STANDARD_NO_PAD.encode(point.enc_key)
        ));
        layer.push_str("enc-key-cert\n");
        let enc_ed = ed_pubkey_from_curve_pubkey(&point.enc_key, 0)?;
        let enc_cert = pack_crosscert(
            &enc_ed,
            &signing_pub,
            CERT_TYPE_ENC_BY_SIGNING,
            ctx.valid_after,
            |body| ctx.signing_key.sign(body).to_bytes(),
        );
        layer.push_str(&cert_block(&enc_cert));
    }

    Ok(layer)
}

/// The outer ("first") plaintext layer: client auth is disabled, so the
/// ephemeral key and the 16 auth-client records are random filler.
pub fn build_outer_plaintext(inner_ciphertext: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    let mut random32 = [0u8; 32];

    rng.fill_bytes(&mut random32);
    let mut layer = format!(
        "desc-auth-type x25519\ndesc-auth-ephemeral-key {}\n",
        STANDARD_NO_PAD.encode(sha3_256(&[&random32]))
    );

    for _ in 0..16 {
        rng.fill_bytes(&mut random32);
        let client_id = &sha3_256(&[&random32])[..8];
        rng.fill_bytes(&mut random32);
        let iv = &sha3_256(&[&random32])[..16];
        rng.fill_bytes(&mut random32);
        let cookie = &sha3_256(&[&random32])[..16];
        layer.push_str(&format!(
            "auth-client {} {} {}\n",
            STANDARD_NO_PAD.encode(client_id),
            STANDARD_NO_PAD.encode(iv),
            STANDARD_NO_PAD.encode(cookie)
        ));
    }

    layer.push_str(&format!(
        "encrypted\n-----BEGIN MESSAGE-----\n{}\n-----END MESSAGE-----",
        STANDARD_NO_PAD.encode(inner_ciphertext)
    ));
    layer
}

fn layer_keys(
    blinded_pub: &[u8; 32],
    subcredential: &[u8; 32],
    revision: u64,
    salt: &[u8; 16],
    label: &[u8],
) -> ([u8; 32], [u8; 16], [u8; 32]) {
    // secret_input = blinded_pub || subcredential || int64_be(revision)
    let mut keys = [0u8; 80];
    shake256(
        &[
            blinded_pub,
            subcredential,
            &revision.to_be_bytes(),
            salt,
            label,
        ],
        &mut keys,
    );
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    let mut mac_key = [0u8; 32];
    key.copy_from_slice(&keys[0..32]);
    iv.copy_from_slice(&keys[32..48]);
    mac_key.copy_from_slice(&keys[48..80]);
    (key, iv, mac_key)
}

fn layer_mac(mac_key: &[u8; 32], salt: &[u8; 16], ciphertext: &[u8]) -> [u8; 32] {
    sha3_256(&[
        &(mac_key.len() as u64).to_be_bytes(),
        mac_key,
        &(salt.len() as u64).to_be_bytes(),
        salt,
        ciphertext,
    ])
}

/// Encrypt one descriptor layer: `salt || AES256-CTR(plaintext) || MAC`.
pub fn encrypt_layer(
    ctx: &DescriptorContext<'_>,
    plaintext: &[u8],
    label: &[u8],
    salt: [u8; 16],
) -> Vec<u8> {
    let (key, iv, mac_key) =
        layer_keys(&ctx.blinded.public(), &ctx.subcredential, ctx.revision, &salt, label);

    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new((&key).into(), (&iv).into());
    cipher.apply_keystream(&mut ciphertext);

    let mac = layer_mac(&mac_key, &salt, &ciphertext);

    let mut out = Vec::with_capacity(16 + ciphertext.len() + 32);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&mac);
    out
}

/// Decrypt one descriptor layer, verifying the trailing MAC first.
pub fn decrypt_layer(
    blinded_pub: &[u8; 32],
    subcredential: &[u8; 32],
    revision: u64,
    data: &[u8],
    label: &[u8],
) -> Result<Vec<u8>> {
    if data.len() < 16 + 32 {
        return Err(TorError::Protocol("descriptor layer too short".into()));
    }
    let salt: [u8; 16] = data[..16].try_into().unwrap();
    let ciphertext = &data[16..data.len() - 32];
    let mac: [u8; 32] = data[data.len() - 32..].try_into().unwrap();

    let (key, iv, mac_key) = layer_keys(blinded_pub, subcredential, revision, &salt, label);
    if layer_mac(&mac_key, &salt, ciphertext) != mac {
        return Err(TorError::Protocol("descriptor layer MAC mismatch".into()));
    }

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new((&key).into(), (&iv).into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// Build the complete signed descriptor with caller-chosen salts
/// (deterministic given fixed keys and salts, modulo the random
/// auth-client filler which sits inside the superencrypted blob).
pub fn build_descriptor_with_salts(
    ctx: &DescriptorContext<'_>,
    intro_points: &[IntroPointEntry],
    inner_salt: [u8; 16],
    outer_salt: [u8; 16],
) -> Result<String> {
    let inner = build_inner_plaintext(ctx, intro_points)?;
    let inner_ct = encrypt_layer(ctx, inner.as_bytes(), b"hsdir-encrypted-data", inner_salt);

    let outer = build_outer_plaintext(&inner_ct);
    let outer_ct = encrypt_layer(
        ctx,
        outer.as_bytes(),
        b"hsdir-superencrypted-data",
        outer_salt,
    );

    let signing_cert = pack_crosscert(
        &ctx.signing_key.verifying_key().to_bytes(),
        &ctx.blinded.public(),
        CERT_TYPE_SIGNING_BY_BLINDED,
        ctx.valid_after,
        |body| ctx.blinded.sign(body).to_bytes(),
    );

    let mut document = format!(
        "hs-descriptor 3\ndescriptor-lifetime {}\ndescriptor-signing-key-cert\n{}revision-counter {}\nsuperencrypted\n-----BEGIN MESSAGE-----\n{}\n-----END MESSAGE-----\n",
        DESCRIPTOR_LIFETIME,
        cert_block(&signing_cert),
        ctx.revision,
        STANDARD.encode(&outer_ct)
    );

    // The signature covers the prefix plus everything before the
    // "signature " token.
    let mut signed = Vec::with_capacity(HS_DESC_SIG_PREFIX.len() + document.len());
    signed.extend_from_slice(HS_DESC_SIG_PREFIX.as_bytes());
    signed.extend_from_slice(document.as_bytes());
    let signature = ctx.signing_key.sign(&signed);

    document.push_str(&format!(
        "signature {}\n",
        STANDARD_NO_PAD.encode(signature.to_bytes())
    ));
    Ok(document)
}

/// Build the descriptor with random salts.
pub fn build_descriptor(
    ctx: &DescriptorContext<'_>,
    intro_points: &[IntroPointEntry],
) -> Result<String> {
    let mut rng = rand::thread_rng();
    let mut seed = [0u8; 16];
    rng.fill_bytes(&mut seed);
    let inner_salt: [u8; 16] = sha3_256(&[&seed])[..16].try_into().unwrap();
    rng.fill_bytes(&mut seed);
    let outer_salt: [u8; 16] = sha3_256(&[&seed])[..16].try_into().unwrap();
    build_descriptor_with_salts(ctx, intro_points, inner_salt, outer_salt)
}

fn find_b64_after<'a>(text: &'a str, keyword: &str) -> Result<&'a str> {
    let start = text
        .find(keyword)
        .ok_or_else(|| TorError::Protocol(format!("descriptor missing {}", keyword.trim())))?;
    let rest = &text[start + keyword.len()..];
    Ok(rest
        .split_whitespace()
        .next()
        .ok_or_else(|| TorError::Protocol("descriptor field empty".into()))?)
}

fn extract_message_block(text: &str, after: &str) -> Result<Vec<u8>> {
    let anchor = text
        .find(after)
        .ok_or_else(|| TorError::Protocol(format!("descriptor missing {}", after)))?;
    let rest = &text[anchor..];
    let begin = rest
        .find("-----BEGIN MESSAGE-----\n")
        .ok_or_else(|| TorError::Protocol("descriptor missing message block".into()))?;
    let body_start = begin + "-----BEGIN MESSAGE-----\n".len();
    let end = rest
        .find("\n-----END MESSAGE-----")
        .ok_or_else(|| TorError::Protocol("descriptor message unterminated".into()))?;
    let blob: String = rest[body_start..end].split_whitespace().collect();
    STANDARD
        .decode(&blob)
        .or_else(|_| STANDARD_NO_PAD.decode(&blob))
        .map_err(|_| TorError::Protocol("descriptor message not base64".into()))
}

fn extract_cert_block(text: &str, after: &str) -> Result<Vec<u8>> {
    let anchor = text
        .find(after)
        .ok_or_else(|| TorError::Protocol(format!("descriptor missing {}", after)))?;
    let rest = &text[anchor..];
    let begin = rest
        .find("-----BEGIN ED25519 CERT-----\n")
        .ok_or_else(|| TorError::Protocol("descriptor missing cert block".into()))?;
    let body_start = begin + "-----BEGIN ED25519 CERT-----\n".len();
    let end = rest
        .find("\n-----END ED25519 CERT-----")
        .ok_or_else(|| TorError::Protocol("descriptor cert unterminated".into()))?;
    let blob: String = rest[body_start..end].split_whitespace().collect();
    STANDARD_NO_PAD
        .decode(&blob)
        .or_else(|_| STANDARD.decode(&blob))
        .map_err(|_| TorError::Protocol("descriptor cert not base64".into()))
}

/// Parse a descriptor back the way a client would: verify the outer
/// signature against the blinded key, pull the signing key out of its
/// crosscert, peel both encryption layers and return the intro point
/// records after validating their crosscerts.
pub fn parse_descriptor(
    text: &str,
    blinded_pub: &[u8; 32],
    subcredential: &[u8; 32],
    revision: u64,
) -> Result<Vec<IntroPointEntry>> {
    // Outer signature.
    let sig_pos = text
        .rfind("signature ")
        .ok_or_else(|| TorError::Protocol("descriptor missing signature".into()))?;
    let sig_b64 = find_b64_after(&text[sig_pos..], "signature ")?;
    let sig_raw = STANDARD_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TorError::Protocol("descriptor signature not base64".into()))?;
    let signature = Signature::from_bytes(
        sig_raw
            .as_slice()
            .try_into()
            .map_err(|_| TorError::Protocol("descriptor signature length".into()))?,
    );

    // Signing-key crosscert: the blinded key certifies the signing key.
    let signing_cert = extract_cert_block(text, "descriptor-signing-key-cert")?;
    let (cert_type, certified_signing, cert_signer) = verify_crosscert(&signing_cert)?;
    if cert_type != CERT_TYPE_SIGNING_BY_BLINDED || cert_signer != *blinded_pub {
        return Err(TorError::Protocol("signing-key crosscert invalid".into()));
    }

    // The signing key from the cert must have produced the signature.
    let signing_vk = VerifyingKey::from_bytes(&certified_signing)
        .map_err(|_| TorError::Crypto("descriptor signing key invalid".into()))?;
    let mut signed = Vec::new();
    signed.extend_from_slice(HS_DESC_SIG_PREFIX.as_bytes());
    signed.extend_from_slice(text[..sig_pos].as_bytes());
    signing_vk
        .verify(&signed, &signature)
        .map_err(|_| TorError::Protocol("descriptor signature invalid".into()))?;

    // Outer layer.
    let outer_ct = extract_message_block(text, "superencrypted")?;
    let outer_plain = decrypt_layer(
        blinded_pub,
        subcredential,
        revision,
        &outer_ct,
        b"hsdir-superencrypted-data",
    )?;
    let outer_text = String::from_utf8(outer_plain)
        .map_err(|_| TorError::Protocol("outer layer not UTF-8".into()))?;

    // Inner layer.
    let inner_ct = extract_message_block(&outer_text, "encrypted")?;
    let inner_plain = decrypt_layer(
        blinded_pub,
        subcredential,
        revision,
        &inner_ct,
        b"hsdir-encrypted-data",
    )?;
    let inner_text = String::from_utf8(inner_plain)
        .map_err(|_| TorError::Protocol("inner layer not UTF-8".into()))?;

    parse_inner_layer(&inner_text)
}

fn parse_inner_layer(text: &str) -> Result<Vec<IntroPointEntry>> {
    let mut points = Vec::new();

    for section in text.split("introduction-point ").skip(1) {
        let specs_b64 = section
            .split_whitespace()
            .next()
            .ok_or_else(|| TorError::Protocol("introduction-point field empty".into()))?;
        let specs_raw = STANDARD_NO_PAD
            .decode(specs_b64)
            .map_err(|_| TorError::Protocol("link specifiers not base64".into()))?;
        let (link_specifiers, _) = LinkSpecifier::parse_list(&specs_raw)?;

        let onion_b64 = find_b64_after(section, "onion-key ntor ")?;
        let ntor_onion_key: [u8; 32] = STANDARD_NO_PAD
            .decode(onion_b64)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| TorError::Protocol("onion key malformed".into()))?;

        let auth_cert = extract_cert_block(section, "auth-key")?;
        let (auth_type, auth_key, _) = verify_crosscert(&auth_cert)?;
        if auth_type != CERT_TYPE_AUTH_BY_SIGNING {
            return Err(TorError::Protocol("auth-key cert has wrong type".into()));
        }

        let enc_b64 = find_b64_after(section, "enc-key ntor ")?;
        let enc_key: [u8; 32] = STANDARD_NO_PAD
            .decode(enc_b64)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| TorError::Protocol("enc key malformed".into()))?;

        let enc_cert = extract_cert_block(section, "enc-key-cert")?;
        let (enc_type, enc_certified, _) = verify_crosscert(&enc_cert)?;
        if enc_type != CERT_TYPE_ENC_BY_SIGNING
            || enc_certified != ed_pubkey_from_curve_pubkey(&enc_key, 0)?
        {
            return Err(TorError::Protocol("enc-key cert invalid".into()));
        }

        points.push(IntroPointEntry {
            link_specifiers,
            ntor_onion_key,
            auth_key,
            enc_key,
        });
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use x25519_dalek::{PublicKey, StaticSecret};

    fn sample_points() -> Vec<IntroPointEntry> {
        (1u8..=3)
            .map(|i| IntroPointEntry {
                link_specifiers: vec![
                    LinkSpecifier::Ipv4(Ipv4Addr::new(10, 0, 0, i), 9000 + i as u16),
                    LinkSpecifier::LegacyId([i; 20]),
                ],
                ntor_onion_key: [i | 0x40; 32],
                auth_key: SigningKey::from_bytes(&[i; 32]).verifying_key().to_bytes(),
                enc_key: PublicKey::from(&StaticSecret::from([i | 0x80; 32])).to_bytes(),
            })
            .collect()
    }

    fn sample_ctx<'a>(
        blinded: &'a BlindedKey,
        signing: &'a SigningKey,
    ) -> DescriptorContext<'a> {
        DescriptorContext {
            blinded,
            signing_key: signing,
            subcredential: [0x21; 32],
            valid_after: 1_785_585_600,
            revision: 0,
        }
    }

    #[test]
    fn test_crosscert_roundtrip() {
        let signer = SigningKey::from_bytes(&[7; 32]);
        let signing_pub = signer.verifying_key().to_bytes();
        let cert = pack_crosscert(&[1; 32], &signing_pub, 0x09, 1_785_585_600, |body| {
            signer.sign(body).to_bytes()
        });

        let (cert_type, certified, cert_signer) = verify_crosscert(&cert).unwrap();
        assert_eq!(cert_type, 0x09);
        assert_eq!(certified, [1; 32]);
        assert_eq!(cert_signer, signing_pub);

        // Tampering breaks the signature.
        let mut bad = cert;
        bad[10] ^= 1;
        assert!(verify_crosscert(&bad).is_err());
    }

    #[test]
    fn test_layer_encryption_roundtrip() {
        let master = SigningKey::from_bytes(&[9; 32]);
        let blinded = BlindedKey::derive(&master, 19000, 1440).unwrap();
        let signing = SigningKey::from_bytes(&[10; 32]);
        let ctx = sample_ctx(&blinded, &signing);

        let blinded_pub = ctx.blinded.public();
        let ct = encrypt_layer(&ctx, b"layer payload", b"hsdir-encrypted-data", [3; 16]);
        let plain = decrypt_layer(
            &blinded_pub,
            &ctx.subcredential,
            ctx.revision,
            &ct,
            b"hsdir-encrypted-data",
        )
        .unwrap();
        assert_eq!(plain, b"layer payload");

        // Wrong label fails the MAC before any decryption.
        assert!(decrypt_layer(
            &blinded_pub,
            &ctx.subcredential,
            ctx.revision,
            &ct,
            b"hsdir-superencrypted-data"
        )
        .is_err());

        // Bit flip in the ciphertext fails the MAC.
        let mut corrupt = ct.clone();
        corrupt[20] ^= 1;
        assert!(decrypt_layer(
            &blinded_pub,
            &ctx.subcredential,
            ctx.revision,
            &corrupt,
            b"hsdir-encrypted-data"
        )
        .is_err());
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let master = SigningKey::from_bytes(&[9; 32]);
        let blinded = BlindedKey::derive(&master, 19000, 1440).unwrap();
        let signing = SigningKey::from_bytes(&[10; 32]);
        let ctx = sample_ctx(&blinded, &signing);
        let points = sample_points();

        let text =
            build_descriptor_with_salts(&ctx, &points, [1; 16], [2; 16]).unwrap();
        assert!(text.starts_with("hs-descriptor 3\n"));
        assert!(text.contains("descriptor-lifetime 180\n"));
        assert!(text.contains("revision-counter 0\n"));

        let parsed =
            parse_descriptor(&text, &ctx.blinded.public(), &ctx.subcredential, ctx.revision)
                .unwrap();
        assert_eq!(parsed, points);
    }

    #[test]
    fn test_descriptor_rejects_wrong_blinded_key() {
        let master = SigningKey::from_bytes(&[9; 32]);
        let blinded = BlindedKey::derive(&master, 19000, 1440).unwrap();
        let signing = SigningKey::from_bytes(&[10; 32]);
        let ctx = sample_ctx(&blinded, &signing);
        let text = build_descriptor_with_salts(&ctx, &sample_points(), [1; 16], [2; 16]).unwrap();

        let other_blinded = BlindedKey::derive(&master, 19001, 1440).unwrap();
        let wrong = sample_ctx(&other_blinded, &signing);
        assert!(parse_descriptor(
            &text,
            &wrong.blinded.public(),
            &wrong.subcredential,
            wrong.revision
        )
        .is_err());
    }

    #[test]
    fn test_descriptor_signature_tamper_detected() {
        let master = SigningKey::from_bytes(&[9; 32]);
        let blinded = BlindedKey::derive(&master, 19000, 1440).unwrap();
        let signing = SigningKey::from_bytes(&[10; 32]);
        let ctx = sample_ctx(&blinded, &signing);
        let text = build_descriptor_with_salts(&ctx, &sample_points(), [1; 16], [2; 16]).unwrap();

        let tampered = text.replace("descriptor-lifetime 180", "descriptor-lifetime 181");
        assert!(parse_descriptor(
            &tampered,
            &ctx.blinded.public(),
            &ctx.subcredential,
            ctx.revision
        )
        .is_err());
    }
}
