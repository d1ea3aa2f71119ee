//! Link-layer handshake payloads
//!
//! Everything exchanged on a fresh guard connection before the first
//! CREATE2: VERSIONS, CERTS (with the in-band verification that replaces CA
//! validation), AUTH_CHALLENGE, the AUTH0001 AUTHENTICATE response and
//! NETINFO.
//!
//! The TLS layer is deliberately not trusted to verify anything; the CERTS
//! cell binds the TLS certificate to the relay's RSA identity and that is
//! the trust anchor for the whole link.

use crate::error::{Result, TorError};
use crate::transport::TlsAuthMaterial;
use hmac::{Hmac, Mac};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

/// Link protocol versions we can speak.
pub const SUPPORTED_VERSIONS: [u16; 2] = [3, 4];

/// Certificate types in a CERTS cell (tor-spec 4.2)
pub const CERT_TYPE_LINK_KEY: u8 = 1;
pub const CERT_TYPE_IDENTITY: u8 = 2;
pub const CERT_TYPE_RSA_AUTH: u8 = 3;

/// Pack a VERSIONS payload.
pub fn pack_versions(versions: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(versions.len() * 2);
    for v in versions {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf
}

/// Parse a VERSIONS payload and pick the highest version both sides speak.
pub fn negotiate_version(payload: &[u8]) -> Result<u16> {
    if payload.len() % 2 != 0 {
        return Err(TorError::Protocol("VERSIONS payload odd length".into()));
    }
    let mut best = None;
    for chunk in payload.chunks_exact(2) {
        let v = u16::from_be_bytes([chunk[0], chunk[1]]);
        if SUPPORTED_VERSIONS.contains(&v) && best.map_or(true, |b| v > b) {
            best = Some(v);
        }
    }
    best.ok_or_else(|| TorError::Protocol("No common link version".into()))
}

/// One entry of a CERTS cell.
#[derive(Debug, Clone)]
pub struct CertEntry {
    pub cert_type: u8,
    pub cert: Vec<u8>,
}

/// Pack a CERTS payload from entries.
pub fn pack_certs(entries: &[CertEntry]) -> Vec<u8> {
    let mut buf = vec![entries.len() as u8];
    for entry in entries {
        buf.push(entry.cert_type);
        buf.extend_from_slice(&(entry.cert.len() as u16).to_be_bytes());
        buf.extend_from_slice(&entry.cert);
    }
    buf
}

/// Parse a CERTS payload.
pub fn parse_certs(payload: &[u8]) -> Result<Vec<CertEntry>> {
    if payload.is_empty() {
        return Err(TorError::Protocol("Empty CERTS payload".into()));
    }
    let count = payload[0] as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 1;
    for _ in 0..count {
        if pos + 3 > payload.len() {
            return Err(TorError::Protocol("CERTS entry truncated".into()));
        }
        let cert_type = payload[pos];
        let len = u16::from_be_bytes([payload[pos + 1], payload[pos + 2]]) as usize;
        pos += 3;
        if pos + len > payload.len() {
            return Err(TorError::Protocol("CERTS body truncated".into()));
        }
        entries.push(CertEntry {
            cert_type,
            cert: payload[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(entries)
}

fn validity_window(cert: &Certificate) -> Result<(u64, u64)> {
    let validity = &cert.tbs_certificate.validity;
    let to_unix = |t: &x509_cert::time::Time| -> u64 {
        t.to_system_time()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    };
    Ok((to_unix(&validity.not_before), to_unix(&validity.not_after)))
}

fn spki_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| TorError::CertificateError(format!("SPKI encode: {}", e)))
}

fn rsa_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let raw = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| TorError::CertificateError("SPKI bitstring has unused bits".into()))?;
    RsaPublicKey::from_pkcs1_der(raw)
        .map_err(|e| TorError::CertificateError(format!("not an RSA key: {}", e)))
}

/// Verify an RSA signature on `signed`'s TBS section against `signer_key`,
/// honoring the SHA-1 / SHA-256 signature algorithm choice.
fn verify_cert_signature(signed: &Certificate, signer_key: &RsaPublicKey) -> Result<()> {
    let tbs = signed
        .tbs_certificate
        .to_der()
        .map_err(|e| TorError::CertificateError(format!("TBS encode: {}", e)))?;
    let sig = signed
        .signature
        .as_bytes()
        .ok_or_else(|| TorError::CertificateError("signature bitstring".into()))?;

    let oid = signed.signature_algorithm.oid.to_string();
    let verified = match oid.as_str() {
        // sha256WithRSAEncryption
        "1.2.840.113549.1.1.11" => {
            let digest = Sha256::digest(&tbs);
            signer_key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, sig)
                .is_ok()
        }
        // sha1WithRSAEncryption
        "1.2.840.113549.1.1.5" => {
            let digest = sha1::Sha1::digest(&tbs);
            signer_key
                .verify(Pkcs1v15Sign::new::<sha1::Sha1>(), &digest, sig)
                .is_ok()
        }
        other => {
            return Err(TorError::CertificateError(format!(
                "unsupported signature algorithm {}",
                other
            )))
        }
    };

    if verified {
        Ok(())
    } else {
        Err(TorError::CertificateError("bad certificate signature".into()))
    }
}

/// Outcome of CERTS verification: the responder's RSA identity key in
/// PKCS#1 DER, as hashed into the AUTHENTICATE cell.
pub struct ResponderIdentity {
    pub rsa_identity_key_der: Vec<u8>,
}

/// Verify a responder CERTS cell against the TLS peer certificate.
///
/// Requires exactly one LINK_KEY and one IDENTITY_CERT; the link cert must
/// carry the same key the TLS connection used, the identity cert must sign
/// the link cert, and both must be inside their validity windows.
pub fn verify_certs(
    entries: &[CertEntry],
    peer_cert_der: &[u8],
    now_unix: u64,
) -> Result<ResponderIdentity> {
    let mut link_cert = None;
    let mut identity_cert = None;

    for entry in entries {
        match entry.cert_type {
            CERT_TYPE_LINK_KEY => {
                if link_cert.replace(&entry.cert).is_some() {
                    return Err(TorError::CertificateError("duplicate LINK_KEY cert".into()));
                }
            }
            CERT_TYPE_IDENTITY => {
                if identity_cert.replace(&entry.cert).is_some() {
                    return Err(TorError::CertificateError("duplicate IDENTITY cert".into()));
                }
            }
            _ => {}
        }
    }

    let link_der = link_cert
        .ok_or_else(|| TorError::CertificateError("missing LINK_KEY cert".into()))?;
    let identity_der = identity_cert
        .ok_or_else(|| TorError::CertificateError("missing IDENTITY cert".into()))?;

    let link = Certificate::from_der(link_der)
        .map_err(|e| TorError::CertificateError(format!("link cert parse: {}", e)))?;
    let identity = Certificate::from_der(identity_der)
        .map_err(|e| TorError::CertificateError(format!("identity cert parse: {}", e)))?;
    let peer = Certificate::from_der(peer_cert_der)
        .map_err(|e| TorError::CertificateError(format!("TLS peer cert parse: {}", e)))?;

    // The link cert must vouch for the key TLS actually used.
    if spki_der(&link)? != spki_der(&peer)? {
        return Err(TorError::CertificateError(
            "LINK_KEY does not match TLS certificate key".into(),
        ));
    }

    for cert in [&link, &identity] {
        let (not_before, not_after) = validity_window(cert)?;
        if now_unix < not_before || now_unix > not_after {
            return Err(TorError::CertificateError(
                "certificate outside validity window".into(),
            ));
        }
    }

    let identity_key = rsa_public_key(&identity)?;
    verify_cert_signature(&link, &identity_key)?;
    verify_cert_signature(&identity, &identity_key)?;

    let rsa_identity_key_der = identity_key
        .to_pkcs1_der()
        .map_err(|e| TorError::CertificateError(format!("identity key encode: {}", e)))?
        .as_bytes()
        .to_vec();

    Ok(ResponderIdentity {
        rsa_identity_key_der,
    })
}

/// Parse an AUTH_CHALLENGE payload; returns true when AUTH0001 is offered.
pub fn parse_auth_challenge(payload: &[u8]) -> Result<bool> {
    if payload.len() < 34 {
        return Err(TorError::Protocol("AUTH_CHALLENGE too short".into()));
    }
    let n_methods = u16::from_be_bytes([payload[32], payload[33]]) as usize;
    if payload.len() < 34 + n_methods * 2 {
        return Err(TorError::Protocol("AUTH_CHALLENGE truncated".into()));
    }
    Ok(payload[34..34 + n_methods * 2]
        .chunks_exact(2)
        .any(|m| u16::from_be_bytes([m[0], m[1]]) == 1))
}

/// RSA link-authentication material for one connection: a fresh 1024-bit
/// identity key and auth key with self-signed certificates, as the original
/// router handshake generates per session.
pub struct LinkAuthKeys {
    pub identity_key_der: Vec<u8>,
    pub identity_cert_der: Vec<u8>,
    pub auth_cert_der: Vec<u8>,
    auth_key: RsaPrivateKey,
}

impl LinkAuthKeys {
    /// Generate fresh identity and auth keys plus their certificates.
    pub fn generate() -> Result<Self> {
        use x509_cert::builder::{Builder, CertificateBuilder, Profile};
        use x509_cert::name::Name;
        use x509_cert::serial_number::SerialNumber;
        use x509_cert::spki::SubjectPublicKeyInfoOwned;
        use x509_cert::time::Validity;

        let mut rng = rand::thread_rng();
        let identity_key = RsaPrivateKey::new(&mut rng, 1024)
            .map_err(|e| TorError::Crypto(format!("RSA keygen: {}", e)))?;
        let auth_key = RsaPrivateKey::new(&mut rng, 1024)
            .map_err(|e| TorError::Crypto(format!("RSA keygen: {}", e)))?;

        let identity_key_der = identity_key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| TorError::Crypto(format!("RSA encode: {}", e)))?
            .as_bytes()
            .to_vec();

        let make_cert = |subject: &str, key: &RsaPrivateKey, signer: &RsaPrivateKey| -> Result<Vec<u8>> {
            let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(signer.clone());
            let spki_der = key
                .to_public_key()
                .to_public_key_der()
                .map_err(|e| TorError::Crypto(format!("SPKI encode: {}", e)))?;
            let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())
                .map_err(|e| TorError::Crypto(format!("SPKI parse: {}", e)))?;
            let serial = SerialNumber::from(rand::random::<u32>());
            let validity = Validity::from_now(std::time::Duration::from_secs(365 * 24 * 3600))
                .map_err(|e| TorError::Crypto(format!("validity: {}", e)))?;
            let name: Name = subject
                .parse()
                .map_err(|e| TorError::Crypto(format!("subject: {}", e)))?;

            let builder = CertificateBuilder::new(
                Profile::Manual { issuer: None },
                serial,
                validity,
                name,
                spki,
                &signing_key,
            )
            .map_err(|e| TorError::Crypto(format!("cert builder: {}", e)))?;
            let cert = builder
                .build()
                .map_err(|e| TorError::Crypto(format!("cert build: {}", e)))?;
            cert.to_der()
                .map_err(|e| TorError::Crypto(format!("cert encode: {}", e)))
        };

        let identity_cert_der = make_cert("CN=microtor", &identity_key, &identity_key)?;
        let auth_cert_der = make_cert("CN=microtor auth", &auth_key, &identity_key)?;

        Ok(Self {
            identity_key_der,
            identity_cert_der,
            auth_cert_der,
            auth_key,
        })
    }

    /// Our CERTS cell entries: identity cert plus RSA auth cert.
    pub fn certs_entries(&self) -> Vec<CertEntry> {
        vec![
            CertEntry {
                cert_type: CERT_TYPE_IDENTITY,
                cert: self.identity_cert_der.clone(),
            },
            CertEntry {
                cert_type: CERT_TYPE_RSA_AUTH,
                cert: self.auth_cert_der.clone(),
            },
        ]
    }
}

/// Everything that feeds the AUTH0001 body.
pub struct AuthenticateInputs<'a> {
    /// SHA-256 over every cell we have sent on this connection.
    pub client_log: [u8; 32],
    /// SHA-256 over every cell the responder has sent.
    pub server_log: [u8; 32],
    /// The responder's TLS certificate, DER.
    pub peer_cert_der: &'a [u8],
    /// The responder's RSA identity key, PKCS#1 DER.
    pub responder_id_key_der: &'a [u8],
    /// TLS session secrets surfaced by the transport.
    pub tls: &'a TlsAuthMaterial,
}

/// Build the AUTHENTICATE payload (auth type 1, "AUTH0001").
///
/// Layout per tor-spec 4.4: TYPE(8) CID(32) SID(32) SLOG(32) CLOG(32)
/// SCERT(32) TLSSECRETS(32) RAND(24) SIG(128), wrapped with the 2-byte auth
/// type and 2-byte length. The RSA signature covers the SHA-256 of the body
/// with PKCS#1 v1.5 padding and no DigestInfo.
pub fn build_authenticate(
    keys: &LinkAuthKeys,
    inputs: &AuthenticateInputs<'_>,
) -> Result<Vec<u8>> {
    type HmacSha256 = Hmac<Sha256>;

    let mut body = Vec::with_capacity(352);
    body.extend_from_slice(b"AUTH0001");
    body.extend_from_slice(&Sha256::digest(&keys.identity_key_der));
    body.extend_from_slice(&Sha256::digest(inputs.responder_id_key_der));
    body.extend_from_slice(&inputs.server_log);
    body.extend_from_slice(&inputs.client_log);
    body.extend_from_slice(&Sha256::digest(inputs.peer_cert_der));

    let mut mac = HmacSha256::new_from_slice(&inputs.tls.master_secret)
        .map_err(|_| TorError::Crypto("TLS secrets HMAC".into()))?;
    mac.update(&inputs.tls.client_random);
    mac.update(&inputs.tls.server_random);
    mac.update(b"Tor V3 handshake TLS cross-certification\0");
    body.extend_from_slice(&mac.finalize().into_bytes());

    let mut random = [0u8; 24];
    rand::Rng::fill(&mut rand::thread_rng(), &mut random[..]);
    body.extend_from_slice(&random);

    let digest = Sha256::digest(&body);
    let signature = keys
        .auth_key
        .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
        .map_err(|e| TorError::Crypto(format!("AUTHENTICATE sign: {}", e)))?;
    body.extend_from_slice(&signature);

    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Parsed NETINFO payload.
#[derive(Debug, Clone)]
pub struct NetinfoPayload {
    pub timestamp: u32,
    /// The address the sender observed for us.
    pub other_address: Option<Ipv4Addr>,
    /// The sender's own addresses.
    pub my_addresses: Vec<Ipv4Addr>,
}

const NETINFO_ATYPE_IPV4: u8 = 4;

fn parse_netinfo_address(data: &[u8], pos: &mut usize) -> Result<Option<Ipv4Addr>> {
    if *pos + 2 > data.len() {
        return Err(TorError::Protocol("NETINFO address truncated".into()));
    }
    let atype = data[*pos];
    let alen = data[*pos + 1] as usize;
    *pos += 2;
    if *pos + alen > data.len() {
        return Err(TorError::Protocol("NETINFO address truncated".into()));
    }
    let body = &data[*pos..*pos + alen];
    *pos += alen;
    if atype == NETINFO_ATYPE_IPV4 && alen == 4 {
        Ok(Some(Ipv4Addr::new(body[0], body[1], body[2], body[3])))
    } else {
        Ok(None)
    }
}

impl NetinfoPayload {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorError::Protocol("NETINFO too short".into()));
        }
        let timestamp = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mut pos = 4;
        let other_address = parse_netinfo_address(data, &mut pos)?;

        if pos >= data.len() {
            return Err(TorError::Protocol("NETINFO missing address count".into()));
        }
        let count = data[pos] as usize;
        pos += 1;
        let mut my_addresses = Vec::new();
        for _ in 0..count {
            if let Some(addr) = parse_netinfo_address(data, &mut pos)? {
                my_addresses.push(addr);
            }
        }

        Ok(Self {
            timestamp,
            other_address,
            my_addresses,
        })
    }

    /// Pack a NETINFO answering the responder: their address as the peer,
    /// the address they observed for us as ours.
    pub fn pack(timestamp: u32, peer_address: Ipv4Addr, own_address: Ipv4Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.push(NETINFO_ATYPE_IPV4);
        buf.push(4);
        buf.extend_from_slice(&peer_address.octets());
        buf.push(1);
        buf.push(NETINFO_ATYPE_IPV4);
        buf.push(4);
        buf.extend_from_slice(&own_address.octets());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_version(&pack_versions(&[3, 4, 5])).unwrap(), 4);
        assert_eq!(negotiate_version(&pack_versions(&[3])).unwrap(), 3);
        assert!(negotiate_version(&pack_versions(&[1, 2])).is_err());
        assert!(negotiate_version(&[0]).is_err());
    }

    #[test]
    fn test_certs_roundtrip() {
        let entries = vec![
            CertEntry {
                cert_type: CERT_TYPE_LINK_KEY,
                cert: vec![1, 2, 3],
            },
            CertEntry {
                cert_type: CERT_TYPE_IDENTITY,
                cert: vec![4, 5],
            },
        ];
        let packed = pack_certs(&entries);
        let parsed = parse_certs(&packed).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].cert_type, CERT_TYPE_LINK_KEY);
        assert_eq!(parsed[1].cert, vec![4, 5]);
    }

    #[test]
    fn test_auth_challenge_parse() {
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&3u16.to_be_bytes());
        assert!(parse_auth_challenge(&payload).unwrap());

        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&3u16.to_be_bytes());
        assert!(!parse_auth_challenge(&payload).unwrap());
    }

    #[test]
    fn test_netinfo_roundtrip() {
        let packed = NetinfoPayload::pack(
            1_700_000_000,
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(192, 168, 0, 9),
        );
        let parsed = NetinfoPayload::parse(&packed).unwrap();
        assert_eq!(parsed.timestamp, 1_700_000_000);
        assert_eq!(parsed.other_address, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(parsed.my_addresses, vec![Ipv4Addr::new(192, 168, 0, 9)]);
    }

    #[test]
    fn test_authenticate_body_layout() {
        let keys = LinkAuthKeys::generate().unwrap();
        let tls = TlsAuthMaterial {
            client_random: [1; 32],
            server_random: [2; 32],
            master_secret: vec![3; 48],
        };
        let inputs = AuthenticateInputs {
            client_log: [4; 32],
            server_log: [5; 32],
            peer_cert_der: &[6; 100],
            responder_id_key_der: &[7; 140],
            tls: &tls,
        };
        let payload = build_authenticate(&keys, &inputs).unwrap();
        // auth_type(2) + auth_len(2) + 352-byte body
        assert_eq!(payload.len(), 356);
        assert_eq!(&payload[0..2], &1u16.to_be_bytes());
        assert_eq!(u16::from_be_bytes([payload[2], payload[3]]), 352);
        assert_eq!(&payload[4..12], b"AUTH0001");
    }
}
