//! Service identity and per-period keys
//!
//! The service's long-term ed25519 master key is generated once and kept in
//! the blob store together with the published hostname. Each time period
//! derives a blinded signing key and a subcredential from it.

use crate::crypto::{credential, onion_address, subcredential, BlindedKey};
use crate::error::{Result, TorError};
use crate::storage::{BlobStore, KEY_ED25519_PRIVATE, KEY_ED25519_PUBLIC, KEY_HOSTNAME};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

/// The service's long-term identity.
pub struct ServiceIdentity {
    pub master: SigningKey,
    pub hostname: String,
}

impl ServiceIdentity {
    /// Load the identity from the blob store, generating and persisting a
    /// fresh one on first use.
    pub fn load_or_generate(store: &mut dyn BlobStore) -> Result<Self> {
        if let Some(raw) = store.get(KEY_ED25519_PRIVATE)? {
            let seed: [u8; 32] = raw
                .try_into()
                .map_err(|_| TorError::Storage("service key has wrong length".into()))?;
            let master = SigningKey::from_bytes(&seed);
            let hostname = onion_address(master.verifying_key().as_bytes());
            log::info!("loaded onion service identity: {}", hostname);
            return Ok(Self { master, hostname });
        }

        let master = SigningKey::generate(&mut OsRng);
        let public = master.verifying_key();
        let hostname = onion_address(public.as_bytes());

        store.put(KEY_ED25519_PRIVATE, &master.to_bytes())?;
        store.put(KEY_ED25519_PUBLIC, public.as_bytes())?;
        store.put(KEY_HOSTNAME, hostname.as_bytes())?;
        log::info!("🧅 generated onion service identity: {}", hostname);

        Ok(Self { master, hostname })
    }

    /// Build an identity from a fixed seed (tests, imported keys).
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let master = SigningKey::from_bytes(&seed);
        let hostname = onion_address(master.verifying_key().as_bytes());
        Self { master, hostname }
    }
}

/// Keys bound to one time period.
pub struct PeriodKeys {
    pub period: u64,
    pub blinded: BlindedKey,
    pub subcredential: [u8; 32],
}

impl PeriodKeys {
    pub fn derive(master: &SigningKey, period: u64, interval: u64) -> Result<Self> {
        let blinded = BlindedKey::derive(master, period, interval)?;
        let cred = credential(master.verifying_key().as_bytes());
        let subcredential = subcredential(&cred, &blinded.public());
        Ok(Self {
            period,
            blinded,
            subcredential,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[test]
    fn test_identity_persists_across_loads() {
        let mut store = MemoryBlobStore::new();
        let first = ServiceIdentity::load_or_generate(&mut store).unwrap();
        let second = ServiceIdentity::load_or_generate(&mut store).unwrap();
        assert_eq!(first.hostname, second.hostname);
        assert_eq!(first.master.to_bytes(), second.master.to_bytes());
        assert!(store.get(KEY_HOSTNAME).unwrap().is_some());
    }

    #[test]
    fn test_fixed_seed_hostname_is_stable() {
        let identity = ServiceIdentity::from_seed([0x5Au8; 32]);
        let again = ServiceIdentity::from_seed([0x5Au8; 32]);
        assert_eq!(identity.hostname, again.hostname);
        assert_eq!(identity.hostname.len(), 62);
    }

    #[test]
    fn test_period_keys_differ_per_period() {
        let master = SigningKey::from_bytes(&[3u8; 32]);
        let a = PeriodKeys::derive(&master, 19000, 1440).unwrap();
        let b = PeriodKeys::derive(&master, 18999, 1440).unwrap();
        assert_ne!(a.blinded.public(), b.blinded.public());
        assert_ne!(a.subcredential, b.subcredential);
    }
}
