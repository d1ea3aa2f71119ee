//! # microtor
//!
//! An embedded-class implementation of the Tor v3 onion service protocol:
//! it builds multi-hop circuits through the Tor network and publishes and
//! serves hidden services reachable by `.onion` addresses, aimed at small
//! devices that need to expose one TCP service anonymously without a full
//! Tor daemon.
//!
//! ## Architecture
//!
//! ```text
//! Core event loop (one task, one queue)
//!   ├── Relay directory (consensus, selection, HSDir index)
//!   ├── Onion circuits (link handshake, ntor, layered crypto)
//!   ├── Hidden-service control plane (blinded keys, descriptors, intros)
//!   └── Hidden-service data plane (rendezvous ↔ local TCP bridge)
//! ```
//!
//! Per-circuit and per-stream reader tasks feed the core queue and never
//! touch shared state; all protocol state changes happen on the core task.
//!
//! ## Usage
//!
//! ```no_run
//! use microtor::{Core, Directory, FsBlobStore, MemoryBlockStore, TlsDialer};
//! use std::sync::Arc;
//!
//! # async fn run() -> microtor::Result<()> {
//! let authority = "204.13.164.118:80".parse().unwrap();
//! let directory = Directory::new(
//!     authority,
//!     MemoryBlockStore::new(4096 * 256),
//!     Box::new(FsBlobStore::open("/var/lib/microtor")?),
//! )?;
//!
//! let mut core = Core::new(directory, Arc::new(TlsDialer::new()));
//! core.bootstrap().await?;
//!
//! let mut storage = FsBlobStore::open("/var/lib/microtor/service")?;
//! let hostname = core.setup_hidden_service(&mut storage, 8080, 80).await?;
//! println!("serving on {}", hostname);
//! core.run().await;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod core;
pub mod crypto;
pub mod directory;
mod error;
pub mod hs;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use circuit::{CircIdAllocator, CircuitStatus, OnionCircuit};
pub use self::core::{Core, CoreMessage, TimerKind};
pub use directory::{
    BlockStore, Directory, HsDirIndex, MemoryBlockStore, NetworkConsensus, OnionRelay, Period,
};
pub use error::{Result, TorError};
pub use hs::keys::ServiceIdentity;
pub use hs::OnionService;
pub use storage::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use transport::{BoxTransport, Dialer, LinkTransport, TlsAuthMaterial, TlsDialer};
