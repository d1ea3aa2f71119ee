//! Tor wire protocol
//!
//! Cell framing, RELAY payloads, the link and ntor handshakes and the
//! per-hop cryptography. Everything in here is synchronous byte-level
//! work; the async driving lives in [`crate::circuit`].

pub mod cell;
pub mod handshake;
pub mod hs_cell;
pub mod ntor;
pub mod relay_cell;
pub mod relay_crypto;

pub use cell::{Cell, CellCommand, CircIdLen};
pub use relay_cell::{LinkSpecifier, RelayCell, RelayCommand};
pub use relay_crypto::{CircuitKeys, HsCrypto, RecognizedLayer, RelayCrypto};
