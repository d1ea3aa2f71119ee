//! Tor consensus and server-descriptor parsing
//!
//! Parses the network consensus document from directory authorities,
//! extracting the validity window, the shared random values, the HSDir
//! parameters and the relay entries. Server descriptors are parsed for the
//! two keys the engine needs: the ntor onion key and the ed25519 master key.

use crate::error::{Result, TorError};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use std::net::Ipv4Addr;

/// Network-wide consensus parameters.
#[derive(Debug, Clone)]
pub struct NetworkConsensus {
    /// Consensus method
    pub method: u32,

    /// Consensus valid-after time (unix seconds)
    pub valid_after: u64,

    /// Consensus fresh-until time
    pub fresh_until: u64,

    /// Consensus valid-until time
    pub valid_until: u64,

    /// Time-period length in minutes (default 1440)
    pub hsdir_interval: u64,

    /// Descriptor replica count (default 2)
    pub hsdir_n_replicas: u32,

    /// Relays per replica (default 4)
    pub hsdir_spread_store: u32,

    /// Shared random value of the previous period
    pub previous_shared_rand: [u8; 32],

    /// Shared random value of the current period
    pub shared_rand: [u8; 32],
}

impl NetworkConsensus {
    /// The current time period number:
    /// `(valid_after_minutes - 12*60) / hsdir_interval`.
    pub fn time_period(&self) -> u64 {
        (self.valid_after / 60 - 12 * 60) / self.hsdir_interval
    }

    /// Still fresh at `now`? Refresh triggers exactly at `fresh_until`.
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.fresh_until
    }

    /// Still usable at `now`? Exactly at `valid_until` the directory is
    /// stale.
    pub fn is_valid(&self, now: u64) -> bool {
        now < self.valid_until
    }
}

/// Relay flags from an `s` line.
#[derive(Debug, Clone, Default)]
pub struct RelayFlags {
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub running: bool,
    pub stable: bool,
    pub v2_dir: bool,
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from a consensus `s` line body.
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();
        for flag in flags.split_whitespace() {
            match flag {
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "V2Dir" => relay_flags.v2_dir = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }
        relay_flags
    }
}

/// One relay entry as listed in the consensus.
#[derive(Debug, Clone)]
pub struct ConsensusRelay {
    pub nickname: String,
    pub identity: [u8; 20],
    pub digest: [u8; 20],
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
    pub flags: RelayFlags,
}

/// A parsed consensus document.
#[derive(Debug, Clone)]
pub struct ConsensusDocument {
    pub consensus: NetworkConsensus,
    pub relays: Vec<ConsensusRelay>,
}

struct RelayBuilder {
    nickname: String,
    identity: [u8; 20],
    digest: [u8; 20],
    address: Ipv4Addr,
    or_port: u16,
    dir_port: u16,
    flags: Option<RelayFlags>,
}

impl RelayBuilder {
    fn build(self) -> Option<ConsensusRelay> {
        Some(ConsensusRelay {
            nickname: self.nickname,
            identity: self.identity,
            digest: self.digest,
            address: self.address,
            or_port: self.or_port,
            dir_port: self.dir_port,
            flags: self.flags?,
        })
    }
}

fn decode_b64_20(field: &str) -> Result<[u8; 20]> {
    let raw = STANDARD_NO_PAD
        .decode(field.trim_end_matches('='))
        .map_err(|_| TorError::Directory("bad base64 field in consensus".into()))?;
    raw.try_into()
        .map_err(|_| TorError::Directory("consensus digest has wrong length".into()))
}

fn decode_b64_32(field: &str) -> Result<[u8; 32]> {
    let raw = STANDARD_NO_PAD
        .decode(field.trim_end_matches('='))
        .map_err(|_| TorError::Directory("bad base64 field".into()))?;
    raw.try_into()
        .map_err(|_| TorError::Directory("shared random value has wrong length".into()))
}

/// Days since the unix epoch for a civil date (Howard Hinnant's algorithm).
fn days_from_civil(year: i64, month: u64, day: u64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

/// Parse "YYYY-MM-DD HH:MM:SS" into unix seconds.
fn parse_timestamp(date: &str, time: &str) -> Result<u64> {
    let err = || TorError::Directory("bad timestamp in consensus".into());

    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let month: u64 = date_parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let day: u64 = date_parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;

    let mut time_parts = time.split(':');
    let hour: u64 = time_parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let minute: u64 = time_parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let second: u64 = time_parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;

    let days = days_from_civil(year, month, day);
    if days < 0 {
        return Err(err());
    }
    Ok(days as u64 * 86_400 + hour * 3_600 + minute * 60 + second)
}

fn parse_dated_line(line: &str) -> Result<u64> {
    let mut parts = line.split_whitespace();
    let _keyword = parts.next();
    let date = parts
        .next()
        .ok_or_else(|| TorError::Directory("dated line missing date".into()))?;
    let time = parts
        .next()
        .ok_or_else(|| TorError::Directory("dated line missing time".into()))?;
    parse_timestamp(date, time)
}

/// Parse a consensus document.
pub fn parse_consensus(text: &str) -> Result<ConsensusDocument> {
    let mut method = 0u32;
    let mut valid_after = 0u64;
    let mut fresh_until = 0u64;
    let mut valid_until = 0u64;
    let mut hsdir_interval = 1440u64;
    let mut hsdir_n_replicas = 2u32;
    let mut hsdir_spread_store = 4u32;
    let mut previous_shared_rand = [0u8; 32];
    let mut shared_rand = [0u8; 32];
    let mut relays = Vec::new();
    let mut current_relay: Option<RelayBuilder> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("consensus-method ") {
            method = rest.trim().parse().unwrap_or(0);
        } else if line.starts_with("valid-after ") {
            valid_after = parse_dated_line(line)?;
        } else if line.starts_with("fresh-until ") {
            fresh_until = parse_dated_line(line)?;
        } else if line.starts_with("valid-until ") {
            valid_until = parse_dated_line(line)?;
        } else if let Some(rest) = line.strip_prefix("shared-rand-previous-value ") {
            let value = rest
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| TorError::Directory("malformed shared-rand line".into()))?;
            previous_shared_rand = decode_b64_32(value)?;
        } else if let Some(rest) = line.strip_prefix("shared-rand-current-value ") {
            let value = rest
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| TorError::Directory("malformed shared-rand line".into()))?;
            shared_rand = decode_b64_32(value)?;
        } else if let Some(rest) = line.strip_prefix("params ") {
            for param in rest.split_whitespace() {
                if let Some((key, value)) = param.split_once('=') {
                    match key {
                        "hsdir-interval" => hsdir_interval = value.parse().unwrap_or(1440),
                        "hsdir-n-replicas" => hsdir_n_replicas = value.parse().unwrap_or(2),
                        "hsdir-spread-store" => hsdir_spread_store = value.parse().unwrap_or(4),
                        _ => {}
                    }
                }
            }
        } else if line.starts_with("r ") {
            if let Some(builder) = current_relay.take() {
                if let Some(relay) = builder.build() {
                    relays.push(relay);
                }
            }
            current_relay = parse_r_line(line).ok();
        } else if let Some(rest) = line.strip_prefix("s ") {
            if let Some(ref mut builder) = current_relay {
                builder.flags = Some(RelayFlags::from_string(rest));
            }
        }
    }

    if let Some(builder) = current_relay {
        if let Some(relay) = builder.build() {
            relays.push(relay);
        }
    }

    if valid_after > fresh_until || fresh_until > valid_until {
        return Err(TorError::Directory(
            "consensus validity window is not ordered".into(),
        ));
    }

    Ok(ConsensusDocument {
        consensus: NetworkConsensus {
            method,
            valid_after,
            fresh_until,
            valid_until,
            hsdir_interval,
            hsdir_n_replicas,
            hsdir_spread_store,
            previous_shared_rand,
            shared_rand,
        },
        relays,
    })
}

/// Parse an `r` line:
/// `r nickname identity digest date time IP ORPort DirPort`
fn parse_r_line(line: &str) -> Result<RelayBuilder> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return Err(TorError::Directory("short r line".into()));
    }

    Ok(RelayBuilder {
        nickname: parts[1].to_string(),
        identity: decode_b64_20(parts[2])?,
        digest: decode_b64_20(parts[3])?,
        address: parts[6]
            .parse()
            .map_err(|_| TorError::Directory("bad relay address".into()))?,
        or_port: parts[7]
            .parse()
            .map_err(|_| TorError::Directory("bad OR port".into()))?,
        dir_port: parts[8]
            .parse()
            .map_err(|_| TorError::Directory("bad dir port".into()))?,
        flags: None,
    })
}

/// The two keys a server descriptor contributes.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub ntor_onion_key: [u8; 32],
    pub master_key: Option<[u8; 32]>,
}

/// Parse a server descriptor fetched from `/tor/server/d/<digest>`.
pub fn parse_server_descriptor(text: &str) -> Result<ServerDescriptor> {
    let mut ntor_onion_key = None;
    let mut master_key = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ntor-onion-key ") {
            ntor_onion_key = Some(decode_b64_32(rest.trim())?);
        } else if let Some(rest) = line.strip_prefix("master-key-ed25519 ") {
            master_key = Some(decode_b64_32(rest.trim())?);
        }
    }

    Ok(ServerDescriptor {
        ntor_onion_key: ntor_onion_key
            .ok_or_else(|| TorError::Directory("descriptor missing ntor-onion-key".into()))?,
        master_key,
    })
}
