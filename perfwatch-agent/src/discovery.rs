//! Host identification for the perfwatch agent
//!
//! This module handles:
//! - Primary MAC address selection (first non-loopback, non-zero hardware address)
//! - HostIdentity derivation: SHA-256 of the colon separated MAC, hex encoded
//! - HostLabel normalisation for the optional display name

use crate::error::StartupError;
use crate::probe::{InterfaceInfo, OsProbe};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info};

/// All-zero hardware address reported by tunnels and some virtual devices
const ZERO_MAC: [u8; 6] = [0; 6];

/// Stable per-host key; 64 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostIdentity(String);

impl HostIdentity {
    /// Derive the identity from a hardware address
    pub fn from_mac(mac: &[u8; 6]) -> Self {
        let digest = Sha256::digest(format_mac(mac).as_bytes());
        Self(hex::encode(digest))
    }

    /// Wrap an already derived token (stored rows, tests)
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, enough to tell hosts apart in logs
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((cut, _)) => &self.0[..cut],
            None => &self.0,
        }
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human assigned display name for a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostLabel(String);

impl HostLabel {
    /// Trimmed label, or `None` when nothing but whitespace was supplied
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase colon separated rendering (`a1:b2:c3:d4:e5:f6`)
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// First interface, in enumeration order, that is not loopback and has a real MAC
pub fn select_primary_mac(interfaces: &[InterfaceInfo]) -> Option<(&InterfaceInfo, [u8; 6])> {
    interfaces.iter().find_map(|interface| {
        if interface.is_loopback {
            return None;
        }
        match interface.mac {
            Some(mac) if mac != ZERO_MAC => Some((interface, mac)),
            _ => {
                debug!("Skipping {}: no usable hardware address", interface.name);
                None
            }
        }
    })
}

/// Derives the HostIdentity once at startup
pub struct IdentityResolver<'a> {
    probe: &'a dyn OsProbe,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(probe: &'a dyn OsProbe) -> Self {
        Self { probe }
    }

    /// Resolve the identity of this host, failing when no interface qualifies
    pub fn resolve(&self) -> Result<HostIdentity, StartupError> {
        debug!("Enumerating network interfaces...");

        let interfaces = self
            .probe
            .interfaces()
            .map_err(StartupError::InterfaceEnumeration)?;

        let (interface, mac) =
            select_primary_mac(&interfaces).ok_or(StartupError::NoInterfaceFound)?;
        let identity = HostIdentity::from_mac(&mac);

        info!(
            "Selected primary MAC {} on {} from {} interfaces - System ID: {}",
            format_mac(&mac),
            interface.name,
            interfaces.len(),
            identity
        );
        Ok(identity)
    }
}
