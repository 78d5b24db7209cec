//! # Transport Session Identifiers
//!
//! A TSI is the 6-byte GSI (Global Source Identifier) plus the sender's
//! 16-bit source port: 8 bytes that name one sender's session uniquely across
//! the network.

use std::fmt;

use rand::Rng;

/// Length of a GSI in bytes.
pub const GSI_LEN: usize = 6;

// ─── Gsi ────────────────────────────────────────────────────────────────────

/// Global Source Identifier — the 6-byte portion of a TSI.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Gsi([u8; GSI_LEN]);

impl Gsi {
    pub const fn new(bytes: [u8; GSI_LEN]) -> Self {
        Gsi(bytes)
    }

    /// Generate a random GSI. A restarted source must not reuse its previous
    /// GSI+sport, or receivers will conflate the sessions.
    pub fn random() -> Self {
        let mut bytes = [0u8; GSI_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Gsi(bytes)
    }

    /// Derive a GSI from an IPv4 address: the low 4 address bytes prefixed
    /// with two random bytes, mirroring the address-based construction of
    /// the protocol's reference sources.
    pub fn from_addr(addr: std::net::Ipv4Addr) -> Self {
        let mut bytes = [0u8; GSI_LEN];
        rand::rng().fill_bytes(&mut bytes[..2]);
        bytes[2..].copy_from_slice(&addr.octets());
        Gsi(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; GSI_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; GSI_LEN]
    }
}

impl From<[u8; GSI_LEN]> for Gsi {
    fn from(bytes: [u8; GSI_LEN]) -> Self {
        Gsi(bytes)
    }
}

impl fmt::Debug for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gsi({self})")
    }
}

impl fmt::Display for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

// ─── Tsi ────────────────────────────────────────────────────────────────────

/// Transport Session Identifier: GSI + source port.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl Tsi {
    pub const fn new(gsi: Gsi, sport: u16) -> Self {
        Tsi { gsi, sport }
    }

    pub fn is_null(&self) -> bool {
        self.gsi.is_null() && self.sport == 0
    }
}

impl fmt::Debug for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tsi({self})")
    }
}

impl fmt::Display for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn display_format() {
        let tsi = Tsi::new(Gsi::new([1, 2, 3, 4, 5, 6]), 7500);
        assert_eq!(tsi.to_string(), "1.2.3.4.5.6.7500");
    }

    #[test]
    fn null_detection() {
        assert!(Tsi::default().is_null());
        assert!(!Tsi::new(Gsi::new([0, 0, 0, 0, 0, 1]), 0).is_null());
        assert!(!Tsi::new(Gsi::default(), 1).is_null());
    }

    #[test]
    fn random_gsis_differ() {
        // Collision probability over 2^48 is negligible for a handful.
        let a = Gsi::random();
        let b = Gsi::random();
        assert_ne!(a, b);
    }

    #[test]
    fn from_addr_embeds_octets() {
        let gsi = Gsi::from_addr(std::net::Ipv4Addr::new(10, 6, 28, 33));
        assert_eq!(&gsi.as_bytes()[2..], &[10, 6, 28, 33]);
    }

    #[test]
    fn usable_as_map_key() {
        let mut peers: HashMap<Tsi, u32> = HashMap::new();
        let tsi = Tsi::new(Gsi::new([9, 8, 7, 6, 5, 4]), 3056);
        peers.insert(tsi, 42);
        assert_eq!(peers.get(&tsi), Some(&42));
    }
}
