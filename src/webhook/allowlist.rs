//! IP allowlist (C10): literal addresses plus CIDR networks, matched the
//! same way the gateway's SSRF guard walks octets/segments by hand
//! rather than reaching for a `cidr`/`ipnet` crate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{Error, Result};

/// A parsed CIDR network, IPv4 or IPv6.
#[derive(Debug, Clone, Copy)]
enum Network {
    V4(Ipv4Addr, u32),
    V6(Ipv6Addr, u32),
}

impl Network {
    fn contains(self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Self::V4(net, prefix), IpAddr::V4(ip)) => {
                let mask = v4_mask(prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (Self::V6(net, prefix), IpAddr::V6(ip)) => {
                let mask = v6_mask(prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u32) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
}

fn v6_mask(prefix: u32) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) }
}

/// Set of literal IPs plus CIDR networks (spec §4.10). An empty allowlist
/// permits everything.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    literals: Vec<IpAddr>,
    networks: Vec<Network>,
}

impl Allowlist {
    /// Empty allowlist: every address is allowed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an allowlist from a mix of literal addresses and CIDR
    /// entries (`"a.b.c.d"` or `"a.b.c.d/n"`, same for IPv6).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] for any entry that is neither a
    /// valid address nor a valid CIDR network.
    pub fn from_entries<S: AsRef<str>>(entries: impl IntoIterator<Item = S>) -> Result<Self> {
        let mut allowlist = Self::new();
        for entry in entries {
            allowlist.add(entry.as_ref())?;
        }
        Ok(allowlist)
    }

    /// Add one literal address or CIDR entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `entry` parses as neither.
    pub fn add(&mut self, entry: &str) -> Result<()> {
        if let Some((addr_part, prefix_part)) = entry.split_once('/') {
            let prefix: u32 = prefix_part
                .parse()
                .map_err(|_| Error::InvalidAddress(entry.to_string()))?;
            match addr_part
                .parse::<IpAddr>()
                .map_err(|_| Error::InvalidAddress(entry.to_string()))?
            {
                IpAddr::V4(addr) if prefix <= 32 => self.networks.push(Network::V4(addr, prefix)),
                IpAddr::V6(addr) if prefix <= 128 => self.networks.push(Network::V6(addr, prefix)),
                _ => return Err(Error::InvalidAddress(entry.to_string())),
            }
        } else {
            let addr = entry
                .parse::<IpAddr>()
                .map_err(|_| Error::InvalidAddress(entry.to_string()))?;
            self.literals.push(addr);
        }
        Ok(())
    }

    /// Whether `ip` is permitted: empty allowlist allows all; otherwise
    /// literal match first, then CIDR of the matching family.
    #[must_use]
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.literals.is_empty() && self.networks.is_empty() {
            return true;
        }
        if self.literals.contains(&ip) {
            return true;
        }
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// Parse and check a raw address string; malformed input is never
    /// allowed regardless of allowlist contents.
    #[must_use]
    pub fn is_allowed_str(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>().is_ok_and(|ip| self.is_allowed(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_permits_everything() {
        let allowlist = Allowlist::new();
        assert!(allowlist.is_allowed("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn literal_match_is_allowed() {
        let allowlist = Allowlist::from_entries(["10.0.0.5"]).unwrap();
        assert!(allowlist.is_allowed("10.0.0.5".parse().unwrap()));
        assert!(!allowlist.is_allowed("10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn slash_thirty_includes_all_four_boundary_addresses() {
        let allowlist = Allowlist::from_entries(["10.0.0.0/30"]).unwrap();
        for last_octet in 0..=3u8 {
            let ip = Ipv4Addr::new(10, 0, 0, last_octet);
            assert!(allowlist.is_allowed(IpAddr::V4(ip)), "{ip} should be inside /30");
        }
        assert!(!allowlist.is_allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4))));
    }

    #[test]
    fn ipv6_cidr_matches_by_segment_mask() {
        let allowlist = Allowlist::from_entries(["2001:db8::/32"]).unwrap();
        assert!(allowlist.is_allowed("2001:db8::1".parse().unwrap()));
        assert!(!allowlist.is_allowed("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_entries_at_mutation_time() {
        assert!(matches!(
            Allowlist::from_entries(["not-an-ip"]),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            Allowlist::from_entries(["10.0.0.0/999"]),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn malformed_query_is_never_allowed() {
        let allowlist = Allowlist::from_entries(["10.0.0.0/8"]).unwrap();
        assert!(!allowlist.is_allowed_str("garbage"));
    }
}
