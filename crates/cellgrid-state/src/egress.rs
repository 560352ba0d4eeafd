//! Egress rule matching.
//!
//! A container may open outbound connections only to destinations some
//! rule allows; with no rules nothing is allowed. Destinations are IPv4
//! addresses, CIDR blocks (`10.0.0.0/8`) or inclusive ranges
//! (`9.0.0.0-89.255.255.255`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{StateError, StateResult};
use crate::types::EgressRule;

const PROTOCOLS: [&str; 4] = ["tcp", "udp", "icmp", "all"];

/// Inclusive IPv4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Range {
    start: u32,
    end: u32,
}

impl Ipv4Range {
    fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.start..=self.end).contains(&u32::from(ip))
    }
}

fn parse_destination(destination: &str) -> Option<Ipv4Range> {
    let destination = destination.trim();
    if let Some((ip, bits)) = destination.split_once('/') {
        let base = u32::from(ip.parse::<Ipv4Addr>().ok()?);
        let bits: u32 = bits.parse().ok()?;
        if bits > 32 {
            return None;
        }
        let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
        return Some(Ipv4Range {
            start: base & mask,
            end: (base & mask) | !mask,
        });
    }
    if let Some((start, end)) = destination.split_once('-') {
        let start = u32::from(start.trim().parse::<Ipv4Addr>().ok()?);
        let end = u32::from(end.trim().parse::<Ipv4Addr>().ok()?);
        return (start <= end).then_some(Ipv4Range { start, end });
    }
    let ip = u32::from(destination.parse::<Ipv4Addr>().ok()?);
    Some(Ipv4Range { start: ip, end: ip })
}

impl EgressRule {
    pub fn validate(&self) -> StateResult<()> {
        if !PROTOCOLS.contains(&self.protocol.as_str()) {
            return Err(StateError::Invalid(format!(
                "egress protocol must be one of {PROTOCOLS:?}: {}",
                self.protocol
            )));
        }
        if self.destinations.is_empty() {
            return Err(StateError::Invalid(
                "egress rule needs at least one destination".to_string(),
            ));
        }
        if let Some(bad) = self
            .destinations
            .iter()
            .find(|d| parse_destination(d).is_none())
        {
            return Err(StateError::Invalid(format!("invalid egress destination {bad}")));
        }
        if let Some(range) = &self.port_range {
            if range.start > range.end {
                return Err(StateError::Invalid(format!(
                    "egress port range {}-{} is empty",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    /// Whether `protocol` traffic to `addr` passes this rule.
    pub fn allows(&self, protocol: &str, addr: SocketAddr) -> bool {
        if self.protocol != "all" && self.protocol != protocol {
            return false;
        }
        let port = addr.port();
        let any_port = self.ports.is_empty() && self.port_range.is_none();
        let port_ok = any_port
            || self.ports.contains(&port)
            || self
                .port_range
                .is_some_and(|r| (r.start..=r.end).contains(&port));
        if !port_ok {
            return false;
        }
        let IpAddr::V4(ip) = addr.ip() else {
            return false;
        };
        self.destinations
            .iter()
            .filter_map(|d| parse_destination(d))
            .any(|range| range.contains(ip))
    }
}

/// Default deny: `addr` is reachable only if some rule allows it.
pub fn egress_allowed(rules: &[EgressRule], protocol: &str, addr: SocketAddr) -> bool {
    rules.iter().any(|rule| rule.allows(protocol, addr))
}
