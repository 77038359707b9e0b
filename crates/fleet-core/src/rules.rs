//! Match patterns and the compiled rule set a node evaluates per connection.
//!
//! Evaluation order is fixed: the block list short-circuits first, then DNS
//! and outbound lists are scanned in record order and the first match wins.
//! Duplicate DNS servers are therefore harmless; the later copy is just never
//! reached for domains the earlier one already matches.
//!
//! Pattern grammar (shared by `DNS.domains`, `Block` and `Outbound.rules`):
//!
//! ```text
//! *                 any target
//! *.example.com     strict subdomains of example.com
//! domain:example.com  example.com and all of its subdomains
//! full:example.com  exactly example.com
//! example.com       exactly example.com
//! 10.0.0.1          one address
//! 10.0.0.0/8        CIDR range (IPv4 or IPv6)
//! ```

use std::net::IpAddr;

use crate::error::CodecError;
use crate::types::{ConfigRecord, DnsRule, IpStrategy};

/// One parsed match pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches everything
    Any,
    /// Exact domain
    Exact(String),
    /// Strict subdomains of the stored suffix
    Subdomain(String),
    /// Domain and its subdomains
    Domain(String),
    /// Single address
    Ip(IpAddr),
    /// Address range
    Cidr {
        /// Network address
        network: IpAddr,
        /// Prefix length in bits
        prefix: u8,
    },
}

impl Pattern {
    /// Parse a pattern string.
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CodecError::schema("empty match pattern"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(CodecError::schema(format!(
                "match pattern contains whitespace: {raw:?}"
            )));
        }
        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(rest) = raw.strip_prefix("full:") {
            return domain_name(rest, raw).map(Self::Exact);
        }
        if let Some(rest) = raw.strip_prefix("domain:") {
            return domain_name(rest, raw).map(Self::Domain);
        }
        if let Some(rest) = raw.strip_prefix("*.") {
            return domain_name(rest, raw).map(Self::Subdomain);
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }
        if let Some((addr, prefix)) = raw.split_once('/') {
            let network = addr
                .parse::<IpAddr>()
                .map_err(|_| CodecError::schema(format!("invalid CIDR address: {raw}")))?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            let prefix = prefix
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| CodecError::schema(format!("invalid CIDR prefix: {raw}")))?;
            return Ok(Self::Cidr { network, prefix });
        }
        domain_name(raw, raw).map(Self::Exact)
    }

    /// Check whether a target matches this pattern.
    #[must_use]
    pub fn matches(&self, target: &Target) -> bool {
        match (self, target) {
            (Self::Any, _) => true,
            (Self::Exact(name), Target::Domain(domain)) => name == domain,
            (Self::Subdomain(suffix), Target::Domain(domain)) => is_subdomain(domain, suffix),
            (Self::Domain(name), Target::Domain(domain)) => {
                name == domain || is_subdomain(domain, name)
            }
            (Self::Ip(ip), Target::Ip(addr)) => ip == addr,
            (Self::Cidr { network, prefix }, Target::Ip(addr)) => {
                cidr_contains(*network, *prefix, *addr)
            }
            _ => false,
        }
    }
}

/// A connection target as seen by the node: a domain or a literal address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Normalized domain name (lowercase, no trailing dot)
    Domain(String),
    /// Literal address
    Ip(IpAddr),
}

impl Target {
    /// Classify and normalize a raw target string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Domain(normalize(raw)),
        }
    }
}

/// Routing decision for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// Matched the block list
    Blocked,
    /// Dispatch through the named outbound
    Outbound(&'a str),
    /// No outbound rule matched
    Direct,
}

#[derive(Debug, Clone)]
struct CompiledDns {
    patterns: Vec<Pattern>,
    rule: DnsRule,
}

#[derive(Debug, Clone)]
struct CompiledOutbound {
    name: String,
    patterns: Vec<Pattern>,
}

/// Lookup structure compiled from a [`ConfigRecord`].
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    strategy: IpStrategy,
    block: Vec<Pattern>,
    dns: Vec<CompiledDns>,
    outbound: Vec<CompiledOutbound>,
}

impl RuleSet {
    /// Compile a record. Fails with a schema violation on any bad pattern.
    pub fn compile(record: &ConfigRecord) -> Result<Self, CodecError> {
        let block = record
            .block
            .iter()
            .map(|p| Pattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;

        let dns = record
            .dns
            .iter()
            .map(|rule| {
                let patterns = rule
                    .domains
                    .iter()
                    .map(|d| Pattern::parse(d))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledDns {
                    patterns,
                    rule: rule.clone(),
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;

        let outbound = record
            .outbound
            .iter()
            .map(|o| {
                let patterns = o
                    .rules
                    .iter()
                    .map(|r| Pattern::parse(r))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledOutbound {
                    name: o.name.clone(),
                    patterns,
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;

        Ok(Self {
            strategy: record.ip_strategy.parse()?,
            block,
            dns,
            outbound,
        })
    }

    /// Address family strategy for resolved targets
    #[must_use]
    pub const fn ip_strategy(&self) -> IpStrategy {
        self.strategy
    }

    /// True if the target hits the block list
    #[must_use]
    pub fn is_blocked(&self, target: &str) -> bool {
        let target = Target::parse(target);
        self.block.iter().any(|p| p.matches(&target))
    }

    /// Decide how a target is dispatched.
    #[must_use]
    pub fn route(&self, target: &str) -> Route<'_> {
        let target = Target::parse(target);
        if self.block.iter().any(|p| p.matches(&target)) {
            return Route::Blocked;
        }
        self.outbound
            .iter()
            .find(|o| o.patterns.iter().any(|p| p.matches(&target)))
            .map_or(Route::Direct, |o| Route::Outbound(&o.name))
    }

    /// First DNS rule responsible for a domain. Blocked domains get none.
    #[must_use]
    pub fn dns_for(&self, domain: &str) -> Option<&DnsRule> {
        let target = Target::parse(domain);
        if matches!(target, Target::Ip(_)) || self.block.iter().any(|p| p.matches(&target)) {
            return None;
        }
        self.dns
            .iter()
            .find(|d| d.patterns.is_empty() || d.patterns.iter().any(|p| p.matches(&target)))
            .map(|d| &d.rule)
    }
}

fn domain_name(name: &str, raw: &str) -> Result<String, CodecError> {
    let name = normalize(name);
    if name.is_empty() || name.contains('*') || name.starts_with('.') {
        return Err(CodecError::schema(format!("invalid domain pattern: {raw}")));
    }
    Ok(name)
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn is_subdomain(domain: &str, suffix: &str) -> bool {
    domain.len() > suffix.len()
        && domain.ends_with(suffix)
        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
}

fn cidr_contains(network: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}
