use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::WireCodec;
use crate::error::CodecError;
use crate::rules::Pattern;

/// Interval used when a record leaves `NodePullInterval` or `NodePushInterval` at zero
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Configuration payload distributed to one node.
///
/// Wire names match what the panel has always emitted, so records written by
/// older control planes decode unchanged. Every field is optional on the
/// wire; absent or `null` fields decode to their zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRecord {
    /// Credential authenticating pull/push requests for this node
    #[serde(rename = "NodeSecret", deserialize_with = "nullable")]
    pub node_secret: String,

    /// Seconds between config pulls (0 = default)
    #[serde(rename = "NodePullInterval", deserialize_with = "nullable")]
    pub pull_interval: i64,

    /// Seconds between traffic pushes (0 = default)
    #[serde(rename = "NodePushInterval", deserialize_with = "nullable")]
    pub push_interval: i64,

    /// Accumulated bytes that trigger an early push (0 = every push cycle)
    #[serde(rename = "TrafficReportThreshold", deserialize_with = "nullable")]
    pub traffic_report_threshold: i64,

    /// Address family strategy tag, see [`IpStrategy`]
    #[serde(rename = "IPStrategy", deserialize_with = "nullable")]
    pub ip_strategy: String,

    /// Ordered DNS resolution rules
    #[serde(rename = "DNS", deserialize_with = "nullable")]
    pub dns: Vec<DnsRule>,

    /// Domain/IP patterns that are refused outright
    #[serde(rename = "Block", deserialize_with = "nullable")]
    pub block: Vec<String>,

    /// Ordered upstream routes
    #[serde(rename = "Outbound", deserialize_with = "nullable")]
    pub outbound: Vec<OutboundRule>,
}

impl ConfigRecord {
    /// Effective pull interval
    #[must_use]
    pub fn pull_interval(&self) -> Duration {
        interval_or_default(self.pull_interval)
    }

    /// Effective push interval
    #[must_use]
    pub fn push_interval(&self) -> Duration {
        interval_or_default(self.push_interval)
    }

    /// Reporting threshold in bytes; 0 disables threshold-triggered pushes
    #[must_use]
    pub fn report_threshold(&self) -> u64 {
        u64::try_from(self.traffic_report_threshold).unwrap_or(0)
    }

    /// Parsed IP strategy (invalid tags map to the default)
    #[must_use]
    pub fn strategy(&self) -> IpStrategy {
        self.ip_strategy.parse().unwrap_or_default()
    }

    /// Look up an outbound by name
    #[must_use]
    pub fn outbound(&self, name: &str) -> Option<&OutboundRule> {
        self.outbound.iter().find(|o| o.name == name)
    }

    /// Validate a record before it becomes the authoritative version for a node.
    ///
    /// On top of [`WireCodec::validate`], the secret must be set.
    pub fn validate_active(&self) -> Result<(), CodecError> {
        if self.node_secret.is_empty() {
            return Err(CodecError::schema("NodeSecret must not be empty"));
        }
        self.validate()
    }
}

impl WireCodec for ConfigRecord {
    fn validate(&self) -> Result<(), CodecError> {
        if self.pull_interval < 0 {
            return Err(CodecError::schema(format!(
                "NodePullInterval must not be negative, got {}",
                self.pull_interval
            )));
        }
        if self.push_interval < 0 {
            return Err(CodecError::schema(format!(
                "NodePushInterval must not be negative, got {}",
                self.push_interval
            )));
        }
        if self.traffic_report_threshold < 0 {
            return Err(CodecError::schema(format!(
                "TrafficReportThreshold must not be negative, got {}",
                self.traffic_report_threshold
            )));
        }
        self.ip_strategy.parse::<IpStrategy>()?;

        for rule in &self.dns {
            rule.validate()?;
        }
        for pattern in &self.block {
            Pattern::parse(pattern)?;
        }

        let mut names = HashSet::with_capacity(self.outbound.len());
        for outbound in &self.outbound {
            outbound.validate()?;
            if !names.insert(outbound.name.as_str()) {
                return Err(CodecError::schema(format!(
                    "duplicate outbound name: {}",
                    outbound.name
                )));
            }
        }
        Ok(())
    }
}

/// One DNS resolution rule.
///
/// An empty `domains` list makes the server a catch-all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsRule {
    /// Resolver protocol (udp, tcp, tls, https, ...)
    #[serde(deserialize_with = "nullable")]
    pub proto: String,

    /// Resolver address
    #[serde(deserialize_with = "nullable")]
    pub address: String,

    /// Domain patterns routed to this resolver
    #[serde(deserialize_with = "nullable")]
    pub domains: Vec<String>,
}

impl WireCodec for DnsRule {
    fn validate(&self) -> Result<(), CodecError> {
        if self.proto.is_empty() {
            return Err(CodecError::schema("dns rule proto must not be empty"));
        }
        if self.address.is_empty() {
            return Err(CodecError::schema("dns rule address must not be empty"));
        }
        for domain in &self.domains {
            Pattern::parse(domain)?;
        }
        Ok(())
    }
}

/// A named upstream route.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundRule {
    /// Unique name, referenced by external routing rules
    #[serde(deserialize_with = "nullable")]
    pub name: String,

    /// Upstream protocol
    #[serde(deserialize_with = "nullable")]
    pub protocol: String,

    /// Upstream host
    #[serde(deserialize_with = "nullable")]
    pub address: String,

    /// Upstream port, 1-65535
    #[serde(deserialize_with = "nullable")]
    pub port: i64,

    /// Upstream credential
    #[serde(deserialize_with = "nullable")]
    pub password: String,

    /// Patterns dispatched through this outbound
    #[serde(deserialize_with = "nullable")]
    pub rules: Vec<String>,
}

impl OutboundRule {
    /// Port as a socket port. Only meaningful on validated records.
    #[must_use]
    pub fn port(&self) -> u16 {
        u16::try_from(self.port).unwrap_or(0)
    }
}

impl fmt::Debug for OutboundRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRule")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .field("rules", &self.rules)
            .finish()
    }
}

impl WireCodec for OutboundRule {
    fn validate(&self) -> Result<(), CodecError> {
        if self.name.is_empty() {
            return Err(CodecError::schema("outbound name must not be empty"));
        }
        if self.protocol.is_empty() {
            return Err(CodecError::schema(format!(
                "outbound {}: protocol must not be empty",
                self.name
            )));
        }
        if self.address.is_empty() {
            return Err(CodecError::schema(format!(
                "outbound {}: address must not be empty",
                self.name
            )));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(CodecError::schema(format!(
                "outbound {}: port {} out of range",
                self.name, self.port
            )));
        }
        for rule in &self.rules {
            Pattern::parse(rule)?;
        }
        Ok(())
    }
}

/// Address family strategy applied by the node runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IpStrategy {
    /// Use whatever the resolver returns
    #[default]
    AsIs,
    /// Prefer A records, fall back to AAAA
    PreferIpv4,
    /// Prefer AAAA records, fall back to A
    PreferIpv6,
    /// Only A records
    Ipv4Only,
    /// Only AAAA records
    Ipv6Only,
    /// Race both families
    Dual,
}

impl IpStrategy {
    /// Wire tag for this strategy
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AsIs => "",
            Self::PreferIpv4 => "prefer_ipv4",
            Self::PreferIpv6 => "prefer_ipv6",
            Self::Ipv4Only => "ipv4_only",
            Self::Ipv6Only => "ipv6_only",
            Self::Dual => "dual",
        }
    }
}

impl FromStr for IpStrategy {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "as_is" => Ok(Self::AsIs),
            "prefer_ipv4" => Ok(Self::PreferIpv4),
            "prefer_ipv6" => Ok(Self::PreferIpv6),
            "ipv4_only" => Ok(Self::Ipv4Only),
            "ipv6_only" => Ok(Self::Ipv6Only),
            "dual" => Ok(Self::Dual),
            other => Err(CodecError::schema(format!("unknown IPStrategy: {other}"))),
        }
    }
}

impl fmt::Display for IpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as issued at a specific version.
///
/// Records are never mutated after issue; a new version is created instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Monotonic version assigned by the control plane (first issue is 1)
    pub version: u64,
    /// The issued payload
    pub record: Arc<ConfigRecord>,
}

impl VersionedRecord {
    /// Wrap a record at a version.
    #[must_use]
    pub fn new(version: u64, record: ConfigRecord) -> Self {
        Self {
            version,
            record: Arc::new(record),
        }
    }
}

fn interval_or_default(secs: i64) -> Duration {
    match u64::try_from(secs) {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => Duration::from_secs(DEFAULT_INTERVAL_SECS),
    }
}

// The panel serializes unset slices and strings as `null`.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}
