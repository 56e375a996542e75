//! Core types for meshplane

use crate::{Error, Result};
use chrono::{DateTime, SubsecRound, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Current time at the millisecond precision the store keeps, so records
/// compare equal to their persisted copies
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ============================================================================
// Organizations and memberships
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role of a user within an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipRole {
    Admin,
    Operator,
    Viewer,
}

impl Default for MembershipRole {
    fn default() -> Self {
        Self::Viewer
    }
}

impl std::fmt::Display for MembershipRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Operator => write!(f, "operator"),
            Self::Viewer => write!(f, "viewer"),
        }
    }
}

impl std::str::FromStr for MembershipRole {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Self::Admin),
            "operator" => Ok(Self::Operator),
            "viewer" => Ok(Self::Viewer),
            _ => Err(Error::validation(format!("unknown membership role: {}", s))),
        }
    }
}

/// The user on whose behalf an operation runs. Identity itself is owned by
/// the authentication layer; only the id and email matter here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub role: MembershipRole,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Networks
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub cidr: Ipv4Network,
    pub description: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parse an IPv4 CIDR block in strict form.
///
/// A bare address is accepted as a /32. Host bits must be clear, so
/// `10.0.0.1/24` is rejected rather than silently truncated.
pub fn parse_cidr(value: &str) -> Result<Ipv4Network> {
    let value = value.trim();
    let parsed: IpNetwork = value
        .parse()
        .map_err(|e| Error::validation(format!("Invalid CIDR notation '{}': {}", value, e)))?;

    let net = match parsed {
        IpNetwork::V4(net) => net,
        IpNetwork::V6(_) => {
            return Err(Error::validation("Only IPv4 networks are supported"));
        }
    };

    if net.ip() != net.network() {
        return Err(Error::validation(format!(
            "Invalid CIDR notation '{}': host bits set",
            value
        )));
    }
    Ok(net)
}

// ============================================================================
// Certificates
// ============================================================================

/// Per-organization certificate authority
#[derive(Clone, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub network_id: Uuid,
    pub ca_cert: String,
    #[serde(skip_serializing)]
    pub ca_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl CertificateAuthority {
    /// A CA can sign when it is neither revoked nor expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("id", &self.id)
            .field("organization_id", &self.organization_id)
            .field("network_id", &self.network_id)
            .field("expires_at", &self.expires_at)
            .field("revoked", &self.revoked)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateKind {
    Node,
    Lighthouse,
}

impl std::fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Lighthouse => write!(f, "lighthouse"),
        }
    }
}

impl std::str::FromStr for CertificateKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" => Ok(Self::Node),
            "lighthouse" => Ok(Self::Lighthouse),
            _ => Err(Error::validation(format!("unknown certificate kind: {}", s))),
        }
    }
}

/// Signed device certificate
#[derive(Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub ca_id: Uuid,
    pub kind: CertificateKind,
    pub cert: String,
    #[serde(skip_serializing)]
    pub key: String,
    pub overlay_ip: Ipv4Addr,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id)
            .field("ca_id", &self.ca_id)
            .field("kind", &self.kind)
            .field("overlay_ip", &self.overlay_ip)
            .field("expires_at", &self.expires_at)
            .field("revoked", &self.revoked)
            .finish()
    }
}

// ============================================================================
// Security groups and firewall rules
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            _ => Err(Error::validation(format!("unknown rule direction: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
            Self::Any => write!(f, "any"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "any" => Ok(Self::Any),
            _ => Err(Error::validation(format!("unknown protocol: {}", s))),
        }
    }
}

/// Port selector of a firewall rule: a single port or an inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSpec {
    Single(u16),
    Range { start: u16, end: u16 },
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(port) => write!(f, "{}", port),
            Self::Range { start, end } => write!(f, "{}-{}", start, end),
        }
    }
}

fn parse_port_number(s: &str) -> Option<u16> {
    let n: u32 = s.trim().parse().ok()?;
    if (1..=65535).contains(&n) {
        Some(n as u16)
    } else {
        None
    }
}

impl std::str::FromStr for PortSpec {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            let range = parse_port_number(start)
                .zip(parse_port_number(end))
                .filter(|(start, end)| start <= end);
            match range {
                Some((start, end)) => Ok(Self::Range { start, end }),
                None => Err(Error::validation(
                    "Invalid port range format. Use \"start-end\" where 1 <= start <= end <= 65535",
                )),
            }
        } else {
            parse_port_number(s)
                .map(Self::Single)
                .ok_or_else(|| Error::validation("Port must be between 1 and 65535"))
        }
    }
}

impl TryFrom<String> for PortSpec {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(port: PortSpec) -> Self {
        port.to_string()
    }
}

/// What a firewall rule matches against. Exactly one selector per rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    Host(String),
    Cidr(Ipv4Network),
    Group(Uuid),
    Groups(Vec<Uuid>),
}

impl RuleTarget {
    /// Security groups this target refers to, in attachment order
    pub fn referenced_groups(&self) -> Vec<Uuid> {
        match self {
            Self::Group(id) => vec![*id],
            Self::Groups(ids) => ids.clone(),
            Self::Host(_) | Self::Cidr(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: Uuid,
    pub security_group_id: Uuid,
    pub direction: Direction,
    pub protocol: Protocol,
    pub port: Option<PortSpec>,
    pub target: RuleTarget,
    pub local_cidr: Option<Ipv4Network>,
    pub ca_name: Option<String>,
    pub ca_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Devices
// ============================================================================

/// Default listen port for mesh devices
pub const DEFAULT_LISTEN_PORT: u16 = 4242;

/// Node- or lighthouse-specific device attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceKind {
    Node {
        lighthouse_id: Option<Uuid>,
    },
    Lighthouse {
        public_ip: IpAddr,
        port: u16,
        is_active: bool,
    },
}

impl DeviceKind {
    pub fn certificate_kind(&self) -> CertificateKind {
        match self {
            Self::Node { .. } => CertificateKind::Node,
            Self::Lighthouse { .. } => CertificateKind::Lighthouse,
        }
    }

    pub fn is_lighthouse(&self) -> bool {
        matches!(self, Self::Lighthouse { .. })
    }

    /// Nodes are always active; lighthouses carry an explicit flag
    pub fn is_active(&self) -> bool {
        match self {
            Self::Node { .. } => true,
            Self::Lighthouse { is_active, .. } => *is_active,
        }
    }
}

/// A mesh device: node or lighthouse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub network_id: Uuid,
    pub name: String,
    pub hostname: String,
    pub overlay_ip: Ipv4Addr,
    pub certificate_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: DeviceKind,
    /// Last generated configuration document; `{}` until provisioned
    pub config: serde_json::Value,
    pub config_digest: Option<String>,
    /// Digest of the configuration most recently handed to the device
    pub delivered_digest: Option<String>,
    pub last_check_in: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            DeviceKind::Node { .. } => "node",
            DeviceKind::Lighthouse { .. } => "lighthouse",
        }
    }

    pub fn has_config(&self) -> bool {
        self.config_digest.is_some()
    }
}

// ============================================================================
// API keys
// ============================================================================

/// The single device an API key authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "device_id", rename_all = "lowercase")]
pub enum ApiKeyOwner {
    Node(Uuid),
    Lighthouse(Uuid),
}

impl ApiKeyOwner {
    pub fn for_device(device: &Device) -> Self {
        match device.kind {
            DeviceKind::Node { .. } => Self::Node(device.id),
            DeviceKind::Lighthouse { .. } => Self::Lighthouse(device.id),
        }
    }

    pub fn device_id(&self) -> Uuid {
        match self {
            Self::Node(id) | Self::Lighthouse(id) => *id,
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::Node(_) => "node",
            Self::Lighthouse(_) => "lighthouse",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub owner: ApiKeyOwner,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let net = parse_cidr("10.0.0.0/29").unwrap();
        assert_eq!(net.prefix(), 29);
        assert_eq!(net.network(), Ipv4Addr::new(10, 0, 0, 0));

        assert!(parse_cidr("not-a-cidr").is_err());
        assert!(parse_cidr("10.0.0.1/24").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());

        let err = parse_cidr("fd00::/64").unwrap_err();
        assert!(err.to_string().contains("Only IPv4"));
    }

    #[test]
    fn test_port_spec_parsing() {
        assert_eq!("80".parse::<PortSpec>().unwrap(), PortSpec::Single(80));
        assert_eq!(
            "1-65535".parse::<PortSpec>().unwrap(),
            PortSpec::Range { start: 1, end: 65535 }
        );
        assert_eq!(
            "22-22".parse::<PortSpec>().unwrap(),
            PortSpec::Range { start: 22, end: 22 }
        );

        for bad in ["0", "65536", "abc", "100-50", "1-", "-5", "1-70000", "any", ""] {
            assert!(bad.parse::<PortSpec>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_port_spec_display() {
        assert_eq!(PortSpec::Single(443).to_string(), "443");
        assert_eq!(PortSpec::Range { start: 1000, end: 2000 }.to_string(), "1000-2000");
    }

    #[test]
    fn test_rule_target_serialization() {
        let group = Uuid::new_v4();
        let json = serde_json::to_value(RuleTarget::Group(group)).unwrap();
        assert_eq!(json, serde_json::json!({ "group": group.to_string() }));

        let cidr = RuleTarget::Cidr(parse_cidr("10.1.0.0/16").unwrap());
        let json = serde_json::to_string(&cidr).unwrap();
        assert_eq!(json, r#"{"cidr":"10.1.0.0/16"}"#);
        let back: RuleTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cidr);
    }

    #[test]
    fn test_device_kind_helpers() {
        let lighthouse = DeviceKind::Lighthouse {
            public_ip: "203.0.113.10".parse().unwrap(),
            port: DEFAULT_LISTEN_PORT,
            is_active: false,
        };
        assert!(lighthouse.is_lighthouse());
        assert!(!lighthouse.is_active());
        assert_eq!(lighthouse.certificate_kind(), CertificateKind::Lighthouse);

        let node = DeviceKind::Node { lighthouse_id: None };
        assert!(node.is_active());
        assert_eq!(node.certificate_kind(), CertificateKind::Node);
    }

    #[test]
    fn test_timestamp_now_has_millisecond_precision() {
        let now = timestamp_now();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(DateTime::from_timestamp_millis(now.timestamp_millis()), Some(now));
    }

    #[test]
    fn test_api_key_expiry() {
        let now = Utc::now();
        let mut key = ApiKey {
            id: Uuid::new_v4(),
            name: "laptop API Key".to_string(),
            key_hash: String::new(),
            owner: ApiKeyOwner::Node(Uuid::new_v4()),
            is_active: true,
            expires_at: None,
            last_used: None,
            created_at: now,
        };
        assert!(!key.is_expired(now));

        key.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(key.is_expired(now));
    }
}
