//! Device configuration documents
//!
//! The document is a tree of plain structs so that field order, and with it
//! the serialized bytes and digest, only depends on the inputs.

use crate::firewall::{CompiledRule, CompiledRules};
use meshplane_common::{
    sha256_hex, Certificate, CertificateAuthority, Device, DeviceKind, Error, Result,
    DEFAULT_LISTEN_PORT,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub pki: PkiBlock,
    pub tun: TunBlock,
    pub relay: RelayBlock,
    pub cipher: String,
    pub listen: ListenBlock,
    pub punchy: PunchyBlock,
    pub logging: LoggingBlock,
    pub firewall: FirewallBlock,
    pub lighthouse: LighthouseBlock,
    pub static_host_map: Option<serde_json::Value>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiBlock {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl std::fmt::Debug for PkiBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkiBlock").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunBlock {
    pub mtu: u32,
    pub disabled: bool,
    pub tx_queue: u32,
    pub drop_multicast: bool,
    pub drop_local_broadcast: bool,
}

impl Default for TunBlock {
    fn default() -> Self {
        Self {
            mtu: 1300,
            disabled: false,
            tx_queue: 500,
            drop_multicast: false,
            drop_local_broadcast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayBlock {
    pub am_relay: bool,
    pub use_relays: bool,
}

impl Default for RelayBlock {
    fn default() -> Self {
        Self {
            am_relay: false,
            use_relays: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenBlock {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchyBlock {
    pub punch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingBlock {
    pub level: String,
    pub format: String,
}

impl Default for LoggingBlock {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConntrackBlock {
    pub tcp_timeout: String,
    pub udp_timeout: String,
    pub default_timeout: String,
}

impl Default for ConntrackBlock {
    fn default() -> Self {
        Self {
            tcp_timeout: "12m".to_string(),
            udp_timeout: "3m".to_string(),
            default_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallBlock {
    pub inbound: Vec<CompiledRule>,
    pub outbound: Vec<CompiledRule>,
    pub conntrack: ConntrackBlock,
    pub inbound_action: String,
    pub outbound_action: String,
}

impl From<CompiledRules> for FirewallBlock {
    fn from(rules: CompiledRules) -> Self {
        Self {
            inbound: rules.inbound,
            outbound: rules.outbound,
            conntrack: ConntrackBlock::default(),
            inbound_action: "drop".to_string(),
            outbound_action: "drop".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LighthouseHost {
    pub hostname: String,
    pub public_ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LighthouseBlock {
    pub hosts: Vec<LighthouseHost>,
    pub interval: u32,
    pub am_lighthouse: bool,
}

impl ConfigDocument {
    /// Canonical serialized form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// SHA-256 of the canonical form
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_hex(&self.to_bytes()?))
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn check_binding(device: &Device, ca: &CertificateAuthority, cert: &Certificate) -> Result<()> {
    if cert.ca_id != ca.id {
        return Err(Error::validation(format!(
            "Certificate {} was not signed by CA {}",
            cert.id, ca.id
        )));
    }
    if cert.overlay_ip != device.overlay_ip {
        return Err(Error::validation(format!(
            "Certificate {} is bound to {}, device {} has {}",
            cert.id, cert.overlay_ip, device.name, device.overlay_ip
        )));
    }
    if cert.kind != device.kind.certificate_kind() {
        return Err(Error::validation(format!(
            "Certificate {} is a {} certificate, device {} is a {}",
            cert.id,
            cert.kind,
            device.name,
            device.kind_name()
        )));
    }
    Ok(())
}

fn base_document(
    ca: &CertificateAuthority,
    cert: &Certificate,
    rules: CompiledRules,
    listen_port: u16,
    lighthouse: LighthouseBlock,
) -> ConfigDocument {
    ConfigDocument {
        pki: PkiBlock {
            ca: ca.ca_cert.clone(),
            cert: cert.cert.clone(),
            key: cert.key.clone(),
        },
        tun: TunBlock::default(),
        relay: RelayBlock::default(),
        cipher: "aes".to_string(),
        listen: ListenBlock {
            host: "0.0.0.0".to_string(),
            port: listen_port,
        },
        punchy: PunchyBlock { punch: true },
        logging: LoggingBlock::default(),
        firewall: rules.into(),
        lighthouse,
        static_host_map: None,
    }
}

/// Node configuration pointing at every active lighthouse it is given
pub fn assemble_node_config(
    node: &Device,
    ca: &CertificateAuthority,
    cert: &Certificate,
    rules: CompiledRules,
    lighthouses: &[Device],
) -> Result<ConfigDocument> {
    if node.kind.is_lighthouse() {
        return Err(Error::validation(format!("{} is not a node", node.name)));
    }
    check_binding(node, ca, cert)?;

    let mut active: Vec<&Device> = lighthouses
        .iter()
        .filter(|lh| lh.network_id == node.network_id && lh.kind.is_active())
        .collect();
    active.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let hosts = active
        .into_iter()
        .filter_map(|lh| match &lh.kind {
            DeviceKind::Lighthouse { public_ip, port, .. } => Some(LighthouseHost {
                hostname: lh.hostname.clone(),
                public_ip: public_ip.to_string(),
                port: *port,
            }),
            DeviceKind::Node { .. } => None,
        })
        .collect();

    Ok(base_document(
        ca,
        cert,
        rules,
        DEFAULT_LISTEN_PORT,
        LighthouseBlock {
            hosts,
            interval: 60,
            am_lighthouse: false,
        },
    ))
}

/// Lighthouse configuration listening on the lighthouse's own port
pub fn assemble_lighthouse_config(
    lighthouse: &Device,
    ca: &CertificateAuthority,
    cert: &Certificate,
    rules: CompiledRules,
) -> Result<ConfigDocument> {
    let port = match &lighthouse.kind {
        DeviceKind::Lighthouse { port, .. } => *port,
        DeviceKind::Node { .. } => {
            return Err(Error::validation(format!("{} is not a lighthouse", lighthouse.name)));
        }
    };
    check_binding(lighthouse, ca, cert)?;

    Ok(base_document(
        ca,
        cert,
        rules,
        port,
        LighthouseBlock {
            hosts: Vec::new(),
            interval: 60,
            am_lighthouse: true,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::CompiledTarget;
    use chrono::Utc;
    use meshplane_common::CertificateKind;
    use uuid::Uuid;

    fn ca() -> CertificateAuthority {
        let now = Utc::now();
        CertificateAuthority {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            network_id: Uuid::new_v4(),
            ca_cert: "CA-CERT".to_string(),
            ca_key: "CA-KEY".to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::days(365),
            revoked: false,
            revoked_at: None,
        }
    }

    fn device(name: &str, ip: &str, kind: DeviceKind, network_id: Uuid) -> Device {
        let now = Utc::now();
        Device {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            network_id,
            name: name.to_string(),
            hostname: format!("{}.example.com", name),
            overlay_ip: ip.parse().unwrap(),
            certificate_id: None,
            kind,
            config: serde_json::json!({}),
            config_digest: None,
            delivered_digest: None,
            last_check_in: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn cert_for(device: &Device, ca: &CertificateAuthority) -> Certificate {
        let now = Utc::now();
        Certificate {
            id: Uuid::new_v4(),
            ca_id: ca.id,
            kind: device.kind.certificate_kind(),
            cert: format!("CERT-{}", device.name),
            key: format!("KEY-{}", device.name),
            overlay_ip: device.overlay_ip,
            created_at: now,
            expires_at: now + chrono::Duration::days(90),
            revoked: false,
            revoked_at: None,
        }
    }

    fn lighthouse(name: &str, ip: &str, public_ip: &str, active: bool, network_id: Uuid) -> Device {
        device(
            name,
            ip,
            DeviceKind::Lighthouse {
                public_ip: public_ip.parse().unwrap(),
                port: 4242,
                is_active: active,
            },
            network_id,
        )
    }

    fn rules() -> CompiledRules {
        CompiledRules {
            inbound: vec![CompiledRule {
                port: "any".to_string(),
                proto: "icmp".to_string(),
                target: CompiledTarget::Host("any".to_string()),
                local_cidr: None,
                ca_name: None,
                ca_sha: None,
            }],
            outbound: Vec::new(),
        }
    }

    #[test]
    fn test_node_config_shape() {
        let ca = ca();
        let network = Uuid::new_v4();
        let node = device("laptop", "10.0.0.3", DeviceKind::Node { lighthouse_id: None }, network);
        let cert = cert_for(&node, &ca);
        let lighthouses = vec![
            lighthouse("lh-b", "10.0.0.2", "198.51.100.2", true, network),
            lighthouse("lh-a", "10.0.0.1", "198.51.100.1", true, network),
            lighthouse("lh-off", "10.0.0.4", "198.51.100.4", false, network),
        ];

        let doc = assemble_node_config(&node, &ca, &cert, rules(), &lighthouses).unwrap();
        let json = doc.to_value().unwrap();

        assert_eq!(json["pki"]["ca"], "CA-CERT");
        assert_eq!(json["pki"]["key"], "KEY-laptop");
        assert_eq!(json["tun"]["mtu"], 1300);
        assert_eq!(json["relay"]["use_relays"], true);
        assert_eq!(json["cipher"], "aes");
        assert_eq!(json["listen"]["port"], 4242);
        assert_eq!(json["firewall"]["conntrack"]["tcp_timeout"], "12m");
        assert_eq!(json["firewall"]["inbound"][0]["port"], "any");
        assert_eq!(json["lighthouse"]["am_lighthouse"], false);
        assert_eq!(json["lighthouse"]["interval"], 60);
        assert!(json["static_host_map"].is_null());

        let hosts: Vec<&str> = doc.lighthouse.hosts.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["lh-a.example.com", "lh-b.example.com"]);
        assert_eq!(doc.lighthouse.hosts[0].public_ip, "198.51.100.1");
    }

    #[test]
    fn test_top_level_key_order() {
        let ca = ca();
        let node = device(
            "laptop",
            "10.0.0.3",
            DeviceKind::Node { lighthouse_id: None },
            Uuid::new_v4(),
        );
        let cert = cert_for(&node, &ca);
        let doc = assemble_node_config(&node, &ca, &cert, rules(), &[]).unwrap();

        let text = String::from_utf8(doc.to_bytes().unwrap()).unwrap();
        let order = [
            "\"pki\"", "\"tun\"", "\"relay\"", "\"cipher\"", "\"listen\"", "\"punchy\"",
            "\"logging\"", "\"firewall\"", "\"lighthouse\"", "\"static_host_map\"",
        ];
        let positions: Vec<usize> = order.iter().map(|k| text.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_lighthouse_config() {
        let ca = ca();
        let mut lh = lighthouse("lh-a", "10.0.0.1", "198.51.100.1", true, Uuid::new_v4());
        lh.kind = DeviceKind::Lighthouse {
            public_ip: "198.51.100.1".parse().unwrap(),
            port: 4300,
            is_active: true,
        };
        let cert = cert_for(&lh, &ca);

        let doc = assemble_lighthouse_config(&lh, &ca, &cert, CompiledRules::default()).unwrap();
        assert_eq!(doc.listen.port, 4300);
        assert!(doc.lighthouse.am_lighthouse);
        assert!(doc.lighthouse.hosts.is_empty());
    }

    #[test]
    fn test_reassembly_is_byte_identical() {
        let ca = ca();
        let network = Uuid::new_v4();
        let node = device("laptop", "10.0.0.3", DeviceKind::Node { lighthouse_id: None }, network);
        let cert = cert_for(&node, &ca);
        let lighthouses = vec![lighthouse("lh-a", "10.0.0.1", "198.51.100.1", true, network)];

        let first = assemble_node_config(&node, &ca, &cert, rules(), &lighthouses).unwrap();
        let second = assemble_node_config(&node, &ca, &cert, rules(), &lighthouses).unwrap();
        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
        assert_eq!(first.digest().unwrap(), second.digest().unwrap());
    }

    #[test]
    fn test_mismatched_certificate_rejected() {
        let ca = ca();
        let node = device(
            "laptop",
            "10.0.0.3",
            DeviceKind::Node { lighthouse_id: None },
            Uuid::new_v4(),
        );
        let mut cert = cert_for(&node, &ca);
        cert.overlay_ip = "10.0.0.9".parse().unwrap();
        assert!(assemble_node_config(&node, &ca, &cert, rules(), &[]).is_err());

        let mut cert = cert_for(&node, &ca);
        cert.kind = CertificateKind::Lighthouse;
        assert!(assemble_node_config(&node, &ca, &cert, rules(), &[]).is_err());

        let other_ca = self::ca();
        let cert = cert_for(&node, &other_ca);
        assert!(assemble_node_config(&node, &ca, &cert, rules(), &[]).is_err());
    }
}
