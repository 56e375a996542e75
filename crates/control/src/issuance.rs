//! Certificate issuance
//!
//! Builds signing requests for organizations and devices and turns the
//! signer's output into certificate records. Records are returned, not
//! stored; the caller persists them once it holds the device row.

use crate::config::{CertificateConfig, MAX_VALIDITY_DAYS};
use crate::signer::{CertSigner, KeyMaterial, SigningRequest};
use chrono::Duration;
use ipnetwork::Ipv4Network;
use meshplane_common::{
    timestamp_now, Certificate, CertificateAuthority, Device, Error, Network, Organization,
    Result,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Group every lighthouse certificate carries
pub const LIGHTHOUSE_GROUP: &str = "lighthouse";

/// Group used when a node belongs to no security group
pub const DEFAULT_GROUP: &str = "default";

/// Certificate groups for a device given its security group names
pub fn certificate_groups(device: &Device, security_groups: &[String]) -> Vec<String> {
    let mut groups = security_groups.to_vec();
    if device.kind.is_lighthouse() {
        groups.push(LIGHTHOUSE_GROUP.to_string());
    } else if groups.is_empty() {
        groups.push(DEFAULT_GROUP.to_string());
    }
    groups
}

/// Device address carrying the network's prefix length, e.g. `10.0.0.3/24`
pub fn address_with_mask(device: &Device, network: &Network) -> Result<Ipv4Network> {
    Ipv4Network::new(device.overlay_ip, network.cidr.prefix())
        .map_err(|e| {
            Error::validation(format!("Invalid device address {}: {}", device.overlay_ip, e))
        })
}

pub struct CertificateIssuer {
    signer: Arc<dyn CertSigner>,
    node_validity: Duration,
    ca_validity: Duration,
}

impl CertificateIssuer {
    pub fn new(signer: Arc<dyn CertSigner>, config: &CertificateConfig) -> Self {
        Self {
            signer,
            node_validity: Duration::days(config.node_validity_days.clamp(1, MAX_VALIDITY_DAYS)),
            ca_validity: Duration::days(config.ca_validity_days.clamp(1, MAX_VALIDITY_DAYS)),
        }
    }

    /// Generate the organization's CA, bound to its primary network
    pub async fn issue_ca(
        &self,
        org: &Organization,
        network: &Network,
    ) -> Result<CertificateAuthority> {
        if network.organization_id != org.id || !network.is_primary {
            return Err(Error::validation(
                "Certificate authority must be bound to the organization's primary network",
            ));
        }

        let material = self
            .signer
            .create_ca(&org.name, self.ca_validity)
            .await
            .map_err(|e| {
                error!("CA generation failed for {}: {}", org.slug, e);
                e
            })?;

        let now = timestamp_now();
        info!("Issued CA for organization {}", org.slug);
        Ok(CertificateAuthority {
            id: Uuid::new_v4(),
            organization_id: org.id,
            network_id: network.id,
            ca_cert: material.cert,
            ca_key: material.key,
            created_at: now,
            expires_at: now + self.ca_validity,
            revoked: false,
            revoked_at: None,
        })
    }

    /// Sign a certificate for a node or lighthouse
    pub async fn issue_device_cert(
        &self,
        device: &Device,
        network: &Network,
        security_groups: &[String],
        ca: &CertificateAuthority,
    ) -> Result<Certificate> {
        let request = SigningRequest {
            name: device.name.clone(),
            ip: address_with_mask(device, network)?,
            groups: certificate_groups(device, security_groups),
            validity: self.node_validity,
        };
        let ca_material = KeyMaterial {
            cert: ca.ca_cert.clone(),
            key: ca.ca_key.clone(),
        };

        let signed = self.signer.sign(&request, &ca_material).await.map_err(|e| {
            error!("Signing failed for {} {}: {}", device.kind_name(), device.name, e);
            e
        })?;

        let now = timestamp_now();
        Ok(Certificate {
            id: Uuid::new_v4(),
            ca_id: ca.id,
            kind: device.kind.certificate_kind(),
            cert: signed.cert,
            key: signed.key,
            overlay_ip: device.overlay_ip,
            created_at: now,
            expires_at: now + self.node_validity,
            revoked: false,
            revoked_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::StubSigner;
    use async_trait::async_trait;
    use meshplane_common::{parse_cidr, CertificateKind, DeviceKind};
    use parking_lot::Mutex;

    /// Records the last request it saw
    #[derive(Default)]
    struct RecordingSigner {
        last: Mutex<Option<SigningRequest>>,
    }

    #[async_trait]
    impl CertSigner for RecordingSigner {
        async fn create_ca(&self, name: &str, validity: Duration) -> Result<KeyMaterial> {
            StubSigner.create_ca(name, validity).await
        }

        async fn sign(&self, request: &SigningRequest, ca: &KeyMaterial) -> Result<KeyMaterial> {
            *self.last.lock() = Some(request.clone());
            StubSigner.sign(request, ca).await
        }
    }

    fn fixtures() -> (Organization, Network) {
        let now = timestamp_now();
        let org = Organization {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            slug: "acme".to_string(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        };
        let network = Network {
            id: Uuid::new_v4(),
            organization_id: org.id,
            name: "Primary Network".to_string(),
            cidr: parse_cidr("10.0.0.0/24").unwrap(),
            description: String::new(),
            is_primary: true,
            created_at: now,
            updated_at: now,
        };
        (org, network)
    }

    fn device(network: &Network, kind: DeviceKind) -> Device {
        let now = timestamp_now();
        Device {
            id: Uuid::new_v4(),
            organization_id: network.organization_id,
            network_id: network.id,
            name: "edge-1".to_string(),
            hostname: "edge-1.example.com".to_string(),
            overlay_ip: "10.0.0.3".parse().unwrap(),
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

    #[test]
    fn test_certificate_groups() {
        let (_, network) = fixtures();
        let node = device(&network, DeviceKind::Node { lighthouse_id: None });
        assert_eq!(certificate_groups(&node, &[]), vec!["default"]);
        assert_eq!(
            certificate_groups(&node, &["web".to_string()]),
            vec!["web"]
        );

        let lighthouse = device(
            &network,
            DeviceKind::Lighthouse {
                public_ip: "203.0.113.1".parse().unwrap(),
                port: 4242,
                is_active: true,
            },
        );
        assert_eq!(certificate_groups(&lighthouse, &[]), vec!["lighthouse"]);
        assert_eq!(
            certificate_groups(&lighthouse, &["ops".to_string()]),
            vec!["ops", "lighthouse"]
        );
    }

    #[tokio::test]
    async fn test_issue_ca_requires_primary_network() {
        let (org, mut network) = fixtures();
        let issuer = CertificateIssuer::new(Arc::new(StubSigner), &CertificateConfig::default());

        let ca = issuer.issue_ca(&org, &network).await.unwrap();
        assert_eq!(ca.network_id, network.id);
        assert_eq!((ca.expires_at - ca.created_at).num_days(), 365);

        network.is_primary = false;
        assert!(issuer.issue_ca(&org, &network).await.is_err());
    }

    #[tokio::test]
    async fn test_issue_device_cert_request() {
        let (org, network) = fixtures();
        let signer = Arc::new(RecordingSigner::default());
        let issuer = CertificateIssuer::new(signer.clone(), &CertificateConfig::default());
        let ca = issuer.issue_ca(&org, &network).await.unwrap();

        let node = device(&network, DeviceKind::Node { lighthouse_id: None });
        let cert = issuer
            .issue_device_cert(&node, &network, &["web".to_string()], &ca)
            .await
            .unwrap();

        assert_eq!(cert.kind, CertificateKind::Node);
        assert_eq!(cert.ca_id, ca.id);
        assert_eq!(cert.overlay_ip, node.overlay_ip);
        assert_eq!((cert.expires_at - cert.created_at).num_days(), 90);

        let request = signer.last.lock().clone().unwrap();
        assert_eq!(request.ip.to_string(), "10.0.0.3/24");
        assert_eq!(request.groups, vec!["web"]);
        assert_eq!(request.name, "edge-1");
    }
}
