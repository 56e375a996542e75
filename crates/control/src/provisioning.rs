//! Provisioning orchestration
//!
//! [`ControlPlane`] ties the store, the allocator, the issuer and the
//! assembler together. Organization creation is all-or-nothing. Device
//! creation happens in two phases: the device row is written first, then
//! [`ControlPlane::provision_credentials`] issues the certificate, builds the
//! configuration and mints the API key. The second phase reports problems as
//! warnings and can be re-run at any time.

use crate::allocator::IpAllocator;
use crate::assembler::{assemble_lighthouse_config, assemble_node_config, ConfigDocument};
use crate::config::{ControlConfig, NetworkDefaults};
use crate::firewall::{compile_device_rules, FirewallRuleInput};
use crate::issuance::CertificateIssuer;
use crate::signer::CertSigner;
use chrono::{DateTime, Utc};
use meshplane_common::{
    mint_api_key, parse_cidr, timestamp_now, ApiKey, ApiKeyOwner, Certificate,
    CertificateAuthority, Database, Device, DeviceKind, Error, FirewallRule, Membership,
    MembershipRole, Network, Organization, Result, SecurityGroup, UserRef, DEFAULT_LISTEN_PORT,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Requests and results
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub network_name: Option<String>,
    #[serde(default)]
    pub network_cidr: Option<String>,
    #[serde(default)]
    pub network_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNetwork {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub network_id: Option<Uuid>,
    #[serde(default)]
    pub overlay_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub lighthouse_id: Option<Uuid>,
    #[serde(default)]
    pub security_group_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLighthouse {
    pub name: String,
    pub hostname: String,
    pub public_ip: IpAddr,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub network_id: Option<Uuid>,
    #[serde(default)]
    pub overlay_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub security_group_ids: Vec<Uuid>,
}

/// A step of credential provisioning that did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProvisioningWarning {
    NoCertificateAuthority,
    SigningFailed(String),
    ConfigFailed(String),
}

impl std::fmt::Display for ProvisioningWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCertificateAuthority => write!(
                f,
                "No certificate authority found for this organization. Certificate and configuration were not generated."
            ),
            Self::SigningFailed(msg) => write!(f, "Certificate signing failed: {}", msg),
            Self::ConfigFailed(msg) => write!(f, "Configuration generation failed: {}", msg),
        }
    }
}

/// Outcome of device creation or credential provisioning
#[derive(Debug, Clone, Serialize)]
pub struct DeviceProvisioning {
    pub device: Device,
    pub certificate: Option<Certificate>,
    /// Plaintext API key, present only when one was minted by this call
    pub api_key: Option<String>,
    pub warnings: Vec<ProvisioningWarning>,
}

impl DeviceProvisioning {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Response to a device poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub has_updates: bool,
    pub config: serde_json::Value,
    pub last_check_in: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub overlay_ip: Ipv4Addr,
    pub is_active: bool,
    pub last_check_in: Option<DateTime<Utc>>,
    pub certificate_expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Admin policy
// ============================================================================

/// Users whose memberships are always created with the admin role
#[derive(Debug, Clone, Default)]
pub struct AdminPolicy {
    admin_emails: HashSet<String>,
}

impl AdminPolicy {
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            admin_emails: emails
                .into_iter()
                .map(|e| e.as_ref().trim().to_lowercase())
                .collect(),
        }
    }

    pub fn role_for(&self, email: &str, requested: MembershipRole) -> MembershipRole {
        if self.admin_emails.contains(&email.trim().to_lowercase()) {
            MembershipRole::Admin
        } else {
            requested
        }
    }
}

/// URL-safe identifier derived from an organization name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn required(value: &str, field: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::validation(format!("{} must not be empty", field)));
    }
    Ok(value.to_string())
}

/// Run `attempt` a second time if the first fails with a retryable error.
/// Each attempt re-reads whatever state it depends on.
fn retry_once<T>(mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    match attempt() {
        Err(e) if e.is_retryable() => {
            warn!("{}; retrying once", e);
            attempt()
        }
        other => other,
    }
}

struct NewDevice {
    name: String,
    hostname: String,
    network_id: Option<Uuid>,
    overlay_ip: Option<Ipv4Addr>,
    kind: DeviceKind,
    security_group_ids: Vec<Uuid>,
}

// ============================================================================
// Control plane
// ============================================================================

pub struct ControlPlane {
    db: Database,
    allocator: IpAllocator,
    issuer: CertificateIssuer,
    policy: AdminPolicy,
    network_defaults: NetworkDefaults,
}

impl ControlPlane {
    pub fn new(db: Database, signer: Arc<dyn CertSigner>, config: &ControlConfig) -> Self {
        Self {
            allocator: IpAllocator::new(db.clone()),
            issuer: CertificateIssuer::new(signer, &config.certificates),
            policy: AdminPolicy::new(&config.policy.admin_emails),
            network_defaults: config.network.clone(),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn organization(&self, id: Uuid) -> Result<Organization> {
        self.db
            .get_organization(id)?
            .ok_or_else(|| Error::not_found("organization", id))
    }

    fn network(&self, id: Uuid) -> Result<Network> {
        self.db.get_network(id)?.ok_or_else(|| Error::not_found("network", id))
    }

    fn device(&self, id: Uuid) -> Result<Device> {
        self.db.get_device(id)?.ok_or_else(|| Error::not_found("device", id))
    }

    fn security_group(&self, id: Uuid) -> Result<SecurityGroup> {
        self.db
            .get_security_group(id)?
            .ok_or_else(|| Error::not_found("security group", id))
    }

    fn usable_ca(&self, organization_id: Uuid) -> Result<Option<CertificateAuthority>> {
        Ok(self
            .db
            .get_certificate_authority(organization_id)?
            .filter(|ca| ca.is_usable(timestamp_now())))
    }

    // ========================================================================
    // Organizations, memberships, networks
    // ========================================================================

    /// Create an organization with its admin membership and primary network
    pub async fn create_organization(
        &self,
        request: NewOrganization,
        user: &UserRef,
    ) -> Result<Organization> {
        let name = required(&request.name, "Organization name")?;
        let slug = slugify(&name);
        if slug.is_empty() {
            return Err(Error::validation(
                "Organization name must contain at least one letter or digit",
            ));
        }

        let defaults = &self.network_defaults;
        let network_name = request
            .network_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(defaults.default_name.as_str())
            .to_string();
        let cidr = parse_cidr(
            request
                .network_cidr
                .as_deref()
                .unwrap_or(defaults.default_cidr.as_str()),
        )?;
        let network_description = request
            .network_description
            .unwrap_or_else(|| defaults.default_description.clone());

        let now = timestamp_now();
        let org = Organization {
            id: Uuid::new_v4(),
            name,
            slug,
            description: request.description,
            created_at: now,
            updated_at: now,
        };
        let membership = Membership {
            id: Uuid::new_v4(),
            organization_id: org.id,
            user_id: user.id,
            user_email: user.email.clone(),
            role: MembershipRole::Admin,
            created_at: now,
        };
        let network = Network {
            id: Uuid::new_v4(),
            organization_id: org.id,
            name: network_name,
            cidr,
            description: network_description,
            is_primary: true,
            created_at: now,
            updated_at: now,
        };

        self.db
            .insert_organization_with_primary_network(&org, &membership, &network)?;
        Ok(org)
    }

    /// Add a user to an organization, subject to the admin policy
    pub fn add_member(
        &self,
        organization_id: Uuid,
        user: &UserRef,
        role: MembershipRole,
    ) -> Result<Membership> {
        self.organization(organization_id)?;
        let role = self.policy.role_for(&user.email, role);
        let membership = Membership {
            id: Uuid::new_v4(),
            organization_id,
            user_id: user.id,
            user_email: user.email.clone(),
            role,
            created_at: timestamp_now(),
        };
        self.db.insert_membership(&membership)?;
        info!("Added {} to organization {} as {}", user.email, organization_id, role);
        Ok(membership)
    }

    /// Create a secondary network
    pub fn create_network(&self, organization_id: Uuid, request: NewNetwork) -> Result<Network> {
        self.organization(organization_id)?;
        let now = timestamp_now();
        let network = Network {
            id: Uuid::new_v4(),
            organization_id,
            name: required(&request.name, "Network name")?,
            cidr: parse_cidr(&request.cidr)?,
            description: request.description,
            is_primary: false,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_network(&network)?;
        Ok(network)
    }

    /// The address the next device in `network_id` would receive
    pub fn next_available_ip(&self, network_id: Uuid) -> Result<Ipv4Addr> {
        let network = self.network(network_id)?;
        self.allocator.allocate(&network)
    }

    // ========================================================================
    // Certificate authority
    // ========================================================================

    /// Generate the organization's CA on its primary network
    pub async fn create_certificate_authority(
        &self,
        organization_id: Uuid,
    ) -> Result<CertificateAuthority> {
        let org = self.organization(organization_id)?;
        if self.db.get_certificate_authority(org.id)?.is_some() {
            return Err(Error::already_exists(
                "certificate authority for organization",
                &org.slug,
            ));
        }
        let network = self
            .db
            .get_primary_network(org.id)?
            .ok_or_else(|| Error::validation("Organization has no primary network"))?;

        let ca = self.issuer.issue_ca(&org, &network).await?;
        self.db.insert_certificate_authority(&ca)?;
        Ok(ca)
    }

    pub fn revoke_certificate_authority(
        &self,
        organization_id: Uuid,
    ) -> Result<CertificateAuthority> {
        let ca = self
            .db
            .get_certificate_authority(organization_id)?
            .ok_or_else(|| {
                Error::not_found("certificate authority for organization", organization_id)
            })?;
        self.db.revoke_certificate_authority(ca.id, timestamp_now())?;
        warn!("Revoked certificate authority of organization {}", organization_id);
        self.db
            .get_certificate_authority(organization_id)?
            .ok_or_else(|| Error::Internal("certificate authority vanished".to_string()))
    }

    // ========================================================================
    // Security groups
    // ========================================================================

    pub fn create_security_group(
        &self,
        organization_id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup> {
        self.organization(organization_id)?;
        let group = SecurityGroup {
            id: Uuid::new_v4(),
            organization_id,
            name: required(name, "Security group name")?,
            description: description.to_string(),
            created_at: timestamp_now(),
        };
        self.db.insert_security_group(&group)?;
        info!("Created security group {}", group.name);
        Ok(group)
    }

    /// Validate and append a rule to a security group
    pub fn add_firewall_rule(
        &self,
        group_id: Uuid,
        input: &FirewallRuleInput,
    ) -> Result<FirewallRule> {
        let group = self.security_group(group_id)?;
        let validated = input.validate()?;

        for referenced in validated.target.referenced_groups() {
            let found = self.db.get_security_group(referenced)?;
            if found.map(|g| g.organization_id) != Some(group.organization_id) {
                return Err(Error::validation(format!(
                    "Security group {} does not exist in this organization",
                    referenced
                )));
            }
        }

        let rule = FirewallRule {
            id: Uuid::new_v4(),
            security_group_id: group.id,
            direction: validated.direction,
            protocol: validated.protocol,
            port: validated.port,
            target: validated.target,
            local_cidr: validated.local_cidr,
            ca_name: validated.ca_name,
            ca_sha: validated.ca_sha,
            created_at: timestamp_now(),
        };
        self.db.insert_firewall_rule(&rule)?;
        Ok(rule)
    }

    /// Put a device into a security group and rebuild its configuration
    pub fn attach_security_group(&self, device_id: Uuid, group_id: Uuid) -> Result<Device> {
        let device = self.device(device_id)?;
        let group = self.security_group(group_id)?;
        if group.organization_id != device.organization_id {
            return Err(Error::validation(
                "Security group belongs to a different organization",
            ));
        }
        self.db.attach_security_group(device.id, group.id)?;
        self.refresh_if_provisioned(&device)?;
        self.device(device_id)
    }

    pub fn detach_security_group(&self, device_id: Uuid, group_id: Uuid) -> Result<Device> {
        let device = self.device(device_id)?;
        if !self.db.detach_security_group(device.id, group_id)? {
            return Err(Error::not_found("security group membership", group_id));
        }
        self.refresh_if_provisioned(&device)?;
        self.device(device_id)
    }

    fn refresh_if_provisioned(&self, device: &Device) -> Result<()> {
        if device.certificate_id.is_some() {
            match self.regenerate_config(device.id) {
                Ok(_) => {}
                Err(Error::Validation(msg)) => {
                    debug!("Skipping config refresh for {}: {}", device.name, msg)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Create a node and provision its credentials
    pub async fn create_node(
        &self,
        organization_id: Uuid,
        request: NewNode,
    ) -> Result<DeviceProvisioning> {
        self.create_device(
            organization_id,
            NewDevice {
                name: request.name,
                hostname: request.hostname,
                network_id: request.network_id,
                overlay_ip: request.overlay_ip,
                kind: DeviceKind::Node {
                    lighthouse_id: request.lighthouse_id,
                },
                security_group_ids: request.security_group_ids,
            },
        )
        .await
    }

    /// Create a lighthouse and provision its credentials
    pub async fn create_lighthouse(
        &self,
        organization_id: Uuid,
        request: NewLighthouse,
    ) -> Result<DeviceProvisioning> {
        let port = request.port.unwrap_or(DEFAULT_LISTEN_PORT);
        if port == 0 {
            return Err(Error::validation("Port must be between 1 and 65535"));
        }

        self.create_device(
            organization_id,
            NewDevice {
                name: request.name,
                hostname: request.hostname,
                network_id: request.network_id,
                overlay_ip: request.overlay_ip,
                kind: DeviceKind::Lighthouse {
                    public_ip: request.public_ip,
                    port,
                    is_active: request.is_active.unwrap_or(true),
                },
                security_group_ids: request.security_group_ids,
            },
        )
        .await
    }

    async fn create_device(
        &self,
        organization_id: Uuid,
        request: NewDevice,
    ) -> Result<DeviceProvisioning> {
        self.organization(organization_id)?;
        let name = required(&request.name, "Name")?;
        let hostname = required(&request.hostname, "Hostname")?;

        let network = match request.network_id {
            Some(id) => {
                let network = self.network(id)?;
                if network.organization_id != organization_id {
                    return Err(Error::validation("Network does not belong to this organization"));
                }
                network
            }
            None => self
                .db
                .get_primary_network(organization_id)?
                .ok_or_else(|| Error::validation("Organization has no primary network"))?,
        };

        if let DeviceKind::Node {
            lighthouse_id: Some(lighthouse_id),
        } = request.kind
        {
            let lighthouse = self.device(lighthouse_id)?;
            if !lighthouse.kind.is_lighthouse() || lighthouse.organization_id != organization_id {
                return Err(Error::validation(format!(
                    "{} is not a lighthouse of this organization",
                    lighthouse_id
                )));
            }
            if lighthouse.network_id != network.id {
                return Err(Error::validation(format!(
                    "Lighthouse {} is not in network {}",
                    lighthouse.name, network.name
                )));
            }
        }

        for group_id in &request.security_group_ids {
            if self.security_group(*group_id)?.organization_id != organization_id {
                return Err(Error::validation(format!(
                    "Security group {} does not belong to this organization",
                    group_id
                )));
            }
        }

        let now = timestamp_now();
        let mut device = Device {
            id: Uuid::new_v4(),
            organization_id,
            network_id: network.id,
            name,
            hostname,
            overlay_ip: Ipv4Addr::UNSPECIFIED,
            certificate_id: None,
            kind: request.kind,
            config: serde_json::json!({}),
            config_digest: None,
            delivered_digest: None,
            last_check_in: None,
            created_at: now,
            updated_at: now,
        };

        {
            let _guard = self.allocator.lock_network(network.id).await;
            retry_once(|| {
                device.overlay_ip = match request.overlay_ip {
                    Some(ip) => {
                        if !self.allocator.is_available(&network, ip)? {
                            return Err(Error::validation(format!(
                                "IP address {} is not available in network {} ({})",
                                ip, network.name, network.cidr
                            )));
                        }
                        ip
                    }
                    None => self.allocator.allocate(&network)?,
                };
                self.db.insert_device(&device, &request.security_group_ids)
            })?;
        }

        self.provision_credentials(device.id).await
    }

    /// Issue the certificate, build the config and mint the API key for a
    /// device. Steps already done are skipped, so this is safe to repeat.
    pub async fn provision_credentials(&self, device_id: Uuid) -> Result<DeviceProvisioning> {
        let device = self.device(device_id)?;
        let mut warnings = Vec::new();

        let ca = match self.usable_ca(device.organization_id)? {
            Some(ca) => ca,
            None => {
                warn!(
                    "No usable certificate authority for {} {}; skipping credentials",
                    device.kind_name(),
                    device.name
                );
                warnings.push(ProvisioningWarning::NoCertificateAuthority);
                return Ok(DeviceProvisioning {
                    device,
                    certificate: None,
                    api_key: None,
                    warnings,
                });
            }
        };

        let certificate = match self.current_certificate(&device, &ca)? {
            Some(cert) => cert,
            None => match self.issue_certificate(&device, &ca).await {
                Ok(cert) => cert,
                Err(e) => {
                    warn!("Device {} kept without certificate: {}", device.name, e);
                    warnings.push(ProvisioningWarning::SigningFailed(e.to_string()));
                    return Ok(DeviceProvisioning {
                        device,
                        certificate: None,
                        api_key: None,
                        warnings,
                    });
                }
            },
        };

        let device = self.device(device_id)?;
        if let Err(e) = self.write_config(&device, &ca, &certificate) {
            warn!("Config generation failed for {}: {}", device.name, e);
            warnings.push(ProvisioningWarning::ConfigFailed(e.to_string()));
        }

        if device.kind.is_lighthouse() {
            if let Err(e) = self.regenerate_network_configs(device.network_id) {
                warnings.push(ProvisioningWarning::ConfigFailed(e.to_string()));
            }
        }

        let api_key = self.ensure_api_key(&device)?;

        Ok(DeviceProvisioning {
            device: self.device(device_id)?,
            certificate: Some(certificate),
            api_key,
            warnings,
        })
    }

    /// The device's certificate if it can still be used with `ca`
    fn current_certificate(
        &self,
        device: &Device,
        ca: &CertificateAuthority,
    ) -> Result<Option<Certificate>> {
        let Some(id) = device.certificate_id else {
            return Ok(None);
        };
        let now = timestamp_now();
        Ok(self.db.get_certificate(id)?.filter(|cert| {
            cert.ca_id == ca.id
                && !cert.revoked
                && cert.expires_at > now
                && cert.overlay_ip == device.overlay_ip
        }))
    }

    async fn issue_certificate(
        &self,
        device: &Device,
        ca: &CertificateAuthority,
    ) -> Result<Certificate> {
        let network = self.network(device.network_id)?;
        let groups: Vec<String> = self
            .db
            .device_security_groups(device.id)?
            .into_iter()
            .map(|g| g.name)
            .collect();

        let cert = self
            .issuer
            .issue_device_cert(device, &network, &groups, ca)
            .await?;
        self.db.insert_device_certificate(device.id, &cert)?;
        info!(
            "Issued {} certificate for {} at {}",
            cert.kind, device.name, device.overlay_ip
        );
        Ok(cert)
    }

    fn ensure_api_key(&self, device: &Device) -> Result<Option<String>> {
        if let Some(existing) = self.db.active_api_key_for_device(device.id)? {
            if !existing.is_expired(timestamp_now()) {
                return Ok(None);
            }
            self.db.deactivate_api_key(existing.id)?;
        }

        let minted = mint_api_key();
        let key = ApiKey {
            id: Uuid::new_v4(),
            name: format!("{} API Key", device.name),
            key_hash: minted.hash,
            owner: ApiKeyOwner::for_device(device),
            is_active: true,
            expires_at: None,
            last_used: None,
            created_at: timestamp_now(),
        };
        self.db.insert_api_key(&key)?;
        info!("Minted API key for {} {}", device.kind_name(), device.name);
        Ok(Some(minted.plaintext))
    }

    fn build_config(
        &self,
        device: &Device,
        ca: &CertificateAuthority,
        cert: &Certificate,
    ) -> Result<ConfigDocument> {
        let rules = compile_device_rules(&self.db, device)?;
        match device.kind {
            DeviceKind::Node { .. } => {
                let lighthouses = self.db.active_lighthouses(device.network_id)?;
                assemble_node_config(device, ca, cert, rules, &lighthouses)
            }
            DeviceKind::Lighthouse { .. } => assemble_lighthouse_config(device, ca, cert, rules),
        }
    }

    fn write_config(
        &self,
        device: &Device,
        ca: &CertificateAuthority,
        cert: &Certificate,
    ) -> Result<ConfigDocument> {
        let document = self.build_config(device, ca, cert)?;
        let digest = document.digest()?;
        if device.config_digest.as_deref() != Some(digest.as_str()) {
            self.db
                .update_device_config(device.id, &document.to_value()?, &digest)?;
            debug!("Stored config {} for {}", &digest[..12], device.name);
        }
        Ok(document)
    }

    /// Rebuild a provisioned device's configuration from current state
    pub fn regenerate_config(&self, device_id: Uuid) -> Result<ConfigDocument> {
        let device = self.device(device_id)?;
        let ca = self
            .usable_ca(device.organization_id)?
            .ok_or_else(|| {
                Error::validation("No usable certificate authority for this organization")
            })?;
        let cert = self
            .current_certificate(&device, &ca)?
            .ok_or_else(|| {
                Error::validation(format!("Device {} has no valid certificate", device.name))
            })?;
        self.write_config(&device, &ca, &cert)
    }

    /// Rebuild every provisioned device of a network; returns how many were rebuilt
    pub fn regenerate_network_configs(&self, network_id: Uuid) -> Result<usize> {
        let network = self.network(network_id)?;
        let Some(ca) = self.usable_ca(network.organization_id)? else {
            return Ok(0);
        };

        let mut rebuilt = 0;
        for device in self.db.list_network_devices(network.id)? {
            if let Some(cert) = self.current_certificate(&device, &ca)? {
                self.write_config(&device, &ca, &cert)?;
                rebuilt += 1;
            }
        }
        debug!("Regenerated {} configs in network {}", rebuilt, network.name);
        Ok(rebuilt)
    }

    pub fn revoke_certificate(&self, device_id: Uuid) -> Result<Certificate> {
        let device = self.device(device_id)?;
        let id = device
            .certificate_id
            .ok_or_else(|| Error::not_found("certificate for device", device_id))?;
        self.db.revoke_certificate(id, timestamp_now())?;
        warn!("Revoked certificate {} of {}", id, device.name);
        self.db
            .get_certificate(id)?
            .ok_or_else(|| Error::not_found("certificate", id))
    }

    pub fn revoke_api_key(&self, key_id: Uuid) -> Result<()> {
        let key = self
            .db
            .get_api_key(key_id)?
            .ok_or_else(|| Error::not_found("API key", key_id))?;
        self.db.deactivate_api_key(key.id)?;
        info!("Revoked API key {}", key_id);
        Ok(())
    }

    // ========================================================================
    // Device-facing operations
    // ========================================================================

    /// Resolve a presented API key to its device
    pub fn authenticate(&self, presented: &str) -> Result<(ApiKey, Device)> {
        let hash = meshplane_common::hash_api_key(presented);
        let key = self
            .db
            .get_api_key_by_hash(&hash)?
            .ok_or_else(|| Error::AuthenticationFailed("Invalid API key".to_string()))?;

        if !key.is_active {
            return Err(Error::AuthenticationFailed("API key is inactive".to_string()));
        }
        let now = timestamp_now();
        if key.is_expired(now) {
            self.db.deactivate_api_key(key.id)?;
            warn!("Deactivated expired API key {}", key.id);
            return Err(Error::AuthenticationFailed("API key has expired".to_string()));
        }

        self.db.touch_api_key(key.id, now)?;
        let device = self
            .db
            .get_device(key.owner.device_id())?
            .ok_or_else(|| Error::AuthenticationFailed("API key has no device".to_string()))?;
        Ok((key, device))
    }

    /// Device poll: hand out the current config and whether it changed
    pub fn check_in(&self, presented: &str) -> Result<CheckInResponse> {
        let (_, device) = self.authenticate(presented)?;
        let has_updates =
            device.config_digest.is_some() && device.config_digest != device.delivered_digest;

        let now = timestamp_now();
        self.db
            .record_check_in(device.id, now, device.config_digest.as_deref())?;
        debug!("{} checked in (updates: {})", device.name, has_updates);

        Ok(CheckInResponse {
            has_updates,
            config: device.config,
            last_check_in: now,
        })
    }

    pub fn device_status(&self, presented: &str) -> Result<DeviceStatus> {
        let (_, device) = self.authenticate(presented)?;
        let certificate_expires_at = match device.certificate_id {
            Some(id) => self.db.get_certificate(id)?.map(|c| c.expires_at),
            None => None,
        };
        Ok(DeviceStatus {
            id: device.id,
            name: device.name,
            hostname: device.hostname,
            overlay_ip: device.overlay_ip,
            is_active: device.kind.is_active(),
            last_check_in: device.last_check_in,
            certificate_expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Acme Corp"), "acme-corp");
        assert_eq!(slugify("  Hello,  World!! "), "hello-world");
        assert_eq!(slugify("R&D 2024"), "r-d-2024");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn test_admin_policy() {
        let policy = AdminPolicy::new(["Ops@Example.com"]);
        assert_eq!(
            policy.role_for("ops@example.com", MembershipRole::Viewer),
            MembershipRole::Admin
        );
        assert_eq!(
            policy.role_for("dev@example.com", MembershipRole::Operator),
            MembershipRole::Operator
        );
    }

    #[test]
    fn test_retry_once_recovers_from_one_conflict() {
        let mut attempts = 0;
        let result = retry_once(|| {
            attempts += 1;
            if attempts == 1 {
                Err(Error::Conflict("10.0.0.1 taken".to_string()))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_retry_once_surfaces_second_conflict() {
        let mut attempts = 0;
        let result: Result<()> = retry_once(|| {
            attempts += 1;
            Err(Error::Conflict(format!("attempt {}", attempts)))
        });
        assert!(matches!(result, Err(Error::Conflict(ref msg)) if msg == "attempt 2"));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_retry_once_ignores_other_errors() {
        let mut attempts = 0;
        let result: Result<()> = retry_once(|| {
            attempts += 1;
            Err(Error::validation("bad"))
        });
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_warning_serialization() {
        let json =
            serde_json::to_value(ProvisioningWarning::SigningFailed("boom".to_string())).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "signing_failed", "detail": "boom" }));

        let json = serde_json::to_value(ProvisioningWarning::NoCertificateAuthority).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "no_certificate_authority" }));
    }
}
