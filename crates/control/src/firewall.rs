//! Firewall rule validation and compilation
//!
//! Rules arrive as [`FirewallRuleInput`], the loose shape accepted from
//! operators, and are narrowed to a [`RuleTarget`] before they are stored.
//! Compilation flattens a device's security groups into the inbound and
//! outbound lists carried by its configuration document.

use ipnetwork::Ipv4Network;
use meshplane_common::{
    parse_cidr, Database, Device, Direction, Error, FirewallRule, PortSpec, Protocol, Result,
    RuleTarget, SecurityGroup,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Port value emitted for rules that carry no port
pub const ANY_PORT: &str = "any";

/// Untrusted firewall rule definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRuleInput {
    pub direction: Direction,
    pub protocol: Protocol,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub group: Option<Uuid>,
    #[serde(default)]
    pub groups: Option<Vec<Uuid>>,
    #[serde(default)]
    pub local_cidr: Option<String>,
    #[serde(default)]
    pub ca_name: Option<String>,
    #[serde(default)]
    pub ca_sha: Option<String>,
}

/// A rule definition that passed validation, not yet bound to a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRule {
    pub direction: Direction,
    pub protocol: Protocol,
    pub port: Option<PortSpec>,
    pub target: RuleTarget,
    pub local_cidr: Option<Ipv4Network>,
    pub ca_name: Option<String>,
    pub ca_sha: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl FirewallRuleInput {
    /// Convenience constructor for a rule without a target yet
    pub fn new(direction: Direction, protocol: Protocol) -> Self {
        Self {
            direction,
            protocol,
            port: None,
            host: None,
            cidr: None,
            group: None,
            groups: None,
            local_cidr: None,
            ca_name: None,
            ca_sha: None,
        }
    }

    pub fn port(mut self, port: &str) -> Self {
        self.port = Some(port.to_string());
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn cidr(mut self, cidr: &str) -> Self {
        self.cidr = Some(cidr.to_string());
        self
    }

    pub fn group(mut self, group: Uuid) -> Self {
        self.group = Some(group);
        self
    }

    pub fn groups(mut self, groups: Vec<Uuid>) -> Self {
        self.groups = Some(groups);
        self
    }

    /// Check target exclusivity, port/protocol agreement and address syntax
    pub fn validate(&self) -> Result<ValidatedRule> {
        let host = non_empty(&self.host);
        let cidr = non_empty(&self.cidr);
        let groups = self.groups.as_ref().filter(|g| !g.is_empty());

        let targets = [
            host.is_some(),
            cidr.is_some(),
            self.group.is_some(),
            groups.is_some(),
        ];
        if targets.iter().filter(|set| **set).count() != 1 {
            return Err(Error::validation(
                "Exactly one of host, cidr, group, or groups must be specified",
            ));
        }

        let target = if let Some(host) = host {
            RuleTarget::Host(host.to_string())
        } else if let Some(cidr) = cidr {
            RuleTarget::Cidr(parse_cidr(cidr)?)
        } else if let Some(group) = self.group {
            RuleTarget::Group(group)
        } else {
            let mut ordered: Vec<Uuid> = Vec::new();
            for id in groups.into_iter().flatten() {
                if !ordered.contains(id) {
                    ordered.push(*id);
                }
            }
            RuleTarget::Groups(ordered)
        };

        let port = match (self.protocol, non_empty(&self.port)) {
            (Protocol::Icmp, None) => None,
            (Protocol::Icmp, Some(_)) => {
                return Err(Error::validation("Port must not be specified for ICMP rules"));
            }
            (protocol, None) => {
                return Err(Error::validation(format!(
                    "Port is required for {} rules",
                    protocol
                )));
            }
            (_, Some(port)) => Some(port.parse::<PortSpec>()?),
        };

        let local_cidr = non_empty(&self.local_cidr).map(parse_cidr).transpose()?;

        Ok(ValidatedRule {
            direction: self.direction,
            protocol: self.protocol,
            port,
            target,
            local_cidr,
            ca_name: non_empty(&self.ca_name).map(str::to_string),
            ca_sha: non_empty(&self.ca_sha).map(str::to_string),
        })
    }
}

/// Resolved rule target as it appears in a configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompiledTarget {
    Host(String),
    Cidr(String),
    Group(String),
    Groups(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub port: String,
    pub proto: String,
    #[serde(flatten)]
    pub target: CompiledTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_sha: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRules {
    pub inbound: Vec<CompiledRule>,
    pub outbound: Vec<CompiledRule>,
}

/// A security group and its rules in insertion order
#[derive(Debug, Clone)]
pub struct GroupRules {
    pub group: SecurityGroup,
    pub rules: Vec<FirewallRule>,
}

/// Flatten group rules into direction-sorted lists.
///
/// `group_names` resolves referenced groups; it must only contain groups of
/// the device's organization.
pub fn compile(
    groups: &[GroupRules],
    group_names: &HashMap<Uuid, String>,
) -> Result<CompiledRules> {
    let mut ordered: Vec<&GroupRules> = groups.iter().collect();
    ordered.sort_by(|a, b| {
        a.group
            .name
            .cmp(&b.group.name)
            .then_with(|| a.group.id.cmp(&b.group.id))
    });

    let mut compiled = CompiledRules::default();
    for entry in ordered {
        for rule in &entry.rules {
            let rendered = compile_rule(rule, group_names)?;
            match rule.direction {
                Direction::Inbound => compiled.inbound.push(rendered),
                Direction::Outbound => compiled.outbound.push(rendered),
            }
        }
    }
    Ok(compiled)
}

fn compile_rule(rule: &FirewallRule, group_names: &HashMap<Uuid, String>) -> Result<CompiledRule> {
    let port = match (rule.protocol, rule.port) {
        (Protocol::Icmp, None) => ANY_PORT.to_string(),
        (Protocol::Icmp, Some(_)) => {
            return Err(Error::validation(format!(
                "Firewall rule {} is ICMP but carries a port",
                rule.id
            )));
        }
        (_, Some(port)) => port.to_string(),
        (protocol, None) => {
            return Err(Error::validation(format!(
                "Firewall rule {} is {} but has no port",
                rule.id, protocol
            )));
        }
    };

    let resolve = |id: &Uuid| {
        group_names.get(id).cloned().ok_or_else(|| {
            Error::validation(format!(
                "Firewall rule {} references unknown security group {}",
                rule.id, id
            ))
        })
    };

    let target = match &rule.target {
        RuleTarget::Host(host) => CompiledTarget::Host(host.clone()),
        RuleTarget::Cidr(cidr) => CompiledTarget::Cidr(cidr.to_string()),
        RuleTarget::Group(id) => CompiledTarget::Group(resolve(id)?),
        RuleTarget::Groups(ids) => {
            CompiledTarget::Groups(ids.iter().map(resolve).collect::<Result<Vec<_>>>()?)
        }
    };

    Ok(CompiledRule {
        port,
        proto: rule.protocol.to_string(),
        target,
        local_cidr: rule.local_cidr.map(|c| c.to_string()),
        ca_name: rule.ca_name.clone(),
        ca_sha: rule.ca_sha.clone(),
    })
}

/// Load a device's security groups and compile their rules
pub fn compile_device_rules(db: &Database, device: &Device) -> Result<CompiledRules> {
    let memberships = db.device_security_groups(device.id)?;
    let group_names: HashMap<Uuid, String> = db
        .list_security_groups(device.organization_id)?
        .into_iter()
        .map(|g| (g.id, g.name))
        .collect();

    let mut groups = Vec::with_capacity(memberships.len());
    for group in memberships {
        let rules = db.list_firewall_rules(group.id)?;
        groups.push(GroupRules { group, rules });
    }

    let compiled = compile(&groups, &group_names)?;
    debug!(
        "Compiled {} inbound / {} outbound rules for {}",
        compiled.inbound.len(),
        compiled.outbound.len(),
        device.name
    );
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn group(name: &str) -> SecurityGroup {
        SecurityGroup {
            id: Uuid::new_v4(),
            organization_id: Uuid::nil(),
            name: name.to_string(),
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn rule(group: &SecurityGroup, input: FirewallRuleInput) -> FirewallRule {
        let v = input.validate().unwrap();
        FirewallRule {
            id: Uuid::new_v4(),
            security_group_id: group.id,
            direction: v.direction,
            protocol: v.protocol,
            port: v.port,
            target: v.target,
            local_cidr: v.local_cidr,
            ca_name: v.ca_name,
            ca_sha: v.ca_sha,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_icmp_rejects_port() {
        let err = FirewallRuleInput::new(Direction::Inbound, Protocol::Icmp)
            .port("80")
            .host("any")
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let ok = FirewallRuleInput::new(Direction::Inbound, Protocol::Icmp)
            .host("any")
            .validate()
            .unwrap();
        assert_eq!(ok.port, None);
    }

    #[test]
    fn test_tcp_requires_port() {
        assert!(FirewallRuleInput::new(Direction::Inbound, Protocol::Tcp)
            .host("any")
            .validate()
            .is_err());

        let ok = FirewallRuleInput::new(Direction::Inbound, Protocol::Tcp)
            .port("1-65535")
            .host("any")
            .validate()
            .unwrap();
        assert_eq!(ok.port, Some(PortSpec::Range { start: 1, end: 65535 }));
    }

    #[test]
    fn test_exactly_one_target() {
        let none = FirewallRuleInput::new(Direction::Outbound, Protocol::Any).port("443");
        assert!(none.validate().is_err());

        let two = none.clone().host("any").cidr("10.0.0.0/8");
        assert!(two.validate().is_err());

        let empty_host = none.clone().host("  ");
        assert!(empty_host.validate().is_err());

        let empty_groups = none.clone().groups(vec![]);
        assert!(empty_groups.validate().is_err());

        let cidr = none.cidr("10.0.0.0/8").validate().unwrap();
        assert!(matches!(cidr.target, RuleTarget::Cidr(_)));
    }

    #[test]
    fn test_bad_addresses_rejected() {
        let base = FirewallRuleInput::new(Direction::Inbound, Protocol::Udp).port("53");
        assert!(base.clone().cidr("10.0.0.0/33").validate().is_err());
        assert!(base.clone().cidr("fd00::/8").validate().is_err());

        let mut with_local = base.host("any");
        with_local.local_cidr = Some("not-a-cidr".to_string());
        assert!(with_local.validate().is_err());
    }

    #[test]
    fn test_groups_deduplicated_in_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let v = FirewallRuleInput::new(Direction::Inbound, Protocol::Tcp)
            .port("22")
            .groups(vec![b, a, b])
            .validate()
            .unwrap();
        assert_eq!(v.target, RuleTarget::Groups(vec![b, a]));
    }

    #[test]
    fn test_compile_orders_and_routes() {
        let web = group("web");
        let admin = group("admin");
        let db_group = group("db");

        let names: HashMap<Uuid, String> = [&web, &admin, &db_group]
            .iter()
            .map(|g| (g.id, g.name.clone()))
            .collect();

        let web_rules = GroupRules {
            group: web.clone(),
            rules: vec![
                rule(
                    &web,
                    FirewallRuleInput::new(Direction::Inbound, Protocol::Tcp)
                        .port("443")
                        .host("any"),
                ),
                rule(
                    &web,
                    FirewallRuleInput::new(Direction::Outbound, Protocol::Tcp)
                        .port("5432")
                        .group(db_group.id),
                ),
            ],
        };
        let admin_rules = GroupRules {
            group: admin.clone(),
            rules: vec![
                rule(
                    &admin,
                    FirewallRuleInput::new(Direction::Inbound, Protocol::Icmp).cidr("10.0.0.0/8"),
                ),
                rule(
                    &admin,
                    FirewallRuleInput::new(Direction::Inbound, Protocol::Tcp)
                        .port("22")
                        .groups(vec![web.id, db_group.id]),
                ),
            ],
        };

        let compiled = compile(&[web_rules, admin_rules], &names).unwrap();

        // admin sorts before web
        assert_eq!(compiled.inbound.len(), 3);
        assert_eq!(compiled.inbound[0].proto, "icmp");
        assert_eq!(compiled.inbound[0].port, ANY_PORT);
        assert_eq!(compiled.inbound[0].target, CompiledTarget::Cidr("10.0.0.0/8".to_string()));
        assert_eq!(
            compiled.inbound[1].target,
            CompiledTarget::Groups(vec!["web".to_string(), "db".to_string()])
        );
        assert_eq!(compiled.inbound[2].port, "443");

        assert_eq!(compiled.outbound.len(), 1);
        assert_eq!(compiled.outbound[0].target, CompiledTarget::Group("db".to_string()));
    }

    #[test]
    fn test_compile_rejects_foreign_group() {
        let web = group("web");
        let names: HashMap<Uuid, String> = [(web.id, web.name.clone())].into_iter().collect();
        let rules = GroupRules {
            group: web.clone(),
            rules: vec![rule(
                &web,
                FirewallRuleInput::new(Direction::Inbound, Protocol::Tcp)
                    .port("80")
                    .group(Uuid::new_v4()),
            )],
        };
        assert!(compile(&[rules], &names).is_err());
    }

    #[test]
    fn test_compiled_rule_json_shape() {
        let rule = CompiledRule {
            port: "80".to_string(),
            proto: "tcp".to_string(),
            target: CompiledTarget::Host("any".to_string()),
            local_cidr: None,
            ca_name: Some("acme-ca".to_string()),
            ca_sha: None,
        };
        assert_eq!(
            serde_json::to_string(&rule).unwrap(),
            r#"{"port":"80","proto":"tcp","host":"any","ca_name":"acme-ca"}"#
        );
    }
}
