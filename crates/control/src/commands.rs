//! CLI subcommands

use anyhow::Context;
use clap::{Args, Subcommand};
use meshplane_common::{Direction, MembershipRole, Organization, Protocol, UserRef};
use meshplane_control::{
    ControlPlane, FirewallRuleInput, NewLighthouse, NewNetwork, NewNode, NewOrganization,
};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init,

    /// Manage organizations
    #[command(subcommand)]
    Org(OrgCommands),

    /// Manage networks
    #[command(subcommand)]
    Network(NetworkCommands),

    /// Manage the organization's certificate authority
    #[command(subcommand)]
    Ca(CaCommands),

    /// Manage security groups and firewall rules
    #[command(subcommand)]
    Group(GroupCommands),

    /// Create a node
    Node(NodeArgs),

    /// Create a lighthouse
    Lighthouse(LighthouseArgs),

    /// Operate on existing devices
    #[command(subcommand)]
    Device(DeviceCommands),

    /// Poll for configuration as a device
    CheckIn(DeviceAuthArgs),

    /// Show device status as a device
    Status(DeviceAuthArgs),
}

#[derive(Subcommand)]
pub enum OrgCommands {
    /// Create an organization with its primary network
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        network_name: Option<String>,
        #[arg(long)]
        network_cidr: Option<String>,
        #[arg(long)]
        network_description: Option<String>,
        #[command(flatten)]
        user: UserArgs,
    },
    /// Show an organization
    Show { slug: String },
    /// Add a member
    AddMember {
        #[arg(long)]
        org: String,
        #[command(flatten)]
        user: UserArgs,
        #[arg(long, default_value = "viewer")]
        role: String,
    },
}

#[derive(Args)]
pub struct UserArgs {
    /// Email of the acting user
    #[arg(long, env = "MESHPLANE_USER_EMAIL")]
    email: String,
    /// Id of the acting user (random when omitted)
    #[arg(long)]
    user_id: Option<Uuid>,
}

impl UserArgs {
    fn user(&self) -> UserRef {
        UserRef {
            id: self.user_id.unwrap_or_else(Uuid::new_v4),
            email: self.email.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum NetworkCommands {
    /// Create a secondary network
    Create {
        #[arg(long)]
        org: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        cidr: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List networks of an organization
    List {
        #[arg(long)]
        org: String,
    },
    /// Show the next address that would be assigned
    NextIp { network: Uuid },
    /// Rebuild configs of every provisioned device in a network
    Regenerate { network: Uuid },
}

#[derive(Subcommand)]
pub enum CaCommands {
    /// Generate the organization's CA
    Create {
        #[arg(long)]
        org: String,
    },
    /// Revoke the organization's CA
    Revoke {
        #[arg(long)]
        org: String,
    },
}

#[derive(Subcommand)]
pub enum GroupCommands {
    /// Create a security group
    Create {
        #[arg(long)]
        org: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List security groups of an organization
    List {
        #[arg(long)]
        org: String,
    },
    /// Append a firewall rule
    Rule(RuleArgs),
    /// Add a device to a group
    Attach {
        #[arg(long)]
        device: Uuid,
        #[arg(long)]
        group: Uuid,
    },
    /// Remove a device from a group
    Detach {
        #[arg(long)]
        device: Uuid,
        #[arg(long)]
        group: Uuid,
    },
}

#[derive(Args)]
pub struct RuleArgs {
    /// Security group id
    group_id: Uuid,
    /// inbound or outbound
    #[arg(long)]
    direction: String,
    /// tcp, udp, icmp or any
    #[arg(long)]
    protocol: String,
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    cidr: Option<String>,
    #[arg(long)]
    target_group: Option<Uuid>,
    #[arg(long, value_delimiter = ',')]
    target_groups: Option<Vec<Uuid>>,
    #[arg(long)]
    local_cidr: Option<String>,
    #[arg(long)]
    ca_name: Option<String>,
    #[arg(long)]
    ca_sha: Option<String>,
}

#[derive(Args)]
pub struct NodeArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    hostname: String,
    #[arg(long)]
    network: Option<Uuid>,
    #[arg(long)]
    ip: Option<Ipv4Addr>,
    #[arg(long)]
    lighthouse: Option<Uuid>,
    #[arg(long = "group")]
    groups: Vec<Uuid>,
}

#[derive(Args)]
pub struct LighthouseArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    hostname: String,
    #[arg(long)]
    public_ip: IpAddr,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    inactive: bool,
    #[arg(long)]
    network: Option<Uuid>,
    #[arg(long)]
    ip: Option<Ipv4Addr>,
    #[arg(long = "group")]
    groups: Vec<Uuid>,
}

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// Show a device
    Show { id: Uuid },
    /// Retry certificate, config and API key provisioning
    Provision { id: Uuid },
    /// Rebuild the device's configuration
    Regenerate { id: Uuid },
    /// Revoke the device's certificate
    RevokeCert { id: Uuid },
    /// Revoke an API key
    RevokeKey { key_id: Uuid },
}

#[derive(Args)]
pub struct DeviceAuthArgs {
    #[arg(long, env = "MESHPLANE_API_KEY", hide_env_values = true)]
    api_key: String,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn org_by_slug(plane: &ControlPlane, slug: &str) -> anyhow::Result<Organization> {
    plane
        .database()
        .get_organization_by_slug(slug)?
        .with_context(|| format!("organization '{}' not found", slug))
}

pub async fn execute(cmd: Commands, plane: &ControlPlane) -> anyhow::Result<()> {
    match cmd {
        Commands::Init => Ok(()),
        Commands::Org(cmd) => org(cmd, plane).await,
        Commands::Network(cmd) => network(cmd, plane),
        Commands::Ca(cmd) => ca(cmd, plane).await,
        Commands::Group(cmd) => group(cmd, plane),
        Commands::Node(args) => {
            let org = org_by_slug(plane, &args.org)?;
            let result = plane
                .create_node(
                    org.id,
                    NewNode {
                        name: args.name,
                        hostname: args.hostname,
                        network_id: args.network,
                        overlay_ip: args.ip,
                        lighthouse_id: args.lighthouse,
                        security_group_ids: args.groups,
                    },
                )
                .await?;
            print_json(&result)
        }
        Commands::Lighthouse(args) => {
            let org = org_by_slug(plane, &args.org)?;
            let result = plane
                .create_lighthouse(
                    org.id,
                    NewLighthouse {
                        name: args.name,
                        hostname: args.hostname,
                        public_ip: args.public_ip,
                        port: args.port,
                        is_active: Some(!args.inactive),
                        network_id: args.network,
                        overlay_ip: args.ip,
                        security_group_ids: args.groups,
                    },
                )
                .await?;
            print_json(&result)
        }
        Commands::Device(cmd) => device(cmd, plane).await,
        Commands::CheckIn(args) => print_json(&plane.check_in(&args.api_key)?),
        Commands::Status(args) => print_json(&plane.device_status(&args.api_key)?),
    }
}

async fn org(cmd: OrgCommands, plane: &ControlPlane) -> anyhow::Result<()> {
    match cmd {
        OrgCommands::Create {
            name,
            description,
            network_name,
            network_cidr,
            network_description,
            user,
        } => {
            let org = plane
                .create_organization(
                    NewOrganization {
                        name,
                        description,
                        network_name,
                        network_cidr,
                        network_description,
                    },
                    &user.user(),
                )
                .await?;
            print_json(&org)
        }
        OrgCommands::Show { slug } => {
            let org = org_by_slug(plane, &slug)?;
            print_json(&serde_json::json!({
                "organization": org,
                "networks": plane.database().list_networks(org.id)?,
                "members": plane.database().list_memberships(org.id)?,
                "certificate_authority": plane.database().get_certificate_authority(org.id)?,
            }))
        }
        OrgCommands::AddMember { org, user, role } => {
            let org = org_by_slug(plane, &org)?;
            let role: MembershipRole = role.parse()?;
            print_json(&plane.add_member(org.id, &user.user(), role)?)
        }
    }
}

fn network(cmd: NetworkCommands, plane: &ControlPlane) -> anyhow::Result<()> {
    match cmd {
        NetworkCommands::Create {
            org,
            name,
            cidr,
            description,
        } => {
            let org = org_by_slug(plane, &org)?;
            let network = plane.create_network(
                org.id,
                NewNetwork {
                    name,
                    cidr,
                    description,
                },
            )?;
            print_json(&network)
        }
        NetworkCommands::List { org } => {
            let org = org_by_slug(plane, &org)?;
            print_json(&plane.database().list_networks(org.id)?)
        }
        NetworkCommands::NextIp { network } => {
            println!("{}", plane.next_available_ip(network)?);
            Ok(())
        }
        NetworkCommands::Regenerate { network } => {
            let count = plane.regenerate_network_configs(network)?;
            println!("Regenerated {} device configs", count);
            Ok(())
        }
    }
}

async fn ca(cmd: CaCommands, plane: &ControlPlane) -> anyhow::Result<()> {
    match cmd {
        CaCommands::Create { org } => {
            let org = org_by_slug(plane, &org)?;
            print_json(&plane.create_certificate_authority(org.id).await?)
        }
        CaCommands::Revoke { org } => {
            let org = org_by_slug(plane, &org)?;
            print_json(&plane.revoke_certificate_authority(org.id)?)
        }
    }
}

fn group(cmd: GroupCommands, plane: &ControlPlane) -> anyhow::Result<()> {
    match cmd {
        GroupCommands::Create {
            org,
            name,
            description,
        } => {
            let org = org_by_slug(plane, &org)?;
            print_json(&plane.create_security_group(org.id, &name, &description)?)
        }
        GroupCommands::List { org } => {
            let org = org_by_slug(plane, &org)?;
            print_json(&plane.database().list_security_groups(org.id)?)
        }
        GroupCommands::Rule(args) => {
            let direction: Direction = args.direction.parse()?;
            let protocol: Protocol = args.protocol.parse()?;
            let input = FirewallRuleInput {
                direction,
                protocol,
                port: args.port,
                host: args.host,
                cidr: args.cidr,
                group: args.target_group,
                groups: args.target_groups,
                local_cidr: args.local_cidr,
                ca_name: args.ca_name,
                ca_sha: args.ca_sha,
            };
            print_json(&plane.add_firewall_rule(args.group_id, &input)?)
        }
        GroupCommands::Attach { device, group } => {
            print_json(&plane.attach_security_group(device, group)?)
        }
        GroupCommands::Detach { device, group } => {
            print_json(&plane.detach_security_group(device, group)?)
        }
    }
}

async fn device(cmd: DeviceCommands, plane: &ControlPlane) -> anyhow::Result<()> {
    match cmd {
        DeviceCommands::Show { id } => {
            let device = plane
                .database()
                .get_device(id)?
                .with_context(|| format!("device {} not found", id))?;
            print_json(&device)
        }
        DeviceCommands::Provision { id } => print_json(&plane.provision_credentials(id).await?),
        DeviceCommands::Regenerate { id } => print_json(&plane.regenerate_config(id)?),
        DeviceCommands::RevokeCert { id } => print_json(&plane.revoke_certificate(id)?),
        DeviceCommands::RevokeKey { key_id } => {
            plane.revoke_api_key(key_id)?;
            println!("Revoked API key {}", key_id);
            Ok(())
        }
    }
}
