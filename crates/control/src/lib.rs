//! Meshplane control plane
//!
//! Provisions organizations, allocates overlay addresses, issues device
//! certificates and assembles the configuration documents devices poll for.

pub mod allocator;
pub mod assembler;
pub mod config;
pub mod firewall;
pub mod issuance;
pub mod provisioning;
pub mod signer;

pub use allocator::IpAllocator;
pub use assembler::ConfigDocument;
pub use config::ControlConfig;
pub use firewall::{CompiledRule, CompiledRules, CompiledTarget, FirewallRuleInput};
pub use issuance::CertificateIssuer;
pub use provisioning::{
    AdminPolicy, CheckInResponse, ControlPlane, DeviceProvisioning, DeviceStatus, NewLighthouse,
    NewNetwork, NewNode, NewOrganization, ProvisioningWarning,
};
pub use signer::{CertSigner, KeyMaterial, NebulaCertSigner, SigningRequest, StubSigner};
