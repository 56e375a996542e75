//! Control plane configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest certificate lifetime accepted from configuration
pub const MAX_VALIDITY_DAYS: i64 = 36_500;

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Certificate signing executable
    pub signer: SignerConfig,

    /// Certificate lifetimes
    pub certificates: CertificateConfig,

    /// Defaults for an organization's primary network
    pub network: NetworkDefaults,

    /// Membership policy
    pub policy: PolicyConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            store_path: meshplane_common::default_store_path(),
            signer: SignerConfig::default(),
            certificates: CertificateConfig::default(),
            network: NetworkDefaults::default(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Signing executable configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Path to the nebula-cert binary
    pub binary_path: String,

    /// Upper bound on a single signing invocation
    pub timeout_secs: u64,

    /// Use the in-process stub signer instead of the binary
    pub stub: bool,

    /// Parent directory for per-invocation scratch directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            binary_path: "nebula-cert".to_string(),
            timeout_secs: 30,
            stub: false,
            work_dir: None,
        }
    }
}

impl SignerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Certificate validity periods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    pub node_validity_days: i64,
    pub ca_validity_days: i64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            node_validity_days: 90,
            ca_validity_days: 365,
        }
    }
}

/// Primary network defaults used when organization creation omits them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDefaults {
    pub default_name: String,
    pub default_cidr: String,
    pub default_description: String,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            default_name: "Primary Network".to_string(),
            default_cidr: "192.168.100.0/24".to_string(),
            default_description: "Primary network for the organization".to_string(),
        }
    }
}

/// Membership policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Users with these emails always join as admins
    pub admin_emails: Vec<String>,
}

impl ControlConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the signer cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.signer.timeout_secs == 0 {
            anyhow::bail!("signer.timeout_secs must be at least 1");
        }
        for (field, days) in [
            ("certificates.node_validity_days", self.certificates.node_validity_days),
            ("certificates.ca_validity_days", self.certificates.ca_validity_days),
        ] {
            if !(1..=MAX_VALIDITY_DAYS).contains(&days) {
                anyhow::bail!(
                    "{} must be between 1 and {}, got {}",
                    field,
                    MAX_VALIDITY_DAYS,
                    days
                );
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}
