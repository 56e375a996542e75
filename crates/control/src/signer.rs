//! Certificate signing backends
//!
//! Supports:
//! - `nebula-cert` executable (production)
//! - In-process stub (tests, local demos)

use crate::config::SignerConfig;
use async_trait::async_trait;
use chrono::Duration as ValidityPeriod;
use ipnetwork::Ipv4Network;
use meshplane_common::{sha256_hex, Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A certificate and its private key, both PEM encoded
#[derive(Clone)]
pub struct KeyMaterial {
    pub cert: String,
    pub key: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("cert_len", &self.cert.len())
            .finish()
    }
}

/// What to put into a device certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    pub name: String,
    /// Device address together with the network prefix length
    pub ip: Ipv4Network,
    pub groups: Vec<String>,
    pub validity: ValidityPeriod,
}

/// Signing capability
#[async_trait]
pub trait CertSigner: Send + Sync {
    /// Generate a fresh certificate authority
    async fn create_ca(&self, name: &str, validity: ValidityPeriod) -> Result<KeyMaterial>;

    /// Sign a device certificate with the given CA
    async fn sign(&self, request: &SigningRequest, ca: &KeyMaterial) -> Result<KeyMaterial>;
}

// ============================================================================
// nebula-cert
// ============================================================================

/// Signer that shells out to `nebula-cert`.
///
/// CA material only exists on disk inside a private temporary directory for
/// the duration of one invocation.
pub struct NebulaCertSigner {
    binary: PathBuf,
    timeout: Duration,
    work_dir: Option<PathBuf>,
}

impl NebulaCertSigner {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            work_dir: None,
        }
    }

    /// Create scratch directories under `dir` instead of the system temp dir
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("meshplane-sign-");
        let dir = match &self.work_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        dir.map_err(|e| Error::Signing(format!("cannot create scratch directory: {}", e)))
    }

    async fn run(&self, args: &[String], cwd: &Path) -> Result<()> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Signing(format!(
                    "failed to run {}: {}",
                    self.binary.display(),
                    e
                )));
            }
            Err(_) => {
                error!(
                    "{} did not finish within {}s",
                    self.binary.display(),
                    self.timeout.as_secs()
                );
                return Err(Error::Signing(format!(
                    "{} timed out after {}s",
                    self.binary.display(),
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} failed: {}", self.binary.display(), stderr);
            return Err(Error::Signing(if stderr.is_empty() {
                format!("{} exited with {}", self.binary.display(), output.status)
            } else {
                stderr
            }));
        }
        Ok(())
    }
}

fn duration_arg(validity: ValidityPeriod) -> String {
    format!("{}h", validity.num_hours().max(1))
}

async fn write_input(path: &Path, content: &str, what: &str) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| Error::Signing(format!("cannot write {}: {}", what, e)))
}

async fn read_pem(path: &Path, what: &str) -> Result<String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Signing(format!("malformed output: cannot read {}: {}", what, e)))?;
    if !content.contains("-----BEGIN") {
        return Err(Error::Signing(format!("malformed output: {} is not PEM encoded", what)));
    }
    Ok(content)
}

#[async_trait]
impl CertSigner for NebulaCertSigner {
    async fn create_ca(&self, name: &str, validity: ValidityPeriod) -> Result<KeyMaterial> {
        let dir = self.scratch_dir()?;
        let crt = dir.path().join("ca.crt");
        let key = dir.path().join("ca.key");

        let args = vec![
            "ca".to_string(),
            "-name".to_string(),
            name.to_string(),
            "-duration".to_string(),
            duration_arg(validity),
            "-out-crt".to_string(),
            crt.display().to_string(),
            "-out-key".to_string(),
            key.display().to_string(),
        ];
        self.run(&args, dir.path()).await?;

        let material = KeyMaterial {
            cert: read_pem(&crt, "CA certificate").await?,
            key: read_pem(&key, "CA key").await?,
        };
        info!("Generated CA {}", name);
        Ok(material)
    }

    async fn sign(&self, request: &SigningRequest, ca: &KeyMaterial) -> Result<KeyMaterial> {
        let dir = self.scratch_dir()?;
        let ca_crt = dir.path().join("ca.crt");
        let ca_key = dir.path().join("ca.key");
        let out_crt = dir.path().join("host.crt");
        let out_key = dir.path().join("host.key");

        write_input(&ca_crt, &ca.cert, "CA certificate").await?;
        write_input(&ca_key, &ca.key, "CA key").await?;

        let args = vec![
            "sign".to_string(),
            "-name".to_string(),
            request.name.clone(),
            "-ip".to_string(),
            request.ip.to_string(),
            "-groups".to_string(),
            request.groups.join(","),
            "-duration".to_string(),
            duration_arg(request.validity),
            "-ca-crt".to_string(),
            ca_crt.display().to_string(),
            "-ca-key".to_string(),
            ca_key.display().to_string(),
            "-out-crt".to_string(),
            out_crt.display().to_string(),
            "-out-key".to_string(),
            out_key.display().to_string(),
        ];
        self.run(&args, dir.path()).await?;

        let material = KeyMaterial {
            cert: read_pem(&out_crt, "certificate").await?,
            key: read_pem(&out_key, "key").await?,
        };
        debug!("Signed certificate for {} ({})", request.name, request.ip);
        Ok(material)
    }
}

/// Build the signer selected by configuration
pub fn from_config(config: &SignerConfig) -> Arc<dyn CertSigner> {
    if config.stub {
        info!("Using stub certificate signer");
        Arc::new(StubSigner)
    } else {
        let signer = NebulaCertSigner::new(&config.binary_path, config.timeout());
        match &config.work_dir {
            Some(dir) => Arc::new(signer.with_work_dir(dir)),
            None => Arc::new(signer),
        }
    }
}

// ============================================================================
// Stub implementation
// ============================================================================

/// Stub signer that fabricates PEM-shaped material without any crypto
#[derive(Debug, Default)]
pub struct StubSigner;

fn stub_pem(label: &str, body: &str) -> String {
    format!("-----BEGIN {label}-----\n{body}\n-----END {label}-----\n")
}

#[async_trait]
impl CertSigner for StubSigner {
    async fn create_ca(&self, name: &str, validity: ValidityPeriod) -> Result<KeyMaterial> {
        debug!("Stub: Creating CA {}", name);
        let seed = format!("ca|{}|{}|{}", name, validity.num_hours(), Uuid::new_v4());
        Ok(KeyMaterial {
            cert: stub_pem("NEBULA CERTIFICATE", &sha256_hex(seed.as_bytes())),
            key: stub_pem("NEBULA ED25519 PRIVATE KEY", &sha256_hex(Uuid::new_v4().as_bytes())),
        })
    }

    async fn sign(&self, request: &SigningRequest, ca: &KeyMaterial) -> Result<KeyMaterial> {
        debug!("Stub: Signing {} ({})", request.name, request.ip);
        let seed = format!(
            "{}|{}|{}|{}|{}",
            request.name,
            request.ip,
            request.groups.join(","),
            sha256_hex(ca.cert.as_bytes()),
            Uuid::new_v4()
        );
        Ok(KeyMaterial {
            cert: stub_pem("NEBULA CERTIFICATE", &sha256_hex(seed.as_bytes())),
            key: stub_pem("NEBULA X25519 PRIVATE KEY", &sha256_hex(Uuid::new_v4().as_bytes())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SigningRequest {
        SigningRequest {
            name: "laptop".to_string(),
            ip: Ipv4Network::new("10.0.0.3".parse().unwrap(), 24).unwrap(),
            groups: vec!["web".to_string(), "admin".to_string()],
            validity: ValidityPeriod::days(90),
        }
    }

    #[tokio::test]
    async fn test_stub_signer_produces_pem() {
        let signer = StubSigner;
        let ca = signer.create_ca("acme", ValidityPeriod::days(365)).await.unwrap();
        assert!(ca.cert.starts_with("-----BEGIN NEBULA CERTIFICATE-----"));

        let signed = signer.sign(&request(), &ca).await.unwrap();
        assert!(signed.key.contains("PRIVATE KEY"));
        assert_ne!(signed.cert, ca.cert);
    }

    #[test]
    fn test_duration_arg() {
        assert_eq!(duration_arg(ValidityPeriod::days(90)), "2160h");
        assert_eq!(duration_arg(ValidityPeriod::minutes(5)), "1h");
    }

    #[test]
    fn test_debug_hides_key() {
        let material = KeyMaterial {
            cert: "cert".to_string(),
            key: "super-secret".to_string(),
        };
        assert!(!format!("{:?}", material).contains("super-secret"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_signing_error() {
        let signer = NebulaCertSigner::new("/nonexistent/nebula-cert", Duration::from_secs(5));
        let ca = KeyMaterial {
            cert: "-----BEGIN NEBULA CERTIFICATE-----".to_string(),
            key: "-----BEGIN NEBULA ED25519 PRIVATE KEY-----".to_string(),
        };
        let err = signer.sign(&request(), &ca).await.unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
    }

    #[tokio::test]
    async fn test_scratch_dir_failure_is_signing_error() {
        let root = tempfile::tempdir().unwrap();
        let signer = NebulaCertSigner::new("/nonexistent/nebula-cert", Duration::from_secs(5))
            .with_work_dir(root.path().join("missing"));

        let err = signer
            .create_ca("acme", ValidityPeriod::days(365))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signing(ref msg) if msg.contains("scratch directory")));

        let ca = StubSigner.create_ca("acme", ValidityPeriod::days(365)).await.unwrap();
        let err = signer.sign(&request(), &ca).await.unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
    }

    #[cfg(unix)]
    mod script {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn install(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("nebula-cert");
            std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        const FAKE_NEBULA_CERT: &str = r#"
echo "$@" > "$(dirname "$0")/args.log"
while [ $# -gt 0 ]; do
  case "$1" in
    -out-crt) crt="$2"; shift ;;
    -out-key) key="$2"; shift ;;
    -ca-key) cat "$2" > "$(dirname "$0")/seen-ca.key" ;;
  esac
  shift
done
printf -- '-----BEGIN NEBULA CERTIFICATE-----\nZmFrZQ==\n-----END NEBULA CERTIFICATE-----\n' > "$crt"
printf -- '-----BEGIN NEBULA X25519 PRIVATE KEY-----\nZmFrZQ==\n-----END NEBULA X25519 PRIVATE KEY-----\n' > "$key"
"#;

        #[tokio::test]
        async fn test_sign_invocation() {
            let bin_dir = tempfile::tempdir().unwrap();
            let binary = install(bin_dir.path(), FAKE_NEBULA_CERT);
            let signer = NebulaCertSigner::new(&binary, Duration::from_secs(10));

            let ca = KeyMaterial {
                cert: "-----BEGIN NEBULA CERTIFICATE-----\nca\n".to_string(),
                key: "ca-private-key".to_string(),
            };
            let signed = signer.sign(&request(), &ca).await.unwrap();
            assert!(signed.cert.contains("NEBULA CERTIFICATE"));

            let args = std::fs::read_to_string(bin_dir.path().join("args.log")).unwrap();
            assert!(args.starts_with("sign -name laptop -ip 10.0.0.3/24 -groups web,admin -duration 2160h"));

            let seen = std::fs::read_to_string(bin_dir.path().join("seen-ca.key")).unwrap();
            assert_eq!(seen, "ca-private-key");
        }

        #[tokio::test]
        async fn test_nonzero_exit_reports_stderr() {
            let bin_dir = tempfile::tempdir().unwrap();
            let binary = install(bin_dir.path(), "echo 'invalid ip' >&2\nexit 1\n");
            let signer = NebulaCertSigner::new(&binary, Duration::from_secs(10));

            let err = signer.create_ca("acme", ValidityPeriod::days(365)).await.unwrap_err();
            assert!(err.to_string().contains("invalid ip"));
        }

        #[tokio::test]
        async fn test_missing_output_is_malformed() {
            let bin_dir = tempfile::tempdir().unwrap();
            let binary = install(bin_dir.path(), "exit 0\n");
            let signer = NebulaCertSigner::new(&binary, Duration::from_secs(10));

            let err = signer.create_ca("acme", ValidityPeriod::days(365)).await.unwrap_err();
            assert!(err.to_string().contains("malformed output"));
        }

        #[tokio::test]
        async fn test_timeout_is_signing_error() {
            let bin_dir = tempfile::tempdir().unwrap();
            let binary = install(bin_dir.path(), "sleep 10\n");
            let signer = NebulaCertSigner::new(&binary, Duration::from_millis(200));

            let err = signer.create_ca("acme", ValidityPeriod::days(365)).await.unwrap_err();
            assert!(matches!(err, Error::Signing(ref msg) if msg.contains("timed out")));
        }
    }
}
