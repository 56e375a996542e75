//! SQLite persistence for meshplane state
//!
//! Tables:
//! - organizations / memberships
//! - networks (one primary per organization, enforced by a partial index)
//! - certificate_authorities / certificates
//! - security_groups / firewall_rules / device_security_groups
//! - devices: nodes and lighthouses share one table so that
//!   `(network_id, overlay_ip)` is a single uniqueness constraint
//! - api_keys

use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Database wrapper for control plane state
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        // Other processes may hold the write lock briefly
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memberships (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_email TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'viewer',
                created_at INTEGER NOT NULL,
                UNIQUE(organization_id, user_id),
                FOREIGN KEY(organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS networks (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                cidr TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_primary INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(organization_id, name),
                FOREIGN KEY(organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_networks_primary
                ON networks(organization_id) WHERE is_primary = 1;

            CREATE TABLE IF NOT EXISTS certificate_authorities (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL UNIQUE,
                network_id TEXT NOT NULL,
                ca_cert TEXT NOT NULL,
                ca_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                revoked_at INTEGER,
                FOREIGN KEY(organization_id) REFERENCES organizations(id) ON DELETE CASCADE,
                FOREIGN KEY(network_id) REFERENCES networks(id)
            );

            CREATE TABLE IF NOT EXISTS certificates (
                id TEXT PRIMARY KEY,
                ca_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                cert TEXT NOT NULL,
                key TEXT NOT NULL,
                overlay_ip TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                revoked_at INTEGER,
                FOREIGN KEY(ca_id) REFERENCES certificate_authorities(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_certificates_ca ON certificates(ca_id);

            CREATE TABLE IF NOT EXISTS security_groups (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                UNIQUE(organization_id, name),
                FOREIGN KEY(organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS firewall_rules (
                id TEXT PRIMARY KEY,
                security_group_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                protocol TEXT NOT NULL,
                port TEXT,
                target TEXT NOT NULL,
                local_cidr TEXT,
                ca_name TEXT,
                ca_sha TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(security_group_id) REFERENCES security_groups(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_firewall_rules_group ON firewall_rules(security_group_id);

            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                network_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                hostname TEXT NOT NULL,
                overlay_ip TEXT NOT NULL,
                certificate_id TEXT,
                lighthouse_id TEXT,
                public_ip TEXT,
                port INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                config TEXT NOT NULL DEFAULT '{}',
                config_digest TEXT,
                delivered_digest TEXT,
                last_check_in INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(organization_id, name),
                UNIQUE(network_id, overlay_ip),
                FOREIGN KEY(organization_id) REFERENCES organizations(id) ON DELETE CASCADE,
                FOREIGN KEY(network_id) REFERENCES networks(id),
                FOREIGN KEY(certificate_id) REFERENCES certificates(id) ON DELETE SET NULL,
                FOREIGN KEY(lighthouse_id) REFERENCES devices(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_devices_network ON devices(network_id);

            CREATE TABLE IF NOT EXISTS device_security_groups (
                device_id TEXT NOT NULL,
                security_group_id TEXT NOT NULL,
                PRIMARY KEY(device_id, security_group_id),
                FOREIGN KEY(device_id) REFERENCES devices(id) ON DELETE CASCADE,
                FOREIGN KEY(security_group_id) REFERENCES security_groups(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                device_id TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER,
                last_used INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(device_id) REFERENCES devices(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_device ON api_keys(device_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Organizations
    // ========================================================================

    /// Insert an organization, its first membership and its primary network
    /// as one transaction. Nothing persists unless all three rows do.
    pub fn insert_organization_with_primary_network(
        &self,
        org: &Organization,
        membership: &Membership,
        network: &Network,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO organizations (id, name, slug, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                org.id.to_string(),
                org.name,
                org.slug,
                org.description,
                ts(org.created_at),
                ts(org.updated_at),
            ],
        )
        .map_err(|e| map_unique(e, |_| Error::already_exists("organization", &org.slug)))?;

        insert_membership_row(&tx, membership)?;
        insert_network_row(&tx, network)?;

        tx.commit()?;
        info!("Created organization {} ({})", org.slug, org.id);
        Ok(())
    }

    pub fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let conn = self.conn.lock();
        let org = conn
            .query_row(
                "SELECT id, name, slug, description, created_at, updated_at
                 FROM organizations WHERE id = ?1",
                params![id.to_string()],
                organization_from_row,
            )
            .optional()?;
        Ok(org)
    }

    pub fn get_organization_by_slug(&self, slug: &str) -> Result<Option<Organization>> {
        let conn = self.conn.lock();
        let org = conn
            .query_row(
                "SELECT id, name, slug, description, created_at, updated_at
                 FROM organizations WHERE slug = ?1",
                params![slug],
                organization_from_row,
            )
            .optional()?;
        Ok(org)
    }

    pub fn count_organizations(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM organizations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========================================================================
    // Memberships
    // ========================================================================

    pub fn insert_membership(&self, membership: &Membership) -> Result<()> {
        let conn = self.conn.lock();
        insert_membership_row(&conn, membership)
    }

    pub fn list_memberships(&self, organization_id: Uuid) -> Result<Vec<Membership>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, user_id, user_email, role, created_at
             FROM memberships WHERE organization_id = ?1 ORDER BY user_email",
        )?;
        let rows = stmt.query_map(params![organization_id.to_string()], membership_from_row)?;
        collect_rows(rows)
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub fn insert_network(&self, network: &Network) -> Result<()> {
        let conn = self.conn.lock();
        insert_network_row(&conn, network)?;
        info!("Created network {} ({})", network.name, network.cidr);
        Ok(())
    }

    pub fn get_network(&self, id: Uuid) -> Result<Option<Network>> {
        let conn = self.conn.lock();
        let network = conn
            .query_row(
                &format!("SELECT {} FROM networks WHERE id = ?1", NETWORK_COLUMNS),
                params![id.to_string()],
                network_from_row,
            )
            .optional()?;
        Ok(network)
    }

    pub fn get_primary_network(&self, organization_id: Uuid) -> Result<Option<Network>> {
        let conn = self.conn.lock();
        let network = conn
            .query_row(
                &format!(
                    "SELECT {} FROM networks WHERE organization_id = ?1 AND is_primary = 1",
                    NETWORK_COLUMNS
                ),
                params![organization_id.to_string()],
                network_from_row,
            )
            .optional()?;
        Ok(network)
    }

    pub fn list_networks(&self, organization_id: Uuid) -> Result<Vec<Network>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM networks WHERE organization_id = ?1 ORDER BY name",
            NETWORK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![organization_id.to_string()], network_from_row)?;
        collect_rows(rows)
    }

    // ========================================================================
    // Certificate authorities and certificates
    // ========================================================================

    pub fn insert_certificate_authority(&self, ca: &CertificateAuthority) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO certificate_authorities
             (id, organization_id, network_id, ca_cert, ca_key, created_at, expires_at, revoked, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ca.id.to_string(),
                ca.organization_id.to_string(),
                ca.network_id.to_string(),
                ca.ca_cert,
                ca.ca_key,
                ts(ca.created_at),
                ts(ca.expires_at),
                ca.revoked,
                ca.revoked_at.map(ts),
            ],
        )
        .map_err(|e| {
            map_unique(e, |_| {
                Error::already_exists("certificate authority for organization", ca.organization_id)
            })
        })?;
        Ok(())
    }

    pub fn get_certificate_authority(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<CertificateAuthority>> {
        let conn = self.conn.lock();
        let ca = conn
            .query_row(
                "SELECT id, organization_id, network_id, ca_cert, ca_key, created_at, expires_at, revoked, revoked_at
                 FROM certificate_authorities WHERE organization_id = ?1",
                params![organization_id.to_string()],
                |row| {
                    Ok(CertificateAuthority {
                        id: parsed_col(row, 0)?,
                        organization_id: parsed_col(row, 1)?,
                        network_id: parsed_col(row, 2)?,
                        ca_cert: row.get(3)?,
                        ca_key: row.get(4)?,
                        created_at: ts_col(row, 5)?,
                        expires_at: ts_col(row, 6)?,
                        revoked: row.get(7)?,
                        revoked_at: opt_ts_col(row, 8)?,
                    })
                },
            )
            .optional()?;
        Ok(ca)
    }

    pub fn revoke_certificate_authority(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE certificate_authorities SET revoked = 1, revoked_at = ?1 WHERE id = ?2",
            params![ts(at), id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("certificate authority", id));
        }
        Ok(())
    }

    /// Persist a signed certificate and bind it to its device in one step
    pub fn insert_device_certificate(&self, device_id: Uuid, cert: &Certificate) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO certificates
             (id, ca_id, kind, cert, key, overlay_ip, created_at, expires_at, revoked, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                cert.id.to_string(),
                cert.ca_id.to_string(),
                cert.kind.to_string(),
                cert.cert,
                cert.key,
                cert.overlay_ip.to_string(),
                ts(cert.created_at),
                ts(cert.expires_at),
                cert.revoked,
                cert.revoked_at.map(ts),
            ],
        )?;
        let changed = tx.execute(
            "UPDATE devices SET certificate_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![cert.id.to_string(), ts(Utc::now()), device_id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("device", device_id));
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_certificate(&self, id: Uuid) -> Result<Option<Certificate>> {
        let conn = self.conn.lock();
        let cert = conn
            .query_row(
                "SELECT id, ca_id, kind, cert, key, overlay_ip, created_at, expires_at, revoked, revoked_at
                 FROM certificates WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Certificate {
                        id: parsed_col(row, 0)?,
                        ca_id: parsed_col(row, 1)?,
                        kind: parsed_col(row, 2)?,
                        cert: row.get(3)?,
                        key: row.get(4)?,
                        overlay_ip: parsed_col(row, 5)?,
                        created_at: ts_col(row, 6)?,
                        expires_at: ts_col(row, 7)?,
                        revoked: row.get(8)?,
                        revoked_at: opt_ts_col(row, 9)?,
                    })
                },
            )
            .optional()?;
        Ok(cert)
    }

    pub fn revoke_certificate(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE certificates SET revoked = 1, revoked_at = ?1 WHERE id = ?2",
            params![ts(at), id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("certificate", id));
        }
        Ok(())
    }

    // ========================================================================
    // Security groups and firewall rules
    // ========================================================================

    pub fn insert_security_group(&self, group: &SecurityGroup) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO security_groups (id, organization_id, name, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.id.to_string(),
                group.organization_id.to_string(),
                group.name,
                group.description,
                ts(group.created_at),
            ],
        )
        .map_err(|e| map_unique(e, |_| Error::already_exists("security group", &group.name)))?;
        Ok(())
    }

    pub fn get_security_group(&self, id: Uuid) -> Result<Option<SecurityGroup>> {
        let conn = self.conn.lock();
        let group = conn
            .query_row(
                "SELECT id, organization_id, name, description, created_at
                 FROM security_groups WHERE id = ?1",
                params![id.to_string()],
                security_group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    /// All security groups of an organization, ordered by name
    pub fn list_security_groups(&self, organization_id: Uuid) -> Result<Vec<SecurityGroup>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, name, description, created_at
             FROM security_groups WHERE organization_id = ?1 ORDER BY name, id",
        )?;
        let rows = stmt.query_map(params![organization_id.to_string()], security_group_from_row)?;
        collect_rows(rows)
    }

    /// Security groups a device belongs to, ordered by name
    pub fn device_security_groups(&self, device_id: Uuid) -> Result<Vec<SecurityGroup>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.organization_id, g.name, g.description, g.created_at
             FROM security_groups g
             JOIN device_security_groups m ON m.security_group_id = g.id
             WHERE m.device_id = ?1
             ORDER BY g.name, g.id",
        )?;
        let rows = stmt.query_map(params![device_id.to_string()], security_group_from_row)?;
        collect_rows(rows)
    }

    /// Add a device to a security group. Adding twice is a no-op.
    pub fn attach_security_group(&self, device_id: Uuid, group_id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO device_security_groups (device_id, security_group_id) VALUES (?1, ?2)",
            params![device_id.to_string(), group_id.to_string()],
        )?;
        Ok(())
    }

    pub fn detach_security_group(&self, device_id: Uuid, group_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM device_security_groups WHERE device_id = ?1 AND security_group_id = ?2",
            params![device_id.to_string(), group_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_firewall_rule(&self, rule: &FirewallRule) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO firewall_rules
             (id, security_group_id, direction, protocol, port, target, local_cidr, ca_name, ca_sha, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rule.id.to_string(),
                rule.security_group_id.to_string(),
                rule.direction.to_string(),
                rule.protocol.to_string(),
                rule.port.map(|p| p.to_string()),
                serde_json::to_string(&rule.target)?,
                rule.local_cidr.map(|c| c.to_string()),
                rule.ca_name,
                rule.ca_sha,
                ts(rule.created_at),
            ],
        )?;
        debug!("Inserted firewall rule {} into group {}", rule.id, rule.security_group_id);
        Ok(())
    }

    /// Rules of a security group, in insertion order
    pub fn list_firewall_rules(&self, group_id: Uuid) -> Result<Vec<FirewallRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, security_group_id, direction, protocol, port, target, local_cidr, ca_name, ca_sha, created_at
             FROM firewall_rules WHERE security_group_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![group_id.to_string()], |row| {
            let port: Option<String> = row.get(4)?;
            let target: String = row.get(5)?;
            let local_cidr: Option<String> = row.get(6)?;
            Ok(FirewallRule {
                id: parsed_col(row, 0)?,
                security_group_id: parsed_col(row, 1)?,
                direction: parsed_col(row, 2)?,
                protocol: parsed_col(row, 3)?,
                port: port
                    .map(|p| p.parse())
                    .transpose()
                    .map_err(|e| conversion_error(4, Type::Text, e))?,
                target: serde_json::from_str(&target)
                    .map_err(|e| conversion_error(5, Type::Text, e))?,
                local_cidr: local_cidr
                    .map(|c| c.parse())
                    .transpose()
                    .map_err(|e| conversion_error(6, Type::Text, e))?,
                ca_name: row.get(7)?,
                ca_sha: row.get(8)?,
                created_at: ts_col(row, 9)?,
            })
        })?;
        collect_rows(rows)
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Insert a device together with its security group memberships.
    ///
    /// A clash on `(network_id, overlay_ip)` is reported as
    /// [`Error::Conflict`] so the allocator can re-read and retry.
    pub fn insert_device(&self, device: &Device, security_group_ids: &[Uuid]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let (lighthouse_id, public_ip, port, is_active) = match &device.kind {
            DeviceKind::Node { lighthouse_id } => {
                (lighthouse_id.map(|id| id.to_string()), None, None, true)
            }
            DeviceKind::Lighthouse {
                public_ip,
                port,
                is_active,
            } => (None, Some(public_ip.to_string()), Some(*port), *is_active),
        };

        tx.execute(
            "INSERT INTO devices
             (id, organization_id, network_id, kind, name, hostname, overlay_ip, certificate_id,
              lighthouse_id, public_ip, port, is_active, config, config_digest, delivered_digest,
              last_check_in, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                device.id.to_string(),
                device.organization_id.to_string(),
                device.network_id.to_string(),
                device.kind_name(),
                device.name,
                device.hostname,
                device.overlay_ip.to_string(),
                device.certificate_id.map(|id| id.to_string()),
                lighthouse_id,
                public_ip,
                port,
                is_active,
                serde_json::to_string(&device.config)?,
                device.config_digest,
                device.delivered_digest,
                device.last_check_in.map(ts),
                ts(device.created_at),
                ts(device.updated_at),
            ],
        )
        .map_err(|e| {
            map_unique(e, |msg| {
                if msg.contains("overlay_ip") {
                    Error::Conflict(format!(
                        "overlay IP {} already assigned in network {}",
                        device.overlay_ip, device.network_id
                    ))
                } else {
                    Error::already_exists(device.kind_name(), &device.name)
                }
            })
        })?;

        for group_id in security_group_ids {
            tx.execute(
                "INSERT OR IGNORE INTO device_security_groups (device_id, security_group_id) VALUES (?1, ?2)",
                params![device.id.to_string(), group_id.to_string()],
            )?;
        }

        tx.commit()?;
        info!(
            "Created {} {} at {} in network {}",
            device.kind_name(),
            device.name,
            device.overlay_ip,
            device.network_id
        );
        Ok(())
    }

    pub fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id.to_string()],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// All devices bound to a network, ordered by name
    pub fn list_network_devices(&self, network_id: Uuid) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices WHERE network_id = ?1 ORDER BY name, id",
            DEVICE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![network_id.to_string()], device_from_row)?;
        collect_rows(rows)
    }

    /// Active lighthouses of a network, ordered by name
    pub fn active_lighthouses(&self, network_id: Uuid) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices
             WHERE network_id = ?1 AND kind = 'lighthouse' AND is_active = 1
             ORDER BY name, id",
            DEVICE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![network_id.to_string()], device_from_row)?;
        collect_rows(rows)
    }

    /// Overlay IPs currently held by any device in a network
    pub fn used_ips(&self, network_id: Uuid) -> Result<HashSet<Ipv4Addr>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT overlay_ip FROM devices WHERE network_id = ?1")?;
        let rows = stmt.query_map(params![network_id.to_string()], |row| {
            parsed_col::<Ipv4Addr>(row, 0)
        })?;
        let mut used = HashSet::new();
        for row in rows {
            used.insert(row?);
        }
        Ok(used)
    }

    pub fn update_device_config(
        &self,
        device_id: Uuid,
        config: &serde_json::Value,
        digest: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE devices SET config = ?1, config_digest = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(config)?,
                digest,
                ts(Utc::now()),
                device_id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("device", device_id));
        }
        Ok(())
    }

    /// Record a device poll and the config digest it was handed
    pub fn record_check_in(
        &self,
        device_id: Uuid,
        at: DateTime<Utc>,
        delivered_digest: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE devices SET last_check_in = ?1, delivered_digest = COALESCE(?2, delivered_digest) WHERE id = ?3",
            params![ts(at), delivered_digest, device_id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("device", device_id));
        }
        Ok(())
    }

    // ========================================================================
    // API keys
    // ========================================================================

    pub fn insert_api_key(&self, key: &ApiKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_keys (id, name, key_hash, entity_type, device_id, is_active, expires_at, last_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                key.id.to_string(),
                key.name,
                key.key_hash,
                key.owner.entity_type(),
                key.owner.device_id().to_string(),
                key.is_active,
                key.expires_at.map(ts),
                key.last_used.map(ts),
                ts(key.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_api_key(&self, id: Uuid) -> Result<Option<ApiKey>> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                &format!("SELECT {} FROM api_keys WHERE id = ?1", API_KEY_COLUMNS),
                params![id.to_string()],
                api_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    pub fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                &format!("SELECT {} FROM api_keys WHERE key_hash = ?1", API_KEY_COLUMNS),
                params![key_hash],
                api_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    /// Most recent active key of a device
    pub fn active_api_key_for_device(&self, device_id: Uuid) -> Result<Option<ApiKey>> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                &format!(
                    "SELECT {} FROM api_keys WHERE device_id = ?1 AND is_active = 1
                     ORDER BY created_at DESC LIMIT 1",
                    API_KEY_COLUMNS
                ),
                params![device_id.to_string()],
                api_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    pub fn touch_api_key(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE api_keys SET last_used = ?1 WHERE id = ?2",
            params![ts(at), id.to_string()],
        )?;
        Ok(())
    }

    pub fn deactivate_api_key(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("api key", id));
        }
        Ok(())
    }
}

// ============================================================================
// Row helpers
// ============================================================================

const NETWORK_COLUMNS: &str =
    "id, organization_id, name, cidr, description, is_primary, created_at, updated_at";

const DEVICE_COLUMNS: &str = "id, organization_id, network_id, kind, name, hostname, overlay_ip, certificate_id, \
     lighthouse_id, public_ip, port, is_active, config, config_digest, delivered_digest, \
     last_check_in, created_at, updated_at";

const API_KEY_COLUMNS: &str =
    "id, name, key_hash, entity_type, device_id, is_active, expires_at, last_used, created_at";

fn insert_membership_row(conn: &Connection, membership: &Membership) -> Result<()> {
    conn.execute(
        "INSERT INTO memberships (id, organization_id, user_id, user_email, role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            membership.id.to_string(),
            membership.organization_id.to_string(),
            membership.user_id.to_string(),
            membership.user_email,
            membership.role.to_string(),
            ts(membership.created_at),
        ],
    )
    .map_err(|e| map_unique(e, |_| Error::already_exists("membership", &membership.user_email)))?;
    Ok(())
}

fn insert_network_row(conn: &Connection, network: &Network) -> Result<()> {
    conn.execute(
        "INSERT INTO networks (id, organization_id, name, cidr, description, is_primary, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            network.id.to_string(),
            network.organization_id.to_string(),
            network.name,
            network.cidr.to_string(),
            network.description,
            network.is_primary,
            ts(network.created_at),
            ts(network.updated_at),
        ],
    )
    .map_err(|e| {
        map_unique(e, |msg| {
            if msg.contains("networks.name") {
                Error::already_exists("network", &network.name)
            } else {
                Error::validation("Organization already has a primary network")
            }
        })
    })?;
    Ok(())
}

/// Translate a UNIQUE constraint failure into a domain error; anything else
/// stays a database error.
fn map_unique(err: rusqlite::Error, to_domain: impl FnOnce(&str) -> Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains("UNIQUE") =>
        {
            to_domain(msg)
        }
        _ => Error::Database(err),
    }
}

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            "timestamp out of range".into(),
        )
    })
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ts_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn opt_parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => raw.parse().map(Some).map_err(|e| conversion_error(idx, Type::Text, e)),
        None => Ok(None),
    }
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

fn organization_from_row(row: &Row<'_>) -> rusqlite::Result<Organization> {
    Ok(Organization {
        id: parsed_col(row, 0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        created_at: ts_col(row, 4)?,
        updated_at: ts_col(row, 5)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: parsed_col(row, 0)?,
        organization_id: parsed_col(row, 1)?,
        user_id: parsed_col(row, 2)?,
        user_email: row.get(3)?,
        role: parsed_col(row, 4)?,
        created_at: ts_col(row, 5)?,
    })
}

fn network_from_row(row: &Row<'_>) -> rusqlite::Result<Network> {
    Ok(Network {
        id: parsed_col(row, 0)?,
        organization_id: parsed_col(row, 1)?,
        name: row.get(2)?,
        cidr: parsed_col(row, 3)?,
        description: row.get(4)?,
        is_primary: row.get(5)?,
        created_at: ts_col(row, 6)?,
        updated_at: ts_col(row, 7)?,
    })
}

fn security_group_from_row(row: &Row<'_>) -> rusqlite::Result<SecurityGroup> {
    Ok(SecurityGroup {
        id: parsed_col(row, 0)?,
        organization_id: parsed_col(row, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: ts_col(row, 4)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let kind: String = row.get(3)?;
    let kind = match kind.as_str() {
        "node" => DeviceKind::Node {
            lighthouse_id: opt_parsed_col(row, 8)?,
        },
        "lighthouse" => DeviceKind::Lighthouse {
            public_ip: parsed_col(row, 9)?,
            port: row.get::<_, Option<u16>>(10)?.unwrap_or(DEFAULT_LISTEN_PORT),
            is_active: row.get(11)?,
        },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                format!("unknown device kind: {}", other).into(),
            ))
        }
    };

    let config: String = row.get(12)?;
    Ok(Device {
        id: parsed_col(row, 0)?,
        organization_id: parsed_col(row, 1)?,
        network_id: parsed_col(row, 2)?,
        name: row.get(4)?,
        hostname: row.get(5)?,
        overlay_ip: parsed_col(row, 6)?,
        certificate_id: opt_parsed_col(row, 7)?,
        kind,
        config: serde_json::from_str(&config).map_err(|e| conversion_error(12, Type::Text, e))?,
        config_digest: row.get(13)?,
        delivered_digest: row.get(14)?,
        last_check_in: opt_ts_col(row, 15)?,
        created_at: ts_col(row, 16)?,
        updated_at: ts_col(row, 17)?,
    })
}

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let entity_type: String = row.get(3)?;
    let device_id: Uuid = parsed_col(row, 4)?;
    let owner = match entity_type.as_str() {
        "node" => ApiKeyOwner::Node(device_id),
        "lighthouse" => ApiKeyOwner::Lighthouse(device_id),
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                format!("unknown api key entity type: {}", other).into(),
            ))
        }
    };
    Ok(ApiKey {
        id: parsed_col(row, 0)?,
        name: row.get(1)?,
        key_hash: row.get(2)?,
        owner,
        is_active: row.get(5)?,
        expires_at: opt_ts_col(row, 6)?,
        last_used: opt_ts_col(row, 7)?,
        created_at: ts_col(row, 8)?,
    })
}
