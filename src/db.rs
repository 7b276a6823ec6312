//! SQLite database holding the routing facts
//!
//! Orgs own sites and resources, resources route to targets. The CRUD
//! surface that edits these tables lives elsewhere; this module only
//! creates the schema, offers insert helpers for seeding, and exposes the
//! joined read the config synthesizer polls.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Failure reading routing state
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("routing state unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the persistence boundary
///
/// Implementations return every enabled target joined with its resource,
/// org and site. Joined entities may be missing; callers skip such rows.
pub trait RoutingSource: Send + Sync {
    fn load_targets(&self) -> Result<Vec<TargetRow>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgRecord {
    pub org_id: String,
    pub name: String,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub site_id: i64,
    pub org_id: String,
    pub name: String,
    /// "newt" for tunnel sites, "wireguard" for direct WireGuard peers
    pub site_type: String,
    /// Tunnel sites only, CIDR notation
    pub subnet: Option<String>,
    pub pub_key: Option<String>,
    pub endpoint: Option<String>,
    pub listen_port: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: i64,
    pub site_id: i64,
    pub org_id: String,
    pub name: String,
    pub subdomain: Option<String>,
    pub ssl: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub target_id: i64,
    pub resource_id: i64,
    pub ip: String,
    /// URL scheme used to reach the target
    pub method: String,
    /// Stored as written; range-checked when routes are derived
    pub port: i64,
    /// Platform-allocated port on the tunnel gateway
    pub internal_port: Option<i64>,
    pub protocol: Option<String>,
    pub enabled: bool,
}

/// One target with whatever the join found for it
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub target: TargetRecord,
    pub resource: Option<ResourceRecord>,
    pub org: Option<OrgRecord>,
    pub site: Option<SiteRecord>,
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets pollers read while writers commit
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SourceError> {
        self.conn
            .lock()
            .map_err(|_| SourceError::Unavailable("database lock poisoned".to_string()))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: orgs, sites, resources, targets
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: routing schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS orgs (
                org_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                domain TEXT
            );

            CREATE TABLE IF NOT EXISTS sites (
                site_id INTEGER PRIMARY KEY,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'newt',
                subnet TEXT,
                pub_key TEXT,
                endpoint TEXT,
                listen_port INTEGER,
                FOREIGN KEY (org_id) REFERENCES orgs(org_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS resources (
                resource_id INTEGER PRIMARY KEY,
                site_id INTEGER NOT NULL,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                subdomain TEXT,
                ssl INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (site_id) REFERENCES sites(site_id) ON DELETE CASCADE,
                FOREIGN KEY (org_id) REFERENCES orgs(org_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS targets (
                target_id INTEGER PRIMARY KEY,
                resource_id INTEGER NOT NULL,
                ip TEXT NOT NULL,
                method TEXT NOT NULL DEFAULT 'http',
                port INTEGER NOT NULL,
                internal_port INTEGER,
                protocol TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (resource_id) REFERENCES resources(resource_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_targets_resource ON targets(resource_id);
            CREATE INDEX IF NOT EXISTS idx_resources_site ON resources(site_id);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    // ==================== Seeding ====================

    pub fn create_org(&self, org: &OrgRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO orgs (org_id, name, domain) VALUES (?1, ?2, ?3)",
            params![org.org_id, org.name, org.domain],
        )?;
        Ok(())
    }

    pub fn create_site(&self, site: &SiteRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sites (site_id, org_id, name, type, subnet, pub_key, endpoint, listen_port)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                site.site_id,
                site.org_id,
                site.name,
                site.site_type,
                site.subnet,
                site.pub_key,
                site.endpoint,
                site.listen_port
            ],
        )?;
        Ok(())
    }

    pub fn create_resource(&self, resource: &ResourceRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO resources (resource_id, site_id, org_id, name, subdomain, ssl, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                resource.resource_id,
                resource.site_id,
                resource.org_id,
                resource.name,
                resource.subdomain,
                resource.ssl,
                resource.enabled
            ],
        )?;
        Ok(())
    }

    pub fn create_target(&self, target: &TargetRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (target_id, resource_id, ip, method, port, internal_port, protocol, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                target.target_id,
                target.resource_id,
                target.ip,
                target.method,
                target.port,
                target.internal_port,
                target.protocol,
                target.enabled
            ],
        )?;
        Ok(())
    }

    /// Enable or disable a target, returns false if it does not exist
    pub fn set_target_enabled(&self, target_id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE targets SET enabled = ?1 WHERE target_id = ?2",
            params![enabled, target_id],
        )?;
        Ok(affected > 0)
    }

    // ==================== Routing snapshot ====================

    /// Every enabled target whose resource has a subdomain and whose org has a domain
    pub fn routable_targets(&self) -> Result<Vec<TargetRow>, SourceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.target_id, t.resource_id, t.ip, t.method, t.port, t.internal_port, t.protocol, t.enabled,
                    r.resource_id, r.site_id, r.org_id, r.name, r.subdomain, r.ssl, r.enabled,
                    o.org_id, o.name, o.domain,
                    s.site_id, s.org_id, s.name, s.type, s.subnet, s.pub_key, s.endpoint, s.listen_port
             FROM targets t
             LEFT JOIN resources r ON r.resource_id = t.resource_id
             LEFT JOIN orgs o ON o.org_id = r.org_id
             LEFT JOIN sites s ON s.site_id = r.site_id
             WHERE t.enabled = 1
               AND r.subdomain IS NOT NULL
               AND o.domain IS NOT NULL
             ORDER BY t.target_id",
        )?;

        let rows = stmt
            .query_map([], target_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

impl RoutingSource for Database {
    fn load_targets(&self) -> Result<Vec<TargetRow>, SourceError> {
        self.routable_targets()
    }
}

fn target_row(row: &Row<'_>) -> rusqlite::Result<TargetRow> {
    let target = TargetRecord {
        target_id: row.get(0)?,
        resource_id: row.get(1)?,
        ip: row.get(2)?,
        method: row.get(3)?,
        port: row.get(4)?,
        internal_port: row.get(5)?,
        protocol: row.get(6)?,
        enabled: row.get(7)?,
    };

    let resource = match row.get::<_, Option<i64>>(8)? {
        Some(resource_id) => Some(ResourceRecord {
            resource_id,
            site_id: row.get(9)?,
            org_id: row.get(10)?,
            name: row.get(11)?,
            subdomain: row.get(12)?,
            ssl: row.get(13)?,
            enabled: row.get(14)?,
        }),
        None => None,
    };

    let org = match row.get::<_, Option<String>>(15)? {
        Some(org_id) => Some(OrgRecord {
            org_id,
            name: row.get(16)?,
            domain: row.get(17)?,
        }),
        None => None,
    };

    let site = match row.get::<_, Option<i64>>(18)? {
        Some(site_id) => Some(SiteRecord {
            site_id,
            org_id: row.get(19)?,
            name: row.get(20)?,
            site_type: row.get(21)?,
            subnet: row.get(22)?,
            pub_key: row.get(23)?,
            endpoint: row.get(24)?,
            listen_port: row.get(25)?,
        }),
        None => None,
    };

    Ok(TargetRow {
        target,
        resource,
        org,
        site,
    })
}
