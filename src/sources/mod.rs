/// Source registry
///
/// The set of upstream data hosts (PDSs) known to the relay, their status,
/// flags raised against them, and the last upstream cursor consumed. Rows
/// are never deleted; banning only changes status. An in-memory snapshot
/// serves the hot path and is written through to the `pds` table.

use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Lifecycle status of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
    Banned,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Inactive => "inactive",
            SourceStatus::Banned => "banned",
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SourceStatus::Active),
            "inactive" => Ok(SourceStatus::Inactive),
            "banned" => Ok(SourceStatus::Banned),
            other => Err(RelayError::Validation(format!("unknown source status {}", other))),
        }
    }
}

/// An upstream data host
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: i64,
    pub host: String,
    pub ssl: bool,
    pub status: SourceStatus,
    pub cursor: i64,
    pub flag_count: i64,
    pub last_flag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn is_active(&self) -> bool {
        self.status == SourceStatus::Active
    }

    /// Base URL for XRPC requests to this source
    pub fn http_base(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }

    /// Upstream event subscription URL, resuming after `cursor` when non-zero
    pub fn subscribe_url(&self, cursor: i64) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        let mut url = format!(
            "{}://{}/xrpc/com.atproto.sync.subscribeRepos",
            scheme, self.host
        );
        if cursor > 0 {
            url.push_str(&format!("?cursor={}", cursor));
        }
        url
    }
}

/// Normalize a user- or document-supplied host
///
/// Lowercases and strips scheme, path, and trailing dots.
pub fn normalize_host(input: &str) -> RelayResult<String> {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let host = without_scheme
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_lowercase();

    if host.is_empty()
        || host.contains(char::is_whitespace)
        || host.contains('@')
        || host.starts_with('.')
        || host.starts_with(':')
    {
        return Err(RelayError::Validation(format!("invalid hostname: {}", input)));
    }
    Ok(host)
}

/// Host portion without the port
fn bare_host(host: &str) -> &str {
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(h, _)| h)
        .unwrap_or(host)
}

/// Registry of known sources and banned domains
pub struct SourceRegistry {
    db: SqlitePool,
    default_ssl: bool,
    sources: RwLock<HashMap<String, Source>>,
    domain_bans: RwLock<Vec<String>>,
}

impl SourceRegistry {
    /// Load every source and domain ban from the database
    pub async fn load(db: SqlitePool, default_ssl: bool) -> RelayResult<Self> {
        let rows = sqlx::query(
            r#"
            SELECT id, host, ssl, status, cursor, flag_count, last_flag, created_at, updated_at
            FROM pds
            "#,
        )
        .fetch_all(&db)
        .await?;

        let mut sources = HashMap::with_capacity(rows.len());
        for row in rows {
            let source = row_to_source(&row)?;
            sources.insert(source.host.clone(), source);
        }

        let bans: Vec<String> = sqlx::query("SELECT domain FROM domain_ban")
            .fetch_all(&db)
            .await?
            .iter()
            .map(|r| r.try_get::<String, _>("domain"))
            .collect::<Result<_, _>>()?;

        info!(
            "Loaded {} sources and {} domain bans",
            sources.len(),
            bans.len()
        );

        Ok(Self {
            db,
            default_ssl,
            sources: RwLock::new(sources),
            domain_bans: RwLock::new(bans),
        })
    }

    pub fn get(&self, host: &str) -> Option<Source> {
        self.sources.read().get(host).cloned()
    }

    /// All sources ordered by host
    pub fn list(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.sources.read().values().cloned().collect();
        sources.sort_by(|a, b| a.host.cmp(&b.host));
        sources
    }

    pub fn active(&self) -> Vec<Source> {
        self.list().into_iter().filter(Source::is_active).collect()
    }

    pub fn domain_bans(&self) -> Vec<String> {
        self.domain_bans.read().clone()
    }

    /// Whether the host or any domain it sits under is banned
    pub fn is_banned(&self, host: &str) -> bool {
        if let Some(source) = self.sources.read().get(host) {
            if source.status == SourceStatus::Banned {
                return true;
            }
        }
        let bare = bare_host(host);
        self.domain_bans
            .read()
            .iter()
            .any(|domain| bare == domain || bare.ends_with(&format!(".{}", domain)))
    }

    /// Fetch a source, registering it on first sight
    pub async fn get_or_create(&self, host: &str) -> RelayResult<Source> {
        let host = normalize_host(host)?;
        if self.is_banned(&host) {
            return Err(RelayError::Banned(host));
        }
        if let Some(source) = self.get(&host) {
            return Ok(source);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO pds (host, ssl, status, cursor, flag_count, created_at, updated_at)
            VALUES (?1, ?2, 'active', 0, 0, ?3, ?3)
            ON CONFLICT(host) DO NOTHING
            "#,
        )
        .bind(&host)
        .bind(self.default_ssl)
        .bind(&now)
        .execute(&self.db)
        .await?;

        let source = self.reload(&host).await?;
        info!("Registered new source {}", host);
        Ok(source)
    }

    /// Change a source's status
    pub async fn set_status(&self, host: &str, status: SourceStatus) -> RelayResult<Source> {
        let host = normalize_host(host)?;
        let result = sqlx::query("UPDATE pds SET status = ?1, updated_at = ?2 WHERE host = ?3")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(&host)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("source {}", host)));
        }

        info!("Source {} is now {}", host, status);
        self.reload(&host).await
    }

    /// Record invalid content from a source for operator review
    pub async fn flag(&self, host: &str, reason: &str) -> RelayResult<()> {
        sqlx::query(
            r#"
            UPDATE pds
            SET flag_count = flag_count + 1, last_flag = ?1, updated_at = ?2
            WHERE host = ?3
            "#,
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(host)
        .execute(&self.db)
        .await?;

        warn!("Flagged source {}: {}", host, reason);
        if let Some(source) = self.sources.write().get_mut(host) {
            source.flag_count += 1;
            source.last_flag = Some(reason.to_string());
        }
        Ok(())
    }

    /// Persist the last upstream sequence consumed from a source
    pub async fn update_cursor(&self, host: &str, cursor: i64) -> RelayResult<()> {
        sqlx::query("UPDATE pds SET cursor = ?1, updated_at = ?2 WHERE host = ?3")
            .bind(cursor)
            .bind(Utc::now().to_rfc3339())
            .bind(host)
            .execute(&self.db)
            .await?;

        if let Some(source) = self.sources.write().get_mut(host) {
            source.cursor = cursor;
        }
        Ok(())
    }

    /// Ban a domain and everything under it
    pub async fn ban_domain(&self, domain: &str) -> RelayResult<()> {
        let domain = normalize_host(domain)?;
        sqlx::query(
            "INSERT INTO domain_ban (domain, created_at) VALUES (?1, ?2) ON CONFLICT(domain) DO NOTHING",
        )
        .bind(&domain)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        let mut bans = self.domain_bans.write();
        if !bans.contains(&domain) {
            bans.push(domain.clone());
        }
        info!("Banned domain {}", domain);
        Ok(())
    }

    pub async fn unban_domain(&self, domain: &str) -> RelayResult<()> {
        let domain = normalize_host(domain)?;
        let result = sqlx::query("DELETE FROM domain_ban WHERE domain = ?1")
            .bind(&domain)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("domain ban {}", domain)));
        }
        self.domain_bans.write().retain(|d| d != &domain);
        info!("Unbanned domain {}", domain);
        Ok(())
    }

    async fn reload(&self, host: &str) -> RelayResult<Source> {
        let row = sqlx::query(
            r#"
            SELECT id, host, ssl, status, cursor, flag_count, last_flag, created_at, updated_at
            FROM pds
            WHERE host = ?1
            "#,
        )
        .bind(host)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("source {}", host)))?;

        let source = row_to_source(&row)?;
        self.sources
            .write()
            .insert(source.host.clone(), source.clone());
        Ok(source)
    }
}

fn row_to_source(row: &sqlx::sqlite::SqliteRow) -> RelayResult<Source> {
    let status: String = row.try_get("status")?;
    Ok(Source {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        ssl: row.try_get::<i64, _>("ssl")? != 0,
        status: status.parse()?,
        cursor: row.try_get("cursor")?,
        flag_count: row.try_get("flag_count")?,
        last_flag: row.try_get("last_flag")?,
        created_at: parse_time(row.try_get("created_at")?)?,
        updated_at: parse_time(row.try_get("updated_at")?)?,
    })
}

fn parse_time(value: String) -> RelayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RelayError::Internal(format!("Invalid timestamp: {}", e)))
}
