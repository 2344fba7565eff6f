//! MySQL allocation table
//!
//! Schema (one table per partition):
//!
//! ```sql
//! CREATE TABLE ip_pool (
//!   ip         INT UNSIGNED NOT NULL PRIMARY KEY,
//!   `key`      VARCHAR(255) NOT NULL DEFAULT '',
//!   subnet     VARCHAR(255) NOT NULL DEFAULT '',
//!   attr       VARCHAR(1000) NOT NULL DEFAULT '',
//!   policy     SMALLINT UNSIGNED NOT NULL DEFAULT 0,
//!   updated_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
//!   INDEX idx_key (`key`)
//! )
//! ```
//!
//! `key` is a reserved word and is always quoted. Key matching uses `SUBSTRING` and
//! `LOCATE` rather than `LIKE` because `_` is a `LIKE` wildcard and every key contains it.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{ConnectOptions, Connection, FromRow, MySql, MySqlPool, QueryBuilder};
use tracing::{debug, info};

use crate::error::{FloatingIpError, Result};
use crate::nets::{int_to_ip, ip_to_int};
use crate::policy::ReleasePolicy;
use crate::record::{Attr, FloatingIpRecord};
use crate::store::AllocationBackend;

/// SQLSTATE reported by MySQL for a missing table (error 1146)
const TABLE_MISSING_SQLSTATE: &str = "42S02";

const COLUMNS: &str = "ip, `key`, subnet, attr, policy, updated_at";

/// Database connection settings (`schedule_plugin.database` in the config file)
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Transport, only `tcp` is supported
    #[serde(default)]
    pub protocol: String,
    /// `host:port`
    pub addr: String,
    /// User name
    #[serde(default)]
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Database name
    pub name: String,
    /// Pool size, 0 uses the driver default
    #[serde(default)]
    pub max_conn: u32,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("protocol", &self.protocol)
            .field("addr", &self.addr)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("max_conn", &self.max_conn)
            .finish()
    }
}

impl DatabaseConfig {
    fn options(&self, database: &str) -> Result<MySqlConnectOptions> {
        let (host, port) = match self.addr.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_err| FloatingIpError::MalformedInput(format!("invalid database addr {}", self.addr)))?,
            ),
            None => (self.addr.as_str(), 3306),
        };
        Ok(MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(&self.username)
            .password(&self.password)
            .database(database)
            .charset("utf8mb4")
            .disable_statement_logging())
    }

    /// Create the database if needed and open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns a database error if the server is unreachable or rejects the credentials.
    pub async fn connect(&self) -> Result<MySqlPool> {
        info!("Connecting to database {} at {}", self.name, self.addr);
        let mut admin = self.options("mysql")?.connect().await?;
        let create = format!(
            "CREATE DATABASE IF NOT EXISTS `{}` DEFAULT CHARACTER SET utf8mb4",
            self.name.replace('`', "")
        );
        sqlx::query(&create).execute(&mut admin).await?;
        admin.close().await?;

        let mut pool = MySqlPoolOptions::new().acquire_timeout(Duration::from_secs(10));
        if self.max_conn > 0 {
            pool = pool.max_connections(self.max_conn);
        }
        Ok(pool.connect_with(self.options(&self.name)?).await?)
    }
}

#[derive(Debug, FromRow)]
struct DbFloatingIp {
    ip: u32,
    key: String,
    subnet: String,
    attr: String,
    policy: u16,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbFloatingIp> for FloatingIpRecord {
    type Error = FloatingIpError;

    fn try_from(row: DbFloatingIp) -> Result<Self> {
        Ok(Self {
            ip: int_to_ip(row.ip),
            key: row.key,
            policy: ReleasePolicy::try_from(row.policy)?,
            attr: Attr::decode(&row.attr)?,
            subnet: row.subnet,
            updated_at: row.updated_at,
        })
    }
}

fn into_records(rows: Vec<DbFloatingIp>) -> Result<Vec<FloatingIpRecord>> {
    rows.into_iter().map(FloatingIpRecord::try_from).collect()
}

/// One allocation table in MySQL
#[derive(Debug, Clone)]
pub struct MySqlBackend {
    pool: MySqlPool,
    table: String,
}

impl MySqlBackend {
    /// Backend over `table` using an open pool
    #[must_use]
    pub fn new(pool: MySqlPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
        }
    }

    fn map_err(&self, err: sqlx::Error) -> FloatingIpError {
        let missing = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == TABLE_MISSING_SQLSTATE);
        if missing {
            FloatingIpError::TableMissing(self.table.clone())
        } else {
            FloatingIpError::Database(err)
        }
    }

    async fn select(&self, filter: &str, args: &[&str]) -> Result<Vec<FloatingIpRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE {filter}", self.table);
        let mut query = sqlx::query_as::<_, DbFloatingIp>(&sql);
        for arg in args {
            query = query.bind(*arg);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;
        into_records(rows)
    }
}

#[async_trait::async_trait]
impl AllocationBackend for MySqlBackend {
    fn name(&self) -> &str {
        &self.table
    }

    async fn ensure_schema(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             ip INT UNSIGNED NOT NULL PRIMARY KEY, \
             `key` VARCHAR(255) NOT NULL DEFAULT '', \
             subnet VARCHAR(255) NOT NULL DEFAULT '', \
             attr VARCHAR(1000) NOT NULL DEFAULT '', \
             policy SMALLINT UNSIGNED NOT NULL DEFAULT 0, \
             updated_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6), \
             INDEX idx_key (`key`))",
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;
        debug!("Ensured table {}", self.table);
        Ok(())
    }

    async fn insert_free(&self, rows: &[(Ipv4Addr, String)]) -> Result<u64> {
        let mut touched = 0;
        let now = Utc::now();
        // MySQL caps a statement at 65535 placeholders
        for chunk in rows.chunks(1000) {
            let mut qb: QueryBuilder<'_, MySql> =
                QueryBuilder::new(format!("INSERT INTO {} (ip, `key`, subnet, attr, policy, updated_at) ", self.table));
            qb.push_values(chunk, |mut b, (ip, subnet)| {
                b.push_bind(ip_to_int(*ip))
                    .push_bind("")
                    .push_bind(subnet.as_str())
                    .push_bind("")
                    .push_bind(0_u16)
                    .push_bind(now);
            });
            qb.push(" ON DUPLICATE KEY UPDATE subnet = VALUES(subnet)");
            let res = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| self.map_err(e))?;
            touched += res.rows_affected();
        }
        Ok(touched)
    }

    async fn lookup_by_ip_set(&self, ips: &[Ipv4Addr]) -> Result<Vec<FloatingIpRecord>> {
        if ips.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<'_, MySql> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM {} WHERE ip IN (", self.table));
        let mut sep = qb.separated(", ");
        for ip in ips {
            sep.push_bind(ip_to_int(*ip));
        }
        sep.push_unseparated(")");
        let rows = qb
            .build_query_as::<DbFloatingIp>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;
        into_records(rows)
    }

    async fn lookup_by_key(&self, key: &str) -> Result<Vec<FloatingIpRecord>> {
        self.select("`key` = ?", &[key]).await
    }

    async fn lookup_by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIpRecord>> {
        self.select("SUBSTRING(`key`, 1, CHAR_LENGTH(?)) = ?", &[prefix, prefix]).await
    }

    async fn lookup_by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIpRecord>> {
        self.select("LOCATE(?, `key`) > 0", &[keyword]).await
    }

    async fn find_free(&self, subnet: Option<&str>, limit: u32) -> Result<Vec<FloatingIpRecord>> {
        let rows = match subnet {
            Some(subnet) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM {} WHERE `key` = '' AND FIND_IN_SET(?, subnet) > 0 ORDER BY ip LIMIT ?",
                    self.table
                );
                sqlx::query_as::<_, DbFloatingIp>(&sql)
                    .bind(subnet)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("SELECT {COLUMNS} FROM {} WHERE `key` = '' ORDER BY ip LIMIT ?", self.table);
                sqlx::query_as::<_, DbFloatingIp>(&sql)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| self.map_err(e))?;
        into_records(rows)
    }

    async fn claim(&self, ip: Ipv4Addr, key: &str, policy: ReleasePolicy, attr: &Attr) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET `key` = ?, policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND `key` = ''",
            self.table
        );
        let res = sqlx::query(&sql)
            .bind(key)
            .bind(policy as u16)
            .bind(attr.encode()?)
            .bind(Utc::now())
            .bind(ip_to_int(ip))
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;
        if res.rows_affected() == 1 {
            return Ok(());
        }
        let exists = self.lookup_by_ip_set(&[ip]).await?;
        if exists.is_empty() {
            Err(FloatingIpError::NotFound(format!("ip {ip} in {}", self.table)))
        } else {
            Err(FloatingIpError::Conflict(format!("ip {ip} has been allocated by others")))
        }
    }

    async fn transfer(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: Option<&str>,
        policy: ReleasePolicy,
        attr: &Attr,
    ) -> Result<Ipv4Addr> {
        let mut tx = self.pool.begin().await?;
        let select = match subnet {
            Some(_) => format!(
                "SELECT ip FROM {} WHERE `key` = ? AND FIND_IN_SET(?, subnet) > 0 \
                 ORDER BY updated_at DESC LIMIT 1 FOR UPDATE",
                self.table
            ),
            None => format!(
                "SELECT ip FROM {} WHERE `key` = ? ORDER BY updated_at DESC LIMIT 1 FOR UPDATE",
                self.table
            ),
        };
        let mut query = sqlx::query_as::<_, (u32,)>(&select).bind(old_key);
        if let Some(subnet) = subnet {
            query = query.bind(subnet);
        }
        let Some((ip,)) = query.fetch_optional(&mut *tx).await.map_err(|e| self.map_err(e))? else {
            tx.rollback().await?;
            return Err(FloatingIpError::NotFound(format!(
                "no ip of key {old_key} in subnet {}",
                subnet.unwrap_or("*")
            )));
        };
        let update = format!(
            "UPDATE {} SET `key` = ?, policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND `key` = ?",
            self.table
        );
        sqlx::query(&update)
            .bind(new_key)
            .bind(policy as u16)
            .bind(attr.encode()?)
            .bind(Utc::now())
            .bind(ip)
            .bind(old_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.map_err(e))?;
        tx.commit().await?;
        Ok(int_to_ip(ip))
    }

    async fn update_attr(&self, ip: Ipv4Addr, key: &str, policy: ReleasePolicy, attr: &Attr) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND `key` = ?",
            self.table
        );
        let res = sqlx::query(&sql)
            .bind(policy as u16)
            .bind(attr.encode()?)
            .bind(Utc::now())
            .bind(ip_to_int(ip))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_err(e))?;
        if res.rows_affected() == 0 {
            return Err(FloatingIpError::NotFound(format!("ip {ip} with key {key}")));
        }
        Ok(())
    }

    async fn release(&self, records: &[FloatingIpRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE {} SET `key` = '', policy = 0, attr = '', updated_at = ? WHERE ip = ? AND `key` = ?",
            self.table
        );
        let current = format!("SELECT `key` FROM {} WHERE ip = ?", self.table);
        for record in records {
            let res = sqlx::query(&sql)
                .bind(Utc::now())
                .bind(ip_to_int(record.ip))
                .bind(&record.key)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.map_err(e))?;
            if res.rows_affected() == 1 {
                continue;
            }
            let actual = sqlx::query_as::<_, (String,)>(&current)
                .bind(ip_to_int(record.ip))
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| self.map_err(e))?;
            tx.rollback().await?;
            return Err(match actual {
                Some((actual,)) => FloatingIpError::StaleOwner {
                    ip: record.ip,
                    expected: record.key.clone(),
                    actual,
                },
                None => FloatingIpError::NotFound(format!("ip {} in {}", record.ip, self.table)),
            });
        }
        tx.commit().await?;
        Ok(())
    }
}
