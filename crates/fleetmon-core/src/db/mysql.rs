//! sqlx-backed MySQL client.

use std::time::Duration;

use sqlx::Row;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::debug;

use super::{DbConnector, DbError, DbPool};
use crate::model::{Instance, ProcessRow};

/// Operations visible in the process list, excluding system schemas and
/// maintenance accounts. Longest-running first so truncated reads still see
/// the interesting rows.
const PROCESS_LIST_SQL: &str = "SELECT `ID`, `DB`, `USER`, `HOST`, `TIME`, `INFO` \
     FROM `information_schema`.`PROCESSLIST` \
     WHERE info IS NOT NULL \
       AND DB NOT IN ('information_schema', 'mysql', 'performance_schema') \
       AND USER NOT IN ('monitor', 'rdsadmin', 'system user') \
     ORDER BY `TIME` DESC";

/// Connector configured once for the whole fleet.
#[derive(Clone)]
pub struct MySqlConnector {
    pool_size: u32,
    query_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(pool_size: u32, query_timeout: Duration) -> Self {
        Self {
            pool_size,
            query_timeout,
        }
    }
}

impl DbConnector for MySqlConnector {
    type Pool = MySqlPoolHandle;

    async fn connect(&self, instance: &Instance, password: &str) -> Result<Self::Pool, DbError> {
        let mut options = MySqlConnectOptions::new()
            .host(&instance.host)
            .port(instance.port)
            .username(&instance.user)
            .password(password);
        if !instance.db.is_empty() {
            options = options.database(&instance.db);
        }

        // connect_with establishes one connection up front, so a bad
        // credential or unreachable host fails here, not on first poll.
        let pool = MySqlPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(self.query_timeout)
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        debug!(instance = %instance.name, host = %instance.host, "pool created");
        Ok(MySqlPoolHandle {
            pool,
            query_timeout: self.query_timeout,
        })
    }
}

/// One instance's pool plus the per-query timeout bound.
pub struct MySqlPoolHandle {
    pool: MySqlPool,
    query_timeout: Duration,
}

impl MySqlPoolHandle {
    async fn fetch_all(&self, sql: &str) -> Result<Vec<sqlx::mysql::MySqlRow>, DbError> {
        tokio::time::timeout(self.query_timeout, sqlx::query(sql).fetch_all(&self.pool))
            .await
            .map_err(|_| DbError::Timeout)?
            .map_err(|e| DbError::Query(e.to_string()))
    }
}

impl DbPool for MySqlPoolHandle {
    async fn process_list(&self) -> Result<Vec<ProcessRow>, DbError> {
        let rows = self.fetch_all(PROCESS_LIST_SQL).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let pid: u64 = row
                .try_get("ID")
                .map_err(|e| DbError::Query(e.to_string()))?;
            let db: Option<String> = row
                .try_get("DB")
                .map_err(|e| DbError::Query(e.to_string()))?;
            let user: String = row
                .try_get("USER")
                .map_err(|e| DbError::Query(e.to_string()))?;
            let host: String = row
                .try_get("HOST")
                .map_err(|e| DbError::Query(e.to_string()))?;
            let time_secs: i64 = row
                .try_get("TIME")
                .map_err(|e| DbError::Query(e.to_string()))?;
            let statement: Option<String> = row
                .try_get("INFO")
                .map_err(|e| DbError::Query(e.to_string()))?;
            out.push(ProcessRow {
                pid: pid as i64,
                db,
                user,
                host,
                time_secs,
                statement: statement.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn global_status(&self, like: &str) -> Result<Vec<(String, String)>, DbError> {
        // Patterns are internal constants; SHOW does not take placeholders.
        let sql = format!("SHOW GLOBAL STATUS LIKE '{}'", like);
        let rows = self.fetch_all(&sql).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("Variable_name")
                .map_err(|e| DbError::Query(e.to_string()))?;
            let value: String = row
                .try_get("Value")
                .map_err(|e| DbError::Query(e.to_string()))?;
            out.push((name, value));
        }
        Ok(out)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
