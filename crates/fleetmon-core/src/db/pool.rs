//! Per-instance pool lifecycle management.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{DbConnector, DbError, DbPool};
use crate::crypto::{CryptoError, SecretCipher};
use crate::model::Instance;

/// Error type for pool creation.
#[derive(Debug)]
pub enum PoolError {
    /// The credential blob could not be decrypted.
    Decrypt(CryptoError),
    /// The instance refused the connection.
    Connect(DbError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Decrypt(e) => write!(f, "credential error: {}", e),
            PoolError::Connect(e) => write!(f, "connect error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

/// Owns one pool per live instance.
///
/// Creation and teardown strictly follow registry membership, and all calls
/// come from the fleet manager's single dispatcher task, so no locking is
/// needed. A creation failure is instance-local: the error is returned and
/// no state is kept for that instance.
pub struct PoolManager<C: DbConnector> {
    connector: C,
    cipher: Arc<dyn SecretCipher>,
    pools: HashMap<String, Arc<C::Pool>>,
}

impl<C: DbConnector> PoolManager<C> {
    pub fn new(connector: C, cipher: Arc<dyn SecretCipher>) -> Self {
        Self {
            connector,
            cipher,
            pools: HashMap::new(),
        }
    }

    /// Creates the pool for `instance`, decrypting its credential
    /// immediately before use. Idempotent: an existing pool is returned
    /// as-is.
    pub async fn create_pool(&mut self, instance: &Instance) -> Result<Arc<C::Pool>, PoolError> {
        if let Some(existing) = self.pools.get(&instance.name) {
            return Ok(existing.clone());
        }

        let password = self
            .cipher
            .decrypt(&instance.password)
            .map_err(PoolError::Decrypt)?;
        let pool = self
            .connector
            .connect(instance, &password)
            .await
            .map_err(PoolError::Connect)?;

        let pool = Arc::new(pool);
        self.pools.insert(instance.name.clone(), pool.clone());
        info!(instance = %instance.name, "connection pool created");
        Ok(pool)
    }

    /// Closes and forgets the pool. Safe to call only after the instance's
    /// collector tasks have completed; a second call is a no-op.
    pub async fn close_pool(&mut self, name: &str) {
        if let Some(pool) = self.pools.remove(name) {
            pool.close().await;
            info!(instance = %name, "connection pool closed");
        }
    }

    /// Closes every pool; used at shutdown.
    pub async fn close_all(&mut self) {
        for (name, pool) in self.pools.drain() {
            pool.close().await;
            info!(instance = %name, "connection pool closed");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlainCipher;
    use crate::db::mock::MockConnector;

    fn instance(name: &str) -> Instance {
        Instance {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: 3306,
            user: "monitorer".to_string(),
            password: "pw-blob".to_string(),
            db: String::new(),
            account: String::new(),
        }
    }

    #[tokio::test]
    async fn create_pool_is_idempotent() {
        let connector = MockConnector::new();
        let mut manager = PoolManager::new(connector.clone(), Arc::new(PlainCipher));

        let a = manager.create_pool(&instance("db-a")).await.unwrap();
        let b = manager.create_pool(&instance("db-a")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connections().len(), 1);
    }

    #[tokio::test]
    async fn password_is_decrypted_before_connect() {
        let connector = MockConnector::new();
        let mut manager = PoolManager::new(connector.clone(), Arc::new(PlainCipher));
        manager.create_pool(&instance("db-a")).await.unwrap();
        assert_eq!(
            connector.connections(),
            vec![("db-a".to_string(), "pw-blob".to_string())]
        );
    }

    #[tokio::test]
    async fn connect_failure_keeps_no_state() {
        let connector = MockConnector::new();
        connector.fail_connect("db-a");
        let mut manager = PoolManager::new(connector.clone(), Arc::new(PlainCipher));

        assert!(manager.create_pool(&instance("db-a")).await.is_err());
        assert!(!manager.contains("db-a"));
    }

    #[tokio::test]
    async fn close_pool_is_idempotent() {
        let connector = MockConnector::new();
        let mut manager = PoolManager::new(connector.clone(), Arc::new(PlainCipher));
        manager.create_pool(&instance("db-a")).await.unwrap();

        manager.close_pool("db-a").await;
        manager.close_pool("db-a").await;

        let pool = connector.pool("db-a").unwrap();
        assert_eq!(pool.close_count(), 1);
        assert!(!manager.contains("db-a"));
    }
}
