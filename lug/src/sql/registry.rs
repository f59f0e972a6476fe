//! Shared connection registry
//!
//! Shared opens are keyed by `(driver, dsn)` under a dedicated lock. A hit
//! bumps the reference count and reuses the existing pool; closing
//! decrements and removes the entry (closing the pool) at zero.

use std::collections::HashMap;
use std::sync::{Mutex, Once};

use once_cell::sync::Lazy;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::error::{Error, ErrorKind, Result};
use crate::sql::builder::Driver;

/// Registry key for a shared pool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub driver: Driver,
    pub dsn: String,
}

struct Entry {
    pool: AnyPool,
    refcount: usize,
}

static REGISTRY: Lazy<Mutex<HashMap<RegistryKey, Entry>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static DRIVERS: Once = Once::new();

fn lock_registry() -> std::sync::MutexGuard<'static, HashMap<RegistryKey, Entry>> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Expand a DSN into a pool URL for the driver
pub fn normalize_dsn(driver: Driver, dsn: &str) -> String {
    if dsn.contains("://") {
        return dsn.to_string();
    }
    match driver {
        Driver::Sqlite => {
            if dsn == ":memory:" {
                "sqlite::memory:".to_string()
            } else {
                format!("sqlite://{dsn}?mode=rwc")
            }
        }
        Driver::Postgres | Driver::Mysql => format!("{}://{dsn}", driver.scheme()),
    }
}

/// Open a private (unshared) pool
pub async fn connect(driver: Driver, dsn: &str, max_open: u32, max_idle: u32) -> Result<AnyPool> {
    DRIVERS.call_once(sqlx::any::install_default_drivers);
    let url = normalize_dsn(driver, dsn);
    let pool = AnyPoolOptions::new()
        .max_connections(max_open.max(1))
        .min_connections(max_idle.min(max_open))
        .connect(&url)
        .await?;
    Ok(pool)
}

/// Open or reuse a shared pool for `(driver, dsn)`
pub async fn open_shared(key: RegistryKey, max_open: u32, max_idle: u32) -> Result<AnyPool> {
    {
        let mut registry = lock_registry();
        if let Some(entry) = registry.get_mut(&key) {
            entry.refcount += 1;
            tracing::debug!(dsn = %key.dsn, refcount = entry.refcount, "reusing shared pool");
            return Ok(entry.pool.clone());
        }
    }

    // connect outside the lock; a racing opener may beat us, in which case
    // the freshly built pool is dropped in favour of the registered one
    let pool = connect(key.driver, &key.dsn, max_open, max_idle).await?;
    let mut registry = lock_registry();
    if let Some(entry) = registry.get_mut(&key) {
        entry.refcount += 1;
        return Ok(entry.pool.clone());
    }
    registry.insert(key, Entry { pool: pool.clone(), refcount: 1 });
    Ok(pool)
}

/// Decrement a shared entry; returns `true` when the entry was removed
pub fn release_shared(key: &RegistryKey) -> Result<bool> {
    let pool = {
        let mut registry = lock_registry();
        let Some(entry) = registry.get_mut(key) else {
            return Err(Error::new(
                ErrorKind::ArgumentError,
                format!("shared connection {:?} is not open", key.dsn),
            ));
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(false);
        }
        registry.remove(key).map(|entry| entry.pool)
    };
    if let Some(pool) = pool {
        // close in the background; callers only need the registry slot gone
        tokio::spawn(async move { pool.close().await });
    }
    Ok(true)
}

/// Current reference count for a shared entry (0 when absent)
pub fn shared_refcount(key: &RegistryKey) -> usize {
    lock_registry().get(key).map(|entry| entry.refcount).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_dsn() {
        assert_eq!(normalize_dsn(Driver::Sqlite, ":memory:"), "sqlite::memory:");
        assert_eq!(normalize_dsn(Driver::Sqlite, "data.db"), "sqlite://data.db?mode=rwc");
        assert_eq!(
            normalize_dsn(Driver::Postgres, "user@localhost/db"),
            "postgres://user@localhost/db"
        );
        assert_eq!(
            normalize_dsn(Driver::Mysql, "mysql://h/db"),
            "mysql://h/db"
        );
    }

    #[tokio::test]
    async fn test_shared_refcounting() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = dir.path().join("shared.db").to_string_lossy().into_owned();
        let key = RegistryKey { driver: Driver::Sqlite, dsn };

        let first = open_shared(key.clone(), 4, 1).await.unwrap();
        assert_eq!(shared_refcount(&key), 1);
        let second = open_shared(key.clone(), 4, 1).await.unwrap();
        assert_eq!(shared_refcount(&key), 2);
        assert_eq!(first.size(), second.size());

        // one close leaves the other functional
        assert!(!release_shared(&key).unwrap());
        assert_eq!(shared_refcount(&key), 1);
        sqlx::query("SELECT 1").execute(&second).await.unwrap();

        // final close removes the entry
        assert!(release_shared(&key).unwrap());
        assert_eq!(shared_refcount(&key), 0);
        assert!(release_shared(&key).is_err());
    }
}
