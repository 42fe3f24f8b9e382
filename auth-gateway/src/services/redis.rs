use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::time::Duration;

/// TTL-capable key-value store behind the session store.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64)
        -> Result<(), anyhow::Error>;
    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, anyhow::Error>;
    /// All keys starting with `prefix`.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisSessionBackend {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisSessionBackend {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects on its own after transient failures.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Connected to Redis session backend");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl SessionBackend for RedisSessionBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read session: {}", e))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write session: {}", e))
    }

    async fn delete(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete session: {}", e))?;
        Ok(removed > 0)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to scan sessions: {}", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-memory backend with per-entry deadlines. Expired entries are dropped
/// lazily on access and during scans.
#[derive(Default)]
pub struct MemorySessionBackend {
    entries: DashMap<String, (String, DateTime<Utc>)>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move an entry's deadline to `now`, as if its TTL had elapsed.
    pub fn expire_now(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.1 = Utc::now();
        }
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let now = Utc::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => None,
            None => return Ok(None),
        };
        self.entries.remove_if(key, |_, (_, deadline)| *deadline <= now);
        Ok(value)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let ttl = chrono::Duration::from_std(Duration::from_secs(ttl_seconds.max(1)))?;
        self.entries
            .insert(key.to_string(), (value.to_string(), Utc::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, anyhow::Error> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        let now = Utc::now();
        self.entries.retain(|_, (_, deadline)| *deadline > now);
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_honours_deadline() {
        let backend = MemorySessionBackend::new();
        backend.set_with_ttl("session:a", "{}", 60).await.unwrap();
        assert_eq!(backend.get("session:a").await.unwrap().as_deref(), Some("{}"));

        backend.expire_now("session:a");
        assert!(backend.get("session:a").await.unwrap().is_none());
        assert!(backend.entries.is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_scan_filters_prefix() {
        let backend = MemorySessionBackend::new();
        backend.set_with_ttl("session:a", "1", 60).await.unwrap();
        backend.set_with_ttl("other:b", "2", 60).await.unwrap();
        let keys = backend.scan_keys("session:").await.unwrap();
        assert_eq!(keys, vec!["session:a".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_backend_delete_reports_existence() {
        let backend = MemorySessionBackend::new();
        backend.set_with_ttl("session:a", "1", 60).await.unwrap();
        assert!(backend.delete("session:a").await.unwrap());
        assert!(!backend.delete("session:a").await.unwrap());
    }
}
