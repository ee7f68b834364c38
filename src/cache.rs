use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Serialize;
use tracing::debug;

use crate::compiler::CompiledSchema;
use crate::error::{Result, ValidationError};

/// Compiled schema cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of compiled schemas held in memory
    pub max_schemas: u64,
    /// Time-to-live for a compiled schema in seconds
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_schemas: 100,
            ttl_seconds: 3600,
        }
    }
}

/// A compiled schema together with where and when it was loaded.
#[derive(Debug)]
pub struct CachedSchema {
    pub location: String,
    pub schema: Arc<CompiledSchema>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// In-memory cache of compiled schemas keyed by schema location.
///
/// Concurrent requests for a location that is not cached yet wait on a
/// single load; every waiter receives the same schema or the same error.
pub struct SchemaCache {
    cache: Cache<String, Arc<CachedSchema>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SchemaCache {
    pub fn new(config: CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_schemas)
            .time_to_live(Duration::from_secs(config.ttl_seconds))
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached schema for `location`, running `load` on a miss.
    pub async fn get_or_load<F, Fut>(&self, location: &str, load: F) -> Result<Arc<CachedSchema>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CompiledSchema>>,
    {
        if let Some(entry) = self.cache.get(location).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        let owned = location.to_string();
        let init = async move {
            let schema = load().await?;
            debug!(location = %owned, "compiled schema cached");
            Ok::<_, ValidationError>(Arc::new(CachedSchema {
                location: owned,
                schema: Arc::new(schema),
                loaded_at: Utc::now(),
            }))
        };

        // Losing a race to another loader still counts as a miss.
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.cache
            .try_get_with(location.to_string(), init)
            .await
            .map_err(ValidationError::Shared)
    }

    pub async fn get(&self, location: &str) -> Option<Arc<CachedSchema>> {
        self.cache.get(location).await
    }

    pub async fn invalidate(&self, location: &str) {
        self.cache.invalidate(location).await;
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::error::SchemaError;
    use crate::schema::SchematronDocument;
    use std::sync::atomic::AtomicUsize;

    fn empty_schema() -> Result<CompiledSchema> {
        Ok(compile(&SchematronDocument::default())?)
    }

    #[tokio::test]
    async fn test_load_once_then_hit() {
        let cache = SchemaCache::new(CacheConfig::default());
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_load("local:a.sch", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    empty_schema()
                })
                .await
                .unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_compile_once() {
        let cache = Arc::new(SchemaCache::new(CacheConfig::default()));
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                tokio::spawn(async move {
                    cache
                        .get_or_load("shared.sch", || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            empty_schema()
                        })
                        .await
                        .map(|entry| Arc::clone(&entry.schema))
                })
            })
            .collect();

        let schemas: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(schemas.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_not_cached() {
        let cache = SchemaCache::new(CacheConfig::default());
        let err = cache
            .get_or_load("bad.sch", || async {
                Err(SchemaError::UnknownPhase("x".into()).into())
            })
            .await
            .unwrap_err();
        assert!(err.is_schema_error());
        assert!(cache.get("bad.sch").await.is_none());

        let entry = cache.get_or_load("bad.sch", || async { empty_schema() }).await;
        assert!(entry.is_ok());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = SchemaCache::new(CacheConfig::default());
        cache.get_or_load("a", || async { empty_schema() }).await.unwrap();
        cache.clear().await;
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.stats().await.entries, 0);
    }
}
