//! 合约导入模块
//!
//! 为本地未知的地址拉取构建文件，按 (network, address) 缓存：
//! - 已缓存时直接返回，不发起远程调用
//! - 同一地址的并发导入只拉取一次
//! - 失败按重试策略重试，耗尽后返回 `ImportFailure`

mod retry;

pub use retry::{Backoff, RetryPolicy};

use crate::cache::{Cache, CacheKey};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::remote::RemoteSource;
use crate::types::{Address, BuildFile};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 构建文件的缓存键：`<network>/.contracts/<address>.json`
pub fn build_file_key(network: &str, address: Address) -> CacheKey {
    CacheKey::network(network, &format!(".contracts/{}.json", address.to_hex()))
}

/// 合约导入器
pub struct Importer {
    cache: Arc<Cache>,
    source: Arc<dyn RemoteSource>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
    /// 正在拉取的键，保证同一地址只有一个远程请求
    inflight: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

impl Importer {
    pub fn new(
        cache: Arc<Cache>,
        source: Arc<dyn RemoteSource>,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            source,
            policy,
            metrics,
            inflight: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    /// 导入构建文件（幂等）
    pub async fn import(&self, network: &str, address: Address) -> Result<BuildFile> {
        let key = build_file_key(network, address);
        if let Some(build) = self.cache.get::<BuildFile>(&key)? {
            self.metrics.record_cache_hit();
            return Ok(build);
        }

        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _inflight = InflightEntry {
            inflight: &self.inflight,
            key: &key,
            lock: &lock,
        };
        let _guard = lock.lock().await;

        // 等锁期间可能已被其他任务写入
        if let Some(build) = self.cache.get::<BuildFile>(&key)? {
            self.metrics.record_cache_hit();
            return Ok(build);
        }

        let build = self.fetch(network, address).await?;
        info!(network, %address, contract = %build.contract_name, "imported build file");
        self.cache.put(&key, &build)?;
        Ok(build)
    }

    async fn fetch(&self, network: &str, address: Address) -> Result<BuildFile> {
        let source = &self.source;
        let metrics = &self.metrics;
        self.policy
            .run(
                move |attempt| {
                    metrics.record_remote_fetch();
                    if attempt > 1 {
                        metrics.record_retry();
                    }
                    debug!(network, %address, attempt, "fetching build file");
                    source.fetch_build_file(network, address)
                },
                |_| true,
            )
            .await
            .map_err(|(attempts, last_error)| {
                warn!(network, %address, attempts, error = %last_error, "import exhausted retries");
                metrics.record_import_failure();
                Error::ImportFailure {
                    network: network.to_string(),
                    address,
                    attempts,
                    last_error,
                }
            })
    }
}

/// 离开作用域时移除 inflight 条目，提前返回和任务被中止时同样生效
struct InflightEntry<'a> {
    inflight: &'a DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    key: &'a CacheKey,
    lock: &'a Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightEntry<'_> {
    fn drop(&mut self) {
        // 只移除自己插入的锁，不碰后来者新建的条目
        self.inflight
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, self.lock));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::{InMemorySource, RemoteResult};
    use crate::types::{Abi, StorageSlot};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address(bytes.into())
    }

    fn setup(policy: RetryPolicy) -> (Arc<InMemorySource>, Arc<Cache>, Importer) {
        let source = Arc::new(InMemorySource::new());
        let cache = Arc::new(Cache::in_memory("test"));
        let importer = Importer::new(
            cache.clone(),
            source.clone(),
            policy,
            Arc::new(Metrics::new()),
        );
        (source, cache, importer)
    }

    #[tokio::test]
    async fn test_import_is_cached() {
        let (source, cache, importer) = setup(RetryPolicy::none());
        source.add_contract("test", addr(1), BuildFile::new("Comet", Abi::default()));

        let first = importer.import("test", addr(1)).await.unwrap();
        let second = importer.import("test", addr(1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.fetch_count(addr(1)), 1);
        assert!(cache
            .get::<BuildFile>(&build_file_key("test", addr(1)))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrent_imports_fetch_once() {
        let (source, _cache, importer) = setup(RetryPolicy::none());
        source.add_contract("test", addr(2), BuildFile::new("Configurator", Abi::default()));
        let importer = Arc::new(importer);

        let a = tokio::spawn({
            let importer = importer.clone();
            async move { importer.import("test", addr(2)).await }
        });
        let b = tokio::spawn({
            let importer = importer.clone();
            async move { importer.import("test", addr(2)).await }
        });
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(source.fetch_count(addr(2)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let (source, _cache, importer) =
            setup(RetryPolicy::fixed(2, Duration::from_millis(10)));
        source.fail_fetch(addr(3), RemoteError::RateLimited);

        let err = importer.import("test", addr(3)).await.unwrap_err();
        match err {
            Error::ImportFailure {
                address,
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(address, addr(3));
                assert_eq!(attempts, 3);
                assert_eq!(last_error, RemoteError::RateLimited);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.fetch_count(addr(3)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let (source, _cache, importer) =
            setup(RetryPolicy::fixed(3, Duration::from_millis(10)));
        source.add_contract("test", addr(4), BuildFile::new("Rewards", Abi::default()));
        source.fail_fetch_times(addr(4), 2, RemoteError::Timeout);

        let build = importer.import("test", addr(4)).await.unwrap();
        assert_eq!(build.contract_name, "Rewards");
        assert_eq!(source.fetch_count(addr(4)), 3);
    }

    /// 永远不返回的数据源
    struct StalledSource;

    #[async_trait]
    impl RemoteSource for StalledSource {
        async fn fetch_build_file(&self, _network: &str, _address: Address) -> RemoteResult<BuildFile> {
            std::future::pending().await
        }

        async fn call(&self, _address: Address, _calldata: &[u8]) -> RemoteResult<Vec<u8>> {
            std::future::pending().await
        }

        async fn storage_at(&self, _address: Address, _slot: StorageSlot) -> RemoteResult<StorageSlot> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inflight_entry_released_on_failure() {
        let (source, _cache, importer) =
            setup(RetryPolicy::fixed(1, Duration::from_millis(10)));
        source.fail_fetch(addr(6), RemoteError::Timeout);

        assert!(importer.import("test", addr(6)).await.is_err());
        assert!(importer.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_inflight_entry_released_on_abort() {
        let importer = Arc::new(Importer::new(
            Arc::new(Cache::in_memory("test")),
            Arc::new(StalledSource),
            RetryPolicy::none(),
            Arc::new(Metrics::new()),
        ));

        let task = tokio::spawn({
            let importer = importer.clone();
            async move { importer.import("test", addr(7)).await }
        });
        while importer.inflight.is_empty() {
            tokio::task::yield_now().await;
        }

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(importer.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_import_reads_durable_cache() {
        let dir = tempdir().unwrap();
        let writer = Cache::new("test", dir.path(), true);
        writer
            .put(
                &build_file_key("test", addr(5)),
                &BuildFile::new("Bulker", Abi::default()),
            )
            .unwrap();

        let source = Arc::new(InMemorySource::new());
        let importer = Importer::new(
            Arc::new(Cache::new("test", dir.path(), false)),
            source.clone(),
            RetryPolicy::none(),
            Arc::new(Metrics::new()),
        );
        let build = importer.import("test", addr(5)).await.unwrap();
        assert_eq!(build.contract_name, "Bulker");
        assert_eq!(source.fetch_count(addr(5)), 0);
    }
}
