//! 部署会话
//!
//! 一个 `DeploymentManager` 对应一个部署（通常与网络同名），持有缓存、
//! 三张存储表、导入器和合约句柄缓存。遍历结果只在整次运行成功后提交。

use crate::cache::{Cache, CacheKey};
use crate::config::DeploymentConfig;
use crate::error::{CacheWriteWarning, Error, Result};
use crate::import::Importer;
use crate::materializer::{materialize, ContractHandle, ContractMap, ContractsMemo};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::relation::RelationEvaluator;
use crate::remote::RemoteSource;
use crate::spider::{CancelToken, MergeMode, Spider, SpiderOptions, SpiderReport};
use crate::store::{StoreMode, Stores};
use crate::types::{Address, Alias, AliasMap, BuildFile, ProxyMap, ProxyRecord, Roots};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// 部署会话
pub struct DeploymentManager {
    deployment: String,
    network: String,
    config: DeploymentConfig,
    cache: Arc<Cache>,
    metrics: Arc<Metrics>,
    importer: Arc<Importer>,
    stores: Stores,
    memo: Arc<ContractsMemo>,
    /// 同一会话上的遍历串行执行
    run_lock: tokio::sync::Mutex<()>,
}

impl DeploymentManager {
    pub fn new(
        deployment: &str,
        config: DeploymentConfig,
        source: Arc<dyn RemoteSource>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(Cache::new(
            deployment,
            &config.base_dir,
            config.write_cache_to_disk,
        ));
        Ok(Self::with_cache(deployment, config, source, cache))
    }

    fn with_cache(
        deployment: &str,
        config: DeploymentConfig,
        source: Arc<dyn RemoteSource>,
        cache: Arc<Cache>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let importer = Arc::new(Importer::new(
            cache.clone(),
            source,
            config.retry_policy(),
            metrics.clone(),
        ));
        let memo = Arc::new(ContractsMemo::new());
        let stores = Stores::new(cache.clone(), memo.clone());
        Self {
            deployment: deployment.to_string(),
            network: config.network_for(deployment),
            config,
            cache,
            metrics,
            importer,
            stores,
            memo,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// 导入构建文件，默认使用会话网络
    pub async fn import(&self, address: Address, network: Option<&str>) -> Result<BuildFile> {
        self.importer
            .import(network.unwrap_or(&self.network), address)
            .await
    }

    pub fn put_alias(&self, alias: &str, address: Address) -> Result<()> {
        self.stores.aliases.put(alias, address)
    }

    pub fn put_proxy(&self, alias: &str, record: ProxyRecord) -> Result<()> {
        self.stores.proxies.put(alias, record)
    }

    /// 替换根集合
    pub fn put_roots(&self, roots: Roots) -> Result<()> {
        self.stores.roots.store(roots, StoreMode::Replace)
    }

    pub fn get_roots(&self) -> Result<Roots> {
        self.stores.roots.get_all()
    }

    pub fn get_aliases(&self) -> Result<AliasMap> {
        self.stores.aliases.get_all()
    }

    pub fn get_proxies(&self) -> Result<ProxyMap> {
        self.stores.proxies.get_all()
    }

    /// 使用配置中的参数遍历
    pub async fn spider(&self) -> Result<SpiderReport> {
        let options = SpiderOptions {
            max_depth: self.config.max_depth,
            concurrency: self.config.concurrency,
            merge: MergeMode::Monotonic,
        };
        self.spider_with(options, &CancelToken::new()).await
    }

    /// 从根集合遍历，成功后一次性提交别名表和代理表
    pub async fn spider_with(
        &self,
        options: SpiderOptions,
        cancel: &CancelToken,
    ) -> Result<SpiderReport> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("spider", %run_id, deployment = %self.deployment);
        self.run_spider(run_id, &options, cancel).instrument(span).await
    }

    async fn run_spider(
        &self,
        run_id: Uuid,
        options: &SpiderOptions,
        cancel: &CancelToken,
    ) -> Result<SpiderReport> {
        let started_at = Utc::now();
        let timer = self.metrics.record_run_start();

        let roots = self.get_roots()?;
        let prior_aliases = self.get_aliases()?;
        let prior_proxies = self.get_proxies()?;
        info!(network = %self.network, roots = roots.len(), "spider run started");

        let outcome = match self
            .build_spider()
            .run(&roots, &prior_aliases, &prior_proxies, options, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "spider run failed, stores left untouched");
                self.metrics.record_run_complete(timer, false);
                return Err(e);
            }
        };

        self.stores
            .aliases
            .store(outcome.aliases.clone(), StoreMode::Replace)?;
        self.stores
            .proxies
            .store(outcome.proxies.clone(), StoreMode::Replace)?;
        self.metrics.record_run_complete(timer, true);

        let mut report = SpiderReport {
            run_id,
            deployment: self.deployment.clone(),
            network: self.network.clone(),
            started_at,
            finished_at: Utc::now(),
            visited: outcome.visited,
            added_aliases: AliasMap::new(),
            changed_aliases: Default::default(),
            removed_aliases: Vec::new(),
            added_proxies: ProxyMap::new(),
            changed_proxies: Default::default(),
            removed_proxies: Vec::new(),
            skipped: outcome.skipped,
            truncated: outcome.truncated,
        };
        report.diff(
            &prior_aliases,
            &outcome.aliases,
            &prior_proxies,
            &outcome.proxies,
        );
        info!(
            visited = report.visited,
            added_aliases = report.added_aliases.len(),
            changed_aliases = report.changed_aliases.len(),
            added_proxies = report.added_proxies.len(),
            "spider run committed"
        );
        Ok(report)
    }

    fn build_spider(&self) -> Spider {
        let evaluator = Arc::new(RelationEvaluator::new(
            self.importer.source().clone(),
            self.importer.policy().clone(),
            self.metrics.clone(),
        ));
        Spider::new(
            self.importer.clone(),
            evaluator,
            self.config.relations.for_network(&self.network).to_vec(),
            &self.network,
            self.metrics.clone(),
        )
    }

    /// 别名 -> 合约句柄，存储修改前复用上次结果
    pub async fn contracts(&self) -> Result<Arc<ContractMap>> {
        if let Some(contracts) = self.memo.get() {
            return Ok(contracts);
        }
        let generation = self.memo.generation();
        let aliases = self.get_aliases()?;
        let proxies = self.get_proxies()?;
        let contracts = Arc::new(materialize(&self.importer, &self.network, &aliases, &proxies).await?);
        self.memo.set(generation, contracts.clone());
        Ok(contracts)
    }

    pub async fn contract(&self, alias: &str) -> Result<ContractHandle> {
        self.contracts()
            .await?
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("合约别名 {}", alias)))
    }

    /// 保存迁移产物，返回落盘路径
    pub fn store_artifact<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let key = artifact_key(name)?;
        self.cache.put(&key, value)?;
        Ok(self.cache.file_path(&key))
    }

    pub fn read_artifact<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.cache.get(&artifact_key(name)?)
    }

    /// 复制一个会话，内存缓存相同，不产生落盘写入
    pub fn fork(&self) -> DeploymentManager {
        let cache = Arc::new(Cache::new(
            &self.deployment,
            self.cache.base_dir(),
            self.cache.writes_to_disk(),
        ));
        cache.load_bulk(self.cache.snapshot());
        Self::with_cache(
            &self.deployment,
            self.config.clone(),
            self.importer.source().clone(),
            cache,
        )
    }

    pub fn should_write_cache_to_disk(&self, enabled: bool) {
        self.cache.set_write_to_disk(enabled);
    }

    pub fn take_cache_warnings(&self) -> Vec<CacheWriteWarning> {
        self.cache.take_warnings()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 别名是否为代理
    pub fn is_proxy(&self, alias: &Alias) -> Result<bool> {
        Ok(self.stores.proxies.get(alias)?.is_some())
    }
}

fn artifact_key(name: &str) -> Result<CacheKey> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(Error::InvalidArgument(format!("无效的产物名称: {}", name)));
    }
    Ok(CacheKey::deployment(&format!("artifacts/{}.json", name)))
}
