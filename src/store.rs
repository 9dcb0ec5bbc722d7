//! 别名 / 代理 / 根集合存储
//!
//! 缓存之上的类型化访问层。每个表对应部署目录下的一个 JSON 文件，
//! 所有修改都会通知观察者（会话的合约句柄缓存）失效。

use crate::cache::{Cache, CacheKey};
use crate::error::Result;
use crate::types::{Address, Alias, ProxyRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

pub const ALIASES_FILE: &str = "aliases.json";
pub const PROXIES_FILE: &str = "proxies.json";
pub const ROOTS_FILE: &str = "roots.json";

/// 存储修改通知
pub trait StoreObserver: Send + Sync {
    fn invalidate(&self);
}

/// 批量写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// 与已有内容合并，同名覆盖
    Merge,
    /// 整表替换
    Replace,
}

/// 以别名为键的持久化表
pub struct MapStore<V> {
    cache: Arc<Cache>,
    key: CacheKey,
    observer: Arc<dyn StoreObserver>,
    _value: PhantomData<V>,
}

pub type AliasStore = MapStore<Address>;
pub type ProxyStore = MapStore<ProxyRecord>;
pub type RootStore = MapStore<Address>;

impl<V> MapStore<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    pub fn new(cache: Arc<Cache>, file: &str, observer: Arc<dyn StoreObserver>) -> Self {
        Self {
            cache,
            key: CacheKey::deployment(file),
            observer,
            _value: PhantomData,
        }
    }

    /// 读取整表，不存在时为空
    pub fn get_all(&self) -> Result<BTreeMap<Alias, V>> {
        Ok(self.cache.get(&self.key)?.unwrap_or_default())
    }

    pub fn get(&self, alias: &str) -> Result<Option<V>> {
        Ok(self.get_all()?.remove(alias))
    }

    /// 单条 upsert
    pub fn put(&self, alias: &str, value: V) -> Result<()> {
        let mut map = self.get_all()?;
        map.insert(alias.to_string(), value);
        self.write(&map)
    }

    pub fn remove(&self, alias: &str) -> Result<bool> {
        let mut map = self.get_all()?;
        let removed = map.remove(alias).is_some();
        if removed {
            self.write(&map)?;
        }
        Ok(removed)
    }

    /// 批量写入
    pub fn store(&self, entries: BTreeMap<Alias, V>, mode: StoreMode) -> Result<()> {
        let map = match mode {
            StoreMode::Replace => entries,
            StoreMode::Merge => {
                let mut map = self.get_all()?;
                map.extend(entries);
                map
            }
        };
        self.write(&map)
    }

    fn write(&self, map: &BTreeMap<Alias, V>) -> Result<()> {
        self.cache.put(&self.key, map)?;
        debug!(key = ?self.key, entries = map.len(), "store updated");
        self.observer.invalidate();
        Ok(())
    }
}

/// 一个部署的三张表
pub struct Stores {
    pub aliases: AliasStore,
    pub proxies: ProxyStore,
    pub roots: RootStore,
}

impl Stores {
    pub fn new(cache: Arc<Cache>, observer: Arc<dyn StoreObserver>) -> Self {
        Self {
            aliases: MapStore::new(cache.clone(), ALIASES_FILE, observer.clone()),
            proxies: MapStore::new(cache.clone(), PROXIES_FILE, observer.clone()),
            roots: MapStore::new(cache, ROOTS_FILE, observer),
        }
    }
}
