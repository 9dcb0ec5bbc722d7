//! 持久化缓存
//!
//! 按部署名称划分命名空间的键值存储：
//! - 内存视图在同一进程内共享
//! - 可选的落盘模式，每次修改同步写入 `<base_dir>/<namespace>/<rel>`
//! - 落盘失败不影响逻辑操作，通过告警侧通道返回

use crate::error::{CacheWriteWarning, Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// 部署级数据，例如 `aliases.json`
    Deployment(Vec<String>),
    /// 网络级数据，例如 `.contracts/<address>.json`
    Network { network: String, rel: Vec<String> },
}

impl CacheKey {
    pub fn deployment(rel: &str) -> Self {
        CacheKey::Deployment(rel.split('/').map(str::to_string).collect())
    }

    pub fn network(network: &str, rel: &str) -> Self {
        CacheKey::Network {
            network: network.to_string(),
            rel: rel.split('/').map(str::to_string).collect(),
        }
    }

    /// 相对 base_dir 的路径片段
    fn segments<'a>(&'a self, deployment: &'a str) -> impl Iterator<Item = &'a str> {
        let (head, rel) = match self {
            CacheKey::Deployment(rel) => (deployment, rel),
            CacheKey::Network { network, rel } => (network.as_str(), rel),
        };
        std::iter::once(head).chain(rel.iter().map(String::as_str))
    }

    fn memory_key(&self, deployment: &str) -> String {
        self.segments(deployment).collect::<Vec<_>>().join("/")
    }
}

/// 缓存快照（内存视图导出）
pub type CacheSnapshot = HashMap<String, Value>;

/// 持久化缓存
pub struct Cache {
    deployment: String,
    base_dir: PathBuf,
    write_to_disk: AtomicBool,
    /// `None` 表示已删除（墓碑），防止读穿透复活磁盘上的旧值
    memory: DashMap<String, Option<Value>>,
    warnings: Mutex<Vec<CacheWriteWarning>>,
}

impl Cache {
    pub fn new<P: AsRef<Path>>(deployment: &str, base_dir: P, write_to_disk: bool) -> Self {
        Self {
            deployment: deployment.to_string(),
            base_dir: base_dir.as_ref().to_path_buf(),
            write_to_disk: AtomicBool::new(write_to_disk),
            memory: DashMap::new(),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// 创建内存缓存（用于测试），base_dir 指向不存在的临时目录
    pub fn in_memory(deployment: &str) -> Self {
        let base_dir = std::env::temp_dir().join(format!(
            "contract_spider_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        Self::new(deployment, base_dir, false)
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn writes_to_disk(&self) -> bool {
        self.write_to_disk.load(Ordering::SeqCst)
    }

    pub fn set_write_to_disk(&self, enabled: bool) {
        self.write_to_disk.store(enabled, Ordering::SeqCst);
    }

    /// 键对应的磁盘路径
    pub fn file_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.base_dir.clone();
        for segment in key.segments(&self.deployment) {
            path.push(segment);
        }
        path
    }

    /// 读取：先查内存，未命中时读穿透到磁盘
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        let mem_key = key.memory_key(&self.deployment);
        if let Some(entry) = self.memory.get(&mem_key) {
            return match entry.value() {
                Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
                None => Ok(None),
            };
        }

        let path = self.file_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)
            .map_err(|e| Error::StorageError(format!("读取缓存 {:?} 失败: {}", path, e)))?;
        let value: Value = serde_json::from_slice(&data)?;
        debug!(path = ?path, "cache read-through");
        let parsed = serde_json::from_value(value.clone())?;
        self.memory.insert(mem_key, Some(value));
        Ok(Some(parsed))
    }

    /// 写入内存，落盘模式下同步写入磁盘
    pub fn put<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        if self.writes_to_disk() {
            let path = self.file_path(key);
            if let Err(e) = write_json(&path, &value) {
                self.warn(path, e);
            }
        }
        self.memory.insert(key.memory_key(&self.deployment), Some(value));
        Ok(())
    }

    pub fn delete(&self, key: &CacheKey) {
        if self.writes_to_disk() {
            let path = self.file_path(key);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => self.warn(path, e.to_string()),
            }
        }
        self.memory.insert(key.memory_key(&self.deployment), None);
    }

    /// 批量合并快照到内存，不触碰磁盘
    pub fn load_bulk(&self, snapshot: CacheSnapshot) {
        for (key, value) in snapshot {
            self.memory.insert(key, Some(value));
        }
    }

    /// 导出当前内存视图（不含墓碑）
    pub fn snapshot(&self) -> CacheSnapshot {
        self.memory
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .as_ref()
                    .map(|v| (entry.key().clone(), v.clone()))
            })
            .collect()
    }

    /// 取出并清空累积的落盘告警
    pub fn take_warnings(&self) -> Vec<CacheWriteWarning> {
        std::mem::take(&mut *self.warnings.lock())
    }

    fn warn(&self, path: PathBuf, message: String) {
        warn!(path = ?path, error = %message, "cache write failed, keeping in-memory value");
        self.warnings.lock().push(CacheWriteWarning { path, message });
    }
}

fn write_json(path: &Path, value: &Value) -> std::result::Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("创建目录失败: {}", e))?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(|e| format!("序列化失败: {}", e))?;
    // 先写临时文件再改名，中途崩溃不会留下截断的 JSON
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).map_err(|e| format!("写入失败: {}", e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        format!("替换文件失败: {}", e)
    })
}
