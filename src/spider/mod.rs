//! 合约关系遍历
//!
//! 从根地址出发按层广度优先遍历合约图：
//! - 同一层的节点并发解析（导入构建文件、识别代理、提取关系），并发数受信号量限制
//! - 解析结果按层内顺序串行合并，认领地址和分配别名都在合并阶段完成，
//!   因此同一地址在一次运行中最多访问一次，命名结果与并发调度无关
//! - 运行结果只在全部成功后返回，调用方负责一次性提交

mod cancel;
mod naming;
mod report;

pub use cancel::CancelToken;
pub use report::{Change, SpiderReport};

use crate::error::{Error, Result};
use crate::import::Importer;
use crate::metrics::Metrics;
use crate::relation::{ContractKind, Discovered, RelationEvaluator, RelationKind, RelationSkip};
use crate::types::{Address, Alias, AliasMap, ProxyMap, ProxyRecord, Roots};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// 合并方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// 保留本次未访问到的旧别名
    #[default]
    Monotonic,
    /// 只保留本次发现的结果
    Replace,
}

/// 遍历参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderOptions {
    /// 深度达到该值的节点只解析不展开
    pub max_depth: usize,
    /// 同时解析的节点数上限
    pub concurrency: usize,
    pub merge: MergeMode,
}

impl Default for SpiderOptions {
    fn default() -> Self {
        Self {
            max_depth: 16,
            concurrency: 8,
            merge: MergeMode::Monotonic,
        }
    }
}

/// 一次遍历的结果（已与旧表合并）
#[derive(Debug, Clone, Default)]
pub struct SpiderOutcome {
    pub aliases: AliasMap,
    pub proxies: ProxyMap,
    pub visited: usize,
    pub skipped: Vec<RelationSkip>,
    pub truncated: Vec<Alias>,
}

/// 根节点的发现关系名
const ROOT_RELATION: &str = "root";

/// 待解析的节点
#[derive(Debug, Clone)]
struct Node {
    alias: Alias,
    address: Address,
    depth: usize,
    /// 发现该节点的别名，根节点为自身
    parent: Alias,
    /// 发现该节点的关系
    relation: String,
}

impl Node {
    /// 为解析错误附上节点位置和发现它的规则
    fn failure(&self, source: Error) -> Error {
        Error::SpiderFailure {
            alias: self.alias.clone(),
            address: self.address,
            parent: self.parent.clone(),
            relation: self.relation.clone(),
            source: Box::new(source),
        }
    }
}

/// 节点解析结果
struct Resolved {
    node: Node,
    proxy: Option<ProxyRecord>,
    relations: Vec<Discovered>,
    skipped: Vec<RelationSkip>,
    expanded: bool,
}

/// 遍历过程中的累积状态
#[derive(Default)]
struct Walk {
    /// 已认领地址 -> 认领它的别名
    claimed: HashMap<Address, Alias>,
    named: AliasMap,
    proxies: ProxyMap,
    visited_aliases: BTreeSet<Alias>,
    skipped: Vec<RelationSkip>,
    truncated: Vec<Alias>,
    visited: usize,
}

/// 关系遍历器
#[derive(Clone)]
pub struct Spider {
    importer: Arc<Importer>,
    evaluator: Arc<RelationEvaluator>,
    kinds: Arc<Vec<ContractKind>>,
    network: String,
    metrics: Arc<Metrics>,
}

impl Spider {
    pub fn new(
        importer: Arc<Importer>,
        evaluator: Arc<RelationEvaluator>,
        kinds: Vec<ContractKind>,
        network: &str,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            importer,
            evaluator,
            kinds: Arc::new(kinds),
            network: network.to_string(),
            metrics,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// 执行一次遍历，返回与 `prior_*` 合并后的结果
    ///
    /// 导入失败、关系读取重试耗尽、别名歧义或取消都会让整个运行失败，
    /// 此时不产生任何结果。
    pub async fn run(
        &self,
        roots: &Roots,
        prior_aliases: &AliasMap,
        prior_proxies: &ProxyMap,
        options: &SpiderOptions,
        cancel: &CancelToken,
    ) -> Result<SpiderOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut walk = Walk::default();
        let mut twins = Vec::new();
        let mut level = Vec::new();
        for (alias, address) in roots {
            walk.named.insert(alias.clone(), *address);
            match walk.claimed.get(address) {
                // 多个根别名指向同一地址，只访问一次
                Some(primary) => twins.push((alias.clone(), primary.clone())),
                None => {
                    walk.claimed.insert(*address, alias.clone());
                    level.push(Node {
                        alias: alias.clone(),
                        address: *address,
                        depth: 0,
                        parent: alias.clone(),
                        relation: ROOT_RELATION.to_string(),
                    });
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        while !level.is_empty() {
            let depth = level[0].depth;
            debug!(depth, nodes = level.len(), "expanding level");
            let resolved = self.resolve_level(&level, options, &semaphore, cancel).await?;

            let mut next = Vec::new();
            for item in resolved {
                self.merge_node(&mut walk, item, &mut next)?;
            }
            level = next;
        }

        for (twin, primary) in twins {
            if let Some(record) = walk.proxies.get(&primary).cloned() {
                walk.proxies.insert(twin.clone(), record);
            }
            walk.visited_aliases.insert(twin);
        }

        info!(
            network = %self.network,
            visited = walk.visited,
            aliases = walk.named.len(),
            proxies = walk.proxies.len(),
            skipped = walk.skipped.len(),
            "spider walk finished"
        );

        let (aliases, proxies) = match options.merge {
            MergeMode::Replace => (walk.named, walk.proxies),
            MergeMode::Monotonic => {
                let mut aliases = prior_aliases.clone();
                aliases.extend(walk.named);
                // 本次访问到的别名以本次结果为准，没有实现合约时删除旧记录
                let mut proxies = prior_proxies.clone();
                proxies.retain(|alias, _| !walk.visited_aliases.contains(alias));
                proxies.extend(walk.proxies);
                (aliases, proxies)
            }
        };

        Ok(SpiderOutcome {
            aliases,
            proxies,
            visited: walk.visited,
            skipped: walk.skipped,
            truncated: walk.truncated,
        })
    }

    /// 并发解析一层节点，结果按输入顺序返回
    async fn resolve_level(
        &self,
        level: &[Node],
        options: &SpiderOptions,
        semaphore: &Arc<Semaphore>,
        cancel: &CancelToken,
    ) -> Result<Vec<Resolved>> {
        let mut tasks = JoinSet::new();
        for (idx, node) in level.iter().cloned().enumerate() {
            let spider = self.clone();
            let semaphore = semaphore.clone();
            let expand = node.depth < options.max_depth;
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::InternalError(e.to_string()))?;
                spider.resolve(node, expand).await.map(|r| (idx, r))
            });
        }

        let mut slots: Vec<Option<Resolved>> = level.iter().map(|_| None).collect();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!(network = %self.network, "spider run cancelled");
                    return Err(Error::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok((idx, resolved)))) => slots[idx] = Some(resolved),
                    Some(Ok(Err(e))) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(Error::InternalError(format!("解析任务异常退出: {}", e)));
                    }
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| Error::InternalError("节点解析结果缺失".to_string())))
            .collect()
    }

    /// 解析单个节点：导入、识别代理、按有效 ABI 提取关系
    async fn resolve(self, node: Node, expand: bool) -> Result<Resolved> {
        let build = self
            .importer
            .import(&self.network, node.address)
            .await
            .map_err(|e| node.failure(e))?;
        let implementation = self
            .evaluator
            .evaluate(node.address, &build, &self.kinds, RelationKind::Implementation)
            .await
            .map_err(|e| node.failure(e))?;
        let mut skipped = implementation.skipped;

        let mut proxy = None;
        let mut effective = build;
        if let Some(found) = implementation.found.into_iter().next() {
            debug!(
                alias = %node.alias,
                proxy = %node.address,
                implementation = %found.address,
                "proxy detected"
            );
            effective = self
                .importer
                .import(&self.network, found.address)
                .await
                .map_err(|e| node.failure(e))?;
            proxy = Some(ProxyRecord {
                proxy: node.address,
                implementation: found.address,
                kind: found.contract_kind,
            });
        }

        let mut relations = Vec::new();
        if expand {
            // 代理的关系通过代理地址读取，使用实现合约的 ABI 匹配规则
            let plain = self
                .evaluator
                .evaluate(node.address, &effective, &self.kinds, RelationKind::Plain)
                .await
                .map_err(|e| node.failure(e))?;
            relations = plain.found;
            skipped.extend(plain.skipped);
        }

        Ok(Resolved {
            node,
            proxy,
            relations,
            skipped,
            expanded: expand,
        })
    }

    /// 合并一个节点的解析结果，新认领的地址进入下一层
    fn merge_node(&self, walk: &mut Walk, resolved: Resolved, next: &mut Vec<Node>) -> Result<()> {
        let Resolved {
            node,
            proxy,
            relations,
            skipped,
            expanded,
        } = resolved;

        self.metrics.record_node_visited();
        walk.visited += 1;
        walk.visited_aliases.insert(node.alias.clone());
        walk.skipped.extend(skipped);

        if let Some(record) = proxy {
            // 实现合约不单独命名，也不再作为节点访问
            walk.claimed
                .entry(record.implementation)
                .or_insert_with(|| node.alias.clone());
            walk.proxies.insert(node.alias.clone(), record);
        }

        if !expanded {
            debug!(alias = %node.alias, depth = node.depth, "depth limit reached");
            walk.truncated.push(node.alias);
            return Ok(());
        }

        for found in relations {
            if let Some(owner) = walk.claimed.get(&found.address) {
                debug!(
                    from = %node.alias,
                    relation = %found.relation,
                    address = %found.address,
                    owner = %owner,
                    "address already claimed"
                );
                continue;
            }
            let alias = naming::assign(&node.alias, &found, &walk.named)?;
            walk.claimed.insert(found.address, alias.clone());
            walk.named.insert(alias.clone(), found.address);
            next.push(Node {
                alias,
                address: found.address,
                depth: node.depth + 1,
                parent: node.alias.clone(),
                relation: found.relation,
            });
        }
        Ok(())
    }
}
