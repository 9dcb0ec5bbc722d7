//! 关系求值
//!
//! 对一个地址执行匹配到的规则。调用回滚、返回值无法识别或访问器缺失都只是
//! "没有这条关系"，不会让遍历失败；网络层错误在重试耗尽后返回
//! `RelationUnavailable`，由调用方终止整个运行。

use super::{AliasPolicy, ContractKind, Extraction, RelationKind, RelationRule};
use crate::codec::{decode_address, decode_uint, encode_call, encode_uint};
use crate::error::{Error, RemoteError, Result};
use crate::import::RetryPolicy;
use crate::metrics::Metrics;
use crate::remote::RemoteSource;
use crate::types::{Abi, Address, BuildFile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 跳过一条关系的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// ABI 中没有访问器
    MissingAccessor(String),
    /// 调用回滚
    Reverted(String),
    /// 返回值不是地址/数量
    Unrecognized,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingAccessor(sig) => write!(f, "ABI 缺少 {}", sig),
            SkipReason::Reverted(msg) => write!(f, "调用回滚: {}", msg),
            SkipReason::Unrecognized => write!(f, "返回值无法识别"),
        }
    }
}

/// 被跳过的关系
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSkip {
    pub address: Address,
    pub relation: String,
    pub reason: SkipReason,
}

/// 提取到的关联地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// 命中的合约类型名
    pub contract_kind: String,
    pub relation: String,
    pub kind: RelationKind,
    pub alias: AliasPolicy,
    pub index: Option<u64>,
    pub address: Address,
}

/// 一个地址的求值结果
#[derive(Debug, Clone, Default)]
pub struct RelationSet {
    pub found: Vec<Discovered>,
    pub skipped: Vec<RelationSkip>,
}

impl RelationSet {
    fn extend(&mut self, other: RelationSet) {
        self.found.extend(other.found);
        self.skipped.extend(other.skipped);
    }
}

/// 单条规则读取失败的原因
enum ReadError {
    Skip(SkipReason),
    /// 网络层错误，重试已耗尽
    Unavailable { attempts: u32, last_error: RemoteError },
}

impl From<SkipReason> for ReadError {
    fn from(reason: SkipReason) -> Self {
        ReadError::Skip(reason)
    }
}

/// 关系求值器
pub struct RelationEvaluator {
    source: Arc<dyn RemoteSource>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl RelationEvaluator {
    pub fn new(source: Arc<dyn RemoteSource>, policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            source,
            policy,
            metrics,
        }
    }

    /// 对 `address` 执行所有匹配 `build` 且种类为 `kind` 的规则
    ///
    /// 规则按配置顺序求值，结果顺序确定。任一规则的远程读取在重试耗尽后
    /// 仍失败时返回 `RelationUnavailable`。
    pub async fn evaluate(
        &self,
        address: Address,
        build: &BuildFile,
        kinds: &[ContractKind],
        kind: RelationKind,
    ) -> Result<RelationSet> {
        let mut set = RelationSet::default();
        for contract_kind in kinds.iter().filter(|k| k.matches(build)) {
            for rule in contract_kind.relations.iter().filter(|r| r.kind == kind) {
                set.extend(
                    self.evaluate_rule(address, &build.abi, &contract_kind.name, rule)
                        .await?,
                );
            }
        }
        Ok(set)
    }

    async fn evaluate_rule(
        &self,
        address: Address,
        abi: &Abi,
        contract_kind: &str,
        rule: &RelationRule,
    ) -> Result<RelationSet> {
        self.metrics.record_relation_evaluated();
        let mut set = RelationSet::default();

        let outcome = match rule.extract.required_signatures().into_iter().find(|s| !abi.has_function(s)) {
            Some(missing) => Err(SkipReason::MissingAccessor(missing.to_string())),
            None => match self.extract(address, &rule.extract).await {
                Ok(found) => Ok(found),
                Err(ReadError::Skip(reason)) => Err(reason),
                Err(ReadError::Unavailable {
                    attempts,
                    last_error,
                }) => {
                    warn!(%address, relation = %rule.relation, attempts, error = %last_error, "relation read failed after retries");
                    return Err(Error::RelationUnavailable {
                        address,
                        relation: rule.relation.clone(),
                        attempts,
                        last_error,
                    });
                }
            },
        };

        match outcome {
            Ok(addresses) => {
                for (index, target) in addresses {
                    self.metrics.record_relation_discovered();
                    debug!(%address, relation = %rule.relation, %target, "relation found");
                    set.found.push(Discovered {
                        contract_kind: contract_kind.to_string(),
                        relation: rule.relation.clone(),
                        kind: rule.kind,
                        alias: rule.alias.clone(),
                        index,
                        address: target,
                    });
                }
            }
            Err(reason) => {
                self.metrics.record_relation_skipped();
                debug!(%address, relation = %rule.relation, %reason, "relation skipped");
                set.skipped.push(RelationSkip {
                    address,
                    relation: rule.relation.clone(),
                    reason,
                });
            }
        }
        Ok(set)
    }

    /// 执行提取，零地址视为没有关系
    async fn extract(
        &self,
        address: Address,
        extraction: &Extraction,
    ) -> std::result::Result<Vec<(Option<u64>, Address)>, ReadError> {
        match extraction {
            Extraction::Call { method } => {
                let ret = self.call(address, encode_call(method, &[])).await?;
                let target = decode_address(&ret).ok_or(SkipReason::Unrecognized)?;
                Ok(non_zero(None, target))
            }
            Extraction::Slot { slot } => {
                let source = &self.source;
                let word = self
                    .policy
                    .run(move |_| source.storage_at(address, *slot), |e| !e.is_revert())
                    .await
                    .map_err(read_error)?;
                let target = Address::from_word(word.as_bytes()).ok_or(SkipReason::Unrecognized)?;
                Ok(non_zero(None, target))
            }
            Extraction::Indexed {
                count,
                item,
                max_items,
            } => {
                let ret = self.call(address, encode_call(count, &[])).await?;
                let total = decode_uint(&ret).ok_or(SkipReason::Unrecognized)?;
                if total > *max_items {
                    warn!(%address, total, max_items, "indexed relation truncated");
                }
                let mut found = Vec::new();
                for i in 0..total.min(*max_items) {
                    let ret = self.call(address, encode_call(item, &[encode_uint(i)])).await?;
                    let target = decode_address(&ret).ok_or(SkipReason::Unrecognized)?;
                    found.extend(non_zero(Some(i), target));
                }
                Ok(found)
            }
        }
    }

    async fn call(&self, address: Address, calldata: Vec<u8>) -> std::result::Result<Vec<u8>, ReadError> {
        let source = &self.source;
        let calldata = &calldata;
        self.policy
            .run(move |_| source.call(address, calldata), |e| !e.is_revert())
            .await
            .map_err(read_error)
    }
}

fn non_zero(index: Option<u64>, target: Address) -> Vec<(Option<u64>, Address)> {
    if target.is_zero() {
        Vec::new()
    } else {
        vec![(index, target)]
    }
}

fn read_error((attempts, last_error): (u32, RemoteError)) -> ReadError {
    match last_error {
        RemoteError::Reverted(msg) => ReadError::Skip(SkipReason::Reverted(msg)),
        last_error => ReadError::Unavailable {
            attempts,
            last_error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::EIP1967_IMPLEMENTATION_SLOT;
    use crate::remote::InMemorySource;
    use crate::types::{AbiEntry, AbiParam, StorageSlot};

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address(bytes.into())
    }

    fn func(name: &str, inputs: &[&str]) -> AbiEntry {
        AbiEntry {
            kind: "function".to_string(),
            name: name.to_string(),
            inputs: inputs
                .iter()
                .map(|t| AbiParam {
                    name: String::new(),
                    kind: t.to_string(),
                    components: Vec::new(),
                })
                .collect(),
            outputs: Vec::new(),
            state_mutability: Some("view".to_string()),
        }
    }

    fn evaluator(source: Arc<InMemorySource>) -> RelationEvaluator {
        RelationEvaluator::new(source, RetryPolicy::none(), Arc::new(Metrics::new()))
    }

    fn kind(relations: Vec<RelationRule>) -> ContractKind {
        ContractKind {
            name: "comet".to_string(),
            contract_names: Vec::new(),
            requires: Vec::new(),
            relations,
        }
    }

    #[tokio::test]
    async fn test_call_relations_and_skips() {
        let source = Arc::new(InMemorySource::new());
        source.set_address_call(addr(1), "baseToken()", addr(2));
        source.set_revert(addr(1), "governor()");
        source.set_address_call(addr(1), "pauseGuardian()", Address::ZERO);

        let build = BuildFile::new(
            "Comet",
            Abi(vec![
                func("baseToken", &[]),
                func("governor", &[]),
                func("pauseGuardian", &[]),
            ]),
        );
        let kinds = vec![kind(vec![
            RelationRule::call("baseToken", "baseToken()"),
            RelationRule::call("governor", "governor()"),
            RelationRule::call("pauseGuardian", "pauseGuardian()"),
            RelationRule::call("configurator", "configurator()"),
        ])];

        let set = evaluator(source)
            .evaluate(addr(1), &build, &kinds, RelationKind::Plain)
            .await
            .unwrap();

        assert_eq!(set.found.len(), 1);
        assert_eq!(set.found[0].relation, "baseToken");
        assert_eq!(set.found[0].address, addr(2));

        let reasons: Vec<_> = set.skipped.iter().map(|s| s.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::Reverted("execution reverted".to_string()),
                SkipReason::MissingAccessor("configurator()".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unrecognized_return_is_skipped() {
        let source = Arc::new(InMemorySource::new());
        source.set_uint_call(addr(1), "owner()", u64::MAX);
        source.set_raw_call(addr(1), encode_call("admin()", &[]), vec![0xff; 32]);

        let build = BuildFile::new("Ownable", Abi(vec![func("owner", &[]), func("admin", &[])]));
        let kinds = vec![kind(vec![
            RelationRule::call("owner", "owner()"),
            RelationRule::call("admin", "admin()"),
        ])];
        let set = evaluator(source)
            .evaluate(addr(1), &build, &kinds, RelationKind::Plain)
            .await
            .unwrap();

        // u64::MAX 的高位为零，会被当作地址解出
        assert_eq!(set.found.len(), 1);
        assert_eq!(set.skipped[0].reason, SkipReason::Unrecognized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_remote_fails_evaluation() {
        let source = Arc::new(InMemorySource::new());
        source.fail_reads(addr(1), RemoteError::Timeout);
        let eval = RelationEvaluator::new(
            source.clone(),
            RetryPolicy::fixed(2, std::time::Duration::from_millis(10)),
            Arc::new(Metrics::new()),
        );
        let build = BuildFile::new("TransparentUpgradeableProxy", Abi::default());

        let err = eval
            .evaluate(addr(1), &build, &[ContractKind::eip1967_proxy()], RelationKind::Implementation)
            .await
            .unwrap_err();
        match err {
            Error::RelationUnavailable {
                address,
                relation,
                attempts,
                last_error,
            } => {
                assert_eq!(address, addr(1));
                assert_eq!(relation, "implementation");
                assert_eq!(attempts, 3);
                assert_eq!(last_error, RemoteError::Timeout);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_slot_and_indexed_extraction() {
        let source = Arc::new(InMemorySource::new());
        let slot = StorageSlot::from_slice(&hex::decode(&EIP1967_IMPLEMENTATION_SLOT[2..]).unwrap());
        source.set_slot_address(addr(1), slot, addr(9));
        source.set_uint_call(addr(1), "numAssets()", 3);
        source.set_indexed_call(addr(1), "assets(uint256)", 0, addr(10));
        source.set_indexed_call(addr(1), "assets(uint256)", 1, Address::ZERO);
        source.set_indexed_call(addr(1), "assets(uint256)", 2, addr(12));

        let build = BuildFile::new(
            "Comet",
            Abi(vec![func("numAssets", &[]), func("assets", &["uint256"])]),
        );
        let kinds = vec![
            ContractKind::eip1967_proxy(),
            kind(vec![RelationRule {
                relation: "asset".to_string(),
                extract: Extraction::Indexed {
                    count: "numAssets()".to_string(),
                    item: "assets(uint256)".to_string(),
                    max_items: 2,
                },
                kind: RelationKind::Plain,
                alias: AliasPolicy::Derived,
            }]),
        ];
        let eval = evaluator(source);

        let implementation = eval
            .evaluate(addr(1), &build, &kinds, RelationKind::Implementation)
            .await
            .unwrap();
        assert_eq!(implementation.found.len(), 1);
        assert_eq!(implementation.found[0].address, addr(9));
        assert_eq!(implementation.found[0].contract_kind, "eip1967-proxy");

        // max_items 截断到前两个，零地址被忽略
        let plain = eval
            .evaluate(addr(1), &build, &kinds, RelationKind::Plain)
            .await
            .unwrap();
        assert_eq!(plain.found.len(), 1);
        assert_eq!(plain.found[0].index, Some(0));
        assert_eq!(plain.found[0].address, addr(10));
    }
}
