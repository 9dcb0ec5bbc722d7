//! 关系配置
//!
//! 描述如何从一个合约实例中提取相关地址：
//! - 合约类型按能力集识别（ABI 中包含所需签名），而不是按类型身份
//! - 每条规则声明提取方式（访问器调用、存储槽位、索引枚举）和别名策略
//! - 配置按网络划分，未配置的网络使用 default

mod eval;

pub use eval::{Discovered, RelationEvaluator, RelationSet, RelationSkip, SkipReason};

use crate::error::{Error, Result};
use crate::types::{BuildFile, StorageSlot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// EIP-1967 实现合约槽位: bytes32(uint256(keccak256('eip1967.proxy.implementation')) - 1)
pub const EIP1967_IMPLEMENTATION_SLOT: &str =
    "0x360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc";

/// 提取方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Extraction {
    /// 调用零参数访问器，返回值为地址
    Call { method: String },
    /// 读取存储槽位，低 20 字节为地址
    Slot { slot: StorageSlot },
    /// 调用 `count()` 得到数量，再逐个调用 `item(uint256)`
    Indexed {
        count: String,
        item: String,
        #[serde(default = "default_max_items")]
        max_items: u64,
    },
}

fn default_max_items() -> u64 {
    64
}

impl Extraction {
    /// 需要出现在 ABI 中的访问器签名
    pub fn required_signatures(&self) -> Vec<&str> {
        match self {
            Extraction::Call { method } => vec![method.as_str()],
            Extraction::Slot { .. } => Vec::new(),
            Extraction::Indexed { count, item, .. } => vec![count.as_str(), item.as_str()],
        }
    }
}

/// 关系种类
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// 普通关联，目标地址获得自己的别名
    #[default]
    Plain,
    /// 代理 -> 实现，记录为代理记录而非别名
    Implementation,
}

/// 别名策略
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasPolicy {
    /// 使用关系名，冲突时追加数字后缀
    #[default]
    Derived,
    /// 显式模板，支持 `{parent}` `{relation}` `{index}`，冲突即报错
    Template(String),
}

/// 关系规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRule {
    pub relation: String,
    pub extract: Extraction,
    #[serde(default)]
    pub kind: RelationKind,
    #[serde(default)]
    pub alias: AliasPolicy,
}

impl RelationRule {
    pub fn call(relation: &str, method: &str) -> Self {
        Self {
            relation: relation.to_string(),
            extract: Extraction::Call {
                method: method.to_string(),
            },
            kind: RelationKind::Plain,
            alias: AliasPolicy::Derived,
        }
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.alias = AliasPolicy::Template(template.to_string());
        self
    }

    pub fn as_implementation(mut self) -> Self {
        self.kind = RelationKind::Implementation;
        self
    }
}

/// 合约类型：按合约名或签名集合识别
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractKind {
    pub name: String,
    #[serde(default)]
    pub contract_names: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub relations: Vec<RelationRule>,
}

impl ContractKind {
    /// 合约名命中，或 ABI 包含全部所需签名；两者都未配置时匹配所有合约
    pub fn matches(&self, build: &BuildFile) -> bool {
        if self.contract_names.is_empty() && self.requires.is_empty() {
            return true;
        }
        if self.contract_names.iter().any(|n| *n == build.contract_name) {
            return true;
        }
        !self.requires.is_empty() && build.abi.has_all(&self.requires)
    }

    /// 通用的 EIP-1967 代理识别
    pub fn eip1967_proxy() -> Self {
        let slot = hex::decode(&EIP1967_IMPLEMENTATION_SLOT[2..])
            .ok()
            .filter(|b| b.len() == 32)
            .map(|b| StorageSlot::from_slice(&b))
            .unwrap_or_else(StorageSlot::zero);
        Self {
            name: "eip1967-proxy".to_string(),
            contract_names: Vec::new(),
            requires: Vec::new(),
            relations: vec![RelationRule {
                relation: "implementation".to_string(),
                extract: Extraction::Slot { slot },
                kind: RelationKind::Implementation,
                alias: AliasPolicy::Derived,
            }],
        }
    }
}

/// 各网络的关系配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationConfigSet {
    #[serde(default)]
    pub default: Vec<ContractKind>,
    #[serde(default)]
    pub networks: HashMap<String, Vec<ContractKind>>,
}

impl Default for RelationConfigSet {
    fn default() -> Self {
        Self {
            default: vec![ContractKind::eip1967_proxy()],
            networks: HashMap::new(),
        }
    }
}

impl RelationConfigSet {
    pub fn new(default: Vec<ContractKind>) -> Self {
        Self {
            default,
            networks: HashMap::new(),
        }
    }

    /// 网络专属配置优先，否则使用 default
    pub fn for_network(&self, network: &str) -> &[ContractKind] {
        self.networks
            .get(network)
            .map(Vec::as_slice)
            .unwrap_or(&self.default)
    }

    pub fn validate(&self) -> Result<()> {
        let all = self.default.iter().chain(self.networks.values().flatten());
        for kind in all {
            for rule in &kind.relations {
                validate_rule(&kind.name, rule)?;
            }
        }
        Ok(())
    }
}

fn validate_rule(kind: &str, rule: &RelationRule) -> Result<()> {
    let fail = |msg: String| Err(Error::ConfigError(format!("{}.{}: {}", kind, rule.relation, msg)));

    if rule.relation.is_empty() {
        return fail("关系名不能为空".to_string());
    }
    if let Extraction::Indexed { max_items, .. } = &rule.extract {
        if rule.kind == RelationKind::Implementation {
            return fail("implementation 关系不支持索引枚举".to_string());
        }
        if *max_items == 0 {
            return fail("max_items 必须大于 0".to_string());
        }
    }
    if let AliasPolicy::Template(template) = &rule.alias {
        let mut rest = template.as_str();
        while let Some(start) = rest.find('{') {
            let end = match rest[start..].find('}') {
                Some(end) => start + end,
                None => return fail(format!("模板 '{}' 缺少 '}}'", template)),
            };
            let name = &rest[start + 1..end];
            if !matches!(name, "parent" | "relation" | "index") {
                return fail(format!("模板 '{}' 含未知占位符 '{}'", template, name));
            }
            rest = &rest[end + 1..];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Abi, AbiEntry};

    fn build(name: &str, functions: &[&str]) -> BuildFile {
        let abi = Abi(functions
            .iter()
            .map(|f| AbiEntry {
                kind: "function".to_string(),
                name: f.to_string(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                state_mutability: None,
            })
            .collect());
        BuildFile::new(name, abi)
    }

    #[test]
    fn test_capability_matching() {
        let kind = ContractKind {
            name: "comet".to_string(),
            contract_names: vec!["CometProxy".to_string()],
            requires: vec!["baseToken()".to_string(), "governor()".to_string()],
            relations: Vec::new(),
        };

        assert!(kind.matches(&build("Comet", &["baseToken", "governor", "supply"])));
        assert!(kind.matches(&build("CometProxy", &[])));
        assert!(!kind.matches(&build("Comet", &["baseToken"])));
        assert!(ContractKind::eip1967_proxy().matches(&build("Anything", &[])));
    }

    #[test]
    fn test_config_json_shape() {
        let set: RelationConfigSet = serde_json::from_str(
            r#"{
                "default": [{
                    "name": "comet",
                    "requires": ["baseToken()"],
                    "relations": [
                        {"relation": "baseToken", "extract": {"type": "call", "method": "baseToken()"}},
                        {"relation": "treasury", "extract": {"type": "call", "method": "treasury()"},
                         "alias": {"template": "Treasury"}},
                        {"relation": "implementation", "kind": "implementation",
                         "extract": {"type": "slot", "slot": "0x360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc"}},
                        {"relation": "asset", "extract": {"type": "indexed", "count": "numAssets()", "item": "assets(uint256)"}}
                    ]
                }],
                "networks": {"fuji": []}
            }"#,
        )
        .unwrap();

        set.validate().unwrap();
        let rules = &set.for_network("mainnet")[0].relations;
        assert_eq!(rules[0].alias, AliasPolicy::Derived);
        assert_eq!(rules[1].alias, AliasPolicy::Template("Treasury".to_string()));
        assert_eq!(rules[2].kind, RelationKind::Implementation);
        assert_eq!(
            rules[3].extract,
            Extraction::Indexed {
                count: "numAssets()".to_string(),
                item: "assets(uint256)".to_string(),
                max_items: 64
            }
        );
        assert!(set.for_network("fuji").is_empty());
        assert_eq!(
            ContractKind::eip1967_proxy().relations[0].extract,
            rules[2].extract
        );
    }

    #[test]
    fn test_validate_rejects_bad_templates() {
        let set = RelationConfigSet::new(vec![ContractKind {
            name: "comet".to_string(),
            contract_names: Vec::new(),
            requires: Vec::new(),
            relations: vec![RelationRule::call("governor", "governor()").with_template("{owner}:gov")],
        }]);
        assert!(matches!(set.validate(), Err(Error::ConfigError(_))));

        let ok = RelationConfigSet::new(vec![ContractKind {
            name: "comet".to_string(),
            contract_names: Vec::new(),
            requires: Vec::new(),
            relations: vec![RelationRule::call("governor", "governor()").with_template("{parent}:{relation}")],
        }]);
        assert!(ok.validate().is_ok());
    }
}
