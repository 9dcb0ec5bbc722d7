//! Web3 特定类型和部署状态数据模型

use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 逻辑角色名称，例如 "Comet"、"USDC"
pub type Alias = String;

/// 存储槽位 (32 bytes)
pub type StorageSlot = H256;

/// 以太坊地址 (20 bytes)
///
/// 序列化为小写 `0x` 十六进制字符串，比较时大小写无关。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub H160);

impl Address {
    pub const ZERO: Address = Address(H160::zero());

    pub fn from_hex(s: &str) -> Result<Self, crate::Error> {
        let s = s.trim();
        let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| crate::Error::InvalidAddress(e.to_string()))?;
        if bytes.len() != 20 {
            return Err(crate::Error::InvalidAddress(format!(
                "地址长度应为 20 字节, 实际为 {} 字节",
                bytes.len()
            )));
        }
        Ok(Address(H160::from_slice(&bytes)))
    }

    /// 从 32 字节 ABI 字中取出地址，高 12 字节必须为零
    pub fn from_word(word: &[u8]) -> Option<Self> {
        if word.len() != 32 || word[..12].iter().any(|b| *b != 0) {
            return None;
        }
        Some(Address(H160::from_slice(&word[12..])))
    }

    /// ABI 编码为 32 字节字
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(self.0.as_bytes());
        word
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn to_hex(&self) -> String {
        format!("0x{:x}", self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<alloy::primitives::Address> for Address {
    fn from(address: alloy::primitives::Address) -> Self {
        Address(H160::from_slice(address.as_slice()))
    }
}

impl From<Address> for alloy::primitives::Address {
    fn from(address: Address) -> Self {
        alloy::primitives::Address::from_slice(address.as_bytes())
    }
}

impl FromStr for Address {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex(s)
    }
}

/// ABI 参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParam>,
}

impl AbiParam {
    /// 规范类型串，tuple 展开为 `(a,b)`
    fn canonical_type(&self) -> String {
        match self.kind.strip_prefix("tuple") {
            Some(suffix) => {
                let inner: Vec<String> = self.components.iter().map(|c| c.canonical_type()).collect();
                format!("({}){}", inner.join(","), suffix)
            }
            None => self.kind.clone(),
        }
    }
}

/// ABI 条目（函数、事件、构造函数等）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiEntry {
    #[serde(rename = "type", default = "default_entry_kind")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
    #[serde(
        rename = "stateMutability",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_mutability: Option<String>,
}

fn default_entry_kind() -> String {
    "function".to_string()
}

impl AbiEntry {
    pub fn is_function(&self) -> bool {
        self.kind == "function"
    }

    /// 函数签名，例如 `balanceOf(address)`
    pub fn signature(&self) -> String {
        let inputs: Vec<String> = self.inputs.iter().map(|p| p.canonical_type()).collect();
        format!("{}({})", self.name, inputs.join(","))
    }
}

/// 合约接口描述
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Abi(pub Vec<AbiEntry>);

impl Abi {
    pub fn functions(&self) -> impl Iterator<Item = &AbiEntry> {
        self.0.iter().filter(|e| e.is_function())
    }

    /// 按签名查找函数，签名中的空白会被忽略
    pub fn function(&self, signature: &str) -> Option<&AbiEntry> {
        let wanted = normalize_signature(signature);
        self.functions().find(|f| f.signature() == wanted)
    }

    pub fn has_function(&self, signature: &str) -> bool {
        self.function(signature).is_some()
    }

    /// 能力集匹配：是否包含全部签名
    pub fn has_all(&self, signatures: &[String]) -> bool {
        signatures.iter().all(|s| self.has_function(s))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn normalize_signature(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_whitespace()).collect()
}

/// 构建文件：地址的 ABI 与合约元数据，按 (network, address) 缓存且不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFile {
    pub contract_name: String,
    pub abi: Abi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_version: Option<String>,
}

impl BuildFile {
    pub fn new(contract_name: impl Into<String>, abi: Abi) -> Self {
        Self {
            contract_name: contract_name.into(),
            abi,
            compiler_version: None,
        }
    }
}

/// 代理记录：别名对应的地址是代理，调用时需使用实现合约的 ABI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub proxy: Address,
    pub implementation: Address,
    pub kind: String,
}

/// 别名 -> 地址
pub type AliasMap = BTreeMap<Alias, Address>;

/// 别名 -> 代理记录
pub type ProxyMap = BTreeMap<Alias, ProxyRecord>;

/// 遍历起点：别名 -> 地址
pub type Roots = BTreeMap<Alias, Address>;
