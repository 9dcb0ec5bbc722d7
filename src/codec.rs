//! 访问器调用的 ABI 编解码
//!
//! 只覆盖关系提取需要的形状：零参数/单 uint256 参数的调用，返回地址或 uint256。
//! 访问器签名来自配置，选择器在运行时由 keccak256 计算。

use crate::types::{normalize_signature, Address};
use alloy::primitives::{keccak256, U256};
use alloy::sol_types::SolValue;

/// 函数选择器：keccak256(signature) 的前 4 字节
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(normalize_signature(signature).as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// 编码调用数据：选择器 + 32 字节参数字
pub fn encode_call(signature: &str, args: &[[u8; 32]]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&selector(signature));
    for arg in args {
        data.extend_from_slice(arg);
    }
    data
}

pub fn encode_uint(value: u64) -> [u8; 32] {
    U256::from(value).to_be_bytes::<32>()
}

/// 解码返回值中的第一个地址字，高位不为零时视为无法识别
pub fn decode_address(ret: &[u8]) -> Option<Address> {
    let word = ret.get(..32)?;
    alloy::primitives::Address::abi_decode(word, true)
        .ok()
        .map(Address::from)
}

/// 解码第一个 uint256 字，超过 u64 范围视为无法识别
pub fn decode_uint(ret: &[u8]) -> Option<u64> {
    let word = ret.get(..32)?;
    u64::try_from(U256::from_be_slice(word)).ok()
}
