//! 内存数据源（用于测试和本地演练）

use super::{RemoteResult, RemoteSource};
use crate::codec::{encode_call, encode_uint};
use crate::error::RemoteError;
use crate::types::{Address, BuildFile, StorageSlot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum CallOutcome {
    Return(Vec<u8>),
    Revert,
}

#[derive(Default)]
struct State {
    contracts: HashMap<(String, Address), BuildFile>,
    calls: HashMap<(Address, Vec<u8>), CallOutcome>,
    slots: HashMap<(Address, StorageSlot), StorageSlot>,
    /// 地址 -> (剩余失败次数, 错误)，`None` 次数表示永远失败
    fetch_failures: HashMap<Address, (Option<u32>, RemoteError)>,
    /// 地址 -> 所有只读调用和槽位读取返回的错误
    read_failures: HashMap<Address, RemoteError>,
    fetch_counts: HashMap<Address, u32>,
    call_count: u64,
}

/// 可编排的内存链状态
#[derive(Default)]
pub struct InMemorySource {
    state: Mutex<State>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册合约构建文件
    pub fn add_contract(&self, network: &str, address: Address, build: BuildFile) {
        self.state
            .lock()
            .contracts
            .insert((network.to_string(), address), build);
    }

    /// 设置零参数访问器的地址返回值
    pub fn set_address_call(&self, address: Address, signature: &str, result: Address) {
        self.set_raw_call(address, encode_call(signature, &[]), result.to_word().to_vec());
    }

    /// 设置 `item(uint256)` 形式访问器的返回值
    pub fn set_indexed_call(&self, address: Address, signature: &str, index: u64, result: Address) {
        self.set_raw_call(
            address,
            encode_call(signature, &[encode_uint(index)]),
            result.to_word().to_vec(),
        );
    }

    pub fn set_uint_call(&self, address: Address, signature: &str, value: u64) {
        self.set_raw_call(address, encode_call(signature, &[]), encode_uint(value).to_vec());
    }

    pub fn set_raw_call(&self, address: Address, calldata: Vec<u8>, ret: Vec<u8>) {
        self.state
            .lock()
            .calls
            .insert((address, calldata), CallOutcome::Return(ret));
    }

    pub fn set_revert(&self, address: Address, signature: &str) {
        self.state
            .lock()
            .calls
            .insert((address, encode_call(signature, &[])), CallOutcome::Revert);
    }

    pub fn set_slot(&self, address: Address, slot: StorageSlot, value: StorageSlot) {
        self.state.lock().slots.insert((address, slot), value);
    }

    /// 设置存储槽位为地址（右对齐）
    pub fn set_slot_address(&self, address: Address, slot: StorageSlot, value: Address) {
        self.set_slot(address, slot, StorageSlot::from(value.to_word()));
    }

    /// 构建文件拉取永远失败
    pub fn fail_fetch(&self, address: Address, error: RemoteError) {
        self.state
            .lock()
            .fetch_failures
            .insert(address, (None, error));
    }

    /// 前 `times` 次拉取失败，之后恢复正常
    pub fn fail_fetch_times(&self, address: Address, times: u32, error: RemoteError) {
        self.state
            .lock()
            .fetch_failures
            .insert(address, (Some(times), error));
    }

    /// 该地址上的调用和槽位读取永远失败（节点不可达）
    pub fn fail_reads(&self, address: Address, error: RemoteError) {
        self.state.lock().read_failures.insert(address, error);
    }

    /// 地址的构建文件被远程拉取的次数
    pub fn fetch_count(&self, address: Address) -> u32 {
        self.state
            .lock()
            .fetch_counts
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn call_count(&self) -> u64 {
        self.state.lock().call_count
    }
}

#[async_trait]
impl RemoteSource for InMemorySource {
    async fn fetch_build_file(&self, network: &str, address: Address) -> RemoteResult<BuildFile> {
        let mut state = self.state.lock();
        *state.fetch_counts.entry(address).or_insert(0) += 1;

        if let Some((remaining, error)) = state.fetch_failures.get_mut(&address) {
            match remaining {
                None => return Err(error.clone()),
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Err(error.clone());
                }
            }
        }

        state
            .contracts
            .get(&(network.to_string(), address))
            .cloned()
            .ok_or(RemoteError::NotVerified)
    }

    async fn call(&self, address: Address, calldata: &[u8]) -> RemoteResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.call_count += 1;
        if let Some(error) = state.read_failures.get(&address) {
            return Err(error.clone());
        }
        match state.calls.get(&(address, calldata.to_vec())) {
            Some(CallOutcome::Return(ret)) => Ok(ret.clone()),
            Some(CallOutcome::Revert) => Err(RemoteError::Reverted("execution reverted".to_string())),
            // 未编排的调用按空返回处理，与调用不存在函数的非回滚合约一致
            None => Ok(Vec::new()),
        }
    }

    async fn storage_at(&self, address: Address, slot: StorageSlot) -> RemoteResult<StorageSlot> {
        let state = self.state.lock();
        if let Some(error) = state.read_failures.get(&address) {
            return Err(error.clone());
        }
        Ok(state
            .slots
            .get(&(address, slot))
            .copied()
            .unwrap_or_else(StorageSlot::zero))
    }
}
