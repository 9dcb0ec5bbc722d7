//! 重试策略

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// 重试间隔的增长方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// 固定间隔
    Fixed,
    /// 每次乘以 factor，不超过 max_delay_ms
    Exponential { factor: u32, max_delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed
    }
}

/// 重试策略：首次尝试 + `retries` 次重试
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn delay_before(&self, retry: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential {
                factor,
                max_delay_ms,
            } => {
                let exp = retry.saturating_sub(1).min(31);
                let scaled = self
                    .delay
                    .saturating_mul(factor.saturating_pow(exp).max(1));
                scaled.min(Duration::from_millis(*max_delay_ms))
            }
        }
    }

    /// 执行带重试的远程操作
    ///
    /// `should_retry` 返回 false 的错误立即返回。失败时返回 (尝试次数, 最后错误)。
    pub async fn run<T, F, Fut, R>(
        &self,
        mut op: F,
        should_retry: R,
    ) -> Result<T, (u32, RemoteError)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
        R: Fn(&RemoteError) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts() && should_retry(&e) => {
                    let delay = self.delay_before(attempt);
                    debug!(attempt, ?delay, error = %e, "retrying remote call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(2000))
    }
}
