//! 运行级取消

use std::sync::Arc;
use tokio::sync::watch;

/// 取消令牌，克隆后共享同一状态
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// 等待取消
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // 发送端由令牌自身持有，不会先于接收端关闭
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }
}
