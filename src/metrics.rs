//! 性能指标收集模块
//!
//! 每个部署会话持有一份指标，记录导入、关系提取和遍历的计数

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 会话指标
#[derive(Debug)]
pub struct Metrics {
    /// 导入统计
    import_stats: ImportStats,
    /// 关系提取统计
    relation_stats: RelationStats,
    /// 遍历统计
    spider_stats: SpiderStats,
    /// 创建时间
    start_time: Instant,
}

/// 导入统计
#[derive(Debug, Default)]
struct ImportStats {
    /// 缓存命中数
    cache_hits: AtomicU64,
    /// 远程拉取次数（含重试）
    remote_fetches: AtomicU64,
    /// 重试次数
    retries: AtomicU64,
    /// 重试耗尽次数
    failures: AtomicU64,
}

/// 关系提取统计
#[derive(Debug, Default)]
struct RelationStats {
    evaluated: AtomicU64,
    discovered: AtomicU64,
    skipped: AtomicU64,
}

/// 遍历统计
#[derive(Debug, Default)]
struct SpiderStats {
    runs: AtomicU64,
    failed_runs: AtomicU64,
    nodes_visited: AtomicU64,
    total_duration_us: AtomicU64,
}

/// 可导出的指标快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    // 导入指标
    pub import_cache_hits: u64,
    pub import_remote_fetches: u64,
    pub import_retries: u64,
    pub import_failures: u64,
    pub import_cache_hit_rate: f64,

    // 关系指标
    pub relations_evaluated: u64,
    pub relations_discovered: u64,
    pub relations_skipped: u64,

    // 遍历指标
    pub spider_runs: u64,
    pub spider_failed_runs: u64,
    pub nodes_visited: u64,
    pub avg_run_duration_ms: f64,

    pub uptime_seconds: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            import_stats: ImportStats::default(),
            relation_stats: RelationStats::default(),
            spider_stats: SpiderStats::default(),
            start_time: Instant::now(),
        }
    }

    pub fn record_cache_hit(&self) {
        self.import_stats.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_fetch(&self) {
        self.import_stats.remote_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.import_stats.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_import_failure(&self) {
        self.import_stats.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relation_evaluated(&self) {
        self.relation_stats.evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relation_discovered(&self) {
        self.relation_stats.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relation_skipped(&self) {
        self.relation_stats.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_visited(&self) {
        self.spider_stats.nodes_visited.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录遍历开始
    pub fn record_run_start(&self) -> RunTimer {
        self.spider_stats.runs.fetch_add(1, Ordering::Relaxed);
        RunTimer::new()
    }

    /// 记录遍历结束
    pub fn record_run_complete(&self, timer: RunTimer, success: bool) {
        if !success {
            self.spider_stats.failed_runs.fetch_add(1, Ordering::Relaxed);
        }
        self.spider_stats
            .total_duration_us
            .fetch_add(timer.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.import_stats.cache_hits.load(Ordering::Relaxed);
        let fetches = self.import_stats.remote_fetches.load(Ordering::Relaxed);
        let runs = self.spider_stats.runs.load(Ordering::Relaxed);
        let total_duration_us = self.spider_stats.total_duration_us.load(Ordering::Relaxed);

        let hit_rate = if hits + fetches > 0 {
            (hits as f64) / ((hits + fetches) as f64)
        } else {
            0.0
        };

        let avg_run_duration_ms = if runs > 0 {
            (total_duration_us as f64) / (runs as f64) / 1000.0
        } else {
            0.0
        };

        MetricsSnapshot {
            import_cache_hits: hits,
            import_remote_fetches: fetches,
            import_retries: self.import_stats.retries.load(Ordering::Relaxed),
            import_failures: self.import_stats.failures.load(Ordering::Relaxed),
            import_cache_hit_rate: hit_rate,
            relations_evaluated: self.relation_stats.evaluated.load(Ordering::Relaxed),
            relations_discovered: self.relation_stats.discovered.load(Ordering::Relaxed),
            relations_skipped: self.relation_stats.skipped.load(Ordering::Relaxed),
            spider_runs: runs,
            spider_failed_runs: self.spider_stats.failed_runs.load(Ordering::Relaxed),
            nodes_visited: self.spider_stats.nodes_visited.load(Ordering::Relaxed),
            avg_run_duration_ms,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 遍历计时器
pub struct RunTimer {
    start: Instant,
}

impl RunTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        let timer = metrics.record_run_start();
        metrics.record_run_complete(timer, false);

        metrics.record_cache_hit();
        metrics.record_remote_fetch();
        metrics.record_remote_fetch();
        metrics.record_retry();
        metrics.record_relation_skipped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.spider_runs, 1);
        assert_eq!(snapshot.spider_failed_runs, 1);
        assert_eq!(snapshot.import_remote_fetches, 2);
        assert_eq!(snapshot.import_retries, 1);
        assert_eq!(snapshot.relations_skipped, 1);
        assert!((snapshot.import_cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
