use crate::config::HealthConfig;
use crate::types::{DropReason, MessagePriority, ProcessingStats, StatsCounters};

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // 每个线程固定写入一个分片，减少工作者之间的锁竞争
    static SHARD_HINT: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
}

/// 降级判定阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub drop_rate: f64,
    pub latency_ceiling: Duration,
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            drop_rate: config.degraded_drop_rate_threshold,
            latency_ceiling: config.degraded_latency_ceiling,
        }
    }
}

/// 准入控制读取的负载快照（基于最近一个完整窗口）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSnapshot {
    pub drop_rate: f64,
    pub mean_latency: Duration,
    pub degraded: bool,
}

impl LoadSnapshot {
    pub fn healthy() -> Self {
        Self {
            drop_rate: 0.0,
            mean_latency: Duration::ZERO,
            degraded: false,
        }
    }

    pub fn degraded() -> Self {
        Self {
            drop_rate: 1.0,
            mean_latency: Duration::ZERO,
            degraded: true,
        }
    }
}

/// 健康状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl HealthStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
        }
    }
}

/// 判定为降级的具体原因
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DegradedReason {
    DropRate { rate: f64, threshold: f64 },
    Latency { mean: Duration, ceiling: Duration },
}

/// 健康检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub drop_rate: f64,
    pub mean_latency: Duration,
    pub reasons: SmallVec<[DegradedReason; 2]>,
}

impl HealthReport {
    /// 基于一个完整窗口计算健康状态；没有窗口时视为健康
    pub fn evaluate(window: Option<&ProcessingStats>, thresholds: &HealthThresholds) -> Self {
        let (drop_rate, mean_latency) = window
            .map(|stats| (stats.drop_rate(), stats.mean_latency()))
            .unwrap_or((0.0, Duration::ZERO));

        let mut reasons = SmallVec::new();
        if drop_rate > thresholds.drop_rate {
            reasons.push(DegradedReason::DropRate {
                rate: drop_rate,
                threshold: thresholds.drop_rate,
            });
        }
        if mean_latency > thresholds.latency_ceiling {
            reasons.push(DegradedReason::Latency {
                mean: mean_latency,
                ceiling: thresholds.latency_ceiling,
            });
        }

        let status = if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            drop_rate,
            mean_latency,
            reasons,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.status == HealthStatus::Degraded
    }

    pub fn load(&self) -> LoadSnapshot {
        LoadSnapshot {
            drop_rate: self.drop_rate,
            mean_latency: self.mean_latency,
            degraded: self.is_degraded(),
        }
    }
}

/// 统计快照：最近完整窗口 + 当前部分窗口
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub last_complete: Option<ProcessingStats>,
    pub current: ProcessingStats,
    /// 启动（或重置）以来的累计值，含当前窗口
    pub lifetime: StatsCounters,
    pub windows_completed: u64,
    pub health: HealthReport,
}

impl StatsSnapshot {
    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }
}

struct WindowArchive {
    started_at: Instant,
    last_complete: Option<ProcessingStats>,
    history: VecDeque<ProcessingStats>,
    history_len: usize,
    lifetime: StatsCounters,
    windows_completed: u64,
}

/// 性能监控器
///
/// 计数写入按线程分片；窗口轮换与快照会一次性锁住所有分片，
/// 所以任何读取都不会看到同一事件的一半计数。
pub struct PerformanceMonitor {
    shards: Box<[CachePadded<Mutex<StatsCounters>>]>,
    archive: Mutex<WindowArchive>,
    epoch: Instant,
    window_started_ns: AtomicU64,
    window_duration: Duration,
    thresholds: HealthThresholds,
    load: RwLock<Option<LoadSnapshot>>,
}

impl PerformanceMonitor {
    /// 创建新的性能监控器
    pub fn new(config: &HealthConfig) -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            * 2;
        let shards = (0..shard_count)
            .map(|_| CachePadded::new(Mutex::new(StatsCounters::default())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let epoch = Instant::now();

        Self {
            shards,
            archive: Mutex::new(WindowArchive {
                started_at: epoch,
                last_complete: None,
                history: VecDeque::with_capacity(config.history_len),
                history_len: config.history_len.max(1),
                lifetime: StatsCounters::default(),
                windows_completed: 0,
            }),
            epoch,
            window_started_ns: AtomicU64::new(0),
            window_duration: config.window_duration,
            thresholds: HealthThresholds::from(config),
            load: RwLock::new(None),
        }
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// 记录处理完成的消息
    pub fn record_processed(&self, priority: MessagePriority, latency: Duration) {
        self.roll_if_due(Instant::now());
        self.shard().lock().record_processed(priority, latency);

        // 如果处理时间过长，记录警告
        if latency > self.thresholds.latency_ceiling {
            warn!(
                "Slow message processing detected: {:.2}ms ({} priority)",
                latency.as_secs_f64() * 1000.0,
                priority
            );
        }
    }

    /// 记录丢弃的消息
    pub fn record_dropped(&self, reason: DropReason, priority: MessagePriority) {
        self.roll_if_due(Instant::now());
        self.shard().lock().record_dropped(reason, priority);
        debug!("Message dropped: reason={}, priority={}", reason.as_str(), priority);
    }

    /// 准入控制使用的负载快照；尚无完整窗口时返回 None
    pub fn load_snapshot(&self) -> Option<LoadSnapshot> {
        self.roll_if_due(Instant::now());
        *self.load.read()
    }

    /// 获取统计快照
    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let mut archive = self.archive.lock();
        let closed = self.rollover_locked(&mut archive, now);

        let mut current = StatsCounters::default();
        for shard in self.shards.iter() {
            current.merge(&shard.lock());
        }

        let mut lifetime = archive.lifetime;
        lifetime.merge(&current);

        let snapshot = StatsSnapshot {
            health: HealthReport::evaluate(archive.last_complete.as_ref(), &self.thresholds),
            last_complete: archive.last_complete.clone(),
            current: ProcessingStats::new(
                current,
                archive.started_at,
                now.saturating_duration_since(archive.started_at),
            ),
            lifetime,
            windows_completed: archive.windows_completed,
        };
        drop(archive);

        if let Some((stats, report)) = closed {
            log_window_closed(snapshot.windows_completed, &stats, &report);
        }
        snapshot
    }

    /// 获取性能健康状态（基于最近完整窗口）
    pub fn health(&self) -> HealthReport {
        self.roll_if_due(Instant::now());
        let archive = self.archive.lock();
        HealthReport::evaluate(archive.last_complete.as_ref(), &self.thresholds)
    }

    /// 已完成窗口的历史（从旧到新）
    pub fn history(&self) -> Vec<ProcessingStats> {
        self.roll_if_due(Instant::now());
        self.archive.lock().history.iter().cloned().collect()
    }

    /// 重置统计信息
    pub fn reset(&self) {
        let now = Instant::now();
        let mut archive = self.archive.lock();
        for shard in self.shards.iter() {
            *shard.lock() = StatsCounters::default();
        }
        self.window_started_ns
            .store(self.nanos_since_epoch(now), Ordering::Release);

        archive.started_at = now;
        archive.last_complete = None;
        archive.history.clear();
        archive.lifetime = StatsCounters::default();
        archive.windows_completed = 0;
        *self.load.write() = None;

        info!("Performance statistics reset");
    }

    fn shard(&self) -> &Mutex<StatsCounters> {
        let hint = SHARD_HINT.with(|hint| *hint);
        &self.shards[hint % self.shards.len()]
    }

    fn nanos_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn window_due(&self, now: Instant) -> bool {
        let started = self.window_started_ns.load(Ordering::Acquire);
        let elapsed = self.nanos_since_epoch(now).saturating_sub(started);
        elapsed >= self.window_duration.as_nanos() as u64
    }

    fn roll_if_due(&self, now: Instant) {
        if !self.window_due(now) {
            return;
        }

        let (closed, sequence) = {
            let mut archive = self.archive.lock();
            let closed = self.rollover_locked(&mut archive, now);
            (closed, archive.windows_completed)
        };

        if let Some((stats, report)) = closed {
            log_window_closed(sequence, &stats, &report);
        }
    }

    /// 归档当前窗口并开启新窗口；调用方持有 archive 锁
    fn rollover_locked(
        &self,
        archive: &mut WindowArchive,
        now: Instant,
    ) -> Option<(ProcessingStats, HealthReport)> {
        if !self.window_due(now) {
            return None;
        }

        let mut counters = StatsCounters::default();
        {
            let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
            for guard in guards.iter_mut() {
                counters.merge(&std::mem::take(&mut **guard));
            }
            self.window_started_ns
                .store(self.nanos_since_epoch(now), Ordering::Release);
        }

        let stats = ProcessingStats::new(
            counters,
            archive.started_at,
            now.saturating_duration_since(archive.started_at),
        );
        archive.started_at = now;
        archive.lifetime.merge(&counters);
        archive.windows_completed += 1;
        if archive.history.len() >= archive.history_len {
            archive.history.pop_front();
        }
        archive.history.push_back(stats.clone());
        archive.last_complete = Some(stats.clone());

        let report = HealthReport::evaluate(Some(&stats), &self.thresholds);
        *self.load.write() = Some(report.load());

        Some((stats, report))
    }
}

fn log_window_closed(sequence: u64, stats: &ProcessingStats, report: &HealthReport) {
    debug!(
        "Window #{} closed - Received: {}, Processed: {}, Dropped: {}, Mean latency: {}μs",
        sequence,
        stats.received(),
        stats.processed(),
        stats.dropped(),
        stats.mean_latency().as_micros()
    );

    if report.is_degraded() {
        warn!(
            "Window #{} degraded: drop rate {:.2}%, mean latency {}μs, reasons {:?}",
            sequence,
            report.drop_rate * 100.0,
            report.mean_latency.as_micros(),
            report.reasons
        );
    }
}

/// 生成健康报告任务，按固定间隔输出最近完整窗口的统计
pub fn spawn_health_reporter(
    monitor: Arc<PerformanceMonitor>,
    interval: Duration,
    is_running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Started health reporter");

        while is_running.load(Ordering::Acquire) {
            sleep(interval).await;

            let snapshot = monitor.snapshot();
            if let Some(ref window) = snapshot.last_complete {
                info!(
                    "Performance Report - Received: {}, Processed: {}, Dropped: {} \
                     (sampling {}, priority {}, duplicate {}, error {}), Drop Rate: {:.2}%, \
                     Avg Latency: {}μs, Max Latency: {}μs, Processing Rate: {:.1} msg/s, Health: {}",
                    window.received(),
                    window.processed(),
                    window.dropped(),
                    window.dropped_sampling(),
                    window.dropped_priority(),
                    window.dropped_duplicate(),
                    window.dropped_error(),
                    window.drop_rate() * 100.0,
                    window.mean_latency().as_micros(),
                    window.max_latency().as_micros(),
                    window.throughput(),
                    snapshot.health.status.as_str()
                );
            }
        }

        info!("Health reporter stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    fn config(window: Duration) -> HealthConfig {
        HealthConfig {
            degraded_drop_rate_threshold: 0.1,
            degraded_latency_ceiling: Duration::from_millis(10),
            window_duration: window,
            history_len: 4,
            report_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_performance_monitor() {
        let monitor = PerformanceMonitor::new(&config(Duration::from_secs(60)));

        monitor.record_processed(MessagePriority::Critical, Duration::from_micros(500));
        monitor.record_dropped(DropReason::Sampling, MessagePriority::Low);

        let snapshot = monitor.snapshot();
        assert!(snapshot.last_complete.is_none());
        assert_eq!(snapshot.windows_completed, 0);
        assert_eq!(snapshot.current.received(), 2);
        assert_eq!(snapshot.current.processed(), 1);
        assert_eq!(snapshot.current.dropped_sampling(), 1);
        assert_eq!(snapshot.current.mean_latency(), Duration::from_micros(500));
        assert_eq!(snapshot.lifetime.total().received, 2);
    }

    #[test]
    fn test_no_completed_window_reads_as_unavailable() {
        let monitor = PerformanceMonitor::new(&config(Duration::from_secs(60)));
        for _ in 0..10 {
            monitor.record_dropped(DropReason::Error(ErrorKind::Transport), MessagePriority::Normal);
        }

        assert!(monitor.load_snapshot().is_none());
        assert_eq!(monitor.health().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_status_latency() {
        let monitor = PerformanceMonitor::new(&config(Duration::from_millis(20)));

        // 初始状态应该是健康的
        assert_eq!(monitor.health().status, HealthStatus::Healthy);

        for _ in 0..20 {
            monitor.record_processed(MessagePriority::Normal, Duration::from_millis(25));
        }
        std::thread::sleep(Duration::from_millis(30));

        let report = monitor.health();
        assert!(report.is_degraded());
        assert!(matches!(report.reasons[0], DegradedReason::Latency { .. }));
        assert!(monitor.load_snapshot().unwrap().degraded);
    }

    #[test]
    fn test_health_status_drop_rate() {
        let monitor = PerformanceMonitor::new(&config(Duration::from_millis(20)));

        for _ in 0..8 {
            monitor.record_processed(MessagePriority::Normal, Duration::from_micros(50));
        }
        for _ in 0..2 {
            monitor.record_dropped(DropReason::Sampling, MessagePriority::Low);
        }
        std::thread::sleep(Duration::from_millis(30));

        let snapshot = monitor.snapshot();
        let window = snapshot.last_complete.as_ref().unwrap();
        assert_eq!(window.received(), 10);
        assert!((snapshot.health.drop_rate - 0.2).abs() < 1e-9);
        assert!(snapshot.is_degraded());
        assert!(matches!(
            snapshot.health.reasons.as_slice(),
            [DegradedReason::DropRate { .. }]
        ));
    }

    #[test]
    fn test_idle_window_clears_degraded_state() {
        let monitor = PerformanceMonitor::new(&config(Duration::from_millis(20)));
        for _ in 0..5 {
            monitor.record_dropped(DropReason::Error(ErrorKind::Transport), MessagePriority::Normal);
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(monitor.load_snapshot().unwrap().degraded);

        std::thread::sleep(Duration::from_millis(30));
        let load = monitor.load_snapshot().unwrap();
        assert!(!load.degraded);
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = PerformanceMonitor::new(&config(Duration::from_millis(5)));
        for _ in 0..6 {
            monitor.record_processed(MessagePriority::Low, Duration::from_micros(10));
            std::thread::sleep(Duration::from_millis(8));
        }

        let history = monitor.history();
        assert_eq!(history.len(), 4);
        assert!(monitor.snapshot().windows_completed >= 6);
    }

    #[test]
    fn test_reset() {
        let monitor = PerformanceMonitor::new(&config(Duration::from_millis(50)));
        monitor.record_processed(MessagePriority::Normal, Duration::from_micros(10));
        std::thread::sleep(Duration::from_millis(60));
        monitor.record_processed(MessagePriority::Normal, Duration::from_micros(10));
        assert!(monitor.load_snapshot().is_some());

        monitor.reset();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.current.received(), 0);
        assert_eq!(snapshot.lifetime.total().received, 0);
        assert!(snapshot.last_complete.is_none());
        assert!(monitor.load_snapshot().is_none());
    }
}
