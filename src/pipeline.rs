use crate::admission::{AdmissionController, AdmissionDecision};
use crate::config::{ProcessorConfig, ValidationConfig};
use crate::error::{Result, SerializationError, TransportError, ValidationError, VehicleError};
use crate::performance::PerformanceMonitor;
use crate::transport::{PayloadSink, TransportAdapter};
use crate::types::*;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 单条消息在流水线中的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    Received,
    Validated,
    AdmissionChecked,
    Serialized,
    Dispatched,
}

/// 已接受消息仍然失败的原因
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    Serialization(SerializationError),
    Transport(TransportError),
}

/// 一次流水线处理的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Dispatched {
        fingerprint: Fingerprint,
        latency: Duration,
    },
    Rejected(ValidationError),
    Dropped(DropReason),
    Failed(FailureCause),
    Cancelled {
        stage: PipelineStage,
    },
}

impl ProcessingOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, ProcessingOutcome::Dispatched { .. })
    }

    /// 该结果在统计中归入的丢弃原因；成功发送时为 None
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            ProcessingOutcome::Dispatched { .. } => None,
            ProcessingOutcome::Rejected(_) => Some(DropReason::Error(ErrorKind::Validation)),
            ProcessingOutcome::Dropped(reason) => Some(*reason),
            ProcessingOutcome::Failed(FailureCause::Serialization(_)) => {
                Some(DropReason::Error(ErrorKind::Serialization))
            }
            ProcessingOutcome::Failed(FailureCause::Transport(_)) => {
                Some(DropReason::Error(ErrorKind::Transport))
            }
            ProcessingOutcome::Cancelled { .. } => Some(DropReason::Error(ErrorKind::Cancelled)),
        }
    }

    /// 转换为 Result：发送成功返回指纹，按策略丢弃返回 None，错误返回 Err
    pub fn into_result(self) -> Result<Option<Fingerprint>> {
        match self {
            ProcessingOutcome::Dispatched { fingerprint, .. } => Ok(Some(fingerprint)),
            ProcessingOutcome::Dropped(_) => Ok(None),
            ProcessingOutcome::Rejected(e) => Err(e.into()),
            ProcessingOutcome::Failed(FailureCause::Serialization(e)) => Err(e.into()),
            ProcessingOutcome::Failed(FailureCause::Transport(e)) => Err(e.into()),
            ProcessingOutcome::Cancelled { .. } => Err(VehicleError::ServiceStopped),
        }
    }
}

/// 基于指纹的去重缓存 (fingerprint -> last_seen_time)
pub struct DedupCache {
    seen: DashMap<Fingerprint, Instant>,
    window: Duration,
    capacity: usize,
}

impl DedupCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            seen: DashMap::new(),
            window,
            capacity,
        }
    }

    /// 检查是否为重复消息，并记录本次出现时间
    pub fn check_and_insert(&self, fingerprint: Fingerprint, now: Instant) -> bool {
        let duplicate = match self.seen.entry(fingerprint) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) < self.window {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        };

        if !duplicate && self.seen.len() > self.capacity {
            self.purge_expired(now);
            if self.seen.len() > self.capacity {
                warn!("Dedup cache over capacity ({}), clearing", self.capacity);
                self.seen.clear();
            }
        }
        duplicate
    }

    /// 撤销一次记录；发送失败的消息允许调用方在窗口内重试
    pub fn forget(&self, fingerprint: &Fingerprint) {
        self.seen.remove(fingerprint);
    }

    /// 清理过期条目，返回清理数量
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) < self.window);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// 发送开始后即使调用方放弃 future，结果也必须计入统计
struct DispatchGuard<'a> {
    monitor: &'a PerformanceMonitor,
    dedup: Option<&'a DedupCache>,
    fingerprint: Fingerprint,
    priority: MessagePriority,
    armed: bool,
}

impl DispatchGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Dispatch abandoned before completion ({} priority)", self.priority);
            if let Some(dedup) = self.dedup {
                dedup.forget(&self.fingerprint);
            }
            self.monitor
                .record_dropped(DropReason::Error(ErrorKind::Transport), self.priority);
        }
    }
}

/// 消息处理流水线：校验 → 准入 → 序列化 → 发送
pub struct MessagePipeline {
    validation: ValidationConfig,
    rules: PriorityRules,
    admission: AdmissionController,
    monitor: Arc<PerformanceMonitor>,
    transport: Arc<TransportAdapter>,
    dedup: Option<DedupCache>,
    topic_prefix: String,
    cancelled: AtomicBool,
}

impl MessagePipeline {
    /// 创建流水线；配置不合法时返回 ConfigError
    pub fn new(
        config: &ProcessorConfig,
        monitor: Arc<PerformanceMonitor>,
        transport: Arc<TransportAdapter>,
    ) -> Result<Self> {
        config.validate()?;

        let dedup = config
            .ingress
            .dedup_window
            .map(|window| DedupCache::new(window, config.ingress.dedup_capacity));

        Ok(Self {
            validation: config.validation.clone(),
            rules: config.priority_rules.clone(),
            admission: AdmissionController::new(&config.sampling),
            monitor,
            transport,
            dedup,
            topic_prefix: config.transport.topic_prefix.clone(),
            cancelled: AtomicBool::new(false),
        })
    }

    /// 以给定发布端构建监控器、传输适配器和流水线
    pub fn with_sink(config: &ProcessorConfig, sink: Arc<dyn PayloadSink>) -> Result<Self> {
        config.validate()?;
        let monitor = Arc::new(PerformanceMonitor::new(&config.health));
        let transport = Arc::new(TransportAdapter::new(config.transport.clone(), sink));
        Self::new(config, monitor, transport)
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn transport(&self) -> &Arc<TransportAdapter> {
        &self.transport
    }

    pub fn rules(&self) -> &PriorityRules {
        &self.rules
    }

    pub fn dedup(&self) -> Option<&DedupCache> {
        self.dedup.as_ref()
    }

    /// 取消后续处理；已经开始发送的消息不受影响
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 校验结构与时间戳偏差；`now` 为处理时间（Unix 秒）
    pub fn validate(
        &self,
        message: &VehicleMessage,
        now: f64,
    ) -> std::result::Result<(), ValidationError> {
        if message.message_type.trim().is_empty() {
            return Err(ValidationError::EmptyMessageType);
        }
        if message.vehicle_id.trim().is_empty() {
            return Err(ValidationError::EmptyVehicleId);
        }
        if !message.timestamp.is_finite() || message.timestamp < 0.0 {
            return Err(ValidationError::InvalidTimestamp(message.timestamp));
        }

        let tolerance = self.validation.timestamp_skew_tolerance.as_secs_f64();
        let ahead = message.timestamp - now;
        if ahead > tolerance {
            return Err(ValidationError::TimestampInFuture {
                ahead_secs: ahead,
                tolerance_secs: tolerance,
            });
        }

        let entries = message.payload_entries();
        if entries > self.validation.max_payload_entries {
            return Err(ValidationError::PayloadTooLarge {
                entries,
                limit: self.validation.max_payload_entries,
            });
        }
        let depth = message.payload_depth();
        if depth > self.validation.max_payload_depth {
            return Err(ValidationError::PayloadTooDeep {
                depth,
                limit: self.validation.max_payload_depth,
            });
        }
        Ok(())
    }

    /// 解析入站字节
    pub fn decode(&self, raw: &[u8]) -> std::result::Result<VehicleMessage, ValidationError> {
        if raw.len() > self.validation.max_raw_bytes {
            return Err(ValidationError::RawMessageTooLarge {
                size: raw.len(),
                limit: self.validation.max_raw_bytes,
            });
        }
        VehicleMessage::from_slice(raw)
    }

    /// 记录一条在进入流水线前就被拒绝的消息
    pub fn reject(&self, error: ValidationError, priority: MessagePriority) -> ProcessingOutcome {
        self.monitor
            .record_dropped(DropReason::Error(ErrorKind::Validation), priority);
        debug!("Message rejected: {}", error);
        ProcessingOutcome::Rejected(error)
    }

    /// 处理入站字节：解析后走完整流水线
    pub async fn process_bytes(&self, raw: &[u8]) -> ProcessingOutcome {
        match self.decode(raw) {
            Ok(message) => self.process(message).await,
            Err(e) => self.reject(e, MessagePriority::default()),
        }
    }

    /// 处理一条消息
    pub async fn process(&self, mut message: VehicleMessage) -> ProcessingOutcome {
        let started = Instant::now();
        let priority = message.classify(&self.rules);

        // Received -> Validated
        if let Err(e) = self.validate(&message, unix_timestamp()) {
            return self.reject(e, priority);
        }
        if let Some(outcome) = self.check_cancelled(PipelineStage::Validated, priority) {
            return outcome;
        }

        // Validated -> AdmissionChecked
        let load = self.monitor.load_snapshot();
        match self.admission.decide(&message, load.as_ref()) {
            AdmissionDecision::Accept => {}
            AdmissionDecision::DropSampling => {
                self.monitor.record_dropped(DropReason::Sampling, priority);
                return ProcessingOutcome::Dropped(DropReason::Sampling);
            }
            AdmissionDecision::DropPriority => {
                self.monitor.record_dropped(DropReason::Priority, priority);
                return ProcessingOutcome::Dropped(DropReason::Priority);
            }
        }
        if let Some(outcome) = self.check_cancelled(PipelineStage::AdmissionChecked, priority) {
            return outcome;
        }

        // AdmissionChecked -> Serialized
        let payload = match message.to_canonical_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                self.monitor
                    .record_dropped(DropReason::Error(ErrorKind::Serialization), priority);
                warn!(
                    "Serialization failed: type={}, vehicle={}, error={}",
                    message.message_type, message.vehicle_id, e
                );
                return ProcessingOutcome::Failed(FailureCause::Serialization(e));
            }
        };
        let fingerprint = Fingerprint::of(&payload);

        if let Some(outcome) = self.check_cancelled(PipelineStage::Serialized, priority) {
            return outcome;
        }
        if let Some(ref dedup) = self.dedup {
            if dedup.check_and_insert(fingerprint, started) {
                self.monitor.record_dropped(DropReason::Duplicate, priority);
                debug!("Duplicate message dropped: {:016x}", fingerprint.short());
                return ProcessingOutcome::Dropped(DropReason::Duplicate);
            }
        }

        // Serialized -> Dispatched，发送开始后不可取消
        let topic = self.topic_for(&message);
        let guard = DispatchGuard {
            monitor: self.monitor.as_ref(),
            dedup: self.dedup.as_ref(),
            fingerprint,
            priority,
            armed: true,
        };
        let result = self.transport.send(&topic, payload).await;
        guard.disarm();

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                self.monitor.record_processed(priority, latency);
                debug!(
                    "Dispatched {} message: topic={}, vehicle={}, latency={}μs",
                    priority,
                    topic,
                    message.vehicle_id,
                    latency.as_micros()
                );
                ProcessingOutcome::Dispatched {
                    fingerprint,
                    latency,
                }
            }
            Err(e) => {
                if let Some(ref dedup) = self.dedup {
                    dedup.forget(&fingerprint);
                }
                self.monitor
                    .record_dropped(DropReason::Error(ErrorKind::Transport), priority);
                warn!(
                    "Dispatch failed: topic={}, vehicle={}, error={} ({})",
                    topic,
                    message.vehicle_id,
                    e,
                    e.kind()
                );
                ProcessingOutcome::Failed(FailureCause::Transport(e))
            }
        }
    }

    fn check_cancelled(
        &self,
        stage: PipelineStage,
        priority: MessagePriority,
    ) -> Option<ProcessingOutcome> {
        if !self.is_cancelled() {
            return None;
        }
        self.monitor
            .record_dropped(DropReason::Error(ErrorKind::Cancelled), priority);
        Some(ProcessingOutcome::Cancelled { stage })
    }

    fn topic_for(&self, message: &VehicleMessage) -> String {
        if self.topic_prefix.is_empty() {
            message.message_type.clone()
        } else {
            format!("{}{}", self.topic_prefix, message.message_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemorySink;

    fn config() -> ProcessorConfig {
        let mut config = ProcessorConfig::default();
        config.sampling.seed = Some(11);
        config.health.window_duration = Duration::from_secs(60);
        config
    }

    async fn connected_pipeline(config: &ProcessorConfig) -> (Arc<MemorySink>, MessagePipeline) {
        let sink = Arc::new(MemorySink::new());
        let pipeline = MessagePipeline::with_sink(config, sink.clone()).unwrap();
        pipeline.transport().connect().await.unwrap();
        (sink, pipeline)
    }

    fn tracking(now: f64) -> VehicleMessage {
        VehicleMessage::new("tracking", "TEST_VIN_123", now)
            .with_field("x", 1.0)
            .with_field("y", 2.0)
    }

    #[test]
    fn test_invalid_config_prevents_start() {
        let mut config = config();
        config.sampling.normal_rate = 1.2;
        let result = MessagePipeline::with_sink(&config, Arc::new(MemorySink::new()));
        assert!(matches!(result, Err(VehicleError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let (sink, pipeline) = connected_pipeline(&config()).await;
        let message = tracking(unix_timestamp());
        let expected = message.fingerprint_with(pipeline.rules()).unwrap();

        let outcome = pipeline.process(message).await;
        match outcome {
            ProcessingOutcome::Dispatched { fingerprint, .. } => assert_eq!(fingerprint, expected),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tracking");

        let stats = pipeline.monitor().snapshot().current;
        assert_eq!(stats.received(), 1);
        assert_eq!(stats.processed(), 1);
        assert_eq!(stats.for_priority(MessagePriority::Critical).processed, 1);
    }

    #[tokio::test]
    async fn test_validation_rejections() {
        let (sink, pipeline) = connected_pipeline(&config()).await;
        let now = unix_timestamp();

        let cases = vec![
            (VehicleMessage::new("", "VIN", now), ValidationError::EmptyMessageType),
            (VehicleMessage::new("tracking", " ", now), ValidationError::EmptyVehicleId),
            (
                VehicleMessage::new("tracking", "VIN", -1.0),
                ValidationError::InvalidTimestamp(-1.0),
            ),
        ];
        for (message, expected) in cases {
            assert_eq!(pipeline.process(message).await, ProcessingOutcome::Rejected(expected));
        }

        let future = VehicleMessage::new("tracking", "VIN", now + 3600.0);
        assert!(matches!(
            pipeline.process(future).await,
            ProcessingOutcome::Rejected(ValidationError::TimestampInFuture { .. })
        ));

        let stats = pipeline.monitor().snapshot().current;
        assert_eq!(stats.received(), 4);
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.dropped_error(), 4);
        assert_eq!(stats.errors().validation, 4);
        assert_eq!(sink.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_payload_limits() {
        let mut config = config();
        config.validation.max_payload_entries = 3;
        config.validation.max_payload_depth = 2;
        let (_sink, pipeline) = connected_pipeline(&config).await;
        let now = unix_timestamp();

        let wide = VehicleMessage::new("vcc", "VIN", now)
            .with_field("a", 1)
            .with_field("b", 2)
            .with_field("c", 3)
            .with_field("d", 4);
        assert!(matches!(
            pipeline.process(wide).await,
            ProcessingOutcome::Rejected(ValidationError::PayloadTooLarge { entries: 4, limit: 3 })
        ));

        let deep = VehicleMessage::new("vcc", "VIN", now)
            .with_field("a", vec![PayloadValue::List(vec![1.into()])]);
        assert!(matches!(
            pipeline.process(deep).await,
            ProcessingOutcome::Rejected(ValidationError::PayloadTooDeep { depth: 3, limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_small_skew_accepted() {
        let (_sink, pipeline) = connected_pipeline(&config()).await;
        let message = tracking(unix_timestamp() + 1.0);
        assert!(pipeline.process(message).await.is_dispatched());
    }

    #[tokio::test]
    async fn test_serialization_failure_counted_separately() {
        let (sink, pipeline) = connected_pipeline(&config()).await;
        let message = tracking(unix_timestamp()).with_field("speed", f64::INFINITY);

        let outcome = pipeline.process(message).await;
        assert!(matches!(
            outcome,
            ProcessingOutcome::Failed(FailureCause::Serialization(SerializationError::NonFiniteNumber { .. }))
        ));
        assert!(matches!(outcome.into_result(), Err(VehicleError::Serialization(_))));

        let stats = pipeline.monitor().snapshot().current;
        assert_eq!(stats.dropped_error(), 1);
        assert_eq!(stats.errors().serialization, 1);
        assert_eq!(stats.errors().validation, 0);
        assert_eq!(stats.dropped_sampling(), 0);
        assert_eq!(sink.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_surfaced() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = MessagePipeline::with_sink(&config(), sink.clone()).unwrap();

        let outcome = pipeline.process(tracking(unix_timestamp())).await;
        assert_eq!(
            outcome,
            ProcessingOutcome::Failed(FailureCause::Transport(TransportError::NotConnected))
        );

        let stats = pipeline.monitor().snapshot().current;
        assert_eq!(stats.errors().transport, 1);
        assert_eq!(stats.dropped_sampling(), 0);
        assert_eq!(stats.dropped_priority(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_between_stages() {
        let (sink, pipeline) = connected_pipeline(&config()).await;
        pipeline.cancel();

        let outcome = pipeline.process(tracking(unix_timestamp())).await;
        assert_eq!(
            outcome,
            ProcessingOutcome::Cancelled {
                stage: PipelineStage::Validated
            }
        );
        assert_eq!(sink.sent_count(), 0);
        assert_eq!(pipeline.monitor().snapshot().current.errors().cancelled, 1);
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_still_recorded() {
        let (sink, pipeline) = connected_pipeline(&config()).await;
        sink.set_send_delay(Some(Duration::from_millis(40)));

        let pending = pipeline.process(tracking(unix_timestamp()));
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;

        let stats = pipeline.monitor().snapshot().current;
        assert_eq!(stats.received(), 1);
        assert_eq!(stats.errors().transport, 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_detection() {
        let mut config = config();
        config.ingress.dedup_window = Some(Duration::from_secs(1));
        let (sink, pipeline) = connected_pipeline(&config).await;
        let message = tracking(unix_timestamp());

        assert!(pipeline.process(message.clone()).await.is_dispatched());
        assert_eq!(
            pipeline.process(message).await,
            ProcessingOutcome::Dropped(DropReason::Duplicate)
        );

        assert_eq!(sink.sent_count(), 1);
        assert_eq!(pipeline.monitor().snapshot().current.dropped_duplicate(), 1);
        assert_eq!(pipeline.dedup().map(DedupCache::len), Some(1));
    }

    #[tokio::test]
    async fn test_failed_dispatch_can_be_retried() {
        let mut config = config();
        config.ingress.dedup_window = Some(Duration::from_secs(10));
        let sink = Arc::new(MemorySink::new());
        let pipeline = MessagePipeline::with_sink(&config, sink.clone()).unwrap();
        let message = tracking(unix_timestamp());

        let first = pipeline.process(message.clone()).await;
        assert_eq!(
            first,
            ProcessingOutcome::Failed(FailureCause::Transport(TransportError::NotConnected))
        );
        assert_eq!(pipeline.dedup().map(DedupCache::len), Some(0));

        pipeline.transport().connect().await.unwrap();
        let retry = pipeline.process(message.clone()).await;
        assert!(retry.is_dispatched(), "retry outcome: {:?}", retry);
        assert_eq!(sink.sent_count(), 1);

        // 成功发送后才视为重复
        assert_eq!(
            pipeline.process(message).await,
            ProcessingOutcome::Dropped(DropReason::Duplicate)
        );
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_releases_fingerprint() {
        let mut config = config();
        config.ingress.dedup_window = Some(Duration::from_secs(10));
        let (sink, pipeline) = connected_pipeline(&config).await;
        sink.set_send_delay(Some(Duration::from_millis(40)));
        let message = tracking(unix_timestamp());

        let pending = pipeline.process(message.clone());
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert_eq!(pipeline.dedup().map(DedupCache::len), Some(0));

        sink.set_send_delay(None);
        assert!(pipeline.process(message).await.is_dispatched());
    }

    #[test]
    fn test_dedup_cache_expiry() {
        let cache = DedupCache::new(Duration::from_millis(10), 100);
        let fp = Fingerprint::of(b"payload");
        let t0 = Instant::now();

        assert!(!cache.check_and_insert(fp, t0));
        assert!(cache.check_and_insert(fp, t0 + Duration::from_millis(5)));
        assert!(!cache.check_and_insert(fp, t0 + Duration::from_millis(20)));

        assert_eq!(cache.purge_expired(t0 + Duration::from_millis(100)), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_process_bytes_and_topic_prefix() {
        let mut config = config();
        config.transport.topic_prefix = "vehicle/".to_string();
        let (sink, pipeline) = connected_pipeline(&config).await;

        let raw = format!(
            r#"{{"service": "vcc", "params": {{"vin": "VIN_9", "timestamp": {}, "data": {{"soc": 81}}}}}}"#,
            unix_timestamp()
        );
        assert!(pipeline.process_bytes(raw.as_bytes()).await.is_dispatched());
        assert_eq!(sink.sent()[0].0, "vehicle/vcc");

        let outcome = pipeline.process_bytes(b"{not json").await;
        assert!(matches!(outcome, ProcessingOutcome::Rejected(ValidationError::Malformed(_))));
        assert_eq!(pipeline.monitor().snapshot().current.errors().validation, 1);
    }
}
