use crate::error::{Result, SerializationError, ValidationError, VehicleError};

use blake2::{Blake2s256, Digest};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// 消息负载中的值：标量或同类值组成的嵌套结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    /// 嵌套深度；标量为0
    pub fn depth(&self) -> usize {
        match self {
            PayloadValue::List(items) => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            PayloadValue::Map(fields) => 1 + fields.values().map(Self::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// 包含的子条目数量（不含自身）
    pub fn nested_entries(&self) -> usize {
        match self {
            PayloadValue::List(items) => items.iter().map(|v| 1 + v.nested_entries()).sum(),
            PayloadValue::Map(fields) => fields.values().map(|v| 1 + v.nested_entries()).sum(),
            _ => 0,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::Int(v) => Some(*v as f64),
            PayloadValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn check_finite(&self, path: &str) -> std::result::Result<(), SerializationError> {
        match self {
            PayloadValue::Float(v) if !v.is_finite() => Err(SerializationError::NonFiniteNumber {
                path: path.to_string(),
            }),
            PayloadValue::List(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, v)| v.check_finite(&format!("{}[{}]", path, i))),
            PayloadValue::Map(fields) => fields
                .iter()
                .try_for_each(|(k, v)| v.check_finite(&format!("{}.{}", path, k))),
            _ => Ok(()),
        }
    }
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        PayloadValue::Bool(v)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        PayloadValue::Int(v)
    }
}

impl From<i32> for PayloadValue {
    fn from(v: i32) -> Self {
        PayloadValue::Int(v as i64)
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        PayloadValue::Float(v)
    }
}

impl From<&str> for PayloadValue {
    fn from(v: &str) -> Self {
        PayloadValue::Text(v.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(v: String) -> Self {
        PayloadValue::Text(v)
    }
}

impl From<Vec<PayloadValue>> for PayloadValue {
    fn from(v: Vec<PayloadValue>) -> Self {
        PayloadValue::List(v)
    }
}

impl From<BTreeMap<String, PayloadValue>> for PayloadValue {
    fn from(v: BTreeMap<String, PayloadValue>) -> Self {
        PayloadValue::Map(v)
    }
}

/// 消息优先级，全序：Critical > Normal > Low
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// 背景消息：traj, moving_obj, device
    Low,
    /// 普通消息：vcc, uos_config
    #[default]
    Normal,
    /// 关键消息：tracking, route, error_info, 告警
    Critical,
}

impl MessagePriority {
    /// 按从高到低排列的全部优先级
    pub const ALL: [MessagePriority; 3] = [
        MessagePriority::Critical,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// 计数数组下标
    pub fn index(self) -> usize {
        match self {
            MessagePriority::Critical => 0,
            MessagePriority::Normal => 1,
            MessagePriority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Critical => "critical",
            MessagePriority::Normal => "normal",
            MessagePriority::Low => "low",
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 优先级规则的匹配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Contains,
}

/// message_type 到优先级的单条映射规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRule {
    pub pattern: String,
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
    pub priority: MessagePriority,
}

impl PriorityRule {
    pub fn new(pattern: &str, match_kind: MatchKind, priority: MessagePriority) -> Self {
        Self {
            pattern: pattern.to_string(),
            match_kind,
            priority,
        }
    }

    fn matches(&self, message_type: &str) -> bool {
        match self.match_kind {
            MatchKind::Exact => message_type == self.pattern,
            MatchKind::Contains => message_type.contains(self.pattern.as_str()),
        }
    }
}

/// 有序的优先级规则表，首条命中的规则生效，未命中为 Normal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityRules(Vec<PriorityRule>);

impl Default for PriorityRules {
    fn default() -> Self {
        use MatchKind::*;
        use MessagePriority::*;

        Self(vec![
            PriorityRule::new("alert", Contains, Critical),
            PriorityRule::new("tracking", Exact, Critical),
            PriorityRule::new("route", Exact, Critical),
            PriorityRule::new("error_info", Exact, Critical),
            PriorityRule::new("traj", Exact, Low),
            PriorityRule::new("moving_obj", Exact, Low),
            PriorityRule::new("device", Exact, Low),
            PriorityRule::new("loc_stat", Exact, Low),
        ])
    }
}

impl PriorityRules {
    pub fn new(rules: Vec<PriorityRule>) -> Self {
        Self(rules)
    }

    /// 根据消息类型确定优先级
    pub fn classify(&self, message_type: &str) -> MessagePriority {
        self.0
            .iter()
            .find(|rule| rule.matches(message_type))
            .map(|rule| rule.priority)
            .unwrap_or_default()
    }

    pub fn rules(&self) -> &[PriorityRule] {
        &self.0
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.0.iter().position(|rule| rule.pattern.is_empty()) {
            Some(i) => Err(VehicleError::ConfigError(format!(
                "priority_rules[{}] has an empty pattern",
                i
            ))),
            None => Ok(()),
        }
    }
}

/// 消息指纹：规范化序列化结果的 BLAKE2s-256 摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(canonical: &[u8]) -> Self {
        let digest = Blake2s256::digest(canonical);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 截取前8字节，便于日志与快速比较
    pub fn short(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// 当前时间（Unix 秒）
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// 车辆消息结构
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleMessage {
    /// 消息类型 (tracking, diagnostic, alert, ...)
    pub message_type: String,
    /// 车辆标识（VIN码）
    pub vehicle_id: String,
    /// 生产端时间戳（Unix 秒）
    pub timestamp: f64,
    /// 消息负载
    pub payload: BTreeMap<String, PayloadValue>,
    priority: Option<MessagePriority>,
}

/// 规范化序列化视图，字段顺序固定，映射按键排序
#[derive(Serialize)]
struct CanonicalMessage<'a> {
    message_type: &'a str,
    vehicle_id: &'a str,
    timestamp: f64,
    priority: MessagePriority,
    payload: &'a BTreeMap<String, PayloadValue>,
}

#[derive(Deserialize)]
struct WireMessage {
    message_type: String,
    vehicle_id: String,
    timestamp: f64,
    #[serde(default)]
    payload: BTreeMap<String, PayloadValue>,
    #[serde(default)]
    priority: Option<MessagePriority>,
}

/// 旧版消息格式：{"service": ..., "params": {"vin": ..., "timestamp": ..., ...}}
#[derive(Deserialize)]
struct LegacyEnvelope {
    service: String,
    params: BTreeMap<String, PayloadValue>,
}

impl VehicleMessage {
    /// 创建新的车辆消息
    pub fn new(message_type: impl Into<String>, vehicle_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            message_type: message_type.into(),
            vehicle_id: vehicle_id.into(),
            timestamp,
            payload: BTreeMap::new(),
            priority: None,
        }
    }

    /// 添加负载字段
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn insert_field(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PayloadValue>,
    ) -> Option<PayloadValue> {
        self.payload.insert(key.into(), value.into())
    }

    /// 显式指定优先级
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn set_priority(&mut self, priority: MessagePriority) {
        self.priority = Some(priority);
    }

    /// 生效的优先级；未指定时为 Normal
    pub fn priority(&self) -> MessagePriority {
        self.priority.unwrap_or_default()
    }

    pub fn has_explicit_priority(&self) -> bool {
        self.priority.is_some()
    }

    /// 未显式指定优先级时按规则推导
    pub fn classify(&mut self, rules: &PriorityRules) -> MessagePriority {
        if self.priority.is_none() {
            self.priority = Some(rules.classify(&self.message_type));
        }
        self.priority()
    }

    /// 负载条目总数（含嵌套）
    pub fn payload_entries(&self) -> usize {
        self.payload.values().map(|v| 1 + v.nested_entries()).sum()
    }

    /// 负载嵌套深度；顶层映射计为1
    pub fn payload_depth(&self) -> usize {
        1 + self.payload.values().map(PayloadValue::depth).max().unwrap_or(0)
    }

    /// 规范化序列化：相同逻辑消息总是得到相同字节
    pub fn to_canonical_bytes(&self) -> std::result::Result<Bytes, SerializationError> {
        if !self.timestamp.is_finite() {
            return Err(SerializationError::NonFiniteNumber {
                path: "timestamp".to_string(),
            });
        }
        for (key, value) in &self.payload {
            value.check_finite(&format!("payload.{}", key))?;
        }

        let canonical = CanonicalMessage {
            message_type: &self.message_type,
            vehicle_id: &self.vehicle_id,
            timestamp: self.timestamp,
            priority: self.priority(),
            payload: &self.payload,
        };

        serde_json::to_vec(&canonical)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Encode(e.to_string()))
    }

    /// 获取消息指纹（用于去重与诊断）
    ///
    /// 规范形式包含优先级；未分类的消息按默认 Normal 计算。
    /// 需要与流水线上报的指纹一致时使用 [`VehicleMessage::fingerprint_with`]。
    pub fn fingerprint(&self) -> std::result::Result<Fingerprint, SerializationError> {
        self.to_canonical_bytes().map(|bytes| Fingerprint::of(&bytes))
    }

    /// 按给定规则分类后的指纹，与流水线发送的负载一致
    pub fn fingerprint_with(
        &self,
        rules: &PriorityRules,
    ) -> std::result::Result<Fingerprint, SerializationError> {
        if self.priority.is_some() {
            return self.fingerprint();
        }
        let mut classified = self.clone();
        classified.classify(rules);
        classified.fingerprint()
    }

    /// 从字节流解析消息，支持规范格式与旧版 service/params 格式
    pub fn from_slice(raw: &[u8]) -> std::result::Result<Self, ValidationError> {
        let wire_err = match serde_json::from_slice::<WireMessage>(raw) {
            Ok(wire) => {
                return Ok(Self {
                    message_type: wire.message_type,
                    vehicle_id: wire.vehicle_id,
                    timestamp: wire.timestamp,
                    payload: wire.payload,
                    priority: wire.priority,
                })
            }
            Err(e) => e,
        };

        match serde_json::from_slice::<LegacyEnvelope>(raw) {
            Ok(legacy) => Self::from_legacy(legacy),
            Err(_) => Err(ValidationError::Malformed(wire_err.to_string())),
        }
    }

    fn from_legacy(legacy: LegacyEnvelope) -> std::result::Result<Self, ValidationError> {
        let mut params = legacy.params;

        let vehicle_id = match params.remove("vin") {
            Some(PayloadValue::Text(vin)) => vin,
            Some(_) => return Err(ValidationError::Malformed("params.vin is not a string".into())),
            None => return Err(ValidationError::Malformed("missing params.vin".into())),
        };
        let timestamp = match params.remove("timestamp") {
            Some(value) => value
                .as_f64()
                .ok_or_else(|| ValidationError::Malformed("params.timestamp is not a number".into()))?,
            None => return Err(ValidationError::Malformed("missing params.timestamp".into())),
        };

        Ok(Self {
            message_type: legacy.service,
            vehicle_id,
            timestamp,
            payload: params,
            priority: None,
        })
    }
}

/// 消息被丢弃的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// 采样丢弃
    Sampling,
    /// 优先级规则丢弃（入口队列已满）
    Priority,
    /// 去重窗口内的重复消息
    Duplicate,
    /// 校验、序列化、发送失败或取消
    Error(ErrorKind),
}

/// 错误丢弃发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Serialization,
    Transport,
    Cancelled,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Sampling => "sampling",
            DropReason::Priority => "priority",
            DropReason::Duplicate => "duplicate",
            DropReason::Error(ErrorKind::Validation) => "validation_error",
            DropReason::Error(ErrorKind::Serialization) => "serialization_error",
            DropReason::Error(ErrorKind::Transport) => "transport_error",
            DropReason::Error(ErrorKind::Cancelled) => "cancelled",
        }
    }
}

/// dropped_error 按阶段的细分
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    pub validation: u64,
    pub serialization: u64,
    pub transport: u64,
    pub cancelled: u64,
}

impl ErrorCounters {
    fn merge(&mut self, other: &ErrorCounters) {
        self.validation += other.validation;
        self.serialization += other.serialization;
        self.transport += other.transport;
        self.cancelled += other.cancelled;
    }
}

/// 单个优先级的计数器
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityCounters {
    pub received: u64,
    pub processed: u64,
    pub dropped_sampling: u64,
    pub dropped_priority: u64,
    pub dropped_duplicate: u64,
    pub dropped_error: u64,
    pub errors: ErrorCounters,
}

impl PriorityCounters {
    /// 各原因丢弃数之和
    pub fn dropped(&self) -> u64 {
        self.dropped_sampling + self.dropped_priority + self.dropped_duplicate + self.dropped_error
    }

    fn merge(&mut self, other: &PriorityCounters) {
        self.received += other.received;
        self.processed += other.processed;
        self.dropped_sampling += other.dropped_sampling;
        self.dropped_priority += other.dropped_priority;
        self.dropped_duplicate += other.dropped_duplicate;
        self.dropped_error += other.dropped_error;
        self.errors.merge(&other.errors);
    }
}

/// 延迟累加器：次数、总和、最大值
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
}

impl LatencyStats {
    fn record(&mut self, latency: Duration) {
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.count += 1;
        self.total_ns = self.total_ns.saturating_add(ns);
        self.max_ns = self.max_ns.max(ns);
    }

    fn merge(&mut self, other: &LatencyStats) {
        self.count += other.count;
        self.total_ns = self.total_ns.saturating_add(other.total_ns);
        self.max_ns = self.max_ns.max(other.max_ns);
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_ns / self.count)
        }
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns)
    }
}

/// 一个窗口内按优先级划分的计数与延迟
///
/// 每次记录都对应一条消息的最终结果，并同时增加 `received`，
/// 因此窗口内始终满足 received = processed + dropped。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsCounters {
    pub by_priority: [PriorityCounters; 3],
    pub latency: LatencyStats,
}

impl StatsCounters {
    pub fn record_processed(&mut self, priority: MessagePriority, latency: Duration) {
        let counters = &mut self.by_priority[priority.index()];
        counters.received += 1;
        counters.processed += 1;
        self.latency.record(latency);
    }

    pub fn record_dropped(&mut self, reason: DropReason, priority: MessagePriority) {
        let counters = &mut self.by_priority[priority.index()];
        counters.received += 1;
        match reason {
            DropReason::Sampling => counters.dropped_sampling += 1,
            DropReason::Priority => counters.dropped_priority += 1,
            DropReason::Duplicate => counters.dropped_duplicate += 1,
            DropReason::Error(kind) => {
                counters.dropped_error += 1;
                match kind {
                    ErrorKind::Validation => counters.errors.validation += 1,
                    ErrorKind::Serialization => counters.errors.serialization += 1,
                    ErrorKind::Transport => counters.errors.transport += 1,
                    ErrorKind::Cancelled => counters.errors.cancelled += 1,
                }
            }
        }
    }

    pub fn merge(&mut self, other: &StatsCounters) {
        for (mine, theirs) in self.by_priority.iter_mut().zip(other.by_priority.iter()) {
            mine.merge(theirs);
        }
        self.latency.merge(&other.latency);
    }

    pub fn priority(&self, priority: MessagePriority) -> &PriorityCounters {
        &self.by_priority[priority.index()]
    }

    /// 所有优先级的合计
    pub fn total(&self) -> PriorityCounters {
        let mut total = PriorityCounters::default();
        for counters in &self.by_priority {
            total.merge(counters);
        }
        total
    }
}

/// 处理统计信息（一个统计窗口）
#[derive(Debug, Clone)]
pub struct ProcessingStats {
    pub counters: StatsCounters,
    /// 窗口开始时间
    pub started_at: Instant,
    /// 窗口持续时间（当前窗口为已经过的时间）
    pub elapsed: Duration,
}

impl ProcessingStats {
    pub fn new(counters: StatsCounters, started_at: Instant, elapsed: Duration) -> Self {
        Self {
            counters,
            started_at,
            elapsed,
        }
    }

    pub fn received(&self) -> u64 {
        self.counters.total().received
    }

    pub fn processed(&self) -> u64 {
        self.counters.total().processed
    }

    pub fn dropped_sampling(&self) -> u64 {
        self.counters.total().dropped_sampling
    }

    pub fn dropped_priority(&self) -> u64 {
        self.counters.total().dropped_priority
    }

    pub fn dropped_duplicate(&self) -> u64 {
        self.counters.total().dropped_duplicate
    }

    pub fn dropped_error(&self) -> u64 {
        self.counters.total().dropped_error
    }

    pub fn dropped(&self) -> u64 {
        self.counters.total().dropped()
    }

    /// dropped_error 的阶段细分
    pub fn errors(&self) -> ErrorCounters {
        self.counters.total().errors
    }

    pub fn for_priority(&self, priority: MessagePriority) -> PriorityCounters {
        *self.counters.priority(priority)
    }

    /// 获取丢弃率
    pub fn drop_rate(&self) -> f64 {
        let total = self.counters.total();
        if total.received > 0 {
            total.dropped() as f64 / total.received as f64
        } else {
            0.0
        }
    }

    pub fn mean_latency(&self) -> Duration {
        self.counters.latency.mean()
    }

    pub fn max_latency(&self) -> Duration {
        self.counters.latency.max()
    }

    /// 获取处理速率（消息/秒）
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed() as f64 / secs
        } else {
            0.0
        }
    }
}
